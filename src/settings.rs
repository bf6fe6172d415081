//! Image settings and their persistence in a namespaced key/value store

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capture::frame::{FrameSize, FrameSizeRepr};
use crate::error::PipelineError;

/// Key/value domain the camera settings live under
pub const NAMESPACE: &str = "camera";

pub const QUALITY_RANGE: (i64, i64) = (0, 63);
pub const LEVEL_RANGE: (i64, i64) = (-2, 2);

/// Current capture settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSettings {
    pub framesize: FrameSize,
    /// JPEG quality, 0 (best) to 63 (worst)
    pub quality: u8,
    pub brightness: i8,
    pub contrast: i8,
    pub saturation: i8,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            framesize: FrameSize::Vga,
            quality: 12,
            brightness: 0,
            contrast: 0,
            saturation: 0,
        }
    }
}

/// Client-supplied partial update. Fields are kept loose so range errors
/// can be reported per field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub framesize: Option<FrameSizeRepr>,
    pub quality: Option<i64>,
    pub brightness: Option<i64>,
    pub contrast: Option<i64>,
    pub saturation: Option<i64>,
}

fn check_range(field: &'static str, value: i64, (lo, hi): (i64, i64)) -> Result<i64, PipelineError> {
    if (lo..=hi).contains(&value) {
        Ok(value)
    } else {
        Err(PipelineError::out_of_range(
            field,
            format!("{value} is outside {lo}..={hi}"),
        ))
    }
}

pub fn parse_framesize(repr: FrameSizeRepr) -> Result<FrameSize, PipelineError> {
    FrameSize::try_from(repr).map_err(|reason| PipelineError::out_of_range("framesize", reason))
}

impl CameraSettings {
    /// Apply a patch, rejecting the whole update if any field is out of range.
    pub fn merged(&self, patch: SettingsPatch) -> Result<Self, PipelineError> {
        let mut next = *self;
        if let Some(repr) = patch.framesize {
            next.framesize = parse_framesize(repr)?;
        }
        if let Some(q) = patch.quality {
            next.quality = check_range("quality", q, QUALITY_RANGE)? as u8;
        }
        if let Some(b) = patch.brightness {
            next.brightness = check_range("brightness", b, LEVEL_RANGE)? as i8;
        }
        if let Some(c) = patch.contrast {
            next.contrast = check_range("contrast", c, LEVEL_RANGE)? as i8;
        }
        if let Some(s) = patch.saturation {
            next.saturation = check_range("saturation", s, LEVEL_RANGE)? as i8;
        }
        Ok(next)
    }

    /// Load persisted values over `base`. Persisted values that are out of
    /// range are ignored.
    pub fn load(store: &dyn SettingsStore, base: CameraSettings) -> Result<Self, StoreError> {
        let mut patch = SettingsPatch::default();
        if let Some(v) = store.get(NAMESPACE, "framesize")? {
            patch.framesize = Some(FrameSizeRepr::Index(v));
        }
        patch.quality = store.get(NAMESPACE, "quality")?;
        patch.brightness = store.get(NAMESPACE, "brightness")?;
        patch.contrast = store.get(NAMESPACE, "contrast")?;
        patch.saturation = store.get(NAMESPACE, "saturation")?;

        match base.merged(patch) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!("Ignoring persisted camera settings: {}", e);
                Ok(base)
            }
        }
    }

    pub fn save(&self, store: &dyn SettingsStore) -> Result<(), StoreError> {
        store.set(NAMESPACE, "framesize", self.framesize.index() as i64)?;
        store.set(NAMESPACE, "quality", self.quality as i64)?;
        store.set(NAMESPACE, "brightness", self.brightness as i64)?;
        store.set(NAMESPACE, "contrast", self.contrast as i64)?;
        store.set(NAMESPACE, "saturation", self.saturation as i64)?;
        debug!(settings = ?self, "Camera settings persisted");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("settings file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("settings file {} is not valid JSON: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Namespaced key/value persistence
pub trait SettingsStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<i64>, StoreError>;
    fn set(&self, namespace: &str, key: &str, value: i64) -> Result<(), StoreError>;
}

/// Volatile store, used when no settings file is configured and in tests
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<(String, String), i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<i64>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(&(namespace.to_owned(), key.to_owned())).copied())
    }

    fn set(&self, namespace: &str, key: &str, value: i64) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert((namespace.to_owned(), key.to_owned()), value);
        Ok(())
    }
}

type Namespaces = BTreeMap<String, BTreeMap<String, i64>>;

/// Store backed by a single JSON file, rewritten on every `set`
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<Namespaces>,
}

impl JsonFileStore {
    /// Open the store, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|source| StoreError::Json {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Namespaces::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &Namespaces) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let raw = serde_json::to_vec_pretty(values).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<i64>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(namespace).and_then(|ns| ns.get(key)).copied())
    }

    fn set(&self, namespace: &str, key: &str, value: i64) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values
            .entry(namespace.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
        self.flush(&values)
    }
}
