mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use campipe::capture::decoder::is_jpeg;
use campipe::capture::frame::{FrameSize, PixelFormat};
use campipe::capture::synthetic::SyntheticMode;
use campipe::pipeline::consumer::{snapshot, FrameSink, SinkClosed, StreamConsumer, StreamEnd};
use campipe::settings::{SettingsPatch, SettingsStore, NAMESPACE};
use campipe::{PipelineError, PipelineState};

use common::*;

/// Sink that accepts `limit` parts, then reports the client as gone
struct LimitedSink {
    parts: Vec<Bytes>,
    limit: usize,
}

impl FrameSink for LimitedSink {
    fn is_connected(&self) -> bool {
        self.parts.len() < self.limit
    }

    fn send(&mut self, part: Bytes) -> Result<(), SinkClosed> {
        self.parts.push(part);
        Ok(())
    }
}

#[test]
fn snapshot_passes_jpeg_through_untouched() {
    let source = jpeg_bytes();
    let h = harness(
        SyntheticMode::Fixed(source.clone(), PixelFormat::Jpeg),
        FrameSize::Qvga,
    );
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();

    let jpeg = snapshot(&h.pipeline).unwrap();
    assert!(!jpeg.is_transcoded());
    assert_eq!(jpeg.as_bytes(), &source[..]);
    assert_eq!(h.pipeline.normalizer().transcoded_count(), 0);
}

#[test]
fn snapshot_transcodes_raw_frames_and_releases_buffers() {
    let source = rgb565_bytes(FrameSize::P96x96);
    let h = harness(
        SyntheticMode::Fixed(source.clone(), PixelFormat::Rgb565),
        FrameSize::P96x96,
    );
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();

    let jpeg = snapshot(&h.pipeline).unwrap();
    assert!(jpeg.is_transcoded());
    assert!(is_jpeg(jpeg.as_bytes()));
    assert_ne!(jpeg.as_bytes(), &source[..]);
    assert!(h.pipeline.normalizer().transcoded_count() >= 1);
    drop(jpeg);

    h.pipeline.stop().unwrap();
    let buffers = h.pipeline.status().stats.buffers;
    assert_eq!(buffers.outstanding, 0);
    assert_eq!(buffers.acquired, buffers.released);
}

#[test]
fn snapshot_before_start_touches_no_hardware() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qvga);

    let err = snapshot(&h.pipeline).unwrap_err();
    assert!(matches!(err, PipelineError::NotStarted));
    assert_eq!(h.controls.hardware_calls(), 0);
    assert_eq!(h.pipeline.state(), PipelineState::Uninitialized);
}

#[test]
fn snapshot_times_out_when_sensor_starves() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();
    h.controls.starve.store(true, Ordering::SeqCst);
    // Let an in-flight grab land before emptying the queue
    thread::sleep(Duration::from_millis(20));
    h.pipeline.queue().drain();
    let idle_buffers = h.pipeline.status().stats.buffers;

    let err = snapshot(&h.pipeline).unwrap_err();
    assert!(matches!(err, PipelineError::CaptureTimeout(_)));
    // Empty polls are not frames
    let buffers = h.pipeline.status().stats.buffers;
    assert_eq!(buffers.acquired, idle_buffers.acquired);
    assert_eq!(buffers.released, idle_buffers.released);
    // Degraded but alive
    assert_eq!(h.pipeline.state(), PipelineState::Started);

    h.controls.starve.store(false, Ordering::SeqCst);
    assert!(snapshot(&h.pipeline).is_ok());
}

#[test]
fn empty_frames_are_rejected_as_invalid() {
    let h = harness(
        SyntheticMode::Fixed(Bytes::new(), PixelFormat::Jpeg),
        FrameSize::Qqvga,
    );
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();

    let err = snapshot(&h.pipeline).unwrap_err();
    assert!(matches!(err, PipelineError::CaptureBufferInvalid));
}

#[test]
fn streaming_excludes_snapshots_and_second_streams() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();

    let session = StreamConsumer::open(h.pipeline.clone()).unwrap();
    assert!(h.pipeline.is_streaming());

    assert!(matches!(
        snapshot(&h.pipeline),
        Err(PipelineError::StreamingConflict)
    ));
    assert!(matches!(
        StreamConsumer::open(h.pipeline.clone()),
        Err(PipelineError::StreamingConflict)
    ));

    let mut sink = LimitedSink {
        parts: Vec::new(),
        limit: 3,
    };
    let summary = session.run(&mut sink);
    assert_eq!(summary.frames_sent, 3);
    assert_eq!(summary.end, StreamEnd::ClientDisconnected);
    assert!(!h.pipeline.is_streaming());

    assert!(snapshot(&h.pipeline).is_ok());
}

#[test]
fn stream_parts_are_multipart_framed() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();

    let mut sink = LimitedSink {
        parts: Vec::new(),
        limit: 2,
    };
    StreamConsumer::open(h.pipeline.clone())
        .unwrap()
        .run(&mut sink);

    for part in &sink.parts {
        let text = String::from_utf8_lossy(part);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: "));
        let header_end = part.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let len: usize = text["--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ".len()..]
            .split("\r\n")
            .next()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(part.len(), header_end + len + 2);
        assert!(is_jpeg(&part[header_end..]));
        assert!(part.ends_with(b"\r\n"));
    }
}

#[test]
fn stream_ends_when_pipeline_stops() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();

    let session = StreamConsumer::open(h.pipeline.clone()).unwrap();
    let streamer = thread::spawn(move || {
        let mut sink = LimitedSink {
            parts: Vec::new(),
            limit: usize::MAX,
        };
        session.run(&mut sink)
    });

    thread::sleep(Duration::from_millis(50));
    h.pipeline.stop().unwrap();

    let summary = streamer.join().unwrap();
    assert_eq!(summary.end, StreamEnd::PipelineStopped);
    assert!(!h.pipeline.is_streaming());
}

#[test]
fn stream_skips_frames_that_fail_conversion() {
    let h = harness_with(
        raw_mode(),
        FrameSize::P96x96,
        Arc::new(FlakyTranscoder::default()),
    );
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();

    let mut sink = LimitedSink {
        parts: Vec::new(),
        limit: 3,
    };
    let summary = StreamConsumer::open(h.pipeline.clone())
        .unwrap()
        .run(&mut sink);
    assert_eq!(summary.frames_sent, 3);
    assert!(summary.frames_skipped >= 1);
}

#[test]
fn lifecycle_transitions() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    assert!(matches!(h.pipeline.start(), Err(PipelineError::NotInitialized)));
    assert!(matches!(h.pipeline.stop(), Err(PipelineError::NotStarted)));

    h.pipeline.init().unwrap();
    assert_eq!(h.pipeline.state(), PipelineState::Initialized);
    assert!(matches!(snapshot(&h.pipeline), Err(PipelineError::NotStarted)));

    h.pipeline.start().unwrap();
    assert_eq!(h.pipeline.state(), PipelineState::Started);
    h.pipeline.start().unwrap();

    h.pipeline.stop().unwrap();
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
    assert!(h.pipeline.queue().is_empty());
    assert!(matches!(snapshot(&h.pipeline), Err(PipelineError::NotStarted)));

    h.pipeline.start().unwrap();
    assert!(snapshot(&h.pipeline).is_ok());
}

#[test]
fn init_failure_is_reported() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    h.controls.fail_init.store(true, Ordering::SeqCst);

    assert!(h.pipeline.init().is_err());
    assert_eq!(h.pipeline.state(), PipelineState::InitFailed);
    assert!(!h.pipeline.status().initialized);
    assert!(matches!(h.pipeline.start(), Err(PipelineError::NotInitialized)));
}

#[test]
fn reinitialize_to_active_size_is_a_noop() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();

    h.pipeline.reinitialize(FrameSize::Qqvga).unwrap();
    assert_eq!(count(&h.controls.deinit_calls), 0);
    assert_eq!(count(&h.controls.init_calls), 1);
    assert_eq!(h.pipeline.state(), PipelineState::Started);
}

#[test]
fn reinitialize_rebuilds_at_new_size() {
    let h = harness(raw_mode(), FrameSize::Qqvga);
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();
    let emitted_before = count(&h.controls.frames_emitted);

    h.pipeline.reinitialize(FrameSize::Qvga).unwrap();
    assert_eq!(count(&h.controls.deinit_calls), 1);
    assert_eq!(count(&h.controls.init_calls), 2);
    assert!(count(&h.controls.probe_calls) >= 2);
    // Settling frames were pulled and thrown away
    assert!(count(&h.controls.frames_emitted) >= emitted_before + 3);

    assert_eq!(h.pipeline.state(), PipelineState::Started);
    assert_eq!(h.pipeline.settings().framesize, FrameSize::Qvga);
    assert_eq!(h.pipeline.status().active_framesize, Some(FrameSize::Qvga));
    assert_eq!(h.store.get(NAMESPACE, "framesize").unwrap(), Some(5));

    let jpeg = snapshot(&h.pipeline).unwrap();
    let decoded = image::load_from_memory(jpeg.as_bytes()).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (320, 240));
}

#[test]
fn failed_reinitialize_leaves_init_failed() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();

    h.controls.fail_probe.store(true, Ordering::SeqCst);
    let err = h.pipeline.reinitialize(FrameSize::Qvga).unwrap_err();
    assert!(matches!(err, PipelineError::ReinitFailed(_)));

    let status = h.pipeline.status();
    assert_eq!(status.status, PipelineState::InitFailed);
    assert!(!status.initialized);
    assert_eq!(status.active_framesize, None);

    let grabs = count(&h.controls.grab_calls);
    assert!(matches!(snapshot(&h.pipeline), Err(PipelineError::NotStarted)));
    assert!(matches!(
        StreamConsumer::open(h.pipeline.clone()),
        Err(PipelineError::NotStarted)
    ));
    assert!(matches!(
        h.pipeline.reinitialize(FrameSize::Vga),
        Err(PipelineError::NotInitialized)
    ));
    assert_eq!(count(&h.controls.grab_calls), grabs);

    // Only a fresh init recovers
    h.controls.fail_probe.store(false, Ordering::SeqCst);
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();
    assert!(snapshot(&h.pipeline).is_ok());
}

#[test]
fn reinitialize_init_failure_leaves_init_failed() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();

    h.controls.fail_init.store(true, Ordering::SeqCst);
    let err = h.pipeline.reinitialize(FrameSize::Qvga).unwrap_err();
    assert!(matches!(err, PipelineError::ReinitFailed(_)));
    // Torn down, then the bring-up failed
    assert_eq!(count(&h.controls.deinit_calls), 1);
    assert_eq!(count(&h.controls.init_calls), 2);

    let status = h.pipeline.status();
    assert_eq!(status.status, PipelineState::InitFailed);
    assert!(!status.initialized);
    assert_eq!(status.active_framesize, None);
    assert!(h.pipeline.queue().is_empty());

    let grabs = count(&h.controls.grab_calls);
    assert!(matches!(snapshot(&h.pipeline), Err(PipelineError::NotStarted)));
    assert!(matches!(h.pipeline.start(), Err(PipelineError::NotInitialized)));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(count(&h.controls.grab_calls), grabs);

    let buffers = h.pipeline.status().stats.buffers;
    assert_eq!(buffers.outstanding, 0);
    assert_eq!(buffers.acquired, buffers.released);
}

#[test]
fn framesize_setting_applies_on_next_start() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    h.pipeline.init().unwrap();
    h.pipeline.start().unwrap();

    let patch = SettingsPatch {
        framesize: Some(campipe::capture::frame::FrameSizeRepr::Name("QVGA".into())),
        quality: Some(20),
        ..Default::default()
    };
    let updated = h.pipeline.update_settings(patch).unwrap();
    assert_eq!(updated.framesize, FrameSize::Qvga);
    assert_eq!(updated.quality, 20);
    // Persisted, applied live, but no teardown yet
    assert_eq!(h.store.get(NAMESPACE, "quality").unwrap(), Some(20));
    assert_eq!(count(&h.controls.deinit_calls), 0);
    assert!(count(&h.controls.apply_calls) >= 2);
    // Hardware keeps running the old size until restarted
    let status = h.pipeline.status();
    assert_eq!(status.settings.framesize, FrameSize::Qvga);
    assert_eq!(status.active_framesize, Some(FrameSize::Qqvga));

    h.pipeline.stop().unwrap();
    h.pipeline.start().unwrap();
    assert_eq!(count(&h.controls.deinit_calls), 1);
    assert_eq!(h.pipeline.settings().framesize, FrameSize::Qvga);
    assert_eq!(h.pipeline.status().active_framesize, Some(FrameSize::Qvga));
}

#[test]
fn out_of_range_settings_are_rejected_without_side_effects() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    let before = h.pipeline.settings();

    let patch = SettingsPatch {
        quality: Some(10),
        saturation: Some(5),
        ..Default::default()
    };
    let err = h.pipeline.update_settings(patch).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::SettingOutOfRange { field: "saturation", .. }
    ));
    assert_eq!(h.pipeline.settings(), before);
    assert_eq!(h.store.get(NAMESPACE, "quality").unwrap(), None);
}

#[test]
fn persisted_settings_are_loaded_on_init() {
    let h = harness(SyntheticMode::Jpeg, FrameSize::Qqvga);
    h.store.set(NAMESPACE, "framesize", 8).unwrap();
    h.store.set(NAMESPACE, "brightness", -2).unwrap();

    h.pipeline.init().unwrap();
    let settings = h.pipeline.settings();
    assert_eq!(settings.framesize, FrameSize::Vga);
    assert_eq!(settings.brightness, -2);
}

/// xorshift, enough to shuffle operations deterministically
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn every_acquired_buffer_is_released_exactly_once() {
    for seed in [0x9E37_79B9_7F4A_7C15u64, 42, 7_777_777] {
        let h = harness_with(
            raw_mode(),
            FrameSize::P96x96,
            Arc::new(FlakyTranscoder::default()),
        );
        let p = &h.pipeline;
        p.init().unwrap();
        p.start().unwrap();

        let mut rng = Rng(seed);
        let sizes = [FrameSize::P96x96, FrameSize::Qqvga, FrameSize::Qcif];
        for _ in 0..40 {
            match rng.next() % 6 {
                0 | 1 => {
                    // Conversion failures included
                    let _ = snapshot(p);
                }
                2 => {
                    let held = p.queue().pop_latest();
                    thread::sleep(Duration::from_millis(2));
                    drop(held);
                }
                3 => {
                    let _ = p.stop();
                    let _ = p.start();
                }
                4 => {
                    let size = sizes[(rng.next() % sizes.len() as u64) as usize];
                    p.reinitialize(size).unwrap();
                }
                _ => {
                    if let Ok(session) = StreamConsumer::open(p.clone()) {
                        let mut sink = LimitedSink {
                            parts: Vec::new(),
                            limit: 2,
                        };
                        session.run(&mut sink);
                    }
                }
            }
        }

        p.stop().unwrap();
        let buffers = p.status().stats.buffers;
        assert_eq!(buffers.outstanding, 0, "seed {seed}");
        assert_eq!(buffers.acquired, buffers.released, "seed {seed}");
        assert!(buffers.acquired > 0);
    }
}
