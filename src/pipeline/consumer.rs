//! Snapshot and multipart stream consumers

use std::sync::Arc;
use std::thread;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::controller::PipelineController;
use crate::capture::decoder::JpegView;
use crate::error::{PipelineError, Result};

/// Multipart boundary announced in the stream's content type
pub const STREAM_BOUNDARY: &str = "frame";

pub fn stream_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={STREAM_BOUNDARY}")
}

/// Grab the newest frame and return it as JPEG.
///
/// The frame goes back to the pool before this returns, on every path.
pub fn snapshot(pipeline: &PipelineController) -> Result<JpegView> {
    if !pipeline.is_started() {
        return Err(PipelineError::NotStarted);
    }
    if pipeline.is_streaming() {
        return Err(PipelineError::StreamingConflict);
    }

    let queue = pipeline.queue();
    let wait = pipeline.config().snapshot_wait();
    let frame = queue
        .pop_latest()
        .or_else(|| queue.pop_blocking(wait))
        .ok_or(PipelineError::CaptureTimeout(wait.as_millis() as u64))?;

    if frame.is_empty() {
        return Err(PipelineError::CaptureBufferInvalid);
    }

    let jpeg = pipeline.normalizer().normalize(&frame)?;
    debug!(
        sequence = frame.meta.sequence,
        len = jpeg.len(),
        transcoded = jpeg.is_transcoded(),
        "Snapshot captured"
    );
    frame.release();
    Ok(jpeg)
}

/// Where stream parts are written.
pub trait FrameSink {
    /// False once the client has gone away.
    fn is_connected(&self) -> bool;

    /// Write one part. An error means the client has disconnected.
    fn send(&mut self, part: Bytes) -> std::result::Result<(), SinkClosed>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

impl FrameSink for flume::Sender<Bytes> {
    fn is_connected(&self) -> bool {
        !self.is_disconnected()
    }

    fn send(&mut self, part: Bytes) -> std::result::Result<(), SinkClosed> {
        flume::Sender::send(self, part).map_err(|_| SinkClosed)
    }
}

/// One multipart part: header with length, JPEG bytes, trailing separator.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{STREAM_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Why a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    ClientDisconnected,
    PipelineStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames_sent: u64,
    pub frames_skipped: u64,
    pub end: StreamEnd,
}

/// A running multipart stream. Holds the streaming flag from `open` until
/// it is dropped.
pub struct StreamConsumer {
    pipeline: Arc<PipelineController>,
}

impl StreamConsumer {
    /// Check preconditions and claim the streaming flag.
    pub fn open(pipeline: Arc<PipelineController>) -> Result<Self> {
        if !pipeline.is_started() {
            return Err(PipelineError::NotStarted);
        }
        if !pipeline.try_begin_stream() {
            return Err(PipelineError::StreamingConflict);
        }
        info!("Stream opened");
        Ok(Self { pipeline })
    }

    /// Push frames into `sink` until the client disconnects or the pipeline
    /// leaves `Started`.
    pub fn run<S: FrameSink>(self, sink: &mut S) -> StreamSummary {
        let config = self.pipeline.config();
        let (poll, pace) = (config.stream_poll(), config.stream_frame_interval());
        let queue = self.pipeline.queue();
        let mut frames_sent = 0;
        let mut frames_skipped = 0;

        let end = loop {
            if !sink.is_connected() {
                break StreamEnd::ClientDisconnected;
            }
            if !self.pipeline.is_started() {
                break StreamEnd::PipelineStopped;
            }

            let Some(frame) = queue.pop_latest() else {
                thread::sleep(poll);
                continue;
            };
            if frame.is_empty() {
                warn!(sequence = frame.meta.sequence, "Skipping empty frame");
                frames_skipped += 1;
                continue;
            }

            let jpeg = match self.pipeline.normalizer().normalize(&frame) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    warn!(sequence = frame.meta.sequence, "Skipping frame: {}", e);
                    frames_skipped += 1;
                    continue;
                }
            };
            frame.release();

            if sink.send(multipart_part(jpeg.as_bytes())).is_err() {
                break StreamEnd::ClientDisconnected;
            }
            frames_sent += 1;
            thread::sleep(pace);
        };

        info!(frames_sent, frames_skipped, ?end, "Stream closed");
        StreamSummary {
            frames_sent,
            frames_skipped,
            end,
        }
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.pipeline.end_stream();
    }
}
