//! # Worker Protocol Codec
//!
//! `tokio_util` codec for the worker pipe.
//!
//! Encoding writes a request as a single logical unit: the JSON header line,
//! the terminating `\n`, then the raw frame bytes. Decoding buffers partial
//! output until a newline completes a line. Lines that are not valid result
//! JSON are logged and skipped; they never surface as stream errors, so one
//! bad line cannot tear down the reader.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::vision::detection::DetectionBox;

/// Longest worker output line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Worker pipe I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode request header: {0}")]
    Header(#[from] serde_json::Error),
}

/// One frame bound for the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    pub session_id: String,
    pub frame: Bytes,
}

// `clientId` repeats the session id for workers that still read that key.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestHeader<'a> {
    session_id: &'a str,
    client_id: &'a str,
    len: usize,
}

/// One decoded worker output line.
///
/// `boxes` is kept exactly as the worker sent it so it can be forwarded to
/// the browser untouched; [`WorkerResult::detections`] gives the typed view.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    pub boxes: Vec<serde_json::Value>,
}

impl WorkerResult {
    pub fn new(session_id: impl Into<String>, boxes: Vec<serde_json::Value>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            client_id: None,
            boxes,
        }
    }

    /// The session this result answers, under either spelling. `None` when
    /// the worker could not tell (it echoes `null` on internal errors).
    pub fn session(&self) -> Option<&str> {
        self.session_id.as_deref().or(self.client_id.as_deref())
    }

    /// Boxes parsed for overlap checks. Entries that do not parse are
    /// skipped; they are still forwarded raw.
    pub fn detections(&self) -> Vec<DetectionBox> {
        self.boxes
            .iter()
            .filter_map(|raw| match DetectionBox::deserialize(raw) {
                Ok(b) => Some(b),
                Err(e) => {
                    log::debug!("Skipping unreadable box {}: {}", raw, e);
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct WorkerCodec {
    max_line_bytes: usize,
    // Bytes of `src` already searched for a newline.
    scanned: usize,
}

impl WorkerCodec {
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            scanned: 0,
        }
    }
}

impl Default for WorkerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<WorkerRequest> for WorkerCodec {
    type Error = CodecError;

    fn encode(&mut self, request: WorkerRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = serde_json::to_vec(&RequestHeader {
            session_id: &request.session_id,
            client_id: &request.session_id,
            len: request.frame.len(),
        })?;
        dst.reserve(header.len() + 1 + request.frame.len());
        dst.put_slice(&header);
        dst.put_u8(b'\n');
        dst.put_slice(&request.frame);
        Ok(())
    }
}

impl Decoder for WorkerCodec {
    type Item = WorkerResult;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_line_bytes {
                    log::warn!(
                        "Discarding {} bytes of worker output without a newline",
                        src.len()
                    );
                    src.clear();
                    self.scanned = 0;
                } else {
                    self.scanned = src.len();
                }
                return Ok(None);
            };

            let line = src.split_to(self.scanned + offset + 1);
            self.scanned = 0;
            let text = line[..line.len() - 1].trim_ascii();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_slice::<WorkerResult>(text) {
                Ok(result) => return Ok(Some(result)),
                Err(e) => {
                    log::warn!(
                        "Bad JSON from worker ({} bytes): {}: {}",
                        text.len(),
                        e,
                        String::from_utf8_lossy(&text[..text.len().min(200)])
                    );
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(result) => Ok(Some(result)),
            None => {
                if !src.is_empty() {
                    log::warn!("Worker output ended with {} bytes of unterminated line", src.len());
                    src.clear();
                    self.scanned = 0;
                }
                Ok(None)
            }
        }
    }
}
