/// Chunked file transfer over a data channel
///
/// Wire format: an optional `file-start` text frame, raw binary chunks of
/// `CHUNK_SIZE` bytes (the last one may be shorter), then a `file-complete`
/// text frame naming the file. Ordering relies on the channel being
/// ordered and reliable; there are no sequence numbers.
///
/// Each transfer gets its own channel labelled `file-transfer/<id>`, so the
/// receiver keys its buffers by transfer rather than by peer.
use crate::domain::shared::value_objects::TransferId;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

pub const CHUNK_SIZE: usize = 16 * 1024;

pub const CHANNEL_LABEL_PREFIX: &str = "file-transfer/";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("received {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch for {name}")]
    ChecksumMismatch { name: String },

    #[error("malformed control frame: {0}")]
    MalformedControl(#[from] serde_json::Error),

    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Text frames of the protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    FileStart {
        name: String,
        size: u64,
    },
    FileComplete {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
}

impl ControlFrame {
    pub fn to_json(&self) -> Result<String, TransferError> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn channel_label(id: TransferId) -> String {
    format!("{CHANNEL_LABEL_PREFIX}{id}")
}

pub fn parse_channel_label(label: &str) -> Option<TransferId> {
    let raw = label.strip_prefix(CHANNEL_LABEL_PREFIX)?;
    Uuid::parse_str(raw).ok().map(TransferId::from_uuid)
}

/// `round(done / total * 100)`, with an empty file counting as done
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = (done as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

/// Strip directories and reserved names from a peer-supplied file name
pub fn safe_file_name(name: &str) -> String {
    let candidate = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let trimmed = candidate.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sender-side progress of one transfer
#[derive(Debug)]
pub struct OutgoingTransfer {
    id: TransferId,
    name: String,
    size: u64,
    offset: u64,
    hasher: Sha256,
}

impl OutgoingTransfer {
    pub fn new(id: TransferId, name: impl Into<String>, size: u64) -> Self {
        Self {
            id,
            name: name.into(),
            size,
            offset: 0,
            hasher: Sha256::new(),
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the next chunk to read; zero once everything was sent
    pub fn next_chunk_len(&self) -> usize {
        let remaining = self.size.saturating_sub(self.offset);
        remaining.min(CHUNK_SIZE as u64) as usize
    }

    pub fn is_finished(&self) -> bool {
        self.offset >= self.size
    }

    /// Account for a sent chunk and return the progress percentage
    pub fn record_chunk(&mut self, chunk: &[u8]) -> u8 {
        self.hasher.update(chunk);
        self.offset += chunk.len() as u64;
        progress_percent(self.offset, self.size)
    }

    pub fn start_frame(&self) -> ControlFrame {
        ControlFrame::FileStart {
            name: self.name.clone(),
            size: self.size,
        }
    }

    pub fn completion_frame(self) -> ControlFrame {
        ControlFrame::FileComplete {
            name: self.name,
            size: Some(self.offset),
            sha256: Some(hex::encode(self.hasher.finalize())),
        }
    }
}

/// A reassembled file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub transfer_id: TransferId,
    pub name: String,
    pub data: Bytes,
}

impl ReceivedFile {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Receiver-side buffers of one transfer, in arrival order
#[derive(Debug)]
pub struct IncomingTransfer {
    id: TransferId,
    announced_name: Option<String>,
    announced_size: Option<u64>,
    chunks: Vec<Bytes>,
    received: u64,
    hasher: Sha256,
}

impl IncomingTransfer {
    pub fn new(id: TransferId) -> Self {
        Self {
            id,
            announced_name: None,
            announced_size: None,
            chunks: Vec::new(),
            received: 0,
            hasher: Sha256::new(),
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn announced_name(&self) -> Option<&str> {
        self.announced_name.as_deref()
    }

    fn announce(&mut self, name: String, size: u64) {
        self.announced_name = Some(name);
        self.announced_size = Some(size);
    }

    /// Append a chunk; returns progress when the size is known
    fn push_chunk(&mut self, chunk: Bytes) -> Option<u8> {
        self.hasher.update(&chunk);
        self.received += chunk.len() as u64;
        self.chunks.push(chunk);
        self.announced_size
            .map(|size| progress_percent(self.received, size))
    }

    /// Verify and assemble once the completion frame arrived
    fn finish(
        self,
        name: String,
        size: Option<u64>,
        sha256: Option<String>,
    ) -> Result<ReceivedFile, TransferError> {
        if let Some(expected) = size.or(self.announced_size) {
            if expected != self.received {
                return Err(TransferError::SizeMismatch {
                    expected,
                    actual: self.received,
                });
            }
        }

        if let Some(expected) = sha256 {
            let actual = hex::encode(self.hasher.finalize());
            if !actual.eq_ignore_ascii_case(&expected) {
                return Err(TransferError::ChecksumMismatch { name });
            }
        }

        let mut data = BytesMut::with_capacity(self.received as usize);
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }

        Ok(ReceivedFile {
            transfer_id: self.id,
            name,
            data: data.freeze(),
        })
    }
}

/// What a text frame did to a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverUpdate {
    Started { name: String, size: u64 },
    Completed(ReceivedFile),
}

/// All in-flight incoming transfers of one peer, keyed by transfer id
#[derive(Debug, Default)]
pub struct FileReceiver {
    sessions: HashMap<TransferId, IncomingTransfer>,
}

impl FileReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start buffering for a transfer (its channel opened)
    pub fn open(&mut self, id: TransferId) {
        self.sessions
            .entry(id)
            .or_insert_with(|| IncomingTransfer::new(id));
    }

    pub fn handle_binary(&mut self, id: TransferId, chunk: Bytes) -> Option<u8> {
        self.sessions
            .entry(id)
            .or_insert_with(|| IncomingTransfer::new(id))
            .push_chunk(chunk)
    }

    /// Handle a control frame. A failed completion discards the transfer.
    pub fn handle_text(
        &mut self,
        id: TransferId,
        text: &str,
    ) -> Result<ReceiverUpdate, TransferError> {
        match serde_json::from_str::<ControlFrame>(text)? {
            ControlFrame::FileStart { name, size } => {
                self.sessions
                    .entry(id)
                    .or_insert_with(|| IncomingTransfer::new(id))
                    .announce(name.clone(), size);
                Ok(ReceiverUpdate::Started { name, size })
            }
            ControlFrame::FileComplete { name, size, sha256 } => {
                let session = self
                    .sessions
                    .remove(&id)
                    .ok_or(TransferError::UnknownTransfer(id))?;
                session
                    .finish(name, size, sha256)
                    .map(ReceiverUpdate::Completed)
            }
        }
    }

    pub fn discard(&mut self, id: TransferId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn get(&self, id: TransferId) -> Option<&IncomingTransfer> {
        self.sessions.get(&id)
    }

    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
