//! Execution log events (§6): "one event per pip state transition and one
//! per sandbox observation", written as length-prefixed binary frames with
//! a fixed header (event kind byte, length, pip id, monotonic timestamp)
//! followed by a `serde_json`-encoded payload.
//!
//! The teacher avoids heavy binary-serialization crates beyond what's
//! already pulled in; this mirrors its general preference for JSON-on-disk
//! under a thin binary envelope (`cache/local/metadata.rs` storing JSON
//! blobs under a typed key).

use std::io;

use bxl_types::PipId;
use color_eyre::Result;
use color_eyre::eyre::Context as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::executor::PipState;

/// One-byte discriminant at the head of every frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum EventKindByte {
    StateTransition = 0,
    SandboxObservation = 1,
}

impl EventKindByte {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::StateTransition),
            1 => Some(Self::SandboxObservation),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateTransitionPayload {
    pub from: String,
    pub to: String,
}

impl StateTransitionPayload {
    pub fn new(from: PipState, to: PipState) -> Self {
        Self {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxObservationPayload {
    pub syscall_name: String,
    pub path: String,
    pub denied: bool,
}

/// A decoded execution log record: the fixed header fields plus the
/// deserialized payload, kept as raw JSON text since the two payload shapes
/// don't share a type — the reader dispatches on `kind` before parsing.
pub struct LogRecord {
    pub kind: EventKindByte,
    pub pip_id: PipId,
    pub monotonic_timestamp_nanos: u64,
    pub payload_json: String,
}

/// Appends length-prefixed frames to an async sink.
pub struct ExecutionLogWriter<W> {
    sink: W,
}

impl<W: AsyncWrite + Unpin> ExecutionLogWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub async fn write_state_transition(&mut self, pip_id: PipId, timestamp_nanos: u64, payload: &StateTransitionPayload) -> Result<()> {
        self.write_frame(EventKindByte::StateTransition, pip_id, timestamp_nanos, payload).await
    }

    pub async fn write_sandbox_observation(&mut self, pip_id: PipId, timestamp_nanos: u64, payload: &SandboxObservationPayload) -> Result<()> {
        self.write_frame(EventKindByte::SandboxObservation, pip_id, timestamp_nanos, payload).await
    }

    async fn write_frame(&mut self, kind: EventKindByte, pip_id: PipId, timestamp_nanos: u64, payload: &impl Serialize) -> Result<()> {
        let body = serde_json::to_vec(payload).context("encode execution log payload")?;
        let mut frame = Vec::with_capacity(1 + 4 + 8 + 8 + body.len());
        frame.push(kind as u8);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&pip_id.0.to_le_bytes());
        frame.extend_from_slice(&timestamp_nanos.to_le_bytes());
        frame.extend_from_slice(&body);
        self.sink.write_all(&frame).await.context("write execution log frame")?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.sink.flush().await.context("flush execution log")
    }
}

/// Reads length-prefixed frames back off an async source, one at a time.
pub struct ExecutionLogReader<R> {
    source: R,
}

impl<R: AsyncRead + Unpin> ExecutionLogReader<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    /// Returns `Ok(None)` at a clean end-of-stream (no partial frame).
    pub async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        let mut header = [0u8; 1 + 4 + 8 + 8];
        match self.source.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err).context("read execution log header"),
        }

        let kind = EventKindByte::from_u8(header[0]).ok_or_else(|| color_eyre::eyre::eyre!("unknown execution log event kind byte {}", header[0]))?;
        let body_len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
        let pip_id = u64::from_le_bytes(header[5..13].try_into().unwrap());
        let timestamp = u64::from_le_bytes(header[13..21].try_into().unwrap());

        let mut body = vec![0u8; body_len];
        self.source.read_exact(&mut body).await.context("read execution log payload")?;
        let payload_json = String::from_utf8(body).context("execution log payload is not valid utf8")?;

        Ok(Some(LogRecord {
            kind,
            pip_id: PipId(pip_id),
            monotonic_timestamp_nanos: timestamp,
            payload_json,
        }))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn round_trips_a_state_transition_frame() {
        let mut buf = Vec::new();
        {
            let mut writer = ExecutionLogWriter::new(&mut buf);
            writer
                .write_state_transition(PipId(42), 1_000, &StateTransitionPayload::new(PipState::Waiting, PipState::CacheCheck))
                .await
                .unwrap();
        }

        let mut reader = ExecutionLogReader::new(buf.as_slice());
        let record = reader.next_record().await.unwrap().unwrap();
        assert_eq!(record.kind, EventKindByte::StateTransition);
        assert_eq!(record.pip_id, PipId(42));
        assert_eq!(record.monotonic_timestamp_nanos, 1_000);
        let payload: StateTransitionPayload = serde_json::from_str(&record.payload_json).unwrap();
        assert_eq!(payload.to, "CacheCheck");

        assert!(reader.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn round_trips_multiple_frames_in_sequence() {
        let mut buf = Vec::new();
        {
            let mut writer = ExecutionLogWriter::new(&mut buf);
            writer
                .write_sandbox_observation(
                    PipId(1),
                    1,
                    &SandboxObservationPayload {
                        syscall_name: "openat".into(),
                        path: "/src/main.rs".into(),
                        denied: false,
                    },
                )
                .await
                .unwrap();
            writer
                .write_state_transition(PipId(1), 2, &StateTransitionPayload::new(PipState::Executing, PipState::ValidatingOutputs))
                .await
                .unwrap();
        }

        let mut reader = ExecutionLogReader::new(buf.as_slice());
        let first = reader.next_record().await.unwrap().unwrap();
        assert_eq!(first.kind, EventKindByte::SandboxObservation);
        let second = reader.next_record().await.unwrap().unwrap();
        assert_eq!(second.kind, EventKindByte::StateTransition);
        assert!(reader.next_record().await.unwrap().is_none());
    }
}
