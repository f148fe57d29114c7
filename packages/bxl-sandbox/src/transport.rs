//! Transport to the supervisor (§4.5.7): a FIFO whose path is injected via
//! env, written one event per line, torn down only after the terminal
//! sentinel is observed.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::Context as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::event::{EOM_SENTINEL, SandboxEvent};

/// Env var name the driver injects into the child so the interposed library
/// (or the process itself, for `SimulatedSandbox`) knows where to write
/// events.
pub const FIFO_ENV_VAR: &str = "BXL_SANDBOX_FIFO";

/// Create the FIFO at `path`. Unix-only: Windows uses a named pipe via a
/// different primitive, out of scope for this reference implementation
/// (the spec names it as the Windows equivalent but this core targets the
/// POSIX sandbox path).
#[cfg(unix)]
pub fn create_fifo(path: &Path) -> Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).context("fifo path has interior nul byte")?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(err).context("mkfifo");
        }
    }
    Ok(())
}

/// The supervisor side: reads lines off the FIFO until the terminal
/// sentinel, parsing each into a [`SandboxEvent`].
pub struct EventReader {
    lines: tokio::io::Lines<BufReader<tokio::fs::File>>,
}

impl EventReader {
    pub async fn open(fifo_path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new().read(true).open(fifo_path).await.context("open sandbox fifo for reading")?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
        })
    }

    /// Read the next event, or `None` once the terminal sentinel has been
    /// observed (the FIFO itself may still be open — the sentinel, not EOF,
    /// is the authoritative end-of-stream marker per §4.5.7).
    pub async fn next_event(&mut self) -> Result<Option<SandboxEvent>> {
        loop {
            let Some(line) = self.lines.next_line().await.context("read sandbox fifo line")? else {
                return Ok(None);
            };
            if line.is_empty() {
                continue;
            }
            if line == EOM_SENTINEL {
                return Ok(None);
            }
            return Ok(Some(line.parse().with_context(|| format!("parse sandbox event line: {line:?}"))?));
        }
    }
}

/// The producer side: writes one event per line, atomically per event.
/// Used by `SimulatedSandbox` and by tests standing in for the real
/// interposed library.
pub struct EventWriter {
    file: tokio::fs::File,
}

impl EventWriter {
    pub async fn open(fifo_path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new().write(true).open(fifo_path).await.context("open sandbox fifo for writing")?;
        Ok(Self { file })
    }

    pub async fn write_event(&mut self, event: &SandboxEvent) -> Result<()> {
        let line = format!("{event}\n");
        self.file.write_all(line.as_bytes()).await.context("write sandbox event")?;
        self.file.flush().await?;
        Ok(())
    }

    pub async fn write_terminal_sentinel(&mut self) -> Result<()> {
        self.file.write_all(format!("{EOM_SENTINEL}\n").as_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }
}

/// A fresh, unique FIFO path under `dir`, matching the teacher's convention
/// of a `uuid`-suffixed temp-file name (`hurry/src/cache/local/cas.rs`'s
/// `hashed_copy` staging path) to avoid collisions between concurrently
/// running pips.
pub fn fifo_path_for(dir: &Path, pip_id: u64) -> PathBuf {
    dir.join(format!("bxl-sandbox-{pip_id:016x}-{}.fifo", uuid::Uuid::new_v4()))
}

#[cfg(all(test, unix))]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::event::EventKind;

    #[tokio::test]
    async fn writer_and_reader_round_trip_events_and_sentinel() {
        let temp = tempfile::tempdir().unwrap();
        let fifo = fifo_path_for(temp.path(), 1);
        create_fifo(&fifo).unwrap();

        let fifo_for_writer = fifo.clone();
        let writer_task = tokio::spawn(async move {
            let mut writer = EventWriter::open(&fifo_for_writer).await.unwrap();
            writer.write_event(&SandboxEvent::new("openat", EventKind::Open, 1, 0, "/src/main.rs")).await.unwrap();
            writer.write_event(&SandboxEvent::new("openat", EventKind::Create, 1, 0, "/out/main.o")).await.unwrap();
            writer.write_terminal_sentinel().await.unwrap();
        });

        let mut reader = EventReader::open(&fifo).await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = reader.next_event().await.unwrap() {
            events.push(event);
        }
        writer_task.await.unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Open);
        assert_eq!(events[1].kind, EventKind::Create);
    }
}
