//! `SandboxEvent` (§4.5.2) and its line-oriented wire format (§6).
//!
//! Grounded on the ASCII pipe-delimited frame the spec prescribes:
//! `<event_kind>|<pid>|<ppid>|<errno>|<operation>|<mode>|<path>[|<dst_path>][|<cmdline>]`
//! terminated by the literal sentinel `__EOM__`. Kept a plain `Display`/
//! `FromStr` pair rather than pulling `serde` into the wire path: this frame
//! is read one line at a time off a FIFO, not deserialized as a document.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use color_eyre::eyre::{bail, eyre};
use strum::{Display as StrumDisplay, EnumString};

/// The terminal line the supervisor watches for before tearing the FIFO
/// down (§4.5.7).
pub const EOM_SENTINEL: &str = "__EOM__";

/// Closed event-type set (§4.5.2).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, StrumDisplay, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Open,
    GenericRead,
    GenericWrite,
    GenericProbe,
    Create,
    Unlink,
    Link,
    ReadLink,
    Exec,
    Clone,
}

/// Whether a path was resolved following symlinks or not, carried on
/// probe-shaped events (`readlink` is a probe with no-follow semantics).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, StrumDisplay, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum PathResolution {
    Resolve,
    ResolveNoFollow,
}

/// One intercepted syscall, already classified, ready to report.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SandboxEvent {
    pub syscall_name: String,
    pub kind: EventKind,
    pub pid: u32,
    pub ppid: u32,
    /// Absolute, or relative-with-dir-fd, or derived from an already-open fd.
    pub source_path: PathBuf,
    /// Present for link/rename-shaped events.
    pub destination_path: Option<PathBuf>,
    pub errno: i32,
    pub mode_bits: u32,
    pub path_resolution: PathResolution,
    /// Present only on `Exec` events.
    pub command_line: Option<String>,
}

impl SandboxEvent {
    pub fn new(syscall_name: impl Into<String>, kind: EventKind, pid: u32, ppid: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            syscall_name: syscall_name.into(),
            kind,
            pid,
            ppid,
            source_path: path.into(),
            destination_path: None,
            errno: 0,
            mode_bits: 0,
            path_resolution: PathResolution::Resolve,
            command_line: None,
        }
    }

    pub fn with_destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination_path = Some(path.into());
        self
    }

    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = errno;
        self
    }

    pub fn with_mode_bits(mut self, mode_bits: u32) -> Self {
        self.mode_bits = mode_bits;
        self
    }

    pub fn with_no_follow(mut self) -> Self {
        self.path_resolution = PathResolution::ResolveNoFollow;
        self
    }

    pub fn with_command_line(mut self, cmdline: impl Into<String>) -> Self {
        self.command_line = Some(cmdline.into());
        self
    }

    pub fn is_denied(&self) -> bool {
        self.errno != 0
    }

    pub fn path(&self) -> &Path {
        &self.source_path
    }
}

fn escape_field(s: &str) -> String {
    s.replace('\\', "\\\\").replace('|', "\\p").replace('\n', "\\n")
}

fn unescape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('p') => out.push('|'),
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl fmt::Display for SandboxEvent {
    /// `<event_kind>|<pid>|<ppid>|<errno>|<operation>|<mode>|<path>[|<dst_path>][|<cmdline>]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}|{}",
            self.kind,
            self.pid,
            self.ppid,
            self.errno,
            escape_field(&self.syscall_name),
            self.mode_bits,
            escape_field(&self.source_path.to_string_lossy()),
        )?;
        if let Some(dst) = &self.destination_path {
            write!(f, "|{}", escape_field(&dst.to_string_lossy()))?;
        }
        if let Some(cmdline) = &self.command_line {
            write!(f, "|{}", escape_field(cmdline))?;
        }
        Ok(())
    }
}

impl FromStr for SandboxEvent {
    type Err = color_eyre::Report;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 7 {
            bail!("malformed sandbox event line, expected >= 7 fields, got {}: {line:?}", fields.len());
        }
        let kind = EventKind::from_str(fields[0]).map_err(|_| eyre!("unknown event kind {:?}", fields[0]))?;
        let pid: u32 = fields[1].parse()?;
        let ppid: u32 = fields[2].parse()?;
        let errno: i32 = fields[3].parse()?;
        let syscall_name = unescape_field(fields[4]);
        let mode_bits: u32 = fields[5].parse()?;
        let source_path = PathBuf::from(unescape_field(fields[6]));

        let is_link_shaped = matches!(kind, EventKind::Link | EventKind::Unlink | EventKind::Create | EventKind::Clone);
        let (destination_path, command_line) = match (kind, fields.get(7)) {
            (EventKind::Exec, Some(cmdline)) => (None, Some(unescape_field(cmdline))),
            (_, Some(dst)) if is_link_shaped => (Some(PathBuf::from(unescape_field(dst))), fields.get(8).map(|c| unescape_field(c))),
            (_, Some(extra)) => (None, Some(unescape_field(extra))),
            (_, None) => (None, None),
        };

        Ok(SandboxEvent {
            syscall_name,
            kind,
            pid,
            ppid,
            source_path,
            destination_path,
            errno,
            mode_bits,
            path_resolution: PathResolution::Resolve,
            command_line,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trips_a_plain_open_event() {
        let event = SandboxEvent::new("openat", EventKind::Open, 123, 100, "/src/main.rs");
        let line = event.to_string();
        let parsed: SandboxEvent = line.parse().unwrap();
        assert_eq!(parsed.kind, EventKind::Open);
        assert_eq!(parsed.pid, 123);
        assert_eq!(parsed.source_path, PathBuf::from("/src/main.rs"));
    }

    #[test]
    fn round_trips_a_rename_pair_with_destination() {
        let event = SandboxEvent::new("renameat", EventKind::Unlink, 1, 0, "/d/a").with_destination("/d2/a");
        let parsed: SandboxEvent = event.to_string().parse().unwrap();
        assert_eq!(parsed.destination_path, Some(PathBuf::from("/d2/a")));
    }

    #[test]
    fn round_trips_an_exec_event_with_cmdline() {
        let event = SandboxEvent::new("execve", EventKind::Exec, 5, 1, "/usr/bin/cc").with_command_line("cc -c main.c");
        let parsed: SandboxEvent = event.to_string().parse().unwrap();
        assert_eq!(parsed.command_line.as_deref(), Some("cc -c main.c"));
    }

    #[test]
    fn escapes_pipes_in_paths() {
        let event = SandboxEvent::new("open", EventKind::Open, 1, 0, "/weird|path");
        let parsed: SandboxEvent = event.to_string().parse().unwrap();
        assert_eq!(parsed.source_path, PathBuf::from("/weird|path"));
    }

    #[test]
    fn rejects_unknown_event_kind() {
        assert!("bogus|1|0|0|open|0|/x".parse::<SandboxEvent>().is_err());
    }
}
