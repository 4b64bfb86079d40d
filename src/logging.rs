//! Structured logging with timestamps, source locations, and ANSI colour support.
//!
//! Provides the [`tlog!`], [`tlog_warn!`] and [`tlog_crit!`] macros for
//! consistent log output in the format:
//!
//! ```text
//! 20260211T21:33:12.000 - src/channel/pairing.rs:42 - pairing: c-3f9a01b joined by p-77ac0e1
//! 20260211T21:33:12.000 - src/notes.rs:88 - CRIT notes: unable to draw a free note id
//! ```
//!
//! When writing to a terminal, output is colour-coded:
//! - Timestamps and source locations are dimmed
//! - Channel, peer and note ids get consistent colours based on their content
//! - Warnings are yellow, critical lines red
//!
//! By default log lines go to stderr.  Call [`set_writer`] to redirect output
//! to any [`std::io::Write`] implementor (file, in-memory buffer, etc.).
//! Installing a custom writer also disables ANSI colour codes.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::SystemTime;

use sha2::{Digest, Sha256};

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize the logging system. Call once at startup before any logging.
/// Detects whether stderr supports ANSI colours.
pub fn init() {
    let is_terminal = std::io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);
}

/// Replace the log writer.  All subsequent output goes to `w`.
/// Also disables ANSI colour codes, since the new writer is unlikely to be
/// a colour terminal.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    *LOG_WRITER.lock().unwrap_or_else(PoisonError::into_inner) = w;
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

/// Severity attached to a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Critical,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Info => "",
            Level::Warn => "WARN ",
            Level::Critical => "CRIT ",
        }
    }

    fn colour(self) -> &'static str {
        match self {
            Level::Info => "",
            Level::Warn => "\x1b[93m",
            Level::Critical => "\x1b[91m",
        }
    }
}

// ANSI escape codes
const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// Colour palette for ID hashing — bright, visually distinct colours.
const ID_COLOURS: &[&str] = &[
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[93m", // bright yellow
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[96m", // bright cyan
    "\x1b[31m", // red
    "\x1b[32m", // green
    "\x1b[33m", // yellow
    "\x1b[34m", // blue
    "\x1b[35m", // magenta
    "\x1b[36m", // cyan
];

/// Pick a deterministic colour for the given string.
fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const LOG_ID_TRUNCATE_LEN: usize = 7;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

fn tagged_id(prefix: char, id: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        let colour = hash_colour(id);
        format!("{colour}{prefix}-{short}{RESET}")
    } else {
        format!("{prefix}-{short}")
    }
}

/// Format a channel ID with consistent colour and truncation.
///
/// Returns e.g. `c-3f9a01b` (plain) or `\x1b[92mc-3f9a01b\x1b[0m` (colour).
pub fn channel_id(id: &str) -> String {
    tagged_id('c', id)
}

/// Format a peer ID with consistent colour and truncation.
pub fn peer_id(id: &str) -> String {
    tagged_id('p', id)
}

/// Format a note ID with consistent colour and truncation.
pub fn note_id(id: &str) -> String {
    tagged_id('n', id)
}

/// Short SHA-256 fingerprint of an opaque public key, e.g. `k-1a2b3c4d`.
pub fn key_fingerprint(public_key: &[u8]) -> String {
    if public_key.is_empty() {
        return "k-none".to_string();
    }
    let digest = Sha256::digest(public_key);
    format!("k-{}", hex::encode(&digest[..4]))
}

/// Format the current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    let now = SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let days = (secs / 86400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!(
        "{:04}{:02}{:02}T{:02}:{:02}:{:02}.{:03}",
        y, m, d, hours, minutes, seconds, millis
    )
}

/// Write a single log line to the current writer.
///
/// Called by the logging macros; not intended for direct use.
pub fn emit(level: Level, file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let tag = level.tag();
    let formatted = if colour_enabled() {
        let colour = level.colour();
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {colour}{tag}{RESET}{msg}")
    } else {
        format!("{ts} - {file}:{line} - {tag}{msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap_or_else(PoisonError::into_inner);
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit an informational log line with timestamp and source location.
///
/// # Usage
///
/// ```ignore
/// tlog!("relay: channel {} created", logging::channel_id(&id.to_string()));
/// ```
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit($crate::logging::Level::Info, file!(), line!(), &format!($($arg)*));
    }};
}

/// Emit a warning. Used for swallowed failures that an operator may care about.
#[macro_export]
macro_rules! tlog_warn {
    ($($arg:tt)*) => {{
        $crate::logging::emit($crate::logging::Level::Warn, file!(), line!(), &format!($($arg)*));
    }};
}

/// Emit a critical line. Reserved for conditions that need operator action.
#[macro_export]
macro_rules! tlog_crit {
    ($($arg:tt)*) => {{
        $crate::logging::emit($crate::logging::Level::Critical, file!(), line!(), &format!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_truncated_and_prefixed() {
        assert_eq!(channel_id("0123456789abcdef"), "c-0123456");
        assert_eq!(peer_id("abc"), "p-abc");
        assert_eq!(note_id("fedcba9876"), "n-fedcba9");
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = key_fingerprint(b"public key bytes");
        let b = key_fingerprint(b"public key bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), "k-".len() + 8);
        assert_eq!(key_fingerprint(&[]), "k-none");
    }

    #[test]
    fn timestamp_has_expected_shape() {
        let ts = format_timestamp();
        assert_eq!(ts.len(), "20260211T21:33:12.000".len());
        assert_eq!(&ts[8..9], "T");
    }
}
