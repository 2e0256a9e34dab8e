//! Types, functions, constants and other items that are globally relevant throughout the codebase.

mod args;
mod config;
mod context;

use std::sync::atomic::{AtomicU64, Ordering};

pub use args::*;
pub use config::*;
pub use context::*;
use once_cell::sync::Lazy;

pub const CONFIG_FILENAME: &str = "tinkerdown.yaml";

/// Prefix under which `build` embeds the site root inside the binary payload.
pub const EMBED_PREFIX: &str = "content/";

/// Debounce window for filesystem events.
pub const WATCH_DEBOUNCE_MS: u64 = 100;

/// Bounded fan-out for a session's initial source fetches.
pub const INITIAL_FETCH_FANOUT: usize = 8;

/// Soft deadline before the first render goes out with whatever has landed.
pub const INITIAL_RENDER_DEADLINE_MS: u64 = 2000;

static CORR_COUNTER: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(1));

/// A correlation id for one request/event, propagated through contexts and
/// included in log lines.
pub fn correlation_id() -> String {
    use std::hash::{Hash, Hasher};

    let n = CORR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = seahash::SeaHasher::default();
    (n, now).hash(&mut hasher);
    format!("{:012x}", hasher.finish() & 0xffff_ffff_ffff)
}

/// Redacts values whose keys look sensitive before they reach a log line.
pub fn redact<'a>(key: &str, value: &'a str) -> &'a str {
    static SENSITIVE: Lazy<regex::Regex> = Lazy::new(|| {
        regex::Regex::new(r"(?i)(secret|token|password|authorization|api[-_]?key)").unwrap()
    });

    if SENSITIVE.is_match(key) {
        "[redacted]"
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique() {
        let a = correlation_id();
        let b = correlation_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn redaction() {
        assert_eq!(redact("Authorization", "Bearer x"), "[redacted]");
        assert_eq!(redact("API_KEY", "k"), "[redacted]");
        assert_eq!(redact("DB_PASSWORD", "p"), "[redacted]");
        assert_eq!(redact("HOME", "/root"), "/root");
    }
}
