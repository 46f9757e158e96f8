//! Crash deduplication keys derived from debugger backtrace text.
//!
//! The key is the concatenation of the last three characters of each frame's
//! address field, outermost frame first. Frames whose address fields share the
//! same three trailing characters alias to the same key; this is a known
//! precision trade-off and downstream buckets depend on the exact format, so it
//! must not be widened or separated.

use log::debug;
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Number of trailing characters taken from each matched frame.
pub const FRAME_SUFFIX_LEN: usize = 3;

/// Matches `#<index> <address-field> in`, capturing the address field.
static FRAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\d+\s+(.*?)\s+in").expect("frame pattern is valid"));

/// Computes the dedup key for a backtrace.
///
/// Lines are scanned innermost frame first and each fragment is prepended, so
/// the result lists the outermost frame first. Lines that do not look like a
/// frame are skipped. Returns an empty string when nothing matched.
pub fn crash_hash(backtrace: &str) -> String {
    let mut key = String::new();
    for line in backtrace.lines() {
        let Some(captures) = FRAME_PATTERN.captures(line) else {
            continue;
        };
        let fragment = tail_chars(&captures[1], FRAME_SUFFIX_LEN);
        debug!("[hash] frame ({fragment}) {line}");
        key.insert_str(0, fragment);
    }
    key
}

fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    s.char_indices()
        .rev()
        .nth(n - 1)
        .map_or(s, |(idx, _)| &s[idx..])
}

/// A classified crash: the dedup key and the input that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashRecord {
    pub hash: String,
    pub input: PathBuf,
}

impl CrashRecord {
    pub fn from_backtrace(backtrace: &str, input: impl Into<PathBuf>) -> Self {
        Self {
            hash: crash_hash(backtrace),
            input: input.into(),
        }
    }

    /// An empty key means no frame could be recognised.
    pub fn is_unknown(&self) -> bool {
        self.hash.is_empty()
    }
}
