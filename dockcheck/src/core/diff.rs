//! Facts extracted from a unified diff for policy evaluation.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static FILE_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:---|\+\+\+) [ab]/(.+?)\r?$").expect("diff header regex should compile")
});

const DELETED_FILE_MARKER: &str = "+++ /dev/null";

/// Paths named in `--- a/` and `+++ b/` headers, deduplicated in first-seen order.
pub fn file_paths(diff: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    FILE_HEADER_RE
        .captures_iter(diff)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|path| seen.insert(*path))
        .map(str::to_string)
        .collect()
}

/// Number of files the diff deletes.
pub fn deleted_file_count(diff: &str) -> u32 {
    diff.matches(DELETED_FILE_MARKER).count() as u32
}
