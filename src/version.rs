//! Tag classification and version ordering.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Tags whose content is republished in place.
pub const MUTABLE_TAGS: [&str; 4] = ["latest", "main", "master", "stable"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    Mutable,
    Semantic,
    Generic,
}

fn semantic_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^v?\d+(\.\d+)*").expect("static regex"))
}

fn leading_digits() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+").expect("static regex"))
}

pub fn classify_tag(tag: &str) -> TagKind {
    if MUTABLE_TAGS.contains(&tag) {
        TagKind::Mutable
    } else if semantic_pattern().is_match(tag) {
        TagKind::Semantic
    } else {
        TagKind::Generic
    }
}

/// Sort key of a version-like tag: numeric components, at least three.
///
/// `"v1.2.10-alpine"` becomes `[1, 2, 10]`, `"2"` becomes `[2, 0, 0]`.
/// Components without a leading number count as zero.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionKey(Vec<u64>);

#[cfg(test)]
impl VersionKey {
    pub fn components(&self) -> &[u64] {
        &self.0
    }
}

pub fn version_sort_key(tag: &str) -> VersionKey {
    let clean = tag.strip_prefix('v').unwrap_or(tag);
    let mut parts: Vec<u64> = clean
        .split('.')
        .map(|part| {
            leading_digits()
                .find(part)
                .map(|m| m.as_str().parse::<u64>().unwrap_or(u64::MAX))
                .unwrap_or(0)
        })
        .collect();
    while parts.len() < 3 {
        parts.push(0);
    }
    VersionKey(parts)
}

/// Strict `major.minor.patch` reading used by [`is_safe_update`]: every
/// component must be purely numeric and there may be at most three.
fn strict_triple(tag: &str) -> Option<[u64; 3]> {
    let clean = tag.strip_prefix('v').unwrap_or(tag);
    let mut out = [0u64; 3];
    let mut count = 0;
    for part in clean.split('.') {
        if count == 3 || part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        out[count] = part.parse().ok()?;
        count += 1;
    }
    Some(out)
}

/// A patch-only bump: same major and minor, strictly higher patch.
///
/// This is the only kind of change allowed to run unattended.
pub fn is_safe_update(current: &str, candidate: &str) -> bool {
    match (strict_triple(current), strict_triple(candidate)) {
        (Some(cur), Some(cand)) => cur[0] == cand[0] && cur[1] == cand[1] && cand[2] > cur[2],
        _ => false,
    }
}

/// Greatest semantic tag in `tags` that sorts strictly above `current`.
pub fn find_latest_version<'a>(tags: &'a [String], current: &str) -> Option<&'a str> {
    let current_key = version_sort_key(current);
    let mut candidates: Vec<(&'a str, VersionKey)> = tags
        .iter()
        .filter(|t| classify_tag(t) == TagKind::Semantic)
        .map(|t| (t.as_str(), version_sort_key(t)))
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    candidates
        .into_iter()
        .find(|(_, key)| *key > current_key)
        .map(|(tag, _)| tag)
}
