//! Orchestration code versions.
//!
//! Code versions are git tags of the form `<track>/<major>.<minor>.<patch>[suffix]`:
//!
//! ```text
//!   14/1.12.0                            released
//!   14/1.12.0.post1.dev0+71201f4.dirty   development build
//! ```
//!
//! The track names the release channel. Versions on different tracks are not
//! comparable. A version is *released* iff it carries no suffix.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("invalid code version \"{0}\"")]
    Malformed(String),

    #[error("invalid code version \"{0}\": epoch (\"!\" character) not supported")]
    EpochUnsupported(String),

    #[error(
        "invalid code version \"{version}\": expected 3 number components after track, got {found}"
    )]
    ReleaseSegments { version: String, found: usize },

    #[error("unable to compare versions with different tracks: \"{left}\" and \"{right}\"")]
    TrackMismatch { left: String, right: String },
}

fn release_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^(?P<release>[0-9]+(?:\.[0-9]+)*)(?P<suffix>(?:[.+\-_]?[A-Za-z][A-Za-z0-9.+\-_]*)?)$",
            )
            .ok()
        })
        .as_ref()
}

/// A parsed code version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeVersion {
    raw: String,
    pub track: String,
    pub release: [u64; 3],
    /// Anything after the release numbers, e.g. `.post1.dev0+71201f4.dirty`.
    pub suffix: String,
}

impl CodeVersion {
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let (track, rest) = raw
            .split_once('/')
            .ok_or_else(|| VersionError::Malformed(raw.to_string()))?;
        if track.is_empty() || rest.contains('/') {
            return Err(VersionError::Malformed(raw.to_string()));
        }
        if rest.contains('!') {
            return Err(VersionError::EpochUnsupported(raw.to_string()));
        }

        let caps = release_pattern()
            .and_then(|pattern| pattern.captures(rest))
            .ok_or_else(|| VersionError::Malformed(raw.to_string()))?;
        let numbers: Vec<u64> = caps["release"]
            .split('.')
            .map(|n| n.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|_| VersionError::Malformed(raw.to_string()))?;
        let release: [u64; 3] =
            numbers
                .as_slice()
                .try_into()
                .map_err(|_| VersionError::ReleaseSegments {
                    version: raw.to_string(),
                    found: numbers.len(),
                })?;

        Ok(Self {
            raw: raw.to_string(),
            track: track.to_string(),
            release,
            suffix: caps["suffix"].to_string(),
        })
    }

    /// Released and correctly tagged, as opposed to a development build.
    pub fn released(&self) -> bool {
        self.suffix.is_empty()
    }

    /// Incremented when upgrading across it is unsupported without an
    /// intermediate version.
    pub fn major(&self) -> u64 {
        self.release[0]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Order two versions on the same track.
    ///
    /// With equal release numbers, post-releases and local builds sort after
    /// the bare release; pre-releases and dev builds sort before it.
    pub fn compare(&self, other: &CodeVersion) -> Result<Ordering, VersionError> {
        if self.track != other.track {
            return Err(VersionError::TrackMismatch {
                left: self.raw.clone(),
                right: other.raw.clone(),
            });
        }
        let ordering = self
            .release
            .cmp(&other.release)
            .then_with(|| suffix_rank(&self.suffix).cmp(&suffix_rank(&other.suffix)))
            .then_with(|| self.suffix.cmp(&other.suffix));
        Ok(ordering)
    }
}

fn suffix_rank(suffix: &str) -> i8 {
    let trimmed = suffix.trim_start_matches(['.', '-', '_']);
    if suffix.is_empty() {
        0
    } else if trimmed.starts_with("post") || trimmed.starts_with('+') {
        1
    } else {
        -1
    }
}

impl fmt::Display for CodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for CodeVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Default compatibility rule for code versions.
///
/// Upgrading is supported when both versions are released, share a major
/// number, and `new` is not older than `old`. Development builds may carry
/// changes the version number does not reflect, so they never qualify.
pub fn code_versions_compatible(old: &CodeVersion, new: &CodeVersion) -> Result<bool, VersionError> {
    if !(old.released() && new.released()) {
        return Ok(false);
    }
    if old.major() != new.major() {
        return Ok(false);
    }
    Ok(new.compare(old)? != Ordering::Less)
}
