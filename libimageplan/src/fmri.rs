// This Source Code Form is subject to the terms of
// the Mozilla Public License, v. 2.0. If a copy of the
// MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! FMRI (Fault Management Resource Identifier) implementation
//!
//! An FMRI is a unique identifier for a package in the IPS system.
//! It follows the format: pkg://publisher/package_name@version
//! where:
//! - publisher is optional
//! - version is optional and follows the format: release[,build_release][-branch][:timestamp]
//!   - release is a dot-separated vector of integers (e.g., 5.11)
//!   - build_release is optional and names the OS release the package was built for
//!     (e.g., 5.11). It is informational and takes no part in ordering.
//!   - branch is optional and is a dot-separated vector of integers (e.g., 2020.0.1.0)
//!   - timestamp is optional and is an ISO-8601 basic string (e.g., 20200421T195136Z)
//!
//! Versions are totally ordered over (release, branch, timestamp). A component that is
//! absent sorts before any present value.
//!
//! Examples:
//! - pkg://openindiana.org/web/server/nginx@1.18.0,5.11-2020.0.1.0:20200421T195136Z
//! - pkg:/system/library@0.5.11-2020.0.1.19563
//! - xvm@0.5.11-2015.0.2.0
//!
//! # Examples
//!
//! ```
//! use libimageplan::fmri::{Constraint, Fmri, Version};
//!
//! let fmri = Fmri::parse("pkg://openindiana.org/web/server/nginx@1.18.0,5.11-2020.0.1.0:20200421T195136Z").unwrap();
//! assert_eq!(fmri.stem(), "web/server/nginx");
//!
//! let older = Version::parse("1.16").unwrap();
//! let version = fmri.version.as_ref().unwrap();
//! assert!(version > &older);
//! assert!(version.is_successor(&Version::parse("1").unwrap(), Constraint::Release));
//! ```

use chrono::NaiveDateTime;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing an FMRI
#[derive(Debug, Error, Diagnostic, PartialEq)]
pub enum FmriError {
    #[error("invalid FMRI format: {0:?}")]
    #[diagnostic(
        code(ips::fmri_error::invalid_format),
        help("FMRI should be in the format: [scheme://][publisher/]name[@version]")
    )]
    InvalidFormat(String),

    #[error("invalid version format: {0:?}")]
    #[diagnostic(
        code(ips::fmri_error::invalid_version_format),
        help("Version should be in the format: release[,build_release][-branch][:timestamp]")
    )]
    InvalidVersionFormat(String),

    #[error("illegal dot sequence {sequence:?}: {reason}")]
    #[diagnostic(
        code(ips::fmri_error::illegal_dot_sequence),
        help("Use dot-separated non-negative integers without leading zeros (e.g., 5.11)")
    )]
    IllegalDotSequence { sequence: String, reason: String },

    #[error("invalid timestamp format: {0:?}")]
    #[diagnostic(
        code(ips::fmri_error::invalid_timestamp_format),
        help("Timestamp must be ISO-8601 basic UTC time (e.g., 20200421T195136Z)")
    )]
    InvalidTimestampFormat(String),
}

/// Policies for [`Version::is_successor`], loosest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Constraint {
    /// Plain `self > other`.
    #[default]
    None,
    /// Every component present in `other` must be matched by `self`;
    /// absent components in `other` are "don't care".
    Auto,
    Release,
    ReleaseMajor,
    ReleaseMinor,
    Branch,
    BranchMajor,
    BranchMinor,
}

/// A dot-separated sequence of non-negative integers such as `5.11` or `2020.0.1.0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DotSequence(Vec<u64>);

impl DotSequence {
    pub fn parse(sequence: &str) -> Result<Self, FmriError> {
        if sequence.is_empty() {
            return Err(FmriError::IllegalDotSequence {
                sequence: sequence.to_string(),
                reason: "empty dot sequence".to_string(),
            });
        }

        sequence
            .split('.')
            .map(|elem| Self::component(sequence, elem))
            .collect::<Result<Vec<u64>, FmriError>>()
            .map(DotSequence)
    }

    fn component(sequence: &str, elem: &str) -> Result<u64, FmriError> {
        let illegal = |reason: &str| FmriError::IllegalDotSequence {
            sequence: sequence.to_string(),
            reason: reason.to_string(),
        };

        if elem.is_empty() {
            return Err(illegal("empty component"));
        }
        if elem.starts_with('-') {
            return Err(illegal("negative number"));
        }
        if !elem.chars().all(|c| c.is_ascii_digit()) {
            return Err(illegal("non-numeric component"));
        }
        if elem.len() > 1 && elem.starts_with('0') {
            return Err(illegal("zero padded number"));
        }
        elem.parse::<u64>()
            .map_err(|_| illegal("component out of range"))
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }

    /// True if `other` starts with every component of `self`.
    pub fn is_subsequence(&self, other: &DotSequence) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }

    pub fn is_same_major(&self, other: &DotSequence) -> bool {
        self.0.first() == other.0.first()
    }

    pub fn is_same_minor(&self, other: &DotSequence) -> bool {
        self.0.iter().take(2).eq(other.0.iter().take(2))
    }
}

impl fmt::Display for DotSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", c)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for DotSequence {
    type Err = FmriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DotSequence {
    type Error = FmriError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DotSequence> for String {
    fn from(value: DotSequence) -> Self {
        value.to_string()
    }
}

/// A version component of an FMRI
///
/// A version consists of:
/// - release: a dot-separated vector of integers (e.g., 5.11)
/// - build_release: optional, the OS release built against (e.g., 5.11)
/// - branch: optional, a dot-separated vector of integers (e.g., 2020.0.1.0)
/// - timestamp: optional, ISO-8601 basic UTC time (e.g., 20200421T195136Z)
///
/// Two versions are equal when release, branch and timestamp match; the
/// build release is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    /// The release component (e.g., 1.18.0)
    pub release: DotSequence,
    /// The build release component (e.g., 5.11)
    pub build_release: Option<DotSequence>,
    /// The branch component (e.g., 2020.0.1.0)
    pub branch: Option<DotSequence>,
    /// The timestamp component (e.g., 20200421T195136Z)
    pub timestamp: Option<String>,
}

impl Version {
    /// Parse a version string in the format: release\[,build_release\]\[-branch\]\[:timestamp\]
    pub fn parse(version_str: &str) -> Result<Self, FmriError> {
        let invalid = || FmriError::InvalidVersionFormat(version_str.to_string());

        let (head, timestamp) = match version_str.split_once(':') {
            Some((head, ts)) => (head, Some(ts)),
            None => (version_str, None),
        };
        let (head, branch) = match head.split_once('-') {
            Some((head, branch)) => (head, Some(branch)),
            None => (head, None),
        };
        let (release, build_release) = match head.split_once(',') {
            Some((release, build)) => (release, Some(build)),
            None => (head, None),
        };

        if release.is_empty() {
            return Err(invalid());
        }

        let timestamp = match timestamp {
            Some(ts) => {
                Self::validate_timestamp(ts)?;
                Some(ts.to_string())
            }
            None => None,
        };

        Ok(Version {
            release: DotSequence::parse(release)?,
            build_release: build_release.map(DotSequence::parse).transpose()?,
            branch: branch.map(DotSequence::parse).transpose()?,
            timestamp,
        })
    }

    fn validate_timestamp(ts: &str) -> Result<(), FmriError> {
        let invalid = || FmriError::InvalidTimestampFormat(ts.to_string());
        if ts.len() != 16 || !ts.is_ascii() || &ts[8..9] != "T" || &ts[15..16] != "Z" {
            return Err(invalid());
        }
        NaiveDateTime::parse_from_str(ts, "%Y%m%dT%H%M%SZ")
            .map(|_| ())
            .map_err(|_| invalid())
    }

    /// Evaluate whether `self` succeeds `other` under `constraint`.
    ///
    /// The release and branch constraints compare prefixes of `other` and
    /// additionally require `self` not to be older than `other`.
    pub fn is_successor(&self, other: &Version, constraint: Constraint) -> bool {
        match constraint {
            Constraint::None => self > other,
            Constraint::Auto => {
                if !other.release.is_subsequence(&self.release) {
                    return false;
                }
                match (&other.branch, &self.branch) {
                    (Some(o), Some(s)) if !o.is_subsequence(s) => return false,
                    (Some(_), None) => return false,
                    _ => {}
                }
                match (&other.timestamp, &self.timestamp) {
                    (Some(o), Some(s)) if o != s => return false,
                    (Some(_), None) => return false,
                    _ => {}
                }
                true
            }
            Constraint::Release => other.release.is_subsequence(&self.release) && self >= other,
            Constraint::ReleaseMajor => other.release.is_same_major(&self.release) && self >= other,
            Constraint::ReleaseMinor => other.release.is_same_minor(&self.release) && self >= other,
            Constraint::Branch | Constraint::BranchMajor | Constraint::BranchMinor => {
                if self.release != other.release {
                    return false;
                }
                let prefix_ok = match (&other.branch, &self.branch) {
                    (None, _) => true,
                    (Some(_), None) => false,
                    (Some(o), Some(s)) => match constraint {
                        Constraint::BranchMajor => o.is_same_major(s),
                        Constraint::BranchMinor => o.is_same_minor(s),
                        _ => o.is_subsequence(s),
                    },
                };
                prefix_ok && self >= other
            }
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.release == other.release
            && self.branch == other.branch
            && self.timestamp == other.timestamp
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.release.hash(state);
        self.branch.hash(state);
        self.timestamp.hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // Option orders None first, which is what an absent component needs.
        self.release
            .cmp(&other.release)
            .then_with(|| self.branch.cmp(&other.branch))
            .then_with(|| self.timestamp.cmp(&other.timestamp))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.release)?;

        if let Some(build_release) = &self.build_release {
            write!(f, ",{}", build_release)?;
        }

        if let Some(branch) = &self.branch {
            write!(f, "-{}", branch)?;
        }

        if let Some(timestamp) = &self.timestamp {
            write!(f, ":{}", timestamp)?;
        }

        Ok(())
    }
}

impl FromStr for Version {
    type Err = FmriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// An FMRI (Fault Management Resource Identifier)
///
/// An FMRI is a unique identifier for a package in the IPS system.
/// It follows the format: pkg://publisher/package_name@version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fmri {
    /// The scheme (e.g., pkg)
    pub scheme: String,
    /// The publisher (e.g., openindiana.org)
    pub publisher: Option<String>,
    /// The package name (e.g., web/server/nginx)
    pub name: String,
    /// The version
    pub version: Option<Version>,
}

impl Fmri {
    /// Create a new FMRI with the given name
    pub fn new(name: &str) -> Self {
        Fmri {
            scheme: "pkg".to_string(),
            publisher: None,
            name: name.to_string(),
            version: None,
        }
    }

    /// Create a new FMRI with the given name and version
    pub fn with_version(name: &str, version: Version) -> Self {
        Fmri {
            scheme: "pkg".to_string(),
            publisher: None,
            name: name.to_string(),
            version: Some(version),
        }
    }

    /// Create a new FMRI with the given publisher, name, and version
    pub fn with_publisher(publisher: &str, name: &str, version: Option<Version>) -> Self {
        Fmri {
            scheme: "pkg".to_string(),
            publisher: Some(publisher.to_string()),
            name: name.to_string(),
            version,
        }
    }

    /// Get the stem of the FMRI (the package name without version)
    pub fn stem(&self) -> &str {
        &self.name
    }

    /// Get the version of the FMRI as a string
    pub fn version(&self) -> String {
        match &self.version {
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }

    /// Both FMRIs name the same package, regardless of version or publisher.
    pub fn is_same_pkg(&self, other: &Fmri) -> bool {
        self.name == other.name
    }

    /// True if `self` names the same package as `other` at the same or a
    /// newer version. An unversioned `other` is succeeded by any version.
    pub fn is_successor(&self, other: &Fmri) -> bool {
        if !self.is_same_pkg(other) {
            return false;
        }
        match (&self.version, &other.version) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(mine), Some(theirs)) => mine >= theirs,
        }
    }

    /// Compare the versions of two FMRIs; an absent version sorts first.
    pub fn version_cmp(&self, other: &Fmri) -> Ordering {
        self.version.cmp(&other.version)
    }

    /// Parse an FMRI string into an Fmri
    ///
    /// The FMRI string should be in the format: \[scheme://\]\[publisher/\]name[@version]
    pub fn parse(fmri_str: &str) -> Result<Self, FmriError> {
        let mut fmri = Fmri::new("");

        let (name_part, version) = match fmri_str.split_once('@') {
            Some((name, version)) => (name, Some(version)),
            None => (fmri_str, None),
        };
        if let Some(version) = version {
            if version.contains('@') {
                return Err(FmriError::InvalidFormat(fmri_str.to_string()));
            }
            fmri.version = Some(Version::parse(version)?);
        }

        if let Some(scheme_end) = name_part.find("://") {
            fmri.scheme = name_part[0..scheme_end].to_string();
            let rest = &name_part[scheme_end + 3..];
            match rest.split_once('/') {
                Some((publisher, name)) => {
                    if !publisher.is_empty() {
                        fmri.publisher = Some(publisher.to_string());
                    }
                    fmri.name = name.to_string();
                }
                None => fmri.name = rest.to_string(),
            }
        } else if let Some(scheme_end) = name_part.find(":/") {
            fmri.scheme = name_part[0..scheme_end].to_string();
            fmri.name = name_part[scheme_end + 2..].to_string();
        } else {
            fmri.name = name_part.trim_start_matches('/').to_string();
        }

        if fmri.name.is_empty() {
            return Err(FmriError::InvalidFormat(fmri_str.to_string()));
        }

        Ok(fmri)
    }
}

impl fmt::Display for Fmri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // pkg://publisher/name when a publisher is known, pkg:/name otherwise
        if let Some(publisher) = &self.publisher {
            write!(f, "{}://{}/", self.scheme, publisher)?;
        } else {
            write!(f, "{}:/", self.scheme)?;
        }

        write!(f, "{}", self.name)?;

        if let Some(version) = &self.version {
            write!(f, "@{}", version)?;
        }

        Ok(())
    }
}

impl FromStr for Fmri {
    type Err = FmriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
