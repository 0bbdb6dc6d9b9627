//! Semantic versions.
//!
//! Versions order by SemVer precedence: the (major, minor, patch) triple
//! first, then pre-release identifiers. A pre-release sorts below its release
//! counterpart. Build metadata never participates in ordering or equality.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("invalid version `{0}`: expected major.minor.patch")]
    Malformed(String),

    #[error("invalid version `{input}`: {part} is not a non-negative integer")]
    BadComponent { input: String, part: &'static str },

    #[error("invalid version `{0}`: empty pre-release or build identifier")]
    EmptyIdentifier(String),

    #[error("invalid version `{input}`: illegal character in `{identifier}`")]
    BadIdentifier { input: String, identifier: String },
}

/// A semantic version: `major.minor.patch[-pre][+build]`.
///
/// Numeric components with leading zeros are accepted on input and
/// normalized away when formatting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
    pub build: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
            build: None,
        }
    }

    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let s = input.trim();

        let (core, build) = match s.split_once('+') {
            Some((c, b)) => (c, Some(b)),
            None => (s, None),
        };
        let (triple, pre) = match core.split_once('-') {
            Some((t, p)) => (t, Some(p)),
            None => (core, None),
        };

        let mut parts = triple.split('.');
        let (major, minor, patch) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c), None) => (a, b, c),
            _ => return Err(VersionError::Malformed(input.to_string())),
        };

        let number = |text: &str, part: &'static str| -> Result<u64, VersionError> {
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(VersionError::BadComponent {
                    input: input.to_string(),
                    part,
                });
            }
            text.parse().map_err(|_| VersionError::BadComponent {
                input: input.to_string(),
                part,
            })
        };

        for tag in [pre, build].into_iter().flatten() {
            for ident in tag.split('.') {
                if ident.is_empty() {
                    return Err(VersionError::EmptyIdentifier(input.to_string()));
                }
                if !ident
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-')
                {
                    return Err(VersionError::BadIdentifier {
                        input: input.to_string(),
                        identifier: ident.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            major: number(major, "major")?,
            minor: number(minor, "minor")?,
            patch: number(patch, "patch")?,
            pre: pre.map(str::to_string),
            build: build.map(str::to_string),
        })
    }

    /// The (major, minor, patch) triple with pre-release and build stripped.
    pub fn base(&self) -> Version {
        Version::new(self.major, self.minor, self.patch)
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    /// True when both versions share the same (major, minor, patch) triple.
    pub fn same_base(&self, other: &Version) -> bool {
        (self.major, self.minor, self.patch) == (other.major, other.minor, other.patch)
    }
}

/// SemVer pre-release comparison: release above pre-release; identifiers
/// compared field-wise, numeric before alphanumeric, fewer fields lower.
fn cmp_pre(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let xs: Vec<&str> = a.split('.').collect();
            let ys: Vec<&str> = b.split('.').collect();
            for (x, y) in xs.iter().zip(ys.iter()) {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(xn), Ok(yn)) => xn.cmp(&yn),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| cmp_pre(self.pre.as_deref(), other.pre.as_deref()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.major.hash(state);
        self.minor.hash(state);
        self.patch.hash(state);
        // Mirror `cmp_pre`: numeric identifiers hash by value so equal
        // versions hash equally even with leading zeros.
        if let Some(pre) = &self.pre {
            for ident in pre.split('.') {
                match ident.parse::<u64>() {
                    Ok(n) => {
                        0u8.hash(state);
                        n.hash(state);
                    }
                    Err(_) => {
                        1u8.hash(state);
                        ident.hash(state);
                    }
                }
            }
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Version::parse(&s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}
