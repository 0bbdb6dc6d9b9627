//! Version constraints.
//!
//! A constraint is a single disjunction-free predicate over versions. The
//! surface grammar accepts `=x.y.z`, `^x.y.z`, `~x.y.z`, `>=x.y.z`, `<x.y.z`,
//! a bare `x.y.z` (exact), `local:<path>` and `git:<ref>`. Adjacent `>=` and
//! `<` bounds compose into a half-open range.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::version::{Version, VersionError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintError {
    #[error("empty constraint")]
    Empty,

    #[error("invalid constraint `{0}`: {1}")]
    BadVersion(String, VersionError),

    #[error("invalid constraint `{0}`: unsupported operator combination")]
    UnsupportedCombination(String),

    #[error("invalid constraint `{0}`: `local:` requires a path")]
    EmptyLocalPath(String),

    #[error("invalid constraint `{0}`: `git:` requires a ref")]
    EmptyGitRef(String),
}

/// A predicate over concrete versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionConstraint {
    /// Exactly the given version, pre-release tag included.
    Exact(Version),
    /// `>= v`, below the next major (next minor for `0.y.z`, next patch for `0.0.z`).
    Caret(Version),
    /// `>= v`, below the next minor.
    Tilde(Version),
    GreaterOrEqual(Version),
    LessThan(Version),
    /// `>= lo` and `< hi`.
    Range { lo: Version, hi: Version },
    /// Satisfied only by the exact matching ref.
    GitRef(String),
    /// Satisfied only by a package materialized from this location.
    LocalPath(PathBuf),
}

/// Outcome of intersecting a set of constraints on one package name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intersection {
    Narrowed(VersionConstraint),
    Unsatisfiable,
}

impl VersionConstraint {
    pub fn parse(input: &str) -> Result<Self, ConstraintError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(ConstraintError::Empty);
        }

        if let Some(path) = s.strip_prefix("local:") {
            if path.is_empty() {
                return Err(ConstraintError::EmptyLocalPath(input.to_string()));
            }
            return Ok(Self::LocalPath(PathBuf::from(path)));
        }
        if let Some(git_ref) = s.strip_prefix("git:") {
            if git_ref.is_empty() {
                return Err(ConstraintError::EmptyGitRef(input.to_string()));
            }
            return Ok(Self::GitRef(git_ref.to_string()));
        }

        let tokens: Vec<&str> = s.split_whitespace().collect();
        match tokens.as_slice() {
            [one] => Self::parse_single(input, one),
            [a, b] => {
                let first = Self::parse_single(input, a)?;
                let second = Self::parse_single(input, b)?;
                match (first, second) {
                    (Self::GreaterOrEqual(lo), Self::LessThan(hi))
                    | (Self::LessThan(hi), Self::GreaterOrEqual(lo)) => Ok(Self::Range { lo, hi }),
                    _ => Err(ConstraintError::UnsupportedCombination(input.to_string())),
                }
            }
            _ => Err(ConstraintError::UnsupportedCombination(input.to_string())),
        }
    }

    fn parse_single(input: &str, token: &str) -> Result<Self, ConstraintError> {
        let version = |text: &str| {
            Version::parse(text).map_err(|e| ConstraintError::BadVersion(input.to_string(), e))
        };

        if let Some(rest) = token.strip_prefix(">=") {
            Ok(Self::GreaterOrEqual(version(rest)?))
        } else if let Some(rest) = token.strip_prefix('<') {
            Ok(Self::LessThan(version(rest)?))
        } else if let Some(rest) = token.strip_prefix('=') {
            Ok(Self::Exact(version(rest)?))
        } else if let Some(rest) = token.strip_prefix('^') {
            Ok(Self::Caret(version(rest)?))
        } else if let Some(rest) = token.strip_prefix('~') {
            Ok(Self::Tilde(version(rest)?))
        } else {
            Ok(Self::Exact(version(token)?))
        }
    }

    /// Exclusive upper bound implied by a caret constraint.
    fn caret_ceiling(v: &Version) -> Version {
        if v.major > 0 {
            Version::new(v.major + 1, 0, 0)
        } else if v.minor > 0 {
            Version::new(0, v.minor + 1, 0)
        } else {
            Version::new(0, 0, v.patch + 1)
        }
    }

    /// Lower (inclusive) and upper (exclusive) bounds for range-like
    /// constraints. `None` for Exact, GitRef and LocalPath.
    fn bounds(&self) -> Option<(Option<&Version>, Option<Version>)> {
        match self {
            Self::Caret(v) => Some((Some(v), Some(Self::caret_ceiling(v)))),
            Self::Tilde(v) => Some((Some(v), Some(Version::new(v.major, v.minor + 1, 0)))),
            Self::GreaterOrEqual(v) => Some((Some(v), None)),
            Self::LessThan(v) => Some((None, Some(v.clone()))),
            Self::Range { lo, hi } => Some((Some(lo), Some(hi.clone()))),
            Self::Exact(_) | Self::GitRef(_) | Self::LocalPath(_) => None,
        }
    }

    /// Whether a pre-release `version` may be admitted by this range
    /// constraint: only when the constraint itself carries a pre-release tag
    /// on the same (major, minor, patch) triple.
    fn admits_prerelease(&self, version: &Version) -> bool {
        let carries = |c: &Version| c.is_prerelease() && c.same_base(version);
        match self {
            Self::Caret(v) | Self::Tilde(v) | Self::GreaterOrEqual(v) | Self::LessThan(v) => {
                carries(v)
            }
            Self::Range { lo, hi } => carries(lo) || carries(hi),
            Self::Exact(_) | Self::GitRef(_) | Self::LocalPath(_) => true,
        }
    }

    /// Does this constraint admit the concrete `version`?
    ///
    /// GitRef and LocalPath constraints never admit by version number; their
    /// single implied candidate is matched by the resolver on origin instead.
    pub fn satisfies(&self, version: &Version) -> bool {
        match self {
            Self::Exact(v) => version == v,
            Self::GitRef(_) | Self::LocalPath(_) => false,
            _ => {
                if version.is_prerelease() && !self.admits_prerelease(version) {
                    return false;
                }
                let (lo, hi) = match self.bounds() {
                    Some(b) => b,
                    None => return false,
                };
                if let Some(lo) = lo {
                    if version < lo {
                        return false;
                    }
                }
                if let Some(hi) = &hi {
                    if version >= hi {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Intersect a non-empty set of constraints over the same package name.
    ///
    /// Exact, GitRef and LocalPath pin the admitted set to a single point;
    /// range constraints narrow to the tightest window. An empty window is
    /// `Unsatisfiable`.
    pub fn intersect_all(constraints: &[VersionConstraint]) -> Intersection {
        debug_assert!(!constraints.is_empty());

        // Point constraints dominate: all others must agree with the point.
        if let Some(pin) = constraints
            .iter()
            .find(|c| matches!(c, Self::GitRef(_) | Self::LocalPath(_)))
        {
            let compatible = constraints.iter().all(|c| c == pin);
            return if compatible {
                Intersection::Narrowed(pin.clone())
            } else {
                Intersection::Unsatisfiable
            };
        }
        if let Some(Self::Exact(v)) = constraints.iter().find(|c| matches!(c, Self::Exact(_))) {
            let admitted = constraints.iter().all(|c| match c {
                Self::Exact(other) => other == v,
                _ => c.satisfies(v),
            });
            return if admitted {
                Intersection::Narrowed(Self::Exact(v.clone()))
            } else {
                Intersection::Unsatisfiable
            };
        }

        // All remaining constraints are windows; fold to the tightest one.
        let mut lo: Option<Version> = None;
        let mut hi: Option<Version> = None;
        for c in constraints {
            let (c_lo, c_hi) = c.bounds().expect("point constraints handled above");
            if let Some(c_lo) = c_lo {
                if lo.as_ref().map_or(true, |cur| c_lo > cur) {
                    lo = Some(c_lo.clone());
                }
            }
            if let Some(c_hi) = c_hi {
                if hi.as_ref().map_or(true, |cur| c_hi < *cur) {
                    hi = Some(c_hi);
                }
            }
        }

        match (lo, hi) {
            (Some(lo), Some(hi)) => {
                if lo >= hi {
                    Intersection::Unsatisfiable
                } else {
                    Intersection::Narrowed(Self::Range { lo, hi })
                }
            }
            (Some(lo), None) => Intersection::Narrowed(Self::GreaterOrEqual(lo)),
            (None, Some(hi)) => Intersection::Narrowed(Self::LessThan(hi)),
            (None, None) => Intersection::Unsatisfiable,
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "={v}"),
            Self::Caret(v) => write!(f, "^{v}"),
            Self::Tilde(v) => write!(f, "~{v}"),
            Self::GreaterOrEqual(v) => write!(f, ">={v}"),
            Self::LessThan(v) => write!(f, "<{v}"),
            Self::Range { lo, hi } => write!(f, ">={lo} <{hi}"),
            Self::GitRef(r) => write!(f, "git:{r}"),
            Self::LocalPath(p) => write!(f, "local:{}", p.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn c(s: &str) -> VersionConstraint {
        VersionConstraint::parse(s).unwrap()
    }

    #[test]
    fn parse_surface_forms() {
        assert_eq!(c("=1.2.3"), VersionConstraint::Exact(v("1.2.3")));
        assert_eq!(c("1.2.3"), VersionConstraint::Exact(v("1.2.3")));
        assert_eq!(c("^1.2.3"), VersionConstraint::Caret(v("1.2.3")));
        assert_eq!(c("~1.2.3"), VersionConstraint::Tilde(v("1.2.3")));
        assert_eq!(c(">=1.2.3"), VersionConstraint::GreaterOrEqual(v("1.2.3")));
        assert_eq!(c("<2.0.0"), VersionConstraint::LessThan(v("2.0.0")));
        assert_eq!(
            c(">=1.2.3 <2.0.0"),
            VersionConstraint::Range {
                lo: v("1.2.3"),
                hi: v("2.0.0")
            }
        );
        assert_eq!(
            c("local:../mylib"),
            VersionConstraint::LocalPath(PathBuf::from("../mylib"))
        );
        assert_eq!(c("git:v1.2.3"), VersionConstraint::GitRef("v1.2.3".into()));
    }

    #[test]
    fn parse_rejects_bad_combinations() {
        assert!(VersionConstraint::parse(">=1.0.0 >=2.0.0").is_err());
        assert!(VersionConstraint::parse("^1.0.0 ~1.2.0").is_err());
        assert!(VersionConstraint::parse("").is_err());
        assert!(VersionConstraint::parse("local:").is_err());
    }

    #[test]
    fn exact_admits_only_itself() {
        let e = c("=1.2.3");
        assert!(e.satisfies(&v("1.2.3")));
        assert!(!e.satisfies(&v("1.2.4")));
        assert!(!e.satisfies(&v("1.2.3-rc.1")));
    }

    #[test]
    fn caret_windows() {
        let major = c("^1.2.3");
        assert!(major.satisfies(&v("1.2.3")));
        assert!(major.satisfies(&v("1.9.0")));
        assert!(!major.satisfies(&v("2.0.0")));
        assert!(!major.satisfies(&v("1.2.2")));

        let minor = c("^0.2.3");
        assert!(minor.satisfies(&v("0.2.9")));
        assert!(!minor.satisfies(&v("0.3.0")));

        let patch = c("^0.0.3");
        assert!(patch.satisfies(&v("0.0.3")));
        assert!(!patch.satisfies(&v("0.0.4")));
    }

    #[test]
    fn tilde_window() {
        let t = c("~1.2.3");
        assert!(t.satisfies(&v("1.2.3")));
        assert!(t.satisfies(&v("1.2.9")));
        assert!(!t.satisfies(&v("1.3.0")));
        assert!(!t.satisfies(&v("2.0.0")));
    }

    #[test]
    fn prerelease_gating() {
        // a plain caret never admits a pre-release
        assert!(!c("^1.2.3").satisfies(&v("1.3.0-beta")));
        assert!(!c("^1.2.3").satisfies(&v("1.2.3-rc.1")));
        // unless the constraint carries a pre-release on the same triple
        let pre = c("^1.2.3-alpha");
        assert!(pre.satisfies(&v("1.2.3-beta")));
        assert!(pre.satisfies(&v("1.2.3")));
        assert!(!pre.satisfies(&v("1.3.0-beta")));
    }

    #[test]
    fn intersect_narrows_windows() {
        let narrowed =
            VersionConstraint::intersect_all(&[c("^1.2.0"), c(">=1.4.0")]);
        match narrowed {
            Intersection::Narrowed(n) => {
                assert!(n.satisfies(&v("1.4.0")));
                assert!(n.satisfies(&v("1.9.9")));
                assert!(!n.satisfies(&v("1.3.9")));
                assert!(!n.satisfies(&v("2.0.0")));
            }
            Intersection::Unsatisfiable => panic!("expected a narrowed window"),
        }
    }

    #[test]
    fn intersect_detects_conflicts() {
        assert_eq!(
            VersionConstraint::intersect_all(&[c("=1.0.0"), c("=2.0.0")]),
            Intersection::Unsatisfiable
        );
        assert_eq!(
            VersionConstraint::intersect_all(&[c("^1.0.0"), c("^2.0.0")]),
            Intersection::Unsatisfiable
        );
        assert_eq!(
            VersionConstraint::intersect_all(&[c("<1.0.0"), c(">=1.0.0")]),
            Intersection::Unsatisfiable
        );
    }

    #[test]
    fn intersect_exact_against_window() {
        assert_eq!(
            VersionConstraint::intersect_all(&[c("^1.0.0"), c("=1.5.0")]),
            Intersection::Narrowed(VersionConstraint::Exact(v("1.5.0")))
        );
        assert_eq!(
            VersionConstraint::intersect_all(&[c("~1.0.0"), c("=1.5.0")]),
            Intersection::Unsatisfiable
        );
    }

    #[test]
    fn intersect_pins() {
        let a = c("local:../lib");
        assert_eq!(
            VersionConstraint::intersect_all(&[a.clone(), a.clone()]),
            Intersection::Narrowed(a.clone())
        );
        assert_eq!(
            VersionConstraint::intersect_all(&[a, c("^1.0.0")]),
            Intersection::Unsatisfiable
        );
    }
}
