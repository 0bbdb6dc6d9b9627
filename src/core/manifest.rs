//! Package manifests.
//!
//! A package is described by a `package.yml` at its root (`config.yaml` is
//! accepted as a historical alias). Required keys: `name`, `version`, `type`.
//! Requirement values may be a constraint string or a structured map with a
//! `path:` or `git:` key; both normalize to [`VersionConstraint`]. Unknown
//! top-level keys are collected as warnings, never errors.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::constraint::{ConstraintError, VersionConstraint};
use crate::core::version::{Version, VersionError};

/// Primary manifest file name, with its historical alias.
pub const MANIFEST_NAMES: [&str; 2] = ["package.yml", "config.yaml"];

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(@[a-z0-9_-]+/)?[a-z0-9_-]+$").unwrap());

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no {} or {} found in {}", MANIFEST_NAMES[0], MANIFEST_NAMES[1], dir.display())]
    NotFound { dir: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest syntax error: {0}")]
    Syntax(#[from] serde_yaml::Error),

    #[error("invalid package name `{0}`")]
    InvalidName(String),

    #[error("invalid version: {0}")]
    InvalidVersion(#[from] VersionError),

    #[error("unknown package type `{0}` (expected `library` or `application`)")]
    UnknownType(String),

    #[error("unknown language `{0}` (expected `c` or `cpp`)")]
    UnknownLanguage(String),

    #[error("requirement `{name}`: {source}")]
    InvalidRequirement {
        name: String,
        #[source]
        source: ConstraintError,
    },

    #[error("requirement `{0}` must name either a version, a path or a git ref")]
    AmbiguousRequirement(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Library,
    Application,
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Library => write!(f, "library"),
            Self::Application => write!(f, "application"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::C => write!(f, "c"),
            Self::Cpp => write!(f, "cpp"),
        }
    }
}

/// Compiler families that may key flag maps in a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerFamily {
    Gcc,
    Clang,
}

impl CompilerFamily {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "gcc" | "g++" | "gxx" => Some(Self::Gcc),
            "clang" | "clang++" | "clangxx" => Some(Self::Clang),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gcc => "gcc",
            Self::Clang => "clang",
        }
    }
}

impl fmt::Display for CompilerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flag-overlay merged in when the variant's name matches an active trait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variant {
    pub cflags: BTreeMap<CompilerFamily, String>,
    pub ldflags: BTreeMap<CompilerFamily, String>,
}

/// A non-fatal observation made while parsing a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestWarning {
    UnknownKey(String),
    UnknownFlagFamily { section: &'static str, key: String },
}

impl fmt::Display for ManifestWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey(key) => write!(f, "unknown manifest key `{key}`"),
            Self::UnknownFlagFamily { section, key } => {
                write!(f, "unknown compiler family `{key}` in `{section}`")
            }
        }
    }
}

/// An immutable, validated package manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub version: Version,
    pub package_type: PackageType,
    pub language: Language,
    pub sources: Vec<String>,
    pub cflags: BTreeMap<CompilerFamily, String>,
    pub ldflags: BTreeMap<CompilerFamily, String>,
    pub traits: BTreeMap<String, String>,
    pub variants: BTreeMap<String, Variant>,
    pub requires: BTreeMap<String, VersionConstraint>,
    warnings: Vec<ManifestWarning>,
}

/// Default source globs: C and C++ translation units under `src/`.
pub fn default_source_globs() -> Vec<String> {
    ["c", "cc", "cpp", "cxx"]
        .iter()
        .map(|ext| format!("src/**/*.{ext}"))
        .collect()
}

// Raw serde shapes; validation happens in `Manifest::parse`.

#[derive(Deserialize)]
struct RawManifest {
    name: String,
    version: String,
    #[serde(rename = "type")]
    package_type: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    sources: Option<Vec<String>>,
    #[serde(default)]
    cflags: BTreeMap<String, String>,
    #[serde(default)]
    ldflags: BTreeMap<String, String>,
    #[serde(default)]
    traits: BTreeMap<String, String>,
    #[serde(default)]
    variants: BTreeMap<String, RawVariant>,
    #[serde(default)]
    requires: BTreeMap<String, RequirementSpec>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Deserialize, Default)]
struct RawVariant {
    #[serde(default)]
    cflags: BTreeMap<String, String>,
    #[serde(default)]
    ldflags: BTreeMap<String, String>,
}

/// A requirement value: a constraint string, or the structured map form
/// found in historical manifests.
#[derive(Deserialize)]
#[serde(untagged)]
enum RequirementSpec {
    Spec(String),
    Detailed {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        git: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
}

impl RequirementSpec {
    fn into_constraint(self, name: &str) -> Result<VersionConstraint, ManifestError> {
        let parse = |spec: &str| {
            VersionConstraint::parse(spec).map_err(|source| ManifestError::InvalidRequirement {
                name: name.to_string(),
                source,
            })
        };
        match self {
            Self::Spec(spec) => parse(&spec),
            Self::Detailed {
                path: Some(path),
                git: None,
                version: None,
            } => Ok(VersionConstraint::LocalPath(path)),
            Self::Detailed {
                path: None,
                git: Some(git_ref),
                version: None,
            } => Ok(VersionConstraint::GitRef(git_ref)),
            Self::Detailed {
                path: None,
                git: None,
                version: Some(spec),
            } => parse(&spec),
            Self::Detailed { .. } => Err(ManifestError::AmbiguousRequirement(name.to_string())),
        }
    }
}

fn flag_map(
    raw: BTreeMap<String, String>,
    section: &'static str,
    warnings: &mut Vec<ManifestWarning>,
) -> BTreeMap<CompilerFamily, String> {
    let mut out = BTreeMap::new();
    for (key, value) in raw {
        match CompilerFamily::from_key(&key) {
            Some(family) => {
                let entry: &mut String = out.entry(family).or_default();
                if entry.is_empty() {
                    *entry = value;
                } else {
                    entry.push(' ');
                    entry.push_str(&value);
                }
            }
            None => warnings.push(ManifestWarning::UnknownFlagFamily { section, key }),
        }
    }
    out
}

impl Manifest {
    /// Parse and validate manifest bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_yaml::from_slice(bytes)?;
        let mut warnings = Vec::new();

        if !NAME_RE.is_match(&raw.name) {
            return Err(ManifestError::InvalidName(raw.name));
        }
        let version = Version::parse(&raw.version)?;

        let package_type = match raw.package_type.to_ascii_lowercase().as_str() {
            "library" => PackageType::Library,
            "application" => PackageType::Application,
            other => return Err(ManifestError::UnknownType(other.to_string())),
        };

        let language = match raw.language.as_deref() {
            Some(lang) => match lang.to_ascii_lowercase().as_str() {
                "c" => Language::C,
                "cpp" | "cxx" | "c++" => Language::Cpp,
                other => return Err(ManifestError::UnknownLanguage(other.to_string())),
            },
            // Inferred default: applications are C, libraries are C++.
            None => match package_type {
                PackageType::Application => Language::C,
                PackageType::Library => Language::Cpp,
            },
        };

        let sources = match raw.sources {
            Some(globs) if !globs.is_empty() => globs,
            _ => default_source_globs(),
        };

        let cflags = flag_map(raw.cflags, "cflags", &mut warnings);
        let ldflags = flag_map(raw.ldflags, "ldflags", &mut warnings);

        let mut variants = BTreeMap::new();
        for (name, raw_variant) in raw.variants {
            variants.insert(
                name,
                Variant {
                    cflags: flag_map(raw_variant.cflags, "variant cflags", &mut warnings),
                    ldflags: flag_map(raw_variant.ldflags, "variant ldflags", &mut warnings),
                },
            );
        }

        let mut requires = BTreeMap::new();
        for (name, spec) in raw.requires {
            if !NAME_RE.is_match(&name) {
                return Err(ManifestError::InvalidName(name));
            }
            let constraint = spec.into_constraint(&name)?;
            requires.insert(name, constraint);
        }

        for key in raw.unknown.keys() {
            warnings.push(ManifestWarning::UnknownKey(key.clone()));
        }

        Ok(Self {
            name: raw.name,
            version,
            package_type,
            language,
            sources,
            cflags,
            ldflags,
            traits: raw.traits,
            variants,
            requires,
            warnings,
        })
    }

    /// Load a manifest from a package root, probing `package.yml` then
    /// `config.yaml`.
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        for name in MANIFEST_NAMES {
            let path = dir.join(name);
            if path.exists() {
                let bytes = std::fs::read(&path).map_err(|source| ManifestError::Io {
                    path: path.clone(),
                    source,
                })?;
                return Self::parse(&bytes);
            }
        }
        Err(ManifestError::NotFound {
            dir: dir.to_path_buf(),
        })
    }

    pub fn warnings(&self) -> &[ManifestWarning] {
        &self.warnings
    }

    /// The package name without its organization prefix.
    pub fn bare_name(&self) -> &str {
        match self.name.split_once('/') {
            Some((_org, bare)) => bare,
            None => &self.name,
        }
    }

    /// Compile flags for one family, split into separate arguments, with the
    /// overlays of active variants appended in variant-name order.
    pub fn compile_flags(&self, family: CompilerFamily, active_traits: &BTreeMap<String, String>) -> Vec<String> {
        let mut flags: Vec<String> = split_flags(self.cflags.get(&family));
        for (name, variant) in &self.variants {
            if active_traits.contains_key(name) {
                flags.extend(split_flags(variant.cflags.get(&family)));
            }
        }
        flags
    }

    /// Linker flags for one family, overlaid the same way as compile flags.
    pub fn link_flags(&self, family: CompilerFamily, active_traits: &BTreeMap<String, String>) -> Vec<String> {
        let mut flags: Vec<String> = split_flags(self.ldflags.get(&family));
        for (name, variant) in &self.variants {
            if active_traits.contains_key(name) {
                flags.extend(split_flags(variant.ldflags.get(&family)));
            }
        }
        flags
    }
}

fn split_flags(raw: Option<&String>) -> Vec<String> {
    raw.map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
name: hello
version: 0.1.0
type: application
language: c
sources:
  - src/main.c
";

    #[test]
    fn parse_minimal() {
        let m = Manifest::parse(MINIMAL.as_bytes()).unwrap();
        assert_eq!(m.name, "hello");
        assert_eq!(m.version, Version::new(0, 1, 0));
        assert_eq!(m.package_type, PackageType::Application);
        assert_eq!(m.language, Language::C);
        assert_eq!(m.sources, vec!["src/main.c".to_string()]);
        assert!(m.warnings().is_empty());
    }

    #[test]
    fn language_inferred_from_type() {
        let app = Manifest::parse(b"name: a\nversion: 1.0.0\ntype: application\n").unwrap();
        assert_eq!(app.language, Language::C);
        let lib = Manifest::parse(b"name: l\nversion: 1.0.0\ntype: library\n").unwrap();
        assert_eq!(lib.language, Language::Cpp);
    }

    #[test]
    fn default_sources_cover_c_and_cpp() {
        let m = Manifest::parse(b"name: l\nversion: 1.0.0\ntype: library\n").unwrap();
        assert_eq!(m.sources, default_source_globs());
        assert!(m.sources.iter().any(|g| g.ends_with("*.cpp")));
    }

    #[test]
    fn requires_string_and_map_forms() {
        let text = "
name: app
version: 1.0.0
type: application
requires:
  json: '^1.2.0'
  mathlib:
    path: ../mathlib
  netlib:
    git: v2.0.0
  pinned: 1.0.0
";
        let m = Manifest::parse(text.as_bytes()).unwrap();
        assert!(matches!(m.requires["json"], VersionConstraint::Caret(_)));
        assert!(matches!(
            m.requires["mathlib"],
            VersionConstraint::LocalPath(_)
        ));
        assert!(matches!(m.requires["netlib"], VersionConstraint::GitRef(_)));
        assert!(matches!(m.requires["pinned"], VersionConstraint::Exact(_)));
    }

    #[test]
    fn org_prefixed_names() {
        let m =
            Manifest::parse(b"name: '@acme/widgets'\nversion: 1.0.0\ntype: library\n").unwrap();
        assert_eq!(m.name, "@acme/widgets");
        assert_eq!(m.bare_name(), "widgets");
        assert!(Manifest::parse(b"name: 'Bad Name'\nversion: 1.0.0\ntype: library\n").is_err());
    }

    #[test]
    fn unknown_keys_warn() {
        let m = Manifest::parse(
            b"name: x\nversion: 1.0.0\ntype: library\nfrobnicate: yes\n",
        )
        .unwrap();
        assert_eq!(
            m.warnings(),
            &[ManifestWarning::UnknownKey("frobnicate".into())]
        );
    }

    #[test]
    fn config_yaml_accepted_as_alias() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "name: legacy\nversion: 2.0.0\ntype: library\n",
        )
        .unwrap();
        let m = Manifest::load(dir.path()).unwrap();
        assert_eq!(m.name, "legacy");

        // package.yml wins when both are present
        std::fs::write(
            dir.path().join("package.yml"),
            "name: modern\nversion: 2.0.0\ntype: library\n",
        )
        .unwrap();
        let m = Manifest::load(dir.path()).unwrap();
        assert_eq!(m.name, "modern");
    }

    #[test]
    fn missing_required_key_is_error() {
        assert!(Manifest::parse(b"name: x\ntype: library\n").is_err());
        assert!(Manifest::parse(b"version: 1.0.0\ntype: library\n").is_err());
    }

    #[test]
    fn variant_flags_overlay() {
        let text = "
name: lib
version: 1.0.0
type: library
cflags:
  gcc: -O2 -Wall
variants:
  debug:
    cflags:
      gcc: -g -DDEBUG
";
        let m = Manifest::parse(text.as_bytes()).unwrap();
        let inactive = m.compile_flags(CompilerFamily::Gcc, &BTreeMap::new());
        assert_eq!(inactive, vec!["-O2", "-Wall"]);

        let mut traits = BTreeMap::new();
        traits.insert("debug".to_string(), "1".to_string());
        let active = m.compile_flags(CompilerFamily::Gcc, &traits);
        assert_eq!(active, vec!["-O2", "-Wall", "-g", "-DDEBUG"]);
    }
}
