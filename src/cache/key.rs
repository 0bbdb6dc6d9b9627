//! Cache key derivation.
//!
//! Every key is a SHA-256 over a canonical byte layout: one cache-format
//! version byte, one key-kind byte, then length-prefixed fields (u64 little
//! endian length, then the field bytes). Strings are UTF-8; lists are a
//! length-prefixed count followed by their elements; maps are encoded as
//! lists sorted by key. Nothing here relies on a serializer's defaults: the
//! layout is the compatibility contract, and bumping it is a cache-format
//! version change.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::manifest::{Language, Manifest};
use crate::toolchain::CompilerInfo;

/// Bumped whenever the canonical byte layout changes.
pub const CACHE_FORMAT_VERSION: u8 = 1;

/// Discriminates the hash domains so an object key can never collide with an
/// artifact key for byte-identical inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Object = 1,
    Artifact = 2,
    HeaderDiscovery = 3,
}

/// A fixed-width content hash, displayed as 64 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    pub fn from_hex(s: &str) -> Result<Self, String> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("invalid cache key: expected 64 hex chars, got `{s}`"));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16).unwrap() as u8;
            let lo = (chunk[1] as char).to_digit(16).unwrap() as u8;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }

    /// Shard prefix for on-disk layout: (`aa`, rest-of-hash).
    pub fn shard(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[..2].to_string(), hex[2..].to_string())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for CacheKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_hex()
    }
}

/// Incremental hasher producing a [`CacheKey`] over the canonical layout.
pub struct KeyHasher {
    hasher: Sha256,
}

impl KeyHasher {
    pub fn new(kind: KeyKind) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([CACHE_FORMAT_VERSION, kind as u8]);
        Self { hasher }
    }

    pub fn field_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    pub fn field_str(&mut self, s: &str) {
        self.field_bytes(s.as_bytes());
    }

    pub fn field_count(&mut self, n: usize) {
        self.hasher.update((n as u64).to_le_bytes());
    }

    pub fn field_str_list<'a>(&mut self, items: impl ExactSizeIterator<Item = &'a str>) {
        self.field_count(items.len());
        for item in items {
            self.field_str(item);
        }
    }

    pub fn field_map(&mut self, map: &BTreeMap<String, String>) {
        self.field_count(map.len());
        for (key, value) in map {
            self.field_str(key);
            self.field_str(value);
        }
    }

    pub fn finish(self) -> CacheKey {
        CacheKey(self.hasher.finalize().into())
    }
}

/// Normalize a path for hashing: absolute where possible, `/`-separated.
pub fn normalize_path(path: &Path) -> String {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let text = canonical.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        text.into_owned()
    } else {
        text.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

fn compiler_identity(hasher: &mut KeyHasher, compiler: &CompilerInfo) {
    hasher.field_str(&compiler.name);
    hasher.field_str(&compiler.version);
    hasher.field_str(&compiler.target);
}

/// The header-independent portion of an object key. Computable at plan time;
/// doubles as the lookup key for header-discovery records.
pub fn compile_base_key(
    source_bytes: &[u8],
    include_dirs: &[String],
    compiler: &CompilerInfo,
    flags: &[String],
    language: Language,
    traits: &BTreeMap<String, String>,
) -> CacheKey {
    let mut hasher = KeyHasher::new(KeyKind::HeaderDiscovery);
    hasher.field_bytes(source_bytes);
    hasher.field_str_list(include_dirs.iter().map(String::as_str));
    compiler_identity(&mut hasher, compiler);
    hasher.field_str_list(flags.iter().map(String::as_str));
    hasher.field_str(&language.to_string());
    hasher.field_map(traits);
    hasher.finish()
}

/// Final object key: the base key plus the bytes of every public header the
/// translation unit can transitively reach (the accurate discovered set when
/// one is recorded, the conservative all-public-headers set otherwise).
/// Header entries must be pre-sorted by normalized path.
pub fn object_key(base: &CacheKey, headers: &[(String, Vec<u8>)]) -> CacheKey {
    let mut hasher = KeyHasher::new(KeyKind::Object);
    hasher.field_bytes(base.as_bytes());
    hasher.field_count(headers.len());
    for (path, bytes) in headers {
        hasher.field_str(path);
        hasher.field_bytes(bytes);
    }
    hasher.finish()
}

/// Artifact key over the manifest canonical form, the sorted object keys
/// participating in the link, the link flag vector, the linker identity, and
/// the artifact keys of each directly linked library dependency.
pub fn artifact_key(
    manifest: &Manifest,
    object_keys: &[CacheKey],
    link_flags: &[String],
    linker: &CompilerInfo,
    dep_artifact_keys: &[CacheKey],
) -> CacheKey {
    let mut sorted_objects = object_keys.to_vec();
    sorted_objects.sort();

    let mut hasher = KeyHasher::new(KeyKind::Artifact);
    hasher.field_bytes(&manifest_canonical_form(manifest));
    hasher.field_count(sorted_objects.len());
    for key in &sorted_objects {
        hasher.field_bytes(key.as_bytes());
    }
    hasher.field_str_list(link_flags.iter().map(String::as_str));
    compiler_identity(&mut hasher, linker);
    hasher.field_count(dep_artifact_keys.len());
    for key in dep_artifact_keys {
        hasher.field_bytes(key.as_bytes());
    }
    hasher.finish()
}

/// Deterministic byte encoding of a manifest: same framing as the hash
/// layout, fields in declaration order, maps sorted by key.
pub fn manifest_canonical_form(manifest: &Manifest) -> Vec<u8> {
    let mut enc = Encoder::default();
    enc.str(&manifest.name);
    enc.str(&manifest.version.to_string());
    enc.str(&manifest.package_type.to_string());
    enc.str(&manifest.language.to_string());
    enc.count(manifest.sources.len());
    for glob in &manifest.sources {
        enc.str(glob);
    }
    for flags in [&manifest.cflags, &manifest.ldflags] {
        enc.count(flags.len());
        for (family, value) in flags {
            enc.str(family.as_str());
            enc.str(value);
        }
    }
    enc.count(manifest.traits.len());
    for (key, value) in &manifest.traits {
        enc.str(key);
        enc.str(value);
    }
    enc.count(manifest.requires.len());
    for (name, constraint) in &manifest.requires {
        enc.str(name);
        enc.str(&constraint.to_string());
    }
    enc.out
}

#[derive(Default)]
struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    fn str(&mut self, s: &str) {
        self.out.extend_from_slice(&(s.len() as u64).to_le_bytes());
        self.out.extend_from_slice(s.as_bytes());
    }

    fn count(&mut self, n: usize) {
        self.out.extend_from_slice(&(n as u64).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::Manifest;
    use crate::toolchain::CompilerInfo;

    fn compiler() -> CompilerInfo {
        CompilerInfo {
            name: "gcc".into(),
            version: "13.2.0".into(),
            target: "x86_64-linux-gnu".into(),
        }
    }

    fn base(source: &[u8], flags: &[&str]) -> CacheKey {
        compile_base_key(
            source,
            &["/p/include".to_string()],
            &compiler(),
            &flags.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            Language::C,
            &BTreeMap::new(),
        )
    }

    #[test]
    fn hex_round_trip() {
        let key = base(b"int main(){}", &["-O2"]);
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(CacheKey::from_hex(&hex).unwrap(), key);
        assert!(CacheKey::from_hex("xyz").is_err());
    }

    #[test]
    fn shard_splits_two_chars() {
        let key = base(b"x", &[]);
        let (prefix, rest) = key.shard();
        assert_eq!(prefix.len(), 2);
        assert_eq!(rest.len(), 62);
        assert_eq!(format!("{prefix}{rest}"), key.to_hex());
    }

    #[test]
    fn identical_inputs_identical_keys() {
        assert_eq!(base(b"int main(){}", &["-O2"]), base(b"int main(){}", &["-O2"]));
    }

    #[test]
    fn any_perturbation_changes_key() {
        let reference = base(b"int main(){}", &["-O2"]);
        assert_ne!(reference, base(b"int main(){ }", &["-O2"]));
        assert_ne!(reference, base(b"int main(){}", &["-O3"]));

        let other_compiler = compile_base_key(
            b"int main(){}",
            &["/p/include".to_string()],
            &CompilerInfo {
                version: "13.3.0".into(),
                ..compiler()
            },
            &["-O2".to_string()],
            Language::C,
            &BTreeMap::new(),
        );
        assert_ne!(reference, other_compiler);

        let mut traits = BTreeMap::new();
        traits.insert("profile".to_string(), "release".to_string());
        let with_traits = compile_base_key(
            b"int main(){}",
            &["/p/include".to_string()],
            &compiler(),
            &["-O2".to_string()],
            Language::C,
            &traits,
        );
        assert_ne!(reference, with_traits);
    }

    #[test]
    fn flag_order_is_significant() {
        assert_ne!(base(b"x", &["-O2", "-g"]), base(b"x", &["-g", "-O2"]));
    }

    #[test]
    fn header_bytes_feed_object_key() {
        let b = base(b"x", &[]);
        let clean = object_key(&b, &[("lib/api.h".into(), b"#define A 1".to_vec())]);
        let touched = object_key(&b, &[("lib/api.h".into(), b"#define A 2".to_vec())]);
        assert_ne!(clean, touched);
        assert_eq!(
            clean,
            object_key(&b, &[("lib/api.h".into(), b"#define A 1".to_vec())])
        );
    }

    #[test]
    fn framing_resists_concatenation_ambiguity() {
        // ("ab", "c") must not collide with ("a", "bc")
        let mut one = KeyHasher::new(KeyKind::Object);
        one.field_str("ab");
        one.field_str("c");
        let mut two = KeyHasher::new(KeyKind::Object);
        two.field_str("a");
        two.field_str("bc");
        assert_ne!(one.finish(), two.finish());
    }

    #[test]
    fn kind_byte_separates_domains() {
        let mut a = KeyHasher::new(KeyKind::Object);
        a.field_str("same");
        let mut b = KeyHasher::new(KeyKind::Artifact);
        b.field_str("same");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn manifest_canonical_form_is_stable() {
        let text = b"name: demo\nversion: 1.0.0\ntype: library\n";
        let a = Manifest::parse(text).unwrap();
        let b = Manifest::parse(text).unwrap();
        assert_eq!(manifest_canonical_form(&a), manifest_canonical_form(&b));

        let other =
            Manifest::parse(b"name: demo\nversion: 1.0.1\ntype: library\n").unwrap();
        assert_ne!(manifest_canonical_form(&a), manifest_canonical_form(&other));
    }
}
