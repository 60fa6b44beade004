//! Content hashes and fingerprint combining.
//!
//! All digests in the engine are Blake3. A [`ContentHash`] is tagged with
//! its algorithm so that the well-known marker hashes (absent, untracked,
//! empty) can never collide with real content. Fingerprints are built with
//! [`FingerprintHasher`], which appends *typed, named* fields to a rolling
//! digest; the append order is contractual and defines the cache key.

use std::{fmt, str::FromStr};

use color_eyre::{Report, Result, eyre::bail};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Algorithm tag carried by every [`ContentHash`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum HashAlgorithm {
    /// A real Blake3 digest of file content.
    Blake3,
    /// A distinguished marker digest with no corresponding content.
    Marker,
}

impl HashAlgorithm {
    fn prefix(self) -> &'static str {
        match self {
            Self::Blake3 => "b3",
            Self::Marker => "mk",
        }
    }
}

/// A tagged content digest.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    digest: [u8; 32],
}

impl ContentHash {
    /// The content of a path that does not exist.
    pub const ABSENT_FILE: Self = Self::marker(1);

    /// The content of a file under a mount that is not hashable. Reading
    /// such a file into a fingerprint is always an error.
    pub const UNTRACKED_FILE: Self = Self::marker(2);

    /// The content of a zero-length file.
    pub const EMPTY_FILE: Self = Self::marker(3);

    const fn marker(tag: u8) -> Self {
        let mut digest = [0u8; 32];
        digest[31] = tag;
        Self {
            algorithm: HashAlgorithm::Marker,
            digest,
        }
    }

    /// Hash a buffer of real content.
    pub fn of_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        if buffer.is_empty() {
            return Self::EMPTY_FILE;
        }
        Self {
            algorithm: HashAlgorithm::Blake3,
            digest: *blake3::hash(buffer).as_bytes(),
        }
    }

    /// Wrap a precomputed Blake3 digest.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self {
            algorithm: HashAlgorithm::Blake3,
            digest,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn is_absent(&self) -> bool {
        *self == Self::ABSENT_FILE
    }

    pub fn is_untracked(&self) -> bool {
        *self == Self::UNTRACKED_FILE
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.prefix(), hex::encode(self.digest))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ABSENT_FILE => write!(f, "ContentHash(absent)"),
            Self::UNTRACKED_FILE => write!(f, "ContentHash(untracked)"),
            Self::EMPTY_FILE => write!(f, "ContentHash(empty)"),
            _ => write!(f, "ContentHash({self})"),
        }
    }
}

impl FromStr for ContentHash {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self> {
        let Some((prefix, rest)) = s.split_once(':') else {
            bail!("content hash missing algorithm prefix: {s:?}");
        };
        let algorithm = match prefix {
            "b3" => HashAlgorithm::Blake3,
            "mk" => HashAlgorithm::Marker,
            other => bail!("unknown content hash algorithm: {other:?}"),
        };
        let bytes = hex::decode(rest)?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| color_eyre::eyre::eyre!("content hash digest is not 32 bytes"))?;
        Ok(Self { algorithm, digest })
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! fingerprint_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// The all-zero digest.
            pub const ZERO: Self = Self([0u8; 32]);

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = Report;

            fn from_str(s: &str) -> Result<Self> {
                let bytes = hex::decode(s)?;
                let digest: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| color_eyre::eyre::eyre!("digest is not 32 bytes"))?;
                Ok(Self(digest))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fingerprint_newtype! {
    /// Digest of a pip's declared intent plus salts and configuration bits.
    /// Keys the first phase of cache lookup.
    WeakFingerprint
}

fingerprint_newtype! {
    /// Digest over the weak fingerprint, the path-set content hash, and the
    /// typed observations in path-set order. Keys the second phase.
    StrongFingerprint
}

fingerprint_newtype! {
    /// Digest of a pip's static description, computed when the pip is added
    /// to the graph.
    StaticFingerprint
}

fingerprint_newtype! {
    /// Digest of a directory's membership as seen by an enumeration mode.
    ///
    /// The zero value is canonical for "absent or empty": callers translate
    /// it into an absent-path probe so that a missing directory and an empty
    /// one fingerprint identically.
    DirectoryFingerprint
}

fingerprint_newtype! {
    /// Digest identifying the serialized form of a path set in the cache.
    PathSetHash
}

/// Rolling digest over typed, named fields.
///
/// Every append writes a field-kind tag, the field name, and the value, so
/// two fingerprints agree only if the same fields were appended with the
/// same names in the same order. The order is part of the cache contract.
pub struct FingerprintHasher {
    hasher: blake3::Hasher,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    fn field(&mut self, kind: u8, name: &str) {
        self.hasher.update(&[kind]);
        self.hasher.update(name.as_bytes());
        self.hasher.update(&[0]);
    }

    pub fn add_str(&mut self, name: &str, value: &str) -> &mut Self {
        self.field(b's', name);
        self.hasher.update(&(value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn add_u64(&mut self, name: &str, value: u64) -> &mut Self {
        self.field(b'i', name);
        self.hasher.update(&value.to_le_bytes());
        self
    }

    pub fn add_hash(&mut self, name: &str, value: &ContentHash) -> &mut Self {
        self.field(b'h', name);
        self.hasher.update(&[match value.algorithm() {
            HashAlgorithm::Blake3 => 0,
            HashAlgorithm::Marker => 1,
        }]);
        self.hasher.update(value.digest());
        self
    }

    pub fn add_digest(&mut self, name: &str, value: &[u8; 32]) -> &mut Self {
        self.field(b'd', name);
        self.hasher.update(value);
        self
    }

    /// Append a path in its expanded textual form.
    pub fn add_path(&mut self, name: &str, expanded: &str) -> &mut Self {
        self.field(b'p', name);
        self.hasher.update(&(expanded.len() as u64).to_le_bytes());
        self.hasher.update(expanded.as_bytes());
        self
    }

    /// Append a homogeneous collection. The element writer runs once per
    /// element; the element count is part of the digest so that adjacent
    /// collections cannot alias.
    pub fn add_collection<T>(
        &mut self,
        name: &str,
        items: impl IntoIterator<Item = T>,
        mut each: impl FnMut(&mut Self, T),
    ) -> &mut Self {
        self.field(b'c', name);
        let mut count: u64 = 0;
        for item in items {
            each(self, item);
            count += 1;
        }
        self.add_u64("len", count);
        self
    }

    pub fn finish(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}
