// src/types.rs
//
// Common shared types: identifiers, timestamps, observations and content digests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Millisecond timestamp since Unix epoch.
pub type TimestampMs = i64;

/// Current wall-clock time in milliseconds since Unix epoch.
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

/// Identifier of a recorded run.
///
/// Generated ids look like `20240131-142501-1a2b3c4d`. Ids are used as
/// directory names by the store, so only `[A-Za-z0-9._-]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Fresh run id: UTC timestamp plus a short random suffix.
    pub fn generate() -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        RunId(format!("{}-{}", stamp, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Rejected run id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid run id '{0}': use 1-128 characters from [A-Za-z0-9._-]")]
pub struct InvalidRunId(pub String);

impl TryFrom<String> for RunId {
    type Error = InvalidRunId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let valid = !value.is_empty()
            && value.len() <= 128
            && value != "."
            && value != ".."
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(RunId(value))
        } else {
            Err(InvalidRunId(value))
        }
    }
}

impl FromStr for RunId {
    type Err = InvalidRunId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunId::try_from(s.to_string())
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an episode within a run. Equal to the episode index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EpisodeId(pub u64);

impl EpisodeId {
    pub fn index(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EpisodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(EpisodeId)
    }
}

/// SHA-256 content digest, serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ContentDigest(bytes)
    }

    /// Digest of a single byte slice.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&value).map_err(|e| format!("invalid digest hex: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("digest must be 32 bytes, got {}", v.len()))?;
        Ok(ContentDigest(arr))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.to_hex()
    }
}

/// Observation emitted by an environment: a dense byte tensor.
///
/// Pixel observations are `[height, width]` or `[height, width, channels]`;
/// RAM observations are `[ram_size]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl Observation {
    pub fn new(shape: Vec<usize>, data: Vec<u8>) -> Self {
        Self { shape, data }
    }

    /// Stable content hash used for determinism checks.
    ///
    /// Covers the shape header (number of dims, then each dim, little endian)
    /// followed by the raw bytes, so two observations with equal bytes but a
    /// different layout hash differently.
    pub fn digest(&self) -> ContentDigest {
        let mut hasher = Sha256::new();
        hasher.update((self.shape.len() as u64).to_le_bytes());
        for &dim in &self.shape {
            hasher.update((dim as u64).to_le_bytes());
        }
        hasher.update(&self.data);
        ContentDigest(hasher.finalize().into())
    }
}
