//! Node configuration.
//!
//! Every tunable has a default matching the classic Kademlia parameters and
//! the handshake deadlines of the session pipeline. The binary maps
//! `KADLINK_*` environment variables and CLI flags onto this struct.

use std::time::Duration;

use thiserror::Error;

use crate::crypto::{CipherSuite, KdfHash};

/// Default bucket capacity (Kademlia `k`).
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// Default per-round fan-out of a lookup frontier (Kademlia `α`).
pub const DEFAULT_ALPHA: usize = 3;

/// Default number of independent lookup frontiers.
pub const DEFAULT_DISJOINT_PATHS: usize = 3;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Pending removals tolerated per opcode before its handler list is compacted.
pub const DEFAULT_COMPACT_THRESHOLD: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("pow difficulty {0} exceeds 256 bits")]
    Difficulty(u32),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Deadline for the peer's signed ephemeral key.
    pub handshake_timeout: Duration,
    /// Deadline for the peer's transport-ready ACK.
    pub ack_timeout: Duration,
    /// Deadline for a single lookup query.
    pub lookup_timeout: Duration,
    pub cipher: CipherSuite,
    pub kdf: KdfHash,
    /// Bucket capacity `K`; also bounds lookup results and responses.
    pub bucket_size: usize,
    pub alpha: usize,
    pub disjoint_paths: usize,
    /// Leading zero bits required of a peer's identity proof. Zero disables
    /// the check.
    pub pow_difficulty: u32,
    pub compact_threshold: usize,
    /// Invoke handlers newest-first instead of in registration order.
    pub reverse_dispatch: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            cipher: CipherSuite::default(),
            kdf: KdfHash::default(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: DEFAULT_ALPHA,
            disjoint_paths: DEFAULT_DISJOINT_PATHS,
            pow_difficulty: 0,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            reverse_dispatch: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_size == 0 {
            return Err(ConfigError::Zero("bucket_size"));
        }
        if self.alpha == 0 {
            return Err(ConfigError::Zero("alpha"));
        }
        if self.disjoint_paths == 0 {
            return Err(ConfigError::Zero("disjoint_paths"));
        }
        if self.compact_threshold == 0 {
            return Err(ConfigError::Zero("compact_threshold"));
        }
        if self.pow_difficulty > 256 {
            return Err(ConfigError::Difficulty(self.pow_difficulty));
        }
        Ok(())
    }

    pub fn with_cipher(mut self, cipher: CipherSuite) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_kdf(mut self, kdf: KdfHash) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn with_pow_difficulty(mut self, difficulty: u32) -> Self {
        self.pow_difficulty = difficulty;
        self
    }

    pub fn with_lookup(mut self, bucket_size: usize, alpha: usize, disjoint_paths: usize) -> Self {
        self.bucket_size = bucket_size;
        self.alpha = alpha;
        self.disjoint_paths = disjoint_paths;
        self
    }
}
