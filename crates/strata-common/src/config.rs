//! Configuration for a history tree.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, StrataError};

/// Integer handle to an attribute path. Opaque to the storage engine.
pub type Quark = i32;

/// Smallest accepted block size, and the granularity block sizes should be
/// a multiple of.
pub const MIN_BLOCK_SIZE: usize = 4096;

/// Creation-time configuration for a history tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtConfig {
    /// Path of the history file.
    pub state_file: PathBuf,
    /// Size of each node block, in bytes. Should be a multiple of 4096 and
    /// must be large enough to hold one maximum-size interval plus the core
    /// node header.
    pub block_size: usize,
    /// Maximum number of children per core node.
    pub max_children: usize,
    /// Opaque version of the state provider. Reopening an existing file
    /// fails if the stored version does not match.
    pub provider_version: u32,
    /// Earliest timestamp the tree will accept.
    pub start_time: i64,
}

impl Default for HtConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("./state-history.ht"),
            block_size: 128 * 1024,
            max_children: 50,
            provider_version: 0,
            start_time: 0,
        }
    }
}

impl HtConfig {
    /// Creates a config for the given file with default sizing.
    pub fn for_file(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            ..Default::default()
        }
    }

    /// Checks basic option validity.
    ///
    /// The block-size-versus-interval-size bound also depends on the node
    /// header layout; the tree performs that check when it is created.
    pub fn validate(&self) -> Result<()> {
        if self.max_children < 1 {
            return Err(StrataError::Config(format!(
                "max_children must be at least 1, got {}",
                self.max_children
            )));
        }
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(StrataError::Config(format!(
                "block_size must be at least {} bytes, got {}",
                MIN_BLOCK_SIZE, self.block_size
            )));
        }
        Ok(())
    }
}
