//! Logical statement identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of statements the document layer may prepare.
///
/// Each identity maps 1:1 to one SQL text supplied by the caller and is
/// compiled at most once per (identity, thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatementId {
    /// Read a range of samples from a block
    GetSamples,
    /// Read the 256-sample summary of a block
    GetSummary256,
    /// Read the 64k-sample summary of a block
    GetSummary64k,
    /// Load a whole sample block
    LoadSampleBlock,
    /// Insert a new sample block
    InsertSampleBlock,
    /// Delete a sample block
    DeleteSampleBlock,
    /// Fetch the root page number of a table
    GetRootPage,
    /// Fetch a raw database page
    GetDBPage,
}

impl StatementId {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StatementId::GetSamples => "get_samples",
            StatementId::GetSummary256 => "get_summary_256",
            StatementId::GetSummary64k => "get_summary_64k",
            StatementId::LoadSampleBlock => "load_sample_block",
            StatementId::InsertSampleBlock => "insert_sample_block",
            StatementId::DeleteSampleBlock => "delete_sample_block",
            StatementId::GetRootPage => "get_root_page",
            StatementId::GetDBPage => "get_db_page",
        }
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
