// Test module organization for end-to-end block scenarios
// Compiled only during testing via #[cfg(test)] in lib.rs

use std::path::Path;

use crate::error::Result;
use crate::model::Stacktrace;
use crate::resolver::StacktraceSink;
use crate::{Config, ParquetConfig, StacktracesConfig};

mod block_roundtrip_test;
mod legacy_format_test;

/// Sink that records every insert for later assertions.
pub(crate) struct RecordingSink {
    pub inserts: Vec<(u32, Vec<i32>)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            inserts: Vec::new(),
        }
    }
}

impl StacktraceSink for RecordingSink {
    fn insert_stacktrace(&mut self, stacktrace_id: u32, locations: &[i32]) -> Result<()> {
        self.inserts.push((stacktrace_id, locations.to_vec()));
        Ok(())
    }
}

pub(crate) fn stacks(raw: &[&[u64]]) -> Vec<Stacktrace> {
    raw.iter().map(|s| Stacktrace::new(s.to_vec())).collect()
}

pub(crate) fn block_config(
    dir: &Path,
    max_nodes_per_chunk: u32,
    max_buffer_row_count: usize,
) -> Config {
    Config {
        dir: dir.to_path_buf(),
        stacktraces: StacktracesConfig {
            max_nodes_per_chunk,
        },
        parquet: ParquetConfig {
            max_buffer_row_count,
        },
    }
}
