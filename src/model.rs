//! In-memory records for the symbolic side of a profile.
//!
//! A block stores five kinds of records. Stacktraces are encoded in the
//! per-partition stacktrace tree; the other four live in shared parquet
//! tables and are addressed by dense `u32` identifiers. Identifier 0 of every
//! table is a reserved sentinel (the empty string for the string table,
//! zeroed records elsewhere), seeded at partition creation.

use smallvec::SmallVec;

/// A single sampled call stack, leaf-first: `location_ids[0]` is the
/// innermost frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stacktrace {
    pub location_ids: Vec<u64>,
}

impl Stacktrace {
    pub fn new(location_ids: Vec<u64>) -> Self {
        Self { location_ids }
    }
}

/// An instruction address within a mapped binary, with the call frames
/// inlined at that address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub id: u64,
    pub mapping_id: u32,
    pub address: u64,
    pub is_folded: bool,
    /// Inlined frames, innermost first. Most locations carry one or two.
    pub line: SmallVec<[Line; 2]>,
}

/// One source line of a location; references the function table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Line {
    pub function_id: u32,
    pub line: i32,
}

/// Function metadata. Name fields reference the string table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Function {
    pub id: u64,
    pub name: u32,
    pub system_name: u32,
    pub filename: u32,
    pub start_line: u32,
}

/// A loaded binary segment. Name fields reference the string table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mapping {
    pub id: u64,
    pub memory_start: u64,
    pub memory_limit: u64,
    pub file_offset: u64,
    pub filename: u32,
    pub build_id: u32,
    pub has_functions: bool,
    pub has_filenames: bool,
    pub has_line_numbers: bool,
    pub has_inline_frames: bool,
}

/// A batch of samples to resolve into a profile.
///
/// `stacktrace_ids[i]` and `values[i]` describe the same sample. Resolution
/// requires the batch to be sorted by stacktrace id with both vectors
/// permuted together; [`Samples::sort_by_stacktrace_id`] does exactly that.
/// Callers that need the original order must record the permutation
/// themselves before sorting.
#[derive(Debug, Clone, Default)]
pub struct Samples {
    pub stacktrace_ids: Vec<u32>,
    pub values: Vec<u64>,
}

impl Samples {
    pub fn new(stacktrace_ids: Vec<u32>, values: Vec<u64>) -> Self {
        Self {
            stacktrace_ids,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.stacktrace_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacktrace_ids.is_empty()
    }

    /// Sorts both vectors by stacktrace id, keeping pairs together.
    pub fn sort_by_stacktrace_id(&mut self) {
        let mut order: Vec<usize> = (0..self.stacktrace_ids.len()).collect();
        order.sort_by_key(|&i| self.stacktrace_ids[i]);
        self.stacktrace_ids = order.iter().map(|&i| self.stacktrace_ids[i]).collect();
        self.values = order.iter().map(|&i| self.values[i]).collect();
    }

    /// True when stacktrace ids are already in ascending order.
    pub fn is_sorted(&self) -> bool {
        self.stacktrace_ids.windows(2).all(|w| w[0] <= w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_sort_keeps_pairs_together() {
        let mut samples = Samples::new(vec![18, 2, 11, 3, 16], vec![50, 20, 30, 10, 40]);
        assert!(!samples.is_sorted());
        samples.sort_by_stacktrace_id();
        assert!(samples.is_sorted());
        assert_eq!(samples.stacktrace_ids, vec![2, 3, 11, 16, 18]);
        assert_eq!(samples.values, vec![20, 10, 30, 40, 50]);
    }
}
