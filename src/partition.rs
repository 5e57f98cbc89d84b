//! Write-side partition state.
//!
//! A partition is the unit of isolation inside a block: one stacktrace tree
//! (as a sequence of bounded chunks) plus the four entity vectors. Partitions
//! are created on first use through [`crate::SymDb::partition`] and frozen
//! when the database flushes.

use crate::error::{Error, Result};
use crate::model::{Function, Location, Mapping, Stacktrace};
use crate::resolver::StacktraceSink;
use crate::stacktrace_tree::StacktraceTree;
use crate::utils::string_pool::StringPool;

/// One bounded slice of the partition's stacktrace tree.
///
/// `first_id` anchors the chunk in the partition's id space: node `n` of this
/// chunk is stacktrace id `first_id + n`. Consecutive chunks are spaced by
/// the chunk cap, so a reader recovers the chunk of an id by division.
pub(crate) struct ChunkWriter {
    pub tree: StacktraceTree,
    pub first_id: u32,
    pub stacks: u32,
    pub max_depth: u32,
}

impl ChunkWriter {
    fn new(first_id: u32) -> Self {
        Self {
            tree: StacktraceTree::new(),
            first_id,
            stacks: 0,
            max_depth: 0,
        }
    }
}

/// A block partition under construction.
pub struct Partition {
    partition: u64,
    max_nodes_per_chunk: u32,
    chunks: Vec<ChunkWriter>,
    strings: StringPool,
    functions: Vec<Function>,
    mappings: Vec<Mapping>,
    locations: Vec<Location>,
}

impl Partition {
    pub(crate) fn new(partition: u64, max_nodes_per_chunk: u32) -> Self {
        Self {
            partition,
            max_nodes_per_chunk,
            chunks: Vec::new(),
            // Id 0 of every table is a reserved sentinel.
            strings: StringPool::new(),
            functions: vec![Function::default()],
            mappings: vec![Mapping::default()],
            locations: vec![Location::default()],
        }
    }

    pub fn key(&self) -> u64 {
        self.partition
    }

    /// Appends a batch of leaf-first stacktraces, returning one id per stack
    /// in input order.
    ///
    /// Stacks sharing an outer-frame prefix share tree nodes, so re-appending
    /// a known stack returns its existing id without allocating. When the
    /// current chunk cannot fit a stack, a fresh chunk is opened and the
    /// whole stack lands there; ids therefore stay unique across chunks.
    pub fn append_stacktraces(&mut self, stacks: &[Stacktrace]) -> Vec<u32> {
        stacks
            .iter()
            .map(|s| self.append_one(&s.location_ids))
            .collect()
    }

    fn append_one(&mut self, location_ids: &[u64]) -> u32 {
        self.roll_chunk_if_needed(location_ids.len() as u32);
        let mut chunk_idx = self.chunks.len() - 1;
        let mut node = 0u32;
        for &loc in location_ids.iter().rev() {
            let loc = loc as i32;
            let full = {
                let c = &self.chunks[chunk_idx];
                self.max_nodes_per_chunk > 0
                    && c.tree.len() >= self.max_nodes_per_chunk
                    && !c.tree.has_child(node, loc)
            };
            if full {
                // Only reachable by a single stack longer than the chunk cap:
                // the remaining frames continue from a fresh chunk's root, so
                // the returned id resolves to the innermost frames only.
                let first_id = self.chunks[chunk_idx].first_id + self.max_nodes_per_chunk;
                self.chunks.push(ChunkWriter::new(first_id));
                chunk_idx += 1;
                node = 0;
            }
            node = self.chunks[chunk_idx].tree.child_or_insert(node, loc);
        }
        let c = &mut self.chunks[chunk_idx];
        c.stacks += 1;
        c.max_depth = c.max_depth.max(location_ids.len() as u32);
        c.first_id + node
    }

    /// Seals the current chunk when the incoming stack cannot fit next to the
    /// nodes already present. The check reserves the stack's worst case (all
    /// frames new), which keeps whole stacks inside one chunk.
    fn roll_chunk_if_needed(&mut self, stack_len: u32) {
        let current = match self.chunks.last() {
            Some(c) => c,
            None => {
                self.chunks.push(ChunkWriter::new(0));
                return;
            }
        };
        if self.max_nodes_per_chunk == 0 {
            return;
        }
        if current.tree.len() + stack_len >= self.max_nodes_per_chunk && current.tree.len() > 1 {
            let first_id = current.first_id + self.max_nodes_per_chunk;
            self.chunks.push(ChunkWriter::new(first_id));
        }
    }

    /// Resolves ids minted by this partition without flushing, so an open
    /// database can serve reads against its own stacktraces.
    ///
    /// Same contract as the block reader: ascending processing order, one
    /// sink call per input id, reused location buffer.
    pub fn resolve_stacktrace_locations(
        &self,
        sink: &mut dyn StacktraceSink,
        ids: &[u32],
    ) -> Result<()> {
        if !ids.windows(2).all(|w| w[0] <= w[1]) {
            let mut sorted = ids.to_vec();
            sorted.sort_unstable();
            return self.resolve_sorted(sink, &sorted);
        }
        self.resolve_sorted(sink, ids)
    }

    fn resolve_sorted(&self, sink: &mut dyn StacktraceSink, ids: &[u32]) -> Result<()> {
        let mut buf = Vec::with_capacity(64);
        for &id in ids {
            let chunk_idx = if self.max_nodes_per_chunk == 0 {
                0
            } else {
                (id / self.max_nodes_per_chunk) as usize
            };
            let chunk = self.chunks.get(chunk_idx).ok_or(Error::OutOfRange {
                what: "stacktrace",
                id: u64::from(id),
                max: u64::from(self.max_stacktrace_id()),
            })?;
            let node = id - chunk.first_id;
            if node >= chunk.tree.len() {
                return Err(Error::OutOfRange {
                    what: "stacktrace",
                    id: u64::from(id),
                    max: u64::from(chunk.first_id + chunk.tree.len()),
                });
            }
            chunk.tree.resolve_into(node, &mut buf);
            sink.insert_stacktrace(id, &buf)?;
        }
        Ok(())
    }

    fn max_stacktrace_id(&self) -> u32 {
        self.chunks
            .last()
            .map(|c| c.first_id + c.tree.len())
            .unwrap_or(0)
    }

    /// Interns a string, returning its table id. Duplicates are free.
    pub fn add_string(&mut self, s: &str) -> u32 {
        self.strings.intern(s)
    }

    pub fn add_function(&mut self, function: Function) -> u32 {
        let id = self.functions.len() as u32;
        self.functions.push(function);
        id
    }

    pub fn add_mapping(&mut self, mapping: Mapping) -> u32 {
        let id = self.mappings.len() as u32;
        self.mappings.push(mapping);
        id
    }

    pub fn add_location(&mut self, location: Location) -> u32 {
        let id = self.locations.len() as u32;
        self.locations.push(location);
        id
    }

    pub(crate) fn max_nodes_per_chunk(&self) -> u32 {
        self.max_nodes_per_chunk
    }

    pub(crate) fn chunks(&self) -> &[ChunkWriter] {
        &self.chunks
    }

    pub(crate) fn strings(&self) -> &[String] {
        self.strings.as_slice()
    }

    pub(crate) fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub(crate) fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub(crate) fn locations(&self) -> &[Location] {
        &self.locations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stacks(raw: &[&[u64]]) -> Vec<Stacktrace> {
        raw.iter().map(|s| Stacktrace::new(s.to_vec())).collect()
    }

    #[derive(Default)]
    struct Collected(Vec<(u32, Vec<i32>)>);

    impl StacktraceSink for Collected {
        fn insert_stacktrace(&mut self, id: u32, locations: &[i32]) -> Result<()> {
            self.0.push((id, locations.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn test_append_ids_with_chunk_rolls() {
        let mut p = Partition::new(1, 7);
        let ids = p.append_stacktraces(&stacks(&[
            &[3, 2, 1],
            &[2, 1],
            &[4, 3, 2, 1],
            &[3, 1],
            &[5, 2, 1],
        ]));
        assert_eq!(ids, vec![3, 2, 11, 16, 18]);
        assert_eq!(p.chunks().len(), 3);
        assert_eq!(p.chunks()[1].first_id, 7);
        assert_eq!(p.chunks()[2].first_id, 14);
        // Stack counts attribute each stack to the chunk its leaf landed in.
        let counts: Vec<u32> = p.chunks().iter().map(|c| c.stacks).collect();
        assert_eq!(counts, vec![2, 1, 2]);
    }

    #[test]
    fn test_append_is_deterministic() {
        let input = stacks(&[&[3, 2, 1], &[2, 1], &[4, 3, 2, 1], &[3, 1], &[5, 2, 1]]);
        let run = || Partition::new(1, 7).append_stacktraces(&input);
        assert_eq!(run(), run());
    }

    #[test]
    fn test_single_frame_stacks_spill_across_chunks() {
        let mut p = Partition::new(1, 4);
        let input: Vec<Stacktrace> = (1..=10).map(|l| Stacktrace::new(vec![l])).collect();
        let ids = p.append_stacktraces(&input);
        assert!(p.chunks().len() >= 3, "expected at least 3 chunks");
        // Ids from the second chunk onwards start past the chunk cap.
        assert!(ids[2] >= 4, "id {} should be in a later chunk", ids[2]);
        // Every id resolves back to its single frame.
        let mut sink = Collected::default();
        p.resolve_stacktrace_locations(&mut sink, &ids).unwrap();
        let want: Vec<(u32, Vec<i32>)> = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, vec![(i + 1) as i32]))
            .collect();
        assert_eq!(sink.0, want);
    }

    #[test]
    fn test_duplicate_stack_allocates_no_nodes() {
        let mut p = Partition::new(1, 1024);
        let a = p.append_stacktraces(&stacks(&[&[1, 2, 3]]));
        let nodes = p.chunks()[0].tree.len();
        let b = p.append_stacktraces(&stacks(&[&[1, 2, 3]]));
        assert_eq!(a, b);
        assert_eq!(p.chunks()[0].tree.len(), nodes);
        assert_eq!(p.chunks()[0].stacks, 2);
    }

    #[test]
    fn test_oversized_stack_continues_in_next_chunk() {
        let mut p = Partition::new(1, 4);
        let ids = p.append_stacktraces(&stacks(&[&[6, 5, 4, 3, 2, 1]]));
        assert_eq!(p.chunks().len(), 2);
        // Leaf node 3 of chunk 1, which starts at id 4.
        assert_eq!(ids, vec![7]);
        let mut sink = Collected::default();
        p.resolve_stacktrace_locations(&mut sink, &ids).unwrap();
        assert_eq!(
            sink.0,
            vec![(7, vec![6, 5, 4])],
            "tail frames live in the second chunk"
        );
    }

    #[test]
    fn test_empty_stack_returns_sentinel() {
        let mut p = Partition::new(1, 7);
        let ids = p.append_stacktraces(&stacks(&[&[]]));
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn test_unbounded_partition_keeps_one_chunk() {
        let mut p = Partition::new(1, 0);
        for i in 0..100u64 {
            p.append_stacktraces(&[Stacktrace::new(vec![i + 1, 1])]);
        }
        assert_eq!(p.chunks().len(), 1);
    }

    #[test]
    fn test_unflushed_partition_serves_reads() {
        let mut p = Partition::new(1, 7);
        let ids = p.append_stacktraces(&stacks(&[&[3, 2, 1], &[2, 1]]));

        // Append order in, ascending id order out.
        let mut sink = Collected::default();
        p.resolve_stacktrace_locations(&mut sink, &ids).unwrap();
        assert_eq!(sink.0, vec![(2, vec![2, 1]), (3, vec![3, 2, 1])]);

        match p.resolve_stacktrace_locations(&mut Collected::default(), &[99]) {
            Err(Error::OutOfRange { id: 99, .. }) => {}
            other => panic!("expected OutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn test_sentinel_records_are_seeded() {
        let p = Partition::new(9, 7);
        assert_eq!(p.strings(), &["".to_string()]);
        assert_eq!(p.functions().len(), 1);
        assert_eq!(p.mappings().len(), 1);
        assert_eq!(p.locations().len(), 1);
    }
}
