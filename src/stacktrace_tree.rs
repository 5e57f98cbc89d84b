//! Parent-pointer tree for deduplicated stacktrace storage.
//!
//! Every distinct call stack inserted into a partition becomes a path in this
//! tree, root-to-leaf in caller order (outermost frame first). Stacks that
//! share an outer-frame prefix share the corresponding nodes, so the node
//! count grows with the number of *distinct* frames, not the number of
//! stacks. The stacktrace id handed back to the caller is the index of the
//! leaf node, which makes resolution a parent-pointer walk.
//!
//! Node 0 of every tree is a sentinel root with parent −1; it never carries a
//! location and its id is never returned.
//!
//! On disk a tree is one chunk of the stacktrace file: a little-endian node
//! count followed by two group-varint arrays, the parent pointers (encoded as
//! the always-positive distance `i − parent`) and the location ids. See
//! [`group_varint_encode`] for the group layout.

use hashbrown::HashMap;

use crate::error::{Error, Result};

/// One tree node: parent index and the location id of the frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Node {
    pub parent: i32,
    pub location: i32,
}

/// Growable, write-side stacktrace tree.
///
/// Child lookup is backed by a single map keyed by `(parent, location)`,
/// which keeps insertion amortized O(1) with memory proportional to the node
/// count.
pub(crate) struct StacktraceTree {
    nodes: Vec<Node>,
    children: HashMap<(u32, i32), u32>,
}

impl StacktraceTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: -1,
                location: 0,
            }],
            children: HashMap::new(),
        }
    }

    /// Number of nodes, including the sentinel root.
    pub fn len(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn has_child(&self, parent: u32, location: i32) -> bool {
        self.children.contains_key(&(parent, location))
    }

    /// Returns the child of `parent` carrying `location`, inserting a new
    /// node if none exists yet.
    pub fn child_or_insert(&mut self, parent: u32, location: i32) -> u32 {
        if let Some(&child) = self.children.get(&(parent, location)) {
            return child;
        }
        let child = self.nodes.len() as u32;
        self.nodes.push(Node {
            parent: parent as i32,
            location,
        });
        self.children.insert((parent, location), child);
        child
    }

    /// Walks parent pointers from `node` to the root, collecting location ids
    /// leaf-first. `dst` is cleared first; the sentinel contributes nothing.
    pub fn resolve_into(&self, node: u32, dst: &mut Vec<i32>) {
        dst.clear();
        let mut i = node as usize;
        while i != 0 {
            let n = self.nodes[i];
            dst.push(n.location);
            i = n.parent as usize;
        }
    }

    /// Serializes the tree as a chunk body: node count, parent-distance
    /// array, location array.
    pub fn encode(&self, dst: &mut Vec<u8>) {
        let n = self.nodes.len();
        dst.extend_from_slice(&(n as u32).to_le_bytes());
        let distances: Vec<u32> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (i as i64 - i64::from(node.parent)) as u32)
            .collect();
        group_varint_encode(&distances, dst);
        let locations: Vec<u32> = self.nodes.iter().map(|node| node.location as u32).collect();
        group_varint_encode(&locations, dst);
    }
}

/// Read-side chunk: the two node arrays decoded into flat vectors.
///
/// Parent pointers are validated at decode time (every non-root parent index
/// is smaller than its child), so a walk always terminates at the sentinel.
#[derive(Debug)]
pub(crate) struct DecodedChunk {
    parents: Vec<i32>,
    locations: Vec<i32>,
}

impl DecodedChunk {
    /// Decodes a chunk body. `expected_nodes` comes from the chunk header;
    /// any disagreement with the body is corruption.
    pub fn decode(body: &[u8], expected_nodes: u32) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::CorruptChunk("body shorter than node count".into()));
        }
        let n = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        if n != expected_nodes {
            return Err(Error::CorruptChunk(format!(
                "node count mismatch: body {n}, header {expected_nodes}"
            )));
        }
        let n = n as usize;
        let (distances, used) =
            group_varint_decode(&body[4..], n).map_err(|e| Error::CorruptChunk(e.to_string()))?;
        let (raw_locations, used2) = group_varint_decode(&body[4 + used..], n)
            .map_err(|e| Error::CorruptChunk(e.to_string()))?;
        if 4 + used + used2 != body.len() {
            return Err(Error::CorruptChunk("trailing bytes after node arrays".into()));
        }

        let mut parents = Vec::with_capacity(n);
        for (i, &d) in distances.iter().enumerate() {
            let d = i64::from(d);
            let valid = if i == 0 { d == 1 } else { d >= 1 && d <= i as i64 };
            if !valid {
                return Err(Error::CorruptChunk(format!(
                    "invalid parent distance {d} at node {i}"
                )));
            }
            parents.push((i as i64 - d) as i32);
        }
        let mut locations = Vec::with_capacity(n);
        for (i, &l) in raw_locations.iter().enumerate() {
            if l > i32::MAX as u32 {
                return Err(Error::CorruptChunk(format!(
                    "location id {l} at node {i} exceeds i32"
                )));
            }
            locations.push(l as i32);
        }
        Ok(Self { parents, locations })
    }

    pub fn len(&self) -> u32 {
        self.parents.len() as u32
    }

    /// Walks parent pointers from `node` to the root, collecting location ids
    /// leaf-first into `dst` (cleared first). The caller checks `node`
    /// against [`Self::len`].
    pub fn walk(&self, node: u32, dst: &mut Vec<i32>) {
        dst.clear();
        let mut i = node as usize;
        while i != 0 {
            dst.push(self.locations[i]);
            i = self.parents[i] as usize;
        }
    }
}

/// Splits an ascending id batch into per-chunk sub-batches.
///
/// Returns `(chunk_index, range into ids)` pairs in chunk order. With an
/// unbounded chunk cap everything maps to chunk 0.
pub(crate) fn split_by_chunk(ids: &[u32], max_nodes: u32) -> Vec<(u32, std::ops::Range<usize>)> {
    if ids.is_empty() {
        return Vec::new();
    }
    if max_nodes == 0 {
        return vec![(0, 0..ids.len())];
    }
    let mut out = Vec::new();
    let mut start = 0;
    let mut chunk = ids[0] / max_nodes;
    for (i, &id) in ids.iter().enumerate().skip(1) {
        let c = id / max_nodes;
        if c != chunk {
            out.push((chunk, start..i));
            start = i;
            chunk = c;
        }
    }
    out.push((chunk, start..ids.len()));
    out
}

/// Encodes `values` in groups of four: one tag byte holding four 2-bit byte
/// lengths (length − 1), then the little-endian value bytes. The final group
/// is padded with zeros; the decoder drops the padding.
pub(crate) fn group_varint_encode(values: &[u32], dst: &mut Vec<u8>) {
    for group in values.chunks(4) {
        let mut vals = [0u32; 4];
        vals[..group.len()].copy_from_slice(group);
        let lens = vals.map(encoded_len);
        let mut tag = 0u8;
        for (i, &len) in lens.iter().enumerate() {
            tag |= (len - 1) << (2 * i);
        }
        dst.push(tag);
        for (v, len) in vals.iter().zip(lens) {
            dst.extend_from_slice(&v.to_le_bytes()[..len as usize]);
        }
    }
}

/// Decodes `count` values from `src`, returning the values and the number of
/// bytes consumed. Fails on truncation.
pub(crate) fn group_varint_decode(
    src: &[u8],
    count: usize,
) -> std::result::Result<(Vec<u32>, usize), &'static str> {
    let mut out = Vec::with_capacity(count);
    let mut pos = 0usize;
    for _ in 0..count.div_ceil(4) {
        let tag = *src.get(pos).ok_or("truncated group tag")?;
        pos += 1;
        for i in 0..4 {
            let len = ((tag >> (2 * i)) & 0b11) as usize + 1;
            let bytes = src.get(pos..pos + len).ok_or("truncated group value")?;
            let mut buf = [0u8; 4];
            buf[..len].copy_from_slice(bytes);
            out.push(u32::from_le_bytes(buf));
            pos += len;
        }
    }
    out.truncate(count);
    Ok((out, pos))
}

fn encoded_len(v: u32) -> u8 {
    match v {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

// Link to test module (only compiled during tests)
#[cfg(test)]
#[path = "stacktrace_tree/tests/mod.rs"]
mod tests;
