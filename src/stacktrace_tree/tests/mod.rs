// Test module organization for stacktrace_tree
// This module is only compiled during testing via #[cfg(test)] in stacktrace_tree.rs

use crate::stacktrace_tree::*;


/// Inserts one leaf-first stack into a bare tree, returning the leaf node.
fn insert_stack(tree: &mut StacktraceTree, stack: &[u64]) -> u32 {
    let mut node = 0;
    for &loc in stack.iter().rev() {
        node = tree.child_or_insert(node, loc as i32);
    }
    node
}
