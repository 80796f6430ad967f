//! Capacity-bounded fan-out tree construction.
//!
//! Connects an arbitrary number of leaf endpoints through layers of
//! aggregation nodes, each limited to `capacity` attachments. One child
//! slot per node is reserved for chaining to the next layer, so a level
//! with `n > capacity` items gets `ceil(n / (capacity - 1))` nodes and
//! items are distributed round-robin. Construction recurses until a
//! level comes out with at most two nodes; exactly two are linked
//! directly to each other, leaving a *pair* of roots rather than a
//! single one. That binary root is intentional — it is observable in
//! the topology diameter and downstream tooling expects it.

use thiserror::Error;

/// Errors from tree construction.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// A fan-out below 2 cannot attach anything.
    #[error("aggregation capacity {0} is too small (minimum 2)")]
    CapacityTooSmall(usize),
    /// With a fan-out of 2 every aggregation level reproduces itself
    /// (one child each plus the reserved chaining slot), so levels with
    /// more than 2 items can never converge.
    #[error("capacity 2 cannot aggregate {0} items: chaining leaves no room to shrink a level")]
    ChainingImpossible(usize),
}

/// One aggregation node and the items attached below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggNode {
    /// Identifier, `s{level}_{ordinal}` with ordinals starting at 1.
    pub id: String,
    /// Attached children: leaf identifiers or lower-level node ids.
    pub children: Vec<String>,
}

/// The constructed aggregation tree.
///
/// Immutable once built; the emulation substrate consumes it to
/// materialize actual nodes and links.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    /// All aggregation nodes in creation order (level 0 first).
    pub nodes: Vec<AggNode>,
    /// Direct link between the two terminal nodes, when the final level
    /// produced exactly two.
    pub root_link: Option<(String, String)>,
}

impl Tree {
    /// Total number of aggregation nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Builds the aggregation tree over `leaves` with per-node fan-out
/// `capacity`.
///
/// Zero or one leaves need no aggregation at all and yield an empty
/// tree.
///
/// # Errors
///
/// Returns [`TopologyError::CapacityTooSmall`] for `capacity < 2` and
/// [`TopologyError::ChainingImpossible`] when `capacity == 2` meets a
/// level of more than two items.
pub fn build_tree(leaves: &[String], capacity: usize) -> Result<Tree, TopologyError> {
    if capacity < 2 {
        return Err(TopologyError::CapacityTooSmall(capacity));
    }
    let mut tree = Tree::default();
    if leaves.len() > 1 {
        build_level(leaves.to_vec(), 0, capacity, &mut tree)?;
    }
    Ok(tree)
}

fn build_level(
    items: Vec<String>,
    level: usize,
    capacity: usize,
    tree: &mut Tree,
) -> Result<(), TopologyError> {
    let n = items.len();
    let n_nodes = if n > capacity {
        if capacity == 2 {
            return Err(TopologyError::ChainingImpossible(n));
        }
        n.div_ceil(capacity - 1)
    } else {
        1
    };

    let ids: Vec<String> = (1..=n_nodes)
        .map(|ordinal| format!("s{level}_{ordinal}"))
        .collect();
    let mut nodes: Vec<AggNode> = ids
        .iter()
        .map(|id| AggNode {
            id: id.clone(),
            children: Vec::new(),
        })
        .collect();
    for (i, item) in items.into_iter().enumerate() {
        nodes[i % n_nodes].children.push(item);
    }
    tree.nodes.extend(nodes);

    if n_nodes > 2 {
        build_level(ids, level + 1, capacity, tree)
    } else {
        if n_nodes == 2 {
            tree.root_link = Some((ids[0].clone(), ids[1].clone()));
        }
        Ok(())
    }
}
