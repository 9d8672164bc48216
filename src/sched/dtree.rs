//! Replicated distribution tree for directed work stealing.
//!
//! Each rank keeps one node slot per depth, recording the distribution range
//! of each enclosing cross-worker task group. A per-depth *dominant flag*
//! tells remote workers which depth currently offers stealable work:
//!
//! - `0`: undetermined
//! - `+version`: the node with this version is dominant
//! - `-version`: the node with this version is retired
//!
//! Reading the owner's flag from every worker would hotspot it, so dominance
//! propagates decentralized: a scanning worker probes a random rank inside
//! the node's range, either installing the flag there (CAS from 0) when it
//! already knows the node is dominant, or reading the probe target's flag and
//! caching authoritative values locally. Node versions stride by the rank
//! count from distinct origins, so two owners never produce colliding
//! versions, and a stale steal can always be rejected by a version check.

use crate::sched::drange::{DistRange, Flipper};
use crate::transport::{AtomicWindow, Window};
use crate::util::DetRng;

/// Reference to a distribution-tree node: `(owner rank, depth)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    /// Rank whose slot holds the node.
    pub owner: i64,
    /// Tree depth; −1 is the null reference.
    pub depth: i32,
}

impl NodeRef {
    /// The null reference, parent of every depth-0 node.
    pub const NULL: Self = Self {
        owner: -1,
        depth: -1,
    };

    /// True if this reference points at no node.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.depth < 0
    }
}

impl Default for NodeRef {
    fn default() -> Self {
        Self::NULL
    }
}

/// One replicated node slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DtreeNode {
    /// Enclosing task group's node.
    pub parent: NodeRef,
    /// Distribution range of this task group.
    pub drange: DistRange,
    /// Task-group version at creation.
    pub tg_version: Flipper,
    /// Monotone version, strided by the rank count per owner.
    pub version: i64,
}

impl DtreeNode {
    /// Depth of this node.
    #[must_use]
    pub const fn depth(&self) -> i32 {
        self.parent.depth + 1
    }
}

/// The replicated tree plus its dominant flags.
#[derive(Debug)]
pub struct DistTree {
    max_depth: usize,
    n_ranks: usize,
    node_win: Window<DtreeNode>,
    dominant_win: AtomicWindow,
    versions: Vec<std::sync::Mutex<Vec<i64>>>,
}

impl DistTree {
    /// Creates the tree for `n_ranks` ranks and `max_depth` levels.
    #[must_use]
    pub fn new(n_ranks: usize, max_depth: usize) -> Self {
        Self {
            max_depth,
            n_ranks,
            node_win: Window::new(n_ranks, max_depth),
            dominant_win: AtomicWindow::new(n_ranks, max_depth),
            versions: (0..n_ranks)
                .map(|r| std::sync::Mutex::new(vec![r as i64 + 1; max_depth]))
                .collect(),
        }
    }

    /// Depth limit.
    #[must_use]
    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Writes the local slot below `parent` and returns its reference.
    pub fn append(
        &self,
        my_rank: usize,
        parent: NodeRef,
        drange: DistRange,
        tg_version: Flipper,
    ) -> NodeRef {
        let depth = (parent.depth + 1) as usize;
        debug_assert!(depth < self.max_depth);

        let version = {
            let mut versions = self.versions[my_rank].lock().expect("dtree lock poisoned");
            let n = self.n_ranks as i64;
            // Version overflow resets to the per-rank base. With 64-bit
            // versions the reset is unreachable in any realistic run.
            if versions[depth] >= i64::MAX - n {
                versions[depth] = my_rank as i64 + 1;
            }
            versions[depth] += n;
            versions[depth]
        };

        self.node_win.put(
            my_rank,
            depth,
            DtreeNode {
                parent,
                drange,
                tg_version,
                version,
            },
        );

        NodeRef {
            owner: my_rank as i64,
            depth: depth as i32,
        }
    }

    /// Marks `nr` dominant (`+version`) or retired (`-version`) using the
    /// local replica's version, locally and, when the node is owned
    /// elsewhere, on the owner via an atomic put.
    pub fn set_dominant(&self, my_rank: usize, nr: NodeRef, dominant: bool) {
        let node = self.node_win.get(my_rank, nr.depth as usize);
        let value = if dominant { node.version } else { -node.version };
        self.store_flag(my_rank, nr, value);
    }

    /// Stores an explicit flag value for `nr`, locally and on the owner.
    /// Callers that saved the node's version at group begin use this to
    /// retire exactly that version, even if the slot was reused since.
    pub fn store_flag(&self, my_rank: usize, nr: NodeRef, value: i64) {
        let depth = nr.depth as usize;
        self.dominant_win.store(my_rank, depth, value);
        if nr.owner != my_rank as i64 {
            self.dominant_win.store(nr.owner as usize, depth, value);
        }
    }

    /// Walks from depth 0 toward `nr`, returning the shallowest node whose
    /// dominant flag equals `+version`.
    pub fn get_topmost_dominant(
        &self,
        my_rank: usize,
        nr: NodeRef,
        rng: &mut DetRng,
    ) -> Option<DtreeNode> {
        if nr.depth < 0 {
            return None;
        }

        for d in 0..=nr.depth {
            let owner_rank = if d == nr.depth {
                nr.owner
            } else {
                self.node_win.get(my_rank, (d + 1) as usize).parent.owner
            };

            let node = self.node_win.get(my_rank, d as usize);
            debug_assert_eq!(node.parent.depth, d - 1);
            debug_assert_ne!(node.version, 0);

            if owner_rank != my_rank as i64
                && self.dominant_win.load(my_rank, d as usize) != -node.version
            {
                // Query a random worker within the distribution range instead
                // of the owner (decentralized dominant node propagation).
                debug_assert_eq!(owner_rank, node.drange.begin_rank());
                let target_rank = rng.next_range(owner_rank, node.drange.end_rank() - 1);

                if target_rank != owner_rank
                    && self.dominant_win.load(my_rank, d as usize) == node.version
                {
                    // We already know the node is dominant; install the flag
                    // remotely when the target has not heard yet.
                    let seen =
                        self.dominant_win
                            .cas(target_rank as usize, d as usize, 0, node.version);
                    if seen == -node.version {
                        self.dominant_win.store(my_rank, d as usize, seen);
                    }
                } else {
                    let seen = self.dominant_win.load(target_rank as usize, d as usize);
                    if seen == node.version || seen == -node.version {
                        self.dominant_win.store(my_rank, d as usize, seen);
                    }
                }
            }

            if self.dominant_win.load(my_rank, d as usize) == node.version {
                return Some(node);
            }
        }

        None
    }

    /// Bulk-copies the owner's slots `[0, nr.depth]` into the local replica
    /// and zeroes the local dominant flags over the same range (the remote
    /// flags stay authoritative).
    pub fn copy_parents(&self, my_rank: usize, nr: NodeRef) {
        for d in 0..=nr.depth as usize {
            self.dominant_win.store(my_rank, d, 0);
        }
        let nodes = self
            .node_win
            .get_slice(nr.owner as usize, 0, nr.depth as usize + 1);
        self.node_win.put_slice(my_rank, 0, &nodes);
    }

    /// Reads a rank's local node slot.
    #[must_use]
    pub fn local_node(&self, rank: usize, depth: i32) -> DtreeNode {
        self.node_win.get(rank, depth as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(b: f64, e: f64) -> DistRange {
        DistRange::new(b, e)
    }

    #[test]
    fn versions_stride_by_rank_count() {
        let tree = DistTree::new(4, 8);
        let a = tree.append(1, NodeRef::NULL, range(0.0, 4.0), Flipper::default());
        let v1 = tree.local_node(1, 0).version;
        assert_eq!(v1, 2 + 4, "rank 1 base is 2, strided by 4");

        let _b = tree.append(1, a, range(0.0, 2.0), Flipper::default());
        let _a2 = tree.append(1, NodeRef::NULL, range(0.0, 4.0), Flipper::default());
        let v2 = tree.local_node(1, 0).version;
        assert_eq!(v2, v1 + 4);

        // Distinct owners never collide at the same depth.
        let _c = tree.append(2, NodeRef::NULL, range(0.0, 4.0), Flipper::default());
        assert_ne!(tree.local_node(2, 0).version % 4, v2 % 4);
    }

    #[test]
    fn append_links_parent() {
        let tree = DistTree::new(2, 4);
        let root = tree.append(0, NodeRef::NULL, range(0.0, 2.0), Flipper::default());
        assert_eq!(root, NodeRef { owner: 0, depth: 0 });
        let child = tree.append(0, root, range(0.0, 1.5), Flipper::default());
        assert_eq!(child.depth, 1);
        assert_eq!(tree.local_node(0, 1).parent, root);
        assert_eq!(tree.local_node(0, 1).depth(), 1);
    }

    #[test]
    fn owner_sees_own_dominance_immediately() {
        let tree = DistTree::new(2, 4);
        let nr = tree.append(0, NodeRef::NULL, range(0.0, 2.0), Flipper::default());
        tree.set_dominant(0, nr, true);
        let mut rng = DetRng::new(1);
        let found = tree.get_topmost_dominant(0, nr, &mut rng);
        assert_eq!(found.expect("dominant").depth(), 0);
    }

    #[test]
    fn dominance_propagates_to_range_members() {
        let tree = DistTree::new(2, 4);
        let nr = tree.append(0, NodeRef::NULL, range(0.0, 2.0), Flipper::default());
        tree.set_dominant(0, nr, true);

        // Rank 1 receives the parent chain, then scans until a probe hits an
        // authoritative flag.
        tree.copy_parents(1, nr);
        let mut rng = DetRng::new(7);
        let mut found = None;
        for _ in 0..64 {
            found = tree.get_topmost_dominant(1, nr, &mut rng);
            if found.is_some() {
                break;
            }
        }
        let node = found.expect("dominance should propagate");
        assert_eq!(node.drange, range(0.0, 2.0));
    }

    #[test]
    fn retired_nodes_are_never_dominant() {
        let tree = DistTree::new(2, 4);
        let nr = tree.append(0, NodeRef::NULL, range(0.0, 2.0), Flipper::default());
        tree.set_dominant(0, nr, true);
        tree.set_dominant(0, nr, false);

        tree.copy_parents(1, nr);
        let mut rng = DetRng::new(3);
        for _ in 0..64 {
            assert!(tree.get_topmost_dominant(1, nr, &mut rng).is_none());
        }
        // The scanner caches the retirement locally and stops probing.
        let mut rng2 = DetRng::new(5);
        assert!(tree.get_topmost_dominant(0, nr, &mut rng2).is_none());
    }

    #[test]
    fn copy_parents_zeroes_local_flags() {
        let tree = DistTree::new(2, 4);
        let root = tree.append(0, NodeRef::NULL, range(0.0, 2.0), Flipper::default());
        let child = tree.append(0, root, range(0.0, 1.2), Flipper::default());
        tree.set_dominant(0, root, true);

        // Pollute rank 1's flag, then copy: flags must reset to undetermined.
        tree.dominant_win.store(1, 0, 999);
        tree.copy_parents(1, child);
        assert_eq!(tree.dominant_win.load(1, 0), 0);
        assert_eq!(tree.local_node(1, 1).drange, range(0.0, 1.2));
        assert_eq!(tree.local_node(1, 0).drange, range(0.0, 2.0));
    }

    #[test]
    fn null_ref_yields_nothing() {
        let tree = DistTree::new(2, 4);
        let mut rng = DetRng::new(1);
        assert!(tree
            .get_topmost_dominant(0, NodeRef::NULL, &mut rng)
            .is_none());
    }
}
