use crate::error::{Result, RillError};
use crate::geometry::LogicalLocation;

/// Null index, used internally to make storage of `Option<usize>` more efficient.
const NULL: usize = usize::MAX;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct TreeNode {
    loc: LogicalLocation,
    parent: usize,
    /// Children indexed by `fx1 + 2*fx2 + 4*fx3`; `NULL` where absent.
    children: [usize; 8],
    leaf: bool,
    /// Last gid assigned by [`BlockTree::block_list`]. New leaves inherit the
    /// gid of the pre-edit leaf they descend from, which is what makes the
    /// new-to-old map of an AMR step fall out of plain enumeration.
    gid: i64,
}

impl TreeNode {
    fn new(loc: LogicalLocation, parent: usize, gid: i64) -> Self {
        Self {
            loc,
            parent,
            children: [NULL; 8],
            leaf: false,
            gid,
        }
    }
}

/// The refinement forest: a 2:1-balanced recursive subdivision of the root
/// grid, rooted in a single cell at level 0.
///
/// Storage is a flat arena with explicit indices (freed nodes are recycled
/// through a free list), so edits never move surviving nodes. Leaves tile
/// the root domain exactly once; [`BlockTree::block_list`] enumerates them
/// in a fixed depth-first order which defines the global block ids.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockTree {
    nodes: Vec<TreeNode>,
    free: Vec<usize>,
    nrbx: [i64; 3],
    root_level: i32,
    dim: usize,
    periodic: [bool; 3],
}

impl BlockTree {
    /// Builds the forest for a root grid of `nrbx` blocks per axis, all at
    /// `root_level = ceil(log2(max(nrbx)))`. Root coordinates outside
    /// `nrbx` are simply never created, so lookups in that direction fail,
    /// which is how non-periodic boundaries materialize.
    pub fn new(nrbx: [i64; 3], root_level: i32, dim: usize, periodic: [bool; 3]) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            free: Vec::new(),
            nrbx,
            root_level,
            dim,
            periodic,
        };

        tree.nodes
            .push(TreeNode::new(LogicalLocation::default(), NULL, -1));
        tree.create_root_grid(0);
        tree
    }

    pub fn root_level(&self) -> i32 {
        self.root_level
    }

    fn create_root_grid(&mut self, node: usize) {
        let loc = self.nodes[node].loc;

        if loc.level == self.root_level {
            self.nodes[node].leaf = true;
            return;
        }

        let shift = self.root_level - loc.level - 1;
        for fx3 in 0..2i64 {
            for fx2 in 0..2i64 {
                for fx1 in 0..2i64 {
                    let child = loc.child(fx1, fx2, fx3);
                    let inside = (child.lx1 << shift) < self.nrbx[0]
                        && (child.lx2 << shift) < self.nrbx[1]
                        && (child.lx3 << shift) < self.nrbx[2];
                    if !inside {
                        continue;
                    }

                    let index = self.alloc(TreeNode::new(child, node, -1));
                    self.nodes[node].children[(fx1 + 2 * fx2 + 4 * fx3) as usize] = index;
                    self.create_root_grid(index);
                }
            }
        }
    }

    fn alloc(&mut self, node: TreeNode) -> usize {
        if let Some(index) = self.free.pop() {
            self.nodes[index] = node;
            index
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    fn is_leaf(&self, node: usize) -> bool {
        self.nodes[node].leaf
    }

    pub fn location(&self, node: usize) -> LogicalLocation {
        self.nodes[node].loc
    }

    pub fn is_internal(&self, node: usize) -> bool {
        !self.nodes[node].leaf
    }

    pub fn gid(&self, node: usize) -> i64 {
        self.nodes[node].gid
    }

    /// Number of virtual root-grid cells along `axis` at `level`.
    fn extent(&self, axis: usize, level: i32) -> i64 {
        debug_assert!(level >= self.root_level);
        self.nrbx[axis] << (level - self.root_level)
    }

    /// Finds the node at exactly `loc`, if it exists.
    pub fn find(&self, loc: LogicalLocation) -> Option<usize> {
        let mut node = 0;

        for l in 0..loc.level {
            if self.is_leaf(node) {
                return None;
            }

            let shift = loc.level - l - 1;
            let fx1 = (loc.lx1 >> shift) & 1;
            let fx2 = (loc.lx2 >> shift) & 1;
            let fx3 = (loc.lx3 >> shift) & 1;

            let child = self.nodes[node].children[(fx1 + 2 * fx2 + 4 * fx3) as usize];
            if child == NULL {
                return None;
            }
            node = child;
        }

        Some(node)
    }

    /// Child of an internal node at sub-octant `(fx1, fx2, fx3)`.
    pub fn leaf_child(&self, node: usize, fx1: i64, fx2: i64, fx3: i64) -> usize {
        debug_assert!(self.is_internal(node));
        self.nodes[node].children[(fx1 + 2 * fx2 + 4 * fx3) as usize]
    }

    /// Returns the deepest existing node touching `loc` with the given
    /// offset, or `None` across a non-periodic boundary. The walk ascends to
    /// the level of the virtual root grid and descends along the target
    /// bits, so the cost is proportional to the level, not the tree size.
    pub fn find_neighbor(&self, loc: LogicalLocation, ox: [i64; 3]) -> Option<usize> {
        let mut target = [loc.lx1 + ox[0], loc.lx2 + ox[1], loc.lx3 + ox[2]];

        for axis in 0..3 {
            let extent = self.extent(axis, loc.level);
            if target[axis] < 0 || target[axis] >= extent {
                if !self.periodic[axis] {
                    return None;
                }
                target[axis] = target[axis].rem_euclid(extent);
            }
        }

        let mut node = 0;
        for l in 0..loc.level {
            if self.is_leaf(node) {
                return Some(node);
            }

            let shift = loc.level - l - 1;
            let fx1 = (target[0] >> shift) & 1;
            let fx2 = (target[1] >> shift) & 1;
            let fx3 = (target[2] >> shift) & 1;

            let child = self.nodes[node].children[(fx1 + 2 * fx2 + 4 * fx3) as usize];
            if child == NULL {
                return None;
            }
            node = child;
        }

        Some(node)
    }

    /// Walks down to `loc`, refining any leaf encountered on the way, and
    /// returns the node at `loc` (a leaf). Fails if the target lies outside
    /// the root grid or below an already finer subdivision.
    pub fn add_block(&mut self, loc: LogicalLocation, nnew: &mut i64) -> Result<usize> {
        let mut node = 0;

        for l in 0..loc.level {
            if self.is_leaf(node) {
                self.refine(node, nnew)?;
            }

            let shift = loc.level - l - 1;
            let fx1 = (loc.lx1 >> shift) & 1;
            let fx2 = (loc.lx2 >> shift) & 1;
            let fx3 = (loc.lx3 >> shift) & 1;

            let child = self.nodes[node].children[(fx1 + 2 * fx2 + 4 * fx3) as usize];
            if child == NULL {
                return Err(RillError::Topology(format!(
                    "block location {loc:?} lies outside the root grid"
                )));
            }
            node = child;
        }

        if self.is_internal(node) {
            return Err(RillError::Topology(format!(
                "block location {loc:?} contradicts an existing finer subdivision"
            )));
        }

        Ok(node)
    }

    /// Restart path: recreates the node chain down to `loc` without
    /// triggering any 2:1 cascade. The caller re-enumerates the leaves
    /// afterwards and checks the count against the stored total.
    pub fn add_block_unrefined(&mut self, loc: LogicalLocation) {
        let mut node = 0;

        for l in 0..loc.level {
            self.nodes[node].leaf = false;

            let shift = loc.level - l - 1;
            let fx1 = (loc.lx1 >> shift) & 1;
            let fx2 = (loc.lx2 >> shift) & 1;
            let fx3 = (loc.lx3 >> shift) & 1;

            let slot = (fx1 + 2 * fx2 + 4 * fx3) as usize;
            if self.nodes[node].children[slot] == NULL {
                let child = self.nodes[node].loc.child(fx1, fx2, fx3);
                let index = self.alloc(TreeNode::new(child, node, -1));
                self.nodes[node].children[slot] = index;
            }
            node = self.nodes[node].children[slot];
        }

        self.nodes[node].leaf = true;
    }

    /// Converts the leaf at `node` into an internal node with `2^dim` leaf
    /// children. Any face/edge/corner neighbor one level coarser is refined
    /// first, recursively, so the 2:1 balance holds when this returns.
    /// `nnew` accumulates the number of leaves added.
    ///
    /// A node that is already internal is left alone: a refinement cascade
    /// triggered by an earlier candidate may have split it first.
    pub fn refine(&mut self, node: usize, nnew: &mut i64) -> Result<()> {
        if self.is_internal(node) {
            return Ok(());
        }

        let loc = self.nodes[node].loc;

        // Restore balance around the target before committing. A neighbor
        // may be repeatedly refined while static regions are inserted, hence
        // the loop rather than a single check.
        for (ox1, ox2, ox3) in self.offsets() {
            loop {
                match self.find_neighbor(loc, [ox1, ox2, ox3]) {
                    Some(nb) if self.is_leaf(nb) && self.nodes[nb].loc.level < loc.level => {
                        self.refine(nb, nnew)?;
                    }
                    _ => break,
                }
            }
        }

        let gid = self.nodes[node].gid;
        for fx3 in 0..=((self.dim == 3) as i64) {
            for fx2 in 0..=((self.dim >= 2) as i64) {
                for fx1 in 0..2i64 {
                    let child = loc.child(fx1, fx2, fx3);
                    let index = self.alloc(TreeNode::new(child, node, gid));
                    self.nodes[index].leaf = true;
                    self.nodes[node].children[(fx1 + 2 * fx2 + 4 * fx3) as usize] = index;
                }
            }
        }

        self.nodes[node].leaf = false;
        *nnew += (1 << self.dim) - 1;
        Ok(())
    }

    /// Collapses the children of the internal node at `node` (the parent
    /// location of a derefinement group) back into a single leaf. Returns
    /// `false` without touching the tree when any child is itself internal
    /// or when a neighbor two levels finer would break the 2:1 balance.
    pub fn derefine(&mut self, node: usize, ndel: &mut i64) -> bool {
        if self.is_leaf(node) {
            return false;
        }

        let loc = self.nodes[node].loc;

        for slot in self.child_slots() {
            let child = self.nodes[node].children[slot];
            if child == NULL || self.is_internal(child) {
                return false;
            }
        }

        for (ox1, ox2, ox3) in self.offsets() {
            let Some(nb) = self.find_neighbor(loc, [ox1, ox2, ox3]) else {
                continue;
            };
            if self.is_leaf(nb) {
                continue;
            }

            // The neighbor subdivides at our level; any of its children
            // facing back toward us that subdivides again holds leaves two
            // levels below the collapsed parent.
            for (fx1, fx2, fx3) in self.facing_children([ox1, ox2, ox3]) {
                let child = self.nodes[nb].children[(fx1 + 2 * fx2 + 4 * fx3) as usize];
                if child != NULL && self.is_internal(child) {
                    return false;
                }
            }
        }

        // The collapsed leaf takes over the gid of its first child, which is
        // the source block the AMR engine restricts from.
        let first = self.nodes[node].children[0];
        self.nodes[node].gid = self.nodes[first].gid;

        for slot in self.child_slots() {
            let child = self.nodes[node].children[slot];
            self.free.push(child);
            self.nodes[node].children[slot] = NULL;
        }

        self.nodes[node].leaf = true;
        *ndel += (1 << self.dim) - 1;
        true
    }

    /// All neighbor offsets for the effective dimension.
    fn offsets(&self) -> Vec<(i64, i64, i64)> {
        let r2 = if self.dim >= 2 { -1..=1 } else { 0..=0 };
        let r3 = if self.dim == 3 { -1..=1 } else { 0..=0 };

        let mut result = Vec::new();
        for ox3 in r3 {
            for ox2 in r2.clone() {
                for ox1 in -1..=1i64 {
                    if ox1 != 0 || ox2 != 0 || ox3 != 0 {
                        result.push((ox1, ox2, ox3));
                    }
                }
            }
        }
        result
    }

    /// Child slots that exist for the effective dimension, in gid order.
    fn child_slots(&self) -> Vec<usize> {
        let mut result = Vec::new();
        for fx3 in 0..=((self.dim == 3) as usize) {
            for fx2 in 0..=((self.dim >= 2) as usize) {
                for fx1 in 0..2usize {
                    result.push(fx1 + 2 * fx2 + 4 * fx3);
                }
            }
        }
        result
    }

    /// Sub-octants of a neighbor in direction `ox` that touch the shared
    /// face, edge or corner.
    fn facing_children(&self, ox: [i64; 3]) -> Vec<(i64, i64, i64)> {
        let choices = |axis: usize| -> Vec<i64> {
            if axis >= self.dim {
                vec![0]
            } else {
                match ox[axis] {
                    -1 => vec![1],
                    1 => vec![0],
                    _ => vec![0, 1],
                }
            }
        };

        let mut result = Vec::new();
        for fx3 in choices(2) {
            for fx2 in choices(1) {
                for fx1 in choices(0) {
                    result.push((fx1, fx2, fx3));
                }
            }
        }
        result
    }

    /// Total number of leaves.
    pub fn count_blocks(&self) -> usize {
        let mut count = 0;
        self.walk(0, &mut |_, _| count += 1);
        count
    }

    /// Enumerates the leaves depth-first in the canonical order, assigning
    /// dense gids. When `new_to_old` is supplied, it receives for each new
    /// gid the gid the leaf carried before the most recent tree edits.
    pub fn block_list(
        &mut self,
        loclist: &mut Vec<LogicalLocation>,
        mut new_to_old: Option<&mut Vec<usize>>,
    ) {
        loclist.clear();
        if let Some(map) = new_to_old.as_deref_mut() {
            map.clear();
        }

        let mut order = Vec::new();
        self.walk(0, &mut |node, loc| order.push((node, loc)));

        for (gid, &(node, loc)) in order.iter().enumerate() {
            loclist.push(loc);
            if let Some(map) = new_to_old.as_deref_mut() {
                map.push(self.nodes[node].gid as usize);
            }
            self.nodes[node].gid = gid as i64;
        }
    }

    fn walk(&self, node: usize, f: &mut impl FnMut(usize, LogicalLocation)) {
        if self.is_leaf(node) {
            f(node, self.nodes[node].loc);
            return;
        }

        for slot in 0..8 {
            let child = self.nodes[node].children[slot];
            if child != NULL {
                self.walk(child, f);
            }
        }
    }

    /// Checks the 2:1 balance over every leaf pair sharing a face, edge or
    /// corner. Quadratic in the leaf count; meant for tests and for the
    /// mesh-test diagnostic mode.
    pub fn check_balance(&self) -> bool {
        let mut leaves = Vec::new();
        self.walk(0, &mut |_, loc| leaves.push(loc));

        for &loc in &leaves {
            for (ox1, ox2, ox3) in self.offsets() {
                if let Some(nb) = self.find_neighbor(loc, [ox1, ox2, ox3]) {
                    let level = self.max_facing_level(nb, [ox1, ox2, ox3]);
                    if (loc.level - level).abs() > 1 {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Deepest leaf level within `node` adjacent to the boundary shared
    /// with a block in direction `ox`.
    fn max_facing_level(&self, node: usize, ox: [i64; 3]) -> i32 {
        if self.is_leaf(node) {
            return self.nodes[node].loc.level;
        }

        let mut level = self.nodes[node].loc.level;
        for (fx1, fx2, fx3) in self.facing_children(ox) {
            let child = self.nodes[node].children[(fx1 + 2 * fx2 + 4 * fx3) as usize];
            if child != NULL {
                level = level.max(self.max_facing_level(child, ox));
            }
        }
        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(tree: &mut BlockTree) -> Vec<LogicalLocation> {
        let mut list = Vec::new();
        tree.block_list(&mut list, None);
        list
    }

    #[test]
    fn root_grid() {
        let mut tree = BlockTree::new([4, 2, 1], 2, 2, [false; 3]);
        let list = leaves(&mut tree);

        assert_eq!(list.len(), 8);
        assert!(list.iter().all(|loc| loc.level == 2));
        assert!(list.iter().all(|loc| loc.lx1 < 4 && loc.lx2 < 2 && loc.lx3 == 0));
        assert!(tree.check_balance());
    }

    #[test]
    fn neighbors_and_boundaries() {
        let tree = BlockTree::new([4, 4, 1], 2, 2, [false; 3]);

        let loc = LogicalLocation::new(2, 0, 1, 0);
        let right = tree.find_neighbor(loc, [1, 0, 0]).unwrap();
        assert_eq!(tree.location(right), LogicalLocation::new(2, 1, 1, 0));

        // Non-periodic edge of the domain
        assert!(tree.find_neighbor(loc, [-1, 0, 0]).is_none());
    }

    #[test]
    fn periodic_wrap() {
        let tree = BlockTree::new([4, 4, 1], 2, 2, [true, false, false]);

        let loc = LogicalLocation::new(2, 0, 1, 0);
        let wrapped = tree.find_neighbor(loc, [-1, 0, 0]).unwrap();
        assert_eq!(tree.location(wrapped), LogicalLocation::new(2, 3, 1, 0));

        // x2 stays closed
        let corner = LogicalLocation::new(2, 0, 0, 0);
        assert!(tree.find_neighbor(corner, [0, -1, 0]).is_none());
    }

    #[test]
    fn refine_keeps_two_to_one() {
        let mut tree = BlockTree::new([2, 2, 1], 1, 2, [false; 3]);
        let mut nnew = 0;

        let node = tree.find(LogicalLocation::new(1, 0, 0, 0)).unwrap();
        tree.refine(node, &mut nnew).unwrap();
        assert_eq!(nnew, 3);

        // Refine one of the new children; the cascade must split the
        // adjacent root-level leaves first.
        let node = tree.find(LogicalLocation::new(2, 1, 1, 0)).unwrap();
        nnew = 0;
        tree.refine(node, &mut nnew).unwrap();
        assert!(nnew > 3);
        assert!(tree.check_balance());
    }

    #[test]
    fn derefine_guards_against_finer_neighbors() {
        let mut tree = BlockTree::new([2, 2, 1], 1, 2, [false; 3]);
        let mut count = 0;

        let node = tree.find(LogicalLocation::new(1, 0, 0, 0)).unwrap();
        tree.refine(node, &mut count).unwrap();
        let node = tree.find(LogicalLocation::new(2, 0, 0, 0)).unwrap();
        tree.refine(node, &mut count).unwrap();

        // (1,0,0,0) now has grandchildren, so it cannot collapse.
        let parent = tree.find(LogicalLocation::new(1, 0, 0, 0)).unwrap();
        let mut ndel = 0;
        assert!(!tree.derefine(parent, &mut ndel));

        // The grandchildren themselves can collapse, then the parent can.
        let inner = tree.find(LogicalLocation::new(2, 0, 0, 0)).unwrap();
        assert!(tree.derefine(inner, &mut ndel));
        assert!(tree.derefine(parent, &mut ndel));
        assert_eq!(ndel, 6);
        assert_eq!(tree.count_blocks(), 4);
    }

    #[test]
    fn block_list_tracks_ancestry() {
        let mut tree = BlockTree::new([2, 2, 1], 1, 2, [false; 3]);
        let mut list = Vec::new();
        tree.block_list(&mut list, None);
        assert_eq!(list.len(), 4);

        let mut nnew = 0;
        let node = tree.find(list[1]).unwrap();
        tree.refine(node, &mut nnew).unwrap();

        let mut map = Vec::new();
        tree.block_list(&mut list, Some(&mut map));
        assert_eq!(list.len(), 7);

        // The four new children all descend from old gid 1, and the
        // surviving blocks keep their relative order.
        assert_eq!(map, vec![0, 1, 1, 1, 1, 2, 3]);
    }

    #[test]
    fn fuzzy_serialize() -> eyre::Result<()> {
        use rand::Rng;

        let mut tree = BlockTree::new([2, 2, 1], 1, 2, [true, true, false]);
        let mut rng = rand::thread_rng();

        // Randomly refine a few rounds; cascades keep the forest balanced.
        for _ in 0..3 {
            let mut list = Vec::new();
            tree.block_list(&mut list, None);

            let mut nnew = 0;
            for loc in list {
                if loc.level >= 4 || !rng.gen_bool(0.3) {
                    continue;
                }
                let node = tree.find(loc).unwrap();
                if tree.is_internal(node) {
                    continue;
                }
                tree.refine(node, &mut nnew)?;
            }
        }

        let text = ron::to_string(&tree)?;
        let restored: BlockTree = ron::from_str(&text)?;

        assert_eq!(tree, restored);
        assert!(restored.check_balance());
        Ok(())
    }

    #[test]
    fn add_block_rejects_contradiction() {
        let mut tree = BlockTree::new([2, 1, 1], 1, 1, [false; 3]);
        let mut nnew = 0;

        tree.add_block(LogicalLocation::new(3, 0, 0, 0), &mut nnew)
            .unwrap();
        assert!(tree.check_balance());

        // The ancestor of an existing finer subdivision cannot become a leaf.
        let err = tree.add_block(LogicalLocation::new(2, 0, 0, 0), &mut nnew);
        assert!(err.is_err());
    }
}
