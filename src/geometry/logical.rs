use std::cmp::Ordering;

/// Coordinate of a block in the refinement forest.
///
/// A location at level `l` addresses one cell of a virtual uniform grid of
/// `nrbx_i * 2^(l - root_level)` cells along each axis. Locations are plain
/// data; all structure (parents, children, neighbors) lives in
/// [`BlockTree`](crate::geometry::BlockTree).
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Debug,
    Default,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct LogicalLocation {
    pub level: i32,
    pub lx1: i64,
    pub lx2: i64,
    pub lx3: i64,
}

impl LogicalLocation {
    pub fn new(level: i32, lx1: i64, lx2: i64, lx3: i64) -> Self {
        Self {
            level,
            lx1,
            lx2,
            lx3,
        }
    }

    /// Location of the parent cell, one level up.
    pub fn parent(&self) -> Self {
        Self {
            level: self.level - 1,
            lx1: self.lx1 >> 1,
            lx2: self.lx2 >> 1,
            lx3: self.lx3 >> 1,
        }
    }

    /// Location of the child cell at sub-octant `(fx1, fx2, fx3)`.
    pub fn child(&self, fx1: i64, fx2: i64, fx3: i64) -> Self {
        Self {
            level: self.level + 1,
            lx1: (self.lx1 << 1) + fx1,
            lx2: (self.lx2 << 1) + fx2,
            lx3: (self.lx3 << 1) + fx3,
        }
    }

    /// Parity of this location within its parent, per axis.
    pub fn octant(&self) -> [i64; 3] {
        [self.lx1 & 1, self.lx2 & 1, self.lx3 & 1]
    }

    /// First sibling of this location (all parities cleared).
    pub fn sibling_base(&self) -> Self {
        Self {
            level: self.level,
            lx1: self.lx1 & !1,
            lx2: self.lx2 & !1,
            lx3: self.lx3 & !1,
        }
    }

    pub fn coords(&self) -> [i64; 3] {
        [self.lx1, self.lx2, self.lx3]
    }
}

/// Deepest locations sort first, so that derefinement candidates are
/// applied children-before-parent; ties break on coordinates to keep the
/// order total and deterministic across ranks.
impl Ord for LogicalLocation {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .level
            .cmp(&self.level)
            .then(self.lx3.cmp(&other.lx3))
            .then(self.lx2.cmp(&other.lx2))
            .then(self.lx1.cmp(&other.lx1))
    }
}

impl PartialOrd for LogicalLocation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_child_round_trip() {
        let loc = LogicalLocation::new(3, 5, 2, 7);
        let parent = loc.parent();
        assert_eq!(parent, LogicalLocation::new(2, 2, 1, 3));

        let oct = loc.octant();
        assert_eq!(oct, [1, 0, 1]);
        assert_eq!(parent.child(oct[0], oct[1], oct[2]), loc);
    }

    #[test]
    fn deepest_sorts_first() {
        let mut locs = vec![
            LogicalLocation::new(2, 0, 0, 0),
            LogicalLocation::new(4, 1, 0, 0),
            LogicalLocation::new(3, 2, 2, 0),
            LogicalLocation::new(4, 0, 0, 0),
        ];
        locs.sort();
        assert_eq!(locs[0].level, 4);
        assert_eq!(locs[1].level, 4);
        assert_eq!(locs[0].lx1, 0);
        assert_eq!(locs[3].level, 2);
    }
}
