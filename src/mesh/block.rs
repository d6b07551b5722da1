//! Rank-local blocks and their neighbor protocol.
//!
//! Every block derives, from the forest alone, an ordered list of neighbor
//! descriptors covering faces, edges and corners at the same, coarser and
//! finer levels. The `bufid`/`target_bufid` pair indexes ghost-exchange
//! buffer slots; both sides derive them from the same pure slot table, which
//! is what makes the exchange match up pairwise without any negotiation.

use crate::config::BoundaryKind;
use crate::geometry::{BlockTree, LogicalLocation, RegionSize};
use crate::state::{BlockState, NGHOST};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NeighborKind {
    Face,
    Edge,
    Corner,
}

/// One concrete neighbor of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NeighborBlock {
    pub rank: usize,
    pub level: i32,
    pub gid: usize,
    pub lid: usize,
    pub offset: [i32; 3],
    pub kind: NeighborKind,
    pub bufid: usize,
    pub target_bufid: usize,
    /// Sub-face indices disambiguating which portion of a coarser face or
    /// edge this record covers.
    pub fi: [i32; 2],
}

/// Vote of the refinement criterion on one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefineFlag {
    Coarsen,
    Keep,
    Refine,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BufferSlot {
    offset: [i32; 3],
    fi: [i32; 2],
}

/// The canonical enumeration of ghost-buffer slots for one block: every
/// face (with its sub-faces), edge and corner, in a fixed order shared by
/// all ranks. `find` is the pure function both sides of an exchange use to
/// agree on slot indices.
#[derive(Clone, Debug)]
pub struct BufferTable {
    slots: Vec<BufferSlot>,
    dim: usize,
    nf1: usize,
    nf2: usize,
    face_only: bool,
}

impl BufferTable {
    pub fn new(dim: usize, multilevel: bool, face_only: bool) -> Self {
        let nf1 = if multilevel && dim >= 2 { 2 } else { 1 };
        let nf2 = if multilevel && dim == 3 { 2 } else { 1 };

        let mut slots = Vec::new();
        let mut face = |axis: usize, n: i32, slots: &mut Vec<BufferSlot>| {
            let mut offset = [0; 3];
            offset[axis] = n;
            for f2 in 0..nf2 as i32 {
                for f1 in 0..nf1 as i32 {
                    slots.push(BufferSlot {
                        offset,
                        fi: [f1, f2],
                    });
                }
            }
        };

        for n in [-1, 1] {
            face(0, n, &mut slots);
        }
        if dim >= 2 {
            for n in [-1, 1] {
                face(1, n, &mut slots);
            }
        }
        if dim == 3 {
            for n in [-1, 1] {
                face(2, n, &mut slots);
            }
        }

        if !face_only {
            if dim >= 2 {
                for m in [-1, 1] {
                    for n in [-1, 1] {
                        for f1 in 0..nf2 as i32 {
                            slots.push(BufferSlot {
                                offset: [n, m, 0],
                                fi: [f1, 0],
                            });
                        }
                    }
                }
            }
            if dim == 3 {
                for m in [-1, 1] {
                    for n in [-1, 1] {
                        for f1 in 0..nf1 as i32 {
                            slots.push(BufferSlot {
                                offset: [n, 0, m],
                                fi: [f1, 0],
                            });
                        }
                    }
                }
                for m in [-1, 1] {
                    for n in [-1, 1] {
                        for f1 in 0..nf1 as i32 {
                            slots.push(BufferSlot {
                                offset: [0, n, m],
                                fi: [f1, 0],
                            });
                        }
                    }
                }
                for l in [-1, 1] {
                    for m in [-1, 1] {
                        for n in [-1, 1] {
                            slots.push(BufferSlot {
                                offset: [n, m, l],
                                fi: [0, 0],
                            });
                        }
                    }
                }
            }
        }

        Self {
            slots,
            dim,
            nf1,
            nf2,
            face_only,
        }
    }

    /// Maximum number of neighbors a block can have, equal to the number of
    /// buffer slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot index of a given (offset, sub-face) signature. Both the sender
    /// and the receiver of an exchange evaluate this with mirrored
    /// arguments, which yields matching `bufid`/`target_bufid` pairs.
    pub fn find(&self, offset: [i32; 3], fi: [i32; 2]) -> usize {
        self.slots
            .iter()
            .position(|slot| slot.offset == offset && slot.fi == fi)
            .expect("neighbor signature maps to a buffer slot")
    }
}

/// Neighbor descriptors of one block, plus the 3x3x3 level map used to
/// widen loops over interfaces.
#[derive(Clone, Debug, Default)]
pub struct NeighborTable {
    pub records: Vec<NeighborBlock>,
    /// `nblevel[k][j][i]` holds the level of the neighbor at offset
    /// `(i-1, j-1, k-1)`, or -1 where there is none. The center entry is the
    /// block's own level.
    pub nblevel: [[[i32; 3]; 3]; 3],
}

impl NeighborTable {
    /// Scans the forest in the canonical slot order and produces the
    /// neighbor records of the block at `loc`.
    pub fn search(
        tree: &BlockTree,
        table: &BufferTable,
        loc: LogicalLocation,
        ranklist: &[usize],
        nslist: &[usize],
    ) -> Self {
        let dim = table.dim;
        let (nf1, nf2) = (table.nf1 as i64, table.nf2 as i64);

        let myfx = loc.octant();
        let myox = [
            myfx[0] * 2 - 1,
            if dim >= 2 { myfx[1] * 2 - 1 } else { 0 },
            if dim == 3 { myfx[2] * 2 - 1 } else { 0 },
        ];

        let mut result = Self::default();
        result.nblevel = [[[-1; 3]; 3]; 3];
        result.nblevel[1][1][1] = loc.level;

        let mut bufid = 0usize;

        let mut push = |result: &mut Self,
                        node: usize,
                        offset: [i32; 3],
                        kind: NeighborKind,
                        bufid: usize,
                        target: usize,
                        fi: [i32; 2]| {
            let gid = tree.gid(node) as usize;
            let rank = ranklist[gid];
            result.records.push(NeighborBlock {
                rank,
                level: tree.location(node).level,
                gid,
                lid: gid - nslist[rank],
                offset,
                kind,
                bufid,
                target_bufid: target,
                fi,
            });
        };

        // Faces. The sub-face order (fi2 outer, fi1 inner) mirrors the slot
        // table so the running bufid counter stays aligned with it.
        for axis in 0..dim {
            for n in [-1i64, 1] {
                let mut o64 = [0i64; 3];
                o64[axis] = n;
                let offset = [o64[0] as i32, o64[1] as i32, o64[2] as i32];
                let cell = [
                    (o64[0] + 1) as usize,
                    (o64[1] + 1) as usize,
                    (o64[2] + 1) as usize,
                ];

                let Some(neib) = tree.find_neighbor(loc, o64) else {
                    bufid += (nf1 * nf2) as usize;
                    continue;
                };

                if tree.is_internal(neib) {
                    // Finer: one record per boundary child of the neighbor.
                    let fface = 1 - (n + 1) / 2;
                    result.nblevel[cell[2]][cell[1]][cell[0]] = tree.location(neib).level + 1;

                    for f2 in 0..nf2 {
                        for f1 in 0..nf1 {
                            let child = match axis {
                                0 => tree.leaf_child(neib, fface, f1, f2),
                                1 => tree.leaf_child(neib, f1, fface, f2),
                                _ => tree.leaf_child(neib, f1, f2, fface),
                            };
                            let target = table.find(
                                [-offset[0], -offset[1], -offset[2]],
                                [0, 0],
                            );
                            push(
                                &mut result,
                                child,
                                offset,
                                NeighborKind::Face,
                                bufid,
                                target,
                                [f1 as i32, f2 as i32],
                            );
                            bufid += 1;
                        }
                    }
                } else {
                    let nlevel = tree.location(neib).level;
                    result.nblevel[cell[2]][cell[1]][cell[0]] = nlevel;

                    let target = if nlevel == loc.level {
                        table.find([-offset[0], -offset[1], -offset[2]], [0, 0])
                    } else {
                        // Coarser: our parity perpendicular to the face tells
                        // the neighbor which of its sub-faces we are.
                        let fi = match axis {
                            0 => [myfx[1] as i32, myfx[2] as i32],
                            1 => [myfx[0] as i32, myfx[2] as i32],
                            _ => [myfx[0] as i32, myfx[1] as i32],
                        };
                        table.find([-offset[0], -offset[1], -offset[2]], fi)
                    };
                    push(
                        &mut result,
                        neib,
                        offset,
                        NeighborKind::Face,
                        bufid,
                        target,
                        [0, 0],
                    );
                    bufid += (nf1 * nf2) as usize;
                }
            }
        }

        if dim == 1 || table.face_only {
            return result;
        }

        // x1x2 edges
        for m in [-1i64, 1] {
            for n in [-1i64, 1] {
                let offset = [n as i32, m as i32, 0];
                edge_scan(
                    tree,
                    table,
                    loc,
                    &mut result,
                    &mut bufid,
                    &mut push,
                    [n, m, 0],
                    offset,
                    nf2,
                    |neib, f1| tree.leaf_child(neib, 1 - (n + 1) / 2, 1 - (m + 1) / 2, f1),
                    [myfx[2] as i32, 0],
                    myox[0] == n && myox[1] == m,
                );
            }
        }

        if dim == 2 {
            return result;
        }

        // x1x3 edges
        for m in [-1i64, 1] {
            for n in [-1i64, 1] {
                let offset = [n as i32, 0, m as i32];
                edge_scan(
                    tree,
                    table,
                    loc,
                    &mut result,
                    &mut bufid,
                    &mut push,
                    [n, 0, m],
                    offset,
                    nf1,
                    |neib, f1| tree.leaf_child(neib, 1 - (n + 1) / 2, f1, 1 - (m + 1) / 2),
                    [myfx[1] as i32, 0],
                    myox[0] == n && myox[2] == m,
                );
            }
        }

        // x2x3 edges
        for m in [-1i64, 1] {
            for n in [-1i64, 1] {
                let offset = [0, n as i32, m as i32];
                edge_scan(
                    tree,
                    table,
                    loc,
                    &mut result,
                    &mut bufid,
                    &mut push,
                    [0, n, m],
                    offset,
                    nf1,
                    |neib, f1| tree.leaf_child(neib, f1, 1 - (n + 1) / 2, 1 - (m + 1) / 2),
                    [myfx[0] as i32, 0],
                    myox[1] == n && myox[2] == m,
                );
            }
        }

        // Corners
        for l in [-1i64, 1] {
            for m in [-1i64, 1] {
                for n in [-1i64, 1] {
                    let offset = [n as i32, m as i32, l as i32];
                    let cell = [(n + 1) as usize, (m + 1) as usize, (l + 1) as usize];

                    let Some(mut neib) = tree.find_neighbor(loc, [n, m, l]) else {
                        bufid += 1;
                        continue;
                    };

                    if tree.is_internal(neib) {
                        neib = tree.leaf_child(
                            neib,
                            1 - (n + 1) / 2,
                            1 - (m + 1) / 2,
                            1 - (l + 1) / 2,
                        );
                    }

                    let nlevel = tree.location(neib).level;
                    result.nblevel[cell[2]][cell[1]][cell[0]] = nlevel;

                    if nlevel >= loc.level || (myox[0] == n && myox[1] == m && myox[2] == l) {
                        let target =
                            table.find([-offset[0], -offset[1], -offset[2]], [0, 0]);
                        push(
                            &mut result,
                            neib,
                            offset,
                            NeighborKind::Corner,
                            bufid,
                            target,
                            [0, 0],
                        );
                    }
                    bufid += 1;
                }
            }
        }

        result
    }

    /// Records pointing at a given offset, in slot order.
    pub fn at_offset(&self, offset: [i32; 3]) -> impl Iterator<Item = &NeighborBlock> {
        self.records.iter().filter(move |r| r.offset == offset)
    }
}

/// Shared body of the three edge scans: only the leaf-child order, the slot
/// width and the canonical-parity rule differ between edge orientations.
#[allow(clippy::too_many_arguments)]
fn edge_scan(
    tree: &BlockTree,
    table: &BufferTable,
    loc: LogicalLocation,
    result: &mut NeighborTable,
    bufid: &mut usize,
    push: &mut impl FnMut(&mut NeighborTable, usize, [i32; 3], NeighborKind, usize, usize, [i32; 2]),
    o64: [i64; 3],
    offset: [i32; 3],
    slots: i64,
    leaf_child: impl Fn(usize, i64) -> usize,
    coarse_fi: [i32; 2],
    canonical: bool,
) {
    let cell = [
        (o64[0] + 1) as usize,
        (o64[1] + 1) as usize,
        (o64[2] + 1) as usize,
    ];

    let Some(neib) = tree.find_neighbor(loc, o64) else {
        *bufid += slots as usize;
        return;
    };

    if tree.is_internal(neib) {
        result.nblevel[cell[2]][cell[1]][cell[0]] = tree.location(neib).level + 1;

        for f1 in 0..slots {
            let child = leaf_child(neib, f1);
            let target = table.find([-offset[0], -offset[1], -offset[2]], [0, 0]);
            push(
                &mut *result,
                child,
                offset,
                NeighborKind::Edge,
                *bufid,
                target,
                [f1 as i32, 0],
            );
            *bufid += 1;
        }
    } else {
        let nlevel = tree.location(neib).level;
        result.nblevel[cell[2]][cell[1]][cell[0]] = nlevel;

        let target = if nlevel == loc.level {
            table.find([-offset[0], -offset[1], -offset[2]], [0, 0])
        } else {
            table.find([-offset[0], -offset[1], -offset[2]], coarse_fi)
        };

        // A coarser edge neighbor is recorded only by the canonical child,
        // so the pair exchanges that edge exactly once.
        if nlevel >= loc.level || canonical {
            push(
                &mut *result,
                neib,
                offset,
                NeighborKind::Edge,
                *bufid,
                target,
                [0, 0],
            );
        }
        *bufid += slots as usize;
    }
}

/// A rank-local block: the unit of distribution and of solver work.
pub struct Block {
    pub gid: usize,
    pub lid: usize,
    pub loc: LogicalLocation,
    pub region: RegionSize,
    pub boundary: [BoundaryKind; 6],
    pub cost: f64,
    pub refine_flag: RefineFlag,
    pub state: Box<dyn BlockState>,
    pub neighbors: NeighborTable,
}

impl Block {
    pub fn new(
        gid: usize,
        lid: usize,
        loc: LogicalLocation,
        region: RegionSize,
        boundary: [BoundaryKind; 6],
        state: Box<dyn BlockState>,
    ) -> Self {
        Self {
            gid,
            lid,
            loc,
            region,
            boundary,
            cost: 1.0,
            refine_flag: RefineFlag::Keep,
            state,
            neighbors: NeighborTable::default(),
        }
    }

    pub fn search_neighbors(
        &mut self,
        tree: &BlockTree,
        table: &BufferTable,
        ranklist: &[usize],
        nslist: &[usize],
    ) {
        self.neighbors = NeighborTable::search(tree, table, self.loc, ranklist, nslist);
    }

    /// Physical center of the cell at total-array index `i` (ghosts
    /// included) along `axis`, assuming uniform spacing within the block.
    pub fn cell_center(&self, axis: usize, i: usize) -> f64 {
        let ghost = if self.region.nx[axis] > 1 { NGHOST } else { 0 };
        let dx = (self.region.xmax[axis] - self.region.xmin[axis]) / self.region.nx[axis] as f64;
        self.region.xmin[axis] + (i as f64 - ghost as f64 + 0.5) * dx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BlockTree;

    fn uniform_2d_periodic() -> (BlockTree, Vec<LogicalLocation>) {
        let mut tree = BlockTree::new([4, 4, 1], 2, 2, [true, true, false]);
        let mut loclist = Vec::new();
        tree.block_list(&mut loclist, None);
        (tree, loclist)
    }

    #[test]
    fn buffer_table_sizes() {
        assert_eq!(BufferTable::new(1, false, true).len(), 2);
        assert_eq!(BufferTable::new(2, false, false).len(), 8);
        assert_eq!(BufferTable::new(2, true, false).len(), 12);
        assert_eq!(BufferTable::new(3, true, false).len(), 56);
    }

    #[test]
    fn buffer_slot_lookup_is_injective() {
        let table = BufferTable::new(2, true, false);

        // Re-enumerate every legal signature; each must land on its own slot.
        let mut seen = std::collections::HashSet::new();
        for n in [-1, 1] {
            for f1 in 0..2 {
                assert!(seen.insert(table.find([n, 0, 0], [f1, 0])));
                assert!(seen.insert(table.find([0, n, 0], [f1, 0])));
            }
        }
        for m in [-1, 1] {
            for n in [-1, 1] {
                assert!(seen.insert(table.find([n, m, 0], [0, 0])));
            }
        }
        assert_eq!(seen.len(), table.len());
    }

    #[test]
    fn uniform_block_has_eight_neighbors() {
        let (tree, loclist) = uniform_2d_periodic();
        let table = BufferTable::new(2, false, false);
        let ranklist = vec![0; loclist.len()];
        let nslist = vec![0];

        for &loc in &loclist {
            let neighbors = NeighborTable::search(&tree, &table, loc, &ranklist, &nslist);
            assert_eq!(neighbors.records.len(), 8);
            assert!(neighbors
                .records
                .iter()
                .filter(|r| r.kind == NeighborKind::Face)
                .count()
                == 4);
            assert!(neighbors
                .records
                .iter()
                .filter(|r| r.kind == NeighborKind::Edge)
                .count()
                == 4);
        }
    }

    #[test]
    fn open_boundary_blocks_lose_neighbors() {
        let mut tree = BlockTree::new([4, 1, 1], 2, 1, [false; 3]);
        let mut loclist = Vec::new();
        tree.block_list(&mut loclist, None);

        let table = BufferTable::new(1, false, true);
        let ranklist = vec![0; 4];
        let nslist = vec![0];

        let first = NeighborTable::search(&tree, &table, loclist[0], &ranklist, &nslist);
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].offset, [1, 0, 0]);
        assert_eq!(first.nblevel[1][1][0], -1);

        let inner = NeighborTable::search(&tree, &table, loclist[1], &ranklist, &nslist);
        assert_eq!(inner.records.len(), 2);
    }

    #[test]
    fn neighbor_reciprocity_across_levels() {
        // A refined quadrant produces same-level, coarser and finer
        // records; every record must have a mirror with the matching slot.
        let mut tree = BlockTree::new([2, 2, 1], 1, 2, [false; 3]);
        let mut nnew = 0;
        let node = tree.find(LogicalLocation::new(1, 0, 0, 0)).unwrap();
        tree.refine(node, &mut nnew).unwrap();

        let mut loclist = Vec::new();
        tree.block_list(&mut loclist, None);
        assert_eq!(loclist.len(), 7);

        let table = BufferTable::new(2, true, false);
        let ranklist = vec![0; loclist.len()];
        let nslist = vec![0];

        let tables: Vec<_> = loclist
            .iter()
            .map(|&loc| NeighborTable::search(&tree, &table, loc, &ranklist, &nslist))
            .collect();

        for (gid, neighbors) in tables.iter().enumerate() {
            for record in &neighbors.records {
                let mirror = [-record.offset[0], -record.offset[1], -record.offset[2]];
                let found = tables[record.gid].records.iter().any(|back| {
                    back.gid == gid && back.offset == mirror && back.bufid == record.target_bufid
                });
                assert!(
                    found,
                    "no reciprocal record for {gid} -> {} at {:?}",
                    record.gid, record.offset
                );
            }
        }
    }

    #[test]
    fn fine_block_reports_coarse_face_subface() {
        let mut tree = BlockTree::new([2, 2, 1], 1, 2, [false; 3]);
        let mut nnew = 0;
        let node = tree.find(LogicalLocation::new(1, 0, 0, 0)).unwrap();
        tree.refine(node, &mut nnew).unwrap();

        let mut loclist = Vec::new();
        tree.block_list(&mut loclist, None);

        let table = BufferTable::new(2, true, false);
        let ranklist = vec![0; loclist.len()];
        let nslist = vec![0];

        // Child (1,0) of the refined quadrant: its +x1 neighbor is the
        // coarser root block (1,0,0,0) at level 1.
        let loc = LogicalLocation::new(2, 1, 0, 0);
        let neighbors = NeighborTable::search(&tree, &table, loc, &ranklist, &nslist);
        let coarse = neighbors
            .records
            .iter()
            .find(|r| r.offset == [1, 0, 0])
            .unwrap();
        assert_eq!(coarse.level, 1);

        // The coarse side holds two sub-face records for that face, one per
        // child parity, and our target slot is the one matching our parity.
        let coarse_table =
            NeighborTable::search(&tree, &table, LogicalLocation::new(1, 1, 0, 0), &ranklist, &nslist);
        let subfaces: Vec<_> = coarse_table
            .records
            .iter()
            .filter(|r| r.offset == [-1, 0, 0])
            .collect();
        assert_eq!(subfaces.len(), 2);
        assert!(subfaces.iter().any(|r| r.bufid == coarse.target_bufid));
        assert_eq!(subfaces[0].fi[0], 0);
        assert_eq!(subfaces[1].fi[0], 1);
    }
}
