//! The AMR engine: collective restructuring of the forest, the rank
//! assignment and the block data.
//!
//! The cycle runs in phases. A: gather the refinement votes and the cost
//! list from all ranks. B: keep only complete derefinement octets and
//! reduce them to parent locations, deepest first. C: edit the forest and
//! re-enumerate it, deriving the new-to-old and old-to-new gid maps.
//! D: inherit costs. E: rebalance. F: migrate block data (same-level copy,
//! restriction, or halo-extended prolongation source) between old and new
//! owners. G: swap the bookkeeping triplet atomically and rebuild neighbor
//! tables. Every rank executes the same phases on the same gathered data,
//! so all ranks agree on the outcome without further negotiation.

use std::collections::HashMap;

use crate::comm::{decode_f64s, encode_f64s};
use crate::error::{Result, RillError};
use crate::geometry::LogicalLocation;
use crate::mesh::balance::load_balance;
use crate::mesh::block::{Block, RefineFlag};
use crate::mesh::Mesh;
use crate::state::{Octant, TransferKind};

/// Tag space for AMR point-to-point transfers: the destination lid plus the
/// source sub-octant, which disambiguates the up-to-2^dim restriction
/// messages converging on one coarse block.
const AMR_TAG: u64 = 1 << 32;

fn amr_tag(lid: usize, octant: Octant) -> u64 {
    AMR_TAG
        | ((lid as u64) << 3)
        | ((octant[0] as u64) << 2)
        | ((octant[1] as u64) << 1)
        | (octant[2] as u64)
}

fn encode_locs(locs: &[LogicalLocation]) -> Vec<u8> {
    bincode::encode_to_vec(locs, bincode::config::standard())
        .expect("location list encodes to bytes")
}

fn decode_locs(bytes: &[u8]) -> Result<Vec<LogicalLocation>> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(locs, _)| locs)
        .map_err(|err| RillError::Topology(format!("corrupt AMR gather payload: {err}")))
}

/// One expected incoming transfer of Phase F.
struct PendingRecv {
    dest_gid: usize,
    kind: TransferKind,
    octant: Octant,
    src_rank: usize,
    tag: u64,
}

impl Mesh {
    /// Runs one collective AMR cycle. All ranks must call this together;
    /// on return every rank holds the same new bookkeeping triplet and a
    /// coherent local block list with fresh neighbor tables.
    pub fn adaptive_refinement(&mut self) -> Result<()> {
        let nlbl = 1usize << self.dim;
        let my_rank = self.comm.rank();
        let nranks = self.comm.size();

        // Phase A: gather the candidate lists.
        let my_ref: Vec<LogicalLocation> = self
            .blocks
            .iter()
            .filter(|b| b.refine_flag == RefineFlag::Refine && b.loc.level < self.max_level)
            .map(|b| b.loc)
            .collect();
        let my_deref: Vec<LogicalLocation> = self
            .blocks
            .iter()
            .filter(|b| b.refine_flag == RefineFlag::Coarsen && b.loc.level > self.root_level)
            .map(|b| b.loc)
            .collect();

        let mut lref = Vec::new();
        for bytes in self.comm.all_gather(&encode_locs(&my_ref)) {
            lref.extend(decode_locs(&bytes)?);
        }
        let mut lderef = Vec::new();
        for bytes in self.comm.all_gather(&encode_locs(&my_deref)) {
            lderef.extend(decode_locs(&bytes)?);
        }

        if lref.is_empty() && lderef.is_empty() {
            return Ok(());
        }

        // The cost list travels with the same collective round; it is only
        // consumed in Phase D.
        let my_costs: Vec<f64> = self.blocks.iter().map(|b| b.cost).collect();
        let mut costlist = self.costlist.clone();
        for (rank, bytes) in self.comm.all_gather(&encode_f64s(&my_costs)).into_iter().enumerate() {
            for (offset, cost) in decode_f64s(&bytes).into_iter().enumerate() {
                costlist[self.nslist[rank] + offset] = cost;
            }
        }

        // Phase B: complete octets only, reduced to parents, deepest first.
        let parents = coalesce_derefinements(&lderef, nlbl, self.dim);

        // Phase C: tree edits, refinements before derefinements.
        let mut nnew = 0i64;
        let mut ndel = 0i64;
        for loc in &lref {
            let node = self.tree.find(*loc).ok_or_else(|| {
                RillError::Topology(format!("refinement target {loc:?} is not in the forest"))
            })?;
            self.tree.refine(node, &mut nnew)?;
        }
        for loc in &parents {
            if let Some(node) = self.tree.find(*loc) {
                self.tree.derefine(node, &mut ndel);
            }
        }

        let ntot = (self.nbtotal as i64 + nnew - ndel) as usize;

        let mut newloc = Vec::new();
        let mut newtoold = Vec::new();
        self.tree.block_list(&mut newloc, Some(&mut newtoold));
        if newloc.len() != ntot {
            return Err(RillError::TreeReconstruction {
                stored: ntot,
                rebuilt: newloc.len(),
            });
        }

        // Old-to-new map: runs of consecutive old gids are retained blocks,
        // a jump of nlbl closes a derefined group, and a derefined tail is
        // back-filled onto the last new block.
        let mut oldtonew = vec![0usize; self.nbtotal];
        let mut k = 1;
        for n in 1..ntot {
            if newtoold[n] == newtoold[n - 1] + 1 {
                oldtonew[k] = n;
                k += 1;
            } else if newtoold[n] == newtoold[n - 1] + nlbl {
                for _ in 0..nlbl - 1 {
                    oldtonew[k] = n - 1;
                    k += 1;
                }
                oldtonew[k] = n;
                k += 1;
            }
        }
        while k < self.nbtotal {
            oldtonew[k] = ntot - 1;
            k += 1;
        }

        // Phase D: cost inheritance.
        let mut newcost = vec![0.0; ntot];
        for n in 0..ntot {
            let p = newtoold[n];
            if newloc[n].level >= self.loclist[p].level {
                newcost[n] = costlist[p];
            } else {
                newcost[n] = costlist[p..p + nlbl].iter().sum::<f64>() / nlbl as f64;
            }
        }

        // Phase E: new load balance; the old assignment is kept around to
        // schedule the migration.
        let balance = load_balance(&newcost, nranks, self.adaptive, my_rank)?;
        let old_range = self.local_range();
        let new_range = balance.local_range(my_rank);

        // Phase F: data migration.
        //
        // Expected receives are enumerated first in a deterministic order;
        // with the eager transports this fixes the matching order rather
        // than posting anything.
        let mut recvs: Vec<PendingRecv> = Vec::new();
        for n in new_range.clone() {
            let p = newtoold[n];
            let lid = n - new_range.start;

            if self.loclist[p].level > newloc[n].level {
                for l in 0..nlbl {
                    let src_rank = self.ranklist[p + l];
                    if src_rank == my_rank {
                        continue;
                    }
                    let octant = self.loclist[p + l].octant();
                    recvs.push(PendingRecv {
                        dest_gid: n,
                        kind: TransferKind::FineToCoarse,
                        octant,
                        src_rank,
                        tag: amr_tag(lid, octant),
                    });
                }
            } else {
                let src_rank = self.ranklist[p];
                if src_rank == my_rank {
                    continue;
                }
                let kind = if self.loclist[p].level == newloc[n].level {
                    TransferKind::Same
                } else {
                    TransferKind::CoarseToFine
                };
                recvs.push(PendingRecv {
                    dest_gid: n,
                    kind,
                    octant: [0, 0, 0],
                    src_rank,
                    tag: amr_tag(lid, [0, 0, 0]),
                });
            }
        }

        // Pack and send everything leaving this rank.
        let mut old_blocks: HashMap<usize, Block> =
            self.blocks.drain(..).map(|b| (b.gid, b)).collect();
        let mut buf = Vec::new();

        for n in old_range.clone() {
            let nn = oldtonew[n];
            let oloc = self.loclist[n];
            let nloc = newloc[nn];

            if nloc.level == oloc.level {
                let dest = balance.rank[nn];
                if dest == my_rank {
                    continue;
                }
                let block = old_blocks.get_mut(&n).expect("old local block");
                block.state.pack(TransferKind::Same, [0, 0, 0], &mut buf);
                self.comm.send(
                    dest,
                    amr_tag(nn - balance.start[dest], [0, 0, 0]),
                    encode_f64s(&buf),
                );
            } else if nloc.level > oloc.level {
                // This coarse block feeds every remote child a halo-extended
                // quarter of itself.
                for l in 0..nlbl {
                    let dest = balance.rank[nn + l];
                    if dest == my_rank {
                        continue;
                    }
                    let octant = newloc[nn + l].octant();
                    let block = old_blocks.get_mut(&n).expect("old local block");
                    block
                        .state
                        .pack(TransferKind::CoarseToFine, octant, &mut buf);
                    self.comm.send(
                        dest,
                        amr_tag(nn + l - balance.start[dest], [0, 0, 0]),
                        encode_f64s(&buf),
                    );
                }
            } else {
                let dest = balance.rank[nn];
                if dest == my_rank {
                    continue;
                }
                let octant = oloc.octant();
                let block = old_blocks.get_mut(&n).expect("old local block");
                block
                    .state
                    .pack(TransferKind::FineToCoarse, octant, &mut buf);
                self.comm.send(
                    dest,
                    amr_tag(nn - balance.start[dest], octant),
                    encode_f64s(&buf),
                );
            }
        }

        // Build the new local list; local-to-local transfers run in place.
        let mut new_blocks: Vec<Block> = Vec::with_capacity(new_range.len());
        for n in new_range.clone() {
            let p = newtoold[n];
            let lid = n - new_range.start;
            let same_level = newloc[n].level == self.loclist[p].level;

            if same_level && self.ranklist[p] == my_rank {
                let mut block = old_blocks.remove(&p).expect("old local block");
                block.gid = n;
                block.lid = lid;
                block.cost = newcost[n];
                new_blocks.push(block);
                continue;
            }

            let (region, boundary) = self.block_geometry(newloc[n]);
            let mut block = Block::new(n, lid, newloc[n], region, boundary, self.factory.create());
            block.cost = newcost[n];

            if self.loclist[p].level > newloc[n].level {
                for l in 0..nlbl {
                    if self.ranklist[p + l] != my_rank {
                        continue;
                    }
                    let octant = self.loclist[p + l].octant();
                    let src = old_blocks.get_mut(&(p + l)).expect("old local sibling");
                    src.state.pack(TransferKind::FineToCoarse, octant, &mut buf);
                    block.state.unpack(TransferKind::FineToCoarse, octant, &buf);
                }
            } else if self.loclist[p].level < newloc[n].level && self.ranklist[p] == my_rank {
                let octant = newloc[n].octant();
                let src = old_blocks.get_mut(&p).expect("old local parent");
                src.state.pack(TransferKind::CoarseToFine, octant, &mut buf);
                block.state.unpack(TransferKind::CoarseToFine, [0, 0, 0], &buf);
            }

            new_blocks.push(block);
        }

        // Wait on each expected message and unpack it.
        for pending in recvs {
            let bytes = self.comm.recv(pending.src_rank, pending.tag);
            let words = decode_f64s(&bytes);
            let block = &mut new_blocks[pending.dest_gid - new_range.start];
            block.state.unpack(pending.kind, pending.octant, &words);
        }

        drop(old_blocks);

        // Phase G: swap the bookkeeping atomically, then rebuild the
        // neighbor tables against the new forest.
        self.current_level = newloc
            .iter()
            .map(|loc| loc.level)
            .max()
            .unwrap_or(self.root_level);
        self.loclist = newloc;
        self.ranklist = balance.rank;
        self.costlist = newcost;
        self.nslist = balance.start;
        self.nblist = balance.count;
        self.nbtotal = ntot;
        self.blocks = new_blocks;

        for block in &mut self.blocks {
            block.refine_flag = RefineFlag::Keep;
            block.search_neighbors(&self.tree, &self.buffers, &self.ranklist, &self.nslist);
        }

        if let Some(exchange) = self.boundary.as_mut() {
            exchange.clear();
            exchange.initialize(&self.blocks);
        }

        Ok(())
    }
}

/// Keeps only derefinement candidates whose whole sibling octet voted to
/// coarsen, and reduces each octet to its parent location. Candidates
/// arrive in gid order, so a complete octet occupies consecutive entries.
fn coalesce_derefinements(
    lderef: &[LogicalLocation],
    nlbl: usize,
    dim: usize,
) -> Vec<LogicalLocation> {
    if lderef.len() < nlbl {
        return Vec::new();
    }

    let lj = (dim >= 2) as i64;
    let lk = (dim == 3) as i64;

    let mut parents = Vec::new();
    for (n, loc) in lderef.iter().enumerate() {
        if loc.octant() != [0, 0, 0] || n + nlbl > lderef.len() {
            continue;
        }

        let mut matched = 0;
        let mut r = n;
        for k in 0..=lk {
            for j in 0..=lj {
                for i in 0..=1i64 {
                    let sibling = &lderef[r];
                    if sibling.lx1 == loc.lx1 + i
                        && sibling.lx2 == loc.lx2 + j
                        && sibling.lx3 == loc.lx3 + k
                        && sibling.level == loc.level
                    {
                        matched += 1;
                    }
                    r += 1;
                }
            }
        }

        if matched == nlbl {
            parents.push(loc.parent());
        }
    }

    parents.sort();
    parents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SoloComm, ThreadComm};
    use crate::config::MeshConfig;
    use crate::mesh::tests::hydro_factory;
    use crate::state::HydroState;

    fn config_2x2() -> MeshConfig {
        MeshConfig::from_toml_str(
            r#"
            [time]
            tlim = 1.0
            cfl_number = 0.3

            [mesh]
            nx1 = 16
            nx2 = 16
            x1min = 0.0
            x1max = 1.0
            x2min = 0.0
            x2max = 1.0
            refinement = "adaptive"
            numlevel = 3

            [meshblock]
            nx1 = 8
            nx2 = 8
            "#,
        )
        .expect("valid toml")
    }

    /// Fills every cell (ghosts included) with a linear function of the
    /// physical coordinates, so prolongation and restriction are exact.
    fn linear_problem(block: &mut Block) {
        let [n1, n2, n3] = block
            .state
            .as_any_mut()
            .downcast_mut::<HydroState>()
            .expect("hydro state")
            .ncells();
        let xs: Vec<f64> = (0..n1).map(|i| block.cell_center(0, i)).collect();
        let ys: Vec<f64> = (0..n2).map(|j| block.cell_center(1, j)).collect();
        let state = block
            .state
            .as_any_mut()
            .downcast_mut::<HydroState>()
            .expect("hydro state");
        for n in 0..state.nhydro() {
            for k in 0..n3 {
                for j in 0..n2 {
                    for i in 0..n1 {
                        let x = xs[i];
                        let y = ys[j];
                        let v = 1.0 + n as f64 + 2.0 * x - 0.5 * y;
                        state.set_cell(n, k, j, i, v);
                    }
                }
            }
        }
    }

    fn expect_linear(block: &Block) {
        let state = block
            .state
            .as_any()
            .downcast_ref::<HydroState>()
            .expect("hydro state");
        let [is, js, _] = state.interior_start();
        let nx = block.region.nx;
        for n in 0..state.nhydro() {
            for j in js..js + nx[1] {
                for i in is..is + nx[0] {
                    let x = block.cell_center(0, i);
                    let y = block.cell_center(1, j);
                    let expected = 1.0 + n as f64 + 2.0 * x - 0.5 * y;
                    let got = state.cell(n, 0, j, i);
                    assert!(
                        (got - expected).abs() < 1e-12,
                        "block {} cell ({n},{j},{i}): {got} != {expected}",
                        block.gid
                    );
                }
            }
        }
    }

    #[test]
    fn no_flags_is_identity() {
        let config = config_2x2();
        let factory = hydro_factory(&config, false);
        let mut mesh = Mesh::new(config, Box::new(SoloComm::new()), factory).unwrap();

        for block in &mut mesh.blocks {
            linear_problem(block);
        }

        let loclist = mesh.loclist().to_vec();
        mesh.adaptive_refinement().unwrap();

        assert_eq!(mesh.loclist(), &loclist[..]);
        assert_eq!(mesh.nbtotal(), 4);
        for block in &mesh.blocks {
            expect_linear(block);
        }
    }

    #[test]
    fn refine_then_derefine_round_trip() {
        let config = config_2x2();
        let factory = hydro_factory(&config, false);
        let mut mesh = Mesh::new(config, Box::new(SoloComm::new()), factory).unwrap();
        let root_level = mesh.loclist()[0].level;

        for block in &mut mesh.blocks {
            linear_problem(block);
        }

        // Refine the (1,1) block.
        mesh.blocks[3].refine_flag = RefineFlag::Refine;
        mesh.adaptive_refinement().unwrap();

        assert_eq!(mesh.nbtotal(), 7);
        mesh.verify_bookkeeping().unwrap();
        for block in &mesh.blocks {
            expect_linear(block);
        }

        // All four children vote to coarsen.
        for block in &mut mesh.blocks {
            if block.loc.level == root_level + 1 {
                block.refine_flag = RefineFlag::Coarsen;
            }
        }
        mesh.adaptive_refinement().unwrap();

        assert_eq!(mesh.nbtotal(), 4);
        mesh.verify_bookkeeping().unwrap();
        // The coarsened block equals the restriction of its children, which
        // for linear data is the original field.
        for block in &mesh.blocks {
            expect_linear(block);
        }
    }

    #[test]
    fn partial_octet_does_not_derefine() {
        let config = config_2x2();
        let factory = hydro_factory(&config, false);
        let mut mesh = Mesh::new(config, Box::new(SoloComm::new()), factory).unwrap();
        let root_level = mesh.loclist()[0].level;

        for block in &mut mesh.blocks {
            linear_problem(block);
        }

        mesh.blocks[0].refine_flag = RefineFlag::Refine;
        mesh.adaptive_refinement().unwrap();
        assert_eq!(mesh.nbtotal(), 7);

        // Three of four children asking to coarsen is not enough.
        let mut flagged = 0;
        for block in &mut mesh.blocks {
            if block.loc.level == root_level + 1 && flagged < 3 {
                block.refine_flag = RefineFlag::Coarsen;
                flagged += 1;
            }
        }
        assert_eq!(flagged, 3);
        mesh.adaptive_refinement().unwrap();
        assert_eq!(mesh.nbtotal(), 7);
    }

    #[test]
    fn coalesce_requires_full_octet() {
        let base = LogicalLocation::new(2, 2, 2, 0);
        let mut octet = Vec::new();
        for j in 0..2 {
            for i in 0..2 {
                octet.push(LogicalLocation::new(2, 2 + i, 2 + j, 0));
            }
        }

        let parents = coalesce_derefinements(&octet, 4, 2);
        assert_eq!(parents, vec![base.parent()]);

        let partial = &octet[..3];
        assert!(coalesce_derefinements(partial, 4, 2).is_empty());

        // Deeper parents sort first.
        let mut mixed = octet.clone();
        for j in 0..2 {
            for i in 0..2 {
                mixed.push(LogicalLocation::new(3, i, j, 0));
            }
        }
        let parents = coalesce_derefinements(&mixed, 4, 2);
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0].level, 2);
        assert_eq!(parents[1].level, 1);
    }

    #[test]
    fn initialize_settles_at_max_level() {
        let config = config_2x2();
        let factory = hydro_factory(&config, false);
        let mut mesh = Mesh::new(config, Box::new(SoloComm::new()), factory).unwrap();

        mesh.enroll_time_step_estimator(|b| b.region.min_spacing());
        // Keep refining whichever block holds the domain corner; the level
        // cap stops the cascade at numlevel.
        mesh.enroll_refinement_criterion(|block| {
            if block.region.xmin[0] == 0.0 && block.region.xmin[1] == 0.0 {
                RefineFlag::Refine
            } else {
                RefineFlag::Keep
            }
        });

        mesh.initialize(linear_problem).unwrap();

        let max = mesh.loclist().iter().map(|l| l.level).max().unwrap();
        assert_eq!(max, config_2x2().max_level());
        assert_eq!(mesh.nbtotal(), 10);
        mesh.verify_bookkeeping().unwrap();

        assert!(mesh.find_block(0).is_some());
        assert_eq!(mesh.total_cells(), 10 * 64);

        // The first dt comes from the finest spacing.
        let expected = 0.3 * (0.125 / 8.0);
        assert!((mesh.dt - expected).abs() < 1e-14);
    }

    #[test]
    fn boundary_exchange_follows_the_forest() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        use crate::mesh::BoundaryExchange;

        struct Recorder {
            inits: Arc<AtomicUsize>,
            clears: Arc<AtomicUsize>,
            blocks_seen: Arc<AtomicUsize>,
        }

        impl BoundaryExchange for Recorder {
            fn initialize(&mut self, blocks: &[Block]) {
                self.inits.fetch_add(1, Ordering::SeqCst);
                self.blocks_seen.store(blocks.len(), Ordering::SeqCst);
            }

            fn clear(&mut self) {
                self.clears.fetch_add(1, Ordering::SeqCst);
            }
        }

        let config = config_2x2();
        let factory = hydro_factory(&config, false);
        let mut mesh = Mesh::new(config, Box::new(SoloComm::new()), factory).unwrap();

        let inits = Arc::new(AtomicUsize::new(0));
        let clears = Arc::new(AtomicUsize::new(0));
        let blocks_seen = Arc::new(AtomicUsize::new(0));
        mesh.enroll_boundary_exchange(Box::new(Recorder {
            inits: inits.clone(),
            clears: clears.clone(),
            blocks_seen: blocks_seen.clone(),
        }));
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(blocks_seen.load(Ordering::SeqCst), 4);

        // A cycle with no votes leaves the exchange untouched.
        mesh.adaptive_refinement().unwrap();
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(clears.load(Ordering::SeqCst), 0);

        mesh.blocks[0].refine_flag = RefineFlag::Refine;
        mesh.adaptive_refinement().unwrap();

        assert_eq!(clears.load(Ordering::SeqCst), 1);
        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert_eq!(blocks_seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn migration_across_two_ranks() {
        let comms = ThreadComm::connect(2);

        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let config = config_2x2();
                        let factory = hydro_factory(&config, false);
                        let mut mesh = Mesh::new(config, Box::new(comm), factory).unwrap();
                        let root_level = mesh.loclist()[0].level;

                        assert_eq!(mesh.blocks.len(), 2);
                        for block in &mut mesh.blocks {
                            linear_problem(block);
                        }

                        // Rank 1 refines its last block; the rebalance moves
                        // blocks between ranks and every payload must arrive
                        // transformed correctly.
                        for block in &mut mesh.blocks {
                            if block.gid == 3 {
                                block.refine_flag = RefineFlag::Refine;
                            }
                        }
                        mesh.adaptive_refinement().unwrap();

                        assert_eq!(mesh.nbtotal(), 7);
                        mesh.verify_bookkeeping().unwrap();
                        assert!(!mesh.blocks.is_empty());
                        for block in &mesh.blocks {
                            expect_linear(block);
                        }

                        // And back down again.
                        for block in &mut mesh.blocks {
                            if block.loc.level == root_level + 1 {
                                block.refine_flag = RefineFlag::Coarsen;
                            }
                        }
                        mesh.adaptive_refinement().unwrap();

                        assert_eq!(mesh.nbtotal(), 4);
                        mesh.verify_bookkeeping().unwrap();
                        for block in &mesh.blocks {
                            expect_linear(block);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().expect("rank thread");
            }
        });
    }
}
