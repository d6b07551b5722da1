//! The `Mesh` type: owner of the refinement forest, the global block
//! bookkeeping and the rank-local block list.
//!
//! Every rank holds the full `loclist`/`ranklist`/`costlist` triplet, but
//! instantiates only the blocks of its contiguous gid range. All non-local
//! mutations (time-step reduction, AMR, checkpointing) are collective:
//! every rank must enter them, and every rank leaves with the same global
//! view.

use log::{info, warn};

use crate::comm::Communicator;
use crate::config::{BoundaryKind, MeshConfig};
use crate::error::{Result, RillError};
use crate::geometry::{BlockTree, LogicalLocation, RegionSize};
use crate::state::StateFactory;

mod amr;
mod balance;
mod block;
mod checkpoint;

pub use balance::{load_balance, Balance};
pub use block::{Block, BufferTable, NeighborBlock, NeighborKind, NeighborTable, RefineFlag};

type FlagFn = Box<dyn Fn(&Block) -> RefineFlag + Send + Sync>;
type DtFn = Box<dyn Fn(&Block) -> f64 + Send + Sync>;

/// Handle to the ghost-zone exchange protocol. The protocol itself lives
/// with the solver; the mesh only tells the handle when the block layout
/// and neighbor tables it caches have been rebuilt.
pub trait BoundaryExchange: Send {
    /// Rebuilds the per-block exchange buffers from fresh neighbor tables.
    fn initialize(&mut self, blocks: &[Block]);

    /// Releases buffers tied to the previous block layout.
    fn clear(&mut self);
}

pub struct Mesh {
    config: MeshConfig,

    pub time: f64,
    pub dt: f64,
    pub ncycle: i64,
    pub start_time: f64,
    pub tlim: f64,
    pub cfl_number: f64,
    pub nlim: i64,

    mesh_size: RegionSize,
    mesh_bcs: [BoundaryKind; 6],
    block_nx: [usize; 3],
    nrbx: [i64; 3],
    dim: usize,
    root_level: i32,
    current_level: i32,
    max_level: i32,
    multilevel: bool,
    adaptive: bool,

    tree: BlockTree,
    buffers: BufferTable,

    loclist: Vec<LogicalLocation>,
    ranklist: Vec<usize>,
    costlist: Vec<f64>,
    nslist: Vec<usize>,
    nblist: Vec<usize>,
    nbtotal: usize,

    pub blocks: Vec<Block>,

    comm: Box<dyn Communicator>,
    factory: Box<dyn StateFactory>,
    flag_fn: Option<FlagFn>,
    dt_fn: Option<DtFn>,
    boundary: Option<Box<dyn BoundaryExchange>>,
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("time", &self.time)
            .field("ncycle", &self.ncycle)
            .field("nbtotal", &self.nbtotal)
            .finish_non_exhaustive()
    }
}

impl Mesh {
    /// Builds the mesh from configuration: forest, load balance, rank-local
    /// blocks and their neighbor tables.
    pub fn new(
        config: MeshConfig,
        comm: Box<dyn Communicator>,
        factory: Box<dyn StateFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let (tree, current_level) = Self::build_forest(&config)?;
        let multilevel = config.multilevel();

        let face_only = !(factory.face_fields() || multilevel);
        let buffers = BufferTable::new(config.dim(), multilevel, face_only);

        let mut tree = tree;
        let mut loclist = Vec::new();
        tree.block_list(&mut loclist, None);
        let nbtotal = loclist.len();

        if comm.rank() == 0 {
            info!(
                "root grid = {} x {} x {}, {} blocks",
                config.nrbx()[0],
                config.nrbx()[1],
                config.nrbx()[2],
                nbtotal
            );
        }

        if nbtotal < comm.size() {
            return Err(RillError::Topology(format!(
                "too few blocks: nbtotal ({nbtotal}) < nranks ({})",
                comm.size()
            )));
        }

        let costlist = vec![1.0; nbtotal];
        let balance = load_balance(&costlist, comm.size(), config.adaptive(), comm.rank())?;

        let mut mesh = Self {
            time: config.time.start_time,
            dt: 0.4 * f64::MAX,
            ncycle: 0,
            start_time: config.time.start_time,
            tlim: config.time.tlim,
            cfl_number: config.time.cfl_number,
            nlim: config.time.nlim,

            mesh_size: config.mesh_region(),
            mesh_bcs: config.boundary_kinds(),
            block_nx: config.block_nx(),
            nrbx: config.nrbx(),
            dim: config.dim(),
            root_level: config.root_level(),
            current_level,
            max_level: config.max_level(),
            multilevel,
            adaptive: config.adaptive(),

            tree,
            buffers,

            loclist,
            ranklist: balance.rank,
            costlist,
            nslist: balance.start,
            nblist: balance.count,
            nbtotal,

            blocks: Vec::new(),

            comm,
            factory,
            flag_fn: None,
            dt_fn: None,
            boundary: None,

            config,
        };

        mesh.create_local_blocks();
        Ok(mesh)
    }

    /// Builds the forest from the root grid and the static refinement
    /// regions. Returns the tree and the deepest level present.
    fn build_forest(config: &MeshConfig) -> Result<(BlockTree, i32)> {
        let nrbx = config.nrbx();
        let root_level = config.root_level();
        let dim = config.dim();
        let mesh_size = config.mesh_region();

        let mut tree = BlockTree::new(nrbx, root_level, dim, config.periodic());
        let mut current_level = root_level;

        for region in &config.refinement_regions {
            let lrlev = root_level + region.level as i32;
            current_level = current_level.max(lrlev);

            // Bracket the region on the virtual grid of the target level,
            // then snap to even/odd indices so whole sibling groups are
            // covered.
            let mut lmin = [0i64; 3];
            let mut lmax = [1i64; 3];
            for axis in 0..dim {
                let lxtot = nrbx[axis] << region.level;

                let mut lo = 0;
                while lo < lxtot {
                    if mesh_size.position(axis, (lo + 1) as f64 / lxtot as f64) > region.min(axis) {
                        break;
                    }
                    lo += 1;
                }
                let mut hi = lo;
                while hi < lxtot {
                    if mesh_size.position(axis, (hi + 1) as f64 / lxtot as f64) >= region.max(axis)
                    {
                        break;
                    }
                    hi += 1;
                }

                if lo % 2 == 1 {
                    lo -= 1;
                }
                if hi % 2 == 0 {
                    hi += 1;
                }
                lmin[axis] = lo;
                lmax[axis] = hi;
            }

            let mut nnew = 0;
            for k in (lmin[2]..lmax[2]).step_by(2) {
                for j in (lmin[1]..lmax[1]).step_by(2) {
                    for i in (lmin[0]..lmax[0]).step_by(2) {
                        tree.add_block(LogicalLocation::new(lrlev, i, j, k), &mut nnew)?;
                    }
                }
            }
        }

        Ok((tree, current_level))
    }

    /// Instantiates this rank's blocks and their neighbor tables.
    fn create_local_blocks(&mut self) {
        let range = self.local_range();
        self.blocks = range
            .clone()
            .map(|gid| {
                let (region, boundary) = self.block_geometry(self.loclist[gid]);
                Block::new(
                    gid,
                    gid - range.start,
                    self.loclist[gid],
                    region,
                    boundary,
                    self.factory.create(),
                )
            })
            .collect();

        for block in &mut self.blocks {
            block.search_neighbors(&self.tree, &self.buffers, &self.ranklist, &self.nslist);
        }
    }

    /// Physical extent and boundary kinds of a block at `loc`. Faces
    /// touching another block get `BoundaryKind::Interior`; domain faces
    /// inherit the mesh boundary kinds.
    pub fn block_geometry(&self, loc: LogicalLocation) -> (RegionSize, [BoundaryKind; 6]) {
        let mut region = RegionSize {
            xmin: [0.0; 3],
            xmax: [0.0; 3],
            nx: self.block_nx,
            ratio: self.mesh_size.ratio,
        };
        let mut bcs = [BoundaryKind::Interior; 6];

        for axis in 0..3 {
            if self.mesh_size.nx[axis] == 1 {
                region.xmin[axis] = self.mesh_size.xmin[axis];
                region.xmax[axis] = self.mesh_size.xmax[axis];
                bcs[2 * axis] = self.mesh_bcs[2 * axis];
                bcs[2 * axis + 1] = self.mesh_bcs[2 * axis + 1];
                continue;
            }

            let extent = self.nrbx[axis] << (loc.level - self.root_level);
            let lx = loc.coords()[axis];

            if lx == 0 {
                region.xmin[axis] = self.mesh_size.xmin[axis];
                bcs[2 * axis] = self.mesh_bcs[2 * axis];
            } else {
                region.xmin[axis] = self
                    .mesh_size
                    .position(axis, lx as f64 / extent as f64);
            }

            if lx == extent - 1 {
                region.xmax[axis] = self.mesh_size.xmax[axis];
                bcs[2 * axis + 1] = self.mesh_bcs[2 * axis + 1];
            } else {
                region.xmax[axis] = self
                    .mesh_size
                    .position(axis, (lx + 1) as f64 / extent as f64);
            }
        }

        (region, bcs)
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn nranks(&self) -> usize {
        self.comm.size()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nbtotal(&self) -> usize {
        self.nbtotal
    }

    pub fn adaptive(&self) -> bool {
        self.adaptive
    }

    pub fn loclist(&self) -> &[LogicalLocation] {
        &self.loclist
    }

    pub fn ranklist(&self) -> &[usize] {
        &self.ranklist
    }

    pub fn costlist(&self) -> &[f64] {
        &self.costlist
    }

    pub fn local_range(&self) -> std::ops::Range<usize> {
        let rank = self.comm.rank();
        self.nslist[rank]..self.nslist[rank] + self.nblist[rank]
    }

    /// The block with the given gid, if it lives on this rank.
    pub fn find_block(&self, gid: usize) -> Option<&Block> {
        let range = self.local_range();
        range.contains(&gid).then(|| &self.blocks[gid - range.start])
    }

    pub fn find_block_mut(&mut self, gid: usize) -> Option<&mut Block> {
        let range = self.local_range();
        range
            .contains(&gid)
            .then(|| &mut self.blocks[gid - range.start])
    }

    /// Registers the user refinement criterion evaluated on every local
    /// block before an AMR step.
    pub fn enroll_refinement_criterion(
        &mut self,
        f: impl Fn(&Block) -> RefineFlag + Send + Sync + 'static,
    ) {
        self.flag_fn = Some(Box::new(f));
    }

    /// Registers the per-block time-step estimate.
    pub fn enroll_time_step_estimator(
        &mut self,
        f: impl Fn(&Block) -> f64 + Send + Sync + 'static,
    ) {
        self.dt_fn = Some(Box::new(f));
    }

    /// Attaches the ghost-zone exchange handle. It is initialized against
    /// the current block list here and reinitialized after every AMR cycle.
    pub fn enroll_boundary_exchange(&mut self, mut exchange: Box<dyn BoundaryExchange>) {
        exchange.initialize(&self.blocks);
        self.boundary = Some(exchange);
    }

    /// Evaluates the refinement criterion on every local block.
    pub fn set_refine_flags(&mut self) {
        let Some(flag_fn) = self.flag_fn.take() else {
            return;
        };

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            self.blocks
                .par_iter_mut()
                .for_each(|block| block.refine_flag = flag_fn(block));
        }

        #[cfg(not(feature = "parallel"))]
        self.blocks
            .iter_mut()
            .for_each(|block| block.refine_flag = flag_fn(block));

        self.flag_fn = Some(flag_fn);
    }

    /// Evaluates the time-step estimate on every local block.
    pub fn compute_block_timesteps(&mut self) {
        let Some(dt_fn) = self.dt_fn.take() else {
            return;
        };

        for block in &mut self.blocks {
            let dt = dt_fn(block);
            block.state.set_new_block_dt(dt);
        }

        self.dt_fn = Some(dt_fn);
    }

    /// Reduces the minimum block time step over all ranks and advances the
    /// global `dt`, capped at twice the previous step and clipped to the
    /// remaining simulation time.
    pub fn new_time_step(&mut self) -> f64 {
        let local = self
            .blocks
            .iter()
            .map(|b| b.state.new_block_dt())
            .fold(f64::INFINITY, f64::min);

        let min_dt = self.comm.all_reduce_min(local);
        self.dt = (min_dt * self.cfl_number).min(2.0 * self.dt);
        if self.time < self.tlim && self.tlim - self.time < self.dt {
            self.dt = self.tlim - self.time;
        }
        self.dt
    }

    /// Applies the problem generator, settles the initial forest under the
    /// refinement criterion when AMR is enabled, and derives the first time
    /// step.
    pub fn initialize(&mut self, problem: impl Fn(&mut Block)) -> Result<()> {
        let initial_total = self.nbtotal;

        loop {
            for block in &mut self.blocks {
                problem(block);
            }

            if !self.adaptive {
                break;
            }

            let before = self.nbtotal;
            self.set_refine_flags();
            self.adaptive_refinement()?;

            if self.nbtotal == before {
                break;
            }
            if self.nbtotal < before && self.comm.rank() == 0 {
                warn!(
                    "the number of blocks decreased during AMR grid initialization; \
                     the refinement criteria may have a problem"
                );
            }
            if self.nbtotal > 2 * initial_total && self.comm.rank() == 0 {
                warn!(
                    "the number of blocks increased more than twice during initialization; \
                     more computing power than expected may be required"
                );
            }
        }

        self.compute_block_timesteps();
        self.new_time_step();
        Ok(())
    }

    /// Sum of each conservative variable over the whole mesh, reduced over
    /// all ranks. Logged from rank 0 as a conservation diagnostic.
    pub fn total_conservatives(&self) -> Vec<f64> {
        let mut local: Vec<f64> = Vec::new();
        for block in &self.blocks {
            let totals = block.state.conservative_totals(block.region.cell_volume());
            if local.is_empty() {
                local = totals;
            } else {
                for (acc, v) in local.iter_mut().zip(totals) {
                    *acc += v;
                }
            }
        }

        let reduced = self.comm.all_reduce_sum(&local);
        if self.comm.rank() == 0 {
            info!("total conservatives: {reduced:?}");
        }
        reduced
    }

    /// Total cell count, for performance accounting.
    pub fn total_cells(&self) -> u64 {
        self.nbtotal as u64 * self.block_nx.iter().product::<usize>() as u64
    }

    /// Builds the forest and load balance for a hypothetical rank count
    /// without instantiating any blocks, and logs the layout. The
    /// too-few-blocks condition is a warning here rather than a fatal.
    pub fn mesh_test(config: &MeshConfig, nranks: usize) -> Result<()> {
        config.validate()?;

        let (mut tree, current_level) = Self::build_forest(config)?;
        let mut loclist = Vec::new();
        tree.block_list(&mut loclist, None);

        info!(
            "logical root level = {}, deepest level = {}",
            config.root_level(),
            current_level
        );

        if loclist.len() < nranks {
            warn!(
                "too few blocks: nbtotal ({}) < nranks ({nranks})",
                loclist.len()
            );
            return Ok(());
        }

        let costlist = vec![1.0; loclist.len()];
        let balance = load_balance(&costlist, nranks, config.adaptive(), 0)?;

        for level in config.root_level()..=current_level {
            let count = loclist.iter().filter(|loc| loc.level == level).count();
            if count > 0 {
                info!(
                    "level {} (logical {level}): {count} blocks",
                    level - config.root_level()
                );
            }
        }
        for rank in 0..nranks {
            let cost: f64 = balance.local_range(rank).map(|g| costlist[g]).sum();
            info!(
                "rank {rank}: {} blocks, cost = {cost}",
                balance.count[rank]
            );
        }

        Ok(())
    }

    /// Checks the universal bookkeeping invariants. Used by tests after
    /// every collective mutation.
    pub fn verify_bookkeeping(&mut self) -> Result<()> {
        let nranks = self.comm.size();

        for (gid, &rank) in self.ranklist.iter().enumerate() {
            if rank >= nranks {
                return Err(RillError::Topology(format!(
                    "gid {gid} assigned to rank {rank} of {nranks}"
                )));
            }
            let start = self.nslist[rank];
            if gid < start || gid >= start + self.nblist[rank] {
                return Err(RillError::Topology(format!(
                    "gid {gid} outside the range of rank {rank}"
                )));
            }
        }

        let mut list = Vec::new();
        self.tree.block_list(&mut list, None);
        if list != self.loclist {
            return Err(RillError::Topology(
                "forest enumeration disagrees with loclist".to_string(),
            ));
        }

        if !self.tree.check_balance() {
            return Err(RillError::Topology("2:1 balance violated".to_string()));
        }

        let volume: f64 = self
            .loclist
            .iter()
            .map(|&loc| self.block_geometry(loc).0.volume())
            .sum();
        if (volume - self.mesh_size.volume()).abs() > 1e-10 * self.mesh_size.volume() {
            return Err(RillError::Topology(format!(
                "leaves cover volume {volume}, mesh volume is {}",
                self.mesh_size.volume()
            )));
        }

        let range = self.local_range();
        for (lid, block) in self.blocks.iter().enumerate() {
            if block.gid != range.start + lid || block.lid != lid {
                return Err(RillError::Topology(format!(
                    "local block {lid} carries gid {}",
                    block.gid
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SoloComm;
    use crate::state::HydroConfig;

    pub(crate) fn hydro_factory(config: &MeshConfig, magnetic: bool) -> Box<HydroConfig> {
        Box::new(HydroConfig {
            nhydro: 4,
            block_nx: config.block_nx(),
            magnetic,
            general_relativity: false,
        })
    }

    fn config_1d() -> MeshConfig {
        MeshConfig::from_toml_str(
            r#"
            [time]
            tlim = 1.0
            cfl_number = 0.8

            [mesh]
            nx1 = 16
            x1min = 0.0
            x1max = 1.0

            [meshblock]
            nx1 = 4
            "#,
        )
        .expect("valid toml")
    }

    fn config_2d_periodic() -> MeshConfig {
        MeshConfig::from_toml_str(
            r#"
            [time]
            tlim = 1.0
            cfl_number = 0.3

            [mesh]
            nx1 = 32
            nx2 = 32
            x1min = 0.0
            x1max = 1.0
            x2min = 0.0
            x2max = 1.0
            ix1_bc = "periodic"
            ox1_bc = "periodic"
            ix2_bc = "periodic"
            ox2_bc = "periodic"

            [meshblock]
            nx1 = 8
            nx2 = 8
            "#,
        )
        .expect("valid toml")
    }

    #[test]
    fn one_dimensional_root_grid() {
        let config = config_1d();
        let factory = hydro_factory(&config, false);
        let mut mesh = Mesh::new(config, Box::new(SoloComm::new()), factory).unwrap();

        assert_eq!(mesh.nbtotal(), 4);
        assert_eq!(mesh.blocks.len(), 4);
        mesh.verify_bookkeeping().unwrap();

        // End blocks see one face neighbor, interior blocks two; the open
        // ends report no neighbor at all.
        assert_eq!(mesh.blocks[0].neighbors.records.len(), 1);
        assert_eq!(mesh.blocks[1].neighbors.records.len(), 2);
        assert_eq!(mesh.blocks[3].neighbors.records.len(), 1);

        // Physical extents tile [0, 1].
        assert_eq!(mesh.blocks[0].region.xmin[0], 0.0);
        assert!((mesh.blocks[0].region.xmax[0] - 0.25).abs() < 1e-14);
        assert_eq!(mesh.blocks[3].region.xmax[0], 1.0);
    }

    #[test]
    fn four_ranks_one_block_each() {
        let comms = crate::comm::ThreadComm::connect(4);

        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let config = config_1d();
                        let factory = hydro_factory(&config, false);
                        let mut mesh = Mesh::new(config, Box::new(comm), factory).unwrap();

                        assert_eq!(mesh.ranklist(), &[0, 1, 2, 3]);
                        assert_eq!(mesh.blocks.len(), 1);
                        mesh.verify_bookkeeping().unwrap();

                        let rank = mesh.rank();
                        let block = &mesh.blocks[0];
                        let expected = if rank == 0 || rank == 3 { 1 } else { 2 };
                        assert_eq!(block.neighbors.records.len(), expected);
                        for record in &block.neighbors.records {
                            assert_eq!(record.rank as i32, rank as i32 + record.offset[0]);
                        }

                        mesh.enroll_time_step_estimator(|b| b.region.min_spacing());
                        mesh.compute_block_timesteps();
                        let dt = mesh.new_time_step();
                        assert!((dt - 0.8 / 16.0).abs() < 1e-14);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().expect("rank thread");
            }
        });
    }

    #[test]
    fn uniform_2d_time_step() {
        let config = config_2d_periodic();
        let cfl = config.time.cfl_number;
        let factory = hydro_factory(&config, true);
        let mut mesh = Mesh::new(config, Box::new(SoloComm::new()), factory).unwrap();

        assert_eq!(mesh.nbtotal(), 16);
        mesh.verify_bookkeeping().unwrap();

        // Magnetic fields force the full 8-neighbor protocol even though the
        // forest is single-level.
        for block in &mesh.blocks {
            assert_eq!(block.neighbors.records.len(), 8);
        }

        mesh.enroll_time_step_estimator(|block| block.region.min_spacing());
        mesh.compute_block_timesteps();
        let dt = mesh.new_time_step();
        assert!((dt - cfl * (1.0 / 32.0)).abs() < 1e-14);
    }

    #[test]
    fn static_refinement_region() {
        let mut config = config_2d_periodic();
        config.mesh.nx1 = 16;
        config.mesh.nx2 = 16;
        config.mesh.ix1_bc = BoundaryKind::Outflow;
        config.mesh.ox1_bc = BoundaryKind::Outflow;
        config.mesh.ix2_bc = BoundaryKind::Outflow;
        config.mesh.ox2_bc = BoundaryKind::Outflow;
        config.refinement_regions.push(crate::config::RefinementRegion {
            x1min: 0.0,
            x1max: 0.45,
            x2min: 0.0,
            x2max: 0.45,
            x3min: -0.5,
            x3max: 0.5,
            level: 1,
        });

        let factory = hydro_factory(&config, false);
        let mut mesh = Mesh::new(config, Box::new(SoloComm::new()), factory).unwrap();

        // Low quadrant refined: 3 coarse + 4 fine leaves.
        assert_eq!(mesh.nbtotal(), 7);
        mesh.verify_bookkeeping().unwrap();

        let fine: Vec<_> = mesh
            .loclist()
            .iter()
            .filter(|loc| loc.level == mesh.root_level + 1)
            .collect();
        assert_eq!(fine.len(), 4);

        // A fine block at the interface reports its coarser x1 neighbor
        // with a sub-face record on the coarse side.
        let interface = mesh
            .blocks
            .iter()
            .find(|b| b.loc == LogicalLocation::new(mesh.root_level + 1, 1, 0, 0))
            .expect("fine interface block");
        let coarse = interface
            .neighbors
            .records
            .iter()
            .find(|r| r.offset == [1, 0, 0])
            .expect("coarse face neighbor");
        assert_eq!(coarse.level, mesh.root_level);
    }

    #[test]
    fn mesh_test_mode_downgrades_rank_mismatch() {
        let config = config_1d();
        // 4 blocks on 8 hypothetical ranks: warning, not fatal.
        Mesh::mesh_test(&config, 8).unwrap();

        // The real constructor stays fatal.
        let comms = crate::comm::ThreadComm::connect(8);
        let errors: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let config = config_1d();
                        let factory = hydro_factory(&config, false);
                        Mesh::new(config, Box::new(comm), factory).is_err()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("rank thread"))
                .collect()
        });
        assert!(errors.into_iter().all(|e| e));
    }
}
