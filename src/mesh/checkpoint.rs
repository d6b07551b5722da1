//! Binary checkpoint codec.
//!
//! Layout: a TOML parameter header terminated by a `<par_end>` line, then
//! fixed-width little-endian binary sections: the mesh header, a per-block
//! index of (gid, location, cost, payload offset), and the block payloads.
//! The index makes the file seekable, so on restore each rank reads only
//! the header, the index and the payloads of its own gid range. Writing is
//! collective: every rank funnels its encoded payloads to rank 0, which
//! emits the whole file.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use crate::comm::Communicator;
use crate::config::{BoundaryKind, MeshConfig};
use crate::error::{Result, RillError};
use crate::geometry::{BlockTree, LogicalLocation, RegionSize};
use crate::mesh::balance::load_balance;
use crate::mesh::block::{Block, BufferTable};
use crate::mesh::Mesh;
use crate::state::StateFactory;

const PAR_END: &str = "<par_end>\n";
const CKPT_TAG: u64 = 1 << 40;

type BinConfig = bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
>;

fn bin_config() -> BinConfig {
    bincode::config::standard().with_fixed_int_encoding()
}

fn broken(err: impl std::fmt::Display) -> RillError {
    RillError::RestartBroken(err.to_string())
}

#[derive(bincode::Encode, bincode::Decode)]
struct Header {
    nbtotal: u64,
    root_level: i32,
    mesh_size: RegionSize,
    mesh_bcs: [BoundaryKind; 6],
    time: f64,
    dt: f64,
    ncycle: i64,
}

#[derive(bincode::Encode, bincode::Decode)]
struct IndexEntry {
    gid: u64,
    loc: LogicalLocation,
    cost: f64,
    offset: u64,
}

#[derive(bincode::Encode, bincode::Decode)]
struct BlockPayload {
    region: RegionSize,
    boundary: [BoundaryKind; 6],
    words: Vec<f64>,
}

impl Mesh {
    /// Writes a checkpoint. Collective: every rank contributes its blocks,
    /// rank 0 writes the file.
    pub fn write_checkpoint(&self, path: &Path) -> Result<()> {
        let cfg = bin_config();

        let my_payloads: Vec<(usize, Vec<u8>)> = self
            .blocks
            .iter()
            .map(|block| {
                let payload = BlockPayload {
                    region: block.region,
                    boundary: block.boundary,
                    words: block.state.to_words(),
                };
                let bytes = bincode::encode_to_vec(&payload, cfg)
                    .map_err(|err| RillError::RestartBroken(err.to_string()))?;
                Ok((block.gid, bytes))
            })
            .collect::<Result<_>>()?;

        if self.comm.rank() != 0 {
            for (gid, bytes) in my_payloads {
                self.comm.send(0, CKPT_TAG | gid as u64, bytes);
            }
            self.comm.barrier();
            return Ok(());
        }

        let mut payloads: Vec<Option<Vec<u8>>> = vec![None; self.nbtotal];
        for (gid, bytes) in my_payloads {
            payloads[gid] = Some(bytes);
        }
        for gid in 0..self.nbtotal {
            if payloads[gid].is_none() {
                let rank = self.ranklist[gid];
                payloads[gid] = Some(self.comm.recv(rank, CKPT_TAG | gid as u64));
            }
        }

        let mut out = self.config.to_toml_string()?.into_bytes();
        out.extend_from_slice(PAR_END.as_bytes());

        let header = Header {
            nbtotal: self.nbtotal as u64,
            root_level: self.root_level,
            mesh_size: self.mesh_size,
            mesh_bcs: self.mesh_bcs,
            time: self.time,
            dt: self.dt,
            ncycle: self.ncycle,
        };
        out.extend(bincode::encode_to_vec(&header, cfg).map_err(broken)?);

        let entry_len = bincode::encode_to_vec(
            &IndexEntry {
                gid: 0,
                loc: LogicalLocation::default(),
                cost: 0.0,
                offset: 0,
            },
            cfg,
        )
        .map_err(broken)?
        .len();

        let mut offset = out.len() + self.nbtotal * entry_len;
        for gid in 0..self.nbtotal {
            let bytes = payloads[gid].as_ref().expect("payload gathered");
            let entry = IndexEntry {
                gid: gid as u64,
                loc: self.loclist[gid],
                cost: self.costlist[gid],
                offset: offset as u64,
            };
            out.extend(bincode::encode_to_vec(&entry, cfg).map_err(broken)?);
            offset += bytes.len();
        }
        for bytes in payloads.iter().flatten() {
            out.extend_from_slice(bytes);
        }

        std::fs::write(path, out)?;
        self.comm.barrier();
        Ok(())
    }

    /// Restores a mesh from a checkpoint. The caller's configuration
    /// supplies the time limits, refinement mode and block sizes (as the
    /// original input file does); the forest, the physical mesh and the
    /// per-block state come from the file.
    pub fn from_checkpoint(
        path: &Path,
        config: MeshConfig,
        comm: Box<dyn Communicator>,
        factory: Box<dyn StateFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let cfg = bin_config();

        let mut reader = BufReader::new(File::open(path)?);

        // Skip the text parameter header.
        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .map_err(|_| broken("missing <par_end> marker"))?;
            if n == 0 {
                return Err(broken("missing <par_end> marker"));
            }
            if line == PAR_END {
                break;
            }
        }

        let header: Header = bincode::decode_from_std_read(&mut reader, cfg).map_err(broken)?;
        let nbtotal = header.nbtotal as usize;
        let root_level = header.root_level;
        let mesh_size = header.mesh_size;

        let mut loclist = Vec::with_capacity(nbtotal);
        let mut costlist = Vec::with_capacity(nbtotal);
        let mut offsets = Vec::with_capacity(nbtotal);
        for gid in 0..nbtotal {
            let entry: IndexEntry =
                bincode::decode_from_std_read(&mut reader, cfg).map_err(broken)?;
            if entry.gid != gid as u64 {
                return Err(broken(format!(
                    "index entry {gid} carries gid {}",
                    entry.gid
                )));
            }
            loclist.push(entry.loc);
            costlist.push(entry.cost);
            offsets.push(entry.offset);
        }

        let dim = mesh_size.dim();
        let block_nx = config.block_nx();
        let mut nrbx = [0i64; 3];
        for axis in 0..3 {
            if block_nx[axis] == 0 || mesh_size.nx[axis] % block_nx[axis] != 0 {
                return Err(broken(format!(
                    "stored mesh nx{} = {} is not divisible by block nx{} = {}",
                    axis + 1,
                    mesh_size.nx[axis],
                    axis + 1,
                    block_nx[axis]
                )));
            }
            nrbx[axis] = (mesh_size.nx[axis] / block_nx[axis]) as i64;
        }

        let current_level = loclist
            .iter()
            .map(|loc| loc.level)
            .max()
            .unwrap_or(root_level);
        let multilevel =
            config.adaptive() || loclist.iter().any(|loc| loc.level != root_level);
        let adaptive = config.adaptive();
        let max_level = if adaptive {
            config.mesh.numlevel as i32 + root_level - 1
        } else {
            63
        };

        let periodic = [
            header.mesh_bcs[0] == BoundaryKind::Periodic,
            header.mesh_bcs[2] == BoundaryKind::Periodic,
            header.mesh_bcs[4] == BoundaryKind::Periodic,
        ];

        // Rebuild the forest from the stored locations and check that its
        // canonical enumeration reproduces them.
        let mut tree = BlockTree::new(nrbx, root_level, dim, periodic);
        for &loc in &loclist {
            tree.add_block_unrefined(loc);
        }
        let mut rebuilt = Vec::new();
        tree.block_list(&mut rebuilt, None);
        if rebuilt.len() != nbtotal {
            return Err(RillError::TreeReconstruction {
                stored: nbtotal,
                rebuilt: rebuilt.len(),
            });
        }
        if rebuilt != loclist {
            return Err(RillError::TreeReconstruction {
                stored: nbtotal,
                rebuilt: rebuilt.len(),
            });
        }

        if nbtotal < comm.size() {
            return Err(RillError::Topology(format!(
                "too few blocks: nbtotal ({nbtotal}) < nranks ({})",
                comm.size()
            )));
        }

        let balance = load_balance(&costlist, comm.size(), adaptive, comm.rank())?;
        let face_only = !(factory.face_fields() || multilevel);
        let buffers = BufferTable::new(dim, multilevel, face_only);

        let mut mesh = Self {
            time: header.time,
            dt: header.dt,
            ncycle: header.ncycle,
            start_time: config.time.start_time,
            tlim: config.time.tlim,
            cfl_number: config.time.cfl_number,
            nlim: config.time.nlim,

            mesh_size,
            mesh_bcs: header.mesh_bcs,
            block_nx,
            nrbx,
            dim,
            root_level,
            current_level,
            max_level,
            multilevel,
            adaptive,

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

        // Load only this rank's payloads, seeking per block.
        let range = mesh.local_range();
        let mut file = BufReader::new(File::open(path)?);
        for gid in range.clone() {
            file.seek(SeekFrom::Start(offsets[gid])).map_err(broken)?;
            let payload: BlockPayload =
                bincode::decode_from_std_read(&mut file, cfg).map_err(broken)?;

            let mut block = Block::new(
                gid,
                gid - range.start,
                mesh.loclist[gid],
                payload.region,
                payload.boundary,
                mesh.factory.create(),
            );
            block.cost = mesh.costlist[gid];
            block.state.from_words(&payload.words)?;
            mesh.blocks.push(block);
        }

        for block in &mut mesh.blocks {
            block.search_neighbors(&mesh.tree, &mesh.buffers, &mesh.ranklist, &mesh.nslist);
        }

        Ok(mesh)
    }
}
