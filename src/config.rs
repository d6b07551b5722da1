//! Configuration surface of the mesh core: serde structures mirroring the
//! parameter file, plus the validation pass that turns bad input into fatal
//! errors before any mesh state is built.

use std::path::Path;

use crate::error::{Result, RillError};
use crate::geometry::RegionSize;

/// Kind of physical boundary attached to one face of the domain. `Interior`
/// marks block faces that touch another block rather than the domain edge.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    Reflect,
    Outflow,
    Periodic,
    User,
    Interior,
}

impl Default for BoundaryKind {
    fn default() -> Self {
        BoundaryKind::Outflow
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementMode {
    Static,
    Adaptive,
}

impl Default for RefinementMode {
    fn default() -> Self {
        RefinementMode::Static
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TimeSection {
    #[serde(default)]
    pub start_time: f64,
    pub tlim: f64,
    pub cfl_number: f64,
    #[serde(default = "default_nlim")]
    pub nlim: i64,
}

fn default_nlim() -> i64 {
    -1
}

fn one() -> usize {
    1
}

fn unit_ratio() -> f64 {
    1.0
}

fn half() -> f64 {
    0.5
}

fn neg_half() -> f64 {
    -0.5
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct MeshSection {
    pub nx1: usize,
    #[serde(default = "one")]
    pub nx2: usize,
    #[serde(default = "one")]
    pub nx3: usize,

    pub x1min: f64,
    pub x1max: f64,
    #[serde(default = "neg_half")]
    pub x2min: f64,
    #[serde(default = "half")]
    pub x2max: f64,
    #[serde(default = "neg_half")]
    pub x3min: f64,
    #[serde(default = "half")]
    pub x3max: f64,

    #[serde(default = "unit_ratio")]
    pub x1rat: f64,
    #[serde(default = "unit_ratio")]
    pub x2rat: f64,
    #[serde(default = "unit_ratio")]
    pub x3rat: f64,

    #[serde(default)]
    pub ix1_bc: BoundaryKind,
    #[serde(default)]
    pub ox1_bc: BoundaryKind,
    #[serde(default)]
    pub ix2_bc: BoundaryKind,
    #[serde(default)]
    pub ox2_bc: BoundaryKind,
    #[serde(default)]
    pub ix3_bc: BoundaryKind,
    #[serde(default)]
    pub ox3_bc: BoundaryKind,

    #[serde(default)]
    pub refinement: RefinementMode,
    #[serde(default = "one")]
    pub numlevel: usize,
    #[serde(default = "one")]
    pub num_threads: usize,
}

/// Block sizes default to the whole mesh extent per axis, which yields a
/// single root block.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct MeshBlockSection {
    pub nx1: Option<usize>,
    pub nx2: Option<usize>,
    pub nx3: Option<usize>,
}

/// A statically refined rectangular region with a target physical level.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RefinementRegion {
    pub x1min: f64,
    pub x1max: f64,
    #[serde(default = "neg_half")]
    pub x2min: f64,
    #[serde(default = "half")]
    pub x2max: f64,
    #[serde(default = "neg_half")]
    pub x3min: f64,
    #[serde(default = "half")]
    pub x3max: f64,
    pub level: usize,
}

impl RefinementRegion {
    pub fn min(&self, axis: usize) -> f64 {
        [self.x1min, self.x2min, self.x3min][axis]
    }

    pub fn max(&self, axis: usize) -> f64 {
        [self.x1max, self.x2max, self.x3max][axis]
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct MeshConfig {
    pub time: TimeSection,
    pub mesh: MeshSection,
    #[serde(default)]
    pub meshblock: MeshBlockSection,
    #[serde(default, rename = "refinement")]
    pub refinement_regions: Vec<RefinementRegion>,
}

impl MeshConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|err| RillError::Config(err.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| RillError::Config(err.to_string()))
    }

    pub fn dim(&self) -> usize {
        if self.mesh.nx3 > 1 {
            3
        } else if self.mesh.nx2 > 1 {
            2
        } else {
            1
        }
    }

    pub fn adaptive(&self) -> bool {
        self.mesh.refinement == RefinementMode::Adaptive
    }

    pub fn multilevel(&self) -> bool {
        self.adaptive() || !self.refinement_regions.is_empty()
    }

    /// Cells per block along each axis, after applying defaults.
    pub fn block_nx(&self) -> [usize; 3] {
        let dim = self.dim();
        [
            self.meshblock.nx1.unwrap_or(self.mesh.nx1),
            if dim >= 2 {
                self.meshblock.nx2.unwrap_or(self.mesh.nx2)
            } else {
                self.mesh.nx2
            },
            if dim == 3 {
                self.meshblock.nx3.unwrap_or(self.mesh.nx3)
            } else {
                self.mesh.nx3
            },
        ]
    }

    /// Root-grid block counts per axis.
    pub fn nrbx(&self) -> [i64; 3] {
        let bnx = self.block_nx();
        [
            (self.mesh.nx1 / bnx[0]) as i64,
            (self.mesh.nx2 / bnx[1]) as i64,
            (self.mesh.nx3 / bnx[2]) as i64,
        ]
    }

    /// Logical level of the root grid: the smallest power of two covering
    /// the widest axis.
    pub fn root_level(&self) -> i32 {
        let nbmax = self.nrbx().into_iter().max().unwrap_or(1);
        let mut level = 0;
        while (1i64 << level) < nbmax {
            level += 1;
        }
        level
    }

    pub fn max_level(&self) -> i32 {
        if self.adaptive() {
            self.mesh.numlevel as i32 + self.root_level() - 1
        } else {
            63
        }
    }

    pub fn mesh_region(&self) -> RegionSize {
        RegionSize {
            xmin: [self.mesh.x1min, self.mesh.x2min, self.mesh.x3min],
            xmax: [self.mesh.x1max, self.mesh.x2max, self.mesh.x3max],
            nx: [self.mesh.nx1, self.mesh.nx2, self.mesh.nx3],
            ratio: [self.mesh.x1rat, self.mesh.x2rat, self.mesh.x3rat],
        }
    }

    /// Boundary kinds in face order (ix1, ox1, ix2, ox2, ix3, ox3).
    pub fn boundary_kinds(&self) -> [BoundaryKind; 6] {
        [
            self.mesh.ix1_bc,
            self.mesh.ox1_bc,
            self.mesh.ix2_bc,
            self.mesh.ox2_bc,
            self.mesh.ix3_bc,
            self.mesh.ox3_bc,
        ]
    }

    pub fn periodic(&self) -> [bool; 3] {
        let bcs = self.boundary_kinds();
        [
            bcs[0] == BoundaryKind::Periodic,
            bcs[2] == BoundaryKind::Periodic,
            bcs[4] == BoundaryKind::Periodic,
        ]
    }

    /// Rejects every configuration the mesh cannot be built from. The
    /// diagnostics carry the offending values.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(RillError::Config(msg));

        if self.mesh.num_threads < 1 {
            return fail(format!(
                "number of worker threads must be >= 1, but num_threads={}",
                self.mesh.num_threads
            ));
        }

        if self.mesh.nx1 < 4 {
            return fail(format!("nx1 must be >= 4, but nx1={}", self.mesh.nx1));
        }
        if self.mesh.nx2 < 1 || self.mesh.nx3 < 1 {
            return fail(format!(
                "nx2 and nx3 must be >= 1, but nx2={}, nx3={}",
                self.mesh.nx2, self.mesh.nx3
            ));
        }
        if self.mesh.nx2 == 1 && self.mesh.nx3 > 1 {
            return fail(format!(
                "nx2=1, nx3={}: 2D problems in x1-x3 plane not supported",
                self.mesh.nx3
            ));
        }

        let dim = self.dim();
        if self.time.cfl_number <= 0.0 {
            return fail(format!(
                "the CFL number must be positive, but cfl_number={}",
                self.time.cfl_number
            ));
        }
        if dim == 1 && self.time.cfl_number > 1.0 {
            return fail(format!(
                "the CFL number must be smaller than 1.0 in 1D, but cfl_number={}",
                self.time.cfl_number
            ));
        }
        if dim >= 2 && self.time.cfl_number > 0.5 {
            return fail(format!(
                "the CFL number must be smaller than 0.5 in 2D/3D, but cfl_number={}",
                self.time.cfl_number
            ));
        }

        let region = self.mesh_region();
        for axis in 0..3 {
            if region.xmax[axis] <= region.xmin[axis] {
                return fail(format!(
                    "x{}max must be larger than x{}min: min={}, max={}",
                    axis + 1,
                    axis + 1,
                    region.xmin[axis],
                    region.xmax[axis]
                ));
            }
            if (region.ratio[axis] - 1.0).abs() > 0.1 {
                return fail(format!(
                    "ratio of cell sizes must be 0.9 <= x{}rat <= 1.1, but x{}rat={}",
                    axis + 1,
                    axis + 1,
                    region.ratio[axis]
                ));
            }
        }

        let bcs = self.boundary_kinds();
        for axis in 0..3 {
            let inner = bcs[2 * axis] == BoundaryKind::Periodic;
            let outer = bcs[2 * axis + 1] == BoundaryKind::Periodic;
            if inner != outer {
                return fail(format!(
                    "periodicity must match on both x{} faces",
                    axis + 1
                ));
            }
        }

        let bnx = self.block_nx();
        let mesh_nx = [self.mesh.nx1, self.mesh.nx2, self.mesh.nx3];
        for axis in 0..3 {
            if bnx[axis] == 0 || mesh_nx[axis] % bnx[axis] != 0 {
                return fail(format!(
                    "the mesh must be evenly divisible by the meshblock, but nx{}={} and block nx{}={}",
                    axis + 1,
                    mesh_nx[axis],
                    axis + 1,
                    bnx[axis]
                ));
            }
        }
        if bnx[0] < 4 || (dim >= 2 && bnx[1] < 4) || (dim == 3 && bnx[2] < 4) {
            return fail(format!(
                "meshblock size must be at least 4 cells per non-degenerate axis, got {bnx:?}"
            ));
        }

        if self.multilevel() {
            for axis in 0..dim {
                if bnx[axis] % 2 == 1 {
                    return fail(format!(
                        "meshblock size must be divisible by 2 with SMR or AMR, got {bnx:?}"
                    ));
                }
            }
        }

        if self.adaptive() {
            if self.mesh.numlevel < 1 {
                return fail(format!(
                    "numlevel must be >= 1, but numlevel={}",
                    self.mesh.numlevel
                ));
            }
            if self.max_level() > 63 {
                return fail(format!(
                    "the number of refinement levels must be smaller than {}",
                    63 - self.root_level() + 1
                ));
            }
        }

        for region_cfg in &self.refinement_regions {
            if region_cfg.level < 1 {
                return fail(format!(
                    "refinement level must be larger than 0 (root level = 0), got {}",
                    region_cfg.level
                ));
            }
            if self.root_level() + region_cfg.level as i32 > self.max_level() {
                return fail(format!(
                    "refinement level {} exceeds the maximum level",
                    region_cfg.level
                ));
            }
            for axis in 0..dim {
                if region_cfg.min(axis) > region_cfg.max(axis) {
                    return fail("invalid refinement region is specified".to_string());
                }
                if region_cfg.min(axis) < region.xmin[axis]
                    || region_cfg.max(axis) > region.xmax[axis]
                {
                    return fail(
                        "refinement region must be smaller than the whole mesh".to_string(),
                    );
                }
            }
        }

        for (i, a) in self.refinement_regions.iter().enumerate() {
            for b in self.refinement_regions.iter().skip(i + 1) {
                if a.level != b.level {
                    continue;
                }
                let disjoint = (0..dim)
                    .any(|axis| a.max(axis) <= b.min(axis) || b.max(axis) <= a.min(axis));
                if !disjoint {
                    return fail(format!(
                        "overlapping refinement regions at level {}",
                        a.level
                    ));
                }
            }
        }

        Ok(())
    }
}
