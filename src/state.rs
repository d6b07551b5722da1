//! Per-block solver state and the operators the mesh core needs from it.
//!
//! The core never looks inside a payload: it asks the [`BlockState`] trait
//! for packed migration buffers (same-level copy, fine-to-coarse
//! restriction, coarse-to-fine halo for prolongation) and flat words for the
//! checkpoint. [`HydroState`] is the production implementation: `nhydro`
//! cell-centered conservative variables plus an optional face-centered
//! magnetic field.

use std::any::Any;

use crate::error::{Result, RillError};

/// Ghost cells per side of a block array.
pub const NGHOST: usize = 2;

/// Ghost cells per side of the coarse (restricted) arrays. Prolongation
/// buffer bounds are derived from the uneven rounding; senders and
/// receivers must agree on it bit for bit.
pub const fn cnghost() -> usize {
    (NGHOST + 1) / 2 + 1
}

/// Classification of an AMR data transfer relative to the old forest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Same,
    FineToCoarse,
    CoarseToFine,
}

/// Sub-octant parity per axis, each 0 or 1.
pub type Octant = [i64; 3];

/// Capability set the mesh requires from a block payload.
pub trait BlockState: Send {
    /// Number of `f64` words in a migration payload of the given kind.
    fn payload_len(&self, kind: TransferKind) -> usize;

    /// Packs a migration payload. For `FineToCoarse` this restricts the
    /// block first; for `CoarseToFine` the octant selects which child the
    /// halo-extended coarse region is cut for.
    fn pack(&mut self, kind: TransferKind, octant: Octant, buf: &mut Vec<f64>);

    /// Unpacks a migration payload. For `FineToCoarse` the octant selects
    /// the quadrant the restricted data lands in; for `CoarseToFine` the
    /// buffer is prolonged to fill the whole interior.
    fn unpack(&mut self, kind: TransferKind, octant: Octant, buf: &[f64]);

    /// Flattens the full payload (ghosts included) for the checkpoint.
    fn to_words(&self) -> Vec<f64>;

    /// Restores the payload from checkpoint words.
    fn from_words(&mut self, words: &[f64]) -> Result<()>;

    fn new_block_dt(&self) -> f64;
    fn set_new_block_dt(&mut self, dt: f64);

    /// Per-variable sums of the conservative variables over the interior,
    /// weighted by the cell volume.
    fn conservative_totals(&self, cell_volume: f64) -> Vec<f64>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Creates fresh payloads for newly instantiated blocks.
pub trait StateFactory: Send + Sync {
    fn create(&self) -> Box<dyn BlockState>;

    /// Whether payloads carry face-centered fields. Determines if the
    /// neighbor protocol needs edge and corner exchanges even on a uniform
    /// forest.
    fn face_fields(&self) -> bool;
}

/// Index space of a cell-centered array with ghosts on non-degenerate axes.
#[derive(Clone, Copy, Debug)]
struct Space {
    nx: [usize; 3],
    ncells: [usize; 3],
    start: [usize; 3],
}

impl Space {
    fn new(nx: [usize; 3], ghost: usize) -> Self {
        let pad = |n: usize| if n > 1 { n + 2 * ghost } else { 1 };
        let off = |n: usize| if n > 1 { ghost } else { 0 };
        Self {
            nx,
            ncells: [nx[0] + 2 * ghost, pad(nx[1]), pad(nx[2])],
            start: [ghost, off(nx[1]), off(nx[2])],
        }
    }

    fn end(&self, axis: usize) -> usize {
        self.start[axis] + self.nx[axis] - 1
    }
}

/// Flat 3D array in (k, j, i) order.
#[derive(Clone, Debug, PartialEq)]
struct Array3 {
    n1: usize,
    n2: usize,
    n3: usize,
    data: Vec<f64>,
}

impl Array3 {
    fn new(n3: usize, n2: usize, n1: usize) -> Self {
        Self {
            n1,
            n2,
            n3,
            data: vec![0.0; n1 * n2 * n3],
        }
    }

    fn idx(&self, k: usize, j: usize, i: usize) -> usize {
        (k * self.n2 + j) * self.n1 + i
    }

    fn at(&self, k: usize, j: usize, i: usize) -> f64 {
        self.data[self.idx(k, j, i)]
    }

    fn set(&mut self, k: usize, j: usize, i: usize, v: f64) {
        let idx = self.idx(k, j, i);
        self.data[idx] = v;
    }

    fn pack(&self, buf: &mut Vec<f64>, kr: (usize, usize), jr: (usize, usize), ir: (usize, usize)) {
        for k in kr.0..=kr.1 {
            for j in jr.0..=jr.1 {
                for i in ir.0..=ir.1 {
                    buf.push(self.at(k, j, i));
                }
            }
        }
    }

    fn unpack(
        &mut self,
        buf: &[f64],
        p: &mut usize,
        kr: (usize, usize),
        jr: (usize, usize),
        ir: (usize, usize),
    ) {
        for k in kr.0..=kr.1 {
            for j in jr.0..=jr.1 {
                for i in ir.0..=ir.1 {
                    self.set(k, j, i, buf[*p]);
                    *p += 1;
                }
            }
        }
    }
}

/// Flat 4D array of cell-centered variables, (n, k, j, i) order.
#[derive(Clone, Debug, PartialEq)]
struct CellArray {
    nvar: usize,
    cells: Array3,
}

impl CellArray {
    fn new(nvar: usize, n3: usize, n2: usize, n1: usize) -> Self {
        let mut cells = Array3::new(n3, n2, n1);
        cells.data = vec![0.0; nvar * n3 * n2 * n1];
        Self { nvar, cells }
    }

    fn at(&self, n: usize, k: usize, j: usize, i: usize) -> f64 {
        self.cells.data[n * self.plane() + self.cells.idx(k, j, i)]
    }

    fn set(&mut self, n: usize, k: usize, j: usize, i: usize, v: f64) {
        let idx = n * self.plane() + self.cells.idx(k, j, i);
        self.cells.data[idx] = v;
    }

    fn plane(&self) -> usize {
        self.cells.n1 * self.cells.n2 * self.cells.n3
    }

    fn pack(
        &self,
        buf: &mut Vec<f64>,
        kr: (usize, usize),
        jr: (usize, usize),
        ir: (usize, usize),
    ) {
        for n in 0..self.nvar {
            for k in kr.0..=kr.1 {
                for j in jr.0..=jr.1 {
                    for i in ir.0..=ir.1 {
                        buf.push(self.at(n, k, j, i));
                    }
                }
            }
        }
    }

    fn unpack(
        &mut self,
        buf: &[f64],
        p: &mut usize,
        kr: (usize, usize),
        jr: (usize, usize),
        ir: (usize, usize),
    ) {
        for n in 0..self.nvar {
            for k in kr.0..=kr.1 {
                for j in jr.0..=jr.1 {
                    for i in ir.0..=ir.1 {
                        self.set(n, k, j, i, buf[*p]);
                        *p += 1;
                    }
                }
            }
        }
    }
}

/// Face-centered field: three staggered arrays sharing cell-centered ghosts.
#[derive(Clone, Debug, PartialEq)]
struct FaceField {
    x1f: Array3,
    x2f: Array3,
    x3f: Array3,
}

impl FaceField {
    fn new(ncells: [usize; 3]) -> Self {
        Self {
            x1f: Array3::new(ncells[2], ncells[1], ncells[0] + 1),
            x2f: Array3::new(ncells[2], ncells[1] + 1, ncells[0]),
            x3f: Array3::new(ncells[2] + 1, ncells[1], ncells[0]),
        }
    }
}

fn minmod(a: f64, b: f64) -> f64 {
    if a * b <= 0.0 {
        0.0
    } else if a.abs() < b.abs() {
        a
    } else {
        b
    }
}

/// Configuration of [`HydroState`] payloads; doubles as the factory the
/// mesh instantiates blocks through.
#[derive(Clone, Copy, Debug)]
pub struct HydroConfig {
    pub nhydro: usize,
    pub block_nx: [usize; 3],
    pub magnetic: bool,
    pub general_relativity: bool,
}

impl StateFactory for HydroConfig {
    fn create(&self) -> Box<dyn BlockState> {
        Box::new(HydroState::new(*self))
    }

    fn face_fields(&self) -> bool {
        self.magnetic
    }
}

pub struct HydroState {
    nhydro: usize,
    nx: [usize; 3],
    space: Space,
    cspace: Space,
    u: CellArray,
    /// GR primitive buffers, restored from checkpoints but never touched by
    /// the core.
    w: Option<(CellArray, CellArray)>,
    b: Option<FaceField>,
    coarse_u: CellArray,
    coarse_b: Option<FaceField>,
    new_dt: f64,
}

impl HydroState {
    pub fn new(config: HydroConfig) -> Self {
        let nx = config.block_nx;
        let cnx = [nx[0] / 2, (nx[1] + 1) / 2, (nx[2] + 1) / 2];
        let space = Space::new(nx, NGHOST);
        let cspace = Space::new(cnx, cnghost());

        let cell = |s: &Space, nvar: usize| CellArray::new(nvar, s.ncells[2], s.ncells[1], s.ncells[0]);

        Self {
            nhydro: config.nhydro,
            nx,
            space,
            cspace,
            u: cell(&space, config.nhydro),
            w: config
                .general_relativity
                .then(|| (cell(&space, config.nhydro), cell(&space, config.nhydro))),
            b: config.magnetic.then(|| FaceField::new(space.ncells)),
            coarse_u: cell(&cspace, config.nhydro),
            coarse_b: config.magnetic.then(|| FaceField::new(cspace.ncells)),
            new_dt: f64::MAX,
        }
    }

    pub fn nhydro(&self) -> usize {
        self.nhydro
    }

    /// Total cells per axis, ghosts included.
    pub fn ncells(&self) -> [usize; 3] {
        self.space.ncells
    }

    /// First interior index per axis.
    pub fn interior_start(&self) -> [usize; 3] {
        self.space.start
    }

    pub fn cell(&self, n: usize, k: usize, j: usize, i: usize) -> f64 {
        self.u.at(n, k, j, i)
    }

    pub fn set_cell(&mut self, n: usize, k: usize, j: usize, i: usize, v: f64) {
        self.u.set(n, k, j, i, v);
    }

    pub fn face_x1(&self, k: usize, j: usize, i: usize) -> f64 {
        self.b.as_ref().expect("magnetic field enabled").x1f.at(k, j, i)
    }

    pub fn set_face_x1(&mut self, k: usize, j: usize, i: usize, v: f64) {
        self.b.as_mut().expect("magnetic field enabled").x1f.set(k, j, i, v);
    }

    fn f(&self) -> [usize; 3] {
        [1, (self.nx[1] > 1) as usize, (self.nx[2] > 1) as usize]
    }

    /// Interior bounds of the fine array (is..=ie per axis).
    fn interior(&self) -> [(usize, usize); 3] {
        [
            (self.space.start[0], self.space.end(0)),
            (self.space.start[1], self.space.end(1)),
            (self.space.start[2], self.space.end(2)),
        ]
    }

    /// Interior bounds of the coarse array.
    fn coarse_interior(&self) -> [(usize, usize); 3] {
        [
            (self.cspace.start[0], self.cspace.end(0)),
            (self.cspace.start[1], self.cspace.end(1)),
            (self.cspace.start[2], self.cspace.end(2)),
        ]
    }

    /// Half-block bounds of the interior for the given octant parity, the
    /// quadrant a restricted sibling occupies in its coarse parent.
    fn octant_bounds(&self, octant: Octant) -> [(usize, usize); 3] {
        let it = self.interior();

        let mut bounds = [(0, 0); 3];
        for axis in 0..3 {
            let half = self.nx[axis] / 2;
            bounds[axis] = if self.nx[axis] == 1 {
                it[axis]
            } else if octant[axis] == 0 {
                (it[axis].0, it[axis].0 + half - 1)
            } else {
                (it[axis].0 + half, it[axis].1)
            };
        }
        bounds
    }

    fn restrict_cells(&mut self) {
        let f = self.f();
        let ci = self.coarse_interior();
        let it = self.interior();

        for n in 0..self.nhydro {
            for ck in ci[2].0..=ci[2].1 {
                for cj in ci[1].0..=ci[1].1 {
                    for ci1 in ci[0].0..=ci[0].1 {
                        let i0 = it[0].0 + 2 * (ci1 - ci[0].0);
                        let j0 = it[1].0 + 2 * (cj - ci[1].0) * f[1];
                        let k0 = it[2].0 + 2 * (ck - ci[2].0) * f[2];

                        let mut sum = 0.0;
                        for dk in 0..=f[2] {
                            for dj in 0..=f[1] {
                                for di in 0..=1 {
                                    sum += self.u.at(n, k0 + dk, j0 + dj, i0 + di);
                                }
                            }
                        }
                        let count = (2 * (1 + f[1]) * (1 + f[2])) as f64;
                        self.coarse_u.set(n, ck, cj, ci1, sum / count);
                    }
                }
            }
        }
    }

    fn restrict_faces(&mut self) {
        let f = self.f();
        let ci = self.coarse_interior();
        let it = self.interior();

        let Some(b) = self.b.as_ref() else { return };
        let coarse = self.coarse_b.as_mut().expect("coarse field allocated");

        // x1 faces: average the fine faces coincident with each coarse face.
        for ck in ci[2].0..=ci[2].1 {
            for cj in ci[1].0..=ci[1].1 {
                for c1 in ci[0].0..=ci[0].1 + 1 {
                    let i0 = it[0].0 + 2 * (c1 - ci[0].0);
                    let j0 = it[1].0 + 2 * (cj - ci[1].0) * f[1];
                    let k0 = it[2].0 + 2 * (ck - ci[2].0) * f[2];

                    let mut sum = 0.0;
                    for dk in 0..=f[2] {
                        for dj in 0..=f[1] {
                            sum += b.x1f.at(k0 + dk, j0 + dj, i0);
                        }
                    }
                    coarse
                        .x1f
                        .set(ck, cj, c1, sum / ((1 + f[1]) * (1 + f[2])) as f64);
                }
            }
        }

        for ck in ci[2].0..=ci[2].1 {
            for cj in ci[1].0..=ci[1].1 + f[1] {
                for c1 in ci[0].0..=ci[0].1 {
                    let i0 = it[0].0 + 2 * (c1 - ci[0].0);
                    let j0 = it[1].0 + 2 * (cj - ci[1].0) * f[1];
                    let k0 = it[2].0 + 2 * (ck - ci[2].0) * f[2];

                    let mut sum = 0.0;
                    for dk in 0..=f[2] {
                        for di in 0..=1 {
                            sum += b.x2f.at(k0 + dk, j0, i0 + di);
                        }
                    }
                    coarse
                        .x2f
                        .set(ck, cj, c1, sum / (2 * (1 + f[2])) as f64);
                }
            }
        }

        for ck in ci[2].0..=ci[2].1 + f[2] {
            for cj in ci[1].0..=ci[1].1 {
                for c1 in ci[0].0..=ci[0].1 {
                    let i0 = it[0].0 + 2 * (c1 - ci[0].0);
                    let j0 = it[1].0 + 2 * (cj - ci[1].0) * f[1];
                    let k0 = it[2].0 + 2 * (ck - ci[2].0) * f[2];

                    let mut sum = 0.0;
                    for dj in 0..=f[1] {
                        for di in 0..=1 {
                            sum += b.x3f.at(k0, j0 + dj, i0 + di);
                        }
                    }
                    coarse
                        .x3f
                        .set(ck, cj, c1, sum / (2 * (1 + f[1])) as f64);
                }
            }
        }
    }

    /// Fills the interior from the coarse buffer with limited linear
    /// reconstruction.
    fn prolongate_cells(&mut self) {
        let f = self.f();
        let ci = self.coarse_interior();
        let it = self.interior();

        for n in 0..self.nhydro {
            for ck in ci[2].0..=ci[2].1 {
                for cj in ci[1].0..=ci[1].1 {
                    for c1 in ci[0].0..=ci[0].1 {
                        let c = self.coarse_u.at(n, ck, cj, c1);
                        let dx = minmod(
                            self.coarse_u.at(n, ck, cj, c1 + 1) - c,
                            c - self.coarse_u.at(n, ck, cj, c1 - 1),
                        );
                        let dy = if f[1] == 1 {
                            minmod(
                                self.coarse_u.at(n, ck, cj + 1, c1) - c,
                                c - self.coarse_u.at(n, ck, cj - 1, c1),
                            )
                        } else {
                            0.0
                        };
                        let dz = if f[2] == 1 {
                            minmod(
                                self.coarse_u.at(n, ck + 1, cj, c1) - c,
                                c - self.coarse_u.at(n, ck - 1, cj, c1),
                            )
                        } else {
                            0.0
                        };

                        for dk in 0..=f[2] {
                            for dj in 0..=f[1] {
                                for di in 0..=1usize {
                                    let fi = it[0].0 + 2 * (c1 - ci[0].0) + di;
                                    let fj = it[1].0 + 2 * (cj - ci[1].0) * f[1] + dj;
                                    let fk = it[2].0 + 2 * (ck - ci[2].0) * f[2] + dk;

                                    let v = c
                                        + (di as f64 - 0.5) * 0.5 * dx
                                        + if f[1] == 1 { (dj as f64 - 0.5) * 0.5 * dy } else { 0.0 }
                                        + if f[2] == 1 { (dk as f64 - 0.5) * 0.5 * dz } else { 0.0 };
                                    self.u.set(n, fk, fj, fi, v);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Shared-face copy with transverse limited slopes, then internal faces
    /// as the mean of their bracketing shared faces.
    fn prolongate_faces(&mut self) {
        if self.b.is_none() {
            return;
        }

        let f = self.f();
        let ci = self.coarse_interior();
        let it = self.interior();

        // Shared x1 faces
        {
            let coarse = self.coarse_b.as_ref().expect("coarse field allocated");
            let mut fine = self.b.clone().expect("field allocated");

            for ck in ci[2].0..=ci[2].1 {
                for cj in ci[1].0..=ci[1].1 {
                    for c1 in ci[0].0..=ci[0].1 + 1 {
                        let c = coarse.x1f.at(ck, cj, c1);
                        let dy = if f[1] == 1 {
                            minmod(
                                coarse.x1f.at(ck, cj + 1, c1) - c,
                                c - coarse.x1f.at(ck, cj - 1, c1),
                            )
                        } else {
                            0.0
                        };
                        let dz = if f[2] == 1 {
                            minmod(
                                coarse.x1f.at(ck + 1, cj, c1) - c,
                                c - coarse.x1f.at(ck - 1, cj, c1),
                            )
                        } else {
                            0.0
                        };

                        for dk in 0..=f[2] {
                            for dj in 0..=f[1] {
                                let fi = it[0].0 + 2 * (c1 - ci[0].0);
                                let fj = it[1].0 + 2 * (cj - ci[1].0) * f[1] + dj;
                                let fk = it[2].0 + 2 * (ck - ci[2].0) * f[2] + dk;
                                let v = c
                                    + if f[1] == 1 { (dj as f64 - 0.5) * 0.5 * dy } else { 0.0 }
                                    + if f[2] == 1 { (dk as f64 - 0.5) * 0.5 * dz } else { 0.0 };
                                fine.x1f.set(fk, fj, fi, v);
                            }
                        }
                    }
                }
            }

            // Shared x2 faces
            for ck in ci[2].0..=ci[2].1 {
                for cj in ci[1].0..=ci[1].1 + f[1] {
                    for c1 in ci[0].0..=ci[0].1 {
                        let c = coarse.x2f.at(ck, cj, c1);
                        let dx = minmod(
                            coarse.x2f.at(ck, cj, c1 + 1) - c,
                            c - coarse.x2f.at(ck, cj, c1 - 1),
                        );
                        let dz = if f[2] == 1 {
                            minmod(
                                coarse.x2f.at(ck + 1, cj, c1) - c,
                                c - coarse.x2f.at(ck - 1, cj, c1),
                            )
                        } else {
                            0.0
                        };

                        for dk in 0..=f[2] {
                            for di in 0..=1usize {
                                let fi = it[0].0 + 2 * (c1 - ci[0].0) + di;
                                let fj = it[1].0 + 2 * (cj - ci[1].0) * f[1];
                                let fk = it[2].0 + 2 * (ck - ci[2].0) * f[2] + dk;
                                let v = c
                                    + (di as f64 - 0.5) * 0.5 * dx
                                    + if f[2] == 1 { (dk as f64 - 0.5) * 0.5 * dz } else { 0.0 };
                                fine.x2f.set(fk, fj, fi, v);
                            }
                        }
                    }
                }
            }

            // Shared x3 faces
            for ck in ci[2].0..=ci[2].1 + f[2] {
                for cj in ci[1].0..=ci[1].1 {
                    for c1 in ci[0].0..=ci[0].1 {
                        let c = coarse.x3f.at(ck, cj, c1);
                        let dx = minmod(
                            coarse.x3f.at(ck, cj, c1 + 1) - c,
                            c - coarse.x3f.at(ck, cj, c1 - 1),
                        );
                        let dy = if f[1] == 1 {
                            minmod(
                                coarse.x3f.at(ck, cj + 1, c1) - c,
                                c - coarse.x3f.at(ck, cj - 1, c1),
                            )
                        } else {
                            0.0
                        };

                        for dj in 0..=f[1] {
                            for di in 0..=1usize {
                                let fi = it[0].0 + 2 * (c1 - ci[0].0) + di;
                                let fj = it[1].0 + 2 * (cj - ci[1].0) * f[1] + dj;
                                let fk = it[2].0 + 2 * (ck - ci[2].0) * f[2];
                                let v = c
                                    + (di as f64 - 0.5) * 0.5 * dx
                                    + if f[1] == 1 { (dj as f64 - 0.5) * 0.5 * dy } else { 0.0 };
                                fine.x3f.set(fk, fj, fi, v);
                            }
                        }
                    }
                }
            }

            self.b = Some(fine);
        }

        // Internal faces: mean of the bracketing shared faces per axis.
        let b = self.b.as_mut().expect("field allocated");

        for fk in it[2].0..=it[2].1 {
            for fj in it[1].0..=it[1].1 {
                let mut fi = it[0].0 + 1;
                while fi <= it[0].1 {
                    let v = 0.5 * (b.x1f.at(fk, fj, fi - 1) + b.x1f.at(fk, fj, fi + 1));
                    b.x1f.set(fk, fj, fi, v);
                    fi += 2;
                }
            }
        }

        if f[1] == 1 {
            for fk in it[2].0..=it[2].1 {
                let mut fj = it[1].0 + 1;
                while fj <= it[1].1 {
                    for fi in it[0].0..=it[0].1 {
                        let v = 0.5 * (b.x2f.at(fk, fj - 1, fi) + b.x2f.at(fk, fj + 1, fi));
                        b.x2f.set(fk, fj, fi, v);
                    }
                    fj += 2;
                }
            }
        }

        if f[2] == 1 {
            let mut fk = it[2].0 + 1;
            while fk <= it[2].1 {
                for fj in it[1].0..=it[1].1 {
                    for fi in it[0].0..=it[0].1 {
                        let v = 0.5 * (b.x3f.at(fk - 1, fj, fi) + b.x3f.at(fk + 1, fj, fi));
                        b.x3f.set(fk, fj, fi, v);
                    }
                }
                fk += 2;
            }
        }
    }

    /// Copies the degenerate-axis face planes so staggered arrays stay
    /// consistent after an unpack that only wrote the base plane.
    fn duplicate_degenerate_faces(&mut self) {
        let Some(b) = self.b.as_mut() else { return };
        let it = [
            (self.space.start[0], self.space.end(0)),
            (self.space.start[1], self.space.end(1)),
            (self.space.start[2], self.space.end(2)),
        ];

        if self.nx[1] == 1 {
            for k in it[2].0..=it[2].1 {
                for i in it[0].0..=it[0].1 {
                    let v = b.x2f.at(k, it[1].0, i);
                    b.x2f.set(k, it[1].0 + 1, i, v);
                }
            }
        }
        if self.nx[2] == 1 {
            for j in it[1].0..=it[1].1 {
                for i in it[0].0..=it[0].1 {
                    let v = b.x3f.at(it[2].0, j, i);
                    b.x3f.set(it[2].0 + 1, j, i, v);
                }
            }
        }
    }

    /// Source bounds (in this block's own fine resolution) of the
    /// halo-extended half covering the child at `octant`.
    fn c2f_source_bounds(&self, octant: Octant) -> [(usize, usize); 3] {
        let f = self.f();
        let it = self.interior();

        let mut bounds = [(0, 0); 3];
        for axis in 0..3 {
            let half = self.nx[axis] / 2;
            bounds[axis] = if octant[axis] == 0 {
                (it[axis].0 - f[axis], it[axis].0 + half)
            } else {
                (it[axis].0 + half - f[axis], it[axis].1 + f[axis])
            };
            if self.nx[axis] == 1 {
                bounds[axis] = it[axis];
            }
        }
        bounds
    }

    /// Destination bounds in the coarse buffer for a prolongation source.
    fn c2f_dest_bounds(&self) -> [(usize, usize); 3] {
        let f = self.f();
        let ci = self.coarse_interior();
        [
            (ci[0].0 - 1, ci[0].1 + 1),
            (ci[1].0 - f[1], ci[1].1 + f[1]),
            (ci[2].0 - f[2], ci[2].1 + f[2]),
        ]
    }
}

impl BlockState for HydroState {
    fn payload_len(&self, kind: TransferKind) -> usize {
        let f = self.f();
        let [nx1, nx2, nx3] = self.nx;
        let (c1, c2, c3) = (nx1 / 2, (nx2 + 1) / 2, (nx3 + 1) / 2);

        match kind {
            TransferKind::Same => {
                let mut len = nx1 * nx2 * nx3 * self.nhydro;
                if self.b.is_some() {
                    len += (nx1 + 1) * nx2 * nx3
                        + nx1 * (nx2 + f[1]) * nx3
                        + nx1 * nx2 * (nx3 + f[2]);
                }
                len
            }
            TransferKind::FineToCoarse => {
                let mut len = c1 * c2 * c3 * self.nhydro;
                if self.b.is_some() {
                    len += (c1 + 1) * c2 * c3 + c1 * (c2 + f[1]) * c3 + c1 * c2 * (c3 + f[2]);
                }
                len
            }
            TransferKind::CoarseToFine => {
                let (h1, h2, h3) = (c1 + 2, c2 + 2 * f[1], c3 + 2 * f[2]);
                let mut len = h1 * h2 * h3 * self.nhydro;
                if self.b.is_some() {
                    len += (h1 + 1) * h2 * h3 + h1 * (h2 + f[1]) * h3 + h1 * h2 * (h3 + f[2]);
                }
                len
            }
        }
    }

    fn pack(&mut self, kind: TransferKind, octant: Octant, buf: &mut Vec<f64>) {
        let f = self.f();
        buf.clear();

        match kind {
            TransferKind::Same => {
                let [ir, jr, kr] = self.interior();
                self.u.pack(buf, kr, jr, ir);
                if let Some(b) = self.b.as_ref() {
                    b.x1f.pack(buf, kr, jr, (ir.0, ir.1 + 1));
                    b.x2f.pack(buf, kr, (jr.0, jr.1 + f[1]), ir);
                    b.x3f.pack(buf, (kr.0, kr.1 + f[2]), jr, ir);
                }
            }
            TransferKind::FineToCoarse => {
                self.restrict_cells();
                self.restrict_faces();

                let [ir, jr, kr] = self.coarse_interior();
                self.coarse_u.pack(buf, kr, jr, ir);
                if let Some(cb) = self.coarse_b.as_ref() {
                    cb.x1f.pack(buf, kr, jr, (ir.0, ir.1 + 1));
                    cb.x2f.pack(buf, kr, (jr.0, jr.1 + f[1]), ir);
                    cb.x3f.pack(buf, (kr.0, kr.1 + f[2]), jr, ir);
                }
            }
            TransferKind::CoarseToFine => {
                let [ir, jr, kr] = self.c2f_source_bounds(octant);
                self.u.pack(buf, kr, jr, ir);
                if let Some(b) = self.b.as_ref() {
                    b.x1f.pack(buf, kr, jr, (ir.0, ir.1 + 1));
                    b.x2f.pack(buf, kr, (jr.0, jr.1 + f[1]), ir);
                    b.x3f.pack(buf, (kr.0, kr.1 + f[2]), jr, ir);
                }
            }
        }

        debug_assert_eq!(buf.len(), self.payload_len(kind));
    }

    fn unpack(&mut self, kind: TransferKind, octant: Octant, buf: &[f64]) {
        debug_assert_eq!(buf.len(), self.payload_len(kind));
        let f = self.f();
        let mut p = 0;

        match kind {
            TransferKind::Same => {
                let [ir, jr, kr] = self.interior();
                self.u.unpack(buf, &mut p, kr, jr, ir);
                if let Some(b) = self.b.as_mut() {
                    b.x1f.unpack(buf, &mut p, kr, jr, (ir.0, ir.1 + 1));
                    b.x2f.unpack(buf, &mut p, kr, (jr.0, jr.1 + f[1]), ir);
                    b.x3f.unpack(buf, &mut p, (kr.0, kr.1 + f[2]), jr, ir);
                }
                self.duplicate_degenerate_faces();
            }
            TransferKind::FineToCoarse => {
                let [ir, jr, kr] = self.octant_bounds(octant);
                self.u.unpack(buf, &mut p, kr, jr, ir);
                if let Some(b) = self.b.as_mut() {
                    b.x1f.unpack(buf, &mut p, kr, jr, (ir.0, ir.1 + 1));
                    b.x2f.unpack(buf, &mut p, kr, (jr.0, jr.1 + f[1]), ir);
                    b.x3f.unpack(buf, &mut p, (kr.0, kr.1 + f[2]), jr, ir);
                }
                self.duplicate_degenerate_faces();
            }
            TransferKind::CoarseToFine => {
                let [ir, jr, kr] = self.c2f_dest_bounds();
                self.coarse_u.unpack(buf, &mut p, kr, jr, ir);
                if let Some(cb) = self.coarse_b.as_mut() {
                    cb.x1f.unpack(buf, &mut p, kr, jr, (ir.0, ir.1 + 1));
                    cb.x2f.unpack(buf, &mut p, kr, (jr.0, jr.1 + f[1]), ir);
                    cb.x3f.unpack(buf, &mut p, (kr.0, kr.1 + f[2]), jr, ir);
                }
                self.prolongate_cells();
                self.prolongate_faces();
                self.duplicate_degenerate_faces();
            }
        }
    }

    fn to_words(&self) -> Vec<f64> {
        let mut words = self.u.cells.data.clone();
        if let Some((w, w1)) = self.w.as_ref() {
            words.extend_from_slice(&w.cells.data);
            words.extend_from_slice(&w1.cells.data);
        }
        if let Some(b) = self.b.as_ref() {
            words.extend_from_slice(&b.x1f.data);
            words.extend_from_slice(&b.x2f.data);
            words.extend_from_slice(&b.x3f.data);
        }
        words
    }

    fn from_words(&mut self, words: &[f64]) -> Result<()> {
        fn take<'a>(words: &'a [f64], cursor: &mut usize, len: usize) -> Result<&'a [f64]> {
            if *cursor + len > words.len() {
                return Err(RillError::RestartBroken(format!(
                    "block payload is {} words short",
                    *cursor + len - words.len()
                )));
            }
            let slice = &words[*cursor..*cursor + len];
            *cursor += len;
            Ok(slice)
        }

        let mut cursor = 0;

        let len = self.u.cells.data.len();
        self.u
            .cells
            .data
            .copy_from_slice(take(words, &mut cursor, len)?);

        if let Some((w, w1)) = self.w.as_mut() {
            let len = w.cells.data.len();
            w.cells.data.copy_from_slice(take(words, &mut cursor, len)?);
            let len = w1.cells.data.len();
            w1.cells.data.copy_from_slice(take(words, &mut cursor, len)?);
        }
        if let Some(b) = self.b.as_mut() {
            let len = b.x1f.data.len();
            b.x1f.data.copy_from_slice(take(words, &mut cursor, len)?);
            let len = b.x2f.data.len();
            b.x2f.data.copy_from_slice(take(words, &mut cursor, len)?);
            let len = b.x3f.data.len();
            b.x3f.data.copy_from_slice(take(words, &mut cursor, len)?);
        }

        if cursor != words.len() {
            return Err(RillError::RestartBroken(format!(
                "block payload has {} trailing words",
                words.len() - cursor
            )));
        }
        Ok(())
    }

    fn new_block_dt(&self) -> f64 {
        self.new_dt
    }

    fn set_new_block_dt(&mut self, dt: f64) {
        self.new_dt = dt;
    }

    fn conservative_totals(&self, cell_volume: f64) -> Vec<f64> {
        let [ir, jr, kr] = self.interior();

        (0..self.nhydro)
            .map(|n| {
                let mut total = 0.0;
                for k in kr.0..=kr.1 {
                    for j in jr.0..=jr.1 {
                        for i in ir.0..=ir.1 {
                            total += self.u.at(n, k, j, i);
                        }
                    }
                }
                total * cell_volume
            })
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
