/// Physical extent and resolution of a rectangular region, per axis.
///
/// A `RegionSize` describes both the whole mesh and individual blocks. The
/// generator maps a normalized coordinate `r` in `[0, 1]` to physical space:
/// linear when `ratio == 1`, geometric otherwise. Only mild stretching
/// (`|ratio - 1| <= 0.1`) is accepted by the configuration layer.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct RegionSize {
    pub xmin: [f64; 3],
    pub xmax: [f64; 3],
    pub nx: [usize; 3],
    pub ratio: [f64; 3],
}

impl RegionSize {
    /// Effective dimension: 1, 2 or 3 depending on which axes are degenerate.
    pub fn dim(&self) -> usize {
        if self.nx[2] > 1 {
            3
        } else if self.nx[1] > 1 {
            2
        } else {
            1
        }
    }

    /// Maps `r` in `[0, 1]` along `axis` to a physical coordinate.
    ///
    /// For a geometric spacing law the cell widths form a geometric series
    /// with the configured ratio; the weights below are the closed form of
    /// its partial sums.
    pub fn position(&self, axis: usize, r: f64) -> f64 {
        let (min, max) = (self.xmin[axis], self.xmax[axis]);

        if self.ratio[axis] == 1.0 {
            return min + r * (max - min);
        }

        let nx = self.nx[axis] as f64;
        let ratn = self.ratio[axis].powf(nx);
        let rnx = self.ratio[axis].powf(r * nx);
        let lw = (rnx - ratn) / (1.0 - ratn);

        min * lw + max * (1.0 - lw)
    }

    pub fn volume(&self) -> f64 {
        (0..3)
            .map(|axis| self.xmax[axis] - self.xmin[axis])
            .product()
    }

    /// Mean cell volume; exact for unit ratios.
    pub fn cell_volume(&self) -> f64 {
        self.volume() / self.nx.iter().product::<usize>() as f64
    }

    /// Narrowest cell extent over the non-degenerate axes, for time-step
    /// estimates.
    pub fn min_spacing(&self) -> f64 {
        (0..3)
            .filter(|&axis| self.nx[axis] > 1 || axis == 0)
            .map(|axis| (self.xmax[axis] - self.xmin[axis]) / self.nx[axis] as f64)
            .fold(f64::INFINITY, f64::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(nx: [usize; 3], ratio: f64) -> RegionSize {
        RegionSize {
            xmin: [0.0; 3],
            xmax: [1.0; 3],
            nx,
            ratio: [ratio, 1.0, 1.0],
        }
    }

    #[test]
    fn linear_generator() {
        let rs = unit([16, 1, 1], 1.0);
        assert_eq!(rs.position(0, 0.0), 0.0);
        assert_eq!(rs.position(0, 1.0), 1.0);
        assert_eq!(rs.position(0, 0.5), 0.5);
        assert_eq!(rs.dim(), 1);
    }

    #[test]
    fn geometric_generator_hits_endpoints() {
        let rs = unit([16, 1, 1], 1.05);
        assert!((rs.position(0, 0.0) - 0.0).abs() < 1e-14);
        assert!((rs.position(0, 1.0) - 1.0).abs() < 1e-14);

        // Stretching with ratio > 1 grows cells toward xmax, so the midpoint
        // in index space lands below the physical midpoint.
        assert!(rs.position(0, 0.5) < 0.5);

        // Monotone
        let mut prev = rs.position(0, 0.0);
        for i in 1..=16 {
            let x = rs.position(0, i as f64 / 16.0);
            assert!(x > prev);
            prev = x;
        }
    }
}
