use log::{info, warn};
use ndarray::{Array1, Array2};

use crate::error::{Error, Result};
use crate::params::{Extent, SegmentationParams};
use crate::spots::{coordinate_span, Spot};

// Spot weights binned onto a regular grid, indexed [x bin, y bin].
//
// Along with the summed weights we keep, for every grid cell, the indices of
// the spots that landed in it, stored CSR style: the spots of flat cell `k`
// are `spot_indices[spot_offsets[k]..spot_offsets[k+1]]`.
pub struct RasterGrid {
    pub values: Array2<f32>,

    // bin centers, in spot coordinate units
    pub xs: Array1<f32>,
    pub ys: Array1<f32>,

    pub extent: Extent,

    spot_offsets: Vec<usize>,
    spot_indices: Vec<usize>,
    nout_of_bounds: usize,
}

impl RasterGrid {
    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn pixel_width(&self) -> f32 {
        self.extent.width() / self.xs.len() as f32
    }

    pub fn pixel_height(&self) -> f32 {
        self.extent.height() / self.ys.len() as f32
    }

    /// Grid cell containing (x, y), or None if it falls outside the extent.
    pub fn bin(&self, x: f32, y: f32) -> Option<(usize, usize)> {
        let (nx, ny) = self.shape();
        bin_coordinate(x, self.extent.xmin, self.extent.xmax, nx)
            .zip(bin_coordinate(y, self.extent.ymin, self.extent.ymax, ny))
    }

    /// Indices of the spots binned into cell (i, j).
    pub fn spots_in(&self, i: usize, j: usize) -> &[usize] {
        let (_, ny) = self.shape();
        let k = i * ny + j;
        &self.spot_indices[self.spot_offsets[k]..self.spot_offsets[k + 1]]
    }

    /// Spots that fell outside an explicitly configured extent.
    pub fn nout_of_bounds(&self) -> usize {
        self.nout_of_bounds
    }
}

fn bin_coordinate(v: f32, v0: f32, v1: f32, n: usize) -> Option<usize> {
    if !(v >= v0 && v <= v1) {
        return None;
    }
    let k = ((v - v0) / (v1 - v0) * n as f32).floor() as usize;
    // the upper edge belongs to the last bin
    Some(k.min(n - 1))
}

// Grid bounds for a spot span: square pixels, no smaller than
// `min_pixel_size`, with the grid centered on the span. A zero-width axis
// gets the same pixel edge as the other.
fn square_extent(span: Extent, nx: usize, ny: usize, min_pixel_size: f32) -> Extent {
    let size = (span.width() / nx as f32)
        .max(span.height() / ny as f32)
        .max(min_pixel_size);
    let (cx, cy) = (
        0.5 * (span.xmin + span.xmax),
        0.5 * (span.ymin + span.ymax),
    );
    let (hw, hh) = (0.5 * size * nx as f32, 0.5 * size * ny as f32);

    // rounding must never leave a spot at the span boundary outside the grid
    Extent::new(
        (cx - hw).min(span.xmin),
        (cx + hw).max(span.xmax),
        (cy - hh).min(span.ymin),
        (cy + hh).max(span.ymax),
    )
}

fn validate_spot(i: usize, spot: &Spot) -> Result<()> {
    let z_ok = spot.z.map_or(true, |z| z.is_finite());
    if !spot.x.is_finite() || !spot.y.is_finite() || !z_ok {
        return Err(Error::input(
            "rasterize",
            format!(
                "spot {} has a non-finite location ({}, {}, {:?})",
                i, spot.x, spot.y, spot.z
            ),
        ));
    }
    if !spot.weight.is_finite() {
        return Err(Error::input(
            "rasterize",
            format!("spot {} has a non-finite weight {}", i, spot.weight),
        ));
    }
    Ok(())
}

/// Sum spot weights into an `nx` x `ny` grid and record the inverse index.
pub fn rasterize(spots: &[Spot], params: &SegmentationParams) -> Result<RasterGrid> {
    for (i, spot) in spots.iter().enumerate() {
        validate_spot(i, spot)?;
    }

    let (nx, ny) = (params.nx, params.ny);
    if nx == 0 || ny == 0 {
        return Err(Error::config(
            "nx/ny",
            format!("{}x{}", nx, ny),
            "grid dimensions must be positive",
        ));
    }

    let extent = match params.extent {
        Some(extent) => extent,
        None => {
            let span = coordinate_span(spots).unwrap_or(Extent::new(0.0, 0.0, 0.0, 0.0));
            square_extent(span, nx, ny, params.min_pixel_size)
        }
    };

    let xstep = extent.width() / nx as f32;
    let ystep = extent.height() / ny as f32;
    let xs = Array1::from_iter((0..nx).map(|i| extent.xmin + (i as f32 + 0.5) * xstep));
    let ys = Array1::from_iter((0..ny).map(|j| extent.ymin + (j as f32 + 0.5) * ystep));

    let mut values = Array2::<f32>::zeros((nx, ny));
    let mut spot_bins = Vec::with_capacity(spots.len());
    let mut spot_offsets = vec![0; nx * ny + 1];
    let mut nout_of_bounds = 0;

    for spot in spots {
        let bin = bin_coordinate(spot.x, extent.xmin, extent.xmax, nx)
            .zip(bin_coordinate(spot.y, extent.ymin, extent.ymax, ny));
        match bin {
            Some((i, j)) => {
                values[[i, j]] += spot.weight;
                spot_offsets[i * ny + j + 1] += 1;
                spot_bins.push(Some(i * ny + j));
            }
            None => {
                nout_of_bounds += 1;
                spot_bins.push(None);
            }
        }
    }

    for k in 0..nx * ny {
        spot_offsets[k + 1] += spot_offsets[k];
    }

    let mut fill = spot_offsets.clone();
    let mut spot_indices = vec![0; spot_offsets[nx * ny]];
    for (spot_index, bin) in spot_bins.iter().enumerate() {
        if let Some(k) = bin {
            spot_indices[fill[*k]] = spot_index;
            fill[*k] += 1;
        }
    }

    if nout_of_bounds > 0 {
        warn!(
            "{} spots fall outside the raster extent and will be unassigned",
            nout_of_bounds
        );
    }
    info!(
        "Rasterized {} spots onto a {}x{} grid ({:.3} x {:.3} per pixel)",
        spots.len() - nout_of_bounds,
        nx,
        ny,
        xstep,
        ystep
    );

    Ok(RasterGrid {
        values,
        xs,
        ys,
        extent,
        spot_offsets,
        spot_indices,
        nout_of_bounds,
    })
}
