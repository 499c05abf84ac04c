use ndarray::parallel::prelude::*;
use ndarray::{Array2, Axis};

/// Foreground (true) / background (false) per grid cell.
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryMask {
    pub mask: Array2<bool>,
}

impl BinaryMask {
    pub fn new(mask: Array2<bool>) -> Self {
        BinaryMask { mask }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.mask.dim()
    }

    pub fn nforeground(&self) -> usize {
        self.mask.iter().filter(|&&v| v).count()
    }

    pub fn is_foreground(&self, i: usize, j: usize) -> bool {
        self.mask[[i, j]]
    }
}

// Half width of each row of a disc of the given radius, for row offsets -r..=r.
fn disc_half_widths(radius: usize) -> Vec<usize> {
    let r = radius as f32;
    (-(radius as isize)..=(radius as isize))
        .map(|d| {
            let d = d as f32;
            (r * r - d * d).max(0.0).sqrt().floor() as usize
        })
        .collect()
}

/// Mean over a disc around every cell, counting only cells inside the grid.
pub fn disc_mean(values: &Array2<f32>, radius: usize) -> Array2<f32> {
    let (nx, ny) = values.dim();

    // per row prefix sums along the second axis
    let mut prefix = Array2::<f64>::zeros((nx, ny + 1));
    for i in 0..nx {
        let mut acc = 0.0;
        for j in 0..ny {
            acc += values[[i, j]] as f64;
            prefix[[i, j + 1]] = acc;
        }
    }

    let half_widths = disc_half_widths(radius);
    let r = radius as isize;

    let mut means = Array2::<f32>::zeros((nx, ny));
    means
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            for j in 0..ny {
                let mut total = 0.0;
                let mut count = 0;
                for (t, &hw) in half_widths.iter().enumerate() {
                    let ii = i as isize + t as isize - r;
                    if ii < 0 || ii >= nx as isize {
                        continue;
                    }
                    let ii = ii as usize;
                    let j0 = j.saturating_sub(hw);
                    let j1 = (j + hw).min(ny - 1);
                    total += prefix[[ii, j1 + 1]] - prefix[[ii, j0]];
                    count += j1 + 1 - j0;
                }
                row[j] = (total / count as f64) as f32;
            }
        });

    means
}

// Adaptive threshold: a cell is foreground when it exceeds the mean of its
// disc neighborhood by more than `offset`.
pub fn adaptive_threshold(values: &Array2<f32>, radius: usize, offset: f32) -> BinaryMask {
    let means = disc_mean(values, radius);
    let mut mask = Array2::from_elem(values.dim(), false);
    ndarray::Zip::from(&mut mask)
        .and(values)
        .and(&means)
        .par_for_each(|m, &v, &μ| *m = v > μ + offset);
    BinaryMask::new(mask)
}
