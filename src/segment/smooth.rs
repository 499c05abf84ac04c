use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView1, ArrayViewMut1, Axis, Zip};

fn normal_pdf(σ: f32, x: f32) -> f32 {
    const SQRT_TWO_PI: f32 = 2.5066282746310002;
    (-0.5 * (x / σ).powi(2)).exp() / (σ * SQRT_TWO_PI)
}

/// Normalized 1D gaussian kernel with radius ceil(3σ).
pub fn gaus_kernel(σ: f32) -> Vec<f32> {
    let k = (3.0 * σ).ceil().max(1.0) as usize;
    let mut kernel: Vec<f32> = (0..(1 + 2 * k))
        .map(|i| normal_pdf(σ, i as f32 - k as f32))
        .collect();
    let total: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= total);
    kernel
}

// Mirror an out of range index back into 0..n (edge pixel not repeated).
pub(crate) fn reflect(k: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let mut k = k.rem_euclid(period);
    if k >= n as isize {
        k = period - k;
    }
    k as usize
}

fn convolve_lane(input: ArrayView1<f32>, mut output: ArrayViewMut1<f32>, kernel: &[f32]) {
    let n = input.len();
    let radius = (kernel.len() / 2) as isize;
    for (i, out) in output.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (t, w) in kernel.iter().enumerate() {
            let k = reflect(i as isize + t as isize - radius, n);
            acc += w * input[k];
        }
        *out = acc;
    }
}

fn convolve_axis(input: &Array2<f32>, kernel: &[f32], axis: Axis) -> Array2<f32> {
    let mut output = Array2::zeros(input.dim());
    Zip::from(output.lanes_mut(axis))
        .and(input.lanes(axis))
        .par_for_each(|out, lane| convolve_lane(lane, out, kernel));
    output
}

// Separable gaussian blur with mirrored borders. σ is in pixels.
pub fn gaussian_blur(values: &Array2<f32>, σ: f32) -> Array2<f32> {
    let kernel = gaus_kernel(σ);
    let blurred = convolve_axis(values, &kernel, Axis(1));
    convolve_axis(&blurred, &kernel, Axis(0))
}
