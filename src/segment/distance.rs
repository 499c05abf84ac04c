use ndarray::{s, Array2, ArrayViewMut1, Axis, Zip};

use super::threshold::BinaryMask;

// Squared distance along a lane to the nearest zero (background) entry.
// Every lane is guaranteed a background entry by the padding frame.
fn lane_distance(mut lane: ArrayViewMut1<f64>) {
    let n = lane.len();
    let mut last = None;
    for i in 0..n {
        if lane[i] == 0.0 {
            last = Some(i);
        } else if let Some(b) = last {
            lane[i] = (i - b) as f64;
        }
    }
    let mut last = None;
    for i in (0..n).rev() {
        if lane[i] == 0.0 {
            last = Some(i);
        } else if let Some(b) = last {
            lane[i] = lane[i].min((b - i) as f64);
        }
    }
    lane.mapv_inplace(|d| d * d);
}

fn intersect(f: &[f64], q: usize, p: usize) -> f64 {
    let (qf, pf) = (q as f64, p as f64);
    ((f[q] + qf * qf) - (f[p] + pf * pf)) / (2.0 * qf - 2.0 * pf)
}

// Felzenszwalb & Huttenlocher lower envelope of parabolas rooted at `f`.
fn lane_envelope(mut lane: ArrayViewMut1<f64>) {
    let n = lane.len();
    let f: Vec<f64> = lane.iter().cloned().collect();
    let mut v = vec![0usize; n];
    let mut z = vec![0.0f64; n + 1];
    let mut k = 0;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;

    for q in 1..n {
        let mut s = intersect(&f, q, v[k]);
        while s <= z[k] {
            k -= 1;
            s = intersect(&f, q, v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = f64::INFINITY;
    }

    k = 0;
    for q in 0..n {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let d = q as f64 - v[k] as f64;
        lane[q] = d * d + f[v[k]];
    }
}

/// Euclidean distance from each foreground cell to the nearest background
/// cell. Cells beyond the grid border count as background.
pub fn distance_map(mask: &BinaryMask) -> Array2<f32> {
    let (nx, ny) = mask.dim();

    // one pixel background frame around the mask
    let mut dist = Array2::<f64>::zeros((nx + 2, ny + 2));
    Zip::from(dist.slice_mut(s![1..nx + 1, 1..ny + 1]))
        .and(&mask.mask)
        .for_each(|d, &fg| *d = if fg { f64::INFINITY } else { 0.0 });

    Zip::from(dist.lanes_mut(Axis(0))).par_for_each(lane_distance);
    Zip::from(dist.lanes_mut(Axis(1))).par_for_each(lane_envelope);

    dist.slice(s![1..nx + 1, 1..ny + 1]).mapv(|d| d.sqrt() as f32)
}
