use ndarray::Array2;

// Clip hot spots to `max_value`, fill non-finite cells with the smallest
// finite value, then rescale linearly onto [0, 1].
pub fn normalize(values: &Array2<f32>, max_value: Option<f32>) -> Array2<f32> {
    let mut out = values.clone();

    if let Some(max_value) = max_value {
        out.mapv_inplace(|v| if v > max_value { max_value } else { v });
    }

    let mut vmin = f32::INFINITY;
    let mut vmax = f32::NEG_INFINITY;
    for &v in out.iter().filter(|v| v.is_finite()) {
        vmin = vmin.min(v);
        vmax = vmax.max(v);
    }

    if !vmin.is_finite() {
        // nothing observed at all
        out.fill(0.0);
        return out;
    }

    out.mapv_inplace(|v| if v.is_finite() { v } else { vmin });

    let range = vmax - vmin;
    if range <= 0.0 {
        out.fill(0.0);
    } else {
        out.mapv_inplace(|v| ((v - vmin) / range).clamp(0.0, 1.0));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn test_clip_and_rescale() {
        let values = array![[0.0, 1.0], [2.0, 50.0]];
        let out = normalize(&values, Some(4.0));
        assert_eq!(out, array![[0.0, 0.25], [0.5, 1.0]]);
    }

    #[test]
    fn test_fill_non_finite() {
        let values = array![[f32::NAN, 2.0], [4.0, f32::INFINITY]];
        let out = normalize(&values, None);
        assert_eq!(out, array![[0.0, 0.0], [1.0, 0.0]]);
    }

    #[test]
    fn test_constant_grid() {
        let values = Array2::from_elem((3, 3), 7.0);
        assert!(normalize(&values, None).iter().all(|&v| v == 0.0));
    }

    proptest! {
        #[test]
        fn bounded_normalization(
            data in prop::collection::vec(
                prop_oneof![
                    -1e6f32..1e6,
                    Just(f32::NAN),
                    Just(f32::INFINITY),
                    Just(f32::NEG_INFINITY),
                ],
                16,
            ),
            ceiling in prop::option::of(0.1f32..1e5),
        ) {
            let values = Array2::from_shape_vec((4, 4), data).unwrap();
            let out = normalize(&values, ceiling);
            prop_assert!(out.iter().all(|v| v.is_finite() && *v >= 0.0 && *v <= 1.0));
        }
    }
}
