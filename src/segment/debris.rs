use log::info;
use ndarray::Array2;
use std::collections::VecDeque;

use super::labeler::{Label, LabelImage, BACKGROUND_LABEL};

/// Final labels after debris removal. Only `filter_debris` constructs these.
#[derive(Clone, Debug, PartialEq)]
pub struct CellLabels {
    image: LabelImage,
}

impl CellLabels {
    pub fn labels(&self) -> &Array2<Label> {
        &self.image.labels
    }

    pub fn dim(&self) -> (usize, usize) {
        self.image.dim()
    }

    pub fn label_sizes(&self) -> Vec<usize> {
        self.image.label_sizes()
    }

    /// Accepted cell ids, ascending. Never contains 0.
    pub fn cell_ids(&self) -> Vec<Label> {
        self.image.present_labels()
    }

    pub fn ncells(&self) -> usize {
        self.image.nregions()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebrisStats {
    pub nremoved: usize,
    pub nkept: usize,
    pub nfilled_pixels: usize,
}

// Reset every region smaller than `min_region_size` pixels to background,
// then fill holes enclosed by the surviving regions. Merged doublets are
// left as they are.
pub fn filter_debris(image: LabelImage, min_region_size: usize) -> (CellLabels, DebrisStats) {
    let mut image = image;
    let sizes = image.label_sizes();

    let nremoved = sizes
        .iter()
        .skip(1)
        .filter(|&&size| size > 0 && size < min_region_size)
        .count();

    image.labels.mapv_inplace(|label| {
        if label != BACKGROUND_LABEL && sizes[label as usize] < min_region_size {
            BACKGROUND_LABEL
        } else {
            label
        }
    });

    let nfilled_pixels = fill_holes(&mut image.labels);
    let nkept = image.nregions();

    info!(
        "Debris filter removed {} regions under {} pixels, kept {}, filled {} hole pixels",
        nremoved, min_region_size, nkept, nfilled_pixels
    );

    (
        CellLabels { image },
        DebrisStats {
            nremoved,
            nkept,
            nfilled_pixels,
        },
    )
}

/// Fill background components that do not touch the grid border and are
/// enclosed by a single label. Returns the number of pixels filled.
pub fn fill_holes(labels: &mut Array2<Label>) -> usize {
    let (nx, ny) = labels.dim();
    let mut visited = Array2::from_elem((nx, ny), false);
    let mut queue = VecDeque::new();
    let mut component = Vec::new();
    let mut nfilled = 0;

    for i in 0..nx {
        for j in 0..ny {
            if visited[[i, j]] || labels[[i, j]] != BACKGROUND_LABEL {
                continue;
            }

            component.clear();
            let mut touches_border = false;
            let mut enclosing: Option<Label> = None;
            let mut multiple = false;

            visited[[i, j]] = true;
            queue.push_back((i, j));
            while let Some((a, b)) = queue.pop_front() {
                component.push((a, b));
                if a == 0 || b == 0 || a == nx - 1 || b == ny - 1 {
                    touches_border = true;
                }

                let mut neighbors = [None; 4];
                if a > 0 {
                    neighbors[0] = Some((a - 1, b));
                }
                if a + 1 < nx {
                    neighbors[1] = Some((a + 1, b));
                }
                if b > 0 {
                    neighbors[2] = Some((a, b - 1));
                }
                if b + 1 < ny {
                    neighbors[3] = Some((a, b + 1));
                }

                for (c, d) in neighbors.into_iter().flatten() {
                    let label = labels[[c, d]];
                    if label == BACKGROUND_LABEL {
                        if !visited[[c, d]] {
                            visited[[c, d]] = true;
                            queue.push_back((c, d));
                        }
                    } else {
                        match enclosing {
                            None => enclosing = Some(label),
                            Some(other) if other != label => multiple = true,
                            _ => {}
                        }
                    }
                }
            }

            if touches_border || multiple {
                continue;
            }
            if let Some(label) = enclosing {
                for &(a, b) in &component {
                    labels[[a, b]] = label;
                }
                nfilled += component.len();
            }
        }
    }

    nfilled
}
