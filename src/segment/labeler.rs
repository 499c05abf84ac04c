use ndarray::Array2;
use std::collections::VecDeque;

use super::threshold::BinaryMask;
use crate::params::{LabelerKind, SegmentationParams};

pub type Label = u32;

/// Label 0 is background; positive labels are candidate cell regions.
pub const BACKGROUND_LABEL: Label = 0;

#[derive(Clone, Debug, PartialEq)]
pub struct LabelImage {
    pub labels: Array2<Label>,
}

impl LabelImage {
    pub fn new(labels: Array2<Label>) -> Self {
        LabelImage { labels }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.labels.dim()
    }

    pub fn max_label(&self) -> Label {
        self.labels.iter().cloned().max().unwrap_or(BACKGROUND_LABEL)
    }

    /// Pixel count per label, indexed by label (entry 0 is background).
    pub fn label_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.max_label() as usize + 1];
        for &label in self.labels.iter() {
            sizes[label as usize] += 1;
        }
        sizes
    }

    /// Sorted labels present in the image, excluding background.
    pub fn present_labels(&self) -> Vec<Label> {
        self.label_sizes()
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, &size)| size > 0)
            .map(|(label, _)| label as Label)
            .collect()
    }

    pub fn nregions(&self) -> usize {
        self.present_labels().len()
    }
}

/// Turns a binary mask (and its distance map) into a label image.
pub trait RegionLabeler {
    fn label(&self, mask: &BinaryMask, distance: &Array2<f32>) -> LabelImage;
}

pub fn labeler_from_params(params: &SegmentationParams) -> Box<dyn RegionLabeler + Send + Sync> {
    match params.labeler {
        LabelerKind::Watershed => Box::new(WatershedLabeler {
            tolerance: params.watershed_tolerance,
            ext: params.watershed_ext.max(1),
        }),
        LabelerKind::Components => Box::new(ComponentLabeler),
    }
}

struct UnionFind {
    parent: Vec<Label>,
}

impl UnionFind {
    fn new() -> Self {
        // slot 0 stands in for background and is never used
        UnionFind { parent: vec![0] }
    }

    fn make(&mut self) -> Label {
        let label = self.parent.len() as Label;
        self.parent.push(label);
        label
    }

    fn find(&mut self, label: Label) -> Label {
        let mut root = label;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cur = label;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        root
    }
}

// Renumber labels 1..n in raster scan order of first appearance.
fn relabel_sequential(labels: &mut Array2<Label>, uf: &mut UnionFind) {
    let mut remap = vec![BACKGROUND_LABEL; uf.parent.len()];
    let mut next = 1;
    for label in labels.iter_mut() {
        if *label == BACKGROUND_LABEL {
            continue;
        }
        let root = uf.find(*label) as usize;
        if remap[root] == BACKGROUND_LABEL {
            remap[root] = next;
            next += 1;
        }
        *label = remap[root];
    }
}

// Marker controlled watershed on the distance map.
//
// Pixels are flooded from the highest distance downward. A pixel with no
// labeled pixel within `ext` starts a new basin (its seed). A pixel touching
// several basins joins the one with the highest seed, and any other basin
// whose seed rises less than `tolerance` above the pixel is merged into it.
pub struct WatershedLabeler {
    pub tolerance: f32,
    pub ext: usize,
}

impl RegionLabeler for WatershedLabeler {
    fn label(&self, mask: &BinaryMask, distance: &Array2<f32>) -> LabelImage {
        let (nx, ny) = mask.dim();
        let mut labels = Array2::<Label>::zeros((nx, ny));

        let mut order: Vec<(usize, usize)> = mask
            .mask
            .indexed_iter()
            .filter(|(_, &fg)| fg)
            .map(|(ij, _)| ij)
            .collect();
        order.sort_by(|a, b| {
            distance[[b.0, b.1]]
                .total_cmp(&distance[[a.0, a.1]])
                .then(a.cmp(b))
        });

        let mut uf = UnionFind::new();
        let mut seed_height: Vec<f32> = vec![f32::NEG_INFINITY];
        let mut neighbors: Vec<Label> = Vec::new();

        for (i, j) in order {
            let v = distance[[i, j]];

            neighbors.clear();
            let i0 = i.saturating_sub(self.ext);
            let i1 = (i + self.ext).min(nx - 1);
            let j0 = j.saturating_sub(self.ext);
            let j1 = (j + self.ext).min(ny - 1);
            for a in i0..=i1 {
                for b in j0..=j1 {
                    let label = labels[[a, b]];
                    if label != BACKGROUND_LABEL {
                        let root = uf.find(label);
                        if !neighbors.contains(&root) {
                            neighbors.push(root);
                        }
                    }
                }
            }

            if neighbors.is_empty() {
                let label = uf.make();
                seed_height.push(v);
                labels[[i, j]] = label;
                continue;
            }

            let mut top = neighbors[0];
            for &root in &neighbors[1..] {
                let (h, htop) = (seed_height[root as usize], seed_height[top as usize]);
                if h > htop || (h == htop && root < top) {
                    top = root;
                }
            }

            for &root in &neighbors {
                if root != top && seed_height[root as usize] - v < self.tolerance {
                    uf.parent[root as usize] = top;
                }
            }

            labels[[i, j]] = top;
        }

        relabel_sequential(&mut labels, &mut uf);
        LabelImage::new(labels)
    }
}

/// 8-connected components of the mask; ignores the distance map.
pub struct ComponentLabeler;

impl RegionLabeler for ComponentLabeler {
    fn label(&self, mask: &BinaryMask, _distance: &Array2<f32>) -> LabelImage {
        let (nx, ny) = mask.dim();
        let mut labels = Array2::<Label>::zeros((nx, ny));
        let mut queue = VecDeque::new();
        let mut next = 1;

        for i in 0..nx {
            for j in 0..ny {
                if !mask.is_foreground(i, j) || labels[[i, j]] != BACKGROUND_LABEL {
                    continue;
                }
                labels[[i, j]] = next;
                queue.push_back((i, j));
                while let Some((a, b)) = queue.pop_front() {
                    for c in a.saturating_sub(1)..=(a + 1).min(nx - 1) {
                        for d in b.saturating_sub(1)..=(b + 1).min(ny - 1) {
                            if mask.is_foreground(c, d) && labels[[c, d]] == BACKGROUND_LABEL {
                                labels[[c, d]] = next;
                                queue.push_back((c, d));
                            }
                        }
                    }
                }
                next += 1;
            }
        }

        LabelImage::new(labels)
    }
}
