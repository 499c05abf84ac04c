use itertools::Itertools;
use log::info;
use ndarray::{Array2, Axis};
use std::collections::HashMap;

use crate::params::SegmentationParams;
use crate::segment::labeler::{Label, BACKGROUND_LABEL};
use crate::segment::Segmentation;
use crate::spots::SpotTable;

/// Gene x cell count matrix. Rows follow `genes` (sorted, unique), columns
/// follow `cells` (accepted cell ids, ascending).
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionMatrix {
    pub genes: Vec<String>,
    pub cells: Vec<Label>,
    pub counts: Array2<u32>,
}

impl ExpressionMatrix {
    pub fn ngenes(&self) -> usize {
        self.genes.len()
    }

    pub fn ncells(&self) -> usize {
        self.cells.len()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CellMetadata {
    pub cell: Label,
    pub x: f32,
    pub y: f32,
    pub z: Option<f32>,
    pub area: f32,
    pub layer: u32,
    pub experiment: String,

    // assigned spots and distinct genes among them
    pub population: usize,
    pub ngenes: usize,
}

// Most frequent experiment among a cell's spots, ties broken by name.
fn modal_experiment(counts: &HashMap<u32, usize>, names: &[String]) -> Option<String> {
    counts
        .iter()
        .sorted_by(|(a, na), (b, nb)| nb.cmp(na).then(names[**a as usize].cmp(&names[**b as usize])))
        .next()
        .map(|(e, _)| names[*e as usize].clone())
}

/// Cross-tabulate genes against assigned cells and summarize each cell.
pub fn aggregate(
    table: &SpotTable,
    seg: &Segmentation,
    params: &SegmentationParams,
) -> (ExpressionMatrix, Vec<CellMetadata>) {
    let cells = seg.cell_ids();
    let ncells = cells.len();

    // sorted gene names, and a map from interned gene index to matrix row
    let gene_order: Vec<usize> = (0..table.ngenes())
        .sorted_by(|&a, &b| table.gene_names[a].cmp(&table.gene_names[b]))
        .collect();
    let genes: Vec<String> = gene_order
        .iter()
        .map(|&g| table.gene_names[g].clone())
        .collect();
    let mut gene_row = vec![0; table.ngenes()];
    for (row, &g) in gene_order.iter().enumerate() {
        gene_row[g] = row;
    }

    let max_label = cells.last().cloned().unwrap_or(BACKGROUND_LABEL) as usize;
    let mut cell_col = vec![usize::MAX; max_label + 1];
    for (col, &cell) in cells.iter().enumerate() {
        cell_col[cell as usize] = col;
    }

    let mut counts = Array2::<u32>::zeros((genes.len(), ncells));
    let mut population = vec![0usize; ncells];
    let mut zsum = vec![0.0f64; ncells];
    let mut zcount = vec![0usize; ncells];
    let mut experiments: Vec<HashMap<u32, usize>> = vec![HashMap::new(); ncells];

    for (spot, &cell) in table.spots.iter().zip(&seg.assignments) {
        if cell == BACKGROUND_LABEL {
            continue;
        }
        let col = cell_col[cell as usize];
        counts[[gene_row[spot.gene as usize], col]] += 1;
        population[col] += 1;
        if let Some(z) = spot.z {
            zsum[col] += z as f64;
            zcount[col] += 1;
        }
        if let Some(e) = spot.experiment {
            *experiments[col].entry(e).or_insert(0) += 1;
        }
    }

    // pixel centroids and areas
    let mut xsum = vec![0.0f64; ncells];
    let mut ysum = vec![0.0f64; ncells];
    let mut npixels = vec![0usize; ncells];
    for ((i, j), &label) in seg.cells.labels().indexed_iter() {
        if label == BACKGROUND_LABEL {
            continue;
        }
        let col = cell_col[label as usize];
        xsum[col] += seg.grid.xs[i] as f64;
        ysum[col] += seg.grid.ys[j] as f64;
        npixels[col] += 1;
    }

    let scale = params.coordinate_scale;
    let pixel_area = seg.grid.pixel_width() * seg.grid.pixel_height() * scale * scale;

    let ngenes_detected: Vec<usize> = counts
        .axis_iter(Axis(1))
        .map(|column| column.iter().filter(|&&c| c > 0).count())
        .collect();

    let metadata: Vec<CellMetadata> = (0..ncells)
        .map(|col| {
            let n = npixels[col].max(1) as f64;
            CellMetadata {
                cell: cells[col],
                x: (xsum[col] / n) as f32 * scale,
                y: (ysum[col] / n) as f32 * scale,
                z: if zcount[col] > 0 {
                    Some((zsum[col] / zcount[col] as f64) as f32 * scale)
                } else {
                    None
                },
                area: npixels[col] as f32 * pixel_area,
                layer: params.layer,
                experiment: modal_experiment(&experiments[col], &table.experiment_names)
                    .unwrap_or_else(|| params.experiment.clone()),
                population: population[col],
                ngenes: ngenes_detected[col],
            }
        })
        .collect();

    info!(
        "Aggregated {} assigned spots into a {} gene x {} cell matrix",
        population.iter().sum::<usize>(),
        genes.len(),
        ncells
    );

    (
        ExpressionMatrix {
            genes,
            cells,
            counts,
        },
        metadata,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Extent;
    use crate::segment::segment_spots;

    fn two_cell_table() -> SpotTable {
        let mut table = SpotTable::new();
        for i in 20..24 {
            for j in 20..24 {
                let x = i as f32 + 0.5;
                let y = j as f32 + 0.5;
                table.push_full(x, y, Some(2.0), "Sst", Some("run1"), 1.0);
                table.push_full(x, y, Some(4.0), "Gad1", Some("run1"), 1.0);
            }
        }
        for i in 60..64 {
            for j in 60..64 {
                let x = i as f32 + 0.5;
                let y = j as f32 + 0.5;
                table.push_full(x, y, None, "Slc17a7", Some("run2"), 1.0);
            }
        }
        // far from both clusters
        table.push_full(5.5, 90.5, None, "Actb", Some("run1"), 1.0);
        table
    }

    fn params() -> SegmentationParams {
        SegmentationParams {
            nx: 100,
            ny: 100,
            extent: Some(Extent::new(0.0, 100.0, 0.0, 100.0)),
            threshold_offset: 0.1,
            watershed_tolerance: 2.0,
            min_region_size: 10,
            coordinate_scale: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_aggregate_two_cells() {
        let table = two_cell_table();
        let params = params();
        let seg = segment_spots(&table.spots, &params).unwrap();
        let (matrix, metadata) = aggregate(&table, &seg, &params);

        assert_eq!(matrix.genes, vec!["Actb", "Gad1", "Slc17a7", "Sst"]);
        assert_eq!(matrix.cells, seg.cell_ids());
        assert_eq!(matrix.ncells(), 2);
        assert_eq!(metadata.len(), 2);

        let assigned = seg.assignments.iter().filter(|&&c| c != 0).count();
        assert_eq!(matrix.total(), assigned as u64);

        let first = &metadata[0];
        let second = &metadata[1];
        let (inhib, excit) = if first.x < second.x {
            (first, second)
        } else {
            (second, first)
        };

        let col = matrix.cells.binary_search(&inhib.cell).unwrap();
        let count = |gene: &str| {
            let row = matrix.genes.iter().position(|g| g == gene).unwrap();
            matrix.counts[[row, col]]
        };
        assert_eq!(count("Sst"), 16);
        assert_eq!(count("Gad1"), 16);
        assert_eq!(count("Slc17a7"), 0);
        assert_eq!(inhib.population, 32);
        assert_eq!(inhib.ngenes, 2);
        assert_eq!(inhib.z, Some(6.0));
        assert_eq!(inhib.experiment, "run1");

        assert_eq!(excit.z, None);
        assert_eq!(excit.experiment, "run2");
        assert_eq!(excit.layer, 1);

        // the block spans [20, 24) on both axes, centroid 22 before scaling
        assert!((inhib.x - 44.0).abs() < 1.0);
        assert!((inhib.y - 44.0).abs() < 1.0);
        // area scales with the square of the coordinate scale
        let pixels = seg.cells.label_sizes()[inhib.cell as usize];
        assert!((inhib.area - pixels as f32 * 4.0).abs() < 1e-3);
    }

    #[test]
    fn test_empty_segmentation_gives_empty_matrix() {
        let mut table = SpotTable::new();
        table.push(10.0, 10.0, "A");
        let params = SegmentationParams {
            min_region_size: 10_000,
            ..params()
        };
        let seg = segment_spots(&table.spots, &params).unwrap();
        let (matrix, metadata) = aggregate(&table, &seg, &params);

        assert_eq!(matrix.ngenes(), 1);
        assert_eq!(matrix.ncells(), 0);
        assert_eq!(matrix.total(), 0);
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_modal_experiment_ties_by_name() {
        let names = vec!["b".to_string(), "a".to_string()];
        let counts: HashMap<u32, usize> = [(0, 3), (1, 3)].into_iter().collect();
        assert_eq!(modal_experiment(&counts, &names), Some("a".to_string()));
        let counts: HashMap<u32, usize> = [(0, 4), (1, 3)].into_iter().collect();
        assert_eq!(modal_experiment(&counts, &names), Some("b".to_string()));
    }
}
