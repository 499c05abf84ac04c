use indicatif::ProgressBar;
use log::{info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

use crate::aggregate::ExpressionMatrix;
use crate::error::{Error, Result};
use crate::params::{MappingParams, QueryScaling};
use crate::segment::labeler::Label;
use crate::spots::open_maybe_gzipped;

/// Correlation needs at least this many genes in common.
pub const MIN_SHARED_GENES: usize = 2;

/// Mean expression of each reference cell type over a gene panel.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceAtlas {
    pub genes: Vec<String>,
    pub types: Vec<String>,

    // genes x types
    pub profiles: Array2<f32>,
}

impl ReferenceAtlas {
    pub fn new(genes: Vec<String>, types: Vec<String>, profiles: Array2<f32>) -> Result<Self> {
        if profiles.dim() != (genes.len(), types.len()) {
            return Err(Error::input(
                "reference atlas",
                format!(
                    "profile matrix is {:?} but there are {} genes and {} types",
                    profiles.dim(),
                    genes.len(),
                    types.len()
                ),
            ));
        }
        if types.is_empty() {
            return Err(Error::input("reference atlas", "no cell types"));
        }
        check_unique(&genes, "gene")?;
        check_unique(&types, "cell type")?;
        if profiles.iter().any(|v| !v.is_finite()) {
            return Err(Error::input(
                "reference atlas",
                "profile matrix has non-finite values",
            ));
        }

        Ok(ReferenceAtlas {
            genes,
            types,
            profiles,
        })
    }

    pub fn ngenes(&self) -> usize {
        self.genes.len()
    }

    pub fn ntypes(&self) -> usize {
        self.types.len()
    }
}

fn check_unique(names: &[String], what: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(Error::input(
                "reference atlas",
                format!("duplicate {} '{}'", what, name),
            ));
        }
    }
    Ok(())
}

/// Read an atlas from a (possibly gzipped) CSV: a gene column followed by one
/// column of mean expression per cell type.
pub fn read_reference_csv(path: &str) -> Result<ReferenceAtlas> {
    let mut rdr = csv::Reader::from_reader(open_maybe_gzipped(path)?);
    read_reference_from_reader(&mut rdr)
}

pub fn read_reference_from_reader<T>(rdr: &mut csv::Reader<T>) -> Result<ReferenceAtlas>
where
    T: std::io::Read,
{
    let headers = rdr.headers()?.clone();
    if headers.len() < 2 {
        return Err(Error::input(
            "reference atlas",
            "expected a gene column and at least one cell type column",
        ));
    }
    let types: Vec<String> = headers.iter().skip(1).map(String::from).collect();
    let ntypes = types.len();

    let mut genes = Vec::new();
    let mut values = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let row = result?;
        let rownum = i + 2;
        genes.push(row[0].to_string());
        for (t, value) in row.iter().skip(1).enumerate() {
            let v = value.trim().parse::<f32>().map_err(|_| {
                Error::input(
                    "reference atlas",
                    format!(
                        "row {}: column '{}' has non-numeric value '{}'",
                        rownum, types[t], value
                    ),
                )
            })?;
            values.push(v);
        }
    }

    let profiles = Array2::from_shape_vec((genes.len(), ntypes), values)
        .map_err(|err| Error::input("reference atlas", err.to_string()))?;
    let atlas = ReferenceAtlas::new(genes, types, profiles)?;
    info!(
        "Read reference atlas with {} genes and {} cell types",
        atlas.ngenes(),
        atlas.ntypes()
    );
    Ok(atlas)
}

/// Pearson correlation. Zero variance on either side gives 0.
pub fn pearson(xs: &[f32], ys: &[f32]) -> f32 {
    assert_eq!(xs.len(), ys.len());
    let n = xs.len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mean_x = xs.iter().map(|&x| x as f64).sum::<f64>() / n;
    let mean_y = ys.iter().map(|&y| y as f64).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        let dx = x as f64 - mean_x;
        let dy = y as f64 - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denom = (var_x * var_y).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (cov / denom).clamp(-1.0, 1.0) as f32
}

#[derive(Clone, Debug, PartialEq)]
pub struct MappingResult {
    pub cell: Label,
    pub best_type: String,
    pub score: f32,

    // next best types by descending score
    pub alternatives: Vec<(String, f32)>,
}

pub struct ReferenceMapper {
    atlas: ReferenceAtlas,
    params: MappingParams,
    gene_index: HashMap<String, usize>,
}

// Genes present in both a query and the atlas, as paired row indices.
struct SharedPanel {
    query_rows: Vec<usize>,
    atlas_rows: Vec<usize>,
}

impl ReferenceMapper {
    pub fn new(atlas: ReferenceAtlas, params: MappingParams) -> Self {
        let gene_index = atlas
            .genes
            .iter()
            .enumerate()
            .map(|(i, gene)| (gene.clone(), i))
            .collect();
        ReferenceMapper {
            atlas,
            params,
            gene_index,
        }
    }

    fn shared_panel(&self, genes: &[String]) -> SharedPanel {
        let mut query_rows = Vec::new();
        let mut atlas_rows = Vec::new();
        for (q, gene) in genes.iter().enumerate() {
            if let Some(&r) = self.gene_index.get(gene) {
                query_rows.push(q);
                atlas_rows.push(r);
            }
        }
        SharedPanel {
            query_rows,
            atlas_rows,
        }
    }

    // Mean over atlas types of each type's total over the shared genes.
    fn atlas_total(&self, panel: &SharedPanel) -> f32 {
        let ntypes = self.atlas.ntypes();
        let total: f64 = panel
            .atlas_rows
            .iter()
            .map(|&r| self.atlas.profiles.row(r).iter().map(|&v| v as f64).sum::<f64>())
            .sum();
        (total / ntypes.max(1) as f64) as f32
    }

    /// Bring one cell's shared-gene counts onto the atlas's dynamic range.
    /// Library-size scaling multiplies by a single per-cell factor, so the
    /// cell's relative profile, and its correlations, are unchanged. A cell
    /// with no counts is left as is.
    fn scale_query(&self, query: &mut [f32], atlas_total: f32) {
        match self.params.scaling {
            QueryScaling::None => {}
            QueryScaling::LibrarySize => {
                let total: f32 = query.iter().sum();
                if total > 0.0 {
                    let factor = atlas_total / total;
                    query.iter_mut().for_each(|v| *v *= factor);
                }
            }
        }
    }

    fn rank(&self, cell: Label, query: &[f32], atlas_rows: &[usize]) -> MappingResult {
        let mut profile = vec![0.0f32; atlas_rows.len()];
        let mut scores: Vec<(usize, f32)> = (0..self.atlas.ntypes())
            .map(|t| {
                for (p, &r) in profile.iter_mut().zip(atlas_rows) {
                    *p = self.atlas.profiles[[r, t]];
                }
                (t, pearson(query, &profile))
            })
            .collect();

        // stable, so equal scores keep the lower type index first
        scores.sort_by(|a, b| b.1.total_cmp(&a.1));

        let (best, score) = scores[0];
        MappingResult {
            cell,
            best_type: self.atlas.types[best].clone(),
            score,
            alternatives: scores
                .iter()
                .skip(1)
                .take(self.params.nalternatives)
                .map(|&(t, s)| (self.atlas.types[t].clone(), s))
                .collect(),
        }
    }

    /// Scale one cell's expression (over `genes`) and correlate it against
    /// every atlas type.
    pub fn map_cell(&self, cell: Label, genes: &[String], expression: &[f32]) -> Result<MappingResult> {
        if genes.len() != expression.len() {
            return Err(Error::input(
                "reference mapping",
                format!(
                    "cell {}: {} genes but {} expression values",
                    cell,
                    genes.len(),
                    expression.len()
                ),
            ));
        }
        let panel = self.shared_panel(genes);
        if panel.query_rows.len() < MIN_SHARED_GENES {
            return Err(Error::MappingGeneMismatch {
                cell,
                shared: panel.query_rows.len(),
                required: MIN_SHARED_GENES,
            });
        }
        let mut query: Vec<f32> = panel.query_rows.iter().map(|&q| expression[q]).collect();
        self.scale_query(&mut query, self.atlas_total(&panel));
        Ok(self.rank(cell, &query, &panel.atlas_rows))
    }

    /// Scale and map every cell of an expression matrix, in parallel.
    pub fn map_matrix(
        &self,
        matrix: &ExpressionMatrix,
        progress: Option<&ProgressBar>,
    ) -> Result<Vec<MappingResult>> {
        let panel = self.shared_panel(&matrix.genes);
        let nshared = panel.query_rows.len();
        if nshared < MIN_SHARED_GENES {
            return match matrix.cells.first() {
                Some(&cell) => Err(Error::MappingGeneMismatch {
                    cell,
                    shared: nshared,
                    required: MIN_SHARED_GENES,
                }),
                None => Ok(Vec::new()),
            };
        }
        if nshared < matrix.ngenes() {
            warn!(
                "{} of {} query genes are absent from the reference atlas",
                matrix.ngenes() - nshared,
                matrix.ngenes()
            );
        }
        info!(
            "Mapping {} cells against {} reference types over {} shared genes",
            matrix.ncells(),
            self.atlas.ntypes(),
            nshared
        );

        let atlas_total = self.atlas_total(&panel);

        let results: Vec<MappingResult> = (0..matrix.ncells())
            .into_par_iter()
            .map(|col| {
                let column = matrix.counts.column(col);
                let mut query: Vec<f32> =
                    panel.query_rows.iter().map(|&q| column[q] as f32).collect();
                self.scale_query(&mut query, atlas_total);
                let result = self.rank(matrix.cells[col], &query, &panel.atlas_rows);
                if let Some(progress) = progress {
                    progress.inc(1);
                }
                result
            })
            .collect();

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    fn names(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|x| x.to_string()).collect()
    }

    fn atlas() -> ReferenceAtlas {
        ReferenceAtlas::new(
            names(&["Gad1", "Slc17a7", "Snap25", "Sst"]),
            names(&["Inhibitory", "Excitatory", "Glia"]),
            array![
                [9.0, 0.5, 0.1],
                [0.2, 8.0, 0.1],
                [5.0, 6.0, 0.3],
                [4.0, 0.1, 0.2],
            ],
        )
        .unwrap()
    }

    fn unscaled() -> MappingParams {
        MappingParams {
            scaling: QueryScaling::None,
            nalternatives: 5,
        }
    }

    #[test]
    fn test_pearson_basics() {
        assert!((pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]) - 1.0).abs() < 1e-6);
        assert!((pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]) + 1.0).abs() < 1e-6);
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(pearson(&[], &[]), 0.0);
    }

    #[test]
    fn test_self_match_is_selected() {
        let mapper = ReferenceMapper::new(atlas(), unscaled());
        let genes = names(&["Gad1", "Slc17a7", "Snap25", "Sst"]);
        // excitatory profile, times ten
        let expression = [5.0, 80.0, 60.0, 1.0];
        let result = mapper.map_cell(7, &genes, &expression).unwrap();

        assert_eq!(result.cell, 7);
        assert_eq!(result.best_type, "Excitatory");
        assert!((result.score - 1.0).abs() < 1e-5);
        assert_eq!(result.alternatives.len(), 2);
        assert!(result.alternatives[0].1 >= result.alternatives[1].1);
    }

    #[test]
    fn test_no_shared_genes_fails() {
        let mapper = ReferenceMapper::new(atlas(), unscaled());
        let genes = names(&["Pvalb", "Vip"]);
        match mapper.map_cell(3, &genes, &[1.0, 2.0]) {
            Err(Error::MappingGeneMismatch { cell, shared, .. }) => {
                assert_eq!(cell, 3);
                assert_eq!(shared, 0);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // a single shared gene cannot be correlated either
        let genes = names(&["Gad1", "Vip"]);
        assert!(matches!(
            mapper.map_cell(3, &genes, &[1.0, 2.0]),
            Err(Error::MappingGeneMismatch { shared: 1, .. })
        ));
    }

    #[test]
    fn test_ties_go_to_lowest_type_index() {
        let atlas = ReferenceAtlas::new(
            names(&["a", "b", "c"]),
            names(&["first", "second", "third"]),
            array![[1.0, 1.0, 3.0], [2.0, 2.0, 2.0], [3.0, 3.0, 1.0]],
        )
        .unwrap();
        let mapper = ReferenceMapper::new(atlas, unscaled());
        let result = mapper
            .map_cell(1, &names(&["a", "b", "c"]), &[1.0, 2.0, 3.0])
            .unwrap();
        assert_eq!(result.best_type, "first");
        assert_eq!(result.alternatives[0].0, "second");
        assert_eq!(result.alternatives[1].0, "third");
    }

    #[test]
    fn test_map_matrix() {
        let matrix = ExpressionMatrix {
            genes: names(&["Gad1", "Slc17a7", "Snap25", "Sst", "Xist"]),
            cells: vec![2, 5],
            counts: array![[18, 0], [0, 16], [10, 12], [8, 0], [3, 3]],
        };
        let params = MappingParams {
            nalternatives: 1,
            ..unscaled()
        };
        let mapper = ReferenceMapper::new(atlas(), params);
        let progress = ProgressBar::hidden();
        let results = mapper.map_matrix(&matrix, Some(&progress)).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].cell, 2);
        assert_eq!(results[0].best_type, "Inhibitory");
        assert_eq!(results[1].cell, 5);
        assert_eq!(results[1].best_type, "Excitatory");
        assert_eq!(results[0].alternatives.len(), 1);
        assert_eq!(progress.position(), 2);
    }

    #[test]
    fn test_library_size_scaling() {
        let mapper = ReferenceMapper::new(atlas(), MappingParams::default());
        let genes = names(&["Gad1", "Slc17a7", "Snap25", "Sst"]);
        let panel = mapper.shared_panel(&genes);

        // type totals 18.2, 14.6 and 0.7
        let atlas_total = mapper.atlas_total(&panel);
        assert!((atlas_total - 33.5 / 3.0).abs() < 1e-4);

        let mut query = [2.0, 0.0, 1.0, 1.0];
        mapper.scale_query(&mut query, atlas_total);
        assert!((query.iter().sum::<f32>() - atlas_total).abs() < 1e-4);
        assert!((query[0] - 2.0 * query[2]).abs() < 1e-5);
        assert_eq!(query[1], 0.0);

        let mut empty = [0.0; 4];
        mapper.scale_query(&mut empty, atlas_total);
        assert_eq!(empty, [0.0; 4]);
    }

    #[test]
    fn test_default_scaling_keeps_self_match() {
        let mapper = ReferenceMapper::new(atlas(), MappingParams::default());
        let genes = names(&["Gad1", "Slc17a7", "Snap25", "Sst"]);

        // inhibitory profile, times ten
        let result = mapper.map_cell(1, &genes, &[90.0, 2.0, 50.0, 40.0]).unwrap();
        assert_eq!(result.best_type, "Inhibitory");
        assert!((result.score - 1.0).abs() < 1e-5);

        let result = mapper.map_cell(2, &genes, &[5.0, 80.0, 60.0, 1.0]).unwrap();
        assert_eq!(result.best_type, "Excitatory");
        assert!((result.score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_default_scaling_map_matrix() {
        // one cell alone, then alongside cells of the other types
        let single = ExpressionMatrix {
            genes: names(&["Gad1", "Slc17a7", "Snap25", "Sst"]),
            cells: vec![1],
            counts: array![[90], [2], [50], [40]],
        };
        let mapper = ReferenceMapper::new(atlas(), MappingParams::default());
        let results = mapper.map_matrix(&single, None).unwrap();
        assert_eq!(results[0].best_type, "Inhibitory");
        assert!((results[0].score - 1.0).abs() < 1e-5);

        let mixed = ExpressionMatrix {
            genes: names(&["Gad1", "Slc17a7", "Snap25", "Sst"]),
            cells: vec![1, 2, 3],
            counts: array![[90, 5, 1], [2, 80, 1], [50, 60, 3], [40, 1, 2]],
        };
        let results = mapper.map_matrix(&mixed, None).unwrap();
        let types: Vec<&str> = results.iter().map(|r| r.best_type.as_str()).collect();
        assert_eq!(types, ["Inhibitory", "Excitatory", "Glia"]);
        for result in &results {
            assert!((result.score - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_matrix_without_shared_genes_fails() {
        let matrix = ExpressionMatrix {
            genes: names(&["Pvalb", "Vip"]),
            cells: vec![4],
            counts: array![[1], [2]],
        };
        let mapper = ReferenceMapper::new(atlas(), MappingParams::default());
        assert!(matches!(
            mapper.map_matrix(&matrix, None),
            Err(Error::MappingGeneMismatch { cell: 4, .. })
        ));
    }

    #[test]
    fn test_read_reference() {
        let data = "gene,Inhibitory,Excitatory\nGad1,9,0.5\nSlc17a7,0.2,8\n";
        let mut rdr = csv::Reader::from_reader(data.as_bytes());
        let atlas = read_reference_from_reader(&mut rdr).unwrap();
        assert_eq!(atlas.genes, names(&["Gad1", "Slc17a7"]));
        assert_eq!(atlas.types, names(&["Inhibitory", "Excitatory"]));
        assert_eq!(atlas.profiles[[1, 1]], 8.0);

        let data = "gene,A\nGad1,1\nGad1,2\n";
        let mut rdr = csv::Reader::from_reader(data.as_bytes());
        assert!(matches!(
            read_reference_from_reader(&mut rdr),
            Err(Error::InputData { .. })
        ));

        let data = "gene,A\nGad1,high\n";
        let mut rdr = csv::Reader::from_reader(data.as_bytes());
        assert!(matches!(
            read_reference_from_reader(&mut rdr),
            Err(Error::InputData { .. })
        ));
    }

    proptest! {
        #[test]
        fn test_scores_bounded(
            query in prop::collection::vec(0u32..50, 4),
            profiles in prop::collection::vec(0.0f32..20.0, 12),
        ) {
            let atlas = ReferenceAtlas::new(
                names(&["a", "b", "c", "d"]),
                names(&["x", "y", "z"]),
                Array2::from_shape_vec((4, 3), profiles).unwrap(),
            ).unwrap();
            let mapper = ReferenceMapper::new(atlas, unscaled());
            let expression: Vec<f32> = query.iter().map(|&c| c as f32).collect();
            let result = mapper.map_cell(1, &names(&["a", "b", "c", "d"]), &expression).unwrap();

            prop_assert!(result.score >= -1.0 && result.score <= 1.0);
            for (_, score) in &result.alternatives {
                prop_assert!(*score >= -1.0 && *score <= 1.0);
                prop_assert!(*score <= result.score);
            }
        }
    }
}
