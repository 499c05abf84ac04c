use flate2::read::GzDecoder;
use log::{debug, info};
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};

use crate::error::{Error, Result};
use crate::params::Extent;

pub type GeneIndex = u32;

/// A single detected molecule.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Spot {
    pub x: f32,
    pub y: f32,
    pub z: Option<f32>,
    pub gene: GeneIndex,
    pub experiment: Option<u32>,
    pub weight: f32,
}

/// Spots with interned gene and experiment names.
#[derive(Clone, Debug, Default)]
pub struct SpotTable {
    pub gene_names: Vec<String>,
    pub experiment_names: Vec<String>,
    pub spots: Vec<Spot>,

    gene_name_map: HashMap<String, GeneIndex>,
    experiment_name_map: HashMap<String, u32>,
}

impl SpotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.spots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spots.is_empty()
    }

    pub fn ngenes(&self) -> usize {
        self.gene_names.len()
    }

    pub fn has_z(&self) -> bool {
        self.spots.iter().any(|spot| spot.z.is_some())
    }

    pub fn gene_index(&mut self, name: &str) -> GeneIndex {
        if let Some(gene) = self.gene_name_map.get(name) {
            return *gene;
        }
        let gene = self.gene_names.len() as GeneIndex;
        self.gene_names.push(name.to_string());
        self.gene_name_map.insert(name.to_string(), gene);
        gene
    }

    fn experiment_index(&mut self, name: &str) -> u32 {
        if let Some(experiment) = self.experiment_name_map.get(name) {
            return *experiment;
        }
        let experiment = self.experiment_names.len() as u32;
        self.experiment_names.push(name.to_string());
        self.experiment_name_map.insert(name.to_string(), experiment);
        experiment
    }

    /// Append a unit-weight 2D spot.
    pub fn push(&mut self, x: f32, y: f32, gene: &str) {
        self.push_full(x, y, None, gene, None, 1.0);
    }

    pub fn push_full(
        &mut self,
        x: f32,
        y: f32,
        z: Option<f32>,
        gene: &str,
        experiment: Option<&str>,
        weight: f32,
    ) {
        let gene = self.gene_index(gene);
        let experiment = experiment.map(|name| self.experiment_index(name));
        self.spots.push(Spot {
            x,
            y,
            z,
            gene,
            experiment,
            weight,
        });
    }
}

/// Column names used to pull spots out of a table.
#[derive(Clone, Debug)]
pub struct SpotColumns {
    pub gene: String,
    pub x: String,
    pub y: String,
    pub z: Option<String>,
    pub experiment: Option<String>,
    pub weight: Option<String>,
}

impl Default for SpotColumns {
    fn default() -> Self {
        SpotColumns {
            gene: String::from("gene"),
            x: String::from("x"),
            y: String::from("y"),
            z: None,
            experiment: None,
            weight: None,
        }
    }
}

pub(crate) fn open_maybe_gzipped(path: &str) -> Result<Box<dyn Read>> {
    let file = File::open(path)?;
    if path.ends_with(".gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

pub(crate) fn find_column(
    headers: &csv::StringRecord,
    column: &str,
    stage: &'static str,
) -> Result<usize> {
    headers
        .iter()
        .position(|x| x == column)
        .ok_or_else(|| Error::input(stage, format!("column '{}' not found", column)))
}

fn parse_f32(value: &str, column: &str, row: usize) -> Result<f32> {
    match value.trim().parse::<f32>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(Error::input(
            "read spots",
            format!(
                "row {}: column '{}' has non-numeric or non-finite value '{}'",
                row, column, value
            ),
        )),
    }
}

/// Read a spot table from a (possibly gzipped) CSV file.
pub fn read_spots_csv(
    path: &str,
    columns: &SpotColumns,
    excluded_genes: &Option<Regex>,
) -> Result<SpotTable> {
    let mut rdr = csv::Reader::from_reader(open_maybe_gzipped(path)?);
    read_spots_from_reader(&mut rdr, columns, excluded_genes)
}

pub fn read_spots_from_reader<T>(
    rdr: &mut csv::Reader<T>,
    columns: &SpotColumns,
    excluded_genes: &Option<Regex>,
) -> Result<SpotTable>
where
    T: std::io::Read,
{
    let headers = rdr.headers()?.clone();
    let gene_col = find_column(&headers, &columns.gene, "read spots")?;
    let x_col = find_column(&headers, &columns.x, "read spots")?;
    let y_col = find_column(&headers, &columns.y, "read spots")?;
    let z_col = match &columns.z {
        Some(z) => Some(find_column(&headers, z, "read spots")?),
        None => None,
    };
    let experiment_col = match &columns.experiment {
        Some(experiment) => Some(find_column(&headers, experiment, "read spots")?),
        None => None,
    };
    let weight_col = match &columns.weight {
        Some(weight) => Some(find_column(&headers, weight, "read spots")?),
        None => None,
    };

    let mut table = SpotTable::new();
    let mut nexcluded = 0;

    for (i, result) in rdr.records().enumerate() {
        let row = result?;
        // 1-based, counting the header line
        let rownum = i + 2;

        let gene = &row[gene_col];
        if let Some(excluded_genes) = excluded_genes {
            if excluded_genes.is_match(gene) {
                nexcluded += 1;
                continue;
            }
        }

        let x = parse_f32(&row[x_col], &columns.x, rownum)?;
        let y = parse_f32(&row[y_col], &columns.y, rownum)?;
        let z = match (z_col, &columns.z) {
            (Some(z_col), Some(name)) => Some(parse_f32(&row[z_col], name, rownum)?),
            _ => None,
        };
        let weight = match (weight_col, &columns.weight) {
            (Some(weight_col), Some(name)) => parse_f32(&row[weight_col], name, rownum)?,
            _ => 1.0,
        };
        let experiment = experiment_col.map(|col| &row[col]);

        table.push_full(x, y, z, gene, experiment, weight);
    }

    if nexcluded > 0 {
        debug!("Excluded {} spots by gene name", nexcluded);
    }
    info!(
        "Read {} spots across {} genes",
        table.len(),
        table.ngenes()
    );

    Ok(table)
}

/// Bounding box of the spot coordinates, or None for an empty table.
pub fn coordinate_span(spots: &[Spot]) -> Option<Extent> {
    if spots.is_empty() {
        return None;
    }

    let mut min_x = f32::MAX;
    let mut max_x = f32::MIN;
    let mut min_y = f32::MAX;
    let mut max_y = f32::MIN;

    for s in spots {
        min_x = min_x.min(s.x);
        max_x = max_x.max(s.x);
        min_y = min_y.min(s.y);
        max_y = max_y.max(s.y);
    }

    Some(Extent::new(min_x, max_x, min_y, max_y))
}
