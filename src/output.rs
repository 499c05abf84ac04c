use arrow::array::{
    ArrayRef, Float32Array, LargeStringArray, RecordBatch, StringArray, UInt32Array, UInt64Array,
};
use arrow::csv;
use arrow::datatypes::Schema;
use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::Itertools;
use json::JsonValue;
use log::info;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression::ZSTD, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use crate::aggregate::{CellMetadata, ExpressionMatrix};
use crate::error::{Error, Result};
use crate::params::SegmentationParams;
use crate::reference::MappingResult;
use crate::schemas::*;
use crate::segment::labeler::Label;
use crate::segment::SegmentationReport;
use crate::spots::SpotTable;

/// Resolve the format of an output file, inferring it from the extension
/// unless one is given.
pub fn determine_format(filename: &str, fmt: OutputFormat) -> Result<OutputFormat> {
    if fmt != OutputFormat::Infer {
        return Ok(fmt);
    }

    if filename.ends_with(".csv.gz") {
        Ok(OutputFormat::CsvGz)
    } else if filename.ends_with(".csv") {
        Ok(OutputFormat::Csv)
    } else if filename.ends_with(".parquet") {
        Ok(OutputFormat::Parquet)
    } else {
        Err(Error::config(
            "output format",
            filename,
            "cannot infer format from extension (expected .csv, .csv.gz or .parquet)",
        ))
    }
}

pub fn write_table(filename: &str, fmt: OutputFormat, batch: RecordBatch) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;
    let file = File::create(filename)?;

    match fmt {
        OutputFormat::Csv => {
            write_table_csv(file, &batch)?;
        }
        OutputFormat::CsvGz => {
            let encoder = GzEncoder::new(file, Compression::default());
            write_table_csv(encoder, &batch)?.finish()?;
        }
        OutputFormat::Parquet => {
            write_table_parquet(file, &batch)?;
        }
        OutputFormat::Infer => unreachable!(),
    }

    info!("Wrote {} rows to {}", batch.num_rows(), filename);
    Ok(())
}

fn write_table_csv<W: Write>(output: W, batch: &RecordBatch) -> Result<W> {
    let mut writer = csv::WriterBuilder::new().with_header(true).build(output);
    writer.write(batch)?;
    Ok(writer.into_inner())
}

fn write_table_parquet<W: Write + Send>(output: W, batch: &RecordBatch) -> Result<()> {
    let props = WriterProperties::builder()
        .set_compression(ZSTD(ZstdLevel::try_new(3)?))
        .build();
    let mut writer = ArrowWriter::try_new(output, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn string_array<'a, I>(fmt: OutputFormat, values: I) -> ArrayRef
where
    I: Iterator<Item = Option<&'a str>>,
{
    match fmt {
        OutputFormat::Parquet => Arc::new(values.collect::<LargeStringArray>()),
        _ => Arc::new(values.collect::<StringArray>()),
    }
}

fn batch(schema: Schema, columns: Vec<ArrayRef>) -> Result<RecordBatch> {
    Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
}

/// Every input spot with the id of the cell it was assigned to (0 for none).
pub fn write_spot_assignments(
    filename: &str,
    fmt: OutputFormat,
    table: &SpotTable,
    assignments: &[Label],
) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;
    let spots = &table.spots;
    let has_z = table.has_z();

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(spots.iter().map(|s| s.x).collect::<Float32Array>()),
        Arc::new(spots.iter().map(|s| s.y).collect::<Float32Array>()),
    ];
    if has_z {
        columns.push(Arc::new(spots.iter().map(|s| s.z).collect::<Float32Array>()));
    }
    let rest: [ArrayRef; 4] = [
        string_array(
            fmt,
            spots
                .iter()
                .map(|s| Some(table.gene_names[s.gene as usize].as_str())),
        ),
        string_array(
            fmt,
            spots.iter().map(|s| {
                s.experiment
                    .map(|e| table.experiment_names[e as usize].as_str())
            }),
        ),
        Arc::new(spots.iter().map(|s| s.weight).collect::<Float32Array>()),
        Arc::new(assignments.iter().cloned().collect::<UInt32Array>()),
    ];
    columns.extend(rest);

    write_table(
        filename,
        fmt,
        batch(spot_assignment_schema(fmt, has_z), columns)?,
    )
}

pub fn write_expression_matrix(
    filename: &str,
    fmt: OutputFormat,
    matrix: &ExpressionMatrix,
) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(matrix.ncells() + 1);
    columns.push(string_array(
        fmt,
        matrix.genes.iter().map(|g| Some(g.as_str())),
    ));
    for column in matrix.counts.columns() {
        columns.push(Arc::new(column.iter().cloned().collect::<UInt32Array>()));
    }

    write_table(
        filename,
        fmt,
        batch(expression_matrix_schema(fmt, &matrix.cells), columns)?,
    )
}

pub fn write_cell_metadata(
    filename: &str,
    fmt: OutputFormat,
    metadata: &[CellMetadata],
) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;

    let columns: Vec<ArrayRef> = vec![
        Arc::new(metadata.iter().map(|m| m.cell).collect::<UInt32Array>()),
        Arc::new(metadata.iter().map(|m| m.x).collect::<Float32Array>()),
        Arc::new(metadata.iter().map(|m| m.y).collect::<Float32Array>()),
        Arc::new(metadata.iter().map(|m| m.z).collect::<Float32Array>()),
        Arc::new(metadata.iter().map(|m| m.area).collect::<Float32Array>()),
        Arc::new(metadata.iter().map(|m| m.layer).collect::<UInt32Array>()),
        string_array(fmt, metadata.iter().map(|m| Some(m.experiment.as_str()))),
        Arc::new(
            metadata
                .iter()
                .map(|m| m.population as u64)
                .collect::<UInt64Array>(),
        ),
        Arc::new(
            metadata
                .iter()
                .map(|m| m.ngenes as u64)
                .collect::<UInt64Array>(),
        ),
    ];

    write_table(filename, fmt, batch(cell_metadata_schema(fmt), columns)?)
}

pub fn write_mapping_results(
    filename: &str,
    fmt: OutputFormat,
    results: &[MappingResult],
    nalternatives: usize,
) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(results.iter().map(|r| r.cell).collect::<UInt32Array>()),
        string_array(fmt, results.iter().map(|r| Some(r.best_type.as_str()))),
        Arc::new(results.iter().map(|r| r.score).collect::<Float32Array>()),
    ];
    for k in 0..nalternatives {
        columns.push(string_array(
            fmt,
            results
                .iter()
                .map(|r| r.alternatives.get(k).map(|(t, _)| t.as_str())),
        ));
        columns.push(Arc::new(
            results
                .iter()
                .map(|r| r.alternatives.get(k).map(|(_, s)| *s))
                .collect::<Float32Array>(),
        ));
    }

    write_table(
        filename,
        fmt,
        batch(mapping_result_schema(fmt, nalternatives), columns)?,
    )
}

// Per-type cell counts, ordered by type name.
fn type_counts(results: &[MappingResult]) -> JsonValue {
    let mut counts = JsonValue::new_object();
    for (name, n) in results
        .iter()
        .map(|r| r.best_type.as_str())
        .counts()
        .into_iter()
        .sorted()
    {
        counts[name] = n.into();
    }
    counts
}

/// Build the JSON summary of a run: parameters, segmentation counts and,
/// when mapping ran, the number of cells given each type.
pub fn run_summary(
    params: &SegmentationParams,
    report: &SegmentationReport,
    results: Option<&[MappingResult]>,
) -> JsonValue {
    let mut parameters = JsonValue::new_object();
    parameters["nx"] = params.nx.into();
    parameters["ny"] = params.ny.into();
    parameters["min_pixel_size"] = params.min_pixel_size.into();
    parameters["sigma"] = params.σ.into();
    parameters["threshold_radius"] = params.threshold_radius.into();
    parameters["threshold_offset"] = params.threshold_offset.into();
    parameters["labeler"] = format!("{:?}", params.labeler).to_lowercase().into();
    parameters["watershed_tolerance"] = params.watershed_tolerance.into();
    parameters["watershed_ext"] = params.watershed_ext.into();
    parameters["min_region_size"] = params.min_region_size.into();
    parameters["coordinate_scale"] = params.coordinate_scale.into();
    if let Some(max_value) = params.max_value {
        parameters["max_value"] = max_value.into();
    }

    let mut segmentation = JsonValue::new_object();
    segmentation["nspots"] = report.nspots.into();
    segmentation["nout_of_bounds"] = report.nout_of_bounds.into();
    segmentation["nforeground_pixels"] = report.nforeground_pixels.into();
    segmentation["nregions_labeled"] = report.nregions_labeled.into();
    segmentation["nregions_removed"] = report.nregions_removed.into();
    segmentation["nfilled_pixels"] = report.nfilled_pixels.into();
    segmentation["ncells"] = report.ncells.into();
    segmentation["nunassigned_spots"] = report.nunassigned_spots.into();
    segmentation["degenerate"] = report.degenerate.into();

    let mut summary = JsonValue::new_object();
    summary["parameters"] = parameters;
    summary["segmentation"] = segmentation;
    if let Some(results) = results {
        let mut mapping = JsonValue::new_object();
        mapping["ncells"] = results.len().into();
        mapping["types"] = type_counts(results);
        summary["mapping"] = mapping;
    }
    summary
}

pub fn write_run_summary(filename: &str, summary: &JsonValue) -> Result<()> {
    let mut file = File::create(filename)?;
    summary.write_pretty(&mut file, 2)?;
    writeln!(file)?;
    info!("Wrote run summary to {}", filename);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use flate2::read::GzDecoder;
    use ndarray::array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::io::Read;
    use tempfile::tempdir;

    fn mapping_results() -> Vec<MappingResult> {
        vec![
            MappingResult {
                cell: 1,
                best_type: "Excitatory".to_string(),
                score: 0.9,
                alternatives: vec![("Inhibitory".to_string(), 0.1)],
            },
            MappingResult {
                cell: 3,
                best_type: "Inhibitory".to_string(),
                score: 0.8,
                alternatives: vec![],
            },
            MappingResult {
                cell: 4,
                best_type: "Excitatory".to_string(),
                score: 0.7,
                alternatives: vec![],
            },
        ]
    }

    #[test]
    fn test_determine_format() {
        assert_eq!(
            determine_format("cells.csv.gz", OutputFormat::Infer).unwrap(),
            OutputFormat::CsvGz
        );
        assert_eq!(
            determine_format("cells.csv", OutputFormat::Infer).unwrap(),
            OutputFormat::Csv
        );
        assert_eq!(
            determine_format("cells.parquet", OutputFormat::Infer).unwrap(),
            OutputFormat::Parquet
        );
        assert_eq!(
            determine_format("cells.txt", OutputFormat::Csv).unwrap(),
            OutputFormat::Csv
        );
        assert!(matches!(
            determine_format("cells.txt", OutputFormat::Infer),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_write_expression_matrix_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counts.csv");
        let path = path.to_str().unwrap();
        let matrix = ExpressionMatrix {
            genes: vec!["Gad1".to_string(), "Sst".to_string()],
            cells: vec![2, 7],
            counts: array![[3, 0], [1, 5]],
        };
        write_expression_matrix(path, OutputFormat::Infer, &matrix).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["gene,2,7", "Gad1,3,0", "Sst,1,5"]);
    }

    #[test]
    fn test_write_mapping_results_csv_gz() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("types.csv.gz");
        let path = path.to_str().unwrap();
        write_mapping_results(path, OutputFormat::Infer, &mapping_results(), 1).unwrap();

        let mut content = String::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "cell,type,score,alt_1_type,alt_1_score");
        assert_eq!(lines[1], "1,Excitatory,0.9,Inhibitory,0.1");
        assert_eq!(lines[2], "3,Inhibitory,0.8,,");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_write_cell_metadata_parquet() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cells.parquet");
        let path = path.to_str().unwrap();
        let metadata = vec![CellMetadata {
            cell: 5,
            x: 1.5,
            y: 2.5,
            z: None,
            area: 12.0,
            layer: 1,
            experiment: "run1".to_string(),
            population: 30,
            ngenes: 4,
        }];
        write_cell_metadata(path, OutputFormat::Infer, &metadata).unwrap();

        let rdr = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = rdr.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.num_columns(), 9);
        let z = batch.column_by_name("z").unwrap();
        assert!(z.is_null(0));
        let cell = batch
            .column_by_name("cell")
            .unwrap()
            .as_any()
            .downcast_ref::<UInt32Array>()
            .unwrap();
        assert_eq!(cell.value(0), 5);
    }

    #[test]
    fn test_write_spot_assignments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spots.csv");
        let path = path.to_str().unwrap();
        let mut table = SpotTable::new();
        table.push_full(1.0, 2.0, Some(3.0), "Gad1", Some("run1"), 1.0);
        table.push(4.0, 5.0, "Sst");
        write_spot_assignments(path, OutputFormat::Infer, &table, &[6, 0]).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "x,y,z,gene,experiment,weight,cell");
        assert_eq!(lines[1], "1.0,2.0,3.0,Gad1,run1,1.0,6");
        assert_eq!(lines[2], "4.0,5.0,,Sst,,1.0,0");

        // no depth anywhere: the z column is left out
        let mut flat = SpotTable::new();
        flat.push(4.0, 5.0, "Sst");
        write_spot_assignments(path, OutputFormat::Csv, &flat, &[2]).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "x,y,gene,experiment,weight,cell");
        assert_eq!(lines[1], "4.0,5.0,Sst,,1.0,2");
    }

    #[test]
    fn test_run_summary() {
        let report = SegmentationReport {
            nspots: 10,
            ncells: 2,
            ..Default::default()
        };
        let results = mapping_results();
        let summary = run_summary(&SegmentationParams::default(), &report, Some(&results));

        assert_eq!(summary["segmentation"]["nspots"].as_usize(), Some(10));
        assert_eq!(summary["segmentation"]["degenerate"].as_bool(), Some(false));
        assert_eq!(summary["parameters"]["labeler"].as_str(), Some("watershed"));
        assert_eq!(summary["parameters"]["min_pixel_size"].as_f32(), Some(1.0));
        assert_eq!(summary["mapping"]["types"]["Excitatory"].as_usize(), Some(2));
        assert_eq!(summary["mapping"]["types"]["Inhibitory"].as_usize(), Some(1));

        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let path = path.to_str().unwrap();
        write_run_summary(path, &summary).unwrap();
        let parsed = json::parse(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed["segmentation"]["ncells"].as_usize(), Some(2));
        assert_eq!(parsed["mapping"]["ncells"].as_usize(), Some(3));
    }
}
