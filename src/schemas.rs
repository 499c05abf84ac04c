// Output table schemas, shared by the writers in output.rs

use arrow::datatypes::{DataType, Field, Schema};
use clap::ValueEnum;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    Infer,
    Csv,
    CsvGz,
    Parquet,
}

pub fn large_utf8_if_parquet(fmt: OutputFormat) -> DataType {
    match fmt {
        OutputFormat::Parquet => DataType::LargeUtf8,
        _ => DataType::Utf8,
    }
}

// The z column is only present when some spot carries a depth.
pub fn spot_assignment_schema(fmt: OutputFormat, has_z: bool) -> Schema {
    let mut fields = vec![
        Field::new("x", DataType::Float32, false),
        Field::new("y", DataType::Float32, false),
    ];
    if has_z {
        fields.push(Field::new("z", DataType::Float32, true));
    }
    fields.extend([
        Field::new("gene", large_utf8_if_parquet(fmt), false),
        Field::new("experiment", large_utf8_if_parquet(fmt), true),
        Field::new("weight", DataType::Float32, false),
        Field::new("cell", DataType::UInt32, false),
    ]);
    Schema::new(fields)
}

// One row per gene, one count column per cell id.
pub fn expression_matrix_schema(fmt: OutputFormat, cells: &[u32]) -> Schema {
    let mut fields = vec![Field::new("gene", large_utf8_if_parquet(fmt), false)];
    fields.extend(
        cells
            .iter()
            .map(|cell| Field::new(cell.to_string(), DataType::UInt32, false)),
    );
    Schema::new(fields)
}

pub fn cell_metadata_schema(fmt: OutputFormat) -> Schema {
    Schema::new(vec![
        Field::new("cell", DataType::UInt32, false),
        Field::new("x", DataType::Float32, false),
        Field::new("y", DataType::Float32, false),
        Field::new("z", DataType::Float32, true),
        Field::new("area", DataType::Float32, false),
        Field::new("layer", DataType::UInt32, false),
        Field::new("experiment", large_utf8_if_parquet(fmt), false),
        Field::new("population", DataType::UInt64, false),
        Field::new("ngenes", DataType::UInt64, false),
    ])
}

// Alternatives past the number a cell actually has are null.
pub fn mapping_result_schema(fmt: OutputFormat, nalternatives: usize) -> Schema {
    let mut fields = vec![
        Field::new("cell", DataType::UInt32, false),
        Field::new("type", large_utf8_if_parquet(fmt), false),
        Field::new("score", DataType::Float32, false),
    ];
    for k in 1..=nalternatives {
        fields.push(Field::new(
            format!("alt_{}_type", k),
            large_utf8_if_parquet(fmt),
            true,
        ));
        fields.push(Field::new(format!("alt_{}_score", k), DataType::Float32, true));
    }
    Schema::new(fields)
}
