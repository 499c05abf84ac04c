use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing, unparseable, or non-finite spot/reference data.
    #[error("invalid input data ({stage}): {message}")]
    InputData { stage: &'static str, message: String },

    /// Parameter rejected before any processing.
    #[error("invalid configuration: {parameter} = {value} ({reason})")]
    Configuration {
        parameter: &'static str,
        value: String,
        reason: &'static str,
    },

    /// Query cell and reference atlas share too few genes to correlate.
    #[error("cell {cell}: {shared} gene(s) shared with the reference atlas, at least {required} required")]
    MappingGeneMismatch {
        cell: u32,
        shared: usize,
        required: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn input(stage: &'static str, message: impl Into<String>) -> Self {
        Error::InputData {
            stage,
            message: message.into(),
        }
    }

    pub(crate) fn config(
        parameter: &'static str,
        value: impl ToString,
        reason: &'static str,
    ) -> Self {
        Error::Configuration {
            parameter,
            value: value.to_string(),
            reason,
        }
    }
}
