use thiserror::Error;

/// Errors produced by the pipeline stages.
///
/// Loader and scaler/orderer stages fail fast and carry the offending
/// row/column so the caller can diagnose the input. Rendering never fails on
/// data range; out-of-domain values are clamped to the scale's endpoints.
#[derive(Error, Debug)]
pub enum HeatmapError {
    #[error("Failed to parse cell at row '{row}', column '{column}': '{value}' is not a number")]
    Parse {
        row: String,
        column: String,
        value: String,
    },
    #[error("Inconsistent row length at line {line}: expected {expected} data cells, found {found}")]
    Shape {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("Cannot cluster {axis}: need at least 2, found {found}")]
    DegenerateInput { axis: &'static str, found: usize },
    #[error("Non-finite value at row '{row}', column '{column}'")]
    Domain { row: String, column: String },
    #[error("Input file is empty or has no data rows")]
    Empty,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
