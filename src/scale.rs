use crate::error::HeatmapError;
use crate::matrix::Matrix;
use clap::Args;
use std::error::Error;
use std::path::Path;
use std::time::Instant;

/// Row scaling applied before ordering and color mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingSpec {
    /// Pass the matrix through unchanged.
    None,
    /// Per-row z-score: replace each value x with (x - mean) / stddev,
    /// computed independently per row with the sample stddev (n-1 divisor).
    RowZScore,
}

impl std::str::FromStr for ScalingSpec {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(ScalingSpec::None),
            "row-zscore" | "row_zscore" | "zscore" => Ok(ScalingSpec::RowZScore),
            _ => Err(format!(
                "Unknown scaling method: {}. Supported: none, row-zscore",
                s
            )),
        }
    }
}

fn row_mean(row: &[f64]) -> f64 {
    row.iter().sum::<f64>() / row.len() as f64
}

/// Sample standard deviation (n-1 divisor). Returns 0.0 for rows of length 1,
/// where the sample stddev is undefined; callers treat that as constant.
fn row_sample_stddev(row: &[f64], mean: f64) -> f64 {
    if row.len() < 2 {
        return 0.0;
    }
    let ss: f64 = row.iter().map(|&x| (x - mean) * (x - mean)).sum();
    (ss / (row.len() - 1) as f64).sqrt()
}

/// Apply the scaling spec, producing a new matrix.
///
/// Pure: identical input always yields identical output. A zero-stddev
/// (constant) row scales to all zeros rather than NaN; that is deliberate
/// policy, not an error, so constant-valued rows stay renderable. A
/// non-finite input cell fails with `Domain` naming the offending cell.
pub fn scale(matrix: &Matrix, spec: ScalingSpec) -> Result<Matrix, HeatmapError> {
    match spec {
        ScalingSpec::None => Ok(matrix.clone()),
        ScalingSpec::RowZScore => {
            let mut values = Vec::with_capacity(matrix.n_rows());
            for (r, row) in matrix.values.iter().enumerate() {
                for (c, &x) in row.iter().enumerate() {
                    if !x.is_finite() {
                        return Err(HeatmapError::Domain {
                            row: matrix.row_labels[r].clone(),
                            column: matrix.col_labels[c].clone(),
                        });
                    }
                }
                let mean = row_mean(row);
                let sd = row_sample_stddev(row, mean);
                if sd == 0.0 {
                    values.push(vec![0.0; row.len()]);
                } else {
                    values.push(row.iter().map(|&x| (x - mean) / sd).collect());
                }
            }
            Ok(Matrix {
                row_labels: matrix.row_labels.clone(),
                col_labels: matrix.col_labels.clone(),
                values,
            })
        }
    }
}

#[derive(Args, Debug)]
pub struct ScaleArgs {
    /// Input delimited matrix file (header row + row-label column)
    #[arg(short = 'i', long = "input")]
    pub input: String,
    /// Output CSV file
    #[arg(short = 'o', long = "output")]
    pub output: String,
    /// Scaling method: none, row-zscore
    #[arg(short = 'm', long = "scaling", default_value = "row-zscore")]
    pub scaling: String,
    /// Log file path
    #[arg(long = "log")]
    pub log: Option<String>,
}

fn validate_scale_args(args: &ScaleArgs) -> Result<(), Box<dyn Error>> {
    if args.input.trim().is_empty() {
        return Err("Error: Input file path cannot be empty".into());
    }
    if !Path::new(&args.input).exists() {
        return Err(format!("Error: Input file does not exist: {}", args.input).into());
    }
    if args.output.trim().is_empty() {
        return Err("Error: Output file path cannot be empty".into());
    }
    args.scaling.parse::<ScalingSpec>()?;
    Ok(())
}

/// `scale` subcommand: load a matrix, apply row scaling, write it back as CSV.
pub fn scale_csv(args: &ScaleArgs, logger: &mut crate::Logger) -> Result<(), Box<dyn Error>> {
    validate_scale_args(args)?;

    let start_time = Instant::now();
    let spec: ScalingSpec = args.scaling.parse()?;

    logger.log("=== ExprHeat Scale Function Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!(
        "Runtime: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    ))?;
    logger.log(&format!("Input File: {}", args.input))?;
    logger.log(&format!("Output File: {}", args.output))?;
    logger.log(&format!("Scaling Method: {:?}", spec))?;

    let matrix = Matrix::from_delimited(&args.input)?;
    logger.log(&format!(
        "Loaded matrix: {} rows x {} columns",
        matrix.n_rows(),
        matrix.n_cols()
    ))?;

    let scaled = scale(&matrix, spec)?;
    scaled.write_csv(&args.output)?;

    logger.log(&format!("Scaled matrix written to {}", args.output))?;
    println!("[Output] Scaled matrix: {}", args.output);
    println!("{}", crate::progress::format_time_used(start_time.elapsed()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_of(rows: Vec<Vec<f64>>) -> Matrix {
        let n_cols = rows[0].len();
        Matrix {
            row_labels: (0..rows.len()).map(|i| format!("r{}", i)).collect(),
            col_labels: (0..n_cols).map(|i| format!("c{}", i)).collect(),
            values: rows,
        }
    }

    #[test]
    fn none_is_identity() {
        let m = matrix_of(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let out = scale(&m, ScalingSpec::None).unwrap();
        assert_eq!(out, m);
    }

    #[test]
    fn zscore_row_has_mean_zero_stddev_one() {
        let m = matrix_of(vec![vec![1.0, 2.0, 3.0, 4.0, 5.0]]);
        let out = scale(&m, ScalingSpec::RowZScore).unwrap();
        let row = &out.values[0];
        let mean = row_mean(row);
        let sd = row_sample_stddev(row, mean);
        assert!(mean.abs() < 1e-12, "mean was {}", mean);
        assert!((sd - 1.0).abs() < 1e-12, "stddev was {}", sd);
        // mean 3, sample stddev sqrt(2.5) ≈ 1.5811
        assert!((row[0] - (1.0 - 3.0) / 2.5f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn zscore_is_idempotent_on_scaled_rows() {
        let m = matrix_of(vec![vec![10.0, 20.0, 30.0, 40.0]]);
        let once = scale(&m, ScalingSpec::RowZScore).unwrap();
        let twice = scale(&once, ScalingSpec::RowZScore).unwrap();
        for (a, b) in once.values[0].iter().zip(twice.values[0].iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn constant_row_scales_to_zeros() {
        let m = matrix_of(vec![vec![5.0, 5.0, 5.0, 5.0, 5.0]]);
        let out = scale(&m, ScalingSpec::RowZScore).unwrap();
        assert_eq!(out.values[0], vec![0.0; 5]);
        assert!(out.values[0].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn rows_scale_independently() {
        let m = matrix_of(vec![vec![1.0, 3.0], vec![100.0, 300.0]]);
        let out = scale(&m, ScalingSpec::RowZScore).unwrap();
        // Both rows are a low/high pair, so both normalize identically.
        for (a, b) in out.values[0].iter().zip(out.values[1].iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn non_finite_cell_is_rejected() {
        let m = matrix_of(vec![vec![1.0, f64::NAN, 3.0]]);
        let err = scale(&m, ScalingSpec::RowZScore).unwrap_err();
        assert!(matches!(err, HeatmapError::Domain { .. }));
    }
}
