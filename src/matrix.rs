use crate::error::HeatmapError;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// A labeled 2D numeric matrix.
///
/// Rows and columns carry ordered label sequences; `values[r][c]` is the cell
/// in row `r`, column `c`. Invariant: `values.len() == row_labels.len()` and
/// every row has `col_labels.len()` cells. Pipeline stages never mutate a
/// matrix in place; they build a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    pub row_labels: Vec<String>,
    pub col_labels: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl Matrix {
    /// Build a matrix from parts, checking the shape invariant.
    pub fn new(
        row_labels: Vec<String>,
        col_labels: Vec<String>,
        values: Vec<Vec<f64>>,
    ) -> Result<Self, HeatmapError> {
        if values.len() != row_labels.len() {
            return Err(HeatmapError::Shape {
                line: 0,
                expected: row_labels.len(),
                found: values.len(),
            });
        }
        for (i, row) in values.iter().enumerate() {
            if row.len() != col_labels.len() {
                return Err(HeatmapError::Shape {
                    line: i + 2, // header is line 1
                    expected: col_labels.len(),
                    found: row.len(),
                });
            }
        }
        Ok(Self {
            row_labels,
            col_labels,
            values,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.row_labels.len()
    }

    pub fn n_cols(&self) -> usize {
        self.col_labels.len()
    }

    /// Load a delimited text file: first row = column headers, first column =
    /// row labels, remaining cells = finite floating-point numbers.
    ///
    /// The delimiter (tab or comma) is detected from the header row. A
    /// non-numeric cell fails with `Parse`, a ragged row with `Shape`, and a
    /// NaN/Infinity literal with `Domain`; no row is silently skipped.
    pub fn from_delimited<P: AsRef<Path>>(path: P) -> Result<Self, HeatmapError> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header = match lines.next() {
            Some(line) => line?,
            None => return Err(HeatmapError::Empty),
        };
        // Tab wins when present; gene tables are usually TSV, and tab is a
        // safer signal than comma (labels may contain commas in quoted CSV,
        // which this loader does not attempt to handle).
        let delim = if header.contains('\t') { '\t' } else { ',' };

        let header_fields: Vec<&str> = header.split(delim).collect();
        if header_fields.len() < 2 {
            return Err(HeatmapError::Empty);
        }
        // The first header field names the row-label column; skip it.
        let col_labels: Vec<String> = header_fields[1..]
            .iter()
            .map(|s| s.trim().to_string())
            .collect();
        let n_cols = col_labels.len();

        let mut row_labels = Vec::new();
        let mut values: Vec<Vec<f64>> = Vec::new();

        for (line_idx, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(delim).collect();
            if fields.len() != n_cols + 1 {
                return Err(HeatmapError::Shape {
                    line: line_idx + 2,
                    expected: n_cols,
                    found: fields.len().saturating_sub(1),
                });
            }
            let row_label = fields[0].trim().to_string();
            let mut row = Vec::with_capacity(n_cols);
            for (col_idx, cell) in fields[1..].iter().enumerate() {
                let v: f64 = cell.trim().parse().map_err(|_| HeatmapError::Parse {
                    row: row_label.clone(),
                    column: col_labels[col_idx].clone(),
                    value: cell.trim().to_string(),
                })?;
                if !v.is_finite() {
                    return Err(HeatmapError::Domain {
                        row: row_label.clone(),
                        column: col_labels[col_idx].clone(),
                    });
                }
                row.push(v);
            }
            row_labels.push(row_label);
            values.push(row);
        }

        if values.is_empty() {
            return Err(HeatmapError::Empty);
        }

        Matrix::new(row_labels, col_labels, values)
    }

    /// A column as a contiguous vector (used when clustering the column axis).
    pub fn column(&self, c: usize) -> Vec<f64> {
        self.values.iter().map(|row| row[c]).collect()
    }

    /// Reindex rows and columns by the given permutations, producing a new
    /// matrix. Every original row/column appears exactly once in the output.
    pub fn reorder(&self, row_order: &[usize], col_order: &[usize]) -> Matrix {
        let row_labels = row_order
            .iter()
            .map(|&r| self.row_labels[r].clone())
            .collect();
        let col_labels = col_order
            .iter()
            .map(|&c| self.col_labels[c].clone())
            .collect();
        let values = row_order
            .iter()
            .map(|&r| col_order.iter().map(|&c| self.values[r][c]).collect())
            .collect();
        Matrix {
            row_labels,
            col_labels,
            values,
        }
    }

    /// Write the matrix back out as CSV, same layout as the loader expects.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), HeatmapError> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "id,{}", self.col_labels.join(","))?;
        for (label, row) in self.row_labels.iter().zip(self.values.iter()) {
            let cells: Vec<String> = row.iter().map(|v| format!("{:.6}", v)).collect();
            writeln!(writer, "{},{}", label, cells.join(","))?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_temp(content: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "exprheat_matrix_test_{}_{}.csv",
            std::process::id(),
            content.len()
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_comma_delimited() {
        let path = write_temp("gene,s1,s2,s3\nA,1,2,3\nB,4,5,6\n");
        let m = Matrix::from_delimited(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(m.row_labels, vec!["A", "B"]);
        assert_eq!(m.col_labels, vec!["s1", "s2", "s3"]);
        assert_eq!(m.values[1], vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn loads_tab_delimited() {
        let path = write_temp("gene\ts1\ts2\nA\t1.5\t-2\n");
        let m = Matrix::from_delimited(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(m.n_rows(), 1);
        assert_eq!(m.values[0], vec![1.5, -2.0]);
    }

    #[test]
    fn rejects_non_numeric_cell() {
        let path = write_temp("gene,s1,s2\nA,1,oops\n");
        let err = Matrix::from_delimited(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        match err {
            HeatmapError::Parse { row, column, value } => {
                assert_eq!(row, "A");
                assert_eq!(column, "s2");
                assert_eq!(value, "oops");
            }
            other => panic!("expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_ragged_row() {
        let path = write_temp("gene,s1,s2\nA,1,2\nB,3\n");
        let err = Matrix::from_delimited(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, HeatmapError::Shape { line: 3, .. }));
    }

    #[test]
    fn rejects_nan_literal() {
        let path = write_temp("gene,s1,s2\nA,NaN,2\n");
        let err = Matrix::from_delimited(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, HeatmapError::Domain { .. }));
    }

    #[test]
    fn reorder_is_a_pure_permutation() {
        let m = Matrix::new(
            vec!["A".into(), "B".into(), "C".into()],
            vec!["x".into(), "y".into()],
            vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]],
        )
        .unwrap();
        let r = m.reorder(&[2, 0, 1], &[1, 0]);
        assert_eq!(r.row_labels, vec!["C", "A", "B"]);
        assert_eq!(r.col_labels, vec!["y", "x"]);
        assert_eq!(r.values[0], vec![6.0, 5.0]);
        assert_eq!(r.values[1], vec![2.0, 1.0]);
        // Original untouched
        assert_eq!(m.values[0], vec![1.0, 2.0]);
    }
}
