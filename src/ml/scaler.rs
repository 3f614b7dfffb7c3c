//! Min-max normalization fitted once on the training corpus

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while fitting or applying a scaler
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScalerError {
    #[error("cannot fit a scaler on an empty corpus")]
    EmptyCorpus,
    #[error("row {row} has {found} columns, expected {expected}")]
    WidthMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("non-finite value {value} in row {row}, column {column}")]
    NonFinite { row: usize, column: usize, value: f64 },
    #[error("column {column} is constant ({value}); min-max scaling is undefined")]
    DegenerateColumn { column: usize, value: f64 },
}

/// What to do with a column whose minimum equals its maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegeneratePolicy {
    /// Fail the fit with `DegenerateColumn`
    Reject,
    /// Treat the range as 1 so the column maps to `x - min`
    #[default]
    Passthrough,
}

/// Fitted bounds of one column
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnBounds {
    pub min: f64,
    pub max: f64,
}

impl ColumnBounds {
    fn range(&self) -> f64 {
        let range = self.max - self.min;
        if range == 0.0 { 1.0 } else { range }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Per-column min-max scaler
///
/// `transform(x) = (x - min) / (max - min)`. Inputs outside the fitted range
/// extrapolate linearly; nothing is clipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    columns: Vec<ColumnBounds>,
}

impl MinMaxScaler {
    /// Fit bounds on a corpus of equally wide rows
    pub fn fit<R: AsRef<[f64]>>(rows: &[R], policy: DegeneratePolicy) -> Result<Self, ScalerError> {
        let first = rows.first().ok_or(ScalerError::EmptyCorpus)?;
        let width = first.as_ref().len();
        let mut columns = vec![
            ColumnBounds {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            };
            width
        ];

        for (row_index, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != width {
                return Err(ScalerError::WidthMismatch {
                    row: row_index,
                    expected: width,
                    found: row.len(),
                });
            }
            for (column, (&value, bounds)) in row.iter().zip(columns.iter_mut()).enumerate() {
                if !value.is_finite() {
                    return Err(ScalerError::NonFinite {
                        row: row_index,
                        column,
                        value,
                    });
                }
                bounds.min = bounds.min.min(value);
                bounds.max = bounds.max.max(value);
            }
        }

        for (column, bounds) in columns.iter().enumerate() {
            if bounds.min == bounds.max {
                match policy {
                    DegeneratePolicy::Reject => {
                        return Err(ScalerError::DegenerateColumn {
                            column,
                            value: bounds.min,
                        });
                    }
                    DegeneratePolicy::Passthrough => {
                        tracing::warn!(
                            "Column {} is constant ({}); scaling it as x - min",
                            column,
                            bounds.min
                        );
                    }
                }
            }
        }

        Ok(Self { columns })
    }

    /// Fit a single-column scaler on a target series
    pub fn fit_column(values: &[f64], policy: DegeneratePolicy) -> Result<Self, ScalerError> {
        let rows: Vec<[f64; 1]> = values.iter().map(|&v| [v]).collect();
        Self::fit(&rows, policy)
    }

    /// Rebuild a scaler from previously fitted bounds
    pub fn from_bounds(columns: Vec<ColumnBounds>) -> Self {
        Self { columns }
    }

    pub fn bounds(&self) -> &[ColumnBounds] {
        &self.columns
    }

    pub fn n_features(&self) -> usize {
        self.columns.len()
    }

    fn check_width(&self, row: &[f64]) -> Result<(), ScalerError> {
        if row.len() == self.columns.len() {
            Ok(())
        } else {
            Err(ScalerError::WidthMismatch {
                row: 0,
                expected: self.columns.len(),
                found: row.len(),
            })
        }
    }

    pub fn transform(&self, row: &[f64]) -> Result<Vec<f64>, ScalerError> {
        self.check_width(row)?;
        Ok(row
            .iter()
            .zip(&self.columns)
            .map(|(&x, b)| (x - b.min) / b.range())
            .collect())
    }

    pub fn inverse_transform(&self, row: &[f64]) -> Result<Vec<f64>, ScalerError> {
        self.check_width(row)?;
        Ok(row
            .iter()
            .zip(&self.columns)
            .map(|(&x, b)| x * b.range() + b.min)
            .collect())
    }

    /// Transform every row of a matrix
    pub fn transform_matrix(&self, matrix: ArrayView2<f64>) -> Result<Array2<f64>, ScalerError> {
        if matrix.ncols() != self.columns.len() {
            return Err(ScalerError::WidthMismatch {
                row: 0,
                expected: self.columns.len(),
                found: matrix.ncols(),
            });
        }
        let mut scaled = matrix.to_owned();
        for (mut column, b) in scaled.columns_mut().into_iter().zip(&self.columns) {
            let range = b.range();
            column.mapv_inplace(|x| (x - b.min) / range);
        }
        Ok(scaled)
    }

    /// Scale one value of the given column
    pub fn transform_value(&self, column: usize, value: f64) -> Option<f64> {
        self.columns.get(column).map(|b| (value - b.min) / b.range())
    }

    /// Undo `transform_value`
    pub fn inverse_value(&self, column: usize, value: f64) -> Option<f64> {
        self.columns.get(column).map(|b| value * b.range() + b.min)
    }

    /// First column whose value lies outside the fitted bounds
    pub fn first_out_of_range(&self, row: &[f64]) -> Option<(usize, f64, ColumnBounds)> {
        row.iter()
            .zip(&self.columns)
            .enumerate()
            .find(|(_, (x, b))| !b.contains(**x))
            .map(|(i, (&x, &b))| (i, x, b))
    }
}

/// Feature scaler plus the single-column target scaler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerBundle {
    pub features: MinMaxScaler,
    pub target: MinMaxScaler,
}

impl ScalerBundle {
    /// Scale a single target value
    pub fn scale_target(&self, value: f64) -> f64 {
        self.target.transform_value(0, value).unwrap_or(value)
    }

    /// Map a normalized model output back to vehicles
    pub fn unscale_target(&self, value: f64) -> f64 {
        self.target.inverse_value(0, value).unwrap_or(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn reference_corpus() -> Vec<Vec<f64>> {
        vec![vec![0.0, 10.0], vec![5.0, 20.0], vec![10.0, 30.0]]
    }

    #[test]
    fn test_fit_transform_inverse_scenario() {
        let scaler = MinMaxScaler::fit(&reference_corpus(), DegeneratePolicy::Reject).unwrap();

        let scaled = scaler.transform(&[5.0, 20.0]).unwrap();
        assert_relative_eq!(scaled[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(scaled[1], 0.5, epsilon = 1e-12);

        let restored = scaler.inverse_transform(&[0.5, 0.5]).unwrap();
        assert_relative_eq!(restored[0], 5.0, epsilon = 1e-12);
        assert_relative_eq!(restored[1], 20.0, epsilon = 1e-12);
    }

    #[test]
    fn test_bounds() {
        let scaler =
            MinMaxScaler::fit(&reference_corpus(), DegeneratePolicy::Passthrough).unwrap();
        assert_eq!(
            scaler.bounds(),
            &[
                ColumnBounds { min: 0.0, max: 10.0 },
                ColumnBounds { min: 10.0, max: 30.0 }
            ]
        );
    }

    #[test]
    fn test_extrapolates_without_clipping() {
        let scaler = MinMaxScaler::fit(&reference_corpus(), DegeneratePolicy::Reject).unwrap();
        let scaled = scaler.transform(&[20.0, 0.0]).unwrap();
        assert_relative_eq!(scaled[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(scaled[1], -0.5, epsilon = 1e-12);
        assert_eq!(scaler.first_out_of_range(&[20.0, 0.0]).map(|(i, _, _)| i), Some(0));
        assert!(scaler.first_out_of_range(&[5.0, 20.0]).is_none());
    }

    #[test]
    fn test_empty_corpus() {
        let rows: Vec<Vec<f64>> = Vec::new();
        assert_eq!(
            MinMaxScaler::fit(&rows, DegeneratePolicy::Passthrough),
            Err(ScalerError::EmptyCorpus)
        );
    }

    #[test]
    fn test_ragged_rows() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(matches!(
            MinMaxScaler::fit(&rows, DegeneratePolicy::Passthrough),
            Err(ScalerError::WidthMismatch { row: 1, .. })
        ));
    }

    #[test]
    fn test_degenerate_column_rejected() {
        let rows = vec![vec![1.0, 7.0], vec![2.0, 7.0]];
        assert_eq!(
            MinMaxScaler::fit(&rows, DegeneratePolicy::Reject),
            Err(ScalerError::DegenerateColumn { column: 1, value: 7.0 })
        );
    }

    #[test]
    fn test_degenerate_column_passthrough() {
        let rows = vec![vec![1.0, 7.0], vec![2.0, 7.0]];
        let scaler = MinMaxScaler::fit(&rows, DegeneratePolicy::Passthrough).unwrap();
        let scaled = scaler.transform(&[1.5, 9.0]).unwrap();
        assert_relative_eq!(scaled[1], 2.0, epsilon = 1e-12);
        let restored = scaler.inverse_transform(&scaled).unwrap();
        assert_relative_eq!(restored[1], 9.0, epsilon = 1e-12);
    }

    #[test]
    fn test_fit_rejects_nan() {
        let rows = vec![vec![1.0], vec![f64::NAN]];
        assert!(matches!(
            MinMaxScaler::fit(&rows, DegeneratePolicy::Passthrough),
            Err(ScalerError::NonFinite { row: 1, column: 0, .. })
        ));
    }

    #[test]
    fn test_transform_width_mismatch() {
        let scaler = MinMaxScaler::fit(&reference_corpus(), DegeneratePolicy::Reject).unwrap();
        assert!(scaler.transform(&[1.0]).is_err());
    }

    #[test]
    fn test_transform_matrix_matches_rows() {
        let scaler = MinMaxScaler::fit(&reference_corpus(), DegeneratePolicy::Reject).unwrap();
        let matrix = array![[0.0, 10.0], [5.0, 20.0], [10.0, 30.0]];
        let scaled = scaler.transform_matrix(matrix.view()).unwrap();
        assert_eq!(scaled, array![[0.0, 0.0], [0.5, 0.5], [1.0, 1.0]]);
    }

    #[test]
    fn test_target_bundle() {
        let bundle = ScalerBundle {
            features: MinMaxScaler::fit(&reference_corpus(), DegeneratePolicy::Reject).unwrap(),
            target: MinMaxScaler::fit_column(&[0.0, 200.0, 400.0], DegeneratePolicy::Reject)
                .unwrap(),
        };
        assert_relative_eq!(bundle.scale_target(100.0), 0.25, epsilon = 1e-12);
        assert_relative_eq!(bundle.unscale_target(0.25), 100.0, epsilon = 1e-12);
    }

    #[test]
    fn test_serde_roundtrip_is_lossless() {
        let rows = vec![vec![0.1 + 0.2, 1.0 / 3.0], vec![1e-300, 7.123456789012345]];
        let scaler = MinMaxScaler::fit(&rows, DegeneratePolicy::Reject).unwrap();
        let json = serde_json::to_string(&scaler).unwrap();
        let restored: MinMaxScaler = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, scaler);
    }

    // ==================== Property-Based Tests ====================

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn inverse_transform_undoes_transform(
                corpus in prop::collection::vec(prop::collection::vec(-1.0e4f64..1.0e4, 3), 2..40),
                sample in prop::collection::vec(-2.0e4f64..2.0e4, 3)
            ) {
                let scaler = MinMaxScaler::fit(&corpus, DegeneratePolicy::Passthrough).unwrap();
                let scaled = scaler.transform(&sample).unwrap();
                let restored = scaler.inverse_transform(&scaled).unwrap();
                for (a, b) in sample.iter().zip(&restored) {
                    prop_assert!((a - b).abs() <= 1e-9, "{} vs {}", a, b);
                }
            }

            #[test]
            fn fitted_corpus_lands_in_unit_interval(
                corpus in prop::collection::vec(prop::collection::vec(-1.0e4f64..1.0e4, 2), 2..40)
            ) {
                let scaler = MinMaxScaler::fit(&corpus, DegeneratePolicy::Passthrough).unwrap();
                for row in &corpus {
                    for x in scaler.transform(row).unwrap() {
                        prop_assert!((-1e-12..=1.0 + 1e-12).contains(&x));
                    }
                }
            }
        }
    }
}
