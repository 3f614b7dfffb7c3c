//! Sliding-window sequences and the chronological train/validation split

use chrono::NaiveDateTime;
use ndarray::{Array1, Array3, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SequenceError {
    #[error("window size must be at least 1")]
    ZeroWindow,
    #[error("series lengths disagree: {rows} feature rows, {targets} targets, {times} timestamps")]
    LengthMismatch {
        rows: usize,
        targets: usize,
        times: usize,
    },
    #[error("split ratio must lie strictly between 0 and 1, got {0}")]
    InvalidRatio(f64),
    #[error("cannot merge windows of shape {left:?} with {right:?}")]
    IncompatibleShapes { left: [usize; 2], right: [usize; 2] },
}

/// Windows of a series paired with the value that follows each one
///
/// `x` has shape `(n, window, features)`; `y[i]` and `target_times[i]` belong
/// to the row right after window `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSet {
    pub x: Array3<f64>,
    pub y: Array1<f64>,
    pub target_times: Vec<NaiveDateTime>,
}

impl WindowSet {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// `(window, features)` of every sample
    pub fn sample_shape(&self) -> [usize; 2] {
        let (_, w, f) = self.x.dim();
        [w, f]
    }

    /// Interleave several window sets by target timestamp
    ///
    /// The sort is stable: windows with equal target times keep the order
    /// of `sets`, then their order within each set.
    pub fn merge_chronological(sets: Vec<WindowSet>) -> Result<WindowSet, SequenceError> {
        let non_empty: Vec<WindowSet> = sets.into_iter().filter(|s| !s.is_empty()).collect();
        let Some(first) = non_empty.first() else {
            return Ok(WindowSet {
                x: Array3::zeros((0, 0, 0)),
                y: Array1::zeros(0),
                target_times: Vec::new(),
            });
        };
        let shape = first.sample_shape();
        if let Some(other) = non_empty.iter().find(|s| s.sample_shape() != shape) {
            return Err(SequenceError::IncompatibleShapes {
                left: shape,
                right: other.sample_shape(),
            });
        }

        let mut order: Vec<(usize, usize)> = non_empty
            .iter()
            .enumerate()
            .flat_map(|(set, s)| (0..s.len()).map(move |i| (set, i)))
            .collect();
        order.sort_by_key(|&(set, i)| non_empty[set].target_times[i]);

        let total = order.len();
        let mut x = Array3::zeros((total, shape[0], shape[1]));
        let mut y = Array1::zeros(total);
        let mut target_times = Vec::with_capacity(total);
        for (row, &(set, i)) in order.iter().enumerate() {
            let source = &non_empty[set];
            x.index_axis_mut(Axis(0), row)
                .assign(&source.x.index_axis(Axis(0), i));
            y[row] = source.y[i];
            target_times.push(source.target_times[i]);
        }

        Ok(WindowSet { x, y, target_times })
    }
}

/// Build `(window, next value)` pairs from a time-ordered series
///
/// For `N` rows this yields `N - window` pairs (none when `N <= window`).
/// Pair `i` covers rows `[i, i + window)` and targets row `i + window`.
pub fn build_windows(
    matrix: ArrayView2<f64>,
    target: ArrayView1<f64>,
    times: &[NaiveDateTime],
    window: usize,
) -> Result<WindowSet, SequenceError> {
    if window == 0 {
        return Err(SequenceError::ZeroWindow);
    }
    let rows = matrix.nrows();
    if target.len() != rows || times.len() != rows {
        return Err(SequenceError::LengthMismatch {
            rows,
            targets: target.len(),
            times: times.len(),
        });
    }

    let n = rows.saturating_sub(window);
    let features = matrix.ncols();
    let mut x = Array3::zeros((n, window, features));
    for i in 0..n {
        x.index_axis_mut(Axis(0), i)
            .assign(&matrix.slice(s![i..i + window, ..]));
    }
    let first_target = window.min(rows);
    let y = target.slice(s![first_target..]).to_owned();
    let target_times = times[first_target..].to_vec();

    Ok(WindowSet { x, y, target_times })
}

/// Training and validation tensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSet {
    pub x_train: Array3<f64>,
    pub y_train: Array1<f64>,
    pub x_val: Array3<f64>,
    pub y_val: Array1<f64>,
}

impl TensorSet {
    pub fn train_len(&self) -> usize {
        self.y_train.len()
    }

    pub fn val_len(&self) -> usize {
        self.y_val.len()
    }
}

/// Split windows into a chronological prefix (training) and suffix (validation)
///
/// The cut starts at `floor(n * ratio)` and moves forward past windows whose
/// target time equals the last training target, so every validation target
/// is strictly later than every training target.
pub fn chronological_split(set: &WindowSet, ratio: f64) -> Result<TensorSet, SequenceError> {
    if !(ratio > 0.0 && ratio < 1.0) {
        return Err(SequenceError::InvalidRatio(ratio));
    }
    let n = set.len();
    let mut cut = (n as f64 * ratio).floor() as usize;
    while cut > 0 && cut < n && set.target_times[cut] == set.target_times[cut - 1] {
        cut += 1;
    }

    Ok(TensorSet {
        x_train: set.x.slice(s![..cut, .., ..]).to_owned(),
        y_train: set.y.slice(s![..cut]).to_owned(),
        x_val: set.x.slice(s![cut.., .., ..]).to_owned(),
        y_val: set.y.slice(s![cut..]).to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use ndarray::Array2;

    fn hourly_times(n: usize) -> Vec<NaiveDateTime> {
        let start = NaiveDate::from_ymd_opt(2011, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (0..n).map(|i| start + Duration::hours(i as i64)).collect()
    }

    fn series(n: usize, features: usize) -> (Array2<f64>, Array1<f64>, Vec<NaiveDateTime>) {
        let matrix = Array2::from_shape_fn((n, features), |(i, j)| (i * 10 + j) as f64);
        let target = Array1::from_shape_fn(n, |i| i as f64);
        (matrix, target, hourly_times(n))
    }

    #[test]
    fn test_thousand_rows_scenario() {
        let (matrix, target, times) = series(1000, 11);
        let windows = build_windows(matrix.view(), target.view(), &times, 24).unwrap();
        assert_eq!(windows.len(), 976);
        assert_eq!(windows.x.dim(), (976, 24, 11));

        let split = chronological_split(&windows, 0.8).unwrap();
        assert_eq!(split.train_len(), 780);
        assert_eq!(split.val_len(), 196);
    }

    #[test]
    fn test_window_contents() {
        let (matrix, target, times) = series(30, 2);
        let windows = build_windows(matrix.view(), target.view(), &times, 24).unwrap();
        // pair 3 covers rows 3..27 and targets row 27
        assert_eq!(windows.x[[3, 0, 0]], 30.0);
        assert_eq!(windows.x[[3, 23, 1]], 261.0);
        assert_eq!(windows.y[3], 27.0);
        assert_eq!(windows.target_times[3], times[27]);
    }

    #[test]
    fn test_short_series_yields_nothing() {
        let (matrix, target, times) = series(24, 3);
        let windows = build_windows(matrix.view(), target.view(), &times, 24).unwrap();
        assert!(windows.is_empty());
        assert_eq!(windows.x.dim(), (0, 24, 3));

        let (matrix, target, times) = series(5, 3);
        let windows = build_windows(matrix.view(), target.view(), &times, 24).unwrap();
        assert!(windows.is_empty());
        assert!(windows.target_times.is_empty());
    }

    #[test]
    fn test_zero_window_rejected() {
        let (matrix, target, times) = series(5, 3);
        assert_eq!(
            build_windows(matrix.view(), target.view(), &times, 0),
            Err(SequenceError::ZeroWindow)
        );
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let (matrix, _, times) = series(5, 3);
        let target = Array1::zeros(4);
        assert!(matches!(
            build_windows(matrix.view(), target.view(), &times, 2),
            Err(SequenceError::LengthMismatch { rows: 5, targets: 4, .. })
        ));
    }

    #[test]
    fn test_invalid_ratio() {
        let (matrix, target, times) = series(50, 1);
        let windows = build_windows(matrix.view(), target.view(), &times, 4).unwrap();
        assert!(chronological_split(&windows, 0.0).is_err());
        assert!(chronological_split(&windows, 1.0).is_err());
        assert!(chronological_split(&windows, f64::NAN).is_err());
    }

    #[test]
    fn test_split_advances_past_shared_timestamp() {
        let times = hourly_times(3);
        let set = WindowSet {
            x: Array3::zeros((5, 1, 1)),
            y: Array1::from(vec![0.0, 1.0, 2.0, 3.0, 4.0]),
            target_times: vec![times[0], times[1], times[1], times[1], times[2]],
        };
        // floor(5 * 0.4) = 2 lands between two windows sharing times[1]
        let split = chronological_split(&set, 0.4).unwrap();
        assert_eq!(split.train_len(), 4);
        assert_eq!(split.y_val.to_vec(), vec![4.0]);
    }

    #[test]
    fn test_merge_chronological_is_stable() {
        let times = hourly_times(4);
        let a = WindowSet {
            x: Array3::from_elem((2, 1, 1), 1.0),
            y: Array1::from(vec![10.0, 11.0]),
            target_times: vec![times[0], times[2]],
        };
        let b = WindowSet {
            x: Array3::from_elem((2, 1, 1), 2.0),
            y: Array1::from(vec![20.0, 21.0]),
            target_times: vec![times[0], times[1]],
        };
        let merged = WindowSet::merge_chronological(vec![a, b]).unwrap();
        assert_eq!(merged.y.to_vec(), vec![10.0, 20.0, 21.0, 11.0]);
        assert_eq!(merged.x[[1, 0, 0]], 2.0);
    }

    #[test]
    fn test_merge_rejects_mixed_shapes() {
        let times = hourly_times(1);
        let a = WindowSet {
            x: Array3::zeros((1, 2, 1)),
            y: Array1::zeros(1),
            target_times: times.clone(),
        };
        let b = WindowSet {
            x: Array3::zeros((1, 3, 1)),
            y: Array1::zeros(1),
            target_times: times,
        };
        assert!(WindowSet::merge_chronological(vec![a, b]).is_err());
    }

    // ==================== Property-Based Tests ====================

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn window_count_is_rows_minus_window(n in 0usize..200, window in 1usize..40) {
                let (matrix, target, times) = series(n, 2);
                let windows = build_windows(matrix.view(), target.view(), &times, window).unwrap();
                prop_assert_eq!(windows.len(), n.saturating_sub(window));
            }

            #[test]
            fn validation_targets_follow_training_targets(
                gaps in prop::collection::vec(0i64..3, 10..120),
                ratio in 0.05f64..0.95
            ) {
                // gaps of zero produce runs of identical target timestamps
                let start = hourly_times(1)[0];
                let mut t = start;
                let target_times: Vec<NaiveDateTime> = gaps
                    .iter()
                    .map(|g| {
                        t += Duration::hours(*g);
                        t
                    })
                    .collect();
                let n = target_times.len();
                let set = WindowSet {
                    x: Array3::zeros((n, 1, 1)),
                    y: Array1::from_shape_fn(n, |i| i as f64),
                    target_times: target_times.clone(),
                };
                let split = chronological_split(&set, ratio).unwrap();
                let cut = split.train_len();
                prop_assert_eq!(cut + split.val_len(), n);
                if cut > 0 && cut < n {
                    prop_assert!(target_times[cut] > target_times[cut - 1]);
                }
            }
        }
    }
}
