use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeDelta};
use tracing::{debug, info};

use crate::config::DataLayout;
use crate::matrix::codec::read_matrix;
use crate::matrix::{MatrixError, TransitionMatrix};

/// A contiguous time range sampled at a fixed step, hourly by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub step: TimeDelta,
}

impl TimeWindow {
    pub fn hourly(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start,
            end,
            step: TimeDelta::hours(1),
        }
    }

    /// `start + i * step` for `i` in `0..floor((end - start) / step)`.
    pub fn slots(&self) -> Result<Vec<NaiveDateTime>, MatrixError> {
        let step_secs = self.step.num_seconds();
        if step_secs <= 0 {
            return Err(MatrixError::InvalidStep);
        }
        let span_secs = (self.end - self.start).num_seconds();
        if span_secs <= 0 {
            return Ok(Vec::new());
        }
        let count = span_secs / step_secs;
        Ok((0..count)
            .map(|i| self.start + TimeDelta::seconds(i * step_secs))
            .collect())
    }
}

/// Loads every source in order and folds them with element-wise addition.
///
/// Returns `Ok(None)` when `paths` is empty. Any missing or unreadable source
/// fails the whole aggregation.
pub fn aggregate_files<P: AsRef<Path>>(
    paths: &[P],
) -> Result<Option<TransitionMatrix>, MatrixError> {
    info!(sources = paths.len(), "loading handover matrices");
    sum_matrices(paths.iter().map(|path| {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading matrix");
        read_matrix(path)
    }))
}

/// Folds matrices in order, stopping at the first error. `Ok(None)` when
/// there is nothing to fold.
pub fn sum_matrices<I>(matrices: I) -> Result<Option<TransitionMatrix>, MatrixError>
where
    I: IntoIterator<Item = Result<TransitionMatrix, MatrixError>>,
{
    let mut acc: Option<TransitionMatrix> = None;
    for matrix in matrices {
        let matrix = matrix?;
        match acc.as_mut() {
            Some(total) => total.merge(&matrix)?,
            None => acc = Some(matrix),
        }
    }
    Ok(acc)
}

pub fn aggregate_window(
    layout: &DataLayout,
    dataset: &str,
    window: &TimeWindow,
) -> Result<Option<TransitionMatrix>, MatrixError> {
    let paths = window_paths(layout, dataset, window)?;
    info!(
        count = paths.len(),
        start = %window.start,
        end = %window.end,
        "aggregating matrices over time window"
    );
    aggregate_files(&paths)
}

pub fn window_paths(
    layout: &DataLayout,
    dataset: &str,
    window: &TimeWindow,
) -> Result<Vec<PathBuf>, MatrixError> {
    Ok(window
        .slots()?
        .into_iter()
        .map(|slot| layout.matrix_path(dataset, slot))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::codec::write_matrix;
    use chrono::NaiveDate;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|date| date.and_hms_opt(hour, 0, 0))
            .expect("valid time")
    }

    #[test]
    fn slots_floor_partial_steps() {
        let window = TimeWindow {
            start: at(0),
            end: at(3) + TimeDelta::minutes(30),
            step: TimeDelta::hours(1),
        };
        let slots = window.slots().expect("slots");
        assert_eq!(slots, vec![at(0), at(1), at(2)]);
    }

    #[test]
    fn reversed_window_has_no_slots() {
        let window = TimeWindow::hourly(at(5), at(2));
        assert!(window.slots().expect("slots").is_empty());
    }

    #[test]
    fn zero_step_is_rejected() {
        let window = TimeWindow {
            start: at(0),
            end: at(1),
            step: TimeDelta::zero(),
        };
        assert!(matches!(window.slots(), Err(MatrixError::InvalidStep)));
    }

    #[test]
    fn empty_source_list_is_absent_not_zero() {
        let empty: [PathBuf; 0] = [];
        assert!(aggregate_files(&empty).expect("aggregate").is_none());
    }

    #[test]
    fn sums_all_sources_and_fails_on_missing_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a.matrix.zst");
        let b = dir.path().join("b.matrix.zst");
        write_matrix(
            &a,
            &TransitionMatrix::from_dense(&[vec![0, 1], vec![2, 0]]).expect("a"),
        )
        .expect("write a");
        write_matrix(
            &b,
            &TransitionMatrix::from_dense(&[vec![0, 3], vec![0, 0]]).expect("b"),
        )
        .expect("write b");

        let total = aggregate_files(&[&a, &b])
            .expect("aggregate")
            .expect("present");
        assert_eq!(total.get(0, 1), 4);
        assert_eq!(total.get(1, 0), 2);

        let missing = dir.path().join("c.matrix.zst");
        let err = aggregate_files(&[&a, &missing, &b]).expect_err("missing source");
        assert!(matches!(err, MatrixError::MissingSource { .. }));
    }

    #[test]
    fn sources_whose_sum_overflows_fail_the_aggregation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let full = dir.path().join("full.matrix.zst");
        let mut matrix = TransitionMatrix::new(2);
        matrix.add(0, 1, u64::MAX).expect("max count");
        write_matrix(&full, &matrix).expect("write full");

        let once = aggregate_files(&[&full]).expect("single source").expect("present");
        assert_eq!(once.get(0, 1), u64::MAX);
        let err = aggregate_files(&[&full, &full]).expect_err("overflow");
        assert!(matches!(err, MatrixError::CountOverflow { row: 0, col: 1 }));
    }

    #[test]
    fn window_resolves_matrix_paths_through_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DataLayout::new(dir.path());
        let window = TimeWindow::hourly(at(0), at(2));
        for slot in window.slots().expect("slots") {
            write_matrix(
                &layout.matrix_path("uk", slot),
                &TransitionMatrix::from_dense(&[vec![0, 1], vec![0, 0]]).expect("m"),
            )
            .expect("write slot");
        }

        let total = aggregate_window(&layout, "uk", &window)
            .expect("aggregate")
            .expect("present");
        assert_eq!(total.get(0, 1), 2);

        let longer = TimeWindow::hourly(at(0), at(3));
        assert!(matches!(
            aggregate_window(&layout, "uk", &longer),
            Err(MatrixError::MissingSource { .. })
        ));
    }
}
