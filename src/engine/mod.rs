use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::DataLayout;
use crate::matrix::codec::write_matrix;
use crate::matrix::{MatrixError, TimeWindow, TransitionMatrix};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("trajectory columns differ in length: {xs} lon, {ys} lat, {hs} height")]
    UnequalTrajectory { xs: usize, ys: usize, hs: usize },
    #[error("unknown airspace id {0}")]
    UnknownAirspace(usize),
    #[error("geometry engine failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// A flight path as three parallel columns: longitude, latitude, height (ft).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    xs: Vec<f64>,
    ys: Vec<f64>,
    hs: Vec<f64>,
}

impl Trajectory {
    pub fn new(xs: Vec<f64>, ys: Vec<f64>, hs: Vec<f64>) -> Result<Self, EngineError> {
        if xs.len() != ys.len() || xs.len() != hs.len() {
            return Err(EngineError::UnequalTrajectory {
                xs: xs.len(),
                ys: ys.len(),
                hs: hs.len(),
            });
        }
        Ok(Self { xs, ys, hs })
    }

    pub fn from_points(points: &[(f64, f64, f64)]) -> Self {
        let mut trajectory = Self::default();
        for &(lon, lat, height) in points {
            trajectory.xs.push(lon);
            trajectory.ys.push(lat);
            trajectory.hs.push(height);
        }
        trajectory
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn hs(&self) -> &[f64] {
        &self.hs
    }
}

/// Point-in-airspace tests, border distances and flight segmentation.
///
/// Implementations own the airspace geometries. Ids are handed out in
/// registration order starting at zero and double as matrix ordinals.
/// Distances are in feet; heights in feet.
pub trait GeometryEngine {
    fn register(&mut self, wkt: &str, lower_limit: f64, upper_limit: f64)
    -> Result<usize, EngineError>;

    fn size(&self) -> usize;

    fn distance_to_airspace(
        &self,
        lon: f64,
        lat: f64,
        height: f64,
        id: usize,
    ) -> Result<f64, EngineError>;

    fn airspaces_at_point(&self, lon: f64, lat: f64, height: f64)
    -> Result<Vec<usize>, EngineError>;

    /// Airspaces whose border lies within the engine's search radius, with
    /// their distance.
    fn airspaces_near_point(
        &self,
        lon: f64,
        lat: f64,
        height: f64,
    ) -> Result<Vec<(usize, f64)>, EngineError>;

    /// Ordered `(from, to)` handovers along one flight.
    fn process_single_flight(
        &self,
        trajectory: &Trajectory,
    ) -> Result<Vec<(usize, usize)>, EngineError>;

    /// Accumulates every flight of a dump file into the running result.
    fn process_flights_file(&mut self, path: &Path) -> Result<(), EngineError>;

    fn reset_result(&mut self) -> Result<(), EngineError>;

    fn get_result(&self) -> Result<TransitionMatrix, EngineError>;
}

/// Turns the flight dump of one time bucket into its matrix file and returns
/// the path written.
pub fn process_flights<E: GeometryEngine + ?Sized>(
    engine: &mut E,
    layout: &DataLayout,
    dataset: &str,
    at: NaiveDateTime,
) -> Result<PathBuf, ProcessError> {
    let flights = layout.flights_path(dataset, at);
    let target = layout.matrix_path(dataset, at);
    info!(flights = %flights.display(), "processing flight dump");

    engine.reset_result()?;
    engine.process_flights_file(&flights)?;
    let matrix = engine.get_result()?;
    if matrix.size() != engine.size() {
        warn!(
            matrix = matrix.size(),
            engine = engine.size(),
            "engine result size differs from registered airspaces"
        );
    }
    write_matrix(&target, &matrix)?;
    Ok(target)
}

/// Runs [`process_flights`] for every bucket that fits entirely inside the
/// window.
pub fn process_flights_window<E: GeometryEngine + ?Sized>(
    engine: &mut E,
    layout: &DataLayout,
    dataset: &str,
    window: &TimeWindow,
) -> Result<Vec<PathBuf>, ProcessError> {
    if window.step <= chrono::TimeDelta::zero() {
        return Err(MatrixError::InvalidStep.into());
    }
    let mut written = Vec::new();
    let mut slot = window.start;
    while slot + window.step <= window.end {
        written.push(process_flights(engine, layout, dataset, slot)?);
        slot += window.step;
    }
    info!(count = written.len(), "processed flight dumps");
    Ok(written)
}


#[cfg(test)]
mod tests {
    use super::fake::FakeEngine;
    use super::*;
    use crate::matrix::codec::read_matrix;
    use chrono::{NaiveDate, TimeDelta};

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|date| date.and_hms_opt(hour, 0, 0))
            .expect("valid time")
    }

    fn engine_with(airspaces: usize) -> FakeEngine {
        let mut engine = FakeEngine::default();
        for _ in 0..airspaces {
            engine.register("POINT (0 0)", 0.0, 1.0).expect("register");
        }
        engine
    }

    #[test]
    fn trajectory_columns_must_match() {
        let err = Trajectory::new(vec![0.0, 1.0], vec![0.0], vec![0.0, 0.0])
            .expect_err("unequal columns");
        assert!(matches!(
            err,
            EngineError::UnequalTrajectory { xs: 2, ys: 1, hs: 2 }
        ));

        let points = Trajectory::from_points(&[(-1.0, 51.0, 30000.0), (-1.1, 51.2, 31000.0)]);
        assert_eq!(points.len(), 2);
        assert_eq!(points.hs(), &[30000.0, 31000.0]);
    }

    #[test]
    fn process_flights_writes_bucket_matrix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DataLayout::new(dir.path());
        let mut engine = engine_with(2);
        engine
            .files
            .insert("0000.json".to_string(), vec![(0, 1), (0, 1), (1, 0)]);

        let path = process_flights(&mut engine, &layout, "uk", at(0)).expect("process");
        assert_eq!(path, layout.matrix_path("uk", at(0)));

        let matrix = read_matrix(&path).expect("read back");
        assert_eq!(matrix.get(0, 1), 2);
        assert_eq!(matrix.get(1, 0), 1);
    }

    #[test]
    fn process_flights_propagates_engine_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DataLayout::new(dir.path());
        let mut engine = engine_with(2);

        let err = process_flights(&mut engine, &layout, "uk", at(0)).expect_err("no dump");
        assert!(matches!(err, ProcessError::Engine(EngineError::Failed(_))));
        assert!(!layout.matrix_path("uk", at(0)).exists());
    }

    #[test]
    fn window_runs_only_whole_buckets_and_resets_between_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = DataLayout::new(dir.path());
        let mut engine = engine_with(2);
        for hour in ["0000.json", "0100.json", "0200.json"] {
            engine.files.insert(hour.to_string(), vec![(0, 1)]);
        }

        let window = TimeWindow {
            start: at(0),
            end: at(2) + TimeDelta::minutes(30),
            step: TimeDelta::hours(1),
        };
        let written = process_flights_window(&mut engine, &layout, "uk", &window).expect("window");
        assert_eq!(written.len(), 2);
        assert_eq!(engine.processed, vec!["0000.json", "0100.json"]);

        for path in written {
            assert_eq!(read_matrix(&path).expect("read").get(0, 1), 1);
        }
    }
}
