use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::airspace::{Airspace, AirspaceIndex, AirspaceRef};
use crate::confidence::{ConfidenceConfig, ConfidenceResult, confidence};
use crate::engine::{EngineError, GeometryEngine, Trajectory};
use crate::graph::HandoverGraph;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("handover graph has merges pending normalization")]
    StaleGraph,
    #[error("geometry engine reported airspace id {0}, which the index does not hold")]
    UnknownAirspace(usize),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A scored candidate handover between two airspaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandoverReport {
    pub airspace1: usize,
    pub airspace2: usize,
    pub name1: String,
    pub name2: String,
    #[serde(flatten)]
    pub result: ConfidenceResult,
}

/// Highest-confidence report; ties keep the earliest.
pub fn best(reports: &[HandoverReport]) -> Option<&HandoverReport> {
    reports.iter().fold(None, |best, report| match best {
        Some(current) if current.result.confidence >= report.result.confidence => Some(current),
        _ => Some(report),
    })
}

/// Read-only view answering handover questions against a normalized graph.
#[derive(Debug, Clone, Copy)]
pub struct HandoverAnalyzer<'a> {
    index: &'a AirspaceIndex,
    graph: &'a HandoverGraph,
    config: ConfidenceConfig,
}

impl<'a> HandoverAnalyzer<'a> {
    pub fn new(
        index: &'a AirspaceIndex,
        graph: &'a HandoverGraph,
        config: ConfidenceConfig,
    ) -> Result<Self, QueryError> {
        if !graph.is_normalized() {
            return Err(QueryError::StaleGraph);
        }
        Ok(Self {
            index,
            graph,
            config,
        })
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// `None` when either airspace is unknown; 0 when no edge was observed.
    pub fn edge_weight(&self, from: &AirspaceRef, to: &AirspaceRef) -> Option<u64> {
        let a1 = self.index.get(from)?;
        let a2 = self.index.get(to)?;
        Some(self.graph.edge_weight(&a1.name, &a2.name))
    }

    pub fn handover_confidence(
        &self,
        from: &AirspaceRef,
        to: &AirspaceRef,
        distance1: Option<f64>,
        distance2: Option<f64>,
    ) -> Option<HandoverReport> {
        let a1 = self.index.get(from)?;
        let a2 = self.index.get(to)?;
        Some(self.report(a1, a2, distance1, distance2))
    }

    /// Every handover that could happen at a point: each airspace containing
    /// the point paired with each airspace near it.
    pub fn test_point<E: GeometryEngine + ?Sized>(
        &self,
        engine: &E,
        lon: f64,
        lat: f64,
        height: f64,
    ) -> Result<Vec<HandoverReport>, QueryError> {
        let at_point = engine.airspaces_at_point(lon, lat, height)?;
        let near_point = engine.airspaces_near_point(lon, lat, height)?;
        info!(
            inside = at_point.len(),
            near = near_point.len(),
            "scoring handovers at point"
        );

        let mut out = Vec::with_capacity(at_point.len() * near_point.len());
        for id_at in at_point {
            let a1 = self.airspace(id_at)?;
            for &(id_near, distance) in &near_point {
                let a2 = self.airspace(id_near)?;
                out.push(self.report(a1, a2, Some(0.0), Some(distance)));
            }
        }
        Ok(out)
    }

    /// Engine distance from a point to an airspace named by id or name.
    /// Unknown airspaces give `Ok(None)`.
    pub fn airspace_distance<E: GeometryEngine + ?Sized>(
        &self,
        engine: &E,
        lon: f64,
        lat: f64,
        height: f64,
        airspace: &AirspaceRef,
    ) -> Result<Option<f64>, QueryError> {
        let Some(found) = self.index.get(airspace) else {
            debug!(%airspace, "distance to unknown airspace");
            return Ok(None);
        };
        Ok(Some(engine.distance_to_airspace(lon, lat, height, found.id)?))
    }

    /// Scores a handover at a point using the engine's border distances.
    /// Unknown airspaces give `Ok(None)`.
    pub fn test_handover<E: GeometryEngine + ?Sized>(
        &self,
        engine: &E,
        lon: f64,
        lat: f64,
        height: f64,
        from: &AirspaceRef,
        to: &AirspaceRef,
    ) -> Result<Option<HandoverReport>, QueryError> {
        let (Some(a1), Some(a2)) = (self.index.get(from), self.index.get(to)) else {
            debug!(%from, %to, "handover test on unknown airspace");
            return Ok(None);
        };
        let distance1 = engine.distance_to_airspace(lon, lat, height, a1.id)?;
        let distance2 = engine.distance_to_airspace(lon, lat, height, a2.id)?;
        Ok(Some(self.report(a1, a2, Some(distance1), Some(distance2))))
    }

    /// Scores each handover along a flight on traffic evidence alone.
    pub fn test_flight<E: GeometryEngine + ?Sized>(
        &self,
        engine: &E,
        trajectory: &Trajectory,
    ) -> Result<Vec<HandoverReport>, QueryError> {
        let handovers = engine.process_single_flight(trajectory)?;
        info!(
            points = trajectory.len(),
            handovers = handovers.len(),
            "scoring handovers along flight"
        );
        handovers
            .into_iter()
            .map(|(from, to)| {
                let a1 = self.airspace(from)?;
                let a2 = self.airspace(to)?;
                Ok(self.report(a1, a2, None, None))
            })
            .collect()
    }

    fn airspace(&self, id: usize) -> Result<&'a Airspace, QueryError> {
        self.index.by_id(id).ok_or(QueryError::UnknownAirspace(id))
    }

    fn report(
        &self,
        a1: &Airspace,
        a2: &Airspace,
        distance1: Option<f64>,
        distance2: Option<f64>,
    ) -> HandoverReport {
        let edge = self.graph.edge(&a1.name, &a2.name);
        HandoverReport {
            airspace1: a1.id,
            airspace2: a2.id,
            name1: a1.name.clone(),
            name2: a2.name.clone(),
            result: confidence(edge, distance1, distance2, &self.config),
        }
    }
}
