use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::engine::{EngineError, GeometryEngine};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed airspace dataset: {0}")]
    Malformed(String),
    #[error("duplicate airspace name `{0}`")]
    DuplicateName(String),
    #[error("airspace `{name}` has lower limit {lower} above upper limit {upper}")]
    InvertedLimits { name: String, lower: f64, upper: f64 },
    #[error("geometry engine assigned id {engine} to airspace `{name}` at position {position}")]
    EngineIdMismatch {
        name: String,
        position: usize,
        engine: usize,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub lon: f64,
    pub lat: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Airspace {
    pub id: usize,
    pub name: String,
    pub wkt: String,
    pub lower_limit: f64,
    pub upper_limit: f64,
    pub centroid: Centroid,
}

/// One row of an airspace dataset file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AirspaceRecord {
    pub name: String,
    pub wkt: String,
    pub lower_limit: f64,
    pub upper_limit: f64,
    #[serde(default)]
    pub centroid: Option<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AirspaceRef {
    ById(usize),
    ByName(String),
}

impl AirspaceRef {
    /// Interprets user input: all-digit strings become ids, anything else a
    /// name. Prefer [`AirspaceIndex::resolve_str`] when the index is at hand,
    /// since it lets an exact name win over the numeric reading.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<usize>() {
            Ok(id) => AirspaceRef::ById(id),
            Err(_) => AirspaceRef::ByName(raw.to_string()),
        }
    }
}

impl From<usize> for AirspaceRef {
    fn from(value: usize) -> Self {
        AirspaceRef::ById(value)
    }
}

impl From<&str> for AirspaceRef {
    fn from(value: &str) -> Self {
        AirspaceRef::ByName(value.to_string())
    }
}

impl fmt::Display for AirspaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AirspaceRef::ById(id) => write!(f, "#{id}"),
            AirspaceRef::ByName(name) => write!(f, "{name}"),
        }
    }
}

/// Positional registry of airspaces. The id of an airspace is its position,
/// which is also its row/column ordinal in every transition matrix.
#[derive(Debug, Clone, Default)]
pub struct AirspaceIndex {
    airspaces: Vec<Airspace>,
    by_name: HashMap<String, usize>,
}

impl AirspaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(
        records: impl IntoIterator<Item = AirspaceRecord>,
    ) -> Result<Self, DatasetError> {
        let mut index = Self::new();
        for record in records {
            index.register(record)?;
        }
        info!(count = index.len(), "loaded airspaces");
        Ok(index)
    }

    pub fn load_dataset(path: &Path) -> Result<Self, DatasetError> {
        Self::from_records(read_dataset(path)?)
    }

    pub fn register(&mut self, record: AirspaceRecord) -> Result<usize, DatasetError> {
        self.check(&record)?;
        let id = self.airspaces.len();
        debug!(id, name = %record.name, "registering airspace");
        let centroid = record
            .centroid
            .map(|[lon, lat]| Centroid { lon, lat })
            .unwrap_or_default();
        self.by_name.insert(record.name.clone(), id);
        self.airspaces.push(Airspace {
            id,
            name: record.name,
            wkt: record.wkt,
            lower_limit: record.lower_limit,
            upper_limit: record.upper_limit,
            centroid,
        });
        Ok(id)
    }

    /// Registers the airspace with the geometry engine as well. The engine
    /// must hand out the same id as the index position.
    pub fn register_with<E: GeometryEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        record: AirspaceRecord,
    ) -> Result<usize, DatasetError> {
        let position = self.airspaces.len();
        self.check(&record)?;
        let engine_id = engine.register(&record.wkt, record.lower_limit, record.upper_limit)?;
        if engine_id != position {
            return Err(DatasetError::EngineIdMismatch {
                name: record.name,
                position,
                engine: engine_id,
            });
        }
        self.register(record)
    }

    fn check(&self, record: &AirspaceRecord) -> Result<(), DatasetError> {
        if self.by_name.contains_key(&record.name) {
            return Err(DatasetError::DuplicateName(record.name.clone()));
        }
        if record.lower_limit > record.upper_limit {
            return Err(DatasetError::InvertedLimits {
                name: record.name.clone(),
                lower: record.lower_limit,
                upper: record.upper_limit,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.airspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.airspaces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Airspace> {
        self.airspaces.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.airspaces.iter().map(|airspace| airspace.name.as_str())
    }

    pub fn by_id(&self, id: usize) -> Option<&Airspace> {
        self.airspaces.get(id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Airspace> {
        self.by_name.get(name).and_then(|&id| self.airspaces.get(id))
    }

    pub fn get(&self, airspace: &AirspaceRef) -> Option<&Airspace> {
        match airspace {
            AirspaceRef::ById(id) => self.by_id(*id),
            AirspaceRef::ByName(name) => self.by_name(name),
        }
    }

    /// Exact name first, then the string read as an id.
    pub fn resolve_str(&self, raw: &str) -> Option<&Airspace> {
        self.by_name(raw).or_else(|| match AirspaceRef::parse(raw) {
            AirspaceRef::ById(id) => self.by_id(id),
            AirspaceRef::ByName(_) => None,
        })
    }

    pub fn zone_centre(&self, airspace: &AirspaceRef) -> Option<Centroid> {
        self.get(airspace).map(|airspace| airspace.centroid)
    }
}

pub fn read_dataset(path: &Path) -> Result<Vec<AirspaceRecord>, DatasetError> {
    let content = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_dataset(&content)
}

/// Accepts either a bare JSON array of records or `{"airspaces": [...]}`.
pub fn parse_dataset(content: &str) -> Result<Vec<AirspaceRecord>, DatasetError> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|err| DatasetError::Malformed(err.to_string()))?;
    let rows = match value {
        serde_json::Value::Object(mut map) => map
            .remove("airspaces")
            .ok_or_else(|| DatasetError::Malformed("missing `airspaces` list".to_string()))?,
        other => other,
    };
    serde_json::from_value(rows).map_err(|err| DatasetError::Malformed(err.to_string()))
}
