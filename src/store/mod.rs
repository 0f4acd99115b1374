pub mod atomic;

use std::ops::Deref;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::airspace::{AirspaceIndex, AirspaceRecord};
use crate::graph::{HandoverEdge, HandoverGraph};

const SCHEMA_VERSION: i64 = 1;

/// One row of the ingest ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestRecord {
    pub source: String,
    pub sha256: String,
    pub ingested_at: String,
}

/// SQLite persistence for the airspace index, the normalized handover graph
/// and the ledger of matrix sources already folded into it.
pub struct GraphStore {
    conn: Connection,
}

impl GraphStore {
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        let version: i64 = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                self.create_schema_v1()?;
                self.conn
                    .execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
            }
            SCHEMA_VERSION => self.create_schema_v1()?,
            _ => return Err(rusqlite::Error::InvalidQuery),
        }
        Ok(())
    }

    fn create_schema_v1(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS airspaces (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                wkt TEXT NOT NULL,
                lower_limit REAL NOT NULL,
                upper_limit REAL NOT NULL,
                centroid_lon REAL NOT NULL,
                centroid_lat REAL NOT NULL,
                CHECK (lower_limit <= upper_limit)
            );

            CREATE TABLE IF NOT EXISTS edges (
                from_name TEXT NOT NULL,
                to_name TEXT NOT NULL,
                weight INTEGER NOT NULL CHECK (weight > 0),
                weight_adjusted REAL NOT NULL CHECK (weight_adjusted >= 0.0),
                PRIMARY KEY (from_name, to_name)
            );

            CREATE INDEX IF NOT EXISTS idx_edges_to_name ON edges(to_name);

            CREATE TABLE IF NOT EXISTS ingested (
                source TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                ingested_at TEXT NOT NULL,
                UNIQUE(source, sha256)
            );
            ",
        )?;
        Ok(())
    }

    /// Replaces the stored airspace index. Once edges exist the airspace
    /// names and their order are fixed.
    pub fn save_airspaces(&self, index: &AirspaceIndex) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        if self.edge_count()? > 0 {
            let stored = Self::airspace_names_on(tx.deref())?;
            let incoming: Vec<&str> = index.names().collect();
            if stored != incoming {
                return Err(rusqlite::Error::InvalidQuery);
            }
        }
        tx.execute("DELETE FROM airspaces", [])?;
        for airspace in index.iter() {
            tx.execute(
                "INSERT INTO airspaces (
                    id, name, wkt, lower_limit, upper_limit, centroid_lon, centroid_lat
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    to_sql_int(airspace.id as u64, "airspace id")?,
                    airspace.name,
                    airspace.wkt,
                    airspace.lower_limit,
                    airspace.upper_limit,
                    airspace.centroid.lon,
                    airspace.centroid.lat
                ],
            )?;
        }
        tx.commit()?;
        info!(count = index.len(), "stored airspace index");
        Ok(())
    }

    pub fn load_airspaces(&self) -> rusqlite::Result<AirspaceIndex> {
        let mut stmt = self.conn.prepare(
            "SELECT name, wkt, lower_limit, upper_limit, centroid_lon, centroid_lat
             FROM airspaces
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(AirspaceRecord {
                name: row.get(0)?,
                wkt: row.get(1)?,
                lower_limit: row.get(2)?,
                upper_limit: row.get(3)?,
                centroid: Some([row.get(4)?, row.get(5)?]),
            });
        }
        AirspaceIndex::from_records(records)
            .map_err(|err| rusqlite::Error::InvalidParameterName(err.to_string()))
    }

    pub fn airspace_count(&self) -> rusqlite::Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM airspaces", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    pub fn edge_count(&self) -> rusqlite::Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Overwrites the stored edges with the graph's. Only normalized graphs
    /// are accepted, so stored adjusted weights are always current.
    pub fn save_graph(&self, graph: &HandoverGraph) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        Self::write_edges(tx.deref(), graph)?;
        tx.commit()?;
        debug!(edges = graph.edge_count(), "stored handover graph");
        Ok(())
    }

    /// Stores a graph together with the ledger rows `(source, sha256)` of
    /// the matrices merged into it. Either all of it lands or none does.
    pub fn save_ingest(
        &self,
        graph: &HandoverGraph,
        sources: &[(String, String)],
    ) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        Self::write_edges(tx.deref(), graph)?;
        let now = now_rfc3339();
        for (source, sha256) in sources {
            Self::insert_ingest(tx.deref(), source, sha256, &now)?;
        }
        tx.commit()?;
        info!(
            edges = graph.edge_count(),
            sources = sources.len(),
            "stored ingest"
        );
        Ok(())
    }

    fn write_edges(conn: &Connection, graph: &HandoverGraph) -> rusqlite::Result<()> {
        if !graph.is_normalized() {
            return Err(rusqlite::Error::InvalidParameterName(
                "graph must be normalized before it is stored".to_string(),
            ));
        }
        conn.execute("DELETE FROM edges", [])?;
        for (from, to, edge) in graph.edges() {
            conn.execute(
                "INSERT INTO edges (from_name, to_name, weight, weight_adjusted)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    from,
                    to,
                    to_sql_int(edge.weight, "weight")?,
                    edge.weight_adjusted
                ],
            )?;
        }
        Ok(())
    }

    /// Nodes come from the stored airspaces, so isolated airspaces survive
    /// the round trip.
    pub fn load_graph(&self) -> rusqlite::Result<HandoverGraph> {
        let mut graph = HandoverGraph::new();
        for name in Self::airspace_names_on(&self.conn)? {
            graph.add_node(&name);
        }

        let mut stmt = self.conn.prepare(
            "SELECT from_name, to_name, weight, weight_adjusted
             FROM edges
             ORDER BY from_name ASC, to_name ASC",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let from: String = row.get(0)?;
            let to: String = row.get(1)?;
            let weight: i64 = row.get(2)?;
            let weight = u64::try_from(weight).map_err(|_| {
                rusqlite::Error::InvalidParameterName(format!(
                    "negative weight {weight} on edge {from} -> {to}"
                ))
            })?;
            graph.restore_edge(
                &from,
                &to,
                HandoverEdge {
                    weight,
                    weight_adjusted: row.get(3)?,
                },
            );
        }
        Ok(graph)
    }

    pub fn record_ingest(&self, source: &str, sha256: &str) -> rusqlite::Result<()> {
        Self::insert_ingest(&self.conn, source, sha256, &now_rfc3339())
    }

    fn insert_ingest(
        conn: &Connection,
        source: &str,
        sha256: &str,
        now: &str,
    ) -> rusqlite::Result<()> {
        if source.is_empty() || sha256.is_empty() {
            return Err(rusqlite::Error::InvalidParameterName(
                "ingest source and digest must not be empty".to_string(),
            ));
        }
        conn.execute(
            "INSERT OR IGNORE INTO ingested (source, sha256, ingested_at) VALUES (?1, ?2, ?3)",
            params![source, sha256, now],
        )?;
        Ok(())
    }

    pub fn has_ingested(&self, source: &str, sha256: &str) -> rusqlite::Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM ingested WHERE source = ?1 AND sha256 = ?2",
                params![source, sha256],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn ingested_sources(&self) -> rusqlite::Result<Vec<IngestRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, sha256, ingested_at
             FROM ingested
             ORDER BY ingested_at ASC, source ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(IngestRecord {
                source: row.get(0)?,
                sha256: row.get(1)?,
                ingested_at: row.get(2)?,
            });
        }
        Ok(out)
    }

    fn airspace_names_on(conn: &Connection) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT name FROM airspaces ORDER BY id ASC")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn to_sql_int(value: u64, what: &str) -> rusqlite::Result<i64> {
    i64::try_from(value)
        .map_err(|_| rusqlite::Error::InvalidParameterName(format!("{what} {value} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build;
    use crate::matrix::TransitionMatrix;

    fn index_of(names: &[&str]) -> AirspaceIndex {
        AirspaceIndex::from_records(names.iter().enumerate().map(|(i, name)| AirspaceRecord {
            name: name.to_string(),
            wkt: format!("POINT ({i} {i})"),
            lower_limit: 0.0,
            upper_limit: 24500.0,
            centroid: Some([i as f64, 50.0]),
        }))
        .expect("index")
    }

    fn sample_graph(index: &AirspaceIndex) -> HandoverGraph {
        let matrix = TransitionMatrix::from_dense(&[
            vec![1, 3, 0],
            vec![2, 0, 0],
            vec![0, 0, 0],
        ])
        .expect("matrix");
        build(index, &matrix).expect("graph")
    }

    #[test]
    fn airspaces_round_trip_in_position_order() {
        let store = GraphStore::open_in_memory().expect("in-memory sqlite");
        let index = index_of(&["ZULU", "ALPHA", "MIKE"]);
        store.save_airspaces(&index).expect("save");

        let loaded = store.load_airspaces().expect("load");
        assert_eq!(loaded.names().collect::<Vec<_>>(), vec!["ZULU", "ALPHA", "MIKE"]);
        let mike = loaded.by_name("MIKE").expect("mike");
        assert_eq!(mike.id, 2);
        assert_eq!(mike.centroid.lon, 2.0);
        assert_eq!(store.airspace_count().expect("count"), 3);
    }

    #[test]
    fn graph_round_trips_including_isolated_nodes() {
        let store = GraphStore::open_in_memory().expect("in-memory sqlite");
        let index = index_of(&["A", "B", "C"]);
        let graph = sample_graph(&index);
        store.save_airspaces(&index).expect("save airspaces");
        store.save_graph(&graph).expect("save graph");

        let loaded = store.load_graph().expect("load graph");
        assert_eq!(loaded, graph);
        assert!(loaded.has_node("C"));
        assert!(loaded.is_normalized());
        assert_eq!(store.edge_count().expect("edges"), 3);
    }

    #[test]
    fn stale_graph_is_not_stored() {
        let store = GraphStore::open_in_memory().expect("in-memory sqlite");
        let index = index_of(&["A", "B", "C"]);
        let mut graph = sample_graph(&index);
        graph.increment_edge("B", "C", 4).expect("increment");
        assert!(store.save_graph(&graph).is_err());
        assert_eq!(store.edge_count().expect("edges"), 0);
    }

    #[test]
    fn airspace_order_is_frozen_once_edges_exist() {
        let store = GraphStore::open_in_memory().expect("in-memory sqlite");
        let index = index_of(&["A", "B", "C"]);
        store.save_airspaces(&index).expect("save airspaces");
        store.save_airspaces(&index_of(&["C", "B", "A"])).expect("reorder while empty");
        store.save_airspaces(&index).expect("restore order");
        store.save_graph(&sample_graph(&index)).expect("save graph");

        let err = store
            .save_airspaces(&index_of(&["C", "B", "A"]))
            .expect_err("reorder with edges");
        assert!(matches!(err, rusqlite::Error::InvalidQuery));
        store.save_airspaces(&index).expect("same order is fine");
    }

    #[test]
    fn ingest_ledger_keys_on_source_and_digest() {
        let store = GraphStore::open_in_memory().expect("in-memory sqlite");
        store.record_ingest("graphs/uk/20240301/0000.matrix.zst", "abc").expect("record");
        store.record_ingest("graphs/uk/20240301/0000.matrix.zst", "abc").expect("repeat");

        assert!(
            store
                .has_ingested("graphs/uk/20240301/0000.matrix.zst", "abc")
                .expect("lookup")
        );
        assert!(
            !store
                .has_ingested("graphs/uk/20240301/0000.matrix.zst", "def")
                .expect("lookup changed content")
        );
        assert_eq!(store.ingested_sources().expect("ledger").len(), 1);
        assert!(store.record_ingest("", "abc").is_err());
    }

    #[test]
    fn failed_ledger_write_rolls_back_the_merged_edges() {
        let store = GraphStore::open_in_memory().expect("in-memory sqlite");
        let index = index_of(&["A", "B", "C"]);
        let stored = sample_graph(&index);
        store.save_airspaces(&index).expect("save airspaces");
        store.save_graph(&stored).expect("save graph");

        let mut merged = stored.clone();
        crate::graph::merge(
            &mut merged,
            &TransitionMatrix::from_dense(&[vec![0, 3, 0], vec![0, 0, 0], vec![0, 0, 0]])
                .expect("delta"),
            &index,
        )
        .expect("merge");
        let sources = vec![
            ("graphs/uk/0000.matrix.zst".to_string(), "abc".to_string()),
            (String::new(), "def".to_string()),
        ];
        assert!(store.save_ingest(&merged, &sources).is_err());
        assert_eq!(store.load_graph().expect("load graph"), stored);
        assert!(store.ingested_sources().expect("ledger").is_empty());

        store
            .save_ingest(&merged, &sources[..1])
            .expect("save ingest");
        let loaded = store.load_graph().expect("reload graph");
        assert_eq!(loaded.edge_weight("A", "B"), 6);
        assert!(
            store
                .has_ingested("graphs/uk/0000.matrix.zst", "abc")
                .expect("lookup")
        );
    }

    #[test]
    fn reopening_a_file_keeps_the_schema_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("graph.sqlite");
        {
            let store = GraphStore::open(&path).expect("create");
            store.save_airspaces(&index_of(&["A"])).expect("save");
        }
        let store = GraphStore::open(&path).expect("reopen");
        assert_eq!(store.airspace_count().expect("count"), 1);
    }
}
