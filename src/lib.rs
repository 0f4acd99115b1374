pub mod airspace;
pub mod config;
pub mod confidence;
pub mod engine;
pub mod graph;
pub mod logging;
pub mod matrix;
pub mod query;
pub mod store;
