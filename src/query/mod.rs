pub mod handover;

pub use handover::{HandoverAnalyzer, HandoverReport, QueryError, best};
