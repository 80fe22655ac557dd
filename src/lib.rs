//! Column-level lineage from SQL artifacts into a probabilistic schema
//! dependency graph.
//!
//! An artifact flows through [`parser`] (SQL text to a small AST),
//! [`extract`] (CTAS, views and `INSERT ... SELECT`), [`resolve`] (output
//! column to input columns) and [`similarity`] (name confidence), and the
//! scored dependencies are fused into the [`store::SdgStore`] with noisy-OR.
//! [`pipeline`] ties these together for single artifacts and whole corpora.

pub mod ast;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod resolve;
pub mod schema;
pub mod server;
pub mod similarity;
pub mod store;

pub use ast::{Node, NodeKind};
pub use error::{StoreError, StoreResult};
pub use extract::{extract_definitions, LineageConstruct};
pub use parser::{parse, SqlParser};
pub use pipeline::{Artifact, ArtifactKind, CorpusReport, Ingestor, Observation};
pub use resolve::{resolve, resolve_with_columns, Catalog, ColumnMapping, OutputColumn};
pub use similarity::score;
pub use store::{noisy_or, SdgStore, SharedStore, Snapshot};
