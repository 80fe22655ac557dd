//! Per-artifact processing: parse, extract, resolve, score, store.
//!
//! Everything up to scoring is pure and runs per artifact; only the final
//! `add_edge` calls touch the shared graph. [`Ingestor::ingest_corpus`] fans
//! artifacts out to blocking workers and funnels their observation batches
//! through one writer task, so batches keep their internal order while the
//! order between artifacts is whatever order they finish in.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::ast::Node;
use crate::config::IngestConfig;
use crate::extract::extract_definitions;
use crate::parser::SqlParser;
use crate::resolve::{resolve_with_columns, Catalog};
use crate::similarity;
use crate::store::SdgStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    #[default]
    Sql,
    /// SQL lifted out of a notebook cell or script by an upstream extractor.
    NotebookSqlFragment,
}

/// Plain SQL text from one source artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub kind: ArtifactKind,
}

impl Artifact {
    pub fn sql(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            kind: ArtifactKind::Sql,
        }
    }
}

/// One scored `src -> tgt` dependency seen in an artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub src: String,
    pub tgt: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedArtifact {
    pub artifact_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorpusReport {
    pub processed: usize,
    pub observations: usize,
    pub skipped: Vec<SkippedArtifact>,
}

struct Batch {
    artifact_id: String,
    observations: Vec<Observation>,
}

/// Timestamp stamped on every observation of one run.
pub fn run_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    catalog: Option<Arc<Catalog>>,
    dialect: String,
    notebook_weight: f64,
    workers: usize,
    artifact_timeout: Option<Duration>,
}

impl Default for Ingestor {
    fn default() -> Self {
        Self {
            catalog: None,
            dialect: "generic".to_string(),
            notebook_weight: 0.6,
            workers: 4,
            artifact_timeout: None,
        }
    }
}

impl Ingestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let catalog = match &config.catalog_path {
            Some(path) => {
                let catalog = Catalog::from_file(path)?;
                tracing::info!("Loaded catalog with {} tables from {}", catalog.len(), path);
                Some(catalog)
            }
            None => None,
        };
        Ok(Self {
            catalog: catalog.map(Arc::new),
            dialect: config.dialect.clone(),
            notebook_weight: config.notebook_weight,
            workers: config.workers,
            artifact_timeout: config.artifact_timeout_secs.map(Duration::from_secs),
        })
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(Arc::new(catalog));
        self
    }

    pub fn with_dialect(mut self, dialect: &str) -> Self {
        self.dialect = dialect.to_string();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.artifact_timeout = timeout;
        self
    }

    fn weight(&self, kind: ArtifactKind) -> f64 {
        match kind {
            ArtifactKind::Sql => 1.0,
            ArtifactKind::NotebookSqlFragment => self.notebook_weight,
        }
    }

    /// All scored dependencies in `artifact`, in statement order.
    ///
    /// `CREATE TABLE (...)` schemas seen earlier in the same artifact extend
    /// the catalog for the statements after them.
    pub fn observe(&self, artifact: &Artifact) -> Vec<Observation> {
        let parser = SqlParser::new(&self.dialect);
        let asts = parser.parse(&artifact.text);
        if asts.is_empty() && !artifact.text.trim().is_empty() {
            tracing::warn!("No statements recovered from {}", artifact.id);
        }

        let weight = self.weight(artifact.kind);
        let mut catalog: Option<Cow<'_, Catalog>> = self.catalog.as_deref().map(Cow::Borrowed);
        let mut out = Vec::new();

        for ast in &asts {
            let constructs = extract_definitions(ast);
            for construct in &constructs {
                let mapping =
                    resolve_with_columns(construct.select, catalog.as_deref(), &construct.columns);
                for column in &mapping {
                    let tgt = match &construct.target {
                        Some(target) => format!("{}.{}", target, column.name),
                        None => column.name.clone(),
                    };
                    for input in &column.inputs {
                        let input_column = input.rsplit('.').next().unwrap_or(input);
                        out.push(Observation {
                            src: input.clone(),
                            tgt: tgt.clone(),
                            score: weight * similarity::score(&column.name, input_column),
                        });
                    }
                }
            }
            if matches!(ast, Node::Create { columns, .. } if !columns.is_empty()) {
                catalog
                    .get_or_insert_with(|| Cow::Owned(Catalog::new()))
                    .to_mut()
                    .record_ddl(ast);
            }
        }
        tracing::debug!("{}: {} observations", artifact.id, out.len());
        out
    }

    /// Process one artifact synchronously into `store`; returns the number
    /// of observations applied.
    pub fn ingest_artifact(&self, store: &mut SdgStore, artifact: &Artifact, ts: &str) -> usize {
        let observations = self.observe(artifact);
        for o in &observations {
            store.add_edge(&o.src, &o.tgt, o.score, &artifact.id, ts);
        }
        observations.len()
    }

    /// Process artifacts one after another, in order.
    pub fn ingest_all(&self, store: &mut SdgStore, artifacts: &[Artifact], ts: &str) -> CorpusReport {
        let mut report = CorpusReport::default();
        for artifact in artifacts {
            report.observations += self.ingest_artifact(store, artifact, ts);
            report.processed += 1;
        }
        report
    }

    /// Process artifacts in parallel with a single writer owning `store`.
    ///
    /// A worker that panics or exceeds the per-artifact timeout only skips
    /// its artifact. A timed-out worker is abandoned, not interrupted.
    pub async fn ingest_corpus(
        &self,
        store: SdgStore,
        artifacts: Vec<Artifact>,
        ts: &str,
    ) -> Result<(SdgStore, CorpusReport)> {
        let workers = self.workers.max(1);
        let (tx, mut rx) = mpsc::channel::<Batch>(workers * 2);

        let ts = ts.to_string();
        // journal writes are synchronous SQLite calls, keep them off the runtime
        let writer = tokio::task::spawn_blocking(move || {
            let mut store = store;
            while let Some(batch) = rx.blocking_recv() {
                for o in &batch.observations {
                    store.add_edge(&o.src, &o.tgt, o.score, &batch.artifact_id, &ts);
                }
            }
            store
        });

        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for artifact in artifacts {
            let ingestor = self.clone();
            let tx = tx.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let id = artifact.id.clone();
                let limit = ingestor.artifact_timeout;
                let work = tokio::task::spawn_blocking(move || ingestor.observe(&artifact));

                let joined = match limit {
                    Some(limit) => match tokio::time::timeout(limit, work).await {
                        Ok(joined) => joined,
                        Err(_) => return Err((id, format!("timed out after {:?}", limit))),
                    },
                    None => work.await,
                };
                let observations = joined.map_err(|e| (id.clone(), format!("worker failed: {}", e)))?;
                let count = observations.len();
                tx.send(Batch {
                    artifact_id: id.clone(),
                    observations,
                })
                .await
                .map_err(|_| (id, "writer stopped".to_string()))?;
                Ok::<usize, (String, String)>(count)
            });
        }
        drop(tx);

        let mut report = CorpusReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(count)) => {
                    report.processed += 1;
                    report.observations += count;
                }
                Ok(Err((artifact_id, reason))) => {
                    tracing::warn!("Skipping artifact {}: {}", artifact_id, reason);
                    report.skipped.push(SkippedArtifact { artifact_id, reason });
                }
                Err(e) => tracing::warn!("Artifact task aborted: {}", e),
            }
        }

        let store = writer.await.context("Graph writer task failed")?;
        tracing::info!(
            "Ingested {} artifacts ({} skipped), {} observations, graph has {} nodes / {} edges",
            report.processed,
            report.skipped.len(),
            report.observations,
            store.node_count(),
            store.edge_count()
        );
        Ok((store, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TS: &str = "2024-01-01T00:00:00.000000Z";

    fn obs(src: &str, tgt: &str, score: f64) -> Observation {
        Observation {
            src: src.to_string(),
            tgt: tgt.to_string(),
            score,
        }
    }

    #[test]
    fn test_view_observations() {
        let artifact = Artifact::sql(
            "v.sql",
            "CREATE VIEW v AS SELECT a.id AS id, b.name AS name FROM a JOIN b ON a.id=b.aid;",
        );
        assert_eq!(
            Ingestor::new().observe(&artifact),
            vec![obs("a.id", "v.id", 1.0), obs("b.name", "v.name", 1.0)]
        );
    }

    #[test]
    fn test_scores_use_column_part_of_input() {
        let artifact = Artifact::sql(
            "t.sql",
            "CREATE TABLE t AS SELECT o.customer_id AS customer_key, o.amount AS amt FROM orders o",
        );
        let got = Ingestor::new().observe(&artifact);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].src, "orders.customer_id");
        assert_eq!(got[0].tgt, "t.customer_key");
        assert!((got[0].score - 0.5).abs() < 1e-9);
        // no shared token: character ratio of "amt" vs "amount"
        assert!((got[1].score - 6.0 / 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_notebook_fragments_are_down_weighted() {
        let artifact = Artifact {
            id: "nb.ipynb#3".to_string(),
            text: "INSERT INTO t SELECT id FROM s".to_string(),
            kind: ArtifactKind::NotebookSqlFragment,
        };
        let got = Ingestor::new().observe(&artifact);
        assert_eq!(got.len(), 1);
        assert!((got[0].score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_wildcard_and_literal_outputs() {
        let artifact = Artifact::sql(
            "w.sql",
            "CREATE VIEW w AS SELECT * FROM t; CREATE VIEW k AS SELECT 1 AS one FROM t;",
        );
        // the sentinel is observed with zero confidence, the literal not at all
        assert_eq!(Ingestor::new().observe(&artifact), vec![obs("*", "w.*", 0.0)]);
    }

    #[test]
    fn test_ddl_in_same_artifact_expands_wildcards() {
        let artifact = Artifact::sql(
            "d.sql",
            "CREATE TABLE t (x INT, y INT); CREATE VIEW w AS SELECT * FROM t;",
        );
        let srcs: Vec<String> = Ingestor::new()
            .observe(&artifact)
            .into_iter()
            .map(|o| o.src)
            .collect();
        assert_eq!(srcs, vec!["t.x", "t.y"]);
    }

    #[test]
    fn test_target_column_list_renames_outputs() {
        let artifact = Artifact::sql("i.sql", "INSERT INTO t (k, v) SELECT s.id, s.val FROM s");
        let tgts: Vec<String> = Ingestor::new()
            .observe(&artifact)
            .into_iter()
            .map(|o| o.tgt)
            .collect();
        assert_eq!(tgts, vec!["t.k", "t.v"]);
    }

    #[test]
    fn test_target_column_list_survives_duplicate_names() {
        let artifact = Artifact::sql(
            "dup.sql",
            "INSERT INTO t (x, y) SELECT a.id, b.id FROM a JOIN b ON a.k = b.k",
        );
        let edges: Vec<(String, String)> = Ingestor::new()
            .observe(&artifact)
            .into_iter()
            .map(|o| (o.src, o.tgt))
            .collect();
        assert_eq!(
            edges,
            vec![
                ("a.id".to_string(), "t.x".to_string()),
                ("b.id".to_string(), "t.y".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_timed_out_artifact_is_skipped() -> Result<()> {
        let big: String = (0..3000)
            .map(|i| format!("INSERT INTO t{i} SELECT a.c{i} AS c{i} FROM a;\n"))
            .collect();
        let artifacts = vec![
            Artifact::sql("big.sql", big),
            Artifact::sql("small.sql", "CREATE VIEW v AS SELECT s.id AS id FROM s"),
        ];
        let ingestor = Ingestor::new()
            .with_workers(2)
            .with_timeout(Some(Duration::from_nanos(1)));

        let (store, report) = ingestor
            .ingest_corpus(SdgStore::new(), artifacts, TS)
            .await?;

        assert!(report
            .skipped
            .iter()
            .any(|s| s.artifact_id == "big.sql" && s.reason.starts_with("timed out")));
        assert_eq!(report.processed + report.skipped.len(), 2);
        // nothing from the skipped artifact reaches the graph
        assert!(store
            .edges()
            .all(|e| e.evidence.iter().all(|ev| ev.artifact != "big.sql")));
        assert_eq!(store.edge_count(), report.observations);
        Ok(())
    }

    #[test]
    fn test_ingest_artifact_fuses_repeats() {
        let ingestor = Ingestor::new();
        let mut store = SdgStore::new();
        let a = Artifact::sql("one.sql", "CREATE VIEW v AS SELECT s.val AS val_x FROM s");
        let b = Artifact::sql("two.sql", "INSERT INTO v SELECT s.val AS val_x FROM s");
        let report = ingestor.ingest_all(&mut store, &[a, b], TS);
        assert_eq!(report.processed, 2);
        assert_eq!(report.observations, 2);
        let edge = store.edge("s.val", "v.val_x").expect("edge");
        assert!((edge.prob - 0.75).abs() < 1e-9);
        assert_eq!(edge.evidence.len(), 2);
        assert_eq!(edge.evidence[0].artifact, "one.sql");
    }

    #[tokio::test]
    async fn test_ingest_corpus_parallel_matches_sequential() -> Result<()> {
        let artifacts = vec![
            Artifact::sql("a.sql", "CREATE VIEW v AS SELECT s.val AS val_x FROM s"),
            Artifact::sql("broken.sql", "CREATE VIEW AS SELEC FROM"),
            Artifact::sql("b.sql", "INSERT INTO v SELECT s.val AS val_x FROM s"),
            Artifact::sql("c.sql", "CREATE TABLE w AS SELECT x.k AS k FROM x"),
        ];
        let ingestor = Ingestor::new().with_workers(3);

        let (parallel, report) = ingestor
            .ingest_corpus(SdgStore::new(), artifacts.clone(), TS)
            .await?;
        assert_eq!(report.processed, 4);
        assert!(report.skipped.is_empty());
        assert_eq!(report.observations, 3);

        let mut sequential = SdgStore::new();
        ingestor.ingest_all(&mut sequential, &artifacts, TS);

        let mut p: Vec<(String, String, f64)> = parallel
            .edges()
            .map(|e| (e.src.to_string(), e.tgt.to_string(), e.prob))
            .collect();
        let mut s: Vec<(String, String, f64)> = sequential
            .edges()
            .map(|e| (e.src.to_string(), e.tgt.to_string(), e.prob))
            .collect();
        p.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        s.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        assert_eq!(p.len(), s.len());
        for (x, y) in p.iter().zip(&s) {
            assert_eq!((&x.0, &x.1), (&y.0, &y.1));
            assert!((x.2 - y.2).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_artifact_kind_serde() -> Result<()> {
        let a: Artifact = serde_json::from_str(
            r#"{"id": "n", "text": "SELECT 1", "kind": "notebook_sql_fragment"}"#,
        )?;
        assert_eq!(a.kind, ArtifactKind::NotebookSqlFragment);
        let b: Artifact = serde_json::from_str(r#"{"id": "s", "text": "SELECT 1"}"#)?;
        assert_eq!(b.kind, ArtifactKind::Sql);
        Ok(())
    }
}
