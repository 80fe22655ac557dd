//! Evidence-fusion graph store: the schema dependency graph itself.
//!
//! Every observation of a `(src, tgt)` dependency is fused into a single edge
//! with noisy-OR, `p' = 1 - (1 - p) * (1 - score)`, and its evidence record is
//! appended to that edge's log. Snapshots are plain JSON documents; reloading
//! one replaces edges instead of fusing them. An optional SQLite journal keeps
//! every individual observation for audit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::db::ObservationJournal;
use crate::error::StoreResult;

/// One observation supporting an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub artifact: String,
    pub score: f64,
    pub ts: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEdge {
    pub src: String,
    pub tgt: String,
    #[serde(default)]
    pub prob: f64,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

/// Serialized form of the whole graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub edges: Vec<SnapshotEdge>,
}

/// Borrowed view of one edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeView<'a> {
    pub src: &'a str,
    pub tgt: &'a str,
    pub prob: f64,
    pub evidence: &'a [Evidence],
}

type NodeId = usize;
type EdgeId = usize;

#[derive(Debug, Clone)]
struct EdgeSlot {
    src: NodeId,
    tgt: NodeId,
    prob: f64,
}

/// The store behind the one lock every concurrent writer goes through.
pub type SharedStore = Arc<Mutex<SdgStore>>;

#[derive(Debug, Default)]
pub struct SdgStore {
    nodes: Vec<String>,
    node_ids: HashMap<String, NodeId>,
    edges: Vec<EdgeSlot>,
    edge_ids: HashMap<(NodeId, NodeId), EdgeId>,
    // evidence log of edge i lives at evidence[i]
    evidence: Vec<Vec<Evidence>>,
    outgoing: Vec<Vec<EdgeId>>,
    incoming: Vec<Vec<EdgeId>>,
    journal: Option<ObservationJournal>,
    journal_failures: usize,
}

/// Noisy-OR combination of an existing probability with a new score.
///
/// Written as `p + s * (1 - p)` so rounding can never take the result
/// below `prob`.
pub fn noisy_or(prob: f64, score: f64) -> f64 {
    clamp_unit(prob + score * (1.0 - prob)).max(prob)
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

impl SdgStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: ObservationJournal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn journal(&self) -> Option<&ObservationJournal> {
        self.journal.as_ref()
    }

    /// Number of observations the journal failed to record.
    pub fn journal_failures(&self) -> usize {
        self.journal_failures
    }

    /// Record one observation of `src -> tgt` and return the fused probability.
    pub fn add_edge(
        &mut self,
        src: &str,
        tgt: &str,
        score: f64,
        artifact_id: &str,
        timestamp: &str,
    ) -> f64 {
        let score = clamp_unit(score);
        let s = self.ensure_node(src);
        let t = self.ensure_node(tgt);
        let evidence = Evidence {
            artifact: artifact_id.to_string(),
            score,
            ts: timestamp.to_string(),
        };

        let prob = match self.edge_ids.get(&(s, t)) {
            Some(&id) => {
                let slot = &mut self.edges[id];
                slot.prob = noisy_or(slot.prob, score);
                self.evidence[id].push(evidence.clone());
                slot.prob
            }
            None => {
                self.insert_edge(s, t, score, vec![evidence.clone()]);
                score
            }
        };

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(src, tgt, &evidence) {
                self.journal_failures += 1;
                tracing::error!("Failed to journal observation {} -> {}: {}", src, tgt, e);
            }
        }
        prob
    }

    fn ensure_node(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.node_ids.get(name) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(name.to_string());
        self.node_ids.insert(name.to_string(), id);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        id
    }

    fn insert_edge(&mut self, src: NodeId, tgt: NodeId, prob: f64, evidence: Vec<Evidence>) {
        let id = self.edges.len();
        self.edges.push(EdgeSlot { src, tgt, prob });
        self.evidence.push(evidence);
        self.edge_ids.insert((src, tgt), id);
        self.outgoing[src].push(id);
        self.incoming[tgt].push(id);
    }

    fn view(&self, id: EdgeId) -> EdgeView<'_> {
        let slot = &self.edges[id];
        EdgeView {
            src: &self.nodes[slot.src],
            tgt: &self.nodes[slot.tgt],
            prob: slot.prob,
            evidence: &self.evidence[id],
        }
    }

    pub fn edge(&self, src: &str, tgt: &str) -> Option<EdgeView<'_>> {
        let s = *self.node_ids.get(src)?;
        let t = *self.node_ids.get(tgt)?;
        self.edge_ids.get(&(s, t)).map(|&id| self.view(id))
    }

    /// Edges in creation order.
    pub fn edges(&self) -> impl Iterator<Item = EdgeView<'_>> + '_ {
        (0..self.edges.len()).map(move |id| self.view(id))
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn snapshot_export(&self) -> Snapshot {
        Snapshot {
            nodes: self.nodes.clone(),
            edges: self
                .edges()
                .map(|e| SnapshotEdge {
                    src: e.src.to_string(),
                    tgt: e.tgt.to_string(),
                    prob: e.prob,
                    evidence: e.evidence.to_vec(),
                })
                .collect(),
        }
    }

    /// Merge a snapshot. An edge already present is replaced wholesale by the
    /// imported record; nothing is fused and nothing is journaled.
    pub fn snapshot_import(&mut self, snapshot: Snapshot) {
        for node in &snapshot.nodes {
            self.ensure_node(node);
        }
        for edge in snapshot.edges {
            let s = self.ensure_node(&edge.src);
            let t = self.ensure_node(&edge.tgt);
            let prob = clamp_unit(edge.prob);
            match self.edge_ids.get(&(s, t)) {
                Some(&id) => {
                    self.edges[id].prob = prob;
                    self.evidence[id] = edge.evidence;
                }
                None => self.insert_edge(s, t, prob, edge.evidence),
            }
        }
    }

    /// Write the snapshot to `path`, replacing any previous file atomically.
    pub fn persist_json<P: AsRef<Path>>(&self, path: P) -> StoreResult<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &self.snapshot_export())?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;
        tracing::info!(
            "Persisted {} nodes / {} edges to {:?}",
            self.node_count(),
            self.edge_count(),
            path
        );
        Ok(())
    }

    /// Import the snapshot at `path`. Returns `false` when there is no file.
    pub fn load_json<P: AsRef<Path>>(&mut self, path: P) -> StoreResult<bool> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(false);
        }
        let text = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&text)?;
        self.snapshot_import(snapshot);
        Ok(true)
    }

    /// Every column reachable from `column` along edges with
    /// `prob >= min_prob`, nearest first.
    pub fn downstream(&self, column: &str, min_prob: f64) -> Vec<String> {
        self.closure(column, min_prob, |store, node| {
            store.outgoing[node]
                .iter()
                .map(|&e| (store.edges[e].tgt, store.edges[e].prob))
                .collect()
        })
    }

    /// Every column `column` transitively derives from.
    pub fn upstream(&self, column: &str, min_prob: f64) -> Vec<String> {
        self.closure(column, min_prob, |store, node| {
            store.incoming[node]
                .iter()
                .map(|&e| (store.edges[e].src, store.edges[e].prob))
                .collect()
        })
    }

    fn closure<F>(&self, column: &str, min_prob: f64, next: F) -> Vec<String>
    where
        F: Fn(&Self, NodeId) -> Vec<(NodeId, f64)>,
    {
        let Some(&start) = self.node_ids.get(column) else {
            return Vec::new();
        };
        let mut seen: HashSet<NodeId> = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(node) = queue.pop_front() {
            for (other, prob) in next(self, node) {
                if prob >= min_prob && seen.insert(other) {
                    out.push(self.nodes[other].clone());
                    queue.push_back(other);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    const TS: &str = "2024-01-01T00:00:00+00:00";

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_noisy_or_half_and_half() {
        let mut store = SdgStore::new();
        assert_eq!(store.add_edge("a.x", "v.x", 0.5, "f1.sql", TS), 0.5);
        let p = store.add_edge("a.x", "v.x", 0.5, "f2.sql", TS);
        assert!(close(p, 0.75));
        assert_eq!(store.edge_count(), 1);
        assert_eq!(store.node_count(), 2);
    }

    #[test]
    fn test_fusion_order_does_not_matter() {
        let scores = [0.1, 0.35, 0.8, 0.0, 0.42];
        let mut forward = SdgStore::new();
        let mut backward = SdgStore::new();
        for s in scores {
            forward.add_edge("s", "t", s, "a", TS);
        }
        for s in scores.iter().rev() {
            backward.add_edge("s", "t", *s, "a", TS);
        }
        let pf = forward.edge("s", "t").map(|e| e.prob).unwrap_or(-1.0);
        let pb = backward.edge("s", "t").map(|e| e.prob).unwrap_or(-2.0);
        assert!((pf - pb).abs() < 1e-9);
    }

    #[test]
    fn test_probability_monotone_and_bounded() {
        let mut store = SdgStore::new();
        let mut last = 0.0;
        for s in [0.2, 0.0, 0.9, 1.0, 0.5, 1.7, -3.0, f64::NAN] {
            let p = store.add_edge("s", "t", s, "a", TS);
            assert!(p >= last, "{} < {}", p, last);
            assert!((0.0..=1.0).contains(&p));
            last = p;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn test_zero_score_keeps_probability() {
        for p in [0.2, 0.1, 0.3, 0.7, 1.0 / 3.0] {
            assert_eq!(noisy_or(p, 0.0), p);
            assert!(noisy_or(p, 1e-17) >= p);
        }
        let mut store = SdgStore::new();
        store.add_edge("s", "t", 0.2, "a", TS);
        assert_eq!(store.add_edge("s", "t", 0.0, "b", TS), 0.2);
    }

    #[test]
    fn test_evidence_appended_in_arrival_order() {
        let mut store = SdgStore::new();
        store.add_edge("s", "t", 0.3, "first", "t1");
        store.add_edge("s", "t", 0.4, "second", "t2");
        store.add_edge("s", "u", 0.4, "other", "t3");
        store.add_edge("s", "t", 0.5, "third", "t4");
        let edge = store.edge("s", "t").expect("edge");
        let artifacts: Vec<&str> = edge.evidence.iter().map(|e| e.artifact.as_str()).collect();
        assert_eq!(artifacts, vec!["first", "second", "third"]);
        assert_eq!(store.nodes(), &["s".to_string(), "t".to_string(), "u".to_string()]);
    }

    #[test]
    fn test_snapshot_round_trip_into_fresh_store() {
        let mut store = SdgStore::new();
        store.add_edge("a.id", "v.id", 1.0, "x.sql", TS);
        store.add_edge("b.name", "v.name", 0.5, "x.sql", TS);
        store.add_edge("b.name", "v.name", 0.2, "y.sql", TS);

        let mut fresh = SdgStore::new();
        fresh.snapshot_import(store.snapshot_export());

        let triples = |s: &SdgStore| {
            s.edges()
                .map(|e| (e.src.to_string(), e.tgt.to_string(), e.prob))
                .collect::<Vec<_>>()
        };
        assert_eq!(fresh.nodes(), store.nodes());
        assert_eq!(triples(&fresh), triples(&store));
        assert_eq!(fresh.snapshot_export(), store.snapshot_export());
    }

    #[test]
    fn test_import_replaces_instead_of_fusing() {
        let mut store = SdgStore::new();
        store.add_edge("s", "t", 0.5, "live", TS);
        store.snapshot_import(Snapshot {
            nodes: vec!["s".to_string(), "t".to_string(), "lonely".to_string()],
            edges: vec![SnapshotEdge {
                src: "s".to_string(),
                tgt: "t".to_string(),
                prob: 0.2,
                evidence: vec![Evidence {
                    artifact: "old".to_string(),
                    score: 0.2,
                    ts: TS.to_string(),
                }],
            }],
        });
        let edge = store.edge("s", "t").expect("edge");
        assert_eq!(edge.prob, 0.2);
        assert_eq!(edge.evidence.len(), 1);
        assert_eq!(edge.evidence[0].artifact, "old");
        assert_eq!(store.edge_count(), 1);
        assert_eq!(store.node_count(), 3);

        // live observations fuse on top of the imported record
        let p = store.add_edge("s", "t", 0.5, "live2", TS);
        assert!(close(p, 0.6));
    }

    #[test]
    fn test_snapshot_json_shape() -> Result<()> {
        let mut store = SdgStore::new();
        store.add_edge("a.x", "v.x", 0.25, "f.sql", TS);
        let value = serde_json::to_value(store.snapshot_export())?;
        assert_eq!(
            value,
            serde_json::json!({
                "nodes": ["a.x", "v.x"],
                "edges": [{
                    "src": "a.x",
                    "tgt": "v.x",
                    "prob": 0.25,
                    "evidence": [{"artifact": "f.sql", "score": 0.25, "ts": TS}]
                }]
            })
        );
        Ok(())
    }

    #[test]
    fn test_persist_and_load_json_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sdg.json");

        let mut store = SdgStore::new();
        store.add_edge("a.x", "v.x", 0.7, "f.sql", TS);
        store.persist_json(&path)?;
        // overwrite keeps a readable file
        store.add_edge("a.y", "v.y", 0.4, "f.sql", TS);
        store.persist_json(&path)?;

        let mut loaded = SdgStore::new();
        assert!(loaded.load_json(&path)?);
        assert_eq!(loaded.snapshot_export(), store.snapshot_export());

        let mut untouched = SdgStore::new();
        assert!(!untouched.load_json(dir.path().join("missing.json"))?);
        assert_eq!(untouched.node_count(), 0);
        Ok(())
    }

    #[test]
    fn test_load_json_tolerates_missing_fields() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"edges": [{"src": "a", "tgt": "b"}]}"#)?;
        let mut store = SdgStore::new();
        store.load_json(&path)?;
        let edge = store.edge("a", "b").expect("edge");
        assert_eq!(edge.prob, 0.0);
        assert!(edge.evidence.is_empty());
        Ok(())
    }

    #[test]
    fn test_journal_records_each_observation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let url = dir.path().join("sdg.sqlite3");
        let journal = ObservationJournal::open(&url.to_string_lossy(), 1)?;
        let mut store = SdgStore::with_journal(journal);

        store.add_edge("s", "t", 0.5, "one.sql", "t1");
        store.add_edge("s", "t", 0.5, "two.sql", "t2");

        let rows = store.journal().expect("journal").observations()?;
        assert_eq!(rows.len(), 2);
        // individual scores, not the fused 0.75
        assert_eq!(rows[1].prob, 0.5);
        assert_eq!(rows[1].ts, "t2");
        let ev: Vec<Evidence> = serde_json::from_str(&rows[1].evidence)?;
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].artifact, "two.sql");
        assert_eq!(store.journal_failures(), 0);
        Ok(())
    }

    #[test]
    fn test_journal_failure_keeps_in_memory_update() -> Result<()> {
        use diesel::prelude::*;
        use diesel::sqlite::SqliteConnection;

        let dir = tempfile::tempdir()?;
        let url = dir.path().join("sdg.sqlite3").to_string_lossy().to_string();
        let mut store = SdgStore::with_journal(ObservationJournal::open(&url, 1)?);
        store.add_edge("s", "t", 0.5, "one.sql", "t1");

        // pull the table out from under the journal's pool
        let mut conn = SqliteConnection::establish(&url)?;
        diesel::sql_query("DROP TABLE edge_observations").execute(&mut conn)?;

        let p = store.add_edge("s", "t", 0.5, "two.sql", "t2");
        assert!(close(p, 0.75));
        assert_eq!(store.journal_failures(), 1);
        let edge = store.edge("s", "t").expect("edge");
        assert_eq!(edge.evidence.len(), 2);
        assert!(store.journal().expect("journal").observations().is_err());
        Ok(())
    }

    #[test]
    fn test_downstream_and_upstream_closure() {
        let mut store = SdgStore::new();
        store.add_edge("raw.id", "stg.id", 1.0, "a", TS);
        store.add_edge("stg.id", "mart.id", 0.9, "a", TS);
        store.add_edge("stg.id", "mart.key", 0.1, "a", TS);
        store.add_edge("mart.id", "report.id", 1.0, "a", TS);

        assert_eq!(
            store.downstream("raw.id", 0.0),
            vec!["stg.id", "mart.id", "mart.key", "report.id"]
        );
        assert_eq!(
            store.downstream("raw.id", 0.5),
            vec!["stg.id", "mart.id", "report.id"]
        );
        assert_eq!(
            store.upstream("report.id", 0.0),
            vec!["mart.id", "stg.id", "raw.id"]
        );
        assert!(store.downstream("nope", 0.0).is_empty());
    }
}
