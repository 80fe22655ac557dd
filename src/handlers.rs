use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use std::sync::MutexGuard;

use crate::pipeline::{run_timestamp, Artifact, ArtifactKind, Ingestor, Observation};
use crate::store::{SdgStore, SharedStore};

/// Shared state handed to every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub ingestor: Ingestor,
    pub snapshot_path: String,
}

/// Request model for artifact ingestion
#[derive(Debug, Deserialize)]
pub struct ArtifactRequest {
    pub artifact_id: String,
    pub sql: String,
    #[serde(default)]
    pub kind: ArtifactKind,
}

#[derive(Debug, Serialize)]
pub struct ArtifactResponse {
    pub artifact_id: String,
    pub observations: Vec<Observation>,
    pub nodes: usize,
    pub edges: usize,
}

/// Request model for closure queries
#[derive(Debug, Deserialize)]
pub struct ClosureRequest {
    pub column: String,
    #[serde(default)]
    pub min_prob: f64,
}

#[derive(Debug, Serialize)]
pub struct ClosureResponse {
    pub column: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PersistResponse {
    pub path: String,
    pub nodes: usize,
    pub edges: usize,
}

/// Error response model
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn lock_store(state: &AppState) -> Result<MutexGuard<'_, SdgStore>, HttpResponse> {
    state.store.lock().map_err(|_| {
        tracing::error!("Graph store lock poisoned");
        HttpResponse::InternalServerError().json(ErrorResponse {
            error: "Graph store unavailable".to_string(),
        })
    })
}

/// Handler for ingesting one SQL artifact
pub async fn ingest_artifact(
    state: web::Data<AppState>,
    req: web::Json<ArtifactRequest>,
) -> impl Responder {
    let req = req.into_inner();
    tracing::info!("Ingesting artifact {} ({:?})", req.artifact_id, req.kind);

    let artifact = Artifact {
        id: req.artifact_id,
        text: req.sql,
        kind: req.kind,
    };
    // parsing and scoring happen before the lock is taken
    let observations = state.ingestor.observe(&artifact);
    let ts = run_timestamp();

    let mut store = match lock_store(&state) {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    for o in &observations {
        store.add_edge(&o.src, &o.tgt, o.score, &artifact.id, &ts);
    }

    HttpResponse::Ok().json(ArtifactResponse {
        artifact_id: artifact.id,
        observations,
        nodes: store.node_count(),
        edges: store.edge_count(),
    })
}

/// Handler returning the whole graph as a snapshot document
pub async fn get_snapshot(state: web::Data<AppState>) -> impl Responder {
    match lock_store(&state) {
        Ok(store) => HttpResponse::Ok().json(store.snapshot_export()),
        Err(resp) => resp,
    }
}

/// Handler writing the snapshot to the configured path
pub async fn persist_snapshot(state: web::Data<AppState>) -> impl Responder {
    let store = match lock_store(&state) {
        Ok(store) => store,
        Err(resp) => return resp,
    };

    if let Err(e) = store.persist_json(&state.snapshot_path) {
        tracing::error!("Failed to persist snapshot to {}: {}", state.snapshot_path, e);
        return HttpResponse::InternalServerError().json(ErrorResponse {
            error: "Failed to persist snapshot".to_string(),
        });
    }

    tracing::info!(
        "Persisted snapshot to {} ({} nodes, {} edges)",
        state.snapshot_path,
        store.node_count(),
        store.edge_count()
    );
    HttpResponse::Ok().json(PersistResponse {
        path: state.snapshot_path.clone(),
        nodes: store.node_count(),
        edges: store.edge_count(),
    })
}

/// Handler for the columns reachable from a column
pub async fn downstream(
    state: web::Data<AppState>,
    req: web::Json<ClosureRequest>,
) -> impl Responder {
    match lock_store(&state) {
        Ok(store) => HttpResponse::Ok().json(ClosureResponse {
            columns: store.downstream(&req.column, req.min_prob),
            column: req.into_inner().column,
        }),
        Err(resp) => resp,
    }
}

/// Handler for the columns a column depends on
pub async fn upstream(
    state: web::Data<AppState>,
    req: web::Json<ClosureRequest>,
) -> impl Responder {
    match lock_store(&state) {
        Ok(store) => HttpResponse::Ok().json(ClosureResponse {
            columns: store.upstream(&req.column, req.min_prob),
            column: req.into_inner().column,
        }),
        Err(resp) => resp,
    }
}

/// Health check handler
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("OK")
}
