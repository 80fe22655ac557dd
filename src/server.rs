use actix_web::{middleware, web, App, HttpServer};
use std::io;

use crate::handlers::{
    downstream, get_snapshot, health_check, ingest_artifact, persist_snapshot, upstream, AppState,
};

/// Register every route on an app
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/artifacts", web::post().to(ingest_artifact))
        .route("/snapshot", web::get().to(get_snapshot))
        .route("/snapshot/persist", web::post().to(persist_snapshot))
        .route("/downstream", web::post().to(downstream))
        .route("/upstream", web::post().to(upstream));
}

/// Start the HTTP server
pub async fn start_server(host: &str, port: u16, workers: usize, state: AppState) -> io::Result<()> {
    let bind_addr = format!("{}:{}", host, port);

    tracing::info!("Starting server on {} with {} workers", bind_addr, workers);

    let state = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .workers(workers)
    .bind(&bind_addr)?
    .run()
    .await
}
