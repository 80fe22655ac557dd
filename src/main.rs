use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{bail, Context};
use sdg_lineage::config::{AppConfig, LogConfig, StoreConfig};
use sdg_lineage::db::ObservationJournal;
use sdg_lineage::handlers::AppState;
use sdg_lineage::pipeline::{run_timestamp, Artifact, Ingestor};
use sdg_lineage::store::SdgStore;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();

    // Check if running in CLI mode
    let cli_mode = if let Some(pos) = args.iter().position(|a| a == "--cli") {
        args.remove(pos);
        true
    } else {
        false
    };

    if cli_mode {
        // One-shot ingestion, logs go to stderr
        run_cli_mode(args).await;
        Ok(())
    } else {
        // Run as HTTP server (with file logging)
        run_server_mode().await
    }
}

fn config_path() -> String {
    env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string())
}

async fn run_server_mode() -> std::io::Result<()> {
    let config_path = config_path();
    let config = AppConfig::from_file(&config_path).map_err(std::io::Error::other)?;

    // The guard flushes the file writer on drop, so it lives as long as the server
    let _guard = init_logging(&config.logging).map_err(std::io::Error::other)?;

    tracing::info!("Loaded configuration from {}", config_path);

    let ingestor = Ingestor::from_config(&config.ingest).map_err(std::io::Error::other)?;
    let mut store = open_store(&config.store).map_err(std::io::Error::other)?;
    match store.load_json(&config.store.snapshot_path) {
        Ok(true) => tracing::info!(
            "Loaded snapshot {} ({} nodes, {} edges)",
            config.store.snapshot_path,
            store.node_count(),
            store.edge_count()
        ),
        Ok(false) => tracing::info!(
            "No snapshot at {}, starting with an empty graph",
            config.store.snapshot_path
        ),
        Err(e) => {
            return Err(std::io::Error::other(format!(
                "Failed to load snapshot {}: {}",
                config.store.snapshot_path, e
            )))
        }
    }

    let state = AppState {
        store: store.into_shared(),
        ingestor,
        snapshot_path: config.store.snapshot_path.clone(),
    };

    sdg_lineage::server::start_server(
        &config.server.host,
        config.server.port,
        config.server.worker_threads,
        state,
    )
    .await
}

fn open_store(config: &StoreConfig) -> anyhow::Result<SdgStore> {
    match &config.sqlite_path {
        Some(path) => {
            let journal = ObservationJournal::open(path, config.pool_size)
                .with_context(|| format!("Failed to open observation journal {}", path))?;
            tracing::info!(
                "Observation journal at {} (pool max_size={})",
                path,
                config.pool_size
            );
            Ok(SdgStore::with_journal(journal))
        }
        None => Ok(SdgStore::new()),
    }
}

fn init_logging(
    config: &LogConfig,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    // Create log directory if it doesn't exist
    fs::create_dir_all(&config.log_dir)?;

    // Daily files, the appender prunes the oldest beyond max_log_files
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("sdg_lineage")
        .filename_suffix("log")
        .max_log_files(config.max_log_files.max(1))
        .build(&config.log_dir)
        .context("Failed to create rolling log file")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Parse log level
    let log_level = config
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    // Build the subscriber with both stdout and file output
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(guard)
}

fn init_cli_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_cli_mode(mut args: Vec<String>) {
    init_cli_logging();

    let pretty = if let Some(pos) = args.iter().position(|a| a == "--pretty" || a == "-p") {
        args.remove(pos);
        true
    } else {
        false
    };
    let output = if let Some(pos) = args.iter().position(|a| a == "--output" || a == "-o") {
        args.remove(pos);
        if pos >= args.len() {
            eprintln!("Missing path after --output");
            std::process::exit(2);
        }
        Some(args.remove(pos))
    } else {
        None
    };

    let artifacts = match read_artifacts(&args) {
        Ok(artifacts) => artifacts,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = run_once(artifacts, pretty, output.as_deref()).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Files named on the command line, or stdin when there are none (or `-`)
fn read_artifacts(args: &[String]) -> anyhow::Result<Vec<Artifact>> {
    if args.is_empty() || (args.len() == 1 && args[0] == "-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        return Ok(vec![Artifact::sql("<stdin>", buf)]);
    }

    let mut artifacts = Vec::with_capacity(args.len());
    for path in args {
        let is_sql = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("sql"));
        if !is_sql {
            bail!(
                "{}: only .sql files are accepted; extract notebook SQL before ingestion",
                path
            );
        }
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        artifacts.push(Artifact::sql(path.as_str(), text));
    }
    Ok(artifacts)
}

async fn run_once(artifacts: Vec<Artifact>, pretty: bool, output: Option<&str>) -> anyhow::Result<()> {
    let config = AppConfig::from_file_or_default(config_path())?;
    let ingestor = Ingestor::from_config(&config.ingest)?;
    let store = open_store(&config.store)?;

    let (store, report) = ingestor
        .ingest_corpus(store, artifacts, &run_timestamp())
        .await?;
    for skipped in &report.skipped {
        eprintln!("Skipped {}: {}", skipped.artifact_id, skipped.reason);
    }

    match output {
        Some(path) => {
            store
                .persist_json(path)
                .with_context(|| format!("Failed to write snapshot to {}", path))?;
            eprintln!(
                "Wrote {} nodes, {} edges to {}",
                store.node_count(),
                store.edge_count(),
                path
            );
        }
        None => {
            let snapshot = store.snapshot_export();
            if pretty {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("{}", serde_json::to_string(&snapshot)?);
            }
        }
    }
    Ok(())
}
