use std::sync::Arc;

use conveyor_core::blob::LocalBlobStore;
use conveyor_core::engine::Engine;
use conveyor_core::stage::StageRegistry;
use conveyor_core::store::RecordStore;
use conveyor_core::store_memory::MemoryStore;
use conveyor_server::http;
use conveyor_server::queue::LoopbackQueue;
use tracing_subscriber::EnvFilter;

const BASE_PATH: &str = "/_ah/pipeline";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let listen_addr = arg_or_env("--listen", "LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let blob_dir = arg_or_env("--blob-dir", "BLOB_DIR").unwrap_or_else(|| "./conveyor-blobs".to_string());
    let database_url = arg_or_env("--database-url", "DATABASE_URL");

    let store: Arc<dyn RecordStore> = match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = conveyor_core::store_postgres::PostgresStore::new(pool);
            pg.migrate().await?;
            tracing::info!("Using PostgresStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "--database-url / DATABASE_URL set but postgres feature not enabled, using MemoryStore"
            );
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("Using MemoryStore (no database URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    // Stage classes are registered at process start; a deployment embeds
    // this server and registers its own stages before serving.
    let registry = Arc::new(StageRegistry::new());
    if registry.class_paths().is_empty() {
        tracing::warn!("no stage classes registered; only status RPCs will be useful");
    }

    let queue = Arc::new(LoopbackQueue::new());
    let blobs = Arc::new(LocalBlobStore::new(blob_dir));
    let engine = Arc::new(Engine::new(store, queue.clone(), blobs, registry));
    queue.bind(engine.clone());

    let app = http::router(engine, BASE_PATH);
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!("conveyor server listening on {listen_addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Read a setting from `--flag <value>` argv, falling back to an env var.
fn arg_or_env(flag: &str, env: &str) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(value) = args
        .windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
    {
        return Some(value);
    }
    std::env::var(env).ok()
}
