mod config;
mod db;
mod frame;
mod geometry;
mod model;
mod routes;
mod services;
mod state;
mod store;

use std::sync::Arc;

use crate::config::CanvasConfig;
use crate::services::delta::VectorDeltas;
use crate::store::{CanvasStore, MemoryStore, PgStore};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");
    let config = CanvasConfig::from_env();

    let store: Arc<dyn CanvasStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = db::init_pool(&database_url)
                .await
                .expect("database init failed");
            Arc::new(PgStore::new(pool))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; canvas state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let deltas = Arc::new(VectorDeltas::new(config.tile_size));
    let state = state::AppState::new(config, store, deltas);

    // Spawn background update flusher.
    let _flusher = services::broadcast::spawn_flush_task(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, tile_size = config.tile_size, "bigcanvas listening");
    axum::serve(listener, app).await.expect("server failed");
}
