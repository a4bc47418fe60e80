use std::net::SocketAddr;
use std::sync::Arc;

use admission_gate::{
    AppState,
    clock::SystemClock,
    config::Config,
    router::create_router,
    store::{KeyValueStore, MemoryStore, RedisStore},
    upstream::HttpAnswerer,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().expect("Failed to load configuration");
    let addr = config.bind_addr();

    // 未配置 Redis 时计数和缓存只在本进程内有效
    let store: Arc<dyn KeyValueStore> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(RedisStore::open(url).expect("Invalid REDIS_URL")),
        None => {
            tracing::warn!("REDIS_URL not set, falling back to in-memory store");
            Arc::new(MemoryStore::default())
        }
    };
    let answerer = Arc::new(HttpAnswerer::new(config.upstream_url.clone()));

    let app = create_router(AppState::new(config, store, Arc::new(SystemClock), answerer));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");
    tracing::info!(%addr, "Admission gate listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
