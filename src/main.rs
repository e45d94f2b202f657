use axum::{
    routing::{get, post},
    Router,
};
use lead_qualifier::batch::BatchOrchestrator;
use lead_qualifier::cache_store::{CacheStore, MemoryCacheStore};
use lead_qualifier::config::{Config, PipelineConfig};
use lead_qualifier::db::Database;
use lead_qualifier::handlers::{self, AppState};
use lead_qualifier::persistence::PersistenceSink;
use lead_qualifier::scoring_client::{LeadScorer, ScoringClient};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MEMORY_CACHE_CAPACITY: u64 = 50_000;

/// Starts the lead qualification service.
///
/// Without a database the cache is process-local and outcomes are not persisted. Without
/// an API key the service still starts, but analysis endpoints answer 500.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lead_qualifier=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let pipeline = PipelineConfig::from_env()?;

    let (cache, sink): (Arc<dyn CacheStore>, Option<Arc<dyn PersistenceSink>>) =
        match config.database_url {
            Some(ref url) => {
                let db = Database::new(url).await?;
                tracing::info!("Database connection pool established");
                let cache: Arc<dyn CacheStore> = Arc::new(db.cache_store(pipeline.cache_ttl).await?);
                let sink: Arc<dyn PersistenceSink> = Arc::new(db.persistence_sink());
                (cache, Some(sink))
            }
            None => {
                let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new(
                    pipeline.cache_ttl,
                    MEMORY_CACHE_CAPACITY,
                ));
                (cache, None)
            }
        };

    let orchestrator = match ScoringClient::new(&config, &pipeline) {
        Ok(client) => {
            tracing::info!("✓ Scoring client initialized: {}", client.model());
            let scorer: Arc<dyn LeadScorer> = Arc::new(client);
            Some(Arc::new(BatchOrchestrator::new(
                scorer,
                cache,
                sink,
                pipeline.clone(),
            )))
        }
        Err(e) => {
            tracing::error!("Scoring disabled: {}", e);
            None
        }
    };

    let shutdown = CancellationToken::new();
    let app_state = Arc::new(AppState {
        config: config.clone(),
        orchestrator,
        shutdown: shutdown.clone(),
    });

    // 10 req/s per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let protected_routes = Router::new()
        .route("/api/v1/leads/analyze-batch", post(handlers::analyze_batch))
        .route("/api/v1/leads/analyze", post(handlers::analyze_one))
        .route("/api/v1/leads/export.csv", post(handlers::export_csv))
        .layer(
            ServiceBuilder::new()
                // Batches of a few hundred leads stay well under 5MB
                .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown requested, pausing running batches");
        shutdown.cancel();
    })
    .await?;

    Ok(())
}
