//! Scores a JSON file of leads from the command line.
//!
//! Usage: `analyze_leads <leads.json> [results.json]`
//!
//! The input is either a JSON array of leads or an object with a `leads` array. Results
//! are written to `results.json` (default `<input>.results.json`) and the batch stats are
//! printed. Ctrl-C stops the run after the current window.

use lead_qualifier::batch::BatchOrchestrator;
use lead_qualifier::cache_store::{CacheStore, MemoryCacheStore};
use lead_qualifier::config::{Config, PipelineConfig};
use lead_qualifier::db::Database;
use lead_qualifier::models::{BatchRequest, Lead};
use lead_qualifier::scoring_client::ScoringClient;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn read_leads(raw: &str) -> anyhow::Result<Vec<Lead>> {
    if let Ok(leads) = serde_json::from_str::<Vec<Lead>>(raw) {
        return Ok(leads);
    }
    let request: BatchRequest = serde_json::from_str(raw)
        .map_err(|e| anyhow::anyhow!("Input is neither a lead array nor {{\"leads\": [...]}}: {}", e))?;
    Ok(request.leads.unwrap_or_default())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lead_qualifier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(input) = args.get(1) else {
        anyhow::bail!("Usage: {} <leads.json> [results.json]", args[0]);
    };
    let output = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| format!("{}.results.json", input.trim_end_matches(".json")));

    let config = Config::from_env()?;
    let pipeline = PipelineConfig::from_env()?;

    let leads = read_leads(&tokio::fs::read_to_string(input).await?)?;
    println!("Loaded {} leads from {}", leads.len(), input);

    let cache: Arc<dyn CacheStore> = match config.database_url {
        Some(ref url) => Arc::new(Database::new(url).await?.cache_store(pipeline.cache_ttl).await?),
        None => Arc::new(MemoryCacheStore::new(pipeline.cache_ttl, 10_000)),
    };
    let client = ScoringClient::new(&config, &pipeline)?;
    let orchestrator = BatchOrchestrator::new(Arc::new(client), cache, None, pipeline);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Stopping after the current window...");
            on_signal.cancel();
        }
    });

    let response = orchestrator.process(leads, None, cancel).await?;
    tokio::fs::write(&output, serde_json::to_string_pretty(&response.results)?).await?;

    let stats = &response.stats;
    println!();
    println!("Total:        {}", stats.total);
    println!("Successful:   {}", stats.successful);
    println!("Failed:       {}", stats.failed);
    println!("From cache:   {}", stats.cached);
    println!("Success rate: {:.1}%", stats.success_rate * 100.0);
    println!("Cache hits:   {:.1}%", stats.cache_hit_rate * 100.0);
    println!("Rate limited: {}", stats.rate_limit_errors);
    println!("Concurrency:  {} (after {} windows)", stats.final_concurrency, stats.windows);
    if stats.cancelled {
        println!("Run was cancelled before every lead was dispatched");
    }
    println!("Results written to {}", output);

    Ok(())
}
