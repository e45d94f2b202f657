/// End-to-end batch tests: orchestrator + scoring client + in-memory cache and sink,
/// against a mocked model endpoint.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lead_qualifier::batch::BatchOrchestrator;
use lead_qualifier::cache_store::{CacheStore, CachedAnalysis, LeadIdentity, MemoryCacheStore};
use lead_qualifier::config::{ConcurrencyLimits, PipelineConfig, RetryPolicy};
use lead_qualifier::errors::AppError;
use lead_qualifier::models::{
    AnalysisResult, IcpLevel, Lead, SessionContext, SessionDelta, SessionStatus,
};
use lead_qualifier::persistence::{LeadRecord, MemoryPersistenceSink, PersistenceSink};
use lead_qualifier::scoring_client::ScoringClient;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_pipeline(max_attempts: u32) -> PipelineConfig {
    PipelineConfig {
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        concurrency: ConcurrencyLimits {
            min: 1,
            max: 8,
            initial: 2,
            min_samples: 5,
        },
        inter_request_delay: Duration::from_millis(1),
        inter_batch_delay: Duration::from_millis(1),
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

struct Harness {
    orchestrator: BatchOrchestrator,
    cache: Arc<MemoryCacheStore>,
    sink: Arc<MemoryPersistenceSink>,
}

fn harness(server: &MockServer, pipeline: PipelineConfig) -> Harness {
    let client = ScoringClient::with_endpoint(
        &server.uri(),
        "test-key".to_string(),
        "gemini-2.5-flash".to_string(),
        None,
        &pipeline,
    )
    .unwrap();
    let cache = Arc::new(MemoryCacheStore::new(pipeline.cache_ttl, 1000));
    let sink = Arc::new(MemoryPersistenceSink::new());
    let orchestrator = BatchOrchestrator::new(
        Arc::new(client),
        cache.clone(),
        Some(sink.clone() as Arc<dyn PersistenceSink>),
        pipeline,
    );
    Harness {
        orchestrator,
        cache,
        sink,
    }
}

fn scored_response() -> serde_json::Value {
    let text = json!({
        "icp_score": 2,
        "faturamento_score": 6,
        "brecha": "Captação pelo Instagram",
        "justificativa": "Clínica estruturada"
    })
    .to_string();
    json!({
        "candidates": [{"content": {"parts": [{"text": text}]}, "finishReason": "STOP"}]
    })
}

fn lead(name: &str) -> Lead {
    Lead {
        business_name: name.to_string(),
        city: "Belo Horizonte".to_string(),
        uf: "MG".to_string(),
        maps_url: format!("https://maps.google.com/?q={}", name.replace(' ', "+")),
        ..Default::default()
    }
}

fn session() -> SessionContext {
    SessionContext {
        session_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
    }
}

#[tokio::test]
async fn test_batch_with_forbidden_calls_returns_every_lead() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_string_contains("Bloqueada"))
        .respond_with(ResponseTemplate::new(403))
        .with_priority(1)
        .expect(3)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(scored_response()))
        .expect(7)
        .mount(&mock_server)
        .await;

    let h = harness(&mock_server, test_pipeline(3));
    let mut leads: Vec<Lead> = (1..=7).map(|i| lead(&format!("Clínica {}", i))).collect();
    leads.insert(2, lead("Bloqueada A"));
    leads.insert(5, lead("Bloqueada B"));
    leads.push(lead("Bloqueada C"));

    let response = h
        .orchestrator
        .process(leads, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.results.len(), 10);
    assert_eq!(response.stats.successful, 7);
    assert_eq!(response.stats.failed, 3);
    assert!((response.stats.success_rate - 0.7).abs() < 1e-9);

    for failed in response.results.iter().filter(|r| !r.success) {
        assert!(failed.lead.business_name.starts_with("Bloqueada"));
        assert_eq!(failed.analysis.icp_level, IcpLevel::Descartar);
        assert_eq!(failed.analysis.icp_score, 0);
        assert_eq!(failed.error_kind.as_deref(), Some("unauthorized"));
        assert_eq!(failed.error.as_deref(), Some(failed.analysis.justificativa.as_str()));
    }
    for ok in response.results.iter().filter(|r| r.success) {
        assert_eq!(ok.analysis.icp_level, IcpLevel::N2);
        assert!(!ok.from_cache);
    }
}

#[tokio::test]
async fn test_second_run_is_served_from_cache() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(scored_response()))
        .expect(2)
        .mount(&mock_server)
        .await;

    let h = harness(&mock_server, test_pipeline(3));
    let first = vec![lead("Clínica Aurora"), lead("Clínica Boreal")];
    h.orchestrator
        .process(first, None, CancellationToken::new())
        .await
        .unwrap();

    // Same identities, different casing and padding
    let mut again = lead("  CLÍNICA AURORA ");
    again.uf = "mg".to_string();
    let response = h
        .orchestrator
        .process(vec![again, lead("Clínica Boreal")], None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.stats.cached, 2);
    assert!((response.stats.cache_hit_rate - 1.0).abs() < 1e-9);
    assert!(response.results.iter().all(|r| r.from_cache && r.success));

    let identity = LeadIdentity::new("clínica aurora", "belo horizonte", "MG", None);
    assert!(h.cache.lookup(&identity).await.unwrap().is_some());
}

#[tokio::test]
async fn test_outcomes_are_persisted_per_lead() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_string_contains("Bloqueada"))
        .respond_with(ResponseTemplate::new(403))
        .with_priority(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(scored_response()))
        .mount(&mock_server)
        .await;

    let h = harness(&mock_server, test_pipeline(3));
    let ctx = session();
    let leads = vec![lead("Clínica Um"), lead("Bloqueada"), lead("Clínica Dois")];

    h.orchestrator
        .process(leads, Some(ctx), CancellationToken::new())
        .await
        .unwrap();

    let records = h.sink.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.session_id == ctx.session_id));

    let failed: Vec<_> = records.iter().filter(|r| r.analysis_status == "error").collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(
        failed[0].error_message.as_deref(),
        Some("API key inválida ou sem permissão")
    );

    let deltas = h.sink.session_deltas();
    assert_eq!(deltas.iter().map(|d| d.successful).sum::<usize>(), 2);
    assert_eq!(deltas.iter().map(|d| d.failed).sum::<usize>(), 1);
    assert_eq!(deltas.last().and_then(|d| d.status), Some(SessionStatus::Completed));
}

#[tokio::test]
async fn test_no_session_means_no_persistence() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(scored_response()))
        .mount(&mock_server)
        .await;

    let h = harness(&mock_server, test_pipeline(3));
    h.orchestrator
        .process(vec![lead("Clínica Um")], None, CancellationToken::new())
        .await
        .unwrap();

    assert!(h.sink.records().is_empty());
    assert!(h.sink.session_deltas().is_empty());
}

#[tokio::test]
async fn test_rate_limiting_lowers_concurrency() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .expect(6)
        .mount(&mock_server)
        .await;

    let h = harness(&mock_server, test_pipeline(1));
    let leads: Vec<Lead> = (1..=6).map(|i| lead(&format!("Clínica {}", i))).collect();

    let response = h
        .orchestrator
        .process(leads, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.stats.failed, 6);
    assert_eq!(response.stats.rate_limit_errors, 6);
    assert_eq!(response.stats.windows, 3);
    assert_eq!(response.stats.final_concurrency, 1);
    assert!(response
        .results
        .iter()
        .all(|r| r.error_kind.as_deref() == Some("rate_limit_exceeded")));
}

#[tokio::test]
async fn test_empty_batch_is_rejected_before_any_call() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(scored_response()))
        .expect(0)
        .mount(&mock_server)
        .await;

    let h = harness(&mock_server, test_pipeline(3));
    let result = h
        .orchestrator
        .process(Vec::new(), Some(session()), CancellationToken::new())
        .await;

    assert!(matches!(result, Err(AppError::NoLeads)));
    assert!(h.sink.session_deltas().is_empty());
}

#[tokio::test]
async fn test_cancellation_stops_between_windows() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(scored_response())
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&mock_server)
        .await;

    let h = harness(&mock_server, test_pipeline(3));
    let leads: Vec<Lead> = (1..=6).map(|i| lead(&format!("Clínica {}", i))).collect();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let response = h.orchestrator.process(leads, None, cancel).await.unwrap();

    // The first window (2 leads) was in flight and finishes; nothing else starts
    assert!(response.stats.cancelled);
    assert_eq!(response.stats.windows, 1);
    assert_eq!(response.results.len(), 2);
    assert!(response.results.iter().all(|r| r.success));
}

/// Cache backend that is down: every call fails.
#[derive(Default)]
struct UnreachableCache {
    lookups: AtomicUsize,
    stores: AtomicUsize,
}

#[async_trait]
impl CacheStore for UnreachableCache {
    async fn lookup(&self, _identity: &LeadIdentity) -> Result<Option<CachedAnalysis>, AppError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Err(AppError::CacheUnavailable("connection refused".to_string()))
    }

    async fn store(
        &self,
        _identity: &LeadIdentity,
        _maps_url: &str,
        _analysis: &AnalysisResult,
        _cached_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        Err(AppError::CacheUnavailable("connection refused".to_string()))
    }
}

/// Persistence backend that rejects every write.
#[derive(Default)]
struct RejectingSink {
    attempts: AtomicUsize,
}

#[async_trait]
impl PersistenceSink for RejectingSink {
    async fn persist(&self, _record: &LeadRecord) -> Result<(), AppError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AppError::InternalError("database circuit open".to_string()))
    }

    async fn report_session(
        &self,
        _session: &SessionContext,
        _delta: &SessionDelta,
    ) -> Result<(), AppError> {
        Err(AppError::InternalError("database circuit open".to_string()))
    }
}

#[tokio::test]
async fn test_failing_cache_and_sink_do_not_fail_leads() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(scored_response()))
        .expect(2)
        .mount(&mock_server)
        .await;

    let pipeline = test_pipeline(3);
    let client = ScoringClient::with_endpoint(
        &mock_server.uri(),
        "test-key".to_string(),
        "gemini-2.5-flash".to_string(),
        None,
        &pipeline,
    )
    .unwrap();
    let cache = Arc::new(UnreachableCache::default());
    let sink = Arc::new(RejectingSink::default());
    let orchestrator = BatchOrchestrator::new(
        Arc::new(client),
        cache.clone(),
        Some(sink.clone() as Arc<dyn PersistenceSink>),
        pipeline,
    );

    let response = orchestrator
        .process(
            vec![lead("Clínica Um"), lead("Clínica Dois")],
            Some(session()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Lookup failures count as misses, so both leads were scored
    assert_eq!(response.stats.successful, 2);
    assert_eq!(response.stats.failed, 0);
    assert_eq!(response.stats.cached, 0);
    assert!(response.results.iter().all(|r| r.success && !r.from_cache));

    assert_eq!(cache.lookups.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stores.load(Ordering::SeqCst), 2);
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
}
