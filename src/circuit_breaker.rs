use failsafe::{backoff, failure_policy, CircuitBreaker, Config};
use std::future::Future;
use std::time::Duration;

/// Concrete breaker type shared by the Postgres-backed cache and sink.
pub type DbCircuitBreaker = failsafe::StateMachine<
    failure_policy::ConsecutiveFailures<backoff::Exponential>,
    (),
>;

/// Creates a circuit breaker for database operations.
///
/// - **Failure threshold**: 5 consecutive failures opens the circuit.
/// - **Backoff**: exponential, 10s to 60s, before a trial call is let through.
///
/// While open, cache lookups become misses and persistence writes are skipped with a
/// warning instead of each one waiting on a dead connection.
pub fn create_db_circuit_breaker() -> DbCircuitBreaker {
    let backoff_strategy = backoff::exponential(Duration::from_secs(10), Duration::from_secs(60));

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

/// Outcome of a call routed through [`guarded`].
#[derive(Debug)]
pub enum Guarded<E> {
    /// The circuit is open; the call was not attempted.
    Rejected,
    /// The call ran and failed.
    Failed(E),
}

/// Runs an async operation through `breaker`, recording its outcome.
pub async fn guarded<B, F, T, E>(breaker: &B, operation: F) -> Result<T, Guarded<E>>
where
    B: CircuitBreaker,
    F: Future<Output = Result<T, E>>,
{
    if !breaker.is_call_permitted() {
        return Err(Guarded::Rejected);
    }

    let result = operation.await;
    let _ = breaker.call(|| match &result {
        Ok(_) => Ok(()),
        Err(_) => Err(()),
    });

    result.map_err(Guarded::Failed)
}
