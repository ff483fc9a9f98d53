//! Collections gateway: retries, timeouts and a circuit breaker around the store.
//!
//! Every store call made by the host or by plugins goes through
//! [`CollectionsGateway::safe_operation`], which guarantees that the call
//! terminates with either a value or a typed [`StoreError`]:
//!
//! - each attempt runs under a per-operation timeout;
//! - transient failures are retried with exponential backoff;
//! - repeated unavailability opens a breaker keyed on the store endpoint,
//!   after which calls fail fast with [`StoreError::CircuitOpen`] until a
//!   single half-open probe succeeds.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use chorus_core::{
    BoxedCollections, Collection, FindOptions, IndexSpec, StoreError, StoreResult, UpdateOptions,
    UpdateOutcome, WriteOp,
};

/// Tuning for [`CollectionsGateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deadline for a single attempt.
    pub op_timeout: Duration,
    /// Total attempts per operation (first try included).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the retry delay.
    pub max_delay: Duration,
    /// Consecutive unavailabilities that open the breaker.
    pub breaker_threshold: u32,
    /// Window in which those failures must occur.
    pub breaker_window: Duration,
    /// How long the breaker stays open before a probe.
    pub breaker_cooldown: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(5),
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            breaker_threshold: 5,
            breaker_window: Duration::from_secs(60),
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast until the cool-down elapses.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    failures: Vec<Instant>,
    open_until: Option<Instant>,
    /// Ticket of the half-open probe in flight.
    probing: Option<u64>,
    next_ticket: u64,
}

impl Breaker {
    fn new() -> Self {
        Self {
            failures: Vec::new(),
            open_until: None,
            probing: None,
            next_ticket: 0,
        }
    }

    fn reset(&mut self) {
        self.failures.clear();
        self.open_until = None;
        self.probing = None;
    }

    fn state(&self, now: Instant) -> BreakerState {
        match self.open_until {
            Some(until) if now < until => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
            None => BreakerState::Closed,
        }
    }
}

/// Per-endpoint circuit breakers.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    endpoints: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreaker {
    /// Creates breakers with the given policy.
    pub fn new(threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            cooldown,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Current state for an endpoint.
    pub fn state(&self, endpoint: &str) -> BreakerState {
        self.endpoints
            .lock()
            .get(endpoint)
            .map_or(BreakerState::Closed, |b| b.state(Instant::now()))
    }

    /// Admits a call or fails fast while open. Only one half-open probe is
    /// admitted at a time.
    ///
    /// The returned permit must be held for the duration of the call. A
    /// probe permit dropped before an outcome is recorded hands the probe
    /// slot to the next caller.
    pub fn admit<'a>(&'a self, endpoint: &'a str) -> StoreResult<Permit<'a>> {
        let now = Instant::now();
        let mut endpoints = self.endpoints.lock();
        let breaker = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(Breaker::new);
        match breaker.state(now) {
            BreakerState::Closed => Ok(Permit {
                breaker: self,
                endpoint,
                probe: None,
            }),
            BreakerState::HalfOpen if breaker.probing.is_none() => {
                debug!(endpoint, "Circuit half-open, admitting probe");
                breaker.next_ticket += 1;
                breaker.probing = Some(breaker.next_ticket);
                Ok(Permit {
                    breaker: self,
                    endpoint,
                    probe: breaker.probing,
                })
            }
            _ => Err(StoreError::CircuitOpen {
                endpoint: endpoint.to_string(),
            }),
        }
    }

    /// The store answered; close the breaker.
    pub fn record_success(&self, endpoint: &str) {
        let mut endpoints = self.endpoints.lock();
        if let Some(breaker) = endpoints.get_mut(endpoint) {
            if breaker.open_until.is_some() {
                info!(endpoint, "Circuit closed");
            }
            breaker.reset();
        }
    }

    fn release_probe(&self, endpoint: &str, ticket: u64) {
        let mut endpoints = self.endpoints.lock();
        if let Some(breaker) = endpoints.get_mut(endpoint)
            && breaker.probing == Some(ticket)
        {
            debug!(endpoint, "Circuit probe abandoned");
            breaker.probing = None;
        }
    }

    /// The store was unavailable; open the breaker when the threshold is hit.
    pub fn record_failure(&self, endpoint: &str) {
        let now = Instant::now();
        let mut endpoints = self.endpoints.lock();
        let breaker = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(Breaker::new);

        if breaker.probing.is_some() {
            breaker.probing = None;
            breaker.open_until = Some(now + self.cooldown);
            warn!(endpoint, "Circuit probe failed, reopening");
            return;
        }

        breaker
            .failures
            .retain(|t| now.duration_since(*t) <= self.window);
        breaker.failures.push(now);
        if breaker.failures.len() as u32 >= self.threshold {
            breaker.failures.clear();
            breaker.open_until = Some(now + self.cooldown);
            warn!(
                endpoint,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened after repeated store unavailability"
            );
        }
    }
}

/// Admission to the store, returned by [`CircuitBreaker::admit`].
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    endpoint: &'a str,
    probe: Option<u64>,
}

impl Permit<'_> {
    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.probe {
            self.breaker.release_probe(self.endpoint, ticket);
        }
    }
}

// =============================================================================
// CollectionsGateway
// =============================================================================

/// The store as seen by the host: every call is a safe operation.
pub struct CollectionsGateway {
    store: BoxedCollections,
    config: GatewayConfig,
    breaker: CircuitBreaker,
}

impl CollectionsGateway {
    /// Wraps a store.
    pub fn new(store: BoxedCollections, config: GatewayConfig) -> Self {
        let breaker = CircuitBreaker::new(
            config.breaker_threshold,
            config.breaker_window,
            config.breaker_cooldown,
        );
        Self {
            store,
            config,
            breaker,
        }
    }

    /// The store endpoint (breaker key).
    pub fn endpoint(&self) -> &str {
        self.store.endpoint()
    }

    /// Breaker state for this gateway's endpoint.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state(self.store.endpoint())
    }

    /// Returns a handle bound to `name`. Collections are created lazily.
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.store.clone(), name)
    }

    /// Whether the store supports atomic multi-document batches.
    pub fn supports_transactions(&self) -> bool {
        self.store.supports_transactions()
    }

    /// Runs `op` against `collection` with timeout, retry and breaker.
    ///
    /// `op` may be invoked more than once; it should be idempotent or
    /// guarded (e.g. compare-and-set).
    pub async fn safe_operation<T, F, Fut>(&self, collection: &str, op: F) -> StoreResult<T>
    where
        F: Fn(Collection) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let endpoint = self.store.endpoint();
        let _permit = self.breaker.admit(endpoint)?;

        let handle = self.collection(collection);
        let mut delay = self.config.base_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.config.op_timeout, op(handle.clone()))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(self.config.op_timeout)),
            };

            match result {
                Ok(value) => {
                    self.breaker.record_success(endpoint);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(
                        collection,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.max_delay);
                }
                Err(e) if e.is_transient() => {
                    self.breaker.record_failure(endpoint);
                    return Err(StoreError::Unavailable(format!(
                        "{collection}: gave up after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => {
                    // The store answered, so it is reachable.
                    self.breaker.record_success(endpoint);
                    return Err(e);
                }
            }
        }
    }

    /// Safe [`Collection::find`].
    pub async fn find(
        &self,
        collection: &str,
        filter: Value,
        options: FindOptions,
    ) -> StoreResult<Vec<Value>> {
        self.safe_operation(collection, |c| {
            let filter = filter.clone();
            let options = options.clone();
            async move { c.find(&filter, options).await }
        })
        .await
    }

    /// Safe [`Collection::find_one`].
    pub async fn find_one(&self, collection: &str, filter: Value) -> StoreResult<Option<Value>> {
        self.safe_operation(collection, |c| {
            let filter = filter.clone();
            async move { c.find_one(&filter).await }
        })
        .await
    }

    /// Safe [`Collection::insert_one`].
    pub async fn insert_one(&self, collection: &str, document: Value) -> StoreResult<String> {
        self.safe_operation(collection, |c| {
            let document = document.clone();
            async move { c.insert_one(document).await }
        })
        .await
    }

    /// Safe [`Collection::update_one`].
    pub async fn update_one(
        &self,
        collection: &str,
        filter: Value,
        update: Value,
        options: UpdateOptions,
    ) -> StoreResult<UpdateOutcome> {
        self.safe_operation(collection, |c| {
            let filter = filter.clone();
            let update = update.clone();
            async move { c.update_one(&filter, &update, options).await }
        })
        .await
    }

    /// Safe [`Collection::delete_one`].
    pub async fn delete_one(&self, collection: &str, filter: Value) -> StoreResult<u64> {
        self.safe_operation(collection, |c| {
            let filter = filter.clone();
            async move { c.delete_one(&filter).await }
        })
        .await
    }

    /// Safe [`Collection::aggregate`].
    pub async fn aggregate(&self, collection: &str, pipeline: Vec<Value>) -> StoreResult<Vec<Value>> {
        self.safe_operation(collection, |c| {
            let pipeline = pipeline.clone();
            async move { c.aggregate(&pipeline).await }
        })
        .await
    }

    /// Applies an atomic batch under the same safety guarantees.
    pub async fn apply_atomic(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        let store = self.store.clone();
        self.safe_operation("$batch", |_| {
            let store = store.clone();
            let ops = ops.clone();
            async move { store.apply_atomic(ops).await }
        })
        .await
    }

    /// Applies index declarations; idempotent.
    pub async fn ensure_indexes(&self, indexes: &[IndexDecl]) -> StoreResult<()> {
        for decl in indexes {
            let name = self
                .safe_operation(&decl.collection, |c| {
                    let index = decl.index.clone();
                    async move { c.create_index(index).await }
                })
                .await?;
            debug!(collection = %decl.collection, index = %name, "Index ensured");
        }
        Ok(())
    }

    /// Flushes buffered store writes.
    pub async fn flush(&self) -> StoreResult<()> {
        let store = self.store.clone();
        self.safe_operation("$flush", |_| {
            let store = store.clone();
            async move { store.flush().await }
        })
        .await
    }

    /// Pings the store once (no retry); used at startup and by health checks.
    pub async fn ping(&self) -> StoreResult<()> {
        tokio::time::timeout(self.config.op_timeout, self.store.ping())
            .await
            .map_err(|_| StoreError::Timeout(self.config.op_timeout))?
    }
}

/// An index required by a component or plugin.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexDecl {
    /// Collection the index belongs to.
    pub collection: String,
    /// The index itself.
    #[serde(flatten)]
    pub index: IndexSpec,
}

impl IndexDecl {
    /// Declares `index` on `collection`.
    pub fn new(collection: impl Into<String>, index: IndexSpec) -> Self {
        Self {
            collection: collection.into(),
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chorus_core::MemoryStore;
    use serde_json::json;
    use tokio_test::assert_ok;

    use super::*;

    fn gateway(store: Arc<MemoryStore>) -> CollectionsGateway {
        CollectionsGateway::new(store, GatewayConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next([
            StoreError::Transient("reset".into()),
            StoreError::Transient("reset".into()),
        ]);
        let gw = gateway(store.clone());

        let started = Instant::now();
        gw.insert_one("items", json!({ "a": 1 })).await.unwrap();
        // 200 ms + 400 ms of backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(600));
        assert_eq!(store.count("items"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next((0..3).map(|_| StoreError::Transient("down".into())));
        let gw = gateway(store);

        let err = gw.find_one("items", json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_is_not_retried() {
        let gw = gateway(Arc::new(MemoryStore::new()));
        let calls = AtomicU32::new(0);
        let err = gw
            .safe_operation("items", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StoreError::invalid_query("bad")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempts_time_out() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Some(Duration::from_secs(10)));
        let gw = gateway(store);

        let err = gw.find_one("items", json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_then_probes() {
        let store = Arc::new(MemoryStore::new());
        let config = GatewayConfig {
            max_attempts: 1,
            ..GatewayConfig::default()
        };
        let gw = CollectionsGateway::new(store.clone(), config);

        store.fail_next((0..5).map(|_| StoreError::Transient("down".into())));
        for _ in 0..5 {
            assert!(matches!(
                gw.find_one("items", json!({})).await,
                Err(StoreError::Unavailable(_))
            ));
        }
        assert_eq!(gw.breaker_state(), BreakerState::Open);
        assert!(matches!(
            gw.find_one("items", json!({})).await,
            Err(StoreError::CircuitOpen { .. })
        ));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(gw.breaker_state(), BreakerState::HalfOpen);
        gw.find_one("items", json!({})).await.unwrap();
        assert_eq!(gw.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_half_open_call_frees_the_slot() {
        let store = Arc::new(MemoryStore::new());
        let config = GatewayConfig {
            max_attempts: 1,
            ..GatewayConfig::default()
        };
        let gw = CollectionsGateway::new(store.clone(), config);

        store.fail_next((0..5).map(|_| StoreError::Transient("down".into())));
        for _ in 0..5 {
            let _ = gw.find_one("items", json!({})).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(gw.breaker_state(), BreakerState::HalfOpen);

        // The caller gives up before the store answers.
        store.set_latency(Some(Duration::from_secs(2)));
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), gw.find_one("items", json!({})))
                .await;
        assert!(abandoned.is_err());
        store.set_latency(None);

        assert_eq!(gw.breaker_state(), BreakerState::HalfOpen);
        assert_ok!(gw.find_one("items", json!({})).await);
        assert_eq!(gw.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_ensure_indexes_is_idempotent() {
        let gw = gateway(Arc::new(MemoryStore::new()));
        let decls = [IndexDecl::new("accounts", IndexSpec::new([("userId", 1)]).unique())];
        assert_ok!(gw.ensure_indexes(&decls).await);
        assert_ok!(gw.ensure_indexes(&decls).await);
    }
}
