//! [`InferenceBridge`] – two-tier asynchronous request router.
//!
//! Every inference call crosses into a dedicated worker task that owns the
//! HTTP client; the control loop and the worker share no mutable state and
//! communicate only over channels, so a hung or slow external call can
//! never stall goal arbitration or actuator control.
//!
//! # Request lifecycle
//!
//! 1. The caller waits (bounded polling) for the worker's readiness flag;
//!    if it never rises the call fails closed with
//!    [`InferenceError::NotReady`].
//! 2. The rate limiter is consulted; an exhausted quota fails immediately
//!    with [`InferenceError::RateLimited`] – requests are never queued.
//! 3. The prompt is budgeted (see [`crate::sanitize::enforce_budget`]) and
//!    handed to the worker keyed by a monotonically increasing id, with a
//!    per-request [`CancelFlag`] recorded in the pending registry.
//! 4. The caller awaits the worker's reply through a `oneshot` channel –
//!    resolved or rejected exactly once by construction – racing it against
//!    the hard request timeout and the soft cancel flag.
//!
//! Cancellation is soft: [`InferenceBridge::cancel`] raises the request's
//! abort flag (observed by the worker between network round-trips) and the
//! caller side is rejected immediately, whether or not the remote call
//! actually stopped.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use pilot_kernel::CancelFlag;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::{ClientConfig, ClientError, InferenceClient, TierConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Tiers and configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Which model tier a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Low latency, small output: reflex decisions and classification.
    Fast,
    /// Larger output budget: multi-step planning.
    Slow,
}

/// Bridge-level configuration.  Tier model parameters live in the
/// per-tier [`TierConfig`]s; everything here governs the crossing itself.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub fast: TierConfig,
    pub slow: TierConfig,
    /// Hard timeout for one request, pending-table entry included.
    pub request_timeout: Duration,
    /// Outbound quota; exceeding it fails immediately, no queuing.
    pub requests_per_minute: u32,
    /// Readiness polling step.
    pub ready_poll: Duration,
    /// Total time a caller will wait for worker readiness before failing
    /// closed.
    pub ready_wait: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fast: TierConfig {
                model: "pilot-fast".to_string(),
                timeout: Duration::from_secs(10),
                max_tokens: 256,
            },
            slow: TierConfig {
                model: "pilot-slow".to_string(),
                timeout: Duration::from_secs(45),
                max_tokens: 2048,
            },
            request_timeout: Duration::from_secs(60),
            requests_per_minute: 30,
            ready_poll: Duration::from_millis(100),
            ready_wait: Duration::from_secs(30),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from a bridged inference request.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference request timed out")]
    Timeout,
    #[error("inference request cancelled")]
    Cancelled,
    #[error("inference rate limit exceeded")]
    RateLimited,
    #[error("inference worker not ready")]
    NotReady,
    #[error("inference worker unavailable")]
    WorkerGone,
    #[error(transparent)]
    Client(#[from] ClientError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker protocol
// ─────────────────────────────────────────────────────────────────────────────

struct WorkerRequest {
    id: u64,
    tier: Tier,
    prompt: String,
    structured: bool,
    cancel: CancelFlag,
    reply: oneshot::Sender<Result<String, InferenceError>>,
}

/// How often the caller side re-checks its cancel flag while awaiting a
/// reply.
const CANCEL_POLL: Duration = Duration::from_millis(50);

// ─────────────────────────────────────────────────────────────────────────────
// InferenceBridge
// ─────────────────────────────────────────────────────────────────────────────

/// The caller-side half of the bridge.  Cheap to share via `Arc`.
pub struct InferenceBridge {
    config: BridgeConfig,
    tx: mpsc::Sender<WorkerRequest>,
    ready: Arc<AtomicBool>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, CancelFlag>>,
    limiter: DefaultDirectRateLimiter,
}

impl InferenceBridge {
    /// Build the bridge and spawn its worker task.
    pub fn spawn(config: BridgeConfig, client_config: ClientConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<WorkerRequest>(32);
        let ready = Arc::new(AtomicBool::new(false));
        let bridge = Arc::new(Self::with_channel(config.clone(), tx, Arc::clone(&ready)));
        tokio::spawn(run_worker(rx, ready, config, client_config));
        bridge
    }

    fn with_channel(
        config: BridgeConfig,
        tx: mpsc::Sender<WorkerRequest>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN),
        );
        Self {
            config,
            tx,
            ready,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Route one request across the bridge.
    ///
    /// # Errors
    ///
    /// [`InferenceError::NotReady`] when the worker never signalled
    /// readiness, [`InferenceError::RateLimited`] on quota exhaustion,
    /// [`InferenceError::Timeout`] / [`InferenceError::Cancelled`] for the
    /// hard and soft abort paths, and [`InferenceError::Client`] for
    /// endpoint failures that survived the fallback chain.
    pub async fn request(
        &self,
        tier: Tier,
        prompt: &str,
        structured: bool,
    ) -> Result<String, InferenceError> {
        self.wait_ready().await?;

        if self.limiter.check().is_err() {
            warn!(?tier, "inference request rejected by rate limiter");
            return Err(InferenceError::RateLimited);
        }

        let prompt = crate::sanitize::enforce_budget(prompt);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelFlag::new();
        self.pending
            .lock()
            .expect("pending registry poisoned")
            .insert(id, cancel.clone());
        debug!(id, ?tier, structured, "inference request submitted");

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .tx
            .send(WorkerRequest {
                id,
                tier,
                prompt,
                structured,
                cancel: cancel.clone(),
                reply: reply_tx,
            })
            .await;

        let result = if sent.is_err() {
            Err(InferenceError::WorkerGone)
        } else {
            self.await_reply(reply_rx, &cancel).await
        };

        self.pending
            .lock()
            .expect("pending registry poisoned")
            .remove(&id);
        result
    }

    /// Soft-cancel a pending request by id.  Returns `true` when the id was
    /// pending.  The caller side observes the flag within one poll step;
    /// the worker observes it between network round-trips.
    pub fn cancel(&self, id: u64) -> bool {
        let pending = self.pending.lock().expect("pending registry poisoned");
        match pending.get(&id) {
            Some(flag) => {
                flag.raise();
                true
            }
            None => false,
        }
    }

    /// Soft-cancel every pending request.
    pub fn cancel_all(&self) {
        let pending = self.pending.lock().expect("pending registry poisoned");
        for flag in pending.values() {
            flag.raise();
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "cancelled all pending inference requests");
        }
    }

    /// Ids of requests currently in flight.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .pending
            .lock()
            .expect("pending registry poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Fast-tier facade: errors degrade to `None` so callers substitute a
    /// safe default instead of propagating inference failures.
    pub async fn fast(&self, prompt: &str, structured: bool) -> Option<String> {
        self.facade(Tier::Fast, prompt, structured).await
    }

    /// Slow-tier facade, same degradation contract as [`fast`][Self::fast].
    pub async fn slow(&self, prompt: &str, structured: bool) -> Option<String> {
        self.facade(Tier::Slow, prompt, structured).await
    }

    async fn facade(&self, tier: Tier, prompt: &str, structured: bool) -> Option<String> {
        match self.request(tier, prompt, structured).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(?tier, error = %e, "inference degraded to None");
                None
            }
        }
    }

    async fn wait_ready(&self) -> Result<(), InferenceError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + self.config.ready_wait;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.config.ready_poll).await;
            if self.ready.load(Ordering::Acquire) {
                return Ok(());
            }
        }
        Err(InferenceError::NotReady)
    }

    async fn await_reply(
        &self,
        mut reply_rx: oneshot::Receiver<Result<String, InferenceError>>,
        cancel: &CancelFlag,
    ) -> Result<String, InferenceError> {
        let wait = async {
            loop {
                tokio::select! {
                    reply = &mut reply_rx => {
                        return reply.unwrap_or(Err(InferenceError::WorkerGone));
                    }
                    _ = tokio::time::sleep(CANCEL_POLL) => {
                        if cancel.is_raised() {
                            return Err(InferenceError::Cancelled);
                        }
                    }
                }
            }
        };
        match tokio::time::timeout(self.config.request_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

/// The isolated execution context: owns the HTTP client, processes requests
/// one at a time, and replies over each request's oneshot channel.
async fn run_worker(
    mut rx: mpsc::Receiver<WorkerRequest>,
    ready: Arc<AtomicBool>,
    config: BridgeConfig,
    client_config: ClientConfig,
) {
    let client = InferenceClient::new(client_config);
    ready.store(true, Ordering::Release);
    info!("inference worker ready");

    while let Some(request) = rx.recv().await {
        if request.cancel.is_raised() {
            let _ = request.reply.send(Err(InferenceError::Cancelled));
            continue;
        }
        let tier_config = match request.tier {
            Tier::Fast => &config.fast,
            Tier::Slow => &config.slow,
        };
        let result = client
            .complete(
                tier_config,
                &request.prompt,
                request.structured,
                Some(&request.cancel),
            )
            .await;
        let result = if request.cancel.is_raised() {
            Err(InferenceError::Cancelled)
        } else {
            result.map_err(InferenceError::from)
        };
        // The caller may have timed out and dropped its receiver.
        let _ = request.reply.send(result);
        debug!(id = request.id, "inference request resolved");
    }
    debug!("inference worker shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::client::EndpointConfig;

    fn short_config() -> BridgeConfig {
        BridgeConfig {
            fast: TierConfig {
                model: "fast".to_string(),
                timeout: Duration::from_millis(200),
                max_tokens: 64,
            },
            slow: TierConfig {
                model: "slow".to_string(),
                timeout: Duration::from_millis(200),
                max_tokens: 64,
            },
            request_timeout: Duration::from_millis(400),
            requests_per_minute: 30,
            ready_poll: Duration::from_millis(10),
            ready_wait: Duration::from_millis(100),
        }
    }

    fn unroutable_client() -> ClientConfig {
        ClientConfig {
            primary: EndpointConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                api_key: None,
            },
            fallback: None,
            fallback_model: "fallback".to_string(),
        }
    }

    /// Bridge wired to a channel the test controls; no worker is spawned.
    fn detached_bridge(ready: bool) -> (Arc<InferenceBridge>, mpsc::Receiver<WorkerRequest>) {
        let (tx, rx) = mpsc::channel(8);
        let flag = Arc::new(AtomicBool::new(ready));
        let bridge = Arc::new(InferenceBridge::with_channel(short_config(), tx, flag));
        (bridge, rx)
    }

    #[tokio::test]
    async fn not_ready_fails_closed() {
        let (bridge, _rx) = detached_bridge(false);
        let result = bridge.request(Tier::Fast, "hello", false).await;
        assert!(matches!(result, Err(InferenceError::NotReady)));
    }

    #[tokio::test]
    async fn unanswered_request_times_out_and_clears_pending() {
        let (bridge, mut rx) = detached_bridge(true);
        let handle = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.request(Tier::Fast, "hello", false).await })
        };
        // Swallow the request without replying.
        let req = rx.recv().await.unwrap();
        assert_eq!(req.id, 1);
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(InferenceError::Timeout)));
        assert!(bridge.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn cancel_rejects_caller_immediately() {
        let (bridge, mut rx) = detached_bridge(true);
        let handle = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.request(Tier::Slow, "hello", false).await })
        };
        let req = rx.recv().await.unwrap();
        assert!(bridge.cancel(req.id));
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(InferenceError::Cancelled)));
        // The worker-side flag was raised too.
        assert!(req.cancel.is_raised());
    }

    #[tokio::test]
    async fn cancel_unknown_id_returns_false() {
        let (bridge, _rx) = detached_bridge(true);
        assert!(!bridge.cancel(42));
    }

    #[tokio::test]
    async fn cancel_all_raises_every_pending_flag() {
        let (bridge, mut rx) = detached_bridge(true);
        let mut handles = Vec::new();
        for _ in 0..3 {
            let bridge = Arc::clone(&bridge);
            handles.push(tokio::spawn(async move {
                bridge.request(Tier::Fast, "x", false).await
            }));
        }
        let mut reqs = Vec::new();
        for _ in 0..3 {
            reqs.push(rx.recv().await.unwrap());
        }
        bridge.cancel_all();
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(InferenceError::Cancelled)
            ));
        }
        assert!(reqs.iter().all(|r| r.cancel.is_raised()));
    }

    #[tokio::test]
    async fn request_ids_are_monotonic_and_unique() {
        let (bridge, mut rx) = detached_bridge(true);
        for _ in 0..2 {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                let _ = bridge.request(Tier::Fast, "x", false).await;
            });
        }
        let a = rx.recv().await.unwrap().id;
        let b = rx.recv().await.unwrap().id;
        assert_ne!(a, b);
        assert_eq!(a.min(b), 1);
        assert_eq!(a.max(b), 2);
    }

    #[tokio::test]
    async fn rate_limit_quota_of_one_rejects_second_request() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut config = short_config();
        config.requests_per_minute = 1;
        let ready = Arc::new(AtomicBool::new(true));
        let bridge = Arc::new(InferenceBridge::with_channel(config, tx, ready));

        // First request consumes the quota; answer it so it completes.
        let first = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.request(Tier::Fast, "a", false).await })
        };
        let req = rx.recv().await.unwrap();
        let _ = req.reply.send(Ok("done".to_string()));
        assert_eq!(first.await.unwrap().unwrap(), "done");

        let second = bridge.request(Tier::Fast, "b", false).await;
        assert!(matches!(second, Err(InferenceError::RateLimited)));
    }

    #[tokio::test]
    async fn worker_resolves_with_client_error_on_unreachable_endpoint() {
        let bridge = InferenceBridge::spawn(short_config(), unroutable_client());
        let result = bridge.request(Tier::Fast, "hello", false).await;
        assert!(matches!(result, Err(InferenceError::Client(_))));
    }

    #[tokio::test]
    async fn facade_degrades_errors_to_none() {
        let bridge = InferenceBridge::spawn(short_config(), unroutable_client());
        assert!(bridge.fast("hello", false).await.is_none());
        assert!(bridge.slow("plan something", true).await.is_none());
    }
}
