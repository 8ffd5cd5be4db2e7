/// Adaptive backpressure: admission, a priority queue for excess work,
/// per-class circuit breakers, and a concurrency limit that follows
/// Little's law.
///
/// Classes are isolated: a read is admitted while the write circuit is
/// open as long as the read circuit itself is closed, so the store stays
/// queryable while writes recover.
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{OpClass, Result, SomaError};

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    pub initial_max_concurrent: usize,
    pub min_concurrent: usize,
    pub max_concurrent_bound: usize,
    pub read_failure_threshold: usize,
    pub write_failure_threshold: usize,
    pub open_timeout: Duration,
    /// Rolling window for circuit failure counting.
    pub failure_window: Duration,
    pub target_latency: Duration,
    pub adapt_interval: Duration,
    pub initial_max_queue_depth: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            initial_max_concurrent: 100,
            min_concurrent: 10,
            max_concurrent_bound: 500,
            read_failure_threshold: 10,
            write_failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
            target_latency: Duration::from_millis(100),
            adapt_interval: Duration::from_secs(5),
            initial_max_queue_depth: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Circuit {
    state: CircuitState,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    failures: VecDeque<Instant>,
    threshold: usize,
}

impl Circuit {
    fn new(threshold: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            probe_in_flight: false,
            failures: VecDeque::new(),
            threshold,
        }
    }

    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(&front) = self.failures.front() {
            if now.duration_since(front) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns Ok when this class may proceed. An open circuit past its
    /// timeout moves to half-open and admits exactly one probe.
    fn admit(&mut self, open_timeout: Duration, window: Duration) -> bool {
        self.prune(window);
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= open_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            tracing::info!("circuit probe succeeded, closing");
        }
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.probe_in_flight = false;
        self.failures.clear();
    }

    fn record_failure(&mut self, window: Duration) {
        self.failures.push_back(Instant::now());
        self.prune(window);
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                self.probe_in_flight = false;
            }
            CircuitState::Closed if self.failures.len() >= self.threshold => {
                tracing::warn!(failures = self.failures.len(), "circuit opened");
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }
}

struct Waiter {
    priority: i32,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Waiter {}
impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then FIFO within a priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackpressureMetrics {
    pub active_operations: usize,
    pub max_concurrent: usize,
    pub queue_depth: usize,
    pub max_queue_depth: usize,
    pub processing_rate: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub throughput: f64,
}

/// One `(observed load, chosen limit)` adaptation sample.
#[derive(Debug, Clone, Copy)]
pub struct AdaptationSample {
    pub load: f64,
    pub optimal: usize,
}

struct Inner {
    active: usize,
    max_concurrent: usize,
    max_queue_depth: usize,
    queue: BinaryHeap<Waiter>,
    seq: u64,
    window_started: Instant,
    window_completed: u64,
    window_errors: u64,
    window_latency: Duration,
    last_adapt: Instant,
    processing_rate: f64,
    error_rate: f64,
    avg_latency_ms: f64,
    throughput: f64,
    history: Vec<AdaptationSample>,
}

pub struct BackpressureController {
    config: BackpressureConfig,
    inner: Mutex<Inner>,
    read_circuit: Mutex<Circuit>,
    write_circuit: Mutex<Circuit>,
    /// Self-handle so permits can report back without a cycle.
    weak: Weak<BackpressureController>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(Inner {
                active: 0,
                max_concurrent: config.initial_max_concurrent,
                max_queue_depth: config.initial_max_queue_depth,
                queue: BinaryHeap::new(),
                seq: 0,
                window_started: Instant::now(),
                window_completed: 0,
                window_errors: 0,
                window_latency: Duration::ZERO,
                last_adapt: Instant::now(),
                processing_rate: 0.0,
                error_rate: 0.0,
                avg_latency_ms: 0.0,
                throughput: 0.0,
                history: Vec::new(),
            }),
            read_circuit: Mutex::new(Circuit::new(config.read_failure_threshold)),
            write_circuit: Mutex::new(Circuit::new(config.write_failure_threshold)),
            config,
            weak: weak.clone(),
        })
    }

    fn circuit(&self, class: OpClass) -> &Mutex<Circuit> {
        match class {
            OpClass::Read => &self.read_circuit,
            OpClass::Write => &self.write_circuit,
        }
    }

    pub fn circuit_state(&self, class: OpClass) -> CircuitState {
        self.circuit(class).lock().state
    }

    pub fn metrics(&self) -> BackpressureMetrics {
        let inner = self.inner.lock();
        BackpressureMetrics {
            active_operations: inner.active,
            max_concurrent: inner.max_concurrent,
            queue_depth: inner.queue.len(),
            max_queue_depth: inner.max_queue_depth,
            processing_rate: inner.processing_rate,
            error_rate: inner.error_rate,
            avg_latency_ms: inner.avg_latency_ms,
            throughput: inner.throughput,
        }
    }

    pub fn history(&self) -> Vec<AdaptationSample> {
        self.inner.lock().history.clone()
    }

    /// Requests permission to run one operation of the given class.
    /// Returns a permit that must witness the outcome (or its drop
    /// counts as success).
    pub async fn request_permission(
        &self,
        class: OpClass,
        priority: i32,
    ) -> Result<Permit> {
        // Per-class circuit gate. Only this class's circuit matters, so
        // reads keep flowing while the write circuit is open.
        {
            let mut circuit = self.circuit(class).lock();
            if !circuit.admit(self.config.open_timeout, self.config.failure_window) {
                return Err(SomaError::CircuitOpen { class });
            }
        }

        let wait = {
            let mut inner = self.inner.lock();
            if inner.active < inner.max_concurrent / 2 && inner.queue.is_empty() {
                inner.active += 1;
                None
            } else if inner.active >= inner.max_concurrent {
                if inner.queue.len() >= inner.max_queue_depth {
                    return Err(SomaError::Overloaded {
                        queue_depth: inner.queue.len(),
                    });
                }
                let (wake, rx) = oneshot::channel();
                inner.seq += 1;
                let seq = inner.seq;
                inner.queue.push(Waiter {
                    priority,
                    seq,
                    wake,
                });
                Some(rx)
            } else {
                inner.active += 1;
                None
            }
        };

        if let Some(rx) = wait {
            // The releaser increments `active` on our behalf before
            // waking us; a dropped sender means controller shutdown.
            rx.await.map_err(|_| SomaError::Cancelled)?;
        }

        Ok(Permit {
            controller: self.weak.clone(),
            class,
            started: Instant::now(),
            released: false,
        })
    }

    fn release(&self, class: OpClass, latency: Duration, failed_storage: bool) {
        {
            let mut circuit = self.circuit(class).lock();
            if failed_storage {
                circuit.record_failure(self.config.failure_window);
            } else {
                circuit.record_success();
            }
        }

        let mut inner = self.inner.lock();
        inner.active = inner.active.saturating_sub(1);
        inner.window_completed += 1;
        if failed_storage {
            inner.window_errors += 1;
        }
        inner.window_latency += latency;

        // Hand the freed slot to the highest-priority waiter.
        while inner.active < inner.max_concurrent {
            let Some(waiter) = inner.queue.pop() else { break };
            inner.active += 1;
            if waiter.wake.send(()).is_err() {
                // Waiter gave up (cancelled); slot goes to the next one.
                inner.active -= 1;
                continue;
            }
            break;
        }

        if inner.last_adapt.elapsed() >= self.config.adapt_interval {
            self.adapt(&mut inner);
        }
    }

    /// Little's-law adaptation:
    ///   target   = ceil(processing_rate * target_latency)
    ///   adjusted = floor(target * (1 - 2 * error_rate))
    ///   limit   <- EMA(limit, clamp(adjusted), alpha = 0.1)
    /// with a 10% change threshold against churn. The queue bound tracks
    /// ten seconds of observed throughput.
    fn adapt(&self, inner: &mut Inner) {
        let elapsed = inner.window_started.elapsed().as_secs_f64().max(1e-3);
        let completed = inner.window_completed.max(1) as f64;
        inner.processing_rate = inner.window_completed as f64 / elapsed;
        inner.error_rate = inner.window_errors as f64 / completed;
        inner.avg_latency_ms = inner.window_latency.as_secs_f64() * 1000.0 / completed;
        inner.throughput = inner.processing_rate;

        if inner.window_completed > 0 {
            let target = (inner.processing_rate * self.config.target_latency.as_secs_f64()).ceil();
            let adjusted = (target * (1.0 - 2.0 * inner.error_rate)).floor();
            let clamped = (adjusted as i64)
                .clamp(
                    self.config.min_concurrent as i64,
                    self.config.max_concurrent_bound as i64,
                ) as f64;
            let blended = inner.max_concurrent as f64 * 0.9 + clamped * 0.1;
            let current = inner.max_concurrent as f64;
            if (blended - current).abs() / current > 0.10 {
                inner.max_concurrent = blended.round() as usize;
                tracing::debug!(
                    max_concurrent = inner.max_concurrent,
                    rate = inner.processing_rate,
                    error_rate = inner.error_rate,
                    "adapted concurrency limit"
                );
            }
            inner.max_queue_depth =
                ((inner.throughput * 10.0).round() as usize).clamp(100, 10_000);
            inner.history.push(AdaptationSample {
                load: inner.active as f64 / inner.max_concurrent.max(1) as f64,
                optimal: inner.max_concurrent,
            });
            if inner.history.len() > 1024 {
                inner.history.remove(0);
            }
        }

        inner.window_started = Instant::now();
        inner.window_completed = 0;
        inner.window_errors = 0;
        inner.window_latency = Duration::ZERO;
        inner.last_adapt = Instant::now();
    }
}

/// RAII admission permit. Report the outcome with `success`/`failure`;
/// dropping it unreported counts as success.
#[derive(Debug)]
pub struct Permit {
    controller: Weak<BackpressureController>,
    class: OpClass,
    started: Instant,
    released: bool,
}

impl Permit {
    pub fn success(mut self) {
        self.released = true;
        if let Some(controller) = self.controller.upgrade() {
            controller.release(self.class, self.started.elapsed(), false);
        }
    }

    /// Records the outcome of a failed operation. Only storage-level
    /// failures trip the circuit; lifecycle signals do not.
    pub fn failure(mut self, error: &SomaError) {
        self.released = true;
        if let Some(controller) = self.controller.upgrade() {
            controller.release(
                self.class,
                self.started.elapsed(),
                error.counts_as_circuit_failure(),
            );
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.released {
            if let Some(controller) = self.controller.upgrade() {
                controller.release(self.class, self.started.elapsed(), false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BackpressureConfig {
        BackpressureConfig {
            open_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_admit_under_light_load() {
        let controller = BackpressureController::new(fast_config());
        let permit = controller
            .request_permission(OpClass::Read, 0)
            .await
            .unwrap();
        assert_eq!(controller.metrics().active_operations, 1);
        permit.success();
        assert_eq!(controller.metrics().active_operations, 0);
    }

    #[tokio::test]
    async fn test_write_circuit_opens_after_threshold() {
        let controller = BackpressureController::new(fast_config());
        for _ in 0..5 {
            let permit = controller
                .request_permission(OpClass::Write, 0)
                .await
                .unwrap();
            permit.failure(&SomaError::transient("k", "io"));
        }
        assert_eq!(controller.circuit_state(OpClass::Write), CircuitState::Open);
        let err = controller
            .request_permission(OpClass::Write, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SomaError::CircuitOpen { class: OpClass::Write }));
    }

    #[tokio::test]
    async fn test_reads_flow_while_write_circuit_open() {
        let controller = BackpressureController::new(fast_config());
        for _ in 0..5 {
            let permit = controller
                .request_permission(OpClass::Write, 0)
                .await
                .unwrap();
            permit.failure(&SomaError::transient("k", "io"));
        }
        assert_eq!(controller.circuit_state(OpClass::Write), CircuitState::Open);

        // Isolation rule: the read path is unaffected.
        let permit = controller
            .request_permission(OpClass::Read, 0)
            .await
            .unwrap();
        permit.success();
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_circuit() {
        let controller = BackpressureController::new(fast_config());
        for _ in 0..5 {
            let permit = controller
                .request_permission(OpClass::Write, 0)
                .await
                .unwrap();
            permit.failure(&SomaError::transient("k", "io"));
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // One probe is admitted; a second concurrent write is not.
        let probe = controller
            .request_permission(OpClass::Write, 0)
            .await
            .unwrap();
        assert_eq!(
            controller.circuit_state(OpClass::Write),
            CircuitState::HalfOpen
        );
        let rejected = controller.request_permission(OpClass::Write, 0).await;
        assert!(rejected.is_err());

        probe.success();
        assert_eq!(
            controller.circuit_state(OpClass::Write),
            CircuitState::Closed
        );
        controller
            .request_permission(OpClass::Write, 0)
            .await
            .unwrap()
            .success();
    }

    #[tokio::test]
    async fn test_lifecycle_errors_do_not_trip_circuit() {
        let controller = BackpressureController::new(fast_config());
        for _ in 0..20 {
            let permit = controller
                .request_permission(OpClass::Write, 0)
                .await
                .unwrap();
            permit.failure(&SomaError::Cancelled);
        }
        assert_eq!(
            controller.circuit_state(OpClass::Write),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_queueing_and_priority_order() {
        let config = BackpressureConfig {
            initial_max_concurrent: 10,
            min_concurrent: 10,
            ..fast_config()
        };
        let controller = BackpressureController::new(config);

        // Saturate.
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(
                controller
                    .request_permission(OpClass::Write, 0)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(controller.metrics().active_operations, 10);

        // Two queued waiters with different priorities.
        let low = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller.request_permission(OpClass::Write, 1).await.map(|p| {
                    let at = Instant::now();
                    p.success();
                    at
                })
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let high = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller.request_permission(OpClass::Write, 9).await.map(|p| {
                    let at = Instant::now();
                    p.success();
                    at
                })
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.metrics().queue_depth, 2);

        // Release two slots; the high-priority waiter must win the first.
        held.pop().unwrap().success();
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.pop().unwrap().success();

        let high_at = high.await.unwrap().unwrap();
        let low_at = low.await.unwrap().unwrap();
        assert!(high_at <= low_at);
    }

    #[tokio::test]
    async fn test_overload_rejection() {
        let config = BackpressureConfig {
            initial_max_concurrent: 10,
            initial_max_queue_depth: 0,
            ..fast_config()
        };
        let controller = BackpressureController::new(config);
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(
                controller
                    .request_permission(OpClass::Read, 0)
                    .await
                    .unwrap(),
            );
        }
        let err = controller
            .request_permission(OpClass::Read, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SomaError::Overloaded { .. }));
    }
}
