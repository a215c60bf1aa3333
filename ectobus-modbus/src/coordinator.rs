//! Periodic polling with retry, backoff and availability tracking.
//!
//! One [`PollingCoordinator`] drives one slave. Each cycle reads the
//! gateway's read plan; a failed read is retried with a linearly growing
//! delay, and only a cycle that exhausts its retries counts as a failure.
//! The device becomes unavailable after [`FAILURE_THRESHOLD`] consecutive
//! failed cycles and available again after the next successful one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ectobus_common::DeviceStatus;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheWriter, RegisterCache};
use crate::gateway::{self, DeviceGateway};
use crate::registers::ReadBlock;
use crate::transport::TransportLink;

/// Consecutive failed cycles after which a device is unavailable.
pub const FAILURE_THRESHOLD: u32 = 3;

const EVENT_CAPACITY: usize = 32;
const REFRESH_QUEUE: usize = 8;

/// Retries within one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry `retry` (1-based): `base_delay × retry`.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Counts consecutive failed cycles.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureTracker {
    consecutive_failures: u32,
    polled: bool,
}

impl FailureTracker {
    /// Returns `true` if availability changed.
    pub fn record_success(&mut self) -> bool {
        let was_available = self.is_available();
        self.consecutive_failures = 0;
        self.polled = true;
        was_available != self.is_available()
    }

    /// Returns `true` if availability changed.
    pub fn record_failure(&mut self) -> bool {
        let was_available = self.is_available();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.polled = true;
        was_available != self.is_available()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_available(&self) -> bool {
        self.consecutive_failures < FAILURE_THRESHOLD
    }

    pub fn status(&self) -> DeviceStatus {
        match self.consecutive_failures {
            _ if !self.polled => DeviceStatus::Unknown,
            0 => DeviceStatus::Online,
            n if n < FAILURE_THRESHOLD => DeviceStatus::Degraded,
            _ => DeviceStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Device name used in logs.
    pub name: String,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Timeout of each read transaction.
    pub read_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "device".to_string(),
            poll_interval: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            read_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    Idle,
    Polling,
    Retrying,
    Success,
    Failed,
}

/// Observable coordinator state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorState {
    pub phase: CyclePhase,
    /// Whether the last completed cycle succeeded.
    pub last_success: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub poll_interval_secs: u64,
    pub max_retries: u32,
    pub available: bool,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Completed cycles.
    pub cycles: u64,
}

impl CoordinatorState {
    fn new(config: &CoordinatorConfig) -> Self {
        Self {
            phase: CyclePhase::Idle,
            last_success: false,
            last_success_at: None,
            last_update: None,
            consecutive_failures: 0,
            poll_interval_secs: config.poll_interval.as_secs(),
            max_retries: config.retry.max_retries,
            available: true,
            status: DeviceStatus::Unknown,
            last_error: None,
            cycles: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// A cycle succeeded and the cache holds fresh data.
    Updated,
    /// A cycle exhausted its retries.
    UpdateFailed {
        consecutive_failures: u32,
        error: String,
    },
    AvailabilityChanged { available: bool },
}

/// Polls one slave and owns its cache writer.
#[derive(Debug)]
pub struct PollingCoordinator {
    link: Arc<TransportLink>,
    slave_id: u8,
    plan: Vec<ReadBlock>,
    writer: CacheWriter,
    config: CoordinatorConfig,
    tracker: FailureTracker,
    state: watch::Sender<CoordinatorState>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl PollingCoordinator {
    pub fn new(gateway: &DeviceGateway, writer: CacheWriter, config: CoordinatorConfig) -> Self {
        let (state, _) = watch::channel(CoordinatorState::new(&config));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            link: gateway.link().clone(),
            slave_id: gateway.slave_id(),
            plan: gateway.read_plan(),
            writer,
            config,
            tracker: FailureTracker::default(),
            state,
            events,
        }
    }

    /// Start polling in a background task.
    pub fn spawn(
        gateway: &DeviceGateway,
        writer: CacheWriter,
        config: CoordinatorConfig,
    ) -> CoordinatorHandle {
        let coordinator = Self::new(gateway, writer, config);
        let name = coordinator.config.name.clone();
        let state = coordinator.state.subscribe();
        let events = coordinator.events.clone();
        let (requests, queue) = mpsc::channel(REFRESH_QUEUE);

        let task = tokio::spawn(coordinator.run(queue));

        CoordinatorHandle {
            name,
            requests,
            events,
            state,
            task: task.abort_handle(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }

    pub fn is_available(&self) -> bool {
        self.tracker.is_available()
    }

    async fn run(mut self, mut requests: mpsc::Receiver<oneshot::Sender<bool>>) {
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            device = %self.config.name,
            slave = self.slave_id,
            "Starting coordinator (interval: {}s, retries: {})",
            self.config.poll_interval.as_secs(),
            self.config.retry.max_retries
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                request = requests.recv() => {
                    let Some(reply) = request else {
                        debug!(device = %self.config.name, "All handles dropped");
                        break;
                    };
                    let ok = self.poll_once().await;
                    ticker.reset();
                    let _ = reply.send(ok);
                }
            }
        }
    }

    /// Run one cycle (with retries). Returns whether it succeeded.
    pub async fn poll_once(&mut self) -> bool {
        let attempts = self.config.retry.max_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry.delay_before_retry(attempt);
                self.set_phase(CyclePhase::Retrying);
                debug!(
                    device = %self.config.name,
                    slave = self.slave_id,
                    "Retry {}/{} in {:?}",
                    attempt,
                    self.config.retry.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            self.set_phase(CyclePhase::Polling);
            let ticket = self.writer.begin_cycle();

            match self.read_plan().await {
                Ok(batch) => {
                    debug!(
                        device = %self.config.name,
                        slave = self.slave_id,
                        registers = batch.len(),
                        "Cache updated"
                    );
                    self.writer.replace(batch, ticket);
                    self.finish_success();
                    return true;
                }
                Err(e) => last_error = e,
            }
        }

        self.finish_failure(last_error);
        false
    }

    async fn read_plan(&self) -> Result<RegisterCache, String> {
        let mut batch = RegisterCache::default();
        for block in &self.plan {
            let words = gateway::read_block(&self.link, self.slave_id, block, self.config.read_timeout)
                .await
                .ok_or_else(|| format!("read of {} failed", block))?;
            batch.insert_block(block.start, &words);
        }
        Ok(batch)
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.state.send_modify(|s| s.phase = phase);
    }

    fn finish_success(&mut self) {
        let changed = self.tracker.record_success();
        let now = Utc::now();
        let tracker = self.tracker;

        self.state.send_modify(|s| {
            s.phase = CyclePhase::Success;
            s.last_success = true;
            s.last_success_at = Some(now);
            s.last_update = Some(now);
            s.consecutive_failures = 0;
            s.available = tracker.is_available();
            s.status = tracker.status();
            s.last_error = None;
            s.cycles += 1;
        });

        let _ = self.events.send(CoordinatorEvent::Updated);
        if changed {
            info!(device = %self.config.name, slave = self.slave_id, "Device available again");
            let _ = self
                .events
                .send(CoordinatorEvent::AvailabilityChanged { available: true });
        }
    }

    fn finish_failure(&mut self, error: String) {
        let changed = self.tracker.record_failure();
        let tracker = self.tracker;
        let consecutive_failures = tracker.consecutive_failures();

        warn!(
            device = %self.config.name,
            slave = self.slave_id,
            consecutive_failures,
            "Poll cycle failed: {}",
            error
        );

        let last_error = error.clone();
        self.state.send_modify(|s| {
            s.phase = CyclePhase::Failed;
            s.last_success = false;
            s.last_update = Some(Utc::now());
            s.consecutive_failures = consecutive_failures;
            s.available = tracker.is_available();
            s.status = tracker.status();
            s.last_error = Some(last_error);
            s.cycles += 1;
        });

        let _ = self.events.send(CoordinatorEvent::UpdateFailed {
            consecutive_failures,
            error,
        });
        if changed {
            error!(
                device = %self.config.name,
                slave = self.slave_id,
                "Device unavailable after {} failed cycles",
                consecutive_failures
            );
            let _ = self
                .events
                .send(CoordinatorEvent::AvailabilityChanged { available: false });
        }
    }
}

/// Consumer side of a spawned coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    name: String,
    requests: mpsc::Sender<oneshot::Sender<bool>>,
    events: broadcast::Sender<CoordinatorEvent>,
    state: watch::Receiver<CoordinatorState>,
    task: AbortHandle,
}

impl CoordinatorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Poll now and wait for the cycle to finish.
    ///
    /// Returns `false` if the cycle failed or the coordinator is gone.
    pub async fn refresh(&self) -> bool {
        let (reply, result) = oneshot::channel();
        if self.requests.send(reply).await.is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }

    pub fn is_available(&self) -> bool {
        self.state.borrow().available
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.borrow().status
    }

    /// Stop the polling task.
    pub fn shutdown(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
