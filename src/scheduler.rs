//! Poll loop: one tokio task owns the [`LimitState`] and is driven through a
//! [`SchedulerHandle`].

use crate::capacity::CapacityView;
use crate::config::ApiKey;
use crate::http::{ErrorKind, Probe, ProbeError};
use crate::state::LimitState;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(3600);
const UPDATE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Provider rejected the key; only a new key resumes polling.
    Credentials,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Polling,
    Succeeded,
    Failed { kind: ErrorKind },
    Waiting { next_poll_at: DateTime<Utc> },
    Paused { reason: PauseReason },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterUpdate {
    pub state: LimitState,
    pub capacity: CapacityView,
}

impl MeterUpdate {
    pub fn from_state(state: &LimitState) -> Self {
        Self {
            state: state.clone(),
            capacity: CapacityView::from_state(state),
        }
    }
}

#[derive(Debug)]
enum Command {
    RefreshNow,
    SetInterval(Duration),
    SetApiKey(ApiKey),
    Pause,
    Resume,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("poll scheduler is no longer running")]
pub struct SchedulerClosed;

enum Step {
    Poll,
    Wait,
    Pause(PauseReason),
    Stop,
}

pub struct PollScheduler {
    probe: Arc<dyn Probe>,
    api_key: ApiKey,
    interval: Duration,
    failure_threshold: u32,
    max_backoff: Duration,
    consecutive_failures: u32,
    // Provider's retry-after from the last 429, honoured until the next poll.
    retry_after: Option<Duration>,
    state: LimitState,
    updates: broadcast::Sender<MeterUpdate>,
    latest: watch::Sender<Option<MeterUpdate>>,
    phase: watch::Sender<Phase>,
}

impl PollScheduler {
    pub fn new(probe: Arc<dyn Probe>, api_key: ApiKey, interval: Duration) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let (latest, _) = watch::channel(None);
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            probe,
            api_key,
            interval,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            max_backoff: DEFAULT_MAX_BACKOFF,
            consecutive_failures: 0,
            retry_after: None,
            state: LimitState::default(),
            updates,
            latest,
            phase,
        }
    }

    pub fn with_backoff(mut self, threshold: u32, max_backoff: Duration) -> Self {
        self.failure_threshold = threshold;
        self.max_backoff = max_backoff;
        self
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let updates = self.updates.clone();
        let latest = self.latest.subscribe();
        let phase = self.phase.subscribe();
        let task = tokio::spawn(self.run(rx));
        SchedulerHandle {
            commands,
            updates,
            latest,
            phase,
            task: Some(task),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(
            "poll scheduler started interval_secs={}",
            self.interval.as_secs()
        );
        let mut step = Step::Poll;
        loop {
            step = match step {
                Step::Poll => self.poll(&mut commands).await,
                Step::Wait => self.wait(&mut commands).await,
                Step::Pause(reason) => self.paused(reason, &mut commands).await,
                Step::Stop => break,
            };
        }
        self.set_phase(Phase::Stopped);
        info!("poll scheduler stopped");
    }

    async fn poll(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Step {
        self.set_phase(Phase::Polling);
        self.retry_after = None;
        info!("poll start");

        let probe = Arc::clone(&self.probe);
        let key = self.api_key.clone();
        let in_flight = async move { probe.probe(&key).await };
        tokio::pin!(in_flight);

        let mut key_replaced = false;
        let mut pause_requested = false;
        let result = loop {
            tokio::select! {
                // Drain commands before looking at the probe so a refresh
                // queued during the call is seen as coalesced.
                biased;
                cmd = commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        info!("shutdown requested mid-poll, dropping in-flight probe");
                        return Step::Stop;
                    }
                    Some(Command::RefreshNow) => {
                        debug!("manual refresh coalesced into in-flight poll")
                    }
                    Some(Command::SetInterval(d)) => self.set_interval(d),
                    Some(Command::SetApiKey(k)) => {
                        self.api_key = k;
                        key_replaced = true;
                    }
                    Some(Command::Pause) => pause_requested = true,
                    Some(Command::Resume) => pause_requested = false,
                },
                res = &mut in_flight => break res,
            }
        };

        let now = Utc::now();
        let fatal = match result {
            Ok(report) => {
                self.state.apply_success(&report, now);
                self.consecutive_failures = 0;
                info!("poll end ok dimensions={}", report.len());
                self.publish();
                self.set_phase(Phase::Succeeded);
                false
            }
            Err(err) => {
                let kind = err.kind();
                self.state.apply_failure(&err, now);
                if !kind.is_fatal() {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                }
                if let ProbeError::RateLimited {
                    retry_after_secs: Some(secs),
                    ..
                } = &err
                {
                    self.retry_after = Some(Duration::from_secs(*secs));
                }
                warn!(
                    "poll end error kind={} consecutive_failures={}: {}",
                    kind, self.consecutive_failures, err
                );
                self.publish();
                self.set_phase(Phase::Failed { kind });
                kind.is_fatal()
            }
        };

        if fatal {
            if key_replaced {
                info!("credential replaced during rejected poll, retrying with new key");
                return Step::Poll;
            }
            return Step::Pause(PauseReason::Credentials);
        }
        if pause_requested {
            return Step::Pause(PauseReason::User);
        }
        Step::Wait
    }

    async fn wait(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Step {
        let mut deadline = self.arm_timer();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Step::Poll,
                cmd = commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return Step::Stop,
                    Some(Command::RefreshNow) => {
                        info!("manual refresh");
                        return Step::Poll;
                    }
                    Some(Command::SetInterval(d)) => {
                        self.set_interval(d);
                        deadline = self.arm_timer();
                    }
                    Some(Command::SetApiKey(k)) => {
                        self.api_key = k;
                        self.consecutive_failures = 0;
                        return Step::Poll;
                    }
                    Some(Command::Pause) => return Step::Pause(PauseReason::User),
                    Some(Command::Resume) => {}
                },
            }
        }
    }

    async fn paused(
        &mut self,
        reason: PauseReason,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Step {
        self.set_phase(Phase::Paused { reason });
        warn!("polling paused reason={:?}", reason);
        loop {
            match commands.recv().await {
                None | Some(Command::Shutdown) => return Step::Stop,
                Some(Command::SetApiKey(k)) => {
                    self.api_key = k;
                    self.consecutive_failures = 0;
                    self.set_phase(Phase::Idle);
                    return Step::Poll;
                }
                Some(Command::Resume) if reason == PauseReason::User => {
                    self.set_phase(Phase::Idle);
                    return Step::Poll;
                }
                Some(Command::Resume) => {
                    warn!("resume ignored: credential was rejected, a new key is required");
                }
                Some(Command::RefreshNow) => debug!("refresh ignored while paused"),
                Some(Command::SetInterval(d)) => self.set_interval(d),
                Some(Command::Pause) => {}
            }
        }
    }

    fn set_interval(&mut self, d: Duration) {
        let d = d.max(Duration::from_secs(1));
        info!(
            "interval changed from_secs={} to_secs={}",
            self.interval.as_secs(),
            d.as_secs()
        );
        self.interval = d;
    }

    fn arm_timer(&self) -> Instant {
        let delay = self.next_delay();
        let next_poll_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.set_phase(Phase::Waiting { next_poll_at });
        debug!("next poll in {}s", delay.as_secs());
        Instant::now() + delay
    }

    fn next_delay(&self) -> Duration {
        let delay = backoff_delay(
            self.interval,
            self.consecutive_failures,
            self.failure_threshold,
            self.max_backoff,
        );
        match self.retry_after {
            Some(wait) => delay.max(wait.min(self.max_backoff)),
            None => delay,
        }
    }

    fn publish(&self) {
        let update = MeterUpdate::from_state(&self.state);
        // No subscribers is fine; the latest value is still kept in the watch.
        let _ = self.updates.send(update.clone());
        self.latest.send_replace(Some(update));
    }

    fn set_phase(&self, phase: Phase) {
        debug!("phase={:?}", phase);
        self.phase.send_replace(phase);
    }
}

/// `interval` until more than `threshold` consecutive failures, then doubling
/// per extra failure, capped at `max_backoff` (never below `interval`).
pub fn backoff_delay(
    interval: Duration,
    failures: u32,
    threshold: u32,
    max_backoff: Duration,
) -> Duration {
    if failures <= threshold {
        return interval;
    }
    let exp = (failures - threshold).min(16);
    let cap = max_backoff.max(interval);
    interval.saturating_mul(1u32 << exp).min(cap)
}

/// Dropping the handle stops the loop as well.
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    updates: broadcast::Sender<MeterUpdate>,
    latest: watch::Receiver<Option<MeterUpdate>>,
    phase: watch::Receiver<Phase>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    fn send(&self, cmd: Command) -> Result<(), SchedulerClosed> {
        self.commands.send(cmd).map_err(|_| SchedulerClosed)
    }

    /// Poll now. Ignored if a poll is already in flight or polling is paused.
    pub fn refresh_now(&self) -> Result<(), SchedulerClosed> {
        self.send(Command::RefreshNow)
    }

    /// Change the refresh interval; a pending wait is re-armed from now.
    pub fn set_interval(&self, interval: Duration) -> Result<(), SchedulerClosed> {
        self.send(Command::SetInterval(interval))
    }

    /// Replace the credential. Lifts a credentials pause.
    pub fn set_api_key(&self, key: ApiKey) -> Result<(), SchedulerClosed> {
        self.send(Command::SetApiKey(key))
    }

    pub fn pause(&self) -> Result<(), SchedulerClosed> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), SchedulerClosed> {
        self.send(Command::Resume)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeterUpdate> {
        self.updates.subscribe()
    }

    pub fn latest(&self) -> Option<MeterUpdate> {
        self.latest.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// Stop from any phase and wait for the task; an in-flight probe is dropped.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("poll scheduler task ended abnormally: {}", e);
            }
        }
    }
}
