//! The controller task. It owns [`ControllerState`] and runs a pass on every
//! tick. Mutations reach it through [`ControllerHandle`] as commands, so
//! manual actions are serialized with autonomous passes. Reads are served
//! from a snapshot the task republishes after every pass and command, so
//! they never wait behind a running pass.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::cluster::ClusterClient;
use crate::config::ControllerConfig;
use crate::error::{DeployError, Result};
use crate::executor::ActionOutcome;
use crate::history::ActionRecord;
use crate::reconciler::{PassReport, Reconciler};
use crate::registry::ImageRegistry;
use crate::state::{ControllerState, ControllerStatus};
use crate::types::ServiceRecord;

const COMMAND_BUFFER: usize = 64;
/// `tokio::time::interval` panics on a zero period.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub history: Vec<ActionRecord>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualOutcome {
    pub service: String,
    pub success: bool,
    pub message: String,
}

/// Copy of the state as of the last completed pass or command.
#[derive(Debug, Clone)]
struct Snapshot {
    status: ControllerStatus,
    /// Retained records, newest first.
    history: Vec<ActionRecord>,
    total: usize,
    services: Vec<ServiceRecord>,
}

impl Snapshot {
    fn of(state: &ControllerState) -> Self {
        Self {
            status: state.status(),
            history: state.history.recent(usize::MAX),
            total: state.history.len(),
            services: state.services.values().cloned().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum Command {
    Deploy {
        image: String,
        replicas: i32,
        reply: oneshot::Sender<ManualOutcome>,
    },
    Rollback {
        service: String,
        reply: oneshot::Sender<ManualOutcome>,
    },
    SetAutoDeploy {
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    SetPollInterval {
        interval: Duration,
        reply: oneshot::Sender<Duration>,
    },
    ReconcileNow {
        reply: oneshot::Sender<Result<PassReport>>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// ControllerHandle
// ---------------------------------------------------------------------------

/// Cheap, cloneable access to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<ActionRecord>,
    snapshot: watch::Receiver<Snapshot>,
}

impl ControllerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| DeployError::ControllerStopped)?;
        rx.await.map_err(|_| DeployError::ControllerStopped)
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> Result<T> {
        // The sender lives exactly as long as the controller task.
        if self.snapshot.has_changed().is_err() {
            return Err(DeployError::ControllerStopped);
        }
        Ok(f(&self.snapshot.borrow()))
    }

    /// Deploy `image` now, ignoring the auto-deploy gate.
    pub async fn deploy(&self, image: impl Into<String>, replicas: i32) -> Result<ManualOutcome> {
        let image = image.into();
        self.request(|reply| Command::Deploy {
            image,
            replicas,
            reply,
        })
        .await
    }

    pub async fn rollback(&self, service: impl Into<String>) -> Result<ManualOutcome> {
        let service = service.into();
        self.request(|reply| Command::Rollback { service, reply })
            .await
    }

    /// Flip the gate. Takes effect at the next pass.
    pub async fn set_auto_deploy(&self, enabled: bool) -> Result<bool> {
        self.request(|reply| Command::SetAutoDeploy { enabled, reply })
            .await
    }

    pub async fn set_poll_interval(&self, interval: Duration) -> Result<Duration> {
        self.request(|reply| Command::SetPollInterval { interval, reply })
            .await
    }

    /// Run a pass immediately and return its report.
    pub async fn reconcile_now(&self) -> Result<PassReport> {
        self.request(|reply| Command::ReconcileNow { reply })
            .await?
    }

    pub fn status(&self) -> Result<ControllerStatus> {
        self.read(|s| s.status.clone())
    }

    /// The newest `limit` records, most recent first, plus the total count.
    pub fn history(&self, limit: usize) -> Result<HistoryPage> {
        self.read(|s| HistoryPage {
            history: s.history.iter().take(limit).cloned().collect(),
            total: s.total,
        })
    }

    pub fn services(&self) -> Result<Vec<ServiceRecord>> {
        self.read(|s| s.services.clone())
    }

    /// Ask the controller to stop after the current pass.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| DeployError::ControllerStopped)
    }

    /// Every action record appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ActionRecord> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    reconciler: Reconciler,
    state: ControllerState,
    backoff: Duration,
    snapshot: watch::Sender<Snapshot>,
}

impl Controller {
    pub fn new(reconciler: Reconciler, state: ControllerState, backoff: Duration) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::of(&state));
        Self {
            reconciler,
            state,
            backoff,
            snapshot,
        }
    }

    /// Build a controller from `config` and start it on the current runtime.
    pub fn start(
        config: &ControllerConfig,
        registry: Arc<dyn ImageRegistry>,
        cluster: Arc<dyn ClusterClient>,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let reconciler = Reconciler::new(config, registry, cluster);
        let state = ControllerState::new(config);
        Self::new(reconciler, state, config.error_backoff()).spawn()
    }

    pub fn spawn(self) -> (ControllerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = ControllerHandle {
            tx,
            events: self.state.history.sender(),
            snapshot: self.snapshot.subscribe(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut ticker = ticker(self.state.poll_interval);
        tracing::info!(
            interval_secs = self.state.poll_interval.as_secs(),
            auto_deploy = self.state.auto_deploy_enabled,
            namespace = %self.state.namespace,
            "controller started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = self.pass().await;
                    self.publish();
                    if result.is_err() {
                        tokio::time::sleep(self.backoff).await;
                    }
                    ticker.reset();
                }
                cmd = rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => break,
                    Some(cmd) => self.handle(cmd, &mut ticker).await,
                },
            }
        }
        tracing::info!("controller stopped");
    }

    fn publish(&self) {
        self.snapshot.send_replace(Snapshot::of(&self.state));
    }

    /// Run one pass, converting a panic into an error so the loop survives.
    async fn pass(&mut self) -> Result<PassReport> {
        let result = AssertUnwindSafe(self.reconciler.run_pass(&mut self.state))
            .catch_unwind()
            .await;
        result.map_err(|panic| {
            let reason = panic_message(panic.as_ref());
            tracing::error!(reason = %reason, "reconciliation pass panicked");
            DeployError::PassFailed(reason)
        })
    }

    /// Apply `cmd`, then publish before replying so a caller's next read
    /// observes its own write.
    async fn handle(&mut self, cmd: Command, ticker: &mut Interval) {
        match cmd {
            Command::Deploy {
                image,
                replicas,
                reply,
            } => {
                let (service, outcome) = self
                    .reconciler
                    .deploy_manual(&mut self.state, &image, replicas)
                    .await;
                self.publish();
                let _ = reply.send(manual(service, outcome));
            }
            Command::Rollback { service, reply } => {
                let outcome = self
                    .reconciler
                    .rollback_manual(&mut self.state, &service)
                    .await;
                self.publish();
                let _ = reply.send(manual(service, outcome));
            }
            Command::SetAutoDeploy { enabled, reply } => {
                self.state.auto_deploy_enabled = enabled;
                tracing::info!(enabled, "auto-deploy toggled");
                self.publish();
                let _ = reply.send(enabled);
            }
            Command::SetPollInterval { interval, reply } => {
                let interval = interval.max(MIN_POLL_INTERVAL);
                self.state.poll_interval = interval;
                *ticker = ticker_after(interval);
                tracing::info!(interval_secs = interval.as_secs(), "poll interval changed");
                self.publish();
                let _ = reply.send(interval);
            }
            Command::ReconcileNow { reply } => {
                let result = self.pass().await;
                ticker.reset();
                self.publish();
                let _ = reply.send(result);
            }
            // Handled by the loop.
            Command::Shutdown => {}
        }
    }
}

fn manual(service: String, outcome: ActionOutcome) -> ManualOutcome {
    ManualOutcome {
        service,
        success: outcome.success,
        message: outcome.message,
    }
}

/// First tick fires immediately so the controller checks on startup.
fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn ticker_after(period: Duration) -> Interval {
    let period = period.max(MIN_POLL_INTERVAL);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    }
}
