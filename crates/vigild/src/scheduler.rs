//! Starts and stops scheduled pipelines as their time slots open and close.

use crate::config::FunctionConfig;
use crate::factory::PipelineFactory;
use crate::pipeline::{PipelineMode, PipelineReport, StopReason};
use chrono::NaiveTime;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Externally visible state of one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum RunState {
    /// Outside its time slot.
    Idle,
    Running,
    /// Pipeline ended inside its slot; not restarted until the slot reopens.
    Ended(String),
    Failed(String),
}

pub type ScheduleStatus = Arc<Mutex<BTreeMap<i64, RunState>>>;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<PipelineReport>,
}

pub struct Scheduler {
    factory: PipelineFactory,
    functions: Vec<FunctionConfig>,
    running: HashMap<i64, Running>,
    /// Functions whose pipeline already ended or failed in the current slot.
    spent: HashSet<i64>,
    status: ScheduleStatus,
    poll: Duration,
}

impl Scheduler {
    pub fn new(factory: PipelineFactory, functions: Vec<FunctionConfig>, poll: Duration) -> Self {
        let status = functions.iter().map(|f| (f.id, RunState::Idle)).collect();
        Self {
            factory,
            functions,
            running: HashMap::new(),
            spent: HashSet::new(),
            status: Arc::new(Mutex::new(status)),
            poll,
        }
    }

    /// Shared view of every function's state.
    pub fn status(&self) -> ScheduleStatus {
        self.status.clone()
    }

    pub fn is_running(&self, function_id: i64) -> bool {
        self.running.contains_key(&function_id)
    }

    /// Re-evaluate every function against the local wall clock until cancelled,
    /// then stop everything.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.reconcile(chrono::Local::now().time()).await,
            }
        }
        self.stop_all().await;
    }

    /// Bring the set of running pipelines in line with the slots active at `now`.
    pub async fn reconcile(&mut self, now: NaiveTime) {
        self.reap_finished().await;

        for function in self.functions.clone() {
            let active = function.active_at(now);
            let running = self.is_running(function.id);

            if !active {
                self.spent.remove(&function.id);
                if running {
                    self.stop(function.id).await;
                }
                self.set_state(function.id, RunState::Idle);
                continue;
            }

            if running || self.spent.contains(&function.id) {
                continue;
            }
            self.start(&function).await;
        }
    }

    async fn start(&mut self, function: &FunctionConfig) {
        let source = function.camera_source.clone();
        match self
            .factory
            .spawn_build(PipelineMode::Scheduled(function.clone()), source.clone())
            .await
        {
            Ok(pipeline) => {
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(pipeline.run(cancel.clone()));
                self.running.insert(function.id, Running { cancel, handle });
                self.set_state(function.id, RunState::Running);
                tracing::info!(function = %function.name, id = function.id, %source, "scheduled pipeline started");
            }
            Err(e) => {
                tracing::warn!(function = %function.name, id = function.id, error = %e, "scheduled pipeline failed to start");
                self.spent.insert(function.id);
                self.set_state(function.id, RunState::Failed(e.to_string()));
            }
        }
    }

    async fn stop(&mut self, function_id: i64) {
        let Some(run) = self.running.remove(&function_id) else {
            return;
        };
        run.cancel.cancel();
        match run.handle.await {
            Ok(report) => tracing::info!(
                id = function_id,
                pipeline = %report.name,
                recordings = report.recordings.len(),
                stop = ?report.stop,
                "scheduled pipeline stopped"
            ),
            Err(e) => tracing::error!(id = function_id, error = %e, "scheduled pipeline task panicked"),
        }
    }

    /// Collect pipelines that ended on their own (end of stream, source failure).
    async fn reap_finished(&mut self) {
        let finished: Vec<i64> = self
            .running
            .iter()
            .filter(|(_, r)| r.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            let Some(run) = self.running.remove(&id) else {
                continue;
            };
            let state = match run.handle.await {
                Ok(report) => match report.stop {
                    StopReason::SourceFailed(reason) => RunState::Failed(reason),
                    other => RunState::Ended(format!("{other:?}")),
                },
                Err(e) => RunState::Failed(format!("task panicked: {e}")),
            };
            tracing::info!(id, ?state, "scheduled pipeline ended inside its slot");
            self.spent.insert(id);
            self.set_state(id, state);
        }
    }

    pub async fn stop_all(&mut self) {
        let ids: Vec<i64> = self.running.keys().copied().collect();
        for id in ids {
            self.stop(id).await;
            self.set_state(id, RunState::Idle);
        }
    }

    fn set_state(&self, id: i64, state: RunState) {
        if let Ok(mut status) = self.status.lock() {
            status.insert(id, state);
        }
    }
}
