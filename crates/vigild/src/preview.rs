//! Live preview sessions, one pipeline task each.

use crate::factory::PipelineFactory;
use crate::pipeline::{PipelineError, PipelineMode, PreviewFrame};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Session {
    source: String,
    /// Unique bus name of the client that asked for it.
    owner: Option<String>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewInfo {
    pub id: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

pub struct PreviewRegistry {
    factory: PipelineFactory,
    frames: mpsc::Sender<PreviewFrame>,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl PreviewRegistry {
    pub fn new(factory: PipelineFactory, frames: mpsc::Sender<PreviewFrame>) -> Self {
        Self {
            factory,
            frames,
            sessions: Arc::default(),
        }
    }

    /// Open `source` and start streaming; returns the new preview id.
    ///
    /// `owner` is the requesting client; its previews end when it leaves the bus.
    pub async fn start(&self, source: &str, owner: Option<&str>) -> Result<String, PipelineError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mode = PipelineMode::Preview {
            id: id.clone(),
            frames: self.frames.clone(),
        };
        let pipeline = self.factory.spawn_build(mode, source.to_string()).await?;

        let cancel = CancellationToken::new();
        let task_sessions = self.sessions.clone();
        let task_id = id.clone();
        let task_cancel = cancel.clone();

        // Registered under the lock so a pipeline that ends at once still
        // finds its entry to remove.
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            let report = pipeline.run(task_cancel).await;
            // Ended by itself (end of stream or read failure): drop the entry.
            if let Ok(mut sessions) = task_sessions.lock() {
                sessions.remove(&task_id);
            }
            tracing::info!(preview = %task_id, stop = ?report.stop, "preview ended");
        });
        sessions.insert(
            id.clone(),
            Session {
                source: source.to_string(),
                owner: owner.map(str::to_string),
                cancel,
                handle,
            },
        );
        drop(sessions);

        tracing::info!(preview = %id, source, owner, "preview started");
        Ok(id)
    }

    /// Stop a preview and wait for its pipeline to shut down. False if unknown.
    pub async fn stop(&self, id: &str) -> bool {
        let session = self.sessions.lock().ok().and_then(|mut s| s.remove(id));
        let Some(session) = session else {
            return false;
        };
        session.cancel.cancel();
        if let Err(e) = session.handle.await {
            tracing::error!(preview = id, error = %e, "preview task panicked");
        }
        true
    }

    pub fn list(&self) -> Vec<PreviewInfo> {
        let Ok(sessions) = self.sessions.lock() else {
            return Vec::new();
        };
        let mut out: Vec<PreviewInfo> = sessions
            .iter()
            .map(|(id, s)| PreviewInfo {
                id: id.clone(),
                source: s.source.clone(),
                owner: s.owner.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.list().into_iter().map(|p| p.id).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// Stop every preview started by `owner`; returns how many.
    pub async fn stop_owned_by(&self, owner: &str) -> usize {
        let ids: Vec<String> = self
            .list()
            .into_iter()
            .filter(|p| p.owner.as_deref() == Some(owner))
            .map(|p| p.id)
            .collect();
        let mut stopped = 0;
        for id in ids {
            if self.stop(&id).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Tear down previews of clients as they leave the bus. `departed`
    /// yields the unique names that lost their connection.
    pub async fn stop_for_departed<S>(self: Arc<Self>, mut departed: S)
    where
        S: Stream<Item = String> + Unpin,
    {
        while let Some(name) = departed.next().await {
            let stopped = self.stop_owned_by(&name).await;
            if stopped > 0 {
                tracing::info!(client = %name, stopped, "client left the bus; previews stopped");
            }
        }
    }
}
