use crate::config::FunctionConfig;
use crate::preview::PreviewRegistry;
use crate::scheduler::{RunState, ScheduleStatus};
use crate::store::OccupancyStore;
use std::sync::Arc;
use std::time::Instant;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.vigil.Presence1";
pub const OBJECT_PATH: &str = "/org/vigil/Presence1";

/// D-Bus interface for the Vigil presence daemon.
///
/// Bus name: org.vigil.Presence1
/// Object path: /org/vigil/Presence1
pub struct VigilService {
    pub functions: Vec<FunctionConfig>,
    pub schedule: ScheduleStatus,
    pub previews: Arc<PreviewRegistry>,
    pub store: Arc<OccupancyStore>,
    pub gallery_identities: usize,
    pub started: Instant,
}

impl VigilService {
    fn status_json(&self) -> serde_json::Value {
        let running = self
            .schedule
            .lock()
            .map(|s| s.values().filter(|st| **st == RunState::Running).count())
            .unwrap_or(0);
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started.elapsed().as_secs(),
            "gallery_identities": self.gallery_identities,
            "functions": self.functions.len(),
            "functions_running": running,
            "previews": self.previews.list(),
        })
    }

    fn functions_json(&self) -> serde_json::Value {
        let schedule = self.schedule.lock().ok();
        let entries: Vec<serde_json::Value> = self
            .functions
            .iter()
            .map(|f| {
                let state = schedule
                    .as_ref()
                    .and_then(|s| s.get(&f.id).cloned())
                    .unwrap_or(RunState::Idle);
                let latest = self.store.recent(f.id, 1).ok().and_then(|mut r| r.pop());
                serde_json::json!({ "function": f, "status": state, "latest_aggregate": latest })
            })
            .collect();
        serde_json::Value::Array(entries)
    }
}

#[interface(name = "org.vigil.Presence1")]
impl VigilService {
    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }

    /// List scheduled functions with their current run state.
    async fn list_functions(&self) -> zbus::fdo::Result<String> {
        Ok(self.functions_json().to_string())
    }

    /// Start a live preview on `source` ("0" is the default camera).
    ///
    /// The preview belongs to the calling connection and stops when it
    /// disconnects.
    async fn start_preview(
        &self,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
        source: &str,
    ) -> zbus::fdo::Result<String> {
        let owner = hdr.sender().map(|s| s.to_string());
        tracing::info!(source, owner = ?owner, "start_preview requested");
        self.previews
            .start(source, owner.as_deref())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Stop a live preview. Returns false for an unknown id.
    async fn stop_preview(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "stop_preview requested");
        Ok(self.previews.stop(id).await)
    }

    #[zbus(signal)]
    pub async fn preview_frame(emitter: &SignalEmitter<'_>, id: &str, json: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn presence_notification(
        emitter: &SignalEmitter<'_>,
        function: &str,
        json: &str,
    ) -> zbus::Result<()>;
}
