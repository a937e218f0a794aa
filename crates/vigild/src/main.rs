use anyhow::{Context, Result};
use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vigil_core::gallery::{CosineMatcher, Gallery};
use vigil_core::recognizer::ARCFACE_EMBEDDING_DIM;

mod config;
mod dbus_interface;
mod factory;
mod pipeline;
mod preview;
mod scheduler;
mod store;

use config::Config;
use dbus_interface::{VigilService, BUS_NAME, OBJECT_PATH};
use factory::{OnnxModels, PipelineFactory, SourceOpener};
use pipeline::{PipelineOutputs, PresenceNotification, PreviewFrame};
use preview::PreviewRegistry;
use scheduler::Scheduler;
use store::OccupancyStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = Config::from_env();

    let gallery = match Gallery::load(&config.gallery_path) {
        Ok(g) => {
            tracing::info!(path = %config.gallery_path.display(), identities = g.len(), "gallery loaded");
            g
        }
        Err(e) => {
            tracing::warn!(path = %config.gallery_path.display(), error = %e, "gallery unavailable, every face will be Undetected");
            Gallery::default()
        }
    };
    if let Some(dim) = gallery.dimension().filter(|d| *d != ARCFACE_EMBEDDING_DIM) {
        tracing::warn!(
            path = %config.gallery_path.display(),
            gallery_dim = dim,
            model_dim = ARCFACE_EMBEDDING_DIM,
            "gallery embeddings do not match the recognizer; every face will be Undetected"
        );
    }
    let gallery = Arc::new(gallery);

    let store = Arc::new(
        OccupancyStore::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );
    let functions = config::load_functions(&config.functions_path)?;
    tracing::info!(count = functions.len(), path = %config.functions_path.display(), "scheduled functions loaded");

    let (notify_tx, notify_rx) = mpsc::channel::<PresenceNotification>(config.notification_queue);
    let (frames_tx, frames_rx) = mpsc::channel::<PreviewFrame>(config.notification_queue);

    let open_source: Arc<SourceOpener> = Arc::new(vigil_hw::open_source);
    let config = Arc::new(config);
    let factory = PipelineFactory {
        config: config.clone(),
        gallery: gallery.clone(),
        matcher: Arc::new(CosineMatcher {
            threshold: config.distance_threshold,
        }),
        models: Arc::new(OnnxModels::from_config(&config)),
        open_source,
        outputs: PipelineOutputs {
            notifications: notify_tx,
            writers: Arc::new(vigil_hw::Mp4WriterFactory),
            sink: store.clone(),
        },
    };

    let previews = Arc::new(PreviewRegistry::new(factory.clone(), frames_tx));
    let scheduler = Scheduler::new(factory, functions.clone(), config.schedule_poll);

    let service = VigilService {
        functions,
        schedule: scheduler.status(),
        previews: previews.clone(),
        store,
        gallery_identities: gallery.len(),
        started: Instant::now(),
    };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;
    tracing::info!(bus = BUS_NAME, session = config.session_bus, "D-Bus interface registered");

    let iface = conn
        .object_server()
        .interface::<_, VigilService>(OBJECT_PATH)
        .await?;
    let forward_notifications = tokio::spawn(forward_notifications(iface.clone(), notify_rx));
    let forward_frames = tokio::spawn(forward_preview_frames(iface, frames_rx));

    let departed = departed_clients(&conn).await.context("subscribing to NameOwnerChanged")?;
    let preview_owners = tokio::spawn(previews.clone().stop_for_departed(departed));

    let cancel = CancellationToken::new();
    let schedule_task = tokio::spawn(scheduler.run(cancel.clone()));

    tracing::info!("vigild ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");

    cancel.cancel();
    if let Err(e) = schedule_task.await {
        tracing::error!(error = %e, "scheduler task panicked");
    }
    previews.stop_all().await;

    forward_notifications.abort();
    forward_frames.abort();
    preview_owners.abort();
    Ok(())
}

type ServiceRef = zbus::object_server::InterfaceRef<VigilService>;

/// Unique names of bus clients as they disconnect.
async fn departed_clients(
    conn: &zbus::Connection,
) -> zbus::Result<std::pin::Pin<Box<dyn futures::Stream<Item = String> + Send>>> {
    let dbus = zbus::fdo::DBusProxy::new(conn).await?;
    let changes = dbus.receive_name_owner_changed().await?;
    Ok(Box::pin(changes.filter_map(|signal| async move {
        let args = signal.args().ok()?;
        let name = args.name();
        let gone = name.as_str().starts_with(':') && args.new_owner().is_none();
        gone.then(|| name.to_string())
    })))
}

async fn forward_notifications(iface: ServiceRef, mut rx: mpsc::Receiver<PresenceNotification>) {
    while let Some(notification) = rx.recv().await {
        let json = match serde_json::to_string(&notification) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode notification");
                continue;
            }
        };
        tracing::info!(origin = %notification.origin, people_count = notification.people_count, "presence notification");
        if let Err(e) = VigilService::presence_notification(iface.signal_emitter(), &notification.origin, &json).await {
            tracing::warn!(origin = %notification.origin, error = %e, "failed to emit PresenceNotification");
        }
    }
}

async fn forward_preview_frames(iface: ServiceRef, mut rx: mpsc::Receiver<PreviewFrame>) {
    while let Some(frame) = rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode preview frame");
                continue;
            }
        };
        if let Err(e) = VigilService::preview_frame(iface.signal_emitter(), &frame.preview_id, &json).await {
            tracing::debug!(preview = %frame.preview_id, error = %e, "failed to emit PreviewFrame");
        }
    }
}
