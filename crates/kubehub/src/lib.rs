//! Ordin kubehub: list+watch wiring that turns kube watch events into add/update/delete callbacks.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use ordin_core::{Change, Mirrored};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod tracker;

pub use tracker::Tracker;

/// Receives detected changes. Called from the single watcher task, in event order.
pub trait EventHandler<K>: Send + Sync + 'static {
    fn on_add(&self, obj: K);
    /// `old` is the last state seen before `new`.
    fn on_update(&self, old: K, new: K);
    fn on_delete(&self, obj: K);
}

fn dispatch<K: Mirrored>(handler: &dyn EventHandler<K>, change: Change<K>) {
    match change {
        Change::Add(obj) => handler.on_add(obj),
        Change::Update { old, new } => handler.on_update(old, new),
        Change::Delete(obj) => handler.on_delete(obj),
    }
}

/// Api handle for `K` in `namespace`, or across all namespaces.
pub async fn api_for<K>(namespace: Option<&str>) -> Result<Api<K>>
where
    K: Mirrored + kube::Resource<Scope = NamespaceResourceScope>,
{
    let client = Client::try_default().await.context("building kube client")?;
    Ok(match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    })
}

/// A running watcher task plus its initial-sync signal.
pub struct WatchHandle {
    synced: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Resolves once the first full list has been delivered to the handler.
    /// Returns false if the watcher stopped before syncing.
    pub async fn wait_synced(&mut self) -> bool {
        self.synced.wait_for(|s| *s).await.is_ok()
    }

    pub fn is_synced(&self) -> bool { *self.synced.borrow() }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "watcher task panicked");
        }
    }
}

/// Start list+watch on `api` with the default backoff; runs until `cancel` fires.
pub fn spawn_watcher<K>(api: Api<K>, handler: Arc<dyn EventHandler<K>>, cancel: CancellationToken) -> WatchHandle
where
    K: Mirrored,
{
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    spawn_stream(stream, handler, cancel)
}

/// Drive any watch event stream. Split out from [`spawn_watcher`] so the
/// event-to-change translation can run without a cluster.
pub fn spawn_stream<K, S>(stream: S, handler: Arc<dyn EventHandler<K>>, cancel: CancellationToken) -> WatchHandle
where
    K: Mirrored,
    S: Stream<Item = Result<Event<K>, watcher::Error>> + Send + 'static,
{
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(drive(stream, handler, tx, cancel));
    WatchHandle { synced: rx, task }
}

async fn drive<K, S>(stream: S, handler: Arc<dyn EventHandler<K>>, synced: watch::Sender<bool>, cancel: CancellationToken)
where
    K: Mirrored,
    S: Stream<Item = Result<Event<K>, watcher::Error>> + Send + 'static,
{
    let mut tracker = Tracker::new();
    futures::pin_mut!(stream);
    info!(kind = %K::kind(&()), "watcher started");
    loop {
        let ev = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        let changes: Vec<Change<K>> = match ev {
            Some(Ok(Event::Applied(obj))) => {
                counter!("ordin_watch_events_total", 1, "event" => "applied");
                tracker.applied(obj).into_iter().collect()
            }
            Some(Ok(Event::Deleted(obj))) => {
                counter!("ordin_watch_events_total", 1, "event" => "deleted");
                tracker.deleted(obj).into_iter().collect()
            }
            Some(Ok(Event::Restarted(list))) => {
                counter!("ordin_watch_events_total", 1, "event" => "restarted");
                debug!(count = list.len(), "watch relist");
                tracker.restarted(list)
            }
            Some(Err(e)) => {
                counter!("ordin_watch_errors_total", 1);
                warn!(error = %e, "watch error; backing off");
                continue;
            }
            None => {
                warn!("watcher stream ended");
                break;
            }
        };
        for change in changes {
            dispatch(handler.as_ref(), change);
        }
        if !*synced.borrow() && tracker.listed() {
            synced.send_replace(true);
            info!(objects = tracker.len(), "watcher synced");
        }
    }
    info!("watcher stopped");
}
