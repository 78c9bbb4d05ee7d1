//! Local, eventually consistent mirror of objects held by an external store
//!
//! A [`Reflector`] lists all objects, then follows the store's change stream and applies every
//! event to a shared [`Store`]. Readers only ever take snapshot reads from the [`Store`], so slow
//! consumers (such as signing) never block event application.

use std::{
    collections::HashMap,
    fmt::{Debug, Display},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::utils::error_full_message;

/// Identifies an object within a store, formatted as `namespace/name` (or `name` for cluster-scoped objects)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{namespace}/{name}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// An object that can be mirrored
pub trait Resource: Clone + Send + Sync + 'static {
    fn key(&self) -> ObjectKey;

    /// Opaque revision token, changes whenever the store persists a modification
    fn resource_version(&self) -> &str;
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ObjectList<T> {
    pub items: Vec<T>,
    /// Revision of the store at the time of listing, watches resume from here
    pub resource_version: String,
}

/// Source of truth that a [`Reflector`] mirrors
#[async_trait]
pub trait ListWatch<T: Resource>: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn list(&self) -> Result<ObjectList<T>, Self::Error>;

    /// Streams all changes made after `resource_version`.
    ///
    /// The stream ending (or yielding an error) is treated as a disconnect, after which the
    /// [`Reflector`] relists.
    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<T>, Self::Error>>, Self::Error>;
}

/// Receives notifications for every change applied to a [`Store`]
///
/// Handlers are called from the reflector task, in the order that the events were received,
/// and should not block.
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, obj: &T);
    fn on_update(&self, old: &T, new: &T);
    fn on_delete(&self, obj: &T);
}

struct StoreInner<T> {
    objects: RwLock<HashMap<ObjectKey, Arc<T>>>,
    synced: AtomicBool,
}

/// Read handle to the mirrored objects
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for Store<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("len", &self.read().len())
            .field("synced", &self.has_synced())
            .finish()
    }
}

impl<T> Store<T> {
    fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                objects: RwLock::default(),
                synced: AtomicBool::new(false),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObjectKey, Arc<T>>> {
        self.inner
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObjectKey, Arc<T>>> {
        self.inner
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the last observed state of the object, without waiting for the store
    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<T>> {
        self.read().get(key).cloned()
    }

    /// Returns a snapshot of all currently known objects
    pub fn state(&self) -> Vec<Arc<T>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Whether the initial listing has been applied
    pub fn has_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// How often every known object is replayed through [`EventHandler::on_update`], zero disables resyncs
    pub resync_period: Duration,

    /// How long to wait before relisting after a failed list or a disconnected watch
    pub relist_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(15),
            relist_backoff: Duration::from_secs(1),
        }
    }
}

/// Creates a reflector for `list_watch`, and the [`Store`] that it keeps up to date
pub fn reflector<T: Resource, L: ListWatch<T>>(
    list_watch: L,
    config: Config,
) -> (Store<T>, Reflector<T, L>) {
    let store = Store::new();
    (
        store.clone(),
        Reflector {
            list_watch,
            store,
            config,
        },
    )
}

pub struct Reflector<T, L> {
    list_watch: L,
    store: Store<T>,
    config: Config,
}

impl<T: Resource, L: ListWatch<T>> Reflector<T, L> {
    /// Mirrors the store until `shutdown` is cancelled
    pub async fn run(self, handler: Arc<dyn EventHandler<T>>, shutdown: CancellationToken) {
        let mut resync = (!self.config.resync_period.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(
                Instant::now() + self.config.resync_period,
                self.config.resync_period,
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        loop {
            let listing = tokio::select! {
                _ = shutdown.cancelled() => break,
                listing = self.list_watch.list() => listing,
            };
            let resource_version = match listing {
                Ok(listing) => {
                    self.replace(listing.items, &*handler);
                    listing.resource_version
                }
                Err(error) => {
                    warn!(error = error_full_message(&error), "Failed to list objects");
                    if self.backoff(&shutdown).await {
                        continue;
                    }
                    break;
                }
            };
            let watch = tokio::select! {
                _ = shutdown.cancelled() => break,
                watch = self.list_watch.watch(&resource_version) => watch,
            };
            match watch {
                Ok(mut events) => loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tick(&mut resync) => self.resync(&*handler),
                        event = events.next() => match event {
                            Some(Ok(event)) => self.apply(event, &*handler),
                            Some(Err(error)) => {
                                warn!(error = error_full_message(&error), "Watch failed, relisting");
                                break;
                            }
                            None => {
                                info!("Watch stream closed, relisting");
                                break;
                            }
                        },
                    }
                },
                Err(error) => {
                    warn!(
                        %resource_version,
                        error = error_full_message(&error),
                        "Failed to start watch, relisting"
                    );
                }
            }
            if !self.backoff(&shutdown).await {
                break;
            }
        }
        debug!("Reflector stopped");
    }

    /// Returns `false` if the reflector should stop instead
    async fn backoff(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.relist_backoff) => true,
        }
    }

    /// Reconciles the mirror with a full listing of the store
    fn replace(&self, items: Vec<T>, handler: &dyn EventHandler<T>) {
        let listed = items
            .into_iter()
            .map(|obj| (obj.key(), Arc::new(obj)))
            .collect::<HashMap<_, _>>();
        let mut added = Vec::new();
        let mut updated = Vec::new();
        let deleted;
        {
            let mut objects = self.store.write();
            for (key, obj) in &listed {
                match objects.get(key) {
                    None => added.push(obj.clone()),
                    Some(old) if old.resource_version() != obj.resource_version() => {
                        updated.push((old.clone(), obj.clone()))
                    }
                    Some(_) => {}
                }
            }
            let previous = std::mem::replace(&mut *objects, listed);
            deleted = previous
                .into_iter()
                .filter(|(key, _)| !objects.contains_key(key))
                .map(|(_, obj)| obj)
                .collect::<Vec<_>>();
        }
        self.store.inner.synced.store(true, Ordering::Release);
        debug!(
            added = added.len(),
            updated = updated.len(),
            deleted = deleted.len(),
            "Applied listing"
        );
        for obj in deleted {
            handler.on_delete(&obj);
        }
        for obj in added {
            handler.on_add(&obj);
        }
        for (old, new) in updated {
            handler.on_update(&old, &new);
        }
    }

    fn apply(&self, event: WatchEvent<T>, handler: &dyn EventHandler<T>) {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let obj = Arc::new(obj);
                let old = self.store.write().insert(obj.key(), obj.clone());
                match old {
                    Some(old) => handler.on_update(&old, &obj),
                    None => handler.on_add(&obj),
                }
            }
            WatchEvent::Deleted(obj) => {
                let old = self.store.write().remove(&obj.key());
                handler.on_delete(old.as_deref().unwrap_or(&obj));
            }
        }
    }

    fn resync(&self, handler: &dyn EventHandler<T>) {
        let objects = self.store.state();
        debug!(objects = objects.len(), "Resyncing");
        for obj in objects {
            handler.on_update(&obj, &obj);
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
