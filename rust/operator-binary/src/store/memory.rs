//! A [`CsrStore`] that keeps everything in memory

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use futures::StreamExt as _;
use snafu::{ensure, OptionExt as _};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{
    AlreadyExistsSnafu, ConflictSnafu, CsrStore, GoneSnafu, ListParams, NotFoundSnafu, Result,
    Subresource, WatchStream,
};
use crate::{
    admission::{self, Surface},
    api::{CertificateSigningRequest, UserInfo},
    mirror::{ObjectKey, ObjectList, Resource, WatchEvent},
};

const DEFAULT_HISTORY_LIMIT: usize = 1000;

struct Watcher {
    params: ListParams,
    events: mpsc::UnboundedSender<Result<WatchEvent<CertificateSigningRequest>>>,
}

struct State {
    objects: BTreeMap<ObjectKey, CertificateSigningRequest>,
    revision: u64,
    /// Recent events, oldest first, tagged with the revision that they produced
    history: VecDeque<(u64, WatchEvent<CertificateSigningRequest>)>,
    history_limit: usize,
    /// Latest revision that has been evicted from `history`
    compacted: u64,
    watchers: Vec<Watcher>,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn publish(&mut self, revision: u64, event: WatchEvent<CertificateSigningRequest>) {
        self.watchers.retain(|watcher| {
            !watcher.params.matches(event.object()) || watcher.events.send(Ok(event.clone())).is_ok()
        });
        self.history.push_back((revision, event));
        while self.history.len() > self.history_limit {
            if let Some((evicted, _)) = self.history.pop_front() {
                self.compacted = evicted;
            }
        }
    }
}

/// Runs admission on every write, assigns resource versions, and keeps a bounded history of
/// changes for watches to resume from
pub struct InMemoryStore {
    state: Mutex<State>,
    writes: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                history_limit,
                compacted: 0,
                watchers: Vec::new(),
            }),
            writes: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of write requests received so far, whether they succeeded or not
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Ends all open watch streams, as if the connection to the store was lost
    pub fn disconnect_watchers(&self) {
        let mut state = self.state();
        debug!(watchers = state.watchers.len(), "Disconnecting watchers");
        state.watchers.clear();
    }

    fn update_surface(
        &self,
        surface: Surface,
        csr: CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let strategy = admission::strategy(surface);
        let key = csr.key();
        let mut state = self.state();
        let old = state
            .objects
            .get(&key)
            .with_context(|| NotFoundSnafu { key: key.clone() })?;
        let expected = &csr.metadata.resource_version;
        ensure!(
            (expected.is_empty() && strategy.allow_unconditional_update())
                || *expected == old.metadata.resource_version,
            ConflictSnafu {
                key,
                expected,
                actual: &old.metadata.resource_version,
            }
        );

        let mut new = admission::admit_update(surface, csr, old)?;
        new.metadata.resource_version.clone_from(&old.metadata.resource_version);
        if new == *old {
            debug!(csr = %key, %surface, "Update is a no-op");
            return Ok(new);
        }
        let revision = state.next_revision();
        new.metadata.resource_version = revision.to_string();
        state.objects.insert(key.clone(), new.clone());
        state.publish(revision, WatchEvent::Modified(new.clone()));
        debug!(csr = %key, %surface, resource_version = revision, "Updated");
        Ok(new)
    }
}

#[async_trait]
impl CsrStore for InMemoryStore {
    async fn list(&self, params: &ListParams) -> Result<ObjectList<CertificateSigningRequest>> {
        let state = self.state();
        Ok(ObjectList {
            items: state
                .objects
                .values()
                .filter(|csr| params.matches(csr))
                .cloned()
                .collect(),
            resource_version: state.revision.to_string(),
        })
    }

    async fn watch(&self, params: &ListParams, resource_version: &str) -> Result<WatchStream> {
        let mut state = self.state();
        let since = if resource_version.is_empty() {
            state.revision
        } else {
            resource_version
                .parse::<u64>()
                .ok()
                .filter(|&since| since >= state.compacted && since <= state.revision)
                .context(GoneSnafu { resource_version })?
        };
        let (tx, rx) = mpsc::unbounded_channel();
        for (_, event) in state
            .history
            .iter()
            .filter(|(revision, event)| *revision > since && params.matches(event.object()))
        {
            // The receiver is still in scope, so this can't fail
            let _ = tx.send(Ok(event.clone()));
        }
        state.watchers.push(Watcher {
            params: params.clone(),
            events: tx,
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn get(&self, key: &ObjectKey) -> Result<CertificateSigningRequest> {
        self.state()
            .objects
            .get(key)
            .cloned()
            .with_context(|| NotFoundSnafu { key: key.clone() })
    }

    async fn create(
        &self,
        csr: CertificateSigningRequest,
        user: &UserInfo,
    ) -> Result<CertificateSigningRequest> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut csr = admission::admit_create(csr, user)?;
        let key = csr.key();
        let mut state = self.state();
        ensure!(
            !state.objects.contains_key(&key),
            AlreadyExistsSnafu { key }
        );
        let revision = state.next_revision();
        csr.metadata.resource_version = revision.to_string();
        csr.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        csr.metadata.creation_timestamp = Some(OffsetDateTime::now_utc());
        state.objects.insert(key.clone(), csr.clone());
        state.publish(revision, WatchEvent::Added(csr.clone()));
        debug!(csr = %key, resource_version = revision, "Created");
        Ok(csr)
    }

    async fn update(&self, csr: CertificateSigningRequest) -> Result<CertificateSigningRequest> {
        self.update_surface(Surface::Main, csr)
    }

    async fn update_subresource(
        &self,
        subresource: Subresource,
        csr: CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest> {
        self.update_surface(subresource.into(), csr)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let mut csr = state
            .objects
            .remove(key)
            .with_context(|| NotFoundSnafu { key: key.clone() })?;
        let revision = state.next_revision();
        csr.metadata.resource_version = revision.to_string();
        state.publish(revision, WatchEvent::Deleted(csr));
        debug!(csr = %key, resource_version = revision, "Deleted");
        Ok(())
    }
}
