//! Interface to the object store that persists CSRs

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use snafu::Snafu;

use crate::{
    admission::{self, Surface},
    api::{CertificateSigningRequest, UserInfo},
    mirror::{ListWatch, ObjectKey, ObjectList, WatchEvent},
};

pub mod memory;

/// A part of the object that is written separately from the object itself
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Subresource {
    Status,
    Approval,
}

impl From<Subresource> for Surface {
    fn from(subresource: Subresource) -> Self {
        match subresource {
            Subresource::Status => Surface::Status,
            Subresource::Approval => Surface::Approval,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListParams {
    /// Only objects that carry all of these labels are selected
    pub label_selector: BTreeMap<String, String>,
}

impl ListParams {
    pub fn labels(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.label_selector.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, csr: &CertificateSigningRequest) -> bool {
        self.label_selector
            .iter()
            .all(|(key, value)| csr.metadata.labels.get(key) == Some(value))
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("CertificateSigningRequest {key} not found"))]
    NotFound { key: ObjectKey },

    #[snafu(display("CertificateSigningRequest {key} already exists"))]
    AlreadyExists { key: ObjectKey },

    #[snafu(display(
        "CertificateSigningRequest {key} has been modified (expected version {expected:?}, found {actual:?})"
    ))]
    Conflict {
        key: ObjectKey,
        expected: String,
        actual: String,
    },

    #[snafu(display("CertificateSigningRequest was rejected"), context(false))]
    Invalid { source: admission::Error },

    #[snafu(display("resource version {resource_version:?} is too old"))]
    Gone { resource_version: String },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent<CertificateSigningRequest>>>;

/// Persists CSRs, running every write through the admission strategy of its surface
#[async_trait]
pub trait CsrStore: Send + Sync + 'static {
    async fn list(&self, params: &ListParams) -> Result<ObjectList<CertificateSigningRequest>>;

    /// Streams all changes after `resource_version`, or after the current version if empty
    async fn watch(&self, params: &ListParams, resource_version: &str) -> Result<WatchStream>;

    async fn get(&self, key: &ObjectKey) -> Result<CertificateSigningRequest>;

    async fn create(
        &self,
        csr: CertificateSigningRequest,
        user: &UserInfo,
    ) -> Result<CertificateSigningRequest>;

    /// Fails with [`Error::Conflict`] if `csr` is not based on the latest version,
    /// unless its resource version is empty
    async fn update(&self, csr: CertificateSigningRequest) -> Result<CertificateSigningRequest>;

    async fn update_subresource(
        &self,
        subresource: Subresource,
        csr: CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest>;

    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// Mirrors the CSRs of a [`CsrStore`]
pub struct CsrListWatch<S> {
    store: Arc<S>,
    params: ListParams,
}

impl<S> CsrListWatch<S> {
    pub fn new(store: Arc<S>, params: ListParams) -> Self {
        Self { store, params }
    }
}

#[async_trait]
impl<S: CsrStore> ListWatch<CertificateSigningRequest> for CsrListWatch<S> {
    type Error = Error;

    async fn list(&self) -> Result<ObjectList<CertificateSigningRequest>> {
        self.store.list(&self.params).await
    }

    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<CertificateSigningRequest>>>> {
        self.store.watch(&self.params, resource_version).await
    }
}
