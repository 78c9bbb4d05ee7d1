//! Signs approved CertificateSigningRequests
//!
//! Every change to a CSR queues its key. Workers then look up the latest mirrored state of the object,
//! and sign it if it has been approved but does not have a certificate yet.

use std::{future::Future, panic::AssertUnwindSafe, pin::pin, sync::Arc, time::Duration};

use const_format::concatcp;
use futures::FutureExt as _;
use snafu::{ResultExt as _, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument as _};

use crate::{
    api::{ApprovalState, CertificateSigningRequest},
    mirror::{self, EventHandler, ObjectKey, Reflector, Resource as _},
    request,
    signer::Signer,
    store::{self, CsrListWatch, CsrStore, ListParams, Subresource},
    utils::error_full_message,
    workqueue::{Backoff, WorkQueue},
    OPERATOR_NAME,
};

pub const CONTROLLER_NAME: &str = "csrsigning";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

#[derive(Clone, Debug)]
pub struct Config {
    /// How many CSRs can be reconciled concurrently
    pub workers: usize,

    /// How often all CSRs are reconciled, even if they have not changed
    pub resync_period: Duration,

    /// How many times a failing CSR is retried before it is dropped until the next resync
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    pub relist_backoff: Duration,

    /// How long to wait for in-flight reconciliations before aborting them on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_period: Duration::from_secs(15),
            max_retries: 5,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_secs(1000),
            relist_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to read CertificateSigningRequest from the store"))]
    GetCsr { source: store::Error },

    #[snafu(display("stored request is invalid"))]
    ValidateRequest { source: request::Error },

    #[snafu(display("failed to sign request"))]
    SigningFailure {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("CertificateSigningRequest was modified while it was being signed"))]
    VersionConflict { source: store::Error },

    #[snafu(display("failed to write certificate to CertificateSigningRequest status"))]
    WriteStatus { source: store::Error },

    #[snafu(display("reconciliation was aborted during shutdown"))]
    Cancelled,
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum SigningState {
    /// Not yet approved or denied
    Pending,
    Denied,
    /// Approved and signed
    Issued,
    /// Approved but not signed yet
    ReadyToSign,
}

pub fn signing_state(csr: &CertificateSigningRequest) -> SigningState {
    match csr.approval_state() {
        ApprovalState::Pending => SigningState::Pending,
        ApprovalState::Denied => SigningState::Denied,
        ApprovalState::Approved if csr.status.certificate.is_some() => SigningState::Issued,
        ApprovalState::Approved => SigningState::ReadyToSign,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// The CSR was deleted before it could be reconciled
    Gone,
    Unchanged(SigningState),
    Signed,
}

struct Ctx<S, G> {
    store: Arc<S>,
    signer: Arc<G>,
    mirror: mirror::Store<CertificateSigningRequest>,
    queue: WorkQueue<ObjectKey>,
    config: Config,
    /// Cancels in-flight signing and write-backs once the shutdown timeout has expired
    abort: CancellationToken,
}

pub struct CsrSigningController<S: CsrStore, G> {
    reflector: Reflector<CertificateSigningRequest, CsrListWatch<S>>,
    ctx: Arc<Ctx<S, G>>,
}

impl<S: CsrStore, G: Signer> CsrSigningController<S, G> {
    pub fn new(store: Arc<S>, signer: Arc<G>, config: Config) -> Self {
        let (mirror, reflector) = mirror::reflector(
            CsrListWatch::new(store.clone(), ListParams::default()),
            mirror::Config {
                resync_period: config.resync_period,
                relist_backoff: config.relist_backoff,
            },
        );
        let queue = WorkQueue::new(Backoff {
            base: config.retry_base_delay,
            max: config.retry_max_delay,
        });
        Self {
            reflector,
            ctx: Arc::new(Ctx {
                store,
                signer,
                mirror,
                queue,
                config,
                abort: CancellationToken::new(),
            }),
        }
    }

    /// The controller's view of the CSRs
    pub fn mirror(&self) -> mirror::Store<CertificateSigningRequest> {
        self.ctx.mirror.clone()
    }

    /// Runs the controller until `shutdown` is cancelled and all queued CSRs have been handled
    pub async fn run(self, shutdown: CancellationToken) {
        let Self { reflector, ctx } = self;
        info!(
            controller = FULL_CONTROLLER_NAME,
            workers = ctx.config.workers,
            "Starting controller"
        );
        let handler = Arc::new(EnqueueHandler {
            queue: ctx.queue.clone(),
        });
        let reflector = tokio::spawn(reflector.run(handler, shutdown.clone()));
        let workers = (0..ctx.config.workers)
            .map(|worker| {
                tokio::spawn(
                    ctx.clone()
                        .run_worker()
                        .instrument(info_span!("worker", worker)),
                )
            })
            .collect::<Vec<_>>();

        shutdown.cancelled().await;
        info!(controller = FULL_CONTROLLER_NAME, "Shutting down controller");
        ctx.queue.shut_down();
        if let Err(error) = reflector.await {
            error!(error = &error as &dyn std::error::Error, "Reflector failed");
        }
        let mut workers = pin!(futures::future::join_all(workers));
        if tokio::time::timeout(ctx.config.shutdown_timeout, workers.as_mut())
            .await
            .is_err()
        {
            warn!(
                timeout = ?ctx.config.shutdown_timeout,
                "Workers did not finish in time, aborting in-flight reconciliations"
            );
            ctx.abort.cancel();
            workers.await;
        }
        info!(controller = FULL_CONTROLLER_NAME, "Controller stopped");
    }
}

/// Queues every CSR that the mirror reports as changed
struct EnqueueHandler {
    queue: WorkQueue<ObjectKey>,
}

impl EnqueueHandler {
    fn enqueue(&self, csr: &CertificateSigningRequest, event: &str) {
        let key = csr.key();
        debug!(csr = %key, event, "Queueing CertificateSigningRequest");
        self.queue.add(key);
    }
}

impl EventHandler<CertificateSigningRequest> for EnqueueHandler {
    fn on_add(&self, csr: &CertificateSigningRequest) {
        self.enqueue(csr, "add");
    }

    fn on_update(&self, _old: &CertificateSigningRequest, new: &CertificateSigningRequest) {
        self.enqueue(new, "update");
    }

    fn on_delete(&self, csr: &CertificateSigningRequest) {
        self.enqueue(csr, "delete");
    }
}

/// Releases a key from the queue once its worker is done with it, however the worker exits
struct DoneGuard<'a> {
    queue: &'a WorkQueue<ObjectKey>,
    key: &'a ObjectKey,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

impl<S: CsrStore, G: Signer> Ctx<S, G> {
    async fn run_worker(self: Arc<Self>) {
        while let Some(key) = self.queue.get().await {
            let _done = DoneGuard {
                queue: &self.queue,
                key: &key,
            };
            match AssertUnwindSafe(self.reconcile(&key)).catch_unwind().await {
                Ok(Ok(reconciled)) => {
                    debug!(csr = %key, ?reconciled, "Finished syncing CertificateSigningRequest");
                    self.queue.forget(&key);
                }
                Ok(Err(err)) => self.handle_error(&key, &err),
                Err(_) => {
                    error!(csr = %key, "Reconciler panicked");
                    self.retry(&key, "Panic", "reconciler panicked".to_string());
                }
            }
        }
        debug!("Work queue drained, stopping worker");
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Reconciled> {
        let Some(mirrored) = self.mirror.get_by_key(key) else {
            debug!(csr = %key, "CertificateSigningRequest no longer exists");
            return Ok(Reconciled::Gone);
        };
        let state = signing_state(&mirrored);
        if state != SigningState::ReadyToSign {
            return Ok(Reconciled::Unchanged(state));
        }

        // The mirror may lag behind our own write-back, so signing is decided on the stored object
        let csr = match self.abortable(self.store.get(key)).await? {
            Ok(csr) => csr,
            Err(err) if err.is_not_found() => {
                debug!(csr = %key, "CertificateSigningRequest no longer exists");
                return Ok(Reconciled::Gone);
            }
            Err(err) => return Err(err).context(GetCsrSnafu),
        };
        let state = signing_state(&csr);
        if state != SigningState::ReadyToSign {
            debug!(csr = %key, %state, "Mirrored CertificateSigningRequest is outdated");
            return Ok(Reconciled::Unchanged(state));
        }

        request::parse_and_verify(&csr.spec.request).context(ValidateRequestSnafu)?;
        let certificate = self
            .abortable(self.signer.sign(&csr.spec.request))
            .await?
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
            .context(SigningFailureSnafu)?;

        // Based on the version that was read, so that concurrent changes are not overwritten
        let mut signed = csr;
        signed.status.certificate = Some(certificate);
        match self
            .abortable(self.store.update_subresource(Subresource::Status, signed))
            .await?
        {
            Ok(_) => {
                info!(csr = %key, "Wrote certificate to CertificateSigningRequest");
                Ok(Reconciled::Signed)
            }
            Err(err) if err.is_not_found() => {
                debug!(csr = %key, "CertificateSigningRequest was deleted while it was being signed");
                Ok(Reconciled::Gone)
            }
            Err(err) if err.is_conflict() => Err(err).context(VersionConflictSnafu),
            Err(err) => Err(err).context(WriteStatusSnafu),
        }
    }

    async fn abortable<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => CancelledSnafu.fail(),
            output = fut => Ok(output),
        }
    }

    fn handle_error(&self, key: &ObjectKey, err: &Error) {
        let message = error_full_message(err);
        if let Error::ValidateRequest { .. } = err {
            error!(csr = %key, error = %message, "Not retrying CertificateSigningRequest with invalid request");
            self.queue.forget(key);
            return;
        }
        self.retry(key, err.category(), message);
    }

    fn retry(&self, key: &ObjectKey, category: &str, message: String) {
        let requeues = self.queue.num_requeues(key);
        if requeues < self.config.max_retries {
            warn!(
                csr = %key,
                category,
                error = %message,
                attempt = requeues + 1,
                "Failed to reconcile CertificateSigningRequest, retrying"
            );
            self.queue.add_rate_limited(key.clone());
        } else {
            error!(
                csr = %key,
                category,
                error = %message,
                "Dropping CertificateSigningRequest out of the queue after too many failures"
            );
            self.queue.forget(key);
        }
    }
}
