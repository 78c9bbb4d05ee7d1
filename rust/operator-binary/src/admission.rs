//! Decides what may be written through each write surface of a CSR
//!
//! Every write to the store passes through one [`Strategy`]. The strategy first restores all
//! fields that the surface may not touch, then validates the result, and finally recomputes the
//! fields that are derived from the request.

use std::fmt;

use snafu::{ResultExt as _, Snafu};
use strum::Display;

use crate::{
    api::{
        ApprovalState, CertificateSigningRequest, CertificateSigningRequestStatus, ObjectMeta,
        RequestConditionType, UserInfo,
    },
    request::{self, RequestErrorKind},
    utils::error_full_message,
};

const MAX_NAME_LENGTH: usize = 253;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum FieldErrorType {
    Required,
    Invalid,
    Forbidden,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    /// Path of the offending field, such as `spec.request`
    pub field: &'static str,
    pub error_type: FieldErrorType,
    pub detail: String,
    /// Why the request was rejected, for errors in `spec.request`
    pub request_error: Option<RequestErrorKind>,
}

impl FieldError {
    fn new(field: &'static str, error_type: FieldErrorType, detail: impl Into<String>) -> Self {
        Self {
            field,
            error_type,
            detail: detail.into(),
            request_error: None,
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.field, self.error_type, self.detail)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldErrors(pub Vec<FieldError>);

impl FieldErrors {
    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// The first request classification among the errors, if any
    pub fn request_error(&self) -> Option<RequestErrorKind> {
        self.iter().find_map(|err| err.request_error)
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("CertificateSigningRequest {name:?} is invalid: {errors}"))]
    Invalid { name: String, errors: FieldErrors },

    #[snafu(display("failed to derive fields of CertificateSigningRequest {name:?}"))]
    Internal {
        source: request::Error,
        name: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            Error::Invalid { errors, .. } => Some(errors),
            Error::Internal { .. } => None,
        }
    }
}

/// The parts of a CSR that can be written independently
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Surface {
    /// The object itself, which only leaves metadata writable once created
    Main,
    Status,
    Approval,
}

pub trait Strategy {
    /// Restores every field of `new` that this surface may not change
    fn prepare_for_update(&self, new: &mut CertificateSigningRequest, old: &CertificateSigningRequest);

    fn validate_update(
        &self,
        new: &CertificateSigningRequest,
        old: &CertificateSigningRequest,
    ) -> Vec<FieldError>;

    /// Recomputes the fields derived from the request
    fn canonicalize(&self, _csr: &mut CertificateSigningRequest) -> Result<(), request::Error> {
        Ok(())
    }

    /// Whether objects live in a namespace, cluster-scoped objects may not name one
    fn namespace_scoped(&self) -> bool {
        false
    }

    /// Whether updates without a resource version are applied to the latest version
    fn allow_unconditional_update(&self) -> bool {
        true
    }
}

/// Governs creation and updates of the object itself
#[derive(Clone, Copy, Debug, Default)]
pub struct CsrStrategy;

impl CsrStrategy {
    pub fn prepare_for_create(&self, csr: &mut CertificateSigningRequest, user: &UserInfo) {
        csr.spec.clear_derived();
        csr.spec.username = Some(user.username.clone()).filter(|name| !name.is_empty());
        csr.spec.uid = Some(user.uid.clone()).filter(|uid| !uid.is_empty());
        csr.spec.groups = user.groups.clone();
        csr.status = CertificateSigningRequestStatus::default();
    }

    pub fn validate(&self, csr: &CertificateSigningRequest) -> Vec<FieldError> {
        let mut errors = validate_metadata(&csr.metadata, self.namespace_scoped());
        errors.extend(validate_request(&csr.spec.request));
        errors
    }

    /// Strips everything from `csr` that would be regenerated if it was created again
    ///
    /// The requester's identity is kept for `exact` exports.
    pub fn export(&self, csr: &mut CertificateSigningRequest, exact: bool) {
        csr.spec.clear_derived();
        csr.status = CertificateSigningRequestStatus::default();
        if !exact {
            csr.spec.clear_identity();
        }
    }
}

impl Strategy for CsrStrategy {
    fn prepare_for_update(&self, new: &mut CertificateSigningRequest, old: &CertificateSigningRequest) {
        new.spec = old.spec.clone();
        new.status = old.status.clone();
    }

    fn validate_update(
        &self,
        new: &CertificateSigningRequest,
        old: &CertificateSigningRequest,
    ) -> Vec<FieldError> {
        let mut errors = self.validate(new);
        errors.extend(validate_metadata_update(&new.metadata, &old.metadata));
        errors
    }

    fn canonicalize(&self, csr: &mut CertificateSigningRequest) -> Result<(), request::Error> {
        let parsed = request::parse_and_verify(&csr.spec.request)?;
        let fingerprint = request::fingerprint(&parsed)?;
        csr.spec
            .set_derived(fingerprint, request::canonicalize(&parsed));
        Ok(())
    }
}

/// Governs the status subresource, which carries the issued certificate
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusStrategy;

impl Strategy for StatusStrategy {
    fn prepare_for_update(&self, new: &mut CertificateSigningRequest, old: &CertificateSigningRequest) {
        new.spec = old.spec.clone();
        new.status.conditions = old.status.conditions.clone();
    }

    fn validate_update(
        &self,
        new: &CertificateSigningRequest,
        old: &CertificateSigningRequest,
    ) -> Vec<FieldError> {
        let mut errors = validate_common_update(self, new, old);
        match (&old.status.certificate, &new.status.certificate) {
            (Some(old_cert), new_cert) if new_cert.as_ref() != Some(old_cert) => {
                errors.push(FieldError::new(
                    "status.certificate",
                    FieldErrorType::Forbidden,
                    "may not be changed once issued",
                ))
            }
            (None, Some(_)) if new.approval_state() != ApprovalState::Approved => errors
                .push(FieldError::new(
                    "status.certificate",
                    FieldErrorType::Forbidden,
                    format!(
                        "may only be issued for approved requests, request is {}",
                        new.approval_state()
                    ),
                )),
            _ => {}
        }
        errors
    }
}

/// Governs the approval subresource, which carries the approval decision
#[derive(Clone, Copy, Debug, Default)]
pub struct ApprovalStrategy;

impl Strategy for ApprovalStrategy {
    fn prepare_for_update(&self, new: &mut CertificateSigningRequest, old: &CertificateSigningRequest) {
        new.spec = old.spec.clone();
        let conditions = std::mem::take(&mut new.status.conditions);
        new.status = CertificateSigningRequestStatus {
            conditions,
            ..old.status.clone()
        };
    }

    fn validate_update(
        &self,
        new: &CertificateSigningRequest,
        old: &CertificateSigningRequest,
    ) -> Vec<FieldError> {
        let mut errors = validate_common_update(self, new, old);
        let has = |csr: &CertificateSigningRequest, type_: RequestConditionType| {
            csr.status.conditions.iter().any(|cond| cond.type_ == type_)
        };
        for type_ in [RequestConditionType::Approved, RequestConditionType::Denied] {
            if has(old, type_) && !has(new, type_) {
                errors.push(FieldError::new(
                    "status.conditions",
                    FieldErrorType::Forbidden,
                    format!("a recorded {type_} decision may not be removed"),
                ));
            }
        }
        errors
    }
}

pub fn strategy(surface: Surface) -> &'static dyn Strategy {
    match surface {
        Surface::Main => &CsrStrategy,
        Surface::Status => &StatusStrategy,
        Surface::Approval => &ApprovalStrategy,
    }
}

/// Runs the create path, returning the object to persist
pub fn admit_create(
    mut csr: CertificateSigningRequest,
    user: &UserInfo,
) -> Result<CertificateSigningRequest> {
    let strategy = CsrStrategy;
    strategy.prepare_for_create(&mut csr, user);
    let errors = strategy.validate(&csr);
    if !errors.is_empty() {
        return InvalidSnafu {
            name: csr.metadata.name,
            errors: FieldErrors(errors),
        }
        .fail();
    }
    strategy.canonicalize(&mut csr).context(InternalSnafu {
        name: &csr.metadata.name,
    })?;
    Ok(csr)
}

/// Runs the update path of `surface`, returning the object to persist
pub fn admit_update(
    surface: Surface,
    mut new: CertificateSigningRequest,
    old: &CertificateSigningRequest,
) -> Result<CertificateSigningRequest> {
    let strategy = strategy(surface);
    // System-assigned metadata that the caller may omit
    if new.metadata.uid.is_none() {
        new.metadata.uid.clone_from(&old.metadata.uid);
    }
    new.metadata.creation_timestamp = old.metadata.creation_timestamp;

    strategy.prepare_for_update(&mut new, old);
    let errors = strategy.validate_update(&new, old);
    if !errors.is_empty() {
        return InvalidSnafu {
            name: new.metadata.name,
            errors: FieldErrors(errors),
        }
        .fail();
    }
    strategy.canonicalize(&mut new).context(InternalSnafu {
        name: &new.metadata.name,
    })?;
    Ok(new)
}

fn validate_common_update(
    strategy: &dyn Strategy,
    new: &CertificateSigningRequest,
    old: &CertificateSigningRequest,
) -> Vec<FieldError> {
    let mut errors = validate_metadata(&new.metadata, strategy.namespace_scoped());
    errors.extend(validate_request(&new.spec.request));
    errors.extend(validate_metadata_update(&new.metadata, &old.metadata));
    errors
}

fn validate_request(request: &[u8]) -> Option<FieldError> {
    let err = request::parse_and_verify(request).err()?;
    Some(FieldError {
        request_error: Some(err.kind()),
        ..FieldError::new(
            "spec.request",
            FieldErrorType::Invalid,
            error_full_message(&err),
        )
    })
}

fn validate_metadata(meta: &ObjectMeta, namespace_scoped: bool) -> Vec<FieldError> {
    use FieldErrorType::*;
    let mut errors = Vec::new();
    let name = &meta.name;
    if name.is_empty() {
        errors.push(FieldError::new("metadata.name", Required, "name is required"));
    } else if name == "." || name == ".." {
        errors.push(FieldError::new(
            "metadata.name",
            Invalid,
            format!("may not be {name:?}"),
        ));
    } else if name.contains(['/', '%']) {
        errors.push(FieldError::new(
            "metadata.name",
            Invalid,
            "may not contain '/' or '%'",
        ));
    }
    if name.len() > MAX_NAME_LENGTH {
        errors.push(FieldError::new(
            "metadata.name",
            Invalid,
            format!("must be no more than {MAX_NAME_LENGTH} characters"),
        ));
    }
    match (namespace_scoped, meta.namespace.is_empty()) {
        (true, true) => errors.push(FieldError::new(
            "metadata.namespace",
            Required,
            "namespace is required",
        )),
        (false, false) => errors.push(FieldError::new(
            "metadata.namespace",
            Forbidden,
            "not allowed on cluster-scoped objects",
        )),
        _ => {}
    }
    errors
}

fn validate_metadata_update(new: &ObjectMeta, old: &ObjectMeta) -> Vec<FieldError> {
    let immutable = |field, changed: bool| {
        changed.then(|| FieldError::new(field, FieldErrorType::Invalid, "field is immutable"))
    };
    [
        immutable("metadata.name", new.name != old.name),
        immutable("metadata.namespace", new.namespace != old.namespace),
        immutable("metadata.uid", new.uid != old.uid),
        immutable(
            "metadata.creationTimestamp",
            new.creation_timestamp != old.creation_timestamp,
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
}
