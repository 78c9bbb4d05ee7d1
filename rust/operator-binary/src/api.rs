//! Data model of the `CertificateSigningRequest` object

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;

use crate::{
    mirror::{ObjectKey, Resource},
    request::CanonicalFields,
};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    /// Empty for cluster-scoped objects
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Assigned by the store whenever the object is persisted
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub creation_timestamp: Option<OffsetDateTime>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSigningRequest {
    pub metadata: ObjectMeta,
    pub spec: CertificateSigningRequestSpec,
    #[serde(default)]
    pub status: CertificateSigningRequestStatus,
}

impl CertificateSigningRequest {
    /// Creates an unsaved request with the given name and PEM-encoded PKCS#10 request
    pub fn new(name: impl Into<String>, request: impl Into<Vec<u8>>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                ..ObjectMeta::default()
            },
            spec: CertificateSigningRequestSpec {
                request: request.into(),
                ..CertificateSigningRequestSpec::default()
            },
            status: CertificateSigningRequestStatus::default(),
        }
    }

    pub fn approval_state(&self) -> ApprovalState {
        self.status.approval_state()
    }
}

impl Resource for CertificateSigningRequest {
    fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    fn resource_version(&self) -> &str {
        &self.metadata.resource_version
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSigningRequestSpec {
    /// PEM-encoded PKCS#10 certificate request
    #[serde(with = "base64_bytes")]
    pub request: Vec<u8>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_info: Vec<String>,

    /// Lowercase hex SHA-256 digest of the request's DER-encoded public key
    ///
    /// Derived from `request`, any value supplied by the requester is discarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// Derived from `request`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,

    /// DNS subject alternative names, derived from `request`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,

    /// IP subject alternative names, derived from `request`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,

    /// Requesting user, injected when the object is created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

impl CertificateSigningRequestSpec {
    pub fn clear_derived(&mut self) {
        self.fingerprint = None;
        self.subject = None;
        self.hostnames.clear();
        self.ip_addresses.clear();
    }

    pub fn clear_identity(&mut self) {
        self.username = None;
        self.uid = None;
        self.groups.clear();
    }

    /// Overwrites all derived fields, nothing is merged with previous values
    pub fn set_derived(&mut self, fingerprint: String, fields: CanonicalFields) {
        self.fingerprint = Some(fingerprint);
        self.subject = Some(fields.subject);
        self.hostnames = fields.hostnames;
        self.ip_addresses = fields.ip_addresses;
    }
}

/// Distinguished name of the requester
///
/// Multi-valued attributes keep every occurrence in order. For the single-valued
/// attributes the last occurrence wins. `names` contains every attribute,
/// including those that are not recognized.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub country: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organization: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizational_unit: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locality: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub province: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub street_address: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postal_code: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(default)]
    pub names: Vec<AttributeTypeAndValue>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AttributeTypeAndValue {
    /// Dotted OID of the attribute type
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSigningRequestStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// PEM-encoded certificate, set once the request has been signed
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes::option"
    )]
    pub certificate: Option<Vec<u8>>,
}

impl CertificateSigningRequestStatus {
    pub fn approval_state(&self) -> ApprovalState {
        let has = |type_: RequestConditionType| self.conditions.iter().any(|cond| cond.type_ == type_);
        if has(RequestConditionType::Denied) {
            ApprovalState::Denied
        } else if has(RequestConditionType::Approved) {
            ApprovalState::Approved
        } else {
            ApprovalState::Pending
        }
    }
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString,
)]
pub enum RequestConditionType {
    Approved,
    Denied,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: RequestConditionType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub last_transition_time: Option<OffsetDateTime>,
}

impl Condition {
    pub fn approved(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RequestConditionType::Approved, reason, message)
    }

    pub fn denied(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RequestConditionType::Denied, reason, message)
    }

    fn new(
        type_: RequestConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(OffsetDateTime::now_utc()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
}

/// The caller on whose behalf an object is created
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    pub uid: String,
    pub groups: Vec<String>,
}

/// (De)serializes byte fields as base64 strings
mod base64_bytes {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&openssl::base64::encode_block(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        openssl::base64::decode_block(&encoded).map_err(D::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => super::serialize(bytes, ser),
                None => ser.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] Vec<u8>);
            Ok(Option::<Wrapper>::deserialize(de)?.map(|Wrapper(bytes)| bytes))
        }
    }
}
