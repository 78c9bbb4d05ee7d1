//! Parsing, verification and canonicalization of PKCS#10 certificate requests
//!
//! Everything in here is a pure function of the request bytes.

use std::{
    fmt::{Debug, Formatter},
    net::IpAddr,
};

use openssl::{
    asn1::Asn1Object,
    error::ErrorStack,
    nid::Nid,
    pkey::{PKey, Public},
    x509::{X509NameRef, X509Req},
};
use serde::Serialize;
use snafu::{ensure, OptionExt as _, ResultExt as _, Snafu};
use strum::{Display, EnumDiscriminants, IntoStaticStr};

use crate::{
    api::{AttributeTypeAndValue, Subject},
    utils::FmtByteSlice,
};

mod extensions;
mod name;

const PEM_BLOCK_TYPE: &str = "CERTIFICATE REQUEST";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(name(RequestErrorKind), derive(IntoStaticStr, Display, Hash))]
pub enum Error {
    #[snafu(display("certificate request is malformed"), context(false))]
    MalformedRequest { source: MalformedError },

    #[snafu(display("certificate request is not signed by its own public key"))]
    InvalidSignature,

    #[snafu(display("failed to encode the public key of the certificate request"))]
    Internal { source: ErrorStack },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn kind(&self) -> RequestErrorKind {
        self.into()
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum MalformedError {
    #[snafu(display("no PEM block found"))]
    NoPemBlock,

    #[snafu(display("expected a {PEM_BLOCK_TYPE:?} PEM block, found {block_type:?}"))]
    UnexpectedBlockType { block_type: String },

    #[snafu(display("PEM block is not terminated"))]
    UnterminatedPemBlock,

    #[snafu(display("failed to decode base64 body of the PEM block"))]
    DecodeBase64 { source: ErrorStack },

    #[snafu(display("failed to parse PKCS#10 structure"))]
    ParseDer { source: ErrorStack },

    #[snafu(display("failed to read public key"))]
    ReadPublicKey { source: ErrorStack },

    #[snafu(display("failed to encode subject"))]
    EncodeSubject { source: ErrorStack },

    #[snafu(display("failed to parse subject"))]
    ParseSubject { source: yasna::ASN1Error },

    #[snafu(display("unknown subject attribute type {oid}"))]
    SubjectAttributeType { source: ErrorStack, oid: String },

    #[snafu(display("failed to parse requested extensions"))]
    ParseExtensions { source: yasna::ASN1Error },
}

/// A certificate request whose self-signature has been verified
pub struct ParsedRequest {
    request: X509Req,
    public_key: PKey<Public>,
    subject: Subject,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
}

impl Debug for ParsedRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedRequest")
            .field("subject", &self.subject)
            .field("dns_names", &self.dns_names)
            .field("ip_addresses", &self.ip_addresses)
            .finish_non_exhaustive()
    }
}

impl ParsedRequest {
    pub fn request(&self) -> &X509Req {
        &self.request
    }

    pub fn public_key(&self) -> &PKey<Public> {
        &self.public_key
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn ip_addresses(&self) -> &[IpAddr] {
        &self.ip_addresses
    }
}

/// The fields of a CSR that are derived from its request
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalFields {
    pub subject: Subject,
    pub hostnames: Vec<String>,
    pub ip_addresses: Vec<String>,
}

/// Decodes a PEM-encoded PKCS#10 request, and verifies that it is signed by its own public key
pub fn parse_and_verify(request: &[u8]) -> Result<ParsedRequest> {
    use malformed_error::*;
    let der = decode_pem(request)?;
    let req = X509Req::from_der(&der).context(ParseDerSnafu)?;
    let public_key = req.public_key().context(ReadPublicKeySnafu)?;
    let subject = read_subject(req.subject_name())?;
    let alt_names = yasna::parse_ber(&der, extensions::parse_subject_alt_names)
        .context(ParseExtensionsSnafu)?;
    // Any failure to verify (such as an unsupported signature algorithm) means that the request
    // can't be trusted, not that we failed
    ensure!(
        matches!(req.verify(&public_key), Ok(true)),
        InvalidSignatureSnafu
    );
    Ok(ParsedRequest {
        request: req,
        public_key,
        subject,
        dns_names: alt_names.dns_names,
        ip_addresses: alt_names.ip_addresses,
    })
}

/// Lowercase hex SHA-256 digest of the request's DER-encoded SubjectPublicKeyInfo
pub fn fingerprint(request: &ParsedRequest) -> Result<String> {
    let der = request
        .public_key
        .public_key_to_der()
        .context(InternalSnafu)?;
    Ok(format!("{:x}", FmtByteSlice(&openssl::sha::sha256(&der))))
}

pub fn canonicalize(request: &ParsedRequest) -> CanonicalFields {
    CanonicalFields {
        subject: request.subject.clone(),
        hostnames: request.dns_names.clone(),
        ip_addresses: request
            .ip_addresses
            .iter()
            .map(ToString::to_string)
            .collect(),
    }
}

/// Finds the first PEM block and decodes its body, the block must be a certificate request
fn decode_pem(pem: &[u8]) -> Result<Vec<u8>, MalformedError> {
    use malformed_error::*;
    const HEADER_START: &[u8] = b"-----BEGIN ";
    const DASHES: &[u8] = b"-----";

    let header_start = find(pem, HEADER_START).context(NoPemBlockSnafu)?;
    let label_start = header_start + HEADER_START.len();
    let label_len = find(&pem[label_start..], DASHES).context(NoPemBlockSnafu)?;
    let label = &pem[label_start..label_start + label_len];
    ensure!(
        label == PEM_BLOCK_TYPE.as_bytes(),
        UnexpectedBlockTypeSnafu {
            block_type: String::from_utf8_lossy(label),
        }
    );

    let body_start = label_start + label_len + DASHES.len();
    let footer = format!("-----END {PEM_BLOCK_TYPE}-----");
    let body_len =
        find(&pem[body_start..], footer.as_bytes()).context(UnterminatedPemBlockSnafu)?;
    let body = pem[body_start..body_start + body_len]
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|&b| char::from(b))
        .collect::<String>();
    openssl::base64::decode_block(&body).context(DecodeBase64Snafu)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn read_subject(subject_name: &X509NameRef) -> Result<Subject, MalformedError> {
    use malformed_error::*;
    let der = subject_name.to_der().context(EncodeSubjectSnafu)?;
    let attributes = yasna::parse_ber(&der, name::read_attributes).context(ParseSubjectSnafu)?;
    let mut subject = Subject::default();
    for (oid, value) in attributes {
        let oid = oid.to_string();
        let object = Asn1Object::from_str(&oid).context(SubjectAttributeTypeSnafu { oid: &oid })?;
        match object.nid() {
            Nid::COUNTRYNAME => subject.country.push(value.clone()),
            Nid::ORGANIZATIONNAME => subject.organization.push(value.clone()),
            Nid::ORGANIZATIONALUNITNAME => subject.organizational_unit.push(value.clone()),
            Nid::LOCALITYNAME => subject.locality.push(value.clone()),
            Nid::STATEORPROVINCENAME => subject.province.push(value.clone()),
            Nid::STREETADDRESS => subject.street_address.push(value.clone()),
            Nid::POSTALCODE => subject.postal_code.push(value.clone()),
            Nid::SERIALNUMBER => subject.serial_number = Some(value.clone()),
            Nid::COMMONNAME => subject.common_name = Some(value.clone()),
            _ => {}
        }
        subject.names.push(AttributeTypeAndValue {
            type_: object.to_string(),
            value,
        });
    }
    Ok(subject)
}

#[cfg(test)]
mod tests {
    use openssl::{nid::Nid, x509::X509NameBuilder};

    use super::*;
    use crate::test_fixtures::{self, RequestBuilder};

    #[test]
    fn parses_subject_and_alt_names() {
        let key = test_fixtures::ec_key();
        let pem = RequestBuilder::new("node1")
            .organization("system:nodes")
            .dns_name("node1.example.com")
            .dns_name("node1")
            .ip_address("10.0.0.1".parse().unwrap())
            .ip_address("fd00::1".parse().unwrap())
            .build_pem(&key);
        let parsed = parse_and_verify(&pem).unwrap();
        assert_eq!(parsed.subject().common_name.as_deref(), Some("node1"));
        assert_eq!(parsed.subject().organization, ["system:nodes"]);
        assert_eq!(parsed.dns_names(), ["node1.example.com", "node1"]);

        let fields = canonicalize(&parsed);
        assert_eq!(fields.hostnames, ["node1.example.com", "node1"]);
        assert_eq!(fields.ip_addresses, ["10.0.0.1", "fd00::1"]);
    }

    #[test]
    fn no_alt_names_is_not_an_error() {
        let pem = RequestBuilder::new("node1").build_pem(&test_fixtures::ec_key());
        let fields = canonicalize(&parse_and_verify(&pem).unwrap());
        assert!(fields.hostnames.is_empty());
        assert!(fields.ip_addresses.is_empty());
    }

    #[test]
    fn repeated_subject_attributes_keep_order() {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "b").unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, "first").unwrap();
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "a").unwrap();
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "b").unwrap();
        name.append_entry_by_text("1.2.3.4", "custom").unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, "last").unwrap();
        let pem = RequestBuilder::with_subject(name.build()).build_pem(&test_fixtures::ec_key());

        let subject = canonicalize(&parse_and_verify(&pem).unwrap()).subject;
        assert_eq!(subject.organization, ["b", "a", "b"]);
        assert_eq!(subject.common_name.as_deref(), Some("last"));
        assert_eq!(
            subject
                .names
                .iter()
                .map(|atv| (atv.type_.as_str(), atv.value.as_str()))
                .collect::<Vec<_>>(),
            [
                ("organizationName", "b"),
                ("commonName", "first"),
                ("organizationName", "a"),
                ("organizationName", "b"),
                ("1.2.3.4", "custom"),
                ("commonName", "last"),
            ]
        );
    }

    #[test]
    fn subject_values_keep_embedded_nul_bytes() {
        let common_name = "evil.example.com\0.good.example.com";
        let pem = RequestBuilder::new(common_name)
            .organization("system:nodes\0system:masters")
            .build_pem(&test_fixtures::ec_key());

        let subject = canonicalize(&parse_and_verify(&pem).unwrap()).subject;
        assert_eq!(subject.common_name.as_deref(), Some(common_name));
        assert_eq!(subject.organization, ["system:nodes\0system:masters"]);
        assert_eq!(
            subject
                .names
                .iter()
                .map(|atv| (atv.type_.as_str(), atv.value.as_str()))
                .collect::<Vec<_>>(),
            [
                ("commonName", common_name),
                ("organizationName", "system:nodes\0system:masters"),
            ]
        );
    }

    #[test]
    fn fingerprint_is_sha256_of_public_key() {
        let key = test_fixtures::ec_key();
        let pem = RequestBuilder::new("node1").build_pem(&key);
        let parsed = parse_and_verify(&pem).unwrap();
        let expected = format!(
            "{:x}",
            FmtByteSlice(&openssl::sha::sha256(&key.public_key_to_der().unwrap()))
        );
        assert_eq!(fingerprint(&parsed).unwrap(), expected);
        assert_eq!(fingerprint(&parsed).unwrap(), expected);
        assert_eq!(expected.len(), 64);

        let other = RequestBuilder::new("node1").build_pem(&test_fixtures::ec_key());
        assert_ne!(
            fingerprint(&parse_and_verify(&other).unwrap()).unwrap(),
            expected
        );
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let pem = RequestBuilder::new("node1")
            .dns_name("node1.example.com")
            .build_pem(&test_fixtures::ec_key());
        let first = canonicalize(&parse_and_verify(&pem).unwrap());
        let second = canonicalize(&parse_and_verify(&pem).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn rsa_requests_are_supported() {
        let pem = RequestBuilder::new("node1").build_pem(&test_fixtures::rsa_key());
        parse_and_verify(&pem).unwrap();
    }

    #[test]
    fn garbage_is_malformed() {
        for input in [
            &b""[..],
            b"not a certificate",
            b"-----BEGIN CERTIFICATE REQUEST-----\nnot base64!\n-----END CERTIFICATE REQUEST-----\n",
            b"-----BEGIN CERTIFICATE REQUEST-----\naGVsbG8=\n-----END CERTIFICATE REQUEST-----\n",
            b"-----BEGIN CERTIFICATE REQUEST-----\naGVsbG8=\n",
            b"-----BEGIN CERTIFICATE REQUEST",
            b"\xff\xfe-----BEGIN \xff-----",
        ] {
            let err = parse_and_verify(input).unwrap_err();
            assert_eq!(
                err.kind(),
                RequestErrorKind::MalformedRequest,
                "input {:?} gave {err:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn wrong_block_type_is_malformed() {
        let pem = RequestBuilder::new("node1").build_pem(&test_fixtures::ec_key());
        let pem = String::from_utf8(pem).unwrap();
        for block_type in ["NEW CERTIFICATE REQUEST", "CERTIFICATE"] {
            let relabeled = pem.replace("CERTIFICATE REQUEST", block_type);
            let err = parse_and_verify(relabeled.as_bytes()).unwrap_err();
            assert!(
                matches!(
                    &err,
                    Error::MalformedRequest {
                        source: MalformedError::UnexpectedBlockType { block_type: found },
                    } if found == block_type
                ),
                "{err:?}"
            );
        }
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let pem = test_fixtures::tampered_request_pem(&test_fixtures::ec_key());
        assert_eq!(
            parse_and_verify(&pem).unwrap_err().kind(),
            RequestErrorKind::InvalidSignature
        );
    }

    #[test]
    fn surrounding_text_is_ignored() {
        let pem = RequestBuilder::new("node1").build_pem(&test_fixtures::ec_key());
        let mut wrapped = b"Subject: node1\n\n".to_vec();
        wrapped.extend_from_slice(&pem);
        wrapped.extend_from_slice(b"\ntrailing garbage");
        parse_and_verify(&wrapped).unwrap();
    }
}
