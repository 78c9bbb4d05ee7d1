//! Signs requests with a CA whose private key is held in memory

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        X509Builder, X509NameBuilder, X509,
    },
};
use snafu::{ensure, ResultExt as _, Snafu};
use time::{Duration, OffsetDateTime};
use tracing::info;

use super::Signer;
use crate::{
    request,
    utils::{asn1time_to_offsetdatetime, Asn1TimeParseError, FmtByteSlice, Unloggable},
};

pub const DEFAULT_CERT_LIFETIME: Duration = Duration::days(365);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate CA key"))]
    GenerateKey { source: ErrorStack },

    #[snafu(display("failed to read {}", path.display()))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to load CA certificate"))]
    LoadCertificate { source: ErrorStack },

    #[snafu(display("failed to load CA private key"))]
    LoadKey { source: ErrorStack },

    #[snafu(display("CA private key does not belong to the CA certificate"))]
    KeyMismatch,

    #[snafu(display("failed to parse CA lifetime"))]
    ParseLifetime { source: Asn1TimeParseError },

    #[snafu(display("refusing to sign invalid request"))]
    InvalidRequest { source: request::Error },

    #[snafu(display("CA expired at {not_after}"))]
    CaExpired { not_after: OffsetDateTime },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: ErrorStack },

    #[snafu(display("failed to serialize certificate"))]
    SerializeCertificate { source: ErrorStack },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub struct CertificateAuthority {
    ca_cert: X509,
    ca_key: Unloggable<PKey<Private>>,
    not_after: OffsetDateTime,
    cert_lifetime: Duration,
}

impl CertificateAuthority {
    /// Generates a new CA that is valid for `lifetime`
    pub fn new_self_signed(common_name: &str, lifetime: Duration) -> Result<Self> {
        let subject_name = X509NameBuilder::new()
            .and_then(|mut name| {
                name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
                Ok(name)
            })
            .context(BuildCertificateSnafu)?
            .build();
        let now = OffsetDateTime::now_utc();
        let not_before = now - Duration::minutes(5);
        let not_after = now + lifetime;
        let ca_key = Rsa::generate(2048)
            .and_then(PKey::try_from)
            .context(GenerateKeySnafu)?;
        let ca_cert = X509Builder::new()
            .and_then(|mut x509| {
                let conf = Conf::new(ConfMethod::default())?;
                x509.set_subject_name(&subject_name)?;
                x509.set_issuer_name(&subject_name)?;
                x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
                x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
                x509.set_pubkey(&ca_key)?;
                x509.set_serial_number(random_serial()?.as_ref())?;
                x509.set_version(
                    3 - 1, // zero-indexed
                )?;
                let ctx = x509.x509v3_context(None, Some(&conf));
                let exts = [
                    BasicConstraints::new().critical().ca().build()?,
                    SubjectKeyIdentifier::new().build(&ctx)?,
                    AuthorityKeyIdentifier::new()
                        .issuer(false)
                        .keyid(false)
                        .build(&ctx)?,
                    KeyUsage::new()
                        .critical()
                        .digital_signature()
                        .key_cert_sign()
                        .crl_sign()
                        .build()?,
                ];
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                x509.sign(&ca_key, MessageDigest::sha256())?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();
        info!(
            ca.subject = common_name,
            ca.not_after = %not_after,
            "Generated self-signed CA"
        );
        Self::new(ca_cert, ca_key)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let ca_cert = X509::from_pem(cert_pem).context(LoadCertificateSnafu)?;
        let ca_key = PKey::private_key_from_pem(key_pem).context(LoadKeySnafu)?;
        Self::new(ca_cert, ca_key)
    }

    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let read = |path: &Path| std::fs::read(path).context(ReadFileSnafu { path });
        Self::from_pem(&read(cert_path)?, &read(key_path)?)
    }

    fn new(ca_cert: X509, ca_key: PKey<Private>) -> Result<Self> {
        let key_matches = ca_cert
            .public_key()
            .is_ok_and(|cert_key| cert_key.public_eq(&ca_key));
        ensure!(key_matches, KeyMismatchSnafu);
        Ok(Self {
            not_after: asn1time_to_offsetdatetime(ca_cert.not_after())
                .context(ParseLifetimeSnafu)?,
            ca_cert,
            ca_key: Unloggable(ca_key),
            cert_lifetime: DEFAULT_CERT_LIFETIME,
        })
    }

    /// How long issued certificates are valid for, at most until the CA itself expires
    pub fn with_cert_lifetime(self, cert_lifetime: Duration) -> Self {
        Self {
            cert_lifetime,
            ..self
        }
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn ca_certificate_pem(&self) -> Result<Vec<u8>> {
        self.ca_cert.to_pem().context(SerializeCertificateSnafu)
    }

    /// Issues a certificate for the subject, public key and alternative names of `request`
    pub fn sign_request(&self, request: &[u8]) -> Result<Vec<u8>> {
        let parsed = request::parse_and_verify(request).context(InvalidRequestSnafu)?;
        let now = OffsetDateTime::now_utc();
        ensure!(
            now < self.not_after,
            CaExpiredSnafu {
                not_after: self.not_after
            }
        );
        let not_before = now - Duration::minutes(5);
        let not_after = (now + self.cert_lifetime).min(self.not_after);
        let mut serial = None;
        let cert = X509Builder::new()
            .and_then(|mut x509| {
                let conf = Conf::new(ConfMethod::default())?;
                x509.set_subject_name(parsed.request().subject_name())?;
                x509.set_issuer_name(self.ca_cert.subject_name())?;
                x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
                x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
                x509.set_pubkey(parsed.public_key())?;
                x509.set_version(
                    3 - 1, // zero-indexed
                )?;
                let serial_number = random_serial()?;
                x509.set_serial_number(serial_number.as_ref())?;
                serial = Some(serial_number.to_bn()?.to_vec());
                let ctx = x509.x509v3_context(Some(&self.ca_cert), Some(&conf));
                let mut exts = vec![
                    BasicConstraints::new().critical().build()?,
                    KeyUsage::new()
                        .key_encipherment()
                        .digital_signature()
                        .build()?,
                    ExtendedKeyUsage::new()
                        .server_auth()
                        .client_auth()
                        .build()?,
                    SubjectKeyIdentifier::new().build(&ctx)?,
                    AuthorityKeyIdentifier::new()
                        .issuer(true)
                        .keyid(true)
                        .build(&ctx)?,
                ];
                let mut san_ext = SubjectAlternativeName::new();
                san_ext.critical();
                let mut has_san = false;
                for dns in parsed.dns_names() {
                    has_san = true;
                    san_ext.dns(dns);
                }
                for ip in parsed.ip_addresses() {
                    has_san = true;
                    san_ext.ip(&ip.to_string());
                }
                if has_san {
                    exts.push(san_ext.build(&ctx)?);
                }
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                x509.sign(&self.ca_key.0, MessageDigest::sha256())?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();
        info!(
            cert.subject = ?parsed.subject().common_name,
            cert.serial = format!("{:x}", FmtByteSlice(serial.as_deref().unwrap_or_default())),
            cert.not_after = %not_after,
            "Issued certificate"
        );
        cert.to_pem().context(SerializeCertificateSnafu)
    }
}

#[async_trait]
impl Signer for CertificateAuthority {
    type Error = Error;

    async fn sign(&self, request: &[u8]) -> Result<Vec<u8>> {
        self.sign_request(request)
    }
}

fn random_serial() -> Result<Asn1Integer, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    Asn1Integer::from_bn(&serial)
}

#[cfg(test)]
mod tests {
    use openssl::{nid::Nid, x509::X509};
    use time::Duration;

    use super::*;
    use crate::{
        request::RequestErrorKind,
        test_fixtures::{self, RequestBuilder},
        utils::asn1time_to_offsetdatetime,
    };

    #[test]
    fn issues_certificate_for_request() {
        // Outlives the default certificate lifetime, so that it doesn't cap it
        let ca = CertificateAuthority::new_self_signed("test CA", Duration::days(2 * 365)).unwrap();
        let key = test_fixtures::ec_key();
        let request = RequestBuilder::new("node1")
            .organization("system:nodes")
            .dns_name("node1.example.com")
            .ip_address("10.0.0.1".parse().unwrap())
            .build_pem(&key);

        let cert = X509::from_pem(&ca.sign_request(&request).unwrap()).unwrap();
        let ca_cert = X509::from_pem(&ca.ca_certificate_pem().unwrap()).unwrap();
        assert!(cert.verify(&ca_cert.public_key().unwrap()).unwrap());
        assert!(cert.public_key().unwrap().public_eq(&key));
        let cn = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "node1");

        let sans = cert.subject_alt_names().unwrap();
        assert_eq!(
            sans.iter().filter_map(|san| san.dnsname()).collect::<Vec<_>>(),
            ["node1.example.com"]
        );
        assert_eq!(
            sans.iter()
                .filter_map(|san| san.ipaddress())
                .collect::<Vec<_>>(),
            [&[10, 0, 0, 1][..]]
        );

        let not_after = asn1time_to_offsetdatetime(cert.not_after()).unwrap();
        let expected = OffsetDateTime::now_utc() + DEFAULT_CERT_LIFETIME;
        assert!((expected - not_after).abs() < Duration::minutes(1));
    }

    #[test]
    fn lifetime_is_clamped_to_ca() {
        let ca = CertificateAuthority::new_self_signed("test CA", Duration::days(10))
            .unwrap()
            .with_cert_lifetime(Duration::days(365));
        let pem = RequestBuilder::new("node1").build_pem(&test_fixtures::ec_key());
        let cert = X509::from_pem(&ca.sign_request(&pem).unwrap()).unwrap();
        assert_eq!(
            asn1time_to_offsetdatetime(cert.not_after()).unwrap(),
            ca.not_after()
        );
    }

    #[test]
    fn refuses_invalid_requests() {
        let ca = test_fixtures::certificate_authority();
        let err = ca
            .sign_request(&test_fixtures::tampered_request_pem(&test_fixtures::ec_key()))
            .unwrap_err();
        let Error::InvalidRequest { source } = &err else {
            panic!("expected InvalidRequest, got {err:?}");
        };
        assert_eq!(source.kind(), RequestErrorKind::InvalidSignature);
    }

    #[test]
    fn refuses_to_sign_after_expiry() {
        let ca = CertificateAuthority::new_self_signed("expired CA", Duration::ZERO).unwrap();
        let pem = RequestBuilder::new("node1").build_pem(&test_fixtures::ec_key());
        let err = ca.sign_request(&pem).unwrap_err();
        assert!(matches!(err, Error::CaExpired { .. }), "{err:?}");
    }

    #[test]
    fn loads_ca_from_files() {
        let ca = test_fixtures::certificate_authority();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");
        std::fs::write(&cert_path, ca.ca_certificate_pem().unwrap()).unwrap();
        std::fs::write(&key_path, ca.ca_key.private_key_to_pem_pkcs8().unwrap()).unwrap();

        let loaded = CertificateAuthority::from_files(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.not_after(), ca.not_after());
        let pem = RequestBuilder::new("node1").build_pem(&test_fixtures::ec_key());
        loaded.sign_request(&pem).unwrap();

        let err = CertificateAuthority::from_files(&dir.path().join("missing"), &key_path)
            .unwrap_err();
        assert!(matches!(err, Error::ReadFile { .. }), "{err:?}");
    }

    #[test]
    fn rejects_mismatched_key() {
        let ca = test_fixtures::certificate_authority();
        let other_key = test_fixtures::rsa_key();
        let err = CertificateAuthority::from_pem(
            &ca.ca_certificate_pem().unwrap(),
            &other_key.private_key_to_pem_pkcs8().unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::KeyMismatch), "{err:?}");
    }

    #[tokio::test]
    async fn signs_through_signer_trait() {
        let ca = test_fixtures::certificate_authority();
        let pem = RequestBuilder::new("node1").build_pem(&test_fixtures::ec_key());
        let cert = Signer::sign(&ca, &pem).await.unwrap();
        assert!(cert.starts_with(b"-----BEGIN CERTIFICATE-----"));
    }
}
