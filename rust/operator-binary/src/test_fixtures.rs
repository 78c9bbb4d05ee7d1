//! Keys, requests and identities shared by the unit tests

use std::net::IpAddr;

use openssl::{
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509Name, X509NameBuilder, X509Req, X509ReqBuilder},
};
use time::Duration;

use crate::{api::UserInfo, signer::local::CertificateAuthority};

pub fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

pub fn rsa_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

pub fn certificate_authority() -> CertificateAuthority {
    CertificateAuthority::new_self_signed("test CA", Duration::days(30)).unwrap()
}

pub fn user() -> UserInfo {
    UserInfo {
        username: "system:node:node1".to_string(),
        uid: "uid-node1".to_string(),
        groups: vec!["system:nodes".to_string()],
    }
}

/// A valid request for `common_name`, signed by a fresh key
pub fn csr_pem(common_name: &str, dns_names: &[&str]) -> Vec<u8> {
    dns_names
        .iter()
        .fold(RequestBuilder::new(common_name), |builder, dns| {
            builder.dns_name(dns)
        })
        .build_pem(&ec_key())
}

/// A well-formed request whose signature does not match its contents
pub fn tampered_request_pem(key: &PKey<Private>) -> Vec<u8> {
    let pem = RequestBuilder::new("node1").build_pem(key);
    let mut der = X509Req::from_pem(&pem).unwrap().to_der().unwrap();
    // The signature is the final field
    *der.last_mut().unwrap() ^= 0x01;
    X509Req::from_der(&der).unwrap().to_pem().unwrap()
}

pub struct RequestBuilder {
    subject: Option<X509Name>,
    subject_entries: Vec<(Nid, String)>,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
}

impl RequestBuilder {
    pub fn new(common_name: &str) -> Self {
        Self {
            subject: None,
            subject_entries: vec![(Nid::COMMONNAME, common_name.to_string())],
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
        }
    }

    pub fn with_subject(subject: X509Name) -> Self {
        Self {
            subject: Some(subject),
            subject_entries: Vec::new(),
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
        }
    }

    pub fn organization(mut self, organization: &str) -> Self {
        self.subject_entries
            .push((Nid::ORGANIZATIONNAME, organization.to_string()));
        self
    }

    pub fn dns_name(mut self, dns_name: &str) -> Self {
        self.dns_names.push(dns_name.to_string());
        self
    }

    pub fn ip_address(mut self, ip_address: IpAddr) -> Self {
        self.ip_addresses.push(ip_address);
        self
    }

    pub fn build_pem(self, key: &PKey<Private>) -> Vec<u8> {
        let subject = self.subject.unwrap_or_else(|| {
            let mut name = X509NameBuilder::new().unwrap();
            for (nid, value) in &self.subject_entries {
                name.append_entry_by_nid(*nid, value).unwrap();
            }
            name.build()
        });
        let mut req = X509ReqBuilder::new().unwrap();
        req.set_version(0).unwrap();
        req.set_subject_name(&subject).unwrap();
        req.set_pubkey(key).unwrap();
        if !self.dns_names.is_empty() || !self.ip_addresses.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for dns in &self.dns_names {
                san.dns(dns);
            }
            for ip in &self.ip_addresses {
                san.ip(&ip.to_string());
            }
            let san = san.build(&req.x509v3_context(None)).unwrap();
            let mut extensions = Stack::new().unwrap();
            extensions.push(san).unwrap();
            req.add_extensions(&extensions).unwrap();
        }
        req.sign(key, MessageDigest::sha256()).unwrap();
        req.build().to_pem().unwrap()
    }
}
