//! Reads the SubjectAltName extension out of a PKCS#10 request's `extensionRequest` attribute
//!
//! OpenSSL parses the extensions for us, but doesn't expose their contents.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use yasna::{models::ObjectIdentifier, ASN1Error, ASN1ErrorKind, BERReader, Tag, TagClass};

const OID_EXTENSION_REQUEST: &[u64] = &[1, 2, 840, 113549, 1, 9, 14];
const OID_SUBJECT_ALT_NAME: &[u64] = &[2, 5, 29, 17];

const TAG_DNS_NAME: Tag = Tag {
    tag_class: TagClass::ContextSpecific,
    tag_number: 2,
};
const TAG_IP_ADDRESS: Tag = Tag {
    tag_class: TagClass::ContextSpecific,
    tag_number: 7,
};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SubjectAltNames {
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

/// Parses a DER `CertificationRequest`, returning the alternative names that it requests
pub fn parse_subject_alt_names(r: BERReader) -> Result<SubjectAltNames, ASN1Error> {
    r.read_sequence(|r| {
        let alt_names = r.next().read_sequence(|r| {
            let _version = r.next().read_i64()?;
            let _subject = r.next().read_der()?;
            let _spki = r.next().read_der()?;
            let mut alt_names = SubjectAltNames::default();
            r.next()
                .read_tagged_implicit(Tag::context(0), |r| {
                    r.read_set_of(|r| read_attribute(r, &mut alt_names))
                })?;
            Ok(alt_names)
        })?;
        let _signature_algorithm = r.next().read_der()?;
        let _signature = r.next().read_der()?;
        Ok(alt_names)
    })
}

fn read_attribute(r: BERReader, alt_names: &mut SubjectAltNames) -> Result<(), ASN1Error> {
    r.read_sequence(|r| {
        let attr_type = r.next().read_oid()?;
        if attr_type == ObjectIdentifier::from_slice(OID_EXTENSION_REQUEST) {
            r.next().read_set_of(|r| {
                r.read_sequence_of(|r| read_extension(r, alt_names))
            })
        } else {
            r.next().read_der().map(drop)
        }
    })
}

fn read_extension(r: BERReader, alt_names: &mut SubjectAltNames) -> Result<(), ASN1Error> {
    r.read_sequence(|r| {
        let id = r.next().read_oid()?;
        let _critical = r.read_optional(|r| r.read_bool())?;
        let value = r.next().read_bytes()?;
        if id == ObjectIdentifier::from_slice(OID_SUBJECT_ALT_NAME) {
            yasna::parse_ber(&value, |r| {
                r.read_sequence_of(|r| read_general_name(r, alt_names))
            })?;
        }
        Ok(())
    })
}

fn read_general_name(r: BERReader, alt_names: &mut SubjectAltNames) -> Result<(), ASN1Error> {
    match r.lookahead_tag()? {
        TAG_DNS_NAME => {
            let name = r.read_tagged_implicit(TAG_DNS_NAME, |r| r.read_ia5_string())?;
            alt_names.dns_names.push(name);
        }
        TAG_IP_ADDRESS => {
            let addr = r.read_tagged_implicit(TAG_IP_ADDRESS, |r| r.read_bytes())?;
            let addr = match <[u8; 4]>::try_from(addr.as_slice()) {
                Ok(v4) => IpAddr::V4(Ipv4Addr::from(v4)),
                Err(_) => IpAddr::V6(Ipv6Addr::from(
                    <[u8; 16]>::try_from(addr.as_slice())
                        .map_err(|_| ASN1Error::new(ASN1ErrorKind::Invalid))?,
                )),
            };
            alt_names.ip_addresses.push(addr.to_canonical());
        }
        // Other name types (email addresses, URIs, ...) are not mirrored into the CSR
        _ => {
            r.read_der()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use yasna::{models::ObjectIdentifier, Tag};

    use super::*;

    fn general_names(names: &[(Tag, &[u8])]) -> Vec<u8> {
        yasna::construct_der(|w| {
            w.write_sequence(|w| {
                for (tag, value) in names {
                    w.next().write_tagged_implicit(*tag, |w| w.write_bytes(value));
                }
            })
        })
    }

    /// Builds a minimal CertificationRequest, the key and signature are placeholders
    fn request_with_extension(id: &[u64], value: &[u8]) -> Vec<u8> {
        yasna::construct_der(|w| {
            w.write_sequence(|w| {
                w.next().write_sequence(|w| {
                    w.next().write_i64(0);
                    w.next().write_sequence(|_| {});
                    w.next().write_sequence(|w| {
                        w.next().write_sequence(|w| {
                            w.next()
                                .write_oid(&ObjectIdentifier::from_slice(&[1, 2, 840, 10045, 2, 1]))
                        });
                        w.next().write_bytes(&[0]);
                    });
                    w.next().write_tagged_implicit(Tag::context(0), |w| {
                        w.write_set(|w| {
                            w.next().write_sequence(|w| {
                                w.next()
                                    .write_oid(&ObjectIdentifier::from_slice(OID_EXTENSION_REQUEST));
                                w.next().write_set(|w| {
                                    w.next().write_sequence(|w| {
                                        w.next().write_sequence(|w| {
                                            w.next().write_oid(&ObjectIdentifier::from_slice(id));
                                            w.next().write_bytes(value);
                                        })
                                    })
                                })
                            })
                        })
                    });
                });
                w.next().write_sequence(|w| {
                    w.next()
                        .write_oid(&ObjectIdentifier::from_slice(&[1, 2, 840, 10045, 4, 3, 2]))
                });
                w.next().write_bytes(&[0]);
            })
        })
    }

    #[test]
    fn reads_dns_and_ip_names() {
        let sans = general_names(&[
            (TAG_DNS_NAME, b"node1.example.com"),
            (Tag::context(1), b"admin@example.com"),
            (TAG_IP_ADDRESS, &[10, 0, 0, 1]),
            (TAG_IP_ADDRESS, &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 192, 168, 0, 1]),
        ]);
        let der = request_with_extension(OID_SUBJECT_ALT_NAME, &sans);
        assert_eq!(
            yasna::parse_ber(&der, parse_subject_alt_names).unwrap(),
            SubjectAltNames {
                dns_names: vec!["node1.example.com".to_string()],
                ip_addresses: vec!["10.0.0.1".parse().unwrap(), "192.168.0.1".parse().unwrap()],
            }
        );
    }

    #[test]
    fn ignores_other_extensions() {
        let der = request_with_extension(&[2, 5, 29, 15], &[3, 2, 5, 160]);
        assert_eq!(
            yasna::parse_ber(&der, parse_subject_alt_names).unwrap(),
            SubjectAltNames::default()
        );
    }

    #[test]
    fn rejects_truncated_ip_addresses() {
        let sans = general_names(&[(TAG_IP_ADDRESS, &[10, 0, 0])]);
        let der = request_with_extension(OID_SUBJECT_ALT_NAME, &sans);
        yasna::parse_ber(&der, parse_subject_alt_names).unwrap_err();
    }

    #[test]
    fn rejects_garbage_alt_names() {
        let der = request_with_extension(OID_SUBJECT_ALT_NAME, b"garbage");
        yasna::parse_ber(&der, parse_subject_alt_names).unwrap_err();
    }
}
