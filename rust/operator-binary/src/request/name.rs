//! Reads the attribute values of an X.501 `Name`
//!
//! OpenSSL's accessors hand values out as C strings, which silently cut them short at the first
//! NUL byte. Decoding the DER ourselves keeps every byte of every value.

use yasna::{
    models::ObjectIdentifier,
    tags::{
        TAG_BMPSTRING, TAG_IA5STRING, TAG_NUMERICSTRING, TAG_PRINTABLESTRING, TAG_TELETEXSTRING,
        TAG_UNIVERSALSTRING, TAG_UTF8STRING, TAG_VISIBLESTRING,
    },
    ASN1Error, ASN1ErrorKind, BERReader,
};

/// Parses a DER `Name` into its attributes, in encoding order
pub fn read_attributes(r: BERReader) -> Result<Vec<(ObjectIdentifier, String)>, ASN1Error> {
    let mut attributes = Vec::new();
    r.read_sequence_of(|r| {
        r.read_set_of(|r| {
            r.read_sequence(|r| {
                let attr_type = r.next().read_oid()?;
                let value = read_directory_string(r.next())?;
                attributes.push((attr_type, value));
                Ok(())
            })
        })
    })?;
    Ok(attributes)
}

fn read_directory_string(r: BERReader) -> Result<String, ASN1Error> {
    match r.lookahead_tag()? {
        TAG_UTF8STRING => r.read_utf8string(),
        TAG_PRINTABLESTRING => r.read_printable_string(),
        TAG_IA5STRING => r.read_ia5_string(),
        TAG_VISIBLESTRING => r.read_visible_string(),
        TAG_NUMERICSTRING => r.read_numeric_string(),
        TAG_BMPSTRING => r.read_bmp_string(),
        // Treated as Latin-1, the same way OpenSSL prints it
        TAG_TELETEXSTRING => Ok(r
            .read_tagged_implicit(TAG_TELETEXSTRING, |r| r.read_bytes())?
            .into_iter()
            .map(char::from)
            .collect()),
        TAG_UNIVERSALSTRING => {
            let ucs4 = r.read_tagged_implicit(TAG_UNIVERSALSTRING, |r| r.read_bytes())?;
            if ucs4.len() % 4 != 0 {
                return Err(ASN1Error::new(ASN1ErrorKind::Invalid));
            }
            ucs4.chunks_exact(4)
                .map(|c| {
                    char::from_u32(u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                        .ok_or_else(|| ASN1Error::new(ASN1ErrorKind::Invalid))
                })
                .collect()
        }
        _ => Err(ASN1Error::new(ASN1ErrorKind::Invalid)),
    }
}
