//! EFI signature lists
//!
//! Encoder and decoder for the `EFI_SIGNATURE_LIST` format consumed by the
//! `PK`, `KEK` and `db` variables (UEFI 2.10, section 32.4.1):
//!
//! ```text
//! SignatureType        GUID  (16)
//! SignatureListSize    u32
//! SignatureHeaderSize  u32
//! SignatureSize        u32
//! SignatureHeader      [u8; SignatureHeaderSize]
//! Signatures           [EFI_SIGNATURE_DATA; n]
//!   SignatureOwner     GUID  (16)
//!   SignatureData      [u8; SignatureSize - 16]
//! ```
//!
//! GUIDs are stored in the mixed-endian EFI layout. Lists produced by the
//! external signature-list tool are decoded here so the trust store can prove
//! that a `.esl` file holds its own certificate under the hierarchy GUID.

use crate::error::SbError;
use uuid::Uuid;

/// `EFI_CERT_X509_GUID`
pub const EFI_CERT_X509_GUID: Uuid = Uuid::from_u128(0xa5c059a1_94e4_4aa7_87b5_ab155c2bf072);

/// `EFI_CERT_SHA256_GUID`
pub const EFI_CERT_SHA256_GUID: Uuid = Uuid::from_u128(0xc1c41626_504c_4092_aca9_41f936934328);

const LIST_HEADER_SIZE: usize = 16 + 4 + 4 + 4;
const OWNER_SIZE: usize = 16;

/// One `EFI_SIGNATURE_DATA` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureData {
    pub owner: Uuid,
    pub data: Vec<u8>,
}

/// One `EFI_SIGNATURE_LIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureList {
    pub signature_type: Uuid,
    pub header: Vec<u8>,
    pub signatures: Vec<SignatureData>,
}

impl SignatureList {
    /// A list holding a single DER certificate owned by `owner`.
    pub fn for_x509(owner: Uuid, der: &[u8]) -> Self {
        Self {
            signature_type: EFI_CERT_X509_GUID,
            header: Vec::new(),
            signatures: vec![SignatureData {
                owner,
                data: der.to_vec(),
            }],
        }
    }

    pub fn is_x509(&self) -> bool {
        self.signature_type == EFI_CERT_X509_GUID
    }

    /// Serialize to the firmware layout.
    ///
    /// All entries of a list share one size; an empty list or entries of
    /// differing sizes cannot be represented.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SbError> {
        let data_len = match self.signatures.first() {
            Some(first) => first.data.len(),
            None => {
                return Err(SbError::InvalidSignatureList(
                    "list has no signatures".to_string(),
                ))
            }
        };
        if self.signatures.iter().any(|s| s.data.len() != data_len) {
            return Err(SbError::InvalidSignatureList(
                "signatures of one list must have equal size".to_string(),
            ));
        }

        let signature_size = OWNER_SIZE + data_len;
        let list_size = LIST_HEADER_SIZE + self.header.len() + signature_size * self.signatures.len();

        let mut out = Vec::with_capacity(list_size);
        out.extend_from_slice(&self.signature_type.to_bytes_le());
        out.extend_from_slice(&to_u32(list_size)?.to_le_bytes());
        out.extend_from_slice(&to_u32(self.header.len())?.to_le_bytes());
        out.extend_from_slice(&to_u32(signature_size)?.to_le_bytes());
        out.extend_from_slice(&self.header);
        for sig in &self.signatures {
            out.extend_from_slice(&sig.owner.to_bytes_le());
            out.extend_from_slice(&sig.data);
        }
        Ok(out)
    }
}

fn to_u32(value: usize) -> Result<u32, SbError> {
    u32::try_from(value)
        .map_err(|_| SbError::InvalidSignatureList(format!("size {} exceeds u32", value)))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_guid(bytes: &[u8], at: usize) -> Uuid {
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&bytes[at..at + 16]);
    Uuid::from_bytes_le(buf)
}

/// Decode a buffer holding zero or more concatenated signature lists.
pub fn parse(mut bytes: &[u8]) -> Result<Vec<SignatureList>, SbError> {
    let mut lists = Vec::new();

    while !bytes.is_empty() {
        if bytes.len() < LIST_HEADER_SIZE {
            return Err(SbError::InvalidSignatureList(format!(
                "truncated list header ({} bytes)",
                bytes.len()
            )));
        }

        let signature_type = read_guid(bytes, 0);
        let list_size = read_u32(bytes, 16) as usize;
        let header_size = read_u32(bytes, 20) as usize;
        let signature_size = read_u32(bytes, 24) as usize;

        if list_size < LIST_HEADER_SIZE || list_size > bytes.len() {
            return Err(SbError::InvalidSignatureList(format!(
                "list size {} out of bounds",
                list_size
            )));
        }
        if signature_size < OWNER_SIZE {
            return Err(SbError::InvalidSignatureList(format!(
                "signature size {} smaller than owner GUID",
                signature_size
            )));
        }
        let body_len = list_size
            .checked_sub(LIST_HEADER_SIZE + header_size)
            .ok_or_else(|| {
                SbError::InvalidSignatureList(format!(
                    "header size {} exceeds list size {}",
                    header_size, list_size
                ))
            })?;
        if body_len % signature_size != 0 {
            return Err(SbError::InvalidSignatureList(format!(
                "{} bytes of signatures is not a multiple of {}",
                body_len, signature_size
            )));
        }

        let header_end = LIST_HEADER_SIZE + header_size;
        let header = bytes[LIST_HEADER_SIZE..header_end].to_vec();
        let signatures = bytes[header_end..list_size]
            .chunks_exact(signature_size)
            .map(|entry| SignatureData {
                owner: read_guid(entry, 0),
                data: entry[OWNER_SIZE..].to_vec(),
            })
            .collect();

        lists.push(SignatureList {
            signature_type,
            header,
            signatures,
        });
        bytes = &bytes[list_size..];
    }

    Ok(lists)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: Uuid = Uuid::from_u128(0x77fa9abd_0359_4d32_bd60_28f4e78f784b);

    #[test]
    fn test_x509_list_layout() {
        let der = vec![0x30, 0x82, 0x01, 0x0a, 0xde, 0xad];
        let bytes = SignatureList::for_x509(OWNER, &der).to_bytes().unwrap();

        // EFI_CERT_X509_GUID in mixed-endian form
        assert_eq!(
            &bytes[..16],
            &[
                0xa1, 0x59, 0xc0, 0xa5, 0xe4, 0x94, 0xa7, 0x4a, 0x87, 0xb5, 0xab, 0x15, 0x5c,
                0x2b, 0xf0, 0x72
            ]
        );
        assert_eq!(read_u32(&bytes, 16) as usize, bytes.len());
        assert_eq!(read_u32(&bytes, 20), 0);
        assert_eq!(read_u32(&bytes, 24) as usize, 16 + der.len());
        assert_eq!(&bytes[44..], der.as_slice());
    }

    #[test]
    fn test_decode_yields_certificate_and_owner() {
        let der = b"certificate-der-bytes".to_vec();
        let bytes = SignatureList::for_x509(OWNER, &der).to_bytes().unwrap();

        let lists = parse(&bytes).unwrap();
        assert_eq!(lists.len(), 1);
        assert!(lists[0].is_x509());
        assert_eq!(lists[0].signatures[0].owner, OWNER);
        assert_eq!(lists[0].signatures[0].data, der);
    }

    #[test]
    fn test_parse_concatenated_lists() {
        let mut bytes = SignatureList::for_x509(OWNER, b"first").to_bytes().unwrap();
        let hash_list = SignatureList {
            signature_type: EFI_CERT_SHA256_GUID,
            header: Vec::new(),
            signatures: vec![
                SignatureData {
                    owner: OWNER,
                    data: vec![0x11; 32],
                },
                SignatureData {
                    owner: Uuid::nil(),
                    data: vec![0x22; 32],
                },
            ],
        };
        bytes.extend(hash_list.to_bytes().unwrap());

        let lists = parse(&bytes).unwrap();
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[1], hash_list);
    }

    #[test]
    fn test_parse_empty_buffer() {
        assert!(parse(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let bytes = SignatureList::for_x509(OWNER, b"cert").to_bytes().unwrap();
        assert!(parse(&bytes[..bytes.len() - 1]).is_err());
        assert!(parse(&bytes[..10]).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_signature_size() {
        let mut bytes = SignatureList::for_x509(OWNER, b"cert").to_bytes().unwrap();
        bytes[24..28].copy_from_slice(&3u32.to_le_bytes());
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_oversized_header() {
        let mut bytes = SignatureList::for_x509(OWNER, b"cert").to_bytes().unwrap();
        bytes[20..24].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn test_encode_rejects_mixed_sizes() {
        let list = SignatureList {
            signature_type: EFI_CERT_SHA256_GUID,
            header: Vec::new(),
            signatures: vec![
                SignatureData {
                    owner: OWNER,
                    data: vec![0; 32],
                },
                SignatureData {
                    owner: OWNER,
                    data: vec![0; 20],
                },
            ],
        };
        assert!(list.to_bytes().is_err());
    }
}
