//! On-disk Secure Boot key hierarchy
//!
//! A key directory holds, for each of `PK`, `KEK` and `db`:
//!
//! | File          | Content                                          |
//! |---------------|--------------------------------------------------|
//! | `<name>.key`  | RSA private key (PEM, mode 0600)                 |
//! | `<name>.crt`  | self-signed certificate (PEM)                    |
//! | `<name>.esl`  | `EFI_SIGNATURE_LIST` of the certificate          |
//! | `<name>.auth` | authenticated variable update (mode 0600)        |
//!
//! plus a `uuid` file with the owner GUID shared by all three lists.

use crate::error::SbError;
use crate::esl;
use crate::secure_file;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

mod generator;

pub use generator::KeyHierarchyGenerator;

/// Name of the file holding the owner GUID.
pub const GUID_FILE: &str = "uuid";

/// One level of the Secure Boot hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyName {
    PK,
    KEK,
    #[serde(rename = "db")]
    Db,
}

impl KeyName {
    /// Generation order.
    pub const ALL: [KeyName; 3] = [KeyName::PK, KeyName::KEK, KeyName::Db];

    /// The only order in which the variables may be written; PK goes last
    /// because setting it ends setup mode.
    pub const ENROLLMENT_ORDER: [KeyName; 3] = [KeyName::Db, KeyName::KEK, KeyName::PK];

    /// Variable name, also the file stem.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyName::PK => "PK",
            KeyName::KEK => "KEK",
            KeyName::Db => "db",
        }
    }

    pub fn common_name(&self) -> String {
        format!("SecureBoot {}", self.as_str())
    }
}

impl fmt::Display for KeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Paths of the four files belonging to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFiles {
    pub private_key: PathBuf,
    pub certificate: PathBuf,
    pub signature_list: PathBuf,
    pub auth_payload: PathBuf,
}

impl KeyFiles {
    pub fn new(dir: &Path, name: KeyName) -> Self {
        let stem = name.as_str();
        Self {
            private_key: dir.join(format!("{}.key", stem)),
            certificate: dir.join(format!("{}.crt", stem)),
            signature_list: dir.join(format!("{}.esl", stem)),
            auth_payload: dir.join(format!("{}.auth", stem)),
        }
    }

    pub fn all(&self) -> [&Path; 4] {
        [
            &self.private_key,
            &self.certificate,
            &self.signature_list,
            &self.auth_payload,
        ]
    }
}

/// A complete key hierarchy in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustStore {
    dir: PathBuf,
    guid: Uuid,
}

impl TrustStore {
    /// True if `dir` exists and contains anything at all.
    pub fn is_populated(dir: &Path) -> Result<bool, SbError> {
        match fs::read_dir(dir) {
            Ok(mut entries) => Ok(entries.next().is_some()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// True if `dir` holds every file of a hierarchy and a readable GUID.
    pub fn is_complete(dir: &Path) -> bool {
        Self::load(dir).is_ok()
    }

    /// Open an existing hierarchy; every file must be present.
    pub fn load(dir: &Path) -> Result<Self, SbError> {
        let guid_path = dir.join(GUID_FILE);
        if !guid_path.is_file() {
            return Err(SbError::Missing {
                what: "key hierarchy GUID",
                path: guid_path,
            });
        }
        let guid_text = fs::read_to_string(&guid_path)?;
        let guid = Uuid::parse_str(guid_text.trim()).map_err(|e| {
            SbError::InconsistentTrustStore(format!(
                "'{}' does not hold a GUID: {}",
                guid_path.display(),
                e
            ))
        })?;

        for name in KeyName::ALL {
            for path in KeyFiles::new(dir, name).all() {
                if !path.is_file() {
                    return Err(SbError::Missing {
                        what: "key file",
                        path: path.to_path_buf(),
                    });
                }
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            guid,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn files(&self, name: KeyName) -> KeyFiles {
        KeyFiles::new(&self.dir, name)
    }

    /// DER encoding of the certificate of `name`.
    pub fn certificate_der(&self, name: KeyName) -> Result<Vec<u8>, SbError> {
        let pem_bytes = fs::read(self.files(name).certificate)?;
        let (_, pem) = x509_parser::pem::parse_x509_pem(&pem_bytes)?;
        Ok(pem.contents)
    }

    /// Check that every signature list holds exactly its own certificate
    /// owned by the hierarchy GUID, and that certificates carry the
    /// expected common name.
    pub fn verify(&self) -> Result<(), SbError> {
        for name in KeyName::ALL {
            let files = self.files(name);
            secure_file::check_permissions(&files.private_key)?;
            secure_file::check_permissions(&files.auth_payload)?;

            let der = self.certificate_der(name)?;
            let (_, cert) = x509_parser::parse_x509_certificate(&der)?;
            let cn = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or_default();
            if cn != name.common_name() {
                return Err(SbError::InconsistentTrustStore(format!(
                    "{} certificate has common name '{}', expected '{}'",
                    name,
                    cn,
                    name.common_name()
                )));
            }

            let lists = esl::parse(&fs::read(&files.signature_list)?)?;
            let entry = match lists.as_slice() {
                [list] if list.is_x509() && list.signatures.len() == 1 => &list.signatures[0],
                _ => {
                    return Err(SbError::InconsistentTrustStore(format!(
                        "{} must hold a single X.509 signature list with one entry",
                        files.signature_list.display()
                    )))
                }
            };
            if entry.owner != self.guid {
                return Err(SbError::InconsistentTrustStore(format!(
                    "{} is owned by {}, the hierarchy GUID is {}",
                    files.signature_list.display(),
                    entry.owner,
                    self.guid
                )));
            }
            if entry.data != der {
                return Err(SbError::InconsistentTrustStore(format!(
                    "{} does not contain {}",
                    files.signature_list.display(),
                    files.certificate.display()
                )));
            }
        }
        Ok(())
    }
}
