use super::{KeyFiles, KeyName, TrustStore, GUID_FILE};
use crate::audit;
use crate::error::SbError;
use crate::secure_file;
use crate::tools::{CertAuthority, CertificateRequest, EfiSigTool};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Creates a fresh PK/KEK/db hierarchy.
///
/// Keys are created in a staging directory next to the target and moved
/// into it only once all of them exist, the GUID file last. A failing step
/// leaves the target untouched. The caller decides whether an existing
/// hierarchy may be overwritten.
pub struct KeyHierarchyGenerator<'a> {
    cert_authority: &'a dyn CertAuthority,
    sig_tool: &'a dyn EfiSigTool,
}

impl<'a> KeyHierarchyGenerator<'a> {
    pub fn new(cert_authority: &'a dyn CertAuthority, sig_tool: &'a dyn EfiSigTool) -> Self {
        Self {
            cert_authority,
            sig_tool,
        }
    }

    pub fn generate(&self, dir: &Path) -> Result<TrustStore, SbError> {
        let parent = dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".secure-boot-keys.")
            .tempdir_in(parent)?;

        let guid = Uuid::new_v4();
        log::info!("Generating key hierarchy {} in '{}'", guid, dir.display());
        for name in KeyName::ALL {
            self.generate_key(staging.path(), name, &guid)?;
        }
        fs::write(staging.path().join(GUID_FILE), format!("{}\n", guid))?;

        fs::create_dir_all(dir)?;
        for name in KeyName::ALL {
            let staged = KeyFiles::new(staging.path(), name);
            let target = KeyFiles::new(dir, name);
            for (from, to) in staged.all().into_iter().zip(target.all()) {
                fs::rename(from, to)?;
            }
        }
        fs::rename(staging.path().join(GUID_FILE), dir.join(GUID_FILE))?;

        let store = TrustStore::load(dir)?;
        for name in KeyName::ALL {
            audit::log_key_generated(name.as_str(), &guid, &store.files(name).certificate);
        }
        Ok(store)
    }

    fn generate_key(&self, dir: &Path, name: KeyName, guid: &Uuid) -> Result<(), SbError> {
        let files = KeyFiles::new(dir, name);
        log::info!("Creating {} key", name);

        self.cert_authority.create_self_signed(
            &CertificateRequest::secure_boot(name.common_name()),
            &files.private_key,
            &files.certificate,
        )?;
        secure_file::restrict_permissions(&files.private_key)?;

        self.sig_tool
            .cert_to_sig_list(guid, &files.certificate, &files.signature_list)?;
        self.sig_tool.sign_sig_list(
            name.as_str(),
            guid,
            &files.private_key,
            &files.certificate,
            &files.signature_list,
            &files.auth_payload,
        )?;
        secure_file::restrict_permissions(&files.auth_payload)?;
        Ok(())
    }
}
