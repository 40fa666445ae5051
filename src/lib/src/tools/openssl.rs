use super::{CertAuthority, CertificateRequest};
use crate::error::SbError;
use crate::process::{CommandRunner, Invocation};
use std::path::Path;

/// [`CertAuthority`] backed by `openssl req -x509`.
#[derive(Debug, Clone)]
pub struct OpensslCa<R> {
    runner: R,
}

impl<R: CommandRunner> OpensslCa<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> CertAuthority for OpensslCa<R> {
    fn create_self_signed(
        &self,
        request: &CertificateRequest,
        key_out: &Path,
        cert_out: &Path,
    ) -> Result<(), SbError> {
        let invocation = Invocation::new("openssl")
            .args(["req", "-new", "-x509", "-newkey"])
            .arg(format!("rsa:{}", request.rsa_bits))
            .args(["-nodes", "-sha256", "-days"])
            .arg(request.validity_days.to_string())
            .arg("-subj")
            .arg(format!("/CN={}/", request.common_name))
            .arg("-keyout")
            .path(key_out)
            .arg("-out")
            .path(cert_out);
        self.runner.run(&invocation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::recording::RecordingRunner;

    #[test]
    fn test_openssl_command_line() {
        let runner = RecordingRunner::new();
        OpensslCa::new(&runner)
            .create_self_signed(
                &CertificateRequest::secure_boot("SecureBoot KEK"),
                Path::new("/keys/KEK.key"),
                Path::new("/keys/KEK.crt"),
            )
            .unwrap();

        assert_eq!(
            runner.command_lines(),
            vec![
                "openssl req -new -x509 -newkey rsa:4096 -nodes -sha256 -days 3650 \
                 -subj '/CN=SecureBoot KEK/' -keyout /keys/KEK.key -out /keys/KEK.crt"
            ]
        );
    }

    #[test]
    fn test_openssl_failure_propagates() {
        let runner = RecordingRunner::new().failing("openssl");
        let err = OpensslCa::new(&runner)
            .create_self_signed(
                &CertificateRequest::secure_boot("SecureBoot PK"),
                Path::new("PK.key"),
                Path::new("PK.crt"),
            )
            .unwrap_err();
        assert!(matches!(err, SbError::ToolFailure { .. }));
    }
}
