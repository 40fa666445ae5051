use super::{EfiSigTool, VariableStore, WriteMode};
use crate::error::SbError;
use crate::process::{CommandRunner, Invocation};
use std::path::Path;
use uuid::Uuid;

/// efitools: `cert-to-efi-sig-list`, `sign-efi-sig-list` and `efi-updatevar`.
#[derive(Debug, Clone)]
pub struct EfiTools<R> {
    runner: R,
}

impl<R: CommandRunner> EfiTools<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> EfiSigTool for EfiTools<R> {
    fn cert_to_sig_list(&self, owner: &Uuid, cert: &Path, esl_out: &Path) -> Result<(), SbError> {
        let invocation = Invocation::new("cert-to-efi-sig-list")
            .arg("-g")
            .arg(owner.to_string())
            .path(cert)
            .path(esl_out);
        self.runner.run(&invocation)?;
        Ok(())
    }

    fn sign_sig_list(
        &self,
        variable: &str,
        owner: &Uuid,
        key: &Path,
        cert: &Path,
        esl: &Path,
        auth_out: &Path,
    ) -> Result<(), SbError> {
        let invocation = Invocation::new("sign-efi-sig-list")
            .arg("-g")
            .arg(owner.to_string())
            .arg("-k")
            .path(key)
            .arg("-c")
            .path(cert)
            .arg(variable)
            .path(esl)
            .path(auth_out);
        self.runner.run(&invocation)?;
        Ok(())
    }
}

impl<R: CommandRunner> VariableStore for EfiTools<R> {
    fn write(&self, variable: &str, payload: &Path, mode: WriteMode) -> Result<(), SbError> {
        let invocation = match mode {
            WriteMode::AuthenticatedAppend => Invocation::new("efi-updatevar").arg("-a"),
            WriteMode::Unauthenticated => Invocation::new("efi-updatevar").arg("-e"),
        };
        let invocation = invocation.arg("-f").path(payload).arg(variable);
        self.runner.run(&invocation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::recording::RecordingRunner;

    const GUID: Uuid = Uuid::from_u128(0x2f8b7e3c_5a1d_4c9e_8f00_1234567890ab);

    #[test]
    fn test_signature_list_commands() {
        let runner = RecordingRunner::new();
        let tools = EfiTools::new(&runner);
        tools
            .cert_to_sig_list(&GUID, Path::new("/k/db.crt"), Path::new("/k/db.esl"))
            .unwrap();
        tools
            .sign_sig_list(
                "db",
                &GUID,
                Path::new("/k/db.key"),
                Path::new("/k/db.crt"),
                Path::new("/k/db.esl"),
                Path::new("/k/db.auth"),
            )
            .unwrap();

        assert_eq!(
            runner.command_lines(),
            vec![
                "cert-to-efi-sig-list -g 2f8b7e3c-5a1d-4c9e-8f00-1234567890ab /k/db.crt /k/db.esl",
                "sign-efi-sig-list -g 2f8b7e3c-5a1d-4c9e-8f00-1234567890ab -k /k/db.key \
                 -c /k/db.crt db /k/db.esl /k/db.auth",
            ]
        );
    }

    #[test]
    fn test_variable_write_modes() {
        let runner = RecordingRunner::new();
        let tools = EfiTools::new(&runner);
        tools
            .write("KEK", Path::new("/k/KEK.auth"), WriteMode::AuthenticatedAppend)
            .unwrap();
        tools
            .write("PK", Path::new("/k/PK.esl"), WriteMode::Unauthenticated)
            .unwrap();

        assert_eq!(
            runner.command_lines(),
            vec![
                "efi-updatevar -a -f /k/KEK.auth KEK",
                "efi-updatevar -e -f /k/PK.esl PK",
            ]
        );
    }
}
