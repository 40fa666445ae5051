//! Invocation of external tools
//!
//! Every collaborator that shells out (openssl, sbsign, objcopy, efitools,
//! efibootmgr, mount, snapper) goes through a [`CommandRunner`]. The runner
//! logs the full command line before running it and turns a non-zero exit
//! into [`SbError::ToolFailure`] carrying that command line, so a failing
//! operation always reports exactly what was invoked.

use crate::error::SbError;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::Command;

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Arguments as lossy UTF-8, for matching in tests and logs.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs.
pub trait CommandRunner {
    /// Run `invocation` to completion.
    ///
    /// Returns [`SbError::ToolFailure`] when the program cannot be spawned or
    /// exits unsuccessfully.
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput, SbError>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput, SbError> {
        (**self).run(invocation)
    }
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput, SbError> {
        log::debug!("Running: {}", invocation);

        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .output()
            .map_err(|e| SbError::ToolFailure {
                command: invocation.to_string(),
                status: "not started".to_string(),
                stderr: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(SbError::ToolFailure {
                command: invocation.to_string(),
                status: output.status.to_string(),
                stderr: stderr.trim_end().to_string(),
            });
        }

        if !stderr.is_empty() {
            log::debug!("{}: {}", invocation.program, stderr.trim_end());
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Records invocations and replays canned stdout per program.
    #[derive(Default)]
    pub struct RecordingRunner {
        pub calls: RefCell<Vec<Invocation>>,
        pub stdout: HashMap<String, String>,
        pub fail: Option<String>,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_stdout(mut self, program: &str, stdout: &str) -> Self {
            self.stdout.insert(program.to_string(), stdout.to_string());
            self
        }

        pub fn failing(mut self, program: &str) -> Self {
            self.fail = Some(program.to_string());
            self
        }

        pub fn command_lines(&self) -> Vec<String> {
            self.calls.borrow().iter().map(|c| c.to_string()).collect()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, invocation: &Invocation) -> Result<ToolOutput, SbError> {
            self.calls.borrow_mut().push(invocation.clone());
            if self.fail.as_deref() == Some(invocation.program.as_str()) {
                return Err(SbError::ToolFailure {
                    command: invocation.to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "simulated failure".to_string(),
                });
            }
            Ok(ToolOutput {
                stdout: self
                    .stdout
                    .get(&invocation.program)
                    .cloned()
                    .unwrap_or_default(),
                stderr: String::new(),
            })
        }
    }
}
