use super::PeEditor;
use crate::artifact::Section;
use crate::error::SbError;
use crate::process::{CommandRunner, Invocation};
use std::ffi::OsString;
use std::path::Path;

/// [`PeEditor`] backed by binutils `objcopy`.
#[derive(Debug, Clone)]
pub struct Objcopy<R> {
    runner: R,
}

impl<R: CommandRunner> Objcopy<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> PeEditor for Objcopy<R> {
    fn inject_sections(
        &self,
        stub: &Path,
        sections: &[Section],
        output: &Path,
    ) -> Result<(), SbError> {
        let mut invocation = Invocation::new("objcopy");
        for section in sections {
            let mut add = OsString::from(format!("{}=", section.name));
            add.push(section.source.as_os_str());
            invocation = invocation
                .arg("--add-section")
                .arg(add)
                .arg("--change-section-vma")
                .arg(format!("{}={:#x}", section.name, section.address));
        }
        let invocation = invocation.path(stub).path(output);
        self.runner.run(&invocation)?;
        Ok(())
    }
}
