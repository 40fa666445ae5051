use super::{
    render_rescue_script, ArtifactKind, BuildOutput, Section, SectionLayout, UnsignedArtifact,
};
use crate::config::BootConfiguration;
use crate::error::SbError;
use crate::tools::PeEditor;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Builds the unsigned images and the rescue script in a fresh work directory.
pub struct ArtifactBuilder<'a> {
    pe_editor: &'a dyn PeEditor,
    config: &'a BootConfiguration,
}

/// Source files of one build, all checked to exist.
struct Sources {
    cmdline: String,
    microcode: Vec<PathBuf>,
    initramfs: PathBuf,
    kernel: PathBuf,
    recovery: Vec<(String, PathBuf, PathBuf)>,
}

impl<'a> ArtifactBuilder<'a> {
    pub fn new(pe_editor: &'a dyn PeEditor, config: &'a BootConfiguration) -> Self {
        Self { pe_editor, config }
    }

    pub fn build(&self) -> Result<BuildOutput, SbError> {
        let sources = self.collect_sources()?;

        let workdir = tempfile::Builder::new().prefix("secure-boot.").tempdir()?;
        log::debug!("Building in '{}'", workdir.path().display());
        let work = workdir.path();
        let paths = &self.config.paths;

        let cmdline_file = work.join("cmdline.txt");
        fs::write(&cmdline_file, &sources.cmdline)?;

        let initrd = work.join(format!("initrd-{}.img", self.config.kernel));
        concatenate(
            sources.microcode.iter().chain(std::iter::once(&sources.initramfs)),
            &initrd,
        )?;

        let mut artifacts = Vec::new();

        log::info!("Building {}", self.config.main_artifact_name());
        artifacts.push(self.inject(
            ArtifactKind::Main,
            vec![
                Section::new(SectionLayout::OSREL, &paths.os_release),
                Section::new(SectionLayout::CMDLINE, cmdline_file),
                Section::new(SectionLayout::LINUX, &sources.kernel),
                Section::new(SectionLayout::INITRD, initrd),
            ],
            &work.join(self.config.main_artifact_name()),
        )?);

        for (flavor, kernel, initramfs) in &sources.recovery {
            let name = self.config.recovery_artifact_name(flavor);
            log::info!("Building {}", name);
            artifacts.push(self.inject(
                ArtifactKind::Recovery(flavor.clone()),
                vec![
                    Section::new(SectionLayout::OSREL, &paths.os_release),
                    Section::new(SectionLayout::LINUX, kernel),
                    Section::new(SectionLayout::INITRD, initramfs),
                ],
                &work.join(name),
            )?);
        }

        let shell = work.join(self.config.shell_artifact_name());
        fs::copy(&paths.efi_shell, &shell)?;
        artifacts.push(UnsignedArtifact {
            kind: ArtifactKind::RescueShell,
            file: shell,
            sections: Vec::new(),
        });

        // The main image embeds its command line, which the stub prefers over
        // loader arguments under Secure Boot.
        let loader = self.config.firmware_path(
            &self
                .config
                .efi_dir_path()
                .join(self.config.recovery_artifact_name(&self.config.kernel)),
        )?;
        let rescue_script = work.join("recovery.nsh");
        fs::write(
            &rescue_script,
            render_rescue_script(
                &loader,
                &sources.cmdline,
                &self.config.root_subvolume,
                &self.config.snapshot_subvolume,
            ),
        )?;

        Ok(BuildOutput {
            workdir,
            artifacts,
            rescue_script,
        })
    }

    fn inject(
        &self,
        kind: ArtifactKind,
        sections: Vec<Section>,
        output: &Path,
    ) -> Result<UnsignedArtifact, SbError> {
        SectionLayout::validate(&sections)?;
        self.pe_editor
            .inject_sections(&self.config.paths.stub, &sections, output)?;
        Ok(UnsignedArtifact {
            kind,
            file: output.to_path_buf(),
            sections,
        })
    }

    /// Resolve and check every input before anything is written.
    fn collect_sources(&self) -> Result<Sources, SbError> {
        let config = self.config;
        let paths = &config.paths;

        require("EFI stub", &paths.stub)?;
        require("os-release", &paths.os_release)?;
        require("EFI shell", &paths.efi_shell)?;

        let kernel = require("kernel image", &paths.kernel_image(&config.kernel))?;
        let initramfs = require("initramfs", &paths.initramfs(&config.kernel))?;

        let candidates: Vec<PathBuf> = config
            .microcode
            .vendors()
            .iter()
            .map(|vendor| paths.microcode(vendor))
            .collect();
        let microcode: Vec<PathBuf> = candidates.iter().filter(|p| p.is_file()).cloned().collect();
        if microcode.is_empty() {
            return Err(SbError::Missing {
                what: "microcode image",
                path: candidates[0].clone(),
            });
        }
        log::debug!("Microcode images: {:?}", microcode);

        let mut recovery = Vec::new();
        for flavor in &config.recovery_flavors {
            recovery.push((
                flavor.clone(),
                require("kernel image", &paths.kernel_image(flavor))?,
                require("fallback initramfs", &paths.fallback_initramfs(flavor))?,
            ));
        }

        Ok(Sources {
            cmdline: read_cmdline(config)?,
            microcode,
            initramfs,
            kernel,
            recovery,
        })
    }
}

fn require(what: &'static str, path: &Path) -> Result<PathBuf, SbError> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(SbError::Missing {
            what,
            path: path.to_path_buf(),
        })
    }
}

fn concatenate<'p>(inputs: impl Iterator<Item = &'p PathBuf>, output: &Path) -> Result<(), SbError> {
    let mut out = File::create(output)?;
    for input in inputs {
        io::copy(&mut File::open(input)?, &mut out)?;
    }
    out.flush()?;
    Ok(())
}

/// Kernel command line for the main image.
///
/// Read from the configured file, or from the running kernel with the
/// boot-loader supplied `BOOT_IMAGE=` and `initrd=` parameters dropped.
pub fn read_cmdline(config: &BootConfiguration) -> Result<String, SbError> {
    if config.cmdline.is_file() {
        let content = fs::read_to_string(&config.cmdline)?;
        return Ok(content.split_whitespace().collect::<Vec<_>>().join(" "));
    }

    let fallback = &config.paths.proc_cmdline;
    if !fallback.is_file() {
        return Err(SbError::Missing {
            what: "kernel command line",
            path: config.cmdline.clone(),
        });
    }
    log::info!(
        "'{}' not found, using the running kernel's command line",
        config.cmdline.display()
    );
    let content = fs::read_to_string(fallback)?;
    Ok(content
        .split_whitespace()
        .filter(|p| !p.starts_with("BOOT_IMAGE=") && !p.starts_with("initrd="))
        .collect::<Vec<_>>()
        .join(" "))
}
