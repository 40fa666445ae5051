use sbkit::audit::{self, AuditSink};
use sbkit::{BootConfiguration, Lifecycle, Operation, SbError, Toolset, VariableOutcome};

use sbkit::reexports::log;

use clap::{Arg, ArgAction, Command, crate_description, crate_version};
use std::fmt;
use std::path::{Path, PathBuf};

/// An error, with the configuration that was active when it happened.
struct Failure {
    error: SbError,
    config: Option<BootConfiguration>,
}

impl From<SbError> for Failure {
    fn from(error: SbError) -> Self {
        Self {
            error,
            config: None,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(config) = &self.config {
            write!(f, "\nActive configuration: {:#?}", config)?;
        }
        Ok(())
    }
}

fn command() -> Command {
    let mut command = Command::new("secure-boot")
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Verbose output"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Prints debugging information, including every command run"),
        )
        .arg(
            Arg::new("audit")
                .long("audit")
                .action(ArgAction::SetTrue)
                .help("Enable structured audit logging (JSON to stderr)"),
        )
        .arg(
            Arg::new("audit-file")
                .long("audit-file")
                .value_name("FILE")
                .help("Write audit logs to FILE instead of stderr"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Configuration file (default: /etc/secure-boot/config.toml)"),
        );
    for operation in Operation::ALL {
        command = command.subcommand(Command::new(operation.as_str()).about(operation.about()));
    }
    command
}

fn start() -> Result<(), Failure> {
    let matches = command().get_matches();

    let verbose = matches.get_flag("verbose");
    let debug = matches.get_flag("debug");
    let audit_enabled = matches.get_flag("audit");
    let audit_file = matches.get_one::<String>("audit-file").map(PathBuf::from);

    env_logger::builder()
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else if verbose {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        })
        .init();

    if audit_enabled || audit_file.is_some() {
        audit::init(match audit_file {
            Some(path) => AuditSink::File(path),
            None => AuditSink::Stderr,
        })?;
    }

    let (name, _) = matches
        .subcommand()
        .ok_or(SbError::UsageError("Missing operation"))?;
    let operation: Operation = name.parse()?;

    let config_file = matches.get_one::<String>("config").map(Path::new);
    let config = BootConfiguration::load(config_file)?;
    log::debug!("Configuration: {:#?}", config);

    let lifecycle = Lifecycle::new(config, Toolset::system());
    run(&lifecycle, operation).map_err(|error| Failure {
        error,
        config: Some(lifecycle.config().clone()),
    })
}

fn run(lifecycle: &Lifecycle, operation: Operation) -> Result<(), SbError> {
    match operation {
        Operation::GenerateKeys => {
            let trust = lifecycle.generate_keys()?;
            println!(
                "Generated PK, KEK and db with GUID {} in '{}'",
                trust.guid(),
                trust.dir().display()
            );
        }
        Operation::GenerateEfi => {
            let staged = lifecycle.generate_efi()?;
            for artifact in &staged.artifacts {
                println!("Signed {}: {}", artifact.kind, artifact.file_path.display());
            }
            println!("Rescue script: {}", staged.rescue_script.display());
        }
        Operation::AddEfi => {
            let registration = lifecycle.add_efi()?;
            let entry = &registration.entry;
            println!(
                "{} boot entry '{}' -> {} ({} partition {})",
                if registration.reused { "Kept" } else { "Created" },
                entry.label,
                entry.loader_path,
                entry.firmware_device.display(),
                entry.partition_number
            );
        }
        Operation::EnrollKeys => {
            let report = lifecycle.enroll_keys()?;
            for (name, outcome) in &report.outcomes {
                println!("{}: {}", name, outcome);
            }
        }
        Operation::GenerateSnapshots => {
            let path = lifecycle.generate_snapshots()?;
            println!("Snapshot table written to {}", path.display());
        }
        Operation::InitialSetup => {
            let report = lifecycle.initial_setup()?;
            println!("Key hierarchy: {}", report.guid);
            if let Some(main) = report.staged.main() {
                println!("Signed image: {}", main.file_path.display());
            }
            println!("Boot entry: {}", report.registration.entry.label);
            for (name, outcome) in &report.enrollment.outcomes {
                println!("{}: {}", name, outcome);
            }
            if let Some(err) = report.enrollment.error() {
                eprintln!("Setup finished without enrolling every key; run `secure-boot enroll-keys` to retry");
                return Err(err);
            }
            if report
                .enrollment
                .outcomes
                .iter()
                .any(|(_, o)| *o == VariableOutcome::Enrolled)
            {
                println!("Secure Boot keys enrolled; enable Secure Boot in the firmware setup");
            }
        }
        Operation::Status => {
            let status = lifecycle.status()?;
            print!("{}", status);
        }
    }
    Ok(())
}

fn main() -> Result<(), SbError> {
    let res = start();
    match res {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    Ok(())
}
