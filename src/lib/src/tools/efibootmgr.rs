use super::{FirmwareBootMgr, FirmwareEntry, PartitionLocation, VarFsStatus};
use crate::error::SbError;
use crate::process::{CommandRunner, Invocation};
use std::fs;
use std::path::{Path, PathBuf};

const SYS_CLASS_BLOCK: &str = "/sys/class/block";

/// [`FirmwareBootMgr`] backed by util-linux (`findmnt`, `mount`, `lsblk`)
/// and `efibootmgr`.
#[derive(Debug, Clone)]
pub struct EfiBootMgr<R> {
    runner: R,
    sys_block: PathBuf,
}

impl<R: CommandRunner> EfiBootMgr<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            sys_block: PathBuf::from(SYS_CLASS_BLOCK),
        }
    }

    /// Read partition numbers from another sysfs tree.
    pub fn with_sys_block(mut self, sys_block: impl Into<PathBuf>) -> Self {
        self.sys_block = sys_block.into();
        self
    }

    fn run_stdout(&self, invocation: Invocation) -> Result<String, SbError> {
        Ok(self.runner.run(&invocation)?.stdout.trim().to_string())
    }
}

impl<R: CommandRunner> FirmwareBootMgr for EfiBootMgr<R> {
    fn varfs_status(&self, mountpoint: &Path) -> Result<VarFsStatus, SbError> {
        let invocation = Invocation::new("findmnt")
            .args(["-n", "-o", "FSTYPE,OPTIONS", "--mountpoint"])
            .path(mountpoint);
        // findmnt exits 1 when nothing is mounted there
        let line = match self.run_stdout(invocation) {
            Ok(line) => line,
            Err(SbError::ToolFailure { .. }) => return Ok(VarFsStatus::Absent),
            Err(e) => return Err(e),
        };
        Ok(parse_varfs_status(&line))
    }

    fn mount_varfs(&self, mountpoint: &Path) -> Result<(), SbError> {
        let invocation = Invocation::new("mount")
            .args(["-t", "efivarfs", "efivarfs"])
            .path(mountpoint);
        self.runner
            .run(&invocation)
            .map_err(|e| SbError::VarFsUnavailable(e.to_string()))?;
        Ok(())
    }

    fn remount_varfs_rw(&self, mountpoint: &Path) -> Result<(), SbError> {
        let invocation = Invocation::new("mount")
            .args(["-o", "remount,rw"])
            .path(mountpoint);
        self.runner
            .run(&invocation)
            .map_err(|e| SbError::VarFsUnavailable(e.to_string()))?;
        Ok(())
    }

    fn resolve_partition(&self, mountpoint: &Path) -> Result<PartitionLocation, SbError> {
        let source = self.run_stdout(
            Invocation::new("findmnt")
                .args(["-n", "-o", "SOURCE", "--target"])
                .path(mountpoint),
        )?;
        if source.is_empty() {
            return Err(SbError::Missing {
                what: "block device backing the ESP",
                path: mountpoint.to_path_buf(),
            });
        }

        let parent = self.run_stdout(Invocation::new("lsblk").args(["-no", "PKNAME"]).arg(&source))?;
        let disk = match parent.lines().next().map(str::trim) {
            Some(name) if !name.is_empty() => PathBuf::from("/dev").join(name),
            _ => {
                return Err(SbError::InternalError(format!(
                    "'{}' has no parent disk",
                    source
                )))
            }
        };

        let device_name = Path::new(&source)
            .file_name()
            .ok_or_else(|| SbError::InternalError(format!("unexpected device '{}'", source)))?;
        let partition_file = self.sys_block.join(device_name).join("partition");
        let partition = fs::read_to_string(&partition_file)?
            .trim()
            .parse::<u32>()
            .map_err(|e| {
                SbError::InternalError(format!(
                    "bad partition number in '{}': {}",
                    partition_file.display(),
                    e
                ))
            })?;

        Ok(PartitionLocation { disk, partition })
    }

    fn list_entries(&self) -> Result<Vec<FirmwareEntry>, SbError> {
        let output = self.runner.run(&Invocation::new("efibootmgr").arg("-v"))?;
        Ok(parse_entries(&output.stdout))
    }

    fn create_entry(
        &self,
        location: &PartitionLocation,
        loader: &str,
        label: &str,
    ) -> Result<(), SbError> {
        let invocation = Invocation::new("efibootmgr")
            .args(["--create", "--disk"])
            .path(&location.disk)
            .arg("--part")
            .arg(location.partition.to_string())
            .arg("--loader")
            .arg(loader)
            .arg("--label")
            .arg(label);
        self.runner.run(&invocation)?;
        Ok(())
    }
}

fn parse_varfs_status(line: &str) -> VarFsStatus {
    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some("efivarfs"), Some(options)) => {
            if options.split(',').any(|o| o == "ro") {
                VarFsStatus::ReadOnly
            } else {
                VarFsStatus::ReadWrite
            }
        }
        _ => VarFsStatus::Absent,
    }
}

/// Parse `efibootmgr -v` output.
///
/// Entry lines look like
/// `Boot0003* Label\tHD(1,GPT,...)/File(\EFI\arch\x.efi)`.
fn parse_entries(output: &str) -> Vec<FirmwareEntry> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("Boot")?;
            let number = rest.get(..4)?;
            if !number.chars().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            let rest = rest[4..].strip_prefix('*').unwrap_or(&rest[4..]);
            let rest = rest.strip_prefix(' ')?;
            let (label, device_path) = match rest.split_once('\t') {
                Some((label, path)) => (label, Some(path)),
                None => (rest, None),
            };
            let loader = device_path.and_then(|p| {
                let start = p.find("File(")? + "File(".len();
                let end = p[start..].find(')')? + start;
                Some(p[start..end].to_string())
            });
            Some(FirmwareEntry {
                number: number.to_string(),
                label: label.trim().to_string(),
                loader,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::recording::RecordingRunner;

    #[test]
    fn test_parse_varfs_status() {
        assert_eq!(
            parse_varfs_status("efivarfs rw,nosuid,nodev,noexec,relatime"),
            VarFsStatus::ReadWrite
        );
        assert_eq!(
            parse_varfs_status("efivarfs ro,nosuid,nodev"),
            VarFsStatus::ReadOnly
        );
        assert_eq!(parse_varfs_status(""), VarFsStatus::Absent);
        assert_eq!(parse_varfs_status("tmpfs rw"), VarFsStatus::Absent);
    }

    #[test]
    fn test_varfs_not_mounted() {
        let runner = RecordingRunner::new().failing("findmnt");
        let status = EfiBootMgr::new(&runner)
            .varfs_status(Path::new("/sys/firmware/efi/efivars"))
            .unwrap();
        assert_eq!(status, VarFsStatus::Absent);
    }

    #[test]
    fn test_mount_commands() {
        let runner = RecordingRunner::new();
        let mgr = EfiBootMgr::new(&runner);
        let mp = Path::new("/sys/firmware/efi/efivars");
        mgr.mount_varfs(mp).unwrap();
        mgr.remount_varfs_rw(mp).unwrap();

        assert_eq!(
            runner.command_lines(),
            vec![
                "mount -t efivarfs efivarfs /sys/firmware/efi/efivars",
                "mount -o remount,rw /sys/firmware/efi/efivars",
            ]
        );
    }

    #[test]
    fn test_mount_failure_is_varfs_unavailable() {
        let runner = RecordingRunner::new().failing("mount");
        let err = EfiBootMgr::new(&runner)
            .mount_varfs(Path::new("/sys/firmware/efi/efivars"))
            .unwrap_err();
        assert!(matches!(err, SbError::VarFsUnavailable(_)));
    }

    #[test]
    fn test_resolve_partition() {
        let sys = tempfile::tempdir().unwrap();
        fs::create_dir_all(sys.path().join("nvme0n1p1")).unwrap();
        fs::write(sys.path().join("nvme0n1p1/partition"), "1\n").unwrap();

        let runner = RecordingRunner::new()
            .with_stdout("findmnt", "/dev/nvme0n1p1\n")
            .with_stdout("lsblk", "nvme0n1\n");
        let location = EfiBootMgr::new(&runner)
            .with_sys_block(sys.path())
            .resolve_partition(Path::new("/efi"))
            .unwrap();

        assert_eq!(
            location,
            PartitionLocation {
                disk: PathBuf::from("/dev/nvme0n1"),
                partition: 1,
            }
        );
        assert_eq!(
            runner.command_lines(),
            vec![
                "findmnt -n -o SOURCE --target /efi",
                "lsblk -no PKNAME /dev/nvme0n1p1",
            ]
        );
    }

    #[test]
    fn test_create_entry_command_line() {
        let runner = RecordingRunner::new();
        EfiBootMgr::new(&runner)
            .create_entry(
                &PartitionLocation {
                    disk: PathBuf::from("/dev/sda"),
                    partition: 2,
                },
                "\\EFI\\arch\\secure-boot-linux.efi",
                "secure-boot-linux",
            )
            .unwrap();

        assert_eq!(
            runner.command_lines(),
            vec![
                "efibootmgr --create --disk /dev/sda --part 2 \
                 --loader \\EFI\\arch\\secure-boot-linux.efi --label secure-boot-linux"
            ]
        );
    }

    #[test]
    fn test_parse_entries() {
        let output = "BootCurrent: 0001\n\
                      Timeout: 1 seconds\n\
                      BootOrder: 0001,0000\n\
                      Boot0000* Windows Boot Manager\tHD(1,GPT,abcd,0x800,0x82000)/File(\\EFI\\Microsoft\\Boot\\bootmgfw.efi)\n\
                      Boot0001* secure-boot-linux\tHD(1,GPT,abcd,0x800,0x82000)/File(\\EFI\\arch\\secure-boot-linux.efi)\n\
                      Boot0002  Inactive entry\n";

        let entries = parse_entries(output);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].number, "0001");
        assert_eq!(entries[1].label, "secure-boot-linux");
        assert_eq!(
            entries[1].loader.as_deref(),
            Some("\\EFI\\arch\\secure-boot-linux.efi")
        );
        assert_eq!(entries[2].label, "Inactive entry");
        assert_eq!(entries[2].loader, None);
    }
}
