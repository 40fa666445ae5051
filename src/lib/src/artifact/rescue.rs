//! EFI shell rescue script
//!
//! `recovery.nsh` lives at the ESP root. Run from the rescue shell as
//! `recovery.nsh <number>`, it boots the recovery image of the configured
//! kernel, which has no built-in command line, with the root
//! filesystem switched to snapshot `<number>`: the shell substitutes `%1`
//! in the snapshot subvolume template. Without an argument it prints the
//! snapshot table written by `generate-snapshots`.

/// Replace the root subvolume in `subvol=` mount options with `snapshot`.
///
/// Matches `subvol=<root>` and `subvol=/<root>` as a whole option, either as
/// its own parameter or inside a comma-separated `rootflags=` list. Returns
/// the rewritten command line and whether anything was replaced.
pub fn rewrite_root_subvolume(cmdline: &str, root: &str, snapshot: &str) -> (String, bool) {
    let mut replaced = false;
    let tokens: Vec<String> = cmdline
        .split_whitespace()
        .map(|token| {
            token
                .split(',')
                .map(|option| match rewrite_option(option, root, snapshot) {
                    Some(rewritten) => {
                        replaced = true;
                        rewritten
                    }
                    None => option.to_string(),
                })
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect();
    (tokens.join(" "), replaced)
}

fn rewrite_option(option: &str, root: &str, snapshot: &str) -> Option<String> {
    let head = option.strip_suffix(root)?;
    let head = head.strip_suffix('/').unwrap_or(head);
    if head == "subvol=" || head.ends_with("=subvol=") {
        Some(format!("{}{}", head, snapshot))
    } else {
        None
    }
}

/// Render the script booting `loader` (firmware path of a recovery image).
pub fn render_rescue_script(loader: &str, cmdline: &str, root: &str, snapshot: &str) -> String {
    let (snapshot_cmdline, replaced) = rewrite_root_subvolume(cmdline, root, snapshot);
    if !replaced {
        log::warn!(
            "Kernel command line has no subvol={} option; the rescue script will boot the current root",
            root
        );
    }

    let mut script = String::new();
    script.push_str("@echo -off\r\n");
    script.push_str("if \"%1\" == \"\" then\r\n");
    script.push_str("  echo \"usage: recovery.nsh <snapshot number>\"\r\n");
    script.push_str("  type snapshots.txt\r\n");
    script.push_str("  exit\r\n");
    script.push_str("endif\r\n");
    script.push_str(&format!("echo \"Booting snapshot %1\"\r\n{} {}\r\n", loader, snapshot_cmdline));
    script
}
