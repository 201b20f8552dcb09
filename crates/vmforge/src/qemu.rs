//! Command formatting for the external virtualization tools.
//!
//! Pure string construction from a resolved image definition; no I/O and no
//! process spawning happens here. The orchestrator decides where and whether
//! the formatted invocations actually run.

use camino::{Utf8Path, Utf8PathBuf};

use crate::image::{Image, PortForward};

/// A formatted invocation: program plus argument vector, exactly as handed
/// to the OS. `render` is for operator display only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: Utf8PathBuf,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Display form with the executable path quoted, matching the shape of
    /// the underlying tool invocations.
    pub fn render(&self) -> String {
        let mut out = format!("\"{}\"", self.program);
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    pub fn to_command(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// `qemu-img create -f qcow2 <disk> <N>G`
pub fn disk_create(image: &Image, disk_file: &str) -> CommandLine {
    CommandLine {
        program: image.paths.qemu.qemu_img.clone(),
        args: vec![
            "create".into(),
            "-f".into(),
            "qcow2".into(),
            disk_file.into(),
            format!("{}G", image.init_size_gb),
        ],
    }
}

/// Emulator boot invocation. `iso` attaches an install medium; when absent
/// the node boots from its existing disk.
pub fn boot(image: &Image, disk_file: &str, iso: Option<&Utf8Path>) -> CommandLine {
    let mut args: Vec<String> = Vec::new();

    if image.kvm {
        args.extend(["-enable-kvm".into(), "-cpu".into(), "host".into()]);
    }

    args.extend([
        "-boot".into(),
        "menu=on".into(),
        "-boot".into(),
        "order=d".into(),
    ]);

    if let Some(iso) = iso {
        args.extend(["-cdrom".into(), iso.to_string()]);
    }

    args.extend([
        "-drive".into(),
        format!("file={disk_file},format=qcow2"),
        "-m".into(),
        format!("{}G", image.memory_gb),
        "-nic".into(),
        nic_clause(&image.port_forward),
    ]);

    CommandLine {
        program: image.paths.qemu.qemu_system.clone(),
        args,
    }
}

/// All forwarding rules ride on a single user-mode interface, one `hostfwd`
/// entry per rule.
fn nic_clause(rules: &[PortForward]) -> String {
    let mut clause = String::from("user");
    for rule in rules {
        clause.push_str(&format!(
            ",hostfwd={}::{}-:{}",
            rule.protocol, rule.host_port, rule.vm_port
        ));
    }
    clause
}
