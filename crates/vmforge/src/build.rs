//! Build orchestration for one resolved image node.
//!
//! A build runs three stages in order: disk provisioning, boot (installing
//! from the ISO when the image still needs it), and shell provisioning.
//! The orchestrator operates on exactly one node per call; building a
//! subtree is the caller's decision, node by node.
//!
//! The disk tool runs blocking. The emulator is spawned without waiting for
//! it to exit: the VM is meant to keep running after the builder returns.
//! In dry mode every stage prints the command it would run and spawns
//! nothing.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::command_run::CommandRun;
use crate::errors::Error;
use crate::image::{FailurePolicy, Image, ProvisionCommand};
use crate::install_marker;
use crate::qemu;
use crate::ssh::ShellSession;

/// Per-invocation build settings.
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions<'a> {
    /// Directory holding disks, install markers, and relative ISO paths;
    /// the definition file's directory.
    pub base_dir: &'a Utf8Path,
    /// Print commands without spawning anything.
    pub dry: bool,
}

/// Build one node: disk, boot/install, provisioning.
pub fn build(image: &Image, opts: &BuildOptions<'_>) -> Result<(), Error> {
    println!("Building image '{}'", image.display_path());
    let disk_file = provision_disk(image, opts)?;
    boot_stage(image, &disk_file, opts)?;
    provision(image, opts)?;
    Ok(())
}

/// Stage 1: make sure the disk file exists. Idempotent; an existing disk is
/// never clobbered. Returns the disk filename used by the later stages.
fn provision_disk(image: &Image, opts: &BuildOptions<'_>) -> Result<String, Error> {
    let disk_file = image.disk_file_name();
    let disk_path = opts.base_dir.join(&disk_file);

    if disk_path.exists() {
        println!("Disk {disk_path} already exists, skipping creation");
        return Ok(disk_file);
    }

    let cmd = qemu::disk_create(image, &disk_file);
    println!("Running {}", cmd.render());
    if opts.dry {
        return Ok(disk_file);
    }

    cmd.to_command()
        .current_dir(opts.base_dir)
        .run()
        .map_err(|err| Error::DiskTool(format!("{disk_file}: {err}")))?;
    Ok(disk_file)
}

/// Stage 2: launch the emulator, attaching the install medium when the
/// image still needs installing. The launch is fire-and-forget.
fn boot_stage(image: &Image, disk_file: &str, opts: &BuildOptions<'_>) -> Result<(), Error> {
    let install_iso = match &image.iso {
        Some(iso) => {
            let iso = resolve_iso_path(iso, opts.base_dir);
            if install_marker::needs_install(image, &iso, disk_file, opts.base_dir) {
                Some(iso)
            } else {
                println!("Image '{}' already installed, booting existing disk", image.id);
                None
            }
        }
        None => None,
    };

    if let Some(iso) = &install_iso {
        if !opts.dry && !iso.exists() {
            return Err(Error::NotFound(iso.clone()));
        }
    }

    let cmd = qemu::boot(image, disk_file, install_iso.as_deref());
    println!("Running {}", cmd.render());
    if opts.dry {
        return Ok(());
    }

    let child = cmd
        .to_command()
        .current_dir(opts.base_dir)
        .spawn()
        .map_err(|err| {
            Error::EmulatorLaunch(format!("{}: {err}", image.paths.qemu.qemu_system))
        })?;
    debug!("emulator started for '{}' (pid {})", image.id, child.id());

    if let Some(iso) = &install_iso {
        install_marker::record_install(image, iso, disk_file, opts.base_dir);
    }
    Ok(())
}

/// Absolute ISO paths are taken as-is; relative ones resolve against the
/// definition file's directory.
fn resolve_iso_path(iso: &Utf8Path, base_dir: &Utf8Path) -> Utf8PathBuf {
    if iso.is_absolute() {
        iso.to_owned()
    } else {
        base_dir.join(iso)
    }
}

/// Stage 3: run the node's provisioning commands over a shell session,
/// honoring each command's failure policy.
fn provision(image: &Image, opts: &BuildOptions<'_>) -> Result<(), Error> {
    if image.commands.is_empty() {
        return Ok(());
    }
    if opts.dry {
        println!(
            "Dry run: skipping {} provisioning command(s)",
            image.commands.len()
        );
        return Ok(());
    }

    let port = image.ssh_host_port().ok_or_else(|| {
        Error::ShellConnect(format!(
            "image '{}' has provisioning commands but no tcp port forward to guest port 22",
            image.display_path()
        ))
    })?;

    let session = ShellSession::new(port, image.auth.clone());
    let elapsed = session.wait_ready()?;
    println!(
        "Shell ready after {}s, running {} command(s)",
        elapsed.as_secs(),
        image.commands.len()
    );

    for (index, command) in image.commands.iter().enumerate() {
        println!("[{}/{}] {}", index + 1, image.commands.len(), command.data);
        run_with_policy(command, || Ok(session.exec(&command.data)?.success()))?;
    }
    Ok(())
}

/// Drive one command to completion under its failure policy. `exec` runs
/// the command once and reports whether it succeeded.
fn run_with_policy(
    command: &ProvisionCommand,
    mut exec: impl FnMut() -> Result<bool, Error>,
) -> Result<(), Error> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if exec()? {
            return Ok(());
        }
        match command.failure {
            FailurePolicy::Warn => {
                warn!("command failed (continuing): {}", command.data);
                return Ok(());
            }
            FailurePolicy::Abort => {
                return Err(Error::Provision(format!(
                    "command failed: {}",
                    command.data
                )));
            }
            FailurePolicy::Retry => {
                if attempts > command.max_retries {
                    return Err(Error::Provision(format!(
                        "command failed after {attempts} attempts: {}",
                        command.data
                    )));
                }
                warn!(
                    "command failed (attempt {attempts}/{}), retrying: {}",
                    command.max_retries + 1,
                    command.data
                );
            }
        }
    }
}
