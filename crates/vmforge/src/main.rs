//! vmforge - build and boot QEMU disk image trees from JSON definitions.
//!
//! A definition file describes a base image and its forked children; each
//! node can install from an ISO, forward ports into the guest, and run
//! post-boot provisioning commands over a shell session. One invocation
//! builds exactly one node of the tree.

use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::{Context as _, Result};

mod build;
mod command_run;
mod config;
mod errors;
mod image;
mod install_marker;
mod qemu;
mod ssh;

use build::BuildOptions;
use config::GlobalConfig;
use errors::Error;
use image::Image;

/// Default global configuration filename, looked up next to the tool.
const DEFAULT_GLOBAL_CONFIG: &str = "global.config.json";

/// Build and boot QEMU disk image trees from hierarchical JSON definitions.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Image definition file. Relative paths resolve against the
    /// executable's directory.
    #[clap(long = "def", value_name = "PATH")]
    def: Utf8PathBuf,

    /// Global configuration file with tool paths and default credentials.
    #[clap(long, value_name = "PATH", default_value = DEFAULT_GLOBAL_CONFIG)]
    config: Utf8PathBuf,

    /// Print the commands that would run without spawning any process.
    #[clap(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    dry: bool,

    /// Node to build: a globalAccessableId alias or a slash-separated id
    /// path such as 'base/web'. Defaults to the root node.
    #[clap(long, value_name = "SELECTOR")]
    image: Option<String>,
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by the RUST_LOG environment variable, defaulting to
/// 'info', and written to stderr so operator output on stdout stays clean.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> ExitCode {
    install_tracing();
    if let Err(err) = color_eyre::install() {
        eprintln!("failed to install error reporting: {err}");
    }

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("Error: {report:?}");
            ExitCode::from(exit_code_for(&report))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let install_dir = install_dir()?;
    let def_path = resolve_against(&install_dir, &cli.def);
    let config_path = resolve_against(&install_dir, &cli.config);

    let global = GlobalConfig::load(&config_path)?;
    let root = Image::load(&def_path, &global)?;

    let node = match &cli.image {
        Some(selector) => root.find(selector).ok_or_else(|| {
            Error::Validation(format!(
                "no image matches selector '{selector}' (alias or id path expected)"
            ))
        })?,
        None => &root,
    };

    // Disks, markers, and relative ISO paths live next to the definition
    // file so re-runs from any working directory find the same artifacts.
    let base_dir = def_path
        .parent()
        .map(Utf8Path::to_owned)
        .unwrap_or_else(|| Utf8PathBuf::from("."));

    build::build(
        node,
        &BuildOptions {
            base_dir: &base_dir,
            dry: cli.dry,
        },
    )?;
    Ok(())
}

/// Directory the executable was installed to, the resolution base for
/// relative CLI paths. Falls back to the working directory.
fn install_dir() -> Result<Utf8PathBuf> {
    let dir = match std::env::current_exe().ok().and_then(|p| {
        p.parent().map(std::path::Path::to_path_buf)
    }) {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    Utf8PathBuf::from_path_buf(dir)
        .map_err(|dir| color_eyre::eyre::eyre!("non-UTF-8 install path: {}", dir.display()))
}

fn resolve_against(base: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        base.join(path)
    }
}

/// Map a failed run onto its classified exit code; unclassified errors
/// exit 1.
fn exit_code_for(report: &color_eyre::Report) -> u8 {
    report
        .chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map(Error::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_bare_dry_flag_as_true() {
        let cli = Cli::parse_from(["vmforge", "--def", "image.json", "--dry"]);
        assert!(cli.dry);
    }

    #[test]
    fn cli_parses_explicit_dry_values() {
        let cli = Cli::parse_from(["vmforge", "--def", "image.json", "--dry=false"]);
        assert!(!cli.dry);
        let cli = Cli::parse_from(["vmforge", "--def", "image.json", "--dry=1"]);
        assert!(cli.dry);
    }

    #[test]
    fn cli_dry_defaults_to_false() {
        let cli = Cli::parse_from(["vmforge", "--def", "image.json"]);
        assert!(!cli.dry);
        assert_eq!(cli.config, DEFAULT_GLOBAL_CONFIG);
        assert!(cli.image.is_none());
    }

    #[test]
    fn relative_paths_resolve_against_the_base() {
        let base = Utf8Path::new("/opt/vmforge");
        assert_eq!(
            resolve_against(base, Utf8Path::new("image.json")),
            "/opt/vmforge/image.json"
        );
        assert_eq!(
            resolve_against(base, Utf8Path::new("/etc/vmforge/image.json")),
            "/etc/vmforge/image.json"
        );
    }

    #[test]
    fn classified_errors_map_to_their_exit_codes() {
        let report = color_eyre::Report::new(Error::NotFound("x.json".into()));
        assert_eq!(exit_code_for(&report), 2);

        let report = color_eyre::Report::new(Error::Provision("p".into()));
        assert_eq!(exit_code_for(&report), 9);

        let report = color_eyre::eyre::eyre!("unclassified");
        assert_eq!(exit_code_for(&report), 1);
    }

    #[test]
    fn classified_errors_survive_added_context() {
        use color_eyre::eyre::Context as _;
        let result: Result<()> =
            Err(Error::Validation("dup".into())).context("loading definition");
        assert_eq!(exit_code_for(&result.unwrap_err()), 5);
    }
}
