//! Helpers intended for [`std::process::Command`].

use std::io::Read;
use std::process::Command;

use color_eyre::eyre::{eyre, Result};

/// Cap on how much captured stderr is replayed into an error message, to
/// avoid pathological reports from chatty tools.
const MAX_STDERR_BYTES: usize = 1024;

/// Blocking child-process execution with failure context.
pub trait CommandRun {
    /// Execute the child and wait for it, returning an error carrying the
    /// tail of its stderr if it exits abnormally.
    fn run(&mut self) -> Result<()>;
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {self:?}");
        let status = self.status()?;
        if status.success() {
            return Ok(());
        }
        Err(eyre!(
            "subprocess failed: {status}\n{}",
            stderr_tail(stderr)
        ))
    }
}

fn stderr_tail(mut f: std::fs::File) -> String {
    use std::io::Seek;

    let mut buf = Vec::new();
    let read = f
        .seek(std::io::SeekFrom::Start(0))
        .and_then(|_| f.read_to_end(&mut buf));
    if let Err(err) = read {
        tracing::warn!("failed to read captured stderr: {err}");
        return "<failed to read stderr>".into();
    }
    let skip = buf.len().saturating_sub(MAX_STDERR_BYTES);
    String::from_utf8_lossy(&buf[skip..]).into_owned()
}
