//! Job log presentation.
//!
//! The runner's job log is stdout. Severity, masking and grouping are
//! expressed with GitHub Actions workflow commands (`::warning::...`,
//! `::add-mask::...`, `::group::...`). Agent diagnostics go to stderr through
//! `tracing` and are separate from this.

use std::io::Write;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use crate::transport::protocol::LogLevel;

/// Sink for job log output.
pub trait Console: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    /// Plain log line.
    fn info(&self, message: &str);

    /// Hide `value` wherever it appears in later log output.
    fn add_mask(&self, value: &str);

    fn start_group(&self, title: &str);

    fn end_group(&self);
}

/// [`Console`] that writes workflow commands to a writer (stdout in
/// production).
pub struct WorkflowConsole<W: Write + Send> {
    out: Mutex<W>,
}

impl WorkflowConsole<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> WorkflowConsole<W> {
    pub const fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, command: Option<&str>, data: &str) {
        let line = command.map_or_else(
            || format!("{data}\n"),
            |command| format!("::{command}::{}\n", escape_data(data)),
        );
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = out.write_all(line.as_bytes()).and_then(|()| out.flush()) {
            warn!(error = %e, "Failed to write to job log");
        }
    }
}

impl<W: Write + Send> Console for WorkflowConsole<W> {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => {
                error!(target: "job", "{message}");
                self.emit(Some("error"), message);
            }
            LogLevel::Warning => {
                warn!(target: "job", "{message}");
                self.emit(Some("warning"), message);
            }
            LogLevel::Info => {
                info!(target: "job", "{message}");
                self.emit(None, message);
            }
            LogLevel::Debug => {
                debug!(target: "job", "{message}");
                self.emit(Some("debug"), message);
            }
        }
    }

    fn info(&self, message: &str) {
        self.emit(None, message);
    }

    fn add_mask(&self, value: &str) {
        debug!(len = value.len(), "Registering secret mask");
        self.emit(Some("add-mask"), value);
    }

    fn start_group(&self, title: &str) {
        self.emit(Some("group"), title);
    }

    fn end_group(&self) {
        self.emit(Some("endgroup"), "");
    }
}

/// Escape workflow command data so it stays on one line.
fn escape_data(data: &str) -> String {
    data.replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(f: impl FnOnce(&WorkflowConsole<Vec<u8>>)) -> String {
        let console = WorkflowConsole::new(Vec::new());
        f(&console);
        String::from_utf8(console.into_inner()).unwrap()
    }

    #[test]
    fn levels_map_to_workflow_commands() {
        let out = rendered(|c| {
            c.log(LogLevel::Error, "boom");
            c.log(LogLevel::Warning, "careful");
            c.log(LogLevel::Info, "fyi");
            c.log(LogLevel::Debug, "details");
        });
        assert_eq!(out, "::error::boom\n::warning::careful\nfyi\n::debug::details\n");
    }

    #[test]
    fn groups_and_masks() {
        let out = rendered(|c| {
            c.start_group("Executing \"git status\"");
            c.add_mask("hunter2");
            c.end_group();
        });
        assert_eq!(
            out,
            "::group::Executing \"git status\"\n::add-mask::hunter2\n::endgroup::\n"
        );
    }

    #[test]
    fn multiline_data_is_escaped() {
        let out = rendered(|c| c.log(LogLevel::Warning, "50% done\r\nnext"));
        assert_eq!(out, "::warning::50%25 done%0D%0Anext\n");
    }
}
