//! Uniform file-and-process access to a provisioning target.
//!
//! The invoker core consumes this as an opaque capability set: it never
//! touches the target directly, only through [`Access`]. `LocalAccess`
//! operates on the invoking machine itself; `SshAccess` drives a remote
//! host through `ssh`/`scp` subprocesses. `ScriptedAccess` is a test
//! double that records operations and replays scripted command outcomes.

use anyhow::Result;
use std::path::Path;

mod local;
pub mod mock;
mod ssh;

pub use local::LocalAccess;
pub use mock::ScriptedAccess;
pub use ssh::{SshAccess, SshConfig};

/// Captured outcome of one command execution on the target.
///
/// A command that ran but exited non-zero is still `Ok`; `success()` is
/// how callers decide whether that matters.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn ok() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// File and process operations against one provisioning target.
///
/// All paths except `copy`'s source are target paths. `copy` pushes from
/// the invoking machine onto the target; every other operation stays on
/// the target side.
pub trait Access {
    fn exists(&self, path: &Path) -> Result<bool>;
    fn mkdir(&self, path: &Path) -> Result<()>;
    fn write_file(&self, path: &Path, content: &[u8]) -> Result<()>;
    /// Copy a file or directory tree from the invoking machine to the target.
    fn copy(&self, source: &Path, target: &Path) -> Result<()>;
    /// Rename a file or directory on the target.
    fn move_item(&self, source: &Path, target: &Path) -> Result<()>;
    fn remove(&self, path: &Path) -> Result<()>;
    fn exec(&self, command: &str) -> Result<ExecOutput>;
    /// Release any held connections. Called once per invocation, last.
    fn terminate(&self) -> Result<()>;
}

pub(crate) fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

pub(crate) fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_output_success_requires_zero_exit() {
        assert!(ExecOutput::ok().success());
        assert!(!ExecOutput::failed(1, "boom").success());
        assert!(!ExecOutput::default().success());
    }

    #[test]
    fn shell_quote_passes_plain_tokens_through() {
        assert_eq!(shell_quote("/opt/converge_installed"), "/opt/converge_installed");
        assert_eq!(shell_quote("a-b_c.d:e"), "a-b_c.d:e");
    }

    #[test]
    fn shell_quote_wraps_specials_in_single_quotes() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }
}
