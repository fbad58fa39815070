use anyhow::{anyhow, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use crate::{quote_path, Access, ExecOutput};

/// SSH coordinates for one remote target.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_file: Option<PathBuf>,
}

impl SshConfig {
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Base `ssh` arguments (port, options, key, user@host) without a command.
    pub fn ssh_base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(ref key) = self.key_file {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
        }
        args.push(self.user_at_host());
        args
    }

    fn scp_base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-P".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-r".to_string(),
        ];
        if let Some(ref key) = self.key_file {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
        }
        args
    }
}

/// Access to a remote target through `ssh`/`scp` subprocesses. No
/// connection state is held; every operation is one subprocess.
#[derive(Debug)]
pub struct SshAccess {
    config: SshConfig,
}

impl SshAccess {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn run_remote(&self, command: &str) -> Result<ExecOutput> {
        debug!(host = %self.config.host, command, "running remote command");
        let output = Command::new("ssh")
            .args(self.config.ssh_base_args())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;
        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn run_remote_checked(&self, command: &str) -> Result<()> {
        let out = self.run_remote(command)?;
        if out.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "remote command `{}` on {} failed (exit {:?}): {}",
                command,
                self.config.host,
                out.exit_code,
                out.stderr.trim()
            ))
        }
    }
}

impl Access for SshAccess {
    fn exists(&self, path: &Path) -> Result<bool> {
        let out = self.run_remote(&format!("test -e {}", quote_path(path)))?;
        match out.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            other => Err(anyhow!(
                "existence check on {} failed (exit {:?}): {}",
                self.config.host,
                other,
                out.stderr.trim()
            )),
        }
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        self.run_remote_checked(&format!("mkdir -p {}", quote_path(path)))
    }

    fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        let command = format!(
            "mkdir -p {} && cat > {}",
            quote_path(path.parent().unwrap_or_else(|| Path::new("/"))),
            quote_path(path)
        );
        let mut child = Command::new("ssh")
            .args(self.config.ssh_base_args())
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content)?;
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "writing {} on {} failed: {}",
                path.display(),
                self.config.host,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    fn copy(&self, source: &Path, target: &Path) -> Result<()> {
        self.run_remote_checked(&format!(
            "mkdir -p {}",
            quote_path(target.parent().unwrap_or_else(|| Path::new("/")))
        ))?;
        let output = Command::new("scp")
            .args(self.config.scp_base_args())
            .arg(source)
            .arg(format!(
                "{}:{}",
                self.config.user_at_host(),
                target.to_string_lossy()
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "scp {} to {}:{} failed: {}",
                source.display(),
                self.config.host,
                target.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    fn move_item(&self, source: &Path, target: &Path) -> Result<()> {
        self.run_remote_checked(&format!(
            "mv {} {}",
            quote_path(source),
            quote_path(target)
        ))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.run_remote_checked(&format!("rm -rf {}", quote_path(path)))
    }

    fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.run_remote(command)
    }

    fn terminate(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(key: Option<&str>) -> SshConfig {
        SshConfig {
            host: "10.0.0.4".to_string(),
            port: 2222,
            user: "ops".to_string(),
            key_file: key.map(PathBuf::from),
        }
    }

    #[test]
    fn base_args_without_key() {
        let args = config(None).ssh_base_args();
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "2222");
        assert!(!args.contains(&"-i".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("ops@10.0.0.4"));
    }

    #[test]
    fn base_args_with_key() {
        let args = config(Some("/home/ops/.ssh/id_ed25519")).ssh_base_args();
        let idx = args
            .iter()
            .position(|a| a == "-i")
            .expect("key flag present");
        assert_eq!(args[idx + 1], "/home/ops/.ssh/id_ed25519");
    }
}
