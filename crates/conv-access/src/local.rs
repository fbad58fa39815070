use anyhow::{anyhow, Result};
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use walkdir::WalkDir;

use crate::{Access, ExecOutput};

/// Access to the invoking machine itself. File operations go through
/// `std::fs`; commands run under `sh -c` with captured output.
#[derive(Debug, Default)]
pub struct LocalAccess;

impl LocalAccess {
    pub fn new() -> Self {
        Self
    }
}

impl Access for LocalAccess {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn copy(&self, source: &Path, target: &Path) -> Result<()> {
        if source.is_dir() {
            copy_dir(source, target)
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source, target)?;
            Ok(())
        }
    }

    fn move_item(&self, source: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(source, target) {
            Ok(()) => Ok(()),
            // Cross-device moves fall back to copy-then-remove.
            Err(_) => {
                self.copy(source, target)?;
                self.remove(source)
            }
        }
    }

    fn remove(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn exec(&self, command: &str) -> Result<ExecOutput> {
        let output = Command::new("sh")
            .arg("-c")
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

    fn terminate(&self) -> Result<()> {
        Ok(())
    }
}

fn copy_dir(source: &Path, target: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| anyhow!("walk escaped source dir {}", source.display()))?;
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "converge_access_{}_{}_{}",
            label,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn exec_captures_stdout_and_exit_code() {
        let access = LocalAccess::new();
        let out = access.exec("echo hello && exit 0").expect("exec");
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");

        let failed = access.exec("echo oops >&2; exit 3").expect("exec");
        assert!(!failed.success());
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.stderr.trim(), "oops");
    }

    #[test]
    fn copy_replicates_a_directory_tree() {
        let root = temp_root("copy");
        let src = root.join("src");
        fs::create_dir_all(src.join("nested")).expect("src tree");
        fs::write(src.join("top.txt"), b"top").expect("write top");
        fs::write(src.join("nested").join("deep.txt"), b"deep").expect("write deep");

        let access = LocalAccess::new();
        let dst = root.join("dst");
        access.copy(&src, &dst).expect("copy dir");
        assert_eq!(fs::read(dst.join("top.txt")).expect("read top"), b"top");
        assert_eq!(
            fs::read(dst.join("nested").join("deep.txt")).expect("read deep"),
            b"deep"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn move_then_remove_round_trip() {
        let root = temp_root("move");
        fs::create_dir_all(&root).expect("root");
        let a = root.join("a.txt");
        let b = root.join("sub").join("b.txt");
        fs::write(&a, b"payload").expect("write");

        let access = LocalAccess::new();
        access.move_item(&a, &b).expect("move");
        assert!(!a.exists());
        assert!(access.exists(&b).expect("exists"));

        access.remove(&b).expect("remove");
        assert!(!b.exists());
        // Removing an absent path is a no-op.
        access.remove(&b).expect("remove again");
        let _ = fs::remove_dir_all(root);
    }
}
