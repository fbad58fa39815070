//! Scripted access double for exercising the invoker without a real target.

use anyhow::{anyhow, Result};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{Access, ExecOutput};

#[derive(Default)]
struct ScriptedState {
    ops: Vec<String>,
    existing: HashSet<PathBuf>,
    exec_results: VecDeque<ExecOutput>,
    fail_ops: HashSet<String>,
}

/// Records every operation in order and replays scripted [`ExecOutput`]s
/// for `exec` calls (defaulting to success once the script is drained).
/// Individual operation kinds can be made to fail via [`fail_on`].
///
/// [`fail_on`]: ScriptedAccess::fail_on
#[derive(Default)]
pub struct ScriptedAccess {
    state: Mutex<ScriptedState>,
}

impl ScriptedAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a target path as already existing.
    pub fn preset_exists(&self, path: &Path) {
        let mut state = self.state.lock().expect("scripted access poisoned");
        state.existing.insert(path.to_path_buf());
    }

    /// Queue the outcome for the next unscripted `exec` call.
    pub fn push_exec(&self, output: ExecOutput) {
        let mut state = self.state.lock().expect("scripted access poisoned");
        state.exec_results.push_back(output);
    }

    /// Make every future call of the named operation kind (`"mkdir"`,
    /// `"copy"`, ...) return an error.
    pub fn fail_on(&self, op: &str) {
        let mut state = self.state.lock().expect("scripted access poisoned");
        state.fail_ops.insert(op.to_string());
    }

    /// All recorded operations, in call order.
    pub fn ops(&self) -> Vec<String> {
        let state = self.state.lock().expect("scripted access poisoned");
        state.ops.clone()
    }

    /// Just the commands passed to `exec`, in call order.
    pub fn exec_commands(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| op.strip_prefix("exec ").map(str::to_string))
            .collect()
    }

    fn record(&self, op: String, kind: &str) -> Result<()> {
        let mut state = self.state.lock().expect("scripted access poisoned");
        state.ops.push(op.clone());
        if state.fail_ops.contains(kind) {
            return Err(anyhow!("scripted failure for {}", op));
        }
        Ok(())
    }
}

impl Access for ScriptedAccess {
    fn exists(&self, path: &Path) -> Result<bool> {
        self.record(format!("exists {}", path.display()), "exists")?;
        let state = self.state.lock().expect("scripted access poisoned");
        Ok(state.existing.contains(path))
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        self.record(format!("mkdir {}", path.display()), "mkdir")?;
        let mut state = self.state.lock().expect("scripted access poisoned");
        state.existing.insert(path.to_path_buf());
        Ok(())
    }

    fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.record(
            format!("write_file {} ({} bytes)", path.display(), content.len()),
            "write_file",
        )?;
        let mut state = self.state.lock().expect("scripted access poisoned");
        state.existing.insert(path.to_path_buf());
        Ok(())
    }

    fn copy(&self, source: &Path, target: &Path) -> Result<()> {
        self.record(
            format!("copy {} -> {}", source.display(), target.display()),
            "copy",
        )?;
        let mut state = self.state.lock().expect("scripted access poisoned");
        state.existing.insert(target.to_path_buf());
        Ok(())
    }

    fn move_item(&self, source: &Path, target: &Path) -> Result<()> {
        self.record(
            format!("move {} -> {}", source.display(), target.display()),
            "move",
        )?;
        let mut state = self.state.lock().expect("scripted access poisoned");
        state.existing.remove(source);
        state.existing.insert(target.to_path_buf());
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.record(format!("remove {}", path.display()), "remove")?;
        let mut state = self.state.lock().expect("scripted access poisoned");
        state.existing.remove(path);
        Ok(())
    }

    fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.record(format!("exec {}", command), "exec")?;
        let mut state = self.state.lock().expect("scripted access poisoned");
        Ok(state.exec_results.pop_front().unwrap_or_else(ExecOutput::ok))
    }

    fn terminate(&self) -> Result<()> {
        self.record("terminate".to_string(), "terminate")
    }
}
