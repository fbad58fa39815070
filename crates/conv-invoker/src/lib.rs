//! Invocation engine: drives one unattended provisioning run against a
//! target host. Claims the host in the shared registry, installs the
//! convergence runtime and policy bundle exactly once per instance, then
//! executes the convergence command under the min/max retry policy and
//! streams result artifacts. Cleanup (host deregistration, access
//! teardown) runs on every exit path and never masks the primary error.

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use conv_access::{Access, ExecOutput, LocalAccess, SshAccess, SshConfig};
use conv_core::{
    instance_layout, runtime_config_content, sha256_dir, InstanceLayout, ATTRIBUTE_DELIMITER,
    BUNDLE_METADATA_FILE, DEFAULT_DEPENDENCIES_SUBDIR, DEFAULT_RESULTS_DIR, HOST_INSTALL_MARKER,
    RUNTIME_BIN, RUNTIME_BOOTSTRAP_URL,
};

pub mod prepare;
pub mod registry;
pub mod sink;

pub use prepare::{prepare_dependencies, BundleFetcher, HttpBundleFetcher, PrepareSummary};
pub use registry::HostRegistry;
pub use sink::{JsonlResultSink, MemorySink, ResultArtifact, ResultSink};

#[derive(Debug, Error)]
pub enum InvokerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invoker already running on host '{host}'")]
    Concurrency { host: String },
    #[error("timed out acquiring host registry lock after {waited_ms}ms")]
    LockTimeout { waited_ms: u64 },
    #[error("environment install failed: {message}")]
    Install {
        message: String,
        stdout: String,
        stderr: String,
    },
    #[error("convergence run failed on attempt {attempts}: {message}")]
    Run {
        attempts: u32,
        message: String,
        stdout: String,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn io_other(err: anyhow::Error) -> InvokerError {
    InvokerError::Io(io::Error::other(format!("{:#}", err)))
}

/// `metadata.json` at a policy bundle's root.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, Value>,
}

pub fn read_bundle_metadata(dir: &Path) -> anyhow::Result<Option<BundleMetadata>> {
    let path = dir.join(BUNDLE_METADATA_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)?;
    let metadata = serde_json::from_str(&raw)
        .with_context(|| format!("parsing bundle metadata {}", path.display()))?;
    Ok(Some(metadata))
}

// ---------------------------------------------------------------------------
// Invocation spec (YAML input)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct InvocationSpec {
    pub executable: ExecutableSpec,
    #[serde(default)]
    pub parameters: ParameterSpec,
    #[serde(default)]
    pub invoker: InvokerSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutableSpec {
    /// Policy bundle directory on the invoking machine.
    pub path: PathBuf,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_dependencies_subdir")]
    pub dependencies_subdir: String,
}

fn default_dependencies_subdir() -> String {
    DEFAULT_DEPENDENCIES_SUBDIR.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParameterSpec {
    /// Ordered list of policy entry points. Required.
    #[serde(default)]
    pub run_list: Option<Value>,
    /// Mapped attribute parameters, keys flattened with '/'.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Local,
    Ssh,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvokerSection {
    pub access: AccessKind,
    pub host: String,
    pub min_runs: u32,
    pub max_runs: u32,
    pub instance_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub results_dir: Option<PathBuf>,
    pub lock_wait_ms: u64,
    pub stale_after_ms: u64,
    pub ssh: Option<SshSection>,
}

impl Default for InvokerSection {
    fn default() -> Self {
        Self {
            access: AccessKind::Local,
            host: "localhost".to_string(),
            min_runs: 1,
            max_runs: 3,
            instance_dir: None,
            state_dir: None,
            results_dir: None,
            lock_wait_ms: registry::DEFAULT_LOCK_WAIT.as_millis() as u64,
            stale_after_ms: registry::DEFAULT_STALE_AFTER.as_millis() as u64,
            ssh: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshSection {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

pub fn load_invocation_spec(path: &Path) -> Result<InvocationSpec, InvokerError> {
    let raw = fs::read_to_string(path)?;
    serde_yaml::from_str(&raw).map_err(|err| {
        InvokerError::Config(format!("invalid invocation spec {}: {}", path.display(), err))
    })
}

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

/// Everything one invocation needs, fixed before any target operation.
/// Owned exclusively by that invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub executable: ExecutableSpec,
    pub run_list: Value,
    pub attributes: Map<String, Value>,
    pub host: String,
    pub min_runs: u32,
    pub max_runs: u32,
    pub layout: InstanceLayout,
}

pub fn build_context(spec: &InvocationSpec) -> Result<InvocationContext, InvokerError> {
    let run_list = spec
        .parameters
        .run_list
        .clone()
        .ok_or_else(|| InvokerError::Config("run_list parameter missing".to_string()))?;
    if !spec.executable.path.exists() {
        return Err(InvokerError::Config(format!(
            "executable bundle not found at {}",
            spec.executable.path.display()
        )));
    }
    let invoker = &spec.invoker;
    if invoker.min_runs < 1 {
        return Err(InvokerError::Config("min_runs must be at least 1".to_string()));
    }
    if invoker.min_runs > invoker.max_runs {
        return Err(InvokerError::Config(format!(
            "min_runs ({}) must not exceed max_runs ({})",
            invoker.min_runs, invoker.max_runs
        )));
    }
    if invoker.access == AccessKind::Ssh && invoker.ssh.is_none() {
        return Err(InvokerError::Config(
            "ssh section required when access is 'ssh'".to_string(),
        ));
    }
    let instance_dir = invoker
        .instance_dir
        .clone()
        .unwrap_or_else(|| default_instance_dir(&spec.executable));
    Ok(InvocationContext {
        executable: spec.executable.clone(),
        run_list,
        attributes: spec.parameters.attributes.clone(),
        host: invoker.host.clone(),
        min_runs: invoker.min_runs,
        max_runs: invoker.max_runs,
        layout: instance_layout(&instance_dir),
    })
}

fn default_instance_dir(executable: &ExecutableSpec) -> PathBuf {
    let name = executable
        .name
        .clone()
        .or_else(|| {
            executable
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "instance".to_string());
    PathBuf::from("/tmp/converge").join(name)
}

pub fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".converge"))
        .unwrap_or_else(|| std::env::temp_dir().join("converge"))
}

// ---------------------------------------------------------------------------
// Environment installer
// ---------------------------------------------------------------------------

fn determine_policy_name(executable: &ExecutableSpec) -> Result<String, InvokerError> {
    if let Some(name) = &executable.name {
        return Ok(name.clone());
    }
    let metadata = read_bundle_metadata(&executable.path)
        .map_err(|err| InvokerError::Config(format!("cannot read bundle metadata: {:#}", err)))?;
    metadata
        .and_then(|m| m.name)
        .ok_or_else(|| InvokerError::Config("policy name cannot be determined".to_string()))
}

/// Single idempotent shell sequence: detect the package manager, make sure
/// curl is available, then bootstrap the runtime from the vendor script.
fn runtime_install_command() -> String {
    [
        "if type apt-get > /dev/null; then sudo apt-get -y update && sudo apt-get -y install curl; fi".to_string(),
        "if type yum > /dev/null; then sudo yum -y install curl; fi".to_string(),
        format!("curl -L {} | sudo bash", RUNTIME_BOOTSTRAP_URL),
    ]
    .join(" && ")
}

fn stage_err(step: &str, err: anyhow::Error) -> InvokerError {
    InvokerError::Install {
        message: format!("{}: {:#}", step, err),
        stdout: String::new(),
        stderr: String::new(),
    }
}

/// Make the target able to run the policy bundle: stage the bundle and its
/// dependencies, write the runtime configuration, install the runtime, and
/// drop both idempotency markers. Aborts on the first failed step.
pub fn install_environment(
    ctx: &InvocationContext,
    access: &dyn Access,
) -> Result<(), InvokerError> {
    let policy_name = determine_policy_name(&ctx.executable)?;
    info!(
        policy = %policy_name,
        instance = %ctx.layout.instance_dir.display(),
        "installing convergence environment"
    );

    access
        .mkdir(&ctx.layout.cache_dir)
        .map_err(|e| stage_err("creating runtime cache dir", e))?;
    access
        .mkdir(&ctx.layout.roles_dir)
        .map_err(|e| stage_err("creating role dir", e))?;
    access
        .copy(&ctx.executable.path, &ctx.layout.staging_dir)
        .map_err(|e| stage_err("staging policy bundle", e))?;
    access
        .write_file(
            &ctx.layout.runtime_config,
            runtime_config_content(&ctx.layout).as_bytes(),
        )
        .map_err(|e| stage_err("writing runtime configuration", e))?;

    let staged_deps = ctx
        .layout
        .staging_dir
        .join(&ctx.executable.dependencies_subdir);
    access
        .move_item(&staged_deps, &ctx.layout.policies_dir)
        .map_err(|e| stage_err("placing dependency bundles", e))?;
    access
        .move_item(
            &ctx.layout.staging_dir,
            &ctx.layout.policies_dir.join(&policy_name),
        )
        .map_err(|e| stage_err("placing policy bundle", e))?;
    // Clear whatever a copy-based mover may have left behind.
    access
        .remove(&ctx.layout.staging_dir)
        .map_err(|e| stage_err("removing staging dir", e))?;

    let output = access
        .exec(&runtime_install_command())
        .map_err(|e| stage_err("running runtime install", e))?;
    if !output.success() {
        return Err(InvokerError::Install {
            message: format!(
                "runtime install command exited with {:?}",
                output.exit_code
            ),
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }

    access
        .write_file(Path::new(HOST_INSTALL_MARKER), b"installed")
        .map_err(|e| stage_err("writing host install marker", e))?;
    let digest = sha256_dir(&ctx.executable.path)
        .map_err(|e| stage_err("digesting policy bundle", e))?;
    access
        .write_file(
            &ctx.layout.install_marker,
            format!("installed {}\n", digest).as_bytes(),
        )
        .map_err(|e| stage_err("writing instance install marker", e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

fn compose_run_spec(ctx: &InvocationContext) -> Value {
    let mut spec = conv_core::unflatten(&ctx.attributes, ATTRIBUTE_DELIMITER);
    if let Value::Object(map) = &mut spec {
        map.insert("run_list".to_string(), ctx.run_list.clone());
    }
    spec
}

fn converge_command(layout: &InstanceLayout) -> String {
    format!(
        "sudo {} -c {} -j {}",
        RUNTIME_BIN,
        layout.runtime_config.display(),
        layout.run_spec.display()
    )
}

/// Execute the convergence command under the retry policy: at least
/// `min_runs` attempts, at most `max_runs`, the last attempt's outcome
/// deciding overall success. On terminal success, capture the process
/// snapshot and emit the result artifacts.
pub fn run_converge(
    ctx: &InvocationContext,
    access: &dyn Access,
    sink: &mut dyn ResultSink,
) -> Result<u32, InvokerError> {
    let run_spec = compose_run_spec(ctx);
    let bytes = serde_json::to_vec(&run_spec)
        .map_err(|err| InvokerError::Io(io::Error::other(err.to_string())))?;
    access
        .write_file(&ctx.layout.run_spec, &bytes)
        .map_err(io_other)?;

    let command = converge_command(&ctx.layout);
    let mut runs: u32 = 0;
    let mut success = false;

    while !success && runs < ctx.max_runs {
        runs += 1;
        let output = match access.exec(&command) {
            Ok(output) => output,
            // A command that could not even be spawned counts as a failed
            // attempt, same as a non-zero exit.
            Err(err) => ExecOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("{:#}", err),
            },
        };
        let failed = !output.success();
        info!(
            attempt = runs,
            max_runs = ctx.max_runs,
            ok = !failed,
            exit = ?output.exit_code,
            "convergence attempt finished"
        );
        debug!(
            attempt = runs,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "captured attempt output"
        );

        if (failed && runs < ctx.max_runs) || runs < ctx.min_runs {
            continue;
        } else if failed {
            let message = match output.exit_code {
                Some(code) => format!("convergence command exited with status {}", code),
                None => "convergence command failed to execute".to_string(),
            };
            return Err(InvokerError::Run {
                attempts: runs,
                message,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        } else {
            success = true;
            let snapshot = access.exec("ps aux").map_err(io_other)?;
            if !snapshot.stdout.is_empty() {
                sink.emit(&ResultArtifact::complete(
                    "ps",
                    Value::String(snapshot.stdout.clone()),
                ))
                .map_err(io_other)?;
            }
            if !snapshot.success() {
                return Err(InvokerError::Io(io::Error::other(format!(
                    "process snapshot failed: {}",
                    snapshot.stderr.trim()
                ))));
            }
            sink.emit(&ResultArtifact::complete("run_list", run_spec.clone()))
                .map_err(io_other)?;
            sink.emit(&ResultArtifact::complete("num_of_runs", json!(runs)))
                .map_err(io_other)?;
            sink.flush().map_err(io_other)?;
        }
    }
    Ok(runs)
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub host: String,
    pub attempts: u32,
    pub installed: bool,
}

/// Full invocation sequence against a prepared context. The host is
/// deregistered on every exit path once registration succeeded; cleanup
/// failures are logged and never replace the primary result.
pub fn invoke(
    ctx: &InvocationContext,
    access: &dyn Access,
    registry: &HostRegistry,
    sink: &mut dyn ResultSink,
) -> Result<InvocationOutcome, InvokerError> {
    let result = match registry.register(&ctx.host) {
        Ok(()) => {
            let primary = run_invocation(ctx, access, sink);
            if let Err(err) = registry.deregister(&ctx.host) {
                error!(host = %ctx.host, error = %err, "failed to deregister host during cleanup");
            }
            primary
        }
        Err(err) => Err(err),
    };
    if let Err(err) = access.terminate() {
        warn!(error = %err, "access terminate failed");
    }
    result
}

fn run_invocation(
    ctx: &InvocationContext,
    access: &dyn Access,
    sink: &mut dyn ResultSink,
) -> Result<InvocationOutcome, InvokerError> {
    let installed = match access.exists(&ctx.layout.install_marker) {
        Ok(true) => {
            debug!(
                marker = %ctx.layout.install_marker.display(),
                "instance already installed; skipping environment install"
            );
            false
        }
        Ok(false) => {
            install_environment(ctx, access)?;
            true
        }
        Err(err) => return Err(io_other(err)),
    };
    let attempts = run_converge(ctx, access, sink)?;
    Ok(InvocationOutcome {
        host: ctx.host.clone(),
        attempts,
        installed,
    })
}

/// Convenience wiring for the CLI: build the context, access, registry and
/// sink from the loaded spec, then invoke.
pub fn invoke_spec(spec: &InvocationSpec) -> Result<InvocationOutcome, InvokerError> {
    let ctx = build_context(spec)?;
    let access = build_access(&spec.invoker)?;
    let state_dir = spec
        .invoker
        .state_dir
        .clone()
        .unwrap_or_else(default_state_dir);
    let registry = HostRegistry::with_timing(
        &state_dir,
        Duration::from_millis(spec.invoker.lock_wait_ms),
        Duration::from_millis(spec.invoker.stale_after_ms),
    );
    let results_dir = spec
        .invoker
        .results_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS_DIR));
    let mut sink = JsonlResultSink::new(&results_dir).map_err(io_other)?;
    invoke(&ctx, access.as_ref(), &registry, &mut sink)
}

pub fn build_access(invoker: &InvokerSection) -> Result<Box<dyn Access>, InvokerError> {
    match invoker.access {
        AccessKind::Local => Ok(Box::new(LocalAccess::new())),
        AccessKind::Ssh => {
            let ssh = invoker.ssh.as_ref().ok_or_else(|| {
                InvokerError::Config("ssh section required when access is 'ssh'".to_string())
            })?;
            Ok(Box::new(SshAccess::new(SshConfig {
                host: ssh.host.clone(),
                port: ssh.port,
                user: ssh.user.clone(),
                key_file: ssh.key_file.clone(),
            })))
        }
    }
}
