use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use conv_invoker::prepare::DEFAULT_BUNDLE_REGISTRY_URL;
use conv_invoker::{
    default_state_dir, invoke_spec, load_invocation_spec, prepare_dependencies, HostRegistry,
    HttpBundleFetcher, InvokerError,
};

#[derive(Parser)]
#[command(
    name = "converge",
    version,
    about = "Unattended provisioning through a configuration-convergence runtime"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one invocation described by a YAML spec file.
    Invoke {
        spec: PathBuf,
        /// Override the target host identifier from the spec.
        #[arg(long)]
        host: Option<String>,
        /// Override the instance working directory from the spec.
        #[arg(long)]
        instance_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Resolve a policy bundle's dependency closure before invocation.
    Prepare {
        bundle: PathBuf,
        #[arg(long)]
        registry_url: Option<String>,
        #[arg(long)]
        deps_subdir: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show hosts with an active invocation.
    Status {
        #[arg(long)]
        state_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => emit_json(&payload),
        Ok(None) => {}
        Err(err) => {
            let code = exit_code(&err);
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string()));
            } else {
                eprintln!("error: {:#}", err);
                print_captured_output(&err);
            }
            std::process::exit(code);
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("CONVERGE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Invoke { json, .. }
        | Commands::Prepare { json, .. }
        | Commands::Status { json, .. } => *json,
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Invoke {
            spec,
            host,
            instance_dir,
            json,
        } => {
            let mut spec = load_invocation_spec(&spec)?;
            if let Some(host) = host {
                spec.invoker.host = host;
            }
            if let Some(instance_dir) = instance_dir {
                spec.invoker.instance_dir = Some(instance_dir);
            }
            let outcome = invoke_spec(&spec)?;
            if json {
                Ok(Some(json!({
                    "ok": true,
                    "host": outcome.host,
                    "num_of_runs": outcome.attempts,
                    "installed": outcome.installed,
                })))
            } else {
                println!(
                    "converged {} after {} run(s){}",
                    outcome.host,
                    outcome.attempts,
                    if outcome.installed {
                        " (environment installed)"
                    } else {
                        ""
                    }
                );
                Ok(None)
            }
        }
        Commands::Prepare {
            bundle,
            registry_url,
            deps_subdir,
            json,
        } => {
            let url = registry_url.unwrap_or_else(|| DEFAULT_BUNDLE_REGISTRY_URL.to_string());
            let deps_subdir =
                deps_subdir.unwrap_or_else(|| conv_core::DEFAULT_DEPENDENCIES_SUBDIR.to_string());
            let fetcher = HttpBundleFetcher::new(&url)?;
            let summary = prepare_dependencies(&bundle, &deps_subdir, &fetcher)?;
            if json {
                Ok(Some(json!({
                    "ok": true,
                    "fetched": summary.fetched,
                    "skipped": summary.skipped,
                })))
            } else {
                println!(
                    "prepared {} dependency bundle(s), {} already present",
                    summary.fetched.len(),
                    summary.skipped.len()
                );
                Ok(None)
            }
        }
        Commands::Status { state_dir, json } => {
            let state_dir = state_dir.unwrap_or_else(default_state_dir);
            let hosts = HostRegistry::new(&state_dir).hosts()?;
            if json {
                Ok(Some(json!({ "ok": true, "hosts": hosts })))
            } else {
                print!("{}", render_status(&hosts));
                Ok(None)
            }
        }
    }
}

fn render_status(hosts: &BTreeMap<String, String>) -> String {
    if hosts.is_empty() {
        return "no active invocations\n".to_string();
    }
    let mut out = String::new();
    for (host, state) in hosts {
        out.push_str(&format!("{}\t{}\n", host, state));
    }
    out
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": { "code": code, "message": message }
    })
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<InvokerError>() {
        Some(InvokerError::Config(_)) => 2,
        Some(InvokerError::Concurrency { .. }) | Some(InvokerError::LockTimeout { .. }) => 3,
        Some(InvokerError::Install { .. }) => 4,
        Some(InvokerError::Run { .. }) => 5,
        _ => 1,
    }
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<InvokerError>() {
        Some(InvokerError::Config(_)) => "config_error",
        Some(InvokerError::Concurrency { .. }) => "concurrency_error",
        Some(InvokerError::LockTimeout { .. }) => "lock_timeout",
        Some(InvokerError::Install { .. }) => "install_error",
        Some(InvokerError::Run { .. }) => "run_error",
        Some(InvokerError::Io(_)) => "io_error",
        None => "command_failed",
    }
}

fn print_captured_output(err: &anyhow::Error) {
    if let Some(InvokerError::Install { stdout, stderr, .. })
    | Some(InvokerError::Run { stdout, stderr, .. }) = err.downcast_ref::<InvokerError>()
    {
        if !stdout.is_empty() {
            eprintln!("--- captured stdout ---\n{}", stdout.trim_end());
        }
        if !stderr.is_empty() {
            eprintln!("--- captured stderr ---\n{}", stderr.trim_end());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_the_error_taxonomy() {
        let config: anyhow::Error = InvokerError::Config("x".to_string()).into();
        let busy: anyhow::Error = InvokerError::Concurrency {
            host: "h1".to_string(),
        }
        .into();
        let run: anyhow::Error = InvokerError::Run {
            attempts: 3,
            message: "m".to_string(),
            stdout: String::new(),
            stderr: String::new(),
        }
        .into();
        let other = anyhow::anyhow!("unrelated");
        assert_eq!(exit_code(&config), 2);
        assert_eq!(exit_code(&busy), 3);
        assert_eq!(exit_code(&run), 5);
        assert_eq!(exit_code(&other), 1);
        assert_eq!(error_code(&busy), "concurrency_error");
        assert_eq!(error_code(&other), "command_failed");
    }

    #[test]
    fn status_rendering() {
        assert_eq!(render_status(&BTreeMap::new()), "no active invocations\n");
        let mut hosts = BTreeMap::new();
        hosts.insert("h1".to_string(), "running".to_string());
        assert_eq!(render_status(&hosts), "h1\trunning\n");
    }
}
