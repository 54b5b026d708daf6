//! redeploy - replace the running container of an image
//!
//! Stops every running container of the image, prunes stopped containers,
//! pulls the image and starts one fresh container with the given mappings.
//!
//! ## Usage
//!
//! ```sh
//! redeploy nginx --name web --port 8080:80 --volume /srv/www:/usr/share/nginx/html:ro
//! redeploy --file web.yaml --config settings.yaml
//! ```
//!
//! ## Exit Codes
//!
//! - `0`: container running
//! - `1`: reconciliation failed
//! - `2`: invalid arguments, descriptor or settings

use redeploy::{ContainerRequest, Error, ReconcileResult, Reconciler, Settings, runtimes};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const EXIT_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 2;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Default)]
struct Invocation {
    image: Option<String>,
    name: Option<String>,
    protocol: Option<String>,
    ports: Vec<String>,
    volumes: Vec<String>,
    env: Vec<String>,
    clean_volumes: bool,
    file: Option<PathBuf>,
    config: Option<PathBuf>,
    docker_host: Option<String>,
    /// `key=value` arguments that are not understood.
    ignored: Vec<String>,
}

#[derive(Debug)]
enum Command {
    Reconcile(Box<Invocation>),
    Version,
    Help,
}

/// Returns true for a long option or one of the recognized short options.
fn is_flag(arg: &str) -> bool {
    arg.starts_with("--") || matches!(arg, "-f" | "-c" | "-h" | "-V")
}

/// Collects values after a multi-value flag up to the next flag.
fn take_values(args: &[String], i: &mut usize, flag: &str) -> Result<Vec<String>, String> {
    let mut values = Vec::new();
    while *i < args.len() && !is_flag(&args[*i]) {
        values.push(args[*i].clone());
        *i += 1;
    }
    if values.is_empty() {
        return Err(format!("{} requires at least one value", flag));
    }
    Ok(values)
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    let value = args
        .get(*i)
        .filter(|v| !is_flag(v))
        .cloned()
        .ok_or_else(|| format!("{} requires a value", flag))?;
    *i += 1;
    Ok(value)
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    if args.is_empty() {
        return Ok(Command::Help);
    }

    let mut inv = Invocation::default();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        i += 1;
        match arg {
            "--help" | "-h" | "help" => return Ok(Command::Help),
            "--version" | "-V" | "version" => return Ok(Command::Version),
            "--name" => inv.name = Some(take_value(args, &mut i, arg)?),
            "--protocol" => inv.protocol = Some(take_value(args, &mut i, arg)?),
            "--port" => inv.ports.extend(take_values(args, &mut i, arg)?),
            "--volume" => inv.volumes.extend(take_values(args, &mut i, arg)?),
            "--env" | "--environment" => inv.env.extend(take_values(args, &mut i, arg)?),
            "--clean-volumes" | "--clean_host_volume_dirs" => inv.clean_volumes = true,
            "--file" | "-f" => inv.file = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--config" | "-c" => inv.config = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--docker-host" => inv.docker_host = Some(take_value(args, &mut i, arg)?),
            flag if flag.starts_with('-') => return Err(format!("unknown option: {}", flag)),
            extra if extra.contains('=') => inv.ignored.push(extra.to_string()),
            image => {
                if inv.image.is_some() {
                    return Err(format!("unexpected argument: {}", image));
                }
                inv.image = Some(image.to_string());
            }
        }
    }

    if inv.image.is_none() && inv.file.is_none() {
        return Err("an image or --file is required".to_string());
    }

    Ok(Command::Reconcile(Box::new(inv)))
}

/// Merges a descriptor file (if any) with command-line values.
///
/// Scalars given on the command line override the descriptor; lists are
/// appended, so a mapping given in both places is reported as a duplicate.
fn build_request(inv: &Invocation) -> redeploy::Result<ContainerRequest> {
    let mut request = match &inv.file {
        Some(path) => ContainerRequest::from_yaml(&std::fs::read(path)?)?,
        None => ContainerRequest::default(),
    };

    if let Some(image) = &inv.image {
        request.image = image.clone();
    }
    if inv.name.is_some() {
        request.name = inv.name.clone();
    }
    if inv.protocol.is_some() {
        request.protocol = inv.protocol.clone();
    }
    request.ports.extend(inv.ports.iter().cloned());
    request.volumes.extend(inv.volumes.iter().cloned());
    request.env.extend(inv.env.iter().cloned());
    request.clean_volumes |= inv.clean_volumes;

    Ok(request)
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_reconcile(inv: Invocation) -> ExitCode {
    for extra in &inv.ignored {
        warn!("Ignoring unsupported argument: {}", extra);
    }

    let mut settings = match &inv.config {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(e) => return usage_error(&e),
        },
        None => Settings::default(),
    };
    if inv.docker_host.is_some() {
        settings.runtime.host = inv.docker_host.clone();
    }

    let spec = match build_request(&inv).and_then(|r| r.normalize().map_err(Error::from)) {
        Ok(spec) => spec,
        Err(e) => return usage_error(&e),
    };

    let runtime = match runtimes::connect_default(settings.runtime) {
        Ok(runtime) => runtime,
        Err(e @ Error::Config(_)) => return usage_error(&e),
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_FAILED);
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current step");
            on_signal.cancel();
        }
    });

    let reconciler = Reconciler::new(runtime, settings.reconcile);
    let result = reconciler.reconcile_with_cancel(&spec, &cancel).await;
    report(&result)
}

fn report(result: &ReconcileResult) -> ExitCode {
    for failure in &result.errors {
        eprintln!("{}", failure);
    }

    match &result.container_id {
        Some(id) if result.is_done() => {
            info!("Reconciled ({:?})", result.action);
            println!("{}", id);
            ExitCode::SUCCESS
        }
        _ => ExitCode::from(EXIT_FAILED),
    }
}

fn usage_error(e: &Error) -> ExitCode {
    eprintln!("error: {}", e);
    ExitCode::from(EXIT_USAGE)
}

fn cmd_version() {
    println!("redeploy version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"redeploy - stop, prune, pull and re-run a container image

USAGE:
    redeploy <image> [options]
    redeploy --file <descriptor.yaml> [options]

OPTIONS:
    --name <name>              Container name
    --protocol <tcp|udp>       Default port protocol (default: tcp)
    --port <h:c[/proto]>...    Port mappings
    --volume <h:c[:ro|rw]>...  Volume mappings
    --env <NAME=value>...      Environment variables
    --clean-volumes            Require every host volume directory to exist
    --file, -f <path>          Desired-state descriptor (YAML or JSON)
    --config, -c <path>        Settings file (YAML)
    --docker-host <url>        Daemon address (unix://, tcp://, http://)
    --help, -h                 Show this help
    --version, -V              Show version info

ENVIRONMENT:
    RUST_LOG                   Log filter (default: redeploy=info)
    DOCKER_HOST                Daemon address when --docker-host is unset

EXAMPLES:
    redeploy nginx --port 8080:80
    redeploy postgres:16 --name db --volume /srv/pg:/var/lib/postgresql/data \
        --env POSTGRES_PASSWORD=secret --clean-volumes
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "redeploy=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args) {
        Ok(Command::Reconcile(inv)) => cmd_reconcile(*inv).await,
        Ok(Command::Version) => {
            cmd_version();
            ExitCode::SUCCESS
        }
        Ok(Command::Help) => {
            cmd_help();
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            ExitCode::from(EXIT_USAGE)
        }
    }
}
