//! EdgeVPN Manager CLI
//!
//! Manages edgevpn connection profiles and the processes running them.
//! Can also run as a daemon exposing the same operations over a local
//! REST API.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use edgevpn_manager::daemon::DEFAULT_HTTP_PORT;
use edgevpn_manager::error::{ProcessError, StorageError};
use edgevpn_manager::release::{parse_target, ReleaseFinder};
use edgevpn_manager::supervisor::ProcessStatus;
use edgevpn_manager::tail::LogTail;
use edgevpn_manager::{runtime, DaemonService, ManagerConfig, ManagerContext, ManagerError, Profile};

/// EdgeVPN Manager - profiles and processes for edgevpn
#[derive(Parser, Debug)]
#[command(name = "edgevpn-manager")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// State directory (default: ~/.edgevpn)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Launch and kill the binary directly instead of through pkexec
    #[arg(long, global = true)]
    no_elevation: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List profiles and their state
    List,
    /// Show one profile (token masked)
    Show { name: String },
    /// Create or overwrite a profile
    Add(AddArgs),
    /// Save a profile from a JSON record file
    Import { path: PathBuf },
    /// Print a profile record as JSON
    Export {
        name: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a stopped profile
    Delete { name: String },
    /// Launch the VPN for a profile and wait for its liveness check
    Start { name: String },
    /// Stop the VPN for a profile
    Stop { name: String },
    /// Process state of a profile
    Status { name: String },
    /// Print a profile's process logs
    Logs {
        name: String,
        /// Keep printing new lines until interrupted
        #[arg(short, long)]
        follow: bool,
    },
    /// List the system binary and cached versions
    Versions,
    /// Delete a cached binary version
    RemoveVersion { version: String },
    /// Look up published releases: `owner/name[@version]`
    Releases { target: Option<String> },
    /// Print a fresh network token
    GenerateToken,
    /// Run the REST API daemon
    Daemon {
        /// HTTP port on 127.0.0.1
        #[arg(long, default_value_t = DEFAULT_HTTP_PORT)]
        http_port: u16,
        /// Path to write the auth token file (default: <state-dir>/api-token)
        #[arg(long)]
        token_path: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug)]
struct AddArgs {
    /// Profile name
    name: String,
    /// Address with prefix length, e.g. 10.1.0.5/24
    #[arg(long)]
    ip: String,
    /// Interface name
    #[arg(long, default_value = "edgevpn0")]
    interface: String,
    /// Network token; generated with the binary when omitted
    #[arg(long)]
    token: Option<String>,
    /// Enable the binary's management API on this listen address
    #[arg(long)]
    api_address: Option<String>,
    /// Cached version to run, or "system"
    #[arg(long, default_value = "system")]
    runtime_version: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging; RUST_LOG wins when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), ManagerError> {
    let mut config = ManagerConfig::from_env()?;
    if let Some(dir) = args.state_dir {
        config.state_dir = dir;
    }
    if args.no_elevation {
        config.elevation = None;
    }
    tracing::debug!("State directory: {:?}", config.state_dir);

    let ctx = ManagerContext::new(config);

    match args.command {
        Command::List => list(&ctx),
        Command::Show { name } => show(&ctx, &name),
        Command::Add(add_args) => add(&ctx, add_args).await,
        Command::Import { path } => {
            let profile = ctx.store().import(&path)?;
            println!("Imported '{}'", profile.name);
            Ok(())
        }
        Command::Export { name, output } => {
            let json = ctx.store().export(&name)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json).map_err(|e| StorageError::io(path.clone(), e))?;
                    println!("Exported '{}' to {}", name, path.display());
                }
                None => println!("{}", json),
            }
            Ok(())
        }
        Command::Delete { name } => delete(&ctx, &name),
        Command::Start { name } => start(&ctx, &name).await,
        Command::Stop { name } => {
            let profile = ctx.store().load(&name)?;
            ctx.supervisor().stop(&profile).await?;
            println!("Stopped '{}'", name);
            Ok(())
        }
        Command::Status { name } => status(&ctx, &name),
        Command::Logs { name, follow } => logs(&ctx, &name, follow).await,
        Command::Versions => {
            let config = ctx.config();
            match runtime::find_installed(config) {
                Some(path) => println!("system\t{}", path.display()),
                None => println!("system\t(not installed)"),
            }
            for version in runtime::available_versions(config) {
                println!("{}\t{}", version, runtime::version_path(config, &version).display());
            }
            Ok(())
        }
        Command::RemoveVersion { version } => {
            runtime::remove_version(ctx.config(), &version)?;
            println!("Removed {}", version);
            Ok(())
        }
        Command::Releases { target } => releases(&ctx, target).await,
        Command::GenerateToken => {
            println!("{}", runtime::generate_token(ctx.config()).await?);
            Ok(())
        }
        Command::Daemon {
            http_port,
            token_path,
        } => run_daemon(ctx, http_port, token_path).await,
    }
}

fn list(ctx: &ManagerContext) -> Result<(), ManagerError> {
    let profiles = ctx.store().list()?;
    if profiles.is_empty() {
        println!("No profiles in {}", ctx.config().state_dir.display());
        return Ok(());
    }

    let supervisor = ctx.supervisor();
    println!("{:<20} {:<20} {:<12} {}", "NAME", "IP", "INTERFACE", "STATE");
    for profile in profiles {
        let state = if supervisor.is_alive(&profile) {
            "running"
        } else {
            "stopped"
        };
        println!(
            "{:<20} {:<20} {:<12} {}",
            profile.name, profile.ip, profile.interface, state
        );
    }
    Ok(())
}

fn show(ctx: &ManagerContext, name: &str) -> Result<(), ManagerError> {
    let profile = ctx.store().load(name)?;
    let runtime_version = if profile.runtime_version.is_empty() {
        "system"
    } else {
        profile.runtime_version.as_str()
    };

    println!("Name:      {}", profile.name);
    println!("Token:     {}", profile.masked_token());
    println!("IP:        {}", profile.ip);
    println!("Interface: {}", profile.interface);
    println!("Runtime:   {}", runtime_version);
    if let Some(url) = profile.api_url() {
        println!("API:       {}", url);
    }
    Ok(())
}

async fn add(ctx: &ManagerContext, args: AddArgs) -> Result<(), ManagerError> {
    let token = match args.token {
        Some(token) => token,
        None => {
            tracing::info!("No token given, generating one");
            runtime::generate_token(ctx.config()).await?
        }
    };

    let profile = Profile {
        name: args.name,
        token,
        ip: args.ip,
        api: args.api_address.is_some(),
        api_address: args.api_address.unwrap_or_default(),
        interface: args.interface,
        runtime_version: args.runtime_version,
    };

    let saved = ctx.store().save(&profile)?;
    println!("Saved '{}'", saved.name);
    Ok(())
}

fn delete(ctx: &ManagerContext, name: &str) -> Result<(), ManagerError> {
    let target = Profile {
        name: name.to_string(),
        ..Default::default()
    };
    if ctx.supervisor().is_alive(&target) {
        return Err(ProcessError::AlreadyRunning {
            name: name.to_string(),
        }
        .into());
    }

    ctx.store().delete(name)?;
    println!("Deleted '{}'", name);
    Ok(())
}

async fn start(ctx: &ManagerContext, name: &str) -> Result<(), ManagerError> {
    let profile = ctx.store().load(name)?;
    let started = ctx.supervisor().start_checked(&profile).await?;

    println!("{}", started.message());
    if let Some(url) = profile.api_url() {
        println!("API available at {}", url);
    }
    Ok(())
}

fn status(ctx: &ManagerContext, name: &str) -> Result<(), ManagerError> {
    let profile = ctx.store().load(name)?;
    let info = ctx.supervisor().status(&profile)?;

    match (info.status, info.pid) {
        (ProcessStatus::Running, Some(pid)) => println!("running (pid {})", pid),
        _ => println!("stopped"),
    }
    println!("stdout: {}", info.stdout.display());
    println!("stderr: {}", info.stderr.display());
    Ok(())
}

async fn logs(ctx: &ManagerContext, name: &str, follow: bool) -> Result<(), ManagerError> {
    let profile = ctx.store().load(name)?;
    let state = ctx.supervisor().state_for(&profile)?;

    if !follow {
        for path in [state.stdout_path(), state.stderr_path()] {
            match std::fs::read_to_string(&path) {
                Ok(content) => print!("{}", content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(path, e).into()),
            }
        }
        return Ok(());
    }

    let mut tail = LogTail::for_process(&state, ctx.config().log_poll);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = tail.next_line() => match line {
                Some(line) => println!("{}", line),
                None => break,
            },
            _ = &mut ctrl_c => {
                tail.cancel();
                break;
            }
        }
    }
    Ok(())
}

async fn releases(ctx: &ManagerContext, target: Option<String>) -> Result<(), ManagerError> {
    let config = ctx.config();
    let target = target.unwrap_or_else(|| config.release_repo.clone());
    let (slug, version) = parse_target(&target);
    let finder = ReleaseFinder::from_config(config)?;

    if version.is_empty() {
        let names = finder.find_all(slug).await?;
        if names.is_empty() {
            println!("No releases found for {}", slug);
        }
        for name in names {
            println!("{}", name);
        }
        return Ok(());
    }

    match finder.find(slug, version).await? {
        Some(release) => {
            println!("{}\t{}", release.name, release.asset_name);
            println!("{}", release.download_url);
        }
        None => println!("No release '{}' found for {}", version, slug),
    }
    Ok(())
}

/// Run in daemon mode (REST API service)
async fn run_daemon(
    ctx: ManagerContext,
    port: u16,
    token_path: Option<PathBuf>,
) -> Result<(), ManagerError> {
    tracing::info!("EdgeVPN Manager daemon starting (REST API mode)...");

    let daemon = DaemonService::new(ctx, token_path);

    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => signal.recv().await,
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<Option<()>>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = daemon.run_http(port) => {
            daemon.cleanup().await?;
            result
        }
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down daemon...");
            daemon.cleanup().await
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down daemon...");
            daemon.cleanup().await
        }
    }
}
