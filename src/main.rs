//! ckpool - mining-pool process supervisor

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nix::unistd::{Gid, Group};
use owo_colors::{OwoColorize, Stream::Stderr};

use ckpool::cli::{Cli, Commands, CtlArgs};
use ckpool::config::PoolConfig;
use ckpool::ipc::unix::ckdb_msg_call;
use ckpool::logging::{self, LogConfig};
use ckpool::roles::{self, Role, RoleContext};
use ckpool::supervisor::process::LaunchSpec;
use ckpool::supervisor::{self, ShutdownReason, Supervisor, SupervisorOptions, handover, signals};
use ckpool::{PoolError, paths, pidfile};

const LOG_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Program entry point: parses CLI arguments, runs the selected mode, and
/// prints a colored error chain before exiting 1 on failure.
fn main() {
    let cli = Cli::parse();

    let result = if let Some(role) = cli.internal_role.as_deref() {
        cmd_role(&cli, role)
    } else {
        match &cli.command {
            Some(Commands::Ctl(args)) => cmd_ctl(&cli, args),
            None => cmd_pool(&cli),
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            logging::flush(LOG_FLUSH_TIMEOUT);
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli, config: &PoolConfig) -> Result<()> {
    let mut log = LogConfig::new()
        .with_severity(cli.severity())
        .with_file(paths::log_file_path(&config.logdir, &cli.name));
    if let Some(format) = cli.log_format {
        log = log.with_format(format);
    }
    logging::init(&log.with_env_overrides()).context("Failed to initialise logging")
}

/// Load the config file with warnings going to stderr, before the log file exists.
fn load_config(path: &Path) -> PoolConfig {
    let console = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::with_default(console, || PoolConfig::load_or_default(path))
}

fn lookup_group(name: &str) -> Result<Gid> {
    let group = Group::from_name(name)
        .with_context(|| format!("Failed to look up group {name}"))?
        .ok_or_else(|| PoolError::UnknownGroup(name.to_string()))?;
    Ok(group.gid)
}

/// Worker mode: the parent re-executed us with `--internal-role`.
fn cmd_role(cli: &Cli, role: &str) -> Result<i32> {
    let role: Role = role.parse()?;
    let config = PoolConfig::load_or_default(cli.config_path());
    init_logging(cli, &config)?;

    // SAFETY: the parent left this descriptor open across exec for this
    // process alone and passed its number for us to own.
    let listen_fd = cli.listen_fd.map(|raw| unsafe { OwnedFd::from_raw_fd(raw) });

    let ctx = RoleContext {
        socket_dir: cli.socket_dir(),
        config,
        killold: cli.killold(),
        listen_fd,
    };
    let code = roles::run_role(role, ctx);
    logging::flush(LOG_FLUSH_TIMEOUT);
    Ok(code)
}

/// Admin client for a running instance.
fn cmd_ctl(cli: &Cli, args: &CtlArgs) -> Result<i32> {
    let socket_dir = cli.socket_dir();
    if args.message == "ping" {
        if supervisor::ping_main(&socket_dir) {
            println!("pong");
            return Ok(0);
        }
        eprintln!(
            "{} is not responding on {}",
            cli.name,
            paths::listener_path(&socket_dir).display()
        );
        return Ok(1);
    }
    let reply = supervisor::control(&socket_dir, &args.message)
        .with_context(|| format!("Failed to send '{}' to {}", args.message, cli.name))?;
    if let Some(reply) = reply {
        println!("{reply}");
    }
    Ok(0)
}

/// Parent mode: set up, launch the roles and supervise until shutdown.
fn cmd_pool(cli: &Cli) -> Result<i32> {
    let gid = cli.group.as_deref().map(lookup_group).transpose()?;

    let socket_dir = cli.socket_dir();
    paths::ensure_dir(&socket_dir)
        .with_context(|| format!("Failed to create socket directory {}", socket_dir.display()))?;
    let ckdb_path = if cli.standalone {
        None
    } else {
        let ckdb_dir = cli.ckdb_sockdir();
        paths::ensure_dir(&ckdb_dir).with_context(|| {
            format!("Failed to create ckdb socket directory {}", ckdb_dir.display())
        })?;
        Some(paths::listener_path(&ckdb_dir))
    };

    let config = load_config(&cli.config_path());
    config
        .create_log_dirs()
        .with_context(|| format!("Failed to create log directory {}", config.logdir.display()))?;
    init_logging(cli, &config)?;
    tracing::warn!(name = %cli.name, pid = std::process::id(), "ckpool starting");

    if let Some(path) = &ckdb_path {
        match ckdb_msg_call(path, "ping") {
            Ok(reply) => tracing::info!(path = %path.display(), reply = %reply, "ckdb reachable"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "ckdb not responding"),
        }
    }

    let inherited = if cli.handover {
        handover::take_over(&socket_dir)
    } else {
        None
    };

    pidfile::write_pid(
        paths::pid_path(&socket_dir, paths::MAIN_PROCNAME),
        std::process::id() as i32,
        cli.killold(),
    )?;

    let exe = std::env::current_exe().context("Failed to find own executable")?;
    let mut options = SupervisorOptions::new(&cli.name, &socket_dir)
        .with_gid(gid)
        .with_restart_args(std::env::args_os().collect(), cli.handover);
    for role in Role::ALL {
        let mut launch = LaunchSpec::new(&exe)
            .args(cli.role_args())
            .arg("--internal-role")
            .arg(role.as_str());
        if role == Role::Connector
            && let Some(fd) = &inherited
        {
            launch = launch
                .arg("--listen-fd")
                .arg(fd.as_raw_fd().to_string())
                .with_inherited_fd(fd.as_raw_fd());
        }
        options = options.with_role(role.as_str(), launch);
    }

    let sup = Supervisor::new(options);
    signals::spawn_parent_handler(Arc::clone(&sup))?;
    if let Err(e) = sup.start() {
        tracing::error!(error = %e, "Failed to start pool");
        sup.teardown();
        return Err(e.into());
    }

    let reason = sup.run();
    // Keep the inherited socket open until every connector is gone.
    drop(inherited);
    tracing::warn!(name = %cli.name, %reason, "ckpool exiting");
    logging::flush(LOG_FLUSH_TIMEOUT);
    Ok(exit_code(reason))
}

fn exit_code(reason: ShutdownReason) -> i32 {
    match reason {
        ShutdownReason::ControlCommand | ShutdownReason::Signal(_) => 0,
        ShutdownReason::Watchdog
        | ShutdownReason::SendFailure
        | ShutdownReason::ListenerFailure => 1,
    }
}
