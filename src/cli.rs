//! Command-line interface definitions using clap.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::{DEFAULT_SEVERITY, LogFormat};
use crate::paths;

/// Mining-pool process supervisor and control plane.
#[derive(Parser, Debug)]
#[command(name = "ckpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: <NAME>.conf).
    #[arg(short, long, env = "CKPOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Group that owns the unix sockets.
    #[arg(short, long)]
    pub group: Option<String>,

    /// Take over the listening socket of a running instance (implies --killold).
    #[arg(short = 'H', long)]
    pub handover: bool,

    /// Kill a previous instance still holding the pid files.
    #[arg(short, long)]
    pub killold: bool,

    /// Log severity, 0 (emergency) to 7 (debug).
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=7))]
    pub loglevel: Option<u8>,

    /// Instance name, used for the default socket directory and config file.
    #[arg(short, long, default_value = "ckpool")]
    pub name: String,

    /// Directory holding the unix sockets and pid files (default: /tmp/<NAME>).
    #[arg(short, long, env = "CKPOOL_SOCKDIR")]
    pub sockdir: Option<PathBuf>,

    /// Run without the external database logger.
    #[arg(short = 'A', long)]
    pub standalone: bool,

    /// Name of the database logger instance.
    #[arg(short = 'd', long, default_value = "ckdb")]
    pub ckdb_name: String,

    /// Socket directory of the database logger (default: /opt/<CKDB_NAME>).
    #[arg(short = 'S', long)]
    pub ckdb_sockdir: Option<PathBuf>,

    /// Log line format: pretty, compact or json.
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Run as one of the pool's worker processes.
    #[arg(long, hide = true)]
    pub internal_role: Option<String>,

    /// Inherited listening descriptor for the connector.
    #[arg(long, hide = true, requires = "internal_role")]
    pub listen_fd: Option<i32>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one control message to a running instance and print any reply.
    Ctl(CtlArgs),
}

/// Arguments for the ctl command.
#[derive(Parser, Debug)]
pub struct CtlArgs {
    /// Message such as ping, loglevel=7, restart or shutdown.
    pub message: String,
}

impl Cli {
    pub fn socket_dir(&self) -> PathBuf {
        self.sockdir
            .clone()
            .unwrap_or_else(|| paths::default_socket_dir(&self.name))
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| paths::default_config_path(&self.name))
    }

    pub fn ckdb_sockdir(&self) -> PathBuf {
        self.ckdb_sockdir
            .clone()
            .unwrap_or_else(|| paths::default_ckdb_sockdir(&self.ckdb_name))
    }

    /// Handover always replaces the previous instance.
    pub fn killold(&self) -> bool {
        self.killold || self.handover
    }

    pub fn severity(&self) -> u8 {
        self.loglevel.unwrap_or(DEFAULT_SEVERITY)
    }

    /// Flags every worker process is started with, ahead of `--internal-role`.
    pub fn role_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--config".into(),
            self.config_path().into(),
            "--name".into(),
            self.name.clone().into(),
            "--sockdir".into(),
            self.socket_dir().into(),
            "--loglevel".into(),
            self.severity().to_string().into(),
        ];
        if let Some(format) = self.log_format {
            args.push("--log-format".into());
            args.push(format.to_string().into());
        }
        if self.killold() {
            args.push("--killold".into());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["ckpool"]).unwrap();
        assert_eq!(cli.name, "ckpool");
        assert_eq!(cli.socket_dir(), PathBuf::from("/tmp/ckpool"));
        assert_eq!(cli.config_path(), PathBuf::from("ckpool.conf"));
        assert_eq!(cli.ckdb_sockdir(), PathBuf::from("/opt/ckdb"));
        assert_eq!(cli.severity(), DEFAULT_SEVERITY);
        assert!(!cli.killold());
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_short_flags() {
        let cli = Cli::try_parse_from([
            "ckpool", "-n", "pool2", "-s", "/run/pool2", "-l", "7", "-H", "-A", "-g", "pool",
        ])
        .unwrap();
        assert_eq!(cli.name, "pool2");
        assert_eq!(cli.socket_dir(), PathBuf::from("/run/pool2"));
        assert_eq!(cli.config_path(), PathBuf::from("pool2.conf"));
        assert_eq!(cli.severity(), 7);
        assert!(cli.handover);
        assert!(cli.killold());
        assert!(cli.standalone);
        assert_eq!(cli.group.as_deref(), Some("pool"));
    }

    #[test]
    fn test_loglevel_range() {
        assert!(Cli::try_parse_from(["ckpool", "-l", "8"]).is_err());
        assert!(Cli::try_parse_from(["ckpool", "--loglevel", "0"]).is_ok());
    }

    #[test]
    fn test_ctl_command() {
        let cli = Cli::try_parse_from(["ckpool", "-s", "/tmp/x", "ctl", "loglevel=6"]).unwrap();
        match cli.command {
            Some(Commands::Ctl(args)) => assert_eq!(args.message, "loglevel=6"),
            _ => panic!("Expected Ctl command"),
        }
    }

    #[test]
    fn test_listen_fd_requires_role() {
        assert!(Cli::try_parse_from(["ckpool", "--listen-fd", "5"]).is_err());
        let cli = Cli::try_parse_from([
            "ckpool",
            "--internal-role",
            "connector",
            "--listen-fd",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.listen_fd, Some(5));
    }

    #[test]
    fn test_role_args_reparse() {
        let cli = Cli::try_parse_from(["ckpool", "-n", "p", "-s", "/tmp/p", "-l", "6", "-H"]).unwrap();
        let mut argv: Vec<OsString> = vec!["ckpool".into()];
        argv.extend(cli.role_args());
        argv.push("--internal-role".into());
        argv.push("stratifier".into());

        let child = Cli::try_parse_from(argv).unwrap();
        assert_eq!(child.name, "p");
        assert_eq!(child.socket_dir(), PathBuf::from("/tmp/p"));
        assert_eq!(child.config_path(), PathBuf::from("p.conf"));
        assert_eq!(child.severity(), 6);
        assert!(child.killold());
        assert_eq!(child.internal_role.as_deref(), Some("stratifier"));
    }
}
