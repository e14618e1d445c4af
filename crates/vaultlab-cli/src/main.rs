//! `vault-lab-ctl`: run disposable local Vault (and Consul) labs.
//!
//! Parses flags, resolves the lab configuration (flags, then the persisted
//! file, then interactive prompts), takes the lab lock for mutating
//! commands, and renders results. All lab behavior lives in
//! `vaultlab-core`.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod logging;
mod prompt;
mod style;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, warn};
use vaultlab_core::backup::{AssumeYes, BackupEntry, Confirm};
use vaultlab_core::config::{BackendType, ClusterMode, LabConfig, LabContext};
use vaultlab_core::lifecycle::{AccessInfo, Lab, LabState, LabStatus, Started};
use vaultlab_core::lock::LabLock;
use vaultlab_core::paths::LabPaths;
use vaultlab_core::version::VersionSpec;

use crate::prompt::TerminalConfirm;
use crate::style::{BOLD, CYAN, DIM, GREEN, RED, RESET, WHITE, YELLOW, c};

// ── CLI structure ────────────────────────────────────────────────────

/// vault-lab-ctl: disposable local Vault labs.
#[derive(Parser)]
#[command(
    name = "vault-lab-ctl",
    version,
    about = "vault-lab-ctl: start, stop, reset, back up and restore local Vault labs",
    long_about = None,
    after_help = "Environment variables:\n  \
         VAULT_LAB_HOME          Lab base directory (default: ./vault-lab)\n  \
         VAULT_LAB_BACKEND       Storage backend: file | consul\n  \
         VAULT_LAB_CLUSTER       Cluster mode: single | multi\n  \
         VAULT_VERSION           Vault version to provision (default: latest)\n  \
         CONSUL_VERSION          Consul version to provision (default: latest)\n  \
         VAULT_LAB_NO_FALLBACK   Fail instead of reusing a local binary when download fails\n  \
         NO_COLOR                Disable colored output\n\n\
         Examples:\n  \
         vault-lab-ctl start\n  \
         vault-lab-ctl --backend consul --cluster multi --tls reset\n  \
         vault-lab-ctl backup before-upgrade \"pre 1.16 upgrade\"\n  \
         vault-lab-ctl restore before-upgrade"
)]
struct Cli {
    /// Wipe lab data before starting.
    #[arg(short = 'c', long, global = true)]
    clean: bool,

    /// Debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    /// Storage backend.
    #[arg(long, global = true, env = "VAULT_LAB_BACKEND")]
    backend: Option<BackendType>,

    /// Single node or a three-node HA cluster (forces consul).
    #[arg(long, global = true, env = "VAULT_LAB_CLUSTER")]
    cluster: Option<ClusterMode>,

    /// Serve Vault over TLS with a self-signed lab CA.
    #[arg(long, global = true)]
    tls: bool,

    /// Lab base directory.
    #[arg(long, global = true, env = "VAULT_LAB_HOME", default_value = "./vault-lab")]
    base_dir: PathBuf,

    /// Vault version: `latest` or MAJOR.MINOR.PATCH.
    #[arg(long, global = true, env = "VAULT_VERSION", default_value = "latest")]
    vault_version: VersionSpec,

    /// Consul version: `latest` or MAJOR.MINOR.PATCH.
    #[arg(long, global = true, env = "CONSUL_VERSION", default_value = "latest")]
    consul_version: VersionSpec,

    /// Fail instead of falling back to an existing local binary.
    #[arg(long, global = true, env = "VAULT_LAB_NO_FALLBACK")]
    no_binary_fallback: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision binaries, start the servers, init/unseal, configure demo features.
    Start,
    /// Stop every lab process.
    Stop,
    /// Stop and start again on the existing data.
    Restart,
    /// Wipe all lab data and start fresh.
    Reset,
    /// Show process, seal and configuration state.
    Status,
    /// Stop and wipe lab data (binaries and backups are kept).
    Cleanup,
    /// Open a shell with VAULT_ADDR, VAULT_TOKEN and friends exported.
    Shell,
    /// Snapshot the lab into backups/<name>.
    Backup {
        /// Backup name (default: backup_YYYYMMDD_HHMMSS).
        name: Option<String>,
        /// Free-form description stored in the metadata.
        description: Option<String>,
    },
    /// Replace the lab with a verified backup.
    Restore {
        name: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },
    /// List backups.
    ListBackups,
    /// Delete a backup.
    DeleteBackup {
        name: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },
    /// Write a backup as a .tar.gz archive.
    ExportBackup {
        name: String,
        /// Output file (default: ./<name>.tar.gz).
        path: Option<PathBuf>,
    },
    /// Import a backup archive produced by export-backup.
    ImportBackup {
        path: PathBuf,
        /// Name to import as (default: the archive's directory name).
        name: Option<String>,
    },
}

impl Commands {
    /// Commands that change lab state and must hold the lab lock.
    fn mutates(&self) -> bool {
        !matches!(
            self,
            Self::Status | Self::ListBackups | Self::ExportBackup { .. } | Self::Shell
        )
    }

    /// Commands that (re)choose the lab shape and may prompt for it.
    fn chooses_config(&self) -> bool {
        matches!(self, Self::Start | Self::Reset)
    }

    /// Commands that cannot run on a guessed shape when the persisted
    /// config is unreadable.
    fn requires_saved_config(&self) -> bool {
        matches!(self, Self::Restart)
    }
}

// ── Pretty output helpers ────────────────────────────────────────────

fn header(title: &str) {
    println!();
    println!("{}{}{title}{}", c(BOLD), c(CYAN), c(RESET));
    println!("{}─────────────────────────────────────────{}", c(DIM), c(RESET));
}

fn kv_line(key: &str, value: &str) {
    println!("  {}{key:<20}{} {}{value}{}", c(DIM), c(RESET), c(WHITE), c(RESET));
}

fn success(msg: &str) {
    println!("{}{}✓{} {msg}", c(GREEN), c(BOLD), c(RESET));
}

fn warning(msg: &str) {
    println!("{}{}⚠{} {}{msg}{}", c(YELLOW), c(BOLD), c(RESET), c(YELLOW), c(RESET));
}

fn print_access(access: &AccessInfo) {
    header("Lab access");
    for (i, addr) in access.vault_addrs.iter().enumerate() {
        let key = if access.vault_addrs.len() == 1 {
            "Vault".to_owned()
        } else {
            format!("Vault node {}", i + 1)
        };
        kv_line(&key, addr);
    }
    if let Some(addr) = access.vault_addrs.first() {
        kv_line("UI", &format!("{addr}/ui"));
    }
    if let Some(token) = &access.root_token {
        kv_line("Root token", token);
    }
    if let Some(ca) = &access.ca_cert {
        kv_line("CA certificate", &ca.display().to_string());
    }
    if let Some(addr) = &access.consul_addr {
        kv_line("Consul", addr);
    }
    if let Some(cred) = &access.approle {
        kv_line("AppRole role_id", &cred.role_id);
        kv_line("AppRole secret_id", &format!("{} (single use)", cred.secret_id));
    }
    kv_line("Userpass login", "demo / demo-password");
    kv_line("Base directory", &access.base_dir.display().to_string());

    println!();
    println!("  {}Environment:{}", c(DIM), c(RESET));
    for (key, value) in access.env() {
        println!("  export {key}='{value}'");
    }
    println!();
}

fn print_started(started: &Started) {
    if started.initialized {
        success("Vault initialized; unseal key and root token saved in vault-data/");
    }
    for warn in &started.features.warnings {
        warning(warn);
    }
    if !started.features.created.is_empty() {
        success(&format!("Enabled: {}", started.features.created.join(", ")));
    }
    print_access(&started.access);
}

fn print_status(status: &LabStatus) {
    header("Lab status");
    let state = match status.state {
        LabState::Stopped => format!("{}{}{}", c(DIM), status.state.as_str(), c(RESET)),
        LabState::RunningSealed => format!("{}{}{}", c(YELLOW), status.state.as_str(), c(RESET)),
        LabState::RunningUnsealed => format!("{}{}{}", c(GREEN), status.state.as_str(), c(RESET)),
    };
    kv_line("State", &state);
    match &status.config {
        Some(cfg) => {
            kv_line("Backend", cfg.backend_type.as_str());
            kv_line("Cluster", cfg.cluster_mode.as_str());
            kv_line("TLS", if cfg.tls_enabled { "enabled" } else { "disabled" });
        }
        None => kv_line("Configuration", "not started yet"),
    }
    println!();

    for node in status.vault_nodes.iter().chain(status.consul.iter()) {
        let pid = node
            .pid
            .map_or_else(|| format!("{}not running{}", c(DIM), c(RESET)), |p| format!("pid {p}"));
        let seal = match &node.seal {
            Some(s) if !s.initialized => format!(", {}uninitialized{}", c(YELLOW), c(RESET)),
            Some(s) if s.sealed => format!(", {}sealed{}", c(RED), c(RESET)),
            Some(s) => format!(", {}unsealed{} v{}", c(GREEN), c(RESET), s.version),
            None => String::new(),
        };
        kv_line(&node.name, &format!("{} {pid}{seal}", node.address));
    }
    println!();
}

fn print_backups(entries: &[BackupEntry]) {
    header("Backups");
    if entries.is_empty() {
        println!("  {}(none){}", c(DIM), c(RESET));
        println!();
        return;
    }
    println!(
        "  {}{:<28} {:<27} {:<8} {:<7} {:<5} {:>10}  DESCRIPTION{}",
        c(BOLD),
        "NAME",
        "CREATED",
        "BACKEND",
        "CLUSTER",
        "TLS",
        "SIZE",
        c(RESET)
    );
    for e in entries {
        println!(
            "  {:<28} {:<27} {:<8} {:<7} {:<5} {:>10}  {}",
            e.name,
            e.created(),
            e.backend(),
            e.cluster(),
            e.tls(),
            human_size(e.size_bytes),
            e.description()
        );
    }
    println!();
}

#[allow(clippy::cast_precision_loss)]
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// ── Configuration ────────────────────────────────────────────────────

/// On `start`/`reset`, shape flags describe the whole lab (unset ones take
/// their defaults) and a terminal with no shape flags gets prompted. Other
/// commands overlay the flags on the persisted config.
fn resolve_lab(cli: &Cli, persisted: Option<LabConfig>) -> Result<LabConfig> {
    let base = persisted.unwrap_or_default();
    let flagged = cli.backend.is_some() || cli.cluster.is_some() || cli.tls;
    if cli.command.chooses_config() {
        if flagged {
            return Ok(LabConfig::new(
                cli.backend.unwrap_or_default(),
                cli.cluster.unwrap_or_default(),
                cli.tls,
            ));
        }
        if prompt::interactive() {
            return prompt::ask_lab_config(base).context("failed to read configuration answers");
        }
    }
    Ok(LabConfig::new(
        cli.backend.unwrap_or(base.backend_type),
        cli.cluster.unwrap_or(base.cluster_mode),
        cli.tls || base.tls_enabled,
    ))
}

fn confirmer(force: bool, action: &'static str) -> Box<dyn Confirm> {
    if force {
        Box::new(AssumeYes)
    } else {
        Box::new(TerminalConfirm { action })
    }
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let color = !cli.no_color
        && std::env::var_os("NO_COLOR").is_none()
        && std::io::stdout().is_terminal();
    style::set_enabled(color);
    logging::init(cli.verbose, color);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let paths = LabPaths::new(&cli.base_dir);
    let persisted = match LabConfig::load(&paths.lab_config()) {
        Ok(persisted) => persisted,
        Err(e) if cli.command.requires_saved_config() => {
            return Err(e).context("cannot restart without a readable lab config");
        }
        Err(e) => {
            warn!(error = %e, "ignoring unreadable lab config");
            None
        }
    };
    let lab_config = resolve_lab(&cli, persisted)?;

    let mut ctx = LabContext::new(paths.clone(), lab_config);
    ctx.vault_version = cli.vault_version.clone();
    ctx.consul_version = cli.consul_version.clone();
    ctx.allow_binary_fallback = !cli.no_binary_fallback;

    let _lock = if cli.command.mutates() {
        Some(LabLock::acquire(&paths)?)
    } else {
        None
    };
    let mut lab = Lab::new(ctx)?;

    match cli.command {
        Commands::Start => {
            if cli.clean {
                lab.cleanup().await?;
            }
            let started = lab.start().await.context("start failed")?;
            print_started(&started);
        }
        Commands::Stop => {
            let stopped = lab.stop().await;
            if stopped == 0 {
                success("Nothing was running");
            } else {
                success(&format!("Stopped {stopped} process(es)"));
            }
        }
        Commands::Restart => {
            let started = lab.restart().await.context("restart failed")?;
            print_started(&started);
        }
        Commands::Reset => {
            let started = lab.reset().await.context("reset failed")?;
            print_started(&started);
        }
        Commands::Status => print_status(&lab.status().await),
        Commands::Cleanup => {
            lab.cleanup().await?;
            success(&format!("Lab data under {} wiped", paths.base().display()));
        }
        Commands::Shell => {
            if !lab.is_running() {
                warning("The lab is not running; variables point at a stopped Vault");
            }
            let status = lab.shell().await?;
            return Ok(status
                .code()
                .and_then(|code| u8::try_from(code).ok())
                .map_or(ExitCode::FAILURE, ExitCode::from));
        }
        Commands::Backup { name, description } => {
            let entry = lab.backup(name, description).await?;
            success(&format!("Backup '{}' created at {}", entry.name, entry.path.display()));
        }
        Commands::Restore { name, force } => {
            let confirm = confirmer(force, "replace the current lab data with this backup");
            let restored = lab.restore(&name, confirm.as_ref()).await?;
            success(&format!(
                "Restored '{}' ({} backend, {} cluster)",
                restored.entry.name, restored.config.backend_type, restored.config.cluster_mode
            ));
            match &restored.restarted {
                Some(started) => print_started(started),
                None => println!("  {}Run `vault-lab-ctl start` to bring it up.{}", c(DIM), c(RESET)),
            }
        }
        Commands::ListBackups => print_backups(&lab.list_backups()?),
        Commands::DeleteBackup { name, force } => {
            let confirm = confirmer(force, "permanently delete this backup");
            let entry = lab.delete_backup(&name, confirm.as_ref())?;
            success(&format!("Backup '{}' deleted", entry.name));
        }
        Commands::ExportBackup { name, path } => {
            let written = lab.export_backup(&name, path.as_deref())?;
            success(&format!("Backup '{name}' exported to {}", written.display()));
        }
        Commands::ImportBackup { path, name } => {
            let entry = lab.import_backup(&path, name.as_deref())?;
            success(&format!("Backup '{}' imported and verified", entry.name));
        }
    }
    Ok(ExitCode::SUCCESS)
}
