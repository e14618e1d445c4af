//! Interactive questions on the controlling terminal.

use std::io::{self, BufRead, IsTerminal, Write};

use vaultlab_core::backup::Confirm;
use vaultlab_core::config::{BackendType, ClusterMode, LabConfig};
use vaultlab_core::error::BackupError;

use crate::style::{BOLD, DIM, RESET, YELLOW, c};

/// Whether both stdin and stderr are attached to a terminal.
pub fn interactive() -> bool {
    io::stdin().is_terminal() && io::stderr().is_terminal()
}

fn read_answer(question: &str) -> io::Result<String> {
    let mut err = io::stderr();
    write!(err, "{question}")?;
    err.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_owned())
}

/// Numbered menu; an empty answer picks `default`. Re-asks on bad input.
fn choose<T: Copy + PartialEq>(title: &str, options: &[(T, &str)], default: T) -> io::Result<T> {
    eprintln!("{}{title}{}", c(BOLD), c(RESET));
    for (i, (value, label)) in options.iter().enumerate() {
        let marker = if *value == default { " (default)" } else { "" };
        eprintln!("  {}{}){} {label}{marker}", c(DIM), i + 1, c(RESET));
    }
    loop {
        let answer = read_answer("Choice: ")?;
        if answer.is_empty() {
            return Ok(default);
        }
        match answer.parse::<usize>() {
            Ok(n) if (1..=options.len()).contains(&n) => return Ok(options[n - 1].0),
            _ => eprintln!("{}Enter a number between 1 and {}.{}", c(YELLOW), options.len(), c(RESET)),
        }
    }
}

fn yes_no(question: &str, default: bool) -> io::Result<bool> {
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    loop {
        let answer = read_answer(&format!("{question} {hint} "))?;
        match answer.to_ascii_lowercase().as_str() {
            "" => return Ok(default),
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => eprintln!("{}Please answer y or n.{}", c(YELLOW), c(RESET)),
        }
    }
}

/// Ask for backend, cluster mode, and TLS, starting from `current`.
/// Multi-node forces Consul without asking about the backend again.
pub fn ask_lab_config(current: LabConfig) -> io::Result<LabConfig> {
    eprintln!();
    let cluster_mode = choose(
        "Cluster mode:",
        &[
            (ClusterMode::Single, "single Vault node"),
            (ClusterMode::Multi, "three Vault nodes (HA, Consul storage)"),
        ],
        current.cluster_mode,
    )?;
    let backend_type = if cluster_mode == ClusterMode::Multi {
        eprintln!("{}Multi-node clusters use the Consul backend.{}", c(DIM), c(RESET));
        BackendType::Consul
    } else {
        choose(
            "Storage backend:",
            &[
                (BackendType::File, "file (integrated, no extra process)"),
                (BackendType::Consul, "consul (local Consul server)"),
            ],
            current.backend_type,
        )?
    };
    let tls_enabled = yes_no("Enable TLS with a self-signed lab CA?", current.tls_enabled)?;
    eprintln!();
    Ok(LabConfig::new(backend_type, cluster_mode, tls_enabled))
}

/// Type-the-name confirmation on the terminal.
pub struct TerminalConfirm {
    pub action: &'static str,
}

impl Confirm for TerminalConfirm {
    fn confirm_by_typing(&self, summary: &str, expected: &str) -> Result<bool, BackupError> {
        if !interactive() {
            return Err(BackupError::ConfirmationRequired {
                action: self.action,
            });
        }
        eprintln!();
        for line in summary.lines() {
            eprintln!("  {line}");
        }
        eprintln!();
        let answer = read_answer(&format!(
            "{}{}This will {}.{} Type the backup name to confirm: ",
            c(YELLOW),
            c(BOLD),
            self.action,
            c(RESET)
        ))
        .map_err(|source| BackupError::Io {
            path: "<stdin>".into(),
            source,
        })?;
        Ok(answer == expected)
    }
}
