//! Process-table queries backing the fallback stop strategies.
//!
//! On Linux these read `/proc` directly. Elsewhere they shell out to `ps`
//! and `lsof`; a missing tool simply yields no matches.

use std::collections::HashSet;

/// A process and its argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub cmdline: String,
}

/// Pids whose command line contains every one of `needles`. The calling
/// process is never included.
#[must_use]
pub fn find_by_pattern(needles: &[&str]) -> Vec<u32> {
    let me = std::process::id();
    processes()
        .into_iter()
        .filter(|p| p.pid != me && needles.iter().all(|n| p.cmdline.contains(n)))
        .map(|p| p.pid)
        .collect()
}

/// Whether `pid` is alive with a command line containing every one of
/// `needles`.
#[must_use]
pub fn cmdline_matches(pid: u32, needles: &[&str]) -> bool {
    cmdline(pid).is_some_and(|cmd| needles.iter().all(|n| cmd.contains(n)))
}

/// Pids holding a listening TCP socket on `port`.
#[must_use]
pub fn listeners_on_port(port: u16) -> Vec<u32> {
    let me = std::process::id();
    let mut pids = listening_pids(port);
    pids.retain(|pid| *pid != me);
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(target_os = "linux")]
fn processes() -> Vec<ProcessEntry> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(|pid| Some(ProcessEntry { pid, cmdline: cmdline(pid)? }))
        .collect()
}

/// Argument vector of `pid` joined by spaces; `None` for kernel threads
/// and vanished processes.
#[cfg(target_os = "linux")]
#[must_use]
pub fn cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let args: Vec<_> = raw
        .split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(String::from_utf8_lossy)
        .collect();
    if args.is_empty() { None } else { Some(args.join(" ")) }
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn cmdline(pid: u32) -> Option<String> {
    let output = std::process::Command::new("ps")
        .args(["-o", "command=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    let cmd = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if cmd.is_empty() { None } else { Some(cmd) }
}

#[cfg(not(target_os = "linux"))]
fn processes() -> Vec<ProcessEntry> {
    let Ok(output) = std::process::Command::new("ps")
        .args(["-axo", "pid=,command="])
        .output()
    else {
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, cmd) = line.split_once(char::is_whitespace)?;
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                cmdline: cmd.trim().to_owned(),
            })
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn listening_pids(port: u16) -> Vec<u32> {
    let mut inodes = HashSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            inodes.extend(listening_inodes(&content, port));
        }
    }
    if inodes.is_empty() {
        return Vec::new();
    }

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut pids = Vec::new();
    for pid in entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
    {
        let Ok(fds) = std::fs::read_dir(format!("/proc/{pid}/fd")) else {
            continue;
        };
        let owns_socket = fds.filter_map(Result::ok).any(|fd| {
            std::fs::read_link(fd.path())
                .ok()
                .and_then(|target| socket_inode(&target.to_string_lossy()))
                .is_some_and(|inode| inodes.contains(&inode))
        });
        if owns_socket {
            pids.push(pid);
        }
    }
    pids
}

#[cfg(not(target_os = "linux"))]
fn listening_pids(port: u16) -> Vec<u32> {
    let Ok(output) = std::process::Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
    else {
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

/// Socket inodes in LISTEN state (`0A`) bound to `port`, from the text of
/// `/proc/net/tcp{,6}`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn listening_inodes(table: &str, port: u16) -> HashSet<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let local = cols.get(1)?;
            let state = cols.get(3)?;
            let inode = cols.get(9)?;
            let (_, port_hex) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            (local_port == port && *state == "0A")
                .then(|| inode.parse::<u64>().ok())
                .flatten()
        })
        .filter(|inode| *inode != 0)
        .collect()
}

/// `socket:[12345]` → `12345`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}
