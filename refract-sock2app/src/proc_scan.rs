//! /proc/net scanning.
//!
//! Rows in `/proc/net/{tcp,tcp6,udp,udp6}` carry the local address, the
//! owning uid and the socket inode; `/proc/<pid>/fd` links join inodes back
//! to processes. A scan builds the inode map once, then walks all four
//! tables.

use crate::table::{ConnectionSource, SocketOwner};
use crate::{AppDescriptor, ResolveError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::trace;

const NET_TABLES: [&str; 4] = ["net/tcp", "net/tcp6", "net/udp", "net/udp6"];

/// Default connection source backed by procfs
pub struct ProcfsSource {
    root: PathBuf,
    own_uid: u32,
}

impl ProcfsSource {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc"),
            own_uid: unsafe { libc::getuid() },
        }
    }

    /// Scan an alternate proc root; used by tests and containers
    pub fn with_root(root: impl Into<PathBuf>, own_uid: u32) -> Self {
        Self {
            root: root.into(),
            own_uid,
        }
    }

    fn inode_map(&self) -> Result<HashMap<u64, AppDescriptor>> {
        let mut map = HashMap::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let pid: u32 = match entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                Some(pid) => pid,
                None => continue,
            };

            let fd_dir = entry.path().join("fd");
            let fd_entries = match fs::read_dir(&fd_dir) {
                Ok(e) => e,
                // Processes we cannot inspect are simply not attributable
                Err(_) => continue,
            };

            let mut descriptor: Option<AppDescriptor> = None;
            for fd_entry in fd_entries.flatten() {
                let link = match fs::read_link(fd_entry.path()) {
                    Ok(l) => l,
                    Err(_) => continue,
                };
                let link = match link.to_str() {
                    Some(s) => s,
                    None => continue,
                };
                if let Some(inode) = parse_socket_inode(link) {
                    if descriptor.is_none() {
                        descriptor = self.process_info(pid);
                    }
                    if let Some(ref desc) = descriptor {
                        map.insert(inode, desc.clone());
                    }
                }
            }
        }

        Ok(map)
    }

    fn process_info(&self, pid: u32) -> Option<AppDescriptor> {
        let proc_path = self.root.join(pid.to_string());

        let status = fs::read_to_string(proc_path.join("status")).ok()?;
        let name = status
            .lines()
            .find(|line| line.starts_with("Name:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("unknown")
            .to_string();
        let uid = status
            .lines()
            .find(|line| line.starts_with("Uid:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let exe = fs::read_link(proc_path.join("exe"))
            .ok()
            .and_then(|p| p.to_str().map(|s| s.to_string()));

        Some(AppDescriptor {
            pid,
            uid,
            name,
            exe,
        })
    }
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSource for ProcfsSource {
    fn scan(&self) -> Result<Vec<SocketOwner>> {
        let inodes = self.inode_map()?;
        let mut owners = Vec::new();

        for table in NET_TABLES {
            let content = match fs::read_to_string(self.root.join(table)) {
                Ok(c) => c,
                // udp6/tcp6 may be absent; that is not an error
                Err(_) => continue,
            };

            for line in content.lines().skip(1) {
                let row = match parse_row(line) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                if row.uid == self.own_uid {
                    trace!("Skipping own socket on port {}", row.local_port);
                    continue;
                }
                let app = match inodes.get(&row.inode) {
                    Some(desc) => desc.clone(),
                    None => continue,
                };
                owners.push(SocketOwner {
                    local_port: row.local_port,
                    app,
                });
            }
        }

        Ok(owners)
    }
}

fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

struct NetRow {
    local_port: u16,
    uid: u32,
    inode: u64,
}

/// Parse one `/proc/net/*` row: `sl local_address rem_address st ... uid
/// timeout inode ...`
fn parse_row(line: &str) -> Result<NetRow> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return Err(ResolveError::InvalidSocketAddr);
    }

    let addr_port: Vec<&str> = parts[1].split(':').collect();
    if addr_port.len() != 2 {
        return Err(ResolveError::InvalidSocketAddr);
    }
    let local_port =
        u16::from_str_radix(addr_port[1], 16).map_err(|_| ResolveError::InvalidSocketAddr)?;

    let uid: u32 = parts[7]
        .parse()
        .map_err(|_| ResolveError::InvalidSocketAddr)?;
    let inode: u64 = parts[9]
        .parse()
        .map_err(|_| ResolveError::InvalidSocketAddr)?;

    Ok(NetRow {
        local_port,
        uid,
        inode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_net_row() {
        let line = "   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 123456 1 0000000000000000 100 0 0 10 0";
        let row = parse_row(line).unwrap();
        assert_eq!(row.local_port, 0x1F90);
        assert_eq!(row.uid, 1000);
        assert_eq!(row.inode, 123456);
    }

    #[test]
    fn rejects_short_row() {
        assert!(parse_row("   0: 0100007F:1F90").is_err());
    }

    #[test]
    fn parses_socket_inode_link() {
        assert_eq!(parse_socket_inode("socket:[98765]"), Some(98765));
        assert_eq!(parse_socket_inode("/dev/null"), None);
        assert_eq!(parse_socket_inode("socket:[not-a-number]"), None);
    }
}
