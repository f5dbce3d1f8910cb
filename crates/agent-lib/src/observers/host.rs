//! Host observer: listening sockets of local processes
//!
//! Reads the kernel socket tables under `{HOST_PROC}/net`, keeps sockets
//! that accept connections, and resolves each socket inode to its owning
//! process through `{HOST_PROC}/<pid>/fd`.

use super::{EndpointSink, Observer, ObserverInit, ObserverSettings};
use crate::endpoint::{Endpoint, EndpointEvent, PortType};
use crate::error::InstantiationError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// TCP_LISTEN in the kernel's state column
const TCP_LISTEN: &str = "0A";
/// TCP_CLOSE, which is what an unconnected UDP socket reports
const UDP_UNCONNECTED: &str = "07";

/// `host` observer settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HostObserverConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for HostObserverConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

/// One row of a socket table that is accepting traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningSocket {
    pub ip: IpAddr,
    pub port: u16,
    pub port_type: PortType,
    pub inode: u64,
}

fn parse_ipv4(hex: &str) -> Option<IpAddr> {
    let raw = u32::from_str_radix(hex, 16).ok()?;
    Some(IpAddr::V4(Ipv4Addr::from(raw.to_le_bytes())))
}

fn parse_ipv6(hex: &str) -> Option<IpAddr> {
    if hex.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 16];
    for (i, chunk) in bytes.chunks_mut(4).enumerate() {
        let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16).ok()?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Some(IpAddr::V6(Ipv6Addr::from(bytes)))
}

/// Parse a `/proc/net/{tcp,tcp6,udp,udp6}` table, keeping listening sockets
pub fn parse_socket_table(content: &str, port_type: PortType) -> Vec<ListeningSocket> {
    let wanted_state = match port_type {
        PortType::Udp => UDP_UNCONNECTED,
        _ => TCP_LISTEN,
    };

    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != wanted_state {
                return None;
            }
            let (addr, port) = fields[1].split_once(':')?;
            let ip = if addr.len() == 8 {
                parse_ipv4(addr)?
            } else {
                parse_ipv6(addr)?
            };
            let port = u16::from_str_radix(port, 16).ok()?;
            let inode = fields[9].parse().ok()?;
            if port == 0 || inode == 0 {
                return None;
            }
            Some(ListeningSocket {
                ip,
                port,
                port_type,
                inode,
            })
        })
        .collect()
}

/// Map socket inodes to `(pid, command)` by walking every process's fds
fn socket_owners(host_proc: &Path) -> HashMap<u64, (u32, String)> {
    let mut owners = HashMap::new();
    let Ok(procs) = std::fs::read_dir(host_proc) else {
        return owners;
    };

    for entry in procs.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let mut command: Option<String> = None;
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let Some(inode) = target
                .to_str()
                .and_then(|t| t.strip_prefix("socket:["))
                .and_then(|t| t.strip_suffix(']'))
                .and_then(|t| t.parse::<u64>().ok())
            else {
                continue;
            };
            let command = command
                .get_or_insert_with(|| {
                    std::fs::read_to_string(entry.path().join("comm"))
                        .map(|c| c.trim().to_string())
                        .unwrap_or_default()
                })
                .clone();
            owners.entry(inode).or_insert((pid, command));
        }
    }
    owners
}

fn endpoint_host(ip: &IpAddr) -> String {
    if ip.is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        ip.to_string()
    }
}

/// Build endpoints from the socket tables under `host_proc`, keyed by id
pub(crate) fn scan(host_proc: &Path, observer_name: &str) -> BTreeMap<String, Endpoint> {
    let tables = [
        ("net/tcp", PortType::Tcp),
        ("net/tcp6", PortType::Tcp),
        ("net/udp", PortType::Udp),
        ("net/udp6", PortType::Udp),
    ];
    let mut sockets = Vec::new();
    for (rel, port_type) in tables {
        match std::fs::read_to_string(host_proc.join(rel)) {
            Ok(content) => sockets.extend(parse_socket_table(&content, port_type)),
            Err(e) => debug!(table = rel, error = %e, "Socket table unavailable"),
        }
    }

    let owners = socket_owners(host_proc);
    let mut endpoints = BTreeMap::new();
    for socket in sockets {
        let Some((pid, command)) = owners.get(&socket.inode) else {
            continue;
        };
        let host = endpoint_host(&socket.ip);
        let id = format!("{}-{}-{}", host, socket.port, pid);
        if endpoints.contains_key(&id) {
            continue;
        }
        let mut endpoint = Endpoint::new(id.clone(), command.clone(), observer_name)
            .with_address(host, socket.port, socket.port_type)
            .with_dimension("pid", pid.to_string())
            .with_dimension("command", command.clone());
        endpoint
            .extra_fields
            .insert("is_ipv6".to_string(), socket.ip.is_ipv6().to_string());
        endpoints.insert(id, endpoint);
    }
    endpoints
}

/// Events that turn `old` into `new`
pub(crate) fn diff(
    old: &BTreeMap<String, Endpoint>,
    new: &BTreeMap<String, Endpoint>,
) -> Vec<EndpointEvent> {
    let removed = old
        .keys()
        .filter(|id| !new.contains_key(*id))
        .map(|id| EndpointEvent::Removed(id.clone()));
    let added = new
        .iter()
        .filter(|(id, ep)| old.get(*id) != Some(ep))
        .map(|(_, ep)| EndpointEvent::Added(ep.clone()));
    removed.chain(added).collect()
}

#[derive(Default)]
pub struct HostObserver {
    host_proc: PathBuf,
    name: String,
    poll_interval: Duration,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl Observer for HostObserver {
    async fn configure(&mut self, init: ObserverInit) -> Result<(), InstantiationError> {
        let ObserverSettings::Host(settings) = &init.config.settings else {
            return Err(InstantiationError::observer("host", "unexpected settings variant"));
        };
        if settings.poll_interval_seconds == 0 {
            return Err(InstantiationError::observer(
                "host",
                "pollIntervalSeconds must be greater than 0",
            ));
        }
        self.host_proc = init.ctx.host_proc.clone();
        self.name = init.config.name.clone();
        self.poll_interval = Duration::from_secs(settings.poll_interval_seconds);
        self.cancel = Some(init.cancel);
        Ok(())
    }

    fn start(&mut self, sink: EndpointSink) {
        let cancel = self.cancel.clone().unwrap_or_default();
        self.handle = Some(tokio::spawn(poll(
            self.host_proc.clone(),
            self.name.clone(),
            self.poll_interval,
            sink,
            cancel,
        )));
    }

    async fn shutdown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                debug!(error = %e, "Host observer task ended abnormally");
            }
        }
    }
}

async fn poll(
    host_proc: PathBuf,
    name: String,
    every: Duration,
    sink: EndpointSink,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut known: BTreeMap<String, Endpoint> = BTreeMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let proc_dir = host_proc.clone();
                let observer = name.clone();
                let current = match tokio::task::spawn_blocking(move || scan(&proc_dir, &observer)).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "Host socket scan failed");
                        continue;
                    }
                };
                for event in diff(&known, &current) {
                    let delivered = match event {
                        EndpointEvent::Added(ep) => sink.added(ep),
                        EndpointEvent::Removed(id) => sink.removed(id),
                    };
                    if !delivered {
                        return;
                    }
                }
                known = current;
            }
        }
    }
    debug!(observer = %name, "Host observer stopped");
}
