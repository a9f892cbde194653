//! Bookkeeping for ports handed out to sub-brokers and cores.

use std::collections::{BTreeSet, HashMap};

/// Tracks which ports on each host are claimed and hands out fresh blocks.
///
/// Loopback spellings (`127.0.0.1`, `::1`, `localhost`) all refer to one host.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    starting_port: Option<u16>,
    used: HashMap<String, BTreeSet<u16>>,
    next: HashMap<String, u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_starting_port(port: u16) -> Self {
        Self {
            starting_port: Some(port),
            ..Self::default()
        }
    }

    pub fn starting_port(&self) -> Option<u16> {
        self.starting_port
    }

    pub fn set_starting_port(&mut self, port: u16) {
        self.starting_port = Some(port);
    }

    /// Returns the first of `count` consecutive ports on `host` that have not
    /// been handed out or reported as used. All of them are marked used
    /// before returning. Returns `None` if the port space is exhausted or no
    /// starting port has been set.
    pub fn find_open_port(&mut self, count: u16, host: &str) -> Option<u16> {
        let count = u32::from(count.max(1));
        let host = normalize_host(host);
        let start = match self.next.get(host) {
            Some(next) => *next,
            None => self.starting_port?,
        };

        let used = self.used.entry(host.to_string()).or_default();
        let mut port = u32::from(start);
        let last = loop {
            let last = port + count - 1;
            if last > u32::from(u16::MAX) {
                return None;
            }
            if !(port..=last).any(|p| used.contains(&(p as u16))) {
                break last as u16;
            }
            port += 1;
        };
        let first = port as u16;
        used.extend(first..=last);
        self.next.insert(host.to_string(), last.saturating_add(1));
        Some(first)
    }

    pub fn add_used_port(&mut self, host: &str, port: u16) {
        self.used
            .entry(normalize_host(host).to_string())
            .or_default()
            .insert(port);
    }

    pub fn add_used_ports(&mut self, host: &str, ports: impl IntoIterator<Item = u16>) {
        self.used
            .entry(normalize_host(host).to_string())
            .or_default()
            .extend(ports);
    }

    pub fn is_port_used(&self, host: &str, port: u16) -> bool {
        self.used
            .get(normalize_host(host))
            .map_or(false, |ports| ports.contains(&port))
    }
}

fn normalize_host(host: &str) -> &str {
    match host {
        "127.0.0.1" | "::1" | "[::1]" | "" => "localhost",
        other => other,
    }
}
