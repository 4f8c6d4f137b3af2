//! Local IPv4 interface discovery.
//!
//! Polls `getifaddrs` and reports interfaces coming and going to the worker.
//! Loopback and interfaces without a broadcast address are never used.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tokio::sync::{broadcast, mpsc};

use succinct_services::IpInterface;

use crate::worker::Command;

/// Whether the kernel reports a wireless phy behind `name`.
pub fn is_wireless(name: &str) -> bool {
    Path::new("/sys/class/net")
        .join(name)
        .join("phy80211")
        .exists()
}

fn prefix_len(netmask: Ipv4Addr) -> u8 {
    u32::from(netmask).count_ones() as u8
}

/// Current broadcast-capable IPv4 interfaces, one entry per name.
pub fn scan(wireless_only: bool) -> Result<Vec<IpInterface>> {
    let mut found: Vec<IpInterface> = Vec::new();
    for ifaddr in getifaddrs().context("getifaddrs()")? {
        let flags = ifaddr.flags;
        if flags.contains(InterfaceFlags::IFF_LOOPBACK)
            || !flags.contains(InterfaceFlags::IFF_UP)
            || !flags.contains(InterfaceFlags::IFF_BROADCAST)
        {
            continue;
        }
        let v4 = |addr: Option<&nix::sys::socket::SockaddrStorage>| {
            addr.and_then(|a| a.as_sockaddr_in()).map(|a| a.ip())
        };
        let (Some(address), Some(netmask), Some(broadcast)) = (
            v4(ifaddr.address.as_ref()),
            v4(ifaddr.netmask.as_ref()),
            v4(ifaddr.broadcast.as_ref()),
        ) else {
            continue;
        };
        if wireless_only && !is_wireless(&ifaddr.interface_name) {
            continue;
        }
        if found.iter().any(|i| i.name == ifaddr.interface_name) {
            continue;
        }
        found.push(IpInterface {
            name: ifaddr.interface_name,
            address,
            broadcast,
            prefix_len: prefix_len(netmask),
        });
    }
    Ok(found)
}

/// Interfaces added or changed, and names that disappeared.
pub fn diff(
    known: &HashMap<String, IpInterface>,
    current: &[IpInterface],
) -> (Vec<IpInterface>, Vec<String>) {
    let added = current
        .iter()
        .filter(|i| known.get(&i.name) != Some(*i))
        .cloned()
        .collect();
    let mut removed: Vec<String> = known
        .keys()
        .filter(|name| !current.iter().any(|i| &i.name == *name))
        .cloned()
        .collect();
    removed.sort();
    (added, removed)
}

/// Poll the interface list until shutdown.
pub async fn watch_loop(
    poll: Duration,
    wireless_only: bool,
    commands: mpsc::Sender<Command>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut known: HashMap<String, IpInterface> = HashMap::new();
    let mut interval = tokio::time::interval(poll);
    tracing::info!(poll_ms = poll.as_millis() as u64, wireless_only, "interface watcher starting");

    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            _ = interval.tick() => {}
        }

        let current = match scan(wireless_only) {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(error = %e, "interface scan failed");
                continue;
            }
        };
        let (added, removed) = diff(&known, &current);
        for name in removed {
            known.remove(&name);
            if commands.send(Command::InterfaceDown(name)).await.is_err() {
                return Ok(());
            }
        }
        for interface in added {
            known.insert(interface.name.clone(), interface.clone());
            if commands.send(Command::InterfaceUp(interface)).await.is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, last: u8) -> IpInterface {
        IpInterface {
            name: name.into(),
            address: Ipv4Addr::new(10, 0, 0, last),
            broadcast: Ipv4Addr::new(10, 0, 0, 255),
            prefix_len: 24,
        }
    }

    #[test]
    fn netmask_to_prefix() {
        assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 255, 0)), 24);
        assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 240, 0)), 20);
    }

    #[test]
    fn diff_reports_changes() {
        let mut known = HashMap::new();
        known.insert("wlan0".to_string(), iface("wlan0", 1));
        known.insert("eth0".to_string(), iface("eth0", 2));

        let current = vec![iface("wlan0", 9), iface("wlan1", 3)];
        let (added, removed) = diff(&known, &current);
        assert_eq!(added, current);
        assert_eq!(removed, vec!["eth0".to_string()]);

        let steady: HashMap<String, IpInterface> =
            current.iter().map(|i| (i.name.clone(), i.clone())).collect();
        let (added, removed) = diff(&steady, &current);
        assert!(added.is_empty() && removed.is_empty());
    }
}
