// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Interface lifecycle tracking.
//!
//! Consumes the kernel route socket and produces add/remove events for
//! `(interface, address)` pairs. On start the current address table is
//! dumped so every existing address is reported as added; afterwards live
//! messages keep the view current.
//!
//! Filtering: IPv4 interface addresses (when enabled), IPv6 link-local
//! addresses only (when enabled), no loopback or multicast-incapable
//! interfaces, and only whitelisted interface names when a whitelist is
//! configured.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::config::Config;
use crate::net::netlink::{
    self, AddrMessage, Message, NetlinkSocket, RecvStatus, IFA_F_DADFAILED, IFA_F_DEPRECATED,
    IFA_F_HOMEADDRESS, IFA_F_TENTATIVE, RTMGRP_IPV4_IFADDR, RTMGRP_IPV6_IFADDR, RTMGRP_LINK,
    RTM_NEWADDR,
};
use crate::net::{is_ipv6_link_local, split_embedded_scope, NetworkInterface};

const IFF_LOOPBACK: u32 = 0x8;
const IFF_MULTICAST: u32 = 0x1000;

/// An observed change to the set of usable addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    AddressAdded {
        iface: NetworkInterface,
        addr: IpAddr,
    },
    AddressRemoved {
        iface: NetworkInterface,
        addr: IpAddr,
    },
}

/// Route-socket consumer. Any `Err` out of [`InterfaceMonitor::drain`] is
/// terminal for the whole process.
pub struct InterfaceMonitor {
    config: Arc<Config>,
    socket: NetlinkSocket,
    buf: Vec<u8>,
    /// interface index -> "ignore this interface" decision cache.
    ignored: HashMap<u32, bool>,
}

impl InterfaceMonitor {
    pub fn start(config: Arc<Config>) -> io::Result<Self> {
        let mut groups = RTMGRP_LINK;
        if config.enable_ipv4() {
            groups |= RTMGRP_IPV4_IFADDR;
        }
        if config.enable_ipv6() {
            groups |= RTMGRP_IPV6_IFADDR;
        }

        let socket = NetlinkSocket::open(groups)?;
        socket.request_addr_dump()?;
        log::info!("Starting interface monitor");

        let buf_size = 2 * config.page_size;
        Ok(Self {
            config,
            socket,
            buf: vec![0u8; buf_size],
            ignored: HashMap::new(),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Drain everything currently readable and translate it into events.
    pub fn drain(&mut self) -> io::Result<Vec<MonitorEvent>> {
        let mut events = Vec::new();
        loop {
            match self.socket.recv(&mut self.buf)? {
                RecvStatus::WouldBlock => break,
                RecvStatus::Truncated(real_len) => {
                    log::warn!(
                        "interface monitor buffer is insufficient to hold a message ({} bytes), increasing",
                        real_len
                    );
                    let doubled = self.buf.len() * 2;
                    self.buf.resize(doubled.max(real_len), 0);
                    self.socket.request_addr_dump()?;
                }
                RecvStatus::Data(len) => {
                    // Borrow dance: walk a split-off buffer so handlers can
                    // use &mut self.
                    let buf = std::mem::take(&mut self.buf);
                    let mut rerequest = false;
                    for message in netlink::messages(&buf[..len]) {
                        match message {
                            Message::Addr { msg_type, addr } => {
                                self.handle_addr(msg_type == RTM_NEWADDR, &addr, &mut events);
                            }
                            Message::Done | Message::Other => {}
                            Message::Overrun => {
                                let doubled = buf.len() * 2;
                                self.buf = vec![0u8; doubled];
                                rerequest = true;
                                break;
                            }
                            Message::Error => {
                                rerequest = true;
                                break;
                            }
                        }
                    }
                    if self.buf.is_empty() {
                        self.buf = buf;
                    }
                    if rerequest {
                        self.socket.request_addr_dump()?;
                    }
                }
            }
        }
        Ok(events)
    }

    fn handle_addr(&mut self, added: bool, message: &AddrMessage, events: &mut Vec<MonitorEvent>) {
        if message.addr_flags
            & (IFA_F_DADFAILED | IFA_F_HOMEADDRESS | IFA_F_DEPRECATED | IFA_F_TENTATIVE)
            != 0
        {
            return;
        }

        let Some((iface, addr)) = self.extract(message) else {
            return;
        };

        if !self.config.is_allowed_interface(&iface.name) {
            log::debug!("Interface {} is not allowed in configuration - ignoring", iface);
            return;
        }

        if added {
            if self.interface_ignored(&iface) {
                log::debug!(
                    "Interface {} is loopback or doesn't support multicast - ignoring",
                    iface
                );
                return;
            }
            events.push(MonitorEvent::AddressAdded { iface, addr });
        } else {
            events.push(MonitorEvent::AddressRemoved { iface, addr });
        }
    }

    /// Pull the (interface, address) pair out of a message, applying the
    /// per-family filters.
    fn extract(&self, message: &AddrMessage) -> Option<(NetworkInterface, IpAddr)> {
        let mut if_index = message.if_index;

        let addr = if message.family == libc::AF_INET as u8 {
            if !self.config.enable_ipv4() {
                return None;
            }
            IpAddr::V4(message.v4_local?)
        } else if message.family == libc::AF_INET6 as u8 {
            if !self.config.enable_ipv6() {
                return None;
            }
            let raw = message.v6_addr?;
            if !is_ipv6_link_local(raw) {
                return None;
            }
            let (stripped, embedded_scope) = split_embedded_scope(raw);
            if let Some(scope) = embedded_scope {
                if_index = scope;
            }
            IpAddr::V6(stripped)
        } else {
            return None;
        };

        let name = match &message.label {
            Some(label) => label.clone(),
            None => match netlink::interface_name(if_index) {
                Some(name) => name,
                None => {
                    log::error!("Unable to obtain name for interface {}", if_index);
                    return None;
                }
            },
        };

        Some((NetworkInterface::new(if_index, name), addr))
    }

    fn interface_ignored(&mut self, iface: &NetworkInterface) -> bool {
        if let Some(&ignored) = self.ignored.get(&iface.index) {
            return ignored;
        }
        let ignored = match interface_flags(&iface.name) {
            Some(flags) => flags & IFF_MULTICAST == 0 || flags & IFF_LOOPBACK != 0,
            None => {
                log::error!("Unable to obtain flags for interface {}", iface);
                true
            }
        };
        self.ignored.insert(iface.index, ignored);
        ignored
    }
}

/// Interface flag word from sysfs (hex-formatted).
fn interface_flags(name: &str) -> Option<u32> {
    let path = format!("/sys/class/net/{}/flags", name);
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim().trim_start_matches("0x");
    u32::from_str_radix(trimmed, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use std::net::Ipv6Addr;

    fn monitor_with(opts: Options) -> InterfaceMonitor {
        let config = Arc::new(Config::build(&opts).unwrap());
        InterfaceMonitor {
            config,
            socket: NetlinkSocket::open(0).unwrap(),
            buf: vec![0u8; 4096],
            ignored: HashMap::new(),
        }
    }

    fn v4_message(index: u32, label: &str, octets: [u8; 4]) -> AddrMessage {
        AddrMessage {
            family: libc::AF_INET as u8,
            addr_flags: 0,
            if_index: index,
            label: Some(label.to_owned()),
            v4_local: Some(octets.into()),
            v6_addr: None,
        }
    }

    #[test]
    fn extract_honors_family_toggle() {
        let monitor = monitor_with(Options {
            address_family: Some(crate::config::AddressFamily::IPv6),
            ..Options::default()
        });
        assert!(monitor.extract(&v4_message(2, "eth0", [10, 0, 0, 1])).is_none());
    }

    #[test]
    fn extract_takes_ipv4_local() {
        let monitor = monitor_with(Options::default());
        let (iface, addr) = monitor.extract(&v4_message(2, "eth0", [10, 0, 0, 1])).unwrap();
        assert_eq!(iface, NetworkInterface::new(2, "eth0"));
        assert_eq!(addr, IpAddr::V4([10, 0, 0, 1].into()));
    }

    #[test]
    fn extract_rejects_global_ipv6() {
        let monitor = monitor_with(Options::default());
        let message = AddrMessage {
            family: libc::AF_INET6 as u8,
            if_index: 2,
            label: Some("eth0".into()),
            v6_addr: Some("2001:db8::1".parse().unwrap()),
            ..AddrMessage::default()
        };
        assert!(monitor.extract(&message).is_none());
    }

    #[test]
    fn extract_strips_embedded_scope() {
        let monitor = monitor_with(Options::default());
        let message = AddrMessage {
            family: libc::AF_INET6 as u8,
            if_index: 2,
            label: Some("eth0".into()),
            v6_addr: Some("fe80:5::1".parse().unwrap()),
            ..AddrMessage::default()
        };
        let (iface, addr) = monitor.extract(&message).unwrap();
        assert_eq!(iface.index, 5);
        assert_eq!(addr, IpAddr::V6("fe80::1".parse::<Ipv6Addr>().unwrap()));
    }

    #[test]
    fn tentative_addresses_are_skipped() {
        let mut monitor = monitor_with(Options::default());
        let mut events = Vec::new();
        let mut message = v4_message(2, "eth0", [10, 0, 0, 1]);
        message.addr_flags = IFA_F_TENTATIVE;
        monitor.handle_addr(true, &message, &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn whitelist_gates_events() {
        let mut monitor = monitor_with(Options {
            interfaces: vec!["eth7".into()],
            ..Options::default()
        });
        let mut events = Vec::new();
        monitor.handle_addr(true, &v4_message(2, "eth0", [10, 0, 0, 1]), &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn removal_bypasses_flag_cache() {
        let mut monitor = monitor_with(Options::default());
        let mut events = Vec::new();
        monitor.handle_addr(false, &v4_message(2, "eth0", [10, 0, 0, 1]), &mut events);
        assert_eq!(
            events,
            vec![MonitorEvent::AddressRemoved {
                iface: NetworkInterface::new(2, "eth0"),
                addr: IpAddr::V4([10, 0, 0, 1].into()),
            }]
        );
    }

    #[test]
    fn ignore_cache_is_consulted_once() {
        let mut monitor = monitor_with(Options::default());
        monitor.ignored.insert(2, true);
        let mut events = Vec::new();
        monitor.handle_addr(true, &v4_message(2, "missing0", [10, 0, 0, 1]), &mut events);
        assert!(events.is_empty());
    }
}
