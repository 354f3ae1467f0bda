// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thin rtnetlink route-socket wrapper.
//!
//! Socket operations only, plus zero-copy message walking; the monitor
//! layers policy on top. Messages are parsed by hand from the wire layout
//! (16-byte `nlmsghdr`, 8-byte `ifaddrmsg`, 4-byte-aligned attributes).

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;

// rtnetlink constants. Spelled out here rather than pulled from bindings:
// the daemon needs exactly these and nothing else.
pub const RTMGRP_LINK: u32 = 0x01;
pub const RTMGRP_IPV4_IFADDR: u32 = 0x10;
pub const RTMGRP_IPV6_IFADDR: u32 = 0x100;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_GETADDR: u16 = 22;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_DUMP: u16 = 0x300;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_LABEL: u16 = 3;

pub const IFA_F_DADFAILED: u8 = 0x08;
pub const IFA_F_HOMEADDRESS: u8 = 0x10;
pub const IFA_F_DEPRECATED: u8 = 0x20;
pub const IFA_F_TENTATIVE: u8 = 0x40;

const NLMSG_HDRLEN: usize = 16;
const IFADDRMSG_LEN: usize = 8;

const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Result of one nonblocking receive.
#[derive(Debug)]
pub enum RecvStatus {
    /// `buf[..len]` holds a complete datagram.
    Data(usize),
    /// The datagram exceeded the buffer; the kernel reported its real size.
    Truncated(usize),
    /// Nothing to read right now.
    WouldBlock,
}

/// A bound, nonblocking `NETLINK_ROUTE` socket.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    /// Open and bind with the given multicast group subscription.
    pub fn open(groups: u32) -> io::Result<Self> {
        // SAFETY: plain socket(2) call, arguments are constants.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let socket = Self { fd };

        // SAFETY: sockaddr_nl is plain-old-data, fully initialized below.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = groups;
        // SAFETY: fd is a valid socket, addr points to a live sockaddr_nl.
        let rc = unsafe {
            libc::bind(
                socket.fd,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(socket)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Ask the kernel to dump the current address table; replies arrive as
    /// a series of `RTM_NEWADDR` messages terminated by `NLMSG_DONE`.
    pub fn request_addr_dump(&self) -> io::Result<()> {
        let mut message = [0u8; NLMSG_HDRLEN + 4];
        let len = message.len() as u32;
        message[0..4].copy_from_slice(&len.to_ne_bytes());
        message[4..6].copy_from_slice(&RTM_GETADDR.to_ne_bytes());
        message[6..8].copy_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
        message[8..12].copy_from_slice(&1u32.to_ne_bytes()); // nlmsg_seq
        // nlmsg_pid stays 0 (kernel); rtgenmsg family:
        message[NLMSG_HDRLEN] = libc::AF_PACKET as u8;

        // SAFETY: fd is a valid socket, message is a live buffer.
        let rc = unsafe {
            libc::send(
                self.fd,
                message.as_ptr().cast::<libc::c_void>(),
                message.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Nonblocking receive of one datagram. `MSG_TRUNC` makes the kernel
    /// report the full datagram size even when the buffer was too small.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<RecvStatus> {
        // SAFETY: fd is a valid socket, buf is a live mutable buffer.
        let rc = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                libc::MSG_TRUNC,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(RecvStatus::WouldBlock);
            }
            return Err(err);
        }
        let len = rc as usize;
        if len > buf.len() {
            Ok(RecvStatus::Truncated(len))
        } else {
            Ok(RecvStatus::Data(len))
        }
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // SAFETY: fd was returned by socket(2) and is owned by this value.
        unsafe { libc::close(self.fd) };
    }
}

/// An interface-address message (`RTM_NEWADDR`/`RTM_DELADDR`) decoded from
/// its `ifaddrmsg` and attributes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddrMessage {
    pub family: u8,
    pub addr_flags: u8,
    pub if_index: u32,
    pub label: Option<String>,
    pub v4_local: Option<Ipv4Addr>,
    pub v6_addr: Option<Ipv6Addr>,
}

/// One decoded entry of a datagram.
#[derive(Debug)]
pub enum Message {
    Addr { msg_type: u16, addr: AddrMessage },
    Done,
    Error,
    Overrun,
    Other,
}

/// Walk a received datagram. Stops cleanly at the end of the buffer; a
/// header that claims more bytes than remain yields `Error` (the caller
/// re-requests the table).
pub fn messages(buf: &[u8]) -> MessageIter<'_> {
    MessageIter { rest: buf }
}

pub struct MessageIter<'a> {
    rest: &'a [u8],
}

impl Iterator for MessageIter<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < NLMSG_HDRLEN {
            self.rest = &[];
            return Some(Message::Error);
        }

        let msg_len = read_u32(self.rest, 0) as usize;
        let msg_type = read_u16(self.rest, 4);
        let total = align4(msg_len);
        if msg_len < NLMSG_HDRLEN || total > self.rest.len() {
            self.rest = &[];
            return Some(Message::Error);
        }

        let payload = &self.rest[NLMSG_HDRLEN..msg_len];
        self.rest = if total >= self.rest.len() {
            &[]
        } else {
            &self.rest[total..]
        };

        match msg_type {
            NLMSG_DONE => Some(Message::Done),
            NLMSG_ERROR => Some(Message::Error),
            NLMSG_OVERRUN => Some(Message::Overrun),
            NLMSG_NOOP => Some(Message::Other),
            RTM_NEWADDR | RTM_DELADDR => match parse_addr(payload) {
                Some(addr) => Some(Message::Addr { msg_type, addr }),
                None => Some(Message::Other),
            },
            _ => Some(Message::Other),
        }
    }
}

fn parse_addr(payload: &[u8]) -> Option<AddrMessage> {
    if payload.len() < IFADDRMSG_LEN {
        return None;
    }
    let mut message = AddrMessage {
        family: payload[0],
        addr_flags: payload[2],
        if_index: read_u32(payload, 4),
        ..AddrMessage::default()
    };

    let mut rest = &payload[IFADDRMSG_LEN..];
    while rest.len() >= 4 {
        let rta_len = read_u16(rest, 0) as usize;
        let rta_type = read_u16(rest, 2);
        if rta_len < 4 || rta_len > rest.len() {
            break;
        }
        let data = &rest[4..rta_len];
        match rta_type {
            IFA_LABEL => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                message.label = Some(String::from_utf8_lossy(&data[..end]).into_owned());
            }
            IFA_LOCAL => {
                if message.family == libc::AF_INET as u8 && data.len() >= 4 {
                    let octets: [u8; 4] = [data[0], data[1], data[2], data[3]];
                    message.v4_local = Some(Ipv4Addr::from(octets));
                }
            }
            IFA_ADDRESS => {
                if message.family == libc::AF_INET6 as u8 && data.len() >= 16 {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&data[..16]);
                    message.v6_addr = Some(Ipv6Addr::from(octets));
                }
            }
            _ => {}
        }
        let advance = align4(rta_len);
        if advance >= rest.len() {
            break;
        }
        rest = &rest[advance..];
    }

    Some(message)
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Resolve an interface name from its index.
pub fn interface_name(index: u32) -> Option<String> {
    let mut name = [0u8; libc::IF_NAMESIZE];
    // SAFETY: name is a live buffer of IF_NAMESIZE bytes as required.
    let rc = unsafe { libc::if_indextoname(index, name.as_mut_ptr().cast::<libc::c_char>()) };
    if rc.is_null() {
        return None;
    }
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    Some(String::from_utf8_lossy(&name[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a synthetic RTM_NEWADDR/RTM_DELADDR datagram.
    fn addr_datagram(
        msg_type: u16,
        family: u8,
        flags: u8,
        if_index: u32,
        attrs: &[(u16, Vec<u8>)],
    ) -> Vec<u8> {
        let mut payload = vec![family, 24, flags, 0];
        payload.extend_from_slice(&if_index.to_ne_bytes());
        for (rta_type, data) in attrs {
            let rta_len = (4 + data.len()) as u16;
            payload.extend_from_slice(&rta_len.to_ne_bytes());
            payload.extend_from_slice(&rta_type.to_ne_bytes());
            payload.extend_from_slice(data);
            while payload.len() % 4 != 0 {
                payload.push(0);
            }
        }

        let msg_len = (NLMSG_HDRLEN + payload.len()) as u32;
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&msg_len.to_ne_bytes());
        datagram.extend_from_slice(&msg_type.to_ne_bytes());
        datagram.extend_from_slice(&0u16.to_ne_bytes());
        datagram.extend_from_slice(&0u32.to_ne_bytes());
        datagram.extend_from_slice(&0u32.to_ne_bytes());
        datagram.extend_from_slice(&payload);
        datagram
    }

    #[test]
    fn parses_ipv4_address_message() {
        let datagram = addr_datagram(
            RTM_NEWADDR,
            libc::AF_INET as u8,
            0,
            2,
            &[
                (IFA_LOCAL, vec![192, 168, 1, 10]),
                (IFA_LABEL, b"eth0\0".to_vec()),
            ],
        );
        let parsed: Vec<_> = messages(&datagram).collect();
        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            Message::Addr { msg_type, addr } => {
                assert_eq!(*msg_type, RTM_NEWADDR);
                assert_eq!(addr.if_index, 2);
                assert_eq!(addr.label.as_deref(), Some("eth0"));
                assert_eq!(addr.v4_local, Some(Ipv4Addr::new(192, 168, 1, 10)));
                assert_eq!(addr.v6_addr, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_ipv6_address_message() {
        let v6: Ipv6Addr = "fe80::1234".parse().unwrap();
        let datagram = addr_datagram(
            RTM_DELADDR,
            libc::AF_INET6 as u8,
            0,
            3,
            &[(IFA_ADDRESS, v6.octets().to_vec())],
        );
        let parsed: Vec<_> = messages(&datagram).collect();
        match &parsed[0] {
            Message::Addr { msg_type, addr } => {
                assert_eq!(*msg_type, RTM_DELADDR);
                assert_eq!(addr.v6_addr, Some(v6));
                assert_eq!(addr.label, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn walks_multiple_messages_and_done() {
        let mut buf = addr_datagram(
            RTM_NEWADDR,
            libc::AF_INET as u8,
            0,
            1,
            &[(IFA_LOCAL, vec![10, 0, 0, 1])],
        );
        let mut done = Vec::new();
        done.extend_from_slice(&(NLMSG_HDRLEN as u32).to_ne_bytes());
        done.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
        done.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&done);

        let parsed: Vec<_> = messages(&buf).collect();
        assert_eq!(parsed.len(), 2);
        assert!(matches!(parsed[0], Message::Addr { .. }));
        assert!(matches!(parsed[1], Message::Done));
    }

    #[test]
    fn oversized_header_yields_error() {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[0..4].copy_from_slice(&1000u32.to_ne_bytes());
        buf[4..6].copy_from_slice(&RTM_NEWADDR.to_ne_bytes());
        let parsed: Vec<_> = messages(&buf).collect();
        assert_eq!(parsed.len(), 1);
        assert!(matches!(parsed[0], Message::Error));
    }

    #[test]
    fn truncated_buffer_yields_error() {
        let parsed: Vec<_> = messages(&[1, 2, 3]).collect();
        assert!(matches!(parsed[0], Message::Error));
    }
}
