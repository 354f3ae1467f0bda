// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-address UDP multicast endpoint.
//!
//! Three sockets per served address: a receiver bound to the discovery
//! group and joined on the interface, a unicast sender bound to
//! `(addr, 3702)` for replies, and a multicast sender with loopback
//! disabled and the configured hop limit. All nonblocking, driven by the
//! event loop.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::os::fd::AsRawFd;

use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};

use crate::config::Config;
use crate::net::NetworkInterface;
use crate::transport::{MAX_WSD_DATAGRAM, WSD_MCAST_GROUP_V4, WSD_MCAST_GROUP_V6, WSD_UDP_PORT};

/// A datagram pulled off the receive socket.
#[derive(Debug)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub source: SocketAddr,
}

pub struct UdpEndpoint {
    iface: NetworkInterface,
    recv_socket: mio::net::UdpSocket,
    unicast_socket: mio::net::UdpSocket,
    multicast_socket: mio::net::UdpSocket,
    multicast_dest: SocketAddr,
    recv_buf: Vec<u8>,
    is_v4: bool,
}

impl UdpEndpoint {
    pub fn new(config: &Config, iface: &NetworkInterface, addr: IpAddr) -> io::Result<Self> {
        let (recv, unicast, multicast, dest) = match addr {
            IpAddr::V4(v4) => Self::open_v4(config, iface, v4)?,
            IpAddr::V6(v6) => Self::open_v6(config, iface, v6)?,
        };

        log::info!("Starting UDP server on {}", iface);
        Ok(Self {
            iface: iface.clone(),
            recv_socket: mio::net::UdpSocket::from_std(recv),
            unicast_socket: mio::net::UdpSocket::from_std(unicast),
            multicast_socket: mio::net::UdpSocket::from_std(multicast),
            multicast_dest: dest,
            recv_buf: vec![0u8; MAX_WSD_DATAGRAM],
            is_v4: addr.is_ipv4(),
        })
    }

    fn open_v4(
        config: &Config,
        iface: &NetworkInterface,
        addr: Ipv4Addr,
    ) -> io::Result<(UdpSocket, UdpSocket, UdpSocket, SocketAddr)> {
        let group = WSD_MCAST_GROUP_V4;
        let dest = SocketAddr::V4(SocketAddrV4::new(group, WSD_UDP_PORT));

        let recv = new_socket(Domain::IPV4)?;
        recv.set_reuse_address(true)?;
        recv.join_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(iface.index))?;
        #[cfg(target_os = "linux")]
        recv.set_multicast_all_v4(false)?;
        set_pktinfo_v4(&recv)?;
        recv.bind(&SocketAddr::V4(SocketAddrV4::new(group, WSD_UDP_PORT)).into())?;

        let unicast = new_socket(Domain::IPV4)?;
        unicast.set_reuse_address(true)?;
        unicast.bind(&SocketAddr::V4(SocketAddrV4::new(addr, WSD_UDP_PORT)).into())?;

        let multicast = new_socket(Domain::IPV4)?;
        multicast.set_multicast_if_v4(&addr)?;
        multicast.set_multicast_loop_v4(false)?;
        multicast.set_multicast_ttl_v4(config.hop_limit)?;
        if config.source_port != 0 {
            multicast.bind(&SocketAddr::V4(SocketAddrV4::new(addr, config.source_port)).into())?;
        }

        Ok((recv.into(), unicast.into(), multicast.into(), dest))
    }

    fn open_v6(
        config: &Config,
        iface: &NetworkInterface,
        addr: std::net::Ipv6Addr,
    ) -> io::Result<(UdpSocket, UdpSocket, UdpSocket, SocketAddr)> {
        let group = WSD_MCAST_GROUP_V6;
        let dest = SocketAddr::V6(SocketAddrV6::new(group, WSD_UDP_PORT, 0, iface.index));

        let recv = new_socket(Domain::IPV6)?;
        recv.set_only_v6(true)?;
        recv.set_reuse_address(true)?;
        recv.join_multicast_v6(&group, iface.index)?;
        #[cfg(target_os = "linux")]
        recv.set_multicast_all_v6(false)?;
        recv.bind(&SocketAddr::V6(SocketAddrV6::new(group, WSD_UDP_PORT, 0, iface.index)).into())?;

        let unicast = new_socket(Domain::IPV6)?;
        unicast.set_only_v6(true)?;
        unicast.set_reuse_address(true)?;
        unicast
            .bind(&SocketAddr::V6(SocketAddrV6::new(addr, WSD_UDP_PORT, 0, iface.index)).into())?;

        let multicast = new_socket(Domain::IPV6)?;
        multicast.set_only_v6(true)?;
        multicast.set_multicast_if_v6(iface.index)?;
        multicast.set_multicast_loop_v6(false)?;
        multicast.set_multicast_hops_v6(config.hop_limit)?;
        if config.source_port != 0 {
            multicast.bind(
                &SocketAddr::V6(SocketAddrV6::new(addr, config.source_port, 0, iface.index)).into(),
            )?;
        }

        Ok((recv.into(), unicast.into(), multicast.into(), dest))
    }

    pub fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> io::Result<()> {
        registry.register(&mut self.recv_socket, token, mio::Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &mio::Registry) {
        let _ = registry.deregister(&mut self.recv_socket);
    }

    /// Receive the next datagram, dropping IPv4 traffic that arrived on a
    /// different interface. `None` means the socket is drained.
    pub fn recv_one(&mut self) -> io::Result<Option<Datagram>> {
        loop {
            if self.is_v4 {
                match recvmsg_v4(self.recv_socket.as_raw_fd(), &mut self.recv_buf) {
                    Ok((len, source, arrival_index)) => {
                        if let Some(index) = arrival_index {
                            if index != self.iface.index {
                                log::debug!(
                                    "UDP on {}, dropping datagram arrived on interface {}",
                                    self.iface,
                                    index
                                );
                                continue;
                            }
                        }
                        return Ok(Some(Datagram {
                            payload: self.recv_buf[..len].to_vec(),
                            source,
                        }));
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(err) => return Err(err),
                }
            } else {
                match self.recv_socket.recv_from(&mut self.recv_buf) {
                    Ok((len, source)) => {
                        return Ok(Some(Datagram {
                            payload: self.recv_buf[..len].to_vec(),
                            source,
                        }))
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(err) => return Err(err),
                }
            }
        }
    }

    /// One unicast transmission. A firewall-style denial is downgraded and
    /// reported as success.
    pub fn send_unicast(&self, payload: &[u8], dest: SocketAddr) -> io::Result<()> {
        log::debug!(
            "UDP on {}, sending {} bytes to {}",
            self.iface,
            payload.len(),
            dest
        );
        match self.unicast_socket.send_to(payload, dest) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                log::debug!("UDP on {}, unicast send blocked by firewall", self.iface);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("UDP on {}, send buffer full, dropping repetition", self.iface);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// One multicast transmission to the discovery group.
    pub fn send_multicast(&self, payload: &[u8]) -> io::Result<()> {
        log::debug!(
            "UDP on {}, sending {} bytes to {}",
            self.iface,
            payload.len(),
            self.multicast_dest
        );
        match self.multicast_socket.send_to(payload, self.multicast_dest) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("UDP on {}, send buffer full, dropping repetition", self.iface);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn iface(&self) -> &NetworkInterface {
        &self.iface
    }
}

fn new_socket(domain: Domain) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Enable per-datagram arrival-interface reporting.
fn set_pktinfo_v4(socket: &Socket) -> io::Result<()> {
    let enable: libc::c_int = 1;
    // SAFETY: setsockopt with a valid fd, standard option and correctly
    // sized optval pointer.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            std::ptr::addr_of!(enable).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// recvmsg with an ancillary-data buffer large enough for `in_pktinfo`.
/// Returns the payload length, source address and, when the kernel reported
/// it, the arrival interface index.
fn recvmsg_v4(fd: i32, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Option<u32>)> {
    // SAFETY: zeroed sockaddr_storage/msghdr are valid initial states.
    let mut source: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; 64];
    // SAFETY: as above.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(source).cast::<libc::c_void>();
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_buf.len() as _;

    // SAFETY: fd is a valid socket and msg references live buffers.
    let received = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut arrival_index = None;
    // SAFETY: cmsg traversal uses the kernel-filled msghdr with the libc
    // CMSG_* helpers, which keep pointers inside cmsg_buf.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
                let info = libc::CMSG_DATA(cmsg).cast::<libc::in_pktinfo>();
                arrival_index = Some((*info).ipi_ifindex as u32);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    // SAFETY: the kernel filled source with a sockaddr_in for an IPv4 socket.
    let source = unsafe {
        let sin = std::ptr::addr_of!(source).cast::<libc::sockaddr_in>();
        SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be((*sin).sin_addr.s_addr)),
            u16::from_be((*sin).sin_port),
        ))
    };

    Ok((received as usize, source, arrival_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    /// Needs a multicast-capable interface; run with --ignored on real
    /// hardware.
    #[test]
    #[ignore = "requires a multicast-capable interface"]
    fn endpoint_binds_on_loopback() {
        let config = Config::build(&Options::default()).unwrap();
        let iface = NetworkInterface::new(1, "lo");
        let endpoint = UdpEndpoint::new(&config, &iface, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(endpoint.is_ok());
    }
}
