// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The server manager: one WS-Discovery instance per served address.
//!
//! Owns the interface monitor and a `HashMap<IpAddr, ServerInstance>`, the
//! source of truth for which addresses are served. Monitor events are
//! reconciled into instance creation and teardown; construction failures
//! are logged and skipped so the remaining addresses keep working.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::config::Config;
use crate::net::monitor::{InterfaceMonitor, MonitorEvent};
use crate::net::NetworkInterface;
use crate::runtime::{Context, Route};
use crate::transport::http::{ConnAction, HttpEndpoint};
use crate::transport::udp::UdpEndpoint;
use crate::transport::{MULTICAST_SEND_COUNT, UNICAST_SEND_COUNT};
use crate::wsd::{WsdServer, WsdState};

/// Where repeated transmissions of a message go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendTarget {
    Multicast,
    Unicast(SocketAddr),
}

/// Runs after the last repetition of a message went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    None,
    /// The Bye is out; tear the instance down.
    ByeDone,
}

/// An in-flight message with its remaining repetitions.
#[derive(Debug)]
struct Transmission {
    payload: Vec<u8>,
    target: SendTarget,
    remaining: u32,
    completion: Completion,
}

/// One served address: the protocol machine plus its two endpoints.
struct ServerInstance {
    server: WsdServer,
    udp: UdpEndpoint,
    http: HttpEndpoint,
    udp_token: mio::Token,
    http_token: mio::Token,
    conn_tokens: HashMap<u64, mio::Token>,
    transmissions: HashMap<u64, Transmission>,
}

pub struct ServerManager {
    config: Arc<Config>,
    monitor: InterfaceMonitor,
    monitor_token: mio::Token,
    servers: HashMap<IpAddr, ServerInstance>,
    next_transmission_id: u64,
}

impl ServerManager {
    /// Create the manager and its interface monitor; the monitor socket is
    /// registered immediately and its initial dump will populate the map.
    pub fn start(config: Arc<Config>, ctx: &mut Context<'_>) -> io::Result<Self> {
        let monitor = InterfaceMonitor::start(Arc::clone(&config))?;
        let monitor_token = ctx.alloc(Route::Monitor);
        ctx.register_fd(monitor.as_raw_fd(), monitor_token)?;
        Ok(Self {
            config,
            monitor,
            monitor_token,
            servers: HashMap::new(),
            next_transmission_id: 0,
        })
    }

    /// True once every instance is gone and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.servers.is_empty()
    }

    /// Drain the route socket. An `Err` here is terminal for the process.
    pub fn on_monitor_readable(&mut self, ctx: &mut Context<'_>) -> io::Result<()> {
        let events = self.monitor.drain().map_err(|err| {
            log::error!("error reading from netlink socket: {}", err);
            err
        })?;
        for event in events {
            match event {
                MonitorEvent::AddressAdded { iface, addr } => self.add_address(&iface, addr, ctx),
                MonitorEvent::AddressRemoved { iface, addr } => {
                    self.remove_address(&iface, addr, ctx);
                }
            }
        }
        Ok(())
    }

    fn add_address(&mut self, iface: &NetworkInterface, addr: IpAddr, ctx: &mut Context<'_>) {
        if let Some(existing) = self.servers.get(&addr) {
            if existing.server.iface() == iface && existing.server.state() == WsdState::Running {
                return;
            }
            log::info!("Replacing WSD server on {} for {}", iface, addr);
            self.teardown(addr, ctx);
        }

        match self.build_instance(iface, addr, ctx) {
            Ok(instance) => {
                self.servers.insert(addr, instance);
                self.announce_hello(addr, ctx);
            }
            Err(err) => {
                log::error!("Unable to serve {} on {}: {}", addr, iface, err);
            }
        }
    }

    fn remove_address(&mut self, iface: &NetworkInterface, addr: IpAddr, ctx: &mut Context<'_>) {
        let matches = self
            .servers
            .get(&addr)
            .is_some_and(|instance| instance.server.iface() == iface);
        if matches {
            log::info!("Address {} on {} is gone", addr, iface);
            self.teardown(addr, ctx);
        }
    }

    fn build_instance(
        &mut self,
        iface: &NetworkInterface,
        addr: IpAddr,
        ctx: &mut Context<'_>,
    ) -> io::Result<ServerInstance> {
        let server = WsdServer::new(Arc::clone(&self.config), iface.clone(), addr);
        let mut udp = UdpEndpoint::new(&self.config, iface, addr)?;
        let mut http = HttpEndpoint::new(&self.config.http_path, addr, iface.index)?;

        let udp_token = ctx.alloc(Route::UdpRecv(addr));
        if let Err(err) = udp.register(ctx.registry, udp_token) {
            ctx.free(udp_token);
            return Err(err);
        }
        let http_token = ctx.alloc(Route::HttpListener(addr));
        if let Err(err) = http.register(ctx.registry, http_token) {
            udp.deregister(ctx.registry);
            ctx.free(udp_token);
            ctx.free(http_token);
            return Err(err);
        }

        Ok(ServerInstance {
            server,
            udp,
            http,
            udp_token,
            http_token,
            conn_tokens: HashMap::new(),
            transmissions: HashMap::new(),
        })
    }

    fn announce_hello(&mut self, addr: IpAddr, ctx: &mut Context<'_>) {
        let payload = {
            let Some(instance) = self.servers.get_mut(&addr) else {
                return;
            };
            match instance.server.start() {
                Ok(payload) => payload,
                Err(err) => {
                    log::error!("error starting WSD server on {}: {}", addr, err);
                    self.teardown(addr, ctx);
                    return;
                }
            }
        };
        self.start_transmission(
            addr,
            payload,
            SendTarget::Multicast,
            MULTICAST_SEND_COUNT,
            Completion::None,
            ctx,
        );
    }

    /// First transmission now, the rest on jittered timers.
    fn start_transmission(
        &mut self,
        addr: IpAddr,
        payload: Vec<u8>,
        target: SendTarget,
        count: u32,
        completion: Completion,
        ctx: &mut Context<'_>,
    ) {
        let Some(instance) = self.servers.get_mut(&addr) else {
            return;
        };

        if let Err(err) = instance.send(&payload, target) {
            log::error!(
                "UDP server on {}, error writing: {}",
                instance.server.iface(),
                err
            );
            self.on_fatal_udp_error(addr, ctx);
            return;
        }

        if count <= 1 {
            if completion == Completion::ByeDone {
                self.teardown(addr, ctx);
            }
            return;
        }

        let id = self.next_transmission_id;
        self.next_transmission_id += 1;
        instance.transmissions.insert(
            id,
            Transmission {
                payload,
                target,
                remaining: count - 1,
                completion,
            },
        );
        ctx.schedule_retransmit(addr, id);
    }

    /// A retransmission timer fired. Stale events (instance or record gone)
    /// are ignored.
    pub fn on_timer(&mut self, addr: IpAddr, transmission: u64, ctx: &mut Context<'_>) {
        let Some(instance) = self.servers.get_mut(&addr) else {
            return;
        };
        let Some(record) = instance.transmissions.get_mut(&transmission) else {
            return;
        };

        let sent = match record.target {
            SendTarget::Multicast => instance.udp.send_multicast(&record.payload),
            SendTarget::Unicast(dest) => instance.udp.send_unicast(&record.payload, dest),
        };
        if let Err(err) = sent {
            log::error!(
                "UDP server on {}, error writing: {}",
                instance.server.iface(),
                err
            );
            let completion = record.completion;
            instance.transmissions.remove(&transmission);
            if completion == Completion::ByeDone {
                self.teardown(addr, ctx);
            } else {
                self.on_fatal_udp_error(addr, ctx);
            }
            return;
        }

        record.remaining -= 1;
        if record.remaining > 0 {
            ctx.schedule_retransmit(addr, transmission);
            return;
        }

        let completion = record.completion;
        instance.transmissions.remove(&transmission);
        if completion == Completion::ByeDone {
            self.teardown(addr, ctx);
        }
    }

    /// Datagrams are ready on the receive socket of `addr`.
    pub fn on_udp_readable(&mut self, addr: IpAddr, ctx: &mut Context<'_>) {
        let mut replies = Vec::new();
        {
            let Some(instance) = self.servers.get_mut(&addr) else {
                return;
            };
            loop {
                match instance.udp.recv_one() {
                    Ok(Some(datagram)) => {
                        log::debug!(
                            "UDP on {}, received {} bytes from {}",
                            instance.server.iface(),
                            datagram.payload.len(),
                            datagram.source
                        );
                        if let Some(reply) = instance.server.handle_udp(&datagram.payload) {
                            replies.push((reply, datagram.source));
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        log::error!(
                            "UDP server on {}, error reading: {}",
                            instance.server.iface(),
                            err
                        );
                        self.on_fatal_udp_error(addr, ctx);
                        return;
                    }
                }
            }
        }
        for (reply, source) in replies {
            self.start_transmission(
                addr,
                reply,
                SendTarget::Unicast(source),
                UNICAST_SEND_COUNT,
                Completion::None,
                ctx,
            );
        }
    }

    /// The HTTP listener of `addr` has pending connections.
    pub fn on_http_accept(&mut self, addr: IpAddr, ctx: &mut Context<'_>) {
        loop {
            let Some(instance) = self.servers.get_mut(&addr) else {
                return;
            };
            match instance.http.accept_one() {
                Ok(Some(conn_id)) => {
                    let token = ctx.alloc(Route::HttpConn(addr, conn_id));
                    let Some(connection) = instance.http.connection_mut(conn_id) else {
                        ctx.free(token);
                        continue;
                    };
                    if let Err(err) = ctx.registry.register(
                        connection.source(),
                        token,
                        mio::Interest::READABLE | mio::Interest::WRITABLE,
                    ) {
                        log::debug!("error registering HTTP connection: {}", err);
                        instance.http.close_connection(conn_id, ctx.registry);
                        ctx.free(token);
                        continue;
                    }
                    instance.conn_tokens.insert(conn_id, token);
                }
                Ok(None) => return,
                Err(err) => {
                    log::error!(
                        "HTTP server on {}, error accepting: {}",
                        instance.server.iface(),
                        err
                    );
                    self.on_fatal_http_error(addr, ctx);
                    return;
                }
            }
        }
    }

    /// Readiness on one HTTP connection.
    pub fn on_http_conn_event(
        &mut self,
        addr: IpAddr,
        conn_id: u64,
        readable: bool,
        writable: bool,
        ctx: &mut Context<'_>,
    ) {
        let Some(instance) = self.servers.get_mut(&addr) else {
            return;
        };
        let ServerInstance {
            server,
            http,
            conn_tokens,
            ..
        } = instance;
        let Some(connection) = http.connection_mut(conn_id) else {
            return;
        };

        let mut action = ConnAction::Keep;
        if writable {
            action = connection.on_writable();
        }
        if readable && action == ConnAction::Keep {
            let mut handler = |body: &[u8]| server.handle_http(body);
            action = connection.on_readable(&mut handler);
        }

        if action == ConnAction::Close {
            http.close_connection(conn_id, ctx.registry);
            if let Some(token) = conn_tokens.remove(&conn_id) {
                ctx.free(token);
            }
        }
    }

    /// Ask every instance to stop. Graceful sends a Bye first and defers
    /// teardown to the last Bye repetition; non-graceful tears down now.
    pub fn stop(&mut self, graceful: bool, ctx: &mut Context<'_>) {
        let addrs: Vec<IpAddr> = self.servers.keys().copied().collect();
        if graceful {
            for addr in addrs {
                let payload = {
                    let Some(instance) = self.servers.get_mut(&addr) else {
                        continue;
                    };
                    if instance.server.state() != WsdState::Running {
                        self.teardown(addr, ctx);
                        continue;
                    }
                    match instance.server.bye_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            log::error!("error building Bye for {}: {}", addr, err);
                            self.teardown(addr, ctx);
                            continue;
                        }
                    }
                };
                self.start_transmission(
                    addr,
                    payload,
                    SendTarget::Multicast,
                    MULTICAST_SEND_COUNT,
                    Completion::ByeDone,
                    ctx,
                );
            }
        } else {
            for addr in addrs {
                self.teardown(addr, ctx);
            }
        }
    }

    /// Final manager shutdown: drop the monitor registration.
    pub fn shutdown_monitor(&mut self, ctx: &mut Context<'_>) {
        log::info!("Stopping interface monitor");
        ctx.deregister_fd(self.monitor.as_raw_fd());
        ctx.free(self.monitor_token);
    }

    fn on_fatal_udp_error(&mut self, addr: IpAddr, ctx: &mut Context<'_>) {
        self.teardown(addr, ctx);
    }

    fn on_fatal_http_error(&mut self, addr: IpAddr, ctx: &mut Context<'_>) {
        self.teardown(addr, ctx);
    }

    /// Non-graceful stop of one instance: close sockets, free tokens,
    /// erase the entry. Pending timers for it become stale no-ops.
    fn teardown(&mut self, addr: IpAddr, ctx: &mut Context<'_>) {
        let Some(mut instance) = self.servers.remove(&addr) else {
            return;
        };
        log::info!("Stopping UDP server on {}", instance.server.iface());
        log::info!("Stopping HTTP server on {}", instance.server.iface());
        instance.udp.deregister(ctx.registry);
        instance.http.deregister(ctx.registry);
        ctx.free(instance.udp_token);
        ctx.free(instance.http_token);
        for (_, token) in instance.conn_tokens.drain() {
            ctx.free(token);
        }
        instance.server.mark_stopped();
    }
}

impl ServerInstance {
    fn send(&self, payload: &[u8], target: SendTarget) -> io::Result<()> {
        match target {
            SendTarget::Multicast => self.udp.send_multicast(payload),
            SendTarget::Unicast(dest) => self.udp.send_unicast(payload, dest),
        }
    }
}
