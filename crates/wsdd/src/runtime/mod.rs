// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The supervision loop.
//!
//! One single-threaded `mio::Poll` drives every socket, retransmission
//! timer and the signal pipe. All state mutation happens on this thread;
//! components get a [`Context`] handle for token allocation, socket
//! registration, jittered timer scheduling and the shared PRNG.
//!
//! Signal handling follows the self-pipe pattern: handlers write a byte to
//! a socketpair and set a per-signal flag; the loop wakes up, inspects the
//! flags and begins a graceful stop (Bye first, close after the last
//! repetition).

pub mod timers;

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

use self::timers::{TimerEvent, TimerQueue};
use crate::config::Config;
use crate::manager::ServerManager;
use crate::transport::{RETRANSMIT_DELAY_MAX_MS, RETRANSMIT_DELAY_MIN_MS};

/// What a readiness token maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Signal,
    Monitor,
    UdpRecv(IpAddr),
    HttpListener(IpAddr),
    HttpConn(IpAddr, u64),
}

/// Why the serve cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Terminated,
    ReloadRequested,
}

/// Status surfaced to the daemon supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Ready,
    Reloading,
    Stopping,
}

pub fn notify(status: DaemonStatus) {
    log::debug!("daemon status: {:?}", status);
}

/// Loop services handed to components: registration, token routing,
/// timers and jitter.
pub struct Context<'a> {
    pub registry: &'a mio::Registry,
    routes: &'a mut HashMap<Token, Route>,
    next_token: &'a mut usize,
    timers: &'a mut TimerQueue,
    rng: &'a mut fastrand::Rng,
}

impl Context<'_> {
    pub fn alloc(&mut self, route: Route) -> Token {
        let token = Token(*self.next_token);
        *self.next_token += 1;
        self.routes.insert(token, route);
        token
    }

    pub fn free(&mut self, token: Token) {
        self.routes.remove(&token);
    }

    pub fn register_fd(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    pub fn deregister_fd(&mut self, fd: RawFd) {
        let _ = self.registry.deregister(&mut SourceFd(&fd));
    }

    /// Queue the next repetition of a message after a uniformly-random
    /// 50-250 ms delay.
    pub fn schedule_retransmit(&mut self, addr: IpAddr, transmission: u64) {
        let delay = Duration::from_millis(
            self.rng
                .u64(RETRANSMIT_DELAY_MIN_MS..=RETRANSMIT_DELAY_MAX_MS),
        );
        self.timers.schedule(delay, TimerEvent { addr, transmission });
    }
}

struct SignalPipe {
    read: mio::net::UnixStream,
    terminate: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl SignalPipe {
    fn install() -> io::Result<Self> {
        let (read, write) = std::os::unix::net::UnixStream::pair()?;
        read.set_nonblocking(true)?;
        write.set_nonblocking(true)?;

        for signal in [SIGINT, SIGTERM, SIGHUP] {
            signal_hook::low_level::pipe::register(signal, write.try_clone()?)?;
        }
        let terminate = Arc::new(AtomicBool::new(false));
        let interrupt = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, Arc::clone(&terminate))?;
        signal_hook::flag::register(SIGINT, Arc::clone(&interrupt))?;
        signal_hook::flag::register(SIGHUP, Arc::clone(&reload))?;

        Ok(Self {
            read: mio::net::UnixStream::from_std(read),
            terminate,
            interrupt,
            reload,
        })
    }

    fn drain(&mut self) {
        let mut buf = [0u8; 16];
        while matches!(self.read.read(&mut buf), Ok(len) if len > 0) {}
    }

    fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    fn take_terminate(&self) -> bool {
        self.terminate.swap(false, Ordering::SeqCst) | self.interrupt.swap(false, Ordering::SeqCst)
    }
}

/// One serve cycle: build the manager, run until a signal asks for
/// termination or reload, drain the graceful Bye, tear down.
pub fn serve(config: Arc<Config>, rng: &mut fastrand::Rng) -> io::Result<RunOutcome> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);
    let mut routes: HashMap<Token, Route> = HashMap::new();
    let mut next_token = 0usize;
    let mut timers = TimerQueue::new();

    log::info!("Starting processing");

    let mut signals = SignalPipe::install()?;
    let signal_token = {
        let mut ctx = Context {
            registry: poll.registry(),
            routes: &mut routes,
            next_token: &mut next_token,
            timers: &mut timers,
            rng: &mut *rng,
        };
        ctx.alloc(Route::Signal)
    };
    poll.registry()
        .register(&mut signals.read, signal_token, Interest::READABLE)?;

    let mut manager = {
        let mut ctx = Context {
            registry: poll.registry(),
            routes: &mut routes,
            next_token: &mut next_token,
            timers: &mut timers,
            rng: &mut *rng,
        };
        ServerManager::start(Arc::clone(&config), &mut ctx)?
    };

    let mut shutting_down = false;
    let mut outcome = RunOutcome::Terminated;
    let result = loop {
        if shutting_down && manager.is_idle() {
            break Ok(outcome);
        }

        let timeout = timers.next_timeout(Instant::now());
        if let Err(err) = poll.poll(&mut events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break Err(err);
        }

        // Fire due timers first so retransmissions are not starved by a
        // busy socket.
        let now = Instant::now();
        loop {
            let due = timers.pop_due(now);
            let Some(event) = due else { break };
            let mut ctx = Context {
                registry: poll.registry(),
                routes: &mut routes,
                next_token: &mut next_token,
                timers: &mut timers,
                rng: &mut *rng,
            };
            manager.on_timer(event.addr, event.transmission, &mut ctx);
        }

        let ready: Vec<(Token, bool, bool)> = events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        let mut fatal = None;
        for (token, readable, writable) in ready {
            let Some(route) = routes.get(&token).copied() else {
                continue;
            };
            let mut ctx = Context {
                registry: poll.registry(),
                routes: &mut routes,
                next_token: &mut next_token,
                timers: &mut timers,
                rng: &mut *rng,
            };
            match route {
                Route::Signal => {
                    signals.drain();
                    if signals.take_reload() {
                        log::info!("Received signal: SIGHUP");
                        outcome = RunOutcome::ReloadRequested;
                    }
                    if signals.take_terminate() {
                        log::info!("Received termination signal");
                    }
                    if shutting_down {
                        // Second request: stop waiting for the Bye.
                        manager.stop(false, &mut ctx);
                    } else {
                        shutting_down = true;
                        manager.stop(true, &mut ctx);
                    }
                }
                Route::Monitor => {
                    if let Err(err) = manager.on_monitor_readable(&mut ctx) {
                        fatal = Some(err);
                        break;
                    }
                }
                Route::UdpRecv(addr) => manager.on_udp_readable(addr, &mut ctx),
                Route::HttpListener(addr) => manager.on_http_accept(addr, &mut ctx),
                Route::HttpConn(addr, conn_id) => {
                    manager.on_http_conn_event(addr, conn_id, readable, writable, &mut ctx);
                }
            }
        }
        if let Some(err) = fatal {
            break Err(err);
        }
    };

    let mut ctx = Context {
        registry: poll.registry(),
        routes: &mut routes,
        next_token: &mut next_token,
        timers: &mut timers,
        rng: &mut *rng,
    };
    manager.stop(false, &mut ctx);
    manager.shutdown_monitor(&mut ctx);
    let _ = poll.registry().deregister(&mut signals.read);

    log::info!("Stopped processing");
    result
}
