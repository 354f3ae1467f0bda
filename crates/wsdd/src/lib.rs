// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # wsdd - WS-Discovery responder daemon
//!
//! Makes a host advertise itself as a Windows-compatible Computer on the
//! local network, so Windows clients browsing "Network" can find it
//! (typically in front of a Samba share).
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      Supervision loop                        |
//! |     mio::Poll | timers | signal pipe | token routing         |
//! +--------------------------------------------------------------+
//! |  Interface monitor  ->  Server manager (one per address)     |
//! |   netlink route socket      map<addr, WSD instance>          |
//! +--------------------------------------------------------------+
//! |        UDP endpoint           |        HTTP endpoint          |
//! |  3702, multicast group join   |  5357, POST /<uuid> only      |
//! +--------------------------------------------------------------+
//! |            WS-Discovery protocol machine                     |
//! |  Hello/Bye | Probe/Resolve/Get | dedup LRU | AppSequence     |
//! +--------------------------------------------------------------+
//! |                SOAP envelopes (quick-xml / roxmltree)        |
//! +--------------------------------------------------------------+
//! ```
//!
//! Everything runs on one thread; sockets, retransmission timers and
//! signals all go through a single `mio::Poll`.

/// Configuration snapshot (CLI + TOML file).
pub mod config;
/// Process-wide logger behind the `log` facade.
pub mod logging;
/// Per-address server bookkeeping and monitor-event reconciliation.
pub mod manager;
/// Interface model, route-socket monitor.
pub mod net;
/// The single-threaded event loop, timers and signal plumbing.
pub mod runtime;
/// SOAP envelope construction and inspection.
pub mod soap;
/// UDP multicast and HTTP endpoints.
pub mod transport;
/// The WS-Discovery protocol machine.
pub mod wsd;

pub use config::{Config, ConfigError, FileConfig, Options};
pub use runtime::{DaemonStatus, RunOutcome};

/// wsdd version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
