//! FeOx-reactor: the multi-loop event engine behind FeOx-server
//!
//! This crate provides the non-blocking networking core of a Redis-like
//! server: listeners, one readiness loop per thread, connection lifecycle
//! management, and a callback surface for the protocol layer.
//!
//! # Architecture
//!
//! - One mio poller per loop, each loop on its own thread
//! - Every loop races on every listener; a load-balancing policy decides
//!   which one accepts
//! - Connections never migrate: the accepting loop owns them until close
//! - Protocol logic plugs in through the [`EventHandler`] trait
//!
//! # Example
//!
//! ```no_run
//! use bytes::BytesMut;
//! use feox_reactor::{Action, Conn, EventHandler, Input};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     type Client = ();
//!
//!     fn accepted(&self, _conn: &Conn, _unix: bool) -> (Option<()>, Action) {
//!         (Some(()), Action::None)
//!     }
//!
//!     fn data(&self, _: &Conn, _: &mut (), input: Option<Input<'_>>, out: &mut BytesMut) -> Action {
//!         if let Some(input) = input {
//!             out.extend_from_slice(&input);
//!         }
//!         Action::None
//!     }
//! }
//!
//! # fn main() -> feox_reactor::Result<()> {
//! feox_reactor::serve(Echo, &["tcp://127.0.0.1:6380"])
//! # }
//! ```

/// Load-balancing policies for multi-loop accept
pub mod balance;

/// Configuration management for the server
pub mod config;

/// Error types and result aliases
pub mod error;

/// Callback surface: actions, options and the handler trait
pub mod event;

mod event_loop;

/// Readiness notification (pollers) and cross-thread notes
pub mod io;

/// Listeners, connections and address parsing
pub mod network;

/// Server lifecycle
pub mod server;

pub use balance::LoadBalance;
pub use config::Config;
pub use error::{Error, Result};
pub use event::{Action, EventHandler, Input, Options, ServerInfo};
pub use network::{Addr, Conn, ConnWaker, DetachedStream};
pub use server::{serve, Server, ServerHandle, ServerState};
