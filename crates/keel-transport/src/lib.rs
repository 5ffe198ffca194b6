//! Keel Transport Layer
//!
//! WebSocket transport for the Keel session runtime. The transport handles:
//! - Connection lifecycle (open, message, close)
//! - The handshake that binds a connection to a principal
//! - A single outbound writer queue per connection, shared by responses and
//!   notifications
//! - Handing every request off to its own task so the socket loop never waits
//!   on domain work
//!
//! The transport is decoupled from session logic via the `RequestHandler` trait.

pub mod client;
pub mod server;

pub use client::{ClientConnection, ClientNotifier, NotifyError};
pub use server::{RequestHandler, TransportConfig, TransportError, TransportServer};
