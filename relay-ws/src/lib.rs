//! Per-tenant WebSocket connection hub (C5).
//!
//! Owns connection bookkeeping, broadcast fan-out, and keepalive; the
//! actual socket half is a transport concern the server binary supplies
//! through [`connection::ConnectionSink`].

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod connection;
pub mod hub;
pub mod message;
pub mod pubsub;

pub use connection::{ConnectionSink, SendError};
pub use hub::{ConnectionInfo, WebSocketHub};
