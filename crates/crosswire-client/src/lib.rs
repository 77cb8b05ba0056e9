//! # crosswire-client
//!
//! The initiating side of the Crosswire protocol: a [`Client`] dials a hub
//! over WebSocket, re-establishes the connection after loss on a capped
//! exponential schedule, serves events the hub pushes through the same
//! middleware/handler pipeline the hub uses, and issues reply-awaited
//! fetches of its own.

#![deny(unsafe_code)]

pub mod client;
pub mod error;
pub mod state;

pub use client::{Client, ClientConfig};
pub use error::ClientError;
pub use state::ConnectionState;
