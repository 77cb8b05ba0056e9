//! # crosswire-hub
//!
//! The accepting side of the Crosswire protocol. A [`Hub`] owns the set of
//! live peers, their group memberships, the pending-request tracker, and
//! the dispatch pipeline; [`ws::router`] mounts the WebSocket endpoint on a
//! host-provided axum listener (the hub never listens itself).

#![deny(unsafe_code)]

pub mod config;
pub mod fetch;
pub mod groups;
pub mod hooks;
pub mod hub;
pub mod peer;
pub mod ws;

pub use config::HubConfig;
pub use groups::GroupRegistry;
pub use hooks::{ConnectionHooks, NoopHooks};
pub use hub::Hub;
pub use peer::Peer;
