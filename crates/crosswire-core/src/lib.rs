//! # crosswire-core
//!
//! Protocol building blocks shared by both endpoint roles of Crosswire, a
//! request/response layer over a persistent full-duplex transport.
//!
//! This crate provides the vocabulary the hub and client crates depend on:
//!
//! - **Envelope**: the wire-level container distinguishing event vs reply
//!   frames, with the `fetchId` correlation field
//! - **PendingTracker**: bookkeeping for outstanding reply-awaited sends,
//!   with deadline timers and per-owner bulk cancellation
//! - **Pipeline**: ordered middleware plus first-responder-wins event
//!   handlers
//! - **Replier**: the one-shot reply capability handed to handlers
//! - **Config**: fetch defaults, per-call overrides, reconnect parameters
//! - **Errors**: `FetchError`, `GroupError`, `ProtocolError` via `thiserror`

#![deny(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod pipeline;
pub mod reply;
pub mod tracker;

pub use config::{FetchConfig, FetchOptions, ReconnectConfig};
pub use envelope::{Envelope, EnvelopeKind, MessageBody, SYSTEM_ID_EVENT, codes};
pub use errors::{DisconnectReason, FetchError, FetchOutcome, GroupError, HandlerError, ProtocolError};
pub use ids::{FetchId, PeerId};
pub use pipeline::{EventContext, EventHandler, Pipeline};
pub use reply::{OutboundSink, Replier};
pub use tracker::PendingTracker;
