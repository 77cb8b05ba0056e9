//! Client-side errors.

/// Failure surfaced by the client's connection lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The driver gave up: every connection attempt failed, or the client
    /// was closed before one succeeded.
    #[error("connection failed after {attempts} attempt(s)")]
    ConnectFailed {
        /// Consecutive failed attempts at the time of giving up.
        attempts: u32,
    },
}
