//! Error types shared across the daemon.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The pool has no unreserved host address left to hand out.
    #[error("address pool exhausted in {0}")]
    AddressExhausted(Ipv4Net),

    /// An address was freed that was never reserved.
    #[error("address {0} is not reserved")]
    NotReserved(Ipv4Addr),

    /// The runtime no longer knows the container an event referred to.
    #[error("unknown container {0}")]
    UnknownContainer(String),

    /// An issued command did not succeed.
    #[error("command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    /// A runtime event was missing expected attributes or had an
    /// unsupported type or action.
    #[error("malformed event: {0}")]
    MalformedEvent(String),
}
