//! Manager-facing HTTP layer for the warden agent.
//!
//! [`HttpClient`] builds requests and drives one-shot and long-poll
//! exchanges over an injectable [`HttpTransport`]; [`Communicator`] owns the
//! bearer token lifecycle and the three long-lived request loops.

#![warn(missing_docs, clippy::pedantic)]

mod client;
mod communicator;
#[cfg(test)]
mod test_support;
mod token;
mod transport;

pub use client::{
    HttpClient, HttpRequestParams, LoopCondition, LoopRequest, MessageGetter, SuccessHandler,
    UnauthorizedHandler, DEFAULT_USER_AGENT,
};
pub use communicator::{Communicator, CommsConfig};
pub use token::TokenState;
pub use transport::{HttpTransport, HyperTransport, TransportError, TransportResult, WireResponse};
