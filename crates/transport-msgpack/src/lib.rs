//! MessagePack-RPC transport used to drive a remote editor surface.
//!
//! The crate owns the framing (`codec`) and a request/response client that
//! multiplexes concurrent calls over one socket (`client`). It knows nothing
//! about the methods being invoked; callers hand it method names and
//! [`rmpv::Value`] parameters.

use thiserror::Error;

pub mod client;
pub mod codec;

pub use client::Client;
pub use codec::Message;
pub use rmpv;
pub use rmpv::Value;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rpc encode error: {0}")]
    Encode(String),
    #[error("rpc decode error: {0}")]
    Decode(String),
    #[error("rpc protocol violation: {0}")]
    Protocol(String),
    #[error("remote error: {message}")]
    Remote { message: String },
    #[error("rpc connection closed")]
    Closed,
}

pub type RpcResult<T> = Result<T, RpcError>;
