//! Encrypted RPC protocol engine.
//!
//! Both roles share one wire format: a `{id, method, params}` request
//! and a `{id, result, error}` reply, always carried inside the
//! encrypted content of a signed transport event, never in the clear.
//! Responders gate every method behind a permission `Decision`; the
//! caller role correlates replies through an explicit deadline table.

pub mod admin;
pub mod client;
pub mod envelope;
pub mod error;
pub mod responder;
pub mod user;

pub use admin::{AdminResponder, KeyStore};
pub use client::RpcClient;
pub use envelope::{RpcReply, RpcRequest};
pub use error::{RpcError, RpcResult};
pub use responder::Responder;
pub use user::UserResponder;
