//! # Relay Protocol
//!
//! JSON-RPC 2.0 envelope types for the relay transport layer.
//!
//! This crate defines:
//! - **Envelopes**: [`JsonRpcRequest`], [`JsonRpcNotification`], [`JsonRpcResponse`]
//! - **Identifiers**: [`RequestId`] (string or number, usable as a correlation key)
//! - **Errors**: [`JsonRpcError`] with the standard JSON-RPC 2.0 error codes
//! - **Classification**: [`classify_outbound`] and [`classify_incoming`], the
//!   shape validation every transport applies at its boundary
//!
//! Transports move raw [`serde_json::Value`] payloads so that responses reach
//! the caller byte-for-byte as the backend produced them; the typed envelopes
//! here exist for callers that construct messages and for wire validation.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod jsonrpc;

pub use jsonrpc::{
    IncomingFrame, JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcResponsePayload, JsonRpcVersion, MessageError, OutboundMessage,
    RequestId, classify_incoming, classify_outbound,
};
