//! Ledger peer protocol wire types.
//!
//! This crate defines the wire format spoken between ledger peers: the HTTP
//! upgrade handshake that opens a connection, and the length-prefixed frames
//! exchanged afterwards. It is used by the conformance harness (to probe a
//! node) and by the bundled mock target (to answer it).
//!
//! # Frame layout
//!
//! ```text
//! [u32 BE: compression(6 bits) << 26 | payload_len(26 bits)][u16 BE: message type][payload]
//! ```
//!
//! Payloads are protocol buffers (see [`message`]). Decoding never panics on hostile input: truncated buffers, bad length
//! prefixes, unknown tags and payloads that fail to parse all come back as
//! [`MalformedMessage`].

#![deny(unsafe_code)]

pub mod frame;
pub mod handshake;
pub mod message;

pub use frame::{
    Codec, FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE, MalformedMessage, decode, decode_frame,
    encode,
};
pub use handshake::{
    AcceptedRequest, HandshakeCfg, HandshakeError, HandshakeRequest, HandshakeResponse, Headers,
    LEDGER_EPOCH_OFFSET, MAX_HEADER_BLOCK, NodeKey, ProtocolVersion, head_len, network_time_now,
    shared_value,
};
pub use message::{
    Endpoint, Endpoints, GetLedger, HASH_LEN, LedgerData, LedgerInfoType, LedgerNode, Manifest,
    Manifests, NodeEvent, NodeStatus, Ping, PingType, ProtocolMessage, Squelch, StatusChange, Transaction,
    TransactionStatus, Validation, message_type,
};
