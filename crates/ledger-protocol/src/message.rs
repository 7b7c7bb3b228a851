//! Protocol messages and their payloads.
//!
//! Payloads are protocol buffers (proto2), derived with `prost`. Field
//! numbers follow the peer protocol's `TM*` messages so frames built here
//! are understood by real nodes.

use std::net::SocketAddr;

use bytes::Bytes;
use prost::Message;

use crate::frame::MalformedMessage;

/// Length of ledger and transaction hashes.
pub const HASH_LEN: usize = 32;

// =============================================================================
// Message types
// =============================================================================

/// Message type values carried in the frame header.
pub mod message_type {
    pub const MANIFESTS: u16 = 2;
    pub const PING: u16 = 3;
    pub const ENDPOINTS: u16 = 15;
    pub const TRANSACTION: u16 = 30;
    pub const GET_LEDGER: u16 = 31;
    pub const LEDGER_DATA: u16 = 32;
    pub const STATUS_CHANGE: u16 = 34;
    pub const VALIDATION: u16 = 41;
    pub const SQUELCH: u16 = 55;

    /// Every type the codec decodes.
    pub const ALL: [u16; 9] = [
        MANIFESTS,
        PING,
        ENDPOINTS,
        TRANSACTION,
        GET_LEDGER,
        LEDGER_DATA,
        STATUS_CHANGE,
        VALIDATION,
        SQUELCH,
    ];
}

// =============================================================================
// Enumerations
// =============================================================================

/// Whether a [`Ping`] asks or answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PingType {
    Ping = 0,
    Pong = 1,
}

/// Relay status of a [`Transaction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum TransactionStatus {
    New = 1,
    Current = 2,
    Committed = 3,
    RejectConflict = 4,
    RejectInvalid = 5,
    RejectFunds = 6,
    HeldSeq = 7,
    HeldLedger = 8,
}

/// What part of a ledger a [`GetLedger`] asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LedgerInfoType {
    Base = 0,
    TxNode = 1,
    AsNode = 2,
    TsCandidate = 3,
}

/// Node operating status advertised in [`StatusChange`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum NodeStatus {
    Connecting = 1,
    Connected = 2,
    Monitoring = 3,
    Validating = 4,
    Shutting = 5,
}

/// Event that triggered a [`StatusChange`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum NodeEvent {
    ClosingLedger = 1,
    AcceptedLedger = 2,
    SwitchedLedger = 3,
    LostSync = 4,
}

// =============================================================================
// Payloads
// =============================================================================

/// One serialized validator manifest.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Manifest {
    #[prost(bytes = "bytes", required, tag = "1")]
    pub stobject: Bytes,
}

/// Validator manifests.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Manifests {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<Manifest>,
    /// Set when replaying history rather than relaying fresh manifests.
    #[prost(bool, optional, tag = "2")]
    pub history: Option<bool>,
}

/// Liveness probe and its answer.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Ping {
    #[prost(enumeration = "PingType", required, tag = "1")]
    pub r#type: i32,
    #[prost(uint32, optional, tag = "2")]
    pub seq: Option<u32>,
    #[prost(uint64, optional, tag = "3")]
    pub ping_time: Option<u64>,
    #[prost(uint64, optional, tag = "4")]
    pub net_time: Option<u64>,
}

impl Ping {
    /// A ping with the given sequence number.
    pub fn ping(seq: u32) -> Self {
        Self {
            r#type: PingType::Ping as i32,
            seq: Some(seq),
            ping_time: None,
            net_time: None,
        }
    }

    /// A pong answering sequence number `seq`.
    pub fn pong(seq: u32) -> Self {
        Self {
            r#type: PingType::Pong as i32,
            ..Self::ping(seq)
        }
    }

    /// The pong that answers this ping (echoing every field).
    pub fn reply(&self) -> Self {
        Self {
            r#type: PingType::Pong as i32,
            ..self.clone()
        }
    }

    pub fn is_pong(&self) -> bool {
        self.r#type == PingType::Pong as i32
    }
}

/// A peer address with its distance from the sender.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Endpoint {
    /// `ip:port` literal.
    #[prost(string, required, tag = "1")]
    pub endpoint: String,
    #[prost(uint32, required, tag = "2")]
    pub hops: u32,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, hops: u32) -> Self {
        Self {
            endpoint: addr.to_string(),
            hops,
        }
    }

    /// The advertised address, if it parses.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.endpoint.parse().ok()
    }
}

/// Peer discovery gossip.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Endpoints {
    #[prost(uint32, required, tag = "1")]
    pub version: u32,
    #[prost(message, repeated, tag = "3")]
    pub endpoints_v2: Vec<Endpoint>,
}

/// A relayed transaction.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Transaction {
    #[prost(bytes = "bytes", required, tag = "1")]
    pub raw_transaction: Bytes,
    #[prost(enumeration = "TransactionStatus", required, tag = "2")]
    pub status: i32,
    #[prost(uint64, optional, tag = "3")]
    pub receive_timestamp: Option<u64>,
    #[prost(bool, optional, tag = "4")]
    pub deferred: Option<bool>,
}

/// Request for ledger data.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct GetLedger {
    #[prost(enumeration = "LedgerInfoType", required, tag = "1")]
    pub itype: i32,
    #[prost(bytes = "bytes", optional, tag = "3")]
    pub ledger_hash: Option<Bytes>,
    #[prost(uint32, optional, tag = "4")]
    pub ledger_seq: Option<u32>,
    #[prost(bytes = "bytes", repeated, tag = "5")]
    pub node_ids: Vec<Bytes>,
    #[prost(uint64, optional, tag = "6")]
    pub request_cookie: Option<u64>,
    #[prost(uint32, optional, tag = "8")]
    pub query_depth: Option<u32>,
}

/// One node of a ledger tree.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct LedgerNode {
    #[prost(bytes = "bytes", required, tag = "1")]
    pub nodedata: Bytes,
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub nodeid: Option<Bytes>,
}

/// Answer to [`GetLedger`].
#[derive(Clone, PartialEq, Eq, Message)]
pub struct LedgerData {
    #[prost(bytes = "bytes", required, tag = "1")]
    pub ledger_hash: Bytes,
    #[prost(uint32, required, tag = "2")]
    pub ledger_seq: u32,
    #[prost(enumeration = "LedgerInfoType", required, tag = "3")]
    pub r#type: i32,
    #[prost(message, repeated, tag = "4")]
    pub nodes: Vec<LedgerNode>,
    #[prost(uint32, optional, tag = "5")]
    pub request_cookie: Option<u32>,
}

/// Node status announcement.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct StatusChange {
    #[prost(enumeration = "NodeStatus", optional, tag = "1")]
    pub new_status: Option<i32>,
    #[prost(enumeration = "NodeEvent", optional, tag = "2")]
    pub new_event: Option<i32>,
    #[prost(uint32, optional, tag = "3")]
    pub ledger_seq: Option<u32>,
    #[prost(bytes = "bytes", optional, tag = "4")]
    pub ledger_hash: Option<Bytes>,
    #[prost(bytes = "bytes", optional, tag = "5")]
    pub ledger_hash_previous: Option<Bytes>,
    #[prost(uint64, optional, tag = "6")]
    pub network_time: Option<u64>,
    #[prost(uint32, optional, tag = "7")]
    pub first_seq: Option<u32>,
    #[prost(uint32, optional, tag = "8")]
    pub last_seq: Option<u32>,
}

/// A serialized validation.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Validation {
    #[prost(bytes = "bytes", required, tag = "1")]
    pub validation: Bytes,
}

/// Ask a peer to stop (or resume) relaying a validator's messages.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Squelch {
    #[prost(bool, required, tag = "1")]
    pub squelch: bool,
    #[prost(bytes = "bytes", required, tag = "2")]
    pub validator_pub_key: Bytes,
    #[prost(uint32, optional, tag = "3")]
    pub squelch_duration: Option<u32>,
}

// =============================================================================
// Field checks
// =============================================================================
// Protobuf accepts any varint for an enum and any length for bytes; these
// reject what the peer protocol does not allow.

fn check_enum<E: TryFrom<i32>>(field: &'static str, value: i32) -> Result<(), MalformedMessage> {
    match E::try_from(value) {
        Ok(_) => Ok(()),
        Err(_) => Err(MalformedMessage::InvalidField {
            field,
            detail: format!("{value} is not a known value"),
        }),
    }
}

fn check_hash(field: &'static str, hash: &[u8]) -> Result<(), MalformedMessage> {
    if hash.len() == HASH_LEN {
        Ok(())
    } else {
        Err(MalformedMessage::InvalidField {
            field,
            detail: format!("{} bytes, expected {HASH_LEN}", hash.len()),
        })
    }
}

/// Decode a payload and apply the protocol's field checks.
fn decode_checked<M: Message + Default>(
    kind: &'static str,
    payload: &[u8],
    check: impl FnOnce(&M) -> Result<(), MalformedMessage>,
) -> Result<M, MalformedMessage> {
    let msg = M::decode(payload).map_err(|e| MalformedMessage::InvalidPayload {
        kind,
        detail: e.to_string(),
    })?;
    check(&msg)?;
    Ok(msg)
}

// =============================================================================
// ProtocolMessage
// =============================================================================

/// Every message the codec speaks, plus a raw escape hatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Manifests(Manifests),
    Ping(Ping),
    Endpoints(Endpoints),
    Transaction(Transaction),
    GetLedger(GetLedger),
    LedgerData(LedgerData),
    StatusChange(StatusChange),
    Validation(Validation),
    Squelch(Squelch),
    /// Arbitrary tag and payload bytes, written as-is.
    ///
    /// Used to put unknown or deliberately broken payloads on the wire.
    /// Frames built from it are not expected to decode back to `Raw`.
    Raw { tag: u16, payload: Bytes },
}

impl ProtocolMessage {
    /// Message type written in the frame header.
    pub fn tag(&self) -> u16 {
        match self {
            Self::Manifests(_) => message_type::MANIFESTS,
            Self::Ping(_) => message_type::PING,
            Self::Endpoints(_) => message_type::ENDPOINTS,
            Self::Transaction(_) => message_type::TRANSACTION,
            Self::GetLedger(_) => message_type::GET_LEDGER,
            Self::LedgerData(_) => message_type::LEDGER_DATA,
            Self::StatusChange(_) => message_type::STATUS_CHANGE,
            Self::Validation(_) => message_type::VALIDATION,
            Self::Squelch(_) => message_type::SQUELCH,
            Self::Raw { tag, .. } => *tag,
        }
    }

    /// Short name for logs and assertion messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Manifests(_) => "Manifests",
            Self::Ping(p) if p.is_pong() => "Pong",
            Self::Ping(_) => "Ping",
            Self::Endpoints(_) => "Endpoints",
            Self::Transaction(_) => "Transaction",
            Self::GetLedger(_) => "GetLedger",
            Self::LedgerData(_) => "LedgerData",
            Self::StatusChange(_) => "StatusChange",
            Self::Validation(_) => "Validation",
            Self::Squelch(_) => "Squelch",
            Self::Raw { .. } => "Raw",
        }
    }

    pub(crate) fn encode_payload(&self) -> Bytes {
        match self {
            Self::Manifests(m) => m.encode_to_vec().into(),
            Self::Ping(m) => m.encode_to_vec().into(),
            Self::Endpoints(m) => m.encode_to_vec().into(),
            Self::Transaction(m) => m.encode_to_vec().into(),
            Self::GetLedger(m) => m.encode_to_vec().into(),
            Self::LedgerData(m) => m.encode_to_vec().into(),
            Self::StatusChange(m) => m.encode_to_vec().into(),
            Self::Validation(m) => m.encode_to_vec().into(),
            Self::Squelch(m) => m.encode_to_vec().into(),
            Self::Raw { payload, .. } => payload.clone(),
        }
    }

    pub(crate) fn decode_payload(tag: u16, payload: &[u8]) -> Result<Self, MalformedMessage> {
        let msg = match tag {
            message_type::MANIFESTS => {
                Self::Manifests(decode_checked("Manifests", payload, |_| Ok(()))?)
            }
            message_type::PING => Self::Ping(decode_checked("Ping", payload, |m: &Ping| {
                check_enum::<PingType>("type", m.r#type)
            })?),
            message_type::ENDPOINTS => {
                Self::Endpoints(decode_checked("Endpoints", payload, |m: &Endpoints| {
                    match m.endpoints_v2.iter().find(|e| e.addr().is_none()) {
                        Some(bad) => Err(MalformedMessage::InvalidField {
                            field: "endpoint",
                            detail: format!("{:?} is not ip:port", bad.endpoint),
                        }),
                        None => Ok(()),
                    }
                })?)
            }
            message_type::TRANSACTION => {
                Self::Transaction(decode_checked("Transaction", payload, |m: &Transaction| {
                    check_enum::<TransactionStatus>("status", m.status)
                })?)
            }
            message_type::GET_LEDGER => {
                Self::GetLedger(decode_checked("GetLedger", payload, |m: &GetLedger| {
                    check_enum::<LedgerInfoType>("itype", m.itype)?;
                    match &m.ledger_hash {
                        Some(hash) => check_hash("ledger_hash", hash),
                        None => Ok(()),
                    }
                })?)
            }
            message_type::LEDGER_DATA => {
                Self::LedgerData(decode_checked("LedgerData", payload, |m: &LedgerData| {
                    check_enum::<LedgerInfoType>("type", m.r#type)?;
                    check_hash("ledger_hash", &m.ledger_hash)
                })?)
            }
            message_type::STATUS_CHANGE => {
                Self::StatusChange(decode_checked("StatusChange", payload, |m: &StatusChange| {
                    if let Some(status) = m.new_status {
                        check_enum::<NodeStatus>("new_status", status)?;
                    }
                    if let Some(event) = m.new_event {
                        check_enum::<NodeEvent>("new_event", event)?;
                    }
                    for (field, hash) in [
                        ("ledger_hash", &m.ledger_hash),
                        ("ledger_hash_previous", &m.ledger_hash_previous),
                    ] {
                        if let Some(hash) = hash {
                            check_hash(field, hash)?;
                        }
                    }
                    Ok(())
                })?)
            }
            message_type::VALIDATION => {
                Self::Validation(decode_checked("Validation", payload, |_| Ok(()))?)
            }
            message_type::SQUELCH => {
                Self::Squelch(decode_checked("Squelch", payload, |_| Ok(()))?)
            }
            other => return Err(MalformedMessage::UnknownTag(other)),
        };
        Ok(msg)
    }
}

impl From<Ping> for ProtocolMessage {
    fn from(ping: Ping) -> Self {
        Self::Ping(ping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode, encode};

    fn samples() -> Vec<ProtocolMessage> {
        let hash = Bytes::from_static(&[7u8; HASH_LEN]);
        vec![
            ProtocolMessage::Manifests(Manifests {
                list: vec![
                    Manifest {
                        stobject: Bytes::from_static(b"manifest-a"),
                    },
                    Manifest::default(),
                ],
                history: Some(true),
            }),
            ProtocolMessage::Ping(Ping {
                ping_time: Some(1_700_000_000),
                ..Ping::ping(9)
            }),
            ProtocolMessage::Endpoints(Endpoints {
                version: 2,
                endpoints_v2: vec![Endpoint::new("10.0.0.1:51235".parse().unwrap(), 0)],
            }),
            ProtocolMessage::Transaction(Transaction {
                raw_transaction: Bytes::from_static(&[0x12, 0x00, 0x00]),
                status: TransactionStatus::New as i32,
                receive_timestamp: None,
                deferred: Some(false),
            }),
            ProtocolMessage::GetLedger(GetLedger {
                itype: LedgerInfoType::Base as i32,
                ledger_hash: Some(hash.clone()),
                ledger_seq: Some(1),
                node_ids: vec![Bytes::from_static(&[0; 33])],
                request_cookie: None,
                query_depth: Some(2),
            }),
            ProtocolMessage::LedgerData(LedgerData {
                ledger_hash: hash.clone(),
                ledger_seq: 3,
                r#type: LedgerInfoType::AsNode as i32,
                nodes: vec![LedgerNode {
                    nodedata: Bytes::from_static(b"node"),
                    nodeid: None,
                }],
                request_cookie: Some(5),
            }),
            ProtocolMessage::StatusChange(StatusChange {
                new_status: Some(NodeStatus::Connected as i32),
                new_event: Some(NodeEvent::AcceptedLedger as i32),
                ledger_hash: Some(hash),
                ..Default::default()
            }),
            ProtocolMessage::Validation(Validation {
                validation: Bytes::from_static(b"signed"),
            }),
            ProtocolMessage::Squelch(Squelch {
                squelch: true,
                validator_pub_key: Bytes::from_static(&[0xED; 33]),
                squelch_duration: Some(300),
            }),
        ]
    }

    fn raw(tag: u16, payload: &'static [u8]) -> Bytes {
        encode(&ProtocolMessage::Raw {
            tag,
            payload: Bytes::from_static(payload),
        })
        .unwrap()
    }

    #[test]
    fn well_formed_messages_decode_back() {
        for msg in samples() {
            let wire = encode(&msg).unwrap();
            assert_eq!(decode(&wire), Ok(msg.clone()), "{}", msg.kind());
        }
    }

    #[test]
    fn samples_cover_every_type() {
        let mut tags: Vec<u16> = samples().iter().map(ProtocolMessage::tag).collect();
        tags.sort_unstable();
        let mut all = message_type::ALL.to_vec();
        all.sort_unstable();
        assert_eq!(tags, all);
    }

    #[test]
    fn ping_uses_protobuf_field_numbers() {
        // type = 0 (field 1, varint), seq = 5 (field 2, varint)
        assert_eq!(
            &encode(&ProtocolMessage::Ping(Ping::ping(5))).unwrap()[6..],
            &[0x08, 0x00, 0x10, 0x05]
        );
    }

    #[test]
    fn raw_payload_is_written_unchanged() {
        let garbage = [0xde, 0xad, 0xbe, 0xef];
        let wire = raw(4242, &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&wire[6..], &garbage[..]);
        assert_eq!(decode(&wire), Err(MalformedMessage::UnknownTag(4242)));
    }

    #[test]
    fn known_tag_with_garbage_payload_is_malformed() {
        // Field 1 as a 64-bit value with one byte behind it.
        assert!(matches!(
            decode(&raw(message_type::PING, &[0x09, 0x01])),
            Err(MalformedMessage::InvalidPayload { kind: "Ping", .. })
        ));
    }

    #[test]
    fn unknown_enum_value_is_malformed() {
        assert!(matches!(
            decode(&raw(message_type::PING, &[0x08, 0x09])),
            Err(MalformedMessage::InvalidField { field: "type", .. })
        ));
    }

    #[test]
    fn short_hash_is_malformed() {
        let msg = ProtocolMessage::LedgerData(LedgerData {
            ledger_hash: Bytes::from_static(&[1; 20]),
            ledger_seq: 1,
            r#type: LedgerInfoType::Base as i32,
            nodes: Vec::new(),
            request_cookie: None,
        });
        assert!(matches!(
            decode(&encode(&msg).unwrap()),
            Err(MalformedMessage::InvalidField { field: "ledger_hash", .. })
        ));
    }

    #[test]
    fn endpoint_must_be_a_socket_address() {
        let msg = ProtocolMessage::Endpoints(Endpoints {
            version: 2,
            endpoints_v2: vec![Endpoint {
                endpoint: "not-an-address".into(),
                hops: 1,
            }],
        });
        assert!(matches!(
            decode(&encode(&msg).unwrap()),
            Err(MalformedMessage::InvalidField { field: "endpoint", .. })
        ));
    }

    #[test]
    fn reply_echoes_sequence() {
        let ping = Ping::ping(77);
        let pong = ping.reply();
        assert!(pong.is_pong());
        assert_eq!(pong.seq, Some(77));
        assert_eq!(ProtocolMessage::from(pong).kind(), "Pong");
    }
}
