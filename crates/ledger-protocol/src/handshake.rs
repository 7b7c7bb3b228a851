//! HTTP upgrade handshake.
//!
//! A connection opens with an HTTP/1.1 request from the initiator and a
//! `101 Switching Protocols` answer from the responder. Both sides prove
//! their node identity by signing a *shared value* derived from the two
//! socket addresses of the connection, so a signature cannot be replayed
//! on another connection.
//!
//! ```text
//! GET / HTTP/1.1
//! User-Agent: ledger-conformance/0.1.0
//! Upgrade: XRPL/2.2
//! Connection: Upgrade
//! Connect-As: Peer
//! Crawl: private
//! Network-Time: 782000000
//! Public-Key: <hex ed25519 key>
//! Session-Signature: <hex signature over the shared value>
//! X-Protocol-Ctl: txrr=1;
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};

/// Seconds between the Unix epoch and the ledger epoch (2000-01-01T00:00:00Z).
pub const LEDGER_EPOCH_OFFSET: u64 = 946_684_800;

/// Largest request or response head (request line + headers) a peer accepts.
pub const MAX_HEADER_BLOCK: usize = 8192;

/// Allowed difference between a peer's `Network-Time` and local time.
pub const NETWORK_TIME_TOLERANCE: Duration = Duration::from_secs(60);

/// Oldest and newest protocol versions spoken.
pub const MIN_VERSION: ProtocolVersion = ProtocolVersion::new(2, 0);
pub const MAX_VERSION: ProtocolVersion = ProtocolVersion::new(2, 2);

const VERSION_PREFIX: &str = "XRPL/";

/// Handshake failures, on either side of the exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("header block exceeds {MAX_HEADER_BLOCK} bytes ({0} bytes read)")]
    HeaderTooLarge(usize),

    #[error("invalid start line: {0:?}")]
    BadStartLine(String),

    #[error("invalid header line: {0:?}")]
    BadHeaderLine(String),

    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("invalid {name} header: {detail}")]
    InvalidHeader { name: &'static str, detail: String },

    #[error("no supported protocol version in {0:?}")]
    UnsupportedVersion(String),

    #[error("network time off by {skew_secs}s")]
    ClockSkew { skew_secs: i64 },

    #[error("public key does not decode")]
    BadPublicKey,

    #[error("session signature does not verify")]
    BadSignature,

    #[error("handshake rejected with {status} {reason}")]
    Rejected { status: u16, reason: String },
}

// =============================================================================
// Versions
// =============================================================================

/// `XRPL/<major>.<minor>` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parse a single `XRPL/<major>.<minor>` token (digits only, no sign).
    pub fn parse(token: &str) -> Option<Self> {
        let rest = token.trim().strip_prefix(VERSION_PREFIX)?;
        let (major, minor) = rest.split_once('.')?;
        let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !digits(major) || !digits(minor) {
            return None;
        }
        Some(Self::new(major.parse().ok()?, minor.parse().ok()?))
    }

    pub fn is_supported(&self) -> bool {
        (MIN_VERSION..=MAX_VERSION).contains(self)
    }

    /// Highest supported version in a comma-separated `Upgrade` value.
    pub fn negotiate(offer: &str) -> Option<Self> {
        offer
            .split(',')
            .filter_map(Self::parse)
            .filter(Self::is_supported)
            .max()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{VERSION_PREFIX}{}.{}", self.major, self.minor)
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Node identity key used to sign the shared value.
#[derive(Clone)]
pub struct NodeKey {
    signing: SigningKey,
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKey")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

impl NodeKey {
    /// Fresh random identity.
    pub fn generate() -> Self {
        Self::from_seed(rand::random())
    }

    /// Deterministic identity from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

/// Value both ends sign: first half of SHA-512 over the connection's addresses.
pub fn shared_value(initiator: SocketAddr, responder: SocketAddr) -> [u8; 32] {
    let digest = Sha512::digest(format!("{initiator}|{responder}").as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    out
}

/// Check a `Public-Key` / `Session-Signature` pair against the shared value.
pub fn verify_session(
    public_hex: &str,
    signature_hex: &str,
    shared: &[u8; 32],
) -> Result<VerifyingKey, HandshakeError> {
    let public: [u8; 32] = hex::decode(public_hex.trim())
        .ok()
        .and_then(|raw| raw.try_into().ok())
        .ok_or(HandshakeError::BadPublicKey)?;
    let key = VerifyingKey::from_bytes(&public).map_err(|_| HandshakeError::BadPublicKey)?;

    let signature: [u8; 64] = hex::decode(signature_hex.trim())
        .ok()
        .and_then(|raw| raw.try_into().ok())
        .ok_or(HandshakeError::BadSignature)?;
    key.verify_strict(shared, &Signature::from_bytes(&signature))
        .map_err(|_| HandshakeError::BadSignature)?;
    Ok(key)
}

/// Current time in seconds since the ledger epoch.
pub fn network_time_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
        .saturating_sub(LEDGER_EPOCH_OFFSET)
}

// =============================================================================
// Headers
// =============================================================================

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, name: &'static str) -> Result<&str, HandshakeError> {
        self.get(name).ok_or(HandshakeError::MissingHeader(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn write_to(&self, out: &mut String) {
        for (name, value) in self.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
    }

    fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Self, HandshakeError> {
        let mut headers = Self::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .filter(|(name, _)| is_token(name))
                .ok_or_else(|| HandshakeError::BadHeaderLine(preview(line)))?;
            headers.push(name, value.trim());
        }
        Ok(headers)
    }
}

fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

fn preview(line: &str) -> String {
    line.chars().take(64).collect()
}

/// Length of the head in `buf` including the blank line, once complete.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

// =============================================================================
// Initiator configuration
// =============================================================================

/// Header values an initiator sends, including deliberate corruptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeCfg {
    pub http_ident: String,
    pub http_upgrade_req: String,
    pub http_connection: String,
    pub http_connect_as: String,
    pub http_crawl: Option<String>,
    /// `None` sends the current time.
    pub http_network_time: Option<String>,
    pub http_x_protocol_ctl: String,
    /// Flip one bit of the advertised public key.
    pub bitflip_pub_key: bool,
    /// Flip one bit of the shared value before signing it.
    pub bitflip_shared_val: bool,
}

impl Default for HandshakeCfg {
    fn default() -> Self {
        Self {
            http_ident: concat!("ledger-conformance/", env!("CARGO_PKG_VERSION")).to_string(),
            http_upgrade_req: MAX_VERSION.to_string(),
            http_connection: "Upgrade".to_string(),
            http_connect_as: "Peer".to_string(),
            http_crawl: Some("private".to_string()),
            http_network_time: None,
            http_x_protocol_ctl: "txrr=1;vprr=1;".to_string(),
            bitflip_pub_key: false,
            bitflip_shared_val: false,
        }
    }
}

fn identity_headers(
    headers: &mut Headers,
    key: &NodeKey,
    shared: &[u8; 32],
    bitflip_pub_key: bool,
    bitflip_shared_val: bool,
) {
    let mut public = key.public_bytes();
    if bitflip_pub_key {
        public[0] ^= 0x01;
    }
    let mut signed = *shared;
    if bitflip_shared_val {
        signed[0] ^= 0x01;
    }
    headers.push("Public-Key", hex::encode(public));
    headers.push("Session-Signature", hex::encode(key.sign(&signed)));
}

// =============================================================================
// Request
// =============================================================================

/// The initiator's upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub path: String,
    pub headers: Headers,
}

/// What a responder learned from a valid request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedRequest {
    pub version: ProtocolVersion,
    pub public_key: [u8; 32],
    pub user_agent: Option<String>,
}

impl HandshakeRequest {
    /// Build the request an initiator with `key` sends on a connection whose
    /// shared value is `shared`.
    pub fn build(cfg: &HandshakeCfg, key: &NodeKey, shared: &[u8; 32]) -> Self {
        let mut headers = Headers::new();
        headers.push("User-Agent", cfg.http_ident.as_str());
        headers.push("Upgrade", cfg.http_upgrade_req.as_str());
        headers.push("Connection", cfg.http_connection.as_str());
        headers.push("Connect-As", cfg.http_connect_as.as_str());
        if let Some(crawl) = &cfg.http_crawl {
            headers.push("Crawl", crawl.as_str());
        }
        let network_time = cfg
            .http_network_time
            .clone()
            .unwrap_or_else(|| network_time_now().to_string());
        headers.push("Network-Time", network_time);
        identity_headers(
            &mut headers,
            key,
            shared,
            cfg.bitflip_pub_key,
            cfg.bitflip_shared_val,
        );
        headers.push("X-Protocol-Ctl", cfg.http_x_protocol_ctl.as_str());

        Self {
            path: "/".to_string(),
            headers,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("GET {} HTTP/1.1\r\n", self.path);
        self.headers.write_to(&mut out);
        out.into_bytes()
    }

    /// Parse a complete request head.
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        if head.len() > MAX_HEADER_BLOCK {
            return Err(HandshakeError::HeaderTooLarge(head.len()));
        }
        let text = std::str::from_utf8(head)
            .map_err(|_| HandshakeError::BadStartLine("non-UTF-8 request".to_string()))?;
        let mut lines = text.split("\r\n");
        let start = lines.next().unwrap_or_default();

        let mut parts = start.split(' ');
        let (method, path, version) = (parts.next(), parts.next(), parts.next());
        let path = match (method, path, version, parts.next()) {
            (Some("GET"), Some(path), Some("HTTP/1.1"), None) if path.starts_with('/') => path,
            _ => return Err(HandshakeError::BadStartLine(preview(start))),
        };

        Ok(Self {
            path: path.to_string(),
            headers: Headers::parse_lines(lines)?,
        })
    }

    /// Validate a request received on a connection with the given shared value.
    pub fn validate(
        &self,
        shared: &[u8; 32],
        now: u64,
    ) -> Result<AcceptedRequest, HandshakeError> {
        let headers = &self.headers;

        let connection = headers.require("Connection")?;
        if !connection.eq_ignore_ascii_case("upgrade") {
            return Err(invalid("Connection", connection));
        }

        let connect_as = headers.require("Connect-As")?;
        if !connect_as.eq_ignore_ascii_case("peer") {
            return Err(invalid("Connect-As", connect_as));
        }

        let upgrade = headers.require("Upgrade")?;
        let version = ProtocolVersion::negotiate(upgrade)
            .ok_or_else(|| HandshakeError::UnsupportedVersion(preview(upgrade)))?;

        if let Some(value) = headers.get("Network-Time") {
            let theirs: u64 = value
                .parse()
                .map_err(|_| invalid("Network-Time", value))?;
            let skew = theirs as i128 - now as i128;
            if skew.unsigned_abs() > NETWORK_TIME_TOLERANCE.as_secs() as u128 {
                return Err(HandshakeError::ClockSkew {
                    skew_secs: skew.clamp(i64::MIN as i128, i64::MAX as i128) as i64,
                });
            }
        }

        let key = verify_session(
            headers.require("Public-Key")?,
            headers.require("Session-Signature")?,
            shared,
        )?;

        Ok(AcceptedRequest {
            version,
            public_key: key.to_bytes(),
            user_agent: headers.get("User-Agent").map(str::to_string),
        })
    }
}

fn invalid(name: &'static str, value: &str) -> HandshakeError {
    HandshakeError::InvalidHeader {
        name,
        detail: format!("{:?}", preview(value)),
    }
}

// =============================================================================
// Response
// =============================================================================

/// The responder's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HandshakeResponse {
    /// `101 Switching Protocols` for a negotiated version.
    pub fn accept(
        server: &str,
        version: ProtocolVersion,
        key: &NodeKey,
        shared: &[u8; 32],
    ) -> Self {
        let mut headers = Headers::new();
        headers.push("Connection", "Upgrade");
        headers.push("Upgrade", version.to_string());
        headers.push("Connect-As", "Peer");
        headers.push("Server", server);
        identity_headers(&mut headers, key, shared, false, false);
        Self {
            status: 101,
            reason: "Switching Protocols".to_string(),
            headers,
            body: Vec::new(),
        }
    }

    /// Rejection with an optional body.
    pub fn reject(status: u16, reason: &str, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        let mut headers = Headers::new();
        headers.push("Connection", "close");
        headers.push("Content-Length", body.len().to_string());
        Self {
            status,
            reason: reason.to_string(),
            headers,
            body,
        }
    }

    /// `503` listing other peers to try.
    pub fn redirect(peers: &[SocketAddr]) -> Self {
        let ips: Vec<String> = peers.iter().map(|p| format!("\"{p}\"")).collect();
        let body = format!("{{\"peer-ips\":[{}]}}", ips.join(","));
        Self::reject(503, "Service Unavailable", body)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        self.headers.write_to(&mut out);
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Parse a response head (the body, if any, is read separately).
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        if head.len() > MAX_HEADER_BLOCK {
            return Err(HandshakeError::HeaderTooLarge(head.len()));
        }
        let text = std::str::from_utf8(head)
            .map_err(|_| HandshakeError::BadStartLine("non-UTF-8 response".to_string()))?;
        let mut lines = text.split("\r\n");
        let start = lines.next().unwrap_or_default();

        let (status, reason) = start
            .strip_prefix("HTTP/1.1 ")
            .and_then(|rest| {
                let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
                Some((code.parse::<u16>().ok()?, reason.to_string()))
            })
            .ok_or_else(|| HandshakeError::BadStartLine(preview(start)))?;

        Ok(Self {
            status,
            reason,
            headers: Headers::parse_lines(lines)?,
            body: Vec::new(),
        })
    }

    /// Declared body length.
    pub fn content_length(&self) -> usize {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Validate an answer received on a connection with the given shared value.
    pub fn validate(&self, shared: &[u8; 32]) -> Result<ProtocolVersion, HandshakeError> {
        if self.status != 101 {
            return Err(HandshakeError::Rejected {
                status: self.status,
                reason: self.reason.clone(),
            });
        }
        let upgrade = self.headers.require("Upgrade")?;
        let version = ProtocolVersion::parse(upgrade)
            .filter(ProtocolVersion::is_supported)
            .ok_or_else(|| HandshakeError::UnsupportedVersion(preview(upgrade)))?;
        verify_session(
            self.headers.require("Public-Key")?,
            self.headers.require("Session-Signature")?,
            shared,
        )?;
        Ok(version)
    }
}
