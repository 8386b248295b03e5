//! Wire message catalogue and frame codec (spec §3.A, §4.3, §6).
//!
//! Grounded on the teacher's hand-rolled `RawNetworkMessage`/`NetworkMessage`
//! pair (`crates/types/src/messages/p2p.rs`): a closed `Kind` enumeration
//! drives a by-command `consensus_decode`, with every structured payload type
//! borrowed from `bitcoin::consensus`/`bitcoin::network`. We don't reuse
//! `bitcoin`'s own `RawNetworkMessage` decode path because it bundles
//! checksum validation unconditionally; the proxy (§4.3) needs to gate that
//! behind `Config::validate_checksum`.
use std::fmt;
use std::io::{self, Cursor, Read};

use bitcoin::consensus::{encode, Decodable, Encodable};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::network::address::Address;
use bitcoin::network::message_network::VersionMessage;
use bitcoin::network::Magic;
use bitcoin::{Block, BlockHeader, MerkleBlock, Script, Transaction, Txid};

/// Fixed heading size: 4 (magic) + 12 (command) + 4 (length) + 4 (checksum).
pub const HEADING_LEN: usize = 24;
const COMMAND_LEN: usize = 12;

/// A single inventory entry (spec §6 "inv"/"get_data"/"not_found").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inventory {
    Tx(Txid),
    Block(bitcoin::BlockHash),
    FilteredBlock(bitcoin::BlockHash),
    CompactBlock(bitcoin::BlockHash),
    Unknown(u32, [u8; 32]),
}

/// Closed enumeration of message kinds the core dispatches on (spec §9 design
/// notes: "represent kind as a closed enumeration").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Version,
    Verack,
    Ping,
    Pong,
    Address,
    GetAddress,
    Reject,
    Inv,
    GetData,
    NotFound,
    Transaction,
    Block,
    Headers,
    MerkleBlock,
    FilterLoad,
    FilterAdd,
    FilterClear,
    FeeFilter,
    SendHeaders,
    SendCompact,
    CompactBlock,
    BlockTransactions,
    GetBlockTransactions,
    MemoryPool,
    Alert,
    DoubleSpendProof,
    XVersion,
    Unknown,
}

impl Kind {
    /// The 12-byte, null-padded wire command name for this kind.
    pub fn command(&self) -> &'static str {
        match self {
            Kind::Version => "version",
            Kind::Verack => "verack",
            Kind::Ping => "ping",
            Kind::Pong => "pong",
            Kind::Address => "addr",
            Kind::GetAddress => "getaddr",
            Kind::Reject => "reject",
            Kind::Inv => "inv",
            Kind::GetData => "getdata",
            Kind::NotFound => "notfound",
            Kind::Transaction => "tx",
            Kind::Block => "block",
            Kind::Headers => "headers",
            Kind::MerkleBlock => "merkleblock",
            Kind::FilterLoad => "filterload",
            Kind::FilterAdd => "filteradd",
            Kind::FilterClear => "filterclear",
            Kind::FeeFilter => "feefilter",
            Kind::SendHeaders => "sendheaders",
            Kind::SendCompact => "sendcmpct",
            Kind::CompactBlock => "cmpctblock",
            Kind::BlockTransactions => "blocktxn",
            Kind::GetBlockTransactions => "getblocktxn",
            Kind::MemoryPool => "mempool",
            Kind::Alert => "alert",
            Kind::DoubleSpendProof => "dsproof",
            Kind::XVersion => "xversion",
            Kind::Unknown => "",
        }
    }

    /// Map a wire command string to its kind, falling back to `Unknown`.
    pub fn from_command(cmd: &str) -> Kind {
        match cmd {
            "version" => Kind::Version,
            "verack" => Kind::Verack,
            "ping" => Kind::Ping,
            "pong" => Kind::Pong,
            "addr" => Kind::Address,
            "getaddr" => Kind::GetAddress,
            "reject" => Kind::Reject,
            "inv" => Kind::Inv,
            "getdata" => Kind::GetData,
            "notfound" => Kind::NotFound,
            "tx" => Kind::Transaction,
            "block" => Kind::Block,
            "headers" => Kind::Headers,
            "merkleblock" => Kind::MerkleBlock,
            "filterload" => Kind::FilterLoad,
            "filteradd" => Kind::FilterAdd,
            "filterclear" => Kind::FilterClear,
            "feefilter" => Kind::FeeFilter,
            "sendheaders" => Kind::SendHeaders,
            "sendcmpct" => Kind::SendCompact,
            "cmpctblock" => Kind::CompactBlock,
            "blocktxn" => Kind::BlockTransactions,
            "getblocktxn" => Kind::GetBlockTransactions,
            "mempool" => Kind::MemoryPool,
            "alert" => Kind::Alert,
            "dsproof" => Kind::DoubleSpendProof,
            "xversion" => Kind::XVersion,
            _ => Kind::Unknown,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command())
    }
}

/// A reject reason code (BIP 61 style, spec §4.6 version protocol).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    pub message: String,
    pub ccode: u8,
    pub reason: String,
    pub data: Vec<u8>,
}

/// The `ccode` for an obsolete-version rejection (spec §4.6).
pub const REJECT_OBSOLETE: u8 = 0x11;
/// The `ccode` for a duplicate/self-connection rejection.
pub const REJECT_DUPLICATE: u8 = 0x12;

/// A decoded message payload. `Unknown` covers every kind not representable
/// as a typed variant (spec §6: "the core treats unknown kinds as `load`
/// returns not-found without stopping the channel" — `Unknown` is how those
/// bytes are preserved for an app-layer subscriber that does know the shape).
#[derive(Debug, Clone)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Address(Vec<(u32, Address)>),
    GetAddress,
    Reject(Reject),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    Transaction(Transaction),
    Block(Block),
    Headers(Vec<BlockHeader>),
    MerkleBlock(MerkleBlock),
    FilterLoad(Vec<u8>),
    FilterAdd(Vec<u8>),
    FilterClear,
    FeeFilter(u64),
    SendHeaders,
    SendCompact(bool, u64),
    CompactBlock(Vec<u8>),
    BlockTransactions(Vec<u8>),
    GetBlockTransactions(Vec<u8>),
    MemoryPool,
    Alert(Vec<u8>),
    Unknown { command: String, payload: Vec<u8> },
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::Version(_) => Kind::Version,
            Message::Verack => Kind::Verack,
            Message::Ping(_) => Kind::Ping,
            Message::Pong(_) => Kind::Pong,
            Message::Address(_) => Kind::Address,
            Message::GetAddress => Kind::GetAddress,
            Message::Reject(_) => Kind::Reject,
            Message::Inv(_) => Kind::Inv,
            Message::GetData(_) => Kind::GetData,
            Message::NotFound(_) => Kind::NotFound,
            Message::Transaction(_) => Kind::Transaction,
            Message::Block(_) => Kind::Block,
            Message::Headers(_) => Kind::Headers,
            Message::MerkleBlock(_) => Kind::MerkleBlock,
            Message::FilterLoad(_) => Kind::FilterLoad,
            Message::FilterAdd(_) => Kind::FilterAdd,
            Message::FilterClear => Kind::FilterClear,
            Message::FeeFilter(_) => Kind::FeeFilter,
            Message::SendHeaders => Kind::SendHeaders,
            Message::SendCompact(..) => Kind::SendCompact,
            Message::CompactBlock(_) => Kind::CompactBlock,
            Message::BlockTransactions(_) => Kind::BlockTransactions,
            Message::GetBlockTransactions(_) => Kind::GetBlockTransactions,
            Message::MemoryPool => Kind::MemoryPool,
            Message::Alert(_) => Kind::Alert,
            Message::Unknown { .. } => Kind::Unknown,
        }
    }

    /// Encode the payload body (without heading) to bytes.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Version(m) => {
                m.consensus_encode(&mut buf).expect("in-memory write");
            }
            Message::Ping(nonce) | Message::Pong(nonce) => {
                nonce.consensus_encode(&mut buf).expect("in-memory write");
            }
            Message::Address(addrs) => {
                addrs.consensus_encode(&mut buf).expect("in-memory write");
            }
            Message::Inv(inv) | Message::GetData(inv) | Message::NotFound(inv) => {
                encode_inventory(inv, &mut buf);
            }
            Message::Transaction(tx) => {
                tx.consensus_encode(&mut buf).expect("in-memory write");
            }
            Message::Block(b) => {
                b.consensus_encode(&mut buf).expect("in-memory write");
            }
            Message::Headers(h) => {
                encode::VarInt(h.len() as u64)
                    .consensus_encode(&mut buf)
                    .expect("in-memory write");
                for header in h {
                    header.consensus_encode(&mut buf).expect("in-memory write");
                    0u8.consensus_encode(&mut buf).expect("in-memory write");
                }
            }
            Message::MerkleBlock(mb) => {
                mb.consensus_encode(&mut buf).expect("in-memory write");
            }
            Message::FilterLoad(b) | Message::FilterAdd(b) => {
                let s = Script::from(b.clone());
                s.consensus_encode(&mut buf).expect("in-memory write");
            }
            Message::FeeFilter(rate) => {
                rate.consensus_encode(&mut buf).expect("in-memory write");
            }
            Message::SendCompact(announce, version) => {
                (*announce as u8)
                    .consensus_encode(&mut buf)
                    .expect("in-memory write");
                version.consensus_encode(&mut buf).expect("in-memory write");
            }
            Message::CompactBlock(b)
            | Message::BlockTransactions(b)
            | Message::GetBlockTransactions(b)
            | Message::Alert(b) => {
                buf.extend_from_slice(b);
            }
            Message::Reject(r) => {
                let cmd = Script::from(r.message.clone().into_bytes());
                cmd.consensus_encode(&mut buf).expect("in-memory write");
                r.ccode.consensus_encode(&mut buf).expect("in-memory write");
                let reason = Script::from(r.reason.clone().into_bytes());
                reason.consensus_encode(&mut buf).expect("in-memory write");
                buf.extend_from_slice(&r.data);
            }
            Message::Verack
            | Message::GetAddress
            | Message::FilterClear
            | Message::SendHeaders
            | Message::MemoryPool => {}
            Message::Unknown { payload, .. } => buf.extend_from_slice(payload),
        }
        buf
    }

    /// Decode a payload of the given kind from exactly `payload` (no trailing
    /// bytes allowed — enforced by the caller, see [`decode_frame`]).
    fn decode_payload(kind: Kind, command: &str, payload: &[u8]) -> io::Result<Message> {
        let mut cursor = Cursor::new(payload);
        let msg = match kind {
            Kind::Version => Message::Version(decode(&mut cursor)?),
            Kind::Verack => Message::Verack,
            Kind::Ping => Message::Ping(decode(&mut cursor)?),
            Kind::Pong => Message::Pong(decode(&mut cursor)?),
            Kind::Address => Message::Address(decode(&mut cursor)?),
            Kind::GetAddress => Message::GetAddress,
            Kind::Inv => Message::Inv(decode_inventory(&mut cursor)?),
            Kind::GetData => Message::GetData(decode_inventory(&mut cursor)?),
            Kind::NotFound => Message::NotFound(decode_inventory(&mut cursor)?),
            Kind::Transaction => Message::Transaction(decode(&mut cursor)?),
            Kind::Block => Message::Block(decode(&mut cursor)?),
            Kind::Headers => {
                let count = encode::VarInt::consensus_decode(&mut cursor)
                    .map_err(to_io)?
                    .0;
                let mut headers = Vec::with_capacity(count.min(2_000) as usize);
                for _ in 0..count {
                    headers.push(decode::<BlockHeader>(&mut cursor)?);
                    let _tx_count = encode::VarInt::consensus_decode(&mut cursor).map_err(to_io)?;
                }
                Message::Headers(headers)
            }
            Kind::MerkleBlock => Message::MerkleBlock(decode(&mut cursor)?),
            Kind::FilterLoad => Message::FilterLoad(decode::<Script>(&mut cursor)?.to_bytes()),
            Kind::FilterAdd => Message::FilterAdd(decode::<Script>(&mut cursor)?.to_bytes()),
            Kind::FilterClear => Message::FilterClear,
            Kind::FeeFilter => Message::FeeFilter(decode(&mut cursor)?),
            Kind::SendHeaders => Message::SendHeaders,
            Kind::SendCompact => {
                let announce = decode::<u8>(&mut cursor)? != 0;
                let version = decode(&mut cursor)?;
                Message::SendCompact(announce, version)
            }
            Kind::CompactBlock => Message::CompactBlock(remaining(&mut cursor)),
            Kind::BlockTransactions => Message::BlockTransactions(remaining(&mut cursor)),
            Kind::GetBlockTransactions => Message::GetBlockTransactions(remaining(&mut cursor)),
            Kind::MemoryPool => Message::MemoryPool,
            Kind::Alert => Message::Alert(remaining(&mut cursor)),
            Kind::Reject => {
                let message = decode::<Script>(&mut cursor)?.to_bytes();
                let ccode = decode(&mut cursor)?;
                let reason = decode::<Script>(&mut cursor)?.to_bytes();
                Message::Reject(Reject {
                    message: String::from_utf8_lossy(&message).into_owned(),
                    ccode,
                    reason: String::from_utf8_lossy(&reason).into_owned(),
                    data: remaining(&mut cursor),
                })
            }
            Kind::DoubleSpendProof | Kind::XVersion => Message::Unknown {
                command: command.to_string(),
                payload: payload.to_vec(),
            },
            Kind::Unknown => {
                return Err(io::Error::new(io::ErrorKind::NotFound, "unrecognized message kind"));
            }
        };

        if (cursor.position() as usize) != payload.len() && !matches!(msg, Message::Unknown { .. })
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes in payload",
            ));
        }
        Ok(msg)
    }
}

/// Decode a single message kind from a standalone payload buffer at a given
/// negotiated version (spec §4.5 `load`). The version is accepted for parity
/// with the spec's signature; no payload shape in this catalogue currently
/// varies by negotiated version.
pub(crate) fn decode_kind(kind: Kind, version: u32, payload: &[u8]) -> io::Result<Message> {
    let _ = version;
    Message::decode_payload(kind, kind.command(), payload)
}

fn decode<T: Decodable>(cursor: &mut Cursor<&[u8]>) -> io::Result<T> {
    T::consensus_decode(cursor).map_err(to_io)
}

fn remaining(cursor: &mut Cursor<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::new();
    cursor.read_to_end(&mut buf).ok();
    buf
}

fn to_io(e: encode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

fn encode_inventory(inv: &[Inventory], buf: &mut Vec<u8>) {
    encode::VarInt(inv.len() as u64)
        .consensus_encode(buf)
        .expect("in-memory write");
    for item in inv {
        let (ty, hash): (u32, [u8; 32]) = match item {
            Inventory::Tx(h) => (1, h.to_byte_array()),
            Inventory::Block(h) => (2, h.to_byte_array()),
            Inventory::FilteredBlock(h) => (3, h.to_byte_array()),
            Inventory::CompactBlock(h) => (4, h.to_byte_array()),
            Inventory::Unknown(ty, hash) => (*ty, *hash),
        };
        ty.consensus_encode(buf).expect("in-memory write");
        buf.extend_from_slice(&hash);
    }
}

fn decode_inventory(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<Inventory>> {
    let count = encode::VarInt::consensus_decode(cursor).map_err(to_io)?.0;
    let mut items = Vec::with_capacity(count.min(50_000) as usize);
    for _ in 0..count {
        let ty: u32 = decode(cursor)?;
        let mut hash = [0u8; 32];
        cursor.read_exact(&mut hash)?;
        items.push(match ty {
            1 => Inventory::Tx(Txid::from_byte_array(hash)),
            2 => Inventory::Block(bitcoin::BlockHash::from_byte_array(hash)),
            3 => Inventory::FilteredBlock(bitcoin::BlockHash::from_byte_array(hash)),
            4 => Inventory::CompactBlock(bitcoin::BlockHash::from_byte_array(hash)),
            other => Inventory::Unknown(other, hash),
        });
    }
    Ok(items)
}

/// Parsed, validated frame heading (spec §4.3, §6).
#[derive(Debug, Clone, Copy)]
pub struct Heading {
    pub magic: Magic,
    pub command: [u8; COMMAND_LEN],
    pub payload_len: u32,
    pub checksum: [u8; 4],
}

impl Heading {
    pub fn command_str(&self) -> String {
        let end = self.command.iter().position(|&b| b == 0).unwrap_or(COMMAND_LEN);
        String::from_utf8_lossy(&self.command[..end]).into_owned()
    }

    pub fn encode(&self) -> [u8; HEADING_LEN] {
        let mut buf = [0u8; HEADING_LEN];
        buf[0..4].copy_from_slice(&self.magic.to_bytes());
        buf[4..16].copy_from_slice(&self.command);
        buf[16..20].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum);
        buf
    }

    pub fn decode(buf: &[u8; HEADING_LEN]) -> Heading {
        let mut magic_bytes = [0u8; 4];
        magic_bytes.copy_from_slice(&buf[0..4]);
        let mut command = [0u8; COMMAND_LEN];
        command.copy_from_slice(&buf[4..16]);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[16..20]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&buf[20..24]);

        Heading {
            magic: Magic::from_bytes(magic_bytes),
            command,
            payload_len: u32::from_le_bytes(len_bytes),
            checksum,
        }
    }
}

/// Checksum used by the wire protocol: the first four bytes of the
/// double-SHA256 of the payload.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d::Hash::hash(payload);
    let bytes = hash.to_byte_array();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn pad_command(command: &str) -> [u8; COMMAND_LEN] {
    let mut buf = [0u8; COMMAND_LEN];
    let bytes = command.as_bytes();
    let len = bytes.len().min(COMMAND_LEN);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

/// Serialize a full frame (heading + payload) for a given negotiated
/// version and network magic (spec §4.3 `send`).
pub fn encode_frame(magic: Magic, msg: &Message) -> Vec<u8> {
    let payload = msg.encode_payload();
    let heading = Heading {
        magic,
        command: pad_command(msg.kind().command()),
        payload_len: payload.len() as u32,
        checksum: checksum(&payload),
    };
    let mut out = Vec::with_capacity(HEADING_LEN + payload.len());
    out.extend_from_slice(&heading.encode());
    out.extend_from_slice(&payload);
    out
}

/// Errors specific to frame decoding, mapped to [`crate::error::Code::BadStream`]
/// by the proxy read loop.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("magic mismatch")]
    BadMagic,
    #[error("payload too large: {0} > {1}")]
    PayloadTooLarge(u32, u32),
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("malformed payload: {0}")]
    Malformed(#[from] io::Error),
}

/// Decode a full message given its heading and payload bytes, enforcing the
/// invariants from spec §4.3 in order: magic, length cap (checked by the
/// caller before this is invoked), checksum, then structural decode +
/// trailing-bytes check.
pub fn decode_frame(
    configured_magic: Magic,
    validate_checksum: bool,
    heading: &Heading,
    payload: &[u8],
) -> Result<Message, FrameError> {
    if heading.magic != configured_magic {
        return Err(FrameError::BadMagic);
    }
    if validate_checksum && checksum(payload) != heading.checksum {
        return Err(FrameError::BadChecksum);
    }
    let command = heading.command_str();
    let kind = Kind::from_command(&command);
    Message::decode_payload(kind, &command, payload).map_err(FrameError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[test]
    fn ping_pong_roundtrip() {
        let magic = Magic::BITCOIN;
        let frame = encode_frame(magic, &Message::Ping(42));
        let heading = Heading::decode(frame[..HEADING_LEN].try_into().unwrap());
        let payload = &frame[HEADING_LEN..];
        let msg = decode_frame(magic, true, &heading, payload).unwrap();
        assert!(matches!(msg, Message::Ping(42)));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let frame = encode_frame(Magic::BITCOIN, &Message::Verack);
        let heading = Heading::decode(frame[..HEADING_LEN].try_into().unwrap());
        let err = decode_frame(Magic::TESTNET, true, &heading, &frame[HEADING_LEN..]).unwrap_err();
        assert!(matches!(err, FrameError::BadMagic));
    }

    #[test]
    fn bad_checksum_is_rejected_when_enabled() {
        let magic = Magic::BITCOIN;
        let mut frame = encode_frame(magic, &Message::Ping(1));
        // Corrupt the payload without updating the checksum.
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let heading = Heading::decode(frame[..HEADING_LEN].try_into().unwrap());
        let err = decode_frame(magic, true, &heading, &frame[HEADING_LEN..]).unwrap_err();
        assert!(matches!(err, FrameError::BadChecksum));
    }

    #[test]
    fn checksum_skipped_when_disabled() {
        let magic = Magic::BITCOIN;
        let mut frame = encode_frame(magic, &Message::Ping(1));
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let heading = Heading::decode(frame[..HEADING_LEN].try_into().unwrap());
        // With checksum validation off, corrupted-but-structurally-valid bytes decode fine.
        assert!(decode_frame(magic, false, &heading, &frame[HEADING_LEN..]).is_ok());
    }

    #[test]
    fn unknown_command_is_unknown_kind() {
        let payload = b"hello".to_vec();
        let heading = Heading {
            magic: Magic::BITCOIN,
            command: pad_command("xversion"),
            payload_len: payload.len() as u32,
            checksum: checksum(&payload),
        };
        let msg = decode_frame(Magic::BITCOIN, true, &heading, &payload).unwrap();
        match msg {
            Message::Unknown { command, payload: p } => {
                assert_eq!(command, "xversion");
                assert_eq!(p, payload);
            }
            _ => panic!("expected Unknown"),
        }
    }

    #[test]
    fn truly_unrecognized_command_fails_to_decode() {
        let payload = b"hello".to_vec();
        let heading = Heading {
            magic: Magic::BITCOIN,
            command: pad_command("notarealkind"),
            payload_len: payload.len() as u32,
            checksum: checksum(&payload),
        };
        assert_eq!(Kind::from_command("notarealkind"), Kind::Unknown);
        let err = decode_frame(Magic::BITCOIN, true, &heading, &payload).unwrap_err();
        match err {
            FrameError::Malformed(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("expected Malformed(NotFound), got {other:?}"),
        }
    }

    #[test]
    fn address_socket_addr_from_message() {
        let addr = Address::new(
            &SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 8333),
            ServiceFlags::NONE,
        );
        assert_eq!(addr.socket_addr().unwrap().port(), 8333);
    }
}
