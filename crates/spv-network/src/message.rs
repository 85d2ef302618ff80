//! P2P protocol messages.
//!
//! All integers are little-endian except network-address ports. Lists are
//! prefixed with a CompactSize count.

use crate::{NetworkError, NetworkResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use spv_consensus::merkle::MerkleBlockMessage;
use spv_consensus::params::{VERSION_WITH_ADDR_FROM, VERSION_WITH_RELAY};
use spv_consensus::{BlockHeader, Hash256, Transaction, HEADER_SIZE};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Maximum inventory entries in one message.
pub const MAX_INV_ENTRIES: usize = 50_000;

/// Maximum locator hashes in `getblocks`/`getheaders`.
pub const MAX_LOCATOR_HASHES: usize = 2_000;

/// Maximum headers in one `headers` message.
pub const MAX_HEADERS: usize = 2_000;

/// Maximum addresses in one `addr` message.
pub const MAX_ADDR_ENTRIES: usize = 1_000;

/// Bounds-checked reader over a payload.
pub(crate) struct Reader {
    buf: Bytes,
}

impl Reader {
    pub(crate) fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> NetworkResult<()> {
        if self.buf.remaining() < n {
            return Err(NetworkError::InvalidMessage(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub(crate) fn u8(&mut self) -> NetworkResult<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16_be(&mut self) -> NetworkResult<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self) -> NetworkResult<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn i32(&mut self) -> NetworkResult<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32_le())
    }

    pub(crate) fn u64(&mut self) -> NetworkResult<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64_le())
    }

    pub(crate) fn i64(&mut self) -> NetworkResult<i64> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64_le())
    }

    pub(crate) fn bytes(&mut self, n: usize) -> NetworkResult<Bytes> {
        self.need(n, "bytes")?;
        Ok(self.buf.copy_to_bytes(n))
    }

    pub(crate) fn hash(&mut self) -> NetworkResult<Hash256> {
        self.need(32, "hash")?;
        let mut out = [0u8; 32];
        self.buf.copy_to_slice(&mut out);
        Ok(Hash256(out))
    }

    pub(crate) fn var_int(&mut self) -> NetworkResult<u64> {
        match self.u8()? {
            0xfd => {
                self.need(2, "varint")?;
                Ok(self.buf.get_u16_le() as u64)
            }
            0xfe => Ok(self.u32()? as u64),
            0xff => self.u64(),
            n => Ok(n as u64),
        }
    }

    /// CompactSize count, rejected above `max`.
    pub(crate) fn count(&mut self, max: usize, what: &str) -> NetworkResult<usize> {
        let n = self.var_int()?;
        if n > max as u64 {
            return Err(NetworkError::InvalidMessage(format!(
                "{} count {} exceeds {}",
                what, n, max
            )));
        }
        Ok(n as usize)
    }

    pub(crate) fn var_str(&mut self) -> NetworkResult<String> {
        let len = self.count(self.remaining(), "string")?;
        let raw = self.bytes(len)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    pub(crate) fn header(&mut self) -> NetworkResult<BlockHeader> {
        let raw = self.bytes(HEADER_SIZE)?;
        BlockHeader::parse(&raw).map_err(|e| NetworkError::InvalidMessage(e.to_string()))
    }

    pub(crate) fn rest(&mut self) -> Bytes {
        let n = self.buf.remaining();
        self.buf.copy_to_bytes(n)
    }
}

/// Write a CompactSize integer.
pub fn put_var_int(buf: &mut BytesMut, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        }
    }
}

fn put_var_str(buf: &mut BytesMut, s: &str) {
    put_var_int(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

/// 26-byte network address (without timestamp).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    /// Advertised service bits.
    pub services: u64,
    /// IPv6 (or IPv4-mapped) address.
    pub ip: [u8; 16],
    /// Port.
    pub port: u16,
}

impl NetworkAddress {
    /// Build from a socket address.
    pub fn new(addr: &SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    /// The all-zero address.
    pub fn unspecified() -> Self {
        Self {
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }

    /// IPv4 address when this is an IPv4-mapped address.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        Ipv6Addr::from(self.ip).to_ipv4_mapped()
    }

    fn read(r: &mut Reader) -> NetworkResult<Self> {
        let services = r.u64()?;
        let raw = r.bytes(16)?;
        let mut ip = [0u8; 16];
        ip.copy_from_slice(&raw);
        let port = r.u16_be()?;
        Ok(Self { services, ip, port })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.services);
        buf.put_slice(&self.ip);
        buf.put_u16(self.port);
    }
}

/// `addr` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedAddress {
    /// Last-seen time.
    pub timestamp: u32,
    /// Address.
    pub address: NetworkAddress,
}

/// `version` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// Protocol version.
    pub protocol_version: i32,
    /// Service bits.
    pub services: u64,
    /// Sender's clock, Unix seconds.
    pub timestamp: i64,
    /// Address of the receiving node.
    pub recv_address: NetworkAddress,
    /// Address of the sending node.
    pub from_address: NetworkAddress,
    /// Random nonce for self-connection detection.
    pub nonce: u64,
    /// User agent.
    pub user_agent: String,
    /// Sender's best height.
    pub start_height: i32,
    /// Whether the peer should relay transactions before a filter is set.
    pub relay: bool,
}

impl VersionMessage {
    fn read(r: &mut Reader) -> NetworkResult<Self> {
        let protocol_version = r.i32()?;
        let services = r.u64()?;
        let timestamp = r.i64()?;
        let recv_address = NetworkAddress::read(r)?;

        let mut message = Self {
            protocol_version,
            services,
            timestamp,
            recv_address,
            from_address: NetworkAddress::unspecified(),
            nonce: 0,
            user_agent: String::new(),
            start_height: 0,
            relay: true,
        };

        if protocol_version >= VERSION_WITH_ADDR_FROM {
            message.from_address = NetworkAddress::read(r)?;
            message.nonce = r.u64()?;
            message.user_agent = r.var_str()?;
            message.start_height = r.i32()?;
        }
        if protocol_version >= VERSION_WITH_RELAY && r.remaining() > 0 {
            message.relay = r.u8()? != 0;
        }

        Ok(message)
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.protocol_version);
        buf.put_u64_le(self.services);
        buf.put_i64_le(self.timestamp);
        self.recv_address.write(buf);
        if self.protocol_version >= VERSION_WITH_ADDR_FROM {
            self.from_address.write(buf);
            buf.put_u64_le(self.nonce);
            put_var_str(buf, &self.user_agent);
            buf.put_i32_le(self.start_height);
        }
        if self.protocol_version >= VERSION_WITH_RELAY {
            buf.put_u8(self.relay as u8);
        }
    }
}

/// Inventory item type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryType {
    /// Ignorable.
    Error,
    /// Transaction.
    Tx,
    /// Full block.
    Block,
    /// Merkle block (BIP37).
    FilteredBlock,
    /// Compact block (BIP152).
    CompactBlock,
    /// Anything else.
    Other(u32),
}

impl From<u32> for InventoryType {
    fn from(value: u32) -> Self {
        match value {
            0 => InventoryType::Error,
            1 => InventoryType::Tx,
            2 => InventoryType::Block,
            3 => InventoryType::FilteredBlock,
            4 => InventoryType::CompactBlock,
            other => InventoryType::Other(other),
        }
    }
}

impl From<InventoryType> for u32 {
    fn from(value: InventoryType) -> Self {
        match value {
            InventoryType::Error => 0,
            InventoryType::Tx => 1,
            InventoryType::Block => 2,
            InventoryType::FilteredBlock => 3,
            InventoryType::CompactBlock => 4,
            InventoryType::Other(other) => other,
        }
    }
}

/// (type, hash) announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryItem {
    /// Item type.
    pub kind: InventoryType,
    /// Item hash.
    pub hash: Hash256,
}

impl InventoryItem {
    /// Create an item.
    pub fn new(kind: InventoryType, hash: Hash256) -> Self {
        Self { kind, hash }
    }
}

/// `getblocks` / `getheaders` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMessage {
    /// Protocol version.
    pub version: u32,
    /// Block locator, newest first.
    pub locator: Vec<Hash256>,
    /// Last hash wanted, or zero for as many as allowed.
    pub stop_hash: Hash256,
}

/// `filterload` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoadMessage {
    /// Filter bit field.
    pub filter: Vec<u8>,
    /// Number of hash functions.
    pub hash_funcs: u32,
    /// Seed tweak.
    pub tweak: u32,
    /// Update flags.
    pub flags: u8,
}

/// `reject` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    /// Rejected command.
    pub message: String,
    /// Reject code.
    pub code: u8,
    /// Human readable reason.
    pub reason: String,
    /// Rejected object hash, when present.
    pub data: Option<Hash256>,
}

/// A decoded P2P message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    VerAck,
    Ping(u64),
    Pong(u64),
    Inv(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    GetHeaders(GetBlocksMessage),
    GetBlocks(GetBlocksMessage),
    Headers(Vec<BlockHeader>),
    MerkleBlock(MerkleBlockMessage),
    Addr(Vec<TimestampedAddress>),
    Tx(Transaction),
    MemPool,
    FilterLoad(FilterLoadMessage),
    Reject(RejectMessage),
    /// A command this client does not handle.
    Unknown { command: String },
}

impl Message {
    /// Wire command name.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::GetHeaders(_) => "getheaders",
            Message::GetBlocks(_) => "getblocks",
            Message::Headers(_) => "headers",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Addr(_) => "addr",
            Message::Tx(_) => "tx",
            Message::MemPool => "mempool",
            Message::FilterLoad(_) => "filterload",
            Message::Reject(_) => "reject",
            Message::Unknown { command } => command,
        }
    }

    /// Serialize the payload (without envelope).
    pub fn encode_payload(&self) -> NetworkResult<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Message::Version(v) => v.write(&mut buf),
            Message::VerAck | Message::MemPool => {}
            Message::Ping(nonce) | Message::Pong(nonce) => buf.put_u64_le(*nonce),
            Message::Inv(items) | Message::GetData(items) => {
                put_var_int(&mut buf, items.len() as u64);
                for item in items {
                    buf.put_u32_le(item.kind.into());
                    buf.put_slice(item.hash.as_bytes());
                }
            }
            Message::GetHeaders(m) | Message::GetBlocks(m) => {
                buf.put_u32_le(m.version);
                put_var_int(&mut buf, m.locator.len() as u64);
                for hash in &m.locator {
                    buf.put_slice(hash.as_bytes());
                }
                buf.put_slice(m.stop_hash.as_bytes());
            }
            Message::Headers(headers) => {
                put_var_int(&mut buf, headers.len() as u64);
                for header in headers {
                    buf.put_slice(&header.serialize());
                    put_var_int(&mut buf, 0);
                }
            }
            Message::MerkleBlock(m) => {
                buf.put_slice(&m.header.serialize());
                buf.put_u32_le(m.tx_count);
                put_var_int(&mut buf, m.hashes.len() as u64);
                for hash in &m.hashes {
                    buf.put_slice(hash.as_bytes());
                }
                put_var_int(&mut buf, m.flags.len() as u64);
                buf.put_slice(&m.flags);
            }
            Message::Addr(entries) => {
                put_var_int(&mut buf, entries.len() as u64);
                for entry in entries {
                    buf.put_u32_le(entry.timestamp);
                    entry.address.write(&mut buf);
                }
            }
            Message::Tx(tx) => buf.put_slice(&tx.raw),
            Message::FilterLoad(f) => {
                put_var_int(&mut buf, f.filter.len() as u64);
                buf.put_slice(&f.filter);
                buf.put_u32_le(f.hash_funcs);
                buf.put_u32_le(f.tweak);
                buf.put_u8(f.flags);
            }
            Message::Reject(r) => {
                put_var_str(&mut buf, &r.message);
                buf.put_u8(r.code);
                put_var_str(&mut buf, &r.reason);
                if let Some(hash) = &r.data {
                    buf.put_slice(hash.as_bytes());
                }
            }
            Message::Unknown { command } => {
                return Err(NetworkError::InvalidMessage(format!(
                    "cannot encode unknown command {}",
                    command
                )))
            }
        }
        Ok(buf.freeze())
    }

    /// Parse a payload for `command`.
    pub fn decode(command: &str, payload: Bytes) -> NetworkResult<Self> {
        let mut r = Reader::new(payload);
        let message = match command {
            "version" => Message::Version(VersionMessage::read(&mut r)?),
            "verack" => Message::VerAck,
            "ping" => Message::Ping(r.u64()?),
            "pong" => Message::Pong(r.u64()?),
            "inv" => Message::Inv(read_inventory(&mut r)?),
            "getdata" => Message::GetData(read_inventory(&mut r)?),
            "getheaders" => Message::GetHeaders(read_get_blocks(&mut r)?),
            "getblocks" => Message::GetBlocks(read_get_blocks(&mut r)?),
            "headers" => {
                let count = r.count(MAX_HEADERS, "headers")?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(r.header()?);
                    r.var_int()?;
                }
                Message::Headers(headers)
            }
            "merkleblock" => {
                let header = r.header()?;
                let tx_count = r.u32()?;
                let hash_count = r.count(r.remaining() / 32, "merkle hashes")?;
                let mut hashes = Vec::with_capacity(hash_count);
                for _ in 0..hash_count {
                    hashes.push(r.hash()?);
                }
                let flag_count = r.count(r.remaining(), "merkle flags")?;
                let flags = r.bytes(flag_count)?.to_vec();
                Message::MerkleBlock(MerkleBlockMessage {
                    header,
                    tx_count,
                    hashes,
                    flags,
                })
            }
            "addr" => {
                let count = r.count(MAX_ADDR_ENTRIES, "addr")?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let timestamp = r.u32()?;
                    let address = NetworkAddress::read(&mut r)?;
                    entries.push(TimestampedAddress { timestamp, address });
                }
                Message::Addr(entries)
            }
            "tx" => Message::Tx(Transaction::from_raw(r.rest().to_vec())),
            "mempool" => Message::MemPool,
            "filterload" => {
                let len = r.count(r.remaining(), "filter")?;
                let filter = r.bytes(len)?.to_vec();
                Message::FilterLoad(FilterLoadMessage {
                    filter,
                    hash_funcs: r.u32()?,
                    tweak: r.u32()?,
                    flags: r.u8()?,
                })
            }
            "reject" => {
                let message = r.var_str()?;
                let code = r.u8()?;
                let reason = r.var_str()?;
                let data = if r.remaining() >= 32 { Some(r.hash()?) } else { None };
                Message::Reject(RejectMessage {
                    message,
                    code,
                    reason,
                    data,
                })
            }
            other => Message::Unknown {
                command: other.to_string(),
            },
        };
        Ok(message)
    }
}

fn read_inventory(r: &mut Reader) -> NetworkResult<Vec<InventoryItem>> {
    let count = r.count(MAX_INV_ENTRIES, "inventory")?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = InventoryType::from(r.u32()?);
        items.push(InventoryItem::new(kind, r.hash()?));
    }
    Ok(items)
}

fn read_get_blocks(r: &mut Reader) -> NetworkResult<GetBlocksMessage> {
    let version = r.u32()?;
    let count = r.count(MAX_LOCATOR_HASHES, "locator")?;
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(r.hash()?);
    }
    Ok(GetBlocksMessage {
        version,
        locator,
        stop_hash: r.hash()?,
    })
}
