//! # DirectPlay Wire Protocol
//!
//! This crate contains everything both the server and test tooling need to
//! speak the DirectPlay service-provider (DPSP) message layer and the
//! "reliable protocol" (DPRP) datagram layer beneath it:
//!
//! - Fixed-layout binary structures with bit-exact encode/decode. All
//!   multi-byte integers are little-endian except `port` fields, which are
//!   network byte order. Sizes are contractual; every structure exposes a
//!   `SIZE` constant.
//! - The DPSP message header in both forms: the full 28-byte header carried
//!   by top-level TCP/UDP messages (size/token word plus a sockaddr block),
//!   and the bare 8-byte header (signature, command, version) used for
//!   bodies nested inside `Packet` and for messages delivered by the
//!   reliable transport.
//! - The command catalog and the flag constants for players, sessions and
//!   reliable-protocol frames.
//! - DPRP frame layout and the 1–3 byte variable-length peer-id encoding.
//! - UTF-16LE string conversion. Wire strings are NUL-terminated UTF-16LE
//!   and restricted to the Basic Multilingual Plane; the declared length
//!   fields include the two terminator bytes.
//! - The TCP stream scanner that frames one message at a time and tells the
//!   caller how many bytes it still needs.
//!
//! Everything here is a pure function over byte buffers. No I/O, no state.

use std::error::Error;
use std::fmt;

/// The four-byte signature carried by every DPSP message.
pub const SIGNATURE: [u8; 4] = *b"play";

/// The only protocol version this implementation speaks (DirectX 9 era).
pub const PROTOCOL_VERSION: u16 = 14;

/// Well-known UDP port DirectPlay clients broadcast session probes to.
pub const DISCOVERY_PORT: u16 = 47624;

/// Size of the full message header (size/token + sockaddr + bare header).
pub const HEADER_SIZE: usize = 28;

/// Size of the bare header: signature, command, version.
pub const BARE_HEADER_SIZE: usize = 8;

/// Size of the optional prefix (size/token word + sockaddr block).
pub const HEADER_PREFIX_SIZE: usize = HEADER_SIZE - BARE_HEADER_SIZE;

/// Token packed into the upper 12 bits of the size/token word on outbound
/// messages. The value itself is arbitrary; it just has to be consistent.
pub const SIZE_TOKEN: u32 = 0xFAB;

/// Address family for the sockaddr blocks we emit (AF_INET).
pub const FAMILY_INET: u16 = 2;

// Player flags.
pub const PLAYER_SYSTEM: u32 = 1 << 0;
pub const PLAYER_NAME_SERVER: u32 = 1 << 1;
pub const PLAYER_IN_GROUP: u32 = 1 << 2;
/// Accepted on the wire and ignored.
pub const PLAYER_SENDING_MACHINE: u32 = 1 << 3;

// Session flags. Only a few matter to this host; the rest are carried for
// completeness of the catalog.
pub const SESSION_NO_NEW_PLAYERS: u32 = 1 << 0;
pub const SESSION_MIGRATE_HOST: u32 = 1 << 2;
pub const SESSION_NO_PLAYER_TO_FROM: u32 = 1 << 3;
pub const SESSION_NO_JOIN: u32 = 1 << 5;
pub const SESSION_PING_TIMER: u32 = 1 << 6;
pub const SESSION_NO_DATA_CHANGE: u32 = 1 << 7;
pub const SESSION_USER_AUTH: u32 = 1 << 8;
pub const SESSION_PRIVATE: u32 = 1 << 9;
pub const SESSION_PASSWORD_REQUIRED: u32 = 1 << 10;
pub const SESSION_ROUTE_THROUGH_HOST: u32 = 1 << 11;
pub const SESSION_SERVER_PLAYER_ONLY: u32 = 1 << 12;
pub const SESSION_RELIABLE_PROTOCOL: u32 = 1 << 13;
pub const SESSION_NO_ORDER: u32 = 1 << 14;
pub const SESSION_OPTIMISE_LATENCY: u32 = 1 << 15;
pub const SESSION_ACQUIRE_VOICE: u32 = 1 << 16;
pub const SESSION_NO_SESSION_DESC_CHANGE: u32 = 1 << 17;

// RequestPlayerId flags.
pub const REQUEST_PLAYER_SYSTEM: u32 = 1 << 0;

// Super-packed player info mask. The three data fields each use a two-bit
// length-width code (1, 2 or 4 bytes) at the given shift.
pub const SUPER_PLAYER_SHORT_NAME: u32 = 1 << 0;
pub const SUPER_PLAYER_LONG_NAME: u32 = 1 << 1;
pub const SUPER_PLAYER_SP_DATA_SHIFT: u32 = 2;
pub const SUPER_PLAYER_PLAYER_DATA_SHIFT: u32 = 4;
pub const SUPER_PLAYER_PLAYER_COUNT_SHIFT: u32 = 6;
pub const SUPER_PLAYER_PARENT_ID: u32 = 1 << 8;
pub const SUPER_PLAYER_SHORTCUT_COUNT_SHIFT: u32 = 9;

// Reliable-protocol frame flags.
pub const FRAME_RELIABLE: u8 = 1 << 0;
pub const FRAME_ACK: u8 = 1 << 1;
pub const FRAME_SEND_ACK: u8 = 1 << 2;
pub const FRAME_END: u8 = 1 << 3;
pub const FRAME_START: u8 = 1 << 4;
pub const FRAME_COMMAND: u8 = 1 << 5;
/// Unsupported; frames carrying it are dropped.
pub const FRAME_BIG: u8 = 1 << 6;
/// Unsupported; frames carrying it are dropped.
pub const FRAME_EXTENDED: u8 = 1 << 7;

/// Errors produced while decoding wire data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes remain than a declared fixed structure requires.
    TruncatedInput { needed: usize, available: usize },
    /// The header's signature is not "play".
    BadSignature,
    /// The header's version field is not the supported value.
    UnsupportedVersion(u16),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedInput { needed, available } => {
                write!(f, "truncated input: need {} bytes, have {}", needed, available)
            }
            Self::BadSignature => write!(f, "bad message signature"),
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported protocol version {} (expected {})", v, PROTOCOL_VERSION)
            }
        }
    }
}

impl Error for WireError {}

pub type WireResult<T> = Result<T, WireError>;

fn ensure(data: &[u8], needed: usize) -> WireResult<()> {
    if data.len() < needed {
        Err(WireError::TruncatedInput { needed, available: data.len() })
    } else {
        Ok(())
    }
}

fn get_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn get_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Appends `s` as UTF-16LE including the two-byte NUL terminator.
///
/// Wire strings are BMP-only; scalar values above U+FFFF are replaced with
/// U+FFFD rather than encoded as surrogate pairs.
pub fn encode_utf16z(s: &str, out: &mut Vec<u8>) {
    for c in s.chars() {
        let unit = if (c as u32) > 0xFFFF { 0xFFFD } else { c as u32 as u16 };
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
}

/// Byte length `s` will occupy on the wire, terminator included.
pub fn utf16z_len(s: &str) -> usize {
    (s.chars().count() + 1) * 2
}

/// Decodes UTF-16LE bytes up to the first NUL unit (or the end of `data`).
///
/// Each unit is treated as a BMP scalar; surrogate code units become U+FFFD.
/// A trailing odd byte is ignored.
pub fn decode_utf16(data: &[u8]) -> String {
    let mut out = String::new();
    for pair in data.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            break;
        }
        out.push(char::from_u32(unit as u32).unwrap_or('\u{FFFD}'));
    }
    out
}

/// Encodes a reliable-protocol peer id as 1–3 little-endian 7-bit groups.
///
/// The top bit of every byte except the last is a continuation bit. Values
/// below 128 take one byte, values below 16384 take two, the rest three.
pub fn encode_peer_id(id: u16, out: &mut Vec<u8>) {
    if id < 0x80 {
        out.push(id as u8);
    } else if id < 0x4000 {
        out.push((id & 0x7F) as u8 | 0x80);
        out.push((id >> 7) as u8);
    } else {
        out.push((id & 0x7F) as u8 | 0x80);
        out.push(((id >> 7) & 0x7F) as u8 | 0x80);
        out.push((id >> 14) as u8);
    }
}

/// Decodes a variable-length peer id; returns the value and the bytes read.
pub fn decode_peer_id(data: &[u8]) -> WireResult<(u16, usize)> {
    ensure(data, 1)?;
    let b0 = data[0] as u16;
    if b0 & 0x80 == 0 {
        return Ok((b0, 1));
    }
    ensure(data, 2)?;
    let b1 = data[1] as u16;
    if b1 & 0x80 == 0 {
        return Ok(((b0 & 0x7F) | (b1 << 7), 2));
    }
    ensure(data, 3)?;
    let b2 = data[2] as u16;
    Ok(((b0 & 0x7F) | ((b1 & 0x7F) << 7) | (b2 << 14), 3))
}

/// The DPSP command catalog.
///
/// Only a handful of these are handled by the host; the rest exist so
/// unhandled traffic logs with a recognizable name instead of a bare number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    EnumSessionsReply,
    EnumSessions,
    EnumPlayersReply,
    EnumPlayer,
    RequestPlayerId,
    RequestGroupId,
    RequestPlayerReply,
    CreatePlayer,
    CreateGroup,
    PlayerMessage,
    DeletePlayer,
    DeleteGroup,
    AddPlayerToGroup,
    DeletePlayerFromGroup,
    PlayerDataChanged,
    PlayerNameChanged,
    GroupDataChanged,
    GroupNameChanged,
    AddForwardRequest,
    Packet,
    Ping,
    PingReply,
    YouAreDead,
    PlayerWrapper,
    SessionDescChanged,
    Challenge,
    AccessGranted,
    LogonDenied,
    AuthError,
    Negotiate,
    ChallengeResponse,
    Signed,
    AddForwardReply,
    Ask4Multicast,
    Ask4MulticastGuaranteed,
    AddShortcutToGroup,
    DeleteShortcutFromGroup,
    SuperEnumPlayersReply,
    Other(u16),
}

impl Command {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::EnumSessionsReply,
            2 => Self::EnumSessions,
            3 => Self::EnumPlayersReply,
            4 => Self::EnumPlayer,
            5 => Self::RequestPlayerId,
            6 => Self::RequestGroupId,
            7 => Self::RequestPlayerReply,
            8 => Self::CreatePlayer,
            9 => Self::CreateGroup,
            10 => Self::PlayerMessage,
            11 => Self::DeletePlayer,
            12 => Self::DeleteGroup,
            13 => Self::AddPlayerToGroup,
            14 => Self::DeletePlayerFromGroup,
            15 => Self::PlayerDataChanged,
            16 => Self::PlayerNameChanged,
            17 => Self::GroupDataChanged,
            18 => Self::GroupNameChanged,
            19 => Self::AddForwardRequest,
            21 => Self::Packet,
            22 => Self::Ping,
            23 => Self::PingReply,
            24 => Self::YouAreDead,
            25 => Self::PlayerWrapper,
            26 => Self::SessionDescChanged,
            28 => Self::Challenge,
            29 => Self::AccessGranted,
            30 => Self::LogonDenied,
            31 => Self::AuthError,
            32 => Self::Negotiate,
            33 => Self::ChallengeResponse,
            34 => Self::Signed,
            36 => Self::AddForwardReply,
            37 => Self::Ask4Multicast,
            38 => Self::Ask4MulticastGuaranteed,
            39 => Self::AddShortcutToGroup,
            40 => Self::DeleteShortcutFromGroup,
            41 => Self::SuperEnumPlayersReply,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Self::EnumSessionsReply => 1,
            Self::EnumSessions => 2,
            Self::EnumPlayersReply => 3,
            Self::EnumPlayer => 4,
            Self::RequestPlayerId => 5,
            Self::RequestGroupId => 6,
            Self::RequestPlayerReply => 7,
            Self::CreatePlayer => 8,
            Self::CreateGroup => 9,
            Self::PlayerMessage => 10,
            Self::DeletePlayer => 11,
            Self::DeleteGroup => 12,
            Self::AddPlayerToGroup => 13,
            Self::DeletePlayerFromGroup => 14,
            Self::PlayerDataChanged => 15,
            Self::PlayerNameChanged => 16,
            Self::GroupDataChanged => 17,
            Self::GroupNameChanged => 18,
            Self::AddForwardRequest => 19,
            Self::Packet => 21,
            Self::Ping => 22,
            Self::PingReply => 23,
            Self::YouAreDead => 24,
            Self::PlayerWrapper => 25,
            Self::SessionDescChanged => 26,
            Self::Challenge => 28,
            Self::AccessGranted => 29,
            Self::LogonDenied => 30,
            Self::AuthError => 31,
            Self::Negotiate => 32,
            Self::ChallengeResponse => 33,
            Self::Signed => 34,
            Self::AddForwardReply => 36,
            Self::Ask4Multicast => 37,
            Self::Ask4MulticastGuaranteed => 38,
            Self::AddShortcutToGroup => 39,
            Self::DeleteShortcutFromGroup => 40,
            Self::SuperEnumPlayersReply => 41,
            Self::Other(raw) => raw,
        }
    }
}

/// A sockaddr_in as it appears on the wire: family and address little-endian,
/// port in network byte order, padded to 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SockaddrIn {
    pub family: u16,
    /// Host byte order in memory; swapped on encode/decode.
    pub port: u16,
    pub addr: u32,
}

impl SockaddrIn {
    pub const SIZE: usize = 16;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        Ok(Self {
            family: get_u16(data, 0),
            port: u16::from_be_bytes([data[2], data[3]]),
            addr: get_u32(data, 4),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u16(out, self.family);
        out.extend_from_slice(&self.port.to_be_bytes());
        put_u32(out, self.addr);
        out.extend_from_slice(&[0u8; 8]);
    }
}

/// The fixed part of a packed player record. The variable region that
/// follows (names, service-provider data, player data) is described by the
/// length fields and parsed by [`PlayerInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedPlayer {
    pub size: u32,
    pub flags: u32,
    pub player_id: u32,
    /// Byte length of the short name including the NUL terminator; 0 if absent.
    pub short_name_len: u32,
    /// Byte length of the long name including the NUL terminator; 0 if absent.
    pub long_name_len: u32,
    pub sp_data_size: u32,
    pub player_data_size: u32,
    pub player_count: u32,
    pub system_player_id: u32,
    /// Must be 48.
    pub fixed_size: u32,
    pub version: u32,
    pub parent_id: u32,
}

impl PackedPlayer {
    pub const SIZE: usize = 48;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        Ok(Self {
            size: get_u32(data, 0),
            flags: get_u32(data, 4),
            player_id: get_u32(data, 8),
            short_name_len: get_u32(data, 12),
            long_name_len: get_u32(data, 16),
            sp_data_size: get_u32(data, 20),
            player_data_size: get_u32(data, 24),
            player_count: get_u32(data, 28),
            system_player_id: get_u32(data, 32),
            fixed_size: get_u32(data, 36),
            version: get_u32(data, 40),
            parent_id: get_u32(data, 44),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.size);
        put_u32(out, self.flags);
        put_u32(out, self.player_id);
        put_u32(out, self.short_name_len);
        put_u32(out, self.long_name_len);
        put_u32(out, self.sp_data_size);
        put_u32(out, self.player_data_size);
        put_u32(out, self.player_count);
        put_u32(out, self.system_player_id);
        put_u32(out, self.fixed_size);
        put_u32(out, self.version);
        put_u32(out, self.parent_id);
    }
}

/// A packed player record plus its trailing variable region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub packed: PackedPlayer,
    pub short_name: String,
    pub long_name: String,
    pub service_provider_data: Vec<u8>,
    pub player_data: Vec<u8>,
}

impl PlayerInfo {
    pub fn decode(data: &[u8]) -> WireResult<Self> {
        let packed = PackedPlayer::decode(data)?;
        let mut offset = PackedPlayer::SIZE;

        let short_len = packed.short_name_len as usize;
        ensure(data, offset + short_len)?;
        let short_name = decode_utf16(&data[offset..offset + short_len]);
        offset += short_len;

        let long_len = packed.long_name_len as usize;
        ensure(data, offset + long_len)?;
        let long_name = decode_utf16(&data[offset..offset + long_len]);
        offset += long_len;

        let sp_len = packed.sp_data_size as usize;
        ensure(data, offset + sp_len)?;
        let service_provider_data = data[offset..offset + sp_len].to_vec();
        offset += sp_len;

        let pd_len = packed.player_data_size as usize;
        ensure(data, offset + pd_len)?;
        let player_data = data[offset..offset + pd_len].to_vec();

        Ok(Self { packed, short_name, long_name, service_provider_data, player_data })
    }
}

/// Header of a super-packed player entry. Optional fields follow per the
/// info mask; this host only ever appends service-provider data with the
/// one-byte length variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SuperPackedPlayer {
    /// Header size, must be 16.
    pub size: u32,
    pub flags: u32,
    pub id: u32,
    pub info_mask: u32,
    /// Protocol version for system players, owning system-player id otherwise.
    pub version_or_system_id: u32,
}

impl SuperPackedPlayer {
    pub const SIZE: usize = 20;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        Ok(Self {
            size: get_u32(data, 0),
            flags: get_u32(data, 4),
            id: get_u32(data, 8),
            info_mask: get_u32(data, 12),
            version_or_system_id: get_u32(data, 16),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.size);
        put_u32(out, self.flags);
        put_u32(out, self.id);
        put_u32(out, self.info_mask);
        put_u32(out, self.version_or_system_id);
    }
}

/// Security descriptor. Zero-filled in every reply this host sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityDesc {
    pub size: u32,
    pub flags: u32,
    pub sspi_provider: u32,
    pub capi_provider: u32,
    pub capi_provider_type: u32,
    pub encryption_algorithm: u32,
}

impl SecurityDesc {
    pub const SIZE: usize = 24;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        Ok(Self {
            size: get_u32(data, 0),
            flags: get_u32(data, 4),
            sspi_provider: get_u32(data, 8),
            capi_provider: get_u32(data, 12),
            capi_provider_type: get_u32(data, 16),
            encryption_algorithm: get_u32(data, 20),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.size);
        put_u32(out, self.flags);
        put_u32(out, self.sspi_provider);
        put_u32(out, self.capi_provider);
        put_u32(out, self.capi_provider_type);
        put_u32(out, self.encryption_algorithm);
    }
}

/// The session description exchanged during enumeration and join.
///
/// `name_ptr` and `password_ptr` are placeholders for 32-bit pointers in the
/// original in-memory layout; they are always zero on the wire. `reserved1`
/// carries the id-obfuscation mask so clients can synchronize to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionDesc {
    pub size: u32,
    pub flags: u32,
    pub instance_guid: [u8; 16],
    pub application_guid: [u8; 16],
    pub max_players: u32,
    pub current_players: u32,
    pub name_ptr: u32,
    pub password_ptr: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub user1: u32,
    pub user2: u32,
    pub user3: u32,
    pub user4: u32,
}

impl SessionDesc {
    pub const SIZE: usize = 80;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        let mut instance_guid = [0u8; 16];
        instance_guid.copy_from_slice(&data[8..24]);
        let mut application_guid = [0u8; 16];
        application_guid.copy_from_slice(&data[24..40]);
        Ok(Self {
            size: get_u32(data, 0),
            flags: get_u32(data, 4),
            instance_guid,
            application_guid,
            max_players: get_u32(data, 40),
            current_players: get_u32(data, 44),
            name_ptr: get_u32(data, 48),
            password_ptr: get_u32(data, 52),
            reserved1: get_u32(data, 56),
            reserved2: get_u32(data, 60),
            user1: get_u32(data, 64),
            user2: get_u32(data, 68),
            user3: get_u32(data, 72),
            user4: get_u32(data, 76),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.size);
        put_u32(out, self.flags);
        out.extend_from_slice(&self.instance_guid);
        out.extend_from_slice(&self.application_guid);
        put_u32(out, self.max_players);
        put_u32(out, self.current_players);
        put_u32(out, self.name_ptr);
        put_u32(out, self.password_ptr);
        put_u32(out, self.reserved1);
        put_u32(out, self.reserved2);
        put_u32(out, self.user1);
        put_u32(out, self.user2);
        put_u32(out, self.user3);
        put_u32(out, self.user4);
    }
}

/// Full message header as carried by top-level TCP and UDP messages.
///
/// The low 20 bits of `size_token` hold the total message size including
/// this header; the upper 12 bits hold an arbitrary token. Nested bodies
/// (inside `Packet`, or delivered by the reliable transport) omit the prefix
/// entirely; use [`decode_bare_header`] for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub size_token: u32,
    pub sockaddr: SockaddrIn,
    pub command: Command,
    pub version: u16,
}

impl Header {
    pub const SIZE: usize = HEADER_SIZE;

    /// Decodes and validates a full header (signature and version checked).
    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        let sockaddr = SockaddrIn::decode(&data[4..])?;
        let (command, version) = decode_bare_header(&data[HEADER_PREFIX_SIZE..])?;
        Ok(Self { size_token: get_u32(data, 0), sockaddr, command, version })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.size_token);
        self.sockaddr.encode(out);
        out.extend_from_slice(&SIGNATURE);
        put_u16(out, self.command.raw());
        put_u16(out, self.version);
    }

    /// Total message size declared by the size/token word.
    pub fn declared_size(&self) -> usize {
        (self.size_token & 0xFFFFF) as usize
    }
}

/// Decodes the bare 8-byte header: signature, command, version.
pub fn decode_bare_header(data: &[u8]) -> WireResult<(Command, u16)> {
    ensure(data, BARE_HEADER_SIZE)?;
    if data[0..4] != SIGNATURE {
        return Err(WireError::BadSignature);
    }
    let version = get_u16(data, 6);
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    Ok((Command::from_raw(get_u16(data, 4)), version))
}

/// Result of scanning a byte buffer for one complete top-level message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageScan {
    /// One message of this many bytes is ready; more may follow in the buffer.
    Complete(usize),
    /// At least this many bytes are needed before scanning again.
    Incomplete(usize),
    /// Signature or version mismatch, or a nonsensical declared size.
    Rejected,
}

/// Frames one message out of a TCP receive buffer (or checks a datagram).
///
/// TCP readers must buffer and rescan on `Incomplete`; UDP datagrams are
/// expected to scan as `Complete` with the datagram's exact length.
pub fn scan_message(data: &[u8]) -> MessageScan {
    if data.len() < 4 {
        return MessageScan::Incomplete(HEADER_SIZE);
    }
    let size = (get_u32(data, 0) & 0xFFFFF) as usize;
    if size < HEADER_SIZE {
        return MessageScan::Rejected;
    }
    if data.len() < size {
        return MessageScan::Incomplete(size);
    }
    if data[HEADER_PREFIX_SIZE..HEADER_PREFIX_SIZE + 4] != SIGNATURE {
        return MessageScan::Rejected;
    }
    if get_u16(data, 26) != PROTOCOL_VERSION {
        return MessageScan::Rejected;
    }
    MessageScan::Complete(size)
}

// Command bodies. Offsets are relative to the end of the header.

/// `EnumSessions` request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnumSessions {
    pub application_guid: [u8; 16],
    pub password_offset: u32,
    pub flags: u32,
}

impl EnumSessions {
    pub const SIZE: usize = 24;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        let mut application_guid = [0u8; 16];
        application_guid.copy_from_slice(&data[0..16]);
        Ok(Self { application_guid, password_offset: get_u32(data, 16), flags: get_u32(data, 20) })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.application_guid);
        put_u32(out, self.password_offset);
        put_u32(out, self.flags);
    }
}

/// `EnumSessionsReply` body; the session name follows as UTF-16LE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnumSessionsReply {
    pub session: SessionDesc,
    /// Offset of the name, counted from the signature (body offset + 8).
    pub name_offset: u32,
}

impl EnumSessionsReply {
    pub const SIZE: usize = SessionDesc::SIZE + 4;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        Ok(Self {
            session: SessionDesc::decode(data)?,
            name_offset: get_u32(data, SessionDesc::SIZE),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        self.session.encode(out);
        put_u32(out, self.name_offset);
    }
}

/// `RequestPlayerId` request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestPlayerId {
    pub flags: u32,
}

impl RequestPlayerId {
    pub const SIZE: usize = 4;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        Ok(Self { flags: get_u32(data, 0) })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.flags);
    }
}

/// `RequestPlayerReply` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestPlayerReply {
    pub id: u32,
    pub security: SecurityDesc,
    pub sspi_offset: u32,
    pub capi_offset: u32,
    pub result: u32,
}

impl RequestPlayerReply {
    pub const SIZE: usize = 40;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        Ok(Self {
            id: get_u32(data, 0),
            security: SecurityDesc::decode(&data[4..])?,
            sspi_offset: get_u32(data, 28),
            capi_offset: get_u32(data, 32),
            result: get_u32(data, 36),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.id);
        self.security.encode(out);
        put_u32(out, self.sspi_offset);
        put_u32(out, self.capi_offset);
        put_u32(out, self.result);
    }
}

/// `CreatePlayer` body. `AddForwardRequest` uses the identical layout; the
/// extra fields it carries are simply zero/ignored for `CreatePlayer`.
///
/// `create_offset` locates the trailing [`PlayerInfo`], counted from the
/// signature (so `body[create_offset - 8..]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreatePlayer {
    pub id_to: u32,
    pub player_id: u32,
    pub group_id: u32,
    pub create_offset: u32,
    pub password_offset: u32,
}

impl CreatePlayer {
    pub const SIZE: usize = 20;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        Ok(Self {
            id_to: get_u32(data, 0),
            player_id: get_u32(data, 4),
            group_id: get_u32(data, 8),
            create_offset: get_u32(data, 12),
            password_offset: get_u32(data, 16),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.id_to);
        put_u32(out, self.player_id);
        put_u32(out, self.group_id);
        put_u32(out, self.create_offset);
        put_u32(out, self.password_offset);
    }
}

/// `Packet` container body; one nested bare-header message follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketBody {
    pub message_guid: [u8; 16],
    pub packet_index: u32,
    pub data_size: u32,
    pub offset: u32,
    pub total_packets: u32,
    pub message_size: u32,
    pub packed_offset: u32,
}

impl PacketBody {
    pub const SIZE: usize = 40;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        let mut message_guid = [0u8; 16];
        message_guid.copy_from_slice(&data[0..16]);
        Ok(Self {
            message_guid,
            packet_index: get_u32(data, 16),
            data_size: get_u32(data, 20),
            offset: get_u32(data, 24),
            total_packets: get_u32(data, 28),
            message_size: get_u32(data, 32),
            packed_offset: get_u32(data, 36),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_guid);
        put_u32(out, self.packet_index);
        put_u32(out, self.data_size);
        put_u32(out, self.offset);
        put_u32(out, self.total_packets);
        put_u32(out, self.message_size);
        put_u32(out, self.packed_offset);
    }
}

/// `SuperEnumPlayersReply` body. The session description, session name and
/// player entries follow at the recorded offsets (counted from the
/// signature, i.e. body offset + 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SuperEnumPlayersReply {
    pub player_count: u32,
    pub group_count: u32,
    pub packed_offset: u32,
    pub shortcut_count: u32,
    pub description_offset: u32,
    pub name_offset: u32,
    pub password_offset: u32,
}

impl SuperEnumPlayersReply {
    pub const SIZE: usize = 28;

    pub fn decode(data: &[u8]) -> WireResult<Self> {
        ensure(data, Self::SIZE)?;
        Ok(Self {
            player_count: get_u32(data, 0),
            group_count: get_u32(data, 4),
            packed_offset: get_u32(data, 8),
            shortcut_count: get_u32(data, 12),
            description_offset: get_u32(data, 16),
            name_offset: get_u32(data, 20),
            password_offset: get_u32(data, 24),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.player_count);
        put_u32(out, self.group_count);
        put_u32(out, self.packed_offset);
        put_u32(out, self.shortcut_count);
        put_u32(out, self.description_offset);
        put_u32(out, self.name_offset);
        put_u32(out, self.password_offset);
    }
}

/// One reliable-protocol frame.
///
/// Wire layout: varint `from_id`, varint `to_id`, then `flags`, `message_id`,
/// `sequence` and `serial` as single bytes, then the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub from_id: u16,
    pub to_id: u16,
    pub flags: u8,
    pub message_id: u8,
    pub sequence: u8,
    pub serial: u8,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Decodes a frame; also returns the length of the id prefix, which is
    /// excluded from the bytes-received accounting.
    pub fn decode(data: &'a [u8]) -> WireResult<(Self, usize)> {
        let (from_id, n_from) = decode_peer_id(data)?;
        let (to_id, n_to) = decode_peer_id(&data[n_from..])?;
        let id_len = n_from + n_to;
        ensure(data, id_len + 4)?;
        Ok((
            Self {
                from_id,
                to_id,
                flags: data[id_len],
                message_id: data[id_len + 1],
                sequence: data[id_len + 2],
                serial: data[id_len + 3],
                payload: &data[id_len + 4..],
            },
            id_len,
        ))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        encode_peer_id(self.from_id, out);
        encode_peer_id(self.to_id, out);
        out.push(self.flags);
        out.push(self.message_id);
        out.push(self.sequence);
        out.push(self.serial);
        out.extend_from_slice(self.payload);
    }
}
