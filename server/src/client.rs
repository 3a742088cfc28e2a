//! Per-client connection state and command dispatch.
//!
//! A [`Client`] is keyed by its peer IP address (one logical client per
//! machine) and owns the sockets for that peer: the inbound TCP connection
//! is read by a task in the network module, the outbound TCP connection is
//! opened lazily when the first reply needs to go out, and the per-client
//! UDP socket is bound and connected once the join sequence reaches
//! `CreatePlayer`. Command handlers receive the session by mutable reference
//! for the duration of one message; nothing here holds onto it.

use log::{debug, info, warn};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use shared::{
    decode_bare_header, encode_utf16z, utf16z_len, Command, CreatePlayer, EnumSessions,
    EnumSessionsReply, Header, PacketBody, PlayerInfo, RequestPlayerId, RequestPlayerReply,
    SessionDesc, SockaddrIn, SuperEnumPlayersReply, SuperPackedPlayer, BARE_HEADER_SIZE,
    FAMILY_INET, HEADER_SIZE, PROTOCOL_VERSION, REQUEST_PLAYER_SYSTEM, SIGNATURE, SIZE_TOKEN,
    SUPER_PLAYER_SP_DATA_SHIFT,
};

use crate::network::ServerEvent;
use crate::session::{Player, Session};
use crate::transport::ReliableTransport;

/// State for one remote machine.
pub struct Client {
    addr: IpAddr,
    /// Well-known port the client listens on, for outbound TCP and UDP.
    client_port: u16,
    tcp_outgoing: Option<TcpStream>,
    udp: Option<Arc<UdpSocket>>,
    system_player_id: Option<u32>,
    transport: ReliableTransport,
    events: UnboundedSender<ServerEvent>,
    tcp_reader: Option<JoinHandle<()>>,
    udp_reader: Option<JoinHandle<()>>,
    tcp_generation: u64,
}

impl Client {
    pub fn new(addr: IpAddr, client_port: u16, events: UnboundedSender<ServerEvent>) -> Self {
        Self {
            addr,
            client_port,
            tcp_outgoing: None,
            udp: None,
            system_player_id: None,
            transport: ReliableTransport::new(),
            events,
            tcp_reader: None,
            udp_reader: None,
            tcp_generation: 0,
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn system_player_id(&self) -> Option<u32> {
        self.system_player_id
    }

    pub fn udp_connected(&self) -> bool {
        self.udp.is_some()
    }

    /// Adopts a freshly accepted inbound connection's reader task. A client
    /// reconnecting from the same address replaces the previous reader; the
    /// generation number lets the event loop ignore the stale one's close.
    pub fn set_tcp_reader(&mut self, reader: JoinHandle<()>, generation: u64) {
        if let Some(old) = self.tcp_reader.replace(reader) {
            old.abort();
        }
        self.tcp_generation = generation;
    }

    pub fn tcp_generation(&self) -> u64 {
        self.tcp_generation
    }

    /// Handles one complete top-level message, full header included.
    pub async fn handle_message(&mut self, session: &mut Session, data: &[u8]) {
        let header = match Header::decode(data) {
            Ok(header) => header,
            Err(e) => {
                warn!("bad message from {}: {}", self.addr, e);
                return;
            }
        };

        self.dispatch(session, header.command, &data[HEADER_SIZE..]).await;
    }

    /// Handles a datagram on the per-client UDP socket: runs it through the
    /// reliable transport, dispatches anything it delivers, sends any ack.
    pub async fn handle_udp_datagram(&mut self, session: &mut Session, datagram: &[u8]) {
        let tick = session.tick_count();
        let outcome = self.transport.handle_datagram(datagram, tick);

        if let Some(message) = outcome.delivered {
            self.handle_delivered(session, &message).await;
        }
        if let Some(ack) = outcome.ack {
            self.send_udp(&ack).await;
        }
    }

    /// A delivered reliable-protocol message is either a bare-header DPSP
    /// message or an opaque gameplay payload.
    async fn handle_delivered(&mut self, session: &mut Session, message: &[u8]) {
        if message.len() >= 4 && message[0..4] == SIGNATURE {
            match decode_bare_header(message) {
                Ok((command, _)) => {
                    self.dispatch(session, command, &message[BARE_HEADER_SIZE..]).await
                }
                Err(e) => warn!("bad delivered message from {}: {}", self.addr, e),
            }
        } else {
            debug!("game payload from {} ({} bytes): {}", self.addr, message.len(), hex_dump(message));
        }
    }

    async fn dispatch(&mut self, session: &mut Session, command: Command, body: &[u8]) {
        match command {
            Command::EnumSessions => self.handle_enum_sessions(session, body).await,
            Command::RequestPlayerId => self.handle_request_player_id(session, body).await,
            Command::CreatePlayer => self.handle_create_player(session, body).await,
            Command::AddForwardRequest => self.handle_add_forward_request(session, body).await,
            Command::Packet => self.handle_packet(session, body).await,
            other => warn!("unhandled command {:?} ({} byte body)", other, body.len()),
        }
    }

    async fn handle_enum_sessions(&mut self, session: &mut Session, body: &[u8]) {
        let request = match EnumSessions::decode(body) {
            Ok(request) => request,
            Err(e) => {
                warn!("enum sessions from {}: {}", self.addr, e);
                return;
            }
        };
        debug!("enum sessions from {} (flags {:#x})", self.addr, request.flags);

        // A probe for some other application; stay silent.
        if request.application_guid != *session.application_guid() {
            warn!("application GUID mismatch from {}", self.addr);
            return;
        }

        if !self.ensure_outgoing().await {
            return;
        }

        let reply_size = HEADER_SIZE + EnumSessionsReply::SIZE + utf16z_len(session.name());
        let mut reply = Vec::with_capacity(reply_size);
        self.push_header(&mut reply, reply_size, Command::EnumSessionsReply);
        EnumSessionsReply {
            session: describe_session(session),
            name_offset: (EnumSessionsReply::SIZE + 8) as u32,
        }
        .encode(&mut reply);
        encode_utf16z(session.name(), &mut reply);

        self.send_tcp(reply).await;
    }

    async fn handle_request_player_id(&mut self, session: &mut Session, body: &[u8]) {
        let request = match RequestPlayerId::decode(body) {
            Ok(request) => request,
            Err(e) => {
                warn!("player id request from {}: {}", self.addr, e);
                return;
            }
        };

        let is_system = request.flags & REQUEST_PLAYER_SYSTEM != 0;
        debug!("player id request from {} (system: {})", self.addr, is_system);

        let new_id = if is_system {
            if self.system_player_id.is_some() {
                warn!("{} requested a system player id but already has one", self.addr);
                return;
            }
            let id = session.create_system_player(0);
            self.system_player_id = Some(id);
            id
        } else {
            let Some(system_id) = self.system_player_id else {
                warn!("player id request from {} before a system player exists", self.addr);
                return;
            };
            match session.create_player(system_id, 0) {
                Some(id) => id,
                None => {
                    warn!("session full, dropping player id request from {}", self.addr);
                    return;
                }
            }
        };

        if !self.ensure_outgoing().await {
            return;
        }

        let reply_size = HEADER_SIZE + RequestPlayerReply::SIZE;
        let mut reply = Vec::with_capacity(reply_size);
        self.push_header(&mut reply, reply_size, Command::RequestPlayerReply);
        // Security descriptor and offsets stay zero.
        RequestPlayerReply { id: session.adjust_id(new_id), ..Default::default() }
            .encode(&mut reply);

        self.send_tcp(reply).await;
    }

    async fn handle_create_player(&mut self, session: &mut Session, body: &[u8]) {
        if !self.apply_player_info(session, body, "create player") {
            return;
        }

        // No reply. This is the last message before the client switches to
        // UDP, so direct the per-client socket at it now.
        self.connect_udp().await;
    }

    async fn handle_add_forward_request(&mut self, session: &mut Session, body: &[u8]) {
        if !self.apply_player_info(session, body, "add forward request") {
            return;
        }

        if !self.ensure_outgoing().await {
            return;
        }

        // A session in server-player-only mode would answer with the plain
        // EnumPlayersReply here; this host always sends the super variant.
        let mut players: Vec<&Player> = session.players().collect();
        players.sort_by_key(|p| p.id);

        let name_len = utf16z_len(session.name());
        let mut reply_size =
            HEADER_SIZE + SuperEnumPlayersReply::SIZE + SessionDesc::SIZE + name_len;
        for player in &players {
            reply_size += SuperPackedPlayer::SIZE;
            if !player.service_provider_data.is_empty() {
                reply_size += 1 + player.service_provider_data.len();
            }
        }

        // Offsets in the body are counted from the signature, 20 bytes in.
        let description_offset = HEADER_SIZE + SuperEnumPlayersReply::SIZE - 20;
        let name_offset = description_offset + SessionDesc::SIZE;
        let packed_offset = name_offset + name_len;

        let mut reply = Vec::with_capacity(reply_size);
        self.push_header(&mut reply, reply_size, Command::SuperEnumPlayersReply);
        SuperEnumPlayersReply {
            player_count: players.len() as u32,
            group_count: 0,
            packed_offset: packed_offset as u32,
            shortcut_count: 0,
            description_offset: description_offset as u32,
            name_offset: name_offset as u32,
            password_offset: 0,
        }
        .encode(&mut reply);
        describe_session(session).encode(&mut reply);
        encode_utf16z(session.name(), &mut reply);

        for player in &players {
            let sp_data = &player.service_provider_data;
            SuperPackedPlayer {
                size: 16,
                flags: player.flags,
                id: session.adjust_id(player.id),
                info_mask: if sp_data.is_empty() {
                    0
                } else {
                    1 << SUPER_PLAYER_SP_DATA_SHIFT
                },
                version_or_system_id: if player.is_system() {
                    PROTOCOL_VERSION as u32
                } else {
                    player.system_player_id
                },
            }
            .encode(&mut reply);

            // One-byte length variant; socket-address blobs always fit.
            if !sp_data.is_empty() {
                reply.push(sp_data.len() as u8);
                reply.extend_from_slice(sp_data);
            }
        }

        self.send_tcp(reply).await;
    }

    async fn handle_packet(&mut self, session: &mut Session, body: &[u8]) {
        let packet = match PacketBody::decode(body) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("packet from {}: {}", self.addr, e);
                return;
            }
        };

        if packet.total_packets != 1 {
            // Multi-fragment messages would need reassembly keyed by the
            // message GUID; nothing observed on the wire ever sends them.
            warn!(
                "fragmented packet {}/{} from {} dropped",
                packet.packet_index, packet.total_packets, self.addr
            );
            return;
        }

        // The nested message has no prefix: signature, command, version only.
        let inner = &body[PacketBody::SIZE..];
        let inner = &inner[..(packet.data_size as usize).min(inner.len())];
        match decode_bare_header(inner) {
            Ok((command, _)) => {
                Box::pin(self.dispatch(session, command, &inner[BARE_HEADER_SIZE..])).await
            }
            Err(e) => warn!("bad nested packet from {}: {}", self.addr, e),
        }
    }

    /// Parses the player-info region shared by `CreatePlayer` and
    /// `AddForwardRequest` and applies it to the referenced player.
    fn apply_player_info(&self, session: &mut Session, body: &[u8], context: &str) -> bool {
        let command = match CreatePlayer::decode(body) {
            Ok(command) => command,
            Err(e) => {
                warn!("{} from {}: {}", context, self.addr, e);
                return false;
            }
        };

        // The offset is counted from the signature; the body starts 8 bytes
        // after it.
        let offset = command.create_offset as usize;
        if offset < BARE_HEADER_SIZE || offset - BARE_HEADER_SIZE > body.len() {
            warn!("{} from {}: bad create offset {}", context, self.addr, offset);
            return false;
        }

        let info = match PlayerInfo::decode(&body[offset - BARE_HEADER_SIZE..]) {
            Ok(info) => info,
            Err(e) => {
                warn!("{} from {}: {}", context, self.addr, e);
                return false;
            }
        };

        let id = session.adjust_id(info.packed.player_id);
        let Some(player) = session.player_mut(id) else {
            warn!("{} from {}: player {:#010x} not found", context, self.addr, id);
            return false;
        };

        player.short_name = info.short_name;
        player.long_name = info.long_name;
        if !info.service_provider_data.is_empty() {
            player.service_provider_data = info.service_provider_data;
        }
        if !info.player_data.is_empty() {
            player.player_data = info.player_data;
        }

        true
    }

    /// Opens the outbound TCP connection if it isn't open yet.
    async fn ensure_outgoing(&mut self) -> bool {
        if self.tcp_outgoing.is_some() {
            return true;
        }

        info!("opening outgoing connection to {}", self.addr);
        match TcpStream::connect((self.addr, self.client_port)).await {
            Ok(stream) => {
                self.tcp_outgoing = Some(stream);
                true
            }
            Err(e) => {
                warn!("failed to open outgoing connection to {}: {}", self.addr, e);
                false
            }
        }
    }

    /// Binds an ephemeral UDP socket, connects it to the client's well-known
    /// port and starts forwarding its datagrams to the event loop.
    async fn connect_udp(&mut self) {
        if self.udp.is_some() {
            return;
        }

        let bind_addr = match self.addr {
            IpAddr::V4(_) => "0.0.0.0:0",
            IpAddr::V6(_) => "[::]:0",
        };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("failed to bind UDP socket for {}: {}", self.addr, e);
                return;
            }
        };
        if let Err(e) = socket.connect((self.addr, self.client_port)).await {
            warn!("failed to connect UDP socket to {}: {}", self.addr, e);
            return;
        }

        let socket = Arc::new(socket);
        self.udp = Some(socket.clone());

        let events = self.events.clone();
        let addr = self.addr;
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(len) => {
                        let event = ServerEvent::ClientDatagram { addr, data: buf[..len].to_vec() };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("UDP recv error for {}: {}", addr, e);
                        break;
                    }
                }
            }
        });

        if let Some(old) = self.udp_reader.replace(reader) {
            old.abort();
        }
    }

    fn push_header(&self, out: &mut Vec<u8>, size: usize, command: Command) {
        Header {
            size_token: size as u32 | SIZE_TOKEN << 20,
            sockaddr: SockaddrIn { family: FAMILY_INET, port: self.client_port, addr: 0 },
            command,
            version: PROTOCOL_VERSION,
        }
        .encode(out);
    }

    async fn send_tcp(&mut self, data: Vec<u8>) {
        let Some(stream) = &mut self.tcp_outgoing else {
            return;
        };
        if let Err(e) = stream.write_all(&data).await {
            warn!("failed to send {} byte reply to {}: {}", data.len(), self.addr, e);
        }
    }

    async fn send_udp(&self, data: &[u8]) {
        let Some(socket) = &self.udp else {
            return;
        };
        if let Err(e) = socket.send(data).await {
            warn!("failed to send ack to {}: {}", self.addr, e);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Reader tasks hold the inbound stream and the UDP socket; aborting
        // them closes both. The outbound stream closes with the record.
        if let Some(reader) = &self.tcp_reader {
            reader.abort();
        }
        if let Some(reader) = &self.udp_reader {
            reader.abort();
        }
    }
}

fn describe_session(session: &Session) -> SessionDesc {
    SessionDesc {
        size: SessionDesc::SIZE as u32,
        flags: session.flags(),
        instance_guid: *session.instance_guid(),
        application_guid: *session.application_guid(),
        max_players: session.max_players(),
        current_players: session.player_count(),
        name_ptr: 0,
        password_ptr: 0,
        reserved1: session.id_mask(),
        reserved2: 0,
        user1: 0,
        user2: 0,
        user3: 0,
        user4: 0,
    }
}

fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for byte in data {
        let _ = write!(out, "{:02X} ", byte);
    }
    out.trim_end().to_string()
}
