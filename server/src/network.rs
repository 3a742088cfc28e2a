//! Socket handling and the server event loop.
//!
//! Reader tasks own the blocking side of every socket: one acceptor for the
//! TCP listener, one receiver for the discovery UDP socket, one reader per
//! inbound TCP connection (which also does the message framing) and one per
//! connected client UDP socket. They all funnel [`ServerEvent`]s through an
//! unbounded channel into [`Server::run`], a single loop that owns the
//! session and the client map and dispatches one event at a time. Events
//! from one client arrive in the order its bytes did; nothing is promised
//! across clients.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use shared::{
    scan_message, MessageScan, SockaddrIn, DISCOVERY_PORT, FAMILY_INET, HEADER_SIZE,
    PLAYER_NAME_SERVER, PLAYER_SENDING_MACHINE, SESSION_OPTIMISE_LATENCY,
    SESSION_RELIABLE_PROTOCOL,
};

use crate::client::Client;
use crate::config::ServerConfig;
use crate::session::Session;

/// Events delivered to the main loop by the socket reader tasks.
pub enum ServerEvent {
    /// A new inbound TCP connection was accepted.
    TcpAccepted { addr: IpAddr, stream: TcpStream },
    /// One complete framed message arrived on a client's inbound connection.
    TcpMessage { addr: IpAddr, data: Vec<u8> },
    /// A client's inbound connection closed; ends the client's lifetime.
    TcpClosed { addr: IpAddr, generation: u64 },
    /// A datagram arrived on the discovery socket.
    Discovery { addr: IpAddr, data: Vec<u8> },
    /// A datagram arrived on a client's connected UDP socket.
    ClientDatagram { addr: IpAddr, data: Vec<u8> },
}

/// The session host: owns the session, the client records and the listeners.
pub struct Server {
    session: Session,
    clients: HashMap<IpAddr, Client>,
    client_port: u16,
    tcp_port: u16,
    events_tx: UnboundedSender<ServerEvent>,
    events_rx: UnboundedReceiver<ServerEvent>,
    /// Bumped for every accepted connection so a replaced connection's
    /// reader can't tear down its successor.
    generation: u64,
}

impl Server {
    /// Binds the listeners and sets up the hosted session, including the
    /// host's own name-server player.
    pub async fn new(config: &ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let listen_ip: IpAddr = config.listen_addr.parse()?;

        let tcp_listener = TcpListener::bind(SocketAddr::new(listen_ip, config.port)).await?;
        let tcp_port = tcp_listener.local_addr()?.port();
        info!("listening on {}:{}", config.listen_addr, tcp_port);

        let discovery = UdpSocket::bind(SocketAddr::new(listen_ip, DISCOVERY_PORT)).await?;
        info!("bound discovery socket on port {}", DISCOVERY_PORT);

        let mut session = Session::new(
            config.session_name.clone(),
            config.application_guid,
            // What a real host advertises for a plain multiplayer session.
            SESSION_RELIABLE_PROTOCOL | SESSION_OPTIMISE_LATENCY,
            config.max_players,
            config.id_mask,
        );

        // The host's own presence: a name-server player whose
        // service-provider data is the TCP and UDP reach-me records.
        let local_id = session.create_system_player(PLAYER_NAME_SERVER | PLAYER_SENDING_MACHINE);
        let reach = SockaddrIn { family: FAMILY_INET, port: tcp_port, addr: 0 };
        let mut sp_data = Vec::with_capacity(SockaddrIn::SIZE * 2);
        reach.encode(&mut sp_data);
        reach.encode(&mut sp_data);
        if let Some(player) = session.player_mut(local_id) {
            player.service_provider_data = sp_data;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        spawn_acceptor(tcp_listener, events_tx.clone());
        spawn_discovery(discovery, events_tx.clone());

        Ok(Self {
            session,
            clients: HashMap::new(),
            client_port: config.client_port,
            tcp_port,
            events_tx,
            events_rx,
            generation: 0,
        })
    }

    /// Port the TCP listener actually bound (relevant when configured as 0).
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Runs the dispatch loop until shutdown is requested.
    pub async fn run(&mut self) {
        info!("session {:?} ready", self.session.name());

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("shutdown signal error: {}", e);
                    }
                    info!("shutting down");
                    break;
                }
            }
        }

        // Drop every client, closing its sockets and cascading its players
        // out of the session.
        let addrs: Vec<IpAddr> = self.clients.keys().copied().collect();
        for addr in addrs {
            self.remove_client(addr);
        }
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::TcpAccepted { addr, stream } => {
                self.generation += 1;
                let reader = spawn_tcp_reader(stream, addr, self.generation, self.events_tx.clone());
                let client = self
                    .clients
                    .entry(addr)
                    .or_insert_with(|| Client::new(addr, self.client_port, self.events_tx.clone()));
                client.set_tcp_reader(reader, self.generation);
            }

            ServerEvent::TcpMessage { addr, data } => {
                let Some(client) = self.clients.get_mut(&addr) else {
                    debug!("message from unknown client {}", addr);
                    return;
                };
                client.handle_message(&mut self.session, &data).await;
            }

            ServerEvent::TcpClosed { addr, generation } => {
                let Some(client) = self.clients.get(&addr) else {
                    return;
                };
                // A stale reader of a connection that was since replaced.
                if client.tcp_generation() != generation {
                    return;
                }
                info!("tcp disconnect {}", addr);
                self.remove_client(addr);
            }

            ServerEvent::Discovery { addr, data } => {
                let client = self
                    .clients
                    .entry(addr)
                    .or_insert_with(|| Client::new(addr, self.client_port, self.events_tx.clone()));

                // Each discovery datagram must hold exactly one message.
                match scan_message(&data) {
                    MessageScan::Complete(size) => {
                        if size != data.len() {
                            warn!("datagram size mismatch from {}: {}/{}", addr, size, data.len());
                        }
                        client.handle_message(&mut self.session, &data[..size]).await;
                    }
                    MessageScan::Incomplete(wanted) => {
                        warn!(
                            "truncated datagram from {}: need {} bytes, got {}",
                            addr,
                            wanted,
                            data.len()
                        );
                    }
                    MessageScan::Rejected => warn!("rejected datagram from {}", addr),
                }
            }

            ServerEvent::ClientDatagram { addr, data } => {
                let Some(client) = self.clients.get_mut(&addr) else {
                    debug!("datagram from unknown client {}", addr);
                    return;
                };
                client.handle_udp_datagram(&mut self.session, &data).await;
            }
        }
    }

    /// Dropping the record closes all three sockets; the cascade removes the
    /// client's system player and its subordinates from the session.
    fn remove_client(&mut self, addr: IpAddr) {
        if let Some(client) = self.clients.remove(&addr) {
            if let Some(system_id) = client.system_player_id() {
                self.session.delete_player(system_id);
            }
            info!("client {} removed", addr);
        }
    }
}

/// IPv4-mapped peers show up as `::ffff:a.b.c.d` on the dual-stack
/// listeners; fold them so TCP and UDP traffic key the same client record.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn spawn_acceptor(listener: TcpListener, events: UnboundedSender<ServerEvent>) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("tcp accept from {}", peer);
                    let addr = canonical_ip(peer.ip());
                    if events.send(ServerEvent::TcpAccepted { addr, stream }).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("accept failed: {}", e),
            }
        }
    });
}

fn spawn_discovery(socket: UdpSocket, events: UnboundedSender<ServerEvent>) {
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    debug!("udp recv {} bytes from {}", len, peer);
                    let addr = canonical_ip(peer.ip());
                    let event = ServerEvent::Discovery { addr, data: buf[..len].to_vec() };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("discovery recv failed: {}", e),
            }
        }
    });
}

/// Reads a client's inbound connection, frames messages (buffering partial
/// ones until enough bytes arrive) and forwards them to the event loop.
fn spawn_tcp_reader(
    mut stream: TcpStream,
    addr: IpAddr,
    generation: u64,
    events: UnboundedSender<ServerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending = Vec::new();
        let mut chunk = [0u8; 2048];

        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(len) => {
                    pending.extend_from_slice(&chunk[..len]);
                    loop {
                        match scan_message(&pending) {
                            MessageScan::Complete(size) => {
                                let message: Vec<u8> = pending.drain(..size).collect();
                                let event = ServerEvent::TcpMessage { addr, data: message };
                                if events.send(event).is_err() {
                                    return;
                                }
                            }
                            MessageScan::Incomplete(_) => break,
                            MessageScan::Rejected => {
                                // Resync by the declared length; the scanner
                                // guarantees at least four buffered bytes.
                                let declared = (u32::from_le_bytes([
                                    pending[0], pending[1], pending[2], pending[3],
                                ]) & 0xFFFFF) as usize;
                                let skip = declared.max(HEADER_SIZE).min(pending.len());
                                warn!("rejected message from {}, skipping {} bytes", addr, skip);
                                pending.drain(..skip);
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("tcp read error from {}: {}", addr, e);
                    break;
                }
            }
        }

        let _ = events.send(ServerEvent::TcpClosed { addr, generation });
    })
}
