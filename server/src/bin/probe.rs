//! Manual smoke-test client: broadcast an `EnumSessions` probe at a running
//! host and print the session description it answers with.
//!
//! The host replies over a TCP connection it opens back to us, so this tool
//! listens on the well-known client port before sending the probe.

use clap::Parser;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;

use server::config::parse_guid;
use shared::{
    scan_message, Command, EnumSessions, EnumSessionsReply, Header, MessageScan, SockaddrIn,
    BARE_HEADER_SIZE, DISCOVERY_PORT, HEADER_SIZE, PROTOCOL_VERSION, SIZE_TOKEN,
};

/// DirectPlay session enumeration probe.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Host to probe
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Discovery port the host listens on
    #[arg(short, long, default_value_t = DISCOVERY_PORT)]
    port: u16,

    /// Application GUID to probe for (36-character hyphenated hex)
    #[arg(short, long)]
    guid: String,

    /// Local port to accept the host's reply connection on
    #[arg(short, long, default_value_t = 2300)]
    listen_port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let application_guid =
        parse_guid(&args.guid).ok_or_else(|| format!("invalid GUID {:?}", args.guid))?;

    // The host connects back to the probing machine; listen first.
    let listener = TcpListener::bind(("0.0.0.0", args.listen_port)).await?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let message = build_probe(application_guid);
    socket.send_to(&message, (args.host.as_str(), args.port)).await?;
    println!("Probe sent to {}:{}", args.host, args.port);

    let (mut stream, peer) = timeout(Duration::from_secs(5), listener.accept()).await??;
    println!("Reply connection from {}", peer);

    let mut pending = Vec::new();
    let mut chunk = [0u8; 2048];
    loop {
        match scan_message(&pending) {
            MessageScan::Complete(size) => {
                print_reply(&pending[..size]);
                return Ok(());
            }
            MessageScan::Incomplete(_) => {
                let len = timeout(Duration::from_secs(5), stream.read(&mut chunk)).await??;
                if len == 0 {
                    return Err("host closed the reply connection early".into());
                }
                pending.extend_from_slice(&chunk[..len]);
            }
            MessageScan::Rejected => return Err("host sent an unparseable reply".into()),
        }
    }
}

fn build_probe(application_guid: [u8; 16]) -> Vec<u8> {
    let size = HEADER_SIZE + EnumSessions::SIZE;
    let mut out = Vec::with_capacity(size);
    Header {
        size_token: size as u32 | SIZE_TOKEN << 20,
        sockaddr: SockaddrIn::default(),
        command: Command::EnumSessions,
        version: PROTOCOL_VERSION,
    }
    .encode(&mut out);
    EnumSessions { application_guid, password_offset: 0, flags: 0 }.encode(&mut out);
    out
}

fn print_reply(message: &[u8]) {
    let Ok(header) = Header::decode(message) else {
        println!("Unparseable reply header");
        return;
    };
    if header.command != Command::EnumSessionsReply {
        println!("Unexpected reply command {:?}", header.command);
        return;
    }

    let body = &message[HEADER_SIZE..];
    let Ok(reply) = EnumSessionsReply::decode(body) else {
        println!("Unparseable session description");
        return;
    };

    // The name offset is counted from the signature.
    let name = match (reply.name_offset as usize).checked_sub(BARE_HEADER_SIZE) {
        Some(start) if start <= body.len() => shared::decode_utf16(&body[start..]),
        _ => String::new(),
    };

    println!("Session: {:?}", name);
    println!(
        "  players: {}/{}",
        reply.session.current_players, reply.session.max_players
    );
    println!("  flags: {:#010x}", reply.session.flags);
    println!("  id mask: {:#010x}", reply.session.reserved1);
    print!("  instance GUID:");
    for byte in reply.session.instance_guid {
        print!(" {:02x}", byte);
    }
    println!();
}
