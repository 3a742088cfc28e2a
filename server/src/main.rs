use clap::Parser;
use log::info;
use std::path::PathBuf;

use server::config::ServerConfig;
use server::network::Server;

/// DirectPlay session host emulator.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./config.ini")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info");
    }

    let args = Args::parse();
    let config = ServerConfig::load(&args.config)?;

    info!(
        "starting server on {} port {}, session {:?}",
        config.listen_addr, config.port, config.session_name
    );

    let mut server = Server::new(&config).await?;
    server.run().await;

    Ok(())
}
