use clap::Parser;
use log::info;
use server::network::Server;

/// Authoritative game server for the ship-combat world.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "9000")]
    port: u16,
    /// Maximum simultaneous clients
    #[clap(short, long, default_value = "100")]
    max_clients: usize,
    /// Simulation RNG seed (random when omitted)
    #[clap(short, long)]
    seed: Option<u64>,
    /// Unmanned ships to scatter across the world at startup
    #[clap(long, default_value = "20")]
    ships: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let seed = args.seed.unwrap_or_else(rand::random);
    info!("Starting with seed {:#018x}", seed);

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, args.max_clients, seed).await?;
    server.populate(args.ships);

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    }
}
