//! Stateless connection distributor.
//!
//! Picks a backend round-robin for each incoming connection, then copies
//! bytes in both directions until either side closes. Byte transparency is
//! what preserves the RESP framing; nothing here inspects the traffic.

use clap::Parser;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use emberdb::server;
use emberdb::Error;

#[derive(Parser, Debug)]
struct Args {
    /// The port to listen on
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Backend address to rotate across (repeatable), e.g. 127.0.0.1:9001
    #[arg(short, long = "backend", required = true)]
    backends: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt().try_init();

    let args = Args::parse();
    let listener = server::bind(args.port)?;

    info!("distributor listening on {}", listener.local_addr()?);

    let mut next = 0usize;
    loop {
        let (mut client, client_address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let backend_address = args.backends[next % args.backends.len()].clone();
        next = next.wrapping_add(1);
        debug!("Routing {:?} to {}", client_address, backend_address);

        tokio::spawn(async move {
            match TcpStream::connect(&backend_address).await {
                Ok(mut backend) => {
                    let _ = tokio::io::copy_bidirectional(&mut client, &mut backend).await;
                }
                Err(e) => error!("Connection to backend {} failed: {}", backend_address, e),
            }
        });
    }
}
