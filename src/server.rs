use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, instrument, warn};

use crate::codec;
use crate::commands::Command;
use crate::commands::executable::Executable;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

pub const DEFAULT_PORT: u16 = 9001;

const BACKLOG: u32 = 1024;

/// Builds the listening socket: any-interface bind, address (and on Unix,
/// port) reuse, backlog 1024. Failures here are startup failures; the
/// process should exit rather than try to serve.
pub fn bind(port: u16) -> Result<TcpListener, Error> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;

    Ok(socket.listen(BACKLOG)?)
}

pub async fn run(listener: TcpListener, store: Store) -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    info!("server listening on {}", listener.local_addr()?);

    loop {
        // A failed accept (e.g. fd exhaustion under connection pressure) is
        // not fatal; keep serving the connections that exist.
        let (socket, client_address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };
        let store = store.clone();
        debug!("Accepted connection from {:?}", client_address);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, client_address, store).await {
                error!(error = %e, "connection handler failed");
            }
        });
    }
}

#[instrument(
    name = "connection",
    skip(stream, store),
    fields(client_address = %client_address)
)]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    store: Store,
) -> Result<(), Error> {
    let mut conn = Connection::new(stream);

    loop {
        let frame = match conn.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break, // clean end of stream
            Err(codec::Error::Frame(e)) => {
                // The peer sent bytes that cannot be framed. Answer with an
                // error, drop what it sent so far, and keep the connection.
                debug!("Failed to parse frame: {}", e);
                conn.discard();
                conn.write_frame(&Frame::Error("ERR Invalid Command".to_string()))
                    .await?;
                continue;
            }
            Err(codec::Error::Io(e)) => {
                // Disconnects mid-frame close silently.
                debug!("Connection error: {}", e);
                break;
            }
        };

        debug!("Received frame from client: {}", frame);

        let reply = match Command::try_from(frame) {
            Ok(cmd) => cmd.exec(&store),
            Err(err) => err.to_reply(),
        };

        debug!("Sending response to client: {}", reply);
        conn.write_frame(&reply).await?;
    }

    debug!("Connection closed");
    Ok(())
}
