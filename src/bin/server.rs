use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use emberdb::server;
use emberdb::store::{Store, StoreOptions};
use emberdb::Error;

#[derive(Parser, Debug)]
struct Args {
    /// The port to listen on
    #[arg(short, long, default_value_t = server::DEFAULT_PORT)]
    port: u16,

    /// Maximum number of keys held in memory before spilling to disk
    #[arg(long, default_value_t = 10_000)]
    capacity: usize,

    /// Path of the persistence file
    #[arg(long, default_value = "flush_data.txt")]
    file: PathBuf,

    /// Seconds between background flushes
    #[arg(long, default_value_t = 10)]
    flush_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let store = Store::open(StoreOptions {
        capacity: args.capacity,
        flush_interval: Duration::from_secs(args.flush_interval),
        persist_path: args.file,
    })?;
    let listener = server::bind(args.port)?;

    tokio::select! {
        res = server::run(listener, store.clone()) => res?,
        _ = tokio::signal::ctrl_c() => {}
    }

    // Join the flush worker so the final flush lands before exit.
    store.shutdown().await;

    Ok(())
}
