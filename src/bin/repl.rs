//! Interactive prompt over the storage engine, bypassing the network layer.
//!
//! Commands: `SET <key> <value>` (the value is the remainder of the line),
//! `GET <key>`, `DEL <key>`, `EXIT`/`QUIT`.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use emberdb::store::{Store, StoreOptions};
use emberdb::Error;

#[derive(Parser, Debug)]
struct Args {
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

    println!("Commands: SET <key> <value>, GET <key>, DEL <key>, EXIT");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt()?;
        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break, // stdin closed
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim_start()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "SET" => match rest.split_once(' ') {
                // The value is everything after the key, spaces included.
                Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                    store.set(key.to_string(), Bytes::copy_from_slice(value.as_bytes()));
                    println!("OK");
                }
                _ => println!("ERROR: SET takes a key and a value"),
            },
            "GET" if !rest.is_empty() => {
                let key = rest.split_whitespace().next().unwrap_or(rest);
                match store.get(key) {
                    Some(value) if !value.is_empty() => {
                        println!("{}", String::from_utf8_lossy(&value))
                    }
                    _ => println!("NULL"),
                }
            }
            "DEL" if !rest.is_empty() => {
                let key = rest.split_whitespace().next().unwrap_or(rest);
                if store.del(key) {
                    println!("OK");
                } else {
                    println!("Does not exist.");
                }
            }
            "EXIT" | "QUIT" => break,
            _ => println!("ERROR: Invalid command"),
        }
    }

    store.shutdown().await;

    Ok(())
}

fn prompt() -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()
}
