//! starkindex CLI — inspect indexer state.
//!
//! Usage:
//! ```bash
//! starkindex status ./index.db
//! starkindex info
//! ```

use std::env;
use std::process;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use starkindex_core::Storage;
use starkindex_storage::SqliteStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "info" => cmd_info(),
        "status" => {
            let Some(path) = args.get(2) else {
                eprintln!("status requires a database path");
                process::exit(1);
            };
            cmd_status(path).await?;
        }
        "version" | "--version" | "-V" => {
            println!("starkindex {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
    Ok(())
}

fn print_usage() {
    println!("starkindex {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-safe Starknet event indexer\n");
    println!("USAGE:");
    println!("    starkindex <COMMAND>\n");
    println!("COMMANDS:");
    println!("    status <db>  Show cursor and row counts for a SQLite database");
    println!("    info         Show engine defaults");
    println!("    version      Print version");
    println!("    help         Print this help");
}

fn cmd_info() {
    println!("StarkIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default historical concurrency: 8 workers");
    println!("  Default reorg window: 64 blocks");
    println!("  Default RPC timeout: 15s, WS handshake: 10s");
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}

async fn cmd_status(path: &str) -> anyhow::Result<()> {
    let storage = SqliteStorage::open(path)
        .await
        .with_context(|| format!("opening database at {path}"))?;
    storage.migrate().await.context("preparing schema")?;

    match storage.cursor().await.context("reading cursor")? {
        Some(cursor) => {
            println!("cursor: block {} ({})", cursor.block_number, cursor.block_hash)
        }
        None => println!("cursor: none (never started)"),
    }
    println!("blocks: {}", storage.block_count().await.context("counting blocks")?);
    println!("events: {}", storage.event_count().await.context("counting events")?);
    Ok(())
}
