// src/main.rs
// Operator tool for a relay link's persisted accumulator

use anyhow::{bail, Context, Result};
use btp_relay::mta::{compute_root, Direction, ExtAccumulator};
use btp_relay::relay::ACCUMULATOR_KEY;
use btp_relay::storage::{self, RocksBucket};
use clap::{Parser, Subcommand};
use log::info;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// RocksDB directory
    #[arg(long, default_value = "./data")]
    db: String,
    /// Link name (bucket prefix)
    #[arg(long)]
    link: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print height, offset and roots of the accumulator
    Status,
    /// Print the witness of a block against the accumulator at a given height
    Witness {
        /// Block height to prove
        #[arg(long)]
        height: u64,
        /// Accumulator height to prove against (defaults to the local height)
        #[arg(long)]
        at: Option<u64>,
        /// Accumulator offset the witness is for (defaults to the local offset)
        #[arg(long)]
        offset: Option<u64>,
        /// Leaf hash (hex) to check the witness against
        #[arg(long)]
        leaf: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let db = storage::open_db(&cli.db).with_context(|| format!("opening {}", cli.db))?;
    let bucket = Arc::new(RocksBucket::new(db, &cli.link));
    let mut acc = ExtAccumulator::new(bucket, ACCUMULATOR_KEY, 0, 0);
    acc.recover().context("recovering accumulator")?;
    info!("link {}: height {} offset {}", cli.link, acc.height(), acc.offset());

    match cli.command {
        Commands::Status => {
            println!("height:      {}", acc.height());
            println!("offset:      {}", acc.offset());
            println!("limit_roots: {}", acc.limit_roots());
            for (i, root) in acc.root_hashes().iter().enumerate() {
                match root {
                    Some(h) => println!("root[{:2}]:    {}", i, hex::encode(h)),
                    None => println!("root[{:2}]:    -", i),
                }
            }
        }
        Commands::Witness {
            height,
            at,
            offset,
            leaf,
        } => {
            let at = at.unwrap_or_else(|| acc.height());
            let offset = offset.unwrap_or_else(|| acc.offset());
            let (at, witness) = acc.witness_for_at(height, at, offset)?;
            println!("height: {}", height);
            println!("at:     {}", at);
            for w in &witness {
                let side = match w.direction {
                    Direction::Left => "L",
                    Direction::Right => "R",
                };
                println!("  {} {}", side, hex::encode(w.hash));
            }
            if let Some(leaf) = leaf {
                let bytes = hex::decode(leaf.trim_start_matches("0x")).context("leaf hex")?;
                let Ok(leaf) = <[u8; 32]>::try_from(bytes.as_slice()) else {
                    bail!("leaf must be 32 bytes, got {}", bytes.len());
                };
                acc.verify_at(&witness, &leaf, at)?;
                println!("verified: root {}", hex::encode(compute_root(&witness, &leaf)));
            }
        }
    }
    Ok(())
}
