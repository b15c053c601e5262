//! Decodes a `.torrent` file and prints the fields a caller needs to start
//! a download: announce URL, info-hash, piece layout. Mirrors the
//! teacher's `main.rs` `decode`/`info` subcommands, generalized to the new
//! multi-file-aware [`transmission_core::Info`].

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use transmission_core::Torrent;

#[derive(Parser)]
#[command(about = "Inspect a .torrent file")]
struct Args {
    /// Path to the .torrent file.
    path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let torrent = Torrent::read_from_file(&args.path)
        .with_context(|| format!("reading {}", args.path.display()))?;
    let info_hash = torrent.info_hash().context("hashing info dict")?;

    println!("Tracker URL: {}", torrent.announce.as_deref().unwrap_or("(none)"));
    println!("Length: {}", torrent.info.total_length());
    println!("Info Hash: {info_hash}");
    println!("Piece Length: {}", torrent.info.piece_length);
    println!("Piece Hashes:");
    for piece in &torrent.info.pieces.0 {
        println!("{}", hex::encode(piece));
    }
    if torrent.info.is_private() {
        println!("Private: yes");
    }

    Ok(())
}
