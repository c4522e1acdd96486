//! Control client for a running signsky daemon.

use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use signsky::config::DEFAULT_STATUS_PATH;
use signsky::state::{epoch_seconds, IfStatSnapshot};
use signsky::status::{decode_response, CTL_STATUS, STATUS_RESPONSE_LEN};

#[derive(Parser, Debug)]
#[command(name = "skyctl", version, about = "Query a running signsky daemon")]
struct Args {
    /// Path of the daemon's status socket.
    #[arg(short = 's', long = "socket", default_value = DEFAULT_STATUS_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show per-direction SA and traffic counters.
    Status,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("skyctl: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Status => status(&args),
    }
}

fn status(args: &Args) -> Result<()> {
    let client_path = std::env::temp_dir().join(format!("skyctl-{}", std::process::id()));
    let _ = std::fs::remove_file(&client_path);

    let socket = UnixDatagram::bind(&client_path)
        .with_context(|| format!("failed to bind client socket {:?}", client_path))?;
    socket
        .set_read_timeout(Some(Duration::from_secs(3)))
        .context("failed to set receive timeout")?;

    let result = request_status(&socket, args);
    let _ = std::fs::remove_file(&client_path);

    let (tx, rx) = result?;
    dump_ifstat("tx", &tx);
    dump_ifstat("rx", &rx);
    Ok(())
}

fn request_status(
    socket: &UnixDatagram,
    args: &Args,
) -> Result<(IfStatSnapshot, IfStatSnapshot)> {
    socket
        .send_to(&[CTL_STATUS], &args.socket)
        .with_context(|| format!("failed to reach daemon at {:?}", args.socket))?;

    let mut buf = [0u8; STATUS_RESPONSE_LEN];
    let n = socket
        .recv(&mut buf)
        .context("no response from daemon (is it running?)")?;

    match decode_response(&buf[..n]) {
        Some(pair) => Ok(pair),
        None => bail!("short response from daemon ({} bytes)", n),
    }
}

fn dump_ifstat(name: &str, stat: &IfStatSnapshot) {
    println!("{}", name);

    if stat.spi == 0 {
        println!("  spi            none");
    } else {
        println!("  spi            0x{:08x}", stat.spi);
    }

    println!("  pkt            {}", stat.packets);
    println!("  bytes          {}", stat.bytes);

    if stat.last == 0 {
        println!("  last packet    never");
    } else {
        println!(
            "  last packet    {} seconds ago",
            epoch_seconds().saturating_sub(stat.last)
        );
    }

    println!();
}
