use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use signsky::config::Config;
use signsky::keys::KeyCell;
use signsky::packet::PacketPool;
use signsky::proc::{self, ProcIo, ProcTable, RunAs, Stage};
use signsky::replay::ReplayWindow;
use signsky::ring::{Ring, RING_DEFAULT_CAPACITY};
use signsky::shm::Shared;
use signsky::state::SharedState;
use signsky::{clear, crypto, decrypt, encrypt, keying, status};

#[derive(Parser, Debug)]
#[command(
    name = "signsky",
    version,
    about = "Privilege-separated site-to-site VPN daemon"
)]
struct Args {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short = 'd', long = "foreground")]
    foreground: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("signsky: {:#}", e);
        std::process::exit(1);
    }
}

fn spawn_workers(
    table: &mut ProcTable,
    io: ProcIo,
    runas: &HashMap<Stage, RunAs>,
    config: &Config,
    keying_owner: Option<RunAs>,
) -> Result<()> {
    let creds = |stage: Stage| runas.get(&stage).copied();

    {
        let r = creds(Stage::Clear);
        table.spawn(Stage::Clear, move || clear::run(io, r))?;
    }
    {
        let r = creds(Stage::Crypto);
        table.spawn(Stage::Crypto, move || crypto::run(io, r))?;
    }
    {
        let r = creds(Stage::Encrypt);
        table.spawn(Stage::Encrypt, move || encrypt::run(io, r))?;
    }
    {
        let r = creds(Stage::Decrypt);
        table.spawn(Stage::Decrypt, move || decrypt::run(io, r))?;
    }
    {
        let r = creds(Stage::Keying);
        let path = config.keying_path.clone();
        table.spawn(Stage::Keying, move || keying::run(io, r, path, keying_owner))?;
    }

    Ok(())
}

fn run() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load(&args.config)?;

    // Resolve every configured user before forking anything; a typo in
    // the config should fail fast, not in a half-started daemon.
    let mut runas: HashMap<Stage, RunAs> = HashMap::new();
    for (stage, user) in &config.runas {
        let creds = proc::lookup_user(user)
            .with_context(|| format!("runas user for stage '{}'", stage.name()))?;
        runas.insert(*stage, creds);
    }
    for stage in Stage::ALL {
        if !runas.contains_key(&stage) {
            warn!(
                "no runas user configured for {}, keeping invoking credentials",
                stage.name()
            );
        }
    }
    let keying_owner = config
        .keying_owner
        .as_deref()
        .map(proc::lookup_user)
        .transpose()
        .context("keying-owner")?;
    let status_owner = config
        .status_owner
        .as_deref()
        .map(proc::lookup_user)
        .transpose()
        .context("status-owner")?;

    if !args.foreground && unsafe { libc::daemon(0, 0) } == -1 {
        return Err(std::io::Error::last_os_error()).context("failed to daemonize");
    }

    // All shared regions exist before the first fork so every worker
    // inherits them at the same addresses.
    let mut state = Shared::<SharedState>::create()?;
    unsafe { state.get_mut() }.init(config.local, config.peer);

    let mut pool = Shared::<PacketPool>::create()?;
    unsafe { pool.get_mut() }.init();

    let mut clear_ring = Shared::<Ring>::create()?;
    let mut crypto_ring = Shared::<Ring>::create()?;
    let mut encrypt_ring = Shared::<Ring>::create()?;
    let mut decrypt_ring = Shared::<Ring>::create()?;
    for ring in [
        &mut clear_ring,
        &mut crypto_ring,
        &mut encrypt_ring,
        &mut decrypt_ring,
    ] {
        unsafe { ring.get_mut() }.init(RING_DEFAULT_CAPACITY);
    }

    let tx = Shared::<KeyCell>::create()?;
    let rx = Shared::<KeyCell>::create()?;
    let arwin = Shared::<ReplayWindow>::create()?;

    let io = ProcIo {
        state: Some(state),
        pool: Some(pool),
        tx: Some(tx),
        rx: Some(rx),
        arwin: Some(arwin),
        clear: Some(clear_ring),
        crypto: Some(crypto_ring),
        encrypt: Some(encrypt_ring),
        decrypt: Some(decrypt_ring),
    };

    proc::signal_trap(libc::SIGINT);
    proc::signal_trap(libc::SIGHUP);
    proc::signal_trap(libc::SIGCHLD);

    let mut table = ProcTable::default();
    if let Err(e) = spawn_workers(&mut table, io, &runas, &config, keying_owner) {
        table.shutdown();
        return Err(e);
    }

    // Parent confinement: keep only the state (for status requests),
    // drop everything data-plane.
    let mut parent_io = io;
    proc::detach(&mut parent_io.pool);
    proc::detach(&mut parent_io.tx);
    proc::detach(&mut parent_io.rx);
    proc::detach(&mut parent_io.arwin);
    proc::detach(&mut parent_io.clear);
    proc::detach(&mut parent_io.crypto);
    proc::detach(&mut parent_io.encrypt);
    proc::detach(&mut parent_io.decrypt);
    let state = parent_io.state.expect("supervisor keeps the shared state");

    let status_sock = status::bind_control_socket(&config.status_path, status_owner)?;

    info!(
        "signsky up, peer {} local {}, {} workers",
        config.peer,
        config.local,
        Stage::ALL.len()
    );

    let mut failed = false;
    let mut running = true;
    while running {
        if let Some(sig) = proc::last_signal() {
            info!("parent received signal {}", sig);
            match sig {
                libc::SIGINT | libc::SIGHUP => {
                    running = false;
                    continue;
                }
                libc::SIGCHLD => {
                    // A worker died on its own; take the daemon down.
                    failed |= table.reap();
                    running = false;
                    continue;
                }
                _ => {}
            }
        }

        if proc::wait_readable(status_sock.as_raw_fd(), 1000) {
            status::handle_request(&status_sock, state.get());
        }
    }

    failed |= table.shutdown();

    let _ = std::fs::remove_file(&config.status_path);
    let _ = std::fs::remove_file(&config.keying_path);

    if failed {
        bail!("one or more workers exited abnormally");
    }

    info!("clean shutdown");
    Ok(())
}
