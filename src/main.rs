//-
// Copyright (c) 2026, Postern contributors
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

//! The Postern daemon.
//!
//! A thin host around the library: it accepts TCP connections, drives each
//! one through `serve`, and spools every accepted message into a directory
//! as a `.eml` file with the envelope recorded in `X-Postern-*` headers.

use std::fs;
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};
use structopt::StructOpt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use postern::addr::parse_address;
use postern::support::sysexits::*;
use postern::{
    serve, Delivery, Error, LogPrefix, Request, Session, SmtpConfig,
    SystemConfig, Verify,
};

/// Accept ESMTP connections and spool accepted messages to a directory.
#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Opt {
    /// The address to listen on.
    #[structopt(long, short, default_value = "127.0.0.1:2525")]
    listen: String,

    /// Read configuration from this TOML file.
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// The host name to announce. Overrides the configuration file.
    #[structopt(long)]
    host_name: Option<String>,

    /// The maximum message size in bytes. Overrides the configuration file.
    #[structopt(long)]
    max_message_size: Option<u64>,

    /// The directory to spool accepted messages into.
    #[structopt(long, parse(from_os_str), default_value = "spool")]
    spool: PathBuf,

    /// Log at debug level.
    #[structopt(long, short)]
    verbose: bool,
}

fn main() {
    let opt = Opt::from_args();

    init_logging(opt.verbose);

    let mut config = match opt.config {
        Some(ref path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error reading '{}': {}", path.display(), e);
                EX_CONFIG.exit()
            },
        },
        None => SystemConfig::default(),
    };

    if let Some(host_name) = opt.host_name {
        config.smtp.host_name = host_name;
    }
    if let Some(max) = opt.max_message_size {
        config.smtp.max_message_size = Some(max);
    }

    if let Err(e) = fs::create_dir_all(&opt.spool) {
        eprintln!("Unable to create '{}': {}", opt.spool.display(), e);
        EX_CANTCREAT.exit()
    }

    run(Arc::new(config.smtp), opt.listen, opt.spool);
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message,
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .expect("Failed to initialise logging");
}

fn load_config(path: &Path) -> Result<SystemConfig, Error> {
    let mut text = Vec::new();
    fs::File::open(path)?.read_to_end(&mut text)?;
    Ok(toml::from_slice(&text)?)
}

#[tokio::main]
async fn run(config: Arc<SmtpConfig>, listen: String, spool: PathBuf) {
    let listener = match TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Unable to listen on '{}': {}", listen, e);
            EX_UNAVAILABLE.exit()
        },
    };

    info!("Listening on {}", listen);

    let (requests_tx, requests_rx) = mpsc::channel(16);
    let host = tokio::spawn(host_requests(requests_rx, spool));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let accept = async {
        let mut connection_id = 0u64;
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    connection_id += 1;
                    let log_prefix =
                        LogPrefix::new(format!("smtp{}", connection_id));
                    log_prefix.set_peer(peer.to_string());
                    info!("{} Accepted connection", log_prefix);

                    tokio::spawn(serve(
                        socket,
                        Session::new(),
                        Arc::clone(&config),
                        log_prefix,
                        requests_tx.clone(),
                        shutdown_rx.clone(),
                    ));
                },
                Err(e) => {
                    warn!("Unable to accept connection: {}", e);
                },
            }
        }
    };

    tokio::select! {
        _ = accept => (),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        },
    }

    // Cancel every open connection, then wait for the host task to drain the
    // requests still in flight.
    let _ = shutdown_tx.send(true);
    drop(requests_tx);
    let _ = host.await;
}

/// Answers the session engine's requests for the whole daemon.
///
/// Deliveries are spooled to disk; `VRFY` probes are confirmed for any
/// well-formed mailbox.
async fn host_requests(mut requests: mpsc::Receiver<Request>, spool: PathBuf) {
    let mut sequence = 0u64;

    while let Some(request) = requests.recv().await {
        match request {
            Request::Deliver(delivery) => {
                sequence += 1;
                match spool_message(&spool, sequence, &delivery) {
                    Ok(path) => info!(
                        "Spooled {} byte message from <{}> to {}",
                        delivery.data.len(),
                        delivery.sender,
                        path.display(),
                    ),
                    Err(e) => error!("Unable to spool message: {}", e),
                }
            },
            Request::Verify(Verify { candidate, respond }) => {
                // The spool takes mail for anyone; anything shaped like a
                // mailbox is confirmed.
                let (mailbox, _) = parse_address(&candidate);
                let _ = respond.send(if mailbox.is_empty() {
                    None
                } else {
                    Some(mailbox)
                });
            },
        }
    }
}

fn spool_message(
    spool: &Path,
    sequence: u64,
    delivery: &Delivery,
) -> std::io::Result<PathBuf> {
    let name = format!(
        "{}_{:04}.eml",
        chrono::Local::now().format("%Y%m%d_%H%M%S"),
        sequence,
    );
    let path = spool.join(name);

    let mut content = Vec::with_capacity(delivery.data.len() + 256);
    let _ = write!(content, "X-Postern-Sender: {}\r\n", delivery.sender);
    for recipient in &delivery.recipients {
        let _ = write!(content, "X-Postern-Recipient: {}\r\n", recipient);
    }
    content.extend_from_slice(&delivery.data);

    fs::write(&path, content)?;
    Ok(path)
}
