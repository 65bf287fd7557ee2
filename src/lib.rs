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

//! Postern is an embeddable ESMTP server session engine.
//!
//! Each accepted connection gets a [`Session`] and is driven by [`serve`]
//! over any async byte stream. The engine owns the protocol only: greeting,
//! command sequencing, mail parameter handling, size policy, and the data
//! phase. Completed transactions and `VRFY` probes are handed to the host
//! application over an [`mpsc`](tokio::sync::mpsc) channel of [`Request`]s,
//! so storage, queuing, and address policy stay entirely outside the
//! engine.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokio::net::TcpListener;
//! use tokio::sync::{mpsc, watch};
//!
//! use postern::{serve, LogPrefix, Request, Session, SmtpConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(SmtpConfig {
//!         host_name: "mx.example.com".to_owned(),
//!         max_message_size: Some(10 * 1024 * 1024),
//!     });
//!     let (requests_tx, mut requests_rx) = mpsc::channel(16);
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//!     tokio::spawn(async move {
//!         while let Some(request) = requests_rx.recv().await {
//!             match request {
//!                 Request::Deliver(delivery) => {
//!                     println!("mail from <{}>", delivery.sender);
//!                 },
//!                 Request::Verify(verify) => {
//!                     let _ = verify.respond.send(None);
//!                 },
//!             }
//!         }
//!     });
//!
//!     let listener = TcpListener::bind("127.0.0.1:2525").await?;
//!     loop {
//!         let (socket, addr) = listener.accept().await?;
//!         tokio::spawn(serve(
//!             socket,
//!             Session::new(),
//!             Arc::clone(&config),
//!             LogPrefix::new(addr.to_string()),
//!             requests_tx.clone(),
//!             shutdown_rx.clone(),
//!         ));
//!     }
//! }
//! ```

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

pub mod addr;
pub mod bridge;
pub mod codes;
pub mod server;
pub mod session;
pub mod stream;
pub mod support;
pub mod syntax;

#[cfg(test)]
mod integration_test_common;

pub use crate::bridge::{Delivery, Request, Verify};
pub use crate::server::serve;
pub use crate::session::{
    LifecycleState, LifecycleWatch, ReadMode, Session,
};
pub use crate::support::error::Error;
pub use crate::support::log_prefix::LogPrefix;
pub use crate::support::system_config::{SmtpConfig, SystemConfig};

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
pub(crate) fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} [{}][{}] {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    message,
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stderr())
            .apply()
            .unwrap();
    })
}
