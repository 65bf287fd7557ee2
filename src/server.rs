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

//! The ESMTP session engine proper.
//!
//! `serve` drives one connection from greeting to teardown: it reads
//! commands or data blocks according to the session's read mode, enforces
//! command sequencing, and hands completed transactions across the bridge.
//! Policy that needs storage or directory knowledge lives on the other side
//! of the bridge; everything here is pure protocol.

use std::borrow::Cow;
use std::io;
use std::mem;
use std::str;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use crate::addr::parse_address;
use crate::bridge::{Delivery, Request, Verify};
use crate::codes::{rc, ReplyCode};
use crate::session::{ReadMode, Session};
use crate::stream::SmtpStream;
use crate::support::{
    error::Error, log_prefix::LogPrefix, system_config::SmtpConfig,
};
use crate::syntax::{parse_mail_params, split_command, strip_keyword, Verb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

macro_rules! require {
    ($this:expr, $($fns:ident = $arg:expr,)* @else $el:block) => {
        $(if let Some(r) = $this.$fns($arg).await { $el; return r; })*
    };
    ($this:expr, $($fns:ident = $arg:expr),*) => {
        require!($this, $($fns = $arg,)* @else {})
    };
}

struct Server<IO> {
    io: SmtpStream<IO>,
    session: Session,
    config: Arc<SmtpConfig>,
    log_prefix: LogPrefix,
    requests: mpsc::Sender<Request>,

    ineffective_commands: u32,
    deadline_tx: mpsc::Sender<Instant>,
    quit: bool,
}

/// Serves one accepted connection to completion.
///
/// The session's lifecycle is advanced to `Open` before the greeting goes
/// out and to `Closed` when this function returns, however the connection
/// ends. Completed transactions and `VRFY` probes are sent over `requests`;
/// flipping `shutdown` to true cancels the connection wherever it stands.
pub async fn serve<IO: AsyncRead + AsyncWrite + Unpin>(
    io: IO,
    session: Session,
    config: Arc<SmtpConfig>,
    log_prefix: LogPrefix,
    requests: mpsc::Sender<Request>,
    shutdown: watch::Receiver<bool>,
) {
    let (deadline_tx, deadline_rx) = mpsc::channel(1);

    let mut server = Server {
        io: SmtpStream::new(io),
        session,
        config,
        log_prefix: log_prefix.clone(),
        requests,

        ineffective_commands: 0,
        deadline_tx,
        quit: false,
    };

    let result = tokio::select! {
        r = server.run() => r,
        _ = idle_timer(deadline_rx) => {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "Connection idle timer expired",
            )))
        },
        _ = wait_for_shutdown(shutdown) => {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "Server shutting down",
            )))
        },
    };

    server.session.lifecycle.close();
    let _ = server.io.close().await;

    match result {
        Ok(_) => info!("{} Normal client disconnect", log_prefix),
        Err(e) => warn!("{} Abnormal client disconnect: {}", log_prefix, e),
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Server<IO> {
    async fn run(&mut self) -> Result<(), Error> {
        if !self.session.lifecycle.open() {
            // The host tore the session down before we got started.
            return Ok(());
        }

        self.send_greeting().await?;

        while !self.quit {
            match self.session.read_mode {
                ReadMode::Command => self.run_command().await?,
                ReadMode::Data => self.run_data().await?,
            }
        }

        Ok(())
    }

    async fn run_command(&mut self) -> Result<(), Error> {
        let _ = self
            .deadline_tx
            .send(Instant::now() + Duration::from_secs(60))
            .await;

        let line = match self.io.read_command_line().await {
            Ok(line) => line,
            Err(Error::LineTooLong) => {
                return self
                    .send_response(
                        Final,
                        rc::CommandSyntaxError,
                        Cow::Borrowed("Line too long"),
                    )
                    .await;
            },
            Err(e) => return Err(e),
        };

        self.ineffective_commands += 1;
        if self.ineffective_commands > 30 {
            warn!(
                "{} Terminating connection after too many non-mail commands",
                self.log_prefix,
            );
            return self
                .send_response(
                    Final,
                    rc::ServiceClosing,
                    Cow::Borrowed(
                        "Too many commands issued without sending mail",
                    ),
                )
                .await;
        }

        if line.contains(&0) {
            warn!(
                "{} Remote is speaking binary, closing connection",
                self.log_prefix,
            );
            self.quit = true;
            return Ok(());
        }

        let Ok(line) = str::from_utf8(&line) else {
            warn!("{} Non-UTF-8 command received", self.log_prefix);
            return self
                .send_response(
                    Final,
                    rc::CommandSyntaxError,
                    Cow::Borrowed("Malformed UTF-8"),
                )
                .await;
        };

        let (keyword, argument) = split_command(line);
        let Ok(verb) = keyword.parse::<Verb>() else {
            let mut debug_line = line;
            if let Some((truncate_len, _)) = debug_line.char_indices().nth(64)
            {
                debug_line = &debug_line[..truncate_len];
            }

            warn!("{} Received bad command {debug_line:?}", self.log_prefix);
            return self
                .send_response(
                    Final,
                    rc::CommandSyntaxError,
                    Cow::Borrowed("Unrecognised command"),
                )
                .await;
        };

        match verb {
            Verb::Helo => self.cmd_helo(argument, false).await,
            Verb::Ehlo => self.cmd_helo(argument, true).await,
            Verb::Mail => self.cmd_mail(argument).await,
            Verb::Rcpt => self.cmd_rcpt(argument).await,
            Verb::Data => self.cmd_data(argument).await,
            Verb::Rset => self.cmd_rset(argument).await,
            Verb::Noop => self.cmd_noop(argument).await,
            Verb::Quit => self.cmd_quit(argument).await,
            Verb::Vrfy => self.cmd_vrfy(argument).await,
            Verb::Expn => self.cmd_expn(argument).await,
        }
    }

    async fn run_data(&mut self) -> Result<(), Error> {
        // Data transfers get a far longer deadline than single commands.
        let _ = self
            .deadline_tx
            .send(Instant::now() + Duration::from_secs(1800))
            .await;

        let data = match self
            .io
            .read_data_block(self.config.max_message_size)
            .await
        {
            Ok(data) => data,
            Err(Error::DataTooLarge) => {
                warn!("{} Rejected oversized message data", self.log_prefix);
                self.session.expect_command();
                return self
                    .send_response(
                        Final,
                        rc::ExceededStorageAllocation,
                        Cow::Borrowed("Message exceeds fixed maximum size"),
                    )
                    .await;
            },
            Err(e) => return Err(e),
        };

        self.session.expect_command();
        self.handle_data(data).await
    }

    async fn handle_data(&mut self, data: Vec<u8>) -> Result<(), Error> {
        if self
            .config
            .max_message_size
            .is_some_and(|max| data.len() as u64 >= max)
        {
            // The stream enforces the limit on the stuffed form; this
            // rechecks the decoded size. The transaction is left intact.
            return self
                .send_response(
                    Final,
                    rc::ExceededMessageSize,
                    Cow::Borrowed("Message exceeds fixed maximum size"),
                )
                .await;
        }

        let sender = self.session.sender.take().unwrap_or_default();
        let recipients = mem::take(&mut self.session.recipients);
        let truncated = self.session.truncated;

        info!(
            "{} Accepted {} byte message from <{}> for {} recipient(s)",
            self.log_prefix,
            data.len(),
            sender,
            recipients.len(),
        );

        if self
            .requests
            .send(Request::Deliver(Delivery {
                sender,
                recipients,
                data,
            }))
            .await
            .is_err()
        {
            error!("{} [BUG] Delivery worker disappeared", self.log_prefix);
            return self
                .send_response(
                    Final,
                    rc::ServiceNotAvailableClosing,
                    Cow::Borrowed("Internal server error"),
                )
                .await;
        }

        self.ineffective_commands = 0;
        self.session.reset();
        self.send_response(
            Final,
            rc::Ok,
            Cow::Borrowed(if truncated { "Some recipients ok" } else { "Ok" }),
        )
        .await
    }

    async fn cmd_helo(
        &mut self,
        argument: Option<&str>,
        extended: bool,
    ) -> Result<(), Error> {
        require!(self, need_greeting = false);

        let Some(argument) = argument else {
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed(if extended {
                        "Syntax: EHLO hostname"
                    } else {
                        "Syntax: HELO hostname"
                    }),
                )
                .await;
        };

        // HELO keeps the whole argument; EHLO takes the first word and
        // silently tolerates trailing text.
        let origin = if extended {
            argument
                .split_whitespace()
                .next()
                .unwrap_or(argument)
                .to_owned()
        } else {
            argument.to_owned()
        };

        self.log_prefix.set_helo(origin.clone());
        info!(
            "{} SMTP {}",
            self.log_prefix,
            if extended { "EHLO" } else { "HELO" },
        );

        self.session.extended = extended;
        self.session.greeting = Some(origin);

        if !extended {
            return self
                .send_response(
                    Final,
                    rc::Ok,
                    Cow::Owned(self.config.host_name.clone()),
                )
                .await;
        }

        self.send_response(
            Delayable,
            rc::Ok,
            Cow::Owned(self.config.host_name.clone()),
        )
        .await?;

        let mut capabilities: Vec<Cow<'static, str>> = Vec::new();
        if let Some(max) = self.config.max_message_size {
            capabilities.push(Cow::Owned(format!("SIZE {}", max)));
        }
        capabilities.push(Cow::Borrowed("HELP"));

        let len = capabilities.len();
        for (ix, capability) in capabilities.into_iter().enumerate() {
            self.send_response(
                Delayable.or_final(ix + 1 == len),
                rc::Ok,
                capability,
            )
            .await?;
        }

        Ok(())
    }

    async fn cmd_mail(&mut self, argument: Option<&str>) -> Result<(), Error> {
        let Some(argument) = argument else {
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed("Syntax: MAIL FROM:<address>"),
                )
                .await;
        };

        require!(self, need_greeting = true, need_sender = false);

        let remainder = strip_keyword(argument, "FROM:");
        let (sender, params) = parse_address(remainder);

        if sender.is_empty() {
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed("Syntax: MAIL FROM:<address>"),
                )
                .await;
        }

        if !self.session.extended && !params.is_empty() {
            // Parameters are an ESMTP feature; a client that said HELO
            // doesn't get to use them.
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed("Syntax: MAIL FROM:<address>"),
                )
                .await;
        }

        let Some(params) = parse_mail_params(&params) else {
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed("Syntax: MAIL FROM:<address>"),
                )
                .await;
        };

        let mut declared_size = None::<u64>;
        let mut unrecognised = 0usize;
        for &(key, value) in &params {
            if key.eq_ignore_ascii_case("SIZE") {
                match value.parse::<u64>() {
                    Ok(size) => {
                        if self
                            .config
                            .max_message_size
                            .is_some_and(|max| size >= max)
                        {
                            return self
                                .send_response(
                                    Final,
                                    rc::ExceededStorageAllocation,
                                    Cow::Borrowed(
                                        "Message size exceeds fixed maximum \
                                         message size",
                                    ),
                                )
                                .await;
                        }

                        declared_size = Some(size);
                    },
                    Err(_) => unrecognised += 1,
                }
            } else {
                unrecognised += 1;
            }
        }

        if 0 != unrecognised {
            return self
                .send_response(
                    Final,
                    rc::ParametersNotRecognised,
                    Cow::Borrowed("Unrecognized extension"),
                )
                .await;
        }

        info!(
            "{} Start mail transaction from <{}>",
            self.log_prefix, sender,
        );
        self.ineffective_commands = 0;
        self.session.sender = Some(sender);
        self.session.declared_size = declared_size;
        self.send_response(Final, rc::Ok, Cow::Borrowed("Ok")).await
    }

    async fn cmd_rcpt(&mut self, argument: Option<&str>) -> Result<(), Error> {
        require!(self, need_greeting = true, need_sender = true);

        let Some(argument) = argument else {
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed("Syntax: RCPT <address>"),
                )
                .await;
        };

        let remainder = strip_keyword(argument, "TO:");
        let (recipient, params) = parse_address(remainder);

        if recipient.is_empty() {
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed("Syntax: RCPT <address>"),
                )
                .await;
        }

        if !params.is_empty() {
            return self
                .send_response(
                    Final,
                    rc::ParametersNotRecognised,
                    Cow::Borrowed("Unrecognized extension"),
                )
                .await;
        }

        if channel_quota_exceeded(
            self.session.declared_size,
            self.session.recipients.len(),
            self.config.max_message_size,
        ) {
            warn!(
                "{} Channel capacity exhausted, refusing recipient <{}>",
                self.log_prefix, recipient,
            );
            self.session.truncated = true;
            return self
                .send_response(
                    Final,
                    rc::ExceededStorageAllocation,
                    Cow::Owned(format!(
                        "Channel size limit exceeded: {}",
                        recipient,
                    )),
                )
                .await;
        }

        self.ineffective_commands = 0;
        self.session.recipients.push(recipient);
        self.send_response(Final, rc::Ok, Cow::Borrowed("Ok")).await
    }

    async fn cmd_data(&mut self, argument: Option<&str>) -> Result<(), Error> {
        if argument.is_some() {
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed("Syntax: DATA"),
                )
                .await;
        }

        require!(
            self,
            need_greeting = true,
            need_sender = true,
            need_recipients = true
        );

        info!("{} Begin data transfer", self.log_prefix);
        self.ineffective_commands = 0;
        self.session.expect_data();
        self.send_response(
            Final,
            rc::StartMailInput,
            Cow::Borrowed("End data with <CRLF>.<CRLF>"),
        )
        .await
    }

    async fn cmd_rset(&mut self, argument: Option<&str>) -> Result<(), Error> {
        if argument.is_some() {
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed("Syntax: RSET"),
                )
                .await;
        }

        self.session.reset();
        self.send_response(Final, rc::Ok, Cow::Borrowed("Ok")).await
    }

    async fn cmd_noop(&mut self, argument: Option<&str>) -> Result<(), Error> {
        if argument.is_some() {
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed("Syntax: NOOP"),
                )
                .await;
        }

        self.send_response(Final, rc::Ok, Cow::Borrowed("Ok")).await
    }

    async fn cmd_quit(&mut self, argument: Option<&str>) -> Result<(), Error> {
        if argument.is_some() {
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed("Syntax: QUIT"),
                )
                .await;
        }

        self.quit = true;
        let _ = self
            .send_response(Final, rc::ServiceClosing, Cow::Borrowed("Bye"))
            .await;
        Ok(())
    }

    async fn cmd_vrfy(&mut self, argument: Option<&str>) -> Result<(), Error> {
        let Some(argument) = argument else {
            return self
                .send_response(
                    Final,
                    rc::ParameterSyntaxError,
                    Cow::Borrowed("Syntax: VRFY <address>"),
                )
                .await;
        };

        // Angle brackets and source routes are not part of the cache key.
        let (mailbox, _) = parse_address(argument);
        let candidate = if mailbox.is_empty() {
            argument.trim().to_owned()
        } else {
            mailbox
        };

        if self.session.verified.contains(&candidate) {
            return self.send_verify_ok().await;
        }

        let (respond, response) = oneshot::channel();
        if self
            .requests
            .send(Request::Verify(Verify {
                candidate: candidate.clone(),
                respond,
            }))
            .await
            .is_err()
        {
            error!("{} [BUG] Delivery worker disappeared", self.log_prefix);
            return self
                .send_response(
                    Final,
                    rc::ServiceNotAvailableClosing,
                    Cow::Borrowed("Internal server error"),
                )
                .await;
        }

        match response.await {
            Ok(Some(canonical)) => {
                info!("{} VRFY confirmed <{}>", self.log_prefix, canonical);
                self.session.verified.insert(canonical);
                self.send_verify_ok().await
            },
            // A dropped responder declines the same way an explicit `None`
            // does.
            Ok(None) | Err(_) => {
                info!(
                    "{} VRFY could not confirm <{}>",
                    self.log_prefix, candidate,
                );
                self.send_response(
                    Final,
                    rc::CommandNotImplemented,
                    Cow::Owned(format!("Could not verify {}", candidate)),
                )
                .await
            },
        }
    }

    async fn send_verify_ok(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            rc::CannotVerify,
            Cow::Borrowed(
                "Cannot verify user, but will accept message and attempt \
                 delivery",
            ),
        )
        .await
    }

    async fn cmd_expn(
        &mut self,
        _argument: Option<&str>,
    ) -> Result<(), Error> {
        info!("{} Rejected attempt to use EXPN", self.log_prefix);
        self.send_response(
            Final,
            rc::CommandNotImplemented,
            Cow::Borrowed("Unimplemented"),
        )
        .await
    }

    async fn need_greeting(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            self.session.has_greeting(),
            present,
            "Duplicate HELO/EHLO",
            "Error: Send HELO first",
        )
        .await
    }

    async fn need_sender(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            self.session.has_sender(),
            present,
            "Error: Nested MAIL command",
            "Error: Send MAIL first",
        )
        .await
    }

    async fn need_recipients(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            self.session.has_recipients(),
            present,
            "Already have recipients",
            "Error: Need RCPT command",
        )
        .await
    }

    async fn check_need(
        &mut self,
        current_status: bool,
        desired_status: bool,
        message_if_already_present: &str,
        message_if_missing: &str,
    ) -> Option<Result<(), Error>> {
        if current_status != desired_status {
            Some(
                self.send_response(
                    Final,
                    rc::BadSequenceOfCommands,
                    Cow::Borrowed(if current_status {
                        message_if_already_present
                    } else {
                        message_if_missing
                    }),
                )
                .await,
            )
        } else {
            None
        }
    }

    async fn send_greeting(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            rc::ServiceReady,
            Cow::Owned(format!(
                "{} ESMTP {} {}.{}.{} ready",
                self.config.host_name,
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION_MAJOR"),
                env!("CARGO_PKG_VERSION_MINOR"),
                env!("CARGO_PKG_VERSION_PATCH"),
            )),
        )
        .await
    }

    async fn send_response(
        &mut self,
        kind: ResponseKind,
        code: ReplyCode,
        quip: Cow<'_, str>,
    ) -> Result<(), Error> {
        use std::fmt::Write as _;

        if rc::ServiceClosing == code || rc::ServiceNotAvailableClosing == code
        {
            self.quit = true;
        }

        let mut s = String::new();
        let _ = write!(s, "{}{}{}", code as u16, kind.indicator(), quip);

        self.io.write_line(s.as_bytes()).await?;
        match kind {
            Final => self.io.flush().await?,
            Delayable => (),
        }

        Ok(())
    }
}

/// Whether accepting one more recipient would overcommit the channel.
///
/// Each accepted recipient stands for a copy of the declared message, plus
/// one for the copy in flight, so the declared size is charged that many
/// times against the configured maximum.
fn channel_quota_exceeded(
    declared_size: Option<u64>,
    accepted_recipients: usize,
    max_message_size: Option<u64>,
) -> bool {
    match (declared_size, max_message_size) {
        (Some(declared), Some(max)) => {
            declared.saturating_mul(accepted_recipients as u64 + 1) >= max
        },
        _ => false,
    }
}

// Runs until either the deadline channel is closed or the current deadline
// has expired. Used to force-close idle connections.
async fn idle_timer(mut deadline_rx: mpsc::Receiver<Instant>) {
    let mut deadline = Instant::now() + Duration::from_secs(30);

    loop {
        match tokio::time::timeout_at(deadline.into(), deadline_rx.recv()).await
        {
            Err(_) => return,   // Timed out
            Ok(None) => return, // Done
            Ok(Some(d)) => deadline = d,
        }
    }
}

// Resolves when the host signals shutdown. A dropped sender means the host
// intends to run indefinitely, which must not cancel the connection.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
