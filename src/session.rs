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

//! Per-connection session state: the mail transaction being accumulated and
//! the connection lifecycle.

use std::collections::HashSet;

use tokio::sync::watch;

/// The phase of a connection's life.
///
/// Transitions are monotonic: `Connecting` → `Open` → `Closed`, with no way
/// back. `Closed` may be reached directly from `Connecting` when a
/// connection is torn down before setup completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Connecting,
    Open,
    Closed,
}

/// Which framing the session loop asks the stream for next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    Command,
    Data,
}

/// The lifecycle signal for one session.
///
/// Wraps a watch channel so that any number of observers can wait for the
/// session to open or close without polling.
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Connecting);
        Self { tx }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> LifecycleWatch {
        LifecycleWatch {
            rx: self.tx.subscribe(),
        }
    }

    /// Marks the transport streams ready. Returns whether the transition
    /// happened (false once `Closed` has been reached).
    pub(crate) fn open(&self) -> bool {
        self.advance(LifecycleState::Open)
    }

    /// Marks the session torn down. Idempotent; returns whether this call
    /// performed the transition.
    pub(crate) fn close(&self) -> bool {
        self.advance(LifecycleState::Closed)
    }

    fn advance(&self, to: LifecycleState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state < to {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

/// An observer handle for one session's lifecycle.
#[derive(Clone)]
pub struct LifecycleWatch {
    rx: watch::Receiver<LifecycleState>,
}

impl LifecycleWatch {
    pub fn current(&self) -> LifecycleState {
        *self.rx.borrow()
    }

    /// Waits until the session is open.
    ///
    /// Returns false if the session was torn down without opening.
    pub async fn opened(&mut self) -> bool {
        match self.rx.wait_for(|s| LifecycleState::Connecting != *s).await {
            Ok(state) => LifecycleState::Open == *state,
            Err(_) => false,
        }
    }

    /// Waits until the session is closed.
    ///
    /// A session dropped wholesale counts as closed.
    pub async fn closed(&mut self) {
        let _ = self.rx.wait_for(|s| LifecycleState::Closed == *s).await;
    }
}

/// Mutable state for one accepted connection.
///
/// Owned exclusively by the connection's task; nothing here is shared or
/// locked. The transaction fields accumulate through `HELO`/`MAIL`/`RCPT`
/// and are wiped together by `reset`.
pub struct Session {
    pub lifecycle: Lifecycle,
    pub read_mode: ReadMode,
    /// The argument of the accepted `HELO`/`EHLO`, unset until greeted.
    pub greeting: Option<String>,
    /// Whether the greeting was `EHLO`.
    pub extended: bool,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    /// The client's `SIZE=` declaration from `MAIL`, if any.
    pub declared_size: Option<u64>,
    /// Whether a recipient was refused under the channel-capacity policy.
    pub truncated: bool,
    /// Addresses confirmed via `VRFY`. Connection-scoped; survives `reset`.
    pub verified: HashSet<String>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            read_mode: ReadMode::Command,
            greeting: None,
            extended: false,
            sender: None,
            recipients: Vec::new(),
            declared_size: None,
            truncated: false,
            verified: HashSet::new(),
        }
    }

    /// Performs a full transaction reset.
    ///
    /// Clears the greeting, the extended flag, the sender, the recipients,
    /// the declared size, and the truncation flag, and returns the read mode
    /// to `Command`. The client must greet again before the next `MAIL`.
    pub fn reset(&mut self) {
        // lifecycle and verified are connection-scoped; everything else
        // clears. The exhaustive destructure keeps this list honest when a
        // field is added.
        let Self {
            lifecycle: _,
            verified: _,
            read_mode,
            greeting,
            extended,
            sender,
            recipients,
            declared_size,
            truncated,
        } = self;

        *read_mode = ReadMode::Command;
        *greeting = None;
        *extended = false;
        *sender = None;
        recipients.clear();
        *declared_size = None;
        *truncated = false;
    }

    pub fn has_greeting(&self) -> bool {
        self.greeting.is_some()
    }

    pub fn has_sender(&self) -> bool {
        self.sender.is_some()
    }

    pub fn has_recipients(&self) -> bool {
        !self.recipients.is_empty()
    }

    pub fn expect_data(&mut self) {
        self.read_mode = ReadMode::Data;
    }

    pub fn expect_command(&mut self) {
        self.read_mode = ReadMode::Command;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
