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

//! Requests the session engine sends to its host application.
//!
//! The engine never touches storage or directories itself. Completed
//! messages and verification probes cross this bridge, and the host answers
//! or stores them however it likes.

use tokio::sync::oneshot;

/// A request from a session to the host.
#[derive(Debug)]
pub enum Request {
    /// Store a completed message. There is no reply channel; the session
    /// answers the client as soon as the request is enqueued, without
    /// waiting for the host to act on it.
    Deliver(Delivery),
    /// Answer whether an address is deliverable. The session holds its
    /// reply to the client until `respond` is resolved or dropped.
    Verify(Verify),
}

/// A completed mail transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// The envelope sender, reduced to a bare mailbox.
    pub sender: String,
    /// The accepted envelope recipients, in the order they were given.
    pub recipients: Vec<String>,
    /// The message payload, with transfer encoding already removed.
    pub data: Vec<u8>,
}

/// A verification probe for one address.
#[derive(Debug)]
pub struct Verify {
    /// The canonicalised address under test.
    pub candidate: String,
    /// `Some(mailbox)` confirms the address and gives its canonical form;
    /// `None` or dropping the sender declines to confirm it.
    pub respond: oneshot::Sender<Option<String>>,
}
