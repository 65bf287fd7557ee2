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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// for one connection.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    connection: String,
    peer: Option<String>,
    helo: Option<String>,
}

impl LogPrefix {
    pub fn new(connection: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connection,
                peer: None,
                helo: None,
            })),
        }
    }

    pub fn set_peer(&self, peer: String) {
        self.inner.lock().unwrap().peer = Some(sanitise(peer));
    }

    pub fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(sanitise(helo));
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.connection)?;
        if inner.peer.is_some() || inner.helo.is_some() {
            write!(f, "[")?;
            if let Some(ref peer) = inner.peer {
                write!(f, "{peer}")?;
                if inner.helo.is_some() {
                    write!(f, " ")?;
                }
            }
            if let Some(ref helo) = inner.helo {
                write!(f, "helo={helo}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((at, _)) = s.char_indices().nth(64) {
        s.truncate(at);
    }

    s
}
