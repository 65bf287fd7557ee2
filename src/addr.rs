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

//! Parsing of the address token that follows `MAIL FROM:` and `RCPT TO:`.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Angle form, optionally preceded by an RFC 5321 source route which is
    // accepted and discarded: <@hosta.int,@jkl.org:userc@d.bar.org>
    static ref RX_ANGLE: Regex =
        Regex::new("^<(?:@[^:>]+:)?([^>]*)>(.*)$").unwrap();
    static ref RX_BARE: Regex = Regex::new("^([^ <>]+)(.*)$").unwrap();
    // Loose addr-spec shape: exactly one @ with something on both sides.
    // Quoted local parts are not supported.
    static ref RX_ADDR_SPEC: Regex = Regex::new("^[^@ <>]+@[^@ <>]+$").unwrap();
}

/// Parses an angle-bracketed or bare address, returning the canonical
/// mailbox and any trailing parameter text (trimmed).
///
/// The canonical mailbox is empty when parsing fails; callers treat that as
/// a syntax error. The empty angle form `<>` parses to an empty mailbox and
/// is therefore rejected the same way.
pub fn parse_address(text: &str) -> (String, String) {
    let text = text.trim_start();
    let (mailbox, rest) = if let Some(cap) = RX_ANGLE.captures(text) {
        (cap.get(1).unwrap().as_str(), cap.get(2).unwrap().as_str())
    } else if let Some(cap) = RX_BARE.captures(text) {
        (cap.get(1).unwrap().as_str(), cap.get(2).unwrap().as_str())
    } else {
        return (String::new(), text.trim().to_owned());
    };

    if RX_ADDR_SPEC.is_match(mailbox) {
        (mailbox.to_owned(), rest.trim().to_owned())
    } else {
        (String::new(), rest.trim().to_owned())
    }
}
