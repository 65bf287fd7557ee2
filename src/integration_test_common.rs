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

use std::io::{self, BufRead, Read, Write};

pub trait ClientIo: Read + Write {}
impl<T: Read + Write + ?Sized> ClientIo for T {}

/// A blocking SMTP client which prints a transcript of everything it sends
/// and receives, tagged with the test's name.
pub struct SmtpClient {
    name: &'static str,
    io: Box<dyn ClientIo>,
}

impl SmtpClient {
    pub fn new(name: &'static str, io: impl ClientIo + 'static) -> Self {
        SmtpClient {
            name,
            io: Box::new(io),
        }
    }

    /// Reads one full reply, continuation lines included.
    ///
    /// The `BufReader` is constructed per call, so any bytes the server sent
    /// beyond the end of this reply are discarded with it. The client never
    /// pipelines, so there are none.
    pub fn read_responses(&mut self) -> Vec<String> {
        let mut reader = io::BufReader::new(&mut self.io);
        let mut responses = Vec::<String>::new();

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).unwrap();
            println!("[{}] S: {:?}", self.name, line);

            if 0 == n {
                panic!("Unexpected EOF");
            }

            // Continuation lines carry '-' after the code; the last line of
            // the reply carries a space.
            let last = b' ' == line.as_bytes()[3];
            responses.push(line);

            if last {
                break;
            }
        }

        responses
    }

    /// Sends `text`, which must already carry its line ending.
    pub fn write_line(&mut self, text: &str) {
        assert!(text.ends_with('\n'));
        for line in text.split_inclusive('\n') {
            println!("[{}] C: {:?}", self.name, line);
        }
        self.io.write_all(text.as_bytes()).unwrap();
    }

    /// Sends `data` verbatim, without echoing its content.
    pub fn write_raw(&mut self, data: &[u8]) {
        println!("[{}] C: [{} bytes]", self.name, data.len());
        self.io.write_all(data).unwrap();
    }

    /// Consumes the 220 greeting, then sends `cmd` and asserts it succeeds.
    pub fn skip_pleasantries(&mut self, cmd: &str) {
        let greeting = self.read_responses();
        assert!(greeting[0].starts_with("220"));
        self.write_line(&format!("{}\r\n", cmd));
        let responses = self.read_responses();
        assert!(responses.last().unwrap().starts_with("250"));
    }

    /// Sends one command and asserts it draws exactly one response line
    /// starting with `prefix`.
    pub fn simple_command(&mut self, command: &str, prefix: &str) {
        self.write_line(&format!("{}\r\n", command));
        self.check_single_response(command, prefix);
    }

    /// `simple_command` with a bare LF terminator instead of CRLF.
    pub fn unix_simple_command(&mut self, command: &str, prefix: &str) {
        self.write_line(&format!("{}\n", command));
        self.check_single_response(command, prefix);
    }

    fn check_single_response(&mut self, command: &str, prefix: &str) {
        let responses = self.read_responses();
        assert_eq!(1, responses.len());
        assert!(
            responses[0].starts_with(prefix),
            "Expected {:?} response to {:?}, got {:?}",
            prefix,
            command,
            responses[0]
        );
    }

    /// Asserts the server has closed its end of the stream.
    pub fn assert_eof(&mut self) {
        let mut buf = [0u8; 1];
        let n = self.io.read(&mut buf).unwrap();
        assert_eq!(0, n, "Expected EOF, got a byte");
    }
}
