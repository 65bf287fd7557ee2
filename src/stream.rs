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

//! Line and data-block framing over an arbitrary async transport.
//!
//! The session loop only ever asks for one logical unit at a time: a single
//! command line, or a single dot-terminated data block. Length limits are
//! enforced here; the session decides what to tell the client.

use std::io;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufStream,
};

use crate::support::error::Error;

/// Maximum length of a command line, terminator included.
pub const MAX_LINE: usize = 1024;

/// Size of a single bounded read while assembling a data-phase line.
const DATA_CHUNK: usize = 4096;

/// Buffered framing over one connection's transport.
pub struct SmtpStream<IO> {
    io: BufStream<IO>,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> SmtpStream<IO> {
    pub fn new(io: IO) -> Self {
        Self {
            io: BufStream::new(io),
        }
    }

    /// Reads one command line, with the line terminator stripped.
    ///
    /// A line with no terminator within `MAX_LINE` bytes is consumed through
    /// to its terminator and reported as `Error::LineTooLong`, leaving the
    /// stream positioned at the next line.
    pub async fn read_command_line(&mut self) -> Result<Vec<u8>, Error> {
        let mut buffer = Vec::new();
        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                // Skip the rest of the line
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', &mut buffer)
                        .await?;
                }

                return Err(Error::LineTooLong);
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        let _ = buffer.pop();
        if Some(&b'\r') == buffer.last() {
            let _ = buffer.pop();
        }

        Ok(buffer)
    }

    /// Reads one data block, up to and including the lone-dot terminator
    /// line, removing the stuffing dot from every line that carries one.
    ///
    /// The terminator is not part of the returned block. If `max_length` is
    /// set and the block grows past it, the remainder is consumed through
    /// the terminator and `Error::DataTooLarge` is returned, so the stream
    /// stays positioned at the next command. Oversized input is dropped as
    /// it is read, never accumulated.
    pub async fn read_data_block(
        &mut self,
        max_length: Option<u64>,
    ) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut discarding = false;

        loop {
            line.clear();
            // Whether `line` still holds this line from its first byte. The
            // tail of a line dropped mid-read must not pass for the
            // terminator.
            let mut intact = true;

            loop {
                let n = (&mut self.io)
                    .take(DATA_CHUNK as u64)
                    .read_until(b'\n', &mut line)
                    .await?;
                if 0 == n {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "EOF encountered in DATA payload",
                    )));
                }
                if line.ends_with(b"\n") {
                    break;
                }

                // A partial line longer than the terminator can only add to
                // the block. Unstuffing removes at most one byte, so once
                // the running total is past the limit the block cannot come
                // back under it.
                if !discarding
                    && line.len() > 3
                    && max_length.is_some_and(|max| {
                        (data.len() + line.len()) as u64 > max
                    })
                {
                    data.clear();
                    discarding = true;
                }

                if discarding && line.len() > 3 {
                    line.clear();
                    intact = false;
                }
            }

            if intact && (b".\r\n" == &line[..] || b".\n" == &line[..]) {
                break;
            }

            if discarding {
                continue;
            }

            // A leading dot on a non-terminator line is stuffing.
            let content = if line.starts_with(b".") {
                &line[1..]
            } else {
                &line[..]
            };
            data.extend_from_slice(content);

            if max_length.is_some_and(|max| data.len() as u64 > max) {
                data.clear();
                discarding = true;
            }
        }

        if discarding {
            Err(Error::DataTooLarge)
        } else {
            Ok(data)
        }
    }

    /// Writes one response line, appending the CRLF terminator if the
    /// caller omitted it. The line is buffered until `flush`.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<(), Error> {
        self.io.write_all(line).await?;
        if !line.ends_with(b"\r\n") {
            self.io.write_all(b"\r\n").await?;
        }

        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.io.flush().await?;
        Ok(())
    }

    /// Best-effort shutdown of the transport. Callers suppress the error.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.io.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    /// Routes the test binary's allocation through a live-byte counter so
    /// tests can assert on peak heap growth.
    mod heap_meter {
        use std::alloc::{GlobalAlloc, Layout, System};
        use std::sync::atomic::{AtomicUsize, Ordering};

        pub struct HeapMeter;

        static LIVE: AtomicUsize = AtomicUsize::new(0);
        static PEAK: AtomicUsize = AtomicUsize::new(0);

        unsafe impl GlobalAlloc for HeapMeter {
            unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
                let ptr = System.alloc(layout);
                if !ptr.is_null() {
                    let live = LIVE
                        .fetch_add(layout.size(), Ordering::SeqCst)
                        + layout.size();
                    PEAK.fetch_max(live, Ordering::SeqCst);
                }
                ptr
            }

            unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
                System.dealloc(ptr, layout);
                LIVE.fetch_sub(layout.size(), Ordering::SeqCst);
            }
        }

        /// Discards the high-water mark, returning the current live total.
        pub fn reset_peak() -> usize {
            let live = LIVE.load(Ordering::SeqCst);
            PEAK.store(live, Ordering::SeqCst);
            live
        }

        /// Peak live bytes since `reset_peak`, less its return value.
        pub fn growth_since(baseline: usize) -> usize {
            PEAK.load(Ordering::SeqCst).saturating_sub(baseline)
        }
    }

    #[global_allocator]
    static HEAP_METER: heap_meter::HeapMeter = heap_meter::HeapMeter;

    fn read_data_block_sync(
        input: &[u8],
        max_length: Option<u64>,
    ) -> Result<Vec<u8>, Error> {
        futures::executor::block_on(async {
            let (mut client, server) = tokio::io::duplex(input.len() + 64);
            client.write_all(input).await.unwrap();
            drop(client);

            SmtpStream::new(server).read_data_block(max_length).await
        })
    }

    #[test]
    fn command_line_reading() {
        futures::executor::block_on(async {
            let (mut client, server) = tokio::io::duplex(256);
            client
                .write_all(b"HELO example.com\r\nNOOP\r\nQUIT\n")
                .await
                .unwrap();
            drop(client);

            let mut stream = SmtpStream::new(server);
            assert_eq!(
                b"HELO example.com".to_vec(),
                stream.read_command_line().await.unwrap()
            );
            assert_eq!(b"NOOP".to_vec(), stream.read_command_line().await.unwrap());
            // Bare LF is tolerated on the command channel.
            assert_eq!(b"QUIT".to_vec(), stream.read_command_line().await.unwrap());
            assert_matches!(
                Err(Error::Io(_)),
                stream.read_command_line().await
            );
        });
    }

    #[test]
    fn overlong_command_line_is_skipped() {
        futures::executor::block_on(async {
            let mut input = vec![b'a'; 3 * MAX_LINE];
            input.extend_from_slice(b"\r\nNOOP\r\n");

            let (mut client, server) = tokio::io::duplex(input.len() + 64);
            client.write_all(&input).await.unwrap();
            drop(client);

            let mut stream = SmtpStream::new(server);
            assert_matches!(
                Err(Error::LineTooLong),
                stream.read_command_line().await
            );
            // The stream resynchronises at the next line.
            assert_eq!(b"NOOP".to_vec(), stream.read_command_line().await.unwrap());
        });
    }

    #[test]
    fn eof_within_command_is_an_error() {
        futures::executor::block_on(async {
            let (mut client, server) = tokio::io::duplex(64);
            client.write_all(b"NOO").await.unwrap();
            drop(client);

            let mut stream = SmtpStream::new(server);
            assert_matches!(Err(Error::Io(_)), stream.read_command_line().await);
        });
    }

    #[test]
    fn data_block_reading() {
        assert_eq!(
            b"hello\r\n".to_vec(),
            read_data_block_sync(b"hello\r\n.\r\n", None).unwrap()
        );
        assert_eq!(
            b".leading dot\r\n".to_vec(),
            read_data_block_sync(b"..leading dot\r\n.\r\n", None).unwrap()
        );
        // A dot line under UNIX line endings still terminates.
        assert_eq!(
            b"a\nb\n".to_vec(),
            read_data_block_sync(b"a\nb\n.\n", None).unwrap()
        );
        assert_eq!(
            Vec::<u8>::new(),
            read_data_block_sync(b".\r\n", None).unwrap()
        );
    }

    #[test]
    fn data_block_eof_is_an_error() {
        assert_matches!(
            Err(Error::Io(_)),
            read_data_block_sync(b"no terminator\r\n", None)
        );
    }

    #[test]
    fn oversized_data_block_drains_to_terminator() {
        futures::executor::block_on(async {
            let (mut client, server) = tokio::io::duplex(256);
            client
                .write_all(
                    b"far more than ten bytes of content\r\n\
                      and another line\r\n\
                      .\r\n\
                      NOOP\r\n",
                )
                .await
                .unwrap();
            drop(client);

            let mut stream = SmtpStream::new(server);
            assert_matches!(
                Err(Error::DataTooLarge),
                stream.read_data_block(Some(10)).await
            );
            // The terminator was consumed; the next command parses cleanly.
            assert_eq!(b"NOOP".to_vec(), stream.read_command_line().await.unwrap());
        });
    }

    #[test]
    fn data_block_at_exact_limit_is_accepted() {
        let block = read_data_block_sync(b"1234567890\r\n.\r\n", Some(12));
        assert_eq!(b"1234567890\r\n".to_vec(), block.unwrap());
    }

    #[test]
    fn unterminated_run_is_dropped_not_buffered() {
        futures::executor::block_on(async {
            // A single 8 MiB line, then the terminator and a follow-up
            // command.
            let mut input = vec![b'x'; 8 * 1024 * 1024];
            input.extend_from_slice(b"\r\n.\r\nNOOP\r\n");

            let (mut client, server) = tokio::io::duplex(input.len() + 64);
            client.write_all(&input).await.unwrap();
            drop(client);

            let mut stream = SmtpStream::new(server);
            let baseline = heap_meter::reset_peak();
            let result = stream.read_data_block(Some(1000)).await;
            let growth = heap_meter::growth_since(baseline);

            assert_matches!(Err(Error::DataTooLarge), result);
            assert!(
                growth < 1024 * 1024,
                "heap grew by {} bytes while discarding an oversized run",
                growth
            );
            assert_eq!(b"NOOP".to_vec(), stream.read_command_line().await.unwrap());
        });
    }

    #[test]
    fn dropped_line_tail_is_not_a_terminator() {
        futures::executor::block_on(async {
            // One overlong line whose tail lands on a read boundary spelling
            // exactly ".\r\n", then another line, then the real terminator.
            let mut input = vec![b'x'; DATA_CHUNK];
            input.extend_from_slice(b".\r\n");
            input.extend_from_slice(b"more\r\n.\r\nNOOP\r\n");

            let (mut client, server) = tokio::io::duplex(input.len() + 64);
            client.write_all(&input).await.unwrap();
            drop(client);

            let mut stream = SmtpStream::new(server);
            assert_matches!(
                Err(Error::DataTooLarge),
                stream.read_data_block(Some(16)).await
            );
            // Everything through the real terminator was consumed.
            assert_eq!(b"NOOP".to_vec(), stream.read_command_line().await.unwrap());
        });
    }

    #[test]
    fn write_line_appends_missing_terminator() {
        futures::executor::block_on(async {
            let (client, server) = tokio::io::duplex(256);
            let mut stream = SmtpStream::new(server);
            stream.write_line(b"250 Ok").await.unwrap();
            stream.write_line(b"354 Go ahead\r\n").await.unwrap();
            stream.flush().await.unwrap();
            drop(stream);

            let mut written = Vec::new();
            let mut client = client;
            client.read_to_end(&mut written).await.unwrap();
            assert_eq!(b"250 Ok\r\n354 Go ahead\r\n".to_vec(), written);
        });
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 4096,
            ..ProptestConfig::default()
        })]

        #[test]
        fn dot_stuffing_round_trips(content in "[x.\r\n]{0,100}\r\n") {
            let mut stuffed = content.replace("\n.", "\n..");
            if stuffed.starts_with('.') {
                stuffed = format!(".{}", stuffed);
            }
            stuffed.push_str(".\r\n");

            let block =
                read_data_block_sync(stuffed.as_bytes(), None).unwrap();
            prop_assert_eq!(content.as_bytes(), &block[..]);
        }

        #[test]
        fn dot_stuffing_respects_length_limit(
            content in "[x.\r\n]{0,100}\r\n",
            max in 0u64..=120,
        ) {
            let mut stuffed = content.replace("\n.", "\n..");
            if stuffed.starts_with('.') {
                stuffed = format!(".{}", stuffed);
            }
            stuffed.push_str(".\r\n");

            let result = read_data_block_sync(stuffed.as_bytes(), Some(max));
            if content.len() as u64 > max {
                prop_assert!(matches!(result, Err(Error::DataTooLarge)));
            } else {
                prop_assert_eq!(content.as_bytes(), &result.unwrap()[..]);
            }
        }
    }
}
