//! Terminator-delimited message framing.
//!
//! Inbound bytes accumulate in a buffer until the configured terminator
//! shows up, then one message is cut from the front of the buffer. How the
//! message is cut depends on [`Framing`].

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// NUL, matching what existing peers expect when nothing is configured.
pub const DEFAULT_TERMINATOR: u8 = 0;

const LINE_FEED: u8 = b'\n';

/// Spare capacity made available before each socket read.
const READ_CHUNK: usize = 64 * 1024;

/// How a message is extracted once the terminator has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Cut at the first terminator and drop it.
    #[default]
    Terminator,
    /// Wait for the terminator, then cut at the first line feed in the
    /// buffer (or take the whole buffer when there is none) and drop a
    /// trailing line feed. Kept for peers that rely on the older behaviour
    /// where searching and cutting used different delimiters.
    LineFeed,
}

#[derive(Debug, Clone)]
pub struct MessageFramer {
    terminator: u8,
    framing: Framing,
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known not to hold the terminator.
    scanned: usize,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINATOR, Framing::default())
    }
}

impl MessageFramer {
    pub fn new(terminator: u8, framing: Framing) -> Self {
        Self {
            terminator,
            framing,
            buffer: Vec::new(),
            scanned: 0,
        }
    }

    pub fn terminator(&self) -> u8 {
        self.terminator
    }

    pub fn set_terminator(&mut self, terminator: u8) {
        self.terminator = terminator;
        self.scanned = 0;
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Bytes received but not yet delivered as a message.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Cuts the next complete message from the buffer, if the terminator has
    /// arrived.
    pub fn next_message(&mut self) -> Option<String> {
        let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == self.terminator)
        else {
            self.scanned = self.buffer.len();
            return None;
        };
        let end = self.scanned + offset;
        self.scanned = 0;
        let message = match self.framing {
            Framing::Terminator => {
                let frame: Vec<u8> = self.buffer.drain(..=end).collect();
                decode(&frame[..end])
            }
            Framing::LineFeed => {
                let cut = self
                    .buffer
                    .iter()
                    .position(|&b| b == LINE_FEED)
                    .map_or(self.buffer.len(), |lf| lf + 1);
                let mut line: Vec<u8> = self.buffer.drain(..cut).collect();
                if line.last() == Some(&LINE_FEED) {
                    line.pop();
                }
                decode(&line)
            }
        };
        Some(message)
    }

    /// Reads from `reader` until a whole message is buffered. Returns
    /// `Ok(None)` once the peer closes its side.
    ///
    /// Cancel safe: bytes are moved into the framer's buffer as soon as a
    /// read completes, so dropping this future loses nothing.
    pub async fn read_message<R>(&mut self, reader: &mut R) -> io::Result<Option<String>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(message) = self.next_message() {
                return Ok(Some(message));
            }
            self.buffer.reserve(READ_CHUNK);
            if reader.read_buf(&mut self.buffer).await? == 0 {
                return Ok(None);
            }
        }
    }

    /// `message` followed by this framer's terminator, ready to `send`.
    ///
    /// The terminator is appended as a `char`, so it should be ASCII.
    pub fn frame(&self, message: &str) -> String {
        let mut framed = String::with_capacity(message.len() + 1);
        framed.push_str(message);
        framed.push(char::from(self.terminator));
        framed
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
