//! Messages, outbound buffers and the incremental line parsers.

use std::rc::Rc;

use memchr::memchr;

/// One fully received chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Sender name. Server-originated feed messages use `server`.
    pub author: Rc<str>,
    /// Message payload without the terminating newline. May be empty.
    pub data: String,
}

/// Queued outbound bytes with a partial-write cursor.
pub(crate) struct OutBuffer {
    bytes: Vec<u8>,
    sent: usize,
}

impl OutBuffer {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        OutBuffer { bytes, sent: 0 }
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        &self.bytes[self.sent.min(self.bytes.len())..]
    }

    pub(crate) fn advance(&mut self, count: usize) {
        self.sent += count;
    }

    pub(crate) fn is_done(&self) -> bool {
        self.sent >= self.bytes.len()
    }
}

/// Splits a byte stream into newline-terminated lines, holding the partial
/// tail until its newline arrives.
pub(crate) struct LineParser {
    partial: Vec<u8>,
}

impl LineParser {
    pub(crate) fn new() -> Self {
        LineParser {
            partial: Vec::new(),
        }
    }

    /// Feed one chunk; complete lines are appended to `out` without their
    /// trailing newline.
    pub(crate) fn feed(&mut self, mut chunk: &[u8], out: &mut Vec<Vec<u8>>) {
        while let Some(pos) = memchr(b'\n', chunk) {
            let mut line = std::mem::take(&mut self.partial);
            line.extend_from_slice(&chunk[..pos]);
            out.push(line);
            chunk = &chunk[pos + 1..];
        }
        self.partial.extend_from_slice(chunk);
    }
}

enum ParseState {
    ReadingAuthor,
    ReadingData,
}

/// Incremental parser for the client side of the wire format: per message
/// the author runs up to `:`, then the payload up to `\n`.
pub(crate) struct MessageParser {
    state: ParseState,
    author: Vec<u8>,
    data: Vec<u8>,
}

impl MessageParser {
    pub(crate) fn new() -> Self {
        MessageParser {
            state: ParseState::ReadingAuthor,
            author: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Feed one chunk; each completed message is handed to `sink` as raw
    /// author bytes plus payload bytes.
    pub(crate) fn feed(&mut self, mut chunk: &[u8], mut sink: impl FnMut(&[u8], Vec<u8>)) {
        while !chunk.is_empty() {
            match self.state {
                ParseState::ReadingAuthor => match memchr(b':', chunk) {
                    Some(pos) => {
                        self.author.extend_from_slice(&chunk[..pos]);
                        chunk = &chunk[pos + 1..];
                        self.state = ParseState::ReadingData;
                    }
                    None => {
                        self.author.extend_from_slice(chunk);
                        return;
                    }
                },
                ParseState::ReadingData => match memchr(b'\n', chunk) {
                    Some(pos) => {
                        self.data.extend_from_slice(&chunk[..pos]);
                        chunk = &chunk[pos + 1..];
                        let author = std::mem::take(&mut self.author);
                        sink(&author, std::mem::take(&mut self.data));
                        self.state = ParseState::ReadingAuthor;
                    }
                    None => {
                        self.data.extend_from_slice(chunk);
                        return;
                    }
                },
            }
        }
    }
}

pub(crate) fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
