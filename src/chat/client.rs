//! Chat client: one non-blocking socket, an outbound buffer chain and an
//! incremental `author:payload` parser with author interning.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::rc::Rc;
use std::time::Duration;

use log::debug;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};

use super::message::{ChatMessage, MessageParser, OutBuffer, text};
use super::{ChatError, ChatEvents, poll_timeout, sys};

const READ_CHUNK: usize = 1024;

/// A line-oriented chat client.
pub struct ChatClient {
    sock: Option<TcpStream>,
    /// Outbound buffer chain; preloaded with `name\n` so the first flush
    /// introduces us to the server.
    outbox: VecDeque<OutBuffer>,
    incoming: MessageParser,
    /// Interned author names: equal byte sequences share one allocation.
    authors: Vec<Rc<str>>,
    inbox: VecDeque<ChatMessage>,
}

impl ChatClient {
    /// A client that will introduce itself as `name`.
    pub fn new(name: &str) -> ChatClient {
        let mut hello = Vec::with_capacity(name.len() + 1);
        hello.extend_from_slice(name.as_bytes());
        hello.push(b'\n');
        ChatClient {
            sock: None,
            outbox: VecDeque::from([OutBuffer::new(hello)]),
            incoming: MessageParser::new(),
            authors: Vec::new(),
            inbox: VecDeque::new(),
        }
    }

    /// Connect to `host:port`. The host is resolved and the first IPv4
    /// endpoint is used; everything else is [`ChatError::NoAddr`].
    pub fn connect(&mut self, addr: &str) -> Result<(), ChatError> {
        if self.sock.is_some() {
            return Err(ChatError::AlreadyStarted);
        }
        let (host, port) = addr.split_once(':').ok_or(ChatError::InvalidArgument)?;
        let port: u16 = port.parse().map_err(|_| ChatError::InvalidArgument)?;
        let endpoint = (host, port)
            .to_socket_addrs()
            .map_err(|_| ChatError::NoAddr)?
            .find(|candidate| candidate.is_ipv4())
            .ok_or(ChatError::NoAddr)?;
        debug!("connecting to chat server at {endpoint}");
        let sock = TcpStream::connect(endpoint)?;
        sock.set_nonblocking(true)?;
        self.sock = Some(sock);
        Ok(())
    }

    /// Pop the next fully received message.
    pub fn pop_next(&mut self) -> Option<ChatMessage> {
        self.inbox.pop_front()
    }

    /// Queue raw bytes for transmission. Framing is the caller's business:
    /// a message is only complete once its newline is queued.
    pub fn feed(&mut self, message: &str) -> Result<(), ChatError> {
        if self.sock.is_none() {
            return Err(ChatError::NotStarted);
        }
        self.outbox.push_back(OutBuffer::new(message.as_bytes().to_vec()));
        Ok(())
    }

    /// Readiness interest for embedding into an external event loop.
    pub fn events(&self) -> ChatEvents {
        if self.sock.is_none() {
            return ChatEvents::empty();
        }
        let mut events = ChatEvents::INPUT;
        if !self.outbox.is_empty() {
            events |= ChatEvents::OUTPUT;
        }
        events
    }

    /// Wait up to `timeout` for readiness, then flush queued output and
    /// parse whatever arrived. Reports [`ChatError::Timeout`] when nothing
    /// became ready.
    pub fn update(&mut self, timeout: Duration) -> Result<(), ChatError> {
        let Some(sock) = self.sock.as_ref() else {
            return Err(ChatError::NotStarted);
        };
        let mut interest = PollFlags::POLLIN;
        if !self.outbox.is_empty() {
            interest |= PollFlags::POLLOUT;
        }
        let mut fds = [PollFd::new(sock.as_fd(), interest)];
        let ready = loop {
            match poll(&mut fds, poll_timeout(timeout)) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(sys(err)),
            }
        };
        if ready == 0 {
            return Err(ChatError::Timeout);
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        drop(fds);

        if revents.intersects(PollFlags::POLLOUT) {
            self.flush()?;
        }
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
            self.receive()?;
        }
        Ok(())
    }

    /// Drain the head outbound buffer; later buffers wait for the next
    /// writable round.
    fn flush(&mut self) -> Result<(), ChatError> {
        let Some(sock) = self.sock.as_mut() else {
            return Ok(());
        };
        let Some(head) = self.outbox.front_mut() else {
            return Ok(());
        };
        loop {
            match sock.write(head.remaining()) {
                Ok(written) => {
                    head.advance(written);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ChatError::Sys(err)),
            }
        }
        if self.outbox.front().is_some_and(OutBuffer::is_done) {
            self.outbox.pop_front();
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<(), ChatError> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let Some(sock) = self.sock.as_mut() else {
                return Ok(());
            };
            match sock.read(&mut buf) {
                Ok(0) => {
                    // The server went away; silently drop the connection.
                    debug!("chat server closed the connection");
                    self.sock = None;
                    return Ok(());
                }
                Ok(count) => {
                    let authors = &mut self.authors;
                    let inbox = &mut self.inbox;
                    self.incoming.feed(&buf[..count], |author, data| {
                        let author = intern(authors, author);
                        inbox.push_back(ChatMessage {
                            author,
                            data: text(&data),
                        });
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                    self.sock = None;
                    return Ok(());
                }
                Err(err) => return Err(ChatError::Sys(err)),
            }
        }
    }
}

fn intern(authors: &mut Vec<Rc<str>>, raw: &[u8]) -> Rc<str> {
    let name = String::from_utf8_lossy(raw);
    if let Some(existing) = authors.iter().find(|author| author.as_ref() == name.as_ref()) {
        return Rc::clone(existing);
    }
    let author: Rc<str> = Rc::from(name.into_owned());
    authors.push(Rc::clone(&author));
    author
}

impl fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatClient")
            .field("connected", &self.sock.is_some())
            .field("queued_out", &self.outbox.len())
            .field("inbox", &self.inbox.len())
            .finish()
    }
}
