//! Broadcast server: accept, read, fan out, flush, all inside one
//! readiness-driven `update` call.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};
use memchr::memchr;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, bind, listen, setsockopt, socket,
    sockopt,
};
use smallvec::SmallVec;

use super::message::{LineParser, OutBuffer, text};
use super::{ChatError, ChatEvents, ChatMessage, poll_timeout, sys};

const READ_CHUNK: usize = 1024;

struct Peer {
    sock: TcpStream,
    /// First received line; unset until then.
    name: Option<Rc<str>>,
    incoming: LineParser,
    outbox: VecDeque<OutBuffer>,
    /// Disconnected during this update; unlinked once event handling is
    /// over so peer indices stay stable in between.
    dead: bool,
}

impl Peer {
    fn new(sock: TcpStream) -> Self {
        Peer {
            sock,
            name: None,
            incoming: LineParser::new(),
            outbox: VecDeque::new(),
            dead: false,
        }
    }
}

/// A line-oriented broadcast chat server.
pub struct ChatServer {
    listener: Option<TcpListener>,
    peers: Vec<Peer>,
    /// Messages received from peers, in arrival order, for the owner.
    inbox: VecDeque<ChatMessage>,
    /// Complete server-feed frames, replayed to peers that join later.
    feed_backlog: Vec<Vec<u8>>,
    /// Partial feed line waiting for its newline.
    feed_partial: Vec<u8>,
}

impl Default for ChatServer {
    fn default() -> Self {
        ChatServer::new()
    }
}

impl ChatServer {
    /// A server that is not listening yet.
    pub fn new() -> ChatServer {
        ChatServer {
            listener: None,
            peers: Vec::new(),
            inbox: VecDeque::new(),
            feed_backlog: Vec::new(),
            feed_partial: Vec::new(),
        }
    }

    /// Bind and listen on `port` on all local IPv4 addresses. Port 0 picks
    /// an ephemeral port, see [`ChatServer::local_port`].
    pub fn listen(&mut self, port: u16) -> Result<(), ChatError> {
        if self.listener.is_some() {
            return Err(ChatError::AlreadyStarted);
        }
        let sock = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .map_err(sys)?;
        setsockopt(&sock, sockopt::ReuseAddr, &true).map_err(sys)?;
        match bind(sock.as_raw_fd(), &SockaddrIn::new(0, 0, 0, 0, port)) {
            Ok(()) => {}
            Err(Errno::EADDRINUSE) => return Err(ChatError::PortBusy),
            Err(err) => return Err(sys(err)),
        }
        listen(&sock, Backlog::MAXCONN).map_err(sys)?;

        let listener = TcpListener::from(sock);
        listener.set_nonblocking(true)?;
        self.listener = Some(listener);
        Ok(())
    }

    /// Port the server listens on, once started.
    pub fn local_port(&self) -> Option<u16> {
        let listener = self.listener.as_ref()?;
        listener.local_addr().ok().map(|addr| addr.port())
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Pop the next message received from any peer, in arrival order.
    pub fn pop_next(&mut self) -> Option<ChatMessage> {
        self.inbox.pop_front()
    }

    /// Readiness interest for embedding into an external event loop.
    pub fn events(&self) -> ChatEvents {
        if self.listener.is_none() {
            return ChatEvents::empty();
        }
        let mut events = ChatEvents::INPUT;
        if self.peers.iter().any(|peer| !peer.outbox.is_empty()) {
            events |= ChatEvents::OUTPUT;
        }
        events
    }

    /// Wait up to `timeout` for readiness and drain all ready I/O: accept
    /// new peers, read and fan out their messages, flush pending output.
    /// Reports [`ChatError::Timeout`] when nothing became ready.
    pub fn update(&mut self, timeout: Duration) -> Result<(), ChatError> {
        let listener = self.listener.as_ref().ok_or(ChatError::NotStarted)?;

        let mut fds: SmallVec<[PollFd<'_>; 8]> = SmallVec::new();
        fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        for peer in &self.peers {
            let mut interest = PollFlags::POLLIN;
            if !peer.outbox.is_empty() {
                interest |= PollFlags::POLLOUT;
            }
            fds.push(PollFd::new(peer.sock.as_fd(), interest));
        }

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

        let mut accept_ready = false;
        let mut peer_events: SmallVec<[(usize, bool, bool); 8]> = SmallVec::new();
        for (index, fd) in fds.iter().enumerate() {
            let revents = fd.revents().unwrap_or(PollFlags::empty());
            if index == 0 {
                accept_ready = revents.intersects(PollFlags::POLLIN);
                continue;
            }
            let readable =
                revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR);
            let writable = revents.intersects(PollFlags::POLLOUT);
            if readable || writable {
                peer_events.push((index - 1, readable, writable));
            }
        }
        drop(fds);

        if accept_ready {
            self.accept_peers()?;
        }
        for (index, readable, writable) in peer_events {
            if readable {
                self.receive_from(index)?;
            }
            if writable {
                self.send_to(index)?;
            }
        }
        self.peers.retain(|peer| !peer.dead);
        Ok(())
    }

    /// Broadcast text from the server's owner to every connected peer
    /// under the author `server`. Only complete lines go out; a partial
    /// tail is buffered until its newline arrives. Fed lines are kept and
    /// replayed to peers that join later.
    pub fn feed(&mut self, message: &str) -> Result<(), ChatError> {
        if self.listener.is_none() {
            return Err(ChatError::NotStarted);
        }
        self.feed_partial.extend_from_slice(message.as_bytes());
        while let Some(pos) = memchr(b'\n', &self.feed_partial) {
            let rest = self.feed_partial.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.feed_partial, rest);
            line.pop();

            let mut frame = Vec::with_capacity("server:".len() + line.len() + 1);
            frame.extend_from_slice(b"server:");
            frame.extend_from_slice(&line);
            frame.push(b'\n');
            for peer in self.peers.iter_mut().filter(|peer| !peer.dead) {
                peer.outbox.push_back(OutBuffer::new(frame.clone()));
            }
            self.feed_backlog.push(frame);
        }
        Ok(())
    }

    fn accept_peers(&mut self) -> Result<(), ChatError> {
        let Some(listener) = self.listener.as_ref() else {
            return Ok(());
        };
        loop {
            match listener.accept() {
                Ok((sock, addr)) => {
                    sock.set_nonblocking(true).map_err(ChatError::Sys)?;
                    debug!("accepted chat peer from {addr}");
                    let mut peer = Peer::new(sock);
                    // Late joiners still get every server announcement.
                    for frame in &self.feed_backlog {
                        peer.outbox.push_back(OutBuffer::new(frame.clone()));
                    }
                    self.peers.push(peer);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ChatError::Sys(err)),
            }
        }
    }

    fn receive_from(&mut self, index: usize) -> Result<(), ChatError> {
        let author;
        let pending;
        {
            let Some(peer) = self.peers.get_mut(index) else {
                return Ok(());
            };
            if peer.dead {
                return Ok(());
            }
            let mut lines = Vec::new();
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match peer.sock.read(&mut buf) {
                    Ok(0) => {
                        peer.dead = true;
                        break;
                    }
                    Ok(count) => peer.incoming.feed(&buf[..count], &mut lines),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                        peer.dead = true;
                        break;
                    }
                    Err(err) => return Err(ChatError::Sys(err)),
                }
            }
            if peer.dead {
                // Silently dropped, along with anything it still had
                // queued in either direction.
                return Ok(());
            }

            let mut lines = lines.into_iter();
            if peer.name.is_none() {
                match lines.next() {
                    Some(first) => peer.name = Some(Rc::from(text(&first))),
                    None => return Ok(()),
                }
            }
            author = match peer.name.clone() {
                Some(name) => name,
                None => return Ok(()),
            };
            pending = lines;
        }

        for line in pending {
            let data = text(&line);
            self.inbox.push_back(ChatMessage {
                author: Rc::clone(&author),
                data: data.clone(),
            });
            self.fan_out(index, &author, &line);
        }
        Ok(())
    }

    fn fan_out(&mut self, from: usize, author: &str, line: &[u8]) {
        let mut frame = Vec::with_capacity(author.len() + 1 + line.len() + 1);
        frame.extend_from_slice(author.as_bytes());
        frame.push(b':');
        frame.extend_from_slice(line);
        frame.push(b'\n');
        for (index, peer) in self.peers.iter_mut().enumerate() {
            if index == from || peer.dead {
                continue;
            }
            peer.outbox.push_back(OutBuffer::new(frame.clone()));
        }
    }

    fn send_to(&mut self, index: usize) -> Result<(), ChatError> {
        let Some(peer) = self.peers.get_mut(index) else {
            return Ok(());
        };
        if peer.dead {
            return Ok(());
        }
        while let Some(head) = peer.outbox.front_mut() {
            match peer.sock.write(head.remaining()) {
                Ok(count) => {
                    head.advance(count);
                    if head.is_done() {
                        peer.outbox.pop_front();
                    } else {
                        // Socket buffer full; the cursor picks the frame
                        // up on the next writable round.
                        return Ok(());
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!("dropping chat peer on write error: {err}");
                    peer.dead = true;
                    return Ok(());
                }
                Err(err) => return Err(ChatError::Sys(err)),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ChatServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatServer")
            .field("port", &self.local_port())
            .field("peers", &self.peers.len())
            .field("inbox", &self.inbox.len())
            .finish()
    }
}
