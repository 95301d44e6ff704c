//! Cooperative multi-channel message bus.
//!
//! A [`Bus`] owns a sparse, indexed set of bounded channels carrying `u32`
//! messages. Channel handles are small integers, stable for the channel's
//! lifetime and reused after close. Blocking operations are `async fn`s
//! meant to run on a single-threaded executor (the tests use
//! `futures::executor::LocalPool`); a coroutine that cannot make progress
//! parks itself in the channel's FIFO wait queue and is resumed with one
//! wakeup per state transition, so wakeups stay proportional to progress.
//!
//! The bus is not thread safe. Serialisation between coroutines is
//! guaranteed by the cooperative scheduler alone: state is only touched
//! between suspension points.

mod wait_queue;

#[cfg(test)]
mod tests;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use self::wait_queue::WaitQueue;

/// Identifier of an open channel: a small non-negative index, reusable
/// after the channel it referred to is closed.
pub type Handle = usize;

/// Errors reported by bus operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    /// The handle does not name an open channel, or the channel was closed
    /// while the operation was suspended on it.
    #[error("no such channel")]
    NoChannel,
    /// The operation could not make progress without suspending.
    #[error("operation would block")]
    WouldBlock,
}

struct Channel {
    /// Channel max capacity.
    size_limit: usize,
    /// Message queue.
    data: RefCell<VecDeque<u32>>,
    /// Coroutines waiting until the channel is not full.
    send_queue: WaitQueue,
    /// Coroutines waiting until the channel is not empty.
    recv_queue: WaitQueue,
    /// Set on close so waiters that outlive the slot observe it.
    closed: Cell<bool>,
}

impl Channel {
    fn new(size_limit: usize) -> Rc<Self> {
        Rc::new(Channel {
            size_limit,
            data: RefCell::new(VecDeque::new()),
            send_queue: WaitQueue::new(),
            recv_queue: WaitQueue::new(),
            closed: Cell::new(false),
        })
    }

    fn is_full(&self) -> bool {
        self.data.borrow().len() >= self.size_limit
    }
}

/// An in-process message bus over cooperative coroutines.
#[derive(Default)]
pub struct Bus {
    channels: RefCell<Vec<Option<Rc<Channel>>>>,
}

impl Bus {
    /// Create an empty bus with no channels.
    pub fn new() -> Self {
        Bus::default()
    }

    /// Open a channel holding at most `size_limit` messages and return its
    /// handle. The lowest free slot is reused before the table grows.
    pub fn open(&self, size_limit: usize) -> Handle {
        let channel = Channel::new(size_limit);
        let mut channels = self.channels.borrow_mut();
        match channels.iter().position(Option::is_none) {
            Some(slot) => {
                channels[slot] = Some(channel);
                slot
            }
            None => {
                channels.push(Some(channel));
                channels.len() - 1
            }
        }
    }

    /// Close a channel. Every coroutine suspended on it is woken up and
    /// observes [`BusError::NoChannel`]. Closing an unknown handle is a
    /// no-op.
    pub fn close(&self, handle: Handle) {
        let removed = self
            .channels
            .borrow_mut()
            .get_mut(handle)
            .and_then(Option::take);
        if let Some(channel) = removed {
            channel.closed.set(true);
            channel.recv_queue.wake_all();
            channel.send_queue.wake_all();
        }
    }

    fn lookup(&self, handle: Handle) -> Result<Rc<Channel>, BusError> {
        self.channels
            .borrow()
            .get(handle)
            .and_then(Clone::clone)
            .ok_or(BusError::NoChannel)
    }

    /// Send one message, suspending while the channel is full.
    pub async fn send(&self, handle: Handle, value: u32) -> Result<(), BusError> {
        self.send_v(handle, &[value]).await.map(|_| ())
    }

    /// Send one message without suspending.
    pub fn try_send(&self, handle: Handle, value: u32) -> Result<(), BusError> {
        self.try_send_v(handle, &[value]).map(|_| ())
    }

    /// Receive one message, suspending while the channel is empty.
    pub async fn recv(&self, handle: Handle) -> Result<u32, BusError> {
        let mut value = [0];
        self.recv_v(handle, &mut value).await?;
        Ok(value[0])
    }

    /// Receive one message without suspending.
    pub fn try_recv(&self, handle: Handle) -> Result<u32, BusError> {
        let mut value = [0];
        self.try_recv_v(handle, &mut value)?;
        Ok(value[0])
    }

    /// Move messages from `data` into the channel, suspending only while it
    /// is completely full. Transfers at least one message on success and
    /// returns the count actually moved; partial transfer is not an error.
    pub async fn send_v(&self, handle: Handle, data: &[u32]) -> Result<usize, BusError> {
        let sent = loop {
            match self.try_send_v(handle, data) {
                Ok(sent) => break sent,
                Err(BusError::WouldBlock) => {
                    let channel = self.lookup(handle)?;
                    channel.send_queue.suspend().await;
                    if channel.closed.get() {
                        return Err(BusError::NoChannel);
                    }
                }
                Err(err) => return Err(err),
            }
        };
        // Cascade the credit: if there is still space left, the next parked
        // sender can make progress too.
        if let Ok(channel) = self.lookup(handle) {
            if !channel.is_full() {
                channel.send_queue.wake_first();
            }
        }
        Ok(sent)
    }

    /// Move up to `min(data.len(), size_limit - len)` messages into the
    /// channel without suspending. A completely full channel reports
    /// [`BusError::WouldBlock`].
    pub fn try_send_v(&self, handle: Handle, data: &[u32]) -> Result<usize, BusError> {
        let channel = self.lookup(handle)?;
        let mut queue = channel.data.borrow_mut();
        if queue.len() >= channel.size_limit {
            return Err(BusError::WouldBlock);
        }
        let moved = data.len().min(channel.size_limit - queue.len());
        queue.extend(data[..moved].iter().copied());
        drop(queue);
        channel.recv_queue.wake_first();
        Ok(moved)
    }

    /// Move messages from the channel into `data`, suspending only while it
    /// is completely empty. Returns the count actually moved (at least one).
    pub async fn recv_v(&self, handle: Handle, data: &mut [u32]) -> Result<usize, BusError> {
        let received = loop {
            match self.try_recv_v(handle, data) {
                Ok(received) => break received,
                Err(BusError::WouldBlock) => {
                    let channel = self.lookup(handle)?;
                    channel.recv_queue.suspend().await;
                    if channel.closed.get() {
                        return Err(BusError::NoChannel);
                    }
                }
                Err(err) => return Err(err),
            }
        };
        if let Ok(channel) = self.lookup(handle) {
            if !channel.data.borrow().is_empty() {
                channel.recv_queue.wake_first();
            }
        }
        Ok(received)
    }

    /// Move up to `data.len()` messages out of the channel without
    /// suspending. An empty channel reports [`BusError::WouldBlock`].
    pub fn try_recv_v(&self, handle: Handle, data: &mut [u32]) -> Result<usize, BusError> {
        let channel = self.lookup(handle)?;
        let mut queue = channel.data.borrow_mut();
        if queue.is_empty() {
            return Err(BusError::WouldBlock);
        }
        let moved = data.len().min(queue.len());
        for (slot, value) in data.iter_mut().zip(queue.drain(..moved)) {
            *slot = value;
        }
        drop(queue);
        channel.send_queue.wake_first();
        Ok(moved)
    }

    /// Append `value` to every open channel, suspending on the first full
    /// channel found until the whole broadcast can complete atomically.
    /// Fails with [`BusError::NoChannel`] iff no channel exists.
    pub async fn broadcast(&self, value: u32) -> Result<(), BusError> {
        loop {
            match self.try_broadcast(value) {
                Ok(()) => break,
                Err(BusError::WouldBlock) => {
                    let full = self
                        .channels
                        .borrow()
                        .iter()
                        .flatten()
                        .find(|channel| channel.is_full())
                        .cloned();
                    if let Some(channel) = full {
                        channel.send_queue.suspend().await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        for channel in self.channels.borrow().iter().flatten() {
            if !channel.is_full() {
                channel.send_queue.wake_first();
            }
        }
        Ok(())
    }

    /// Append `value` to every open channel, or to none at all: if any
    /// channel is full nothing is enqueued anywhere and the call reports
    /// [`BusError::WouldBlock`].
    pub fn try_broadcast(&self, value: u32) -> Result<(), BusError> {
        let channels = self.channels.borrow();
        let mut any_open = false;
        for channel in channels.iter().flatten() {
            any_open = true;
            if channel.is_full() {
                return Err(BusError::WouldBlock);
            }
        }
        if !any_open {
            return Err(BusError::NoChannel);
        }
        for channel in channels.iter().flatten() {
            channel.data.borrow_mut().push_back(value);
            channel.recv_queue.wake_first();
        }
        Ok(())
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        // Matches close(): waiters still parked on any channel observe
        // NoChannel instead of hanging forever.
        let channels = std::mem::take(&mut *self.channels.borrow_mut());
        for channel in channels.into_iter().flatten() {
            channel.closed.set(true);
            channel.recv_queue.wake_all();
            channel.send_queue.wake_all();
        }
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = self
            .channels
            .borrow()
            .iter()
            .filter(|slot| slot.is_some())
            .count();
        f.debug_struct("Bus").field("open_channels", &open).finish()
    }
}
