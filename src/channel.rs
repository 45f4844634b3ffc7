use crate::buffer::{Buffer, RecvResult};
use crate::error::Result;
use crate::event_loop::TaskSender;
use polling::{Event, PollMode, Poller};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

pub type ChannelId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    /// Present for the connect path; accepted sockets skip straight past it.
    Connecting,
    Connected,
    Disconnecting,
}

/// Per-connection callbacks, dispatched on the owning loop thread. Stored
/// next to the channel in the loop's socket table so both can be borrowed
/// at once.
pub trait ChannelHandler: Send {
    /// Return false to reject the connection.
    fn on_connected(&mut self, _chan: &mut Channel) -> bool {
        true
    }

    /// Called after each receive with all buffered unread bytes. Consume
    /// complete frames; a trailing partial frame stays buffered. Return
    /// false to close the connection.
    fn on_message(&mut self, chan: &mut Channel, input: &mut Buffer) -> bool;

    /// Fired when a send fully drains (immediately or after backpressure).
    fn on_write_complete(&mut self, _chan: &mut Channel) {}

    /// Fired exactly once when the connection tears down.
    fn on_closed(&mut self, _chan: &mut Channel) {}
}

/// Poller registration plus the interest flags it was registered with.
/// All mutation happens on the loop thread.
struct AsyncSocket {
    poller: Arc<Poller>,
    key: usize,
    readable: bool,
    writable: bool,
    attached: bool,
}

impl AsyncSocket {
    fn new(poller: Arc<Poller>) -> Self {
        Self {
            poller,
            key: 0,
            readable: false,
            writable: false,
            attached: false,
        }
    }

    fn event(&self) -> Option<Event> {
        match (self.readable, self.writable) {
            (true, true) => Some(Event::all(self.key)),
            (true, false) => Some(Event::readable(self.key)),
            (false, true) => Some(Event::writable(self.key)),
            (false, false) => None,
        }
    }

    fn attach(&mut self, sock: &TcpStream) -> io::Result<()> {
        let ev = match self.event() {
            Some(ev) => ev,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "attach without io interest",
                ))
            }
        };
        if self.attached {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "socket already attached",
            ));
        }
        unsafe {
            self.poller.add_with_mode(sock, ev, PollMode::Level)?;
        }
        self.attached = true;
        Ok(())
    }

    /// Updates interest; an empty interest set detaches from the poller.
    fn modify_io_events(
        &mut self,
        sock: &TcpStream,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        self.readable = readable;
        self.writable = writable;
        match self.event() {
            Some(ev) if self.attached => self.poller.modify_with_mode(sock, ev, PollMode::Level),
            Some(ev) => {
                unsafe {
                    self.poller.add_with_mode(sock, ev, PollMode::Level)?;
                }
                self.attached = true;
                Ok(())
            }
            None => self.detach(sock),
        }
    }

    /// Deregisters at most once.
    fn detach(&mut self, sock: &TcpStream) -> io::Result<()> {
        if self.attached {
            self.attached = false;
            self.readable = false;
            self.writable = false;
            self.poller.delete(sock)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
pub(crate) enum ReadOutcome {
    Received(usize),
    Retry,
    Closing,
}

#[derive(Debug)]
pub(crate) enum WriteOutcome {
    Flushed,
    Partial,
    Closing,
}

/// One accepted connection: socket, buffered input/output and the close
/// state machine. Owned by its event loop's socket table; other threads
/// interact through a [`ChannelHandle`].
pub struct Channel {
    id: ChannelId,
    sock: TcpStream,
    peer: SocketAddr,
    socket: AsyncSocket,
    status: ChannelStatus,
    input: Buffer,
    output: Buffer,
    last_activity: Instant,
    write_complete: bool,
    sender: TaskSender,
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

impl Channel {
    pub(crate) fn new(
        sock: TcpStream,
        peer: SocketAddr,
        id: ChannelId,
        poller: Arc<Poller>,
        sender: TaskSender,
    ) -> Self {
        trace!(id, %peer, "create channel");
        Self {
            id,
            sock,
            peer,
            socket: AsyncSocket::new(poller),
            status: ChannelStatus::Connecting,
            input: Buffer::new(),
            output: Buffer::default(),
            last_activity: Instant::now(),
            write_complete: false,
            sender,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    /// Bytes queued behind backpressure, not yet written to the socket.
    pub fn pending_send_bytes(&self) -> usize {
        self.output.unread()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Weak reference for use from other threads. Operations on a handle
    /// whose channel is gone are silent no-ops.
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            id: self.id,
            key: self.socket.key,
            sender: self.sender.clone(),
        }
    }

    pub(crate) fn set_key(&mut self, key: usize) {
        self.socket.key = key;
    }

    /// Registers for reads and marks the channel connected.
    pub(crate) fn attach(&mut self) -> io::Result<()> {
        self.socket.readable = true;
        self.socket.attach(&self.sock)?;
        self.status = ChannelStatus::Connected;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Sends `data`, preserving FIFO order with anything already queued.
    ///
    /// When the output buffer is empty and no write interest is pending, one
    /// immediate nonblocking send is attempted; a short write queues the
    /// remainder and enables write interest. Retryable errors queue the
    /// whole payload. Fatal errors begin close and return false.
    pub fn send_message(&mut self, data: &[u8]) -> bool {
        debug_assert!(self.sender.is_in_loop_thread() || !self.sender.is_running());
        if self.status != ChannelStatus::Connected || data.is_empty() {
            return false;
        }
        let mut sent = 0usize;
        if !self.socket.writable && self.output.is_empty() {
            match (&self.sock).write(data) {
                Ok(0) => {
                    warn!(id = self.id, "send wrote zero bytes, closing");
                    self.begin_close();
                    return false;
                }
                Ok(n) => sent = n,
                Err(e) if is_retryable(&e) => sent = 0,
                Err(e) => {
                    warn!(id = self.id, "send failed: {}, closing", e);
                    self.begin_close();
                    return false;
                }
            }
        }
        if sent < data.len() {
            self.output.append(&data[sent..]);
            if !self.socket.writable {
                if let Err(e) = self.socket.modify_io_events(&self.sock, true, true) {
                    warn!(id = self.id, "enable write interest failed: {}", e);
                    self.begin_close();
                    return false;
                }
            }
        } else {
            // full immediate send; the loop fires on_write_complete after
            // the current callback returns.
            self.write_complete = true;
        }
        true
    }

    /// Requests teardown. Safe to call repeatedly and from handler
    /// callbacks; the loop finalizes once the current dispatch unwinds.
    pub fn begin_close(&mut self) {
        if matches!(
            self.status,
            ChannelStatus::Connected | ChannelStatus::Connecting
        ) {
            self.status = ChannelStatus::Disconnecting;
        }
    }

    /// Loop-side teardown: drop interest, deregister, mark disconnected.
    /// Runs at most once since the loop removes the table entry first.
    pub(crate) fn finalize_close(&mut self) {
        if let Err(e) = self.socket.detach(&self.sock) {
            debug!(id = self.id, "deregister on close failed: {}", e);
        }
        self.status = ChannelStatus::Disconnected;
        trace!(id = self.id, peer = %self.peer, "channel closed");
    }

    /// One buffered receive per readable event; level triggering redelivers
    /// while more bytes remain.
    pub(crate) fn handle_read(&mut self) -> ReadOutcome {
        match self.input.receive_from(self.sock.as_raw_fd()) {
            RecvResult::Received(n) => {
                self.last_activity = Instant::now();
                ReadOutcome::Received(n)
            }
            RecvResult::Retry => ReadOutcome::Retry,
            RecvResult::Closed => {
                debug!(id = self.id, "peer closed connection");
                self.begin_close();
                ReadOutcome::Closing
            }
            RecvResult::Error(e) => {
                warn!(id = self.id, "receive failed: {}", e);
                self.begin_close();
                ReadOutcome::Closing
            }
        }
    }

    /// Flushes queued output on a writable event. Once drained, write
    /// interest is dropped and `Flushed` asks the loop to fire the
    /// write-complete callback.
    pub(crate) fn handle_write(&mut self) -> WriteOutcome {
        if self.output.is_empty() {
            if self.socket.writable {
                let _ = self.socket.modify_io_events(&self.sock, true, false);
            }
            return WriteOutcome::Partial;
        }
        match (&self.sock).write(self.output.readable_slice()) {
            Ok(0) => {
                self.begin_close();
                WriteOutcome::Closing
            }
            Ok(n) => {
                self.output.consume(n);
                if self.output.is_empty() {
                    if let Err(e) = self.socket.modify_io_events(&self.sock, true, false) {
                        warn!(id = self.id, "disable write interest failed: {}", e);
                        self.begin_close();
                        return WriteOutcome::Closing;
                    }
                    WriteOutcome::Flushed
                } else {
                    WriteOutcome::Partial
                }
            }
            Err(e) if is_retryable(&e) => WriteOutcome::Partial,
            Err(e) => {
                warn!(id = self.id, "flush failed: {}", e);
                self.begin_close();
                WriteOutcome::Closing
            }
        }
    }

    pub(crate) fn take_input(&mut self) -> Buffer {
        std::mem::take(&mut self.input)
    }

    pub(crate) fn restore_input(&mut self, input: Buffer) {
        self.input = input;
    }

    pub(crate) fn take_write_complete(&mut self) -> bool {
        std::mem::replace(&mut self.write_complete, false)
    }
}

/// Cloneable cross-thread reference to a channel. Holds the channel id and
/// its socket table key; both must still match at resolution time, so a
/// handle outliving its channel degrades to a no-op.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    key: usize,
    sender: TaskSender,
}

impl ChannelHandle {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Marshals a send onto the owning loop, preserving per-connection FIFO
    /// order with other sends.
    pub fn send(&self, data: Vec<u8>) -> Result<()> {
        let (key, id) = (self.key, self.id);
        self.sender
            .run_in_loop(move |core| core.send_to_channel(key, id, data))
    }

    /// Marshals a close onto the owning loop. Idempotent.
    pub fn close(&self) {
        let (key, id) = (self.key, self.id);
        let _ = self
            .sender
            .run_in_loop(move |core| core.close_channel(key, id));
    }
}
