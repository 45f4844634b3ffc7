use crate::channel::{
    Channel, ChannelHandler, ChannelId, ChannelStatus, ReadOutcome, WriteOutcome,
};
use crate::error::{Error, Result};
use crate::flat_storage::FlatStorage;
use polling::{Event, Events, PollMode, Poller};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Lifecycle of one event loop, readable from any thread.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopStatus {
    Null = 0,
    Initializing = 1,
    Initialized = 2,
    Starting = 3,
    Running = 4,
    Stopping = 5,
    Stopped = 6,
}

impl LoopStatus {
    fn from_u8(v: u8) -> LoopStatus {
        match v {
            1 => LoopStatus::Initializing,
            2 => LoopStatus::Initialized,
            3 => LoopStatus::Starting,
            4 => LoopStatus::Running,
            5 => LoopStatus::Stopping,
            6 => LoopStatus::Stopped,
            _ => LoopStatus::Null,
        }
    }
}

/// A closure marshaled onto the loop thread. It receives the loop-owned
/// state; nothing outside the loop thread ever touches that state directly.
pub type Task = Box<dyn FnOnce(&mut LoopCore) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub(crate) struct LoopShared {
    status: AtomicU8,
    notified: AtomicBool,
    thread: Mutex<Option<std::thread::ThreadId>>,
    poller: Arc<Poller>,
    next_timer_id: AtomicU64,
}

/// Cloneable, `Send` handle for marshaling work onto an event loop.
///
/// Wakeups are coalesced: queuing sets a `notified` flag and only pokes the
/// poller when the flag was clear. The loop clears the flag at the start of
/// each drain, so a burst of queued tasks costs one wakeup.
#[derive(Clone)]
pub struct TaskSender {
    tx: Sender<Task>,
    shared: Arc<LoopShared>,
}

impl TaskSender {
    pub fn status(&self) -> LoopStatus {
        LoopStatus::from_u8(self.shared.status.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.status() == LoopStatus::Running
    }

    pub fn is_in_loop_thread(&self) -> bool {
        match self.shared.thread.lock() {
            Ok(guard) => *guard == Some(std::thread::current().id()),
            Err(_) => false,
        }
    }

    /// Queues `task` to run on the loop thread. When called from the loop
    /// thread itself (e.g. inside a handler callback) the task still runs
    /// within the current cycle, after already-queued work.
    pub fn run_in_loop(&self, task: impl FnOnce(&mut LoopCore) + Send + 'static) -> Result<()> {
        self.push(Box::new(task))
    }

    /// Queues `task` for a later drain of the loop's task queue.
    pub fn queue_in_loop(&self, task: impl FnOnce(&mut LoopCore) + Send + 'static) -> Result<()> {
        self.push(Box::new(task))
    }

    fn push(&self, task: Task) -> Result<()> {
        self.tx.send(task).map_err(|_| Error::LoopStopped)?;
        if !self.shared.notified.swap(true, Ordering::AcqRel) {
            self.shared.poller.notify()?;
        }
        Ok(())
    }

    /// Requests loop shutdown. Tasks queued before this call still run
    /// before the loop exits.
    pub fn stop(&self) {
        self.shared
            .status
            .store(LoopStatus::Stopping as u8, Ordering::Release);
        let _ = self.queue_in_loop(|_| {});
    }

    /// One-shot timer on the loop thread.
    pub fn run_after(
        &self,
        delay: Duration,
        f: impl FnOnce(&mut LoopCore) + Send + 'static,
    ) -> Result<TimerId> {
        let id = TimerId(self.shared.next_timer_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + delay;
        self.run_in_loop(move |core| {
            core.add_timer(id, deadline, None, TimerCallback::Once(Box::new(f)));
        })?;
        Ok(id)
    }

    /// Periodic timer on the loop thread. First fire is one `period` out.
    pub fn run_every(
        &self,
        period: Duration,
        f: impl FnMut(&mut LoopCore) + Send + 'static,
    ) -> Result<TimerId> {
        let id = TimerId(self.shared.next_timer_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + period;
        self.run_in_loop(move |core| {
            core.add_timer(id, deadline, Some(period), TimerCallback::Every(Box::new(f)));
        })?;
        Ok(id)
    }

    /// Cancels a timer. Safe to call after the timer fired or was cancelled.
    pub fn cancel(&self, id: TimerId) {
        let _ = self.run_in_loop(move |core| core.cancel_timer(id));
    }
}

/// Receives accepted sockets from a listening socket owned by the loop.
pub trait ListenerHandler: Send {
    fn on_new_connection(&mut self, sock: TcpStream, peer: SocketAddr);
}

impl<F: FnMut(TcpStream, SocketAddr) + Send> ListenerHandler for F {
    fn on_new_connection(&mut self, sock: TcpStream, peer: SocketAddr) {
        self(sock, peer)
    }
}

pub(crate) enum SocketEntry {
    Listener {
        sock: TcpListener,
        handler: Box<dyn ListenerHandler>,
    },
    Stream {
        channel: Channel,
        handler: Box<dyn ChannelHandler>,
    },
}

enum TimerCallback {
    Once(Box<dyn FnOnce(&mut LoopCore) + Send>),
    Every(Box<dyn FnMut(&mut LoopCore) + Send>),
}

struct TimerEntry {
    period: Option<Duration>,
    cb: TimerCallback,
}

struct TimerKey {
    deadline: Instant,
    id: u64,
}

fn min_heap_push(heap: &mut Vec<TimerKey>, key: TimerKey) {
    heap.push(key);
    let mut i = heap.len() - 1;
    while i > 0 {
        let parent = (i - 1) / 2;
        if heap[parent].deadline <= heap[i].deadline {
            break;
        }
        heap.swap(parent, i);
        i = parent;
    }
}

fn min_heap_pop(heap: &mut Vec<TimerKey>) -> Option<TimerKey> {
    if heap.is_empty() {
        return None;
    }
    let last = heap.len() - 1;
    heap.swap(0, last);
    let top = heap.pop();
    let mut i = 0;
    loop {
        let left = i * 2 + 1;
        if left >= heap.len() {
            break;
        }
        let mut child = left;
        let right = left + 1;
        if right < heap.len() && heap[right].deadline < heap[left].deadline {
            child = right;
        }
        if heap[i].deadline <= heap[child].deadline {
            break;
        }
        heap.swap(i, child);
        i = child;
    }
    top
}

/// Loop-owned state: the socket table, timers, and the poller handle. Only
/// the loop thread sees a `&mut LoopCore`; other threads reach it through
/// marshaled tasks.
pub struct LoopCore {
    poller: Arc<Poller>,
    sockets: FlatStorage<SocketEntry>,
    timers: HashMap<u64, TimerEntry>,
    timer_heap: Vec<TimerKey>,
    firing_timer: Option<u64>,
    firing_cancelled: bool,
    next_channel_id: Arc<AtomicU64>,
    sender: TaskSender,
}

impl LoopCore {
    pub fn sender(&self) -> &TaskSender {
        &self.sender
    }

    pub fn count_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Registers a listening socket. Accepted connections are passed to
    /// `handler`; the listener is polled level-triggered for readability.
    pub fn add_listener(
        &mut self,
        sock: TcpListener,
        handler: Box<dyn ListenerHandler>,
    ) -> io::Result<usize> {
        sock.set_nonblocking(true)?;
        let key = self.sockets.add(SocketEntry::Listener { sock, handler });
        let registered = match self.sockets.get(key) {
            Some(SocketEntry::Listener { sock, .. }) => unsafe {
                self.poller
                    .add_with_mode(sock, Event::readable(key), PollMode::Level)
            },
            _ => Ok(()),
        };
        if let Err(e) = registered {
            self.sockets.remove(key);
            return Err(e);
        }
        trace!(key, "listener registered");
        Ok(key)
    }

    /// Takes ownership of a connected socket, registers it for reads and
    /// fires the handler's `on_connected`. Returns the channel id and the
    /// socket table key.
    pub fn add_channel(
        &mut self,
        sock: TcpStream,
        peer: SocketAddr,
        handler: Box<dyn ChannelHandler>,
    ) -> io::Result<(ChannelId, usize)> {
        sock.set_nonblocking(true)?;
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        let channel = Channel::new(sock, peer, id, self.poller.clone(), self.sender.clone());
        let key = self.sockets.add(SocketEntry::Stream { channel, handler });
        let attached = match self.sockets.get_mut(key) {
            Some(SocketEntry::Stream { channel, .. }) => {
                channel.set_key(key);
                channel.attach()
            }
            _ => Ok(()),
        };
        if let Err(e) = attached {
            self.sockets.remove(key);
            return Err(e);
        }
        trace!(id, key, %peer, "channel attached");
        let mut keep = true;
        if let Some(SocketEntry::Stream { channel, handler }) = self.sockets.get_mut(key) {
            keep = handler.on_connected(channel);
            // a greeting sent from on_connected may complete immediately.
            while channel.take_write_complete() {
                handler.on_write_complete(channel);
            }
            if channel.status() == ChannelStatus::Disconnecting {
                keep = false;
            }
        }
        if !keep {
            self.finalize_close(key);
        }
        Ok((id, key))
    }

    /// Weak cross-thread handle for the channel at `key`, if any.
    pub fn channel_handle(&self, key: usize) -> Option<crate::channel::ChannelHandle> {
        match self.sockets.get(key) {
            Some(SocketEntry::Stream { channel, .. }) => Some(channel.handle()),
            _ => None,
        }
    }

    /// Sends on a channel resolved by table key and id. Stale handles (key
    /// vacated or reused by a later channel) are a silent no-op.
    pub(crate) fn send_to_channel(&mut self, key: usize, id: ChannelId, data: Vec<u8>) {
        let mut close = false;
        if let Some(SocketEntry::Stream { channel, handler }) = self.sockets.get_mut(key) {
            if channel.id() != id {
                return;
            }
            channel.send_message(&data);
            while channel.take_write_complete() {
                handler.on_write_complete(channel);
            }
            close = channel.status() == ChannelStatus::Disconnecting;
        }
        if close {
            self.finalize_close(key);
        }
    }

    /// Closes a channel resolved by table key and id; no-op when stale.
    pub(crate) fn close_channel(&mut self, key: usize, id: ChannelId) {
        let found = matches!(
            self.sockets.get(key),
            Some(SocketEntry::Stream { channel, .. }) if channel.id() == id
        );
        if found {
            self.finalize_close(key);
        }
    }

    /// Deregisters and drops a listener entry.
    pub fn close_listener(&mut self, key: usize) {
        if let Some(SocketEntry::Listener { sock, .. }) = self.sockets.take(key) {
            if let Err(e) = self.poller.delete(&sock) {
                warn!(key, "listener deregister failed: {}", e);
            }
        }
    }

    /// Tears down a stream entry: deregister, fire `on_closed` once, drop.
    pub(crate) fn finalize_close(&mut self, key: usize) {
        match self.sockets.take(key) {
            Some(SocketEntry::Stream {
                mut channel,
                mut handler,
            }) => {
                channel.finalize_close();
                handler.on_closed(&mut channel);
            }
            Some(SocketEntry::Listener { sock, .. }) => {
                let _ = self.poller.delete(&sock);
            }
            None => {}
        }
    }

    /// Closes every stream whose last receive is older than `timeout`.
    pub fn close_idle_channels(&mut self, timeout: Duration) {
        let now = Instant::now();
        for key in self.sockets.keys() {
            let idle = matches!(
                self.sockets.get(key),
                Some(SocketEntry::Stream { channel, .. })
                    if now.duration_since(channel.last_activity()) >= timeout
            );
            if idle {
                debug!(key, "closing idle channel");
                self.finalize_close(key);
            }
        }
    }

    fn add_timer(
        &mut self,
        id: TimerId,
        deadline: Instant,
        period: Option<Duration>,
        cb: TimerCallback,
    ) {
        self.timers.insert(id.0, TimerEntry { period, cb });
        min_heap_push(&mut self.timer_heap, TimerKey { deadline, id: id.0 });
    }

    fn cancel_timer(&mut self, id: TimerId) {
        if self.timers.remove(&id.0).is_none() && self.firing_timer == Some(id.0) {
            // cancelled from within its own callback.
            self.firing_cancelled = true;
        }
        // stale heap keys are dropped lazily on pop.
    }

    fn next_timer_timeout(&self) -> Option<Duration> {
        self.timer_heap
            .first()
            .map(|k| k.deadline.saturating_duration_since(Instant::now()))
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        loop {
            match self.timer_heap.first() {
                Some(top) if top.deadline <= now => {}
                _ => break,
            }
            let key = match min_heap_pop(&mut self.timer_heap) {
                Some(k) => k,
                None => break,
            };
            let entry = match self.timers.remove(&key.id) {
                Some(e) => e,
                None => continue, // cancelled
            };
            self.firing_timer = Some(key.id);
            self.firing_cancelled = false;
            match entry.cb {
                TimerCallback::Once(f) => f(self),
                TimerCallback::Every(mut f) => {
                    f(self);
                    if let Some(period) = entry.period {
                        if !self.firing_cancelled {
                            self.timers.insert(
                                key.id,
                                TimerEntry {
                                    period: Some(period),
                                    cb: TimerCallback::Every(f),
                                },
                            );
                            min_heap_push(
                                &mut self.timer_heap,
                                TimerKey {
                                    deadline: now + period,
                                    id: key.id,
                                },
                            );
                        }
                    }
                }
            }
            self.firing_timer = None;
            self.firing_cancelled = false;
        }
    }

    fn handle_socket_event(&mut self, ev: Event) {
        let key = ev.key;
        let mut close_key = false;
        match self.sockets.get_mut(key) {
            Some(SocketEntry::Listener { sock, handler }) => {
                if ev.readable {
                    loop {
                        match sock.accept() {
                            Ok((stream, peer)) => handler.on_new_connection(stream, peer),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            Err(e) => {
                                warn!(key, "accept error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            Some(SocketEntry::Stream { channel, handler }) => {
                if ev.writable {
                    match channel.handle_write() {
                        WriteOutcome::Flushed => handler.on_write_complete(channel),
                        WriteOutcome::Partial => {}
                        WriteOutcome::Closing => {}
                    }
                }
                if ev.readable && channel.status() == ChannelStatus::Connected {
                    match channel.handle_read() {
                        ReadOutcome::Received(_) => {
                            // the input buffer moves out around the handler
                            // call so the handler can both parse it and send
                            // on the channel.
                            let mut input = channel.take_input();
                            let keep = handler.on_message(channel, &mut input);
                            channel.restore_input(input);
                            if !keep {
                                channel.begin_close();
                            }
                        }
                        ReadOutcome::Retry => {}
                        ReadOutcome::Closing => {}
                    }
                }
                while channel.take_write_complete() {
                    handler.on_write_complete(channel);
                }
                close_key = channel.status() == ChannelStatus::Disconnecting;
            }
            None => {
                trace!(key, "event for vacated socket key");
            }
        }
        if close_key {
            self.finalize_close(key);
        }
    }
}

/// One reactor loop: a poller, a socket table, a task queue and timers.
///
/// `run()` occupies the calling thread until [`TaskSender::stop`].
pub struct EventLoop {
    core: LoopCore,
    events: Events,
    rx: Receiver<Task>,
    shared: Arc<LoopShared>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Self::with_channel_ids(Arc::new(AtomicU64::new(0)))
    }

    /// Loops sharing one id counter hand out globally unique channel ids.
    pub(crate) fn with_channel_ids(next_channel_id: Arc<AtomicU64>) -> Result<Self> {
        let poller = Arc::new(Poller::new()?);
        let shared = Arc::new(LoopShared {
            status: AtomicU8::new(LoopStatus::Initializing as u8),
            notified: AtomicBool::new(false),
            thread: Mutex::new(None),
            poller: poller.clone(),
            next_timer_id: AtomicU64::new(0),
        });
        let (tx, rx) = std::sync::mpsc::channel();
        let sender = TaskSender {
            tx,
            shared: shared.clone(),
        };
        let core = LoopCore {
            poller,
            sockets: FlatStorage::new(),
            timers: HashMap::new(),
            timer_heap: Vec::new(),
            firing_timer: None,
            firing_cancelled: false,
            next_channel_id,
            sender,
        };
        shared
            .status
            .store(LoopStatus::Initialized as u8, Ordering::Release);
        Ok(Self {
            core,
            events: Events::new(),
            rx,
            shared,
        })
    }

    pub fn sender(&self) -> TaskSender {
        self.core.sender.clone()
    }

    pub fn status(&self) -> LoopStatus {
        LoopStatus::from_u8(self.shared.status.load(Ordering::Acquire))
    }

    /// Direct access to loop state. Only sound before `run()` or from the
    /// loop thread itself.
    pub fn core_mut(&mut self) -> &mut LoopCore {
        &mut self.core
    }

    /// Runs the poll/tasks/timers cycle on the calling thread until stopped.
    /// Tasks queued before the stop request are drained before returning.
    pub fn run(&mut self) {
        self.shared
            .status
            .store(LoopStatus::Starting as u8, Ordering::Release);
        if let Ok(mut guard) = self.shared.thread.lock() {
            *guard = Some(std::thread::current().id());
        }
        self.shared
            .status
            .store(LoopStatus::Running as u8, Ordering::Release);
        debug!("event loop running");

        loop {
            let timeout = self.core.next_timer_timeout();
            self.events.clear();
            match self.shared.poller.wait(&mut self.events, timeout) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("poller wait failed: {}", e);
                    break;
                }
            }
            for ev in self.events.iter() {
                self.core.handle_socket_event(ev);
            }
            self.drain_tasks();
            self.core.fire_due_timers();
            if self.status() == LoopStatus::Stopping {
                self.drain_tasks();
                break;
            }
        }

        if let Ok(mut guard) = self.shared.thread.lock() {
            *guard = None;
        }
        self.shared
            .status
            .store(LoopStatus::Stopped as u8, Ordering::Release);
        debug!("event loop stopped");
    }

    /// Collect-then-execute: tasks queued while this batch executes land in
    /// a later drain (their queued wakeup is still pending).
    fn drain_tasks(&mut self) {
        self.shared.notified.store(false, Ordering::Release);
        let mut batch = Vec::new();
        while let Ok(task) = self.rx.try_recv() {
            batch.push(task);
        }
        for task in batch {
            task(&mut self.core);
        }
    }
}
