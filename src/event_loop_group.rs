use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, TaskSender};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// Fixed pool of event loops, one OS thread each. Membership never changes
/// after [`EventLoopGroup::run`]; connections are assigned round-robin and
/// stay on their loop for life.
pub struct EventLoopGroup {
    name: String,
    size: usize,
    next_channel_id: Arc<AtomicU64>,
    senders: Vec<TaskSender>,
    threads: Vec<JoinHandle<()>>,
    cursor: Arc<AtomicUsize>,
}

impl EventLoopGroup {
    /// `size == 0` means one loop per available core.
    pub fn new(size: usize, name: &str) -> Self {
        let size = if size == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            size
        };
        Self {
            name: name.to_owned(),
            size,
            next_channel_id: Arc::new(AtomicU64::new(0)),
            senders: Vec::new(),
            threads: Vec::new(),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Spawns the loop threads and blocks until every loop reports running.
    /// Loops share one channel id counter so ids are unique pool-wide.
    pub fn run(&mut self) -> Result<()> {
        debug_assert!(self.threads.is_empty());
        let (tx, rx) = mpsc::channel();
        for i in 0..self.size {
            let tx = tx.clone();
            let ids = self.next_channel_id.clone();
            let jh = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || match EventLoop::with_channel_ids(ids) {
                    Ok(mut lp) => {
                        let _ = tx.send(Ok(lp.sender()));
                        lp.run();
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                })
                .map_err(Error::Io)?;
            self.threads.push(jh);
        }
        drop(tx);
        for _ in 0..self.size {
            let sender = rx
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| Error::LoopStopped)??;
            self.senders.push(sender);
        }
        // startup is confirmed by polling the status flags, not a condvar.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.senders.iter().all(|s| s.is_running()) {
            if Instant::now() >= deadline {
                return Err(Error::LoopStopped);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        debug!(name = %self.name, size = self.size, "event loop group running");
        Ok(())
    }

    /// Round-robin loop assignment through a single shared cursor.
    pub fn next(&self) -> &TaskSender {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        &self.senders[i]
    }

    pub fn senders(&self) -> &[TaskSender] {
        &self.senders
    }

    /// Detached round-robin view sharing this group's cursor; usable from
    /// other threads (e.g. the accept path) while the group is borrowed.
    pub fn picker(&self) -> LoopPicker {
        LoopPicker {
            senders: self.senders.clone(),
            cursor: self.cursor.clone(),
        }
    }

    pub fn stop(&self) {
        for s in &self.senders {
            s.stop();
        }
    }

    pub fn wait(&mut self) {
        for jh in self.threads.drain(..) {
            let _ = jh.join();
        }
    }
}

#[derive(Clone)]
pub struct LoopPicker {
    senders: Vec<TaskSender>,
    cursor: Arc<AtomicUsize>,
}

impl LoopPicker {
    pub fn next(&self) -> &TaskSender {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        &self.senders[i]
    }
}
