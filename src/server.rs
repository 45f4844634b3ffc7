use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, ListenerHandler, TaskSender};
use crate::event_loop_group::{EventLoopGroup, LoopPicker};
use crate::packet::DEFAULT_MAX_BODY;
use crate::rpc::{RpcChannel, Service, ServiceRegistry};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ServerOptions {
    /// Listen address, e.g. "127.0.0.1:9300". Port 0 picks a free port;
    /// see [`ServerHandle::local_addr`].
    pub address: String,
    /// Worker loop count; 0 means one per available core.
    pub threads: usize,
    /// Largest accepted frame body. Longer declared lengths close the
    /// connection.
    pub max_body: u32,
    /// When set, channels idle longer than this are closed by a periodic
    /// per-worker reaper. Off by default.
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:0".to_owned(),
            threads: 0,
            max_body: DEFAULT_MAX_BODY,
            idle_timeout: None,
        }
    }
}

/// Runs on the listener loop; hands each accepted socket to a worker loop
/// picked round-robin, where the channel and its dispatcher are built.
struct RpcAcceptor {
    picker: LoopPicker,
    services: Arc<ServiceRegistry>,
    max_body: u32,
    stopping: Arc<AtomicBool>,
}

impl ListenerHandler for RpcAcceptor {
    fn on_new_connection(&mut self, sock: TcpStream, peer: SocketAddr) {
        if self.stopping.load(Ordering::Acquire) {
            debug!(%peer, "server stopping, discarding accepted socket");
            return;
        }
        if let Err(e) = sock.set_nonblocking(true) {
            warn!(%peer, "set_nonblocking failed: {}", e);
            return;
        }
        if let Err(e) = sock.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed: {}", e);
        }
        let services = self.services.clone();
        let max_body = self.max_body;
        let handoff = self.picker.next().run_in_loop(move |core| {
            match core.add_channel(sock, peer, Box::new(RpcChannel::new(services, max_body))) {
                Ok((id, _key)) => debug!(id, %peer, "channel built"),
                Err(e) => warn!(%peer, "channel build failed: {}", e),
            }
        });
        if let Err(e) = handoff {
            warn!(%peer, "worker handoff failed: {}", e);
        }
    }
}

/// RPC server: a dedicated accept loop feeding a worker loop group.
///
/// Register services before [`Server::start`]; the registry is immutable
/// and lock-free once the workers run.
pub struct Server {
    options: ServerOptions,
    registry: Option<ServiceRegistry>,
    group: EventLoopGroup,
    listener_loop: EventLoop,
    stopping: Arc<AtomicBool>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Result<Self> {
        Ok(Self {
            group: EventLoopGroup::new(options.threads, "rpc-worker"),
            listener_loop: EventLoop::new()?,
            registry: Some(ServiceRegistry::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            local_addr: Arc::new(Mutex::new(None)),
            options,
        })
    }

    /// Registers a service. Returns false on duplicate names or after start.
    pub fn add_service(&mut self, service: Box<dyn Service>) -> bool {
        match self.registry.as_mut() {
            Some(reg) => reg.register(service),
            None => {
                warn!("add_service after start ignored");
                false
            }
        }
    }

    /// Control handle usable from other threads. Obtain before `start`.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            listener: self.listener_loop.sender(),
            stopping: self.stopping.clone(),
            local_addr: self.local_addr.clone(),
        }
    }

    /// Starts the workers, binds the listener and runs the accept loop on
    /// the calling thread. Returns after [`ServerHandle::stop`] or on a
    /// setup failure; the workers are joined either way.
    pub fn start(&mut self) -> Result<()> {
        let registry = Arc::new(self.registry.take().ok_or(Error::AlreadyStarted)?);
        if registry.is_empty() {
            warn!("starting with no registered services");
        }
        self.group.run()?;
        let result = self.serve(registry);
        self.group.stop();
        self.group.wait();
        if result.is_ok() {
            info!("server stopped");
        }
        result
    }

    fn serve(&mut self, registry: Arc<ServiceRegistry>) -> Result<()> {
        let listener = TcpListener::bind(&self.options.address)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::InvalidInput => {
                    Error::InvalidAddress(self.options.address.clone())
                }
                _ => Error::Io(e),
            })?;
        let local = listener.local_addr()?;
        if let Ok(mut guard) = self.local_addr.lock() {
            *guard = Some(local);
        }
        info!(%local, workers = self.group.size(), "server listening");

        let acceptor = RpcAcceptor {
            picker: self.group.picker(),
            services: registry,
            max_body: self.options.max_body,
            stopping: self.stopping.clone(),
        };
        let listener_key = self
            .listener_loop
            .core_mut()
            .add_listener(listener, Box::new(acceptor))?;

        if let Some(timeout) = self.options.idle_timeout {
            let period = (timeout / 2).max(Duration::from_millis(1));
            for s in self.group.senders() {
                s.run_every(period, move |core| core.close_idle_channels(timeout))?;
            }
        }

        self.listener_loop.run();
        self.listener_loop.core_mut().close_listener(listener_key);
        Ok(())
    }
}

/// Cloneable server control handle.
#[derive(Clone)]
pub struct ServerHandle {
    listener: TaskSender,
    stopping: Arc<AtomicBool>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl ServerHandle {
    /// The bound listen address, available once the server has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|g| *g)
    }

    /// Asks the server to shut down: new connections are refused, the
    /// accept loop exits and `Server::start` joins the workers.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.listener.stop();
    }
}
