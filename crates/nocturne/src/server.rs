// src/server.rs
use crate::config::ServerConfig;
use crate::error::{NocturneError, NocturneResult};
use crate::metrics::WorkerMetrics;
use crate::request::Root;
use crate::signals::{self, SignalGuard};
use crate::syscalls;
use crate::task::{AsyncTask, TaskHandle, TaskQueue};
use crate::worker::{Shared, Worker};
use libc::c_int;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const CANCEL_MESSAGE: &[u8] = b"END!";
const DEFAULT_PORT: u16 = 80;

/// Where the queue listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    Inet(SocketAddrV4),
}

impl ListenAddr {
    /// Parse `unix:<path>`, `/abs/path`, `<host>:<port>` or `<host>`.
    ///
    /// A bare host listens on port 80; an empty host or `localhost` means
    /// the loopback address.
    pub fn parse(addr: &str) -> NocturneResult<Self> {
        let addr = addr.trim();
        if let Some(path) = addr.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(NocturneError::InvalidAddress(addr.to_string()));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if addr.starts_with('/') {
            return Ok(ListenAddr::Unix(PathBuf::from(addr)));
        }

        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| NocturneError::InvalidAddress(addr.to_string()))?;
                (host, port)
            }
            None => (addr, DEFAULT_PORT),
        };
        let ip = match host {
            "" | "localhost" => Ipv4Addr::LOCALHOST,
            host => host
                .parse::<Ipv4Addr>()
                .map_err(|_| NocturneError::InvalidAddress(addr.to_string()))?,
        };
        Ok(ListenAddr::Inet(SocketAddrV4::new(ip, port)))
    }

    fn open(&self) -> NocturneResult<c_int> {
        let result = match self {
            ListenAddr::Unix(path) => syscalls::create_unix_listener(path),
            ListenAddr::Inet(addr) => syscalls::create_inet_listener(*addr),
        };
        result.map_err(|source| NocturneError::Socket {
            addr: self.to_string(),
            source,
        })
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenAddr::Inet(addr) => write!(f, "{}", addr),
        }
    }
}

struct Running {
    shared: Arc<Shared>,
    listen_addr: ListenAddr,
    local_addr: Option<SocketAddrV4>,
    cancel_write_fd: c_int,
    handles: Vec<JoinHandle<()>>,
    _signals: SignalGuard,
}

/// Owns the listening socket and the worker threads serving it.
///
/// Tasks can be pushed before [`run`](Self::run); they are picked up once
/// workers start. Dropping the queue cancels it.
pub struct ConnectionQueue {
    root: Arc<dyn Root>,
    config: ServerConfig,
    tasks: TaskHandle,
    metrics: Arc<WorkerMetrics>,
    running: Option<Running>,
}

impl ConnectionQueue {
    pub fn new(root: Arc<dyn Root>, config: ServerConfig) -> NocturneResult<Self> {
        config.validate()?;
        Ok(Self {
            root,
            config,
            tasks: TaskQueue::new()?,
            metrics: Arc::new(WorkerMetrics::new()),
            running: None,
        })
    }

    /// Open the listening socket and start the workers.
    pub fn run(&mut self) -> NocturneResult<()> {
        if self.running.is_some() {
            return Err(NocturneError::Worker("queue is already running".into()));
        }

        let listen_addr = ListenAddr::parse(&self.config.listen)?;
        let listen_fd = listen_addr.open()?;
        let local_addr = match syscalls::local_inet_addr(listen_fd) {
            Ok(addr) => addr,
            Err(e) => {
                syscalls::close(listen_fd);
                return Err(e.into());
            }
        };
        let (cancel_read_fd, cancel_write_fd) = match syscalls::create_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                syscalls::close(listen_fd);
                return Err(e.into());
            }
        };
        let signal_guard = match SignalGuard::retain() {
            Ok(guard) => guard,
            Err(e) => {
                for fd in [listen_fd, cancel_read_fd, cancel_write_fd] {
                    syscalls::close(fd);
                }
                return Err(e.into());
            }
        };

        let server_name: Arc<str> = match self.root.server_name() {
            Some(name) => Arc::from(name),
            None => Arc::from(self.config.server_name.as_str()),
        };
        let shared = Arc::new(Shared {
            listen_fd,
            cancel_fd: cancel_read_fd,
            root: self.root.clone(),
            limits: self.config.protocol_limits(),
            server_name,
            max_events: self.config.max_events,
            tasks: self.tasks.clone(),
            metrics: self.metrics.clone(),
            epoch: AtomicU64::new(0),
        });

        let mut running = Running {
            shared,
            listen_addr,
            local_addr,
            cancel_write_fd,
            handles: Vec::with_capacity(self.config.workers),
            _signals: signal_guard,
        };

        let core_ids = if self.config.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        for i in 0..self.config.workers {
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);
            let shared = running.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("nocturne-worker-{}", i))
                .spawn(move || {
                    if let Err(e) = signals::block_worker_signals() {
                        warn!(worker = i, "failed to block signals: {}", e);
                    }
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, core = id.id, "worker pinned");
                        } else {
                            warn!(worker = i, core = id.id, "failed to pin worker");
                        }
                    }
                    let mut worker = Worker::new(i, shared);
                    if let Err(e) = worker.run() {
                        error!(worker = i, "worker failed: {}", e);
                    }
                });
            match spawned {
                Ok(handle) => running.handles.push(handle),
                Err(e) => {
                    shutdown(running);
                    return Err(NocturneError::Worker(format!("failed to spawn worker {}: {}", i, e)));
                }
            }
        }

        info!(
            listen = %running.listen_addr,
            workers = self.config.workers,
            "connection queue started"
        );
        self.running = Some(running);
        Ok(())
    }

    /// Stop every worker and close the listening socket. Safe to call more
    /// than once.
    pub fn cancel(&mut self) {
        if let Some(running) = self.running.take() {
            shutdown(running);
            info!("connection queue stopped");
        }
    }

    /// Route connections accepted from now on to a new generation.
    pub fn reload(&self) {
        if let Some(running) = &self.running {
            let epoch = running.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            info!(epoch, "connection queue reloaded");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn push_task(&self, task: AsyncTask) {
        self.tasks.push_task(task);
    }

    pub fn pop_task(&self) -> Option<AsyncTask> {
        self.tasks.pop_task()
    }

    pub fn release_task(&self, task: AsyncTask) {
        self.tasks.release_task(task);
    }

    pub fn has_tasks(&self) -> bool {
        self.tasks.has_tasks()
    }

    pub fn task_handle(&self) -> TaskHandle {
        self.tasks.clone()
    }

    pub fn workers_count(&self) -> usize {
        self.config.workers
    }

    /// Bound IPv4 address while running; `None` for UNIX sockets.
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.running.as_ref().and_then(|r| r.local_addr)
    }

    pub fn listen_addr(&self) -> Option<&ListenAddr> {
        self.running.as_ref().map(|r| &r.listen_addr)
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }
}

impl Drop for ConnectionQueue {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn shutdown(mut running: Running) {
    match syscalls::write_nonblocking(running.cancel_write_fd, CANCEL_MESSAGE) {
        Ok(_) => {}
        Err(e) => error!("failed to signal workers: {}", e),
    }
    for handle in running.handles.drain(..) {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }

    syscalls::close(running.shared.listen_fd);
    syscalls::close(running.shared.cancel_fd);
    syscalls::close(running.cancel_write_fd);
    if let ListenAddr::Unix(path) = &running.listen_addr {
        if let Err(e) = std::fs::remove_file(path) {
            debug!(path = %path.display(), "could not remove socket file: {}", e);
        }
    }
}
