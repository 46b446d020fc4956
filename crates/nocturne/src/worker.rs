// src/worker.rs
use crate::config::Limits;
use crate::completion::Mailbox;
use crate::conn::{Client, WorkerContext};
use crate::error::NocturneResult;
use crate::metrics::WorkerMetrics;
use crate::pool::Pool;
use crate::request::Root;
use crate::slab::Slab;
use crate::syscalls::{
    self, EPOLLERR, EPOLLET, EPOLLEXCLUSIVE, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll,
    epoll_event,
};
use crate::task::{TaskHandle, Wake};
use libc::c_int;
use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: u64 = u64::MAX;
const CANCEL_TOKEN: u64 = u64::MAX - 1;
const WAKE_TOKEN: u64 = u64::MAX - 2;
const RESUME_TOKEN: u64 = u64::MAX - 3;

const SLOT_BITS: u32 = 24;
const SERIAL_BITS: u32 = 24;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;
const SERIAL_MASK: u64 = (1 << SERIAL_BITS) - 1;
/// Generation ids stop short of the all-ones pattern used by system tokens.
const MAX_GENERATION_ID: u16 = u16::MAX - 1;

const CLIENT_EVENTS: u32 = EPOLLIN | EPOLLOUT | EPOLLET | EPOLLRDHUP;

/// Epoll user data for a client: generation, slab slot and a serial that
/// tells a reused slot apart from its previous occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClientToken {
    pub generation: u16,
    pub slot: u32,
    pub serial: u32,
}

impl ClientToken {
    pub fn encode(self) -> u64 {
        (u64::from(self.generation) << (SLOT_BITS + SERIAL_BITS))
            | ((u64::from(self.slot) & SLOT_MASK) << SERIAL_BITS)
            | (u64::from(self.serial) & SERIAL_MASK)
    }

    pub fn decode(token: u64) -> Self {
        Self {
            generation: (token >> (SLOT_BITS + SERIAL_BITS)) as u16,
            slot: ((token >> SERIAL_BITS) & SLOT_MASK) as u32,
            serial: (token & SERIAL_MASK) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventSource {
    Listener,
    Cancel,
    Wake,
    Resume,
    Client(ClientToken),
}

impl EventSource {
    fn from_token(token: u64) -> Self {
        match token {
            LISTENER_TOKEN => EventSource::Listener,
            CANCEL_TOKEN => EventSource::Cancel,
            WAKE_TOKEN => EventSource::Wake,
            RESUME_TOKEN => EventSource::Resume,
            other => EventSource::Client(ClientToken::decode(other)),
        }
    }
}

/// State every worker of one queue reads.
pub(crate) struct Shared {
    pub listen_fd: c_int,
    /// Read end of the cancel pipe.
    pub cancel_fd: c_int,
    pub root: Arc<dyn Root>,
    pub limits: Limits,
    pub server_name: Arc<str>,
    pub max_events: usize,
    pub tasks: TaskHandle,
    pub metrics: Arc<WorkerMetrics>,
    /// Bumped on reload; new connections then go to a fresh generation.
    pub epoch: AtomicU64,
}

struct Slot {
    serial: u32,
    client: Client,
}

/// Clients accepted under one configuration epoch.
struct Generation {
    id: u16,
    epoch: u64,
    pool: Pool,
    clients: Slab<Slot>,
    prev: Option<Box<Generation>>,
}

impl Generation {
    fn new(id: u16, epoch: u64, pool: Pool, prev: Option<Box<Generation>>) -> Self {
        Self {
            id,
            epoch,
            pool,
            clients: Slab::with_capacity(64),
            prev,
        }
    }
}

pub(crate) struct Worker {
    id: usize,
    shared: Arc<Shared>,
    pool: Pool,
    generation: Option<Box<Generation>>,
    next_generation_id: u16,
    next_serial: u32,
}

impl Worker {
    /// Must be called on the thread that will run the worker.
    pub fn new(id: usize, shared: Arc<Shared>) -> Self {
        let pool = Pool::new(shared.limits.buffer_size);
        Self {
            id,
            shared,
            pool,
            generation: None,
            next_generation_id: 0,
            next_serial: 0,
        }
    }

    /// Poll until the cancel pipe fires or the listener fails.
    pub fn run(&mut self) -> NocturneResult<()> {
        let epoll = Epoll::new()?;
        epoll.add(self.shared.listen_fd, LISTENER_TOKEN, EPOLLIN | EPOLLEXCLUSIVE)?;
        epoll.add(self.shared.cancel_fd, CANCEL_TOKEN, EPOLLIN | EPOLLET)?;
        epoll.add(
            self.shared.tasks.event_fd(),
            WAKE_TOKEN,
            EPOLLIN | EPOLLET | EPOLLEXCLUSIVE,
        )?;
        let mailbox = Mailbox::new()?;
        epoll.add(mailbox.event_fd(), RESUME_TOKEN, EPOLLIN | EPOLLET)?;

        let ctx = WorkerContext {
            root: self.shared.root.clone(),
            limits: self.shared.limits,
            server_name: self.shared.server_name.clone(),
            tasks: self.shared.tasks.clone(),
            metrics: self.shared.metrics.clone(),
            thread_pool: self.pool.clone(),
            mailbox,
        };

        let mut events = vec![epoll_event { events: 0, u64: 0 }; self.shared.max_events.max(1)];
        let mut should_close = false;
        info!(worker = self.id, "worker entering event loop");

        while !should_close {
            let n = match epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = self.id, "epoll_wait failed: {}", e);
                    break;
                }
            };

            // tasks first, so work queued by the previous batch runs promptly
            for event in &events[..n] {
                let (token, flags) = (event.u64, event.events);
                if token == WAKE_TOKEN && flags & EPOLLIN != 0 {
                    self.run_wake(&ctx);
                }
            }

            for event in &events[..n] {
                let (token, flags) = (event.u64, event.events);
                match EventSource::from_token(token) {
                    EventSource::Wake => {}
                    EventSource::Resume => self.run_resumptions(&epoll, &ctx),
                    EventSource::Listener => {
                        if flags & EPOLLERR != 0 {
                            error!(worker = self.id, "listening socket reported an error");
                            should_close = true;
                        } else if flags & EPOLLIN != 0 {
                            self.accept_all(&epoll);
                        }
                    }
                    EventSource::Cancel => {
                        if flags & (EPOLLIN | EPOLLERR | EPOLLHUP) != 0 {
                            debug!(worker = self.id, "cancel requested");
                            should_close = true;
                        }
                    }
                    EventSource::Client(client) => self.on_client_event(&epoll, &ctx, client, flags),
                }
            }
        }

        self.release_all(&epoll);
        info!(worker = self.id, "worker stopped");
        Ok(())
    }

    fn run_wake(&self, ctx: &WorkerContext) {
        match ctx.tasks.take_wake() {
            Ok(Some(Wake { task: Some(task), .. })) => {
                let successful = ctx.tasks.run_task(task);
                ctx.metrics.task_done(successful);
            }
            Ok(_) => {}
            Err(e) => warn!(worker = self.id, "failed to read task eventfd: {}", e),
        }
    }

    /// Hand posted completions to their parked clients.
    fn run_resumptions(&mut self, epoll: &Epoll, ctx: &WorkerContext) {
        for resumption in ctx.mailbox.drain() {
            let token = ClientToken::decode(resumption.token);
            let Some(client) = self.client_mut(token) else {
                trace!(worker = self.id, "completion for a released client");
                continue;
            };
            client.resume(ctx, resumption.finish);
            if !client.is_valid() {
                client.shutdown_all();
            }
            if client.is_finished() {
                self.release_client(epoll, token);
            }
        }
    }

    fn accept_all(&mut self, epoll: &Epoll) {
        loop {
            match syscalls::accept_connection(self.shared.listen_fd) {
                Ok(Some((fd, peer))) => self.push_client(epoll, fd, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!(worker = self.id, "accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Register a connected socket with the current generation.
    fn push_client(&mut self, epoll: &Epoll, fd: c_int, peer: Option<SocketAddrV4>) {
        let serial = self.next_serial;
        self.next_serial = ((u64::from(serial) + 1) & SERIAL_MASK) as u32;
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        let generation = self.current_generation(epoch);

        let client = Client::new(fd, peer, generation.pool.child());
        let slot = generation.clients.insert(Slot { serial, client });
        if slot as u64 > SLOT_MASK {
            warn!("too many clients in one generation, dropping connection");
            generation.clients.remove(slot);
            return;
        }

        let token = ClientToken {
            generation: generation.id,
            slot: slot as u32,
            serial,
        };
        if let Some(entry) = generation.clients.get_mut(slot) {
            entry.client.set_token(token.encode());
        }
        if let Err(e) = epoll.add(fd, token.encode(), CLIENT_EVENTS) {
            warn!(fd, "failed to register client: {}", e);
            generation.clients.remove(slot);
            return;
        }

        self.shared.metrics.inc_conn();
        trace!(fd, ?peer, generation = token.generation, slot, "client accepted");
    }

    /// Generation new clients join; a fresh one is started lazily when the
    /// epoch moved on since the current one was created.
    fn current_generation(&mut self, epoch: u64) -> &mut Generation {
        let current = match self.generation.take() {
            Some(generation) if generation.epoch == epoch => generation,
            prev => {
                let id = self.allocate_generation_id(prev.as_deref());
                debug!(worker = self.id, generation = id, epoch, "starting generation");
                Box::new(Generation::new(id, epoch, self.pool.child(), prev))
            }
        };
        self.generation.insert(current)
    }

    /// Next generation id not used by `chain`. Ids wrap after
    /// `MAX_GENERATION_ID`, skipping generations that still hold clients.
    fn allocate_generation_id(&mut self, chain: Option<&Generation>) -> u16 {
        let in_use = |id: u16| {
            let mut cursor = chain;
            while let Some(generation) = cursor {
                if generation.id == id {
                    return true;
                }
                cursor = generation.prev.as_deref();
            }
            false
        };
        let mut id = self.next_generation_id;
        for _ in 0..MAX_GENERATION_ID {
            if !in_use(id) {
                break;
            }
            id = following_generation_id(id);
        }
        self.next_generation_id = following_generation_id(id);
        id
    }

    fn find_generation(&mut self, id: u16) -> Option<&mut Generation> {
        let mut cursor = self.generation.as_deref_mut();
        while let Some(generation) = cursor {
            if generation.id == id {
                return Some(generation);
            }
            cursor = generation.prev.as_deref_mut();
        }
        None
    }

    fn client_mut(&mut self, token: ClientToken) -> Option<&mut Client> {
        let slot = self
            .find_generation(token.generation)?
            .clients
            .get_mut(token.slot as usize)?;
        if slot.serial != token.serial {
            trace!(slot = token.slot, "event for a previous occupant of the slot");
            return None;
        }
        Some(&mut slot.client)
    }

    fn on_client_event(&mut self, epoll: &Epoll, ctx: &WorkerContext, token: ClientToken, flags: u32) {
        let Some(client) = self.client_mut(token) else {
            return;
        };

        let release = if flags & EPOLLERR != 0 {
            debug!(fd = client.fd(), "socket error");
            true
        } else {
            if flags & EPOLLIN != 0 {
                client.perform_read(ctx);
            }
            if flags & EPOLLOUT != 0 {
                client.perform_write(&ctx.metrics);
            }
            if flags & EPOLLHUP != 0 {
                true
            } else {
                if flags & EPOLLRDHUP != 0 {
                    client.on_peer_closed();
                }
                if !client.is_valid() {
                    client.shutdown_all();
                }
                client.is_finished()
            }
        };

        if release {
            self.release_client(epoll, token);
        }
    }

    fn release_client(&mut self, epoll: &Epoll, token: ClientToken) {
        let Some(generation) = self.find_generation(token.generation) else {
            return;
        };
        let Some(slot) = generation.clients.remove(token.slot as usize) else {
            return;
        };
        if let Err(e) = epoll.delete(slot.client.fd()) {
            debug!(fd = slot.client.fd(), "epoll delete failed: {}", e);
        }
        trace!(
            fd = slot.client.fd(),
            bytes_sent = slot.client.bytes_sent(),
            "client released"
        );
        drop(slot);
        self.shared.metrics.dec_conn();

        let is_current = self.generation.as_ref().is_some_and(|g| g.id == token.generation);
        if !is_current {
            self.prune_generations();
        }
    }

    /// Unlink previous generations that have no clients left.
    fn prune_generations(&mut self) {
        let Some(current) = self.generation.as_mut() else {
            return;
        };
        let mut kept = Vec::new();
        let mut next = current.prev.take();
        while let Some(mut generation) = next {
            next = generation.prev.take();
            if generation.clients.is_empty() {
                debug!(worker = self.id, generation = generation.id, "generation released");
            } else {
                kept.push(generation);
            }
        }

        let mut chain = None;
        for mut generation in kept.into_iter().rev() {
            generation.prev = chain;
            chain = Some(generation);
        }
        current.prev = chain;
    }

    fn release_all(&mut self, epoll: &Epoll) {
        let mut released = 0;
        let mut next = self.generation.take();
        while let Some(mut generation) = next {
            next = generation.prev.take();
            for slot in generation.clients.drain() {
                let _ = epoll.delete(slot.client.fd());
                released += 1;
                self.shared.metrics.dec_conn();
            }
        }
        if released > 0 {
            debug!(worker = self.id, released, "released remaining clients");
        }
    }

    #[cfg(test)]
    fn generation_ids(&self) -> Vec<u16> {
        let mut ids = Vec::new();
        let mut cursor = self.generation.as_deref();
        while let Some(generation) = cursor {
            ids.push(generation.id);
            cursor = generation.prev.as_deref();
        }
        ids
    }
}

fn following_generation_id(id: u16) -> u16 {
    if id >= MAX_GENERATION_ID { 0 } else { id + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;
    use crate::request::Request;
    use crate::status::Status;
    use crate::task::TaskQueue;
    use std::sync::Mutex;

    fn shared() -> Arc<Shared> {
        shared_with(Arc::new(|_: &mut Request| Status::Done))
    }

    fn shared_with(root: Arc<dyn Root>) -> Arc<Shared> {
        Arc::new(Shared {
            listen_fd: -1,
            cancel_fd: -1,
            root,
            limits: Limits::default(),
            server_name: Arc::from("nocturne"),
            max_events: 16,
            tasks: TaskQueue::new().unwrap(),
            metrics: Arc::new(WorkerMetrics::new()),
            epoch: AtomicU64::new(0),
        })
    }

    fn context(worker: &Worker) -> WorkerContext {
        WorkerContext {
            root: worker.shared.root.clone(),
            limits: worker.shared.limits,
            server_name: worker.shared.server_name.clone(),
            tasks: worker.shared.tasks.clone(),
            metrics: worker.shared.metrics.clone(),
            thread_pool: worker.pool.clone(),
            mailbox: Mailbox::new().unwrap(),
        }
    }

    #[test]
    fn test_token_layout() {
        let token = ClientToken {
            generation: 3,
            slot: 17,
            serial: 0xABCDEF,
        };
        assert_eq!(ClientToken::decode(token.encode()), token);
        assert_eq!(token.encode() >> 48, 3);

        assert_eq!(EventSource::from_token(LISTENER_TOKEN), EventSource::Listener);
        assert_eq!(EventSource::from_token(CANCEL_TOKEN), EventSource::Cancel);
        assert_eq!(EventSource::from_token(WAKE_TOKEN), EventSource::Wake);
        assert_eq!(EventSource::from_token(RESUME_TOKEN), EventSource::Resume);
        let highest = ClientToken {
            generation: MAX_GENERATION_ID,
            slot: SLOT_MASK as u32,
            serial: SERIAL_MASK as u32 - 3,
        };
        assert_eq!(EventSource::from_token(highest.encode()), EventSource::Client(highest));
    }

    #[test]
    fn test_generations_rotate_and_prune() {
        let shared = shared();
        let mut worker = Worker::new(0, shared.clone());
        let epoll = Epoll::new().unwrap();

        let (a, peer_a) = syscalls::socket_pair().unwrap();
        worker.push_client(&epoll, a, None);
        assert_eq!(worker.generation_ids(), vec![0]);

        shared.epoch.fetch_add(1, Ordering::AcqRel);
        let (b, peer_b) = syscalls::socket_pair().unwrap();
        worker.push_client(&epoll, b, None);
        assert_eq!(worker.generation_ids(), vec![1, 0]);
        assert_eq!(shared.metrics.snapshot().active_connections, 2);

        let old = ClientToken {
            generation: 0,
            slot: 0,
            serial: 0,
        };
        worker.release_client(&epoll, old);
        assert_eq!(shared.metrics.snapshot().active_connections, 1);
        // the emptied previous generation is unlinked
        assert_eq!(worker.generation_ids(), vec![1]);

        worker.release_client(&epoll, old);
        assert_eq!(shared.metrics.snapshot().active_connections, 1);

        worker.release_all(&epoll);
        assert_eq!(shared.metrics.snapshot().active_connections, 0);
        assert!(worker.generation_ids().is_empty());

        syscalls::close(peer_a);
        syscalls::close(peer_b);
    }

    #[test]
    fn test_stale_serial_event_is_ignored() {
        let shared = shared();
        let mut worker = Worker::new(0, shared.clone());
        let epoll = Epoll::new().unwrap();
        let ctx = context(&worker);

        let (fd, peer) = syscalls::socket_pair().unwrap();
        worker.push_client(&epoll, fd, None);
        let stale = ClientToken {
            generation: 0,
            slot: 0,
            serial: 5,
        };
        worker.on_client_event(&epoll, &ctx, stale, EPOLLHUP);
        assert_eq!(shared.metrics.snapshot().active_connections, 1);

        let live = ClientToken { serial: 0, ..stale };
        worker.on_client_event(&epoll, &ctx, live, EPOLLHUP);
        assert_eq!(shared.metrics.snapshot().active_connections, 0);
        syscalls::close(peer);
    }

    #[test]
    fn test_generation_ids_skip_live_generations() {
        let shared = shared();
        let mut worker = Worker::new(0, shared.clone());
        let epoll = Epoll::new().unwrap();
        let mut peers = Vec::new();
        let mut push = |worker: &mut Worker| {
            let (fd, peer) = syscalls::socket_pair().unwrap();
            worker.push_client(&epoll, fd, None);
            peers.push(peer);
        };

        push(&mut worker);
        assert_eq!(worker.generation_ids(), vec![0]);

        worker.next_generation_id = MAX_GENERATION_ID;
        shared.epoch.fetch_add(1, Ordering::AcqRel);
        push(&mut worker);
        assert_eq!(worker.generation_ids(), vec![MAX_GENERATION_ID, 0]);

        // the wrapped counter lands on 0, which still holds a client
        shared.epoch.fetch_add(1, Ordering::AcqRel);
        push(&mut worker);
        assert_eq!(worker.generation_ids(), vec![1, MAX_GENERATION_ID, 0]);

        worker.release_all(&epoll);
        for peer in peers {
            syscalls::close(peer);
        }
    }

    #[test]
    fn test_completion_reaches_parked_client() {
        let parked: Arc<Mutex<Option<Completion>>> = Arc::default();
        let keep = parked.clone();
        let shared = shared_with(Arc::new(move |req: &mut Request| {
            *keep.lock().unwrap() = req.completion();
            Status::Suspended
        }));
        let mut worker = Worker::new(0, shared.clone());
        let epoll = Epoll::new().unwrap();
        let ctx = context(&worker);

        let (fd, peer) = syscalls::socket_pair().unwrap();
        worker.push_client(&epoll, fd, None);
        let token = ClientToken {
            generation: 0,
            slot: 0,
            serial: 0,
        };
        let request = b"GET /slow HTTP/1.1\r\n\r\n";
        assert_eq!(syscalls::send_nonblocking(peer, request).unwrap(), request.len());
        worker.on_client_event(&epoll, &ctx, token, EPOLLIN);

        let completion = parked.lock().unwrap().take().unwrap();
        std::thread::spawn(move || completion.finish(Status::Http(204)))
            .join()
            .unwrap();
        worker.run_resumptions(&epoll, &ctx);

        let mut buf = [0u8; 1024];
        let n = syscalls::read_nonblocking(peer, &mut buf).unwrap();
        assert!(buf[..n].starts_with(b"HTTP/1.1 204"));
        assert_eq!(shared.metrics.snapshot().active_connections, 1);

        // a completion for a client that is already gone is dropped
        worker.release_client(&epoll, token);
        ctx.mailbox.drain();
        drop(Completion::new(ctx.mailbox.clone(), token.encode()));
        worker.run_resumptions(&epoll, &ctx);
        assert_eq!(shared.metrics.snapshot().active_connections, 0);
        syscalls::close(peer);
    }
}
