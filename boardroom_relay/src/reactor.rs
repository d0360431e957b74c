// Readiness-driven I/O loop shared by every session kind.
//
// A `Reactor` owns one `mio::Poll`, an optional listener, and every
// `Connection` registered with it. It runs on its own thread; a second
// thread (see `executor.rs`) runs the `Handler` on fully assembled
// envelopes, so slow command handling never stalls socket I/O.
//
// Each loop iteration:
// 1. Pre-work: register connections handed over from other threads, apply
//    control requests (flush, close, transfer, shutdown), resolve
//    and fan out queued broadcasts, replay readiness deferred by the
//    single-reader guard.
// 2. `poll()`, the only point where the I/O thread blocks.
// 3. Service events: reads run until the socket would block, pushing each
//    completed envelope to the executor; writes run until the outbound queue
//    is empty or the socket would block, toggling WRITABLE interest as
//    needed.
//
// Other threads never touch the poller or a socket. They push onto the
// reactor's channels and wake it through the `mio::Waker`.
//
// Single-reader guard: when enabled (lobbies), a connection that stops
// mid-frame holds the guard, and readable events for other connections are
// queued until it completes, fails or goes away. Polling is edge-triggered,
// so the queued readiness is replayed explicitly rather than waited for.
//
// Read pause: when enabled (the primary server), a connection's reads stop
// after each envelope until the connection is transferred or closed. The
// framing reader never consumes past a frame boundary, so a transferred
// socket carries no hidden buffered bytes.
//
// Failure policy: framing, decode and socket errors tear down one
// connection. Only a `poll()` failure stops the reactor, after which every
// connection is closed and `Handler::on_fatal` runs.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, Shutdown};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use boardroom_protocol::{
    ConnectionId, DisconnectReason, Envelope, FrameError, MAX_MESSAGE_SIZE, ReadProgress,
    RecipientFilter, User, WriteProgress,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::DashSet;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{Connection, ConnectionHandle};
use crate::executor::{self, HandlerError, Inbound};

const WAKER: Token = Token(usize::MAX);
const LISTENER: Token = Token(usize::MAX - 1);
const EVENT_CAPACITY: usize = 256;

fn token(id: ConnectionId) -> Token {
    Token(id.0 as usize)
}

/// Session-specific behavior plugged into a reactor.
///
/// `on_accept` and `on_fatal` run on the I/O thread and must not block.
/// `on_envelope` and `on_disconnect` run on the executor thread, in the order
/// the I/O thread produced them.
pub trait Handler: Send + Sync + 'static {
    /// A connection was accepted or registered. Returning an error closes it
    /// after anything the handler queued has been flushed.
    fn on_accept(
        &self,
        _reactor: &ReactorHandle,
        _connection: &ConnectionHandle,
    ) -> Result<(), DisconnectReason> {
        Ok(())
    }

    fn on_envelope(
        &self,
        reactor: &ReactorHandle,
        origin: &ConnectionHandle,
        envelope: Envelope,
    ) -> Result<(), HandlerError>;

    /// Called exactly once per connection that leaves the reactor other than
    /// by transfer, after every envelope read from it.
    fn on_disconnect(
        &self,
        _reactor: &ReactorHandle,
        _connection: &ConnectionHandle,
        _reason: &DisconnectReason,
    ) {
    }

    fn on_fatal(&self, _reactor: &ReactorHandle, _error: &ReactorError) {}
}

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Used for thread names and log fields.
    pub name: String,
    pub max_message_size: usize,
    pub single_reader: bool,
    pub pause_after_read: bool,
}

impl ReactorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_message_size: MAX_MESSAGE_SIZE as usize,
            single_reader: false,
            pause_after_read: false,
        }
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn single_reader(mut self) -> Self {
        self.single_reader = true;
        self
    }

    pub fn pause_after_read(mut self) -> Self {
        self.pause_after_read = true;
        self
    }
}

/// Requests from other threads, applied during pre-work.
pub(crate) enum Control {
    Flush(ConnectionId),
    Close(ConnectionId),
    Transfer {
        id: ConnectionId,
        to: ReactorHandle,
        user: Option<User>,
        abandoned: Abandoned,
    },
    Shutdown,
}

/// Runs its action when dropped, unless the transfer carrying it reached
/// the target reactor's registration queue.
pub(crate) struct Abandoned(Option<Box<dyn FnOnce() + Send>>);

impl Abandoned {
    pub(crate) fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(action)))
    }

    pub(crate) fn none() -> Self {
        Self(None)
    }

    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for Abandoned {
    fn drop(&mut self) {
        if let Some(action) = self.0.take() {
            action();
        }
    }
}

type Registration = (Connection, ConnectionHandle);

struct Broadcast {
    envelope: Envelope,
    filter: RecipientFilter,
}

/// Control-channel sender paired with the reactor's waker.
#[derive(Clone)]
pub(crate) struct Notifier {
    tx: Sender<Control>,
    waker: Option<Arc<Waker>>,
}

impl Notifier {
    /// Returns false if the reactor has stopped.
    pub(crate) fn notify(&self, control: Control) -> bool {
        if self.tx.send(control).is_err() {
            return false;
        }
        self.wake();
        true
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "failed to wake reactor");
            }
        }
    }

    /// A notifier with no reactor behind it, for unit tests.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, Receiver<Control>) {
        let (tx, rx) = unbounded();
        (Self { tx, waker: None }, rx)
    }
}

struct Shared {
    name: String,
    notifier: Notifier,
    registrations: Sender<Registration>,
    broadcasts: Sender<Broadcast>,
    running: AtomicBool,
    live: DashSet<ConnectionId>,
    local_addr: Option<SocketAddr>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable control surface of a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Listener address, for reactors started with one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of connections currently registered (or being registered).
    pub fn connection_count(&self) -> usize {
        self.shared.live.len()
    }

    /// Hand a connection to this reactor. Safe from any thread. The
    /// returned handle is live immediately; the reactor picks the socket up
    /// on its next iteration. Gives the connection back if the reactor has
    /// stopped.
    pub fn register(
        &self,
        connection: Connection,
        user: Option<User>,
    ) -> Result<ConnectionHandle, Connection> {
        if !self.is_running() {
            return Err(connection);
        }
        let id = self.allocate_id();
        let handle =
            ConnectionHandle::new(id, connection.peer(), user, self.shared.notifier.clone());
        if let Err(crossbeam_channel::SendError((connection, _))) =
            self.shared.registrations.send((connection, handle.clone()))
        {
            self.release_id(id);
            return Err(connection);
        }
        self.shared.notifier.wake();
        Ok(handle)
    }

    /// Queue a broadcast, resolved against the roster at delivery time.
    pub fn broadcast(&self, envelope: Envelope, filter: RecipientFilter) -> bool {
        if self
            .shared
            .broadcasts
            .send(Broadcast { envelope, filter })
            .is_err()
        {
            return false;
        }
        self.shared.notifier.wake();
        true
    }

    /// Ask the reactor to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shared.notifier.notify(Control::Shutdown);
    }

    /// Move a connection to another reactor once its pending I/O is done.
    /// Move a connection to another reactor. `abandoned` runs if it never
    /// gets there. Returns false if this reactor has stopped.
    pub(crate) fn transfer(
        &self,
        id: ConnectionId,
        to: &ReactorHandle,
        user: Option<User>,
        abandoned: Abandoned,
    ) -> bool {
        self.shared.notifier.notify(Control::Transfer {
            id,
            to: to.clone(),
            user,
            abandoned,
        })
    }

    /// Wait for the reactor's threads to finish. A call from one of those
    /// threads skips waiting on itself.
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.shared.threads.lock());
        let current = thread::current().id();
        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                error!(reactor = %self.name(), "reactor thread panicked");
            }
        }
    }

    fn allocate_id(&self) -> ConnectionId {
        self.allocate_id_with(rand::random::<u32>)
    }

    /// Draw ids until one is free. Ids double as poll tokens, so the two
    /// values that could alias the reserved tokens are skipped.
    pub(crate) fn allocate_id_with(&self, mut draw: impl FnMut() -> u32) -> ConnectionId {
        loop {
            let id = ConnectionId(draw());
            if id.0 >= u32::MAX - 1 {
                continue;
            }
            if self.shared.live.insert(id) {
                return id;
            }
        }
    }

    fn release_id(&self, id: ConnectionId) {
        self.shared.live.remove(&id);
    }
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .finish()
    }
}

struct Slot {
    connection: Connection,
    handle: ConnectionHandle,
}

pub struct Reactor {
    config: ReactorConfig,
    poll: Poll,
    listener: Option<TcpListener>,
    connections: HashMap<ConnectionId, Slot>,
    controls: Receiver<Control>,
    registrations: Receiver<Registration>,
    broadcasts: Receiver<Broadcast>,
    inbound: Sender<Inbound>,
    handler: Arc<dyn Handler>,
    handle: ReactorHandle,
    read_guard: Option<ConnectionId>,
    deferred_reads: VecDeque<ConnectionId>,
}

impl Reactor {
    /// Start the I/O and executor threads.
    pub fn spawn(
        config: ReactorConfig,
        listener: Option<std::net::TcpListener>,
        handler: Arc<dyn Handler>,
    ) -> io::Result<ReactorHandle> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let listener = match listener {
            Some(std_listener) => {
                std_listener.set_nonblocking(true)?;
                let mut listener = TcpListener::from_std(std_listener);
                poll.registry()
                    .register(&mut listener, LISTENER, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };
        let local_addr = listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?;

        let (control_tx, controls) = unbounded();
        let (registration_tx, registrations) = unbounded();
        let (broadcast_tx, broadcasts) = unbounded();
        let (inbound, inbound_rx) = unbounded();

        let handle = ReactorHandle {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                notifier: Notifier {
                    tx: control_tx,
                    waker: Some(waker),
                },
                registrations: registration_tx,
                broadcasts: broadcast_tx,
                running: AtomicBool::new(true),
                live: DashSet::new(),
                local_addr,
                threads: Mutex::new(Vec::new()),
            }),
        };

        let name = config.name.clone();
        let reactor = Reactor {
            config,
            poll,
            listener,
            connections: HashMap::new(),
            controls,
            registrations,
            broadcasts,
            inbound,
            handler: Arc::clone(&handler),
            handle: handle.clone(),
            read_guard: None,
            deferred_reads: VecDeque::new(),
        };

        let io_thread = thread::Builder::new()
            .name(format!("{name}-io"))
            .spawn(move || reactor.run())?;
        let exec_reactor = handle.clone();
        let exec_thread = thread::Builder::new()
            .name(format!("{name}-exec"))
            .spawn(move || executor::run(inbound_rx, handler, exec_reactor))
            .inspect_err(|_| handle.shutdown())?;
        handle.shared.threads.lock().extend([io_thread, exec_thread]);
        Ok(handle)
    }

    fn run(mut self) {
        info!(reactor = %self.config.name, addr = ?self.handle.local_addr(), "reactor started");
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        match self.run_loop(&mut events) {
            Ok(()) => self.close_all(DisconnectReason::ByServer),
            Err(e) => {
                error!(reactor = %self.config.name, error = %e, "reactor failed");
                self.close_all(DisconnectReason::Error(e.to_string()));
                self.handle.shared.running.store(false, Ordering::Release);
                self.handler.on_fatal(&self.handle, &e);
            }
        }
        self.handle.shared.running.store(false, Ordering::Release);
        info!(reactor = %self.config.name, "reactor stopped");
    }

    fn run_loop(&mut self, events: &mut Events) -> Result<(), ReactorError> {
        loop {
            if !self.pre_work() {
                return Ok(());
            }
            if let Err(e) = self.poll.poll(events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ReactorError::Poll(e));
            }
            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    LISTENER => self.accept_ready(),
                    Token(raw) => {
                        let id = ConnectionId(raw as u32);
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.service_read(id);
                        }
                        if event.is_writable() {
                            self.service_write(id);
                        }
                    }
                }
            }
        }
    }

    /// Returns false once shutdown was requested.
    fn pre_work(&mut self) -> bool {
        let mut running = true;
        while let Ok((connection, handle)) = self.registrations.try_recv() {
            self.admit(connection, handle);
        }
        while let Ok(control) = self.controls.try_recv() {
            match control {
                Control::Flush(id) => self.service_write(id),
                Control::Close(id) => self.teardown(id, DisconnectReason::ByServer),
                Control::Transfer {
                    id,
                    to,
                    user,
                    abandoned,
                } => self.transfer(id, &to, user, abandoned),
                Control::Shutdown => running = false,
            }
        }
        self.drain_broadcasts();
        self.replay_deferred_reads();
        running
    }

    fn accept_ready(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let id = self.handle.allocate_id();
                    let connection =
                        Connection::with_peer(stream, peer, self.config.max_message_size);
                    let handle =
                        ConnectionHandle::new(id, peer, None, self.handle.shared.notifier.clone());
                    debug!(reactor = %self.config.name, conn = %id, %peer, "accepted connection");
                    self.admit(connection, handle);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(reactor = %self.config.name, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, mut connection: Connection, handle: ConnectionHandle) {
        let id = handle.id();
        let registered = self
            .poll
            .registry()
            .register(&mut connection.stream, token(id), Interest::READABLE);
        if let Err(e) = registered {
            warn!(reactor = %self.config.name, conn = %id, error = %e, "failed to register connection");
            self.handle.release_id(id);
            handle.mark_closed(DisconnectReason::Error(e.to_string()));
            return;
        }
        connection.write_interest = false;
        self.connections.insert(
            id,
            Slot {
                connection,
                handle: handle.clone(),
            },
        );
        match self.handler.on_accept(&self.handle, &handle) {
            Ok(()) => {
                trace!(reactor = %self.config.name, conn = %id, "connection admitted");
                self.service_read(id);
            }
            Err(reason) => {
                debug!(reactor = %self.config.name, conn = %id, %reason, "connection refused");
                handle.close_when_flushed(reason);
            }
        }
        self.service_write(id);
    }

    fn service_read(&mut self, id: ConnectionId) {
        if self.config.single_reader {
            if let Some(holder) = self.read_guard {
                if holder != id {
                    if !self.deferred_reads.contains(&id) {
                        self.deferred_reads.push_back(id);
                    }
                    return;
                }
            }
        }
        let Some(slot) = self.connections.get_mut(&id) else {
            return;
        };
        if slot.connection.read_paused {
            return;
        }

        let mut failure = None;
        loop {
            match slot
                .connection
                .reader
                .read_from(&mut slot.connection.stream)
            {
                Ok(ReadProgress::Complete(envelope)) => {
                    trace!(conn = %id, tag = ?envelope.tag(), len = envelope.len(), "envelope received");
                    let _ = self.inbound.send(Inbound::Envelope {
                        origin: slot.handle.clone(),
                        envelope,
                    });
                    if self.config.pause_after_read {
                        slot.connection.read_paused = true;
                        break;
                    }
                }
                Ok(ReadProgress::Pending) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if self.config.single_reader {
            self.read_guard = (!slot.connection.reader.is_idle()).then_some(id);
        }

        if let Some(error) = failure {
            let reason = match &error {
                FrameError::Eof => DisconnectReason::PeerClosed,
                e if e.is_protocol_violation() => {
                    warn!(reactor = %self.config.name, conn = %id, error = %e, "protocol violation");
                    DisconnectReason::Error(e.to_string())
                }
                e => {
                    debug!(reactor = %self.config.name, conn = %id, error = %e, "read failed");
                    DisconnectReason::Error(e.to_string())
                }
            };
            self.teardown(id, reason);
        }
    }

    fn service_write(&mut self, id: ConnectionId) {
        let Some(slot) = self.connections.get_mut(&id) else {
            return;
        };
        let mut failure = None;
        let mut blocked = false;
        loop {
            if slot.connection.writer.is_idle() {
                let Some(envelope) = slot.handle.next_outbound() else {
                    break;
                };
                if let Err(e) = slot.connection.writer.load(&envelope) {
                    warn!(conn = %id, tag = ?envelope.tag(), label = ?envelope.label(), error = %e, "dropping unsendable envelope");
                    continue;
                }
                trace!(conn = %id, tag = ?envelope.tag(), len = envelope.len(), "envelope sending");
            }
            match slot
                .connection
                .writer
                .write_to(&mut slot.connection.stream)
            {
                Ok(WriteProgress::Complete | WriteProgress::Idle) => {}
                Ok(WriteProgress::Pending) => {
                    blocked = true;
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            debug!(reactor = %self.config.name, conn = %id, error = %e, "write failed");
            self.teardown(id, DisconnectReason::Error(e.to_string()));
            return;
        }

        if blocked != slot.connection.write_interest {
            let interest = if blocked {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if let Err(e) =
                self.poll
                    .registry()
                    .reregister(&mut slot.connection.stream, token(id), interest)
            {
                warn!(reactor = %self.config.name, conn = %id, error = %e, "failed to update interest");
                self.teardown(id, DisconnectReason::Error(e.to_string()));
                return;
            }
            slot.connection.write_interest = blocked;
        }

        if !blocked && slot.handle.wants_close() {
            self.teardown(id, DisconnectReason::ByServer);
        }
    }

    fn drain_broadcasts(&mut self) {
        while let Ok(Broadcast { envelope, filter }) = self.broadcasts.try_recv() {
            let recipients: Vec<ConnectionId> = self
                .connections
                .values()
                .filter(|slot| {
                    slot.handle
                        .status()
                        .is_some_and(|status| filter.admits(slot.handle.id(), status))
                })
                .map(|slot| slot.handle.id())
                .collect();
            trace!(
                reactor = %self.config.name,
                tag = ?envelope.tag(),
                recipients = recipients.len(),
                "broadcast"
            );
            for id in recipients {
                if let Some(slot) = self.connections.get(&id) {
                    let _ = slot.handle.enqueue(envelope.clone());
                }
                self.service_write(id);
            }
        }
    }

    fn replay_deferred_reads(&mut self) {
        while self.read_guard.is_none() {
            let Some(id) = self.deferred_reads.pop_front() else {
                break;
            };
            self.service_read(id);
        }
    }

    fn detach(&mut self, id: ConnectionId) -> Option<Slot> {
        let mut slot = self.connections.remove(&id)?;
        if let Err(e) = self.poll.registry().deregister(&mut slot.connection.stream) {
            trace!(conn = %id, error = %e, "deregister failed");
        }
        self.handle.release_id(id);
        if self.read_guard == Some(id) {
            self.read_guard = None;
        }
        self.deferred_reads.retain(|deferred| *deferred != id);
        Some(slot)
    }

    fn transfer(
        &mut self,
        id: ConnectionId,
        to: &ReactorHandle,
        user: Option<User>,
        abandoned: Abandoned,
    ) {
        let Some(mut slot) = self.detach(id) else {
            debug!(reactor = %self.config.name, conn = %id, "transfer of a departed connection");
            return;
        };
        // The old handle goes stale; it must not report a disconnect.
        slot.handle.mark_closed(DisconnectReason::ByServer);
        slot.connection.read_paused = false;
        match to.register(slot.connection, user) {
            Ok(handle) => {
                abandoned.disarm();
                debug!(
                    from = %self.config.name,
                    to = %to.name(),
                    old = %id,
                    new = %handle.id(),
                    "connection transferred"
                );
            }
            Err(connection) => {
                warn!(from = %self.config.name, to = %to.name(), conn = %id, "transfer target stopped; closing");
                let _ = connection.stream.shutdown(Shutdown::Both);
            }
        }
    }

    fn teardown(&mut self, id: ConnectionId, fallback: DisconnectReason) {
        let Some(mut slot) = self.detach(id) else {
            return;
        };
        let _ = slot.connection.stream.shutdown(Shutdown::Both);
        slot.connection.clear();
        let reason = slot.handle.mark_closed(fallback);
        debug!(
            reactor = %self.config.name,
            conn = %id,
            user = ?slot.handle.name(),
            %reason,
            "connection closed"
        );
        let _ = self.inbound.send(Inbound::Closed {
            connection: slot.handle,
            reason,
        });
    }

    /// Best-effort flush, then close everything, including registrations
    /// that never made it in.
    fn close_all(&mut self, reason: DisconnectReason) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for &id in &ids {
            self.service_write(id);
        }
        for id in ids {
            self.teardown(id, reason.clone());
        }
        while let Ok((_, handle)) = self.registrations.try_recv() {
            self.handle.release_id(handle.id());
            handle.mark_closed(reason.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Duration;

    use boardroom_protocol::{Status, Tag, read_frame, write_frame};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    /// Echoes every envelope back. A `Session` envelope whose payload names
    /// a status sets the sender's status instead and acks with `Lobby`.
    /// Payload `panic` panics, `bye` disconnects the sender twice.
    struct Echo {
        disconnects: Sender<(ConnectionId, DisconnectReason)>,
    }

    impl Handler for Echo {
        fn on_accept(
            &self,
            _reactor: &ReactorHandle,
            connection: &ConnectionHandle,
        ) -> Result<(), DisconnectReason> {
            connection.set_user(User::new("anon", Status::ReadOnly));
            Ok(())
        }

        fn on_envelope(
            &self,
            _reactor: &ReactorHandle,
            origin: &ConnectionHandle,
            envelope: Envelope,
        ) -> Result<(), HandlerError> {
            match &envelope.payload()[..] {
                b"panic" => panic!("handler blew up"),
                b"bye" => {
                    origin.disconnect(DisconnectReason::ByUser);
                    origin.disconnect(DisconnectReason::Kicked);
                    return Ok(());
                }
                _ => {}
            }
            if envelope.tag() == Tag::Session {
                let status = match envelope.as_text()? {
                    "common" => Status::Common,
                    "moderator" => Status::Moderator,
                    _ => Status::ReadOnly,
                };
                origin.set_status(status);
                origin.send(Envelope::empty(Tag::Lobby))?;
                return Ok(());
            }
            origin.send(envelope)?;
            Ok(())
        }

        fn on_disconnect(
            &self,
            _reactor: &ReactorHandle,
            connection: &ConnectionHandle,
            reason: &DisconnectReason,
        ) {
            let _ = self.disconnects.send((connection.id(), reason.clone()));
        }
    }

    fn start(config: ReactorConfig) -> (ReactorHandle, Receiver<(ConnectionId, DisconnectReason)>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let reactor =
            Reactor::spawn(config, Some(listener), Arc::new(Echo { disconnects: tx })).unwrap();
        (reactor, rx)
    }

    fn connect(reactor: &ReactorHandle) -> TcpStream {
        let stream = TcpStream::connect(reactor.local_addr().unwrap()).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream
    }

    fn send(stream: &mut TcpStream, tag: Tag, payload: &[u8]) {
        write_frame(stream, &Envelope::new(tag, payload.to_vec())).unwrap();
    }

    fn recv(stream: &mut TcpStream) -> Envelope {
        read_frame(stream, MAX_MESSAGE_SIZE as usize).unwrap()
    }

    fn stop(reactor: ReactorHandle) {
        reactor.shutdown();
        reactor.join();
        assert!(!reactor.is_running());
    }

    #[test]
    fn echoes_envelopes() {
        let (reactor, _disconnects) = start(ReactorConfig::new("echo"));
        let mut client = connect(&reactor);
        send(&mut client, Tag::Lobby, b"ping");
        let reply = recv(&mut client);
        assert_eq!(reply.tag(), Tag::Lobby);
        assert_eq!(&reply.payload()[..], b"ping");
        stop(reactor);
    }

    #[test]
    fn replies_arrive_in_order() {
        let (reactor, _disconnects) = start(ReactorConfig::new("fifo"));
        let mut client = connect(&reactor);
        for i in 0..500u32 {
            send(&mut client, Tag::Lobby, &i.to_be_bytes());
        }
        for i in 0..500u32 {
            let reply = recv(&mut client);
            assert_eq!(&reply.payload()[..], &i.to_be_bytes()[..]);
        }
        stop(reactor);
    }

    #[test]
    fn large_payload_survives_partial_writes() {
        let (reactor, _disconnects) = start(ReactorConfig::new("bulk"));
        let mut client = connect(&reactor);
        let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        // Send from another thread so the reply can drain concurrently.
        let mut writer = client.try_clone().unwrap();
        let outgoing = payload.clone();
        let sender = thread::spawn(move || send(&mut writer, Tag::Lobby, &outgoing));
        let reply = recv(&mut client);
        sender.join().unwrap();
        assert_eq!(reply.len(), payload.len());
        assert_eq!(&reply.payload()[..], &payload[..]);
        stop(reactor);
    }

    #[test]
    fn out_of_range_tag_tears_down() {
        let (reactor, disconnects) = start(ReactorConfig::new("tags"));
        let mut client = connect(&reactor);
        client.write_all(&[0, 0, 0, 0, 42]).unwrap();
        let result = read_frame(&mut client, MAX_MESSAGE_SIZE as usize);
        assert!(matches!(result, Err(FrameError::Eof)), "{result:?}");
        let (_, reason) = disconnects.recv_timeout(WAIT).unwrap();
        assert!(matches!(reason, DisconnectReason::Error(_)), "{reason:?}");
        stop(reactor);
    }

    #[test]
    fn handler_panic_closes_only_its_connection() {
        let (reactor, disconnects) = start(ReactorConfig::new("panics"));
        let mut victim = connect(&reactor);
        let mut bystander = connect(&reactor);
        send(&mut victim, Tag::Lobby, b"panic");
        let (_, reason) = disconnects.recv_timeout(WAIT).unwrap();
        assert!(matches!(reason, DisconnectReason::Error(_)));
        assert!(matches!(
            read_frame(&mut victim, MAX_MESSAGE_SIZE as usize),
            Err(FrameError::Eof)
        ));

        send(&mut bystander, Tag::Lobby, b"still here");
        assert_eq!(&recv(&mut bystander).payload()[..], b"still here");
        stop(reactor);
    }

    #[test]
    fn double_disconnect_reports_once() {
        let (reactor, disconnects) = start(ReactorConfig::new("bye"));
        let mut client = connect(&reactor);
        send(&mut client, Tag::Lobby, b"bye");
        let (_, reason) = disconnects.recv_timeout(WAIT).unwrap();
        assert_eq!(reason, DisconnectReason::ByUser);
        assert!(matches!(
            read_frame(&mut client, MAX_MESSAGE_SIZE as usize),
            Err(FrameError::Eof)
        ));
        stop(reactor);
        assert!(disconnects.try_recv().is_err());
    }

    #[test]
    fn peer_close_is_reported() {
        let (reactor, disconnects) = start(ReactorConfig::new("hangup"));
        let client = connect(&reactor);
        drop(client);
        let (_, reason) = disconnects.recv_timeout(WAIT).unwrap();
        assert_eq!(reason, DisconnectReason::PeerClosed);
        stop(reactor);
    }

    #[test]
    fn broadcast_respects_minimum_status() {
        let (reactor, _disconnects) = start(ReactorConfig::new("filter"));
        let mut clients = Vec::new();
        for status in ["readonly", "common", "moderator"] {
            let mut client = connect(&reactor);
            send(&mut client, Tag::Session, status.as_bytes());
            assert_eq!(recv(&mut client).tag(), Tag::Lobby);
            clients.push(client);
        }

        reactor.broadcast(
            Envelope::new(Tag::Admin, b"news".to_vec()),
            RecipientFilter::all(Status::Common),
        );
        for client in &mut clients[1..] {
            assert_eq!(&recv(client).payload()[..], b"news");
        }

        // The read-only client got nothing: its next frame is the echo.
        send(&mut clients[0], Tag::Lobby, b"after");
        assert_eq!(&recv(&mut clients[0]).payload()[..], b"after");
        stop(reactor);
    }

    #[test]
    fn single_reader_guard_defers_other_connections() {
        let (reactor, _disconnects) = start(ReactorConfig::new("guarded").single_reader());
        let mut slow = connect(&reactor);
        let mut fast = connect(&reactor);

        let mut frame = Vec::new();
        write_frame(&mut frame, &Envelope::new(Tag::Lobby, b"slow".to_vec())).unwrap();
        slow.write_all(&frame[..3]).unwrap();
        thread::sleep(Duration::from_millis(100));

        send(&mut fast, Tag::Lobby, b"fast");
        fast.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        assert!(read_frame(&mut fast, MAX_MESSAGE_SIZE as usize).is_err());

        slow.write_all(&frame[3..]).unwrap();
        assert_eq!(&recv(&mut slow).payload()[..], b"slow");
        fast.set_read_timeout(Some(WAIT)).unwrap();
        assert_eq!(&recv(&mut fast).payload()[..], b"fast");
        stop(reactor);
    }

    #[test]
    fn id_allocation_retries_on_collision() {
        let (reactor, _disconnects) = start(ReactorConfig::new("ids"));
        let mut draws = vec![7, 7, 7, 9].into_iter();
        let first = reactor.allocate_id_with(|| draws.next().unwrap());
        let second = reactor.allocate_id_with(|| draws.next().unwrap());
        assert_eq!(first, ConnectionId(7));
        assert_eq!(second, ConnectionId(9));

        let mut reserved = vec![u32::MAX, u32::MAX - 1, 11].into_iter();
        assert_eq!(
            reactor.allocate_id_with(|| reserved.next().unwrap()),
            ConnectionId(11)
        );
        stop(reactor);
    }

    /// Forwards the first envelope's connection to `target`, reporting on
    /// `abandoned` if it never arrives.
    struct Gate {
        target: ReactorHandle,
        abandoned: crossbeam_channel::Sender<ConnectionId>,
    }

    impl Handler for Gate {
        fn on_envelope(
            &self,
            reactor: &ReactorHandle,
            origin: &ConnectionHandle,
            _envelope: Envelope,
        ) -> Result<(), HandlerError> {
            let id = origin.id();
            let abandoned = self.abandoned.clone();
            reactor.transfer(
                id,
                &self.target,
                Some(User::new("moved", Status::Common)),
                Abandoned::new(move || {
                    let _ = abandoned.send(id);
                }),
            );
            Ok(())
        }
    }

    #[test]
    fn paused_connection_transfers_with_unread_frames() {
        let (target, _disconnects) = start(ReactorConfig::new("target"));
        let (gate, abandoned) = start_gate(&target);

        let mut client = connect(&gate);
        let mut burst = Vec::new();
        write_frame(&mut burst, &Envelope::new(Tag::Handshake, b"hello".to_vec())).unwrap();
        write_frame(&mut burst, &Envelope::new(Tag::Lobby, b"for target".to_vec())).unwrap();
        client.write_all(&burst).unwrap();

        let reply = recv(&mut client);
        assert_eq!(&reply.payload()[..], b"for target");
        assert_eq!(target.connection_count(), 1);
        assert_eq!(gate.connection_count(), 0);
        assert!(abandoned.try_recv().is_err());

        stop(gate);
        stop(target);
    }

    fn start_gate(target: &ReactorHandle) -> (ReactorHandle, Receiver<ConnectionId>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let gate = Reactor::spawn(
            ReactorConfig::new("gate").pause_after_read(),
            Some(listener),
            Arc::new(Gate {
                target: target.clone(),
                abandoned: tx,
            }),
        )
        .unwrap();
        (gate, rx)
    }

    #[test]
    fn transfer_to_stopped_reactor_is_reported() {
        let (target, _disconnects) = start(ReactorConfig::new("gone"));
        stop(target.clone());
        let (gate, abandoned) = start_gate(&target);

        let mut client = connect(&gate);
        send(&mut client, Tag::Handshake, b"hello");
        assert!(abandoned.recv_timeout(WAIT).is_ok());
        assert!(matches!(
            read_frame(&mut client, MAX_MESSAGE_SIZE as usize),
            Err(FrameError::Eof)
        ));
        stop(gate);
    }

    #[test]
    fn transfer_of_unknown_connection_is_reported() {
        let (target, _disconnects) = start(ReactorConfig::new("target"));
        let (gate, _abandoned) = start_gate(&target);
        let (tx, rx) = crossbeam_channel::unbounded();
        assert!(gate.transfer(
            ConnectionId(42),
            &target,
            None,
            Abandoned::new(move || {
                let _ = tx.send(());
            }),
        ));
        assert!(rx.recv_timeout(WAIT).is_ok());
        assert_eq!(target.connection_count(), 0);
        stop(gate);
        stop(target);
    }

    #[test]
    fn register_fails_after_shutdown() {
        let (reactor, _disconnects) = start(ReactorConfig::new("stopped"));
        let peer = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = peer.local_addr().unwrap();
        stop(reactor.clone());

        let stream = mio::net::TcpStream::connect(addr).unwrap();
        let connection = Connection::with_peer(stream, addr, 1024);
        assert!(reactor.register(connection, None).is_err());
    }
}
