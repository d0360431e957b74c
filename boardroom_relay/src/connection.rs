// Per-connection state, split in two halves.
//
// `Connection` is the I/O half: the non-blocking socket and its framing state
// machines. Exactly one reactor thread owns it at a time. It is `Send` so it
// can move between reactors (the primary server hands a socket to a lobby
// once the handshake succeeds), but it is never shared.
//
// `ConnectionHandle` is the shared half, cloned into executors, rosters and
// foreign threads. It carries identity (id, peer address, user), the FIFO
// outbound queue, and the closed flag. Sending or disconnecting through a
// handle only touches the queue, atomics and the owning reactor's waker;
// the reactor does the socket work on its own thread.
//
// Write discipline: `send` appends to the queue. The reactor loads one
// envelope into the `FrameWriter` only when it is idle, so there is never
// more than one frame in flight and envelopes leave in enqueue order.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use boardroom_protocol::{
    ConnectionId, DisconnectReason, Envelope, FrameReader, FrameWriter, Status, User,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::net::TcpStream;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::reactor::{Control, Notifier};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

/// I/O half of a connection.
pub struct Connection {
    pub(crate) stream: TcpStream,
    peer: SocketAddr,
    pub(crate) reader: FrameReader,
    pub(crate) writer: FrameWriter,
    /// Readable events are ignored while set.
    pub(crate) read_paused: bool,
    /// Whether WRITABLE is part of the registered interest.
    pub(crate) write_interest: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, max_message_size: usize) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self::with_peer(stream, peer, max_message_size))
    }

    pub(crate) fn with_peer(stream: TcpStream, peer: SocketAddr, max_message_size: usize) -> Self {
        Self {
            stream,
            peer,
            reader: FrameReader::new(max_message_size),
            writer: FrameWriter::new(max_message_size),
            read_paused: false,
            write_interest: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Neither a read nor a write is in progress.
    pub fn is_free(&self) -> bool {
        self.reader.is_idle() && self.writer.is_idle()
    }

    pub(crate) fn clear(&mut self) {
        self.reader.reset();
        self.writer.reset();
        self.read_paused = false;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("read", &self.reader.phase())
            .field("write", &self.writer.phase())
            .field("read_paused", &self.read_paused)
            .finish()
    }
}

struct Shared {
    id: ConnectionId,
    peer: SocketAddr,
    user: RwLock<Option<User>>,
    outbound_tx: Sender<Envelope>,
    outbound_rx: Receiver<Envelope>,
    closed: AtomicBool,
    close_when_flushed: AtomicBool,
    reason: Mutex<Option<DisconnectReason>>,
    notifier: Notifier,
}

/// Shared half of a connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        user: Option<User>,
        notifier: Notifier,
    ) -> Self {
        let (outbound_tx, outbound_rx) = unbounded();
        Self {
            shared: Arc::new(Shared {
                id,
                peer,
                user: RwLock::new(user),
                outbound_tx,
                outbound_rx,
                closed: AtomicBool::new(false),
                close_when_flushed: AtomicBool::new(false),
                reason: Mutex::new(None),
                notifier,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn user(&self) -> Option<User> {
        self.shared.user.read().clone()
    }

    pub fn name(&self) -> Option<String> {
        self.shared.user.read().as_ref().map(|u| u.name.clone())
    }

    /// Current status, or `None` while the connection is unregistered.
    pub fn status(&self) -> Option<Status> {
        self.shared.user.read().as_ref().map(|u| u.status)
    }

    pub fn set_user(&self, user: User) {
        *self.shared.user.write() = Some(user);
    }

    /// Returns false if the connection has no user yet.
    pub fn set_status(&self, status: Status) -> bool {
        match self.shared.user.write().as_mut() {
            Some(user) => {
                user.status = status;
                true
            }
            None => false,
        }
    }

    /// Queue an envelope and wake the owning reactor.
    pub fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        self.enqueue(envelope)?;
        self.shared.notifier.notify(Control::Flush(self.id()));
        Ok(())
    }

    /// Queue without waking; for the reactor's own thread.
    pub(crate) fn enqueue(&self, envelope: Envelope) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed(self.id()));
        }
        // Cannot fail: `shared` owns the receiver.
        let _ = self.shared.outbound_tx.send(envelope);
        Ok(())
    }

    pub(crate) fn next_outbound(&self) -> Option<Envelope> {
        self.shared.outbound_rx.try_recv().ok()
    }

    /// Envelopes waiting behind the one in flight.
    pub fn queued(&self) -> usize {
        self.shared.outbound_rx.len()
    }

    /// Close now, dropping anything still queued. Idempotent; only the
    /// first reason is kept.
    pub fn disconnect(&self, reason: DisconnectReason) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.record_reason(reason);
        while self.shared.outbound_rx.try_recv().is_ok() {}
        self.shared.notifier.notify(Control::Close(self.id()));
    }

    /// Close once everything already queued has been written.
    pub fn close_when_flushed(&self, reason: DisconnectReason) {
        if self.is_closed() {
            return;
        }
        self.record_reason(reason);
        self.shared.close_when_flushed.store(true, Ordering::Release);
        self.shared.notifier.notify(Control::Flush(self.id()));
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared.reason.lock().clone()
    }

    pub(crate) fn wants_close(&self) -> bool {
        self.shared.close_when_flushed.load(Ordering::Acquire)
    }

    fn record_reason(&self, reason: DisconnectReason) {
        let mut slot = self.shared.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    /// Reactor-side teardown: mark closed, keep the first recorded reason
    /// (falling back to `fallback`), and drop anything still queued.
    pub(crate) fn mark_closed(&self, fallback: DisconnectReason) -> DisconnectReason {
        self.shared.closed.store(true, Ordering::Release);
        while self.shared.outbound_rx.try_recv().is_ok() {}
        let mut slot = self.shared.reason.lock();
        slot.get_or_insert(fallback).clone()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("peer", &self.peer())
            .field("user", &self.user())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for ConnectionHandle {}

#[cfg(test)]
mod tests {
    use boardroom_protocol::Tag;

    use super::*;
    use crate::reactor::Notifier;

    fn handle() -> (ConnectionHandle, crossbeam_channel::Receiver<Control>) {
        let (notifier, controls) = Notifier::detached();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let handle = ConnectionHandle::new(
            ConnectionId(1),
            peer,
            Some(User::new("alice", Status::Common)),
            notifier,
        );
        (handle, controls)
    }

    #[test]
    fn queue_is_fifo() {
        let (handle, _controls) = handle();
        for i in 0..10u8 {
            handle.send(Envelope::new(Tag::Lobby, vec![i])).unwrap();
        }
        assert_eq!(handle.queued(), 10);
        for i in 0..10u8 {
            assert_eq!(handle.next_outbound().unwrap().payload()[0], i);
        }
        assert!(handle.next_outbound().is_none());
    }

    #[test]
    fn send_wakes_the_reactor() {
        let (handle, controls) = handle();
        handle.send(Envelope::empty(Tag::Goodbye)).unwrap();
        assert!(matches!(controls.try_recv(), Ok(Control::Flush(ConnectionId(1)))));
    }

    #[test]
    fn double_disconnect_is_a_noop() {
        let (handle, controls) = handle();
        handle.send(Envelope::empty(Tag::Lobby)).unwrap();
        handle.disconnect(DisconnectReason::Kicked);
        handle.disconnect(DisconnectReason::ByUser);

        assert!(handle.is_closed());
        assert_eq!(handle.queued(), 0);
        assert_eq!(handle.disconnect_reason(), Some(DisconnectReason::Kicked));
        let closes = controls
            .try_iter()
            .filter(|c| matches!(c, Control::Close(_)))
            .count();
        assert_eq!(closes, 1);

        // The reactor's own teardown after the fact keeps the first reason.
        assert_eq!(
            handle.mark_closed(DisconnectReason::PeerClosed),
            DisconnectReason::Kicked
        );
        assert_eq!(
            handle.send(Envelope::empty(Tag::Lobby)),
            Err(SendError::Closed(ConnectionId(1)))
        );
    }

    #[test]
    fn close_when_flushed_keeps_queue() {
        let (handle, _controls) = handle();
        handle.send(Envelope::empty(Tag::HandshakeReply)).unwrap();
        handle.close_when_flushed(DisconnectReason::ByServer);
        assert!(!handle.is_closed());
        assert!(handle.wants_close());
        assert_eq!(handle.queued(), 1);
    }

    #[test]
    fn status_updates_in_place() {
        let (handle, _controls) = handle();
        assert!(handle.set_status(Status::Moderator));
        assert_eq!(handle.status(), Some(Status::Moderator));
        assert_eq!(handle.name().as_deref(), Some("alice"));
    }
}
