// Executor thread: runs the handler on envelopes the I/O thread assembled.
//
// The I/O thread pushes completed envelopes and connection closures onto an
// unbounded channel in arrival order, so a connection's `on_disconnect`
// always runs after every envelope read from it. This thread drains the
// channel with a bounded wait so it notices a stopped reactor even when
// nothing arrives. A handler error or panic closes only the connection
// whose envelope caused it.
//
// Envelopes from a connection closed locally (kicked, failed, disconnected
// by a handler) are dropped unhandled. Envelopes that arrived before the
// peer hung up are still handled.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use boardroom_protocol::{DisconnectReason, Envelope, Tag};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionHandle, SendError};
use crate::reactor::{Handler, ReactorHandle};

/// Longest the executor waits before rechecking whether its reactor stopped.
pub const RECV_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unexpected {0:?} envelope")]
    UnexpectedTag(Tag),
    #[error("payload did not decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("payload is not UTF-8: {0}")]
    Text(#[from] std::str::Utf8Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Send(#[from] SendError),
}

pub(crate) enum Inbound {
    Envelope {
        origin: ConnectionHandle,
        envelope: Envelope,
    },
    Closed {
        connection: ConnectionHandle,
        reason: DisconnectReason,
    },
}

pub(crate) fn run(inbound: Receiver<Inbound>, handler: Arc<dyn Handler>, reactor: ReactorHandle) {
    loop {
        match inbound.recv_timeout(RECV_WAIT) {
            Ok(Inbound::Envelope { origin, envelope }) => {
                dispatch(handler.as_ref(), &reactor, origin, envelope);
            }
            Ok(Inbound::Closed { connection, reason }) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    handler.on_disconnect(&reactor, &connection, &reason)
                }));
                if let Err(payload) = outcome {
                    warn!(
                        reactor = %reactor.name(),
                        conn = %connection.id(),
                        error = %panic_message(payload.as_ref()),
                        "disconnect handler panicked"
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !reactor.is_running() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(reactor = %reactor.name(), "executor stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

fn dispatch(
    handler: &dyn Handler,
    reactor: &ReactorHandle,
    origin: ConnectionHandle,
    envelope: Envelope,
) {
    if origin.is_closed() && origin.disconnect_reason() != Some(DisconnectReason::PeerClosed) {
        trace!(conn = %origin.id(), tag = ?envelope.tag(), "skipping envelope from closed connection");
        return;
    }
    let tag = envelope.tag();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handler.on_envelope(reactor, &origin, envelope)
    }));
    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("handler panicked: {}", panic_message(payload.as_ref())),
    };
    warn!(
        reactor = %reactor.name(),
        conn = %origin.id(),
        ?tag,
        error = %failure,
        "closing connection after handler failure"
    );
    origin.disconnect(DisconnectReason::Error(failure));
}
