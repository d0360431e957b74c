// A lobby: one named session with its own reactor and roster.
//
// `Lobby` is a cloneable handle pairing the lobby's state with the reactor
// that serves its members. The state doubles as the reactor's `Handler`:
// registration runs on the lobby's I/O thread, session requests and
// departures on its executor thread.
//
// Registration:
// - banned names are refused with a `Rejected` reply;
// - a taken name is made unique with a numeric suffix
//   (`resolve_username_after`), counting every suffix handed out so far so a
//   departed `bob(2)` is never reissued to another `bob`;
// - the newcomer receives `Welcome` with the roster, everybody else a
//   `MemberJoined`.
//
// Authorization is a single `Status::at_least` check per request. Refused
// requests get a `Notice` and change nothing. When the last member leaves
// the lobby shuts its reactor down; the registry drops closed lobbies lazily.
//
// The reactor runs with the single-reader guard enabled, so at most one
// member's frame is being assembled at a time.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use boardroom_protocol::{
    ConnectionId, DisconnectReason, Envelope, HandshakeReply, LobbyEvent, Member,
    RecipientFilter, SessionRequest, Status, Tag, User,
};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::auth::PasswordHash;
use crate::connection::{Connection, ConnectionHandle};
use crate::executor::HandlerError;
use crate::reactor::{Handler, Reactor, ReactorConfig, ReactorHandle};

/// Numbers lobby reactors. Lobbies can be renamed, so threads are not
/// named after them.
static NEXT_REACTOR: AtomicU64 = AtomicU64::new(1);

/// Pick a name no current member has. `name` itself if free, otherwise
/// `name(n)` with `n` one above the highest suffix already in use.
pub fn resolve_username(requested: &str, taken: &[String]) -> String {
    resolve_username_after(requested, taken, &[])
}

/// Like `resolve_username`, but suffixes also count past the names in
/// `issued`, so a suffix is never handed out twice.
pub fn resolve_username_after(requested: &str, taken: &[String], issued: &[String]) -> String {
    if !taken.iter().any(|name| name == requested) {
        return requested.to_owned();
    }
    let highest = Regex::new(&format!(r"^{}\((\d+)\)$", regex::escape(requested)))
        .map(|pattern| {
            taken
                .iter()
                .chain(issued)
                .filter_map(|name| pattern.captures(name))
                .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    format!("{requested}({})", highest.saturating_add(1))
}

struct LobbyState {
    name: RwLock<String>,
    password: RwLock<Option<PasswordHash>>,
    banned: DashSet<String>,
    roster: DashMap<ConnectionId, ConnectionHandle>,
    /// Every name handed out while the lobby lived.
    issued: DashSet<String>,
    closing: AtomicBool,
    max_message_size: usize,
}

fn member_of(handle: &ConnectionHandle) -> Option<Member> {
    handle.user().map(|user| Member {
        id: handle.id(),
        name: user.name,
        status: user.status,
    })
}

fn lobby_envelope(event: &LobbyEvent) -> Result<Envelope, HandlerError> {
    Ok(Envelope::json(Tag::Lobby, event)?)
}

impl LobbyState {
    fn name(&self) -> String {
        self.name.read().clone()
    }

    fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .roster
            .iter()
            .filter_map(|entry| member_of(entry.value()))
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    fn find(&self, name: &str) -> Option<ConnectionHandle> {
        self.roster
            .iter()
            .find(|entry| entry.value().name().as_deref() == Some(name))
            .map(|entry| entry.value().clone())
    }

    /// Tell a member why, then close once that notice is written.
    fn remove_member(&self, target: &ConnectionHandle, reason: DisconnectReason) {
        if let Ok(envelope) = lobby_envelope(&LobbyEvent::Disconnected {
            reason: reason.clone(),
        }) {
            let _ = target.send(envelope);
        }
        target.close_when_flushed(reason);
    }

    fn notice(
        &self,
        origin: &ConnectionHandle,
        text: impl Into<String>,
    ) -> Result<(), HandlerError> {
        origin.send(lobby_envelope(&LobbyEvent::Notice { text: text.into() })?)?;
        Ok(())
    }

    /// Send a refusal notice unless `member` holds `required`.
    fn permits(
        &self,
        origin: &ConnectionHandle,
        member: &Member,
        required: Status,
        action: &str,
    ) -> Result<bool, HandlerError> {
        if member.status.at_least(required) {
            return Ok(true);
        }
        self.notice(origin, format!("{required} status required to {action}"))?;
        Ok(false)
    }

    fn publish(
        &self,
        reactor: &ReactorHandle,
        event: &LobbyEvent,
        filter: RecipientFilter,
    ) -> Result<(), HandlerError> {
        reactor.broadcast(lobby_envelope(event)?, filter);
        Ok(())
    }

    /// Fan a member's message out to the lobby. Wrapping it with the sender
    /// can push it past the frame limit; then only the sender hears back.
    fn relay(
        &self,
        reactor: &ReactorHandle,
        origin: &ConnectionHandle,
        event: &LobbyEvent,
    ) -> Result<(), HandlerError> {
        let envelope = lobby_envelope(event)?;
        if envelope.len() > self.max_message_size {
            debug!(lobby = %self.name(), conn = %origin.id(), len = envelope.len(), "message too large to relay");
            return self.notice(
                origin,
                format!(
                    "message too large to relay ({} bytes, max {})",
                    envelope.len(),
                    self.max_message_size
                ),
            );
        }
        reactor.broadcast(envelope, RecipientFilter::all(Status::ReadOnly));
        Ok(())
    }

    fn apply(
        &self,
        reactor: &ReactorHandle,
        origin: &ConnectionHandle,
        request: SessionRequest,
    ) -> Result<(), HandlerError> {
        if !self.roster.contains_key(&origin.id()) {
            return Ok(());
        }
        let Some(member) = member_of(origin) else {
            return Ok(());
        };

        match request {
            SessionRequest::Command { payload } => {
                if self.permits(origin, &member, Status::Common, "send commands")? {
                    self.relay(
                        reactor,
                        origin,
                        &LobbyEvent::Command {
                            from: member,
                            payload,
                        },
                    )?;
                }
            }
            SessionRequest::Chat { text } => {
                if self.permits(origin, &member, Status::Common, "chat")? {
                    self.relay(reactor, origin, &LobbyEvent::Chat { from: member, text })?;
                }
            }
            SessionRequest::SetStatus { user, status } => {
                if !self.permits(origin, &member, Status::Moderator, "change status")? {
                    return Ok(());
                }
                if status > member.status {
                    return self.notice(origin, "cannot grant a status above your own");
                }
                let Some(target) = self.find(&user) else {
                    return self.notice(origin, format!("no member named {user}"));
                };
                if target.status().is_some_and(|current| current > member.status) {
                    return self.notice(origin, format!("{user} outranks you"));
                }
                target.set_status(status);
                info!(lobby = %self.name(), by = %member.name, %user, %status, "status changed");
                self.publish(
                    reactor,
                    &LobbyEvent::StatusChanged { user, status },
                    RecipientFilter::all(Status::ReadOnly),
                )?;
            }
            SessionRequest::Kick { user } => {
                if !self.permits(origin, &member, Status::Moderator, "kick")? {
                    return Ok(());
                }
                let Some(target) = self.find(&user) else {
                    return self.notice(origin, format!("no member named {user}"));
                };
                if target.status().is_some_and(|current| current > member.status) {
                    return self.notice(origin, format!("{user} outranks you"));
                }
                info!(lobby = %self.name(), by = %member.name, %user, "member kicked");
                self.remove_member(&target, DisconnectReason::Kicked);
            }
        }
        Ok(())
    }
}

impl Handler for LobbyState {
    fn on_accept(
        &self,
        reactor: &ReactorHandle,
        connection: &ConnectionHandle,
    ) -> Result<(), DisconnectReason> {
        let reject = |reason: &str| {
            if let Ok(envelope) = Envelope::json(
                Tag::HandshakeReply,
                &HandshakeReply::Rejected {
                    reason: reason.to_owned(),
                },
            ) {
                let _ = connection.send(envelope);
            }
        };

        let Some(user) = connection.user() else {
            return Err(DisconnectReason::ByServer);
        };
        if self.closing.load(Ordering::Acquire) {
            reject("lobby is closing");
            return Err(DisconnectReason::LobbyClosed);
        }
        if self.banned.contains(&user.name) {
            reject("banned from lobby");
            return Err(DisconnectReason::Banned);
        }

        let taken: Vec<String> = self
            .roster
            .iter()
            .filter_map(|entry| entry.value().name())
            .collect();
        let issued: Vec<String> = self.issued.iter().map(|name| name.key().clone()).collect();
        let name = resolve_username_after(&user.name, &taken, &issued);
        self.issued.insert(name.clone());
        connection.set_user(User::new(name.clone(), user.status));
        self.roster.insert(connection.id(), connection.clone());

        let lobby = self.name();
        info!(lobby = %lobby, conn = %connection.id(), user = %name, status = %user.status, "member joined");

        let welcome = Envelope::json(
            Tag::HandshakeReply,
            &HandshakeReply::Welcome {
                connection_id: connection.id(),
                username: name.clone(),
                lobby,
                status: user.status,
                members: self.members(),
            },
        )
        .map_err(|e| DisconnectReason::Error(e.to_string()))?;
        let _ = connection.send(welcome);

        let joined = LobbyEvent::MemberJoined {
            member: Member {
                id: connection.id(),
                name,
                status: user.status,
            },
        };
        if let Err(e) = self.publish(
            reactor,
            &joined,
            RecipientFilter::except(vec![connection.id()], Status::ReadOnly),
        ) {
            warn!(error = %e, "failed to announce member");
        }
        Ok(())
    }

    fn on_envelope(
        &self,
        reactor: &ReactorHandle,
        origin: &ConnectionHandle,
        envelope: Envelope,
    ) -> Result<(), HandlerError> {
        match envelope.tag() {
            Tag::Session => {
                let request: SessionRequest = envelope.decode()?;
                self.apply(reactor, origin, request)
            }
            Tag::Goodbye => {
                origin.disconnect(DisconnectReason::ByUser);
                Ok(())
            }
            other => Err(HandlerError::UnexpectedTag(other)),
        }
    }

    fn on_disconnect(
        &self,
        reactor: &ReactorHandle,
        connection: &ConnectionHandle,
        reason: &DisconnectReason,
    ) {
        // Ids are reused once released; only remove this exact handle.
        if self
            .roster
            .remove_if(&connection.id(), |_, member| member == connection)
            .is_none()
        {
            return;
        }
        let lobby = self.name();
        info!(lobby = %lobby, conn = %connection.id(), user = ?connection.name(), %reason, "member left");
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        if let Some(member) = member_of(connection) {
            let left = LobbyEvent::MemberLeft {
                member,
                reason: reason.clone(),
            };
            if let Err(e) = self.publish(reactor, &left, RecipientFilter::all(Status::ReadOnly)) {
                warn!(error = %e, "failed to announce departure");
            }
        }
        if self.roster.is_empty() {
            info!(lobby = %lobby, "lobby empty; closing");
            self.closing.store(true, Ordering::Release);
            reactor.shutdown();
        }
    }
}

/// Cloneable handle to a running lobby.
#[derive(Clone)]
pub struct Lobby {
    state: Arc<LobbyState>,
    reactor: ReactorHandle,
}

impl Lobby {
    pub fn spawn(name: &str, password: Option<&str>, max_message_size: usize) -> io::Result<Self> {
        let state = Arc::new(LobbyState {
            name: RwLock::new(name.to_owned()),
            password: RwLock::new(password.map(PasswordHash::new)),
            banned: DashSet::new(),
            roster: DashMap::new(),
            issued: DashSet::new(),
            closing: AtomicBool::new(false),
            max_message_size,
        });
        let reactor_name = format!("lobby-{}", NEXT_REACTOR.fetch_add(1, Ordering::Relaxed));
        let config = ReactorConfig::new(reactor_name.as_str())
            .single_reader()
            .with_max_message_size(max_message_size);
        let reactor = Reactor::spawn(config, None, state.clone())?;
        debug!(lobby = %name, reactor = %reactor_name, protected = password.is_some(), "lobby started");
        Ok(Self { state, reactor })
    }

    pub fn name(&self) -> String {
        self.state.name()
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    /// Both handles refer to the same lobby.
    pub fn same_as(&self, other: &Lobby) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn is_open(&self) -> bool {
        !self.state.closing.load(Ordering::Acquire) && self.reactor.is_running()
    }

    /// Queue a connection for registration as `user`. Safe from any thread.
    pub fn add_connection(
        &self,
        connection: Connection,
        user: User,
    ) -> Result<ConnectionHandle, Connection> {
        self.reactor.register(connection, Some(user))
    }

    pub fn has_password(&self) -> bool {
        self.state.password.read().is_some()
    }

    pub fn check_password(&self, candidate: Option<&str>) -> bool {
        match (&*self.state.password.read(), candidate) {
            (None, _) => true,
            (Some(hash), Some(candidate)) => hash.verify(candidate),
            (Some(_), None) => false,
        }
    }

    /// Replace the password. `None` opens the lobby.
    pub fn set_password(&self, password: Option<&str>) {
        *self.state.password.write() = password.map(PasswordHash::new);
        info!(lobby = %self.name(), protected = password.is_some(), "lobby password changed");
    }

    pub(crate) fn set_name(&self, name: &str) {
        let old = std::mem::replace(&mut *self.state.name.write(), name.to_owned());
        info!(lobby = %name, %old, "lobby renamed");
        if let Ok(envelope) = lobby_envelope(&LobbyEvent::Renamed {
            lobby: name.to_owned(),
        }) {
            self.broadcast(envelope, RecipientFilter::all(Status::ReadOnly));
        }
    }

    pub fn members(&self) -> Vec<Member> {
        self.state.members()
    }

    pub fn member_count(&self) -> usize {
        self.state.roster.len()
    }

    pub fn is_banned(&self, user: &str) -> bool {
        self.state.banned.contains(user)
    }

    /// Ban a name and remove its holder if present. Returns whether someone
    /// was removed.
    pub fn ban(&self, user: &str) -> bool {
        self.state.banned.insert(user.to_owned());
        info!(lobby = %self.name(), %user, "user banned");
        self.kick_with(user, DisconnectReason::Banned)
    }

    pub fn unban(&self, user: &str) -> bool {
        let removed = self.state.banned.remove(user).is_some();
        if removed {
            info!(lobby = %self.name(), %user, "ban lifted");
        }
        removed
    }

    /// Remove a member by exact name. Returns false if nobody has it.
    pub fn kick(&self, user: &str) -> bool {
        self.kick_with(user, DisconnectReason::Kicked)
    }

    fn kick_with(&self, user: &str, reason: DisconnectReason) -> bool {
        match self.state.find(user) {
            Some(target) => {
                self.state.remove_member(&target, reason);
                true
            }
            None => false,
        }
    }

    pub fn broadcast(&self, envelope: Envelope, filter: RecipientFilter) -> bool {
        self.reactor.broadcast(envelope, filter)
    }

    /// Notify members and stop the reactor. Idempotent.
    pub fn shutdown(&self) {
        if self.state.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(lobby = %self.name(), members = self.member_count(), "lobby shutting down");
        if let Ok(envelope) = lobby_envelope(&LobbyEvent::Disconnected {
            reason: DisconnectReason::LobbyClosed,
        }) {
            self.reactor
                .broadcast(envelope, RecipientFilter::all(Status::ReadOnly));
        }
        self.reactor.shutdown();
    }

    pub fn join(&self) {
        self.reactor.join();
    }
}

impl std::fmt::Debug for Lobby {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lobby")
            .field("name", &self.name())
            .field("members", &self.member_count())
            .field("open", &self.is_open())
            .finish()
    }
}
