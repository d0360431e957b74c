// Test-only lobby member for end-to-end tests.
//
// Wraps the real `Client` (from `boardroom_relay::client`) and its `Inbox`
// channel to give tests a synchronous API: join, send a request, then block
// until a matching lobby event arrives. All networking goes through the
// same code paths as a real collaborator; the only test-specific code is
// the waiting.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use boardroom_protocol::{
    DisconnectReason, Hello, LobbyEvent, PROTOCOL_VERSION, SessionRequest, Status, Tag,
};
use boardroom_relay::client::{Client, ClientError, ClientEvent, Inbox, WelcomeInfo};
use boardroom_relay::config::{ClientConfig, ServerConfig};
use boardroom_relay::server::{ServerHandle, SessionServer};
use crossbeam_channel::{Receiver, RecvTimeoutError};

/// Default timeout for blocking waits.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a session server on an ephemeral loopback port.
pub fn start_server() -> ServerHandle {
    SessionServer::start(&ServerConfig {
        port: 0,
        ..ServerConfig::default()
    })
    .expect("failed to start session server")
}

pub fn hello(user: &str, lobby: &str, password: Option<&str>, create: bool) -> Hello {
    Hello {
        protocol_version: PROTOCOL_VERSION,
        username: user.into(),
        lobby: lobby.into(),
        lobby_password: password.map(str::to_owned),
        create,
    }
}

pub struct TestMember {
    client: Client,
    events: Receiver<ClientEvent>,
    pub welcome: WelcomeInfo,
}

impl TestMember {
    pub fn try_connect(addr: SocketAddr, hello: &Hello) -> Result<Self, ClientError> {
        let (inbox, events) = Inbox::channel();
        let (client, welcome) = Client::connect(addr, hello, inbox, &ClientConfig::default())?;
        Ok(Self {
            client,
            events,
            welcome,
        })
    }

    /// Create `lobby` and become its root.
    pub fn create(addr: SocketAddr, name: &str, lobby: &str, password: Option<&str>) -> Self {
        Self::try_connect(addr, &hello(name, lobby, password, true))
            .expect("TestMember::create failed")
    }

    pub fn join(addr: SocketAddr, name: &str, lobby: &str, password: Option<&str>) -> Self {
        Self::try_connect(addr, &hello(name, lobby, password, false))
            .expect("TestMember::join failed")
    }

    pub fn name(&self) -> &str {
        &self.welcome.username
    }

    pub fn status(&self) -> Status {
        self.welcome.status
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn request(&self, request: SessionRequest) {
        self.client
            .send_session(&request)
            .expect("send_session failed");
    }

    pub fn chat(&self, text: &str) {
        self.request(SessionRequest::Chat { text: text.into() });
    }

    pub fn command(&self, payload: &[u8]) {
        self.request(SessionRequest::Command {
            payload: payload.to_vec(),
        });
    }

    pub fn set_status(&self, user: &str, status: Status) {
        self.request(SessionRequest::SetStatus {
            user: user.into(),
            status,
        });
    }

    pub fn kick(&self, user: &str) {
        self.request(SessionRequest::Kick { user: user.into() });
    }

    pub fn leave(&self) {
        self.client.disconnect();
    }

    /// Next lobby event within `timeout`, or `None`. Panics if the member
    /// was disconnected instead.
    pub fn next_event_within(&self, timeout: Duration) -> Option<LobbyEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(ClientEvent::Envelope(envelope)) if envelope.tag() == Tag::Lobby => {
                    return Some(envelope.decode().expect("lobby event did not decode"));
                }
                Ok(ClientEvent::Envelope(_)) => {}
                Ok(ClientEvent::Disconnected(reason)) => {
                    panic!("{} disconnected ({reason}) while waiting for an event", self.name())
                }
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => panic!("event channel closed"),
            }
        }
    }

    pub fn next_event(&self) -> LobbyEvent {
        self.next_event_within(WAIT_TIMEOUT)
            .unwrap_or_else(|| panic!("{} timed out waiting for an event", self.name()))
    }

    /// Skip events until one satisfies `matches`.
    pub fn wait_for(&self, what: &str, mut matches: impl FnMut(&LobbyEvent) -> bool) -> LobbyEvent {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_event_within(remaining) {
                Some(event) if matches(&event) => return event,
                Some(_) => {}
                None => panic!("{} timed out waiting for {what}", self.name()),
            }
        }
    }

    /// Assert no lobby event arrives for `quiet`.
    pub fn assert_quiet(&self, quiet: Duration) {
        if let Some(event) = self.next_event_within(quiet) {
            panic!("{} got unexpected event {event:?}", self.name());
        }
    }

    /// Skip remaining events until the disconnect is reported.
    pub fn wait_disconnect(&self) -> DisconnectReason {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(ClientEvent::Disconnected(reason)) => return reason,
                Ok(ClientEvent::Envelope(_)) => {}
                Err(_) => panic!("{} timed out waiting for disconnect", self.name()),
            }
        }
    }
}
