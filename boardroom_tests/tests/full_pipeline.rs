// End-to-end tests for the session pipeline.
//
// Each test starts a real session server on an ephemeral port and connects
// real `Client`s (via `TestMember`), covering the whole path:
// handshake → gatekeeper → lobby transfer → request → fan-out → events.
// The admin tests add a real admin listener and console on top.

use std::sync::Arc;
use std::time::Duration;

use boardroom_protocol::{DisconnectReason, LobbyEvent, Status};
use boardroom_relay::admin::{AdminClient, AdminServer, LogAccess, PrimaryServer, ServerControl};
use boardroom_relay::client::ClientError;
use boardroom_relay::config::{AdminConfig, ClientConfig, ServerConfig};
use boardroom_tests::{TestMember, WAIT_TIMEOUT, hello, start_server};

const QUIET: Duration = Duration::from_millis(300);

fn joined(event: &LobbyEvent, name: &str) -> bool {
    matches!(event, LobbyEvent::MemberJoined { member } if member.name == name)
}

#[test]
fn create_join_and_chat() {
    let server = start_server();
    let alice = TestMember::create(server.addr(), "alice", "planning", None);
    assert_eq!(alice.status(), Status::LobbyRoot);

    let bob = TestMember::join(server.addr(), "bob", "planning", None);
    assert_eq!(bob.status(), Status::Common);
    assert_eq!(bob.welcome.lobby, "planning");
    assert_eq!(bob.welcome.members.len(), 2);
    alice.wait_for("bob to join", |e| joined(e, "bob"));

    bob.chat("hello");
    for member in [&alice, &bob] {
        match member.next_event() {
            LobbyEvent::Chat { from, text } => {
                assert_eq!(from.name, "bob");
                assert_eq!(text, "hello");
            }
            other => panic!("expected Chat, got {other:?}"),
        }
    }
    server.stop();
}

#[test]
fn duplicate_names_are_suffixed() {
    let server = start_server();
    let first = TestMember::create(server.addr(), "bob", "dupes", None);
    let second = TestMember::join(server.addr(), "bob", "dupes", None);
    let third = TestMember::join(server.addr(), "bob", "dupes", None);
    assert_eq!(first.name(), "bob");
    assert_eq!(second.name(), "bob(1)");
    assert_eq!(third.name(), "bob(2)");
    first.wait_for("bob(2) to join", |e| joined(e, "bob(2)"));
    server.stop();
}

#[test]
fn commands_reach_every_member_in_order() {
    let server = start_server();
    let host = TestMember::create(server.addr(), "host", "relay", None);
    let guest = TestMember::join(server.addr(), "guest", "relay", None);
    host.wait_for("guest to join", |e| joined(e, "guest"));

    for i in 0..50u8 {
        host.command(&[i, 0xff, i]);
    }
    for member in [&host, &guest] {
        for i in 0..50u8 {
            match member.next_event() {
                LobbyEvent::Command { from, payload } => {
                    assert_eq!(from.name, "host");
                    assert_eq!(payload, vec![i, 0xff, i]);
                }
                other => panic!("expected Command, got {other:?}"),
            }
        }
    }
    server.stop();
}

#[test]
fn demoted_member_cannot_chat_but_still_listens() {
    let server = start_server();
    let root = TestMember::create(server.addr(), "root", "ranks", None);
    let carol = TestMember::join(server.addr(), "carol", "ranks", None);
    root.wait_for("carol to join", |e| joined(e, "carol"));

    root.set_status("carol", Status::ReadOnly);
    carol.wait_for("demotion", |e| {
        matches!(e, LobbyEvent::StatusChanged { user, status: Status::ReadOnly } if user == "carol")
    });

    carol.chat("can I talk?");
    assert!(matches!(carol.next_event(), LobbyEvent::Notice { .. }));
    root.wait_for("demotion", |e| matches!(e, LobbyEvent::StatusChanged { .. }));
    root.assert_quiet(QUIET);

    root.chat("you may listen");
    assert!(matches!(carol.next_event(), LobbyEvent::Chat { .. }));
    server.stop();
}

#[test]
fn common_members_cannot_kick_or_promote() {
    let server = start_server();
    let root = TestMember::create(server.addr(), "root", "flat", None);
    let dave = TestMember::join(server.addr(), "dave", "flat", None);
    root.wait_for("dave to join", |e| joined(e, "dave"));

    dave.kick("root");
    assert!(matches!(dave.next_event(), LobbyEvent::Notice { .. }));
    dave.set_status("dave", Status::Moderator);
    assert!(matches!(dave.next_event(), LobbyEvent::Notice { .. }));
    root.assert_quiet(QUIET);
    server.stop();
}

#[test]
fn kicked_member_learns_why() {
    let server = start_server();
    let root = TestMember::create(server.addr(), "root", "kicks", None);
    let eve = TestMember::join(server.addr(), "eve", "kicks", None);
    root.wait_for("eve to join", |e| joined(e, "eve"));

    root.kick("eve");
    assert_eq!(eve.wait_disconnect(), DisconnectReason::Kicked);
    match root.next_event() {
        LobbyEvent::MemberLeft { member, reason } => {
            assert_eq!(member.name, "eve");
            assert_eq!(reason, DisconnectReason::Kicked);
        }
        other => panic!("expected MemberLeft, got {other:?}"),
    }
    server.stop();
}

#[test]
fn goodbye_is_reported_as_user_initiated() {
    let server = start_server();
    let root = TestMember::create(server.addr(), "root", "bye", None);
    let fred = TestMember::join(server.addr(), "fred", "bye", None);
    root.wait_for("fred to join", |e| joined(e, "fred"));

    fred.leave();
    assert_eq!(fred.wait_disconnect(), DisconnectReason::ByUser);
    match root.next_event() {
        LobbyEvent::MemberLeft { member, reason } => {
            assert_eq!(member.name, "fred");
            assert!(reason.is_user_initiated(), "{reason:?}");
        }
        other => panic!("expected MemberLeft, got {other:?}"),
    }
    server.stop();
}

#[test]
fn passwords_guard_lobbies() {
    let server = start_server();
    let _root = TestMember::create(server.addr(), "root", "vault", Some("s3cret"));

    let wrong =
        TestMember::try_connect(server.addr(), &hello("gina", "vault", Some("guess"), false));
    assert!(matches!(wrong, Err(ClientError::Rejected(_))));
    let missing = TestMember::try_connect(server.addr(), &hello("gina", "vault", None, false));
    assert!(matches!(missing, Err(ClientError::Rejected(_))));

    let gina = TestMember::join(server.addr(), "gina", "vault", Some("s3cret"));
    assert_eq!(gina.name(), "gina");
    server.stop();
}

#[test]
fn unknown_lobby_and_duplicate_create_are_rejected() {
    let server = start_server();
    let _root = TestMember::create(server.addr(), "root", "taken", None);
    let unknown = TestMember::try_connect(server.addr(), &hello("x", "nowhere", None, false));
    assert!(matches!(unknown, Err(ClientError::Rejected(_))));
    let duplicate = TestMember::try_connect(server.addr(), &hello("x", "taken", None, true));
    assert!(matches!(duplicate, Err(ClientError::Rejected(_))));
    server.stop();
}

#[test]
fn lobby_shutdown_disconnects_members() {
    let server = start_server();
    let root = TestMember::create(server.addr(), "root", "closing", None);
    let guest = TestMember::join(server.addr(), "guest", "closing", None);
    root.wait_for("guest to join", |e| joined(e, "guest"));

    server.registry().shutdown_lobby("closing").unwrap();
    assert_eq!(root.wait_disconnect(), DisconnectReason::LobbyClosed);
    assert_eq!(guest.wait_disconnect(), DisconnectReason::LobbyClosed);
    assert!(server.registry().get("closing").is_none());
    server.stop();
}

#[test]
fn server_stop_disconnects_everyone() {
    let server = start_server();
    let a = TestMember::create(server.addr(), "a", "one", None);
    let b = TestMember::create(server.addr(), "b", "two", None);
    server.stop();
    assert_eq!(a.wait_disconnect(), DisconnectReason::LobbyClosed);
    assert_eq!(b.wait_disconnect(), DisconnectReason::LobbyClosed);
    assert!(!server.is_running());
}

fn start_admin() -> (AdminServer, Arc<PrimaryServer>) {
    let primary = Arc::new(PrimaryServer::new(ServerConfig {
        port: 0,
        ..ServerConfig::default()
    }));
    primary.start().unwrap();
    let admin = AdminServer::start(
        &AdminConfig {
            port: 0,
            ..AdminConfig::default()
        },
        "opensesame",
        primary.clone(),
        LogAccess::default(),
    )
    .unwrap();
    (admin, primary)
}

fn ask(console: &mut AdminClient, line: &str) -> String {
    console.send(line).unwrap();
    console
        .recv(Some(WAIT_TIMEOUT))
        .unwrap()
        .unwrap_or_else(|| panic!("no reply to {line}"))
}

#[test]
fn admin_manages_live_lobbies() {
    let (admin, primary) = start_admin();
    let addr = primary.handle().unwrap().addr();
    let root = TestMember::create(addr, "root", "lobbyA", None);
    let bob = TestMember::join(addr, "bob", "lobbyA", None);
    root.wait_for("bob to join", |e| joined(e, "bob"));

    let mut console = AdminClient::connect(admin.addr(), "opensesame", &ClientConfig::default())
        .unwrap();
    assert_eq!(ask(&mut console, "-kick lobbyA"), "illegal command: \"-kick lobbyA\"");
    assert_eq!(ask(&mut console, "-lobbies"), "lobbyA (2 members)");

    assert_eq!(ask(&mut console, "-kick lobbyA bob"), "bob kicked from lobbyA");
    assert_eq!(bob.wait_disconnect(), DisconnectReason::Kicked);
    root.wait_for("bob to leave", |e| matches!(e, LobbyEvent::MemberLeft { .. }));

    assert_eq!(
        ask(&mut console, "-changelobbyname lobbyA lobbyB"),
        "lobby lobbyA renamed to lobbyB"
    );
    match root.next_event() {
        LobbyEvent::Renamed { lobby } => assert_eq!(lobby, "lobbyB"),
        other => panic!("expected Renamed, got {other:?}"),
    }

    assert_eq!(ask(&mut console, "-ban lobbyB bob"), "bob banned from lobbyB");
    let banned = TestMember::try_connect(addr, &hello("bob", "lobbyB", None, false));
    assert!(matches!(banned, Err(ClientError::Rejected(_))));

    assert_eq!(
        ask(&mut console, "-changelobbypassword lobbyB pw"),
        "password of lobbyB changed"
    );
    let locked_out = TestMember::try_connect(addr, &hello("carl", "lobbyB", None, false));
    assert!(matches!(locked_out, Err(ClientError::Rejected(_))));
    let carl = TestMember::join(addr, "carl", "lobbyB", Some("pw"));
    assert_eq!(carl.welcome.lobby, "lobbyB");

    assert_eq!(ask(&mut console, "-shutdown"), "server stopped");
    assert_eq!(root.wait_disconnect(), DisconnectReason::LobbyClosed);
    admin.stop();
}

#[test]
fn admin_login_is_required() {
    let (admin, _primary) = start_admin();
    let denied = AdminClient::connect(admin.addr(), "wrong", &ClientConfig::default());
    assert!(matches!(denied, Err(ClientError::Rejected(_))));
    admin.stop();
}
