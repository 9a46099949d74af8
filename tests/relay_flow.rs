//! End-to-end relay flows driven through the frame dispatcher.

use chorus_relay::config::Config;
use chorus_relay::handlers;
use chorus_relay::protocol::ServerMessage;
use chorus_relay::state::{AppState, ConnectionId, RoomKey};
use chorus_relay::store::{EntityKind, MemoryStore, MessageStore, SqliteStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Client {
    id: ConnectionId,
    rx: mpsc::Receiver<ServerMessage>,
}

impl Client {
    fn connect(state: &AppState) -> Self {
        let (tx, mut rx) = mpsc::channel(state.config.limits.outbound_queue);
        let id = handlers::handle_connection(state, tx);
        match rx.try_recv() {
            Ok(ServerMessage::Connected { connection_id }) => assert_eq!(connection_id, id),
            other => panic!("expected connected, got {other:?}"),
        }
        Self { id, rx }
    }

    async fn send(&self, state: &AppState, frame: serde_json::Value) {
        handlers::handle_frame(state, self.id, &frame.to_string()).await;
    }

    async fn identify(&mut self, state: &AppState, id: i64, username: &str) {
        self.send(state, json!({"type": "user-joined", "payload": {"id": id, "username": username}}))
            .await;
        assert!(self.error_codes().is_empty());
    }

    async fn join_channel(&mut self, state: &AppState, channel_id: i64) {
        self.send(state, json!({"type": "join-channel", "payload": channel_id}))
            .await;
        let frames = self.drain();
        assert!(
            frames.iter().any(|m| matches!(m, ServerMessage::RoomMembers { room, .. } if *room == RoomKey::Channel(channel_id))),
            "join failed: {frames:?}"
        );
    }

    fn drain(&mut self) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            frames.push(msg);
        }
        frames
    }

    fn error_codes(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Error { code, .. } => Some(code),
                _ => None,
            })
            .collect()
    }

    fn new_message_ids(&mut self) -> Vec<i64> {
        self.drain()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::NewMessage(message) => Some(message.id),
                _ => None,
            })
            .collect()
    }
}

/// Users 1 (alice), 2 (bob), 3 (carol) on server 10.
/// Channel 7 belongs to server 10 with all three as members; channel 8 has only alice.
/// Channel 9 is a legacy channel without a server, bob is its member.
fn community() -> (Arc<AppState>, Arc<MemoryStore>) {
    community_with(Config::default())
}

fn community_with(config: Config) -> (Arc<AppState>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        store.add_user(id, name);
        store.add_member(EntityKind::Server, 10, id);
        store.add_member(EntityKind::Channel, 7, id);
    }
    store.add_channel(7, Some(10));
    store.add_channel(8, Some(10));
    store.add_member(EntityKind::Channel, 8, 1);
    store.add_channel(9, None);
    store.add_member(EntityKind::Channel, 9, 2);

    let state = Arc::new(AppState::new(config, store.clone(), store.clone()));
    (state, store)
}

#[tokio::test]
async fn message_reaches_every_channel_member_with_stored_id() {
    let (state, store) = community();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    bob.identify(&state, 2, "bob").await;
    alice.join_channel(&state, 7).await;
    bob.join_channel(&state, 7).await;

    alice
        .send(&state, json!({"type": "send-message", "payload": {"channelId": 7, "userId": 1, "content": "hi"}}))
        .await;

    let stored = store.list_by_channel(7).await.unwrap();
    assert_eq!(stored.len(), 1);
    for client in [&mut alice, &mut bob] {
        let frames = client.drain();
        let received: Vec<_> = frames
            .iter()
            .filter_map(|m| match m {
                ServerMessage::NewMessage(message) => Some(message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(received, stored);
        assert_eq!(received[0].username, "alice");
        assert_eq!(received[0].content, "hi");
    }
}

#[tokio::test]
async fn non_member_join_is_denied_and_room_unchanged() {
    let (state, _) = community();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    bob.identify(&state, 2, "bob").await;
    alice.join_channel(&state, 8).await;

    bob.send(&state, json!({"type": "join-channel", "payload": 8})).await;
    assert_eq!(bob.error_codes(), vec!["membership-denied"]);
    assert_eq!(state.hub().members(RoomKey::Channel(8)), vec![alice.id]);

    bob.send(&state, json!({"type": "join-server", "payload": 11})).await;
    assert_eq!(bob.error_codes(), vec!["membership-denied"]);
    assert_eq!(state.hub().room_count(), 1);
}

#[tokio::test]
async fn server_scoped_channel_requires_server_membership() {
    let (state, store) = community();
    store.add_user(4, "dave");
    store.add_member(EntityKind::Channel, 7, 4);
    let mut dave = Client::connect(&state);
    dave.identify(&state, 4, "dave").await;

    dave.send(&state, json!({"type": "join-channel", "payload": 7})).await;
    assert_eq!(dave.error_codes(), vec!["membership-denied"]);

    let mut bob = Client::connect(&state);
    bob.identify(&state, 2, "bob").await;
    bob.join_channel(&state, 9).await;
}

#[tokio::test]
async fn joining_twice_is_idempotent() {
    let (state, _) = community();
    let mut alice = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    alice.join_channel(&state, 7).await;
    alice.join_channel(&state, 7).await;
    assert_eq!(state.hub().members(RoomKey::Channel(7)).len(), 1);
}

#[tokio::test]
async fn requests_before_identifying_are_rejected_but_connection_stays() {
    let (state, _) = community();
    let mut anon = Client::connect(&state);

    anon.send(&state, json!({"type": "join-channel", "payload": 7})).await;
    anon.send(&state, json!({"type": "send-message", "payload": {"channelId": 7, "content": "hi"}}))
        .await;
    assert_eq!(anon.error_codes(), vec!["not-bound", "not-bound"]);

    anon.identify(&state, 1, "alice").await;
    anon.join_channel(&state, 7).await;
}

#[tokio::test]
async fn rebinding_as_another_user_is_refused() {
    let (state, _) = community();
    let mut alice = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    alice.identify(&state, 1, "alice").await;

    alice
        .send(&state, json!({"type": "user-joined", "payload": {"id": 2, "username": "bob"}}))
        .await;
    assert_eq!(alice.error_codes(), vec!["duplicate-bind"]);
    assert_eq!(state.hub().identity_of(alice.id).unwrap().id, 1);
}

#[tokio::test]
async fn disconnect_clears_rooms_and_announces_offline_once() {
    let (state, _) = community();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    bob.identify(&state, 2, "bob").await;
    alice.identify(&state, 1, "alice").await;
    let online: Vec<_> = bob
        .drain()
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::UserOnline(u) if u.id == 1))
        .collect();
    assert_eq!(online.len(), 1);

    alice.join_channel(&state, 7).await;
    alice.join_channel(&state, 8).await;
    alice.send(&state, json!({"type": "join-server", "payload": 10})).await;
    assert_eq!(state.hub().room_count(), 3);

    handlers::handle_disconnect(&state, alice.id);
    handlers::handle_disconnect(&state, alice.id);

    assert_eq!(state.hub().room_count(), 0);
    let offline: Vec<_> = bob
        .drain()
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::UserOffline(u) if u.id == 1))
        .collect();
    assert_eq!(offline.len(), 1);
}

#[tokio::test]
async fn unbound_disconnect_announces_nothing() {
    let (state, _) = community();
    let mut bob = Client::connect(&state);
    bob.identify(&state, 2, "bob").await;
    let anon = Client::connect(&state);

    handlers::handle_disconnect(&state, anon.id);
    assert!(bob.drain().is_empty());
    assert_eq!(state.hub().connection_count(), 1);
}

#[tokio::test]
async fn targeted_offer_reaches_only_the_target() {
    let (state, _) = community();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    let mut carol = Client::connect(&state);
    for (client, id, name) in [(&mut alice, 1, "alice"), (&mut bob, 2, "bob"), (&mut carol, 3, "carol")] {
        client.identify(&state, id, name).await;
        client.join_channel(&state, 7).await;
    }
    alice.drain();
    bob.drain();
    carol.drain();

    alice
        .send(
            &state,
            json!({"type": "webrtc-signal", "payload": {
                "signal": {"type": "offer", "sdp": "v=0"},
                "channelId": 7,
                "userId": 1,
                "target": bob.id.to_string(),
            }}),
        )
        .await;

    let to_bob = bob.drain();
    assert_eq!(to_bob.len(), 1);
    match &to_bob[0] {
        ServerMessage::WebrtcSignal(relayed) => {
            assert_eq!(relayed.from, alice.id);
            assert_eq!(relayed.user_id, 1);
            assert_eq!(relayed.signal["sdp"], "v=0");
        }
        other => panic!("expected signal, got {other:?}"),
    }
    assert!(carol.drain().is_empty());
    assert!(alice.drain().is_empty());
}

#[tokio::test]
async fn untargeted_signal_reaches_everyone_but_sender() {
    let (state, _) = community();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    let mut carol = Client::connect(&state);
    for (client, id, name) in [(&mut alice, 1, "alice"), (&mut bob, 2, "bob"), (&mut carol, 3, "carol")] {
        client.identify(&state, id, name).await;
        client.join_channel(&state, 7).await;
    }
    alice.drain();
    bob.drain();
    carol.drain();

    alice
        .send(
            &state,
            json!({"type": "webrtc-signal", "payload": {"signal": {"type": "offer"}, "channelId": 7}}),
        )
        .await;

    assert!(alice.drain().is_empty());
    assert_eq!(bob.drain().len(), 1);
    assert_eq!(carol.drain().len(), 1);
}

#[tokio::test]
async fn signal_from_outside_channel_or_to_departed_target() {
    let (state, _) = community();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    bob.identify(&state, 2, "bob").await;
    bob.join_channel(&state, 7).await;
    alice.drain();

    let offer = json!({"type": "webrtc-signal", "payload": {
        "signal": {"type": "offer"}, "channelId": 7, "target": bob.id.to_string()
    }});
    alice.send(&state, offer).await;
    assert_eq!(alice.error_codes(), vec!["not-in-channel"]);
    assert!(bob.drain().is_empty());

    alice.join_channel(&state, 7).await;
    bob.send(&state, json!({"type": "leave-channel", "payload": 7})).await;
    let answer = json!({"type": "webrtc-signal", "payload": {
        "signal": {"type": "answer", "target": bob.id.to_string()}, "channelId": 7
    }});
    alice.send(&state, answer).await;
    assert!(alice.error_codes().is_empty());
    assert!(bob.drain().is_empty());

    alice
        .send(&state, json!({"type": "webrtc-signal", "payload": {"signal": {"type": "bye"}, "channelId": 7}}))
        .await;
    assert_eq!(alice.error_codes(), vec!["invalid-signal"]);
}

#[tokio::test]
async fn invalid_content_and_spoofed_author_are_not_persisted() {
    let (state, store) = community();
    let mut alice = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    alice.join_channel(&state, 7).await;

    alice
        .send(&state, json!({"type": "send-message", "payload": {"channelId": 7, "content": "   "}}))
        .await;
    alice
        .send(&state, json!({"type": "send-message", "payload": {"channelId": 7, "userId": 2, "content": "hi"}}))
        .await;

    assert_eq!(alice.error_codes(), vec!["invalid-content", "identity-mismatch"]);
    assert!(store.list_by_channel(7).await.unwrap().is_empty());
}

#[tokio::test]
async fn persistence_failure_is_reported_without_broadcast() {
    let (state, store) = community();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    bob.identify(&state, 2, "bob").await;
    alice.join_channel(&state, 7).await;
    bob.join_channel(&state, 7).await;

    store.set_unavailable(true);
    alice
        .send(&state, json!({"type": "send-message", "payload": {"channelId": 7, "content": "lost"}}))
        .await;

    assert_eq!(alice.error_codes(), vec!["persistence"]);
    assert!(bob.new_message_ids().is_empty());

    store.set_unavailable(false);
    assert!(store.list_by_channel(7).await.unwrap().is_empty());
}

#[tokio::test]
async fn member_may_send_without_joining_the_room() {
    let (state, store) = community();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    bob.identify(&state, 2, "bob").await;
    bob.join_channel(&state, 7).await;

    alice
        .send(&state, json!({"type": "send-message", "payload": {"channelId": 7, "content": "drive-by"}}))
        .await;
    assert_eq!(bob.new_message_ids().len(), 1);
    assert!(alice.new_message_ids().is_empty());

    bob.send(&state, json!({"type": "send-message", "payload": {"channelId": 8, "content": "nope"}}))
        .await;
    assert_eq!(bob.error_codes(), vec!["membership-denied"]);
    assert_eq!(store.list_by_channel(8).await.unwrap().len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_are_observed_in_store_order() {
    let (state, store) = community();
    let mut observer = Client::connect(&state);
    observer.identify(&state, 3, "carol").await;
    observer.join_channel(&state, 7).await;

    let mut senders = Vec::new();
    for (id, name) in [(1, "alice"), (2, "bob")] {
        let mut client = Client::connect(&state);
        client.identify(&state, id, name).await;
        client.join_channel(&state, 7).await;
        senders.push(client);
    }

    let mut tasks = Vec::new();
    for sender in &senders {
        let state = state.clone();
        let id = sender.id;
        tasks.push(tokio::spawn(async move {
            for n in 0..40 {
                let frame = json!({"type": "send-message", "payload": {"channelId": 7, "content": format!("m{n}")}});
                handlers::handle_frame(&state, id, &frame.to_string()).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stored: Vec<i64> = store.list_by_channel(7).await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(stored.len(), 80);
    assert_eq!(observer.new_message_ids(), stored);
    for sender in &mut senders {
        assert_eq!(sender.new_message_ids(), stored);
    }
}

#[tokio::test]
async fn late_joiner_sees_a_suffix_and_can_fetch_history() {
    let (state, _) = community();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    bob.identify(&state, 2, "bob").await;
    alice.join_channel(&state, 7).await;

    for content in ["one", "two"] {
        alice
            .send(&state, json!({"type": "send-message", "payload": {"channelId": 7, "content": content}}))
            .await;
    }
    bob.join_channel(&state, 7).await;
    alice
        .send(&state, json!({"type": "send-message", "payload": {"channelId": 7, "content": "three"}}))
        .await;

    let all = alice.new_message_ids();
    let seen = bob.new_message_ids();
    assert_eq!(all.len(), 3);
    assert!(all.ends_with(&seen));
    assert_eq!(seen.len(), 1);

    bob.send(&state, json!({"type": "fetch-history", "payload": {"channelId": 7}}))
        .await;
    match bob.drain().as_slice() {
        [ServerMessage::ChannelHistory { channel_id, messages }] => {
            assert_eq!(*channel_id, 7);
            assert_eq!(messages.iter().map(|m| m.id).collect::<Vec<_>>(), all);
        }
        other => panic!("expected history, got {other:?}"),
    }

    bob.send(&state, json!({"type": "fetch-history", "payload": {"channelId": 8}}))
        .await;
    assert_eq!(bob.error_codes(), vec!["not-in-channel"]);
}

#[tokio::test]
async fn backlogged_member_is_pruned_without_blocking_others() {
    let store = Arc::new(MemoryStore::default());
    for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        store.add_user(id, name);
        store.add_member(EntityKind::Channel, 9, id);
    }
    store.add_channel(9, None);
    let mut config = Config::default();
    config.limits.outbound_queue = 4;
    let state = AppState::new(config, store.clone(), store.clone());

    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    let mut carol = Client::connect(&state);
    for (client, id, name) in [(&mut alice, 1, "alice"), (&mut bob, 2, "bob"), (&mut carol, 3, "carol")] {
        client.identify(&state, id, name).await;
        client.join_channel(&state, 9).await;
    }
    alice.drain();
    carol.drain();
    assert_eq!(state.hub().members(RoomKey::Channel(9)).len(), 3);

    // bob stops reading
    let mut seen_by_carol = Vec::new();
    for n in 0..6 {
        alice
            .send(&state, json!({"type": "send-message", "payload": {"channelId": 9, "content": format!("m{n}")}}))
            .await;
        assert!(alice.error_codes().is_empty());
        seen_by_carol.extend(carol.new_message_ids());
    }

    assert!(!state.hub().occupies(bob.id, RoomKey::Channel(9)));
    assert!(state.hub().occupies(carol.id, RoomKey::Channel(9)));
    let stored: Vec<i64> = store.list_by_channel(9).await.unwrap().iter().map(|m| m.id).collect();
    assert_eq!(stored.len(), 6);
    assert_eq!(seen_by_carol, stored);
    assert!(bob.new_message_ids().len() < stored.len());
}

#[tokio::test]
async fn ice_servers_require_identity() {
    let (state, _) = community();
    let mut alice = Client::connect(&state);
    alice.send(&state, json!({"type": "request-ice-servers"})).await;
    assert_eq!(alice.error_codes(), vec!["not-bound"]);

    alice.identify(&state, 1, "alice").await;
    alice.send(&state, json!({"type": "request-ice-servers"})).await;
    match alice.drain().as_slice() {
        [ServerMessage::IceServers { ice_servers, .. }] => assert!(!ice_servers.is_empty()),
        other => panic!("expected ice servers, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_frames_and_heartbeat() {
    let (state, _) = community();
    let mut alice = Client::connect(&state);
    handlers::handle_frame(&state, alice.id, "not json").await;
    alice.send(&state, json!({"type": "join-channel", "payload": "seven"})).await;
    assert_eq!(alice.error_codes(), vec!["malformed", "malformed"]);

    alice.send(&state, json!({"type": "heartbeat"})).await;
    assert!(matches!(alice.drain().as_slice(), [ServerMessage::HeartbeatAck]));
}

#[tokio::test]
async fn sqlite_backed_relay_round_trip() {
    let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    let alice_id = store.add_user("alice").await.unwrap();
    let bob_id = store.add_user("bob").await.unwrap();
    let server = store.add_server("tofu", alice_id).await.unwrap();
    store.add_server_member(server, bob_id, "member").await.unwrap();
    let channel = store.add_channel("general", Some(server), alice_id).await.unwrap();
    let state = AppState::new(Config::default(), store.clone(), store.clone());

    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    alice.identify(&state, alice_id, "alice").await;
    bob.identify(&state, bob_id, "bob").await;
    alice.join_channel(&state, channel).await;

    bob.send(&state, json!({"type": "join-channel", "payload": channel})).await;
    assert!(bob.error_codes().contains(&"membership-denied".to_string()));

    store.add_channel_member(channel, bob_id).await.unwrap();
    bob.join_channel(&state, channel).await;

    alice
        .send(&state, json!({"type": "send-message", "payload": {"channelId": channel, "content": "hi"}}))
        .await;
    let stored = store.list_by_channel(channel).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].username, "alice");
    assert_eq!(bob.new_message_ids(), vec![stored[0].id]);
}

#[tokio::test]
async fn unbound_connection_is_told_to_identify_before_signal_validation() {
    let (state, _) = community();
    let mut anon = Client::connect(&state);
    anon.send(&state, json!({"type": "webrtc-signal", "payload": {"signal": {"type": "bye"}, "channelId": 7}}))
        .await;
    assert_eq!(anon.error_codes(), vec!["not-bound"]);
}

#[tokio::test]
async fn signaling_is_not_held_behind_a_slow_send() {
    let (state, store) = community();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    bob.identify(&state, 2, "bob").await;
    alice.join_channel(&state, 7).await;
    bob.join_channel(&state, 7).await;
    alice.drain();
    bob.drain();

    store.set_delay(Duration::from_millis(300));
    let pipeline = handlers::Pipeline::spawn(state.clone(), alice.id, 8);
    for content in ["first", "second"] {
        let frame = json!({"type": "send-message", "payload": {"channelId": 7, "content": content}});
        assert!(pipeline.route(&state, alice.id, &frame.to_string()).await);
    }
    let offer = json!({"type": "webrtc-signal", "payload": {"signal": {"type": "offer"}, "channelId": 7}});
    assert!(pipeline.route(&state, alice.id, &offer.to_string()).await);

    // the offer overtakes both sends still waiting on the store
    assert!(matches!(bob.drain().as_slice(), [ServerMessage::WebrtcSignal(_)]));

    let mut contents = Vec::new();
    while contents.len() < 2 {
        match tokio::time::timeout(Duration::from_secs(3), bob.rx.recv()).await {
            Ok(Some(ServerMessage::NewMessage(message))) => contents.push(message.content),
            other => panic!("expected new message, got {other:?}"),
        }
    }
    assert_eq!(contents, vec!["first", "second"]);
}

#[tokio::test]
async fn in_flight_send_completes_after_sender_disconnects() {
    let (state, store) = community();
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    bob.identify(&state, 2, "bob").await;
    alice.join_channel(&state, 7).await;
    bob.join_channel(&state, 7).await;

    store.set_delay(Duration::from_millis(200));
    let sending = {
        let state = state.clone();
        let id = alice.id;
        tokio::spawn(async move {
            let frame = json!({"type": "send-message", "payload": {"channelId": 7, "content": "bye"}});
            handlers::handle_frame(&state, id, &frame.to_string()).await;
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    handlers::handle_disconnect(&state, alice.id);
    sending.await.unwrap();

    store.set_delay(Duration::ZERO);
    let stored = store.list_by_channel(7).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(bob.new_message_ids(), vec![stored[0].id]);
    assert_eq!(state.hub().members(RoomKey::Channel(7)), vec![bob.id]);
}

#[tokio::test]
async fn join_racing_disconnect_leaves_no_trace() {
    let (state, store) = community();
    let mut alice = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;

    store.set_delay(Duration::from_millis(200));
    let joining = {
        let state = state.clone();
        let id = alice.id;
        tokio::spawn(async move {
            handlers::handle_frame(&state, id, &json!({"type": "join-channel", "payload": 7}).to_string())
                .await;
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    handlers::handle_disconnect(&state, alice.id);
    joining.await.unwrap();

    assert_eq!(state.hub().room_count(), 0);
    assert_eq!(state.hub().connection_count(), 0);
    assert!(state.hub().members(RoomKey::Channel(7)).is_empty());
}

#[tokio::test]
async fn slow_store_times_out_without_broadcast() {
    let mut config = Config::default();
    config.limits.persist_timeout_ms = 50;
    let (state, store) = community_with(config);
    let mut alice = Client::connect(&state);
    let mut bob = Client::connect(&state);
    alice.identify(&state, 1, "alice").await;
    bob.identify(&state, 2, "bob").await;
    alice.join_channel(&state, 7).await;
    bob.join_channel(&state, 7).await;

    store.set_delay(Duration::from_millis(300));
    alice
        .send(&state, json!({"type": "send-message", "payload": {"channelId": 7, "content": "late"}}))
        .await;

    assert_eq!(alice.error_codes(), vec!["persistence"]);
    assert!(bob.new_message_ids().is_empty());

    store.set_delay(Duration::ZERO);
    assert!(store.list_by_channel(7).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_sends_across_channels() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("relay.db").display());
    let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
    let state = Arc::new(AppState::new(Config::default(), store.clone(), store.clone()));

    let mut lanes = Vec::new();
    for n in 0..4 {
        let name = format!("user{n}");
        let author = store.add_user(&name).await.unwrap();
        let channel = store.add_channel(&format!("c{n}"), None, author).await.unwrap();
        let mut client = Client::connect(&state);
        client.identify(&state, author, &name).await;
        client.join_channel(&state, channel).await;
        lanes.push((client, channel));
    }

    let mut tasks = Vec::new();
    for (client, channel) in &lanes {
        let state = state.clone();
        let id = client.id;
        let channel = *channel;
        tasks.push(tokio::spawn(async move {
            for n in 0..25 {
                let frame = json!({"type": "send-message", "payload": {"channelId": channel, "content": format!("m{n}")}});
                handlers::handle_frame(&state, id, &frame.to_string()).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for (client, channel) in &mut lanes {
        let frames = client.drain();
        assert!(
            !frames.iter().any(|m| matches!(m, ServerMessage::Error { .. })),
            "{frames:?}"
        );
        let received: Vec<i64> = frames
            .iter()
            .filter_map(|m| match m {
                ServerMessage::NewMessage(message) => Some(message.id),
                _ => None,
            })
            .collect();
        let stored: Vec<i64> = store
            .list_by_channel(*channel)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(stored.len(), 25);
        assert_eq!(received, stored);
    }
}
