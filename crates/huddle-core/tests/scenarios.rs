//! End-to-end behaviour of the engine through its public handle.

use chrono::Duration;
use huddle_core::store::users;
use huddle_core::{
    ConnId, CoreError, Engine, EngineConfig, EngineHandle, EventReceiver, FileArrival, Hub,
    ManualClock, MemoryFileStore, Store, StoredFile, SweepReport,
};
use huddle_protocol::{Action, Event, MessageRecord};
use std::sync::Arc;

struct World {
    engine: EngineHandle,
    store: Store,
    clock: Arc<ManualClock>,
    files: Arc<MemoryFileStore>,
}

struct Client {
    id: String,
    conn: ConnId,
    rx: EventReceiver,
}

impl World {
    async fn new() -> Self {
        let store = Store::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        ));
        let files = Arc::new(MemoryFileStore::new());
        let config = EngineConfig {
            disconnect_grace: None,
            ..EngineConfig::default()
        };
        let (engine, _task) = Engine::new(store.clone(), Arc::new(Hub::new()), files.clone())
            .with_clock(clock.clone())
            .with_config(config)
            .start();
        Self {
            engine,
            store,
            clock,
            files,
        }
    }

    async fn client(&self, id: &str, name: &str) -> Client {
        {
            let mut conn = self.store.pool().acquire().await.unwrap();
            users::insert(&mut conn, id, name, 0).await.unwrap();
        }
        let (conn, rx) = self.engine.connect();
        self.engine
            .dispatch(
                conn,
                Action::Identify {
                    user_id: id.to_string(),
                },
            )
            .await
            .unwrap();
        let mut client = Client {
            id: id.to_string(),
            conn,
            rx,
        };
        client.drain();
        client
    }

    async fn act(&self, client: &Client, action: Action) -> Result<(), CoreError> {
        self.engine.dispatch(client.conn, action).await
    }

    async fn create_room(&self, client: &Client) -> String {
        self.act(client, Action::join(&client.id, None)).await.unwrap();
        self.room_of(&client.id).await.unwrap()
    }

    async fn join(&self, client: &Client, room: &str) {
        self.act(client, Action::join(&client.id, Some(room.to_string())))
            .await
            .unwrap();
    }

    async fn send(&self, client: &Client, text: &str) -> MessageRecord {
        self.act(client, Action::send(&client.id, text)).await.unwrap();
        let mut conn = self.store.pool().acquire().await.unwrap();
        let (id,): (i64,) = sqlx::query_as("SELECT MAX(id) FROM messages")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        huddle_core::store::messages::find(&mut conn, id)
            .await
            .unwrap()
            .unwrap()
            .into_record()
    }

    async fn room_of(&self, user: &str) -> Option<String> {
        let mut conn = self.store.pool().acquire().await.unwrap();
        users::find(&mut conn, user).await.unwrap().unwrap().room_id
    }

    async fn is_host(&self, user: &str) -> bool {
        let mut conn = self.store.pool().acquire().await.unwrap();
        users::find(&mut conn, user).await.unwrap().unwrap().is_host
    }

    /// Every room has members and exactly one of them hosts.
    async fn assert_host_invariant(&self) {
        let mut conn = self.store.pool().acquire().await.unwrap();
        let rooms: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT r.id, COUNT(u.id), COALESCE(SUM(u.is_host), 0) \
             FROM rooms r LEFT JOIN users u ON u.room_id = r.id GROUP BY r.id",
        )
        .fetch_all(&mut *conn)
        .await
        .unwrap();
        for (room, members, hosts) in rooms {
            assert!(members > 0, "{room} has no members");
            assert_eq!(hosts, 1, "{room} has {hosts} hosts");
        }
    }

    async fn count(&self, sql: &str) -> i64 {
        let mut conn = self.store.pool().acquire().await.unwrap();
        let (n,): (i64,) = sqlx::query_as(sql).fetch_one(&mut *conn).await.unwrap();
        n
    }
}

impl Client {
    fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    /// Latest full room state received, if any.
    fn last_room_data(&mut self) -> Option<Event> {
        self.drain()
            .into_iter()
            .filter(|e| matches!(e, Event::RoomData { .. }))
            .last()
    }
}

fn system_messages(events: &[Event], text: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::NewMessage { message } if message.content == text))
        .count()
}

#[tokio::test]
async fn joiner_receives_history_and_members() {
    let w = World::new().await;
    let a = w.client("a", "Alice").await;
    let mut b = w.client("b", "Bob").await;

    let room = w.create_room(&a).await;
    w.send(&a, "hi").await;
    w.join(&b, &room).await;

    let Some(Event::RoomData {
        room_id,
        members,
        messages,
        ..
    }) = b.last_room_data()
    else {
        panic!("no room data");
    };
    assert_eq!(room_id, room);
    assert!(messages.iter().any(|m| m.content == "hi"));
    assert_eq!(messages.last().unwrap().content, "Bob joined the room.");

    let roster: Vec<_> = members.iter().map(|m| (m.id.as_str(), m.is_host)).collect();
    assert_eq!(roster, vec![("a", true), ("b", false)]);
    w.assert_host_invariant().await;
}

#[tokio::test]
async fn host_leaving_promotes_earliest_member_once() {
    let w = World::new().await;
    let a = w.client("a", "Alice").await;
    let mut b = w.client("b", "Bob").await;
    let mut c = w.client("c", "Cleo").await;

    let room = w.create_room(&a).await;
    w.clock.advance(Duration::seconds(1));
    w.join(&c, &room).await;
    w.clock.advance(Duration::seconds(1));
    w.join(&b, &room).await;
    b.drain();
    c.drain();

    w.act(&a, Action::leave("a")).await.unwrap();

    assert!(w.is_host("c").await);
    assert!(!w.is_host("b").await);
    assert_eq!(w.room_of("a").await, None);

    let seen_by_b = b.drain();
    let seen_by_c = c.drain();
    assert_eq!(system_messages(&seen_by_b, "Cleo is now the Host."), 1);
    assert_eq!(system_messages(&seen_by_c, "Cleo is now the Host."), 1);
    assert_eq!(system_messages(&seen_by_b, "Alice left the room."), 1);
    w.assert_host_invariant().await;
}

#[tokio::test]
async fn succession_ties_break_by_user_id() {
    let w = World::new().await;
    let host = w.client("h", "Hana").await;
    let zed = w.client("zed", "Zed").await;
    let amy = w.client("amy", "Amy").await;

    let room = w.create_room(&host).await;
    w.clock.advance(Duration::seconds(1));
    w.join(&zed, &room).await;
    w.join(&amy, &room).await;

    w.act(&host, Action::leave("h")).await.unwrap();
    assert!(w.is_host("amy").await);
    assert!(!w.is_host("zed").await);
}

#[tokio::test]
async fn last_member_leaving_destroys_room() {
    let w = World::new().await;
    let a = w.client("a", "Alice").await;
    let b = w.client("b", "Bob").await;

    let room = w.create_room(&a).await;
    w.join(&b, &room).await;
    w.send(&a, "one").await;

    w.act(&a, Action::leave("a")).await.unwrap();
    w.act(&b, Action::leave("b")).await.unwrap();

    assert_eq!(w.count("SELECT COUNT(*) FROM rooms").await, 0);
    assert_eq!(w.count("SELECT COUNT(*) FROM messages").await, 0);
    assert_eq!(w.files.released(), vec![room.clone()]);
    assert!(w.engine.hub().room_connections(&room).is_empty());

    let err = w
        .act(&b, Action::join("b", Some(room)))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn member_cannot_kick_host() {
    let w = World::new().await;
    let a = w.client("a", "Alice").await;
    let mut b = w.client("b", "Bob").await;

    let room = w.create_room(&a).await;
    w.join(&b, &room).await;
    b.drain();
    let before = w.count("SELECT COUNT(*) FROM messages").await;

    let err = w
        .act(
            &b,
            Action::KickMember {
                action_user_id: "b".into(),
                target_user_id: "a".into(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "You cannot kick the Host.");

    assert!(w.is_host("a").await);
    assert_eq!(w.room_of("a").await, Some(room));
    assert_eq!(w.count("SELECT COUNT(*) FROM messages").await, before);
    assert_eq!(
        b.drain(),
        vec![Event::error(403, "You cannot kick the Host.")]
    );
}

#[tokio::test]
async fn kicked_member_is_told_directly() {
    let w = World::new().await;
    let a = w.client("a", "Alice").await;
    let mut b = w.client("b", "Bob").await;
    let mut c = w.client("c", "Cleo").await;

    let room = w.create_room(&a).await;
    w.join(&b, &room).await;
    w.join(&c, &room).await;
    b.drain();
    c.drain();

    w.act(
        &a,
        Action::KickMember {
            action_user_id: "a".into(),
            target_user_id: "b".into(),
        },
    )
    .await
    .unwrap();

    let to_b = b.drain();
    assert_eq!(
        to_b,
        vec![Event::UserKicked {
            user_id: "b".into(),
            room_id: room.clone()
        }]
    );
    let to_c = c.drain();
    assert!(!to_c.iter().any(|e| matches!(e, Event::UserKicked { .. })));
    assert_eq!(system_messages(&to_c, "Bob was kicked by Alice."), 1);
    assert_eq!(w.room_of("b").await, None);

    let err = w
        .act(
            &a,
            Action::KickMember {
                action_user_id: "a".into(),
                target_user_id: "a".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn invite_reaches_only_the_paired_device() {
    let w = World::new().await;
    let a = w.client("a", "Alice").await;
    let mut phone = w.client("phone", "Phone").await;
    let mut b = w.client("b", "Bob").await;

    let room = w.create_room(&a).await;
    w.join(&b, &room).await;
    b.drain();

    w.act(
        &a,
        Action::InvitePairedDevice {
            host_id: "a".into(),
            target_token: "pairing:phone".into(),
        },
    )
    .await
    .unwrap();

    assert_eq!(
        phone.drain(),
        vec![Event::ForceJoinRoom {
            target_user_id: "phone".into(),
            room_id: room.clone()
        }]
    );
    assert!(b.drain().is_empty());
    assert_eq!(w.room_of("phone").await, None);

    let err = w
        .act(
            &b,
            Action::InvitePairedDevice {
                host_id: "b".into(),
                target_token: "pairing:phone".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));
}

#[tokio::test]
async fn soft_delete_and_restore_round() {
    let w = World::new().await;
    let mut a = w.client("a", "Alice").await;
    let b = w.client("b", "Bob").await;
    let mut c = w.client("c", "Cleo").await;

    let room = w.create_room(&a).await;
    w.join(&b, &room).await;
    w.join(&c, &room).await;
    let m = w.send(&b, "regret").await;
    a.drain();
    c.drain();

    w.act(
        &b,
        Action::SoftDeleteMessages {
            user_id: "b".into(),
            message_ids: vec![m.id],
        },
    )
    .await
    .unwrap();
    let deleted = Event::MessagesDeleted {
        message_ids: vec![m.id],
    };
    assert_eq!(a.drain(), vec![deleted.clone()]);
    assert_eq!(c.drain(), vec![deleted]);

    // Soft delete again changes nothing and says nothing.
    w.act(
        &b,
        Action::SoftDeleteMessages {
            user_id: "b".into(),
            message_ids: vec![m.id],
        },
    )
    .await
    .unwrap();
    assert!(c.drain().is_empty());

    // A fresh resync marks the message: the host renders it, members do not.
    w.join(&c, &room).await;
    let Some(Event::RoomData { messages, .. }) = c.last_room_data() else {
        panic!("no room data");
    };
    let record = messages.iter().find(|r| r.id == m.id).unwrap();
    assert!(record.is_deleted());
    assert!(record.visible_to(true));
    assert!(!record.visible_to(false));

    w.act(
        &a,
        Action::RestoreMessages {
            user_id: "a".into(),
            message_ids: vec![m.id],
        },
    )
    .await
    .unwrap();
    assert_eq!(
        c.drain(),
        vec![Event::MessagesRestored {
            message_ids: vec![m.id]
        }]
    );

    w.join(&c, &room).await;
    let Some(Event::RoomData { messages, .. }) = c.last_room_data() else {
        panic!("no room data");
    };
    assert!(messages
        .iter()
        .find(|r| r.id == m.id)
        .unwrap()
        .visible_to(false));
}

#[tokio::test]
async fn hard_deleted_messages_stay_gone() {
    let w = World::new().await;
    let a = w.client("a", "Alice").await;
    let mut b = w.client("b", "Bob").await;

    let room = w.create_room(&a).await;
    w.join(&b, &room).await;
    let m = w.send(&b, "bye").await;
    b.drain();

    w.act(
        &a,
        Action::SoftDeleteMessages {
            user_id: "a".into(),
            message_ids: vec![m.id],
        },
    )
    .await
    .unwrap();
    assert_eq!(
        b.drain(),
        vec![Event::MessagesHardDeleted {
            message_ids: vec![m.id]
        }]
    );

    w.act(
        &a,
        Action::RestoreMessages {
            user_id: "a".into(),
            message_ids: vec![m.id],
        },
    )
    .await
    .unwrap();
    w.act(
        &b,
        Action::SoftDeleteMessages {
            user_id: "b".into(),
            message_ids: vec![m.id],
        },
    )
    .await
    .unwrap();
    assert!(b.drain().is_empty());
    assert_eq!(w.count("SELECT COUNT(*) FROM messages WHERE content = 'bye'").await, 0);
}

#[tokio::test]
async fn pagination_stays_below_cursor() {
    let w = World::new().await;
    let mut a = w.client("a", "Alice").await;
    let room = w.create_room(&a).await;

    let mut sent = Vec::new();
    for i in 0..45 {
        sent.push(w.send(&a, &format!("m{i}")).await);
        if i % 3 == 0 {
            w.clock.advance(Duration::milliseconds(1));
        }
    }
    a.drain();

    let mut cursor = sent.last().unwrap().clone();
    let mut seen = 0;
    loop {
        w.act(
            &a,
            Action::LoadMoreMessages {
                room_id: room.clone(),
                before_id: cursor.id,
                limit: Some(10),
            },
        )
        .await
        .unwrap();
        let page = match a.drain().pop() {
            Some(Event::MoreMessagesLoaded { messages, .. }) => messages,
            other => panic!("unexpected {other:?}"),
        };
        for record in &page {
            assert!(record.order_key() < cursor.order_key());
        }
        assert!(page.windows(2).all(|pair| pair[0].order_key() < pair[1].order_key()));
        seen += page.len();
        if page.len() < 10 {
            break;
        }
        cursor = page[0].clone();
    }
    // 44 older texts plus "Room created."
    assert_eq!(seen, 45);

    let outsider = w.client("x", "Xavier").await;
    let err = w
        .act(
            &outsider,
            Action::LoadMoreMessages {
                room_id: room,
                before_id: cursor.id,
                limit: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));
}

#[tokio::test]
async fn sweep_expires_only_old_deletions() {
    let w = World::new().await;
    let a = w.client("a", "Alice").await;
    let b = w.client("b", "Bob").await;
    let mut c = w.client("c", "Cleo").await;

    let room = w.create_room(&a).await;
    w.join(&b, &room).await;
    w.join(&c, &room).await;

    let upload = StoredFile {
        url: format!("/uploads/{room}/1-old.pdf"),
        size: 2048,
        thumbnail: None,
    };
    let old = w
        .engine
        .file_arrived(FileArrival {
            user_id: "b".into(),
            room_id: room.clone(),
            file_name: "old.pdf".into(),
            file: upload.clone(),
            client_id: Some("up-1".into()),
        })
        .await
        .unwrap();
    let recent = w.send(&b, "recent").await;

    let soft_delete = |id| Action::SoftDeleteMessages {
        user_id: "b".into(),
        message_ids: vec![id],
    };
    w.act(&b, soft_delete(old.id)).await.unwrap();
    w.clock.advance(Duration::days(7));
    w.act(&b, soft_delete(recent.id)).await.unwrap();
    w.clock.advance(Duration::days(1));
    c.drain();

    let report = w.engine.sweep().await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            examined: 1,
            removed: 1,
            failed: 0
        }
    );
    assert_eq!(w.files.removed(), vec![upload.url]);
    assert_eq!(
        c.drain(),
        vec![Event::MessagesHardDeleted {
            message_ids: vec![old.id]
        }]
    );
    assert_eq!(w.count("SELECT COUNT(*) FROM messages WHERE deleted_at IS NOT NULL").await, 1);

    assert_eq!(w.engine.sweep().await.unwrap(), SweepReport::default());
}

#[tokio::test]
async fn upload_from_outsider_is_discarded() {
    let w = World::new().await;
    let a = w.client("a", "Alice").await;
    let _outsider = w.client("x", "Xavier").await;
    let room = w.create_room(&a).await;

    let err = w
        .engine
        .file_arrived(FileArrival {
            user_id: "x".into(),
            room_id: room.clone(),
            file_name: "virus.txt".into(),
            file: StoredFile {
                url: format!("/uploads/{room}/1-virus.txt"),
                size: 1,
                thumbnail: Some(format!("/uploads/{room}/thumb.png")),
            },
            client_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));
    assert_eq!(w.files.removed().len(), 2);

    w.engine.ensure_member("a", room.clone()).await.unwrap();
    let err = w.engine.ensure_member("x", room.clone()).await.unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));
    let err = w.engine.ensure_member("nobody", room).await.unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));
}

#[tokio::test]
async fn swapping_rooms_settles_the_old_room() {
    let w = World::new().await;
    let a = w.client("a", "Alice").await;
    let mut b = w.client("b", "Bob").await;
    let c = w.client("c", "Cleo").await;

    let first = w.create_room(&a).await;
    w.join(&b, &first).await;
    let second = w.create_room(&c).await;

    w.join(&a, &second).await;

    assert_eq!(w.room_of("a").await, Some(second.clone()));
    assert!(w.is_host("b").await);
    assert!(!w.is_host("a").await);
    assert_eq!(w.engine.hub().room_connections(&first), vec![b.conn]);

    let seen = b.drain();
    assert_eq!(system_messages(&seen, "Bob is now the Host."), 1);
    w.assert_host_invariant().await;

    // Rejoining the current room is a plain resync.
    let before = w.count("SELECT COUNT(*) FROM messages").await;
    w.join(&a, &second).await;
    assert_eq!(w.count("SELECT COUNT(*) FROM messages").await, before);
}

#[tokio::test]
async fn rename_is_broadcast_to_the_room() {
    let w = World::new().await;
    let a = w.client("a", "Alice").await;
    let mut b = w.client("b", "Bob").await;
    let room = w.create_room(&a).await;
    w.join(&b, &room).await;
    b.drain();

    let renamed = w.engine.rename("a", "Alicia").await.unwrap();
    assert_eq!(b.drain(), vec![Event::UserUpdated { user: renamed }]);
}

#[tokio::test]
async fn rebinding_connection_leaves_previous_room() {
    let w = World::new().await;
    let mut a = w.client("a", "Alice").await;
    let c = w.client("c", "Cleo").await;
    let _b = w.client("b", "Bob").await;
    let room = w.create_room(&a).await;
    w.join(&c, &room).await;

    w.engine
        .dispatch(
            a.conn,
            Action::Identify {
                user_id: "b".to_string(),
            },
        )
        .await
        .unwrap();
    a.drain();
    assert_eq!(w.engine.hub().room_of(a.conn), None);
    assert_eq!(w.engine.hub().user_of(a.conn).as_deref(), Some("b"));

    w.send(&c, "for members only").await;
    let leaked = a.drain();
    assert_eq!(system_messages(&leaked, "for members only"), 0);
    assert!(leaked.is_empty(), "{leaked:?}");

    // Alice is still a member, only the connection moved on.
    assert_eq!(w.room_of("a").await, Some(room));
}
