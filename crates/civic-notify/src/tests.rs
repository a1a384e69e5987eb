use civic_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use civic_hub::PubSubHub;
use civic_types::{NotificationKind, Role};
use rusqlite::Connection;
use tokio::sync::mpsc;

use crate::*;

fn test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    run_migrations(&conn).expect("migrations should succeed");
    conn
}

fn file_pool() -> (tempfile::TempDir, DbPool) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("notify.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings::default(),
    )
    .expect("pool");
    let conn = pool.get().expect("conn");
    run_migrations(&conn).expect("migrations");
    (dir, pool)
}

fn sample(recipient: &str) -> NewNotification {
    NewNotification::new(
        recipient,
        "Ticket updated",
        "Your ticket is now in progress",
        NotificationKind::Info,
    )
    .about_ticket("t-1")
}

#[test]
fn create_and_list_newest_first() {
    let conn = test_db();
    let first = create(&conn, &sample("res-1")).expect("create");
    let second = create(&conn, &sample("res-1")).expect("create");
    create(&conn, &sample("res-2")).expect("create");

    let inbox = list(&conn, "res-1", None).expect("list");
    assert_eq!(inbox.len(), 2);
    assert!(inbox.iter().all(|n| n.recipient_id == "res-1"));
    assert!(inbox.iter().any(|n| n.id == first.id));
    assert!(inbox.iter().any(|n| n.id == second.id));
    assert!(inbox[0].created_at >= inbox[1].created_at);

    let stored = get(&conn, "res-1", &first.id).expect("get");
    assert_eq!(stored, first);
    assert!(!stored.is_read);
    assert_eq!(
        stored.related_entity,
        Some(RelatedEntity::ticket("t-1"))
    );
}

#[test]
fn read_filter_and_mark_all() {
    let conn = test_db();
    let a = create(&conn, &sample("res-1")).expect("create");
    create(&conn, &sample("res-1")).expect("create");
    create(&conn, &sample("res-1")).expect("create");

    mark_read(&conn, "res-1", &a.id).expect("mark");
    mark_read(&conn, "res-1", &a.id).expect("marking twice is fine");
    assert_eq!(list(&conn, "res-1", Some(true)).expect("read").len(), 1);
    assert_eq!(list(&conn, "res-1", Some(false)).expect("unread").len(), 2);

    assert_eq!(mark_all_read(&conn, "res-1").expect("mark all"), 2);
    assert_eq!(mark_all_read(&conn, "res-1").expect("again"), 0);
    assert!(list(&conn, "res-1", Some(false)).expect("unread").is_empty());
}

#[test]
fn other_users_notifications_look_missing() {
    let conn = test_db();
    let theirs = create(&conn, &sample("res-2")).expect("create");

    assert!(matches!(
        get(&conn, "res-1", &theirs.id),
        Err(NotifyError::NotFound(_))
    ));
    assert!(matches!(
        mark_read(&conn, "res-1", &theirs.id),
        Err(NotifyError::NotFound(_))
    ));
    assert!(matches!(
        delete(&conn, "res-1", &theirs.id),
        Err(NotifyError::NotFound(_))
    ));

    delete(&conn, "res-2", &theirs.id).expect("owner can delete");
    assert!(list(&conn, "res-2", None).expect("list").is_empty());
}

#[test]
fn persist_inside_rolled_back_transaction_leaves_nothing() {
    let mut conn = test_db();
    let dispatcher = NotificationDispatcher::new(PubSubHub::new());
    {
        let tx = conn.transaction().expect("tx");
        dispatcher.persist(&tx, &sample("res-1")).expect("persist");
    }
    assert!(list(&conn, "res-1", None).expect("list").is_empty());
}

#[tokio::test]
async fn notify_pushes_to_live_connection() {
    let (_dir, pool) = file_pool();
    let hub = PubSubHub::new();
    let (tx, mut rx) = mpsc::channel(4);
    hub.connect("res-1", Role::Resident, tx).await.expect("connect");

    let dispatcher = NotificationDispatcher::new(hub);
    let stored = dispatcher
        .notify(&pool, sample("res-1"))
        .await
        .expect("notify");

    let raw = rx.recv().await.expect("push");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(value["event"], NOTIFICATION_EVENT);
    assert_eq!(value["topic"], "user:res-1");
    assert_eq!(value["payload"]["id"], stored.id.as_str());
    assert_eq!(value["payload"]["relatedEntity"]["entityType"], "ticket");
}

#[tokio::test]
async fn notification_survives_closed_hub() {
    let (_dir, pool) = file_pool();
    let hub = PubSubHub::new();
    hub.close().await;

    let dispatcher = NotificationDispatcher::new(hub);
    let stored = dispatcher
        .notify(&pool, sample("res-1"))
        .await
        .expect("storage succeeds even though the push fails");

    let conn = pool.get().expect("conn");
    let inbox = list(&conn, "res-1", None).expect("list");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].id, stored.id);
}

#[tokio::test]
async fn deliver_without_connections_is_silent() {
    let dispatcher = NotificationDispatcher::new(PubSubHub::new());
    let conn = test_db();
    let stored = dispatcher.persist(&conn, &sample("res-9")).expect("persist");
    assert_eq!(dispatcher.deliver(&stored).await, 0);
}
