//! Live event fan-out and the durable notification inbox.

use std::sync::Arc;
use std::time::Duration;

use civic_db::{run_migrations, DbRuntimeSettings};
use civic_hub::PubSubHub;
use civic_identity::{Identity, MemoryIdentityStore};
use civic_notify::NOTIFICATION_EVENT;
use civic_server::events::{COMMENT_ADDED, STATUS_CHANGED, TICKET_NEW};
use civic_server::{
    Actor, NewTicketRequest, RandomAssignment, ServiceError, TicketService, TransitionCommand,
};
use civic_types::{Role, TicketStatus};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Harness {
    service: TicketService,
    hub: PubSubHub,
    _dir: TempDir,
}

fn setup() -> Harness {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("civic.db");
    let pool = civic_db::create_pool(
        path.to_str().expect("temp path is utf-8"),
        DbRuntimeSettings::default(),
    )
    .expect("failed to create pool");
    {
        let conn = pool.get().expect("failed to get connection");
        run_migrations(&conn).expect("failed to run migrations");
    }

    let identities = MemoryIdentityStore::with_identities([
        Identity::new("resident-a", Role::Resident, true),
        Identity::new("resident-b", Role::Resident, true),
        Identity::new("staff-1", Role::Staff, true),
    ]);
    let hub = PubSubHub::new();
    let service = TicketService::new(
        pool,
        Arc::new(identities),
        Arc::new(RandomAssignment::new(Default::default())),
        hub.clone(),
    );
    Harness {
        service,
        hub,
        _dir: dir,
    }
}

fn request() -> NewTicketRequest {
    NewTicketRequest {
        title: "Broken streetlight".to_string(),
        description: "Light at 5th and Elm has been out for a week.".to_string(),
        category: "lighting".to_string(),
        priority: None,
    }
}

/// Reads frames until one with `event` arrives on `topic`.
async fn expect_event(rx: &mut mpsc::Receiver<String>, event: &str, topic: &str) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {event} on {topic}"))
            .expect("channel closed");
        let json: Value = serde_json::from_str(&frame).expect("frame is json");
        if json["event"] == event && json["topic"] == topic {
            return json;
        }
    }
}

fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).expect("frame is json"));
    }
    frames
}

#[tokio::test]
async fn resident_follows_ticket_from_creation_to_resolution() {
    let h = setup();
    let resident = Actor::new("resident-a", Role::Resident);
    let staff = Actor::new("staff-1", Role::Staff);

    let (staff_tx, mut staff_rx) = mpsc::channel(64);
    h.hub
        .connect("staff-1", Role::Staff, staff_tx)
        .await
        .expect("staff connects");
    let (resident_tx, mut resident_rx) = mpsc::channel(64);
    let resident_conn = h
        .hub
        .connect("resident-a", Role::Resident, resident_tx)
        .await
        .expect("resident connects");

    let ticket = h
        .service
        .create_ticket(&resident, request())
        .await
        .expect("create");

    let announced = expect_event(&mut staff_rx, TICKET_NEW, "role:staff-or-admin").await;
    assert_eq!(announced["payload"]["ticket"]["id"], ticket.id.as_str());

    let receipt = expect_event(&mut resident_rx, NOTIFICATION_EVENT, "user:resident-a").await;
    assert_eq!(receipt["payload"]["title"], "Ticket submitted");
    assert_eq!(receipt["payload"]["relatedEntity"]["id"], ticket.id.as_str());

    h.service
        .subscribe_ticket(&resident, resident_conn, &ticket.id)
        .await
        .expect("owner may watch own ticket");

    h.service
        .transition(
            &staff,
            TransitionCommand {
                ticket_id: ticket.id.clone(),
                target: TicketStatus::InProgress,
                notes: Some("Crew dispatched".to_string()),
                expected_status: Some(TicketStatus::Pending),
            },
        )
        .await
        .expect("start work");

    let topic = format!("ticket:{}", ticket.id);
    let changed = expect_event(&mut resident_rx, STATUS_CHANGED, &topic).await;
    assert_eq!(changed["payload"]["previousStatus"], "pending");
    assert_eq!(changed["payload"]["status"], "in-progress");
    assert_eq!(changed["payload"]["changedBy"], "staff-1");
    assert_eq!(changed["payload"]["notes"], "Crew dispatched");
}

#[tokio::test]
async fn residents_cannot_watch_other_tickets() {
    let h = setup();
    let owner = Actor::new("resident-a", Role::Resident);
    let other = Actor::new("resident-b", Role::Resident);

    let ticket = h
        .service
        .create_ticket(&owner, request())
        .await
        .expect("create");

    let (tx, _rx) = mpsc::channel(8);
    let conn = h
        .hub
        .connect("resident-b", Role::Resident, tx)
        .await
        .expect("connect");

    let err = h
        .service
        .subscribe_ticket(&other, conn, &ticket.id)
        .await
        .expect_err("not the owner");
    assert!(matches!(err, ServiceError::Forbidden(_)));
    assert_eq!(
        h.hub
            .subscriber_count(&civic_types::Topic::ticket(&ticket.id))
            .await,
        0
    );
}

#[tokio::test]
async fn internal_comments_stay_on_the_staff_topic() {
    let h = setup();
    let owner = Actor::new("resident-a", Role::Resident);
    let staff = Actor::new("staff-1", Role::Staff);

    let ticket = h
        .service
        .create_ticket(&owner, request())
        .await
        .expect("create");

    let (resident_tx, mut resident_rx) = mpsc::channel(64);
    let resident_conn = h
        .hub
        .connect("resident-a", Role::Resident, resident_tx)
        .await
        .expect("connect");
    h.service
        .subscribe_ticket(&owner, resident_conn, &ticket.id)
        .await
        .expect("subscribe");

    let (staff_tx, mut staff_rx) = mpsc::channel(64);
    h.hub
        .connect("staff-1", Role::Staff, staff_tx)
        .await
        .expect("connect");

    h.service
        .add_comment(&staff, &ticket.id, "Pole needs replacing.", true)
        .await
        .expect("internal note");

    let note = expect_event(&mut staff_rx, COMMENT_ADDED, "role:staff-or-admin").await;
    assert_eq!(note["payload"]["comment"]["isInternal"], true);

    // Publishing completes before the command returns.
    let leaked: Vec<Value> = drain(&mut resident_rx)
        .into_iter()
        .filter(|frame| frame["event"] == COMMENT_ADDED)
        .collect();
    assert!(leaked.is_empty(), "resident saw {leaked:?}");

    let inbox = h
        .service
        .get_notifications(&owner, None)
        .await
        .expect("inbox");
    assert!(inbox.iter().all(|n| n.title != "New internal note"));
}

#[tokio::test]
async fn notifications_survive_a_closed_hub() {
    let h = setup();
    let owner = Actor::new("resident-a", Role::Resident);
    let staff = Actor::new("staff-1", Role::Staff);

    h.hub.close().await;

    let ticket = h
        .service
        .create_ticket(&owner, request())
        .await
        .expect("delivery failures do not fail the command");

    let inbox = h
        .service
        .get_notifications(&owner, None)
        .await
        .expect("inbox");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].title, "Ticket submitted");
    assert!(!inbox[0].is_read);
    assert_eq!(
        inbox[0].related_entity.as_ref().map(|r| r.id.as_str()),
        Some(ticket.id.as_str())
    );

    let staff_inbox = h
        .service
        .get_notifications(&staff, Some(false))
        .await
        .expect("inbox");
    assert_eq!(staff_inbox.len(), 1);
    assert_eq!(staff_inbox[0].title, "New ticket assigned");
}

#[tokio::test]
async fn failed_command_leaves_no_notification() {
    let h = setup();
    let owner = Actor::new("resident-a", Role::Resident);
    let staff = Actor::new("staff-1", Role::Staff);

    let ticket = h
        .service
        .create_ticket(&owner, request())
        .await
        .expect("create");
    let before = h
        .service
        .get_notifications(&owner, None)
        .await
        .expect("inbox")
        .len();

    h.service
        .transition(
            &staff,
            TransitionCommand {
                ticket_id: ticket.id.clone(),
                target: TicketStatus::Resolved,
                notes: None,
                expected_status: None,
            },
        )
        .await
        .expect_err("pending -> resolved is not an edge");

    let after = h
        .service
        .get_notifications(&owner, None)
        .await
        .expect("inbox")
        .len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn inbox_is_scoped_to_its_owner() {
    let h = setup();
    let owner = Actor::new("resident-a", Role::Resident);
    let other = Actor::new("resident-b", Role::Resident);
    let staff = Actor::new("staff-1", Role::Staff);

    let ticket = h
        .service
        .create_ticket(&owner, request())
        .await
        .expect("create");
    h.service
        .add_comment(&staff, &ticket.id, "Looking into it.", false)
        .await
        .expect("comment");

    let inbox = h
        .service
        .get_notifications(&owner, None)
        .await
        .expect("inbox");
    assert_eq!(inbox.len(), 2);
    let first = inbox[0].id.clone();

    let err = h
        .service
        .mark_read(&other, &first)
        .await
        .expect_err("someone else's notification");
    assert!(matches!(
        err,
        ServiceError::NotFound {
            entity: "notification",
            ..
        }
    ));
    let err = h
        .service
        .delete_notification(&other, &first)
        .await
        .expect_err("someone else's notification");
    assert!(matches!(err, ServiceError::NotFound { .. }));
    assert!(h
        .service
        .get_notifications(&other, None)
        .await
        .expect("inbox")
        .is_empty());

    h.service.mark_read(&owner, &first).await.expect("mark read");
    let unread = h
        .service
        .get_notifications(&owner, Some(false))
        .await
        .expect("unread");
    assert_eq!(unread.len(), 1);

    assert_eq!(h.service.mark_all_read(&owner).await.expect("mark all"), 1);
    assert_eq!(h.service.mark_all_read(&owner).await.expect("mark all"), 0);

    h.service
        .delete_notification(&owner, &first)
        .await
        .expect("delete");
    assert_eq!(
        h.service
            .get_notifications(&owner, None)
            .await
            .expect("inbox")
            .len(),
        1
    );
}
