use super::*;
use storage::CredentialStore;

use crate::{
    session::ConnectionState,
    test_support::{credential, FakeConnection, Harness},
};

const ALICE: &str = "@alice:example.org";
const BOB: &str = "@bob:example.org";

#[tokio::test]
async fn get_returns_the_same_session_instance() {
    let harness = Harness::new().await;
    let registry = harness.registry();

    let first = registry.get(&UserId::from(ALICE)).await.expect("first");
    let second = registry.get(&UserId::from(ALICE)).await.expect("second");

    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn get_creates_a_store_record_on_first_use() {
    let harness = Harness::new().await;
    let registry = harness.registry();

    registry.get(&UserId::from(ALICE)).await.expect("session");

    let stored = harness
        .storage
        .get_user(&UserId::from(ALICE))
        .await
        .expect("load")
        .expect("record created");
    assert_eq!(stored.session, None);
    assert_eq!(stored.management_room, None);
}

#[tokio::test]
async fn concurrent_first_get_constructs_one_session() {
    let harness = Harness::new().await;
    let registry = harness.registry();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get(&UserId::from(ALICE)).await })
        })
        .collect();
    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await.expect("task").expect("session"));
    }

    assert!(sessions.iter().all(|session| Arc::ptr_eq(session, &sessions[0])));
    assert_eq!(
        harness.storage.all_users().await.expect("list").len(),
        1
    );
}

#[tokio::test]
async fn stored_management_room_is_registered_on_load() {
    let harness = Harness::new().await;
    let room = RoomId::from("!manage:example.org");
    let mut record = UserRecord::new(UserId::from(ALICE));
    record.management_room = Some(room.clone());
    harness.storage.insert_user(&record).await.expect("seed");
    let registry = harness.registry();

    let session = registry.get(&UserId::from(ALICE)).await.expect("session");

    let by_room = registry.get_by_management_room(&room).await.expect("by room");
    assert!(Arc::ptr_eq(&by_room, &session));
}

#[tokio::test]
async fn management_room_moves_to_the_new_owner() {
    let harness = Harness::new().await;
    let registry = harness.registry();
    let room = RoomId::from("!shared:example.org");
    let alice = registry.get(&UserId::from(ALICE)).await.expect("alice");
    let bob = registry.get(&UserId::from(BOB)).await.expect("bob");

    alice.set_management_room(room.clone()).await;
    bob.set_management_room(room.clone()).await;

    assert_eq!(alice.management_room().await, None);
    assert_eq!(bob.management_room().await, Some(room.clone()));
    let owner = registry.get_by_management_room(&room).await.expect("owner");
    assert!(Arc::ptr_eq(&owner, &bob));

    let stored_alice = harness
        .storage
        .get_user(&UserId::from(ALICE))
        .await
        .expect("load")
        .expect("alice");
    assert_eq!(stored_alice.management_room, None);
}

#[tokio::test]
async fn changing_management_room_releases_the_old_one() {
    let harness = Harness::new().await;
    let registry = harness.registry();
    let old_room = RoomId::from("!old:example.org");
    let new_room = RoomId::from("!new:example.org");
    let alice = registry.get(&UserId::from(ALICE)).await.expect("alice");

    alice.set_management_room(old_room.clone()).await;
    alice.set_management_room(new_room.clone()).await;

    assert!(registry.get_by_management_room(&old_room).await.is_none());
    assert!(registry.get_by_management_room(&new_room).await.is_some());
}

#[tokio::test]
async fn get_all_preserves_store_order_and_reuses_residents() {
    let harness = Harness::new().await;
    harness.seed_user(BOB, None).await;
    harness.seed_user(ALICE, None).await;
    let registry = harness.registry();
    let resident = registry.get(&UserId::from(ALICE)).await.expect("alice");

    let sessions = registry.get_all().await.expect("all");

    let ids: Vec<_> = sessions.iter().map(|s| s.user_id().as_str()).collect();
    assert_eq!(ids, vec![BOB, ALICE]);
    assert!(Arc::ptr_eq(&sessions[1], &resident));
}

#[tokio::test]
async fn start_all_connects_users_with_credentials() {
    let harness = Harness::with_connection(FakeConnection::new()).await;
    harness.seed_user(ALICE, Some(credential("alice"))).await;
    harness.seed_user(BOB, None).await;
    let registry = harness.registry();

    assert_eq!(registry.start_all().await.expect("start"), 2);

    let alice = registry.get(&UserId::from(ALICE)).await.expect("alice");
    let bob = registry.get(&UserId::from(BOB)).await.expect("bob");
    assert_eq!(alice.state().await, ConnectionState::LoggedIn);
    assert_eq!(bob.state().await, ConnectionState::Disconnected);
    assert_eq!(harness.connector.connects(), 1);
    assert!(harness.connection.calls().await.contains(&"contacts"));
}
