//! Pool lifecycle and room routing over a shared pool.

use std::sync::Arc;
use std::time::Duration;

use strand::pool::{Pool, PoolOptions};
use strand::room::Room;
use strand::testing::{scripted_dependencies, test_agent_config};
use strand::types::Role;

fn pool_with_capacity(max_agents: usize) -> Pool {
    Pool::new(PoolOptions::new(scripted_dependencies()).with_max_agents(max_agents))
}

/// Polls until the agent's history contains a user message with `needle`.
async fn wait_for_delivery(pool: &Pool, agent_id: &str, needle: &str) {
    let agent = pool.get(agent_id).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let delivered = agent
            .messages()
            .iter()
            .any(|m| m.role == Role::User && m.first_text().is_some_and(|t| t.contains(needle)));
        if delivered {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "message '{needle}' never reached {agent_id}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn received(messages: &[strand::types::Message], needle: &str) -> bool {
    messages
        .iter()
        .any(|m| m.role == Role::User && m.first_text().is_some_and(|t| t.contains(needle)))
}

#[tokio::test]
async fn create_get_list_remove() {
    let pool = pool_with_capacity(10);

    let agent = pool
        .create(test_agent_config().with_agent_id("agent-1"))
        .await
        .unwrap();
    assert_eq!(agent.id(), "agent-1");
    assert_eq!(pool.size().await, 1);
    assert_eq!(pool.get("agent-1").await.unwrap().id(), "agent-1");
    assert_eq!(pool.get("ghost").await.unwrap_err().kind(), "not_found");

    pool.create(test_agent_config().with_agent_id("agent-2"))
        .await
        .unwrap();
    pool.create(test_agent_config().with_agent_id("other-1"))
        .await
        .unwrap();
    assert_eq!(
        pool.list("agent-").await,
        vec!["agent-1".to_string(), "agent-2".to_string()]
    );
    assert_eq!(pool.list("").await.len(), 3);

    pool.remove("agent-1").await.unwrap();
    assert_eq!(pool.size().await, 2);
    assert_eq!(pool.remove("agent-1").await.unwrap_err().kind(), "not_found");

    pool.shutdown().await.unwrap();
    assert_eq!(pool.size().await, 0);
}

#[tokio::test]
async fn duplicate_ids_conflict() {
    let pool = pool_with_capacity(10);
    pool.create(test_agent_config().with_agent_id("agent-1"))
        .await
        .unwrap();
    let err = pool
        .create(test_agent_config().with_agent_id("agent-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");
    assert_eq!(pool.size().await, 1);
}

#[tokio::test]
async fn capacity_is_enforced() {
    // Property 8: create beyond max_agents returns Capacity and does not
    // insert.
    let pool = pool_with_capacity(2);
    pool.create(test_agent_config()).await.unwrap();
    pool.create(test_agent_config()).await.unwrap();

    let err = pool.create(test_agent_config()).await.unwrap_err();
    assert_eq!(err.kind(), "capacity");
    assert_eq!(pool.size().await, 2);
}

#[tokio::test]
async fn resume_is_idempotent_and_loads_from_store() {
    // Property 11 plus the re-attach path.
    let pool = pool_with_capacity(10);

    let agent = pool
        .create(test_agent_config().with_agent_id("agent-1"))
        .await
        .unwrap();
    agent.chat("remember this").await.unwrap();
    let message_count = agent.messages().len();
    assert!(message_count >= 2);

    // Already present: same engine, nothing new created.
    let resumed = pool
        .resume("agent-1", test_agent_config())
        .await
        .unwrap();
    assert_eq!(resumed.id(), "agent-1");
    assert_eq!(pool.size().await, 1);

    // Detach, then resume from the store without reprocessing.
    pool.remove("agent-1").await.unwrap();
    let resumed = pool
        .resume("agent-1", test_agent_config())
        .await
        .unwrap();
    assert_eq!(resumed.messages().len(), message_count);
    assert_eq!(resumed.status().step_count, 0);

    // Unknown ids are not resumable.
    let err = pool
        .resume("agent-ghost", test_agent_config())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn delete_erases_persisted_state() {
    let pool = pool_with_capacity(10);
    let agent = pool
        .create(test_agent_config().with_agent_id("agent-1"))
        .await
        .unwrap();
    agent.chat("hello").await.unwrap();

    pool.delete("agent-1").await.unwrap();
    assert_eq!(pool.size().await, 0);
    let err = pool
        .resume("agent-1", test_agent_config())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn for_each_iterates_a_snapshot() {
    let pool = pool_with_capacity(10);
    for i in 0..3 {
        pool.create(test_agent_config().with_agent_id(format!("agent-{i}")))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    pool.for_each(|id, _agent| seen.push(id.to_string())).await;
    seen.sort();
    assert_eq!(seen, vec!["agent-0", "agent-1", "agent-2"]);
}

#[tokio::test]
async fn room_membership_rules() {
    let pool = Arc::new(pool_with_capacity(10));
    pool.create(test_agent_config().with_agent_id("agent-a"))
        .await
        .unwrap();

    let room = Room::new(pool.clone());
    room.join("alice", "agent-a").await.unwrap();
    assert!(room.is_member("alice").await);
    assert_eq!(room.member_count().await, 1);
    assert_eq!(room.agent_id_of("alice").await.as_deref(), Some("agent-a"));

    // Duplicate names and unknown agents are rejected.
    assert_eq!(
        room.join("alice", "agent-a").await.unwrap_err().kind(),
        "conflict"
    );
    assert_eq!(
        room.join("bob", "agent-ghost").await.unwrap_err().kind(),
        "not_found"
    );

    room.leave("alice").await.unwrap();
    assert!(!room.is_member("alice").await);
    assert_eq!(room.leave("alice").await.unwrap_err().kind(), "not_found");
}

#[tokio::test]
async fn mention_routing_delivers_only_to_mentioned() {
    // S6: say("alice", "hi @bob") reaches bob alone, prefixed with the
    // sender tag.
    let pool = Arc::new(pool_with_capacity(10));
    for id in ["agent-a", "agent-b", "agent-c"] {
        pool.create(test_agent_config().with_agent_id(id))
            .await
            .unwrap();
    }

    let room = Room::new(pool.clone());
    room.join("alice", "agent-a").await.unwrap();
    room.join("bob", "agent-b").await.unwrap();
    room.join("carol", "agent-c").await.unwrap();

    room.say("alice", "hi @bob").await.unwrap();
    wait_for_delivery(&pool, "agent-b", "[from:alice] hi @bob").await;

    let carol_messages = pool.get("agent-c").await.unwrap().messages();
    assert!(!received(&carol_messages, "hi @bob"));
    let alice_messages = pool.get("agent-a").await.unwrap().messages();
    assert!(!received(&alice_messages, "hi @bob"));

    let history = room.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, "alice");
    assert_eq!(history[0].to, vec!["bob".to_string()]);
    assert!(history[0].sent > 0);
}

#[tokio::test]
async fn plain_say_broadcasts_to_everyone_but_the_sender() {
    let pool = Arc::new(pool_with_capacity(10));
    for id in ["agent-a", "agent-b", "agent-c"] {
        pool.create(test_agent_config().with_agent_id(id))
            .await
            .unwrap();
    }

    let room = Room::new(pool.clone());
    room.join("alice", "agent-a").await.unwrap();
    room.join("bob", "agent-b").await.unwrap();
    room.join("carol", "agent-c").await.unwrap();

    room.say("alice", "standup time").await.unwrap();
    wait_for_delivery(&pool, "agent-b", "[from:alice] standup time").await;
    wait_for_delivery(&pool, "agent-c", "[from:alice] standup time").await;

    let alice_messages = pool.get("agent-a").await.unwrap().messages();
    assert!(!received(&alice_messages, "standup time"));

    // Unknown mentions route to nobody; the history still records it.
    room.say("alice", "ping @nobody").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    for id in ["agent-b", "agent-c"] {
        let messages = pool.get(id).await.unwrap().messages();
        assert!(!received(&messages, "ping @nobody"));
    }
    assert_eq!(room.history().await.len(), 2);
}

#[tokio::test]
async fn broadcast_and_direct_messages() {
    let pool = Arc::new(pool_with_capacity(10));
    for id in ["agent-a", "agent-b"] {
        pool.create(test_agent_config().with_agent_id(id))
            .await
            .unwrap();
    }

    let room = Room::new(pool.clone());
    room.join("alice", "agent-a").await.unwrap();
    room.join("bob", "agent-b").await.unwrap();

    // broadcast() reaches every member, without a sender prefix.
    room.broadcast("maintenance at noon").await.unwrap();
    wait_for_delivery(&pool, "agent-a", "maintenance at noon").await;
    wait_for_delivery(&pool, "agent-b", "maintenance at noon").await;
    assert_eq!(room.history().await[0].from, "system");

    // send_to() is an explicit direct message.
    room.send_to("alice", "bob", "just for you").await.unwrap();
    wait_for_delivery(&pool, "agent-b", "[from:alice] just for you").await;
    assert_eq!(
        room.send_to("alice", "ghost", "hi").await.unwrap_err().kind(),
        "not_found"
    );
    assert_eq!(
        room.send_to("intruder", "bob", "hi").await.unwrap_err().kind(),
        "not_found"
    );

    room.clear_history().await;
    assert!(room.history().await.is_empty());
}

#[tokio::test]
async fn say_from_non_member_is_rejected() {
    let pool = Arc::new(pool_with_capacity(10));
    let room = Room::new(pool);
    assert_eq!(
        room.say("stranger", "hello").await.unwrap_err().kind(),
        "not_found"
    );
}
