//! End-to-end streaming scenarios
//!
//! Each test drives a real engine over an in-process hub and store:
//! flush cadence, attach/detach behaviour, status transitions, and what a
//! reconnecting client gets back from `load_for_display`.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use common::{delta_of, drain, kinds, next_response, responses, HarnessBuilder, ManualGenerator};
use relay_core::{
    Conversation, ConversationId, ConversationStatus, ConversationStore, DetachOutcome,
    GeneratorItem, InMemoryStore, Message, MessageRole, RelayMessage, ScriptedGenerator,
    SendMessage, StoreError, StreamOutcome,
};

// =============================================================================
// Flush cadence
// =============================================================================

/// A non-empty first chunk flushes immediately, far below the batch size.
#[tokio::test]
async fn scenario_a_first_chunk_flushes_immediately() {
    let (generator, tx) = ManualGenerator::new();
    let h = HarnessBuilder::new().build(generator).await;
    let (conn, mut rx) = h.connect();
    let ticket = h.submit("hi", Some(conn)).await;

    tx.send(GeneratorItem::text("Hel")).await.unwrap();
    let (content, done) = next_response(&mut rx).await;
    assert_eq!(content, "Hel");
    assert!(!done);

    tx.send(GeneratorItem::Done { usage: None }).await.unwrap();
    ticket.wait().await.unwrap();
}

/// Four ~10-token deltas: first-chunk flush, threshold flush at 30, final flush.
#[tokio::test]
async fn scenario_b_threshold_flush_at_exact_multiple() {
    let deltas: Vec<String> = ['a', 'b', 'c', 'd'].iter().map(|c| delta_of(10, *c)).collect();
    let refs: Vec<&str> = deltas.iter().map(String::as_str).collect();
    let h = HarnessBuilder::new()
        .build(Arc::new(ScriptedGenerator::from_deltas(&refs)))
        .await;
    let (conn, mut rx) = h.connect();

    let outcome = h.submit("count", Some(conn)).await.wait().await.unwrap();
    let events = drain(&mut rx);

    assert_eq!(
        responses(&events),
        vec![
            (deltas[0].clone(), false),
            (deltas[..3].concat(), false),
            (deltas.concat(), true),
        ]
    );
    assert!(matches!(outcome, StreamOutcome::Completed { .. }));
}

/// A single step from 18 to 35 tokens skips the 30 boundary.
#[tokio::test]
async fn scenario_c_large_delta_skips_boundary() {
    let first = delta_of(18, 'x');
    let second = delta_of(17, 'y');
    let h = HarnessBuilder::new()
        .build(Arc::new(ScriptedGenerator::from_deltas(&[&first, &second])))
        .await;
    let (conn, mut rx) = h.connect();

    h.submit("jump", Some(conn)).await.wait().await.unwrap();
    let events = drain(&mut rx);

    assert_eq!(
        responses(&events),
        vec![(first.clone(), false), (format!("{first}{second}"), true)]
    );
}

/// The opt-in boundary-crossing cadence catches the same jump.
#[tokio::test]
async fn boundary_crossing_cadence_catches_jump() {
    let first = delta_of(18, 'x');
    let second = delta_of(17, 'y');
    let mut config = relay_core::EngineConfig::default();
    config.batching.cadence = relay_core::FlushCadence::BoundaryCrossing;
    let h = HarnessBuilder::new()
        .config(config)
        .build(Arc::new(ScriptedGenerator::from_deltas(&[&first, &second])))
        .await;
    let (conn, mut rx) = h.connect();

    h.submit("jump", Some(conn)).await.wait().await.unwrap();
    let events = drain(&mut rx);
    assert_eq!(responses(&events).len(), 3);
}

/// The final flush carries exactly the concatenation of every delta.
#[tokio::test]
async fn final_flush_is_concatenation_of_deltas() {
    let deltas = ["The ", "quick ", "", "brown ", "fox ", "jumps ", "over ", "the ", "lazy ", "dog."];
    let h = HarnessBuilder::new()
        .build(Arc::new(ScriptedGenerator::from_deltas(&deltas)))
        .await;
    let (conn, mut rx) = h.connect();

    let outcome = h.submit("fox?", Some(conn)).await.wait().await.unwrap();
    let events = drain(&mut rx);
    let flushes = responses(&events);

    let (last, done) = flushes.last().unwrap().clone();
    assert!(done);
    assert_eq!(last, deltas.concat());

    // Every flush extends the previous one
    for pair in flushes.windows(2) {
        assert!(pair[1].0.starts_with(&pair[0].0));
    }

    let StreamOutcome::Completed { content, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(content, deltas.concat());
}

#[tokio::test]
async fn event_order_for_a_simple_turn() {
    let h = HarnessBuilder::new()
        .build(Arc::new(ScriptedGenerator::from_deltas(&["Hi", " there"])))
        .await;
    let (conn, mut rx) = h.connect();

    h.submit("hello", Some(conn)).await.wait().await.unwrap();
    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec!["user_message_sent", "assistant_response", "assistant_response"]
    );
    let RelayMessage::UserMessageSent { message, .. } = &events[0] else {
        panic!("expected user_message_sent");
    };
    assert_eq!(message.content, "hello");
}

// =============================================================================
// Attach / detach
// =============================================================================

/// A detaches mid-stream; B keeps receiving and the status stays processing.
#[tokio::test]
async fn scenario_d_partial_detach_keeps_streaming() {
    let (generator, tx) = ManualGenerator::new();
    let h = HarnessBuilder::new().build(generator).await;
    let conv = h.conversation.id.clone();
    let user = h.conversation.user_id.clone();
    let (a, mut rx_a) = h.connect();
    let (b, mut rx_b) = h.connect();

    let ticket = h.submit("question", Some(a)).await;
    assert!(h.engine.attach(&conv, &user, b).await.unwrap());
    // Catch-up snapshot for the late attacher
    assert_eq!(next_response(&mut rx_b).await, (String::new(), false));

    tx.send(GeneratorItem::text("hello")).await.unwrap();
    assert_eq!(next_response(&mut rx_a).await.0, "hello");
    assert_eq!(next_response(&mut rx_b).await.0, "hello");

    let outcome = h.engine.detach(&conv, &user, a).await.unwrap();
    assert_eq!(outcome, DetachOutcome::Detached);
    assert_eq!(
        h.engine.status().current(&conv).await.unwrap(),
        ConversationStatus::Processing
    );

    // "hello" is 2 tokens; 28 more lands exactly on 30
    let more = delta_of(28, 'm');
    tx.send(GeneratorItem::text(more.clone())).await.unwrap();
    assert_eq!(next_response(&mut rx_b).await.0, format!("hello{more}"));
    assert!(responses(&drain(&mut rx_a)).is_empty());

    tx.send(GeneratorItem::Done { usage: None }).await.unwrap();
    ticket.wait().await.unwrap();
    assert_eq!(next_response(&mut rx_b).await, (format!("hello{more}"), true));
    assert!(responses(&drain(&mut rx_a)).is_empty());
    assert_eq!(
        h.engine.status().current(&conv).await.unwrap(),
        ConversationStatus::Completed
    );
}

/// Both viewers leave: interrupted at once, partial content still loadable.
#[tokio::test]
async fn scenario_e_all_detach_interrupts_and_keeps_partial() {
    let (generator, tx) = ManualGenerator::new();
    let h = HarnessBuilder::new().build(generator).await;
    let conv = h.conversation.id.clone();
    let user = h.conversation.user_id.clone();
    let (a, mut rx_a) = h.connect();
    let (b, _rx_b) = h.connect();

    let ticket = h.submit("question", Some(a)).await;
    h.engine.attach(&conv, &user, b).await.unwrap();
    tx.send(GeneratorItem::text("partial answer")).await.unwrap();
    assert_eq!(next_response(&mut rx_a).await.0, "partial answer");

    assert_eq!(h.engine.detach(&conv, &user, a).await.unwrap(), DetachOutcome::Detached);
    assert_eq!(
        h.engine.detach(&conv, &user, b).await.unwrap(),
        DetachOutcome::LastActiveDetached
    );
    assert_eq!(
        h.engine.status().current(&conv).await.unwrap(),
        ConversationStatus::Interrupted
    );

    let view = h.engine.load_for_display(&conv, &user).await.unwrap();
    let last = view.messages.last().unwrap();
    assert_eq!(&last.id, &ticket.message_id);
    assert_eq!(last.content, "partial answer");
    assert!(view.streaming.unwrap().is_active);

    // Generation carries on without viewers and the reply is still persisted
    tx.send(GeneratorItem::text(", finished")).await.unwrap();
    tx.send(GeneratorItem::Done { usage: None }).await.unwrap();
    let message_id = ticket.message_id.clone();
    ticket.wait().await.unwrap();

    let stored = h.store.get_messages(&conv).await.unwrap();
    let reply = stored.iter().find(|m| m.id == message_id).unwrap();
    assert_eq!(reply.content, "partial answer, finished");
    assert_eq!(
        h.engine.status().current(&conv).await.unwrap(),
        ConversationStatus::Completed
    );
}

#[tokio::test]
async fn double_attach_is_idempotent() {
    let (generator, tx) = ManualGenerator::new();
    let h = HarnessBuilder::new().build(generator).await;
    let conv = h.conversation.id.clone();
    let user = h.conversation.user_id.clone();
    let (a, _rx_a) = h.connect();

    let ticket = h.submit("q", None).await;
    h.engine.attach(&conv, &user, a).await.unwrap();
    h.engine.attach(&conv, &user, a).await.unwrap();

    let state = h.registry.get(&conv).unwrap();
    assert_eq!(state.active_connections(), vec![a]);
    assert_eq!(state.all_connections(), vec![a]);

    tx.send(GeneratorItem::Done { usage: None }).await.unwrap();
    ticket.wait().await.unwrap();
}

/// Holds every user-message save until the test releases it
struct GatedStore {
    inner: InMemoryStore,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ConversationStore for GatedStore {
    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError> {
        self.inner.create_conversation(conversation).await
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Conversation, StoreError> {
        self.inner.get_conversation(id).await
    }

    async fn save_message(&self, message: Message) -> Result<(), StoreError> {
        if message.role == MessageRole::User {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.save_message(message).await
    }

    async fn get_messages(&self, id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        self.inner.get_messages(id).await
    }

    async fn update_conversation_status(
        &self,
        id: &ConversationId,
        expected: &[ConversationStatus],
        next: ConversationStatus,
    ) -> Result<bool, StoreError> {
        self.inner.update_conversation_status(id, expected, next).await
    }

    async fn list_conversations_with_status(
        &self,
        status: ConversationStatus,
    ) -> Result<Vec<Conversation>, StoreError> {
        self.inner.list_conversations_with_status(status).await
    }
}

/// The origin leaves while the user message is still being saved.
#[tokio::test]
async fn origin_detach_before_processing_still_interrupts() {
    let store = Arc::new(GatedStore {
        inner: InMemoryStore::new(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let (generator, tx) = ManualGenerator::new();
    let h = HarnessBuilder::new()
        .store(store.clone())
        .build(generator)
        .await;
    let conv = h.conversation.id.clone();
    let user = h.conversation.user_id.clone();
    let (origin, _rx) = h.connect();

    let engine = h.engine.clone();
    let request = SendMessage {
        conversation_id: conv.clone(),
        user_id: user.clone(),
        content: "q".to_string(),
        origin: Some(origin),
    };
    let submit = tokio::spawn(async move { engine.submit_user_message(request).await });

    store.entered.notified().await;
    assert_eq!(
        h.engine.detach(&conv, &user, origin).await.unwrap(),
        DetachOutcome::LastActiveDetached
    );
    store.release.notify_one();

    let ticket = submit.await.unwrap().unwrap();
    assert_eq!(
        h.engine.status().current(&conv).await.unwrap(),
        ConversationStatus::Interrupted
    );

    tx.send(GeneratorItem::Done { usage: None }).await.unwrap();
    ticket.wait().await.unwrap();
    assert_eq!(
        h.engine.status().current(&conv).await.unwrap(),
        ConversationStatus::Completed
    );
}

#[tokio::test]
async fn detach_by_another_user_is_rejected() {
    let (generator, tx) = ManualGenerator::new();
    let h = HarnessBuilder::new().build(generator).await;
    let conv = h.conversation.id.clone();
    let (a, _rx_a) = h.connect();

    let ticket = h.submit("q", Some(a)).await;
    let err = h
        .engine
        .detach(&conv, &relay_core::UserId::new(), a)
        .await
        .unwrap_err();
    assert!(matches!(err, relay_core::EngineError::Forbidden { .. }));
    assert_eq!(h.registry.get(&conv).unwrap().active_connections(), vec![a]);
    assert_eq!(
        h.engine.status().current(&conv).await.unwrap(),
        ConversationStatus::Processing
    );

    tx.send(GeneratorItem::Done { usage: None }).await.unwrap();
    ticket.wait().await.unwrap();
}

/// Many connections detach at once; exactly one observes the empty set.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_last_detach_interrupts_exactly_once() {
    let (generator, tx) = ManualGenerator::new();
    let h = HarnessBuilder::new().build(generator).await;
    let conv = h.conversation.id.clone();
    let user = h.conversation.user_id.clone();

    let mut conns = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..16 {
        let (id, rx) = h.connect();
        conns.push(id);
        receivers.push(rx);
    }
    let ticket = h.submit("q", Some(conns[0])).await;
    for conn in &conns[1..] {
        h.engine.attach(&conv, &user, *conn).await.unwrap();
    }

    let mut join_set = JoinSet::new();
    for conn in conns {
        let engine = h.engine.clone();
        let conv = conv.clone();
        let user = user.clone();
        join_set.spawn(async move { engine.detach(&conv, &user, conn).await.unwrap() });
    }

    let mut winners = 0;
    while let Some(result) = join_set.join_next().await {
        if result.unwrap() == DetachOutcome::LastActiveDetached {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(
        h.engine.status().current(&conv).await.unwrap(),
        ConversationStatus::Interrupted
    );

    tx.send(GeneratorItem::Done { usage: None }).await.unwrap();
    ticket.wait().await.unwrap();
}

/// A viewer that never reads its queue neither stalls the stream nor the others.
#[tokio::test]
async fn stalled_subscriber_does_not_hold_back_others() {
    let (generator, tx) = ManualGenerator::new();
    let h = HarnessBuilder::new().build(generator).await;
    let conv = h.conversation.id.clone();
    let user = h.conversation.user_id.clone();
    let (stalled, _stalled_rx) = h.connect_with_capacity(1);
    let (healthy, mut rx_healthy) = h.connect();

    let ticket = h.submit("q", Some(stalled)).await;
    h.engine.attach(&conv, &user, healthy).await.unwrap();
    let message_id = ticket.message_id.clone();

    let deltas: Vec<String> = (0..8).map(|i| delta_of(30, char::from(b'a' + i))).collect();
    for delta in &deltas {
        tx.send(GeneratorItem::text(delta.clone())).await.unwrap();
    }
    tx.send(GeneratorItem::Done { usage: None }).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
        .await
        .expect("stream stalled behind a full connection")
        .unwrap();
    assert!(matches!(outcome, StreamOutcome::Completed { .. }));

    // Catch-up snapshot, one flush per 30-token boundary, then the final flush
    let flushes = responses(&drain(&mut rx_healthy));
    assert_eq!(flushes.len(), 10);
    assert_eq!(flushes.last().unwrap(), &(deltas.concat(), true));
    for (i, (content, done)) in flushes[1..9].iter().enumerate() {
        assert_eq!(content, &deltas[..=i].concat());
        assert!(!done);
    }

    let stored = h.store.get_messages(&conv).await.unwrap();
    assert!(stored.iter().any(|m| m.id == message_id && m.content == deltas.concat()));
    assert_eq!(
        h.engine.status().current(&conv).await.unwrap(),
        ConversationStatus::Completed
    );
}

/// The origin drops and comes back under a new ID: flushes reach it via the room.
#[tokio::test]
async fn reconnect_under_new_id_gets_room_broadcast() {
    let (generator, tx) = ManualGenerator::new();
    let h = HarnessBuilder::new().build(generator).await;
    let conv = h.conversation.id.clone();
    let (a, mut rx_a) = h.connect();

    let ticket = h.submit("q", Some(a)).await;
    tx.send(GeneratorItem::text("start")).await.unwrap();
    assert_eq!(next_response(&mut rx_a).await.0, "start");

    h.hub.unregister(a);
    let detached = h.engine.connection_closed(a).await;
    assert_eq!(detached, vec![(conv.clone(), DetachOutcome::LastActiveDetached)]);

    let (_reconnected, mut rx_new) = h.connect();
    tx.send(GeneratorItem::Done { usage: None }).await.unwrap();
    ticket.wait().await.unwrap();
    assert_eq!(next_response(&mut rx_new).await, ("start".to_string(), true));
}

// =============================================================================
// Reconciliation
// =============================================================================

/// After completion (inside the grace window) the reply appears exactly once.
#[tokio::test]
async fn load_for_display_never_duplicates_message_ids() {
    let h = HarnessBuilder::new()
        .build(Arc::new(ScriptedGenerator::from_deltas(&["answer"])))
        .await;
    let conv = h.conversation.id.clone();
    let user = h.conversation.user_id.clone();

    for turn in 0..3 {
        h.submit(&format!("question {turn}"), None).await.wait().await.unwrap();
    }
    assert!(h.registry.get(&conv).is_some());

    let view = h.engine.load_for_display(&conv, &user).await.unwrap();
    let ids: HashSet<_> = view.messages.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids.len(), view.messages.len());
    assert_eq!(view.messages.len(), 6);
    assert!(!view.streaming.unwrap().synthesized);
}

#[tokio::test]
async fn completed_stream_leaves_after_grace_period() {
    let h = HarnessBuilder::new()
        .grace(Duration::from_millis(50))
        .build(Arc::new(ScriptedGenerator::from_deltas(&["done"])))
        .await;
    let conv = h.conversation.id.clone();

    h.submit("q", None).await.wait().await.unwrap();
    assert!(h.registry.get(&conv).is_some());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.registry.get(&conv).is_none());

    let view = h
        .engine
        .load_for_display(&conv, &h.conversation.user_id)
        .await
        .unwrap();
    assert_eq!(view.messages.len(), 2);
    assert!(view.streaming.is_none());
}
