//! 实时扇出：频道目标、未读数附带与投递失败隔离

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_test::assert_ok;

use flare_chat::application::ClientAction;
use flare_chat::config::ChatConfig;
use flare_chat::domain::model::{
    ChatEvent, Destination, EventEnvelope, Message, MessageKind, MessageView,
};
use flare_chat::domain::repository::EventPublisher;
use flare_chat::service::wire::{Infrastructure, assemble, initialize_in_memory};

fn drain(receiver: &mut broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    while let Ok(envelope) = receiver.try_recv() {
        events.push(envelope);
    }
    events
}

fn kinds(events: &[EventEnvelope]) -> Vec<&'static str> {
    events.iter().map(|e| e.event.kind()).collect()
}

/// 永远失败的推送端，统计调用次数
#[derive(Default)]
struct UnreachablePublisher {
    attempts: AtomicUsize,
}

#[async_trait]
impl EventPublisher for UnreachablePublisher {
    async fn publish(&self, _destination: &Destination, _envelope: &EventEnvelope) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        bail!("connection refused")
    }
}

#[tokio::test]
async fn test_direct_message_reaches_topics_and_queues() {
    let context = initialize_in_memory(&ChatConfig::default());
    let hub = context.hub.clone().unwrap();

    let mut bob_topic = hub.subscribe(&Destination::UserTopic("bob".to_string())).await;
    let mut bob_queue = hub.subscribe(&Destination::UserQueue("bob".to_string())).await;
    let mut alice_queue = hub.subscribe(&Destination::UserQueue("alice".to_string())).await;

    let data = context
        .dispatcher
        .dispatch(
            "alice",
            ClientAction::SendDirect {
                recipient_id: "bob".to_string(),
                content: "hi".to_string(),
                kind: MessageKind::Text,
            },
        )
        .await
        .unwrap();
    let message: Message = serde_json::from_value(data).unwrap();

    let topic_events = drain(&mut bob_topic);
    assert_eq!(kinds(&topic_events), vec!["conversation_created", "message"]);
    let delivered = &topic_events[1];
    assert_eq!(delivered.recipient.as_deref(), Some("bob"));
    assert_eq!(delivered.unread_count, Some(1));
    assert_eq!(delivered.conversation_id, message.conversation_id);

    let queue_events = drain(&mut bob_queue);
    assert_eq!(kinds(&queue_events), vec!["message"]);
    assert_eq!(queue_events[0].unread_count, Some(1));

    let own_queue = drain(&mut alice_queue);
    assert_eq!(own_queue.len(), 1);
    assert_eq!(own_queue[0].unread_count, Some(0));
}

#[tokio::test]
async fn test_group_message_skips_personal_queues() {
    let context = initialize_in_memory(&ChatConfig::default());
    let hub = context.hub.clone().unwrap();

    let data = context
        .dispatcher
        .dispatch(
            "alice",
            ClientAction::CreateConversation {
                kind: flare_chat::domain::model::ConversationKind::Group,
                members: vec!["bob".to_string()],
                name: None,
                description: None,
                avatar_url: None,
            },
        )
        .await
        .unwrap();
    let conversation_id = data["id"].as_str().unwrap().to_string();

    let mut topic = hub
        .subscribe(&Destination::ConversationTopic(conversation_id.clone()))
        .await;
    let mut bob_queue = hub.subscribe(&Destination::UserQueue("bob".to_string())).await;

    context
        .dispatcher
        .dispatch(
            "bob",
            ClientAction::Send {
                conversation_id: conversation_id.clone(),
                content: "hello team".to_string(),
                kind: MessageKind::Text,
                reply_to: None,
            },
        )
        .await
        .unwrap();
    context
        .dispatcher
        .dispatch(
            "alice",
            ClientAction::Typing {
                conversation_id: conversation_id.clone(),
                typing: true,
            },
        )
        .await
        .unwrap();

    let events = drain(&mut topic);
    assert_eq!(kinds(&events), vec!["message", "typing"]);
    assert!(events.iter().all(|e| e.recipient.is_none()));
    assert!(drain(&mut bob_queue).is_empty());
}

#[tokio::test]
async fn test_reaction_switch_emits_remove_then_add() {
    let context = initialize_in_memory(&ChatConfig::default());
    let hub = context.hub.clone().unwrap();

    let data = context
        .dispatcher
        .dispatch(
            "alice",
            ClientAction::SendDirect {
                recipient_id: "bob".to_string(),
                content: "ship it?".to_string(),
                kind: MessageKind::Text,
            },
        )
        .await
        .unwrap();
    let message: Message = serde_json::from_value(data).unwrap();
    let mut topic = hub
        .subscribe(&Destination::ConversationTopic(message.conversation_id.clone()))
        .await;

    for emoji in ["👍", "👍", "🎉"] {
        context
            .dispatcher
            .dispatch(
                "bob",
                ClientAction::AddReaction {
                    message_id: message.id.clone(),
                    emoji: emoji.to_string(),
                },
            )
            .await
            .unwrap();
    }

    let events = drain(&mut topic);
    assert_eq!(
        kinds(&events),
        vec!["reaction_added", "reaction_removed", "reaction_added"]
    );
    match &events[1].event {
        ChatEvent::ReactionRemoved { emoji, user_id, .. } => {
            assert_eq!(emoji, "👍");
            assert_eq!(user_id, "bob");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let data = context
        .dispatcher
        .dispatch(
            "bob",
            ClientAction::RemoveReaction {
                message_id: message.id.clone(),
            },
        )
        .await
        .unwrap();
    let updated: MessageView = serde_json::from_value(data).unwrap();
    assert!(updated.reactions.is_empty());
}

#[tokio::test]
async fn test_unreachable_subscribers_never_fail_requests() {
    let config = ChatConfig::default();
    let publisher = Arc::new(UnreachablePublisher::default());
    let context = assemble(
        &config,
        Infrastructure::in_memory(&config).with_publisher(publisher.clone()),
    );
    assert!(context.hub.is_none());

    let data = assert_ok!(
        context
            .dispatcher
            .dispatch(
                "alice",
                ClientAction::SendDirect {
                    recipient_id: "bob".to_string(),
                    content: "anyone there?".to_string(),
                    kind: MessageKind::Text,
                },
            )
            .await
    );
    let message: Message = serde_json::from_value(data).unwrap();
    assert!(publisher.attempts.load(Ordering::SeqCst) > 0);

    assert_ok!(
        context
            .dispatcher
            .dispatch(
                "alice",
                ClientAction::Recall {
                    message_id: message.id.clone(),
                },
            )
            .await
    );

    let unread = context
        .dispatcher
        .dispatch(
            "bob",
            ClientAction::UnreadCount {
                conversation_id: message.conversation_id.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(unread["unread_count"], 0);

    // 后台重试同样只记录失败，不返回错误
    let before = publisher.attempts.load(Ordering::SeqCst);
    let delivered = assert_ok!(context.outbox_dispatcher.run_once().await);
    assert_eq!(delivered, 0);
    assert!(publisher.attempts.load(Ordering::SeqCst) > before);
}
