use std::sync::Arc;
use std::time::Duration;
use woodchat_core::fake::{FakeBackend, ReplyScript, DEMO_PASSWORD, DEMO_USERNAME};
use woodchat_core::state::MessageView;
use woodchat_core::stream::StreamOutcome;
use woodchat_core::{
    AuthEvent, ChatError, ConversationEvent, CreateMessageRequest, CredentialStore, MessageRole,
    StreamError, WoodchatClient,
};

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn offline_client(
    backend: &FakeBackend,
) -> (WoodchatClient, tokio::sync::mpsc::UnboundedReceiver<AuthEvent>) {
    WoodchatClient::with_parts(Arc::new(backend.clone()), CredentialStore::in_memory())
}

#[test]
fn login_chat_and_reload_history() {
    let runtime = test_runtime();
    let backend = FakeBackend::new();
    let (client, _events) = offline_client(&backend);

    runtime.block_on(async {
        client
            .users
            .login(DEMO_USERNAME, DEMO_PASSWORD)
            .await
            .expect("login");
        let outcome = client
            .chat
            .send_message(CreateMessageRequest::new("ping", "doubao"))
            .await
            .expect("reply");
        assert!(matches!(outcome, StreamOutcome::Finalized(_)));

        let session_id = client.state().active_session_id().expect("session");
        let follow_up = CreateMessageRequest::new("again", "doubao")
            .in_session(Some(session_id))
            .replying_to(client.state().last_assistant_message().map(|m| m.id));
        client.chat.send_message(follow_up).await.expect("second reply");

        let history = client.chat.messages(session_id).await.expect("history");
        let roles: Vec<MessageRole> = history.iter().map(|message| message.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
                MessageRole::Assistant
            ]
        );
        assert_eq!(history[3].content, "Echo: again");
        assert_eq!(history[2].parent_message_id, Some(history[1].id));
    });
}

#[test]
fn observers_see_drafts_before_the_final_message() {
    let runtime = test_runtime();
    let backend = FakeBackend::new();
    let (client, _events) = offline_client(&backend);
    let mut observed = client.state().subscribe();

    runtime.block_on(async {
        client
            .users
            .login(DEMO_USERNAME, DEMO_PASSWORD)
            .await
            .expect("login");
        client
            .chat
            .send_message(CreateMessageRequest::new("watch", "doubao"))
            .await
            .expect("reply");
    });

    let mut events = Vec::new();
    while let Ok(event) = observed.try_recv() {
        events.push(event);
    }
    let first_draft = events
        .iter()
        .position(|event| matches!(event, ConversationEvent::DraftUpdated(_)))
        .expect("draft update");
    let final_message = events
        .iter()
        .position(|event| match event {
            ConversationEvent::MessageAdded(message) => message.role == MessageRole::Assistant,
            _ => false,
        })
        .expect("final message");
    assert!(first_draft < final_message);
    assert!(client
        .state()
        .all_messages()
        .iter()
        .all(|view| matches!(view, MessageView::Finalized(_))));
}

#[test]
fn new_message_preempts_the_reply_in_flight() {
    let runtime = test_runtime();
    let backend = FakeBackend::new();
    let (client, _events) = offline_client(&backend);

    runtime.block_on(async {
        client
            .users
            .login(DEMO_USERNAME, DEMO_PASSWORD)
            .await
            .expect("login");
        backend.set_reply(ReplyScript::ChunksThenHang(vec![
            b"data: {\"type\":\"message_start\",\"data\":{\"id\":-1}}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"stuck\"}}]}\n\n".to_vec(),
        ]));

        let first = client
            .chat
            .send_message(CreateMessageRequest::new("slow", "doubao"));
        let second = async {
            while client.state().draft().is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            backend.set_reply(ReplyScript::Echo);
            client
                .chat
                .send_message(CreateMessageRequest::new("fast", "doubao"))
                .await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.expect("first outcome"), StreamOutcome::Cancelled);
        let StreamOutcome::Finalized(reply) = second.expect("second outcome") else {
            panic!("second reply should finish");
        };
        assert_eq!(reply.content, "Echo: fast");
        assert_eq!(client.state().draft(), None);
        assert!(!client.chat.is_streaming());
    });
}

#[test]
fn stream_closed_early_leaves_no_draft() {
    let runtime = test_runtime();
    let backend = FakeBackend::new();
    let (client, _events) = offline_client(&backend);

    runtime.block_on(async {
        client
            .users
            .login(DEMO_USERNAME, DEMO_PASSWORD)
            .await
            .expect("login");
        backend.set_reply(ReplyScript::Chunks(vec![
            b"data: {\"type\":\"message_start\",\"data\":{\"id\":-1}}\n\n".to_vec(),
            b"data: {\"choices\":[{\"delta\":{\"content\":\"half\"}}]}\n\n".to_vec(),
            b"data: {\"error\":\"upstream timeout\"}\n\n".to_vec(),
        ]));

        let err = client
            .chat
            .send_message(CreateMessageRequest::new("hello", "doubao"))
            .await
            .expect_err("incomplete");
        match err {
            ChatError::Stream(StreamError::Incomplete { server_error }) => {
                assert_eq!(server_error.as_deref(), Some("upstream timeout"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(client.state().draft(), None);
        assert_eq!(client.state().messages().len(), 1);
    });
}

#[test]
fn expired_session_mid_conversation_is_renewed_once() {
    let runtime = test_runtime();
    let backend = FakeBackend::new();
    let (client, _events) = offline_client(&backend);

    runtime.block_on(async {
        client
            .users
            .login(DEMO_USERNAME, DEMO_PASSWORD)
            .await
            .expect("login");
        backend.expire_access_token();
        client
            .chat
            .send_message(CreateMessageRequest::new("still there?", "doubao"))
            .await
            .expect("reply after renewal");
        assert_eq!(backend.refresh_calls(), 1);
    });
}

#[test]
fn failed_renewal_asks_for_login() {
    let runtime = test_runtime();
    let backend = FakeBackend::new();
    let (client, mut events) = offline_client(&backend);

    runtime.block_on(async {
        client
            .users
            .login(DEMO_USERNAME, DEMO_PASSWORD)
            .await
            .expect("login");
        backend.fail_refresh();
        backend.expire_access_token();
        let err = client.chat.sessions().await.expect_err("signed out");
        assert_eq!(
            err.user_message(),
            "Your session has expired. Please log in again."
        );
    });

    assert_eq!(events.try_recv(), Ok(AuthEvent::SignedIn));
    assert!(matches!(
        events.try_recv(),
        Ok(AuthEvent::LoginRequired { .. })
    ));
    assert!(!client.credentials().is_authenticated());
}
