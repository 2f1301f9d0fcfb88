use docsmith_core::{Role, META_FORKED, META_FORK_NAME};
use docsmith_session::Conversation;
use std::collections::HashMap;

#[test]
fn test_new_conversation_single_system_message() {
    let convo = Conversation::new();
    let messages = convo.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::System);
}

#[test]
fn test_clear_restores_single_system_message() {
    let mut convo = Conversation::new();
    convo.add_message(Role::User, "What should the README cover?");
    convo.add_message(Role::Assistant, "Installation, usage, and licensing.");
    convo.add_message(Role::User, "Add a FAQ too.");

    convo.clear_messages();

    let messages = convo.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::System);
}

#[test]
fn test_fork_hello_tagged_and_origin_unchanged() {
    let mut convo = Conversation::new();
    convo.add_message(Role::User, "Hello");
    let before = convo.snapshot();

    let fork = convo.fork("x");

    let hello = fork
        .messages()
        .iter()
        .find(|m| m.content == "Hello")
        .unwrap();
    assert_eq!(hello.role, Role::User);
    assert_eq!(hello.metadata.get(META_FORKED), Some(&serde_json::json!(true)));
    assert_eq!(hello.metadata.get(META_FORK_NAME), Some(&serde_json::json!("x")));

    assert_eq!(convo.snapshot(), before);
}

#[test]
fn test_mutating_fork_does_not_touch_origin() {
    let mut convo = Conversation::new();
    convo.add_message(Role::User, "Hello");

    let mut fork = convo.fork("branch");
    fork.add_message(Role::Assistant, "Only in the fork");
    fork.clear_messages();
    fork.add_message(Role::User, "Fresh start");

    assert_eq!(convo.message_count(), 2);
    assert_eq!(convo.last_message().content, "Hello");
    assert_ne!(fork.id(), convo.id());
}

#[test]
fn test_export_import_roundtrip_into_fresh_conversation() {
    let mut convo = Conversation::with_system_message("You write changelogs.");
    convo.add_message(Role::User, "Summarize v0.3");
    let mut meta = HashMap::new();
    meta.insert("section".to_string(), serde_json::json!("changelog"));
    convo.add_message_with_metadata(Role::Assistant, "v0.3 adds streaming.", meta);

    let exported = convo.export_conversation().unwrap();

    let mut fresh = Conversation::new();
    fresh.import_conversation(&exported).unwrap();

    let pairs = |c: &Conversation| {
        c.messages()
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(pairs(&fresh), pairs(&convo));
    assert_eq!(fresh.snapshot(), convo.snapshot());
    assert_eq!(
        fresh.messages()[2].metadata.get("section"),
        Some(&serde_json::json!("changelog"))
    );
}

#[test]
fn test_exported_fork_keeps_tags() {
    let mut convo = Conversation::new();
    convo.add_message(Role::User, "Draft the architecture section");
    let fork = convo.fork("alt-architecture");

    let mut restored = Conversation::new();
    restored
        .import_conversation(&fork.export_conversation().unwrap())
        .unwrap();

    assert!(restored.last_message().is_forked());
    assert_eq!(restored.last_message().fork_name(), Some("alt-architecture"));
}

#[tokio::test]
async fn test_fork_can_move_to_another_task() {
    let mut convo = Conversation::new();
    convo.add_message(Role::User, "Hello");
    let fork = convo.fork("worker");

    let handle = tokio::spawn(async move {
        let mut fork = fork;
        fork.add_message(Role::Assistant, "From the worker");
        fork.message_count()
    });

    assert_eq!(handle.await.unwrap(), 3);
    assert_eq!(convo.message_count(), 2);
}
