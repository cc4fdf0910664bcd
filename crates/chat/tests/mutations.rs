mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{
    assert_unique_ids, manager_with_messages, manager_with_scripts, settings_with, wait_for,
};
use murmur::{
    ChatCommand, ChatEvent, ChatManager, DEFAULT_TOPIC, Mask, Message, MessageId, SessionId,
    StreamOutcome, Submission, Summarizer, SummaryError, SummaryResult,
};
use murmur_llm::{BoxFuture, Script, ScriptedProvider};

fn exchange() -> Vec<Message> {
    vec![
        Message::user("first question"),
        Message::assistant("first answer"),
        Message::user("second question"),
        Message::assistant("second answer"),
    ]
}

#[tokio::test]
async fn resend_of_a_reply_replaces_the_pair() {
    let (manager, provider) =
        manager_with_messages(exchange(), [Script::reply(["fresh answer"])]);
    let session_id = manager.current_session_id();
    let before = manager.session(session_id).expect("session exists");
    let old_user = before.messages[0].id;
    let old_reply = before.messages[1].id;

    let handle = manager
        .resend(session_id, old_reply)
        .expect("reply with a prompt can be resent");
    assert_ne!(handle.user_message_id, old_user);
    assert_ne!(handle.assistant_message_id, old_reply);
    assert_eq!(handle.settled().await, StreamOutcome::Completed);

    let session = manager.session(session_id).expect("session exists");
    let contents = session
        .messages
        .iter()
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        contents,
        vec![
            "second question",
            "second answer",
            "first question",
            "fresh answer"
        ]
    );
    assert!(session.message(old_user).is_none());
    assert!(session.message(old_reply).is_none());
    assert_eq!(provider.requests()[0].last_user_content(), Some("first question"));
    assert_unique_ids(&session);
}

#[tokio::test]
async fn resend_of_a_lone_prompt_sends_it_again() {
    let (manager, _provider) =
        manager_with_messages(vec![Message::user("unanswered")], [Script::reply(["ok"])]);
    let session_id = manager.current_session_id();
    let prompt = manager.session(session_id).expect("session exists").messages[0].id;

    let handle = manager.resend(session_id, prompt).expect("prompt resends");
    assert_eq!(handle.settled().await, StreamOutcome::Completed);

    let session = manager.session(session_id).expect("session exists");
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].content, "unanswered");
    assert_eq!(session.messages[1].content, "ok");
}

#[tokio::test]
async fn resend_without_a_prompt_changes_nothing() {
    let (manager, provider) =
        manager_with_messages(vec![Message::assistant("orphan reply")], []);
    let session_id = manager.current_session_id();
    let reply = manager.session(session_id).expect("session exists").messages[0].id;

    assert!(manager.resend(session_id, reply).is_none());
    assert!(manager.resend(session_id, MessageId::generate()).is_none());
    let session = manager.session(session_id).expect("session exists");
    assert_eq!(session.messages.len(), 1);
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn resend_of_a_prompt_replaces_its_following_reply() {
    let (manager, provider) =
        manager_with_messages(exchange(), [Script::reply(["fresh answer"])]);
    let session_id = manager.current_session_id();
    let before = manager.session(session_id).expect("session exists");
    let prompt = before.messages[0].id;
    let reply = before.messages[1].id;

    let handle = manager.resend(session_id, prompt).expect("prompt resends");
    assert_eq!(handle.settled().await, StreamOutcome::Completed);

    let session = manager.session(session_id).expect("session exists");
    let contents = session
        .messages
        .iter()
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        contents,
        vec![
            "second question",
            "second answer",
            "first question",
            "fresh answer"
        ]
    );
    assert!(session.message(prompt).is_none());
    assert!(session.message(reply).is_none());
    assert_eq!(provider.requests().len(), 1);
    assert_unique_ids(&session);
}

#[tokio::test]
async fn edit_and_pin_of_unknown_ids_change_nothing() {
    let (manager, _provider) = manager_with_messages(exchange(), []);
    let session_id = manager.current_session_id();
    let before = manager.session(session_id).expect("session exists");
    let mut events = manager.subscribe();
    let missing = MessageId::generate();

    assert!(!manager.edit(session_id, missing, "rewritten"));
    assert!(manager.pin(session_id, missing).is_none());
    assert!(!manager.edit(SessionId::generate(), before.messages[0].id, "x"));

    let after = manager.session(session_id).expect("session exists");
    assert_eq!(after.messages, before.messages);
    assert!(after.mask.context.is_empty());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn pinned_copy_is_independent_of_the_original() {
    let (manager, _provider) = manager_with_messages(exchange(), []);
    let session_id = manager.current_session_id();
    let original = manager.session(session_id).expect("session exists").messages[1].id;

    let pinned = manager.pin(session_id, original).expect("live message pins");
    assert_ne!(pinned, original);
    assert!(manager.edit(session_id, pinned, "edited context"));

    let session = manager.session(session_id).expect("session exists");
    assert_eq!(session.mask.context.len(), 1);
    assert_eq!(session.mask.context[0].content, "edited context");
    assert_eq!(
        session.message(original).map(|message| message.content.as_str()),
        Some("first answer")
    );
    assert_unique_ids(&session);

    assert!(manager.unpin(session_id, pinned));
    assert!(!manager.unpin(session_id, pinned));
    assert!(manager.session(session_id).expect("session exists").mask.context.is_empty());
}

#[tokio::test]
async fn toggling_the_fold_twice_restores_full_history() {
    let mut messages = exchange();
    messages.push(Message::user("third question"));
    let (manager, _provider) = manager_with_messages(messages, []);
    let session_id = manager.current_session_id();
    let mut snapshot = manager.snapshot();
    snapshot.sessions[0].memory_prompt = "older recap".to_string();
    manager.restore(snapshot);

    assert_eq!(manager.toggle_clear_context(session_id), Some(Some(5)));
    let folded = manager.session(session_id).expect("session exists");
    assert!(folded.memory_prompt.is_empty());
    assert!(folded.effective_context().is_empty());

    assert_eq!(manager.toggle_clear_context(session_id), Some(None));
    let unfolded = manager.session(session_id).expect("session exists");
    assert!(unfolded.memory_prompt.is_empty());
    assert_eq!(unfolded.effective_context().len(), 4);
}

#[tokio::test]
async fn deleting_unknown_ids_reports_false() {
    let (manager, _provider) = manager_with_messages(exchange(), []);
    let session_id = manager.current_session_id();
    let mut events = manager.subscribe();

    assert!(!manager.delete(session_id, MessageId::generate()));
    assert!(events.try_recv().is_err());

    let target = manager.session(session_id).expect("session exists").messages[2].id;
    assert!(manager.delete(session_id, target));
    let session = manager.session(session_id).expect("session exists");
    assert_eq!(session.messages.len(), 3);
    assert!(session.message(target).is_none());
}

#[tokio::test]
async fn commands_run_locally() {
    let (manager, provider) = manager_with_scripts([]);
    let first = manager.current_session_id();

    let submission = manager.submit(first, ":new Trip ideas");
    assert!(matches!(
        submission,
        Submission::Command(ChatCommand::New { topic: Some(ref topic) }) if topic == "Trip ideas"
    ));
    assert_eq!(manager.session_count(), 2);
    let created = manager.current_session();
    assert_ne!(created.id, first);
    assert_eq!(created.topic, "Trip ideas");

    assert!(matches!(
        manager.submit(created.id, ":next"),
        Submission::Command(ChatCommand::Next)
    ));
    assert_eq!(manager.current_session_id(), first);

    assert!(matches!(
        manager.submit(first, ":del"),
        Submission::Command(ChatCommand::Delete)
    ));
    assert_eq!(manager.session_count(), 1);
    assert!(manager.session(first).is_none());
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn ambiguous_prefix_is_sent_as_chat() {
    let (manager, provider) = manager_with_scripts([Script::reply(["sure"])]);
    let session_id = manager.current_session_id();

    let Submission::Sent(handle) = manager.submit(session_id, ":ne hi") else {
        panic!("ambiguous command should be sent as chat");
    };
    assert_eq!(handle.settled().await, StreamOutcome::Completed);
    assert_eq!(provider.requests()[0].last_user_content(), Some(":ne hi"));
    assert!(matches!(manager.submit(session_id, "  "), Submission::Ignored));
}

#[tokio::test]
async fn clear_and_mask_commands() {
    let settings = settings_with(|settings| {
        let mut coder = Mask::default().with_context(vec![Message::system("You write Rust.")]);
        coder.name = "Coder".to_string();
        settings.masks.push(coder);
    });
    let manager = ChatManager::new(Arc::new(ScriptedProvider::new()), settings);
    let session_id = manager.current_session_id();

    manager.submit(session_id, ":clear");
    assert_eq!(
        manager.session(session_id).expect("session exists").clear_context_index,
        Some(0)
    );

    manager.submit(session_id, ":newm coder");
    let created = manager.current_session();
    assert_ne!(created.id, session_id);
    assert_eq!(created.mask.name, "Coder");
    assert_eq!(created.mask.context[0].content, "You write Rust.");

    manager.submit(created.id, ":newm missing");
    assert_eq!(manager.session_count(), 2);
}

/// Summarizer with a fixed title, an optional delay and a number of leading memory failures.
#[derive(Default)]
struct TestSummarizer {
    delay: Duration,
    memory_failures: AtomicUsize,
}

impl TestSummarizer {
    fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn failing(failures: usize) -> Self {
        Self {
            memory_failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }
}

impl Summarizer for TestSummarizer {
    fn topic(&self, _messages: Vec<Message>) -> BoxFuture<'_, SummaryResult<String>> {
        Box::pin(async { Ok("Hiking Plans".to_string()) })
    }

    fn memory(
        &self,
        _previous: String,
        messages: Vec<Message>,
    ) -> BoxFuture<'_, SummaryResult<String>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failed = self
                .memory_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failed {
                return Err(SummaryError::EmptySummary {
                    stage: "test-summarizer",
                });
            }
            Ok(format!("recap of {} messages", messages.len()))
        })
    }
}

fn summarizing_manager(summarizer: TestSummarizer, replies: usize) -> ChatManager {
    let settings = settings_with(|settings| {
        settings.model_config.compress_message_length_threshold = 1;
    });
    let provider = Arc::new(ScriptedProvider::with_scripts(
        (0..replies).map(|index| Script::reply([format!("answer {index}")])),
    ));
    ChatManager::builder(provider, settings)
        .summarizer(Arc::new(summarizer))
        .build()
}

#[tokio::test]
async fn completed_reply_refreshes_topic_and_memory() {
    let manager = summarizing_manager(TestSummarizer::default(), 1);
    let mut events = manager.subscribe();
    let session_id = manager.current_session_id();
    assert_eq!(manager.current_session().topic, DEFAULT_TOPIC);

    let handle = manager.send(session_id, "where to hike").expect("dispatches");
    assert_eq!(handle.settled().await, StreamOutcome::Completed);

    wait_for(&mut events, |event| matches!(event, ChatEvent::TopicChanged { .. })).await;
    assert_eq!(manager.current_session().topic, "Hiking Plans");

    if manager.current_session().memory_prompt.is_empty() {
        wait_for(&mut events, |event| matches!(event, ChatEvent::MemoryUpdated { .. })).await;
    }
    let session = manager.session(session_id).expect("session exists");
    assert_eq!(session.memory_prompt, "recap of 2 messages");
    assert_eq!(session.last_summarize_index, 2);
}

#[tokio::test(start_paused = true)]
async fn summary_started_before_a_fold_is_discarded() {
    let manager = summarizing_manager(TestSummarizer::delayed(Duration::from_millis(100)), 1);
    let session_id = manager.current_session_id();

    let handle = manager.send(session_id, "secret").expect("dispatches");
    assert_eq!(handle.settled().await, StreamOutcome::Completed);
    assert_eq!(manager.toggle_clear_context(session_id), Some(Some(2)));

    tokio::time::sleep(Duration::from_millis(300)).await;

    let session = manager.session(session_id).expect("session exists");
    assert_eq!(session.clear_context_index, Some(2));
    assert!(session.memory_prompt.is_empty());
    assert_eq!(session.last_summarize_index, 0);
    assert!(session.effective_context().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_summary_keeps_turns_for_the_next_attempt() {
    let manager = summarizing_manager(TestSummarizer::failing(1), 2);
    let session_id = manager.current_session_id();

    let first = manager.send(session_id, "first").expect("dispatches");
    assert_eq!(first.settled().await, StreamOutcome::Completed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = manager.session(session_id).expect("session exists");
    assert!(session.memory_prompt.is_empty());
    assert_eq!(session.last_summarize_index, 0);

    let second = manager.send(session_id, "second").expect("dispatches");
    assert_eq!(second.settled().await, StreamOutcome::Completed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = manager.session(session_id).expect("session exists");
    assert_eq!(session.memory_prompt, "recap of 4 messages");
    assert_eq!(session.last_summarize_index, 4);
}

#[tokio::test]
async fn manual_rename_is_not_overwritten() {
    let provider = Arc::new(ScriptedProvider::with_scripts([Script::reply(["answer"])]));
    let manager = ChatManager::builder(provider, settings_with(|_| {}))
        .summarizer(Arc::new(TestSummarizer::default()))
        .build();
    let session_id = manager.current_session_id();

    assert!(manager.rename(session_id, "My topic"));
    assert!(!manager.rename(session_id, "   "));
    let handle = manager.send(session_id, "question").expect("dispatches");
    assert_eq!(handle.settled().await, StreamOutcome::Completed);
    tokio::task::yield_now().await;

    assert_eq!(manager.current_session().topic, "My topic");
}
