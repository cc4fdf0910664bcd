#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use murmur::{
    ChatEvent, ChatManager, ChatSettings, Message, Session, SessionSnapshot, SettingsStore,
};
use murmur_llm::{Script, ScriptedProvider};
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn settings_with(update: impl FnOnce(&mut ChatSettings)) -> Arc<SettingsStore> {
    let mut settings = ChatSettings {
        provider_id: "scripted".to_string(),
        ..ChatSettings::default()
    };
    update(&mut settings);
    Arc::new(SettingsStore::with_settings(
        PathBuf::from("unused-settings.json"),
        settings,
    ))
}

pub fn manager_with_scripts(
    scripts: impl IntoIterator<Item = Script>,
) -> (ChatManager, Arc<ScriptedProvider>) {
    let provider = Arc::new(ScriptedProvider::with_scripts(scripts));
    let manager = ChatManager::new(provider.clone(), settings_with(|_| {}));
    (manager, provider)
}

/// Manager whose only session holds `messages`.
pub fn manager_with_messages(
    messages: Vec<Message>,
    scripts: impl IntoIterator<Item = Script>,
) -> (ChatManager, Arc<ScriptedProvider>) {
    let (manager, provider) = manager_with_scripts(scripts);
    let mut session = Session::new(manager.settings().default_mask());
    for message in messages {
        session.push_message(message);
    }
    manager.restore(SessionSnapshot {
        sessions: vec![session],
        current_session_index: 0,
    });
    (manager, provider)
}

pub async fn wait_for(
    events: &mut broadcast::Receiver<ChatEvent>,
    mut matches: impl FnMut(&ChatEvent) -> bool,
) -> ChatEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive in time")
}

pub fn assert_unique_ids(session: &Session) {
    let mut ids = session
        .mask
        .context
        .iter()
        .chain(session.messages.iter())
        .map(|message| message.id)
        .collect::<Vec<_>>();
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), total, "message ids must stay unique");
}
