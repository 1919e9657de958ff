//! Produces the next assistant turn for a customer message, or defers to
//! the human agent who owns the conversation.

use crate::conversation::{ConversationStore, Handoff, Message, Role, StoreError};
use crate::escalation::{self, TurnContext};
use crate::mailbox::{Mailbox, NewNotification, Notification, NotificationKind};
use rd_channels::StaffAlerter;
use rd_llm::{ChatBackend, ChatMessage, LlmError, RetryPolicy, chat_with_retry};
use std::sync::Arc;

const EXIT_PHRASES: &[&str] = &["exit", "quit", "quitter", "au revoir", "bye", "goodbye"];
const MENU_PHRASES: &[&str] = &[
    "menu",
    "la carte",
    "votre carte",
    "voir la carte",
    "the card",
    "carte des plats",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuDocument {
    pub url: String,
    pub filename: String,
    pub caption: String,
}

#[derive(Debug, Clone)]
pub struct ResponderSettings {
    pub system_prompt: String,
    pub fallback_text: String,
    pub goodbye_text: String,
    pub menu: Option<MenuDocument>,
}

impl Default for ResponderSettings {
    fn default() -> Self {
        Self {
            system_prompt: "Tu es l'assistant du restaurant. Réponds brièvement et poliment, \
                            dans la langue du client."
                .to_string(),
            fallback_text: "Désolé, une erreur s'est produite. Un membre de notre équipe va \
                            vous répondre rapidement."
                .to_string(),
            goodbye_text: "Merci de votre visite, à bientôt !".to_string(),
            menu: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Reply {
        text: String,
        escalation: Option<Notification>,
    },
    Goodbye {
        text: String,
    },
    Menu {
        document: MenuDocument,
    },
    /// A human owns the conversation; nothing is sent automatically.
    NeedsHuman {
        agent_id: String,
        notification: Option<Notification>,
    },
    /// The completion backend failed; the customer gets the apology.
    Fallback {
        text: String,
        escalation: Option<Notification>,
    },
}

impl TurnOutcome {
    pub fn escalation(&self) -> Option<&Notification> {
        match self {
            Self::Reply { escalation, .. } | Self::Fallback { escalation, .. } => {
                escalation.as_ref()
            }
            Self::NeedsHuman { notification, .. } => notification.as_ref(),
            Self::Goodbye { .. } | Self::Menu { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Exit,
    Menu,
    FreeForm,
}

pub struct Responder {
    store: ConversationStore,
    mailbox: Arc<Mailbox>,
    backend: Option<Arc<dyn ChatBackend>>,
    alerter: Option<Arc<dyn StaffAlerter>>,
    retry: RetryPolicy,
    settings: ResponderSettings,
}

impl Responder {
    pub fn new(
        store: ConversationStore,
        mailbox: Arc<Mailbox>,
        backend: Option<Arc<dyn ChatBackend>>,
        settings: ResponderSettings,
    ) -> Self {
        Self {
            store,
            mailbox,
            backend,
            alerter: None,
            retry: RetryPolicy::default(),
            settings,
        }
    }

    pub fn with_alerter(mut self, alerter: Option<Arc<dyn StaffAlerter>>) -> Self {
        self.alerter = alerter;
        self
    }

    #[cfg(test)]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn settings(&self) -> &ResponderSettings {
        &self.settings
    }

    /// Runs one customer turn. Only a failed write of the customer's message
    /// is an error; a failed completion degrades to [`TurnOutcome::Fallback`].
    #[tracing::instrument(level = "info", skip(self, text))]
    pub async fn handle(&self, user_id: &str, text: &str) -> Result<TurnOutcome, StoreError> {
        let text = text.trim();
        let metadata = self.store.get_metadata(user_id).await;
        match metadata.handoff {
            Handoff::HumanHandled { agent_id } => {
                return self.defer_to_human(user_id, text, agent_id).await;
            }
            Handoff::AiHandled | Handoff::Closed { .. } => {}
        }

        match self.classify(text) {
            Intent::Exit => {
                let goodbye = self.settings.goodbye_text.clone();
                self.store
                    .append_message(user_id, Role::User, text, None)
                    .await?;
                self.store
                    .append_message(user_id, Role::Assistant, &goodbye, None)
                    .await?;
                return Ok(TurnOutcome::Goodbye { text: goodbye });
            }
            Intent::Menu => {
                if let Some(document) = self.settings.menu.clone() {
                    self.store
                        .append_message(user_id, Role::User, text, None)
                        .await?;
                    self.store
                        .append_message(user_id, Role::Assistant, &document.caption, None)
                        .await?;
                    return Ok(TurnOutcome::Menu { document });
                }
            }
            Intent::FreeForm => {}
        }

        let history = self
            .store
            .append_message(user_id, Role::User, text, None)
            .await?;
        let prior = &history[..history.len().saturating_sub(1)];

        match self.complete(&history).await {
            Ok(reply) => {
                // The customer still gets the generated answer.
                if let Err(error) = self
                    .store
                    .append_message(user_id, Role::Assistant, &reply, None)
                    .await
                {
                    tracing::warn!(user_id, error = %error, "failed to record assistant reply");
                }
                let escalation = self
                    .escalate(
                        user_id,
                        &TurnContext {
                            prior,
                            user_message: text,
                            reply: Some(&reply),
                        },
                    )
                    .await;
                Ok(TurnOutcome::Reply {
                    text: reply,
                    escalation,
                })
            }
            Err(error) => {
                tracing::error!(user_id, error = %error, "completion unavailable; sending fallback");
                let fallback = self.settings.fallback_text.clone();
                if let Err(error) = self
                    .store
                    .append_message(user_id, Role::Assistant, &fallback, None)
                    .await
                {
                    tracing::warn!(user_id, error = %error, "failed to record fallback reply");
                }
                let escalation = self
                    .escalate(
                        user_id,
                        &TurnContext {
                            prior,
                            user_message: text,
                            reply: None,
                        },
                    )
                    .await;
                Ok(TurnOutcome::Fallback {
                    text: fallback,
                    escalation,
                })
            }
        }
    }

    async fn defer_to_human(
        &self,
        user_id: &str,
        text: &str,
        agent_id: String,
    ) -> Result<TurnOutcome, StoreError> {
        self.store
            .append_message(user_id, Role::User, text, None)
            .await?;
        tracing::info!(user_id, agent_id = %agent_id, "conversation is human-handled; skipping completion");
        let new = NewNotification::new(
            NotificationKind::NewMessage,
            format!("Nouveau message de {user_id}"),
            text,
        )
        .for_user(user_id)
        .with_extra(serde_json::json!({ "agentId": agent_id }));
        let notification = self.raise(new).await;
        Ok(TurnOutcome::NeedsHuman {
            agent_id,
            notification,
        })
    }

    fn classify(&self, text: &str) -> Intent {
        let lowered = text.to_lowercase();
        let lowered = lowered.trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace());
        if EXIT_PHRASES.contains(&lowered) {
            return Intent::Exit;
        }
        if MENU_PHRASES.iter().any(|p| lowered.contains(p)) {
            return Intent::Menu;
        }
        Intent::FreeForm
    }

    async fn complete(&self, history: &[Message]) -> Result<String, LlmError> {
        let backend = self.backend.as_deref().ok_or(LlmError::NotConfigured)?;
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.settings.system_prompt.as_str()));
        messages.extend(history.iter().map(|m| match m.role {
            Role::User => ChatMessage::user(m.content.as_str()),
            Role::Assistant => ChatMessage::assistant(m.content.as_str()),
        }));
        let response = chat_with_retry(backend, &messages, self.retry).await?;
        let reply = response.message.content.trim();
        if reply.is_empty() {
            return Err(LlmError::ResponseFormat("empty completion".to_string()));
        }
        Ok(reply.to_string())
    }

    async fn escalate(&self, user_id: &str, turn: &TurnContext<'_>) -> Option<Notification> {
        let found = escalation::detect(turn)?;
        tracing::info!(user_id, rule = ?found.rule, kind = %found.kind, "escalation detected");
        self.raise(found.notification(user_id, turn.user_message))
            .await
    }

    /// Creates the notification, then alerts staff best-effort.
    async fn raise(&self, new: NewNotification) -> Option<Notification> {
        let notification = match self.mailbox.create(new).await {
            Ok(notification) => notification,
            Err(error) => {
                tracing::error!(error = %error, "failed to create notification");
                return None;
            }
        };
        if let Some(alerter) = &self.alerter {
            let alert = notification.staff_alert();
            if let Err(error) = alerter.alert(&alert).await {
                tracing::warn!(
                    notification_id = %notification.id,
                    error = %error,
                    "staff alert failed"
                );
            }
        }
        Some(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{AI_AGENT, HandoffStatus};
    use crate::kv::{KvError, KvStore, MemoryKv};
    use async_trait::async_trait;
    use rd_channels::StaffAlert;
    use rd_llm::{ChatResponse, Usage};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedBackend {
        replies: Mutex<Vec<rd_llm::Result<String>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<rd_llm::Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat(&self, messages: &[ChatMessage]) -> rd_llm::Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().expect("seen").push(messages.to_vec());
            let next = {
                let mut replies = self.replies.lock().expect("replies");
                if replies.is_empty() {
                    Err(LlmError::Http("script exhausted".to_string()))
                } else {
                    replies.remove(0)
                }
            };
            next.map(|content| ChatResponse {
                message: ChatMessage::assistant(content),
                usage: Usage::default(),
                finish_reason: "stop".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingAlerter {
        alerts: Mutex<Vec<StaffAlert>>,
    }

    #[async_trait]
    impl StaffAlerter for RecordingAlerter {
        async fn alert(&self, alert: &StaffAlert) -> anyhow::Result<()> {
            self.alerts.lock().expect("alerts").push(alert.clone());
            Ok(())
        }
    }

    struct Harness {
        store: ConversationStore,
        mailbox: Arc<Mailbox>,
        backend: Arc<ScriptedBackend>,
        responder: Responder,
    }

    fn harness(replies: Vec<rd_llm::Result<String>>, settings: ResponderSettings) -> Harness {
        let kv = Arc::new(MemoryKv::new());
        let store = ConversationStore::new(kv.clone());
        let mailbox = Arc::new(Mailbox::new(kv));
        let backend = ScriptedBackend::new(replies);
        let responder = Responder::new(
            store.clone(),
            mailbox.clone(),
            Some(backend.clone() as Arc<dyn ChatBackend>),
            settings,
        )
        .with_retry_policy(RetryPolicy::immediate(3));
        Harness {
            store,
            mailbox,
            backend,
            responder,
        }
    }

    /// Accepts the first history write, rejects every later one.
    struct HistoryWriteOnce {
        inner: MemoryKv,
        history_writes: AtomicUsize,
    }

    #[async_trait]
    impl KvStore for HistoryWriteOnce {
        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvError> {
            self.inner.get(key).await
        }

        async fn put(
            &self,
            key: &str,
            value: serde_json::Value,
            ttl: Option<std::time::Duration>,
        ) -> Result<(), KvError> {
            if key.starts_with("chat_history:") && self.history_writes.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(KvError::Backend("disk full".to_string()));
            }
            self.inner.put(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), KvError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn first_message_help_request_is_answered_and_escalated() {
        let h = harness(
            vec![Ok("Bien sûr, que puis-je faire ?".to_string())],
            ResponderSettings::default(),
        );
        let outcome = h.responder.handle("u1", "help me please").await.expect("turn");
        let TurnOutcome::Reply { text, escalation } = outcome else {
            panic!("expected a reply");
        };
        assert_eq!(text, "Bien sûr, que puis-je faire ?");
        let escalation = escalation.expect("escalated");
        assert_eq!(escalation.kind, NotificationKind::HelpNeeded);
        assert!(escalation.urgent);
        assert_eq!(escalation.user_id.as_deref(), Some("u1"));

        let pending = h.mailbox.list_pending().await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(h.mailbox.acknowledge(&[pending[0].id.as_str()]).await, 1);
        assert!(h.mailbox.list_pending().await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn human_handled_conversation_skips_completion() {
        let h = harness(vec![], ResponderSettings::default());
        h.store
            .append_message("u1", Role::User, "bonjour", None)
            .await
            .expect("seed");
        h.store
            .set_status("u1", Some("a1"), HandoffStatus::HumanHandled)
            .await
            .expect("take over");

        let outcome = h
            .responder
            .handle("u1", "vous êtes là ?")
            .await
            .expect("turn");
        let TurnOutcome::NeedsHuman {
            agent_id,
            notification,
        } = outcome
        else {
            panic!("expected needs-human");
        };
        assert_eq!(agent_id, "a1");
        assert_eq!(
            notification.map(|n| n.kind),
            Some(NotificationKind::NewMessage)
        );
        assert_eq!(h.backend.calls(), 0);

        let history = h.store.get_history("u1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::User);
        assert_eq!(history[1].content, "vous êtes là ?");
    }

    #[tokio::test]
    async fn exit_and_menu_intents_skip_the_backend() {
        let settings = ResponderSettings {
            menu: Some(MenuDocument {
                url: "https://example.com/carte.pdf".to_string(),
                filename: "carte.pdf".to_string(),
                caption: "Voici notre carte".to_string(),
            }),
            ..ResponderSettings::default()
        };
        let h = harness(vec![], settings);

        let outcome = h.responder.handle("u1", "Au revoir !").await.expect("turn");
        assert!(matches!(outcome, TurnOutcome::Goodbye { .. }));

        let outcome = h
            .responder
            .handle("u1", "Je peux voir le menu ? help me")
            .await
            .expect("turn");
        let TurnOutcome::Menu { document } = outcome else {
            panic!("expected menu");
        };
        assert_eq!(document.filename, "carte.pdf");

        assert_eq!(h.backend.calls(), 0);
        assert_eq!(h.store.get_history("u1").await.len(), 4);
        // Intent turns never run escalation.
        assert!(h.mailbox.list_pending().await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn menu_without_document_goes_to_the_model() {
        let h = harness(vec![Ok("Pizzas et pâtes.".to_string())], ResponderSettings::default());
        let outcome = h.responder.handle("u1", "le menu ?").await.expect("turn");
        assert!(matches!(outcome, TurnOutcome::Reply { .. }));
        assert_eq!(h.backend.calls(), 1);
    }

    #[tokio::test]
    async fn backend_failure_falls_back_after_retries() {
        let h = harness(
            vec![
                Err(LlmError::Http("connection reset".to_string())),
                Err(LlmError::Status {
                    status: 503,
                    body: "overloaded".to_string(),
                }),
                Err(LlmError::Http("timeout".to_string())),
            ],
            ResponderSettings::default(),
        );
        let outcome = h
            .responder
            .handle("u1", "Vous ouvrez à quelle heure ?")
            .await
            .expect("turn");
        let TurnOutcome::Fallback { text, escalation } = outcome else {
            panic!("expected fallback");
        };
        assert!(text.starts_with("Désolé"));
        assert!(escalation.is_none());
        assert_eq!(h.backend.calls(), 3);

        let history = h.store.get_history("u1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, text);
    }

    #[tokio::test]
    async fn uncertain_reply_escalates_and_alerts_staff() {
        let kv = Arc::new(MemoryKv::new());
        let store = ConversationStore::new(kv.clone());
        let mailbox = Arc::new(Mailbox::new(kv));
        let backend = ScriptedBackend::new(vec![Ok("Je ne sais pas, désolé.".to_string())]);
        let alerter = Arc::new(RecordingAlerter::default());
        let responder = Responder::new(
            store,
            mailbox,
            Some(backend as Arc<dyn ChatBackend>),
            ResponderSettings::default(),
        )
        .with_alerter(Some(alerter.clone() as Arc<dyn StaffAlerter>));

        let outcome = responder
            .handle("u2", "Vous avez des options véganes ?")
            .await
            .expect("turn");
        assert_eq!(
            outcome.escalation().map(|n| n.kind.clone()),
            Some(NotificationKind::HelpNeeded)
        );
        let alerts = alerter.alerts.lock().expect("alerts");
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].urgent);
        assert_eq!(alerts[0].payload["userId"], "u2");
    }

    #[tokio::test]
    async fn prompt_carries_system_and_bounded_history() {
        let h = harness(vec![Ok("ok".to_string())], ResponderSettings::default());
        for i in 0..40 {
            h.store
                .append_message("u1", Role::User, &format!("m{i}"), None)
                .await
                .expect("seed");
        }
        h.responder.handle("u1", "dernière question").await.expect("turn");
        let seen = h.backend.seen.lock().expect("seen");
        let prompt = &seen[0];
        assert_eq!(prompt[0].role, rd_llm::Role::System);
        assert_eq!(prompt.len(), 31);
        assert_eq!(prompt[30].content, "dernière question");
    }

    #[tokio::test]
    async fn closed_conversation_with_history_is_answered() {
        let h = harness(vec![Ok("Rebonjour !".to_string())], ResponderSettings::default());
        h.store
            .append_message("u1", Role::User, "bonjour", None)
            .await
            .expect("seed");
        h.store
            .set_status("u1", None, HandoffStatus::Closed)
            .await
            .expect("close");
        let outcome = h.responder.handle("u1", "re").await.expect("turn");
        assert!(matches!(outcome, TurnOutcome::Reply { .. }));
        assert_eq!(h.store.get_metadata("u1").await.handled_by(), AI_AGENT);
    }

    #[tokio::test]
    async fn generated_reply_survives_a_failed_history_write() {
        let store = ConversationStore::new(Arc::new(HistoryWriteOnce {
            inner: MemoryKv::new(),
            history_writes: AtomicUsize::new(0),
        }));
        let mailbox = Arc::new(Mailbox::new(Arc::new(MemoryKv::new())));
        let backend = ScriptedBackend::new(vec![Ok("Nous ouvrons à 11h30.".to_string())]);
        let responder = Responder::new(
            store.clone(),
            mailbox,
            Some(backend.clone() as Arc<dyn ChatBackend>),
            ResponderSettings::default(),
        )
        .with_retry_policy(RetryPolicy::immediate(3));

        let outcome = responder
            .handle("u1", "À quelle heure ouvrez-vous ?")
            .await
            .expect("turn");
        let TurnOutcome::Reply { text, .. } = outcome else {
            panic!("expected the generated reply");
        };
        assert_eq!(text, "Nous ouvrons à 11h30.");
        assert_eq!(store.get_history("u1").await.len(), 1);
    }
}
