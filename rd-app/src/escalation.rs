//! Heuristic escalation rules.
//!
//! Pure text matching over a single turn. Rules run strongest first and the
//! first match wins; raising the notification is the caller's job.

use crate::conversation::{Message, Role};
use crate::mailbox::{NewNotification, NotificationKind};

const DIRECT_HELP: &[&str] = &[
    "help me",
    "please help",
    "aidez-moi",
    "aidez moi",
    "besoin d'aide",
    "s'il vous plaît",
    "s'il vous plait",
    "j'ai besoin",
    "i need",
];

/// Help signals grouped by concept; spelling and language variants of one
/// concept count once.
const HELP_SIGNALS: &[&[&str]] = &[
    &["aide", "help"],
    &["problème", "probleme", "problem"],
    &["urgent"],
    &["humain", "human"],
    &["quelqu'un", "someone", "une personne", "real person"],
    &["parler à", "parler a", "speak to", "talk to"],
    &["réclamation", "complaint"],
    &["pas content", "not happy"],
    &["erreur", "wrong"],
];

const UNCERTAINTY: &[&str] = &[
    "je ne sais pas",
    "je ne suis pas sûr",
    "je ne suis pas sur",
    "pas certain",
    "désolé",
    "desole",
    "i'm not sure",
    "i am not sure",
    "i don't know",
    "sorry",
];

const ORDER_INTENT: &[&str] = &[
    "commander",
    "commande",
    "je voudrais",
    "je veux",
    "order",
    "i would like",
    "i'd like",
];

const ORDER_CONFIRMED: &[&str] = &[
    "confirmé",
    "confirmée",
    "confirme",
    "confirmed",
    "c'est noté",
    "bien noté",
];

/// One customer turn as the detector sees it. `prior` excludes
/// `user_message`; `reply` is the AI answer when one was produced.
#[derive(Debug, Clone, Copy)]
pub struct TurnContext<'a> {
    pub prior: &'a [Message],
    pub user_message: &'a str,
    pub reply: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    DirectRequest,
    EarlyHelpSignals,
    FollowUpAfterAnswer,
    AiUncertain,
    OrderConfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub kind: NotificationKind,
    pub urgent: bool,
    pub rule: Rule,
}

impl Escalation {
    fn help(urgent: bool, rule: Rule) -> Self {
        Self {
            kind: NotificationKind::HelpNeeded,
            urgent,
            rule,
        }
    }

    pub fn notification(&self, user_id: &str, user_message: &str) -> NewNotification {
        let title = match self.kind {
            NotificationKind::OrderConfirmed => format!("Commande confirmée ({user_id})"),
            _ if self.urgent => format!("Aide urgente demandée ({user_id})"),
            _ => format!("Le client a besoin d'aide ({user_id})"),
        };
        NewNotification::new(self.kind.clone(), title, excerpt(user_message))
            .for_user(user_id)
            .urgent(self.urgent)
            .with_extra(serde_json::json!({ "rule": format!("{:?}", self.rule) }))
    }
}

pub fn detect(turn: &TurnContext<'_>) -> Option<Escalation> {
    let user = normalize(turn.user_message);

    if contains_any(&user, DIRECT_HELP) {
        return Some(Escalation::help(true, Rule::DirectRequest));
    }

    if turn.prior.len() < 2 && matched_signals(&user) >= 2 {
        return Some(Escalation::help(true, Rule::EarlyHelpSignals));
    }

    // [*, assistant, user]: at least two prior turns, the last from the AI.
    let follows_answer = turn.prior.len() >= 2
        && turn
            .prior
            .last()
            .is_some_and(|m| m.role == Role::Assistant);
    if follows_answer && matched_signals(&user) >= 1 {
        return Some(Escalation::help(false, Rule::FollowUpAfterAnswer));
    }

    let reply = normalize(turn.reply?);
    if contains_any(&reply, UNCERTAINTY) {
        return Some(Escalation::help(true, Rule::AiUncertain));
    }

    if contains_any(&user, ORDER_INTENT) && contains_any(&reply, ORDER_CONFIRMED) {
        return Some(Escalation {
            kind: NotificationKind::OrderConfirmed,
            urgent: false,
            rule: Rule::OrderConfirmed,
        });
    }

    None
}

fn normalize(text: &str) -> String {
    text.to_lowercase().replace(['\u{2019}', '\u{2018}'], "'")
}

fn contains_any(text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| text.contains(p))
}

fn matched_signals(text: &str) -> usize {
    HELP_SIGNALS
        .iter()
        .filter(|variants| contains_any(text, variants))
        .count()
}

fn excerpt(text: &str) -> String {
    const MAX_CHARS: usize = 160;
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_CHARS).collect();
    out.push('…');
    out
}
