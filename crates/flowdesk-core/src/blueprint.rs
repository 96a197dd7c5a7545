//! Blueprint evaluation - checks a proposed action against a step's green
//! (allowed) and red (forbidden) lists.
//!
//! Matching is case-insensitive on normalized words: punctuation, `_` and
//! `-` collapse to single spaces, so `send_email`, `Send email` and
//! `send-email` are the same action. A list entry matches when the action
//! equals it or contains it as a whole-word phrase (`"send email to client"`
//! matches the entry `"send email"`). Red always wins over green.

use serde::{Deserialize, Serialize};

use crate::models::workflow::Blueprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlueprintVerdict {
    Allowed,
    Forbidden,
    /// Neither list mentions the action.
    Unlisted,
}

impl BlueprintVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Forbidden => "forbidden",
            Self::Unlisted => "unlisted",
        }
    }
}

/// How an unlisted action is treated by the capability that asks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    #[default]
    Allow,
    Deny,
}

/// Pure evaluation of `action` against `blueprint`.
pub fn evaluate(action: &str, blueprint: &Blueprint) -> BlueprintVerdict {
    let action = normalize(action);
    if action.is_empty() {
        return BlueprintVerdict::Unlisted;
    }
    if blueprint.red_list.iter().any(|entry| matches_entry(&action, entry)) {
        return BlueprintVerdict::Forbidden;
    }
    if blueprint.green_list.iter().any(|entry| matches_entry(&action, entry)) {
        return BlueprintVerdict::Allowed;
    }
    BlueprintVerdict::Unlisted
}

/// Evaluator with an explicit default for unlisted actions.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlueprintEvaluator {
    pub default_policy: DefaultPolicy,
}

impl BlueprintEvaluator {
    pub fn new(default_policy: DefaultPolicy) -> Self {
        Self { default_policy }
    }

    pub fn evaluate(&self, action: &str, blueprint: &Blueprint) -> BlueprintVerdict {
        evaluate(action, blueprint)
    }

    /// Allow/deny decision with the default policy applied to unlisted
    /// actions.
    pub fn is_permitted(&self, action: &str, blueprint: &Blueprint) -> bool {
        match evaluate(action, blueprint) {
            BlueprintVerdict::Allowed => true,
            BlueprintVerdict::Forbidden => false,
            BlueprintVerdict::Unlisted => self.default_policy == DefaultPolicy::Allow,
        }
    }
}

fn matches_entry(normalized_action: &str, entry: &str) -> bool {
    let entry = normalize(entry);
    if entry.is_empty() {
        return false;
    }
    normalized_action == entry
        || format!(" {} ", normalized_action).contains(&format!(" {} ", entry))
}

fn normalize(s: &str) -> String {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
