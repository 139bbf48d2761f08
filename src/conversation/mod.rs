// src/conversation/mod.rs
//! Conversation Store (C6, §3.3/§4.6): bounded session history with
//! LLM-based summarisation of old turns. Sessions are serialised per
//! `sessionId` (§5), mirrored to a TTL cache, ephemeral by design.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::config::ConversationConfig;
use crate::llm::{CompletionOptions, LlmClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

struct SessionState {
    turns: Vec<Turn>,
    /// Per-session lock (§5: "Append(user) for turn T strictly precedes
    /// Append(assistant) for turn T ... serialising a session's request
    /// handlers").
    lock: Arc<AsyncMutex<()>>,
}

pub struct ConversationStore {
    llm: Arc<dyn LlmClient>,
    config: ConversationConfig,
    sessions: Mutex<HashMap<String, SessionState>>,
    mirror: TtlCache<Vec<Turn>>,
}

impl ConversationStore {
    pub fn new(llm: Arc<dyn LlmClient>, config: ConversationConfig) -> Self {
        let ttl = Duration::from_secs(config.session_ttl_secs);
        Self {
            llm,
            config,
            sessions: Mutex::new(HashMap::new()),
            mirror: TtlCache::new(ttl),
        }
    }

    pub fn new_session_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    pub async fn get(&self, session_id: &str) -> Vec<Turn> {
        if let Some(turns) = self.sessions.lock().get(session_id).map(|s| s.turns.clone()) {
            return turns;
        }
        self.mirror.get(session_id).unwrap_or_default()
    }

    fn session_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState {
                turns: Vec::new(),
                lock: Arc::new(AsyncMutex::new(())),
            })
            .lock
            .clone()
    }

    /// §4.6 `Append`: append, maybe-summarise, truncate, mirror. Serialised
    /// per session so ordering holds across concurrent callers on the same
    /// id (§5); concurrent requests on different ids proceed independently.
    pub async fn append(&self, session_id: &str, role: TurnRole, content: impl Into<String>) -> Result<()> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut turns = {
            let sessions = self.sessions.lock();
            sessions
                .get(session_id)
                .map(|s| s.turns.clone())
                .unwrap_or_default()
        };

        turns.push(Turn {
            role,
            content: content.into(),
            at: Utc::now(),
        });

        if turns.len() >= self.config.summarize_threshold {
            turns = self.summarize(session_id, turns).await;
        }

        truncate_to_bound(&mut turns, self.config.max_msg);

        {
            let mut sessions = self.sessions.lock();
            if let Some(state) = sessions.get_mut(session_id) {
                state.turns = turns.clone();
            }
        }
        self.mirror.insert(session_id.to_string(), turns);

        Ok(())
    }

    /// §4.6 summarisation. Idempotent: safe to re-enter, falls back to
    /// plain truncation on LLM failure (logged, not propagated).
    async fn summarize(&self, session_id: &str, turns: Vec<Turn>) -> Vec<Turn> {
        let keep_recent = self.config.keep_recent;
        if turns.len() <= keep_recent {
            return turns;
        }

        let prior_summary = turns.iter().find(|t| t.role == TurnRole::Summary).cloned();
        let non_summary: Vec<&Turn> = turns.iter().filter(|t| t.role != TurnRole::Summary).collect();

        if non_summary.len() <= keep_recent {
            return turns;
        }
        let split_at = non_summary.len() - keep_recent;
        let old = &non_summary[..split_at];
        let recent: Vec<Turn> = non_summary[split_at..].iter().map(|t| (*t).clone()).collect();

        if old.len() < 3 {
            return turns;
        }

        let prompt = build_summary_prompt(prior_summary.as_ref(), old);
        let opts = CompletionOptions {
            model: None,
            temperature: Some(0.3),
            max_tokens: Some(300),
            system: Some("Summarise the conversation so far, preserving task-relevant facts.".into()),
        };

        match self.llm.complete(&prompt, &opts).await {
            Ok(summary_text) => {
                let mut next = vec![Turn {
                    role: TurnRole::Summary,
                    content: summary_text,
                    at: Utc::now(),
                }];
                next.extend(recent);
                next
            }
            Err(e) => {
                warn!("summarisation failed for session {session_id}, falling back to truncation: {e}");
                let mut fallback = old.iter().map(|t| (*t).clone()).collect::<Vec<_>>();
                fallback.extend(recent);
                fallback
            }
        }
    }
}

/// §I4/P4: truncate from the head, keeping at most one leading summary
/// followed by non-summary turns in arrival order.
fn truncate_to_bound(turns: &mut Vec<Turn>, max_msg: usize) {
    let max_len = max_msg + 1;
    if turns.len() <= max_len {
        return;
    }
    let overflow = turns.len() - max_len;
    let summary_offset = if turns.first().map(|t| t.role == TurnRole::Summary).unwrap_or(false) {
        1
    } else {
        0
    };
    turns.drain(summary_offset..summary_offset + overflow.min(turns.len() - summary_offset));
}

fn build_summary_prompt(prior: Option<&Turn>, old: &[&Turn]) -> String {
    let mut prompt = String::new();
    if let Some(prior) = prior {
        prompt.push_str("Prior summary: ");
        prompt.push_str(&prior.content);
        prompt.push('\n');
    }
    prompt.push_str("Turns to fold in:\n");
    for turn in old {
        prompt.push_str(&format!("{:?}: {}\n", turn.role, turn.content));
    }
    prompt
}
