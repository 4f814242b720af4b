//! Conversation records kept by a communication manager.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A multi-party exchange; records only accumulate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub conversation_type: String,
    pub initiator: String,
    pub participants: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: u64,
}

impl Conversation {
    /// Ordered group used for traffic to one participant, keeping that thread in order
    pub fn ordered_group(&self, participant: &str) -> String {
        format!("conversation:{}:{participant}", self.id)
    }
}

#[derive(Debug, Default)]
pub struct ConversationRegistry {
    conversations: RwLock<BTreeMap<Uuid, Conversation>>,
}

impl ConversationRegistry {
    pub fn open(
        &self,
        conversation_type: impl Into<String>,
        initiator: impl Into<String>,
        participants: Vec<String>,
    ) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            conversation_type: conversation_type.into(),
            initiator: initiator.into(),
            participants,
            started_at: now,
            last_activity_at: now,
            message_count: 0,
        };
        self.conversations
            .write()
            .insert(conversation.id, conversation.clone());
        conversation
    }

    pub fn get(&self, id: Uuid) -> Option<Conversation> {
        self.conversations.read().get(&id).cloned()
    }

    /// Count messages sent within a conversation; unknown ids are ignored
    pub fn record_messages(&self, id: Uuid, count: u64) {
        if let Some(conversation) = self.conversations.write().get_mut(&id) {
            conversation.message_count += count;
            conversation.last_activity_at = Utc::now();
        }
    }

    pub fn list(&self) -> Vec<Conversation> {
        self.conversations.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.conversations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.read().is_empty()
    }
}
