//! Development adapters for the collaborator ports.
//!
//! `InMemoryDirectory` stands in for the identity directory and
//! `TracingTransport` "delivers" by emitting a structured log event.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use bulkmsg_core::RecipientId;
use bulkmsg_messaging::{BodyFormat, RecipientSelection};

use super::ports::{MessageTransport, OutboundMessage, RecipientResolver, ResolveError, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: RecipientId,
    pub email: String,
    pub active: bool,
}

/// Recipient directory held in memory, in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    entries: RwLock<Vec<DirectoryEntry>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory with `count` active users `user{n}@example.com`, ids 1..=count.
    pub fn seeded(count: u64) -> Self {
        let directory = Self::new();
        for n in 1..=count {
            directory.upsert(RecipientId::new(n), format!("user{n}@example.com"), true);
        }
        directory
    }

    pub fn upsert(&self, id: RecipientId, email: impl Into<String>, active: bool) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let email = email.into();
        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.email = email;
                entry.active = active;
            }
            None => entries.push(DirectoryEntry { id, email, active }),
        }
    }

    pub fn set_active(&self, id: RecipientId, active: bool) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.active = active;
        }
    }

    pub fn is_active(&self, id: RecipientId) -> bool {
        self.snapshot().iter().any(|e| e.id == id && e.active)
    }

    fn snapshot(&self) -> Vec<DirectoryEntry> {
        match self.entries.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl RecipientResolver for InMemoryDirectory {
    /// Active recipients only.
    ///
    /// `Criteria` is a case-insensitive substring match on the email address;
    /// `List` keeps the listed ids that are known and active, in list order.
    async fn resolve(&self, selection: &RecipientSelection) -> Result<Vec<RecipientId>, ResolveError> {
        let entries = self.snapshot();
        let active = entries.iter().filter(|e| e.active);

        let ids = match selection {
            RecipientSelection::All => active.map(|e| e.id).collect(),
            RecipientSelection::Criteria(criteria) => {
                let needle = criteria.trim().to_lowercase();
                if needle.is_empty() {
                    return Err(ResolveError::InvalidSelection("empty criteria".to_string()));
                }
                active
                    .filter(|e| e.email.to_lowercase().contains(&needle))
                    .map(|e| e.id)
                    .collect()
            }
            RecipientSelection::List(ids) => ids
                .iter()
                .copied()
                .filter(|id| entries.iter().any(|e| e.id == *id && e.active))
                .collect(),
        };

        Ok(ids)
    }
}

/// Transport that logs each delivery.
///
/// Recipients unknown to, or suspended in, the directory are rejected.
#[derive(Debug, Clone)]
pub struct TracingTransport {
    directory: Arc<InMemoryDirectory>,
}

impl TracingTransport {
    pub fn new(directory: Arc<InMemoryDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl MessageTransport for TracingTransport {
    async fn send(&self, message: OutboundMessage<'_>) -> Result<(), TransportError> {
        if !self.directory.is_active(message.recipient) {
            return Err(TransportError::Rejected {
                recipient: message.recipient,
                reason: "recipient is not an active user".to_string(),
            });
        }

        info!(
            recipient = %message.recipient,
            sender = %message.sender,
            subject = message.subject,
            format = ?message.format,
            preview = %preview(message.format, message.body),
            "message delivered"
        );
        Ok(())
    }
}

const PREVIEW_CHARS: usize = 60;

/// Leading plain text of a body, for log lines.
fn preview(format: BodyFormat, body: &str) -> String {
    let text = format.plain_text(body);
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text,
    }
}
