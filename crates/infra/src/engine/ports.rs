//! Collaborator boundaries: where recipients come from and how a message leaves.

use async_trait::async_trait;
use thiserror::Error;

use bulkmsg_core::{RecipientId, SenderId};
use bulkmsg_messaging::{BodyFormat, RecipientSelection};

/// Enumerates recipients for a selection.
///
/// Must be re-callable: a restart asks again for the persisted selection.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve(&self, selection: &RecipientSelection) -> Result<Vec<RecipientId>, ResolveError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid recipient selection: {0}")]
    InvalidSelection(String),
    #[error("recipient directory unavailable: {0}")]
    Unavailable(String),
}

/// One message to one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundMessage<'a> {
    pub recipient: RecipientId,
    pub subject: &'a str,
    pub body: &'a str,
    pub format: BodyFormat,
    pub sender: SenderId,
}

/// Delivers one message to one recipient.
///
/// Ordinary delivery failures are `Err` values, never panics.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, message: OutboundMessage<'_>) -> Result<(), TransportError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The recipient cannot receive messages (unknown, suspended, opted out).
    #[error("recipient {recipient} rejected: {reason}")]
    Rejected { recipient: RecipientId, reason: String },

    /// Delivery to this recipient failed for any other reason.
    #[error("delivery failed: {0}")]
    Failed(String),

    /// The transport as a whole is down; the batch should be retried later.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}
