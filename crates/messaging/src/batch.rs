//! Partitioning of a resolved recipient list into batch units.

use serde::{Deserialize, Serialize};

use bulkmsg_core::{DomainError, DomainResult, JobId, RecipientId, SenderId};

use crate::job::MessagePayload;

/// Recipients per batch unit. Always at least 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct BatchSize(usize);

impl BatchSize {
    pub const DEFAULT: usize = 50;

    pub fn new(size: usize) -> DomainResult<Self> {
        if size == 0 {
            return Err(DomainError::validation("batch size must be at least 1"));
        }
        Ok(Self(size))
    }

    /// Configured value, falling back to the default when below 1.
    pub fn or_default(size: i64) -> Self {
        if size < 1 {
            Self::default()
        } else {
            Self(size as usize)
        }
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<usize> for BatchSize {
    type Error = DomainError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BatchSize> for usize {
    fn from(value: BatchSize) -> Self {
        value.0
    }
}

/// One unit of dispatched work: a slice of recipients plus a copy of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUnit {
    pub job_id: JobId,
    /// Run generation the unit was dispatched for.
    pub run: u32,
    pub index: u32,
    pub recipient_ids: Vec<RecipientId>,
    pub payload: MessagePayload,
    pub sender_id: SenderId,
}

/// Number of batches needed for `recipients` recipients: ceil(N / size).
pub fn batch_count(recipients: usize, size: BatchSize) -> usize {
    recipients.div_ceil(size.get())
}

/// Split `recipients` into consecutive batch units of at most `size` each.
///
/// Order is preserved and every recipient lands in exactly one unit.
pub fn partition(
    job_id: JobId,
    run: u32,
    recipients: &[RecipientId],
    size: BatchSize,
    payload: &MessagePayload,
    sender_id: SenderId,
) -> Vec<BatchUnit> {
    recipients
        .chunks(size.get())
        .enumerate()
        .map(|(index, chunk)| BatchUnit {
            job_id,
            run,
            index: index as u32,
            recipient_ids: chunk.to_vec(),
            payload: payload.clone(),
            sender_id,
        })
        .collect()
}
