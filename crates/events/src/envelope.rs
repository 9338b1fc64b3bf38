use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope for a dispatched event.
///
/// Built by the dispatcher at emit time; carries the delivery metadata that is
/// not part of the domain payload. Envelopes are not persisted here; durable
/// event storage, if any, is a consumer's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<E> {
    event_id: Uuid,
    /// Distinguishes production traffic from test/sandbox traffic.
    livemode: bool,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> Envelope<E> {
    pub fn new(event_id: Uuid, livemode: bool, occurred_at: DateTime<Utc>, payload: E) -> Self {
        Self {
            event_id,
            livemode,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn livemode(&self) -> bool {
        self.livemode
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
