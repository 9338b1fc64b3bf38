//! `rebill-events` — typed lifecycle events and their dispatcher.
//!
//! The dispatcher decouples lifecycle transitions from their side effects
//! (notifications, provider sync, analytics). Emitters hand over a typed
//! payload; consumers register handlers per event type or as wildcards.

pub mod dispatcher;
pub mod envelope;
pub mod event;

pub use dispatcher::{EventDispatcher, HandlerId, WaitError, DEFAULT_WAIT_TIMEOUT};
pub use envelope::Envelope;
pub use event::{
    CanceledNonpayment, EnteredGracePeriod, EventKind, LifecycleEvent, RenewalFailed,
    RetryFailed, RetrySucceeded, SubscriptionRenewed, TrialConversionFailed, TrialConverted,
};
