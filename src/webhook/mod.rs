pub mod event;
pub mod gate;
pub mod router;
pub mod signature;

pub use event::{EventKind, ProcessorEvent};
pub use gate::{IngestOutcome, WebhookIngestionGate};
pub use router::{EventHandler, EventRouter, HandlerOutcome};
pub use signature::WebhookVerifier;
