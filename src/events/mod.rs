pub mod notifier;
pub mod producer;
pub mod types;

pub use notifier::{FailureNotifier, KafkaFailureNotifier, LoggingNotifier};
pub use producer::{EventProducer, ProducerBuilder, ProducerConfig};
pub use types::{topics, EventEnvelope, EventType, FailureEvent, FailureKind};
