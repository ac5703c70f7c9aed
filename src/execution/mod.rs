//! Pipeline execution engine
//!
//! The engine is split by concern into several `impl Engine` blocks: node
//! start and facilitation, step responses and advising, barriers,
//! interrupts, and status updates under optimistic concurrency.

pub mod advise;
pub mod barrier;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod facilitator;
pub mod interrupt;
pub mod queue;
pub mod status;

pub use advise::AdviseHandler;
pub use barrier::{BarrierCoordinator, DropOutcome};
pub use engine::{Engine, EngineBuilder, EngineConfig};
pub use error::{EngineError, InterruptRejection};
pub use events::{EventHandler, ExecutionEvent, SdkResponseEvent};
pub use executor::{ExecutorRegistry, StepContext, StepError, StepExecutor, StepResponse};
pub use queue::{InMemoryQueue, Message, MessageQueue, QueueError, Topic};
pub use status::{StatusObserver, StatusUpdate};
