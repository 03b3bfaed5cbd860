//! Conversational coaching session engine.
//!
//! One [`SessionEngine`] drives one conversation surface: it resolves the goal's thread,
//! inserts provisional messages, folds streamed replies, reconciles server identifiers
//! and rolls failed turns back.
pub mod engine;
pub mod error;
pub mod events;
pub mod message;
pub mod resolver;
pub mod selection;
pub mod session;
pub mod settings;
pub mod state;
pub mod store;
pub mod trigger;

pub use engine::{SessionEngine, SessionSnapshot, ThreadStatus};
pub use error::{RejectReason, SessionError, SessionResult};
pub use events::{SendFailureKind, SessionEvent};
pub use message::{LocalMessageId, Message, MessageKey};
pub use resolver::{ThreadResolver, select_active_thread};
pub use selection::{ActivitySelection, BatchReclassifier, TrainingLoadPolicy};
pub use session::{CoachSession, Surface, TurnOutcome};
pub use settings::{CoachSettings, SettingsError, SettingsResult, SettingsStore};
pub use state::{SessionState, SessionTransition, TransitionRejection};
pub use store::{MessageStore, TurnToken};
pub use trigger::{AutoTriggerGate, TriggerPhase, TriggerToken};
