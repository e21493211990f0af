//! Chat session coordination for the active problem.
//!
//! [`ChatState`] holds the conversation state machine; [`ChatCoordinator`]
//! drives it from a single task, talking to persistence and the LLM provider.

pub mod config;
pub mod context;
pub mod coordinator;
pub mod events;
pub mod message;
pub mod persistence;
pub mod state;

pub use config::{ChatConfig, DEFAULT_SYSTEM_PROMPT};
pub use context::{problem_context, with_problem_context};
pub use coordinator::{ChatCoordinator, CoordinatorError, CoordinatorResult};
pub use events::{ChatNotice, FailureKind, StreamFragment, SubmitRejection};
pub use message::{Message, Role, compose_display_content};
pub use persistence::{
    ConversationPersistence, PersistenceError, PersistenceResult, StoreConversationPersistence,
};
pub use state::{
    ActivateOutcome, ChatSnapshot, ChatState, ClearOutcome, FailureOutcome, FragmentOutcome,
    LoadTicket, PersistRequest, PreparedExchange,
};
