pub mod error;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use sqlite::SqliteStorage;
pub use types::{
    ActivityDay, ChatRecord, MessageRole, ProblemRecord, ProblemStatement, Sample, StoredMessage,
    activity_level,
};

/// Default number of days covered by the activity heatmap.
pub const DEFAULT_ACTIVITY_DAYS: u32 = 365;

pub trait ChatStore: Send + Sync {
    fn load_chat(&self, problem_id: &str) -> StorageResult<Option<ChatRecord>>;
    fn save_chat(&self, problem_id: &str, messages: &[StoredMessage]) -> StorageResult<ChatRecord>;
}

pub trait ProblemStore: Send + Sync {
    fn save_problem(&self, statement: &ProblemStatement) -> StorageResult<ProblemRecord>;
    fn get_problem(&self, problem_id: &str) -> StorageResult<Option<ProblemRecord>>;
    fn list_problems(&self) -> StorageResult<Vec<ProblemRecord>>;
    /// Removes the problem together with its chat history.
    fn delete_problem(&self, problem_id: &str) -> StorageResult<()>;
}

pub trait SolveStore: Send + Sync {
    /// Returns `false` when the problem already has a solve record for today.
    fn record_solve(&self, problem_id: &str) -> StorageResult<bool>;
    fn unrecord_solve(&self, problem_id: &str) -> StorageResult<bool>;
    fn is_solved_today(&self, problem_id: &str) -> StorageResult<bool>;
    fn activity(&self, days: u32) -> StorageResult<Vec<ActivityDay>>;
}

pub trait Storage: ChatStore + ProblemStore + SolveStore {}

impl<T> Storage for T where T: ChatStore + ProblemStore + SolveStore {}
