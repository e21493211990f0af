use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use psup_storage::{ChatStore, StorageError, StoredMessage};
use snafu::{ResultExt, Snafu};

use crate::message::Message;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PersistenceError {
    #[snafu(display("conversation store failed on `{stage}`, {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("conversation store task failed on `{stage}`, {source}"))]
    StoreTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

/// Durable home of per-problem conversations.
///
/// A save replaces the whole stored conversation of the problem.
pub trait ConversationPersistence: Send + Sync {
    fn load_conversation<'a>(
        &'a self,
        problem_id: &'a str,
    ) -> BoxFuture<'a, PersistenceResult<Vec<Message>>>;

    fn save_conversation<'a>(
        &'a self,
        problem_id: &'a str,
        messages: &'a [Message],
    ) -> BoxFuture<'a, PersistenceResult<()>>;
}

/// Adapts a synchronous [`ChatStore`] by running its calls on the blocking pool.
pub struct StoreConversationPersistence<S> {
    store: Arc<S>,
}

impl<S> StoreConversationPersistence<S>
where
    S: ChatStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S> ConversationPersistence for StoreConversationPersistence<S>
where
    S: ChatStore + 'static,
{
    fn load_conversation<'a>(
        &'a self,
        problem_id: &'a str,
    ) -> BoxFuture<'a, PersistenceResult<Vec<Message>>> {
        let store = Arc::clone(&self.store);
        let problem_id = problem_id.to_string();
        Box::pin(async move {
            let record = tokio::task::spawn_blocking(move || store.load_chat(&problem_id))
                .await
                .context(StoreTaskSnafu {
                    stage: "load-conversation-join",
                })?
                .context(StoreSnafu {
                    stage: "load-conversation",
                })?;

            Ok(record
                .map(|record| record.messages.into_iter().map(Message::from).collect())
                .unwrap_or_default())
        })
    }

    fn save_conversation<'a>(
        &'a self,
        problem_id: &'a str,
        messages: &'a [Message],
    ) -> BoxFuture<'a, PersistenceResult<()>> {
        let store = Arc::clone(&self.store);
        let problem_id = problem_id.to_string();
        let stored = messages.iter().map(StoredMessage::from).collect::<Vec<_>>();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || store.save_chat(&problem_id, &stored))
                .await
                .context(StoreTaskSnafu {
                    stage: "save-conversation-join",
                })?
                .context(StoreSnafu {
                    stage: "save-conversation",
                })?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use psup_storage::SqliteStorage;

    use super::*;

    async fn persistence() -> (tempfile::TempDir, StoreConversationPersistence<SqliteStorage>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chat.db");
        let storage = SqliteStorage::open(path.to_str().expect("utf-8 path"))
            .await
            .expect("open storage");
        (dir, StoreConversationPersistence::new(Arc::new(storage)))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_problem_loads_as_empty() {
        let (_dir, persistence) = persistence().await;

        let messages = persistence.load_conversation("404").await.expect("load");

        assert!(messages.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_replaces_stored_conversation() {
        let (_dir, persistence) = persistence().await;
        let first = vec![Message::user("q"), Message::assistant("a")];
        let second = vec![Message::user("only")];

        persistence.save_conversation("1", &first).await.expect("save");
        assert_eq!(persistence.load_conversation("1").await.expect("load"), first);

        persistence.save_conversation("1", &second).await.expect("save");
        assert_eq!(persistence.load_conversation("1").await.expect("load"), second);

        persistence.save_conversation("1", &[]).await.expect("save");
        assert!(persistence.load_conversation("1").await.expect("load").is_empty());
    }
}
