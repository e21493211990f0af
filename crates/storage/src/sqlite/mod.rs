use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::error::{
    CreateSqliteDirectorySnafu, DecodePayloadSnafu, EncodePayloadSnafu, InvariantViolationSnafu,
    NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu,
    StorageError, StorageResult,
};
use super::types::{
    ActivityDay, ChatRecord, ProblemRecord, ProblemStatement, Sample, StoredMessage,
    activity_level,
};
use super::{ChatStore, ProblemStore, SolveStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        // Store calls open their own connections; the pool only serves setup.
        pool.close().await;

        tracing::info!(database_url = %database_url, "opened sqlite storage");
        Ok(Self { database_url })
    }

    /// Records a solve at an explicit instant; the calendar day is derived in UTC.
    pub fn record_solve_at(&self, problem_id: &str, unix_seconds: i64) -> StorageResult<bool> {
        let database_url = self.database_url.clone();
        let problem_id = problem_id.to_string();
        self.run_db_call("solve-record", async move {
            let mut connection =
                connect_store_connection(&database_url, "solve-record-connect").await?;

            // One record per problem per day is enforced by the unique index.
            let result = sqlx::query(
                "INSERT OR IGNORE INTO solve_records (problem_id, solved_on, solved_at) VALUES (?, date(?, 'unixepoch'), ?)",
            )
            .bind(&problem_id)
            .bind(unix_seconds)
            .bind(unix_seconds)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "solve-record-insert",
            })?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl ChatStore for SqliteStorage {
    fn load_chat(&self, problem_id: &str) -> StorageResult<Option<ChatRecord>> {
        let database_url = self.database_url.clone();
        let problem_id = problem_id.to_string();
        self.run_db_call("chat-load", async move {
            let mut connection = connect_store_connection(&database_url, "chat-load-connect").await?;
            let row = sqlx::query_as::<_, ChatRow>(
                "SELECT id, problem_id, messages_json, created_at, updated_at FROM chats WHERE problem_id = ?",
            )
            .bind(&problem_id)
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-load-query",
            })?;

            row.map(chat_row_to_record).transpose()
        })
    }

    fn save_chat(&self, problem_id: &str, messages: &[StoredMessage]) -> StorageResult<ChatRecord> {
        let messages_json = serde_json::to_string(messages).context(EncodePayloadSnafu {
            stage: "chat-save-encode",
            entity: "chat",
        })?;
        let database_url = self.database_url.clone();
        let problem_id = problem_id.to_string();
        self.run_db_call("chat-save", async move {
            let mut connection = connect_store_connection(&database_url, "chat-save-connect").await?;
            let now = unix_timestamp_seconds();

            sqlx::query(
                "INSERT INTO chats (problem_id, messages_json, created_at, updated_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(problem_id) DO UPDATE SET messages_json = excluded.messages_json, updated_at = excluded.updated_at",
            )
            .bind(&problem_id)
            .bind(messages_json)
            .bind(now)
            .bind(now)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-save-upsert",
            })?;

            let row = sqlx::query_as::<_, ChatRow>(
                "SELECT id, problem_id, messages_json, created_at, updated_at FROM chats WHERE problem_id = ?",
            )
            .bind(&problem_id)
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-save-load",
            })?
            .context(NotFoundSnafu {
                stage: "chat-save-load-missing",
                entity: "chat",
                id: problem_id.clone(),
            })?;

            chat_row_to_record(row)
        })
    }
}

impl ProblemStore for SqliteStorage {
    fn save_problem(&self, statement: &ProblemStatement) -> StorageResult<ProblemRecord> {
        let samples_json =
            serde_json::to_string(&statement.samples).context(EncodePayloadSnafu {
                stage: "problem-save-encode-samples",
                entity: "problem samples",
            })?;
        let database_url = self.database_url.clone();
        let statement = statement.clone();
        self.run_db_call("problem-save", async move {
            let mut connection =
                connect_store_connection(&database_url, "problem-save-connect").await?;
            let now = unix_timestamp_seconds();

            // Re-fetching a problem refreshes created_at so it moves to the top of history.
            sqlx::query(
                "INSERT INTO problems (problem_id, title, description, input_description, output_description, samples_json, time_limit, memory_limit, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(problem_id) DO UPDATE SET title = excluded.title, description = excluded.description, \
                 input_description = excluded.input_description, output_description = excluded.output_description, \
                 samples_json = excluded.samples_json, time_limit = excluded.time_limit, \
                 memory_limit = excluded.memory_limit, created_at = excluded.created_at",
            )
            .bind(&statement.id)
            .bind(&statement.title)
            .bind(&statement.description)
            .bind(&statement.input_description)
            .bind(&statement.output_description)
            .bind(samples_json)
            .bind(&statement.time_limit)
            .bind(&statement.memory_limit)
            .bind(now)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "problem-save-upsert",
            })?;

            let row = sqlx::query_as::<_, ProblemRow>(PROBLEM_SELECT_BY_ID)
                .bind(&statement.id)
                .fetch_optional(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "problem-save-load",
                })?
                .context(NotFoundSnafu {
                    stage: "problem-save-load-missing",
                    entity: "problem",
                    id: statement.id.clone(),
                })?;

            problem_row_to_record(row)
        })
    }

    fn get_problem(&self, problem_id: &str) -> StorageResult<Option<ProblemRecord>> {
        let database_url = self.database_url.clone();
        let problem_id = problem_id.to_string();
        self.run_db_call("problem-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "problem-get-connect").await?;
            let row = sqlx::query_as::<_, ProblemRow>(PROBLEM_SELECT_BY_ID)
                .bind(&problem_id)
                .fetch_optional(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "problem-get-query",
                })?;

            row.map(problem_row_to_record).transpose()
        })
    }

    fn list_problems(&self) -> StorageResult<Vec<ProblemRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("problem-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "problem-list-connect").await?;
            let rows = sqlx::query_as::<_, ProblemRow>(
                "SELECT id, problem_id, title, description, input_description, output_description, samples_json, time_limit, memory_limit, created_at \
                 FROM problems ORDER BY created_at DESC, id DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "problem-list-query",
            })?;

            rows.into_iter().map(problem_row_to_record).collect()
        })
    }

    fn delete_problem(&self, problem_id: &str) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let problem_id = problem_id.to_string();
        self.run_db_call("problem-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "problem-delete-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "problem-delete-begin",
            })?;

            sqlx::query("DELETE FROM problems WHERE problem_id = ?")
                .bind(&problem_id)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "problem-delete-problem",
                })?;
            sqlx::query("DELETE FROM chats WHERE problem_id = ?")
                .bind(&problem_id)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "problem-delete-chat",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "problem-delete-commit",
            })?;
            Ok(())
        })
    }
}

impl SolveStore for SqliteStorage {
    fn record_solve(&self, problem_id: &str) -> StorageResult<bool> {
        self.record_solve_at(problem_id, unix_timestamp_seconds())
    }

    fn unrecord_solve(&self, problem_id: &str) -> StorageResult<bool> {
        let database_url = self.database_url.clone();
        let problem_id = problem_id.to_string();
        self.run_db_call("solve-unrecord", async move {
            let mut connection =
                connect_store_connection(&database_url, "solve-unrecord-connect").await?;
            let result = sqlx::query(
                "DELETE FROM solve_records WHERE problem_id = ? AND solved_on = date('now')",
            )
            .bind(&problem_id)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "solve-unrecord-delete",
            })?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn is_solved_today(&self, problem_id: &str) -> StorageResult<bool> {
        let database_url = self.database_url.clone();
        let problem_id = problem_id.to_string();
        self.run_db_call("solve-today", async move {
            let mut connection =
                connect_store_connection(&database_url, "solve-today-connect").await?;
            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT EXISTS(SELECT 1 FROM solve_records WHERE problem_id = ? AND solved_on = date('now'))",
            )
            .bind(&problem_id)
            .fetch_one(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "solve-today-query",
            })?;

            Ok(exists != 0)
        })
    }

    fn activity(&self, days: u32) -> StorageResult<Vec<ActivityDay>> {
        let database_url = self.database_url.clone();
        self.run_db_call("solve-activity", async move {
            let mut connection =
                connect_store_connection(&database_url, "solve-activity-connect").await?;
            let rows = sqlx::query_as::<_, ActivityRow>(
                "SELECT solved_on, COUNT(*) AS solve_count FROM solve_records \
                 WHERE solved_on >= date('now', ?) GROUP BY solved_on ORDER BY solved_on ASC",
            )
            .bind(format!("-{days} days"))
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "solve-activity-query",
            })?;

            rows.into_iter()
                .map(|row| {
                    let count = i64_to_u32(row.solve_count, "solve-activity-count")?;
                    Ok(ActivityDay {
                        date: row.solved_on,
                        count,
                        level: activity_level(count),
                    })
                })
                .collect()
        })
    }
}

const PROBLEM_SELECT_BY_ID: &str = "SELECT id, problem_id, title, description, input_description, output_description, samples_json, time_limit, memory_limit, created_at \
     FROM problems WHERE problem_id = ?";

#[derive(Debug, FromRow)]
struct ChatRow {
    id: i64,
    problem_id: String,
    messages_json: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct ProblemRow {
    id: i64,
    problem_id: String,
    title: String,
    description: String,
    input_description: String,
    output_description: String,
    samples_json: String,
    time_limit: String,
    memory_limit: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct ActivityRow {
    solved_on: String,
    solve_count: i64,
}

fn chat_row_to_record(row: ChatRow) -> StorageResult<ChatRecord> {
    let messages = serde_json::from_str::<Vec<StoredMessage>>(&row.messages_json).context(
        DecodePayloadSnafu {
            stage: "chat-row-decode-messages",
            entity: "chat",
            id: row.problem_id.clone(),
        },
    )?;

    Ok(ChatRecord {
        id: row.id,
        problem_id: row.problem_id,
        messages,
        created_at_unix_seconds: i64_to_u64(row.created_at, "chat-row-created-at")?,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "chat-row-updated-at")?,
    })
}

fn problem_row_to_record(row: ProblemRow) -> StorageResult<ProblemRecord> {
    let samples = serde_json::from_str::<Vec<Sample>>(&row.samples_json).context(
        DecodePayloadSnafu {
            stage: "problem-row-decode-samples",
            entity: "problem samples",
            id: row.problem_id.clone(),
        },
    )?;

    Ok(ProblemRecord {
        id: row.id,
        statement: ProblemStatement {
            id: row.problem_id,
            title: row.title,
            description: row.description,
            input_description: row.input_description,
            output_description: row.output_description,
            samples,
            time_limit: row.time_limit,
            memory_limit: row.memory_limit,
        },
        created_at_unix_seconds: i64_to_u64(row.created_at, "problem-row-created-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("sqlite integer '{value}' cannot map to u32"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageRole;

    async fn open_temp_storage() -> (tempfile::TempDir, SqliteStorage) {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("psup.db");
        let storage = SqliteStorage::open(path.to_str().expect("utf-8 path"))
            .await
            .expect("open storage");
        (directory, storage)
    }

    fn statement(id: &str) -> ProblemStatement {
        ProblemStatement {
            id: id.to_string(),
            title: format!("Problem {id}"),
            description: "Add two numbers.".to_string(),
            input_description: "Two integers A and B.".to_string(),
            output_description: "Print A+B.".to_string(),
            samples: vec![Sample {
                input: "1 2".to_string(),
                output: "3".to_string(),
            }],
            time_limit: "2 s".to_string(),
            memory_limit: "128 MB".to_string(),
        }
    }

    #[tokio::test]
    async fn missing_chat_loads_as_none() {
        let (_directory, storage) = open_temp_storage().await;
        assert_eq!(storage.load_chat("1000").expect("load"), None);
    }

    #[tokio::test]
    async fn save_chat_upserts_and_keeps_creation_time() {
        let (_directory, storage) = open_temp_storage().await;
        let first = storage
            .save_chat("1000", &[StoredMessage::new(MessageRole::User, "hint?")])
            .expect("first save");

        let second = storage
            .save_chat(
                "1000",
                &[
                    StoredMessage::new(MessageRole::User, "hint?"),
                    StoredMessage::new(MessageRole::Assistant, "use a hashmap"),
                ],
            )
            .expect("second save");

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at_unix_seconds, second.created_at_unix_seconds);

        let loaded = storage.load_chat("1000").expect("load").expect("present");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].role, MessageRole::Assistant);
        assert_eq!(loaded.messages[1].content, "use a hashmap");
    }

    #[tokio::test]
    async fn corrupt_chat_payload_is_reported_as_decode_error() {
        let (_directory, storage) = open_temp_storage().await;
        let mut connection = connect_store_connection(&storage.database_url, "test-connect")
            .await
            .expect("connect");
        sqlx::query(
            "INSERT INTO chats (problem_id, messages_json, created_at, updated_at) VALUES ('1000', 'not-json', 0, 0)",
        )
        .execute(&mut connection)
        .await
        .expect("raw insert");

        let error = storage.load_chat("1000").expect_err("decode must fail");
        assert!(matches!(error, StorageError::DecodePayload { .. }));
    }

    #[tokio::test]
    async fn open_leaves_no_connection_behind() {
        let (_directory, storage) = open_temp_storage().await;
        let mut connection = connect_store_connection(&storage.database_url, "test-connect")
            .await
            .expect("connect");

        // Leaving WAL mode is refused while any other connection is open.
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode = DELETE;")
            .fetch_one(&mut connection)
            .await
            .expect("journal mode");
        assert_eq!(mode, "delete");
    }

    #[tokio::test]
    async fn delete_problem_removes_its_chat() {
        let (_directory, storage) = open_temp_storage().await;
        storage.save_problem(&statement("1000")).expect("save problem");
        storage.save_problem(&statement("1001")).expect("save problem");
        storage
            .save_chat("1000", &[StoredMessage::new(MessageRole::User, "hi")])
            .expect("save chat");

        storage.delete_problem("1000").expect("delete");

        assert_eq!(storage.get_problem("1000").expect("get"), None);
        assert_eq!(storage.load_chat("1000").expect("load"), None);
        let remaining = storage.list_problems().expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].statement, statement("1001"));
    }

    #[tokio::test]
    async fn solve_is_recorded_once_per_day() {
        let (_directory, storage) = open_temp_storage().await;
        assert!(storage.record_solve("1000").expect("first"));
        assert!(!storage.record_solve("1000").expect("second"));
        assert!(storage.is_solved_today("1000").expect("today"));

        assert!(storage.unrecord_solve("1000").expect("unrecord"));
        assert!(!storage.is_solved_today("1000").expect("today after unrecord"));
    }

    #[tokio::test]
    async fn activity_groups_by_day_and_buckets_levels() {
        let (_directory, storage) = open_temp_storage().await;
        let now = unix_timestamp_seconds();
        let two_days_ago = now - 2 * 86_400;

        for index in 0..3 {
            storage
                .record_solve_at(&format!("20{index}"), two_days_ago)
                .expect("record old");
        }
        storage.record_solve_at("1000", now).expect("record today");

        let activity = storage.activity(365).expect("activity");
        assert_eq!(activity.len(), 2);
        assert_eq!(activity[0].count, 3);
        assert_eq!(activity[0].level, 2);
        assert_eq!(activity[1].count, 1);
        assert_eq!(activity[1].level, 1);
        assert!(activity[0].date < activity[1].date);
    }

    #[test]
    fn activity_levels_follow_heatmap_buckets() {
        let levels = [0, 1, 2, 3, 5, 6, 10, 11, 40].map(activity_level);
        assert_eq!(levels, [0, 1, 1, 2, 2, 3, 3, 4, 4]);
    }
}
