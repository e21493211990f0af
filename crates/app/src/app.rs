use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use psup_chat::{ChatCoordinator, ChatNotice, ChatSnapshot, Role, StoreConversationPersistence};
use psup_llm::{default_models, is_known_model};
use psup_storage::{ProblemStatement, ProblemStore, SolveStore, SqliteStorage, StorageResult};
use snafu::{OptionExt, ResultExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::commands::{self, Command, HELP};
use crate::error::{
    AppResult, CoordinatorSnafu, CreateProviderSnafu, NoActiveProblemSnafu, ParseProblemSnafu,
    ReadFileSnafu, ReadInputSnafu, SettingsSnafu, StorageSnafu, StorageTaskSnafu,
};
use crate::settings::{SettingsStore, TutorSettings};

enum Flow {
    Continue,
    Quit,
}

/// Terminal host: owns settings, storage and the chat coordinator handle.
pub struct TerminalApp {
    settings: SettingsStore,
    storage: Arc<SqliteStorage>,
    coordinator: ChatCoordinator,
    active_problem: Option<ProblemStatement>,
    pending_code: Option<String>,
}

impl TerminalApp {
    pub async fn start(
        settings: SettingsStore,
    ) -> AppResult<(Self, mpsc::UnboundedReceiver<ChatNotice>)> {
        let current = settings.settings();
        let database = current.database_location(&settings.config_dir());
        let storage = SqliteStorage::open(&database.to_string_lossy())
            .await
            .context(StorageSnafu {
                stage: "open-database",
            })?;
        let storage = Arc::new(storage);

        let provider = psup_llm::create_provider(current.to_provider_config()).context(
            CreateProviderSnafu {
                stage: "create-provider",
            },
        )?;
        tracing::info!(
            provider_id = %provider.id(),
            model_id = %current.model,
            database = ?database,
            "starting tutor session"
        );

        let persistence = Arc::new(StoreConversationPersistence::new(Arc::clone(&storage)));
        let (coordinator, notices) =
            ChatCoordinator::spawn(current.to_chat_config(), persistence, provider);

        Ok((
            Self {
                settings,
                storage,
                coordinator,
                active_problem: None,
                pending_code: None,
            },
            notices,
        ))
    }

    pub async fn run(mut self, notices: mpsc::UnboundedReceiver<ChatNotice>) -> AppResult<()> {
        let renderer = tokio::spawn(render_snapshots(self.coordinator.subscribe(), io::stdout()));
        let notifier = tokio::spawn(render_notices(notices));

        if !self.settings.settings().has_api_key() {
            println!("No API key configured. Set one with /key <key>.");
        }
        println!("Type /help for commands.");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
            stage: "read-line",
        })? {
            let command = match commands::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(error) => {
                    println!("{error}");
                    continue;
                }
            };

            match self.handle(command).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(error) => {
                    tracing::warn!(error = %error, "command failed");
                    println!("error: {error}");
                }
            }
        }

        renderer.abort();
        notifier.abort();
        Ok(())
    }

    async fn handle(&mut self, command: Command) -> AppResult<Flow> {
        match command {
            Command::Open(Some(problem_id)) => self.open(problem_id).await?,
            Command::Open(None) => {
                self.activate(None)?;
                println!("Closed the active problem.");
            }
            Command::Import(path) => self.import(&path).await?,
            Command::AttachCode(path) => {
                let code = tokio::fs::read_to_string(&path).await.context(ReadFileSnafu {
                    stage: "attach-code",
                    path: path.clone(),
                })?;
                println!("Attached {} lines from {}.", code.lines().count(), path.display());
                self.pending_code = Some(code);
            }
            Command::Clear => {
                self.coordinator.clear().context(CoordinatorSnafu { stage: "clear" })?;
                println!("Conversation cleared.");
            }
            Command::Solve => {
                let problem_id = self.active_problem_id("solve")?;
                let recorded = self
                    .with_storage("record-solve", move |storage| storage.record_solve(&problem_id))
                    .await?;
                println!(
                    "{}",
                    if recorded { "Marked as solved today." } else { "Already marked as solved today." }
                );
            }
            Command::Unsolve => {
                let problem_id = self.active_problem_id("unsolve")?;
                let removed = self
                    .with_storage("unrecord-solve", move |storage| {
                        storage.unrecord_solve(&problem_id)
                    })
                    .await?;
                println!(
                    "{}",
                    if removed { "Removed today's solve record." } else { "No solve record for today." }
                );
            }
            Command::History => self.history().await?,
            Command::Delete(problem_id) => {
                if self.active_problem.as_ref().is_some_and(|problem| problem.id == problem_id) {
                    // Saves already queued for the problem must land before its rows go.
                    self.activate(None)?;
                    self.coordinator
                        .flush()
                        .await
                        .context(CoordinatorSnafu { stage: "delete-flush" })?;
                }
                let target = problem_id.clone();
                self.with_storage("delete-problem", move |storage| {
                    storage.delete_problem(&target)
                })
                .await?;
                println!("Deleted problem {problem_id}.");
            }
            Command::Activity(days) => self.activity(days).await?,
            Command::SetKey(api_key) => {
                self.update_settings(move |settings| settings.api_key = api_key)?;
                println!("API key saved.");
            }
            Command::SetModel(model) => {
                if !is_known_model(&model) {
                    println!("Note: {model} is not in the known model list.");
                }
                self.update_settings(move |settings| settings.model = model)?;
                println!("Model set to {}.", self.settings.settings().model);
            }
            Command::Models => {
                let current = self.settings.settings().model.clone();
                for model in default_models() {
                    let marker = if model.id == current { "*" } else { " " };
                    println!(
                        "{marker} {:<16} {}",
                        model.id,
                        model.description.as_deref().unwrap_or("")
                    );
                }
            }
            Command::SetPrompt(prompt) => {
                let restored = prompt.is_empty();
                self.update_settings(move |settings| settings.custom_prompt = prompt)?;
                println!(
                    "{}",
                    if restored { "Restored the default system prompt." } else { "System prompt saved." }
                );
            }
            Command::ResetSettings => {
                let settings = self.settings.clear().context(SettingsSnafu {
                    stage: "reset-settings",
                })?;
                self.coordinator
                    .update_config(settings.to_chat_config())
                    .context(CoordinatorSnafu {
                        stage: "reset-settings",
                    })?;
                println!("Settings reset to defaults.");
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return Ok(Flow::Quit),
            Command::Chat(text) => {
                self.coordinator
                    .submit(text, self.pending_code.take())
                    .context(CoordinatorSnafu { stage: "submit" })?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn open(&mut self, problem_id: String) -> AppResult<()> {
        let lookup_id = problem_id.clone();
        let record = self
            .with_storage("get-problem", move |storage| storage.get_problem(&lookup_id))
            .await?;
        let Some(record) = record else {
            println!("Problem {problem_id} is not cached. Import it with /import <path>.");
            return Ok(());
        };

        let solved_id = problem_id.clone();
        let solved = self
            .with_storage("is-solved-today", move |storage| {
                storage.is_solved_today(&solved_id)
            })
            .await?;
        println!(
            "Opened {} (#{}){}",
            record.statement.title,
            record.statement.id,
            if solved { ", solved today" } else { "" }
        );
        self.activate(Some(record.statement))
    }

    async fn import(&mut self, path: &Path) -> AppResult<()> {
        let content = tokio::fs::read_to_string(path).await.context(ReadFileSnafu {
            stage: "import-problem",
            path: path.to_path_buf(),
        })?;
        let statement: ProblemStatement =
            serde_json::from_str(&content).context(ParseProblemSnafu {
                stage: "import-problem",
                path: path.to_path_buf(),
            })?;

        let to_save = statement.clone();
        self.with_storage("save-problem", move |storage| storage.save_problem(&to_save))
            .await?;
        println!("Cached {} (#{}).", statement.title, statement.id);

        if self
            .active_problem
            .as_ref()
            .is_some_and(|problem| problem.id == statement.id)
        {
            self.activate(Some(statement))?;
        }
        Ok(())
    }

    async fn history(&self) -> AppResult<()> {
        let records = self
            .with_storage("list-problems", |storage| storage.list_problems())
            .await?;
        if records.is_empty() {
            println!("No cached problems.");
        }
        let active_id = self.active_problem.as_ref().map(|problem| problem.id.as_str());
        for record in records {
            let marker = if Some(record.statement.id.as_str()) == active_id { "*" } else { " " };
            println!("{marker} {:>8}  {}", record.statement.id, record.statement.title);
        }
        Ok(())
    }

    async fn activity(&self, days: u32) -> AppResult<()> {
        let activity = self
            .with_storage("activity", move |storage| storage.activity(days))
            .await?;
        let total = activity.iter().map(|day| day.count).sum::<u32>();
        for day in &activity {
            println!("{}  {:>3}  {}", day.date, day.count, "#".repeat(usize::from(day.level)));
        }
        println!("{total} solves on {} days in the last {days} days.", activity.len());
        Ok(())
    }

    fn activate(&mut self, problem: Option<ProblemStatement>) -> AppResult<()> {
        self.active_problem = problem.clone();
        self.pending_code = None;
        self.coordinator
            .activate(problem)
            .context(CoordinatorSnafu { stage: "activate" })
    }

    fn active_problem_id(&self, stage: &'static str) -> AppResult<String> {
        self.active_problem
            .as_ref()
            .map(|problem| problem.id.clone())
            .context(NoActiveProblemSnafu { stage })
    }

    fn update_settings(
        &self,
        change: impl FnOnce(&mut TutorSettings),
    ) -> AppResult<()> {
        let settings = self.settings.modify(change).context(SettingsSnafu {
            stage: "update-settings",
        })?;
        self.coordinator
            .update_config(settings.to_chat_config())
            .context(CoordinatorSnafu {
                stage: "update-settings",
            })
    }

    /// Runs a synchronous store call on the blocking pool.
    async fn with_storage<T, F>(&self, stage: &'static str, call: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStorage) -> StorageResult<T> + Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || call(&storage))
            .await
            .context(StorageTaskSnafu { stage })?
            .context(StorageSnafu { stage })
    }
}

async fn render_notices(mut notices: mpsc::UnboundedReceiver<ChatNotice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            ChatNotice::AuthorizationFailed => {
                println!("The API key was rejected. Enter a new one with /key <key>.");
            }
            ChatNotice::SubmitRejected(reason) => println!("Not sent: {reason}."),
        }
    }
}

/// Prints loaded histories and streams replies as they grow.
async fn render_snapshots<W: Write>(mut snapshots: watch::Receiver<ChatSnapshot>, out: W) -> W {
    let mut transcript = TranscriptRenderer::new(out);
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if let Err(error) = transcript.render(&snapshot) {
            tracing::warn!(error = %error, "failed to write transcript");
            break;
        }
    }
    transcript.into_inner()
}

/// Turns successive snapshots into terminal output.
///
/// Snapshots may be coalesced, so output is derived from how `messages`
/// changed since the last render rather than from the busy transitions seen.
struct TranscriptRenderer<W> {
    out: W,
    shown_problem: Option<String>,
    /// Messages of the shown problem that are already settled on screen.
    shown: usize,
    /// Streamed text printed on the open `tutor>` line.
    streamed: String,
    reply_open: bool,
}

impl<W: Write> TranscriptRenderer<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            shown_problem: None,
            shown: 0,
            streamed: String::new(),
            reply_open: false,
        }
    }

    fn into_inner(self) -> W {
        self.out
    }

    fn render(&mut self, snapshot: &ChatSnapshot) -> io::Result<()> {
        if snapshot.loading {
            return Ok(());
        }

        if snapshot.problem_id != self.shown_problem {
            self.close_reply()?;
            self.shown_problem = snapshot.problem_id.clone();
            for message in &snapshot.messages {
                write_message(&mut self.out, message.role, &message.content)?;
            }
            self.shown = snapshot.messages.len();
            return self.out.flush();
        }

        if snapshot.messages.len() < self.shown {
            // Cleared or rolled back.
            self.close_reply()?;
            self.shown = snapshot.messages.len();
        }

        // While busy the trailing assistant turn is still being written.
        let settled = if snapshot.busy {
            snapshot.messages.len().saturating_sub(1).max(self.shown)
        } else {
            snapshot.messages.len()
        };
        for message in &snapshot.messages[self.shown..settled] {
            if message.role == Role::Assistant {
                self.finish_reply(&message.content)?;
            }
        }
        self.shown = settled;

        if snapshot.busy {
            self.stream(&snapshot.streaming)?;
        }
        self.out.flush()
    }

    fn stream(&mut self, streaming: &str) -> io::Result<()> {
        if !self.reply_open {
            if streaming.is_empty() {
                return Ok(());
            }
            write!(self.out, "tutor> ")?;
            self.reply_open = true;
        }
        match streaming.strip_prefix(self.streamed.as_str()) {
            Some(fresh) => write!(self.out, "{fresh}")?,
            None => write!(self.out, "\ntutor> {streaming}")?,
        }
        self.streamed = streaming.to_string();
        Ok(())
    }

    fn finish_reply(&mut self, content: &str) -> io::Result<()> {
        if self.reply_open {
            match content.strip_prefix(self.streamed.as_str()) {
                Some(rest) => writeln!(self.out, "{rest}")?,
                None => writeln!(self.out, "\ntutor> {content}")?,
            }
            self.reply_open = false;
            self.streamed.clear();
            Ok(())
        } else {
            write_message(&mut self.out, Role::Assistant, content)
        }
    }

    fn close_reply(&mut self) -> io::Result<()> {
        if self.reply_open {
            writeln!(self.out)?;
            self.reply_open = false;
        }
        self.streamed.clear();
        Ok(())
    }
}

fn write_message(out: &mut impl Write, role: Role, content: &str) -> io::Result<()> {
    let label = match role {
        Role::User => "you",
        Role::Assistant => "tutor",
    };
    writeln!(out, "{label}> {content}")
}

#[cfg(test)]
mod tests {
    use psup_chat::Message;
    use psup_storage::ChatStore;

    use super::*;

    fn snapshot(problem_id: &str, messages: Vec<Message>) -> ChatSnapshot {
        ChatSnapshot {
            problem_id: Some(problem_id.to_string()),
            messages,
            ..ChatSnapshot::default()
        }
    }

    fn streaming(problem_id: &str, messages: Vec<Message>, text: &str) -> ChatSnapshot {
        ChatSnapshot {
            busy: true,
            streaming: text.to_string(),
            ..snapshot(problem_id, messages)
        }
    }

    fn render_all(snapshots: &[ChatSnapshot]) -> String {
        let mut transcript = TranscriptRenderer::new(Vec::new());
        for snapshot in snapshots {
            transcript.render(snapshot).expect("render");
        }
        String::from_utf8(transcript.into_inner()).expect("utf-8 output")
    }

    #[tokio::test]
    async fn coalesced_failed_exchange_still_prints_error_reply() {
        let (snapshot_tx, snapshot_rx) = watch::channel(ChatSnapshot::default());
        let renderer = tokio::spawn(render_snapshots(snapshot_rx, Vec::new()));

        snapshot_tx.send(snapshot("1", Vec::new())).expect("send");
        tokio::task::yield_now().await;

        // Both land before the renderer wakes, so it never observes `busy`.
        snapshot_tx
            .send(streaming("1", vec![Message::user("hint"), Message::assistant("")], ""))
            .expect("send");
        snapshot_tx
            .send(snapshot(
                "1",
                vec![
                    Message::user("hint"),
                    Message::assistant("Error: completions failed on `open-stream`"),
                ],
            ))
            .expect("send");
        drop(snapshot_tx);

        let output = renderer.await.expect("renderer task");
        assert_eq!(
            String::from_utf8(output).expect("utf-8 output"),
            "tutor> Error: completions failed on `open-stream`\n"
        );
    }

    #[test]
    fn streamed_reply_prints_each_fragment_once() {
        let history = vec![Message::user("q"), Message::assistant("a")];
        let mut in_flight = history.clone();
        in_flight.extend([Message::user("hint"), Message::assistant("")]);
        let mut finished = history.clone();
        finished.extend([Message::user("hint"), Message::assistant("Try a map.")]);

        let output = render_all(&[
            snapshot("1", history),
            streaming("1", in_flight.clone(), "Try"),
            streaming("1", in_flight, "Try a map"),
            snapshot("1", finished),
        ]);

        assert_eq!(output, "you> q\ntutor> a\ntutor> Try a map.\n");
    }

    #[test]
    fn rejected_credential_rollback_prints_no_reply() {
        let history = vec![Message::user("q"), Message::assistant("a")];
        let mut in_flight = history.clone();
        in_flight.extend([Message::user("hint"), Message::assistant("")]);

        let output = render_all(&[
            snapshot("1", history.clone()),
            streaming("1", in_flight, ""),
            snapshot("1", history),
        ]);

        assert_eq!(output, "you> q\ntutor> a\n");
    }

    #[test]
    fn exchanges_completed_between_renders_are_both_printed() {
        let output = render_all(&[
            snapshot("1", Vec::new()),
            streaming("1", vec![Message::user("one"), Message::assistant("")], "fir"),
            streaming(
                "1",
                vec![
                    Message::user("one"),
                    Message::assistant("first"),
                    Message::user("two"),
                    Message::assistant(""),
                ],
                "sec",
            ),
            snapshot(
                "1",
                vec![
                    Message::user("one"),
                    Message::assistant("first"),
                    Message::user("two"),
                    Message::assistant("second"),
                ],
            ),
        ]);

        assert_eq!(output, "tutor> first\ntutor> second\n");
    }

    #[test]
    fn switching_problem_prints_loaded_history() {
        let output = render_all(&[
            snapshot("1", vec![Message::user("from one")]),
            ChatSnapshot {
                loading: true,
                ..snapshot("2", Vec::new())
            },
            snapshot("2", vec![Message::user("from two"), Message::assistant("reply")]),
        ]);

        assert_eq!(output, "you> from one\nyou> from two\ntutor> reply\n");
    }

    #[tokio::test]
    async fn deleting_active_problem_leaves_no_chat_behind() {
        let directory = tempfile::tempdir().expect("temp dir");
        let settings = SettingsStore::new(directory.path().join("settings.json"));
        let (mut app, _notices) = TerminalApp::start(settings).await.expect("start app");

        let statement = ProblemStatement {
            id: "1000".to_string(),
            title: "A+B".to_string(),
            description: "Add two numbers.".to_string(),
            input_description: String::new(),
            output_description: String::new(),
            samples: Vec::new(),
            time_limit: "1 s".to_string(),
            memory_limit: "64 MB".to_string(),
        };
        app.with_storage("test-save-problem", move |storage| storage.save_problem(&statement))
            .await
            .expect("save problem");
        app.handle(Command::Open(Some("1000".to_string())))
            .await
            .expect("open");

        // Clearing queues a save of the empty history right before the delete.
        app.handle(Command::Clear).await.expect("clear");
        app.handle(Command::Delete("1000".to_string()))
            .await
            .expect("delete");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let chat = app
            .with_storage("test-load-chat", |storage| storage.load_chat("1000"))
            .await
            .expect("load chat");
        assert!(chat.is_none());
        assert!(app.active_problem.is_none());
    }
}
