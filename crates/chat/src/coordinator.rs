use std::collections::HashMap;
use std::sync::Arc;

use psup_llm::{
    LlmProvider, ProviderEventStream, StreamEventMapped, StreamEventPayload, StreamRequest,
    StreamSessionId,
};
use psup_storage::ProblemStatement;
use snafu::{OptionExt, Snafu};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ChatConfig;
use crate::events::{ChatNotice, FailureKind, StreamFragment};
use crate::message::Message;
use crate::persistence::ConversationPersistence;
use crate::state::{
    ChatSnapshot, ChatState, FailureOutcome, FragmentOutcome, LoadTicket, PersistRequest,
    PreparedExchange,
};

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoordinatorError {
    #[snafu(display("chat coordinator stopped before `{stage}` could be delivered"))]
    Stopped { stage: &'static str },
}

enum Command {
    Activate(Option<ProblemStatement>),
    Submit {
        text: String,
        attachment: Option<String>,
    },
    Clear,
    UpdateConfig(ChatConfig),
    Flush(oneshot::Sender<()>),
}

enum WriterJob {
    Save(PersistRequest),
    /// Answered once every save queued before it has been written.
    Flush(oneshot::Sender<()>),
}

enum InternalEvent {
    Loaded {
        ticket: LoadTicket,
        messages: Vec<Message>,
    },
    Stream(StreamEventMapped),
    StreamClosed(StreamSessionId),
}

/// Tasks serving one provider exchange. Dropping it aborts both.
struct PendingStream {
    worker: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Drop for PendingStream {
    fn drop(&mut self) {
        self.worker.abort();
        self.reader.abort();
    }
}

/// Handle to the chat coordinator task.
///
/// Commands are applied in the order they are sent. State is observed through
/// [`ChatCoordinator::subscribe`]; out-of-band signals arrive on the notice
/// receiver returned by [`ChatCoordinator::spawn`].
#[derive(Clone)]
pub struct ChatCoordinator {
    command_tx: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<ChatSnapshot>,
}

impl ChatCoordinator {
    /// Starts the coordinator on the current tokio runtime.
    ///
    /// The task stops once every handle is dropped.
    pub fn spawn(
        config: ChatConfig,
        persistence: Arc<dyn ConversationPersistence>,
        provider: Arc<dyn LlmProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<ChatNotice>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ChatSnapshot::default());
        let save_tx = spawn_save_writer(Arc::clone(&persistence));

        let actor = CoordinatorActor {
            state: ChatState::new(),
            config,
            persistence,
            provider,
            pending_streams: HashMap::new(),
            internal_tx,
            save_tx,
            notice_tx,
            snapshot_tx,
        };
        tokio::spawn(actor.run(command_rx, internal_rx));

        (
            Self {
                command_tx,
                snapshot_rx,
            },
            notice_rx,
        )
    }

    pub fn activate(&self, problem: Option<ProblemStatement>) -> CoordinatorResult<()> {
        self.send(Command::Activate(problem), "activate")
    }

    pub fn submit(
        &self,
        text: impl Into<String>,
        attachment: Option<String>,
    ) -> CoordinatorResult<()> {
        self.send(
            Command::Submit {
                text: text.into(),
                attachment,
            },
            "submit",
        )
    }

    pub fn clear(&self) -> CoordinatorResult<()> {
        self.send(Command::Clear, "clear")
    }

    pub fn update_config(&self, config: ChatConfig) -> CoordinatorResult<()> {
        self.send(Command::UpdateConfig(config), "update-config")
    }

    /// Resolves once every save produced by earlier commands has reached persistence.
    pub async fn flush(&self) -> CoordinatorResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Flush(done_tx), "flush")?;
        done_rx.await.ok().context(StoppedSnafu { stage: "flush" })
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot_rx.clone()
    }

    fn send(&self, command: Command, stage: &'static str) -> CoordinatorResult<()> {
        self.command_tx
            .send(command)
            .ok()
            .context(StoppedSnafu { stage })
    }
}

/// Serializes saves so a later snapshot never lands before an earlier one.
fn spawn_save_writer(
    persistence: Arc<dyn ConversationPersistence>,
) -> mpsc::UnboundedSender<WriterJob> {
    let (save_tx, mut save_rx) = mpsc::unbounded_channel::<WriterJob>();
    tokio::spawn(async move {
        while let Some(job) = save_rx.recv().await {
            let request = match job {
                WriterJob::Save(request) => request,
                WriterJob::Flush(done_tx) => {
                    let _ = done_tx.send(());
                    continue;
                }
            };
            match persistence
                .save_conversation(&request.problem_id, &request.messages)
                .await
            {
                Ok(()) => tracing::debug!(
                    problem_id = %request.problem_id,
                    message_count = request.messages.len(),
                    "saved conversation"
                ),
                Err(error) => tracing::error!(
                    problem_id = %request.problem_id,
                    error = %error,
                    "failed to save conversation"
                ),
            }
        }
    });
    save_tx
}

struct CoordinatorActor {
    state: ChatState,
    config: ChatConfig,
    persistence: Arc<dyn ConversationPersistence>,
    provider: Arc<dyn LlmProvider>,
    pending_streams: HashMap<StreamSessionId, PendingStream>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    save_tx: mpsc::UnboundedSender<WriterJob>,
    notice_tx: mpsc::UnboundedSender<ChatNotice>,
    snapshot_tx: watch::Sender<ChatSnapshot>,
}

impl CoordinatorActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    ) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = internal_rx.recv() => self.handle_internal(event),
            }
            self.publish();
        }

        tracing::debug!(
            abandoned_streams = self.pending_streams.len(),
            "chat coordinator stopped"
        );
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Activate(problem) => self.activate(problem),
            Command::Submit { text, attachment } => self.submit(&text, attachment.as_deref()),
            Command::Clear => self.clear(),
            Command::UpdateConfig(config) => {
                tracing::debug!(config = ?config, "chat config updated");
                self.config = config;
            }
            Command::Flush(done_tx) => {
                if let Err(mpsc::error::SendError(WriterJob::Flush(done_tx))) =
                    self.save_tx.send(WriterJob::Flush(done_tx))
                {
                    let _ = done_tx.send(());
                }
            }
        }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Loaded { ticket, messages } => {
                if !self.state.commit_load(&ticket, messages) {
                    tracing::debug!(
                        problem_id = %ticket.problem_id,
                        "discarding conversation load for inactive problem"
                    );
                }
            }
            InternalEvent::Stream(event) => self.handle_stream_event(event),
            InternalEvent::StreamClosed(session_id) => {
                if self.pending_streams.contains_key(&session_id) {
                    tracing::warn!(
                        session_id = %session_id,
                        "provider stream closed without a terminal event"
                    );
                    self.handle_failure(session_id, "stream ended before the reply completed");
                }
            }
        }
    }

    fn activate(&mut self, problem: Option<ProblemStatement>) {
        let outcome = self.state.activate(problem);
        if let Some(session_id) = outcome.abandoned {
            self.abandon_stream(session_id);
        }
        if let Some(ticket) = outcome.load {
            self.spawn_load(ticket);
        }
    }

    fn submit(&mut self, text: &str, attachment: Option<&str>) {
        match self
            .state
            .begin_submit(text, attachment, self.config.has_credential())
        {
            Ok(prepared) => self.start_stream(prepared),
            Err(rejection) => {
                tracing::info!(reason = %rejection, "submit rejected");
                let _ = self.notice_tx.send(ChatNotice::SubmitRejected(rejection));
            }
        }
    }

    fn clear(&mut self) {
        let outcome = self.state.clear();
        if let Some(session_id) = outcome.abandoned {
            self.abandon_stream(session_id);
        }
        if let Some(persist) = outcome.persist {
            self.persist(persist);
        }
    }

    fn spawn_load(&self, ticket: LoadTicket) {
        let persistence = Arc::clone(&self.persistence);
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let messages = match persistence.load_conversation(&ticket.problem_id).await {
                Ok(messages) => messages,
                Err(error) => {
                    tracing::warn!(
                        problem_id = %ticket.problem_id,
                        error = %error,
                        "failed to load conversation, starting empty"
                    );
                    Vec::new()
                }
            };
            let _ = internal_tx.send(InternalEvent::Loaded { ticket, messages });
        });
    }

    fn start_stream(&mut self, prepared: PreparedExchange) {
        let session_id = prepared.session_id;
        let messages = prepared
            .request_messages
            .iter()
            .map(Message::to_provider_message)
            .collect();

        let mut request = StreamRequest::new(
            session_id,
            self.config.api_key.clone(),
            self.config.model_id.clone(),
            messages,
        )
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens);
        if !self.config.system_prompt.trim().is_empty() {
            request = request.with_preamble(self.config.system_prompt.clone());
        }

        tracing::info!(
            session_id = %session_id,
            problem_id = %prepared.problem_id,
            provider_id = %self.provider.id(),
            model_id = %self.config.model_id,
            message_count = prepared.request_messages.len(),
            "starting chat stream"
        );

        let handle = match self.provider.stream_chat(request) {
            Ok(handle) => handle,
            Err(error) => {
                tracing::error!(session_id = %session_id, error = %error, "failed to start chat stream");
                self.handle_failure(session_id, &error.to_string());
                return;
            }
        };

        let worker = tokio::spawn(handle.worker);
        let reader = tokio::spawn(forward_stream_events(
            handle.stream,
            self.internal_tx.clone(),
        ));
        self.pending_streams
            .insert(session_id, PendingStream { worker, reader });
    }

    fn handle_stream_event(&mut self, event: StreamEventMapped) {
        let session_id = event.session_id;
        if !self.pending_streams.contains_key(&session_id) {
            tracing::debug!(session_id = %session_id, "ignoring event from abandoned stream");
            return;
        }

        let fragment = match event.payload {
            StreamEventPayload::Delta(text) => StreamFragment::partial(session_id, text),
            StreamEventPayload::Done => StreamFragment::terminal(session_id, ""),
            StreamEventPayload::Error(message) => {
                self.handle_failure(session_id, &message);
                return;
            }
        };

        match self.state.apply_fragment(&fragment) {
            FragmentOutcome::Ignored => {
                self.pending_streams.remove(&session_id);
            }
            FragmentOutcome::Buffered => {}
            FragmentOutcome::Finalized(persist) => {
                tracing::info!(session_id = %session_id, "chat stream completed");
                self.pending_streams.remove(&session_id);
                self.persist(persist);
            }
        }
    }

    fn handle_failure(&mut self, session_id: StreamSessionId, message: &str) {
        self.pending_streams.remove(&session_id);
        let kind = if self.provider.is_authorization_failure(message) {
            FailureKind::CredentialRejected
        } else {
            FailureKind::Other
        };
        match self.state.fail(session_id, kind, message) {
            FailureOutcome::Ignored => {}
            FailureOutcome::AuthorizationRolledBack => {
                tracing::warn!(session_id = %session_id, "provider rejected the API key");
                let _ = self.notice_tx.send(ChatNotice::AuthorizationFailed);
            }
            FailureOutcome::Recorded(persist) => {
                tracing::warn!(session_id = %session_id, error = %message, "chat stream failed");
                self.persist(persist);
            }
        }
    }

    fn abandon_stream(&mut self, session_id: StreamSessionId) {
        if self.pending_streams.remove(&session_id).is_some() {
            tracing::debug!(session_id = %session_id, "abandoned in-flight chat stream");
        }
    }

    fn persist(&self, request: PersistRequest) {
        if self.save_tx.send(WriterJob::Save(request)).is_err() {
            tracing::error!("conversation writer stopped, dropping save");
        }
    }

    fn publish(&self) {
        let snapshot = self.state.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn forward_stream_events(
    mut stream: ProviderEventStream,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
) {
    let session_id = stream.session_id();
    while let Some(event) = stream.recv().await {
        if internal_tx.send(InternalEvent::Stream(event)).is_err() {
            return;
        }
    }
    let _ = internal_tx.send(InternalEvent::StreamClosed(session_id));
}
