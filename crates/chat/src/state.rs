use psup_llm::StreamSessionId;
use psup_storage::ProblemStatement;

use crate::context::with_problem_context;
use crate::events::{FailureKind, StreamFragment, SubmitRejection};
use crate::message::{Message, compose_display_content};

/// Guards a conversation load against a faster, later activation.
///
/// A load result is applied only if its ticket still matches the one issued
/// by the most recent activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub problem_id: String,
    generation: u64,
}

/// Observable view of the coordinator, published after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub problem_id: Option<String>,
    pub messages: Vec<Message>,
    pub busy: bool,
    pub streaming: String,
    pub loading: bool,
}

/// Full replacement of one problem's stored conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub problem_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
    pub load: Option<LoadTicket>,
    pub abandoned: Option<StreamSessionId>,
}

/// Everything needed to open a provider stream for a freshly submitted turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedExchange {
    pub session_id: StreamSessionId,
    pub problem_id: String,
    pub request_messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    Ignored,
    Buffered,
    Finalized(PersistRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Ignored,
    /// The failed exchange was removed and the host must ask for a new credential.
    AuthorizationRolledBack,
    Recorded(PersistRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearOutcome {
    pub abandoned: Option<StreamSessionId>,
    pub persist: Option<PersistRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveExchange {
    session_id: StreamSessionId,
    /// Conversation length before the user turn was appended.
    rollback_len: usize,
}

impl ActiveExchange {
    fn placeholder_index(&self) -> usize {
        self.rollback_len + 1
    }
}

/// Conversation state machine for the active problem.
///
/// Pure and synchronous; the async coordinator drives it and performs the
/// side effects each transition asks for.
#[derive(Debug, Default)]
pub struct ChatState {
    problem: Option<ProblemStatement>,
    messages: Vec<Message>,
    streaming: String,
    exchange: Option<ActiveExchange>,
    pending_load: Option<LoadTicket>,
    next_load_generation: u64,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn problem_id(&self) -> Option<&str> {
        self.problem.as_ref().map(|problem| problem.id.as_str())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn busy(&self) -> bool {
        self.exchange.is_some()
    }

    pub fn streaming(&self) -> &str {
        &self.streaming
    }

    pub fn current_session(&self) -> Option<StreamSessionId> {
        self.exchange.map(|exchange| exchange.session_id)
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            problem_id: self.problem_id().map(str::to_string),
            messages: self.messages.clone(),
            busy: self.busy(),
            streaming: self.streaming.clone(),
            loading: self.pending_load.is_some(),
        }
    }

    /// Switches the active problem.
    ///
    /// Re-activating the same problem only refreshes its statement. A different
    /// problem (or none) empties the conversation, abandons any in-flight
    /// exchange and, for a real problem, issues a load ticket.
    pub fn activate(&mut self, problem: Option<ProblemStatement>) -> ActivateOutcome {
        let next_id = problem.as_ref().map(|problem| problem.id.as_str());
        if next_id == self.problem_id() {
            if problem.is_some() {
                self.problem = problem;
            }
            return ActivateOutcome {
                load: None,
                abandoned: None,
            };
        }

        let abandoned = self.abandon_exchange();
        self.messages.clear();
        self.problem = problem;
        self.pending_load = match &self.problem {
            Some(problem) => {
                self.next_load_generation = self.next_load_generation.wrapping_add(1);
                Some(LoadTicket {
                    problem_id: problem.id.clone(),
                    generation: self.next_load_generation,
                })
            }
            None => None,
        };

        ActivateOutcome {
            load: self.pending_load.clone(),
            abandoned,
        }
    }

    /// Applies a finished load. Returns `false` when the ticket is stale.
    pub fn commit_load(&mut self, ticket: &LoadTicket, messages: Vec<Message>) -> bool {
        if self.pending_load.as_ref() != Some(ticket) {
            return false;
        }
        self.pending_load = None;
        self.messages = messages;
        true
    }

    /// Appends the user turn and an empty assistant placeholder, and prepares
    /// the outgoing history with the problem block on its first entry.
    pub fn begin_submit(
        &mut self,
        text: &str,
        attachment: Option<&str>,
        has_credential: bool,
    ) -> Result<PreparedExchange, SubmitRejection> {
        let Some(problem) = self.problem.as_ref() else {
            return Err(SubmitRejection::NoActiveProblem);
        };
        if !has_credential {
            return Err(SubmitRejection::MissingCredential);
        }
        if self.exchange.is_some() {
            return Err(SubmitRejection::ExchangeInFlight);
        }
        if self.pending_load.is_some() {
            return Err(SubmitRejection::HistoryLoading);
        }
        let has_attachment = attachment.is_some_and(|code| !code.trim().is_empty());
        if text.trim().is_empty() && !has_attachment {
            return Err(SubmitRejection::EmptyMessage);
        }

        let problem_id = problem.id.clone();
        let rollback_len = self.messages.len();
        self.messages
            .push(Message::user(compose_display_content(text, attachment)));

        let mut request_messages = self.messages.clone();
        if let Some(first) = request_messages.first_mut() {
            first.content = with_problem_context(problem, attachment, &first.content);
        }

        self.messages.push(Message::assistant_placeholder());
        self.streaming.clear();

        let session_id = StreamSessionId::new_v4();
        self.exchange = Some(ActiveExchange {
            session_id,
            rollback_len,
        });

        Ok(PreparedExchange {
            session_id,
            problem_id,
            request_messages,
        })
    }

    pub fn apply_fragment(&mut self, fragment: &StreamFragment) -> FragmentOutcome {
        if self.current_session() != Some(fragment.session_id) {
            return FragmentOutcome::Ignored;
        }

        self.streaming.push_str(&fragment.text);
        if !fragment.done {
            return FragmentOutcome::Buffered;
        }

        let full_text = std::mem::take(&mut self.streaming);
        match self.finalize(full_text) {
            Some(persist) => FragmentOutcome::Finalized(persist),
            None => FragmentOutcome::Ignored,
        }
    }

    /// Finalizes with the complete reply text when it arrives in one piece.
    pub fn complete(
        &mut self,
        session_id: StreamSessionId,
        full_text: String,
    ) -> Option<PersistRequest> {
        if self.current_session() != Some(session_id) {
            return None;
        }
        self.finalize(full_text)
    }

    /// Settles a failed exchange. The caller classifies the failure, since
    /// only the provider knows how it reports a rejected credential.
    pub fn fail(
        &mut self,
        session_id: StreamSessionId,
        kind: FailureKind,
        message: &str,
    ) -> FailureOutcome {
        if self.current_session() != Some(session_id) {
            return FailureOutcome::Ignored;
        }

        if kind == FailureKind::CredentialRejected {
            if let Some(exchange) = self.exchange.take() {
                self.messages.truncate(exchange.rollback_len);
            }
            self.streaming.clear();
            return FailureOutcome::AuthorizationRolledBack;
        }

        match self.finalize(format!("Error: {message}")) {
            Some(persist) => FailureOutcome::Recorded(persist),
            None => FailureOutcome::Ignored,
        }
    }

    /// Empties the conversation and abandons any in-flight exchange.
    pub fn clear(&mut self) -> ClearOutcome {
        let abandoned = self.abandon_exchange();
        self.messages.clear();
        // A load still in flight would otherwise resurrect the cleared history.
        self.pending_load = None;

        ClearOutcome {
            abandoned,
            persist: self.problem_id().map(|problem_id| PersistRequest {
                problem_id: problem_id.to_string(),
                messages: Vec::new(),
            }),
        }
    }

    fn abandon_exchange(&mut self) -> Option<StreamSessionId> {
        self.streaming.clear();
        self.exchange.take().map(|exchange| exchange.session_id)
    }

    fn finalize(&mut self, content: String) -> Option<PersistRequest> {
        let exchange = self.exchange.take()?;
        self.streaming.clear();

        let placeholder = self.messages.get_mut(exchange.placeholder_index())?;
        placeholder.content = content;

        let problem_id = self.problem_id()?.to_string();
        Some(PersistRequest {
            problem_id,
            messages: self.messages.clone(),
        })
    }
}
