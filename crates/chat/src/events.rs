use std::fmt;

use psup_llm::StreamSessionId;

/// One piece of streamed assistant output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFragment {
    pub session_id: StreamSessionId,
    pub text: String,
    pub done: bool,
}

impl StreamFragment {
    pub fn partial(session_id: StreamSessionId, text: impl Into<String>) -> Self {
        Self {
            session_id,
            text: text.into(),
            done: false,
        }
    }

    pub fn terminal(session_id: StreamSessionId, text: impl Into<String>) -> Self {
        Self {
            session_id,
            text: text.into(),
            done: true,
        }
    }
}

/// Why a submit was refused without touching the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    NoActiveProblem,
    MissingCredential,
    EmptyMessage,
    ExchangeInFlight,
    HistoryLoading,
}

impl fmt::Display for SubmitRejection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NoActiveProblem => "no problem is open",
            Self::MissingCredential => "no API key is configured",
            Self::EmptyMessage => "message is empty",
            Self::ExchangeInFlight => "a reply is still streaming",
            Self::HistoryLoading => "conversation history is still loading",
        };
        formatter.write_str(reason)
    }
}

/// Out-of-band signals for the host surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatNotice {
    /// The provider rejected the credential; the host should prompt for a new one.
    AuthorizationFailed,
    SubmitRejected(SubmitRejection),
}

/// How a failed exchange is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The provider rejected the credential; the exchange is rolled back.
    CredentialRejected,
    /// Any other failure; recorded as a visible assistant turn.
    Other,
}
