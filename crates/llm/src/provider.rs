use std::fmt;
use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Identifier for one streaming exchange.
///
/// A fresh value is minted per outgoing request so events from an abandoned
/// exchange can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub Uuid);

impl StreamSessionId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for StreamSessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(provider_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// Speaker role as understood by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One chat completion request; the credential travels with the request, not the provider.
#[derive(Clone, PartialEq)]
pub struct StreamRequest {
    pub session_id: StreamSessionId,
    pub api_key: String,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl fmt::Debug for StreamRequest {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StreamRequest")
            .field("session_id", &self.session_id)
            .field("api_key", &"<redacted>")
            .field("model_id", &self.model_id)
            .field("messages", &self.messages.len())
            .field("preamble", &self.preamble.is_some())
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl StreamRequest {
    pub fn new(
        session_id: StreamSessionId,
        api_key: impl Into<String>,
        model_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            session_id,
            api_key: api_key.into(),
            model_id: model_id.into(),
            messages,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Provider-agnostic stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub session_id: StreamSessionId,
    pub payload: StreamEventPayload,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for session {session_id} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        session_id: StreamSessionId,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

pub struct ProviderEventStream {
    session_id: StreamSessionId,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub fn new(
        session_id: StreamSessionId,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            session_id,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn session_id(&self) -> StreamSessionId {
        self.session_id
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn default_model(&self) -> &str;

    /// Substrings this provider puts in error text when it rejects the credential.
    fn authorization_failure_markers(&self) -> &[&'static str];

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;

    fn is_authorization_failure(&self, message: &str) -> bool {
        self.authorization_failure_markers()
            .iter()
            .any(|marker| message.contains(marker))
    }
}

/// Builds the channel pair shared by a provider worker and its consumer.
pub fn make_event_stream(
    session_id: StreamSessionId,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(session_id, event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_event_stream_signals_cancellation() {
        let session_id = StreamSessionId::new_v4();
        let (_event_tx, stream, cancel_rx) = make_event_stream(session_id);

        drop(stream);

        assert!(cancel_rx.await.is_ok());
    }

    #[tokio::test]
    async fn events_are_received_in_send_order() {
        let session_id = StreamSessionId::new_v4();
        let (event_tx, mut stream, _cancel_rx) = make_event_stream(session_id);

        for payload in [
            StreamEventPayload::Delta("Try".to_string()),
            StreamEventPayload::Delta(" again".to_string()),
            StreamEventPayload::Done,
        ] {
            event_tx
                .send(StreamEventMapped {
                    session_id,
                    payload,
                })
                .expect("send");
        }

        assert_eq!(stream.session_id(), session_id);
        assert_eq!(
            stream.recv().await.map(|event| event.payload),
            Some(StreamEventPayload::Delta("Try".to_string()))
        );
        assert_eq!(
            stream.recv().await.map(|event| event.payload),
            Some(StreamEventPayload::Delta(" again".to_string()))
        );
        assert_eq!(
            stream.recv().await.map(|event| event.payload),
            Some(StreamEventPayload::Done)
        );
    }

    #[test]
    fn request_debug_output_redacts_credential() {
        let request = StreamRequest::new(
            StreamSessionId::new_v4(),
            "secret-key",
            "gpt-4o-mini",
            vec![ProviderMessage::new(Role::User, "hello")],
        );

        let rendered = format!("{request:?}");
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("<redacted>"));
    }
}
