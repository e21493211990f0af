use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::model::DEFAULT_MODEL;
use super::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, LlmProvider,
    MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamEventMapped, StreamEventPayload,
    StreamRequest, StreamSessionId, make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

/// Error fragments OpenAI-compatible endpoints return for a rejected key.
pub const OPENAI_AUTHORIZATION_FAILURE_MARKERS: [&str; 3] = [
    "invalid_api_key",
    "Incorrect API key provided",
    "401 Unauthorized",
];

pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    fn build_client(config: &ProviderConfig, api_key: &str) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(api_key);
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig exposes a single preamble field, so system-role messages are folded into it.
        for message in &request.messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        session_id: StreamSessionId,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEventMapped {
            session_id,
            payload: StreamEventPayload::Error(error.to_string()),
        });
    }

    fn map_stream_item<R>(
        session_id: StreamSessionId,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEventMapped {
                    session_id,
                    payload: StreamEventPayload::Delta(text.text),
                })
            }
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let session_id = request.session_id;
        let client = match Self::build_client(&config, &request.api_key) {
            Ok(client) => client,
            Err(error) => {
                tracing::error!(
                    session_id = %session_id,
                    provider_id = %config.provider_id,
                    error = %error,
                    "failed to build provider client"
                );
                Self::emit_error_event(&event_tx, session_id, error);
                return;
            }
        };
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                session_id = %session_id,
                model_id = %request.model_id,
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            Self::emit_error_event(
                &event_tx,
                session_id,
                ProviderError::EmptyMessageSet {
                    stage: "open-stream-pop-prompt",
                    session_id,
                },
            );
            return;
        };

        let mut builder = model.completion_request(prompt).messages(messages);
        if let Some(preamble) = Self::merged_preamble(&request) {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        let mut stream = match builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        }) {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    session_id = %session_id,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, session_id, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(session_id = %session_id, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(session_id, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                session_id = %session_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, session_id, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEventMapped {
                session_id,
                payload: StreamEventPayload::Done,
            });
        }
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL
    }

    fn authorization_failure_markers(&self) -> &[&'static str] {
        &OPENAI_AUTHORIZATION_FAILURE_MARKERS
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.api_key.trim().is_empty(),
            MissingApiKeySnafu {
                stage: "stream-chat",
                provider_id: self.config.provider_id.clone(),
            }
        );
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                session_id: request.session_id,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.session_id);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> RigProviderAdapter {
        RigProviderAdapter::new(ProviderConfig::new(RIG_OPENAI_PROVIDER_ID, ""))
    }

    #[test]
    fn preamble_merges_explicit_prompt_and_system_messages() {
        let request = StreamRequest::new(
            StreamSessionId::new_v4(),
            "key",
            DEFAULT_MODEL,
            vec![
                ProviderMessage::new(Role::System, "Answer in English."),
                ProviderMessage::new(Role::User, "hint please"),
            ],
        )
        .with_preamble("You are a tutor.");

        assert_eq!(
            RigProviderAdapter::merged_preamble(&request).as_deref(),
            Some("You are a tutor.\n\nAnswer in English.")
        );
    }

    #[test]
    fn blank_preamble_is_omitted() {
        let request = StreamRequest::new(
            StreamSessionId::new_v4(),
            "key",
            DEFAULT_MODEL,
            vec![ProviderMessage::new(Role::User, "hint please")],
        )
        .with_preamble("   ");

        assert_eq!(RigProviderAdapter::merged_preamble(&request), None);
    }

    #[test]
    fn stream_chat_rejects_missing_credential() {
        let request = StreamRequest::new(
            StreamSessionId::new_v4(),
            " ",
            DEFAULT_MODEL,
            vec![ProviderMessage::new(Role::User, "hint please")],
        );

        let result = adapter().stream_chat(request);
        assert!(matches!(result, Err(ProviderError::MissingApiKey { .. })));
    }

    #[test]
    fn rejected_openai_key_is_an_authorization_failure() {
        let error = ProviderError::CompletionsFailed {
            stage: "stream-chunk",
            source: rig::completion::CompletionError::ProviderError(
                r#"{"error":{"message":"Incorrect API key provided: sk-bad****","type":"invalid_request_error","code":"invalid_api_key"}}"#
                    .to_string(),
            ),
        };

        assert!(adapter().is_authorization_failure(&error.to_string()));
        assert!(adapter().is_authorization_failure(
            "HttpError: Invalid status code 401 Unauthorized with message: {}"
        ));
    }

    #[test]
    fn other_provider_errors_are_not_authorization_failures() {
        let adapter = adapter();

        assert!(!adapter.is_authorization_failure("completions failed on `open-stream`, rate limit reached"));
        assert!(!adapter.is_authorization_failure("network timeout"));
    }

    #[test]
    fn stream_chat_rejects_empty_history() {
        let request = StreamRequest::new(StreamSessionId::new_v4(), "key", DEFAULT_MODEL, vec![]);

        let result = adapter().stream_chat(request);
        assert!(matches!(result, Err(ProviderError::EmptyMessageSet { .. })));
    }
}
