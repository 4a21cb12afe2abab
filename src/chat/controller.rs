//! Turn orchestration
//!
//! The ConversationController owns the transcript and runs one turn at a
//! time:
//! 1. Accepts a prompt (or rejects it when empty or busy)
//! 2. Appends the user message and an open assistant message
//! 3. Opens the upstream stream and decodes it
//! 4. Applies every token to the open message, in order
//! 5. Closes the message with the final text or an error
//!
//! State lives in a `watch` channel so every mutation also notifies the
//! presentation layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::Credential;
use crate::conversation::{Message, Transcript};
use crate::error::ChatError;
use crate::providers::ChatTransport;
use crate::stream::{decode_stream, DecodeEvent, DEFAULT_MAX_LINE_BYTES};

/// Why a prompt was not accepted. Rejections leave the transcript untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("A response is still streaming")]
    Busy,
}

/// An accepted turn that has not been driven yet
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub user_message_id: Uuid,
    pub assistant_message_id: Uuid,
    pub accepted_at: DateTime<Utc>,
    prompt: String,
}

impl PendingTurn {
    pub fn prompt(&self) -> &str {
        &self.prompt
    }
}

/// Observable view of the transcript
#[derive(Debug, Clone, Serialize)]
pub struct ChatSnapshot {
    pub messages: Vec<Message>,
    pub in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_message_id: Option<Uuid>,
}

impl From<&Transcript> for ChatSnapshot {
    fn from(transcript: &Transcript) -> Self {
        Self {
            messages: transcript.messages().to_vec(),
            in_flight: transcript.open_id().is_some(),
            open_message_id: transcript.open_id(),
        }
    }
}

pub struct ConversationController {
    transport: Arc<dyn ChatTransport>,
    credential: Credential,
    max_line_bytes: usize,
    state: watch::Sender<Transcript>,
}

impl ConversationController {
    pub fn new(transport: Arc<dyn ChatTransport>, credential: Credential) -> Self {
        let (state, _) = watch::channel(Transcript::new());
        Self {
            transport,
            credential,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            state,
        }
    }

    /// Seed the transcript with an assistant greeting
    pub fn with_greeting(self, greeting: Option<&str>) -> Self {
        if let Some(greeting) = greeting {
            self.state.send_replace(Transcript::with_greeting(greeting));
        }
        self
    }

    /// Bound on a partial event line held between chunks
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Receive a notification after every transcript change
    pub fn subscribe(&self) -> watch::Receiver<Transcript> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot::from(&*self.state.borrow())
    }

    pub fn is_busy(&self) -> bool {
        self.state.borrow().open_id().is_some()
    }

    /// Run one full turn: accept the prompt, then stream the reply into the
    /// transcript until it completes or fails.
    pub async fn send_turn(&self, prompt: &str) -> Result<(), TurnError> {
        let turn = self.begin_turn(prompt)?;
        self.run_turn(turn).await;
        Ok(())
    }

    /// Accept a prompt and open the assistant message.
    ///
    /// The busy check and the append happen in one `send_if_modified`, so two
    /// callers can never both be accepted.
    pub fn begin_turn(&self, prompt: &str) -> Result<PendingTurn, TurnError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(TurnError::EmptyPrompt);
        }

        let mut ids = None;
        self.state.send_if_modified(|transcript| {
            ids = transcript.begin_exchange(prompt);
            ids.is_some()
        });

        let (user_message_id, assistant_message_id) = ids.ok_or_else(|| {
            tracing::debug!("Rejected prompt while a turn is in flight");
            TurnError::Busy
        })?;

        tracing::info!(%assistant_message_id, "💬 Turn accepted");

        Ok(PendingTurn {
            user_message_id,
            assistant_message_id,
            accepted_at: Utc::now(),
            prompt: prompt.to_string(),
        })
    }

    /// Drive an accepted turn to exactly one terminal state.
    pub async fn run_turn(&self, turn: PendingTurn) {
        let events = match self.open_events(&turn).await {
            Ok(events) => events,
            Err(error) => {
                self.apply(DecodeEvent::Failure { error });
                return;
            }
        };
        let mut events = std::pin::pin!(events);

        while let Some(event) = events.next().await {
            if self.apply(event) {
                let elapsed = Utc::now() - turn.accepted_at;
                tracing::debug!(
                    assistant_message_id = %turn.assistant_message_id,
                    elapsed_ms = elapsed.num_milliseconds(),
                    "Turn finished"
                );
                return;
            }
        }

        // decode_stream always ends with a terminal event, so the loop above
        // returns. The message is still closed in release builds.
        debug_assert!(!self.is_busy(), "event stream ended without a terminal event");
        let partial = self
            .state
            .borrow()
            .open_message()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.apply(DecodeEvent::Complete {
            final_text: partial,
        });
    }

    async fn open_events(
        &self,
        turn: &PendingTurn,
    ) -> Result<impl Stream<Item = DecodeEvent> + Send + 'static, ChatError> {
        let api_key = self.credential.key()?;
        let bytes = self.transport.open_stream(api_key, turn.prompt()).await?;
        Ok(decode_stream(bytes, self.max_line_bytes))
    }

    /// Apply one event to the open message. Returns true once the turn ended.
    fn apply(&self, event: DecodeEvent) -> bool {
        match event {
            DecodeEvent::Token { text } => {
                self.state.send_modify(|transcript| {
                    transcript.append_to_open(&text);
                });
                false
            }
            DecodeEvent::Complete { final_text } => {
                tracing::info!(chars = final_text.chars().count(), "✅ Response complete");
                self.state.send_modify(|transcript| {
                    transcript.close_open(final_text);
                });
                true
            }
            DecodeEvent::Failure { error } => {
                tracing::warn!(error = %error, "Turn failed");
                self.state.send_modify(|transcript| {
                    transcript.close_open(format!("Error: {}", error));
                });
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKey, LlmConfig};
    use crate::conversation::Role;
    use crate::providers::{ByteStream, OpenAiCompatTransport, ProviderError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token_line(text: &str) -> String {
        format!(
            "data: {}\n",
            serde_json::json!({ "choices": [{ "delta": { "content": text } }] })
        )
    }

    fn credential() -> Credential {
        Credential::Resolved {
            key: ApiKey::new("test-key"),
        }
    }

    /// Replays a fixed body, or fails with a status, and counts calls
    struct ScriptedTransport {
        chunks: Vec<Vec<u8>>,
        status: Option<(u16, String)>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn body(chunks: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                chunks,
                status: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn status(status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                chunks: Vec::new(),
                status: Some((status, body.to_string())),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open_stream(&self, _api_key: &ApiKey, _prompt: &str) -> Result<ByteStream, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((status, body)) = &self.status {
                return Err(ProviderError::Status {
                    status: *status,
                    body: body.clone(),
                });
            }
            let chunks: Vec<Result<Bytes, ProviderError>> = self
                .chunks
                .iter()
                .map(|c| Ok(Bytes::from(c.clone())))
                .collect();
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    /// Hands out chunks as the test pushes them
    struct ChannelTransport {
        receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<Bytes, ProviderError>>>>,
    }

    impl ChannelTransport {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<Bytes, ProviderError>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                receiver: Mutex::new(Some(rx)),
            });
            (transport, tx)
        }
    }

    #[async_trait]
    impl ChatTransport for ChannelTransport {
        async fn open_stream(&self, _api_key: &ApiKey, _prompt: &str) -> Result<ByteStream, ProviderError> {
            let rx = self.receiver.lock().unwrap().take().expect("single use");
            Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed())
        }
    }

    fn last_content(controller: &ConversationController) -> String {
        controller.snapshot().messages.last().unwrap().content.clone()
    }

    #[tokio::test]
    async fn test_hello_turn() {
        let transport = ScriptedTransport::body(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n".to_vec(),
            b"data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\ndata: [DONE]\n".to_vec(),
        ]);
        let controller = ConversationController::new(transport.clone(), credential());

        assert_ok!(controller.send_turn("hi").await);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].role, Role::User);
        assert_eq!(snapshot.messages[0].content, "hi");
        assert_eq!(snapshot.messages[1].role, Role::Assistant);
        assert_eq!(snapshot.messages[1].content, "Hello");
        assert!(!snapshot.in_flight);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_rejects_empty_prompt() {
        let transport = ScriptedTransport::body(vec![]);
        let controller = ConversationController::new(transport.clone(), credential())
            .with_greeting(Some("Hi!"));

        assert_eq!(controller.send_turn("  \n\t ").await, Err(TurnError::EmptyPrompt));
        assert_eq!(controller.snapshot().messages.len(), 1);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_rejects_while_in_flight() {
        let transport = ScriptedTransport::body(vec![b"data: [DONE]\n".to_vec()]);
        let controller = ConversationController::new(transport.clone(), credential());

        let turn = assert_ok!(controller.begin_turn("first"));
        assert!(controller.is_busy());

        for prompt in ["second", "third", ""] {
            assert_err!(controller.send_turn(prompt).await);
        }
        assert_eq!(controller.send_turn("again").await, Err(TurnError::Busy));
        assert_eq!(controller.snapshot().messages.len(), 2);
        assert_eq!(transport.calls(), 0);

        controller.run_turn(turn).await;
        assert!(!controller.is_busy());

        // Free again once the first turn closed
        assert_ok!(controller.send_turn("second").await);
        assert_eq!(controller.snapshot().messages.len(), 4);
    }

    #[tokio::test]
    async fn test_prompt_is_trimmed() {
        let transport = ScriptedTransport::body(vec![b"data: [DONE]\n".to_vec()]);
        let controller = ConversationController::new(transport, credential());

        let turn = controller.begin_turn("  what is rust?  \n").unwrap();

        assert_eq!(turn.prompt(), "what is rust?");
        assert_eq!(controller.snapshot().messages[0].content, "what is rust?");
    }

    #[tokio::test]
    async fn test_missing_credential_skips_transport() {
        let transport = ScriptedTransport::body(vec![b"data: [DONE]\n".to_vec()]);
        let credential = Credential::Missing {
            sources: vec!["PERPLEXITY_API_KEY".into(), "REACT_APP_PERPLEXITY_API_KEY".into()],
        };
        let controller = ConversationController::new(transport.clone(), credential);

        assert_ok!(controller.send_turn("hi").await);

        let content = last_content(&controller);
        assert!(content.starts_with("Error: Missing API key."), "{}", content);
        assert!(content.contains("PERPLEXITY_API_KEY, REACT_APP_PERPLEXITY_API_KEY"));
        assert!(!controller.is_busy());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_status_failure_replaces_content() {
        let transport = ScriptedTransport::status(429, "rate limited");
        let controller = ConversationController::new(transport, credential());

        assert_ok!(controller.send_turn("hi").await);

        assert_eq!(last_content(&controller), "Error: Request failed: 429 rate limited");
        assert!(!controller.is_busy());
    }

    #[tokio::test]
    async fn test_close_without_sentinel_completes() {
        let transport = ScriptedTransport::body(vec![
            token_line("no ").into_bytes(),
            token_line("sentinel").into_bytes(),
        ]);
        let controller = ConversationController::new(transport, credential());

        assert_ok!(controller.send_turn("hi").await);

        assert_eq!(last_content(&controller), "no sentinel");
    }

    #[tokio::test]
    async fn test_overflow_fails_turn() {
        let transport = ScriptedTransport::body(vec![b"data: {\"choices\":".to_vec(), vec![b'x'; 64]]);
        let controller =
            ConversationController::new(transport, credential()).with_max_line_bytes(32);

        assert_ok!(controller.send_turn("hi").await);

        assert_eq!(
            last_content(&controller),
            "Error: Stream line exceeded 32 bytes without a newline"
        );
    }

    #[tokio::test]
    async fn test_tokens_applied_in_order_and_observed() {
        let (transport, tx) = ChannelTransport::new();
        let controller = Arc::new(ConversationController::new(transport, credential()));

        let turn = controller.begin_turn("count").unwrap();
        let mut rx = controller.subscribe();

        let task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run_turn(turn).await }
        });

        let mut expected = String::new();
        for word in ["one", " two", " three"] {
            tx.send(Ok(Bytes::from(token_line(word)))).unwrap();
            rx.changed().await.unwrap();
            expected.push_str(word);
            let transcript = rx.borrow_and_update().clone();
            assert_eq!(transcript.open_message().unwrap().content, expected);
        }
        assert!(controller.is_busy());

        tx.send(Ok(Bytes::from_static(b"data: [DONE]\n"))).unwrap();
        task.await.unwrap();

        assert!(!controller.is_busy());
        assert_eq!(last_content(&controller), "one two three");
    }

    #[tokio::test]
    async fn test_mid_stream_error_replaces_partial_text() {
        let (transport, tx) = ChannelTransport::new();
        let controller = ConversationController::new(transport, credential());

        tx.send(Ok(Bytes::from(token_line("partial")))).unwrap();
        tx.send(Err(ProviderError::Status {
            status: 500,
            body: "connection reset".into(),
        }))
        .unwrap();

        assert_ok!(controller.send_turn("hi").await);

        assert_eq!(last_content(&controller), "Error: Request failed: 500 connection reset");
        assert!(!controller.is_busy());
    }

    #[tokio::test]
    async fn test_end_to_end_over_http() {
        let server = MockServer::start().await;
        let body = format!(
            "{}\n: keep-alive\n\n{}\ndata: {{oops\n\n{}\ndata: [DONE]\n\n",
            token_line("Rust"),
            token_line(" is"),
            token_line(" fast")
        );

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let config = LlmConfig {
            endpoint: format!("{}/chat/completions", server.uri()),
            ..LlmConfig::default()
        };
        let transport = Arc::new(OpenAiCompatTransport::new(&config).unwrap());
        let controller = ConversationController::new(transport, credential());

        assert_ok!(controller.send_turn("Describe Rust").await);

        assert_eq!(last_content(&controller), "Rust is fast");
    }

    #[tokio::test]
    async fn test_end_to_end_unauthorized() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("{\"error\":\"bad key\"}"))
            .mount(&server)
            .await;

        let config = LlmConfig {
            endpoint: format!("{}/chat/completions", server.uri()),
            ..LlmConfig::default()
        };
        let transport = Arc::new(OpenAiCompatTransport::new(&config).unwrap());
        let controller = ConversationController::new(transport, credential());

        assert_ok!(controller.send_turn("hi").await);

        assert_eq!(
            last_content(&controller),
            "Error: Request failed: 401 {\"error\":\"bad key\"}"
        );
    }
}
