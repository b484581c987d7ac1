pub mod catalog;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod events;
pub mod inference;
pub mod prompt;
pub mod session;
pub mod store;
pub mod summarizer;
pub mod tokens;
pub mod tools;
pub mod types;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use catalog::{
    CatalogError, EmbeddingProvider, InMemoryIndex, OpenAiEmbedder, ProductSearch, SearchQuery,
    VectorIndex,
};
pub use config::Settings;
pub use context::{ContextBuilder, ContextWindow, SUMMARY_PREFIX};
pub use error::{AgentError, InferenceError, StoreError, SummaryError, ToolError};
pub use events::ChatEvent;
pub use inference::{ChunkStream, InferenceProvider, OpenAiProvider};
pub use session::RequestContext;
pub use store::{ShopStore, SqliteStore};
pub use summarizer::{LlmSummarizer, Summarizer};
pub use tokens::{CharEstimateCounter, TiktokenCounter, TokenCounter};
pub use tools::{render_tool_error, shop_registry, ToolHandler, ToolRegistry};
pub use types::{
    ContentBlock, InferenceRequest, InferenceResponse, Role, StopReason, StreamChunk, ToolCall,
    Turn, Usage,
};

use crate::conversation::normalize;
use crate::store::NewTurn;

/// Dispatch-loop configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    /// Tool batches allowed per request before the canned fallback answer.
    pub max_tool_rounds: usize,
    /// Longer messages are rejected before any collaborator is called.
    pub max_message_chars: usize,
    /// Bound on opening a model call and on each wait for the next chunk.
    pub model_timeout: Duration,
    /// Bound on a single tool call. An expired call becomes a tool error.
    pub tool_timeout: Duration,
    pub system_prompt: String,
    pub fallback_message: String,
    pub failure_message: String,
    pub too_long_message: String,
    pub empty_message: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            max_tokens: 1024,
            max_tool_rounds: 5,
            max_message_chars: 2_000,
            model_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
            system_prompt: prompt::SYSTEM_PROMPT.into(),
            fallback_message: "I'm having trouble completing that request. \
                               Could you try rephrasing it or breaking it into smaller steps?"
                .into(),
            failure_message: "Sorry, something went wrong on my end. Please try again in a moment."
                .into(),
            too_long_message: "That message is too long for me. \
                               Could you shorten it and try again?"
                .into(),
            empty_message: "What are you shopping for today? Tell me and I'll search the catalog."
                .into(),
        }
    }
}

/// One incoming user message.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// `None` starts a new conversation.
    pub conversation_id: Option<String>,
    pub message: String,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            message: message.into(),
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// How a chat turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Final answer streamed. `ChatOutcome::persisted` says whether it reached the log.
    Done,
    /// Input guardrail tripped; no collaborator was called.
    Rejected,
    /// A collaborator failed; the apology was sent and persisted.
    Aborted,
    /// The caller went away. No `done` event, nothing persisted for the reply.
    Cancelled,
}

/// Result of a chat invocation.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub conversation_id: String,
    pub reply: String,
    pub completion: Completion,
    pub model_calls: usize,
    pub tool_rounds: usize,
    pub usage: Usage,
    /// Whether the reply was written to the turn log.
    pub persisted: bool,
}

enum DispatchState {
    AwaitingModel,
    ExecutingTools { preamble: String, calls: Vec<ToolCall> },
    StreamingFinal(FinalSource),
    Done,
    Aborted(AgentError),
}

enum FinalSource {
    /// Text fragments of a fully read, tool-free model response.
    Model(Vec<String>),
    Canned(String),
}

/// What a model response turned out to be.
enum ModelTurn {
    Tools { preamble: String, calls: Vec<ToolCall> },
    Final(Vec<String>),
    Empty,
}

struct Cancelled;

enum Interrupt {
    Cancelled,
    Failed(AgentError),
}

impl From<Cancelled> for Interrupt {
    fn from(_: Cancelled) -> Self {
        Interrupt::Cancelled
    }
}

/// Per-request state. Dropped when the request ends.
struct Run {
    conversation_id: String,
    tx: mpsc::Sender<ChatEvent>,
    cancel: CancellationToken,
    model_calls: usize,
    tool_rounds: usize,
    usage: Usage,
    reply: String,
    /// Text of the response being read, not yet shown to the caller.
    pending: Vec<String>,
    persisted: bool,
}

impl Run {
    /// A dropped receiver counts as cancellation.
    async fn emit(&self, event: ChatEvent) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        self.tx.send(event).await.map_err(|_| Cancelled)
    }

    async fn emit_done(&self) {
        let _ = self
            .tx
            .send(ChatEvent::Done {
                conversation_id: self.conversation_id.clone(),
            })
            .await;
    }
}

/// The shopping agent. Long-lived; share it across requests.
pub struct ShopAgent {
    provider: Arc<dyn InferenceProvider>,
    context: ContextBuilder,
    tools: ToolRegistry,
    config: AgentConfig,
}

impl ShopAgent {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        context: ContextBuilder,
        tools: ToolRegistry,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            context,
            tools,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Handle one user message, sending events to `tx` as they happen.
    pub async fn chat(
        &self,
        ctx: &RequestContext,
        request: ChatRequest,
        tx: mpsc::Sender<ChatEvent>,
    ) -> ChatOutcome {
        self.chat_with_cancel(ctx, request, tx, CancellationToken::new())
            .await
    }

    /// `chat` with cancellation support.
    pub async fn chat_with_cancel(
        &self,
        ctx: &RequestContext,
        request: ChatRequest,
        tx: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) -> ChatOutcome {
        let conversation_id = request
            .conversation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut run = Run {
            conversation_id,
            tx,
            cancel,
            model_calls: 0,
            tool_rounds: 0,
            usage: Usage::default(),
            reply: String::new(),
            pending: Vec::new(),
            persisted: false,
        };

        let completion = match self.drive(ctx, &request.message, &mut run).await {
            Ok(completion) => completion,
            Err(Cancelled) => {
                info!(
                    conversation_id = %run.conversation_id,
                    model_calls = run.model_calls,
                    "chat turn cancelled"
                );
                run.reply.clear();
                Completion::Cancelled
            }
        };

        ChatOutcome {
            conversation_id: run.conversation_id,
            reply: run.reply,
            completion,
            model_calls: run.model_calls,
            tool_rounds: run.tool_rounds,
            usage: run.usage,
            persisted: run.persisted,
        }
    }

    /// Lazy event stream for one message. Ends after `done`; dropping it
    /// cancels the turn.
    pub fn chat_stream<'a>(
        &'a self,
        ctx: RequestContext,
        request: ChatRequest,
    ) -> impl Stream<Item = ChatEvent> + Send + 'a {
        async_stream::stream! {
            let (tx, mut rx) = mpsc::channel(64);
            let run = self.chat(&ctx, request, tx);
            tokio::pin!(run);
            let mut finished = false;

            loop {
                let next = tokio::select! {
                    biased;
                    Some(event) = rx.recv() => Some(event),
                    _ = &mut run, if !finished => {
                        finished = true;
                        None
                    }
                    else => break,
                };
                if let Some(event) = next {
                    yield event;
                }
            }
        }
    }

    async fn drive(
        &self,
        ctx: &RequestContext,
        message: &str,
        run: &mut Run,
    ) -> Result<Completion, Cancelled> {
        if let Some(reply) = self.check_input(message) {
            info!(
                conversation_id = %run.conversation_id,
                chars = message.chars().count(),
                limit = self.config.max_message_chars,
                "message rejected by input guardrail"
            );
            run.reply = reply.clone();
            run.emit(ChatEvent::Token { text: reply }).await?;
            run.emit_done().await;
            return Ok(Completion::Rejected);
        }

        let mut messages = match self.prepare(ctx, message, run).await {
            Ok(turns) => turns,
            Err(Interrupt::Cancelled) => return Err(Cancelled),
            Err(Interrupt::Failed(e)) => return self.abort(ctx, run, e).await,
        };

        let mut state = DispatchState::AwaitingModel;
        loop {
            state = match state {
                DispatchState::AwaitingModel => match self.await_model(&messages, run).await {
                    Ok(ModelTurn::Tools { preamble, calls }) => {
                        DispatchState::ExecutingTools { preamble, calls }
                    }
                    Ok(ModelTurn::Final(fragments)) => {
                        DispatchState::StreamingFinal(FinalSource::Model(fragments))
                    }
                    Ok(ModelTurn::Empty) => {
                        warn!(conversation_id = %run.conversation_id, "model returned neither text nor tool calls");
                        DispatchState::StreamingFinal(FinalSource::Canned(
                            self.config.fallback_message.clone(),
                        ))
                    }
                    Err(Interrupt::Cancelled) => return Err(Cancelled),
                    Err(Interrupt::Failed(e)) => DispatchState::Aborted(e),
                },
                DispatchState::ExecutingTools { preamble, calls } => {
                    if run.tool_rounds >= self.config.max_tool_rounds {
                        warn!(
                            conversation_id = %run.conversation_id,
                            rounds = run.tool_rounds,
                            "tool round ceiling reached, answering with fallback"
                        );
                        DispatchState::StreamingFinal(FinalSource::Canned(
                            self.config.fallback_message.clone(),
                        ))
                    } else {
                        run.tool_rounds += 1;
                        self.execute_tools(ctx, &mut messages, preamble, calls, run)
                            .await?;
                        DispatchState::AwaitingModel
                    }
                }
                DispatchState::StreamingFinal(source) => {
                    self.stream_final(source, run).await?;
                    DispatchState::Done
                }
                DispatchState::Done => return Ok(self.finish(ctx, run).await),
                DispatchState::Aborted(e) => return self.abort(ctx, run, e).await,
            };
        }
    }

    fn check_input(&self, message: &str) -> Option<String> {
        if message.trim().is_empty() {
            return Some(self.config.empty_message.clone());
        }
        if message.chars().count() > self.config.max_message_chars {
            return Some(self.config.too_long_message.clone());
        }
        None
    }

    /// Persist the user turn, reload the log and build the context window.
    async fn prepare(
        &self,
        ctx: &RequestContext,
        message: &str,
        run: &Run,
    ) -> Result<Vec<Turn>, Interrupt> {
        let store = &ctx.store;
        store
            .append_turn(NewTurn::user(&run.conversation_id, message))
            .await
            .map_err(|e| Interrupt::Failed(e.into()))?;
        let records = store
            .load_turns(&run.conversation_id)
            .await
            .map_err(|e| Interrupt::Failed(e.into()))?;

        let history = normalize(&records);
        let window = self
            .bounded(&run.cancel, self.context.build(history, Some(message)))
            .await?;

        info!(
            conversation_id = %run.conversation_id,
            turns = window.turns.len(),
            tokens = window.total_tokens,
            summarized = window.summarized_turns,
            "context window ready"
        );
        Ok(window.turns)
    }

    /// Race `fut` against cancellation and the model timeout.
    async fn bounded<T, E>(
        &self,
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, Interrupt>
    where
        E: Into<AgentError>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            res = tokio::time::timeout(self.config.model_timeout, fut) => match res {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Interrupt::Failed(e.into())),
                Err(_) => Err(Interrupt::Failed(
                    InferenceError::Timeout(self.config.model_timeout.as_secs()).into(),
                )),
            },
        }
    }

    /// Submit the current messages and read the whole response. Any tool
    /// call makes it a tool round, wherever it appears; text is only
    /// released to the caller once the response is known to be tool-free.
    async fn await_model(&self, messages: &[Turn], run: &mut Run) -> Result<ModelTurn, Interrupt> {
        run.model_calls += 1;
        let request = InferenceRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            system: Some(self.config.system_prompt.clone()),
            tools: self.tools.schemas(),
            messages: messages.to_vec(),
        };

        debug!(
            call = run.model_calls,
            messages = messages.len(),
            "awaiting model"
        );

        let mut stream = self
            .bounded(&run.cancel, self.provider.infer_stream(request))
            .await?;

        let mut calls = Vec::new();
        if let Err(e) = self.read_response(&mut stream, run, &mut calls).await {
            // Text that came with tool calls is a preamble, not an answer.
            if !calls.is_empty() {
                run.pending.clear();
            }
            return Err(e);
        }

        let fragments = std::mem::take(&mut run.pending);
        if !calls.is_empty() {
            Ok(ModelTurn::Tools {
                preamble: fragments.concat(),
                calls,
            })
        } else if fragments.is_empty() {
            Ok(ModelTurn::Empty)
        } else {
            Ok(ModelTurn::Final(fragments))
        }
    }

    async fn read_response(
        &self,
        stream: &mut ChunkStream,
        run: &mut Run,
        calls: &mut Vec<ToolCall>,
    ) -> Result<(), Interrupt> {
        loop {
            let next = self
                .bounded(&run.cancel, async {
                    Ok::<_, InferenceError>(stream.next().await)
                })
                .await?;

            match next {
                None => return Ok(()),
                Some(Err(e)) => return Err(Interrupt::Failed(e.into())),
                Some(Ok(StreamChunk::Usage(usage))) => run.usage.accumulate(&usage),
                Some(Ok(StreamChunk::ToolCall(call))) => calls.push(call),
                Some(Ok(StreamChunk::Token(text))) => {
                    if !text.is_empty() {
                        run.pending.push(text);
                    }
                }
            }
        }
    }

    /// Run one batch in request order. The requesting assistant turn goes in
    /// first, then one result turn per call.
    async fn execute_tools(
        &self,
        ctx: &RequestContext,
        messages: &mut Vec<Turn>,
        preamble: String,
        calls: Vec<ToolCall>,
        run: &Run,
    ) -> Result<(), Cancelled> {
        info!(
            conversation_id = %run.conversation_id,
            round = run.tool_rounds,
            tools = calls.len(),
            "executing tool batch"
        );

        messages.push(Turn::assistant_tool_calls(preamble, calls.clone()));

        for call in calls {
            run.emit(ChatEvent::Status {
                message: self.tools.status_for(&call.name),
            })
            .await?;

            let limit = self.config.tool_timeout;
            let result = tokio::select! {
                _ = run.cancel.cancelled() => return Err(Cancelled),
                res = tokio::time::timeout(limit, self.tools.execute(ctx, &call.name, &call.input)) => {
                    res.unwrap_or_else(|_| Err(ToolError::Timeout(limit.as_secs())))
                }
            };

            let (text, succeeded) = match result {
                Ok(text) => (text, true),
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "tool failed");
                    (render_tool_error(&call.name, &e), false)
                }
            };

            if succeeded && self.tools.mutates_cart(&call.name) {
                run.emit(ChatEvent::CartChanged).await?;
            }

            if let Err(e) = ctx
                .store
                .append_turn(NewTurn::tool_result(
                    &run.conversation_id,
                    &call.id,
                    &call.name,
                    text.clone(),
                ))
                .await
            {
                warn!(tool = %call.name, error = %e, "failed to persist tool result");
            }

            messages.push(Turn::tool_result(call.id, call.name, text));
        }

        Ok(())
    }

    /// Release the answer to the caller, one token event per fragment.
    async fn stream_final(&self, source: FinalSource, run: &mut Run) -> Result<(), Cancelled> {
        let fragments = match source {
            FinalSource::Canned(text) => vec![text],
            FinalSource::Model(fragments) => fragments,
        };
        for text in fragments {
            run.reply.push_str(&text);
            run.emit(ChatEvent::Token { text }).await?;
        }
        Ok(())
    }

    async fn persist_reply(&self, ctx: &RequestContext, run: &mut Run) {
        match ctx
            .store
            .append_turn(NewTurn::assistant(&run.conversation_id, run.reply.clone()))
            .await
        {
            Ok(_) => run.persisted = true,
            Err(e) => error!(
                conversation_id = %run.conversation_id,
                error = %e,
                "failed to persist reply, turn is missing from the log"
            ),
        }
    }

    async fn finish(&self, ctx: &RequestContext, run: &mut Run) -> Completion {
        self.persist_reply(ctx, run).await;

        run.emit_done().await;
        info!(
            conversation_id = %run.conversation_id,
            model_calls = run.model_calls,
            tool_rounds = run.tool_rounds,
            input_tokens = run.usage.input_tokens,
            output_tokens = run.usage.output_tokens,
            persisted = run.persisted,
            "chat turn done"
        );
        Completion::Done
    }

    /// Apologize, keep whatever answer text was already produced, and close
    /// the turn.
    async fn abort(
        &self,
        ctx: &RequestContext,
        run: &mut Run,
        cause: AgentError,
    ) -> Result<Completion, Cancelled> {
        error!(
            conversation_id = %run.conversation_id,
            error = %cause,
            partial_fragments = run.pending.len(),
            "chat turn aborted"
        );

        for text in std::mem::take(&mut run.pending) {
            run.reply.push_str(&text);
            run.emit(ChatEvent::Token { text }).await?;
        }

        let apology = self.config.failure_message.clone();
        let shown = if run.reply.is_empty() {
            apology.clone()
        } else {
            format!("\n\n{apology}")
        };
        run.emit(ChatEvent::Token { text: shown }).await?;

        if run.reply.is_empty() {
            run.reply = apology;
        }
        self.persist_reply(ctx, run).await;

        run.emit_done().await;
        Ok(Completion::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::openai::StreamAssembler;
    use crate::store::{
        Cart, CartEntry, NewProduct, Product, ProductFilter, SqliteStore, TurnRecord,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    // --- Mock Provider ---

    enum Scripted {
        Response(InferenceResponse),
        Chunks(Vec<Result<StreamChunk, InferenceError>>),
        /// Raw chat-completions SSE `data:` payloads, decoded by the real
        /// stream assembler.
        Sse(Vec<&'static str>),
        Fail(InferenceError),
        Hang,
    }

    struct MockProvider {
        script: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<InferenceRequest>>,
    }

    impl MockProvider {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn responses(responses: Vec<InferenceResponse>) -> Self {
            Self::new(responses.into_iter().map(Scripted::Response).collect())
        }

        async fn request_count(&self) -> usize {
            self.requests.lock().await.len()
        }
    }

    #[async_trait]
    impl InferenceProvider for MockProvider {
        async fn infer(
            &self,
            _request: InferenceRequest,
        ) -> Result<InferenceResponse, InferenceError> {
            Err(InferenceError::Request("agent should stream".into()))
        }

        async fn infer_stream(
            &self,
            request: InferenceRequest,
        ) -> Result<ChunkStream, InferenceError> {
            self.requests.lock().await.push(request);
            let next = self.script.lock().await.pop_front();
            match next {
                Some(Scripted::Response(r)) => Ok(Box::pin(futures_util::stream::iter(
                    r.into_chunks().into_iter().map(Ok),
                ))),
                Some(Scripted::Chunks(chunks)) => Ok(Box::pin(futures_util::stream::iter(chunks))),
                Some(Scripted::Sse(lines)) => {
                    let mut assembler = StreamAssembler::default();
                    let mut chunks: Vec<_> = lines.into_iter().flat_map(|l| assembler.push(l)).collect();
                    chunks.extend(assembler.flush());
                    Ok(Box::pin(futures_util::stream::iter(chunks)))
                }
                Some(Scripted::Fail(e)) => Err(e),
                Some(Scripted::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Err(InferenceError::Request("woke up".into()))
                }
                None => Err(InferenceError::Request("no more mock responses".into())),
            }
        }
    }

    // --- Summarizers ---

    struct StaticSummarizer;

    #[async_trait]
    impl Summarizer for StaticSummarizer {
        async fn summarize(&self, _turns: &[Turn]) -> Result<String, SummaryError> {
            Ok("User looked at tents.".into())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _turns: &[Turn]) -> Result<String, SummaryError> {
            Err(SummaryError::Inference(InferenceError::ApiError {
                status: 503,
                body: "unavailable".into(),
            }))
        }
    }

    // --- Tools ---

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes input"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn call(&self, _ctx: &RequestContext, input: &Value) -> Result<String, ToolError> {
            Ok(input.to_string())
        }
    }

    struct FailTool;

    #[async_trait]
    impl ToolHandler for FailTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn call(&self, _ctx: &RequestContext, _input: &Value) -> Result<String, ToolError> {
            Err(ToolError::Store(StoreError::Database(
                "connection reset by peer (os error 104)".into(),
            )))
        }
    }

    struct HangTool;

    #[async_trait]
    impl ToolHandler for HangTool {
        fn name(&self) -> &str {
            "hang"
        }
        fn description(&self) -> &str {
            "Never returns"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn call(&self, _ctx: &RequestContext, _input: &Value) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok("woke up".into())
        }
    }

    // --- Stores ---

    /// SQLite store whose assistant-turn writes always fail.
    struct NoReplyStore(SqliteStore);

    #[async_trait]
    impl ShopStore for NoReplyStore {
        async fn create_product(&self, product: NewProduct) -> Result<Product, StoreError> {
            self.0.create_product(product).await
        }
        async fn get_product(&self, id: i64) -> Result<Option<Product>, StoreError> {
            self.0.get_product(id).await
        }
        async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
            self.0.list_products().await
        }
        async fn products_by_ids(
            &self,
            ids: &[i64],
            filter: &ProductFilter,
        ) -> Result<Vec<Product>, StoreError> {
            self.0.products_by_ids(ids, filter).await
        }
        async fn add_to_cart(
            &self,
            user_id: &str,
            product_id: i64,
            quantity: i64,
        ) -> Result<Option<CartEntry>, StoreError> {
            self.0.add_to_cart(user_id, product_id, quantity).await
        }
        async fn remove_from_cart(&self, user_id: &str, product_id: i64) -> Result<bool, StoreError> {
            self.0.remove_from_cart(user_id, product_id).await
        }
        async fn remove_cart_line(&self, line_id: i64) -> Result<bool, StoreError> {
            self.0.remove_cart_line(line_id).await
        }
        async fn clear_cart(&self, user_id: &str) -> Result<usize, StoreError> {
            self.0.clear_cart(user_id).await
        }
        async fn cart(&self, user_id: &str) -> Result<Cart, StoreError> {
            self.0.cart(user_id).await
        }
        async fn append_turn(&self, turn: NewTurn) -> Result<TurnRecord, StoreError> {
            if turn.role == Role::Assistant {
                return Err(StoreError::Database("disk is full".into()));
            }
            self.0.append_turn(turn).await
        }
        async fn load_turns(&self, conversation_id: &str) -> Result<Vec<TurnRecord>, StoreError> {
            self.0.load_turns(conversation_id).await
        }
    }

    // --- Helpers ---

    fn text(s: &str) -> InferenceResponse {
        InferenceResponse {
            stop_reason: StopReason::EndTurn,
            content: vec![ContentBlock::Text(s.into())],
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        }
    }

    fn tool_use(calls: &[(&str, &str, Value)]) -> InferenceResponse {
        InferenceResponse {
            stop_reason: StopReason::ToolUse,
            content: calls
                .iter()
                .map(|(id, name, input)| ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: input.clone(),
                })
                .collect(),
            usage: Usage {
                input_tokens: 20,
                output_tokens: 8,
            },
        }
    }

    struct Harness {
        agent: ShopAgent,
        provider: Arc<MockProvider>,
        store: Arc<SqliteStore>,
        ctx: RequestContext,
    }

    fn harness_with(
        provider: MockProvider,
        summarizer: Arc<dyn Summarizer>,
        config: AgentConfig,
    ) -> Harness {
        let provider = Arc::new(provider);
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let context = ContextBuilder::new(Arc::new(CharEstimateCounter), summarizer);
        let tools = ToolRegistry::new()
            .add(EchoTool)
            .add(FailTool)
            .add(HangTool)
            .add(tools::shop::AddToCart);
        let agent = ShopAgent::new(provider.clone(), context, tools, config);
        Harness {
            agent,
            provider,
            ctx: RequestContext::new("alice", store.clone()),
            store,
        }
    }

    fn harness(provider: MockProvider) -> Harness {
        harness_with(provider, Arc::new(StaticSummarizer), AgentConfig::default())
    }

    async fn run(h: &Harness, request: ChatRequest) -> (ChatOutcome, Vec<ChatEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let outcome = h.agent.chat(&h.ctx, request, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    fn tokens(events: &[ChatEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Token { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn done_count(events: &[ChatEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ChatEvent::Done { .. }))
            .count()
    }

    // --- Tests ---

    #[tokio::test]
    async fn plain_answer_is_one_call_and_one_done() {
        let h = harness(MockProvider::responses(vec![text("Hello!")]));
        let (outcome, events) = run(&h, ChatRequest::new("hi")).await;

        assert_eq!(outcome.completion, Completion::Done);
        assert_eq!(outcome.model_calls, 1);
        assert_eq!(outcome.reply, "Hello!");
        assert_eq!(outcome.usage.output_tokens, 5);
        assert!(outcome.persisted);
        assert_eq!(
            events,
            vec![
                ChatEvent::Token {
                    text: "Hello!".into()
                },
                ChatEvent::Done {
                    conversation_id: outcome.conversation_id.clone()
                },
            ]
        );

        let turns = h.store.load_turns(&outcome.conversation_id).await.unwrap();
        let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);

        let requests = h.provider.requests.lock().await;
        assert_eq!(requests[0].messages, vec![Turn::user("hi")]);
        assert_eq!(requests[0].tools.len(), 4);
        assert!(requests[0].system.is_some());
    }

    #[tokio::test]
    async fn round_ceiling_stops_after_max_plus_one_calls() {
        let looping: Vec<InferenceResponse> = (0..10)
            .map(|i| tool_use(&[(&format!("call_{i}"), "echo", json!({"i": i}))]))
            .collect();
        let h = harness(MockProvider::responses(looping));

        let (outcome, events) = run(&h, ChatRequest::new("loop forever")).await;

        assert_eq!(outcome.model_calls, 6);
        assert_eq!(h.provider.request_count().await, 6);
        assert_eq!(outcome.tool_rounds, 5);
        assert_eq!(outcome.completion, Completion::Done);
        assert!(!outcome.reply.is_empty());
        assert_eq!(outcome.reply, AgentConfig::default().fallback_message);
        assert_eq!(tokens(&events), outcome.reply);
        assert_eq!(done_count(&events), 1);
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
    }

    #[tokio::test]
    async fn tool_results_follow_request_in_order() {
        let h = harness(MockProvider::responses(vec![
            tool_use(&[
                ("c1", "echo", json!({"n": 1})),
                ("c2", "echo", json!({"n": 2})),
                ("c3", "echo", json!({"n": 3})),
            ]),
            text("All three done."),
        ]));

        let (outcome, events) = run(&h, ChatRequest::new("do three things")).await;
        assert_eq!(outcome.model_calls, 2);
        assert_eq!(outcome.tool_rounds, 1);

        let statuses = events
            .iter()
            .filter(|e| matches!(e, ChatEvent::Status { .. }))
            .count();
        assert_eq!(statuses, 3);

        let requests = h.provider.requests.lock().await;
        let msgs = &requests[1].messages;
        let n = msgs.len();
        assert_eq!(msgs[n - 4].role, Role::Assistant);
        let requested: Vec<&str> = msgs[n - 4].tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(requested, vec!["c1", "c2", "c3"]);
        for (offset, id) in ["c1", "c2", "c3"].iter().enumerate() {
            let turn = &msgs[n - 3 + offset];
            assert_eq!(turn.role, Role::Tool);
            assert_eq!(turn.tool_call_id.as_deref(), Some(*id));
            assert_eq!(turn.tool_name.as_deref(), Some("echo"));
        }
        assert_eq!(msgs[n - 1].content, r#"{"n":3}"#);

        let persisted = h.store.load_turns(&outcome.conversation_id).await.unwrap();
        let roles: Vec<Role> = persisted.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Tool, Role::Tool, Role::Tool, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn failing_tool_feeds_short_error_and_loop_continues() {
        let h = harness(MockProvider::responses(vec![
            tool_use(&[("c1", "fail", json!({}))]),
            text("Sorry, the cart service is down."),
        ]));

        let (outcome, _) = run(&h, ChatRequest::new("check my cart")).await;
        assert_eq!(outcome.completion, Completion::Done);
        assert_eq!(outcome.model_calls, 2);

        let requests = h.provider.requests.lock().await;
        let result = requests[1].messages.last().unwrap();
        assert_eq!(result.role, Role::Tool);
        assert!(result.content.starts_with("Error: fail"));
        assert!(!result.content.contains("os error"));
        assert!(result.content.chars().count() <= tools::registry::MAX_TOOL_ERROR_CHARS);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_to_model() {
        let h = harness(MockProvider::responses(vec![
            tool_use(&[("c1", "teleport", json!({}))]),
            text("I can't do that."),
        ]));

        let (_, events) = run(&h, ChatRequest::new("beam me up")).await;
        assert_eq!(
            events[0],
            ChatEvent::Status {
                message: "Running teleport...".into()
            }
        );

        let requests = h.provider.requests.lock().await;
        assert_eq!(
            requests[1].messages.last().unwrap().content,
            "Error: there is no tool named teleport."
        );
    }

    #[tokio::test]
    async fn cart_mutation_emits_cart_changed() {
        let h = harness(MockProvider::responses(vec![]));
        let product = h
            .store
            .create_product(NewProduct {
                name: "Dome Tent".into(),
                description: "Two person tent".into(),
                price_cents: 19_900,
                category: "shelter".into(),
                brand: "PeakGear".into(),
                stock: 3,
                image_url: None,
            })
            .await
            .unwrap();
        h.provider.script.lock().await.extend([
            Scripted::Response(tool_use(&[(
                "c1",
                "add_to_cart",
                json!({"product_id": product.id}),
            )])),
            Scripted::Response(text("Added the tent.")),
        ]);

        let (_, events) = run(&h, ChatRequest::new("add the tent")).await;
        assert!(matches!(events[0], ChatEvent::Status { .. }));
        assert_eq!(events[1], ChatEvent::CartChanged);
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));

        let cart = h.store.cart("alice").await.unwrap();
        assert_eq!(cart.entries.len(), 1);
    }

    #[tokio::test]
    async fn failed_cart_tool_does_not_emit_cart_changed() {
        let h = harness(MockProvider::responses(vec![
            tool_use(&[("c1", "add_to_cart", json!({"product_id": "abc"}))]),
            text("Which product?"),
        ]));
        let (_, events) = run(&h, ChatRequest::new("add it")).await;
        assert!(!events.contains(&ChatEvent::CartChanged));
    }

    #[tokio::test]
    async fn over_long_message_is_rejected_without_collaborators() {
        let h = harness(MockProvider::responses(vec![text("unused")]));
        let request = ChatRequest::new("x".repeat(2_001)).in_conversation("c-long");

        let (outcome, events) = run(&h, request).await;
        assert_eq!(outcome.completion, Completion::Rejected);
        assert_eq!(outcome.model_calls, 0);
        assert_eq!(h.provider.request_count().await, 0);
        assert_eq!(tokens(&events), AgentConfig::default().too_long_message);
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Done {
                conversation_id: "c-long".into()
            })
        );
        assert!(h.store.load_turns("c-long").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let h = harness(MockProvider::responses(vec![]));
        let (outcome, events) = run(&h, ChatRequest::new("   ")).await;
        assert_eq!(outcome.completion, Completion::Rejected);
        assert_eq!(done_count(&events), 1);
    }

    #[tokio::test]
    async fn message_at_limit_is_accepted() {
        let h = harness(MockProvider::responses(vec![text("ok")]));
        let (outcome, _) = run(&h, ChatRequest::new("y".repeat(2_000))).await;
        assert_eq!(outcome.completion, Completion::Done);
    }

    #[tokio::test]
    async fn provider_outage_aborts_and_persists_apology() {
        let h = harness(MockProvider::new(vec![Scripted::Fail(
            InferenceError::ApiError {
                status: 500,
                body: "internal".into(),
            },
        )]));

        let (outcome, events) = run(&h, ChatRequest::new("hello?")).await;
        let apology = AgentConfig::default().failure_message;

        assert_eq!(outcome.completion, Completion::Aborted);
        assert_eq!(tokens(&events), apology);
        assert_eq!(done_count(&events), 1);

        let turns = h.store.load_turns(&outcome.conversation_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "hello?");
        assert_eq!(turns[1].content, apology);
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_answer() {
        let h = harness(MockProvider::new(vec![Scripted::Chunks(vec![
            Ok(StreamChunk::Token("The Storm Shell is ".into())),
            Err(InferenceError::Request("connection reset".into())),
        ])]));

        let (outcome, events) = run(&h, ChatRequest::new("tell me about it")).await;
        assert_eq!(outcome.completion, Completion::Aborted);
        assert_eq!(outcome.reply, "The Storm Shell is ");
        assert!(tokens(&events).ends_with(&AgentConfig::default().failure_message));

        let turns = h.store.load_turns(&outcome.conversation_id).await.unwrap();
        assert_eq!(turns[1].content, "The Storm Shell is ");
    }

    #[tokio::test]
    async fn summarizer_failure_aborts_before_model_call() {
        let h = harness_with(
            MockProvider::responses(vec![text("unused")]),
            Arc::new(FailingSummarizer),
            AgentConfig::default(),
        );
        for i in 0..8 {
            h.store
                .append_turn(NewTurn::user("c-old", format!("{i} {}", "tent ".repeat(1_000))))
                .await
                .unwrap();
        }

        let (outcome, events) = run(&h, ChatRequest::new("and sleeping bags?").in_conversation("c-old")).await;
        assert_eq!(outcome.completion, Completion::Aborted);
        assert_eq!(h.provider.request_count().await, 0);
        assert_eq!(done_count(&events), 1);
    }

    #[tokio::test]
    async fn long_history_is_summarized_before_model_call() {
        let h = harness(MockProvider::responses(vec![text("Here are sleeping bags.")]));
        for i in 0..8 {
            h.store
                .append_turn(NewTurn::user("c-old", format!("{i} {}", "tent ".repeat(1_000))))
                .await
                .unwrap();
        }

        run(&h, ChatRequest::new("and sleeping bags?").in_conversation("c-old")).await;

        let requests = h.provider.requests.lock().await;
        let msgs = &requests[0].messages;
        assert_eq!(msgs.len(), 7);
        assert_eq!(msgs[0].role, Role::System);
        assert!(msgs[0].content.starts_with(SUMMARY_PREFIX));
        assert_eq!(msgs[6], Turn::user("and sleeping bags?"));
    }

    #[tokio::test]
    async fn streamed_tokens_are_forwarded_in_order() {
        let h = harness(MockProvider::new(vec![Scripted::Chunks(vec![
            Ok(StreamChunk::Token("Hel".into())),
            Ok(StreamChunk::Token(String::new())),
            Ok(StreamChunk::Token("lo".into())),
            Ok(StreamChunk::Usage(Usage {
                input_tokens: 3,
                output_tokens: 2,
            })),
        ])]));

        let (outcome, events) = run(&h, ChatRequest::new("hi")).await;
        assert_eq!(
            events[..2],
            [
                ChatEvent::Token { text: "Hel".into() },
                ChatEvent::Token { text: "lo".into() },
            ]
        );
        assert_eq!(outcome.reply, "Hello");
        assert_eq!(outcome.usage.input_tokens, 3);

        let turns = h.store.load_turns(&outcome.conversation_id).await.unwrap();
        assert_eq!(turns[1].content, "Hello");
    }

    #[tokio::test]
    async fn text_before_a_tool_call_still_runs_the_tool() {
        let h = harness(MockProvider::new(vec![
            Scripted::Chunks(vec![
                Ok(StreamChunk::Token("Let me add that ".into())),
                Ok(StreamChunk::Token("for you.".into())),
                Ok(StreamChunk::ToolCall(ToolCall {
                    id: "c1".into(),
                    name: "echo".into(),
                    input: json!({"n": 1}),
                })),
            ]),
            Scripted::Response(text("Added.")),
        ]));

        let (outcome, events) = run(&h, ChatRequest::new("add it")).await;
        assert_eq!(outcome.model_calls, 2);
        assert_eq!(outcome.tool_rounds, 1);
        assert_eq!(outcome.reply, "Added.");
        assert_eq!(tokens(&events), "Added.");
        assert!(matches!(events[0], ChatEvent::Status { .. }));

        let requests = h.provider.requests.lock().await;
        let request_turn = &requests[1].messages[1];
        assert_eq!(request_turn.content, "Let me add that for you.");
        assert_eq!(request_turn.tool_calls[0].id, "c1");
    }

    #[tokio::test]
    async fn openai_stream_with_text_and_tool_calls_is_a_tool_round() {
        let h = harness(MockProvider::new(vec![
            Scripted::Sse(vec![
                r#"{"choices":[{"delta":{"role":"assistant","content":"Let me look "}}]}"#,
                r#"{"choices":[{"delta":{"content":"that up."}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"echo","arguments":""}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":\"tent\"}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                r#"{"choices":[],"usage":{"prompt_tokens":40,"completion_tokens":12}}"#,
                "[DONE]",
            ]),
            Scripted::Sse(vec![
                r#"{"choices":[{"delta":{"content":"Found "}}]}"#,
                r#"{"choices":[{"delta":{"content":"two tents."},"finish_reason":"stop"}]}"#,
                "[DONE]",
            ]),
        ]));

        let (outcome, events) = run(&h, ChatRequest::new("tents?")).await;
        assert_eq!(outcome.tool_rounds, 1);
        assert_eq!(outcome.model_calls, 2);
        assert_eq!(outcome.usage.input_tokens, 40);
        assert_eq!(
            events,
            vec![
                ChatEvent::Status {
                    message: "Running echo...".into()
                },
                ChatEvent::Token {
                    text: "Found ".into()
                },
                ChatEvent::Token {
                    text: "two tents.".into()
                },
                ChatEvent::Done {
                    conversation_id: outcome.conversation_id.clone()
                },
            ]
        );

        let requests = h.provider.requests.lock().await;
        let msgs = &requests[1].messages;
        assert_eq!(msgs[1].content, "Let me look that up.");
        assert_eq!(msgs[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msgs[2].content, r#"{"q":"tent"}"#);
    }

    #[tokio::test]
    async fn malformed_tool_arguments_are_reported_to_model() {
        let h = harness(MockProvider::new(vec![
            Scripted::Sse(vec![
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"echo","arguments":"{\"q\": "}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            ]),
            Scripted::Response(text("Let me retry.")),
        ]));

        let (outcome, _) = run(&h, ChatRequest::new("tents?")).await;
        assert_eq!(outcome.completion, Completion::Done);

        let requests = h.provider.requests.lock().await;
        assert_eq!(
            requests[1].messages.last().unwrap().content,
            "Error: invalid arguments for echo: arguments were not valid JSON"
        );
    }

    #[tokio::test]
    async fn hung_tool_times_out_and_loop_continues() {
        let config = AgentConfig {
            tool_timeout: Duration::from_millis(50),
            ..AgentConfig::default()
        };
        let h = harness_with(
            MockProvider::responses(vec![
                tool_use(&[("c1", "hang", json!({}))]),
                text("That lookup is slow right now."),
            ]),
            Arc::new(StaticSummarizer),
            config,
        );

        let (outcome, _) = tokio::time::timeout(Duration::from_secs(2), run(&h, ChatRequest::new("hi")))
            .await
            .unwrap();
        assert_eq!(outcome.completion, Completion::Done);
        assert_eq!(outcome.tool_rounds, 1);

        let requests = h.provider.requests.lock().await;
        assert_eq!(
            requests[1].messages.last().unwrap().content,
            "Error: hang took too long and was stopped."
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_running_tool() {
        let h = harness(MockProvider::responses(vec![tool_use(&[(
            "c1",
            "hang",
            json!({}),
        )])]));
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(16);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            h.agent.chat_with_cancel(&h.ctx, ChatRequest::new("hi"), tx, cancel),
        )
        .await
        .unwrap();
        assert_eq!(outcome.completion, Completion::Cancelled);
        assert!(!outcome.persisted);
    }

    #[tokio::test]
    async fn reply_persistence_failure_is_reported() {
        let store = Arc::new(NoReplyStore(SqliteStore::in_memory().unwrap()));
        let context = ContextBuilder::new(Arc::new(CharEstimateCounter), Arc::new(StaticSummarizer));
        let agent = ShopAgent::new(
            Arc::new(MockProvider::responses(vec![text("Hello!")])),
            context,
            ToolRegistry::new(),
            AgentConfig::default(),
        );
        let ctx = RequestContext::new("alice", store);
        let (tx, mut rx) = mpsc::channel(16);

        let outcome = agent.chat(&ctx, ChatRequest::new("hi"), tx).await;
        assert_eq!(outcome.completion, Completion::Done);
        assert!(!outcome.persisted);
        assert_eq!(outcome.reply, "Hello!");

        let mut done = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, ChatEvent::Done { .. }) {
                done += 1;
            }
        }
        assert_eq!(done, 1);
    }

    #[tokio::test]
    async fn preamble_before_tool_call_is_not_streamed() {
        let h = harness(MockProvider::new(vec![
            Scripted::Chunks(vec![
                Ok(StreamChunk::ToolCall(ToolCall {
                    id: "c1".into(),
                    name: "echo".into(),
                    input: json!({}),
                })),
                Ok(StreamChunk::Token("Let me check.".into())),
            ]),
            Scripted::Response(text("Checked.")),
        ]));

        let (outcome, events) = run(&h, ChatRequest::new("check")).await;
        assert_eq!(tokens(&events), "Checked.");
        assert_eq!(outcome.tool_rounds, 1);

        let requests = h.provider.requests.lock().await;
        let request_turn = &requests[1].messages[1];
        assert_eq!(request_turn.content, "Let me check.");
        assert_eq!(request_turn.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn conversation_continues_across_requests() {
        let h = harness(MockProvider::responses(vec![
            text("We have rain jackets."),
            text("The first one is $74.99."),
        ]));

        let (first, _) = run(&h, ChatRequest::new("Show me rain jackets")).await;
        let (second, _) = run(
            &h,
            ChatRequest::new("What's the first one's price?").in_conversation(&first.conversation_id),
        )
        .await;
        assert_eq!(second.conversation_id, first.conversation_id);

        let requests = h.provider.requests.lock().await;
        assert_eq!(
            requests[1].messages,
            vec![
                Turn::user("Show me rain jackets"),
                Turn::assistant("We have rain jackets."),
                Turn::user("What's the first one's price?"),
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_stops_without_done_or_reply() {
        let h = harness(MockProvider::new(vec![Scripted::Hang]));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = h
            .agent
            .chat_with_cancel(&h.ctx, ChatRequest::new("hi").in_conversation("c-cancel"), tx, cancel)
            .await;
        assert_eq!(outcome.completion, Completion::Cancelled);

        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert_eq!(done_count(&events), 0);

        let turns = h.store.load_turns("c-cancel").await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_cancellation() {
        let h = harness(MockProvider::responses(vec![text("nobody is listening")]));
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let outcome = h.agent.chat(&h.ctx, ChatRequest::new("hi"), tx).await;
        assert_eq!(outcome.completion, Completion::Cancelled);
        let turns = h.store.load_turns(&outcome.conversation_id).await.unwrap();
        assert_eq!(turns.len(), 1);
    }

    #[tokio::test]
    async fn hung_model_times_out_into_abort() {
        let config = AgentConfig {
            model_timeout: Duration::from_millis(50),
            ..AgentConfig::default()
        };
        let h = harness_with(MockProvider::new(vec![Scripted::Hang]), Arc::new(StaticSummarizer), config);

        let (outcome, events) = run(&h, ChatRequest::new("hi")).await;
        assert_eq!(outcome.completion, Completion::Aborted);
        assert_eq!(done_count(&events), 1);
    }

    #[tokio::test]
    async fn chat_stream_yields_events_then_ends() {
        let h = harness(MockProvider::responses(vec![
            tool_use(&[("c1", "echo", json!({}))]),
            text("Done."),
        ]));

        let events: Vec<ChatEvent> = h
            .agent
            .chat_stream(h.ctx.clone(), ChatRequest::new("go"))
            .collect()
            .await;

        assert!(matches!(events[0], ChatEvent::Status { .. }));
        assert_eq!(events[1], ChatEvent::Token { text: "Done.".into() });
        assert!(matches!(events[2], ChatEvent::Done { .. }));
        assert_eq!(events.len(), 3);
    }
}
