//! Interactive shopping-assistant REPL.
//!
//! Usage:
//!   OPENAI_API_KEY=sk-... cargo run --example chat -- --seed products.json
//!   OPENAI_API_KEY=sk-... cargo run --example chat -- --user bob
//!   QDRANT_URL=http://localhost:6334 cargo run --features qdrant --example chat
//!
//! Settings come from the environment or `.env`. Type "exit" / "quit" to leave.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use shop_agent::store::NewProduct;
use shop_agent::{
    shop_registry, ChatEvent, ChatRequest, Completion, ContextBuilder, InMemoryIndex,
    InferenceProvider, LlmSummarizer, OpenAiEmbedder, OpenAiProvider, ProductSearch,
    RequestContext, Settings, ShopAgent, ShopStore, SqliteStore, TiktokenCounter, VectorIndex,
};

#[derive(Parser)]
#[command(name = "chat", about = "Chat with the shopping assistant")]
struct Cli {
    /// Shopper id the cart belongs to
    #[arg(long, default_value = "demo-user")]
    user: String,

    /// Load products from a JSON array before chatting
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Resume an existing conversation
    #[arg(long)]
    conversation: Option<String>,

    /// Override the chat model from the environment
    #[arg(long)]
    model: Option<String>,
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("\x1b[1;31merror:\x1b[0m {message}");
    std::process::exit(1);
}

#[cfg(feature = "qdrant")]
async fn build_index(settings: &Settings) -> (Arc<dyn VectorIndex>, bool) {
    match settings.qdrant_url {
        Some(ref url) => {
            let index = shop_agent::catalog::QdrantIndex::new(
                url,
                &settings.qdrant_collection,
                settings.embedding_dimensions,
            )
            .await
            .unwrap_or_else(|e| fail(e));
            (Arc::new(index), false)
        }
        None => (Arc::new(InMemoryIndex::new(settings.embedding_dimensions)), true),
    }
}

#[cfg(not(feature = "qdrant"))]
async fn build_index(settings: &Settings) -> (Arc<dyn VectorIndex>, bool) {
    if settings.qdrant_url.is_some() {
        eprintln!("QDRANT_URL ignored: built without the `qdrant` feature");
    }
    (Arc::new(InMemoryIndex::new(settings.embedding_dimensions)), true)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env().unwrap_or_else(|e| fail(e));
    if let Some(model) = cli.model.clone() {
        settings.model = model;
    }

    let store = Arc::new(SqliteStore::open(&settings.database_path).unwrap_or_else(|e| fail(e)));

    let provider: Arc<dyn InferenceProvider> = Arc::new(
        OpenAiProvider::new(settings.openai_base_url.clone())
            .with_api_key(settings.openai_api_key.clone()),
    );
    let embedder = Arc::new(
        OpenAiEmbedder::new(
            &settings.openai_base_url,
            &settings.embedding_model,
            settings.embedding_dimensions,
        )
        .with_api_key(settings.openai_api_key.clone()),
    );
    let (index, ephemeral) = build_index(&settings).await;
    let search = Arc::new(ProductSearch::new(embedder, index).unwrap_or_else(|e| fail(e)));

    // Seeded products are indexed as they're inserted; an in-memory index
    // also needs whatever the database already held.
    let mut to_index = if ephemeral {
        store.list_products().await.unwrap_or_else(|e| fail(e))
    } else {
        Vec::new()
    };
    if let Some(ref path) = cli.seed {
        let raw = std::fs::read_to_string(path).unwrap_or_else(|e| fail(e));
        let products: Vec<NewProduct> = serde_json::from_str(&raw).unwrap_or_else(|e| fail(e));
        for product in products {
            to_index.push(store.create_product(product).await.unwrap_or_else(|e| fail(e)));
        }
    }
    let indexed = search
        .index_products(&to_index)
        .await
        .unwrap_or_else(|e| fail(e));

    let counter = Arc::new(TiktokenCounter::for_model(&settings.model).unwrap_or_else(|e| fail(e)));
    let summarizer = Arc::new(LlmSummarizer::new(provider.clone(), settings.summary_model.clone()));
    let context = ContextBuilder::new(counter, summarizer)
        .with_history_budget(settings.history_budget)
        .with_recent_turns(settings.recent_turns);

    let agent = ShopAgent::new(provider, context, shop_registry(search), settings.agent_config());
    let ctx = RequestContext::new(cli.user.clone(), store.clone());

    eprintln!("shop-agent chat");
    eprintln!("model: {}", settings.model);
    eprintln!("user: {}", cli.user);
    eprintln!("indexed: {indexed} products");
    eprintln!("---");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut conversation_id = cli.conversation.clone();

    loop {
        eprint!("\x1b[1;36myou>\x1b[0m ");
        io::stderr().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };

        let trimmed = line.trim();
        if matches!(trimmed, "exit" | "quit" | "/q") {
            break;
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel::<ChatEvent>(64);

        let printer = tokio::spawn(async move {
            let mut started = false;
            while let Some(event) = rx.recv().await {
                match event {
                    ChatEvent::Status { message } => {
                        eprintln!("\x1b[33m  [{message}]\x1b[0m");
                    }
                    ChatEvent::Token { text } => {
                        if !started {
                            eprint!("\x1b[1;32magent>\x1b[0m ");
                            started = true;
                        }
                        print!("{text}");
                        io::stdout().flush().ok();
                    }
                    ChatEvent::CartChanged => {
                        eprintln!("\x1b[35m  [cart updated]\x1b[0m");
                    }
                    ChatEvent::Done { .. } => println!(),
                }
            }
        });

        let mut request = ChatRequest::new(trimmed);
        if let Some(ref id) = conversation_id {
            request = request.in_conversation(id.clone());
        }

        let outcome = agent.chat(&ctx, request, tx).await;
        printer.await.ok();

        if outcome.completion == Completion::Aborted {
            eprintln!("\x1b[1;31m  (turn aborted, see logs)\x1b[0m");
        }
        eprintln!(
            "\x1b[2m  [{} model calls, {} tool rounds, {}in / {}out tokens]\x1b[0m",
            outcome.model_calls,
            outcome.tool_rounds,
            outcome.usage.input_tokens,
            outcome.usage.output_tokens
        );
        conversation_id = Some(outcome.conversation_id);
    }

    match store.cart(&cli.user).await {
        Ok(cart) if !cart.is_empty() => eprintln!(
            "cart: {} items, {}",
            cart.entries.len(),
            shop_agent::store::format_cents(cart.total_cents)
        ),
        _ => {}
    }
    eprintln!("bye.");
}
