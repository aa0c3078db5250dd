//! agent-router - command line entry point
//!
//! Routes one request against the SQLite store and prints the outcome.

use std::sync::Arc;

use agent_router::{
    config::Config,
    llm::OpenRouterClient,
    store::{SqliteStore, Store},
    Router,
};
use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Route a natural-language request through the agent pipeline
#[derive(Parser, Debug)]
#[command(name = "agent-router")]
#[command(about = "Plan and execute a request with the registered agents")]
struct Args {
    /// User the request acts for
    #[arg(long)]
    user: String,

    /// Extra context as a JSON object
    #[arg(long, default_value = "{}")]
    context: String,

    /// The request text
    #[arg(required = true, trailing_var_arg = true)]
    input: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_router=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let context: serde_json::Value =
        serde_json::from_str(&args.context).context("--context must be valid JSON")?;
    let input = args.input.join(" ");

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={} db={}",
        config.default_model,
        config.db_path.display()
    );

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.db_path).await?);
    let llm = Arc::new(OpenRouterClient::with_url(
        config.api_key.clone(),
        config.completion.api_url.clone(),
    ));
    let router = Router::new(store, llm, &config);

    match router.route_request(&args.user, &input, context).await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&e.to_value())?);
            Err(e.into())
        }
    }
}
