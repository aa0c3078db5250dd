//! # Agent Router
//!
//! Dynamic multi-agent task routing.
//!
//! A natural-language request is turned into a plan of capability calls by a
//! completion service, the plan is repaired so that the bootstrap steps are
//! always present, and the steps are executed in order against a shared,
//! growing context.
//!
//! ## Request Flow
//! 1. Load the user's agent profile (model to use)
//! 2. Ask the completion service for a routing plan
//! 3. Normalize the plan (orders, mandatory `IntentAgent`/`AppAgent`/`RequestAgent`)
//! 4. Run the bootstrap steps in one transaction
//! 5. Run the remaining steps, skipping those with unmet dependencies
//! 6. Persist the result map on the app and log the interaction
//!
//! ## Modules
//! - `agents`: capability handlers and the registry that resolves them
//! - `routing`: plan generation, normalization, prompts, execution
//! - `store`: persistence (in-memory and SQLite)
//! - `completion` / `llm`: the completion service

pub mod agents;
pub mod completion;
pub mod config;
pub mod error;
pub mod llm;
pub mod routing;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::RouterError;
pub use routing::{RouteOutcome, Router};
