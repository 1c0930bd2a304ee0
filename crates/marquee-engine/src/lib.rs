//! Conversational request resolution: parse a chat message, find catalog
//! candidates, keep per-user pending state across turns and reply.

pub mod catalog;
pub mod error;
pub mod parser;
pub mod resolver;
pub mod responder;
pub mod store;
pub mod strategy;
pub mod validator;

pub use catalog::{CatalogFixture, CatalogOp, InMemoryCatalog, Mutation};
pub use error::EngineError;
pub use parser::{IntentParser, ModelGateway, ParsedIntent, QueryStage};
pub use responder::{ModelResponder, TemplateResponder};
pub use store::{start_sweep_task, ContextConfig, ContextStore, MemoryContextStore};
pub use strategy::{Catalogs, RequestResolver, ResolutionReply, ResolutionRequest};
pub use validator::ResponseValidator;
