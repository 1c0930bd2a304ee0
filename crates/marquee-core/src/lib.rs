//! Shared vocabulary for the request-resolution engine: catalog data,
//! selections, pending context, typed errors and the collaborator traits
//! (language model, catalog clients, response generator).

pub mod catalog;
pub mod context;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod selection;

pub use catalog::{CatalogClient, CatalogItem, LibraryFields, MediaKind, OperationOutcome, RemoveOptions};
pub use context::{ContextKind, MoviePending, Pending, PendingContext, SeriesPending};
pub use errors::{
    ClassifiedError, DefaultClassifier, ErrorCategory, ErrorClassifier, ParseError, ServiceError, Severity,
    StoreError,
};
pub use ids::{ExternalId, RequestId, UserId};
pub use messages::{ChatMessage, ChatRole, ImageAttachment, OutboundMessage, ResolutionState, TemplateKey};
pub use provider::{LanguageModel, PromptMessage, PromptRole, ResponseGenerator};
pub use selection::{RawSeasonEntry, RawStructuredSelection, SeasonEntry, SelectionCriterion, StructuredSelection};
