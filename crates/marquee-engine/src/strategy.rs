//! The request-resolution state machine.
//!
//! NEW → PENDING → (GRANULAR_PENDING) → RESOLVED | ERROR. Every terminal
//! transition clears the user's context exactly once; "need more input"
//! transitions never do.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use marquee_core::catalog::{CatalogClient, CatalogItem, MediaKind, RemoveOptions};
use marquee_core::context::{ContextKind, PendingContext};
use marquee_core::errors::ServiceError;
use marquee_core::ids::{RequestId, UserId};
use marquee_core::messages::{ChatMessage, ImageAttachment, OutboundMessage, ResolutionState, TemplateKey};
use marquee_core::provider::ResponseGenerator;
use marquee_core::selection::StructuredSelection;
use marquee_llm::{Resilience, RetryPolicy};
use marquee_telemetry::MetricsRecorder;

use crate::parser::IntentParser;
use crate::resolver::{self, resolve_structured};
use crate::responder::TemplateResponder;
use crate::store::ContextStore;
use crate::validator::ResponseValidator;

const CANCEL_PHRASES: &[&str] = &["cancel", "nevermind", "never mind", "stop", "forget it"];
const REMOVE_WORDS: &[&str] = &["remove", "delete", "unmonitor"];
const SERIES_WORDS: &[&str] = &["show", "shows", "series", "season", "seasons", "episode", "episodes", "tv"];

/// One inbound chat message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRequest {
    pub text: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    pub user_id: UserId,
    /// Explicit flow chosen by the transport; routed from the text otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ContextKind>,
}

impl ResolutionRequest {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            history: Vec::new(),
            user_id: UserId::from_raw(user_id),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: ContextKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReply {
    pub state: ResolutionState,
    pub messages: Vec<OutboundMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
}

/// One catalog client per media kind.
#[derive(Clone)]
pub struct Catalogs {
    movies: Arc<dyn CatalogClient>,
    series: Arc<dyn CatalogClient>,
}

impl Catalogs {
    pub fn new(movies: Arc<dyn CatalogClient>, series: Arc<dyn CatalogClient>) -> Self {
        Self { movies, series }
    }

    pub fn for_kind(&self, kind: MediaKind) -> &Arc<dyn CatalogClient> {
        match kind {
            MediaKind::Movie => &self.movies,
            MediaKind::Series => &self.series,
        }
    }
}

/// Keyword routing for requests that arrive without an explicit kind.
pub fn route_kind(text: &str) -> ContextKind {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .collect();
    let has = |set: &[&str]| words.iter().any(|w| set.contains(&w.as_str()));
    match (has(REMOVE_WORDS), has(SERIES_WORDS)) {
        (true, true) => ContextKind::SeriesRemove,
        (true, false) => ContextKind::MovieRemove,
        (false, true) => ContextKind::SeriesAdd,
        (false, false) => ContextKind::MovieAdd,
    }
}

pub fn is_cancel(text: &str) -> bool {
    let normalized = text
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase();
    CANCEL_PHRASES.contains(&normalized.as_str())
}

fn action_word(kind: ContextKind) -> &'static str {
    if kind.is_removal() {
        "remove"
    } else {
        "download"
    }
}

fn item_data(item: &CatalogItem) -> Value {
    json!({"title": item.title, "year": item.year})
}

fn disambiguation_data(query: &str, candidates: &[CatalogItem]) -> Value {
    json!({
        "query": query,
        "candidates": candidates.iter().map(item_data).collect::<Vec<_>>(),
    })
}

fn seasons_data(kind: ContextKind, item: &CatalogItem) -> Value {
    let mut data = item_data(item);
    data["action"] = json!(action_word(kind));
    data
}

fn poster_images(candidates: &[CatalogItem]) -> Vec<ImageAttachment> {
    candidates
        .iter()
        .filter_map(|item| {
            item.poster_url.as_ref().map(|url| ImageAttachment {
                url: url.clone(),
                caption: Some(item.display_title()),
            })
        })
        .collect()
}

/// Labels for one transition.
#[derive(Clone, Copy, Debug)]
struct Step {
    kind: ContextKind,
    from: ResolutionState,
    to: ResolutionState,
    template: TemplateKey,
}

impl Step {
    fn new(kind: ContextKind, from: ResolutionState, to: ResolutionState, template: TemplateKey) -> Self {
        Self {
            kind,
            from,
            to,
            template,
        }
    }
}

pub struct RequestResolver {
    parser: IntentParser,
    store: Arc<dyn ContextStore>,
    catalogs: Catalogs,
    resilience: Arc<Resilience>,
    responder: Arc<dyn ResponseGenerator>,
    fallback: TemplateResponder,
    validator: ResponseValidator,
    catalog_policy: RetryPolicy,
    user_locks: Option<DashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl RequestResolver {
    pub fn new(
        parser: IntentParser,
        store: Arc<dyn ContextStore>,
        catalogs: Catalogs,
        resilience: Arc<Resilience>,
        responder: Arc<dyn ResponseGenerator>,
    ) -> Self {
        Self {
            parser,
            store,
            catalogs,
            resilience,
            responder,
            fallback: TemplateResponder,
            validator: ResponseValidator::default(),
            catalog_policy: RetryPolicy::default(),
            user_locks: None,
            metrics: None,
        }
    }

    pub fn with_catalog_policy(mut self, policy: RetryPolicy) -> Self {
        self.catalog_policy = policy;
        self
    }

    /// Serialize requests per user. Off keeps last-writer-wins.
    pub fn with_per_user_sequencing(mut self, enabled: bool) -> Self {
        self.user_locks = enabled.then(DashMap::new);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.validator = ResponseValidator::new(Some(Arc::clone(&metrics)));
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.store
    }

    pub async fn handle(&self, request: ResolutionRequest) -> ResolutionReply {
        let span = info_span!("resolve", request_id = %RequestId::new(), user_id = %request.user_id);
        self.handle_sequenced(request).instrument(span).await
    }

    async fn handle_sequenced(&self, request: ResolutionRequest) -> ResolutionReply {
        let Some(locks) = &self.user_locks else {
            return self.resolve(&request).await;
        };
        let lock = Arc::clone(&locks.entry(request.user_id.clone()).or_default());
        let reply = {
            let _turn = lock.lock().await;
            self.resolve(&request).await
        };
        drop(lock);
        locks.remove_if(&request.user_id, |_, lock| Arc::strong_count(lock) == 1);
        reply
    }

    async fn resolve(&self, request: &ResolutionRequest) -> ResolutionReply {
        let user = &request.user_id;
        let context = match (self.store.get(user).await, request.kind) {
            (Some(ctx), Some(kind)) if ctx.kind() != kind => {
                debug!(
                    user_id = %user,
                    stored = ctx.kind().as_str(),
                    requested = kind.as_str(),
                    "stored context is for another flow, starting over"
                );
                None
            }
            (ctx, _) => ctx,
        };

        match context {
            Some(ctx) if is_cancel(&request.text) => {
                let from = if ctx.is_granular() {
                    ResolutionState::GranularPending
                } else {
                    ResolutionState::Pending
                };
                let step = Step::new(ctx.kind(), from, ResolutionState::Resolved, TemplateKey::Cancelled);
                self.conclude(request, step, json!({}), ctx.candidates()).await
            }
            Some(ctx) if ctx.is_granular() => self.continue_granular(request, ctx).await,
            Some(ctx) => self.continue_pending(request, ctx).await,
            None => {
                let kind = request.kind.unwrap_or_else(|| route_kind(&request.text));
                self.start_new(request, kind).await
            }
        }
    }

    async fn start_new(&self, request: &ResolutionRequest, kind: ContextKind) -> ResolutionReply {
        use ResolutionState::{Error, GranularPending, New, Pending};

        let intent = self.parser.parse_initial(&request.text).await;
        let query = intent.query.trim();
        if query.is_empty() {
            let step = Step::new(kind, New, Error, TemplateKey::Clarify);
            return self.conclude(request, step, json!({}), &[]).await;
        }

        let candidates = match self.find_candidates(kind, query).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(user_id = %request.user_id, query, error = %e, "candidate lookup failed");
                let data = json!({"action": "search for", "query": query, "error": e.to_string()});
                return self.conclude(request, Step::new(kind, New, Error, TemplateKey::Failed), data, &[]).await;
            }
        };
        if candidates.is_empty() {
            let step = Step::new(kind, New, Error, TemplateKey::NoResults);
            return self.conclude(request, step, json!({"query": query}), &[]).await;
        }

        let structured = intent.structured_selection.as_ref().and_then(resolve_structured);

        if let [only] = candidates.as_slice() {
            let chosen = match &intent.selection {
                None => Some(only),
                Some(criterion) => resolver::resolve(criterion, &candidates),
            };
            if let Some(item) = chosen {
                match (kind.media_kind(), structured.clone()) {
                    (MediaKind::Movie, _) => return self.execute(request, kind, New, item, None, &candidates).await,
                    (MediaKind::Series, Some(selection)) => {
                        return self.execute(request, kind, New, item, Some(selection), &candidates).await;
                    }
                    (MediaKind::Series, None) => {
                        let data = seasons_data(kind, item);
                        let mut ctx = PendingContext::new(kind, candidates.clone(), query);
                        if let Some(series) = ctx.series_mut() {
                            series.chosen = Some(item.clone());
                        }
                        let step = Step::new(kind, New, GranularPending, TemplateKey::AskSeasons);
                        return self.suspend(request, step, ctx, data).await;
                    }
                }
            }
        }

        let data = disambiguation_data(query, &candidates);
        let mut ctx = PendingContext::new(kind, candidates, query);
        if let Some(series) = ctx.series_mut() {
            series.resolved_series_selection = structured;
        }
        self.suspend(request, Step::new(kind, New, Pending, TemplateKey::Disambiguate), ctx, data)
            .await
    }

    async fn continue_pending(&self, request: &ResolutionRequest, ctx: PendingContext) -> ResolutionReply {
        use ResolutionState::{GranularPending, Pending};

        let kind = ctx.kind();
        let candidates = ctx.candidates();

        if kind.media_kind() == MediaKind::Movie {
            let item = match self.parser.parse_selection(&request.text).await {
                Ok(criterion) => resolver::resolve(&criterion, candidates),
                Err(e) => {
                    debug!(user_id = %request.user_id, error = %e, "selection not understood");
                    None
                }
            };
            return match item {
                Some(item) => self.execute(request, kind, Pending, item, None, candidates).await,
                None => self.reprompt_disambiguation(request, Pending, &ctx).await,
            };
        }

        let (selection, structured) = tokio::join!(
            self.parser.parse_selection(&request.text),
            self.parser.parse_structured_selection(&request.text),
        );

        let fresh = structured.ok().as_ref().and_then(resolve_structured);
        if let Some(selection) = fresh.clone() {
            let stored = self
                .store
                .update(
                    &request.user_id,
                    Box::new(move |ctx: &mut PendingContext| {
                        if let Some(series) = ctx.series_mut() {
                            series.resolved_series_selection = Some(selection);
                        }
                    }),
                )
                .await;
            if let Err(e) = stored {
                warn!(user_id = %request.user_id, error = %e, "failed to record season selection");
            }
        }
        let structured = fresh.or_else(|| ctx.series().and_then(|s| s.resolved_series_selection.clone()));

        let item = match selection {
            Ok(criterion) => resolver::resolve(&criterion, candidates),
            Err(_) if candidates.len() == 1 => candidates.first(),
            Err(e) => {
                debug!(user_id = %request.user_id, error = %e, "selection not understood");
                None
            }
        };

        match (item, structured) {
            (Some(item), Some(selection)) => self.execute(request, kind, Pending, item, Some(selection), candidates).await,
            (Some(item), None) => {
                let chosen = item.clone();
                let marked = self
                    .store
                    .update(
                        &request.user_id,
                        Box::new(move |ctx: &mut PendingContext| {
                            if let Some(series) = ctx.series_mut() {
                                series.chosen = Some(chosen);
                            }
                        }),
                    )
                    .await;
                match marked {
                    Ok(true) => {}
                    Ok(false) => warn!(user_id = %request.user_id, "context vanished before season prompt"),
                    Err(e) => warn!(user_id = %request.user_id, error = %e, "failed to record chosen series"),
                }
                let step = Step::new(kind, Pending, GranularPending, TemplateKey::AskSeasons);
                self.respond(request, step, seasons_data(kind, item), candidates, Vec::new())
                    .await
            }
            (None, _) => self.reprompt_disambiguation(request, Pending, &ctx).await,
        }
    }

    async fn continue_granular(&self, request: &ResolutionRequest, ctx: PendingContext) -> ResolutionReply {
        use ResolutionState::GranularPending;

        let kind = ctx.kind();
        let Some(item) = ctx.series().and_then(|s| s.chosen.clone()) else {
            return self.continue_pending(request, ctx).await;
        };

        let selection = match self.parser.parse_structured_selection(&request.text).await {
            Ok(raw) => resolve_structured(&raw),
            Err(e) => {
                debug!(user_id = %request.user_id, error = %e, "season selection not understood");
                None
            }
        };

        match selection {
            Some(selection) => {
                self.execute(request, kind, GranularPending, &item, Some(selection), ctx.candidates())
                    .await
            }
            None => {
                let step = Step::new(kind, GranularPending, GranularPending, TemplateKey::AskSeasons);
                self.respond(request, step, seasons_data(kind, &item), ctx.candidates(), Vec::new())
                    .await
            }
        }
    }

    async fn find_candidates(&self, kind: ContextKind, query: &str) -> Result<Vec<CatalogItem>, ServiceError> {
        let catalog = self.catalogs.for_kind(kind.media_kind());
        let service = catalog.service_name();
        if !kind.is_removal() {
            return self
                .resilience
                .execute(service, &self.catalog_policy, || catalog.search(query))
                .await;
        }
        let needle = query.to_lowercase();
        let library = self
            .resilience
            .execute(service, &self.catalog_policy, || catalog.list_library())
            .await?;
        Ok(library
            .into_iter()
            .filter(|item| item.title.to_lowercase().contains(&needle))
            .collect())
    }

    /// Run the catalog mutation, then conclude whatever its outcome.
    async fn execute(
        &self,
        request: &ResolutionRequest,
        kind: ContextKind,
        from: ResolutionState,
        item: &CatalogItem,
        selection: Option<StructuredSelection>,
        known: &[CatalogItem],
    ) -> ResolutionReply {
        let catalog = self.catalogs.for_kind(kind.media_kind());
        let service = catalog.service_name();
        let id = &item.external_id;

        let result = if kind.is_removal() {
            let options = RemoveOptions {
                delete_files: false,
                selection: selection.clone(),
            };
            self.resilience
                .execute(service, &self.catalog_policy, || catalog.remove_or_unmonitor(id, &options))
                .await
        } else {
            self.resilience
                .execute(service, &self.catalog_policy, || catalog.add_or_monitor(id, selection.as_ref()))
                .await
        };

        let mut data = item_data(item);
        data["action"] = json!(action_word(kind));
        if let Some(selection) = &selection {
            data["selection"] = json!(selection.describe());
        }

        let (to, template) = match result {
            Ok(outcome) if !outcome.success => {
                let error = outcome
                    .error
                    .unwrap_or_else(|| "the catalog rejected the request".to_string());
                warn!(user_id = %request.user_id, service, id = %id, error = %error, "catalog reported failure");
                data["error"] = json!(error);
                (ResolutionState::Error, TemplateKey::Failed)
            }
            Ok(outcome) => {
                if !outcome.warnings.is_empty() {
                    debug!(service, id = %id, warnings = ?outcome.warnings, "catalog warnings");
                }
                data["searchTriggered"] = json!(outcome.search_triggered);
                let template = match (kind.is_removal(), outcome.changed) {
                    (true, _) => TemplateKey::Removed,
                    (false, true) => TemplateKey::Added,
                    (false, false) => TemplateKey::AlreadyPresent,
                };
                (ResolutionState::Resolved, template)
            }
            Err(e) => {
                warn!(user_id = %request.user_id, service, id = %id, error = %e, "catalog mutation failed");
                data["error"] = json!(e.to_string());
                (ResolutionState::Error, TemplateKey::Failed)
            }
        };

        self.conclude(request, Step::new(kind, from, to, template), data, known)
            .await
    }

    /// Terminal transition: clear the context, then reply. A failed clear is
    /// logged and never replaces the reply.
    async fn conclude(&self, request: &ResolutionRequest, step: Step, data: Value, known: &[CatalogItem]) -> ResolutionReply {
        if let Err(e) = self.store.clear(&request.user_id).await {
            warn!(user_id = %request.user_id, error = %e, "context cleanup failed");
        }
        self.respond(request, step, data, known, Vec::new()).await
    }

    /// Store a new context and prompt for more input.
    async fn suspend(&self, request: &ResolutionRequest, step: Step, ctx: PendingContext, data: Value) -> ResolutionReply {
        let images = if step.template == TemplateKey::Disambiguate {
            poster_images(ctx.candidates())
        } else {
            Vec::new()
        };
        let known = ctx.candidates().to_vec();
        if let Err(e) = self.store.set(&request.user_id, ctx).await {
            warn!(user_id = %request.user_id, error = %e, "failed to store pending context");
        }
        self.respond(request, step, data, &known, images).await
    }

    /// Same prompt, same stored context.
    async fn reprompt_disambiguation(
        &self,
        request: &ResolutionRequest,
        from: ResolutionState,
        ctx: &PendingContext,
    ) -> ResolutionReply {
        let step = Step::new(ctx.kind(), from, ResolutionState::Pending, TemplateKey::Disambiguate);
        let data = disambiguation_data(ctx.query(), ctx.candidates());
        self.respond(request, step, data, ctx.candidates(), poster_images(ctx.candidates()))
            .await
    }

    async fn respond(
        &self,
        request: &ResolutionRequest,
        step: Step,
        data: Value,
        known: &[CatalogItem],
        images: Vec<ImageAttachment>,
    ) -> ResolutionReply {
        info!(
            user_id = %request.user_id,
            kind = step.kind.as_str(),
            from = step.from.as_str(),
            to = step.to.as_str(),
            "resolution transition"
        );
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(
                "resolution_total",
                &[("kind", step.kind.as_str()), ("state", step.to.as_str())],
                1,
            );
        }

        let message = match self
            .responder
            .generate(&request.history, step.to, step.template, &data)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                warn!(template = ?step.template, error = %e, "response generator failed, using template");
                OutboundMessage::from_template(step.template, self.fallback.render(step.template, &data))
            }
        };

        let titles: Vec<&str> = known.iter().map(|item| item.title.as_str()).collect();
        self.validator.check(&message.text, &titles);

        ResolutionReply {
            state: step.to,
            messages: vec![message],
            images,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use marquee_core::catalog::{LibraryFields, OperationOutcome};
    use marquee_core::errors::StoreError;
    use marquee_core::selection::SeasonEntry;
    use marquee_llm::{BreakerConfig, MockModel, MockReply};

    use crate::catalog::{CatalogOp, InMemoryCatalog};
    use crate::parser::{ModelGateway, QUERY_TASK, SELECTION_TASK, STRUCTURED_TASK};
    use crate::store::{ContextUpdate, MemoryContextStore};

    /// Memory store that counts clears and can be told to fail them.
    struct CountingStore {
        inner: MemoryContextStore,
        clears: AtomicUsize,
        sets: AtomicUsize,
        fail_clear: bool,
    }

    impl CountingStore {
        fn new(fail_clear: bool) -> Self {
            Self {
                inner: MemoryContextStore::new(Duration::from_secs(300)),
                clears: AtomicUsize::new(0),
                sets: AtomicUsize::new(0),
                fail_clear,
            }
        }

        fn clears(&self) -> usize {
            self.clears.load(Ordering::SeqCst)
        }

        fn sets(&self) -> usize {
            self.sets.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContextStore for CountingStore {
        async fn get(&self, user: &UserId) -> Option<PendingContext> {
            self.inner.get(user).await
        }

        async fn set(&self, user: &UserId, context: PendingContext) -> Result<(), StoreError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.inner.set(user, context).await
        }

        async fn update(&self, user: &UserId, f: ContextUpdate) -> Result<bool, StoreError> {
            self.inner.update(user, f).await
        }

        async fn clear(&self, user: &UserId) -> Result<(), StoreError> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            if self.fail_clear {
                return Err(StoreError::Unavailable("store offline".into()));
            }
            self.inner.clear(user).await
        }

        async fn sweep(&self) -> usize {
            self.inner.sweep().await
        }

        fn is_expired(&self, context: &PendingContext) -> bool {
            self.inner.is_expired(context)
        }
    }

    struct Harness {
        resolver: RequestResolver,
        movies: Arc<InMemoryCatalog>,
        series: Arc<InMemoryCatalog>,
        store: Arc<CountingStore>,
        metrics: Arc<MetricsRecorder>,
    }

    fn matrices() -> Vec<CatalogItem> {
        let mut first = CatalogItem::new("603", "The Matrix", Some(1999));
        first.poster_url = Some("https://img.example/603.jpg".into());
        vec![
            first,
            CatalogItem::new("604", "The Matrix Reloaded", Some(2003)),
            CatalogItem::new("605", "The Matrix Revolutions", Some(2003)),
        ]
    }

    fn movie_seed() -> Vec<CatalogItem> {
        let mut alien = CatalogItem::new("348", "Alien", Some(1979));
        alien.library_fields = Some(LibraryFields {
            monitored: true,
            has_file: true,
            seasons: Vec::new(),
        });
        let mut seed = matrices();
        seed.push(CatalogItem::new("27205", "Inception", Some(2010)));
        seed.push(alien);
        seed
    }

    fn series_seed() -> Vec<CatalogItem> {
        vec![
            CatalogItem::new("81189", "Breaking Bad", Some(2008)),
            CatalogItem::new("371980", "Severance", Some(2022)),
            CatalogItem::new("371981", "Severance: Behind the Scenes", Some(2023)),
        ]
    }

    fn harness_with(model: MockModel, fail_clear: bool, sequencing: bool) -> Harness {
        let model = Arc::new(model);
        let metrics = Arc::new(MetricsRecorder::new());
        let resilience = Arc::new(
            Resilience::new(BreakerConfig {
                failure_threshold: 50,
                cooldown_ms: 60_000,
            })
            .with_metrics(Arc::clone(&metrics)),
        );
        let gateway = ModelGateway::new(model, Arc::clone(&resilience), RetryPolicy::no_retry());
        let movies = Arc::new(InMemoryCatalog::new(MediaKind::Movie, "movies").with_items(movie_seed()));
        let series = Arc::new(InMemoryCatalog::new(MediaKind::Series, "series").with_items(series_seed()));
        let store = Arc::new(CountingStore::new(fail_clear));
        let resolver = RequestResolver::new(
            IntentParser::new(gateway),
            store.clone(),
            Catalogs::new(movies.clone(), series.clone()),
            resilience,
            Arc::new(TemplateResponder),
        )
        .with_catalog_policy(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            backoff_factor: 2.0,
            max_delay_ms: 5,
            jitter: false,
            timeout_ms: None,
        })
        .with_per_user_sequencing(sequencing)
        .with_metrics(Arc::clone(&metrics));
        Harness {
            resolver,
            movies,
            series,
            store,
            metrics,
        }
    }

    fn harness(model: MockModel) -> Harness {
        harness_with(model, false, false)
    }

    fn nothing() -> MockReply {
        MockReply::text("null")
    }

    fn ordinal(value: &str) -> MockReply {
        MockReply::json(json!({"selectionType": "ordinal", "value": value}))
    }

    fn user() -> UserId {
        UserId::from_raw("u1")
    }

    fn text(reply: &ResolutionReply) -> &str {
        &reply.messages[0].text
    }

    #[tokio::test]
    async fn scenario_a_single_result_executes_directly() {
        let h = harness(
            MockModel::empty()
                .route(QUERY_TASK, vec![MockReply::text("Inception")])
                .route(SELECTION_TASK, vec![nothing()])
                .route(STRUCTURED_TASK, vec![nothing()]),
        );

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "download inception")).await;

        assert_eq!(reply.state, ResolutionState::Resolved);
        assert_eq!(reply.messages[0].template, Some(TemplateKey::Added));
        assert!(text(&reply).contains("\"Inception\" (2010)"));
        assert_eq!(h.store.sets(), 0, "no context is ever created");
        assert!(h.store.get(&user()).await.is_none());
        assert_eq!(h.store.clears(), 1);
        let mutations = h.movies.mutations();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].id.as_str(), "27205");
    }

    #[tokio::test]
    async fn scenario_b_multiple_results_store_context() {
        let h = harness(
            MockModel::empty()
                .route(QUERY_TASK, vec![MockReply::text("The Matrix")])
                .route(SELECTION_TASK, vec![nothing()])
                .route(STRUCTURED_TASK, vec![nothing()]),
        );

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "download the matrix")).await;

        assert_eq!(reply.state, ResolutionState::Pending);
        assert_eq!(reply.messages[0].template, Some(TemplateKey::Disambiguate));
        assert!(text(&reply).contains("2. \"The Matrix Reloaded\" (2003)"));
        assert_eq!(reply.images.len(), 1);
        assert_eq!(reply.images[0].caption.as_deref(), Some("The Matrix (1999)"));

        let ctx = h.store.get(&user()).await.unwrap();
        assert_eq!(ctx.kind(), ContextKind::MovieAdd);
        assert_eq!(ctx.candidates().len(), 3);
        assert_eq!(ctx.query(), "The Matrix");
        assert_eq!(h.store.clears(), 0);
        assert!(h.movies.mutations().is_empty());
    }

    async fn pending_matrix(h: &Harness) {
        h.store
            .set(&user(), PendingContext::new(ContextKind::MovieAdd, matrices(), "matrix"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn scenario_c_ordinal_follow_up_resolves() {
        let h = harness(MockModel::empty().route(SELECTION_TASK, vec![ordinal("2")]));
        pending_matrix(&h).await;

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "the second one")).await;

        assert_eq!(reply.state, ResolutionState::Resolved);
        assert!(text(&reply).contains("The Matrix Reloaded"));
        assert_eq!(h.movies.mutations()[0].id.as_str(), "604");
        assert!(h.store.get(&user()).await.is_none());
        assert_eq!(h.store.clears(), 1);
    }

    #[tokio::test]
    async fn scenario_d_out_of_range_reprompts_with_same_context() {
        let h = harness(MockModel::empty().route(SELECTION_TASK, vec![ordinal("99")]));
        let created = Utc::now() - chrono::Duration::seconds(30);
        h.store
            .set(
                &user(),
                PendingContext::new(ContextKind::MovieAdd, matrices(), "matrix").with_created_at(created),
            )
            .await
            .unwrap();

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "99")).await;

        assert_eq!(reply.state, ResolutionState::Pending);
        assert_eq!(reply.messages[0].template, Some(TemplateKey::Disambiguate));
        let ctx = h.store.get(&user()).await.unwrap();
        assert_eq!(ctx.candidates().len(), 3);
        assert_eq!(ctx.created_at, created, "TTL does not reset");
        assert_eq!(h.store.clears(), 0);
        assert!(h.movies.mutations().is_empty());
    }

    #[tokio::test]
    async fn scenario_e_series_asks_for_seasons_then_executes() {
        let h = harness(
            MockModel::empty()
                .route(QUERY_TASK, vec![MockReply::text("Breaking Bad")])
                .route(SELECTION_TASK, vec![nothing()])
                .route(
                    STRUCTURED_TASK,
                    vec![nothing(), MockReply::json(json!({"entries": [{"season": 1}]}))],
                ),
        );

        let first = h
            .resolver
            .handle(ResolutionRequest::new("u1", "download the show breaking bad"))
            .await;
        assert_eq!(first.state, ResolutionState::GranularPending);
        assert_eq!(first.messages[0].template, Some(TemplateKey::AskSeasons));
        let ctx = h.store.get(&user()).await.unwrap();
        assert_eq!(ctx.kind(), ContextKind::SeriesAdd);
        assert!(ctx.is_granular());
        assert_eq!(h.store.clears(), 0);

        let second = h.resolver.handle(ResolutionRequest::new("u1", "season 1")).await;
        assert_eq!(second.state, ResolutionState::Resolved);
        assert!(text(&second).contains("season 1"));
        let mutations = h.series.mutations();
        assert_eq!(mutations.len(), 1);
        assert_eq!(
            mutations[0].selection,
            Some(StructuredSelection::Entries(vec![SeasonEntry {
                season: 1,
                episodes: None
            }]))
        );
        assert!(h.store.get(&user()).await.is_none());
        assert_eq!(h.store.clears(), 1);
    }

    #[tokio::test]
    async fn scenario_f_failed_mutation_reports_error_and_clears() {
        let h = harness(MockModel::empty().route(SELECTION_TASK, vec![ordinal("1")]));
        pending_matrix(&h).await;
        h.movies.fail_times(
            CatalogOp::Add,
            ServiceError::Server {
                status: 503,
                body: "unavailable".into(),
            },
            3,
        );

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "the first one")).await;

        assert_eq!(reply.state, ResolutionState::Error);
        assert_eq!(reply.messages[0].template, Some(TemplateKey::Failed));
        assert!(text(&reply).starts_with("Couldn't download \"The Matrix\" (1999)"));
        assert!(text(&reply).contains("server error 503: unavailable"));
        assert_eq!(h.movies.call_count(CatalogOp::Add), 3);
        assert!(h.store.get(&user()).await.is_none());
        assert_eq!(h.store.clears(), 1);
        assert_eq!(
            h.metrics
                .counter_get("resolution_total", &[("kind", "movie-add"), ("state", "error")]),
            1
        );
    }

    #[tokio::test]
    async fn cleanup_failure_is_swallowed() {
        let h = harness_with(MockModel::empty().route(SELECTION_TASK, vec![ordinal("3")]), true, false);
        pending_matrix(&h).await;

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "the third")).await;

        assert_eq!(reply.state, ResolutionState::Resolved);
        assert!(text(&reply).contains("The Matrix Revolutions"));
        assert_eq!(h.store.clears(), 1);
    }

    #[tokio::test]
    async fn unsuccessful_outcome_is_an_error() {
        let h = harness(MockModel::empty().route(SELECTION_TASK, vec![ordinal("1")]));
        pending_matrix(&h).await;
        h.movies.script_outcome(CatalogOp::Add, OperationOutcome::failed("quality profile missing"));

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "1")).await;

        assert_eq!(reply.state, ResolutionState::Error);
        assert!(text(&reply).ends_with("quality profile missing"));
        assert_eq!(h.store.clears(), 1);
    }

    #[tokio::test]
    async fn unchanged_add_reports_already_present() {
        let h = harness(MockModel::empty().route(SELECTION_TASK, vec![ordinal("1"), ordinal("1")]));
        pending_matrix(&h).await;
        h.resolver.handle(ResolutionRequest::new("u1", "1")).await;
        pending_matrix(&h).await;

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "1")).await;

        assert_eq!(reply.state, ResolutionState::Resolved);
        assert_eq!(reply.messages[0].template, Some(TemplateKey::AlreadyPresent));
    }

    #[tokio::test]
    async fn cancel_clears_pending_context() {
        let h = harness(MockModel::empty());
        pending_matrix(&h).await;

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "Never mind!")).await;

        assert_eq!(reply.messages[0].template, Some(TemplateKey::Cancelled));
        assert!(reply.state.is_terminal());
        assert!(h.store.get(&user()).await.is_none());
        assert_eq!(h.store.clears(), 1);
    }

    #[tokio::test]
    async fn mismatched_kind_starts_over() {
        let h = harness(
            MockModel::empty()
                .route(QUERY_TASK, vec![MockReply::text("Severance")])
                .route(SELECTION_TASK, vec![nothing()])
                .route(STRUCTURED_TASK, vec![nothing()]),
        );
        pending_matrix(&h).await;

        let reply = h
            .resolver
            .handle(ResolutionRequest::new("u1", "add severance").with_kind(ContextKind::SeriesAdd))
            .await;

        assert_eq!(reply.state, ResolutionState::Pending);
        let ctx = h.store.get(&user()).await.unwrap();
        assert_eq!(ctx.kind(), ContextKind::SeriesAdd);
        assert_eq!(ctx.candidates().len(), 2);
    }

    #[tokio::test]
    async fn series_pending_selection_then_seasons() {
        let h = harness(
            MockModel::empty()
                .route(SELECTION_TASK, vec![ordinal("1")])
                .route(
                    STRUCTURED_TASK,
                    vec![nothing(), MockReply::json(json!({"entries": [{"season": 2, "episodes": [1, 2]}]}))],
                ),
        );
        let severance: Vec<CatalogItem> = series_seed().into_iter().skip(1).collect();
        h.store
            .set(&user(), PendingContext::new(ContextKind::SeriesAdd, severance, "severance"))
            .await
            .unwrap();

        let first = h.resolver.handle(ResolutionRequest::new("u1", "the first")).await;
        assert_eq!(first.state, ResolutionState::GranularPending);
        assert!(h.store.get(&user()).await.unwrap().is_granular());

        let second = h.resolver.handle(ResolutionRequest::new("u1", "season 2 episodes 1 and 2")).await;
        assert_eq!(second.state, ResolutionState::Resolved);
        assert_eq!(h.series.mutations()[0].id.as_str(), "371980");
        assert_eq!(h.store.clears(), 1);
    }

    #[tokio::test]
    async fn series_pending_with_both_selections_executes() {
        let h = harness(
            MockModel::empty()
                .route(SELECTION_TASK, vec![ordinal("2")])
                .route(STRUCTURED_TASK, vec![MockReply::text("{}")]),
        );
        h.store
            .set(&user(), PendingContext::new(ContextKind::SeriesAdd, series_seed(), "b"))
            .await
            .unwrap();

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "the second, all seasons")).await;

        assert_eq!(reply.state, ResolutionState::Resolved);
        let mutation = &h.series.mutations()[0];
        assert_eq!(mutation.id.as_str(), "371980");
        assert_eq!(mutation.selection, Some(StructuredSelection::EntireSeries));
    }

    #[tokio::test]
    async fn malformed_season_spec_reprompts_granular() {
        let h = harness(MockModel::empty().route(
            STRUCTURED_TASK,
            vec![MockReply::json(json!({"entries": [{"season": "one"}]}))],
        ));
        let mut ctx = PendingContext::new(ContextKind::SeriesAdd, series_seed(), "breaking bad");
        if let Some(series) = ctx.series_mut() {
            series.chosen = Some(series_seed()[0].clone());
        }
        h.store.set(&user(), ctx).await.unwrap();

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "season one")).await;

        assert_eq!(reply.state, ResolutionState::GranularPending);
        assert_eq!(reply.messages[0].template, Some(TemplateKey::AskSeasons));
        assert!(h.store.get(&user()).await.unwrap().is_granular());
        assert_eq!(h.store.clears(), 0);
    }

    #[tokio::test]
    async fn season_reply_with_unknown_keys_reprompts_granular() {
        let h = harness(MockModel::empty().route(STRUCTURED_TASK, vec![MockReply::json(json!({"season": 2}))]));
        let mut ctx = PendingContext::new(ContextKind::SeriesAdd, series_seed(), "breaking bad");
        if let Some(series) = ctx.series_mut() {
            series.chosen = Some(series_seed()[0].clone());
        }
        h.store.set(&user(), ctx).await.unwrap();

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "season 2")).await;

        assert_eq!(reply.state, ResolutionState::GranularPending);
        assert_eq!(reply.messages[0].template, Some(TemplateKey::AskSeasons));
        assert!(h.series.mutations().is_empty());
        assert!(h.store.get(&user()).await.unwrap().is_granular());
        assert_eq!(h.store.clears(), 0);
    }

    #[tokio::test]
    async fn removal_searches_the_library() {
        let h = harness(
            MockModel::empty()
                .route(QUERY_TASK, vec![MockReply::text("alien")])
                .route(SELECTION_TASK, vec![nothing()])
                .route(STRUCTURED_TASK, vec![nothing()]),
        );

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "remove alien")).await;

        assert_eq!(reply.state, ResolutionState::Resolved);
        assert_eq!(reply.messages[0].template, Some(TemplateKey::Removed));
        assert_eq!(h.movies.call_count(CatalogOp::Search), 0);
        assert_eq!(h.movies.call_count(CatalogOp::ListLibrary), 1);
        assert!(h.movies.list_library().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_query_asks_for_clarification() {
        let h = harness(
            MockModel::empty()
                .route(QUERY_TASK, vec![MockReply::Error(ServiceError::Network("down".into()))])
                .route(SELECTION_TASK, vec![nothing()])
                .route(STRUCTURED_TASK, vec![nothing()]),
        );

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "download the movie")).await;

        assert_eq!(reply.state, ResolutionState::Error);
        assert_eq!(reply.messages[0].template, Some(TemplateKey::Clarify));
        assert_eq!(h.store.sets(), 0);
        assert_eq!(h.movies.call_count(CatalogOp::Search), 0);
    }

    #[tokio::test]
    async fn no_results_is_terminal() {
        let h = harness(
            MockModel::empty()
                .route(QUERY_TASK, vec![MockReply::text("Zardoz")])
                .route(SELECTION_TASK, vec![nothing()])
                .route(STRUCTURED_TASK, vec![nothing()]),
        );

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "get zardoz")).await;

        assert_eq!(reply.state, ResolutionState::Error);
        assert_eq!(reply.messages[0].template, Some(TemplateKey::NoResults));
        assert_eq!(text(&reply), "I couldn't find anything matching Zardoz.");
        assert_eq!(h.store.clears(), 1);
    }

    #[tokio::test]
    async fn search_outage_is_reported() {
        let h = harness(
            MockModel::empty()
                .route(QUERY_TASK, vec![MockReply::text("Dune")])
                .route(SELECTION_TASK, vec![nothing()])
                .route(STRUCTURED_TASK, vec![nothing()]),
        );
        h.movies
            .fail_times(CatalogOp::Search, ServiceError::Network("connection reset".into()), 3);

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "download dune")).await;

        assert_eq!(reply.state, ResolutionState::Error);
        assert_eq!(text(&reply), "Couldn't search for Dune: network error: connection reset");
        assert_eq!(
            h.metrics.counter_get("resilience_retries_total", &[("service", "movies")]),
            2
        );
    }

    #[tokio::test]
    async fn inline_selection_on_single_result_that_misses_stores_context() {
        let h = harness(
            MockModel::empty()
                .route(QUERY_TASK, vec![MockReply::text("Inception")])
                .route(
                    SELECTION_TASK,
                    vec![MockReply::json(json!({"selectionType": "year", "value": "1984"}))],
                )
                .route(STRUCTURED_TASK, vec![nothing()]),
        );

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "download inception from 1984")).await;

        assert_eq!(reply.state, ResolutionState::Pending);
        assert_eq!(h.store.get(&user()).await.unwrap().candidates().len(), 1);
        assert!(h.movies.mutations().is_empty());
    }

    #[tokio::test]
    async fn per_user_sequencing_orders_same_user_requests() {
        let h = harness_with(
            MockModel::empty()
                .route(
                    QUERY_TASK,
                    vec![MockReply::delayed(Duration::from_millis(50), MockReply::text("The Matrix"))],
                )
                .route(SELECTION_TASK, vec![nothing(), ordinal("2")])
                .route(STRUCTURED_TASK, vec![nothing()]),
            false,
            true,
        );
        let resolver = Arc::new(h.resolver);

        let first = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.handle(ResolutionRequest::new("u1", "download the matrix")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.handle(ResolutionRequest::new("u1", "the second one")).await })
        };

        assert_eq!(first.await.unwrap().state, ResolutionState::Pending);
        assert_eq!(second.await.unwrap().state, ResolutionState::Resolved);
        assert_eq!(h.movies.mutations()[0].id.as_str(), "604");
        assert!(resolver.user_locks.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_context_is_treated_as_new() {
        let h = harness(
            MockModel::empty()
                .route(QUERY_TASK, vec![MockReply::text("Inception")])
                .route(SELECTION_TASK, vec![ordinal("2")])
                .route(STRUCTURED_TASK, vec![nothing()]),
        );
        h.store
            .set(
                &user(),
                PendingContext::new(ContextKind::MovieAdd, matrices(), "matrix")
                    .with_created_at(Utc::now() - chrono::Duration::seconds(3600)),
            )
            .await
            .unwrap();

        let reply = h.resolver.handle(ResolutionRequest::new("u1", "inception, the second one")).await;

        assert_eq!(reply.state, ResolutionState::Pending, "single result with a missed ordinal");
        assert!(h.movies.mutations().is_empty());
    }

    #[test]
    fn keyword_routing() {
        assert_eq!(route_kind("download the matrix"), ContextKind::MovieAdd);
        assert_eq!(route_kind("get season 2 of severance"), ContextKind::SeriesAdd);
        assert_eq!(route_kind("please delete alien"), ContextKind::MovieRemove);
        assert_eq!(route_kind("remove the show Lost"), ContextKind::SeriesRemove);
    }

    #[test]
    fn cancel_phrases() {
        assert!(is_cancel("cancel"));
        assert!(is_cancel("  Forget it. "));
        assert!(is_cancel("nevermind"));
        assert!(!is_cancel("cancel culture documentary"));
    }

    #[test]
    fn request_wire_format() {
        let request: ResolutionRequest = serde_json::from_value(json!({
            "text": "download dune",
            "userId": "u9",
            "kind": "series-add",
            "history": [{"role": "assistant", "content": "hi"}]
        }))
        .unwrap();
        assert_eq!(request.user_id.as_str(), "u9");
        assert_eq!(request.kind, Some(ContextKind::SeriesAdd));
        assert_eq!(request.history.len(), 1);

        let minimal: ResolutionRequest = serde_json::from_value(json!({"text": "x", "userId": "u"})).unwrap();
        assert!(minimal.kind.is_none() && minimal.history.is_empty());
    }
}
