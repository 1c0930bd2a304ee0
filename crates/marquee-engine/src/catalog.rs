//! Seeded, in-process catalog service used by the binary's demo mode and by
//! the resolver tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use marquee_core::catalog::{CatalogClient, CatalogItem, LibraryFields, MediaKind, OperationOutcome, RemoveOptions};
use marquee_core::errors::ServiceError;
use marquee_core::ids::ExternalId;
use marquee_core::selection::StructuredSelection;

use crate::error::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogOp {
    Search,
    ListLibrary,
    Add,
    Remove,
}

/// A recorded add/remove call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub op: CatalogOp,
    pub id: ExternalId,
    pub selection: Option<StructuredSelection>,
}

/// Seed data: `{"movies": [...], "series": [...]}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogFixture {
    pub movies: Vec<CatalogItem>,
    pub series: Vec<CatalogItem>,
}

impl CatalogFixture {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::Fixture(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Fixture(format!("{}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    /// Movie and series catalogs seeded from this fixture.
    pub fn into_catalogs(self) -> (InMemoryCatalog, InMemoryCatalog) {
        (
            InMemoryCatalog::new(MediaKind::Movie, "movies").with_items(self.movies),
            InMemoryCatalog::new(MediaKind::Series, "series").with_items(self.series),
        )
    }
}

/// Most recent add/remove calls kept by [`InMemoryCatalog::mutations`].
pub const MUTATION_LOG_CAPACITY: usize = 256;

#[derive(Default)]
struct CatalogState {
    items: Vec<CatalogItem>,
    failures: VecDeque<(CatalogOp, ServiceError)>,
    outcomes: VecDeque<(CatalogOp, OperationOutcome)>,
    mutations: VecDeque<Mutation>,
    calls: HashMap<CatalogOp, usize>,
}

impl CatalogState {
    fn record(&mut self, mutation: Mutation) {
        if self.mutations.len() == MUTATION_LOG_CAPACITY {
            self.mutations.pop_front();
        }
        self.mutations.push_back(mutation);
    }
}

pub struct InMemoryCatalog {
    kind: MediaKind,
    service: String,
    state: Mutex<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new(kind: MediaKind, service: impl Into<String>) -> Self {
        Self {
            kind,
            service: service.into(),
            state: Mutex::new(CatalogState::default()),
        }
    }

    pub fn with_items(self, items: Vec<CatalogItem>) -> Self {
        self.state.lock().items = items;
        self
    }

    /// Fail the next `times` calls of `op`. Queued failures are consumed in
    /// order.
    pub fn fail_times(&self, op: CatalogOp, error: ServiceError, times: usize) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.failures.push_back((op, error.clone()));
        }
    }

    /// Return `outcome` from the next add/remove call instead of applying it.
    pub fn script_outcome(&self, op: CatalogOp, outcome: OperationOutcome) {
        self.state.lock().outcomes.push_back((op, outcome));
    }

    /// The last [`MUTATION_LOG_CAPACITY`] add/remove calls, oldest first.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().mutations.iter().cloned().collect()
    }

    pub fn call_count(&self, op: CatalogOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn item(&self, id: &ExternalId) -> Option<CatalogItem> {
        self.state.lock().items.iter().find(|i| &i.external_id == id).cloned()
    }

    /// Record the call and pop a scripted failure for it, if any.
    fn enter(&self, op: CatalogOp) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        if let Some(pos) = state.failures.iter().position(|(o, _)| *o == op) {
            if let Some((_, error)) = state.failures.remove(pos) {
                return Err(error);
            }
        }
        Ok(())
    }

    fn scripted_outcome(state: &mut CatalogState, op: CatalogOp) -> Option<OperationOutcome> {
        let pos = state.outcomes.iter().position(|(o, _)| *o == op)?;
        state.outcomes.remove(pos).map(|(_, outcome)| outcome)
    }
}

fn merge_seasons(existing: &[u32], selection: Option<&StructuredSelection>) -> Option<Vec<u32>> {
    let wanted = match selection {
        None | Some(StructuredSelection::EntireSeries) => return Some(Vec::new()),
        Some(sel) => sel.seasons(),
    };
    if existing.is_empty() {
        // already tracking every season
        return None;
    }
    if wanted.iter().all(|s| existing.contains(s)) {
        return None;
    }
    let mut merged = existing.to_vec();
    merged.extend(wanted);
    merged.sort_unstable();
    merged.dedup();
    Some(merged)
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    fn service_name(&self) -> &str {
        &self.service
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn search(&self, query: &str) -> Result<Vec<CatalogItem>, ServiceError> {
        self.enter(CatalogOp::Search)?;
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.lock();
        Ok(state
            .items
            .iter()
            .filter(|item| item.title.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn list_library(&self) -> Result<Vec<CatalogItem>, ServiceError> {
        self.enter(CatalogOp::ListLibrary)?;
        let state = self.state.lock();
        Ok(state.items.iter().filter(|i| i.in_library()).cloned().collect())
    }

    async fn add_or_monitor(
        &self,
        id: &ExternalId,
        selection: Option<&StructuredSelection>,
    ) -> Result<OperationOutcome, ServiceError> {
        self.enter(CatalogOp::Add)?;
        let mut state = self.state.lock();
        state.record(Mutation {
            op: CatalogOp::Add,
            id: id.clone(),
            selection: selection.cloned(),
        });
        if let Some(outcome) = Self::scripted_outcome(&mut state, CatalogOp::Add) {
            return Ok(outcome);
        }

        let kind = self.kind;
        let Some(item) = state.items.iter_mut().find(|i| &i.external_id == id) else {
            return Err(ServiceError::NotFound(format!("{} {id}", kind.as_str())));
        };

        let outcome = match (&mut item.library_fields, kind) {
            (Some(fields), MediaKind::Movie) if fields.monitored => OperationOutcome::unchanged(),
            (Some(fields), MediaKind::Series) if fields.monitored => match merge_seasons(&fields.seasons, selection) {
                Some(seasons) if seasons != fields.seasons => {
                    fields.seasons = seasons;
                    OperationOutcome::changed(true)
                }
                _ => OperationOutcome::unchanged(),
            },
            (fields, _) => {
                *fields = Some(LibraryFields {
                    monitored: true,
                    has_file: false,
                    seasons: selection.map(StructuredSelection::seasons).unwrap_or_default(),
                });
                OperationOutcome::changed(true)
            }
        };
        debug!(service = %self.service, id = %id, changed = outcome.changed, "catalog add");
        Ok(outcome)
    }

    async fn remove_or_unmonitor(
        &self,
        id: &ExternalId,
        options: &RemoveOptions,
    ) -> Result<OperationOutcome, ServiceError> {
        self.enter(CatalogOp::Remove)?;
        let mut state = self.state.lock();
        state.record(Mutation {
            op: CatalogOp::Remove,
            id: id.clone(),
            selection: options.selection.clone(),
        });
        if let Some(outcome) = Self::scripted_outcome(&mut state, CatalogOp::Remove) {
            return Ok(outcome);
        }

        let kind = self.kind;
        let Some(item) = state.items.iter_mut().find(|i| &i.external_id == id) else {
            return Err(ServiceError::NotFound(format!("{} {id}", kind.as_str())));
        };
        let Some(fields) = item.library_fields.as_mut() else {
            return Ok(OperationOutcome::unchanged().with_warning("not in library"));
        };

        let outcome = match &options.selection {
            Some(StructuredSelection::Entries(_)) if kind == MediaKind::Series && !fields.seasons.is_empty() => {
                let dropped = options.selection.as_ref().map(StructuredSelection::seasons).unwrap_or_default();
                let before = fields.seasons.len();
                fields.seasons.retain(|s| !dropped.contains(s));
                if fields.seasons.is_empty() {
                    item.library_fields = None;
                    OperationOutcome::changed(false)
                } else if fields.seasons.len() == before {
                    OperationOutcome::unchanged()
                } else {
                    OperationOutcome::changed(false)
                }
            }
            _ => {
                item.library_fields = None;
                OperationOutcome::changed(false)
            }
        };
        debug!(service = %self.service, id = %id, changed = outcome.changed, "catalog remove");
        Ok(outcome)
    }
}
