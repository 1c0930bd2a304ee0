use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogItem, MediaKind};
use crate::selection::StructuredSelection;

/// Which flow a pending selection belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextKind {
    MovieAdd,
    MovieRemove,
    SeriesAdd,
    SeriesRemove,
}

impl ContextKind {
    pub fn media_kind(self) -> MediaKind {
        match self {
            Self::MovieAdd | Self::MovieRemove => MediaKind::Movie,
            Self::SeriesAdd | Self::SeriesRemove => MediaKind::Series,
        }
    }

    pub fn is_removal(self) -> bool {
        matches!(self, Self::MovieRemove | Self::SeriesRemove)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MovieAdd => "movie-add",
            Self::MovieRemove => "movie-remove",
            Self::SeriesAdd => "series-add",
            Self::SeriesRemove => "series-remove",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoviePending {
    pub candidates: Vec<CatalogItem>,
    pub query: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPending {
    pub candidates: Vec<CatalogItem>,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_series_selection: Option<StructuredSelection>,
    /// Set once the show is picked but seasons are still missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen: Option<CatalogItem>,
}

/// Per-kind payload, discriminated by `kind` on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Pending {
    MovieAdd(MoviePending),
    MovieRemove(MoviePending),
    SeriesAdd(SeriesPending),
    SeriesRemove(SeriesPending),
}

/// Disambiguation state awaiting the user's next message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingContext {
    #[serde(flatten)]
    pub pending: Pending,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

impl PendingContext {
    pub fn new(kind: ContextKind, candidates: Vec<CatalogItem>, query: impl Into<String>) -> Self {
        let query = query.into();
        let pending = match kind {
            ContextKind::MovieAdd => Pending::MovieAdd(MoviePending { candidates, query }),
            ContextKind::MovieRemove => Pending::MovieRemove(MoviePending { candidates, query }),
            ContextKind::SeriesAdd => Pending::SeriesAdd(SeriesPending::new(candidates, query)),
            ContextKind::SeriesRemove => Pending::SeriesRemove(SeriesPending::new(candidates, query)),
        };
        Self {
            pending,
            created_at: Utc::now(),
            active: true,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn kind(&self) -> ContextKind {
        match &self.pending {
            Pending::MovieAdd(_) => ContextKind::MovieAdd,
            Pending::MovieRemove(_) => ContextKind::MovieRemove,
            Pending::SeriesAdd(_) => ContextKind::SeriesAdd,
            Pending::SeriesRemove(_) => ContextKind::SeriesRemove,
        }
    }

    pub fn candidates(&self) -> &[CatalogItem] {
        match &self.pending {
            Pending::MovieAdd(m) | Pending::MovieRemove(m) => &m.candidates,
            Pending::SeriesAdd(s) | Pending::SeriesRemove(s) => &s.candidates,
        }
    }

    pub fn query(&self) -> &str {
        match &self.pending {
            Pending::MovieAdd(m) | Pending::MovieRemove(m) => &m.query,
            Pending::SeriesAdd(s) | Pending::SeriesRemove(s) => &s.query,
        }
    }

    pub fn series(&self) -> Option<&SeriesPending> {
        match &self.pending {
            Pending::SeriesAdd(s) | Pending::SeriesRemove(s) => Some(s),
            _ => None,
        }
    }

    pub fn series_mut(&mut self) -> Option<&mut SeriesPending> {
        match &mut self.pending {
            Pending::SeriesAdd(s) | Pending::SeriesRemove(s) => Some(s),
            _ => None,
        }
    }

    /// Series item already picked, only seasons outstanding.
    pub fn is_granular(&self) -> bool {
        self.series().is_some_and(|s| s.chosen.is_some())
    }
}

impl SeriesPending {
    fn new(candidates: Vec<CatalogItem>, query: String) -> Self {
        Self {
            candidates,
            query,
            resolved_series_selection: None,
            chosen: None,
        }
    }
}
