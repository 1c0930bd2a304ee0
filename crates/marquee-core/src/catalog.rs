use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;
use crate::ids::ExternalId;
use crate::selection::StructuredSelection;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Movie,
    Series,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Series => "series",
        }
    }
}

/// Library-side state attached to items the catalog already tracks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryFields {
    #[serde(default)]
    pub monitored: bool,
    #[serde(default)]
    pub has_file: bool,
    /// Monitored season numbers (series only).
    #[serde(default)]
    pub seasons: Vec<u32>,
}

/// Immutable snapshot returned by a search or library listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub external_id: ExternalId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_fields: Option<LibraryFields>,
}

impl CatalogItem {
    pub fn new(external_id: impl Into<String>, title: impl Into<String>, year: Option<i32>) -> Self {
        Self {
            external_id: ExternalId::from_raw(external_id),
            title: title.into(),
            year,
            genres: Vec::new(),
            status: String::new(),
            poster_url: None,
            library_fields: None,
        }
    }

    /// "Title (1999)" or just "Title".
    pub fn display_title(&self) -> String {
        match self.year {
            Some(year) => format!("{} ({year})", self.title),
            None => self.title.clone(),
        }
    }

    pub fn in_library(&self) -> bool {
        self.library_fields.is_some()
    }
}

/// Result of an add/remove call. Never retried itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub success: bool,
    pub changed: bool,
    pub search_triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl OperationOutcome {
    pub fn changed(search_triggered: bool) -> Self {
        Self {
            success: true,
            changed: true,
            search_triggered,
            ..Default::default()
        }
    }

    pub fn unchanged() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveOptions {
    #[serde(default)]
    pub delete_files: bool,
    /// Seasons/episodes to unmonitor; `None` or an entire-series selection
    /// removes the whole item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<StructuredSelection>,
}

/// One media-catalog service (one per [`MediaKind`]).
///
/// Implementations are plain typed calls; retry and circuit breaking are
/// applied by the caller.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Logical service name, used to key the circuit breaker.
    fn service_name(&self) -> &str;
    fn kind(&self) -> MediaKind;

    async fn search(&self, query: &str) -> Result<Vec<CatalogItem>, ServiceError>;
    async fn list_library(&self) -> Result<Vec<CatalogItem>, ServiceError>;
    async fn add_or_monitor(
        &self,
        id: &ExternalId,
        selection: Option<&StructuredSelection>,
    ) -> Result<OperationOutcome, ServiceError>;
    async fn remove_or_unmonitor(
        &self,
        id: &ExternalId,
        options: &RemoveOptions,
    ) -> Result<OperationOutcome, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_title_includes_year_when_known() {
        assert_eq!(CatalogItem::new("603", "The Matrix", Some(1999)).display_title(), "The Matrix (1999)");
        assert_eq!(CatalogItem::new("1", "Untitled", None).display_title(), "Untitled");
    }

    #[test]
    fn catalog_item_deserializes_sparse_json() {
        let item: CatalogItem =
            serde_json::from_str(r#"{"externalId":"27205","title":"Inception","year":2010}"#).unwrap();
        assert_eq!(item.external_id.as_str(), "27205");
        assert!(item.genres.is_empty());
        assert!(!item.in_library());
    }

    #[test]
    fn outcome_constructors() {
        let ok = OperationOutcome::changed(true);
        assert!(ok.success && ok.changed && ok.search_triggered);

        let same = OperationOutcome::unchanged();
        assert!(same.success && !same.changed);

        let failed = OperationOutcome::failed("disk full").with_warning("quota");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
        assert_eq!(failed.warnings, vec!["quota".to_string()]);
    }
}
