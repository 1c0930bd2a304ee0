use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the user points at one of several candidates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionCriterion {
    /// 1-based position, kept as the raw text the parser produced.
    Ordinal(String),
    /// Release year, kept as raw text.
    Year(String),
}

impl SelectionCriterion {
    pub fn ordinal(value: impl Into<String>) -> Self {
        Self::Ordinal(value.into())
    }

    pub fn year(value: impl Into<String>) -> Self {
        Self::Year(value.into())
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Ordinal(_) => "ordinal",
            Self::Year(_) => "year",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonEntry {
    pub season: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episodes: Option<Vec<u32>>,
}

/// Validated season/episode choice for a series.
///
/// Serialized as `{}` for the entire series or `{"entries": [...]}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SelectionWire", into = "SelectionWire")]
pub enum StructuredSelection {
    EntireSeries,
    Entries(Vec<SeasonEntry>),
}

#[derive(Clone, Serialize, Deserialize)]
struct SelectionWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entries: Option<Vec<SeasonEntry>>,
}

impl From<SelectionWire> for StructuredSelection {
    fn from(wire: SelectionWire) -> Self {
        match wire.entries {
            Some(entries) if !entries.is_empty() => Self::Entries(entries),
            _ => Self::EntireSeries,
        }
    }
}

impl From<StructuredSelection> for SelectionWire {
    fn from(sel: StructuredSelection) -> Self {
        match sel {
            StructuredSelection::EntireSeries => Self { entries: None },
            StructuredSelection::Entries(entries) => Self { entries: Some(entries) },
        }
    }
}

impl StructuredSelection {
    pub fn is_entire_series(&self) -> bool {
        matches!(self, Self::EntireSeries)
    }

    /// Season numbers named by the selection, empty for the entire series.
    pub fn seasons(&self) -> Vec<u32> {
        match self {
            Self::EntireSeries => Vec::new(),
            Self::Entries(entries) => entries.iter().map(|e| e.season).collect(),
        }
    }

    /// Human-readable summary, e.g. "season 1, season 2 (episodes 1, 3)".
    pub fn describe(&self) -> String {
        match self {
            Self::EntireSeries => "all seasons".to_string(),
            Self::Entries(entries) => entries
                .iter()
                .map(|e| match &e.episodes {
                    Some(eps) if !eps.is_empty() => {
                        let list: Vec<String> = eps.iter().map(u32::to_string).collect();
                        format!("season {} (episodes {})", e.season, list.join(", "))
                    }
                    _ => format!("season {}", e.season),
                })
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Structured selection exactly as the model produced it. Field values are
/// left untyped so the resolver can reject malformed entries as a whole.
/// Unknown keys are a schema violation: only `{}` means the entire series.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStructuredSelection {
    #[serde(default)]
    pub entries: Option<Vec<RawSeasonEntry>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSeasonEntry {
    pub season: Value,
    #[serde(default)]
    pub episodes: Option<Vec<Value>>,
}
