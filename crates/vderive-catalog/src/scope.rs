//! Selection of records affected by a cancel or purge.

use vderive_models::{FileId, FormatId};

/// Which records of the catalog a cleanup applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupScope {
    /// One source, exactly this format (`None` is the source rendition)
    Exact {
        source: FileId,
        format_id: Option<FormatId>,
    },
    /// One source, every format including the source rendition
    Cascade { source: FileId },
    /// Every source, one format
    Format { format_id: FormatId },
}

impl CleanupScope {
    pub fn exact(source: &FileId, format_id: Option<&FormatId>) -> Self {
        Self::Exact {
            source: source.clone(),
            format_id: format_id.cloned(),
        }
    }

    pub fn cascade(source: &FileId) -> Self {
        Self::Cascade {
            source: source.clone(),
        }
    }

    pub fn format(format_id: &FormatId) -> Self {
        Self::Format {
            format_id: format_id.clone(),
        }
    }

    /// Check whether a record keyed by `(source, format_id)` is in scope.
    pub fn matches(&self, source: &FileId, format_id: Option<&FormatId>) -> bool {
        match self {
            CleanupScope::Exact {
                source: s,
                format_id: f,
            } => s == source && f.as_ref() == format_id,
            CleanupScope::Cascade { source: s } => s == source,
            CleanupScope::Format { format_id: f } => Some(f) == format_id,
        }
    }
}
