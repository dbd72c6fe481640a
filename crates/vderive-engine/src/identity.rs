//! Mapping of an arbitrary file id to its source, rendition and format.

use tracing::debug;
use vderive_catalog::ArtifactStore;
use vderive_models::{FileId, FormatId, VideoFormat};

use crate::error::{EngineError, EngineResult};

/// Optional format selector supplied with a file id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatHint {
    Id(FormatId),
    Name(String),
}

/// What a file id refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct FileIdentity {
    /// The original upload
    pub source_file_id: FileId,
    /// The rendition file for the selected format, if recorded
    pub derived_file_id: Option<FileId>,
    /// Selected format; `None` selects the source rendition
    pub format: Option<VideoFormat>,
}

impl FileIdentity {
    pub fn format_id(&self) -> Option<&FormatId> {
        self.format.as_ref().map(|f| &f.id)
    }

    pub fn format_name(&self) -> Option<&str> {
        self.format.as_ref().map(|f| f.name.as_str())
    }
}

#[derive(Clone)]
pub struct FileIdentityResolver {
    store: ArtifactStore,
}

impl FileIdentityResolver {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    /// Resolve `file_id` to its identity.
    ///
    /// Returns `None` for a frame image. A rendition file resolves to its
    /// own source and format, ignoring `hint`. Anything else is treated as a
    /// source, with the format selected by `hint`.
    pub async fn resolve(
        &self,
        file_id: &FileId,
        hint: Option<&FormatHint>,
    ) -> EngineResult<Option<FileIdentity>> {
        let repo = self.store.repository();

        if repo.find_frame_by_file(file_id).await?.is_some() {
            debug!(file_id = %file_id, "File is a frame image");
            return Ok(None);
        }

        if let Some(artifact) = repo.find_artifact_by_file(file_id).await? {
            if let Some(format_id) = artifact.format_id.as_ref() {
                let format = self.store.find_format_by_id(format_id).await?;
                debug!(file_id = %file_id, source = %artifact.source_file_id, format = %format.name, "File is a rendition");
                return Ok(Some(FileIdentity {
                    source_file_id: artifact.source_file_id.clone(),
                    derived_file_id: Some(file_id.clone()),
                    format: Some(format),
                }));
            }
        }

        // Anything else must be a stored file.
        self.store.files().load(file_id).await?;

        let format = match hint {
            None => None,
            Some(FormatHint::Id(id)) => Some(self.store.find_format_by_id(id).await?),
            Some(FormatHint::Name(name)) => Some(self.store.find_format(name).await?),
        };

        // The source is only a rendition once analysis has recorded it.
        let derived_file_id = self
            .store
            .find_artifact(file_id, format.as_ref().map(|f| &f.id))
            .await?
            .and_then(|a| a.file_id);

        Ok(Some(FileIdentity {
            source_file_id: file_id.clone(),
            derived_file_id,
            format,
        }))
    }

    /// Resolve, treating a frame image as not found.
    pub async fn require(
        &self,
        file_id: &FileId,
        hint: Option<&FormatHint>,
    ) -> EngineResult<FileIdentity> {
        self.resolve(file_id, hint).await?.ok_or_else(|| {
            EngineError::not_found(format!("File {} is a frame image, not a video", file_id))
        })
    }
}
