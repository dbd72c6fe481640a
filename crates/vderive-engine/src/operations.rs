//! Caller-facing operations: lookups by arbitrary file id, derivation entry
//! points, deletions and format administration.

use serde::Serialize;
use tracing::info;
use vderive_catalog::CleanupScope;
use vderive_models::{
    resolve_frame_index, ArtifactKind, DerivationType, FileId, FrameRequest, NewVideoFormat,
    VideoFormat, VideoFrame, VideoMetadata,
};

use crate::engine::{not_transcoded, CleanupReport, DerivationEngine, DerivationOutcome};
use crate::error::{EngineError, EngineResult};
use crate::identity::{FileIdentity, FormatHint};

/// Metadata of one rendition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDataView {
    #[serde(flatten)]
    pub metadata: VideoMetadata,
    /// Names of the formats recorded for the source; only set when the
    /// source rendition was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_formats: Option<Vec<String>>,
}

fn name_hint(format_name: Option<&str>) -> Option<FormatHint> {
    format_name.map(|name| FormatHint::Name(name.to_string()))
}

impl DerivationEngine {
    async fn identify(&self, file_id: &FileId, format_name: Option<&str>) -> EngineResult<FileIdentity> {
        self.resolver.require(file_id, name_hint(format_name).as_ref()).await
    }

    /// The stored file to stream for `file_id` in the given format.
    pub async fn locate_rendition(
        &self,
        file_id: &FileId,
        format_name: Option<&str>,
    ) -> EngineResult<FileId> {
        let identity = self.identify(file_id, format_name).await?;
        identity
            .derived_file_id
            .clone()
            .ok_or_else(|| not_transcoded(identity.format_name()))
    }

    /// Probe metadata of a rendition.
    pub async fn video_data(
        &self,
        file_id: &FileId,
        format_name: Option<&str>,
    ) -> EngineResult<VideoDataView> {
        let identity = self.identify(file_id, format_name).await?;
        let artifact = self
            .store
            .find_artifact(&identity.source_file_id, identity.format_id())
            .await?
            .ok_or_else(|| not_transcoded(identity.format_name()))?;

        let available_formats = match identity.format {
            Some(_) => None,
            None => Some(
                self.formats_for_source(&identity.source_file_id)
                    .await?
                    .into_iter()
                    .map(|f| f.name)
                    .collect(),
            ),
        };

        Ok(VideoDataView {
            metadata: artifact.metadata,
            available_formats,
        })
    }

    /// Look up the extracted frame at a position.
    pub async fn frame(
        &self,
        file_id: &FileId,
        format_name: Option<&str>,
        request: &FrameRequest,
    ) -> EngineResult<VideoFrame> {
        let identity = self.identify(file_id, format_name).await?;
        let artifact = self
            .store
            .find_artifact(&identity.source_file_id, identity.format_id())
            .await?
            .ok_or_else(|| EngineError::not_found("Video data not found"))?;

        let index = resolve_frame_index(
            request,
            artifact.metadata.frame_count(),
            artifact.metadata.duration,
        )?;

        self.store
            .repository()
            .find_frame(&identity.source_file_id, identity.format_id(), index)
            .await?
            .ok_or_else(|| EngineError::not_found("Frame not found"))
    }

    /// Analyze the rendition `file_id` refers to.
    pub async fn analyze(&self, file_id: &FileId, force: bool) -> EngineResult<DerivationOutcome> {
        let identity = self.identify(file_id, None).await?;
        self.request_derivation(
            DerivationType::Analysis,
            &identity.source_file_id,
            identity.format.as_ref(),
            force,
        )
        .await
    }

    /// Transcode the source of `file_id` into the named format.
    pub async fn transcode(
        &self,
        file_id: &FileId,
        format_name: &str,
        force: bool,
    ) -> EngineResult<DerivationOutcome> {
        let identity = self.identify(file_id, None).await?;
        let format = self.store.find_format(format_name).await?;
        self.request_derivation(
            DerivationType::Transcoding,
            &identity.source_file_id,
            Some(&format),
            force,
        )
        .await
    }

    /// Extract frames from a rendition.
    pub async fn extract_frames(
        &self,
        file_id: &FileId,
        format_name: Option<&str>,
        force: bool,
    ) -> EngineResult<DerivationOutcome> {
        let identity = self.identify(file_id, format_name).await?;
        self.request_derivation(
            DerivationType::FrameExtraction,
            &identity.source_file_id,
            identity.format.as_ref(),
            force,
        )
        .await
    }

    /// Drop every derived result of the source, across all formats.
    pub async fn delete_analysis(&self, file_id: &FileId) -> EngineResult<CleanupReport> {
        let identity = self.identify(file_id, None).await?;
        self.cleanup(
            &CleanupScope::cascade(&identity.source_file_id),
            &DerivationType::ALL,
            &[ArtifactKind::File, ArtifactKind::Frame],
        )
        .await
    }

    /// Drop one format's rendition and its frames.
    pub async fn delete_transcoding(
        &self,
        file_id: &FileId,
        format_name: &str,
    ) -> EngineResult<CleanupReport> {
        let identity = self.identify(file_id, None).await?;
        let format = self.store.find_format(format_name).await?;
        self.cleanup(
            &CleanupScope::exact(&identity.source_file_id, Some(&format.id)),
            &[DerivationType::Transcoding, DerivationType::FrameExtraction],
            &[ArtifactKind::File, ArtifactKind::Frame],
        )
        .await
    }

    /// Drop the frames of one rendition.
    pub async fn delete_frames(
        &self,
        file_id: &FileId,
        format_name: Option<&str>,
    ) -> EngineResult<CleanupReport> {
        let identity = self.identify(file_id, format_name).await?;
        self.cleanup(
            &CleanupScope::exact(&identity.source_file_id, identity.format_id()),
            &[DerivationType::FrameExtraction],
            &[ArtifactKind::Frame],
        )
        .await
    }

    /// Forget everything derived from a source that was deleted.
    pub async fn forget_source(&self, source: &FileId) -> EngineResult<CleanupReport> {
        let report = self
            .cleanup(
                &CleanupScope::cascade(source),
                &DerivationType::ALL,
                &[ArtifactKind::Frame, ArtifactKind::File, ArtifactKind::Job],
            )
            .await?;
        info!(source = %source, canceled = report.canceled_jobs.len(), "Forgot source");
        Ok(report)
    }

    pub async fn create_format(&self, new: NewVideoFormat) -> EngineResult<VideoFormat> {
        Ok(self.store.create_format(new).await?)
    }

    pub async fn format_by_name(&self, name: &str) -> EngineResult<VideoFormat> {
        Ok(self.store.find_format(name).await?)
    }

    pub async fn list_formats(&self) -> EngineResult<Vec<VideoFormat>> {
        Ok(self.store.list_formats().await?)
    }

    /// Formats with a recorded rendition of `source`, sorted by name.
    pub async fn formats_for_source(&self, source: &FileId) -> EngineResult<Vec<VideoFormat>> {
        let artifacts = self
            .store
            .repository()
            .artifacts_in(&CleanupScope::cascade(source))
            .await?;

        let mut formats = Vec::new();
        for format_id in artifacts.iter().filter_map(|a| a.format_id.as_ref()) {
            if let Some(format) = self.store.repository().find_format(format_id).await? {
                formats.push(format);
            }
        }
        formats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(formats)
    }

    /// Delete a format and everything produced with it.
    pub async fn delete_format(&self, name: &str) -> EngineResult<CleanupReport> {
        let format = self.store.find_format(name).await?;
        let report = self
            .cleanup(
                &CleanupScope::format(&format.id),
                &DerivationType::ALL,
                &[
                    ArtifactKind::Frame,
                    ArtifactKind::File,
                    ArtifactKind::Job,
                    ArtifactKind::Format,
                ],
            )
            .await?;
        info!(format = %format.name, deleted = report.deleted_files.len(), "Deleted format");
        Ok(report)
    }
}
