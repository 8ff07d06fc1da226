//! Extended attributes: the signed, encrypted description of a revision.

use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::info;

use vup_chunks::{block_sizes, DigestAccumulator};
use vup_core::types::{MediaMetadata, RevisionRecord};

use crate::control::checkpoint;
use crate::encrypt::{EncryptionJob, Encryptor};
use crate::error::UploadError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtendedAttributes {
    pub common: CommonAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<Camera>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommonAttributes {
    /// RFC 3339, UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_time: Option<String>,
    pub size: u64,
    pub block_sizes: Vec<u64>,
    pub digests: Digests,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digests {
    #[serde(rename = "SHA1")]
    pub sha1: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Camera {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_coordinates: Option<SubjectCoordinates>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubjectCoordinates {
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Media {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl ExtendedAttributes {
    /// Build the payload for a revision. `block_sizes` comes from the
    /// chunker, never from the encrypted blocks.
    pub fn build(revision: &RevisionRecord, block_sizes: Vec<u64>, sha1: String) -> Self {
        let media = revision.media.as_ref();
        Self {
            common: CommonAttributes {
                modification_time: revision.modification_time.map(|secs| {
                    humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(secs))
                        .to_string()
                }),
                size: revision.size,
                block_sizes,
                digests: Digests { sha1 },
            },
            location: media.and_then(location),
            camera: media.and_then(camera),
            media: media.and_then(media_section),
        }
    }
}

fn location(m: &MediaMetadata) -> Option<Location> {
    Some(Location {
        latitude: m.latitude?,
        longitude: m.longitude?,
    })
}

fn camera(m: &MediaMetadata) -> Option<Camera> {
    let camera = Camera {
        capture_time: m.capture_time.clone(),
        device: m.device.clone(),
        orientation: m.orientation,
        subject_coordinates: m
            .subject_area
            .map(|(top, left, bottom, right)| SubjectCoordinates {
                top,
                left,
                bottom,
                right,
            }),
    };
    let empty = camera.capture_time.is_none()
        && camera.device.is_none()
        && camera.orientation.is_none()
        && camera.subject_coordinates.is_none();
    (!empty).then_some(camera)
}

fn media_section(m: &MediaMetadata) -> Option<Media> {
    if m.width.is_none() && m.height.is_none() && m.duration.is_none() {
        return None;
    }
    Some(Media {
        width: m.width,
        height: m.height,
        duration: m.duration,
    })
}

pub struct XAttrEncryptor;

#[async_trait]
impl Encryptor for XAttrEncryptor {
    fn name(&self) -> &'static str {
        "xattr"
    }

    async fn run(&self, job: Arc<EncryptionJob>) -> Result<(), UploadError> {
        checkpoint(&job.cancel)?;
        let revision = job.revision()?;
        let max_block = NonZeroU64::new(job.ctx.config.max_block_size)
            .ok_or_else(|| UploadError::Validation("max_block_size is 0".into()))?;

        let sha1 = match job.digest.get() {
            Some(digest) => digest.clone(),
            None if revision.size == 0 => DigestAccumulator::new().finalize_hex(),
            None => {
                return Err(UploadError::Validation(format!(
                    "revision {} has no content digest yet",
                    revision.id
                )))
            }
        };

        let attrs = ExtendedAttributes::build(&revision, block_sizes(revision.size, max_block), sha1);
        let payload = serde_json::to_vec(&attrs)
            .map_err(|e| UploadError::Validation(format!("serializing xattrs: {e}")))?;
        let sealed = job.metadata.encrypt_xattr(&job.revision_id, &payload)?;
        let signer = job.metadata.signer_email().to_string();

        checkpoint(&job.cancel)?;
        job.ctx.store.transaction(|tx| {
            let rev = tx.revision_mut(&job.revision_id)?;
            rev.xattrs = Some(STANDARD.encode(&sealed));
            rev.signature_address = Some(signer);
            Ok::<_, UploadError>(())
        })?;
        info!(revision_id = %job.revision_id, bytes = sealed.len(), "extended attributes encrypted");
        Ok(())
    }
}
