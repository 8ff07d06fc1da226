//! Thumbnail encryptor and its bitmap/codec collaborators.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::{debug, info};

use vup_chunks::{hash_bytes, hash_to_hex};
use vup_core::types::{FileKind, ThumbnailKind, ThumbnailRecord};
use vup_crypto::{EncryptionMetadata, SEAL_OVERHEAD};

use crate::control::checkpoint;
use crate::encrypt::{join_error, EncryptionJob, Encryptor};
use crate::error::UploadError;

/// Compression qualities tried in order until one fits the weight ceiling.
pub const QUALITY_LADDER: [f32; 6] = [1.0, 0.7, 0.4, 0.2, 0.1, 0.0];

/// Bytes the signature prefix adds to a sealed thumbnail.
const SIGNATURE_SIZE: usize = 64;

/// A rendered RGBA preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Renders a preview of a local file, at most `max_dimension` on its longer side.
pub trait ThumbnailSource: Send + Sync {
    fn bitmap(&self, path: &Path, max_dimension: u32) -> anyhow::Result<Option<Bitmap>>;
}

/// Compresses a bitmap; lower quality must never yield more bytes.
pub trait ThumbnailCodec: Send + Sync {
    fn compress(&self, bitmap: &Bitmap, quality: f32) -> anyhow::Result<Vec<u8>>;
}

/// Produces no previews.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoThumbnailSource;

impl ThumbnailSource for NoThumbnailSource {
    fn bitmap(&self, _path: &Path, _max_dimension: u32) -> anyhow::Result<Option<Bitmap>> {
        Ok(None)
    }
}

/// Subsamples by quality, then zstd-compresses.
///
/// Output: `[width u32 LE][height u32 LE][zstd(rgba)]`
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdThumbnailCodec;

impl ThumbnailCodec for ZstdThumbnailCodec {
    fn compress(&self, bitmap: &Bitmap, quality: f32) -> anyhow::Result<Vec<u8>> {
        let (w, h) = (bitmap.width as usize, bitmap.height as usize);
        if bitmap.rgba.len() != w * h * 4 {
            bail!(
                "bitmap is {} bytes, expected {}x{}x4",
                bitmap.rgba.len(),
                w,
                h
            );
        }
        let quality = quality.clamp(0.0, 1.0);
        let step = ((1.0 - quality) * 8.0) as usize + 1;
        let level = 3 + ((1.0 - quality) * 16.0) as i32;

        let mut pixels = Vec::with_capacity(bitmap.rgba.len() / (step * step) + 4);
        let (mut out_w, mut out_h) = (0u32, 0u32);
        for y in (0..h).step_by(step) {
            out_h += 1;
            out_w = 0;
            for x in (0..w).step_by(step) {
                out_w += 1;
                let at = (y * w + x) * 4;
                pixels.extend_from_slice(&bitmap.rgba[at..at + 4]);
            }
        }

        let compressed = zstd::encode_all(&pixels[..], level).context("compressing thumbnail")?;
        let mut out = Vec::with_capacity(8 + compressed.len());
        out.extend_from_slice(&out_w.to_le_bytes());
        out.extend_from_slice(&out_h.to_le_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }
}

pub struct ThumbnailEncryptor;

#[derive(Debug, Clone, Copy)]
struct Variant {
    kind: ThumbnailKind,
    max_dimension: u32,
    max_weight: usize,
}

#[async_trait]
impl Encryptor for ThumbnailEncryptor {
    fn name(&self) -> &'static str {
        "thumbnails"
    }

    async fn run(&self, job: Arc<EncryptionJob>) -> Result<(), UploadError> {
        let revision = job.revision()?;
        let Some(source) = revision.cleartext_path.clone() else {
            debug!(revision_id = %job.revision_id, "no cleartext, skipping thumbnails");
            return Ok(());
        };

        let cfg = &job.ctx.config;
        let mut variants = vec![Variant {
            kind: ThumbnailKind::Default,
            max_dimension: cfg.thumbnail_max_dimension,
            max_weight: cfg.thumbnail_max_weight,
        }];
        if job.file.kind == FileKind::Photo {
            variants.push(Variant {
                kind: ThumbnailKind::Photo,
                max_dimension: cfg.photo_thumbnail_max_dimension,
                max_weight: cfg.photo_thumbnail_max_weight,
            });
        }

        let thumbnails = {
            let job = job.clone();
            tokio::task::spawn_blocking(move || render_all(&job, &source, &variants))
                .await
                .map_err(|e| join_error("thumbnail", e))??
        };

        checkpoint(&job.cancel)?;
        let count = thumbnails.len();
        job.ctx.store.transaction(|tx| {
            tx.revision_mut(&job.revision_id)?.thumbnails = thumbnails;
            Ok::<_, UploadError>(())
        })?;
        info!(revision_id = %job.revision_id, thumbnails = count, "thumbnails encrypted");
        Ok(())
    }
}

fn render_all(
    job: &EncryptionJob,
    source: &Path,
    variants: &[Variant],
) -> Result<Vec<ThumbnailRecord>, UploadError> {
    let mut out = Vec::with_capacity(variants.len());
    for variant in variants {
        checkpoint(&job.cancel)?;
        let bitmap = job
            .ctx
            .thumbnails
            .bitmap(source, variant.max_dimension)
            .map_err(|e| UploadError::Validation(format!("rendering thumbnail: {e:#}")))?;
        let Some(bitmap) = bitmap else {
            debug!(revision_id = %job.revision_id, kind = ?variant.kind, "no preview available");
            continue;
        };
        let encrypted = fit_to_weight(
            &job.metadata,
            job.ctx.codec.as_ref(),
            &job.revision_id,
            &bitmap,
            variant.max_weight,
        )?;
        out.push(ThumbnailRecord {
            kind: variant.kind,
            hash: hash_to_hex(&hash_bytes(&encrypted)),
            encrypted,
            uploaded: false,
        });
    }
    Ok(out)
}

/// Walk the quality ladder until both the compressed and the sealed
/// thumbnail fit `max_weight`.
pub fn fit_to_weight(
    metadata: &EncryptionMetadata,
    codec: &dyn ThumbnailCodec,
    revision_id: &str,
    bitmap: &Bitmap,
    max_weight: usize,
) -> Result<Vec<u8>, UploadError> {
    let clear_ceiling = max_weight.saturating_sub(SEAL_OVERHEAD + SIGNATURE_SIZE);
    for quality in QUALITY_LADDER {
        let compressed = codec
            .compress(bitmap, quality)
            .map_err(|e| UploadError::Validation(format!("compressing thumbnail: {e:#}")))?;
        if compressed.len() > clear_ceiling {
            continue;
        }
        let sealed = metadata.encrypt_thumbnail(revision_id, &compressed)?;
        if sealed.len() <= max_weight {
            debug!(quality, bytes = sealed.len(), "thumbnail fits");
            return Ok(sealed);
        }
    }
    Err(UploadError::ThumbnailTooLarge { max_weight })
}
