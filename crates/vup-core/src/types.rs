use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle state of a File node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Committed, at least one revision is live remotely
    Active,
    /// Draft discarded or upload abandoned
    Deleted,
    /// Deletion requested, remote cleanup pending
    Deleting,
    /// An upload attempt is queued or running
    Uploading,
    /// Blocked on remote storage quota, re-queued when budget frees up
    Waiting,
    /// Suspended by the user or after repeated non-fatal failures
    PausedUpload,
}

impl FileState {
    /// States an interrupted process must pick back up on restart.
    pub fn is_interrupted_upload(self) -> bool {
        matches!(self, FileState::Uploading)
    }

    pub fn is_committed(self) -> bool {
        matches!(self, FileState::Active)
    }
}

/// Upload progress of one Revision within one attempt.
///
/// Ordered: an attempt only ever moves forward through
/// `None → Created → Encrypted → Uploaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionUploadState {
    None,
    Created,
    Encrypted,
    Uploaded,
}

impl RevisionUploadState {
    /// The single state this one may advance to.
    pub fn successor(self) -> Option<Self> {
        match self {
            RevisionUploadState::None => Some(RevisionUploadState::Created),
            RevisionUploadState::Created => Some(RevisionUploadState::Encrypted),
            RevisionUploadState::Encrypted => Some(RevisionUploadState::Uploaded),
            RevisionUploadState::Uploaded => None,
        }
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        self.successor() == Some(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    #[default]
    Regular,
    Photo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailKind {
    Default,
    /// Larger secondary preview produced for photos
    Photo,
}

/// Key packets attached to a File at draft time (all base64).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeKeyPacket {
    /// Node key sealed under the node passphrase
    pub locked_node_key: String,
    /// Node passphrase wrapped by the keyring storage key
    pub wrapped_passphrase: String,
    /// Content key wrapped by the node key
    pub content_key_packet: String,
}

/// Optional capture metadata carried into the extended attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub capture_time: Option<String>,
    pub device: Option<String>,
    pub orientation: Option<i32>,
    /// Subject area as (top, left, bottom, right)
    pub subject_area: Option<(i32, i32, i32, i32)>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<f64>,
}

/// A remote in-progress revision, as handed out by the transfer layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionSession {
    pub session_id: String,
    pub file_id: String,
    pub remote_revision_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Server id once committed, otherwise the upload id as a string
    pub id: String,
    pub upload_id: Option<Uuid>,
    pub state: FileState,
    #[serde(default)]
    pub kind: FileKind,
    pub name: String,
    /// Local file the upload was queued from
    pub source_path: Option<PathBuf>,
    pub size: u64,
    pub keys: Option<NodeKeyPacket>,
    pub signature_email: Option<String>,
    pub active_revision_draft: Option<String>,
    pub active_revision: Option<String>,
    #[serde(default)]
    pub revisions: Vec<String>,
    /// Unix millis at queue time, orders waiting files FIFO
    pub queued_at: u64,
    /// Human-readable category of the last terminal failure
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub id: String,
    pub file_id: String,
    pub upload_state: RevisionUploadState,
    /// Cleartext size in bytes
    pub size: u64,
    /// Sum of ciphertext block sizes once encrypted
    #[serde(default)]
    pub encrypted_size: u64,
    /// Local cleartext the draft was prepared from; cleared once encrypted
    pub cleartext_path: Option<PathBuf>,
    /// Unix seconds of the cleartext's last modification
    pub modification_time: Option<u64>,
    pub xattrs: Option<String>,
    pub signature_address: Option<String>,
    pub manifest_signature: Option<String>,
    #[serde(default)]
    pub blocks: Vec<BlockRecord>,
    #[serde(default)]
    pub thumbnails: Vec<ThumbnailRecord>,
    pub session: Option<RevisionSession>,
    pub media: Option<MediaMetadata>,
}

impl RevisionRecord {
    pub fn uploaded_blocks(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks.iter().filter(|b| b.uploaded)
    }

    /// Reset every uploaded flag, returning the revision to `Encrypted`.
    pub fn unset_uploaded(&mut self) {
        self.upload_state = RevisionUploadState::Encrypted;
        for block in &mut self.blocks {
            block.uploaded = false;
            block.upload_token = None;
        }
        for thumb in &mut self.thumbnails {
            thumb.uploaded = false;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// 1-based, matching remote numbering
    pub index: u32,
    /// BLAKE3 of the ciphertext (hex)
    pub hash: String,
    /// Ciphertext size in bytes
    pub size: u64,
    pub clear_size: u64,
    /// Detached signature over the cleartext, sealed with the node key (base64)
    pub signature: String,
    pub signature_email: String,
    pub local_path: PathBuf,
    #[serde(default)]
    pub uploaded: bool,
    pub upload_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailRecord {
    pub kind: ThumbnailKind,
    #[serde(with = "b64")]
    pub encrypted: Vec<u8>,
    /// BLAKE3 of `encrypted` (hex)
    pub hash: String,
    #[serde(default)]
    pub uploaded: bool,
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
