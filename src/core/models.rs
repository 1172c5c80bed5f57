use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::network::NetworkClass;
use super::state::TransferState;
use crate::store::ObjectTarget;

pub type TransferId = i64;

/// Maximum number of parts a multipart upload may be split into.
pub const MAXIMUM_UPLOAD_PARTS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferDirection {
    Upload,
    Download,
    /// Matches both directions in bulk queries.
    Any,
}

impl TransferDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "UPLOAD",
            Self::Download => "DOWNLOAD",
            Self::Any => "ANY",
        }
    }

    pub fn matches(self, other: TransferDirection) -> bool {
        self == Self::Any || other == Self::Any || self == other
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UPLOAD" => Ok(Self::Upload),
            "DOWNLOAD" => Ok(Self::Download),
            "ANY" => Ok(Self::Any),
            other => Err(format!("unknown transfer direction: {other}")),
        }
    }
}

/// Object headers and encryption parameters.
///
/// Carried through to the remote store untouched; the core never looks inside,
/// except for `checksum`, which the store verifies on upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canned_acl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_kms_key: Option<String>,
    /// Expected BLAKE3 hex digest of the whole object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_metadata: BTreeMap<String, String>,
}

/// One logical transfer, or one part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    /// Parent transfer for part records.
    pub main_transfer_id: Option<TransferId>,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub bucket: String,
    pub key: String,
    pub file: PathBuf,
    pub is_multipart: bool,
    pub is_last_part: bool,
    /// 1-based part number, 0 for anything that is not a part.
    pub part_number: u32,
    pub multipart_id: Option<String>,
    pub bytes_total: u64,
    pub bytes_current: u64,
    /// Object byte range this record covers. `range_end` is exclusive and
    /// `None` means "to the end of the object".
    pub range_start: u64,
    pub range_end: Option<u64>,
    /// Local file position where the current download run started writing.
    pub file_offset: u64,
    pub etag: Option<String>,
    pub network: NetworkClass,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub metadata: ObjectMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    fn new(
        direction: TransferDirection,
        bucket: impl Into<String>,
        key: impl Into<String>,
        file: impl Into<PathBuf>,
        network: NetworkClass,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            main_transfer_id: None,
            direction,
            state: TransferState::Waiting,
            bucket: bucket.into(),
            key: key.into(),
            file: file.into(),
            is_multipart: false,
            is_last_part: false,
            part_number: 0,
            multipart_id: None,
            bytes_total: 0,
            bytes_current: 0,
            range_start: 0,
            range_end: None,
            file_offset: 0,
            etag: None,
            network,
            retry_count: 0,
            last_error: None,
            metadata: ObjectMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A new upload of `bytes_total` bytes. The id is assigned on insert.
    pub fn upload(
        bucket: impl Into<String>,
        key: impl Into<String>,
        file: impl Into<PathBuf>,
        bytes_total: u64,
        network: NetworkClass,
    ) -> Self {
        let mut record = Self::new(TransferDirection::Upload, bucket, key, file, network);
        record.bytes_total = bytes_total;
        record.range_end = Some(bytes_total);
        record
    }

    /// A new download. `bytes_total` stays 0 until the store reports a size,
    /// unless an explicit range is given.
    pub fn download(
        bucket: impl Into<String>,
        key: impl Into<String>,
        file: impl Into<PathBuf>,
        range: Option<Range<u64>>,
        network: NetworkClass,
    ) -> Self {
        let mut record = Self::new(TransferDirection::Download, bucket, key, file, network);
        if let Some(range) = range {
            record.range_start = range.start;
            record.range_end = Some(range.end);
            record.bytes_total = range.end.saturating_sub(range.start);
        }
        record
    }

    /// Part record `part_number` covering `range` of this multipart upload.
    pub fn part(&self, part_number: u32, range: Range<u64>, is_last: bool) -> Self {
        let mut part = Self::new(
            self.direction,
            self.bucket.clone(),
            self.key.clone(),
            self.file.clone(),
            self.network,
        );
        part.main_transfer_id = Some(self.id);
        part.is_multipart = true;
        part.is_last_part = is_last;
        part.part_number = part_number;
        part.multipart_id = self.multipart_id.clone();
        part.bytes_total = range.end - range.start;
        part.range_start = range.start;
        part.range_end = Some(range.end);
        part
    }

    pub fn is_part(&self) -> bool {
        self.part_number > 0
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn target(&self) -> ObjectTarget {
        ObjectTarget::new(&self.bucket, &self.key)
    }
}

/// Partial update of a record. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub state: Option<TransferState>,
    pub bytes_current: Option<u64>,
    pub bytes_total: Option<u64>,
    pub file_offset: Option<u64>,
    pub multipart_id: Option<String>,
    pub etag: Option<String>,
    pub retry_count: Option<u32>,
    pub last_error: Option<String>,
}

impl RecordUpdate {
    pub fn state(state: TransferState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn progress(bytes_current: u64, bytes_total: u64) -> Self {
        Self {
            bytes_current: Some(bytes_current),
            bytes_total: Some(bytes_total),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, record: &mut TransferRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(bytes) = self.bytes_current {
            record.bytes_current = bytes;
        }
        if let Some(total) = self.bytes_total {
            record.bytes_total = total;
        }
        if let Some(offset) = self.file_offset {
            record.file_offset = offset;
        }
        if let Some(id) = &self.multipart_id {
            record.multipart_id = Some(id.clone());
        }
        if let Some(etag) = &self.etag {
            record.etag = Some(etag.clone());
        }
        if let Some(count) = self.retry_count {
            record.retry_count = count;
        }
        if let Some(error) = &self.last_error {
            record.last_error = Some(error.clone());
        }
        record.updated_at = Utc::now();
    }
}

/// Splits `total` bytes into contiguous part ranges.
///
/// The part size grows past `min_part_size` when needed to stay within
/// [`MAXIMUM_UPLOAD_PARTS`].
pub fn part_ranges(total: u64, min_part_size: u64) -> Vec<Range<u64>> {
    if total == 0 {
        return Vec::new();
    }
    let part_size = min_part_size
        .max(total.div_ceil(MAXIMUM_UPLOAD_PARTS))
        .max(1);

    let mut ranges = Vec::with_capacity(total.div_ceil(part_size) as usize);
    let mut start = 0;
    while start < total {
        let end = (start + part_size).min(total);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_ranges_cover_the_file() {
        let ranges = part_ranges(10_485_760, 5_242_880);
        assert_eq!(ranges, vec![0..5_242_880, 5_242_880..10_485_760]);

        let ranges = part_ranges(11, 4);
        assert_eq!(ranges, vec![0..4, 4..8, 8..11]);
    }

    #[test]
    fn part_ranges_respect_part_limit() {
        let total = 5 * 1024 * 1024 * 1024 * 1024u64;
        let ranges = part_ranges(total, 5 * 1024 * 1024);
        assert!(ranges.len() as u64 <= MAXIMUM_UPLOAD_PARTS);
        assert_eq!(ranges.last().map(|r| r.end), Some(total));
    }

    #[test]
    fn part_ranges_empty_file() {
        assert!(part_ranges(0, 1024).is_empty());
    }

    #[test]
    fn part_inherits_target() {
        let mut parent = TransferRecord::upload("bucket", "a/b.bin", "/tmp/b.bin", 10, NetworkClass::Any);
        parent.id = 7;
        parent.is_multipart = true;
        parent.multipart_id = Some("mp-1".into());

        let part = parent.part(2, 5..10, true);
        assert_eq!(part.main_transfer_id, Some(7));
        assert_eq!(part.part_number, 2);
        assert_eq!(part.bytes_total, 5);
        assert_eq!(part.range_start, 5);
        assert_eq!(part.range_end, Some(10));
        assert_eq!(part.multipart_id.as_deref(), Some("mp-1"));
        assert!(part.is_part() && part.is_last_part);
        assert!(!parent.is_part());
    }

    #[test]
    fn update_applies_only_set_fields() {
        let mut record = TransferRecord::download("b", "k", "/tmp/k", None, NetworkClass::Any);
        let update = RecordUpdate {
            bytes_current: Some(42),
            etag: Some("e".into()),
            ..Default::default()
        };
        update.apply_to(&mut record);
        assert_eq!(record.bytes_current, 42);
        assert_eq!(record.etag.as_deref(), Some("e"));
        assert_eq!(record.state, TransferState::Waiting);
        assert!(RecordUpdate::default().is_empty());
    }

    #[test]
    fn direction_matching() {
        assert!(TransferDirection::Any.matches(TransferDirection::Upload));
        assert!(TransferDirection::Download.matches(TransferDirection::Download));
        assert!(!TransferDirection::Upload.matches(TransferDirection::Download));
    }
}
