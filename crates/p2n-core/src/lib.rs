//! Core domain model for the Plaud-to-Notion mirror.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "p2n-core";

/// Prefix embedded in destination dedup markers, e.g. `plaud:abc123`.
pub const SOURCE_PREFIX: &str = "plaud";

/// Title used when the source never surfaced one.
pub const UNTITLED: &str = "Untitled recording";

/// Ordered id-like keys. The first key present with a non-empty value wins;
/// an element carrying none of these is dropped at the extraction boundary.
pub const ID_KEYS: &[&str] = &[
    "id",
    "recordingId",
    "recording_id",
    "uuid",
    "fileId",
    "file_id",
    "sessionId",
    "session_id",
];

pub const TITLE_KEYS: &[&str] = &["title", "name", "fileName", "file_name", "subject", "topic"];

pub const SUMMARY_KEYS: &[&str] = &[
    "summary",
    "aiSummary",
    "ai_summary",
    "abstract",
    "overview",
    "description",
];

pub const TRANSCRIPT_KEYS: &[&str] = &[
    "transcript",
    "transcription",
    "content",
    "text",
    "asrText",
    "asr_text",
];

pub const CREATED_KEYS: &[&str] = &[
    "createdAt",
    "created_at",
    "createTime",
    "create_time",
    "startTime",
    "start_time",
    "timestamp",
    "date",
];

pub const URL_KEYS: &[&str] = &["url", "shareUrl", "share_url", "link", "webUrl", "web_url"];

/// Text-bearing sub-keys inspected when a candidate value is an object.
/// One level deep only; deeper structures are never flattened.
pub const TEXT_SUBKEYS: &[&str] = &["text", "content", "value", "plain", "summary"];

/// Known nesting paths checked for candidate record lists, in addition to
/// every array-valued top-level key of the payload.
pub const LIST_PATHS: &[&[&str]] = &[
    &["data", "recordings"],
    &["data", "list"],
    &["data", "items"],
    &["result", "recordings"],
    &["result", "list"],
    &["result", "items"],
    &["payload", "records"],
];

/// Timestamp as observed upstream. Not validated until the reconciler needs
/// to encode it as a destination date property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(i64),
    Text(String),
}

/// One extraction attempt from one raw payload. Transient, owned by a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DraftRecord {
    pub identity: String,
    pub title: String,
    pub created_at: Option<RawTimestamp>,
    pub summary: String,
    pub transcript: String,
    pub source_url: String,
}

impl DraftRecord {
    pub fn has_identity(&self) -> bool {
        !self.identity.trim().is_empty()
    }

    /// Combined content length used for richness-weighted coalescing.
    pub fn richness(&self) -> usize {
        self.title.len() + self.summary.len() + self.transcript.len()
    }
}

/// The merged, canonical view of all drafts sharing one identity. The
/// identity is immutable once resolved and is the sole dedup/ledger key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRecord {
    pub identity: String,
    pub title: String,
    pub created_at: Option<RawTimestamp>,
    pub summary: String,
    pub transcript: String,
    pub source_url: String,
}

impl From<DraftRecord> for ResolvedRecord {
    fn from(draft: DraftRecord) -> Self {
        let title = if draft.title.trim().is_empty() {
            UNTITLED.to_string()
        } else {
            draft.title
        };
        Self {
            identity: draft.identity,
            title,
            created_at: draft.created_at,
            summary: draft.summary,
            transcript: draft.transcript,
            source_url: draft.source_url,
        }
    }
}

impl ResolvedRecord {
    pub fn richness(&self) -> usize {
        self.title.len() + self.summary.len() + self.transcript.len()
    }

    /// True when nothing worth writing survived extraction: placeholder
    /// title, no timestamp, no link, no content.
    pub fn is_empty_shell(&self) -> bool {
        (self.title == UNTITLED || self.title.trim().is_empty())
            && self.created_at.is_none()
            && self.source_url.trim().is_empty()
            && self.summary.trim().is_empty()
            && self.transcript.trim().is_empty()
    }
}

/// Canonical browsing URL for a recording identity.
pub fn deep_link(base_url: &str, identity: &str) -> String {
    format!(
        "{}/recordings/{}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(identity)
    )
}

/// Marker fragment queried against the destination, e.g. `plaud:abc123`.
pub fn marker_fragment(identity: &str) -> String {
    format!("{SOURCE_PREFIX}:{identity}")
}

/// Terminated marker prefix for substring lookups. The trailing separator
/// keeps `plaud:abc` from matching the marker stored for `plaud:abc123`.
pub fn marker_lookup_prefix(identity: &str) -> String {
    format!("{} |", marker_fragment(identity))
}

/// Full dedup marker stored in a rich-text destination property.
pub fn marker_text(identity: &str, base_url: &str) -> String {
    format!(
        "{} | {}",
        marker_fragment(identity),
        deep_link(base_url, identity)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_link_percent_encodes_identity() {
        let url = deep_link("https://web.plaud.ai/", "rec 01/a");
        assert_eq!(url, "https://web.plaud.ai/recordings/rec%2001%2Fa");
    }

    #[test]
    fn marker_embeds_prefix_and_link() {
        let marker = marker_text("abc123", "https://web.plaud.ai");
        assert_eq!(marker, "plaud:abc123 | https://web.plaud.ai/recordings/abc123");
        assert!(marker.starts_with(&marker_fragment("abc123")));
    }

    #[test]
    fn lookup_prefix_distinguishes_prefix_identities() {
        let long = marker_text("abc123", "https://web.plaud.ai");
        assert!(!long.contains(&marker_lookup_prefix("abc")));
        assert!(long.contains(&marker_lookup_prefix("abc123")));
    }

    #[test]
    fn resolved_from_draft_defaults_title() {
        let draft = DraftRecord {
            identity: "r1".into(),
            title: "   ".into(),
            ..Default::default()
        };
        let resolved = ResolvedRecord::from(draft);
        assert_eq!(resolved.title, UNTITLED);
        assert!(resolved.is_empty_shell());
    }

    #[test]
    fn richness_counts_all_content_fields() {
        let draft = DraftRecord {
            identity: "r1".into(),
            title: "abc".into(),
            summary: "defg".into(),
            transcript: "hij".into(),
            ..Default::default()
        };
        assert_eq!(draft.richness(), 10);
    }
}
