//! Record extraction, usefulness classification, and merging.
//!
//! The upstream capture service has no stable schema, so extraction works
//! from ordered candidate-key tables (see `p2n-core`) instead of probing
//! arbitrary object graphs. Malformed input yields zero drafts, never an
//! error.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use p2n_core::{
    DraftRecord, RawTimestamp, ResolvedRecord, CREATED_KEYS, ID_KEYS, LIST_PATHS, SUMMARY_KEYS,
    TEXT_SUBKEYS, TITLE_KEYS, TRANSCRIPT_KEYS, URL_KEYS,
};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "p2n-extract";

/// A summary shorter than this can never make a record useful on its own.
pub const MIN_SUMMARY_LEN: usize = 30;

/// A transcript at least this long makes a record useful regardless of its
/// summary.
pub const MIN_TRANSCRIPT_LEN: usize = 120;

/// Identical non-empty summaries on this many records in one batch are
/// treated as an echoed template and cleared everywhere.
pub const TEMPLATE_SUMMARY_THRESHOLD: usize = 3;

/// Lowercase substrings that mark a summary as placeholder/boilerplate.
/// The source emits these while AI processing is still in flight.
pub const NOISE_MARKERS: &[&str] = &[
    "processing",
    "transcribing",
    "generating summary",
    "summary will appear",
    "no summary",
    "summary not available",
    "upgrade to",
    "start recording",
    "tap to view",
    "lorem ipsum",
];

/// Card selectors tried in order for the DOM fallback. The first selector
/// that matches anything wins.
const CARD_SELECTORS: &[&str] = &[
    ".recording-card",
    ".note-card",
    "[data-recording-id]",
    "article",
];

const CARD_TITLE_SELECTORS: &[&str] = &["h1", "h2", "h3", ".title", ".name"];
const CARD_SUMMARY_SELECTORS: &[&str] = &[".summary", ".abstract", "p"];
const CARD_ID_ATTRS: &[&str] = &["data-recording-id", "data-id", "id"];

/// Length the DOM text blob is truncated to when no title node matches.
const BLOB_TITLE_LEN: usize = 80;

/// One observed navigation payload from the harvester. `body` is `None`
/// when the response was not JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub url: String,
    #[serde(default)]
    pub body: Option<JsonValue>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

/// On-disk handoff format from the browser harvester: the JSON payloads
/// observed during navigation plus an optional DOM snapshot consulted only
/// when no capture produced a usable draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureFile {
    pub captures: Vec<Capture>,
    #[serde(default)]
    pub dom_fallback: Option<String>,
}

pub fn load_capture_file(path: impl AsRef<Path>) -> Result<CaptureFile> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Per-payload extraction counters surfaced in the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub drafts: usize,
    pub dropped_missing_identity: usize,
}

impl ExtractStats {
    pub fn absorb(&mut self, other: ExtractStats) {
        self.drafts += other.drafts;
        self.dropped_missing_identity += other.dropped_missing_identity;
    }
}

/// Extracts drafts from one raw JSON payload of unknown shape.
///
/// Candidate lists are every array-valued top-level key plus the fixed
/// nesting paths in [`p2n_core::LIST_PATHS`]. Elements without an id-like
/// field are dropped and counted, never defaulted.
pub fn extract_from_json(value: &JsonValue) -> (Vec<DraftRecord>, ExtractStats) {
    let mut drafts = Vec::new();
    let mut stats = ExtractStats::default();

    for list in candidate_lists(value) {
        for element in list {
            let Some(obj) = element.as_object() else {
                continue;
            };
            match draft_from_object(obj) {
                Some(draft) => {
                    stats.drafts += 1;
                    drafts.push(draft);
                }
                None => stats.dropped_missing_identity += 1,
            }
        }
    }

    (drafts, stats)
}

fn candidate_lists(value: &JsonValue) -> Vec<&Vec<JsonValue>> {
    let mut lists: Vec<&Vec<JsonValue>> = Vec::new();

    if let Some(arr) = value.as_array() {
        lists.push(arr);
        return lists;
    }

    let Some(obj) = value.as_object() else {
        return lists;
    };

    for (_key, v) in obj {
        if let Some(arr) = v.as_array() {
            lists.push(arr);
        }
    }

    for path in LIST_PATHS {
        let mut cur = value;
        let mut found = true;
        for segment in *path {
            match cur.get(*segment) {
                Some(next) => cur = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(arr) = cur.as_array() {
                lists.push(arr);
            }
        }
    }

    lists
}

fn draft_from_object(obj: &Map<String, JsonValue>) -> Option<DraftRecord> {
    let identity = first_identity(obj)?;
    Some(DraftRecord {
        identity,
        title: first_text(obj, TITLE_KEYS).unwrap_or_default(),
        created_at: first_timestamp(obj),
        summary: first_text(obj, SUMMARY_KEYS).unwrap_or_default(),
        transcript: first_text(obj, TRANSCRIPT_KEYS).unwrap_or_default(),
        source_url: first_plain_string(obj, URL_KEYS).unwrap_or_default(),
    })
}

fn first_identity(obj: &Map<String, JsonValue>) -> Option<String> {
    for key in ID_KEYS {
        match obj.get(*key) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => {
                return Some(s.trim().to_string());
            }
            Some(JsonValue::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn first_timestamp(obj: &Map<String, JsonValue>) -> Option<RawTimestamp> {
    for key in CREATED_KEYS {
        match obj.get(*key) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => {
                return Some(RawTimestamp::Text(s.trim().to_string()));
            }
            Some(JsonValue::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Some(RawTimestamp::Epoch(i));
                }
                if let Some(f) = n.as_f64() {
                    return Some(RawTimestamp::Epoch(f as i64));
                }
            }
            _ => {}
        }
    }
    None
}

fn first_plain_string(obj: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(JsonValue::String(s)) = obj.get(*key) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// First-non-empty-string-wins over an ordered key table. Object values are
/// inspected one level deep through the text-bearing sub-key allow-list;
/// arrays of strings are joined with newlines; anything else is skipped.
fn first_text(obj: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(text) = obj.get(*key).and_then(text_value) {
            return Some(text);
        }
    }
    None
}

fn text_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Array(items) => {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        JsonValue::Object(inner) => {
            // One level only. Recursing further risks pulling UI/template
            // metadata into content fields.
            for sub in TEXT_SUBKEYS {
                if let Some(JsonValue::String(s)) = inner.get(*sub) {
                    let trimmed = s.trim();
                    if !trimmed.is_empty() {
                        return Some(trimmed.to_string());
                    }
                }
            }
            None
        }
        _ => None,
    }
}

/// DOM fallback: extracts drafts from a scraped HTML fragment when no JSON
/// capture produced anything usable. Identity falls back to the title text,
/// which may collide; downstream coalescing owns that case.
pub fn extract_from_dom(html: &str) -> (Vec<DraftRecord>, ExtractStats) {
    let document = Html::parse_fragment(html);
    let mut drafts = Vec::new();
    let mut stats = ExtractStats::default();

    for selector_text in CARD_SELECTORS {
        let Ok(selector) = Selector::parse(selector_text) else {
            continue;
        };
        let cards: Vec<ElementRef> = document.select(&selector).collect();
        if cards.is_empty() {
            continue;
        }
        for card in cards {
            match draft_from_card(&card) {
                Some(draft) => {
                    stats.drafts += 1;
                    drafts.push(draft);
                }
                None => stats.dropped_missing_identity += 1,
            }
        }
        break;
    }

    (drafts, stats)
}

fn draft_from_card(card: &ElementRef) -> Option<DraftRecord> {
    let blob = collapse_whitespace(&card.text().collect::<String>());

    let title = select_card_text(card, CARD_TITLE_SELECTORS)
        .unwrap_or_else(|| truncate_chars(&blob, BLOB_TITLE_LEN));
    let summary = select_card_text(card, CARD_SUMMARY_SELECTORS).unwrap_or_default();

    let mut identity = String::new();
    for attr in CARD_ID_ATTRS {
        if let Some(v) = card.value().attr(attr) {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                identity = trimmed.to_string();
                break;
            }
        }
    }
    if identity.is_empty() {
        identity = title.trim().to_string();
    }
    if identity.is_empty() {
        return None;
    }

    Some(DraftRecord {
        identity,
        title,
        created_at: None,
        summary,
        transcript: String::new(),
        source_url: String::new(),
    })
}

fn select_card_text(card: &ElementRef, selectors: &[&str]) -> Option<String> {
    for selector_text in selectors {
        let Ok(selector) = Selector::parse(selector_text) else {
            continue;
        };
        if let Some(node) = card.select(&selector).next() {
            let text = collapse_whitespace(&node.text().collect::<String>());
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Merges two drafts for the same identity, preferring the enrichment's
/// non-empty values. `created_at` takes the enrichment's value if present.
pub fn merge(base: &DraftRecord, enrichment: &DraftRecord) -> DraftRecord {
    DraftRecord {
        identity: base.identity.clone(),
        title: prefer(&enrichment.title, &base.title),
        created_at: enrichment
            .created_at
            .clone()
            .or_else(|| base.created_at.clone()),
        summary: prefer(&enrichment.summary, &base.summary),
        transcript: prefer(&enrichment.transcript, &base.transcript),
        source_url: prefer(&enrichment.source_url, &base.source_url),
    }
}

fn prefer(enrichment: &str, base: &str) -> String {
    if enrichment.trim().is_empty() {
        base.to_string()
    } else {
        enrichment.to_string()
    }
}

/// Coalesces duplicate drafts within one payload, keyed by identity in
/// discovery order. Duplicates fold with richness weighting: the richer
/// side plays the enrichment role.
fn coalesce_drafts(drafts: Vec<DraftRecord>) -> Vec<DraftRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut by_identity: HashMap<String, DraftRecord> = HashMap::new();

    for draft in drafts {
        if !draft.has_identity() {
            continue;
        }
        match by_identity.remove(&draft.identity) {
            Some(acc) => {
                let folded = if draft.richness() > acc.richness() {
                    merge(&acc, &draft)
                } else {
                    merge(&draft, &acc)
                };
                by_identity.insert(folded.identity.clone(), folded);
            }
            None => {
                order.push(draft.identity.clone());
                by_identity.insert(draft.identity.clone(), draft);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_identity.remove(&id))
        .collect()
}

/// Folds a sequence of payload batches into resolved records, keyed by
/// identity in first-sighting order. Duplicates within one batch coalesce
/// richness-weighted; a later batch layers onto earlier state enrichment-
/// preferred, so an explicit detail fetch wins over a richer list row even
/// when the detail carries less text.
pub fn resolve_capture_sequence(batches: Vec<Vec<DraftRecord>>) -> Vec<ResolvedRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut by_identity: HashMap<String, DraftRecord> = HashMap::new();

    for batch in batches {
        for draft in coalesce_drafts(batch) {
            match by_identity.get_mut(&draft.identity) {
                Some(acc) => *acc = merge(acc, &draft),
                None => {
                    order.push(draft.identity.clone());
                    by_identity.insert(draft.identity.clone(), draft);
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_identity.remove(&id))
        .map(ResolvedRecord::from)
        .collect()
}

/// True when the summary reads as recognised placeholder boilerplate.
pub fn is_noise_summary(summary: &str) -> bool {
    let lower = summary.to_lowercase();
    NOISE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Usefulness gate: content rich enough to be worth writing downstream.
pub fn is_useful(record: &ResolvedRecord) -> bool {
    let summary = record.summary.trim();
    if summary.len() >= MIN_SUMMARY_LEN && !is_noise_summary(summary) {
        return true;
    }
    record.transcript.trim().len() >= MIN_TRANSCRIPT_LEN
}

/// Clears summaries echoed verbatim across three or more records in one
/// batch. Returns how many records were cleared.
pub fn suppress_template_summaries(records: &mut [ResolvedRecord]) -> usize {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for record in records.iter() {
        let summary = record.summary.trim();
        if !summary.is_empty() {
            *counts.entry(summary).or_default() += 1;
        }
    }

    let echoed: Vec<String> = counts
        .into_iter()
        .filter(|(_, n)| *n >= TEMPLATE_SUMMARY_THRESHOLD)
        .map(|(s, _)| s.to_string())
        .collect();

    let mut cleared = 0;
    for record in records.iter_mut() {
        if echoed.iter().any(|s| s == record.summary.trim()) {
            record.summary.clear();
            cleared += 1;
        }
    }
    cleared
}
