//! Reconciliation and the sequential run loop.
//!
//! Records are processed one identity at a time: decide, write, ledger
//! update, then the next record. The destination rate-limits, and duplicate
//! drafts racing the "does a page exist" check would create duplicates.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use p2n_core::{deep_link, marker_lookup_prefix, marker_text, RawTimestamp, ResolvedRecord};
use p2n_extract::{
    extract_from_dom, extract_from_json, is_useful, load_capture_file, resolve_capture_sequence,
    suppress_template_summaries, CaptureFile, ExtractStats,
};
use p2n_store::{
    ContentBlock, DestinationSchema, DestinationStore, MarkerQuery, PropertyKind, PropertyPayload,
    PropertyValue, StoreError, SyncLedger, BLOCK_CHUNK_LEN, MAX_BLOCKS_PER_PAGE,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "p2n-sync";

/// Pages with fewer existing blocks than this get content appended on
/// update; anything already fleshed out is left alone so repeated runs
/// never duplicate content a user may have edited.
pub const SPARSE_PAGE_BLOCKS: usize = 3;

/// Epoch values at or above this are treated as milliseconds.
const EPOCH_MILLIS_CUTOFF: i64 = 100_000_000_000;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub capture_file: PathBuf,
    pub ledger_path: PathBuf,
    pub base_url: String,
    pub marker_property: String,
    pub notion_token: String,
    pub notion_database_id: String,
    pub dry_run: bool,
}

impl SyncConfig {
    /// Reads configuration from the environment. Missing destination
    /// credentials are fatal unless this is a dry run; nothing is partially
    /// synced after a startup failure.
    pub fn from_env(dry_run: bool) -> Result<Self> {
        let notion_token = std::env::var("NOTION_TOKEN").unwrap_or_default();
        let notion_database_id = std::env::var("NOTION_DATABASE_ID").unwrap_or_default();
        if !dry_run {
            if notion_token.is_empty() {
                bail!("NOTION_TOKEN is required");
            }
            if notion_database_id.is_empty() {
                bail!("NOTION_DATABASE_ID is required");
            }
        }
        Ok(Self {
            capture_file: std::env::var("P2N_CAPTURE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("captures/latest.json")),
            ledger_path: std::env::var("P2N_LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".p2n/synced.json")),
            base_url: std::env::var("PLAUD_BASE_URL")
                .unwrap_or_else(|_| "https://web.plaud.ai".to_string()),
            marker_property: std::env::var("P2N_MARKER_PROPERTY")
                .unwrap_or_else(|_| "Source".to_string()),
            notion_token,
            notion_database_id,
            dry_run,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Write,
    SkipEmpty,
    SkipLowSignal,
    SkipAlreadySynced,
}

/// The write gate. Ledgered records are revisited only while they stay
/// useful; unledgered low-signal records are left out of the ledger so the
/// next run retries them once the source finishes processing.
pub fn decide(record: &ResolvedRecord, ledger: &SyncLedger, useful: bool) -> Decision {
    if record.is_empty_shell() {
        return Decision::SkipEmpty;
    }
    if ledger.contains(&record.identity) {
        if useful {
            Decision::Write
        } else {
            Decision::SkipAlreadySynced
        }
    } else if useful {
        Decision::Write
    } else {
        Decision::SkipLowSignal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub payloads: usize,
    pub drafts: usize,
    pub created: usize,
    pub updated: usize,
    pub low_signal_skipped: usize,
    pub already_synced_skipped: usize,
    pub empty_skipped: usize,
    pub identity_less_skipped: usize,
    pub template_summaries_cleared: usize,
    pub write_failures: usize,
}

/// Builds the store-native property set for one record, filtered to the
/// names the destination schema actually has. An unknown or renamed schema
/// must never cause a partial-write error.
pub fn build_properties(
    record: &ResolvedRecord,
    schema: &DestinationSchema,
    marker_property: &str,
    base_url: &str,
) -> PropertyPayload {
    let mut properties = PropertyPayload::new();

    if let Some((name, _)) = schema.iter().find(|(_, kind)| **kind == PropertyKind::Title) {
        properties.insert(name.clone(), PropertyValue::Title(record.title.clone()));
    }

    if let Some(PropertyKind::Date) = schema.get("Created") {
        if let Some(parsed) = record.created_at.as_ref().and_then(parse_timestamp) {
            properties.insert("Created".into(), PropertyValue::Date(parsed));
        }
    }

    match schema.get(marker_property) {
        Some(PropertyKind::Url) => {
            properties.insert(
                marker_property.to_string(),
                PropertyValue::Url(deep_link(base_url, &record.identity)),
            );
        }
        Some(_) => {
            properties.insert(
                marker_property.to_string(),
                PropertyValue::RichText(marker_text(&record.identity, base_url)),
            );
        }
        None => {}
    }

    if schema.contains_key("Summary") && !record.summary.trim().is_empty() {
        let mut summary = record.summary.clone();
        if summary.chars().count() > BLOCK_CHUNK_LEN {
            summary = summary.chars().take(BLOCK_CHUNK_LEN).collect();
        }
        properties.insert("Summary".into(), PropertyValue::RichText(summary));
    }

    properties
}

/// Parses the opaque upstream timestamp. Unparseable values simply drop the
/// date property rather than failing the record.
pub fn parse_timestamp(raw: &RawTimestamp) -> Option<DateTime<Utc>> {
    match raw {
        RawTimestamp::Epoch(n) => {
            if n.abs() >= EPOCH_MILLIS_CUTOFF {
                Utc.timestamp_millis_opt(*n).single()
            } else {
                Utc.timestamp_opt(*n, 0).single()
            }
        }
        RawTimestamp::Text(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
            }
            None
        }
    }
}

/// Splits text into destination-sized chunks on char boundaries.
pub fn chunk_text(text: &str, chunk_len: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_len.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Content blocks for a page body: summary then transcript, each under a
/// heading, capped at the per-page block budget.
pub fn build_blocks(record: &ResolvedRecord) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    if !record.summary.trim().is_empty() {
        blocks.push(ContentBlock::Heading("Summary".into()));
        for chunk in chunk_text(record.summary.trim(), BLOCK_CHUNK_LEN) {
            blocks.push(ContentBlock::Paragraph(chunk));
        }
    }
    if !record.transcript.trim().is_empty() {
        blocks.push(ContentBlock::Heading("Transcript".into()));
        for chunk in chunk_text(record.transcript.trim(), BLOCK_CHUNK_LEN) {
            blocks.push(ContentBlock::Paragraph(chunk));
        }
    }
    blocks.truncate(MAX_BLOCKS_PER_PAGE);
    blocks
}

/// Create-or-update for one record: at most one page write plus one content
/// append. The caller owns the ledger update.
pub async fn apply_record(
    dest: &dyn DestinationStore,
    record: &ResolvedRecord,
    schema: &DestinationSchema,
    marker_property: &str,
    base_url: &str,
) -> Result<WriteOutcome, StoreError> {
    let marker_kind = schema
        .get(marker_property)
        .cloned()
        .unwrap_or(PropertyKind::RichText);
    // The lookup fragment must be terminated: a bare `plaud:abc` would
    // substring-match the marker stored for `plaud:abc123`.
    let fragment = match marker_kind {
        PropertyKind::Url => deep_link(base_url, &record.identity),
        _ => marker_lookup_prefix(&record.identity),
    };
    let query = MarkerQuery {
        property: marker_property.to_string(),
        kind: marker_kind,
        fragment,
    };

    let existing = match dest.find_by_marker(&query).await {
        Ok(found) => found,
        Err(err) if err.is_schema_mismatch() => {
            // Destination schemas vary per deployment; a lookup that cannot
            // run means "no existing page", not a dead run.
            warn!(identity = %record.identity, %err, "marker lookup failed open");
            None
        }
        Err(err) => return Err(err),
    };

    let properties = build_properties(record, schema, marker_property, base_url);
    let blocks = build_blocks(record);

    match existing {
        Some(page) => {
            dest.update_properties(&page, &properties).await?;
            let existing_blocks = dest.block_count(&page).await?;
            // A page already holding exactly the blocks we would write was
            // filled by an earlier run; appending again duplicates the body.
            let already_mirrored = existing_blocks != 0 && existing_blocks == blocks.len();
            if !blocks.is_empty() && existing_blocks < SPARSE_PAGE_BLOCKS && !already_mirrored {
                dest.append_blocks(&page, &blocks).await?;
            }
            Ok(WriteOutcome::Updated)
        }
        None => {
            dest.create_page(&properties, &blocks).await?;
            Ok(WriteOutcome::Created)
        }
    }
}

/// Resolves a capture file into records: per-payload extraction, then
/// cross-payload layering in capture order, so a detail fetch observed after
/// a list view overrides it field by field. DOM fallback is consulted only
/// when the JSON captures produced nothing usable.
pub fn resolve_captures(capture: &CaptureFile) -> (Vec<ResolvedRecord>, ExtractStats) {
    let mut batches = Vec::new();
    let mut stats = ExtractStats::default();

    for item in &capture.captures {
        let Some(body) = &item.body else { continue };
        let (found, item_stats) = extract_from_json(body);
        stats.absorb(item_stats);
        if !found.is_empty() {
            info!(url = %item.url, count = found.len(), "extracted drafts from capture");
            batches.push(found);
        }
    }

    if batches.is_empty() {
        if let Some(html) = &capture.dom_fallback {
            let (found, dom_stats) = extract_from_dom(html);
            info!(count = found.len(), "fell back to DOM extraction");
            stats.absorb(dom_stats);
            if !found.is_empty() {
                batches.push(found);
            }
        }
    }

    (resolve_capture_sequence(batches), stats)
}

/// One full mirror run against an already-constructed destination.
pub async fn run_once(config: &SyncConfig, dest: &dyn DestinationStore) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, capture = %config.capture_file.display(), "sync run starting");

    let mut ledger = SyncLedger::load(&config.ledger_path);
    info!(ledger_len = ledger.len(), "ledger loaded");

    let schema = dest
        .schema()
        .await
        .context("reading destination schema")?;
    let capture = load_capture_file(&config.capture_file)?;

    let (mut resolved, stats) = resolve_captures(&capture);
    let template_summaries_cleared = suppress_template_summaries(&mut resolved);
    if template_summaries_cleared > 0 {
        warn!(
            cleared = template_summaries_cleared,
            "cleared template summaries echoed across the batch"
        );
    }

    let mut summary = RunSummary {
        run_id,
        started_at,
        finished_at: started_at,
        payloads: capture.captures.len(),
        drafts: stats.drafts,
        created: 0,
        updated: 0,
        low_signal_skipped: 0,
        already_synced_skipped: 0,
        empty_skipped: 0,
        identity_less_skipped: stats.dropped_missing_identity,
        template_summaries_cleared,
        write_failures: 0,
    };

    for record in &resolved {
        let useful = is_useful(record);
        match decide(record, &ledger, useful) {
            Decision::SkipEmpty => {
                summary.empty_skipped += 1;
            }
            Decision::SkipLowSignal => {
                info!(identity = %record.identity, "low signal, retrying next run");
                summary.low_signal_skipped += 1;
            }
            Decision::SkipAlreadySynced => {
                summary.already_synced_skipped += 1;
            }
            Decision::Write => {
                match apply_record(dest, record, &schema, &config.marker_property, &config.base_url)
                    .await
                {
                    Ok(WriteOutcome::Created) => {
                        info!(identity = %record.identity, "created destination page");
                        summary.created += 1;
                        record_written(&mut ledger, record, config)?;
                    }
                    Ok(WriteOutcome::Updated) => {
                        info!(identity = %record.identity, "updated destination page");
                        summary.updated += 1;
                        record_written(&mut ledger, record, config)?;
                    }
                    Err(err) => {
                        // One failed write never aborts the batch; the
                        // identity stays out of the ledger for a retry.
                        warn!(identity = %record.identity, %err, "write failed");
                        summary.write_failures += 1;
                    }
                }
            }
        }
    }

    if !config.dry_run {
        ledger
            .save(&config.ledger_path)
            .context("saving sync ledger")?;
    }

    summary.finished_at = Utc::now();
    info!(
        %run_id,
        created = summary.created,
        updated = summary.updated,
        low_signal = summary.low_signal_skipped,
        identity_less = summary.identity_less_skipped,
        failures = summary.write_failures,
        "sync run finished"
    );
    Ok(summary)
}

/// Ledger policy: persist after every successful write so a mid-run crash
/// loses nothing already flushed. Dry runs never touch the ledger file.
fn record_written(
    ledger: &mut SyncLedger,
    record: &ResolvedRecord,
    config: &SyncConfig,
) -> Result<()> {
    ledger.insert(record.identity.clone());
    if !config.dry_run {
        ledger
            .save(&config.ledger_path)
            .context("saving sync ledger after write")?;
    }
    Ok(())
}
