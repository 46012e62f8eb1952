//! Bounded incremental collection of channel messages with periodic snapshots.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use arrow_array::{Array, ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tgh_adapters::{
    ConnectorSettings, SourceConnector, SourceIdentity, SourceKind, SourceSession,
};
use tgh_core::{format_reactions, sanitize_text, Record, RecordError, TimeWindow, WindowPosition};
use tgh_storage::{retry_with_backoff, BackoffPolicy, FetcherConfig, SnapshotStore};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use tgh_adapters::AdapterError;

pub const CRATE_NAME: &str = "tgh-collect";

/// Accepted records between two checkpoint snapshots.
pub const CHECKPOINT_INTERVAL: u64 = 1000;
pub const DEFAULT_MAX_COUNT: u64 = 1_000_000;
pub const DEFAULT_TIME_LIMIT_SECS: u64 = 21_600;
pub const DEFAULT_GROUP_FLOOR_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading job file {path}: {message}")]
    Read { path: String, message: String },
    #[error("parsing job file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("{key} must be a whole number, got `{value}`")]
    InvalidNumber { key: &'static str, value: String },
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("no channels to collect")]
    NoChannels,
    #[error("invalid {key} `{value}` (expected YYYY-MM-DD or RFC 3339)")]
    InvalidDate { key: &'static str, value: String },
    #[error("date_min {min} is after date_max {max}")]
    EmptyWindow { min: DateTime<Utc>, max: DateTime<Utc> },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("unknown output format `{0}` (expected parquet or csv)")]
    UnknownFormat(String),
    #[error("{0}")]
    UnknownSource(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Parquet,
    Csv,
}

impl OutputFormat {
    /// Lowercase and keep letters only, so `"Parquet "` and `".csv"` both resolve.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .to_lowercase()
            .chars()
            .filter(char::is_ascii_lowercase)
            .collect();
        match normalized.as_str() {
            "parquet" => Some(OutputFormat::Parquet),
            "csv" => Some(OutputFormat::Csv),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Parquet => "parquet",
            OutputFormat::Csv => "csv",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ConfigError::UnknownFormat(s.to_string()))
    }
}

/// Either `"@a, @b"` or a YAML list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ChannelList {
    Joined(String),
    Listed(Vec<String>),
}

impl ChannelList {
    pub fn into_channels(self) -> Vec<String> {
        let raw = match self {
            ChannelList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
            ChannelList::Listed(listed) => listed,
        };
        raw.into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

/// Partially specified job; layers merge field by field before validation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobSettings {
    pub job_name: Option<String>,
    pub channels: Option<ChannelList>,
    pub date_min: Option<String>,
    pub date_max: Option<String>,
    pub key_search: Option<String>,
    pub max_count: Option<u64>,
    pub time_limit_secs: Option<u64>,
    pub format: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub source: Option<String>,
    pub fixtures_dir: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub group_floor_secs: Option<u64>,
}

fn parse_number(key: &'static str, raw: Option<String>) -> Result<Option<u64>, ConfigError> {
    raw.map(|value| {
        value
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidNumber { key, value })
    })
    .transpose()
}

impl JobSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            job_name: lookup("TGH_JOB_NAME"),
            channels: lookup("TGH_CHANNELS").map(ChannelList::Joined),
            date_min: lookup("TGH_DATE_MIN"),
            date_max: lookup("TGH_DATE_MAX"),
            key_search: lookup("TGH_KEY_SEARCH"),
            max_count: parse_number("TGH_MAX_COUNT", lookup("TGH_MAX_COUNT"))?,
            time_limit_secs: parse_number("TGH_TIME_LIMIT_SECS", lookup("TGH_TIME_LIMIT_SECS"))?,
            format: lookup("TGH_FORMAT"),
            output_dir: lookup("TGH_OUTPUT_DIR").map(PathBuf::from),
            source: lookup("TGH_SOURCE"),
            fixtures_dir: lookup("TGH_FIXTURES_DIR").map(PathBuf::from),
            user_agent: lookup("TGH_USER_AGENT"),
            group_floor_secs: parse_number("TGH_GROUP_FLOOR_SECS", lookup("TGH_GROUP_FLOOR_SECS"))?,
        })
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&text).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    /// Fields set in `over` win.
    pub fn merge(self, over: JobSettings) -> JobSettings {
        JobSettings {
            job_name: over.job_name.or(self.job_name),
            channels: over.channels.or(self.channels),
            date_min: over.date_min.or(self.date_min),
            date_max: over.date_max.or(self.date_max),
            key_search: over.key_search.or(self.key_search),
            max_count: over.max_count.or(self.max_count),
            time_limit_secs: over.time_limit_secs.or(self.time_limit_secs),
            format: over.format.or(self.format),
            output_dir: over.output_dir.or(self.output_dir),
            source: over.source.or(self.source),
            fixtures_dir: over.fixtures_dir.or(self.fixtures_dir),
            user_agent: over.user_agent.or(self.user_agent),
            group_floor_secs: over.group_floor_secs.or(self.group_floor_secs),
        }
    }

    pub fn resolve(self) -> Result<CollectorConfig, ConfigError> {
        let job_name = self
            .job_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or(ConfigError::Missing("job_name"))?;

        let channels = self
            .channels
            .map(ChannelList::into_channels)
            .unwrap_or_default();
        if channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }

        let date_min = parse_bound("date_min", self.date_min)?;
        let date_max = parse_bound("date_max", self.date_max)?;
        let window = TimeWindow::new(date_min, date_max).ok_or(ConfigError::EmptyWindow {
            min: date_min,
            max: date_max,
        })?;

        let max_count = self.max_count.unwrap_or(DEFAULT_MAX_COUNT);
        if max_count == 0 {
            return Err(ConfigError::Zero("max_count"));
        }
        let time_limit_secs = self.time_limit_secs.unwrap_or(DEFAULT_TIME_LIMIT_SECS);
        if time_limit_secs == 0 {
            return Err(ConfigError::Zero("time_limit_secs"));
        }

        let format = match self.format {
            None => OutputFormat::Parquet,
            Some(raw) => OutputFormat::parse(&raw).ok_or(ConfigError::UnknownFormat(raw))?,
        };
        let source = match self.source {
            None => SourceKind::WebPreview,
            Some(raw) => raw.parse().map_err(ConfigError::UnknownSource)?,
        };

        Ok(CollectorConfig {
            job_name,
            channels,
            window,
            key_search: self.key_search.unwrap_or_default().trim().to_string(),
            max_count,
            time_limit: Duration::from_secs(time_limit_secs),
            format,
            output_dir: self.output_dir.unwrap_or_else(|| PathBuf::from(".")),
            source,
            fixtures_dir: self
                .fixtures_dir
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            user_agent: self.user_agent.filter(|ua| !ua.trim().is_empty()),
            group_floor: Duration::from_secs(
                self.group_floor_secs.unwrap_or(DEFAULT_GROUP_FLOOR_SECS),
            ),
        })
    }
}

/// `YYYY-MM-DD` is midnight UTC of that day; anything else must be RFC 3339.
pub fn parse_date_bound(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

fn parse_bound(key: &'static str, raw: Option<String>) -> Result<DateTime<Utc>, ConfigError> {
    let raw = raw.ok_or(ConfigError::Missing(key))?;
    parse_date_bound(&raw).ok_or(ConfigError::InvalidDate { key, value: raw })
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    pub job_name: String,
    pub channels: Vec<String>,
    pub window: TimeWindow,
    pub key_search: String,
    pub max_count: u64,
    pub time_limit: Duration,
    pub format: OutputFormat,
    pub output_dir: PathBuf,
    pub source: SourceKind,
    pub fixtures_dir: PathBuf,
    pub user_agent: Option<String>,
    pub group_floor: Duration,
}

impl CollectorConfig {
    pub fn identity(&self) -> SourceIdentity {
        SourceIdentity {
            name: self.job_name.clone(),
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn connector_settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            fixtures_dir: self.fixtures_dir.clone(),
            fetcher: FetcherConfig {
                user_agent: self.user_agent.clone(),
                ..FetcherConfig::default()
            },
        }
    }

    pub fn stop_policy(&self) -> StopPolicy {
        StopPolicy {
            max_count: self.max_count,
            time_limit: self.time_limit,
        }
    }

    pub fn log(&self) {
        info!(
            job = self.job_name.as_str(),
            channels = ?self.channels,
            date_min = %self.window.date_min,
            date_max = %self.window.date_max,
            key_search = self.key_search.as_str(),
            max_count = self.max_count,
            time_limit_secs = self.time_limit.as_secs(),
            format = self.format.extension(),
            source = ?self.source,
            output_dir = %self.output_dir.display(),
            "collector configured"
        );
    }
}

// ---------------------------------------------------------------------------
// Stop conditions and progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    CountCap,
    TimeBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub max_count: u64,
    pub time_limit: Duration,
}

impl StopPolicy {
    pub fn check(&self, total: u64, elapsed: Duration) -> Option<StopReason> {
        if total >= self.max_count {
            Some(StopReason::CountCap)
        } else if elapsed > self.time_limit {
            Some(StopReason::TimeBudget)
        } else {
            None
        }
    }
}

/// Share of the job done, guessing the group's remaining size from the message id.
pub fn estimate_progress(total: u64, message_id: i64, max_count: u64) -> f64 {
    let horizon = total.saturating_add(message_id.max(0) as u64);
    if horizon > 0 && horizon <= max_count {
        total as f64 / horizon as f64
    } else {
        total as f64 / max_count.max(1) as f64
    }
}

/// `DD:HH:MM:SS`
pub fn format_dhms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}:{:02}",
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60
    )
}

/// Upper guess of a group's size: what it has yielded plus ids still below the current one.
fn group_horizon(group_count: u64, message_id: i64, max_count: u64) -> u64 {
    group_count
        .saturating_add(message_id.max(0) as u64)
        .min(max_count)
}

fn remaining_time(elapsed: Duration, progress: f64) -> Duration {
    if progress <= 0.0 || !progress.is_finite() {
        return Duration::ZERO;
    }
    let total = elapsed.as_secs_f64() / progress;
    Duration::from_secs_f64((total - elapsed.as_secs_f64()).max(0.0))
}

// ---------------------------------------------------------------------------
// Snapshot naming and export
// ---------------------------------------------------------------------------

fn file_safe(part: &str) -> String {
    part.chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

pub fn checkpoint_file_name(job: &str, total: u64, group: &str, message_id: i64, format: OutputFormat) -> String {
    format!(
        "backup_{}_until_{total:05}_{}_ID{message_id:07}.{}",
        file_safe(job),
        file_safe(group),
        format.extension()
    )
}

pub fn completion_file_name(group: &str, job: &str, total: u64, format: OutputFormat) -> String {
    format!(
        "complete_{}_in_{}_until_{total:05}.{}",
        file_safe(group),
        file_safe(job),
        format.extension()
    )
}

pub fn final_file_name(job: &str, total: u64, format: OutputFormat) -> String {
    format!("FINAL_{}_with_{total:05}.{}", file_safe(job), format.extension())
}

pub fn manifest_file_name(job: &str, total: u64) -> String {
    format!("FINAL_{}_with_{total:05}.manifest.json", file_safe(job))
}

pub const COLUMNS: [&str; 13] = [
    "Type",
    "Group",
    "Author ID",
    "Content",
    "Date",
    "Message ID",
    "Author",
    "Views",
    "Reactions",
    "Shares",
    "Media",
    "Url",
    "Comments List",
];

fn media_flag(has_media: bool) -> &'static str {
    if has_media {
        "True"
    } else {
        "False"
    }
}

/// Entry of the `Comments List` column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyRow {
    #[serde(rename = "Type")]
    pub kind: &'static str,
    #[serde(rename = "Comment Group")]
    pub group: String,
    #[serde(rename = "Comment Author ID")]
    pub author_id: Option<i64>,
    #[serde(rename = "Comment Content")]
    pub content: String,
    #[serde(rename = "Comment Date")]
    pub date: String,
    #[serde(rename = "Comment Message ID")]
    pub message_id: i64,
    #[serde(rename = "Comment Author")]
    pub author: Option<String>,
    #[serde(rename = "Comment Views")]
    pub views: Option<i64>,
    #[serde(rename = "Comment Reactions")]
    pub reactions: String,
    #[serde(rename = "Comment Shares")]
    pub shares: Option<i64>,
    #[serde(rename = "Comment Media")]
    pub media: &'static str,
    #[serde(rename = "Comment Url")]
    pub url: String,
}

impl From<&Record> for ReplyRow {
    fn from(reply: &Record) -> Self {
        Self {
            kind: reply.kind.label(),
            group: reply.source_group.clone(),
            author_id: reply.author_id,
            content: reply.body.clone(),
            date: reply.formatted_date(),
            message_id: reply.sequence_id,
            author: reply.author.clone(),
            views: reply.engagement.views,
            reactions: format_reactions(&reply.engagement.reactions),
            shares: reply.engagement.shares,
            media: media_flag(reply.has_media),
            url: reply.permalink.clone(),
        }
    }
}

/// One output row per primary record; replies are nested as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordRow {
    #[serde(rename = "Type")]
    pub kind: &'static str,
    #[serde(rename = "Group")]
    pub group: String,
    #[serde(rename = "Author ID")]
    pub author_id: Option<i64>,
    #[serde(rename = "Content")]
    pub content: String,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Message ID")]
    pub message_id: i64,
    #[serde(rename = "Author")]
    pub author: Option<String>,
    #[serde(rename = "Views")]
    pub views: Option<i64>,
    #[serde(rename = "Reactions")]
    pub reactions: String,
    #[serde(rename = "Shares")]
    pub shares: Option<i64>,
    #[serde(rename = "Media")]
    pub media: &'static str,
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "Comments List")]
    pub comments_list: String,
}

impl RecordRow {
    pub fn from_record(record: &Record) -> anyhow::Result<Self> {
        let replies: Vec<ReplyRow> = record.replies.iter().map(ReplyRow::from).collect();
        let comments_list = serde_json::to_string(&replies)
            .with_context(|| format!("serializing replies of message {}", record.sequence_id))?;
        Ok(Self {
            kind: record.kind.label(),
            group: record.source_group.clone(),
            author_id: record.author_id,
            content: record.body.clone(),
            date: record.formatted_date(),
            message_id: record.sequence_id,
            author: record.author.clone(),
            views: record.engagement.views,
            reactions: format_reactions(&record.engagement.reactions),
            shares: record.engagement.shares,
            media: media_flag(record.has_media),
            url: record.permalink.clone(),
            comments_list: sanitize_text(&comments_list),
        })
    }
}

pub fn records_to_rows(records: &[Record]) -> anyhow::Result<Vec<RecordRow>> {
    records.iter().map(RecordRow::from_record).collect()
}

/// Serialize the full buffer in `format`. An empty buffer still yields headers/schema.
pub fn encode_records(format: OutputFormat, records: &[Record]) -> anyhow::Result<Vec<u8>> {
    let rows = records_to_rows(records)?;
    match format {
        OutputFormat::Parquet => encode_parquet(&rows),
        OutputFormat::Csv => encode_csv(&rows),
    }
}

fn encode_csv(rows: &[RecordRow]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(COLUMNS).context("writing csv header")?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("writing csv row for message {}", row.message_id))?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow!("flushing csv buffer: {}", e.error()))
}

fn row_schema() -> Schema {
    let utf8 = |name: &str, nullable: bool| ArrowField::new(name, DataType::Utf8, nullable);
    let int64 = |name: &str, nullable: bool| ArrowField::new(name, DataType::Int64, nullable);
    Schema::new(vec![
        utf8(COLUMNS[0], false),
        utf8(COLUMNS[1], false),
        int64(COLUMNS[2], true),
        utf8(COLUMNS[3], false),
        utf8(COLUMNS[4], false),
        int64(COLUMNS[5], false),
        utf8(COLUMNS[6], true),
        int64(COLUMNS[7], true),
        utf8(COLUMNS[8], false),
        int64(COLUMNS[9], true),
        utf8(COLUMNS[10], false),
        utf8(COLUMNS[11], false),
        utf8(COLUMNS[12], false),
    ])
}

fn encode_parquet(rows: &[RecordRow]) -> anyhow::Result<Vec<u8>> {
    let strings = |f: fn(&RecordRow) -> &str| -> ArrayRef {
        Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let optional_strings = |f: fn(&RecordRow) -> Option<&str>| -> ArrayRef {
        Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let optional_ints = |f: fn(&RecordRow) -> Option<i64>| -> ArrayRef {
        Arc::new(Int64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let message_ids: ArrayRef = Arc::new(Int64Array::from(
        rows.iter().map(|r| r.message_id).collect::<Vec<_>>(),
    ));

    let batch = RecordBatch::try_new(
        Arc::new(row_schema()),
        vec![
            strings(|r| r.kind),
            strings(|r| r.group.as_str()),
            optional_ints(|r| r.author_id),
            strings(|r| r.content.as_str()),
            strings(|r| r.date.as_str()),
            message_ids,
            optional_strings(|r| r.author.as_deref()),
            optional_ints(|r| r.views),
            strings(|r| r.reactions.as_str()),
            optional_ints(|r| r.shares),
            strings(|r| r.media),
            strings(|r| r.url.as_str()),
            strings(|r| r.comments_list.as_str()),
        ],
    )
    .context("building record batch")?;

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

/// `(Group, Message ID)` of every row in a snapshot file, in file order.
pub fn read_snapshot_keys(path: &Path) -> anyhow::Result<Vec<(String, i64)>> {
    let is_parquet = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("parquet"));
    if is_parquet {
        read_parquet_keys(path)
    } else {
        read_csv_keys(path)
    }
}

fn read_parquet_keys(path: &Path) -> anyhow::Result<Vec<(String, i64)>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?
        .build()
        .with_context(|| format!("building parquet reader {}", path.display()))?;

    let mut keys = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("reading batch from {}", path.display()))?;
        let groups = batch
            .column_by_name("Group")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .context("Group column missing or not utf8")?;
        let ids = batch
            .column_by_name("Message ID")
            .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
            .context("Message ID column missing or not int64")?;
        for i in 0..batch.num_rows() {
            keys.push((groups.value(i).to_string(), ids.value(i)));
        }
    }
    Ok(keys)
}

#[derive(Debug, Deserialize)]
struct CsvKey {
    #[serde(rename = "Group")]
    group: String,
    #[serde(rename = "Message ID")]
    message_id: i64,
}

fn read_csv_keys(path: &Path) -> anyhow::Result<Vec<(String, i64)>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    reader
        .deserialize::<CsvKey>()
        .map(|row| {
            row.map(|k| (k.group, k.message_id))
                .with_context(|| format!("reading row from {}", path.display()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("cannot start collection: {0}")]
    FatalStartup(#[source] AdapterError),
    #[error("group {group}: {source}")]
    Group {
        group: String,
        #[source]
        source: AdapterError,
    },
    #[error("message {id} in {group}: {source}")]
    Record {
        group: String,
        id: i64,
        #[source]
        source: RecordError,
    },
    #[error("writing snapshot {file_name}: {message}")]
    Snapshot { file_name: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Checkpoint,
    Completion,
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotEntry {
    pub kind: SnapshotKind,
    pub file_name: String,
    pub path: PathBuf,
    pub rows: usize,
    pub sha256: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub job_name: String,
    pub total_records: u64,
    pub snapshots: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum GroupStatus {
    /// The source ran out of messages.
    Exhausted,
    /// A message older than `date_min` was reached.
    ReachedWindowStart,
    Stopped(StopReason),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub group: String,
    pub accepted: u64,
    pub skipped_too_new: u64,
    pub skipped_duplicates: u64,
    pub dropped: u64,
    pub status: GroupStatus,
    pub completion_file: Option<String>,
}

impl GroupReport {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            accepted: 0,
            skipped_too_new: 0,
            skipped_duplicates: 0,
            dropped: 0,
            status: GroupStatus::Exhausted,
            completion_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectSummary {
    pub run_id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_records: u64,
    pub stop_reason: Option<StopReason>,
    pub groups: Vec<GroupReport>,
    pub snapshots: Vec<SnapshotEntry>,
    pub final_snapshot: PathBuf,
    pub manifest: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CollectOutcome {
    pub summary: CollectSummary,
    pub records: Vec<Record>,
}

/// Buffer and counters owned by one run.
struct RunState {
    buffer: Vec<Record>,
    total: u64,
    snapshots: Vec<SnapshotEntry>,
    started: Instant,
}

pub struct Collector {
    config: CollectorConfig,
    connector: Box<dyn SourceConnector>,
    store: SnapshotStore,
    stop: StopPolicy,
    connect_backoff: BackoffPolicy,
}

impl Collector {
    pub fn new(config: CollectorConfig, connector: Box<dyn SourceConnector>) -> Self {
        let store = SnapshotStore::new(config.output_dir.clone());
        let stop = config.stop_policy();
        Self {
            config,
            connector,
            store,
            stop,
            connect_backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_connect_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.connect_backoff = backoff;
        self
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<CollectOutcome, CollectError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("collect", %run_id, job = self.config.job_name.as_str());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<CollectOutcome, CollectError> {
        let started_at = Utc::now();
        let mut state = RunState {
            buffer: Vec::new(),
            total: 0,
            snapshots: Vec::new(),
            started: Instant::now(),
        };

        let mut groups = Vec::with_capacity(self.config.channels.len());
        let mut stop_reason = None;
        let mut connected_once = false;

        for (index, group) in self.config.channels.iter().enumerate() {
            if let Some(reason) = self.stop.check(state.total, state.started.elapsed()) {
                info!(?reason, next_group = group.as_str(), "stop condition met, skipping remaining groups");
                stop_reason = Some(reason);
                break;
            }

            let group_started = Instant::now();
            let report = match self
                .collect_group(group, &mut state)
                .instrument(info_span!("group", group = group.as_str()))
                .await
            {
                Ok(report) => {
                    connected_once = true;
                    report
                }
                Err(source) if !connected_once => return Err(CollectError::FatalStartup(source)),
                Err(source) => {
                    let err = CollectError::Group {
                        group: group.clone(),
                        source,
                    };
                    warn!(error = %err, "cannot open session, moving on");
                    GroupReport {
                        status: GroupStatus::Failed(err.to_string()),
                        ..GroupReport::new(group)
                    }
                }
            };
            if let GroupStatus::Stopped(reason) = report.status {
                stop_reason = Some(reason);
            }
            groups.push(report);

            let has_next = index + 1 < self.config.channels.len();
            let stopping = self.stop.check(state.total, state.started.elapsed()).is_some();
            let spent = group_started.elapsed();
            if has_next && !stopping && spent < self.config.group_floor {
                let pause = self.config.group_floor - spent;
                debug!(?pause, "pausing before next group");
                tokio::time::sleep(pause).await;
            }
        }

        info!(total = state.total, "collection concluded");

        let final_name = final_file_name(&self.config.job_name, state.total, self.config.format);
        let final_entry = self
            .write_snapshot(SnapshotKind::Final, final_name, &mut state)
            .map_err(|(file_name, err)| CollectError::Snapshot {
                file_name,
                message: format!("{err:#}"),
            })?;

        let manifest_name = manifest_file_name(&self.config.job_name, state.total);
        let manifest = RunManifest {
            schema_version: 1,
            run_id,
            job_name: self.config.job_name.clone(),
            total_records: state.total,
            snapshots: state.snapshots.clone(),
        };
        let manifest_path = serde_json::to_vec_pretty(&manifest)
            .context("serializing run manifest")
            .and_then(|bytes| self.store.write(&manifest_name, &bytes))
            .map_err(|err| CollectError::Snapshot {
                file_name: manifest_name.clone(),
                message: format!("{err:#}"),
            })?
            .path;

        Ok(CollectOutcome {
            summary: CollectSummary {
                run_id,
                job_name: self.config.job_name.clone(),
                started_at,
                finished_at: Utc::now(),
                total_records: state.total,
                stop_reason,
                groups,
                snapshots: state.snapshots,
                final_snapshot: final_entry.path,
                manifest: manifest_path,
            },
            records: state.buffer,
        })
    }

    /// Opens a fresh session for `group`. `Err` means the session could not be opened at all.
    async fn collect_group(&self, group: &str, state: &mut RunState) -> Result<GroupReport, AdapterError> {
        let identity = self.config.identity();
        let session = retry_with_backoff(&self.connect_backoff, "connect", || {
            self.connector.connect(&identity)
        })
        .await?;
        info!(source = ?self.connector.kind(), "session opened, collecting group");
        let mut report = GroupReport::new(group);

        match self.consume_group(session.as_ref(), group, state, &mut report).await {
            Ok(status) => {
                info!(accepted = report.accepted, ?status, "group finished");
                report.status = status;
                let name = completion_file_name(
                    group,
                    &self.config.job_name,
                    state.total,
                    self.config.format,
                );
                match self.write_snapshot(SnapshotKind::Completion, name, state) {
                    Ok(entry) => report.completion_file = Some(entry.file_name),
                    Err((file_name, err)) => {
                        warn!(file = file_name.as_str(), error = %format!("{err:#}"), "completion snapshot failed")
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, accepted = report.accepted, "group failed, moving on");
                report.status = GroupStatus::Failed(err.to_string());
            }
        }
        Ok(report)
    }

    async fn consume_group(
        &self,
        session: &dyn SourceSession,
        group: &str,
        state: &mut RunState,
        report: &mut GroupReport,
    ) -> Result<GroupStatus, CollectError> {
        let group_error = |source: AdapterError| CollectError::Group {
            group: group.to_string(),
            source,
        };

        let mut cursor = session
            .iterate(group, &self.config.key_search)
            .await
            .map_err(group_error)?;
        let mut last_id: Option<i64> = None;

        while let Some(message) = cursor.next_message().await.map_err(group_error)? {
            if last_id.is_some_and(|last| message.id >= last) {
                debug!(id = message.id, "skipping out-of-order or repeated message");
                report.skipped_duplicates += 1;
                continue;
            }
            last_id = Some(message.id);

            let Some(timestamp) = message.date else {
                let err = CollectError::Record {
                    group: group.to_string(),
                    id: message.id,
                    source: RecordError::MissingTimestamp {
                        group: group.to_string(),
                        id: message.id,
                    },
                };
                warn!(error = %err, "dropping message");
                report.dropped += 1;
                continue;
            };

            match self.config.window.classify(timestamp) {
                WindowPosition::TooOld => return Ok(GroupStatus::ReachedWindowStart),
                WindowPosition::TooNew => {
                    report.skipped_too_new += 1;
                    continue;
                }
                WindowPosition::Inside => {}
            }

            let replies = self.fetch_replies(session, group, message.id).await;
            let record = match Record::primary(group, &message, replies) {
                Ok(record) => record,
                Err(source) => {
                    let err = CollectError::Record {
                        group: group.to_string(),
                        id: message.id,
                        source,
                    };
                    warn!(error = %err, "dropping message");
                    report.dropped += 1;
                    continue;
                }
            };

            let date = record.formatted_date();
            state.buffer.push(record);
            state.total += 1;
            report.accepted += 1;
            self.log_progress(state, report, message.id, &date);

            if state.total % CHECKPOINT_INTERVAL == 0 {
                let name = checkpoint_file_name(
                    &self.config.job_name,
                    state.total,
                    group,
                    message.id,
                    self.config.format,
                );
                if let Err((file_name, err)) = self.write_snapshot(SnapshotKind::Checkpoint, name, state) {
                    warn!(file = file_name.as_str(), error = %format!("{err:#}"), "checkpoint snapshot failed");
                }
            }

            if let Some(reason) = self.stop.check(state.total, state.started.elapsed()) {
                info!(?reason, total = state.total, "stop condition met");
                return Ok(GroupStatus::Stopped(reason));
            }
        }

        Ok(GroupStatus::Exhausted)
    }

    /// Replies are best-effort: any failure leaves the record with none.
    async fn fetch_replies(&self, session: &dyn SourceSession, group: &str, anchor_id: i64) -> Vec<Record> {
        let messages = match session.replies(group, anchor_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(anchor_id, error = %err, "reply fetch failed, keeping message without replies");
                return Vec::new();
            }
        };
        match messages
            .iter()
            .map(|m| Record::reply(group, anchor_id, m))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(replies) => replies,
            Err(err) => {
                warn!(anchor_id, error = %err, "reply conversion failed, keeping message without replies");
                Vec::new()
            }
        }
    }

    fn log_progress(&self, state: &RunState, report: &GroupReport, message_id: i64, date: &str) {
        let elapsed = state.started.elapsed();
        let progress = estimate_progress(state.total, message_id, self.config.max_count);
        info!(
            progress = %format!("{:.2}%", progress * 100.0),
            elapsed = %format_dhms(elapsed),
            remaining = %format_dhms(remaining_time(elapsed, progress)),
            group_count = %format!("{:05}", report.accepted),
            group_horizon = %format!("{:05}", group_horizon(report.accepted, message_id, self.config.max_count)),
            id = %format!("{message_id:05}"),
            date,
            total = %format!("{:05}", state.total),
            "record accepted"
        );
    }

    fn write_snapshot(
        &self,
        kind: SnapshotKind,
        file_name: String,
        state: &mut RunState,
    ) -> Result<SnapshotEntry, (String, anyhow::Error)> {
        let stored = encode_records(self.config.format, &state.buffer)
            .and_then(|bytes| self.store.write(&file_name, &bytes));
        let stored = match stored {
            Ok(stored) => stored,
            Err(err) => return Err((file_name, err)),
        };

        info!(?kind, file = stored.file_name.as_str(), rows = state.buffer.len(), "snapshot written");
        let entry = SnapshotEntry {
            kind,
            file_name: stored.file_name,
            path: stored.path,
            rows: state.buffer.len(),
            sha256: stored.sha256,
            bytes: stored.byte_size,
        };
        state.snapshots.push(entry.clone());
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use tgh_core::{ReactionCount, SourceMessage};

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, day, 8, 30, 0).single().unwrap()
    }

    fn record(id: i64, replies: Vec<Record>) -> Record {
        let message = SourceMessage {
            id,
            date: Some(ts(3)),
            sender_id: Some(7),
            text: Some(format!("post {id}, with \"quotes\"")),
            reactions: vec![ReactionCount { emoticon: "👍".into(), count: 4 }],
            views: Some(100),
            ..SourceMessage::default()
        };
        Record::primary("@desk", &message, replies).unwrap()
    }

    fn reply(anchor: i64, id: i64) -> Record {
        let message = SourceMessage {
            id,
            date: Some(ts(4)),
            text: Some("agreed".into()),
            reply_to: Some(anchor),
            ..SourceMessage::default()
        };
        Record::reply("@desk", anchor, &message).unwrap()
    }

    fn base_settings() -> JobSettings {
        JobSettings {
            job_name: Some("weekly".into()),
            channels: Some(ChannelList::Joined("@a, @b,, ".into())),
            date_min: Some("2025-01-20".into()),
            date_max: Some("2025-04-20".into()),
            ..JobSettings::default()
        }
    }

    #[test]
    fn resolve_applies_defaults() {
        let config = base_settings().resolve().unwrap();
        assert_eq!(config.channels, vec!["@a".to_string(), "@b".to_string()]);
        assert_eq!(config.window.date_min, Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap());
        assert_eq!(config.max_count, DEFAULT_MAX_COUNT);
        assert_eq!(config.time_limit, Duration::from_secs(21_600));
        assert_eq!(config.format, OutputFormat::Parquet);
        assert_eq!(config.source, SourceKind::WebPreview);
        assert_eq!(config.group_floor, Duration::from_secs(60));
        assert_eq!(config.key_search, "");
    }

    #[test]
    fn resolve_rejects_invalid_jobs() {
        let mut s = base_settings();
        s.channels = Some(ChannelList::Joined(" , ".into()));
        assert!(matches!(s.resolve(), Err(ConfigError::NoChannels)));

        let mut s = base_settings();
        s.date_min = Some("2025-05-01".into());
        assert!(matches!(s.resolve(), Err(ConfigError::EmptyWindow { .. })));

        let mut s = base_settings();
        s.date_max = Some("20/04/2025".into());
        assert!(matches!(s.resolve(), Err(ConfigError::InvalidDate { key: "date_max", .. })));

        let mut s = base_settings();
        s.max_count = Some(0);
        assert!(matches!(s.resolve(), Err(ConfigError::Zero("max_count"))));

        let mut s = base_settings();
        s.time_limit_secs = Some(0);
        assert!(matches!(s.resolve(), Err(ConfigError::Zero("time_limit_secs"))));

        let mut s = base_settings();
        s.format = Some("xlsx".into());
        assert!(matches!(s.resolve(), Err(ConfigError::UnknownFormat(_))));

        let mut s = base_settings();
        s.job_name = Some("  ".into());
        assert!(matches!(s.resolve(), Err(ConfigError::Missing("job_name"))));
    }

    #[test]
    fn layers_merge_with_later_layers_winning() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TGH_JOB_NAME", "from-env"),
            ("TGH_CHANNELS", "@env"),
            ("TGH_MAX_COUNT", "25"),
            ("TGH_FORMAT", "CSV"),
        ]);
        let env = JobSettings::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        let yaml = JobSettings::from_yaml_str(
            "job_name: from-yaml\nchannels: ['@x', '@y']\ndate_min: 2025-01-01\ndate_max: 2025-01-31T23:59:59Z\n",
        )
        .unwrap();
        let cli = JobSettings {
            max_count: Some(10),
            ..JobSettings::default()
        };

        let config = env.merge(yaml).merge(cli).resolve().unwrap();
        assert_eq!(config.job_name, "from-yaml");
        assert_eq!(config.channels, vec!["@x".to_string(), "@y".to_string()]);
        assert_eq!(config.max_count, 10);
        assert_eq!(config.format, OutputFormat::Csv);
        assert_eq!(
            config.window.date_max,
            Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 59).unwrap()
        );
    }

    #[test]
    fn env_numbers_must_parse() {
        let err = JobSettings::from_lookup(|k| (k == "TGH_TIME_LIMIT_SECS").then(|| "6h".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { key: "TGH_TIME_LIMIT_SECS", .. }));
    }

    #[test]
    fn yaml_rejects_unknown_keys() {
        assert!(matches!(
            JobSettings::from_yaml_str("job: x\n"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn output_format_is_normalized() {
        assert_eq!(OutputFormat::parse(" Parquet!"), Some(OutputFormat::Parquet));
        assert_eq!(OutputFormat::parse(".CSV"), Some(OutputFormat::Csv));
        assert_eq!(OutputFormat::parse("excel"), None);
    }

    #[test]
    fn stop_policy_checks_count_before_time() {
        let policy = StopPolicy {
            max_count: 3,
            time_limit: Duration::from_secs(10),
        };
        assert_eq!(policy.check(2, Duration::from_secs(10)), None);
        assert_eq!(policy.check(2, Duration::from_secs(11)), Some(StopReason::TimeBudget));
        assert_eq!(policy.check(3, Duration::from_secs(11)), Some(StopReason::CountCap));
    }

    #[test]
    fn progress_and_durations_format_like_console_report() {
        assert_eq!(format_dhms(Duration::from_secs(90_061)), "01:01:01:01");
        assert_eq!(format_dhms(Duration::ZERO), "00:00:00:00");
        assert!((estimate_progress(10, 90, 1_000) - 0.1).abs() < 1e-9);
        assert!((estimate_progress(10, 5_000, 1_000) - 0.01).abs() < 1e-9);
        assert_eq!(remaining_time(Duration::from_secs(10), 0.5), Duration::from_secs(10));
        assert_eq!(remaining_time(Duration::from_secs(10), 0.0), Duration::ZERO);
        assert_eq!(group_horizon(12, 300, 1_000), 312);
        assert_eq!(group_horizon(12, 5_000, 1_000), 1_000);
    }

    #[test]
    fn snapshot_names_follow_convention() {
        assert_eq!(
            checkpoint_file_name("weekly", 1000, "@desk", 4521, OutputFormat::Parquet),
            "backup_weekly_until_01000_@desk_ID0004521.parquet"
        );
        assert_eq!(
            completion_file_name("@desk", "weekly", 42, OutputFormat::Csv),
            "complete_@desk_in_weekly_until_00042.csv"
        );
        assert_eq!(final_file_name("weekly", 123_456, OutputFormat::Csv), "FINAL_weekly_with_123456.csv");
        assert_eq!(
            completion_file_name("https://t.me/desk", "weekly", 1, OutputFormat::Csv),
            "complete_https___t.me_desk_in_weekly_until_00001.csv"
        );
    }

    #[test]
    fn rows_flatten_replies_into_json() {
        let row = RecordRow::from_record(&record(10, vec![reply(10, 12), reply(10, 11)])).unwrap();
        assert_eq!(row.kind, "text");
        assert_eq!(row.reactions, "👍 4 ");
        assert_eq!(row.media, "False");
        assert_eq!(row.date, "2025-02-03 08:30:00");

        let replies: serde_json::Value = serde_json::from_str(&row.comments_list).unwrap();
        let replies = replies.as_array().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["Type"], "comment");
        assert_eq!(replies[0]["Comment Message ID"], 12);
        assert_eq!(replies[0]["Comment Url"], "https://t.me/desk/10?comment=12");
        assert_eq!(replies[1]["Comment Author ID"], serde_json::Value::Null);

        let bare = RecordRow::from_record(&record(9, vec![])).unwrap();
        assert_eq!(bare.comments_list, "[]");
    }

    #[test]
    fn empty_buffer_still_encodes_header() {
        let csv = String::from_utf8(encode_records(OutputFormat::Csv, &[]).unwrap()).unwrap();
        assert_eq!(csv.trim_end(), COLUMNS.join(","));
        assert!(!encode_records(OutputFormat::Parquet, &[]).unwrap().is_empty());
    }

    #[test]
    fn encoding_an_unchanged_buffer_is_repeatable() {
        let records = vec![record(3, vec![reply(3, 8)]), record(2, vec![]), record(1, vec![])];
        for format in [OutputFormat::Csv, OutputFormat::Parquet] {
            let first = encode_records(format, &records).unwrap();
            let second = encode_records(format, &records).unwrap();
            assert_eq!(first, second, "{format:?} output differs between runs");
        }
    }

    #[test]
    fn snapshots_read_back_in_buffer_order() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![record(30, vec![reply(30, 31)]), record(20, vec![]), record(10, vec![])];
        for format in [OutputFormat::Csv, OutputFormat::Parquet] {
            let path = dir.path().join(format!("snap.{}", format.extension()));
            std::fs::write(&path, encode_records(format, &records).unwrap()).unwrap();
            let keys = read_snapshot_keys(&path).unwrap();
            assert_eq!(
                keys,
                vec![("@desk".to_string(), 30), ("@desk".to_string(), 20), ("@desk".to_string(), 10)]
            );
        }
    }
}
