//! Message source contracts + fixture and web-preview implementations.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tgh_core::{ReactionCount, SourceMessage};
use tgh_storage::{FetchError, FetcherConfig, PageFetcher};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "tgh-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    WebPreview,
    Fixture,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" | "web_preview" | "preview" => Ok(SourceKind::WebPreview),
            "fixture" | "fixtures" => Ok(SourceKind::Fixture),
            other => Err(format!("unknown source `{other}` (expected web or fixture)")),
        }
    }
}

/// Who the collector presents itself as when opening a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceIdentity {
    pub name: String,
    pub user_agent: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("cannot connect to source: {0}")]
    Connect(String),
    #[error("unknown group {0}")]
    UnknownGroup(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Establish an authenticated session. Failure here is fatal to a job.
    async fn connect(&self, identity: &SourceIdentity) -> Result<Box<dyn SourceSession>, AdapterError>;
}

#[async_trait]
pub trait SourceSession: Send + Sync {
    /// Newest-first iteration over a group's top-level messages, filtered by keyword at the source.
    async fn iterate(
        &self,
        group: &str,
        key_search: &str,
    ) -> Result<Box<dyn MessageCursor>, AdapterError>;

    /// Messages replying to `anchor_id`, newest first.
    async fn replies(&self, group: &str, anchor_id: i64) -> Result<Vec<SourceMessage>, AdapterError>;
}

#[async_trait]
pub trait MessageCursor: Send {
    async fn next_message(&mut self) -> Result<Option<SourceMessage>, AdapterError>;
}

/// Cursor over messages already held in memory.
#[derive(Debug, Default)]
pub struct VecCursor {
    messages: VecDeque<SourceMessage>,
}

impl VecCursor {
    pub fn new(messages: impl IntoIterator<Item = SourceMessage>) -> Self {
        Self {
            messages: messages.into_iter().collect(),
        }
    }
}

#[async_trait]
impl MessageCursor for VecCursor {
    async fn next_message(&mut self) -> Result<Option<SourceMessage>, AdapterError> {
        Ok(self.messages.pop_front())
    }
}

/// Strip `@` and any `t.me` prefix from a group identifier.
pub fn group_slug(group: &str) -> String {
    let trimmed = group.trim();
    let without_host = ["https://t.me/s/", "https://t.me/", "http://t.me/", "t.me/"]
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed);
    without_host
        .trim_start_matches('@')
        .trim_end_matches('/')
        .to_string()
}

// ---------------------------------------------------------------------------
// Fixture bundles
// ---------------------------------------------------------------------------

/// Captured export of one group, stored as `<fixtures>/<slug>/bundle.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub group: String,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    pub messages: Vec<SourceMessage>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> anyhow::Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn fixture_bundle_path(root: &Path, group: &str) -> PathBuf {
    root.join(group_slug(group)).join("bundle.json")
}

#[derive(Debug, Clone)]
pub struct FixtureConnector {
    root: Option<PathBuf>,
    preloaded: Vec<FixtureBundle>,
}

impl FixtureConnector {
    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            preloaded: Vec::new(),
        }
    }

    pub fn from_bundles(bundles: Vec<FixtureBundle>) -> Self {
        Self {
            root: None,
            preloaded: bundles,
        }
    }
}

#[async_trait]
impl SourceConnector for FixtureConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::Fixture
    }

    async fn connect(&self, identity: &SourceIdentity) -> Result<Box<dyn SourceSession>, AdapterError> {
        if let Some(root) = &self.root {
            if !root.is_dir() {
                return Err(AdapterError::Connect(format!(
                    "fixture directory {} does not exist",
                    root.display()
                )));
            }
        }
        debug!(identity = identity.name.as_str(), "fixture session opened");

        let bundles = self
            .preloaded
            .iter()
            .map(|b| (group_slug(&b.group), Arc::new(b.clone())))
            .collect();
        Ok(Box::new(FixtureSession {
            root: self.root.clone(),
            bundles: Mutex::new(bundles),
        }))
    }
}

struct FixtureSession {
    root: Option<PathBuf>,
    bundles: Mutex<HashMap<String, Arc<FixtureBundle>>>,
}

impl FixtureSession {
    fn bundle(&self, group: &str) -> Result<Arc<FixtureBundle>, AdapterError> {
        let slug = group_slug(group);
        let mut bundles = self
            .bundles
            .lock()
            .map_err(|_| AdapterError::Message("fixture cache poisoned".to_string()))?;
        if let Some(bundle) = bundles.get(&slug) {
            return Ok(bundle.clone());
        }

        let root = self
            .root
            .as_ref()
            .ok_or_else(|| AdapterError::UnknownGroup(group.to_string()))?;
        let path = fixture_bundle_path(root, group);
        if !path.exists() {
            return Err(AdapterError::UnknownGroup(group.to_string()));
        }
        let bundle = Arc::new(load_fixture_bundle(&path)?);
        bundles.insert(slug, bundle.clone());
        Ok(bundle)
    }
}

fn matches_keyword(message: &SourceMessage, needle: &str) -> bool {
    needle.is_empty()
        || message
            .text
            .as_deref()
            .map(|t| t.to_lowercase().contains(needle))
            .unwrap_or(false)
}

#[async_trait]
impl SourceSession for FixtureSession {
    async fn iterate(
        &self,
        group: &str,
        key_search: &str,
    ) -> Result<Box<dyn MessageCursor>, AdapterError> {
        let bundle = self.bundle(group)?;
        let needle = key_search.trim().to_lowercase();
        let mut messages: Vec<SourceMessage> = bundle
            .messages
            .iter()
            .filter(|m| m.reply_to.is_none() && matches_keyword(m, &needle))
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(Box::new(VecCursor::new(messages)))
    }

    async fn replies(&self, group: &str, anchor_id: i64) -> Result<Vec<SourceMessage>, AdapterError> {
        let bundle = self.bundle(group)?;
        let mut replies: Vec<SourceMessage> = bundle
            .messages
            .iter()
            .filter(|m| m.reply_to == Some(anchor_id))
            .cloned()
            .collect();
        replies.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(replies)
    }
}

// ---------------------------------------------------------------------------
// Public web preview (t.me/s/<channel>)
// ---------------------------------------------------------------------------

pub const WEB_PREVIEW_BASE: &str = "https://t.me/s";

#[derive(Debug, Clone)]
pub struct WebPreviewConnector {
    base_url: String,
    fetcher: FetcherConfig,
}

impl WebPreviewConnector {
    pub fn new(fetcher: FetcherConfig) -> Self {
        Self {
            base_url: WEB_PREVIEW_BASE.to_string(),
            fetcher,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl SourceConnector for WebPreviewConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::WebPreview
    }

    async fn connect(&self, identity: &SourceIdentity) -> Result<Box<dyn SourceSession>, AdapterError> {
        let mut config = self.fetcher.clone();
        if identity.user_agent.is_some() {
            config.user_agent = identity.user_agent.clone();
        }
        let fetcher = PageFetcher::new(config).map_err(|e| AdapterError::Connect(format!("{e:#}")))?;
        Ok(Box::new(WebPreviewSession {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            fetcher: Arc::new(fetcher),
        }))
    }
}

struct WebPreviewSession {
    base_url: String,
    fetcher: Arc<PageFetcher>,
}

#[async_trait]
impl SourceSession for WebPreviewSession {
    async fn iterate(
        &self,
        group: &str,
        key_search: &str,
    ) -> Result<Box<dyn MessageCursor>, AdapterError> {
        let slug = group_slug(group);
        if slug.is_empty() {
            return Err(AdapterError::UnknownGroup(group.to_string()));
        }
        Ok(Box::new(WebPreviewCursor {
            url: format!("{}/{}", self.base_url, slug),
            key_search: key_search.trim().to_string(),
            fetcher: self.fetcher.clone(),
            buffered: VecDeque::new(),
            before: None,
            exhausted: false,
        }))
    }

    async fn replies(&self, _group: &str, _anchor_id: i64) -> Result<Vec<SourceMessage>, AdapterError> {
        // The preview does not render discussion threads.
        Ok(Vec::new())
    }
}

struct WebPreviewCursor {
    url: String,
    key_search: String,
    fetcher: Arc<PageFetcher>,
    buffered: VecDeque<SourceMessage>,
    before: Option<i64>,
    exhausted: bool,
}

impl WebPreviewCursor {
    async fn load_page(&mut self) -> Result<(), AdapterError> {
        let mut query = Vec::new();
        if !self.key_search.is_empty() {
            query.push(("q", self.key_search.clone()));
        }
        if let Some(before) = self.before {
            query.push(("before", before.to_string()));
        }

        let html = self.fetcher.fetch_text(&self.url, &query).await?;
        let page = older_first_to_newest_first(parse_preview_page(&html)?, self.before);
        debug!(url = self.url.as_str(), before = ?self.before, messages = page.len(), "preview page parsed");

        match page.last().map(|m| m.id) {
            Some(oldest) => {
                self.before = Some(oldest);
                self.buffered.extend(page);
            }
            None => self.exhausted = true,
        }
        Ok(())
    }
}

#[async_trait]
impl MessageCursor for WebPreviewCursor {
    async fn next_message(&mut self) -> Result<Option<SourceMessage>, AdapterError> {
        if self.buffered.is_empty() && !self.exhausted {
            self.load_page().await?;
        }
        Ok(self.buffered.pop_front())
    }
}

/// Pages render oldest at the top; keep only ids below the previous page and flip the order.
fn older_first_to_newest_first(mut page: Vec<SourceMessage>, before: Option<i64>) -> Vec<SourceMessage> {
    if let Some(before) = before {
        page.retain(|m| m.id < before);
    }
    page.sort_by(|a, b| b.id.cmp(&a.id));
    page.dedup_by_key(|m| m.id);
    page
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(e.to_string()))
}

fn first_text(element: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Parse counters rendered as `987`, `1.2K` or `3M`.
pub fn parse_compact_count(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (number, scale) = match raw.chars().last()? {
        'K' | 'k' => (&raw[..raw.len() - 1], 1_000.0),
        'M' | 'm' => (&raw[..raw.len() - 1], 1_000_000.0),
        'B' | 'b' => (&raw[..raw.len() - 1], 1_000_000_000.0),
        _ => (raw, 1.0),
    };
    let value: f64 = number.trim().replace(',', "").parse().ok()?;
    Some((value * scale).round() as i64)
}

pub fn parse_preview_page(html: &str) -> Result<Vec<SourceMessage>, AdapterError> {
    let document = Html::parse_document(html);
    let message_sel = selector("div.tgme_widget_message[data-post]")?;
    let text_sel = selector(".tgme_widget_message_text")?;
    let time_sel = selector(".tgme_widget_message_date time")?;
    let views_sel = selector(".tgme_widget_message_views")?;
    let author_sel = selector(".tgme_widget_message_from_author")?;
    let media_sel = selector(
        ".tgme_widget_message_photo_wrap, .tgme_widget_message_video_player, \
         .tgme_widget_message_document, .tgme_widget_message_voice, \
         .tgme_widget_message_roundvideo, .tgme_widget_message_sticker_wrap",
    )?;
    let reaction_sel = selector(".tgme_reaction")?;
    let emoji_sel = selector("i.emoji")?;

    let mut messages = Vec::new();
    for node in document.select(&message_sel) {
        let Some(post) = node.value().attr("data-post") else {
            continue;
        };
        let Some(id) = post.rsplit('/').next().and_then(|s| s.parse::<i64>().ok()) else {
            debug!(post, "skipping preview message with unparsable id");
            continue;
        };

        let date = node
            .select(&time_sel)
            .next()
            .and_then(|t| t.value().attr("datetime"))
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|d| d.with_timezone(&Utc));

        let reactions = node
            .select(&reaction_sel)
            .filter_map(|reaction| {
                let emoticon = first_text(&reaction, &emoji_sel)?;
                let full = reaction.text().collect::<String>();
                let count = parse_compact_count(full.replacen(&emoticon, "", 1).trim())?;
                Some(ReactionCount {
                    emoticon,
                    count: u64::try_from(count).unwrap_or_default(),
                })
            })
            .collect();

        messages.push(SourceMessage {
            id,
            date,
            sender_id: None,
            post_author: first_text(&node, &author_sel),
            text: first_text(&node, &text_sel),
            has_media: node.select(&media_sel).next().is_some(),
            reactions,
            forwards: None,
            views: first_text(&node, &views_sel).and_then(|v| parse_compact_count(&v)),
            reply_to: None,
        });
    }
    Ok(messages)
}

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub fixtures_dir: PathBuf,
    pub fetcher: FetcherConfig,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            fixtures_dir: PathBuf::from("./fixtures"),
            fetcher: FetcherConfig::default(),
        }
    }
}

pub fn connector_for(kind: SourceKind, settings: &ConnectorSettings) -> Box<dyn SourceConnector> {
    match kind {
        SourceKind::WebPreview => Box::new(WebPreviewConnector::new(settings.fetcher.clone())),
        SourceKind::Fixture => Box::new(FixtureConnector::from_dir(settings.fixtures_dir.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PAGE: &str = r#"
<html><body><section class="tgme_channel_history">
  <div class="tgme_widget_message_wrap">
    <div class="tgme_widget_message js-widget_message" data-post="newsroom/101">
      <div class="tgme_widget_message_text js-message_text">Older post <b>bold</b></div>
      <div class="tgme_widget_message_footer">
        <span class="tgme_widget_message_views">987</span>
        <span class="tgme_widget_message_meta"><a class="tgme_widget_message_date" href="https://t.me/newsroom/101"><time datetime="2025-02-01T09:30:00+00:00" class="time">09:30</time></a></span>
      </div>
    </div>
  </div>
  <div class="tgme_widget_message_wrap">
    <div class="tgme_widget_message js-widget_message" data-post="newsroom/102">
      <a class="tgme_widget_message_photo_wrap" href="https://t.me/newsroom/102"></a>
      <div class="tgme_widget_message_text js-message_text">Newest post https://example.org/a</div>
      <div class="tgme_widget_message_reactions">
        <span class="tgme_reaction"><i class="emoji"><b>👍</b></i>1.2K</span>
        <span class="tgme_reaction"><i class="emoji"><b>🔥</b></i>37</span>
      </div>
      <div class="tgme_widget_message_footer">
        <span class="tgme_widget_message_views">12.5K</span>
        <span class="tgme_widget_message_from_author">Desk Editor</span>
        <span class="tgme_widget_message_meta"><a class="tgme_widget_message_date" href="https://t.me/newsroom/102"><time datetime="2025-02-02T18:00:00+02:00" class="time">18:00</time></a></span>
      </div>
    </div>
  </div>
  <div class="tgme_widget_message js-widget_message" data-post="newsroom/service">
  </div>
</section></body></html>
"#;

    #[test]
    fn compact_counts_expand_suffixes() {
        assert_eq!(parse_compact_count("987"), Some(987));
        assert_eq!(parse_compact_count("1.2K"), Some(1200));
        assert_eq!(parse_compact_count("3M"), Some(3_000_000));
        assert_eq!(parse_compact_count(""), None);
        assert_eq!(parse_compact_count("views"), None);
    }

    #[test]
    fn group_slug_accepts_handles_and_links() {
        assert_eq!(group_slug("@newsroom"), "newsroom");
        assert_eq!(group_slug(" https://t.me/newsroom/ "), "newsroom");
        assert_eq!(group_slug("https://t.me/s/newsroom"), "newsroom");
    }

    #[test]
    fn preview_page_parses_message_blocks() {
        let messages = parse_preview_page(PAGE).unwrap();
        assert_eq!(messages.len(), 2);

        let older = &messages[0];
        assert_eq!(older.id, 101);
        assert_eq!(older.text.as_deref(), Some("Older post bold"));
        assert_eq!(older.views, Some(987));
        assert!(!older.has_media);
        assert!(older.reactions.is_empty());

        let newest = &messages[1];
        assert_eq!(newest.id, 102);
        assert_eq!(
            newest.date,
            Some(Utc.with_ymd_and_hms(2025, 2, 2, 16, 0, 0).single().unwrap())
        );
        assert!(newest.has_media);
        assert_eq!(newest.views, Some(12_500));
        assert_eq!(newest.post_author.as_deref(), Some("Desk Editor"));
        assert_eq!(
            newest.reactions,
            vec![
                ReactionCount { emoticon: "👍".into(), count: 1200 },
                ReactionCount { emoticon: "🔥".into(), count: 37 },
            ]
        );
    }

    #[test]
    fn pages_are_flipped_and_bounded_by_cursor() {
        let page = parse_preview_page(PAGE).unwrap();
        let ordered = older_first_to_newest_first(page.clone(), None);
        assert_eq!(ordered.iter().map(|m| m.id).collect::<Vec<_>>(), vec![102, 101]);

        let bounded = older_first_to_newest_first(page, Some(102));
        assert_eq!(bounded.iter().map(|m| m.id).collect::<Vec<_>>(), vec![101]);
    }

    #[test]
    fn source_kind_parses_aliases() {
        assert_eq!("web".parse::<SourceKind>(), Ok(SourceKind::WebPreview));
        assert_eq!(" Fixture ".parse::<SourceKind>(), Ok(SourceKind::Fixture));
        assert!("mtproto".parse::<SourceKind>().is_err());
    }

    fn bundle() -> FixtureBundle {
        let msg = |id: i64, text: &str, reply_to: Option<i64>| SourceMessage {
            id,
            date: Some(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, id as u32 % 60).single().unwrap()),
            text: Some(text.to_string()),
            reply_to,
            ..SourceMessage::default()
        };
        FixtureBundle {
            group: "@memo".into(),
            captured_at: None,
            messages: vec![
                msg(1, "Budget vote", None),
                msg(3, "weather", None),
                msg(2, "budget follow-up", None),
                msg(10, "reply a", Some(2)),
                msg(11, "reply b", Some(2)),
            ],
        }
    }

    #[tokio::test]
    async fn fixture_session_yields_newest_first_with_keyword() {
        let session = FixtureConnector::from_bundles(vec![bundle()])
            .connect(&SourceIdentity::default())
            .await
            .unwrap();

        let mut cursor = session.iterate("memo", "BUDGET").await.unwrap();
        let mut ids = Vec::new();
        while let Some(m) = cursor.next_message().await.unwrap() {
            ids.push(m.id);
        }
        assert_eq!(ids, vec![2, 1]);

        let replies = session.replies("@memo", 2).await.unwrap();
        assert_eq!(replies.iter().map(|m| m.id).collect::<Vec<_>>(), vec![11, 10]);
        assert!(session.replies("@memo", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fixture_session_rejects_unknown_group() {
        let session = FixtureConnector::from_bundles(vec![bundle()])
            .connect(&SourceIdentity::default())
            .await
            .unwrap();
        assert!(matches!(
            session.iterate("@other", "").await,
            Err(AdapterError::UnknownGroup(_))
        ));
    }

    #[tokio::test]
    async fn missing_fixture_directory_fails_connect() {
        let connector = FixtureConnector::from_dir("/definitely/not/here");
        assert!(matches!(
            connector.connect(&SourceIdentity::default()).await,
            Err(AdapterError::Connect(_))
        ));
    }
}
