use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::page_ir::{
    Cursor, DocumentBlock, LayoutKey, LayoutOptions, PageBlock, PageContent, PaginateDiagnostic,
    TextAlign,
};
use crate::page_layout::{PageBuilder, TextMeasurer};

const CACHE_SCHEMA_VERSION: &str = "v2";
const DEFAULT_MAX_CACHE_FILE_BYTES: usize = 8 * 1024 * 1024;
/// Pause between background productions so demand requests can interleave.
const BACKGROUND_YIELD: Duration = Duration::from_millis(8);

/// Cooperative stop flag shared between a demand loop and whoever wants to
/// interrupt it.
///
/// Clones share one flag: a UI thread keeps a clone and trips it while a
/// worker drives [`PaginationEngine::ensure_window_with`]. A page already
/// in production finishes and keeps its side effects; the loop stops before
/// asking for the next one. The engine holds its own signal for the
/// background producer and trips it on drop.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every loop holding a clone to stop after its current page.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Everything the engine persists per `(book_id, layout_key)`.
///
/// `cursor` is absent once pagination is complete.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub pages: Vec<Arc<PageContent>>,
    pub is_complete: bool,
    pub total_characters: u64,
    pub cursor: Option<Cursor>,
}

/// Storage hooks for pagination caches.
pub trait PageCacheStore: Send + Sync {
    /// Load the cached entry for `(book_id, layout_key)`, if available.
    fn load(&self, _book_id: &str, _layout_key: &LayoutKey) -> Option<CacheEntry> {
        None
    }

    /// Persist `entry` for `(book_id, layout_key)`. Returns `false` when the
    /// write failed; the engine reports a diagnostic and continues, and the
    /// next produced page retries implicitly.
    fn save(&self, _book_id: &str, _layout_key: &LayoutKey, _entry: &CacheEntry) -> bool {
        true
    }
}

/// Why a cache write was rejected or failed.
#[derive(Debug)]
pub enum CacheWriteError {
    /// Encoding the entry envelope failed.
    Encode(serde_json::Error),
    /// The encoded entry exceeds the store's `max_file_bytes`.
    EntryTooLarge { actual: usize, limit: usize },
    /// Filesystem error while staging or swapping the entry.
    Io(io::Error),
}

impl fmt::Display for CacheWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(err) => write!(f, "entry encoding failed: {err}"),
            Self::EntryTooLarge { actual, limit } => {
                write!(f, "entry of {actual} bytes exceeds cap of {limit}")
            }
            Self::Io(err) => write!(f, "cache i/o failed: {err}"),
        }
    }
}

impl std::error::Error for CacheWriteError {}

impl From<serde_json::Error> for CacheWriteError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err)
    }
}

impl From<io::Error> for CacheWriteError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// File-backed pagination cache store.
///
/// Each `(book_id, layout_key)` pair owns exactly one file,
/// `<root>/<book_id>/<layout_key>.json`, holding a versioned JSON envelope.
/// A save replaces the whole file: the entry is encoded up front, checked
/// against `max_file_bytes`, staged as a `.tmp` sibling, and renamed onto
/// the target, so readers only ever observe complete entries. Loads fail
/// soft: any I/O, size, or decode problem reads as a miss.
#[derive(Clone, Debug)]
pub struct FilePageCacheStore {
    root: PathBuf,
    max_file_bytes: usize,
}

impl FilePageCacheStore {
    /// Create a new cache store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_file_bytes: DEFAULT_MAX_CACHE_FILE_BYTES,
        }
    }

    /// Set the maximum allowed cache file size in bytes.
    ///
    /// Values of `0` are treated as `1` to keep the cap explicit.
    pub fn with_max_file_bytes(mut self, max_file_bytes: usize) -> Self {
        self.max_file_bytes = max_file_bytes.max(1);
        self
    }

    /// Root directory for cache files.
    pub fn cache_root(&self) -> &Path {
        &self.root
    }

    /// Maximum allowed cache file size in bytes.
    pub fn max_file_bytes(&self) -> usize {
        self.max_file_bytes
    }

    /// Deterministic cache path for a book/layout pair.
    pub fn entry_path(&self, book_id: &str, layout_key: &LayoutKey) -> PathBuf {
        self.root
            .join(sanitize_path_component(book_id))
            .join(format!("{}.json", layout_key.as_str()))
    }

    fn write_entry(&self, target: &Path, entry: &CacheEntry) -> Result<(), CacheWriteError> {
        let payload = serde_json::to_vec(&PersistedCacheEntry::from_entry(entry))?;
        if payload.len() > self.max_file_bytes {
            return Err(CacheWriteError::EntryTooLarge {
                actual: payload.len(),
                limit: self.max_file_bytes,
            });
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        // Stage next to the target so the rename stays on one filesystem.
        // In-process writers are already serialized by the engine; across
        // processes the rename makes the last writer win.
        let staged = target.with_extension("json.tmp");
        if let Err(err) = stage_and_swap(&staged, target, &payload) {
            let _ = fs::remove_file(&staged);
            return Err(err.into());
        }
        Ok(())
    }
}

fn stage_and_swap(staged: &Path, target: &Path, payload: &[u8]) -> io::Result<()> {
    let mut file = File::create(staged)?;
    file.write_all(payload)?;
    file.sync_all()?;
    drop(file);
    fs::rename(staged, target)
}

fn sanitize_path_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

impl PageCacheStore for FilePageCacheStore {
    fn load(&self, book_id: &str, layout_key: &LayoutKey) -> Option<CacheEntry> {
        let file = File::open(self.entry_path(book_id, layout_key)).ok()?;
        if file.metadata().ok()?.len() > self.max_file_bytes as u64 {
            return None;
        }
        let envelope: PersistedCacheEntry = serde_json::from_reader(BufReader::new(file)).ok()?;
        envelope.into_entry()
    }

    fn save(&self, book_id: &str, layout_key: &LayoutKey, entry: &CacheEntry) -> bool {
        let target = self.entry_path(book_id, layout_key);
        match self.write_entry(&target, entry) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("cache write to {} failed: {err}", target.display());
                false
            }
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PersistedCacheEntry {
    version: String,
    is_complete: bool,
    total_characters: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cursor: Option<Cursor>,
    pages: Vec<PersistedPage>,
}

impl PersistedCacheEntry {
    fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            version: CACHE_SCHEMA_VERSION.to_string(),
            is_complete: entry.is_complete,
            total_characters: entry.total_characters,
            cursor: entry.cursor.clone(),
            pages: entry
                .pages
                .iter()
                .map(|page| PersistedPage::from(page.as_ref()))
                .collect(),
        }
    }

    fn into_entry(self) -> Option<CacheEntry> {
        if self.version != CACHE_SCHEMA_VERSION {
            return None;
        }
        Some(CacheEntry {
            pages: self
                .pages
                .into_iter()
                .map(|page| Arc::new(PageContent::from(page)))
                .collect(),
            is_complete: self.is_complete,
            total_characters: self.total_characters,
            cursor: self.cursor,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PersistedPage {
    chapter_index: u32,
    start_word_index: u64,
    end_word_index: u64,
    start_char_index: u64,
    end_char_index: u64,
    blocks: Vec<PersistedPageBlock>,
}

impl From<&PageContent> for PersistedPage {
    fn from(page: &PageContent) -> Self {
        Self {
            chapter_index: page.chapter_index,
            start_word_index: page.start_word,
            end_word_index: page.end_word,
            start_char_index: page.start_char,
            end_char_index: page.end_char,
            blocks: page.blocks.iter().map(PersistedPageBlock::from).collect(),
        }
    }
}

impl From<PersistedPage> for PageContent {
    fn from(page: PersistedPage) -> Self {
        Self {
            blocks: page.blocks.into_iter().map(PageBlock::from).collect(),
            chapter_index: page.chapter_index,
            start_char: page.start_char_index,
            end_char: page.end_char_index,
            start_word: page.start_word_index,
            end_word: page.end_word_index,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PersistedFontStyle {
    Normal,
    Italic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum PersistedPageBlock {
    Text {
        text: String,
        spacing_before: f32,
        spacing_after: f32,
        text_align: u8,
        font_size: f32,
        line_height: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<u32>,
        /// Index into the canonical 100..=900 weight sequence; absent for
        /// regular weight.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        font_weight: Option<u16>,
        font_style: PersistedFontStyle,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        font_family: Option<String>,
        apply_height_first_ascent: bool,
        apply_height_last_descent: bool,
    },
    Image {
        spacing_before: f32,
        spacing_after: f32,
        image_height: f32,
        #[serde(with = "base64_bytes")]
        image_bytes: Vec<u8>,
    },
}

fn weight_to_index(weight: u16) -> Option<u16> {
    if weight == 400 {
        None
    } else {
        Some((weight / 100).clamp(1, 9) - 1)
    }
}

fn index_to_weight(index: Option<u16>) -> u16 {
    match index {
        Some(index) => (index.min(8) + 1) * 100,
        None => 400,
    }
}

impl From<&PageBlock> for PersistedPageBlock {
    fn from(block: &PageBlock) -> Self {
        match block {
            PageBlock::Text {
                text,
                style,
                align,
                spacing_before,
                spacing_after,
            } => Self::Text {
                text: text.clone(),
                spacing_before: *spacing_before,
                spacing_after: *spacing_after,
                text_align: align.as_index(),
                font_size: style.font_size,
                line_height: style.line_height,
                color: style.color,
                font_weight: weight_to_index(style.font_weight),
                font_style: if style.italic {
                    PersistedFontStyle::Italic
                } else {
                    PersistedFontStyle::Normal
                },
                font_family: style.font_family.clone(),
                apply_height_first_ascent: style.apply_height_first_ascent,
                apply_height_last_descent: style.apply_height_last_descent,
            },
            PageBlock::Image {
                bytes,
                rendered_height,
                spacing_before,
                spacing_after,
            } => Self::Image {
                spacing_before: *spacing_before,
                spacing_after: *spacing_after,
                image_height: *rendered_height,
                image_bytes: bytes.clone(),
            },
        }
    }
}

impl From<PersistedPageBlock> for PageBlock {
    fn from(block: PersistedPageBlock) -> Self {
        match block {
            PersistedPageBlock::Text {
                text,
                spacing_before,
                spacing_after,
                text_align,
                font_size,
                line_height,
                color,
                font_weight,
                font_style,
                font_family,
                apply_height_first_ascent,
                apply_height_last_descent,
            } => Self::Text {
                text,
                style: crate::page_ir::ResolvedTextStyle {
                    font_family,
                    font_size,
                    line_height,
                    font_weight: index_to_weight(font_weight),
                    italic: matches!(font_style, PersistedFontStyle::Italic),
                    color,
                    apply_height_first_ascent,
                    apply_height_last_descent,
                },
                align: TextAlign::from_index(text_align),
                spacing_before,
                spacing_after,
            },
            PersistedPageBlock::Image {
                spacing_before,
                spacing_after,
                image_height,
                image_bytes,
            } => Self::Image {
                bytes: image_bytes,
                rendered_height: image_height,
                spacing_before,
                spacing_after,
            },
        }
    }
}

type DiagnosticSink = Mutex<Option<Box<dyn FnMut(PaginateDiagnostic) + Send>>>;

/// Construction options for [`PaginationEngine::open`].
pub struct EngineOptions {
    layout: LayoutOptions,
    measurer: Arc<dyn TextMeasurer>,
    cache: Option<Arc<dyn PageCacheStore>>,
    diagnostic_sink: Option<Box<dyn FnMut(PaginateDiagnostic) + Send>>,
}

impl EngineOptions {
    pub fn new(layout: LayoutOptions, measurer: Arc<dyn TextMeasurer>) -> Self {
        Self {
            layout,
            measurer,
            cache: None,
            diagnostic_sink: None,
        }
    }

    /// Use cache hooks for loading/storing pagination results.
    pub fn with_cache(mut self, cache: Arc<dyn PageCacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Register a diagnostics sink. `PageProduced` doubles as the
    /// page-growth notification.
    pub fn with_diagnostic_sink<F>(mut self, sink: F) -> Self
    where
        F: FnMut(PaginateDiagnostic) + Send + 'static,
    {
        self.diagnostic_sink = Some(Box::new(sink));
        self
    }
}

struct EngineCore {
    builder: PageBuilder,
    pages: Vec<Arc<PageContent>>,
    complete: bool,
    total_characters: u64,
}

struct EngineShared {
    core: Mutex<EngineCore>,
    /// Serializes snapshot+write pairs so saves land in production order.
    save_lock: Mutex<()>,
    stop: StopSignal,
    background_running: AtomicBool,
    book_id: String,
    layout_key: LayoutKey,
    cache: Option<Arc<dyn PageCacheStore>>,
    diagnostic_sink: DiagnosticSink,
}

impl EngineShared {
    fn emit_diagnostic(&self, diagnostic: PaginateDiagnostic) {
        if let Ok(mut sink) = self.diagnostic_sink.lock() {
            if let Some(sink) = sink.as_mut() {
                sink(diagnostic);
            }
        }
    }
}

/// Produce one page under the serial discipline, then persist.
///
/// Returns `false` once the document is complete (and records completion).
fn produce_one(shared: &EngineShared) -> bool {
    enum Outcome {
        Produced { page_index: usize, completed: bool },
        Completed(usize),
    }
    let outcome = {
        let Ok(mut core) = shared.core.lock() else {
            return false;
        };
        if core.complete {
            return false;
        }
        match core.builder.next_page() {
            Some(page) => {
                core.pages.push(Arc::new(page));
                // A page that consumed the final block completes the
                // document in the same step.
                core.complete = core.builder.is_exhausted();
                Outcome::Produced {
                    page_index: core.pages.len() - 1,
                    completed: core.complete,
                }
            }
            None => {
                core.complete = true;
                Outcome::Completed(core.pages.len())
            }
        }
    };
    match outcome {
        Outcome::Produced {
            page_index,
            completed,
        } => {
            shared.emit_diagnostic(PaginateDiagnostic::PageProduced { page_index });
            if completed {
                shared.emit_diagnostic(PaginateDiagnostic::Complete {
                    page_count: page_index + 1,
                });
            }
            persist_snapshot(shared);
            !completed
        }
        Outcome::Completed(page_count) => {
            shared.emit_diagnostic(PaginateDiagnostic::Complete { page_count });
            persist_snapshot(shared);
            false
        }
    }
}

/// Snapshot the current state and write it through the cache store.
///
/// The save lock is held across snapshot and write so concurrent producers
/// cannot publish an older snapshot over a newer one.
fn persist_snapshot(shared: &EngineShared) {
    let Some(store) = shared.cache.as_ref() else {
        return;
    };
    let Ok(_guard) = shared.save_lock.lock() else {
        return;
    };
    let entry = {
        let Ok(core) = shared.core.lock() else {
            return;
        };
        CacheEntry {
            pages: core.pages.clone(),
            is_complete: core.complete,
            total_characters: core.total_characters,
            cursor: if core.complete {
                None
            } else {
                Some(core.builder.cursor())
            },
        }
    };
    if !store.save(&shared.book_id, &shared.layout_key, &entry) {
        shared.emit_diagnostic(PaginateDiagnostic::CacheWriteFailed {
            reason: "store rejected entry",
        });
    }
}

/// Lazy pagination engine.
///
/// Owns the produced-pages vector and the resumable cursor, serves demand
/// requests synchronously, and optionally continues in the background.
/// Dropping the engine stops the background producer; an in-flight page and
/// its save complete best-effort.
pub struct PaginationEngine {
    shared: Arc<EngineShared>,
}

impl PaginationEngine {
    /// Construct an engine over `blocks`, consulting the cache store (when
    /// configured) for `(book_id, layout_key)` and rehydrating pages and
    /// cursor on a hit.
    pub fn open(
        book_id: impl Into<String>,
        blocks: Vec<DocumentBlock>,
        options: EngineOptions,
    ) -> Self {
        let EngineOptions {
            layout,
            measurer,
            cache,
            diagnostic_sink,
        } = options;
        let book_id = book_id.into();
        let layout_key = LayoutKey::compute(&layout);
        let empty = blocks.is_empty();
        let mut builder = PageBuilder::new(blocks.into(), layout, measurer);
        let total_characters = builder.total_characters();

        let mut pages: Vec<Arc<PageContent>> = Vec::new();
        let mut complete = empty;
        let mut hit = None;
        if let Some(store) = cache.as_ref() {
            hit = store.load(&book_id, &layout_key).and_then(|entry| {
                if !entry.is_complete && entry.cursor.is_none() && !entry.pages.is_empty() {
                    // Inconsistent entry; treat as a miss.
                    return None;
                }
                Some(entry)
            });
        }
        if let Some(entry) = &hit {
            pages = entry.pages.clone();
            complete = entry.is_complete;
            if let Some(cursor) = &entry.cursor {
                builder.restore(cursor);
            }
        }

        let shared = Arc::new(EngineShared {
            core: Mutex::new(EngineCore {
                builder,
                pages,
                complete,
                total_characters,
            }),
            save_lock: Mutex::new(()),
            stop: StopSignal::new(),
            background_running: AtomicBool::new(false),
            book_id,
            layout_key,
            cache,
            diagnostic_sink: Mutex::new(diagnostic_sink),
        });
        match hit {
            Some(entry) => shared.emit_diagnostic(PaginateDiagnostic::CacheHit {
                page_count: entry.pages.len(),
            }),
            None if shared.cache.is_some() => {
                shared.emit_diagnostic(PaginateDiagnostic::CacheMiss)
            }
            None => {}
        }
        Self { shared }
    }

    /// Stable fingerprint of the pagination-material layout inputs.
    pub fn layout_key(&self) -> &LayoutKey {
        &self.shared.layout_key
    }

    pub fn book_id(&self) -> &str {
        &self.shared.book_id
    }

    /// Replace the diagnostics sink.
    pub fn set_diagnostic_sink<F>(&self, sink: F)
    where
        F: FnMut(PaginateDiagnostic) + Send + 'static,
    {
        if let Ok(mut slot) = self.shared.diagnostic_sink.lock() {
            *slot = Some(Box::new(sink));
        }
    }

    /// The page at `index`, if produced.
    pub fn page(&self, index: usize) -> Option<Arc<PageContent>> {
        let core = self.shared.core.lock().ok()?;
        core.pages.get(index).cloned()
    }

    /// Number of pages produced so far. Monotonically non-decreasing.
    pub fn pages_len(&self) -> usize {
        self.shared
            .core
            .lock()
            .map(|core| core.pages.len())
            .unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        self.shared
            .core
            .lock()
            .map(|core| core.complete)
            .unwrap_or(false)
    }

    /// Characters the document contributes to the global index, one per
    /// image block.
    pub fn total_characters(&self) -> u64 {
        self.shared
            .core
            .lock()
            .map(|core| core.total_characters)
            .unwrap_or(0)
    }

    /// Whether a page after `index` exists or may still be produced.
    pub fn has_next(&self, index: usize) -> bool {
        self.shared
            .core
            .lock()
            .map(|core| index + 1 < core.pages.len() || !core.complete)
            .unwrap_or(false)
    }

    pub fn has_prev(&self, index: usize) -> bool {
        index > 0
    }

    /// Exact page count when complete, otherwise a loose lower bound.
    pub fn estimated_total_pages(&self) -> usize {
        self.shared
            .core
            .lock()
            .map(|core| {
                if core.complete {
                    core.pages.len()
                } else {
                    core.pages.len() + 1
                }
            })
            .unwrap_or(0)
    }

    /// Drive production until `pages.len() > center + radius` or complete.
    /// Persists after each new page.
    pub fn ensure_window(&self, center: usize, radius: usize) {
        self.ensure_window_with(center, radius, &StopSignal::new());
    }

    /// [`ensure_window`](Self::ensure_window) checking a [`StopSignal`]
    /// between page productions; an in-flight page always completes.
    pub fn ensure_window_with(&self, center: usize, radius: usize, signal: &StopSignal) {
        let target = center.saturating_add(radius);
        loop {
            if signal.is_stopped() {
                return;
            }
            let satisfied = self
                .shared
                .core
                .lock()
                .map(|core| core.complete || core.pages.len() > target)
                .unwrap_or(true);
            if satisfied {
                return;
            }
            if !produce_one(&self.shared) {
                return;
            }
        }
    }

    /// Extend pages until the one containing `char_index` exists (or the
    /// document completes), then return its index.
    pub fn ensure_for_character(&self, char_index: u64) -> usize {
        loop {
            let satisfied = self
                .shared
                .core
                .lock()
                .map(|core| {
                    core.complete
                        || core
                            .pages
                            .last()
                            .is_some_and(|page| page.end_char >= char_index)
                })
                .unwrap_or(true);
            if satisfied {
                break;
            }
            if !produce_one(&self.shared) {
                break;
            }
        }
        self.find_by_character(char_index)
    }

    /// Index of the produced page containing `char_index`. Past-the-end
    /// indices clamp to the last page; an empty engine returns `0`.
    pub fn find_by_character(&self, char_index: u64) -> usize {
        let Ok(core) = self.shared.core.lock() else {
            return 0;
        };
        if core.pages.is_empty() {
            return 0;
        }
        core.pages
            .partition_point(|page| page.end_char < char_index)
            .min(core.pages.len() - 1)
    }

    /// First page of `chapter_index`, paginating to completion when the
    /// chapter has not been reached yet.
    pub fn find_by_chapter(&self, chapter_index: u32) -> Option<usize> {
        let scan = |pages: &[Arc<PageContent>]| {
            pages
                .iter()
                .position(|page| page.chapter_index == chapter_index)
        };
        {
            let core = self.shared.core.lock().ok()?;
            if let Some(index) = scan(&core.pages) {
                return Some(index);
            }
            if core.complete {
                return None;
            }
        }
        while produce_one(&self.shared) {}
        let core = self.shared.core.lock().ok()?;
        scan(&core.pages)
    }

    /// Start the background producer if the document is incomplete and no
    /// producer is already running. The producer yields briefly between
    /// pages and stops when the engine is dropped.
    pub fn start_background(&self) {
        if self.is_complete() {
            return;
        }
        if self.shared.background_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("page-stream-producer".to_string())
            .spawn(move || {
                loop {
                    if shared.stop.is_stopped() {
                        break;
                    }
                    if !produce_one(&shared) {
                        break;
                    }
                    thread::sleep(BACKGROUND_YIELD);
                }
                shared.background_running.store(false, Ordering::Release);
            });
        if spawned.is_err() {
            self.shared.background_running.store(false, Ordering::Release);
            log::warn!("failed to spawn background pagination thread");
        }
    }

    /// Whether this engine already paginates exactly these inputs, so the
    /// hosting UI can skip a rebuild. Dimensions compare within half a
    /// pixel.
    pub fn matches(&self, blocks: &[DocumentBlock], layout: &LayoutOptions) -> bool {
        let Ok(core) = self.shared.core.lock() else {
            return false;
        };
        core.builder.layout().agrees_with(layout) && **core.builder.blocks() == *blocks
    }
}

impl Drop for PaginationEngine {
    fn drop(&mut self) {
        self.shared.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_ir::{ImageBlock, TextBlock};
    use crate::page_layout::HeuristicTextMeasurer;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    static TEMP_NONCE: AtomicUsize = AtomicUsize::new(0);

    fn temp_cache_root(label: &str) -> PathBuf {
        let nonce = TEMP_NONCE.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "page-stream-{label}-{}-{nonce}",
            std::process::id()
        ))
    }

    fn layout() -> LayoutOptions {
        LayoutOptions::for_viewport(320.0, 560.0)
    }

    fn options() -> EngineOptions {
        EngineOptions::new(layout(), Arc::new(HeuristicTextMeasurer))
    }

    fn paragraph(chapter: u32, text: &str) -> DocumentBlock {
        DocumentBlock::Text(TextBlock::paragraph(chapter, text))
    }

    fn image(chapter: u32, bytes: Vec<u8>) -> DocumentBlock {
        DocumentBlock::Image(ImageBlock {
            chapter_index: chapter,
            bytes,
            intrinsic_width: Some(640.0),
            intrinsic_height: Some(400.0),
            spacing_before: 8.0,
            spacing_after: 8.0,
        })
    }

    fn sample_entry() -> CacheEntry {
        let style = layout().resolve_text_style(&TextBlock::paragraph(0, "x"));
        let text_page = PageContent {
            blocks: smallvec::smallvec![PageBlock::Text {
                text: "first page ".to_string(),
                style,
                align: TextAlign::Center,
                spacing_before: 4.0,
                spacing_after: 0.0,
            }],
            chapter_index: 0,
            start_char: 0,
            end_char: 10,
            start_word: 0,
            end_word: 1,
        };
        let image_page = PageContent {
            blocks: smallvec::smallvec![PageBlock::Image {
                bytes: vec![0, 1, 2, 254, 255],
                rendered_height: 182.5,
                spacing_before: 8.0,
                spacing_after: 8.0,
            }],
            chapter_index: 1,
            start_char: 11,
            end_char: 11,
            start_word: 2,
            end_word: 1,
        };
        CacheEntry {
            pages: vec![Arc::new(text_page), Arc::new(image_page)],
            is_complete: false,
            total_characters: 64,
            cursor: Some(Cursor {
                block_index: 2,
                global_char_index: 12,
                global_word_index: 2,
                text_state: None,
            }),
        }
    }

    #[test]
    fn file_store_round_trips_entries() {
        let root = temp_cache_root("roundtrip");
        let store = FilePageCacheStore::new(&root);
        let key = LayoutKey::compute(&layout());
        let entry = sample_entry();
        assert!(store.save("book-1", &key, &entry));
        let loaded = store.load("book-1", &key).expect("entry should load");
        assert_eq!(entry, loaded);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn file_store_missing_and_corrupt_entries_are_misses() {
        let root = temp_cache_root("corrupt");
        let store = FilePageCacheStore::new(&root);
        let key = LayoutKey::compute(&layout());
        assert!(store.load("book-1", &key).is_none());

        let path = store.entry_path("book-1", &key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{not json").unwrap();
        assert!(store.load("book-1", &key).is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn file_store_rejects_other_schema_versions() {
        let root = temp_cache_root("version");
        let store = FilePageCacheStore::new(&root);
        let key = LayoutKey::compute(&layout());
        let path = store.entry_path("book-1", &key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            br#"{"version":"v1","is_complete":true,"total_characters":0,"pages":[]}"#,
        )
        .unwrap();
        assert!(store.load("book-1", &key).is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn file_store_enforces_size_cap_on_write() {
        let root = temp_cache_root("cap");
        let store = FilePageCacheStore::new(&root).with_max_file_bytes(32);
        let key = LayoutKey::compute(&layout());
        assert!(!store.save("book-1", &key, &sample_entry()));
        assert!(store.load("book-1", &key).is_none());
        // No temp files left behind.
        let dir = store.entry_path("book-1", &key);
        let entries: Vec<_> = fs::read_dir(dir.parent().unwrap())
            .map(|iter| iter.collect())
            .unwrap_or_default();
        assert!(entries.is_empty(), "{entries:?}");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn file_store_overwrites_atomically() {
        let root = temp_cache_root("overwrite");
        let store = FilePageCacheStore::new(&root);
        let key = LayoutKey::compute(&layout());
        let mut entry = sample_entry();
        assert!(store.save("book-1", &key, &entry));
        entry.is_complete = true;
        entry.cursor = None;
        assert!(store.save("book-1", &key, &entry));
        let loaded = store.load("book-1", &key).unwrap();
        assert!(loaded.is_complete);
        assert!(loaded.cursor.is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn sanitized_book_ids_share_no_paths_with_keys() {
        let store = FilePageCacheStore::new("/tmp/cache");
        let key = LayoutKey::compute(&layout());
        let path = store.entry_path("shelf/Война и мир", &key);
        let component = path.parent().unwrap().file_name().unwrap();
        let component = component.to_string_lossy();
        assert!(component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')));
    }

    #[test]
    fn empty_document_completes_immediately() {
        let engine = PaginationEngine::open("book", Vec::new(), options());
        engine.ensure_window(0, 0);
        assert_eq!(engine.pages_len(), 0);
        assert!(engine.is_complete());
        assert_eq!(engine.total_characters(), 0);
        assert_eq!(engine.find_by_character(0), 0);
        assert_eq!(engine.estimated_total_pages(), 0);
    }

    #[test]
    fn short_paragraph_paginated_on_demand() {
        let engine = PaginationEngine::open(
            "book",
            vec![paragraph(3, "Hello, world.")],
            options(),
        );
        assert_eq!(engine.pages_len(), 0);
        engine.ensure_window(0, 0);
        assert!(engine.is_complete());
        assert_eq!(engine.pages_len(), 1);
        let page = engine.page(0).unwrap();
        assert_eq!(page.start_char, 0);
        assert_eq!(page.end_char, 12);
        assert_eq!(page.chapter_index, 3);
        assert!(engine.page(1).is_none());
        assert!(!engine.has_next(0));
        assert!(!engine.has_prev(0));
        assert!(engine.has_prev(1));
    }

    #[test]
    fn ensure_window_stops_at_requested_radius() {
        let text = "window radius pagination test ".repeat(200);
        let engine = PaginationEngine::open("book", vec![paragraph(0, &text)], options());
        engine.ensure_window(1, 1);
        assert!(engine.pages_len() > 2);
        assert!(!engine.is_complete());
        assert!(engine.has_next(engine.pages_len() - 1));
        assert!(engine.estimated_total_pages() > engine.pages_len());
    }

    #[test]
    fn ensure_window_stops_at_the_signal() {
        let text = "interruptible pagination keeps its side effects ".repeat(400);

        // A signal tripped up front produces nothing.
        let engine = PaginationEngine::open("book", vec![paragraph(0, &text)], options());
        let stopped = StopSignal::new();
        stopped.stop();
        engine.ensure_window_with(1_000, 0, &stopped);
        assert_eq!(engine.pages_len(), 0);

        // A signal tripped from the diagnostics sink stops the loop after
        // the page in flight, long before the requested window.
        let signal = StopSignal::new();
        let trip = signal.clone();
        let engine = PaginationEngine::open(
            "book",
            vec![paragraph(0, &text)],
            options().with_diagnostic_sink(move |diag| {
                if matches!(diag, PaginateDiagnostic::PageProduced { page_index: 1 }) {
                    trip.stop();
                }
            }),
        );
        engine.ensure_window_with(1_000, 0, &signal);
        assert_eq!(engine.pages_len(), 2);
        assert!(!engine.is_complete());

        // The engine itself is untouched; demand can resume afterwards.
        engine.ensure_window(2, 0);
        assert_eq!(engine.pages_len(), 3);
    }

    #[test]
    fn ensure_for_character_lands_on_containing_page() {
        let text = "find by character needs contiguous ranges ".repeat(120);
        let total = text.chars().count() as u64;
        let engine = PaginationEngine::open("book", vec![paragraph(0, &text)], options());
        let target = total / 2;
        let index = engine.ensure_for_character(target);
        let page = engine.page(index).unwrap();
        assert!(page.contains_char(target), "{target} not in page {index}");
        // Past-the-end clamps to the last page.
        let clamped = engine.ensure_for_character(total + 10_000);
        assert!(engine.is_complete());
        assert_eq!(clamped, engine.pages_len() - 1);
    }

    #[test]
    fn find_by_chapter_paginates_to_completion_on_miss() {
        let blocks = vec![
            paragraph(0, &"chapter zero body ".repeat(150)),
            image(1, vec![7; 16]),
            paragraph(2, "chapter two body"),
        ];
        let engine = PaginationEngine::open("book", blocks, options());
        let index = engine.find_by_chapter(2).expect("chapter exists");
        assert!(engine.is_complete());
        assert_eq!(engine.page(index).unwrap().chapter_index, 2);
        assert_eq!(engine.page(index - 1).unwrap().chapter_index, 1);
        assert!(engine.find_by_chapter(9).is_none());
    }

    #[test]
    fn engine_round_trips_through_cache_store() {
        let root = temp_cache_root("engine-resume");
        let store: Arc<dyn PageCacheStore> = Arc::new(FilePageCacheStore::new(&root));
        let text = "resume must replay the cursor exactly ".repeat(160);
        let blocks = vec![paragraph(0, &text), image(1, vec![3; 8])];

        let reference = PaginationEngine::open("book", blocks.clone(), options());
        while produce_one(&reference.shared) {}
        let reference_pages: Vec<_> = (0..reference.pages_len())
            .map(|i| reference.page(i).unwrap())
            .collect();
        assert!(reference_pages.len() > 3);

        // Produce a prefix, persisting as we go, then drop.
        {
            let engine = PaginationEngine::open(
                "book",
                blocks.clone(),
                options().with_cache(Arc::clone(&store)),
            );
            engine.ensure_window(1, 1);
            assert!(!engine.is_complete());
        }

        // Reopen: cache supplies the prefix, resume finishes the document.
        let (hits_tx, hits_rx) = mpsc::channel();
        let engine = PaginationEngine::open(
            "book",
            blocks,
            options()
                .with_cache(Arc::clone(&store))
                .with_diagnostic_sink(move |diag| {
                    let _ = hits_tx.send(diag);
                }),
        );
        assert!(matches!(
            hits_rx.try_recv(),
            Ok(PaginateDiagnostic::CacheHit { page_count }) if page_count > 0
        ));
        let cached_prefix = engine.pages_len();
        assert!(cached_prefix > 0);
        while produce_one(&engine.shared) {}
        assert!(engine.is_complete());
        let resumed_pages: Vec<_> = (0..engine.pages_len())
            .map(|i| engine.page(i).unwrap())
            .collect();
        assert_eq!(reference_pages.len(), resumed_pages.len());
        for (a, b) in reference_pages.iter().zip(&resumed_pages) {
            assert_eq!(a, b);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn layout_change_is_a_cache_miss_that_preserves_the_old_entry() {
        let root = temp_cache_root("relayout");
        let store: Arc<dyn PageCacheStore> = Arc::new(FilePageCacheStore::new(&root));
        let blocks = vec![paragraph(0, &"font size change invalidates ".repeat(80))];

        let engine = PaginationEngine::open(
            "book",
            blocks.clone(),
            options().with_cache(Arc::clone(&store)),
        );
        engine.ensure_window(0, 2);
        let old_key = engine.layout_key().clone();
        drop(engine);
        let old_entry = store.load("book", &old_key).expect("entry persisted");

        let bigger = EngineOptions::new(
            layout().with_font_size(18.0),
            Arc::new(HeuristicTextMeasurer),
        )
        .with_cache(Arc::clone(&store));
        let (diag_tx, diag_rx) = mpsc::channel();
        let engine = PaginationEngine::open("book", blocks, bigger);
        engine.set_diagnostic_sink(move |diag| {
            let _ = diag_tx.send(diag);
        });
        assert_ne!(&old_key, engine.layout_key());
        assert_eq!(engine.pages_len(), 0);
        engine.ensure_window(0, 0);
        assert!(matches!(
            diag_rx.try_recv(),
            Ok(PaginateDiagnostic::PageProduced { page_index: 0 })
        ));
        // The original entry is untouched.
        assert_eq!(store.load("book", &old_key), Some(old_entry));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn background_producer_runs_to_completion() {
        let text = "background production proceeds without demand ".repeat(120);
        let engine = PaginationEngine::open("book", vec![paragraph(0, &text)], options());
        engine.start_background();
        // Idempotent while running.
        engine.start_background();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !engine.is_complete() {
            assert!(
                std::time::Instant::now() < deadline,
                "background producer stalled"
            );
            thread::sleep(Duration::from_millis(5));
        }
        let len = engine.pages_len();
        assert!(len > 1);
        let last = engine.page(len - 1).unwrap();
        assert_eq!(last.end_char, text.chars().count() as u64 - 1);
    }

    #[test]
    fn dropping_the_engine_stops_background_work() {
        let text = "drop cancels the producer ".repeat(2_000);
        let engine = PaginationEngine::open("book", vec![paragraph(0, &text)], options());
        engine.start_background();
        let shared = Arc::clone(&engine.shared);
        drop(engine);
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while shared.background_running.load(Ordering::Acquire) {
            assert!(
                std::time::Instant::now() < deadline,
                "producer ignored stop flag"
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn matches_detects_layout_and_content_changes() {
        let blocks = vec![paragraph(0, "stable"), image(0, vec![1, 2])];
        let engine = PaginationEngine::open("book", blocks.clone(), options());
        assert!(engine.matches(&blocks, &layout()));

        let mut nudged = layout();
        nudged.max_width += 0.3;
        assert!(engine.matches(&blocks, &nudged));
        nudged.max_width += 0.5;
        assert!(!engine.matches(&blocks, &nudged));

        let mut edited = blocks.clone();
        edited[0] = paragraph(0, "unstable");
        assert!(!engine.matches(&edited, &layout()));
    }

    #[test]
    fn persisted_entry_is_byte_deterministic() {
        let entry = sample_entry();
        let a = serde_json::to_vec(&PersistedCacheEntry::from_entry(&entry)).unwrap();
        let b = serde_json::to_vec(&PersistedCacheEntry::from_entry(&entry)).unwrap();
        assert_eq!(a, b);
    }
}
