//! Lazy pagination engine for e-reader documents.
//!
//! `page-stream` converts a linear sequence of styled text and image blocks
//! into a stable, indexable sequence of fixed-size pages under a layout
//! configuration. Pages are produced on demand for the current reading
//! window, continued by a background producer, and persisted per
//! `(book_id, layout_key)` so reopening a book with the same layout is
//! near-instant.

#![cfg_attr(
    not(test),
    deny(
        clippy::disallowed_methods,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::panic_in_result_fn,
        clippy::todo,
        clippy::unimplemented
    )
)]

mod page_engine;
mod page_ir;
mod page_layout;

pub use page_engine::{
    CacheEntry, CacheWriteError, EngineOptions, FilePageCacheStore, PageCacheStore,
    PaginationEngine, StopSignal,
};
pub use page_ir::{
    BlockTextStyle, Cursor, DocumentBlock, FontStyle, ImageBlock, LayoutKey, LayoutOptions,
    LinearTextScaler, PageBlock, PageContent, PaginateDiagnostic, ResolvedTextStyle, TextAlign,
    TextBlock, TextCursorState, TextScaler,
};
pub use page_layout::{
    build_token_spans, HeuristicTextMeasurer, LaidOutText, LineMetric, TextMeasurer, TokenSpan,
};
