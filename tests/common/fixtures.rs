// Not every suite uses every fixture.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use page_stream::{
    BlockTextStyle, DocumentBlock, EngineOptions, FontStyle, HeuristicTextMeasurer, ImageBlock,
    LayoutOptions, PageContent, PaginationEngine, TextAlign, TextBlock,
};

static TEMP_NONCE: AtomicUsize = AtomicUsize::new(0);

pub fn temp_cache_root(label: &str) -> PathBuf {
    let nonce = TEMP_NONCE.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "page-stream-it-{label}-{}-{nonce}",
        std::process::id()
    ))
}

/// Typical phone viewport with default typography.
pub fn phone_layout() -> LayoutOptions {
    LayoutOptions::for_viewport(360.0, 640.0)
}

pub fn options_for(layout: LayoutOptions) -> EngineOptions {
    EngineOptions::new(layout, Arc::new(HeuristicTextMeasurer))
}

pub fn paragraph(chapter_index: u32, text: &str) -> DocumentBlock {
    let mut block = TextBlock::paragraph(chapter_index, text);
    block.spacing_after = 12.0;
    DocumentBlock::Text(block)
}

pub fn heading(chapter_index: u32, text: &str) -> DocumentBlock {
    DocumentBlock::Text(TextBlock {
        chapter_index,
        text: text.to_string(),
        style: BlockTextStyle::default(),
        align: TextAlign::Start,
        font_scale: 1.5,
        font_weight: 700,
        font_style: FontStyle::Normal,
        spacing_before: 24.0,
        spacing_after: 16.0,
    })
}

pub fn image(chapter_index: u32, width: f32, height: f32) -> DocumentBlock {
    let seed = (width as usize).wrapping_mul(31) ^ (height as usize);
    let bytes = (0..48).map(|i| ((seed + i * 7) % 256) as u8).collect();
    DocumentBlock::Image(ImageBlock {
        chapter_index,
        bytes,
        intrinsic_width: Some(width),
        intrinsic_height: Some(height),
        spacing_before: 8.0,
        spacing_after: 8.0,
    })
}

/// A small multi-chapter book: headings, body text, CJK text, images, and
/// an empty block the engine must skip.
pub fn mixed_document() -> Vec<DocumentBlock> {
    vec![
        heading(0, "Chapter One"),
        paragraph(
            0,
            &"The opening chapter wanders for quite a while before anything happens. ".repeat(30),
        ),
        image(0, 1200.0, 800.0),
        paragraph(
            0,
            &"After the illustration the narration resumes at its usual pace. ".repeat(25),
        ),
        DocumentBlock::Text(TextBlock::paragraph(0, "")),
        heading(1, "Chapter Two"),
        paragraph(1, &"第二章では物語が急展開する。読者は驚くだろう。".repeat(40)),
        image(1, 300.0, 900.0),
        heading(2, "Chapter Three"),
        paragraph(2, &"A brief closing chapter. ".repeat(12)),
    ]
}

/// Drive the engine to completion through the public demand API.
pub fn paginate_all(engine: &PaginationEngine) {
    engine.ensure_for_character(u64::MAX);
    assert!(engine.is_complete());
}

pub fn collect_pages(engine: &PaginationEngine) -> Vec<Arc<PageContent>> {
    (0..engine.pages_len())
        .map(|index| engine.page(index).expect("produced page must be readable"))
        .collect()
}

/// Global `[start, end)` character range per block, one character per image.
pub fn block_char_ranges(blocks: &[DocumentBlock]) -> Vec<(u64, u64)> {
    let mut ranges = Vec::with_capacity(blocks.len());
    let mut start = 0u64;
    for block in blocks {
        let len = block.char_len();
        ranges.push((start, start + len));
        start += len;
    }
    ranges
}
