use core::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Horizontal alignment carried through from block styling to page output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextAlign {
    Left,
    Right,
    Center,
    Justify,
    #[default]
    Start,
    End,
}

impl TextAlign {
    /// Stable index used by the persisted page encoding.
    pub fn as_index(self) -> u8 {
        match self {
            Self::Left => 0,
            Self::Right => 1,
            Self::Center => 2,
            Self::Justify => 3,
            Self::Start => 4,
            Self::End => 5,
        }
    }

    /// Inverse of [`as_index`](Self::as_index); unknown indices fall back to `Start`.
    pub fn from_index(index: u8) -> Self {
        match index {
            0 => Self::Left,
            1 => Self::Right,
            2 => Self::Center,
            3 => Self::Justify,
            5 => Self::End,
            _ => Self::Start,
        }
    }
}

/// Slant of a text block's face.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FontStyle {
    #[default]
    Normal,
    Italic,
}

/// Per-block style overrides over the layout defaults.
///
/// `None` fields fall back to the corresponding [`LayoutOptions`] value
/// during resolution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockTextStyle {
    pub font_family: Option<String>,
    /// Base font size in logical pixels, before `font_scale` and the layout
    /// text scaler are applied.
    pub font_size: Option<f32>,
    /// Line height as a multiplier over the font size.
    pub line_height: Option<f32>,
    /// ARGB color.
    pub color: Option<u32>,
}

/// A styled logical paragraph.
#[derive(Clone, Debug, PartialEq)]
pub struct TextBlock {
    pub chapter_index: u32,
    pub text: String,
    pub style: BlockTextStyle,
    pub align: TextAlign,
    /// Multiplier applied to the base font size (headings use > 1.0).
    pub font_scale: f32,
    /// CSS-style weight in the canonical 100..=900 sequence.
    pub font_weight: u16,
    pub font_style: FontStyle,
    pub spacing_before: f32,
    pub spacing_after: f32,
}

impl TextBlock {
    /// A body paragraph with default styling.
    pub fn paragraph(chapter_index: u32, text: impl Into<String>) -> Self {
        Self {
            chapter_index,
            text: text.into(),
            style: BlockTextStyle::default(),
            align: TextAlign::Start,
            font_scale: 1.0,
            font_weight: 400,
            font_style: FontStyle::Normal,
            spacing_before: 0.0,
            spacing_after: 0.0,
        }
    }
}

/// An atomic image. Never split across pages; consumes exactly one character
/// of the global index so character-based navigation stays well-defined.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageBlock {
    pub chapter_index: u32,
    pub bytes: Vec<u8>,
    pub intrinsic_width: Option<f32>,
    pub intrinsic_height: Option<f32>,
    pub spacing_before: f32,
    pub spacing_after: f32,
}

/// One input unit of the document, in reading order.
#[derive(Clone, Debug, PartialEq)]
pub enum DocumentBlock {
    Text(TextBlock),
    Image(ImageBlock),
}

impl DocumentBlock {
    pub fn chapter_index(&self) -> u32 {
        match self {
            Self::Text(block) => block.chapter_index,
            Self::Image(block) => block.chapter_index,
        }
    }

    /// Characters this block contributes to the global index.
    pub fn char_len(&self) -> u64 {
        match self {
            Self::Text(block) => block.text.chars().count() as u64,
            Self::Image(_) => 1,
        }
    }
}

/// Fully resolved style handed to the text measurer and carried on emitted
/// text page blocks. All layout defaults and scaling are already applied.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedTextStyle {
    pub font_family: Option<String>,
    /// Effective font size in logical pixels.
    pub font_size: f32,
    /// Line height as a multiplier over `font_size`.
    pub line_height: f32,
    pub font_weight: u16,
    pub italic: bool,
    /// ARGB color.
    pub color: Option<u32>,
    /// Apply the styled line height to the first line's ascent.
    pub apply_height_first_ascent: bool,
    /// Apply the styled line height to the last line's descent.
    pub apply_height_last_descent: bool,
}

impl ResolvedTextStyle {
    /// Styled line height in logical pixels.
    pub fn line_height_px(&self) -> f32 {
        self.font_size * self.line_height
    }
}

/// One rendered unit on a page.
#[derive(Clone, Debug, PartialEq)]
pub enum PageBlock {
    Text {
        text: String,
        style: ResolvedTextStyle,
        align: TextAlign,
        spacing_before: f32,
        spacing_after: f32,
    },
    Image {
        bytes: Vec<u8>,
        rendered_height: f32,
        spacing_before: f32,
        spacing_after: f32,
    },
}

/// A finished page. Immutable once emitted by the engine.
///
/// A page holds text from at most one block, or a single image block.
/// `start_char..=end_char` and `start_word..=end_word` are global indices;
/// consecutive pages from one engine satisfy
/// `next.start_char == prev.end_char + 1`.
#[derive(Clone, Debug, PartialEq)]
pub struct PageContent {
    pub blocks: SmallVec<[PageBlock; 1]>,
    pub chapter_index: u32,
    pub start_char: u64,
    pub end_char: u64,
    pub start_word: u64,
    pub end_word: u64,
}

impl PageContent {
    /// Whether `char_index` falls inside this page's character range.
    pub fn contains_char(&self, char_index: u64) -> bool {
        self.start_char <= char_index && char_index <= self.end_char
    }
}

/// Cursor position inside a partially consumed text block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextCursorState {
    pub line_index: u32,
    /// Character offset inside the block; always `0` or a token-span end.
    pub text_offset: u32,
    pub token_pointer: u32,
}

/// Serializable global position identifying where the next page starts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub block_index: u32,
    pub global_char_index: u64,
    pub global_word_index: u64,
    /// Absent when the cursor sits between blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_state: Option<TextCursorState>,
}

/// Scaling policy applied to every resolved font size.
///
/// Two scalers that produce identical measurements must report the same
/// fingerprint; the fingerprint participates in the layout key.
pub trait TextScaler: Send + Sync {
    fn scale(&self, font_size_px: f32) -> f32;
    /// Stable opaque identity for cache keying.
    fn fingerprint(&self) -> String;
}

/// Multiplies every font size by a constant factor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearTextScaler {
    pub factor: f32,
}

impl LinearTextScaler {
    pub fn new(factor: f32) -> Self {
        Self { factor }
    }
}

impl Default for LinearTextScaler {
    fn default() -> Self {
        Self { factor: 1.0 }
    }
}

impl TextScaler for LinearTextScaler {
    fn scale(&self, font_size_px: f32) -> f32 {
        font_size_px * self.factor
    }

    fn fingerprint(&self) -> String {
        format!("linear-{:.2}", self.factor)
    }
}

/// Every input that can change page boundaries.
#[derive(Clone)]
pub struct LayoutOptions {
    /// Default font family; blocks may override.
    pub font_family: Option<String>,
    /// Default font size in logical pixels.
    pub font_size: f32,
    /// Default line height multiplier.
    pub line_height: f32,
    /// Viewport width available to text and images.
    pub max_width: f32,
    /// Viewport height available to one page.
    pub max_height: f32,
    pub apply_height_first_ascent: bool,
    pub apply_height_last_descent: bool,
    pub scaler: Arc<dyn TextScaler>,
}

impl fmt::Debug for LayoutOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutOptions")
            .field("font_family", &self.font_family)
            .field("font_size", &self.font_size)
            .field("line_height", &self.line_height)
            .field("max_width", &self.max_width)
            .field("max_height", &self.max_height)
            .field("apply_height_first_ascent", &self.apply_height_first_ascent)
            .field("apply_height_last_descent", &self.apply_height_last_descent)
            .field("scaler", &self.scaler.fingerprint())
            .finish()
    }
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            font_family: None,
            font_size: 16.0,
            line_height: 1.4,
            max_width: 360.0,
            max_height: 640.0,
            apply_height_first_ascent: true,
            apply_height_last_descent: true,
            scaler: Arc::new(LinearTextScaler::default()),
        }
    }
}

impl LayoutOptions {
    /// Convenience for a viewport size with default typography.
    pub fn for_viewport(max_width: f32, max_height: f32) -> Self {
        Self {
            max_width,
            max_height,
            ..Self::default()
        }
    }

    pub fn with_font_family(mut self, family: impl Into<String>) -> Self {
        self.font_family = Some(family.into());
        self
    }

    pub fn with_font_size(mut self, font_size: f32) -> Self {
        self.font_size = font_size;
        self
    }

    pub fn with_line_height(mut self, line_height: f32) -> Self {
        self.line_height = line_height;
        self
    }

    pub fn with_scaler(mut self, scaler: Arc<dyn TextScaler>) -> Self {
        self.scaler = scaler;
        self
    }

    /// Resolve a text block's effective style against the layout defaults.
    pub fn resolve_text_style(&self, block: &TextBlock) -> ResolvedTextStyle {
        let base_size = block.style.font_size.unwrap_or(self.font_size);
        ResolvedTextStyle {
            font_family: block
                .style
                .font_family
                .clone()
                .or_else(|| self.font_family.clone()),
            font_size: self.scaler.scale(base_size * block.font_scale),
            line_height: block.style.line_height.unwrap_or(self.line_height),
            font_weight: block.font_weight,
            italic: block.font_style == FontStyle::Italic,
            color: block.style.color,
            apply_height_first_ascent: self.apply_height_first_ascent,
            apply_height_last_descent: self.apply_height_last_descent,
        }
    }

    /// Whether `other` paginates identically to `self`.
    ///
    /// Dimensions agree within half a pixel; typography agrees within the
    /// rounding the layout key applies.
    pub fn agrees_with(&self, other: &LayoutOptions) -> bool {
        const DIM_EPSILON: f32 = 0.5;
        const TYPE_EPSILON: f32 = 0.005;
        self.font_family == other.font_family
            && (self.font_size - other.font_size).abs() < TYPE_EPSILON
            && (self.line_height - other.line_height).abs() < TYPE_EPSILON
            && (self.max_width - other.max_width).abs() < DIM_EPSILON
            && (self.max_height - other.max_height).abs() < DIM_EPSILON
            && self.apply_height_first_ascent == other.apply_height_first_ascent
            && self.apply_height_last_descent == other.apply_height_last_descent
            && self.scaler.fingerprint() == other.scaler.fingerprint()
    }
}

const LAYOUT_KEY_SCHEMA: &str = "v2";

/// Stable fingerprint of all pagination-material layout inputs.
///
/// Engines with equal keys produce identical page sequences from equal
/// inputs; the cache is keyed by `(book_id, layout_key)`. The encoded form
/// is filesystem- and URL-safe.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutKey(String);

impl LayoutKey {
    /// Compute the key for a layout.
    pub fn compute(layout: &LayoutOptions) -> Self {
        fn bit(flag: bool) -> char {
            if flag {
                '1'
            } else {
                '0'
            }
        }
        let raw = format!(
            "{}|{}|{:.2}|{:.2}|{:.1}|{:.1}|{}{}|{}",
            LAYOUT_KEY_SCHEMA,
            layout.font_family.as_deref().unwrap_or("default"),
            layout.font_size,
            layout.line_height,
            layout.max_width,
            layout.max_height,
            bit(layout.apply_height_first_ascent),
            bit(layout.apply_height_last_descent),
            layout.scaler.fingerprint(),
        );
        Self(URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayoutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime diagnostics emitted by the engine.
///
/// `PageProduced` doubles as the page-growth notification for observers of
/// the page vector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaginateDiagnostic {
    CacheHit { page_count: usize },
    CacheMiss,
    PageProduced { page_index: usize },
    Complete { page_count: usize },
    CacheWriteFailed { reason: &'static str },
}
