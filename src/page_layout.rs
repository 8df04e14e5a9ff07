use std::sync::Arc;

use smallvec::smallvec;
use unicode_segmentation::UnicodeSegmentation;

use crate::page_ir::{
    Cursor, DocumentBlock, ImageBlock, LayoutOptions, PageBlock, PageContent, ResolvedTextStyle,
    TextBlock, TextCursorState,
};

const MIN_PAGE_BOTTOM_MARGIN: f32 = 48.0;
const MAX_PAGE_BOTTOM_MARGIN_RATIO: f32 = 0.18;
const MIN_BREAK_POINT_MARGIN: f32 = 24.0;
const MAX_BREAK_POINT_MARGIN: f32 = 80.0;
/// Fallback aspect ratio for images without intrinsic dimensions.
const FALLBACK_IMAGE_ASPECT: f32 = 0.62;

/// Reserved space at the bottom of every page, derived from the block's
/// line height and trailing spacing.
pub(crate) fn page_bottom_margin(line_height_px: f32, spacing_after: f32, max_height: f32) -> f32 {
    let upper = (max_height * MAX_PAGE_BOTTOM_MARGIN_RATIO).max(MIN_PAGE_BOTTOM_MARGIN);
    (line_height_px + spacing_after).clamp(MIN_PAGE_BOTTOM_MARGIN, upper)
}

/// Vertical padding above a candidate break line used to query the measurer
/// for a break offset. Prevents breaks that cut the last visible line.
pub(crate) fn break_point_margin(line_height_px: f32) -> f32 {
    (line_height_px * 0.75).clamp(MIN_BREAK_POINT_MARGIN, MAX_BREAK_POINT_MARGIN)
}

/// Per-line metrics of measured text. Character fields are char indices into
/// the measured string; `last_char` is inclusive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineMetric {
    pub left: f32,
    pub baseline_y: f32,
    pub ascent: f32,
    pub descent: f32,
    pub height: f32,
    pub first_char: usize,
    pub last_char: usize,
}

impl LineMetric {
    /// Top edge of the line box.
    pub fn top(&self) -> f32 {
        self.baseline_y - self.ascent
    }
}

/// Measurer output for one string at one width.
///
/// `lines` covers the entire measured text with `first_char` monotonic;
/// `advances` holds one horizontal advance per character.
#[derive(Clone, Debug, PartialEq)]
pub struct LaidOutText {
    pub preferred_line_height: f32,
    pub lines: Vec<LineMetric>,
    pub advances: Vec<f32>,
}

impl LaidOutText {
    /// Sum of all line heights.
    pub fn total_height(&self) -> f32 {
        self.lines.iter().map(|line| line.height).sum()
    }

    pub fn line_top(&self, line_index: usize) -> f32 {
        self.lines
            .get(line_index)
            .map(LineMetric::top)
            .unwrap_or(0.0)
    }

    /// Map a local pixel offset to a character index.
    ///
    /// `y` selects a line (clamped to the first/last line); `x` walks that
    /// line's advances. An `x` at or left of the line start yields the
    /// line's first character; an `x` past the line's end yields one past
    /// its last character.
    pub fn position_at_offset(&self, x: f32, y: f32) -> usize {
        let Some(last) = self.lines.last() else {
            return 0;
        };
        let mut selected = *last;
        let mut top = 0.0f32;
        for line in &self.lines {
            let bottom = top + line.height;
            if y < bottom {
                selected = *line;
                break;
            }
            top = bottom;
        }

        if x <= selected.left {
            return selected.first_char;
        }
        let mut cursor_x = selected.left;
        for index in selected.first_char..=selected.last_char {
            let advance = self.advances.get(index).copied().unwrap_or(0.0);
            if x < cursor_x + advance {
                return index;
            }
            cursor_x += advance;
        }
        selected.last_char + 1
    }
}

/// Text measurement contract.
///
/// Implementations must be deterministic for fixed inputs and total: every
/// character of `text` appears on exactly one line. The same implementation
/// must be used for cache creation and consumption, which is why font and
/// scaler identity participate in the layout key.
pub trait TextMeasurer: Send + Sync {
    fn measure(&self, text: &str, style: &ResolvedTextStyle, max_width: f32) -> LaidOutText;
}

/// Deterministic glyph-class-width measurer.
///
/// Approximates proportional glyph advances from character classes, wraps
/// greedily at whitespace, and models the text-height behavior flags by
/// blending the first ascent / last descent between the font's natural
/// metrics and the styled line height. Useful for headless hosts and as the
/// reference backend for the test suites; it makes no claim of matching any
/// platform shaper.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicTextMeasurer;

const NATURAL_ASCENT_RATIO: f32 = 0.8;
const NATURAL_DESCENT_RATIO: f32 = 0.2;

fn glyph_em_width(ch: char) -> f32 {
    match ch {
        ' ' | '\u{00A0}' => 0.30,
        '\n' | '\r' => 0.0,
        '\t' => 1.20,
        'i' | 'l' | 'j' | 'I' | '!' | '|' => 0.26,
        '.' | ',' | ';' | ':' | '\'' | '`' => 0.24,
        'f' | 't' | 'r' => 0.35,
        'm' | 'w' => 0.76,
        'M' | 'W' | '@' => 0.82,
        '-' | '\u{2013}' | '\u{2014}' => 0.33,
        c if is_ideographic(c) => 1.0,
        c if c.is_ascii_uppercase() => 0.66,
        c if c.is_ascii_digit() => 0.54,
        c if c.is_ascii() => 0.50,
        _ => 0.58,
    }
}

impl HeuristicTextMeasurer {
    fn advance_for(ch: char, style: &ResolvedTextStyle) -> f32 {
        let mut width = glyph_em_width(ch) * style.font_size;
        if style.font_weight >= 700 {
            width *= 1.03;
        }
        if style.italic {
            width *= 1.01;
        }
        width
    }
}

impl TextMeasurer for HeuristicTextMeasurer {
    fn measure(&self, text: &str, style: &ResolvedTextStyle, max_width: f32) -> LaidOutText {
        let chars: Vec<char> = text.chars().collect();
        let advances: Vec<f32> = chars
            .iter()
            .map(|&ch| Self::advance_for(ch, style))
            .collect();
        let line_height_px = style.line_height_px();

        let mut ranges: Vec<(usize, usize)> = Vec::new();
        let mut line_start = 0usize;
        let mut line_width = 0.0f32;
        let mut last_break: Option<usize> = None;
        for (i, &ch) in chars.iter().enumerate() {
            if ch == '\n' {
                ranges.push((line_start, i));
                line_start = i + 1;
                line_width = 0.0;
                last_break = None;
                continue;
            }
            let advance = advances[i];
            if i > line_start && !ch.is_whitespace() && line_width + advance > max_width {
                let break_at = match last_break {
                    Some(b) if b > line_start => b,
                    _ => i,
                };
                ranges.push((line_start, break_at - 1));
                line_start = break_at;
                last_break = None;
                line_width = advances[line_start..=i].iter().sum();
            } else {
                line_width += advance;
            }
            if ch.is_whitespace() {
                last_break = Some(i + 1);
            }
        }
        if line_start < chars.len() {
            ranges.push((line_start, chars.len() - 1));
        }

        let natural_ascent = NATURAL_ASCENT_RATIO * style.font_size;
        let natural_descent = NATURAL_DESCENT_RATIO * style.font_size;
        let styled_ascent = NATURAL_ASCENT_RATIO * line_height_px;
        let styled_descent = NATURAL_DESCENT_RATIO * line_height_px;

        let line_count = ranges.len();
        let mut lines = Vec::with_capacity(line_count);
        let mut top = 0.0f32;
        for (index, (first_char, last_char)) in ranges.into_iter().enumerate() {
            let ascent = if index == 0 && !style.apply_height_first_ascent {
                natural_ascent
            } else {
                styled_ascent
            };
            let descent = if index + 1 == line_count && !style.apply_height_last_descent {
                natural_descent
            } else {
                styled_descent
            };
            let height = ascent + descent;
            lines.push(LineMetric {
                left: 0.0,
                baseline_y: top + ascent,
                ascent,
                descent,
                height,
                first_char,
                last_char,
            });
            top += height;
        }

        LaidOutText {
            preferred_line_height: line_height_px,
            lines,
            advances,
        }
    }
}

/// A contiguous character range that must never be split when paginating.
///
/// Offsets are char indices; `end` is exclusive. Whitespace following a
/// token belongs to it for break purposes: a span's `end` extends to the
/// next span's `start` (or to the end of the text for the final span), so a
/// break at any `end` is legal and keeps inter-token whitespace on the
/// preceding page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenSpan {
    pub start: usize,
    pub end: usize,
}

pub(crate) fn is_ideographic(ch: char) -> bool {
    matches!(ch,
        '\u{3040}'..='\u{309F}'   // hiragana
        | '\u{30A0}'..='\u{30FF}' // katakana
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK unified
        | '\u{AC00}'..='\u{D7AF}' // hangul syllables
        | '\u{F900}'..='\u{FAFF}' // CJK compatibility
    )
}

/// Split a text block into ordered break-safe token spans.
///
/// A token is a maximal run of non-whitespace characters, except that
/// ideographic graphemes form one token each so breaks stay legal between
/// any two ideographs. Each span's `end` is then extended through the
/// whitespace that follows it. Pure function of its input.
pub fn build_token_spans(text: &str) -> Vec<TokenSpan> {
    let mut starts: Vec<usize> = Vec::new();
    let mut in_token = false;
    let mut char_pos = 0usize;
    for (_, grapheme) in text.grapheme_indices(true) {
        let grapheme_chars = grapheme.chars().count();
        let whitespace = grapheme.chars().all(char::is_whitespace);
        let ideographic = grapheme.chars().next().is_some_and(is_ideographic);
        if whitespace {
            in_token = false;
        } else if ideographic {
            starts.push(char_pos);
            in_token = false;
        } else if !in_token {
            starts.push(char_pos);
            in_token = true;
        }
        char_pos += grapheme_chars;
    }

    let total_chars = char_pos;
    let mut spans = Vec::with_capacity(starts.len());
    for (index, &start) in starts.iter().enumerate() {
        let end = starts.get(index + 1).copied().unwrap_or(total_chars);
        spans.push(TokenSpan { start, end });
    }
    spans
}

/// Lazily built layout state for one text block.
#[derive(Clone, Debug)]
pub(crate) struct BlockState {
    pub layout: LaidOutText,
    pub line_start_char: Vec<usize>,
    pub tokens: Vec<TokenSpan>,
    pub line_index: usize,
    /// Always `0` or some token span's `end`.
    pub char_offset: usize,
    pub token_pointer: usize,
    pub completed: bool,
    pub char_len: usize,
}

impl BlockState {
    pub fn build(
        text: &str,
        style: &ResolvedTextStyle,
        max_width: f32,
        measurer: &dyn TextMeasurer,
    ) -> Self {
        let layout = measurer.measure(text, style, max_width);
        let line_start_char = layout.lines.iter().map(|line| line.first_char).collect();
        Self {
            layout,
            line_start_char,
            tokens: build_token_spans(text),
            line_index: 0,
            char_offset: 0,
            token_pointer: 0,
            completed: false,
            char_len: text.chars().count(),
        }
    }

    pub fn apply_cursor(&mut self, state: TextCursorState) {
        self.char_offset = (state.text_offset as usize).min(self.char_len);
        self.token_pointer = (state.token_pointer as usize).min(self.tokens.len());
        let line_count = self.layout.lines.len();
        self.line_index = (state.line_index as usize).min(line_count.saturating_sub(1));
        self.completed = self.char_offset >= self.char_len;
    }

    pub fn at_end(&self) -> bool {
        self.completed || self.char_offset >= self.char_len
    }

    /// First line whose start is at or before `char_offset`.
    fn line_for_offset(&self, char_offset: usize) -> usize {
        self.line_start_char
            .partition_point(|&start| start <= char_offset)
            .saturating_sub(1)
    }
}

/// Substring by char indices, end exclusive.
fn char_slice(text: &str, start: usize, end: usize) -> String {
    text.chars().skip(start).take(end.saturating_sub(start)).collect()
}

struct TextPageDecision {
    text: String,
    accepted_chars: usize,
    tokens_in_page: usize,
    ends_block: bool,
    spacing_before: f32,
    spacing_after: f32,
}

/// Consumes document blocks in order and emits one page per call, applying
/// the fit/shrink algorithm. Owns the per-block states and the global
/// cursor; callers drive it strictly serially.
pub(crate) struct PageBuilder {
    blocks: Arc<[DocumentBlock]>,
    layout: LayoutOptions,
    measurer: Arc<dyn TextMeasurer>,
    states: Vec<Option<BlockState>>,
    block_index: usize,
    global_char_index: u64,
    global_word_index: u64,
    pending_text_state: Option<(usize, TextCursorState)>,
    degenerate_logged: bool,
}

impl PageBuilder {
    pub fn new(
        blocks: Arc<[DocumentBlock]>,
        layout: LayoutOptions,
        measurer: Arc<dyn TextMeasurer>,
    ) -> Self {
        let states = blocks.iter().map(|_| None).collect();
        Self {
            blocks,
            layout,
            measurer,
            states,
            block_index: 0,
            global_char_index: 0,
            global_word_index: 0,
            pending_text_state: None,
            degenerate_logged: false,
        }
    }

    pub fn blocks(&self) -> &Arc<[DocumentBlock]> {
        &self.blocks
    }

    pub fn layout(&self) -> &LayoutOptions {
        &self.layout
    }

    /// Characters the full document contributes to the global index.
    pub fn total_characters(&self) -> u64 {
        self.blocks.iter().map(DocumentBlock::char_len).sum()
    }

    /// Restore the cursor from a cache entry. Blocks before the cursor are
    /// never revisited; the inner text state is applied when its block is
    /// first measured.
    pub fn restore(&mut self, cursor: &Cursor) {
        self.block_index = (cursor.block_index as usize).min(self.blocks.len());
        self.global_char_index = cursor.global_char_index;
        self.global_word_index = cursor.global_word_index;
        self.pending_text_state = cursor
            .text_state
            .map(|state| (self.block_index, state));
    }

    /// The serializable position where the next page starts.
    pub fn cursor(&self) -> Cursor {
        let text_state = if let Some((block, pending)) = self.pending_text_state {
            if block == self.block_index {
                Some(pending)
            } else {
                None
            }
        } else {
            self.states
                .get(self.block_index)
                .and_then(Option::as_ref)
                .filter(|state| !state.at_end() && state.char_offset > 0)
                .map(|state| TextCursorState {
                    line_index: state.line_index as u32,
                    text_offset: state.char_offset as u32,
                    token_pointer: state.token_pointer as u32,
                })
        };
        Cursor {
            block_index: self.block_index as u32,
            global_char_index: self.global_char_index,
            global_word_index: self.global_word_index,
            text_state,
        }
    }

    /// Whether every block has been fully consumed.
    pub fn is_exhausted(&self) -> bool {
        self.block_index >= self.blocks.len()
    }

    /// Whether the layout cannot fit any line at all.
    pub fn layout_degenerate(&self) -> bool {
        self.layout.max_width <= 0.0 || self.layout.max_height <= MIN_PAGE_BOTTOM_MARGIN
    }

    /// Produce the next page, or `None` when the document is exhausted.
    pub fn next_page(&mut self) -> Option<PageContent> {
        if self.layout_degenerate() {
            if !self.degenerate_logged {
                self.degenerate_logged = true;
                log::warn!(
                    "layout degenerate ({}x{}): completing with no pages",
                    self.layout.max_width,
                    self.layout.max_height
                );
            }
            return None;
        }
        loop {
            let blocks = Arc::clone(&self.blocks);
            let block = blocks.get(self.block_index)?;
            match block {
                DocumentBlock::Image(image) => return Some(self.emit_image_page(image)),
                DocumentBlock::Text(text_block) => {
                    if text_block.text.is_empty() {
                        self.block_index += 1;
                        continue;
                    }
                    self.ensure_state(text_block);
                    let at_end = self.states[self.block_index]
                        .as_ref()
                        .map_or(true, BlockState::at_end);
                    if at_end {
                        self.block_index += 1;
                        continue;
                    }
                    match self.next_text_page(text_block) {
                        Some(page) => return Some(page),
                        None => {
                            self.block_index += 1;
                            continue;
                        }
                    }
                }
            }
        }
    }

    fn ensure_state(&mut self, block: &TextBlock) {
        let index = self.block_index;
        if self.states[index].is_some() {
            return;
        }
        let style = self.layout.resolve_text_style(block);
        let mut state = BlockState::build(
            &block.text,
            &style,
            self.layout.max_width,
            self.measurer.as_ref(),
        );
        if let Some((target, text_state)) = self.pending_text_state.take() {
            if target == index {
                state.apply_cursor(text_state);
            } else {
                self.pending_text_state = Some((target, text_state));
            }
        }
        self.states[index] = Some(state);
    }

    fn emit_image_page(&mut self, image: &ImageBlock) -> PageContent {
        let spacing_before = if self.block_index == 0 {
            0.0
        } else {
            image.spacing_before
        };
        let max_width = self.layout.max_width;
        let max_height = self.layout.max_height;
        let fitted_height = match (image.intrinsic_width, image.intrinsic_height) {
            (Some(width), Some(height)) if width > 0.0 && height > 0.0 => {
                height * (max_width / width)
            }
            _ => max_width * FALLBACK_IMAGE_ASPECT,
        };
        let available = max_height - spacing_before - image.spacing_after;
        let rendered_height = if available > 0.0 {
            fitted_height.min(available)
        } else {
            // Spacing alone exceeds the page; force emission clipped to the
            // full page height.
            fitted_height.min(max_height)
        }
        .max(1.0);

        let start_char = self.global_char_index;
        let start_word = self.global_word_index;
        let page = PageContent {
            blocks: smallvec![PageBlock::Image {
                bytes: image.bytes.clone(),
                rendered_height,
                spacing_before,
                spacing_after: image.spacing_after,
            }],
            chapter_index: image.chapter_index,
            start_char,
            end_char: start_char,
            start_word,
            end_word: start_word.saturating_sub(1),
        };
        self.global_char_index += 1;
        self.block_index += 1;
        page
    }

    fn next_text_page(&mut self, block: &TextBlock) -> Option<PageContent> {
        let style = self.layout.resolve_text_style(block);
        let max_height = self.layout.max_height;
        let line_height_px = style.line_height_px();
        let effective_max =
            max_height - page_bottom_margin(line_height_px, block.spacing_after, max_height);

        let index = self.block_index;
        let measurer = Arc::clone(&self.measurer);
        let max_width = self.layout.max_width;
        let first_block = index == 0;

        let decision = {
            let state = self.states[index].as_mut()?;
            if state.layout.lines.is_empty() {
                state.completed = true;
                return None;
            }
            let start_char = state.char_offset;
            let start_line = state.line_for_offset(start_char);
            state.line_index = start_line;
            let spacing_before = if start_char == 0 && !first_block {
                block.spacing_before
            } else {
                0.0
            };

            let last_line = state.layout.lines.len() - 1;
            let mut current_height = spacing_before;
            let mut accepted_lines = 0usize;
            let mut break_line = None;
            let mut line = start_line;
            loop {
                let metric = state.layout.lines[line];
                let trailing = if line == last_line {
                    block.spacing_after
                } else {
                    0.0
                };
                if accepted_lines > 0 && current_height + metric.height + trailing > effective_max
                {
                    break_line = Some(line);
                    break;
                }
                current_height += metric.height;
                accepted_lines += 1;
                if line == last_line {
                    break;
                }
                line += 1;
            }

            let token_ptr_excl = match break_line {
                Some(line) => Self::choose_break(state, line_height_px, line, start_line),
                // Reached the block's last line without overflow: flush the
                // whole remainder, trailing whitespace included.
                None => state.tokens.len(),
            };
            Self::shrink_to_fit(
                state,
                block,
                &style,
                measurer.as_ref(),
                max_width,
                effective_max,
                spacing_before,
                token_ptr_excl,
            )
        };

        let page = PageContent {
            blocks: smallvec![PageBlock::Text {
                text: decision.text,
                style,
                align: block.align,
                spacing_before: decision.spacing_before,
                spacing_after: decision.spacing_after,
            }],
            chapter_index: block.chapter_index,
            start_char: self.global_char_index,
            end_char: self.global_char_index + decision.accepted_chars as u64 - 1,
            start_word: self.global_word_index,
            end_word: if decision.tokens_in_page == 0 {
                self.global_word_index.saturating_sub(1)
            } else {
                self.global_word_index + decision.tokens_in_page as u64 - 1
            },
        };
        self.global_char_index += decision.accepted_chars as u64;
        self.global_word_index += decision.tokens_in_page as u64;
        if decision.ends_block {
            self.block_index += 1;
        }
        Some(page)
    }

    /// Pick the exclusive token pointer for a page that overflows at
    /// `overflow_line`. The returned pointer always advances past the
    /// block-state cursor.
    fn choose_break(
        state: &BlockState,
        line_height_px: f32,
        overflow_line: usize,
        start_line: usize,
    ) -> usize {
        let token_pointer = state.token_pointer;
        if state.tokens.is_empty() {
            return 0;
        }

        let margin = break_point_margin(line_height_px);
        let break_y = (state.layout.line_top(overflow_line) - margin).max(0.0);
        let left = state.layout.lines[overflow_line].left;
        let break_offset = state.layout.position_at_offset(left, break_y);
        let target = break_offset.max(state.line_start_char[start_line]);

        // Smallest token index whose end reaches the target.
        let mut token_ptr_excl = token_pointer;
        let mut safe_break = state.line_start_char[start_line];
        if token_pointer == 0 || state.tokens[token_pointer - 1].end < target {
            let relative = state.tokens[token_pointer..]
                .partition_point(|token| token.end < target);
            let index = (token_pointer + relative).min(state.tokens.len() - 1);
            token_ptr_excl = index + 1;
            safe_break = state.tokens[index].end;
        }

        if safe_break <= state.char_offset {
            // Force progress: take at least one whole token.
            token_ptr_excl = token_pointer + 1;
        }
        token_ptr_excl.min(state.tokens.len())
    }

    /// Reduce the candidate by whole tokens until the measured page fits,
    /// then emit and advance the block state. A single remaining token is
    /// emitted even when it overflows.
    #[allow(clippy::too_many_arguments)]
    fn shrink_to_fit(
        state: &mut BlockState,
        block: &TextBlock,
        style: &ResolvedTextStyle,
        measurer: &dyn TextMeasurer,
        max_width: f32,
        effective_max: f32,
        spacing_before: f32,
        mut token_ptr_excl: usize,
    ) -> TextPageDecision {
        let token_pointer = state.token_pointer;
        let start_char = state.char_offset;
        let candidate_end = |excl: usize| -> usize {
            if excl >= state.tokens.len() {
                state.char_len
            } else {
                state.tokens[excl - 1].end.max(start_char)
            }
        };

        let (end, text) = loop {
            let end = candidate_end(token_ptr_excl);
            let text = char_slice(&block.text, start_char, end);
            if token_ptr_excl <= token_pointer + 1 {
                break (end, text);
            }
            let measured = measurer.measure(&text, style, max_width);
            let trailing = if end >= state.char_len {
                block.spacing_after
            } else {
                0.0
            };
            let total = spacing_before + measured.total_height() + trailing;
            if total.ceil() <= effective_max {
                break (end, text);
            }
            token_ptr_excl -= 1;
        };

        let ends_block = end >= state.char_len;
        let tokens_in_page = token_ptr_excl.saturating_sub(token_pointer);
        let accepted_chars = end - start_char;

        state.char_offset = end;
        state.token_pointer = token_ptr_excl;
        state.line_index = state.line_for_offset(end);
        if ends_block {
            state.completed = true;
        }

        TextPageDecision {
            text,
            accepted_chars,
            tokens_in_page,
            ends_block,
            spacing_before,
            spacing_after: if ends_block { block.spacing_after } else { 0.0 },
        }
    }
}
