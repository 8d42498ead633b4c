use crate::error::IngestError;
use crate::models::{Chunk, ChunkType, HeadingRef};
use crate::structure::{BlockKind, ContentBlock, DocumentStructure, BOUNDARY_MIN_CONFIDENCE};
use sha2::{Digest, Sha256};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1_500,
            overlap_chars: 100,
            min_chars: 200,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig("max_chars must be positive".to_string()));
        }
        if self.min_chars > self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "min_chars {} exceeds max_chars {}",
                self.min_chars, self.max_chars
            )));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap_chars {} must be below max_chars {}",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Identity of the document being chunked.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSource<'a> {
    pub chatbot_id: &'a str,
    pub document_id: &'a str,
    pub document_title: &'a str,
    pub text: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentKind {
    Text,
    Code,
    List,
    Table,
    Image,
}

impl ContentKind {
    fn from_block(kind: &BlockKind) -> Option<Self> {
        match kind {
            BlockKind::Heading { .. } => None,
            BlockKind::Paragraph => Some(Self::Text),
            BlockKind::Code => Some(Self::Code),
            BlockKind::List => Some(Self::List),
            BlockKind::Table => Some(Self::Table),
            BlockKind::Image => Some(Self::Image),
        }
    }

    fn is_atomic(self) -> bool {
        matches!(self, Self::Code | Self::Table | Self::Image)
    }

    fn chunk_type(self) -> ChunkType {
        match self {
            Self::Text => ChunkType::Text,
            Self::Code => ChunkType::Code,
            Self::List => ChunkType::List,
            Self::Table => ChunkType::Table,
            Self::Image => ChunkType::Image,
        }
    }
}

/// A chunk under construction: a contiguous byte range of the source.
#[derive(Debug, Clone)]
struct Draft {
    start: usize,
    end: usize,
    kinds: Vec<(ContentKind, usize)>,
    context: Option<Vec<HeadingRef>>,
    /// Start of the run of headings after the last content block, if any.
    trailing_headings: Option<usize>,
    content_end: usize,
}

impl Draft {
    fn has_content(&self) -> bool {
        !self.kinds.is_empty()
    }
}

pub struct ChunkBuilder {
    config: ChunkingConfig,
}

impl ChunkBuilder {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Emits ordered, size-bounded chunks with heading context and overlap.
    pub fn build(
        &self,
        source: &ChunkSource<'_>,
        blocks: &[ContentBlock],
        structure: &DocumentStructure,
    ) -> Vec<Chunk> {
        let max_chars = structure
            .chunking_recommendation
            .optimal_chunk_size
            .clamp(self.config.min_chars.max(1), self.config.max_chars);

        let mut boundaries: Vec<usize> = structure
            .semantic_boundaries
            .iter()
            .filter(|boundary| boundary.confidence >= BOUNDARY_MIN_CONFIDENCE)
            .map(|boundary| boundary.position)
            .collect();
        boundaries.sort_unstable();

        let drafts = self.collect_drafts(source.text, blocks, &boundaries, max_chars);
        let drafts = merge_small_drafts(source.text, drafts, self.config.min_chars, max_chars);
        let chunks = self.finalize(source, drafts);

        debug!(
            document_id = source.document_id,
            chunk_count = chunks.len(),
            max_chars,
            "chunked document"
        );
        chunks
    }

    fn collect_drafts(
        &self,
        text: &str,
        blocks: &[ContentBlock],
        boundaries: &[usize],
        max_chars: usize,
    ) -> Vec<Draft> {
        let mut drafts = Vec::new();
        let mut current: Option<Draft> = None;
        let mut stack: Vec<HeadingRef> = Vec::new();
        let mut next_boundary = 0;

        for block in blocks {
            let mut crossed = false;
            while next_boundary < boundaries.len() && boundaries[next_boundary] <= block.start {
                crossed = true;
                next_boundary += 1;
            }
            if crossed && current.as_ref().is_some_and(Draft::has_content) {
                flush_carrying_headings(&mut current, &mut drafts, &stack);
            }

            let Some(kind) = ContentKind::from_block(&block.kind) else {
                if let BlockKind::Heading { level, title } = &block.kind {
                    if current
                        .as_ref()
                        .is_some_and(|draft| draft.has_content() && char_len(&text[draft.start..block.end]) > max_chars)
                    {
                        flush_carrying_headings(&mut current, &mut drafts, &stack);
                    }
                    stack.retain(|heading| heading.level < *level);
                    stack.push(HeadingRef { level: *level, title: title.clone() });
                    extend(&mut current, block.start, block.end, None, &stack);
                }
                continue;
            };

            let block_chars = char_len(block.text(text));
            let fits = |current: &Option<Draft>| {
                current
                    .as_ref()
                    .map_or(block_chars, |draft| char_len(&text[draft.start..block.end]))
                    <= max_chars
            };

            if fits(&current) {
                extend(&mut current, block.start, block.end, Some((kind, block_chars)), &stack);
                continue;
            }

            if current.as_ref().is_some_and(Draft::has_content) {
                flush_carrying_headings(&mut current, &mut drafts, &stack);
                if fits(&current) {
                    extend(&mut current, block.start, block.end, Some((kind, block_chars)), &stack);
                    continue;
                }
            }

            // `current` now holds nothing or only headings.
            if block_chars <= max_chars && kind.is_atomic() {
                flush(&mut current, &mut drafts, &stack);
                extend(&mut current, block.start, block.end, Some((kind, block_chars)), &stack);
                continue;
            }

            let mut first_limit = max_chars;
            if let Some(draft) = &current {
                let lead = char_len(&text[draft.start..block.start]);
                if lead < max_chars && max_chars - lead >= max_chars / 4 {
                    first_limit = max_chars - lead;
                } else {
                    flush(&mut current, &mut drafts, &stack);
                }
            }

            let pieces = split_range(text, block.start, block.end, first_limit, max_chars, kind == ContentKind::Code);
            let piece_count = pieces.len();
            for (position, (start, end)) in pieces.into_iter().enumerate() {
                let piece_chars = char_len(&text[start..end]);
                extend(&mut current, start, end, Some((kind, piece_chars)), &stack);
                if position + 1 < piece_count {
                    flush(&mut current, &mut drafts, &stack);
                }
            }
        }

        flush(&mut current, &mut drafts, &stack);
        drafts
    }

    fn finalize(&self, source: &ChunkSource<'_>, drafts: Vec<Draft>) -> Vec<Chunk> {
        let text = source.text;
        let mut chunks: Vec<Chunk> = Vec::with_capacity(drafts.len());
        let mut previous_body: Option<&str> = None;

        for (index, draft) in drafts.into_iter().enumerate() {
            let body = &text[draft.start..draft.end];
            let heading_context = draft.context.clone().unwrap_or_default();
            let overlap = previous_body
                .map(|previous| overlap_tail(previous, self.config.overlap_chars))
                .unwrap_or_default();

            let (content, overlap_len) = if overlap.is_empty() {
                (body.to_string(), 0)
            } else {
                (format!("{overlap}\n{body}"), overlap.len() + 1)
            };

            chunks.push(Chunk {
                id: make_chunk_id(source.document_id, index, body),
                chatbot_id: source.chatbot_id.to_string(),
                document_id: source.document_id.to_string(),
                content,
                overlap_len,
                chunk_type: infer_chunk_type(&draft.kinds),
                index,
                document_section: document_section(&heading_context, source.document_title),
                heading_context,
                size_chars: char_len(body),
                word_count: body.split_whitespace().count(),
            });
            previous_body = Some(body);
        }

        chunks
    }
}

fn extend(
    current: &mut Option<Draft>,
    start: usize,
    end: usize,
    kind: Option<(ContentKind, usize)>,
    stack: &[HeadingRef],
) {
    let draft = current.get_or_insert_with(|| Draft {
        start,
        end,
        kinds: Vec::new(),
        context: None,
        trailing_headings: None,
        content_end: start,
    });
    draft.end = end;
    match kind {
        Some(kind) => {
            if draft.context.is_none() {
                draft.context = Some(stack.to_vec());
            }
            draft.kinds.push(kind);
            draft.content_end = end;
            draft.trailing_headings = None;
        }
        None => {
            if draft.has_content() && draft.trailing_headings.is_none() {
                draft.trailing_headings = Some(start);
            }
        }
    }
}

fn flush(current: &mut Option<Draft>, drafts: &mut Vec<Draft>, stack: &[HeadingRef]) {
    if let Some(mut draft) = current.take() {
        if draft.context.is_none() {
            draft.context = Some(stack.to_vec());
        }
        drafts.push(draft);
    }
}

/// Flushes the current draft but keeps headings that trail its last content
/// block as the start of the next draft, so a heading stays with its section.
fn flush_carrying_headings(current: &mut Option<Draft>, drafts: &mut Vec<Draft>, stack: &[HeadingRef]) {
    let Some(mut draft) = current.take() else {
        return;
    };
    if let Some(heading_start) = draft.trailing_headings.take() {
        *current = Some(Draft {
            start: heading_start,
            end: draft.end,
            kinds: Vec::new(),
            context: None,
            trailing_headings: None,
            content_end: heading_start,
        });
        draft.end = draft.content_end;
    }
    if draft.context.is_none() {
        draft.context = Some(stack.to_vec());
    }
    drafts.push(draft);
}

/// Folds a chunk below `min_chars` into its predecessor when both sit under the
/// same headings and the result still fits.
fn merge_small_drafts(text: &str, drafts: Vec<Draft>, min_chars: usize, max_chars: usize) -> Vec<Draft> {
    let mut merged: Vec<Draft> = Vec::with_capacity(drafts.len());
    for draft in drafts {
        if let Some(previous) = merged.last_mut() {
            let small = char_len(&text[draft.start..draft.end]) < min_chars;
            if small
                && draft.has_content()
                && previous.context == draft.context
                && char_len(&text[previous.start..draft.end]) <= max_chars
            {
                previous.end = draft.end;
                previous.kinds.extend(draft.kinds);
                continue;
            }
        }
        merged.push(draft);
    }
    merged
}

/// Splits `[start, end)` into whitespace-trimmed pieces of at most `first_limit`
/// characters for the first piece and `limit` afterwards, preferring sentence ends
/// (or line ends for code).
fn split_range(
    text: &str,
    start: usize,
    end: usize,
    first_limit: usize,
    limit: usize,
    prefer_lines: bool,
) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut position = start;
    let mut current_limit = first_limit.max(1);

    while position < end {
        while let Some(ch) = text[position..end].chars().next() {
            if !ch.is_whitespace() {
                break;
            }
            position += ch.len_utf8();
        }
        if position >= end {
            break;
        }

        let window_end = text[position..end]
            .char_indices()
            .nth(current_limit)
            .map_or(end, |(offset, _)| position + offset);

        if window_end == end {
            pieces.push((position, end));
            break;
        }

        let window = &text[position..window_end];
        let cut = best_cut(window, prefer_lines).map_or(window_end, |offset| position + offset);
        let piece_end = position + text[position..cut].trim_end().len();
        pieces.push((position, piece_end));
        position = cut;
        current_limit = limit.max(1);
    }

    pieces
}

/// Byte offset just past the last preferred break in `window`, never 0.
fn best_cut(window: &str, prefer_lines: bool) -> Option<usize> {
    let last_newline = window.rfind('\n').filter(|offset| *offset > 0).map(|offset| offset + 1);
    if prefer_lines {
        if let Some(cut) = last_newline {
            return Some(cut);
        }
    }

    let chars: Vec<(usize, char)> = window.char_indices().collect();
    let sentence_end = chars.windows(2).rev().find_map(|pair| {
        let (offset, ch) = pair[0];
        let (_, next) = pair[1];
        (matches!(ch, '.' | '!' | '?' | ';') && next.is_whitespace()).then_some(offset + ch.len_utf8())
    });

    sentence_end
        .or(last_newline)
        .or_else(|| {
            window
                .char_indices()
                .rev()
                .find(|(offset, ch)| *offset > 0 && ch.is_whitespace())
                .map(|(offset, _)| offset)
        })
        .filter(|cut| *cut > 0)
}

/// Up to `max_chars` trailing characters of `body`, starting on a word boundary.
fn overlap_tail(body: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = body.chars().count();
    if total <= max_chars {
        return body.trim().to_string();
    }
    let start = body
        .char_indices()
        .nth(total - max_chars)
        .map_or(0, |(offset, _)| offset);
    let tail = &body[start..];
    let cut_mid_word = !body[..start].ends_with(char::is_whitespace);
    let tail = match (cut_mid_word, tail.find(char::is_whitespace)) {
        (true, Some(space)) => &tail[space..],
        _ => tail,
    };
    tail.trim().to_string()
}

/// Majority content type by characters; `Mixed` when nothing holds a strict majority.
fn infer_chunk_type(kinds: &[(ContentKind, usize)]) -> ChunkType {
    let mut totals: Vec<(ContentKind, usize)> = Vec::new();
    for (kind, size) in kinds {
        match totals.iter_mut().find(|(existing, _)| existing == kind) {
            Some((_, total)) => *total += size,
            None => totals.push((*kind, *size)),
        }
    }

    let overall: usize = totals.iter().map(|(_, size)| size).sum();
    match totals.iter().max_by_key(|(_, size)| *size) {
        None => ChunkType::Text,
        Some((kind, _)) if totals.len() == 1 => kind.chunk_type(),
        Some((kind, size)) if size * 2 > overall => kind.chunk_type(),
        Some(_) => ChunkType::Mixed,
    }
}

fn document_section(context: &[HeadingRef], document_title: &str) -> String {
    context
        .iter()
        .rev()
        .find(|heading| heading.level <= 2)
        .or_else(|| context.first())
        .map(|heading| heading.title.clone())
        .unwrap_or_else(|| document_title.to_string())
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn make_chunk_id(document_id: &str, index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update((index as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::StructureAnalyzer;

    fn build(text: &str, config: ChunkingConfig) -> Vec<Chunk> {
        let analyzer = StructureAnalyzer::new(8_000).expect("patterns compile");
        let structure = analyzer.fallback_structure(text, &config);
        let blocks = analyzer.parse_blocks(text);
        let source = ChunkSource {
            chatbot_id: "kb1",
            document_id: "doc-1",
            document_title: "Handbook",
            text,
        };
        ChunkBuilder::new(config).expect("valid config").build(&source, &blocks, &structure)
    }

    fn non_whitespace(text: &str) -> String {
        text.chars().filter(|c| !c.is_whitespace()).collect()
    }

    fn paragraph(sentence: &str, target_chars: usize) -> String {
        let mut out = String::new();
        while out.len() + sentence.len() + 1 <= target_chars {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(sentence);
        }
        out
    }

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        assert_eq!(normalize_whitespace(input), "A lot of spacing");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ChunkingConfig { max_chars: 100, overlap_chars: 100, min_chars: 10 };
        assert!(matches!(ChunkBuilder::new(config), Err(IngestError::InvalidChunkConfig(_))));
    }

    #[test]
    fn three_sections_become_three_chunks_with_owning_headings() {
        let body = paragraph("Each chunk keeps its heading.", 785);
        let text = format!("# Alpha\n\n{body}\n\n# Beta\n\n{body}\n\n# Gamma\n\n{body}\n");
        assert!(text.len() > 2_300);

        let chunks = build(&text, ChunkingConfig { max_chars: 800, overlap_chars: 50, min_chars: 100 });
        assert_eq!(chunks.len(), 3);
        for (chunk, title) in chunks.iter().zip(["Alpha", "Beta", "Gamma"]) {
            assert_eq!(chunk.heading_context, vec![HeadingRef { level: 1, title: title.to_string() }]);
            assert_eq!(chunk.document_section, title);
            assert!(chunk.size_chars <= 800);
        }
    }

    #[test]
    fn bodies_reconstruct_every_non_whitespace_character() {
        let long = paragraph("Sentences end here. Another one follows!", 2_000);
        let text = format!(
            "# Intro\n\nshort\n\n## Code\n\n```rust\nfn main() {{}}\n```\n\n{long}\n\n- a\n- b\n\n| x | y |\n|---|---|\n"
        );
        let chunks = build(&text, ChunkingConfig { max_chars: 300, overlap_chars: 40, min_chars: 50 });

        let rebuilt: String = chunks.iter().map(|chunk| chunk.body()).collect();
        assert_eq!(non_whitespace(&rebuilt), non_whitespace(&text));
        assert!(chunks.iter().all(|chunk| chunk.size_chars <= 300));
    }

    #[test]
    fn indices_are_contiguous_from_zero() {
        let long = paragraph("One more sentence for the pile.", 3_000);
        let chunks = build(&long, ChunkingConfig { max_chars: 400, overlap_chars: 20, min_chars: 50 });
        assert!(chunks.len() > 5);
        for (expected, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, expected);
        }
    }

    #[test]
    fn code_block_that_fits_is_kept_whole() {
        let code = (0..20).map(|i| format!("let value_{i} = {i};")).collect::<Vec<_>>().join("\n");
        let intro = paragraph("Intro text before the listing.", 200);
        let text = format!("{intro}\n\n```rust\n{code}\n```\n\nTrailing words.");
        let chunks = build(&text, ChunkingConfig { max_chars: 400, overlap_chars: 0, min_chars: 10 });

        let code_chunks: Vec<_> = chunks.iter().filter(|chunk| chunk.body().contains("let value_0")).collect();
        assert_eq!(code_chunks.len(), 1);
        assert!(code_chunks[0].body().contains("let value_19"));
        assert!(code_chunks[0].body().starts_with("```rust"));
        assert!(code_chunks[0].body().contains("let value_19 = 19;\n```"));
    }

    #[test]
    fn oversized_paragraph_is_split_at_sentences() {
        let long = paragraph("Short sentence here.", 1_000);
        let chunks = build(&long, ChunkingConfig { max_chars: 250, overlap_chars: 0, min_chars: 10 });
        assert!(chunks.len() >= 4);
        for chunk in &chunks {
            assert!(chunk.size_chars <= 250);
            assert!(chunk.body().ends_with('.'));
        }
    }

    #[test]
    fn heading_stack_prunes_equal_and_deeper_levels() {
        let filler = paragraph("Details about this part of the manual.", 200);
        let text = format!("# A\n\n{filler}\n\n## B\n\n{filler}\n\n### C\n\n{filler}\n\n## D\n\n{filler}");
        let chunks = build(&text, ChunkingConfig { max_chars: 260, overlap_chars: 0, min_chars: 10 });

        let last = chunks.last().expect("chunks produced");
        let titles: Vec<_> = last.heading_context.iter().map(|h| h.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "D"]);

        let deep = chunks.iter().find(|chunk| chunk.body().starts_with("### C")).expect("C chunk");
        let titles: Vec<_> = deep.heading_context.iter().map(|h| h.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[test]
    fn overlap_prefixes_previous_tail_without_counting_toward_size() {
        let long = paragraph("Overlap should carry context forward.", 900);
        let chunks = build(&long, ChunkingConfig { max_chars: 300, overlap_chars: 30, min_chars: 10 });
        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].overlap_len, 0);

        let second = &chunks[1];
        assert!(second.overlap_len > 0);
        let overlap = second.content[..second.overlap_len].trim();
        assert!(chunks[0].body().ends_with(overlap));
        assert!(overlap.chars().count() <= 30);
        assert_eq!(second.size_chars, second.body().chars().count());
    }

    #[test]
    fn chunk_type_follows_majority_content() {
        assert_eq!(infer_chunk_type(&[(ContentKind::Table, 300), (ContentKind::Text, 50)]), ChunkType::Table);
        assert_eq!(
            infer_chunk_type(&[(ContentKind::Code, 100), (ContentKind::Text, 100), (ContentKind::List, 100)]),
            ChunkType::Mixed
        );
        assert_eq!(infer_chunk_type(&[]), ChunkType::Text);
    }

    #[test]
    fn empty_document_yields_no_chunks() {
        assert!(build("   \n\n  ", ChunkingConfig::default()).is_empty());
    }
}
