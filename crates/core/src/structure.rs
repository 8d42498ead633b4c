//! Structural analysis of Markdown-like document text.
//!
//! [`StructureAnalyzer::parse_blocks`] is a deterministic line scanner producing
//! content blocks with byte ranges into the source. [`StructureAnalyzer::analyze`]
//! asks the text capability for document type, headings and semantic boundaries,
//! and falls back to a heading scan when that fails.

use crate::chunking::ChunkingConfig;
use crate::error::IngestError;
use crate::llm::{complete_json, truncate_chars, TextCapability};
use crate::models::DocumentMetadata;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnError, VecSkipError};
use tracing::{debug, warn};

const HEADING_PATTERN: &str = r"^(#{1,6})[ \t]+(.+?)[ \t]*#*[ \t]*$";
const LIST_ITEM_PATTERN: &str = r"^[ \t]*(?:[-*+]|\d{1,3}[.)])[ \t]+\S";
const IMAGE_PATTERN: &str = r"^[ \t]*!\[[^\]]*\]\([^)]*\)[ \t]*$";

/// Boundaries below this confidence are reported but not used for splitting.
pub const BOUNDARY_MIN_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Heading { level: u8, title: String },
    Paragraph,
    Code,
    List,
    Table,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentBlock {
    pub kind: BlockKind,
    /// Byte range into the analysed text.
    pub start: usize,
    pub end: usize,
}

impl ContentBlock {
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeadingEntry {
    pub level: u8,
    pub title: String,
    pub position: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SemanticBoundary {
    pub position: usize,
    pub reason: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkingRecommendation {
    pub optimal_chunk_size: usize,
    pub split_strategy: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    Llm,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentStructure {
    pub document_type: String,
    pub heading_hierarchy: Vec<HeadingEntry>,
    pub semantic_boundaries: Vec<SemanticBoundary>,
    pub chunking_recommendation: ChunkingRecommendation,
    pub source: AnalysisSource,
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StructureReply {
    #[serde_as(deserialize_as = "DefaultOnError")]
    document_type: String,
    #[serde_as(deserialize_as = "VecSkipError<_>")]
    heading_hierarchy: Vec<ReplyHeading>,
    #[serde_as(deserialize_as = "VecSkipError<_>")]
    semantic_boundaries: Vec<ReplyBoundary>,
    #[serde_as(deserialize_as = "DefaultOnError")]
    chunking_recommendation: Option<ReplyRecommendation>,
}

#[derive(Debug, Deserialize)]
struct ReplyHeading {
    level: u8,
    title: String,
    #[serde(default)]
    position: usize,
}

#[derive(Debug, Deserialize)]
struct ReplyBoundary {
    position: usize,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ReplyRecommendation {
    #[serde(default)]
    optimal_chunk_size: Option<usize>,
    #[serde(default)]
    split_strategy: Option<String>,
}

const STRUCTURE_SYSTEM_PROMPT: &str = "You analyse document structure for retrieval chunking. \
Reply with a single JSON object and nothing else.";

pub struct StructureAnalyzer {
    heading_re: Regex,
    list_item_re: Regex,
    image_re: Regex,
    max_prompt_chars: usize,
}

impl StructureAnalyzer {
    pub fn new(max_prompt_chars: usize) -> Result<Self, IngestError> {
        Ok(Self {
            heading_re: Regex::new(HEADING_PATTERN)?,
            list_item_re: Regex::new(LIST_ITEM_PATTERN)?,
            image_re: Regex::new(IMAGE_PATTERN)?,
            max_prompt_chars,
        })
    }

    /// Delegates to the text capability and validates its reply; never fails.
    pub async fn analyze(
        &self,
        text: &str,
        metadata: &DocumentMetadata,
        config: &ChunkingConfig,
        llm: &dyn TextCapability,
    ) -> DocumentStructure {
        let excerpt = truncate_chars(text, self.max_prompt_chars);
        let prompt = structure_prompt(excerpt, metadata, text.len() > excerpt.len());

        match complete_json::<StructureReply>(llm, STRUCTURE_SYSTEM_PROMPT, &prompt).await {
            Ok(reply) => {
                let structure = self.validate_reply(reply, text, excerpt.len(), config);
                debug!(
                    title = %metadata.title,
                    headings = structure.heading_hierarchy.len(),
                    boundaries = structure.semantic_boundaries.len(),
                    "structure analysed by llm"
                );
                structure
            }
            Err(error) => {
                warn!(title = %metadata.title, %error, "structure analysis fell back to heading scan");
                self.fallback_structure(text, config)
            }
        }
    }

    /// Deterministic analysis: Markdown headings, with every level 1-2 heading as a boundary.
    pub fn fallback_structure(&self, text: &str, config: &ChunkingConfig) -> DocumentStructure {
        let heading_hierarchy = self.scan_headings(text);
        let semantic_boundaries = heading_boundaries(&heading_hierarchy);
        let document_type = if heading_hierarchy.is_empty() {
            "plain_text"
        } else {
            "markdown"
        };

        DocumentStructure {
            document_type: document_type.to_string(),
            heading_hierarchy,
            semantic_boundaries,
            chunking_recommendation: ChunkingRecommendation {
                optimal_chunk_size: config.max_chars,
                split_strategy: "heading".to_string(),
            },
            source: AnalysisSource::Fallback,
        }
    }

    pub fn scan_headings(&self, text: &str) -> Vec<HeadingEntry> {
        self.parse_blocks(text)
            .into_iter()
            .filter_map(|block| match block.kind {
                BlockKind::Heading { level, title } => Some(HeadingEntry {
                    level,
                    title,
                    position: block.start,
                }),
                _ => None,
            })
            .collect()
    }

    /// Splits text into headings, fenced code, tables, lists, images and paragraphs.
    /// Blank lines separate blocks and belong to none of them.
    pub fn parse_blocks(&self, text: &str) -> Vec<ContentBlock> {
        let lines = line_spans(text);
        let mut blocks = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let (start, end) = lines[i];
            let line = &text[start..end];
            let trimmed = line.trim();

            if trimmed.is_empty() {
                i += 1;
                continue;
            }

            if let Some(fence) = fence_marker(trimmed) {
                let mut j = i + 1;
                while j < lines.len() && !text[lines[j].0..lines[j].1].trim_start().starts_with(fence) {
                    j += 1;
                }
                let last = j.min(lines.len() - 1);
                blocks.push(ContentBlock { kind: BlockKind::Code, start, end: lines[last].1 });
                i = last + 1;
                continue;
            }

            if let Some(captures) = self.heading_re.captures(line) {
                let level = captures.get(1).map_or(1, |m| m.as_str().len()) as u8;
                let title = captures.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
                blocks.push(ContentBlock { kind: BlockKind::Heading { level, title }, start, end });
                i += 1;
                continue;
            }

            if self.image_re.is_match(line) {
                blocks.push(ContentBlock { kind: BlockKind::Image, start, end });
                i += 1;
                continue;
            }

            if trimmed.starts_with('|') {
                let j = self.extend_while(text, &lines, i, |_, candidate| candidate.trim_start().starts_with('|'));
                blocks.push(ContentBlock { kind: BlockKind::Table, start, end: lines[j].1 });
                i = j + 1;
                continue;
            }

            if self.list_item_re.is_match(line) {
                let j = self.extend_while(text, &lines, i, |analyzer, candidate| {
                    analyzer.list_item_re.is_match(candidate)
                        || (candidate.starts_with([' ', '\t']) && !candidate.trim().is_empty())
                });
                blocks.push(ContentBlock { kind: BlockKind::List, start, end: lines[j].1 });
                i = j + 1;
                continue;
            }

            let j = self.extend_while(text, &lines, i, |analyzer, candidate| {
                let candidate_trimmed = candidate.trim();
                !candidate_trimmed.is_empty()
                    && fence_marker(candidate_trimmed).is_none()
                    && !analyzer.heading_re.is_match(candidate)
                    && !analyzer.image_re.is_match(candidate)
                    && !candidate_trimmed.starts_with('|')
                    && !analyzer.list_item_re.is_match(candidate)
            });
            blocks.push(ContentBlock { kind: BlockKind::Paragraph, start, end: lines[j].1 });
            i = j + 1;
        }

        blocks
    }

    /// Index of the last line, starting after `first`, for which `accept` holds contiguously.
    fn extend_while<F>(&self, text: &str, lines: &[(usize, usize)], first: usize, accept: F) -> usize
    where
        F: Fn(&Self, &str) -> bool,
    {
        let mut last = first;
        while last + 1 < lines.len() {
            let (start, end) = lines[last + 1];
            if !accept(self, &text[start..end]) {
                break;
            }
            last += 1;
        }
        last
    }

    fn validate_reply(
        &self,
        reply: StructureReply,
        text: &str,
        analysed_len: usize,
        config: &ChunkingConfig,
    ) -> DocumentStructure {
        let fallback = self.fallback_structure(text, config);
        let clamp_position = |position: usize| floor_char_boundary(text, position.min(text.len()));

        let mut heading_hierarchy: Vec<HeadingEntry> = reply
            .heading_hierarchy
            .into_iter()
            .filter(|heading| !heading.title.trim().is_empty())
            .map(|heading| HeadingEntry {
                level: heading.level.clamp(1, 6),
                title: heading.title.trim().to_string(),
                position: clamp_position(heading.position),
            })
            .collect();

        let mut semantic_boundaries: Vec<SemanticBoundary> = reply
            .semantic_boundaries
            .into_iter()
            .map(|boundary| SemanticBoundary {
                position: clamp_position(boundary.position),
                reason: boundary.reason.filter(|r| !r.trim().is_empty()).unwrap_or_else(|| "llm".to_string()),
                confidence: boundary.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            })
            .collect();

        if heading_hierarchy.is_empty() {
            heading_hierarchy = fallback.heading_hierarchy.clone();
        }

        if semantic_boundaries.is_empty() {
            semantic_boundaries = fallback.semantic_boundaries.clone();
        } else if analysed_len < text.len() {
            // The capability only saw a prefix; keep the scanned boundaries past it.
            semantic_boundaries.extend(
                fallback
                    .semantic_boundaries
                    .iter()
                    .filter(|boundary| boundary.position >= analysed_len)
                    .cloned(),
            );
        }

        semantic_boundaries.sort_by_key(|boundary| boundary.position);
        semantic_boundaries.dedup_by_key(|boundary| boundary.position);
        heading_hierarchy.sort_by_key(|heading| heading.position);

        let recommendation = reply.chunking_recommendation;
        let optimal_chunk_size = recommendation
            .as_ref()
            .and_then(|r| r.optimal_chunk_size)
            .unwrap_or(config.max_chars)
            .clamp(config.min_chars.max(1), config.max_chars.max(1));
        let split_strategy = recommendation
            .and_then(|r| r.split_strategy)
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "semantic".to_string());

        let document_type = if reply.document_type.trim().is_empty() {
            fallback.document_type
        } else {
            reply.document_type.trim().to_lowercase()
        };

        DocumentStructure {
            document_type,
            heading_hierarchy,
            semantic_boundaries,
            chunking_recommendation: ChunkingRecommendation {
                optimal_chunk_size,
                split_strategy,
            },
            source: AnalysisSource::Llm,
        }
    }
}

fn heading_boundaries(headings: &[HeadingEntry]) -> Vec<SemanticBoundary> {
    headings
        .iter()
        .filter(|heading| heading.level <= 2)
        .map(|heading| SemanticBoundary {
            position: heading.position,
            reason: format!("heading level {}: {}", heading.level, heading.title),
            confidence: 0.9,
        })
        .collect()
}

fn structure_prompt(excerpt: &str, metadata: &DocumentMetadata, truncated: bool) -> String {
    let note = if truncated {
        "\n(The document is truncated; analyse the visible part.)"
    } else {
        ""
    };
    format!(
        "Document title: {title}\nSource type: {source}\nLength: {bytes} bytes{note}\n\n\
Return JSON with keys:\n\
- document_type: string (e.g. manual, faq, policy, tutorial, reference)\n\
- heading_hierarchy: [{{\"level\": 1-6, \"title\": string, \"position\": byte offset}}]\n\
- semantic_boundaries: [{{\"position\": byte offset, \"reason\": string, \"confidence\": 0.0-1.0}}]\n\
- chunking_recommendation: {{\"optimal_chunk_size\": characters, \"split_strategy\": \"heading\"|\"semantic\"|\"paragraph\"}}\n\n\
DOCUMENT:\n{excerpt}",
        title = metadata.title,
        source = metadata.source_type,
        bytes = metadata.byte_length,
    )
}

fn fence_marker(trimmed_line: &str) -> Option<&'static str> {
    if trimmed_line.starts_with("```") {
        Some("```")
    } else if trimmed_line.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

/// Byte spans of each line, excluding the line terminator.
fn line_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (index, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            let end = if index > start && text.as_bytes()[index - 1] == b'\r' {
                index - 1
            } else {
                index
            };
            spans.push((start, end));
            start = index + 1;
        }
    }
    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

pub(crate) fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use crate::llm::DisabledLlm;
    use async_trait::async_trait;

    struct ScriptedLlm(&'static str);

    #[async_trait]
    impl TextCapability for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, CapabilityError> {
            Ok(self.0.to_string())
        }
    }

    fn analyzer() -> StructureAnalyzer {
        StructureAnalyzer::new(8_000).expect("patterns compile")
    }

    const SAMPLE: &str = "# Guide\n\nIntro paragraph.\n\n## Install\n\n- step one\n- step two\n  continued\n\n```sh\ncargo build\n\n# not a heading\n```\n\n| a | b |\n|---|---|\n\n![diagram](img.png)\n\n### Deep\ntext";

    #[test]
    fn blocks_cover_each_markdown_construct() {
        let blocks = analyzer().parse_blocks(SAMPLE);
        let kinds: Vec<_> = blocks
            .iter()
            .map(|block| match &block.kind {
                BlockKind::Heading { level, .. } => format!("h{level}"),
                BlockKind::Paragraph => "p".to_string(),
                BlockKind::Code => "code".to_string(),
                BlockKind::List => "list".to_string(),
                BlockKind::Table => "table".to_string(),
                BlockKind::Image => "img".to_string(),
            })
            .collect();

        assert_eq!(kinds, vec!["h1", "p", "h2", "list", "code", "table", "img", "h3", "p"]);
        assert!(blocks[4].text(SAMPLE).contains("# not a heading"));
        assert!(blocks[3].text(SAMPLE).ends_with("continued"));
    }

    #[test]
    fn unterminated_fence_runs_to_end_of_text() {
        let text = "```\nfn main() {}\n";
        let blocks = analyzer().parse_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind, BlockKind::Code);
    }

    #[test]
    fn fallback_marks_top_level_headings_as_boundaries() {
        let structure = analyzer().fallback_structure(SAMPLE, &ChunkingConfig::default());
        assert_eq!(structure.source, AnalysisSource::Fallback);
        assert_eq!(structure.heading_hierarchy.len(), 3);
        assert_eq!(structure.semantic_boundaries.len(), 2);
        assert_eq!(structure.semantic_boundaries[0].position, 0);
        assert_eq!(structure.document_type, "markdown");
    }

    #[tokio::test]
    async fn disabled_capability_uses_fallback() {
        let structure = analyzer()
            .analyze(SAMPLE, &DocumentMetadata::default(), &ChunkingConfig::default(), &DisabledLlm)
            .await;
        assert_eq!(structure.source, AnalysisSource::Fallback);
    }

    #[tokio::test]
    async fn llm_reply_is_clamped_and_bad_entries_skipped() {
        let llm = ScriptedLlm(
            r#"{"document_type": "Manual",
                "heading_hierarchy": [{"level": 9, "title": "Guide", "position": 0}, {"level": "x"}],
                "semantic_boundaries": [{"position": 99999, "confidence": 4.0}, {"reason": "no position"}],
                "chunking_recommendation": {"optimal_chunk_size": 10, "split_strategy": "Semantic"}}"#,
        );
        let config = ChunkingConfig::default();
        let structure = analyzer().analyze(SAMPLE, &DocumentMetadata::default(), &config, &llm).await;

        assert_eq!(structure.source, AnalysisSource::Llm);
        assert_eq!(structure.document_type, "manual");
        assert_eq!(structure.heading_hierarchy, vec![HeadingEntry { level: 6, title: "Guide".to_string(), position: 0 }]);
        assert_eq!(structure.semantic_boundaries.len(), 1);
        assert_eq!(structure.semantic_boundaries[0].position, SAMPLE.len());
        assert_eq!(structure.semantic_boundaries[0].confidence, 1.0);
        assert_eq!(structure.chunking_recommendation.optimal_chunk_size, config.min_chars);
        assert_eq!(structure.chunking_recommendation.split_strategy, "semantic");
    }
}
