//! Edges between the chunks of one document.
//!
//! Sibling and topical edges are written in both directions, so every `(a, b)`
//! has a matching `(b, a)`. Parent edges point from child to parent only.
//! Siblings share both heading level and parent, and each chunk links to at most
//! `sibling_window` following siblings, so the sibling pass stays linear.

use crate::keywords::{extract_keywords, jaccard};
use crate::models::{Chunk, Direction, Relationship, RelationshipType};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub const SEQUENTIAL_STRENGTH: f32 = 0.9;
pub const PARENT_STRENGTH: f32 = 0.8;
pub const SIBLING_STRENGTH: f32 = 0.6;
pub const DEFAULT_TOPICAL_THRESHOLD: f32 = 0.3;
pub const DEFAULT_SIBLING_WINDOW: usize = 4;

#[derive(Debug, Clone)]
pub struct RelationshipGraph {
    pub topical_threshold: f32,
    pub keywords_per_chunk: usize,
    pub sibling_window: usize,
    /// Documents with more chunks than this skip the sibling and topical passes.
    pub max_topical_chunks: usize,
}

impl Default for RelationshipGraph {
    fn default() -> Self {
        Self {
            topical_threshold: DEFAULT_TOPICAL_THRESHOLD,
            keywords_per_chunk: 15,
            sibling_window: DEFAULT_SIBLING_WINDOW,
            max_topical_chunks: 2_000,
        }
    }
}

impl RelationshipGraph {
    pub fn with_max_topical_chunks(mut self, max_topical_chunks: usize) -> Self {
        self.max_topical_chunks = max_topical_chunks;
        self
    }

    /// All edges for chunks of a single document, ordered by chunk index.
    pub fn build(&self, chunks: &[Chunk]) -> Vec<Relationship> {
        let mut ordered: Vec<&Chunk> = chunks.iter().collect();
        ordered.sort_by_key(|chunk| chunk.index);

        let parents = resolve_parents(&ordered);
        let mut edges = sequential_edges(&ordered);
        edges.extend(parent_edges(&ordered, &parents));

        if ordered.len() > self.max_topical_chunks {
            warn!(
                chunk_count = ordered.len(),
                limit = self.max_topical_chunks,
                "skipping sibling and topical relationships for oversized document"
            );
        } else {
            edges.extend(self.sibling_edges(&ordered, &parents));
            edges.extend(self.topical_edges(&ordered));
        }

        debug!(chunk_count = ordered.len(), edge_count = edges.len(), "relationship graph built");
        edges
    }

    /// Links each chunk to the next `sibling_window` chunks with the same level and parent.
    fn sibling_edges(&self, chunks: &[&Chunk], parents: &[Option<usize>]) -> Vec<Relationship> {
        let mut groups: BTreeMap<(u8, Option<usize>), Vec<usize>> = BTreeMap::new();
        for (position, chunk) in chunks.iter().enumerate() {
            let level = chunk.max_heading_level();
            if level > 0 {
                groups.entry((level, parents[position])).or_default().push(position);
            }
        }

        let mut edges = Vec::new();
        for members in groups.values() {
            for (offset, &position) in members.iter().enumerate() {
                for &sibling in members.iter().skip(offset + 1).take(self.sibling_window) {
                    let (chunk, sibling) = (chunks[position], chunks[sibling]);
                    edges.push(edge(chunk, sibling, RelationshipType::Hierarchical, Direction::Sibling, SIBLING_STRENGTH));
                    edges.push(edge(sibling, chunk, RelationshipType::Hierarchical, Direction::Sibling, SIBLING_STRENGTH));
                }
            }
        }
        edges
    }

    fn topical_edges(&self, chunks: &[&Chunk]) -> Vec<Relationship> {
        let keyword_sets: Vec<BTreeSet<String>> = chunks
            .iter()
            .map(|chunk| extract_keywords(chunk.body(), self.keywords_per_chunk).into_iter().collect())
            .collect();

        let mut edges = Vec::new();
        for i in 0..chunks.len() {
            for j in (i + 1)..chunks.len() {
                let similarity = jaccard(&keyword_sets[i], &keyword_sets[j]);
                if similarity <= self.topical_threshold {
                    continue;
                }
                let shared: Vec<String> = keyword_sets[i].intersection(&keyword_sets[j]).cloned().collect();
                for (from, to) in [(i, j), (j, i)] {
                    edges.push(Relationship {
                        chunk_id: chunks[from].id.clone(),
                        related_chunk_id: chunks[to].id.clone(),
                        relationship_type: RelationshipType::Topical,
                        direction: Direction::Bidirectional,
                        strength: similarity,
                        shared_keywords: shared.clone(),
                    });
                }
            }
        }
        edges
    }
}

fn edge(from: &Chunk, to: &Chunk, relationship_type: RelationshipType, direction: Direction, strength: f32) -> Relationship {
    Relationship {
        chunk_id: from.id.clone(),
        related_chunk_id: to.id.clone(),
        relationship_type,
        direction,
        strength,
        shared_keywords: Vec::new(),
    }
}

fn sequential_edges(chunks: &[&Chunk]) -> Vec<Relationship> {
    chunks
        .windows(2)
        .flat_map(|pair| {
            [
                edge(pair[0], pair[1], RelationshipType::Sequential, Direction::Next, SEQUENTIAL_STRENGTH),
                edge(pair[1], pair[0], RelationshipType::Sequential, Direction::Previous, SEQUENTIAL_STRENGTH),
            ]
        })
        .collect()
}

/// Position of each chunk's parent: the nearest preceding chunk with a strictly shallower max heading level.
fn resolve_parents(chunks: &[&Chunk]) -> Vec<Option<usize>> {
    let mut last_at_level: BTreeMap<u8, usize> = BTreeMap::new();
    let mut parents = Vec::with_capacity(chunks.len());

    for (position, chunk) in chunks.iter().enumerate() {
        let level = chunk.max_heading_level();
        if level == 0 {
            parents.push(None);
            continue;
        }
        parents.push(last_at_level.range(1..level).map(|(_, &candidate)| candidate).max());
        last_at_level.insert(level, position);
    }
    parents
}

fn parent_edges(chunks: &[&Chunk], parents: &[Option<usize>]) -> Vec<Relationship> {
    chunks
        .iter()
        .zip(parents)
        .filter_map(|(chunk, parent)| {
            parent.map(|parent| edge(chunk, chunks[parent], RelationshipType::Hierarchical, Direction::Parent, PARENT_STRENGTH))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkType, HeadingRef};

    fn chunk(index: usize, headings: &[(u8, &str)], content: &str) -> Chunk {
        Chunk {
            id: format!("c{index}"),
            chatbot_id: "kb".to_string(),
            document_id: "doc".to_string(),
            content: content.to_string(),
            overlap_len: 0,
            chunk_type: ChunkType::Text,
            index,
            heading_context: headings
                .iter()
                .map(|(level, title)| HeadingRef { level: *level, title: title.to_string() })
                .collect(),
            size_chars: content.len(),
            word_count: content.split_whitespace().count(),
            document_section: String::new(),
        }
    }

    fn has_edge(edges: &[Relationship], from: &str, to: &str, kind: RelationshipType, direction: Direction) -> bool {
        edges.iter().any(|edge| {
            edge.chunk_id == from
                && edge.related_chunk_id == to
                && edge.relationship_type == kind
                && edge.direction == direction
        })
    }

    #[test]
    fn sequential_edges_link_neighbours_both_ways() {
        let chunks = vec![
            chunk(0, &[(1, "A")], "apples"),
            chunk(1, &[(1, "B")], "bananas"),
            chunk(2, &[(1, "C")], "cherries"),
        ];
        let edges = RelationshipGraph::default().build(&chunks);

        assert!(has_edge(&edges, "c0", "c1", RelationshipType::Sequential, Direction::Next));
        assert!(has_edge(&edges, "c1", "c0", RelationshipType::Sequential, Direction::Previous));
        assert!(has_edge(&edges, "c2", "c1", RelationshipType::Sequential, Direction::Previous));
        assert!(!has_edge(&edges, "c0", "c2", RelationshipType::Sequential, Direction::Next));
    }

    #[test]
    fn parent_is_nearest_shallower_section() {
        let chunks = vec![
            chunk(0, &[(1, "Guide")], "overview"),
            chunk(1, &[(1, "Guide"), (2, "Install")], "install steps"),
            chunk(2, &[(1, "Guide"), (2, "Install"), (3, "Linux")], "linux notes"),
            chunk(3, &[(1, "Guide"), (2, "Usage")], "usage notes"),
        ];
        let edges = RelationshipGraph::default().build(&chunks);

        assert!(has_edge(&edges, "c2", "c1", RelationshipType::Hierarchical, Direction::Parent));
        assert!(has_edge(&edges, "c3", "c0", RelationshipType::Hierarchical, Direction::Parent));
        assert!(has_edge(&edges, "c1", "c3", RelationshipType::Hierarchical, Direction::Sibling));
        assert!(has_edge(&edges, "c3", "c1", RelationshipType::Hierarchical, Direction::Sibling));
        assert!(!edges
            .iter()
            .any(|edge| edge.chunk_id == "c0" && edge.direction == Direction::Parent));
    }

    #[test]
    fn sibling_and_topical_edges_are_symmetric() {
        let chunks = vec![
            chunk(0, &[(2, "One")], "kubernetes cluster ingress controller deployment"),
            chunk(1, &[(2, "Two")], "kubernetes cluster ingress controller scaling"),
            chunk(2, &[(2, "Three")], "billing invoices refunds"),
        ];
        let edges = RelationshipGraph::default().build(&chunks);

        for edge in edges
            .iter()
            .filter(|edge| edge.direction == Direction::Sibling || edge.relationship_type == RelationshipType::Topical)
        {
            assert!(
                has_edge(&edges, &edge.related_chunk_id, &edge.chunk_id, edge.relationship_type, edge.direction),
                "missing reciprocal for {} -> {}",
                edge.chunk_id,
                edge.related_chunk_id
            );
        }

        let topical: Vec<_> = edges
            .iter()
            .filter(|edge| edge.relationship_type == RelationshipType::Topical)
            .collect();
        assert_eq!(topical.len(), 2);
        assert!((topical[0].strength - 4.0 / 6.0).abs() < 1e-6);
        assert_eq!(topical[0].shared_keywords, vec!["cluster", "controller", "ingress", "kubernetes"]);
    }

    #[test]
    fn pairwise_passes_are_skipped_past_the_limit() {
        let chunks = vec![
            chunk(0, &[(2, "A")], "kubernetes cluster ingress"),
            chunk(1, &[(2, "B")], "kubernetes cluster ingress"),
        ];
        let edges = RelationshipGraph::default().with_max_topical_chunks(1).build(&chunks);
        assert!(edges.iter().all(|edge| edge.relationship_type == RelationshipType::Sequential));
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn topical_similarity_must_exceed_the_threshold() {
        let chunks = vec![
            chunk(0, &[], "kubernetes cluster ingress alpha bravo charlie delta"),
            chunk(1, &[], "kubernetes cluster ingress echo foxtrot golf"),
        ];
        let edges = RelationshipGraph::default().build(&chunks);
        assert!(edges.iter().all(|edge| edge.relationship_type != RelationshipType::Topical));

        let looser = RelationshipGraph { topical_threshold: 0.29, ..RelationshipGraph::default() };
        let edges = looser.build(&chunks);
        assert_eq!(
            edges.iter().filter(|edge| edge.relationship_type == RelationshipType::Topical).count(),
            2
        );
    }

    #[test]
    fn siblings_share_a_parent() {
        let chunks = vec![
            chunk(0, &[(1, "Server")], "server overview"),
            chunk(1, &[(1, "Server"), (2, "Ports")], "server ports"),
            chunk(2, &[(1, "Client")], "client overview"),
            chunk(3, &[(1, "Client"), (2, "Retries")], "client retries"),
        ];
        let edges = RelationshipGraph::default().build(&chunks);

        assert!(has_edge(&edges, "c0", "c2", RelationshipType::Hierarchical, Direction::Sibling));
        assert!(has_edge(&edges, "c3", "c2", RelationshipType::Hierarchical, Direction::Parent));
        assert!(!has_edge(&edges, "c1", "c3", RelationshipType::Hierarchical, Direction::Sibling));
    }

    #[test]
    fn flat_document_sibling_edges_stay_linear() {
        let chunks: Vec<Chunk> = (0..100)
            .map(|index| chunk(index, &[(2, "Section")], &format!("section{index}")))
            .collect();
        let edges = RelationshipGraph::default().build(&chunks);

        let siblings: Vec<&Relationship> = edges
            .iter()
            .filter(|edge| edge.direction == Direction::Sibling)
            .collect();
        // Each chunk links forward to at most four siblings, both directions stored.
        assert_eq!(siblings.len(), 2 * (4 * 96 + 3 + 2 + 1));
        for chunk in &chunks {
            let outgoing = siblings.iter().filter(|edge| edge.chunk_id == chunk.id).count();
            assert!(outgoing <= 2 * DEFAULT_SIBLING_WINDOW);
        }
        assert!(has_edge(&edges, "c10", "c14", RelationshipType::Hierarchical, Direction::Sibling));
        assert!(!has_edge(&edges, "c10", "c15", RelationshipType::Hierarchical, Direction::Sibling));
    }
}
