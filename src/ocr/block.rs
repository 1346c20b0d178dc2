//! Typed view of an OCR provider's block graph.
//!
//! Providers return a flat list of blocks linked by id-based parent/child
//! edges. We materialize that list as an indexed map with typed accessors, so
//! structure reconstruction never falls back to stringly-typed field lookups.

use std::collections::HashMap;

use schemars::JsonSchema;

use crate::prelude::*;

/// What a block represents.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockKind {
    Page,
    Line,
    Word,
    KeyValueSet,
    Table,
    Cell,
    SelectionElement,
    Other,
}

/// Whether a `KeyValueSet` block is the key side or the value side.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyValueRole {
    Key,
    Value,
}

/// The kinds of relationship edges we follow.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipKind {
    Child,
    Value,
    Other,
}

/// An edge from one block to a set of others.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Relationship {
    pub kind: RelationshipKind,
    pub ids: Vec<String>,
}

/// One recognized element: a line, word, table, cell, or key/value node.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Block {
    pub id: String,
    pub kind: BlockKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Provider confidence on the 0-100 scale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_value_role: Option<KeyValueRole>,

    /// For selection elements: is the checkbox selected?
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,

    /// 1-based cell geometry, present on `Cell` blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_span: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_span: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Relationship>,
}

impl Block {
    /// A bare block with no text or geometry, for building graphs in tests
    /// and converters.
    pub fn new(id: impl Into<String>, kind: BlockKind) -> Self {
        Self {
            id: id.into(),
            kind,
            text: None,
            confidence: None,
            key_value_role: None,
            selected: None,
            row_index: None,
            column_index: None,
            row_span: None,
            column_span: None,
            relationships: vec![],
        }
    }
}

/// The full block graph, indexed by id, preserving input order.
pub struct BlockMap {
    order: Vec<String>,
    by_id: HashMap<String, Block>,
}

impl BlockMap {
    pub fn new(blocks: Vec<Block>) -> Self {
        let mut order = Vec::with_capacity(blocks.len());
        let mut by_id = HashMap::with_capacity(blocks.len());
        for block in blocks {
            // First occurrence wins if a provider ever repeats an id.
            if !by_id.contains_key(&block.id) {
                order.push(block.id.clone());
                by_id.insert(block.id.clone(), block);
            }
        }
        Self { order, by_id }
    }

    pub fn get(&self, id: &str) -> Option<&Block> {
        self.by_id.get(id)
    }

    /// All blocks, in original input order.
    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    /// Resolve a block's `Child` edges, skipping ids the provider never sent.
    pub fn children_of<'a>(&'a self, block: &'a Block) -> impl Iterator<Item = &'a Block> {
        block
            .relationships
            .iter()
            .filter(|rel| rel.kind == RelationshipKind::Child)
            .flat_map(|rel| rel.ids.iter())
            .filter_map(|id| self.get(id))
    }

    /// Follow a key block's `Value` edge to its value block, if any.
    pub fn value_of(&self, key_block: &Block) -> Option<&Block> {
        key_block
            .relationships
            .iter()
            .filter(|rel| rel.kind == RelationshipKind::Value)
            .flat_map(|rel| rel.ids.iter())
            .find_map(|id| self.get(id))
    }

    /// Join a block's child words into text. Selection elements render as
    /// `[X]` or `[ ]`.
    pub fn collect_text(&self, block: &Block) -> String {
        let mut parts = vec![];
        for child in self.children_of(block) {
            match child.kind {
                BlockKind::Word => {
                    if let Some(text) = &child.text {
                        parts.push(text.clone());
                    }
                }
                BlockKind::SelectionElement => {
                    parts.push(if child.selected == Some(true) {
                        "[X]".to_owned()
                    } else {
                        "[ ]".to_owned()
                    });
                }
                _ => {}
            }
        }
        parts.join(" ")
    }
}

/// One resolved key/value pair from the form-extraction blocks.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,

    /// Confidence of the key block, 0-100.
    pub confidence: f64,
}

/// One resolved table cell.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TableCell {
    pub row_index: Option<u32>,
    pub column_index: Option<u32>,
    pub row_span: Option<u32>,
    pub column_span: Option<u32>,
    pub text: String,
    pub confidence: Option<f64>,
}

/// One extracted table, with a dense grid for positional access.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TableExtract {
    pub cells: Vec<TableCell>,

    /// `rows x columns` grid with each cell's text at `[row-1][col-1]`.
    /// Cells missing row/column indices are present in `cells` but not here.
    pub grid: Vec<Vec<String>>,
}

/// Summary of line-level OCR confidence.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct OcrConfidence {
    /// Average confidence across line blocks, 0-100, rounded to 2 decimals.
    /// `None` when the document had no lines.
    pub average: Option<f64>,

    pub line_count: usize,
}

/// Everything we reconstruct from the flat block graph.
pub struct NormalizedBlocks {
    pub full_text: String,
    pub key_value_pairs: Vec<KeyValuePair>,

    /// Best-confidence-wins map: when the same key text occurs more than
    /// once, the pairing with higher confidence is kept.
    pub key_values_best: HashMap<String, String>,

    pub tables: Vec<TableExtract>,
    pub confidence: OcrConfidence,
}

/// Reconstruct text, key/value pairs, tables, and the confidence summary
/// from a block graph.
pub fn normalize_blocks(blocks: &BlockMap) -> NormalizedBlocks {
    // Full text: every line's text, newline-joined, in original order.
    let full_text = blocks
        .iter()
        .filter(|b| b.kind == BlockKind::Line)
        .filter_map(|b| b.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n");

    // Key/value pairs: resolve each KEY block's text and follow its value
    // edge. Pairs with an empty key are dropped.
    let mut key_value_pairs = vec![];
    for block in blocks.iter() {
        if block.kind != BlockKind::KeyValueSet
            || block.key_value_role != Some(KeyValueRole::Key)
        {
            continue;
        }
        let key = blocks.collect_text(block);
        if key.is_empty() {
            continue;
        }
        let value = blocks
            .value_of(block)
            .map(|value_block| blocks.collect_text(value_block))
            .unwrap_or_default();
        key_value_pairs.push(KeyValuePair {
            key,
            value,
            confidence: block.confidence.unwrap_or(0.0),
        });
    }

    let mut best: HashMap<String, (f64, String)> = HashMap::new();
    for pair in &key_value_pairs {
        match best.get(&pair.key) {
            Some((confidence, _)) if *confidence >= pair.confidence => {}
            _ => {
                best.insert(pair.key.clone(), (pair.confidence, pair.value.clone()));
            }
        }
    }
    let key_values_best = best
        .into_iter()
        .map(|(key, (_, value))| (key, value))
        .collect();

    let tables = blocks
        .iter()
        .filter(|b| b.kind == BlockKind::Table)
        .map(|table| extract_table(blocks, table))
        .collect();

    // Line-confidence summary.
    let line_confidences = blocks
        .iter()
        .filter(|b| b.kind == BlockKind::Line)
        .filter_map(|b| b.confidence)
        .collect::<Vec<_>>();
    let line_count = blocks.iter().filter(|b| b.kind == BlockKind::Line).count();
    let average = if line_confidences.is_empty() {
        None
    } else {
        let mean = line_confidences.iter().sum::<f64>() / line_confidences.len() as f64;
        Some((mean * 100.0).round() / 100.0)
    };

    NormalizedBlocks {
        full_text,
        key_value_pairs,
        key_values_best,
        tables,
        confidence: OcrConfidence {
            average,
            line_count,
        },
    }
}

/// Resolve a table block's cells and materialize the dense grid.
fn extract_table(blocks: &BlockMap, table: &Block) -> TableExtract {
    let cells = blocks
        .children_of(table)
        .filter(|child| child.kind == BlockKind::Cell)
        .map(|cell| TableCell {
            row_index: cell.row_index,
            column_index: cell.column_index,
            row_span: cell.row_span,
            column_span: cell.column_span,
            text: blocks.collect_text(cell),
            confidence: cell.confidence,
        })
        .collect::<Vec<_>>();

    let rows = cells
        .iter()
        .filter_map(|c| c.row_index)
        .max()
        .unwrap_or(0) as usize;
    let columns = cells
        .iter()
        .filter_map(|c| c.column_index)
        .max()
        .unwrap_or(0) as usize;
    let mut grid = vec![vec![String::new(); columns]; rows];
    for cell in &cells {
        let (Some(row), Some(column)) = (cell.row_index, cell.column_index) else {
            continue;
        };
        if row >= 1 && column >= 1 {
            grid[row as usize - 1][column as usize - 1] = cell.text.clone();
        }
    }

    TableExtract { cells, grid }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(id: &str, text: &str) -> Block {
        Block {
            text: Some(text.to_owned()),
            ..Block::new(id, BlockKind::Word)
        }
    }

    fn child_rel(ids: &[&str]) -> Relationship {
        Relationship {
            kind: RelationshipKind::Child,
            ids: ids.iter().map(|id| (*id).to_owned()).collect(),
        }
    }

    #[test]
    fn line_text_resolves_child_words_in_order() {
        let mut line = Block::new("line-1", BlockKind::Line);
        line.relationships = vec![child_rel(&["w1", "w2"])];
        let map = BlockMap::new(vec![line, word("w1", "HELLO"), word("w2", "WORLD")]);
        let line = map.get("line-1").unwrap();
        assert_eq!(map.collect_text(line), "HELLO WORLD");
    }

    #[test]
    fn selection_elements_render_as_checkboxes() {
        let mut key = Block::new("k", BlockKind::KeyValueSet);
        key.relationships = vec![child_rel(&["w1", "sel-1", "sel-2"])];
        let mut selected = Block::new("sel-1", BlockKind::SelectionElement);
        selected.selected = Some(true);
        let unselected = Block::new("sel-2", BlockKind::SelectionElement);
        let map = BlockMap::new(vec![key, word("w1", "INSURED"), selected, unselected]);
        let key = map.get("k").unwrap();
        assert_eq!(map.collect_text(key), "INSURED [X] [ ]");
    }

    #[test]
    fn missing_child_ids_are_skipped() {
        let mut line = Block::new("line-1", BlockKind::Line);
        line.relationships = vec![child_rel(&["w1", "gone", "w2"])];
        let map = BlockMap::new(vec![line, word("w1", "A"), word("w2", "B")]);
        let line = map.get("line-1").unwrap();
        assert_eq!(map.collect_text(line), "A B");
    }

    fn key_block(id: &str, word_id: &str, value_id: &str, confidence: f64) -> Block {
        let mut key = Block::new(id, BlockKind::KeyValueSet);
        key.key_value_role = Some(KeyValueRole::Key);
        key.confidence = Some(confidence);
        key.relationships = vec![
            child_rel(&[word_id]),
            Relationship {
                kind: RelationshipKind::Value,
                ids: vec![value_id.to_owned()],
            },
        ];
        key
    }

    fn value_block(id: &str, word_id: &str) -> Block {
        let mut value = Block::new(id, BlockKind::KeyValueSet);
        value.key_value_role = Some(KeyValueRole::Value);
        value.relationships = vec![child_rel(&[word_id])];
        value
    }

    #[test]
    fn duplicate_keys_keep_the_higher_confidence_value() {
        let blocks = vec![
            key_block("k1", "kw", "v1", 60.0),
            key_block("k2", "kw", "v2", 90.0),
            value_block("v1", "v1w"),
            value_block("v2", "v2w"),
            word("kw", "INSURED"),
            word("v1w", "ACME"),
            word("v2w", "GLOBEX"),
        ];
        let map = BlockMap::new(blocks);
        let normalized = normalize_blocks(&map);
        assert_eq!(normalized.key_value_pairs.len(), 2);
        assert_eq!(
            normalized.key_values_best.get("INSURED").map(String::as_str),
            Some("GLOBEX")
        );
    }

    #[test]
    fn empty_keys_are_dropped() {
        let blocks = vec![
            key_block("k1", "missing-word", "v1", 50.0),
            value_block("v1", "v1w"),
            word("v1w", "ORPHAN"),
        ];
        let map = BlockMap::new(blocks);
        let normalized = normalize_blocks(&map);
        assert!(normalized.key_value_pairs.is_empty());
    }

    #[test]
    fn table_grid_places_cells_by_row_and_column() {
        let mut table = Block::new("t", BlockKind::Table);
        table.relationships = vec![child_rel(&["c1", "c2"])];
        let mut c1 = Block::new("c1", BlockKind::Cell);
        c1.row_index = Some(1);
        c1.column_index = Some(1);
        c1.relationships = vec![child_rel(&["aw"])];
        let mut c2 = Block::new("c2", BlockKind::Cell);
        c2.row_index = Some(2);
        c2.column_index = Some(2);
        c2.relationships = vec![child_rel(&["bw"])];
        let map = BlockMap::new(vec![table, c1, c2, word("aw", "A"), word("bw", "B")]);
        let normalized = normalize_blocks(&map);
        assert_eq!(normalized.tables.len(), 1);
        assert_eq!(
            normalized.tables[0].grid,
            vec![
                vec!["A".to_owned(), String::new()],
                vec![String::new(), "B".to_owned()],
            ]
        );
    }

    #[test]
    fn full_text_joins_lines_and_averages_confidence() {
        let mut l1 = Block::new("l1", BlockKind::Line);
        l1.text = Some("FIRST".to_owned());
        l1.confidence = Some(99.5);
        let mut l2 = Block::new("l2", BlockKind::Line);
        l2.text = Some("SECOND".to_owned());
        l2.confidence = Some(98.544);
        let map = BlockMap::new(vec![l1, l2]);
        let normalized = normalize_blocks(&map);
        assert_eq!(normalized.full_text, "FIRST\nSECOND");
        assert_eq!(normalized.confidence.line_count, 2);
        assert_eq!(normalized.confidence.average, Some(99.02));
    }

    #[test]
    fn no_lines_means_no_average() {
        let map = BlockMap::new(vec![word("w", "X")]);
        let normalized = normalize_blocks(&map);
        assert_eq!(normalized.full_text, "");
        assert_eq!(normalized.confidence.average, None);
        assert_eq!(normalized.confidence.line_count, 0);
    }
}
