//! Language-agnostic tree-sitter helpers

use codeweave_core::{Error, Result, SourceSpan};
use std::collections::HashMap;
use tree_sitter::{Node, Query, QueryMatch};

/// Find a capture node by name in a query match
pub fn find_capture_node<'a>(
    query_match: &'a QueryMatch,
    query: &'a Query,
    name: &str,
) -> Option<Node<'a>> {
    query_match.captures.iter().find_map(|capture| {
        let capture_name = query.capture_names().get(capture.index as usize)?;
        if *capture_name == name {
            Some(capture.node)
        } else {
            None
        }
    })
}

/// Text of `node`, or an empty string when the bytes are not UTF-8
pub fn node_text<'s>(node: Node, source: &'s str) -> &'s str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

/// Source span of `node`, 1-indexed lines
pub fn node_span(node: Node) -> SourceSpan {
    let start = node.start_position();
    let end = node.end_position();
    SourceSpan::new(start.row + 1, end.row + 1, start.column, end.column)
}

pub fn line_of(node: Node) -> usize {
    node.start_position().row + 1
}

/// Decode file bytes, rejecting non-UTF-8 content as unrecoverable
pub fn decode_source<'b>(path: &str, bytes: &'b [u8]) -> Result<&'b str> {
    std::str::from_utf8(bytes)
        .map_err(|e| Error::extraction(path, format!("File is not valid UTF-8: {e}"), false))
}

/// Nearest ancestor of `node` (excluding itself) registered in `owners`
///
/// `owners` maps tree-sitter node ids to whatever the caller tracks for them,
/// typically the index of the entity extracted from that node.
pub fn owning_ancestor<T: Copy>(node: Node, owners: &HashMap<usize, T>) -> Option<T> {
    let mut current = node.parent();
    while let Some(ancestor) = current {
        if let Some(owner) = owners.get(&ancestor.id()) {
            return Some(*owner);
        }
        current = ancestor.parent();
    }
    None
}
