//! Canvas layout of the target's source lines

use std::collections::HashMap;

use crate::data::TimelineEvent;
use crate::protocol::{Node, NodeData, Position};

const INDENT_WIDTH: f64 = 25.0;
const ROW_HEIGHT: u32 = 50;

/// One node per non-blank, non-comment line of `source`.
///
/// `timeline` is the visible timeline; events recorded in `unit` give each
/// line the frame of its latest execution.
pub fn nodes(source: &str, unit: &str, timeline: &[TimelineEvent]) -> Vec<Node> {
    let mut frames: HashMap<u32, u64> = HashMap::new();
    for event in timeline.iter().filter(|event| event.unit == unit) {
        frames.insert(event.line_number, event.frame_id);
    }

    source
        .lines()
        .enumerate()
        .map(|(idx, text)| (idx as u32 + 1, text))
        .filter(|(_, text)| {
            let trimmed = text.trim_start();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .enumerate()
        .map(|(row, (line, text))| {
            let segment = text.trim_start();
            let indent = (text.len() - segment.len()) as f64;
            Node {
                id: line.to_string(),
                kind: "code".to_string(),
                position: Position {
                    x: indent / 4.0 * INDENT_WIDTH,
                    y: row as u32 * ROW_HEIGHT,
                },
                data: NodeData {
                    source_segment: segment.to_string(),
                    frame_pointer: frames.get(&line).copied(),
                },
            }
        })
        .collect()
}
