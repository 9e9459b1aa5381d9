//! Helpers over ordered child lists.

use crate::error::StepError;
use crate::node::Node;

pub(crate) fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Slices `text` by UTF-16 offsets. Offsets landing inside a surrogate pair
/// are replaced rather than panicking.
pub(crate) fn utf16_slice(text: &str, from: usize, to: usize) -> String {
    let units: Vec<u16> = text.encode_utf16().collect();
    let to = to.min(units.len());
    let from = from.min(to);
    String::from_utf16_lossy(&units[from..to])
}

pub fn size(content: &[Node]) -> usize {
    content.iter().map(Node::node_size).sum()
}

/// Finds the child index at `pos` and the offset where that child starts.
/// A position at the end of the list yields `(len, pos)`.
pub fn find_index(content: &[Node], pos: usize) -> Result<(usize, usize), StepError> {
    if pos == 0 {
        return Ok((0, 0));
    }
    let total = size(content);
    if pos == total {
        return Ok((content.len(), pos));
    }
    if pos > total {
        return Err(StepError::OutOfRange { pos, size: total });
    }
    let mut cur = 0;
    for (index, child) in content.iter().enumerate() {
        let end = cur + child.node_size();
        if end >= pos {
            if end == pos {
                return Ok((index + 1, end));
            }
            return Ok((index, cur));
        }
        cur = end;
    }
    Err(StepError::OutOfRange { pos, size: total })
}

/// The children between `from` and `to`, cutting partially covered ones.
pub fn cut(content: &[Node], from: usize, to: usize) -> Vec<Node> {
    let mut result = Vec::new();
    if to <= from {
        return result;
    }
    let mut pos = 0;
    for child in content {
        if pos >= to {
            break;
        }
        let end = pos + child.node_size();
        if end > from {
            let piece = if pos < from || end > to {
                if child.is_text() {
                    child.cut(from.saturating_sub(pos), (to - pos).min(child.node_size()))
                } else {
                    child.cut(
                        from.saturating_sub(pos + 1),
                        (to - pos - 1).min(child.content_size()),
                    )
                }
            } else {
                child.clone()
            };
            result.push(piece);
        }
        pos = end;
    }
    result
}

/// Appends `node`, merging it into a trailing text node with the same marks.
pub fn push_node(target: &mut Vec<Node>, node: Node) {
    if let Node::Text(text) = &node {
        if text.text.is_empty() {
            return;
        }
        if let Some(Node::Text(last)) = target.last_mut() {
            if last.marks == text.marks {
                last.text.push_str(&text.text);
                return;
            }
        }
    }
    target.push(node);
}

pub fn append<I>(target: &mut Vec<Node>, nodes: I)
where
    I: IntoIterator<Item = Node>,
{
    for node in nodes {
        push_node(target, node);
    }
}
