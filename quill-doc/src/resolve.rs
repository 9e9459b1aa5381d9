//! Resolved positions.
//!
//! A flat position is resolved into the chain of ancestors that contain it,
//! with the child index and absolute start offset at every depth.

use crate::error::StepError;
use crate::fragment;
use crate::node::Node;

#[derive(Debug, Clone, Copy)]
struct Level<'a> {
    node: &'a Node,
    index: usize,
    offset: usize,
}

#[derive(Debug, Clone)]
pub struct ResolvedPos<'a> {
    pub pos: usize,
    pub parent_offset: usize,
    path: Vec<Level<'a>>,
}

impl<'a> ResolvedPos<'a> {
    pub fn resolve(doc: &'a Node, pos: usize) -> Result<Self, StepError> {
        let size = doc.content_size();
        if pos > size {
            return Err(StepError::OutOfRange { pos, size });
        }
        let mut path = Vec::new();
        let mut start = 0;
        let mut parent_offset = pos;
        let mut node = doc;
        loop {
            let (index, offset) = fragment::find_index(node.content(), parent_offset)?;
            let rem = parent_offset - offset;
            path.push(Level {
                node,
                index,
                offset: start + offset,
            });
            if rem == 0 {
                break;
            }
            let child = match node.content().get(index) {
                Some(child) => child,
                None => break,
            };
            if child.is_text() {
                break;
            }
            node = child;
            parent_offset = rem - 1;
            start += offset + 1;
        }
        Ok(Self {
            pos,
            parent_offset,
            path,
        })
    }

    pub fn depth(&self) -> usize {
        self.path.len() - 1
    }

    /// Ancestor at `depth`. Callers must stay within `0..=depth()`; use
    /// [`ResolvedPos::node_at_depth`] for depths derived from input.
    pub fn node(&self, depth: usize) -> &'a Node {
        self.path[depth].node
    }

    pub fn node_at_depth(&self, depth: usize) -> Result<&'a Node, StepError> {
        self.level(depth).map(|level| level.node)
    }

    pub fn index_at_depth(&self, depth: usize) -> Result<usize, StepError> {
        self.level(depth).map(|level| level.index)
    }

    fn level(&self, depth: usize) -> Result<&Level<'a>, StepError> {
        self.path.get(depth).ok_or_else(|| {
            StepError::Replace(format!(
                "Depth {depth} is below position {} (depth {})",
                self.pos,
                self.depth()
            ))
        })
    }

    pub fn parent(&self) -> &'a Node {
        self.node(self.depth())
    }

    pub fn index(&self, depth: usize) -> usize {
        self.path[depth].index
    }

    pub fn index_after(&self, depth: usize) -> usize {
        let at_boundary = depth == self.depth() && self.text_offset() == 0;
        self.index(depth) + usize::from(!at_boundary)
    }

    /// Absolute position where the content of the node at `depth` starts.
    pub fn start(&self, depth: usize) -> usize {
        if depth == 0 {
            0
        } else {
            self.path[depth - 1].offset + 1
        }
    }

    pub fn end(&self, depth: usize) -> usize {
        self.start(depth) + self.node(depth).content_size()
    }

    /// Offset into the text node the position points into, 0 at boundaries.
    pub fn text_offset(&self) -> usize {
        self.pos - self.path[self.depth()].offset
    }

    pub fn node_after(&self) -> Option<Node> {
        let parent = self.parent();
        let index = self.index(self.depth());
        let child = parent.content().get(index)?;
        let d_off = self.text_offset();
        if d_off > 0 {
            Some(child.cut(d_off, child.node_size()))
        } else {
            Some(child.clone())
        }
    }

    pub fn node_before(&self) -> Option<Node> {
        let parent = self.parent();
        let index = self.index(self.depth());
        let d_off = self.text_offset();
        if d_off > 0 {
            let child = parent.content().get(index)?;
            return Some(child.cut(0, d_off));
        }
        if index == 0 {
            return None;
        }
        parent.content().get(index - 1).cloned()
    }

    /// Deepest depth whose node contains both this position and `pos`.
    pub fn shared_depth(&self, pos: usize) -> usize {
        (1..=self.depth())
            .rev()
            .find(|&depth| self.start(depth) <= pos && self.end(depth) >= pos)
            .unwrap_or(0)
    }

    /// Whether any ancestor is a table cell or header.
    pub fn in_table_cell(&self) -> bool {
        self.path.iter().any(|level| level.node.is_table_cell())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Node {
        Node::doc(vec![
            Node::paragraph(vec![Node::text("ab")]),
            Node::paragraph(vec![Node::text("cd")]),
        ])
    }

    #[test]
    fn test_resolve_inside_text() {
        let doc = sample();
        let rp = ResolvedPos::resolve(&doc, 2).unwrap();
        assert_eq!(rp.depth(), 1);
        assert_eq!(rp.parent().type_name(), "paragraph");
        assert_eq!(rp.parent_offset, 1);
        assert_eq!(rp.text_offset(), 1);
        assert_eq!(rp.node_before().unwrap().text_content(), "a");
        assert_eq!(rp.node_after().unwrap().text_content(), "b");
        assert_eq!(rp.start(1), 1);
        assert_eq!(rp.end(1), 3);
    }

    #[test]
    fn test_resolve_between_blocks() {
        let doc = sample();
        let rp = ResolvedPos::resolve(&doc, 4).unwrap();
        assert_eq!(rp.depth(), 0);
        assert_eq!(rp.index(0), 1);
        assert_eq!(rp.node_before().unwrap().text_content(), "ab");
        assert_eq!(rp.node_after().unwrap().text_content(), "cd");
    }

    #[test]
    fn test_resolve_out_of_range() {
        let doc = sample();
        assert!(matches!(
            ResolvedPos::resolve(&doc, 9),
            Err(StepError::OutOfRange { pos: 9, size: 8 })
        ));
    }

    #[test]
    fn test_checked_depth_access() {
        let doc = sample();
        let rp = ResolvedPos::resolve(&doc, 2).unwrap();
        assert_eq!(rp.node_at_depth(1).unwrap().type_name(), "paragraph");
        assert_eq!(rp.index_at_depth(0).unwrap(), 0);
        assert!(matches!(rp.node_at_depth(2), Err(StepError::Replace(_))));
        assert!(rp.index_at_depth(5).is_err());
    }

    #[test]
    fn test_shared_depth() {
        let doc = sample();
        let rp = ResolvedPos::resolve(&doc, 2).unwrap();
        assert_eq!(rp.shared_depth(3), 1);
        assert_eq!(rp.shared_depth(5), 0);
    }
}
