//! Slices and the structural replace operation every step builds on.
//!
//! ```text
//!   from ──────────────┐          ┌────────────── to
//!   [ left of from ] + [ slice content ] + [ right of to ]
//!          └── open nodes on both sides are joined when compatible
//! ```

use serde::{Deserialize, Serialize};

use crate::error::StepError;
use crate::fragment;
use crate::node::Node;
use crate::resolve::ResolvedPos;

/// A piece of document with open depths on either side.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Node>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub open_start: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub open_end: usize,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl Slice {
    pub fn new(content: Vec<Node>, open_start: usize, open_end: usize) -> Self {
        Self {
            content,
            open_start,
            open_end,
        }
    }

    /// A closed slice around whole nodes.
    pub fn closed(content: Vec<Node>) -> Self {
        Self::new(content, 0, 0)
    }

    pub fn size(&self) -> usize {
        fragment::size(&self.content).saturating_sub(self.open_start + self.open_end)
    }

    /// Checks that the first and last child chains reach the open depths.
    pub fn check_open_depths(&self) -> Result<(), StepError> {
        if !open_side_fits(&self.content, self.open_start, <[Node]>::first) {
            return Err(StepError::Replace(format!(
                "Slice open start {} is deeper than its content",
                self.open_start
            )));
        }
        if !open_side_fits(&self.content, self.open_end, <[Node]>::last) {
            return Err(StepError::Replace(format!(
                "Slice open end {} is deeper than its content",
                self.open_end
            )));
        }
        Ok(())
    }

    /// Inserts `insert` at `pos` inside this slice's content, or `None` when
    /// the content there cannot hold it.
    pub fn insert_at(&self, pos: usize, insert: Vec<Node>) -> Option<Slice> {
        let content = insert_into(&self.content, pos + self.open_start, insert, None)?;
        Some(Slice::new(content, self.open_start, self.open_end))
    }
}

fn open_side_fits(content: &[Node], open: usize, edge: fn(&[Node]) -> Option<&Node>) -> bool {
    let mut nodes = content;
    for _ in 0..open {
        match edge(nodes) {
            Some(node) if !node.is_leaf() => nodes = node.content(),
            _ => return false,
        }
    }
    true
}

fn insert_into(
    content: &[Node],
    dist: usize,
    insert: Vec<Node>,
    parent: Option<&Node>,
) -> Option<Vec<Node>> {
    let (index, offset) = fragment::find_index(content, dist).ok()?;
    let child = content.get(index);
    if offset == dist || child.is_some_and(Node::is_text) {
        if let Some(parent) = parent {
            if parent.check_content(&insert).is_err() {
                return None;
            }
        }
        let total = fragment::size(content);
        let mut result = fragment::cut(content, 0, dist);
        fragment::append(&mut result, insert);
        fragment::append(&mut result, fragment::cut(content, dist, total));
        return Some(result);
    }
    let child = child?;
    let inner = insert_into(child.content(), dist - offset - 1, insert, Some(child))?;
    let mut result = content.to_vec();
    result[index] = child.with_content(inner);
    Some(result)
}

impl Node {
    /// The slice of this document between two positions.
    pub fn slice(&self, from: usize, to: usize) -> Result<Slice, StepError> {
        if to < from {
            return Err(StepError::Replace(format!("Invalid range {from}..{to}")));
        }
        if from == to {
            return Ok(Slice::default());
        }
        let rf = ResolvedPos::resolve(self, from)?;
        let rt = ResolvedPos::resolve(self, to)?;
        let depth = rf.shared_depth(to);
        let start = rf.start(depth);
        let node = rf.node(depth);
        let content = fragment::cut(node.content(), rf.pos - start, rt.pos - start);
        Ok(Slice::new(content, rf.depth() - depth, rt.depth() - depth))
    }

    /// Replaces the range `from..to` with `slice`, returning the new document.
    pub fn replace(&self, from: usize, to: usize, slice: &Slice) -> Result<Node, StepError> {
        if to < from {
            return Err(StepError::Replace(format!("Invalid range {from}..{to}")));
        }
        let rf = ResolvedPos::resolve(self, from)?;
        let rt = ResolvedPos::resolve(self, to)?;
        replace(&rf, &rt, slice)
    }
}

pub fn replace(from: &ResolvedPos<'_>, to: &ResolvedPos<'_>, slice: &Slice) -> Result<Node, StepError> {
    slice.check_open_depths()?;
    if slice.open_start > from.depth() {
        return Err(StepError::Replace(
            "Inserted content deeper than insertion position".to_string(),
        ));
    }
    if from.depth() + slice.open_end != to.depth() + slice.open_start {
        return Err(StepError::Replace("Inconsistent open depths".to_string()));
    }
    replace_outer(from, to, slice, 0)
}

fn replace_outer(
    from: &ResolvedPos<'_>,
    to: &ResolvedPos<'_>,
    slice: &Slice,
    depth: usize,
) -> Result<Node, StepError> {
    let index = from.index_at_depth(depth)?;
    let node = from.node_at_depth(depth)?;
    if index == to.index_at_depth(depth)? && depth < from.depth() - slice.open_start {
        let inner = replace_outer(from, to, slice, depth + 1)?;
        let mut content = node.content().to_vec();
        match content.get_mut(index) {
            Some(slot) => *slot = inner,
            None => return Err(StepError::Replace("Replace target missing".to_string())),
        }
        return Ok(node.with_content(content));
    }
    if slice.content.is_empty() {
        return close(node, replace_two_way(from, to, depth)?);
    }
    if slice.open_start == 0 && slice.open_end == 0 && from.depth() == depth && to.depth() == depth {
        let parent = from.parent();
        let content = parent.content();
        let mut joined = fragment::cut(content, 0, from.parent_offset);
        fragment::append(&mut joined, slice.content.iter().cloned());
        fragment::append(
            &mut joined,
            fragment::cut(content, to.parent_offset, fragment::size(content)),
        );
        return close(parent, joined);
    }
    let prepared = prepare_slice_for_replace(slice, from)?;
    let start = ResolvedPos::resolve(&prepared.node, prepared.start)?;
    let end = ResolvedPos::resolve(&prepared.node, prepared.end)?;
    close(node, replace_three_way(from, &start, &end, to, depth)?)
}

fn check_join(main: &Node, sub: &Node) -> Result<(), StepError> {
    if sub.compatible_content(main) {
        Ok(())
    } else {
        Err(StepError::Replace(format!(
            "Cannot join {} onto {}",
            sub.type_name(),
            main.type_name()
        )))
    }
}

fn joinable<'a>(
    before: &ResolvedPos<'a>,
    after: &ResolvedPos<'_>,
    depth: usize,
) -> Result<&'a Node, StepError> {
    let node = before.node_at_depth(depth)?;
    check_join(node, after.node_at_depth(depth)?)?;
    Ok(node)
}

fn add_range(
    start: Option<&ResolvedPos<'_>>,
    end: Option<&ResolvedPos<'_>>,
    depth: usize,
    target: &mut Vec<Node>,
) -> Result<(), StepError> {
    let node = if let Some(end) = end {
        end.node_at_depth(depth)?
    } else if let Some(start) = start {
        start.node_at_depth(depth)?
    } else {
        return Ok(());
    };
    let mut start_index = 0;
    let end_index = match end {
        Some(end) => end.index_at_depth(depth)?,
        None => node.child_count(),
    };
    if let Some(start) = start {
        start_index = start.index_at_depth(depth)?;
        if start.depth() > depth {
            start_index += 1;
        } else if start.text_offset() > 0 {
            if let Some(after) = start.node_after() {
                fragment::push_node(target, after);
            }
            start_index += 1;
        }
    }
    if let Some(children) = node.content().get(start_index..end_index) {
        fragment::append(target, children.iter().cloned());
    }
    if let Some(end) = end {
        if end.depth() == depth && end.text_offset() > 0 {
            if let Some(before) = end.node_before() {
                fragment::push_node(target, before);
            }
        }
    }
    Ok(())
}

fn close(node: &Node, content: Vec<Node>) -> Result<Node, StepError> {
    node.check_content(&content)?;
    Ok(node.with_content(content))
}

fn replace_three_way(
    from: &ResolvedPos<'_>,
    start: &ResolvedPos<'_>,
    end: &ResolvedPos<'_>,
    to: &ResolvedPos<'_>,
    depth: usize,
) -> Result<Vec<Node>, StepError> {
    let open_start = if from.depth() > depth {
        Some(joinable(from, start, depth + 1)?)
    } else {
        None
    };
    let open_end = if to.depth() > depth {
        Some(joinable(end, to, depth + 1)?)
    } else {
        None
    };

    let mut content = Vec::new();
    add_range(None, Some(from), depth, &mut content)?;
    let same_child = match (open_start, open_end) {
        (Some(_), Some(_)) => start.index_at_depth(depth)? == end.index_at_depth(depth)?,
        _ => false,
    };
    match (open_start, open_end) {
        (Some(os), Some(oe)) if same_child => {
            check_join(os, oe)?;
            let inner = replace_three_way(from, start, end, to, depth + 1)?;
            fragment::push_node(&mut content, close(os, inner)?);
        }
        (os, oe) => {
            if let Some(os) = os {
                let inner = replace_two_way(from, start, depth + 1)?;
                fragment::push_node(&mut content, close(os, inner)?);
            }
            add_range(Some(start), Some(end), depth, &mut content)?;
            if let Some(oe) = oe {
                let inner = replace_two_way(end, to, depth + 1)?;
                fragment::push_node(&mut content, close(oe, inner)?);
            }
        }
    }
    add_range(Some(to), None, depth, &mut content)?;
    Ok(content)
}

fn replace_two_way(
    from: &ResolvedPos<'_>,
    to: &ResolvedPos<'_>,
    depth: usize,
) -> Result<Vec<Node>, StepError> {
    let mut content = Vec::new();
    add_range(None, Some(from), depth, &mut content)?;
    if from.depth() > depth {
        let node = joinable(from, to, depth + 1)?;
        let inner = replace_two_way(from, to, depth + 1)?;
        fragment::push_node(&mut content, close(node, inner)?);
    }
    add_range(Some(to), None, depth, &mut content)?;
    Ok(content)
}

struct PreparedSlice {
    node: Node,
    start: usize,
    end: usize,
}

/// Wraps the slice in copies of the ancestors at `along` so it can be
/// resolved like a document.
fn prepare_slice_for_replace(
    slice: &Slice,
    along: &ResolvedPos<'_>,
) -> Result<PreparedSlice, StepError> {
    let extra = along.depth() - slice.open_start;
    let mut node = along.node(extra).with_content(slice.content.clone());
    for depth in (0..extra).rev() {
        node = along.node(depth).with_content(vec![node]);
    }
    let start = slice.open_start + extra;
    let end = node
        .content_size()
        .checked_sub(slice.open_end + extra)
        .ok_or_else(|| StepError::Replace("Slice open end exceeds its content".to_string()))?;
    Ok(PreparedSlice { node, start, end })
}
