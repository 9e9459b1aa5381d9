//! Steps: the unit of change clients send in a diff.
//!
//! Each step is a pure function from one document to the next. Positions in
//! a step refer to the document produced by the previous step of the same
//! diff.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StepError;
use crate::fragment;
use crate::node::{Mark, Node};
use crate::replace::Slice;
use crate::resolve::ResolvedPos;

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stepType", rename_all = "camelCase")]
pub enum Step {
    Replace {
        from: usize,
        to: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slice: Option<Slice>,
        #[serde(default, skip_serializing_if = "is_false")]
        structure: bool,
    },
    #[serde(rename_all = "camelCase")]
    ReplaceAround {
        from: usize,
        to: usize,
        gap_from: usize,
        gap_to: usize,
        insert: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slice: Option<Slice>,
        #[serde(default, skip_serializing_if = "is_false")]
        structure: bool,
    },
    AddMark {
        from: usize,
        to: usize,
        mark: Mark,
    },
    RemoveMark {
        from: usize,
        to: usize,
        mark: Mark,
    },
    Attr {
        pos: usize,
        attr: String,
        value: Value,
    },
}

impl Step {
    pub fn replace(from: usize, to: usize, slice: Slice) -> Self {
        let slice = if slice.content.is_empty() { None } else { Some(slice) };
        Step::Replace {
            from,
            to,
            slice,
            structure: false,
        }
    }

    pub fn delete(from: usize, to: usize) -> Self {
        Step::replace(from, to, Slice::default())
    }

    pub fn apply(&self, doc: &Node) -> Result<Node, StepError> {
        let empty = Slice::default();
        match self {
            Step::Replace {
                from,
                to,
                slice,
                structure,
            } => {
                if *structure && content_between(doc, *from, *to)? {
                    return Err(StepError::Failed(
                        "Structure replace would overwrite content".to_string(),
                    ));
                }
                doc.replace(*from, *to, slice.as_ref().unwrap_or(&empty))
            }
            Step::ReplaceAround {
                from,
                to,
                gap_from,
                gap_to,
                insert,
                slice,
                structure,
            } => {
                let slice = slice.as_ref().unwrap_or(&empty);
                apply_replace_around(doc, *from, *to, *gap_from, *gap_to, *insert, slice, *structure)
            }
            Step::AddMark { from, to, mark } => {
                apply_mark(doc, *from, *to, &|node: &Node| node.with_marks(mark.add_to_set(node.marks())))
            }
            Step::RemoveMark { from, to, mark } => apply_mark(doc, *from, *to, &|node: &Node| {
                node.with_marks(mark.remove_from_set(node.marks()))
            }),
            Step::Attr { pos, attr, value } => {
                let node = doc
                    .node_at(*pos)
                    .ok_or_else(|| StepError::Failed(format!("No node at position {pos}")))?;
                let mut updated = node.with_content(Vec::new());
                updated.set_attr(attr, value.clone())?;
                let open_end = if node.is_leaf() { 0 } else { 1 };
                doc.replace(*pos, pos + 1, &Slice::new(vec![updated], 0, open_end))
            }
        }
    }

    /// Nodes this step inserts into the document.
    pub fn inserted_content(&self) -> &[Node] {
        match self {
            Step::Replace { slice: Some(slice), .. } | Step::ReplaceAround { slice: Some(slice), .. } => {
                &slice.content
            }
            _ => &[],
        }
    }

    fn inserted_content_mut(&mut self) -> Option<&mut Vec<Node>> {
        match self {
            Step::Replace { slice: Some(slice), .. } | Step::ReplaceAround { slice: Some(slice), .. } => {
                Some(&mut slice.content)
            }
            _ => None,
        }
    }

    fn is_trigger_mark_step(&self) -> bool {
        match self {
            Step::AddMark { mark, .. } | Step::RemoveMark { mark, .. } => mark.is_trigger(),
            _ => false,
        }
    }
}

/// Applies `steps` in order. Any failure aborts the whole list and leaves
/// `doc` untouched.
pub fn apply_steps(doc: &Node, steps: &[Step]) -> Result<Node, StepError> {
    let mut current: Option<Node> = None;
    for (index, step) in steps.iter().enumerate() {
        let base = current.as_ref().unwrap_or(doc);
        let next = step.apply(base).map_err(|e| {
            log::debug!("Step {index} failed: {e}");
            e
        })?;
        current = Some(next);
    }
    Ok(current.unwrap_or_else(|| doc.clone()))
}

/// Drops transient trigger marks from `steps`, returning how many were
/// removed. Mark steps that only toggle a trigger mark are dropped entirely.
pub fn strip_trigger_marks(steps: &mut Vec<Step>) -> usize {
    let before = steps.len();
    steps.retain(|step| !step.is_trigger_mark_step());
    let mut removed = before - steps.len();
    for step in steps.iter_mut() {
        if let Some(content) = step.inserted_content_mut() {
            removed += strip_marks(content);
        }
    }
    removed
}

fn strip_marks(content: &mut Vec<Node>) -> usize {
    let mut removed = 0;
    let mut rebuilt = Vec::with_capacity(content.len());
    for node in content.drain(..) {
        let marks = node.marks();
        let kept: Vec<Mark> = marks.iter().filter(|m| !m.is_trigger()).cloned().collect();
        let mut node = if kept.len() != marks.len() {
            removed += marks.len() - kept.len();
            node.with_marks(kept)
        } else {
            node
        };
        if !node.is_leaf() {
            let mut children = node.content().to_vec();
            let inner = strip_marks(&mut children);
            if inner > 0 {
                removed += inner;
                node = node.with_content(children);
            }
        }
        fragment::push_node(&mut rebuilt, node);
    }
    *content = rebuilt;
    removed
}

fn apply_mark(
    doc: &Node,
    from: usize,
    to: usize,
    f: &dyn Fn(&Node) -> Node,
) -> Result<Node, StepError> {
    let old = doc.slice(from, to)?;
    let rf = ResolvedPos::resolve(doc, from)?;
    let parent = rf.node(rf.shared_depth(to));
    let content = map_inline(&old.content, parent, f);
    doc.replace(from, to, &Slice::new(content, old.open_start, old.open_end))
}

fn map_inline(content: &[Node], parent: &Node, f: &dyn Fn(&Node) -> Node) -> Vec<Node> {
    let mut mapped = Vec::with_capacity(content.len());
    for child in content {
        let mut node = if child.content_size() > 0 {
            child.with_content(map_inline(child.content(), child, f))
        } else {
            child.clone()
        };
        if node.is_inline() && parent.allows_marks() {
            node = f(&node);
        }
        fragment::push_node(&mut mapped, node);
    }
    mapped
}

#[allow(clippy::too_many_arguments)]
fn apply_replace_around(
    doc: &Node,
    from: usize,
    to: usize,
    gap_from: usize,
    gap_to: usize,
    insert: usize,
    slice: &Slice,
    structure: bool,
) -> Result<Node, StepError> {
    if gap_from < from || gap_to > to || gap_to < gap_from {
        return Err(StepError::Failed("Gap outside of replaced range".to_string()));
    }
    if structure && (content_between(doc, from, gap_from)? || content_between(doc, gap_to, to)?) {
        return Err(StepError::Failed("Structure gap-replace would overwrite content".to_string()));
    }
    let gap = doc.slice(gap_from, gap_to)?;
    if gap.open_start != 0 || gap.open_end != 0 {
        return Err(StepError::Failed("Gap is not a flat range".to_string()));
    }
    let inserted = slice
        .insert_at(insert, gap.content)
        .ok_or_else(|| StepError::Failed("Content does not fit in gap".to_string()))?;
    doc.replace(from, to, &inserted)
}

/// Whether replacing `from..to` would remove anything besides node
/// boundaries.
fn content_between(doc: &Node, from: usize, to: usize) -> Result<bool, StepError> {
    let rf = ResolvedPos::resolve(doc, from)?;
    let mut dist = to.saturating_sub(from);
    let mut depth = rf.depth();
    while dist > 0 && depth > 0 && rf.index_after(depth) == rf.node(depth).child_count() {
        depth -= 1;
        dist -= 1;
    }
    if dist > 0 {
        let mut next = rf.node(depth).content().get(rf.index_after(depth));
        while dist > 0 {
            match next {
                Some(node) if !node.is_leaf() => next = node.content().first(),
                _ => return Ok(true),
            }
            dist -= 1;
        }
    }
    Ok(false)
}
