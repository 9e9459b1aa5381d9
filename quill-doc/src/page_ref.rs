//! Embedded page references and the step builders that add or remove them.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::node::{Attrs, Element, Node, PageRef, PageRefAttrs};
use crate::replace::Slice;
use crate::resolve::ResolvedPos;
use crate::step::Step;

/// Page types that never count as nested children of a document.
pub const EXCLUDED_PAGE_TYPES: &[&str] = &[
    "forum_category",
    "members",
    "forum",
    "proposals",
    "rewards",
    "settings",
];

impl PageRefAttrs {
    pub fn page_id(&self) -> Option<Uuid> {
        self.id.as_deref().and_then(|id| Uuid::parse_str(id).ok())
    }

    pub fn is_excluded_type(&self) -> bool {
        self.page_type
            .as_deref()
            .is_some_and(|t| EXCLUDED_PAGE_TYPES.contains(&t))
    }
}

impl Node {
    /// The page id if this is a valid nested page reference.
    ///
    /// Linked pages and references to excluded page types are not nested
    /// children, so deleting or restoring them has no side effects.
    pub fn page_reference(&self) -> Option<Uuid> {
        match self {
            Node::Page(PageRef { attrs }) if !attrs.is_excluded_type() => attrs.page_id(),
            _ => None,
        }
    }
}

/// Position of the first nested page node pointing at `page_id`.
pub fn find_page_ref(doc: &Node, page_id: Uuid) -> Option<usize> {
    find_ref_where(doc, |attrs| attrs.page_id() == Some(page_id))
}

/// Like [`find_page_ref`] but matches the raw `id` attribute, which holds a
/// path for static pages.
pub fn find_page_node(doc: &Node, id: &str) -> Option<usize> {
    find_ref_where(doc, |attrs| attrs.id.as_deref() == Some(id))
}

fn find_ref_where(doc: &Node, matches: impl Fn(&PageRefAttrs) -> bool) -> Option<usize> {
    let mut found = None;
    doc.descendants(&mut |node, pos| {
        if found.is_some() {
            return false;
        }
        if let Node::Page(PageRef { attrs }) = node {
            if matches(attrs) {
                found = Some(pos);
            }
            return false;
        }
        true
    });
    found
}

/// Position of a page or linked page node for `id` starting exactly at
/// `pos`, if there is one.
pub fn page_node_at(doc: &Node, pos: usize, id: &str) -> Option<usize> {
    match doc.node_at(pos)? {
        Node::Page(PageRef { attrs }) | Node::LinkedPage(PageRef { attrs })
            if attrs.id.as_deref() == Some(id) =>
        {
            Some(pos)
        }
        _ => None,
    }
}

/// Ids of every valid page reference in `nodes` or their descendants.
pub fn page_ref_ids(nodes: &[Node]) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for node in nodes {
        if let Some(id) = node.page_reference() {
            ids.push(id);
        }
        node.descendants(&mut |child, _| {
            if let Some(id) = child.page_reference() {
                ids.push(id);
            }
            true
        });
    }
    ids
}

pub fn page_ref_node(page_id: Uuid, page_type: Option<&str>, path: Option<&str>) -> Node {
    ref_node(&page_id.to_string(), false, page_type, path)
}

/// A `page` node, or a `linkedPage` node when `linked` is set.
pub fn ref_node(id: &str, linked: bool, page_type: Option<&str>, path: Option<&str>) -> Node {
    let mut extra = Attrs::new();
    extra.insert("track".to_string(), Value::Array(Vec::new()));
    let page_ref = PageRef {
        attrs: PageRefAttrs {
            id: Some(id.to_string()),
            page_type: page_type.map(str::to_string),
            path: path.map(str::to_string),
            extra,
        },
    };
    if linked {
        Node::LinkedPage(page_ref)
    } else {
        Node::Page(page_ref)
    }
}

/// Steps inserting a page reference at `pos`.
pub fn insert_page_ref_steps(
    page_id: Uuid,
    pos: usize,
    page_type: Option<&str>,
    path: Option<&str>,
) -> Vec<Step> {
    vec![Step::replace(
        pos,
        pos,
        Slice::closed(vec![page_ref_node(page_id, page_type, path)]),
    )]
}

pub fn is_inside_table_cell(doc: &Node, pos: usize) -> bool {
    ResolvedPos::resolve(doc, pos)
        .map(|rp| rp.in_table_cell())
        .unwrap_or(false)
}

/// Steps removing the single node at `pos`. Inside a table cell the node is
/// swapped for an empty paragraph so the cell stays valid.
pub fn remove_node_steps(pos: usize, inside_table_cell: bool) -> Vec<Step> {
    if inside_table_cell {
        let mut placeholder = Element::default();
        placeholder.attrs.insert("track".to_string(), json!([]));
        vec![Step::replace(
            pos,
            pos + 1,
            Slice::closed(vec![Node::Paragraph(placeholder)]),
        )]
    } else {
        vec![Step::delete(pos, pos + 1)]
    }
}

/// Position before the top-level child at `index`, or the end of the
/// document when the index is missing or past the last child.
pub fn child_insert_position(doc: &Node, index: Option<usize>) -> usize {
    let children = doc.content();
    let index = index.unwrap_or(children.len()).min(children.len());
    children[..index].iter().map(Node::node_size).sum()
}

/// Clamps a drop position to one where a block node may be inserted.
pub fn block_insert_position(doc: &Node, pos: usize) -> usize {
    match ResolvedPos::resolve(doc, pos) {
        Ok(rp) if !rp.parent().is_textblock() && rp.text_offset() == 0 => pos,
        _ => doc.content_size(),
    }
}
