//! Typed document tree.
//!
//! The JSON shape is the one the browser editor exchanges:
//!
//! ```text
//!  { "type": "doc", "content": [
//!      { "type": "paragraph", "content": [ { "type": "text", "text": "hi" } ] },
//!      { "type": "page", "attrs": { "id": "…", "type": "page", "path": "…" } }
//!  ] }
//! ```
//!
//! Sizes follow the editor's position model: a text node counts its UTF-16
//! code units, a leaf counts 1 and an element counts its content plus 2 for
//! the opening and closing tokens.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DocError, StepError};
use crate::fragment;

pub type Attrs = Map<String, Value>;

// ---------------------------------------------------------------
// Marks
// ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
}

impl Mark {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attrs: Attrs::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    /// Transient editor marks (slash menus, mention pickers) carry a
    /// `trigger` attribute and never belong in stored content.
    pub fn is_trigger(&self) -> bool {
        self.attrs.contains_key("trigger")
    }

    /// Adds this mark to `set`, replacing any mark of the same kind.
    pub fn add_to_set(&self, set: &[Mark]) -> Vec<Mark> {
        let mut marks: Vec<Mark> = set.iter().filter(|m| m.kind != self.kind).cloned().collect();
        marks.push(self.clone());
        marks
    }

    pub fn remove_from_set(&self, set: &[Mark]) -> Vec<Mark> {
        set.iter().filter(|m| *m != self).cloned().collect()
    }
}

// ---------------------------------------------------------------
// Node payloads
// ---------------------------------------------------------------

/// Payload of every node that can hold children.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Element {
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Node>,
}

impl Element {
    pub fn new(content: Vec<Node>) -> Self {
        Self {
            attrs: Attrs::new(),
            content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

/// Childless node: images, rules, hard breaks and mentions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Leaf {
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageRef {
    #[serde(default)]
    pub attrs: PageRefAttrs,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageRefAttrs {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub page_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub extra: Attrs,
}

// ---------------------------------------------------------------
// Node
// ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Node {
    Doc(Element),
    Paragraph(Element),
    Heading(Element),
    Blockquote(Element),
    BulletList(Element),
    OrderedList(Element),
    ListItem(Element),
    CodeBlock(Element),
    Table(Element),
    #[serde(rename = "table_row")]
    TableRow(Element),
    #[serde(rename = "table_cell")]
    TableCell(Element),
    #[serde(rename = "table_header")]
    TableHeader(Element),
    Text(TextNode),
    HardBreak(Leaf),
    HorizontalRule(Leaf),
    Image(Leaf),
    Mention(Leaf),
    /// Nested page embedded in its parent's content.
    Page(PageRef),
    /// Link to a page that lives elsewhere in the tree.
    LinkedPage(PageRef),
}

impl Node {
    pub fn doc(content: Vec<Node>) -> Self {
        Node::Doc(Element::new(content))
    }

    pub fn paragraph(content: Vec<Node>) -> Self {
        Node::Paragraph(Element::new(content))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(TextNode {
            text: text.into(),
            marks: Vec::new(),
        })
    }

    /// A document holding a single empty paragraph.
    pub fn empty_doc() -> Self {
        Node::doc(vec![Node::paragraph(Vec::new())])
    }

    pub fn from_json(value: Value) -> Result<Self, DocError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<Value, DocError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Node::Doc(_) => "doc",
            Node::Paragraph(_) => "paragraph",
            Node::Heading(_) => "heading",
            Node::Blockquote(_) => "blockquote",
            Node::BulletList(_) => "bulletList",
            Node::OrderedList(_) => "orderedList",
            Node::ListItem(_) => "listItem",
            Node::CodeBlock(_) => "codeBlock",
            Node::Table(_) => "table",
            Node::TableRow(_) => "table_row",
            Node::TableCell(_) => "table_cell",
            Node::TableHeader(_) => "table_header",
            Node::Text(_) => "text",
            Node::HardBreak(_) => "hardBreak",
            Node::HorizontalRule(_) => "horizontalRule",
            Node::Image(_) => "image",
            Node::Mention(_) => "mention",
            Node::Page(_) => "page",
            Node::LinkedPage(_) => "linkedPage",
        }
    }

    fn element(&self) -> Option<&Element> {
        match self {
            Node::Doc(e)
            | Node::Paragraph(e)
            | Node::Heading(e)
            | Node::Blockquote(e)
            | Node::BulletList(e)
            | Node::OrderedList(e)
            | Node::ListItem(e)
            | Node::CodeBlock(e)
            | Node::Table(e)
            | Node::TableRow(e)
            | Node::TableCell(e)
            | Node::TableHeader(e) => Some(e),
            _ => None,
        }
    }

    fn element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Node::Doc(e)
            | Node::Paragraph(e)
            | Node::Heading(e)
            | Node::Blockquote(e)
            | Node::BulletList(e)
            | Node::OrderedList(e)
            | Node::ListItem(e)
            | Node::CodeBlock(e)
            | Node::Table(e)
            | Node::TableRow(e)
            | Node::TableCell(e)
            | Node::TableHeader(e) => Some(e),
            _ => None,
        }
    }

    pub fn content(&self) -> &[Node] {
        self.element().map(|e| e.content.as_slice()).unwrap_or(&[])
    }

    pub fn child_count(&self) -> usize {
        self.content().len()
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Node::Text(_))
    }

    pub fn is_leaf(&self) -> bool {
        self.element().is_none()
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Node::Text(_) | Node::HardBreak(_) | Node::Mention(_))
    }

    pub fn is_textblock(&self) -> bool {
        matches!(self, Node::Paragraph(_) | Node::Heading(_) | Node::CodeBlock(_))
    }

    pub fn is_table_cell(&self) -> bool {
        matches!(self, Node::TableCell(_) | Node::TableHeader(_))
    }

    /// Whether inline children of this node may carry marks.
    pub fn allows_marks(&self) -> bool {
        !matches!(self, Node::CodeBlock(_))
    }

    pub fn node_size(&self) -> usize {
        match self {
            Node::Text(t) => fragment::utf16_len(&t.text),
            _ if self.is_leaf() => 1,
            _ => self.content_size() + 2,
        }
    }

    pub fn content_size(&self) -> usize {
        fragment::size(self.content())
    }

    pub fn text_content(&self) -> String {
        match self {
            Node::Text(t) => t.text.clone(),
            _ => self.content().iter().map(Node::text_content).collect(),
        }
    }

    pub fn marks(&self) -> &[Mark] {
        match self {
            Node::Text(t) => &t.marks,
            Node::HardBreak(l) | Node::Mention(l) | Node::Image(l) | Node::HorizontalRule(l) => {
                &l.marks
            }
            _ => &[],
        }
    }

    pub fn with_marks(&self, marks: Vec<Mark>) -> Node {
        let mut node = self.clone();
        match &mut node {
            Node::Text(t) => t.marks = marks,
            Node::HardBreak(l) | Node::Mention(l) | Node::Image(l) | Node::HorizontalRule(l) => {
                l.marks = marks
            }
            _ => {}
        }
        node
    }

    /// Copy of this node with its children replaced. Leaves are returned
    /// unchanged.
    pub fn with_content(&self, content: Vec<Node>) -> Node {
        match self.element() {
            Some(element) => {
                let mut node = self.shallow_clone(element);
                if let Some(e) = node.element_mut() {
                    e.content = content;
                }
                node
            }
            None => self.clone(),
        }
    }

    fn shallow_clone(&self, element: &Element) -> Node {
        let empty = Element {
            attrs: element.attrs.clone(),
            content: Vec::new(),
        };
        match self {
            Node::Doc(_) => Node::Doc(empty),
            Node::Paragraph(_) => Node::Paragraph(empty),
            Node::Heading(_) => Node::Heading(empty),
            Node::Blockquote(_) => Node::Blockquote(empty),
            Node::BulletList(_) => Node::BulletList(empty),
            Node::OrderedList(_) => Node::OrderedList(empty),
            Node::ListItem(_) => Node::ListItem(empty),
            Node::CodeBlock(_) => Node::CodeBlock(empty),
            Node::Table(_) => Node::Table(empty),
            Node::TableRow(_) => Node::TableRow(empty),
            Node::TableCell(_) => Node::TableCell(empty),
            Node::TableHeader(_) => Node::TableHeader(empty),
            other => other.clone(),
        }
    }

    /// Cuts this node down to the content between `from` and `to`, both
    /// relative to the start of its content.
    pub fn cut(&self, from: usize, to: usize) -> Node {
        match self {
            Node::Text(t) => Node::Text(TextNode {
                text: fragment::utf16_slice(&t.text, from, to),
                marks: t.marks.clone(),
            }),
            _ if self.is_leaf() => self.clone(),
            _ => self.with_content(fragment::cut(self.content(), from, to)),
        }
    }

    pub fn attrs(&self) -> Attrs {
        match self {
            Node::Text(_) => Attrs::new(),
            Node::HardBreak(l) | Node::HorizontalRule(l) | Node::Image(l) | Node::Mention(l) => {
                l.attrs.clone()
            }
            Node::Page(p) | Node::LinkedPage(p) => match serde_json::to_value(&p.attrs) {
                Ok(Value::Object(map)) => map,
                _ => Attrs::new(),
            },
            _ => self.element().map(|e| e.attrs.clone()).unwrap_or_default(),
        }
    }

    pub fn attr(&self, key: &str) -> Option<Value> {
        self.attrs().get(key).cloned()
    }

    pub fn set_attr(&mut self, key: &str, value: Value) -> Result<(), StepError> {
        match self {
            Node::Text(_) => Err(StepError::Failed(
                "Cannot set attributes on a text node".to_string(),
            )),
            Node::HardBreak(l) | Node::HorizontalRule(l) | Node::Image(l) | Node::Mention(l) => {
                l.attrs.insert(key.to_string(), value);
                Ok(())
            }
            Node::Page(p) | Node::LinkedPage(p) => {
                let mut map = match serde_json::to_value(&p.attrs) {
                    Ok(Value::Object(map)) => map,
                    _ => Attrs::new(),
                };
                map.insert(key.to_string(), value);
                p.attrs = serde_json::from_value(Value::Object(map))
                    .map_err(|e| StepError::Failed(format!("Invalid page attributes: {e}")))?;
                Ok(())
            }
            other => {
                if let Some(e) = other.element_mut() {
                    e.attrs.insert(key.to_string(), value);
                }
                Ok(())
            }
        }
    }

    /// Whether `content` is acceptable as this node's children.
    ///
    /// Textblocks take inline content, every other element takes blocks and
    /// leaves take nothing.
    pub(crate) fn check_content(&self, content: &[Node]) -> Result<(), StepError> {
        if self.is_leaf() {
            if content.is_empty() {
                return Ok(());
            }
            return Err(StepError::Replace(format!(
                "{} cannot hold content",
                self.type_name()
            )));
        }
        let wants_inline = self.is_textblock();
        if let Some(bad) = content.iter().find(|c| c.is_inline() != wants_inline) {
            return Err(StepError::Replace(format!(
                "Invalid content for node {}: {}",
                self.type_name(),
                bad.type_name()
            )));
        }
        Ok(())
    }

    pub(crate) fn compatible_content(&self, other: &Node) -> bool {
        self.type_name() == other.type_name() || (self.is_textblock() && other.is_textblock())
    }

    /// Calls `f` for every descendant overlapping `from..to` with its absolute
    /// position. Returning `false` skips the node's children.
    pub fn nodes_between<F>(&self, from: usize, to: usize, f: &mut F)
    where
        F: FnMut(&Node, usize) -> bool,
    {
        self.nodes_between_at(from, to, f, 0);
    }

    fn nodes_between_at<F>(&self, from: usize, to: usize, f: &mut F, start: usize)
    where
        F: FnMut(&Node, usize) -> bool,
    {
        let mut pos = 0;
        for child in self.content() {
            if pos >= to {
                break;
            }
            let end = pos + child.node_size();
            if end > from && f(child, start + pos) && child.content_size() > 0 {
                let inner = pos + 1;
                child.nodes_between_at(
                    from.saturating_sub(inner),
                    child.content_size().min(to - inner),
                    f,
                    start + inner,
                );
            }
            pos = end;
        }
    }

    pub fn descendants<F>(&self, f: &mut F)
    where
        F: FnMut(&Node, usize) -> bool,
    {
        self.nodes_between(0, self.content_size(), f);
    }

    /// The node starting at `pos`, or the text node containing it.
    pub fn node_at(&self, pos: usize) -> Option<&Node> {
        let mut node = self;
        let mut pos = pos;
        loop {
            let (index, offset) = fragment::find_index(node.content(), pos).ok()?;
            let child = node.content().get(index)?;
            if offset == pos || child.is_text() {
                return Some(child);
            }
            pos -= offset + 1;
            node = child;
        }
    }
}
