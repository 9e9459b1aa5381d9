//! Derived data pulled out of document content: mentions and preview images.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::Node;

/// A mention node as inserted by the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Mention {
    /// The mentioned user, for user mentions with a valid id.
    pub fn user_id(&self) -> Option<Uuid> {
        if self.kind != "user" {
            return None;
        }
        Uuid::parse_str(&self.value).ok()
    }
}

fn mention_of(node: &Node) -> Option<Mention> {
    let Node::Mention(leaf) = node else {
        return None;
    };
    let field = |key: &str| leaf.attrs.get(key).and_then(|v| v.as_str()).map(str::to_string);
    Some(Mention {
        id: field("id")?,
        kind: field("type")?,
        value: field("value")?,
    })
}

/// Every mention inside `nodes`, including nested ones.
pub fn extract_mentions(nodes: &[Node]) -> Vec<Mention> {
    let mut mentions = Vec::new();
    for node in nodes {
        mentions.extend(mention_of(node));
        node.descendants(&mut |child, _| {
            mentions.extend(mention_of(child));
            true
        });
    }
    mentions
}

/// Source of the first image in the document.
pub fn extract_preview_image(doc: &Node) -> Option<String> {
    let mut src = None;
    doc.descendants(&mut |node, _| {
        if src.is_some() {
            return false;
        }
        if let Node::Image(leaf) = node {
            src = leaf.attrs.get("src").and_then(|v| v.as_str()).map(str::to_string);
        }
        true
    });
    src
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mention(kind: &str, value: &str) -> Node {
        Node::from_json(json!({
            "type": "mention",
            "attrs": { "id": "m1", "type": kind, "value": value }
        }))
        .unwrap()
    }

    #[test]
    fn test_extract_nested_mentions() {
        let user = Uuid::new_v4();
        let content = vec![Node::paragraph(vec![
            Node::text("hi "),
            mention("user", &user.to_string()),
            mention("page", "some-page"),
        ])];
        let mentions = extract_mentions(&content);
        assert_eq!(mentions.len(), 2);
        assert_eq!(mentions[0].user_id(), Some(user));
        assert_eq!(mentions[1].user_id(), None);
    }

    #[test]
    fn test_preview_image() {
        let doc = Node::from_json(json!({
            "type": "doc",
            "content": [
                { "type": "paragraph" },
                { "type": "image", "attrs": { "src": "https://img/1.png" } },
                { "type": "image", "attrs": { "src": "https://img/2.png" } }
            ]
        }))
        .unwrap();
        assert_eq!(extract_preview_image(&doc).as_deref(), Some("https://img/1.png"));
        assert_eq!(extract_preview_image(&Node::empty_doc()), None);
    }
}
