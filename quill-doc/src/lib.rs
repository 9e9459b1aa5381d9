//! Rich-text document model shared by the sync server.
//!
//! Documents are trees of typed nodes addressed by flat integer positions.
//! Clients edit them with steps, and the server replays the same steps to
//! keep an authoritative copy.
//!
//! ```text
//!  JSON ──serde──▸ Node ──Step::apply──▸ Node ──serde──▸ JSON
//!                    │
//!             ResolvedPos / Slice
//! ```

pub mod error;
pub mod extract;
pub mod fragment;
pub mod node;
pub mod page_ref;
pub mod replace;
pub mod resolve;
pub mod step;

pub use error::{DocError, StepError};
pub use extract::{extract_mentions, extract_preview_image, Mention};
pub use node::{Attrs, Element, Leaf, Mark, Node, PageRef, PageRefAttrs, TextNode};
pub use page_ref::{
    block_insert_position, child_insert_position, find_page_node, find_page_ref,
    insert_page_ref_steps, is_inside_table_cell, page_node_at, page_ref_ids, page_ref_node,
    ref_node, remove_node_steps,
};
pub use replace::Slice;
pub use resolve::ResolvedPos;
pub use step::{apply_steps, strip_trigger_marks, Step};
