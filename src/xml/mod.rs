//! Arena-based XML document model.
//!
//! One [`Document`] holds the complete element tree of a single fragment
//! file. Nodes live in a flat arena and address each other through
//! [`NodeId`] handles, so parent/child back-references never form owning
//! cycles and a whole document can be cloned with a handful of `Vec`
//! copies.
//!
//! The model is deliberately *raw*: tag names and attribute keys are kept
//! exactly as written in the file (namespace prefixes included), and
//! attributes are stored in an order-preserving map. Byte-faithful
//! serialization depends on both properties.

pub mod reader;
pub mod writer;

use indexmap::IndexMap;

/// Attribute keys that carry an element's universal identifier,
/// in lookup order.
pub const ID_ATTRS: [&str; 3] = ["id", "uid", "xmi:id"];

/// Opaque handle to a node within one [`Document`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a node represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Element,
    Comment,
}

/// A single node in the document tree.
///
/// For comments, only `kind` and `text` are meaningful.
#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    /// Tag name as written, prefix included.
    pub tag: String,
    /// Attributes in document order, keys as written.
    pub attrs: IndexMap<String, String>,
    /// Text before the first child (comment text for comments).
    pub text: Option<String>,
    /// Text following this node, inside its parent.
    pub tail: Option<String>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

impl Node {
    fn element(tag: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Element,
            tag: tag.into(),
            attrs: IndexMap::new(),
            text: None,
            tail: None,
            children: Vec::new(),
            parent: None,
        }
    }

    fn comment(text: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Comment,
            tag: String::new(),
            attrs: IndexMap::new(),
            text: Some(text.into()),
            tail: None,
            children: Vec::new(),
            parent: None,
        }
    }

    /// Get an attribute value by its raw key.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// The element's universal identifier, if it carries one.
    pub fn id(&self) -> Option<&str> {
        ID_ATTRS.iter().find_map(|key| self.attr(key))
    }

    /// The element's `xsi:type` attribute, as written.
    pub fn type_tag(&self) -> Option<&str> {
        self.attr("xsi:type")
    }

    /// The unqualified part of the `xsi:type` attribute.
    pub fn type_name(&self) -> Option<&str> {
        self.type_tag()
            .map(|t| t.rsplit(':').next().unwrap_or(t))
    }

    /// Whether this element is a placeholder linking into another fragment.
    pub fn is_placeholder(&self) -> bool {
        self.attrs.contains_key("href")
    }
}

/// One parsed fragment file as an arena of nodes.
#[derive(Clone, Debug)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
    /// Top-level comments before the root element (e.g. the Capella
    /// version comment).
    pub leading_comments: Vec<String>,
    /// Top-level comments after the root element.
    pub trailing_comments: Vec<String>,
}

impl Document {
    /// Create a document containing only a root element.
    pub fn new(root_tag: impl Into<String>) -> Self {
        Self {
            nodes: vec![Node::element(root_tag)],
            root: NodeId(0),
            leading_comments: Vec::new(),
            trailing_comments: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Create a detached element node.
    pub fn create_element(&mut self, tag: impl Into<String>) -> NodeId {
        self.push(Node::element(tag))
    }

    /// Create a detached comment node.
    pub fn create_comment(&mut self, text: impl Into<String>) -> NodeId {
        self.push(Node::comment(text))
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).expect("document too large"));
        self.nodes.push(node);
        id
    }

    /// Append `child` at the end of `parent`'s children.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        debug_assert!(self.nodes[child.index()].parent.is_none());
        self.nodes[child.index()].parent = Some(parent);
        self.nodes[parent.index()].children.push(child);
    }

    /// Insert `child` at `index` within `parent`'s children.
    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        debug_assert!(self.nodes[child.index()].parent.is_none());
        self.nodes[child.index()].parent = Some(parent);
        self.nodes[parent.index()].children.insert(index, child);
    }

    /// Detach `child` from its parent. The node stays in the arena but is
    /// no longer reachable from the root.
    pub fn detach(&mut self, child: NodeId) {
        if let Some(parent) = self.nodes[child.index()].parent.take() {
            self.nodes[parent.index()].children.retain(|c| *c != child);
        }
    }

    /// Pre-order traversal of the subtree rooted at `start`, including
    /// `start` itself. Comments are skipped.
    pub fn iter_subtree(&self, start: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut stack = vec![start];
        std::iter::from_fn(move || {
            let id = stack.pop()?;
            let node = self.node(id);
            stack.extend(node.children.iter().rev());
            Some(id)
        })
        .filter(|id| self.node(*id).kind == NodeKind::Element)
    }

    /// Physical ancestors of `id` within this document, nearest first.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut current = self.node(id).parent;
        std::iter::from_fn(move || {
            let id = current?;
            current = self.node(id).parent;
            Some(id)
        })
    }

    /// Element children of `id`, in document order.
    pub fn element_children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id)
            .children
            .iter()
            .copied()
            .filter(|c| self.node(*c).kind == NodeKind::Element)
    }

    /// Find the position of `child` among `parent`'s children.
    pub fn child_position(&self, parent: NodeId, child: NodeId) -> Option<usize> {
        self.node(parent).children.iter().position(|c| *c == child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_sets_parent() {
        let mut doc = Document::new("root");
        let child = doc.create_element("ownedThings");
        doc.append_child(doc.root(), child);
        assert_eq!(doc.node(child).parent, Some(doc.root()));
        assert_eq!(doc.node(doc.root()).children, vec![child]);
    }

    #[test]
    fn detach_unlinks_both_directions() {
        let mut doc = Document::new("root");
        let child = doc.create_element("ownedThings");
        doc.append_child(doc.root(), child);
        doc.detach(child);
        assert_eq!(doc.node(child).parent, None);
        assert!(doc.node(doc.root()).children.is_empty());
    }

    #[test]
    fn subtree_iteration_is_preorder() {
        let mut doc = Document::new("root");
        let a = doc.create_element("a");
        let b = doc.create_element("b");
        let c = doc.create_element("c");
        doc.append_child(doc.root(), a);
        doc.append_child(a, b);
        doc.append_child(doc.root(), c);
        let order: Vec<_> = doc.iter_subtree(doc.root()).collect();
        assert_eq!(order, vec![doc.root(), a, b, c]);
    }

    #[test]
    fn id_lookup_tries_all_id_attrs() {
        let mut doc = Document::new("root");
        let n = doc.create_element("e");
        doc.node_mut(n)
            .attrs
            .insert("xmi:id".into(), "1234".into());
        assert_eq!(doc.node(n).id(), Some("1234"));
    }

    #[test]
    fn type_name_strips_prefix() {
        let mut doc = Document::new("root");
        let n = doc.create_element("e");
        doc.node_mut(n).attrs.insert(
            "xsi:type".into(),
            "org.polarsys.capella.core.data.la:LogicalFunction".into(),
        );
        assert_eq!(doc.node(n).type_name(), Some("LogicalFunction"));
    }
}
