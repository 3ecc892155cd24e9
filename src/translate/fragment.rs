//! Structural serialization of content trees.
//! A fragment is flattened into the plain text an engine reads plus a mapping
//! text in which every leaf is wrapped in `<id>...</id>`, where `id` encodes the
//! leaf's structural path. Leaf text inside the mapping is escaped (`&`, `<`, `>`)
//! so it can never forge a wrapper. Translated parts are re-attached by walking
//! the same tree shape again, so ids are only meaningful for the tree that
//! produced them.

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A displayable content tree. Elements are structural only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    Text(String),
    Element { tag: String, children: Vec<Node> },
    Empty,
}

impl Node {
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(text.into())
    }

    pub fn element(tag: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Element {
            tag: tag.into(),
            children,
        }
    }

    /// Tagless container, rendered as its children only.
    pub fn fragment(children: Vec<Node>) -> Self {
        Node::element("", children)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Text(text) => f.write_str(text),
            Node::Empty => Ok(()),
            Node::Element { tag, children } => {
                if !tag.is_empty() {
                    write!(f, "<{tag}>")?;
                }
                for child in children {
                    write!(f, "{child}")?;
                }
                if !tag.is_empty() {
                    write!(f, "</{tag}>")?;
                }
                Ok(())
            }
        }
    }
}

/// Output of [`serialize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Serialized {
    pub flat_text: String,
    pub path_mapping: String,
}

impl Serialized {
    pub fn is_empty(&self) -> bool {
        self.flat_text.is_empty()
    }
}

/// Flatten a fragment. Pure and total: a tree without text yields empty strings.
pub fn serialize(fragment: &Node) -> Serialized {
    let mut flat = String::new();
    let mut mapping = String::new();
    let mut path = Vec::new();
    collect(fragment, &mut path, &mut flat, &mut mapping);
    Serialized {
        flat_text: collapse_whitespace(&flat).trim().to_string(),
        path_mapping: mapping,
    }
}

fn collect(node: &Node, path: &mut Vec<usize>, flat: &mut String, mapping: &mut String) {
    match node {
        Node::Empty => {}
        Node::Text(text) => {
            let collapsed = collapse_whitespace(text);
            flat.push_str(&collapsed);
            if !collapsed.trim().is_empty() {
                let id = leaf_id(path);
                mapping.push_str(&format!("<{id}>{}</{id}>", escape_segment(&collapsed)));
            }
        }
        Node::Element { children, .. } => {
            visit_children(children, path, |child, path| collect(child, path, flat, mapping))
        }
    }
}

/// Re-attach translated parts onto the fragment that produced them.
/// Leaves without a part keep their original text; elements are preserved.
pub fn deserialize(parts: &BTreeMap<String, String>, fragment: &Node) -> Node {
    let mut path = Vec::new();
    rebuild(fragment, parts, &mut path)
}

fn rebuild(node: &Node, parts: &BTreeMap<String, String>, path: &mut Vec<usize>) -> Node {
    match node {
        Node::Empty => Node::Empty,
        Node::Text(text) => {
            if text.trim().is_empty() {
                return node.clone();
            }
            match parts.get(&leaf_id(path)) {
                Some(translated) => Node::Text(translated.clone()),
                None => node.clone(),
            }
        }
        Node::Element { tag, children } => {
            let mut rebuilt = Vec::with_capacity(children.len());
            visit_children(children, path, |child, path| {
                rebuilt.push(rebuild(child, parts, path))
            });
            Node::Element {
                tag: tag.clone(),
                children: rebuilt,
            }
        }
    }
}

/// A single child is descended into without extending the path.
fn visit_children<F>(children: &[Node], path: &mut Vec<usize>, mut visit: F)
where
    F: FnMut(&Node, &mut Vec<usize>),
{
    if let [only] = children {
        visit(only, path);
        return;
    }
    for (index, child) in children.iter().enumerate() {
        path.push(index);
        visit(child, path);
        path.pop();
    }
}

/// Digits concatenated top-down while every index is a single digit,
/// `p` + dot-joined indices otherwise. The root leaf is "0".
fn leaf_id(path: &[usize]) -> String {
    if path.is_empty() {
        return "0".to_string();
    }
    if path.iter().all(|&i| i < 10) {
        path.iter().map(|i| i.to_string()).collect()
    } else {
        let joined: Vec<String> = path.iter().map(|i| i.to_string()).collect();
        format!("p{}", joined.join("."))
    }
}

fn collapse_whitespace(text: &str) -> String {
    static WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static whitespace pattern"));
    WS.replace_all(text, " ").into_owned()
}

/// Escape leaf text for the mapping. `flat_text` keeps the raw text.
pub fn escape_segment(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

/// Ids of the leaves wrapped in a path mapping, in document order.
pub fn leaf_ids(path_mapping: &str) -> Vec<String> {
    static OPEN_TAG: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"<(\d+|p[\d.]+)>").expect("static leaf-id pattern"));
    OPEN_TAG
        .captures_iter(path_mapping)
        .map(|c| c[1].to_string())
        .collect()
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::translate::test_support::mapping_leaves;
    use proptest::prelude::*;

    /// Leaf text including blanks and characters the mapping must escape.
    fn leaf_text() -> impl Strategy<Value = String> {
        "[a-z <&>]{0,6}"
    }

    /// Arbitrary trees, with wide elements (up to 14 children) and single-child chains.
    fn node_strategy() -> impl Strategy<Value = Node> {
        let leaf = prop_oneof![
            4 => leaf_text().prop_map(Node::Text),
            1 => Just(Node::Empty),
        ];
        leaf.prop_recursive(4, 96, 14, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..14)
                    .prop_map(|children| Node::element("span", children)),
                inner.prop_map(|child| Node::element("b", vec![child])),
            ]
        })
    }

    fn same_shape(a: &Node, b: &Node) -> bool {
        match (a, b) {
            (Node::Empty, Node::Empty) | (Node::Text(_), Node::Text(_)) => true,
            (
                Node::Element { tag: ta, children: ca },
                Node::Element { tag: tb, children: cb },
            ) => {
                ta == tb
                    && ca.len() == cb.len()
                    && ca.iter().zip(cb).all(|(x, y)| same_shape(x, y))
            }
            _ => false,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(512))]

        /// Serializing an unchanged tree twice gives the same output.
        #[test]
        fn prop_serialize_is_idempotent(tree in node_strategy()) {
            prop_assert_eq!(serialize(&tree), serialize(&tree));
        }

        /// No parts means the tree comes back unchanged.
        #[test]
        fn prop_empty_parts_is_identity(tree in node_strategy()) {
            prop_assert_eq!(deserialize(&BTreeMap::new(), &tree), tree);
        }

        /// Every leaf gets a distinct id, and assigning a value to each id
        /// replaces exactly those leaves while preserving the shape.
        #[test]
        fn prop_full_parts_round_trip(tree in node_strategy()) {
            let ids = leaf_ids(&serialize(&tree).path_mapping);
            let assigned: BTreeMap<String, String> =
                ids.iter().map(|id| (id.clone(), format!("T{id}"))).collect();
            prop_assert_eq!(assigned.len(), ids.len());

            let out = deserialize(&assigned, &tree);
            prop_assert!(same_shape(&tree, &out));

            let leaves = mapping_leaves(&serialize(&out).path_mapping);
            let expected: Vec<(String, String)> =
                ids.iter().map(|id| (id.clone(), format!("T{id}"))).collect();
            prop_assert_eq!(leaves, expected);
        }

        /// The mapping always names exactly the non-blank leaves, whatever the leaf text holds.
        #[test]
        fn prop_mapping_ids_match_leaf_count(tree in node_strategy()) {
            fn count(node: &Node) -> usize {
                match node {
                    Node::Text(t) if !t.trim().is_empty() => 1,
                    Node::Element { children, .. } => children.iter().map(count).sum(),
                    _ => 0,
                }
            }
            let s = serialize(&tree);
            prop_assert_eq!(leaf_ids(&s.path_mapping).len(), count(&tree));
            prop_assert_eq!(mapping_leaves(&s.path_mapping).len(), count(&tree));
        }
    }
}
