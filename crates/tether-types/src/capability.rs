//! Capability descriptors — the shape of a side's callable surface.
//!
//! A descriptor is exchanged verbatim as the `expose` payload. Namespaces are
//! JSON objects; leaves are the marker string `"fn"`. Leaves never carry code.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '.';

/// Marker for an exposed procedure inside a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafMarker {
    #[serde(rename = "fn")]
    Fn,
}

/// A recursively nested capability descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Capability {
    /// An exposed procedure.
    Leaf(LeafMarker),
    /// A container of named capabilities.
    Namespace(BTreeMap<String, Capability>),
}

impl Default for Capability {
    fn default() -> Self {
        Capability::Namespace(BTreeMap::new())
    }
}

/// Split a dotted path into segments, rejecting empty segments.
pub fn split_path(path: &str) -> Option<Vec<&str>> {
    let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

impl Capability {
    /// An empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a descriptor holding one leaf per dotted path.
    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        let mut desc = Self::new();
        for path in paths {
            desc.insert_path(path);
        }
        desc
    }

    /// Add a leaf at `path`, creating namespaces on the way. Returns `false`
    /// when the path is invalid or collides with an existing node.
    pub fn insert_path(&mut self, path: &str) -> bool {
        let Some(segments) = split_path(path) else {
            return false;
        };
        let Some((last, parents)) = segments.split_last() else {
            return false;
        };
        let mut node = self;
        for segment in parents {
            let Capability::Namespace(children) = node else {
                return false;
            };
            node = children
                .entry((*segment).to_string())
                .or_insert_with(Capability::new);
        }
        match node {
            Capability::Namespace(children) if !children.contains_key(*last) => {
                children.insert((*last).to_string(), Capability::Leaf(LeafMarker::Fn));
                true
            }
            _ => false,
        }
    }

    /// Every leaf as a dotted path, in sorted order.
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths(String::new(), &mut out);
        out
    }

    fn collect_paths(&self, prefix: String, out: &mut Vec<String>) {
        match self {
            Capability::Leaf(_) => {
                if !prefix.is_empty() {
                    out.push(prefix);
                }
            }
            Capability::Namespace(children) => {
                for (name, child) in children {
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{prefix}{PATH_SEPARATOR}{name}")
                    };
                    child.collect_paths(path, out);
                }
            }
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Capability::Leaf(_))
    }

    /// Whether the descriptor advertises no procedures at all.
    pub fn is_empty(&self) -> bool {
        self.leaf_paths().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let desc = Capability::from_paths(["pizza", "cat.listen", "a.b.c"]);
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "pizza": "fn",
                "cat": { "listen": "fn" },
                "a": { "b": { "c": "fn" } }
            })
        );
        let back: Capability = serde_json::from_value(json).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn test_leaf_paths_sorted() {
        let desc = Capability::from_paths(["z", "a.y", "a.x"]);
        assert_eq!(desc.leaf_paths(), vec!["a.x", "a.y", "z"]);
    }

    #[test]
    fn test_insert_rejects_bad_paths_and_collisions() {
        let mut desc = Capability::new();
        assert!(desc.insert_path("a.b"));
        assert!(!desc.insert_path("a.b"));
        assert!(!desc.insert_path("a.b.c"));
        assert!(!desc.insert_path("a"));
        assert!(!desc.insert_path(""));
        assert!(!desc.insert_path("a..b"));
        assert_eq!(desc.leaf_paths(), vec!["a.b"]);
    }

    #[test]
    fn test_leaf_with_code_is_rejected() {
        let bad = serde_json::json!({ "f": "function () { return 1; }" });
        assert!(serde_json::from_value::<Capability>(bad).is_err());
    }

    #[test]
    fn test_empty() {
        assert!(Capability::new().is_empty());
        let only_namespaces: Capability =
            serde_json::from_value(serde_json::json!({ "a": { "b": {} } })).unwrap();
        assert!(only_namespaces.is_empty());
    }
}
