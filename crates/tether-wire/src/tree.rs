//! Remote tree — the local mirror of the peer's capability descriptor.
//!
//! Merges are additive. A proxy, once created, stays in place for the life
//! of the link so handles held by consumers are never invalidated by a later
//! `expose` from the peer.

use crate::procedure::RemoteProcedure;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use tether_types::capability::{split_path, PATH_SEPARATOR};
use tether_types::Capability;
use tracing::warn;

/// Deepest namespace nesting accepted from a peer.
pub const MAX_DEPTH: usize = 64;

/// One node of the remote tree.
#[derive(Debug, Clone)]
pub enum RemoteNode {
    Namespace(BTreeMap<String, RemoteNode>),
    Procedure(RemoteProcedure),
}

impl RemoteNode {
    pub fn as_procedure(&self) -> Option<&RemoteProcedure> {
        match self {
            RemoteNode::Procedure(p) => Some(p),
            RemoteNode::Namespace(_) => None,
        }
    }
}

/// Shared, incrementally merged tree of remote procedures.
#[derive(Clone, Default)]
pub struct RemoteTree {
    root: Arc<RwLock<BTreeMap<String, RemoteNode>>>,
}

struct MergeState<'a> {
    factory: &'a dyn Fn(&str) -> RemoteProcedure,
    visited: HashSet<String>,
    added: usize,
}

impl RemoteTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a descriptor into the tree. Returns how many proxies were
    /// created.
    pub(crate) fn merge(
        &self,
        descriptor: &Capability,
        factory: &dyn Fn(&str) -> RemoteProcedure,
    ) -> usize {
        let Capability::Namespace(children) = descriptor else {
            warn!("peer descriptor is a bare leaf; nothing to merge");
            return 0;
        };
        let mut state = MergeState {
            factory,
            visited: HashSet::new(),
            added: 0,
        };
        let mut root = self.root.write().unwrap_or_else(|e| e.into_inner());
        merge_level(&mut root, children, "", 0, &mut state);
        state.added
    }

    /// The proxy at a dotted path.
    pub fn get(&self, path: &str) -> Option<RemoteProcedure> {
        self.node(path)?.as_procedure().cloned()
    }

    /// A copy of the node at a dotted path.
    pub fn node(&self, path: &str) -> Option<RemoteNode> {
        let segments = split_path(path)?;
        let root = self.root.read().unwrap_or_else(|e| e.into_inner());
        let (first, rest) = segments.split_first()?;
        let mut node = root.get(*first)?;
        for segment in rest {
            match node {
                RemoteNode::Namespace(children) => node = children.get(*segment)?,
                RemoteNode::Procedure(_) => return None,
            }
        }
        Some(node.clone())
    }

    /// Every proxy path, sorted.
    pub fn paths(&self) -> Vec<String> {
        let root = self.root.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        collect(&root, "", &mut out);
        out
    }

    pub fn len(&self) -> usize {
        self.paths().len()
    }

    pub fn is_empty(&self) -> bool {
        self.root
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub(crate) fn clear(&self) {
        self.root.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}{PATH_SEPARATOR}{name}")
    }
}

fn merge_level(
    target: &mut BTreeMap<String, RemoteNode>,
    incoming: &BTreeMap<String, Capability>,
    prefix: &str,
    depth: usize,
    state: &mut MergeState<'_>,
) {
    if depth >= MAX_DEPTH {
        warn!(prefix, "peer descriptor nested too deeply; truncated");
        return;
    }
    for (name, child) in incoming {
        if name.is_empty() || name.contains(PATH_SEPARATOR) {
            warn!(name = %name, "skipping remote member with an invalid name");
            continue;
        }
        let path = join(prefix, name);
        if !state.visited.insert(path.clone()) {
            continue;
        }
        match (target.get_mut(name), child) {
            (None, Capability::Leaf(_)) => {
                target.insert(name.clone(), RemoteNode::Procedure((state.factory)(&path)));
                state.added += 1;
            }
            (None, Capability::Namespace(grandchildren)) => {
                let mut children = BTreeMap::new();
                merge_level(&mut children, grandchildren, &path, depth + 1, state);
                target.insert(name.clone(), RemoteNode::Namespace(children));
            }
            (Some(RemoteNode::Procedure(_)), Capability::Leaf(_)) => {}
            (Some(RemoteNode::Namespace(children)), Capability::Namespace(grandchildren)) => {
                merge_level(children, grandchildren, &path, depth + 1, state);
            }
            (Some(_), _) => {
                warn!(path = %path, "peer changed the shape of an existing member; kept the old one");
            }
        }
    }
}

fn collect(level: &BTreeMap<String, RemoteNode>, prefix: &str, out: &mut Vec<String>) {
    for (name, node) in level {
        let path = join(prefix, name);
        match node {
            RemoteNode::Procedure(_) => out.push(path),
            RemoteNode::Namespace(children) => collect(children, &path, out),
        }
    }
}

impl std::fmt::Debug for RemoteTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTree")
            .field("paths", &self.paths())
            .finish()
    }
}
