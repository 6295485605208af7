//! Arena-backed path tree.

use std::collections::BTreeMap;
use std::fmt;

use crate::storage::normalize_path;

type NodeId = usize;

const ROOT: NodeId = 0;

/// What a node stands for in the canonical listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// the repository root, nothing requested yet
    Root,
    /// intermediate directory with further structure
    Branch,
    /// one exact key
    Leaf,
    /// directory listed one level deep
    Level,
    /// directory listed recursively; subsumes everything beneath it
    Star,
}

/// One listing request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListSpec {
    pub path: String,
    pub recursive: bool,
}

impl ListSpec {
    pub fn new(path: impl Into<String>, recursive: bool) -> Self {
        Self {
            path: path.into(),
            recursive,
        }
    }

    /// true when the spec names a directory rather than a key
    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }
}

impl fmt::Display for ListSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.recursive {
            write!(f, "{}**", self.path)
        } else {
            write!(f, "{}", self.path)
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    /// `"name/"` for directories, `"name"` for keys, `""` for the root
    segment: String,
    parent: Option<NodeId>,
    kind: NodeKind,
    children: BTreeMap<String, NodeId>,
}

/// Canonicalizing trie of listing requests.
///
/// Nodes live in a flat arena and refer to each other by index. Subtrees
/// replaced by a Star are unlinked from their parent and left in the arena
/// until the tree is dropped.
#[derive(Debug, Clone)]
pub struct PathTree {
    nodes: Vec<Node>,
}

impl Default for PathTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                segment: String::new(),
                parent: None,
                kind: NodeKind::Root,
                children: BTreeMap::new(),
            }],
        }
    }

    /// build a tree from a batch of specs
    pub fn from_specs<'a, I>(specs: I) -> Self
    where
        I: IntoIterator<Item = &'a ListSpec>,
    {
        let mut tree = Self::new();
        for spec in specs {
            tree.insert(&spec.path, spec.recursive);
        }
        tree
    }

    /// canonical form of a batch of specs
    pub fn canonicalize(specs: &[ListSpec]) -> Vec<ListSpec> {
        Self::from_specs(specs).extract()
    }

    pub fn insert(&mut self, path: &str, recursive: bool) {
        let normalized = normalize_path(path);
        let is_directory = normalized.is_empty() || normalized.ends_with('/');

        let mut segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
        let leaf = if is_directory { None } else { segments.pop() };

        let mut current = ROOT;
        for segment in segments {
            if self.nodes[current].kind == NodeKind::Star {
                return;
            }
            current = self.directory_child(current, segment);
        }

        match leaf {
            Some(name) => self.insert_leaf(current, name),
            None if recursive => self.make_star(current),
            None => self.make_level(current),
        }
    }

    /// get or create the directory child `segment/` of `parent`
    fn directory_child(&mut self, parent: NodeId, segment: &str) -> NodeId {
        let key = format!("{}/", segment);
        if let Some(&id) = self.nodes[parent].children.get(&key) {
            return id;
        }
        self.push_child(parent, key, NodeKind::Branch)
    }

    fn push_child(&mut self, parent: NodeId, segment: String, kind: NodeKind) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            segment: segment.clone(),
            parent: Some(parent),
            kind,
            children: BTreeMap::new(),
        });
        self.nodes[parent].children.insert(segment, id);
        id
    }

    fn insert_leaf(&mut self, parent: NodeId, name: &str) {
        match self.nodes[parent].kind {
            // already covered by the directory listing
            NodeKind::Star | NodeKind::Level => {}
            NodeKind::Root | NodeKind::Branch => {
                if !self.nodes[parent].children.contains_key(name) {
                    self.push_child(parent, name.to_string(), NodeKind::Leaf);
                }
            }
            NodeKind::Leaf => unreachable!("leaf nodes have no children"),
        }
    }

    fn make_star(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        node.kind = NodeKind::Star;
        node.children.clear();
    }

    fn make_level(&mut self, id: NodeId) {
        match self.nodes[id].kind {
            NodeKind::Star | NodeKind::Level => {}
            NodeKind::Root | NodeKind::Branch => {
                let leaves: Vec<String> = self.nodes[id]
                    .children
                    .iter()
                    .filter(|(_, &child)| self.nodes[child].kind == NodeKind::Leaf)
                    .map(|(segment, _)| segment.clone())
                    .collect();
                let node = &mut self.nodes[id];
                node.kind = NodeKind::Level;
                for segment in leaves {
                    node.children.remove(&segment);
                }
            }
            NodeKind::Leaf => unreachable!("directory requests never land on a leaf"),
        }
    }

    /// the canonical set of specs, sorted by path
    pub fn extract(&self) -> Vec<ListSpec> {
        let mut out = Vec::new();
        self.extract_from(ROOT, "", &mut out);
        out.sort();
        out
    }

    fn extract_from(&self, id: NodeId, prefix: &str, out: &mut Vec<ListSpec>) {
        let node = &self.nodes[id];
        let path = format!("{}{}", prefix, node.segment);
        let shown = if path.is_empty() { "/" } else { path.as_str() };

        match node.kind {
            NodeKind::Star => out.push(ListSpec::new(shown, true)),
            NodeKind::Leaf => out.push(ListSpec::new(shown, false)),
            NodeKind::Level => {
                out.push(ListSpec::new(shown, false));
                for &child in node.children.values() {
                    self.extract_from(child, &path, out);
                }
            }
            NodeKind::Root | NodeKind::Branch => {
                for &child in node.children.values() {
                    self.extract_from(child, &path, out);
                }
            }
        }
    }

    /// true when any reachable path has a segment starting with `.`
    pub fn contains_hidden(&self) -> bool {
        self.find_hidden(ROOT)
    }

    fn find_hidden(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        node.segment.starts_with('.') || node.children.values().any(|&child| self.find_hidden(child))
    }

    /// full path of a node, walking parent links
    fn path_of(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            segments.push(self.nodes[node_id].segment.as_str());
            current = self.nodes[node_id].parent;
        }
        segments.reverse();
        segments.concat()
    }

    /// kind of the node at a normalized path, for inspection
    pub fn kind_at(&self, path: &str) -> Option<NodeKind> {
        let normalized = normalize_path(path);
        let mut current = ROOT;
        let mut rest = normalized.trim_start_matches('/');
        while !rest.is_empty() {
            let (segment, tail) = match rest.find('/') {
                Some(idx) => rest.split_at(idx + 1),
                None => (rest, ""),
            };
            current = *self.nodes[current].children.get(segment)?;
            rest = tail;
        }
        debug_assert_eq!(self.path_of(current), normalized.trim_start_matches('/'));
        Some(self.nodes[current].kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn specs(items: &[(&str, bool)]) -> Vec<ListSpec> {
        items.iter().map(|(p, r)| ListSpec::new(*p, *r)).collect()
    }

    #[test]
    fn test_star_subsumes_leaf() {
        let out = PathTree::canonicalize(&specs(&[("dir/a/b", false), ("dir/a/", true)]));
        assert_eq!(out, specs(&[("dir/a/", true)]));
    }

    #[test]
    fn test_star_first_then_leaf() {
        let out = PathTree::canonicalize(&specs(&[("dir/a/", true), ("dir/a/b", false), ("dir/a/c/", false)]));
        assert_eq!(out, specs(&[("dir/a/", true)]));
    }

    #[test]
    fn test_duplicates_removed() {
        let out = PathTree::canonicalize(&specs(&[("a", false), ("/a", false), ("//a", true)]));
        assert_eq!(out, specs(&[("a", false)]));
    }

    #[test]
    fn test_level_absorbs_leaves_keeps_branches() {
        let out = PathTree::canonicalize(&specs(&[
            ("dir/x", false),
            ("dir/sub/y", false),
            ("dir/", false),
        ]));
        assert_eq!(out, specs(&[("dir/", false), ("dir/sub/y", false)]));

        let tree = PathTree::from_specs(&specs(&[("dir/", false), ("dir/x", false)]));
        assert_eq!(tree.kind_at("dir/"), Some(NodeKind::Level));
        assert_eq!(tree.kind_at("dir/x"), None);
    }

    #[test]
    fn test_star_overrides_level() {
        let out = PathTree::canonicalize(&specs(&[("dir/", false), ("dir/sub/y", false), ("dir/", true)]));
        assert_eq!(out, specs(&[("dir/", true)]));
    }

    #[test]
    fn test_root_requests() {
        let out = PathTree::canonicalize(&specs(&[("a/b", false), ("/", true)]));
        assert_eq!(out, specs(&[("/", true)]));

        let out = PathTree::canonicalize(&specs(&[("top", false), ("", false), ("a/", true)]));
        assert_eq!(out, specs(&[("/", false), ("a/", true)]));
    }

    #[test]
    fn test_file_request_ignores_recursive_flag() {
        let out = PathTree::canonicalize(&specs(&[("a/b", true)]));
        assert_eq!(out, specs(&[("a/b", false)]));
    }

    #[test]
    fn test_nested_levels_are_distinct() {
        let out = PathTree::canonicalize(&specs(&[("a/", false), ("a/b/", false)]));
        assert_eq!(out, specs(&[("a/", false), ("a/b/", false)]));
    }

    #[test]
    fn test_contains_hidden() {
        assert!(PathTree::from_specs(&specs(&[(".users/git/alice", false)])).contains_hidden());
        assert!(PathTree::from_specs(&specs(&[("a/.secret/", true)])).contains_hidden());
        assert!(!PathTree::from_specs(&specs(&[("a/b.c", false), ("d/", true)])).contains_hidden());
    }

    #[test]
    fn test_kind_at() {
        let tree = PathTree::from_specs(&specs(&[("a/b/c", false), ("x/", true)]));
        assert_eq!(tree.kind_at("/"), Some(NodeKind::Root));
        assert_eq!(tree.kind_at("a/"), Some(NodeKind::Branch));
        assert_eq!(tree.kind_at("a/b/c"), Some(NodeKind::Leaf));
        assert_eq!(tree.kind_at("x/"), Some(NodeKind::Star));
        assert_eq!(tree.kind_at("missing"), None);
    }

    fn spec_strategy() -> impl Strategy<Value = ListSpec> {
        let segment = prop::sample::select(vec!["a", "b", "c", ".h"]);
        (prop::collection::vec(segment, 0..4), any::<bool>(), any::<bool>()).prop_map(
            |(segments, directory, recursive)| {
                let mut path = segments.join("/");
                if directory || path.is_empty() {
                    path.push('/');
                }
                ListSpec::new(path, recursive)
            },
        )
    }

    proptest! {
        #[test]
        fn canonical_form_is_order_independent(
            (batch, shuffled) in prop::collection::vec(spec_strategy(), 0..12)
                .prop_flat_map(|batch| (Just(batch.clone()), Just(batch).prop_shuffle()))
        ) {
            prop_assert_eq!(PathTree::canonicalize(&batch), PathTree::canonicalize(&shuffled));
        }

        #[test]
        fn canonicalization_is_idempotent(batch in prop::collection::vec(spec_strategy(), 0..12)) {
            let once = PathTree::canonicalize(&batch);
            let twice = PathTree::canonicalize(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn star_dominates_its_subtree(batch in prop::collection::vec(spec_strategy(), 0..12)) {
            let mut with_star = batch.clone();
            with_star.push(ListSpec::new("a/", true));
            let out = PathTree::canonicalize(&with_star);

            let root = ListSpec::new("/", true);
            let star = ListSpec::new("a/", true);
            if out.contains(&root) {
                prop_assert_eq!(out, vec![root]);
            } else {
                let under: Vec<&ListSpec> = out.iter().filter(|s| s.path.starts_with("a/")).collect();
                prop_assert_eq!(under, vec![&star]);
            }
        }
    }
}
