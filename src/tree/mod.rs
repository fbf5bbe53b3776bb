//! Outline tree model.
//!
//! A document is held as an arena of [`SectionNode`]s addressed by stable
//! [`NodeId`]s. Parent and child links are id references, so structural edits
//! mutate the arena in place instead of rebuilding the tree.
//!
//! - [`Tree`] - the document, owning the root and every section
//! - [`SectionNode`] - one heading with its body text
//! - [`Outline`] - an id-free nested view used for comparison and export

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub const ROOT: NodeId = NodeId(Uuid::nil());
    pub const FRONTMATTER: NodeId = NodeId(Uuid::from_u128(1));

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ROOT => f.write_str("root"),
            Self::FRONTMATTER => f.write_str("frontmatter"),
            NodeId(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(Self::ROOT),
            "frontmatter" => Ok(Self::FRONTMATTER),
            other => Uuid::parse_str(other).map(NodeId),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Root,
    Frontmatter,
    Section,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionNode {
    id: NodeId,
    kind: NodeKind,
    title: String,
    level: u32,
    content: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl SectionNode {
    fn root() -> Self {
        Self {
            id: NodeId::ROOT,
            kind: NodeKind::Root,
            title: String::new(),
            level: 0,
            content: String::new(),
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_section(&self) -> bool {
        self.kind == NodeKind::Section
    }
}

/// Title and body for a section that does not exist yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSection {
    pub title: String,
    pub content: String,
}

impl NewSection {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: String::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("node {0} not found")]
    NotFound(NodeId),
    #[error("node {0} is protected")]
    Protected(NodeId),
    #[error("node {0} cannot accept children")]
    InvalidParent(NodeId),
    #[error("moving {node} under {target} would create a cycle")]
    Cycle { node: NodeId, target: NodeId },
}

/// Nested, id-free rendering of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outline {
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    pub level: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Outline>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    name: String,
    root: SectionNode,
    nodes: HashMap<NodeId, SectionNode>,
}

impl Tree {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: SectionNode::root(),
            nodes: HashMap::new(),
        }
    }

    /// Name of the document this tree was built for.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn root(&self) -> &SectionNode {
        &self.root
    }

    pub fn frontmatter(&self) -> Option<&SectionNode> {
        self.nodes.get(&NodeId::FRONTMATTER)
    }

    pub fn get(&self, id: NodeId) -> Option<&SectionNode> {
        if id == NodeId::ROOT {
            Some(&self.root)
        } else {
            self.nodes.get(&id)
        }
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut SectionNode> {
        if id == NodeId::ROOT {
            Some(&mut self.root)
        } else {
            self.nodes.get_mut(&id)
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id == NodeId::ROOT || self.nodes.contains_key(&id)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map(|node| node.children()).unwrap_or(&[])
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|node| node.parent)
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len() + 1
    }

    /// True when the tree holds nothing but the root.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pre-order traversal in document order, starting at the root.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            tree: self,
            stack: vec![NodeId::ROOT],
        }
    }

    /// True when `node` sits strictly below `ancestor`.
    pub fn is_descendant(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = self.parent(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// Replaces, creates or (with `None`) removes the frontmatter block.
    pub fn set_frontmatter(&mut self, raw: Option<String>) {
        match raw {
            Some(raw) => {
                if let Some(existing) = self.nodes.get_mut(&NodeId::FRONTMATTER) {
                    existing.content = raw;
                    return;
                }
                self.nodes.insert(
                    NodeId::FRONTMATTER,
                    SectionNode {
                        id: NodeId::FRONTMATTER,
                        kind: NodeKind::Frontmatter,
                        title: String::new(),
                        level: 0,
                        content: raw,
                        parent: Some(NodeId::ROOT),
                        children: Vec::new(),
                    },
                );
                self.root.children.insert(0, NodeId::FRONTMATTER);
            }
            None => {
                if self.nodes.remove(&NodeId::FRONTMATTER).is_some() {
                    self.root.children.retain(|id| *id != NodeId::FRONTMATTER);
                }
            }
        }
    }

    /// Swaps in a whole new document.
    pub fn replace(&mut self, other: Tree) {
        *self = other;
    }

    pub fn add_child(&mut self, parent_id: NodeId, section: NewSection) -> Result<NodeId, TreeError> {
        let parent_level = self.section_parent_level(parent_id)?;
        Ok(self.insert_section(parent_id, section.title, section.content, parent_level + 1))
    }

    /// Attaches a section with an explicit level. The parser uses this to keep
    /// heading depths that skip levels.
    pub(crate) fn attach(
        &mut self,
        parent_id: NodeId,
        title: String,
        level: u32,
        content: String,
    ) -> Result<NodeId, TreeError> {
        self.section_parent_level(parent_id)?;
        Ok(self.insert_section(parent_id, title, content, level))
    }

    fn section_parent_level(&self, parent_id: NodeId) -> Result<u32, TreeError> {
        if parent_id == NodeId::FRONTMATTER {
            return Err(TreeError::InvalidParent(parent_id));
        }
        self.get(parent_id)
            .map(|parent| parent.level)
            .ok_or(TreeError::NotFound(parent_id))
    }

    fn insert_section(&mut self, parent_id: NodeId, title: String, content: String, level: u32) -> NodeId {
        let id = NodeId::new();
        self.nodes.insert(
            id,
            SectionNode {
                id,
                kind: NodeKind::Section,
                title,
                level,
                content,
                parent: Some(parent_id),
                children: Vec::new(),
            },
        );
        if let Some(parent) = self.get_mut(parent_id) {
            parent.children.push(id);
        }
        id
    }

    pub(crate) fn set_content_unchecked(&mut self, id: NodeId, content: String) {
        if let Some(node) = self.get_mut(id) {
            node.content = content;
        }
    }

    pub fn update_content(&mut self, id: NodeId, content: impl Into<String>) -> Result<(), TreeError> {
        let node = self.get_mut(id).ok_or(TreeError::NotFound(id))?;
        node.content = content.into();
        Ok(())
    }

    /// Renames a section. The root and frontmatter have no title to change.
    pub fn update_title(&mut self, id: NodeId, title: impl Into<String>) -> Result<(), TreeError> {
        if id == NodeId::ROOT || id == NodeId::FRONTMATTER {
            return Err(TreeError::Protected(id));
        }
        let node = self.get_mut(id).ok_or(TreeError::NotFound(id))?;
        node.title = title.into();
        Ok(())
    }

    /// Removes a section and its whole subtree, returning every removed id.
    pub fn delete_node(&mut self, id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        if id == NodeId::ROOT || id == NodeId::FRONTMATTER {
            return Err(TreeError::Protected(id));
        }
        let parent_id = self
            .nodes
            .get(&id)
            .and_then(|node| node.parent)
            .ok_or(TreeError::NotFound(id))?;

        if let Some(parent) = self.get_mut(parent_id) {
            parent.children.retain(|child| *child != id);
        }

        let removed = self.subtree_ids(id);
        for removed_id in &removed {
            self.nodes.remove(removed_id);
        }
        Ok(removed)
    }

    /// Reparents `id` as the last child of `new_parent_id`, relevelling the
    /// moved subtree below its new parent.
    pub fn move_node(&mut self, id: NodeId, new_parent_id: NodeId) -> Result<(), TreeError> {
        if id == NodeId::ROOT || id == NodeId::FRONTMATTER {
            return Err(TreeError::Protected(id));
        }
        if !self.nodes.contains_key(&id) {
            return Err(TreeError::NotFound(id));
        }
        if new_parent_id == NodeId::FRONTMATTER {
            return Err(TreeError::InvalidParent(new_parent_id));
        }
        let Some(new_parent_level) = self.get(new_parent_id).map(|parent| parent.level) else {
            return Err(TreeError::NotFound(new_parent_id));
        };
        if new_parent_id == id || self.is_descendant(new_parent_id, id) {
            return Err(TreeError::Cycle {
                node: id,
                target: new_parent_id,
            });
        }

        if let Some(old_parent) = self.parent(id).and_then(|parent| self.get_mut(parent)) {
            old_parent.children.retain(|child| *child != id);
        }
        if let Some(new_parent) = self.get_mut(new_parent_id) {
            new_parent.children.push(id);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(new_parent_id);
        }
        self.relevel(id, new_parent_level + 1);
        Ok(())
    }

    fn relevel(&mut self, id: NodeId, level: u32) {
        let mut stack = vec![(id, level)];
        while let Some((current, level)) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(&current) {
                node.level = level;
                stack.extend(node.children.iter().map(|child| (*child, level + 1)));
            }
        }
    }

    fn subtree_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            ids.push(current);
            if let Some(node) = self.get(current) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        ids
    }

    /// True when every section sits exactly one level below its parent.
    pub fn is_level_consistent(&self) -> bool {
        self.nodes.values().filter(|node| node.is_section()).all(|node| {
            node.parent
                .and_then(|parent| self.get(parent))
                .is_some_and(|parent| node.level == parent.level + 1)
        })
    }

    pub fn outline(&self) -> Outline {
        self.outline_of(&self.root)
    }

    fn outline_of(&self, node: &SectionNode) -> Outline {
        Outline {
            kind: node.kind,
            title: node.title.clone(),
            level: node.level,
            content: node.content.clone(),
            children: node
                .children
                .iter()
                .filter_map(|child| self.get(*child))
                .map(|child| self.outline_of(child))
                .collect(),
        }
    }
}

pub struct Iter<'a> {
    tree: &'a Tree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a SectionNode;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            if let Some(node) = self.tree.get(id) {
                self.stack.extend(node.children.iter().rev().copied());
                return Some(node);
            }
        }
        None
    }
}
