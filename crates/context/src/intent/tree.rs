//! Intent tree registry

use super::{IntentKind, IntentLevel, IntentNode};
use askforge_common::errors::{AppError, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Arena of intent nodes keyed by id, with derived child lists
#[derive(Debug, Default)]
pub struct IntentTree {
    nodes: HashMap<String, Arc<IntentNode>>,
    children: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

#[derive(Deserialize)]
struct TreeFile {
    nodes: Vec<IntentNode>,
}

fn invalid(message: String) -> AppError {
    AppError::IntentTree { message }
}

impl IntentTree {
    /// Build and validate a tree.
    ///
    /// Rejects duplicate ids, dangling parents, cycles, and MCP nodes without
    /// a tool id.
    pub fn from_nodes(nodes: Vec<IntentNode>) -> Result<Self> {
        let mut tree = Self::default();

        for node in nodes {
            if node.id.trim().is_empty() {
                return Err(invalid("node with empty id".to_string()));
            }
            if let IntentKind::Mcp { tool_id } = &node.kind {
                if tool_id.trim().is_empty() {
                    return Err(invalid(format!("MCP node '{}' has no tool id", node.id)));
                }
            }
            if tree.nodes.contains_key(&node.id) {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
            tree.order.push(node.id.clone());
            tree.nodes.insert(node.id.clone(), Arc::new(node));
        }

        for id in &tree.order {
            let node = &tree.nodes[id];
            if let Some(parent_id) = &node.parent_id {
                if !tree.nodes.contains_key(parent_id) {
                    return Err(invalid(format!(
                        "node '{}' references missing parent '{}'",
                        id, parent_id
                    )));
                }
                tree.children
                    .entry(parent_id.clone())
                    .or_default()
                    .push(id.clone());
            }
        }

        for id in &tree.order {
            let mut seen = HashSet::new();
            let mut cursor = Some(id.as_str());
            while let Some(current) = cursor {
                if !seen.insert(current) {
                    return Err(invalid(format!("cycle through node '{}'", id)));
                }
                cursor = tree.nodes[current].parent_id.as_deref();
            }
        }

        Ok(tree)
    }

    /// Parse `{"nodes": [...]}`
    pub fn from_json(json: &str) -> Result<Self> {
        let file: TreeFile = serde_json::from_str(json)
            .map_err(|e| invalid(format!("malformed intent tree: {}", e)))?;
        Self::from_nodes(file.nodes)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read {}: {}", path.display(), e)))?;
        let tree = Self::from_json(&json)?;
        info!(path = %path.display(), nodes = tree.len(), "Intent tree loaded");
        Ok(tree)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<IntentNode>> {
        self.nodes.get(id)
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<IntentNode>> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn parent(&self, node: &IntentNode) -> Option<&Arc<IntentNode>> {
        node.parent_id.as_deref().and_then(|id| self.nodes.get(id))
    }

    pub fn is_leaf(&self, id: &str) -> bool {
        self.children.get(id).map_or(true, Vec::is_empty)
    }

    /// Leaves a question can be classified into
    pub fn leaves(&self) -> impl Iterator<Item = &Arc<IntentNode>> {
        self.nodes()
            .filter(|n| self.is_leaf(&n.id) && n.kind != IntentKind::System)
    }

    /// Ids from the root down to `id`, inclusive. Empty for unknown ids.
    pub fn path_from_root(&self, id: &str) -> Vec<String> {
        let mut path = Vec::new();
        let mut cursor = self.nodes.get(id);
        while let Some(node) = cursor {
            path.push(node.id.clone());
            cursor = self.parent(node);
        }
        path.reverse();
        path
    }

    /// Names along the path, joined for display
    pub fn display_path(&self, id: &str) -> String {
        self.path_from_root(id)
            .iter()
            .filter_map(|p| self.nodes.get(p))
            .map(|n| n.name.as_str())
            .collect::<Vec<_>>()
            .join(" > ")
    }

    pub fn is_descendant_or_self(&self, id: &str, ancestor_id: &str) -> bool {
        let mut cursor = self.nodes.get(id);
        while let Some(node) = cursor {
            if node.id == ancestor_id {
                return true;
            }
            cursor = self.parent(node);
        }
        false
    }

    /// The system a node belongs to: the nearest node, itself included, at
    /// Category level directly under a Domain. Falls back to the node itself.
    pub fn system_of<'a>(&'a self, node: &'a Arc<IntentNode>) -> &'a Arc<IntentNode> {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if current.level == IntentLevel::Category {
                if let Some(parent) = self.parent(current) {
                    if parent.level == IntentLevel::Domain {
                        return current;
                    }
                }
            }
            cursor = self.parent(current);
        }
        node
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn node(id: &str, name: &str, parent: Option<&str>, level: IntentLevel, kind: IntentKind) -> IntentNode {
        IntentNode {
            id: id.to_string(),
            name: name.to_string(),
            parent_id: parent.map(str::to_string),
            kind,
            level,
            description: String::new(),
            examples: Vec::new(),
            prompt_template: None,
            prompt_snippet: None,
            param_prompt_template: None,
            top_k: None,
        }
    }

    pub fn kb(collection: &str) -> IntentKind {
        IntentKind::Kb {
            collection_name: Some(collection.to_string()),
        }
    }

    /// Two systems under one domain, each with a "Leave policy" topic, plus
    /// a second domain with its own "Leave policy".
    ///
    /// ```text
    /// corp (Domain)
    /// ├── hr (Category)
    /// │   └── hr-policy (Topic)
    /// │       ├── hr-leave  "Leave policy"
    /// │       └── hr-travel "Travel policy"
    /// └── it (Category)
    ///     └── it-policy (Topic)
    ///         └── it-leave  "Leave Policy!"
    /// lab (Domain)
    /// └── lab-ops (Category)
    ///     └── lab-leave "leave policy"
    /// ```
    pub fn sample_tree() -> IntentTree {
        use IntentLevel::*;
        IntentTree::from_nodes(vec![
            node("corp", "Corporate", None, Domain, IntentKind::System),
            node("hr", "HR System", Some("corp"), Category, IntentKind::System),
            node("hr-policy", "HR Policies", Some("hr"), Topic, IntentKind::System),
            node("hr-leave", "Leave policy", Some("hr-policy"), Leaf, kb("kb_hr_leave")),
            node("hr-travel", "Travel policy", Some("hr-policy"), Leaf, kb("kb_hr_travel")),
            node("it", "IT System", Some("corp"), Category, IntentKind::System),
            node("it-policy", "IT Policies", Some("it"), Topic, IntentKind::System),
            node("it-leave", "Leave Policy!", Some("it-policy"), Leaf, kb("kb_it_leave")),
            node("lab", "Research Lab", None, Domain, IntentKind::System),
            node("lab-ops", "Lab Operations", Some("lab"), Category, IntentKind::System),
            node("lab-leave", "leave policy", Some("lab-ops"), Leaf, kb("kb_lab_leave")),
        ])
        .unwrap()
    }
}
