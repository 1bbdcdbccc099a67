//! The container hierarchy.
//!
//! `SampleStore` owns every node of a run. The path index sits behind a short-lived
//! `RwLock`; each node carries its own `Mutex` for attribute merges and child registration, so
//! updates to unrelated containers never wait on each other.

use super::key::{canonical_field, ContainerPath, KeyFields, NodeKind, Segment};
use crate::error::{FlowError, FlowResult};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Free-form node attributes.
pub type Attributes = BTreeMap<String, Value>;

struct NodeCell {
    path: ContainerPath,
    data: Mutex<NodeData>,
}

#[derive(Default)]
struct NodeData {
    attributes: Attributes,
    children: Vec<ContainerPath>,
}

/// Shared handle to a node of the hierarchy.
#[derive(Clone)]
pub struct NodeRef {
    cell: Arc<NodeCell>,
}

impl NodeRef {
    /// Path of the node.
    pub fn path(&self) -> &ContainerPath {
        &self.cell.path
    }

    /// Level of the node.
    pub fn kind(&self) -> NodeKind {
        self.cell.path.kind()
    }

    /// Snapshot of the current attributes.
    pub fn attributes(&self) -> Attributes {
        self.cell.data.lock().attributes.clone()
    }

    /// One attribute value.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.cell.data.lock().attributes.get(name).cloned()
    }

    /// Destructive union: incoming values overwrite same-named ones, other keys are kept.
    ///
    /// Returns true if anything changed.
    pub(crate) fn merge(&self, attributes: Attributes) -> bool {
        if attributes.is_empty() {
            return false;
        }
        let mut data = self.cell.data.lock();
        let mut changed = false;
        for (name, value) in attributes {
            if data.attributes.get(&name) != Some(&value) {
                data.attributes.insert(name, value);
                changed = true;
            }
        }
        changed
    }

    fn child_paths(&self) -> Vec<ContainerPath> {
        self.cell.data.lock().children.clone()
    }

    fn add_child(&self, path: ContainerPath) {
        self.cell.data.lock().children.push(path);
    }
}

impl std::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("path", &self.cell.path.to_string())
            .field("attributes", &self.attributes())
            .finish()
    }
}

/// Serializable view of a subtree, used by dry runs.
#[derive(Debug, Clone, Serialize)]
pub struct NodeTree {
    /// Path of the node.
    pub path: ContainerPath,
    /// Level of the node.
    pub kind: NodeKind,
    /// Node attributes.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
    /// Child subtrees.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeTree>,
}

/// In-memory sample hierarchy shared by the loader and the workflow.
#[derive(Default)]
pub struct SampleStore {
    nodes: RwLock<HashMap<ContainerPath, Arc<NodeCell>>>,
}

impl SampleStore {
    /// An empty hierarchy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or updates the node of `kind` below `parent`.
    ///
    /// `fields` must hold exactly the identifying fields of `kind`; identifying fields of other
    /// levels are rejected. A plate takes no parent, every other kind requires an existing
    /// parent that can own it.
    pub fn upsert(
        &self,
        kind: NodeKind,
        parent: Option<&ContainerPath>,
        fields: &KeyFields,
        attributes: Attributes,
    ) -> FlowResult<NodeRef> {
        let own = kind.identifying_fields();
        if let Some(foreign) = fields
            .keys()
            .filter_map(|name| canonical_field(name))
            .find(|name| !own.contains(name))
        {
            return Err(FlowError::Validation(format!(
                "'{}' does not identify a {}",
                foreign, kind
            )));
        }
        let segment = Segment::parse(kind, fields)?;

        let path = match (kind, parent) {
            (NodeKind::Plate, None) => ContainerPath::root(segment)?,
            (NodeKind::Plate, Some(parent)) => {
                return Err(FlowError::Validation(format!(
                    "a plate cannot have a parent ('{}')",
                    parent
                )))
            }
            (_, None) => {
                return Err(FlowError::Validation(format!("a {} requires a parent", kind)))
            }
            (_, Some(parent)) => {
                if !self.contains(parent) {
                    return Err(FlowError::Validation(format!(
                        "parent '{}' does not exist",
                        parent
                    )));
                }
                parent.child(segment)?
            }
        };
        Ok(self.insert_or_merge(path, attributes))
    }

    /// Creates `path` and every missing ancestor top-down, then merges `attributes` into the
    /// deepest node. Ancestors receive no attributes.
    pub fn upsert_path(&self, path: &ContainerPath, attributes: Attributes) -> NodeRef {
        if let Some(parent) = path.parent() {
            for prefix in parent.prefixes() {
                self.insert_or_merge(prefix, Attributes::new());
            }
        }
        self.insert_or_merge(path.clone(), attributes)
    }

    fn insert_or_merge(&self, path: ContainerPath, attributes: Attributes) -> NodeRef {
        if let Some(cell) = self.nodes.read().get(&path).cloned() {
            let node = NodeRef { cell };
            node.merge(attributes);
            return node;
        }

        let (node, created) = {
            let mut nodes = self.nodes.write();
            match nodes.entry(path.clone()) {
                Entry::Occupied(entry) => (
                    NodeRef {
                        cell: entry.get().clone(),
                    },
                    false,
                ),
                Entry::Vacant(entry) => {
                    let cell = Arc::new(NodeCell {
                        path: path.clone(),
                        data: Mutex::new(NodeData {
                            attributes: Attributes::new(),
                            children: Vec::new(),
                        }),
                    });
                    entry.insert(cell.clone());
                    (NodeRef { cell }, true)
                }
            }
        };

        if created {
            debug!("Created {} '{}'", path.kind(), path);
            if let Some(parent) = path.parent().and_then(|p| self.node(&p)) {
                parent.add_child(path);
            }
        }
        node.merge(attributes);
        node
    }

    /// Looks up a node, checking that it has the expected kind.
    pub fn get(&self, kind: NodeKind, key: &ContainerPath) -> FlowResult<Option<NodeRef>> {
        if key.kind() != kind {
            return Err(FlowError::TypeMismatch {
                path: key.to_string(),
                expected: kind,
                found: key.kind(),
            });
        }
        Ok(self.node(key))
    }

    /// Looks up a node by path alone.
    pub fn node(&self, key: &ContainerPath) -> Option<NodeRef> {
        self.nodes
            .read()
            .get(key)
            .cloned()
            .map(|cell| NodeRef { cell })
    }

    /// True if a node exists at `key`.
    pub fn contains(&self, key: &ContainerPath) -> bool {
        self.nodes.read().contains_key(key)
    }

    /// The node's ancestors and the node itself, plate first.
    pub fn ancestors(&self, key: &ContainerPath) -> FlowResult<Vec<NodeRef>> {
        key.prefixes()
            .map(|prefix| {
                self.node(&prefix)
                    .ok_or_else(|| FlowError::NotFound(prefix.to_string()))
            })
            .collect()
    }

    /// Direct children of `key` of the given kind.
    ///
    /// The child list is captured when called; nodes are resolved as the iterator advances.
    pub fn children(
        &self,
        key: &ContainerPath,
        kind: NodeKind,
    ) -> FlowResult<impl Iterator<Item = NodeRef> + '_> {
        let parent = self
            .node(key)
            .ok_or_else(|| FlowError::NotFound(key.to_string()))?;
        if !parent.kind().can_own(kind) {
            return Err(FlowError::Validation(format!(
                "a {} never owns a {}",
                parent.kind(),
                kind
            )));
        }
        Ok(parent
            .child_paths()
            .into_iter()
            .filter(move |path| path.kind() == kind)
            .filter_map(move |path| self.node(&path)))
    }

    /// All nodes of one kind, ordered by path.
    pub fn nodes_of_kind(&self, kind: NodeKind) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = self
            .nodes
            .read()
            .values()
            .filter(|cell| cell.path.kind() == kind)
            .map(|cell| NodeRef { cell: cell.clone() })
            .collect();
        nodes.sort_by(|a, b| a.path().cmp(b.path()));
        nodes
    }

    /// Every node, ordered by path.
    pub fn all_nodes(&self) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = self
            .nodes
            .read()
            .values()
            .map(|cell| NodeRef { cell: cell.clone() })
            .collect();
        nodes.sort_by(|a, b| a.path().cmp(b.path()));
        nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// True if the hierarchy has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Nested view of every plate and its descendants.
    pub fn tree(&self) -> Vec<NodeTree> {
        self.nodes_of_kind(NodeKind::Plate)
            .iter()
            .map(|plate| self.subtree(plate))
            .collect()
    }

    fn subtree(&self, node: &NodeRef) -> NodeTree {
        let mut children: Vec<NodeRef> = node
            .child_paths()
            .iter()
            .filter_map(|path| self.node(path))
            .collect();
        children.sort_by(|a, b| a.path().cmp(b.path()));
        NodeTree {
            path: node.path().clone(),
            kind: node.kind(),
            attributes: node.attributes(),
            children: children.iter().map(|child| self.subtree(child)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::key::{CHANNEL_ID, FIELD_X, FIELD_Y, PLATE_NAME, WELL_X, WELL_Y};
    use serde_json::json;

    fn fields(pairs: &[(&str, &str)]) -> KeyFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn well_store() -> (SampleStore, ContainerPath) {
        let store = SampleStore::new();
        let plate = store
            .upsert(NodeKind::Plate, None, &fields(&[(PLATE_NAME, "00")]), Attributes::new())
            .unwrap();
        let well = store
            .upsert(
                NodeKind::Well,
                Some(plate.path()),
                &fields(&[(WELL_X, "1"), (WELL_Y, "1")]),
                Attributes::new(),
            )
            .unwrap();
        (store, well.path().clone())
    }

    #[test]
    fn test_upsert_requires_identifying_fields() {
        let (store, well) = well_store();
        let err = store
            .upsert(
                NodeKind::Field,
                Some(&well),
                &fields(&[(FIELD_X, "0")]),
                Attributes::new(),
            )
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
    }

    #[test]
    fn test_upsert_rejects_foreign_fields() {
        let (store, well) = well_store();
        let err = store
            .upsert(
                NodeKind::Channel,
                Some(&well),
                &fields(&[(CHANNEL_ID, "0"), (FIELD_X, "1")]),
                Attributes::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("'field_x' does not identify a channel"));
    }

    #[test]
    fn test_upsert_requires_existing_parent() {
        let store = SampleStore::new();
        let missing = ContainerPath::plate("01");
        let err = store
            .upsert(
                NodeKind::Well,
                Some(&missing),
                &fields(&[(WELL_X, "0"), (WELL_Y, "0")]),
                Attributes::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_merge_is_destructive_union() {
        let (store, well) = well_store();
        let channel = fields(&[(CHANNEL_ID, "0")]);
        store
            .upsert(
                NodeKind::Channel,
                Some(&well),
                &channel,
                attrs(&[("gain", json!(700)), ("color", json!("green"))]),
            )
            .unwrap();
        let node = store
            .upsert(
                NodeKind::Channel,
                Some(&well),
                &channel,
                attrs(&[("gain", json!(800))]),
            )
            .unwrap();
        assert_eq!(node.attribute("gain"), Some(json!(800)));
        assert_eq!(node.attribute("color"), Some(json!("green")));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_repeat_upsert_is_noop() {
        let (store, well) = well_store();
        let node = store.node(&well).unwrap();
        assert!(node.merge(attrs(&[("note", json!("a"))])));
        assert!(!node.merge(attrs(&[("note", json!("a"))])));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_get_checks_kind() {
        let (store, well) = well_store();
        assert!(store.get(NodeKind::Well, &well).unwrap().is_some());
        let err = store.get(NodeKind::Field, &well).unwrap_err();
        assert!(matches!(
            err,
            FlowError::TypeMismatch {
                expected: NodeKind::Field,
                found: NodeKind::Well,
                ..
            }
        ));
        let absent = well.field(5, 5).unwrap();
        assert!(store.get(NodeKind::Field, &absent).unwrap().is_none());
    }

    #[test]
    fn test_upsert_path_creates_ancestors_without_attributes() {
        let store = SampleStore::new();
        let path = ContainerPath::plate("00")
            .well(2, 3)
            .and_then(|p| p.field(1, 0))
            .and_then(|p| p.channel(1))
            .unwrap();
        let node = store.upsert_path(&path, attrs(&[("gain", json!(600))]));
        assert_eq!(node.kind(), NodeKind::Channel);
        assert_eq!(store.len(), 4);

        let chain = store.ancestors(&path).unwrap();
        let kinds: Vec<_> = chain.iter().map(|n| n.kind()).collect();
        assert_eq!(
            kinds,
            vec![NodeKind::Plate, NodeKind::Well, NodeKind::Field, NodeKind::Channel]
        );
        assert!(chain[..3].iter().all(|n| n.attributes().is_empty()));
        assert_eq!(chain[3].attribute("gain"), Some(json!(600)));
    }

    #[test]
    fn test_children_filters_by_kind() {
        let (store, well) = well_store();
        store.upsert_path(&well.field(0, 0).unwrap(), Attributes::new());
        store.upsert_path(&well.field(0, 1).unwrap(), Attributes::new());
        store.upsert_path(&well.channel(0).unwrap(), Attributes::new());

        assert_eq!(store.children(&well, NodeKind::Field).unwrap().count(), 2);
        assert_eq!(store.children(&well, NodeKind::Channel).unwrap().count(), 1);
        assert!(store.children(&well, NodeKind::Plate).is_err());
        assert!(store
            .children(&well.field(9, 9).unwrap(), NodeKind::Channel)
            .is_err());
    }

    #[test]
    fn test_ancestors_of_missing_node() {
        let (store, well) = well_store();
        let err = store.ancestors(&well.field(0, 0).unwrap()).unwrap_err();
        assert!(matches!(err, FlowError::NotFound(_)));
    }

    #[test]
    fn test_concurrent_upserts_of_same_node() {
        let store = Arc::new(SampleStore::new());
        let path = ContainerPath::plate("00").well(0, 0).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let path = path.clone();
                std::thread::spawn(move || {
                    store.upsert_path(&path, attrs(&[(&format!("k{}", i), json!(i))]));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.node(&path).unwrap().attributes().len(), 8);
        let plate = ContainerPath::plate("00");
        assert_eq!(store.children(&plate, NodeKind::Well).unwrap().count(), 1);
    }
}
