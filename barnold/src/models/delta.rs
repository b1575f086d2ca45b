use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Target name of the renderer's global options node.
pub const OPTIONS: &str = "options";

/// Reserved target carrying a frame-buffer resize (`name`/`width`/`height`).
pub const MMAP_SIZE: &str = "mmap_size";

/// Type-tagged parameter value as it travels on the wire. `Link` and `Node`
/// reference their target by *name*; the worker resolves names to live
/// handles in a deferred second pass once every node in the delta exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Bool(bool),
    Byte(u8),
    Int(i32),
    Float(f32),
    Rgb([f32; 3]),
    Rgba([f32; 4]),
    Vector([f32; 3]),
    Vector2([f32; 2]),
    Str(String),
    Matrix([[f32; 4]; 4]),
    Array(Vec<ParamValue>),
    Link(String),
    Node(String),
}

impl ParamValue {
    /// True when applying this value needs another node to exist first.
    pub fn is_deferred(&self) -> bool {
        match self {
            ParamValue::Link(_) | ParamValue::Node(_) => true,
            ParamValue::Array(items) => items.iter().any(ParamValue::is_deferred),
            _ => false,
        }
    }
}

/// Sparse update for a single logical target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDelta {
    /// Node type to create when the target is not live yet. `None` for
    /// updates to existing nodes and for the reserved targets.
    pub node_type: Option<String>,
    pub params: BTreeMap<String, ParamValue>,
}

impl NodeDelta {
    pub fn with_type(type_name: &str) -> Self {
        NodeDelta {
            node_type: Some(type_name.to_string()),
            params: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, name: &str, value: ParamValue) -> &mut Self {
        self.params.insert(name.to_string(), value);
        self
    }

    /// Later keys overwrite earlier ones at the leaf level.
    pub fn merge(&mut self, other: NodeDelta) {
        if other.node_type.is_some() {
            self.node_type = other.node_type;
        }
        self.params.extend(other.params);
    }
}

/// Incremental scene description: logical target name to sparse update.
/// Ordered so application is deterministic. Always a sparse update, except
/// the first delta a session sends, which is the complete scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneDelta {
    pub targets: BTreeMap<String, NodeDelta>,
}

impl SceneDelta {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn entry(&mut self, target: &str) -> &mut NodeDelta {
        self.targets.entry(target.to_string()).or_default()
    }

    /// Fold `other` into `self`: nested maps merge recursively, later keys
    /// win at the leaf level. This is the coalescing rule for queued edits.
    pub fn merge(&mut self, other: SceneDelta) {
        for (target, node) in other.targets {
            match self.targets.get_mut(&target) {
                Some(existing) => existing.merge(node),
                None => {
                    self.targets.insert(target, node);
                }
            }
        }
    }
}
