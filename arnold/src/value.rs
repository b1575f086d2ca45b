use crate::render::NodeId;
use serde::{Deserialize, Serialize};

/// Type-tagged parameter value accepted by renderer nodes.
///
/// `Link` and `Node` carry live node handles; callers are expected to have
/// created the referenced node before setting the parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
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
    Array(Vec<Value>),
    Link(NodeId),
    Node(NodeId),
}

impl Value {
    /// Tag name, used in log and error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "BOOL",
            Value::Byte(_) => "BYTE",
            Value::Int(_) => "INT",
            Value::Float(_) => "FLOAT",
            Value::Rgb(_) => "RGB",
            Value::Rgba(_) => "RGBA",
            Value::Vector(_) => "VECTOR",
            Value::Vector2(_) => "VECTOR2",
            Value::Str(_) => "STRING",
            Value::Matrix(_) => "MATRIX",
            Value::Array(_) => "ARRAY",
            Value::Link(_) => "LINK",
            Value::Node(_) => "NODE",
        }
    }
}
