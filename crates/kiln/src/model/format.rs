use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ir::op::{KILN_DOMAIN, ONNX_DOMAIN};
use crate::ir::tensor_info::{DataType, TensorInfo};

/// Imported model: a main graph plus opset versions per domain.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Model {
    pub graph: GraphDef,
    /// Opset version per domain. The empty domain means the default operator set.
    #[serde(default)]
    pub opsets: BTreeMap<String, u32>,
    /// Free-form key/value annotations.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Model {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| Error::user_model(format!("malformed model description: {err}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| Error::internal(format!("failed to serialise model: {err}")))
    }

    /// Opset version in force for `domain`; unlisted domains get the newest kinds.
    pub fn opset_version(&self, domain: &str) -> u32 {
        let canonical = canonical_domain(domain);
        self.opsets
            .iter()
            .find(|(listed, _)| canonical_domain(listed) == canonical)
            .map(|(_, version)| *version)
            .unwrap_or(u32::MAX)
    }
}

/// `""` and `"ai.onnx"` name the same operator set.
pub fn canonical_domain(domain: &str) -> &str {
    match domain {
        "" | ONNX_DOMAIN => ONNX_DOMAIN,
        "ai.kiln" => KILN_DOMAIN,
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub inputs: Vec<ValueInfo>,
    #[serde(default)]
    pub outputs: Vec<ValueInfo>,
    #[serde(default)]
    pub initializers: Vec<Initializer>,
}

impl GraphDef {
    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.iter().find(|init| init.name == name)
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializer(name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeDef {
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub domain: String,
    /// Empty names mark absent optional inputs.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    String(String),
    Strings(Vec<String>),
    Graph(GraphDef),
}

/// Name, type and (optionally) shape of a graph input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    #[serde(default)]
    pub dtype: Option<DataType>,
    #[serde(default)]
    pub shape: Option<Vec<i64>>,
}

impl ValueInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: None,
            shape: None,
        }
    }

    pub fn typed(name: impl Into<String>, info: &TensorInfo) -> Self {
        Self {
            name: name.into(),
            dtype: Some(info.dtype),
            shape: Some(info.shape.clone()),
        }
    }

    /// Complete info, if both type and shape are declared.
    pub fn info(&self) -> Option<TensorInfo> {
        match (self.dtype, &self.shape) {
            (Some(dtype), Some(shape)) if dtype.is_defined() => {
                Some(TensorInfo::new(dtype, shape.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initializer {
    pub name: String,
    pub dtype: DataType,
    pub shape: Vec<i64>,
    pub data: Vec<f64>,
}

impl Initializer {
    pub fn info(&self) -> TensorInfo {
        TensorInfo::new(self.dtype, self.shape.clone())
    }
}
