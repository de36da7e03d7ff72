//! The versioned JSON graph description exchanged with the editor.

use std::{fs, io, path::Path};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::op::Op;

pub const CURRENT_VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("Graph description is invalid: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub nodes: Vec<NodeDescription>,
    #[serde(default)]
    pub edges: Vec<EdgeDescription>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub params: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEdge")]
pub struct EdgeDescription {
    pub id: String,
    pub source: String,
    #[serde(rename = "sourceHandle")]
    pub source_handle: String,
    pub target: String,
    #[serde(rename = "targetHandle")]
    pub target_handle: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default = "untitled")]
    pub name: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Edge as it arrives: id and handles may be absent or null.
#[derive(Deserialize)]
struct RawEdge {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    id: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    source: String,
    #[serde(default, rename = "sourceHandle")]
    source_handle: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    target: String,
    #[serde(default, rename = "targetHandle")]
    target_handle: Option<String>,
}

impl From<RawEdge> for EdgeDescription {
    fn from(raw: RawEdge) -> Self {
        Self {
            id: raw
                .id
                .unwrap_or_else(|| format!("e-{}-{}", raw.source, raw.target)),
            source_handle: raw.source_handle.unwrap_or_else(|| Op::OUT.to_owned()),
            target_handle: raw.target_handle.unwrap_or_else(|| Op::IN.to_owned()),
            source: raw.source,
            target: raw.target,
        }
    }
}

impl GraphDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: default_version(),
            nodes: Vec::new(),
            edges: Vec::new(),
            metadata: Metadata {
                name: name.into(),
                ..Metadata::default()
            },
        }
    }

    pub fn with_node(mut self, node: NodeDescription) -> Self {
        self.nodes.push(node);
        self
    }

    /// Connects `source`'s output to `target`'s `target_handle`.
    pub fn with_edge(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        target_handle: impl Into<String>,
    ) -> Self {
        let (source, target) = (source.into(), target.into());
        self.edges.push(EdgeDescription {
            id: format!("e-{}-{}-{}", source, target, self.edges.len()),
            source,
            source_handle: Op::OUT.to_owned(),
            target,
            target_handle: target_handle.into(),
        });
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl NodeDescription {
    pub fn new(id: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ty: ty.into(),
            params: Map::new(),
            position: Position::default(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            name: untitled(),
            created_at: String::new(),
            description: None,
        }
    }
}

pub fn load_graph(path: impl AsRef<Path>) -> Result<GraphDescription, LoadError> {
    let buf = fs::read(path)?;
    load_graph_from_slice(&buf)
}

pub fn load_graph_from_slice(buf: &[u8]) -> Result<GraphDescription, LoadError> {
    Ok(serde_json::from_slice(buf)?)
}

pub fn load_graph_from_str(s: &str) -> Result<GraphDescription, LoadError> {
    Ok(serde_json::from_str(s)?)
}

fn default_version() -> String {
    CURRENT_VERSION.to_owned()
}

fn untitled() -> String {
    "Untitled".to_owned()
}

fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

fn string_or_number<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number id, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(de)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number id, got {other}"
        ))),
    }
}

#[test]
fn load_minimal() {
    let graph = load_graph_from_str(
        r#"{
            "nodes": [
                { "id": 1, "type": "Input", "params": null },
                { "id": "2", "type": "Output", "position": { "x": 10 } }
            ],
            "edges": [{ "source": 1, "target": "2", "sourceHandle": null }]
        }"#,
    )
    .unwrap();
    assert_eq!(graph.version, "1.0");
    assert_eq!(graph.metadata.name, "Untitled");
    assert_eq!(graph.nodes[0].id, "1");
    assert!(graph.nodes[0].params.is_empty());
    assert_eq!(graph.nodes[1].position, Position { x: 10.0, y: 0.0 });
    assert_eq!(
        graph.edges[0],
        EdgeDescription {
            id: "e-1-2".into(),
            source: "1".into(),
            source_handle: "out".into(),
            target: "2".into(),
            target_handle: "in".into(),
        }
    );
}

#[test]
fn rejects_malformed() {
    assert!(matches!(
        load_graph_from_str(r#"{ "nodes": [{ "type": "Input" }] }"#),
        Err(LoadError::InvalidJson(_))
    ));
    assert!(matches!(
        load_graph_from_str(r#"{ "nodes": [{ "id": [1], "type": "Input" }] }"#),
        Err(LoadError::InvalidJson(_))
    ));
    assert!(matches!(
        load_graph("/nonexistent/graph.json"),
        Err(LoadError::Io(_))
    ));
}

#[test]
fn json_round_trip_keeps_editor_field_names() {
    let graph = GraphDescription::new("mlp")
        .with_node(NodeDescription::new("a", "Input").with_param("shape", vec![784]))
        .with_node(NodeDescription::new("b", "Output").at(200.0, 0.0))
        .with_edge("a", "b", "in");
    let json = graph.to_json().unwrap();
    assert!(json.contains("\"sourceHandle\": \"out\""));
    assert!(json.contains("\"type\": \"Input\""));
    assert_eq!(load_graph_from_str(&json).unwrap(), graph);
}
