//! Endpoint schema parsing
//!
//! A device describes its endpoints as a JSON array of nodes. Each node has a
//! `name` and a `type`:
//! - `"object"` nodes own a `members` array of child nodes
//! - `"function"` nodes carry an `id` plus optional `inputs`/`outputs` arrays
//!   of scalar nodes
//! - every other type names a scalar and must carry a numeric `id` and an
//!   `access` string (`"r"` is read-only). Type names without a
//!   [`ValueType`] (`endpoint_ref` and the like) are kept as opaque scalars
//!   that cannot be read or written.
//!
//! The top-level `"json"` entry describes the schema transfer itself and is
//! skipped. Parsing is all-or-nothing: any malformed node rejects the whole
//! schema.
//!
//! Besides the tree, parsing builds a flat table keyed by dotted identifier
//! (`axis0.motor.error`) so that read/write resolution is a single hash
//! lookup. Function arguments are addressed as `<function>.<argument>`.
//!
//! ```
//! use protocol::{Schema, ValueType};
//!
//! let json = r#"[{"name":"vbus_voltage","type":"float","access":"r","id":5}]"#;
//! let schema = Schema::parse(json, 0).unwrap();
//! let info = schema.resolve("vbus_voltage").unwrap();
//! assert_eq!(info.id, 5);
//! assert_eq!(info.value_type, Some(ValueType::Float));
//! assert!(info.read_only);
//! ```

use crate::codec::{MAX_ENDPOINT_ID, SCHEMA_ENDPOINT_ID};
use crate::crc::crc16_json;
use crate::error::{ProtocolError, Result};
use crate::types::ValueType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Type name of the self-describing schema entry
const SCHEMA_TYPE_NAME: &str = "json";

const FUNCTION_TYPE_NAME: &str = "function";

/// Flattened endpoint metadata, enough to address and persist an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Dotted path from the schema root
    pub identifier: String,
    /// Device-assigned endpoint id
    pub id: u16,
    /// Marshallable scalar type, `None` for functions and opaque scalars
    pub value_type: Option<ValueType>,
    /// Type string as declared by the device
    pub type_name: String,
    pub read_only: bool,
    /// Registry slot of the owning device
    pub slot: usize,
}

impl EndpointInfo {
    pub fn is_function(&self) -> bool {
        self.type_name == FUNCTION_TYPE_NAME
    }

    /// Registry-wide path, `odrv<slot>.<identifier>`
    pub fn full_path(&self) -> String {
        format!("odrv{}.{}", self.slot, self.identifier)
    }
}

/// Kind-specific payload of a schema node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    Object {
        members: Vec<Endpoint>,
    },
    Function {
        id: u16,
        inputs: Vec<Endpoint>,
        outputs: Vec<Endpoint>,
    },
    Scalar {
        id: u16,
        value_type: Option<ValueType>,
        type_name: String,
        read_only: bool,
    },
}

/// Node of the endpoint tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub identifier: String,
    pub slot: usize,
    pub kind: EndpointKind,
}

impl Endpoint {
    /// Device-assigned id; objects have none
    pub fn id(&self) -> Option<u16> {
        match self.kind {
            EndpointKind::Object { .. } => None,
            EndpointKind::Function { id, .. } | EndpointKind::Scalar { id, .. } => Some(id),
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self.kind, EndpointKind::Object { .. })
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, EndpointKind::Function { .. })
    }

    /// Object members, or function inputs followed by outputs
    pub fn children(&self) -> impl Iterator<Item = &Endpoint> {
        let none: &[Endpoint] = &[];
        let (first, second) = match &self.kind {
            EndpointKind::Object { members } => (members.as_slice(), none),
            EndpointKind::Function {
                inputs, outputs, ..
            } => (inputs.as_slice(), outputs.as_slice()),
            EndpointKind::Scalar { .. } => (none, none),
        };
        first.iter().chain(second.iter())
    }

    fn set_slot(&mut self, slot: usize) {
        self.slot = slot;
        match &mut self.kind {
            EndpointKind::Object { members } => members.iter_mut().for_each(|m| m.set_slot(slot)),
            EndpointKind::Function {
                inputs, outputs, ..
            } => inputs
                .iter_mut()
                .chain(outputs.iter_mut())
                .for_each(|a| a.set_slot(slot)),
            EndpointKind::Scalar { .. } => {}
        }
    }
}

/// Parsed schema of one device: endpoint tree, flat table and CRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    endpoints: Vec<Endpoint>,
    table: HashMap<String, EndpointInfo>,
    crc: u16,
    slot: usize,
}

impl Schema {
    /// Parse the JSON schema text for the device in `slot`
    pub fn parse(json: &str, slot: usize) -> Result<Self> {
        let root: Value = serde_json::from_str(json)?;
        let nodes = root
            .as_array()
            .ok_or_else(|| ProtocolError::schema("top level is not an array"))?;

        let mut parser = Parser {
            slot,
            table: HashMap::new(),
            ids: HashMap::new(),
        };

        let mut endpoints = Vec::with_capacity(nodes.len());
        for node in nodes {
            if node.get("type").and_then(Value::as_str) == Some(SCHEMA_TYPE_NAME) {
                continue;
            }
            endpoints.push(parser.node(node, None)?);
        }

        Ok(Self {
            endpoints,
            table: parser.table,
            crc: crc16_json(json.as_bytes()),
            slot,
        })
    }

    /// Top-level endpoints
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Flat identifier -> metadata table
    pub fn table(&self) -> &HashMap<String, EndpointInfo> {
        &self.table
    }

    /// Metadata for a dotted identifier
    pub fn resolve(&self, identifier: &str) -> Option<&EndpointInfo> {
        self.table.get(identifier)
    }

    /// Tree node for a dotted identifier, objects included
    pub fn find(&self, identifier: &str) -> Option<&Endpoint> {
        let mut segments = identifier.split('.');
        let first = segments.next()?;
        let mut node = self.endpoints.iter().find(|e| e.name == first)?;
        for segment in segments {
            node = node.children().find(|c| c.name == segment)?;
        }
        Some(node)
    }

    /// Every readable scalar, function arguments included
    pub fn scalars(&self) -> impl Iterator<Item = &EndpointInfo> {
        self.table.values().filter(|info| !info.is_function())
    }

    /// Schema compatibility token sent with every request
    pub fn crc(&self) -> u16 {
        self.crc
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Copy of this schema owned by a different registry slot
    pub fn with_slot(&self, slot: usize) -> Self {
        let mut schema = self.clone();
        schema.slot = slot;
        schema.endpoints.iter_mut().for_each(|e| e.set_slot(slot));
        schema.table.values_mut().for_each(|info| info.slot = slot);
        schema
    }

    /// Number of addressable (non-object) endpoints
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

struct Parser {
    slot: usize,
    table: HashMap<String, EndpointInfo>,
    ids: HashMap<u16, String>,
}

impl Parser {
    fn node(&mut self, value: &Value, parent: Option<&str>) -> Result<Endpoint> {
        let object = value.as_object().ok_or_else(|| {
            ProtocolError::schema(format!(
                "node under '{}' is not an object",
                parent.unwrap_or("<root>")
            ))
        })?;

        let name = object
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ProtocolError::schema(format!(
                    "node under '{}' has no name",
                    parent.unwrap_or("<root>")
                ))
            })?;

        let identifier = match parent {
            Some(parent) => format!("{}.{}", parent, name),
            None => name.to_string(),
        };

        let type_name = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::schema(format!("'{}' has no type", identifier)))?;

        let kind = match type_name {
            "object" => {
                let members = object
                    .get("members")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        ProtocolError::schema(format!("object '{}' has no members", identifier))
                    })?;
                let members = members
                    .iter()
                    .map(|member| self.node(member, Some(&identifier)))
                    .collect::<Result<Vec<_>>>()?;
                EndpointKind::Object { members }
            }
            FUNCTION_TYPE_NAME => {
                let id = self.id(object, &identifier)?;
                self.insert(EndpointInfo {
                    identifier: identifier.clone(),
                    id,
                    value_type: None,
                    type_name: FUNCTION_TYPE_NAME.to_string(),
                    read_only: false,
                    slot: self.slot,
                })?;
                let inputs = self.arguments(object, "inputs", &identifier)?;
                let outputs = self.arguments(object, "outputs", &identifier)?;
                EndpointKind::Function {
                    id,
                    inputs,
                    outputs,
                }
            }
            scalar => self.scalar(object, scalar, &identifier)?,
        };

        Ok(Endpoint {
            name: name.to_string(),
            identifier,
            slot: self.slot,
            kind,
        })
    }

    fn scalar(
        &mut self,
        object: &Map<String, Value>,
        type_name: &str,
        identifier: &str,
    ) -> Result<EndpointKind> {
        let value_type = ValueType::from_type_name(type_name);
        let id = self.id(object, identifier)?;
        let access = object
            .get("access")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::schema(format!("'{}' has no access", identifier)))?;
        let read_only = access == "r";

        self.insert(EndpointInfo {
            identifier: identifier.to_string(),
            id,
            value_type,
            type_name: type_name.to_string(),
            read_only,
            slot: self.slot,
        })?;

        Ok(EndpointKind::Scalar {
            id,
            value_type,
            type_name: type_name.to_string(),
            read_only,
        })
    }

    fn arguments(
        &mut self,
        object: &Map<String, Value>,
        key: &str,
        function: &str,
    ) -> Result<Vec<Endpoint>> {
        let Some(value) = object.get(key) else {
            return Ok(Vec::new());
        };
        let arguments = value.as_array().ok_or_else(|| {
            ProtocolError::schema(format!("{} of '{}' is not an array", key, function))
        })?;

        let mut parsed = Vec::with_capacity(arguments.len());
        for argument in arguments {
            let endpoint = self.node(argument, Some(function))?;
            if !matches!(endpoint.kind, EndpointKind::Scalar { .. }) {
                return Err(ProtocolError::schema(format!(
                    "argument '{}' is not a scalar",
                    endpoint.identifier
                )));
            }
            parsed.push(endpoint);
        }
        Ok(parsed)
    }

    fn id(&self, object: &Map<String, Value>, identifier: &str) -> Result<u16> {
        let raw = object
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::schema(format!("'{}' has no numeric id", identifier)))?;
        u16::try_from(raw)
            .ok()
            .filter(|id| *id != SCHEMA_ENDPOINT_ID && *id <= MAX_ENDPOINT_ID)
            .ok_or_else(|| {
                ProtocolError::schema(format!("'{}' has out-of-range id {}", identifier, raw))
            })
    }

    fn insert(&mut self, info: EndpointInfo) -> Result<()> {
        if let Some(previous) = self.ids.get(&info.id) {
            return Err(ProtocolError::schema(format!(
                "id {} used by both '{}' and '{}'",
                info.id, previous, info.identifier
            )));
        }
        if self.table.contains_key(&info.identifier) {
            return Err(ProtocolError::schema(format!(
                "duplicate identifier '{}'",
                info.identifier
            )));
        }
        self.ids.insert(info.id, info.identifier.clone());
        self.table.insert(info.identifier.clone(), info);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"[
        {"name":"","id":0,"type":"json","access":"r"},
        {"name":"vbus_voltage","id":1,"type":"float","access":"r"},
        {"name":"serial_number","id":2,"type":"uint64","access":"r"},
        {"name":"axis0","type":"object","members":[
            {"name":"error","id":3,"type":"int32","access":"rw"},
            {"name":"requested_state","id":4,"type":"uint8","access":"rw"},
            {"name":"motor","type":"object","members":[
                {"name":"error","id":5,"type":"int32","access":"rw"},
                {"name":"is_calibrated","id":6,"type":"bool","access":"r"}
            ]},
            {"name":"move_incremental","id":7,"type":"function",
             "inputs":[
                {"name":"displacement","id":8,"type":"float","access":"rw"},
                {"name":"from_input_pos","id":9,"type":"bool","access":"rw"}
             ],
             "outputs":[]}
        ]},
        {"name":"save_configuration","id":10,"type":"function",
         "outputs":[{"name":"result","id":11,"type":"bool","access":"rw"}]}
    ]"#;

    #[test]
    fn test_parse_flattens_dotted_identifiers() {
        let schema = Schema::parse(SCHEMA, 1).unwrap();
        assert_eq!(schema.len(), 11);

        let info = schema.resolve("axis0.motor.error").unwrap();
        assert_eq!(info.id, 5);
        assert_eq!(info.value_type, Some(ValueType::Int32));
        assert!(!info.read_only);
        assert_eq!(info.full_path(), "odrv1.axis0.motor.error");

        assert!(schema.resolve("axis0").is_none());
        assert!(schema.resolve("axis0.motor").is_none());
    }

    #[test]
    fn test_json_entry_is_skipped() {
        let schema = Schema::parse(SCHEMA, 0).unwrap();
        assert_eq!(schema.endpoints().len(), 4);
        assert!(schema.endpoints().iter().all(|e| e.name != ""));
    }

    #[test]
    fn test_access_flags() {
        let schema = Schema::parse(SCHEMA, 0).unwrap();
        assert!(schema.resolve("vbus_voltage").unwrap().read_only);
        assert!(schema.resolve("axis0.motor.is_calibrated").unwrap().read_only);
        assert!(!schema.resolve("axis0.requested_state").unwrap().read_only);
    }

    #[test]
    fn test_functions_and_arguments() {
        let schema = Schema::parse(SCHEMA, 0).unwrap();

        let function = schema.resolve("axis0.move_incremental").unwrap();
        assert!(function.is_function());
        assert_eq!(function.id, 7);

        let input = schema
            .resolve("axis0.move_incremental.displacement")
            .unwrap();
        assert_eq!(input.value_type, Some(ValueType::Float));

        let node = schema.find("save_configuration").unwrap();
        match &node.kind {
            EndpointKind::Function {
                id,
                inputs,
                outputs,
            } => {
                assert_eq!(*id, 10);
                assert!(inputs.is_empty());
                assert_eq!(outputs[0].identifier, "save_configuration.result");
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_find_walks_tree() {
        let schema = Schema::parse(SCHEMA, 0).unwrap();
        assert!(schema.find("axis0.motor").unwrap().is_object());
        assert_eq!(schema.find("axis0.motor.error").unwrap().id(), Some(5));
        assert_eq!(
            schema
                .find("axis0.move_incremental.from_input_pos")
                .unwrap()
                .id(),
            Some(9)
        );
        assert!(schema.find("axis1").is_none());
        assert!(schema.find("").is_none());
    }

    #[test]
    fn test_scalars_exclude_functions() {
        let schema = Schema::parse(SCHEMA, 0).unwrap();
        assert_eq!(schema.scalars().count(), 9);
        assert!(schema.scalars().all(|info| info.value_type.is_some()));
    }

    #[test]
    fn test_with_slot_restamps_everything() {
        let schema = Schema::parse(SCHEMA, 0).unwrap().with_slot(3);
        assert_eq!(schema.slot(), 3);
        assert!(schema.table().values().all(|info| info.slot == 3));
        assert_eq!(schema.find("axis0.motor.error").unwrap().slot, 3);
        assert_eq!(
            schema.resolve("vbus_voltage").unwrap().full_path(),
            "odrv3.vbus_voltage"
        );
    }

    #[test]
    fn test_crc_covers_text() {
        let json = r#"[{"name":"vbus_voltage","type":"float","access":"r","id":5}]"#;
        assert_eq!(Schema::parse(json, 0).unwrap().crc(), 0x6da6);
    }

    #[test]
    fn test_rejects_malformed_nodes() {
        let cases = [
            r#"{"name":"x"}"#,
            r#"[42]"#,
            r#"[{"type":"float","id":1,"access":"r"}]"#,
            r#"[{"name":"x","id":1,"access":"r"}]"#,
            r#"[{"name":"x","type":"float","access":"r"}]"#,
            r#"[{"name":"x","type":"float","id":1}]"#,
            r#"[{"name":"x","type":"object"}]"#,
            r#"[{"name":"x","type":"float","id":70000,"access":"r"}]"#,
            r#"[{"name":"x","type":"float","id":0,"access":"r"}]"#,
            r#"[{"name":"f","type":"function","id":1,"inputs":[{"name":"o","type":"object","members":[]}]}]"#,
            r#"[{"name":"f","type":"function","id":1,"inputs":{}}]"#,
        ];
        for case in cases {
            let err = Schema::parse(case, 0).unwrap_err();
            assert!(err.is_schema_error(), "{} -> {:?}", case, err);
        }
    }

    #[test]
    fn test_unknown_type_is_opaque_scalar() {
        let json = r#"[
            {"name":"vbus_voltage","type":"float","id":1,"access":"r"},
            {"name":"input_ref","type":"endpoint_ref","id":2,"access":"rw"}
        ]"#;
        let schema = Schema::parse(json, 0).unwrap();

        let info = schema.resolve("input_ref").unwrap();
        assert_eq!(info.value_type, None);
        assert_eq!(info.type_name, "endpoint_ref");
        assert!(!info.is_function());
        assert_eq!(schema.scalars().count(), 2);
        assert!(matches!(
            schema.find("input_ref").unwrap().kind,
            EndpointKind::Scalar { value_type: None, .. }
        ));
    }

    #[test]
    fn test_rejects_duplicates() {
        let duplicate_id = r#"[
            {"name":"a","type":"float","id":1,"access":"r"},
            {"name":"b","type":"float","id":1,"access":"r"}
        ]"#;
        assert!(Schema::parse(duplicate_id, 0).is_err());

        let duplicate_name = r#"[
            {"name":"a","type":"float","id":1,"access":"r"},
            {"name":"a","type":"float","id":2,"access":"r"}
        ]"#;
        assert!(Schema::parse(duplicate_name, 0).is_err());
    }

    #[test]
    fn test_nested_failure_rejects_whole_schema() {
        let json = r#"[
            {"name":"ok","type":"float","id":1,"access":"r"},
            {"name":"axis0","type":"object","members":[
                {"name":"broken","type":"uint8","access":"r"}
            ]}
        ]"#;
        let err = Schema::parse(json, 0).unwrap_err();
        assert!(err.to_string().contains("axis0.broken"));
    }

    #[test]
    fn test_invalid_json_syntax() {
        assert!(matches!(
            Schema::parse("[{\"name\":", 0),
            Err(ProtocolError::Json(_))
        ));
    }
}
