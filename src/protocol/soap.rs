//! SOAP mocks: operations served on one endpoint path.
//!
//! Envelope marshaling belongs to the transport; the engine works with the
//! operation name, the SOAPAction header, and an already-decoded payload.

use crate::error::ValidationError;
use crate::stateful::{StatefulAction, StatefulBinding};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// SOAP mock payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SoapSpec {
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wsdl: Option<String>,

    #[serde(default)]
    pub operations: BTreeMap<String, SoapOperation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SoapOperation {
    /// Static XML placed inside the response body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soap_action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<SoapFault>,

    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_resource: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SoapFault {
    pub code: String,
    pub message: String,
}

impl SoapFault {
    pub fn client(message: impl Into<String>) -> Self {
        Self {
            code: "soap:Client".into(),
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self {
            code: "soap:Server".into(),
            message: message.into(),
        }
    }
}

/// Decoded SOAP request.
#[derive(Debug, Clone, Default)]
pub struct SoapRequest {
    pub operation: Option<String>,
    pub soap_action: Option<String>,
    /// Body elements decoded by the transport
    pub payload: Option<Value>,
}

impl SoapRequest {
    pub fn operation(name: impl Into<String>) -> Self {
        Self {
            operation: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn action(soap_action: impl Into<String>) -> Self {
        Self {
            soap_action: Some(soap_action.into()),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// What the transport wraps into an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum SoapOutcome {
    Response(String),
    Fault(SoapFault),
}

impl SoapOperation {
    /// The stateful binding, if the operation is wired to a resource.
    pub fn stateful_binding(&self) -> Option<StatefulBinding> {
        match (&self.stateful_resource, &self.stateful_action) {
            (Some(resource), Some(action)) => Some(StatefulBinding {
                resource: resource.clone(),
                action: action.parse::<StatefulAction>().unwrap_or_else(|never| match never {}),
            }),
            _ => None,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ValidationError> {
        if self.stateful_resource.is_some() != self.stateful_action.is_some() {
            return Err(ValidationError::Invalid(format!(
                "soap operation {name}: statefulResource and statefulAction must be set together"
            )));
        }
        if self.response.is_some() && self.stateful_resource.is_some() {
            return Err(ValidationError::MutuallyExclusive {
                context: "soap.operation",
                first: "response",
                second: "statefulResource",
            });
        }
        Ok(())
    }
}

impl SoapSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            wsdl: None,
            operations: BTreeMap::new(),
        }
    }

    pub fn with_operation(mut self, name: impl Into<String>, operation: SoapOperation) -> Self {
        self.operations.insert(name.into(), operation);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.path.starts_with('/') {
            return Err(ValidationError::Invalid(format!(
                "soap.path {:?} must start with '/'",
                self.path
            )));
        }
        for (name, operation) in &self.operations {
            operation.validate(name)?;
        }
        Ok(())
    }

    /// Find the operation by name, falling back to the SOAPAction header.
    pub fn find_operation(&self, request: &SoapRequest) -> Option<(&str, &SoapOperation)> {
        if let Some(name) = &request.operation {
            if let Some((key, op)) = self.operations.get_key_value(name) {
                return Some((key.as_str(), op));
            }
        }
        let action = request.soap_action.as_deref()?.trim_matches('"');
        self.operations
            .iter()
            .find(|(_, op)| op.soap_action.as_deref() == Some(action))
            .map(|(name, op)| (name.as_str(), op))
    }
}

/// Render a JSON value as a single XML element `<{root}>`.
///
/// Object keys become child elements, with characters that are not valid
/// in an XML name replaced by `_`. Arrays become one `<item>` child per
/// entry.
pub fn json_to_xml(root: &str, value: &Value) -> String {
    let mut out = String::new();
    write_element(&mut out, &element_name(root), value);
    out
}

fn write_element(out: &mut String, name: &str, value: &Value) {
    match value {
        Value::Array(items) => {
            out.push_str(&format!("<{name}>"));
            for item in items {
                write_element(out, "item", item);
            }
            out.push_str(&format!("</{name}>"));
        }
        Value::Object(fields) => {
            out.push_str(&format!("<{name}>"));
            for (key, field) in fields {
                write_element(out, &element_name(key), field);
            }
            out.push_str(&format!("</{name}>"));
        }
        Value::Null => {
            out.push('<');
            out.push_str(name);
            out.push_str("/>");
        }
        Value::String(text) => {
            out.push_str(&format!("<{name}>{}</{name}>", escape_xml(text)));
        }
        other => {
            out.push_str(&format!("<{name}>{other}</{name}>"));
        }
    }
}

/// Coerce `key` into an XML NCName.
fn element_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !name.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        name.insert(0, '_');
    }
    name
}

pub fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stateful::CrudAction;
    use serde_json::json;

    fn spec() -> SoapSpec {
        serde_yaml::from_str(
            r#"
path: /soap/users
operations:
  GetUser:
    soapAction: "urn:GetUser"
    response: "<user><id>1</id></user>"
  CreateUser:
    statefulResource: users
    statefulAction: create
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_find_by_name_and_action() {
        let spec = spec();
        let (name, _) = spec.find_operation(&SoapRequest::operation("GetUser")).unwrap();
        assert_eq!(name, "GetUser");
        let (name, _) = spec
            .find_operation(&SoapRequest::action("\"urn:GetUser\""))
            .unwrap();
        assert_eq!(name, "GetUser");
        assert!(spec.find_operation(&SoapRequest::operation("Nope")).is_none());
    }

    #[test]
    fn test_stateful_binding() {
        let spec = spec();
        let binding = spec.operations["CreateUser"].stateful_binding().unwrap();
        assert_eq!(binding.resource, "users");
        assert_eq!(binding.action, StatefulAction::Crud(CrudAction::Create));
        assert!(spec.operations["GetUser"].stateful_binding().is_none());
    }

    #[test]
    fn test_half_stateful_rejected() {
        let spec = SoapSpec::new("/soap").with_operation(
            "Op",
            SoapOperation {
                stateful_resource: Some("users".into()),
                ..SoapOperation::default()
            },
        );
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_json_to_xml() {
        let xml = json_to_xml(
            "GetUserResponse",
            &json!({"id": "1", "name": "A & B", "tags": ["x", "y"]}),
        );
        assert_eq!(
            xml,
            "<GetUserResponse><id>1</id><name>A &amp; B</name><tags><item>x</item><item>y</item></tags></GetUserResponse>"
        );
    }

    #[test]
    fn test_json_to_xml_sanitizes_keys() {
        let xml = json_to_xml(
            "createResponse",
            &json!({"a b": 1, "x></createResponse><evil": "v", "1st": true, "": null}),
        );
        assert_eq!(
            xml,
            "<createResponse><_/><_1st>true</_1st><a_b>1</a_b>\
             <x___createResponse__evil>v</x___createResponse__evil></createResponse>"
        );
        assert!(!xml.contains("<evil"));
    }

    #[test]
    fn test_json_to_xml_root_array() {
        assert_eq!(json_to_xml("listResponse", &json!([])), "<listResponse></listResponse>");
        assert_eq!(
            json_to_xml("listResponse", &json!([{"id": 1}, {"id": 2}])),
            "<listResponse><item><id>1</id></item><item><id>2</id></item></listResponse>"
        );
    }
}
