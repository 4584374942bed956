//! GraphQL mocks.
//!
//! Schema parsing is not the engine's business: it only needs the operation
//! type and the root fields of the request to look up
//! `resolvers["{Query|Mutation|Subscription}.{field}"]`.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// GraphQL mock payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct GraphqlSpec {
    pub path: String,

    /// SDL text, handed to the schema collaborator untouched
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schema: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_file: Option<String>,

    #[serde(default)]
    pub introspection: bool,

    #[serde(default)]
    pub resolvers: BTreeMap<String, ResolverConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ResolverConfig {
    #[serde(default)]
    pub response: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GraphqlErrorConfig>,

    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphqlErrorConfig {
    pub message: String,

    /// Response path reported with the error; defaults to the field's key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

/// Decoded GraphQL request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default)]
    pub operation_name: Option<String>,
}

impl GraphqlRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "query" => Some(OperationKind::Query),
            "mutation" => Some(OperationKind::Mutation),
            "subscription" => Some(OperationKind::Subscription),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A root field of the selected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootField {
    /// Alias if present, else the field name
    pub response_key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSelection {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub fields: Vec<RootField>,
}

impl OperationSelection {
    pub fn is_introspection(&self) -> bool {
        self.fields
            .iter()
            .any(|f| f.name == "__schema" || f.name == "__type")
    }
}

/// What the transport should send back.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphqlOutcome {
    /// A `{data, errors}` body
    Response(Value),
    /// Introspection is enabled and must be answered by the schema collaborator
    Introspection,
}

impl GraphqlSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.path.starts_with('/') {
            return Err(ValidationError::Invalid(format!(
                "graphql.path {:?} must start with '/'",
                self.path
            )));
        }
        if !self.schema.is_empty() && self.schema_file.is_some() {
            return Err(ValidationError::MutuallyExclusive {
                context: "graphql",
                first: "schema",
                second: "schemaFile",
            });
        }
        for key in self.resolvers.keys() {
            let valid = key
                .split_once('.')
                .map(|(op, field)| {
                    matches!(op, "Query" | "Mutation" | "Subscription") && !field.is_empty()
                })
                .unwrap_or(false);
            if !valid {
                return Err(ValidationError::Invalid(format!(
                    "graphql resolver key {key:?} must look like Query.field or Mutation.field"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a request. `render` turns a configured response into the
    /// field value (template substitution happens there).
    pub fn resolve(
        &self,
        request: &GraphqlRequest,
        mut render: impl FnMut(&Value) -> Value,
    ) -> (GraphqlOutcome, u64) {
        let selection = match parse_operation(&request.query, request.operation_name.as_deref())
        {
            Ok(selection) => selection,
            Err(message) => return (GraphqlOutcome::Response(error_body(&message)), 0),
        };

        if selection.is_introspection() {
            if self.introspection {
                return (GraphqlOutcome::Introspection, 0);
            }
            return (
                GraphqlOutcome::Response(error_body("GraphQL introspection is disabled")),
                0,
            );
        }

        let mut data = Map::new();
        let mut errors = Vec::new();
        let mut delay_ms = 0;

        for field in &selection.fields {
            if field.name == "__typename" {
                data.insert(field.response_key.clone(), json!(selection.kind.type_name()));
                continue;
            }
            let key = format!("{}.{}", selection.kind.type_name(), field.name);
            match self.resolvers.get(&key) {
                Some(resolver) => {
                    delay_ms = delay_ms.max(resolver.delay_ms);
                    if let Some(error) = &resolver.error {
                        let path = match &error.path {
                            Some(path) => Value::Array(path.clone()),
                            None => json!([field.response_key]),
                        };
                        let mut entry = json!({ "message": error.message, "path": path });
                        if let Some(extensions) = &error.extensions {
                            entry["extensions"] = extensions.clone();
                        }
                        errors.push(entry);
                        data.insert(field.response_key.clone(), Value::Null);
                    } else {
                        data.insert(field.response_key.clone(), render(&resolver.response));
                    }
                }
                None => {
                    errors.push(json!({
                        "message": format!("no resolver configured for {key}"),
                        "path": [field.response_key],
                    }));
                    data.insert(field.response_key.clone(), Value::Null);
                }
            }
        }

        let mut body = json!({ "data": Value::Object(data) });
        if !errors.is_empty() {
            body["errors"] = Value::Array(errors);
        }
        (GraphqlOutcome::Response(body), delay_ms)
    }
}

fn error_body(message: &str) -> Value {
    json!({ "errors": [{ "message": message }] })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Punct(char),
    Spread,
    Other,
}

fn tokenize(source: &str) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() || c == ',' || c == '\u{feff}' => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' => {
                let block = chars.get(i + 1) == Some(&'"') && chars.get(i + 2) == Some(&'"');
                if block {
                    i += 3;
                    while i < chars.len() {
                        if chars[i] == '"'
                            && chars.get(i + 1) == Some(&'"')
                            && chars.get(i + 2) == Some(&'"')
                        {
                            i += 3;
                            break;
                        }
                        i += 1;
                    }
                } else {
                    i += 1;
                    while i < chars.len() && chars[i] != '"' {
                        if chars[i] == '\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                    i += 1;
                }
                tokens.push(Token::Other);
            }
            '.' if chars.get(i + 1) == Some(&'.') && chars.get(i + 2) == Some(&'.') => {
                tokens.push(Token::Spread);
                i += 3;
            }
            c if c == '_' || c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i] == '_' || chars[i].is_ascii_alphanumeric()) {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            c if c == '-' || c.is_ascii_digit() => {
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '.' | '+' | '-'))
                {
                    i += 1;
                }
                tokens.push(Token::Other);
            }
            c => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
        }
    }

    tokens
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, punct: char) -> bool {
        if self.peek() == Some(&Token::Punct(punct)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Skip a balanced group whose opener is the current token.
    fn skip_group(&mut self, open: char, close: char) -> Result<(), String> {
        if !self.eat(open) {
            return Ok(());
        }
        let mut depth = 1;
        while depth > 0 {
            match self.next() {
                Some(Token::Punct(c)) if c == open => depth += 1,
                Some(Token::Punct(c)) if c == close => depth -= 1,
                Some(_) => {}
                None => return Err(format!("Syntax Error: unbalanced '{open}'")),
            }
        }
        Ok(())
    }

    fn skip_directives(&mut self) -> Result<(), String> {
        while self.eat('@') {
            self.next();
            self.skip_group('(', ')')?;
        }
        Ok(())
    }
}

/// Extract the operation type and root fields of a GraphQL document.
pub fn parse_operation(
    query: &str,
    operation_name: Option<&str>,
) -> Result<OperationSelection, String> {
    let mut cursor = Cursor {
        tokens: tokenize(query),
        pos: 0,
    };
    let mut operations = Vec::new();

    while let Some(token) = cursor.peek().cloned() {
        match token {
            Token::Punct('{') => {
                let fields = parse_root_fields(&mut cursor)?;
                operations.push(OperationSelection {
                    kind: OperationKind::Query,
                    name: None,
                    fields,
                });
            }
            Token::Name(keyword) if keyword == "fragment" => {
                while !matches!(cursor.peek(), Some(Token::Punct('{')) | None) {
                    cursor.next();
                }
                cursor.skip_group('{', '}')?;
            }
            Token::Name(keyword) => {
                let kind = OperationKind::from_keyword(&keyword)
                    .ok_or_else(|| format!("Syntax Error: unexpected name {keyword:?}"))?;
                cursor.next();
                let name = match cursor.peek() {
                    Some(Token::Name(name)) => {
                        let name = name.clone();
                        cursor.next();
                        Some(name)
                    }
                    _ => None,
                };
                cursor.skip_group('(', ')')?;
                cursor.skip_directives()?;
                let fields = parse_root_fields(&mut cursor)?;
                operations.push(OperationSelection { kind, name, fields });
            }
            other => return Err(format!("Syntax Error: unexpected token {other:?}")),
        }
    }

    match operation_name {
        Some(wanted) => operations
            .into_iter()
            .find(|op| op.name.as_deref() == Some(wanted))
            .ok_or_else(|| format!("Unknown operation named \"{wanted}\".")),
        None => match operations.len() {
            0 => Err("Syntax Error: document contains no operation".to_string()),
            1 => Ok(operations.remove(0)),
            _ => Err("Must provide operation name if query contains multiple operations."
                .to_string()),
        },
    }
}

fn parse_root_fields(cursor: &mut Cursor) -> Result<Vec<RootField>, String> {
    if !cursor.eat('{') {
        return Err("Syntax Error: expected '{'".to_string());
    }
    let mut fields = Vec::new();

    loop {
        match cursor.next() {
            Some(Token::Punct('}')) => break,
            Some(Token::Name(first)) => {
                let (response_key, name) = if cursor.eat(':') {
                    match cursor.next() {
                        Some(Token::Name(name)) => (first, name),
                        _ => return Err("Syntax Error: expected field name after alias".into()),
                    }
                } else {
                    (first.clone(), first)
                };
                cursor.skip_group('(', ')')?;
                cursor.skip_directives()?;
                cursor.skip_group('{', '}')?;
                fields.push(RootField { response_key, name });
            }
            Some(Token::Spread) => {
                // Fragment spreads and inline fragments at the root are skipped.
                if let Some(Token::Name(name)) = cursor.peek() {
                    if name == "on" {
                        cursor.next();
                    }
                    cursor.next();
                }
                cursor.skip_directives()?;
                cursor.skip_group('{', '}')?;
            }
            Some(other) => return Err(format!("Syntax Error: unexpected token {other:?}")),
            None => return Err("Syntax Error: unterminated selection set".into()),
        }
    }

    Ok(fields)
}
