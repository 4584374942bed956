//! Template engine for dynamic responses.
//!
//! Uses Handlebars for template rendering. HTTP responses see the request
//! and its captures; gRPC and GraphQL responses see the call payload.

use crate::matcher::MatchContext;
use crate::protocol::http::HttpRequest;
use handlebars::Handlebars;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Context for template rendering.
#[derive(Debug, Default, Serialize)]
pub struct TemplateContext {
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// `pathPattern` capture groups
    pub captures: HashMap<String, String>,
    /// Request method
    pub method: String,
    /// Request path
    pub path: String,
    /// Request body (as string, if text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// GraphQL variables
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
}

impl TemplateContext {
    pub fn for_http(request: &HttpRequest, matched: &MatchContext) -> Self {
        let body = request.body_str().map(String::from);
        let json = body.as_deref().and_then(|s| serde_json::from_str(s).ok());
        Self {
            query: matched.query_params.clone(),
            headers: request.headers.clone(),
            captures: matched.captures.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            body,
            json,
            variables: None,
        }
    }

    /// Context for a decoded call payload (gRPC message, SOAP body).
    pub fn for_payload(payload: Option<&Value>) -> Self {
        Self {
            body: payload.map(Value::to_string),
            json: payload.cloned(),
            ..Self::default()
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Responses are not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string with the given context.
    pub fn render(
        &self,
        template: &str,
        ctx: &TemplateContext,
    ) -> Result<String, handlebars::RenderError> {
        self.handlebars.render_template(template, ctx)
    }

    /// Render a JSON value with templates in string fields.
    pub fn render_json(
        &self,
        value: &Value,
        ctx: &TemplateContext,
    ) -> Result<Value, handlebars::RenderError> {
        match value {
            Value::String(s) if s.contains("{{") => {
                Ok(Value::String(self.handlebars.render_template(s, ctx)?))
            }
            Value::Array(arr) => {
                let rendered: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_json(v, ctx)).collect();
                Ok(Value::Array(rendered?))
            }
            Value::Object(obj) => {
                let mut rendered = serde_json::Map::new();
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json(v, ctx)?);
                }
                Ok(Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let Some(param) = h.param(0).map(|v| v.value()) else {
        return Ok(());
    };
    // Strings holding JSON are re-parsed; anything else is serialized as is
    let parsed = param
        .as_str()
        .and_then(|s| serde_json::from_str::<Value>(s).ok());
    match (parsed, param.as_str()) {
        (Some(json), _) => out.write(&json.to_string())?,
        (None, Some(text)) => out.write(text)?,
        (None, None) => out.write(&param.to_string())?,
    }
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    out.write(&uuid::Uuid::new_v4().to_string())?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use chrono::Utc;

    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    let now = Utc::now();
    out.write(&now.format(format).to_string())?;
    Ok(())
}

fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h
        .param(0)
        .and_then(|v| v.value().as_i64())
        .unwrap_or(0);
    let max = h
        .param(1)
        .and_then(|v| v.value().as_i64())
        .unwrap_or(100);

    let mut rng = rand::thread_rng();
    let value = rng.gen_range(min..=max);
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(v) if !v.is_null() => {
            if let Some(s) = v.as_str() {
                if !s.is_empty() {
                    out.write(s)?;
                    return Ok(());
                }
            } else {
                out.write(&v.to_string())?;
                return Ok(());
            }
        }
        _ => {}
    }

    out.write(default)?;
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}
