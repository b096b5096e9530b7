/// Connector execution for task side effects
///
/// Tasks reach external services (form stores, mailers, document renderers)
/// through the `Connector` trait. The production implementation resolves a
/// logical connector name to a base URL and issues a JSON HTTP request built
/// from the task's template and the instance variables.

use crate::workflow::types::{ConnectorSpec, Task};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// External side-effect collaborator invoked when a task with a connector runs
///
/// The returned object is merged into the instance variables.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn invoke(
        &self,
        task: &Task,
        spec: &ConnectorSpec,
        variables: &Map<String, Value>,
    ) -> Result<Map<String, Value>>;
}

/// HTTP connector backed by reqwest
///
/// Expected task extension: `connectorId` names an entry of `endpoints`,
/// input parameters `path`/`method` shape the request, every other input
/// parameter becomes a JSON body field.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    /// Connector name -> base URL
    endpoints: HashMap<String, String>,
}

impl HttpConnector {
    pub fn new(endpoints: HashMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    /// Full request URL for a connector call
    fn request_url(&self, spec: &ConnectorSpec, variables: &Map<String, Value>) -> Result<String> {
        let base = self
            .endpoints
            .get(&spec.connector)
            .ok_or_else(|| anyhow::anyhow!("Unknown connector '{}'", spec.connector))?;

        let path = spec
            .path
            .as_deref()
            .map(|p| template_to_string(&render_template(p, variables)))
            .unwrap_or_default();

        if path.is_empty() {
            Ok(base.clone())
        } else if path.starts_with('/') {
            Ok(format!("{}{}", base.trim_end_matches('/'), path))
        } else {
            Ok(format!("{}/{}", base.trim_end_matches('/'), path))
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn invoke(
        &self,
        task: &Task,
        spec: &ConnectorSpec,
        variables: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let url = self.request_url(spec, variables)?;
        let method = spec.method.as_deref().unwrap_or("POST").to_uppercase();
        let body = build_body(spec, variables);

        tracing::debug!("🌍 Connector '{}' for task '{}': {} {}", spec.connector, task.id, method, url);

        let request = match method.as_str() {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url).json(&body),
            "PUT" => self.client.put(&url).json(&body),
            "PATCH" => self.client.patch(&url).json(&body),
            "DELETE" => self.client.delete(&url),
            _ => return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method)),
        };

        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("HTTP request to connector '{}' failed: {}", spec.connector, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;

        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "Connector '{}' answered {}: {}",
                spec.connector,
                status,
                text
            ));
        }

        let payload = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        tracing::info!("✅ Connector '{}' completed for task '{}' (status: {})", spec.connector, task.id, status);

        Ok(extract_outputs(&task.id, spec, payload))
    }
}

/// Substitute `${name}` placeholders with bound variables
///
/// A template that is exactly `${name}` with `name` bound yields the bound
/// value itself (objects and numbers keep their type). Otherwise bound
/// placeholders are replaced by their string form and unbound ones are left
/// verbatim.
pub fn render_template(template: &str, variables: &Map<String, Value>) -> Value {
    if let Some(key) = template.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
        if !key.contains("${") {
            if let Some(value) = variables.get(key) {
                return value.clone();
            }
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match variables.get(key) {
                    Some(value) => out.push_str(&template_to_string(value)),
                    None => {
                        out.push_str("${");
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    Value::String(out)
}

fn template_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Request body from the connector's input parameters
pub fn build_body(spec: &ConnectorSpec, variables: &Map<String, Value>) -> Value {
    let body: Map<String, Value> = spec
        .inputs
        .iter()
        .map(|param| (param.name.clone(), render_template(&param.value, variables)))
        .collect();
    Value::Object(body)
}

/// Map a connector response onto instance variables
///
/// With output parameters each one selects a value by JSONPath; without
/// them an object response is merged as-is and anything else is stored
/// under `<task_id>_result`.
pub fn extract_outputs(task_id: &str, spec: &ConnectorSpec, payload: Value) -> Map<String, Value> {
    let mut result = Map::new();

    if !spec.outputs.is_empty() {
        for param in &spec.outputs {
            let selected = match jsonpath_lib::select(&payload, &param.value) {
                Ok(matches) => match matches.as_slice() {
                    [] => Value::Null,
                    [single] => (*single).clone(),
                    many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
                },
                Err(e) => {
                    tracing::warn!("⚠️ Bad JSONPath '{}' for output '{}': {:?}", param.value, param.name, e);
                    Value::Null
                }
            };
            result.insert(param.name.clone(), selected);
        }
        return result;
    }

    match payload {
        Value::Object(map) => map,
        Value::Null => result,
        other => {
            result.insert(format!("{}_result", task_id), other);
            result
        }
    }
}
