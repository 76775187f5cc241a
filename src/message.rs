// Message envelope shared by the HTTP API and both websockets.
//
// Requests populate `component`/`method`/`arguments`; responses and pushes
// populate `success`/`event`/`message`. Every key is always serialized so the
// browser side can rely on the shape, and every key is optional on input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    pub component: String,
    pub method: String,
    pub arguments: BTreeMap<String, String>,
    pub success: bool,
    pub event: String,
    pub message: serde_json::Value,
}

impl Message {
    /// Request-shaped message: `component.method(arguments)`.
    pub fn request(component: &str, method: &str) -> Self {
        Self {
            component: component.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    /// Successful response carrying an event tag and payload.
    pub fn ok(event: &str, message: impl Into<serde_json::Value>) -> Self {
        Self {
            success: true,
            event: event.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: serde_json::Value::String(message.into()),
            ..Default::default()
        }
    }

    /// Failure with an event tag, e.g. `argumentInvalid`.
    pub fn fail_event(event: &str) -> Self {
        Self {
            success: false,
            event: event.into(),
            ..Default::default()
        }
    }

    /// Unsolicited notification for a browser client.
    pub fn push(component: &str, event: &str, message: impl Into<serde_json::Value>) -> Self {
        Self {
            component: component.into(),
            success: true,
            event: event.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Sent to a socket that is being replaced by a newer client.
    pub fn disconnect(reason: &str) -> Self {
        Self::ok("disconnect", reason)
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).map(String::as_str)
    }

    /// True for `component.method` style messages.
    pub fn is_request(&self) -> bool {
        !self.method.is_empty()
    }

    /// Payload as text, for error reporting.
    pub fn text(&self) -> String {
        match &self.message {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}
