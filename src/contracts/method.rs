//! Methods: named, typed procedures exposed by a [`super::service::Service`].

use super::errors::ErrorCode;
use super::io::{Input, Output};

use crate::context::EventContext;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A single turn of prior chat history, passed through to handlers that want
/// conversational context (e.g. an LLM-backed service).
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// `"user"`, `"assistant"`, or a service-defined role.
    pub role: String,
    /// Message text.
    pub content: String,
}

/// Extra, per-call options threaded through to the handler context.
#[derive(Debug, Clone, Default)]
pub struct CallOpts {
    /// Prior chat history, if the caller has any to offer.
    pub messages: Option<Vec<ChatMessage>>,
}

/// Context handed to a method handler: processed inputs, an outputs map
/// seeded from the method's declared outputs, the originating event
/// context, and any chat history from [`CallOpts`].
pub struct HandlerContext {
    /// Validated, defaulted inputs.
    pub inputs: HashMap<String, Value>,
    outputs: Mutex<HashMap<String, Value>>,
    /// The event that triggered this call.
    pub event_ctx: Arc<EventContext>,
    /// Prior chat history, if supplied.
    pub messages: Option<Vec<ChatMessage>>,
}

impl HandlerContext {
    pub(super) fn new(
        inputs: HashMap<String, Value>,
        outputs_seed: HashMap<String, Value>,
        event_ctx: Arc<EventContext>,
        messages: Option<Vec<ChatMessage>>,
    ) -> Self {
        Self {
            inputs,
            outputs: Mutex::new(outputs_seed),
            event_ctx,
            messages,
        }
    }

    /// Sets a single output value.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.outputs.lock().unwrap().insert(name.into(), value);
    }

    /// Merges a JSON object's keys into the outputs map in one call.
    pub fn json(&self, value: Value) {
        if let Value::Object(map) = value {
            let mut outputs = self.outputs.lock().unwrap();
            for (k, v) in map {
                outputs.insert(k, v);
            }
        }
    }

    pub(super) fn into_outputs(self) -> HashMap<String, Value> {
        self.outputs.into_inner().unwrap()
    }
}

/// A method's implementation.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Performs the call, writing results into `ctx` via [`HandlerContext::set`]
    /// or [`HandlerContext::json`].
    ///
    /// # Errors
    /// Any error is surfaced to the caller as [`super::errors::ErrorCode::HandlerError`].
    async fn call(&self, ctx: Arc<HandlerContext>) -> anyhow::Result<()>;
}

/// A named, typed procedure exposed by a Service.
pub struct Method {
    /// Method name, matched case-sensitively within a service.
    pub name: String,
    /// Ordered input descriptors.
    pub inputs: Vec<Input>,
    /// Ordered output descriptors.
    pub outputs: Vec<Output>,
    /// The implementation.
    pub handler: Arc<dyn MethodHandler>,
    /// Whether this is the service's default method, used by parsers that
    /// don't name one explicitly (e.g. the auto parser).
    pub is_default: bool,
}

/// Result of a [`super::service::Service::call_method`] invocation.
#[derive(Debug, Clone, Default)]
pub struct MethodResponse {
    /// Output values, keyed by declared output name.
    pub outputs: HashMap<String, Value>,
    /// Human-readable error message, if the call failed.
    pub error: Option<String>,
    /// Machine-readable error code, if the call failed.
    pub error_code: Option<ErrorCode>,
}

impl MethodResponse {
    /// Builds a successful response.
    #[must_use]
    pub fn ok(outputs: HashMap<String, Value>) -> Self {
        Self {
            outputs,
            error: None,
            error_code: None,
        }
    }

    /// Builds a failed response with a message and code.
    #[must_use]
    pub fn err(message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            outputs: HashMap::new(),
            error: Some(message.into()),
            error_code: Some(code),
        }
    }
}
