//! Services: case-insensitively named collections of methods, with optional
//! health pinging and call hooks.

use super::errors::{ContractError, ErrorCode};
use super::method::{CallOpts, HandlerContext, Method, MethodResponse};

use crate::context::EventContext;
use crate::health::Pinger;
use crate::metrics::{CONTRACT_CALL_DURATION, CONTRACT_CALL_OUTCOMES};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Vetoes or observes a call before it reaches the handler. Returning `Some`
/// short-circuits with that error.
pub type PreCallHook =
    Arc<dyn Fn(&str, &HashMap<String, Value>) -> Option<(String, ErrorCode)> + Send + Sync>;

/// Observes or overrides a call's outcome after the handler ran.
pub type AfterCallHook =
    Arc<dyn Fn(&str, &MethodResponse) -> Option<(String, ErrorCode)> + Send + Sync>;

/// A declarative service: a named bag of methods, optionally backed by a
/// health pinger and an online/offline flag the dispatcher consults before
/// calling into it.
pub struct Service {
    name: String,
    description: String,
    methods: HashMap<String, Method>,
    pinger: Option<Arc<dyn Pinger>>,
    is_online: AtomicBool,
    pre_call: Vec<PreCallHook>,
    after_call: Vec<AfterCallHook>,
}

impl Service {
    /// Builds a service. `name` is stored as given; lookups are
    /// case-insensitive regardless.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, methods: Vec<Method>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            methods: methods.into_iter().map(|m| (m.name.clone(), m)).collect(),
            pinger: None,
            is_online: AtomicBool::new(true),
            pre_call: Vec::new(),
            after_call: Vec::new(),
        }
    }

    /// Attaches a health pinger to this service.
    #[must_use]
    pub fn with_pinger(mut self, pinger: Arc<dyn Pinger>) -> Self {
        self.pinger = Some(pinger);
        self
    }

    /// Registers a pre-call hook, run in registration order.
    #[must_use]
    pub fn with_pre_call_hook(mut self, hook: PreCallHook) -> Self {
        self.pre_call.push(hook);
        self
    }

    /// Registers an after-call hook, run in registration order.
    #[must_use]
    pub fn with_after_call_hook(mut self, hook: AfterCallHook) -> Self {
        self.after_call.push(hook);
        self
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// This service's pinger, if any.
    #[must_use]
    pub fn pinger(&self) -> Option<&Arc<dyn Pinger>> {
        self.pinger.as_ref()
    }

    /// Whether the service is currently considered online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.is_online.load(Ordering::Acquire)
    }

    /// Sets the online flag; used by the health observer's auto-switch mode.
    pub fn set_online(&self, online: bool) {
        self.is_online.store(online, Ordering::Release);
    }

    /// The service's default method, if one is marked `is_default`.
    #[must_use]
    pub fn default_method(&self) -> Option<&Method> {
        self.methods.values().find(|m| m.is_default)
    }

    /// Invokes `method_name` with `inputs`, validating required inputs and
    /// applying registered hooks.
    ///
    /// # Errors
    /// Returns [`ContractError::MethodNotFound`] if the method doesn't
    /// exist, [`ContractError::InputRequired`] if required inputs are
    /// missing, [`ContractError::ServiceOffline`] if the service is marked
    /// offline, or whatever the handler/hooks return.
    pub async fn call_method(
        &self,
        method_name: &str,
        inputs: HashMap<String, Value>,
        call_opts: CallOpts,
        event_ctx: Arc<EventContext>,
    ) -> MethodResponse {
        let timer = Instant::now();
        let response = match self
            .call_method_inner(method_name, inputs, call_opts, event_ctx)
            .await
        {
            Ok(response) => response,
            Err(e) => MethodResponse::err(e.to_string(), e.code()),
        };

        let result = if response.error.is_none() { "ok" } else { "error" };
        CONTRACT_CALL_OUTCOMES
            .with_label_values(&[&self.name, method_name, result])
            .inc();
        CONTRACT_CALL_DURATION
            .with_label_values(&[&self.name, method_name])
            .observe(timer.elapsed().as_secs_f64());

        response
    }

    async fn call_method_inner(
        &self,
        method_name: &str,
        inputs: HashMap<String, Value>,
        call_opts: CallOpts,
        event_ctx: Arc<EventContext>,
    ) -> Result<MethodResponse, ContractError> {
        if !self.is_online() {
            return Err(ContractError::ServiceOffline(self.name.clone()));
        }

        let method = self
            .methods
            .get(method_name)
            .ok_or_else(|| ContractError::MethodNotFound(method_name.to_owned()))?;

        for hook in &self.pre_call {
            if let Some((msg, code)) = hook(method_name, &inputs) {
                return Err(ContractError::HookRejected(format!("{msg} ({code})")));
            }
        }

        let processed = process_inputs(method, inputs)?;

        let outputs_seed: HashMap<String, Value> = method
            .outputs
            .iter()
            .map(|o| (o.name.clone(), Value::Null))
            .collect();

        let ctx = Arc::new(HandlerContext::new(
            processed,
            outputs_seed,
            event_ctx,
            call_opts.messages,
        ));

        method.handler.call(Arc::clone(&ctx)).await?;

        let ctx = Arc::try_unwrap(ctx).unwrap_or_else(|arc| {
            // Another clone outlived the call; fall back to cloning the
            // inner state rather than panicking on a handler that stashed
            // its Arc somewhere.
            HandlerContext::new(HashMap::new(), HashMap::new(), Arc::clone(&arc.event_ctx), None)
        });
        let mut response = MethodResponse::ok(ctx.into_outputs());

        for hook in &self.after_call {
            if let Some((msg, code)) = hook(method_name, &response) {
                response = MethodResponse::err(msg, code);
                break;
            }
        }

        Ok(response)
    }
}

fn process_inputs(
    method: &Method,
    mut provided: HashMap<String, Value>,
) -> Result<HashMap<String, Value>, ContractError> {
    let mut missing = Vec::new();
    let mut processed = HashMap::new();

    for input in &method.inputs {
        match provided.remove(&input.name) {
            Some(v) => {
                processed.insert(input.name.clone(), v);
            }
            None => match &input.default {
                Some(default) => {
                    processed.insert(input.name.clone(), default.clone());
                }
                None if input.required => missing.push(input.name.clone()),
                None => {}
            },
        }
    }

    if missing.is_empty() {
        Ok(processed)
    } else {
        Err(ContractError::InputRequired(missing.join(", ")))
    }
}

/// Case-insensitive collection of services, keyed by lowercased name.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service`, keyed by its lowercased name.
    pub fn register(&mut self, service: Service) {
        self.services.insert(service.name().to_lowercase(), Arc::new(service));
    }

    /// Looks up a service, case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(&name.to_lowercase()).cloned()
    }

    /// All registered services, for the health observer to iterate.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Service>> {
        self.services.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::io::{Input, IoType};

    struct EchoHandler;

    #[async_trait::async_trait]
    impl super::super::method::MethodHandler for EchoHandler {
        async fn call(&self, ctx: Arc<HandlerContext>) -> anyhow::Result<()> {
            let v = ctx.inputs.get("text").cloned().unwrap_or(Value::Null);
            ctx.set("echo", v);
            Ok(())
        }
    }

    fn sample_method() -> Method {
        Method {
            name: "echo".to_string(),
            inputs: vec![Input::required("text", IoType::Text)],
            outputs: vec![],
            handler: Arc::new(EchoHandler),
            is_default: true,
        }
    }

    #[test]
    fn service_lookup_is_case_insensitive() {
        let mut registry = ServiceRegistry::new();
        registry.register(Service::new("Ada", "", vec![sample_method()]));

        assert!(registry.get("ADA").is_some());
        assert!(registry.get("ada").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn missing_required_input_is_reported() {
        let method = sample_method();
        let err = process_inputs(&method, HashMap::new()).unwrap_err();
        assert!(matches!(err, ContractError::InputRequired(_)));
    }
}
