//! Bridges the dispatcher to the contract pipeline: runs the parser chain
//! against an event, calls the resulting service method, and replies with
//! the outcome.

use crate::context::EventContext;
use crate::dispatcher::Handler;

use super::errors::{ContractError, ErrorCode};
use super::method::CallOpts;
use super::parser::ParserChain;
use super::service::ServiceRegistry;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The one dispatcher [`Handler`] that connects contract parsing to the
/// service registry. Claims an event only once a parser has actually
/// recognized it as a service request, so events no parser wants fall
/// through to any handler registered after this one.
pub struct ContractDispatchHandler {
    parsers: ParserChain,
    registry: Arc<ServiceRegistry>,
}

impl ContractDispatchHandler {
    /// Builds a handler driving `registry` through `parsers`.
    #[must_use]
    pub fn new(parsers: ParserChain, registry: Arc<ServiceRegistry>) -> Self {
        Self { parsers, registry }
    }
}

#[async_trait]
impl Handler for ContractDispatchHandler {
    fn name(&self) -> &str {
        "contract_dispatch"
    }

    async fn handle(&self, ctx: Arc<EventContext>) -> anyhow::Result<()> {
        let Some(request) = self.parsers.parse(&ctx.event).await else {
            return Ok(());
        };

        if !ctx.claim() {
            return Ok(());
        }

        let Some(service) = self.registry.get(&request.service_name) else {
            let err = ContractError::ServiceNotFound(request.service_name.clone());
            let _ = ctx
                .reply_text(format!("{err} ({})", err.code().as_str()))
                .await;
            return Ok(());
        };

        let response = service
            .call_method(
                &request.method_name,
                request.inputs,
                CallOpts::default(),
                Arc::clone(&ctx),
            )
            .await;

        if let Some(err) = response.error {
            let code = response.error_code.map_or("unknown", ErrorCode::as_str);
            let _ = ctx.reply_text(format!("error: {err} ({code})")).await;
            return Ok(());
        }

        let reply = render_outputs(&response.outputs);
        if !reply.is_empty() {
            ctx.reply_text(reply).await?;
        }

        Ok(())
    }
}

/// Renders a method's outputs into a user-facing reply. Handlers today
/// converge on a single text-bearing output named `text` or `result`;
/// other declared outputs remain in the response for programmatic callers.
fn render_outputs(outputs: &HashMap<String, Value>) -> String {
    outputs
        .get("text")
        .or_else(|| outputs.get("result"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EventMetadata;
    use crate::contracts::parser::{ContractParser, ServiceRequest};
    use crate::event::EventContent;
    use crate::prelude::*;
    use matrix_sdk::ruma::MilliSecondsSinceUnixEpoch;

    struct AlwaysMatches {
        service_name: String,
    }

    #[async_trait]
    impl ContractParser for AlwaysMatches {
        fn name(&self) -> &str {
            "always_matches"
        }

        async fn parse(&self, _event: &Event) -> Option<ServiceRequest> {
            Some(ServiceRequest {
                service_name: self.service_name.clone(),
                method_name: "go".to_string(),
                inputs: HashMap::new(),
            })
        }
    }

    fn dummy_event() -> Event {
        Event {
            event_id: OwnedEventId::try_from("$e:example.org").unwrap(),
            room_id: None,
            sender: UserId::parse("@a:example.org").unwrap().to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            kind: EventKind::RoomMessage,
            content: EventContent::default(),
        }
    }

    fn ctx_without_room() -> Arc<EventContext> {
        Arc::new(EventContext::new(dummy_event(), None, EventMetadata::default()))
    }

    #[tokio::test]
    async fn event_no_parser_recognizes_is_left_unclaimed() {
        let handler = ContractDispatchHandler::new(ParserChain::new(), Arc::new(ServiceRegistry::new()));
        let ctx = ctx_without_room();

        handler.handle(Arc::clone(&ctx)).await.unwrap();

        assert!(!ctx.is_handled());
    }

    #[tokio::test]
    async fn unknown_service_is_claimed_even_though_it_cannot_be_served() {
        let mut parsers = ParserChain::new();
        parsers.push(Arc::new(AlwaysMatches {
            service_name: "missing".to_string(),
        }));
        let handler = ContractDispatchHandler::new(parsers, Arc::new(ServiceRegistry::new()));
        let ctx = ctx_without_room();

        handler.handle(Arc::clone(&ctx)).await.unwrap();

        assert!(ctx.is_handled());
    }

    #[test]
    fn render_outputs_prefers_text_over_result() {
        let mut outputs = HashMap::new();
        outputs.insert("result".to_string(), Value::String("r".to_string()));
        outputs.insert("text".to_string(), Value::String("t".to_string()));

        assert_eq!(render_outputs(&outputs), "t");
    }

    #[test]
    fn render_outputs_falls_back_to_result() {
        let mut outputs = HashMap::new();
        outputs.insert("result".to_string(), Value::String("r".to_string()));

        assert_eq!(render_outputs(&outputs), "r");
    }

    #[test]
    fn render_outputs_defaults_to_empty_without_a_string_output() {
        let outputs = HashMap::new();
        assert_eq!(render_outputs(&outputs), "");
    }
}
