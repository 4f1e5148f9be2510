//! Contract layer: parsing free-form events into typed service/method calls
//! and dispatching them through a registry of declared services.

pub mod dispatch;
pub mod errors;
pub mod io;
pub mod method;
pub mod parser;
pub mod service;

pub use dispatch::ContractDispatchHandler;
pub use errors::{ContractError, ErrorCode};
pub use io::{Input, IoType, Output};
pub use method::{CallOpts, ChatMessage, HandlerContext, Method, MethodHandler, MethodResponse};
pub use parser::{
    AutoParser, ContractParser, MediaParser, ParserChain, ServiceRequest, StructuredTagParser,
    TextDirectiveParser, ALLOWED_MEDIA_MIME_TYPES, STRUCTURED_TAG_KEY,
};
pub use service::{AfterCallHook, PreCallHook, Service, ServiceRegistry};
