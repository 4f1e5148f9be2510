//! Typed input/output descriptors and values for contract methods.

use serde_json::Value;

/// Semantic type tag for an [`Input`] or [`Output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    /// Free text.
    Text,
    /// Numeric value.
    Number,
    /// Boolean flag.
    Boolean,
    /// Base64-encoded audio payload.
    Audio,
    /// Base64-encoded image payload.
    Image,
    /// Base64-encoded video payload.
    Video,
    /// Base64-encoded file payload.
    File,
    /// Arbitrary JSON value.
    Json,
}

/// Declared input to a [`super::method::Method`].
#[derive(Debug, Clone)]
pub struct Input {
    /// Input name, matched case-sensitively against parsed values.
    pub name: String,
    /// Semantic type.
    pub io_type: IoType,
    /// Default value used when the input is missing and not required.
    pub default: Option<Value>,
    /// Whether the input must be supplied (directly or via default).
    pub required: bool,
}

impl Input {
    /// Builds a required input with no default.
    #[must_use]
    pub fn required(name: impl Into<String>, io_type: IoType) -> Self {
        Self {
            name: name.into(),
            io_type,
            default: None,
            required: true,
        }
    }

    /// Builds an optional input with the given default.
    #[must_use]
    pub fn optional(name: impl Into<String>, io_type: IoType, default: Value) -> Self {
        Self {
            name: name.into(),
            io_type,
            default: Some(default),
            required: false,
        }
    }
}

/// Declared output of a [`super::method::Method`].
#[derive(Debug, Clone)]
pub struct Output {
    /// Output name.
    pub name: String,
    /// Semantic type.
    pub io_type: IoType,
}

impl Output {
    /// Builds an output descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, io_type: IoType) -> Self {
        Self {
            name: name.into(),
            io_type,
        }
    }
}
