//! Contract parsers: pure(-ish) functions mapping a raw event to a
//! `(service, method, inputs)` triple, or "not my event".
//!
//! Multiple parsers may be registered per bot; [`ParserChain`] tries them in
//! registration order and uses the first non-null result - "first non-null
//! wins" (§9, pinned by the precedence test below).

use crate::prelude::*;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// A structured request derived from an event by a [`ContractParser`].
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    /// Target service name.
    pub service_name: String,
    /// Target method name.
    pub method_name: String,
    /// Untyped input values, later validated by [`crate::contracts::service::Service::call_method`].
    pub inputs: HashMap<String, Value>,
}

/// A parser that may claim an event as a [`ServiceRequest`].
#[async_trait]
pub trait ContractParser: Send + Sync {
    /// Parser name, for logs.
    fn name(&self) -> &str;

    /// Attempts to derive a request from `event`. `None` means "not my
    /// event" and the chain moves to the next parser.
    async fn parse(&self, event: &Event) -> Option<ServiceRequest>;
}

/// Tries each registered parser in order; the first `Some` wins.
#[derive(Default)]
pub struct ParserChain {
    parsers: Vec<Arc<dyn ContractParser>>,
}

impl ParserChain {
    /// Builds an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `parser`, to be tried after everything already registered.
    pub fn push(&mut self, parser: Arc<dyn ContractParser>) {
        self.parsers.push(parser);
    }

    /// Runs the chain, returning the first non-null result.
    pub async fn parse(&self, event: &Event) -> Option<ServiceRequest> {
        for parser in &self.parsers {
            if let Some(req) = parser.parse(event).await {
                trace!(parser = parser.name(), "contract parser claimed event");
                return Some(req);
            }
        }
        None
    }
}

/// Well-known raw-content key used by the structured tag parser. Namespaced
/// under this crate's own identity rather than any upstream reverse-DNS.
pub const STRUCTURED_TAG_KEY: &str = "dev.mxframe.contract";

/// Looks for [`STRUCTURED_TAG_KEY`] in the event's raw content bag and
/// deserializes it directly into a [`ServiceRequest`]. Used when the sender
/// is a programmatic client that already speaks the contract wire format.
pub struct StructuredTagParser;

#[async_trait]
impl ContractParser for StructuredTagParser {
    fn name(&self) -> &str {
        "structured_tag"
    }

    async fn parse(&self, event: &Event) -> Option<ServiceRequest> {
        let raw = event.content.raw.get(STRUCTURED_TAG_KEY)?;
        let service_name = raw.get("service")?.as_str()?.to_owned();
        let method_name = raw.get("method")?.as_str()?.to_owned();
        let inputs = raw
            .get("inputs")
            .and_then(Value::as_object)
            .cloned()
            .map(|m| m.into_iter().collect())
            .unwrap_or_default();

        Some(ServiceRequest {
            service_name,
            method_name,
            inputs,
        })
    }
}

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(@(?P<bot>\w+)\s+)*(-service:(?P<service>\w+)\s+)*(-method:(?P<method>\w+)\s)*(?P<inputs>.*)"#,
    )
    .expect("static directive regex compiles")
});

static INPUTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"-(\w+):"((?:\\"|[^"])*)""#).expect("static inputs regex compiles")
});

/// Matches the `[-service:<name>] [-method:<name>] (-<key>:"<value>")*`
/// directive grammar against plain-text bodies. `-key:"-"` encodes an
/// explicit null input.
///
/// The grammar is regex-driven and does not escape `-` inside input values;
/// that is a known limitation of the wire format itself, ported for parity
/// rather than redesigned, and pinned by the unit tests below.
pub struct TextDirectiveParser {
    /// Whether the bot must be explicitly tagged (`@bot ...`) for this
    /// parser to fire, independent of the directive grammar itself.
    pub require_tag: bool,
    bot_localpart: String,
}

impl TextDirectiveParser {
    /// Builds a parser requiring the bot's localpart to be tagged when
    /// `require_tag` is set.
    #[must_use]
    pub fn new(bot_localpart: impl Into<String>, require_tag: bool) -> Self {
        Self {
            require_tag,
            bot_localpart: bot_localpart.into(),
        }
    }
}

#[async_trait]
impl ContractParser for TextDirectiveParser {
    fn name(&self) -> &str {
        "text_directive"
    }

    async fn parse(&self, event: &Event) -> Option<ServiceRequest> {
        if event.content.msgtype != Some(MessageKind::Text) {
            return None;
        }

        let captures = DIRECTIVE_RE.captures(&event.content.body)?;

        if self.require_tag {
            let tagged = captures
                .name("bot")
                .is_some_and(|m| m.as_str() == self.bot_localpart);
            if !tagged {
                return None;
            }
        }

        let service_name = captures.name("service")?.as_str().to_owned();
        let method_name = captures.name("method")?.as_str().to_owned();
        let inputs_str = captures.name("inputs").map(|m| m.as_str()).unwrap_or("");

        let mut inputs = HashMap::new();
        for cap in INPUTS_RE.captures_iter(inputs_str) {
            let key = cap[1].to_owned();
            let value = &cap[2];
            if value == "-" {
                inputs.insert(key, Value::Null);
            } else {
                inputs.insert(key, Value::String(value.replace("\\\"", "\"")));
            }
        }

        Some(ServiceRequest {
            service_name,
            method_name,
            inputs,
        })
    }
}

/// Produces a fixed `(service, method)` with the whole message body as a
/// single named input, for private rooms or messages that mention the bot.
/// Lets the bot respond to free-form text without any directive syntax.
pub struct AutoParser {
    service_name: String,
    method_name: String,
    input_name: String,
    is_private_room: Arc<dyn Fn(&Event) -> bool + Send + Sync>,
}

impl AutoParser {
    /// Builds an auto parser targeting a fixed service/method, using
    /// `is_private_room` to decide whether a given event's room qualifies.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        input_name: impl Into<String>,
        is_private_room: Arc<dyn Fn(&Event) -> bool + Send + Sync>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
            input_name: input_name.into(),
            is_private_room,
        }
    }
}

#[async_trait]
impl ContractParser for AutoParser {
    fn name(&self) -> &str {
        "auto"
    }

    async fn parse(&self, event: &Event) -> Option<ServiceRequest> {
        if event.content.msgtype != Some(MessageKind::Text) {
            return None;
        }
        if !(self.is_private_room)(event) {
            return None;
        }

        let mut inputs = HashMap::new();
        inputs.insert(self.input_name.clone(), Value::String(event.content.body.clone()));

        Some(ServiceRequest {
            service_name: self.service_name.clone(),
            method_name: self.method_name.clone(),
            inputs,
        })
    }
}

/// MIME types the media parser will accept; anything else is rejected with
/// a typed error rather than forwarded to a handler.
pub const ALLOWED_MEDIA_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "audio/ogg",
    "audio/mpeg",
    "video/mp4",
];

/// Downloads (and decrypts, for encrypted rooms) audio/image/video/file
/// messages, validates the MIME type against [`ALLOWED_MEDIA_MIME_TYPES`],
/// base64-encodes the payload, and places it under a configured input name.
pub struct MediaParser {
    service_name: String,
    method_name: String,
    input_name: String,
    client: Client,
}

impl MediaParser {
    /// Builds a media parser targeting a fixed service/method/input-name,
    /// using `client` to fetch media content.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        input_name: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
            input_name: input_name.into(),
            client,
        }
    }
}

#[async_trait]
impl ContractParser for MediaParser {
    fn name(&self) -> &str {
        "media"
    }

    async fn parse(&self, event: &Event) -> Option<ServiceRequest> {
        let kind = event.content.msgtype?;
        if !matches!(kind, MessageKind::Audio | MessageKind::Image | MessageKind::Video | MessageKind::File) {
            return None;
        }

        match self.download_and_encode(event).await {
            Ok((mime, encoded)) => {
                if !ALLOWED_MEDIA_MIME_TYPES.contains(&mime.as_str()) {
                    warn!("rejecting media with disallowed mime type: {mime}");
                    return None;
                }

                let mut inputs = HashMap::new();
                inputs.insert(self.input_name.clone(), Value::String(encoded));

                Some(ServiceRequest {
                    service_name: self.service_name.clone(),
                    method_name: self.method_name.clone(),
                    inputs,
                })
            }
            Err(e) => {
                error!("media download/decrypt failed: {e}");
                None
            }
        }
    }
}

impl MediaParser {
    async fn download_and_encode(&self, event: &Event) -> anyhow::Result<(String, String)> {
        let mime = event
            .content
            .raw
            .get("info")
            .and_then(|i| i.get("mimetype"))
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_owned();

        let mxc_url = event
            .content
            .raw
            .get("file")
            .and_then(|f| f.get("url"))
            .or_else(|| event.content.raw.get("url"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("media event has no content url"))?;

        let access_token = self
            .client
            .access_token()
            .ok_or_else(|| anyhow!("client has no access token"))?;
        let homeserver = self.client.homeserver();
        let (server_name, media_id) = mxc_url
            .trim_start_matches("mxc://")
            .split_once('/')
            .ok_or_else(|| anyhow!("malformed mxc uri: {mxc_url}"))?;

        let download_url =
            format!("{homeserver}_matrix/client/v1/media/download/{server_name}/{media_id}");

        let http = reqwest::Client::new();
        let resp = http
            .get(download_url)
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?;
        let bytes = resp.bytes().await?.to_vec();

        // Encrypted rooms attach a `file` block (AES-CTR key/iv, algorithm
        // A256CTR, version v2) instead of a bare `url`; decrypt through
        // matrix-sdk's own attachment cipher rather than re-implementing it.
        let plaintext = if let Some(file_info) = event.content.raw.get("file") {
            let encrypted_file: matrix_sdk::ruma::events::room::EncryptedFile =
                serde_json::from_value(file_info.clone())?;
            let mut cursor = std::io::Cursor::new(bytes);
            let mut decryptor = matrix_sdk::attachment::AttachmentDecryptor::new(&mut cursor, encrypted_file.into())?;
            let mut out = Vec::new();
            std::io::Read::read_to_end(&mut decryptor, &mut out)?;
            out
        } else {
            bytes
        };

        Ok((mime, STANDARD.encode(plaintext)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventContent;
    use matrix_sdk::ruma::MilliSecondsSinceUnixEpoch;

    fn text_event(body: &str) -> Event {
        Event {
            event_id: OwnedEventId::try_from("$e:example.org").unwrap(),
            room_id: Some(OwnedRoomId::try_from("!r:example.org").unwrap()),
            sender: UserId::parse("@a:example.org").unwrap().to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            kind: EventKind::RoomMessage,
            content: EventContent {
                body: body.to_owned(),
                msgtype: Some(MessageKind::Text),
                relation: None,
                raw: serde_json::Map::new(),
            },
        }
    }

    #[tokio::test]
    async fn directive_parser_splits_service_method_and_inputs() {
        let parser = TextDirectiveParser::new("bot", false);
        let event = text_event(r#"-service:ada -method:generate -prompt:"hi there""#);

        let req = parser.parse(&event).await.unwrap();
        assert_eq!(req.service_name, "ada");
        assert_eq!(req.method_name, "generate");
        assert_eq!(req.inputs.get("prompt"), Some(&Value::String("hi there".to_string())));
    }

    #[tokio::test]
    async fn directive_parser_treats_dash_value_as_null() {
        let parser = TextDirectiveParser::new("bot", false);
        let event = text_event(r#"-service:ada -method:generate -prompt:"-""#);

        let req = parser.parse(&event).await.unwrap();
        assert_eq!(req.inputs.get("prompt"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn directive_parser_handles_escaped_quotes() {
        let parser = TextDirectiveParser::new("bot", false);
        let event = text_event(r#"-service:ada -method:generate -prompt:"say \"hi\"""#);

        let req = parser.parse(&event).await.unwrap();
        assert_eq!(
            req.inputs.get("prompt"),
            Some(&Value::String("say \"hi\"".to_string()))
        );
    }

    #[tokio::test]
    async fn parser_chain_honors_first_non_null_precedence() {
        let mut chain = ParserChain::new();
        chain.push(Arc::new(AutoParser::new(
            "auto-service",
            "auto-method",
            "body",
            Arc::new(|_: &Event| true),
        )));
        chain.push(Arc::new(TextDirectiveParser::new("bot", false)));

        let event = text_event(r#"-service:ada -method:generate -prompt:"hi""#);
        let req = chain.parse(&event).await.unwrap();

        // auto-parser is registered first and always matches text events,
        // so it claims the event even though the directive parser would
        // also have matched.
        assert_eq!(req.service_name, "auto-service");
    }
}
