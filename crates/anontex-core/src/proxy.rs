//! Request pipeline: validate, anonymize, forward upstream, restore reply

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

use crate::anonymize::AnonymizationEngine;
use crate::deanonymize::DeanonymizationEngine;
use crate::error::{AnontexError, Result};
use crate::mapping::MappingStore;

/// Inbound headers copied onto the upstream request. Nothing else is sent.
const FORWARDED_REQUEST_HEADERS: [header::HeaderName; 2] =
    [header::CONTENT_TYPE, header::AUTHORIZATION];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Validated,
    Anonymized,
    Forwarded,
    UpstreamOk,
    UpstreamError,
    Deanonymized,
    Responded,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Received => "RECEIVED",
            PipelineState::Validated => "VALIDATED",
            PipelineState::Anonymized => "ANONYMIZED",
            PipelineState::Forwarded => "FORWARDED",
            PipelineState::UpstreamOk => "UPSTREAM_OK",
            PipelineState::UpstreamError => "UPSTREAM_ERROR",
            PipelineState::Deanonymized => "DEANONYMIZED",
            PipelineState::Responded => "RESPONDED",
            PipelineState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Per-call state. Lives for one HTTP round trip and is never persisted.
#[derive(Debug)]
pub struct ProxyRequestContext {
    pub method: Method,
    pub path: String,
    pub request_id: Option<String>,
    state: PipelineState,
    failed_in: Option<PipelineState>,
}

impl ProxyRequestContext {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            request_id: None,
            state: PipelineState::Received,
            failed_in: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// State the pipeline was in when it failed, if it did.
    pub fn failed_in(&self) -> Option<PipelineState> {
        self.failed_in
    }

    fn advance(&mut self, next: PipelineState) {
        debug!(
            "{} {} [{}]: {} -> {}",
            self.method,
            self.path,
            self.request_id.as_deref().unwrap_or("-"),
            self.state,
            next
        );
        self.state = next;
    }

    fn fail(&mut self, error: &AnontexError) {
        self.failed_in = Some(self.state);
        warn!(
            "{} {} [{}] failed in {}: {}",
            self.method,
            self.path,
            self.request_id.as_deref().unwrap_or("-"),
            self.state,
            error.kind()
        );
        self.state = PipelineState::Failed;
    }
}

pub struct ProxyPipeline {
    anonymizer: AnonymizationEngine,
    deanonymizer: DeanonymizationEngine,
    store: MappingStore,
    client: reqwest::Client,
    upstream_base: String,
    language: String,
    entities: Vec<String>,
}

impl ProxyPipeline {
    pub fn new(
        anonymizer: AnonymizationEngine,
        deanonymizer: DeanonymizationEngine,
        store: MappingStore,
        client: reqwest::Client,
        upstream_base: impl Into<String>,
        language: impl Into<String>,
        entities: Vec<String>,
    ) -> Self {
        Self {
            anonymizer,
            deanonymizer,
            store,
            client,
            upstream_base: upstream_base.into().trim_end_matches('/').to_string(),
            language: language.into(),
            entities,
        }
    }

    pub fn upstream_base(&self) -> &str {
        &self.upstream_base
    }

    /// Runs one request end to end. Any error aborts at the state where it
    /// happened; the original text is never sent upstream on failure.
    pub async fn handle(
        &self,
        ctx: &mut ProxyRequestContext,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response> {
        match self.run(ctx, headers, body).await {
            Ok(response) => Ok(response),
            Err(e) => {
                ctx.fail(&e);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        ctx: &mut ProxyRequestContext,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response> {
        let mut payload = validate_chat_payload(&body)?;
        ctx.advance(PipelineState::Validated);

        let content = last_message_content(&payload)?.to_string();
        let anonymized = self.anonymizer.anonymize(&content, &self.language, &self.entities).await?;
        set_last_message_content(&mut payload, anonymized.text);
        ctx.request_id = Some(anonymized.request_id.clone());
        ctx.advance(PipelineState::Anonymized);

        let upstream = match self.forward(ctx, headers, &payload).await {
            Ok(upstream) => upstream,
            Err(e) => {
                // The mapping stays behind and expires on its own.
                ctx.advance(PipelineState::UpstreamError);
                return Err(e);
            }
        };
        // Non-2xx replies are still forwarded through the normal path.
        ctx.advance(PipelineState::UpstreamOk);
        let (status, upstream_headers, upstream_body) = upstream;

        let body = self
            .restore_reply(&anonymized.request_id, status, upstream_body)
            .await?;
        ctx.advance(PipelineState::Deanonymized);

        let response = build_response(status, &upstream_headers, body)?;
        ctx.advance(PipelineState::Responded);
        info!(
            "{} {} [{}] -> {}",
            ctx.method, ctx.path, anonymized.request_id, status
        );
        Ok(response)
    }

    async fn forward(
        &self,
        ctx: &mut ProxyRequestContext,
        headers: &HeaderMap,
        payload: &Value,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let url = format!("{}{}", self.upstream_base, ctx.path);
        let mut request = self.client.request(ctx.method.clone(), &url);
        for name in FORWARDED_REQUEST_HEADERS.iter() {
            if let Some(value) = headers.get(name) {
                request = request.header(name, value);
            }
        }
        let body = serde_json::to_vec(payload).map_err(|e| {
            AnontexError::Internal(format!("Failed to serialize request body: {}", e))
        })?;

        ctx.advance(PipelineState::Forwarded);
        debug!("Forwarding {} {} ({} bytes)", ctx.method, url, body.len());

        let response = request.body(body).send().await?;
        let status = response.status();
        let response_headers = response.headers().clone();
        let response_body = response.bytes().await?;

        info!("Forwarded response from {}, status: {}", url, status);
        Ok((status, response_headers, response_body))
    }

    /// Restores the assistant reply in place. A non-2xx body without
    /// `choices[0].message.content` passes through untouched; a 2xx body
    /// without it cannot be restored and fails the request.
    async fn restore_reply(
        &self,
        request_id: &str,
        status: StatusCode,
        body: Bytes,
    ) -> Result<Bytes> {
        let mut json: Option<Value> = serde_json::from_slice(&body).ok();
        let Some(content) = json.as_mut().and_then(reply_content_mut) else {
            self.discard_mapping(request_id).await;
            if status.is_success() {
                return Err(AnontexError::Internal(format!(
                    "Upstream reply for request '{}' has no restorable assistant content",
                    request_id
                )));
            }
            debug!(
                "Upstream error body has no assistant content (status {}), forwarding verbatim",
                status
            );
            return Ok(body);
        };

        let restored = self.deanonymizer.deanonymize(content, request_id).await?;
        *content = restored;

        serde_json::to_vec(&json)
            .map(Bytes::from)
            .map_err(|e| {
                AnontexError::Internal(format!("Failed to serialize response body: {}", e))
            })
    }

    async fn discard_mapping(&self, request_id: &str) {
        if let Err(e) = self.store.delete(request_id).await {
            warn!(
                "Could not delete mapping for request '{}', leaving it to expire: {}",
                request_id, e
            );
        }
    }
}

/// Parses the inbound body and checks for a non-empty `messages` list.
pub fn validate_chat_payload(body: &[u8]) -> Result<Value> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|_| AnontexError::Validation("Request body must be valid JSON.".to_string()))?;

    match payload.get("messages").and_then(Value::as_array) {
        Some(messages) if !messages.is_empty() => {}
        _ => return Err(AnontexError::Validation("Invalid messages format.".to_string())),
    }
    last_message_content(&payload)?;
    Ok(payload)
}

fn last_message_content(payload: &Value) -> Result<&str> {
    payload
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.last())
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AnontexError::Validation("Last message must have string content.".to_string())
        })
}

fn set_last_message_content(payload: &mut Value, content: String) {
    if let Some(message) = payload
        .get_mut("messages")
        .and_then(Value::as_array_mut)
        .and_then(|messages| messages.last_mut())
    {
        message["content"] = Value::String(content);
    }
}

fn reply_content_mut(json: &mut Value) -> Option<&mut String> {
    match json
        .get_mut("choices")?
        .get_mut(0)?
        .get_mut("message")?
        .get_mut("content")?
    {
        Value::String(content) => Some(content),
        _ => None,
    }
}

fn build_response(
    status: StatusCode,
    upstream_headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        // The body may have changed length; hyper recomputes framing.
        if *name == header::CONTENT_LENGTH
            || *name == header::TRANSFER_ENCODING
            || *name == header::CONNECTION
        {
            continue;
        }
        if let Ok(v) = HeaderValue::from_bytes(value.as_bytes()) {
            builder = builder.header(name, v);
        }
    }

    builder
        .body(Body::from(body))
        .map_err(|e| AnontexError::Internal(format!("Failed to build response: {}", e)))
}
