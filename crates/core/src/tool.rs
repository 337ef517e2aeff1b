//! JSON-RPC tool surface for agentic callers.
//!
//! Only the methods a tool-calling client needs are implemented: `initialize`,
//! `ping`, `tools/list` and `tools/call` for a single tool,
//! [`EXTRACT_TOOL_NAME`], which takes a document URL.

use crate::error::ErrorBody;
use crate::models::DocumentReference;
use crate::orchestrator::JobOrchestrator;
use crate::traits::FigureEngine;
use crate::ExtractionError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

pub const EXTRACT_TOOL_NAME: &str = "extract_figures_from_pdf";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::failure(Value::Null, PARSE_ERROR, message)
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: ExtractArguments,
}

#[derive(Debug, Default, Deserialize)]
struct ExtractArguments {
    pdf_url: Option<String>,
}

fn tool_descriptor() -> Value {
    json!({
        "name": EXTRACT_TOOL_NAME,
        "description": "Extracts figures and tables from a publicly accessible PDF URL and returns \
            captions, bounding boxes, page numbers, extracted text and URLs of the rendered images.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "pdf_url": {
                    "type": "string",
                    "description": "The URL of a publicly accessible PDF file to be processed."
                }
            },
            "required": ["pdf_url"]
        }
    })
}

/// Handles one request. Notifications (no `id`) produce no response.
pub async fn dispatch<E>(orchestrator: &JobOrchestrator<E>, request: RpcRequest) -> Option<RpcResponse>
where
    E: FigureEngine,
{
    let Some(id) = request.id else {
        debug!(method = %request.method, "tool notification");
        return None;
    };

    if request.jsonrpc.as_deref().is_some_and(|version| version != "2.0") {
        return Some(RpcResponse::failure(id, INVALID_REQUEST, "jsonrpc must be \"2.0\""));
    }

    let response = match request.method.as_str() {
        "initialize" => RpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "figure-extract",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        ),
        "ping" => RpcResponse::success(id, json!({})),
        "tools/list" => RpcResponse::success(id, json!({ "tools": [tool_descriptor()] })),
        "tools/call" => call_tool(orchestrator, id, request.params).await,
        other => RpcResponse::failure(id, METHOD_NOT_FOUND, format!("unknown method '{other}'")),
    };

    Some(response)
}

async fn call_tool<E>(orchestrator: &JobOrchestrator<E>, id: Value, params: Value) -> RpcResponse
where
    E: FigureEngine,
{
    let params: CallParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(error) => return RpcResponse::failure(id, INVALID_PARAMS, format!("invalid params: {error}")),
    };

    if params.name != EXTRACT_TOOL_NAME {
        return RpcResponse::failure(id, INVALID_PARAMS, format!("unknown tool '{}'", params.name));
    }

    let reference = match DocumentReference::from_parts(None, params.arguments.pdf_url) {
        Ok(reference) => reference,
        Err(error) => return RpcResponse::success(id, tool_error(&ErrorBody::from(&error), &error)),
    };

    match orchestrator.run(reference).await {
        Ok(result) => {
            let structured = serde_json::to_value(&result).unwrap_or(Value::Null);
            let text = serde_json::to_string(&result).unwrap_or_default();
            RpcResponse::success(
                id,
                json!({
                    "content": [{ "type": "text", "text": text }],
                    "structuredContent": structured,
                    "isError": false,
                }),
            )
        }
        Err(failure) => RpcResponse::success(id, tool_error(&failure.to_body(), &failure.error)),
    }
}

fn tool_error(body: &ErrorBody, error: &ExtractionError) -> Value {
    json!({
        "content": [{ "type": "text", "text": error.to_string() }],
        "structuredContent": body,
        "isError": true,
    })
}
