use crate::config::{config_schema, Config};
use crate::dispatch::Dispatcher;
use crate::protocol::{id_key, Request, Response, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};
use crate::tools::{tool_definitions, tool_error, tool_success};
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

/// Shared by every request task. The only mutable state is the set of
/// in-flight cancellation tokens.
struct ServerContext {
	dispatcher: Dispatcher,
	session_id: String,
	in_flight: Mutex<HashMap<String, CancellationToken>>,
}

impl ServerContext {
	fn new(config: &Config) -> Self {
		Self {
			dispatcher: Dispatcher::new(config.sandbox.clone(), config.limits.clone()),
			session_id: config.session_id.clone(),
			in_flight: Mutex::new(HashMap::new())
		}
	}

	/// Returns `None` while another request with the same id is in flight.
	fn register(&self, id: &Value) -> Option<CancellationToken> {
		let mut in_flight = self.in_flight.lock().ok()?;
		match in_flight.entry(id_key(id)) {
			Entry::Occupied(_) => None,
			Entry::Vacant(slot) => Some(slot.insert(CancellationToken::new()).clone()),
		}
	}

	fn release(&self, id: &Value) {
		if let Ok(mut in_flight) = self.in_flight.lock() {
			in_flight.remove(&id_key(id));
		}
	}

	fn cancel(&self, id: &Value) -> bool {
		let token = self.in_flight
			.lock()
			.ok()
			.and_then(|in_flight| in_flight.get(&id_key(id)).cloned());
		match token {
			Some(token) => {
				token.cancel();
				true
			}
			None => false,
		}
	}
}

/// Reads one JSON-RPC message per stdin line until EOF. Each request runs in
/// its own task; a single writer task owns stdout.
pub async fn run(config: Config) -> Result<()> {
	let context = Arc::new(ServerContext::new(&config));
	info!(root = %config.sandbox.root().display(), session_id = %config.session_id, "serving over stdio");
	let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
	let writer = tokio::spawn(async move {
		let mut writer = io::BufWriter::new(io::stdout());
		while let Some(resp) = rx.recv().await {
			write_response(&mut writer, resp).await?;
		}
		Ok::<(), anyhow::Error>(())
	});
	let mut reader = BufReader::new(io::stdin()).lines();
	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let req = match parse_request(&line) {
			Ok(req) => req,
			Err(resp) => {
				let _ = tx.send(resp);
				continue;
			}
		};
		if req.is_notification() {
			handle_notification(&context, &req);
			continue;
		}
		// Registered before the spawn so a cancellation on the next line
		// always finds the token.
		let id = req.id.clone().unwrap_or(Value::Null);
		let Some(cancel) = context.register(&id) else {
			warn!(request_id = %id, "duplicate in-flight request id");
			let _ = tx.send(Response::err(id, INVALID_REQUEST, "duplicate request id"));
			continue;
		};
		let context = context.clone();
		let tx = tx.clone();
		tokio::spawn(async move {
			let resp = handle_request(&context, req, cancel).await;
			let _ = tx.send(resp);
		});
	}
	debug!("stdin closed; draining in-flight requests");
	drop(tx);
	writer.await??;
	Ok(())
}

fn parse_request(line: &str) -> std::result::Result<Request, Response> {
	let value: Value = serde_json::from_str(line)
		.map_err(|err| Response::err(Value::Null, PARSE_ERROR, format!("parse error: {}", err)))?;
	let id = value.get("id").cloned().unwrap_or(Value::Null);
	let req: Request = serde_json::from_value(value)
		.map_err(|err| Response::err(id.clone(), INVALID_REQUEST, format!("invalid request: {}", err)))?;
	if req.jsonrpc.as_deref().map(|version| version != "2.0").unwrap_or(false) {
		return Err(Response::err(id, INVALID_REQUEST, "jsonrpc must be \"2.0\""));
	}
	Ok(req)
}

fn handle_notification(context: &ServerContext, req: &Request) {
	match req.method.as_str() {
		"notifications/cancelled" => {
			let Some(request_id) = req.params.get("requestId") else {
				warn!("cancellation without requestId");
				return;
			};
			if context.cancel(request_id) {
				info!(request_id = %request_id, "request cancelled");
			}
			else {
				debug!(request_id = %request_id, "cancellation for unknown or finished request");
			}
		}
		method => debug!(method, "ignoring notification"),
	}
}

async fn handle_request(context: &ServerContext, req: Request, cancel: CancellationToken) -> Response {
	let id = req.id.clone().unwrap_or(Value::Null);
	let tool_name = extract_tool_name(&req.method, &req.params);
	let span = info_span!(
		"mcp.request",
		"mcp.session_id" = %context.session_id,
		"mcp.method" = %req.method,
		"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
		"mcp.root" = %context.dispatcher.sandbox().root().display(),
		"mcp.is_error" = tracing::field::Empty,
		"mcp.error_kind" = tracing::field::Empty,
		"mcp.count" = tracing::field::Empty,
		"mcp.response_bytes" = tracing::field::Empty,
	);
	let outcome = route(context, &req, cancel).instrument(span.clone()).await;
	context.release(&id);
	match outcome {
		Ok(value) => {
			record_result(&span, &value);
			Response::ok(id, value)
		}
		Err(err) => {
			span.record("mcp.is_error", true);
			Response::err(id, err.code, err.message)
		}
	}
}

async fn route(context: &ServerContext, req: &Request, cancel: CancellationToken) -> std::result::Result<Value, ProtocolError> {
	match req.method.as_str() {
		"initialize" => {
			let protocol_version = req.params
				.get("protocolVersion")
				.and_then(Value::as_str)
				.unwrap_or(DEFAULT_PROTOCOL_VERSION);
			Ok(json!({
				"protocolVersion": protocol_version,
				"serverInfo": {
					"name": env!("CARGO_PKG_NAME"),
					"version": env!("CARGO_PKG_VERSION")
				},
				"capabilities": {
					"tools": {
						"listChanged": false
					}
				},
				"configSchema": config_schema()
			}))
		}
		"ping" => Ok(json!({})),
		"tools/list" => Ok(json!({
			"tools": tool_definitions()
		})),
		"tools/call" => {
			let name = req.params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| ProtocolError::new(INVALID_PARAMS, "name is required"))?;
			let arguments = req.params
				.get("arguments")
				.cloned()
				.unwrap_or_else(|| json!({}));
			match context.dispatcher.dispatch(name, &arguments, cancel).await {
				Ok(structured) => Ok(tool_success(structured)),
				Err(err) => {
					debug!(kind = err.kind.as_str(), "{}", err);
					Ok(tool_error(&err))
				}
			}
		}
		_ => Err(ProtocolError::new(METHOD_NOT_FOUND, "method not found")),
	}
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("mcp.response_bytes", bytes);
	}
	let is_error = result.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("mcp.is_error", is_error);
	let structured = result.get("structuredContent");
	if is_error {
		if let Some(kind) = structured.and_then(|value| value.get("kind")).and_then(Value::as_str) {
			span.record("mcp.error_kind", kind);
		}
	}
	if let Some(count) = structured.and_then(|value| value.get("count")).and_then(Value::as_u64) {
		span.record("mcp.count", count);
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}
