use crate::resolver::Sandbox;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::filter::LevelFilter;

/// Size and count bounds applied by the executors. `None` is unlimited.
#[derive(Clone, Debug)]
pub struct Limits {
	pub read_max_bytes: Option<u64>,
	pub search_content_max_bytes: Option<u64>,
	pub search_limit: Option<usize>,
	pub list_limit: Option<usize>,
}

impl Limits {
	pub fn within_read_limit(&self, size: u64) -> bool {
		self.read_max_bytes.map(|max| size <= max).unwrap_or(true)
	}
}

impl Default for Limits {
	fn default() -> Self {
		Self {
			read_max_bytes: Some(1024 * 1024),
			search_content_max_bytes: Some(1024 * 1024),
			search_limit: Some(200),
			list_limit: Some(10_000),
		}
	}
}

#[derive(Clone, Debug)]
pub struct Config {
	pub sandbox: Sandbox,
	pub limits: Limits,
	pub log_level: LevelFilter,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

/// One configuration layer; later layers win field by field.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Overrides {
	root: Option<String>,
	read_max_bytes: Option<u64>,
	search_content_max_bytes: Option<u64>,
	search_limit: Option<usize>,
	list_limit: Option<usize>,
	log_level: Option<String>,
	otel_enabled: Option<bool>,
	otel_endpoint: Option<String>,
	otel_service_name: Option<String>,
}

impl Overrides {
	fn layer(self, over: Overrides) -> Overrides {
		Overrides {
			root: over.root.or(self.root),
			read_max_bytes: over.read_max_bytes.or(self.read_max_bytes),
			search_content_max_bytes: over.search_content_max_bytes.or(self.search_content_max_bytes),
			search_limit: over.search_limit.or(self.search_limit),
			list_limit: over.list_limit.or(self.list_limit),
			log_level: over.log_level.or(self.log_level),
			otel_enabled: over.otel_enabled.or(self.otel_enabled),
			otel_endpoint: over.otel_endpoint.or(self.otel_endpoint),
			otel_service_name: over.otel_service_name.or(self.otel_service_name),
		}
	}
}

struct CommandLine {
	overrides: Overrides,
	config_path: Option<String>,
	print_schema: bool,
}

pub fn load_config() -> Result<Config> {
	let cli = parse_args(std::env::args().skip(1))?;
	if cli.print_schema {
		let payload = serde_json::to_string_pretty(&config_schema())?;
		println!("{}", payload);
		std::process::exit(0);
	}
	let env = parse_env(|key| std::env::var(key).ok())?;
	let config_path = cli.config_path.or_else(|| non_empty(std::env::var("MCP_CONFIG").ok()));
	let file = match config_path {
		Some(path) => load_config_file(Path::new(&path))?,
		None => Overrides::default(),
	};
	let cwd = std::env::current_dir()?;
	build_config(file.layer(env).layer(cli.overrides), &cwd)
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CommandLine> {
	let mut overrides = Overrides::default();
	let mut config_path = None;
	let mut print_schema = false;
	while let Some(arg) = args.next() {
		let mut value = || args.next().ok_or_else(|| anyhow!("{} requires a value", arg));
		match arg.as_str() {
			"--root" => overrides.root = Some(value()?),
			"--config" => config_path = Some(value()?),
			"--print-config-schema" => print_schema = true,
			"--read-max-bytes" => overrides.read_max_bytes = Some(parse_number(&value()?, &arg)?),
			"--search-content-max-bytes" => overrides.search_content_max_bytes = Some(parse_number(&value()?, &arg)?),
			"--search-limit" => overrides.search_limit = Some(parse_number(&value()?, &arg)?),
			"--list-limit" => overrides.list_limit = Some(parse_number(&value()?, &arg)?),
			"--log-level" => overrides.log_level = Some(value()?),
			"--otel-enabled" => overrides.otel_enabled = Some(parse_bool(&value()?, &arg)?),
			"--otel-endpoint" => overrides.otel_endpoint = Some(value()?),
			"--otel-service-name" => overrides.otel_service_name = Some(value()?),
			_ => return Err(anyhow!("unknown argument: {}", arg)),
		}
	}
	Ok(CommandLine {
		overrides,
		config_path,
		print_schema
	})
}

fn parse_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Overrides> {
	let get = |key: &str| non_empty(lookup(key));
	let mut overrides = Overrides {
		root: get("MCP_ROOT"),
		log_level: get("MCP_LOG_LEVEL"),
		otel_endpoint: get("MCP_OTEL_ENDPOINT"),
		otel_service_name: get("MCP_OTEL_SERVICE_NAME"),
		..Overrides::default()
	};
	if let Some(value) = get("MCP_READ_MAX_BYTES") {
		overrides.read_max_bytes = Some(parse_number(&value, "MCP_READ_MAX_BYTES")?);
	}
	if let Some(value) = get("MCP_SEARCH_CONTENT_MAX_BYTES") {
		overrides.search_content_max_bytes = Some(parse_number(&value, "MCP_SEARCH_CONTENT_MAX_BYTES")?);
	}
	if let Some(value) = get("MCP_SEARCH_LIMIT") {
		overrides.search_limit = Some(parse_number(&value, "MCP_SEARCH_LIMIT")?);
	}
	if let Some(value) = get("MCP_LIST_LIMIT") {
		overrides.list_limit = Some(parse_number(&value, "MCP_LIST_LIMIT")?);
	}
	if let Some(value) = get("MCP_OTEL_ENABLED") {
		overrides.otel_enabled = Some(parse_bool(&value, "MCP_OTEL_ENABLED")?);
	}
	Ok(overrides)
}

fn load_config_file(path: &Path) -> Result<Overrides> {
	let text = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
	serde_json::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

fn build_config(overrides: Overrides, cwd: &Path) -> Result<Config> {
	let root = match overrides.root {
		Some(root) => {
			let root = PathBuf::from(root);
			if root.is_absolute() {
				root
			}
			else {
				cwd.join(root)
			}
		}
		None => cwd.to_path_buf(),
	};
	let sandbox = Sandbox::new(&root)?;
	let defaults = Limits::default();
	let limits = Limits {
		read_max_bytes: zero_is_unlimited(overrides.read_max_bytes, defaults.read_max_bytes),
		search_content_max_bytes: zero_is_unlimited(overrides.search_content_max_bytes, defaults.search_content_max_bytes),
		search_limit: zero_is_unlimited(overrides.search_limit, defaults.search_limit),
		list_limit: zero_is_unlimited(overrides.list_limit, defaults.list_limit),
	};
	let log_level = match overrides.log_level {
		Some(level) => level.parse::<LevelFilter>()
			.map_err(|_| anyhow!("log level must be one of off|error|warn|info|debug|trace"))?,
		None => LevelFilter::INFO,
	};
	Ok(Config {
		sandbox,
		limits,
		log_level,
		otel_enabled: overrides.otel_enabled.unwrap_or(false),
		otel_endpoint: overrides.otel_endpoint.unwrap_or_else(|| "http://127.0.0.1:4317".to_string()),
		otel_service_name: overrides.otel_service_name.unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
		session_id: uuid::Uuid::new_v4().to_string(),
	})
}

fn zero_is_unlimited<T: Default + PartialEq>(value: Option<T>, default: Option<T>) -> Option<T> {
	match value {
		Some(value) if value == T::default() => None,
		Some(value) => Some(value),
		None => default,
	}
}

pub fn config_schema() -> Value {
	json!({
		"$schema": "http://json-schema.org/draft-07/schema#",
		"title": "mcp-filehandler configuration",
		"type": "object",
		"additionalProperties": false,
		"properties": {
			"root": { "type": "string", "description": "Sandbox root; every operation is confined to it." },
			"read_max_bytes": { "type": "integer", "minimum": 0, "description": "Largest file read returns. 0 disables the limit." },
			"search_content_max_bytes": { "type": "integer", "minimum": 0, "description": "Largest file scanned by content search. 0 disables the limit." },
			"search_limit": { "type": "integer", "minimum": 0, "description": "Default max_results for search. 0 disables the limit." },
			"list_limit": { "type": "integer", "minimum": 0, "description": "Maximum entries returned by list. 0 disables the limit." },
			"log_level": { "type": "string", "enum": ["off", "error", "warn", "info", "debug", "trace"] },
			"otel_enabled": { "type": "boolean" },
			"otel_endpoint": { "type": "string" },
			"otel_service_name": { "type": "string" }
		}
	})
}

fn non_empty(value: Option<String>) -> Option<String> {
	value.filter(|value| !value.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(value: &str, label: &str) -> Result<T> {
	value.trim().parse::<T>().map_err(|_| anyhow!("{} must be a non-negative integer", label))
}

fn parse_bool(value: &str, label: &str) -> Result<bool> {
	let value = value.trim().to_lowercase();
	match value.as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}
