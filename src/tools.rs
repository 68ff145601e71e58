use crate::dispatch::OperationKind;
use crate::error::OperationError;
use once_cell::sync::Lazy;
use serde_json::{json, Value};

static TOOL_CATALOG: Lazy<Vec<Value>> = Lazy::new(|| OperationKind::ALL.iter().map(|kind| definition(*kind)).collect());

pub fn tool_definitions() -> &'static [Value] {
	&TOOL_CATALOG
}

/// Wraps an executor payload as an MCP tool result.
pub fn tool_success(structured: Value) -> Value {
	let text = serde_json::to_string(&structured).unwrap_or_default();
	json!({
		"structuredContent": structured,
		"content": [
			{
				"type": "text",
				"text": text
			}
		]
	})
}

pub fn tool_error(err: &OperationError) -> Value {
	let structured = serde_json::to_value(err).unwrap_or_else(|_| json!({
		"kind": err.kind.as_str(),
		"message": err.message
	}));
	let text = serde_json::to_string(&structured).unwrap_or_default();
	json!({
		"isError": true,
		"structuredContent": structured,
		"content": [
			{
				"type": "text",
				"text": text
			}
		]
	})
}

fn definition(kind: OperationKind) -> Value {
	let (description, input_schema) = match kind {
		OperationKind::Create => (
			"create a file with optional initial content (fails if it exists unless overwrite is set)",
			json!({
				"type": "object",
				"properties": {
					"path": { "type": "string", "description": "File path relative to the root." },
					"content": { "type": "string", "description": "Initial content. Defaults to empty." },
					"overwrite": { "type": "boolean", "description": "Replace an existing file. Requires confirm when it exists." },
					"parents": { "type": "boolean", "description": "Create missing parent directories." },
					"confirm": { "type": "boolean", "description": "Confirms replacing an existing file." }
				},
				"required": ["path"],
				"additionalProperties": false
			})
		),
		OperationKind::Read => (
			"read a text file (bounded by the configured read limit)",
			path_only("File path relative to the root.")
		),
		OperationKind::Write => (
			"write content to a file atomically, returning a unified diff of the change",
			json!({
				"type": "object",
				"properties": {
					"path": { "type": "string", "description": "File path relative to the root." },
					"content": { "type": "string" },
					"mode": { "type": "string", "enum": ["overwrite", "append", "prepend"], "default": "overwrite" },
					"parents": { "type": "boolean", "description": "Create missing parent directories." },
					"confirm": { "type": "boolean", "description": "Required to overwrite an existing file." }
				},
				"required": ["path", "content"],
				"additionalProperties": false
			})
		),
		OperationKind::Delete => (
			"delete a file, symlink, or directory (always requires confirm)",
			json!({
				"type": "object",
				"properties": {
					"path": { "type": "string" },
					"recursive": { "type": "boolean", "description": "Remove a non-empty directory and its subtree." },
					"confirm": { "type": "boolean" }
				},
				"required": ["path"],
				"additionalProperties": false
			})
		),
		OperationKind::Copy => (
			"copy a file or directory tree",
			transfer_schema(true)
		),
		OperationKind::Move => (
			"move a file or directory, renaming in place when possible",
			transfer_schema(true)
		),
		OperationKind::Rename => (
			"rename an entry; a bare destination name stays in the source directory",
			transfer_schema(false)
		),
		OperationKind::List => (
			"list directory entries with metadata, sorted by path",
			json!({
				"type": "object",
				"properties": {
					"path": { "type": "string", "default": "." },
					"non_recursive": { "type": "boolean", "description": "Only immediate children. Defaults to the full subtree." }
				},
				"additionalProperties": false
			})
		),
		OperationKind::Mkdir => (
			"create a directory",
			json!({
				"type": "object",
				"properties": {
					"path": { "type": "string" },
					"parents": { "type": "boolean", "description": "Create missing intermediate directories." },
					"exist_ok": { "type": "boolean", "description": "Succeed when the directory already exists." }
				},
				"required": ["path"],
				"additionalProperties": false
			})
		),
		OperationKind::Stat => (
			"describe one entry without following a final symlink",
			path_only("Entry path relative to the root.")
		),
		OperationKind::Search => (
			"find entries by name, extension, content, kind, or size",
			json!({
				"type": "object",
				"properties": {
					"root": { "type": "string", "default": "." },
					"name_pattern": { "type": "string", "description": "Glob on the base name, or a regex when regex is true." },
					"regex": { "type": "boolean" },
					"case_sensitive": { "type": "boolean", "description": "Defaults to smart case: sensitive when the pattern has uppercase." },
					"extension": {
						"description": "Exact suffix such as .txt, a comma-separated list, or an array. Any listed suffix matches.",
						"oneOf": [
							{ "type": "string" },
							{ "type": "array", "items": { "type": "string" } }
						]
					},
					"content": { "type": "string", "description": "Literal text a regular file must contain." },
					"kind": { "type": "string", "enum": ["any", "file", "directory", "symlink"], "default": "any" },
					"min_size": { "type": "integer", "minimum": 0 },
					"max_depth": { "type": "integer", "minimum": 0 },
					"max_results": { "type": "integer", "minimum": 0, "description": "0 disables the cap. Defaults to the configured search limit." }
				},
				"additionalProperties": false
			})
		),
		OperationKind::Compare => (
			"compare two text files and return a unified diff",
			json!({
				"type": "object",
				"properties": {
					"first": { "type": "string" },
					"second": { "type": "string" }
				},
				"required": ["first", "second"],
				"additionalProperties": false
			})
		),
		OperationKind::Backup => (
			"copy a file to a timestamped backup next to it",
			path_only("File path relative to the root.")
		),
		OperationKind::CountLines => (
			"count the lines of a text file",
			path_only("File path relative to the root.")
		),
		OperationKind::BulkDelete => (
			"delete every regular file under a directory whose name matches a pattern (always requires confirm)",
			json!({
				"type": "object",
				"properties": {
					"path": { "type": "string", "default": "." },
					"pattern": { "type": "string", "description": "Glob on the base name, or a regex when regex is true." },
					"regex": { "type": "boolean" },
					"case_sensitive": { "type": "boolean", "description": "Defaults to smart case: sensitive when the pattern has uppercase." },
					"non_recursive": { "type": "boolean", "description": "Only files directly inside path." },
					"confirm": { "type": "boolean" }
				},
				"required": ["pattern"],
				"additionalProperties": false
			})
		),
		OperationKind::Stats => (
			"summarize a directory: file and directory counts, total and average size, largest and smallest file, totals by extension",
			json!({
				"type": "object",
				"properties": {
					"path": { "type": "string", "default": "." },
					"non_recursive": { "type": "boolean", "description": "Only immediate children. Defaults to the full subtree." }
				},
				"additionalProperties": false
			})
		),
	};
	let destructive = matches!(
		kind,
		OperationKind::Write | OperationKind::Delete | OperationKind::Move | OperationKind::Rename | OperationKind::BulkDelete
	);
	let read_only = matches!(
		kind,
		OperationKind::Read | OperationKind::List | OperationKind::Stat | OperationKind::Search | OperationKind::Compare | OperationKind::CountLines
			| OperationKind::Stats
	);
	json!({
		"name": kind.as_str(),
		"description": description,
		"annotations": {
			"readOnlyHint": read_only,
			"destructiveHint": destructive
		},
		"inputSchema": input_schema
	})
}

fn path_only(description: &str) -> Value {
	json!({
		"type": "object",
		"properties": {
			"path": { "type": "string", "description": description }
		},
		"required": ["path"],
		"additionalProperties": false
	})
}

fn transfer_schema(parents: bool) -> Value {
	let mut schema = json!({
		"type": "object",
		"properties": {
			"source": { "type": "string" },
			"destination": { "type": "string" },
			"overwrite": { "type": "boolean", "description": "Replace an existing destination of the same kind." },
			"confirm": { "type": "boolean", "description": "Required when overwrite replaces an existing entry." }
		},
		"required": ["source", "destination"],
		"additionalProperties": false
	});
	if parents {
		schema["properties"]["parents"] = json!({ "type": "boolean", "description": "Create missing parent directories of the destination." });
	}
	schema
}
