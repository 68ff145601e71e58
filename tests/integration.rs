use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

struct RpcClient {
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	next_id: u64,
}

impl RpcClient {
	fn spawn(root: &Path) -> Self {
		let bin = env!("CARGO_BIN_EXE_mcp-filehandler");
		let mut child = Command::new(bin)
			.arg("--root")
			.arg(root)
			.arg("--log-level")
			.arg("warn")
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.expect("spawn mcp-filehandler");
		let stdin = child.stdin
			.take()
			.expect("stdin");
		let stdout = child.stdout
			.take()
			.expect("stdout");
		Self {
			child,
			stdin,
			stdout: BufReader::new(stdout),
			next_id: 1
		}
	}

	fn send(&mut self, method: &str, params: Value) -> Value {
		let id = self.next_id;
		self.next_id += 1;
		let req = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params
		});
		let line = serde_json::to_string(&req).expect("serialize request");
		self.send_line(&line);
		self.read_until(|parsed| parsed.get("id").and_then(Value::as_u64) == Some(id))
	}

	fn send_line(&mut self, line: &str) {
		writeln!(self.stdin, "{}", line).expect("write request");
		self.stdin
			.flush()
			.expect("flush request");
	}

	fn read_until(&mut self, wanted: impl Fn(&Value) -> bool) -> Value {
		let mut resp_line = String::new();
		loop {
			resp_line.clear();
			let bytes = self.stdout
				.read_line(&mut resp_line)
				.expect("read response");
			if bytes == 0 {
				panic!("mcp-filehandler exited unexpectedly");
			}
			let trimmed = resp_line.trim();
			if trimmed.is_empty() {
				continue;
			}
			let parsed: Value = serde_json::from_str(trimmed).expect("stdout carries only json");
			if wanted(&parsed) {
				return parsed;
			}
		}
	}

	fn call(&mut self, name: &str, arguments: Value) -> Value {
		let resp = self.send("tools/call", json!({ "name": name, "arguments": arguments }));
		resp.get("result").cloned().expect("result")
	}

	/// Calls a tool that must succeed and returns its structured payload.
	fn ok(&mut self, name: &str, arguments: Value) -> Value {
		let result = self.call(name, arguments);
		assert!(result.get("isError").is_none(), "{} failed: {}", name, result);
		result["structuredContent"].clone()
	}

	/// Calls a tool that must fail and returns its error kind.
	fn fail(&mut self, name: &str, arguments: Value) -> String {
		let result = self.call(name, arguments);
		assert_eq!(result["isError"], true, "{} unexpectedly succeeded: {}", name, result);
		result["structuredContent"]["kind"].as_str().expect("kind").to_string()
	}
}

impl Drop for RpcClient {
	fn drop(&mut self) {
		let _ = self.child.kill();
	}
}

fn write_text(path: &Path, contents: &str) {
	std::fs::create_dir_all(path.parent().unwrap()).expect("create parent");
	std::fs::write(path, contents).expect("write file");
}

#[test]
fn initialize_and_list_tools() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	let resp = client.send("initialize", json!({ "protocolVersion": "2024-11-05" }));
	assert_eq!(resp["jsonrpc"], "2.0");
	assert_eq!(resp["result"]["serverInfo"]["name"], "mcp-filehandler");
	let resp = client.send("tools/list", json!({}));
	let names: Vec<&str> = resp["result"]["tools"]
		.as_array()
		.expect("tools")
		.iter()
		.filter_map(|tool| tool["name"].as_str())
		.collect();
	for expected in ["create", "read", "write", "delete", "copy", "move", "rename", "list", "mkdir", "stat", "search", "bulk_delete", "stats"] {
		assert!(names.contains(&expected), "missing tool {}", expected);
	}
	let resp = client.send("ping", json!({}));
	assert_eq!(resp["result"], json!({}));
}

#[test]
fn write_then_read_round_trips() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	let content = "first line\nsecond line\n\u{00e9}t\u{00e9}\n";
	let written = client.ok("write", json!({ "path": "notes/today.txt", "content": content, "parents": true }));
	assert_eq!(written["created"], true);
	let read = client.ok("read", json!({ "path": "notes/today.txt" }));
	assert_eq!(read["content"], content);
	assert_eq!(read["lossy"], false);
	assert_eq!(std::fs::read_to_string(root.path().join("notes/today.txt")).expect("read"), content);
	let text = client.call("read", json!({ "path": "notes/today.txt" }))["content"][0]["text"]
		.as_str()
		.expect("text")
		.to_string();
	let mirrored: Value = serde_json::from_str(&text).expect("text is json");
	assert_eq!(mirrored["content"], content);
}

#[test]
fn delete_requires_confirmation() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("keep.txt"), "keep");
	let mut client = RpcClient::spawn(root.path());
	assert_eq!(client.fail("delete", json!({ "path": "keep.txt" })), "CONFIRMATION_REQUIRED");
	assert!(root.path().join("keep.txt").exists());
	client.ok("delete", json!({ "path": "keep.txt", "confirm": true }));
	assert!(!root.path().join("keep.txt").exists());
	std::fs::create_dir_all(root.path().join("tree/deep")).expect("mkdir");
	write_text(&root.path().join("tree/deep/leaf.txt"), "x");
	assert_eq!(client.fail("delete", json!({ "path": "tree", "confirm": true })), "NOT_EMPTY");
	let deleted = client.ok("delete", json!({ "path": "tree", "recursive": true, "confirm": true }));
	assert_eq!(deleted["removed"], 3);
	assert!(!root.path().join("tree").exists());
	assert_eq!(client.fail("delete", json!({ "path": ".", "recursive": true, "confirm": true })), "INVALID_REQUEST");
}

#[test]
fn mkdir_with_parents_then_list() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	client.ok("mkdir", json!({ "path": "a/b", "parents": true }));
	assert!(root.path().join("a/b").is_dir());
	let listing = client.ok("list", json!({ "path": "a" }));
	let entries = listing["entries"].as_array().expect("entries");
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0]["name"], "b");
	assert_eq!(entries[0]["kind"], "directory");
	assert_eq!(client.fail("mkdir", json!({ "path": "x/y" })), "NOT_FOUND");
}

#[test]
fn mkdir_exist_ok_is_idempotent() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	client.ok("mkdir", json!({ "path": "cache", "exist_ok": true }));
	client.ok("mkdir", json!({ "path": "cache", "exist_ok": true }));
	assert!(root.path().join("cache").is_dir());
	assert_eq!(client.fail("mkdir", json!({ "path": "cache" })), "ALREADY_EXISTS");
}

#[test]
fn traversal_is_a_path_violation() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	assert_eq!(client.fail("read", json!({ "path": "../../etc/passwd" })), "PATH_VIOLATION");
	assert_eq!(client.fail("write", json!({ "path": "../escape.txt", "content": "x" })), "PATH_VIOLATION");
	assert_eq!(client.fail("list", json!({ "path": "/" })), "PATH_VIOLATION");
	assert!(!root.path().parent().expect("parent").join("escape.txt").exists());
}

#[cfg(unix)]
#[test]
fn symlink_escape_is_a_path_violation() {
	let root = tempfile::tempdir().expect("tempdir");
	let outside = tempfile::tempdir().expect("outside");
	write_text(&outside.path().join("secret.txt"), "secret");
	std::os::unix::fs::symlink(outside.path(), root.path().join("door")).expect("symlink");
	let mut client = RpcClient::spawn(root.path());
	assert_eq!(client.fail("read", json!({ "path": "door/secret.txt" })), "PATH_VIOLATION");
	assert_eq!(client.fail("stat", json!({ "path": "door" })), "PATH_VIOLATION");
}

#[test]
fn search_filters_by_extension_and_caps_results() {
	let root = tempfile::tempdir().expect("tempdir");
	for name in ["a.txt", "b.txt", "nested/c.txt", "nested/deeper/d.txt", "e.txt"] {
		write_text(&root.path().join(name), "hello");
	}
	write_text(&root.path().join("notes.md"), "hello");
	write_text(&root.path().join("nested/archive.txt.gz"), "hello");
	let mut client = RpcClient::spawn(root.path());
	let found = client.ok("search", json!({ "extension": ".txt" }));
	let paths: Vec<&str> = found["matches"]
		.as_array()
		.expect("matches")
		.iter()
		.filter_map(|entry| entry["path"].as_str())
		.collect();
	assert_eq!(paths, vec!["a.txt", "b.txt", "e.txt", "nested/c.txt", "nested/deeper/d.txt"]);
	assert_eq!(found["truncated"], false);
	let capped = client.ok("search", json!({ "extension": "txt", "max_results": 2 }));
	assert_eq!(capped["matches"].as_array().expect("matches").len(), 2);
	assert_eq!(capped["truncated"], true);
}

#[test]
fn search_by_content_and_name() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("src/main.rs"), "fn main() { println!(\"needle\"); }");
	write_text(&root.path().join("src/lib.rs"), "pub fn hay() {}");
	write_text(&root.path().join("README.md"), "needle in docs");
	let mut client = RpcClient::spawn(root.path());
	let found = client.ok("search", json!({ "content": "needle", "name_pattern": "*.rs" }));
	assert_eq!(found["count"], 1);
	assert_eq!(found["matches"][0]["path"], "src/main.rs");
	let dirs = client.ok("search", json!({ "kind": "directory" }));
	assert_eq!(dirs["count"], 1);
	assert_eq!(dirs["matches"][0]["path"], "src");
}

#[test]
fn cancel_sent_with_request_reaches_it() {
	let root = tempfile::tempdir().expect("tempdir");
	for index in 0..5000 {
		write_text(&root.path().join(format!("d{:02}/f{:04}.txt", index % 50, index)), "haystack");
	}
	let mut client = RpcClient::spawn(root.path());
	let request = json!({
		"jsonrpc": "2.0",
		"id": 77,
		"method": "tools/call",
		"params": { "name": "search", "arguments": { "content": "needle", "max_results": 0 } }
	});
	let cancel = json!({
		"jsonrpc": "2.0",
		"method": "notifications/cancelled",
		"params": { "requestId": 77 }
	});
	let both = format!("{}\n{}", request, cancel);
	client.send_line(&both);
	let resp = client.read_until(|parsed| parsed.get("id").and_then(Value::as_u64) == Some(77));
	let result = &resp["result"]["structuredContent"];
	assert_eq!(result["cancelled"], true, "{}", resp);
	assert_eq!(result["count"], 0);
	// The id is free again once the cancelled request has answered.
	let found = client.ok("search", json!({ "root": "d00", "extension": "txt" }));
	assert_eq!(found["count"], 100);
}

#[test]
fn bulk_delete_and_stats() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("a.log"), "12345");
	write_text(&root.path().join("b.txt"), "123");
	write_text(&root.path().join("logs/c.log"), "1");
	let mut client = RpcClient::spawn(root.path());
	let stats = client.ok("stats", json!({}));
	assert_eq!(stats["files"], 3);
	assert_eq!(stats["directories"], 1);
	assert_eq!(stats["by_extension"][".log"]["files"], 2);
	assert_eq!(stats["largest"]["path"], "a.log");
	assert_eq!(client.fail("bulk_delete", json!({ "pattern": "*.log" })), "CONFIRMATION_REQUIRED");
	let deleted = client.ok("bulk_delete", json!({ "pattern": "*.log", "confirm": true }));
	assert_eq!(deleted["deleted"], json!(["a.log", "logs/c.log"]));
	assert!(root.path().join("b.txt").exists());
	assert!(root.path().join("logs").is_dir());
}

#[test]
fn copy_move_and_rename() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("proj/src/lib.rs"), "lib");
	write_text(&root.path().join("proj/Cargo.toml"), "toml");
	let mut client = RpcClient::spawn(root.path());
	let copied = client.ok("copy", json!({ "source": "proj", "destination": "proj-copy" }));
	assert_eq!(copied["kind"], "directory");
	assert_eq!(std::fs::read_to_string(root.path().join("proj-copy/src/lib.rs")).expect("read"), "lib");
	assert_eq!(client.fail("copy", json!({ "source": "proj", "destination": "proj/inner" })), "INVALID_REQUEST");
	assert_eq!(client.fail("copy", json!({ "source": "missing", "destination": "other" })), "NOT_FOUND");
	client.ok("move", json!({ "source": "proj-copy", "destination": "archive/proj", "parents": true }));
	assert!(!root.path().join("proj-copy").exists());
	assert!(root.path().join("archive/proj/Cargo.toml").exists());
	let renamed = client.ok("rename", json!({ "source": "archive/proj/Cargo.toml", "destination": "Manifest.toml" }));
	assert_eq!(renamed["destination"], "archive/proj/Manifest.toml");
	write_text(&root.path().join("one.txt"), "one");
	write_text(&root.path().join("two.txt"), "two");
	assert_eq!(client.fail("rename", json!({ "source": "one.txt", "destination": "two.txt" })), "ALREADY_EXISTS");
	assert_eq!(
		client.fail("rename", json!({ "source": "one.txt", "destination": "two.txt", "overwrite": true })),
		"CONFIRMATION_REQUIRED"
	);
	client.ok("rename", json!({ "source": "one.txt", "destination": "two.txt", "overwrite": true, "confirm": true }));
	assert_eq!(std::fs::read_to_string(root.path().join("two.txt")).expect("read"), "one");
}

#[test]
fn stat_compare_backup_and_count_lines() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("left.txt"), "alpha\nbeta\ngamma\n");
	write_text(&root.path().join("right.txt"), "alpha\nBETA\ngamma\n");
	let mut client = RpcClient::spawn(root.path());
	let stat = client.ok("stat", json!({ "path": "left.txt" }));
	assert_eq!(stat["kind"], "file");
	assert_eq!(stat["size_bytes"], 17);
	let compared = client.ok("compare", json!({ "first": "left.txt", "second": "right.txt" }));
	assert_eq!(compared["identical"], false);
	assert_eq!(compared["differences"], 2);
	assert!(compared["diff"].as_str().expect("diff").contains("+BETA"));
	let counted = client.ok("count_lines", json!({ "path": "left.txt" }));
	assert_eq!(counted["lines"], 3);
	let backed = client.ok("backup", json!({ "path": "left.txt" }));
	let backup = backed["backup"].as_str().expect("backup");
	assert!(backup.starts_with("left.backup."));
	assert!(backup.ends_with(".txt"));
	assert_eq!(std::fs::read_to_string(root.path().join(backup)).expect("read"), "alpha\nbeta\ngamma\n");
	assert_eq!(client.fail("count_lines", json!({ "path": "." })), "NOT_A_FILE");
}

#[test]
fn invalid_calls_are_reported() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	assert_eq!(client.fail("format_disk", json!({})), "INVALID_REQUEST");
	assert_eq!(client.fail("read", json!({})), "INVALID_REQUEST");
	assert_eq!(client.fail("read", json!({ "path": "a", "encoding": "utf-16" })), "INVALID_REQUEST");
	assert_eq!(client.fail("read", json!({ "path": "ghost.txt" })), "NOT_FOUND");
	let resp = client.send("resources/list", json!({}));
	assert_eq!(resp["error"]["code"], -32601);
	let resp = client.send("tools/call", json!({ "arguments": {} }));
	assert_eq!(resp["error"]["code"], -32602);
	client.send_line("{this is not json");
	let resp = client.read_until(|parsed| parsed.get("error").is_some() && parsed["id"].is_null());
	assert_eq!(resp["error"]["code"], -32700);
	let resp = client.send("ping", json!({}));
	assert_eq!(resp["result"], json!({}));
}

#[test]
fn oversized_read_is_too_large() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("big.bin"), &"x".repeat(4096));
	let bin = env!("CARGO_BIN_EXE_mcp-filehandler");
	let mut child = Command::new(bin)
		.arg("--root")
		.arg(root.path())
		.arg("--read-max-bytes")
		.arg("1024")
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::null())
		.spawn()
		.expect("spawn mcp-filehandler");
	let mut stdin = child.stdin.take().expect("stdin");
	let stdout = child.stdout.take().expect("stdout");
	let req = json!({
		"jsonrpc": "2.0",
		"id": 1,
		"method": "tools/call",
		"params": { "name": "read", "arguments": { "path": "big.bin" } }
	});
	writeln!(stdin, "{}", req).expect("write request");
	drop(stdin);
	let mut line = String::new();
	BufReader::new(stdout).read_line(&mut line).expect("read response");
	let resp: Value = serde_json::from_str(line.trim()).expect("json");
	assert_eq!(resp["result"]["structuredContent"]["kind"], "TOO_LARGE");
	let status = child.wait().expect("wait");
	assert!(status.success());
}
