use crate::error::{ErrorKind, OperationError};
use anyhow::{anyhow, Result};
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// The single directory tree every operation is confined to.
#[derive(Clone, Debug)]
pub struct Sandbox {
	root: PathBuf,
}

/// A path proven to lie inside the sandbox root.
///
/// Only [`Sandbox::resolve`] and [`ResolvedPath::sibling`] construct one, so an
/// executor holding a `ResolvedPath` never sees a raw caller string.
#[derive(Clone, Debug)]
pub struct ResolvedPath {
	absolute: PathBuf,
	display: String,
}

impl Sandbox {
	pub fn new(root: &Path) -> Result<Self> {
		let canonical = root
			.canonicalize()
			.map_err(|err| anyhow!("root {}: {}", root.display(), err))?;
		if !canonical.is_dir() {
			return Err(anyhow!("root {} is not a directory", root.display()));
		}
		Ok(Self {
			root: canonical
		})
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Resolves `raw` against the root, following symlinks in every ancestor.
	///
	/// A final component that is itself a symlink is not followed, but its
	/// target must also stay inside the root.
	pub fn resolve(&self, raw: &str) -> std::result::Result<ResolvedPath, OperationError> {
		if raw.trim().is_empty() {
			return Err(self.violation(raw, "path is empty"));
		}
		if raw.contains('\0') {
			return Err(self.violation(raw, "path contains invalid characters"));
		}
		let raw_path = Path::new(raw);
		let candidate = if raw_path.is_absolute() {
			raw_path.to_path_buf()
		}
		else {
			self.root.join(raw_path)
		};
		let normalized = normalize_path(&candidate);
		if !normalized.starts_with(&self.root) {
			return Err(self.violation(raw, "path escapes sandbox root"));
		}
		if normalized == self.root {
			return Ok(ResolvedPath {
				absolute: self.root.clone(),
				display: ".".to_string()
			});
		}
		let (Some(parent), Some(name)) = (normalized.parent(), normalized.file_name()) else {
			return Err(self.violation(raw, "path cannot be normalized"));
		};
		let parent = self.canonicalize_prefix(raw, parent)?;
		if !parent.starts_with(&self.root) {
			return Err(self.violation(raw, "path escapes sandbox root"));
		}
		let absolute = parent.join(name);
		self.check_link_target(raw, &absolute)?;
		Ok(ResolvedPath {
			display: self.relative(&absolute),
			absolute,
		})
	}

	/// Display form of `path` relative to the root; `.` for the root itself.
	fn relative(&self, path: &Path) -> String {
		match path.strip_prefix(&self.root) {
			Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
			Ok(rel) => rel.to_string_lossy().to_string(),
			Err(_) => path.to_string_lossy().to_string(),
		}
	}

	fn canonicalize_prefix(&self, raw: &str, path: &Path) -> std::result::Result<PathBuf, OperationError> {
		let mut existing = path.to_path_buf();
		let mut missing: Vec<OsString> = Vec::new();
		let canonical = loop {
			match existing.canonicalize() {
				Ok(canonical) => break canonical,
				Err(err) if is_missing(&err) => {
					if std::fs::symlink_metadata(&existing).is_ok() {
						return Err(self.violation(raw, "path traverses a dangling symlink"));
					}
					let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
						return Err(self.violation(raw, "path cannot be normalized"));
					};
					missing.push(name.to_os_string());
					existing = parent.to_path_buf();
				}
				Err(err) => return Err(OperationError::io("resolve", raw, &err)),
			}
		};
		let mut out = canonical;
		for part in missing.into_iter().rev() {
			out.push(part);
		}
		Ok(out)
	}

	fn check_link_target(&self, raw: &str, absolute: &Path) -> std::result::Result<(), OperationError> {
		let Ok(meta) = std::fs::symlink_metadata(absolute) else {
			return Ok(());
		};
		if !meta.file_type().is_symlink() {
			return Ok(());
		}
		let target = match absolute.canonicalize() {
			Ok(target) => target,
			Err(_) => {
				let link = std::fs::read_link(absolute).map_err(|err| OperationError::io("resolve", raw, &err))?;
				let base = absolute.parent().unwrap_or(&self.root);
				normalize_path(&base.join(link))
			}
		};
		if !target.starts_with(&self.root) {
			return Err(self.violation(raw, "symlink target escapes sandbox root"));
		}
		Ok(())
	}

	fn violation(&self, raw: &str, reason: &str) -> OperationError {
		warn!(path = %raw, reason, "rejected path outside sandbox");
		OperationError::at(ErrorKind::PathViolation, raw, format!("{}: {}", reason, raw))
	}
}

impl ResolvedPath {
	pub fn absolute(&self) -> &Path {
		&self.absolute
	}

	pub fn display(&self) -> &str {
		&self.display
	}

	pub fn is_root(&self) -> bool {
		self.display == "."
	}

	/// Same directory, different final component.
	pub fn sibling(&self, name: &OsStr) -> ResolvedPath {
		let absolute = self.absolute.with_file_name(name);
		let display = match Path::new(&self.display).parent() {
			Some(parent) if !parent.as_os_str().is_empty() => format!("{}/{}", parent.to_string_lossy(), name.to_string_lossy()),
			_ => name.to_string_lossy().to_string(),
		};
		ResolvedPath {
			absolute,
			display
		}
	}

	/// Display form of a path found by walking below this one.
	pub fn display_of(&self, descendant: &Path) -> String {
		let Ok(rel) = descendant.strip_prefix(&self.absolute) else {
			return descendant.to_string_lossy().to_string();
		};
		if rel.as_os_str().is_empty() {
			return self.display.clone();
		}
		if self.is_root() {
			return rel.to_string_lossy().to_string();
		}
		format!("{}/{}", self.display, rel.to_string_lossy())
	}
}

fn is_missing(err: &io::Error) -> bool {
	matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory)
}

/// Collapses `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
	let mut stack: Vec<OsString> = Vec::new();
	let mut prefix: Option<OsString> = None;
	let mut absolute = false;
	for component in path.components() {
		match component {
			Component::Prefix(prefix_component) => {
				prefix = Some(prefix_component.as_os_str().to_os_string());
			}
			Component::RootDir => {
				absolute = true;
				stack.clear();
			}
			Component::CurDir => {}
			Component::ParentDir => {
				if stack.last().map(|part| part != "..").unwrap_or(false) {
					stack.pop();
				}
				else if !absolute {
					stack.push(OsString::from(".."));
				}
			}
			Component::Normal(part) => stack.push(part.to_os_string()),
		}
	}
	let mut out = PathBuf::new();
	if let Some(prefix) = prefix {
		out.push(prefix);
	}
	if absolute {
		out.push(Path::new("/"));
	}
	for part in stack {
		out.push(part);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sandbox() -> (tempfile::TempDir, Sandbox) {
		let dir = tempfile::tempdir().expect("tempdir");
		let sandbox = Sandbox::new(dir.path()).expect("sandbox");
		(dir, sandbox)
	}

	#[test]
	fn normalize_collapses_dots() {
		assert_eq!(normalize_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
		assert_eq!(normalize_path(Path::new("/../..")), PathBuf::from("/"));
		assert_eq!(normalize_path(Path::new("../../x")), PathBuf::from("../../x"));
		assert_eq!(normalize_path(Path::new("a/../../x")), PathBuf::from("../x"));
	}

	#[test]
	fn resolves_inside_or_rejects() {
		let (_dir, sandbox) = sandbox();
		std::fs::create_dir_all(sandbox.root().join("a/b")).expect("mkdir");
		let inputs = [
			".", "a", "a/b", "a/b/../..", "a/../a/b/new.txt", "./x/y/z", "../", "a/../../etc",
			"/etc/passwd", "a/b/../../../..", "..\\..", "nested/../../../x"
		];
		for raw in inputs {
			match sandbox.resolve(raw) {
				Ok(resolved) => assert!(
					resolved.absolute().starts_with(sandbox.root()),
					"{} resolved outside root",
					raw
				),
				Err(err) => assert_eq!(err.kind, ErrorKind::PathViolation, "{}", raw),
			}
		}
	}

	#[test]
	fn traversal_is_a_violation() {
		let (_dir, sandbox) = sandbox();
		for raw in ["..", "../sibling", "a/../../b", "/"] {
			let err = sandbox.resolve(raw).expect_err(raw);
			assert_eq!(err.kind, ErrorKind::PathViolation);
			assert_eq!(err.path.as_deref(), Some(raw));
		}
	}

	#[test]
	fn empty_and_nul_paths_are_violations() {
		let (_dir, sandbox) = sandbox();
		assert_eq!(sandbox.resolve("").unwrap_err().kind, ErrorKind::PathViolation);
		assert_eq!(sandbox.resolve("   ").unwrap_err().kind, ErrorKind::PathViolation);
		assert_eq!(sandbox.resolve("a\0b").unwrap_err().kind, ErrorKind::PathViolation);
	}

	#[test]
	fn absolute_path_inside_root_is_accepted() {
		let (_dir, sandbox) = sandbox();
		let raw = sandbox.root().join("file.txt");
		let resolved = sandbox.resolve(&raw.to_string_lossy()).expect("resolve");
		assert_eq!(resolved.display(), "file.txt");
		let root = sandbox.resolve(&sandbox.root().to_string_lossy()).expect("root");
		assert!(root.is_root());
	}

	#[test]
	fn missing_components_are_appended() {
		let (_dir, sandbox) = sandbox();
		let resolved = sandbox.resolve("x/y/z.txt").expect("resolve");
		assert_eq!(resolved.absolute(), sandbox.root().join("x/y/z.txt"));
		assert_eq!(resolved.display(), "x/y/z.txt");
	}

	#[cfg(unix)]
	#[test]
	fn symlink_escapes_are_rejected() {
		let outside = tempfile::tempdir().expect("outside");
		let (_dir, sandbox) = sandbox();
		std::os::unix::fs::symlink(outside.path(), sandbox.root().join("out")).expect("symlink");
		std::os::unix::fs::symlink("/nonexistent/target", sandbox.root().join("dangling")).expect("symlink");
		assert_eq!(sandbox.resolve("out").unwrap_err().kind, ErrorKind::PathViolation);
		assert_eq!(sandbox.resolve("out/file.txt").unwrap_err().kind, ErrorKind::PathViolation);
		assert_eq!(sandbox.resolve("dangling").unwrap_err().kind, ErrorKind::PathViolation);
		assert_eq!(sandbox.resolve("dangling/x").unwrap_err().kind, ErrorKind::PathViolation);
	}

	#[cfg(unix)]
	#[test]
	fn internal_symlink_names_the_link() {
		let (_dir, sandbox) = sandbox();
		std::fs::create_dir(sandbox.root().join("real")).expect("mkdir");
		std::os::unix::fs::symlink(sandbox.root().join("real"), sandbox.root().join("alias")).expect("symlink");
		let link = sandbox.resolve("alias").expect("link");
		assert_eq!(link.absolute(), sandbox.root().join("alias"));
		let through = sandbox.resolve("alias/inner.txt").expect("through");
		assert_eq!(through.absolute(), sandbox.root().join("real/inner.txt"));
	}
}
