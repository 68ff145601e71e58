use crate::error::{ErrorKind, OperationError};
use crate::resolver::ResolvedPath;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::Metadata;
use std::time::SystemTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
	File,
	Directory,
	Symlink,
	Other,
}

impl EntryKind {
	pub fn of(meta: &Metadata) -> Self {
		let ftype = meta.file_type();
		if ftype.is_symlink() {
			EntryKind::Symlink
		}
		else if ftype.is_dir() {
			EntryKind::Directory
		}
		else if ftype.is_file() {
			EntryKind::File
		}
		else {
			EntryKind::Other
		}
	}
}

/// Snapshot of one entry, taken at call time and never reused.
#[derive(Clone, Debug, Serialize)]
pub struct FileMetadata {
	pub path: String,
	pub name: String,
	pub kind: EntryKind,
	pub size_bytes: u64,
	pub created_at: Option<String>,
	pub modified_at: Option<String>,
	pub permissions: String,
	pub readonly: bool,
}

impl FileMetadata {
	pub fn from_metadata(path: impl Into<String>, meta: &Metadata) -> Self {
		let path = path.into();
		let name = path.rsplit('/')
			.next()
			.unwrap_or_default()
			.to_string();
		Self {
			path,
			name,
			kind: EntryKind::of(meta),
			size_bytes: meta.len(),
			created_at: meta.created().ok().map(format_time),
			modified_at: meta.modified().ok().map(format_time),
			permissions: permissions_summary(meta),
			readonly: meta.permissions().readonly(),
		}
	}
}

/// Describes the entry itself; symlinks are reported, not followed.
pub async fn describe(path: &ResolvedPath) -> Result<FileMetadata, OperationError> {
	let meta = tokio::fs::symlink_metadata(path.absolute())
		.await
		.map_err(|err| stat_error(path, &err))?;
	Ok(FileMetadata::from_metadata(path.display(), &meta))
}

fn stat_error(path: &ResolvedPath, err: &std::io::Error) -> OperationError {
	if err.kind() == std::io::ErrorKind::NotFound {
		return OperationError::at(ErrorKind::NotFound, path.display(), format!("not found: {}", path.display()));
	}
	OperationError::io("stat", path.display(), err)
}

fn format_time(time: SystemTime) -> String {
	DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(unix)]
fn permissions_summary(meta: &Metadata) -> String {
	use std::os::unix::fs::PermissionsExt;
	let mode = meta.permissions().mode();
	let mut out = String::with_capacity(9);
	for shift in [6u32, 3, 0] {
		let bits = (mode >> shift) & 0o7;
		out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
		out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
		out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
	}
	out
}

#[cfg(not(unix))]
fn permissions_summary(meta: &Metadata) -> String {
	if meta.permissions().readonly() {
		"read-only".to_string()
	}
	else {
		"read-write".to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::resolver::Sandbox;

	#[tokio::test]
	async fn describes_files_and_directories() {
		let dir = tempfile::tempdir().expect("tempdir");
		let sandbox = Sandbox::new(dir.path()).expect("sandbox");
		std::fs::write(dir.path().join("note.txt"), "hello").expect("write");
		std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
		let file = describe(&sandbox.resolve("note.txt").expect("resolve")).await.expect("describe");
		assert_eq!(file.kind, EntryKind::File);
		assert_eq!(file.size_bytes, 5);
		assert_eq!(file.path, "note.txt");
		assert_eq!(file.name, "note.txt");
		assert!(file.modified_at.is_some());
		let sub = describe(&sandbox.resolve("sub").expect("resolve")).await.expect("describe");
		assert_eq!(sub.kind, EntryKind::Directory);
	}

	#[tokio::test]
	async fn missing_entry_is_not_found() {
		let dir = tempfile::tempdir().expect("tempdir");
		let sandbox = Sandbox::new(dir.path()).expect("sandbox");
		let err = describe(&sandbox.resolve("ghost").expect("resolve")).await.unwrap_err();
		assert_eq!(err.kind, ErrorKind::NotFound);
	}

	#[cfg(unix)]
	#[test]
	fn permission_summary_uses_rwx() {
		use std::os::unix::fs::PermissionsExt;
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("mode.txt");
		std::fs::write(&path, "").expect("write");
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).expect("chmod");
		let meta = std::fs::metadata(&path).expect("meta");
		assert_eq!(permissions_summary(&meta), "rw-r-----");
	}
}
