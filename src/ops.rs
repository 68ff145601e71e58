use crate::config::Limits;
use crate::error::{is_cross_device, ErrorKind, OperationError};
use crate::metadata::{self, EntryKind, FileMetadata};
use crate::resolver::ResolvedPath;
use crate::search::{self, Search, SearchCriteria, SearchOutcome};
use filetime::{set_file_times, FileTime};
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type OpResult<T> = Result<T, OperationError>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
	#[default]
	Overwrite,
	Append,
	Prepend,
}

/// Entry counts for operations that touch more than one entry.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Progress {
	pub done: u64,
	pub skipped: u64,
	pub cancelled: bool,
}

impl Progress {
	fn merge(&mut self, other: Progress) {
		self.done += other.done;
		self.skipped += other.skipped;
		self.cancelled |= other.cancelled;
	}
}

#[derive(Debug, Serialize)]
pub struct Created {
	pub path: String,
	pub bytes_written: usize,
	pub overwritten: bool,
}

#[derive(Debug, Serialize)]
pub struct ReadOutput {
	pub path: String,
	pub content: String,
	pub size_bytes: u64,
	pub lossy: bool,
}

#[derive(Debug, Serialize)]
pub struct Written {
	pub path: String,
	pub mode: WriteMode,
	pub created: bool,
	pub bytes_written: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub diff: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
	pub path: String,
	pub kind: EntryKind,
	pub removed: u64,
	pub skipped: u64,
	pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct Copied {
	pub source: String,
	pub destination: String,
	pub kind: EntryKind,
	pub copied: u64,
	pub skipped: u64,
	pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct Moved {
	pub source: String,
	pub destination: String,
	pub kind: EntryKind,
	pub replaced: bool,
}

#[derive(Debug, Serialize)]
pub struct Listing {
	pub path: String,
	pub entries: Vec<FileMetadata>,
	pub count: usize,
	pub truncated: bool,
	pub skipped: usize,
	pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct BulkDeleted {
	pub path: String,
	pub deleted: Vec<String>,
	pub removed: u64,
	pub skipped: u64,
	pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct SizedEntry {
	pub path: String,
	pub size_bytes: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct ExtensionStats {
	pub files: u64,
	pub size_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct DirectoryStats {
	pub path: String,
	pub files: u64,
	pub directories: u64,
	pub symlinks: u64,
	pub total_size_bytes: u64,
	pub average_size_bytes: u64,
	pub largest: Option<SizedEntry>,
	pub smallest: Option<SizedEntry>,
	pub by_extension: BTreeMap<String, ExtensionStats>,
	pub skipped: usize,
	pub cancelled: bool,
}

impl DirectoryStats {
	fn new(path: &str) -> Self {
		Self {
			path: path.to_string(),
			files: 0,
			directories: 0,
			symlinks: 0,
			total_size_bytes: 0,
			average_size_bytes: 0,
			largest: None,
			smallest: None,
			by_extension: BTreeMap::new(),
			skipped: 0,
			cancelled: false
		}
	}

	fn record(&mut self, item: FileMetadata) {
		match item.kind {
			EntryKind::Directory => self.directories += 1,
			EntryKind::Symlink => self.symlinks += 1,
			EntryKind::File => {
				let size = item.size_bytes;
				self.files += 1;
				self.total_size_bytes += size;
				let extension = Path::new(&item.name)
					.extension()
					.map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
					.unwrap_or_default();
				let bucket = self.by_extension.entry(extension).or_default();
				bucket.files += 1;
				bucket.size_bytes += size;
				if self.largest.as_ref().map(|entry| size > entry.size_bytes).unwrap_or(true) {
					self.largest = Some(SizedEntry {
						path: item.path.clone(),
						size_bytes: size
					});
				}
				if self.smallest.as_ref().map(|entry| size < entry.size_bytes).unwrap_or(true) {
					self.smallest = Some(SizedEntry {
						path: item.path,
						size_bytes: size
					});
				}
			}
			_ => {}
		}
	}

	fn finish(mut self) -> Self {
		if self.files > 0 {
			self.average_size_bytes = self.total_size_bytes / self.files;
		}
		self
	}
}

#[derive(Debug, Serialize)]
pub struct DirectoryCreated {
	pub path: String,
	pub created: bool,
}

#[derive(Debug, Serialize)]
pub struct Comparison {
	pub first: String,
	pub second: String,
	pub identical: bool,
	pub differences: usize,
	pub diff: String,
}

#[derive(Debug, Serialize)]
pub struct BackedUp {
	pub path: String,
	pub backup: String,
}

#[derive(Debug, Serialize)]
pub struct LineCount {
	pub path: String,
	pub lines: usize,
}

pub async fn create(path: &ResolvedPath, content: &str, overwrite: bool, parents: bool) -> OpResult<Created> {
	ensure_parent(path, parents).await?;
	if overwrite {
		let existed = match fs::symlink_metadata(path.absolute()).await {
			Ok(meta) if meta.is_dir() => return Err(not_a_file(path)),
			Ok(_) => true,
			Err(_) => false,
		};
		atomic_write(path.absolute(), content.as_bytes())
			.await
			.map_err(|err| OperationError::io("create", path.display(), &err))?;
		return Ok(Created {
			path: path.display().to_string(),
			bytes_written: content.len(),
			overwritten: existed
		});
	}
	create_exclusive(path.absolute(), content.as_bytes())
		.await
		.map_err(|err| OperationError::io("create", path.display(), &err))?;
	Ok(Created {
		path: path.display().to_string(),
		bytes_written: content.len(),
		overwritten: false
	})
}

/// Publishes a fully written temp file under `path` with a hard link, which
/// fails if `path` already exists. Filesystems without hard links fall back
/// to an exclusive in-place write that is removed again on failure.
async fn create_exclusive(path: &Path, bytes: &[u8]) -> io::Result<()> {
	let temp = temp_sibling(path);
	let linked = match write_synced(&temp, bytes).await {
		Ok(()) => fs::hard_link(&temp, path).await,
		Err(err) => Err(err),
	};
	let _ = fs::remove_file(&temp).await;
	match linked {
		Err(err) if matches!(err.kind(), io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied) => {
			debug!(path = %path.display(), error = %err, "hard link unavailable; writing in place");
			write_new_in_place(path, bytes).await
		}
		other => other,
	}
}

async fn write_new_in_place(path: &Path, bytes: &[u8]) -> io::Result<()> {
	let mut file = fs::OpenOptions::new()
		.write(true)
		.create_new(true)
		.open(path)
		.await?;
	let written = match file.write_all(bytes).await {
		Ok(()) => file.sync_all().await,
		Err(err) => Err(err),
	};
	drop(file);
	if written.is_err() {
		let _ = fs::remove_file(path).await;
	}
	written
}

pub async fn read(path: &ResolvedPath, limits: &Limits) -> OpResult<ReadOutput> {
	let bytes = read_bounded(path, limits).await?;
	let size_bytes = bytes.len() as u64;
	let (content, lossy) = match String::from_utf8(bytes) {
		Ok(text) => (text, false),
		Err(err) => (String::from_utf8_lossy(err.as_bytes()).into_owned(), true),
	};
	Ok(ReadOutput {
		path: path.display().to_string(),
		content,
		size_bytes,
		lossy
	})
}

/// Writes land on the target of a final-component symlink; the link itself
/// is left in place.
pub async fn write(path: &ResolvedPath, content: &str, mode: WriteMode, parents: bool, limits: &Limits) -> OpResult<Written> {
	ensure_parent(path, parents).await?;
	let target = write_target(path).await?;
	let existing = match fs::metadata(&target).await {
		Ok(meta) if meta.is_dir() => return Err(not_a_file(path)),
		Ok(meta) => Some(meta.len()),
		Err(err) if err.kind() == io::ErrorKind::NotFound => None,
		Err(err) => return Err(OperationError::io("write", path.display(), &err)),
	};
	let diffable = existing.map(|size| limits.within_read_limit(size)).unwrap_or(true);
	// A large file being overwritten is never loaded.
	let before = match existing {
		Some(_) if mode != WriteMode::Overwrite || diffable => fs::read(&target)
			.await
			.map_err(|err| OperationError::io("read", path.display(), &err))?,
		_ => Vec::new(),
	};
	let next = compose(&before, content.as_bytes(), mode);
	let diff = if diffable && limits.within_read_limit(next.len() as u64) {
		Some(make_diff(&String::from_utf8_lossy(&before), &String::from_utf8_lossy(&next), path.display()))
	}
	else {
		None
	};
	atomic_write(&target, &next)
		.await
		.map_err(|err| OperationError::io("write", path.display(), &err))?;
	Ok(Written {
		path: path.display().to_string(),
		mode,
		created: existing.is_none(),
		bytes_written: next.len(),
		diff
	})
}

async fn write_target(path: &ResolvedPath) -> OpResult<PathBuf> {
	match fs::symlink_metadata(path.absolute()).await {
		Ok(meta) if meta.file_type().is_symlink() => fs::canonicalize(path.absolute())
			.await
			.map_err(|err| OperationError::io("write", path.display(), &err)),
		_ => Ok(path.absolute().to_path_buf()),
	}
}

fn compose(existing: &[u8], content: &[u8], mode: WriteMode) -> Vec<u8> {
	let (first, second) = match mode {
		WriteMode::Overwrite => return content.to_vec(),
		WriteMode::Append => (existing, content),
		WriteMode::Prepend => (content, existing),
	};
	let mut out = Vec::with_capacity(first.len() + second.len() + 1);
	out.extend_from_slice(first);
	if !first.is_empty() && !second.is_empty() && !first.ends_with(b"\n") {
		out.push(b'\n');
	}
	out.extend_from_slice(second);
	out
}

pub async fn delete(path: &ResolvedPath, recursive: bool, cancel: &CancellationToken) -> OpResult<Deleted> {
	if path.is_root() {
		return Err(OperationError::at(ErrorKind::InvalidRequest, path.display(), "cannot delete root"));
	}
	let meta = fs::symlink_metadata(path.absolute())
		.await
		.map_err(|err| OperationError::io("delete", path.display(), &err))?;
	let kind = EntryKind::of(&meta);
	let deleted = |progress: Progress| Deleted {
		path: path.display().to_string(),
		kind,
		removed: progress.done,
		skipped: progress.skipped,
		cancelled: progress.cancelled
	};
	if kind != EntryKind::Directory {
		fs::remove_file(path.absolute())
			.await
			.map_err(|err| OperationError::io("delete", path.display(), &err))?;
		return Ok(deleted(Progress {
			done: 1,
			..Progress::default()
		}));
	}
	if !recursive {
		return match fs::remove_dir(path.absolute()).await {
			Ok(()) => Ok(deleted(Progress {
				done: 1,
				..Progress::default()
			})),
			Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => Err(
				OperationError::at(
					ErrorKind::NotEmpty,
					path.display(),
					format!("directory not empty: {} (set recursive to delete its contents)", path.display())
				)
			),
			Err(err) => Err(OperationError::io("delete", path.display(), &err)),
		};
	}
	let mut progress = remove_contents(path.absolute().to_path_buf(), cancel.clone()).await;
	if progress.cancelled {
		return Ok(deleted(progress));
	}
	fs::remove_dir(path.absolute())
		.await
		.map_err(|err| OperationError::io("delete", path.display(), &err).with_completed(progress.done))?;
	progress.done += 1;
	Ok(deleted(progress))
}

/// Removes everything below `dir` depth-first, soft-skipping failures.
/// Symlinks are removed, never followed.
fn remove_contents(dir: PathBuf, cancel: CancellationToken) -> Pin<Box<dyn Future<Output = Progress> + Send>> {
	Box::pin(
		async move {
			let mut progress = Progress::default();
			let entries = match sorted_entries(&dir).await {
				Ok(entries) => entries,
				Err(err) => {
					warn!(path = %dir.display(), error = %err, "cannot read directory during delete");
					progress.skipped += 1;
					return progress;
				}
			};
			for name in entries {
				if cancel.is_cancelled() {
					progress.cancelled = true;
					break;
				}
				let child = dir.join(&name);
				let is_dir = match fs::symlink_metadata(&child).await {
					Ok(meta) => meta.is_dir(),
					Err(_) => {
						progress.skipped += 1;
						continue;
					}
				};
				let removed = if is_dir {
					progress.merge(remove_contents(child.clone(), cancel.clone()).await);
					if progress.cancelled {
						break;
					}
					fs::remove_dir(&child).await
				}
				else {
					fs::remove_file(&child).await
				};
				match removed {
					Ok(()) => progress.done += 1,
					Err(err) => {
						warn!(path = %child.display(), error = %err, "delete skipped entry");
						progress.skipped += 1;
					}
				}
			}
			progress
		}
	)
}

pub async fn copy(
	source: &ResolvedPath,
	destination: &ResolvedPath,
	overwrite: bool,
	parents: bool,
	cancel: &CancellationToken) -> OpResult<Copied> {
	let meta = fs::metadata(source.absolute())
		.await
		.map_err(|err| OperationError::io("copy", source.display(), &err))?;
	let kind = EntryKind::of(&meta);
	if source.absolute() == destination.absolute() {
		return Err(OperationError::at(ErrorKind::InvalidRequest, destination.display(), "source and destination are the same"));
	}
	if kind == EntryKind::Directory && destination.absolute().starts_with(source.absolute()) {
		return Err(OperationError::at(ErrorKind::InvalidRequest, destination.display(), "cannot copy a directory into itself"));
	}
	check_destination(destination, kind, overwrite).await?;
	ensure_parent(destination, parents).await?;
	let copied = |progress: Progress| Copied {
		source: source.display().to_string(),
		destination: destination.display().to_string(),
		kind,
		copied: progress.done,
		skipped: progress.skipped,
		cancelled: progress.cancelled
	};
	match kind {
		EntryKind::Directory => {
			match fs::create_dir(destination.absolute()).await {
				Ok(()) => {}
				Err(err) if err.kind() == io::ErrorKind::AlreadyExists && overwrite => {}
				Err(err) => return Err(OperationError::io("copy", destination.display(), &err)),
			}
			let mut progress = copy_contents(
				source.absolute().to_path_buf(),
				destination.absolute().to_path_buf(),
				cancel.clone()
			).await;
			copy_meta(source.absolute(), destination.absolute())
				.await
				.map_err(|err| OperationError::io("copy", destination.display(), &err).with_completed(progress.done))?;
			progress.done += 1;
			Ok(copied(progress))
		}
		EntryKind::File => {
			copy_file_with_meta(source.absolute(), destination.absolute())
				.await
				.map_err(|err| OperationError::io("copy", destination.display(), &err))?;
			Ok(copied(Progress {
				done: 1,
				..Progress::default()
			}))
		}
		_ => Err(not_a_file(source)),
	}
}

async fn check_destination(destination: &ResolvedPath, kind: EntryKind, overwrite: bool) -> OpResult<bool> {
	let existing = match fs::symlink_metadata(destination.absolute()).await {
		Ok(meta) => EntryKind::of(&meta),
		Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
		Err(err) => return Err(OperationError::io("stat", destination.display(), &err)),
	};
	if !overwrite {
		return Err(OperationError::at(
			ErrorKind::AlreadyExists,
			destination.display(),
			format!("destination exists: {}", destination.display())
		));
	}
	if existing != kind {
		return Err(OperationError::at(
			ErrorKind::AlreadyExists,
			destination.display(),
			format!("destination exists with a different kind: {}", destination.display())
		));
	}
	Ok(true)
}

/// Copies the entries of `from` into the existing directory `to`.
/// Symlinks and unreadable entries are soft-skipped.
fn copy_contents(from: PathBuf, to: PathBuf, cancel: CancellationToken) -> Pin<Box<dyn Future<Output = Progress> + Send>> {
	Box::pin(
		async move {
			let mut progress = Progress::default();
			let entries = match sorted_entries(&from).await {
				Ok(entries) => entries,
				Err(err) => {
					warn!(path = %from.display(), error = %err, "cannot read directory during copy");
					progress.skipped += 1;
					return progress;
				}
			};
			for name in entries {
				if cancel.is_cancelled() {
					progress.cancelled = true;
					break;
				}
				let src = from.join(&name);
				let dst = to.join(&name);
				let kind = match fs::symlink_metadata(&src).await {
					Ok(meta) => EntryKind::of(&meta),
					Err(_) => {
						progress.skipped += 1;
						continue;
					}
				};
				let result = match kind {
					EntryKind::Directory => {
						match fs::create_dir(&dst).await {
							Ok(()) => {}
							Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
							Err(err) => {
								warn!(path = %dst.display(), error = %err, "copy skipped directory");
								progress.skipped += 1;
								continue;
							}
						}
						progress.merge(copy_contents(src.clone(), dst.clone(), cancel.clone()).await);
						if progress.cancelled {
							break;
						}
						copy_meta(&src, &dst).await
					}
					EntryKind::File => copy_file_with_meta(&src, &dst).await,
					_ => {
						debug!(path = %src.display(), "copy skipped non-regular entry");
						progress.skipped += 1;
						continue;
					}
				};
				match result {
					Ok(()) => progress.done += 1,
					Err(err) => {
						warn!(path = %src.display(), error = %err, "copy skipped entry");
						progress.skipped += 1;
					}
				}
			}
			progress
		}
	)
}

async fn copy_file_with_meta(from: &Path, to: &Path) -> io::Result<()> {
	fs::copy(from, to).await?;
	copy_meta(from, to).await
}

async fn copy_meta(from: &Path, to: &Path) -> io::Result<()> {
	let meta = fs::metadata(from).await?;
	fs::set_permissions(to, meta.permissions()).await?;
	let atime = FileTime::from_last_access_time(&meta);
	let mtime = FileTime::from_last_modification_time(&meta);
	set_file_times(to, atime, mtime)
}

/// Relocates an entry. A same-filesystem rename is tried first; across
/// devices the entry is copied then removed.
pub async fn relocate(source: &ResolvedPath, destination: &ResolvedPath, overwrite: bool, parents: bool) -> OpResult<Moved> {
	if source.is_root() {
		return Err(OperationError::at(ErrorKind::InvalidRequest, source.display(), "cannot move root"));
	}
	let meta = fs::symlink_metadata(source.absolute())
		.await
		.map_err(|err| OperationError::io("move", source.display(), &err))?;
	let kind = EntryKind::of(&meta);
	if source.absolute() == destination.absolute() {
		return Err(OperationError::at(ErrorKind::InvalidRequest, destination.display(), "source and destination are the same"));
	}
	if kind == EntryKind::Directory && destination.absolute().starts_with(source.absolute()) {
		return Err(OperationError::at(ErrorKind::InvalidRequest, destination.display(), "cannot move a directory into itself"));
	}
	let replaced = check_destination(destination, kind, overwrite).await?;
	ensure_parent(destination, parents).await?;
	if replaced && kind == EntryKind::Directory {
		with_directory_aside(destination, move_entry(source, destination, kind)).await?;
	}
	else {
		move_entry(source, destination, kind).await?;
	}
	Ok(Moved {
		source: source.display().to_string(),
		destination: destination.display().to_string(),
		kind,
		replaced
	})
}

async fn move_entry(source: &ResolvedPath, destination: &ResolvedPath, kind: EntryKind) -> OpResult<()> {
	match fs::rename(source.absolute(), destination.absolute()).await {
		Ok(()) => Ok(()),
		Err(err) if is_cross_device(&err) => move_across_devices(source.absolute(), destination.absolute(), kind)
			.await
			.map_err(|err| OperationError::io("move", destination.display(), &err)),
		Err(err) => Err(OperationError::io("move", source.display(), &err)),
	}
}

/// Runs `replace` with the existing directory at `destination` renamed to a
/// hidden sibling. The directory is restored if `replace` fails and removed
/// once it succeeds.
async fn with_directory_aside<F>(destination: &ResolvedPath, replace: F) -> OpResult<()>
where
	F: Future<Output = OpResult<()>>,
{
	let aside = temp_sibling(destination.absolute());
	fs::rename(destination.absolute(), &aside)
		.await
		.map_err(|err| OperationError::io("move", destination.display(), &err))?;
	match replace.await {
		Ok(()) => {
			if let Err(err) = fs::remove_dir_all(&aside).await {
				warn!(path = %aside.display(), error = %err, "replaced directory left behind");
			}
			Ok(())
		}
		Err(err) => {
			if let Err(restore) = fs::rename(&aside, destination.absolute()).await {
				warn!(path = %aside.display(), error = %restore, "could not restore replaced directory");
			}
			Err(err)
		}
	}
}

/// Copies then removes the source. A failed copy removes whatever part of
/// the destination it wrote and leaves the source untouched.
async fn move_across_devices(from: &Path, to: &Path, kind: EntryKind) -> io::Result<()> {
	if kind == EntryKind::Directory {
		fs::create_dir(to).await?;
		let copied = copy_tree_complete(from, to).await;
		if copied.is_err() {
			let _ = fs::remove_dir_all(to).await;
			return copied;
		}
		fs::remove_dir_all(from).await
	}
	else {
		let temp = temp_sibling(to);
		let copied = match copy_file_with_meta(from, &temp).await {
			Ok(()) => fs::rename(&temp, to).await,
			Err(err) => Err(err),
		};
		if copied.is_err() {
			let _ = fs::remove_file(&temp).await;
			return copied;
		}
		fs::remove_file(from).await
	}
}

async fn copy_tree_complete(from: &Path, to: &Path) -> io::Result<()> {
	let progress = copy_contents(from.to_path_buf(), to.to_path_buf(), CancellationToken::new()).await;
	if progress.skipped > 0 {
		return Err(io::Error::new(io::ErrorKind::Other, "incomplete cross-device copy"));
	}
	copy_meta(from, to).await
}

pub async fn list(path: &ResolvedPath, non_recursive: bool, limits: &Limits, cancel: &CancellationToken) -> OpResult<Listing> {
	require_directory("list", path).await?;
	let mut criteria = SearchCriteria::new(path.clone());
	criteria.max_depth = non_recursive.then_some(1);
	criteria.max_results = limits.list_limit;
	let outcome = search::run(criteria, None, cancel.clone()).await?;
	Ok(Listing {
		path: outcome.root,
		count: outcome.summary.count,
		entries: outcome.matches,
		truncated: outcome.summary.truncated,
		skipped: outcome.summary.skipped,
		cancelled: outcome.summary.cancelled
	})
}

pub async fn mkdir(path: &ResolvedPath, parents: bool, exist_ok: bool) -> OpResult<DirectoryCreated> {
	match fs::symlink_metadata(path.absolute()).await {
		Ok(meta) if meta.is_dir() && exist_ok => {
			return Ok(DirectoryCreated {
				path: path.display().to_string(),
				created: false
			});
		}
		Ok(_) => {
			return Err(OperationError::at(
				ErrorKind::AlreadyExists,
				path.display(),
				format!("already exists: {}", path.display())
			));
		}
		Err(_) => {}
	}
	let result = if parents {
		fs::create_dir_all(path.absolute()).await
	}
	else {
		fs::create_dir(path.absolute()).await
	};
	match result {
		Ok(()) => Ok(DirectoryCreated {
			path: path.display().to_string(),
			created: true
		}),
		Err(err) if err.kind() == io::ErrorKind::NotFound => Err(missing_parent(path)),
		Err(err) if err.kind() == io::ErrorKind::AlreadyExists && exist_ok && path.absolute().is_dir() => Ok(DirectoryCreated {
			path: path.display().to_string(),
			created: false
		}),
		Err(err) => Err(OperationError::io("mkdir", path.display(), &err)),
	}
}

pub async fn stat(path: &ResolvedPath) -> OpResult<FileMetadata> {
	metadata::describe(path).await
}

pub async fn search(criteria: SearchCriteria, limits: &Limits, cancel: &CancellationToken) -> OpResult<SearchOutcome> {
	require_directory("search", &criteria.root).await?;
	search::run(criteria, limits.search_content_max_bytes, cancel.clone()).await
}

/// Removes every regular file the criteria select. Failures are soft-skipped
/// and the walk stops at the next entry once cancelled.
pub async fn bulk_delete(criteria: SearchCriteria, cancel: &CancellationToken) -> OpResult<BulkDeleted> {
	require_directory("bulk_delete", &criteria.root).await?;
	let cancel = cancel.clone();
	tokio::task::spawn_blocking(
		move || {
			let path = criteria.root.display().to_string();
			let mut search = Search::new(criteria, None, cancel);
			let mut deleted = Vec::new();
			let mut failed = 0;
			while let Some((absolute, item)) = search.next_match() {
				if item.kind != EntryKind::File {
					continue;
				}
				match std::fs::remove_file(&absolute) {
					Ok(()) => deleted.push(item.path),
					Err(err) => {
						warn!(path = %item.path, error = %err, "bulk delete skipped file");
						failed += 1;
					}
				}
			}
			let summary = search.summary();
			BulkDeleted {
				path,
				removed: deleted.len() as u64,
				deleted,
				skipped: failed + summary.skipped as u64,
				cancelled: summary.cancelled
			}
		}
	)
	.await
	.map_err(|_| OperationError::internal("bulk delete worker failed"))
}

/// Aggregates sizes and kinds over a directory. Extension keys are
/// lowercased with a leading dot; files without one are counted under `""`.
pub async fn stats(path: &ResolvedPath, non_recursive: bool, cancel: &CancellationToken) -> OpResult<DirectoryStats> {
	require_directory("stats", path).await?;
	let mut criteria = SearchCriteria::new(path.clone());
	criteria.max_depth = non_recursive.then_some(1);
	let cancel = cancel.clone();
	tokio::task::spawn_blocking(
		move || {
			let mut stats = DirectoryStats::new(criteria.root.display());
			let mut search = Search::new(criteria, None, cancel);
			for item in search.by_ref() {
				stats.record(item);
			}
			stats.skipped = search.summary().skipped;
			stats.cancelled = search.summary().cancelled;
			stats.finish()
		}
	)
	.await
	.map_err(|_| OperationError::internal("stats worker failed"))
}

pub async fn compare(first: &ResolvedPath, second: &ResolvedPath, limits: &Limits) -> OpResult<Comparison> {
	let left = read(first, limits).await?;
	let right = read(second, limits).await?;
	let diff = TextDiff::from_lines(&left.content, &right.content);
	let differences = diff.iter_all_changes()
		.filter(|change| change.tag() != ChangeTag::Equal)
		.count();
	let unified = diff.unified_diff()
		.context_radius(3)
		.header(&format!("a/{}", first.display()), &format!("b/{}", second.display()))
		.to_string();
	Ok(Comparison {
		first: first.display().to_string(),
		second: second.display().to_string(),
		identical: differences == 0,
		differences,
		diff: unified
	})
}

pub async fn backup(path: &ResolvedPath) -> OpResult<BackedUp> {
	let meta = fs::metadata(path.absolute())
		.await
		.map_err(|err| OperationError::io("backup", path.display(), &err))?;
	if !meta.is_file() {
		return Err(not_a_file(path));
	}
	let name = backup_name(path.absolute(), chrono::Local::now());
	let target = path.sibling(&name);
	if fs::symlink_metadata(target.absolute()).await.is_ok() {
		return Err(OperationError::at(
			ErrorKind::AlreadyExists,
			target.display(),
			format!("backup exists: {}", target.display())
		));
	}
	copy_file_with_meta(path.absolute(), target.absolute())
		.await
		.map_err(|err| OperationError::io("backup", target.display(), &err))?;
	Ok(BackedUp {
		path: path.display().to_string(),
		backup: target.display().to_string()
	})
}

fn backup_name(path: &Path, now: chrono::DateTime<chrono::Local>) -> OsString {
	let stamp = now.format("%Y%m%d-%H%M%S");
	let stem = path.file_stem()
		.map(|stem| stem.to_string_lossy().to_string())
		.unwrap_or_default();
	let name = match path.extension() {
		Some(ext) => format!("{}.backup.{}.{}", stem, stamp, ext.to_string_lossy()),
		None => format!("{}.backup.{}", stem, stamp),
	};
	OsString::from(name)
}

pub async fn count_lines(path: &ResolvedPath, limits: &Limits) -> OpResult<LineCount> {
	let output = read(path, limits).await?;
	Ok(LineCount {
		path: output.path,
		lines: output.content.lines().count()
	})
}

async fn read_bounded(path: &ResolvedPath, limits: &Limits) -> OpResult<Vec<u8>> {
	let meta = fs::metadata(path.absolute())
		.await
		.map_err(|err| OperationError::io("read", path.display(), &err))?;
	if !meta.is_file() {
		return Err(not_a_file(path));
	}
	if !limits.within_read_limit(meta.len()) {
		return Err(OperationError::at(
			ErrorKind::TooLarge,
			path.display(),
			format!(
				"file too large: {} is {} bytes, limit is {}",
				path.display(),
				meta.len(),
				limits.read_max_bytes.unwrap_or(0)
			)
		));
	}
	fs::read(path.absolute())
		.await
		.map_err(|err| OperationError::io("read", path.display(), &err))
}

async fn require_directory(op: &str, path: &ResolvedPath) -> OpResult<()> {
	let meta = fs::metadata(path.absolute())
		.await
		.map_err(|err| OperationError::io(op, path.display(), &err))?;
	if !meta.is_dir() {
		return Err(OperationError::at(
			ErrorKind::NotADirectory,
			path.display(),
			format!("not a directory: {}", path.display())
		));
	}
	Ok(())
}

async fn ensure_parent(path: &ResolvedPath, parents: bool) -> OpResult<()> {
	let Some(parent) = path.absolute().parent() else {
		return Ok(());
	};
	if parents {
		return fs::create_dir_all(parent)
			.await
			.map_err(|err| OperationError::io("mkdir", path.display(), &err));
	}
	match fs::metadata(parent).await {
		Ok(meta) if meta.is_dir() => Ok(()),
		Ok(_) => Err(OperationError::at(
			ErrorKind::NotADirectory,
			path.display(),
			format!("parent is not a directory: {}", path.display())
		)),
		Err(err) if err.kind() == io::ErrorKind::NotFound => Err(missing_parent(path)),
		Err(err) => Err(OperationError::io("stat", path.display(), &err)),
	}
}

/// Hidden, unique name next to `path`.
fn temp_sibling(path: &Path) -> PathBuf {
	let name = path.file_name()
		.map(|name| name.to_string_lossy().to_string())
		.unwrap_or_default();
	path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
}

/// Replaces `path` by writing a sibling temp file and renaming it over.
async fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
	let temp = temp_sibling(path);
	let result = write_then_rename(&temp, path, bytes).await;
	if result.is_err() {
		let _ = fs::remove_file(&temp).await;
	}
	result
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
	let mut file = fs::OpenOptions::new()
		.write(true)
		.create_new(true)
		.open(path)
		.await?;
	file.write_all(bytes).await?;
	file.sync_all().await
}

async fn write_then_rename(temp: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
	write_synced(temp, bytes).await?;
	if let Ok(meta) = fs::metadata(path).await {
		fs::set_permissions(temp, meta.permissions()).await?;
	}
	fs::rename(temp, path).await
}

async fn sorted_entries(dir: &Path) -> io::Result<Vec<OsString>> {
	let mut reader = fs::read_dir(dir).await?;
	let mut names = Vec::new();
	while let Some(entry) = reader.next_entry().await? {
		names.push(entry.file_name());
	}
	names.sort();
	Ok(names)
}

fn make_diff(existing: &str, updated: &str, rel_path: &str) -> String {
	let diff = TextDiff::from_lines(existing, updated);
	diff.unified_diff()
		.context_radius(3)
		.header(&format!("a/{}", rel_path), &format!("b/{}", rel_path))
		.to_string()
}

fn not_a_file(path: &ResolvedPath) -> OperationError {
	OperationError::at(ErrorKind::NotAFile, path.display(), format!("not a file: {}", path.display()))
}

fn missing_parent(path: &ResolvedPath) -> OperationError {
	OperationError::at(
		ErrorKind::NotFound,
		path.display(),
		format!("parent directory not found: {}", path.display())
	)
}
