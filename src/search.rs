use crate::error::OperationError;
use crate::metadata::FileMetadata;
use crate::resolver::ResolvedPath;
use globset::{GlobBuilder, GlobMatcher};
use ignore::{Walk, WalkBuilder};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::fs::FileType;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Copy, Debug)]
pub enum CaseSensitivity {
	Auto,
	Sensitive,
	Insensitive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindFilter {
	Any,
	File,
	Directory,
	Symlink,
}

impl KindFilter {
	pub fn parse(value: &str) -> Result<Self, OperationError> {
		match value {
			"any" => Ok(KindFilter::Any),
			"file" => Ok(KindFilter::File),
			"dir" | "directory" => Ok(KindFilter::Directory),
			"symlink" => Ok(KindFilter::Symlink),
			_ => Err(OperationError::invalid(format!("unsupported kind: {}", value))),
		}
	}

	fn accepts(self, ftype: &FileType) -> bool {
		match self {
			KindFilter::Any => true,
			KindFilter::File => ftype.is_file(),
			KindFilter::Directory => ftype.is_dir(),
			KindFilter::Symlink => ftype.is_symlink(),
		}
	}
}

pub enum NameMatcher {
	Regex(Regex),
	Glob(GlobMatcher),
}

impl NameMatcher {
	/// Compiles a base-name matcher. Auto case sensitivity turns sensitive
	/// when the pattern contains an uppercase letter.
	pub fn build(pattern: &str, regex: bool, case: CaseSensitivity) -> Result<Self, OperationError> {
		let case_sensitive = match case {
			CaseSensitivity::Sensitive => true,
			CaseSensitivity::Insensitive => false,
			CaseSensitivity::Auto => pattern.chars().any(|c| c.is_uppercase()),
		};
		if regex {
			let re = RegexBuilder::new(pattern)
				.case_insensitive(!case_sensitive)
				.build()
				.map_err(|err| OperationError::invalid(format!("invalid pattern: {}", err)))?;
			return Ok(NameMatcher::Regex(re));
		}
		let glob = GlobBuilder::new(pattern)
			.case_insensitive(!case_sensitive)
			.literal_separator(true)
			.build()
			.map_err(|err| OperationError::invalid(format!("invalid glob: {}", err)))?;
		Ok(NameMatcher::Glob(glob.compile_matcher()))
	}

	fn is_match(&self, name: &str) -> bool {
		match self {
			NameMatcher::Regex(re) => re.is_match(name),
			NameMatcher::Glob(glob) => glob.is_match(name),
		}
	}
}

/// Filters for one search; an unset field leaves that dimension open.
pub struct SearchCriteria {
	pub root: ResolvedPath,
	pub name: Option<NameMatcher>,
	pub extensions: Vec<String>,
	pub content: Option<regex::bytes::Regex>,
	pub kind: KindFilter,
	pub min_size: Option<u64>,
	pub max_depth: Option<usize>,
	pub max_results: Option<usize>,
}

impl SearchCriteria {
	pub fn new(root: ResolvedPath) -> Self {
		Self {
			root,
			name: None,
			extensions: Vec::new(),
			content: None,
			kind: KindFilter::Any,
			min_size: None,
			max_depth: None,
			max_results: None,
		}
	}

	/// Adds an accepted suffix; a bare `txt` is read as `.txt`. An entry
	/// matches when its name ends with any of the accepted suffixes.
	pub fn with_extension(mut self, extension: &str) -> Self {
		let extension = if extension.starts_with('.') {
			extension.to_string()
		}
		else {
			format!(".{}", extension)
		};
		self.extensions.push(extension);
		self
	}

	/// Literal content filter. A needle the matcher cannot compile is an
	/// error rather than a silently dropped filter.
	pub fn with_content(mut self, needle: &str) -> Result<Self, OperationError> {
		let matcher = regex::bytes::Regex::new(&regex::escape(needle))
			.map_err(|err| OperationError::invalid(format!("invalid content needle: {}", err)))?;
		self.content = Some(matcher);
		Ok(self)
	}

	/// Kind filter actually applied: extension and content filters only
	/// ever select regular files.
	fn effective_kind(&self) -> KindFilter {
		if self.kind == KindFilter::Any && (!self.extensions.is_empty() || self.content.is_some()) {
			KindFilter::File
		}
		else {
			self.kind
		}
	}
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SearchSummary {
	pub count: usize,
	pub skipped: usize,
	pub truncated: bool,
	pub cancelled: bool,
}

/// Lazy depth-first traversal yielding matching entries.
///
/// Symlinks are reported but never followed. Entries that cannot be
/// inspected are counted in `skipped`. Once exhausted, capped or cancelled
/// the iterator stays finished.
pub struct Search {
	walk: Walk,
	criteria: SearchCriteria,
	kind: KindFilter,
	content_max_bytes: Option<u64>,
	cancel: CancellationToken,
	summary: SearchSummary,
	done: bool,
}

impl Search {
	pub fn new(criteria: SearchCriteria, content_max_bytes: Option<u64>, cancel: CancellationToken) -> Self {
		let mut builder = WalkBuilder::new(criteria.root.absolute());
		builder.standard_filters(false);
		builder.follow_links(false);
		builder.max_depth(criteria.max_depth);
		builder.sort_by_file_name(|a, b| a.cmp(b));
		Self {
			walk: builder.build(),
			kind: criteria.effective_kind(),
			criteria,
			content_max_bytes,
			cancel,
			summary: SearchSummary::default(),
			done: false,
		}
	}

	pub fn summary(&self) -> &SearchSummary {
		&self.summary
	}

	fn finish<T>(&mut self) -> Option<T> {
		self.done = true;
		None
	}

	fn content_matches(&mut self, entry: &ignore::DirEntry, size: u64) -> bool {
		let Some(needle) = &self.criteria.content else {
			return true;
		};
		if self.content_max_bytes.map(|max| size > max).unwrap_or(false) {
			debug!(path = %entry.path().display(), size, "content search skipped oversized file");
			self.summary.skipped += 1;
			return false;
		}
		match std::fs::read(entry.path()) {
			Ok(bytes) => needle.is_match(&bytes),
			Err(err) => {
				debug!(path = %entry.path().display(), error = %err, "content search skipped unreadable file");
				self.summary.skipped += 1;
				false
			}
		}
	}
}

impl Search {
	/// Next match together with its absolute path.
	pub fn next_match(&mut self) -> Option<(PathBuf, FileMetadata)> {
		if self.done {
			return None;
		}
		loop {
			if self.cancel.is_cancelled() {
				self.summary.cancelled = true;
				return self.finish();
			}
			let entry = match self.walk.next() {
				None => return self.finish(),
				Some(Err(err)) => {
					debug!(error = %err, "search skipped entry");
					self.summary.skipped += 1;
					continue;
				}
				Some(Ok(entry)) => entry,
			};
			if entry.depth() == 0 {
				continue;
			}
			let Some(ftype) = entry.file_type() else {
				continue;
			};
			if !self.kind.accepts(&ftype) {
				continue;
			}
			let name = entry.file_name().to_string_lossy();
			if let Some(matcher) = &self.criteria.name {
				if !matcher.is_match(&name) {
					continue;
				}
			}
			if !self.criteria.extensions.is_empty() && !self.criteria.extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
				continue;
			}
			let meta = match entry.metadata() {
				Ok(meta) => meta,
				Err(err) => {
					debug!(path = %entry.path().display(), error = %err, "search skipped entry");
					self.summary.skipped += 1;
					continue;
				}
			};
			if let Some(min_size) = self.criteria.min_size {
				if meta.len() < min_size {
					continue;
				}
			}
			if self.criteria.content.is_some() {
				if !ftype.is_file() || !self.content_matches(&entry, meta.len()) {
					continue;
				}
			}
			if let Some(max) = self.criteria.max_results {
				if self.summary.count >= max {
					self.summary.truncated = true;
					return self.finish();
				}
			}
			self.summary.count += 1;
			// Reaching the cap ends the walk; nothing past it is visited.
			if self.criteria.max_results.map(|max| self.summary.count >= max).unwrap_or(false) {
				self.summary.truncated = true;
				self.done = true;
			}
			let display = self.criteria.root.display_of(entry.path());
			let item = FileMetadata::from_metadata(display, &meta);
			return Some((entry.into_path(), item));
		}
	}
}

impl Iterator for Search {
	type Item = FileMetadata;

	fn next(&mut self) -> Option<FileMetadata> {
		self.next_match().map(|(_, item)| item)
	}
}

#[derive(Debug, Serialize)]
pub struct SearchOutcome {
	pub root: String,
	pub matches: Vec<FileMetadata>,
	#[serde(flatten)]
	pub summary: SearchSummary,
}

/// Drains a search on the blocking pool.
pub async fn run(criteria: SearchCriteria, content_max_bytes: Option<u64>, cancel: CancellationToken) -> Result<SearchOutcome, OperationError> {
	tokio::task::spawn_blocking(
		move || {
			let root = criteria.root.display().to_string();
			let mut search = Search::new(criteria, content_max_bytes, cancel);
			let matches: Vec<FileMetadata> = search.by_ref().collect();
			SearchOutcome {
				root,
				matches,
				summary: search.summary().clone()
			}
		}
	)
	.await
	.map_err(|_| OperationError::internal("search worker failed"))
}
