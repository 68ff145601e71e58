use crate::config::Limits;
use crate::error::{ErrorKind, OperationError};
use crate::ops::{self, WriteMode};
use crate::resolver::{ResolvedPath, Sandbox};
use crate::search::{CaseSensitivity, KindFilter, NameMatcher, SearchCriteria};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

type DispatchResult = Result<Value, OperationError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
	Create,
	Read,
	Write,
	Delete,
	Copy,
	Move,
	Rename,
	List,
	Mkdir,
	Stat,
	Search,
	Compare,
	Backup,
	CountLines,
	BulkDelete,
	Stats,
}

impl OperationKind {
	pub const ALL: [OperationKind; 16] = [
		OperationKind::Create,
		OperationKind::Read,
		OperationKind::Write,
		OperationKind::Delete,
		OperationKind::Copy,
		OperationKind::Move,
		OperationKind::Rename,
		OperationKind::List,
		OperationKind::Mkdir,
		OperationKind::Stat,
		OperationKind::Search,
		OperationKind::Compare,
		OperationKind::Backup,
		OperationKind::CountLines,
		OperationKind::BulkDelete,
		OperationKind::Stats,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			OperationKind::Create => "create",
			OperationKind::Read => "read",
			OperationKind::Write => "write",
			OperationKind::Delete => "delete",
			OperationKind::Copy => "copy",
			OperationKind::Move => "move",
			OperationKind::Rename => "rename",
			OperationKind::List => "list",
			OperationKind::Mkdir => "mkdir",
			OperationKind::Stat => "stat",
			OperationKind::Search => "search",
			OperationKind::Compare => "compare",
			OperationKind::Backup => "backup",
			OperationKind::CountLines => "count_lines",
			OperationKind::BulkDelete => "bulk_delete",
			OperationKind::Stats => "stats",
		}
	}

	pub fn parse(name: &str) -> Option<Self> {
		Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateArgs {
	pub path: String,
	#[serde(default)]
	pub content: String,
	#[serde(default)]
	pub overwrite: bool,
	#[serde(default)]
	pub parents: bool,
	#[serde(default)]
	pub confirm: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathArgs {
	pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteArgs {
	pub path: String,
	pub content: String,
	#[serde(default)]
	pub mode: WriteMode,
	#[serde(default)]
	pub parents: bool,
	#[serde(default)]
	pub confirm: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteArgs {
	pub path: String,
	#[serde(default)]
	pub recursive: bool,
	#[serde(default)]
	pub confirm: bool,
}

/// Shared by copy and move.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferArgs {
	pub source: String,
	pub destination: String,
	#[serde(default)]
	pub overwrite: bool,
	#[serde(default)]
	pub parents: bool,
	#[serde(default)]
	pub confirm: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameArgs {
	pub source: String,
	pub destination: String,
	#[serde(default)]
	pub overwrite: bool,
	#[serde(default)]
	pub confirm: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListArgs {
	#[serde(default = "current_dir")]
	pub path: String,
	#[serde(default)]
	pub non_recursive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkdirArgs {
	pub path: String,
	#[serde(default)]
	pub parents: bool,
	#[serde(default)]
	pub exist_ok: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchArgs {
	#[serde(default = "current_dir")]
	pub root: String,
	pub name_pattern: Option<String>,
	#[serde(default)]
	pub regex: bool,
	pub case_sensitive: Option<bool>,
	pub extension: Option<Extensions>,
	pub content: Option<String>,
	pub kind: Option<String>,
	pub min_size: Option<u64>,
	pub max_depth: Option<usize>,
	pub max_results: Option<usize>,
}

/// One suffix, a comma-separated list, or an array of suffixes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Extensions {
	One(String),
	Many(Vec<String>),
}

impl Extensions {
	fn list(&self) -> Vec<&str> {
		let parts: Vec<&str> = match self {
			Extensions::One(text) => text.split(',').collect(),
			Extensions::Many(items) => items.iter().map(String::as_str).collect(),
		};
		parts.into_iter()
			.map(str::trim)
			.filter(|ext| !ext.is_empty())
			.collect()
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkDeleteArgs {
	#[serde(default = "current_dir")]
	pub path: String,
	pub pattern: String,
	#[serde(default)]
	pub regex: bool,
	pub case_sensitive: Option<bool>,
	#[serde(default)]
	pub non_recursive: bool,
	#[serde(default)]
	pub confirm: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsArgs {
	#[serde(default = "current_dir")]
	pub path: String,
	#[serde(default)]
	pub non_recursive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompareArgs {
	pub first: String,
	pub second: String,
}

fn current_dir() -> String {
	".".to_string()
}

/// A validated request: the operation and its typed arguments.
#[derive(Debug)]
pub enum Operation {
	Create(CreateArgs),
	Read(PathArgs),
	Write(WriteArgs),
	Delete(DeleteArgs),
	Copy(TransferArgs),
	Move(TransferArgs),
	Rename(RenameArgs),
	List(ListArgs),
	Mkdir(MkdirArgs),
	Stat(PathArgs),
	Search(SearchArgs),
	Compare(CompareArgs),
	Backup(PathArgs),
	CountLines(PathArgs),
	BulkDelete(BulkDeleteArgs),
	Stats(StatsArgs),
}

impl Operation {
	pub fn parse(name: &str, arguments: &Value) -> Result<Self, OperationError> {
		let kind = OperationKind::parse(name)
			.ok_or_else(|| OperationError::invalid(format!("unknown operation: {}", name)))?;
		let arguments = match arguments {
			Value::Null => Value::Object(Map::new()),
			other => other.clone(),
		};
		let operation = match kind {
			OperationKind::Create => Operation::Create(decode(kind, arguments)?),
			OperationKind::Read => Operation::Read(decode(kind, arguments)?),
			OperationKind::Write => Operation::Write(decode(kind, arguments)?),
			OperationKind::Delete => Operation::Delete(decode(kind, arguments)?),
			OperationKind::Copy => Operation::Copy(decode(kind, arguments)?),
			OperationKind::Move => Operation::Move(decode(kind, arguments)?),
			OperationKind::Rename => Operation::Rename(decode(kind, arguments)?),
			OperationKind::List => Operation::List(decode(kind, arguments)?),
			OperationKind::Mkdir => Operation::Mkdir(decode(kind, arguments)?),
			OperationKind::Stat => Operation::Stat(decode(kind, arguments)?),
			OperationKind::Search => Operation::Search(decode(kind, arguments)?),
			OperationKind::Compare => Operation::Compare(decode(kind, arguments)?),
			OperationKind::Backup => Operation::Backup(decode(kind, arguments)?),
			OperationKind::CountLines => Operation::CountLines(decode(kind, arguments)?),
			OperationKind::BulkDelete => Operation::BulkDelete(decode(kind, arguments)?),
			OperationKind::Stats => Operation::Stats(decode(kind, arguments)?),
		};
		Ok(operation)
	}

	pub fn kind(&self) -> OperationKind {
		match self {
			Operation::Create(_) => OperationKind::Create,
			Operation::Read(_) => OperationKind::Read,
			Operation::Write(_) => OperationKind::Write,
			Operation::Delete(_) => OperationKind::Delete,
			Operation::Copy(_) => OperationKind::Copy,
			Operation::Move(_) => OperationKind::Move,
			Operation::Rename(_) => OperationKind::Rename,
			Operation::List(_) => OperationKind::List,
			Operation::Mkdir(_) => OperationKind::Mkdir,
			Operation::Stat(_) => OperationKind::Stat,
			Operation::Search(_) => OperationKind::Search,
			Operation::Compare(_) => OperationKind::Compare,
			Operation::Backup(_) => OperationKind::Backup,
			Operation::CountLines(_) => OperationKind::CountLines,
			Operation::BulkDelete(_) => OperationKind::BulkDelete,
			Operation::Stats(_) => OperationKind::Stats,
		}
	}
}

fn decode<T: DeserializeOwned>(kind: OperationKind, arguments: Value) -> Result<T, OperationError> {
	serde_json::from_value(arguments)
		.map_err(|err| OperationError::invalid(format!("invalid arguments for {}: {}", kind.as_str(), err)))
}

/// Routes validated operations to their executors. Holds no per-request
/// state; clones share nothing mutable.
#[derive(Clone, Debug)]
pub struct Dispatcher {
	sandbox: Sandbox,
	limits: Limits,
}

impl Dispatcher {
	pub fn new(sandbox: Sandbox, limits: Limits) -> Self {
		Self {
			sandbox,
			limits
		}
	}

	pub fn sandbox(&self) -> &Sandbox {
		&self.sandbox
	}

	/// Validates then executes one call. The executor runs in its own task so
	/// a panic surfaces as `INTERNAL_ERROR` instead of taking down the server.
	pub async fn dispatch(&self, name: &str, arguments: &Value, cancel: CancellationToken) -> DispatchResult {
		let operation = Operation::parse(name, arguments)?;
		let kind = operation.kind();
		debug!(operation = kind.as_str(), "dispatching");
		let dispatcher = self.clone();
		let handle = tokio::spawn(async move { dispatcher.execute(operation, cancel).await });
		match handle.await {
			Ok(result) => result,
			Err(err) => {
				error!(operation = kind.as_str(), "executor aborted: {}", err);
				Err(OperationError::internal(format!("{} failed unexpectedly", kind.as_str())))
			}
		}
	}

	async fn execute(&self, operation: Operation, cancel: CancellationToken) -> DispatchResult {
		match operation {
			Operation::Create(args) => {
				let path = self.sandbox.resolve(&args.path)?;
				if args.overwrite {
					confirm_replacement(&path, args.confirm, "overwriting").await?;
				}
				encode(ops::create(&path, &args.content, args.overwrite, args.parents).await?)
			}
			Operation::Read(args) => {
				let path = self.sandbox.resolve(&args.path)?;
				encode(ops::read(&path, &self.limits).await?)
			}
			Operation::Write(args) => {
				let path = self.sandbox.resolve(&args.path)?;
				if args.mode == WriteMode::Overwrite {
					confirm_replacement(&path, args.confirm, "overwriting").await?;
				}
				encode(ops::write(&path, &args.content, args.mode, args.parents, &self.limits).await?)
			}
			Operation::Delete(args) => {
				let path = self.sandbox.resolve(&args.path)?;
				if !args.confirm {
					return Err(confirmation_required(&path, "deleting"));
				}
				encode(ops::delete(&path, args.recursive, &cancel).await?)
			}
			Operation::Copy(args) => {
				let source = self.sandbox.resolve(&args.source)?;
				let destination = self.sandbox.resolve(&args.destination)?;
				if args.overwrite {
					confirm_replacement(&destination, args.confirm, "replacing").await?;
				}
				encode(ops::copy(&source, &destination, args.overwrite, args.parents, &cancel).await?)
			}
			Operation::Move(args) => {
				let source = self.sandbox.resolve(&args.source)?;
				let destination = self.sandbox.resolve(&args.destination)?;
				if args.overwrite {
					confirm_replacement(&destination, args.confirm, "replacing").await?;
				}
				encode(ops::relocate(&source, &destination, args.overwrite, args.parents).await?)
			}
			Operation::Rename(args) => {
				let source = self.sandbox.resolve(&args.source)?;
				let destination = self.rename_target(&source, &args.destination)?;
				if args.overwrite {
					confirm_replacement(&destination, args.confirm, "replacing").await?;
				}
				encode(ops::relocate(&source, &destination, args.overwrite, false).await?)
			}
			Operation::List(args) => {
				let path = self.sandbox.resolve(&args.path)?;
				encode(ops::list(&path, args.non_recursive, &self.limits, &cancel).await?)
			}
			Operation::Mkdir(args) => {
				let path = self.sandbox.resolve(&args.path)?;
				encode(ops::mkdir(&path, args.parents, args.exist_ok).await?)
			}
			Operation::Stat(args) => {
				let path = self.sandbox.resolve(&args.path)?;
				encode(ops::stat(&path).await?)
			}
			Operation::Search(args) => {
				let criteria = self.search_criteria(args)?;
				encode(ops::search(criteria, &self.limits, &cancel).await?)
			}
			Operation::Compare(args) => {
				let first = self.sandbox.resolve(&args.first)?;
				let second = self.sandbox.resolve(&args.second)?;
				encode(ops::compare(&first, &second, &self.limits).await?)
			}
			Operation::Backup(args) => {
				let path = self.sandbox.resolve(&args.path)?;
				encode(ops::backup(&path).await?)
			}
			Operation::CountLines(args) => {
				let path = self.sandbox.resolve(&args.path)?;
				encode(ops::count_lines(&path, &self.limits).await?)
			}
			Operation::BulkDelete(args) => {
				let root = self.sandbox.resolve(&args.path)?;
				if !args.confirm {
					return Err(confirmation_required(&root, "deleting files under"));
				}
				let mut criteria = SearchCriteria::new(root);
				criteria.name = Some(NameMatcher::build(&args.pattern, args.regex, case_sensitivity(args.case_sensitive))?);
				criteria.kind = KindFilter::File;
				criteria.max_depth = args.non_recursive.then_some(1);
				encode(ops::bulk_delete(criteria, &cancel).await?)
			}
			Operation::Stats(args) => {
				let path = self.sandbox.resolve(&args.path)?;
				encode(ops::stats(&path, args.non_recursive, &cancel).await?)
			}
		}
	}

	/// A destination without a separator names a sibling of the source.
	fn rename_target(&self, source: &ResolvedPath, destination: &str) -> Result<ResolvedPath, OperationError> {
		if destination.contains('/') || destination.contains('\\') {
			return self.sandbox.resolve(destination);
		}
		if destination.is_empty() || destination == "." || destination == ".." {
			return Err(OperationError::invalid(format!("invalid rename target: {:?}", destination)));
		}
		let raw = match Path::new(source.display()).parent() {
			Some(parent) if !parent.as_os_str().is_empty() => parent.join(destination),
			_ => Path::new(destination).to_path_buf(),
		};
		self.sandbox.resolve(&raw.to_string_lossy())
	}

	fn search_criteria(&self, args: SearchArgs) -> Result<SearchCriteria, OperationError> {
		let root = self.sandbox.resolve(&args.root)?;
		let mut criteria = SearchCriteria::new(root);
		if let Some(pattern) = args.name_pattern.as_deref().filter(|pattern| !pattern.is_empty()) {
			criteria.name = Some(NameMatcher::build(pattern, args.regex, case_sensitivity(args.case_sensitive))?);
		}
		if let Some(extensions) = &args.extension {
			for extension in extensions.list() {
				criteria = criteria.with_extension(extension);
			}
		}
		if let Some(needle) = args.content.as_deref().filter(|needle| !needle.is_empty()) {
			criteria = criteria.with_content(needle)?;
		}
		if let Some(kind) = args.kind.as_deref() {
			criteria.kind = KindFilter::parse(kind)?;
		}
		criteria.min_size = args.min_size;
		criteria.max_depth = args.max_depth;
		criteria.max_results = match args.max_results {
			Some(0) => None,
			Some(max) => Some(max),
			None => self.limits.search_limit,
		};
		Ok(criteria)
	}
}

fn case_sensitivity(flag: Option<bool>) -> CaseSensitivity {
	match flag {
		None => CaseSensitivity::Auto,
		Some(true) => CaseSensitivity::Sensitive,
		Some(false) => CaseSensitivity::Insensitive,
	}
}

/// Replacing an existing entry needs `confirm: true`; a missing target does not.
async fn confirm_replacement(path: &ResolvedPath, confirmed: bool, action: &str) -> Result<(), OperationError> {
	if confirmed {
		return Ok(());
	}
	match tokio::fs::symlink_metadata(path.absolute()).await {
		Ok(_) => Err(confirmation_required(path, action)),
		Err(_) => Ok(()),
	}
}

fn confirmation_required(path: &ResolvedPath, action: &str) -> OperationError {
	OperationError::at(
		ErrorKind::ConfirmationRequired,
		path.display(),
		format!("{} {} requires confirm: true", action, path.display())
	)
}

fn encode<T: Serialize>(output: T) -> DispatchResult {
	serde_json::to_value(output).map_err(|err| {
		error!("failed to encode result: {}", err);
		OperationError::internal("failed to encode result")
	})
}
