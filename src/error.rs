use serde::Serialize;
use std::io;

/// Stable failure categories reported to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
	InvalidRequest,
	PathViolation,
	NotFound,
	AlreadyExists,
	NotADirectory,
	NotAFile,
	NotEmpty,
	TooLarge,
	PermissionDenied,
	ConfirmationRequired,
	InternalError,
}

impl ErrorKind {
	pub fn as_str(self) -> &'static str {
		match self {
			ErrorKind::InvalidRequest => "INVALID_REQUEST",
			ErrorKind::PathViolation => "PATH_VIOLATION",
			ErrorKind::NotFound => "NOT_FOUND",
			ErrorKind::AlreadyExists => "ALREADY_EXISTS",
			ErrorKind::NotADirectory => "NOT_A_DIRECTORY",
			ErrorKind::NotAFile => "NOT_A_FILE",
			ErrorKind::NotEmpty => "NOT_EMPTY",
			ErrorKind::TooLarge => "TOO_LARGE",
			ErrorKind::PermissionDenied => "PERMISSION_DENIED",
			ErrorKind::ConfirmationRequired => "CONFIRMATION_REQUIRED",
			ErrorKind::InternalError => "INTERNAL_ERROR",
		}
	}
}

/// Failure half of an operation result.
///
/// `completed` is only set by multi-entry operations that made progress
/// before failing.
#[derive(Clone, Debug, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct OperationError {
	pub kind: ErrorKind,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub completed: Option<u64>,
}

impl OperationError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			path: None,
			completed: None
		}
	}

	pub fn invalid(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::InvalidRequest, message)
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::InternalError, message)
	}

	pub fn at(kind: ErrorKind, path: &str, message: impl Into<String>) -> Self {
		Self::new(kind, message).with_path(path)
	}

	pub fn with_path(mut self, path: &str) -> Self {
		self.path = Some(path.to_string());
		self
	}

	pub fn with_completed(mut self, completed: u64) -> Self {
		self.completed = Some(completed);
		self
	}

	/// Classifies an io error raised while performing `action` on `path`.
	///
	/// Unclassified errors keep only the action and path in their message.
	pub fn io(action: &str, path: &str, err: &io::Error) -> Self {
		let (kind, reason) = classify_io(err);
		Self::at(kind, path, format!("{} {}: {}", action, path, reason))
	}
}

fn classify_io(err: &io::Error) -> (ErrorKind, &'static str) {
	match err.kind() {
		io::ErrorKind::NotFound => (ErrorKind::NotFound, "not found"),
		io::ErrorKind::AlreadyExists => (ErrorKind::AlreadyExists, "already exists"),
		io::ErrorKind::PermissionDenied => (ErrorKind::PermissionDenied, "permission denied"),
		io::ErrorKind::DirectoryNotEmpty => (ErrorKind::NotEmpty, "directory not empty"),
		io::ErrorKind::NotADirectory => (ErrorKind::NotADirectory, "not a directory"),
		io::ErrorKind::IsADirectory => (ErrorKind::NotAFile, "is a directory"),
		io::ErrorKind::InvalidInput => (ErrorKind::InvalidRequest, "invalid input"),
		_ => (ErrorKind::InternalError, "io error"),
	}
}

pub fn is_cross_device(err: &io::Error) -> bool {
	err.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn io_errors_map_to_kinds() {
		let err = io::Error::from(io::ErrorKind::NotFound);
		let op = OperationError::io("read", "a.txt", &err);
		assert_eq!(op.kind, ErrorKind::NotFound);
		assert_eq!(op.path.as_deref(), Some("a.txt"));
		assert_eq!(op.message, "read a.txt: not found");
		let err = io::Error::new(io::ErrorKind::Other, "secret detail /etc/shadow");
		let op = OperationError::io("write", "b.txt", &err);
		assert_eq!(op.kind, ErrorKind::InternalError);
		assert!(!op.message.contains("shadow"));
	}

	#[test]
	fn kinds_serialize_as_codes() {
		let value = serde_json::to_value(ErrorKind::ConfirmationRequired).expect("serialize");
		assert_eq!(value, serde_json::json!("CONFIRMATION_REQUIRED"));
		assert_eq!(ErrorKind::NotAFile.as_str(), "NOT_A_FILE");
	}
}
