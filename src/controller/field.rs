//! Field-path addressed validation errors
//!
//! Paths render the way `kubectl` reports them: `spec.templates[0].name`.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Path rooted at the given dotted segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path = Self::default();
        for segment in segments {
            path = path.child(segment);
        }
        path
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.into());
        Self { segments }
    }

    /// Append an index to the last segment
    pub fn index(&self, i: usize) -> Self {
        let mut segments = self.segments.clone();
        match segments.last_mut() {
            Some(last) => last.push_str(&format!("[{i}]")),
            None => segments.push(format!("[{i}]")),
        }
        Self { segments }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldErrorKind {
    Invalid,
    Forbidden,
    Required,
    NotFound,
    Duplicate,
}

impl fmt::Display for FieldErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldErrorKind::Invalid => "Invalid value",
            FieldErrorKind::Forbidden => "Forbidden",
            FieldErrorKind::Required => "Required value",
            FieldErrorKind::NotFound => "Not found",
            FieldErrorKind::Duplicate => "Duplicate value",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub kind: FieldErrorKind,
    pub path: FieldPath,
    /// Offending value, `Null` when there is nothing meaningful to show
    pub value: Value,
    pub message: String,
}

impl FieldError {
    pub fn invalid(path: FieldPath, value: impl Serialize, message: impl Into<String>) -> Self {
        Self::with_value(FieldErrorKind::Invalid, path, value, message)
    }

    pub fn forbidden(path: FieldPath, message: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::Forbidden, path, Value::Null, message)
    }

    pub fn required(path: FieldPath, message: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::Required, path, Value::Null, message)
    }

    pub fn not_found(path: FieldPath, value: impl Serialize, message: impl Into<String>) -> Self {
        Self::with_value(FieldErrorKind::NotFound, path, value, message)
    }

    pub fn duplicate(path: FieldPath, value: impl Serialize) -> Self {
        Self::with_value(FieldErrorKind::Duplicate, path, value, "")
    }

    fn with_value(
        kind: FieldErrorKind,
        path: FieldPath,
        value: impl Serialize,
        message: impl Into<String>,
    ) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        Self::new(kind, path, value, message)
    }

    fn new(kind: FieldErrorKind, path: FieldPath, value: Value, message: impl Into<String>) -> Self {
        Self {
            kind,
            path,
            value,
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}: {}: {}", self.path, self.kind, self.value)
        } else {
            write!(f, "{}: {}: {}", self.path, self.kind, self.message)
        }
    }
}

impl std::error::Error for FieldError {}

/// Join errors into one line for events and conditions
pub fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
