use std::path::PathBuf;

use thiserror::Error;

pub type TemplateResult<T> = std::result::Result<T, TemplateError>;

/// A location in a template source buffer.
///
/// `offset` is the absolute byte offset, `line` and `column` are 1-indexed
/// and the column is counted in characters.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl Position {
    /// Computes the line and column of `offset` within `source`.
    pub(crate) fn locate(source: &str, offset: usize) -> Self {
        let offset = offset.min(source.len());
        let before = source.get(..offset).unwrap_or_default();
        let line = before.matches('\n').count().saturating_add(1);
        let line_start = before.rfind('\n').map_or(0, |idx| idx.saturating_add(1));
        let column = before
            .get(line_start..)
            .map_or(0, |text| text.chars().count())
            .saturating_add(1);
        Self {
            offset,
            line,
            column,
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum CompileErrorKind {
    #[error("unknown token type '{name}'")]
    UnknownDirective { name: String },
    #[error("unclosed block '@{name}'")]
    UnclosedBlock { name: String },
    #[error("unexpected '@end' with no open block")]
    UnexpectedEnd,
    #[error("unexpected '@{name}' without a matching open '@if'")]
    UnexpectedElse { name: String },
    #[error("unterminated '{open}' in directive body (expected '{close}')")]
    UnterminatedCapture { open: char, close: char },
    #[error("malformed foreach header: {reason}")]
    MalformedForEach { reason: String },
    #[error("invalid expression: {message}")]
    Expression { message: String },
    #[error("custom node '{name}' could not be created: {message}")]
    Extension { name: String, message: String },
}

/// A failure to compile a template. Compilation always aborts on the first
/// error.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("Compile error{} at line {line}, column {column}: {kind}", describe_file(.path))]
pub struct CompileError {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
    /// The directive keyword the error was raised for, if any.
    pub directive: Option<String>,
    /// The template file that failed, when it was read from disk (directly or
    /// through `@include`).
    pub path: Option<PathBuf>,
    #[source]
    pub kind: CompileErrorKind,
}

impl CompileError {
    pub(crate) fn new(position: Position, directive: Option<&str>, kind: CompileErrorKind) -> Self {
        Self {
            offset: position.offset,
            line: position.line,
            column: position.column,
            directive: directive.map(str::to_string),
            path: None,
            kind,
        }
    }

    pub const fn position(&self) -> Position {
        Position {
            offset: self.offset,
            line: self.line,
            column: self.column,
        }
    }
}

fn describe_file(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map_or_else(String::new, |path| format!(" in '{}'", path.display()))
}

/// Errors raised by the expression language.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("unresolvable property or identifier: {name}")]
    Unresolvable { name: String },
    #[error("cannot apply '{op}' to {left} and {right}")]
    Operator {
        op: String,
        left: String,
        right: String,
    },
    #[error("cannot apply unary '{op}' to {operand}")]
    Unary { op: String, operand: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    Overflow,
    #[error("{found} has no field '{field}'")]
    NoField { field: String, found: String },
    #[error("cannot index {found} with {index}")]
    Index { found: String, index: String },
    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: i64, len: usize },
    #[error("a value of type {found} is not callable")]
    NotCallable { found: String },
    #[error("'{callee}' expects {expected} argument(s), got {found}")]
    Arity {
        callee: String,
        expected: usize,
        found: usize,
    },
    /// A template error raised while the expression invoked a declared block.
    #[error(transparent)]
    Nested(Box<TemplateError>),
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum RuntimeErrorKind {
    #[error("cannot iterate over a value of type {found}")]
    UnsupportedIterable { found: String },
    #[error("file not found: {}", .path.display())]
    IncludeNotFound { path: PathBuf },
    #[error("could not read '{}': {message}", .path.display())]
    IncludeUnreadable { path: PathBuf, message: String },
    #[error("no template registry available to resolve '{name}'")]
    MissingRegistry { name: String },
    #[error("named template not found: {name}")]
    TemplateNotFound { name: String },
    #[error("recursion limit of {limit} exceeded")]
    RecursionLimit { limit: usize },
    #[error(transparent)]
    Expression(ExprError),
    #[error("output sink failed: {message}")]
    Output { message: String },
    #[error("custom node '{name}' failed: {message}")]
    Extension { name: String, message: String },
}

/// A failure while rendering. Text written to the sink before the failure is
/// left in place.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("Render error{}: {kind}", describe_location(.position, .directive))]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub position: Option<Position>,
    pub directive: Option<String>,
}

fn describe_location(position: &Option<Position>, directive: &Option<String>) -> String {
    match (position, directive) {
        (Some(position), Some(name)) if !name.is_empty() => format!(" at {position} in '@{name}'"),
        (Some(position), _) => format!(" at {position}"),
        (None, _) => String::new(),
    }
}

impl RuntimeError {
    pub const fn new(kind: RuntimeErrorKind) -> Self {
        Self {
            kind,
            position: None,
            directive: None,
        }
    }

    /// Annotates the error with a location unless an inner one is already set.
    pub(crate) fn at(mut self, position: Position, directive: &str) -> Self {
        if self.position.is_none() {
            self.position = Some(position);
            self.directive = Some(directive.to_string());
        }
        self
    }
}

impl From<RuntimeErrorKind> for RuntimeError {
    fn from(kind: RuntimeErrorKind) -> Self {
        Self::new(kind)
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum TemplateError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("Template already exists: {template_name}")]
    TemplateExists { template_name: String },
    #[error("Template not found: {template_name}")]
    MissingTemplate { template_name: String },
    #[error("Could not read template source: {message}")]
    Io {
        path: Option<PathBuf>,
        message: String,
    },
}

impl TemplateError {
    pub(crate) fn annotate(self, position: Position, directive: &str) -> Self {
        match self {
            Self::Runtime(error) => Self::Runtime(error.at(position, directive)),
            other @ (Self::Compile(_)
            | Self::TemplateExists { .. }
            | Self::MissingTemplate { .. }
            | Self::Io { .. }) => other,
        }
    }
}

impl From<ExprError> for TemplateError {
    fn from(error: ExprError) -> Self {
        match error {
            ExprError::Nested(inner) => *inner,
            other => Self::Runtime(RuntimeError::new(RuntimeErrorKind::Expression(other))),
        }
    }
}

impl From<RuntimeErrorKind> for TemplateError {
    fn from(kind: RuntimeErrorKind) -> Self {
        Self::Runtime(RuntimeError::new(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_locate_first_line() {
        let position = Position::locate("hello world", 6);
        assert_eq!(position.line, 1);
        assert_eq!(position.column, 7);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_locate_after_newlines() {
        let position = Position::locate("ab\ncd\nef", 7);
        assert_eq!(position.line, 3);
        assert_eq!(position.column, 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_locate_counts_chars_not_bytes() {
        let position = Position::locate("héllo", 3);
        assert_eq!(position.column, 3);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_innermost_location_wins() {
        let inner = Position {
            offset: 1,
            line: 1,
            column: 2,
        };
        let outer = Position {
            offset: 9,
            line: 3,
            column: 1,
        };
        let error = RuntimeError::new(RuntimeErrorKind::RecursionLimit { limit: 4 })
            .at(inner, "include")
            .at(outer, "foreach");
        assert_eq!(error.position, Some(inner));
        assert_eq!(error.directive.as_deref(), Some("include"));
        assert_eq!(
            error.to_string(),
            "Render error at line 1, column 2 in '@include': recursion limit of 4 exceeded"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_compile_error_names_file() {
        let position = Position::locate("ab\ncd", 4);
        let mut error = CompileError::new(position, Some("end"), CompileErrorKind::UnexpectedEnd);
        assert_eq!(
            error.to_string(),
            "Compile error at line 2, column 2: unexpected '@end' with no open block"
        );
        error.path = Some(PathBuf::from("pages/bad.tpl"));
        assert_eq!(
            error.to_string(),
            "Compile error in 'pages/bad.tpl' at line 2, column 2: unexpected '@end' with no open block"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_expression_error_unwraps() {
        let inner = TemplateError::MissingTemplate {
            template_name: "x".to_string(),
        };
        let wrapped = ExprError::Nested(Box::new(inner.clone()));
        assert_eq!(TemplateError::from(wrapped), inner);
    }
}
