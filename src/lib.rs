//! `orblate` is a directive-based text template engine.
//!
//! Templates are plain text with embedded directives of the form
//! `@name{body}` (or `$name{body}`): `@{expr}` emits a value, `@if`,
//! `@elseif`, `@else`, `@foreach`, `@declare` open blocks closed by `@end`,
//! and `@include`, `@includeNamed`, `@code`, `@eval` and `@comment` stand
//! alone.
//!
//! ```
//! use orblate::{TemplateCompiler, Value};
//!
//! let template = TemplateCompiler::default()
//!     .compile("@foreach{name : names}Hi @{name}@end{'. '}!")
//!     .unwrap();
//! let context = Value::map([("names", vec!["Ann", "Bo"])]);
//! assert_eq!(template.render(&context).unwrap(), "Hi Ann. Hi Bo!");
//! ```
mod ast;
mod engine;
mod error;
pub mod expr;
mod extension;
mod include;
mod interface;
mod parser;
mod runtime;
mod scanner;
mod template;

// Public exports.
pub use engine::{EngineConfig, TemplateEngine};
pub use error::{
    CompileError, CompileErrorKind, ExprError, Position, RuntimeError, RuntimeErrorKind,
    TemplateError, TemplateResult,
};
pub use extension::{CustomNode, CustomNodeFactory, ExtensionRegistry};
pub use interface::{
    MapResolver, OutputSink, TemplateRegistry, Value, VariableResolver, WriteSink,
};
pub use parser::{CompileMode, TemplateCompiler};
pub use runtime::{CustomCall, DeclaredBlock};
pub use template::{CompiledTemplate, DEFAULT_MAX_DEPTH, Renderer};
