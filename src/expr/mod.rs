//! The expression language embedded in template directives.
//!
//! The template core only uses two entry points: [`compile`] (ahead of time,
//! for compiled mode) and [`evaluate_str`] (parse-and-run, for interpreted
//! mode). Both evaluate against an [`Environment`], which the runtime
//! implements over its scope chain.

mod eval;
mod parse;

use crate::{error::ExprError, interface::Value};

pub(crate) use parse::ExprNode;

/// Variable access and calls available to an evaluating expression.
pub trait Environment {
    fn lookup(&self, name: &str) -> Option<Value>;

    fn assign(&mut self, name: &str, value: Value);

    fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, ExprError>;
}

/// A pre-parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    root: ExprNode,
}

impl Expr {
    pub fn evaluate(&self, env: &mut dyn Environment) -> Result<Value, ExprError> {
        eval::eval(&self.root, env)
    }
}

/// Parses `source` into a reusable [`Expr`].
///
/// An empty (or all-whitespace) source compiles to an expression yielding
/// `null`.
pub fn compile(source: &str) -> Result<Expr, ExprError> {
    Ok(Expr {
        root: parse::parse(source)?,
    })
}

/// Parses and evaluates `source` in one step.
pub fn evaluate_str(source: &str, env: &mut dyn Environment) -> Result<Value, ExprError> {
    compile(source)?.evaluate(env)
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::collections::HashMap;

    use super::Environment;
    use crate::{error::ExprError, interface::Value};

    /// A flat environment for exercising expressions without a template.
    #[derive(Default)]
    pub(crate) struct FlatEnv {
        pub vars: HashMap<String, Value>,
    }

    impl Environment for FlatEnv {
        fn lookup(&self, name: &str) -> Option<Value> {
            self.vars.get(name).cloned()
        }

        fn assign(&mut self, name: &str, value: Value) {
            self.vars.insert(name.to_string(), value);
        }

        fn call(&mut self, callee: &Value, _args: Vec<Value>) -> Result<Value, ExprError> {
            Err(ExprError::NotCallable {
                found: callee.type_name().to_string(),
            })
        }
    }
}
