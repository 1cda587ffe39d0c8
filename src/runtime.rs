use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    ast::{ExprSlot, Node, NodeId, NodeKind},
    error::{ExprError, Position, RuntimeErrorKind, TemplateError, TemplateResult},
    expr::{self, Environment},
    include,
    interface::{OutputSink, TemplateRegistry, Value, VariableResolver},
    parser::CompileMode,
    template::CompiledTemplate,
};

type Frame = HashMap<String, Value>;

/// The body of an `@declare` block, captured with the scope it was declared
/// in. Calling it from an expression (`name()`) renders the body to a string.
#[derive(Clone)]
pub struct DeclaredBlock(Arc<BlockInner>);

struct BlockInner {
    name: String,
    template: CompiledTemplate,
    body: Option<NodeId>,
    frames: Vec<Frame>,
    dir: PathBuf,
}

impl DeclaredBlock {
    pub fn name(&self) -> &str {
        &self.0.name
    }
}

impl fmt::Debug for DeclaredBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeclaredBlock")
            .field("name", &self.0.name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for DeclaredBlock {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Render-local state: scopes, include directories and declared blocks.
pub(crate) struct Runtime<'r> {
    context: &'r Value,
    resolver: Option<&'r mut dyn VariableResolver>,
    registry: Option<&'r dyn TemplateRegistry>,
    /// Innermost scope last. There is always at least one frame.
    frames: Vec<Frame>,
    /// Directory of the template currently rendering, for relative includes.
    dirs: Vec<PathBuf>,
    declared: HashMap<String, DeclaredBlock>,
    depth: usize,
    max_depth: usize,
}

impl<'r> Runtime<'r> {
    pub(crate) fn new(
        context: &'r Value,
        resolver: Option<&'r mut dyn VariableResolver>,
        registry: Option<&'r dyn TemplateRegistry>,
        base_dir: PathBuf,
        max_depth: usize,
    ) -> Self {
        Runtime {
            context,
            resolver,
            registry,
            frames: vec![Frame::new()],
            dirs: vec![base_dir],
            declared: HashMap::new(),
            depth: 0,
            max_depth,
        }
    }

    pub(crate) fn render(&mut self, tpl: &CompiledTemplate, out: &mut dyn OutputSink) -> TemplateResult<()> {
        self.exec_chain(tpl, Some(tpl.root()), out)
    }

    /// Evaluates a lone expression node, returning its raw value.
    pub(crate) fn evaluate_node(&mut self, tpl: &CompiledTemplate, id: NodeId) -> TemplateResult<Value> {
        let node = tpl.node(id);
        match &node.kind {
            NodeKind::Expression { expr } => expr
                .evaluate(tpl.source(), self)
                .map_err(|e| locate(tpl, node, e.into())),
            _ => Ok(Value::Null),
        }
    }

    /// Executes nodes along `next` until a terminal or the end node.
    pub(crate) fn exec_chain(
        &mut self,
        tpl: &CompiledTemplate,
        start: Option<NodeId>,
        out: &mut dyn OutputSink,
    ) -> TemplateResult<()> {
        let mut cursor = start;
        while let Some(id) = cursor {
            let node = tpl.node(id);
            cursor = self
                .exec_node(tpl, id, node, out)
                .map_err(|e| locate(tpl, node, e))?;
        }
        Ok(())
    }

    fn exec_node(
        &mut self,
        tpl: &CompiledTemplate,
        id: NodeId,
        node: &Node,
        out: &mut dyn OutputSink,
    ) -> TemplateResult<Option<NodeId>> {
        let source = tpl.source();
        match &node.kind {
            NodeKind::Text { spans } => {
                for span in spans {
                    emit(out, source.get(span.clone()).unwrap_or_default())?;
                }
                Ok(node.next)
            }
            NodeKind::Expression { expr } | NodeKind::Eval { expr } => {
                let value = expr.evaluate(source, self)?;
                emit(out, &value.to_string())?;
                Ok(node.next)
            }
            NodeKind::Code { expr } => {
                expr.evaluate(source, self)?;
                Ok(node.next)
            }
            NodeKind::Comment => Ok(node.next),
            NodeKind::Terminal | NodeKind::End => Ok(None),
            NodeKind::If { .. } => {
                self.exec_if(tpl, id, out)?;
                Ok(after_block(tpl, node))
            }
            NodeKind::ForEach { .. } => {
                self.exec_foreach(tpl, node, out)?;
                Ok(after_block(tpl, node))
            }
            NodeKind::Include { path, pre } => {
                self.include(tpl, id, path, pre.as_ref(), out)?;
                Ok(node.next)
            }
            NodeKind::NamedInclude { name, pre } => {
                self.include_named(tpl, name, pre.as_ref(), out)?;
                Ok(node.next)
            }
            NodeKind::Declare { name, nested, .. } => {
                self.declare(tpl, name, *nested)?;
                Ok(after_block(tpl, node))
            }
            NodeKind::Custom {
                node: custom,
                block,
                ..
            } => {
                let mut call = CustomCall {
                    runtime: self,
                    template: tpl,
                    node: id,
                    out,
                };
                custom.eval(&mut call)?;
                Ok(if *block {
                    after_block(tpl, node)
                } else {
                    node.next
                })
            }
        }
    }

    fn exec_if(&mut self, tpl: &CompiledTemplate, id: NodeId, out: &mut dyn OutputSink) -> TemplateResult<()> {
        let mut branch = Some(id);
        while let Some(current) = branch {
            let node = tpl.node(current);
            let NodeKind::If {
                condition,
                nested,
                alternative,
                ..
            } = &node.kind
            else {
                break;
            };

            let taken = match condition {
                None => true,
                Some(condition) => condition
                    .evaluate(tpl.source(), self)
                    .map_err(|e| locate(tpl, node, e.into()))?
                    .is_truthy(),
            };
            if taken {
                return self.exec_chain(tpl, *nested, out);
            }
            branch = *alternative;
        }
        Ok(())
    }

    fn exec_foreach(&mut self, tpl: &CompiledTemplate, node: &Node, out: &mut dyn OutputSink) -> TemplateResult<()> {
        let NodeKind::ForEach {
            bindings,
            nested,
            separator,
            ..
        } = &node.kind
        else {
            return Ok(());
        };
        let source = tpl.source();

        let mut sources = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let value = binding.source.evaluate(source, self)?;
            sources.push((
                binding.variable.as_str(),
                LoopSource::new(value)?.peekable(),
            ));
        }

        // Lock-step: runs while any source has items, padding the rest.
        while sources.iter_mut().any(|(_, items)| items.peek().is_some()) {
            let mut frame = Frame::with_capacity(sources.len());
            for (variable, items) in &mut sources {
                let value = items.next().unwrap_or_else(|| Value::String(String::new()));
                frame.insert((*variable).to_string(), value);
            }

            self.frames.push(frame);
            let result = self.exec_chain(tpl, *nested, out);
            self.frames.pop();
            result?;

            if let Some(separator) = separator {
                if sources.iter_mut().any(|(_, items)| items.peek().is_some()) {
                    let value = separator.evaluate(source, self)?;
                    emit(out, &value.to_string())?;
                }
            }
        }
        Ok(())
    }

    fn include(
        &mut self,
        tpl: &CompiledTemplate,
        id: NodeId,
        path: &ExprSlot,
        pre: Option<&ExprSlot>,
        out: &mut dyn OutputSink,
    ) -> TemplateResult<()> {
        let target = path.evaluate(tpl.source(), self)?.to_string();
        let resolved = include::resolve_relative(self.current_dir(), &target);
        if let Some(pre) = pre {
            pre.evaluate(tpl.source(), self)?;
        }

        let sub = match tpl.mode() {
            CompileMode::Compiled => {
                let modified = include::last_modified(&resolved);
                if let Some(cached) = tpl.includes().lookup(id, &resolved, modified) {
                    tracing::trace!(path = %resolved.display(), "include cache hit");
                    cached
                } else {
                    tracing::debug!(path = %resolved.display(), "include cache miss, compiling");
                    let sub = compile_include(tpl, &resolved)?;
                    tpl.includes().store(id, resolved.clone(), modified, sub.clone());
                    sub
                }
            }
            CompileMode::Interpreted => compile_include(tpl, &resolved)?,
        };

        let dir = resolved
            .parent()
            .map_or_else(|| self.current_dir().to_path_buf(), Path::to_path_buf);
        self.render_nested(&sub, dir, out)
    }

    fn include_named(
        &mut self,
        tpl: &CompiledTemplate,
        name: &ExprSlot,
        pre: Option<&ExprSlot>,
        out: &mut dyn OutputSink,
    ) -> TemplateResult<()> {
        let name = name.evaluate(tpl.source(), self)?.to_string();
        if let Some(pre) = pre {
            pre.evaluate(tpl.source(), self)?;
        }

        if let Some(block) = self.declared.get(&name).cloned() {
            return self.invoke_block(&block, out);
        }

        let registry = self
            .registry
            .ok_or_else(|| RuntimeErrorKind::MissingRegistry { name: name.clone() })?;
        let sub = registry
            .lookup(&name)
            .ok_or(RuntimeErrorKind::TemplateNotFound { name })?;
        let dir = sub
            .origin()
            .and_then(Path::parent)
            .map_or_else(|| self.current_dir().to_path_buf(), Path::to_path_buf);
        self.render_nested(&sub, dir, out)
    }

    /// Renders another template in the current scope, with `dir` as its
    /// include directory.
    fn render_nested(&mut self, sub: &CompiledTemplate, dir: PathBuf, out: &mut dyn OutputSink) -> TemplateResult<()> {
        self.enter()?;
        tracing::trace!(dir = %dir.display(), depth = self.depth, "include dir push");
        self.dirs.push(dir);
        let result = self.exec_chain(sub, Some(sub.root()), out);
        self.dirs.pop();
        tracing::trace!(depth = self.depth, "include dir pop");
        self.leave();
        result
    }

    fn declare(&mut self, tpl: &CompiledTemplate, name: &ExprSlot, body: Option<NodeId>) -> TemplateResult<()> {
        let name = name.evaluate(tpl.source(), self)?.to_string();
        let block = DeclaredBlock(Arc::new(BlockInner {
            name: name.clone(),
            template: tpl.clone(),
            body,
            frames: self.frames.clone(),
            dir: self.current_dir().to_path_buf(),
        }));
        tracing::debug!(name = %name, "declared block");

        self.declared.insert(name.clone(), block.clone());
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name, Value::Block(block));
        }
        Ok(())
    }

    /// Renders a declared block's body in the scope captured at declaration.
    fn invoke_block(&mut self, block: &DeclaredBlock, out: &mut dyn OutputSink) -> TemplateResult<()> {
        self.enter()?;
        let mut frames = block.0.frames.clone();
        frames.push(Frame::new());
        let saved = std::mem::replace(&mut self.frames, frames);
        self.dirs.push(block.0.dir.clone());

        let result = self.exec_chain(&block.0.template, block.0.body, out);

        self.dirs.pop();
        self.frames = saved;
        self.leave();
        result
    }

    fn enter(&mut self) -> TemplateResult<()> {
        if self.depth >= self.max_depth {
            return Err(RuntimeErrorKind::RecursionLimit {
                limit: self.max_depth,
            }
            .into());
        }
        self.depth = self.depth.saturating_add(1);
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn current_dir(&self) -> &Path {
        self.dirs.last().map_or_else(|| Path::new("."), PathBuf::as_path)
    }
}

impl Environment for Runtime<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.frames.iter().rev().find_map(|frame| frame.get(name)) {
            return Some(value.clone());
        }
        if let Some(block) = self.declared.get(name) {
            return Some(Value::Block(block.clone()));
        }
        if let Some(value) = self.resolver.as_ref().and_then(|r| r.resolve(name)) {
            return Some(value);
        }
        self.context.get(name).cloned()
    }

    fn assign(&mut self, name: &str, value: Value) {
        if let Some(slot) = self
            .frames
            .iter_mut()
            .rev()
            .find_map(|frame| frame.get_mut(name))
        {
            *slot = value;
            return;
        }
        if let Some(resolver) = self.resolver.as_deref_mut() {
            if resolver.assign(name, &value) {
                return;
            }
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), value);
        }
    }

    fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, ExprError> {
        let Value::Block(block) = callee else {
            return Err(ExprError::NotCallable {
                found: callee.type_name().to_string(),
            });
        };
        if !args.is_empty() {
            return Err(ExprError::Arity {
                callee: block.name().to_string(),
                expected: 0,
                found: args.len(),
            });
        }

        let block = block.clone();
        let mut rendered = String::new();
        self.invoke_block(&block, &mut rendered)
            .map_err(|e| ExprError::Nested(Box::new(e)))?;
        Ok(Value::String(rendered))
    }
}

/// Handle given to a [`CustomNode`](crate::CustomNode) while it evaluates.
pub struct CustomCall<'c, 'r> {
    runtime: &'c mut Runtime<'r>,
    template: &'c CompiledTemplate,
    node: NodeId,
    out: &'c mut dyn OutputSink,
}

impl CustomCall<'_, '_> {
    /// The directive body, between its braces.
    pub fn contents(&self) -> &str {
        self.template
            .node(self.node)
            .contents(self.template.source())
    }

    /// The body of the closing `@end{...}`, for block-opening nodes.
    pub fn terminus_contents(&self) -> Option<&str> {
        let terminus = self.template.node(self.node).kind.terminus()?;
        Some(self.template.node(terminus).contents(self.template.source()))
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.runtime.lookup(name)
    }

    pub fn evaluate(&mut self, expression: &str) -> TemplateResult<Value> {
        Ok(expr::evaluate_str(expression, &mut *self.runtime)?)
    }

    pub fn write(&mut self, text: &str) -> TemplateResult<()> {
        emit(&mut *self.out, text)
    }

    /// Renders the nested body once in the current scope.
    pub fn render_body(&mut self) -> TemplateResult<()> {
        let nested = self.template.node(self.node).kind.nested();
        self.runtime.exec_chain(self.template, nested, &mut *self.out)
    }

    /// Renders the nested body once, with `bindings` in a fresh scope.
    pub fn render_body_with<I, K>(&mut self, bindings: I) -> TemplateResult<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let frame = bindings.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.runtime.frames.push(frame);
        let result = self.render_body();
        self.runtime.frames.pop();
        result
    }
}

/// Values a `@foreach` binding can walk.
enum LoopSource {
    Items(std::vec::IntoIter<Value>),
    Count(std::ops::Range<i64>),
}

impl LoopSource {
    fn new(value: Value) -> Result<Self, RuntimeErrorKind> {
        match value {
            Value::List(items) => Ok(Self::Items(items.into_iter())),
            Value::Int(count) => Ok(Self::Count(0..count.max(0))),
            other => Err(RuntimeErrorKind::UnsupportedIterable {
                found: other.type_name().to_string(),
            }),
        }
    }
}

impl Iterator for LoopSource {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            Self::Items(items) => items.next(),
            Self::Count(range) => range.next().map(Value::Int),
        }
    }
}

fn compile_include(tpl: &CompiledTemplate, path: &Path) -> TemplateResult<CompiledTemplate> {
    let source = include::read_source(path)?;
    tpl.includes().record_compilation();
    tpl.compiler()
        .compile_with_origin(source, Some(path.to_path_buf()))
}

fn after_block(tpl: &CompiledTemplate, node: &Node) -> Option<NodeId> {
    node.kind.terminus().and_then(|t| tpl.node(t).next)
}

fn locate(tpl: &CompiledTemplate, node: &Node, error: TemplateError) -> TemplateError {
    error.annotate(Position::locate(tpl.source(), node.begin), &node.name)
}

fn emit(out: &mut dyn OutputSink, text: &str) -> TemplateResult<()> {
    if text.is_empty() {
        return Ok(());
    }
    out.append(text).map_err(|e| {
        TemplateError::from(RuntimeErrorKind::Output {
            message: e.to_string(),
        })
    })
}
