use std::{
    io::Read,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    ast::{ExprSlot, LoopBinding, Node, NodeArena, NodeId, NodeKind},
    error::{CompileError, CompileErrorKind, Position, TemplateError, TemplateResult},
    extension::ExtensionRegistry,
    scanner::{Scanner, split_top_level, trim_range},
    template::CompiledTemplate,
};

type ParseResult<T> = Result<T, CompileError>;

/// Selects when directive expressions are parsed.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum CompileMode {
    /// Expressions are parsed once, while the template compiles.
    #[default]
    Compiled,
    /// Expressions are kept as source text and parsed on every evaluation.
    Interpreted,
}

/// Compiles template source into a [`CompiledTemplate`].
///
/// # Example
///
/// ```
/// use orblate::{CompileMode, TemplateCompiler, Value};
///
/// let compiler = TemplateCompiler::new(CompileMode::Interpreted);
/// let template = compiler.compile("@foreach{n : 3}@{n}@end{', '}").unwrap();
/// assert_eq!(template.render(&Value::Null).unwrap(), "0, 1, 2");
/// ```
#[derive(Debug, Clone, Default)]
pub struct TemplateCompiler {
    mode: CompileMode,
    extensions: Arc<ExtensionRegistry>,
}

impl TemplateCompiler {
    pub fn new(mode: CompileMode) -> Self {
        Self {
            mode,
            extensions: Arc::default(),
        }
    }

    /// Makes custom directive kinds available to templates compiled by this
    /// compiler (and to anything they include).
    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = Arc::new(extensions);
        self
    }

    pub const fn mode(&self) -> CompileMode {
        self.mode
    }

    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    /// Compiles template text held in memory.
    ///
    /// # Errors
    /// Returns [`TemplateError::Compile`] for malformed templates, including
    /// custom directives whose factory rejects the body.
    pub fn compile<S: Into<String>>(&self, source: S) -> TemplateResult<CompiledTemplate> {
        self.compile_with_origin(source.into(), None)
    }

    /// Reads the whole stream, then compiles it.
    pub fn compile_reader<R: Read>(&self, mut reader: R) -> TemplateResult<CompiledTemplate> {
        let mut source = String::new();
        reader
            .read_to_string(&mut source)
            .map_err(|e| TemplateError::Io {
                path: None,
                message: e.to_string(),
            })?;
        self.compile(source)
    }

    /// Compiles a template file. Relative includes inside it resolve against
    /// the file's directory.
    pub fn compile_file<P: AsRef<Path>>(&self, path: P) -> TemplateResult<CompiledTemplate> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| TemplateError::Io {
            path: Some(path.to_path_buf()),
            message: e.to_string(),
        })?;
        self.compile_with_origin(source, Some(path.to_path_buf()))
    }

    pub(crate) fn compile_with_origin(
        &self,
        source: String,
        origin: Option<PathBuf>,
    ) -> TemplateResult<CompiledTemplate> {
        let parsed = Parser::new(&source, self).parse().map_err(|mut err| {
            err.path.clone_from(&origin);
            err
        })?;
        tracing::debug!(
            nodes = parsed.arena.len(),
            mode = ?self.mode,
            origin = ?origin,
            pure_expression = parsed.pure_expression.is_some(),
            "compiled template"
        );
        Ok(CompiledTemplate::from_parts(
            source,
            parsed,
            origin,
            self.clone(),
        ))
    }
}

#[derive(Debug)]
pub(crate) struct ParsedTemplate {
    pub arena: NodeArena,
    pub root: NodeId,
    /// Set when the whole template is a single `@{expr}`.
    pub pure_expression: Option<NodeId>,
}

/// A block-opening directive waiting for its `@end`.
struct OpenBlock {
    name: String,
    position: Position,
    /// The opener followed by any `@else`/`@elseif` branches chained to it.
    branches: Vec<NodeId>,
}

struct Parser<'a> {
    input: &'a str,
    scanner: Scanner<'a>,
    compiler: &'a TemplateCompiler,
    arena: NodeArena,
    root: Option<NodeId>,
    tail: Option<NodeId>,
    stack: Vec<OpenBlock>,
    /// Literal spans not yet emitted as a text node.
    pending_text: Vec<Range<usize>>,
    /// Comments seen while text was pending; linked after that text.
    deferred_comments: Vec<Node>,
    /// End of the last span consumed as text or directive.
    last_text_end: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, compiler: &'a TemplateCompiler) -> Self {
        Parser {
            input,
            scanner: Scanner::new(input),
            compiler,
            arena: NodeArena::default(),
            root: None,
            tail: None,
            stack: Vec::new(),
            pending_text: Vec::new(),
            deferred_comments: Vec::new(),
            last_text_end: 0,
        }
    }

    #[inline]
    fn make_error(position: Position, directive: &str, kind: CompileErrorKind) -> CompileError {
        CompileError::new(position, Some(directive), kind)
    }

    fn parse(mut self) -> ParseResult<ParsedTemplate> {
        while !self.scanner.eof() {
            let at = self.scanner.pos();

            if self.scanner.at_escaped_sigil() {
                // Keep the first sigil as text, drop the second.
                self.push_text(self.last_text_end..at.saturating_add(1));
                self.scanner.advance();
                self.scanner.advance();
                self.last_text_end = self.scanner.pos();
                continue;
            }

            if self.scanner.at_directive_start() {
                self.push_text(self.last_text_end..at);
                let position = self.scanner.position();
                self.scanner.advance(); // sigil
                let name = self.scanner.capture_identifier();
                self.scanner.advance(); // '{'
                let body = self
                    .scanner
                    .capture_balanced(b'{')
                    .map_err(|kind| Self::make_error(position, name, kind))?;
                let span = at..self.scanner.pos();
                self.last_text_end = span.end;
                tracing::trace!(directive = name, line = position.line, "directive");
                self.directive(name, position, span, body)?;
                continue;
            }

            self.scanner.advance();
        }

        self.push_text(self.last_text_end..self.input.len());

        if let Some(open) = self.stack.last() {
            return Err(Self::make_error(
                open.position,
                &open.name,
                CompileErrorKind::UnclosedBlock {
                    name: open.name.clone(),
                },
            ));
        }

        self.flush_text();
        let len = self.input.len();
        let end = self.append(Node {
            begin: len,
            end: len,
            name: String::new(),
            c_start: len,
            c_end: len,
            next: None,
            kind: NodeKind::End,
        });
        let root = self.root.unwrap_or(end);

        let root_node = &self.arena[root];
        let pure_expression = (self.arena.len() == 2
            && matches!(root_node.kind, NodeKind::Expression { .. })
            && root_node.begin == 0
            && root_node.end == len)
            .then_some(root);

        Ok(ParsedTemplate {
            arena: self.arena,
            root,
            pure_expression,
        })
    }

    fn directive(
        &mut self,
        name: &str,
        position: Position,
        span: Range<usize>,
        body: Range<usize>,
    ) -> ParseResult<()> {
        let node = |kind| Node {
            begin: span.start,
            end: span.end,
            name: name.to_string(),
            c_start: body.start,
            c_end: body.end,
            next: None,
            kind,
        };

        match name {
            "if" => {
                let condition = self.slot(position, name, body.clone())?;
                self.open(
                    node(NodeKind::If {
                        condition: Some(condition),
                        nested: None,
                        alternative: None,
                        terminus: None,
                    }),
                    position,
                );
            }
            "else" | "elseif" => self.else_branch(name, position, span.clone(), body.clone())?,
            "end" => self.end_block(position, span.clone(), body.clone())?,
            "foreach" => {
                let bindings = self.loop_bindings(position, body.clone())?;
                self.open(
                    node(NodeKind::ForEach {
                        bindings,
                        nested: None,
                        separator: None,
                        terminus: None,
                    }),
                    position,
                );
            }
            "declare" => {
                let declared = self.slot(position, name, body.clone())?;
                self.open(
                    node(NodeKind::Declare {
                        name: declared,
                        nested: None,
                        terminus: None,
                    }),
                    position,
                );
            }
            "include" | "includeNamed" => {
                let (target, pre) = self.target_and_pre(position, name, body.clone())?;
                let kind = if name == "include" {
                    NodeKind::Include { path: target, pre }
                } else {
                    NodeKind::NamedInclude { name: target, pre }
                };
                self.flush_text();
                self.append(node(kind));
            }
            "" | "code" | "eval" => {
                let expr = self.slot(position, name, body.clone())?;
                let kind = match name {
                    "code" => NodeKind::Code { expr },
                    "eval" => NodeKind::Eval { expr },
                    _ => NodeKind::Expression { expr },
                };
                self.flush_text();
                self.append(node(kind));
            }
            "comment" => {
                let comment = node(NodeKind::Comment);
                if self.pending_text.is_empty() {
                    self.append(comment);
                } else {
                    self.deferred_comments.push(comment);
                }
            }
            custom => {
                let compiler = self.compiler;
                let Some(factory) = compiler.extensions.get(custom) else {
                    return Err(Self::make_error(
                        position,
                        custom,
                        CompileErrorKind::UnknownDirective {
                            name: custom.to_string(),
                        },
                    ));
                };
                let contents = self.input.get(body.clone()).unwrap_or_default();
                let custom_node = (**factory)(contents).map_err(|message| {
                    Self::make_error(
                        position,
                        custom,
                        CompileErrorKind::Extension {
                            name: custom.to_string(),
                            message,
                        },
                    )
                })?;
                let block = custom_node.is_block_opening();
                let custom_node = node(NodeKind::Custom {
                    node: custom_node,
                    block,
                    nested: None,
                    terminus: None,
                });
                if block {
                    self.open(custom_node, position);
                } else {
                    self.flush_text();
                    self.append(custom_node);
                }
            }
        }

        Ok(())
    }

    fn else_branch(
        &mut self,
        name: &str,
        position: Position,
        span: Range<usize>,
        body: Range<usize>,
    ) -> ParseResult<()> {
        let unexpected = || {
            Self::make_error(
                position,
                name,
                CompileErrorKind::UnexpectedElse {
                    name: name.to_string(),
                },
            )
        };

        let current = self
            .stack
            .last()
            .and_then(|open| open.branches.last().copied())
            .ok_or_else(unexpected)?;
        // Only an `@if` (or a conditional branch of one) may continue with `@else`.
        if !matches!(
            self.arena[current].kind,
            NodeKind::If {
                condition: Some(_),
                ..
            }
        ) {
            return Err(unexpected());
        }

        let condition = if name == "else" && trim_range(self.input, body.clone()).is_empty() {
            None
        } else {
            Some(self.slot(position, name, body.clone())?)
        };

        self.flush_text();
        let closer = self.append(Node {
            begin: span.start,
            end: span.end,
            name: name.to_string(),
            c_start: body.start,
            c_end: body.end,
            next: None,
            kind: NodeKind::Terminal,
        });
        self.arena.demarcate(current, closer);

        let branch = self.append(Node {
            begin: span.start,
            end: span.end,
            name: name.to_string(),
            c_start: body.start,
            c_end: body.end,
            next: None,
            kind: NodeKind::If {
                condition,
                nested: None,
                alternative: None,
                terminus: None,
            },
        });
        if let NodeKind::If { alternative, .. } = &mut self.arena[current].kind {
            *alternative = Some(branch);
        }
        if let Some(open) = self.stack.last_mut() {
            open.branches.push(branch);
        }
        Ok(())
    }

    fn end_block(&mut self, position: Position, span: Range<usize>, body: Range<usize>) -> ParseResult<()> {
        let Some(open) = self.stack.pop() else {
            return Err(Self::make_error(
                position,
                "end",
                CompileErrorKind::UnexpectedEnd,
            ));
        };

        self.flush_text();
        let terminus = self.append(Node {
            begin: span.start,
            end: span.end,
            name: "end".to_string(),
            c_start: body.start,
            c_end: body.end,
            next: None,
            kind: NodeKind::Terminal,
        });

        if let Some(last) = open.branches.last() {
            self.arena.demarcate(*last, terminus);
        }

        // The `@end` body of a loop is its separator expression.
        if let Some(opener) = open.branches.first().copied() {
            let is_loop = matches!(self.arena[opener].kind, NodeKind::ForEach { .. });
            if is_loop && !trim_range(self.input, body.clone()).is_empty() {
                let slot = self.slot(position, "end", body)?;
                if let NodeKind::ForEach { separator, .. } = &mut self.arena[opener].kind {
                    *separator = Some(slot);
                }
            }
        }

        for branch in open.branches {
            self.arena.set_terminus(branch, terminus);
        }
        Ok(())
    }

    /// Parses `var : source, var2 : source2`.
    fn loop_bindings(&self, position: Position, body: Range<usize>) -> ParseResult<Vec<LoopBinding>> {
        let malformed = |reason: String| {
            Self::make_error(
                position,
                "foreach",
                CompileErrorKind::MalformedForEach { reason },
            )
        };

        if trim_range(self.input, body.clone()).is_empty() {
            return Err(malformed(
                "expected at least one 'variable : source' binding".to_string(),
            ));
        }

        let mut bindings = Vec::new();
        for part in split_top_level(self.input, body, b',') {
            let text = self.input.get(part.clone()).unwrap_or_default().trim();
            let pieces = split_top_level(self.input, part, b':');
            let [variable, source] = pieces.as_slice() else {
                return Err(malformed(format!("expected exactly one ':' in '{text}'")));
            };

            let variable = self
                .input
                .get(trim_range(self.input, variable.clone()))
                .unwrap_or_default();
            let valid = variable
                .chars()
                .next()
                .is_some_and(|c| c.is_alphabetic() || c == '_')
                && variable.chars().all(|c| c.is_alphanumeric() || c == '_');
            if !valid {
                return Err(malformed(format!("invalid loop variable '{variable}'")));
            }

            let source = trim_range(self.input, source.clone());
            if source.is_empty() {
                return Err(malformed(format!(
                    "missing source expression for '{variable}'"
                )));
            }

            bindings.push(LoopBinding {
                variable: variable.to_string(),
                source: self.slot(position, "foreach", source)?,
            });
        }
        Ok(bindings)
    }

    /// Splits `target; pre` at the first top-level `;`.
    fn target_and_pre(
        &self,
        position: Position,
        name: &str,
        body: Range<usize>,
    ) -> ParseResult<(ExprSlot, Option<ExprSlot>)> {
        let parts = split_top_level(self.input, body.clone(), b';');
        let target = parts.first().cloned().unwrap_or_else(|| body.clone());
        let pre = parts
            .get(1)
            .map(|second| second.start..body.end)
            .filter(|pre| !trim_range(self.input, pre.clone()).is_empty());

        let target = self.slot(position, name, target)?;
        let pre = pre.map(|pre| self.slot(position, name, pre)).transpose()?;
        Ok((target, pre))
    }

    fn slot(&self, position: Position, directive: &str, span: Range<usize>) -> ParseResult<ExprSlot> {
        let span = trim_range(self.input, span);
        ExprSlot::new(self.input, span, self.compiler.mode).map_err(|e| {
            Self::make_error(
                position,
                directive,
                CompileErrorKind::Expression {
                    message: e.to_string(),
                },
            )
        })
    }

    fn open(&mut self, node: Node, position: Position) {
        debug_assert!(node.kind.is_block_opening());
        self.flush_text();
        let name = node.name.clone();
        let id = self.append(node);
        self.stack.push(OpenBlock {
            name,
            position,
            branches: vec![id],
        });
    }

    fn append(&mut self, node: Node) -> NodeId {
        let id = self.arena.push(node);
        if let Some(tail) = self.tail {
            self.arena[tail].next = Some(id);
        }
        if self.root.is_none() {
            self.root = Some(id);
        }
        self.tail = Some(id);
        id
    }

    fn push_text(&mut self, span: Range<usize>) {
        if span.is_empty() {
            return;
        }
        match self.pending_text.last_mut() {
            Some(last) if last.end == span.start => last.end = span.end,
            _ => self.pending_text.push(span),
        }
    }

    /// Emits pending literal spans as one text node, followed by any
    /// comments that were seen between them.
    fn flush_text(&mut self) {
        if let (Some(first), Some(last)) = (self.pending_text.first(), self.pending_text.last()) {
            let (begin, end) = (first.start, last.end);
            let spans = std::mem::take(&mut self.pending_text);
            self.append(Node {
                begin,
                end,
                name: String::new(),
                c_start: begin,
                c_end: end,
                next: None,
                kind: NodeKind::Text { spans },
            });
        }
        for comment in std::mem::take(&mut self.deferred_comments) {
            self.append(comment);
        }
    }
}

/// Tests for the compiler's node chains.
#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> ParseResult<ParsedTemplate> {
        let compiler = TemplateCompiler::default();
        Parser::new(source, &compiler).parse()
    }

    fn parse_err(source: &str) -> CompileError {
        match parse(source) {
            Ok(_) => panic!("expected a compile error for {source:?}"),
            Err(err) => err,
        }
    }

    /// Follows `next` from the root and returns (name, kind tag) pairs.
    fn chain(parsed: &ParsedTemplate) -> Vec<(String, &'static str)> {
        let mut out = Vec::new();
        let mut cursor = Some(parsed.root);
        while let Some(id) = cursor {
            let node = &parsed.arena[id];
            out.push((node.name.clone(), tag(&node.kind)));
            cursor = node.next;
        }
        out
    }

    fn tag(kind: &NodeKind) -> &'static str {
        match kind {
            NodeKind::Text { .. } => "text",
            NodeKind::Expression { .. } => "expr",
            NodeKind::If { .. } => "if",
            NodeKind::ForEach { .. } => "foreach",
            NodeKind::Include { .. } => "include",
            NodeKind::NamedInclude { .. } => "include_named",
            NodeKind::Code { .. } => "code",
            NodeKind::Eval { .. } => "eval",
            NodeKind::Declare { .. } => "declare",
            NodeKind::Comment => "comment",
            NodeKind::Terminal => "terminal",
            NodeKind::End => "end",
            NodeKind::Custom { .. } => "custom",
        }
    }

    fn text_spans<'s>(parsed: &ParsedTemplate, source: &'s str) -> Vec<&'s str> {
        match &parsed.arena[parsed.root].kind {
            NodeKind::Text { spans } => spans.iter().map(|s| &source[s.clone()]).collect(),
            other => panic!("expected a text root, got {}", tag(other)),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_input() {
        let parsed = parse("").unwrap();
        assert_eq!(chain(&parsed), vec![(String::new(), "end")]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_plain_text() {
        let source = "hello @ world $ and a@b.com";
        let parsed = parse(source).unwrap();
        assert_eq!(chain(&parsed).len(), 2);
        assert_eq!(text_spans(&parsed, source), vec![source]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_expression_between_text() {
        let parsed = parse("Hello @{name}!").unwrap();
        let tags: Vec<_> = chain(&parsed).into_iter().map(|(_, t)| t).collect();
        assert_eq!(tags, vec!["text", "expr", "text", "end"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_pure_expression_detected() {
        assert!(parse("@{a + b}").unwrap().pure_expression.is_some());
        assert!(parse("@{a} ").unwrap().pure_expression.is_none());
        assert!(parse("x").unwrap().pure_expression.is_none());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comment_coalesces_text() {
        let source = "abc@comment{ ignored }def";
        let parsed = parse(source).unwrap();
        let tags: Vec<_> = chain(&parsed).into_iter().map(|(_, t)| t).collect();
        assert_eq!(tags, vec!["text", "comment", "end"]);
        assert_eq!(text_spans(&parsed, source), vec!["abc", "def"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_escaped_sigil_splits_spans() {
        let source = "mail @@if{x} here";
        let parsed = parse(source).unwrap();
        assert_eq!(chain(&parsed).len(), 2);
        assert_eq!(text_spans(&parsed, source), vec!["mail @", "if{x} here"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_if_demarcation() {
        let parsed = parse("@if{a}yes@end{}after").unwrap();
        let root = &parsed.arena[parsed.root];
        let NodeKind::If {
            nested,
            alternative,
            terminus,
            ..
        } = &root.kind
        else {
            panic!("expected if");
        };
        assert!(alternative.is_none());
        let terminus = terminus.unwrap();
        assert_eq!(root.next, Some(terminus));
        let body = &parsed.arena[nested.unwrap()];
        assert!(matches!(body.kind, NodeKind::Text { .. }));
        assert_eq!(body.next, Some(terminus));
        let after = &parsed.arena[parsed.arena[terminus].next.unwrap()];
        assert!(matches!(after.kind, NodeKind::Text { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_else_branches_share_terminus() {
        let parsed = parse("@if{a}A@elseif{b}B@else{}C@end{}").unwrap();
        let first = &parsed.arena[parsed.root];
        let NodeKind::If {
            alternative: Some(second_id),
            terminus: Some(first_terminus),
            ..
        } = first.kind
        else {
            panic!("expected if with alternative");
        };
        let NodeKind::If {
            alternative: Some(third_id),
            terminus: Some(second_terminus),
            condition: Some(_),
            ..
        } = parsed.arena[second_id].kind
        else {
            panic!("expected elseif");
        };
        let NodeKind::If {
            alternative: None,
            terminus: Some(third_terminus),
            condition: None,
            ..
        } = parsed.arena[third_id].kind
        else {
            panic!("expected else");
        };
        assert_eq!(first_terminus, second_terminus);
        assert_eq!(second_terminus, third_terminus);
        assert_eq!(parsed.arena[first_terminus].name, "end");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_empty_block_has_no_nested() {
        let parsed = parse("@foreach{x : xs}@end{}").unwrap();
        assert_eq!(parsed.arena[parsed.root].kind.nested(), None);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_foreach_bindings_and_separator() {
        let parsed = parse("@foreach{a : [1, 2], b : 'x:y'}@{a}@end{', '}").unwrap();
        let NodeKind::ForEach {
            bindings,
            separator,
            ..
        } = &parsed.arena[parsed.root].kind
        else {
            panic!("expected foreach");
        };
        let names: Vec<_> = bindings.iter().map(|b| b.variable.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(separator.is_some());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_offsets_are_monotonic() {
        let parsed = parse("a@comment{c}b@if{x}@{y}@end{}c@code{z = 1}d").unwrap();
        let mut last = 0;
        for (_, node) in parsed.arena.iter() {
            assert!(node.begin >= last, "offsets must not go backwards");
            last = node.begin;
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_blocks_balance() {
        assert!(parse("@if{a}@foreach{x : xs}@if{x}@{x}@end{}@end{}@end{}").is_ok());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unclosed_block() {
        let err = parse("line\n  @foreach{x : xs}@if{x}@end{}").unwrap_err();
        assert_eq!(
            err.kind,
            CompileErrorKind::UnclosedBlock {
                name: "foreach".to_string()
            }
        );
        assert_eq!((err.line, err.column), (2, 3));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unexpected_end() {
        let err = parse_err("text@end{}");
        assert_eq!(err.kind, CompileErrorKind::UnexpectedEnd);
        assert_eq!(err.offset, 4);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_else_without_if() {
        let err = parse_err("@foreach{x : xs}@else{}@end{}");
        assert!(matches!(err.kind, CompileErrorKind::UnexpectedElse { .. }));
        let err = parse_err("@if{a}@else{}@else{}@end{}");
        assert!(matches!(err.kind, CompileErrorKind::UnexpectedElse { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_directive() {
        let err = parse_err("x @frobnicate{1}");
        assert_eq!(
            err.kind,
            CompileErrorKind::UnknownDirective {
                name: "frobnicate".to_string()
            }
        );
        assert_eq!(err.directive.as_deref(), Some("frobnicate"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unterminated_capture_reports_opening() {
        let err = parse_err("ab\ncd @if{ (a\n\n\n");
        assert!(matches!(
            err.kind,
            CompileErrorKind::UnterminatedCapture { .. }
        ));
        assert_eq!((err.line, err.column), (2, 4));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_malformed_foreach() {
        for header in ["", "x", "x : a : b", "1x : xs", "x : ", "x : xs,"] {
            let err = parse_err(&format!("@foreach{{{header}}}@end{{}}"));
            assert!(
                matches!(err.kind, CompileErrorKind::MalformedForEach { .. }),
                "header {header:?} gave {err:?}"
            );
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_compiled_mode_rejects_bad_expression() {
        let err = parse_err("@{1 +}");
        assert!(matches!(err.kind, CompileErrorKind::Expression { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_interpreted_mode_defers_bad_expression() {
        let compiler = TemplateCompiler::new(CompileMode::Interpreted);
        assert!(Parser::new("@{1 +}", &compiler).parse().is_ok());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_compile_reader() {
        let compiler = TemplateCompiler::default();
        let template = compiler
            .compile_reader(std::io::Cursor::new(b"n=@{1 + 2}".to_vec()))
            .unwrap();
        assert_eq!(template.source(), "n=@{1 + 2}");
        assert_eq!(template.origin(), None);
        assert_eq!(
            template.render(&crate::interface::Value::Null).unwrap(),
            compiler.compile("n=@{1 + 2}").unwrap().render(&crate::interface::Value::Null).unwrap()
        );

        let err = compiler
            .compile_reader(std::io::Cursor::new(&[0xff_u8][..]))
            .unwrap_err();
        assert!(matches!(err, TemplateError::Io { path: None, .. }), "got {err:?}");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_compile_file_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tpl");
        std::fs::write(&path, "fine\n@foreach{x}").unwrap();
        let Err(TemplateError::Compile(err)) = TemplateCompiler::default().compile_file(&path) else {
            panic!("expected compile error");
        };
        assert_eq!(err.path.as_deref(), Some(path.as_path()));
        assert_eq!(err.line, 2);
        assert!(err.to_string().contains("broken.tpl"));

        let Err(TemplateError::Compile(err)) = TemplateCompiler::default().compile("@end{}") else {
            panic!("expected compile error");
        };
        assert_eq!(err.path, None);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_include_pre_expression() {
        let source = "@include{'a.tpl'; x = 1; y = 2}";
        let parsed = parse(source).unwrap();
        let NodeKind::Include { path, pre } = &parsed.arena[parsed.root].kind else {
            panic!("expected include");
        };
        assert_eq!(&source[path.span()], "'a.tpl'");
        assert_eq!(&source[pre.as_ref().unwrap().span()], "x = 1; y = 2");
    }
}
