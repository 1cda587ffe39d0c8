use std::ops::{Index, IndexMut, Range};

use crate::{
    error::ExprError,
    expr::{self, Environment, Expr},
    extension::CustomNode,
    interface::Value,
    parser::CompileMode,
};

/// Index of a node in its template's arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct NodeId(u32);

impl NodeId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

/// An expression carried by a node: either parsed at compile time or kept as
/// a span of the source and parsed on every evaluation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExprSlot {
    Compiled { span: Range<usize>, expr: Expr },
    Raw { span: Range<usize> },
}

impl ExprSlot {
    pub(crate) fn new(source: &str, span: Range<usize>, mode: CompileMode) -> Result<Self, ExprError> {
        match mode {
            CompileMode::Compiled => {
                let text = source.get(span.clone()).unwrap_or_default();
                let expr = expr::compile(text).map_err(|e| shift_offset(e, span.start))?;
                Ok(Self::Compiled { span, expr })
            }
            CompileMode::Interpreted => Ok(Self::Raw { span }),
        }
    }

    #[cfg(test)]
    pub(crate) fn span(&self) -> Range<usize> {
        match self {
            Self::Compiled { span, .. } | Self::Raw { span } => span.clone(),
        }
    }

    pub(crate) fn evaluate(&self, source: &str, env: &mut dyn Environment) -> Result<Value, ExprError> {
        match self {
            Self::Compiled { expr, .. } => expr.evaluate(env),
            Self::Raw { span } => {
                let text = source.get(span.clone()).unwrap_or_default();
                expr::evaluate_str(text, env).map_err(|e| shift_offset(e, span.start))
            }
        }
    }
}

/// Makes expression syntax offsets absolute within the template source.
fn shift_offset(error: ExprError, base: usize) -> ExprError {
    match error {
        ExprError::Syntax { offset, message } => ExprError::Syntax {
            offset: offset.saturating_add(base),
            message,
        },
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LoopBinding {
    pub variable: String,
    pub source: ExprSlot,
}

#[derive(Debug)]
pub(crate) enum NodeKind {
    /// Literal text. Several spans when escapes or comments split a run.
    Text { spans: Vec<Range<usize>> },
    /// `@{expr}`
    Expression { expr: ExprSlot },
    /// `@if{cond}`, `@elseif{cond}` or `@else{}` (no condition).
    If {
        condition: Option<ExprSlot>,
        nested: Option<NodeId>,
        alternative: Option<NodeId>,
        terminus: Option<NodeId>,
    },
    /// `@foreach{var : source, ...}`
    ForEach {
        bindings: Vec<LoopBinding>,
        nested: Option<NodeId>,
        separator: Option<ExprSlot>,
        terminus: Option<NodeId>,
    },
    /// `@include{path; pre}`
    Include {
        path: ExprSlot,
        pre: Option<ExprSlot>,
    },
    /// `@includeNamed{name; pre}`
    NamedInclude {
        name: ExprSlot,
        pre: Option<ExprSlot>,
    },
    /// `@code{expr}` - evaluated for side effects only.
    Code { expr: ExprSlot },
    /// `@eval{expr}` - evaluated and emitted.
    Eval { expr: ExprSlot },
    /// `@declare{name}`
    Declare {
        name: ExprSlot,
        nested: Option<NodeId>,
        terminus: Option<NodeId>,
    },
    Comment,
    /// Synthetic block close produced at `@end` (and between `@if` branches).
    Terminal,
    End,
    Custom {
        node: Box<dyn CustomNode>,
        block: bool,
        nested: Option<NodeId>,
        terminus: Option<NodeId>,
    },
}

impl NodeKind {
    pub(crate) const fn is_block_opening(&self) -> bool {
        match self {
            Self::If { .. } | Self::ForEach { .. } | Self::Declare { .. } => true,
            Self::Custom { block, .. } => *block,
            Self::Text { .. }
            | Self::Expression { .. }
            | Self::Include { .. }
            | Self::NamedInclude { .. }
            | Self::Code { .. }
            | Self::Eval { .. }
            | Self::Comment
            | Self::Terminal
            | Self::End => false,
        }
    }

    pub(crate) const fn terminus(&self) -> Option<NodeId> {
        match self {
            Self::If { terminus, .. }
            | Self::ForEach { terminus, .. }
            | Self::Declare { terminus, .. }
            | Self::Custom { terminus, .. } => *terminus,
            Self::Text { .. }
            | Self::Expression { .. }
            | Self::Include { .. }
            | Self::NamedInclude { .. }
            | Self::Code { .. }
            | Self::Eval { .. }
            | Self::Comment
            | Self::Terminal
            | Self::End => None,
        }
    }

    pub(crate) const fn nested(&self) -> Option<NodeId> {
        match self {
            Self::If { nested, .. }
            | Self::ForEach { nested, .. }
            | Self::Declare { nested, .. }
            | Self::Custom { nested, .. } => *nested,
            Self::Text { .. }
            | Self::Expression { .. }
            | Self::Include { .. }
            | Self::NamedInclude { .. }
            | Self::Code { .. }
            | Self::Eval { .. }
            | Self::Comment
            | Self::Terminal
            | Self::End => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    /// Span of the whole node in the source.
    pub begin: usize,
    pub end: usize,
    /// Directive keyword; empty for text and bare expressions.
    pub name: String,
    /// Span of the directive body between its braces.
    pub c_start: usize,
    pub c_end: usize,
    pub next: Option<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub(crate) fn contents<'s>(&self, source: &'s str) -> &'s str {
        source.get(self.c_start..self.c_end).unwrap_or_default()
    }
}

/// Owns every node of a template. `next`, `nested` and `terminus` links are
/// indices into this arena.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub(crate) fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(node);
        id
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (NodeId(u32::try_from(idx).unwrap_or(u32::MAX)), node))
    }

    /// Finalises a block-opening node against the node that closes its body.
    ///
    /// Whatever was chained after `open` becomes its nested body (empty when
    /// the closer follows immediately) and `open.next` jumps to the closer.
    /// The node's own terminus is assigned separately, once the whole block
    /// (including any `@else` branches) has ended.
    pub(crate) fn demarcate(&mut self, open: NodeId, closer: NodeId) {
        let node = &mut self[open];
        let body = node.next.filter(|first| *first != closer);
        node.next = Some(closer);
        match &mut node.kind {
            NodeKind::If { nested, .. }
            | NodeKind::ForEach { nested, .. }
            | NodeKind::Declare { nested, .. }
            | NodeKind::Custom { nested, .. } => *nested = body,
            NodeKind::Text { .. }
            | NodeKind::Expression { .. }
            | NodeKind::Include { .. }
            | NodeKind::NamedInclude { .. }
            | NodeKind::Code { .. }
            | NodeKind::Eval { .. }
            | NodeKind::Comment
            | NodeKind::Terminal
            | NodeKind::End => {}
        }
    }

    pub(crate) fn set_terminus(&mut self, open: NodeId, closer: NodeId) {
        match &mut self[open].kind {
            NodeKind::If { terminus, .. }
            | NodeKind::ForEach { terminus, .. }
            | NodeKind::Declare { terminus, .. }
            | NodeKind::Custom { terminus, .. } => *terminus = Some(closer),
            NodeKind::Text { .. }
            | NodeKind::Expression { .. }
            | NodeKind::Include { .. }
            | NodeKind::NamedInclude { .. }
            | NodeKind::Code { .. }
            | NodeKind::Eval { .. }
            | NodeKind::Comment
            | NodeKind::Terminal
            | NodeKind::End => {}
        }
    }
}

impl Index<NodeId> for NodeArena {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }
}

impl IndexMut<NodeId> for NodeArena {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }
}
