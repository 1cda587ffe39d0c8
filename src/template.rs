use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    ast::{Node, NodeArena, NodeId},
    error::TemplateResult,
    include::IncludeCache,
    interface::{OutputSink, TemplateRegistry, Value, VariableResolver},
    parser::{CompileMode, ParsedTemplate, TemplateCompiler},
    runtime::Runtime,
};

/// Maximum nesting of includes and block calls in one render.
pub const DEFAULT_MAX_DEPTH: usize = 64;

static NULL_CONTEXT: Value = Value::Null;

/// A compiled template, ready to render.
///
/// Compiled templates are immutable apart from their include cache and are
/// cheap to clone: clones share the same node arena. They can be rendered
/// from several threads at once.
///
/// # Example
///
/// ```rust
/// use orblate::{TemplateCompiler, Value};
///
/// let template = TemplateCompiler::default()
///     .compile("Hello, @{name}!")
///     .unwrap();
///
/// let context = Value::map([("name", "World")]);
/// assert_eq!(template.render(&context).unwrap(), "Hello, World!");
/// ```
#[derive(Clone)]
pub struct CompiledTemplate {
    inner: Arc<TemplateInner>,
}

struct TemplateInner {
    source: String,
    nodes: NodeArena,
    root: NodeId,
    pure_expression: Option<NodeId>,
    origin: Option<PathBuf>,
    compiler: TemplateCompiler,
    includes: IncludeCache,
}

impl CompiledTemplate {
    pub(crate) fn from_parts(
        source: String,
        parsed: ParsedTemplate,
        origin: Option<PathBuf>,
        compiler: TemplateCompiler,
    ) -> Self {
        Self {
            inner: Arc::new(TemplateInner {
                source,
                nodes: parsed.arena,
                root: parsed.root,
                pure_expression: parsed.pure_expression,
                origin,
                compiler,
                includes: IncludeCache::default(),
            }),
        }
    }

    /// The text this template was compiled from.
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// The file this template was read from, if any.
    pub fn origin(&self) -> Option<&Path> {
        self.inner.origin.as_deref()
    }

    pub fn mode(&self) -> CompileMode {
        self.inner.compiler.mode()
    }

    /// Whether the whole template is a single `@{expr}`; see
    /// [`CompiledTemplate::evaluate`].
    pub fn is_pure_expression(&self) -> bool {
        self.inner.pure_expression.is_some()
    }

    /// How many times an `@include` target has been read and compiled while
    /// rendering this template. Cache hits do not count.
    pub fn include_compilations(&self) -> usize {
        self.inner.includes.compilations()
    }

    /// Number of nodes in the compiled chain, including synthetic terminals.
    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Renders the template against `context`, returning the output.
    ///
    /// Variables are looked up in the template's own scopes first, then as
    /// fields of `context` when it is a map.
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::Runtime` when evaluation fails, for example
    /// when an include target is missing or a loop source is not iterable.
    pub fn render(&self, context: &Value) -> TemplateResult<String> {
        self.renderer().context(context).render_to_string()
    }

    /// Evaluates the template to a value.
    ///
    /// A template consisting of exactly one `@{expr}` yields the raw value of
    /// that expression; any other template yields its rendered text as a
    /// string.
    pub fn evaluate(&self, context: &Value) -> TemplateResult<Value> {
        self.renderer().context(context).evaluate()
    }

    /// Starts a render with more options than [`CompiledTemplate::render`].
    pub fn renderer(&self) -> Renderer<'_> {
        Renderer {
            template: self,
            context: &NULL_CONTEXT,
            resolver: None,
            registry: None,
            base_dir: None,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.inner.nodes[id]
    }

    pub(crate) fn root(&self) -> NodeId {
        self.inner.root
    }

    pub(crate) fn compiler(&self) -> &TemplateCompiler {
        &self.inner.compiler
    }

    pub(crate) fn includes(&self) -> &IncludeCache {
        &self.inner.includes
    }

    fn default_base_dir(&self) -> PathBuf {
        self.origin()
            .and_then(Path::parent)
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }
}

impl fmt::Debug for CompiledTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledTemplate")
            .field("origin", &self.inner.origin)
            .field("mode", &self.mode())
            .field("nodes", &self.inner.nodes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for CompiledTemplate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("CompiledTemplate", 3)?;
        state.serialize_field("source", self.source())?;
        state.serialize_field("mode", &self.mode())?;
        state.serialize_field("origin", &self.inner.origin)?;
        state.end()
    }
}

/// Deserializing recompiles the source. Templates using custom directives
/// cannot be restored this way since extensions are not serialized.
#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for CompiledTemplate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct TemplateHelper {
            source: String,
            #[serde(default)]
            mode: CompileMode,
            #[serde(default)]
            origin: Option<PathBuf>,
        }

        let helper = TemplateHelper::deserialize(deserializer)?;
        TemplateCompiler::new(helper.mode)
            .compile_with_origin(helper.source, helper.origin)
            .map_err(|e| serde::de::Error::custom(format!("Failed to compile template: {e}")))
    }
}

/// Options for a single render of a [`CompiledTemplate`].
///
/// ```rust
/// use orblate::{MapResolver, TemplateCompiler};
///
/// let template = TemplateCompiler::default()
///     .compile("@code{count = count + 1}@{greeting}")
///     .unwrap();
///
/// let mut vars = MapResolver::new();
/// vars.insert("greeting", "hi").insert("count", 1);
///
/// let out = template.renderer().resolver(&mut vars).render_to_string().unwrap();
/// assert_eq!(out, "hi");
/// assert_eq!(vars.get("count"), Some(&orblate::Value::Int(2)));
/// ```
pub struct Renderer<'r> {
    template: &'r CompiledTemplate,
    context: &'r Value,
    resolver: Option<&'r mut dyn VariableResolver>,
    registry: Option<&'r dyn TemplateRegistry>,
    base_dir: Option<PathBuf>,
    max_depth: usize,
}

impl<'r> Renderer<'r> {
    #[must_use]
    pub fn context(mut self, context: &'r Value) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: &'r mut dyn VariableResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Templates available to `@includeNamed`.
    #[must_use]
    pub fn registry(mut self, registry: &'r dyn TemplateRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Directory that top-level relative includes resolve against. Defaults
    /// to the template file's directory, or the working directory.
    #[must_use]
    pub fn base_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn render_to_string(self) -> TemplateResult<String> {
        let mut out = String::new();
        self.render_into(&mut out)?;
        Ok(out)
    }

    /// Streams output into `sink`. On error, whatever was already written
    /// stays in the sink.
    pub fn render_into(self, sink: &mut dyn OutputSink) -> TemplateResult<()> {
        let template = self.template;
        let mut runtime = self.into_runtime();
        runtime.render(template, sink)
    }

    pub fn evaluate(self) -> TemplateResult<Value> {
        let template = self.template;
        match template.inner.pure_expression {
            Some(id) => self.into_runtime().evaluate_node(template, id),
            None => self.render_to_string().map(Value::String),
        }
    }

    fn into_runtime(self) -> Runtime<'r> {
        let base_dir = self
            .base_dir
            .unwrap_or_else(|| self.template.default_base_dir());
        Runtime::new(
            self.context,
            self.resolver,
            self.registry,
            base_dir,
            self.max_depth,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{MapResolver, WriteSink};

    fn compile(source: &str) -> CompiledTemplate {
        TemplateCompiler::default().compile(source).unwrap()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_evaluate_pure_expression() {
        let template = compile("@{[1, 2] + [3]}");
        assert!(template.is_pure_expression());
        assert_eq!(
            template.evaluate(&Value::Null).unwrap(),
            Value::from(vec![1, 2, 3])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_evaluate_mixed_template_yields_text() {
        let template = compile("n=@{1 + 1}");
        assert!(!template.is_pure_expression());
        assert_eq!(
            template.evaluate(&Value::Null).unwrap(),
            Value::from("n=2")
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_render_into_write_sink() {
        let template = compile("@foreach{i : 3}@{i}@end{'-'}");
        let mut sink = WriteSink::new(Vec::new());
        template.renderer().render_into(&mut sink).unwrap();
        assert_eq!(sink.into_inner(), b"0-1-2".to_vec());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_partial_output_is_kept() {
        let template = compile("before @{missing} after");
        let mut out = String::new();
        assert!(template.renderer().render_into(&mut out).is_err());
        assert_eq!(out, "before ");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_context_and_resolver_layering() {
        let template = compile("@{a}@{b}");
        let context = Value::map([("a", "ctx-a"), ("b", "ctx-b")]);
        let mut resolver = MapResolver::new();
        resolver.insert("a", "res-a");
        let out = template
            .renderer()
            .context(&context)
            .resolver(&mut resolver)
            .render_to_string()
            .unwrap();
        assert_eq!(out, "res-actx-b");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_clones_share_nodes() {
        let template = compile("@if{x}y@end{}");
        let clone = template.clone();
        assert!(Arc::ptr_eq(&template.inner, &clone.inner));
        assert_eq!(clone.node_count(), template.node_count());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_compiled_template_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CompiledTemplate>();
    }
}
