use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::{
    error::{TemplateError, TemplateResult},
    extension::{CustomNode, ExtensionRegistry},
    interface::{TemplateRegistry, Value, VariableResolver},
    parser::{CompileMode, TemplateCompiler},
    template::{CompiledTemplate, DEFAULT_MAX_DEPTH, Renderer},
};

/// Settings shared by every template an engine compiles and renders.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineConfig {
    pub mode: CompileMode,
    /// Maximum nesting of includes and block calls.
    pub max_depth: usize,
    /// Base directory for relative includes in templates that were not
    /// loaded from a file.
    pub base_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: CompileMode::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            base_dir: None,
        }
    }
}

/// `TemplateEngine` keeps a set of named templates that can be rendered by
/// name and included from each other with `@includeNamed`.
///
/// # Examples
///
/// ```
/// use orblate::{TemplateEngine, Value};
///
/// // Create a new engine
/// let mut engine = TemplateEngine::new();
///
/// // Add templates
/// engine.add_template("item", "<li>@{item}</li>").unwrap();
/// engine
///     .add_template("list", "<ul>@foreach{item : items}@includeNamed{'item'}@end{}</ul>")
///     .unwrap();
///
/// // Render
/// let context = Value::map([("items", vec!["a", "b"])]);
/// let output = engine.render("list", Some(&context)).unwrap();
/// assert_eq!(output, "<ul><li>a</li><li>b</li></ul>");
/// ```
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    config: EngineConfig,
    templates: HashMap<String, CompiledTemplate>,
    #[cfg_attr(feature = "serde", serde(skip))]
    extensions: ExtensionRegistry,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Makes a custom directive available to templates added afterwards.
    pub fn register_extension<N, F>(&mut self, name: N, factory: F) -> &mut Self
    where
        N: Into<String>,
        F: Fn(&str) -> Result<Box<dyn CustomNode>, String> + Send + Sync + 'static,
    {
        self.extensions.register(name, factory);
        self
    }

    /// The compiler this engine uses for new templates.
    pub fn compiler(&self) -> TemplateCompiler {
        TemplateCompiler::new(self.config.mode).with_extensions(self.extensions.clone())
    }

    /// Compiles a template without registering it.
    pub fn compile<S: Into<String>>(&self, source: S) -> TemplateResult<CompiledTemplate> {
        self.compiler().compile(source)
    }

    /// Adds a new template to the engine under the given name.
    ///
    /// # Arguments
    ///
    /// * `name` - The name to register the template under
    /// * `source` - The template source
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the template was compiled and added
    /// * `Err(TemplateError::TemplateExists)` if a template with the same name already exists
    /// * `Err(TemplateError::Compile)` if the template is malformed
    ///
    /// # Examples
    ///
    /// ```
    /// use orblate::TemplateEngine;
    ///
    /// let mut engine = TemplateEngine::new();
    /// engine.add_template("greeting", "Hello, @{name}!").unwrap();
    /// assert!(engine.add_template("greeting", "Hi").is_err());
    /// ```
    pub fn add_template<N: AsRef<str>, S: Into<String>>(&mut self, name: N, source: S) -> TemplateResult<()> {
        let name = self.check_free(name.as_ref())?;
        let template = self.compile(source)?;
        tracing::debug!(name = %name, "added template");
        self.templates.insert(name, template);
        Ok(())
    }

    /// Reads and adds a template file. Relative `@include`s inside it
    /// resolve against the file's directory.
    pub fn add_template_file<N: AsRef<str>, P: AsRef<Path>>(&mut self, name: N, path: P) -> TemplateResult<()> {
        let name = self.check_free(name.as_ref())?;
        let template = self.compiler().compile_file(path)?;
        tracing::debug!(name = %name, origin = ?template.origin(), "added template file");
        self.templates.insert(name, template);
        Ok(())
    }

    pub fn get<N: AsRef<str>>(&self, name: N) -> Option<&CompiledTemplate> {
        self.templates.get(name.as_ref())
    }

    pub fn contains<N: AsRef<str>>(&self, name: N) -> bool {
        self.templates.contains_key(name.as_ref())
    }

    /// Removes a template, returning it if it was present.
    pub fn remove<N: AsRef<str>>(&mut self, name: N) -> Option<CompiledTemplate> {
        self.templates.remove(name.as_ref())
    }

    pub fn template_names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Renders a template with the given name using the provided context.
    ///
    /// # Arguments
    ///
    /// * `template_name` - The name of the template to render
    /// * `context` - Optional context whose map fields are visible as variables
    ///
    /// # Returns
    ///
    /// * `Ok(String)` containing the rendered template content
    /// * `Err(TemplateError::MissingTemplate)` if no template with the given name exists
    /// * Other errors may be returned from the rendering process (missing variables, unreadable includes, etc.)
    pub fn render<N: AsRef<str>>(&self, template_name: N, context: Option<&Value>) -> TemplateResult<String> {
        self.renderer(template_name.as_ref(), context)?
            .render_to_string()
    }

    /// Like [`TemplateEngine::render`], with a resolver layered between the
    /// template's scopes and the context. Top-level assignments made by the
    /// template go to the resolver when it accepts them.
    pub fn render_with_resolver<N: AsRef<str>>(
        &self,
        template_name: N,
        context: Option<&Value>,
        resolver: &mut dyn VariableResolver,
    ) -> TemplateResult<String> {
        self.renderer(template_name.as_ref(), context)?
            .resolver(resolver)
            .render_to_string()
    }

    fn renderer<'r>(&'r self, name: &str, context: Option<&'r Value>) -> TemplateResult<Renderer<'r>> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| TemplateError::MissingTemplate {
                template_name: name.to_string(),
            })?;

        let mut renderer = template
            .renderer()
            .registry(self)
            .max_depth(self.config.max_depth);
        if let Some(context) = context {
            renderer = renderer.context(context);
        }
        if let (None, Some(base_dir)) = (template.origin(), &self.config.base_dir) {
            renderer = renderer.base_dir(base_dir.clone());
        }
        Ok(renderer)
    }

    fn check_free(&self, name: &str) -> TemplateResult<String> {
        if self.templates.contains_key(name) {
            return Err(TemplateError::TemplateExists {
                template_name: name.to_string(),
            });
        }
        Ok(name.to_string())
    }
}

impl TemplateRegistry for TemplateEngine {
    fn lookup(&self, name: &str) -> Option<CompiledTemplate> {
        self.templates.get(name).cloned()
    }
}
