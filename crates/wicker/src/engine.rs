// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Template engine.
//!
//! This module provides the core [`Engine`] type that handles the complete
//! template lifecycle: loading, parsing, caching and rendering.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use wicker::Engine;
//!
//! let engine = Engine::new();
//! engine.add_template("hello.html", "Hello {{ name }}!")?;
//! let html = engine.render("hello.html", serde_json::json!({ "name": "World" }))?;
//! assert_eq!(html, "Hello World!");
//! ```
//!
//! # Architecture
//!
//! The engine coordinates several subsystems:
//!
//! - **Loaders**: Locate template source by name, probed in order
//! - **Parser**: Converts source into an immutable AST
//! - **Caches**: A name-keyed registry of parsed templates plus an
//!   optional content-addressed compiled cache (memory or filesystem)
//! - **Registries**: Filters, functions, tests and globals
//! - **Renderer**: Walks the AST against a per-render context
//!
//! # Thread Safety
//!
//! Registration takes an exclusive lock on the mutated table; rendering
//! takes shared locks and clones `Arc`s, so previously loaded templates
//! render concurrently. Templates are immutable once published. A render
//! observes the registry state current when it resolves each name and is
//! not required to observe concurrent mutations.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::cache::{cache_key, NoOpCache, TemplateCache};
use crate::context::RenderContext;
use crate::error::{Result, WickerError};
use crate::filters::{self, FilterRef};
use crate::functions::{self, FunctionRef};
use crate::loader::Loader;
use crate::pool::BufferPool;
use crate::render;
use crate::sandbox::SandboxPolicy;
use crate::template::Template;
use crate::tests::TestRef;
use crate::value::{value_from_json, Value, ValueMap};
use crate::{codec, tests as test_registry};

/// The template engine.
///
/// Holds the template registry, the loader chain, the environment
/// (globals, filters, functions, tests, flags) and the sandbox policy.
/// Wrap it in an `Arc` to share across threads.
pub struct Engine {
    loaders: RwLock<Vec<Box<dyn Loader>>>,
    templates: RwLock<HashMap<String, Arc<Template>>>,
    compiled: RwLock<Box<dyn TemplateCache>>,
    filters: RwLock<HashMap<String, FilterRef>>,
    functions: RwLock<HashMap<String, FunctionRef>>,
    tests: RwLock<HashMap<String, TestRef>>,
    globals: RwLock<ValueMap>,
    policy: RwLock<Arc<SandboxPolicy>>,
    autoescape: bool,
    strict_variables: bool,
    auto_reload: bool,
    debug: bool,
    pool: BufferPool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("autoescape", &self.autoescape)
            .field("strict_variables", &self.strict_variables)
            .field("auto_reload", &self.auto_reload)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with the built-in registries, HTML autoescaping
    /// on, strict variables off, and no compiled-template cache.
    pub fn new() -> Self {
        Engine {
            loaders: RwLock::new(Vec::new()),
            templates: RwLock::new(HashMap::new()),
            compiled: RwLock::new(Box::new(NoOpCache::new())),
            filters: RwLock::new(filters::defaults()),
            functions: RwLock::new(functions::defaults()),
            tests: RwLock::new(test_registry::defaults()),
            globals: RwLock::new(ValueMap::new()),
            policy: RwLock::new(Arc::new(SandboxPolicy::default())),
            autoescape: true,
            strict_variables: false,
            auto_reload: false,
            debug: false,
            pool: BufferPool::new(),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Enables or disables escape-by-default output.
    pub fn set_autoescape(&mut self, enabled: bool) {
        self.autoescape = enabled;
    }

    /// Makes undefined variable access a render error instead of null.
    pub fn set_strict_variables(&mut self, strict: bool) {
        self.strict_variables = strict;
    }

    /// Revalidates cached templates against their loader's modification
    /// time on every lookup.
    pub fn set_auto_reload(&mut self, reload: bool) {
        self.auto_reload = reload;
    }

    /// Enables debug mode (reserved for diagnostic output helpers).
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Installs the compiled-template cache.
    pub fn set_compiled_cache(&self, cache: Box<dyn TemplateCache>) {
        *self.compiled.write().expect("cache lock") = cache;
    }

    /// Installs the sandbox policy checked by sandboxed renders.
    pub fn set_sandbox_policy(&self, policy: SandboxPolicy) {
        *self.policy.write().expect("policy lock") = Arc::new(policy);
    }

    /// Appends a loader to the probe chain.
    pub fn add_loader(&self, loader: Box<dyn Loader>) {
        self.loaders.write().expect("loader lock").push(loader);
    }

    /// Registers a template from a source string, parsing it eagerly.
    ///
    /// # Errors
    ///
    /// Returns a parse error if the source is invalid.
    pub fn add_template(&self, name: &str, source: &str) -> Result<()> {
        let template = Arc::new(Template::compile(name, source, None)?);
        debug!(template = name, "registered string template");
        self.templates
            .write()
            .expect("template lock")
            .insert(name.to_string(), template);
        Ok(())
    }

    /// Registers (or overrides) a filter.
    pub fn add_filter(
        &self,
        name: &str,
        filter: impl Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.filters
            .write()
            .expect("filter lock")
            .insert(name.to_string(), Arc::new(filter));
    }

    /// Registers (or overrides) a function.
    pub fn add_function(
        &self,
        name: &str,
        function: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.functions
            .write()
            .expect("function lock")
            .insert(name.to_string(), Arc::new(function));
    }

    /// Registers (or overrides) a test.
    pub fn add_test(
        &self,
        name: &str,
        test: impl Fn(&Value, &[Value]) -> Result<bool> + Send + Sync + 'static,
    ) {
        self.tests
            .write()
            .expect("test lock")
            .insert(name.to_string(), Arc::new(test));
    }

    /// Sets a global variable visible to every render.
    pub fn add_global(&self, name: &str, value: Value) {
        self.globals
            .write()
            .expect("globals lock")
            .insert(name.to_string(), value);
    }

    // ------------------------------------------------------------------
    // Template lookup
    // ------------------------------------------------------------------

    /// Returns the parsed template for `name`, loading it on demand.
    ///
    /// Lookup order: the in-memory registry (revalidated when auto-reload
    /// is on), then the loader chain, consulting the compiled cache before
    /// parsing.
    pub fn get_template(&self, name: &str) -> Result<Arc<Template>> {
        if let Some(cached) = self
            .templates
            .read()
            .expect("template lock")
            .get(name)
            .cloned()
        {
            if !self.auto_reload {
                return Ok(cached);
            }
            match self.probe_loaders(name) {
                Some(loaded) if loaded.modified != cached.modified => {
                    debug!(template = name, "auto-reload: source changed");
                }
                _ => return Ok(cached),
            }
        }

        let Some(loaded) = self.probe_loaders(name) else {
            return Err(WickerError::TemplateNotFound(name.to_string()));
        };

        let key = cache_key(name, &loaded.source);
        let compiled = self.compiled.read().expect("cache lock");
        let template = match compiled.get(&key)? {
            Some(template) => {
                debug!(template = name, "compiled cache hit");
                template
            }
            None => {
                debug!(template = name, "parsing");
                let parsed = Arc::new(Template::compile(name, &loaded.source, loaded.modified)?);
                compiled.set(&key, parsed.clone())?;
                parsed
            }
        };
        drop(compiled);

        self.templates
            .write()
            .expect("template lock")
            .insert(name.to_string(), template.clone());
        Ok(template)
    }

    fn probe_loaders(&self, name: &str) -> Option<crate::loader::SourceTemplate> {
        let loaders = self.loaders.read().expect("loader lock");
        for loader in loaders.iter() {
            if loader.exists(name) {
                if let Ok(loaded) = loader.load(name) {
                    return Some(loaded);
                }
            }
        }
        None
    }

    /// Raw template source, for the `source()` function.
    pub(crate) fn load_source(&self, name: &str) -> Result<String> {
        if let Some(loaded) = self.probe_loaders(name) {
            return Ok(loaded.source);
        }
        if let Some(template) = self
            .templates
            .read()
            .expect("template lock")
            .get(name)
            .cloned()
        {
            return Ok(template.source.clone());
        }
        Err(WickerError::TemplateNotFound(name.to_string()))
    }

    /// Compiles an anonymous template for `template_from_string()`; the
    /// generated name is stable for identical source.
    pub(crate) fn template_from_string(&self, source: &str) -> Result<Arc<Template>> {
        let name = format!("__string_template__{}", &cache_key("", source)[..16]);
        if let Some(existing) = self
            .templates
            .read()
            .expect("template lock")
            .get(&name)
            .cloned()
        {
            return Ok(existing);
        }
        let template = Arc::new(Template::compile(&name, source, None)?);
        self.templates
            .write()
            .expect("template lock")
            .insert(name, template.clone());
        Ok(template)
    }

    /// Evicts a template from the registry, forcing a reload next use.
    pub fn evict(&self, name: &str) {
        self.templates.write().expect("template lock").remove(name);
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// Renders a template with JSON data (an object, or null for none).
    pub fn render(&self, name: &str, data: serde_json::Value) -> Result<String> {
        let template = self.get_template(name)?;
        let data = json_scope(data)?;
        debug!(template = name, "render start");
        let mut ctx = RenderContext::new(self, template, data);
        let mut out = self.pool.take();
        match render::render_document(&mut ctx, &mut out) {
            Ok(()) => Ok(out),
            Err(e) => {
                self.pool.put(out);
                Err(e)
            }
        }
    }

    /// Renders a template, streaming the finished bytes to a writer.
    ///
    /// Output is buffered internally; a render failure writes nothing.
    pub fn render_to<W: Write>(
        &self,
        name: &str,
        data: serde_json::Value,
        writer: &mut W,
    ) -> Result<()> {
        let out = self.render(name, data)?;
        writer.write_all(out.as_bytes())?;
        self.pool.put(out);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Compiled templates
    // ------------------------------------------------------------------

    /// Serialises a loaded template into the binary envelope format.
    pub fn compile(&self, name: &str) -> Result<Vec<u8>> {
        let template = self.get_template(name)?;
        codec::encode(&template)
    }

    /// Loads a template from a binary envelope, registering it under the
    /// name recorded in the envelope.
    pub fn load_compiled(&self, bytes: &[u8]) -> Result<String> {
        let template = Arc::new(codec::decode(bytes)?);
        let name = template.name.clone();
        debug!(template = %name, "loaded compiled template");
        self.templates
            .write()
            .expect("template lock")
            .insert(name.clone(), template);
        Ok(name)
    }

    // ------------------------------------------------------------------
    // Internal accessors for the renderer
    // ------------------------------------------------------------------

    pub(crate) fn autoescape_enabled(&self) -> bool {
        self.autoescape
    }

    pub(crate) fn strict(&self) -> bool {
        self.strict_variables
    }

    pub(crate) fn globals(&self) -> ValueMap {
        self.globals.read().expect("globals lock").clone()
    }

    pub(crate) fn policy(&self) -> Arc<SandboxPolicy> {
        self.policy.read().expect("policy lock").clone()
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn filter(&self, name: &str) -> Option<FilterRef> {
        self.filters.read().expect("filter lock").get(name).cloned()
    }

    pub(crate) fn function(&self, name: &str) -> Option<FunctionRef> {
        self.functions
            .read()
            .expect("function lock")
            .get(name)
            .cloned()
    }

    pub(crate) fn test(&self, name: &str) -> Option<TestRef> {
        self.tests.read().expect("test lock").get(name).cloned()
    }
}

/// Converts the caller's JSON data into the render scope map.
fn json_scope(data: serde_json::Value) -> Result<ValueMap> {
    match value_from_json(data) {
        Value::Null => Ok(ValueMap::new()),
        Value::Map(entries) => Ok(entries.as_ref().clone()),
        other => Err(WickerError::TypeError(format!(
            "render data must be a JSON object or null, got {}",
            other.kind()
        ))),
    }
}
