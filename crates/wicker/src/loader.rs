// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Template loaders.
//!
//! This module provides the [`Loader`] trait and implementations for
//! locating and reading template source.
//!
//! # Loader Implementations
//!
//! - [`FileSystemLoader`]: Reads templates below a root directory
//! - [`MemoryLoader`]: Serves templates from an in-memory map (testing)
//!
//! The engine probes its loader chain in registration order; the first
//! loader that has the template wins. A missing template is signalled with
//! [`WickerError::TemplateNotFound`] so `include ... ignore missing` can
//! recover it.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::error::{Result, WickerError};

/// A loaded template source with its modification timestamp.
#[derive(Debug, Clone)]
pub struct SourceTemplate {
    /// The template source text.
    pub source: String,
    /// Last-modified time, when the backing store knows one.
    pub modified: Option<SystemTime>,
}

/// Trait for template source loaders.
///
/// Implement this trait to load templates from custom stores (network,
/// database, archives). Implementations must be thread-safe.
pub trait Loader: Send + Sync {
    /// True when the loader can serve the named template.
    fn exists(&self, name: &str) -> bool;

    /// Loads the named template, or fails with
    /// [`WickerError::TemplateNotFound`].
    fn load(&self, name: &str) -> Result<SourceTemplate>;
}

/// Filesystem-based loader.
///
/// Resolves template names below a root directory. Names are normalized
/// with forward slashes; absolute names and names escaping the root via
/// `..` are rejected.
#[derive(Debug, Clone)]
pub struct FileSystemLoader {
    root: PathBuf,
}

impl FileSystemLoader {
    /// Creates a loader rooted at the given directory.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                // Anything that could climb out of the root is refused.
                _ => return None,
            }
        }
        Some(self.root.join(relative))
    }
}

impl Loader for FileSystemLoader {
    fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn load(&self, name: &str) -> Result<SourceTemplate> {
        let Some(path) = self.resolve(name) else {
            return Err(WickerError::TemplateNotFound(name.to_string()));
        };
        if !path.is_file() {
            return Err(WickerError::TemplateNotFound(name.to_string()));
        }
        let source = std::fs::read_to_string(&path).map_err(|e| WickerError::LoadError {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok();
        Ok(SourceTemplate { source, modified })
    }
}

/// Memory-based loader that stores templates in a shared map.
///
/// Intended for tests and embedded setups where templates are registered
/// programmatically.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    templates: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryLoader {
    /// Creates an empty memory loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a template.
    pub fn add_template(&self, name: &str, source: &str) {
        if let Ok(mut templates) = self.templates.lock() {
            templates.insert(name.to_string(), source.to_string());
        }
    }

    /// Removes a template.
    pub fn remove_template(&self, name: &str) {
        if let Ok(mut templates) = self.templates.lock() {
            templates.remove(name);
        }
    }

    /// Removes all templates.
    pub fn clear(&self) {
        if let Ok(mut templates) = self.templates.lock() {
            templates.clear();
        }
    }
}

impl Loader for MemoryLoader {
    fn exists(&self, name: &str) -> bool {
        self.templates
            .lock()
            .map(|templates| templates.contains_key(name))
            .unwrap_or(false)
    }

    fn load(&self, name: &str) -> Result<SourceTemplate> {
        let templates = self.templates.lock().map_err(|_| WickerError::LoadError {
            name: name.to_string(),
            message: "loader lock poisoned".to_string(),
        })?;
        match templates.get(name) {
            Some(source) => Ok(SourceTemplate {
                source: source.clone(),
                modified: None,
            }),
            None => Err(WickerError::TemplateNotFound(name.to_string())),
        }
    }
}
