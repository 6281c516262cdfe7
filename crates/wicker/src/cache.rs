// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Compiled-template caching.
//!
//! This module provides caching infrastructure for compiled templates,
//! avoiding repeated parsing of unchanged sources.
//!
//! # Cache Implementations
//!
//! - [`MemoryCache`]: In-memory LRU cache (recommended for most uses)
//! - [`FileSystemCache`]: Persistent disk cache storing codec envelopes,
//!   with a memory LRU layer in front
//! - [`NoOpCache`]: Never caches; useful in development
//!
//! Cache keys are content-addressed (template name + source hash), so a
//! changed source never resolves to a stale compiled form and corrupt disk
//! entries are detected by the codec envelope's own hash.
//!
//! # Custom Caches
//!
//! Implement the [`TemplateCache`] trait to create custom strategies
//! (e.g. a shared object store).

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::codec;
use crate::error::{Result, WickerError};
use crate::template::Template;

/// Derives the content-addressed cache key for a template source.
pub fn cache_key(name: &str, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    let mut key = String::with_capacity(digest.len() * 2);
    for byte in digest {
        key.push_str(&format!("{:02x}", byte));
    }
    key
}

/// Trait for compiled-template caches.
///
/// Implementations must be thread-safe; the engine calls them from
/// concurrent renders.
pub trait TemplateCache: Send + Sync + std::fmt::Debug {
    /// Retrieves a compiled template.
    fn get(&self, key: &str) -> Result<Option<Arc<Template>>>;
    /// Stores a compiled template.
    fn set(&self, key: &str, template: Arc<Template>) -> Result<()>;
    /// Removes an entry.
    fn remove(&self, key: &str) -> Result<()>;
    /// Clears all entries.
    fn clear(&self) -> Result<()>;
    /// Checks if a key is present.
    fn contains_key(&self, key: &str) -> bool;
}

/// In-memory LRU (Least Recently Used) cache.
///
/// Stores compiled templates in memory with automatic eviction of the
/// least recently used entries when the capacity is reached.
#[derive(Debug)]
pub struct MemoryCache {
    cache: Mutex<LruCache<String, Arc<Template>>>,
}

impl MemoryCache {
    /// Creates a new memory cache holding up to `capacity` templates.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, Arc<Template>>>> {
        self.cache
            .lock()
            .map_err(|_| WickerError::CacheError("failed to acquire cache lock".to_string()))
    }
}

impl TemplateCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Arc<Template>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, template: Arc<Template>) -> Result<()> {
        self.lock()?.put(key.to_string(), template);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.pop(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.lock().map(|c| c.contains(key)).unwrap_or(false)
    }
}

/// No-op cache that never stores or retrieves anything.
///
/// Useful for development where every render should parse fresh.
#[derive(Debug, Clone, Default)]
pub struct NoOpCache;

impl NoOpCache {
    /// Creates a new no-op cache.
    pub fn new() -> Self {
        Self
    }
}

impl TemplateCache for NoOpCache {
    fn get(&self, _key: &str) -> Result<Option<Arc<Template>>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _template: Arc<Template>) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }

    fn contains_key(&self, _key: &str) -> bool {
        false
    }
}

/// Persistent filesystem-backed cache with a memory layer.
///
/// Stores codec envelopes on disk for persistence across restarts, with an
/// in-memory LRU layer for fast access. Corrupt or incompatible envelopes
/// are treated as misses and removed.
#[derive(Debug)]
pub struct FileSystemCache {
    cache_dir: std::path::PathBuf,
    memory: MemoryCache,
}

impl FileSystemCache {
    /// Creates a filesystem cache in the given directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new<P: AsRef<std::path::Path>>(cache_dir: P, memory_capacity: usize) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            WickerError::CacheError(format!("failed to create cache directory: {}", e))
        })?;
        Ok(Self {
            cache_dir,
            memory: MemoryCache::new(memory_capacity),
        })
    }

    fn cache_file_path(&self, key: &str) -> std::path::PathBuf {
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.cache_dir.join(format!("{}.wkc", safe_key))
    }
}

impl TemplateCache for FileSystemCache {
    fn get(&self, key: &str) -> Result<Option<Arc<Template>>> {
        if let Some(template) = self.memory.get(key)? {
            return Ok(Some(template));
        }
        let path = self.cache_file_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .map_err(|e| WickerError::CacheError(format!("failed to read cache file: {}", e)))?;
        match codec::decode(&bytes) {
            Ok(template) => {
                let template = Arc::new(template);
                self.memory.set(key, template.clone())?;
                Ok(Some(template))
            }
            Err(_) => {
                // Stale or corrupt entry: drop it and fall back to a parse.
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, template: Arc<Template>) -> Result<()> {
        self.memory.set(key, template.clone())?;
        let bytes = codec::encode(&template)?;
        std::fs::write(self.cache_file_path(key), bytes)
            .map_err(|e| WickerError::CacheError(format!("failed to write cache file: {}", e)))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.memory.remove(key)?;
        let path = self.cache_file_path(key);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                WickerError::CacheError(format!("failed to remove cache file: {}", e))
            })?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.memory.clear()?;
        for entry in std::fs::read_dir(&self.cache_dir)
            .map_err(|e| WickerError::CacheError(format!("failed to read cache dir: {}", e)))?
        {
            let entry = entry
                .map_err(|e| WickerError::CacheError(format!("failed to read entry: {}", e)))?;
            let path = entry.path();
            if path.is_file() && path.extension().map(|e| e == "wkc").unwrap_or(false) {
                std::fs::remove_file(&path).map_err(|e| {
                    WickerError::CacheError(format!("failed to remove file: {}", e))
                })?;
            }
        }
        Ok(())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.memory.contains_key(key) || self.cache_file_path(key).exists()
    }
}
