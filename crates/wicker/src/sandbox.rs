// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Sandbox policy.
//!
//! When a render context is sandboxed, every function call, filter
//! application, test application, method invocation on a host object,
//! attribute access on a host object, and executed statement tag is checked
//! against the engine's policy. Allow-lists cover callables and member
//! access; tags use a deny-list. A violation fails the render with a
//! [`WickerError::SandboxError`] naming the blocked entity.

use std::collections::HashSet;

use crate::error::{Result, SandboxTarget, WickerError};

/// Allow-lists for callables and member access plus a tag deny-list.
///
/// The default policy allows nothing and blocks no tags, so a sandboxed
/// render under it can only print plain values.
#[derive(Debug, Clone, Default)]
pub struct SandboxPolicy {
    allowed_functions: HashSet<String>,
    allowed_filters: HashSet<String>,
    allowed_tests: HashSet<String>,
    allowed_methods: HashSet<String>,
    allowed_attributes: HashSet<String>,
    blocked_tags: HashSet<String>,
}

impl SandboxPolicy {
    /// Creates an empty (deny-everything) policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows a function name.
    pub fn allow_function(mut self, name: impl Into<String>) -> Self {
        self.allowed_functions.insert(name.into());
        self
    }

    /// Allows a filter name.
    pub fn allow_filter(mut self, name: impl Into<String>) -> Self {
        self.allowed_filters.insert(name.into());
        self
    }

    /// Allows a test name.
    pub fn allow_test(mut self, name: impl Into<String>) -> Self {
        self.allowed_tests.insert(name.into());
        self
    }

    /// Allows a method name on host objects.
    pub fn allow_method(mut self, name: impl Into<String>) -> Self {
        self.allowed_methods.insert(name.into());
        self
    }

    /// Allows an attribute name on host objects.
    pub fn allow_attribute(mut self, name: impl Into<String>) -> Self {
        self.allowed_attributes.insert(name.into());
        self
    }

    /// Denies a statement tag.
    pub fn block_tag(mut self, name: impl Into<String>) -> Self {
        self.blocked_tags.insert(name.into());
        self
    }

    fn violation(entity: &str, target: SandboxTarget) -> WickerError {
        WickerError::SandboxError {
            entity: entity.to_string(),
            target,
        }
    }

    /// Checks a function call site.
    pub fn check_function(&self, name: &str) -> Result<()> {
        if self.allowed_functions.contains(name) {
            Ok(())
        } else {
            Err(Self::violation(name, SandboxTarget::Function))
        }
    }

    /// Checks a filter call site.
    pub fn check_filter(&self, name: &str) -> Result<()> {
        if self.allowed_filters.contains(name) {
            Ok(())
        } else {
            Err(Self::violation(name, SandboxTarget::Filter))
        }
    }

    /// Checks a test call site.
    pub fn check_test(&self, name: &str) -> Result<()> {
        if self.allowed_tests.contains(name) {
            Ok(())
        } else {
            Err(Self::violation(name, SandboxTarget::Test))
        }
    }

    /// Checks a method invocation on a host object.
    pub fn check_method(&self, name: &str) -> Result<()> {
        if self.allowed_methods.contains(name) {
            Ok(())
        } else {
            Err(Self::violation(name, SandboxTarget::Method))
        }
    }

    /// Checks an attribute access on a host object.
    pub fn check_attribute(&self, name: &str) -> Result<()> {
        if self.allowed_attributes.contains(name) {
            Ok(())
        } else {
            Err(Self::violation(name, SandboxTarget::Attribute))
        }
    }

    /// Checks an executed statement tag against the deny-list.
    pub fn check_tag(&self, name: &str) -> Result<()> {
        if self.blocked_tags.contains(name) {
            Err(Self::violation(name, SandboxTarget::Tag))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_denies_calls_and_allows_tags() {
        let policy = SandboxPolicy::new();
        assert!(policy.check_function("range").is_err());
        assert!(policy.check_filter("upper").is_err());
        assert!(policy.check_tag("if").is_ok());
    }

    #[test]
    fn test_allow_lists() {
        let policy = SandboxPolicy::new()
            .allow_filter("upper")
            .allow_function("range")
            .block_tag("include");
        assert!(policy.check_filter("upper").is_ok());
        assert!(policy.check_filter("lower").is_err());
        assert!(policy.check_function("range").is_ok());
        assert!(policy.check_tag("include").is_err());
        assert!(policy.check_tag("if").is_ok());
    }

    #[test]
    fn test_violation_names_entity() {
        let err = SandboxPolicy::new().check_method("save").unwrap_err();
        match err {
            WickerError::SandboxError { entity, target } => {
                assert_eq!(entity, "save");
                assert_eq!(target, SandboxTarget::Method);
            }
            other => panic!("expected sandbox error, got {:?}", other),
        }
    }
}
