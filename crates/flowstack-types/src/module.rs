//! Module function identity and registration metadata.
//!
//! A module function is addressed by a dotted path (`category.module.function`)
//! and registered together with a static descriptor declaring its parameter
//! names and calling convention. The engine maps resolved inputs onto the
//! declared shape; it never inspects the callee to guess how to call it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ModulePath
// ---------------------------------------------------------------------------

/// Parsed, validated `category.module.function` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModulePath {
    pub category: String,
    pub module: String,
    pub function: String,
}

impl ModulePath {
    /// The `category.module` prefix, used to key resilience wrappers so all
    /// functions of one integration share a breaker and rate limiter.
    pub fn service_key(&self) -> String {
        format!("{}.{}", self.category, self.module)
    }
}

impl std::str::FromStr for ModulePath {
    type Err = ModulePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(ModulePathError::Malformed(s.to_string()));
        }
        if parts.iter().any(|p| {
            p.is_empty() || !p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }) {
            return Err(ModulePathError::Malformed(s.to_string()));
        }
        Ok(Self {
            category: parts[0].to_string(),
            module: parts[1].to_string(),
            function: parts[2].to_string(),
        })
    }
}

impl std::fmt::Display for ModulePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.category, self.module, self.function)
    }
}

/// Error raised for a module path that is not a valid dotted triple.
#[derive(Debug, Error)]
pub enum ModulePathError {
    #[error("malformed module path '{0}': expected 'category.module.function'")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// ModuleDescriptor
// ---------------------------------------------------------------------------

/// How a module function expects its resolved inputs delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputShape {
    /// The resolved input object is passed through as-is.
    #[default]
    SingleObject,
    /// Inputs are mapped to a positional array in declared parameter order.
    Positional,
}

/// Static registration metadata for a module function.
///
/// Supplied explicitly by each module at registration time. The `params`
/// order matters only for `InputShape::Positional`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub path: ModulePath,
    /// Ordered parameter names.
    #[serde(default)]
    pub params: Vec<String>,
    /// Calling convention.
    #[serde(default)]
    pub input_shape: InputShape,
}

impl ModuleDescriptor {
    /// Descriptor for a single-object function (the common case).
    pub fn single_object(path: ModulePath) -> Self {
        Self {
            path,
            params: Vec::new(),
            input_shape: InputShape::SingleObject,
        }
    }

    /// Descriptor for a positional function with the given parameter order.
    pub fn positional(path: ModulePath, params: Vec<String>) -> Self {
        Self {
            path,
            params,
            input_shape: InputShape::Positional,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
