//! Engine configuration
//!
//! `EngineConfig` is a plain struct with sensible defaults. Embedders either
//! build one in code or load it from a TOML document:
//!
//! ```toml
//! compile_mode = "aot"
//! max_inline_depth = 2
//! thread_stack_size = 8388608
//! stack_guard_size = 524288
//! ```

use std::path::Path;

use serde::Deserialize;

/// Which code-path variant the method compiler emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileMode {
    /// Just-in-time: classes loaded at compile time are bound directly
    Jit,
    /// Ahead-of-time: every class, field and call target is resolved lazily
    /// and every class-initialization check is kept
    Aot,
}

impl Default for CompileMode {
    fn default() -> Self {
        CompileMode::Jit
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the configuration file failed
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that could not be read
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The TOML document is malformed
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Execution core configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// JIT or AOT code-path variant
    pub compile_mode: CompileMode,
    /// Maximum nesting of inlined callees
    pub max_inline_depth: usize,
    /// Largest callee body (in bytecode bytes) considered for inlining
    pub max_inline_bytecode_len: usize,
    /// Native stack size for threads spawned by the runtime
    pub thread_stack_size: usize,
    /// Size of the reserved low-address region that triggers stack overflow
    pub stack_guard_size: usize,
    /// Recursion depth a thin lock holds before inflating
    pub thin_lock_max_recursion: u32,
    /// Give up a rendezvous after this many milliseconds (None waits forever)
    pub rendezvous_timeout_ms: Option<u64>,
    /// Capacity of the ahead-of-time code cache
    pub code_cache_max_methods: usize,
    /// Log uncaught exceptions when they terminate an invocation
    pub trace_uncaught: bool,
    /// Lower eligible methods with the native backend (requires the `jit` feature)
    pub native_backend: bool,
    /// Heap limit in bytes for the default allocator (0 = unlimited)
    pub max_heap_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compile_mode: CompileMode::Jit,
            max_inline_depth: 3,
            max_inline_bytecode_len: 35,
            thread_stack_size: 2 * 1024 * 1024,
            stack_guard_size: 256 * 1024,
            thin_lock_max_recursion: 0xff,
            rendezvous_timeout_ms: None,
            code_cache_max_methods: 4096,
            trace_uncaught: true,
            native_backend: false,
            max_heap_bytes: 0,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a TOML string. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_guard_size >= self.thread_stack_size {
            return Err(ConfigError::Invalid {
                field: "stack_guard_size",
                reason: format!(
                    "guard of {} bytes leaves no usable stack out of {}",
                    self.stack_guard_size, self.thread_stack_size
                ),
            });
        }
        if self.thin_lock_max_recursion == 0 || self.thin_lock_max_recursion > 0xff {
            return Err(ConfigError::Invalid {
                field: "thin_lock_max_recursion",
                reason: "must be within 1..=255".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.compile_mode, CompileMode::Jit);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str("compile_mode = \"aot\"\nmax_inline_depth = 1\n").unwrap();
        assert_eq!(config.compile_mode, CompileMode::Aot);
        assert_eq!(config.max_inline_depth, 1);
        assert_eq!(config.thin_lock_max_recursion, 0xff);
    }

    #[test]
    fn test_guard_larger_than_stack_rejected() {
        let err = EngineConfig::from_toml_str("thread_stack_size = 4096\nstack_guard_size = 8192\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "stack_guard_size", .. }));
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            EngineConfig::from_toml_str("compile_mode = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rendezvous_timeout_ms = 250").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.rendezvous_timeout_ms, Some(250));
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::load("/nonexistent/kiln.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
