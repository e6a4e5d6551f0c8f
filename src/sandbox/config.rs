//! Registry configuration with builder pattern.

use std::path::PathBuf;

/// Configuration for a context registry and its interpreter.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum depth of nested (bridge-mediated) executions.
    pub max_call_depth: usize,
    /// Step budget applied to top-level execs that pass no fuel.
    pub default_fuel: Option<u64>,
    /// Whether ids of destroyed contexts may be reused.
    pub allow_id_reuse: bool,
    /// Maximum captured output per exec, in bytes.
    pub max_output_bytes: usize,
    /// Maximum depth of sandboxed function calls.
    pub max_recursion_depth: usize,
    /// Maximum length of a single list or string built by sandboxed code.
    pub max_collection_len: usize,
    /// Maximum guest memory in bytes (wasm interpreter).
    pub max_memory: u64,
    /// Path to the interpreter reactor module (wasm interpreter).
    pub interpreter_path: PathBuf,
    /// Host directories mounted into the guest (wasm interpreter).
    /// Empty by default, leaving the guest without filesystem access.
    pub preopen_dirs: Vec<PreopenDir>,
}

/// A host directory exposed to the wasm guest under `guest_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreopenDir {
    pub host_path: PathBuf,
    pub guest_path: String,
    pub read_only: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 32,
            default_fuel: None,
            allow_id_reuse: false,
            max_output_bytes: 1024 * 1024, // 1MB
            max_recursion_depth: 100,
            max_collection_len: 10_000_000,
            max_memory: 64 * 1024 * 1024, // 64MB
            interpreter_path: PathBuf::from("assets/pybox-reactor.wasm"),
            preopen_dirs: Vec::new(),
        }
    }
}

impl SandboxConfig {
    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    max_call_depth: Option<usize>,
    default_fuel: Option<u64>,
    allow_id_reuse: Option<bool>,
    max_output_bytes: Option<usize>,
    max_recursion_depth: Option<usize>,
    max_collection_len: Option<usize>,
    max_memory: Option<u64>,
    interpreter_path: Option<PathBuf>,
    preopen_dirs: Vec<PreopenDir>,
}

impl SandboxConfigBuilder {
    /// Set the maximum depth of nested executions.
    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = Some(depth);
        self
    }

    /// Set the step budget used when an exec passes no fuel.
    pub fn default_fuel(mut self, fuel: u64) -> Self {
        self.default_fuel = Some(fuel);
        self
    }

    /// Allow ids of destroyed contexts to be reused.
    pub fn allow_id_reuse(mut self, allow: bool) -> Self {
        self.allow_id_reuse = Some(allow);
        self
    }

    /// Set the per-exec output capture limit in bytes.
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    /// Set the maximum depth of sandboxed function calls.
    pub fn max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = Some(depth);
        self
    }

    /// Set the maximum length of a list or string built in the sandbox.
    pub fn max_collection_len(mut self, len: usize) -> Self {
        self.max_collection_len = Some(len);
        self
    }

    /// Set the maximum memory limit in bytes.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Set the path to the interpreter reactor module.
    pub fn interpreter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.interpreter_path = Some(path.into());
        self
    }

    /// Mount a host directory read-write at `guest` inside the wasm guest.
    pub fn preopen_dir(mut self, host: impl Into<PathBuf>, guest: impl Into<String>) -> Self {
        self.preopen_dirs.push(PreopenDir {
            host_path: host.into(),
            guest_path: guest.into(),
            read_only: false,
        });
        self
    }

    /// Mount a host directory read-only at `guest` inside the wasm guest.
    pub fn preopen_dir_read_only(mut self, host: impl Into<PathBuf>, guest: impl Into<String>) -> Self {
        self.preopen_dirs.push(PreopenDir {
            host_path: host.into(),
            guest_path: guest.into(),
            read_only: true,
        });
        self
    }

    /// Build the SandboxConfig.
    pub fn build(self) -> SandboxConfig {
        let default = SandboxConfig::default();
        SandboxConfig {
            max_call_depth: self.max_call_depth.unwrap_or(default.max_call_depth),
            default_fuel: self.default_fuel.or(default.default_fuel),
            allow_id_reuse: self.allow_id_reuse.unwrap_or(default.allow_id_reuse),
            max_output_bytes: self.max_output_bytes.unwrap_or(default.max_output_bytes),
            max_recursion_depth: self
                .max_recursion_depth
                .unwrap_or(default.max_recursion_depth),
            max_collection_len: self.max_collection_len.unwrap_or(default.max_collection_len),
            max_memory: self.max_memory.unwrap_or(default.max_memory),
            interpreter_path: self.interpreter_path.unwrap_or(default.interpreter_path),
            preopen_dirs: self.preopen_dirs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.max_call_depth, 32);
        assert_eq!(config.default_fuel, None);
        assert!(!config.allow_id_reuse);
        assert_eq!(config.max_memory, 64 * 1024 * 1024);
        assert!(config.preopen_dirs.is_empty());
    }

    #[test]
    fn test_preopen_dirs_accumulate() {
        let config = SandboxConfig::builder()
            .preopen_dir("/srv/data", "/data")
            .preopen_dir_read_only("/srv/models", "/models")
            .build();
        assert_eq!(
            config.preopen_dirs,
            vec![
                PreopenDir {
                    host_path: PathBuf::from("/srv/data"),
                    guest_path: "/data".to_string(),
                    read_only: false,
                },
                PreopenDir {
                    host_path: PathBuf::from("/srv/models"),
                    guest_path: "/models".to_string(),
                    read_only: true,
                },
            ]
        );
    }

    #[test]
    fn test_builder() {
        let config = SandboxConfig::builder()
            .max_call_depth(4)
            .default_fuel(1_000_000)
            .allow_id_reuse(true)
            .max_output_bytes(16)
            .build();

        assert_eq!(config.max_call_depth, 4);
        assert_eq!(config.default_fuel, Some(1_000_000));
        assert!(config.allow_id_reuse);
        assert_eq!(config.max_output_bytes, 16);
        assert_eq!(config.max_recursion_depth, 100);
    }
}
