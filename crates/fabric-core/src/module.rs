//! Content-addressed module bytes and their compiled form.
//!
//! A [`ModuleRef`] is the immutable pair of a module's bytes and the SHA-256
//! hex digest of those bytes. A [`CompiledModule`] is the Wasmtime
//! [`Module`] compiled from one, shared by every instance of a pool.

use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, Module};

use fabric_common::FabricError;

/// Exports every guest must provide, with the kind expected.
const REQUIRED_EXPORTS: &[(&str, ExportKind)] = &[
    ("memory", ExportKind::Memory),
    ("allocate", ExportKind::Func),
    ("deallocate", ExportKind::Func),
    ("run_e", ExportKind::Func),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExportKind {
    Func,
    Memory,
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn content_ref(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Immutable module bytes with their content ref.
#[derive(Clone)]
pub struct ModuleRef {
    name: String,
    module_ref: String,
    bytes: Arc<[u8]>,
}

impl ModuleRef {
    /// Wrap `bytes`, computing their ref.
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            module_ref: content_ref(&bytes),
            bytes,
        }
    }

    /// Wrap `bytes`, failing if they do not hash to `expected`.
    pub fn verified(
        name: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
        expected: &str,
    ) -> Result<Self, FabricError> {
        let this = Self::new(name, bytes);
        if !this.module_ref.eq_ignore_ascii_case(expected) {
            return Err(FabricError::invariant(format!(
                "module '{}' hashes to {} but was fetched as {expected}",
                this.name, this.module_ref
            )));
        }
        Ok(this)
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hex SHA-256 of the bytes.
    pub fn module_ref(&self) -> &str {
        &self.module_ref
    }

    /// The module bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for ModuleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRef")
            .field("name", &self.name)
            .field("module_ref", &self.module_ref)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A compiled WebAssembly module.
///
/// # Thread Safety
///
/// `CompiledModule` is cheap to clone and can be shared across instances.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,
    module_ref: String,
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a module and check that it exports the guest ABI.
    ///
    /// # Errors
    ///
    /// Returns `Compilation` if the bytes are not valid Wasm and `Invariant`
    /// if a required export is missing.
    #[instrument(skip(engine, module), fields(name = %module.name(), module_ref = %module.module_ref()))]
    pub fn compile(engine: &Engine, module: &ModuleRef) -> Result<Self, FabricError> {
        let start = Instant::now();

        Self::validate_wasm_header(module.bytes())?;

        let compiled = Module::new(engine, module.bytes()).map_err(|e| {
            FabricError::compilation(format!("Module compilation failed: {e}"))
        })?;
        validate_exports(&compiled)?;

        info!(
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        Ok(Self {
            module: compiled,
            module_ref: module.module_ref().to_string(),
            compiled_at: Instant::now(),
        })
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, FabricError> {
        let compiled = Module::new(engine, wat)
            .map_err(|e| FabricError::compilation(format!("WAT compilation failed: {e}")))?;
        validate_exports(&compiled)?;

        Ok(Self {
            module: compiled,
            module_ref: content_ref(wat.as_bytes()),
            compiled_at: Instant::now(),
        })
    }

    /// The underlying Wasmtime module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Ref of the bytes this module was compiled from.
    pub fn module_ref(&self) -> &str {
        &self.module_ref
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), FabricError> {
        if bytes.len() < 8 {
            return Err(FabricError::compilation("Invalid Wasm: file too small"));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(FabricError::compilation("Invalid Wasm: bad magic number"));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("module_ref", &self.module_ref)
            .finish_non_exhaustive()
    }
}

fn validate_exports(module: &Module) -> Result<(), FabricError> {
    for (name, kind) in REQUIRED_EXPORTS {
        let found = match module.get_export(name) {
            Some(ExternType::Func(_)) => Some(ExportKind::Func),
            Some(ExternType::Memory(_)) => Some(ExportKind::Memory),
            Some(_) | None => None,
        };
        if found != Some(*kind) {
            return Err(FabricError::invariant(format!(
                "module does not export required {kind:?} '{name}'"
            )));
        }
    }
    Ok(())
}
