//! Fully-qualified module names.
//!
//! A module revision is addressed by `(tenant, namespace, name, ref)`. Two
//! textual forms exist:
//!
//! - `fqmn://{tenant}/{namespace}/{name}@{ref}` for logging and map keys
//! - `/{tenant}/{ref}/{namespace}/{name}` for URL paths on the source service

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SCHEME: &str = "fqmn://";

/// FQMN parse errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FqmnError {
    /// The string does not start with `fqmn://`.
    #[error("FQMN must start with '{SCHEME}': {0}")]
    MissingScheme(String),

    /// The `@ref` suffix is missing.
    #[error("FQMN is missing '@ref': {0}")]
    MissingRef(String),

    /// The path does not have exactly three segments.
    #[error("FQMN must have tenant/namespace/name segments: {0}")]
    BadSegments(String),

    /// A segment is empty or contains a reserved character.
    #[error("Invalid FQMN segment '{0}'")]
    InvalidSegment(String),
}

/// A module addressed by name, without a revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleName {
    /// Tenant identifier.
    pub tenant: String,
    /// Namespace within the tenant.
    pub namespace: String,
    /// Module name within the namespace.
    pub name: String,
}

impl ModuleName {
    /// Create a new module name, validating every segment.
    pub fn new(
        tenant: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, FqmnError> {
        let this = Self {
            tenant: tenant.into(),
            namespace: namespace.into(),
            name: name.into(),
        };
        validate_segment(&this.tenant)?;
        validate_segment(&this.namespace)?;
        validate_segment(&this.name)?;
        Ok(this)
    }

    /// Attach a revision, producing a full [`Fqmn`].
    pub fn with_ref(&self, module_ref: impl Into<String>) -> Result<Fqmn, FqmnError> {
        let module_ref = module_ref.into();
        validate_segment(&module_ref)?;
        Ok(Fqmn {
            tenant: self.tenant.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            module_ref,
        })
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.namespace, self.name)
    }
}

/// Fully-qualified module name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fqmn {
    /// Tenant identifier.
    pub tenant: String,
    /// Namespace within the tenant.
    pub namespace: String,
    /// Module name within the namespace.
    pub name: String,
    /// Hex SHA-256 of the module bytes.
    pub module_ref: String,
}

impl Fqmn {
    /// Create a new FQMN, validating every segment.
    pub fn new(
        tenant: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        module_ref: impl Into<String>,
    ) -> Result<Self, FqmnError> {
        ModuleName::new(tenant, namespace, name)?.with_ref(module_ref)
    }

    /// Parse the canonical `fqmn://tenant/namespace/name@ref` form.
    pub fn parse(s: &str) -> Result<Self, FqmnError> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| FqmnError::MissingScheme(s.to_string()))?;
        let (path, module_ref) = rest
            .rsplit_once('@')
            .ok_or_else(|| FqmnError::MissingRef(s.to_string()))?;

        let segments: Vec<&str> = path.split('/').collect();
        let [tenant, namespace, name] = segments.as_slice() else {
            return Err(FqmnError::BadSegments(s.to_string()));
        };

        Self::new(*tenant, *namespace, *name, module_ref)
    }

    /// Parse the `/{tenant}/{ref}/{namespace}/{name}` source-service path.
    pub fn from_url_path(path: &str) -> Result<Self, FqmnError> {
        let trimmed = path.trim_start_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();
        let [tenant, module_ref, namespace, name] = segments.as_slice() else {
            return Err(FqmnError::BadSegments(path.to_string()));
        };
        Self::new(*tenant, *namespace, *name, *module_ref)
    }

    /// The `/{tenant}/{ref}/{namespace}/{name}` path on the source service.
    pub fn url_path(&self) -> String {
        format!(
            "/{}/{}/{}/{}",
            self.tenant, self.module_ref, self.namespace, self.name
        )
    }

    /// The name part of this FQMN, without the revision.
    pub fn module_name(&self) -> ModuleName {
        ModuleName {
            tenant: self.tenant.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for Fqmn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SCHEME}{}/{}/{}@{}",
            self.tenant, self.namespace, self.name, self.module_ref
        )
    }
}

impl FromStr for Fqmn {
    type Err = FqmnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Fqmn {
    type Error = FqmnError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Fqmn> for String {
    fn from(fqmn: Fqmn) -> Self {
        fqmn.to_string()
    }
}

fn validate_segment(segment: &str) -> Result<(), FqmnError> {
    let reserved = |c: char| matches!(c, '/' | '@') || c.is_whitespace();
    if segment.is_empty() || segment.contains(reserved) {
        return Err(FqmnError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}
