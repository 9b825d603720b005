//! Scope parsing and the read-access decision.
//!
//! Scopes follow the SMART on FHIR shape `context/ResourceType.permissions`:
//!
//! - **Context**: `patient`, `user`, `system` (or any other audience string)
//! - **ResourceType**: a FHIR resource type or `*` for wildcard
//! - **Permissions**: v1 `read` / `write` / `*`, or a v2 `cruds` subset
//!
//! The graph walker only ever reads, so the one question asked here is
//! [`ScopeSet::scope_allows`]: may resources of this type be fetched? An
//! empty scope list means the server is being used without scoped
//! authorization and everything is permitted. Write-only scopes do not grant
//! read. Non-resource scopes (`launch`, `openid`, `offline_access`, ...) are
//! ignored.

use std::fmt;
use std::str::FromStr;

/// Errors that can occur when parsing a single scope string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScopeError {
    /// The scope string is not of the `context/Resource.permissions` form.
    #[error("Invalid scope format: {0}")]
    InvalidFormat(String),

    /// An invalid permission token was encountered.
    #[error("Invalid permission: {0}")]
    InvalidPermission(String),

    /// The scope string is empty.
    #[error("Empty scope string")]
    Empty,
}

/// The resource type targeted by a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceTarget {
    /// A specific FHIR resource type (e.g., "Patient", "Observation").
    Specific(String),
    /// Wildcard (*) matching all resource types.
    Wildcard,
}

impl ResourceTarget {
    fn matches(&self, resource_type: &str) -> bool {
        match self {
            Self::Specific(t) => t == resource_type,
            Self::Wildcard => true,
        }
    }
}

impl fmt::Display for ResourceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Specific(s) => write!(f, "{s}"),
            Self::Wildcard => write!(f, "*"),
        }
    }
}

/// Granted permissions for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub create: bool,
    pub read: bool,
    pub update: bool,
    pub delete: bool,
    pub search: bool,
}

impl Permissions {
    /// True when this scope grants read access.
    ///
    /// v2 scopes can grant `r` and `s` independently; either suffices for the
    /// walker, which issues both instance reads and searches.
    #[must_use]
    pub fn can_read(&self) -> bool {
        self.read || self.search
    }

    /// True when any write permission is granted.
    #[must_use]
    pub fn can_write(&self) -> bool {
        self.create || self.update || self.delete
    }

    const FULL: Permissions = Permissions {
        create: true,
        read: true,
        update: true,
        delete: true,
        search: true,
    };
}

impl FromStr for Permissions {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*" => return Ok(Self::FULL),
            "read" => {
                return Ok(Self {
                    read: true,
                    search: true,
                    ..Self::default()
                });
            }
            "write" => {
                return Ok(Self {
                    create: true,
                    update: true,
                    delete: true,
                    ..Self::default()
                });
            }
            _ => {}
        }
        // v2: ordered subset of cruds
        let mut perms = Self::default();
        if s.is_empty() {
            return Err(ScopeError::InvalidPermission(s.to_string()));
        }
        for c in s.chars() {
            match c {
                'c' => perms.create = true,
                'r' => perms.read = true,
                'u' => perms.update = true,
                'd' => perms.delete = true,
                's' => perms.search = true,
                _ => return Err(ScopeError::InvalidPermission(s.to_string())),
            }
        }
        Ok(perms)
    }
}

/// One parsed resource scope, e.g. `patient/Observation.read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceScope {
    pub context: String,
    pub resource: ResourceTarget,
    pub permissions: Permissions,
}

impl FromStr for ResourceScope {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ScopeError::Empty);
        }
        let (context, rest) = s
            .split_once('/')
            .ok_or_else(|| ScopeError::InvalidFormat(s.to_string()))?;
        let (resource, permissions) = rest
            .split_once('.')
            .ok_or_else(|| ScopeError::InvalidFormat(s.to_string()))?;
        if context.is_empty() || resource.is_empty() {
            return Err(ScopeError::InvalidFormat(s.to_string()));
        }
        // search-parameter filters (`?category=...`) are not used for the
        // read decision; strip them
        let permissions = permissions
            .split_once('?')
            .map(|(p, _)| p)
            .unwrap_or(permissions);
        let resource = if resource == "*" {
            ResourceTarget::Wildcard
        } else {
            ResourceTarget::Specific(resource.to_string())
        };
        Ok(Self {
            context: context.to_string(),
            resource,
            permissions: permissions.parse()?,
        })
    }
}

/// The set of scopes in force for one traversal.
///
/// Built once per traversal from the raw scope strings; unparseable and
/// non-resource tokens are skipped.
#[derive(Debug, Clone, Default)]
pub struct ScopeSet {
    scopes: Vec<ResourceScope>,
    open: bool,
}

impl ScopeSet {
    /// Parse a list of scope strings.
    ///
    /// An empty or absent list yields an open set that permits every type.
    pub fn parse<S: AsRef<str>>(scopes: &[S]) -> Self {
        if scopes.is_empty() {
            return Self {
                scopes: Vec::new(),
                open: true,
            };
        }
        let mut parsed = Vec::new();
        for raw in scopes {
            match raw.as_ref().parse::<ResourceScope>() {
                Ok(scope) => parsed.push(scope),
                Err(_) => {
                    tracing::debug!(scope = raw.as_ref(), "ignoring non-resource scope");
                }
            }
        }
        Self {
            scopes: parsed,
            open: false,
        }
    }

    /// An open scope set permitting every resource type.
    #[must_use]
    pub fn open() -> Self {
        Self {
            scopes: Vec::new(),
            open: true,
        }
    }

    /// Whether resources of `resource_type` may be fetched.
    #[must_use]
    pub fn scope_allows(&self, resource_type: &str) -> bool {
        if self.open {
            return true;
        }
        self.scopes
            .iter()
            .any(|s| s.resource.matches(resource_type) && s.permissions.can_read())
    }

    /// The parsed resource scopes.
    pub fn scopes(&self) -> &[ResourceScope] {
        &self.scopes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v1_read_scope() {
        let scope: ResourceScope = "patient/Patient.read".parse().unwrap();
        assert_eq!(scope.context, "patient");
        assert_eq!(scope.resource, ResourceTarget::Specific("Patient".to_string()));
        assert!(scope.permissions.can_read());
        assert!(!scope.permissions.can_write());
    }

    #[test]
    fn test_parse_v1_write_scope() {
        let scope: ResourceScope = "user/Observation.write".parse().unwrap();
        assert!(!scope.permissions.can_read());
        assert!(scope.permissions.can_write());
    }

    #[test]
    fn test_parse_wildcard() {
        let scope: ResourceScope = "system/*.*".parse().unwrap();
        assert_eq!(scope.resource, ResourceTarget::Wildcard);
        assert!(scope.permissions.can_read());
        assert!(scope.permissions.can_write());
    }

    #[test]
    fn test_parse_v2_cruds() {
        let scope: ResourceScope = "patient/Observation.rs".parse().unwrap();
        assert!(scope.permissions.read);
        assert!(scope.permissions.search);
        assert!(!scope.permissions.create);

        let write_only: ResourceScope = "patient/Observation.cud".parse().unwrap();
        assert!(!write_only.permissions.can_read());
        assert!(write_only.permissions.can_write());
    }

    #[test]
    fn test_parse_v2_filter_stripped() {
        let scope: ResourceScope = "patient/Observation.rs?category=laboratory"
            .parse()
            .unwrap();
        assert!(scope.permissions.can_read());
    }

    #[test]
    fn test_parse_invalid() {
        assert!("launch".parse::<ResourceScope>().is_err());
        assert!("openid".parse::<ResourceScope>().is_err());
        assert!("patient/Patient".parse::<ResourceScope>().is_err());
        assert!("patient/Patient.xyz".parse::<ResourceScope>().is_err());
        assert!("".parse::<ResourceScope>().is_err());
    }

    #[test]
    fn test_empty_scope_list_allows_everything() {
        let scopes: ScopeSet = ScopeSet::parse::<String>(&[]);
        assert!(scopes.scope_allows("Patient"));
        assert!(scopes.scope_allows("Observation"));
    }

    #[test]
    fn test_explicit_types_only() {
        let scopes = ScopeSet::parse(&["patient/Patient.read", "patient/Practitioner.read"]);
        assert!(scopes.scope_allows("Patient"));
        assert!(scopes.scope_allows("Practitioner"));
        assert!(!scopes.scope_allows("Observation"));
    }

    #[test]
    fn test_wildcard_resource_allows_any_type() {
        let scopes = ScopeSet::parse(&["user/*.read"]);
        assert!(scopes.scope_allows("Patient"));
        assert!(scopes.scope_allows("Medication"));
    }

    #[test]
    fn test_write_only_does_not_grant_read() {
        let scopes = ScopeSet::parse(&["patient/Patient.write"]);
        assert!(!scopes.scope_allows("Patient"));
    }

    #[test]
    fn test_non_resource_scopes_ignored() {
        let scopes = ScopeSet::parse(&["launch", "openid", "patient/Patient.read"]);
        assert_eq!(scopes.scopes().len(), 1);
        assert!(scopes.scope_allows("Patient"));
        assert!(!scopes.scope_allows("Observation"));
    }
}
