//! Per-record-type operation authorization: a capability set evaluated before every read or
//! write, with a strict-mode gate for types that declare no policy at all.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// One of the operations a [`SecurityPolicy`] grants or withholds per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    Delete,
    Admin,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::List => "list",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Admin => "admin",
        }
    }
}

/// The caller attempting an operation, identified by the roles it holds.
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    pub roles: HashSet<String>,
}

impl SecurityContext {
    pub fn new(roles: impl IntoIterator<Item = String>) -> Self {
        Self {
            roles: roles.into_iter().collect(),
        }
    }

    fn has_any(&self, roles: &HashSet<String>) -> bool {
        self.roles.iter().any(|r| roles.contains(r))
    }
}

/// The capability set for one record type: which roles may perform which operations.
#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    grants: HashMap<Operation, HashSet<String>>,
}

impl SecurityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `role` permission to perform `operation`.
    pub fn allow(mut self, operation: Operation, role: impl Into<String>) -> Self {
        self.grants.entry(operation).or_default().insert(role.into());
        self
    }

    fn permits(&self, operation: Operation, caller: &SecurityContext) -> bool {
        self.grants.get(&operation).map_or(false, |roles| caller.has_any(roles))
    }
}

/// Evaluates [`SecurityPolicy`]s per record type, with a global strict-mode gate and a global set
/// of roles that bypass it.
pub struct SecurityDelegate {
    strict: bool,
    admin_roles: HashSet<String>,
    policies: HashMap<String, SecurityPolicy>,
}

impl SecurityDelegate {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            admin_roles: HashSet::new(),
            policies: HashMap::new(),
        }
    }

    pub fn with_admin_roles(mut self, roles: impl IntoIterator<Item = String>) -> Self {
        self.admin_roles = roles.into_iter().collect();
        self
    }

    pub fn register(&mut self, type_name: impl Into<String>, policy: SecurityPolicy) {
        self.policies.insert(type_name.into(), policy);
    }

    /// Authorizes `operation` against `type_name` for `caller`, failing with
    /// [`Error::Security`] if the policy (or the strict-mode gate, for an unpoliced type) denies
    /// it.
    pub fn check(&self, operation: Operation, type_name: &str, caller: &SecurityContext) -> Result<()> {
        match self.policies.get(type_name) {
            Some(policy) => {
                if policy.permits(operation, caller) {
                    Ok(())
                } else {
                    Err(self.denied(operation, type_name, "caller's roles are not granted this operation"))
                }
            }
            None if !self.strict => Ok(()),
            None if caller.has_any(&self.admin_roles) => Ok(()),
            None => Err(self.denied(operation, type_name, "no policy registered and strict mode is on")),
        }
    }

    fn denied(&self, operation: Operation, type_name: &str, reason: &str) -> Error {
        Error::Security {
            operation: operation.as_str().to_string(),
            target_type: type_name.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_mode_rejects_an_unpoliced_type_for_non_admin_callers() {
        let delegate = SecurityDelegate::new(true);
        let caller = SecurityContext::new(["reader".to_string()]);
        let err = delegate.check(Operation::Get, "Widget", &caller).unwrap_err();
        assert!(matches!(err, Error::Security { .. }));
    }

    #[test]
    fn non_strict_mode_allows_an_unpoliced_type() {
        let delegate = SecurityDelegate::new(false);
        let caller = SecurityContext::new(["reader".to_string()]);
        assert!(delegate.check(Operation::Delete, "Widget", &caller).is_ok());
    }

    #[test]
    fn admin_roles_bypass_the_strict_mode_gate() {
        let delegate = SecurityDelegate::new(true).with_admin_roles(["superuser".to_string()]);
        let caller = SecurityContext::new(["superuser".to_string()]);
        assert!(delegate.check(Operation::Delete, "Widget", &caller).is_ok());
    }

    #[test]
    fn a_registered_policy_is_enforced_per_operation() {
        let mut delegate = SecurityDelegate::new(true);
        delegate.register("Widget", SecurityPolicy::new().allow(Operation::Get, "reader"));
        let reader = SecurityContext::new(["reader".to_string()]);
        let writer = SecurityContext::new(["writer".to_string()]);
        assert!(delegate.check(Operation::Get, "Widget", &reader).is_ok());
        let err = delegate.check(Operation::Delete, "Widget", &reader).unwrap_err();
        assert!(matches!(err, Error::Security { .. }));
        let err = delegate.check(Operation::Get, "Widget", &writer).unwrap_err();
        assert!(matches!(err, Error::Security { .. }));
    }

    #[test]
    fn admin_roles_do_not_override_an_explicit_policy_denial() {
        let mut delegate = SecurityDelegate::new(true).with_admin_roles(["superuser".to_string()]);
        delegate.register("Widget", SecurityPolicy::new().allow(Operation::Get, "reader"));
        let admin = SecurityContext::new(["superuser".to_string()]);
        let err = delegate.check(Operation::Delete, "Widget", &admin).unwrap_err();
        assert!(matches!(err, Error::Security { .. }));
    }
}
