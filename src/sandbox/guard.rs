//! Variable guard: the protected-name policy of a context.

use std::collections::BTreeSet;

use tracing::warn;

use crate::error::ExecError;

/// The kind of binding event being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingEvent {
    /// Assignment, augmented assignment, `def`, loop or `except` target.
    Store,
    /// `del name`.
    Delete,
}

/// The set of names a context refuses to rebind.
///
/// Membership is exact and case-sensitive. Only the host changes the set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableGuard {
    protected: BTreeSet<String>,
}

impl VariableGuard {
    /// An empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Protect `name`. Returns `false` if it already was.
    pub fn protect(&mut self, name: impl Into<String>) -> bool {
        self.protected.insert(name.into())
    }

    /// Remove protection from `name`. Returns `false` if it was not protected.
    pub fn unprotect(&mut self, name: &str) -> bool {
        self.protected.remove(name)
    }

    /// Whether `name` is protected here.
    pub fn is_protected(&self, name: &str) -> bool {
        self.protected.contains(name)
    }

    /// Protected names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.protected.iter().map(String::as_str)
    }

    /// Number of protected names.
    pub fn len(&self) -> usize {
        self.protected.len()
    }

    /// Whether nothing is protected.
    pub fn is_empty(&self) -> bool {
        self.protected.is_empty()
    }

    pub(crate) fn replace(&mut self, names: impl IntoIterator<Item = String>) {
        self.protected = names.into_iter().collect();
    }
}

/// Check a binding event against a chain of guards, innermost first.
///
/// `owner` names the context the event happens in and is only used for
/// logging.
pub fn check_binding<'a>(
    guards: impl IntoIterator<Item = &'a VariableGuard>,
    owner: &str,
    name: &str,
    event: BindingEvent,
) -> Result<(), ExecError> {
    if guards.into_iter().any(|guard| guard.is_protected(name)) {
        warn!(context = owner, name, ?event, "rejected binding to protected name");
        return Err(ExecError::protection_violation(name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protect_is_idempotent() {
        let mut guard = VariableGuard::new();
        assert!(guard.protect("x"));
        assert!(!guard.protect("x"));
        assert_eq!(guard.len(), 1);
        assert!(guard.unprotect("x"));
        assert!(!guard.unprotect("x"));
    }

    #[test]
    fn test_membership_is_case_sensitive() {
        let mut guard = VariableGuard::new();
        guard.protect("Token");
        assert!(guard.is_protected("Token"));
        assert!(!guard.is_protected("token"));
    }

    #[test]
    fn test_check_walks_the_chain() {
        let mut parent = VariableGuard::new();
        parent.protect("greet");
        let child = VariableGuard::new();

        let err = check_binding([&child, &parent], "child", "greet", BindingEvent::Store)
            .unwrap_err();
        assert!(err.is_protection_violation());
        assert_eq!(err.message, "Cannot modify protected name 'greet'");

        assert!(check_binding([&child, &parent], "child", "other", BindingEvent::Delete).is_ok());
    }

    #[test]
    fn test_names_are_sorted() {
        let mut guard = VariableGuard::new();
        guard.protect("b");
        guard.protect("a");
        assert_eq!(guard.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
