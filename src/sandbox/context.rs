//! Execution contexts: named, isolated namespaces with an optional parent.

use std::time::SystemTime;

use indexmap::IndexMap;

use crate::sandbox::guard::VariableGuard;
use crate::sandbox::value::Value;

/// Whether a context currently has a frame on the call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    /// No frame is executing in this context.
    Idle,
    /// At least one frame (possibly suspended in a tool call) targets it.
    Running,
}

/// A named namespace inside a registry.
///
/// The parent link is fixed at creation. Lookups that miss the local
/// namespace fall through to the parent's live namespace; writes always land
/// here.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    id: String,
    parent: Option<String>,
    namespace: IndexMap<String, Value>,
    guard: VariableGuard,
    status: ContextStatus,
    created_at: SystemTime,
}

impl ExecutionContext {
    pub(crate) fn new(id: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            id: id.into(),
            parent,
            namespace: IndexMap::new(),
            guard: VariableGuard::new(),
            status: ContextStatus::Idle,
            created_at: SystemTime::now(),
        }
    }

    /// The context id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The parent id, for child contexts.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Local bindings in definition order.
    pub fn namespace(&self) -> &IndexMap<String, Value> {
        &self.namespace
    }

    /// A local binding, without fallthrough.
    pub fn get_local(&self, name: &str) -> Option<&Value> {
        self.namespace.get(name)
    }

    /// Local names in definition order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.namespace.keys().map(String::as_str)
    }

    /// This context's own protection policy.
    pub fn guard(&self) -> &VariableGuard {
        &self.guard
    }

    /// Whether `name` is protected here (ignoring ancestors).
    pub fn is_protected(&self, name: &str) -> bool {
        self.guard.is_protected(name)
    }

    /// Current status.
    pub fn status(&self) -> ContextStatus {
        self.status
    }

    /// Creation time.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub(crate) fn guard_mut(&mut self) -> &mut VariableGuard {
        &mut self.guard
    }

    pub(crate) fn bind(&mut self, name: &str, value: Value) {
        self.namespace.insert(name.to_string(), value);
    }

    pub(crate) fn unbind(&mut self, name: &str) -> bool {
        self.namespace.shift_remove(name).is_some()
    }

    pub(crate) fn set_status(&mut self, status: ContextStatus) {
        self.status = status;
    }

    pub(crate) fn replace_state(
        &mut self,
        namespace: IndexMap<String, Value>,
        protected: impl IntoIterator<Item = String>,
    ) {
        self.namespace = namespace;
        self.guard.replace(protected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_is_idle_and_empty() {
        let ctx = ExecutionContext::new("main", None);
        assert_eq!(ctx.id(), "main");
        assert_eq!(ctx.parent(), None);
        assert_eq!(ctx.status(), ContextStatus::Idle);
        assert!(ctx.namespace().is_empty());
    }

    #[test]
    fn test_bind_keeps_definition_order() {
        let mut ctx = ExecutionContext::new("child", Some("main".into()));
        ctx.bind("b", Value::Int(1));
        ctx.bind("a", Value::Int(2));
        ctx.bind("b", Value::Int(3));
        assert_eq!(ctx.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(ctx.get_local("b"), Some(&Value::Int(3)));
        assert!(ctx.unbind("b"));
        assert!(!ctx.unbind("b"));
    }
}
