//! Snapshots of a single context and checkpoints of the whole instance.
//!
//! A [`Snapshot`] deep-copies the transferable part of a context's namespace
//! together with its protected names and parent link. Bindings that cannot be
//! transferred (functions, tool stubs, cyclic structures, containers holding
//! any of these) are retained in memory only: their lists and dicts are
//! copied on snapshot and again on every restore, while the functions and
//! other opaque objects inside them are shared. Retained bindings are not
//! written by [`Snapshot::to_bytes`].
//!
//! Snapshots are bound to the registry generation they were taken on and are
//! refused by any other instance.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn};

use crate::error::{Result, SandboxError};
use crate::interpreter::Interpreter;
use crate::sandbox::context::ExecutionContext;
use crate::sandbox::registry::RegistryState;
use crate::sandbox::transfer::{transfer_out_with, GraphCopier};
use crate::sandbox::value::{Transfer, Value};

/// Version of the serialized snapshot record.
pub const SNAPSHOT_FORMAT: u64 = 1;

/// Saved state of one context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    format: u64,
    generation: u64,
    context_id: String,
    protected_names: Vec<String>,
    namespace: IndexMap<String, Transfer>,
    parent_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    taken_at: u64,
    #[serde(skip)]
    retained: IndexMap<String, Value>,
}

impl Snapshot {
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn format(&self) -> u64 {
        self.format
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn protected_names(&self) -> &[String] {
        &self.protected_names
    }

    /// The persisted bindings.
    pub fn namespace(&self) -> &IndexMap<String, Transfer> {
        &self.namespace
    }

    /// Names kept in memory only.
    pub fn retained_names(&self) -> impl Iterator<Item = &str> {
        self.retained.keys().map(String::as_str)
    }

    /// When the snapshot was taken, in milliseconds since the Unix epoch.
    pub fn taken_at(&self) -> u64 {
        self.taken_at
    }

    /// Encode as a JSON record.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a record written by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Saved state of a whole registry: interpreter raw state plus every context.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    generation: u64,
    raw: Vec<u8>,
    contexts: Vec<Snapshot>,
    retired: HashSet<String>,
}

impl Checkpoint {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Snapshots of the contexts alive at checkpoint time, in creation order.
    pub fn contexts(&self) -> &[Snapshot] {
        &self.contexts
    }

    /// Size of the interpreter's raw state.
    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl RegistryState {
    fn check_generation(&self, found: u64) -> Result<()> {
        if found != self.generation {
            return Err(SandboxError::VersionMismatch {
                expected: self.generation,
                found,
            });
        }
        Ok(())
    }

    pub(crate) fn snapshot(&self, interp: &mut dyn Interpreter, id: &str) -> Result<Snapshot> {
        let ctx = self.context(id)?;
        let mut namespace = IndexMap::new();
        let mut retained = IndexMap::new();
        let mut copier = GraphCopier::default();
        for (name, value) in ctx.namespace() {
            match transfer_out_with(value, &mut |o| interp.export_opaque(o)) {
                Ok(data) => {
                    namespace.insert(name.clone(), data);
                }
                Err(_) => {
                    retained.insert(name.clone(), copier.copy(value));
                }
            }
        }
        debug!(
            context = id,
            persisted = namespace.len(),
            retained = retained.len(),
            "snapshot taken"
        );
        Ok(Snapshot {
            format: SNAPSHOT_FORMAT,
            generation: self.generation,
            context_id: id.to_string(),
            protected_names: ctx.guard().names().map(str::to_string).collect(),
            namespace,
            parent_id: ctx.parent().map(str::to_string),
            taken_at: now_millis(),
            retained,
        })
    }

    /// Rebuild a snapshot's namespace inside the interpreter.
    fn import_namespace(
        interp: &mut dyn Interpreter,
        snapshot: &Snapshot,
    ) -> Result<IndexMap<String, Value>> {
        let mut namespace = IndexMap::with_capacity(snapshot.namespace.len() + snapshot.retained.len());
        for (name, data) in &snapshot.namespace {
            namespace.insert(name.clone(), interp.import_value(Value::from(data.clone()))?);
        }
        let mut copier = GraphCopier::default();
        for (name, value) in &snapshot.retained {
            namespace.insert(name.clone(), copier.copy(value));
        }
        Ok(namespace)
    }

    pub(crate) fn restore(&mut self, interp: &mut dyn Interpreter, snapshot: &Snapshot) -> Result<()> {
        let span = info_span!("restore", context = %snapshot.context_id);
        let _enter = span.enter();
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(SandboxError::VersionMismatch {
                expected: SNAPSHOT_FORMAT,
                found: snapshot.format,
            });
        }
        self.check_generation(snapshot.generation)?;

        let id = snapshot.context_id.as_str();
        let parent = snapshot.parent_id.as_deref();
        match self.contexts.get(id) {
            Some(live) if live.parent() != parent => {
                return Err(SandboxError::NoSuchParent(
                    parent.unwrap_or_default().to_string(),
                ));
            }
            Some(_) => {}
            None => {
                if let Some(parent) = parent {
                    if !self.contexts.contains_key(parent) {
                        return Err(SandboxError::NoSuchParent(parent.to_string()));
                    }
                }
            }
        }

        let namespace = Self::import_namespace(interp, snapshot)?;
        let protected = snapshot.protected_names.iter().cloned();
        match self.contexts.get_mut(id) {
            Some(live) => live.replace_state(namespace, protected),
            None => {
                let mut ctx = ExecutionContext::new(id, parent.map(str::to_string));
                ctx.replace_state(namespace, protected);
                self.contexts.insert(id.to_string(), ctx);
                self.retired.remove(id);
                debug!("destroyed context re-created");
            }
        }
        debug!(
            bindings = snapshot.namespace.len() + snapshot.retained.len(),
            "snapshot restored"
        );
        Ok(())
    }

    pub(crate) fn checkpoint(&self, interp: &mut dyn Interpreter) -> Result<Checkpoint> {
        let raw = interp.save_raw_state()?;
        let ids: Vec<String> = self.contexts.keys().cloned().collect();
        let contexts = ids
            .iter()
            .map(|id| self.snapshot(&mut *interp, id))
            .collect::<Result<Vec<_>>>()?;
        debug!(contexts = contexts.len(), raw = raw.len(), "checkpoint taken");
        Ok(Checkpoint {
            generation: self.generation,
            raw,
            contexts,
            retired: self.retired.clone(),
        })
    }

    pub(crate) fn rollback(&mut self, interp: &mut dyn Interpreter, checkpoint: &Checkpoint) -> Result<()> {
        let span = info_span!("rollback", generation = checkpoint.generation);
        let _enter = span.enter();
        self.check_generation(checkpoint.generation)?;

        // Namespaces are imported against the checkpoint's interpreter state,
        // so keep the current state to fall back on if any import fails.
        let current = interp.save_raw_state()?;
        interp.load_raw_state(&checkpoint.raw)?;
        let imported = checkpoint
            .contexts
            .iter()
            .map(|snapshot| Self::import_namespace(&mut *interp, snapshot))
            .collect::<Result<Vec<_>>>();
        let namespaces = match imported {
            Ok(namespaces) => namespaces,
            Err(err) => {
                if let Err(undo) = interp.load_raw_state(&current) {
                    warn!(error = %undo, "interpreter state could not be put back");
                }
                return Err(err);
            }
        };

        let mut contexts = IndexMap::with_capacity(checkpoint.contexts.len());
        for (snapshot, namespace) in checkpoint.contexts.iter().zip(namespaces) {
            let id = snapshot.context_id.clone();
            let mut ctx = self
                .contexts
                .shift_remove(&id)
                .unwrap_or_else(|| ExecutionContext::new(id.clone(), snapshot.parent_id.clone()));
            ctx.replace_state(namespace, snapshot.protected_names.iter().cloned());
            contexts.insert(id, ctx);
        }
        let dropped = self.contexts.len();
        self.contexts = contexts;
        self.retired = checkpoint.retired.clone();
        self.abort = None;
        debug!(
            restored = self.contexts.len(),
            dropped,
            "rolled back to checkpoint"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sandbox::config::SandboxConfig;
    use crate::sandbox::registry::Registry;

    #[test]
    fn test_record_field_order() {
        let mut reg = Registry::new(SandboxConfig::default()).unwrap();
        reg.init_local("a", None).unwrap();
        reg.exec("a", "x = [1, 2]").unwrap();
        let bytes = reg.snapshot("a").unwrap().to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let keys = [
            "\"format\"",
            "\"generation\"",
            "\"context_id\"",
            "\"protected_names\"",
            "\"namespace\"",
            "\"parent_id\"",
            "\"taken_at\"",
        ];
        let positions: Vec<usize> = keys.iter().map(|k| text.find(k).unwrap()).collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
        assert!(!text.contains("retained"));
    }

    #[test]
    fn test_functions_are_retained_not_persisted() {
        let mut reg = Registry::new(SandboxConfig::default()).unwrap();
        reg.init_local("a", None).unwrap();
        reg.exec("a", "def f():\n    return 1\nn = 3").unwrap();
        let snap = reg.snapshot("a").unwrap();
        assert_eq!(snap.retained_names().collect::<Vec<_>>(), vec!["f"]);
        assert_eq!(snap.namespace().get("n"), Some(&Transfer::Int(3)));

        let decoded = Snapshot::from_bytes(&snap.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.retained_names().count(), 0);
        assert_eq!(decoded.namespace(), snap.namespace());
    }

    #[test]
    fn test_format_mismatch() {
        let mut reg = Registry::new(SandboxConfig::default()).unwrap();
        reg.init_local("a", None).unwrap();
        let mut snap = reg.snapshot("a").unwrap();
        snap.format = 99;
        let err = reg.restore(&snap).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::VersionMismatch {
                expected: SNAPSHOT_FORMAT,
                found: 99
            }
        ));
    }
}
