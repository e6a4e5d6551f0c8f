//! Object transfer codec.
//!
//! Every value that crosses the host/sandbox boundary goes through here. The
//! codec accepts the transfer-safe kinds only, rejects cycles, bounds the
//! nesting depth and always produces an independent deep copy.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::TransferError;
use crate::sandbox::value::{Opaque, Transfer, Value};

/// Maximum nesting depth of a transferred value.
pub const MAX_TRANSFER_DEPTH: usize = 128;

/// Resolver for opaque values an interpreter can materialize itself.
pub type OpaqueResolver<'a> = dyn FnMut(&Opaque) -> Option<Result<Transfer, TransferError>> + 'a;

/// Copy a value into a context.
///
/// The result shares no cells with the input.
pub fn transfer_in(value: &Value) -> Result<Value, TransferError> {
    transfer_out(value).map(Value::from)
}

/// Copy a value out of a context into a host-owned tree.
pub fn transfer_out(value: &Value) -> Result<Transfer, TransferError> {
    transfer_out_with(value, &mut |_| None)
}

/// Like [`transfer_out`], giving `resolve` a chance to convert opaque values
/// (for example handles into a guest heap) before they are rejected.
pub fn transfer_out_with(
    value: &Value,
    resolve: &mut OpaqueResolver<'_>,
) -> Result<Transfer, TransferError> {
    Walker {
        on_path: Vec::new(),
        location: Vec::new(),
        resolve,
    }
    .walk(value)
}

/// Whether `value` can cross the boundary without an interpreter's help.
pub fn is_transfer_safe(value: &Value) -> bool {
    transfer_out(value).is_ok()
}

/// Duplicates the lists and dicts of live value graphs, keeping their
/// sharing and cycles. Scalars, host gateways and opaque objects are shared
/// with the source. One copier keeps sharing across every value it copies.
#[derive(Default)]
pub(crate) struct GraphCopier {
    copies: HashMap<*const (), Value>,
    pending: Vec<(Value, Value)>,
}

impl GraphCopier {
    pub(crate) fn copy(&mut self, value: &Value) -> Value {
        let root = self.node(value);
        while let Some((source, target)) = self.pending.pop() {
            match (source, target) {
                (Value::List(source), Value::List(target)) => {
                    let items = source.borrow().clone();
                    let copied = items.iter().map(|item| self.node(item)).collect();
                    *target.borrow_mut() = copied;
                }
                (Value::Dict(source), Value::Dict(target)) => {
                    let entries = source.borrow().clone();
                    let copied = entries
                        .iter()
                        .map(|(key, item)| (key.clone(), self.node(item)))
                        .collect();
                    *target.borrow_mut() = copied;
                }
                _ => {}
            }
        }
        root
    }

    /// The copy of `value`'s outermost cell, left empty until it is popped.
    fn node(&mut self, value: &Value) -> Value {
        let (ptr, empty) = match value {
            Value::List(items) => (Rc::as_ptr(items) as *const (), Value::list(Vec::new())),
            Value::Dict(entries) => (Rc::as_ptr(entries) as *const (), Value::dict(IndexMap::new())),
            other => return other.clone(),
        };
        if let Some(copy) = self.copies.get(&ptr) {
            return copy.clone();
        }
        self.copies.insert(ptr, empty.clone());
        self.pending.push((value.clone(), empty.clone()));
        empty
    }
}

struct Walker<'r, 'a> {
    on_path: Vec<*const ()>,
    location: Vec<String>,
    resolve: &'r mut OpaqueResolver<'a>,
}

impl Walker<'_, '_> {
    fn path(&self) -> String {
        let mut path = String::from("$");
        for segment in &self.location {
            path.push_str(segment);
        }
        path
    }

    fn enter(&mut self, ptr: *const ()) -> Result<(), TransferError> {
        if self.on_path.contains(&ptr) {
            return Err(TransferError::CyclicReference { path: self.path() });
        }
        if self.on_path.len() >= MAX_TRANSFER_DEPTH {
            return Err(TransferError::TooDeep {
                limit: MAX_TRANSFER_DEPTH,
            });
        }
        self.on_path.push(ptr);
        Ok(())
    }

    fn walk(&mut self, value: &Value) -> Result<Transfer, TransferError> {
        match value {
            Value::None => Ok(Transfer::None),
            Value::Bool(b) => Ok(Transfer::Bool(*b)),
            Value::Int(i) => Ok(Transfer::Int(*i)),
            Value::Float(f) => Ok(Transfer::Float(*f)),
            Value::Str(s) => Ok(Transfer::Str(s.to_string())),
            Value::List(items) => {
                self.enter(Rc::as_ptr(items) as *const ())?;
                let items = items.borrow();
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    self.location.push(format!("[{i}]"));
                    out.push(self.walk(item)?);
                    self.location.pop();
                }
                self.on_path.pop();
                Ok(Transfer::List(out))
            }
            Value::Dict(entries) => {
                self.enter(Rc::as_ptr(entries) as *const ())?;
                let entries = entries.borrow();
                let mut out = IndexMap::with_capacity(entries.len());
                for (key, item) in entries.iter() {
                    self.location.push(format!("[{key:?}]"));
                    out.insert(key.clone(), self.walk(item)?);
                    self.location.pop();
                }
                self.on_path.pop();
                Ok(Transfer::Map(out))
            }
            Value::Host(_) => Err(TransferError::UnsupportedType {
                type_name: value.type_name().to_string(),
                path: self.path(),
            }),
            Value::Opaque(opaque) => match (self.resolve)(opaque) {
                Some(resolved) => resolved,
                None => Err(TransferError::UnsupportedType {
                    type_name: opaque.kind().to_string(),
                    path: self.path(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use crate::sandbox::value::Container;

    fn transfer_strategy() -> impl Strategy<Value = Transfer> {
        let leaf = prop_oneof![
            Just(Transfer::None),
            any::<bool>().prop_map(Transfer::Bool),
            any::<i64>().prop_map(Transfer::Int),
            (-1.0e12f64..1.0e12).prop_map(Transfer::Float),
            "[a-z ]{0,8}".prop_map(Transfer::Str),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Transfer::List),
                prop::collection::vec(("[a-z]{1,4}", inner), 0..4)
                    .prop_map(|entries| Transfer::Map(entries.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn round_trip_preserves_transfer_safe_values(t in transfer_strategy()) {
            let inside = transfer_in(&Value::from(t.clone())).unwrap();
            prop_assert_eq!(transfer_out(&inside).unwrap(), t);
        }
    }

    #[test]
    fn test_transfer_in_copies_cells() {
        let original = Value::list(vec![Value::Int(1)]);
        let copy = transfer_in(&original).unwrap();
        if let Value::List(items) = &original {
            items.borrow_mut().push(Value::Int(2));
        }
        assert_eq!(transfer_out(&copy).unwrap(), Transfer::from(vec![1i64]));
    }

    #[test]
    fn test_shared_acyclic_subtree_is_accepted() {
        let shared = Value::list(vec![Value::Int(7)]);
        let outer = Value::list(vec![shared.clone(), shared]);
        assert_eq!(
            transfer_out(&outer).unwrap(),
            Transfer::List(vec![Transfer::from(vec![7i64]), Transfer::from(vec![7i64])])
        );
    }

    #[test]
    fn test_graph_copy_keeps_sharing_and_cycles() {
        let shared = Value::list(vec![Value::Int(1)]);
        let outer = Value::list(vec![shared.clone(), shared.clone()]);
        let Value::List(cell) = &outer else { unreachable!() };
        cell.borrow_mut().push(outer.clone());

        let copy = GraphCopier::default().copy(&outer);
        let Value::List(copied) = &copy else { unreachable!() };
        assert!(!Rc::ptr_eq(cell, copied));
        let items = copied.borrow().clone();
        let (Value::List(first), Value::List(second), Value::List(back)) =
            (&items[0], &items[1], &items[2])
        else {
            unreachable!()
        };
        assert!(Rc::ptr_eq(first, second));
        assert!(Rc::ptr_eq(back, copied));

        // the copy is independent of the source
        if let Value::List(source) = &shared {
            source.borrow_mut().push(Value::Int(2));
        }
        assert_eq!(first.borrow().len(), 1);

        cell.borrow_mut().clear();
        copied.borrow_mut().clear();
    }

    #[test]
    fn test_graph_copy_of_deep_value_does_not_recurse() {
        let mut value = Value::Int(0);
        for _ in 0..200_000 {
            value = Value::list(vec![value]);
        }
        let copy = GraphCopier::default().copy(&value);
        assert!(matches!(copy, Value::List(_)));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let items = Rc::new(Container::new(vec![Value::Int(1)]));
        items.borrow_mut().push(Value::List(items.clone()));
        let err = transfer_out(&Value::List(items.clone())).unwrap_err();
        assert_eq!(
            err,
            TransferError::CyclicReference {
                path: "$[1]".to_string()
            }
        );
        items.borrow_mut().clear();
    }

    #[test]
    fn test_unsupported_type_reports_path() {
        let mut entries = IndexMap::new();
        entries.insert("f".to_string(), Value::Host("gateway".into()));
        let err = transfer_in(&Value::dict(entries)).unwrap_err();
        assert_eq!(
            err,
            TransferError::UnsupportedType {
                type_name: "host_function".to_string(),
                path: "$[\"f\"]".to_string(),
            }
        );
    }

    #[test]
    fn test_depth_is_bounded() {
        let mut value = Value::Int(0);
        for _ in 0..=MAX_TRANSFER_DEPTH {
            value = Value::list(vec![value]);
        }
        assert!(matches!(
            transfer_out(&value),
            Err(TransferError::TooDeep { .. })
        ));
    }

    #[test]
    fn test_resolver_converts_opaque() {
        let handle = Value::Opaque(Opaque::new("guest", 5u64));
        let out = transfer_out_with(&handle, &mut |opaque| {
            opaque.downcast_ref::<u64>().map(|id| Ok(Transfer::Int(*id as i64)))
        })
        .unwrap();
        assert_eq!(out, Transfer::Int(5));
        assert!(!is_transfer_safe(&handle));
    }
}
