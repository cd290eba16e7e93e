//! Execution context: the mutable state of a single flow invocation.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::PathError;
use crate::path::{self, RefPath, Root};

pub type JsonMap = Map<String, Value>;

/// Deep, value-level copy of a context, sufficient to resume a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSnapshot {
    pub inputs: Value,
    pub outputs: Value,
    pub variables: Value,
    pub result: Value,
    pub item: Value,
}

#[derive(Debug)]
struct ContextData {
    inputs: Value,
    outputs: Value,
    variables: Value,
    result: Value,
    item: Value,
}

impl ContextData {
    fn root(&self, root: Root) -> Option<&Value> {
        match root {
            Root::Inputs => Some(&self.inputs),
            Root::Outputs => Some(&self.outputs),
            Root::Variables => Some(&self.variables),
            Root::Result => Some(&self.result),
            Root::Item => Some(&self.item),
            Root::Key | Root::Value | Root::Entry => None,
        }
    }

    fn root_mut(&mut self, root: Root) -> Option<&mut Value> {
        match root {
            Root::Outputs => Some(&mut self.outputs),
            Root::Variables => Some(&mut self.variables),
            _ => None,
        }
    }

    fn read(&self, path: &RefPath) -> Result<Value, PathError> {
        let root = self.root(path.root).ok_or_else(|| PathError::NotFound {
            path: path.as_str().to_string(),
        })?;
        path::read_value(root, &path.segments, path.as_str()).cloned()
    }

    fn write(&mut self, path: &RefPath, value: Value) -> Result<(), PathError> {
        if !path.root.is_writable() {
            return Err(PathError::ReadOnlyRoot {
                path: path.as_str().to_string(),
            });
        }
        let root = self.root_mut(path.root).ok_or_else(|| PathError::ReadOnlyRoot {
            path: path.as_str().to_string(),
        })?;
        path::write_value(root, &path.segments, value, path.as_str())
    }
}

/// Per-unit render overlay used by `dice_sequence` iterations, table rows
/// and parallel step units. Fields that are `None` fall back to the
/// context-level bindings.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub result: Option<Value>,
    pub item: Option<Value>,
    pub key: Option<Value>,
    pub value: Option<Value>,
    pub entry: Option<Value>,
    pub unit: Option<usize>,
}

impl Scope {
    pub fn with_result(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }
}

pub struct ExecutionContext {
    data: RwLock<ContextData>,
    writes: StdMutex<Option<HashMap<String, usize>>>,
}

impl ExecutionContext {
    pub fn new(inputs: JsonMap) -> Self {
        Self {
            data: RwLock::new(ContextData {
                inputs: Value::Object(inputs),
                outputs: Value::Object(Map::new()),
                variables: Value::Object(Map::new()),
                result: Value::Null,
                item: Value::Null,
            }),
            writes: StdMutex::new(None),
        }
    }

    pub fn from_snapshot(snapshot: ContextSnapshot) -> Self {
        Self {
            data: RwLock::new(ContextData {
                inputs: snapshot.inputs,
                outputs: snapshot.outputs,
                variables: snapshot.variables,
                result: snapshot.result,
                item: snapshot.item,
            }),
            writes: StdMutex::new(None),
        }
    }

    pub async fn snapshot(&self) -> ContextSnapshot {
        let data = self.data.read().await;
        ContextSnapshot {
            inputs: data.inputs.clone(),
            outputs: data.outputs.clone(),
            variables: data.variables.clone(),
            result: data.result.clone(),
            item: data.item.clone(),
        }
    }

    pub async fn has_input(&self, id: &str) -> bool {
        let data = self.data.read().await;
        data.inputs.get(id).is_some()
    }

    pub async fn get(&self, path: &RefPath) -> Result<Value, PathError> {
        let data = self.data.read().await;
        data.read(path)
    }

    pub async fn set(&self, path: &RefPath, value: Value) -> Result<(), PathError> {
        self.set_from_unit(path, value, None).await
    }

    /// Write from a parallel unit. While a parallel step is active the
    /// context records which unit wrote each path; a second writer to the
    /// same path is a `ConcurrentWriteConflict`.
    pub async fn set_from_unit(
        &self,
        path: &RefPath,
        value: Value,
        unit: Option<usize>,
    ) -> Result<(), PathError> {
        if let Some(unit) = unit {
            let mut writes = self.writes.lock().expect("write tracker poisoned");
            if let Some(tracker) = writes.as_mut() {
                match tracker.get(path.as_str()) {
                    Some(owner) if *owner != unit => {
                        return Err(PathError::ConcurrentWriteConflict {
                            path: path.as_str().to_string(),
                        });
                    }
                    _ => {
                        tracker.insert(path.as_str().to_string(), unit);
                    }
                }
            }
        }
        let mut data = self.data.write().await;
        data.write(path, value)
    }

    /// Atomic exchange of the values at two existing paths.
    pub async fn swap(&self, first: &RefPath, second: &RefPath) -> Result<(), PathError> {
        let mut data = self.data.write().await;
        let a = data.read(first)?;
        let b = data.read(second)?;
        data.write(first, b)?;
        data.write(second, a)
    }

    pub async fn bind_result(&self, value: Value) {
        self.data.write().await.result = value;
    }

    pub async fn result(&self) -> Value {
        self.data.read().await.result.clone()
    }

    pub async fn bind_item(&self, value: Value) {
        self.data.write().await.item = value;
    }

    pub async fn clear_item(&self) {
        self.data.write().await.item = Value::Null;
    }

    pub fn begin_parallel(&self) {
        *self.writes.lock().expect("write tracker poisoned") = Some(HashMap::new());
    }

    pub fn end_parallel(&self) {
        *self.writes.lock().expect("write tracker poisoned") = None;
    }

    /// Projected copy of the declared output mapping.
    pub async fn outputs(&self) -> JsonMap {
        let data = self.data.read().await;
        match &data.outputs {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        }
    }

    /// The template globals tree: context roots plus the scope overlay.
    /// `item`, `key`, `value` and `entry` appear only when bound so that
    /// strict rendering still flags references outside their scope.
    pub async fn globals(&self, scope: &Scope) -> Value {
        let data = self.data.read().await;
        let mut map = Map::new();
        map.insert("inputs".to_string(), data.inputs.clone());
        map.insert("outputs".to_string(), data.outputs.clone());
        map.insert("variables".to_string(), data.variables.clone());
        map.insert(
            "result".to_string(),
            scope.result.clone().unwrap_or_else(|| data.result.clone()),
        );
        let item = scope.item.clone().unwrap_or_else(|| data.item.clone());
        if !item.is_null() {
            map.insert("item".to_string(), item);
        }
        if let Some(key) = &scope.key {
            map.insert("key".to_string(), key.clone());
        }
        if let Some(value) = &scope.value {
            map.insert("value".to_string(), value.clone());
        }
        if let Some(entry) = &scope.entry {
            map.insert("entry".to_string(), entry.clone());
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut inputs = Map::new();
        inputs.insert("system".to_string(), json!("knave"));
        ExecutionContext::new(inputs)
    }

    fn p(raw: &str) -> RefPath {
        RefPath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let ctx = ctx();
        ctx.set(&p("outputs.character.name"), json!("Rin"))
            .await
            .unwrap();
        let v = ctx.get(&p("outputs.character.name")).await.unwrap();
        assert_eq!(v, json!("Rin"));
    }

    #[tokio::test]
    async fn test_inputs_are_read_only() {
        let ctx = ctx();
        let err = ctx.set(&p("inputs.system"), json!("other")).await;
        assert!(matches!(err, Err(PathError::ReadOnlyRoot { .. })));
        assert_eq!(ctx.get(&p("inputs.system")).await.unwrap(), json!("knave"));
    }

    #[tokio::test]
    async fn test_swap_round_trip_restores_context() {
        let ctx = ctx();
        ctx.set(&p("variables.a"), json!(1)).await.unwrap();
        ctx.set(&p("variables.b"), json!({"x": 2})).await.unwrap();
        let before = ctx.snapshot().await;

        ctx.swap(&p("variables.a"), &p("variables.b")).await.unwrap();
        assert_eq!(ctx.get(&p("variables.a")).await.unwrap(), json!({"x": 2}));

        ctx.swap(&p("variables.a"), &p("variables.b")).await.unwrap();
        assert_eq!(ctx.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_swap_requires_both_sides() {
        let ctx = ctx();
        ctx.set(&p("variables.a"), json!(1)).await.unwrap();
        let err = ctx.swap(&p("variables.a"), &p("variables.missing")).await;
        assert!(matches!(err, Err(PathError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let ctx = ctx();
        ctx.set(&p("outputs.hp"), json!(7)).await.unwrap();
        ctx.bind_result(json!({"total": 3})).await;

        let snapshot = ctx.snapshot().await;
        let restored = ExecutionContext::from_snapshot(snapshot.clone());
        assert_eq!(restored.snapshot().await, snapshot);
        assert_eq!(restored.get(&p("outputs.hp")).await.unwrap(), json!(7));
        assert_eq!(restored.result().await, json!({"total": 3}));
    }

    #[tokio::test]
    async fn test_parallel_write_conflict() {
        let ctx = ctx();
        ctx.begin_parallel();
        ctx.set_from_unit(&p("outputs.x"), json!(1), Some(0))
            .await
            .unwrap();
        ctx.set_from_unit(&p("outputs.x"), json!(1), Some(0))
            .await
            .unwrap();
        let err = ctx.set_from_unit(&p("outputs.x"), json!(2), Some(1)).await;
        assert!(matches!(err, Err(PathError::ConcurrentWriteConflict { .. })));
        ctx.end_parallel();

        // Disjoint paths commute.
        ctx.begin_parallel();
        ctx.set_from_unit(&p("outputs.a"), json!(1), Some(0))
            .await
            .unwrap();
        ctx.set_from_unit(&p("outputs.b"), json!(2), Some(1))
            .await
            .unwrap();
        ctx.end_parallel();
    }

    #[tokio::test]
    async fn test_globals_overlay() {
        let ctx = ctx();
        ctx.bind_result(json!({"total": 4})).await;
        let globals = ctx.globals(&Scope::default()).await;
        assert_eq!(globals["result"]["total"], json!(4));
        assert!(globals.get("item").is_none());

        let scope = Scope {
            result: Some(json!({"total": 9})),
            item: Some(json!("str")),
            ..Scope::default()
        };
        let globals = ctx.globals(&scope).await;
        assert_eq!(globals["result"]["total"], json!(9));
        assert_eq!(globals["item"], json!("str"));
    }
}
