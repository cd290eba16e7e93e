//! The action evaluator.
//!
//! Actions are the only context mutators visible to flow authors. They run
//! in order; the first failure aborts the step and carries the action's
//! index and kind.

use async_recursion::async_recursion;
use serde_json::{json, Value};
use tracing::info;

use crate::context::{ExecutionContext, JsonMap, Scope};
use crate::error::{DispatchError, EngineResult, PathError};
use crate::event_bus::{EngineEvent, EngineEventKind};
use crate::flow::{Action, Flow, Step};
use crate::interpreter::{Engine, FlowOutcome};
use crate::path::{RefPath, Root};
use crate::template::{self, value_to_string};

impl Engine {
    #[async_recursion]
    pub(crate) async fn run_actions(
        &self,
        flow: &Flow,
        step: &Step,
        actions: &[Action],
        ctx: &ExecutionContext,
        scope: &Scope,
        depth: usize,
    ) -> EngineResult<()> {
        for (index, action) in actions.iter().enumerate() {
            self.run_action(flow, step, action, ctx, scope, depth)
                .await
                .map_err(|e| e.at_action(&flow.id, &step.id, index, action.kind_name()))?;
        }
        Ok(())
    }

    async fn run_action(
        &self,
        flow: &Flow,
        step: &Step,
        action: &Action,
        ctx: &ExecutionContext,
        scope: &Scope,
        depth: usize,
    ) -> EngineResult<()> {
        match action {
            Action::SetValue { path, value } => {
                let path = RefPath::parse(&self.render_in(ctx, scope, path).await?)?;
                let resolved = match value {
                    Value::String(template) => self.resolve_in(ctx, scope, template).await?,
                    other => other.clone(),
                };
                ctx.set_from_unit(&path, resolved, scope.unit).await?;
                Ok(())
            }
            Action::SwapValues { path1, path2 } => {
                let first = RefPath::parse(&self.render_in(ctx, scope, path1).await?)?;
                let second = RefPath::parse(&self.render_in(ctx, scope, path2).await?)?;
                ctx.swap(&first, &second).await?;
                Ok(())
            }
            Action::DisplayValue(path) => {
                let path = RefPath::parse(&self.render_in(ctx, scope, path).await?)?;
                let globals = ctx.globals(scope).await;
                let value =
                    template::lookup(&globals, &path).ok_or_else(|| PathError::NotFound {
                        path: path.as_str().to_string(),
                    })?;
                let text = match &value {
                    Value::Object(_) | Value::Array(_) => serde_json::to_string_pretty(&value)
                        .unwrap_or_else(|_| value.to_string()),
                    other => value_to_string(other),
                };
                self.collab("display", self.host.player.display(&text)).await
            }
            Action::ValidateValue(path) => {
                let path = RefPath::parse(&self.render_in(ctx, scope, path).await?)?;
                let declared = declared_type(flow, &path).ok_or_else(|| {
                    DispatchError::Validation {
                        path: path.as_str().to_string(),
                        message: "path names no declared output or variable".to_string(),
                    }
                })?;
                let globals = ctx.globals(scope).await;
                let value =
                    template::lookup(&globals, &path).ok_or_else(|| PathError::NotFound {
                        path: path.as_str().to_string(),
                    })?;
                let report = self
                    .collab("validate", self.host.validator.validate(&declared, &value))
                    .await?;
                if !report.is_ok() {
                    return Err(DispatchError::Validation {
                        path: path.as_str().to_string(),
                        message: report.errors.join("; "),
                    }
                    .into());
                }
                Ok(())
            }
            Action::LogEvent { kind, data } => {
                let mut rendered = JsonMap::new();
                for (key, value) in data {
                    let value = match value {
                        Value::String(template) => self.resolve_in(ctx, scope, template).await?,
                        other => other.clone(),
                    };
                    rendered.insert(key.clone(), value);
                }
                self.bus
                    .publish(EngineEvent::new(
                        EngineEventKind::Custom(kind.clone()),
                        &flow.id,
                        Some(step.id.clone()),
                        Value::Object(rendered),
                    ))
                    .await
            }
            Action::LogMessage(spec) => {
                let message = self.render_in(ctx, scope, spec.message()).await?;
                info!(flow_id = %flow.id, step_id = %step.id, "{}", message);
                self.bus
                    .publish(EngineEvent::new(
                        EngineEventKind::Message,
                        &flow.id,
                        Some(step.id.clone()),
                        json!({ "message": message }),
                    ))
                    .await
            }
            Action::FlowCall {
                flow: target,
                inputs,
                actions,
            } => {
                let outputs = match self
                    .run_subflow(ctx, scope, target, inputs, depth, false)
                    .await?
                {
                    FlowOutcome::Completed(outputs) => outputs,
                    FlowOutcome::Paused(_) => {
                        unreachable!("pause is disabled for action-invoked sub-flows")
                    }
                };
                let nested = Scope {
                    result: Some(Value::Object(outputs)),
                    ..scope.clone()
                };
                self.run_actions(flow, step, actions, ctx, &nested, depth)
                    .await
            }
        }
    }
}

/// The declared type governing a path: the output or variable declaration
/// named by the path's first segment.
fn declared_type(flow: &Flow, path: &RefPath) -> Option<String> {
    let id = &path.segments.first()?.text;
    match path.root {
        Root::Outputs => flow.output_decl(id).map(|decl| decl.ty.clone()),
        Root::Variables => flow.variable_decl(id).map(|decl| decl.ty.clone()),
        _ => None,
    }
}
