//! The flow interpreter: INIT → RUN → TRANSITION → DONE/PAUSE.

use std::future::Future;
use std::sync::Arc;

use async_recursion::async_recursion;
use serde_json::{json, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::{ExecutionContext, JsonMap, Scope};
use crate::error::{
    CollaboratorError, DispatchError, EngineResult, GrimoireError, LoadError,
};
use crate::event_bus::{EngineEvent, EngineEventKind, EventBus, EventReceiver};
use crate::flow::Flow;
use crate::host::{CollaboratorResult, Host};
use crate::registry::FlowRegistry;
use crate::template::{self, TemplateEngine};
use crate::ticket::{CheckpointFrame, ResumeTicket};

/// What an invocation hands back to the caller: projected outputs, or a
/// resume ticket when the host paused the flow.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(JsonMap),
    Paused(ResumeTicket),
}

#[derive(Debug)]
pub(crate) enum FlowOutcome {
    Completed(JsonMap),
    Paused(Vec<CheckpointFrame>),
}

#[derive(Debug)]
pub(crate) enum StepOutcome {
    Advanced {
        result: Option<Value>,
        next_override: Option<String>,
        terminal: bool,
    },
    Paused(Vec<CheckpointFrame>),
}

impl StepOutcome {
    pub(crate) fn advanced(result: Option<Value>) -> Self {
        StepOutcome::Advanced {
            result,
            next_override: None,
            terminal: false,
        }
    }
}

enum Entry {
    Start,
    At(String),
    ResumeChild {
        step_id: String,
        frames: Vec<CheckpointFrame>,
    },
}

/// The engine: a flow registry, a host bundle, the template adapter and the
/// event bus, shared by every invocation.
pub struct Engine {
    pub(crate) registry: Arc<FlowRegistry>,
    pub(crate) host: Arc<Host>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) templates: TemplateEngine,
    pub(crate) config: EngineConfig,
}

impl Engine {
    pub fn new(
        registry: Arc<FlowRegistry>,
        host: Arc<Host>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let templates = TemplateEngine::new(config.strict_templates)?;
        let bus = Arc::new(EventBus::new(config.event_buffer_size));
        Ok(Self {
            registry,
            host,
            bus,
            templates,
            config,
        })
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    /// Run a flow to completion or the first honored pause.
    #[instrument(skip(self, inputs))]
    pub async fn run(&self, flow_id: &str, inputs: JsonMap) -> EngineResult<RunOutcome> {
        let flow = match self.registry.get(flow_id) {
            Ok(flow) => flow,
            Err(e) => return self.finish(flow_id, Err(e)).await,
        };
        let invocation = Uuid::new_v4();
        self.emit(
            EngineEventKind::FlowStarted,
            flow_id,
            None,
            json!({"invocation": invocation.to_string()}),
        )
        .await;
        let ctx = ExecutionContext::new(inputs);
        let outcome = self.run_flow(flow, ctx, Entry::Start, 0, true).await;
        self.finish(flow_id, outcome).await
    }

    /// Continue a paused invocation from its ticket.
    #[instrument(skip(self, ticket))]
    pub async fn resume(&self, ticket: ResumeTicket) -> EngineResult<RunOutcome> {
        let flow_id = ticket
            .frames
            .first()
            .map(|frame| frame.flow_id.clone())
            .unwrap_or_default();
        let outcome = self.resume_frames(ticket.frames, 0).await;
        self.finish(&flow_id, outcome).await
    }

    async fn finish(
        &self,
        flow_id: &str,
        outcome: EngineResult<FlowOutcome>,
    ) -> EngineResult<RunOutcome> {
        match outcome {
            Ok(FlowOutcome::Completed(outputs)) => Ok(RunOutcome::Completed(outputs)),
            Ok(FlowOutcome::Paused(frames)) => Ok(RunOutcome::Paused(ResumeTicket { frames })),
            Err(error) => {
                self.emit(
                    EngineEventKind::Error,
                    flow_id,
                    None,
                    json!({"error": error.to_string()}),
                )
                .await;
                Err(error)
            }
        }
    }

    #[async_recursion]
    pub(crate) async fn resume_frames(
        &self,
        frames: Vec<CheckpointFrame>,
        depth: usize,
    ) -> EngineResult<FlowOutcome> {
        let mut frames = frames.into_iter();
        let frame = frames.next().ok_or_else(|| LoadError::Schema {
            message: "resume ticket has no frames".to_string(),
        })?;
        let rest: Vec<CheckpointFrame> = frames.collect();

        let flow = self.registry.get(&frame.flow_id)?;
        if flow.version != frame.flow_version {
            return Err(GrimoireError::VersionMismatch {
                flow_id: frame.flow_id,
                ticket_version: frame.flow_version,
                registry_version: flow.version,
            });
        }

        let ctx = ExecutionContext::from_snapshot(frame.context);
        let entry = if rest.is_empty() {
            Entry::At(frame.step_id)
        } else {
            Entry::ResumeChild {
                step_id: frame.step_id,
                frames: rest,
            }
        };
        self.emit(EngineEventKind::FlowResumed, &flow.id, None, json!({}))
            .await;
        self.run_flow(flow, ctx, entry, depth, true).await
    }

    #[async_recursion]
    async fn run_flow(
        &self,
        flow: Arc<Flow>,
        ctx: ExecutionContext,
        entry: Entry,
        depth: usize,
        pause_allowed: bool,
    ) -> EngineResult<FlowOutcome> {
        for decl in &flow.inputs {
            if decl.required && !ctx.has_input(&decl.id).await {
                return Err(DispatchError::MissingInput {
                    flow_id: flow.id.clone(),
                    input_id: decl.id.clone(),
                }
                .into());
            }
        }

        let mut pending_child: Option<Vec<CheckpointFrame>> = None;
        let mut just_resumed = false;
        let mut index = match entry {
            Entry::Start => 0,
            Entry::At(step_id) => {
                just_resumed = true;
                flow.index_of(&step_id)
                    .ok_or(DispatchError::UnknownStep { step_id })?
            }
            Entry::ResumeChild { step_id, frames } => {
                just_resumed = true;
                pending_child = Some(frames);
                flow.index_of(&step_id)
                    .ok_or(DispatchError::UnknownStep { step_id })?
            }
        };

        loop {
            if self.host.cancel.is_raised() {
                return Err(GrimoireError::Cancelled);
            }
            let step = &flow.steps[index];

            if pause_allowed
                && !just_resumed
                && pending_child.is_none()
                && flow.is_resume_point(&step.id)
                && self.host.pause.is_raised()
            {
                let frame = CheckpointFrame {
                    flow_id: flow.id.clone(),
                    flow_version: flow.version,
                    step_id: step.id.clone(),
                    context: ctx.snapshot().await,
                };
                self.emit(
                    EngineEventKind::FlowPaused,
                    &flow.id,
                    Some(&step.id),
                    json!({}),
                )
                .await;
                return Ok(FlowOutcome::Paused(vec![frame]));
            }
            just_resumed = false;

            if pending_child.is_none() {
                if let Some(condition) = &step.condition {
                    let rendered = self
                        .render_in(&ctx, &Scope::default(), condition)
                        .await
                        .map_err(|e| e.at_step(&flow.id, &step.id))?;
                    if !template::truthy(&rendered) {
                        debug!(flow_id = %flow.id, step_id = %step.id, "condition false, skipping step");
                        self.emit(
                            EngineEventKind::StepSkipped,
                            &flow.id,
                            Some(&step.id),
                            json!({}),
                        )
                        .await;
                        match self
                            .advance(&flow, index, step.next_step.clone())
                            .map_err(|e| e.at_step(&flow.id, &step.id))?
                        {
                            Some(next) => {
                                index = next;
                                continue;
                            }
                            None => break,
                        }
                    }
                }
            }

            self.emit(
                EngineEventKind::StepStarted,
                &flow.id,
                Some(&step.id),
                json!({"kind": step.kind.name()}),
            )
            .await;

            let outcome = if let Some(frames) = pending_child.take() {
                match self.resume_frames(frames, depth + 1).await {
                    Ok(FlowOutcome::Completed(outputs)) => Ok(StepOutcome::Advanced {
                        result: Some(Value::Object(outputs)),
                        next_override: None,
                        terminal: false,
                    }),
                    Ok(FlowOutcome::Paused(frames)) => Ok(StepOutcome::Paused(frames)),
                    Err(e) => Err(e),
                }
            } else {
                match self
                    .run_actions(&flow, step, &step.pre_actions, &ctx, &Scope::default(), depth)
                    .await
                {
                    Ok(()) => {
                        self.dispatch_step(&flow, step, &ctx, depth, pause_allowed)
                            .await
                    }
                    Err(e) => Err(e),
                }
            };
            let outcome = outcome.map_err(|e| e.at_step(&flow.id, &step.id))?;

            match outcome {
                StepOutcome::Paused(child_frames) => {
                    let mut frames = vec![CheckpointFrame {
                        flow_id: flow.id.clone(),
                        flow_version: flow.version,
                        step_id: step.id.clone(),
                        context: ctx.snapshot().await,
                    }];
                    frames.extend(child_frames);
                    self.emit(
                        EngineEventKind::FlowPaused,
                        &flow.id,
                        Some(&step.id),
                        json!({}),
                    )
                    .await;
                    return Ok(FlowOutcome::Paused(frames));
                }
                StepOutcome::Advanced {
                    result,
                    next_override,
                    terminal,
                } => {
                    if let Some(result) = result {
                        ctx.bind_result(result).await;
                    }
                    self.run_actions(&flow, step, &step.actions, &ctx, &Scope::default(), depth)
                        .await
                        .map_err(|e| e.at_step(&flow.id, &step.id))?;
                    self.emit(
                        EngineEventKind::StepCompleted,
                        &flow.id,
                        Some(&step.id),
                        json!({}),
                    )
                    .await;
                    if terminal {
                        break;
                    }
                    let target = next_override.or_else(|| step.next_step.clone());
                    match self
                        .advance(&flow, index, target)
                        .map_err(|e| e.at_step(&flow.id, &step.id))?
                    {
                        Some(next) => index = next,
                        None => break,
                    }
                }
            }
        }

        let raw = ctx.outputs().await;
        let mut outputs = JsonMap::new();
        for decl in &flow.outputs {
            let value = raw.get(&decl.id).cloned().unwrap_or(Value::Null);
            if decl.validate {
                let report = self
                    .collab("validate", self.host.validator.validate(&decl.ty, &value))
                    .await?;
                if !report.is_ok() {
                    return Err(DispatchError::Validation {
                        path: format!("outputs.{}", decl.id),
                        message: report.errors.join("; "),
                    }
                    .into());
                }
            }
            outputs.insert(decl.id.clone(), value);
        }
        self.emit(EngineEventKind::FlowCompleted, &flow.id, None, json!({}))
            .await;
        Ok(FlowOutcome::Completed(outputs))
    }

    /// Explicit target, else the sequential successor, else DONE.
    fn advance(
        &self,
        flow: &Flow,
        current: usize,
        target: Option<String>,
    ) -> EngineResult<Option<usize>> {
        match target {
            Some(step_id) => flow
                .index_of(&step_id)
                .map(Some)
                .ok_or_else(|| DispatchError::UnknownStep { step_id }.into()),
            None => {
                let next = current + 1;
                Ok((next < flow.steps.len()).then_some(next))
            }
        }
    }

    /// Invoke a sub-flow with a fresh, isolated context. Inputs are
    /// resolved against the caller's scope; nothing else crosses.
    pub(crate) async fn run_subflow(
        &self,
        ctx: &ExecutionContext,
        scope: &Scope,
        flow_id: &str,
        inputs_spec: &JsonMap,
        depth: usize,
        pause_allowed: bool,
    ) -> EngineResult<FlowOutcome> {
        if depth + 1 > self.config.max_flow_depth {
            return Err(DispatchError::FlowDepthExceeded {
                flow_id: flow_id.to_string(),
                depth: depth + 1,
            }
            .into());
        }
        let flow = self.registry.get(flow_id)?;

        let mut child_inputs = JsonMap::new();
        for (key, value) in inputs_spec {
            let resolved = match value {
                Value::String(template) => self.resolve_in(ctx, scope, template).await?,
                other => other.clone(),
            };
            child_inputs.insert(key.clone(), resolved);
        }

        let child_ctx = ExecutionContext::new(child_inputs);
        self.emit(EngineEventKind::FlowStarted, &flow.id, None, json!({}))
            .await;
        self.run_flow(flow, child_ctx, Entry::Start, depth + 1, pause_allowed)
            .await
    }

    /// Await a collaborator call, racing cancellation and the configured
    /// timeout.
    pub(crate) async fn collab<T, F>(&self, operation: &str, fut: F) -> EngineResult<T>
    where
        F: Future<Output = CollaboratorResult<T>>,
    {
        if self.host.cancel.is_raised() {
            return Err(GrimoireError::Cancelled);
        }
        let cancel = self.host.cancel.clone();
        tokio::select! {
            _ = cancel.raised() => Err(GrimoireError::Cancelled),
            result = tokio::time::timeout(self.config.collaborator_timeout, fut) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(CollaboratorError::Cancelled { .. })) => Err(GrimoireError::Cancelled),
                Ok(Err(error)) => Err(error.into()),
                Err(_) => Err(CollaboratorError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: self.config.collaborator_timeout.as_millis() as u64,
                }
                .into()),
            },
        }
    }

    pub(crate) async fn render_in(
        &self,
        ctx: &ExecutionContext,
        scope: &Scope,
        template: &str,
    ) -> EngineResult<String> {
        let globals = ctx.globals(scope).await;
        Ok(self.templates.render(template, &globals)?)
    }

    pub(crate) async fn resolve_in(
        &self,
        ctx: &ExecutionContext,
        scope: &Scope,
        input: &str,
    ) -> EngineResult<Value> {
        let globals = ctx.globals(scope).await;
        Ok(self.templates.resolve(input, &globals)?)
    }

    pub(crate) async fn emit(
        &self,
        kind: EngineEventKind,
        flow_id: &str,
        step_id: Option<&str>,
        data: Value,
    ) {
        let _ = self
            .bus
            .publish(EngineEvent::new(
                kind,
                flow_id,
                step_id.map(String::from),
                data,
            ))
            .await;
    }
}
