use std::fmt;

use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, GrimoireError>;

/// Errors raised while loading and validating flow documents.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("SchemaError: {message}")]
    Schema { message: String },

    #[error("DuplicateStepId: step '{step_id}' appears more than once in flow '{flow_id}'")]
    DuplicateStepId { flow_id: String, step_id: String },

    #[error("UnknownStepReference: '{target}' referenced from step '{step_id}' in flow '{flow_id}'")]
    UnknownStepReference {
        flow_id: String,
        step_id: String,
        target: String,
    },

    #[error("UnknownField: field '{field}' is not valid for a {kind} step (step '{step_id}')")]
    UnknownField {
        step_id: String,
        kind: String,
        field: String,
    },
}

/// Errors raised by the reference-path resolver and the execution context.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("PathNotFound: {path}")]
    NotFound { path: String },

    #[error("TypeConflict: segment '{segment}' of '{path}' is blocked by a non-container value")]
    TypeConflict { path: String, segment: String },

    #[error("ReadOnlyRoot: cannot write to '{path}'")]
    ReadOnlyRoot { path: String },

    #[error("ConcurrentWriteConflict: '{path}' was written by more than one parallel unit")]
    ConcurrentWriteConflict { path: String },

    #[error("malformed reference path '{path}'")]
    Malformed { path: String },
}

/// Errors raised by the template adapter.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("TemplateError: {message}")]
    Syntax { message: String },

    #[error("UnresolvedReference: {reference}")]
    Unresolved { reference: String },
}

/// Errors raised while dispatching steps.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("UnknownStepKind: '{kind}' (step '{step_id}')")]
    UnknownStepKind { step_id: String, kind: String },

    #[error("UnknownFlow: {flow_id}")]
    UnknownFlow { flow_id: String },

    #[error("UnknownStep: {step_id}")]
    UnknownStep { step_id: String },

    #[error("MissingInput: required input '{input_id}' for flow '{flow_id}'")]
    MissingInput { flow_id: String, input_id: String },

    #[error("ValidationError: {path}: {message}")]
    Validation { path: String, message: String },

    #[error("flow call depth exceeded {depth} (flow '{flow_id}')")]
    FlowDepthExceeded { flow_id: String, depth: usize },
}

/// Errors surfaced by host-supplied collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("DiceError: {0}")]
    Dice(String),

    #[error("TableError: {0}")]
    Table(String),

    #[error("GeneratorError: {0}")]
    Generator(String),

    #[error("LLMError: {0}")]
    Llm(String),

    #[error("CollaboratorTimeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },
}

/// Errors of the engine event channel.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("event send failed: {message}")]
    SendFailed { message: String },

    #[error("event receiver lagged by {count} events")]
    Lagged { count: u64 },

    #[error("event receive failed: {message}")]
    ReceiveFailed { message: String },
}

/// Top-level error type of the engine.
///
/// Runtime failures are wrapped into [`StepFault`] before they cross the
/// engine boundary so the caller always sees the flow id, the step id and,
/// for action failures, the action index and kind.
#[derive(Debug, Error)]
pub enum GrimoireError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Step(Box<StepFault>),

    #[error("Cancelled")]
    Cancelled,

    #[error("VersionMismatch: flow '{flow_id}' ticket has v{ticket_version}, registry has v{registry_version}")]
    VersionMismatch {
        flow_id: String,
        ticket_version: u32,
        registry_version: u32,
    },
}

/// A runtime error located at a specific step (and optionally action).
#[derive(Debug)]
pub struct StepFault {
    pub flow_id: String,
    pub step_id: String,
    pub action: Option<ActionRef>,
    pub source: GrimoireError,
}

#[derive(Debug, Clone)]
pub struct ActionRef {
    pub index: usize,
    pub kind: String,
}

impl fmt::Display for StepFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Some(a) => write!(
                f,
                "flow '{}' step '{}' action {} ({}): {}",
                self.flow_id, self.step_id, a.index, a.kind, self.source
            ),
            None => write!(
                f,
                "flow '{}' step '{}': {}",
                self.flow_id, self.step_id, self.source
            ),
        }
    }
}

impl std::error::Error for StepFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl GrimoireError {
    /// Attach flow/step location to an error that does not carry one yet.
    /// Already-located faults and cancellation keep their original shape.
    pub fn at_step(self, flow_id: &str, step_id: &str) -> Self {
        match self {
            GrimoireError::Step(_) | GrimoireError::Cancelled => self,
            source => GrimoireError::Step(Box::new(StepFault {
                flow_id: flow_id.to_string(),
                step_id: step_id.to_string(),
                action: None,
                source,
            })),
        }
    }

    /// Attach flow/step/action location to an error.
    pub fn at_action(self, flow_id: &str, step_id: &str, index: usize, kind: &str) -> Self {
        match self {
            GrimoireError::Step(_) | GrimoireError::Cancelled => self,
            source => GrimoireError::Step(Box::new(StepFault {
                flow_id: flow_id.to_string(),
                step_id: step_id.to_string(),
                action: Some(ActionRef {
                    index,
                    kind: kind.to_string(),
                }),
                source,
            })),
        }
    }

    /// The innermost error, unwrapping step faults.
    pub fn root(&self) -> &GrimoireError {
        match self {
            GrimoireError::Step(fault) => fault.source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_identifiers_in_display() {
        let err = GrimoireError::from(PathError::NotFound {
            path: "outputs.x".to_string(),
        });
        assert!(err.to_string().contains("PathNotFound"));

        let err = GrimoireError::from(TemplateError::Unresolved {
            reference: "outputs.name".to_string(),
        });
        assert!(err.to_string().contains("UnresolvedReference"));

        let err = GrimoireError::from(CollaboratorError::Timeout {
            operation: "roll".to_string(),
            timeout_ms: 500,
        });
        assert!(err.to_string().contains("CollaboratorTimeout"));
    }

    #[test]
    fn test_at_action_wraps_once() {
        let err = GrimoireError::from(PathError::NotFound {
            path: "outputs.x".to_string(),
        })
        .at_action("f", "s", 2, "set_value")
        .at_step("parent", "call");

        match &err {
            GrimoireError::Step(fault) => {
                assert_eq!(fault.flow_id, "f");
                assert_eq!(fault.step_id, "s");
                let action = fault.action.as_ref().unwrap();
                assert_eq!(action.index, 2);
                assert_eq!(action.kind, "set_value");
            }
            other => panic!("unexpected error shape: {other:?}"),
        }
        assert!(matches!(err.root(), GrimoireError::Path(_)));
    }

    #[test]
    fn test_cancelled_is_not_wrapped() {
        let err = GrimoireError::Cancelled.at_step("f", "s");
        assert!(matches!(err, GrimoireError::Cancelled));
    }
}
