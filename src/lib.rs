//! # GRIMOIRE: Declarative Flow Engine for Tabletop Procedures
//!
//! GRIMOIRE executes "flow" documents: directed graphs of typed steps
//! describing interactive tabletop-RPG procedures such as character
//! creation, ability checks and encounter generation. Steps roll dice,
//! consult random tables, solicit player input, invoke language models,
//! generate names and call other flows; between steps, a small action
//! language mutates a structured execution context through dotted
//! reference paths, with every textual field resolved by a templating
//! layer.
//!
//! ## Processing Pipeline
//!
//! ```text
//! YAML Source → Loader/Validator → Flow → Interpreter → Outputs | Ticket
//! ```
//!
//! ### Loading
//!
//! The [`flow`] module parses YAML documents and validates them: unique
//! step ids, resolvable transitions, known step kinds, per-kind field
//! whitelists. Loaded flows are immutable and shared through the
//! [`registry`].
//!
//! ### State
//!
//! The [`context`] module owns the mutable state of one invocation
//! (inputs, outputs, variables plus the transient `result` and `item`
//! bindings); the [`path`] module addresses locations inside it, and the
//! [`template`] module renders double-brace expressions against it.
//!
//! ### Execution
//!
//! The [`interpreter`] module drives the step loop; the [`dispatch`]
//! module executes each step kind against the host's collaborators
//! ([`host`]), and the [`action`] module applies the per-step action
//! lists. Lifecycle and log events go out on the [`event_bus`].
//!
//! ### Suspension
//!
//! Flows pause cooperatively at declared resume points; the [`ticket`]
//! module serializes the interpreter state so a later process can resume
//! it against the same registry.
//!
//! ## Collaborators
//!
//! Dice parsing, table storage, name generation, language models, data
//! validation and the player-facing UI are host concerns, consumed behind
//! the narrow traits in [`host`]. Deterministic built-ins back the CLI and
//! the test suites.

pub mod action;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event_bus;
pub mod flow;
pub mod host;
pub mod interpreter;
pub mod path;
pub mod registry;
pub mod template;
pub mod ticket;

// Re-exports
pub use config::EngineConfig;
pub use context::{ContextSnapshot, ExecutionContext, JsonMap, Scope};
pub use error::{
    CollaboratorError, DispatchError, EngineResult, EventError, GrimoireError, LoadError,
    PathError, StepFault, TemplateError,
};
pub use event_bus::{EngineEvent, EngineEventKind, EventBus, EventReceiver};
pub use flow::{Action, Flow, Step, StepKind};
pub use host::{Host, Signal, SignalHandle};
pub use interpreter::{Engine, RunOutcome};
pub use registry::FlowRegistry;
pub use ticket::{CheckpointFrame, ResumeTicket};
