//! Host-supplied collaborators.
//!
//! The engine never implements dice parsing, table storage, name
//! generation, language models, or data validation itself; it consumes them
//! through the narrow interfaces below. [`builtin`] carries deterministic
//! reference implementations used by the CLI and the test suites.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::CollaboratorError;
use crate::flow::{JsonMap, NameSettings};

pub mod builtin;

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Result of one dice expression evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiceRoll {
    pub total: i64,
    pub detail: String,
}

/// Result of one random-table draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDraw {
    pub entry: Value,
    pub roll_result: DiceRoll,
}

/// A validator verdict; empty `errors` means the value passed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One selectable option presented to the player.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceOption {
    pub id: String,
    pub label: String,
}

#[mockall::automock]
#[async_trait]
pub trait DiceRoller: Send + Sync {
    async fn roll(&self, expr: &str) -> CollaboratorResult<DiceRoll>;
}

#[mockall::automock]
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn roll_table(&self, name: &str) -> CollaboratorResult<TableDraw>;
}

#[mockall::automock]
#[async_trait]
pub trait NameGenerator: Send + Sync {
    async fn generate(
        &self,
        generator: &str,
        settings: &NameSettings,
    ) -> CollaboratorResult<Value>;
}

#[mockall::automock]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        prompt_id: &str,
        data: &JsonMap,
        settings: &JsonMap,
    ) -> CollaboratorResult<String>;
}

#[mockall::automock]
#[async_trait]
pub trait DataValidator: Send + Sync {
    async fn validate(
        &self,
        type_name: &str,
        value: &Value,
    ) -> CollaboratorResult<ValidationReport>;
}

/// The user-interaction sink: choice presenter, text prompt, display sink.
#[mockall::automock]
#[async_trait]
pub trait PlayerInteraction: Send + Sync {
    async fn choose(
        &self,
        prompt: &str,
        options: &[ChoiceOption],
        count: usize,
    ) -> CollaboratorResult<Vec<String>>;

    async fn input(&self, prompt: &str) -> CollaboratorResult<String>;

    async fn display(&self, text: &str) -> CollaboratorResult<()>;
}

/// A cooperative, level-triggered flag delivered by the host (pause and
/// cancellation). Cheap to clone; raising is observed by all clones.
#[derive(Debug, Clone)]
pub struct Signal {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct SignalHandle {
    tx: watch::Sender<bool>,
}

pub fn signal() -> (SignalHandle, Signal) {
    let (tx, rx) = watch::channel(false);
    (SignalHandle { tx }, Signal { rx })
}

impl Signal {
    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal is raised. Never resolves if the handle is
    /// dropped without raising.
    pub async fn raised(mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl SignalHandle {
    pub fn raise(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }
}

/// Bundle of every collaborator plus the host's cooperative signals.
#[derive(Clone)]
pub struct Host {
    pub dice: Arc<dyn DiceRoller>,
    pub tables: Arc<dyn TableStore>,
    pub names: Arc<dyn NameGenerator>,
    pub llm: Arc<dyn LlmProvider>,
    pub validator: Arc<dyn DataValidator>,
    pub player: Arc<dyn PlayerInteraction>,
    pub pause: Signal,
    pub cancel: Signal,
}

impl Host {
    /// A host backed entirely by the deterministic built-ins; every
    /// collaborator can be replaced through the builder methods.
    pub fn builder(seed: u64) -> HostBuilder {
        HostBuilder::new(seed)
    }
}

pub struct HostBuilder {
    dice: Arc<dyn DiceRoller>,
    tables: Arc<dyn TableStore>,
    names: Arc<dyn NameGenerator>,
    llm: Arc<dyn LlmProvider>,
    validator: Arc<dyn DataValidator>,
    player: Arc<dyn PlayerInteraction>,
    pause: Option<Signal>,
    cancel: Option<Signal>,
}

impl HostBuilder {
    fn new(seed: u64) -> Self {
        Self {
            dice: Arc::new(builtin::SeededDice::new(seed)),
            tables: Arc::new(builtin::StaticTableStore::new(seed)),
            names: Arc::new(builtin::ListNameGenerator::default()),
            llm: Arc::new(builtin::EchoLlm),
            validator: Arc::new(builtin::BasicValidator::default()),
            player: Arc::new(builtin::ScriptedPlayer::default()),
            pause: None,
            cancel: None,
        }
    }

    pub fn dice(mut self, dice: Arc<dyn DiceRoller>) -> Self {
        self.dice = dice;
        self
    }

    pub fn tables(mut self, tables: Arc<dyn TableStore>) -> Self {
        self.tables = tables;
        self
    }

    pub fn names(mut self, names: Arc<dyn NameGenerator>) -> Self {
        self.names = names;
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = llm;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn DataValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn player(mut self, player: Arc<dyn PlayerInteraction>) -> Self {
        self.player = player;
        self
    }

    pub fn pause(mut self, pause: Signal) -> Self {
        self.pause = Some(pause);
        self
    }

    pub fn cancel(mut self, cancel: Signal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> Host {
        let pause = self.pause.unwrap_or_else(|| signal().1);
        let cancel = self.cancel.unwrap_or_else(|| signal().1);
        Host {
            dice: self.dice,
            tables: self.tables,
            names: self.names,
            llm: self.llm,
            validator: self.validator,
            player: self.player,
            pause,
            cancel,
        }
    }
}
