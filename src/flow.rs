//! Flow documents: the immutable data model, YAML loading, and load-time
//! validation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{DispatchError, EngineResult, GrimoireError, LoadError};

pub type JsonMap = Map<String, Value>;

/// A loadable procedure: a directed graph of typed steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub resume_points: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDecl {
    #[serde(rename = "type")]
    pub ty: String,
    pub id: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDecl {
    #[serde(rename = "type")]
    pub ty: String,
    pub id: String,
    #[serde(default)]
    pub validate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    #[serde(rename = "type")]
    pub ty: String,
    pub id: String,
    #[serde(default)]
    pub validate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub pre_actions: Vec<Action>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub next_step: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    DiceRoll {
        roll: String,
    },
    DiceSequence {
        sequence: DiceSequenceSpec,
    },
    PlayerChoice {
        #[serde(default)]
        choices: Vec<Choice>,
        #[serde(default)]
        choice_source: Option<ChoiceSource>,
    },
    TableRoll {
        tables: Vec<TableRef>,
    },
    PlayerInput,
    LlmGeneration {
        prompt_id: String,
        #[serde(default)]
        prompt_data: JsonMap,
        #[serde(default)]
        llm_settings: JsonMap,
    },
    NameGeneration {
        #[serde(default)]
        generator: Option<String>,
        #[serde(default)]
        settings: NameSettings,
    },
    Completion,
    FlowCall {
        flow: String,
        #[serde(default)]
        inputs: JsonMap,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::DiceRoll { .. } => "dice_roll",
            StepKind::DiceSequence { .. } => "dice_sequence",
            StepKind::PlayerChoice { .. } => "player_choice",
            StepKind::TableRoll { .. } => "table_roll",
            StepKind::PlayerInput => "player_input",
            StepKind::LlmGeneration { .. } => "llm_generation",
            StepKind::NameGeneration { .. } => "name_generation",
            StepKind::Completion => "completion",
            StepKind::FlowCall { .. } => "flow_call",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiceSequenceSpec {
    /// Either a literal list or a reference/template string resolving to one.
    pub items: Value,
    pub roll: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub next_step: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceSource {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub table_from_values: Option<String>,
    pub display_format: String,
    #[serde(default)]
    pub selection_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRef {
    pub table: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameSettings {
    #[serde(default = "default_name_max_length")]
    pub max_length: usize,
    #[serde(default = "default_name_corpus")]
    pub corpus: String,
    #[serde(default = "default_name_segmenter")]
    pub segmenter: String,
    #[serde(default = "default_name_algorithm")]
    pub algorithm: String,
}

impl Default for NameSettings {
    fn default() -> Self {
        Self {
            max_length: default_name_max_length(),
            corpus: default_name_corpus(),
            segmenter: default_name_segmenter(),
            algorithm: default_name_algorithm(),
        }
    }
}

pub const DEFAULT_NAME_GENERATOR: &str = "wyrdbound-rng";

/// Actions are the only author-visible context mutators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SetValue {
        path: String,
        value: Value,
    },
    SwapValues {
        path1: String,
        path2: String,
    },
    DisplayValue(String),
    ValidateValue(String),
    LogEvent {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        data: JsonMap,
    },
    LogMessage(MessageSpec),
    FlowCall {
        flow: String,
        #[serde(default)]
        inputs: JsonMap,
        #[serde(default)]
        actions: Vec<Action>,
    },
}

impl Action {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Action::SetValue { .. } => "set_value",
            Action::SwapValues { .. } => "swap_values",
            Action::DisplayValue(_) => "display_value",
            Action::ValidateValue(_) => "validate_value",
            Action::LogEvent { .. } => "log_event",
            Action::LogMessage(_) => "log_message",
            Action::FlowCall { .. } => "flow_call",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageSpec {
    Text(String),
    Detailed { message: String },
}

impl MessageSpec {
    pub fn message(&self) -> &str {
        match self {
            MessageSpec::Text(text) => text,
            MessageSpec::Detailed { message } => message,
        }
    }
}

fn default_kind() -> String {
    "flow".to_string()
}

fn default_version() -> u32 {
    1
}

fn default_name_max_length() -> usize {
    15
}

fn default_name_corpus() -> String {
    "generic-fantasy".to_string()
}

fn default_name_segmenter() -> String {
    "fantasy".to_string()
}

fn default_name_algorithm() -> String {
    "bayesian".to_string()
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "id",
    "kind",
    "name",
    "description",
    "version",
    "inputs",
    "outputs",
    "variables",
    "steps",
    "resume_points",
];

const COMMON_STEP_KEYS: &[&str] = &[
    "id",
    "name",
    "type",
    "prompt",
    "condition",
    "parallel",
    "pre_actions",
    "actions",
    "next_step",
];

fn kind_specific_keys(kind: &str) -> Option<&'static [&'static str]> {
    match kind {
        "dice_roll" => Some(&["roll"]),
        "dice_sequence" => Some(&["sequence"]),
        "player_choice" => Some(&["choices", "choice_source"]),
        "table_roll" => Some(&["tables"]),
        "player_input" => Some(&[]),
        "llm_generation" => Some(&["prompt_id", "prompt_data", "llm_settings"]),
        "name_generation" => Some(&["generator", "settings"]),
        "completion" => Some(&[]),
        "flow_call" => Some(&["flow", "inputs"]),
        _ => None,
    }
}

impl Flow {
    /// Parse and validate a single YAML flow document.
    pub fn load(source: &str) -> EngineResult<Flow> {
        let yaml: serde_yaml::Value = serde_yaml::from_str(source).map_err(|e| LoadError::Schema {
            message: e.to_string(),
        })?;
        Self::from_yaml(yaml)
    }

    /// Parse every document of a multi-document YAML source.
    pub fn load_documents(source: &str) -> EngineResult<Vec<Flow>> {
        use serde::Deserialize as _;
        let mut flows = Vec::new();
        for document in serde_yaml::Deserializer::from_str(source) {
            let yaml = serde_yaml::Value::deserialize(document).map_err(|e| LoadError::Schema {
                message: e.to_string(),
            })?;
            if yaml.is_null() {
                continue;
            }
            flows.push(Self::from_yaml(yaml)?);
        }
        Ok(flows)
    }

    fn from_yaml(yaml: serde_yaml::Value) -> EngineResult<Flow> {
        let document: Value = serde_json::to_value(&yaml).map_err(|e| LoadError::Schema {
            message: e.to_string(),
        })?;
        validate_document(&document)?;
        let flow: Flow = serde_json::from_value(document).map_err(|e| LoadError::Schema {
            message: e.to_string(),
        })?;
        flow.validate()?;
        Ok(flow)
    }

    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn is_resume_point(&self, step_id: &str) -> bool {
        self.resume_points.iter().any(|id| id == step_id)
    }

    pub fn output_decl(&self, id: &str) -> Option<&OutputDecl> {
        self.outputs.iter().find(|d| d.id == id)
    }

    pub fn variable_decl(&self, id: &str) -> Option<&VariableDecl> {
        self.variables.iter().find(|d| d.id == id)
    }

    /// Structural validation beyond what serde can express.
    fn validate(&self) -> EngineResult<()> {
        if self.steps.is_empty() {
            return Err(LoadError::Schema {
                message: format!("flow '{}' has no steps", self.id),
            }
            .into());
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(LoadError::DuplicateStepId {
                    flow_id: self.id.clone(),
                    step_id: step.id.clone(),
                }
                .into());
            }
        }

        for step in &self.steps {
            if let Some(target) = &step.next_step {
                self.check_reference(&step.id, target)?;
            }
            match &step.kind {
                StepKind::PlayerChoice {
                    choices,
                    choice_source,
                } => {
                    for choice in choices {
                        if let Some(target) = &choice.next_step {
                            self.check_reference(&step.id, target)?;
                        }
                    }
                    match choice_source {
                        Some(source) => {
                            if !choices.is_empty() {
                                return Err(LoadError::Schema {
                                    message: format!(
                                        "step '{}' mixes static choices with a choice_source",
                                        step.id
                                    ),
                                }
                                .into());
                            }
                            if source.table.is_some() == source.table_from_values.is_some() {
                                return Err(LoadError::Schema {
                                    message: format!(
                                        "choice_source of step '{}' must name exactly one of \
                                         'table' or 'table_from_values'",
                                        step.id
                                    ),
                                }
                                .into());
                            }
                        }
                        None if choices.is_empty() => {
                            return Err(LoadError::Schema {
                                message: format!(
                                    "player_choice step '{}' has neither choices nor a \
                                     choice_source",
                                    step.id
                                ),
                            }
                            .into());
                        }
                        None => {}
                    }
                }
                StepKind::TableRoll { tables } if tables.is_empty() => {
                    return Err(LoadError::Schema {
                        message: format!("table_roll step '{}' lists no tables", step.id),
                    }
                    .into());
                }
                _ => {}
            }
            if step.parallel
                && matches!(
                    step.kind,
                    StepKind::PlayerChoice { .. } | StepKind::PlayerInput
                )
            {
                return Err(LoadError::Schema {
                    message: format!(
                        "step '{}' cannot combine parallel with {}",
                        step.id,
                        step.kind.name()
                    ),
                }
                .into());
            }
        }

        for point in &self.resume_points {
            if self.index_of(point).is_none() {
                return Err(LoadError::UnknownStepReference {
                    flow_id: self.id.clone(),
                    step_id: "resume_points".to_string(),
                    target: point.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    fn check_reference(&self, step_id: &str, target: &str) -> EngineResult<()> {
        if self.index_of(target).is_none() {
            return Err(LoadError::UnknownStepReference {
                flow_id: self.id.clone(),
                step_id: step_id.to_string(),
                target: target.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Key-level checks that have to happen before typed deserialization:
/// unknown top-level keys warn, unknown step kinds and unknown step fields
/// are rejected.
fn validate_document(document: &Value) -> EngineResult<()> {
    let top = document.as_object().ok_or_else(|| LoadError::Schema {
        message: "flow document must be a mapping".to_string(),
    })?;

    for key in top.keys() {
        if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
            warn!(key = %key, "ignoring unknown top-level key in flow document");
        }
    }

    let steps = match top.get("steps").and_then(Value::as_array) {
        Some(steps) => steps,
        None => return Ok(()),
    };

    for step in steps {
        let map = step.as_object().ok_or_else(|| LoadError::Schema {
            message: "each step must be a mapping".to_string(),
        })?;
        let step_id = map
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<missing id>")
            .to_string();
        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| LoadError::Schema {
                message: format!("step '{}' has no type", step_id),
            })?;
        let specific = kind_specific_keys(kind).ok_or_else(|| {
            GrimoireError::from(DispatchError::UnknownStepKind {
                step_id: step_id.clone(),
                kind: kind.to_string(),
            })
        })?;
        for key in map.keys() {
            if !COMMON_STEP_KEYS.contains(&key.as_str()) && !specific.contains(&key.as_str()) {
                return Err(LoadError::UnknownField {
                    step_id,
                    kind: kind.to_string(),
                    field: key.clone(),
                }
                .into());
            }
        }
    }

    Ok(())
}
