//! The step dispatcher: one handler per step kind, each producing the
//! step's `result` binding and an optional transition override.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::instrument;

use crate::context::{ExecutionContext, Scope};
use crate::error::{DispatchError, EngineResult, GrimoireError};
use crate::flow::{
    Choice, ChoiceSource, Flow, Step, StepKind, DEFAULT_NAME_GENERATOR,
};
use crate::host::{ChoiceOption, DiceRoll, TableDraw};
use crate::interpreter::{Engine, FlowOutcome, StepOutcome};

fn dice_value(roll: &DiceRoll) -> Value {
    json!({ "total": roll.total, "detail": roll.detail })
}

fn draw_value(draw: &TableDraw) -> Value {
    json!({
        "entry": draw.entry,
        "roll_result": { "total": draw.roll_result.total, "detail": draw.roll_result.detail },
    })
}

impl Engine {
    #[instrument(skip(self, flow, step, ctx), fields(flow_id = %flow.id, step_id = %step.id, kind = step.kind.name()))]
    pub(crate) async fn dispatch_step(
        &self,
        flow: &Arc<Flow>,
        step: &Step,
        ctx: &ExecutionContext,
        depth: usize,
        pause_allowed: bool,
    ) -> EngineResult<StepOutcome> {
        match &step.kind {
            StepKind::DiceRoll { roll } => {
                let expr = self.render_in(ctx, &Scope::default(), roll).await?;
                let roll = self.collab("roll", self.host.dice.roll(&expr)).await?;
                Ok(StepOutcome::advanced(Some(dice_value(&roll))))
            }

            StepKind::DiceSequence { sequence } => {
                let items = match &sequence.items {
                    Value::Array(items) => items.clone(),
                    Value::String(reference) => {
                        match self.resolve_in(ctx, &Scope::default(), reference).await? {
                            Value::Array(items) => items,
                            other => {
                                return Err(sequence_items_error(reference, &other));
                            }
                        }
                    }
                    other => return Err(sequence_items_error("items", other)),
                };

                let run_unit = |unit: Option<usize>, item: Value| async move {
                    let scope = Scope {
                        item: Some(item),
                        unit,
                        ..Scope::default()
                    };
                    let expr = self.render_in(ctx, &scope, &sequence.roll).await?;
                    let roll = self.collab("roll", self.host.dice.roll(&expr)).await?;
                    let result = dice_value(&roll);
                    let scope = Scope {
                        result: Some(result.clone()),
                        ..scope
                    };
                    self.run_actions(flow, step, &sequence.actions, ctx, &scope, depth)
                        .await?;
                    Ok::<Value, GrimoireError>(result)
                };

                let results = if step.parallel {
                    ctx.begin_parallel();
                    let unit_futures = items
                        .into_iter()
                        .enumerate()
                        .map(|(unit, item)| run_unit(Some(unit), item));
                    let joined = futures::future::try_join_all(unit_futures).await;
                    ctx.end_parallel();
                    joined?
                } else {
                    let mut results = Vec::new();
                    for item in items {
                        results.push(run_unit(None, item).await?);
                    }
                    results
                };
                Ok(StepOutcome::advanced(results.into_iter().last()))
            }

            StepKind::TableRoll { tables } => {
                let run_unit = |unit: Option<usize>, table: crate::flow::TableRef| async move {
                    let draw = self
                        .collab("roll_table", self.host.tables.roll_table(&table.table))
                        .await?;
                    let result = draw_value(&draw);
                    let scope = Scope {
                        result: Some(result.clone()),
                        unit,
                        ..Scope::default()
                    };
                    self.run_actions(flow, step, &table.actions, ctx, &scope, depth)
                        .await?;
                    Ok::<Value, GrimoireError>(result)
                };

                let results = if step.parallel {
                    ctx.begin_parallel();
                    let unit_futures = tables
                        .iter()
                        .enumerate()
                        .map(|(unit, table)| run_unit(Some(unit), table.clone()));
                    let joined = futures::future::try_join_all(unit_futures).await;
                    ctx.end_parallel();
                    joined?
                } else {
                    let mut results = Vec::new();
                    for table in tables {
                        results.push(run_unit(None, table.clone()).await?);
                    }
                    results
                };
                Ok(StepOutcome::advanced(results.into_iter().last()))
            }

            StepKind::PlayerChoice {
                choices,
                choice_source,
            } => {
                let prompt = self.step_prompt(step, ctx).await?;
                match choice_source {
                    Some(source) => {
                        self.dispatch_dynamic_choice(step, ctx, source, &prompt)
                            .await
                    }
                    None => {
                        self.dispatch_static_choice(flow, step, ctx, choices, &prompt, depth)
                            .await
                    }
                }
            }

            StepKind::PlayerInput => {
                let prompt = self.step_prompt(step, ctx).await?;
                let text = self.collab("input", self.host.player.input(&prompt)).await?;
                Ok(StepOutcome::advanced(Some(Value::String(text))))
            }

            StepKind::LlmGeneration {
                prompt_id,
                prompt_data,
                llm_settings,
            } => {
                let mut data = crate::flow::JsonMap::new();
                for (key, value) in prompt_data {
                    let value = match value {
                        Value::String(template) => Value::String(
                            self.render_in(ctx, &Scope::default(), template).await?,
                        ),
                        other => other.clone(),
                    };
                    data.insert(key.clone(), value);
                }
                let completion = self
                    .collab("complete", self.host.llm.complete(prompt_id, &data, llm_settings))
                    .await?;
                Ok(StepOutcome::advanced(Some(Value::String(completion))))
            }

            StepKind::NameGeneration {
                generator,
                settings,
            } => {
                let generator = generator.as_deref().unwrap_or(DEFAULT_NAME_GENERATOR);
                let value = self
                    .collab("generate_name", self.host.names.generate(generator, settings))
                    .await?;
                Ok(StepOutcome::advanced(Some(value)))
            }

            StepKind::Completion => Ok(StepOutcome::Advanced {
                result: None,
                next_override: None,
                terminal: true,
            }),

            StepKind::FlowCall {
                flow: target,
                inputs,
            } => {
                match self
                    .run_subflow(ctx, &Scope::default(), target, inputs, depth, pause_allowed)
                    .await?
                {
                    FlowOutcome::Completed(outputs) => {
                        Ok(StepOutcome::advanced(Some(Value::Object(outputs))))
                    }
                    FlowOutcome::Paused(frames) => Ok(StepOutcome::Paused(frames)),
                }
            }
        }
    }

    async fn step_prompt(&self, step: &Step, ctx: &ExecutionContext) -> EngineResult<String> {
        match &step.prompt {
            Some(prompt) => self.render_in(ctx, &Scope::default(), prompt).await,
            None => Ok(step.name.clone().unwrap_or_else(|| step.id.clone())),
        }
    }

    async fn dispatch_static_choice(
        &self,
        flow: &Arc<Flow>,
        step: &Step,
        ctx: &ExecutionContext,
        choices: &[Choice],
        prompt: &str,
        depth: usize,
    ) -> EngineResult<StepOutcome> {
        let mut options = Vec::with_capacity(choices.len());
        for choice in choices {
            options.push(ChoiceOption {
                id: choice.id.clone(),
                label: self.render_in(ctx, &Scope::default(), &choice.label).await?,
            });
        }
        let selected = self
            .collab("choose", self.host.player.choose(prompt, &options, 1))
            .await?;
        let selected = validate_selection(selected, &options)?;
        let chosen_id = selected.first().cloned().ok_or(GrimoireError::Cancelled)?;
        let chosen = choices
            .iter()
            .find(|choice| choice.id == chosen_id)
            .ok_or_else(|| DispatchError::Validation {
                path: step.id.clone(),
                message: format!("selected choice '{}' is not offered", chosen_id),
            })?;

        let result = Value::String(chosen_id);
        let scope = Scope::with_result(result.clone());
        self.run_actions(flow, step, &chosen.actions, ctx, &scope, depth)
            .await?;
        Ok(StepOutcome::Advanced {
            result: Some(result),
            next_override: chosen.next_step.clone(),
            terminal: false,
        })
    }

    /// Dynamic choice sources: a `table` source draws `selection_count`
    /// rows and the player picks one; a `table_from_values` source presents
    /// every element of the referenced mapping or list and the player picks
    /// `selection_count`. Neither carries an implicit `next_step`.
    async fn dispatch_dynamic_choice(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        source: &ChoiceSource,
        prompt: &str,
    ) -> EngineResult<StepOutcome> {
        let count = source.selection_count.unwrap_or(1).max(1);

        let (options, pick) = if let Some(table) = &source.table {
            let mut options = Vec::with_capacity(count);
            for index in 0..count {
                let draw = self
                    .collab("roll_table", self.host.tables.roll_table(table))
                    .await?;
                let id = draw
                    .entry
                    .get("id")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| index.to_string());
                let scope = Scope {
                    entry: Some(draw.entry.clone()),
                    ..Scope::default()
                };
                let label = self.render_in(ctx, &scope, &source.display_format).await?;
                options.push(ChoiceOption { id, label });
            }
            (options, 1)
        } else if let Some(reference) = &source.table_from_values {
            let resolved = self.resolve_in(ctx, &Scope::default(), reference).await?;
            let pairs: Vec<(Value, Value)> = match resolved {
                Value::Object(map) => map
                    .into_iter()
                    .map(|(key, value)| (Value::String(key), value))
                    .collect(),
                Value::Array(items) => items
                    .into_iter()
                    .enumerate()
                    .map(|(index, value)| (Value::from(index), value))
                    .collect(),
                other => {
                    return Err(DispatchError::Validation {
                        path: reference.clone(),
                        message: format!(
                            "table_from_values must reference a mapping or list, got {}",
                            value_kind(&other)
                        ),
                    }
                    .into())
                }
            };
            let mut options = Vec::with_capacity(pairs.len());
            for (key, value) in &pairs {
                let scope = Scope {
                    key: Some(key.clone()),
                    value: Some(value.clone()),
                    ..Scope::default()
                };
                let label = self.render_in(ctx, &scope, &source.display_format).await?;
                options.push(ChoiceOption {
                    id: crate::template::value_to_string(key),
                    label,
                });
            }
            (options, count)
        } else {
            return Err(DispatchError::Validation {
                path: step.id.clone(),
                message: "choice_source names no table".to_string(),
            }
            .into());
        };

        let selected = self
            .collab("choose", self.host.player.choose(prompt, &options, pick))
            .await?;
        let mut selected = validate_selection(selected, &options)?;
        if selected.is_empty() {
            return Err(GrimoireError::Cancelled);
        }
        let result = if selected.len() == 1 {
            Value::String(selected.remove(0))
        } else {
            Value::Array(selected.into_iter().map(Value::String).collect())
        };
        Ok(StepOutcome::advanced(Some(result)))
    }
}

fn validate_selection(
    selected: Vec<String>,
    options: &[ChoiceOption],
) -> EngineResult<Vec<String>> {
    for id in &selected {
        if !options.iter().any(|option| &option.id == id) {
            return Err(DispatchError::Validation {
                path: id.clone(),
                message: "selection is not among the offered choices".to_string(),
            }
            .into());
        }
    }
    Ok(selected)
}

fn sequence_items_error(reference: &str, value: &Value) -> GrimoireError {
    DispatchError::Validation {
        path: reference.to_string(),
        message: format!("sequence items must be a list, got {}", value_kind(value)),
    }
    .into()
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}
