//! Deterministic reference collaborators.
//!
//! These back the CLI and the test suites; real deployments substitute
//! their own implementations through the [`Host`](super::Host) builder.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use super::{
    ChoiceOption, CollaboratorResult, DataValidator, DiceRoll, DiceRoller, LlmProvider,
    NameGenerator, PlayerInteraction, TableDraw, TableStore, ValidationReport,
};
use crate::error::CollaboratorError;
use crate::flow::{JsonMap, NameSettings};

/// Seeded dice roller for `NdM`, `NdM+K` and `NdM-K` expressions.
pub struct SeededDice {
    rng: Mutex<StdRng>,
}

impl SeededDice {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

fn parse_expr(expr: &str) -> Result<(u32, u32, i64), CollaboratorError> {
    let bad = || CollaboratorError::Dice(format!("unsupported dice expression '{}'", expr));
    let expr = expr.trim().to_lowercase();
    let (dice_part, modifier) = match expr.find(|c| c == '+' || c == '-') {
        Some(at) => {
            let modifier: i64 = expr[at..].parse().map_err(|_| bad())?;
            (&expr[..at], modifier)
        }
        None => (expr.as_str(), 0),
    };
    let (count, sides) = dice_part.split_once('d').ok_or_else(bad)?;
    let count: u32 = if count.is_empty() {
        1
    } else {
        count.trim().parse().map_err(|_| bad())?
    };
    let sides: u32 = sides.trim().parse().map_err(|_| bad())?;
    if count == 0 || sides == 0 {
        return Err(bad());
    }
    Ok((count, sides, modifier))
}

#[async_trait]
impl DiceRoller for SeededDice {
    async fn roll(&self, expr: &str) -> CollaboratorResult<DiceRoll> {
        let (count, sides, modifier) = parse_expr(expr)?;
        let mut rng = self.rng.lock().expect("dice rng poisoned");
        let rolls: Vec<i64> = (0..count)
            .map(|_| rng.gen_range(1..=sides as i64))
            .collect();
        let sum: i64 = rolls.iter().sum();
        let total = sum + modifier;
        let faces = rolls
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let detail = match modifier {
            0 => format!("{}: [{}] = {}", expr.trim(), faces, total),
            m if m > 0 => format!("{}: [{}] + {} = {}", expr.trim(), faces, m, total),
            m => format!("{}: [{}] - {} = {}", expr.trim(), faces, -m, total),
        };
        Ok(DiceRoll { total, detail })
    }
}

/// In-memory table store with uniform seeded draws.
pub struct StaticTableStore {
    tables: DashMap<String, Vec<Value>>,
    rng: Mutex<StdRng>,
}

impl StaticTableStore {
    pub fn new(seed: u64) -> Self {
        Self {
            tables: DashMap::new(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn insert(&self, name: &str, rows: Vec<Value>) {
        self.tables.insert(name.to_string(), rows);
    }
}

#[async_trait]
impl TableStore for StaticTableStore {
    async fn roll_table(&self, name: &str) -> CollaboratorResult<TableDraw> {
        let rows = self
            .tables
            .get(name)
            .ok_or_else(|| CollaboratorError::Table(format!("unknown table '{}'", name)))?;
        if rows.is_empty() {
            return Err(CollaboratorError::Table(format!("table '{}' is empty", name)));
        }
        let index = self
            .rng
            .lock()
            .expect("table rng poisoned")
            .gen_range(0..rows.len());
        let face = (index + 1) as i64;
        Ok(TableDraw {
            entry: rows[index].clone(),
            roll_result: DiceRoll {
                total: face,
                detail: format!("1d{}: [{}] = {}", rows.len(), face, face),
            },
        })
    }
}

/// Cycles a fixed name list, honoring `max_length`.
pub struct ListNameGenerator {
    names: Vec<String>,
    cursor: AtomicUsize,
}

impl Default for ListNameGenerator {
    fn default() -> Self {
        Self::new(
            ["Rin", "Maro", "Essa", "Vael", "Korrin", "Thessaly"]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }
}

impl ListNameGenerator {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NameGenerator for ListNameGenerator {
    async fn generate(
        &self,
        generator: &str,
        settings: &NameSettings,
    ) -> CollaboratorResult<Value> {
        if self.names.is_empty() {
            return Err(CollaboratorError::Generator("name list is empty".to_string()));
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % self.names.len();
        let mut name = self.names[index].clone();
        name.truncate(settings.max_length);
        Ok(json!({
            "name": name,
            "generator": generator,
            "corpus": settings.corpus,
            "algorithm": settings.algorithm,
        }))
    }
}

/// Deterministic completion that echoes the prompt id and data.
pub struct EchoLlm;

#[async_trait]
impl LlmProvider for EchoLlm {
    async fn complete(
        &self,
        prompt_id: &str,
        data: &JsonMap,
        _settings: &JsonMap,
    ) -> CollaboratorResult<String> {
        let data = serde_json::to_string(&Value::Object(data.clone()))
            .map_err(|e| CollaboratorError::Llm(e.to_string()))?;
        Ok(format!("[{}] {}", prompt_id, data))
    }
}

/// Checks the six basic types and any registered model names.
#[derive(Default)]
pub struct BasicValidator {
    models: DashMap<String, ()>,
}

impl BasicValidator {
    pub fn register_model(&self, name: &str) {
        self.models.insert(name.to_string(), ());
    }
}

#[async_trait]
impl DataValidator for BasicValidator {
    async fn validate(
        &self,
        type_name: &str,
        value: &Value,
    ) -> CollaboratorResult<ValidationReport> {
        let ok = match type_name {
            "str" => value.is_string(),
            "int" => value.is_i64() || value.is_u64(),
            "bool" => value.is_boolean(),
            "float" => value.is_number(),
            "list" => value.is_array(),
            "dict" => value.is_object(),
            model => {
                if !self.models.contains_key(model) {
                    return Ok(ValidationReport {
                        errors: vec![format!("unknown type '{}'", model)],
                    });
                }
                value.is_object()
            }
        };
        if ok {
            Ok(ValidationReport::ok())
        } else {
            Ok(ValidationReport {
                errors: vec![format!("value does not conform to type '{}'", type_name)],
            })
        }
    }
}

/// Scripted player for tests and non-interactive runs. Selections and
/// inputs are popped from queues; an empty selection queue falls back to
/// the first `count` options.
#[derive(Default)]
pub struct ScriptedPlayer {
    selections: Mutex<VecDeque<Vec<String>>>,
    inputs: Mutex<VecDeque<String>>,
    displayed: Mutex<Vec<String>>,
}

impl ScriptedPlayer {
    pub fn with_selections<I, S>(selections: I) -> Self
    where
        I: IntoIterator<Item = Vec<S>>,
        S: Into<String>,
    {
        let player = Self::default();
        {
            let mut queue = player.selections.lock().expect("selection queue poisoned");
            for selection in selections {
                queue.push_back(selection.into_iter().map(Into::into).collect());
            }
        }
        player
    }

    pub fn push_input<S: Into<String>>(&self, input: S) {
        self.inputs
            .lock()
            .expect("input queue poisoned")
            .push_back(input.into());
    }

    pub fn displayed(&self) -> Vec<String> {
        self.displayed.lock().expect("display log poisoned").clone()
    }
}

#[async_trait]
impl PlayerInteraction for ScriptedPlayer {
    async fn choose(
        &self,
        _prompt: &str,
        options: &[ChoiceOption],
        count: usize,
    ) -> CollaboratorResult<Vec<String>> {
        let scripted = self
            .selections
            .lock()
            .expect("selection queue poisoned")
            .pop_front();
        match scripted {
            Some(selection) => Ok(selection),
            None => Ok(options.iter().take(count).map(|o| o.id.clone()).collect()),
        }
    }

    async fn input(&self, _prompt: &str) -> CollaboratorResult<String> {
        self.inputs
            .lock()
            .expect("input queue poisoned")
            .pop_front()
            .ok_or_else(|| CollaboratorError::Cancelled {
                operation: "player_input".to_string(),
            })
    }

    async fn display(&self, text: &str) -> CollaboratorResult<()> {
        self.displayed
            .lock()
            .expect("display log poisoned")
            .push(text.to_string());
        Ok(())
    }
}

/// Interactive stdin/stdout player for the CLI.
#[derive(Default)]
pub struct ConsolePlayer;

impl ConsolePlayer {
    async fn read_line(prompt: String) -> CollaboratorResult<String> {
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            print!("{} ", prompt);
            std::io::stdout()
                .flush()
                .map_err(|e| CollaboratorError::Generator(e.to_string()))?;
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .map_err(|e| CollaboratorError::Generator(e.to_string()))?;
            Ok(line.trim().to_string())
        })
        .await
        .map_err(|e| CollaboratorError::Generator(e.to_string()))?
    }
}

#[async_trait]
impl PlayerInteraction for ConsolePlayer {
    async fn choose(
        &self,
        prompt: &str,
        options: &[ChoiceOption],
        count: usize,
    ) -> CollaboratorResult<Vec<String>> {
        println!("{}", prompt);
        for (index, option) in options.iter().enumerate() {
            println!("  {}. {}", index + 1, option.label);
        }
        let hint = if count > 1 {
            format!("pick {} (comma-separated numbers):", count)
        } else {
            "pick one (number):".to_string()
        };
        for _ in 0..3 {
            let line = Self::read_line(hint.clone()).await?;
            let picks: Option<Vec<String>> = line
                .split(',')
                .map(|part| {
                    part.trim()
                        .parse::<usize>()
                        .ok()
                        .filter(|n| (1..=options.len()).contains(n))
                        .map(|n| options[n - 1].id.clone())
                })
                .collect();
            match picks {
                Some(ids) if ids.len() == count => return Ok(ids),
                _ => println!("invalid selection, try again"),
            }
        }
        Err(CollaboratorError::Cancelled {
            operation: "player_choice".to_string(),
        })
    }

    async fn input(&self, prompt: &str) -> CollaboratorResult<String> {
        Self::read_line(format!("{}:", prompt)).await
    }

    async fn display(&self, text: &str) -> CollaboratorResult<()> {
        println!("{}", text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dice_expression_parsing() {
        let dice = SeededDice::new(7);
        let roll = dice.roll("1d1").await.unwrap();
        assert_eq!(roll.total, 1);
        assert_eq!(roll.detail, "1d1: [1] = 1");

        let roll = dice.roll("2d1+3").await.unwrap();
        assert_eq!(roll.total, 5);
        assert_eq!(roll.detail, "2d1+3: [1, 1] + 3 = 5");

        let roll = dice.roll("d1-1").await.unwrap();
        assert_eq!(roll.total, 0);

        assert!(dice.roll("banana").await.is_err());
        assert!(dice.roll("0d6").await.is_err());
    }

    #[tokio::test]
    async fn test_dice_rolls_are_seeded() {
        let a = SeededDice::new(42);
        let b = SeededDice::new(42);
        for _ in 0..10 {
            let x = a.roll("3d6").await.unwrap();
            let y = b.roll("3d6").await.unwrap();
            assert_eq!(x, y);
        }
    }

    #[tokio::test]
    async fn test_dice_totals_in_range() {
        let dice = SeededDice::new(1);
        for _ in 0..50 {
            let roll = dice.roll("2d6").await.unwrap();
            assert!((2..=12).contains(&roll.total), "total {}", roll.total);
        }
    }

    #[tokio::test]
    async fn test_table_store() {
        let store = StaticTableStore::new(3);
        store.insert(
            "encounters",
            vec![json!({"id": "goblin"}), json!({"id": "wolf"})],
        );
        let draw = store.roll_table("encounters").await.unwrap();
        assert!(draw.entry.get("id").is_some());
        assert!((1..=2).contains(&draw.roll_result.total));
        assert!(store.roll_table("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_name_generator_truncates() {
        let names = ListNameGenerator::new(vec!["Thessalonianra".to_string()]);
        let settings = NameSettings {
            max_length: 6,
            ..NameSettings::default()
        };
        let value = names.generate("wyrdbound-rng", &settings).await.unwrap();
        assert_eq!(value["name"], json!("Thessa"));
        assert_eq!(value["generator"], json!("wyrdbound-rng"));
    }

    #[tokio::test]
    async fn test_basic_validator() {
        let validator = BasicValidator::default();
        assert!(validator
            .validate("int", &json!(3))
            .await
            .unwrap()
            .is_ok());
        assert!(!validator
            .validate("int", &json!("three"))
            .await
            .unwrap()
            .is_ok());
        assert!(!validator
            .validate("character", &json!({}))
            .await
            .unwrap()
            .is_ok());
        validator.register_model("character");
        assert!(validator
            .validate("character", &json!({}))
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_scripted_player_defaults_to_first_options() {
        let player = ScriptedPlayer::default();
        let options = vec![
            ChoiceOption {
                id: "a".to_string(),
                label: "A".to_string(),
            },
            ChoiceOption {
                id: "b".to_string(),
                label: "B".to_string(),
            },
        ];
        let picked = player.choose("?", &options, 1).await.unwrap();
        assert_eq!(picked, vec!["a".to_string()]);
    }
}
