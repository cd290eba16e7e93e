use std::sync::Arc;

use grimoire::host::builtin::{ScriptedPlayer, StaticTableStore};
use grimoire::host::Host;
use grimoire::{
    CollaboratorError, DispatchError, Engine, EngineConfig, EngineEventKind, FlowRegistry,
    GrimoireError, JsonMap, PathError, RunOutcome,
};
use serde_json::json;

fn engine_with_host(flows: &[&str], host: Host) -> Engine {
    let registry = Arc::new(FlowRegistry::new());
    for source in flows {
        registry.load_str(source).unwrap();
    }
    Engine::new(registry, Arc::new(host), EngineConfig::default()).unwrap()
}

fn engine(flows: &[&str]) -> Engine {
    engine_with_host(flows, Host::builder(0).build())
}

async fn run_to_outputs(engine: &Engine, flow_id: &str) -> JsonMap {
    match engine.run(flow_id, JsonMap::new()).await.unwrap() {
        RunOutcome::Completed(outputs) => outputs,
        RunOutcome::Paused(_) => panic!("flow paused unexpectedly"),
    }
}

#[tokio::test]
async fn test_single_dice_roll() {
    let flow = r#"
id: single-roll
name: Single roll
steps:
  - id: r
    type: dice_roll
    roll: "1d1"
    actions:
      - set_value:
          path: outputs.x
          value: "{{ result.total }}"
  - id: done
    type: completion
outputs:
  - type: int
    id: x
"#;
    let engine = engine(&[flow]);
    let outputs = run_to_outputs(&engine, "single-roll").await;
    assert_eq!(outputs.get("x"), Some(&json!(1)));
}

#[tokio::test]
async fn test_dice_sequence_binds_item() {
    let flow = r#"
id: seq
name: Sequence
steps:
  - id: s
    type: dice_sequence
    sequence:
      items: ["a", "b"]
      roll: "1d1"
      actions:
        - set_value:
            path: "outputs.m.{{ item }}"
            value: "{{ result.total }}"
  - id: done
    type: completion
outputs:
  - type: dict
    id: m
"#;
    let engine = engine(&[flow]);
    let outputs = run_to_outputs(&engine, "seq").await;
    assert_eq!(outputs.get("m"), Some(&json!({"a": 1, "b": 1})));
}

#[tokio::test]
async fn test_player_choice_next_step_override() {
    let flow = r#"
id: choose
name: Choose
steps:
  - id: pick
    type: player_choice
    prompt: "Where to?"
    choices:
      - id: go
        label: "Go"
        next_step: end
      - id: stay
        label: "Stay"
    next_step: stay_step
  - id: stay_step
    type: dice_roll
    roll: "1d1"
    actions:
      - set_value:
          path: outputs.path
          value: stayed
  - id: end
    type: completion
    actions:
      - set_value:
          path: outputs.path
          value: ended
outputs:
  - type: str
    id: path
"#;
    let player = ScriptedPlayer::with_selections(vec![vec!["go"]]);
    let host = Host::builder(0).player(Arc::new(player)).build();
    let engine = engine_with_host(&[flow], host);
    let outputs = run_to_outputs(&engine, "choose").await;
    assert_eq!(outputs.get("path"), Some(&json!("ended")));
}

#[tokio::test]
async fn test_choice_actions_see_selection_as_result() {
    let flow = r#"
id: choose-result
name: Choose result
steps:
  - id: pick
    type: player_choice
    choices:
      - id: sword
        label: "Sword"
        actions:
          - set_value:
              path: outputs.weapon
              value: "{{ result }}"
      - id: bow
        label: "Bow"
  - id: done
    type: completion
outputs:
  - type: str
    id: weapon
"#;
    let player = ScriptedPlayer::with_selections(vec![vec!["sword"]]);
    let host = Host::builder(0).player(Arc::new(player)).build();
    let engine = engine_with_host(&[flow], host);
    let outputs = run_to_outputs(&engine, "choose-result").await;
    assert_eq!(outputs.get("weapon"), Some(&json!("sword")));
}

#[tokio::test]
async fn test_sub_flow_output_marshaling() {
    let child = r#"
id: child
name: Child
steps:
  - id: done
    type: completion
    actions:
      - set_value:
          path: outputs.name
          value: Rin
outputs:
  - type: str
    id: name
"#;
    let parent = r#"
id: parent
name: Parent
steps:
  - id: call
    type: flow_call
    flow: child
    actions:
      - set_value:
          path: outputs.n
          value: result.name
  - id: done
    type: completion
outputs:
  - type: str
    id: n
"#;
    let engine = engine(&[child, parent]);
    let outputs = run_to_outputs(&engine, "parent").await;
    assert_eq!(outputs.get("n"), Some(&json!("Rin")));
}

#[tokio::test]
async fn test_condition_false_skips_without_result() {
    let flow = r#"
id: cond
name: Conditional
steps:
  - id: maybe
    type: dice_roll
    roll: "1d1"
    condition: "{{ false_flag || '' }}"
    actions:
      - set_value:
          path: outputs.ran
          value: "yes"
  - id: observe
    type: completion
    actions:
      - set_value:
          path: outputs.r
          value: "{{ result || 'none' }}"
outputs:
  - type: str
    id: r
"#;
    let engine = engine(&[flow]);
    let outputs = run_to_outputs(&engine, "cond").await;
    assert_eq!(outputs.get("r"), Some(&json!("none")));
}

#[tokio::test]
async fn test_condition_true_runs_step() {
    let flow = r#"
id: cond-true
name: Conditional true
variables:
  - type: str
    id: flag
steps:
  - id: prep
    type: dice_roll
    roll: "1d1"
    actions:
      - set_value:
          path: variables.flag
          value: "on"
  - id: maybe
    type: dice_roll
    roll: "1d1"
    condition: "{{ variables.flag || '' }}"
    actions:
      - set_value:
          path: outputs.ran
          value: "yes"
  - id: done
    type: completion
outputs:
  - type: str
    id: ran
"#;
    let engine = engine(&[flow]);
    let outputs = run_to_outputs(&engine, "cond-true").await;
    assert_eq!(outputs.get("ran"), Some(&json!("yes")));
}

#[tokio::test]
async fn test_sub_flow_isolation() {
    let child = r#"
id: iso-child
name: Iso child
steps:
  - id: done
    type: completion
    actions:
      - set_value:
          path: outputs.seen
          value: "{{ variables.secret || 'unseen' }}"
outputs:
  - type: str
    id: seen
"#;
    let parent = r#"
id: iso-parent
name: Iso parent
steps:
  - id: setup
    type: dice_roll
    roll: "1d1"
    actions:
      - set_value:
          path: variables.secret
          value: hidden
  - id: call
    type: flow_call
    flow: iso-child
    actions:
      - set_value:
          path: outputs.seen
          value: result.seen
  - id: done
    type: completion
outputs:
  - type: str
    id: seen
"#;
    let engine = engine(&[child, parent]);
    let outputs = run_to_outputs(&engine, "iso-parent").await;
    assert_eq!(outputs.get("seen"), Some(&json!("unseen")));
}

#[tokio::test]
async fn test_missing_required_input() {
    let flow = r#"
id: needs-input
name: Needs input
inputs:
  - type: str
    id: system
    required: true
steps:
  - id: done
    type: completion
"#;
    let engine = engine(&[flow]);
    let err = engine.run("needs-input", JsonMap::new()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        GrimoireError::Dispatch(DispatchError::MissingInput { .. })
    ));
}

#[tokio::test]
async fn test_inputs_visible_to_templates() {
    let flow = r#"
id: echo-input
name: Echo input
inputs:
  - type: str
    id: system
    required: true
steps:
  - id: done
    type: completion
    actions:
      - set_value:
          path: outputs.system
          value: "{{ inputs.system | upper }}"
outputs:
  - type: str
    id: system
"#;
    let engine = engine(&[flow]);
    let mut inputs = JsonMap::new();
    inputs.insert("system".to_string(), json!("knave"));
    match engine.run("echo-input", inputs).await.unwrap() {
        RunOutcome::Completed(outputs) => {
            assert_eq!(outputs.get("system"), Some(&json!("KNAVE")));
        }
        RunOutcome::Paused(_) => panic!("flow paused unexpectedly"),
    }
}

#[tokio::test]
async fn test_table_roll_result_shape() {
    let flow = r#"
id: loot
name: Loot
steps:
  - id: roll-loot
    type: table_roll
    tables:
      - table: treasure
        actions:
          - set_value:
              path: outputs.item
              value: result.entry.id
          - set_value:
              path: outputs.detail
              value: "{{ result.roll_result.detail }}"
  - id: done
    type: completion
outputs:
  - type: str
    id: item
  - type: str
    id: detail
"#;
    let tables = StaticTableStore::new(0);
    tables.insert("treasure", vec![json!({"id": "gem", "value": 50})]);
    let host = Host::builder(0).tables(Arc::new(tables)).build();
    let engine = engine_with_host(&[flow], host);
    let outputs = run_to_outputs(&engine, "loot").await;
    assert_eq!(outputs.get("item"), Some(&json!("gem")));
    assert_eq!(outputs.get("detail"), Some(&json!("1d1: [1] = 1")));
}

#[tokio::test]
async fn test_parallel_table_roll_disjoint_writes() {
    let flow = r#"
id: par
name: Parallel
steps:
  - id: both
    type: table_roll
    parallel: true
    tables:
      - table: left
        actions:
          - set_value:
              path: outputs.left
              value: result.entry.id
      - table: right
        actions:
          - set_value:
              path: outputs.right
              value: result.entry.id
  - id: done
    type: completion
outputs:
  - type: str
    id: left
  - type: str
    id: right
"#;
    let tables = StaticTableStore::new(0);
    tables.insert("left", vec![json!({"id": "l"})]);
    tables.insert("right", vec![json!({"id": "r"})]);
    let host = Host::builder(0).tables(Arc::new(tables)).build();
    let engine = engine_with_host(&[flow], host);
    let outputs = run_to_outputs(&engine, "par").await;
    assert_eq!(outputs.get("left"), Some(&json!("l")));
    assert_eq!(outputs.get("right"), Some(&json!("r")));
}

#[tokio::test]
async fn test_parallel_same_path_write_is_conflict() {
    let flow = r#"
id: clash
name: Clash
steps:
  - id: both
    type: table_roll
    parallel: true
    tables:
      - table: left
        actions:
          - set_value:
              path: outputs.winner
              value: result.entry.id
      - table: right
        actions:
          - set_value:
              path: outputs.winner
              value: result.entry.id
  - id: done
    type: completion
outputs:
  - type: str
    id: winner
"#;
    let tables = StaticTableStore::new(0);
    tables.insert("left", vec![json!({"id": "l"})]);
    tables.insert("right", vec![json!({"id": "r"})]);
    let host = Host::builder(0).tables(Arc::new(tables)).build();
    let engine = engine_with_host(&[flow], host);
    let err = engine.run("clash", JsonMap::new()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        GrimoireError::Path(PathError::ConcurrentWriteConflict { .. })
    ));
}

#[tokio::test]
async fn test_player_input() {
    let flow = r#"
id: ask-name
name: Ask name
steps:
  - id: ask
    type: player_input
    prompt: "Name your character"
    actions:
      - set_value:
          path: outputs.name
          value: "{{ result | title }}"
  - id: done
    type: completion
outputs:
  - type: str
    id: name
"#;
    let player = ScriptedPlayer::default();
    player.push_input("rin the gray");
    let host = Host::builder(0).player(Arc::new(player)).build();
    let engine = engine_with_host(&[flow], host);
    let outputs = run_to_outputs(&engine, "ask-name").await;
    assert_eq!(outputs.get("name"), Some(&json!("Rin The Gray")));
}

#[tokio::test]
async fn test_llm_generation_renders_prompt_data() {
    let flow = r#"
id: describe
name: Describe
steps:
  - id: r
    type: dice_roll
    roll: "1d1"
  - id: gen
    type: llm_generation
    prompt_id: describe-scene
    prompt_data:
      total: "{{ result.total }}"
    actions:
      - set_value:
          path: outputs.text
          value: "{{ result }}"
  - id: done
    type: completion
outputs:
  - type: str
    id: text
"#;
    let engine = engine(&[flow]);
    let outputs = run_to_outputs(&engine, "describe").await;
    assert_eq!(
        outputs.get("text"),
        Some(&json!("[describe-scene] {\"total\":\"1\"}"))
    );
}

#[tokio::test]
async fn test_name_generation_defaults() {
    let flow = r#"
id: gen-name
name: Generate name
steps:
  - id: gen
    type: name_generation
    actions:
      - set_value:
          path: outputs.name
          value: result.name
      - set_value:
          path: outputs.generator
          value: result.generator
  - id: done
    type: completion
outputs:
  - type: str
    id: name
  - type: str
    id: generator
"#;
    let engine = engine(&[flow]);
    let outputs = run_to_outputs(&engine, "gen-name").await;
    assert_eq!(outputs.get("name"), Some(&json!("Rin")));
    assert_eq!(outputs.get("generator"), Some(&json!("wyrdbound-rng")));
}

#[tokio::test]
async fn test_table_from_values_choice() {
    let flow = r#"
id: pick-ability
name: Pick ability
steps:
  - id: seed
    type: dice_roll
    roll: "1d1"
    actions:
      - set_value:
          path: variables.abilities.str
          value: "strong"
      - set_value:
          path: variables.abilities.dex
          value: "nimble"
  - id: pick
    type: player_choice
    prompt: "Favored ability?"
    choice_source:
      table_from_values: variables.abilities
      display_format: "{{ key }}: {{ value }}"
  - id: done
    type: completion
    actions:
      - set_value:
          path: outputs.favored
          value: "{{ result }}"
outputs:
  - type: str
    id: favored
"#;
    let player = ScriptedPlayer::with_selections(vec![vec!["dex"]]);
    let host = Host::builder(0).player(Arc::new(player)).build();
    let engine = engine_with_host(&[flow], host);
    let outputs = run_to_outputs(&engine, "pick-ability").await;
    assert_eq!(outputs.get("favored"), Some(&json!("dex")));
}

#[tokio::test]
async fn test_pre_actions_run_before_dispatch() {
    let flow = r#"
id: pre
name: Pre-actions
steps:
  - id: r
    type: dice_roll
    roll: "1d{{ variables.sides }}"
    pre_actions:
      - set_value:
          path: variables.sides
          value: 1
    actions:
      - set_value:
          path: outputs.x
          value: "{{ result.total }}"
  - id: done
    type: completion
outputs:
  - type: int
    id: x
"#;
    let engine = engine(&[flow]);
    let outputs = run_to_outputs(&engine, "pre").await;
    assert_eq!(outputs.get("x"), Some(&json!(1)));
}

#[tokio::test]
async fn test_swap_values_action() {
    let flow = r#"
id: swap
name: Swap
steps:
  - id: seed
    type: dice_roll
    roll: "1d1"
    actions:
      - set_value:
          path: outputs.a
          value: 1
      - set_value:
          path: outputs.b
          value: 2
      - swap_values:
          path1: outputs.a
          path2: outputs.b
  - id: done
    type: completion
outputs:
  - type: int
    id: a
  - type: int
    id: b
"#;
    let engine = engine(&[flow]);
    let outputs = run_to_outputs(&engine, "swap").await;
    assert_eq!(outputs.get("a"), Some(&json!(2)));
    assert_eq!(outputs.get("b"), Some(&json!(1)));
}

#[tokio::test]
async fn test_display_value_reaches_player() {
    let flow = r#"
id: show
name: Show
steps:
  - id: r
    type: dice_roll
    roll: "1d1"
    actions:
      - display_value: result.total
  - id: done
    type: completion
"#;
    let player = Arc::new(ScriptedPlayer::default());
    let host = Host::builder(0).player(player.clone()).build();
    let engine = engine_with_host(&[flow], host);
    run_to_outputs(&engine, "show").await;
    assert_eq!(player.displayed(), vec!["1".to_string()]);
}

#[tokio::test]
async fn test_validate_value_failure() {
    let flow = r#"
id: strict-out
name: Strict output
outputs:
  - type: int
    id: level
steps:
  - id: r
    type: dice_roll
    roll: "1d1"
    actions:
      - set_value:
          path: outputs.level
          value: "not a number"
      - validate_value: outputs.level
  - id: done
    type: completion
"#;
    let engine = engine(&[flow]);
    let err = engine.run("strict-out", JsonMap::new()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        GrimoireError::Dispatch(DispatchError::Validation { .. })
    ));
}

#[tokio::test]
async fn test_output_validation_at_done() {
    let flow = r#"
id: typed-out
name: Typed output
outputs:
  - type: int
    id: level
    validate: true
steps:
  - id: r
    type: dice_roll
    roll: "1d1"
    actions:
      - set_value:
          path: outputs.level
          value: "three"
  - id: done
    type: completion
"#;
    let engine = engine(&[flow]);
    let err = engine.run("typed-out", JsonMap::new()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        GrimoireError::Dispatch(DispatchError::Validation { .. })
    ));
}

#[tokio::test]
async fn test_unknown_flow() {
    let engine = engine(&[]);
    let err = engine.run("ghost", JsonMap::new()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        GrimoireError::Dispatch(DispatchError::UnknownFlow { .. })
    ));
}

#[tokio::test]
async fn test_cancellation_checked_at_step_boundary() {
    let flow = r#"
id: cancelled
name: Cancelled
steps:
  - id: r
    type: dice_roll
    roll: "1d1"
  - id: done
    type: completion
"#;
    let (handle, cancel) = grimoire::host::signal();
    let host = Host::builder(0).cancel(cancel).build();
    handle.raise();
    let engine = engine_with_host(&[flow], host);
    let err = engine.run("cancelled", JsonMap::new()).await.unwrap_err();
    assert!(matches!(err, GrimoireError::Cancelled));
}

#[tokio::test]
async fn test_player_cancel_surfaces_as_cancelled() {
    let flow = r#"
id: ask
name: Ask
steps:
  - id: q
    type: player_input
    prompt: "Anything?"
  - id: done
    type: completion
"#;
    // An empty input queue reports Cancelled.
    let host = Host::builder(0)
        .player(Arc::new(ScriptedPlayer::default()))
        .build();
    let engine = engine_with_host(&[flow], host);
    let err = engine.run("ask", JsonMap::new()).await.unwrap_err();
    assert!(matches!(err, GrimoireError::Cancelled));
}

#[tokio::test]
async fn test_collaborator_timeout() {
    struct SlowDice;

    #[async_trait::async_trait]
    impl grimoire::host::DiceRoller for SlowDice {
        async fn roll(
            &self,
            _expr: &str,
        ) -> Result<grimoire::host::DiceRoll, CollaboratorError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(grimoire::host::DiceRoll {
                total: 1,
                detail: "1d1: [1] = 1".to_string(),
            })
        }
    }

    let flow = r#"
id: slow
name: Slow
steps:
  - id: r
    type: dice_roll
    roll: "1d1"
  - id: done
    type: completion
"#;
    let registry = Arc::new(FlowRegistry::new());
    registry.load_str(flow).unwrap();
    let host = Arc::new(Host::builder(0).dice(Arc::new(SlowDice)).build());
    let config = EngineConfig {
        collaborator_timeout: std::time::Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let engine = Engine::new(registry, host, config).unwrap();
    let err = engine.run("slow", JsonMap::new()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        GrimoireError::Collaborator(CollaboratorError::Timeout { .. })
    ));
}

#[tokio::test]
async fn test_log_actions_publish_events() {
    let flow = r#"
id: noisy
name: Noisy
steps:
  - id: r
    type: dice_roll
    roll: "1d1"
    actions:
      - log_message: "rolled {{ result.total }}"
      - log_event:
          type: roll_recorded
          data:
            total: "{{ result.total }}"
  - id: done
    type: completion
"#;
    let engine = engine(&[flow]);
    let mut events = engine.subscribe();
    run_to_outputs(&engine, "noisy").await;

    let drained = events.drain();
    let message = drained
        .iter()
        .find(|e| e.kind == EngineEventKind::Message)
        .expect("message event");
    assert_eq!(message.data, json!({"message": "rolled 1"}));

    let custom = drained
        .iter()
        .find(|e| e.kind == EngineEventKind::Custom("roll_recorded".to_string()))
        .expect("custom event");
    assert_eq!(custom.data, json!({"total": 1}));
    assert_eq!(custom.step_id.as_deref(), Some("r"));

    assert!(drained
        .iter()
        .any(|e| e.kind == EngineEventKind::FlowCompleted));
}

#[tokio::test]
async fn test_error_event_published_before_return() {
    let flow = r#"
id: broken
name: Broken
steps:
  - id: r
    type: dice_roll
    roll: "1d1"
    actions:
      - set_value:
          path: inputs.x
          value: 1
  - id: done
    type: completion
"#;
    let engine = engine(&[flow]);
    let mut events = engine.subscribe();
    let err = engine.run("broken", JsonMap::new()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        GrimoireError::Path(PathError::ReadOnlyRoot { .. })
    ));

    let drained = events.drain();
    let error_event = drained
        .iter()
        .find(|e| e.kind == EngineEventKind::Error)
        .expect("error event");
    assert!(error_event.data["error"]
        .as_str()
        .unwrap()
        .contains("ReadOnlyRoot"));
}

#[tokio::test]
async fn test_action_errors_carry_index_and_kind() {
    let flow = r#"
id: located
name: Located
steps:
  - id: r
    type: dice_roll
    roll: "1d1"
    actions:
      - log_message: "fine"
      - set_value:
          path: inputs.x
          value: 1
  - id: done
    type: completion
"#;
    let engine = engine(&[flow]);
    let err = engine.run("located", JsonMap::new()).await.unwrap_err();
    match err {
        GrimoireError::Step(fault) => {
            assert_eq!(fault.flow_id, "located");
            assert_eq!(fault.step_id, "r");
            let action = fault.action.as_ref().expect("action location");
            assert_eq!(action.index, 1);
            assert_eq!(action.kind, "set_value");
        }
        other => panic!("unexpected error shape: {other:?}"),
    }
}
