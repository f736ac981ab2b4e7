//! Batch planning integration tests.
//!
//! These tests load plans the way the CLI does and verify the batches the
//! planner produces from them.

use std::collections::HashMap;

use weft::core::{plan_batches, Plan, Step, StepId};
use weft::{Error, ErrorKind};

use crate::fixtures::{diamond_steps, step};

fn batch_index(batches: &[weft::core::Batch]) -> HashMap<StepId, usize> {
    let mut index = HashMap::new();
    for (i, batch) in batches.iter().enumerate() {
        for s in &batch.steps {
            index.insert(s.id.clone(), i);
        }
    }
    index
}

/// Test: Diamond dependencies
/// Given two independent steps and a third depending on both
/// When planned
/// Then the independent steps share the first batch
#[test]
fn test_diamond_plan_two_batches() {
    let batches = plan_batches(&diamond_steps()).unwrap();
    assert_eq!(batches.len(), 2);

    let mut first: Vec<String> = batches[0].steps.iter().map(|s| s.id.to_string()).collect();
    first.sort();
    assert_eq!(first, vec!["1", "2"]);
    assert_eq!(batches[1].label(), "3");
}

/// Test: Shared target file
/// Given two parallel steps writing the same file
/// When planned
/// Then they land in separate batches
#[test]
fn test_shared_file_splits_batches() {
    let steps = vec![
        step(1, "first edit", &["f.rs"], &[]),
        step(2, "second edit", &["f.rs"], &[]),
    ];
    let batches = plan_batches(&steps).unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[1].len(), 1);
}

/// Test: Two-step cycle
/// Given X depends on Y and Y on X
/// When planned
/// Then the plan is invalid and the error names both steps
#[test]
fn test_cycle_names_both_steps() {
    let steps = vec![
        Step::new("X", "x").with_deps(vec![StepId::from("Y")]),
        Step::new("Y", "y").with_deps(vec![StepId::from("X")]),
    ];
    let err = plan_batches(&steps).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PlanInvalid);
    let Error::PlanInvalid(errors) = err else {
        panic!("Expected PlanInvalid");
    };
    assert!(errors[0].contains("Circular dependency"));
    assert!(errors[0].contains('X'));
    assert!(errors[0].contains('Y'));
}

/// Test: Dangling dependency
/// Given a step that depends on an id not in the plan
/// When planned
/// Then the error names the step and the missing id
#[test]
fn test_dangling_dependency_reported() {
    let steps = vec![step(1, "a", &[], &[]), step(2, "b", &[], &[99])];
    let Error::PlanInvalid(errors) = plan_batches(&steps).unwrap_err() else {
        panic!("Expected PlanInvalid");
    };
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Step 2"));
    assert!(errors[0].contains("99"));
}

/// Test: Mixed exclusive steps
/// Given a chain with a non-parallelizable step among parallel ones
/// When planned
/// Then every dependency sits in an earlier batch and the exclusive step is alone
#[test]
fn test_exclusive_step_and_ordering() {
    let steps = vec![
        step(1, "schema", &["db/schema.sql"], &[]),
        step(2, "migrate", &["db/migrate.rs"], &[1]).exclusive(),
        step(3, "api", &["src/api.rs"], &[1]),
        step(4, "ui", &["src/ui.rs"], &[]),
        step(5, "docs", &["README.md"], &[2, 3]),
    ];
    let batches = plan_batches(&steps).unwrap();
    let index = batch_index(&batches);

    for s in &steps {
        for dep in &s.dependencies {
            assert!(index[dep] < index[&s.id], "{} must follow {}", s.id, dep);
        }
    }
    let migrate = &batches[index[&StepId::from(2)]];
    assert_eq!(migrate.len(), 1);

    // Planning is deterministic.
    assert_eq!(plan_batches(&steps).unwrap(), batches);
}

/// Test: Plan file formats
/// Given the same plan as camelCase JSON and snake_case TOML
/// When loaded and planned
/// Then both produce the same batches
#[test]
fn test_plan_files_json_and_toml() {
    let dir = tempfile::TempDir::new().unwrap();
    let json_path = dir.path().join("plan.json");
    let toml_path = dir.path().join("plan.toml");

    std::fs::write(
        &json_path,
        r#"{
  "requirements": { "goal": "Add greeting", "acceptanceCriteria": ["prints hi"] },
  "steps": [
    { "id": 1, "description": "Write greet()", "targetFiles": ["src/greet.rs"], "testCommand": "true" },
    { "id": 2, "description": "Call greet()", "targetFiles": ["src/main.rs"], "dependencies": [1] }
  ],
  "cautions": [ { "context": "style", "instruction": "no unwrap" } ]
}"#,
    )
    .unwrap();
    std::fs::write(
        &toml_path,
        r#"
[requirements]
goal = "Add greeting"

[[steps]]
id = 1
description = "Write greet()"
target_files = ["src/greet.rs"]
test_command = "true"

[[steps]]
id = 2
description = "Call greet()"
target_files = ["src/main.rs"]
dependencies = [1]

[[cautions]]
context = "style"
instruction = "no unwrap"
"#,
    )
    .unwrap();

    let from_json = Plan::load(&json_path).unwrap();
    let from_toml = Plan::load(&toml_path).unwrap();
    assert_eq!(from_json.steps, from_toml.steps);
    assert_eq!(from_json.cautions, from_toml.cautions);
    assert!(from_json.validate().unwrap().is_empty());

    let batches = plan_batches(&from_json.steps).unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].steps[0].test_command.as_deref(), Some("true"));
}

/// Test: Duplicate ids
/// Given a plan with a repeated step id
/// When validated
/// Then validation fails before planning
#[test]
fn test_duplicate_ids_rejected_by_validation() {
    let plan = Plan {
        steps: vec![step(1, "a", &[], &[]), step(1, "b", &[], &[])],
        ..Plan::default()
    };
    let Error::PlanInvalid(errors) = plan.validate().unwrap_err() else {
        panic!("Expected PlanInvalid");
    };
    assert!(errors.iter().any(|e| e.contains("Duplicate step ID found: 1")));
}
