//! DSL parsing, validation, and file loading.
//!
//! Converts YAML or JSON documents into the canonical `WorkflowDsl` and
//! checks the structural constraints a version must satisfy before it can
//! be published (unique ids, resolvable targets, reachable steps).

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use conductor_types::dsl::{StepConfig, StepSpec, WorkflowDsl, SUPPORTED_SCHEMA_VERSION};
use conductor_types::error::DefinitionError;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document into a `WorkflowDsl`. Not validated.
pub fn parse_dsl_yaml(yaml: &str) -> Result<WorkflowDsl, DefinitionError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Parse a JSON document into a `WorkflowDsl`. Not validated.
pub fn parse_dsl_json(json: &str) -> Result<WorkflowDsl, DefinitionError> {
    serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Parse either format; documents starting with `{` are read as JSON.
pub fn parse_dsl(content: &str) -> Result<WorkflowDsl, DefinitionError> {
    if content.trim_start().starts_with('{') {
        parse_dsl_json(content)
    } else {
        parse_dsl_yaml(content)
    }
}

pub fn serialize_dsl_yaml(dsl: &WorkflowDsl) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(dsl).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Load and validate a DSL file (`.yaml`, `.yml` or `.json`).
pub fn load_dsl_file(path: &Path) -> Result<WorkflowDsl, DefinitionError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DefinitionError::Parse(format!("{}: {e}", path.display())))?;
    let dsl = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_dsl_json(&content)?,
        Some("yaml") | Some("yml") => parse_dsl_yaml(&content)?,
        _ => parse_dsl(&content)?,
    };
    validate_dsl(&dsl)?;
    Ok(dsl)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn invalid(message: String) -> DefinitionError {
    DefinitionError::Validation(message)
}

/// Validate structural constraints on a `WorkflowDsl`.
///
/// Checks:
/// - Schema version is supported and at least one step exists
/// - Step ids are unique and non-empty; `start_at` names a step
/// - Each step's `type` matches its config payload
/// - Every `next`, branch target, and parallel branch names a step
/// - Branch steps have at least one rule, a default, and well-formed conditions
/// - Parallel branches are synchronous step types without their own `next`
/// - Timers, timeouts, signals and retry budgets are non-degenerate
/// - Every step is reachable from `start_at`
pub fn validate_dsl(dsl: &WorkflowDsl) -> Result<(), DefinitionError> {
    if dsl.schema_version != SUPPORTED_SCHEMA_VERSION {
        return Err(invalid(format!(
            "unsupported schema version {} (expected {})",
            dsl.schema_version, SUPPORTED_SCHEMA_VERSION
        )));
    }

    if dsl.steps.is_empty() {
        return Err(invalid("workflow must have at least one step".to_string()));
    }

    let mut ids = HashSet::new();
    for step in &dsl.steps {
        if step.id.trim().is_empty() {
            return Err(invalid("step id must not be empty".to_string()));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(invalid(format!("duplicate step id: '{}'", step.id)));
        }
    }

    if !ids.contains(dsl.start_at.as_str()) {
        return Err(invalid(format!(
            "start_at references unknown step '{}'",
            dsl.start_at
        )));
    }

    for step in &dsl.steps {
        validate_step(dsl, step, &ids)?;
    }

    let reachable = reachable_steps(dsl);
    if let Some(orphan) = dsl.steps.iter().find(|s| !reachable.contains(s.id.as_str())) {
        return Err(invalid(format!(
            "step '{}' is unreachable from '{}'",
            orphan.id, dsl.start_at
        )));
    }

    Ok(())
}

fn validate_step(
    dsl: &WorkflowDsl,
    step: &StepSpec,
    ids: &HashSet<&str>,
) -> Result<(), DefinitionError> {
    if step.step_type != step.config.step_type() {
        return Err(invalid(format!(
            "step '{}' declares type {} but its config is {}",
            step.id,
            step.step_type,
            step.config.step_type()
        )));
    }

    let require = |target: &str, what: &str| -> Result<(), DefinitionError> {
        if ids.contains(target) {
            Ok(())
        } else {
            Err(invalid(format!(
                "step '{}' {what} unknown step '{target}'",
                step.id
            )))
        }
    };

    if let Some(next) = &step.next {
        require(next, "continues to")?;
    }

    if step.timeout_secs == Some(0) {
        return Err(invalid(format!("step '{}': timeout must be > 0", step.id)));
    }

    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            return Err(invalid(format!(
                "step '{}': retry.max_attempts must be >= 1",
                step.id
            )));
        }
    }

    match &step.config {
        StepConfig::ServiceTask { method_id, .. } if method_id.trim().is_empty() => {
            return Err(invalid(format!("step '{}': method_id is empty", step.id)));
        }
        StepConfig::WaitForSignal { signal, .. } if signal.trim().is_empty() => {
            return Err(invalid(format!("step '{}': signal name is empty", step.id)));
        }
        StepConfig::Timer { duration_secs: 0 } => {
            return Err(invalid(format!("step '{}': timer duration must be > 0", step.id)));
        }
        StepConfig::SubWorkflow {
            definition_code, ..
        } if definition_code.trim().is_empty() => {
            return Err(invalid(format!(
                "step '{}': sub-workflow definition code is empty",
                step.id
            )));
        }
        StepConfig::Branch { branches, default } => {
            if branches.is_empty() {
                return Err(invalid(format!("branch '{}' has no rules", step.id)));
            }
            let Some(default) = default else {
                return Err(invalid(format!("branch '{}' has no default target", step.id)));
            };
            require(default, "defaults to")?;
            for rule in branches {
                require(&rule.to, "branches to")?;
                check_condition(&step.id, &rule.when)?;
            }
        }
        StepConfig::Parallel { branches } => {
            if branches.is_empty() {
                return Err(invalid(format!("parallel '{}' has no branches", step.id)));
            }
            for branch_id in branches {
                require(branch_id, "fans out to")?;
                if let Some(branch) = dsl.step(branch_id) {
                    if !branch.step_type.is_synchronous() {
                        return Err(invalid(format!(
                            "parallel '{}' branch '{}' is a {} step; only service_task, emit_event and assign may run in parallel",
                            step.id, branch.id, branch.step_type
                        )));
                    }
                    if branch.next.is_some() {
                        return Err(invalid(format!(
                            "parallel '{}' branch '{}' must not declare next",
                            step.id, branch.id
                        )));
                    }
                }
            }
        }
        StepConfig::EmitEvent { event_name, .. } if event_name.trim().is_empty() => {
            return Err(invalid(format!("step '{}': event name is empty", step.id)));
        }
        _ => {}
    }

    Ok(())
}

/// Cheap well-formedness check for a branch condition: non-empty, balanced
/// brackets, closed string literals. Evaluation errors surface at runtime.
fn check_condition(step_id: &str, expression: &str) -> Result<(), DefinitionError> {
    if expression.trim().is_empty() {
        return Err(invalid(format!("branch '{step_id}' has an empty condition")));
    }

    let mut stack = Vec::new();
    let mut quote: Option<char> = None;
    for c in expression.chars() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(open) {
                    return Err(invalid(format!(
                        "branch '{step_id}' condition '{expression}' has unbalanced '{c}'"
                    )));
                }
            }
            _ => {}
        }
    }

    if quote.is_some() || !stack.is_empty() {
        return Err(invalid(format!(
            "branch '{step_id}' condition '{expression}' is not closed"
        )));
    }
    Ok(())
}

/// Successor edges of a step: `next`, branch targets, parallel branches.
pub fn successors(step: &StepSpec) -> Vec<&str> {
    let mut out = Vec::new();
    match &step.config {
        StepConfig::Branch { branches, default } => {
            out.extend(branches.iter().map(|r| r.to.as_str()));
            out.extend(default.as_deref());
        }
        StepConfig::Parallel { branches } => out.extend(branches.iter().map(String::as_str)),
        _ => {}
    }
    out.extend(step.next.as_deref());
    out
}

/// Ids reachable from `start_at` (breadth-first).
fn reachable_steps(dsl: &WorkflowDsl) -> HashSet<&str> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([dsl.start_at.as_str()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(step) = dsl.step(id) {
            queue.extend(successors(step));
        }
    }
    seen
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::dsl::{BranchRule, RetryPolicy};

    fn assign(id: &str) -> StepSpec {
        StepSpec::new(id, StepConfig::Assign { values: serde_json::Map::new() })
    }

    fn wait(id: &str, signal: &str) -> StepSpec {
        StepSpec::new(
            id,
            StepConfig::WaitForSignal {
                signal: signal.to_string(),
                fail_on: Vec::new(),
            },
        )
    }

    fn dsl(start_at: &str, steps: Vec<StepSpec>) -> WorkflowDsl {
        WorkflowDsl {
            schema_version: SUPPORTED_SCHEMA_VERSION,
            start_at: start_at.to_string(),
            steps,
            output_keys: Vec::new(),
        }
    }

    fn expect_invalid(dsl: &WorkflowDsl, fragment: &str) {
        match validate_dsl(dsl) {
            Err(DefinitionError::Validation(msg)) => assert!(
                msg.contains(fragment),
                "expected '{fragment}' in '{msg}'"
            ),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    const ORDER_YAML: &str = r#"
start_at: reserve-inventory
steps:
  - id: reserve-inventory
    type: service_task
    config:
      type: service_task
      method_id: inventory.reserve
    next: await-payment
    compensation:
      - kind: service_call
        method_id: release-inventory
  - id: await-payment
    type: wait_for_signal
    config:
      type: wait_for_signal
      signal: PaymentConfirmed
      fail_on: [PaymentFailed]
"#;

    #[test]
    fn test_parse_and_validate_yaml() {
        let parsed = parse_dsl(ORDER_YAML).unwrap();
        assert!(validate_dsl(&parsed).is_ok());
        assert_eq!(parsed.steps.len(), 2);
    }

    #[test]
    fn test_parse_detects_json() {
        let yaml = parse_dsl_yaml(ORDER_YAML).unwrap();
        let json = serde_json::to_string(&yaml).unwrap();
        assert_eq!(parse_dsl(&json).unwrap(), yaml);
    }

    #[test]
    fn test_parse_error_is_reported() {
        assert!(matches!(
            parse_dsl("start_at: [unterminated"),
            Err(DefinitionError::Parse(_))
        ));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let parsed = parse_dsl_yaml(ORDER_YAML).unwrap();
        let yaml = serialize_dsl_yaml(&parsed).unwrap();
        assert_eq!(parse_dsl_yaml(&yaml).unwrap(), parsed);
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        expect_invalid(
            &dsl("a", vec![assign("a").with_next("a2"), assign("a2"), assign("a2")]),
            "duplicate step id",
        );
    }

    #[test]
    fn test_rejects_unknown_start_and_next() {
        expect_invalid(&dsl("missing", vec![assign("a")]), "start_at");
        expect_invalid(&dsl("a", vec![assign("a").with_next("b")]), "unknown step 'b'");
    }

    #[test]
    fn test_rejects_type_config_mismatch() {
        let mut step = assign("a");
        step.step_type = conductor_types::dsl::StepType::Timer;
        expect_invalid(&dsl("a", vec![step]), "declares type timer");
    }

    #[test]
    fn test_branch_requires_default() {
        let branch = StepSpec::new(
            "route",
            StepConfig::Branch {
                branches: vec![BranchRule {
                    when: "total > 100".to_string(),
                    to: "big".to_string(),
                }],
                default: None,
            },
        );
        expect_invalid(&dsl("route", vec![branch, assign("big")]), "no default");
    }

    #[test]
    fn test_branch_condition_must_be_closed() {
        let branch = StepSpec::new(
            "route",
            StepConfig::Branch {
                branches: vec![BranchRule {
                    when: "(total > 100".to_string(),
                    to: "big".to_string(),
                }],
                default: Some("small".to_string()),
            },
        );
        expect_invalid(
            &dsl("route", vec![branch, assign("big"), assign("small")]),
            "not closed",
        );
    }

    #[test]
    fn test_valid_branch_graph() {
        let branch = StepSpec::new(
            "route",
            StepConfig::Branch {
                branches: vec![BranchRule {
                    when: "tier == 'gold' && total > 100".to_string(),
                    to: "big".to_string(),
                }],
                default: Some("small".to_string()),
            },
        );
        let graph = dsl(
            "route",
            vec![
                branch,
                assign("big").with_next("done"),
                assign("small").with_next("done"),
                assign("done"),
            ],
        );
        assert!(validate_dsl(&graph).is_ok());
    }

    #[test]
    fn test_parallel_branches_must_be_synchronous() {
        let fan = StepSpec::new(
            "fan",
            StepConfig::Parallel {
                branches: vec!["a".to_string(), "w".to_string()],
            },
        );
        expect_invalid(
            &dsl("fan", vec![fan, assign("a"), wait("w", "Go")]),
            "only service_task",
        );
    }

    #[test]
    fn test_parallel_branches_must_not_continue() {
        let fan = StepSpec::new(
            "fan",
            StepConfig::Parallel {
                branches: vec!["a".to_string()],
            },
        )
        .with_next("b");
        expect_invalid(
            &dsl("fan", vec![fan, assign("a").with_next("b"), assign("b")]),
            "must not declare next",
        );
    }

    #[test]
    fn test_rejects_unreachable_step() {
        expect_invalid(&dsl("a", vec![assign("a"), assign("island")]), "unreachable");
    }

    #[test]
    fn test_rejects_degenerate_values() {
        expect_invalid(
            &dsl("t", vec![StepSpec::new("t", StepConfig::Timer { duration_secs: 0 })]),
            "timer duration",
        );
        expect_invalid(&dsl("w", vec![wait("w", " ")]), "signal name is empty");
        expect_invalid(&dsl("a", vec![assign("a").with_timeout(0)]), "timeout");
        expect_invalid(
            &dsl(
                "a",
                vec![assign("a").with_retry(RetryPolicy {
                    max_attempts: 0,
                    ..RetryPolicy::default()
                })],
            ),
            "max_attempts",
        );
    }

    #[test]
    fn test_rejects_unsupported_schema_version() {
        let mut graph = dsl("a", vec![assign("a")]);
        graph.schema_version = 99;
        expect_invalid(&graph, "unsupported schema version");
    }

    #[test]
    fn test_load_dsl_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order.yaml");
        std::fs::write(&path, ORDER_YAML).unwrap();
        let loaded = load_dsl_file(&path).unwrap();
        assert_eq!(loaded.start_at, "reserve-inventory");

        let json_path = dir.path().join("order.json");
        std::fs::write(&json_path, serde_json::to_string(&loaded).unwrap()).unwrap();
        assert_eq!(load_dsl_file(&json_path).unwrap(), loaded);

        assert!(load_dsl_file(&dir.path().join("absent.yaml")).is_err());
    }
}
