//! Workflow Parser
//!
//! Loads workflow definitions from YAML (or JSON, which YAML accepts)
//! against a single strict schema. Unknown fields, wrong types and graph
//! violations are rejected at load time, so a partially understood
//! definition never reaches the engine.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use super::model::Workflow;
use super::validator::{validate_workflow, ValidationError};

/// Errors produced while loading or saving a workflow definition.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to read workflow file '{}': {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse workflow definition: {0}")]
    Syntax(#[from] serde_yaml::Error),

    #[error("Invalid workflow definition: {0}")]
    Invalid(#[from] ValidationError),
}

/// Parses and validates a workflow definition from a string.
///
/// # Example
///
/// ```
/// use stepweaver::workflow::parse_workflow;
///
/// let workflow = parse_workflow(r#"
/// id: hello
/// steps:
///   - id: greet
///     agent: echo
/// "#).unwrap();
/// assert_eq!(workflow.steps[0].executor, "echo");
/// ```
pub fn parse_workflow(content: &str) -> Result<Workflow, ParseError> {
    let workflow: Workflow = serde_yaml::from_str(content)?;

    debug!(
        "Parsed workflow '{}' ({} steps, {} agents)",
        workflow.id,
        workflow.steps.len(),
        workflow.executors().len()
    );

    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Loads a workflow from a YAML or JSON file.
///
/// This function:
/// 1. Reads the file
/// 2. Deserializes it against the strict schema
/// 3. Validates the step graph
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, ParseError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("Definition loaded ({} bytes)", content.len());
    parse_workflow(&content)
}

/// Saves a workflow to a YAML file.
pub fn save_workflow(workflow: &Workflow, path: impl AsRef<Path>) -> Result<(), ParseError> {
    let path = path.as_ref();
    let yaml_content = serde_yaml::to_string(workflow)?;

    fs::write(path, yaml_content).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Workflow saved to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Backoff, Step, WorkflowStatus};
    use tempfile::tempdir;

    const SITE_BUILD: &str = r#"
id: site_build
name: Site build
version: 2.0.0
config:
  maxConcurrent: 2
  failFast: false
steps:
  - id: outline
    agent: content
  - id: palette
    agent: design
    parallel: true
    retryPolicy:
      maxAttempts: 3
      delay: 100
      backoff: linear
  - id: render
    agent: template
    dependsOn: [outline, palette]
    optional: true
    timeout: 5000
    params:
      theme: dark
"#;

    #[test]
    fn test_parse_full_definition() {
        let workflow = parse_workflow(SITE_BUILD).unwrap();

        assert_eq!(workflow.id, "site_build");
        assert_eq!(workflow.version, "2.0.0");
        assert_eq!(workflow.status, WorkflowStatus::Draft);
        assert_eq!(workflow.config.max_concurrent, 2);
        assert!(!workflow.config.fail_fast);
        assert!(workflow.config.save_state);

        let palette = workflow.get_step("palette").unwrap();
        assert!(palette.parallel);
        assert_eq!(palette.retry_policy.max_attempts, 3);
        assert_eq!(palette.retry_policy.backoff, Backoff::Linear);

        let render = workflow.get_step("render").unwrap();
        assert!(render.optional);
        assert_eq!(render.timeout, 5000);
        assert_eq!(render.params["theme"], "dark");
    }

    #[test]
    fn test_parse_json_definition() {
        let json = r#"{"id": "j", "steps": [{"id": "a", "agent": "echo", "dependsOn": []}]}"#;
        let workflow = parse_workflow(json).unwrap();
        assert_eq!(workflow.len(), 1);
    }

    #[test]
    fn test_unknown_top_level_field_rejected() {
        let result = parse_workflow("id: x\ntools: [bash]\nsteps:\n  - id: a\n    agent: echo\n");
        assert!(matches!(result, Err(ParseError::Syntax(_))));
    }

    #[test]
    fn test_bad_backoff_rejected() {
        let yaml = "id: x\nsteps:\n  - id: a\n    agent: echo\n    retryPolicy:\n      backoff: random\n";
        assert!(matches!(parse_workflow(yaml), Err(ParseError::Syntax(_))));
    }

    #[test]
    fn test_missing_steps_rejected() {
        assert!(matches!(parse_workflow("id: x\n"), Err(ParseError::Syntax(_))));
    }

    #[test]
    fn test_cycle_rejected_at_load() {
        let yaml = r#"
id: loop
steps:
  - id: a
    agent: echo
    dependsOn: b
  - id: b
    agent: echo
    dependsOn: a
"#;
        match parse_workflow(yaml) {
            Err(ParseError::Invalid(ValidationError::CyclicDependency(cycle))) => {
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("Expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_workflow_file_not_found() {
        let result = load_workflow("/nonexistent/path/workflow.yaml");
        assert!(matches!(result, Err(ParseError::Io { .. })));
    }

    #[test]
    fn test_load_workflow_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("bad.yaml");
        std::fs::write(&workflow_path, "this is not valid yaml: [[[").unwrap();

        assert!(load_workflow(&workflow_path).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("saved.yaml");

        let workflow = Workflow::from_steps(
            "saved",
            vec![Step::new("a", "echo"), Step::new("b", "echo").depends_on("a").parallel()],
        );

        save_workflow(&workflow, &workflow_path).unwrap();
        let loaded = load_workflow(&workflow_path).unwrap();

        assert_eq!(loaded, workflow);
    }
}
