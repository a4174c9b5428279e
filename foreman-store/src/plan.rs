//! Decomposition plan types and validation.
//!
//! A `ProjectPlan` is what the (external) PM decomposition produces: phases
//! in order, each carrying tasks whose dependencies reference other tasks in
//! the same plan by key. Validation runs before anything is written so the
//! transactional batch either persists the whole plan or nothing.

use foreman_core::{StoreError, TaskPriority};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};

/// One task of a decomposition plan. `key` is a plan-local handle used by
/// `depends_on` references; it never leaves the intake path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PlanTask {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Keys of tasks in this plan that must be done first
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub worker_prompt: Option<JsonValue>,
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub qa_prompt: Option<JsonValue>,
    #[serde(default)]
    pub branch_name: Option<String>,
}

/// One phase of a decomposition plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PlanPhase {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub branch_name: String,
    pub tasks: Vec<PlanTask>,
}

/// A full decomposition: ordered phases with their tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ProjectPlan {
    pub phases: Vec<PlanPhase>,
}

impl ProjectPlan {
    fn tasks(&self) -> impl Iterator<Item = &PlanTask> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }
}

/// Validate plan shape: unique keys and branch names, resolvable dependency
/// references, and an acyclic dependency graph.
pub fn validate_plan(plan: &ProjectPlan) -> Result<(), StoreError> {
    if plan.phases.is_empty() {
        return Err(StoreError::Constraint {
            reason: "plan has no phases".to_string(),
        });
    }

    let mut branch_names = HashSet::new();
    for phase in &plan.phases {
        if !branch_names.insert(phase.branch_name.as_str()) {
            return Err(StoreError::Constraint {
                reason: format!("duplicate phase branch name '{}'", phase.branch_name),
            });
        }
    }

    let mut keys = HashSet::new();
    for task in plan.tasks() {
        if !keys.insert(task.key.as_str()) {
            return Err(StoreError::Constraint {
                reason: format!("duplicate task key '{}'", task.key),
            });
        }
    }

    let deps: HashMap<&str, &Vec<String>> = plan
        .tasks()
        .map(|t| (t.key.as_str(), &t.depends_on))
        .collect();
    for task in plan.tasks() {
        for dep in &task.depends_on {
            if dep == &task.key {
                return Err(StoreError::Constraint {
                    reason: format!("task '{}' depends on itself", task.key),
                });
            }
            if !deps.contains_key(dep.as_str()) {
                return Err(StoreError::Constraint {
                    reason: format!("task '{}' depends on unknown key '{}'", task.key, dep),
                });
            }
        }
    }

    detect_cycle(&deps)
}

/// Depth-first cycle detection over plan-key dependency edges.
fn detect_cycle(deps: &HashMap<&str, &Vec<String>>) -> Result<(), StoreError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        key: &'a str,
        deps: &HashMap<&'a str, &'a Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), StoreError> {
        match marks.get(key) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(StoreError::Constraint {
                    reason: format!("dependency cycle through task '{}'", key),
                })
            }
            None => {}
        }
        marks.insert(key, Mark::Visiting);
        if let Some(children) = deps.get(key) {
            for child in children.iter() {
                visit(child.as_str(), deps, marks)?;
            }
        }
        marks.insert(key, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for key in deps.keys() {
        visit(key, deps, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(key: &str, deps: &[&str]) -> PlanTask {
        PlanTask {
            key: key.to_string(),
            title: key.to_string(),
            description: None,
            priority: TaskPriority::Medium,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            worker_prompt: None,
            qa_prompt: None,
            branch_name: None,
        }
    }

    fn plan(tasks: Vec<PlanTask>) -> ProjectPlan {
        ProjectPlan {
            phases: vec![PlanPhase {
                name: "phase-1".to_string(),
                description: None,
                branch_name: "phase/1".to_string(),
                tasks,
            }],
        }
    }

    #[test]
    fn test_valid_dag_passes() {
        let p = plan(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a", "b"]),
        ]);
        assert!(validate_plan(&p).is_ok());
    }

    #[test]
    fn test_two_task_cycle_rejected() {
        let p = plan(vec![task("a", &["b"]), task("b", &["a"])]);
        let err = validate_plan(&p).unwrap_err();
        assert!(matches!(err, StoreError::Constraint { .. }));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let p = plan(vec![task("a", &["a"])]);
        assert!(validate_plan(&p).is_err());
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let p = plan(vec![task("a", &["ghost"])]);
        assert!(validate_plan(&p).is_err());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let p = plan(vec![task("a", &[]), task("a", &[])]);
        assert!(validate_plan(&p).is_err());
    }

    #[test]
    fn test_duplicate_branch_rejected() {
        let p = ProjectPlan {
            phases: vec![
                PlanPhase {
                    name: "one".to_string(),
                    description: None,
                    branch_name: "phase/x".to_string(),
                    tasks: vec![task("a", &[])],
                },
                PlanPhase {
                    name: "two".to_string(),
                    description: None,
                    branch_name: "phase/x".to_string(),
                    tasks: vec![task("b", &[])],
                },
            ],
        };
        assert!(validate_plan(&p).is_err());
    }

    #[test]
    fn test_long_chain_is_not_a_cycle() {
        let tasks: Vec<PlanTask> = (0..50)
            .map(|i| {
                if i == 0 {
                    task("t0", &[])
                } else {
                    let dep = format!("t{}", i - 1);
                    PlanTask {
                        key: format!("t{}", i),
                        title: format!("t{}", i),
                        description: None,
                        priority: TaskPriority::Medium,
                        depends_on: vec![dep],
                        worker_prompt: None,
                        qa_prompt: None,
                        branch_name: None,
                    }
                }
            })
            .collect();
        assert!(validate_plan(&plan(tasks)).is_ok());
    }
}
