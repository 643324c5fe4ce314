use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};
use crate::manifest::TargetSpec;

pub type TaskId = String;

/// One board + module pair a task is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub board: String,
    pub module: String,
}

impl TargetRef {
    pub fn key(&self) -> String {
        format!("{}-{}", self.board, self.module)
    }
}

impl From<&TargetSpec> for TargetRef {
    fn from(t: &TargetSpec) -> Self {
        Self {
            board: t.board.clone(),
            module: t.module.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub stage: String,
    pub phase: String,
    /// Registry key for the executor function; several task instances (one
    /// per target) share one kind.
    pub kind: &'static str,
    pub target: Option<TargetRef>,
    /// Dependencies, as task ids; a trailing `?` marks the dependency
    /// optional (ignored when no such task was planned).
    pub after: Vec<TaskId>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::config(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Order every task of `target` after `dep`. Used by the release driver
    /// to serialize targets strictly: no task of target N+1 may start before
    /// the final task of target N.
    pub fn add_dep_for_target(&mut self, target: &TargetRef, dep: &str) {
        for task in self.tasks.values_mut() {
            if task.target.as_ref() == Some(target) && !task.after.iter().any(|d| d == dep) {
                task.after.push(dep.to_string());
            }
        }
    }

    fn resolve_dep_maybe<'a>(&'a self, dep: &'a str) -> Result<Option<&'a str>> {
        let (dep, optional) = dep
            .strip_suffix('?')
            .map(|d| (d, true))
            .unwrap_or((dep, false));
        if self.tasks.contains_key(dep) {
            return Ok(Some(dep));
        }
        if optional {
            Ok(None)
        } else {
            Err(Error::config(format!("unknown dependency '{}'", dep)))
        }
    }

    /// Deterministic topological order over the `after` constraints.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (id, task) in &self.tasks {
            incoming.insert(id.as_str(), 0);
            outgoing.entry(id.as_str()).or_default();
            for dep in &task.after {
                let Some(dep_id) = self.resolve_dep_maybe(dep.as_str()).map_err(|e| {
                    Error::config(format!(
                        "task '{}' has invalid dependency '{}': {}",
                        id, dep, e
                    ))
                })?
                else {
                    continue;
                };

                outgoing.entry(dep_id).or_default().insert(id.as_str());
                *incoming.get_mut(id.as_str()).unwrap() += 1;
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&str> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            out.push(n);
            if let Some(children) = outgoing.get(n) {
                for &m in children {
                    let slot = incoming.get_mut(m).unwrap();
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::config(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }

        Ok(out
            .into_iter()
            .map(|id| self.tasks.get(id).expect("task must exist"))
            .collect())
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.stage, task.phase
            ));
        }
        for task in self.tasks.values() {
            for dep in &task.after {
                let Some(dep_id) = self.resolve_dep_maybe(dep.as_str()).map_err(|e| {
                    Error::config(format!(
                        "task '{}' has invalid dependency '{}': {}",
                        task.id, dep, e
                    ))
                })?
                else {
                    continue;
                };
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep_id, task.id));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str], target: Option<(&str, &str)>) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            stage: "test".into(),
            phase: "test".into(),
            kind: "test",
            target: target.map(|(b, m)| TargetRef {
                board: b.into(),
                module: m.into(),
            }),
            after: after.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn position(ordered: &[&Task], id: &str) -> usize {
        ordered
            .iter()
            .position(|t| t.id == id)
            .unwrap_or_else(|| panic!("task {id} missing from order"))
    }

    #[test]
    fn ordered_respects_after_and_ignores_missing_optional_deps() {
        let mut plan = Plan::default();
        plan.add(task("a", &[], None)).unwrap();
        plan.add(task("b", &["a", "nonexistent?"], None)).unwrap();
        plan.add(task("c", &["b"], None)).unwrap();

        let ordered = plan.ordered().expect("order");
        assert!(position(&ordered, "a") < position(&ordered, "b"));
        assert!(position(&ordered, "b") < position(&ordered, "c"));
    }

    #[test]
    fn missing_required_dep_is_an_error() {
        let mut plan = Plan::default();
        plan.add(task("a", &["nope"], None)).unwrap();
        assert!(plan.ordered().is_err());
    }

    #[test]
    fn cycle_is_reported() {
        let mut plan = Plan::default();
        plan.add(task("a", &["b"], None)).unwrap();
        plan.add(task("b", &["a"], None)).unwrap();
        let err = plan.ordered().expect_err("cycle");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn add_dep_for_target_serializes_only_that_targets_tasks() {
        let mut plan = Plan::default();
        plan.add(task("first.final", &[], Some(("red", "wp85")))).unwrap();
        plan.add(task("second.a", &[], Some(("yellow", "wp76xx")))).unwrap();
        plan.add(task("second.b", &["second.a"], Some(("yellow", "wp76xx"))))
            .unwrap();

        let second = TargetRef {
            board: "yellow".into(),
            module: "wp76xx".into(),
        };
        plan.add_dep_for_target(&second, "first.final");

        let ordered = plan.ordered().expect("order");
        assert!(position(&ordered, "first.final") < position(&ordered, "second.a"));
        assert!(position(&ordered, "first.final") < position(&ordered, "second.b"));
        assert!(plan.get("first.final").unwrap().after.is_empty());
    }
}
