//! On-disk shape of `.ralph/prd.json` and its structural checks.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::state_machine::{RunSession, Status, WorkItem};

/// Project metadata rendered into agent prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub name: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_language() -> String {
    "unknown".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

/// Settings shared by every item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Verification commands used when an item has none of its own.
    #[serde(default)]
    pub verify: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrdDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectMeta,
    #[serde(default, rename = "global", alias = "global_config")]
    pub global: GlobalConfig,
    #[serde(default)]
    pub items: Vec<WorkItem>,
    #[serde(default)]
    pub sessions: Vec<RunSession>,
}

fn default_version() -> u32 {
    1
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Active,
    Finished,
}

impl PrdDocument {
    pub fn new(name: impl Into<String>, items: Vec<WorkItem>) -> Self {
        Self {
            version: default_version(),
            project: ProjectMeta {
                name: name.into(),
                language: default_language(),
                default_branch: default_branch(),
            },
            global: GlobalConfig::default(),
            items,
            sessions: Vec::new(),
        }
    }

    /// Check ids and the dependency graph. Returns the reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for item in &self.items {
            if item.id.trim().is_empty() {
                return Err("item with an empty id".to_string());
            }
            if !seen.insert(item.id.as_str()) {
                return Err(format!("duplicate item id {}", item.id));
            }
        }

        for item in &self.items {
            for dep in &item.depends_on {
                if dep == &item.id {
                    return Err(format!("item {} depends on itself", item.id));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(format!("item {} depends on unknown item {dep}", item.id));
                }
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(format!("dependency cycle {}", cycle.join(" -> ")));
        }

        let open_sessions = self.sessions.iter().filter(|s| s.is_open()).count();
        if open_sessions > 1 {
            return Err(format!("{open_sessions} sessions are marked as running"));
        }

        Ok(())
    }

    /// Ids of `item`'s dependencies that are not `Done`, in declaration order.
    pub fn unmet_dependencies(&self, item: &WorkItem) -> Vec<String> {
        let statuses: HashMap<&str, Status> = self
            .items
            .iter()
            .map(|i| (i.id.as_str(), i.state()))
            .collect();
        item.depends_on
            .iter()
            .filter(|dep| statuses.get(dep.as_str()) != Some(&Status::Done))
            .cloned()
            .collect()
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        let index: HashMap<&str, usize> = self
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.id.as_str(), i))
            .collect();
        let mut marks = vec![Mark::Unvisited; self.items.len()];
        let mut stack = Vec::new();

        (0..self.items.len()).find_map(|i| self.visit(i, &index, &mut marks, &mut stack))
    }

    fn visit(
        &self,
        i: usize,
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        match marks[i] {
            Mark::Finished => return None,
            Mark::Active => {
                let start = stack.iter().position(|&j| j == i).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..]
                    .iter()
                    .map(|&j| self.items[j].id.clone())
                    .collect();
                cycle.push(self.items[i].id.clone());
                return Some(cycle);
            }
            Mark::Unvisited => {}
        }

        marks[i] = Mark::Active;
        stack.push(i);
        for dep in &self.items[i].depends_on {
            if let Some(&j) = index.get(dep.as_str())
                && let Some(cycle) = self.visit(j, index, marks, stack)
            {
                return Some(cycle);
            }
        }
        stack.pop();
        marks[i] = Mark::Finished;
        None
    }
}
