//! Declarative pipeline definitions and their graph checks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use rowflow_common::{Result, RowflowError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    pub name: String,
    /// Report failure when any stage counted an error.
    #[serde(default = "default_true")]
    pub require_zero_errors: bool,
    pub stages: Vec<StageDef>,
    #[serde(default)]
    pub hops: Vec<HopDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    #[serde(default = "default_copies")]
    pub copies: u32,
    #[serde(default)]
    pub distribution: DistributionDef,
    #[serde(default)]
    pub error_handling: Option<ErrorHandlingDef>,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// How a stage spreads rows over its output channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionDef {
    #[default]
    RoundRobin,
    Copy,
    Keyed { fields: Vec<String> },
}

/// Error-row redirection and rejection limits of one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandlingDef {
    /// Stage receiving the error rows. Must be connected by a hop.
    pub target: String,
    /// Fail once more than this many rows were rejected.
    #[serde(default)]
    pub max_errors: Option<u64>,
    /// Fail once the rejected share of read rows exceeds this percentage.
    #[serde(default)]
    pub max_percent_errors: Option<u32>,
    /// Rows to read before the percentage limit applies.
    #[serde(default)]
    pub min_pct_rows: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopDef {
    pub from: String,
    pub to: String,
}

fn default_true() -> bool {
    true
}

fn default_copies() -> u32 {
    1
}

impl PipelineDef {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RowflowError::InvalidConfig(format!("pipeline definition: {e}")))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Check names, hops, error targets, and acyclicity.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(invalid(format!("pipeline '{}' has no stages", self.name)));
        }
        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                return Err(invalid("stage name must not be empty".to_string()));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage name '{}'", stage.name)));
            }
            if stage.copies == 0 {
                return Err(invalid(format!(
                    "stage '{}' must run at least one copy",
                    stage.name
                )));
            }
        }

        let mut seen_hops = HashSet::new();
        for hop in &self.hops {
            for end in [&hop.from, &hop.to] {
                if !names.contains(end.as_str()) {
                    return Err(invalid(format!(
                        "hop {} -> {} names unknown stage '{end}'",
                        hop.from, hop.to
                    )));
                }
            }
            if !seen_hops.insert((hop.from.as_str(), hop.to.as_str())) {
                return Err(invalid(format!("duplicate hop {} -> {}", hop.from, hop.to)));
            }
        }

        for stage in &self.stages {
            let Some(eh) = &stage.error_handling else {
                continue;
            };
            let connected = self
                .hops
                .iter()
                .any(|h| h.from == stage.name && h.to == eh.target);
            if !connected {
                return Err(invalid(format!(
                    "stage '{}' sends errors to '{}' without a hop to it",
                    stage.name, eh.target
                )));
            }
            if let Some(pct) = eh.max_percent_errors.filter(|&p| p > 100) {
                return Err(invalid(format!(
                    "stage '{}' max_percent_errors must be within 0..=100, got {pct}",
                    stage.name
                )));
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Stage indexes ordered so that every stage comes after all its upstream stages.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        let mut indegree = vec![0_usize; self.stages.len()];
        let mut children = vec![Vec::new(); self.stages.len()];
        for hop in &self.hops {
            let (Some(&from), Some(&to)) = (index.get(hop.from.as_str()), index.get(hop.to.as_str()))
            else {
                continue;
            };
            children[from].push(to);
            indegree[to] += 1;
        }

        let mut ready = (0..self.stages.len())
            .filter(|&i| indegree[i] == 0)
            .collect::<VecDeque<_>>();
        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &c in &children[i] {
                indegree[c] -= 1;
                if indegree[c] == 0 {
                    ready.push_back(c);
                }
            }
        }
        if order.len() != self.stages.len() {
            let cyclic = (0..self.stages.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.stages[i].name.as_str())
                .collect::<Vec<_>>();
            return Err(invalid(format!(
                "hop graph has a cycle through: {}",
                cyclic.join(", ")
            )));
        }
        Ok(order)
    }
}

fn invalid(msg: String) -> RowflowError {
    RowflowError::InvalidConfig(msg)
}

#[cfg(test)]
mod tests {
    use super::{DistributionDef, PipelineDef};

    fn parse(json: &str) -> PipelineDef {
        PipelineDef::from_json(json).expect("pipeline json")
    }

    #[test]
    fn parses_defaults_and_orders_stages() {
        let def = parse(
            r#"{
                "name": "p",
                "stages": [
                    {"name": "group", "type": "group_by"},
                    {"name": "src", "type": "values", "copies": 2,
                     "distribution": {"keyed": {"fields": ["k"]}}}
                ],
                "hops": [{"from": "src", "to": "group"}]
            }"#,
        );
        assert!(def.require_zero_errors);
        assert_eq!(def.stages[0].copies, 1);
        assert_eq!(
            def.stages[1].distribution,
            DistributionDef::Keyed {
                fields: vec!["k".to_string()]
            }
        );
        def.validate().expect("valid");
        assert_eq!(def.topological_order().expect("order"), vec![1, 0]);
    }

    #[test]
    fn rejects_cycles() {
        let def = parse(
            r#"{"name": "p",
                "stages": [{"name": "a", "type": "dummy"}, {"name": "b", "type": "dummy"}],
                "hops": [{"from": "a", "to": "b"}, {"from": "b", "to": "a"}]}"#,
        );
        let err = def.validate().expect_err("cycle");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_unknown_hop_and_duplicate_names() {
        let def = parse(
            r#"{"name": "p", "stages": [{"name": "a", "type": "dummy"}],
                "hops": [{"from": "a", "to": "zzz"}]}"#,
        );
        assert!(def.validate().is_err());

        let def = parse(
            r#"{"name": "p", "stages": [{"name": "a", "type": "dummy"},
                                        {"name": "a", "type": "dummy"}]}"#,
        );
        let err = def.validate().expect_err("duplicate");
        assert!(err.to_string().contains("duplicate stage name"));
    }

    #[test]
    fn error_target_needs_a_hop() {
        let def = parse(
            r#"{"name": "p",
                "stages": [
                    {"name": "a", "type": "dummy", "error_handling": {"target": "errs"}},
                    {"name": "errs", "type": "collect"}
                ]}"#,
        );
        let err = def.validate().expect_err("unconnected error target");
        assert!(err.to_string().contains("without a hop"));
    }
}
