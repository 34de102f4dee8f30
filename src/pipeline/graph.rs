//! Stage graph declaration and validation
//!
//! A graph is declared once. Concurrency is derived from the dependency
//! edges; a cycle or dangling reference is a configuration error.

use crate::capability::{CapabilityRegistry, CapabilityRequest};
use crate::error::OrchestrationError;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

//
// ================= Bindings =================
//

/// Where an argument value comes from at dispatch time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ArgSource {
    Literal { value: Value },
    /// A key of the run's initial inputs
    Input { key: String },
    /// A completed dependency's output, optionally narrowed by a JSON pointer
    Stage {
        stage: String,
        #[serde(default)]
        pointer: Option<String>,
    },
    /// One field from every element of a dependency's array output
    Pluck { stage: String, field: String },
    /// The current element of a fan-out stage
    Item {
        #[serde(default)]
        pointer: Option<String>,
    },
}

impl ArgSource {
    pub fn literal(value: Value) -> Self {
        ArgSource::Literal { value }
    }

    pub fn input(key: &str) -> Self {
        ArgSource::Input {
            key: key.to_string(),
        }
    }

    pub fn stage(stage: &str) -> Self {
        ArgSource::Stage {
            stage: stage.to_string(),
            pointer: None,
        }
    }

    pub fn stage_field(stage: &str, pointer: &str) -> Self {
        ArgSource::Stage {
            stage: stage.to_string(),
            pointer: Some(pointer.to_string()),
        }
    }

    pub fn pluck(stage: &str, field: &str) -> Self {
        ArgSource::Pluck {
            stage: stage.to_string(),
            field: field.to_string(),
        }
    }

    pub fn item() -> Self {
        ArgSource::Item { pointer: None }
    }

    pub fn item_field(pointer: &str) -> Self {
        ArgSource::Item {
            pointer: Some(pointer.to_string()),
        }
    }

    fn referenced_stage(&self) -> Option<&str> {
        match self {
            ArgSource::Stage { stage, .. } | ArgSource::Pluck { stage, .. } => Some(stage.as_str()),
            _ => None,
        }
    }

    pub(crate) fn resolve(&self, scope: &ResolutionScope<'_>, capability: &str) -> Result<Value> {
        let mismatch = |reason: String| OrchestrationError::ArgumentMismatch {
            capability: capability.to_string(),
            reason,
        };

        match self {
            ArgSource::Literal { value } => Ok(value.clone()),
            ArgSource::Input { key } => scope
                .inputs
                .get(key)
                .cloned()
                .ok_or_else(|| OrchestrationError::Configuration(format!("missing run input '{}'", key))),
            ArgSource::Stage { stage, pointer } => {
                let output = scope
                    .output(stage)
                    .ok_or_else(|| mismatch(format!("output of '{}' is not available", stage)))?;
                match pointer {
                    None => Ok(output.clone()),
                    Some(p) => output
                        .pointer(p)
                        .cloned()
                        .ok_or_else(|| mismatch(format!("output of '{}' has no field '{}'", stage, p))),
                }
            }
            ArgSource::Pluck { stage, field } => {
                let output = scope
                    .output(stage)
                    .ok_or_else(|| mismatch(format!("output of '{}' is not available", stage)))?;
                let elements = output
                    .as_array()
                    .ok_or_else(|| mismatch(format!("output of '{}' is not an array", stage)))?;
                elements
                    .iter()
                    .map(|element| {
                        element.get(field).cloned().ok_or_else(|| {
                            mismatch(format!("element of '{}' has no field '{}'", stage, field))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Array)
            }
            ArgSource::Item { pointer } => {
                let item = scope
                    .item
                    .ok_or_else(|| mismatch("item binding outside a fan-out stage".to_string()))?;
                match pointer {
                    None => Ok(item.clone()),
                    Some(p) => item
                        .pointer(p)
                        .cloned()
                        .ok_or_else(|| mismatch(format!("fan-out item has no field '{}'", p))),
                }
            }
        }
    }
}

pub(crate) struct ResolutionScope<'a> {
    pub inputs: &'a BTreeMap<String, Value>,
    pub outputs: &'a BTreeMap<String, Value>,
    pub item: Option<&'a Value>,
}

impl<'a> ResolutionScope<'a> {
    fn output(&self, stage: &str) -> Option<&'a Value> {
        self.outputs.get(stage)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArgBinding {
    pub name: String,
    pub source: ArgSource,
}

//
// ================= Stages =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyClass {
    /// May run alongside any other ready stage
    Independent,
    /// Runs alone; no new dispatch until it completes
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageNode {
    pub name: String,
    pub capability: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub args: Vec<ArgBinding>,
    /// Invoke once per element of this array-valued source
    #[serde(default)]
    pub fan_out: Option<ArgSource>,
    pub concurrency: ConcurrencyClass,
}

impl StageNode {
    pub fn new(name: &str, capability: &str) -> Self {
        Self {
            name: name.to_string(),
            capability: capability.to_string(),
            depends_on: Vec::new(),
            args: Vec::new(),
            fan_out: None,
            concurrency: ConcurrencyClass::Independent,
        }
    }

    pub fn depends_on(mut self, stages: &[&str]) -> Self {
        self.depends_on.extend(stages.iter().map(|s| s.to_string()));
        self
    }

    pub fn arg(mut self, name: &str, source: ArgSource) -> Self {
        self.args.push(ArgBinding {
            name: name.to_string(),
            source,
        });
        self
    }

    pub fn for_each(mut self, source: ArgSource) -> Self {
        self.fan_out = Some(source);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.concurrency = ConcurrencyClass::Sequential;
        self
    }

    pub fn is_sequential(&self) -> bool {
        self.concurrency == ConcurrencyClass::Sequential
    }

    pub(crate) fn build_request(&self, scope: &ResolutionScope<'_>) -> Result<CapabilityRequest> {
        self.args
            .iter()
            .try_fold(CapabilityRequest::new(&self.capability), |request, binding| {
                let value = binding.source.resolve(scope, &self.capability)?;
                Ok(request.arg(&binding.name, value))
            })
    }
}

/// Which stage outputs feed each section of the final report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportLayout {
    pub advice: String,
    pub strategy: String,
    pub allocation: String,
    pub risk: String,
    pub trades: String,
}

impl ReportLayout {
    fn stages(&self) -> [&str; 5] {
        [
            self.advice.as_str(),
            self.strategy.as_str(),
            self.allocation.as_str(),
            self.risk.as_str(),
            self.trades.as_str(),
        ]
    }
}

//
// ================= Graph =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageGraph {
    pub stages: Vec<StageNode>,
    #[serde(default)]
    pub report: Option<ReportLayout>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, node: StageNode) -> Self {
        self.stages.push(node);
        self
    }

    pub fn with_report(mut self, layout: ReportLayout) -> Self {
        self.report = Some(layout);
        self
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Structural checks plus capability lookups; runs before any stage starts
    pub fn validate(&self, registry: &CapabilityRegistry) -> Result<()> {
        let config = |msg: String| OrchestrationError::Configuration(msg);

        if self.stages.is_empty() {
            return Err(config("graph declares no stages".to_string()));
        }

        let mut seen = BTreeSet::new();
        for node in &self.stages {
            if node.name.trim().is_empty() {
                return Err(config("stage name must not be empty".to_string()));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(config(format!("stage '{}' declared twice", node.name)));
            }
        }

        for node in &self.stages {
            if !registry.contains(&node.capability) {
                return Err(config(format!(
                    "stage '{}' invokes unregistered capability '{}'",
                    node.name, node.capability
                )));
            }

            for dep in &node.depends_on {
                if dep == &node.name {
                    return Err(config(format!("stage '{}' depends on itself", node.name)));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(config(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        node.name, dep
                    )));
                }
            }

            let sources = node
                .args
                .iter()
                .map(|b| &b.source)
                .chain(node.fan_out.iter());
            for source in sources {
                if let Some(stage) = source.referenced_stage() {
                    if !node.depends_on.iter().any(|d| d == stage) {
                        return Err(config(format!(
                            "stage '{}' reads '{}' without depending on it",
                            node.name, stage
                        )));
                    }
                }
            }

            if matches!(node.fan_out, Some(ArgSource::Item { .. })) {
                return Err(config(format!(
                    "stage '{}' cannot fan out over its own item",
                    node.name
                )));
            }
            if node.fan_out.is_none()
                && node
                    .args
                    .iter()
                    .any(|b| matches!(b.source, ArgSource::Item { .. }))
            {
                return Err(config(format!(
                    "stage '{}' binds an item without fanning out",
                    node.name
                )));
            }
        }

        if let Some(layout) = &self.report {
            for stage in layout.stages() {
                if !seen.contains(stage) {
                    return Err(config(format!("report reads unknown stage '{}'", stage)));
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Kahn ordering; ties keep declaration order
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut remaining: Vec<usize> = self.stages.iter().map(|s| s.depends_on.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.stages.len()];
        for (i, node) in self.stages.iter().enumerate() {
            for dep in &node.depends_on {
                if let Some(&d) = index.get(dep.as_str()) {
                    dependents[d].push(i);
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..self.stages.len()).filter(|i| remaining[*i] == 0).collect();
        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                remaining[next] -= 1;
                if remaining[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.stages.len() {
            let stuck: Vec<&str> = (0..self.stages.len())
                .filter(|i| remaining[*i] > 0)
                .map(|i| self.stages[i].name.as_str())
                .collect();
            return Err(OrchestrationError::Configuration(format!(
                "dependency cycle among stages: {}",
                stuck.join(", ")
            )));
        }

        Ok(order)
    }

    /// Largest number of independent stages sharing one dependency depth
    pub fn widest_fan(&self) -> usize {
        let Ok(order) = self.topological_order() else {
            return 1;
        };

        let mut depth = vec![0usize; self.stages.len()];
        for &i in &order {
            depth[i] = self.stages[i]
                .depends_on
                .iter()
                .filter_map(|d| self.index_of(d))
                .map(|d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut per_depth: BTreeMap<usize, usize> = BTreeMap::new();
        for (i, node) in self.stages.iter().enumerate() {
            if !node.is_sequential() {
                *per_depth.entry(depth[i]).or_insert(0) += 1;
            }
        }

        per_depth.values().copied().max().unwrap_or(1).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{FnCapability, ValueKind};
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(
                "noop",
                Arc::new(FnCapability::new(|_: &CapabilityRequest| Ok(json!({})))),
                vec![],
                ValueKind::Any,
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_cycle_is_configuration_error() {
        let graph = StageGraph::new()
            .stage(StageNode::new("a", "noop").depends_on(&["c"]))
            .stage(StageNode::new("b", "noop").depends_on(&["a"]))
            .stage(StageNode::new("c", "noop").depends_on(&["b"]));

        match graph.validate(&registry()) {
            Err(OrchestrationError::Configuration(msg)) => assert!(msg.contains("cycle")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency_and_capability() {
        let dangling = StageGraph::new().stage(StageNode::new("a", "noop").depends_on(&["ghost"]));
        let unregistered = StageGraph::new().stage(StageNode::new("a", "nothing"));

        for graph in [dangling, unregistered] {
            assert!(matches!(
                graph.validate(&registry()),
                Err(OrchestrationError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_binding_must_follow_dependency_edge() {
        let graph = StageGraph::new()
            .stage(StageNode::new("a", "noop"))
            .stage(StageNode::new("b", "noop").arg("x", ArgSource::stage("a")));

        assert!(matches!(
            graph.validate(&registry()),
            Err(OrchestrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_widest_fan_counts_independent_stages_per_depth() {
        let graph = StageGraph::new()
            .stage(StageNode::new("root", "noop"))
            .stage(StageNode::new("a", "noop").depends_on(&["root"]))
            .stage(StageNode::new("b", "noop").depends_on(&["root"]))
            .stage(StageNode::new("c", "noop").depends_on(&["root"]))
            .stage(StageNode::new("s", "noop").depends_on(&["root"]).sequential())
            .stage(StageNode::new("join", "noop").depends_on(&["a", "b"]));

        assert!(graph.validate(&registry()).is_ok());
        assert_eq!(graph.widest_fan(), 3);
        assert_eq!(graph.topological_order().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_resolve_pluck_and_pointer() {
        let inputs = BTreeMap::new();
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "news".to_string(),
            json!([{ "name": "a", "text": "up" }, { "name": "b", "text": "down" }]),
        );
        outputs.insert("profile".to_string(), json!({ "risk_tolerance": "low" }));
        let scope = ResolutionScope {
            inputs: &inputs,
            outputs: &outputs,
            item: None,
        };

        let texts = ArgSource::pluck("news", "text").resolve(&scope, "sentiment").unwrap();
        assert_eq!(texts, json!(["up", "down"]));

        let tolerance = ArgSource::stage_field("profile", "/risk_tolerance")
            .resolve(&scope, "strategy")
            .unwrap();
        assert_eq!(tolerance, json!("low"));

        let missing = ArgSource::stage_field("profile", "/age").resolve(&scope, "strategy");
        assert!(matches!(
            missing,
            Err(OrchestrationError::ArgumentMismatch { .. })
        ));
    }
}
