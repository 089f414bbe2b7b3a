//! DAG builder: turns pipeline steps into container nodes with ordered
//! upstream edges.
//!
//! Each step is a linear chain: its first operation reads the step input (a
//! dataset or another step's output), every later operation reads the one
//! before it. Operations with named inputs (equijoin) read other steps by
//! name instead. A step may only read datasets and steps declared before
//! it, so declaration order is dependency order.

use crate::EngineError;
use df_core::pipeline::{OperationSpec, PipelineConfig, StepOperation, StepSpec};
use df_ops::{Operation, OperationRegistry, RegistryError};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Index of a node inside its [`Dag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub role: Option<String>,
    pub node: NodeId,
}

/// Container around one operation and its dependencies.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub id: NodeId,
    /// `step/operation`, or `dataset:<name>` for source nodes.
    pub name: String,
    pub step: Option<String>,
    /// Effective spec: default model and overrides already applied.
    pub spec: OperationSpec,
    pub op: Arc<dyn Operation>,
    pub upstream: Vec<Edge>,
    /// Dataset read by a source node.
    pub source: Option<String>,
}

impl DagNode {
    pub fn is_source(&self) -> bool {
        self.source.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Dag {
    nodes: Vec<DagNode>,
    by_name: HashMap<String, NodeId>,
    step_outputs: HashMap<String, NodeId>,
    terminal: NodeId,
}

impl Dag {
    /// Build the graph for `config`, resolving every operation through `registry`.
    ///
    /// Fails before anything executes on undefined references, cycles,
    /// unknown operation types or invalid operation configs.
    pub fn build(config: &PipelineConfig, registry: &OperationRegistry) -> Result<Self, EngineError> {
        let steps = &config.pipeline.steps;
        if steps.is_empty() {
            return Err(EngineError::InvalidPipeline("pipeline has no steps".into()));
        }
        let mut step_index: HashMap<&str, usize> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if step_index.insert(step.name.as_str(), i).is_some() {
                return Err(EngineError::InvalidPipeline(format!("duplicate step name '{}'", step.name)));
            }
            if step.operations.is_empty() {
                return Err(EngineError::InvalidPipeline(format!("step '{}' has no operations", step.name)));
            }
        }

        check_references(config, &step_index)?;

        let mut builder = Builder {
            config,
            registry,
            nodes: Vec::new(),
            by_name: HashMap::new(),
            step_outputs: HashMap::new(),
            dataset_nodes: HashMap::new(),
        };
        for step in steps {
            builder.add_step(step)?;
        }

        let last = &steps[steps.len() - 1];
        let terminal = builder
            .step_outputs
            .get(&last.name)
            .copied()
            .ok_or_else(|| EngineError::InvalidPipeline(format!("step '{}' produced no node", last.name)))?;

        tracing::debug!(
            nodes = builder.nodes.len(),
            terminal = %builder.nodes[terminal.0].name,
            "dag built"
        );
        Ok(Self {
            nodes: builder.nodes,
            by_name: builder.by_name,
            step_outputs: builder.step_outputs,
            terminal,
        })
    }

    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &DagNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// Last operation of the last declared step.
    pub fn terminal(&self) -> NodeId {
        self.terminal
    }

    /// Last operation of `step`.
    pub fn step_output(&self, step: &str) -> Option<NodeId> {
        self.step_outputs.get(step).copied()
    }

    /// Nodes that read `id` directly.
    pub fn downstream(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.upstream.iter().any(|e| e.node == id))
            .map(|n| n.id)
            .collect()
    }

    /// `id` and everything it transitively depends on, in dependency order.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if seen.insert(n) {
                stack.extend(self.nodes[n.0].upstream.iter().map(|e| e.node));
            }
        }
        // NodeIds are assigned in dependency order.
        seen.into_iter().collect()
    }
}

/// Every step input and named input must be a dataset or a step declared
/// earlier. A step reading itself is a cycle; any other name is unknown.
fn check_references(config: &PipelineConfig, step_index: &HashMap<&str, usize>) -> Result<(), EngineError> {
    for (i, step) in config.pipeline.steps.iter().enumerate() {
        let inputs = step.operations.iter().flat_map(|op| op.inputs().into_iter().map(|(_, r)| r));
        for reference in step.input.as_deref().into_iter().chain(inputs) {
            match step_index.get(reference) {
                Some(&j) if j < i => continue,
                _ if config.datasets.contains_key(reference) => continue,
                Some(&j) if j == i => {
                    return Err(EngineError::CyclicGraph {
                        cycle: vec![step.name.clone(), step.name.clone()],
                    })
                }
                _ => {
                    return Err(EngineError::UnknownStepReference {
                        step: step.name.clone(),
                        reference: reference.to_string(),
                    })
                }
            }
        }
    }
    Ok(())
}

struct Builder<'a> {
    config: &'a PipelineConfig,
    registry: &'a OperationRegistry,
    nodes: Vec<DagNode>,
    by_name: HashMap<String, NodeId>,
    step_outputs: HashMap<String, NodeId>,
    dataset_nodes: HashMap<String, NodeId>,
}

impl Builder<'_> {
    fn push(&mut self, mut node: DagNode) -> Result<NodeId, EngineError> {
        if self.by_name.contains_key(&node.name) {
            return Err(EngineError::InvalidPipeline(format!("duplicate node '{}'", node.name)));
        }
        let id = NodeId(self.nodes.len());
        node.id = id;
        self.by_name.insert(node.name.clone(), id);
        self.nodes.push(node);
        Ok(id)
    }

    fn resolve_op(&self, spec: &OperationSpec) -> Result<Arc<dyn Operation>, EngineError> {
        self.registry.resolve_spec(spec).map_err(|err| match err {
            RegistryError::UnknownOperationType(op_type) => EngineError::UnknownOperationType {
                operation: spec.name.clone(),
                op_type,
            },
            other => other.into(),
        })
    }

    /// One shared source node per dataset.
    fn dataset_node(&mut self, dataset: &str) -> Result<NodeId, EngineError> {
        if let Some(&id) = self.dataset_nodes.get(dataset) {
            return Ok(id);
        }
        let spec = OperationSpec::new(format!("dataset:{dataset}"), "scan").with_param("dataset", dataset);
        let op = self.resolve_op(&spec)?;
        let id = self.push(DagNode {
            id: NodeId(0),
            name: spec.name.clone(),
            step: None,
            spec,
            op,
            upstream: Vec::new(),
            source: Some(dataset.to_string()),
        })?;
        self.dataset_nodes.insert(dataset.to_string(), id);
        Ok(id)
    }

    fn target_node(&mut self, reference: &str) -> Result<NodeId, EngineError> {
        if let Some(&id) = self.step_outputs.get(reference) {
            return Ok(id);
        }
        if self.config.datasets.contains_key(reference) {
            return self.dataset_node(reference);
        }
        // References are checked before building, so an earlier step is built.
        Err(EngineError::InvalidPipeline(format!("step '{reference}' is not built yet")))
    }

    /// Default model for prompt-bearing specs, then per-operation overrides.
    fn effective_spec(&self, spec: &OperationSpec) -> OperationSpec {
        let mut spec = spec.clone();
        if let Some(model) = self.config.settings.model_overrides.get(&spec.name) {
            spec.params.insert("model".into(), model.clone().into());
        } else if spec.param("prompt").is_some() && spec.param("model").is_none() {
            if let Some(model) = &self.config.default_model {
                spec.params.insert("model".into(), model.clone().into());
            }
        }
        spec
    }

    fn add_step(&mut self, step: &StepSpec) -> Result<(), EngineError> {
        let mut previous = match step.input.as_deref() {
            Some(input) => Some(self.target_node(input)?),
            None => None,
        };

        for entry in &step.operations {
            let op_name = entry.name();
            let declared = self.config.operation(op_name).ok_or_else(|| {
                EngineError::InvalidPipeline(format!("step '{}' uses undefined operation '{op_name}'", step.name))
            })?;
            let spec = self.effective_spec(declared);
            let op = self.resolve_op(&spec)?;

            let mut source = None;
            let upstream = match entry {
                StepOperation::WithInputs(_) => self.named_inputs(&spec, op.as_ref(), &entry.inputs())?,
                StepOperation::Name(_) => {
                    if !op.input_roles().is_empty() {
                        return Err(EngineError::InvalidOperationConfig {
                            operation: spec.name.clone(),
                            fields: op.input_roles().iter().map(|r| r.to_string()).collect(),
                            message: "operation needs named inputs".into(),
                        });
                    }
                    match previous {
                        Some(node) => vec![Edge { role: None, node }],
                        None if spec.op_type == "scan" => {
                            let dataset = spec.param_str("dataset").unwrap_or_default().to_string();
                            if !self.config.datasets.contains_key(&dataset) {
                                return Err(EngineError::UnknownStepReference {
                                    step: step.name.clone(),
                                    reference: dataset,
                                });
                            }
                            source = Some(dataset);
                            Vec::new()
                        }
                        None => {
                            return Err(EngineError::InvalidPipeline(format!(
                                "step '{}' has no input for its first operation '{op_name}'",
                                step.name
                            )))
                        }
                    }
                }
            };

            let id = self.push(DagNode {
                id: NodeId(0),
                name: format!("{}/{}", step.name, spec.name),
                step: Some(step.name.clone()),
                spec,
                op,
                upstream,
                source,
            })?;
            previous = Some(id);
        }

        if let Some(out) = previous {
            self.step_outputs.insert(step.name.clone(), out);
        }
        Ok(())
    }

    /// Edges for an operation with named inputs, in the operation's role order.
    fn named_inputs(
        &mut self,
        spec: &OperationSpec,
        op: &dyn Operation,
        inputs: &[(&str, &str)],
    ) -> Result<Vec<Edge>, EngineError> {
        let roles = op.input_roles();
        let given: BTreeSet<&str> = inputs.iter().map(|(role, _)| *role).collect();
        let expected: BTreeSet<&str> = roles.iter().copied().collect();
        if given != expected {
            let mut fields: Vec<String> = expected.symmetric_difference(&given).map(|r| r.to_string()).collect();
            fields.sort();
            return Err(EngineError::InvalidOperationConfig {
                operation: spec.name.clone(),
                fields,
                message: format!("named inputs must be exactly: {}", roles.join(", ")),
            });
        }
        let mut edges = Vec::with_capacity(roles.len());
        for role in roles {
            let reference = inputs
                .iter()
                .find(|(r, _)| r == role)
                .map(|(_, step)| *step)
                .unwrap_or_default();
            edges.push(Edge {
                role: Some(role.to_string()),
                node: self.target_node(reference)?,
            });
        }
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> PipelineConfig {
        PipelineConfig::from_value(value).unwrap()
    }

    fn registry() -> OperationRegistry {
        OperationRegistry::with_builtins()
    }

    fn linear() -> PipelineConfig {
        config(json!({
            "default_model": "gpt-4o-mini",
            "datasets": {"docs": {"type": "memory", "records": [{"text": "a"}]}},
            "operations": [
                {"name": "upper", "type": "uppercase"},
                {"name": "summarize", "type": "map", "prompt": "Summarize {{ input.text }}",
                 "output": {"schema": {"summary": "string"}}}
            ],
            "pipeline": {"steps": [
                {"name": "clean", "input": "docs", "operations": ["upper"]},
                {"name": "extract", "input": "clean", "operations": ["summarize"]}
            ]}
        }))
    }

    #[test]
    fn linear_chain_wires_steps() {
        let dag = Dag::build(&linear(), &registry()).unwrap();
        let names: Vec<&str> = dag.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["dataset:docs", "clean/upper", "extract/summarize"]);
        assert_eq!(dag.node(dag.terminal()).name, "extract/summarize");
        let upper = dag.find("clean/upper").unwrap();
        assert_eq!(dag.node(dag.terminal()).upstream, vec![Edge { role: None, node: upper }]);
        assert_eq!(dag.downstream(upper), vec![dag.terminal()]);
        assert_eq!(dag.ancestors(dag.terminal()).len(), 3);
    }

    #[test]
    fn default_model_only_for_prompted_specs() {
        let dag = Dag::build(&linear(), &registry()).unwrap();
        let map = dag.node(dag.terminal());
        assert_eq!(map.spec.param_str("model"), Some("gpt-4o-mini"));
        let upper = dag.node(dag.find("clean/upper").unwrap());
        assert!(upper.spec.param("model").is_none());
    }

    #[test]
    fn model_override_wins() {
        let mut cfg = linear();
        cfg.settings.model_overrides.insert("summarize".into(), "gpt-4o".into());
        let dag = Dag::build(&cfg, &registry()).unwrap();
        assert_eq!(dag.node(dag.terminal()).spec.param_str("model"), Some("gpt-4o"));
    }

    #[test]
    fn undefined_reference_fails() {
        let cfg = config(json!({
            "datasets": {"docs": {"type": "memory", "records": []}},
            "operations": [{"name": "upper", "type": "uppercase"}],
            "pipeline": {"steps": [{"name": "a", "input": "nope", "operations": ["upper"]}]}
        }));
        assert_eq!(
            Dag::build(&cfg, &registry()).unwrap_err(),
            EngineError::UnknownStepReference { step: "a".into(), reference: "nope".into() }
        );
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let cfg = config(json!({
            "datasets": {},
            "operations": [{"name": "upper", "type": "uppercase"}],
            "pipeline": {"steps": [{"name": "a", "input": "a", "operations": ["upper"]}]}
        }));
        assert_eq!(
            Dag::build(&cfg, &registry()).unwrap_err(),
            EngineError::CyclicGraph { cycle: vec!["a".into(), "a".into()] }
        );
    }

    #[test]
    fn mutual_reference_is_unknown() {
        let cfg = config(json!({
            "datasets": {},
            "operations": [{"name": "upper", "type": "uppercase"}],
            "pipeline": {"steps": [
                {"name": "a", "input": "b", "operations": ["upper"]},
                {"name": "b", "input": "a", "operations": ["upper"]}
            ]}
        }));
        assert_eq!(
            Dag::build(&cfg, &registry()).unwrap_err(),
            EngineError::UnknownStepReference { step: "a".into(), reference: "b".into() }
        );
    }

    #[test]
    fn forward_reference_is_rejected() {
        let cfg = config(json!({
            "datasets": {"docs": {"type": "memory", "records": []}},
            "operations": [{"name": "upper", "type": "uppercase"}],
            "pipeline": {"steps": [
                {"name": "late", "input": "early", "operations": ["upper"]},
                {"name": "early", "input": "docs", "operations": ["upper"]}
            ]}
        }));
        assert_eq!(
            Dag::build(&cfg, &registry()).unwrap_err(),
            EngineError::UnknownStepReference { step: "late".into(), reference: "early".into() }
        );
    }

    #[test]
    fn forward_named_input_is_rejected() {
        let cfg = config(json!({
            "datasets": {"docs": {"type": "memory", "records": []}},
            "operations": [
                {"name": "upper", "type": "uppercase"},
                {"name": "join", "type": "equijoin", "left_key": "a", "right_key": "b"}
            ],
            "pipeline": {"steps": [
                {"name": "joined", "operations": [{"join": {"left": "docs", "right": "later"}}]},
                {"name": "later", "input": "docs", "operations": ["upper"]}
            ]}
        }));
        assert_eq!(
            Dag::build(&cfg, &registry()).unwrap_err(),
            EngineError::UnknownStepReference { step: "joined".into(), reference: "later".into() }
        );
    }

    #[test]
    fn unknown_type_names_operation() {
        let cfg = config(json!({
            "datasets": {"docs": {"type": "memory", "records": []}},
            "operations": [{"name": "x", "type": "teleport"}],
            "pipeline": {"steps": [{"name": "a", "input": "docs", "operations": ["x"]}]}
        }));
        assert_eq!(
            Dag::build(&cfg, &registry()).unwrap_err(),
            EngineError::UnknownOperationType { operation: "x".into(), op_type: "teleport".into() }
        );
    }

    #[test]
    fn equijoin_reads_named_steps_in_role_order() {
        let cfg = config(json!({
            "datasets": {
                "invoices": {"type": "memory", "records": []},
                "vendors": {"type": "memory", "records": []}
            },
            "operations": [
                {"name": "upper", "type": "uppercase"},
                {"name": "join", "type": "equijoin", "left_key": "vendor", "right_key": "name"}
            ],
            "pipeline": {"steps": [
                {"name": "inv", "input": "invoices", "operations": ["upper"]},
                {"name": "joined", "operations": [{"join": {"right": "vendors", "left": "inv"}}]}
            ]}
        }));
        let dag = Dag::build(&cfg, &registry()).unwrap();
        let join = dag.node(dag.terminal());
        assert_eq!(join.upstream.len(), 2);
        assert_eq!(join.upstream[0].role.as_deref(), Some("left"));
        assert_eq!(dag.node(join.upstream[0].node).name, "inv/upper");
        assert_eq!(dag.node(join.upstream[1].node).name, "dataset:vendors");
    }

    #[test]
    fn equijoin_without_roles_is_invalid() {
        let cfg = config(json!({
            "datasets": {"d": {"type": "memory", "records": []}},
            "operations": [{"name": "join", "type": "equijoin", "left_key": "a", "right_key": "b"}],
            "pipeline": {"steps": [{"name": "s", "input": "d", "operations": [{"join": {"left": "d"}}]}]}
        }));
        match Dag::build(&cfg, &registry()).unwrap_err() {
            EngineError::InvalidOperationConfig { operation, fields, .. } => {
                assert_eq!(operation, "join");
                assert_eq!(fields, vec!["right"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn shared_dataset_has_one_source_node() {
        let cfg = config(json!({
            "datasets": {"docs": {"type": "memory", "records": []}},
            "operations": [{"name": "upper", "type": "uppercase"}],
            "pipeline": {"steps": [
                {"name": "a", "input": "docs", "operations": ["upper"]},
                {"name": "b", "input": "docs", "operations": ["upper"]}
            ]}
        }));
        let dag = Dag::build(&cfg, &registry()).unwrap();
        assert_eq!(dag.nodes().iter().filter(|n| n.is_source()).count(), 1);
    }

    #[test]
    fn empty_and_duplicate_steps_rejected() {
        let empty = config(json!({"datasets": {}, "operations": [], "pipeline": {"steps": []}}));
        assert!(matches!(Dag::build(&empty, &registry()), Err(EngineError::InvalidPipeline(_))));

        let dup = config(json!({
            "datasets": {"d": {"type": "memory", "records": []}},
            "operations": [{"name": "upper", "type": "uppercase"}],
            "pipeline": {"steps": [
                {"name": "a", "input": "d", "operations": ["upper"]},
                {"name": "a", "input": "d", "operations": ["upper"]}
            ]}
        }));
        assert!(matches!(Dag::build(&dup, &registry()), Err(EngineError::InvalidPipeline(_))));
    }
}
