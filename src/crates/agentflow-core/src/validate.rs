//! Semantic validation of loaded workflow configs.
//!
//! Runs after structural load and collects every issue it finds in one
//! pass, so a user never has to re-run to discover the next error. Checks
//! cover edge endpoints, per-edge-kind invariants, reachability and
//! termination, output/state alignment, template placeholders, tool names
//! and the schema-version gate.

use crate::config::{
    ConditionalEdge, EdgeConfig, LoopEdge, NodeConfig, OutputSchemaConfig, ParallelEdge,
    WorkflowConfig,
};
use crate::expr::Expr;
use crate::graph::{END, START};
use crate::state::Reducer;
use crate::template;
use crate::types::FieldType;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;
use tooling::{nearest_name, ToolRegistry};

/// What kind of semantic defect an issue describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    DuplicateNode,
    UnknownNode,
    EdgeStructure,
    Unreachable,
    NoPathToEnd,
    Cycle,
    UnknownStateField,
    TypeMismatch,
    OutputSchema,
    Template,
    Condition,
    UnknownTool,
    ParallelWrite,
    SchemaVersion,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IssueKind::DuplicateNode => "duplicate_node",
            IssueKind::UnknownNode => "unknown_node",
            IssueKind::EdgeStructure => "edge_structure",
            IssueKind::Unreachable => "unreachable",
            IssueKind::NoPathToEnd => "no_path_to_end",
            IssueKind::Cycle => "cycle",
            IssueKind::UnknownStateField => "unknown_state_field",
            IssueKind::TypeMismatch => "type_mismatch",
            IssueKind::OutputSchema => "output_schema",
            IssueKind::Template => "template",
            IssueKind::Condition => "condition",
            IssueKind::UnknownTool => "unknown_tool",
            IssueKind::ParallelWrite => "parallel_write",
            IssueKind::SchemaVersion => "schema_version",
        };
        write!(f, "{name}")
    }
}

/// One discovered defect
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    /// Config path, e.g. `edges[1].to`
    pub path: String,
    pub message: String,
    /// A nearby known name, when one is close enough
    pub suggestion: Option<String>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, ". Did you mean '{suggestion}'?")?;
        }
        Ok(())
    }
}

/// All issues discovered in one validation pass
#[derive(Debug, Error)]
pub struct ConfigValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "configuration invalid ({} issue(s)):", self.issues.len())?;
        for issue in &self.issues {
            writeln!(f, "  - {issue}")?;
        }
        Ok(())
    }
}

/// Validate a config against the tool registry. Pure and idempotent.
pub fn validate(config: &WorkflowConfig, tools: &ToolRegistry) -> Result<(), ConfigValidationError> {
    let mut v = Validator {
        config,
        tools,
        issues: Vec::new(),
        node_ids: config.nodes.iter().map(|n| n.id.clone()).collect(),
    };

    v.check_schema_version();
    v.check_node_ids();
    v.check_edge_endpoints();
    v.check_edge_structure();
    v.check_graph_shape();
    v.check_outputs();
    v.check_templates();
    v.check_tools();
    v.check_conditions();
    v.check_parallel_edges();

    if v.issues.is_empty() {
        Ok(())
    } else {
        Err(ConfigValidationError { issues: v.issues })
    }
}

struct Validator<'a> {
    config: &'a WorkflowConfig,
    tools: &'a ToolRegistry,
    issues: Vec<ValidationIssue>,
    node_ids: Vec<String>,
}

impl Validator<'_> {
    fn push(&mut self, kind: IssueKind, path: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            kind,
            path: path.into(),
            message: message.into(),
            suggestion: None,
        });
    }

    fn push_with_suggestion(
        &mut self,
        kind: IssueKind,
        path: impl Into<String>,
        message: impl Into<String>,
        suggestion: Option<String>,
    ) {
        self.issues.push(ValidationIssue {
            kind,
            path: path.into(),
            message: message.into(),
            suggestion,
        });
    }

    fn is_node(&self, id: &str) -> bool {
        self.node_ids.iter().any(|n| n == id)
    }

    fn check_schema_version(&mut self) {
        let version = &self.config.schema_version;
        match version.split('.').next() {
            Some("1") => {
                if !matches!(version.as_str(), "1.0" | "1.1") {
                    tracing::warn!(
                        version = %version,
                        "Unknown minor schema version; continuing on a best-effort basis"
                    );
                }
            }
            _ => self.push(
                IssueKind::SchemaVersion,
                "schema_version",
                format!("unsupported schema version '{version}' (supported: 1.x)"),
            ),
        }
    }

    fn check_node_ids(&mut self) {
        let mut seen = HashSet::new();
        for (index, node) in self.config.nodes.iter().enumerate() {
            if !seen.insert(node.id.as_str()) {
                self.push(
                    IssueKind::DuplicateNode,
                    format!("nodes[{index}].id"),
                    format!("duplicate node id '{}'", node.id),
                );
            }
            if node.id == START || node.id == END {
                self.push(
                    IssueKind::DuplicateNode,
                    format!("nodes[{index}].id"),
                    format!("'{}' is a reserved node id", node.id),
                );
            }
        }
    }

    fn check_endpoint(&mut self, path: String, id: &str, allow_start: bool, allow_end: bool) {
        if (id == START && allow_start) || (id == END && allow_end) || self.is_node(id) {
            return;
        }
        let message = format!("unknown node '{id}'");
        let suggestion = nearest_name(id, &self.node_ids);
        self.push_with_suggestion(IssueKind::UnknownNode, path, message, suggestion);
    }

    fn check_edge_endpoints(&mut self) {
        for (index, edge) in self.config.edges.iter().enumerate() {
            match edge {
                EdgeConfig::Linear(edge) => {
                    self.check_endpoint(format!("edges[{index}].from"), &edge.from, true, false);
                    self.check_endpoint(format!("edges[{index}].to"), &edge.to, false, true);
                }
                EdgeConfig::Conditional(edge) => {
                    self.check_endpoint(format!("edges[{index}].from"), &edge.from, false, false);
                    for (route_index, route) in edge.routes.iter().enumerate() {
                        self.check_endpoint(
                            format!("edges[{index}].routes[{route_index}].to"),
                            &route.to,
                            false,
                            true,
                        );
                    }
                    self.check_endpoint(format!("edges[{index}].default"), &edge.default, false, true);
                }
                EdgeConfig::Loop(edge) => {
                    self.check_endpoint(format!("edges[{index}].from"), &edge.from, false, false);
                    self.check_endpoint(format!("edges[{index}].to"), &edge.to, false, false);
                }
                EdgeConfig::Parallel(edge) => {
                    self.check_endpoint(format!("edges[{index}].from"), &edge.from, false, false);
                    self.check_endpoint(format!("edges[{index}].to"), &edge.to, false, false);
                }
            }
        }
    }

    fn check_edge_structure(&mut self) {
        let mut start_edges = 0usize;
        let mut outgoing: HashMap<&str, usize> = HashMap::new();

        for (index, edge) in self.config.edges.iter().enumerate() {
            let from = edge.from_node();
            if from == START {
                start_edges += 1;
                if !matches!(edge, EdgeConfig::Linear(_)) {
                    self.push(
                        IssueKind::EdgeStructure,
                        format!("edges[{index}]"),
                        "the START edge must be linear".to_string(),
                    );
                }
            }
            if from == END {
                self.push(
                    IssueKind::EdgeStructure,
                    format!("edges[{index}].from"),
                    "END cannot have outgoing edges".to_string(),
                );
            }
            // A loop edge rides alongside the node's exit edge; every
            // other kind is the node's transition.
            if !matches!(edge, EdgeConfig::Loop(_)) {
                *outgoing.entry(from).or_default() += 1;
            }
        }

        if start_edges != 1 {
            self.push(
                IssueKind::EdgeStructure,
                "edges",
                format!("exactly one edge must leave START, found {start_edges}"),
            );
        }

        for (from, count) in outgoing {
            if from != START && count > 1 {
                self.push(
                    IssueKind::EdgeStructure,
                    format!("edges (from '{from}')"),
                    format!("node '{from}' has {count} plain outgoing edges; use a conditional edge"),
                );
            }
        }
    }

    /// Forward targets of a node, loop back-edges excluded
    fn forward_targets(&self, from: &str) -> Vec<String> {
        let mut targets = Vec::new();
        for edge in &self.config.edges {
            if edge.from_node() != from {
                continue;
            }
            match edge {
                EdgeConfig::Linear(edge) => targets.push(edge.to.clone()),
                EdgeConfig::Conditional(edge) => {
                    targets.extend(edge.routes.iter().map(|r| r.to.clone()));
                    targets.push(edge.default.clone());
                }
                EdgeConfig::Parallel(edge) => targets.push(edge.to.clone()),
                EdgeConfig::Loop(_) => {}
            }
        }
        targets
    }

    fn check_graph_shape(&mut self) {
        // Reachability from START
        let mut reachable: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::from([START.to_string()]);
        while let Some(current) = queue.pop_front() {
            for target in self.forward_targets(&current) {
                if reachable.insert(target.clone()) {
                    queue.push_back(target);
                }
            }
        }

        for (index, node) in self.config.nodes.iter().enumerate() {
            if !reachable.contains(&node.id) {
                self.push(
                    IssueKind::Unreachable,
                    format!("nodes[{index}]"),
                    format!("node '{}' is not reachable from START", node.id),
                );
            }
        }

        // Termination: every node reaches END (loop edges excluded, so a
        // loop must have a non-loop exit path)
        let mut reaches_end: HashSet<String> = HashSet::from([END.to_string()]);
        loop {
            let mut changed = false;
            for node in &self.config.nodes {
                if reaches_end.contains(&node.id) {
                    continue;
                }
                if self
                    .forward_targets(&node.id)
                    .iter()
                    .any(|t| reaches_end.contains(t))
                {
                    reaches_end.insert(node.id.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for (index, node) in self.config.nodes.iter().enumerate() {
            if reachable.contains(&node.id) && !reaches_end.contains(&node.id) {
                self.push(
                    IssueKind::NoPathToEnd,
                    format!("nodes[{index}]"),
                    format!("node '{}' has no path to END", node.id),
                );
            }
        }

        // No cycles outside explicit loop edges: DFS with colors
        let mut state: HashMap<String, u8> = HashMap::new();
        let mut stack = vec![(START.to_string(), false)];
        let mut cycle_nodes: Vec<String> = Vec::new();
        while let Some((node, processed)) = stack.pop() {
            if processed {
                state.insert(node, 2);
                continue;
            }
            match state.get(&node) {
                Some(1) | Some(2) => continue,
                _ => {}
            }
            state.insert(node.clone(), 1);
            stack.push((node.clone(), true));
            for target in self.forward_targets(&node) {
                match state.get(&target) {
                    Some(1) => cycle_nodes.push(target.clone()),
                    Some(2) => {}
                    _ => stack.push((target, false)),
                }
            }
        }
        for node in cycle_nodes {
            self.push(
                IssueKind::Cycle,
                format!("edges (into '{node}')"),
                format!("cycle through node '{node}'; only loop edges may cycle"),
            );
        }
    }

    /// The LLM-returned type for each output field of a node
    fn output_types(&self, node: &NodeConfig) -> Vec<(String, Option<FieldType>)> {
        match &node.output_schema {
            None => node
                .outputs
                .iter()
                .map(|name| (name.clone(), Some(FieldType::Str)))
                .collect(),
            Some(OutputSchemaConfig::Scalar(type_str)) => node
                .outputs
                .iter()
                .map(|name| (name.clone(), FieldType::parse(type_str).ok()))
                .collect(),
            Some(OutputSchemaConfig::Object(fields)) => fields
                .iter()
                .map(|(name, field)| (name.clone(), FieldType::parse(field.type_str()).ok()))
                .collect(),
        }
    }

    fn check_outputs(&mut self) {
        let field_names: Vec<String> = self.config.state.fields.keys().cloned().collect();

        for (index, node) in self.config.nodes.iter().enumerate() {
            // Scalar schemas need exactly one output
            let scalar = !matches!(node.output_schema, Some(OutputSchemaConfig::Object(_)));
            if scalar && node.outputs.len() != 1 {
                self.push(
                    IssueKind::OutputSchema,
                    format!("nodes[{index}].outputs"),
                    format!(
                        "node '{}' has a scalar output schema but {} outputs",
                        node.id,
                        node.outputs.len()
                    ),
                );
            }

            // Object schema field names must match the outputs list
            if let Some(OutputSchemaConfig::Object(fields)) = &node.output_schema {
                let schema_names: HashSet<&str> = fields.keys().map(String::as_str).collect();
                let output_names: HashSet<&str> =
                    node.outputs.iter().map(String::as_str).collect();
                if schema_names != output_names {
                    self.push(
                        IssueKind::OutputSchema,
                        format!("nodes[{index}].output_schema"),
                        format!(
                            "output schema fields {{{}}} do not match outputs {{{}}}",
                            join_sorted(&schema_names),
                            join_sorted(&output_names)
                        ),
                    );
                }
                for (name, field) in fields {
                    if let Ok(FieldType::Object(_)) = FieldType::parse(field.type_str()) {
                        self.push(
                            IssueKind::OutputSchema,
                            format!("nodes[{index}].output_schema.{name}"),
                            "nested objects are not supported in output schemas".to_string(),
                        );
                    }
                }
            }

            for (output_index, output) in node.outputs.iter().enumerate() {
                let path = format!("nodes[{index}].outputs[{output_index}]");
                let Some(field) = self.config.state.fields.get(output) else {
                    let suggestion = nearest_name(output, &field_names);
                    self.push_with_suggestion(
                        IssueKind::UnknownStateField,
                        path,
                        format!("output '{output}' is not a state field"),
                        suggestion,
                    );
                    continue;
                };

                let Ok(state_ty) = FieldType::parse(&field.field_type) else {
                    self.push(
                        IssueKind::TypeMismatch,
                        format!("state.fields.{output}.type"),
                        format!("invalid type string '{}'", field.field_type),
                    );
                    continue;
                };

                if let Some((_, Some(out_ty))) = self
                    .output_types(node)
                    .into_iter()
                    .find(|(name, _)| name == output)
                {
                    let target = match Reducer::parse(
                        field.reducer.as_deref().unwrap_or("replace"),
                    ) {
                        // Appends write an element of the list
                        Ok(Reducer::Append) => match &state_ty {
                            FieldType::List(elem) => (**elem).clone(),
                            other => other.clone(),
                        },
                        _ => state_ty.clone(),
                    };
                    if !target.is_assignable_from(&out_ty) {
                        self.push(
                            IssueKind::TypeMismatch,
                            path,
                            format!(
                                "node '{}' writes {out_ty} to '{output}' which expects {target}",
                                node.id
                            ),
                        );
                    }
                }
            }
        }
    }

    fn check_templates(&mut self) {
        for (index, node) in self.config.nodes.iter().enumerate() {
            // Prompt placeholders resolve against state fields ∪ inputs
            let mut available: HashSet<&str> = self
                .config
                .state
                .fields
                .keys()
                .map(String::as_str)
                .collect();
            for input in node.inputs.keys() {
                available.insert(input.as_str());
            }

            let mut templates = vec![(format!("nodes[{index}].prompt"), &node.prompt, true)];
            if let Some(system) = &node.system_prompt {
                templates.push((format!("nodes[{index}].system_prompt"), system, true));
            }
            for (input_name, input_template) in &node.inputs {
                templates.push((
                    format!("nodes[{index}].inputs.{input_name}"),
                    input_template,
                    // Input templates resolve against state only
                    false,
                ));
            }

            for (path, template_str, with_inputs) in templates {
                for placeholder in template::placeholders(template_str) {
                    let known = if with_inputs {
                        available.contains(placeholder.as_str())
                    } else {
                        self.config.state.fields.contains_key(&placeholder)
                    };
                    if !known {
                        let candidates: Vec<String> = if with_inputs {
                            available.iter().map(|s| s.to_string()).collect()
                        } else {
                            self.config.state.fields.keys().cloned().collect()
                        };
                        let suggestion = nearest_name(&placeholder, &candidates);
                        self.push_with_suggestion(
                            IssueKind::Template,
                            path.clone(),
                            format!("placeholder '{{{placeholder}}}' is not a state field or node input"),
                            suggestion,
                        );
                    }
                }
            }
        }
    }

    fn check_tools(&mut self) {
        let registered = self.tools.names();
        for (index, node) in self.config.nodes.iter().enumerate() {
            for (tool_index, tool) in node.tools.iter().enumerate() {
                if !self.tools.has(tool) {
                    let suggestion = nearest_name(tool, &registered);
                    self.push_with_suggestion(
                        IssueKind::UnknownTool,
                        format!("nodes[{index}].tools[{tool_index}]"),
                        format!(
                            "unknown tool '{tool}'. Registered tools: {}",
                            registered.join(", ")
                        ),
                        suggestion,
                    );
                }
            }
        }
    }

    fn check_conditions(&mut self) {
        for (index, edge) in self.config.edges.iter().enumerate() {
            match edge {
                EdgeConfig::Conditional(ConditionalEdge { routes, .. }) => {
                    for (route_index, route) in routes.iter().enumerate() {
                        let path = format!("edges[{index}].routes[{route_index}].condition");
                        self.check_condition(&path, &route.condition);
                    }
                }
                EdgeConfig::Loop(loop_edge) => {
                    let path = format!("edges[{index}].loop.condition");
                    if let Some(expr) = self.check_condition(&path, &loop_edge.spec.condition) {
                        self.check_loop_condition_writable(index, loop_edge, &expr);
                    }
                }
                _ => {}
            }
        }
    }

    fn check_condition(&mut self, path: &str, condition: &str) -> Option<Expr> {
        match Expr::parse(condition) {
            Ok(expr) => {
                for field in expr.fields() {
                    let root = field.split('.').next().unwrap_or(&field).to_string();
                    if !self.config.state.fields.contains_key(&root) {
                        let candidates: Vec<String> =
                            self.config.state.fields.keys().cloned().collect();
                        let suggestion = nearest_name(&root, &candidates);
                        self.push_with_suggestion(
                            IssueKind::Condition,
                            path.to_string(),
                            format!("condition references unknown state field '{root}'"),
                            suggestion,
                        );
                    }
                }
                Some(expr)
            }
            Err(error) => {
                self.push(IssueKind::Condition, path.to_string(), error.to_string());
                None
            }
        }
    }

    /// The loop condition must be able to change: it has to read at least
    /// one field written by a node on the loop body.
    fn check_loop_condition_writable(&mut self, index: usize, edge: &LoopEdge, expr: &Expr) {
        let body = self.loop_body(&edge.to, &edge.from);
        let written: HashSet<&str> = self
            .config
            .nodes
            .iter()
            .filter(|node| body.contains(node.id.as_str()))
            .flat_map(|node| node.outputs.iter().map(String::as_str))
            .collect();

        let reads_written = expr
            .fields()
            .iter()
            .any(|field| written.contains(field.as_str()));
        if !reads_written {
            self.push(
                IssueKind::Condition,
                format!("edges[{index}].loop.condition"),
                format!(
                    "loop condition does not reference any field written by the loop body ('{}' → '{}')",
                    edge.to, edge.from
                ),
            );
        }
    }

    /// Nodes on the path from the loop target to the loop source, inclusive
    fn loop_body<'b>(&'b self, to: &'b str, from: &'b str) -> HashSet<&'b str> {
        // Forward-reachable from `to`
        let mut forward: HashSet<String> = HashSet::from([to.to_string()]);
        let mut queue = VecDeque::from([to.to_string()]);
        while let Some(current) = queue.pop_front() {
            for target in self.forward_targets(&current) {
                if forward.insert(target.clone()) {
                    queue.push_back(target);
                }
            }
        }

        // Of those, the ones that reach `from`
        let mut body: HashSet<&str> = HashSet::new();
        for node in &self.config.nodes {
            if !forward.contains(&node.id) {
                continue;
            }
            if node.id == from || self.reaches(&node.id, from) {
                body.insert(node.id.as_str());
            }
        }
        body
    }

    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::from([from.to_string()]);
        while let Some(current) = queue.pop_front() {
            for next in self.forward_targets(&current) {
                if next == target {
                    return true;
                }
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    fn check_parallel_edges(&mut self) {
        for (index, edge) in self.config.edges.iter().enumerate() {
            let EdgeConfig::Parallel(ParallelEdge { to, parallel, .. }) = edge else {
                continue;
            };

            let items = parallel.items_field();
            match self.state_field_type(items) {
                None => self.push(
                    IssueKind::UnknownStateField,
                    format!("edges[{index}].parallel.items"),
                    format!("items field '{items}' is not a state field"),
                ),
                Some(FieldType::List(_)) | Some(FieldType::Any) => {}
                Some(other) => self.push(
                    IssueKind::TypeMismatch,
                    format!("edges[{index}].parallel.items"),
                    format!("items field '{items}' must be a list, found {other}"),
                ),
            }

            let collect = parallel.collect_field();
            match self.config.state.fields.get(collect) {
                None => self.push(
                    IssueKind::UnknownStateField,
                    format!("edges[{index}].parallel.collect"),
                    format!("collect field '{collect}' is not a state field"),
                ),
                Some(field) => {
                    let reducer =
                        Reducer::parse(field.reducer.as_deref().unwrap_or("replace")).ok();
                    if reducer != Some(Reducer::Append) {
                        self.push(
                            IssueKind::ParallelWrite,
                            format!("edges[{index}].parallel.collect"),
                            format!("collect field '{collect}' must declare the append reducer"),
                        );
                    }
                    match FieldType::parse(&field.field_type) {
                        Ok(FieldType::List(_)) | Ok(FieldType::Any) | Err(_) => {}
                        Ok(other) => self.push(
                            IssueKind::TypeMismatch,
                            format!("edges[{index}].parallel.collect"),
                            format!("collect field '{collect}' must be a list, found {other}"),
                        ),
                    }
                }
            }

            let each = parallel.each_field();
            if self.state_field_type(each).is_none() {
                self.push(
                    IssueKind::UnknownStateField,
                    format!("edges[{index}].parallel.each"),
                    format!("per-branch field '{each}' is not a state field"),
                );
            }

            // Branch writes outside the collect field are dropped at
            // fan-in, so they are rejected here.
            if let Some(branch) = self.config.node(to) {
                let contributes_collect = branch.outputs.iter().any(|o| o == collect);
                if contributes_collect {
                    for (output_index, output) in branch.outputs.iter().enumerate() {
                        if output != collect {
                            self.push(
                                IssueKind::ParallelWrite,
                                format!("nodes ('{to}').outputs[{output_index}]"),
                                format!(
                                    "parallel branch '{to}' writes '{output}', but only '{collect}' survives fan-in"
                                ),
                            );
                        }
                    }
                } else if branch.outputs.len() != 1 {
                    self.push(
                        IssueKind::ParallelWrite,
                        format!("edges[{index}].parallel"),
                        format!(
                            "parallel branch '{to}' must write exactly one field (or '{collect}' directly)"
                        ),
                    );
                }
            }
        }
    }

    fn state_field_type(&self, name: &str) -> Option<FieldType> {
        self.config
            .state
            .fields
            .get(name)
            .and_then(|field| FieldType::parse(&field.field_type).ok())
    }
}

fn join_sorted(names: &HashSet<&str>) -> String {
    let mut sorted: Vec<&str> = names.iter().copied().collect();
    sorted.sort_unstable();
    sorted.join(", ")
}
