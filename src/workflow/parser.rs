/// BPMN XML graph builder
///
/// Turns a BPMN 2.0 document into an immutable `ProcessDefinition`:
/// - Reads the XML with quick-xml into a small element tree (namespace prefixes dropped)
/// - Builds one typed `Element` per recognised node of the first `process`
/// - Resolves exclusive-gateway defaults onto their flows (second pass)
/// - Derives parallel-gateway arrival counts from incoming flows
/// - Checks flow endpoints and reports unreachable nodes with petgraph

use crate::error::EngineError;
use crate::workflow::types::{
    ConnectorSpec, Element, FormField, Parameter, ProcessDefinition, SequenceFlow, Task, TaskKind,
};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::{HashMap, HashSet};

/// Process children that carry no execution semantics
const IGNORED_KINDS: &[&str] = &[
    "documentation",
    "extensionElements",
    "laneSet",
    "textAnnotation",
    "association",
    "dataObject",
    "dataObjectReference",
    "dataStoreReference",
    "property",
];

/// Minimal XML element tree node
#[derive(Debug, Default)]
struct XmlNode {
    name: String,
    attrs: HashMap<String, String>,
    children: Vec<XmlNode>,
    text: String,
}

impl XmlNode {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Depth-first search for the first descendant with the given name
    fn find(&self, name: &str) -> Option<&XmlNode> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    fn trimmed_text(&self) -> &str {
        self.text.trim()
    }
}

/// Parse a BPMN document into a process definition
///
/// `model_path` is the file name the document came from and becomes the
/// model identifier stored with every event record.
pub fn parse_definition(xml: &str, model_path: &str) -> Result<ProcessDefinition, EngineError> {
    let root = read_tree(xml)?;

    let process = if root.name == "process" {
        &root
    } else {
        root.child("process")
            .ok_or_else(|| parse_error(model_path, "no <process> element found"))?
    };

    let process_id = process.attr("id").unwrap_or(model_path).to_string();
    tracing::debug!("🏗️ Building process '{}' from {}", process_id, model_path);

    let mut elements: HashMap<String, Element> = HashMap::new();
    let mut flows: Vec<SequenceFlow> = Vec::new();
    let mut start_events = Vec::new();

    for node in &process.children {
        if IGNORED_KINDS.contains(&node.name.as_str()) {
            continue;
        }

        let id = node
            .attr("id")
            .ok_or_else(|| parse_error(model_path, &format!("<{}> without id", node.name)))?
            .to_string();
        let name = node.attr("name").map(str::to_string);

        let element = match node.name.as_str() {
            "startEvent" => {
                start_events.push(id.clone());
                Element::StartEvent { id: id.clone(), name }
            }
            "endEvent" => Element::EndEvent { id: id.clone(), name },
            "task" | "serviceTask" | "userTask" | "sendTask" | "manualTask" => {
                Element::Task(parse_task(node, id.clone(), name))
            }
            "exclusiveGateway" => Element::ExclusiveGateway {
                id: id.clone(),
                name,
                default: node.attr("default").map(str::to_string),
            },
            "parallelGateway" => Element::ParallelGateway {
                id: id.clone(),
                name,
                expected: 0,
            },
            "sequenceFlow" => {
                let flow = parse_flow(node, id.clone(), name, model_path)?;
                flows.push(flow.clone());
                Element::SequenceFlow(flow)
            }
            other => {
                return Err(parse_error(
                    model_path,
                    &format!("unsupported element kind '{}' (id '{}')", other, id),
                ));
            }
        };

        if elements.insert(id.clone(), element).is_some() {
            return Err(parse_error(model_path, &format!("duplicate element id '{}'", id)));
        }
    }

    if start_events.is_empty() {
        return Err(parse_error(model_path, "process has no start event"));
    }

    resolve_default_flows(&mut elements, &mut flows, model_path)?;
    validate_flow_endpoints(&elements, &flows, model_path)?;
    assign_join_counts(&mut elements, &flows);
    warn_unreachable(&process_id, &elements, &flows, &start_events);

    let mut grouped: HashMap<String, Vec<SequenceFlow>> = HashMap::new();
    for flow in flows {
        grouped.entry(flow.source.clone()).or_default().push(flow);
    }

    tracing::info!(
        "✅ Parsed process '{}' ({}): {} elements, {} start events",
        process_id,
        model_path,
        elements.len(),
        start_events.len()
    );

    Ok(ProcessDefinition {
        id: process_id,
        name: process.attr("name").map(str::to_string),
        model_path: model_path.to_string(),
        elements,
        flows: grouped,
        start_events,
    })
}

fn parse_error(model_path: &str, message: &str) -> EngineError {
    EngineError::Parse(format!("{}: {}", model_path, message))
}

/// Read the whole document into an element tree
fn read_tree(xml: &str) -> Result<XmlNode, EngineError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| EngineError::Parse(format!("XML error at {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(start) => stack.push(open_node(&start)?),
            Event::Empty(start) => {
                let node = open_node(&start)?;
                attach(&mut stack, &mut root, node);
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| EngineError::Parse("unbalanced closing tag".to_string()))?;
                attach(&mut stack, &mut root, node);
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| EngineError::Parse(format!("bad text content: {}", e)))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(EngineError::Parse("unexpected end of document".to_string()));
    }

    root.ok_or_else(|| EngineError::Parse("empty document".to_string()))
}

fn open_node(start: &BytesStart) -> Result<XmlNode, EngineError> {
    let mut node = XmlNode {
        name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        ..Default::default()
    };

    for attr in start.attributes() {
        let attr = attr.map_err(|e| EngineError::Parse(format!("bad attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| EngineError::Parse(format!("bad attribute value: {}", e)))?
            .into_owned();
        node.attrs.insert(key, value);
    }

    Ok(node)
}

fn attach(stack: &mut [XmlNode], root: &mut Option<XmlNode>, node: XmlNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => {
            if root.is_none() {
                *root = Some(node);
            }
        }
    }
}

fn parse_flow(
    node: &XmlNode,
    id: String,
    name: Option<String>,
    model_path: &str,
) -> Result<SequenceFlow, EngineError> {
    let source = node
        .attr("sourceRef")
        .ok_or_else(|| parse_error(model_path, &format!("flow '{}' has no sourceRef", id)))?;
    let target = node
        .attr("targetRef")
        .ok_or_else(|| parse_error(model_path, &format!("flow '{}' has no targetRef", id)))?;

    let conditions = node
        .children_named("conditionExpression")
        .map(|c| strip_expression_wrapper(c.trimmed_text()))
        .filter(|c| !c.is_empty())
        .collect();

    Ok(SequenceFlow {
        id,
        name,
        source: source.to_string(),
        target: target.to_string(),
        conditions,
        is_default: false,
    })
}

/// `${a > 1}` -> `a > 1`
fn strip_expression_wrapper(expr: &str) -> String {
    let expr = expr.trim();
    match expr.strip_prefix("${").and_then(|e| e.strip_suffix('}')) {
        Some(inner) => inner.trim().to_string(),
        None => expr.to_string(),
    }
}

fn parse_task(node: &XmlNode, id: String, name: Option<String>) -> Task {
    let kind = match node.name.as_str() {
        "serviceTask" => TaskKind::Service,
        "userTask" => TaskKind::User,
        "sendTask" => TaskKind::Send,
        "manualTask" => TaskKind::Manual,
        _ => TaskKind::Plain,
    };

    let extensions = node.child("extensionElements");

    let connector = extensions.and_then(|ext| ext.find("connector")).and_then(|c| {
        let connector_id = c.child("connectorId")?.trimmed_text().to_string();
        let mut spec = ConnectorSpec {
            connector: connector_id,
            path: None,
            method: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        };

        if let Some(io) = c.child("inputOutput") {
            for param in io.children_named("inputParameter") {
                let Some(param_name) = param.attr("name") else { continue };
                let value = param.trimmed_text().to_string();
                match param_name {
                    "path" | "url" => spec.path = Some(value),
                    "method" => spec.method = Some(value),
                    _ => spec.inputs.push(Parameter {
                        name: param_name.to_string(),
                        value,
                    }),
                }
            }
            for param in io.children_named("outputParameter") {
                if let Some(param_name) = param.attr("name") {
                    spec.outputs.push(Parameter {
                        name: param_name.to_string(),
                        value: param.trimmed_text().to_string(),
                    });
                }
            }
        }

        Some(spec)
    });

    let form = extensions
        .and_then(|ext| ext.find("formData"))
        .map(|data| {
            data.children_named("formField")
                .filter_map(|field| {
                    Some(FormField {
                        id: field.attr("id")?.to_string(),
                        label: field.attr("label").map(str::to_string),
                        field_type: field.attr("type").map(str::to_string),
                        default_value: field.attr("defaultValue").map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Task {
        id,
        name,
        kind,
        connector,
        form,
    }
}

/// Mark each gateway's `default` flow, which may appear anywhere in the document
fn resolve_default_flows(
    elements: &mut HashMap<String, Element>,
    flows: &mut [SequenceFlow],
    model_path: &str,
) -> Result<(), EngineError> {
    let defaults: Vec<(String, String)> = elements
        .values()
        .filter_map(|e| match e {
            Element::ExclusiveGateway {
                id,
                default: Some(flow_id),
                ..
            } => Some((id.clone(), flow_id.clone())),
            _ => None,
        })
        .collect();

    for (gateway_id, flow_id) in defaults {
        let flow = flows.iter_mut().find(|f| f.id == flow_id).ok_or_else(|| {
            parse_error(
                model_path,
                &format!("gateway '{}' names unknown default flow '{}'", gateway_id, flow_id),
            )
        })?;

        if flow.source != gateway_id {
            return Err(parse_error(
                model_path,
                &format!("default flow '{}' does not leave gateway '{}'", flow_id, gateway_id),
            ));
        }

        flow.is_default = true;
        if let Some(Element::SequenceFlow(stored)) = elements.get_mut(&flow_id) {
            stored.is_default = true;
        }
        tracing::debug!("  🔀 Default flow of '{}' is '{}'", gateway_id, flow_id);
    }

    Ok(())
}

fn validate_flow_endpoints(
    elements: &HashMap<String, Element>,
    flows: &[SequenceFlow],
    model_path: &str,
) -> Result<(), EngineError> {
    let is_node = |id: &str| matches!(elements.get(id), Some(e) if !matches!(e, Element::SequenceFlow(_)));

    for flow in flows {
        for endpoint in [&flow.source, &flow.target] {
            if !is_node(endpoint) {
                return Err(parse_error(
                    model_path,
                    &format!("flow '{}' references unknown element '{}'", flow.id, endpoint),
                ));
            }
        }
    }
    Ok(())
}

/// Expected arrivals of a join = number of flows targeting it (at least one)
fn assign_join_counts(elements: &mut HashMap<String, Element>, flows: &[SequenceFlow]) {
    let mut incoming: HashMap<&str, u32> = HashMap::new();
    for flow in flows {
        *incoming.entry(flow.target.as_str()).or_default() += 1;
    }

    for element in elements.values_mut() {
        if let Element::ParallelGateway { id, expected, .. } = element {
            *expected = incoming.get(id.as_str()).copied().unwrap_or(0).max(1);
        }
    }
}

fn warn_unreachable(
    process_id: &str,
    elements: &HashMap<String, Element>,
    flows: &[SequenceFlow],
    start_events: &[String],
) {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for (id, element) in elements {
        if !matches!(element, Element::SequenceFlow(_)) {
            index.insert(id.as_str(), graph.add_node(id.as_str()));
        }
    }
    for flow in flows {
        if let (Some(&from), Some(&to)) = (index.get(flow.source.as_str()), index.get(flow.target.as_str())) {
            graph.add_edge(from, to, ());
        }
    }

    let mut reached = HashSet::new();
    let mut starts = start_events.iter().filter_map(|s| index.get(s.as_str()).copied());
    if let Some(first) = starts.next() {
        let mut dfs = Dfs::new(&graph, first);
        loop {
            while let Some(nx) = dfs.next(&graph) {
                reached.insert(nx);
            }
            match starts.next() {
                Some(next) => dfs.move_to(next),
                None => break,
            }
        }
    }

    for (id, &nx) in &index {
        if !reached.contains(&nx) {
            tracing::warn!("⚠️ Element '{}' in process '{}' is unreachable from any start event", id, process_id);
        }
    }
}
