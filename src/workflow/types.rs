/// Core process definition types
///
/// Defines the closed set of BPMN elements the engine understands and the
/// immutable `ProcessDefinition` graph shared by every instance of a model.
/// These types are serialized to JSON for the task-info and model endpoints.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// An immutable, parsed process graph
///
/// Built once by the parser and shared read-only (behind `Arc`) by all
/// instances of the model. Instances never copy it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// BPMN process id (e.g., "Process_1")
    pub id: String,
    /// Human-readable process name, if the diagram has one
    pub name: Option<String>,
    /// File name the definition was loaded from; identifies the model
    pub model_path: String,
    /// Every element keyed by id, sequence flows included
    pub elements: HashMap<String, Element>,
    /// Outgoing flows grouped by source element id, in document order
    pub flows: HashMap<String, Vec<SequenceFlow>>,
    /// Start events, in document order; the initial token set of new instances
    pub start_events: Vec<String>,
}

impl ProcessDefinition {
    /// Look up an element by id
    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    /// Outgoing flows of an element (empty when it has none)
    pub fn outgoing(&self, id: &str) -> &[SequenceFlow] {
        self.flows.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Expected arrival count of a parallel gateway
    pub fn expected_arrivals(&self, gateway_id: &str) -> Option<u32> {
        match self.elements.get(gateway_id) {
            Some(Element::ParallelGateway { expected, .. }) => Some(*expected),
            _ => None,
        }
    }

    /// Summary used when listing models
    pub fn describe(&self) -> Value {
        let mut ids: Vec<&String> = self.elements.keys().collect();
        ids.sort();
        json!({
            "id": self.id,
            "name": self.name,
            "model_path": self.model_path,
            "start_events": self.start_events,
            "elements": ids,
        })
    }
}

/// One node or edge of a process graph
///
/// The engine dispatches on this enum to decide how a token behaves:
/// events and tasks pass straight through, gateways branch or join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Element {
    /// Where new instances place their first tokens
    StartEvent { id: String, name: Option<String> },

    /// Reaching one stops the instance
    EndEvent { id: String, name: Option<String> },

    /// Unit of work; may call a connector or wait for a user form
    Task(Task),

    /// Takes every flow whose conditions hold, or the default flow if none do
    ExclusiveGateway {
        id: String,
        name: Option<String>,
        /// Id of the flow taken when no other outgoing flow matches
        default: Option<String>,
    },

    /// Forks unconditionally and joins once `expected` branches arrived
    ParallelGateway {
        id: String,
        name: Option<String>,
        /// Number of flows targeting this gateway
        expected: u32,
    },

    /// Directed edge between two elements
    SequenceFlow(SequenceFlow),
}

impl Element {
    pub fn id(&self) -> &str {
        match self {
            Element::StartEvent { id, .. }
            | Element::EndEvent { id, .. }
            | Element::ExclusiveGateway { id, .. }
            | Element::ParallelGateway { id, .. } => id,
            Element::Task(task) => &task.id,
            Element::SequenceFlow(flow) => &flow.id,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Element::StartEvent { name, .. }
            | Element::EndEvent { name, .. }
            | Element::ExclusiveGateway { name, .. }
            | Element::ParallelGateway { name, .. } => name.as_deref(),
            Element::Task(task) => task.name.as_deref(),
            Element::SequenceFlow(flow) => flow.name.as_deref(),
        }
    }

    /// Stable kind label used in logs and descriptions
    pub fn kind(&self) -> &'static str {
        match self {
            Element::StartEvent { .. } => "start_event",
            Element::EndEvent { .. } => "end_event",
            Element::Task(task) => task.kind.label(),
            Element::ExclusiveGateway { .. } => "exclusive_gateway",
            Element::ParallelGateway { .. } => "parallel_gateway",
            Element::SequenceFlow(_) => "sequence_flow",
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Element::EndEvent { .. })
    }

    /// Returns the task when this element waits for a user form
    pub fn as_user_task(&self) -> Option<&Task> {
        match self {
            Element::Task(task) if task.kind == TaskKind::User => Some(task),
            _ => None,
        }
    }

    /// Element description returned by the task-info endpoint
    pub fn describe(&self) -> Value {
        let mut info = json!({
            "id": self.id(),
            "name": self.name(),
            "type": self.kind(),
        });

        match self {
            Element::Task(task) => {
                info["form"] = json!(task.form);
                if let Some(connector) = &task.connector {
                    info["connector"] = json!(connector.connector);
                }
            }
            Element::ExclusiveGateway { default, .. } => {
                info["default"] = json!(default);
            }
            Element::ParallelGateway { expected, .. } => {
                info["expected_arrivals"] = json!(expected);
            }
            Element::SequenceFlow(flow) => {
                info["source"] = json!(flow.source);
                info["target"] = json!(flow.target);
                info["conditions"] = json!(flow.conditions);
                info["is_default"] = json!(flow.is_default);
            }
            Element::StartEvent { .. } | Element::EndEvent { .. } => {}
        }

        info
    }
}

/// Flavour of BPMN task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Plain `task`
    Plain,
    /// `serviceTask`, usually backed by a connector
    Service,
    /// `userTask`, suspends until a form is submitted
    User,
    /// `sendTask`, usually backed by a mailer connector
    Send,
    /// `manualTask`, passes straight through
    Manual,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Plain => "task",
            TaskKind::Service => "service_task",
            TaskKind::User => "user_task",
            TaskKind::Send => "send_task",
            TaskKind::Manual => "manual_task",
        }
    }
}

/// A task node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: Option<String>,
    pub kind: TaskKind,
    /// External side effect invoked when the task runs
    pub connector: Option<ConnectorSpec>,
    /// Fields a user task expects in its form submission
    pub form: Vec<FormField>,
}

/// Reference to a named external service plus its request template
///
/// Expected BPMN extension:
/// `<camunda:connector><camunda:connectorId>baserow</camunda:connectorId>...`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSpec {
    /// Logical connector name resolved to a base URL through configuration
    pub connector: String,
    /// Request path appended to the base URL
    pub path: Option<String>,
    /// HTTP method (defaults to POST)
    pub method: Option<String>,
    /// Request body fields; values are `${var}` templates
    pub inputs: Vec<Parameter>,
    /// Variable name -> JSONPath into the response
    pub outputs: Vec<Parameter>,
}

/// Named template or JSONPath parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

/// A user task form field declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub id: String,
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub field_type: Option<String>,
    pub default_value: Option<String>,
}

/// Directed edge between two elements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub name: Option<String>,
    pub source: String,
    pub target: String,
    /// Boolean expressions that must all hold for the flow to be taken
    pub conditions: Vec<String>,
    /// Taken only when no other outgoing flow of the gateway matched
    pub is_default: bool,
}
