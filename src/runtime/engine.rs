/// Token execution engine
///
/// Moves tokens through a process graph one step at a time. A token is the id
/// of the element it sits on; `pending` is a stack, so the most recently
/// produced token runs next and branches are explored depth-first.
///
/// The engine owns no instance state. The instance run loop hands it an
/// `ExecutionState` and gets back what the step did.

use crate::config::EndPolicy;
use crate::error::{EngineError, EngineResult};
use crate::runtime::condition::check_conditions;
use crate::runtime::executor::Connector;
use crate::workflow::types::{Element, ProcessDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc};

/// Mutable state of one instance, owned by its run loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub variables: Map<String, Value>,
    /// Token stack; the last entry is processed next
    pub pending: Vec<String>,
    /// Arrivals so far at each parallel gateway; released gateways are removed
    pub join_counters: HashMap<String, u32>,
}

impl ExecutionState {
    /// Fresh state with one token per start event
    pub fn seeded(definition: &ProcessDefinition, variables: Map<String, Value>) -> Self {
        Self {
            variables,
            pending: definition.start_events.clone(),
            join_counters: HashMap::new(),
        }
    }
}

/// What a single step did
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The token was consumed and its successors pushed
    Advanced {
        activity_id: String,
        successors: Vec<String>,
    },
    /// A parallel gateway consumed the token without releasing
    Parked { activity_id: String, arrivals: u32 },
    /// An end event was reached
    Ended {
        activity_id: String,
        /// True when the instance must stop now
        halted: bool,
        /// Tokens dropped because of a halting end event
        abandoned: Vec<String>,
    },
}

impl StepOutcome {
    pub fn activity_id(&self) -> &str {
        match self {
            StepOutcome::Advanced { activity_id, .. }
            | StepOutcome::Parked { activity_id, .. }
            | StepOutcome::Ended { activity_id, .. } => activity_id,
        }
    }
}

/// Stateless step executor shared by every instance
pub struct TokenEngine {
    connector: Arc<dyn Connector>,
    end_policy: EndPolicy,
}

impl std::fmt::Debug for TokenEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEngine")
            .field("end_policy", &self.end_policy)
            .finish_non_exhaustive()
    }
}

impl TokenEngine {
    pub fn new(connector: Arc<dyn Connector>, end_policy: EndPolicy) -> Self {
        Self {
            connector,
            end_policy,
        }
    }

    pub fn end_policy(&self) -> EndPolicy {
        self.end_policy
    }

    /// Process the token on top of `pending`
    ///
    /// Returns `Ok(None)` when there is no token left. A connector failure
    /// leaves `state` exactly as it was, the token included.
    pub async fn step(
        &self,
        definition: &ProcessDefinition,
        state: &mut ExecutionState,
    ) -> EngineResult<Option<StepOutcome>> {
        let Some(token) = state.pending.pop() else {
            return Ok(None);
        };

        let Some(element) = definition.element(&token) else {
            tracing::warn!("⚠️ Dropping token on unknown element '{}' in {}", token, definition.model_path);
            return Ok(Some(StepOutcome::Advanced {
                activity_id: token,
                successors: Vec::new(),
            }));
        };

        tracing::debug!("📍 Step '{}' ({})", token, element.kind());

        match element {
            Element::EndEvent { .. } => {
                let outcome = match self.end_policy {
                    EndPolicy::Halt => {
                        let abandoned = std::mem::take(&mut state.pending);
                        if !abandoned.is_empty() {
                            tracing::info!("🛑 End event '{}' abandons pending tokens {:?}", token, abandoned);
                        }
                        StepOutcome::Ended {
                            activity_id: token,
                            halted: true,
                            abandoned,
                        }
                    }
                    EndPolicy::Drain => StepOutcome::Ended {
                        halted: state.pending.is_empty(),
                        activity_id: token,
                        abandoned: Vec::new(),
                    },
                };
                Ok(Some(outcome))
            }

            Element::Task(task) => {
                if let Some(spec) = &task.connector {
                    match self.connector.invoke(task, spec, &state.variables).await {
                        Ok(result) => state.variables.extend(result),
                        Err(e) => {
                            state.pending.push(token);
                            tracing::error!("❌ Connector '{}' failed for task '{}': {:#}", spec.connector, task.id, e);
                            return Err(EngineError::TaskExecution(format!(
                                "task '{}' (connector '{}'): {:#}",
                                task.id, spec.connector, e
                            )));
                        }
                    }
                }
                Ok(Some(self.advance(definition, state, token)))
            }

            Element::ParallelGateway { expected, .. } => {
                let (released, arrivals) = register_arrival(&mut state.join_counters, &token, *expected);
                if released {
                    tracing::debug!("🔀 Join '{}' released after {} arrivals", token, expected);
                    Ok(Some(self.advance(definition, state, token)))
                } else {
                    tracing::debug!("⏸️ Token parked at '{}' ({}/{})", token, arrivals, expected);
                    Ok(Some(StepOutcome::Parked {
                        activity_id: token,
                        arrivals,
                    }))
                }
            }

            Element::SequenceFlow(flow) => {
                let successors = vec![flow.target.clone()];
                state.pending.extend(successors.iter().cloned());
                Ok(Some(StepOutcome::Advanced {
                    activity_id: token,
                    successors,
                }))
            }

            Element::StartEvent { .. } | Element::ExclusiveGateway { .. } => {
                Ok(Some(self.advance(definition, state, token)))
            }
        }
    }

    fn advance(&self, definition: &ProcessDefinition, state: &mut ExecutionState, token: String) -> StepOutcome {
        let successors = successors(definition, &token, &state.variables);
        state.pending.extend(successors.iter().cloned());
        StepOutcome::Advanced {
            activity_id: token,
            successors,
        }
    }
}

/// Targets of the flows a token leaves `element_id` through
///
/// Every non-default flow whose conditions all hold contributes its target,
/// in flow order. The default flow is taken only when nothing else matched.
pub fn successors(definition: &ProcessDefinition, element_id: &str, variables: &Map<String, Value>) -> Vec<String> {
    let flows = definition.outgoing(element_id);

    let mut next: Vec<String> = flows
        .iter()
        .filter(|flow| !flow.is_default && check_conditions(&flow.conditions, variables))
        .map(|flow| flow.target.clone())
        .collect();

    if next.is_empty() {
        if let Some(default) = flows.iter().find(|flow| flow.is_default) {
            next.push(default.target.clone());
        }
    }

    next
}

/// Count one arrival at a parallel gateway
///
/// Returns whether the gateway releases and the arrival count before release.
/// A released gateway's counter is removed so reuse starts from zero.
pub fn register_arrival(counters: &mut HashMap<String, u32>, gateway_id: &str, expected: u32) -> (bool, u32) {
    let count = counters.entry(gateway_id.to_string()).or_insert(0);
    *count += 1;
    let arrivals = *count;
    if arrivals >= expected {
        counters.remove(gateway_id);
        (true, arrivals)
    } else {
        (false, arrivals)
    }
}

/// Rebuild join counters from an ordered sequence of executed activities
pub fn replay_join_counters<'a>(
    definition: &ProcessDefinition,
    activities: impl IntoIterator<Item = &'a str>,
) -> HashMap<String, u32> {
    let mut counters = HashMap::new();
    for activity in activities {
        if let Some(expected) = definition.expected_arrivals(activity) {
            register_arrival(&mut counters, activity, expected);
        }
    }
    counters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_definition;
    use crate::workflow::types::{ConnectorSpec, Task};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingConnector {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn invoke(
            &self,
            task: &Task,
            _spec: &ConnectorSpec,
            _variables: &Map<String, Value>,
        ) -> anyhow::Result<Map<String, Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("service unavailable");
            }
            let mut out = Map::new();
            out.insert(format!("{}_done", task.id), json!(true));
            Ok(out)
        }
    }

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    const GATEWAY: &str = r#"
        <definitions xmlns:camunda="http://camunda.org/schema/1.0/bpmn"><process id="P">
          <startEvent id="Start" />
          <exclusiveGateway id="Gw" default="toB" />
          <task id="TaskA" />
          <task id="TaskB" />
          <task id="TaskC" />
          <endEvent id="End" />
          <sequenceFlow id="f0" sourceRef="Start" targetRef="Gw" />
          <sequenceFlow id="toA" sourceRef="Gw" targetRef="TaskA">
            <conditionExpression>${a &gt; 1}</conditionExpression>
          </sequenceFlow>
          <sequenceFlow id="toB" sourceRef="Gw" targetRef="TaskB" />
          <sequenceFlow id="toC" sourceRef="Gw" targetRef="TaskC">
            <conditionExpression>${a &gt; 5}</conditionExpression>
          </sequenceFlow>
          <sequenceFlow id="fa" sourceRef="TaskA" targetRef="End" />
          <sequenceFlow id="fb" sourceRef="TaskB" targetRef="End" />
          <sequenceFlow id="fc" sourceRef="TaskC" targetRef="End" />
        </process></definitions>"#;

    const JOIN: &str = r#"
        <process id="P">
          <startEvent id="Start" />
          <parallelGateway id="Fork" />
          <serviceTask id="Left">
            <extensionElements><camunda:connector><camunda:connectorId>pdf</camunda:connectorId></camunda:connector></extensionElements>
          </serviceTask>
          <task id="Right" />
          <parallelGateway id="Join" />
          <endEvent id="End" />
          <sequenceFlow id="f0" sourceRef="Start" targetRef="Fork" />
          <sequenceFlow id="f1" sourceRef="Fork" targetRef="Left" />
          <sequenceFlow id="f2" sourceRef="Fork" targetRef="Right" />
          <sequenceFlow id="f3" sourceRef="Left" targetRef="Join" />
          <sequenceFlow id="f4" sourceRef="Right" targetRef="Join" />
          <sequenceFlow id="f5" sourceRef="Join" targetRef="End" />
        </process>"#;

    fn engine(connector: Arc<CountingConnector>, policy: EndPolicy) -> TokenEngine {
        TokenEngine::new(connector, policy)
    }

    async fn run_to_end(engine: &TokenEngine, definition: &ProcessDefinition, state: &mut ExecutionState) -> Vec<StepOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = engine.step(definition, state).await.unwrap() {
            let stop = matches!(outcome, StepOutcome::Ended { halted: true, .. });
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        outcomes
    }

    #[tokio::test]
    async fn exclusive_gateway_takes_matching_flows_only() {
        let definition = parse_definition(GATEWAY, "gw.bpmn").unwrap();
        let engine = engine(Arc::new(CountingConnector::default()), EndPolicy::Halt);

        let mut state = ExecutionState::seeded(&definition, vars(json!({"a": 2})));
        engine.step(&definition, &mut state).await.unwrap();
        let outcome = engine.step(&definition, &mut state).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Advanced {
                activity_id: "Gw".to_string(),
                successors: vec!["TaskA".to_string()]
            }
        );

        // Two conditional matches, default still skipped
        let mut state = ExecutionState::seeded(&definition, vars(json!({"a": 9})));
        engine.step(&definition, &mut state).await.unwrap();
        engine.step(&definition, &mut state).await.unwrap();
        assert_eq!(state.pending, vec!["TaskA".to_string(), "TaskC".to_string()]);
    }

    #[tokio::test]
    async fn default_flow_only_when_nothing_matches() {
        let definition = parse_definition(GATEWAY, "gw.bpmn").unwrap();
        let engine = engine(Arc::new(CountingConnector::default()), EndPolicy::Halt);

        let mut state = ExecutionState::seeded(&definition, vars(json!({"a": 0})));
        let outcomes = run_to_end(&engine, &definition, &mut state).await;
        let visited: Vec<&str> = outcomes.iter().map(StepOutcome::activity_id).collect();
        assert_eq!(visited, vec!["Start", "Gw", "TaskB", "End"]);
        assert!(state.pending.is_empty());

        // Unknown variable makes the condition false, never an error
        let mut state = ExecutionState::seeded(&definition, Map::new());
        let outcomes = run_to_end(&engine, &definition, &mut state).await;
        assert_eq!(outcomes[2].activity_id(), "TaskB");
    }

    #[tokio::test]
    async fn no_match_and_no_default_yields_no_successors() {
        let xml = GATEWAY.replace(r#"default="toB""#, "").replace(
            r#"<sequenceFlow id="toB" sourceRef="Gw" targetRef="TaskB" />"#,
            r#"<sequenceFlow id="toB" sourceRef="Gw" targetRef="TaskB"><conditionExpression>a == 100</conditionExpression></sequenceFlow>"#,
        );
        let definition = parse_definition(&xml, "gw.bpmn").unwrap();
        let engine = engine(Arc::new(CountingConnector::default()), EndPolicy::Halt);

        let mut state = ExecutionState::seeded(&definition, vars(json!({"a": 0})));
        engine.step(&definition, &mut state).await.unwrap();
        let outcome = engine.step(&definition, &mut state).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Advanced {
                activity_id: "Gw".to_string(),
                successors: vec![]
            }
        );
        assert!(engine.step(&definition, &mut state).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn join_waits_for_every_branch() {
        let definition = parse_definition(JOIN, "join.bpmn").unwrap();
        let connector = Arc::new(CountingConnector::default());
        let engine = engine(connector.clone(), EndPolicy::Halt);

        let mut state = ExecutionState::seeded(&definition, Map::new());
        let outcomes = run_to_end(&engine, &definition, &mut state).await;
        let visited: Vec<&str> = outcomes.iter().map(StepOutcome::activity_id).collect();
        // LIFO: the right branch runs first and parks at the join
        assert_eq!(visited, vec!["Start", "Fork", "Right", "Join", "Left", "Join", "End"]);
        assert_eq!(outcomes[3], StepOutcome::Parked { activity_id: "Join".to_string(), arrivals: 1 });
        assert_eq!(
            outcomes[5],
            StepOutcome::Advanced {
                activity_id: "Join".to_string(),
                successors: vec!["End".to_string()]
            }
        );
        assert!(state.join_counters.is_empty());
        assert_eq!(state.variables["Left_done"], json!(true));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);

        let replayed = replay_join_counters(&definition, visited[..4].iter().copied());
        assert_eq!(replayed, HashMap::from([("Join".to_string(), 1)]));
    }

    #[tokio::test]
    async fn connector_failure_restores_the_token() {
        let definition = parse_definition(JOIN, "join.bpmn").unwrap();
        let connector = Arc::new(CountingConnector { fail: true, ..Default::default() });
        let engine = engine(connector, EndPolicy::Halt);

        let mut state = ExecutionState::seeded(&definition, Map::new());
        for _ in 0..4 {
            engine.step(&definition, &mut state).await.unwrap();
        }
        let before = state.clone();
        let err = engine.step(&definition, &mut state).await.unwrap_err();
        assert!(matches!(err, EngineError::TaskExecution(_)));
        assert_eq!(state, before);
        assert_eq!(state.pending.last().map(String::as_str), Some("Left"));
    }

    #[tokio::test]
    async fn drain_policy_keeps_other_branches() {
        let xml = r#"<process id="P">
            <startEvent id="Start" /><parallelGateway id="Fork" />
            <endEvent id="EndA" /><task id="Slow" /><endEvent id="EndB" />
            <sequenceFlow id="f0" sourceRef="Start" targetRef="Fork" />
            <sequenceFlow id="f1" sourceRef="Fork" targetRef="Slow" />
            <sequenceFlow id="f2" sourceRef="Fork" targetRef="EndA" />
            <sequenceFlow id="f3" sourceRef="Slow" targetRef="EndB" />
        </process>"#;
        let definition = parse_definition(xml, "drain.bpmn").unwrap();

        let halt = engine(Arc::new(CountingConnector::default()), EndPolicy::Halt);
        let mut state = ExecutionState::seeded(&definition, Map::new());
        let outcomes = run_to_end(&halt, &definition, &mut state).await;
        assert_eq!(
            outcomes.last().unwrap(),
            &StepOutcome::Ended {
                activity_id: "EndA".to_string(),
                halted: true,
                abandoned: vec!["Slow".to_string()]
            }
        );
        assert!(state.pending.is_empty());

        let drain = engine(Arc::new(CountingConnector::default()), EndPolicy::Drain);
        let mut state = ExecutionState::seeded(&definition, Map::new());
        let outcomes = run_to_end(&drain, &definition, &mut state).await;
        let visited: Vec<&str> = outcomes.iter().map(StepOutcome::activity_id).collect();
        assert_eq!(visited, vec!["Start", "Fork", "EndA", "Slow", "EndB"]);
    }
}
