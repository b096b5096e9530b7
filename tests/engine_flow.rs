use async_trait::async_trait;
use bpmnway::{
    config::EndPolicy,
    error::EngineError,
    persistence::{EventRecord, InstanceStore, MemoryInstanceStore, RunningInstanceLog, SqliteInstanceStore},
    runtime::{
        engine::{ExecutionState, StepOutcome, TokenEngine},
        executor::Connector,
        instance::{InstanceHandle, InstanceManager, InstanceStatus},
        scheduler::InstanceScheduler,
    },
    service::ProcessService,
    workflow::{registry::ModelRegistry, types::ConnectorSpec, Task},
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

const MINIMAL: &str = include_str!("fixtures/minimal.bpmn");
const GATEWAY: &str = include_str!("fixtures/gateway.bpmn");
const JOIN: &str = include_str!("fixtures/join.bpmn");
const USER_TASK: &str = include_str!("fixtures/user_task.bpmn");

/// Connector double that counts invocations
#[derive(Default)]
struct RecordingConnector {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingConnector {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn invoke(
        &self,
        task: &Task,
        spec: &ConnectorSpec,
        variables: &Map<String, Value>,
    ) -> anyhow::Result<Map<String, Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("{} is down", spec.connector);
        }
        let mut out = Map::new();
        out.insert(format!("{}_done", task.id), json!(true));
        if let Some(name) = variables.get("name") {
            out.insert("greeting".to_string(), json!(format!("hello {}", name.as_str().unwrap_or("?"))));
        }
        Ok(out)
    }
}

/// Store whose event appends always fail
#[derive(Default)]
struct BrokenLogStore {
    inner: MemoryInstanceStore,
}

#[async_trait]
impl InstanceStore for BrokenLogStore {
    async fn append_event(&self, _record: &EventRecord) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }
    async fn running_instances_log(&self) -> anyhow::Result<Vec<RunningInstanceLog>> {
        self.inner.running_instances_log().await
    }
    async fn register_running(&self, instance_id: &str, model_path: &str) -> anyhow::Result<()> {
        self.inner.register_running(instance_id, model_path).await
    }
    async fn mark_finished(&self, instance_id: &str) -> anyhow::Result<bool> {
        self.inner.mark_finished(instance_id).await
    }
    async fn delete(&self, instance_id: &str) -> anyhow::Result<bool> {
        self.inner.delete(instance_id).await
    }
    async fn all_events(&self) -> anyhow::Result<Vec<EventRecord>> {
        self.inner.all_events().await
    }
}

fn vars(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn models() -> Arc<ModelRegistry> {
    let models = Arc::new(ModelRegistry::new());
    for (name, xml) in [
        ("minimal.bpmn", MINIMAL),
        ("gateway.bpmn", GATEWAY),
        ("join.bpmn", JOIN),
        ("user_task.bpmn", USER_TASK),
    ] {
        models.insert_source(name, xml).unwrap();
    }
    models
}

fn manager(store: Arc<dyn InstanceStore>, connector: Arc<RecordingConnector>) -> Arc<InstanceManager> {
    let engine = Arc::new(TokenEngine::new(connector, EndPolicy::Halt));
    let system = HashMap::from([("_frontend_url".to_string(), "http://app.local".to_string())]);
    Arc::new(InstanceManager::new(engine, store, &system, Duration::ZERO))
}

fn service(models: Arc<ModelRegistry>, manager: Arc<InstanceManager>) -> ProcessService {
    ProcessService::new(models, Arc::new(InstanceScheduler::new(manager)))
}

async fn wait_for(handle: &InstanceHandle, status: InstanceStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.status() != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("instance {} never reached {:?}, last {:?}", handle.id, status, handle.status()));
}

fn activities(records: &[EventRecord]) -> Vec<&str> {
    records.iter().map(|r| r.activity_id.as_str()).collect()
}

#[tokio::test]
async fn minimal_process_records_every_step() {
    let store = Arc::new(MemoryInstanceStore::new());
    let connector = Arc::new(RecordingConnector::default());
    let manager = manager(store.clone(), connector.clone());
    let definition = models().definition("minimal.bpmn").unwrap();

    let instance = manager
        .create_instance(definition, vars(json!({"name": "Ada", "_frontend_url": "http://override"})))
        .await
        .unwrap();
    assert_eq!(instance.state().pending, vec!["Start".to_string()]);
    let handle = instance.handle();

    assert_eq!(instance.run().await.unwrap(), InstanceStatus::Finished);

    let history = handle.history().await;
    assert_eq!(activities(&history), vec!["Start", "Lookup", "End"]);
    assert!(history.last().unwrap().pending.is_empty());
    assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, InstanceStatus::Finished);
    assert_eq!(snapshot.variables["Lookup_done"], json!(true));
    assert_eq!(snapshot.variables["greeting"], json!("hello Ada"));
    // Caller values win over system variables
    assert_eq!(snapshot.variables["_frontend_url"], json!("http://override"));
    assert!(!snapshot.durability_gap);

    assert_eq!(connector.calls(), 1);
    assert_eq!(store.all_events().await.unwrap(), history);
    assert!(store.running_instances_log().await.unwrap().is_empty());

    let json = handle.to_json().await;
    assert_eq!(json["status"], json!("finished"));
    assert_eq!(json["events"].as_array().unwrap().len(), 3);
    assert_eq!(json["events"][1]["activity_id"], json!("Lookup"));
}

#[tokio::test]
async fn exclusive_gateway_routes_by_condition_or_default() {
    let models = models();
    let manager = manager(Arc::new(MemoryInstanceStore::new()), Arc::new(RecordingConnector::default()));

    for (a, expected) in [(2, "TaskA"), (0, "TaskB")] {
        let definition = models.definition("gateway.bpmn").unwrap();
        let instance = manager.create_instance(definition, vars(json!({ "a": a }))).await.unwrap();
        let handle = instance.handle();
        instance.run().await.unwrap();

        let history = handle.history().await;
        assert_eq!(activities(&history), vec!["Start", "Check", expected, "End"]);
    }
}

#[tokio::test]
async fn join_releases_once_every_branch_arrived() {
    let connector = Arc::new(RecordingConnector::default());
    let manager = manager(Arc::new(MemoryInstanceStore::new()), connector.clone());
    let definition = models().definition("join.bpmn").unwrap();

    let instance = manager.create_instance(definition, Map::new()).await.unwrap();
    let handle = instance.handle();
    instance.run().await.unwrap();

    let history = handle.history().await;
    assert_eq!(
        activities(&history),
        vec!["Start", "Fork", "Store", "Merge", "Stamp", "Merge", "Render", "Merge", "End"]
    );
    assert_eq!(connector.calls(), 2);
    assert!(handle.snapshot().join_counters.is_empty());
}

#[tokio::test]
async fn replay_rebuilds_live_state_without_side_effects() {
    let definition = models().definition("join.bpmn").unwrap();
    let connector = Arc::new(RecordingConnector::default());
    let engine = TokenEngine::new(connector.clone(), EndPolicy::Halt);

    let mut state = ExecutionState::seeded(&definition, vars(json!({"name": "Ada"})));
    let mut records = Vec::new();
    let mut live = Vec::new();
    let base = Utc::now();
    while let Some(outcome) = engine.step(&definition, &mut state).await.unwrap() {
        records.push(EventRecord {
            instance_id: "replayed".to_string(),
            model_path: definition.model_path.clone(),
            activity_id: outcome.activity_id().to_string(),
            timestamp: base + chrono::Duration::microseconds(records.len() as i64),
            pending: state.pending.clone(),
            variables: state.variables.clone(),
        });
        live.push(state.clone());
        if matches!(outcome, StepOutcome::Ended { halted: true, .. }) {
            break;
        }
    }
    assert_eq!(live[3].join_counters, HashMap::from([("Merge".to_string(), 1)]));

    let calls = connector.calls();
    let manager = manager(Arc::new(MemoryInstanceStore::new()), connector.clone());

    for k in 1..=records.len() {
        let instance = manager.run_from_log(Arc::clone(&definition), "replayed", records[..k].to_vec());
        assert_eq!(instance.state(), &live[k - 1], "prefix of {} records", k);
    }
    assert_eq!(connector.calls(), calls);

    let finished = manager.run_from_log(Arc::clone(&definition), "replayed", records.clone());
    assert_eq!(finished.status(), InstanceStatus::Finished);

    let fresh = manager.run_from_log(definition, "fresh", Vec::new());
    assert_eq!(fresh.state().pending, vec!["Start".to_string()]);
}

#[tokio::test]
async fn user_task_waits_for_form_and_resumes() {
    let models = models();
    let service = service(
        models,
        manager(Arc::new(MemoryInstanceStore::new()), Arc::new(RecordingConnector::default())),
    );

    let id = service.create_instance("user_task.bpmn", None).await.unwrap();
    let handle = service.scheduler().get(&id).unwrap();
    wait_for(&handle, InstanceStatus::WaitingForInput).await;
    assert_eq!(handle.snapshot().pending, vec!["Review".to_string()]);

    // Not a pending user task
    assert!(matches!(
        service.submit_form(&id, "Decision", Map::new()),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        service.submit_form("missing", "Review", Map::new()),
        Err(EngineError::NotFound(_))
    ));

    let info = service.task_info(&id, "Review").unwrap();
    assert_eq!(info["type"], json!("user_task"));
    assert_eq!(info["pending"], json!(true));
    assert_eq!(info["form"][0]["id"], json!("approved"));

    service.submit_form(&id, "Review", vars(json!({"approved": true}))).unwrap();
    wait_for(&handle, InstanceStatus::Finished).await;

    let history = handle.history().await;
    assert_eq!(activities(&history), vec!["Start", "Review", "Decision", "Approved"]);
    assert_eq!(handle.snapshot().variables["approved"], json!(true));
}

#[tokio::test]
async fn forms_for_later_user_tasks_are_held() {
    let xml = r#"<process id="Both">
        <startEvent id="Start" /><parallelGateway id="Fork" />
        <userTask id="A" /><userTask id="B" />
        <parallelGateway id="Join" /><endEvent id="End" />
        <sequenceFlow id="f0" sourceRef="Start" targetRef="Fork" />
        <sequenceFlow id="f1" sourceRef="Fork" targetRef="A" />
        <sequenceFlow id="f2" sourceRef="Fork" targetRef="B" />
        <sequenceFlow id="f3" sourceRef="A" targetRef="Join" />
        <sequenceFlow id="f4" sourceRef="B" targetRef="Join" />
        <sequenceFlow id="f5" sourceRef="Join" targetRef="End" />
    </process>"#;
    let models = models();
    models.insert_source("both.bpmn", xml).unwrap();
    let service = service(
        models,
        manager(Arc::new(MemoryInstanceStore::new()), Arc::new(RecordingConnector::default())),
    );

    let id = service.create_instance("both.bpmn", None).await.unwrap();
    let handle = service.scheduler().get(&id).unwrap();
    wait_for(&handle, InstanceStatus::WaitingForInput).await;
    assert_eq!(handle.snapshot().pending, vec!["A".to_string(), "B".to_string()]);

    // A is pending but B is on top; A's form waits in the inbox
    service.submit_form(&id, "A", vars(json!({"a": "first"}))).unwrap();
    service.submit_form(&id, "B", vars(json!({"b": "second"}))).unwrap();
    wait_for(&handle, InstanceStatus::Finished).await;

    let history = handle.history().await;
    assert_eq!(activities(&history), vec!["Start", "Fork", "B", "Join", "A", "Join", "End"]);
    let variables = &handle.snapshot().variables;
    assert_eq!(variables["a"], json!("first"));
    assert_eq!(variables["b"], json!("second"));
}

#[tokio::test]
async fn connector_failure_marks_instance_failed() {
    let store = Arc::new(MemoryInstanceStore::new());
    let connector = Arc::new(RecordingConnector::default());
    connector.fail.store(true, Ordering::SeqCst);
    let manager = manager(store.clone(), connector.clone());
    let definition = models().definition("minimal.bpmn").unwrap();

    let instance = manager.create_instance(definition, Map::new()).await.unwrap();
    let handle = instance.handle();
    let err = instance.run().await.unwrap_err();
    assert!(matches!(err, EngineError::TaskExecution(_)));

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, InstanceStatus::Failed);
    assert_eq!(snapshot.pending, vec!["Lookup".to_string()]);
    assert!(snapshot.last_error.as_deref().unwrap().contains("crm is down"));

    // Still registered as running, so a restart retries the task
    let logs = store.running_instances_log().await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(activities(&logs[0].events), vec!["Start"]);
}

#[tokio::test]
async fn failed_appends_flag_a_durability_gap() {
    let manager = manager(Arc::new(BrokenLogStore::default()), Arc::new(RecordingConnector::default()));
    let definition = models().definition("minimal.bpmn").unwrap();

    let instance = manager.create_instance(definition, Map::new()).await.unwrap();
    let handle = instance.handle();
    assert_eq!(instance.run().await.unwrap(), InstanceStatus::Finished);

    assert!(handle.snapshot().durability_gap);
    assert_eq!(handle.history().await.len(), 3);
}

#[tokio::test]
async fn restart_recovers_running_instances_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn InstanceStore> =
        Arc::new(SqliteInstanceStore::open(dir.path().join("database.sqlite")).await.unwrap());
    let connector = Arc::new(RecordingConnector::default());
    let models = models();

    let first = service(Arc::clone(&models), manager(Arc::clone(&store), connector.clone()));
    let id = first.create_instance("user_task.bpmn", None).await.unwrap();
    let finished_id = first
        .create_instance("minimal.bpmn", Some(vars(json!({"name": "Ada"}))))
        .await
        .unwrap();
    let handle = first.scheduler().get(&id).unwrap();
    wait_for(&handle, InstanceStatus::WaitingForInput).await;
    wait_for(&first.scheduler().get(&finished_id).unwrap(), InstanceStatus::Finished).await;

    // Simulated crash: the loop stops, the registry entry stays running
    handle.cancel();

    let second = service(Arc::clone(&models), manager(Arc::clone(&store), connector.clone()));
    let resumed = second.scheduler().recover(&models).await.unwrap();
    assert_eq!(resumed, 1);
    assert!(second.scheduler().get(&finished_id).is_none());

    let recovered = second.scheduler().get(&id).unwrap();
    wait_for(&recovered, InstanceStatus::WaitingForInput).await;
    assert_eq!(activities(&recovered.history().await), vec!["Start"]);

    second.submit_form(&id, "Review", vars(json!({"approved": false}))).unwrap();
    wait_for(&recovered, InstanceStatus::Finished).await;
    assert_eq!(
        activities(&recovered.history().await),
        vec!["Start", "Review", "Decision", "Rejected"]
    );
    assert!(store.running_instances_log().await.unwrap().is_empty());
}

#[tokio::test]
async fn recovered_log_that_already_ended_leaves_the_registry() {
    let store = Arc::new(MemoryInstanceStore::new());
    let connector = Arc::new(RecordingConnector::default());
    let models = models();
    let definition = models.definition("minimal.bpmn").unwrap();

    // Crash between the final append and marking the instance finished
    store.register_running("ended", "minimal.bpmn").await.unwrap();
    let base = Utc::now();
    for (i, (activity, pending)) in [("Start", vec!["Lookup"]), ("Lookup", vec!["End"]), ("End", vec![])]
        .into_iter()
        .enumerate()
    {
        store
            .append_event(&EventRecord {
                instance_id: "ended".to_string(),
                model_path: definition.model_path.clone(),
                activity_id: activity.to_string(),
                timestamp: base + chrono::Duration::microseconds(i as i64),
                pending: pending.into_iter().map(str::to_string).collect(),
                variables: Map::new(),
            })
            .await
            .unwrap();
    }

    let manager = manager(store.clone(), connector.clone());
    let logs = store.running_instances_log().await.unwrap();
    assert_eq!(logs.len(), 1);
    let instance = manager.run_from_log(definition, "ended", logs[0].events.clone());
    assert_eq!(instance.status(), InstanceStatus::Finished);

    assert_eq!(instance.run().await.unwrap(), InstanceStatus::Finished);
    assert!(store.running_instances_log().await.unwrap().is_empty());
    assert_eq!(connector.calls(), 0);

    let restarted = service(Arc::clone(&models), manager);
    assert_eq!(restarted.scheduler().recover(&models).await.unwrap(), 0);
}

#[tokio::test]
async fn recovery_skips_unknown_models() {
    let store = Arc::new(MemoryInstanceStore::new());
    store.register_running("orphan", "gone.bpmn").await.unwrap();

    let models = models();
    let service = service(Arc::clone(&models), manager(store, Arc::new(RecordingConnector::default())));
    assert_eq!(service.scheduler().recover(&models).await.unwrap(), 0);
    assert!(service.scheduler().get("orphan").is_none());
}

#[tokio::test]
async fn search_intersects_terms_over_string_variables() {
    let service = service(
        models(),
        manager(Arc::new(MemoryInstanceStore::new()), Arc::new(RecordingConnector::default())),
    );

    let done = service
        .create_instance("gateway.bpmn", Some(vars(json!({"status": "Done", "a": "1", "b": "2"}))))
        .await
        .unwrap();
    let open = service
        .create_instance("gateway.bpmn", Some(vars(json!({"status": "open", "a": 1, "b": "2"}))))
        .await
        .unwrap();
    for id in [&done, &open] {
        wait_for(&service.scheduler().get(id).unwrap(), InstanceStatus::Finished).await;
    }

    let results = service.search("status:done").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"], json!(done));
    assert_eq!(results[0]["variables"]["status"], json!("Done"));

    let results = service.search("a:1,b:2").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"], json!(done));

    assert_eq!(service.search("b:2").await.unwrap().len(), 2);

    assert!(matches!(service.search("").await, Err(EngineError::InvalidQuery(_))));
    assert!(matches!(service.search("a:1,").await, Err(EngineError::InvalidQuery(_))));
}

#[tokio::test]
async fn delete_removes_instances_and_reports_unknown_ids() {
    let store = Arc::new(MemoryInstanceStore::new());
    let service = service(models(), manager(store.clone(), Arc::new(RecordingConnector::default())));

    assert!(matches!(
        service.delete_instance("nope").await,
        Err(EngineError::NotFound(_))
    ));

    let id = service.create_instance("user_task.bpmn", None).await.unwrap();
    wait_for(&service.scheduler().get(&id).unwrap(), InstanceStatus::WaitingForInput).await;

    service.delete_instance(&id).await.unwrap();
    assert!(matches!(service.instance_info(&id).await, Err(EngineError::NotFound(_))));
    assert!(store.running_instances_log().await.unwrap().is_empty());
    assert!(matches!(service.delete_instance(&id).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn model_listing_and_lookup() {
    let service = service(
        models(),
        manager(Arc::new(MemoryInstanceStore::new()), Arc::new(RecordingConnector::default())),
    );

    let id = service.create_instance("gateway.bpmn", None).await.unwrap();

    let listed = service.list_models().unwrap();
    let paths: Vec<&str> = listed.iter().map(|m| m["model_path"].as_str().unwrap()).collect();
    assert_eq!(paths, vec!["gateway.bpmn", "join.bpmn", "minimal.bpmn", "user_task.bpmn"]);
    assert_eq!(listed[0]["instances"], json!([id]));

    assert!(service.model_source("join.bpmn").unwrap().contains("parallelGateway"));
    assert!(matches!(service.model_source("nope.bpmn"), Err(EngineError::NotFound(_))));
    assert!(matches!(
        service.create_instance("nope.bpmn", None).await,
        Err(EngineError::NotFound(_))
    ));

    let info = service.instance_info(&id).await.unwrap();
    assert_eq!(info["model_path"], json!("gateway.bpmn"));
    assert_eq!(info["variables"]["_frontend_url"], json!("http://app.local"));
}
