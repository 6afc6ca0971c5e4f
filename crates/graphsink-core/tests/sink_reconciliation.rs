//! End-to-end reconciliation and procedure tests over a scripted
//! in-process transport.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use graphsink_config::ConfigurationSnapshot;
use graphsink_core::{
    ConsumerFactory, ConsumerFactoryRegistry, EventConsumer, InMemoryDeadLetters,
    InMemoryGraphWriter, PipelineStatus, ProcedureFacade, SinkContext, SinkError, SinkEvent,
    SinkLifecycleManager, SinkRegistry, SingleInstance, StaticClusterView, TopicRegistry,
};

type Script = Arc<Mutex<VecDeque<Vec<SinkEvent>>>>;

struct MockFactory {
    script: Script,
    created: AtomicUsize,
}

impl MockFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            created: AtomicUsize::new(0),
        })
    }

    async fn enqueue(&self, batch: Vec<SinkEvent>) {
        self.script.lock().await.push_back(batch);
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ConsumerFactory for MockFactory {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create(
        &self,
        _settings: &graphsink_config::SinkSettings,
        _topics: &[String],
    ) -> Result<Box<dyn EventConsumer>, SinkError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConsumer {
            script: self.script.clone(),
        }))
    }
}

struct MockConsumer {
    script: Script,
}

#[async_trait]
impl EventConsumer for MockConsumer {
    async fn start(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<SinkEvent>, SinkError> {
        match self.script.lock().await.pop_front() {
            Some(batch) => Ok(batch),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    async fn commit(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn stop(&mut self) {}
}

/// Factory whose consumers fail to start, for failed-start scenarios.
struct BrokenFactory;

impl ConsumerFactory for BrokenFactory {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create(
        &self,
        _settings: &graphsink_config::SinkSettings,
        _topics: &[String],
    ) -> Result<Box<dyn EventConsumer>, SinkError> {
        Ok(Box::new(BrokenConsumer))
    }
}

struct BrokenConsumer;

#[async_trait]
impl EventConsumer for BrokenConsumer {
    async fn start(&mut self) -> Result<(), SinkError> {
        Err(SinkError::Transport("broker unreachable".to_string()))
    }

    async fn poll(&mut self, _timeout: Duration) -> Result<Vec<SinkEvent>, SinkError> {
        Ok(Vec::new())
    }

    async fn commit(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn stop(&mut self) {}
}

struct Harness {
    factory: Arc<MockFactory>,
    writer: Arc<InMemoryGraphWriter>,
    context: SinkContext,
    manager: Arc<SinkLifecycleManager>,
}

fn harness_with_cluster(cluster: Arc<dyn graphsink_core::ClusterView>) -> Harness {
    let factory = MockFactory::new();
    let mut factories = ConsumerFactoryRegistry::new();
    factories.register(factory.clone());
    let writer = InMemoryGraphWriter::new();
    let context = SinkContext {
        registry: Arc::new(SinkRegistry::new()),
        factories: Arc::new(factories),
        topics: Arc::new(TopicRegistry::new()),
        writer: writer.clone(),
        cluster,
        dead_letters: Some(InMemoryDeadLetters::new()),
    };
    let manager = Arc::new(SinkLifecycleManager::new("graph", context.clone()));
    Harness {
        factory,
        writer,
        context,
        manager,
    }
}

fn harness() -> Harness {
    harness_with_cluster(Arc::new(SingleInstance))
}

fn base_config(extra: &str) -> ConfigurationSnapshot {
    ConfigurationSnapshot::from_properties(&format!(
        "streams.sink=mock\n\
         streams.sink.enabled=true\n\
         streams.sink.poll.interval=10\n\
         streams.sink.topic.cypher.orders=MERGE (o:Order {{id: event.id}})\n{extra}"
    ))
}

#[tokio::test]
async fn first_snapshot_starts_the_pipeline_and_events_flow() {
    let h = harness();
    h.factory
        .enqueue(vec![SinkEvent::new("orders", 0, json!({"id": 1}))])
        .await;

    h.manager.on_configuration_change(base_config("")).await;
    assert_eq!(h.manager.status(), PipelineStatus::Running);
    assert_eq!(h.factory.created(), 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.writer.written().await.is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the statement"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let written = h.writer.written().await;
    assert_eq!(written.len(), 1);
    assert!(written[0].query.contains("MERGE (o:Order"));

    h.manager.shutdown_for_close().await;
    assert_eq!(h.manager.status(), PipelineStatus::Closed);
}

#[tokio::test]
async fn identical_snapshot_does_not_restart() {
    let h = harness();
    h.manager.on_configuration_change(base_config("")).await;
    assert_eq!(h.factory.created(), 1);
    let first = h.context.registry.get("graph").unwrap();

    h.manager.on_configuration_change(base_config("")).await;
    assert_eq!(h.factory.created(), 1, "no new consumer was built");
    let second = h.context.registry.get("graph").unwrap();
    assert!(Arc::ptr_eq(&first, &second), "same pipeline handle survives");
}

#[tokio::test]
async fn irrelevant_changes_do_not_restart() {
    let h = harness();
    h.manager.on_configuration_change(base_config("")).await;

    h.manager
        .on_configuration_change(base_config(
            "kafka.acks=all\nkafka.linger.ms=50\nstreams.source.topic.nodes=n\n",
        ))
        .await;
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn topic_change_restarts_with_a_fresh_handle() {
    let h = harness();
    h.manager.on_configuration_change(base_config("")).await;
    let first = h.context.registry.get("graph").unwrap();

    h.manager
        .on_configuration_change(base_config(
            "streams.sink.topic.cypher.users=MERGE (u:User {id: event.id})\n",
        ))
        .await;
    assert_eq!(h.factory.created(), 2);
    let second = h.context.registry.get("graph").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(first.status(), PipelineStatus::Stopped);
    assert_eq!(second.status(), PipelineStatus::Running);
    assert_eq!(h.context.topics.topics(), vec!["orders", "users"]);
}

#[tokio::test]
async fn disabling_the_sink_stops_it() {
    let h = harness();
    h.manager.on_configuration_change(base_config("")).await;
    assert_eq!(h.manager.status(), PipelineStatus::Running);

    let disabled = ConfigurationSnapshot::from_properties(
        "streams.sink=mock\nstreams.sink.enabled=false\n\
         streams.sink.topic.cypher.orders=MERGE (o:Order {id: event.id})\n",
    );
    h.manager.on_configuration_change(disabled).await;
    assert_eq!(h.manager.status(), PipelineStatus::Stopped);
}

#[tokio::test]
async fn empty_snapshot_is_ignored() {
    let h = harness();
    h.manager.on_configuration_change(base_config("")).await;
    h.manager
        .on_configuration_change(ConfigurationSnapshot::default())
        .await;
    assert_eq!(h.manager.status(), PipelineStatus::Running);
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn follower_does_not_consume() {
    let view = Arc::new(StaticClusterView::clustered(false, true));
    let h = harness_with_cluster(view);
    h.manager.on_configuration_change(base_config("")).await;
    assert_eq!(h.manager.status(), PipelineStatus::Unknown);
    assert_eq!(h.factory.created(), 0);
}

#[tokio::test]
async fn cluster_only_refuses_standalone() {
    let h = harness();
    h.manager
        .on_configuration_change(base_config("streams.cluster.only=true\n"))
        .await;
    assert_eq!(h.manager.status(), PipelineStatus::Unknown);
    assert_eq!(h.factory.created(), 0);
}

#[tokio::test]
async fn failed_start_leaves_no_pipeline_registered() {
    let mut factories = ConsumerFactoryRegistry::new();
    factories.register(Arc::new(BrokenFactory));
    let context = SinkContext {
        registry: Arc::new(SinkRegistry::new()),
        factories: Arc::new(factories),
        topics: Arc::new(TopicRegistry::new()),
        writer: InMemoryGraphWriter::new(),
        cluster: Arc::new(SingleInstance),
        dead_letters: None,
    };
    let manager = SinkLifecycleManager::new("graph", context.clone());

    manager.on_configuration_change(base_config("")).await;
    assert_eq!(manager.status(), PipelineStatus::Unknown);
    assert!(context.registry.get("graph").is_none());
}

#[tokio::test]
async fn procedures_control_the_pipeline() {
    let h = harness();
    let facade = ProcedureFacade::new(h.manager.clone(), h.context.clone());
    h.manager.on_configuration_change(base_config("")).await;

    let records = facade.status().await.unwrap();
    assert_eq!(records[0].name, "status");
    assert_eq!(records[0].value, "running");

    facade.stop().await.unwrap();
    assert_eq!(h.manager.status(), PipelineStatus::Stopped);

    facade.start().await.unwrap();
    assert_eq!(h.manager.status(), PipelineStatus::Running);
    assert_eq!(h.factory.created(), 2, "start built a fresh pipeline");

    facade.restart().await.unwrap();
    assert_eq!(h.manager.status(), PipelineStatus::Running);
    assert_eq!(h.factory.created(), 3);

    let config = facade.config().await.unwrap();
    assert!(config
        .iter()
        .any(|kv| kv.name == "streams.sink.enabled" && kv.value == "true"));
    assert!(config
        .iter()
        .any(|kv| kv.name == "topic.orders" && kv.value == "cypher"));
}

#[tokio::test]
async fn procedures_on_follower_answer_informationally() {
    let view = Arc::new(StaticClusterView::clustered(false, true));
    let h = harness_with_cluster(view);
    let facade = ProcedureFacade::new(h.manager.clone(), h.context.clone());
    h.manager.on_configuration_change(base_config("")).await;

    let records = facade.start().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "error");
    assert!(records[0].value.contains("only on the leader"));
    assert_eq!(h.manager.status(), PipelineStatus::Unknown);
}

#[tokio::test]
async fn disabled_procedures_are_refused() {
    let h = harness();
    let facade = ProcedureFacade::new(h.manager.clone(), h.context.clone());
    h.manager
        .on_configuration_change(base_config("streams.procedures.enabled=false\n"))
        .await;

    let err = facade.status().await.unwrap_err();
    assert!(matches!(err, SinkError::ProceduresDisabled));
}

#[tokio::test]
async fn consume_streams_until_the_window_closes() {
    let h = harness();
    let facade = ProcedureFacade::new(h.manager.clone(), h.context.clone());
    // Keep the pipeline itself off so the scripted batch is read by the
    // ad-hoc consumer and not the consume loop.
    h.manager
        .on_configuration_change(base_config("streams.sink.enabled=false\n"))
        .await;

    h.factory
        .enqueue(vec![
            SinkEvent::new("adhoc", 0, json!({"n": 1})),
            SinkEvent::new("adhoc", 1, json!({"n": 2})),
        ])
        .await;

    let mut options = BTreeMap::new();
    options.insert("timeout".to_string(), "200".to_string());
    let stream = facade.consume("adhoc", options).await.unwrap();
    let events = stream.drain().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].payload, Some(json!({"n": 2})));
}

#[tokio::test]
async fn consume_of_an_idle_topic_ends_empty_at_the_timeout() {
    let h = harness();
    let facade = ProcedureFacade::new(h.manager.clone(), h.context.clone());
    h.manager
        .on_configuration_change(base_config("streams.sink.enabled=false\n"))
        .await;

    let mut options = BTreeMap::new();
    options.insert("timeout".to_string(), "150".to_string());
    let started = tokio::time::Instant::now();
    let events = facade.consume("idle", options).await.unwrap().drain().await;
    assert!(events.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn consume_of_blank_topic_is_an_empty_stream() {
    let h = harness();
    let facade = ProcedureFacade::new(h.manager.clone(), h.context.clone());
    let mut stream = facade.consume("  ", BTreeMap::new()).await.unwrap();
    assert!(stream.next().await.is_none());
}
