//! Cross-crate integration tests: instrumentation driving the trace
//! client end to end through a mock sink.

use std::sync::Arc;

use huginn::{MockSink, TraceClient};
use huginn_instrument::{
    HandlerError, HandlerRegistry, InstrumentTargets, Instrumentor, ModuleBuilder,
};

/// Client + registry with a two-stage pipeline: `Pipeline.run` dispatches
/// to `Retriever.fetch` through the registry, the way a host application
/// composes registered capabilities.
fn pipeline_fixture() -> (TraceClient, Arc<MockSink>, HandlerRegistry) {
    let sink = Arc::new(MockSink::new());
    let client = TraceClient::new(sink.clone());
    let registry = HandlerRegistry::new();

    registry.register(
        ModuleBuilder::new("app.retrieval").sync_method("Retriever", "fetch", |input| {
            Ok(serde_json::json!({"documents": [input]}))
        }),
    );

    let inner = registry.clone();
    registry.register(
        ModuleBuilder::new("app.pipeline").sync_method("Pipeline", "run", move |input| {
            let documents = inner.invoke("app.retrieval", "Retriever", "fetch", input)?;
            Ok(serde_json::json!({"answer": "ok", "context": documents}))
        }),
    );

    (client, sink, registry)
}

fn all_targets() -> InstrumentTargets {
    InstrumentTargets::new()
        .prefix("app.")
        .type_methods("Pipeline", ["run"])
        .type_methods("Retriever", ["fetch"])
}

#[tokio::test]
async fn test_instrumented_pipeline_produces_linked_spans() {
    let (client, sink, registry) = pipeline_fixture();
    let engine = Instrumentor::new(client.clone(), registry.clone());
    engine.enable(all_targets());

    let result = registry
        .invoke("app.pipeline", "Pipeline", "run", serde_json::json!({"q": "spans"}))
        .unwrap();
    assert_eq!(result["answer"], "ok");

    assert!(client.flush().await);
    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 2);

    // Finish order: the nested fetch completes first.
    let fetch = &delivered[0];
    let run = &delivered[1];
    assert_eq!(fetch["operation"], "app.retrieval.Retriever.fetch");
    assert_eq!(run["operation"], "app.pipeline.Pipeline.run");
    assert_eq!(fetch["parent_id"], run["id"]);
    assert!(run["parent_id"].is_null());
    assert_eq!(fetch["status"], "success");
    assert_eq!(run["status"], "success");
    assert_eq!(run["metadata"]["auto_instrumented"], true);
}

#[tokio::test]
async fn test_session_flows_through_instrumented_spans() {
    let (client, sink, registry) = pipeline_fixture();
    let engine = Instrumentor::new(client.clone(), registry.clone());
    engine.enable(all_targets());

    let session = client.create_session(None, None);
    registry
        .invoke("app.pipeline", "Pipeline", "run", serde_json::json!(null))
        .unwrap();

    client.flush().await;
    for record in sink.delivered() {
        assert_eq!(record["session_id"], serde_json::json!(session.as_str()));
    }
}

#[tokio::test]
async fn test_instrumented_call_nests_under_manual_scope() {
    let sink = Arc::new(MockSink::new());
    let client = TraceClient::new(sink.clone());
    let registry = HandlerRegistry::new();
    registry.register(
        ModuleBuilder::new("app.search").async_method("QueryEngine", "query", |input| {
            Box::pin(async move { Ok(serde_json::json!({"hits": [input]})) })
        }),
    );

    let engine = Instrumentor::new(client.clone(), registry.clone());
    engine.enable(
        InstrumentTargets::new()
            .prefix("app.search")
            .type_methods("QueryEngine", ["query"]),
    );

    let result: Result<serde_json::Value, HandlerError> = client
        .trace_async("request.handle", async {
            registry
                .invoke_async("app.search", "QueryEngine", "query", serde_json::json!("q"))
                .await
        })
        .await;
    assert!(result.is_ok());

    client.flush().await;
    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0]["operation"], "app.search.QueryEngine.query");
    assert_eq!(delivered[1]["operation"], "request.handle");
    assert_eq!(delivered[0]["parent_id"], delivered[1]["id"]);
}

#[tokio::test]
async fn test_instrumented_call_nests_under_sync_scope() {
    let (client, sink, registry) = pipeline_fixture();
    let engine = Instrumentor::new(client.clone(), registry.clone());
    engine.enable(all_targets());

    let result: Result<(), HandlerError> = client.trace_sync("request.handle", |_scope| {
        registry
            .invoke("app.retrieval", "Retriever", "fetch", serde_json::json!(null))
            .map(|_| ())
    });
    assert!(result.is_ok());

    client.flush().await;
    let delivered = sink.delivered();
    assert_eq!(delivered[0]["operation"], "app.retrieval.Retriever.fetch");
    assert_eq!(delivered[1]["operation"], "request.handle");
    assert_eq!(delivered[0]["parent_id"], delivered[1]["id"]);
}

#[tokio::test]
async fn test_failed_flush_then_retry_delivers_every_record_once() {
    let sink = Arc::new(MockSink::with_outcomes([false, true]));
    let client = TraceClient::new(sink.clone());
    let registry = HandlerRegistry::new();
    registry.register(
        ModuleBuilder::new("app.retrieval")
            .sync_method("Retriever", "fetch", |input| Ok(input)),
    );

    let engine = Instrumentor::new(client.clone(), registry.clone());
    engine.enable(
        InstrumentTargets::new()
            .prefix("app.retrieval")
            .type_methods("Retriever", ["fetch"]),
    );

    for i in 0..3 {
        registry
            .invoke("app.retrieval", "Retriever", "fetch", serde_json::json!(i))
            .unwrap();
    }

    assert!(!client.flush().await);
    assert!(client.flush().await);

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 3);
    // Every originally-buffered record arrives exactly once, de-dupable by id.
    let mut ids: Vec<&str> = delivered
        .iter()
        .map(|record| record["id"].as_str().unwrap())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_instrumented_tasks_isolated() {
    let (client, sink, registry) = pipeline_fixture();
    let engine = Instrumentor::new(client.clone(), registry.clone());
    engine.enable(all_targets());

    let mut handles = Vec::new();
    for i in 0..2 {
        let client = client.clone();
        let registry = registry.clone();
        handles.push(tokio::spawn(client.clone().scope(async move {
            registry
                .invoke("app.retrieval", "Retriever", "fetch", serde_json::json!(i))
                .unwrap();
        })));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    client.flush().await;
    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 2);
    assert!(delivered[0]["parent_id"].is_null());
    assert!(delivered[1]["parent_id"].is_null());
}

#[tokio::test]
async fn test_handler_error_propagates_span_records_it() {
    let sink = Arc::new(MockSink::new());
    let client = TraceClient::new(sink.clone());
    let registry = HandlerRegistry::new();
    registry.register(ModuleBuilder::new("app.search").sync_method(
        "QueryEngine",
        "query",
        |_| Err(HandlerError::app("index offline")),
    ));

    let engine = Instrumentor::new(client.clone(), registry.clone());
    engine.enable(
        InstrumentTargets::new()
            .prefix("app.search")
            .type_methods("QueryEngine", ["query"]),
    );

    let err = registry
        .invoke("app.search", "QueryEngine", "query", serde_json::json!(null))
        .unwrap_err();
    // The application sees the original error, unchanged.
    assert_eq!(err.to_string(), "index offline");

    client.flush().await;
    let record = &sink.delivered()[0];
    assert_eq!(record["status"], "error");
    assert_eq!(record["error"], "index offline");
}
