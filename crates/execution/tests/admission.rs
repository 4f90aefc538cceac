//! Submission-time validation: nothing is admitted unless everything is.

mod common;

use common::{config, engine, wait_final, ScriptedRunner};
use std::sync::Arc;
use taskmill_core::{ExecutionFilter, ExecutionId, ExecutionStatus, TaskId, TaskSpec};
use taskmill_execution::{EngineError, GraphNode, TaskGraph};

fn node(task: &str) -> GraphNode {
    GraphNode::new(TaskSpec::new(task, "build"))
}

#[tokio::test(start_paused = true)]
async fn test_graph_with_self_cycle_is_rejected_atomically() {
    let engine = engine(config(), ScriptedRunner::new());
    let mut events = engine.subscribe();

    let graph = TaskGraph::new()
        .node(node("A"))
        .node(node("B").after("A"))
        .node(node("C").after("B").after("C"));

    let err = engine.schedule_graph(graph).await.unwrap_err();
    match err {
        EngineError::DependencyCycle { members } => assert_eq!(members, vec!["C".to_string()]),
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(engine.get_stats().await.total, 0);
    assert!(engine.list_executions(&ExecutionFilter::default()).await.is_empty());
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_graph_with_longer_cycle_names_members() {
    let engine = engine(config(), ScriptedRunner::new());
    let graph = TaskGraph::new()
        .node(node("fetch").after("publish"))
        .node(node("build").after("fetch"))
        .node(node("publish").after("build"))
        .node(node("docs"));

    let err = engine.schedule_graph(graph).await.unwrap_err();
    let EngineError::DependencyCycle { mut members } = err else {
        panic!("expected a cycle error");
    };
    members.sort();
    assert_eq!(members, vec!["build", "fetch", "publish"]);
    assert_eq!(engine.get_stats().await.total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_graph_rejects_duplicates_and_unknown_tasks() {
    let engine = engine(config(), ScriptedRunner::new());

    let duplicate = TaskGraph::new().node(node("A")).node(node("A"));
    assert!(matches!(
        engine.schedule_graph(duplicate).await,
        Err(EngineError::DuplicateTask(task)) if task == TaskId::from("A")
    ));

    let dangling = TaskGraph::new().node(node("A")).node(node("B").after("missing"));
    assert!(matches!(
        engine.schedule_graph(dangling).await,
        Err(EngineError::UnknownDependency { .. })
    ));

    assert_eq!(engine.get_stats().await.total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_graph_runs_in_dependency_order() {
    let runner = ScriptedRunner::new();
    let engine = Arc::new(engine(config(), runner.clone()));
    engine.start();

    let graph = TaskGraph::new()
        .node(node("deploy").after("test").after("build"))
        .node(node("test").after("build"))
        .node(node("build"))
        .node(node("lint"));
    let ids = engine.schedule_graph(graph).await.unwrap();
    assert_eq!(ids.len(), 4);

    let deploy = wait_final(&engine, ids[&TaskId::from("deploy")]).await;
    assert_eq!(deploy.status, ExecutionStatus::Completed);
    assert_eq!(deploy.dependencies.len(), 2);

    let started = runner.started();
    let position = |task: &str| started.iter().position(|t| t == task).unwrap();
    assert!(position("build") < position("test"));
    assert!(position("test") < position("deploy"));
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_unknown_execution_dependency_is_rejected() {
    let engine = engine(config(), ScriptedRunner::new());

    let err = engine
        .schedule_task(TaskSpec::new("A", "build").depends_on(ExecutionId::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownDependency { .. }));

    let ok = engine.schedule_task(TaskSpec::new("B", "build")).await.unwrap();
    let batch = engine
        .schedule_batch(vec![
            TaskSpec::new("C", "build").depends_on(ok),
            TaskSpec::new("D", "build").depends_on(ExecutionId::new()),
        ])
        .await;
    assert!(batch.is_err());
    assert_eq!(engine.get_stats().await.total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_batch_returns_ids_in_order_and_emits_pending() {
    let engine = engine(config(), ScriptedRunner::new());
    let mut events = engine.subscribe();

    let ids = engine
        .schedule_batch(vec![
            TaskSpec::new("one", "build"),
            TaskSpec::new("two", "build"),
        ])
        .await
        .unwrap();

    assert_eq!(engine.get_execution(ids[0]).await.unwrap().task_id, TaskId::from("one"));
    assert_eq!(engine.get_execution(ids[1]).await.unwrap().task_id, TaskId::from("two"));

    for id in &ids {
        let event = events.recv().await.unwrap();
        assert_eq!(event.execution_id, *id);
        assert_eq!(event.status, ExecutionStatus::Pending);
        assert_eq!(event.previous, None);
    }
}
