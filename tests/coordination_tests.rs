// End-to-end scenarios across queue, bus, shared state, registry and coordinator

use agent_coord::events::{agent_key, KEY_RESULT, KEY_STATUS, STATUS_COMPLETED};
use agent_coord::{
    AgentConflict, AgentMessage, AgentState, AgentType, Capabilities, ConflictResolution, CoordinatorConfig,
    FnRunner, MessageType, ResolutionStrategy, RunContext, Runtime, RuntimeConfig, Task,
    TaskPriority, TaskQueue,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_queue_serves_highest_priority_first() {
    let queue = TaskQueue::new();
    queue
        .push(Task::new("low").with_priority(TaskPriority::Low))
        .unwrap();
    queue
        .push(Task::new("critical").with_priority(TaskPriority::Critical))
        .unwrap();
    queue
        .push(Task::new("normal").with_priority(TaskPriority::Normal))
        .unwrap();

    let order: Vec<String> = std::iter::from_fn(|| queue.try_pop())
        .map(|t| t.description)
        .collect();
    assert_eq!(order, vec!["critical", "normal", "low"]);
}

#[test]
fn test_blocked_consumer_wakes_on_push_and_shutdown() {
    let queue = Arc::new(TaskQueue::new());

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || queue.pop().map(|t| t.description))
    };
    thread::sleep(Duration::from_millis(20));
    queue.push(Task::new("late")).unwrap();
    assert_eq!(consumer.join().unwrap().as_deref(), Some("late"));

    let waiter = {
        let queue = queue.clone();
        thread::spawn(move || queue.pop().is_none())
    };
    thread::sleep(Duration::from_millis(20));
    queue.shutdown();
    assert!(waiter.join().unwrap());
}

#[test]
fn test_resource_arbitration_with_prompt() {
    let mut config = RuntimeConfig::default();
    config.coordinator.strategy = ResolutionStrategy::PromptUser;
    let runtime = Runtime::with_collaborators(
        config,
        agent_coord::Collaborators {
            prompt_user: Some(Arc::new(
                |_conflict: &AgentConflict, _message: &str, _options: &[&str]| 2,
            )),
            ..Default::default()
        },
    );
    let coordinator = runtime.coordinator();

    assert!(coordinator.request_resource("writer-a", "file.txt", "write"));
    assert!(!coordinator.request_resource("writer-b", "file.txt", "write"));

    let conflict = coordinator.detect_conflict().unwrap();
    assert_eq!(conflict.agent1_id, "writer-a");
    assert_eq!(
        coordinator.resolve_conflict(&conflict.id).unwrap(),
        ConflictResolution::Sequential
    );

    // writer-b queued behind writer-a
    assert!(coordinator.release_resource("writer-a", "file.txt"));
    assert_eq!(
        coordinator.resource_owner("file.txt").as_deref(),
        Some("writer-b")
    );

    let inbox: Vec<MessageType> = std::iter::from_fn(|| runtime.bus().try_receive("writer-b"))
        .map(|m| m.message_type)
        .collect();
    assert!(inbox.contains(&MessageType::ResourceConflict));
    assert!(inbox.contains(&MessageType::ResourceRelease));
    runtime.shutdown();
}

#[test]
fn test_first_wins_keeps_holder() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let coordinator = agent_coord::AgentCoordinator::new(
        runtime.registry().clone(),
        runtime.bus().clone(),
        runtime.shared_state().clone(),
        runtime.queue().clone(),
        CoordinatorConfig::default().with_strategy(ResolutionStrategy::FirstWins),
    );

    coordinator.request_resource("a", "db", "migrate");
    coordinator.request_resource("b", "db", "migrate");
    let conflict = coordinator.detect_conflict().unwrap();
    coordinator.resolve_conflict(&conflict.id).unwrap();

    assert_eq!(coordinator.resource_owner("db").as_deref(), Some("a"));
    assert_eq!(coordinator.unresolved_count(), 0);
}

#[test]
fn test_async_agents_publish_results() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let registry = runtime.registry();

    let agents: Vec<_> = (0..3)
        .map(|i| {
            let agent = registry
                .create_custom(
                    &format!("worker-{}", i),
                    Box::new(FnRunner::new(|task: &str, ctx: &RunContext| {
                        ctx.report_progress(50, "halfway");
                        thread::sleep(Duration::from_millis(10));
                        Ok(format!("{} done", task))
                    })),
                    Capabilities::EXECUTE,
                )
                .unwrap();
            agent.start().unwrap();
            agent
        })
        .collect();

    for (i, agent) in agents.iter().enumerate() {
        agent.run_async(format!("job {}", i)).unwrap();
    }
    assert!(registry.wait_all(Some(Duration::from_secs(5))));

    let shared = runtime.shared_state();
    for (i, agent) in agents.iter().enumerate() {
        assert_eq!(agent.state(), AgentState::Idle);
        assert_eq!(
            shared.get(&agent_key(agent.name(), KEY_STATUS)).as_deref(),
            Some(STATUS_COMPLETED)
        );
        assert_eq!(
            shared.get(&agent_key(agent.name(), KEY_RESULT)),
            Some(format!("job {} done", i))
        );
        agent.complete().unwrap();
    }

    let summary = runtime.coordinator().aggregate_results(&agents);
    assert_eq!(summary.success_count, 3);
    assert!(summary.all_succeeded());
    assert!(summary.combined_output.contains("[worker-2]:\njob 2 done"));
    runtime.shutdown();
}

#[test]
fn test_request_reply_between_threads() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let bus = runtime.bus().clone();
    bus.register("planner");
    bus.register("builder");

    let responder = {
        let bus = bus.clone();
        thread::spawn(move || {
            let request = bus
                .receive_with_timeout("builder", 2000)
                .expect("request should arrive");
            let reply = AgentMessage::create_response(&request, "built ok");
            bus.send(reply).unwrap();
        })
    };

    // Unrelated traffic in the requester's inbox must survive the request
    let noise =
        AgentMessage::new(MessageType::StatusUpdate, "builder", "planner").with_payload("noise");
    bus.send(noise).unwrap();

    let request = AgentMessage::new(MessageType::TaskRequest, "planner", "builder")
        .with_payload("build it");
    let reply = bus.request(request, 2000).unwrap();
    responder.join().unwrap();

    assert_eq!(reply.message_type, MessageType::TaskResponse);
    assert_eq!(reply.payload, "built ok");
    assert_eq!(bus.pending_count("planner"), 1);
    runtime.shutdown();
}

#[test]
fn test_dispatch_matches_capabilities() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let builder = runtime
        .registry()
        .create_custom(
            "builder",
            Box::new(FnRunner::new(|task: &str, _ctx: &RunContext| {
                Ok(format!("built {}", task))
            })),
            Capabilities::BUILD,
        )
        .unwrap();
    builder.start().unwrap();

    let queue = runtime.queue();
    queue
        .push(Task::new("lint").with_capabilities(Capabilities::ANALYZE))
        .unwrap();
    queue
        .push(Task::new("crate").with_capabilities(Capabilities::BUILD))
        .unwrap();

    assert_eq!(runtime.coordinator().dispatch(), 1);
    assert!(runtime.coordinator().wait_all(Some(Duration::from_secs(5))));

    let finished = runtime.coordinator().take_finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].result.as_deref(), Some("built crate"));
    assert_eq!(queue.len(), 1);
    assert_eq!(builder.stats().tasks_completed, 1);
    runtime.shutdown();
}

#[test]
fn test_spawned_workers_terminate_with_parent() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let lead = runtime
        .registry()
        .create("lead", AgentType::Coordinator)
        .unwrap();
    lead.start().unwrap();

    let mut task = Task::new("split work");
    task.mark_assigned(lead.id());
    let workers = runtime.coordinator().spawn_workers(&task, 3).unwrap();
    assert_eq!(lead.children().len(), 3);

    assert!(lead.terminate());
    assert!(workers
        .iter()
        .all(|w| w.state() == AgentState::Terminated));

    let result = runtime.shutdown();
    assert_eq!(result.agents_stopped, 0);
}
