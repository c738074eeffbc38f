use serde_json::{json, Value};

use agentshell::stream::parse_event;
use agentshell::{
    EventPayload, FlowState, FlowStateMachine, StepState, StepStateMachine, StreamEvent,
    TaskSession, Transition,
};

fn parse(value: Value) -> StreamEvent {
    parse_event(&value.to_string())
        .expect("valid event")
        .expect("known event")
}

fn event(name: &str) -> StreamEvent {
    parse(json!({"event": name, "taskId": "task-1", "conversationId": "conv-1"}))
}

fn step(name: &str, step_id: &str, content: Value) -> StreamEvent {
    parse(json!({
        "event": name,
        "taskId": "task-1",
        "flow": {"appId": "app-1", "flowId": "flow-1", "stepId": step_id, "stepName": "ls"},
        "content": content,
        "metadata": {"inputTokens": 10, "outputTokens": 4, "timeCost": 0.5},
    }))
}

fn confirmation_flow() -> Vec<StreamEvent> {
    vec![
        event("flow.start"),
        step("step.init", "s1", json!({})),
        step("step.waiting_for_start", "s1", json!({"risk": "low"})),
        event("flow.stop"),
        step("step.input", "s1", json!({})),
        step("step.output", "s1", json!({})),
        event("flow.success"),
    ]
}

#[test]
fn flow_fold_matches_incremental_application() {
    let events = confirmation_flow();
    let payloads: Vec<EventPayload> = events.iter().map(|event| event.payload.clone()).collect();

    let mut machine = FlowStateMachine::new();
    let mut visited = vec![machine.state()];
    for payload in &payloads {
        if let Some(state) = machine.apply(payload).target() {
            visited.push(state);
        }
    }

    assert_eq!(FlowStateMachine::replay(&payloads), machine.state());
    assert_eq!(
        visited,
        vec![
            FlowState::Init,
            FlowState::Running,
            FlowState::Stopped,
            FlowState::Running,
            FlowState::Succeeded,
        ]
    );
}

#[test]
fn heartbeats_never_change_state() {
    let events = confirmation_flow();
    let mut with_heartbeats = Vec::new();
    for event in &events {
        with_heartbeats.push(StreamEvent::heartbeat());
        with_heartbeats.push(event.clone());
    }
    with_heartbeats.push(StreamEvent::heartbeat());

    assert_eq!(
        StepStateMachine::replay(&events),
        StepStateMachine::replay(&with_heartbeats)
    );
    let payloads: Vec<EventPayload> = with_heartbeats
        .iter()
        .map(|event| event.payload.clone())
        .collect();
    assert_eq!(FlowStateMachine::replay(&payloads), FlowState::Succeeded);

    let mut machine = FlowStateMachine::new();
    machine.apply(&EventPayload::FlowStart);
    assert_eq!(machine.apply(&EventPayload::Heartbeat), Transition::Unchanged);
}

#[test]
fn terminal_flow_absorbs_late_events() {
    let mut machine = FlowStateMachine::new();
    machine.apply(&EventPayload::FlowStart);
    machine.apply(&EventPayload::FlowFailed);
    assert_eq!(machine.state(), FlowState::Failed);

    for payload in [
        EventPayload::FlowStart,
        EventPayload::FlowSuccess,
        EventPayload::FlowCancel,
    ] {
        assert_eq!(machine.apply(&payload), Transition::Absorbed);
    }
    assert_eq!(machine.state(), FlowState::Failed);
}

#[test]
fn step_fold_reaches_success() {
    let events = confirmation_flow();
    assert_eq!(StepStateMachine::replay(&events), Some(StepState::Success));

    let mut machine = StepStateMachine::new();
    let transitions: Vec<(Option<StepState>, StepState)> = events
        .iter()
        .filter_map(|event| machine.apply(event))
        .map(|transition| (transition.from, transition.to))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (None, StepState::Init),
            (Some(StepState::Init), StepState::WaitingForStart),
            (Some(StepState::WaitingForStart), StepState::Running),
            (Some(StepState::Running), StepState::Success),
        ]
    );
}

#[test]
fn session_tracks_usage_and_output() {
    let mut session = TaskSession::new("conv-1");
    for event in confirmation_flow() {
        let delta = session.apply(&event);
        assert!(delta.anomaly.is_none());
    }
    let text = parse(json!({"event": "text.add", "taskId": "task-1", "content": {"text": "late"}}));
    let delta = session.apply(&text);

    assert!(delta.anomaly.is_some());
    assert_eq!(session.flow_state(), FlowState::Succeeded);
    assert_eq!(session.task_id(), "task-1");
    assert_eq!(session.app_id(), "app-1");
    assert_eq!(session.text(), "");
    // 四个带元数据的步骤事件
    assert_eq!(session.usage().input_tokens, 40);
    assert_eq!(session.usage().output_tokens, 16);
}

#[test]
fn declined_step_cancels_session() {
    let mut session = TaskSession::new("conv-1");
    for event in [
        event("flow.start"),
        step("step.init", "s1", json!({})),
        step("step.waiting_for_start", "s1", json!({"risk": "medium"})),
        event("flow.stop"),
    ] {
        session.apply(&event);
    }

    let delta = session.apply(&step("step.cancel", "s1", json!({})));
    assert_eq!(
        delta.flow,
        Transition::Changed {
            from: FlowState::Stopped,
            to: FlowState::Cancelled,
        }
    );
    assert!(session.is_terminal());
    assert_eq!(session.step_state(), Some(StepState::Cancelled));
}
