use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use strand_core::event::WorkflowEvent;
use strand_core::io::{StepInput, StepOutput};
use strand_flow::{
    Backoff, Choices, Condition, Loop, Parallel, Router, RunRequest, Sequence, Step, Task, Workflow,
};
use strand_test_utils::{FailingAgent, FlakyAgent, MockAgent};

async fn events_of(sequence: Sequence, message: &str) -> Vec<WorkflowEvent> {
    let wf = Arc::new(Workflow::new("props").with_sequence(sequence));
    wf.run_stream(RunRequest::new(message))
        .await
        .expect("sequence resolves")
        .collect()
        .await
}

fn completed_names(events: &[WorkflowEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::TaskCompleted(t) => Some(t.task_name.clone()),
            _ => None,
        })
        .collect()
}

fn text_step(name: &'static str, text: &'static str) -> Step {
    Task::from_fn(name, move |_: &StepInput| text).into()
}

#[tokio::test]
async fn tasks_run_and_report_in_order() {
    let counter = Arc::new(AtomicUsize::new(0));
    let steps: Vec<Step> = (0..4)
        .map(|i| {
            let counter = Arc::clone(&counter);
            Task::from_fn(format!("t{}", i), move |_: &StepInput| {
                (counter.fetch_add(1, Ordering::SeqCst) + 1).to_string()
            })
            .into()
        })
        .collect();

    let events = events_of(Sequence::new("main", steps), "go").await;

    let task_events: Vec<(String, &str)> = events
        .iter()
        .filter_map(|e| e.task_name().map(|n| (n.to_string(), e.kind())))
        .collect();
    let expected: Vec<(String, &str)> = (0..4)
        .flat_map(|i| {
            [
                (format!("t{}", i), "TaskStarted"),
                (format!("t{}", i), "TaskCompleted"),
            ]
        })
        .collect();
    assert_eq!(task_events, expected);

    let contents: Vec<Option<String>> = events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::TaskCompleted(t) => Some(t.content.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        contents,
        vec![
            Some("1".to_string()),
            Some("2".to_string()),
            Some("3".to_string()),
            Some("4".to_string())
        ]
    );
}

#[tokio::test]
async fn adjacent_tasks_chain_under_every_alias() {
    let sequence = Sequence::new(
        "main",
        vec![
            text_step("a", "X"),
            Task::from_fn("b", |i: &StepInput| {
                let p = &i.previous_outputs;
                [p.get_str("a"), p.get_str("output"), p.get_str("result")]
                    .iter()
                    .map(|v| v.unwrap_or("-"))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .into(),
        ],
    );

    let wf = Workflow::new("props").with_sequence(sequence);
    let response = wf.run(RunRequest::new("go")).await.unwrap();
    assert_eq!(response.content.as_deref(), Some("X,X,X"));
}

#[tokio::test(start_paused = true)]
async fn flaky_executor_retries_with_one_delay_per_failure() {
    let agent = Arc::new(FlakyAgent::new("flaky", 2));
    let task = Task::agent("fetch", agent.clone())
        .with_max_retries(3)
        .with_backoff(Backoff::Fixed(Duration::from_secs(1)));
    let wf = Workflow::new("props").with_sequence(Sequence::new("main", vec![task.into()]));

    let started = tokio::time::Instant::now();
    let response = wf.run(RunRequest::new("x")).await.unwrap();

    assert!(response.task_responses[0].success);
    assert_eq!(agent.calls(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test]
async fn always_failing_executor_exhausts_after_four_attempts() {
    let agent = Arc::new(FailingAgent::new("broken", "down"));
    let task = Task::agent("fetch", agent.clone()).with_max_retries(3);
    let sequence = Sequence::new("main", vec![task.into()]);

    let events = events_of(sequence, "x").await;
    assert_eq!(agent.calls(), 4);
    assert_eq!(events.last().map(|e| e.kind()), Some("WorkflowError"));
    assert!(completed_names(&events).is_empty());
}

#[tokio::test]
async fn loop_stops_at_max_iterations() {
    let calls = Arc::new(AtomicUsize::new(0));
    let body_calls = Arc::clone(&calls);
    let lp = Loop::new(
        "refine",
        vec![Task::from_fn("draft", move |_: &StepInput| {
            body_calls.fetch_add(1, Ordering::SeqCst);
            "no luck"
        })
        .into()],
        3,
    )
    .with_end_condition(|outputs: &[StepOutput]| {
        outputs
            .last()
            .and_then(|o| o.content.as_deref())
            .is_some_and(|c| c.contains('X'))
    });

    let wf = Workflow::new("props").with_sequence(Sequence::new("main", vec![lp.into()]));
    wf.run(RunRequest::new("x")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn false_condition_contributes_no_completions() {
    let sequence = Sequence::new(
        "main",
        vec![
            text_step("first", "1"),
            Condition::new(
                "gate",
                |_| false,
                vec![text_step("hidden_a", "a"), text_step("hidden_b", "b")],
            )
            .into(),
            Task::from_fn("last", |i: &StepInput| {
                format!("after {}", i.previous_step_content.as_deref().unwrap_or("-"))
            })
            .into(),
        ],
    );

    let events = events_of(sequence, "x").await;
    assert_eq!(completed_names(&events), vec!["first", "last"]);

    let Some(WorkflowEvent::WorkflowCompleted(done)) = events.last() else {
        panic!("run did not complete");
    };
    assert_eq!(done.content.as_deref(), Some("after 1"));
    assert_eq!(done.extra_data.total_tasks, 2);
}

#[tokio::test]
async fn parallel_results_follow_branch_order() {
    let slow = Arc::new(MockAgent::new("a").with_delay(Duration::from_millis(40)));
    let fast = Arc::new(MockAgent::new("b"));
    let parallel = Parallel::new(
        "both",
        vec![
            Task::agent("branch_a", slow).into(),
            Task::agent("branch_b", fast).into(),
        ],
    );

    let wf = Workflow::new("props").with_sequence(Sequence::new("main", vec![parallel.into()]));
    let response = wf.run(RunRequest::new("q")).await.unwrap();

    let results = &response.task_responses[0].children;
    assert_eq!(results[0].content.as_deref(), Some("a: q"));
    assert_eq!(results[1].content.as_deref(), Some("b: q"));
}

#[tokio::test]
async fn research_then_analysis_end_to_end() {
    let sequence = Sequence::new(
        "research_flow",
        vec![
            Task::from_fn("research_step", |i: &StepInput| {
                format!("Research: {}", i.message_as_string())
            })
            .into(),
            Task::from_fn("analysis_step", |i: &StepInput| {
                format!(
                    "Analysis of research: {}",
                    i.previous_step_content.as_deref().unwrap_or("")
                )
            })
            .into(),
        ],
    );

    let wf = Workflow::new("props").with_sequence(sequence);
    let response = wf.run(RunRequest::new("AI trends")).await.unwrap();
    assert_eq!(
        response.content.as_deref(),
        Some("Analysis of research: Research: AI trends")
    );
}

#[tokio::test]
async fn router_output_feeds_later_steps() {
    let router = Router::new(
        "pick",
        vec![text_step("tech", "tech notes"), text_step("general", "general notes")],
        |input: &StepInput, choices: &Choices| {
            let name = if input.message_as_string().contains("rust") {
                "tech"
            } else {
                "general"
            };
            choices.by_name(name).into_iter().collect()
        },
    );
    let sequence = Sequence::new(
        "main",
        vec![
            router.into(),
            Task::from_fn("publish", |i: &StepInput| {
                format!(
                    "{} / {}",
                    i.previous_outputs.get_str("pick").unwrap_or("-"),
                    i.previous_outputs.get_str("tech").unwrap_or("-")
                )
            })
            .into(),
        ],
    );

    let wf = Workflow::new("props").with_sequence(sequence);
    let response = wf.run(RunRequest::new("rust news")).await.unwrap();
    assert_eq!(response.content.as_deref(), Some("tech notes / tech notes"));
}

#[tokio::test]
async fn nested_failure_reports_each_level() {
    let inner = Sequence::new(
        "inner",
        vec![Task::function("explode", |_: StepInput| async { Err::<String, _>("kaboom") })
            .with_max_retries(0)
            .into()],
    );
    let outer = Sequence::new("main", vec![text_step("ok", "fine"), inner.into()]);

    let events = events_of(outer, "x").await;
    let errored: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::TaskError(t) => Some(t.task_name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(errored, vec!["explode", "inner"]);
    let Some(WorkflowEvent::WorkflowError(err)) = events.last() else {
        panic!("run did not fail");
    };
    assert!(err.error.contains("kaboom"));
}
