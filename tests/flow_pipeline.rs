//! End-to-end flow behavior against the mock connector: batching, rollback
//! accounting, the pipe join and chain termination.

mod common;

use std::sync::atomic::Ordering;

use serde_json::json;

use common::{mock_connect, test_services, test_services_with_config, MockState};
use sluice_core::config::EngineConfig;
use sluice_core::context::Context;
use sluice_core::error::SluiceError;
use sluice_core::flow::Flow;

#[tokio::test]
async fn create_pushes_full_batches_then_the_remainder() {
    let state = MockState::with_rows(5);
    let (services, _meta) = test_services(state.clone());

    let definition = json!({
        "ENTRY": "SRC",
        "MODULE": {
            "SRC": { "ACTION": "READ", "CONNECT": mock_connect(), "CALL": "DST" },
            "DST": { "ACTION": "CREATE", "CONNECT": mock_connect(), "BATCHSIZE": 2, "TARGET": "OUT" },
        },
    });

    let mut flow = Flow::prepare("IF_BATCH", &definition, &Context::new(), None).unwrap();
    flow.process(&services).await.unwrap();

    assert_eq!(*state.created_batches.lock(), vec![2, 2, 1]);
    assert_eq!(state.sent.load(Ordering::Relaxed), 5);
    assert_eq!(flow.result.as_deref(), Some("success"));
}

#[tokio::test]
async fn failed_push_rolls_back_and_reports_the_failing_position() {
    let state = MockState::with_rows(5);
    *state.fail_at.lock() = Some(3);
    let (services, _meta) = test_services(state.clone());

    let definition = json!({
        "ENTRY": "SRC",
        "MODULE": {
            "SRC": { "ACTION": "READ", "CONNECT": mock_connect(), "CALL": "DST" },
            "DST": { "ACTION": "CREATE", "CONNECT": mock_connect(), "BATCHSIZE": 2, "TARGET": "OUT" },
        },
    });

    let mut flow = Flow::prepare("IF_ROLLBACK", &definition, &Context::new(), None).unwrap();
    let err = flow.process(&services).await.unwrap_err();

    assert_eq!(err.error_position(), Some(3));
    // the batch before the failure went out, then the rollback zeroed the count
    assert_eq!(*state.created_batches.lock(), vec![2]);
    assert_eq!(state.sent.load(Ordering::Relaxed), 0);
    assert_eq!(flow.result.as_deref(), Some("fail"));
}

#[tokio::test]
async fn pipe_moves_buffers_from_reader_to_writer() {
    let state = MockState::with_rows(10);
    let (services, _meta) = test_services(state.clone());

    let definition = json!({
        "ENTRY": "SRC",
        "MODULE": {
            "SRC": { "ACTION": "READ", "CONNECT": mock_connect(), "PIPE": "DST", "BUFFERSIZE": 3 },
            "DST": { "ACTION": "CREATE", "CONNECT": mock_connect(), "BATCHSIZE": 3, "TARGET": "OUT" },
        },
    });

    let mut flow = Flow::prepare("IF_PIPE", &definition, &Context::new(), None).unwrap();
    flow.process(&services).await.unwrap();

    let batches = state.created_batches.lock().clone();
    assert_eq!(batches, vec![3, 3, 3, 1]);
    assert_eq!(batches.iter().sum::<usize>(), 10);
    assert_eq!(state.sent.load(Ordering::Relaxed), 10);
}

#[tokio::test]
async fn pipe_requires_a_read_to_create_join() {
    let state = MockState::with_rows(1);
    let (services, _meta) = test_services(state);

    let definition = json!({
        "ENTRY": "A",
        "MODULE": {
            "A": { "ACTION": "CHECK", "CONNECT": mock_connect(), "PIPE": "B", "TARGET": "X" },
            "B": { "ACTION": "CREATE", "CONNECT": mock_connect(), "TARGET": "OUT" },
        },
    });

    let mut flow = Flow::prepare("IF_BAD_PIPE", &definition, &Context::new(), None).unwrap();
    let err = flow.process(&services).await.unwrap_err();
    assert!(matches!(err, SluiceError::Logic(_)));
}

#[tokio::test]
async fn bypass_read_ends_the_chain_with_a_result_stream() {
    let state = MockState::with_rows(4);
    let (services, _meta) = test_services(state);

    let definition = json!({
        "ENTRY": "SRC",
        "MODULE": {
            "SRC": { "ACTION": "READ", "CONNECT": mock_connect(), "RESULT": "BYPASS" },
        },
    });

    let mut flow = Flow::prepare("IF_BYPASS", &definition, &Context::new(), None).unwrap();
    let stream = flow.process(&services).await.unwrap().unwrap();

    let snapshot = stream.snapshot().unwrap();
    assert_eq!(snapshot["ITEMS"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn runaway_chain_is_cut_by_the_step_cap() {
    let state = MockState::with_rows(1);
    let config = EngineConfig {
        max_steps: Some(3),
        ..EngineConfig::default()
    };
    let (services, _meta) = test_services_with_config(state, config);

    let definition = json!({
        "ENTRY": "LOOP",
        "MODULE": {
            "LOOP": { "ACTION": "CHECK", "CONNECT": mock_connect(), "CALL": "LOOP", "TARGET": "X" },
        },
    });

    let mut flow = Flow::prepare("IF_LOOP", &definition, &Context::new(), None).unwrap();
    let err = flow.process(&services).await.unwrap_err();
    assert!(matches!(err, SluiceError::Logic(_)));
}

#[tokio::test]
async fn count_action_stores_the_count_as_the_module_message() {
    let state = MockState::with_rows(7);
    let (services, _meta) = test_services(state);

    let definition = json!({
        "ENTRY": "CNT",
        "MODULE": {
            "CNT": { "ACTION": "COUNT", "CONNECT": mock_connect(), "TARGET": "X" },
        },
    });

    let mut flow = Flow::prepare("IF_COUNT", &definition, &Context::new(), None).unwrap();
    let stream = flow.process(&services).await.unwrap();
    assert!(stream.is_none());
    assert_eq!(flow.result.as_deref(), Some("success"));
}
