//! End-to-end coordination tests over the turn pipeline

mod helpers;

use helpers::{
    harness, harness_with, harness_with_summarizer, test_config, CountingSummarizer,
    RecordingAssistants,
};
use kinmate_common::events::CompanionEvent;
use kinmate_common::store::{MemoryStore, SqliteStore};
use kinmate_common::{Error, Store};
use kinmate_cs::pipeline::{FAILURE_REPLY, PARTIAL_ACK, PROCESSING_REPLY};
use kinmate_cs::{TurnRequest, TurnStatus};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_identical_requests_record_one_round() {
    let h = harness();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let service = Arc::clone(&h.service);
        handles.push(tokio::spawn(async move {
            service
                .handle_turn(TurnRequest::text("grandma", "I took my pills").with_request_id("req-1"))
                .await
                .unwrap()
        }));
    }

    let mut duplicates = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.request_id.as_deref(), Some("req-1"));
        duplicates += outcome.duplicate as usize;
    }

    assert_eq!(duplicates, 9);
    assert_eq!(h.service.history().len("grandma").await.unwrap(), 1);
}

#[tokio::test]
async fn test_derived_request_id_deduplicates_retries() {
    let h = harness();
    let first = h
        .service
        .handle_turn(TurnRequest::text("grandma", "good morning"))
        .await
        .unwrap();
    let retry = h
        .service
        .handle_turn(TurnRequest::text("grandma", "good morning").with_request_id(first.request_id.clone().unwrap()))
        .await
        .unwrap();

    assert!(!first.duplicate);
    assert!(retry.duplicate);
    assert_eq!(h.service.history().len("grandma").await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_final_fragments_have_one_owner() {
    let h = harness_with(
        test_config(),
        Arc::new(MemoryStore::new()),
        RecordingAssistants::with_delay(Duration::from_millis(50)),
    );

    let mut handles = Vec::new();
    for _ in 0..6 {
        let service = Arc::clone(&h.service);
        handles.push(tokio::spawn(async move {
            service
                .handle_turn(TurnRequest::final_fragment("grandpa", "audio-7", "my back hurts"))
                .await
                .unwrap()
        }));
    }

    let mut completed = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        match outcome.status {
            TurnStatus::Completed => {
                completed += 1;
                assert_eq!(outcome.reply, "reply to my back hurts");
            }
            TurnStatus::Processing => assert_eq!(outcome.reply, PROCESSING_REPLY),
            TurnStatus::Cached => assert_eq!(outcome.reply, "reply to my back hurts"),
            other => panic!("unexpected status {:?}", other),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(h.assistants.calls(), 1);
    assert_eq!(h.service.history().len("grandpa").await.unwrap(), 1);

    // Late arrivals read the owner's reply
    let late = h
        .service
        .handle_turn(TurnRequest::final_fragment("grandpa", "audio-7", "my back hurts"))
        .await
        .unwrap();
    assert_eq!(late.status, TurnStatus::Cached);
    assert_eq!(late.reply, "reply to my back hurts");
    assert_eq!(h.assistants.calls(), 1);
}

#[tokio::test]
async fn test_partials_are_merged_with_final_fragment() {
    let h = harness();

    for fragment in ["frag1", "frag2", "frag3"] {
        let outcome = h
            .service
            .handle_turn(TurnRequest::partial("grandma", "a1", fragment))
            .await
            .unwrap();
        assert_eq!(outcome.status, TurnStatus::Partial);
        assert_eq!(outcome.reply, PARTIAL_ACK);
    }
    assert_eq!(h.assistants.calls(), 0, "partials never reach the assistant");

    let outcome = h
        .service
        .handle_turn(TurnRequest::final_fragment("grandma", "a1", "final"))
        .await
        .unwrap();
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(h.assistants.inputs(), vec!["frag1 frag2 frag3 final"]);

    let rounds = h.service.history().all("grandma").await.unwrap();
    assert_eq!(rounds.len(), 1);
    assert_eq!(rounds[0].input, "frag1 frag2 frag3 final");
}

#[tokio::test]
async fn test_retried_empty_final_reads_cached_reply() {
    let h = harness();
    for fragment in ["frag1", "frag2"] {
        h.service
            .handle_turn(TurnRequest::partial("grandma", "a1", fragment))
            .await
            .unwrap();
    }

    let first = h
        .service
        .handle_turn(TurnRequest::final_fragment("grandma", "a1", ""))
        .await
        .unwrap();
    assert_eq!(first.status, TurnStatus::Completed);
    assert_eq!(first.reply, "reply to frag1 frag2");

    let retry = h
        .service
        .handle_turn(TurnRequest::final_fragment("grandma", "a1", ""))
        .await
        .unwrap();
    assert_eq!(retry.status, TurnStatus::Cached);
    assert_eq!(retry.reply, "reply to frag1 frag2");
    assert_eq!(h.assistants.calls(), 1);
    assert_eq!(h.service.history().len("grandma").await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_empty_finals_never_error() {
    let h = harness_with(
        test_config(),
        Arc::new(MemoryStore::new()),
        RecordingAssistants::with_delay(Duration::from_millis(50)),
    );
    h.service
        .handle_turn(TurnRequest::partial("grandpa", "a9", "is it raining"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let service = Arc::clone(&h.service);
        handles.push(tokio::spawn(async move {
            service
                .handle_turn(TurnRequest::final_fragment("grandpa", "a9", ""))
                .await
        }));
    }

    let mut completed = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        match outcome.status {
            TurnStatus::Completed => completed += 1,
            TurnStatus::Processing => assert_eq!(outcome.reply, PROCESSING_REPLY),
            TurnStatus::Cached => assert_eq!(outcome.reply, "reply to is it raining"),
            other => panic!("unexpected status {:?}", other),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(h.assistants.inputs(), vec!["is it raining"]);
}

#[tokio::test]
async fn test_summary_checkpoint_advances_per_chunk() {
    let h = harness();

    for i in 0..4 {
        h.service
            .handle_turn(TurnRequest::text("grandma", format!("message {}", i)))
            .await
            .unwrap();
    }
    assert_eq!(h.summarizer.calls(), 0);
    assert_eq!(h.service.history().summary("grandma").await.unwrap().rounds, 0);

    h.service
        .handle_turn(TurnRequest::text("grandma", "message 4"))
        .await
        .unwrap();
    let summary = h.service.history().summary("grandma").await.unwrap();
    assert_eq!(summary.rounds, 5);
    assert_eq!(summary.text, "summary 0..5");

    for i in 5..10 {
        h.service
            .handle_turn(TurnRequest::text("grandma", format!("message {}", i)))
            .await
            .unwrap();
    }
    let summary = h.service.history().summary("grandma").await.unwrap();
    assert_eq!(summary.rounds, 10);
    assert_eq!(summary.text, "summary 0..5\n\nsummary 5..10");
    assert_eq!(h.summarizer.calls(), 2);
}

#[tokio::test]
async fn test_self_harm_block_raises_one_high_alert() {
    let h = harness();
    let mut rx = h.events.subscribe();

    let outcome = h
        .service
        .handle_turn(TurnRequest::text("grandma", "我不想活了，想自殺"))
        .await
        .unwrap();

    assert_eq!(outcome.status, TurnStatus::Blocked);
    assert!(outcome.reply.starts_with("System intercepted: "));
    assert!(outcome.reply.contains("自殺"));
    assert_eq!(h.assistants.calls(), 0);
    assert_eq!(h.service.history().len("grandma").await.unwrap(), 0);

    let alerts = h.store.stream_range("alerts:stream").await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].field("severity"), Some("high"));
    assert_eq!(alerts[0].field("user_id"), Some("grandma"));

    let raised = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|e| matches!(e, CompanionEvent::AlertRaised { .. }))
        .count();
    assert_eq!(raised, 1);
}

#[tokio::test]
async fn test_block_without_self_harm_keyword_raises_no_alert() {
    let h = harness();

    let outcome = h
        .service
        .handle_turn(TurnRequest::text("grandma", "the neighbour talked about a bomb"))
        .await
        .unwrap();

    assert_eq!(outcome.status, TurnStatus::Blocked);
    assert!(h.store.stream_range("alerts:stream").await.unwrap().is_empty());
    assert!(h.service.alerts().pop_all("grandma").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_collaborator_failure_caches_failure_reply() {
    let h = harness_with(
        test_config(),
        Arc::new(MemoryStore::new()),
        RecordingAssistants::failing(),
    );

    let err = h
        .service
        .handle_turn(TurnRequest::final_fragment("grandpa", "a1", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Collaborator(_)));
    assert_eq!(h.service.history().len("grandpa").await.unwrap(), 0);

    let retry = h
        .service
        .handle_turn(TurnRequest::final_fragment("grandpa", "a1", "hello"))
        .await
        .unwrap();
    assert_eq!(retry.status, TurnStatus::Cached);
    assert_eq!(retry.reply, FAILURE_REPLY);
    assert_eq!(h.assistants.calls(), 1);
}

#[tokio::test]
async fn test_invalid_turns_are_rejected() {
    let h = harness();

    let cases = [
        TurnRequest::text("  ", "hello"),
        TurnRequest::text("grandma", "   "),
        TurnRequest::final_fragment("grandma", "a1", ""),
        TurnRequest {
            is_final: false,
            ..TurnRequest::text("grandma", "fragment without a unit")
        },
    ];
    for request in cases {
        let result = h.service.handle_turn(request.clone()).await;
        assert!(
            matches!(result, Err(Error::InvalidInput(_))),
            "expected invalid input for {:?}",
            request
        );
    }
    assert_eq!(h.assistants.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_is_summarized_and_purged() {
    let h = harness();
    let mut rx = h.events.subscribe();

    for i in 0..3 {
        h.service
            .handle_turn(TurnRequest::text("grandma", format!("message {}", i)))
            .await
            .unwrap();
    }
    assert!(h.service.sessions().is_active("grandma").await);

    tokio::time::sleep(Duration::from_secs(310)).await;

    assert!(!h.service.sessions().is_active("grandma").await);
    assert!(h.service.registry().is_empty().await);
    assert_eq!(h.service.history().len("grandma").await.unwrap(), 0);

    let finalized: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            CompanionEvent::SessionFinalized { summary, .. } => Some(summary),
            _ => None,
        })
        .collect();
    assert_eq!(finalized, vec!["summary 0..3".to_string()]);

    // A finalized session is never finalized again
    tokio::time::sleep(Duration::from_secs(1000)).await;
    assert_eq!(h.summarizer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_turn_during_idle_finalize_joins_next_session() {
    let h = harness_with_summarizer(
        test_config(),
        Arc::new(MemoryStore::new()),
        RecordingAssistants::new(),
        CountingSummarizer::with_delay(Duration::from_secs(10)),
    );
    let mut rx = h.events.subscribe();

    h.service
        .handle_turn(TurnRequest::text("grandma", "first visit"))
        .await
        .unwrap();

    // Watchdog fires at 305 s; the flush is still summarizing at 307 s
    tokio::time::sleep(Duration::from_secs(307)).await;
    assert!(!h.service.sessions().is_active("grandma").await);

    let service = Arc::clone(&h.service);
    let second = tokio::spawn(async move {
        service
            .handle_turn(TurnRequest::text("grandma", "second visit"))
            .await
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(second.status, TurnStatus::Completed);
    assert!(!second.duplicate);

    let rounds = h.service.history().all("grandma").await.unwrap();
    assert_eq!(rounds.len(), 1);
    assert_eq!(rounds[0].input, "second visit");

    assert!(h.service.sessions().is_active("grandma").await);
    assert_eq!(h.service.registry().len().await, 1);
    assert_eq!(h.assistants.created(), 2);

    let finalized: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            CompanionEvent::SessionFinalized { summary, .. } => Some(summary),
            _ => None,
        })
        .collect();
    assert_eq!(finalized, vec!["summary 0..1".to_string()]);
}

#[tokio::test]
async fn test_services_sharing_sqlite_store_record_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kinmate.db");

    let store_a: Arc<dyn Store> = Arc::new(SqliteStore::open(&path).await.unwrap());
    let store_b: Arc<dyn Store> = Arc::new(SqliteStore::open(&path).await.unwrap());
    let a = harness_with(test_config(), store_a, RecordingAssistants::new());
    let b = harness_with(test_config(), store_b, RecordingAssistants::new());

    let request = TurnRequest::text("grandma", "hello").with_request_id("shared-1");
    let (ra, rb) = tokio::join!(
        a.service.handle_turn(request.clone()),
        b.service.handle_turn(request)
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.duplicate as usize + rb.duplicate as usize, 1);
    assert_eq!(a.service.history().len("grandma").await.unwrap(), 1);
    assert_eq!(b.service.history().all("grandma").await.unwrap()[0].request_id, "shared-1");
}
