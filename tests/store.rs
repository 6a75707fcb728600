//! Persistence integration tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use haven::conversation::{Role, SessionEvent, SessionOutcome};
use haven::store::{self, LimitsProvider, PlanTier, SessionStore, SqliteLimits, SqliteSessionStore};

mod common;

use common::{Harness, Utterance, drive, end_on_listening, setup_test_db};

#[tokio::test(start_paused = true)]
async fn test_session_persisted_and_counted() {
    let pool = setup_test_db();
    let sessions = SqliteSessionStore::new(pool.clone());
    let limits = SqliteLimits::new(pool, PlanTier::Free);

    let mut h = Harness::new();
    h.backend = Some((
        Arc::new(sessions.clone()) as Arc<dyn SessionStore>,
        Arc::new(limits.clone()) as Arc<dyn LimitsProvider>,
    ));
    h.script = vec![Utterance::Speech(Duration::from_secs(1))];
    h.recognizer.push(Duration::from_millis(500), Ok("I feel anxious today"));

    let controller = h.controller();
    let handle = controller.handle();
    let mut events = handle.subscribe();

    let (outcome, seen) = tokio::join!(
        controller.run(),
        drive(&handle, &mut events, end_on_listening(2))
    );

    let SessionOutcome::Completed {
        session_id: Some(id),
        turns,
        ..
    } = outcome
    else {
        panic!("expected a saved session, got {outcome:?}");
    };
    assert_eq!(turns, 3);
    assert!(seen.iter().any(|(_, e)| matches!(
        e,
        SessionEvent::Ended { session_id: Some(saved), .. } if *saved == id
    )));

    let listed = sessions.list(10).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].turn_count, 3);
    assert_eq!(listed[0].summary, "That sounds really hard. I'm here with you.");

    let stored = sessions.turns(&id).unwrap();
    assert_eq!(stored[1].role(), Role::User);
    assert_eq!(stored[1].content(), "I feel anxious today");

    let usage = limits.current(Utc::now()).unwrap();
    assert_eq!(usage.sessions_used, 1);
    assert_eq!(usage.sessions_remaining(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_plan_blocks_next_session() {
    let pool = setup_test_db();
    let limits = SqliteLimits::new(pool.clone(), PlanTier::Free);
    for _ in 0..3 {
        limits.increment().unwrap();
    }

    let mut h = Harness::new();
    h.backend = Some((
        Arc::new(SqliteSessionStore::new(pool)) as Arc<dyn SessionStore>,
        Arc::new(limits.clone()) as Arc<dyn LimitsProvider>,
    ));

    let outcome = h.controller().run().await;
    assert!(matches!(outcome, SessionOutcome::Blocked(_)));

    // Upgrading lifts the block without resetting usage
    let upgraded = limits.set_tier(PlanTier::Plus).unwrap();
    assert_eq!(upgraded.sessions_used, 3);
    assert!(!upgraded.exhausted());
}

#[test]
fn test_file_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("haven.db");

    {
        let limits = SqliteLimits::new(store::init(&path).unwrap(), PlanTier::Pro);
        limits.increment().unwrap();
    }

    let limits = SqliteLimits::new(store::init(&path).unwrap(), PlanTier::Free);
    let current = limits.current(Utc::now()).unwrap();
    assert_eq!(current.tier, PlanTier::Pro);
    assert_eq!(current.sessions_used, 1);
    assert_eq!(current.session_duration_limit, Duration::from_secs(30 * 60));
}
