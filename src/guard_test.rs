use super::*;
use crate::notifier::ChangeNotifier;
use crate::session::Transition;
use crate::state::test_helpers::{MockIdentity, test_session};
use std::sync::Mutex;

fn fresh_session() -> Arc<SessionState> {
    Arc::new(test_session(Arc::new(MockIdentity::default()), Arc::new(ChangeNotifier::new())))
}

/// Action that records the status it ran against.
fn status_recorder(seen: &Arc<Mutex<Vec<SessionStatus>>>) -> Arc<dyn LoadAction> {
    let seen = Arc::clone(seen);
    action_fn("record_status", move |snap: SessionSnapshot| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(snap.status);
            Ok(Data::new())
        }
    })
}

#[test]
fn on_load_puts_auth_check_first() {
    let guard = LoadGuard::new(Duration::from_secs(1));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seq = guard.on_load(vec![status_recorder(&seen), status_recorder(&seen)]);

    let steps = seq.steps();
    assert_eq!(steps.len(), 3);
    assert!(matches!(steps[0], LoadStep::AwaitAuthCheck));
    assert!(matches!(steps[1], LoadStep::Action(_)));
    assert_eq!(format!("{:?}", steps[2]), r#"Action("record_status")"#);
}

#[tokio::test]
async fn action_scheduled_before_sync_observes_settled_state() {
    let session = fresh_session();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seq = LoadGuard::new(Duration::from_secs(5)).on_load(vec![status_recorder(&seen)]);

    let task = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { seq.run(&session).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(seen.lock().unwrap().is_empty(), "action ran before the session settled");

    session.apply_transition(Transition::signed_in("u1", "s1")).await;

    let report = task.await.unwrap();
    assert!(report.auth_checked);
    assert_eq!(report.status, SessionStatus::SignedIn);
    assert_eq!(*seen.lock().unwrap(), vec![SessionStatus::SignedIn]);
}

#[tokio::test]
async fn already_settled_session_runs_immediately() {
    let session = fresh_session();
    session.apply_transition(Transition::signed_out()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seq = LoadGuard::new(Duration::from_secs(5)).on_load(vec![status_recorder(&seen)]);

    let report = tokio::time::timeout(Duration::from_millis(500), seq.run(&session))
        .await
        .expect("settled session must not wait");

    assert!(report.auth_checked);
    assert_eq!(*seen.lock().unwrap(), vec![SessionStatus::SignedOut]);
}

#[tokio::test]
async fn timeout_still_runs_actions_unsettled() {
    let session = fresh_session();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seq = LoadGuard::new(Duration::from_millis(30)).on_load(vec![status_recorder(&seen)]);

    let report = seq.run(&session).await;

    assert!(!report.auth_checked);
    assert_eq!(report.status, SessionStatus::Loading);
    assert_eq!(*seen.lock().unwrap(), vec![SessionStatus::Loading]);
}

#[tokio::test]
async fn failing_action_does_not_stop_the_sequence() {
    let session = fresh_session();
    session.apply_transition(Transition::signed_out()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let requires_user = action_fn("requires_user", |snap: SessionSnapshot| async move {
        if snap.is_signed_in() { Ok(Data::new()) } else { Err(LoadError::Unauthorized) }
    });
    let seq = LoadGuard::new(Duration::from_secs(1)).on_load(vec![requires_user, status_recorder(&seen)]);

    let mut streamed = Vec::new();
    let report = seq.run_with(&session, |o| streamed.push(o.name.clone())).await;

    assert_eq!(streamed, vec!["requires_user", "record_status"]);
    assert!(matches!(report.actions[0].result, Err(LoadError::Unauthorized)));
    assert!(report.actions[1].result.is_ok());
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn panicking_action_is_isolated() {
    struct Explodes;

    #[async_trait::async_trait]
    impl LoadAction for Explodes {
        fn name(&self) -> &str {
            "explodes"
        }

        async fn run(&self, _session: &SessionState) -> Result<Data, LoadError> {
            panic!("page data exploded");
        }
    }

    let session = fresh_session();
    session.apply_transition(Transition::signed_out()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let explodes: Arc<dyn LoadAction> = Arc::new(Explodes);
    let seq = LoadGuard::new(Duration::from_secs(1)).on_load(vec![explodes, status_recorder(&seen)]);

    let report = seq.run(&session).await;

    assert!(matches!(&report.actions[0].result, Err(LoadError::Panicked(msg)) if msg == "page data exploded"));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn session_aware_action_can_fetch_user() {
    struct Profile;

    #[async_trait::async_trait]
    impl LoadAction for Profile {
        async fn run(&self, session: &SessionState) -> Result<Data, LoadError> {
            let user = session.fetch_user().await?;
            let mut data = Data::new();
            data.insert("email".into(), serde_json::json!(user.email_address));
            Ok(data)
        }
    }

    let session = fresh_session();
    session.apply_transition(Transition::signed_in("u1", "s1")).await;
    let profile: Arc<dyn LoadAction> = Arc::new(Profile);
    let report = LoadGuard::new(Duration::from_secs(1)).on_load(vec![profile]).run(&session).await;

    let data = report.actions[0].result.as_ref().unwrap();
    assert_eq!(data["email"], "u1@example.test");
}

#[test]
fn outcome_data_carries_error_code() {
    let outcome = ActionOutcome { name: "a".into(), result: Err(LoadError::Identity(IdentityError::MissingUser)) };
    let data = outcome.to_data();
    assert_eq!(data["ok"], false);
    assert_eq!(data["code"], "E_MISSING_USER");

    let ok = ActionOutcome { name: "b".into(), result: Ok(Data::new()) };
    assert_eq!(ok.to_data()["ok"], true);
}

#[test]
fn load_error_retryable_follows_identity() {
    let outage = LoadError::Identity(IdentityError::ApiRequest("timeout".into()));
    assert!(outage.retryable());
    assert!(!LoadError::Unauthorized.retryable());
    assert_eq!(LoadError::Failed("x".into()).error_code(), "E_LOAD_FAILED");
}
