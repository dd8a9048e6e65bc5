//! End-to-end behaviour of the teardown workflow against scripted activities.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use undeploy::activities::{ActivityKind, DestroyResult, ValidateResult, VerifyResult};
use undeploy::errors::{ActivityError, InputError, TeardownError};
use undeploy::host::{RunId, RunOptions};
use undeploy::identity::SourceIdentifiers;
use undeploy::request::TeardownRequest;

use support::{ScriptedActivities, host, transient};

use ActivityKind::{Destroy, Validate, Verify};

#[tokio::test]
async fn test_full_teardown_validates_destroys_and_verifies() {
    let acts = Arc::new(ScriptedActivities::new());
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown(&TeardownRequest::for_release("web").in_namespace("apps"))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.message, "Release web uninstalled. Status: uninstalled");
    assert_eq!(outcome.release, "web");
    assert_eq!(outcome.namespace, "apps");
    assert!(outcome.warnings.is_empty());
    assert_eq!(acts.kinds(), vec![Validate, Destroy, Verify]);
}

#[tokio::test]
async fn test_missing_release_never_destroys() {
    let acts = Arc::new(ScriptedActivities::new().validate_returns(Ok(ValidateResult::missing())));
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown(&TeardownRequest::for_release("ghost"))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.message.contains("not found"));
    assert_eq!(acts.kinds(), vec![Validate]);
}

#[tokio::test]
async fn test_dry_run_of_existing_release_takes_no_action() {
    let acts = Arc::new(ScriptedActivities::new());
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown(&TeardownRequest::for_release("web").with_dry_run(true))
        .await
        .unwrap();

    assert!(outcome.success);
    assert!(outcome.message.contains("web"));
    assert!(outcome.message.contains("no destructive action"));
    assert_eq!(acts.kinds(), vec![Validate]);
}

#[tokio::test]
async fn test_dry_run_of_missing_release_reports_failure() {
    let acts = Arc::new(ScriptedActivities::new().validate_returns(Ok(ValidateResult::missing())));
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown(&TeardownRequest::for_release("ghost").with_dry_run(true))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.message.contains("a real teardown would fail"));
}

#[tokio::test]
async fn test_no_wait_skips_verify() {
    let acts = Arc::new(ScriptedActivities::new());
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown(&TeardownRequest::for_release("web").with_wait(false))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(acts.kinds(), vec![Validate, Destroy]);
    assert_eq!(acts.calls()[1].wait, Some(false));
}

#[tokio::test]
async fn test_rejected_uninstall_with_wait_skips_verify() {
    let acts = Arc::new(ScriptedActivities::new().destroy_returns(Ok(DestroyResult {
        succeeded: false,
        detail: "Failed to uninstall release: forbidden".to_string(),
    })));
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown(&TeardownRequest::for_release("web"))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.message, "Failed to uninstall release: forbidden");
    assert_eq!(acts.kinds(), vec![Validate, Destroy]);
}

#[tokio::test]
async fn test_verify_exhaustion_is_only_a_warning() {
    let acts = Arc::new(
        ScriptedActivities::new()
            .verify_returns(Err(transient("api unavailable")))
            .verify_returns(Err(transient("api unavailable"))),
    );
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown(&TeardownRequest::for_release("web"))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("api unavailable"));
    assert_eq!(acts.count(Verify), 2);
}

#[tokio::test]
async fn test_leftover_resources_are_a_warning() {
    let acts = Arc::new(ScriptedActivities::new().verify_returns(Ok(VerifyResult::from_counts(2, 1))));
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown(&TeardownRequest::for_release("web"))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("2 deployment(s) and 1 service(s)"));
}

#[tokio::test]
async fn test_transient_validate_failure_is_retried() {
    let acts = Arc::new(ScriptedActivities::new().validate_returns(Err(transient("connection refused"))));
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown(&TeardownRequest::for_release("web"))
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(acts.count(Validate), 2);
}

#[tokio::test]
async fn test_validate_exhaustion_fails_run_with_outcome() {
    let acts = Arc::new(
        ScriptedActivities::new()
            .validate_returns(Err(transient("connection refused")))
            .validate_returns(Err(transient("connection refused")))
            .validate_returns(Err(transient("connection refused"))),
    );
    let (host, _) = host(acts.clone());

    let err = host
        .run_teardown(&TeardownRequest::for_release("web"))
        .await
        .unwrap_err();

    match &err {
        TeardownError::ActivityFailed {
            activity, outcome, ..
        } => {
            assert_eq!(*activity, Validate);
            assert!(!outcome.success);
            assert_eq!(outcome.message, "Failed to validate release: connection refused");
        }
        other => panic!("Expected activity failure, got {other:?}"),
    }
    assert_eq!(acts.kinds(), vec![Validate, Validate, Validate]);
}

#[tokio::test]
async fn test_destroy_failure_detail_is_propagated_verbatim() {
    let detail = "uninstall: Release not loaded: web: timed out waiting for the condition";
    let acts = Arc::new(
        ScriptedActivities::new()
            .destroy_returns(Err(transient(detail)))
            .destroy_returns(Err(transient(detail)))
            .destroy_returns(Err(transient(detail))),
    );
    let (host, _) = host(acts.clone());

    let err = host
        .run_teardown(&TeardownRequest::for_release("web"))
        .await
        .unwrap_err();

    let outcome = err.outcome().expect("terminal outcome");
    assert_eq!(outcome.message, format!("Failed to undeploy release: {detail}"));
    assert_eq!(acts.count(Destroy), 3);
    assert_eq!(acts.count(Verify), 0);
}

#[tokio::test]
async fn test_non_retryable_destroy_error_is_not_retried() {
    let acts = Arc::new(
        ScriptedActivities::new().destroy_returns(Err(ActivityError::non_retryable("invalid chart"))),
    );
    let (host, _) = host(acts.clone());

    let err = host
        .run_teardown(&TeardownRequest::for_release("web"))
        .await
        .unwrap_err();

    assert!(matches!(err, TeardownError::ActivityFailed { activity: Destroy, .. }));
    assert_eq!(acts.count(Destroy), 1);
}

#[tokio::test]
async fn test_derived_identity_reaches_activities() {
    let acts = Arc::new(ScriptedActivities::new());
    let (host, _) = host(acts.clone());
    let request = TeardownRequest::for_source(
        SourceIdentifiers::new("acme", "My-App", "feature/thing").with_pr_number(42),
    )
    .in_namespace("preview");

    let outcome = host.run_teardown(&request).await.unwrap();

    assert_eq!(outcome.release, "my-app-pr-42");
    for call in acts.calls() {
        assert_eq!(call.release, "my-app-pr-42");
        assert_eq!(call.namespace, "preview");
    }
}

#[tokio::test]
async fn test_default_namespace_applies() {
    let acts = Arc::new(ScriptedActivities::new());
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown(&TeardownRequest::for_release("web"))
        .await
        .unwrap();

    assert_eq!(outcome.namespace, "default");
    assert_eq!(acts.calls()[0].namespace, "default");
}

#[tokio::test]
async fn test_timeout_bound_reaches_destroy() {
    let acts = Arc::new(ScriptedActivities::new());
    let (host, _) = host(acts.clone());

    host.run_teardown(&TeardownRequest::for_release("web").with_timeout(Duration::from_secs(900)))
        .await
        .unwrap();

    let destroy = acts.calls().into_iter().find(|c| c.kind == Destroy).unwrap();
    assert_eq!(destroy.timeout, Some(Duration::from_secs(900)));
}

#[tokio::test]
async fn test_input_errors_run_no_activities() {
    let acts = Arc::new(ScriptedActivities::new());
    let (host, store) = host(acts.clone());

    let err = host
        .run_teardown(&TeardownRequest::for_source(SourceIdentifiers::new(
            "acme", "***", "dev",
        )))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TeardownError::Input(InputError::EmptyComponent { field: "repo", .. })
    ));
    assert!(acts.calls().is_empty());
    assert!(undeploy::host::HistoryStore::list_runs(store.as_ref()).unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_before_destroy_leaves_release_untouched() {
    let token = CancellationToken::new();
    let acts = Arc::new(ScriptedActivities::new().cancel_during_validate(token.clone()));
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown_with(
            &TeardownRequest::for_release("web"),
            RunOptions {
                run_id: None,
                cancel: Some(token),
            },
        )
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.message.contains("before any destructive action"));
    assert_eq!(acts.kinds(), vec![Validate]);
}

#[tokio::test]
async fn test_cancel_after_destroy_scheduled_still_completes_destroy() {
    let token = CancellationToken::new();
    let acts = Arc::new(ScriptedActivities::new().cancel_during_destroy(token.clone()));
    let (host, _) = host(acts.clone());

    let outcome = host
        .run_teardown_with(
            &TeardownRequest::for_release("web"),
            RunOptions {
                run_id: None,
                cancel: Some(token),
            },
        )
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(acts.kinds(), vec![Validate, Destroy]);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("cancelled"));
}

#[tokio::test]
async fn test_host_cancel_reaches_in_flight_run() {
    let acts = Arc::new(ScriptedActivities::new().destroy_takes(Duration::from_millis(100)));
    let (host, store) = host(acts.clone());
    let request = TeardownRequest::for_release("web").in_namespace("apps");
    let run_id = RunId::new("undeploy-apps-web").unwrap();

    let (outcome, cancelled) = tokio::join!(host.run_teardown(&request), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.cancel(&run_id).unwrap()
    });

    assert!(cancelled);
    let outcome = outcome.unwrap();
    assert!(outcome.success);
    assert_eq!(acts.kinds(), vec![Validate, Destroy]);
    let history = undeploy::host::HistoryStore::load(store.as_ref(), &run_id).unwrap();
    assert!(history.iter().any(|r| r.event.name() == "cancel_requested"));
}

#[tokio::test]
async fn test_cancel_of_idle_run_is_noop() {
    let acts = Arc::new(ScriptedActivities::new());
    let (host, _) = host(acts);
    assert!(!host.cancel(&RunId::new("nothing").unwrap()).unwrap());
}
