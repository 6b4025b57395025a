use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::drift::ScanError;
use crate::integrations::FetchError;
use crate::store::{CredentialMappingStore, Repository, ScanCommit};
use crate::tests::fixtures::*;
use crate::tests::TestContext;
use flowops_shared::{CanonicalWorkflow, DriftStatus, Environment, EnvironmentClass, ScanReport};

fn notifications() -> Vec<CredentialFixture> {
    vec![CredentialFixture::new(SLACK, "cred-1", "notifications")]
}

async fn canonical_of(ctx: &TestContext, environment: &Environment, runtime_id: &str) -> Uuid {
    ctx.repo
        .list_runtime_links(environment.id)
        .await
        .unwrap()
        .into_iter()
        .find(|l| l.runtime_workflow_id == runtime_id)
        .map(|l| l.canonical_workflow_id)
        .expect("runtime workflow is linked")
}

fn status_in(report: &ScanReport, canonical_id: Uuid) -> DriftStatus {
    report
        .workflows
        .iter()
        .find(|w| w.canonical_workflow_id == canonical_id)
        .map(|w| w.status)
        .expect("workflow is in the report")
}

async fn scan(ctx: &TestContext, environment: &Environment) -> ScanReport {
    let environment = ctx.reload(environment).await;
    ctx.state.scanner.scan_environment(&environment).await.unwrap()
}

#[tokio::test]
async fn test_first_discovery_is_new() {
    let ctx = TestContext::new();
    let dev = ctx.environment("Dev", EnvironmentClass::Dev, true).await;
    ctx.runtime(&dev)
        .put_workflow("wf-1", workflow_definition("wf-1", "Notify On Deploy", &notifications()));

    let report = scan(&ctx, &dev).await;
    let id = canonical_of(&ctx, &dev, "wf-1").await;

    assert_eq!(status_in(&report, id), DriftStatus::New);
    assert_eq!(report.workflows[0].label, "No baseline");
    let canonical = ctx.repo.get_canonical_workflow(ctx.tenant_id, id).await.unwrap().unwrap();
    assert_eq!(canonical.name, "Notify On Deploy");
    assert_eq!(canonical.git_path.as_deref(), Some(format!("workflows/{}.json", id).as_str()));
}

#[tokio::test]
async fn test_scenario_a_deploy_missing() {
    let ctx = TestContext::new();
    let staging = ctx.environment("Staging", EnvironmentClass::Staging, true).await;

    let id = Uuid::new_v4();
    ctx.repo
        .upsert_canonical_workflow(&CanonicalWorkflow {
            id,
            tenant_id: ctx.tenant_id,
            name: "Nightly Export".to_string(),
            content_hash: None,
            git_path: Some(format!("workflows/{}.json", id)),
            git_commit_sha: None,
            created_at: Utc::now(),
            updated_at: None,
        })
        .await
        .unwrap();
    ctx.git(&staging).put_file(
        &format!("workflows/{}.json", id),
        &workflow_definition("src", "Nightly Export", &[]),
    );

    let report = scan(&ctx, &staging).await;

    assert_eq!(status_in(&report, id), DriftStatus::DeployMissing);
    assert_eq!(report.environment_status, DriftStatus::DeployMissing);
    let row = ctx.repo.get_workflow_state(staging.id, id).await.unwrap().unwrap();
    assert!(row.git_hash.is_some());
    assert!(row.runtime_hash.is_none());
}

#[tokio::test]
async fn test_scenario_b_approved_runtime_is_in_sync() {
    let ctx = TestContext::new();
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
    let definition = workflow_definition("wf-1", "Notify On Deploy", &notifications());
    ctx.runtime(&prod).put_workflow("wf-1", definition.clone());

    scan(&ctx, &prod).await;
    let id = canonical_of(&ctx, &prod, "wf-1").await;
    let approval = ctx.state.approver.approve(ctx.tenant_id, prod.id, id).await.unwrap();
    assert_eq!(approval.state.status, DriftStatus::InSync);

    let report = scan(&ctx, &prod).await;
    assert_eq!(status_in(&report, id), DriftStatus::InSync);

    // Layout and bookkeeping changes are not drift
    ctx.runtime(&prod).put_workflow("wf-1", moved(&definition));
    let report = scan(&ctx, &prod).await;
    assert_eq!(status_in(&report, id), DriftStatus::InSync);
}

#[tokio::test]
async fn test_drift_wording_depends_on_environment_class() {
    for (class, expected) in [
        (EnvironmentClass::Dev, DriftStatus::Drift),
        (EnvironmentClass::Staging, DriftStatus::DriftDetected),
        (EnvironmentClass::Production, DriftStatus::DriftDetected),
    ] {
        let ctx = TestContext::new();
        let environment = ctx.environment("Env", class, false).await;
        let definition = workflow_definition("wf-1", "Notify On Deploy", &notifications());
        ctx.runtime(&environment).put_workflow("wf-1", definition.clone());

        scan(&ctx, &environment).await;
        let id = canonical_of(&ctx, &environment, "wf-1").await;
        ctx.state.approver.approve(ctx.tenant_id, environment.id, id).await.unwrap();

        ctx.runtime(&environment)
            .put_workflow("wf-1", edited(&definition, "hotfix"));
        let report = scan(&ctx, &environment).await;

        assert_eq!(status_in(&report, id), expected, "class {:?}", class);
    }
}

#[tokio::test]
async fn test_unmanaged_environment_rollup() {
    let ctx = TestContext::new();
    let dev = ctx.environment("Dev", EnvironmentClass::Dev, false).await;
    ctx.runtime(&dev)
        .put_workflow("wf-1", workflow_definition("wf-1", "Notify On Deploy", &[]));

    let report = scan(&ctx, &dev).await;

    assert_eq!(report.environment_status, DriftStatus::Unmanaged);
}

#[tokio::test]
async fn test_same_workflow_links_to_one_canonical_across_environments() {
    let ctx = TestContext::new();
    let dev = ctx.environment("Dev", EnvironmentClass::Dev, false).await;
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;

    let logical = logical_credential(ctx.tenant_id, SLACK, "notifications");
    ctx.repo.create_logical_credential(&logical).await.unwrap();
    ctx.repo
        .upsert_mapping(&mapping(&logical, dev.id, "dev-slack", "Slack (dev)"))
        .await
        .unwrap();
    ctx.repo
        .upsert_mapping(&mapping(&logical, prod.id, "prod-slack", "Slack (prod)"))
        .await
        .unwrap();

    ctx.runtime(&dev).put_workflow(
        "17",
        workflow_definition("17", "Notify On Deploy", &[CredentialFixture::new(SLACK, "dev-slack", "Slack (dev)")]),
    );
    ctx.runtime(&prod).put_workflow(
        "903",
        workflow_definition("903", "Notify On Deploy", &[CredentialFixture::new(SLACK, "prod-slack", "Slack (prod)")]),
    );

    let dev_report = scan(&ctx, &dev).await;
    let prod_report = scan(&ctx, &prod).await;

    assert_eq!(ctx.repo.list_canonical_workflows(ctx.tenant_id).await.unwrap().len(), 1);
    assert_eq!(canonical_of(&ctx, &dev, "17").await, canonical_of(&ctx, &prod, "903").await);
    assert_eq!(dev_report.workflows[0].runtime_hash, prod_report.workflows[0].runtime_hash);
}

#[tokio::test]
async fn test_git_unavailable_is_environment_wide() {
    let ctx = TestContext::new();
    let staging = ctx.environment("Staging", EnvironmentClass::Staging, true).await;
    ctx.runtime(&staging)
        .put_workflow("wf-1", workflow_definition("wf-1", "One", &[]));
    ctx.runtime(&staging)
        .put_workflow("wf-2", workflow_definition("wf-2", "Two", &[]));
    scan(&ctx, &staging).await;

    ctx.git(&staging)
        .fail_resolve(FetchError::Authorization("HTTP 403 Forbidden".to_string()));
    let report = scan(&ctx, &staging).await;

    assert_eq!(report.environment_status, DriftStatus::GitUnavailable);
    assert_eq!(report.remediation_hint, "Verify repository URL and credentials");
    assert_eq!(report.workflows.len(), 2);
    assert!(report.workflows.iter().all(|w| w.status == DriftStatus::GitUnavailable));
}

#[tokio::test]
async fn test_one_failing_workflow_does_not_block_others() {
    let ctx = TestContext::new();
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
    let runtime = ctx.runtime(&prod);
    runtime.put_workflow("wf-1", workflow_definition("wf-1", "One", &[]));
    runtime.put_workflow("wf-2", workflow_definition("wf-2", "Two", &[]));
    scan(&ctx, &prod).await;
    let one = canonical_of(&ctx, &prod, "wf-1").await;
    let two = canonical_of(&ctx, &prod, "wf-2").await;
    let before = ctx.repo.get_workflow_state(prod.id, two).await.unwrap().unwrap();

    runtime.fail_workflow("wf-2", FetchError::Transient("timed out after 30s".to_string()));
    let report = scan(&ctx, &prod).await;

    assert_eq!(status_in(&report, one), DriftStatus::New);
    assert_eq!(status_in(&report, two), DriftStatus::Error);
    let after = ctx.repo.get_workflow_state(prod.id, two).await.unwrap().unwrap();
    assert_eq!(after.runtime_hash, before.runtime_hash);
    assert!(after.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_malformed_definition_is_a_workflow_error() {
    let ctx = TestContext::new();
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
    ctx.runtime(&prod)
        .put_workflow("wf-1", serde_json::json!({ "id": "wf-1", "name": "Broken" }));

    let report = scan(&ctx, &prod).await;

    assert_eq!(report.workflows.len(), 1);
    assert_eq!(report.workflows[0].status, DriftStatus::Error);
}

#[tokio::test]
async fn test_stale_scan_results_are_discarded() {
    let ctx = TestContext::new();
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
    ctx.runtime(&prod)
        .put_workflow("wf-1", workflow_definition("wf-1", "One", &[]));
    scan(&ctx, &prod).await;
    let id = canonical_of(&ctx, &prod, "wf-1").await;
    let stored = ctx.repo.get_workflow_state(prod.id, id).await.unwrap().unwrap();

    // A slow scan that started before the stored one finishes late
    let mut late = stored.clone();
    late.status = DriftStatus::Error;
    late.scan_started_at = stored.scan_started_at - ChronoDuration::seconds(30);
    let outcome = ctx
        .repo
        .commit_scan(&ScanCommit {
            environment_id: prod.id,
            scan_started_at: late.scan_started_at,
            new_workflows: Vec::new(),
            new_links: Vec::new(),
            rows: vec![late],
        })
        .await
        .unwrap();

    assert_eq!(outcome.discarded, 1);
    assert_eq!(outcome.committed, 0);
    let current = ctx.repo.get_workflow_state(prod.id, id).await.unwrap().unwrap();
    assert_eq!(current, stored);
}

#[tokio::test]
async fn test_cancelled_scan_commits_nothing() {
    let ctx = TestContext::new();
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
    let runtime = ctx.runtime(&prod);
    runtime.put_workflow("wf-1", workflow_definition("wf-1", "One", &[]));
    runtime.delay_listing(Duration::from_millis(500));

    let scanner = ctx.state.scanner.clone();
    let environment = prod.clone();
    let handle = tokio::spawn(async move { scanner.scan_environment(&environment).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ctx.state.scanner.cancel(prod.id));

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(ScanError::Cancelled(id)) if id == prod.id));
    assert!(ctx.repo.list_workflow_states(prod.id).await.unwrap().is_empty());
    assert!(ctx.repo.list_runtime_links(prod.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_after_scan_finished_reports_nothing_running() {
    let ctx = TestContext::new();
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
    ctx.runtime(&prod)
        .put_workflow("wf-1", workflow_definition("wf-1", "One", &[]));

    scan(&ctx, &prod).await;

    assert!(!ctx.state.scanner.cancel(prod.id));
    // The environment can still be scanned afterwards
    let report = scan(&ctx, &prod).await;
    assert_eq!(report.workflows.len(), 1);
}

#[tokio::test]
async fn test_scan_racing_delete_leaves_nothing_behind() {
    let ctx = TestContext::new();
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
    let runtime = ctx.runtime(&prod);
    runtime.put_workflow("wf-1", workflow_definition("wf-1", "One", &[]));
    runtime.delay_listing(Duration::from_millis(300));

    let scanner = ctx.state.scanner.clone();
    let environment = prod.clone();
    let handle = tokio::spawn(async move { scanner.scan_environment(&environment).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ctx.repo.delete_environment(ctx.tenant_id, prod.id).await.unwrap());

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(ScanError::Store(_))));
    assert!(ctx.repo.list_workflow_states(prod.id).await.unwrap().is_empty());
    assert!(ctx.repo.list_runtime_links(prod.id).await.unwrap().is_empty());
    assert!(ctx
        .repo
        .list_canonical_workflows(ctx.tenant_id)
        .await
        .unwrap()
        .is_empty());
}

#[test]
fn test_edited_fixture_changes_content_without_credentials() {
    let keys = crate::identity::CredentialKeyMap::new();
    let definition = workflow_definition("wf-1", "One", &[]);
    let original = crate::identity::content_hash(&definition, &keys).unwrap();
    let changed = crate::identity::content_hash(&edited(&definition, "hotfix"), &keys).unwrap();
    assert_ne!(original, changed);
}

#[tokio::test]
async fn test_git_changes_since_previous_head() {
    let ctx = TestContext::new();
    let staging = ctx.environment("Staging", EnvironmentClass::Staging, true).await;

    let first = scan(&ctx, &staging).await;
    assert_eq!(first.git_head.as_deref(), Some("c0ffee0"));
    assert!(first.git_changed_paths.is_empty());

    ctx.git(&staging).set_head("beef123", &["workflows/a.json"]);
    let second = scan(&ctx, &staging).await;

    assert_eq!(second.git_head.as_deref(), Some("beef123"));
    assert_eq!(second.git_changed_paths, vec!["workflows/a.json".to_string()]);
    assert_eq!(ctx.reload(&staging).await.last_git_head.as_deref(), Some("beef123"));
}

#[tokio::test]
async fn test_scan_all_isolates_environments() {
    let ctx = TestContext::new();
    let dev = ctx.environment("Dev", EnvironmentClass::Dev, false).await;
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
    ctx.runtime(&dev)
        .put_workflow("wf-1", workflow_definition("wf-1", "One", &[]));
    ctx.runtime(&prod)
        .fail_listing(FetchError::Authorization("HTTP 401".to_string()));

    let results = ctx.state.scanner.scan_all().await.unwrap();

    assert_eq!(results.len(), 2);
    for (environment_id, result) in results {
        let report = result.unwrap();
        if environment_id == dev.id {
            assert_eq!(report.workflows[0].status, DriftStatus::New);
        } else {
            assert_eq!(report.environment_id, prod.id);
            assert!(report.workflows.is_empty());
        }
    }
}
