use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use crate::integrations::FetchError;
use crate::jobs::run_drift_scan;
use crate::tests::fixtures::*;
use crate::tests::helpers::send;
use crate::tests::TestContext;
use flowops_shared::EnvironmentClass;

#[tokio::test]
async fn test_health_endpoints() {
    let ctx = TestContext::new();
    let app = ctx.app();

    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&app, "GET", "/health/detailed", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["services"]["storage"]["status"], "healthy");
}

#[tokio::test]
async fn test_job_history_lists_scheduled_scans() {
    let ctx = TestContext::new();
    let app = ctx.app();
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
    ctx.runtime(&prod)
        .put_workflow("1", workflow_definition("1", "Billing Sync", &[]));

    let (status, body) = send(&app, "GET", "/health/jobs", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());

    run_drift_scan(ctx.state.scanner.clone(), &ctx.state.job_history).await;

    let (_, body) = send(&app, "GET", "/health/jobs", None, None).await;
    let runs = body.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["job_name"], "Drift Scan");
    assert_eq!(runs[0]["status"], "Completed");
    assert_eq!(runs[0]["items_processed"], 1);

    // The scheduled run stored drift rows like a manual scan
    let (_, page) = send(
        &app,
        "GET",
        &format!("/api/v1/environments/{}/drift", prod.id),
        Some(ctx.tenant_id),
        None,
    )
    .await;
    assert_eq!(page["meta"]["total"], 1);
}

#[tokio::test]
async fn test_tenant_header_is_required() {
    let ctx = TestContext::new();
    let app = ctx.app();

    let (status, body) = send(&app, "GET", "/api/v1/environments", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_create_environment() {
    let ctx = TestContext::new();
    let app = ctx.app();

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/environments",
        Some(ctx.tenant_id),
        Some(json!({
            "name": "Staging",
            "class": "staging",
            "runtime_base_url": "https://staging.runtime.test/",
            "runtime_api_key": "secret",
            "git": { "repository": "acme/workflows", "token": "ghp_x" }
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["class"], "staging");
    assert_eq!(body["runtime_base_url"], "https://staging.runtime.test");
    assert_eq!(body["git"]["branch"], "main");
    assert_eq!(body["git"]["path_prefix"], "workflows");
    // Secrets never leave the API
    assert!(body.get("runtime_api_key").is_none());
    assert!(body["git"].get("token").is_none());

    let (status, body) = send(&app, "GET", "/api/v1/environments", Some(ctx.tenant_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    // Other tenants do not see it
    let (_, body) = send(&app, "GET", "/api/v1/environments", Some(Uuid::new_v4()), None).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_create_environment_validation() {
    let ctx = TestContext::new();
    let app = ctx.app();

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/environments",
        Some(ctx.tenant_id),
        Some(json!({
            "name": "Prod",
            "class": "production",
            "runtime_base_url": "ftp://prod.runtime.test",
            "runtime_api_key": "secret",
            "git": { "repository": "not a repo", "token": "ghp_x" }
        })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(body["details"].get("runtime_base_url").is_some());
    assert!(body["details"].get("git.repository").is_some());
}

#[tokio::test]
async fn test_scan_and_read_drift() {
    let ctx = TestContext::new();
    let app = ctx.app();
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
    let runtime = ctx.runtime(&prod);
    runtime.put_workflow("1", workflow_definition("1", "Billing Sync", &[]));
    runtime.put_workflow("2", workflow_definition("2", "Alerts", &[]));
    runtime.fail_workflow("2", FetchError::Transient("timed out".to_string()));

    let (status, report) = send(
        &app,
        "POST",
        &format!("/api/v1/environments/{}/scan", prod.id),
        Some(ctx.tenant_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["environment_id"], prod.id.to_string());
    assert_eq!(report["workflows"].as_array().unwrap().len(), 2);

    let (status, page) = send(
        &app,
        "GET",
        &format!("/api/v1/environments/{}/drift?per_page=10", prod.id),
        Some(ctx.tenant_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["meta"]["total"], 2);
    let rows = page["data"].as_array().unwrap();
    // Errors sort ahead of new workflows
    assert_eq!(rows[0]["status"], "ERROR");
    assert_eq!(rows[0]["workflow_name"], "Alerts");
    assert_eq!(rows[1]["status"], "NEW");

    let workflow_id = rows[1]["canonical_workflow_id"].as_str().unwrap().to_string();
    let (status, view) = send(
        &app,
        "GET",
        &format!("/api/v1/environments/{}/drift/{}", prod.id, workflow_id),
        Some(ctx.tenant_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["workflow_name"], "Billing Sync");
    assert_eq!(view["label"], "Not onboarded");
}

#[tokio::test]
async fn test_approve_then_detect_drift() {
    let ctx = TestContext::new();
    let app = ctx.app();
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
    let runtime = ctx.runtime(&prod);
    let definition = workflow_definition("1", "Billing Sync", &[]);
    runtime.put_workflow("1", definition.clone());

    let scan_uri = format!("/api/v1/environments/{}/scan", prod.id);
    let (_, report) = send(&app, "POST", &scan_uri, Some(ctx.tenant_id), None).await;
    let workflow_id = report["workflows"][0]["canonical_workflow_id"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, approval) = send(
        &app,
        "POST",
        &format!("/api/v1/environments/{}/workflows/{}/approve", prod.id, workflow_id),
        Some(ctx.tenant_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(approval["state"]["status"], "IN_SYNC");
    assert!(approval["git_commit_sha"].is_null());

    runtime.put_workflow("1", edited(&definition, "hotfix"));
    let (_, report) = send(&app, "POST", &scan_uri, Some(ctx.tenant_id), None).await;
    assert_eq!(report["workflows"][0]["status"], "DRIFT_DETECTED");
    // Without a repository the environment rolls up as unmanaged
    assert_eq!(report["environment_status"], "UNMANAGED");
}

#[tokio::test]
async fn test_approve_unknown_workflow_is_not_found() {
    let ctx = TestContext::new();
    let app = ctx.app();
    let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/environments/{}/workflows/{}/approve", prod.id, Uuid::new_v4()),
        Some(ctx.tenant_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_scan_without_running_scan() {
    let ctx = TestContext::new();
    let app = ctx.app();
    let dev = ctx.environment("Dev", EnvironmentClass::Dev, false).await;

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/environments/{}/cancel-scan", dev.id),
        Some(ctx.tenant_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn test_delete_environment() {
    let ctx = TestContext::new();
    let app = ctx.app();
    let dev = ctx.environment("Dev", EnvironmentClass::Dev, false).await;
    let uri = format!("/api/v1/environments/{}", dev.id);

    // Wrong tenant cannot delete it
    let (status, _) = send(&app, "DELETE", &uri, Some(Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "DELETE", &uri, Some(ctx.tenant_id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, "GET", &uri, Some(ctx.tenant_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}
