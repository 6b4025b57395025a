use uuid::Uuid;

use crate::config::Config;
use crate::credentials::PreflightError;
use crate::store::{CredentialMappingStore, Repository};
use crate::tests::fixtures::*;
use crate::tests::{test_config, TestContext};
use flowops_shared::{Environment, EnvironmentClass, LogicalCredential, PreflightIssueKind};

struct Setup {
    ctx: TestContext,
    dev: Environment,
    prod: Environment,
}

impl Setup {
    async fn new(config: Config) -> Self {
        let ctx = TestContext::with_config(config);
        let dev = ctx.environment("Dev", EnvironmentClass::Dev, false).await;
        let prod = ctx.environment("Prod", EnvironmentClass::Production, false).await;
        Self { ctx, dev, prod }
    }

    async fn logical(&self, credential_type: &str, name: &str) -> LogicalCredential {
        let logical = logical_credential(self.ctx.tenant_id, credential_type, name);
        self.ctx.repo.create_logical_credential(&logical).await.unwrap();
        logical
    }

    async fn map(&self, logical: &LogicalCredential, environment: &Environment, physical_id: &str, name: &str) {
        self.ctx
            .repo
            .upsert_mapping(&mapping(logical, environment.id, physical_id, name))
            .await
            .unwrap();
    }

    /// Put a workflow in the dev runtime, scan, and return its canonical id
    async fn dev_workflow(&self, runtime_id: &str, name: &str, credentials: &[CredentialFixture]) -> Uuid {
        self.ctx
            .runtime(&self.dev)
            .put_workflow(runtime_id, workflow_definition(runtime_id, name, credentials));
        self.ctx.state.scanner.scan_environment(&self.dev).await.unwrap();
        self.ctx
            .repo
            .list_runtime_links(self.dev.id)
            .await
            .unwrap()
            .into_iter()
            .find(|l| l.runtime_workflow_id == runtime_id)
            .map(|l| l.canonical_workflow_id)
            .unwrap()
    }
}

#[tokio::test]
async fn test_scenario_c_unmapped_credential_blocks() {
    let s = Setup::new(test_config()).await;
    let slack = s.logical(SLACK, "notifications").await;
    s.map(&slack, &s.dev, "dev-slack", "Slack (dev)").await;
    let wf = s
        .dev_workflow("17", "Notify On Deploy", &[CredentialFixture::new(SLACK, "dev-slack", "Slack (dev)")])
        .await;

    let result = s
        .ctx
        .state
        .preflight
        .preflight(s.ctx.tenant_id, &[wf], s.dev.id, s.prod.id)
        .await
        .unwrap();

    assert_eq!(result.blocking_issues.len(), 1);
    let issue = &result.blocking_issues[0];
    assert_eq!(issue.kind, PreflightIssueKind::MissingMapping);
    assert_eq!(issue.workflow_id, wf);
    assert_eq!(issue.logical_key.as_deref(), Some("slackApi:notifications"));
    assert!(issue.message.contains("Notify On Deploy"));
    assert!(issue.message.contains("slackApi:notifications"));
    assert!(result.resolved_mappings.is_empty());
    assert!(!result.is_clear());
}

#[tokio::test]
async fn test_scenario_d_one_resolved_one_missing_in_target() {
    let s = Setup::new(test_config()).await;
    let slack = s.logical(SLACK, "notifications").await;
    let db = s.logical(POSTGRES, "warehouse").await;
    s.map(&slack, &s.dev, "dev-slack", "Slack (dev)").await;
    s.map(&db, &s.dev, "dev-db", "Warehouse (dev)").await;
    s.map(&slack, &s.prod, "prod-slack", "Slack (prod)").await;
    s.map(&db, &s.prod, "prod-db", "Warehouse (prod)").await;

    // The mapped warehouse credential was deleted from the prod runtime
    s.ctx.runtime(&s.prod).add_credential(SLACK, "prod-slack", "Slack (prod)");

    let wf = s
        .dev_workflow(
            "17",
            "Load Warehouse",
            &[
                CredentialFixture::new(SLACK, "dev-slack", "Slack (dev)"),
                CredentialFixture::new(POSTGRES, "dev-db", "Warehouse (dev)"),
            ],
        )
        .await;

    let result = s
        .ctx
        .state
        .preflight
        .preflight(s.ctx.tenant_id, &[wf], s.dev.id, s.prod.id)
        .await
        .unwrap();

    assert_eq!(result.resolved_mappings.len(), 1);
    let resolved = &result.resolved_mappings[0];
    assert_eq!(resolved.logical_key, "slackApi:notifications");
    assert_eq!(resolved.target_physical_id, "prod-slack");
    assert!(!resolved.auto_create);

    assert_eq!(result.blocking_issues.len(), 1);
    assert_eq!(result.blocking_issues[0].kind, PreflightIssueKind::MappedMissingInTarget);
    assert_eq!(result.blocking_issues[0].logical_key.as_deref(), Some("postgres:warehouse"));
}

#[tokio::test]
async fn test_preflight_is_idempotent() {
    let s = Setup::new(test_config()).await;
    let slack = s.logical(SLACK, "notifications").await;
    s.map(&slack, &s.dev, "dev-slack", "Slack (dev)").await;
    s.ctx.runtime(&s.prod).add_credential(POSTGRES, "prod-db", "warehouse");
    let wf = s
        .dev_workflow(
            "17",
            "Load Warehouse",
            &[
                CredentialFixture::new(SLACK, "dev-slack", "Slack (dev)"),
                CredentialFixture::new(POSTGRES, "dev-db", "warehouse"),
            ],
        )
        .await;

    let preflight = &s.ctx.state.preflight;
    let first = preflight.preflight(s.ctx.tenant_id, &[wf], s.dev.id, s.prod.id).await.unwrap();
    let second = preflight.preflight(s.ctx.tenant_id, &[wf], s.dev.id, s.prod.id).await.unwrap();

    assert_eq!(first.blocking_issues, second.blocking_issues);
    assert_eq!(first.warnings, second.warnings);
    assert_eq!(first.resolved_mappings, second.resolved_mappings);
    // Preflight never writes mappings
    assert!(s.ctx.repo.list_mappings(s.ctx.tenant_id, s.prod.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_logical_credential_auto_creates_by_name() {
    let s = Setup::new(test_config()).await;
    s.ctx.runtime(&s.prod).add_credential(SLACK, "prod-slack", "notifications");
    let wf = s
        .dev_workflow("17", "Notify", &[CredentialFixture::new(SLACK, "dev-slack", "notifications")])
        .await;

    let result = s
        .ctx
        .state
        .preflight
        .preflight(s.ctx.tenant_id, &[wf], s.dev.id, s.prod.id)
        .await
        .unwrap();

    assert!(result.is_clear());
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].kind, PreflightIssueKind::NoLogicalCredential);
    assert!(!result.warnings[0].blocking);
    assert_eq!(result.resolved_mappings.len(), 1);
    assert!(result.resolved_mappings[0].auto_create);
    assert_eq!(result.resolved_mappings[0].target_physical_id, "prod-slack");
}

#[tokio::test]
async fn test_missing_logical_credential_without_target_match_blocks() {
    let s = Setup::new(test_config()).await;
    s.ctx.runtime(&s.prod).add_credential(SLACK, "prod-slack", "alerts");
    let wf = s
        .dev_workflow("17", "Notify", &[CredentialFixture::new(SLACK, "dev-slack", "notifications")])
        .await;

    let result = s
        .ctx
        .state
        .preflight
        .preflight(s.ctx.tenant_id, &[wf], s.dev.id, s.prod.id)
        .await
        .unwrap();

    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.blocking_issues.len(), 1);
    assert_eq!(result.blocking_issues[0].kind, PreflightIssueKind::MissingMapping);
    assert!(result.resolved_mappings.is_empty());
}

#[tokio::test]
async fn test_missing_logical_credential_can_be_configured_to_block() {
    let config = Config {
        preflight_block_on_missing_logical: true,
        ..test_config()
    };
    let s = Setup::new(config).await;
    s.ctx.runtime(&s.prod).add_credential(SLACK, "prod-slack", "notifications");
    let wf = s
        .dev_workflow("17", "Notify", &[CredentialFixture::new(SLACK, "dev-slack", "notifications")])
        .await;

    let result = s
        .ctx
        .state
        .preflight
        .preflight(s.ctx.tenant_id, &[wf], s.dev.id, s.prod.id)
        .await
        .unwrap();

    assert!(result.warnings.is_empty());
    assert_eq!(result.blocking_issues.len(), 1);
    assert_eq!(result.blocking_issues[0].kind, PreflightIssueKind::NoLogicalCredential);
    assert!(result.resolved_mappings.is_empty());
}

#[tokio::test]
async fn test_unknown_workflow_is_reported() {
    let s = Setup::new(test_config()).await;
    let missing = Uuid::new_v4();

    let result = s
        .ctx
        .state
        .preflight
        .preflight(s.ctx.tenant_id, &[missing, missing], s.dev.id, s.prod.id)
        .await
        .unwrap();

    assert_eq!(result.blocking_issues.len(), 1);
    assert_eq!(result.blocking_issues[0].kind, PreflightIssueKind::WorkflowNotFound);
}

#[tokio::test]
async fn test_target_credentials_are_listed_once_per_type() {
    let s = Setup::new(test_config()).await;
    let slack = s.logical(SLACK, "notifications").await;
    s.map(&slack, &s.dev, "dev-slack", "Slack (dev)").await;
    s.map(&slack, &s.prod, "prod-slack", "Slack (prod)").await;
    s.ctx.runtime(&s.prod).add_credential(SLACK, "prod-slack", "Slack (prod)");

    let creds = [CredentialFixture::new(SLACK, "dev-slack", "Slack (dev)")];
    let a = s.dev_workflow("1", "First", &creds).await;
    let b = s.dev_workflow("2", "Second", &creds).await;

    let result = s
        .ctx
        .state
        .preflight
        .preflight(s.ctx.tenant_id, &[a, b], s.dev.id, s.prod.id)
        .await
        .unwrap();

    assert!(result.is_clear());
    assert_eq!(result.resolved_mappings.len(), 2);
    assert_eq!(s.ctx.runtime(&s.prod).credential_lists(), 1);
}

#[tokio::test]
async fn test_same_source_and_target_is_rejected() {
    let s = Setup::new(test_config()).await;
    let result = s
        .ctx
        .state
        .preflight
        .preflight(s.ctx.tenant_id, &[Uuid::new_v4()], s.dev.id, s.dev.id)
        .await;
    assert!(matches!(result, Err(PreflightError::SameEnvironment)));
}
