use std::path::PathBuf;

use recon_workflow::EnvironmentRegistry;

#[tokio::test]
async fn shipped_registry_declares_all_environments() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../environments.yaml");
    let registry = EnvironmentRegistry::load(&path).await.expect("registry");

    assert_eq!(registry.names().collect::<Vec<_>>(), ["PROD", "DEMO", "FUNK"]);
    for env in &registry.environments {
        assert_eq!(env.jobs.len(), 6, "{}", env.name);
        assert!(!env.to.is_empty(), "{}", env.name);
    }
    assert_eq!(registry.get("prod").expect("prod").jira_env_id.as_deref(), Some("10258"));
    assert_eq!(registry.get("FUNK").expect("funk").jira_env_id, None);
}
