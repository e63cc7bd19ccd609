// End-to-end tests: persisted configuration, reconcile cycles and update windows

use connector_manager::{builtin_registry, Agent, FeatureBindings, Gateway, LifecycleManager};
use serde_json::json;
use snamp::config::{new_runtime_settings, SnampConfig};
use snamp::configuration::{
    AgentConfiguration, AttributeConfiguration, ConfigurationManager, GatewayConfiguration,
    ResourceConfiguration, ResourceGroupConfiguration,
};
use snamp::persistence::{ConfigurationStore, FileConfigurationStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

fn create_agent(path: &Path) -> Agent {
    let mut config = SnampConfig::default();
    config.update_window.duration_ms = 1000;
    let settings = new_runtime_settings(&config);
    let bindings = Arc::new(FeatureBindings::new());
    let lifecycle = LifecycleManager::new(
        builtin_registry(Arc::clone(&bindings)),
        bindings,
        Arc::clone(&settings),
        Duration::from_millis(50),
    );
    lifecycle.start();
    let store = Arc::new(FileConfigurationStore::new(path).unwrap());
    Agent::new(ConfigurationManager::with_store(store), lifecycle, settings, true)
}

fn plant() -> AgentConfiguration {
    let mut configuration = AgentConfiguration::new();
    configuration.resource_groups.insert(
        "boilers",
        ResourceGroupConfiguration::new("memory")
            .with_parameter("site", "north")
            .with_attribute(
                "temperature",
                AttributeConfiguration::new().with_parameter("default", "20"),
            ),
    );
    configuration
        .resources
        .insert("b1", ResourceConfiguration::new("", "mem://b1").with_group("boilers"));
    configuration
        .resources
        .insert("b2", ResourceConfiguration::new("", "mem://b2").with_group("boilers"));
    configuration
        .gateways
        .insert("log", GatewayConfiguration::new("journal"));
    configuration
}

#[tokio::test(start_paused = true)]
async fn test_configuration_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("agent.json.gz");

    let agent = create_agent(&path);
    let outcome = agent.reconcile(&plant()).await;
    assert!(outcome.is_success());
    assert!(outcome.saved);
    agent.shutdown().await;

    let restarted = create_agent(&path);
    let outcome = restarted.load_and_reconcile().await.unwrap().unwrap();
    assert_eq!(outcome.change_count, 4);
    assert!(restarted.lifecycle().resources().contains("b1"));
    assert!(restarted.lifecycle().resources().contains("b2"));
    assert_eq!(restarted.configuration().snapshot(), plant());

    // Inherited feature is bound
    let binding = restarted
        .lifecycle()
        .bindings()
        .lookup("b2", "temperature")
        .unwrap();
    assert_eq!(binding.accessor.read().await.unwrap(), json!(20));
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_edits_is_one_update() {
    let dir = TempDir::new().unwrap();
    let agent = create_agent(&dir.path().join("agent.toml"));
    agent.reconcile(&plant()).await;

    for value in ["21", "22", "23"] {
        let mut target = agent.configuration().snapshot();
        target.resources.insert(
            "b1",
            ResourceConfiguration::new("", "mem://b1")
                .with_group("boilers")
                .with_attribute(
                    "temperature",
                    AttributeConfiguration::new().with_parameter("default", value),
                ),
        );
        let outcome = agent.reconcile(&target).await;
        assert_eq!(outcome.change_count, 1);
        sleep(Duration::from_millis(300)).await;
    }
    assert!(agent.lifecycle().resources().is_updating("b1"));

    sleep(Duration::from_millis(1500)).await;
    let status = agent.lifecycle().resources().status("b1").unwrap();
    assert_eq!(status.update_count, 1);
    assert!(!agent.lifecycle().resources().is_updating("b1"));

    let binding = agent.lifecycle().bindings().lookup("b1", "temperature").unwrap();
    assert_eq!(binding.accessor.read().await.unwrap(), json!(23));
}

#[tokio::test(start_paused = true)]
async fn test_group_edit_reaches_every_member() {
    let dir = TempDir::new().unwrap();
    let agent = create_agent(&dir.path().join("agent.toml"));
    agent.reconcile(&plant()).await;

    let mut target = plant();
    target.resource_groups.insert(
        "boilers",
        ResourceGroupConfiguration::new("memory")
            .with_parameter("site", "north")
            .with_attribute("temperature", AttributeConfiguration::new())
            .with_attribute("pressure", AttributeConfiguration::new()),
    );
    let outcome = agent.reconcile(&target).await;
    assert_eq!(outcome.change_count, 1);
    assert!(outcome.is_success());

    sleep(Duration::from_millis(1500)).await;
    let bindings = agent.lifecycle().bindings();
    assert!(bindings.lookup("b1", "pressure").is_some());
    assert!(bindings.lookup("b2", "pressure").is_some());

    let gateway = agent.lifecycle().gateways().get("log").unwrap();
    assert_eq!(gateway.exposed_features()["b1"].len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_resource_retried_from_saved_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("agent.toml");
    let agent = create_agent(&path);

    let mut target = plant();
    target.resources.insert(
        "b3",
        ResourceConfiguration::new("memory", "mem://b3").with_parameter("fail_connect", "true"),
    );
    let outcome = agent.reconcile(&target).await;
    assert_eq!(outcome.report.failures.len(), 1);

    // The file keeps what was asked for; the baseline forgets the failure
    let stored = FileConfigurationStore::new(&path).unwrap().load().unwrap();
    assert!(stored.resources.contains("b3"));
    assert!(!agent.configuration().snapshot().resources.contains("b3"));

    let outcome = agent.load_and_reconcile().await.unwrap().unwrap();
    assert_eq!(outcome.change_count, 1);
    assert_eq!(outcome.report.failures.len(), 1);
}
