use super::*;
use crate::configuration::{
    AttributeConfiguration, GatewayConfiguration, ResourceConfiguration, ResourceGroupConfiguration,
    ThreadPoolConfiguration,
};
use tempfile::TempDir;

fn sample_configuration() -> AgentConfiguration {
    let mut config = AgentConfiguration::new();
    config.parameters.insert("site".to_string(), "dc1".to_string());
    config
        .resource_groups
        .add("servers", ResourceGroupConfiguration::new("memory"))
        .unwrap();
    config
        .resources
        .add(
            "r1",
            ResourceConfiguration::new("memory", "mem://r1")
                .with_group("servers")
                .with_attribute("temperature", AttributeConfiguration::new().with_timeout_ms(250)),
        )
        .unwrap();
    config
        .gateways
        .add("log", GatewayConfiguration::new("journal"))
        .unwrap();
    config
        .thread_pools
        .add(
            "default",
            ThreadPoolConfiguration {
                queue_size: Some(64),
                ..ThreadPoolConfiguration::default()
            },
        )
        .unwrap();
    config
}

#[test]
fn test_format_from_extension() {
    assert_eq!(StoreFormat::from_path(Path::new("a/agent.toml")).unwrap(), StoreFormat::Toml);
    assert_eq!(StoreFormat::from_path(Path::new("agent.json")).unwrap(), StoreFormat::Json);
    assert_eq!(
        StoreFormat::from_path(Path::new("/var/lib/agent.json.gz")).unwrap(),
        StoreFormat::JsonGz
    );
    assert!(StoreFormat::from_path(Path::new("agent.yaml")).is_err());
    assert!(FileConfigurationStore::new("agent").is_err());
}

#[test]
fn test_save_and_load_each_format() {
    let temp_dir = TempDir::new().unwrap();
    let original = sample_configuration();

    for file in ["agent.toml", "agent.json", "agent.json.gz"] {
        let store = FileConfigurationStore::new(temp_dir.path().join(file)).unwrap();
        store.save(&original).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, original, "format {:?}", store.format());
    }
}

#[test]
fn test_missing_file_loads_empty() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileConfigurationStore::new(temp_dir.path().join("absent.toml")).unwrap();

    let loaded = store.load().unwrap();
    assert!(loaded.is_empty());
    assert!(store.modified_at().is_none());
}

#[test]
fn test_save_creates_parent_and_leaves_no_tmp() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested/dir/agent.json.gz");
    let store = FileConfigurationStore::new(&path).unwrap();

    store.save(&sample_configuration()).unwrap();

    assert!(path.exists());
    assert!(store.modified_at().is_some());
    let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_corrupt_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("agent.json");
    fs::write(&path, b"{ not json").unwrap();

    let store = FileConfigurationStore::new(&path).unwrap();
    assert!(store.load().is_err());
}

#[test]
fn test_toml_hand_written_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("agent.toml");
    fs::write(
        &path,
        r#"
[resources.r1]
connection_type = "memory"
connection_string = "mem://r1"

[resources.r1.parameters]
default = "42"

[resources.r1.attributes.temperature]

[gateways.log]
gateway_type = "journal"
"#,
    )
    .unwrap();

    let loaded = FileConfigurationStore::new(&path).unwrap().load().unwrap();
    let resource = loaded.resources.get("r1").unwrap();
    assert_eq!(resource.connection_type, "memory");
    assert_eq!(resource.parameters["default"], "42");
    assert!(resource.attributes.contains("temperature"));
    assert_eq!(loaded.gateways.get("log").unwrap().gateway_type, "journal");
    assert!(loaded.thread_pools.is_empty());
}

#[test]
fn test_in_memory_store() {
    let store = InMemoryConfigurationStore::new();
    assert!(store.load().unwrap().is_empty());
    assert!(store.modified_at().is_none());

    let config = sample_configuration();
    store.save(&config).unwrap();
    assert_eq!(store.load().unwrap(), config);
    assert!(store.modified_at().is_some());
}
