use evergreen::config::{RegistryFlavor, SortRule};
use evergreen::selector::EditSource;
use evergreen::{Config, Orchestrator};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_config(dir: &TempDir, registry_url: &str) -> std::path::PathBuf {
    let root = dir.path().join("repo");
    let toml = format!(
        r#"
log_level = "debug"
state_path = '{state}'

[scanner]
root = '{root}'
exclude_patterns = ["vendor/**"]

[policy]
tag_pattern = '^\d+\.\d+$'

[[policy.images]]
image = "team/app"
explicit_mappings = {{ "1.0" = "1.1" }}

[[policy.images]]
image = "team/nightly"
tag_pattern = '^\d{{8}}$'
sort_rule = "lexical"

[registry]
base_url = '{registry_url}'
flavor = "distribution"
backoff_base_ms = 1

[watch]
cron = "0 3 * * *"
run_on_startup = false
"#,
        state = dir.path().join("state.json").display(),
        root = root.display(),
    );
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, toml).unwrap();
    config_path
}

#[test]
fn file_values_and_defaults_combine() {
    let dir = TempDir::new().unwrap();
    let config = Config::load_from_path(&write_config(&dir, "https://registry.example")).unwrap();

    assert_eq!(config.registry.flavor, RegistryFlavor::Distribution);
    assert_eq!(config.registry.page_size, 100);
    assert_eq!(config.policy.sort_rule, SortRule::Semver);
    assert_eq!(config.policy.images.len(), 2);
    assert_eq!(config.policy.images[1].sort_rule, Some(SortRule::Lexical));
    assert_eq!(config.watch.cron.as_deref(), Some("0 3 * * *"));
    assert!(!config.watch.run_on_startup);
    assert_eq!(config.resolved_state_path(), dir.path().join("state.json"));
    assert_eq!(config.git.push_options, vec!["ci.skip".to_string()]);
}

#[test]
fn invalid_values_are_rejected_on_load() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, "[policy]\ntag_pattern = '(unclosed'\n").unwrap();
    let err = Config::load_from_path(&config_path).unwrap_err();
    assert!(format!("{err:#}").contains("tag_pattern"));
}

#[tokio::test]
async fn per_image_overrides_drive_the_plan() {
    let dir = TempDir::new().unwrap();
    let registry = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/team/app/tags/list"))
        .and(query_param("n", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "team/app",
            "tags": ["1.0", "1.1", "1.2", "2.0-rc"]
        })))
        .expect(1)
        .mount(&registry)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/team/nightly/tags/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "team/nightly",
            "tags": ["20260101", "20260301", "20260215", "latest"]
        })))
        .expect(1)
        .mount(&registry)
        .await;

    let config = Config::load_from_path(&write_config(&dir, &registry.uri())).unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(repo.join("vendor")).unwrap();
    std::fs::write(
        repo.join("Dockerfile"),
        "FROM team/app:1.0 AS app\nFROM team/nightly:20260101\n",
    )
    .unwrap();
    std::fs::write(repo.join("vendor/Dockerfile"), "FROM team/other:0.1\n").unwrap();

    let orchestrator = Orchestrator::from_config(config).unwrap();
    let (report, outcome) = orchestrator.preview().await.unwrap();

    assert_eq!(report.references.len(), 2);
    assert!(outcome.skipped.is_empty());
    let edits: Vec<_> = outcome.plan.edits().collect();
    assert_eq!(edits.len(), 2);
    assert_eq!(edits[0].reference.image_name, "team/app");
    assert_eq!(edits[0].target_tag, "1.1");
    assert_eq!(edits[0].source, EditSource::ExplicitMapping);
    assert_eq!(edits[1].reference.image_name, "team/nightly");
    assert_eq!(edits[1].target_tag, "20260301");
    assert_eq!(edits[1].source, EditSource::PolicyDerived);
}
