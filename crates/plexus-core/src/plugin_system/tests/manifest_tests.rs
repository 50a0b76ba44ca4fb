#![cfg(test)]

use std::io::Write;
use std::path::PathBuf;

use tempfile::{Builder, NamedTempFile};

use crate::config::ConfigFormat;
use crate::plugin_system::dependency::{Dependency, Platform};
use crate::plugin_system::descriptor::LoadingMode;
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::report::ConditionKind;
use crate::plugin_system::manifest::{load_manifest, DescriptorManifest};

fn manifest_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const JSON_MANIFEST: &str = r#"{
  "plugins": [
    { "id": "net.x", "version": "1.2.0", "provides": ["transport"], "code_units": ["net_x"] },
    { "id": "net.y", "version": "1.0.0", "loading": "lazy", "consumes": ["transport"],
      "requires": [
        { "plugin": "net.x", "version": "1.x.x", "slot": "link" },
        { "package": "openssl", "version": "3.x", "platform": "linux" }
      ] }
  ]
}"#;

#[test]
fn test_load_json_manifest() {
    let file = manifest_file(".json", JSON_MANIFEST);
    let descriptors = load_manifest(file.path()).unwrap().descriptors;
    assert_eq!(descriptors.len(), 2);

    let x = &descriptors[0];
    assert_eq!(x.id(), "net.x");
    assert!(x.provided().contains("transport"));
    assert_eq!(x.code_units(), ["net_x".to_string()]);
    assert_eq!(x.loading_mode(), LoadingMode::Eager);

    let y = &descriptors[1];
    assert_eq!(y.loading_mode(), LoadingMode::Lazy);
    assert_eq!(y.code_units(), ["net.y".to_string()]);
    match &y.dependencies()[0] {
        Dependency::Plugin(dep) => {
            assert_eq!(dep.plugin_id, "net.x");
            assert_eq!(dep.pattern.as_str(), "1.x.x");
            assert_eq!(dep.slot_name(), "link");
        }
        other => panic!("expected a plugin dependency, got {:?}", other),
    }
    match &y.dependencies()[1] {
        Dependency::Package(dep) => {
            assert_eq!(dep.name, "openssl");
            assert_eq!(dep.platform, Some(Platform::Linux));
        }
        other => panic!("expected a package dependency, got {:?}", other),
    }
}

#[test]
fn test_dependency_without_version_accepts_any() {
    let manifest = DescriptorManifest::parse(
        r#"{ "plugins": [ { "id": "app", "version": "0.1.0", "requires": [ { "plugin": "core" } ] } ] }"#,
        ConfigFormat::Json,
    )
    .unwrap();
    let descriptors = manifest.into_descriptors().unwrap().descriptors;
    let dep = descriptors[0].plugin_dependencies().next().unwrap();
    assert_eq!(dep.pattern.as_str(), "*");
}

#[test]
fn test_empty_manifest() {
    let file = manifest_file(".json", "{}");
    let contents = load_manifest(file.path()).unwrap();
    assert!(contents.descriptors.is_empty());
    assert!(contents.rejected.is_empty());
}

#[cfg(feature = "yaml-config")]
#[test]
fn test_load_yaml_manifest() {
    let file = manifest_file(
        ".yaml",
        r#"
plugins:
  - id: cache
    version: 2.0.0
    provides: [cache]
  - id: web
    version: 1.0.0
    consumes: [cache]
    requires:
      - plugin: cache
        version: "2"
"#,
    );
    let descriptors = load_manifest(file.path()).unwrap().descriptors;
    assert_eq!(descriptors.iter().map(|d| d.id()).collect::<Vec<_>>(), ["cache", "web"]);
    assert_eq!(descriptors[1].plugin_dependencies().count(), 1);
}

#[cfg(feature = "toml-config")]
#[test]
fn test_load_toml_manifest() {
    let file = manifest_file(
        ".toml",
        r#"
[[plugins]]
id = "cache"
version = "2.0.0"
provides = ["cache"]
loading = "lazy"

[[plugins]]
id = "web"
version = "1.0.0"
requires = [{ plugin = "cache", version = "2.x" }]
"#,
    );
    let descriptors = load_manifest(file.path()).unwrap().descriptors;
    assert_eq!(descriptors[0].loading_mode(), LoadingMode::Lazy);
    assert_eq!(descriptors[1].dependencies().len(), 1);
}

#[test]
fn test_invalid_version_rejects_only_that_entry() {
    let file = manifest_file(
        ".json",
        r#"{ "plugins": [
            { "id": "core", "version": "1.0.0" },
            { "id": "app", "version": "1.0.0", "requires": [ { "plugin": "core", "version": "1.x.3" } ] },
            { "id": "odd", "version": "1.0" }
        ] }"#,
    );
    let contents = load_manifest(file.path()).unwrap();
    assert_eq!(contents.descriptors.iter().map(|d| d.id()).collect::<Vec<_>>(), ["core"]);
    assert_eq!(
        contents.rejected.iter().map(|c| c.plugin_id.as_str()).collect::<Vec<_>>(),
        ["app", "odd"]
    );
    assert!(contents.rejected.iter().all(|c| c.kind == ConditionKind::InvalidVersionFormat));
    assert!(contents.rejected[0].message.contains("1.x.3"), "unexpected message: {}", contents.rejected[0].message);
}

#[test]
fn test_invalid_id_fails_the_manifest() {
    let file = manifest_file(".json", r#"{ "plugins": [ { "id": "bad id!", "version": "1.0.0" } ] }"#);
    match load_manifest(file.path()) {
        Err(PluginSystemError::ManifestError { path, source, .. }) => {
            assert_eq!(path, file.path());
            assert!(source.is_some());
        }
        other => panic!("expected a manifest error, got {:?}", other),
    }
}

#[test]
fn test_malformed_manifest() {
    let file = manifest_file(".json", r#"{ "plugins": [ { "id": "app" } ] }"#);
    assert!(matches!(load_manifest(file.path()), Err(PluginSystemError::ManifestError { .. })));
}

#[test]
fn test_unsupported_extension() {
    let file = manifest_file(".ini", "[plugins]");
    match load_manifest(file.path()) {
        Err(PluginSystemError::ManifestError { message, .. }) => {
            assert!(message.contains("Unsupported configuration format"))
        }
        other => panic!("expected a manifest error, got {:?}", other),
    }
}

#[test]
fn test_missing_file() {
    let path = PathBuf::from("/definitely/not/here/plugins.json");
    assert!(matches!(load_manifest(&path), Err(PluginSystemError::ManifestError { .. })));
}
