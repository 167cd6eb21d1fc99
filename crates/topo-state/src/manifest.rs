//! Manifest loading — desired-state documents from files on disk.
//!
//! Two formats are accepted:
//!
//! - JSON: one document object, or an array of them, each tagged by `kind`
//!   with the record under `spec`.
//! - TOML: arrays of tables named after the kind:
//!
//! ```toml
//! [[workload]]
//! name = "db"
//! kind = "stateful"
//! ...
//!
//! [[service]]
//! name = "db"
//! ...
//! ```
//!
//! The TOML `kind` key inside a `[[workload]]` table is the workload kind
//! (stateful/stateless), not the document kind.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::document::Document;
use crate::error::{StateError, StateResult};
use crate::types::{IngressRule, ServiceRecord, WorkloadSpec};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlManifest {
    workload: Vec<WorkloadSpec>,
    service: Vec<ServiceRecord>,
    ingress: Vec<IngressRule>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonManifest {
    Many(Vec<Document>),
    One(Box<Document>),
}

fn manifest_err(path: &Path, e: impl std::fmt::Display) -> StateError {
    StateError::Manifest(format!("{}: {e}", path.display()))
}

/// Parse TOML manifest text.
pub fn parse_toml(content: &str) -> Result<Vec<Document>, toml::de::Error> {
    let manifest: TomlManifest = toml::from_str(content)?;
    let mut docs = Vec::new();
    docs.extend(manifest.workload.into_iter().map(Document::Workload));
    docs.extend(manifest.service.into_iter().map(Document::Service));
    docs.extend(manifest.ingress.into_iter().map(Document::Ingress));
    Ok(docs)
}

/// Parse JSON manifest text.
pub fn parse_json(content: &str) -> Result<Vec<Document>, serde_json::Error> {
    Ok(match serde_json::from_str::<JsonManifest>(content)? {
        JsonManifest::Many(docs) => docs,
        JsonManifest::One(doc) => vec![*doc],
    })
}

/// Load one manifest file.
pub fn load_file(path: &Path) -> StateResult<Vec<Document>> {
    let content = std::fs::read_to_string(path).map_err(|e| manifest_err(path, e))?;
    let docs = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => parse_toml(&content).map_err(|e| manifest_err(path, e))?,
        Some("json") => parse_json(&content).map_err(|e| manifest_err(path, e))?,
        _ => return Err(manifest_err(path, "expected a .toml or .json file")),
    };
    debug!(path = %path.display(), documents = docs.len(), "manifest loaded");
    Ok(docs)
}

/// Load a manifest file, or every `.toml`/`.json` file under a directory
/// (in path order).
pub fn load_path(path: &Path) -> StateResult<Vec<Document>> {
    if path.is_file() {
        return load_file(path);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(|e| manifest_err(path, e))?;
        let is_manifest = matches!(
            entry.path().extension().and_then(|e| e.to_str()),
            Some("toml") | Some("json")
        );
        if entry.file_type().is_file() && is_manifest {
            files.push(entry.into_path());
        }
    }

    let mut docs = Vec::new();
    for file in &files {
        docs.extend(load_file(file)?);
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentKind;
    use crate::types::{EnvValue, ServiceMode, WorkloadKind};

    const TOPOLOGY_TOML: &str = r#"
[[workload]]
name = "db"
kind = "stateful"
replicas = 3
image = "mongo:7"
ports = [27017]
volume = { size_bytes = 1073741824 }

[[workload]]
name = "nodejs-app"
kind = "stateless"
replicas = 2
image = "nodejs-app:v1"
ports = [3000]

[workload.env]
MONGO_URL = "mongodb://db:27017/app"
SESSION_SECRET = { secret_ref = { name = "app-secrets", key = "session" } }

[[service]]
name = "db"
mode = "headless"
workload = "db"
external_port = 27017
target_port = 27017

[[service]]
name = "nodejs-app-service"
mode = "load_balanced"
workload = "nodejs-app"
external_port = 80
target_port = 3000

[[ingress]]
name = "nodejs-app"
host = "nodejs-app.local"
path_prefix = "/"
service = "nodejs-app-service"
"#;

    #[test]
    fn parses_full_topology_from_toml() {
        let docs = parse_toml(TOPOLOGY_TOML).unwrap();
        assert_eq!(docs.len(), 5);

        let Document::Workload(app) = &docs[1] else {
            panic!("expected workload");
        };
        assert_eq!(app.kind, WorkloadKind::Stateless);
        assert!(matches!(app.env["SESSION_SECRET"], EnvValue::Secret { .. }));

        let Document::Service(svc) = &docs[3] else {
            panic!("expected service");
        };
        assert_eq!(svc.mode, ServiceMode::LoadBalanced);

        assert_eq!(docs[4].key().kind, DocumentKind::Ingress);
    }

    #[test]
    fn parses_single_and_many_json_documents() {
        let one = r#"{"kind":"ingress","spec":{"name":"web","host":"a.local","path_prefix":"/","service":"web"}}"#;
        assert_eq!(parse_json(one).unwrap().len(), 1);

        let many = format!("[{one},{one}]");
        assert_eq!(parse_json(&many).unwrap().len(), 2);
    }

    #[test]
    fn loads_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.toml"), TOPOLOGY_TOML).unwrap();
        std::fs::write(
            dir.path().join("nested").join("a.json"),
            r#"{"kind":"ingress","spec":{"name":"api","host":"api.local","path_prefix":"/","service":"x"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let docs = load_path(dir.path()).unwrap();
        assert_eq!(docs.len(), 6);
    }

    #[test]
    fn unknown_extension_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.yaml");
        std::fs::write(&path, "kind: workload").unwrap();
        assert!(matches!(load_file(&path), Err(StateError::Manifest(_))));
    }
}
