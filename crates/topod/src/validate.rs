//! Offline manifest validation.
//!
//! Applies the documents to a scratch in-memory store, so references
//! between documents and immutable-field rules are checked exactly as
//! the daemon would check them.

use std::path::Path;

use topo_state::{DocumentKey, StateStore, manifest};

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub accepted: Vec<DocumentKey>,
    pub rejected: Vec<(DocumentKey, String)>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Validate every manifest under `paths`. Documents are applied in
/// dependency order (workloads, services, ingress), one at a time, so
/// every invalid document is reported rather than only the first.
pub fn validate_manifests(paths: &[&Path]) -> anyhow::Result<ValidationReport> {
    let mut docs = Vec::new();
    for path in paths {
        docs.extend(manifest::load_path(path)?);
    }
    docs.sort_by_key(|d| d.key());

    let scratch = StateStore::open_in_memory()?;
    let mut report = ValidationReport::default();
    for doc in docs {
        match scratch.apply(&doc) {
            Ok(_) => report.accepted.push(doc.key()),
            Err(e) => report.rejected.push((doc.key(), e.to_string())),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_every_rejected_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("app.toml"),
            r#"
[[workload]]
name = "web"
kind = "stateless"
replicas = 2
image = "web:v1"
ports = [8080]

[[service]]
name = "web"
mode = "load_balanced"
workload = "web"
external_port = 80
target_port = 9999

[[ingress]]
name = "web"
host = "web.local"
path_prefix = "/"
service = "missing"
"#,
        )
        .unwrap();

        let report = validate_manifests(&[dir.path()]).unwrap();
        assert!(!report.is_ok());
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.rejected.len(), 2);
        assert!(report.rejected.iter().all(|(_, msg)| msg.starts_with("invalid spec")));
    }
}
