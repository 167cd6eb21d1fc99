//! Desired-state documents, keyed by kind + name.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{IngressRule, ServiceRecord, WorkloadSpec};

/// One declarative record submitted by an operator, serialized as
/// `{"kind": "workload", "spec": {...}}`. The record sits under `spec`
/// because workloads carry a `kind` field of their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "snake_case")]
pub enum Document {
    Workload(WorkloadSpec),
    Service(ServiceRecord),
    Ingress(IngressRule),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    // Declaration order is apply order: services reference workloads,
    // ingress rules reference services.
    Workload,
    Service,
    Ingress,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Workload => "workload",
            DocumentKind::Service => "service",
            DocumentKind::Ingress => "ingress",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub kind: DocumentKind,
    pub name: String,
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.name)
    }
}

impl Document {
    pub fn key(&self) -> DocumentKey {
        let (kind, name) = match self {
            Document::Workload(w) => (DocumentKind::Workload, &w.name),
            Document::Service(s) => (DocumentKind::Service, &s.name),
            Document::Ingress(i) => (DocumentKind::Ingress, &i.name),
        };
        DocumentKey {
            kind,
            name: name.clone(),
        }
    }
}

/// What `apply` did with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Store change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    WorkloadApplied(String),
    WorkloadDeleted(String),
    ServiceApplied(String),
    ServiceDeleted(String),
    IngressApplied(String),
    IngressDeleted(String),
}
