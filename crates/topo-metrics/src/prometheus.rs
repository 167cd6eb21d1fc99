//! Prometheus exposition.
//!
//! Scrape targets are rendered in the HTTP service-discovery format a
//! Prometheus server polls; reconciliation status is rendered in the text
//! exposition format for `/metrics`.

use std::collections::BTreeMap;

use serde::Serialize;

use topo_state::{Member, MemberPhase, ScrapeTarget, StateStore, Volume, VolumeState, WorkloadPhase, WorkloadStatus};

use crate::discovery::DiscoveryFeed;

#[derive(Debug, Serialize, PartialEq, Eq)]
struct SdGroup {
    targets: Vec<String>,
    labels: BTreeMap<String, String>,
}

/// Render targets as Prometheus HTTP SD groups, one group per
/// (job, metrics path, interval).
pub fn render_http_sd(targets: &[ScrapeTarget]) -> serde_json::Value {
    let mut groups: BTreeMap<(&str, &str, u64), Vec<String>> = BTreeMap::new();
    for t in targets {
        groups
            .entry((t.job_name.as_str(), t.metrics_path.as_str(), t.interval_secs))
            .or_default()
            .push(t.endpoint());
    }

    let groups: Vec<SdGroup> = groups
        .into_iter()
        .map(|((job, path, interval), targets)| SdGroup {
            targets,
            labels: BTreeMap::from([
                ("job".to_string(), job.to_string()),
                ("__metrics_path__".to_string(), path.to_string()),
                ("__scrape_interval__".to_string(), format!("{interval}s")),
            ]),
        })
        .collect();
    serde_json::to_value(groups).unwrap_or_default()
}

/// Point-in-time status for the `/metrics` endpoint.
#[derive(Debug, Default)]
pub struct StatusReport {
    pub statuses: Vec<WorkloadStatus>,
    pub members: Vec<Member>,
    pub volumes: Vec<Volume>,
    pub scrape_targets: usize,
}

impl StatusReport {
    pub fn collect(state: &StateStore, feed: &DiscoveryFeed) -> anyhow::Result<Self> {
        Ok(Self {
            statuses: state.list_statuses()?,
            members: state.list_all_members()?,
            volumes: state.list_all_volumes()?,
            scrape_targets: feed.current().len(),
        })
    }
}

/// Render a status report into Prometheus text format.
///
/// Produces GAUGE metrics with `workload` labels.
pub fn render_prometheus(report: &StatusReport) -> String {
    let mut out = String::new();

    out.push_str("# HELP topo_workload_phase Reconciliation phase (1 for the current phase).\n");
    out.push_str("# TYPE topo_workload_phase gauge\n");
    for s in &report.statuses {
        for phase in WorkloadPhase::ALL {
            out.push_str(&format!(
                "topo_workload_phase{{workload=\"{}\",phase=\"{}\"}} {}\n",
                s.workload,
                phase.as_str(),
                u8::from(s.phase == phase)
            ));
        }
    }

    out.push_str("# HELP topo_workload_observed_generation Last spec generation reconciled.\n");
    out.push_str("# TYPE topo_workload_observed_generation gauge\n");
    for s in &report.statuses {
        out.push_str(&format!(
            "topo_workload_observed_generation{{workload=\"{}\"}} {}\n",
            s.workload, s.observed_generation
        ));
    }

    out.push_str("# HELP topo_workload_last_actions Actions executed by the last pass.\n");
    out.push_str("# TYPE topo_workload_last_actions gauge\n");
    for s in &report.statuses {
        out.push_str(&format!(
            "topo_workload_last_actions{{workload=\"{}\"}} {}\n",
            s.workload, s.last_actions
        ));
    }

    // Keyed by lifecycle position so phases print in a stable order.
    let mut members: BTreeMap<(&str, usize), u64> = BTreeMap::new();
    for m in &report.members {
        let pos = MemberPhase::ALL.iter().position(|p| *p == m.phase).unwrap_or_default();
        *members.entry((m.workload.as_str(), pos)).or_default() += 1;
    }
    out.push_str("# HELP topo_members Members by phase.\n");
    out.push_str("# TYPE topo_members gauge\n");
    for ((workload, pos), count) in &members {
        out.push_str(&format!(
            "topo_members{{workload=\"{workload}\",phase=\"{}\"}} {count}\n",
            MemberPhase::ALL[*pos].as_str()
        ));
    }

    let mut volumes: BTreeMap<(&str, &'static str), u64> = BTreeMap::new();
    for v in &report.volumes {
        *volumes.entry((v.workload.as_str(), v.state.as_str())).or_default() += 1;
    }
    out.push_str("# HELP topo_volumes Volumes by state.\n");
    out.push_str("# TYPE topo_volumes gauge\n");
    for ((workload, state), count) in &volumes {
        out.push_str(&format!(
            "topo_volumes{{workload=\"{workload}\",state=\"{state}\"}} {count}\n"
        ));
    }

    let released: u64 = report
        .volumes
        .iter()
        .filter(|v| v.state == VolumeState::Released)
        .map(|v| v.size_bytes)
        .sum();
    out.push_str("# HELP topo_released_volume_bytes Bytes held by released volumes awaiting purge.\n");
    out.push_str("# TYPE topo_released_volume_bytes gauge\n");
    out.push_str(&format!("topo_released_volume_bytes {released}\n"));

    out.push_str("# HELP topo_scrape_targets Targets currently published to discovery.\n");
    out.push_str("# TYPE topo_scrape_targets gauge\n");
    out.push_str(&format!("topo_scrape_targets {}\n", report.scrape_targets));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use topo_state::MemberId;

    fn target(job: &str, address: &str, port: u16) -> ScrapeTarget {
        ScrapeTarget {
            job_name: job.to_string(),
            address: address.to_string(),
            port,
            interval_secs: 15,
            metrics_path: "/metrics".to_string(),
        }
    }

    fn status(workload: &str, phase: WorkloadPhase) -> WorkloadStatus {
        WorkloadStatus {
            workload: workload.to_string(),
            phase,
            message: None,
            observed_generation: 2,
            last_actions: 3,
            updated_at: 0,
        }
    }

    fn member(workload: &str, n: u32, phase: MemberPhase) -> Member {
        Member {
            workload: workload.to_string(),
            id: MemberId::Ordinal(n),
            address: format!("{workload}-{n}"),
            phase,
            revision: "r1".to_string(),
            handle: None,
            volume_id: None,
            attempts: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn volume(workload: &str, ordinal: u32, state: VolumeState) -> Volume {
        Volume {
            id: format!("data-{workload}-{ordinal}"),
            workload: workload.to_string(),
            ordinal,
            size_bytes: 1024,
            state,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn http_sd_groups_targets_by_job() {
        let targets = vec![
            target("mongodb", "mongodb-0.mongodb.topo.local", 27017),
            target("mongodb", "mongodb-1.mongodb.topo.local", 27017),
            target("web", "web-a.web.topo.local", 3000),
        ];
        let sd = render_http_sd(&targets);
        assert_eq!(
            sd,
            serde_json::json!([
                {
                    "targets": [
                        "mongodb-0.mongodb.topo.local:27017",
                        "mongodb-1.mongodb.topo.local:27017"
                    ],
                    "labels": {
                        "job": "mongodb",
                        "__metrics_path__": "/metrics",
                        "__scrape_interval__": "15s"
                    }
                },
                {
                    "targets": ["web-a.web.topo.local:3000"],
                    "labels": {
                        "job": "web",
                        "__metrics_path__": "/metrics",
                        "__scrape_interval__": "15s"
                    }
                }
            ])
        );
    }

    #[test]
    fn http_sd_of_nothing_is_empty_list() {
        assert_eq!(render_http_sd(&[]), serde_json::json!([]));
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&StatusReport::default());
        assert!(output.contains("# TYPE topo_workload_phase gauge"));
        assert!(output.contains("topo_scrape_targets 0"));
    }

    #[test]
    fn render_status_report() {
        let report = StatusReport {
            statuses: vec![status("db", WorkloadPhase::Degraded)],
            members: vec![
                member("db", 0, MemberPhase::Running),
                member("db", 1, MemberPhase::Running),
                member("db", 2, MemberPhase::Failed),
            ],
            volumes: vec![
                volume("db", 0, VolumeState::Bound),
                volume("db", 3, VolumeState::Released),
            ],
            scrape_targets: 2,
        };
        let output = render_prometheus(&report);

        assert!(output.contains("topo_workload_phase{workload=\"db\",phase=\"degraded\"} 1"));
        assert!(output.contains("topo_workload_phase{workload=\"db\",phase=\"stable\"} 0"));
        assert!(output.contains("topo_workload_observed_generation{workload=\"db\"} 2"));
        assert!(output.contains("topo_workload_last_actions{workload=\"db\"} 3"));
        assert!(output.contains("topo_members{workload=\"db\",phase=\"running\"} 2"));
        assert!(output.contains("topo_members{workload=\"db\",phase=\"failed\"} 1"));
        assert!(output.contains("topo_volumes{workload=\"db\",state=\"released\"} 1"));
        assert!(output.contains("topo_released_volume_bytes 1024"));
        assert!(output.contains("topo_scrape_targets 2"));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let report = StatusReport {
            statuses: vec![status("web", WorkloadPhase::Stable)],
            ..Default::default()
        };
        for line in render_prometheus(&report).lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (series, value) = line.rsplit_once(' ').expect("series and value");
            assert!(series.starts_with("topo_"), "bad series: {line}");
            assert!(value.parse::<f64>().is_ok(), "bad value: {line}");
        }
    }
}
