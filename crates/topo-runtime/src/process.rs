//! Local-process substrate.
//!
//! Each member is a child process. The workload `image` is interpreted as a
//! command line; the member's resolved environment is passed through, along
//! with `TOPO_WORKLOAD`, `TOPO_MEMBER`, `TOPO_ADDRESS`, `PORT` (first
//! declared port) and `TOPO_VOLUME_DIR` when a volume is attached. Volumes
//! are directories under `<root>/volumes`. Readiness is an HTTP probe on
//! the first declared port, or process liveness when none is declared.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{SubstrateError, SubstrateResult};
use crate::probe::http_probe;
use crate::substrate::{MemberHandle, MemberSpec, ProbeResult, Substrate, VolumeClaim};

const LOCAL_ADDRESS: &str = "127.0.0.1";

struct ProcessMember {
    child: Child,
    probe_port: Option<u16>,
}

pub struct ProcessSubstrate {
    root: PathBuf,
    probe_path: String,
    probe_timeout: Duration,
    members: Mutex<HashMap<String, ProcessMember>>,
}

impl ProcessSubstrate {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            probe_path: "/healthz".to_string(),
            probe_timeout: Duration::from_secs(2),
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_probe_path(mut self, path: impl Into<String>) -> Self {
        self.probe_path = path.into();
        self
    }

    fn volume_dir(&self, volume_id: &str) -> PathBuf {
        self.root.join("volumes").join(volume_id)
    }
}

fn split_command(image: &str) -> SubstrateResult<(String, Vec<String>)> {
    let mut parts = image.split_whitespace().map(str::to_string);
    let program = parts
        .next()
        .ok_or_else(|| SubstrateError::Permanent("empty command".into()))?;
    Ok((program, parts.collect()))
}

fn signal_term(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a pid we own; failure only means it already exited.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

async fn ensure_dir(path: &Path) -> SubstrateResult<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| SubstrateError::Transient(format!("create {}: {e}", path.display())))
}

#[async_trait]
impl Substrate for ProcessSubstrate {
    async fn create(&self, spec: &MemberSpec) -> SubstrateResult<MemberHandle> {
        let (program, args) = split_command(&spec.image)?;
        let handle_id = format!("{}-{}", spec.workload, spec.member.key());

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .env("TOPO_WORKLOAD", &spec.workload)
            .env("TOPO_MEMBER", spec.member.to_string())
            .env("TOPO_ADDRESS", &spec.address)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (name, value) in spec.env.iter() {
            cmd.env(name, value);
        }
        if let Some(port) = spec.ports.first() {
            cmd.env("PORT", port.to_string());
        }
        if let Some(volume_id) = &spec.volume_id {
            let dir = self.volume_dir(volume_id);
            if !dir.is_dir() {
                return Err(SubstrateError::Permanent(format!(
                    "volume {volume_id} is not provisioned"
                )));
            }
            cmd.env("TOPO_VOLUME_DIR", dir);
        }

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                SubstrateError::Permanent(format!("cannot start {program}: {e}"))
            }
            _ => SubstrateError::Transient(format!("cannot start {program}: {e}")),
        })?;

        info!(handle = %handle_id, pid = ?child.id(), %program, "member process started");

        let mut members = self.members.lock().await;
        if let Some(mut stale) = members.remove(&handle_id) {
            let _ = stale.child.start_kill();
        }
        members.insert(
            handle_id.clone(),
            ProcessMember {
                child,
                probe_port: spec.ports.first().copied(),
            },
        );

        Ok(MemberHandle {
            id: handle_id,
            address: LOCAL_ADDRESS.to_string(),
        })
    }

    async fn terminate(&self, handle: &MemberHandle, grace: Duration) -> SubstrateResult<()> {
        let Some(mut member) = self.members.lock().await.remove(&handle.id) else {
            return Ok(());
        };

        signal_term(&member.child);
        match tokio::time::timeout(grace, member.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(handle = %handle.id, %status, "member process exited");
            }
            Ok(Err(e)) => {
                return Err(SubstrateError::Transient(format!("wait {}: {e}", handle.id)));
            }
            Err(_) => {
                warn!(handle = %handle.id, ?grace, "grace period elapsed, killing member process");
                member
                    .child
                    .kill()
                    .await
                    .map_err(|e| SubstrateError::Transient(format!("kill {}: {e}", handle.id)))?;
            }
        }
        Ok(())
    }

    async fn probe(&self, handle: &MemberHandle) -> ProbeResult {
        let probe_port = {
            let mut members = self.members.lock().await;
            let Some(member) = members.get_mut(&handle.id) else {
                return ProbeResult::Failed;
            };
            match member.child.try_wait() {
                Ok(None) => member.probe_port,
                Ok(Some(status)) => {
                    debug!(handle = %handle.id, %status, "member process has exited");
                    return ProbeResult::Failed;
                }
                Err(_) => return ProbeResult::Failed,
            }
        };

        match probe_port {
            Some(port) => {
                let address = format!("{}:{port}", handle.address);
                http_probe(&address, &self.probe_path, self.probe_timeout).await
            }
            None => ProbeResult::Healthy,
        }
    }

    async fn provision_volume(&self, claim: &VolumeClaim) -> SubstrateResult<()> {
        let dir = self.volume_dir(&claim.volume_id);
        ensure_dir(&dir).await?;
        debug!(volume = %claim.volume_id, path = %dir.display(), "volume provisioned");
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> SubstrateResult<()> {
        let dir = self.volume_dir(volume_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SubstrateError::Transient(format!(
                "remove {}: {e}",
                dir.display()
            ))),
        }
    }
}
