//! topo-runtime — compute substrate and secret store interfaces for topo.
//!
//! The reconciler drives workloads through the [`Substrate`] trait and
//! resolves secret references through [`SecretStore`]. Two substrates ship
//! with topo:
//!
//! - [`SimSubstrate`]: in-memory, with fault injection; used by tests and
//!   dry runs.
//! - [`ProcessSubstrate`]: local child processes with HTTP readiness probes.

pub mod error;
pub mod probe;
pub mod process;
pub mod secrets;
pub mod sim;
pub mod substrate;

pub use error::{SecretError, SubstrateError, SubstrateResult};
pub use probe::http_probe;
pub use process::ProcessSubstrate;
pub use secrets::{FileSecretStore, ResolvedEnv, SecretStore, StaticSecretStore, resolve_env};
pub use sim::{SimOp, SimSubstrate};
pub use substrate::{MemberHandle, MemberSpec, ProbeResult, Substrate, VolumeClaim, bounded};
