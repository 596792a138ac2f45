use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// What an intercept is keyed by.
///
/// The registry indexes by `(name, namespace)`; `workload` is carried along
/// because two intercepts with the same name may never target different
/// workloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterceptId {
    pub name: String,
    pub workload: String,
    pub namespace: String,
}

impl fmt::Display for InterceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.workload)
    }
}

/// How the agent decides which requests to divert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mechanism {
    /// Divert every connection to the target port.
    Tcp,
    /// Divert only HTTP requests whose headers match all of the given matchers.
    HttpHeader(Vec<HeaderMatch>),
}

/// A single `(key, value-or-regex)` pair for the http-header mechanism.
///
/// Keys are compared in canonical MIME form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMatch {
    pub key: String,
    pub value: HeaderValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderValue {
    Exact(String),
    Regex(String),
}

impl HeaderMatch {
    /// Whether `value` satisfies this matcher.
    pub fn matches_value(&self, value: &str) -> bool {
        match &self.value {
            HeaderValue::Exact(expected) => expected == value,
            HeaderValue::Regex(pattern) => Regex::new(pattern)
                .map(|re| re.is_match(value))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountIntent {
    /// No filesystem mount.
    None,
    /// Mount at a caller-supplied path.
    Path(PathBuf),
    /// Mount at a generated temporary directory.
    TempDir,
}

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptSpec {
    pub id: InterceptId,
    pub mechanism: Mechanism,
    /// The container port whose traffic is diverted.
    pub target_port: u16,
    /// Where diverted connections are delivered on the workstation.
    pub local_addr: SocketAddr,
    pub mount: MountIntent,
    /// Scale the intercepted container to zero while the intercept is active.
    pub replace: bool,
}

/// What the manager and agent have told us about a running intercept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptRuntime {
    pub agent_pod_ip: Option<IpAddr>,
    pub sftp_port: Option<u16>,
    pub mount_point: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    /// Replica count of the workload before a replace-mode intercept scaled it down.
    pub original_replicas: Option<i32>,
}

/// Lifecycle of one intercept; every transition is driven by a manager snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptState {
    /// The user issued a create; the manager has not acknowledged yet.
    Requested,
    /// The manager accepted the spec; no agent has reported ready.
    Waiting,
    /// An agent is reachable and the environment snapshot has arrived.
    Active,
    /// The delete RPC went out; awaiting confirmation.
    Removing,
    /// Terminal.
    Removed,
    /// Terminal, carries the reason.
    Failed(InterceptError),
}

impl InterceptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InterceptState::Removed | InterceptState::Failed(_))
    }
}

impl fmt::Display for InterceptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptState::Requested => write!(f, "REQUESTED"),
            InterceptState::Waiting => write!(f, "WAITING"),
            InterceptState::Active => write!(f, "ACTIVE"),
            InterceptState::Removing => write!(f, "REMOVING"),
            InterceptState::Removed => write!(f, "REMOVED"),
            InterceptState::Failed(reason) => write!(f, "FAILED ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterceptError {
    #[error("rejected by manager: {0}")]
    Rejected(String),
    #[error("no agent arrived within the timeout")]
    AgentTimeout,
    #[error("agent disappeared")]
    AgentGone,
    #[error("mount point {0} overlaps an existing intercept mount")]
    MountOverlap(PathBuf),
}
