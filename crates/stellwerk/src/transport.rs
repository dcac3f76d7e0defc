//! ZeroMQ endpoint addressing for the master/controller link.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StellwerkError;

/// Where the master binds and controllers connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix domain socket, same-host only. Holds the filesystem path.
    Ipc(String),

    /// TCP for multi-node deployments.
    Tcp { host: String, port: u16 },
}

impl Transport {
    /// IPC transport under the crate's socket directory.
    pub fn local(name: &str) -> Self {
        Self::Ipc(format!("/tmp/stellwerk/{name}.sock"))
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse a ZeroMQ endpoint string (`tcp://host:port` or `ipc://path`).
    pub fn parse(endpoint: &str) -> Result<Self, StellwerkError> {
        if let Some(path) = endpoint.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(StellwerkError::Config(format!(
                    "ipc endpoint without a path: {endpoint:?}"
                )));
            }
            return Ok(Self::Ipc(path.to_string()));
        }
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
                StellwerkError::Config(format!("tcp endpoint without a port: {endpoint:?}"))
            })?;
            let port = port.parse::<u16>().map_err(|_| {
                StellwerkError::Config(format!("tcp endpoint port is not a number: {endpoint:?}"))
            })?;
            return Ok(Self::tcp(host, port));
        }
        Err(StellwerkError::Config(format!(
            "unrecognized endpoint scheme: {endpoint:?}"
        )))
    }

    /// The ZeroMQ endpoint address string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(path) => format!("ipc://{path}"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// For IPC transports, make sure the socket's parent directory exists.
    /// ZeroMQ will not create it on bind. No-op for TCP.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Self::Ipc(path) = self {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Remove an IPC socket file left over from a previous run; the stale
    /// file would otherwise fail the next bind with `EADDRINUSE`. No-op for
    /// TCP and for a missing file.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if let Self::Ipc(path) = self {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    tracing::debug!(path, "removed stale IPC socket");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}
