//! Shell execution inside managed pods.
//!
//! The very first administrative bootstrap happens before any credentialed
//! client can connect, so commands are piped through the container's shell
//! and the caller branches on the textual output.

use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::client::COMMAND_TIMEOUT;

use super::error::{Error, Result};
use super::instance::Base;
use super::topology;
use super::CONTAINER_NAME;

/// Captured output of a shell command.
///
/// `ok` reflects the process exit status; callers inspect the stdout
/// markers regardless, because several expected outcomes (user already
/// exists, not master, ...) surface as failures.
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub ok: bool,
}

/// Run `sh -c <cmd>` inside the mongod container of the given pod.
pub async fn exec_shell(base: &Base, pod: &Pod, cmd: &str) -> Result<ShellOutput> {
    let name = topology::pod_name(pod);
    debug!(pod = %name, "execute shell command");

    let params = AttachParams::default()
        .container(CONTAINER_NAME)
        .stdin(false)
        .stdout(true)
        .stderr(true);

    let fut = async {
        let mut attached = base
            .pods()
            .exec(name, ["/bin/sh", "-c", cmd], &params)
            .await?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (stdout, stderr) = tokio::join!(slurp(stdout_reader), slurp(stderr_reader));

        let status = attached.take_status();
        attached
            .join()
            .await
            .map_err(|e| Error::Kube(kube::Error::Service(Box::new(e))))?;
        let ok = match status {
            Some(rx) => !matches!(
                rx.await.and_then(|s| s.status),
                Some(ref s) if s == "Failure"
            ),
            None => true,
        };

        debug!(stdout = %stdout, stderr = %stderr, ok, "shell command finished");
        Ok::<_, Error>(ShellOutput { stdout, stderr, ok })
    };

    tokio::time::timeout(COMMAND_TIMEOUT, fut)
        .await
        .map_err(|_| Error::Internal(format!("shell command timed out in pod {}", name)))?
}

async fn slurp(reader: Option<impl AsyncRead + Unpin>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = String::new();
    let _ = reader.read_to_string(&mut buf).await;
    buf
}
