//! Code generation backends run by the engine's workers.

use crate::collab::MethodHandle;
use aotserve_core::{Error, Result};
use bytes::Bytes;
use core::future::Future;
use std::{path::PathBuf, process::Stdio};
use tokio::process::Command;

/// Produces the compiled artifact for one method.
pub trait CompileBackend: Send + Sync + 'static {
    fn compile(&self, method: &MethodHandle) -> impl Future<Output = Result<Bytes>> + Send;
}

/// Runs an external compiler program once per method.
///
/// The program is invoked as
///
/// ```text
/// <program> [args...] <class-name> <method-name> <signature> <method-index>
/// ```
///
/// and must write the artifact to stdout and exit with status 0. Anything
/// else is a failed compilation; stderr is included in the error.
#[derive(Clone, Debug)]
pub struct CommandBackend {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl CompileBackend for CommandBackend {
    async fn compile(&self, method: &MethodHandle) -> Result<Bytes> {
        let identity = &method.identity;
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&identity.class_name)
            .arg(&identity.method_name)
            .arg(&identity.signature)
            .arg(method.index.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Backend {
                reason: format!("Failed to run {}: {e}", self.program.display()),
            })?;

        if !output.status.success() {
            return Err(Error::Backend {
                reason: format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        if output.stdout.is_empty() {
            return Err(Error::Backend {
                reason: format!("{} produced an empty artifact", self.program.display()),
            });
        }

        Ok(Bytes::from(output.stdout))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::collab::MethodIdentity;
    use aotserve_core::types::MethodOffsets;

    fn handle() -> MethodHandle {
        MethodHandle {
            identity: MethodIdentity {
                offsets: MethodOffsets::default(),
                class_name: "demo/Widget".into(),
                method_name: "spin".into(),
                signature: "(I)V".into(),
            },
            index: 3,
        }
    }

    #[tokio::test]
    async fn command_output_becomes_artifact() {
        let backend = CommandBackend::new("sh", vec!["-c".into(), "printf '%s|%s|%s|%s' \"$@\"".into(), "sh".into()]);
        let artifact = backend.compile(&handle()).await.unwrap();
        assert_eq!(&artifact[..], b"demo/Widget|spin|(I)V|3");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_backend_error() {
        let backend = CommandBackend::new("sh", vec!["-c".into(), "echo broken >&2; exit 3".into(), "sh".into()]);
        match backend.compile(&handle()).await {
            Err(Error::Backend { reason }) => assert!(reason.contains("broken"), "{reason}"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_backend_error() {
        let backend = CommandBackend::new("/nonexistent/aot-compiler", Vec::new());
        assert!(matches!(
            backend.compile(&handle()).await,
            Err(Error::Backend { .. })
        ));
    }
}
