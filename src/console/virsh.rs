use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::transport::{ConsoleTransport, OutputSink, StreamTransport, TransportError};

/// `virsh console` refuses to run without a controlling terminal, so it is
/// started under `script(1)`, which gives it a pty and relays it over stdio.
const PTY_WRAPPER: &str = "script";

/// Serial console of a libvirt domain.
pub struct VirshConsole {
    child: Child,
    stream: StreamTransport<ChildStdout, ChildStdin>,
}

impl VirshConsole {
    pub fn open(libvirt_uri: &str, domain: &str) -> Result<Self, TransportError> {
        let inner = console_command(libvirt_uri, domain);
        tracing::info!(domain, command = %inner, "attaching to console");

        let mut child = Command::new(PTY_WRAPPER)
            .args(["--quiet", "--flush", "--return", "--command"])
            .arg(&inner)
            .arg("/dev/null")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Open {
                message: format!("spawning {PTY_WRAPPER}: {e}"),
            })?;

        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            return Err(TransportError::Open {
                message: "console process has no stdio pipes".into(),
            });
        };

        Ok(Self {
            child,
            stream: StreamTransport::new(stdout, stdin),
        })
    }
}

/// The `virsh console` invocation run inside the pty.
fn console_command(libvirt_uri: &str, domain: &str) -> String {
    format!(
        "virsh -c {} console --force {}",
        shell_quote(libvirt_uri),
        shell_quote(domain)
    )
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl ConsoleTransport for VirshConsole {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write(bytes).await
    }

    async fn read_until(
        &mut self,
        marker: &str,
        timeout: Duration,
        sink: &mut dyn OutputSink,
    ) -> Result<String, TransportError> {
        self.stream.read_until(marker, timeout, sink).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.close().await?;
        if let Ok(None) = self.child.try_wait() {
            self.child.kill().await.map_err(TransportError::Io)?;
        }
        tracing::debug!("console process stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_command_quotes_arguments() {
        assert_eq!(
            console_command("qemu:///system", "controller-0"),
            "virsh -c 'qemu:///system' console --force 'controller-0'"
        );
    }

    #[test]
    fn single_quotes_are_escaped() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
