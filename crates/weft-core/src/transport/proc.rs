use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::process::{Child, Command};

use crate::error::TransportError;
use crate::message::Envelope;

use super::Transport;
use super::stream::StreamTransport;

/// A child process spoken to over its piped stdio.
///
/// Frames use the same varint-prefixed layout as [`StreamTransport`]; the
/// child side binds with [`StreamTransport::from_stdio`]. Closing the
/// transport kills the child.
#[derive(Clone)]
pub struct ProcTransport {
    stream: StreamTransport,
    child: Arc<Mutex<Option<Child>>>,
}

impl std::fmt::Debug for ProcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcTransport").finish_non_exhaustive()
    }
}

impl ProcTransport {
    /// Spawn `command` with piped stdin/stdout and frame envelopes over the
    /// pipes. The child's stderr is left alone.
    pub fn spawn(mut command: Command) -> Result<Self, TransportError> {
        command.stdin(Stdio::piped()).stdout(Stdio::piped());
        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io(std::io::Error::other("child stdin not captured")))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::other("child stdout not captured"))
        })?;
        Ok(Self {
            stream: StreamTransport::from_split(stdout, stdin),
            child: Arc::new(Mutex::new(Some(child))),
        })
    }
}

impl Transport for ProcTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.stream.send(envelope).await
    }

    async fn recv(&self) -> Result<Envelope, TransportError> {
        self.stream.recv().await
    }

    fn close(&self) {
        self.stream.close();
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::message::{Message, Value};

    // `cat` copies stdin to stdout byte for byte, so any frame we write
    // comes straight back.
    #[tokio::test]
    async fn frames_roundtrip_through_a_child_process() {
        let transport = ProcTransport::spawn(Command::new("cat")).unwrap();
        let env = Envelope::new(Message::Resolve {
            channel_id: 4,
            data: Value::Str("through the pipe".into()),
        });
        transport.send(env.clone()).await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), env);
        transport.close();
        assert!(transport.is_closed());
    }
}
