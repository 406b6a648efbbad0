//! Loopback TCP transport for [`PanicStub`]
//!
//! The server binds an ephemeral port on 127.0.0.1, accepts exactly one
//! connection and then stops listening. Dropping the [`StubHandle`] aborts the
//! task, which closes both the listener and the connection.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::stub::{Effect, PanicStub, StubState};
use crate::error::{DecodeError, Result};

const READ_BUFFER_SIZE: usize = 4096;
/// How long [`StubHandle::finish`] waits for the session to end after GDB exits.
const FINISH_GRACE: Duration = Duration::from_millis(200);

/// A bound, not yet serving, stub.
pub struct StubServer {
    listener: TcpListener,
    stub: PanicStub,
    port: u16,
}

impl StubServer {
    pub async fn bind(stub: PanicStub) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        info!("RSP stub listening on 127.0.0.1:{}", port);
        Ok(Self { listener, stub, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve the first client in the background.
    pub fn spawn(self) -> StubHandle {
        let port = self.port;
        let task = tokio::spawn(async move {
            let result = self.serve().await;
            if let Err(e) = &result {
                warn!("RSP stub on port {} failed: {}", port, e);
            }
            result
        });
        StubHandle { port, task }
    }

    /// Accept one client and answer it until it hangs up or kills the target.
    pub async fn serve(self) -> Result<()> {
        let StubServer { listener, stub, port } = self;
        let (stream, peer) = listener.accept().await?;
        drop(listener);
        debug!("RSP stub on port {} accepted {}", port, peer);
        serve_connection(&stub, stream).await
    }
}

async fn serve_connection(stub: &PanicStub, mut stream: TcpStream) -> Result<()> {
    let mut state = StubState::default();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            debug!("RSP client disconnected");
            return Ok(());
        }

        let step = stub.step(state, &buf[..n]);
        if !step.outbound.is_empty() {
            stream.write_all(&step.outbound).await?;
        }
        state = step.state;

        if step.effect == Effect::Close {
            debug!("RSP stub closing connection");
            if let Err(e) = stream.shutdown().await {
                warn!("RSP shutdown failed: {}", e);
            }
            return Ok(());
        }
    }
}

/// A running stub. The serving task is aborted when this is dropped.
pub struct StubHandle {
    port: u16,
    task: JoinHandle<Result<()>>,
}

impl StubHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the serving task has ended on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Outcome of the session once the client is done with it.
    ///
    /// A stub that never got a client, or is still connected after
    /// [`FINISH_GRACE`], counts as a clean session and is aborted on drop.
    pub async fn finish(mut self) -> Result<()> {
        match tokio::time::timeout(FINISH_GRACE, &mut self.task).await {
            Ok(Ok(result)) => result.map_err(|e| DecodeError::StubFailed(e.to_string())),
            Ok(Err(e)) => Err(DecodeError::StubFailed(e.to_string())),
            Err(_) => {
                debug!("RSP stub on port {} still serving after GDB exited", self.port);
                Ok(())
            }
        }
    }
}

impl Drop for StubHandle {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            debug!("Tearing down RSP stub on port {}", self.port);
        }
        self.task.abort();
    }
}
