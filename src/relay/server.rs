use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::media::{run_send_loop, Consumer, SupervisorHandle};
use crate::relay::codec::RelaySink;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Capture-side end of the relay link.
///
/// Every accepted broadcast node becomes one consumer of the capture
/// supervisor; its frames are written to the socket as relay records.
pub struct RelayServer {
    listener: TcpListener,
    supervisor: SupervisorHandle,
    queue_capacity: usize,
}

impl RelayServer {
    pub async fn bind(
        addr: &str,
        supervisor: SupervisorHandle,
        queue_capacity: usize,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("relay: bind {}", addr))?;
        Ok(Self::new(listener, supervisor, queue_capacity))
    }

    pub fn new(listener: TcpListener, supervisor: SupervisorHandle, queue_capacity: usize) -> Self {
        Self {
            listener,
            supervisor,
            queue_capacity,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts broadcast nodes until `cancel` fires. Accept errors are
    /// logged and do not end the loop.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        log::info!("relay: listening on {}", self.local_addr()?);
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("relay: accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };
            self.attach(stream, peer, &cancel).await?;
        }
        log::info!("relay: listener closed");
        Ok(())
    }

    async fn attach(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        log::info!("relay: broadcast node {} attached", peer);
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("relay: set_nodelay on {}: {}", peer, e);
        }
        let (read_half, write_half) = stream.into_split();
        let (consumer, receiver) = Consumer::new(format!("relay {}", peer), self.queue_capacity);

        tokio::spawn(watch_peer(read_half, consumer.cancel_token(), shutdown.clone()));
        tokio::spawn(async move {
            let exit = run_send_loop(receiver, RelaySink::new(write_half), None).await;
            log::info!("relay: broadcast node {} detached: {:?}", peer, exit);
        });

        if let Err(e) = self.supervisor.admit(consumer.clone()).await {
            consumer.cancel();
            return Err(e);
        }
        Ok(())
    }
}

/// Cancels the connection's consumer once the broadcast node hangs up. The
/// peer never sends anything, so any read result other than data means the
/// socket is gone.
async fn watch_peer(
    mut read_half: OwnedReadHalf,
    token: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = shutdown.cancelled() => break,
            read = read_half.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    token.cancel();
}

#[cfg(test)]
#[path = "server_test.rs"]
mod server_test;
