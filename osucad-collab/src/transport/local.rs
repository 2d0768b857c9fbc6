//! In-process transport into a [`SyncServer`].

use tokio::sync::mpsc;

use crate::protocol::SyncMessage;
use crate::server::SyncServer;

use super::{Transport, TransportError};

struct Link {
    to_server: mpsc::Sender<Vec<u8>>,
    from_server: mpsc::Receiver<Vec<u8>>,
}

/// Each `connect` starts a new server session over a pair of byte
/// channels. Dropping the link ends the session, which the server sees
/// exactly like a closed socket.
pub struct LocalTransport {
    server: SyncServer,
    link: Option<Link>,
}

impl LocalTransport {
    pub fn new(server: SyncServer) -> Self {
        Self { server, link: None }
    }
}

impl Transport for LocalTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let capacity = self.server.config().broadcast_capacity.max(1);
        let (to_server, inbound) = mpsc::channel(capacity);
        let (outbound, from_server) = mpsc::channel(capacity);
        self.server.spawn_local_session(inbound, outbound);
        self.link = Some(Link {
            to_server,
            from_server,
        });
        Ok(())
    }

    async fn send(&mut self, msg: &SyncMessage) -> Result<(), TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::Closed)?;
        let bytes = msg.encode()?;
        if link.to_server.send(bytes).await.is_err() {
            self.link = None;
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<SyncMessage> {
        loop {
            let link = self.link.as_mut()?;
            match link.from_server.recv().await {
                Some(bytes) => match SyncMessage::decode(&bytes) {
                    Ok(msg) => return Some(msg),
                    Err(e) => log::warn!("Dropping undecodable message: {e}"),
                },
                None => {
                    self.link = None;
                    return None;
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        self.link = None;
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerConfig;

    #[tokio::test]
    async fn test_send_requires_connect() {
        let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
        let mut transport = server.connect_local();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(&SyncMessage::ping(uuid::Uuid::nil())).await,
            Err(TransportError::Closed)
        ));

        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        transport.disconnect().await;
        assert!(!transport.is_connected());
        assert!(transport.recv().await.is_none());
    }
}
