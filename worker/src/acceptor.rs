use std::io;

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg},
    specs::auth::AuthSpec,
};
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

/// Admits orchestrators into a worker by checking the credentials they present.
#[derive(Debug, Clone)]
pub struct WorkerAcceptor {
    name: String,
    accepted: Option<(String, String)>,
}

impl WorkerAcceptor {
    /// Creates a new `WorkerAcceptor` that admits anyone.
    ///
    /// # Arguments
    /// * `name` - The name this worker answers `Welcome` with.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepted: None,
        }
    }

    /// Only admits orchestrators presenting exactly these credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, token: impl Into<String>) -> Self {
        self.accepted = Some((username.into(), token.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn admits(&self, auth: &AuthSpec) -> bool {
        match &self.accepted {
            Some((username, token)) => auth.username == *username && auth.token == *token,
            None => true,
        }
    }

    /// Waits for `Hello(AuthSpec)` and answers it.
    ///
    /// # Arguments
    /// * `rx` - Receiving end of the communication channel.
    /// * `tx` - Sending end of the communication channel.
    ///
    /// # Returns
    /// Returns `Ok(Some(auth))` once the orchestrator is welcomed.
    /// Returns `Ok(None)` if it was rejected or sent `Disconnect` before authenticating.
    ///
    /// # Errors
    /// Returns `io::Error` if receiving or sending fails.
    pub async fn handshake<R, W>(
        &self,
        rx: &mut OnoReceiver<R>,
        tx: &mut OnoSender<W>,
    ) -> io::Result<Option<AuthSpec>>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        info!("waiting for Hello");

        let mut buf: Vec<u32> = Vec::new();

        let auth = loop {
            let msg: Msg = rx.recv_into(&mut buf).await?;
            match msg {
                Msg::Control(Command::Hello(auth)) => break auth,
                Msg::Control(Command::Disconnect) => {
                    info!("received Disconnect before Hello, exiting");
                    return Ok(None);
                }
                msg => warn!("expected Hello, got {}", msg.kind()),
            }
        };

        if !self.admits(&auth) {
            warn!(worker = self.name.as_str(); "rejected credentials of user {}", auth.username);
            tx.send(&Msg::Err("invalid credentials".into())).await?;
            return Ok(None);
        }

        if auth.worker != self.name {
            warn!(
                worker = self.name.as_str();
                "orchestrator knows this worker as {}", auth.worker
            );
        }

        tx.send(&Msg::Control(Command::Welcome {
            worker: self.name.clone(),
        }))
        .await?;

        info!(worker = self.name.as_str(); "welcomed user {}", auth.username);
        Ok(Some(auth))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io;

    use super::*;

    fn auth(token: &str) -> AuthSpec {
        AuthSpec {
            worker: "w0".into(),
            username: "trainer".into(),
            token: token.into(),
        }
    }

    #[test]
    fn open_acceptor_admits_anyone() {
        assert!(WorkerAcceptor::new("w0").admits(&auth("anything")));
    }

    #[test]
    fn credentials_must_match() {
        let acceptor = WorkerAcceptor::new("w0").with_credentials("trainer", "s3cret");
        assert!(acceptor.admits(&auth("s3cret")));
        assert!(!acceptor.admits(&auth("guess")));
    }

    #[tokio::test]
    async fn rejected_hello_gets_an_error() -> io::Result<()> {
        let (one, two) = io::duplex(256);
        let (rx, tx) = io::split(one);
        let (mut worker_rx, mut worker_tx) = comms::channel(rx, tx);
        let (rx, tx) = io::split(two);
        let (mut rx, mut tx) = comms::channel(rx, tx);

        let acceptor = WorkerAcceptor::new("w0").with_credentials("trainer", "s3cret");

        let worker = async { acceptor.handshake(&mut worker_rx, &mut worker_tx).await };
        let client = async {
            tx.send(&Msg::Control(Command::Hello(auth("guess")))).await?;
            let mut buf: Vec<u32> = Vec::new();
            let msg: Msg = rx.recv_into(&mut buf).await?;
            assert!(matches!(msg, Msg::Err(_)));
            Ok::<_, io::Error>(())
        };

        let (admitted, ()) = tokio::try_join!(worker, client)?;
        assert!(admitted.is_none());
        Ok(())
    }
}
