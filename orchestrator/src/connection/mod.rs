mod backoff;
mod connector;

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use comms::{
    msg::{Command, Msg},
    specs::{
        auth::AuthSpec,
        step::{RemoteFailure, StepStatus},
    },
};
use log::{debug, info, warn};
use tokio::{sync::Mutex, time};

pub use backoff::RetryPolicy;
pub use connector::{Connector, Link, MemoryConnector, TcpConnector};

use crate::{
    config::{Credentials, ResourceDescriptor},
    error::{ConnectError, SerializationError},
    report::{FailureReason, PartialResult},
    stub::{self, StepRequest},
};

struct ChannelState {
    link: Option<Link>,
    /// The version each model's replica on the worker is known to be at.
    replicas: HashMap<String, u64>,
    /// Every model sent to the worker, released when the channel closes.
    sent: HashSet<String>,
    closed: bool,
}

/// The trainer's side of one worker.
///
/// Calls on a channel are serialized, at most one step or probe is in flight on it.
pub struct Channel {
    name: String,
    descriptor: ResourceDescriptor,
    state: Mutex<ChannelState>,
}

impl Channel {
    fn new(name: &str, descriptor: &ResourceDescriptor) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.clone(),
            state: Mutex::new(ChannelState {
                link: None,
                replicas: HashMap::new(),
                sent: HashSet::new(),
                closed: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    /// The version the worker's replica of `model_id` is believed to be at.
    pub async fn replica(&self, model_id: &str) -> Option<u64> {
        self.state.lock().await.replicas.get(model_id).copied()
    }

    /// Whether an authenticated link is currently open.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.link.is_some()
    }
}

enum HandshakeErr {
    Rejected(String),
    Protocol(String),
    Io(io::Error),
}

impl From<io::Error> for HandshakeErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Authenticates a freshly opened link.
async fn hello(link: &mut Link, name: &str, credentials: &Credentials) -> Result<(), HandshakeErr> {
    let auth = AuthSpec {
        worker: name.to_string(),
        username: credentials.username.clone(),
        token: credentials.token.clone(),
    };

    link.tx.send(&Msg::Control(Command::Hello(auth))).await?;

    match link.rx.recv_into::<Msg, _>(&mut link.buf).await? {
        Msg::Control(Command::Welcome { worker }) => {
            if worker != name {
                debug!(worker = name; "worker introduced itself as {worker}");
            }
            Ok(())
        }
        Msg::Err(reason) => Err(HandshakeErr::Rejected(reason.into_owned())),
        msg => Err(HandshakeErr::Protocol(format!(
            "expected control/welcome, got {}",
            msg.kind()
        ))),
    }
}

async fn ping(link: &mut Link, nonce: u64) -> io::Result<()> {
    link.in_flight = true;
    link.tx.send(&Msg::Control(Command::Ping { nonce })).await?;

    match link.rx.recv_into::<Msg, _>(&mut link.buf).await? {
        Msg::Control(Command::Pong { nonce: got }) if got == nonce => {
            link.in_flight = false;
            Ok(())
        }
        msg => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected control/pong, got {}", msg.kind()),
        )),
    }
}

async fn release(link: &mut Link, model_id: &str) -> io::Result<()> {
    link.in_flight = true;
    let msg = Msg::Control(Command::Release {
        model_id: model_id.to_string(),
    });
    link.tx.send(&msg).await?;

    match link.rx.recv_into::<Msg, _>(&mut link.buf).await? {
        Msg::Control(Command::Released { model_id: got }) if got == model_id => {
            link.in_flight = false;
            Ok(())
        }
        msg => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected control/released, got {}", msg.kind()),
        )),
    }
}

/// How a step that never got an answer ended.
enum Unanswered {
    Connect(ConnectError),
    Wire(io::Error),
    Timeout,
}

/// Owns the channels to every remote worker.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    call_timeout: Duration,
    channels: parking_lot::Mutex<HashMap<String, Arc<Channel>>>,
}

impl ConnectionManager {
    /// Creates a new `ConnectionManager`.
    ///
    /// # Arguments
    /// * `connector` - Opens transports to workers.
    /// * `policy` - The retry policy for connects and dispatches.
    /// * `call_timeout` - Bound on a single step or probe round-trip.
    pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            connector,
            policy,
            call_timeout,
            channels: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// The channel to `name`, created lazily without touching the network.
    pub fn channel(&self, name: &str, descriptor: &ResourceDescriptor) -> Arc<Channel> {
        let mut channels = self.channels.lock();
        let channel = channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Channel::new(name, descriptor)));

        Arc::clone(channel)
    }

    /// Opens and authenticates the channel to `name`, reusing it if it's already open.
    ///
    /// # Errors
    /// `MissingCredentials` before any network activity if `descriptor` has no
    /// credentials, `Rejected` if the worker refuses them, or `Unreachable` once
    /// every attempt of the retry policy failed.
    pub async fn connect(
        &self,
        name: &str,
        descriptor: &ResourceDescriptor,
    ) -> Result<Arc<Channel>, ConnectError> {
        let channel = self.channel(name, descriptor);

        {
            let mut state = channel.state.lock().await;
            self.ensure_link(&channel, &mut state, self.policy.attempts())
                .await?;
        }

        Ok(channel)
    }

    async fn ensure_link<'s>(
        &self,
        channel: &Channel,
        state: &'s mut ChannelState,
        attempts: u32,
    ) -> Result<&'s mut Link, ConnectError> {
        if state.closed {
            return Err(ConnectError::Closed {
                worker: channel.name.clone(),
            });
        }

        let link = match state.link.take() {
            Some(link) if !link.in_flight => link,
            Some(_) => {
                warn!(worker = channel.name.as_str(); "discarding a link left mid-request");
                self.establish(channel, attempts).await?
            }
            None => self.establish(channel, attempts).await?,
        };

        Ok(state.link.insert(link))
    }

    /// Opens and authenticates a new link, trying up to `attempts` times.
    async fn establish(&self, channel: &Channel, attempts: u32) -> Result<Link, ConnectError> {
        let name = channel.name.as_str();
        let descriptor = &channel.descriptor;

        let Some(credentials) = descriptor.credentials() else {
            return Err(ConnectError::MissingCredentials {
                worker: name.to_string(),
            });
        };

        let attempts = attempts.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                time::sleep(self.policy.delay(attempt - 1)).await;
            }

            let open = async {
                let mut link = self.connector.connect(name, descriptor).await?;
                hello(&mut link, name, credentials).await?;
                Ok::<_, HandshakeErr>(link)
            };

            match time::timeout(self.policy.connect_timeout, open).await {
                Ok(Ok(link)) => {
                    info!(worker = name, attempt = attempt; "connected");
                    return Ok(link);
                }
                Ok(Err(HandshakeErr::Rejected(reason))) => {
                    return Err(ConnectError::Rejected {
                        worker: name.to_string(),
                        reason,
                    });
                }
                Ok(Err(HandshakeErr::Protocol(detail))) => {
                    return Err(ConnectError::Protocol {
                        worker: name.to_string(),
                        detail,
                    });
                }
                Ok(Err(HandshakeErr::Io(e))) => {
                    warn!(worker = name, attempt = attempt; "connect failed: {e}");
                    last = Some(e);
                }
                Err(_) => {
                    warn!(worker = name, attempt = attempt; "connect timed out");
                    last = Some(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
                }
            }
        }

        Err(ConnectError::Unreachable {
            worker: name.to_string(),
            attempts,
            source: last.unwrap_or_else(|| io::Error::other("no attempt was made")),
        })
    }

    /// Runs one shard on the worker behind `channel`.
    ///
    /// Remote failures end up in the returned `PartialResult`, only requests that
    /// can't be encoded are errors.
    ///
    /// # Arguments
    /// * `channel` - The worker's channel.
    /// * `request` - The step to run.
    pub async fn send_shard(
        &self,
        channel: &Channel,
        request: &StepRequest<'_>,
    ) -> Result<PartialResult, SerializationError> {
        let name = channel.name.as_str();

        let result = match self.call(channel, request).await? {
            Ok(reply) => stub::into_partial(name, reply),
            Err(reason) => PartialResult::failed(name, reason),
        };

        Ok(result)
    }

    /// Computes the outputs of a shard of inputs on the worker behind `channel`.
    ///
    /// # Returns
    /// The outputs, row-major, or why the worker couldn't produce them.
    pub async fn send_inputs(
        &self,
        channel: &Channel,
        request: &StepRequest<'_>,
    ) -> Result<Result<Vec<f32>, FailureReason>, SerializationError> {
        let outputs = self.call(channel, request).await?.and_then(stub::into_outputs);
        Ok(outputs)
    }

    /// One request/reply with the worker, keeping its replica bookkeeping.
    ///
    /// A broken link is reopened and the request resent, with every connect and
    /// resend counted against the same retry policy. A timeout fails right away.
    async fn call(
        &self,
        channel: &Channel,
        request: &StepRequest<'_>,
    ) -> Result<Result<stub::Reply, FailureReason>, SerializationError> {
        request.validate()?;

        let name = channel.name.as_str();
        let attempts = self.policy.attempts();
        let mut state = channel.state.lock().await;
        let mut last = Unanswered::Timeout;

        for attempt in 1..=attempts {
            if attempt > 1 {
                time::sleep(self.policy.delay(attempt - 1)).await;
            }

            let replica = state.replicas.get(request.model_id).copied();
            state.sent.insert(request.model_id.to_string());

            let link = match self.ensure_link(channel, &mut state, 1).await {
                Ok(link) => link,
                Err(e @ ConnectError::Unreachable { .. }) => {
                    last = Unanswered::Connect(e);
                    continue;
                }
                Err(e) => return Ok(Err(FailureReason::Connect(e.to_string()))),
            };

            let delta = request.store.delta_for(replica);
            debug!(worker = name, run_id = request.run_id; "sending {:?}", delta.spec());

            let exchange = stub::exchange(link, request, &delta);
            let reply = match time::timeout(self.call_timeout, exchange).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    warn!(worker = name, attempt = attempt; "request failed on the wire: {e}");
                    state.link = None;
                    last = Unanswered::Wire(e);
                    continue;
                }
                Err(_) => {
                    warn!(worker = name, run_id = request.run_id; "request timed out");
                    state.link = None;
                    return Ok(Err(FailureReason::Timeout));
                }
            };

            match &reply.report.status {
                StepStatus::Ok => {
                    let target = delta.spec().target();
                    state.replicas.insert(request.model_id.to_string(), target);
                }
                StepStatus::Failed(RemoteFailure::StaleReplica { .. }) => {
                    state.replicas.remove(request.model_id);
                }
                StepStatus::Failed(RemoteFailure::Protocol { .. }) => {
                    state.link = None;
                }
                StepStatus::Failed(RemoteFailure::Execution { .. }) => {}
            }

            return Ok(Ok(reply));
        }

        let reason = match last {
            Unanswered::Connect(ConnectError::Unreachable { source, .. }) => {
                let e = ConnectError::Unreachable {
                    worker: name.to_string(),
                    attempts,
                    source,
                };
                FailureReason::Connect(e.to_string())
            }
            Unanswered::Connect(e) => FailureReason::Connect(e.to_string()),
            Unanswered::Wire(e) => FailureReason::Transport(e.to_string()),
            Unanswered::Timeout => FailureReason::Timeout,
        };

        Ok(Err(reason))
    }

    /// Measures a ping round-trip to the worker, connecting first if needed.
    pub async fn probe(&self, channel: &Channel) -> Result<Duration, ConnectError> {
        let mut state = channel.state.lock().await;
        let link = self
            .ensure_link(channel, &mut state, self.policy.attempts())
            .await?;

        let nonce: u64 = rand::random();
        let started = Instant::now();

        let source = match time::timeout(self.call_timeout, ping(link, nonce)).await {
            Ok(Ok(())) => return Ok(started.elapsed()),
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(io::ErrorKind::TimedOut, "probe timed out"),
        };

        state.link = None;
        Err(ConnectError::Unreachable {
            worker: channel.name.clone(),
            attempts: 1,
            source,
        })
    }

    /// Closes `channel`. Closing twice is a no-op.
    ///
    /// The worker is told to release every replica this channel sent it, over a
    /// fresh link if the current one is gone or busy, then to disconnect.
    pub async fn close(&self, channel: &Channel) {
        {
            let mut channels = self.channels.lock();
            if channels
                .get(&channel.name)
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), channel))
            {
                channels.remove(&channel.name);
            }
        }

        let mut state = channel.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        state.replicas.clear();
        let sent: Vec<String> = state.sent.drain().collect();

        let idle = state.link.take().filter(|link| !link.in_flight);
        let mut link = match idle {
            Some(link) => link,
            None if sent.is_empty() => return,
            None => match self.establish(channel, 1).await {
                Ok(link) => link,
                Err(e) => {
                    debug!(worker = channel.name.as_str(); "can't release replicas: {e}");
                    return;
                }
            },
        };

        let bye = async {
            for model_id in &sent {
                release(&mut link, model_id).await?;
            }
            link.tx.send(&Msg::Control(Command::Disconnect)).await?;
            link.tx.shutdown().await
        };

        match time::timeout(self.call_timeout, bye).await {
            Ok(Ok(())) => debug!(worker = channel.name.as_str(); "disconnected"),
            Ok(Err(e)) => debug!(worker = channel.name.as_str(); "disconnect failed: {e}"),
            Err(_) => debug!(worker = channel.name.as_str(); "disconnect timed out"),
        }
    }

    /// Closes every channel.
    pub async fn close_all(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.lock().values().cloned().collect();
        futures::future::join_all(channels.iter().map(|c| self.close(c))).await;
    }
}
