use std::{io, sync::Arc};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
    specs::step::{DeltaSpec, ForwardSpec, RemoteFailure, StepReport, StepSpec, StepStatus},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task,
};

use crate::{
    Result, WorkerErr,
    acceptor::WorkerAcceptor,
    executor::{Delta, Executor, Outcome},
};

/// Serves the orchestrators connecting to a worker.
///
/// Cheap to clone, every connection gets its own clone sharing the same replicas.
#[derive(Clone)]
pub struct Service {
    executor: Arc<Executor>,
    acceptor: Arc<WorkerAcceptor>,
}

impl Service {
    /// Creates a new `Service`.
    ///
    /// # Arguments
    /// * `executor` - Holds the replicas and runs the steps.
    /// * `acceptor` - Authenticates incoming connections.
    pub fn new(executor: Arc<Executor>, acceptor: WorkerAcceptor) -> Self {
        Self {
            executor,
            acceptor: Arc::new(acceptor),
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Runs one connection until the orchestrator disconnects.
    ///
    /// Failures computing a step are reported back in its `StepDone` and keep the
    /// connection open. A request that breaks the protocol is answered with a failed
    /// `StepDone` when possible, after which the connection is dropped.
    ///
    /// # Arguments
    /// * `rx` - Receiving end of the communication channel.
    /// * `tx` - Sending end of the communication channel.
    ///
    /// # Errors
    /// Returns `WorkerErr` on I/O failures or protocol violations.
    pub async fn serve<R, W>(&self, mut rx: OnoReceiver<R>, mut tx: OnoSender<W>) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        if self.acceptor.handshake(&mut rx, &mut tx).await?.is_none() {
            return Ok(());
        }

        let mut buf: Vec<u32> = Vec::new();

        loop {
            debug!("waiting for message");

            let cmd = match rx.recv_into::<Msg, _>(&mut buf).await {
                Ok(Msg::Control(cmd)) => cmd,
                Ok(msg) => return Self::unexpected(&mut tx, msg.kind()).await,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("orchestrator closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            match cmd {
                Command::Ping { nonce } => {
                    tx.send(&Msg::Control(Command::Pong { nonce })).await?;
                }
                Command::Step(spec) => {
                    self.step(&mut rx, &mut tx, &mut buf, spec).await?;
                }
                Command::Forward(spec) => {
                    self.forward(&mut rx, &mut tx, &mut buf, spec).await?;
                }
                Command::Release { model_id } => {
                    let held = self.executor.remove(&model_id);
                    debug!(model_id = model_id.as_str(), held = held; "released replica");
                    tx.send(&Msg::Control(Command::Released { model_id })).await?;
                }
                Command::Disconnect => {
                    info!("disconnect received from orchestrator");
                    return Ok(());
                }
                cmd => return Self::unexpected(&mut tx, Msg::Control(cmd).kind()).await,
            }
        }
    }

    /// Answers a message the worker can't take at this point and gives up on the connection.
    async fn unexpected<W>(tx: &mut OnoSender<W>, got: &'static str) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let err = WorkerErr::UnexpectedMessage {
            expected: "control/step",
            got,
        };

        warn!("{err}");
        tx.send(&Msg::Err(err.to_string().into())).await?;
        Err(err)
    }

    async fn step<R, W>(
        &self,
        rx: &mut OnoReceiver<R>,
        tx: &mut OnoSender<W>,
        buf: &mut Vec<u32>,
        spec: StepSpec,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let run_id = spec.run_id;
        debug!(run_id = run_id; "step over {} samples of {}", spec.samples, spec.model_id);

        let (synced, rows) = self
            .receive(rx, tx, buf, run_id, &spec.model_id, spec.delta)
            .await?;

        let outcome = match synced {
            Ok(_) => {
                let executor = Arc::clone(&self.executor);
                Self::blocking(move || executor.step(&spec, &rows)).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Outcome {
                loss,
                grad,
                sample_count,
            }) => {
                let report = StepReport {
                    run_id,
                    loss,
                    sample_count,
                    status: StepStatus::Ok,
                };
                tx.send(&Msg::Control(Command::StepDone(report))).await?;
                tx.send(&Msg::Data(Payload::Gradient(&grad))).await?;
            }
            Err(e) => {
                warn!(run_id = run_id; "step failed: {e}");
                Self::report_failure(tx, run_id, e.into_failure()).await?;
            }
        }

        Ok(())
    }

    async fn forward<R, W>(
        &self,
        rx: &mut OnoReceiver<R>,
        tx: &mut OnoSender<W>,
        buf: &mut Vec<u32>,
        spec: ForwardSpec,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let run_id = spec.run_id;
        debug!(run_id = run_id; "forward over {} samples of {}", spec.samples, spec.model_id);

        let (synced, inputs) = self
            .receive(rx, tx, buf, run_id, &spec.model_id, spec.delta)
            .await?;

        let outputs = match synced {
            Ok(_) => {
                let executor = Arc::clone(&self.executor);
                let samples = spec.samples;
                Self::blocking(move || executor.forward(&spec, &inputs))
                    .await
                    .map(|outputs| (outputs, samples))
            }
            Err(e) => Err(e),
        };

        match outputs {
            Ok((outputs, sample_count)) => {
                let report = StepReport {
                    run_id,
                    loss: 0.0,
                    sample_count,
                    status: StepStatus::Ok,
                };
                tx.send(&Msg::Control(Command::StepDone(report))).await?;
                tx.send(&Msg::Data(Payload::Outputs(&outputs))).await?;
            }
            Err(e) => {
                warn!(run_id = run_id; "forward failed: {e}");
                Self::report_failure(tx, run_id, e.into_failure()).await?;
            }
        }

        Ok(())
    }

    /// Receives the frames following a `Step` or `Forward` and syncs the replica.
    ///
    /// # Returns
    /// The outcome of the sync along with the shard's samples. A request that
    /// breaks the protocol is answered and returned as an error.
    async fn receive<R, W>(
        &self,
        rx: &mut OnoReceiver<R>,
        tx: &mut OnoSender<W>,
        buf: &mut Vec<u32>,
        run_id: u64,
        model_id: &str,
        delta: DeltaSpec,
    ) -> Result<(Result<u64>, Vec<f32>)>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let synced = match Self::delta_frame(rx, buf, delta).await {
            Ok(delta) => self.executor.sync(model_id, delta),
            Err(e @ WorkerErr::UnexpectedMessage { .. }) => return Self::abort(tx, run_id, e).await,
            Err(e) => return Err(e),
        };

        let msg: Msg = rx.recv_into(buf).await?;
        match msg {
            Msg::Data(Payload::Shard(rows)) => Ok((synced, rows.to_vec())),
            msg => {
                let err = WorkerErr::UnexpectedMessage {
                    expected: "data/shard",
                    got: msg.kind(),
                };
                Self::abort(tx, run_id, err).await
            }
        }
    }

    /// Runs a computation on the blocking pool.
    async fn blocking<T, F>(f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        task::spawn_blocking(f).await.unwrap_or_else(|e| {
            Err(WorkerErr::Io(io::Error::other(format!(
                "computation panicked: {e}"
            ))))
        })
    }

    /// Receives the parameter frame announced by `delta`, if any.
    async fn delta_frame<'buf, R>(
        rx: &mut OnoReceiver<R>,
        buf: &'buf mut Vec<u32>,
        delta: DeltaSpec,
    ) -> Result<Delta<'buf>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let expected = match delta {
            DeltaSpec::None { version } => return Ok(Delta::Current { version }),
            DeltaSpec::Incremental { .. } => "data/delta",
            DeltaSpec::Full { .. } => "data/params",
        };

        let msg: Msg<'buf> = rx.recv_into(buf).await?;

        match (delta, msg) {
            (DeltaSpec::Incremental { from, to }, Msg::Data(Payload::Delta { indices, values })) => {
                Ok(Delta::Incremental {
                    from,
                    to,
                    indices,
                    values,
                })
            }
            (DeltaSpec::Full { to }, Msg::Data(Payload::Params(params))) => {
                Ok(Delta::Full { to, params })
            }
            (_, msg) => Err(WorkerErr::UnexpectedMessage {
                expected,
                got: msg.kind(),
            }),
        }
    }

    async fn report_failure<W>(
        tx: &mut OnoSender<W>,
        run_id: u64,
        failure: RemoteFailure,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let report = StepReport {
            run_id,
            loss: 0.0,
            sample_count: 0,
            status: StepStatus::Failed(failure),
        };

        tx.send(&Msg::Control(Command::StepDone(report))).await
    }

    /// Answers a malformed step and gives up on the connection.
    async fn abort<W, T>(tx: &mut OnoSender<W>, run_id: u64, err: WorkerErr) -> Result<T>
    where
        W: AsyncWrite + Unpin + Send,
    {
        warn!(run_id = run_id; "protocol violation: {err}");

        let failure = RemoteFailure::Protocol {
            detail: err.to_string(),
        };
        Self::report_failure(tx, run_id, failure).await?;
        Err(err)
    }
}
