use std::sync::Arc;

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
    specs::{
        auth::AuthSpec,
        step::{DeltaSpec, ForwardSpec, RemoteFailure, StepReport, StepSpec, StepStatus},
    },
};
use tokio::{
    io::{self, DuplexStream, ReadHalf, WriteHalf},
    task::JoinHandle,
};
use worker::{Executor, Model, Registry, Service, Shape, WorkerAcceptor};

type Rx = OnoReceiver<ReadHalf<DuplexStream>>;
type Tx = OnoSender<WriteHalf<DuplexStream>>;

struct Broken;

impl Model for Broken {
    fn size(&self, _: Shape) -> usize {
        2
    }

    fn forward(&self, _: Shape, _: &[f32], _: &[f32], _: &mut [f32]) -> worker::Result<()> {
        Err(worker::WorkerErr::NonFinite { what: "activations" })
    }

    fn backward(
        &self,
        _: Shape,
        _: &[f32],
        _: &[f32],
        _: &[f32],
        _: &mut [f32],
    ) -> worker::Result<()> {
        unreachable!()
    }
}

fn spawn_worker(executor: Arc<Executor>) -> (Rx, Tx, JoinHandle<worker::Result<()>>) {
    let (one, two) = io::duplex(4096);

    let (rx, tx) = io::split(one);
    let (rx, tx) = comms::channel(rx, tx);
    let acceptor = WorkerAcceptor::new("w0").with_credentials("trainer", "s3cret");
    let service = Service::new(executor, acceptor);
    let handle = tokio::spawn(async move { service.serve(rx, tx).await });

    let (rx, tx) = io::split(two);
    let (rx, tx) = comms::channel(rx, tx);
    (rx, tx, handle)
}

async fn hello(rx: &mut Rx, tx: &mut Tx, token: &str) -> io::Result<bool> {
    let auth = AuthSpec {
        worker: "w0".into(),
        username: "trainer".into(),
        token: token.into(),
    };
    tx.send(&Msg::Control(Command::Hello(auth))).await?;

    let mut buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut buf).await?;
    Ok(matches!(msg, Msg::Control(Command::Welcome { .. })))
}

fn step(run_id: u64, model_kind: &str, samples: usize, delta: DeltaSpec) -> StepSpec {
    StepSpec {
        run_id,
        model_id: "model_0".into(),
        model_kind: model_kind.into(),
        criterion_kind: "mse".into(),
        x_size: 1,
        y_size: 1,
        samples,
        delta,
    }
}

async fn report(rx: &mut Rx) -> io::Result<(StepReport, Option<Vec<f32>>)> {
    let mut buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut buf).await?;
    let Msg::Control(Command::StepDone(report)) = msg else {
        panic!("unexpected message: {msg:?}");
    };

    if report.status != StepStatus::Ok {
        return Ok((report, None));
    }

    let msg: Msg = rx.recv_into(&mut buf).await?;
    let Msg::Data(Payload::Gradient(grad)) = msg else {
        panic!("unexpected message: {msg:?}");
    };
    Ok((report, Some(grad.to_vec())))
}

#[tokio::test]
async fn full_then_incremental_steps() -> io::Result<()> {
    let executor = Arc::new(Executor::new(Registry::with_builtins()));
    let (mut rx, mut tx, handle) = spawn_worker(Arc::clone(&executor));
    assert!(hello(&mut rx, &mut tx, "s3cret").await?);

    let rows = [1.0f32, 2.0, 2.0, 4.0];

    tx.send(&Msg::Control(Command::Step(step(
        1,
        "linear",
        2,
        DeltaSpec::Full { to: 1 },
    ))))
    .await?;
    tx.send(&Msg::Data(Payload::Params(&[0.0, 0.0]))).await?;
    tx.send(&Msg::Data(Payload::Shard(&rows))).await?;

    let (first, grad) = report(&mut rx).await?;
    assert_eq!(first.status, StepStatus::Ok);
    assert_eq!(first.sample_count, 2);
    // mean((0 - 2)^2, (0 - 4)^2)
    assert_eq!(first.loss, 10.0);
    assert_eq!(grad.map(|g| g.len()), Some(2));

    tx.send(&Msg::Control(Command::Step(step(
        2,
        "linear",
        2,
        DeltaSpec::Incremental { from: 1, to: 2 },
    ))))
    .await?;
    tx.send(&Msg::Data(Payload::Delta {
        indices: &[0],
        values: &[2.0],
    }))
    .await?;
    tx.send(&Msg::Data(Payload::Shard(&rows))).await?;

    let (second, grad) = report(&mut rx).await?;
    assert_eq!(second.loss, 0.0);
    assert_eq!(grad, Some(vec![0.0, 0.0]));
    assert_eq!(executor.params("model_0"), Some(vec![2.0, 0.0]));
    assert_eq!(executor.version("model_0"), Some(2));

    tx.send(&Msg::Control(Command::Disconnect)).await?;
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn ping_is_answered_with_the_same_nonce() -> io::Result<()> {
    let executor = Arc::new(Executor::new(Registry::with_builtins()));
    let (mut rx, mut tx, _handle) = spawn_worker(executor);
    assert!(hello(&mut rx, &mut tx, "s3cret").await?);

    tx.send(&Msg::Control(Command::Ping { nonce: 77 })).await?;

    let mut buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut buf).await?;
    assert_eq!(msg, Msg::Control(Command::Pong { nonce: 77 }));
    Ok(())
}

#[tokio::test]
async fn wrong_token_is_rejected() -> io::Result<()> {
    let executor = Arc::new(Executor::new(Registry::with_builtins()));
    let (mut rx, mut tx, handle) = spawn_worker(executor);

    assert!(!hello(&mut rx, &mut tx, "guess").await?);
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn missing_replica_is_reported_stale() -> io::Result<()> {
    let executor = Arc::new(Executor::new(Registry::with_builtins()));
    let (mut rx, mut tx, _handle) = spawn_worker(executor);
    assert!(hello(&mut rx, &mut tx, "s3cret").await?);

    tx.send(&Msg::Control(Command::Step(step(
        1,
        "linear",
        1,
        DeltaSpec::None { version: 4 },
    ))))
    .await?;
    tx.send(&Msg::Data(Payload::Shard(&[1.0, 1.0]))).await?;

    let (report, grad) = report(&mut rx).await?;
    assert_eq!(
        report.status,
        StepStatus::Failed(RemoteFailure::StaleReplica {
            have: None,
            want: 4
        })
    );
    assert!(grad.is_none());
    Ok(())
}

#[tokio::test]
async fn execution_failure_keeps_the_connection() -> io::Result<()> {
    let mut registry = Registry::with_builtins();
    registry.register_model("broken", Broken);
    let executor = Arc::new(Executor::new(registry));
    let (mut rx, mut tx, _handle) = spawn_worker(executor);
    assert!(hello(&mut rx, &mut tx, "s3cret").await?);

    tx.send(&Msg::Control(Command::Step(step(
        1,
        "broken",
        1,
        DeltaSpec::Full { to: 1 },
    ))))
    .await?;
    tx.send(&Msg::Data(Payload::Params(&[0.0, 0.0]))).await?;
    tx.send(&Msg::Data(Payload::Shard(&[1.0, 1.0]))).await?;

    let (report, _) = report(&mut rx).await?;
    assert!(matches!(
        report.status,
        StepStatus::Failed(RemoteFailure::Execution { .. })
    ));

    tx.send(&Msg::Control(Command::Ping { nonce: 1 })).await?;
    let mut buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut buf).await?;
    assert_eq!(msg, Msg::Control(Command::Pong { nonce: 1 }));
    Ok(())
}

#[tokio::test]
async fn wrong_frame_breaks_the_connection() -> io::Result<()> {
    let executor = Arc::new(Executor::new(Registry::with_builtins()));
    let (mut rx, mut tx, handle) = spawn_worker(executor);
    assert!(hello(&mut rx, &mut tx, "s3cret").await?);

    tx.send(&Msg::Control(Command::Step(step(
        1,
        "linear",
        1,
        DeltaSpec::Full { to: 1 },
    ))))
    .await?;
    tx.send(&Msg::Data(Payload::Shard(&[1.0, 1.0]))).await?;

    let (report, _) = report(&mut rx).await?;
    assert!(matches!(
        report.status,
        StepStatus::Failed(RemoteFailure::Protocol { .. })
    ));
    assert!(handle.await?.is_err());
    Ok(())
}

#[tokio::test]
async fn forward_answers_with_outputs() -> io::Result<()> {
    let executor = Arc::new(Executor::new(Registry::with_builtins()));
    let (mut rx, mut tx, _handle) = spawn_worker(Arc::clone(&executor));
    assert!(hello(&mut rx, &mut tx, "s3cret").await?);

    let spec = ForwardSpec {
        run_id: 4,
        model_id: "model_0".into(),
        model_kind: "linear".into(),
        x_size: 1,
        y_size: 1,
        samples: 2,
        delta: DeltaSpec::Full { to: 3 },
    };
    tx.send(&Msg::Control(Command::Forward(spec))).await?;
    tx.send(&Msg::Data(Payload::Params(&[3.0, -1.0]))).await?;
    tx.send(&Msg::Data(Payload::Shard(&[1.0, 2.0]))).await?;

    let mut buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut buf).await?;
    let Msg::Control(Command::StepDone(report)) = msg else {
        panic!("unexpected message: {msg:?}");
    };
    assert_eq!(report.run_id, 4);
    assert_eq!(report.status, StepStatus::Ok);
    assert_eq!(report.sample_count, 2);

    let msg: Msg = rx.recv_into(&mut buf).await?;
    assert_eq!(msg, Msg::Data(Payload::Outputs(&[2.0, 5.0])));
    assert_eq!(executor.version("model_0"), Some(3));
    Ok(())
}

#[tokio::test]
async fn release_drops_the_replica() -> io::Result<()> {
    let executor = Arc::new(Executor::new(Registry::with_builtins()));
    let (mut rx, mut tx, handle) = spawn_worker(Arc::clone(&executor));
    assert!(hello(&mut rx, &mut tx, "s3cret").await?);

    tx.send(&Msg::Control(Command::Step(step(
        1,
        "linear",
        1,
        DeltaSpec::Full { to: 1 },
    ))))
    .await?;
    tx.send(&Msg::Data(Payload::Params(&[0.0, 0.0]))).await?;
    tx.send(&Msg::Data(Payload::Shard(&[1.0, 1.0]))).await?;
    report(&mut rx).await?;
    assert_eq!(executor.len(), 1);

    let release = Command::Release {
        model_id: "model_0".into(),
    };
    tx.send(&Msg::Control(release)).await?;

    let mut buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut buf).await?;
    assert_eq!(
        msg,
        Msg::Control(Command::Released {
            model_id: "model_0".into()
        })
    );
    assert!(executor.is_empty());

    tx.send(&Msg::Control(Command::Disconnect)).await?;
    handle.await??;
    Ok(())
}
