use std::{env, io, sync::Arc};

use log::{error, info, warn};
use tokio::{net::TcpListener, signal};

use worker::{Executor, Registry, Service, WorkerAcceptor};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "50051";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let host = env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let port = env::var("PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());
    let addr = format!("{host}:{port}");
    let name = env::var("WORKER_NAME").unwrap_or_else(|_| addr.clone());

    let mut acceptor = WorkerAcceptor::new(name);
    match (env::var("WORKER_USER"), env::var("WORKER_TOKEN")) {
        (Ok(user), Ok(token)) => acceptor = acceptor.with_credentials(user, token),
        _ => warn!("WORKER_USER or WORKER_TOKEN unset, accepting any credentials"),
    }

    let executor = Arc::new(Executor::new(Registry::with_builtins()));
    let service = Service::new(executor, acceptor);

    let list = TcpListener::bind(&addr).await?;
    info!("listening at {addr}");

    tokio::select! {
        ret = accept(list, service) => ret?,
        _ = signal::ctrl_c() => {
            info!("received SIGTERM");
        }
    }

    Ok(())
}

async fn accept(list: TcpListener, service: Service) -> io::Result<()> {
    loop {
        let (stream, peer) = list.accept().await?;
        stream.set_nodelay(true)?;
        info!("orchestrator connected from {peer}");

        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);
        let service = service.clone();

        tokio::spawn(async move {
            if let Err(e) = service.serve(rx, tx).await {
                error!("connection with {peer} failed: {e}");
            }
        });
    }
}
