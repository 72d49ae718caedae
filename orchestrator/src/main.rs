use std::env;

use orchestrator::{
    Batch, ClusterConfig, OptimizerSpec, ResourceDescriptor, Trainer, create_config,
};

#[tokio::main]
async fn main() -> orchestrator::Result<()> {
    env_logger::init();

    // A config path as the first argument, otherwise train on this machine alone.
    let config = match env::args().nth(1) {
        Some(path) => ClusterConfig::load(path)?,
        None => create_config([("local", ResourceDescriptor::local())], 1, false)?,
    };

    let data: Vec<f32> = (0..32)
        .flat_map(|i| {
            let x = i as f32 / 8.0;
            [x, 2.0 * x + 1.0]
        })
        .collect();
    let dataset = Batch::new(data, 1, 1)?;

    let trainer = Trainer::new(config)?;
    trainer.connect_all().await?;

    let model = trainer.register_model("linear", vec![0.0, 0.0], &OptimizerSpec::adam(0.05))?;
    let criterion = trainer.register_criterion(&model, "mse")?;

    let reports = trainer.fit(&criterion, &dataset, 8, 200).await?;

    for (worker, health) in trainer.health().await {
        match health {
            Ok(latency) => println!("{worker}: {latency:?}"),
            Err(e) => println!("{worker}: {e}"),
        }
    }

    let degraded = reports.iter().filter(|r| r.is_degraded()).count();
    println!("{} step(s), {degraded} degraded", reports.len());
    println!("final loss: {:.6}", criterion.evaluate(&dataset)?);
    println!("trained params: {:?}", model.params());

    let outputs = trainer.forward(&model, &dataset).await?;
    println!("f(0) = {:.4}, f(1) = {:.4}", outputs[0], outputs[8]);

    trainer.shutdown().await;
    Ok(())
}
