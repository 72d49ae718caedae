use std::{
    collections::HashSet,
    fs,
    io::{self, BufReader, BufWriter, Write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, Result};

/// The port workers listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 50051;

/// The name the in-process worker is registered under by `ResourceDescriptor::local`.
pub const LOCALHOST: &str = "localhost";

/// How the trainer reaches a worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// A `worker` process reached over TCP.
    #[default]
    Tcp,
    /// Computed on this machine, no network involved.
    InProcess,
}

/// What a worker is presented with when the trainer opens a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub token: String,
    /// Key material for whatever tunnel fronts the worker, never sent over the channel.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
            key_path: None,
        }
    }
}

/// A worker's identity and capacity.
///
/// Immutable once built, the `with_*` consumers validate as they go.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    host: String,
    address: String,
    port: u16,
    gpu_ids: Vec<u32>,
    memory_gb: f64,
    cpu_cores: u32,
    credentials: Option<Credentials>,
    transport: Transport,
}

impl ResourceDescriptor {
    /// Creates a TCP worker reached at `host` on `DEFAULT_PORT`, with no GPUs.
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();

        Self {
            address: host.clone(),
            host,
            port: DEFAULT_PORT,
            gpu_ids: Vec::new(),
            memory_gb: 0.0,
            cpu_cores: 0,
            credentials: None,
            transport: Transport::Tcp,
        }
    }

    /// Creates the in-process worker for this machine.
    pub fn local() -> Self {
        Self::new(LOCALHOST).with_transport(Transport::InProcess)
    }

    /// Reaches the worker through `address` instead of its host name, e.g. a tunnel's local end.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> std::result::Result<Self, ConfigurationError> {
        if port == 0 {
            return Err(ConfigurationError::InvalidPort {
                worker: self.host,
            });
        }

        self.port = port;
        Ok(self)
    }

    pub fn with_gpus(
        mut self,
        gpu_ids: impl IntoIterator<Item = u32>,
    ) -> std::result::Result<Self, ConfigurationError> {
        let gpu_ids: Vec<u32> = gpu_ids.into_iter().collect();

        let mut seen = HashSet::new();
        if let Some(&gpu) = gpu_ids.iter().find(|&&id| !seen.insert(id)) {
            return Err(ConfigurationError::DuplicateGpu {
                worker: self.host,
                gpu,
            });
        }

        self.gpu_ids = gpu_ids;
        Ok(self)
    }

    pub fn with_memory_gb(mut self, memory_gb: f64) -> Self {
        self.memory_gb = memory_gb;
        self
    }

    pub fn with_cpu_cores(mut self, cpu_cores: u32) -> Self {
        self.cpu_cores = cpu_cores;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn gpu_ids(&self) -> &[u32] {
        &self.gpu_ids
    }

    pub fn gpu_count(&self) -> usize {
        self.gpu_ids.len()
    }

    pub fn memory_gb(&self) -> f64 {
        self.memory_gb
    }

    pub fn cpu_cores(&self) -> u32 {
        self.cpu_cores
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_local(&self) -> bool {
        self.transport == Transport::InProcess
    }
}

/// The workers a trainer distributes over, in the order shards are assigned and
/// results are combined, plus the global training parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PersistedConfig", into = "PersistedConfig")]
pub struct ClusterConfig {
    workers: Vec<(String, ResourceDescriptor)>,
    batch_size_multiplier: NonZeroUsize,
    prefer_gpu: bool,
}

/// Builds a `ClusterConfig` in code.
///
/// # Arguments
/// * `workers` - The workers by name, in insertion order.
/// * `batch_size_multiplier` - Scales the caller's base batch size in `Trainer::fit`.
/// * `prefer_gpu` - Whether to only use GPU workers when there are any.
///
/// # Returns
/// The config or a `ConfigurationError` if a name repeats or the multiplier is 0.
pub fn create_config<N, I>(
    workers: I,
    batch_size_multiplier: usize,
    prefer_gpu: bool,
) -> std::result::Result<ClusterConfig, ConfigurationError>
where
    N: Into<String>,
    I: IntoIterator<Item = (N, ResourceDescriptor)>,
{
    let batch_size_multiplier =
        NonZeroUsize::new(batch_size_multiplier).ok_or(ConfigurationError::ZeroMultiplier)?;

    let mut config = ClusterConfig {
        workers: Vec::new(),
        batch_size_multiplier,
        prefer_gpu,
    };

    for (name, descriptor) in workers {
        config.add_worker(name, descriptor)?;
    }

    Ok(config)
}

impl ClusterConfig {
    /// Appends a worker, names must be unique.
    pub fn add_worker(
        &mut self,
        name: impl Into<String>,
        descriptor: ResourceDescriptor,
    ) -> std::result::Result<(), ConfigurationError> {
        let name = name.into();

        if self.worker(&name).is_some() {
            return Err(ConfigurationError::DuplicateWorker(name));
        }

        self.workers.push((name, descriptor));
        Ok(())
    }

    /// Removes a worker, unless it's the in-process one.
    pub fn remove_worker(
        &mut self,
        name: &str,
    ) -> std::result::Result<ResourceDescriptor, ConfigurationError> {
        let pos = self
            .workers
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| ConfigurationError::UnknownWorker(name.to_string()))?;

        if self.workers[pos].1.is_local() {
            return Err(ConfigurationError::LocalWorker(name.to_string()));
        }

        Ok(self.workers.remove(pos).1)
    }

    pub fn worker(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.workers.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    /// The workers in insertion order.
    pub fn workers(&self) -> impl Iterator<Item = (&str, &ResourceDescriptor)> {
        self.workers.iter().map(|(n, d)| (n.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn batch_size_multiplier(&self) -> NonZeroUsize {
        self.batch_size_multiplier
    }

    pub fn prefer_gpu(&self) -> bool {
        self.prefer_gpu
    }

    /// Writes the config as pretty printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(fs::File::create(path)?);

        serde_json::to_writer_pretty(&mut writer, self).map_err(io::Error::from)?;
        writer.flush()?;

        info!("saved config with {} worker(s) to {}", self.len(), path.display());
        Ok(())
    }

    /// Reads a config written by `save`, or by hand following the same layout.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(fs::File::open(path)?);

        let config: Self = serde_json::from_reader(reader).map_err(io::Error::from)?;

        info!("loaded config with {} worker(s) from {}", config.len(), path.display());
        Ok(config)
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedConfig {
    workers: Vec<PersistedWorker>,
    batch_size_multiplier: usize,
    use_cuda: bool,
}

#[derive(Serialize, Deserialize)]
struct PersistedWorker {
    name: String,
    hostname: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    gpu_ids: Vec<u32>,
    #[serde(default)]
    memory_gb: f64,
    #[serde(default)]
    cpu_cores: u32,
    #[serde(default)]
    credentials: Option<Credentials>,
    #[serde(default)]
    transport: Transport,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl From<ClusterConfig> for PersistedConfig {
    fn from(config: ClusterConfig) -> Self {
        let workers = config
            .workers
            .into_iter()
            .map(|(name, d)| PersistedWorker {
                name,
                hostname: d.host,
                address: Some(d.address),
                port: d.port,
                gpu_ids: d.gpu_ids,
                memory_gb: d.memory_gb,
                cpu_cores: d.cpu_cores,
                credentials: d.credentials,
                transport: d.transport,
            })
            .collect();

        Self {
            workers,
            batch_size_multiplier: config.batch_size_multiplier.get(),
            use_cuda: config.prefer_gpu,
        }
    }
}

impl TryFrom<PersistedConfig> for ClusterConfig {
    type Error = ConfigurationError;

    fn try_from(persisted: PersistedConfig) -> std::result::Result<Self, Self::Error> {
        let workers = persisted
            .workers
            .into_iter()
            .map(|w| {
                let mut descriptor = ResourceDescriptor::new(w.hostname)
                    .with_port(w.port)?
                    .with_gpus(w.gpu_ids)?
                    .with_memory_gb(w.memory_gb)
                    .with_cpu_cores(w.cpu_cores)
                    .with_transport(w.transport);

                if let Some(address) = w.address {
                    descriptor = descriptor.with_address(address);
                }

                if let Some(credentials) = w.credentials {
                    descriptor = descriptor.with_credentials(credentials);
                }

                Ok((w.name, descriptor))
            })
            .collect::<std::result::Result<Vec<_>, ConfigurationError>>()?;

        create_config(workers, persisted.batch_size_multiplier, persisted.use_cuda)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults_to_its_host() {
        let d = ResourceDescriptor::new("gpu-box");
        assert_eq!(d.address(), "gpu-box");
        assert_eq!(d.port(), DEFAULT_PORT);
        assert_eq!(d.transport(), Transport::Tcp);
    }

    #[test]
    fn duplicate_gpus_are_rejected() {
        let err = ResourceDescriptor::new("a").with_gpus([0, 1, 0]).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::DuplicateGpu {
                worker: "a".into(),
                gpu: 0
            }
        );
    }

    #[test]
    fn port_zero_is_rejected() {
        assert!(ResourceDescriptor::new("a").with_port(0).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = create_config(
            [
                ("a", ResourceDescriptor::new("h1")),
                ("a", ResourceDescriptor::new("h2")),
            ],
            1,
            true,
        )
        .unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateWorker("a".into()));
    }

    #[test]
    fn local_worker_stays() {
        let mut config = create_config(
            [
                (LOCALHOST, ResourceDescriptor::local()),
                ("remote", ResourceDescriptor::new("10.0.0.2")),
            ],
            1,
            false,
        )
        .unwrap();

        assert!(matches!(
            config.remove_worker(LOCALHOST),
            Err(ConfigurationError::LocalWorker(_))
        ));
        assert!(config.remove_worker("remote").is_ok());
        assert_eq!(config.len(), 1);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let json = r#"{
            "workers": [{ "name": "w", "hostname": "box", "gpu_ids": [3] }],
            "batch_size_multiplier": 2,
            "use_cuda": true
        }"#;

        let config: ClusterConfig = serde_json::from_str(json).unwrap();
        let d = config.worker("w").unwrap();
        assert_eq!(d.address(), "box");
        assert_eq!(d.port(), DEFAULT_PORT);
        assert_eq!(d.gpu_ids(), [3]);
        assert!(d.credentials().is_none());
        assert!(config.prefer_gpu());
    }

    #[test]
    fn zero_multiplier_is_rejected() {
        let json = r#"{ "workers": [], "batch_size_multiplier": 0, "use_cuda": false }"#;
        assert!(serde_json::from_str::<ClusterConfig>(json).is_err());
    }
}
