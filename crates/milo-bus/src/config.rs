// Bus defaults and configuration overrides.
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::{BusError, Result};

pub const DEFAULT_PUB_BIND_ADDR: &str = "tcp://*:5556";
pub const DEFAULT_SUB_CONNECT_ADDR: &str = "tcp://127.0.0.1:5556";
pub const DEFAULT_INPROC_INGRESS: &str = "inproc://ingress";
pub const DEFAULT_IO_THREADS: i32 = 1;
pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const DEFAULT_HWM: i32 = 1000;
pub const DEFAULT_METRICS_PERIOD: Duration = Duration::from_millis(1000);
// Slow-joiner mitigation: a SUB socket connecting concurrently with bind can
// miss the earliest publications, so `start` sleeps this long after binding.
pub const DEFAULT_WARMUP: Duration = Duration::from_millis(500);

/// Configuration shared by both bus roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Publisher listens for subscribers here.
    pub pub_bind_addr: String,
    /// Subscriber dials this address.
    pub sub_connect_addr: String,
    /// Intra-process address for the producer → I/O fan-in.
    pub inproc_ingress: String,
    /// ZeroMQ context I/O thread count.
    pub io_threads: i32,
    /// Subscriber compute pool size; 0 means one per CPU.
    pub worker_threads: usize,
    /// High-water mark applied to every socket.
    pub hwm: i32,
    /// Window size for throughput/latency computation.
    pub metrics_period: Duration,
    /// Publisher start-up sleep for the slow-joiner problem.
    pub warmup: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            pub_bind_addr: DEFAULT_PUB_BIND_ADDR.to_string(),
            sub_connect_addr: DEFAULT_SUB_CONNECT_ADDR.to_string(),
            inproc_ingress: DEFAULT_INPROC_INGRESS.to_string(),
            io_threads: DEFAULT_IO_THREADS,
            worker_threads: DEFAULT_WORKER_THREADS,
            hwm: DEFAULT_HWM,
            metrics_period: DEFAULT_METRICS_PERIOD,
            warmup: DEFAULT_WARMUP,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct BusConfigOverride {
    pub_bind_addr: Option<String>,
    sub_connect_addr: Option<String>,
    inproc_ingress: Option<String>,
    io_threads: Option<i32>,
    worker_threads: Option<usize>,
    hwm: Option<i32>,
    metrics_period_ms: Option<u64>,
    warmup_ms: Option<u64>,
}

impl BusConfig {
    /// Defaults with `MILO_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("MILO_PUB_BIND") {
            config.pub_bind_addr = value;
        }
        if let Ok(value) = std::env::var("MILO_SUB_CONNECT") {
            config.sub_connect_addr = value;
        }
        if let Ok(value) = std::env::var("MILO_INPROC_INGRESS") {
            config.inproc_ingress = value;
        }
        if let Some(value) = read_i32_env("MILO_IO_THREADS") {
            config.io_threads = value;
        }
        if let Some(value) = read_usize_env("MILO_WORKER_THREADS") {
            config.worker_threads = value;
        }
        if let Some(value) = read_i32_env("MILO_HWM") {
            config.hwm = value;
        }
        if let Some(value) = read_u64_env("MILO_METRICS_PERIOD_MS") {
            config.metrics_period = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("MILO_WARMUP_MS") {
            config.warmup = Duration::from_millis(value);
        }
        config
    }

    /// Env config plus a YAML override file, taken from `config_path` or the
    /// `MILO_BUS_CONFIG` variable when set.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("MILO_BUS_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .map_err(|err| BusError::Config(format!("read bus config {path}: {err}")))?;
            let override_cfg: BusConfigOverride = serde_yaml::from_str(&contents)
                .map_err(|err| BusError::Config(format!("parse bus config {path}: {err}")))?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    /// Worker count with the 0-means-auto rule resolved.
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

impl BusConfigOverride {
    fn apply(&self, config: &mut BusConfig) {
        if let Some(value) = &self.pub_bind_addr {
            config.pub_bind_addr = value.clone();
        }
        if let Some(value) = &self.sub_connect_addr {
            config.sub_connect_addr = value.clone();
        }
        if let Some(value) = &self.inproc_ingress {
            config.inproc_ingress = value.clone();
        }
        if let Some(value) = self.io_threads {
            if value > 0 {
                config.io_threads = value;
            }
        }
        if let Some(value) = self.worker_threads {
            config.worker_threads = value;
        }
        if let Some(value) = self.hwm {
            if value >= 0 {
                config.hwm = value;
            }
        }
        if let Some(value) = self.metrics_period_ms {
            config.metrics_period = Duration::from_millis(value);
        }
        if let Some(value) = self.warmup_ms {
            config.warmup = Duration::from_millis(value);
        }
    }
}

fn read_i32_env(key: &str) -> Option<i32> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
