use crate::config::Config;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "windfarm-telemetry",
    version,
    about = "Wind-farm telemetry aggregation and forecasting service"
)]
pub struct Args {
    /// Address the HTTP API listens on.
    #[arg(long)]
    pub http_bind: Option<SocketAddr>,
    /// Replay the dataset at the accelerated emitter interval.
    #[arg(long, default_value_t = false)]
    pub accelerate: bool,
    #[arg(long)]
    pub dataset: Option<PathBuf>,
}

impl Args {
    pub fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.http_bind {
            config.http_bind = bind;
        }
        if self.accelerate {
            config.emit_accelerate = true;
        }
        if let Some(path) = &self.dataset {
            config.dataset_path = path.clone();
        }
    }
}
