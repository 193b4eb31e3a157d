use std::{net::SocketAddr, time::Duration};

use clap::{Parser, ValueEnum};

use crate::controllers::upgrade::UpgradeSettings;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Process settings, every flag can also be set from the environment.
#[derive(Parser, Clone, Debug)]
#[command(name = "cattle-sync-controller", version, about, long_about = None)]
pub struct Settings {
    /// Namespace receiving migrated node templates.
    #[arg(long, env = "GLOBAL_NAMESPACE", default_value = "cattle-global-data")]
    pub global_namespace: String,

    /// Downstream namespace holding k3s upgrade plans.
    #[arg(long, env = "UPGRADE_NAMESPACE", default_value = "cattle-system")]
    pub upgrade_namespace: String,

    /// Cluster driver whose upgrades are managed.
    #[arg(long, env = "MANAGED_DRIVER", default_value = "k3s")]
    pub managed_driver: String,

    #[arg(long, env = "UPGRADE_IMAGE", default_value = "rancher/k3s-upgrade")]
    pub upgrade_image: String,

    /// Namespace of the `<cluster>-kubeconfig` secrets.
    #[arg(long, env = "KUBECONFIG_NAMESPACE", default_value = "cattle-system")]
    pub kubeconfig_namespace: String,

    /// Feature overrides, e.g. `k3s-upgrade=false`.
    #[arg(long, env = "FEATURES", default_value = "")]
    pub features: String,

    /// Upper bound for a single reconcile pass, in seconds.
    #[arg(long, env = "SYNC_TIMEOUT", default_value = "60", value_parser = parse_seconds)]
    pub sync_timeout: Duration,

    /// Requeue interval for converged objects, in seconds.
    #[arg(long, env = "RESYNC_PERIOD", default_value = "600", value_parser = parse_seconds)]
    pub resync_period: Duration,

    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8443")]
    pub bind_address: SocketAddr,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    value
        .parse()
        .map(Duration::from_secs)
        .map_err(|e| format!("`{value}` is not a number of seconds: {e}"))
}

impl Settings {
    pub fn upgrade(&self) -> UpgradeSettings {
        UpgradeSettings {
            namespace: self.upgrade_namespace.clone(),
            driver: self.managed_driver.clone(),
            image: self.upgrade_image.clone(),
        }
    }
}
