use std::{io, time::Duration};

use controllers::{NodeTemplateSyncError, UpgradeSyncError};
use features::FeatureError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("NodeTemplate sync error: {0}")]
    NodeTemplateSync(#[from] NodeTemplateSyncError),

    #[error("Upgrade sync error: {0}")]
    UpgradeSync(#[from] UpgradeSyncError),

    #[error("Feature error: {0}")]
    Feature(#[from] FeatureError),

    #[error("Reconcile did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Server error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube",
            Error::NodeTemplateSync(NodeTemplateSyncError::MissingCreator(_)) => "missing_creator",
            Error::NodeTemplateSync(_) => "nodetemplate_sync",
            Error::UpgradeSync(UpgradeSyncError::Resolve(_)) => "resolve",
            Error::UpgradeSync(_) => "upgrade_sync",
            Error::Feature(_) => "feature",
            Error::Timeout(_) => "timeout",
            Error::Metrics(_) => "metrics",
            Error::Io(_) => "io",
        }
        .to_string()
    }
}

/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod api;
pub mod config;
pub mod controllers;
pub mod features;
pub mod store;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::{Diagnostics, Metrics};
