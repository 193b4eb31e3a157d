//! Feature switches and the startup tasks they own.
//!
//! The registry is built once in `main` and handed to the runtime. Each
//! feature runs its tasks in registration order; features run concurrently.

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use futures::future::try_join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::controllers::controller::Context;
use crate::{controller, Result};

pub static NODE_TEMPLATE_MIGRATION: &str = "nodetemplate-migration";
pub static K3S_UPGRADE: &str = "k3s-upgrade";

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Malformed feature override `{0}`, expected `name=true|false`")]
    Malformed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Alpha,
    Beta,
    Ga,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Alpha => "alpha",
            Stage::Beta => "beta",
            Stage::Ga => "ga",
        })
    }
}

/// Everything a task may need at startup.
#[derive(Clone)]
pub struct TaskContext {
    pub context: Arc<Context>,
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &TaskContext) -> Result<()>;
}

pub struct Feature {
    pub name: &'static str,
    pub stage: Stage,
    pub default: bool,
    enabled: bool,
    tasks: Vec<Box<dyn Task>>,
}

impl Feature {
    pub fn new(name: &'static str, stage: Stage, default: bool) -> Self {
        Self {
            name,
            stage,
            default,
            enabled: default,
            tasks: vec![],
        }
    }

    pub fn task(mut self, task: impl Task + 'static) -> Self {
        self.tasks.push(Box::new(task));
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        for task in &self.tasks {
            info!(feature = self.name, task = task.name(), "Running task");
            task.execute(ctx).await?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FeatureRegistry {
    features: Vec<Feature>,
}

impl FeatureRegistry {
    pub fn register(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    /// Features shipped with the controller.
    pub fn with_defaults() -> Self {
        Self::default()
            .register(
                Feature::new(NODE_TEMPLATE_MIGRATION, Stage::Ga, true)
                    .task(RbacBackfill)
                    .task(NodeTemplateController),
            )
            .register(Feature::new(K3S_UPGRADE, Stage::Beta, true).task(ClusterController))
    }

    /// Applies `name=bool,name=bool` overrides.
    ///
    /// Nothing is changed if any entry is malformed.
    pub fn apply_overrides(&mut self, overrides: &str) -> Result<(), FeatureError> {
        let mut parsed = BTreeMap::new();
        for entry in overrides.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| FeatureError::Malformed(entry.to_string()))?;
            let value: bool = value
                .trim()
                .parse()
                .map_err(|_| FeatureError::Malformed(entry.to_string()))?;
            parsed.insert(name.trim(), value);
        }

        for (name, value) in parsed {
            match self.features.iter_mut().find(|f| f.name == name) {
                Some(feature) => feature.enabled = value,
                None => warn!(feature = name, "Ignoring override for unknown feature"),
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.features.iter().any(|f| f.name == name && f.enabled)
    }

    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    /// Runs the tasks of every enabled feature until one of them fails.
    pub async fn run_enabled(&self, ctx: &TaskContext) -> Result<()> {
        let enabled = self.features.iter().filter(|f| f.enabled);
        for feature in enabled.clone() {
            info!(feature = feature.name, stage = %feature.stage, "Feature enabled");
        }

        try_join_all(enabled.map(|f| f.run(ctx))).await?;
        Ok(())
    }
}

/// Grants creators access to every existing node template.
pub struct RbacBackfill;

#[async_trait]
impl Task for RbacBackfill {
    fn name(&self) -> &'static str {
        "rbac-backfill"
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        ctx.context.node_templates.backfill_rbac().await?;
        Ok(())
    }
}

pub struct NodeTemplateController;

#[async_trait]
impl Task for NodeTemplateController {
    fn name(&self) -> &'static str {
        "nodetemplate-controller"
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        controller::run_node_template_controller(ctx.context.clone()).await
    }
}

pub struct ClusterController;

#[async_trait]
impl Task for ClusterController {
    fn name(&self) -> &'static str {
        "cluster-controller"
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        controller::run_cluster_controller(ctx.context.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use clap::Parser;
    use kube::{Client, Config};

    use super::*;
    use crate::{config::Settings, Error, State};

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Task for Record {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(&self, _ctx: &TaskContext) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            match self.fail {
                true => Err(Error::Timeout(std::time::Duration::from_secs(1))),
                false => Ok(()),
            }
        }
    }

    fn task_context() -> TaskContext {
        let config = Config::new("http://127.0.0.1:6443".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        let state = State::new(Settings::try_parse_from(["controller"]).unwrap()).unwrap();
        TaskContext {
            context: state.to_context(client),
        }
    }

    #[test]
    fn defaults_are_enabled() {
        let registry = FeatureRegistry::with_defaults();

        assert!(registry.is_enabled(NODE_TEMPLATE_MIGRATION));
        assert!(registry.is_enabled(K3S_UPGRADE));
        let stages: Vec<_> = registry.features().map(|f| (f.name, f.stage)).collect();
        assert_eq!(
            stages,
            vec![(NODE_TEMPLATE_MIGRATION, Stage::Ga), (K3S_UPGRADE, Stage::Beta)]
        );
    }

    #[test]
    fn overrides_toggle_features() {
        let mut registry = FeatureRegistry::with_defaults();

        registry
            .apply_overrides(" k3s-upgrade=false , unknown=true,")
            .unwrap();

        assert!(registry.is_enabled(NODE_TEMPLATE_MIGRATION));
        assert!(!registry.is_enabled(K3S_UPGRADE));
        assert!(!registry.is_enabled("unknown"));
    }

    #[test]
    fn malformed_override_changes_nothing() {
        let mut registry = FeatureRegistry::with_defaults();

        for bad in ["k3s-upgrade=false,nodetemplate-migration", "k3s-upgrade=off"] {
            assert!(matches!(
                registry.apply_overrides(bad),
                Err(FeatureError::Malformed(_))
            ));
        }
        assert!(registry.is_enabled(K3S_UPGRADE));
    }

    #[tokio::test]
    async fn runs_tasks_of_enabled_features_in_order() {
        let log = Arc::new(Mutex::new(vec![]));
        let task = |name, fail| Record {
            name,
            log: log.clone(),
            fail,
        };
        let mut registry = FeatureRegistry::default()
            .register(
                Feature::new("first", Stage::Ga, true)
                    .task(task("a", false))
                    .task(task("b", false)),
            )
            .register(Feature::new("second", Stage::Alpha, false).task(task("c", false)));
        registry.apply_overrides("").unwrap();

        registry.run_enabled(&task_context()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failing_task_stops_its_feature() {
        let log = Arc::new(Mutex::new(vec![]));
        let task = |name, fail| Record {
            name,
            log: log.clone(),
            fail,
        };
        let registry = FeatureRegistry::default().register(
            Feature::new("first", Stage::Beta, true)
                .task(task("a", true))
                .task(task("b", false)),
        );

        let err = registry.run_enabled(&task_context()).await.unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }
}
