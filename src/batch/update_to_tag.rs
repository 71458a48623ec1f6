//! Periodic reconciliation of running containers against registry tags.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::docker::GetContainersArg;
use crate::image::{ImagePattern, ImageRef};
use crate::jobs::{
    JobContext, JobError, JobHandler, JobParameters, JobsManager, PARAM_CLUSTER,
};
use crate::registry::{RegistryImage, RegistryRepository};
use crate::version::VersionComparator;

use super::{JP_FILTER, JP_IMAGE, JP_TARGET_VERSION, UPDATE_JOB_PREFIX};

/// Settings of the reconciler, from the application configuration.
#[derive(Debug, Clone)]
pub struct TagReconcileConfig {
    /// Tag strings ranked above every ordinary version, in order.
    pub latest_aliases: Vec<String>,
    /// Release suffix order, e.g. `["rc", "GA"]`.
    pub suffixes: Vec<String>,
    /// Strategy name the emitted update jobs use.
    pub strategy: String,
}

impl Default for TagReconcileConfig {
    fn default() -> Self {
        Self {
            latest_aliases: vec!["latest".to_string()],
            suffixes: Vec::new(),
            strategy: "stopThenStartEach".to_string(),
        }
    }
}

/// Update matched containers to the newest tag their registry offers.
pub struct UpdateToTagJob {
    registries: Arc<RegistryRepository>,
    manager: Weak<JobsManager>,
    comparator: VersionComparator,
    strategy: String,
}

impl UpdateToTagJob {
    pub fn new(
        registries: Arc<RegistryRepository>,
        manager: Weak<JobsManager>,
        config: TagReconcileConfig,
    ) -> Self {
        let mut builder = VersionComparator::builder();
        for alias in &config.latest_aliases {
            builder = builder.add_latest(alias);
        }
        for suffix in &config.suffixes {
            builder = builder.add_suffix(suffix);
        }
        Self {
            registries,
            manager,
            comparator: builder.build(),
            strategy: config.strategy,
        }
    }

    /// Newest tag of one repository, resolved to an image id. A registry
    /// that does not answer yields None so one missing image cannot fail
    /// the whole cycle.
    async fn latest(&self, ctx: &JobContext, image: &ImageRef) -> Option<RegistryImage> {
        let registry = match self.registries.get_registry(&image.registry) {
            Ok(registry) => registry,
            Err(e) => {
                ctx.fire(format!("No registry for \"{}\": {}, skip.", image, e));
                return None;
            }
        };
        let tags = match registry.get_tags(&image.name).await {
            Ok(Some(tags)) => tags.tags,
            Ok(None) => {
                ctx.fire(format!("Registry does not know \"{}\", skip.", image.name));
                return None;
            }
            Err(e) => {
                ctx.fire(format!("Tag listing of \"{}\" failed: {}, skip.", image.name, e));
                return None;
            }
        };
        let best = self
            .comparator
            .max(tags.iter().map(String::as_str))?
            .to_string();
        match registry.get_image(&image.name, &best).await {
            Ok(found) => found,
            Err(e) => {
                ctx.fire(format!(
                    "Descriptor of \"{}:{}\" failed: {}, skip.",
                    image.name, best, e
                ));
                None
            }
        }
    }
}

#[async_trait]
impl JobHandler for UpdateToTagJob {
    async fn run(&self, ctx: Arc<JobContext>) -> Result<(), JobError> {
        let docker = ctx
            .docker()
            .ok_or_else(|| JobError::Failed("job has no cluster scope".to_string()))?;
        let cluster = ctx
            .parameters()
            .get_str(PARAM_CLUSTER)?
            .unwrap_or_default();
        let filter = ctx
            .parameters()
            .get_str(JP_FILTER)?
            .map(|f| ImagePattern::new(&f));

        let listing = docker
            .get_containers(&GetContainersArg::new(true))
            .await
            .map_err(|e| JobError::Failed(format!("can not list containers: {e}")))?;

        // (registry, repository) -> latest, resolved once per cycle.
        let mut versions: HashMap<String, Option<RegistryImage>> = HashMap::new();
        // repository -> target tag for the update jobs this cycle emits.
        let mut targets: HashMap<String, String> = HashMap::new();

        for row in &listing {
            let image = ImageRef::parse(&row.image);
            if image.is_digest() {
                continue;
            }
            if let Some(pattern) = &filter {
                if !pattern.matches(&row.image) && !pattern.matches(&image.repository()) {
                    continue;
                }
            }
            let key = image.repository();
            if !versions.contains_key(&key) {
                let latest = self.latest(&ctx, &image).await;
                if latest.is_none() {
                    ctx.fire(format!("Latest image of \"{}\" is null, skip.", row.image));
                }
                versions.insert(key.clone(), latest);
            }
            let Some(latest) = versions.get(&key).and_then(|v| v.as_ref()) else {
                continue;
            };
            let outdated = match &image.tag {
                Some(tag) => tag != &latest.tag,
                None => true,
            } || row.image_id.as_deref() != Some(latest.id.as_str());
            if outdated {
                targets.insert(key.clone(), latest.tag.clone());
            }
        }

        if targets.is_empty() {
            ctx.fire("All containers already run their latest tags.");
            return Ok(());
        }

        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| JobError::Failed("job engine is shutting down".to_string()))?;

        for (repository, tag) in targets {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            ctx.fire(format!("Updating \"{}\" to tag \"{}\"", repository, tag));
            let params = JobParameters::builder(format!("{UPDATE_JOB_PREFIX}{}", self.strategy))
                .parameter(PARAM_CLUSTER, cluster.clone())
                .parameter(JP_IMAGE, format!("{repository}*"))
                .parameter(JP_TARGET_VERSION, tag)
                .build();
            match manager.submit(params) {
                Ok(child) => {
                    let end = child.at_end().await;
                    ctx.fire(format!("Update of \"{}\" ended: {:?}", repository, end));
                }
                Err(e) => ctx.fire(format!("Can not emit update for \"{}\": {}", repository, e)),
            }
        }
        Ok(())
    }
}
