use crate::collectors::{CollectError, CycleContext, Facet, Plugin, PluginKind};
use crate::docker::{ContainerRuntime, ContainerSummary};
use crate::registry::Registry;
use crate::schema::Container;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const SHORT_ID_LEN: usize = 8;

pub struct ContainerPlugin {
    runtime: Arc<dyn ContainerRuntime>,
    include_stopped: bool,
}

impl ContainerPlugin {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, include_stopped: bool) -> Self {
        Self {
            runtime,
            include_stopped,
        }
    }
}

#[async_trait]
impl Plugin for ContainerPlugin {
    fn kind(&self) -> PluginKind {
        PluginKind::Docker
    }

    async fn collect(&self, ctx: &CycleContext, _registry: &Registry) -> Result<Facet, CollectError> {
        let listing =
            tokio::time::timeout_at(ctx.deadline(), self.runtime.list_containers(self.include_stopped))
                .await
                .map_err(|_| CollectError::DeadlineExceeded)?;
        match listing {
            Ok(list) => Ok(Facet::Containers(list.into_iter().map(to_container).collect())),
            // No daemon means no containers, not a failure.
            Err(err) if err.is_unreachable() => {
                debug!(error = %err, "container runtime unreachable");
                Ok(Facet::Containers(Vec::new()))
            }
            Err(err) => Err(CollectError::Other(err.to_string())),
        }
    }
}

fn to_container(summary: ContainerSummary) -> Container {
    let name = summary
        .names
        .first()
        .map(|n| n.strip_prefix('/').unwrap_or(n).to_string())
        .unwrap_or_default();
    Container {
        id: summary.id.chars().take(SHORT_ID_LEN).collect(),
        name,
        status: summary.state,
        cpu_percent: 0.0,
        memory_mb: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{ContainerAction, RuntimeError};
    use std::path::PathBuf;
    use std::time::Duration;

    struct StaticRuntime(Vec<ContainerSummary>);

    #[async_trait]
    impl ContainerRuntime for StaticRuntime {
        async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
            Ok(self.0.clone())
        }

        async fn container_action(&self, _: &str, _: ContainerAction) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    struct DownRuntime;

    #[async_trait]
    impl ContainerRuntime for DownRuntime {
        async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
            Err(RuntimeError::Unreachable {
                path: PathBuf::from("/var/run/docker.sock"),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }

        async fn container_action(&self, _: &str, _: ContainerAction) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn maps_short_id_and_strips_leading_slash() {
        let runtime = StaticRuntime(vec![
            ContainerSummary {
                id: "4f66ad9a0b2e3c1d5e".to_string(),
                names: vec!["/web".to_string(), "/alias".to_string()],
                state: "running".to_string(),
            },
            ContainerSummary {
                id: "9c2b".to_string(),
                names: vec![],
                state: "exited".to_string(),
            },
        ]);
        let plugin = ContainerPlugin::new(Arc::new(runtime), true);
        let ctx = CycleContext::new(Duration::from_secs(1));
        let Facet::Containers(list) = plugin.collect(&ctx, &Registry::new()).await.unwrap() else {
            panic!("wrong facet");
        };
        assert_eq!(list[0].id, "4f66ad9a");
        assert_eq!(list[0].name, "web");
        assert_eq!(list[0].status, "running");
        assert_eq!(list[1].id, "9c2b");
        assert_eq!(list[1].name, "");
        assert_eq!(list[1].memory_mb, 0.0);
    }

    #[tokio::test]
    async fn unreachable_runtime_yields_empty_list() {
        let plugin = ContainerPlugin::new(Arc::new(DownRuntime), true);
        let ctx = CycleContext::new(Duration::from_secs(1));
        let facet = plugin.collect(&ctx, &Registry::new()).await.unwrap();
        assert_eq!(facet, Facet::Containers(Vec::new()));
    }
}
