use crate::collectors::probe::HostProbe;
use crate::collectors::{run_blocking, CollectError, CycleContext, Facet, Plugin, PluginKind};
use crate::registry::Registry;
use crate::schema::{Metadata, AGENT_VERSION};
use async_trait::async_trait;
use std::sync::Arc;

pub struct HostPlugin {
    probe: Arc<dyn HostProbe>,
}

impl HostPlugin {
    pub fn new(probe: Arc<dyn HostProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl Plugin for HostPlugin {
    fn kind(&self) -> PluginKind {
        PluginKind::Host
    }

    async fn collect(&self, ctx: &CycleContext, _registry: &Registry) -> Result<Facet, CollectError> {
        let probe = Arc::clone(&self.probe);
        let host = run_blocking(ctx, move || probe.host()).await?;
        // The engine stamps the timestamp once every plugin has settled.
        Ok(Facet::Host(Metadata {
            hostname: host.hostname,
            os_type: host.os_type,
            agent_version: AGENT_VERSION.to_string(),
            timestamp: Default::default(),
            uptime_seconds: host.uptime_seconds,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::probe::HostReading;
    use crate::collectors::testing::FakeProbe;
    use std::time::Duration;

    #[tokio::test]
    async fn reports_agent_version_and_host_identity() {
        let probe = FakeProbe {
            host: Some(HostReading {
                hostname: "dev-workstation-01".to_string(),
                os_type: "linux".to_string(),
                uptime_seconds: 14400,
            }),
            ..FakeProbe::default()
        };
        let plugin = HostPlugin::new(Arc::new(probe));
        let ctx = CycleContext::new(Duration::from_secs(1));
        let Facet::Host(meta) = plugin.collect(&ctx, &Registry::new()).await.unwrap() else {
            panic!("wrong facet");
        };
        assert_eq!(meta.hostname, "dev-workstation-01");
        assert_eq!(meta.os_type, "linux");
        assert_eq!(meta.agent_version, AGENT_VERSION);
        assert_eq!(meta.uptime_seconds, 14400);
    }
}
