use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hdcp_core::harness::{simulated_adapters, wait_until};
use hdcp_core::{
    ClientId, HdcpSession, LinkId, OutputId, Policy, RegistryError, SessionRegistry,
    SessionState, SessionStatus,
};
use hdcp_transport::testing::{EngineProfile, ReceiverProfile, SimulatedLink};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AgentConfig, OutputConfig};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service start failed: {0}")]
    StartFailed(String),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[async_trait]
pub trait ServiceHost: Send {
    async fn start(&mut self) -> Result<(), ServiceError>;
    async fn stop(&mut self);
    fn status(&self) -> ServiceStatus;
}

/// Hosts one session per configured output, each against a simulated
/// receiver, and plugs them all in on start.
pub struct SimulatedOutputs {
    config: AgentConfig,
    registry: Arc<SessionRegistry>,
    links: Vec<(OutputId, SimulatedLink)>,
    status: ServiceStatus,
}

impl SimulatedOutputs {
    pub fn new(config: AgentConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_outputs));
        Self {
            config,
            registry,
            links: Vec::new(),
            status: ServiceStatus::Stopped,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn link(&self, output: OutputId) -> Option<&SimulatedLink> {
        self.links
            .iter()
            .find_map(|(id, link)| (*id == output).then_some(link))
    }

    fn attach(&self, output: &OutputConfig) -> Result<(SimulatedLink, Arc<HdcpSession>), ServiceError> {
        let receiver = match output.repeater_devices {
            Some(devices) => ReceiverProfile::repeater(output.seed, devices),
            None => ReceiverProfile::sink(output.seed),
        };
        let link = SimulatedLink::with_profiles(
            output.seed,
            receiver,
            EngineProfile::healthy(output.seed),
        );
        let session = HdcpSession::spawn(
            LinkId(output.id),
            simulated_adapters(&link),
            self.config.hdcp_for(output),
        )
        .map_err(|e| ServiceError::StartFailed(format!("output {}: {e}", output.name)))?;
        Ok((link, Arc::new(session)))
    }

    /// Status of every output, ordered by output id.
    pub fn report(&self) -> Vec<(OutputId, SessionStatus)> {
        self.registry
            .outputs()
            .into_iter()
            .filter_map(|id| self.registry.session(id).map(|s| (id, s.status())))
            .collect()
    }

    /// Wait until no output still has an attempt in flight.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let sessions: Vec<_> = self
            .registry
            .outputs()
            .into_iter()
            .filter_map(|id| self.registry.session(id))
            .collect();
        wait_until(timeout, || {
            sessions.iter().all(|s| {
                let status = s.status();
                match status.state {
                    SessionState::LinkVerify | SessionState::Off => true,
                    _ => status.attempts > 0 && status.failures > 0,
                }
            })
        })
        .await
    }
}

#[async_trait]
impl ServiceHost for SimulatedOutputs {
    async fn start(&mut self) -> Result<(), ServiceError> {
        self.status = ServiceStatus::Starting;
        let outputs = self.config.outputs.clone();
        for output in &outputs {
            let id = OutputId(output.id);
            let (link, session) = self.attach(output)?;
            self.registry.register(id, session.clone())?;
            self.registry.open(id, ClientId(u64::from(output.id)))?;
            self.links.push((id, link));

            if session.policy() == Policy::OnDemand {
                if let Err(e) = session.enable().await {
                    warn!(%id, error = %e, "enable failed");
                }
            }
            if let Err(e) = self.registry.hotplug(id, true).await {
                warn!(%id, error = %e, "hotplug failed");
            }
            info!(%id, name = %output.name, repeater = output.repeater_devices.is_some(), "output attached");
        }
        self.status = ServiceStatus::Running;
        Ok(())
    }

    async fn stop(&mut self) {
        self.status = ServiceStatus::Stopping;
        self.registry.shutdown().await;
        self.links.clear();
        self.status = ServiceStatus::Stopped;
        info!("all outputs stopped");
    }

    fn status(&self) -> ServiceStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTLE: Duration = Duration::from_secs(30);

    fn output(id: u32, repeater_devices: Option<u8>) -> OutputConfig {
        OutputConfig {
            id,
            name: format!("out{id}"),
            seed: u64::from(id) + 40,
            repeater_devices,
            policy: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_outputs_authenticate_on_start() {
        let config = AgentConfig {
            outputs: vec![output(0, None), output(1, Some(2))],
            ..Default::default()
        };
        let mut service = SimulatedOutputs::new(config);
        service.start().await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Running);
        assert!(service.settle(SETTLE).await);

        let report = service.report();
        assert_eq!(report.len(), 2);
        assert!(report
            .iter()
            .all(|(_, status)| status.state == SessionState::LinkVerify));
        assert_eq!(report[1].1.downstream_devices, Some(2));

        service.stop().await;
        assert_eq!(service.status(), ServiceStatus::Stopped);
        assert!(service.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_output_settles() {
        let mut config = AgentConfig {
            outputs: vec![output(0, None)],
            ..Default::default()
        };
        config.hdcp.max_downstream_devices = 1;
        config.outputs[0].repeater_devices = Some(3);

        let mut service = SimulatedOutputs::new(config);
        service.start().await.unwrap();
        assert!(service.settle(SETTLE).await);

        let (_, status) = &service.report()[0];
        assert_eq!(status.state, SessionState::Unauthenticated);
        assert_eq!(status.failures, 1);
        assert!(service.link(OutputId(0)).is_some());
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_capacity_reported() {
        let config = AgentConfig {
            max_outputs: 1,
            outputs: vec![output(0, None), output(1, None)],
            ..Default::default()
        };
        let mut service = SimulatedOutputs::new(config);
        assert!(matches!(
            service.start().await,
            Err(ServiceError::Registry(RegistryError::ResourceExhausted { capacity: 1 }))
        ));
        service.stop().await;
    }
}
