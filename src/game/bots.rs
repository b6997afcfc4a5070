use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::mesh::coordinator::{MeshCoordinator, SessionRole};
use crate::mesh::media::CaptureDevices;
use crate::mesh::signaling::EndpointFactory;
use crate::mesh::{JoinMedia, JoinMode, MeshEvent};

/// A scripted contestant running its own coordinator on its own task.
pub struct BotHandle {
    name: String,
    leave: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl BotHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Hang up and wait for the bot to tear down.
    pub async fn leave(mut self) {
        if let Some(leave) = self.leave.take() {
            let _ = leave.send(());
        }
        if let Err(e) = self.task.await {
            warn!("Bot {} task failed: {}", self.name, e);
        }
    }
}

pub fn spawn_bot(
    name: impl Into<String>,
    endpoints: Arc<dyn EndpointFactory>,
    devices: Arc<dyn CaptureDevices>,
    host_address: &str,
    config: &EngineConfig,
) -> BotHandle {
    let name = name.into();
    let (leave_tx, mut leave_rx) = oneshot::channel();
    let host_address = host_address.to_string();
    let attempts = config.open_attempts;
    let delay = config.open_retry_delay;
    let task_name = name.clone();

    let task = tokio::spawn(async move {
        let name = task_name;
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut mesh = MeshCoordinator::new(
            SessionRole::Joiner(JoinMode::Contestant),
            endpoints.create(),
            devices,
            tx,
        );
        if let Err(e) = mesh
            .start_joining(&host_address, JoinMedia::Camera, attempts, delay)
            .await
        {
            warn!("Bot {} could not join {}: {}", name, host_address, e);
            mesh.shutdown().await;
            return;
        }

        loop {
            tokio::select! {
                _ = &mut leave_rx => break,
                input = mesh.next_input() => {
                    mesh.process(input).await;
                    let mut host_lost = false;
                    while let Ok(event) = events.try_recv() {
                        match event {
                            MeshEvent::HostStreamReady(_) => info!("Bot {} is on stage", name),
                            MeshEvent::HostDisconnected(e) => {
                                info!("Bot {} lost the host: {}", name, e);
                                host_lost = true;
                            }
                            _ => {}
                        }
                    }
                    if host_lost {
                        break;
                    }
                }
            }
        }
        mesh.shutdown().await;
    });

    BotHandle {
        name,
        leave: Some(leave_tx),
        task,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mesh::loopback::LoopbackBroker;
    use crate::mesh::media::SyntheticDevices;
    use crate::mesh::LifecycleState;

    #[tokio::test]
    async fn bot_joins_and_leaves() {
        let broker = LoopbackBroker::new();
        let (tx, _events) = mpsc::unbounded_channel();
        let mut host = MeshCoordinator::new(
            SessionRole::Host,
            Box::new(broker.endpoint()),
            Arc::new(SyntheticDevices),
            tx,
        );
        let address = host.start_hosting(1, Duration::ZERO).await.unwrap();

        let bot = spawn_bot(
            "bot-1",
            Arc::new(broker.clone()),
            Arc::new(SyntheticDevices),
            &address,
            &EngineConfig::default(),
        );

        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let input = host.next_input().await;
                host.process(input).await;
                if host
                    .participants()
                    .iter()
                    .any(|p| p.state == LifecycleState::Active)
                {
                    break;
                }
            }
        })
        .await;
        assert!(joined.is_ok());

        bot.leave().await;
        host.process_pending().await;
        assert!(host.participants().is_empty());
        assert!(host.registry().is_empty());
    }
}
