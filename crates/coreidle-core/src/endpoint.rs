//! The command endpoint every outer surface goes through.

use std::sync::Arc;

use uuid::Uuid;

use crate::broker::{AperfMperf, RegisterBroker, RegisterRequest, RegisterResponse};
use crate::command::{CoreMask, IdleCommand, IdleRequest, RejectReason};
use crate::launcher::{LaunchHandle, Launcher};
use crate::orchestrator::Orchestrator;
use crate::slot::CoreStatus;
use crate::state::IdleState;

/// An idle command that passed validation and is now running.
#[derive(Debug)]
pub struct Accepted {
    pub id: Uuid,
    pub cores: CoreMask,
    pub state: IdleState,
    pub duration_us: u32,
    /// Join for the [`LaunchReport`](crate::launcher::LaunchReport), or drop
    /// to let the launch finish unobserved.
    pub handle: LaunchHandle,
}

/// Validates requests and dispatches them to the launcher or the broker.
#[derive(Clone)]
pub struct CommandEndpoint {
    orchestrator: Arc<Orchestrator>,
    launcher: Launcher,
    broker: RegisterBroker,
}

impl CommandEndpoint {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            launcher: orchestrator.launcher(),
            broker: orchestrator.broker(),
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Validate `request` and start it in the background.
    ///
    /// Returns as soon as the launch is under way. Power state on the selected
    /// cores changes from here on and is not rolled back.
    pub fn submit_idle_command(&self, request: &IdleRequest) -> Result<Accepted, RejectReason> {
        let command = IdleCommand::validate(
            request,
            self.orchestrator.online_cores(),
            self.orchestrator.max_duration_us(),
        )
        .inspect_err(|reason| log::info!("idle command rejected: {reason}"))?;

        let handle = self.launcher.launch(command).map_err(|e| {
            log::error!("cannot start launch: {e}");
            RejectReason::AllocationFailure
        })?;

        Ok(Accepted {
            id: handle.id(),
            cores: *command.core_mask(),
            state: command.state(),
            duration_us: command.duration_us(),
            handle,
        })
    }

    /// Blocks until the broker has an answer.
    pub fn submit_register_read(&self, request: &RegisterRequest) -> RegisterResponse {
        self.broker.read_request(request)
    }

    pub fn read_aperf_mperf(&self, core: u32) -> AperfMperf {
        self.broker.read_aperf_mperf(core)
    }

    pub fn core_status(&self) -> Vec<CoreStatus> {
        self.orchestrator.core_status()
    }
}
