//! In-memory control plane
//!
//! Operations take effect when submitted and their tasks report `Done` on the
//! first poll, unless a failure rule matches or tasks are held pending. Every
//! call is recorded so tests can assert on exactly what reached the control
//! plane.

use super::{ControlPlane, MachineConfig, Operation, PowerState, TaskHandle, TaskStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A call that reached the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// [`ControlPlane::submit`]
    Submit(Operation),
    /// [`ControlPlane::task_status`]
    TaskStatus(TaskHandle),
    /// [`ControlPlane::list_machine_ids`]
    ListMachineIds,
    /// [`ControlPlane::list_network_names`]
    ListNetworkNames(String),
    /// [`ControlPlane::configure_machine`]
    Configure(u32, MachineConfig),
    /// [`ControlPlane::machine_status`]
    MachineStatus(u32),
    /// [`ControlPlane::create_bridge`]
    CreateBridge(String),
    /// [`ControlPlane::delete_bridge`]
    DeleteBridge(String),
}

/// A machine held by the in-memory control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRecord {
    /// Image the machine was cloned from, `None` for seeded machines
    pub image: Option<u32>,
    /// Display name
    pub name: String,
    /// Current power state
    pub power: PowerState,
    /// Every configuration update merged together
    pub config: MachineConfig,
}

type FailureRule = Box<dyn Fn(&Operation) -> bool + Send + Sync>;

#[derive(Default)]
struct State {
    machines: BTreeMap<u32, MachineRecord>,
    networks: BTreeSet<String>,
    tasks: HashMap<TaskHandle, TaskStatus>,
    next_task: u64,
    calls: Vec<Call>,
    fail_rules: Vec<FailureRule>,
    hold_tasks: bool,
}

/// Control plane kept entirely in memory
#[derive(Default)]
pub struct MemoryControlPlane {
    state: Mutex<State>,
}

impl MemoryControlPlane {
    /// Create an empty control plane
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pre-existing machine that is not managed by any build
    pub fn with_machine(self, id: u32) -> Self {
        self.state().machines.insert(
            id,
            MachineRecord {
                image: None,
                name: format!("existing-{id}"),
                power: PowerState::Stopped,
                config: MachineConfig::default(),
            },
        );
        self
    }

    /// Seed a pre-existing network
    pub fn with_network(self, name: impl Into<String>) -> Self {
        self.state().networks.insert(name.into());
        self
    }

    /// Make every operation matching `rule` finish with a failed task
    pub fn fail_when<F>(&self, rule: F)
    where
        F: Fn(&Operation) -> bool + Send + Sync + 'static,
    {
        self.state().fail_rules.push(Box::new(rule));
    }

    /// Keep every subsequently submitted task pending forever
    pub fn hold_tasks(&self, hold: bool) {
        self.state().hold_tasks = hold;
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Operations submitted so far, in order
    pub fn operations(&self) -> Vec<Operation> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Submit(op) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of submitted operations matching `predicate`
    pub fn count_operations<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Operation) -> bool,
    {
        self.operations().iter().filter(|op| predicate(op)).count()
    }

    /// Ids of the machines that currently exist
    pub fn machine_ids(&self) -> BTreeSet<u32> {
        self.state().machines.keys().copied().collect()
    }

    /// A machine's current record
    pub fn machine(&self, id: u32) -> Option<MachineRecord> {
        self.state().machines.get(&id).cloned()
    }

    /// Names of the networks that currently exist
    pub fn network_names(&self) -> BTreeSet<String> {
        self.state().networks.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn record(&mut self, call: Call) {
        self.calls.push(call);
    }

    fn machine_mut(&mut self, id: u32) -> Result<&mut MachineRecord> {
        self.machines
            .get_mut(&id)
            .ok_or_else(|| Error::control_plane(format!("no such machine: {id}")))
    }

    /// Validate an operation and apply its effect
    fn apply(&mut self, operation: &Operation) -> Result<()> {
        match operation {
            Operation::Clone {
                image, id, name, ..
            } => {
                if !self.machines.contains_key(image) {
                    return Err(Error::control_plane(format!("no such image: {image}")));
                }
                if self.machines.contains_key(id) {
                    return Err(Error::control_plane(format!("machine {id} already exists")));
                }
                self.machines.insert(
                    *id,
                    MachineRecord {
                        image: Some(*image),
                        name: name.clone(),
                        power: PowerState::Stopped,
                        config: MachineConfig::default(),
                    },
                );
            }
            Operation::Start { id } => self.machine_mut(*id)?.power = PowerState::Running,
            Operation::Shutdown { id } | Operation::Stop { id } => {
                self.machine_mut(*id)?.power = PowerState::Stopped
            }
            Operation::Delete { id } => {
                if self.machine_mut(*id)?.power == PowerState::Running {
                    return Err(Error::control_plane(format!("machine {id} is running")));
                }
                self.machines.remove(id);
            }
            Operation::ApplyNetwork => {}
        }
        Ok(())
    }

    fn new_task(&mut self, status: TaskStatus) -> TaskHandle {
        self.next_task += 1;
        let handle = TaskHandle(format!("UPID:memory:{:08X}", self.next_task));
        self.tasks.insert(handle.clone(), status);
        handle
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn submit(&self, operation: Operation) -> Result<TaskHandle> {
        let mut state = self.state();
        state.record(Call::Submit(operation.clone()));

        let status = if state.fail_rules.iter().any(|rule| rule(&operation)) {
            TaskStatus::Failed(format!("injected failure for {operation}"))
        } else {
            state.apply(&operation)?;
            if state.hold_tasks {
                TaskStatus::Pending
            } else {
                TaskStatus::Done
            }
        };

        Ok(state.new_task(status))
    }

    async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus> {
        let mut state = self.state();
        state.record(Call::TaskStatus(task.clone()));
        state
            .tasks
            .get(task)
            .cloned()
            .ok_or_else(|| Error::control_plane(format!("no such task: {task}")))
    }

    async fn list_machine_ids(&self) -> Result<BTreeSet<u32>> {
        let mut state = self.state();
        state.record(Call::ListMachineIds);
        Ok(state.machines.keys().copied().collect())
    }

    async fn list_network_names(&self, prefix: &str) -> Result<BTreeSet<String>> {
        let mut state = self.state();
        state.record(Call::ListNetworkNames(prefix.to_string()));
        Ok(state
            .networks
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn configure_machine(&self, id: u32, config: MachineConfig) -> Result<()> {
        let mut state = self.state();
        state.record(Call::Configure(id, config.clone()));
        state.machine_mut(id)?.config.merge(config);
        Ok(())
    }

    async fn machine_status(&self, id: u32) -> Result<PowerState> {
        let mut state = self.state();
        state.record(Call::MachineStatus(id));
        Ok(state.machine_mut(id)?.power)
    }

    async fn create_bridge(&self, name: &str, _comment: &str) -> Result<()> {
        let mut state = self.state();
        state.record(Call::CreateBridge(name.to_string()));
        if !state.networks.insert(name.to_string()) {
            return Err(Error::control_plane(format!("network {name} already exists")));
        }
        Ok(())
    }

    async fn delete_bridge(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.record(Call::DeleteBridge(name.to_string()));
        if !state.networks.remove(name) {
            return Err(Error::control_plane(format!("no such network: {name}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_clone_requires_image() {
        let control = MemoryControlPlane::new();
        let result = control
            .submit(Operation::Clone {
                image: 9000,
                id: 100,
                name: "web".to_string(),
                description: String::new(),
            })
            .await;
        assert!(matches!(result, Err(Error::ControlPlane(_))));
    }

    #[smol_potat::test]
    async fn test_lifecycle_operations() {
        let control = MemoryControlPlane::new().with_machine(9000);

        let task = control
            .submit(Operation::Clone {
                image: 9000,
                id: 100,
                name: "web".to_string(),
                description: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(control.task_status(&task).await.unwrap(), TaskStatus::Done);
        assert_eq!(control.machine(100).unwrap().image, Some(9000));

        control.submit(Operation::Start { id: 100 }).await.unwrap();
        assert_eq!(
            control.machine_status(100).await.unwrap(),
            PowerState::Running
        );

        // Running machines cannot be deleted
        assert!(control.submit(Operation::Delete { id: 100 }).await.is_err());

        control.submit(Operation::Stop { id: 100 }).await.unwrap();
        control.submit(Operation::Delete { id: 100 }).await.unwrap();
        assert_eq!(control.machine_ids(), BTreeSet::from([9000]));
    }

    #[smol_potat::test]
    async fn test_failure_rules_leave_state_untouched() {
        let control = MemoryControlPlane::new().with_machine(9000);
        control.fail_when(|op| matches!(op, Operation::Clone { id: 101, .. }));

        let task = control
            .submit(Operation::Clone {
                image: 9000,
                id: 101,
                name: "db".to_string(),
                description: String::new(),
            })
            .await
            .unwrap();

        assert!(matches!(
            control.task_status(&task).await.unwrap(),
            TaskStatus::Failed(_)
        ));
        assert!(control.machine(101).is_none());
    }

    #[smol_potat::test]
    async fn test_held_tasks_stay_pending() {
        let control = MemoryControlPlane::new();
        control.hold_tasks(true);

        let task = control.submit(Operation::ApplyNetwork).await.unwrap();
        assert_eq!(
            control.task_status(&task).await.unwrap(),
            TaskStatus::Pending
        );
    }

    #[smol_potat::test]
    async fn test_networks_filtered_by_prefix() {
        let control = MemoryControlPlane::new()
            .with_network("vmbr0")
            .with_network("eth0");
        control.create_bridge("vmbr1", "scratch").await.unwrap();

        assert_eq!(
            control.list_network_names("vmbr").await.unwrap(),
            BTreeSet::from(["vmbr0".to_string(), "vmbr1".to_string()])
        );
        assert!(control.create_bridge("vmbr1", "again").await.is_err());

        control.delete_bridge("vmbr1").await.unwrap();
        assert!(!control.network_names().contains("vmbr1"));
    }
}
