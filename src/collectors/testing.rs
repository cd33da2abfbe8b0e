//! Scripted host probe for plugin and engine tests.

use crate::collectors::probe::{
    CpuReading, DiskReading, HostProbe, HostReading, InterfaceReading, MemoryReading,
    ProcessReading,
};
use crate::collectors::CollectError;
use std::collections::VecDeque;
use std::sync::Mutex;

/// `None` fields report the facet as unavailable. Interface readings are
/// consumed one batch per call so counter sequences can be replayed.
#[derive(Default)]
pub struct FakeProbe {
    pub host: Option<HostReading>,
    pub cpu: Option<CpuReading>,
    pub memory: Option<MemoryReading>,
    pub disks: Option<Vec<DiskReading>>,
    pub processes: Option<Vec<ProcessReading>>,
    pub interfaces: Mutex<VecDeque<Vec<InterfaceReading>>>,
}

impl FakeProbe {
    pub fn push_interfaces(&self, batch: Vec<InterfaceReading>) {
        self.interfaces.lock().unwrap().push_back(batch);
    }
}

impl HostProbe for FakeProbe {
    fn host(&self) -> Result<HostReading, CollectError> {
        self.host.clone().ok_or(CollectError::Unavailable("host"))
    }

    fn cpu(&self) -> Result<CpuReading, CollectError> {
        self.cpu.clone().ok_or(CollectError::Unavailable("cpu"))
    }

    fn memory(&self) -> Result<MemoryReading, CollectError> {
        self.memory.ok_or(CollectError::Unavailable("memory"))
    }

    fn disks(&self) -> Result<Vec<DiskReading>, CollectError> {
        self.disks.clone().ok_or(CollectError::Unavailable("disks"))
    }

    fn interfaces(&self) -> Result<Vec<InterfaceReading>, CollectError> {
        self.interfaces
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(CollectError::Unavailable("interfaces"))
    }

    fn processes(&self) -> Result<Vec<ProcessReading>, CollectError> {
        self.processes
            .clone()
            .ok_or(CollectError::Unavailable("processes"))
    }
}
