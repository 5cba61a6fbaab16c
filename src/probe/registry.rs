use std::path::PathBuf;

use super::{HOOK_POINTS, HookId, UprobeDescriptor, UprobeKind};
use crate::error::{Result, UprobeError};
use crate::stats::{Collector, Sample};

/// A probe attached in one backend.
pub struct Probe {
    pub descriptor: UprobeDescriptor,
    pub collector: Box<dyn Collector>,
    /// Stat file written by a dump during this activation (local probes).
    pub dumped: Option<PathBuf>,
}

impl Probe {
    pub fn new(descriptor: UprobeDescriptor, collector: Box<dyn Collector>) -> Self {
        Self {
            descriptor,
            collector,
            dumped: None,
        }
    }

    pub fn kind(&self) -> UprobeKind {
        self.descriptor.kind
    }
}

/// Probes attached in one backend, indexed by hook point.
///
/// The lookup on the call path is a single vector index; a hook point
/// without a probe costs one `None` check.
pub struct Registry {
    probes: Vec<Option<Probe>>,
    active: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            probes: (0..HOOK_POINTS.len()).map(|_| None).collect(),
            active: 0,
        }
    }

    pub fn insert(&mut self, hook: HookId, probe: Probe) -> Result<()> {
        let entry = &mut self.probes[hook.index()];
        if entry.is_some() {
            return Err(UprobeError::AlreadyActive(format!("uprobe on {}", hook.name())));
        }
        *entry = Some(probe);
        self.active += 1;
        Ok(())
    }

    pub fn remove(&mut self, hook: HookId) -> Option<Probe> {
        let probe = self.probes[hook.index()].take();
        if probe.is_some() {
            self.active -= 1;
        }
        probe
    }

    pub fn get(&self, hook: HookId) -> Option<&Probe> {
        self.probes[hook.index()].as_ref()
    }

    pub fn get_mut(&mut self, hook: HookId) -> Option<&mut Probe> {
        self.probes[hook.index()].as_mut()
    }

    #[inline]
    pub fn kind_of(&self, hook: HookId) -> Option<UprobeKind> {
        self.probes[hook.index()].as_ref().map(Probe::kind)
    }

    #[inline]
    pub fn record(&mut self, hook: HookId, sample: Sample) {
        if let Some(probe) = self.probes[hook.index()].as_mut() {
            probe.collector.record(sample);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (HookId, &Probe)> {
        HookId::all().filter_map(|hook| self.get(hook).map(|p| (hook, p)))
    }

    pub fn descriptors(&self) -> Vec<UprobeDescriptor> {
        self.iter().map(|(_, p)| p.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Locality;
    use crate::stats::{LocalCollector, StatSlot};

    fn probe(function: &str, kind: UprobeKind) -> Probe {
        Probe::new(
            UprobeDescriptor {
                function: function.to_string(),
                kind,
                locality: Locality::Local,
            },
            Box::new(LocalCollector::new(kind)),
        )
    }

    #[test]
    fn test_insert_remove_and_count() {
        let mut reg = Registry::new();
        let hook = HookId::resolve("PortalStart").unwrap();
        reg.insert(hook, probe("PortalStart", UprobeKind::Time)).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(matches!(
            reg.insert(hook, probe("PortalStart", UprobeKind::Hist)),
            Err(UprobeError::AlreadyActive(_))
        ));
        assert_eq!(reg.kind_of(hook), Some(UprobeKind::Time));

        assert!(reg.remove(hook).is_some());
        assert!(reg.remove(hook).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_record_goes_to_matching_probe() {
        let mut reg = Registry::new();
        let a = HookId::resolve("palloc").unwrap();
        let b = HookId::resolve("pfree").unwrap();
        reg.insert(a, probe("palloc", UprobeKind::Time)).unwrap();

        reg.record(
            a,
            Sample {
                duration_ns: 10,
                mem_delta: 0,
            },
        );
        reg.record(b, Sample::default());

        let StatSlot::Time(t) = reg.get(a).unwrap().collector.snapshot() else {
            panic!("expected TIME slot");
        };
        assert_eq!(t.calls, 1);
        assert_eq!(reg.descriptors().len(), 1);
    }
}
