use crate::config::stack_config::{DEFAULT_PORT_CEILING, DEFAULT_PORT_FLOOR};
use crate::domain::model::{PortPlan, Protocol, ServiceSpec};
use crate::utils::error::{OrchestratorError, Result};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub floor: u16,
    pub ceiling: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            floor: DEFAULT_PORT_FLOOR,
            ceiling: DEFAULT_PORT_CEILING,
        }
    }
}

impl PortRange {
    pub fn new(floor: u16, ceiling: u16) -> Result<Self> {
        if floor == 0 || floor > ceiling {
            return Err(OrchestratorError::config(
                "ports",
                format!("Invalid port search range {}-{}", floor, ceiling),
            ));
        }
        Ok(Self { floor, ceiling })
    }

    pub fn candidates(&self) -> std::ops::RangeInclusive<u16> {
        self.floor..=self.ceiling
    }
}

/// 解決 host port 衝突；同一份 in-use 快照永遠得到同一份 plan
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// 需要交給 PortScanner 檢查的 port：所有偏好 port，加上搜尋區間內每個用到的協定
    pub fn scan_candidates<'a, I>(&self, specs: I) -> Vec<(u16, Protocol)>
    where
        I: IntoIterator<Item = &'a ServiceSpec>,
    {
        let bindings: Vec<(u16, Protocol)> = specs
            .into_iter()
            .flat_map(|s| s.ports.iter())
            .map(|b| (b.preferred_host_port, b.protocol))
            .collect();
        let protocols: BTreeSet<Protocol> =
            bindings.iter().map(|(_, protocol)| *protocol).collect();

        let mut candidates: BTreeSet<(u16, Protocol)> = bindings.into_iter().collect();
        for protocol in protocols {
            candidates.extend(self.range.candidates().map(|p| (p, protocol)));
        }
        candidates.into_iter().collect()
    }

    pub fn resolve<'a, I>(&self, specs: I, in_use: &BTreeSet<u16>) -> Result<PortPlan>
    where
        I: IntoIterator<Item = &'a ServiceSpec>,
    {
        let mut ordered: Vec<&ServiceSpec> = specs.into_iter().collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name));

        let mut claimed: BTreeSet<u16> = BTreeSet::new();
        let mut plan = PortPlan::new();

        for spec in ordered {
            let mut assigned: BTreeMap<u16, u16> = BTreeMap::new();

            for binding in &spec.ports {
                // 同一 container port 的 tcp/udp 共用同一個 host port
                if assigned.contains_key(&binding.container_port) {
                    continue;
                }

                let preferred = binding.preferred_host_port;
                let host_port = if !in_use.contains(&preferred) && !claimed.contains(&preferred) {
                    preferred
                } else {
                    let fallback = self
                        .range
                        .candidates()
                        .find(|p| !in_use.contains(p) && !claimed.contains(p))
                        .ok_or_else(|| OrchestratorError::PortExhaustionError {
                            service: spec.name.clone(),
                            container_port: binding.container_port,
                            floor: self.range.floor,
                            ceiling: self.range.ceiling,
                        })?;
                    tracing::info!(
                        "🔀 Port {} for {}:{} is taken, remapped to {}",
                        preferred,
                        spec.name,
                        binding.container_port,
                        fallback
                    );
                    fallback
                };

                claimed.insert(host_port);
                assigned.insert(binding.container_port, host_port);
            }

            plan.insert(spec.name.clone(), assigned);
        }

        Ok(plan)
    }
}
