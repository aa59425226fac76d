//! Conflict-free resource bundles per tenant.
//!
//! Ports come from a fixed window and are handed out lowest-free-first.
//! The scan and the marking happen under one allocator-wide lock, so two
//! concurrent allocations can never observe the same free port.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

use crate::config::ResourceConfig;

/// Errors from the resource allocator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("{0}")]
    Exhausted(String),

    #[error("Tenant '{0}' already holds a resource bundle")]
    AlreadyAllocated(String),

    #[error("Invalid requirements: {0}")]
    InvalidRequirements(String),
}

/// What a tenant asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub port_count: usize,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub storage_gb: u64,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            port_count: 2,
            memory_mb: 512,
            cpu_cores: 1.0,
            storage_gb: 1,
        }
    }
}

/// Resources held by one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBundle {
    pub tenant_id: String,
    pub ports: BTreeSet<u16>,
    pub namespace: String,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub storage_gb: u64,
    pub allocated_at: DateTime<Utc>,
}

/// Snapshot of allocator occupancy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub active_tenants: usize,
    pub used_ports: usize,
    pub available_ports: usize,
    pub total_memory_mb: u64,
    pub total_cpu_cores: f64,
    pub total_storage_gb: u64,
}

#[derive(Debug, Default)]
struct AllocationTable {
    bundles: HashMap<String, ResourceBundle>,
    used_ports: BTreeSet<u16>,
    namespaces: BTreeSet<String>,
    namespace_counter: u64,
    memory_mb: u64,
    cpu_cores: f64,
}

/// Hands out disjoint port sets and unique namespaces.
pub struct ResourceAllocator {
    base_port: u16,
    port_range: u32,
    max_memory_mb: Option<u64>,
    max_cpu_cores: Option<f64>,
    table: Mutex<AllocationTable>,
}

impl ResourceAllocator {
    /// Create an allocator over `[base_port, base_port + port_range)`.
    ///
    /// The window is clamped to the valid port space.
    pub fn new(config: &ResourceConfig) -> Self {
        let max_range = 65_536 - u32::from(config.base_port.max(1));
        Self {
            base_port: config.base_port.max(1),
            port_range: config.port_range.min(max_range),
            max_memory_mb: config.max_memory_mb,
            max_cpu_cores: config.max_cpu_cores,
            table: Mutex::new(AllocationTable::default()),
        }
    }

    /// Allocator over a port window with no memory/CPU capacity limits.
    pub fn with_port_window(base_port: u16, port_range: u32) -> Self {
        Self::new(&ResourceConfig {
            base_port,
            port_range,
            ..ResourceConfig::default()
        })
    }

    /// Allocate a new bundle for a tenant.
    pub fn allocate(
        &self,
        tenant_id: &str,
        requirements: &ResourceRequirements,
    ) -> Result<ResourceBundle, ResourceError> {
        let mut table = self.table.lock();
        if table.bundles.contains_key(tenant_id) {
            return Err(ResourceError::AlreadyAllocated(tenant_id.to_string()));
        }
        self.allocate_locked(&mut table, tenant_id, requirements)
    }

    /// Return the tenant's bundle, allocating one if it holds none.
    pub fn ensure_allocated(
        &self,
        tenant_id: &str,
        requirements: &ResourceRequirements,
    ) -> Result<ResourceBundle, ResourceError> {
        let mut table = self.table.lock();
        if let Some(bundle) = table.bundles.get(tenant_id) {
            return Ok(bundle.clone());
        }
        self.allocate_locked(&mut table, tenant_id, requirements)
    }

    fn allocate_locked(
        &self,
        table: &mut AllocationTable,
        tenant_id: &str,
        requirements: &ResourceRequirements,
    ) -> Result<ResourceBundle, ResourceError> {
        if tenant_id.trim().is_empty() {
            return Err(ResourceError::InvalidRequirements(
                "tenant id must not be empty".into(),
            ));
        }
        if !requirements.cpu_cores.is_finite() || requirements.cpu_cores < 0.0 {
            return Err(ResourceError::InvalidRequirements(format!(
                "cpu_cores must be a non-negative number, got {}",
                requirements.cpu_cores
            )));
        }

        if let Some(max) = self.max_memory_mb {
            if table.memory_mb.saturating_add(requirements.memory_mb) > max {
                tracing::warn!(tenant = tenant_id, requested = requirements.memory_mb, "Memory capacity exhausted");
                return Err(ResourceError::Exhausted(format!(
                    "memory capacity exhausted: {} MB in use of {} MB, {} MB requested",
                    table.memory_mb, max, requirements.memory_mb
                )));
            }
        }
        if let Some(max) = self.max_cpu_cores {
            if table.cpu_cores + requirements.cpu_cores > max {
                tracing::warn!(tenant = tenant_id, requested = requirements.cpu_cores, "CPU capacity exhausted");
                return Err(ResourceError::Exhausted(format!(
                    "cpu capacity exhausted: {} cores in use of {}, {} requested",
                    table.cpu_cores, max, requirements.cpu_cores
                )));
            }
        }

        let ports = self.scan_free_ports(&table.used_ports, requirements.port_count);
        if ports.len() < requirements.port_count {
            tracing::warn!(
                tenant = tenant_id,
                requested = requirements.port_count,
                free = ports.len(),
                "Port window exhausted"
            );
            return Err(ResourceError::Exhausted(format!(
                "port window [{}, {}) cannot supply {} free ports",
                self.base_port,
                u32::from(self.base_port) + self.port_range,
                requirements.port_count
            )));
        }

        let namespace = loop {
            table.namespace_counter += 1;
            let candidate = format!(
                "startup-{}-{}",
                sanitize_tenant(tenant_id),
                table.namespace_counter
            );
            if !table.namespaces.contains(&candidate) {
                break candidate;
            }
        };

        table.used_ports.extend(ports.iter().copied());
        table.namespaces.insert(namespace.clone());
        table.memory_mb = table.memory_mb.saturating_add(requirements.memory_mb);
        table.cpu_cores += requirements.cpu_cores;

        let bundle = ResourceBundle {
            tenant_id: tenant_id.to_string(),
            ports,
            namespace,
            memory_mb: requirements.memory_mb,
            cpu_cores: requirements.cpu_cores,
            storage_gb: requirements.storage_gb,
            allocated_at: Utc::now(),
        };
        table.bundles.insert(tenant_id.to_string(), bundle.clone());

        tracing::info!(
            tenant = tenant_id,
            namespace = %bundle.namespace,
            ports = ?bundle.ports,
            "Allocated resource bundle"
        );
        Ok(bundle)
    }

    fn scan_free_ports(&self, used: &BTreeSet<u16>, count: usize) -> BTreeSet<u16> {
        let end = u32::from(self.base_port) + self.port_range;
        (u32::from(self.base_port)..end)
            .map(|p| p as u16)
            .filter(|p| !used.contains(p))
            .take(count)
            .collect()
    }

    /// Release everything a tenant holds. No-op if it holds nothing.
    pub fn deallocate(&self, tenant_id: &str) -> Option<ResourceBundle> {
        let mut table = self.table.lock();
        let bundle = table.bundles.remove(tenant_id)?;
        for port in &bundle.ports {
            table.used_ports.remove(port);
        }
        table.namespaces.remove(&bundle.namespace);
        table.memory_mb = table.memory_mb.saturating_sub(bundle.memory_mb);
        table.cpu_cores = (table.cpu_cores - bundle.cpu_cores).max(0.0);

        tracing::info!(tenant = tenant_id, namespace = %bundle.namespace, "Released resource bundle");
        Some(bundle)
    }

    /// Bundle currently held by a tenant.
    pub fn bundle(&self, tenant_id: &str) -> Option<ResourceBundle> {
        self.table.lock().bundles.get(tenant_id).cloned()
    }

    /// Current occupancy.
    pub fn usage(&self) -> ResourceUsage {
        let table = self.table.lock();
        ResourceUsage {
            active_tenants: table.bundles.len(),
            used_ports: table.used_ports.len(),
            available_ports: (self.port_range as usize).saturating_sub(table.used_ports.len()),
            total_memory_mb: table.memory_mb,
            total_cpu_cores: table.cpu_cores,
            total_storage_gb: table.bundles.values().map(|b| b.storage_gb).sum(),
        }
    }
}

impl Default for ResourceAllocator {
    fn default() -> Self {
        Self::new(&ResourceConfig::default())
    }
}

fn sanitize_tenant(tenant_id: &str) -> String {
    let slug: String = tenant_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "tenant".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn ports(count: usize) -> ResourceRequirements {
        ResourceRequirements {
            port_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn test_ports_reused_after_release() {
        let allocator = ResourceAllocator::with_port_window(9000, 10);

        let t1 = allocator.allocate("t1", &ports(3)).unwrap();
        let t2 = allocator.allocate("t2", &ports(3)).unwrap();
        assert!(t1.ports.is_disjoint(&t2.ports));

        allocator.deallocate("t1");
        let t3 = allocator.allocate("t3", &ports(3)).unwrap();
        assert!(t3.ports.is_disjoint(&t2.ports));
        // Lowest-free-first hands t1's ports back out.
        assert_eq!(t3.ports, t1.ports);
    }

    #[test]
    fn test_exhaustion() {
        let allocator = ResourceAllocator::with_port_window(9000, 5);
        allocator.allocate("t1", &ports(3)).unwrap();
        let err = allocator.allocate("t2", &ports(3)).unwrap_err();
        assert!(matches!(err, ResourceError::Exhausted(_)));
        // Failed allocation must not leak ports.
        assert_eq!(allocator.usage().used_ports, 3);
    }

    #[test]
    fn test_deallocate_is_idempotent() {
        let allocator = ResourceAllocator::with_port_window(9000, 10);
        allocator.allocate("t1", &ports(2)).unwrap();
        assert!(allocator.deallocate("t1").is_some());
        assert!(allocator.deallocate("t1").is_none());
        assert_eq!(allocator.usage(), ResourceUsage {
            available_ports: 10,
            ..Default::default()
        });
    }

    #[test]
    fn test_namespace_unique_across_reuse() {
        let allocator = ResourceAllocator::with_port_window(9000, 10);
        let first = allocator.allocate("Acme Labs", &ports(1)).unwrap();
        allocator.deallocate("Acme Labs");
        let second = allocator.allocate("Acme Labs", &ports(1)).unwrap();
        assert!(first.namespace.starts_with("startup-acme-labs-"));
        assert_ne!(first.namespace, second.namespace);
    }

    #[test]
    fn test_double_allocate_rejected_but_ensure_reuses() {
        let allocator = ResourceAllocator::with_port_window(9000, 10);
        let bundle = allocator.allocate("t1", &ports(2)).unwrap();
        assert!(matches!(
            allocator.allocate("t1", &ports(2)),
            Err(ResourceError::AlreadyAllocated(_))
        ));
        assert_eq!(allocator.ensure_allocated("t1", &ports(2)).unwrap(), bundle);
        assert_eq!(allocator.usage().used_ports, 2);
    }

    #[test]
    fn test_memory_capacity() {
        let allocator = ResourceAllocator::new(&ResourceConfig {
            base_port: 9000,
            port_range: 100,
            max_memory_mb: Some(1024),
            ..Default::default()
        });
        let req = ResourceRequirements {
            port_count: 1,
            memory_mb: 600,
            ..Default::default()
        };
        allocator.allocate("t1", &req).unwrap();
        assert!(matches!(
            allocator.allocate("t2", &req),
            Err(ResourceError::Exhausted(_))
        ));
        allocator.deallocate("t1");
        assert!(allocator.allocate("t2", &req).is_ok());
    }

    #[test]
    fn test_oversized_memory_request_rejected() {
        let allocator = ResourceAllocator::new(&ResourceConfig {
            base_port: 9000,
            port_range: 100,
            max_memory_mb: Some(1024),
            ..Default::default()
        });
        let small = ResourceRequirements {
            port_count: 1,
            memory_mb: 512,
            ..Default::default()
        };
        let huge = ResourceRequirements {
            port_count: 1,
            memory_mb: u64::MAX,
            ..Default::default()
        };
        allocator.allocate("t1", &small).unwrap();
        assert!(matches!(
            allocator.allocate("t2", &huge),
            Err(ResourceError::Exhausted(_))
        ));
        assert_eq!(allocator.usage().total_memory_mb, 512);
    }

    #[test]
    fn test_concurrent_allocations_never_overlap() {
        let allocator = Arc::new(ResourceAllocator::with_port_window(20_000, 400));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || allocator.allocate(&format!("t{}", i), &ports(25)))
            })
            .collect();

        let bundles: Vec<ResourceBundle> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        let mut seen = BTreeSet::new();
        for bundle in &bundles {
            for port in &bundle.ports {
                assert!(seen.insert(*port), "port {} handed out twice", port);
            }
        }
        assert_eq!(seen.len(), 400);
    }

    proptest! {
        #[test]
        fn prop_capacity_rule(range in 1u32..64, k in 1usize..8, n in 1usize..16) {
            let allocator = ResourceAllocator::with_port_window(10_000, range);
            let results: Vec<_> = (0..n)
                .map(|i| allocator.allocate(&format!("t{}", i), &ports(k)))
                .collect();

            let all_ok = results.iter().all(|r| r.is_ok());
            prop_assert_eq!(all_ok, n * k <= range as usize);

            let live: Vec<&ResourceBundle> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            for (i, a) in live.iter().enumerate() {
                for b in &live[i + 1..] {
                    prop_assert!(a.ports.is_disjoint(&b.ports));
                    prop_assert_ne!(&a.namespace, &b.namespace);
                }
                for port in &a.ports {
                    prop_assert!(u32::from(*port) >= 10_000 && u32::from(*port) < 10_000 + range);
                }
            }
        }
    }
}
