use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::catalog::MetricGroups;
use crate::vsphere::{ManagedObjectRef, ObjectContent, Session};

pub const VIRTUAL_MACHINE: &str = "VirtualMachine";
pub const HOST_SYSTEM: &str = "HostSystem";
pub const CLUSTER_COMPUTE_RESOURCE: &str = "ClusterComputeResource";
pub const DATACENTER: &str = "Datacenter";

/// Extra host field carrying the number of hardware threads.
pub const CPU_CORECOUNT_FIELD: &str = "cpu_corecount_total";

const HOST_PATHS: &[&str] = &["summary.config.name", "summary.hardware.numCpuThreads"];
const VM_PATHS: &[&str] = &[
    "summary.runtime.host",
    "summary.config.vmPathName",
    "datastore",
];
const CLUSTER_PATHS: &[&str] = &["name", "configuration"];

/// Object types the enumerator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryKind {
    VirtualMachine,
    HostSystem,
    ClusterComputeResource,
}

impl InventoryKind {
    pub fn from_type(kind: &str) -> Option<Self> {
        match kind {
            VIRTUAL_MACHINE => Some(Self::VirtualMachine),
            HOST_SYSTEM => Some(Self::HostSystem),
            CLUSTER_COMPUTE_RESOURCE => Some(Self::ClusterComputeResource),
            _ => None,
        }
    }
}

/// Discovered refs split by kind, in discovery order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Partition {
    pub vms: Vec<ManagedObjectRef>,
    pub hosts: Vec<ManagedObjectRef>,
    pub clusters: Vec<ManagedObjectRef>,
    /// VMs and hosts, the objects performance data is requested for.
    pub scored: Vec<ManagedObjectRef>,
}

/// Split refs by kind. Duplicates and unknown types are dropped.
pub fn partition(refs: impl IntoIterator<Item = ManagedObjectRef>) -> Partition {
    let mut out = Partition::default();
    let mut seen = HashSet::new();

    for r in refs {
        if !seen.insert(r.clone()) {
            continue;
        }

        match InventoryKind::from_type(&r.kind) {
            Some(InventoryKind::VirtualMachine) => {
                out.vms.push(r.clone());
                out.scored.push(r);
            }
            Some(InventoryKind::HostSystem) => {
                out.hosts.push(r.clone());
                out.scored.push(r);
            }
            Some(InventoryKind::ClusterComputeResource) => out.clusters.push(r),
            None => debug!(object = %r, "skipping object of unsupported type"),
        }
    }

    out
}

/// Types requested from container views: every grouped type plus clusters.
pub fn object_types(groups: &MetricGroups) -> Vec<String> {
    let mut types: Vec<String> = groups.object_types().map(str::to_string).collect();
    if !types.iter().any(|t| t == CLUSTER_COMPUTE_RESOURCE) {
        types.push(CLUSTER_COMPUTE_RESOURCE.to_string());
    }
    types
}

/// Relational context of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityContext {
    pub display_name: String,
    pub cluster: Option<String>,
    /// Name of the host a VM runs on.
    pub host: Option<String>,
    pub datastore: Option<String>,
}

impl EntityContext {
    /// Tags contributed by this context, absent values omitted.
    pub fn tags(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("cluster", self.cluster.as_deref()),
            ("esx", self.host.as_deref()),
            ("datastore", self.datastore.as_deref()),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.filter(|v| !v.is_empty()).map(|v| (key, v)))
    }
}

/// Result of one enumeration, passed by value to later stages.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    /// Objects to query, VMs and hosts in discovery order.
    pub refs: Vec<ManagedObjectRef>,
    pub names: HashMap<ManagedObjectRef, String>,
    pub contexts: HashMap<ManagedObjectRef, EntityContext>,
    /// Static fields appended to entity points.
    pub extra_fields: HashMap<ManagedObjectRef, BTreeMap<String, i64>>,
}

impl Inventory {
    pub fn display_name(&self, entity: &ManagedObjectRef) -> &str {
        self.names.get(entity).map(String::as_str).unwrap_or_default()
    }

    pub fn context(&self, entity: &ManagedObjectRef) -> Option<&EntityContext> {
        self.contexts.get(entity)
    }

    pub fn extra_fields(&self, entity: &ManagedObjectRef) -> Option<&BTreeMap<String, i64>> {
        self.extra_fields.get(entity)
    }
}

/// Text between the first `[` and the following `]` of a datastore path
/// such as `[ds01] vm/vm.vmx`.
pub fn datastore_from_path(path: &str) -> Option<String> {
    let start = path.find('[')? + 1;
    let len = path[start..].find(']')?;
    let name = &path[start..start + len];
    (!name.is_empty()).then(|| name.to_string())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfigJson {
    #[serde(default)]
    das_vm_config: Vec<DasVmConfigJson>,
}

#[derive(Deserialize)]
struct DasVmConfigJson {
    key: ManagedObjectRef,
}

struct VmDetails {
    vm: ManagedObjectRef,
    host: Option<ManagedObjectRef>,
    datastore: Option<ManagedObjectRef>,
    path_datastore: Option<String>,
}

/// Enumerate the monitored objects of one vCenter and their context.
///
/// A datacenter whose container view cannot be read is skipped. Any
/// property retrieval failure afterwards aborts the enumeration.
pub async fn enumerate<S: Session>(session: &S, groups: &MetricGroups) -> Result<Inventory> {
    let root = session.service_content().root_folder.clone();
    let root_content = session
        .retrieve_one(&root, &["childEntity"])
        .await
        .context("listing datacenters")?;

    let datacenters: Vec<ManagedObjectRef> = root_content
        .get::<Vec<ManagedObjectRef>>("childEntity")?
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.kind == DATACENTER)
        .collect();

    let types = object_types(groups);
    let mut discovered = Vec::new();

    for dc in &datacenters {
        match datacenter_view(session, dc, &types).await {
            Ok(refs) => discovered.extend(refs),
            Err(e) => warn!(datacenter = %dc, error = %e, "skipping datacenter"),
        }
    }

    let parts = partition(discovered);
    debug!(
        datacenters = datacenters.len(),
        vms = ?parts.vms,
        hosts = ?parts.hosts,
        clusters = ?parts.clusters,
        "partitioned inventory",
    );

    let mut host_names: HashMap<ManagedObjectRef, String> = HashMap::new();
    let mut extra_fields: HashMap<ManagedObjectRef, BTreeMap<String, i64>> = HashMap::new();

    let host_contents = session
        .retrieve_properties(&parts.hosts, HOST_PATHS)
        .await
        .context("retrieving host properties")?;
    for content in &host_contents {
        if let Some(name) = content.get::<String>("summary.config.name")? {
            host_names.insert(content.obj.clone(), name);
        }
        if let Some(threads) = content.get::<i64>("summary.hardware.numCpuThreads")? {
            extra_fields
                .entry(content.obj.clone())
                .or_default()
                .insert(CPU_CORECOUNT_FIELD.to_string(), threads);
        }
    }

    let vm_contents = session
        .retrieve_properties(&parts.vms, VM_PATHS)
        .await
        .context("retrieving virtual machine properties")?;
    let vms = vm_contents
        .iter()
        .map(vm_details)
        .collect::<Result<Vec<_>>>()?;

    let cluster_contents = session
        .retrieve_properties(&parts.clusters, CLUSTER_PATHS)
        .await
        .context("retrieving cluster properties")?;
    let mut vm_to_cluster: HashMap<ManagedObjectRef, String> = HashMap::new();
    for content in &cluster_contents {
        let Some(name) = content.get::<String>("name")? else {
            continue;
        };
        let config: Option<ClusterConfigJson> = content.get("configuration")?;
        for das in config.map(|c| c.das_vm_config).unwrap_or_default() {
            vm_to_cluster.insert(das.key, name.clone());
        }
    }
    debug!(membership = ?vm_to_cluster, "resolved cluster membership");

    let mut name_targets = parts.scored.clone();
    let mut seen: HashSet<ManagedObjectRef> = name_targets.iter().cloned().collect();
    for ds in vms.iter().filter_map(|d| d.datastore.as_ref()) {
        if seen.insert(ds.clone()) {
            name_targets.push(ds.clone());
        }
    }

    let name_contents = session
        .retrieve_properties(&name_targets, &["name"])
        .await
        .context("retrieving object names")?;
    let mut names: HashMap<ManagedObjectRef, String> = HashMap::new();
    for content in name_contents {
        if let Some(name) = content.get::<String>("name")? {
            names.insert(content.obj, name);
        }
    }

    let mut contexts = HashMap::new();
    for host in &parts.hosts {
        let display_name = names.get(host).cloned().unwrap_or_default();
        contexts.insert(
            host.clone(),
            EntityContext {
                display_name,
                ..Default::default()
            },
        );
    }
    for details in vms {
        let datastore = details
            .datastore
            .as_ref()
            .and_then(|ds| names.get(ds).cloned())
            .or(details.path_datastore);

        let ctx = EntityContext {
            display_name: names.get(&details.vm).cloned().unwrap_or_default(),
            cluster: vm_to_cluster.get(&details.vm).cloned(),
            host: details.host.and_then(|h| host_names.get(&h).cloned()),
            datastore,
        };
        contexts.insert(details.vm, ctx);
    }
    debug!(contexts = ?contexts, "built entity contexts");

    Ok(Inventory {
        refs: parts.scored,
        names,
        contexts,
        extra_fields,
    })
}

async fn datacenter_view<S: Session>(
    session: &S,
    datacenter: &ManagedObjectRef,
    types: &[String],
) -> Result<Vec<ManagedObjectRef>> {
    let view = session
        .create_container_view(datacenter, types, true)
        .await
        .context("creating container view")?;

    let content = session
        .retrieve_one(&view, &["view"])
        .await
        .context("reading container view")?;

    Ok(content.get("view")?.unwrap_or_default())
}

fn vm_details(content: &ObjectContent) -> Result<VmDetails> {
    let datastores: Vec<ManagedObjectRef> = content.get("datastore")?.unwrap_or_default();
    let path: Option<String> = content.get("summary.config.vmPathName")?;

    Ok(VmDetails {
        vm: content.obj.clone(),
        host: content.get("summary.runtime.host")?,
        datastore: datastores.into_iter().next(),
        path_datastore: path.as_deref().and_then(datastore_from_path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(kind: &str, value: &str) -> ManagedObjectRef {
        ManagedObjectRef::new(kind, value)
    }

    #[test]
    fn test_partition() {
        let parts = partition(vec![
            r(HOST_SYSTEM, "host-1"),
            r(VIRTUAL_MACHINE, "vm-1"),
            r(CLUSTER_COMPUTE_RESOURCE, "domain-c7"),
            r("ResourcePool", "resgroup-1"),
            r(VIRTUAL_MACHINE, "vm-2"),
            r(VIRTUAL_MACHINE, "vm-1"),
        ]);

        assert_eq!(parts.vms, vec![r(VIRTUAL_MACHINE, "vm-1"), r(VIRTUAL_MACHINE, "vm-2")]);
        assert_eq!(parts.hosts, vec![r(HOST_SYSTEM, "host-1")]);
        assert_eq!(parts.clusters, vec![r(CLUSTER_COMPUTE_RESOURCE, "domain-c7")]);
        assert_eq!(
            parts.scored,
            vec![
                r(HOST_SYSTEM, "host-1"),
                r(VIRTUAL_MACHINE, "vm-1"),
                r(VIRTUAL_MACHINE, "vm-2"),
            ]
        );
    }

    #[test]
    fn test_object_types_adds_clusters_once() {
        assert_eq!(
            object_types(&MetricGroups::default()),
            vec![CLUSTER_COMPUTE_RESOURCE.to_string()]
        );
    }

    #[test]
    fn test_datastore_from_path() {
        assert_eq!(
            datastore_from_path("[ds-gold-01] web01/web01.vmx").as_deref(),
            Some("ds-gold-01")
        );
        assert_eq!(datastore_from_path("[a] [b] x.vmx").as_deref(), Some("a"));
        assert_eq!(datastore_from_path("[] x.vmx"), None);
        assert_eq!(datastore_from_path("no brackets"), None);
        assert_eq!(datastore_from_path("[unterminated"), None);
    }

    #[test]
    fn test_context_tags_omit_absent() {
        let ctx = EntityContext {
            display_name: "web01".into(),
            cluster: None,
            host: Some("esx01".into()),
            datastore: Some(String::new()),
        };
        let tags: Vec<_> = ctx.tags().collect();
        assert_eq!(tags, vec![("esx", "esx01")]);
    }

    #[test]
    fn test_inventory_lookups_for_unknown_entity() {
        let inv = Inventory::default();
        let unknown = r(VIRTUAL_MACHINE, "vm-404");
        assert_eq!(inv.display_name(&unknown), "");
        assert!(inv.context(&unknown).is_none());
        assert!(inv.extra_fields(&unknown).is_none());
    }
}
