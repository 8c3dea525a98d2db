//! Cluster-resident records managed or read by the controller.
//!
//! Every record carries an [`ObjectMeta`] with a monotonically increasing
//! resource version used for compare-and-swap updates. Only [`Release`] has a
//! status subresource.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use extmod_reconcile::gate::{APPROVAL_ANNOTATION, UPDATE_POLICY_LABEL};
use extmod_reconcile::{Phase, PolicyMode, ReleaseStatus, Windows};
use semver::Version;
use serde::{Deserialize, Serialize};

/// Label carrying a release's module name.
pub const MODULE_LABEL: &str = "module";

/// Label carrying a release's source name.
pub const SOURCE_LABEL: &str = "source";

/// Label mirroring a release's phase.
pub const STATUS_LABEL: &str = "status";

/// Keeps a release alive until its files are removed from disk.
pub const FS_RELEASE_FINALIZER: &str = "modules.extmod.io/exist-on-fs";

/// Keeps a source alive while one of its releases is deployed.
pub const SOURCE_RELEASE_FINALIZER: &str = "modules.extmod.io/release-exists";

/// Label selecting documentation builder leases.
pub const DOCS_LEASE_LABEL: &str = "extmod.io/documentation-builder-sync";

/// Common object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true if the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }

    /// Set a label. Returns true if the value changed.
    pub fn set_label(&mut self, key: &str, value: &str) -> bool {
        if self.labels.get(key).map(String::as_str) == Some(value) {
            return false;
        }
        self.labels.insert(key.to_string(), value.to_string());
        true
    }
}

/// A kind of record held in the object store.
pub trait Resource: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Kind name, used in logs and errors.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }

    /// Copy the status subresource from `other`. Kinds without a status do nothing.
    fn copy_status_from(&mut self, _other: &Self) {}
}

macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

// =============================================================================
// Release
// =============================================================================

/// One version of one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub metadata: ObjectMeta,
    pub spec: ReleaseSpec,
    #[serde(default)]
    pub status: ReleaseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    pub module_name: String,
    pub version: Version,
    pub weight: u32,
    pub source: String,
}

impl Release {
    /// Build a release named `<module>-v<version>` with the module and source labels set.
    pub fn new(module: &str, version: Version, weight: u32, source: &str) -> Self {
        let mut metadata = ObjectMeta::named(format!("{}-v{}", module, version));
        metadata.set_label(MODULE_LABEL, module);
        metadata.set_label(SOURCE_LABEL, source);

        Self {
            metadata,
            spec: ReleaseSpec {
                module_name: module.to_string(),
                version,
                weight,
                source: source.to_string(),
            },
            status: ReleaseStatus::default(),
        }
    }

    pub fn module(&self) -> &str {
        &self.spec.module_name
    }

    pub fn source(&self) -> &str {
        &self.spec.source
    }

    pub fn phase(&self) -> Option<Phase> {
        self.status.phase
    }

    /// Directory name of this version under the module directory (`v1.2.3`).
    pub fn version_dir(&self) -> String {
        format!("v{}", self.spec.version)
    }

    /// Activation symlink name (`<weight>-<module>`).
    pub fn symlink_name(&self) -> String {
        symlink_name(self.spec.weight, &self.spec.module_name)
    }

    pub fn policy_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .get(UPDATE_POLICY_LABEL)
            .map(String::as_str)
    }

    pub fn approval(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(APPROVAL_ANNOTATION)
            .map(String::as_str)
    }
}

impl Resource for Release {
    const KIND: &'static str = "ModuleRelease";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

/// Activation symlink name for a module at a weight.
pub fn symlink_name(weight: u32, module: &str) -> String {
    format!("{}-{}", weight, module)
}

// =============================================================================
// Module source
// =============================================================================

/// Registry a module's releases come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSource {
    pub metadata: ObjectMeta,
    pub spec: ModuleSourceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSourceSpec {
    pub registry: RegistrySpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockercfg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

impl ModuleSource {
    pub fn new(name: &str, repo: &str) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: ModuleSourceSpec {
                registry: RegistrySpec {
                    repo: repo.to_string(),
                    ..Default::default()
                },
            },
        }
    }
}

impl_resource!(ModuleSource, "ModuleSource");

// =============================================================================
// Update policy
// =============================================================================

/// Governs whether and when pending releases may be promoted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    pub metadata: ObjectMeta,
    pub spec: UpdatePolicySpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePolicySpec {
    pub update: UpdateSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSettings {
    pub mode: PolicyMode,
    #[serde(default)]
    pub windows: Windows,
}

impl UpdatePolicy {
    pub fn new(name: &str, mode: PolicyMode, windows: Windows) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: UpdatePolicySpec {
                update: UpdateSettings { mode, windows },
            },
        }
    }
}

impl_resource!(UpdatePolicy, "ModuleUpdatePolicy");

// =============================================================================
// Pull override
// =============================================================================

/// Pins a module to a development build, suspending its normal lifecycle.
///
/// Named after the module it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullOverride {
    pub metadata: ObjectMeta,
    pub spec: PullOverrideSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullOverrideSpec {
    pub source: String,
    pub image_tag: String,
}

impl PullOverride {
    pub fn new(module: &str, source: &str, image_tag: &str) -> Self {
        let mut metadata = ObjectMeta::named(module);
        metadata.set_label(MODULE_LABEL, module);
        metadata.set_label(SOURCE_LABEL, source);

        Self {
            metadata,
            spec: PullOverrideSpec {
                source: source.to_string(),
                image_tag: image_tag.to_string(),
            },
        }
    }
}

impl_resource!(PullOverride, "ModulePullOverride");

// =============================================================================
// Lease
// =============================================================================

/// Presence record of a documentation builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub metadata: ObjectMeta,
    pub spec: LeaseSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,
}

impl Lease {
    /// Build a documentation builder lease held by `holder`.
    pub fn docs_builder(name: &str, holder: Option<&str>) -> Self {
        let mut metadata = ObjectMeta::named(name);
        metadata.set_label(DOCS_LEASE_LABEL, "");

        Self {
            metadata,
            spec: LeaseSpec {
                holder_identity: holder.map(str::to_string),
            },
        }
    }
}

impl_resource!(Lease, "Lease");

// =============================================================================
// Module definition
// =============================================================================

/// What the loader needs to know about a module version on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub name: String,
    pub weight: u32,
    #[serde(default)]
    pub path: PathBuf,
}
