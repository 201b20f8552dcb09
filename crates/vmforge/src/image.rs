//! Image definition tree: parsing, inheritance resolution, validation.
//!
//! A definition file describes one root image and, inline, any number of
//! forked child images. Resolution turns the raw JSON shape into a tree of
//! fully populated [`Image`] nodes. Inheritance is whole-structure override:
//! a node that sets `paths` (or `auth`) at all replaces the entire structure
//! it inherited; there is never a field-by-field merge across sources. The
//! cascade runs global config → root → child → grandchild, each level
//! inheriting from its parent's *resolved* values.
//!
//! The tree is built synchronously at load time and never mutated after.

use std::collections::HashMap;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::config::{load_json_file, Auth, GlobalConfig, ToolPaths};
use crate::errors::Error;

/// Default creation size for freshly allocated disks, in gigabytes.
pub const DEFAULT_INIT_SIZE_GB: u32 = 1;

/// Default emulator RAM allocation, in gigabytes.
pub const DEFAULT_MEMORY_GB: u32 = 2;

/// Default retry budget for `retry`-policy provisioning commands.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Transport protocol of a forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// String form used in emulator `hostfwd` clauses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One host-to-guest port forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    pub host_port: u16,
    pub vm_port: u16,
    #[serde(rename = "type", alias = "protocol")]
    pub protocol: Protocol,
}

/// What to do when a provisioning command exits non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log and continue with the next command.
    #[default]
    Warn,
    /// Stop the remaining commands for this node.
    Abort,
    /// Re-issue up to `maxRetries` times, then abort.
    Retry,
}

/// One post-boot provisioning step, run verbatim over the shell session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionCommand {
    /// Shell text executed on the guest, verbatim.
    pub data: String,
    #[serde(default)]
    pub failure: FailurePolicy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Unresolved JSON shape of one definition node, exactly as written in the
/// definition file. `id` is the only required field; everything else either
/// inherits or defaults during resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageJson {
    pub id: String,
    #[serde(default)]
    pub global_accessable_id: Option<String>,
    #[serde(default)]
    pub paths: Option<ToolPaths>,
    #[serde(default)]
    pub auth: Option<Auth>,
    #[serde(default)]
    pub iso: Option<Utf8PathBuf>,
    #[serde(default)]
    pub kvm: Option<bool>,
    #[serde(default)]
    pub port_forward: Vec<PortForward>,
    #[serde(default, rename = "initSizeGB")]
    pub init_size_gb: Option<u32>,
    #[serde(default, rename = "memoryGB")]
    pub memory_gb: Option<u32>,
    #[serde(default)]
    pub commands: Vec<ProvisionCommand>,
    #[serde(default)]
    pub children: Vec<ImageJson>,
}

/// A resolved image definition node. Inheritable fields are fully populated;
/// `children` are owned and resolved against this node's values.
#[derive(Debug, Clone)]
pub struct Image {
    pub id: String,
    /// Ancestor ids ending with this node's own id, e.g. `["base", "web"]`.
    pub id_path: Vec<String>,
    pub global_accessable_id: Option<String>,
    pub paths: ToolPaths,
    pub auth: Auth,
    /// Install medium. Only meaningful for nodes intended to be freshly
    /// installed; never inherited.
    pub iso: Option<Utf8PathBuf>,
    pub kvm: bool,
    pub port_forward: Vec<PortForward>,
    pub init_size_gb: u32,
    pub memory_gb: u32,
    pub commands: Vec<ProvisionCommand>,
    pub children: Vec<Image>,
}

/// Snapshot of the inheritable values a node resolves against: the global
/// configuration for the root, the parent's resolved values below it.
struct Inherited<'a> {
    paths: &'a ToolPaths,
    auth: &'a Auth,
    kvm: bool,
    init_size_gb: u32,
    memory_gb: u32,
}

impl<'a> Inherited<'a> {
    fn from_global(global: &'a GlobalConfig) -> Self {
        Inherited {
            paths: &global.paths,
            auth: &global.auth,
            kvm: false,
            init_size_gb: DEFAULT_INIT_SIZE_GB,
            memory_gb: DEFAULT_MEMORY_GB,
        }
    }

    fn from_parent(parent: &'a Image) -> Self {
        Inherited {
            paths: &parent.paths,
            auth: &parent.auth,
            kvm: parent.kvm,
            init_size_gb: parent.init_size_gb,
            memory_gb: parent.memory_gb,
        }
    }
}

impl Image {
    /// Load a definition file and resolve it against the global
    /// configuration. Either the whole tree resolves and validates, or the
    /// load fails; no partial tree is ever returned.
    pub fn load(path: &Utf8Path, global: &GlobalConfig) -> Result<Image, Error> {
        let json: ImageJson = load_json_file(path)?;
        Image::from_json(json, global)
    }

    /// Resolve an already-parsed definition against the global
    /// configuration and validate tree-wide invariants.
    pub fn from_json(json: ImageJson, global: &GlobalConfig) -> Result<Image, Error> {
        let root = Image::resolve(json, &Inherited::from_global(global), &[]);
        validate_tree(&root)?;
        Ok(root)
    }

    fn resolve(json: ImageJson, inherit: &Inherited<'_>, ancestors: &[String]) -> Image {
        let mut id_path = ancestors.to_vec();
        id_path.push(json.id.clone());

        let mut node = Image {
            id: json.id,
            id_path,
            global_accessable_id: json.global_accessable_id,
            paths: json.paths.unwrap_or_else(|| inherit.paths.clone()),
            auth: json.auth.unwrap_or_else(|| inherit.auth.clone()),
            iso: json.iso,
            kvm: json.kvm.unwrap_or(inherit.kvm),
            port_forward: json.port_forward,
            init_size_gb: json.init_size_gb.unwrap_or(inherit.init_size_gb),
            memory_gb: json.memory_gb.unwrap_or(inherit.memory_gb),
            commands: json.commands,
            children: Vec::new(),
        };

        let children: Vec<Image> = json
            .children
            .into_iter()
            .map(|child| Image::resolve(child, &Inherited::from_parent(&node), &node.id_path))
            .collect();
        node.children = children;

        node
    }

    /// Slash-separated ancestor path, e.g. `base/web`.
    pub fn display_path(&self) -> String {
        self.id_path.join("/")
    }

    /// Disk filename derived from the leaf id. Uniqueness across the whole
    /// tree is enforced at load time.
    pub fn disk_file_name(&self) -> String {
        format!("{}.qcow", self.id)
    }

    /// Host port of the first tcp rule forwarding to guest port 22, the
    /// port provisioning sessions connect through.
    pub fn ssh_host_port(&self) -> Option<u16> {
        self.port_forward
            .iter()
            .find(|rule| rule.protocol == Protocol::Tcp && rule.vm_port == 22)
            .map(|rule| rule.host_port)
    }

    /// Direct child with the given id.
    pub fn child(&self, id: &str) -> Option<&Image> {
        self.children.iter().find(|child| child.id == id)
    }

    /// Look a node up by selector: a `globalAccessableId` alias anywhere in
    /// the tree, or a slash-separated id path starting at this node.
    pub fn find(&self, selector: &str) -> Option<&Image> {
        self.find_by_alias(selector)
            .or_else(|| self.find_by_id_path(selector))
    }

    /// Look a node up by its `globalAccessableId` alias.
    pub fn find_by_alias(&self, alias: &str) -> Option<&Image> {
        let mut found = None;
        self.walk(&mut |node| {
            if found.is_none() && node.global_accessable_id.as_deref() == Some(alias) {
                found = Some(node);
            }
        });
        found
    }

    /// Look a node up by slash-separated id path, e.g. `base/web/db`.
    pub fn find_by_id_path(&self, path: &str) -> Option<&Image> {
        let mut segments = path.split('/');
        if segments.next() != Some(self.id.as_str()) {
            return None;
        }
        let mut node = self;
        for segment in segments {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Depth-first traversal over this node and all descendants.
    fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Image)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// Tree-wide invariants checked once after resolution: derived disk
/// filenames must not collide, and aliases must be unique.
fn validate_tree(root: &Image) -> Result<(), Error> {
    let mut disk_files: HashMap<String, String> = HashMap::new();
    let mut aliases: HashMap<String, String> = HashMap::new();
    let mut problem = None;

    root.walk(&mut |node| {
        if problem.is_some() {
            return;
        }
        if let Some(previous) = disk_files.insert(node.disk_file_name(), node.display_path()) {
            problem = Some(Error::Validation(format!(
                "images '{}' and '{}' both resolve to disk file '{}'",
                previous,
                node.display_path(),
                node.disk_file_name(),
            )));
            return;
        }
        if let Some(alias) = &node.global_accessable_id {
            if let Some(previous) = aliases.insert(alias.clone(), node.display_path()) {
                problem = Some(Error::Validation(format!(
                    "images '{}' and '{}' share globalAccessableId '{}'",
                    previous,
                    node.display_path(),
                    alias,
                )));
            }
        }
    });

    match problem {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
