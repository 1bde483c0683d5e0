use crate::uuid_registry::node_hash;
use crate::NodeId;
use anyhow::{Context, Result};
use log::{info, warn};
use once_cell::sync::OnceCell;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

static GLOBAL_IDENTITY: OnceCell<NodeIdentity> = OnceCell::new();

/// Stable per-host identity, created on first run and persisted for the life
/// of the install.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    id: NodeId,
    name: String,
}

impl NodeIdentity {
    /// The process-wide identity, loaded lazily from the default state file.
    pub fn global() -> &'static NodeIdentity {
        GLOBAL_IDENTITY.get_or_init(|| {
            NodeIdentity::load_or_create(&default_identity_path()).unwrap_or_else(|e| {
                warn!("node identity unavailable on disk ({e}); using ephemeral id");
                NodeIdentity::ephemeral()
            })
        })
    }

    /// Loads the identity from `path`, creating and persisting a fresh one on
    /// first run. A corrupt file is regenerated and rewritten.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => match content.trim().parse::<Uuid>() {
                Ok(uuid) => return Ok(Self::from_id(NodeId(uuid))),
                Err(e) => {
                    warn!("corrupt node-id file {}: {e}; regenerating", path.display());
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("reading node-id file"),
        }

        let identity = Self::ephemeral();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("creating state directory")?;
        }
        fs::write(path, format!("{}\n", identity.id.0)).context("writing node-id file")?;
        info!("created node identity {} ({})", identity.name, identity.id);
        Ok(identity)
    }

    /// A fresh identity that is not persisted anywhere.
    pub fn ephemeral() -> Self {
        Self::from_id(NodeId::new_random())
    }

    fn from_id(id: NodeId) -> Self {
        let name = format!("fabric-{:08x}", node_hash(id));
        Self { id, name }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// `${HOME}/.midi-network/node-id`, falling back to the working directory
/// when HOME is unset.
pub fn default_identity_path() -> PathBuf {
    state_dir().join("node-id")
}

/// `${HOME}/.midi-network`, the node's persistent state directory.
pub fn state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".midi-network")
}
