//! Passthru vbdev module
//!
//! Forwards every request unchanged to its base bdev. The module keeps a
//! list of (base, passthru) name pairs; a passthru bdev is built as soon as
//! both the pair is configured and its base is registered, in either order.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::bdev::{bdev_unregister, get_bdev_by_name, Bdev, BdevModule, BdevUnregisterFn};
use crate::error::{BdevError, Result};
use crate::vbdev::{IoTransform, VbdevNode};

pub const PASSTHRU_MODULE: &str = "passthru";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassthruConfig {
    pub base_bdev_name: String,
    pub passthru_bdev_name: String,
}

/// The passthru transform: no change in either direction
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthru;

impl IoTransform for Passthru {
    fn module_name(&self) -> &'static str {
        PASSTHRU_MODULE
    }

    fn product_name(&self) -> &'static str {
        "passthru"
    }

    fn dump_info_json(&self, name: &str, base: &str) -> Option<Value> {
        Some(json!({
            "passthru": {
                "pt_bdev_name": name,
                "base_bdev_name": base,
            }
        }))
    }

    fn write_config_json(&self, name: &str, base: &str) -> Option<Value> {
        Some(json!({
            "method": "construct_passthru_bdev",
            "params": {
                "base_bdev_name": base,
                "passthru_bdev_name": name,
            }
        }))
    }
}

#[derive(Default)]
pub struct PassthruModule {
    names: Mutex<Vec<PassthruConfig>>,
}

impl PassthruModule {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Module preloaded with name pairs, e.g. from a config file
    pub fn with_config(configs: Vec<PassthruConfig>) -> Result<Arc<Self>> {
        let module = Self::new();
        for cfg in configs {
            module.insert_name(cfg)?;
        }
        Ok(module)
    }

    /// Parse a JSON array of `{base_bdev_name, passthru_bdev_name}` pairs
    pub fn from_json(json: &str) -> Result<Arc<Self>> {
        let configs: Vec<PassthruConfig> =
            serde_json::from_str(json).map_err(|e| BdevError::Config(e.to_string()))?;
        Self::with_config(configs)
    }

    /// Configured name pairs
    pub fn configs(&self) -> Vec<PassthruConfig> {
        self.names.lock().clone()
    }

    fn insert_name(&self, cfg: PassthruConfig) -> Result<()> {
        if cfg.base_bdev_name.is_empty() || cfg.passthru_bdev_name.is_empty() {
            return Err(BdevError::Config("passthru names must not be empty".into()));
        }
        let mut names = self.names.lock();
        if names
            .iter()
            .any(|n| n.passthru_bdev_name == cfg.passthru_bdev_name)
        {
            return Err(BdevError::AlreadyExists(cfg.passthru_bdev_name));
        }
        names.push(cfg);
        Ok(())
    }

    /// Configure a passthru bdev named `vbdev_name` on `base_name`.
    ///
    /// Builds it right away when the base exists, otherwise when the base
    /// gets registered. A build that fails now removes the pair again.
    pub fn create_passthru_disk(&self, base_name: &str, vbdev_name: &str) -> Result<()> {
        self.insert_name(PassthruConfig {
            base_bdev_name: base_name.to_string(),
            passthru_bdev_name: vbdev_name.to_string(),
        })?;

        let Some(base) = get_bdev_by_name(base_name) else {
            debug!(base = %base_name, vbdev = %vbdev_name, "passthru waiting for base bdev");
            return Ok(());
        };
        match VbdevNode::create(Passthru, base.name(), vbdev_name) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.remove_name(vbdev_name);
                Err(err)
            }
        }
    }

    /// Remove the passthru bdev `vbdev_name` and forget its pair, so it is
    /// not rebuilt when the base comes back
    pub fn delete_passthru_disk(&self, vbdev_name: &str, cb: Option<BdevUnregisterFn>) -> Result<()> {
        let bdev = get_bdev_by_name(vbdev_name)
            .filter(|b| b.module_name() == PASSTHRU_MODULE)
            .ok_or_else(|| BdevError::NotFound(vbdev_name.to_string()))?;
        self.remove_name(vbdev_name);
        info!(vbdev = %vbdev_name, "deleting passthru bdev");
        bdev_unregister(&bdev, cb)
    }

    fn remove_name(&self, vbdev_name: &str) {
        self.names
            .lock()
            .retain(|n| n.passthru_bdev_name != vbdev_name);
    }

    /// Build every configured passthru bdev whose base is `base`
    fn attach(&self, base: &Arc<Bdev>) {
        let pending: Vec<String> = self
            .names
            .lock()
            .iter()
            .filter(|n| n.base_bdev_name == base.name())
            .map(|n| n.passthru_bdev_name.clone())
            .collect();

        for vbdev_name in pending {
            if get_bdev_by_name(&vbdev_name).is_some() {
                continue;
            }
            debug!(base = %base.name(), vbdev = %vbdev_name, "passthru match on base bdev");
            if let Err(err) = VbdevNode::create(Passthru, base.name(), &vbdev_name) {
                error!(base = %base.name(), vbdev = %vbdev_name, error = %err, "passthru create failed");
            }
        }
    }
}

impl BdevModule for PassthruModule {
    fn name(&self) -> &'static str {
        PASSTHRU_MODULE
    }

    fn examine(&self, bdev: &Arc<Bdev>) {
        self.attach(bdev);
    }

    fn fini(&self) {
        self.names.lock().clear();
    }
}
