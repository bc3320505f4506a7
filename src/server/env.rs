//! Process-wide server environment
//!
//! Created once at startup from the validated config, shared by every
//! tunnel, destroyed on process exit. Holds the cipher environment, the
//! protocol-global counters and the live tunnel registry.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::Config;
use crate::crypto::{CipherEnv, CipherMethod};
use crate::plugin::ProtocolGlobal;
use crate::tunnel::registry::TunnelRegistry;

pub struct ServerEnv {
    pub config: Arc<Config>,
    pub cipher: CipherEnv,
    /// Shared client id / connection id state, mutated only at tunnel setup.
    pub protocol_global: Arc<Mutex<ProtocolGlobal>>,
    pub registry: TunnelRegistry,
}

impl ServerEnv {
    pub fn new(config: Arc<Config>) -> Result<Arc<Self>> {
        config.validate()?;
        let method = CipherMethod::parse(&config.server.method)
            .ok_or_else(|| anyhow::anyhow!("Unknown cipher method: {}", config.server.method))?;
        let cipher = CipherEnv::new(method, &config.server.password);

        Ok(Arc::new(Self {
            config,
            cipher,
            protocol_global: Arc::new(Mutex::new(ProtocolGlobal::new())),
            registry: TunnelRegistry::new(),
        }))
    }
}
