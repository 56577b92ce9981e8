pub mod install;
pub mod make;
pub mod sync;
pub mod task;

use crate::Context;
use crate::config::{ForgeConfig, ServerConfig};
use anyhow::Result;
use reconcile::HttpBackend;

/// Configuration, selected server and an API backend for it.
pub struct Session {
    pub config: ForgeConfig,
    pub server_name: String,
    pub backend: HttpBackend,
}

impl Session {
    pub fn open(ctx: &Context) -> Result<Self> {
        let config = ctx.load_config()?;
        let (name, server) = config.server(ctx.server.as_deref())?;
        log::info!("Using server {name} ({})", server.url());
        let backend = HttpBackend::new(&server.connection());
        let server_name = name.to_string();
        Ok(Self {
            config,
            server_name,
            backend,
        })
    }

    pub fn server(&self) -> &ServerConfig {
        &self.config.servers[&self.server_name]
    }
}
