use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;

/// Server settings, read from `WORKIT_*` environment variables.
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("WORKIT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = std::env::var("WORKIT_PORT")
            .unwrap_or_else(|_| "5001".into())
            .parse()
            .context("WORKIT_PORT must be a port number")?;
        let addr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let db_path = std::env::var("WORKIT_DB_PATH").unwrap_or_else(|_| "workit.db".into());
        let upload_dir = std::env::var("WORKIT_UPLOAD_DIR").unwrap_or_else(|_| "./uploads".into());

        Ok(Self {
            addr,
            db_path: PathBuf::from(db_path),
            upload_dir: PathBuf::from(upload_dir),
        })
    }
}
