use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub rules: Rules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rules {
    /// Directory holding the `.kdl` rule files. Default: rules
    pub dir: PathBuf,
    /// Callers with exactly this role skip every rule
    pub bypass_role: Option<String>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("rules"),
            bypass_role: None,
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)
            .into_diagnostic()?
            .set_default("server.port", Server::default().port)
            .into_diagnostic()?
            .set_default(
                "rules.dir",
                Rules::default().dir.to_string_lossy().to_string(),
            )
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: GATEKEEPER__SERVER__PORT=9090, etc.
        builder =
            builder.add_source(config::Environment::with_prefix("GATEKEEPER").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let mut s: Settings = cfg.try_deserialize().into_diagnostic()?;

        // Normalize rules dir to be relative to current dir
        if s.rules.dir.is_relative() {
            s.rules.dir = std::env::current_dir().into_diagnostic()?.join(&s.rules.dir);
        }

        Ok(s)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
