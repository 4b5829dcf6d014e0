//! Command-line arguments and configuration resolution

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use kf_core::config::{self, ForwardConfig};
use kf_core::types::PortMapping;
use kf_core::{ForwardSpec, Target};

#[derive(Parser, Debug)]
#[command(name = "kube-forward")]
#[command(author, version, about = "Forward a local port to a port of a remote pod or service")]
pub struct Cli {
    /// What to forward to: NAME, pod/NAME or svc/NAME
    pub target: String,

    /// Port mapping: LOCAL:REMOTE, :REMOTE (ephemeral local port) or PORT
    pub ports: PortMapping,

    /// Namespace of the target (overrides config)
    #[arg(short, long, env = "KF_NAMESPACE")]
    pub namespace: Option<String>,

    /// Local address to listen on; repeat to bind several
    #[arg(long = "address")]
    pub addresses: Vec<IpAddr>,

    /// API server URL (overrides config)
    #[arg(long, env = "KF_SERVER")]
    pub server: Option<String>,

    /// Bearer token (overrides config)
    #[arg(long, env = "KF_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure_skip_tls_verify: bool,

    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Load the configuration file and apply command-line overrides
    pub fn resolve_config(&self) -> Result<ForwardConfig> {
        let mut config = if let Some(path) = &self.config {
            config::load_config(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?
        } else {
            let default_path = config::default_config_path();
            if default_path.exists() {
                config::load_config(&default_path).unwrap_or_else(|e| {
                    tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                    ForwardConfig::default()
                })
            } else {
                tracing::debug!("Using default configuration");
                ForwardConfig::default()
            }
        };

        if let Some(namespace) = &self.namespace {
            config.api.namespace = namespace.clone();
        }
        if let Some(server) = &self.server {
            config.api.server = server.clone();
        }
        if let Some(token) = &self.token {
            config.api.token = Some(token.clone());
        }
        if self.insecure_skip_tls_verify {
            config.api.insecure_skip_tls_verify = true;
        }
        if !self.addresses.is_empty() {
            config.tunnel.bind_addresses = self.addresses.clone();
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Forward request described by the arguments
    pub fn forward_spec(&self, config: &ForwardConfig) -> Result<ForwardSpec> {
        let target = parse_target(&config.api.namespace, &self.target)?;
        Ok(ForwardSpec::new(target, self.ports.remote)
            .with_local_port(self.ports.local)
            .with_addresses(config.tunnel.bind_addresses.clone()))
    }
}

/// Parse `NAME`, `pod/NAME` or `svc/NAME` (and their long forms)
pub fn parse_target(namespace: &str, raw: &str) -> Result<Target> {
    let (service, name) = match raw.split_once('/') {
        None => (false, raw),
        Some(("pod" | "pods" | "po", name)) => (false, name),
        Some(("svc" | "service" | "services", name)) => (true, name),
        Some((resource, _)) => bail!(
            "Unsupported resource type '{}', only pods and services can be forwarded",
            resource
        ),
    };

    if name.is_empty() || name.contains('/') {
        bail!("Invalid resource name '{}'", raw);
    }

    Ok(if service {
        Target::service(namespace, name)
    } else {
        Target::pod(namespace, name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("kube-forward").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_minimal() {
        let cli = parse(&["web", "8080:80"]);
        assert_eq!(cli.target, "web");
        assert_eq!(cli.ports, PortMapping { local: 8080, remote: 80 });
        assert_eq!(cli.log_level, "info");
        assert!(cli.addresses.is_empty());
    }

    #[test]
    fn test_invalid_port_mapping_is_rejected() {
        assert!(Cli::try_parse_from(["kube-forward", "web", "80:http"]).is_err());
        assert!(Cli::try_parse_from(["kube-forward", "web", "8080:0"]).is_err());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[api]\nnamespace = \"from-file\"\nserver = \"https://file:6443\"\n",
        )
        .unwrap();

        let cli = parse(&[
            "pod/web",
            ":5432",
            "--config",
            path.to_str().unwrap(),
            "--namespace",
            "db",
            "--address",
            "127.0.0.1",
            "--address",
            "::1",
        ]);
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.api.namespace, "db");
        assert_eq!(config.api.server, "https://file:6443");
        assert_eq!(config.tunnel.bind_addresses.len(), 2);

        let spec = cli.forward_spec(&config).unwrap();
        assert_eq!(spec.target(), &Target::pod("db", "web"));
        assert_eq!(spec.remote_port(), 5432);
        assert_eq!(spec.local_port(), 0);
        assert_eq!(spec.addresses().len(), 2);
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let cli = parse(&["web", "80", "--config", "/nonexistent/kube-forward.toml"]);
        assert!(cli.resolve_config().is_err());
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("ns", "web").unwrap(), Target::pod("ns", "web"));
        assert_eq!(parse_target("ns", "pods/web").unwrap(), Target::pod("ns", "web"));
        assert_eq!(parse_target("ns", "svc/web").unwrap(), Target::service("ns", "web"));
        assert_eq!(parse_target("ns", "services/web").unwrap(), Target::service("ns", "web"));
        assert!(parse_target("ns", "deploy/web").is_err());
        assert!(parse_target("ns", "svc/").is_err());
        assert!(parse_target("ns", "pod/").is_err());
        assert!(parse_target("ns", "pod/a/b").is_err());
    }
}
