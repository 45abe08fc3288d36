//! CLI arguments and cluster-credential resolution.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "klens-server", version, about = "Read-only Kubernetes resource browser")]
pub struct Args {
    /// Path to a kubeconfig file; when omitted, in-cluster config,
    /// $KUBECONFIG and the conventional paths are tried in that order
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Listen port
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Verbose logging
    #[arg(long)]
    pub debug: bool,
}

pub async fn build_client(explicit: Option<&Path>) -> anyhow::Result<Client> {
    let config = resolve_config(explicit).await?;
    Client::try_from(config).context("building kubernetes client")
}

/// First parseable credential bundle wins: explicit flag, in-cluster service
/// account, `KUBECONFIG`, then the conventional file paths.
async fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<kube::Config> {
    if let Some(path) = explicit {
        return config_from_file(path)
            .await
            .with_context(|| format!("reading kubeconfig {}", path.display()));
    }

    if let Ok(config) = kube::Config::incluster() {
        info!("using in-cluster configuration");
        return Ok(config);
    }

    if let Ok(env_path) = std::env::var("KUBECONFIG") {
        if let Ok(config) = config_from_file(Path::new(&env_path)).await {
            info!(path = %env_path, "using kubeconfig from KUBECONFIG");
            return Ok(config);
        }
    }

    for path in candidate_paths(dirs::home_dir()) {
        if !path.exists() {
            continue;
        }
        if let Ok(config) = config_from_file(&path).await {
            info!(path = %path.display(), "using kubeconfig");
            return Ok(config);
        }
    }

    anyhow::bail!("no usable kubeconfig found")
}

fn candidate_paths(home: Option<PathBuf>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = home {
        paths.push(home.join(".kube").join("config"));
    }
    let root = PathBuf::from("/root/.kube/config");
    if !paths.contains(&root) {
        paths.push(root);
    }
    paths
}

async fn config_from_file(path: &Path) -> anyhow::Result<kube::Config> {
    let kubeconfig = Kubeconfig::read_from(path)?;
    let config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_config_is_tried_before_root() {
        let paths = candidate_paths(Some(PathBuf::from("/home/dev")));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/home/dev/.kube/config"),
                PathBuf::from("/root/.kube/config"),
            ]
        );
    }

    #[test]
    fn root_home_does_not_duplicate() {
        let paths = candidate_paths(Some(PathBuf::from("/root")));
        assert_eq!(paths, vec![PathBuf::from("/root/.kube/config")]);
    }

    #[test]
    fn missing_home_still_has_a_fallback() {
        assert_eq!(
            candidate_paths(None),
            vec![PathBuf::from("/root/.kube/config")]
        );
    }
}
