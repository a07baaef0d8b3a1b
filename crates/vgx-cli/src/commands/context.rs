use anyhow::Context as _;
use tracing::debug;

use vgx_core::{AdminConfig, AdminError, TopologyDescriptor, split_address};
use vgx_instance::Cluster;
use vgx_remote::{Connector, RemoteNodeClient};

use crate::Cli;

/// Everything an operator command needs: the cluster and, when the
/// command line named one instance, a client for that node.
pub struct Context {
    pub cluster: Cluster,
    pub remote: Option<RemoteNodeClient>,
    pub confirmed: bool,
}

/// `host:port` rather than an instance id.
pub fn is_address(target: &str) -> bool {
    target
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}

pub fn load_config(cli: &Cli) -> anyhow::Result<AdminConfig> {
    match &cli.config {
        Some(path) => AdminConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(AdminConfig::default()),
    }
}

impl Context {
    /// Resolve the descriptor: fetched from the target node when it is an
    /// address, otherwise read from `--cf` with the target id as `.`.
    pub async fn load(cli: &Cli, connector: &dyn Connector, config: &AdminConfig) -> anyhow::Result<Self> {
        let (cluster, remote) = match cli.target.as_deref() {
            Some(address) if is_address(address) => {
                let cluster = Cluster::from_remote(address, connector, config)
                    .await
                    .map_err(|e| AdminError::Address(format!("{address} -> {e}")))?;
                let (host, port) = split_address(address)?;
                let remote = RemoteNodeClient::new(address, connector.transport(&host, port), config.remote.clone());
                (cluster, Some(remote))
            }
            target => {
                let Some(path) = &cli.cf else {
                    return Err(AdminError::invalid_usage("no descriptor: give <address> or --cf <file>").into());
                };
                let mut descriptor = TopologyDescriptor::from_file(path)?;
                let mut remote = None;
                if let Some(id) = target {
                    let instance = descriptor.get(id)?.clone();
                    let address = instance.admin_address();
                    remote = Some(RemoteNodeClient::new(
                        address,
                        connector.transport(&instance.host, instance.aport()),
                        config.remote.clone(),
                    ));
                    descriptor = descriptor.with_origin(instance.host.clone(), instance.aport());
                }
                debug!(path = %path.display(), system = descriptor.name(), "loaded descriptor file");
                (Cluster::connect(descriptor, connector, config), remote)
            }
        };
        Ok(Self {
            cluster,
            remote,
            confirmed: cli.confirm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_told_from_ids() {
        assert!(is_address("host3:9001"));
        assert!(is_address("10.0.0.1:9001"));
        assert!(!is_address("S1"));
        assert!(!is_address(":9001"));
        assert!(!is_address("host:port"));
    }
}
