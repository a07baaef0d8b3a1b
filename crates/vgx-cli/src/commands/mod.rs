pub mod context;
pub mod ops;

use serde_json::Value;
use vgx_core::AdminConfig;
use vgx_remote::{Connector, HttpConnector};

use crate::Cli;
use context::Context;

pub async fn run(cli: &Cli) -> anyhow::Result<Value> {
    let config = context::load_config(cli)?;
    let connector = HttpConnector::new(&config.remote);
    run_with(cli, &connector, &config).await
}

/// Run the command line against `connector`. With a target and no
/// options, report a summary of that node.
pub async fn run_with(cli: &Cli, connector: &dyn Connector, config: &AdminConfig) -> anyhow::Result<Value> {
    let ctx = Context::load(cli, connector, config).await?;
    let results = ops::execute(cli, &ctx).await?;
    if results.handled == 0 {
        return ops::summary(&ctx).await;
    }
    Ok(Value::Array(results.items))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;
    use vgx_core::AdminError;
    use vgx_testkit::{FakeCluster, fast_config, init_test_logging, sample_descriptor};

    use super::*;

    fn fake() -> (FakeCluster, NamedTempFile) {
        init_test_logging();
        let descriptor = sample_descriptor();
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", descriptor.to_value()).unwrap();
        (FakeCluster::from_descriptor(&descriptor, fast_config()), file)
    }

    async fn run_fake(fake: &FakeCluster, cli: Cli) -> anyhow::Result<Value> {
        run_with(&cli, fake, fake.config()).await
    }

    #[tokio::test]
    async fn pattern_runs_on_every_match() {
        let (fake, file) = fake();
        let cli = Cli {
            cf: Some(file.path().to_path_buf()),
            pausein: Some("S*".into()),
            ..Default::default()
        };

        let out = run_fake(&fake, cli).await.unwrap();

        let items = out.as_array().unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i["instance"].as_str().unwrap()).collect();
        assert_eq!(ids, ["S1", "S2", "S3"]);
        assert!(items.iter().all(|i| i["result"]["action"] == "suspended"));
        assert!(fake.node("S2").tx_in_halted);
        assert!(!fake.node("T1").tx_in_halted);
    }

    #[tokio::test]
    async fn bare_option_targets_the_named_instance() {
        let (fake, file) = fake();
        fake.update("S2", |n| n.service_in = true);
        fake.update("S3", |n| n.service_in = true);
        let cli = Cli {
            target: Some("S2".into()),
            cf: Some(file.path().to_path_buf()),
            serviceout: Some(".".into()),
            ..Default::default()
        };

        run_fake(&fake, cli).await.unwrap();

        assert!(!fake.node("S2").service_in);
        assert!(fake.node("S3").service_in);
    }

    #[tokio::test]
    async fn address_without_options_prints_a_summary() {
        let (fake, _file) = fake();
        let cli = Cli {
            target: Some("h3:9001".into()),
            ..Default::default()
        };

        let out = run_fake(&fake, cli).await.unwrap();

        assert_eq!(out["system"], "testkit");
        assert_eq!(out["address"], "h3:9001");
        assert!(out["nodestat"].is_object());
    }

    #[tokio::test]
    async fn unreachable_address_is_an_address_error() {
        let (fake, _file) = fake();
        fake.set_unreachable("S1");
        let cli = Cli {
            target: Some("h3:9001".into()),
            status: Some(".".into()),
            ..Default::default()
        };

        let err = run_fake(&fake, cli).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<AdminError>(), Some(AdminError::Address(_))), "{err}");
    }

    #[tokio::test]
    async fn confirmed_stop_shuts_instances_down() {
        let (fake, file) = fake();
        let cli = Cli {
            cf: Some(file.path().to_path_buf()),
            stop: Some("S1,S3".into()),
            confirm: true,
            ..Default::default()
        };

        let out = run_fake(&fake, cli).await.unwrap();

        assert_eq!(out.as_array().unwrap().len(), 2);
        assert!(!fake.node("S1").reachable);
        assert!(fake.node("S2").reachable);
        assert!(!fake.node("S3").reachable);
    }

    #[tokio::test]
    async fn missing_descriptor_is_invalid_usage() {
        let (fake, _file) = fake();
        let cli = Cli {
            target: Some("S1".into()),
            status: Some(".".into()),
            ..Default::default()
        };

        let err = run_fake(&fake, cli).await.unwrap_err();
        assert_eq!(err.downcast_ref::<AdminError>().map(AdminError::kind), Some("InvalidUsage"));
    }

    #[tokio::test]
    async fn endpoint_needs_an_address() {
        let (fake, file) = fake();
        let cli = Cli {
            cf: Some(file.path().to_path_buf()),
            endpoint: Some("/vgx/ping".into()),
            ..Default::default()
        };

        assert!(run_fake(&fake, cli).await.is_err());
    }

    #[tokio::test]
    async fn force_copy_reports_both_ends() {
        let (fake, file) = fake();
        let cli = Cli {
            cf: Some(file.path().to_path_buf()),
            forcecopy: Some("T1,S3".into()),
            ..Default::default()
        };

        let out = run_fake(&fake, cli).await.unwrap();

        assert_eq!(out[0]["source"], "T1");
        assert_eq!(out[0]["destination"], "S3");
        assert_eq!(out[0]["result"]["action"], "sync");
    }

    #[test]
    fn config_file_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[remote]\nretry = 5").unwrap();
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let config = context::load_config(&cli).unwrap();
        assert_eq!(config.remote.retry, 5);
        assert_eq!(config.sync, AdminConfig::default().sync);
    }
}
