//! Option handlers. Options run in a fixed order regardless of where they
//! appear on the command line; `--confirm` applies to all of them.

use std::future::Future;
use std::io::{BufRead, Write};
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::info;

use vgx_core::{AdminError, AdminResult, SyncMode};
use vgx_instance::InstanceHandle;
use vgx_sync::{force_copy, reverse_sync, rolling_forward_sync};

use super::context::Context;
use crate::Cli;

/// Split `a,b,c` into at most `N` trimmed fields, padding with `None`.
/// The last field keeps any further commas.
pub fn split_args<const N: usize>(arg: &str) -> [Option<String>; N] {
    let mut fields: [Option<String>; N] = std::array::from_fn(|_| None);
    for (slot, part) in fields.iter_mut().zip(arg.splitn(N, ',')) {
        *slot = Some(part.trim().to_string());
    }
    fields
}

fn required(field: Option<String>, what: &str) -> AdminResult<String> {
    field
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AdminError::invalid_usage(format!("missing {what}")))
}

fn outcome(id: &str, result: AdminResult<Value>) -> Value {
    match result {
        Ok(value) => json!({"instance": id, "result": value}),
        Err(e) => json!({"instance": id, "error": {"kind": e.kind(), "message": e.to_string()}}),
    }
}

/// Collected results of one invocation.
#[derive(Debug, Default)]
pub struct Results {
    pub items: Vec<Value>,
    pub handled: usize,
}

impl Results {
    /// Run `op` concurrently on the running instances matching `pattern`.
    async fn each<F, Fut>(&mut self, ctx: &Context, pattern: &str, op: F) -> anyhow::Result<()>
    where
        F: Fn(Arc<InstanceHandle>) -> Fut,
        Fut: Future<Output = AdminResult<Value>> + Send + 'static,
    {
        self.handled += 1;
        let results = ctx.cluster.concurrent(pattern, op).await?;
        self.items.extend(results.into_iter().map(|(id, r)| outcome(&id, r)));
        Ok(())
    }

    /// Run `op` on the running instances matching `pattern`, one at a
    /// time, stopping at the first failure.
    async fn in_turn<F, Fut>(&mut self, ctx: &Context, pattern: &str, op: F) -> anyhow::Result<()>
    where
        F: Fn(Arc<InstanceHandle>) -> Fut,
        Fut: Future<Output = AdminResult<Value>>,
    {
        self.handled += 1;
        for handle in ctx.cluster.running(pattern).await? {
            let result = op(Arc::clone(&handle)).await?;
            self.items.push(json!({"instance": handle.id(), "result": result}));
        }
        Ok(())
    }

    /// Run `op` on exactly one instance.
    async fn one<F, Fut>(&mut self, ctx: &Context, id: &str, op: F) -> anyhow::Result<()>
    where
        F: FnOnce(Arc<InstanceHandle>) -> Fut,
        Fut: Future<Output = AdminResult<Value>>,
    {
        self.handled += 1;
        let handle = ctx.cluster.get(id)?;
        let result = op(Arc::clone(&handle)).await?;
        self.items.push(json!({"instance": handle.id(), "result": result}));
        Ok(())
    }

    fn push(&mut self, value: Value) {
        self.handled += 1;
        self.items.push(value);
    }
}

/// Ask the operator to confirm a destructive operation on `pattern`.
async fn confirm(ctx: &Context, what: &str, pattern: &str) -> anyhow::Result<bool> {
    if ctx.confirmed {
        return Ok(true);
    }
    let targets: Vec<String> = ctx
        .cluster
        .running(pattern)
        .await?
        .iter()
        .map(|h| h.to_string())
        .collect();
    if targets.is_empty() {
        return Ok(false);
    }
    let prompt = format!("{}\n{what} {} instance(s)? [y/N] ", targets.join("\n"), targets.len());
    let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut stderr = std::io::stderr();
        write!(stderr, "{prompt}")?;
        stderr.flush()?;
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        Ok(answer)
    })
    .await??;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim(), "y" | "Y" | "yes")
}

pub async fn execute(cli: &Cli, ctx: &Context) -> anyhow::Result<Results> {
    let mut out = Results::default();

    if let Some(arg) = &cli.attach {
        let [id, subs] = split_args::<2>(arg);
        let id = required(id, "instance id")?;
        match subs {
            None => {
                out.in_turn(ctx, &id, |h| async move { h.attach(false, None).await.map(Option::unwrap_or_default) })
                    .await?
            }
            Some(subs) => {
                let destinations = subs
                    .split(',')
                    .map(|s| ctx.cluster.get(s.trim()).map(|h| h.instance().admin_address()))
                    .collect::<AdminResult<Vec<_>>>()?;
                out.one(ctx, &id, |h| async move {
                    h.attach(false, Some(destinations)).await.map(Option::unwrap_or_default)
                })
                .await?
            }
        }
    }
    if let Some(id) = &cli.bind {
        out.one(ctx, id, |h| async move { h.bind(None).await }).await?;
    }
    if let Some(arg) = &cli.command {
        let [id, graph, cmd] = split_args::<3>(arg);
        let id = required(id, "instance id")?;
        let graph = required(graph, "graph")?;
        let cmd = required(cmd, "command")?;
        out.each(ctx, &id, |h| {
            let (graph, cmd) = (graph.clone(), cmd.clone());
            async move { h.command(&graph, &cmd).await }
        })
        .await?;
    }
    if let Some(pattern) = &cli.detach {
        out.in_turn(ctx, pattern, |h| async move { h.detach().await }).await?;
    }
    if let Some(pattern) = &cli.restarthttp {
        out.each(ctx, pattern, |h| async move { h.restart_http().await }).await?;
    }
    if let Some(path) = &cli.endpoint {
        let Some(remote) = &ctx.remote else {
            return Err(AdminError::invalid_usage("option --endpoint requires <address>").into());
        };
        out.push(remote.endpoint(path, &[], false).await?);
    }
    if let Some(pattern) = &cli.readonly {
        out.each(ctx, pattern, |h| async move { h.readonly_graph().await }).await?;
    }
    if let Some(pattern) = &cli.writable {
        out.each(ctx, pattern, |h| async move { h.writable_graph().await }).await?;
    }
    if let Some(pattern) = &cli.serviceout {
        out.each(ctx, pattern, |h| async move { h.service_out().await }).await?;
    }
    if let Some(pattern) = &cli.servicein {
        out.each(ctx, pattern, |h| async move { h.service_in().await }).await?;
    }
    if cli.show {
        out.push(ctx.cluster.descriptor().to_value());
    }
    if let Some(id) = &cli.cancelsync {
        out.one(ctx, id, |h| async move { h.cancel_sync().await }).await?;
    }
    if let Some(arg) = &cli.forcecopy {
        let [src, dst] = split_args::<2>(arg);
        let source = ctx.cluster.get(&required(src, "source")?)?;
        let destination = ctx.cluster.get(&required(dst, "destination")?)?;
        info!(source = %source, destination = %destination, "force copy");
        let result = force_copy(&source, &destination).await?;
        out.push(json!({"source": source.id(), "destination": destination.id(), "result": result}));
    }
    if let Some(id) = &cli.rollingupdate {
        out.one(ctx, id, |h| async move { rolling_forward_sync(&h).await }).await?;
    }
    if let Some(pattern) = &cli.resetmetrics {
        out.each(ctx, pattern, |h| async move { h.reset_metrics().await }).await?;
    }
    if let Some(id) = &cli.opdump {
        out.one(ctx, id, |h| async move { h.op_dump().await }).await?;
    }
    if let Some(arg) = &cli.nodestat {
        let [id, key] = split_args::<2>(arg);
        let id = required(id, "instance id")?;
        out.in_turn(ctx, &id, |h| {
            let key = key.clone();
            async move {
                match key {
                    Some(key) => {
                        let value = h.nodestat_key(&key).await?;
                        Ok(Value::Object(Map::from_iter([(key, value)])))
                    }
                    None => h.nodestat_value().await,
                }
            }
        })
        .await?;
    }
    if let Some(arg) = &cli.reloadplugins {
        let [id, file] = split_args::<2>(arg);
        let id = required(id, "instance id")?;
        let plugins = match file {
            Some(file) => {
                let text = std::fs::read_to_string(&file)
                    .map_err(|e| AdminError::invalid_usage(format!("cannot read {file}: {e}")))?;
                serde_json::from_str::<Value>(&text)
                    .map_err(|e| AdminError::invalid_usage(format!("invalid plugin JSON in {file}: {e}")))?;
                Some(text)
            }
            None => None,
        };
        out.each(ctx, &id, |h| {
            let plugins = plugins.clone();
            async move { h.reload_plugins(plugins).await }
        })
        .await?;
    }
    if let Some(pattern) = &cli.pausein {
        out.each(ctx, pattern, |h| async move { h.pause_in().await }).await?;
    }
    if let Some(pattern) = &cli.pauseout {
        out.each(ctx, pattern, |h| async move { h.pause_out().await }).await?;
    }
    if let Some(id) = &cli.instancecfg {
        out.one(ctx, id, |h| async move { Ok(h.config().clone()) }).await?;
    }
    if let Some(pattern) = &cli.resumein {
        out.each(ctx, pattern, |h| async move { h.resume_in().await }).await?;
    }
    if let Some(pattern) = &cli.resumeout {
        out.each(ctx, pattern, |h| async move { h.resume_out().await }).await?;
    }
    if let Some(pattern) = &cli.status {
        out.each(ctx, pattern, |h| async move { h.status().await }).await?;
    }
    if let Some(pattern) = &cli.pausettl {
        out.each(ctx, pattern, |h| async move { h.pause_ttl().await }).await?;
    }
    if let Some(pattern) = &cli.resumettl {
        out.each(ctx, pattern, |h| async move { h.resume_ttl().await }).await?;
    }
    if let Some(pattern) = &cli.unsubscribe {
        out.in_turn(ctx, pattern, |h| async move { h.unsubscribe().await }).await?;
    }
    if let Some(id) = &cli.unbind {
        out.one(ctx, id, |h| async move { h.unbind().await }).await?;
    }
    if let Some(arg) = &cli.throttle {
        let [id, rate, unit] = split_args::<3>(arg);
        let id = required(id, "instance id")?;
        let rate = match rate {
            Some(rate) => rate
                .parse::<f64>()
                .map_err(|_| AdminError::invalid_usage(format!("invalid throttle rate: {rate}")))?,
            None => -1.0,
        };
        let unit = unit.unwrap_or_else(|| "bytes".to_string());
        out.each(ctx, &id, |h| {
            let unit = unit.clone();
            async move { h.throttle(rate, &unit).await }
        })
        .await?;
    }
    if let Some(pattern) = &cli.waitforidle {
        out.each(ctx, pattern, |h| async move { h.wait_for_idle(None, None).await.map(|()| Value::Null) })
            .await?;
    }
    if let Some(pattern) = &cli.persist {
        out.each(ctx, pattern, |h| async move { h.persist().await }).await?;
    }
    if let Some(pattern) = &cli.stop {
        if confirm(ctx, "Stop", pattern).await? {
            out.each(ctx, pattern, |h| async move { h.shutdown().await }).await?;
        } else {
            out.handled += 1;
        }
    }
    if let Some(pattern) = &cli.truncate {
        if confirm(ctx, "Erase all data on", pattern).await? {
            out.each(ctx, pattern, |h| async move { h.truncate().await }).await?;
        } else {
            out.handled += 1;
        }
    }
    if let Some(arg) = &cli.sync {
        let [id, mode] = split_args::<2>(arg);
        let id = required(id, "instance id")?;
        let mode: SyncMode = mode.as_deref().unwrap_or("repair").parse()?;
        out.in_turn(ctx, &id, |h| async move { h.sync(mode).await }).await?;
    }
    if let Some(id) = &cli.reversesync {
        out.one(ctx, id, |h| async move { reverse_sync(&h).await }).await?;
    }
    if let Some(pattern) = &cli.descriptor {
        let descriptor = ctx.cluster.descriptor();
        out.in_turn(ctx, pattern, |h| async move { h.update_descriptor(descriptor).await })
            .await?;
    }

    Ok(out)
}

/// Overview of the node named on the command line.
pub async fn summary(ctx: &Context) -> anyhow::Result<Value> {
    let Some(remote) = &ctx.remote else {
        return Err(AdminError::invalid_usage("nothing to do").into());
    };
    let address = remote.address();
    let nodestat = remote
        .endpoint("/vgx/nodestat", &[], false)
        .await
        .map_err(|e| AdminError::Address(format!("{address} -> {e}")))?;
    let ping = remote
        .endpoint("/vgx/ping", &[], false)
        .await
        .map_err(|e| AdminError::Address(format!("{address} -> {e}")))?;
    Ok(json!({
        "system": ctx.cluster.descriptor().name(),
        "address": address,
        "nodestat": nodestat,
        "ping": ping,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_args_pads_and_keeps_the_tail() {
        assert_eq!(split_args::<2>("S1"), [Some("S1".to_string()), None]);
        assert_eq!(
            split_args::<2>("T1, S1,S2"),
            [Some("T1".to_string()), Some("S1,S2".to_string())]
        );
        assert_eq!(
            split_args::<3>("S1,g1,show graph"),
            [Some("S1".to_string()), Some("g1".to_string()), Some("show graph".to_string())]
        );
    }

    #[test]
    fn only_yes_confirms() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" yes "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("no"));
    }

    #[tokio::test]
    async fn confirmed_context_skips_the_prompt() {
        let descriptor = vgx_testkit::sample_descriptor();
        let fake = vgx_testkit::FakeCluster::from_descriptor(&descriptor, vgx_testkit::fast_config());
        let ctx = Context {
            cluster: vgx_instance::Cluster::connect(descriptor, &fake, fake.config()),
            remote: None,
            confirmed: true,
        };
        assert!(confirm(&ctx, "Stop", "S*").await.unwrap());
    }

    #[test]
    fn required_rejects_empty_fields() {
        assert!(required(Some(String::new()), "id").is_err());
        assert!(required(None, "id").is_err());
        assert_eq!(required(Some("S1".into()), "id").unwrap(), "S1");
    }
}
