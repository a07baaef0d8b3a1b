//! vgxadmin — operate a VGX cluster.
//!
//! ```text
//! vgxadmin --cf cluster.json --status '*'
//! vgxadmin host3:9001 --serviceout --sync
//! ```
//!
//! A leading `host:adminport` loads the descriptor stored on that node; an
//! instance id resolves against `--cf`. Either way, options given without a
//! value then act on that instance.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use vgx_core::AdminError;

mod commands;

#[derive(Parser, Debug, Default)]
#[command(
    name = "vgxadmin",
    about = "VGX cluster administration",
    override_usage = "vgxadmin [<address|id>] <options>"
)]
pub struct Cli {
    /// Target instance: `host:adminport` or an instance id.
    pub target: Option<String>,

    /// Local system descriptor file.
    #[arg(short = 'f', long = "cf", value_name = "FILE")]
    pub cf: Option<PathBuf>,

    /// Timeouts and retry settings (TOML).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Confirm destructive operations (skip the y/n prompt).
    #[arg(short = 'c', long)]
    pub confirm: bool,

    /// Log as JSON lines on stderr.
    #[arg(long)]
    pub log_json: bool,

    /// Show the effective system descriptor.
    #[arg(short = 'J', long)]
    pub show: bool,

    /// Send a GET request to <address>.
    #[arg(short = 'E', long, value_name = "PATH")]
    pub endpoint: Option<String>,

    /// Attach instance to its subscribers, or to the listed ones.
    #[arg(short = 'a', long, value_name = "ID[,SUB,...]", num_args = 0..=1, default_missing_value = ".")]
    pub attach: Option<String>,

    /// Bind the transaction input port.
    #[arg(short = 'B', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub bind: Option<String>,

    /// Terminate a sync in progress.
    #[arg(short = 'k', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub cancelsync: Option<String>,

    /// Send console command <CMD> to graph <GRAPH>.
    #[arg(short = 'C', long, value_name = "ID,GRAPH,CMD")]
    pub command: Option<String>,

    /// Store the effective descriptor on the instance.
    #[arg(short = 'Z', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub descriptor: Option<String>,

    /// Detach instance from its subscribers.
    #[arg(short = 'd', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub detach: Option<String>,

    /// Force a full copy from <SRC> to <DST>.
    #[arg(short = 'K', long, value_name = "SRC,DST")]
    pub forcecopy: Option<String>,

    /// Show instance configuration.
    #[arg(short = 'Q', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub instancecfg: Option<String>,

    /// Node status, optionally a single key.
    #[arg(short = 'n', long, value_name = "ID[,KEY]", num_args = 0..=1, default_missing_value = ".")]
    pub nodestat: Option<String>,

    /// Dump instance data to an output file.
    #[arg(short = 'M', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub opdump: Option<String>,

    /// Pause transaction input.
    #[arg(short = 'p', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub pausein: Option<String>,

    /// Pause transaction output.
    #[arg(short = 'P', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub pauseout: Option<String>,

    /// Pause the TTL event processor.
    #[arg(short = 't', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub pausettl: Option<String>,

    /// Write instance data to disk.
    #[arg(short = 'W', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub persist: Option<String>,

    /// Make graphs readonly.
    #[arg(short = 'g', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub readonly: Option<String>,

    /// Reload plugins, or add the ones in a plugin JSON file.
    #[arg(short = 'N', long, value_name = "ID[,FILE]", num_args = 0..=1, default_missing_value = ".")]
    pub reloadplugins: Option<String>,

    /// Clear performance and error counters.
    #[arg(short = 'm', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub resetmetrics: Option<String>,

    /// Restart the HTTP server with refreshed config.
    #[arg(short = 'D', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub restarthttp: Option<String>,

    /// Resume transaction input.
    #[arg(short = 'r', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub resumein: Option<String>,

    /// Resume transaction output.
    #[arg(short = 'R', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub resumeout: Option<String>,

    /// Resume the TTL event processor.
    #[arg(short = 'T', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub resumettl: Option<String>,

    /// Copy data back from the most advanced subscriber.
    #[arg(short = 'Y', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub reversesync: Option<String>,

    /// Forward sync subscribers one at a time while out of service.
    #[arg(short = 'L', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub rollingupdate: Option<String>,

    /// Service in.
    #[arg(short = 'I', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub servicein: Option<String>,

    /// Service out.
    #[arg(short = 'i', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub serviceout: Option<String>,

    /// System summary.
    #[arg(short = 'S', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub status: Option<String>,

    /// Stop instances.
    #[arg(short = 'x', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub stop: Option<String>,

    /// Sync data to subscribers (mode: repair, hard, soft).
    #[arg(short = 'y', long, value_name = "ID[,MODE]", num_args = 0..=1, default_missing_value = ".")]
    pub sync: Option<String>,

    /// Throttle TX input to <RATE> <UNIT>s per second.
    #[arg(short = 'V', long, value_name = "ID[,RATE,UNIT]", num_args = 0..=1, default_missing_value = ".")]
    pub throttle: Option<String>,

    /// Erase instance data.
    #[arg(short = 'X', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub truncate: Option<String>,

    /// Unbind the transaction input port.
    #[arg(short = 'U', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub unbind: Option<String>,

    /// Detach instance from its provider.
    #[arg(short = 'u', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub unsubscribe: Option<String>,

    /// Wait until instance input is idle.
    #[arg(short = 'w', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub waitforidle: Option<String>,

    /// Make graphs writable.
    #[arg(short = 'G', long, value_name = "ID", num_args = 0..=1, default_missing_value = ".")]
    pub writable: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let directive: tracing_subscriber::filter::Directive = "vgxadmin=info".parse().expect("static directive");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match commands::run(&cli).await {
        Ok(results) => {
            match serde_json::to_string_pretty(&results) {
                Ok(text) => println!("{text}"),
                Err(e) => eprintln!("{e}"),
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            let kind = err.downcast_ref::<AdminError>().map_or("Error", AdminError::kind);
            eprintln!("{kind}: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_options_target_the_address() {
        let cli = Cli::try_parse_from(["vgxadmin", "h3:9001", "--serviceout", "--sync", "S1,hard"]).unwrap();
        assert_eq!(cli.target.as_deref(), Some("h3:9001"));
        assert_eq!(cli.serviceout.as_deref(), Some("."));
        assert_eq!(cli.sync.as_deref(), Some("S1,hard"));
        assert!(cli.stop.is_none());
    }

    #[test]
    fn value_options_keep_their_value() {
        let cli = Cli::try_parse_from(["vgxadmin", "--cf", "c.json", "--forcecopy", "S1,S2", "-c", "-x", "S*"])
            .unwrap();
        assert_eq!(cli.cf, Some(PathBuf::from("c.json")));
        assert_eq!(cli.forcecopy.as_deref(), Some("S1,S2"));
        assert!(cli.confirm);
        assert_eq!(cli.stop.as_deref(), Some("S*"));
    }

    #[test]
    fn value_required_options_reject_bare_use() {
        assert!(Cli::try_parse_from(["vgxadmin", "--forcecopy"]).is_err());
    }
}
