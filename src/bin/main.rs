use std::path::PathBuf;

use callframe::config::CallframeConfig;
use callframe::rpc::RpcAdapter;
use callframe::vm::Vm;
use callframe::{replay, verify};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::{
    non_blocking,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

/// CLI for deploying, calling, serving, replaying and verifying callframe VMs
#[derive(Parser)]
#[command(name = "callframe")]
#[command(about = "a cryptographically auditable sandbox for guest programs")]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Path to a config TOML; falls back to defaults if absent.
    #[arg(long, global = true, default_value = "callframe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a fresh VM from a guest script.
    Deploy {
        /// Directory the VM's archive, log and meta get written under.
        #[arg(short, long)]
        dir: PathBuf,
        /// Human-readable title recorded in the VM's meta and archive.
        #[arg(short, long)]
        title: String,
        /// Path to the guest Lua script to evaluate.
        #[arg(short, long)]
        code: PathBuf,
    },

    /// Call an exported method on a previously deployed VM, then close it.
    Call {
        /// Directory of a VM previously created with `deploy`.
        #[arg(short, long)]
        dir: PathBuf,
        /// Exported method name to invoke.
        #[arg(short, long)]
        method: String,
        /// JSON array of arguments, e.g. '[1, "two"]'.
        #[arg(short, long, default_value = "[]")]
        args: String,
        /// Caller identity recorded alongside the call (`System.callerId`).
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Reopen a deployed VM and serve its exports over an RPC websocket.
    Serve {
        /// Directory of a VM previously created with `deploy`.
        #[arg(short, long)]
        dir: PathBuf,
        /// Path segment this VM is mounted at (defaults to the dir's name).
        #[arg(short, long)]
        mount: Option<String>,
        /// Address to bind the websocket listener to.
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Reconstruct a VM by replaying a call log's entries against a fresh
    /// deployment, producing an independent log and archive to compare.
    Replay {
        /// Directory of the VM whose call log should be replayed.
        #[arg(short, long)]
        source: PathBuf,
        /// Directory the replayed VM is deployed into; must not yet exist.
        #[arg(short, long)]
        out: PathBuf,
        /// Fail before deploying unless the log's recorded filesArchiveUrl
        /// equals this value.
        #[arg(long = "assert-files-url")]
        assert_files_url: Option<String>,
    },

    /// Compare two VM deployments' call logs and files archives.
    Verify {
        /// Directory of the first VM deployment.
        a: PathBuf,
        /// Directory of the second VM deployment.
        b: PathBuf,
    },
}

pub fn init_logging(config: &callframe::config::LoggingConfig) {
    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, &config.directory, "callframe.log");
    let (file_writer, _file_guard) = non_blocking(file_appender);
    let (stdout_writer, _stdout_guard) = non_blocking(std::io::stdout());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{0}, callframe={0}", config.level)));

    let subscriber = Registry::default().with(filter).with(
        fmt::layer()
            .with_writer(stdout_writer)
            .with_target(true)
            .with_thread_ids(true),
    );

    // json and plain-text file layers are mutually exclusive per-run; both
    // go through the same non-blocking file writer either way.
    if config.json {
        let subscriber = subscriber.with(fmt::layer().json().with_writer(file_writer));
        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set tracing subscriber");
    } else {
        let subscriber = subscriber.with(fmt::layer().with_writer(file_writer).with_ansi(false));
        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set tracing subscriber");
    }

    Box::leak(Box::new(_file_guard));
    Box::leak(Box::new(_stdout_guard));
}

fn read_code(path: &PathBuf) -> Result<String, Box<dyn std::error::Error>> {
    Ok(std::fs::read_to_string(path)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = CallframeConfig::load(&cli.config)?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Deploy { dir, title, code } => {
            let code = read_code(&code)?;
            info!(dir = ?dir, title = %title, "DEPLOY | evaluating guest script");
            let vm = Vm::deploy_with_extras_and_capacity(
                dir,
                title,
                code,
                |_| Ok(Vec::new()),
                config.vm.queue_capacity,
            )?;
            println!(
                "deployed: archive={} log={}",
                vm.archive().url(),
                vm.log().url()
            );
            vm.close().await;
            Ok(())
        }

        Commands::Call {
            dir,
            method,
            args,
            user,
        } => {
            let args: Vec<serde_json::Value> = serde_json::from_str(&args)?;
            info!(dir = ?dir, method = %method, "CALL | reopening VM");
            let vm = Vm::open_with_capacity(dir, config.vm.queue_capacity)?;
            let result = vm.execute_call(method, args, user).await;
            vm.close().await;
            match result {
                Ok(value) => {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                    Ok(())
                }
                Err(e) => Err(Box::new(e)),
            }
        }

        Commands::Serve { dir, mount, bind } => {
            let mount = mount.unwrap_or_else(|| {
                dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "vm".to_string())
            });
            let bind = bind.unwrap_or(config.rpc.bind_address.clone());

            info!(dir = ?dir, mount = %mount, bind = %bind, "SERVE | reopening VM");
            let vm = Vm::open_with_capacity(dir, config.vm.queue_capacity)?;

            let adapter = RpcAdapter::new();
            adapter.mount(mount, vm);

            info!(bind = %bind, "SERVE | listening");
            adapter.listen(&bind).await?;
            Ok(())
        }

        Commands::Replay {
            source,
            out,
            assert_files_url,
        } => {
            info!(source = ?source, out = ?out, "REPLAY | reopening source VM's call log");
            let source_vm = Vm::open(source)?;
            let assertions = replay::ReplayAssertions {
                files_archive_url: assert_files_url,
            };
            let replayed =
                replay::from_call_log(source_vm.log().as_ref(), assertions, out.clone()).await?;

            let comparison =
                verify::compare_logs(source_vm.log().as_ref(), replayed.log().as_ref())?;
            if comparison.matches {
                info!("REPLAY | replayed log matches the original");
            } else {
                warn!(
                    divergence = ?comparison.first_divergence,
                    "REPLAY | replayed log diverged from the original"
                );
            }

            source_vm.close().await;
            replayed.close().await;
            println!("replayed into: {}", out.display());
            Ok(())
        }

        Commands::Verify { a, b } => {
            let vm_a = Vm::open(a.clone())?;
            let vm_b = Vm::open(b.clone())?;

            let log_comparison = verify::compare_logs(vm_a.log().as_ref(), vm_b.log().as_ref())?;
            let archive_comparison = verify::compare_archives(
                vm_a.archive().as_ref(),
                &a.join("files"),
                vm_b.archive().as_ref(),
                &b.join("files"),
            )?;

            vm_a.close().await;
            vm_b.close().await;

            info!(matches = log_comparison.matches, "VERIFY | call logs compared");
            info!(
                matches = archive_comparison.matches,
                "VERIFY | files archives compared"
            );

            log_comparison.into_result()?;
            archive_comparison.into_result()?;
            println!("verified: logs and archives match");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn cli_parses_deploy_subcommand() {
        let cli = Cli::parse_from([
            "callframe",
            "deploy",
            "--dir",
            "/tmp/vm",
            "--title",
            "demo",
            "--code",
            "/tmp/vm.lua",
        ]);
        assert!(matches!(cli.command, Commands::Deploy { .. }));
    }
}
