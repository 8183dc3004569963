mod logging;
mod agent;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use l2lab_lib::{client_shell_command, Lab};
use l2lab_lib::compiler::namespace_owner;
use l2lab_lib::orchestration::fanout::{FanOut, SshDispatch};
use l2lab_lib::orchestration::ssh::SSHClient;
use l2lab_lib::orchestration::write_pod_configs;
use l2lab_lib::power::{power_plan, PowerState};
use l2lab_schemas::cli_models::{Opts, SubCommand};
use l2lab_schemas::settings::LabSettings;
use crate::logging::{configure_logging, log_level};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    std::process::exit(match run_app().await {
        Ok(_) => 0,
        Err(err) => {
            tracing::error!("ERROR: {}", err);
            err.chain().skip(1).for_each(|cause| tracing::error!("because: {}", cause));
            1
        }
    });
}

/// Parse the command line, set up logging and run the chosen command
pub async fn run_app() -> anyhow::Result<()> {
    // Invoke cli option parsing
    let opts: Opts = Opts::parse();
    let mut e = None;
    // Determine and set log level
    let level = match &opts.verbosity {
        None => LevelFilter::INFO,
        Some(x) => match log_level(x) {
            Ok(l) => l,
            Err(err) => {
                e = Some(err);
                LevelFilter::INFO
            }
        },
    };

    // the pod agent's output is collected by the driver, it does not keep a log file of its own
    let settings = if opts.sub_command.needs_lab_files() {
        Some(LabSettings::read(opts.settings.as_deref()).await)
    } else {
        None
    };
    let log_dir = match &settings {
        Some(Ok(settings)) => Some(settings.log_dir.as_path()),
        _ => None,
    };
    let _guard = configure_logging(level, log_dir);
    if let Some(e) = e {
        tracing::warn!("{}", e);
    }
    let settings = settings.transpose()?;
    tracing::trace!("running {}", opts.sub_command.name());

    match (&opts.sub_command, settings) {
        (SubCommand::Reconcile(cmd), _) => agent::run_agent(cmd).await,
        (sub_command, Some(settings)) => parse_command(&opts, sub_command, settings).await
            .with_context(|| format!("running {} command", sub_command.name())),
        (_, None) => bail!("command not matched, please raise an issue"),
    }
}

/// Commands run from the machine driving the lab
async fn parse_command(opts: &Opts, sub_command: &SubCommand, settings: LabSettings) -> anyhow::Result<()> {
    let lab = Lab::load(&opts.hardware, &opts.topology).await?;
    match sub_command {
        SubCommand::Compile { out } => {
            let configs = lab.compile()?;
            let out_dir = out.clone().unwrap_or_else(|| settings.output_dir.clone());
            for path in write_pod_configs(&out_dir, &configs).await? {
                println!("{}", path.display());
            }
            Ok(())
        }
        SubCommand::Create => create(&lab, settings).await,
        SubCommand::Client { namespace } => {
            let configs = lab.compile()?;
            let pod = namespace_owner(&configs, namespace)
                .with_context(|| format!("no simulated client with namespace {namespace}"))?;
            let host = lab.inventory.pod(pod)
                .with_context(|| format!("pod {pod} is not in the inventory"))?
                .host.as_str();
            tracing::info!("namespace {namespace} lives on pod {pod} at {host}");
            let client = SSHClient::new(host, &settings);
            let code = client.run_interactive(&client_shell_command(namespace)).await?;
            if code != Some(0) {
                bail!("session in {namespace} on {pod} ended with {code:?}");
            }
            Ok(())
        }
        SubCommand::Serial { dut } => {
            let location = lab.inventory.console_for_dut(dut)
                .with_context(|| format!("no console attached for DUT {dut}"))?;
            println!("{} {} {} {}", location.pod, location.host, location.kind, location.id);
            Ok(())
        }
        SubCommand::PowerPlan => {
            for (dut, state) in power_plan(&lab.inventory, &lab.topology) {
                println!("{dut} {state}");
            }
            Ok(())
        }
        SubCommand::Reconcile(_) => bail!("reconcile runs on the pod, not from the lab description"),
    }
}

/// Compile, hand every pod its config and wait for all of them
async fn create(lab: &Lab, settings: LabSettings) -> anyhow::Result<()> {
    let configs = lab.compile()?;
    write_pod_configs(&settings.output_dir, &configs).await?;

    let plan = power_plan(&lab.inventory, &lab.topology);
    let powered: Vec<&str> = plan.iter()
        .filter(|(_, state)| **state == PowerState::On)
        .map(|(dut, _)| dut.as_str())
        .collect();
    tracing::info!("DUTs to power on: {}", powered.join(", "));

    let fanout = FanOut::new(SshDispatch::new(settings));
    let statuses = fanout.apply(&configs, &lab.inventory).await;

    let mut failed = 0;
    for (pod, status) in &statuses {
        println!("{pod}: {status}");
        if !status.is_success() {
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} of {} pods did not reconcile, see the logs folder", statuses.len());
    }
    Ok(())
}
