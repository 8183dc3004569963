use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version = "1.0", author = "Bristol Cyber Security Group (BCSG)")]
pub struct Opts {
    #[arg(long, default_value = "hardware.yaml", help = "Lab hardware description")]
    pub hardware: PathBuf,
    #[arg(long, default_value = "topology.yaml", help = "Desired L2 topology")]
    pub topology: PathBuf,
    #[arg(long, help = "Optional settings json for ssh and output locations")]
    pub settings: Option<PathBuf>,
    #[arg(short, long)]
    pub verbosity: Option<String>,
    #[command(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Subcommand, Debug, Clone, Deserialize, Serialize)]
pub enum SubCommand {
    #[command(about = "Compile the topology into one config per pod without applying it")]
    Compile {
        #[arg(long, help = "Directory for the compiled pod configs, defaults to the settings output dir")]
        out: Option<PathBuf>,
    },
    #[command(about = "Compile the topology and reconcile every pod in parallel")]
    Create,
    #[command(about = "Reconcile this pod's kernel state to a compiled config (runs on the pod)")]
    Reconcile(ReconcileCmd),
    #[command(about = "Open a shell in a simulated client's namespace")]
    Client {
        #[arg(long, short)]
        namespace: String,
    },
    #[command(about = "Show where the serial console of a DUT is attached")]
    Serial {
        #[arg(long, short)]
        dut: String,
    },
    #[command(about = "List which DUTs should be powered on and off")]
    PowerPlan,
}

impl SubCommand {
    pub fn name(&self) -> String {
        match &self {
            SubCommand::Compile { .. } => "compile".into(),
            SubCommand::Create => "create".into(),
            SubCommand::Reconcile(_) => "reconcile".into(),
            SubCommand::Client { .. } => "client".into(),
            SubCommand::Serial { .. } => "serial".into(),
            SubCommand::PowerPlan => "power plan".into(),
        }
    }

    /// Only the fan-out side needs the lab description files
    pub fn needs_lab_files(&self) -> bool {
        !matches!(self, SubCommand::Reconcile(_))
    }
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReconcileCmd {
    #[arg(long, default_value = "-", help = "Pod config json, - reads stdin")]
    pub config: String,
    #[arg(long, default_value = "/run/l2lab.lock", help = "Lock held for the duration of the run")]
    pub lock_file: PathBuf,
    #[arg(long, help = "Pod name used in logs, defaults to the hostname")]
    pub pod: Option<String>,
}
