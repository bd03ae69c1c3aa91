use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct Opt {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sample every cpu and print aggregated stacks as json lines
    Run {
        /// Compiled eBPF object
        #[clap(long, default_value = "target/bpfel-unknown-none/release/pyroprof")]
        bpf: PathBuf,
        /// Defaults to Pyroprof.toml in the current dir
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// Hz
        #[clap(long)]
        sample_rate: Option<u64>,
        /// Seconds between collections
        #[clap(long, default_value_t = 10)]
        interval: u64,
        #[clap(long)]
        no_user: bool,
        #[clap(long)]
        no_kernel: bool,
        /// Send python processes to the python unwinder
        #[clap(long)]
        python: bool,
    },
    /// Print the policy that would be picked for running processes
    Resolve {
        #[clap(short, long)]
        config: Option<PathBuf>,
        #[clap(long)]
        python: bool,
        pids: Vec<u32>,
    },
}
