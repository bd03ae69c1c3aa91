use std::process::Command;

use anyhow::{bail, Context as _};
use clap::Parser;

use crate::build_ebpf::{build_ebpf, Architecture, Options as BuildOptions};

#[derive(Debug, Parser)]
pub struct Options {
    /// Set the endianness of the BPF target
    #[clap(default_value = "bpfel-unknown-none", long)]
    pub bpf_target: Architecture,
    /// Build and run the release target
    #[clap(long)]
    pub release: bool,
    /// The command used to wrap your application
    #[clap(short, long, default_value = "sudo -E")]
    pub runner: String,
    /// Arguments to pass to your application
    #[clap(name = "args", last = true)]
    pub run_args: Vec<String>,
}

/// Build the project
fn build(opts: &Options) -> Result<(), anyhow::Error> {
    let mut args = vec!["build", "-p", "pyroprof"];
    if opts.release {
        args.push("--release");
    }

    let status = Command::new("cargo")
        .args(args)
        .status()
        .context("failed to build userspace")?;
    if !status.success() {
        bail!("failed to build userspace: {status}");
    }
    Ok(())
}

pub fn run(opts: Options) -> Result<(), anyhow::Error> {
    // build our ebpf program followed by our application
    build_ebpf(BuildOptions {
        target: opts.bpf_target,
        release: opts.release,
    })
    .context("Error while building eBPF program")?;
    build(&opts).context("Error while building userspace application")?;

    // profile we are building (release or debug)
    let profile = if opts.release { "release" } else { "debug" };
    let bin_path = format!("target/{profile}/pyroprof");
    let bpf_path = format!("target/{}/{profile}/pyroprof", opts.bpf_target);

    // configure args
    let mut args: Vec<_> = opts.runner.trim().split_terminator(' ').collect();
    args.push(bin_path.as_str());
    args.extend(["run", "--bpf", bpf_path.as_str()]);
    args.extend(opts.run_args.iter().map(String::as_str));

    let status = Command::new(args[0])
        .args(&args[1..])
        .status()
        .context("failed to run pyroprof")?;
    if !status.success() {
        bail!("pyroprof exited with {status}");
    }
    Ok(())
}
