use std::{fs::File, path::PathBuf, process::Command};

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Debug, Parser)]
pub struct Options {
    /// Kernel types to generate bindings for
    #[clap(default_values_t = ["task_struct".to_owned()])]
    pub types: Vec<String>,
}

/// Generates `pyroprof-ebpf/src/vmlinux.rs` from the running kernel's BTF
pub fn generate(opts: Options) -> Result<()> {
    let out = PathBuf::from("pyroprof-ebpf/src/vmlinux.rs");
    let file = File::create(&out).with_context(|| format!("unable to create {out:?}"))?;

    let status = Command::new("aya-tool")
        .arg("generate")
        .args(&opts.types)
        .stdout(file)
        .status()
        .context("failed to run aya-tool, install it with `cargo install bindgen-cli aya-tool`")?;
    if !status.success() {
        bail!("aya-tool failed: {status}");
    }
    Ok(())
}
