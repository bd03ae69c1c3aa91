use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use pyroprof::{
    controller::{PolicyResolver, ProcfsResolver},
    SessionOptions,
};
use tracing_subscriber::EnvFilter;

use crate::args::Commands;

mod args;

fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_options(path: Option<&Path>) -> Result<SessionOptions> {
    let options = match path {
        Some(path) => SessionOptions::from_path(path)?,
        None => SessionOptions::load_default()?,
    };
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    let opt = args::Opt::parse();
    match opt.command {
        Commands::Run {
            bpf,
            config,
            sample_rate,
            interval,
            no_user,
            no_kernel,
            python,
        } => {
            let mut options = load_options(config.as_deref())?;
            if let Some(rate) = sample_rate {
                options.sample_rate = rate;
            }
            options.collect_user &= !no_user;
            options.collect_kernel &= !no_kernel;
            options.python |= python;
            options.validate()?;
            run::run(&bpf, options, interval.max(1)).await?;
        }
        Commands::Resolve { config, python, pids } => {
            let mut options = load_options(config.as_deref())?;
            options.python |= python;
            let resolver = ProcfsResolver::new(&options);
            for pid in pids {
                let config = resolver.resolve(pid);
                let line = serde_json::json!({ "pid": pid, "config": config });
                println!("{}", serde_json::to_string(&line).context("unable to serialize")?);
            }
        }
    }

    Ok(())
}

#[cfg(feature = "aya")]
mod run {
    use std::{io::Write, path::Path, time::Duration};

    use anyhow::Result;
    use nix::unistd::getuid;
    use pyroprof::{
        controller::{Controller, ProcfsResolver},
        ebpf::{self, BpfProfiles, Record},
        ProfileSample, SessionOptions,
    };
    use tokio::{
        signal,
        sync::{mpsc, watch},
    };
    use tracing::{debug, info};

    /// make sure we are running with root privileges
    fn ensure_root() -> Result<()> {
        if !getuid().is_root() {
            anyhow::bail!("pyroprof must be run with root privileges");
        }
        Ok(())
    }

    fn export(samples: &[ProfileSample]) -> Result<()> {
        let mut out = std::io::stdout().lock();
        for s in samples {
            serde_json::to_writer(&mut out, s)?;
            writeln!(out)?;
        }
        Ok(())
    }

    pub async fn run(bpf_path: &Path, options: SessionOptions, interval: u64) -> Result<()> {
        ensure_root()?;
        let mut bpf = ebpf::load(bpf_path)?;
        let _progs = ebpf::register_python(&mut bpf)?;
        ebpf::attach_lifecycle(&mut bpf)?;

        let mut controller = Controller::new(ebpf::pid_table(&mut bpf)?, ProcfsResolver::new(&options));
        let mut profiles = BpfProfiles::new(&mut bpf, options.stacks_reset_interval)?;

        let (tx, mut rx) = mpsc::channel(1024);
        let (stop_tx, stop_rx) = watch::channel(());
        let readers = ebpf::spawn_event_readers(&mut bpf, tx, stop_rx)?;

        // readers are up, start sampling
        ebpf::attach_sampler(&mut bpf, options.sample_rate)?;

        let mut tick = tokio::time::interval(Duration::from_secs(interval));
        tick.tick().await;
        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                Some(record) = rx.recv() => match record {
                    Record::Event(ev) => controller.handle(&ev),
                    Record::Lost { cpu, lost } => controller.handle_lost(cpu, lost),
                },
                _ = tick.tick() => {
                    let samples = profiles.collect_profiles()?;
                    export(&samples)?;
                    let exited = controller.reconcile();
                    let removed = controller.cleanup();
                    controller.retry_unknown();
                    debug!(samples = samples.len(), exited, removed, "collected");
                },
                _ = &mut ctrl_c => break,
            }
        }

        info!("exiting");
        stop_tx.send(())?;
        for t in readers {
            let _ = t.await;
        }
        for (m, v) in ebpf::read_metrics(&bpf)? {
            info!("{m:?}: {v}");
        }
        Ok(())
    }
}

#[cfg(not(feature = "aya"))]
mod run {
    use std::path::Path;

    use pyroprof::SessionOptions;

    pub async fn run(_bpf_path: &Path, _options: SessionOptions, _interval: u64) -> anyhow::Result<()> {
        anyhow::bail!("built without the aya feature")
    }
}
