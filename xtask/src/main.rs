//! Developer convenience runner: builds the two preloadable `cdylib`s and
//! execs one of the `demos/` binaries under `LD_PRELOAD`, so trying the
//! profiler or tracer doesn't require remembering the right library path
//! or environment variables by hand.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Run a demo binary under the statistical call-graph profiler.
    Profile {
        /// One of the `demos/` binary names, e.g. `call-graph-demo`.
        demo: String,
        /// Extra arguments passed through to the demo binary.
        #[arg(last = true)]
        demo_args: Vec<String>,
    },
    /// Run a demo binary under the allocation tracer.
    Trace {
        demo: String,
        #[arg(last = true)]
        demo_args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Cmd::Profile { demo, demo_args } => run_under_preload("libscgprof.so", &demo, &demo_args),
        Cmd::Trace { demo, demo_args } => run_under_preload("libscgmtrace.so", &demo, &demo_args),
    }
}

fn run_under_preload(preload_lib: &str, demo: &str, demo_args: &[String]) -> Result<()> {
    build_release()?;

    let target_dir = workspace_target_dir();
    let preload_path = target_dir.join(preload_lib);
    let demo_path = target_dir.join(demo);

    if !preload_path.exists() {
        anyhow::bail!("{} not found; did the build produce a cdylib?", preload_path.display());
    }
    if !demo_path.exists() {
        anyhow::bail!("{} not found; is '{demo}' a demos/ binary name?", demo_path.display());
    }

    println!("LD_PRELOAD={} {}", preload_path.display(), demo_path.display());
    let status = Command::new(&demo_path)
        .args(demo_args)
        .env("LD_PRELOAD", &preload_path)
        .status()
        .context("failed to exec demo binary")?;

    if !status.success() {
        anyhow::bail!("demo binary exited with {status}");
    }
    Ok(())
}

fn build_release() -> Result<()> {
    let status = Command::new("cargo")
        .args(["build", "--release"])
        .status()
        .context("failed to invoke cargo build")?;
    if !status.success() {
        anyhow::bail!("cargo build --release failed");
    }
    Ok(())
}

fn workspace_target_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("xtask lives directly under the workspace root")
        .join("target")
        .join("release")
}
