use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use sdk_release_builder::config;
use sdk_release_builder::executor::{BuildContext, ExecCtx, StdoutSink, execute_plan};
use sdk_release_builder::manifest::Manifest;
use sdk_release_builder::stages::{builtin_registry, plan_release};
use sdk_release_builder::store::Store;
use sdk_release_builder::workspace::{Workspace, list_files_with_suffix};
use sdk_release_builder::{Error, Result};

#[derive(Parser)]
#[command(name = "sdkrel", version, about = "Release build driver for the device SDK")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the ordered task list for a release manifest.
    Plan {
        manifest: PathBuf,
        /// Emit the task graph in GraphViz dot format instead.
        #[arg(long)]
        dot: bool,
    },
    /// Run the full release pipeline.
    Run {
        manifest: PathBuf,
        /// Walk the plan and log what would run without executing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the manifest after `extends` resolution.
    Resolve { manifest: PathBuf },
}

fn main() {
    // Usage errors exit with code 1; help and version output are not errors.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    let result = match cli.command {
        Cmd::Plan { manifest, dot } => cmd_plan(&manifest, dot),
        Cmd::Run { manifest, dry_run } => cmd_run(&manifest, dry_run),
        Cmd::Resolve { manifest } => cmd_resolve(&manifest),
    };
    if let Err(e) = result {
        eprintln!("sdkrel: {e}");
        std::process::exit(1);
    }
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    let doc = config::load(path)?;
    Manifest::from_doc(&doc)
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let manifest = load_manifest(path)?;
    let plan = plan_release(&manifest)?;
    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }
    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!("{:3}. {}  [{}/{}]", i + 1, task.id, task.stage, task.phase);
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = config::load(path)?;
    let text = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::config(format!("cannot render manifest: {e}")))?;
    print!("{text}");
    Ok(())
}

fn cmd_run(path: &Path, dry_run: bool) -> Result<()> {
    let manifest = load_manifest(path)?;
    let ws = Workspace::in_current_dir()?;
    let plan = plan_release(&manifest)?;
    let registry = builtin_registry()?;

    let bctx = BuildContext {
        manifest,
        ws: ws.clone(),
    };
    let mut ctx = ExecCtx::new(dry_run, Arc::new(StdoutSink::default())).with_env(ws.store_env());
    execute_plan(&bctx, &plan, &registry, &mut ctx)?;

    if dry_run {
        return Ok(());
    }

    let images = list_files_with_suffix(&ws.root, ".spk")?;
    if !images.is_empty() {
        println!("factory images:");
        for name in images {
            println!("  {}", ws.output_image_path(&name).display());
        }
    }
    let packages = Store::new(&ws).list_packages()?;
    if !packages.is_empty() {
        println!("published packages:");
        for name in packages {
            println!("  {name}");
        }
    }
    Ok(())
}
