use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use repoforge::config::Settings;
use repoforge::orchestrator::Orchestrator;
use repoforge::pm::{CmdPm, PackageManager};
use repoforge::recipe::RecipeRecord;
use repoforge::resolver::{Classified, CmdDepSource, Resolver};
use repoforge::{Result, repoindex};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print each recipe's install set classification without touching the system
    Plan {
        /// Path to the configuration TOML
        #[arg(short = 'c', long, default_value = "repoforge.toml")]
        config: PathBuf,
        /// Change to this directory before doing anything else
        #[arg(short = 'C', long)]
        chdir: Option<PathBuf>,
        /// Override the configured target directory
        #[arg(long)]
        target: Option<PathBuf>,
        /// Recipe directories, in batch order
        #[arg(required = true)]
        recipes: Vec<PathBuf>,
    },
    /// Build the batch and reconcile the repository index
    Run {
        /// Path to the configuration TOML
        #[arg(short = 'c', long, default_value = "repoforge.toml")]
        config: PathBuf,
        /// Change to this directory before doing anything else
        #[arg(short = 'C', long)]
        chdir: Option<PathBuf>,
        /// Override the configured target directory
        #[arg(long)]
        target: Option<PathBuf>,
        /// Remove orphaned dependencies before each build
        #[arg(long)]
        verify: bool,
        /// Skip the repository sync before the batch
        #[arg(long)]
        no_sync: bool,
        /// Run a full system upgrade before the batch
        #[arg(long)]
        upgrade: bool,
        /// Log what would run without executing anything
        #[arg(long)]
        dry_run: bool,
        /// Recipe directories, in batch order
        #[arg(required = true)]
        recipes: Vec<PathBuf>,
    },
    /// Print the fully-resolved configuration TOML (after imports/extends)
    Resolve {
        /// Path to the configuration TOML
        #[arg(short = 'c', long, default_value = "repoforge.toml")]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let res = match args.cmd {
        Command::Plan {
            config,
            chdir,
            target,
            recipes,
        } => cmd_plan(&config, chdir.as_deref(), target.as_deref(), &recipes),
        Command::Run {
            config,
            chdir,
            target,
            verify,
            no_sync,
            upgrade,
            dry_run,
            recipes,
        } => cmd_run(
            &config,
            chdir.as_deref(),
            target.as_deref(),
            verify,
            no_sync,
            upgrade,
            dry_run,
            &recipes,
        ),
        Command::Resolve { config } => cmd_resolve(&config),
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[1merror:\x1b[0m {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_settings(config: &Path, chdir: Option<&Path>) -> Result<Settings> {
    if let Some(dir) = chdir {
        std::env::set_current_dir(dir)?;
    }
    let doc = repoforge::config::load(config)?;
    Settings::from_doc(&doc)
}

fn extract_records(recipes: &[PathBuf], settings: &Settings) -> Result<Vec<RecipeRecord>> {
    recipes
        .iter()
        .map(|dir| repoforge::recipe::extract(dir, settings))
        .collect()
}

fn cmd_plan(
    config: &Path,
    chdir: Option<&Path>,
    target: Option<&Path>,
    recipes: &[PathBuf],
) -> Result<()> {
    let settings = load_settings(config, chdir)?;
    let target_dir = settings.package_dir(target);
    let records = extract_records(recipes, &settings)?;

    let resolver = Resolver::new(
        &records,
        &settings.pkg.arch,
        &settings.pkg.extension,
        &target_dir,
        Box::new(CmdDepSource::new(settings.tools.archive_tool.clone())),
    );

    for rec in &records {
        println!("{}", rec.path.display());
        if !rec.supported_on(&settings.pkg.arch) {
            println!("  (unsupported on {})", settings.pkg.arch);
            continue;
        }
        for dep in &rec.depends {
            match resolver.classify(dep) {
                Classified::Local(pkg) => println!("  local     {dep} -> {pkg}"),
                Classified::External => println!("  external  {dep}"),
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    config: &Path,
    chdir: Option<&Path>,
    target: Option<&Path>,
    verify: bool,
    no_sync: bool,
    upgrade: bool,
    dry_run: bool,
    recipes: &[PathBuf],
) -> Result<()> {
    let settings = load_settings(config, chdir)?;
    let target_dir = settings.package_dir(target);
    let records = extract_records(recipes, &settings)?;

    let resolver = Resolver::new(
        &records,
        &settings.pkg.arch,
        &settings.pkg.extension,
        &target_dir,
        Box::new(CmdDepSource::new(settings.tools.archive_tool.clone())),
    );
    let pm = CmdPm::new(settings.tools.package_manager.clone(), dry_run);

    if upgrade {
        pm.full_upgrade()?;
    } else if !no_sync {
        pm.sync()?;
    }

    let mut orch = Orchestrator::new(
        &settings,
        target_dir.clone(),
        resolver,
        Box::new(pm),
        verify,
        dry_run,
    );
    let summary = orch.run_batch(&records)?;
    info!(
        built = summary.built,
        skipped = summary.skipped,
        arch_skipped = summary.arch_skipped,
        "batch finished"
    );

    if !dry_run {
        repoindex::reconcile(&records, &settings, &target_dir)?;
    }
    Ok(())
}

fn cmd_resolve(config: &Path) -> Result<()> {
    let doc = repoforge::config::load(config)?;
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}
