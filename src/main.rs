use brainprep::config::RunConfig;
use brainprep::constants::DEFAULT_LOG_DIR;
use brainprep::logging::init_logging;
use brainprep::modality::Modality;
use brainprep::pipeline::StagePlan;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "brainprep")]
#[command(about = "Multi-modal brain MRI preprocessing orchestrator")]
#[command(version)]
struct Cli {
    /// Directory for rolling JSON logs
    #[arg(long, global = true, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the stages a run description would execute and the files it would write
    Plan {
        /// TOML run description
        #[arg(long)]
        config: PathBuf,
        /// Assume a defacer that needs the brain-extracted image (Quickshear style)
        #[arg(long)]
        defacer_needs_brain: bool,
    },
}

fn print_outputs(role: &str, modality: &Modality) {
    println!("  {} '{}' <- {}", role, modality.name(), modality.input_path().display());
    for (variant, path) in modality.outputs() {
        println!("    {:<20} {}", variant.to_string(), path.display());
    }
    if modality.bias_correction() {
        println!("    bias correction enabled");
    }
    if modality.atlas_correction() {
        println!("    atlas correction enabled");
    }
}

fn plan(config_path: PathBuf, defacer_needs_brain: bool) -> anyhow::Result<()> {
    let config = RunConfig::load(&config_path)?;
    let variant = config.variant()?;
    let center = config.center()?;
    let moving = config.moving()?;
    let options = config.run_options()?;

    let plan = StagePlan::infer(&variant, &center, &moving, defacer_needs_brain);
    info!("📋 Planned {} stages from {}", plan.len(), config_path.display());

    println!("Variant: {variant}");
    if let Some(atlas) = variant.atlas_image() {
        println!("Atlas:   {}", atlas.display());
    }
    println!("Stages:  {plan}");
    println!("Modalities:");
    print_outputs("center", center.modality());
    if let Some(path) = center.bet_mask_output() {
        println!("    {:<20} {}", "bet_mask", path.display());
    }
    if let Some(path) = center.defacing_mask_output() {
        println!("    {:<20} {}", "defacing_mask", path.display());
    }
    for modality in &moving {
        print_outputs("moving", modality);
    }

    let mut save_dirs: Vec<_> = options.save_dirs.iter().collect();
    save_dirs.sort();
    for (stage, dir) in save_dirs {
        let marker = if plan.contains(*stage) { "" } else { " (stage not planned)" };
        println!("Intermediates of {stage}: {}{marker}", dir.display());
    }
    if let Some(dir) = &options.transformations_dir {
        println!("Transformations: {}", dir.display());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli.log_dir)?;

    let result = match cli.command {
        Commands::Plan { config, defacer_needs_brain } => plan(config, defacer_needs_brain),
    };
    if let Err(e) = &result {
        error!("❌ {e:#}");
    }
    result
}
