//! terrain-erode: hydraulic and thermal erosion for heightmap files.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use terrain_erosion::backend::{align_to_work_group, CpuBackend};
use terrain_erosion::erosion::{
    ErosionConfig, ErosionInput, ErosionOutputs, HydraulicEroder, MaskSource, Simulation, TerrainEroder,
    ThermalEroder,
};
use terrain_erosion::grid::FieldId;
use terrain_erosion::heightmap::{self, HeightRange, HeightmapFormat, PngOptions, RawFormat};
use terrain_erosion::logger::Logger;

/// Grid-based terrain erosion.
#[derive(Parser)]
#[command(name = "terrain-erode")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Erode a heightmap file.
    Erode(ErodeArgs),
    /// Print the default configuration as JSON.
    Defaults,
    /// Show memory use of a run at a given resolution.
    Info {
        #[arg(long)]
        width: usize,
        #[arg(long)]
        height: usize,
    },
}

#[derive(clap::Args)]
struct ErodeArgs {
    /// Input heightmap (.png, .raw, .r16, .r32).
    input: PathBuf,

    /// Output heightmap.
    #[arg(short, long)]
    output: PathBuf,

    /// Erosion algorithm.
    #[arg(short, long, default_value = "hydraulic")]
    mode: Mode,

    /// JSON configuration file; flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format. Inferred from the output extension when omitted.
    #[arg(short, long)]
    format: Option<FileFormat>,

    /// Input format. Inferred from the input extension when omitted.
    #[arg(long)]
    input_format: Option<FileFormat>,

    /// RAW input width. Square RAW files need no dimensions.
    #[arg(long)]
    width: Option<usize>,

    /// RAW input height.
    #[arg(long)]
    height: Option<usize>,

    /// Height mapped to black in 16-bit files.
    #[arg(long, default_value = "0.0")]
    min_height: f32,

    /// Height mapped to white in 16-bit files.
    #[arg(long, default_value = "1.0")]
    max_height: f32,

    /// Hardness map in the same format and size as the input.
    #[arg(long)]
    hardness: Option<PathBuf>,

    /// Export an auxiliary mask (sediment, height-diff, flux, water-level, water-speed).
    #[arg(long, requires = "mask_output")]
    mask: Option<MaskSource>,

    /// Mask output file (16-bit PNG, stretched to the mask's range).
    #[arg(long, requires = "mask")]
    mask_output: Option<PathBuf>,

    // Hydraulic overrides
    /// Outer hydraulic iterations.
    #[arg(long)]
    iterations: Option<u32>,

    /// Hydraulic time step.
    #[arg(long)]
    time_delta: Option<f32>,

    /// Rain per unit time.
    #[arg(long)]
    precipitation: Option<f32>,

    /// Evaporation per unit time.
    #[arg(long)]
    evaporation: Option<f32>,

    /// Sediment capacity constant.
    #[arg(long)]
    sediment_capacity: Option<f32>,

    // Thermal overrides
    /// Thermal sub-steps per outer iteration.
    #[arg(long)]
    thermal_iterations: Option<u32>,

    /// Angle of repose in degrees.
    #[arg(long)]
    angle_of_repose_deg: Option<f32>,

    /// Skip thermal relaxation in hydraulic mode.
    #[arg(long)]
    no_thermal: bool,

    /// Relax towards diagonal neighbours too.
    #[arg(long)]
    diagonals: bool,

    // Global overrides
    /// World height of a unit input height.
    #[arg(long)]
    height_scale: Option<f32>,

    /// Multiplier on the applied height change.
    #[arg(long)]
    effect_scalar: Option<f32>,

    /// Mirror the net height change about the input.
    #[arg(long)]
    invert: bool,

    /// Seed for the angle-of-repose jitter.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Water flow, sediment transport and thermal relaxation.
    Hydraulic,
    /// Thermal relaxation only.
    Thermal,
}

#[derive(Clone, Copy, ValueEnum)]
enum FileFormat {
    /// 16-bit grayscale PNG.
    Png,
    /// 16-bit RAW little-endian (Unity).
    R16,
    /// 16-bit RAW big-endian.
    R16be,
    /// 32-bit float RAW.
    R32,
}

impl FileFormat {
    fn resolve(format: Option<FileFormat>, path: &Path) -> HeightmapFormat {
        match format {
            Some(FileFormat::Png) => HeightmapFormat::Png,
            Some(FileFormat::R16) => HeightmapFormat::Raw(RawFormat::R16LittleEndian),
            Some(FileFormat::R16be) => HeightmapFormat::Raw(RawFormat::R16BigEndian),
            Some(FileFormat::R32) => HeightmapFormat::Raw(RawFormat::R32Float),
            None => HeightmapFormat::from_path(path),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    Logger::init(Logger::level_for_verbosity(cli.verbose));

    let result = match cli.command {
        Commands::Erode(args) => run_erode(args),
        Commands::Defaults => run_defaults(),
        Commands::Info { width, height } => {
            run_info(width, height);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn build_config(args: &ErodeArgs) -> Result<ErosionConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => ErosionConfig::from_json_file(path)?,
        None => ErosionConfig::default(),
    };

    if let Some(v) = args.iterations {
        config.hydraulic.iterations = v;
    }
    if let Some(v) = args.time_delta {
        config.hydraulic.time_delta = v;
    }
    if let Some(v) = args.precipitation {
        config.hydraulic.precipitation_rate = v;
    }
    if let Some(v) = args.evaporation {
        config.hydraulic.evaporation_rate = v;
    }
    if let Some(v) = args.sediment_capacity {
        config.hydraulic.sediment_capacity = v;
    }
    if let Some(v) = args.thermal_iterations {
        config.thermal.iterations = v;
    }
    if let Some(v) = args.angle_of_repose_deg {
        config.thermal.angle_of_repose_deg = v;
    }
    if args.no_thermal {
        config.thermal.enabled = false;
    }
    if args.diagonals {
        config.thermal.include_diagonals = true;
    }
    if let Some(v) = args.height_scale {
        config.terrain_dimensions.y = v;
    }
    if let Some(v) = args.effect_scalar {
        config.effect_scalar = v;
    }
    if args.invert {
        config.invert_effect = true;
    }
    if let Some(v) = args.seed {
        config.seed = v;
    }
    Ok(config)
}

fn run_erode(args: ErodeArgs) -> Result<(), Box<dyn Error>> {
    let config = build_config(&args)?;
    let range = HeightRange::new(args.min_height, args.max_height)?;
    let dimensions = match (args.width, args.height) {
        (Some(w), Some(h)) => Some((w, h)),
        (None, None) => None,
        _ => return Err("--width and --height must be given together".into()),
    };

    let input_format = FileFormat::resolve(args.input_format, &args.input);
    let output_format = FileFormat::resolve(args.format, &args.output);

    println!("terrain-erode");
    println!("=============");
    println!("Input:  {}", args.input.display());
    println!("Output: {}", args.output.display());

    let load_start = Instant::now();
    let height = heightmap::load(&args.input, input_format, dimensions, range)?;
    let mut input = ErosionInput::new().with_height(height);
    if let Some(path) = &args.hardness {
        let hardness = heightmap::load(path, input_format, dimensions, HeightRange::default())?;
        input = input.with_hardness(hardness);
    }
    let (width, rows) = input.height.as_ref().map(|h| h.dimensions()).unwrap_or_default();
    println!("Resolution: {}x{} (loaded in {:.2?})", width, rows, load_start.elapsed());

    let eroder: Box<dyn TerrainEroder> = match args.mode {
        Mode::Hydraulic => Box::new(HydraulicEroder::new(config)),
        Mode::Thermal => Box::new(ThermalEroder::new(config)),
    };
    let schedule = eroder.schedule();
    println!(
        "{}: {} outer iterations, {} thermal sub-steps each",
        eroder.name(),
        schedule.outer_iterations,
        schedule.thermal_substeps
    );

    let mut backend = CpuBackend::new();
    let erode_start = Instant::now();
    let report_every = (schedule.outer_iterations / 10).max(1);

    let outputs = match args.mask {
        // Masks need the simulation kept alive past the run.
        Some(source) => {
            let mut sim = Simulation::new(&mut backend);
            sim.initialize_with_schedule(&input, eroder.config(), schedule)?;
            sim.run_with_progress(|p| {
                if p.iteration % report_every == 0 || p.iteration == p.total {
                    println!("  [{}/{}] {:.2?}", p.iteration, p.total, p.elapsed);
                }
            })?;
            let outputs = sim.outputs()?;
            let mask = sim.mask(source)?;
            sim.release()?;
            if let Some(path) = &args.mask_output {
                heightmap::write_png(&mask, path, &PngOptions::auto_range(&mask))?;
                println!("Exported {} mask: {}", source, path.display());
            }
            outputs
        }
        None => eroder.erode_with_progress(&mut backend, &input, &mut |p| {
            if p.iteration % report_every == 0 || p.iteration == p.total {
                println!("  [{}/{}] {:.2?}", p.iteration, p.total, p.elapsed);
            }
        })?,
    };
    println!("Erosion completed in {:.2?}", erode_start.elapsed());
    print_summary(&outputs);

    heightmap::save(&outputs.height, &args.output, output_format, range)?;
    println!("Exported: {}", args.output.display());
    Ok(())
}

fn print_summary(outputs: &ErosionOutputs) {
    let (min_h, max_h) = outputs.height.min_max();
    let (min_d, max_d) = outputs.eroded_amount.min_max();
    println!("Height range:  [{:.4}, {:.4}]", min_h, max_h);
    println!("Height change: [{:.4}, {:.4}]", min_d, max_d);
    println!("Water volume:  {:.4}", outputs.water.sum());
    println!("Sediment left: {:.4}", outputs.sediment.sum());
}

fn run_defaults() -> Result<(), Box<dyn Error>> {
    println!("{}", ErosionConfig::default().to_json_string()?);
    Ok(())
}

fn run_info(width: usize, height: usize) {
    let padded_w = align_to_work_group(width) as u64;
    let padded_h = align_to_work_group(height) as u64;
    let cells = padded_w * padded_h;
    let channels: u64 = FieldId::ALL.iter().map(|f| f.channels() as u64).sum();
    // Two slots per field.
    let bytes_fields = cells * channels * 2 * 4;
    let bytes_png = (width as u64) * (height as u64) * 2;
    let bytes_r32 = (width as u64) * (height as u64) * 4;

    println!("terrain-erode - Run Info");
    println!("========================");
    println!();
    println!("Resolution: {}x{} (allocated {}x{})", width, height, padded_w, padded_h);
    println!();
    println!("Field memory (two slots each):");
    for field in FieldId::ALL {
        let bytes = cells * field.channels() as u64 * 2 * 4;
        println!("  {:<14} {:>12} bytes ({:.2} MB)", field.name(), bytes, bytes as f64 / 1024.0 / 1024.0);
    }
    println!("  {:<14} {:>12} bytes ({:.2} MB)", "Total", bytes_fields, bytes_fields as f64 / 1024.0 / 1024.0);
    println!();
    println!("File sizes:");
    println!("  PNG / R16 (16-bit): {:>10} bytes (before compression for PNG)", bytes_png);
    println!("  R32 (float):        {:>10} bytes", bytes_r32);

    if width != height {
        println!();
        println!("Note: non-square RAW files need --width and --height on input.");
    }
}

