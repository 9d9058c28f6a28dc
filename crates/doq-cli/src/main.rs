//! DOQ tile cache command-line interface.
//!
//! Inspect a cache directory, move single tiles in and out of it, and
//! compose orthoquad images around UTM positions.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};
use image::imageops;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use doq_tiles::{
    run_exit_cleanup, CacheConfig, RasterComposer, StoreStats, Theme, TileError, TileKey,
    TileManager, UtmPoint, DEFAULT_THEME,
};

#[derive(Parser)]
#[command(name = "doq")]
#[command(about = "Cache and compose georeferenced imagery tiles", long_about = None)]
#[command(version)]
struct Cli {
    /// Cache directory (overrides the configuration file)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Identity of one tile.
#[derive(Args, Debug, Clone)]
struct KeyArgs {
    /// Grid column
    x: i32,
    /// Grid row
    y: i32,
    /// Tileset name (e.g. air-1m) or numeric id
    #[arg(value_parser = parse_tileset)]
    tileset: u8,
    /// UTM zone
    zone: i8,
}

impl KeyArgs {
    fn key(&self) -> TileKey {
        TileKey::new(self.x, self.y, self.tileset, self.zone)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show index and shard statistics
    Info {
        /// Print JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Fetch one tile (from disk or network) and save it as an image
    Get {
        #[command(flatten)]
        key: KeyArgs,
        /// Output image path; the format follows the extension
        #[arg(long)]
        out: PathBuf,
    },
    /// Store a file as the payload of one tile
    Put {
        #[command(flatten)]
        key: KeyArgs,
        /// File holding the tile bytes
        file: PathBuf,
    },
    /// Invalidate one stored tile
    Invalidate {
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Compose an image centered on a UTM position
    Compose {
        /// Easting in meters
        #[arg(long)]
        easting: f64,
        /// Northing in meters
        #[arg(long)]
        northing: f64,
        /// UTM zone
        #[arg(long)]
        zone: i8,
        /// Edge of the output image in pixels
        #[arg(long, default_value_t = 1000)]
        size: u32,
        /// Tileset name or numeric id
        #[arg(long, value_parser = parse_tileset, default_value_t = DEFAULT_THEME)]
        theme: u8,
        /// Download every tile again instead of reading the cache
        #[arg(long, default_value_t = false)]
        refill: bool,
        /// Write grayscale instead of color
        #[arg(long, default_value_t = false)]
        gray: bool,
        /// Output image path; the format follows the extension
        #[arg(long)]
        out: PathBuf,
    },
    /// List known tilesets
    Themes {
        /// Print JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Tile(#[from] TileError),

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write image: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

type Result<T> = std::result::Result<T, CliError>;

fn parse_tileset(s: &str) -> std::result::Result<u8, String> {
    let theme = match s.parse::<u8>() {
        Ok(id) => Theme::from_id(id),
        Err(_) => Theme::from_name(s),
    };
    theme
        .map(|t| t.id)
        .ok_or_else(|| format!("unknown tileset {:?} (see `doq themes`)", s))
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<CacheConfig> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    doq_metrics::describe_metrics();

    let result = install_signal_handler().and_then(|_| run(&cli));
    run_exit_cleanup();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn install_signal_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        warn!("interrupted, closing tile cache");
        run_exit_cleanup();
        std::process::exit(130);
    })?;
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    if let Commands::Themes { json } = &cli.command {
        return print_themes(*json);
    }

    let config = load_config(cli)?;
    let mut manager = TileManager::open(&config)?;
    if manager.is_temporary() {
        warn!(dir = %manager.dir().display(), "no cache directory, tiles will not be kept");
    }

    match &cli.command {
        Commands::Info { json } => print_info(&manager, *json)?,
        Commands::Get { key, out } => {
            let key = key.key();
            let grid = manager.lock().get_or_fetch(&key)?;
            grid.save(out)?;
            println!("{} -> {}", key, out.display());
        }
        Commands::Put { key, file } => {
            let key = key.key();
            let bytes = read_file(file)?;
            let n = manager.put_tile(&key, &bytes)?;
            println!("stored {} bytes for {}", n, key);
        }
        Commands::Invalidate { key } => {
            let key = key.key();
            manager.invalidate_tile(&key)?;
            println!("invalidated {}", key);
        }
        Commands::Compose {
            easting,
            northing,
            zone,
            size,
            theme,
            refill,
            gray,
            out,
        } => {
            let center = UtmPoint::new(*easting, *northing, *zone);
            let mut composer = RasterComposer::new(*size);
            composer.select_theme(*theme)?;
            if *refill {
                composer.refill(&mut manager, &center)?;
            } else {
                composer.fill(&mut manager, &center)?;
            }
            save_composed(&composer, &center, *size, *gray, out)?;
            let nw = composer.center()?;
            info!(left = composer.left()?, top = composer.top()?, raster_center = ?nw, "composed");
            println!("{} -> {}", composer.theme().name, out.display());
        }
        Commands::Themes { .. } => {}
    }

    manager.close()?;
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Crop a `size` square centered on `center` out of the filled raster.
fn save_composed(
    composer: &RasterComposer,
    center: &UtmPoint,
    size: u32,
    gray: bool,
    out: &Path,
) -> Result<()> {
    let mpp = composer.meters_per_pixel();
    let raster = composer.raster();
    let edge = size.min(raster.width()).min(raster.height());
    let col = (center.easting - composer.left()? as f64) / mpp - f64::from(edge) / 2.0;
    let row = (composer.top()? as f64 - center.northing) / mpp - f64::from(edge) / 2.0;
    let x = (col.max(0.0) as u32).min(raster.width() - edge);
    let y = (row.max(0.0) as u32).min(raster.height() - edge);
    debug!(x, y, edge, "cropping raster");

    if gray {
        let img = composer.as_gray_image()?;
        imageops::crop_imm(&img, x, y, edge, edge).to_image().save(out)?;
    } else {
        imageops::crop_imm(raster, x, y, edge, edge).to_image().save(out)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct InfoReport<'a> {
    dir: &'a Path,
    temporary: bool,
    #[serde(flatten)]
    stats: StoreStats,
}

fn print_info(manager: &TileManager, json: bool) -> Result<()> {
    let stats = manager.lock().store().stats().map_err(TileError::from)?;
    let report = InfoReport {
        dir: manager.dir(),
        temporary: manager.is_temporary(),
        stats,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Cache directory: {}", report.dir.display());
    if report.temporary {
        println!("  (temporary, removed on exit)");
    }
    println!(
        "Index: {} records ({} live, {} invalidated), capacity {}",
        report.stats.entries, report.stats.live, report.stats.tombstones, report.stats.index_capacity
    );
    for shard in &report.stats.shards {
        println!("  shard {:>3}: {:>12} bytes  {}", shard.id, shard.bytes, shard.path.display());
    }
    Ok(())
}

fn print_themes(json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(Theme::all())?);
        return Ok(());
    }
    println!("{:>3}  {:<12} {:<10} {:>8} {:>6} {:>8}", "id", "name", "backend", "m/px", "edge", "tile m");
    for t in Theme::all() {
        println!(
            "{:>3}  {:<12} {:<10} {:>8} {:>6} {:>8}",
            t.id,
            t.name,
            t.backend.as_str(),
            t.meters_per_pixel,
            t.edge_px,
            t.tile_meters
        );
    }
    Ok(())
}
