use clap::{Parser, Subcommand};
use mep_common::db::core::Scene;
use mep_common::db::parser::scene as scene_parser;
use mep_common::geom::coord::GridCoord;
use mep_common::util::config::Config;
use mep_common::util::generator::{self, SceneParams};
use mep_common::util::logger;
use mep_common::util::visualization::{self, PaintRoute};
use mep_router::graph::Connectivity;
use mep_router::grid::{SpaceModel, SpaceQuery};
use mep_router::{RoutingReport, RoutingSession, check};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Route {
        /// Overrides `input.scene_file`.
        #[arg(long)]
        scene: Option<String>,
        /// Overrides `input.report_file`.
        #[arg(long)]
        output: Option<String>,
        /// Overrides `input.image_file`. One PNG is written per layer.
        #[arg(long)]
        image: Option<String>,
        /// Verify the report against the space before exiting.
        #[arg(long)]
        check: bool,
    },
    Generate {
        #[arg(long, default_value_t = 40.0)]
        size: f64,
        #[arg(long, default_value_t = 30)]
        obstacles: usize,
        #[arg(long, default_value_t = 20)]
        nets: usize,
        #[arg(long, default_value_t = 1)]
        layers: u8,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long, default_value = "inputs/scene.json")]
        output: String,
    },
}

fn main() -> anyhow::Result<()> {
    logger::init();
    let args = Args::parse();

    let mut config = if args.config.exists() {
        log::info!("Loading configuration from {:?}", args.config);
        let config_str = std::fs::read_to_string(&args.config)
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;
        toml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config TOML: {}", e))?
    } else {
        log::warn!(
            "Configuration file {:?} not found. Using internal defaults.",
            args.config
        );
        Config::default()
    };

    let command = args.command.unwrap_or(Commands::Route {
        scene: None,
        output: None,
        image: None,
        check: false,
    });

    match command {
        Commands::Generate {
            size,
            obstacles,
            nets,
            layers,
            seed,
            output,
        } => {
            prepare_output_dir(&output)?;
            log::info!(
                "Generating random scene (Size: {:.0}, Obstacles: {}, Nets: {}, Layers: {})...",
                size,
                obstacles,
                nets,
                layers
            );
            let params = SceneParams {
                size,
                obstacles,
                nets,
                layers,
                seed,
            };
            generator::write_scene(&output, &generator::random_scene(&params))?;
            log::info!("Generated: {}", output);
        }
        Commands::Route {
            scene,
            output,
            image,
            check,
        } => {
            if let Some(s) = scene {
                config.input.scene_file = s;
            }
            if let Some(o) = output {
                config.input.report_file = o;
            }
            if image.is_some() {
                config.input.image_file = image;
            }
            if !Path::new(&config.input.scene_file).exists() {
                return Err(anyhow::anyhow!(
                    "Input scene file missing: {}",
                    config.input.scene_file
                ));
            }
            prepare_output_dir(&config.input.report_file)?;

            if let Err(e) = run_routing(&config, check) {
                log::error!("{}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn prepare_output_dir(path_str: &str) -> anyhow::Result<()> {
    if let Some(parent) = Path::new(path_str).parent()
        && !parent.exists()
        && !parent.as_os_str().is_empty()
    {
        log::info!("Creating output directory: {:?}", parent);
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn run_routing(config: &Config, verify: bool) -> anyhow::Result<()> {
    log::info!("Parsing scene: {}", config.input.scene_file);
    let scene: Scene = scene_parser::parse(&config.input.scene_file)
        .map_err(|e| anyhow::anyhow!("Invalid scene '{}': {}", config.input.scene_file, e))?;

    let mut session = RoutingSession::new(&scene, config)?;

    log::info!("Starting Routing...");
    let report = session
        .run_with_progress(&scene.nets, |p| {
            eprint!(
                "\r\x1b[36m[{}/{}]\x1b[0m routed {} unroutable {}",
                p.processed, p.total, p.routed, p.unroutable
            );
            if p.processed == p.total {
                eprintln!();
            }
        })?;

    log::info!("Writing report to {}", config.input.report_file);
    report.write_json(&config.input.report_file)?;

    if let Some(image) = &config.input.image_file {
        prepare_output_dir(image)?;
        log::info!("Generating routed visualization...");
        draw_report(session.space(), &report, image)?;
    }

    if verify {
        let connectivity = Connectivity::from_degree(config.graph.connectivity)?;
        check::run(session.space(), &scene.nets, &report, connectivity)
            .map_err(|e| anyhow::anyhow!("Verification Failed: {}", e))?;
    }

    Ok(())
}

fn draw_report(space: &SpaceModel, report: &RoutingReport, image: &str) -> anyhow::Result<()> {
    let layers = space.layers();
    for z in 0..layers {
        let routes: Vec<PaintRoute> = report
            .routed()
            .flat_map(|(_, r)| {
                let violation = r.path.clearance_violation.is_some();
                runs_on_layer(&r.path.nodes, z)
                    .into_iter()
                    .map(move |points| PaintRoute {
                        discipline: r.discipline,
                        points,
                        violation,
                    })
            })
            .collect();
        let filename = layer_filename(image, z, layers);
        visualization::draw_layer(&space.paint_layer(z), &routes, &filename, 8)?;
        log::info!("Wrote {}", filename);
    }
    Ok(())
}

/// Maximal stretches of `nodes` that stay on layer `z`, in cell coordinates.
fn runs_on_layer(nodes: &[GridCoord], z: u8) -> Vec<Vec<(f64, f64)>> {
    let mut runs = Vec::new();
    let mut current = Vec::new();
    for c in nodes {
        if c.z == z {
            current.push((c.x as f64, c.y as f64));
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn layer_filename(image: &str, z: u8, layers: u8) -> String {
    if layers <= 1 {
        return image.to_string();
    }
    let path = Path::new(image);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("routed");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("png");
    path.with_file_name(format!("{}_L{}.{}", stem, z, ext))
        .to_string_lossy()
        .into_owned()
}
