use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use kernel_playground::config::RenderConfig;
use kernel_playground::mnist::MnistData;
use kernel_playground::render::RenderedLayer;
use kernel_playground::{
    Config, EditRequest, KernelGrid, KernelId, Network, Renderer, Snapshot, Workbench, telemetry,
};
use ndarray_rand::rand::{SeedableRng, rngs::StdRng};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Watch and repaint the convolution kernels of a small digit classifier"
)]
struct Cli {
    /// TOML configuration file; every setting has a default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train on MNIST, drawing the kernels every few epochs and accepting edits on stdin
    Train(TrainArgs),

    /// Draw the kernels of a saved model
    Render(RenderArgs),

    /// Replace one kernel tile of a saved model with the pixels of a PNG
    Edit(EditArgs),

    /// Report test-set accuracy of a saved model
    Evaluate(EvaluateArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Where to save the trained model
    #[arg(long, default_value = "model.json")]
    model: PathBuf,

    /// Continue from a previously saved model instead of a fresh network
    #[arg(long)]
    resume: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<u32>,

    /// Show absolute kernel values instead of the change since two ticks ago
    #[arg(long)]
    no_diff: bool,

    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct RenderArgs {
    #[arg(long)]
    model: PathBuf,

    #[arg(long)]
    out: Option<PathBuf>,

    #[arg(long)]
    scale: Option<u32>,
}

#[derive(Args)]
struct EditArgs {
    #[arg(long)]
    model: PathBuf,

    /// Kernel to replace, e.g. l0-f2-k0
    #[arg(long)]
    kernel: KernelId,

    /// Edited PNG, either a single tile or a whole layer sheet
    #[arg(long)]
    image: PathBuf,

    /// Pixel offset of the tile inside the image, as X,Y
    #[arg(long, value_parser = parse_origin)]
    origin: Option<(usize, usize)>,

    /// Zoom factor the image was exported with
    #[arg(long)]
    scale: Option<u32>,

    /// Write the edited model here instead of over the input
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct EvaluateArgs {
    #[arg(long)]
    model: PathBuf,
}

fn parse_origin(raw: &str) -> Result<(usize, usize), String> {
    let (x, y) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y but got `{raw}`"))?;
    let parse = |v: &str| v.trim().parse::<usize>().map_err(|err| err.to_string());
    Ok((parse(x)?, parse(y)?))
}

fn main() -> anyhow::Result<()> {
    telemetry::init()?;
    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Train(args) => train(config, args),
        Command::Render(args) => render(config, args),
        Command::Edit(args) => edit(config, args),
        Command::Evaluate(args) => evaluate(config, args),
    }
}

fn train(mut config: Config, args: TrainArgs) -> anyhow::Result<()> {
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if args.no_diff {
        config.render.diff = false;
    }
    if let Some(out) = args.out {
        config.render.out_dir = out;
    }

    let mut rng = match config.training.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let network = match &args.resume {
        Some(path) => Network::load(path)
            .with_context(|| format!("loading model from {}", path.display()))?,
        None => config.network.build()?,
    };
    let mut data = MnistData::load(
        &config.data.dir,
        config.data.train_limit,
        config.data.test_limit,
    )?;

    let session = Arc::new(Session {
        workbench: Workbench::new(network),
        renderer: Mutex::new(Renderer::new(config.render.history_depth)),
        render: config.render.clone(),
    });
    session.workbench.warm(&mut rng)?;
    listen_for_commands(Arc::clone(&session));

    session.workbench.train(
        &mut data.training_data,
        &data.test_data,
        &config.training,
        &mut rng,
        |tick, grid| {
            if let Err(err) = session.draw(grid) {
                warn!(epoch = tick.epoch, "could not write kernel images: {err:#}");
            }
        },
    )?;

    session
        .workbench
        .with_network(|network| network.save(&args.model))??;
    info!(path = %args.model.display(), "saved model");
    Ok(())
}

// State shared by the training loop and the stdin listener.
struct Session {
    workbench: Workbench,
    renderer: Mutex<Renderer>,
    render: RenderConfig,
}

impl Session {
    // Draw a grid through the shared history and write the sheets to `out_dir`.
    fn draw(&self, grid: &KernelGrid) -> anyhow::Result<()> {
        let layers = self
            .renderer
            .lock()
            .map_err(|_| anyhow!("renderer lock was poisoned"))?
            .render_grid(grid, self.render.diff);
        write_rendered(&self.render.out_dir, &layers, self.render.scale)
    }

    // Commands typed while training runs:
    //   stop                      finish the current epoch, then stop
    //   render                    draw the kernels now instead of waiting for the next tick
    //   edit <kernel> <png> [x y] replace a kernel tile with the pixels of a PNG
    fn handle_command(&self, line: &str) -> anyhow::Result<()> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => {}
            ["stop" | "pause"] => {
                if !self.workbench.control().request_stop() {
                    warn!("training is not running");
                }
            }
            ["render"] => {
                let grid = self.workbench.extract_grid()?;
                self.draw(&grid)?;
                info!(dir = %self.render.out_dir.display(), "rendered kernels");
            }
            ["edit", kernel, image, rest @ ..] => {
                let id: KernelId = kernel.parse()?;
                let pixels = Snapshot::load_png(image, self.render.scale)
                    .with_context(|| format!("reading {image}"))?;
                let request = match rest {
                    [] => EditRequest::new(id, pixels),
                    [x, y] => EditRequest::new(id, pixels).at(x.parse()?, y.parse()?),
                    _ => bail!("usage: edit <kernel> <png> [x y]"),
                };
                self.workbench.apply_edit(&request)?;
            }
            _ => bail!(
                "unknown command `{line}`; try `stop`, `render` or `edit <kernel> <png> [x y]`"
            ),
        }
        Ok(())
    }
}

fn listen_for_commands(session: Arc<Session>) {
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if let Err(err) = session.handle_command(line.trim()) {
                warn!("{err:#}");
            }
        }
    });
}

// Each layer writes its grey sheet and tiles, which are safe to edit and feed back, plus
// `.diff.png` siblings when a diff view exists.
fn write_rendered(out: &Path, layers: &[RenderedLayer], scale: u32) -> anyhow::Result<()> {
    for layer in layers {
        layer
            .save(out, scale)
            .with_context(|| format!("writing layer {} to {}", layer.name, out.display()))?;
    }
    Ok(())
}

fn render(config: Config, args: RenderArgs) -> anyhow::Result<()> {
    let network = Network::load(&args.model)
        .with_context(|| format!("loading model from {}", args.model.display()))?;
    let grid = KernelGrid::extract(&network)?;
    let layers = Renderer::new(config.render.history_depth).render_grid(&grid, false);

    let out = args.out.unwrap_or(config.render.out_dir);
    write_rendered(&out, &layers, args.scale.unwrap_or(config.render.scale))?;
    for layer in &layers {
        info!(
            layer = %layer.name,
            filters = layer.layout.filters,
            channels = layer.layout.channels,
            "rendered"
        );
    }
    Ok(())
}

fn edit(config: Config, args: EditArgs) -> anyhow::Result<()> {
    let mut network = Network::load(&args.model)
        .with_context(|| format!("loading model from {}", args.model.display()))?;
    let pixels = Snapshot::load_png(&args.image, args.scale.unwrap_or(config.render.scale))
        .with_context(|| format!("reading {}", args.image.display()))?;
    let (x, y) = args.origin.unwrap_or((0, 0));

    let mut grid = KernelGrid::extract(&network)?;
    grid.ingest_edit(&EditRequest::new(args.kernel, pixels).at(x, y))?;
    grid.write_back(&mut network)?;

    let output = args.output.unwrap_or(args.model);
    network.save(&output)?;
    info!(kernel = %args.kernel, path = %output.display(), "saved edited model");
    Ok(())
}

fn evaluate(config: Config, args: EvaluateArgs) -> anyhow::Result<()> {
    let network = Network::load(&args.model)
        .with_context(|| format!("loading model from {}", args.model.display()))?;
    let data = MnistData::load(&config.data.dir, Some(0), config.data.test_limit)?;
    let correct = network.evaluate(&data.test_data)?;
    println!("{correct} / {}", data.test_data.len());
    Ok(())
}
