use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use mandelbench::{BenchConfig, BenchmarkController, Palette, RenderParams, Strategy, gpu};

#[derive(Parser, Debug)]
#[command(name = "mandelbench", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the strategies and whether each can run here.
    List(ListArgs),
    /// Render one frame with one strategy and write it as a PNG.
    Render(RenderArgs),
    /// Time every selected strategy and report percentiles.
    Bench(BenchArgs),
}

#[derive(Parser, Debug)]
struct ListArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug, Clone)]
struct ParamArgs {
    /// Frame width in pixels.
    #[arg(long)]
    width: Option<u32>,

    /// Frame height in pixels.
    #[arg(long)]
    height: Option<u32>,

    /// Escape iteration cap (the selector offers powers of two from 8 to 16384).
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Force one palette for both CPU kernels.
    #[arg(long, value_enum)]
    palette: Option<PaletteChoice>,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Strategy id (see `mandelbench list`).
    #[arg(long, default_value = "native-single")]
    strategy: Strategy,

    /// Output PNG path.
    #[arg(long)]
    out: PathBuf,

    #[command(flatten)]
    params: ParamArgs,

    /// Give up after this many milliseconds.
    #[arg(long, default_value_t = 120_000)]
    timeout_ms: u64,
}

#[derive(Parser, Debug)]
struct BenchArgs {
    /// JSON run configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Strategy ids to run (repeatable). Defaults to every strategy.
    #[arg(long = "strategy")]
    strategies: Vec<Strategy>,

    #[command(flatten)]
    params: ParamArgs,

    /// Untimed runs per strategy.
    #[arg(long)]
    warmup: Option<u32>,

    /// Timed runs per strategy.
    #[arg(long)]
    repeats: Option<u32>,

    /// Print the report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PaletteChoice {
    Ember,
    Verdant,
}

impl From<PaletteChoice> for Palette {
    fn from(p: PaletteChoice) -> Self {
        match p {
            PaletteChoice::Ember => Palette::Ember,
            PaletteChoice::Verdant => Palette::Verdant,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::List(args) => cmd_list(args),
        Command::Render(args) => cmd_render(args),
        Command::Bench(args) => cmd_bench(args),
    }
}

fn apply_params(base: RenderParams, args: &ParamArgs) -> anyhow::Result<RenderParams> {
    let p = RenderParams {
        width: args.width.unwrap_or(base.width),
        height: args.height.unwrap_or(base.height),
        max_iterations: args.max_iterations.unwrap_or(base.max_iterations),
        viewport: base.viewport,
    };
    p.validate()?;
    if !mandelbench::MAX_ITERATION_PRESETS.contains(&p.max_iterations) {
        tracing::info!(
            max_iterations = p.max_iterations,
            "iteration cap is not one of the selector presets"
        );
    }
    Ok(p)
}

fn controller(palette: Option<Palette>) -> BenchmarkController {
    match palette {
        Some(p) => BenchmarkController::new().with_palette(p),
        None => BenchmarkController::new(),
    }
}

fn runnable(strategy: Strategy) -> bool {
    strategy.descriptor().backend != mandelbench::Backend::Gpu || gpu::is_available()
}

fn cmd_list(args: ListArgs) -> anyhow::Result<()> {
    if args.json {
        let rows: Vec<_> = Strategy::ALL
            .iter()
            .map(|s| {
                json!({
                    "id": s.id(),
                    "label": s.label(),
                    "descriptor": s.descriptor(),
                    "available": runnable(*s),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for s in Strategy::ALL {
        let note = if runnable(s) { "" } else { "  (unavailable)" };
        println!("{:22} {}{note}", s.id(), s.label());
    }
    Ok(())
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let params = apply_params(RenderParams::default(), &args.params)?;
    let mut c = controller(args.params.palette.map(Palette::from));
    c.select_strategy(args.strategy)
        .with_context(|| format!("select strategy '{}'", args.strategy))?;
    c.set_params(params)?;

    let t0 = Instant::now();
    c.start()?;
    c.wait_idle(Duration::from_millis(args.timeout_ms))
        .with_context(|| format!("render with '{}'", args.strategy))?;
    let wall = t0.elapsed();

    let frame = c.presenter().snapshot();
    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    image::save_buffer_with_format(
        &args.out,
        &frame.data,
        frame.width,
        frame.height,
        image::ColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .with_context(|| format!("write png '{}'", args.out.display()))?;

    eprintln!(
        "wrote {} ({}x{}, {} in {})",
        args.out.display(),
        frame.width,
        frame.height,
        args.strategy.label(),
        fmt_ms(wall)
    );
    Ok(())
}

fn bench_config(args: &BenchArgs) -> anyhow::Result<BenchConfig> {
    let mut cfg = match &args.config {
        Some(path) => BenchConfig::from_json_path(path)?,
        None => BenchConfig::default(),
    };
    cfg.params = apply_params(cfg.params, &args.params)?;
    if !args.strategies.is_empty() {
        cfg.strategies = args.strategies.clone();
    }
    if let Some(w) = args.warmup {
        cfg.warmup = w;
    }
    if let Some(r) = args.repeats {
        cfg.repeats = r;
    }
    if let Some(p) = args.params.palette {
        cfg.palette = Some(p.into());
    }
    cfg.validate()?;
    Ok(cfg)
}

fn run_once(c: &mut BenchmarkController, timeout: Duration) -> anyhow::Result<Duration> {
    let t0 = Instant::now();
    c.start()?;
    c.wait_idle(timeout)?;
    Ok(t0.elapsed())
}

fn cmd_bench(args: BenchArgs) -> anyhow::Result<()> {
    let cfg = bench_config(&args)?;
    let params = cfg.params;
    eprintln!(
        "bench: {w}x{h}, max_iterations={it}, warmup={warmup}, repeats={repeats} ({profile} build)",
        w = params.width,
        h = params.height,
        it = params.max_iterations,
        warmup = cfg.warmup,
        repeats = cfg.repeats,
        profile = if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    );

    let mut c = controller(cfg.palette);
    c.set_params(params)?;

    let mut report = Vec::new();
    for &strategy in &cfg.strategies {
        if !runnable(strategy) {
            eprintln!("  {:22} skipped (no gpu adapter)", strategy.id());
            continue;
        }
        c.select_strategy(strategy)
            .with_context(|| format!("select strategy '{strategy}'"))?;

        for _ in 0..cfg.warmup {
            run_once(&mut c, cfg.timeout())
                .with_context(|| format!("warmup run of '{strategy}'"))?;
        }
        let mut runs = Vec::with_capacity(cfg.repeats as usize);
        for _ in 0..cfg.repeats {
            runs.push(
                run_once(&mut c, cfg.timeout())
                    .with_context(|| format!("timed run of '{strategy}'"))?,
            );
        }
        runs.sort();
        report.push((strategy, runs));
    }

    if args.json {
        let rows: Vec<_> = report
            .iter()
            .map(|(s, v)| {
                json!({
                    "strategy": s.id(),
                    "label": s.label(),
                    "runs": v.len(),
                    "p50_ms": ms(p(v, 0.50)),
                    "p90_ms": ms(p(v, 0.90)),
                    "p99_ms": ms(p(v, 0.99)),
                    "max_ms": ms(v.last().copied().unwrap_or_default()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json!({ "params": params, "results": rows }))?);
        return Ok(());
    }

    eprintln!("\npercentiles across runs (p50/p90/p99/max):");
    for (s, v) in &report {
        eprintln!(
            "  {name:22} p50={p50:>12}  p90={p90:>12}  p99={p99:>12}  max={max:>12}",
            name = s.id(),
            p50 = fmt_ms(p(v, 0.50)),
            p90 = fmt_ms(p(v, 0.90)),
            p99 = fmt_ms(p(v, 0.99)),
            max = fmt_ms(v.last().copied().unwrap_or_default()),
        );
    }
    Ok(())
}

/// Nearest-rank percentile of a sorted sample.
fn p(v: &[Duration], p: f64) -> Duration {
    if v.is_empty() {
        return Duration::ZERO;
    }
    let n = v.len();
    let rank = (p * (n as f64)).ceil().clamp(1.0, n as f64) as usize;
    v[rank - 1]
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn fmt_ms(d: Duration) -> String {
    format!("{:.3}ms", ms(d))
}
