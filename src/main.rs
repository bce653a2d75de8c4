use clap::Parser;
use pewr::{io, Config, OutputSchedule, Params, PewrError, Reconstructor, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Parallel exit-wave reconstruction from a defocus series")]
struct Cli {
    /// Reconstruction command file; plane, guess and output paths are
    /// resolved relative to its directory
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(&Cli::parse()) {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let started = Instant::now();
    let cfg = Config::from_file(&cli.config)?;

    if let Some(dir) = cli.config.parent() {
        if !dir.as_os_str().is_empty() {
            std::env::set_current_dir(dir).map_err(|e| PewrError::io(dir, e))?;
        }
    }

    if let Some(threads) = cfg.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| PewrError::Config(format!("cannot size the worker pool: {e}")))?;
    }

    // First signal requests a graceful stop, observed between iterations; a
    // second one aborts outright.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            if stop.swap(true, Ordering::SeqCst) {
                eprintln!("second interrupt, aborting");
                std::process::exit(1);
            }
            eprintln!("interrupt received, finishing the current iteration");
        })
        .map_err(|e| PewrError::Signal(e.to_string()))?;
    }

    let mut series = Vec::with_capacity(cfg.nplanes);
    for (path, &fval) in cfg.planes.iter().zip(&cfg.fvals) {
        series.push((fval, io::read_intensity(path, cfg.pixel_type, cfg.size)?));
    }
    let guess = match &cfg.guess {
        Some(spec) => Some((
            io::read_guess(&spec.path, spec.ty, cfg.padding)?,
            spec.start_iter,
        )),
        None => None,
    };

    let mut rec = Reconstructor::new(&Params::from(&cfg), series, guess)?;
    tracing::info!(
        "loaded {} planes of {}x{} in {} ms",
        cfg.nplanes,
        cfg.size,
        cfg.size,
        started.elapsed().as_millis()
    );

    let mut schedule = OutputSchedule::new(
        cfg.outputfreq,
        cfg.outputgeom,
        cfg.outputlast,
        cfg.iters,
        rec.start_iter(),
    );
    let prefix = cfg.output.clone();
    rec.run(cfg.iters, &mut schedule, &stop, |iter, wave| {
        io::write_exit_wave(Path::new(&format!("{prefix}.{iter}")), wave)
    })?;

    tracing::info!("completed in {} s", started.elapsed().as_secs());
    Ok(())
}
