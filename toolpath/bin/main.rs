use std::{
    fs::File,
    io::{stdout, BufReader, BufWriter, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use common::{misc::human_duration, progress::Progress};
use toolpath::{dispatch::DispatchPool, mesh::load_stl, pipeline};

mod args;
use args::Args;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = args.job_config()?;

    let mut file = BufReader::new(
        File::open(&args.mesh).with_context(|| format!("Failed to open `{}`", args.mesh.display()))?,
    );
    let mesh = load_stl(&mut file)?;
    println!(
        "Loaded `{}`. {{ face: {} }}",
        args.mesh.display(),
        mesh.triangle_count()
    );

    let now = Instant::now();
    let mut pool = DispatchPool::new(&config.pool)?;
    let progress = Progress::new();

    // The pool is driven from this thread, so the display runs on another.
    let done = Arc::new(AtomicBool::new(false));
    let printer = {
        let (progress, done) = (progress.clone(), done.clone());
        thread::spawn(move || -> std::io::Result<()> {
            while !done.load(Ordering::Relaxed) {
                print!(
                    "\rUnits: {}/{}, {:.1}%",
                    progress.completed(),
                    progress.total(),
                    progress.progress() * 100.0
                );
                stdout().flush()?;
                thread::sleep(Duration::from_millis(100));
            }
            Ok(())
        })
    };

    let paths = pipeline::run(&mut pool, &mesh, &config, &progress);
    done.store(true, Ordering::Relaxed);
    if let Ok(result) = printer.join() {
        result?;
    }
    let paths = paths?;

    let output = BufWriter::new(
        File::create(&args.output)
            .with_context(|| format!("Failed to create `{}`", args.output.display()))?,
    );
    serde_json::to_writer_pretty(output, &paths)?;

    println!(
        "\nDone. {} paths. Elapsed: {}",
        paths.len(),
        human_duration(now.elapsed())
    );

    Ok(())
}
