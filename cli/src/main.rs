use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::*;
use log::*;
use structopt::*;

use zipper::scheduler::ExtractionState;
use zipper::*;

/// How often the `remaining/total` line is redrawn
const PROGRESS_INTERVAL: Duration = Duration::from_millis(30);

#[derive(Debug, StructOpt)]
#[structopt(
    name = "zipper",
    about = "Extracts .zip files using every core you've got",
    after_help = "EXAMPLES:\n    \
                  zipper -i foo.zip -o foo/    Extract foo.zip into foo/\n    \
                  zipper -c foo.zip -t foo/    Compress foo/ into foo.zip (not implemented yet)"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Don't log anything, not even warnings
    #[structopt(short, long)]
    quiet: bool,

    /// Archive to extract
    #[structopt(short, long, requires = "output", conflicts_with_all = &["create", "target"])]
    input: Option<PathBuf>,

    /// Directory to extract into (created if needed)
    #[structopt(short, long, requires = "input")]
    output: Option<PathBuf>,

    /// Archive to create
    #[structopt(short = "c", long, requires = "target")]
    create: Option<PathBuf>,

    /// File or directory to compress
    #[structopt(short, long, requires = "create")]
    target: Option<PathBuf>,

    /// Worker threads to extract with (at most 8; defaults to one per core)
    #[structopt(short, long)]
    jobs: Option<usize>,
}

fn main() {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1).quiet(args.quiet);
    if let Err(e) = errlog.init() {
        eprintln!("Couldn't start logging: {}", e);
    }

    if let Err(e) = run(args) {
        eprintln!("Error: {:#}", e);
        process::exit(-1);
    }
}

fn run(args: Opt) -> Result<()> {
    match args {
        Opt {
            input: Some(input),
            output: Some(output),
            jobs,
            ..
        } => extract(&input, &output, jobs),
        Opt {
            create: Some(archive),
            target: Some(target),
            ..
        } => compress(&archive, &target),
        _ => bail!("Pass either -i <archive> -o <dir> or -c <archive> -t <source> (see --help)"),
    }
}

fn extract(input: &Path, output: &Path, jobs: Option<usize>) -> Result<()> {
    fs::File::open(input).with_context(|| format!("Can't read {}", input.display()))?;
    if output.exists() && !output.is_dir() {
        bail!("{} exists and isn't a directory", output.display());
    }

    let mut options = ExtractOptions::default();
    if let Some(j) = jobs {
        options = options.workers(j);
    }

    let start = Instant::now();
    let mut engine = ExtractionEngine::with_options(input, output, options);
    engine
        .prepare()
        .with_context(|| format!("Couldn't extract {}", input.display()))?;
    println!("{} files will be extracted", engine.total_count());

    let progress = engine.progress();
    {
        let progress = Arc::clone(&progress);
        ctrlc::set_handler(move || progress.cancel()).context("Couldn't install Ctrl-C handler")?;
    }

    let finished = Arc::new(AtomicBool::new(false));
    let printer = {
        let finished = Arc::clone(&finished);
        thread::spawn(move || print_progress(&progress, &finished))
    };

    let result = engine.run();
    finished.store(true, Ordering::Release);
    let _ = printer.join();
    println!();

    let report = match result {
        Err(ExtractError::InterruptedWait) => bail!("Operation cancelled"),
        other => other.with_context(|| format!("Couldn't extract {}", input.display()))?,
    };

    if !report.failed.is_empty() {
        warn!(
            "{} of {} files couldn't be extracted:",
            report.failed.len(),
            engine.total_count()
        );
        for failure in &report.failed {
            warn!("    {}: {}", failure.entry, failure.error);
        }
    }
    println!("Done in {} s", start.elapsed().as_secs());
    Ok(())
}

fn print_progress(progress: &ExtractionState, finished: &AtomicBool) {
    let stdout = io::stdout();
    loop {
        let done = finished.load(Ordering::Acquire);
        {
            let mut out = stdout.lock();
            let _ = write!(out, "\r{}/{}", progress.remaining(), progress.total());
            let _ = out.flush();
        }
        if done {
            return;
        }
        thread::sleep(PROGRESS_INTERVAL);
    }
}

fn compress(archive: &Path, target: &Path) -> Result<()> {
    fs::metadata(target).with_context(|| format!("Can't read {}", target.display()))?;
    warn!(
        "Compressing {} into {} is not implemented",
        target.display(),
        archive.display()
    );
    Ok(())
}
