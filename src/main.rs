use chrono::Utc;
use clap::Parser;
use offsite_backup::backup::backup_config::{BackupConfig, BackupJob};
use offsite_backup::backup::result_error::result::Result;
use offsite_backup::backup::source::BackupSource;
use std::path::PathBuf;
use std::process::exit;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};

/// Archive, encrypt and upload directories to offsite storage
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,

    /// Only log warnings and errors, no progress
    #[arg(short, long)]
    quiet: bool,

    /// Print archives past their retention horizon instead of backing up
    #[arg(long)]
    list_expired: bool,

    /// Directories to back up
    #[arg(required_unless_present = "list_expired")]
    dirs: Vec<PathBuf>,
}

fn run(args: &Args, config: BackupConfig) -> Result<bool> {
    let job = BackupJob::new(config)?;

    if args.list_expired {
        for record in job.expired_backups(Utc::now())? {
            println!("{},{}", record.description(), record.remote_id());
        }
        return Ok(true);
    }

    let timestamp = Utc::now();
    let mut failed = 0;
    let mut sources = Vec::with_capacity(args.dirs.len());
    for dir in &args.dirs {
        match BackupSource::from_dir(dir, timestamp) {
            Ok(source) => sources.push(source),
            Err(e) => {
                error!("{e}");
                failed += 1;
            }
        }
    }
    failed += job.run_all(&sources).iter().filter(|r| r.is_err()).count();
    info!(
        "{} of {} backups succeeded",
        args.dirs.len() - failed,
        args.dirs.len()
    );
    Ok(failed == 0)
}

fn main() {
    let args = Args::parse();

    let max_level = if args.quiet {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt().with_max_level(max_level).init();

    let res = BackupConfig::load(&args.config)
        .map(|config| {
            let quiet = args.quiet || config.quiet();
            config.with_quiet(quiet)
        })
        .and_then(|config| run(&args, config));

    match res {
        Ok(true) => {}
        Ok(false) => exit(1),
        Err(e) => {
            error!("{e}");
            exit(1)
        }
    }
}
