use anyhow::{bail, Context, Result};
use annotations::palette::track_color;
use annotations::{CancelToken, ClassId, ClassTable, CollisionPolicy, MutationReport, Rect, ScanReport, TrackId};
use clap::{Parser, Subcommand};
use detect::CommandDetector;
use session::Session;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "trackmark", about = "Per-frame box annotations with persistent track ids")]
struct Opts {
    /// Folder of image frames
    #[arg(long, short)]
    images: PathBuf,
    /// Record folder; derived from the image folder when omitted
    #[arg(long)]
    records: Option<PathBuf>,
    /// Config file; defaults to the per-user config
    #[arg(long)]
    config: Option<PathBuf>,
    /// More logging (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every track with its class
    Tracks,
    /// List the boxes of one frame
    Show { frame: usize },
    /// Add a box; starts a new track unless --track is given
    Add {
        frame: usize,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        #[arg(long)]
        class: String,
        #[arg(long)]
        track: Option<TrackId>,
    },
    /// Move or resize a box
    Move { frame: usize, id: u64, x1: f64, y1: f64, x2: f64, y2: f64 },
    /// Remove a box
    Delete { frame: usize, id: u64 },
    /// Change the class of one box
    SetClass { frame: usize, id: u64, class: String },
    /// Move one box to another track
    SetTrack { frame: usize, id: u64, track: TrackId },
    /// Fill the frames between the keyframes of a track
    Interpolate { track: TrackId },
    /// Give every box of a track a new id
    Rename {
        old: TrackId,
        new: TrackId,
        /// Merge into the new id even if it is already in use
        #[arg(long)]
        merge: bool,
    },
    /// Set the class of every box of a track
    Reclass { track: TrackId, class: String },
    /// Exchange two track ids everywhere
    Swap { a: TrackId, b: TrackId },
    /// Run the configured detector on a frame and merge the result
    Detect {
        frame: usize,
        /// Seconds to wait for the detector
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
    /// Rebuild the track index and report unreadable record files
    Check,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let default_level = match opts.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .try_init();

    let config = AppConfig::load(opts.config.as_deref())?;
    let classes = match &config.class_table {
        Some(path) => ClassTable::load(path).with_context(|| format!("loading class table {}", path.display()))?,
        None => ClassTable::default(),
    };
    let (mut session, scan) = Session::open(&opts.images, opts.records.as_deref(), config.merge)
        .with_context(|| format!("opening {}", opts.images.display()))?;
    print_failures(&scan);

    match opts.command {
        Command::Tracks => {
            for (track, class) in session.index().entries() {
                let [r, g, b] = track_color(*track);
                println!("{track:>6}  {:<20} #{r:02x}{g:02x}{b:02x}", classes.label(*class));
            }
            println!("next free track id: {}", session.index().next_suggested());
        }
        Command::Show { frame } => {
            session.goto(frame)?;
            show_frame(&session, &classes);
        }
        Command::Add { frame, x1, y1, x2, y2, class, track } => {
            let class = resolve_class(&class, &classes)?;
            session.goto(frame)?;
            let id = session.add_box(Rect::new(x1, y1, x2, y2), class, track)?;
            session.save()?;
            let record = session.boxes()[&id];
            println!("added box {id} on track {}", record.track_id);
        }
        Command::Move { frame, id, x1, y1, x2, y2 } => {
            session.goto(frame)?;
            require(session.update_box(id, Rect::new(x1, y1, x2, y2))?, frame, id)?;
            session.save()?;
        }
        Command::Delete { frame, id } => {
            session.goto(frame)?;
            require(session.delete_box(id)?, frame, id)?;
            session.save()?;
        }
        Command::SetClass { frame, id, class } => {
            let class = resolve_class(&class, &classes)?;
            session.goto(frame)?;
            require(session.set_class(id, class)?, frame, id)?;
            session.save()?;
        }
        Command::SetTrack { frame, id, track } => {
            session.goto(frame)?;
            require(session.set_track(id, track)?, frame, id)?;
            session.save()?;
        }
        Command::Interpolate { track } => {
            let report = session.interpolate(track, &CancelToken::new())?;
            if report.insufficient_keyframes() {
                println!("track {track} has {} keyframe(s), nothing to interpolate", report.keyframes);
            } else {
                println!("inserted {} box(es) from {} keyframes", report.inserted, report.keyframes);
            }
            for failure in &report.failures {
                eprintln!("skipped {}: {}", failure.path.display(), failure.error);
            }
        }
        Command::Rename { old, new, merge } => {
            let policy = if merge { CollisionPolicy::Merge } else { CollisionPolicy::Reject };
            let report = session.rename_track(old, new, policy, &CancelToken::new())?;
            print_mutation(&report);
        }
        Command::Reclass { track, class } => {
            let class = resolve_class(&class, &classes)?;
            let report = session.reclassify_track(track, class, &CancelToken::new())?;
            print_mutation(&report);
        }
        Command::Swap { a, b } => {
            let report = session.swap_tracks(a, b, &CancelToken::new())?;
            print_mutation(&report);
        }
        Command::Detect { frame, timeout } => {
            let Some(section) = &config.detector else { bail!("no detector configured") };
            let detector = CommandDetector::locate(&section.program, section.args.clone(), section.detector_config())?;
            session.attach_detector(Arc::new(detector));
            session.goto(frame)?;
            session.request_detection()?;
            match session.wait_detection(Duration::from_secs(timeout))? {
                Some(outcome) => {
                    session.save()?;
                    println!(
                        "added {} box(es): {} continued, {} new; dropped {} duplicate, {} overlapping, {} too small",
                        outcome.added.len(),
                        outcome.inherited,
                        outcome.new_tracks,
                        outcome.duplicates,
                        outcome.suppressed,
                        outcome.degenerate,
                    );
                }
                None if session.is_busy() => bail!("detector did not finish within {timeout}s"),
                None => println!("detection produced no result"),
            }
            show_frame(&session, &classes);
        }
        Command::Check => {
            let report = session.reconcile()?;
            print_failures(&report);
            println!("{} record file(s), {} track(s)", report.files_read, session.index().len());
            if !report.is_clean() {
                bail!("{} unreadable record file(s)", report.failures.len());
            }
        }
    }
    info!("done");
    Ok(())
}

/// Accepts a class id or a name from the class table.
fn resolve_class(arg: &str, classes: &ClassTable) -> Result<ClassId> {
    if let Ok(id) = arg.parse::<ClassId>() {
        return Ok(id);
    }
    classes.id_of(arg).with_context(|| format!("unknown class {arg:?}"))
}

fn require(found: bool, frame: usize, id: u64) -> Result<()> {
    if !found {
        bail!("frame {frame} has no box {id}");
    }
    Ok(())
}

fn show_frame(session: &Session, classes: &ClassTable) {
    let name = session.current_frame().map(|f| f.to_string()).unwrap_or_default();
    println!("frame {} ({name})", session.cursor());
    for (id, record) in session.boxes() {
        let g = record.geometry;
        println!(
            "{id:>4}  track {:>5}  {:<20} [{:.1}, {:.1}, {:.1}, {:.1}]",
            record.track_id,
            classes.label(record.class_id),
            g.x1,
            g.y1,
            g.x2,
            g.y2
        );
    }
}

fn print_mutation(report: &MutationReport) {
    println!("{} box(es) changed in {} file(s)", report.records_changed, report.files_rewritten);
    for failure in &report.failures {
        eprintln!("skipped {}: {}", failure.path.display(), failure.error);
    }
    if report.cancelled {
        eprintln!("cancelled before finishing");
    }
}

fn print_failures(report: &ScanReport) {
    for failure in &report.failures {
        eprintln!("unreadable {}: {}", failure.path.display(), failure.error);
    }
}
