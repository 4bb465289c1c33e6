//! `btrfs-dedup`: incremental Btrfs extent deduplication agent.
//!
//! Subcommands: `scan`, `dedup`, `dedup-files`, `show`. Option parsing here is
//! deliberately manual — a handful of long flags don't need an argument-parsing crate.

use std::collections::HashMap;
use std::env;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::exit;
use std::time::SystemTime;

use dedup::config::resolve_state_dir;
use dedup::error::{DedupError, Kind};
use dedup::ioctl::RealBtrfs;
use dedup::locker::LockRequest;
use dedup::orchestrator::{classes_for_pass, process_class, scan_volume, PassOptions, PassSummary};
use dedup::store::Store;
use dedup::volume::{DefaultVolumeSource, ResolvedVolume, Volume, VolumeSource};

fn print_usage() {
    eprintln!("Usage:");
    eprintln!(" btrfs-dedup scan [VOLUME...]");
    eprintln!(" btrfs-dedup dedup [VOLUME...] [--no-crossvol] [--defrag] [--size-cutoff=N]");
    eprintln!(" btrfs-dedup dedup-files FILE FILE...");
    eprintln!(" btrfs-dedup show");
    eprintln!();
    eprintln!("Options:");
    eprintln!(" --state-dir=DIR:\tuse DIR instead of the default state directory");
    eprintln!(" --no-crossvol:\tnever clone across subvolume boundaries");
    eprintln!(" --defrag:\tdefragment both sides before comparing");
    eprintln!(" --size-cutoff=N:\tignore files smaller than N bytes");
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("btrfs-dedup: error: {msg}");
    exit(1);
}

fn fail_dedup(err: DedupError) -> ! {
    let code = match err.kind() {
        Kind::StoreError | Kind::Unsupported | Kind::Permission => 2,
        _ => 1,
    };
    eprintln!("btrfs-dedup: error: {err}");
    exit(code);
}

struct Flags {
    state_dir: Option<PathBuf>,
    no_crossvol: bool,
    defrag: bool,
    size_cutoff: u64,
    positionals: Vec<String>,
}

fn parse_flags(args: impl Iterator<Item = String>) -> Flags {
    let mut flags = Flags {
        state_dir: None,
        no_crossvol: false,
        defrag: false,
        size_cutoff: 0,
        positionals: Vec::new(),
    };
    for arg in args {
        if let Some(v) = arg.strip_prefix("--state-dir=") {
            flags.state_dir = Some(PathBuf::from(v));
        } else if arg == "--no-crossvol" {
            flags.no_crossvol = true;
        } else if arg == "--defrag" {
            flags.defrag = true;
        } else if let Some(v) = arg.strip_prefix("--size-cutoff=") {
            flags.size_cutoff = v
                .parse()
                .unwrap_or_else(|_| fail(format!("invalid --size-cutoff value `{v}`")));
        } else {
            flags.positionals.push(arg);
        }
    }
    flags
}

fn resolve_targets(source: &DefaultVolumeSource<'_, RealBtrfs>, refs: &[String]) -> Vec<ResolvedVolume> {
    if refs.is_empty() {
        source.list_mounted().unwrap_or_else(|e| fail_dedup(e))
    } else {
        refs.iter()
            .map(|r| source.resolve(r).unwrap_or_else(|e| fail_dedup(e)))
            .collect()
    }
}

fn main() {
    env_logger::init();

    let mut args = env::args();
    let _bin = args.next();
    let Some(subcommand) = args.next() else {
        print_usage();
        exit(1);
    };
    let rest: Vec<String> = args.collect();

    match subcommand.as_str() {
        "scan" => cmd_scan(rest),
        "dedup" => cmd_dedup(rest),
        "dedup-files" => cmd_dedup_files(rest),
        "show" => cmd_show(rest),
        _ => {
            print_usage();
            exit(1);
        }
    }
}

fn open_store(state_dir: &Option<PathBuf>) -> Store {
    let dir = resolve_state_dir(state_dir.as_deref()).unwrap_or_else(|e| fail_dedup(e));
    Store::open(&dir).unwrap_or_else(|e| fail_dedup(e))
}

fn register_volume_if_new(store: &mut Store, volume: &ResolvedVolume) {
    let repr = volume.id.into();
    if store.volume(repr).is_none() {
        store.upsert_volume(Volume::new(repr, volume.mount_path.clone()));
    }
}

fn cmd_scan(args: Vec<String>) {
    let flags = parse_flags(args.into_iter());
    let ops = RealBtrfs;
    let source = DefaultVolumeSource::new(&ops);
    let mut store = open_store(&flags.state_dir);

    for volume in resolve_targets(&source, &flags.positionals) {
        let fd = volume.root.as_raw_fd();
        register_volume_if_new(&mut store, &volume);
        match scan_volume(&ops, &mut store, volume.id.into(), fd) {
            Ok(n) => println!("{}: {n} changed inodes absorbed", volume.mount_path.display()),
            Err(e) => fail_dedup(e),
        }
    }
}

fn cmd_dedup(args: Vec<String>) {
    let flags = parse_flags(args.into_iter());
    let ops = RealBtrfs;
    let source = DefaultVolumeSource::new(&ops);
    let mut store = open_store(&flags.state_dir);

    let opts = PassOptions {
        allow_crossvol: !flags.no_crossvol,
        pre_defrag: flags.defrag,
        size_cutoff: flags.size_cutoff,
    };

    let resolved = resolve_targets(&source, &flags.positionals);
    let mut volume_ids = Vec::new();
    let mut by_id: HashMap<dedup::volume::VolumeIdRepr, usize> = HashMap::new();
    for (idx, volume) in resolved.iter().enumerate() {
        let fd = volume.root.as_raw_fd();
        register_volume_if_new(&mut store, volume);
        let repr = volume.id.into();
        if let Err(e) = scan_volume(&ops, &mut store, repr, fd) {
            fail_dedup(e);
        }
        volume_ids.push(repr);
        by_id.insert(repr, idx);
    }

    let classes = classes_for_pass(&store, &volume_ids, opts);
    let mut summary = PassSummary::default();

    for class in &classes {
        process_class(
            &ops,
            &mut store,
            class,
            |vol, ino| {
                let idx = *by_id.get(&vol)?;
                let volume = &resolved[idx];
                let fd = volume.root.as_raw_fd();
                let path = dedup::resolve::resolve_path(&ops, fd, &volume.mount_path, ino)
                    .ok()??;
                let meta = std::fs::symlink_metadata(&path).ok()?;
                let mtime = meta.modified().ok()?;
                Some((path, meta.len(), mtime))
            },
            opts,
            &mut summary,
        );
    }

    store.commit().unwrap_or_else(|e| fail_dedup(e));
    print_summary(&summary);
}

fn cmd_dedup_files(args: Vec<String>) {
    let flags = parse_flags(args.into_iter());
    if flags.positionals.len() < 2 {
        print_usage();
        exit(1);
    }
    let ops = RealBtrfs;
    let opts = PassOptions {
        allow_crossvol: !flags.no_crossvol,
        pre_defrag: flags.defrag,
        size_cutoff: 0,
    };

    let mut requests = Vec::new();
    for path in &flags.positionals {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("btrfs-dedup: skipping `{path}`: {e}");
                continue;
            }
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        requests.push(LockRequest {
            path: PathBuf::from(path),
            expected_size: meta.len(),
            expected_mtime: mtime,
        });
    }

    let locked_class = dedup::locker::lock_class(&ops, requests).unwrap_or_else(|e| fail_dedup(e));
    let mut summary = PassSummary {
        classes_considered: 1,
        ..Default::default()
    };
    for (_, kind) in &locked_class.dropped {
        match kind {
            Kind::Busy => summary.busy += 1,
            Kind::Changed => summary.changed += 1,
            Kind::Vanished => summary.vanished += 1,
            Kind::AlreadyImmutable => summary.already_immutable += 1,
            _ => summary.failed += 1,
        }
    }

    if locked_class.locked.len() >= 2 {
        let results = dedup::compare::reduce_and_clone(
            &ops,
            &locked_class.locked,
            opts.pre_defrag,
            opts.allow_crossvol,
        );
        use dedup::compare::Outcome;
        for result in &results {
            match result.outcome {
                Outcome::Cloned => summary.cloned += 1,
                Outcome::Mismatch => summary.mismatched += 1,
                Outcome::Failed => summary.failed += 1,
            }
        }
    }
    dedup::locker::release(&ops, locked_class.locked);

    print_summary(&summary);
}

fn cmd_show(args: Vec<String>) {
    let flags = parse_flags(args.into_iter());
    let store = open_store(&flags.state_dir);
    for volume in store.volumes() {
        println!(
            "{}\twatermark={}\tonline={}\ttracking={}",
            volume.mount_path.display(),
            volume.last_tracked_generation,
            volume.online,
            volume.tracking_enabled,
        );
    }
}

fn print_summary(summary: &PassSummary) {
    println!(
        "classes={} cloned={} mismatched={} busy={} changed={} vanished={} already_immutable={} failed={}",
        summary.classes_considered,
        summary.cloned,
        summary.mismatched,
        summary.busy,
        summary.changed,
        summary.vanished,
        summary.already_immutable,
        summary.failed,
    );
}
