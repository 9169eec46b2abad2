use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use ignore::WalkBuilder;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
use crate::cli::{ArchiveArgs, Cli, Command, Config, LogFormat};

use rzpaq::archive::{AddEntry, Archive, ArchiveOptions};
use rzpaq::codec::Method;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Add {
            archive,
            paths,
            method,
            threads,
        } => run_add(&archive, &paths, &config, method, threads),
        Command::Remove { archive, paths } => run_remove(&archive, &paths),
        Command::Extract {
            archive,
            paths,
            output,
            version,
        } => run_extract(&archive, &paths, &output, version),
        Command::List {
            archive,
            version,
            versions,
        } => run_list(&archive, version, versions),
        Command::Verify { archive, threads } => run_verify(&archive, &config, threads),
        Command::Compact { archive, output } => run_compact(&archive, &output),
        Command::Compress {
            input,
            output,
            method,
            key,
        } => run_compress(&input, &output, &config, method, key.as_deref()),
        Command::Decompress { input, output, key } => {
            run_decompress(&input, &output, key.as_deref())
        }
    }
}

fn options(config: &Config, method: Option<u8>, threads: Option<usize>) -> Result<ArchiveOptions> {
    let mut opts = ArchiveOptions::default();
    if let Some(m) = method.or(config.method) {
        opts.method = Method::preset(m);
        opts.method.program().context("unknown method")?;
    }
    if let Some(t) = threads.or(config.threads) {
        opts.threads = t.max(1);
    }
    if let Some(limit) = config.vm_step_limit {
        opts.step_limit = limit;
    }
    Ok(opts)
}

fn password(args: &ArchiveArgs) -> Option<&[u8]> {
    args.key.as_deref().map(str::as_bytes)
}

fn unix_now() -> u64 {
    OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

fn run_add(
    args: &ArchiveArgs,
    paths: &[PathBuf],
    config: &Config,
    method: Option<u8>,
    threads: Option<usize>,
) -> Result<()> {
    anyhow::ensure!(!paths.is_empty(), "nothing to add");
    let opts = options(config, method, threads)?;
    let mut archive = Archive::open_or_create(&args.archive, password(args), opts)
        .with_context(|| format!("opening archive {}", args.archive.display()))?;

    let mut entries = Vec::new();
    for path in paths {
        collect_entries(path, &mut entries)?;
    }
    anyhow::ensure!(!entries.is_empty(), "no regular files under the given paths");

    let version = archive.add(entries, unix_now())?;
    println!("committed version {version}");
    for w in archive.warnings() {
        warn!(warning = %w, "archive warning");
    }
    Ok(())
}

fn collect_entries(path: &Path, entries: &mut Vec<AddEntry>) -> Result<()> {
    let meta =
        std::fs::metadata(path).with_context(|| format!("reading metadata {}", path.display()))?;

    if meta.is_file() {
        entries.push(make_entry(path, &meta)?);
        return Ok(());
    }

    for item in WalkBuilder::new(path)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
    {
        let item = item?;
        match item.file_type() {
            Some(ft) if ft.is_file() => {
                let meta = item.metadata()?;
                entries.push(make_entry(item.path(), &meta)?);
            }
            _ => {}
        }
    }
    Ok(())
}

fn make_entry(path: &Path, meta: &std::fs::Metadata) -> Result<AddEntry> {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    #[cfg(unix)]
    let attrs = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    };
    #[cfg(not(unix))]
    let attrs = 0u32;

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(AddEntry {
        path: path.display().to_string(),
        mtime,
        attrs,
        data: Box::new(BufReader::new(file)),
    })
}

fn run_remove(args: &ArchiveArgs, paths: &[String]) -> Result<()> {
    anyhow::ensure!(!paths.is_empty(), "nothing to remove");
    let mut archive = Archive::open(&args.archive, password(args))?;
    let before = archive.versions().len() as u32;
    let version = archive.remove(paths, unix_now())?;
    if version == before {
        println!("no matching paths; archive unchanged");
    } else {
        println!("committed version {version}");
    }
    Ok(())
}

/// Maps an archived path to a location under the output directory,
/// refusing anything that would escape it.
fn sandboxed(output: &Path, stored: &str) -> Option<PathBuf> {
    let mut out = output.to_path_buf();
    for comp in Path::new(stored).components() {
        match comp {
            std::path::Component::Normal(c) => out.push(c),
            std::path::Component::RootDir | std::path::Component::Prefix(_) => {}
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => return None,
        }
    }
    Some(out)
}

fn run_extract(
    args: &ArchiveArgs,
    paths: &[String],
    output: &Path,
    version: Option<u32>,
) -> Result<()> {
    let archive = Archive::open(&args.archive, password(args))?;
    let listing = archive.list(version)?;

    let selected: Vec<_> = listing
        .iter()
        .filter(|f| paths.is_empty() || paths.iter().any(|p| f.path == *p || f.path.starts_with(&format!("{p}/"))))
        .collect();
    anyhow::ensure!(!selected.is_empty(), "nothing matches the selection");

    let mut failures = 0usize;
    for state in selected {
        let Some(dest) = sandboxed(output, &state.path) else {
            warn!(path = %state.path, "refusing path outside output directory");
            failures += 1;
            continue;
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let sink = BufWriter::new(File::create(&dest)?);
        match archive.extract(&state.path, version, sink) {
            Ok(_) => info!(path = %state.path, bytes = state.size, "extracted"),
            Err(e) => {
                // Best effort: report and keep going with the rest.
                warn!(path = %state.path, error = %e, "extraction failed");
                failures += 1;
            }
        }
    }

    anyhow::ensure!(failures == 0, "{failures} path(s) failed to extract");
    Ok(())
}

fn run_list(args: &ArchiveArgs, version: Option<u32>, versions: bool) -> Result<()> {
    let archive = Archive::open(&args.archive, password(args))?;

    if versions {
        for v in archive.versions() {
            println!(
                "{:>6}  {}  {} file(s)",
                v.version,
                fmt_time(v.timestamp),
                v.records.len()
            );
        }
        return Ok(());
    }

    for state in archive.list(version)? {
        println!(
            "{:>12}  {}  {}",
            state.size,
            fmt_time(state.mtime),
            state.path
        );
    }
    for w in archive.warnings() {
        warn!(warning = %w, "archive warning");
    }
    Ok(())
}

fn fmt_time(unix: u64) -> String {
    OffsetDateTime::from_unix_timestamp(unix as i64)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| unix.to_string())
}

fn run_verify(args: &ArchiveArgs, config: &Config, threads: Option<usize>) -> Result<()> {
    let opts = options(config, None, threads)?;
    let archive = Archive::open_with(&args.archive, password(args), opts)?;
    let report = archive.verify()?;

    println!(
        "{} version(s), {} block(s), {} fragment(s) checked",
        report.versions, report.blocks_checked, report.fragments_checked
    );
    for e in &report.errors {
        println!("ERROR {}: {}", e.context, e.error);
    }
    anyhow::ensure!(report.is_ok(), "{} error(s) found", report.errors.len());
    Ok(())
}

fn run_compact(args: &ArchiveArgs, output: &Path) -> Result<()> {
    let archive = Archive::open(&args.archive, password(args))?;
    let compacted = archive.compact_to(output, password(args), unix_now())?;
    println!(
        "compacted {} version(s) into {} with {} file(s)",
        archive.versions().len(),
        output.display(),
        compacted.list(None)?.len()
    );
    Ok(())
}

fn run_compress(
    input: &Path,
    output: &Path,
    config: &Config,
    method: Option<u8>,
    key: Option<&str>,
) -> Result<()> {
    let method = Method::preset(method.or(config.method).unwrap_or(Method::DEFAULT.0));

    let reader = BufReader::new(
        File::open(input).with_context(|| format!("opening input {}", input.display()))?,
    );
    let mut writer = BufWriter::new(
        File::create(output).with_context(|| format!("creating output {}", output.display()))?,
    );

    let stats = rzpaq::compress(reader, &mut writer, method, key.map(str::as_bytes))?;
    writer.flush()?;
    info!(
        bytes_in = stats.bytes_in,
        bytes_out = stats.bytes_out,
        blocks = stats.blocks,
        method = method.0,
        "compression completed"
    );
    Ok(())
}

fn run_decompress(input: &Path, output: &Path, key: Option<&str>) -> Result<()> {
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("opening input {}", input.display()))?,
    );
    let mut writer = BufWriter::new(
        File::create(output).with_context(|| format!("creating output {}", output.display()))?,
    );

    let stats = rzpaq::decompress(reader, &mut writer, key.map(str::as_bytes))?;
    writer.flush()?;
    info!(
        bytes_out = stats.bytes_out,
        blocks = stats.blocks,
        "decompression completed"
    );
    Ok(())
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let filter = if let Some(f) = &cli.log_filter {
        EnvFilter::new(f.clone())
    } else {
        let level = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(level)
    };

    match cli.log_format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .compact()
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .json()
                .init();
        }
    }
    Ok(())
}
