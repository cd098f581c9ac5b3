#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use sfs::{
    DirectoryEntry, EntryType, EnumerateMode, FormatOptions, MountOptions,
    SaveContainerFileSystem, VerifyReport, extract_to_dir,
};
use std::env;
use std::path::Path;

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    data_blocks: u32,
    journal_blocks: u32,
    total_bytes: u64,
    free_bytes: u64,
    duplex_index: u8,
    file_remap_entries: usize,
    meta_remap_entries: usize,
    directory_table_block: u32,
    file_table_block: u32,
}

#[derive(Debug, Serialize)]
struct ListOutput<'a> {
    path: &'a str,
    entries: &'a [DirectoryEntry],
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();
    let json = rest.iter().any(|arg| arg == "--json");
    let positional: Vec<&str> = rest
        .iter()
        .map(String::as_str)
        .filter(|arg| !arg.starts_with("--"))
        .collect();

    match command.as_str() {
        "inspect" => {
            let Some(image) = positional.first() else {
                bail!("inspect requires an image path");
            };
            inspect(Path::new(image), json)
        }
        "ls" => {
            let Some(image) = positional.first() else {
                bail!("ls requires an image path");
            };
            let dir = positional.get(1).copied().unwrap_or("/");
            list(Path::new(image), dir, json)
        }
        "verify" => {
            let Some(image) = positional.first() else {
                bail!("verify requires an image path");
            };
            verify(Path::new(image), json)
        }
        "extract" => {
            let (Some(image), Some(out)) = (positional.first(), positional.get(1)) else {
                bail!("extract requires <image-path> <out-dir>");
            };
            extract(Path::new(image), Path::new(out))
        }
        "format" => {
            let Some(image) = rest.first().filter(|arg| !arg.starts_with("--")) else {
                bail!("format requires an image path");
            };
            let options = format_options(&rest[1..])?;
            format(Path::new(image), &options)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("sfs-cli\n");
    println!("USAGE:");
    println!("  sfs-cli inspect <image-path> [--json]");
    println!("  sfs-cli ls <image-path> [dir] [--json]");
    println!("  sfs-cli verify <image-path> [--json]");
    println!("  sfs-cli extract <image-path> <out-dir>");
    println!(
        "  sfs-cli format <image-path> [--block-size N] [--blocks N] [--journal-blocks N]"
    );
}

fn parse_number(flag: &str, value: Option<&String>) -> Result<u32> {
    let Some(value) = value else {
        bail!("{flag} requires a value");
    };
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.with_context(|| format!("{flag}: invalid number {value:?}"))
}

fn format_options(flags: &[String]) -> Result<FormatOptions> {
    let mut options = FormatOptions::default();
    let mut iter = flags.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--block-size" => options.block_size = parse_number(flag, iter.next())?,
            "--blocks" => options.data_block_count = parse_number(flag, iter.next())?,
            "--journal-blocks" => options.journal_block_count = parse_number(flag, iter.next())?,
            other => bail!("format: unknown option {other}"),
        }
    }
    Ok(options)
}

fn open_read_only(path: &Path) -> Result<SaveContainerFileSystem> {
    SaveContainerFileSystem::open_with_options(path, &MountOptions { read_only: true })
        .with_context(|| format!("failed to mount container: {}", path.display()))
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let fs = open_read_only(path)?;
    let header = fs.header();
    let output = InspectOutput {
        block_size: fs.block_size(),
        data_blocks: header.journal.map.main_data_block_count,
        journal_blocks: header.journal.map.journal_block_count,
        total_bytes: fs.get_total_space_size(),
        free_bytes: fs.get_free_space_size().context("read free list")?,
        duplex_index: header.layout.duplex_index,
        file_remap_entries: fs.file_remap().entries().len(),
        meta_remap_entries: fs.meta_remap().entries().len(),
        directory_table_block: header.save.fat.directory_table_block,
        file_table_block: header.save.fat.file_table_block,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("SaveFS Inspector");
        println!("block_size: {:#x}", output.block_size);
        println!("data_blocks: {}", output.data_blocks);
        println!("journal_blocks: {}", output.journal_blocks);
        println!("total_bytes: {:#x}", output.total_bytes);
        println!("free_bytes: {:#x}", output.free_bytes);
        println!("duplex_index: {}", output.duplex_index);
        println!("file_remap_entries: {}", output.file_remap_entries);
        println!("meta_remap_entries: {}", output.meta_remap_entries);
        println!("directory_table_block: {}", output.directory_table_block);
        println!("file_table_block: {}", output.file_table_block);
    }
    Ok(())
}

fn list(path: &Path, dir: &str, json: bool) -> Result<()> {
    let fs = open_read_only(path)?;
    let listing = fs
        .open_directory(dir, EnumerateMode::All)
        .with_context(|| format!("failed to open directory {dir}"))?;

    if json {
        let output = ListOutput {
            path: dir,
            entries: listing.entries(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }
    for entry in &listing {
        match entry.kind {
            EntryType::Directory => println!("d {:>12} {}/", "-", entry.name),
            EntryType::File => println!("f {:>12} {}", entry.size, entry.name),
        }
    }
    Ok(())
}

fn verify(path: &Path, json: bool) -> Result<()> {
    let fs = open_read_only(path)?;
    let report: VerifyReport = fs.verify().context("container failed verification")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize output")?
        );
    } else {
        println!(
            "ok: {} directories, {} files, {} blocks used, {} free",
            report.directories, report.files, report.used_blocks, report.free_blocks
        );
    }
    Ok(())
}

fn extract(path: &Path, out: &Path) -> Result<()> {
    let fs = open_read_only(path)?;
    let summary = extract_to_dir(&fs, out)
        .with_context(|| format!("failed to extract into {}", out.display()))?;
    eprintln!(
        "extracted {} directories, {} files ({} bytes) to {}",
        summary.directories,
        summary.files,
        summary.bytes,
        out.display()
    );
    Ok(())
}

fn format(path: &Path, options: &FormatOptions) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let fs = SaveContainerFileSystem::create(path, options)
        .with_context(|| format!("failed to format {}", path.display()))?;
    eprintln!(
        "formatted {}: {} blocks of {:#x} bytes, {} journal blocks",
        path.display(),
        options.data_block_count,
        fs.block_size(),
        options.journal_block_count
    );
    Ok(())
}
