use clap::{Parser, Subcommand};
use modpak::codec::CodecRegistry;
use modpak::container::{AppendOptions, Container, Entry, EntryFlags};
use modpak::hash::{self, Architecture};
use modpak::resource;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::Level;

#[derive(Parser)]
#[command(name = "modpak", about = "Author and inspect module containers")]
struct Cli {
    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add modules to a container, creating it if missing
    Add {
        container: PathBuf,
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
        /// Codec: zstd (default), lz4, brotli, lzma, none
        #[arg(short, long, default_value = "zstd")]
        codec: String,
        /// Mark as native code (materialized to a file before loading)
        #[arg(long)]
        native: bool,
        /// Mark as architecture-neutral
        #[arg(long)]
        portable: bool,
        /// Replace existing entries with the same name
        #[arg(long)]
        overwrite: bool,
        /// Store under this name instead of the file name (single file only)
        #[arg(long)]
        name: Option<String>,
        /// Qualify the name with an architecture: x86 or x64
        #[arg(long)]
        arch: Option<String>,
    },
    /// List container entries
    List {
        container: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Remove modules by name
    Remove {
        container: PathBuf,
        #[arg(required = true, num_args = 1..)]
        names: Vec<String>,
    },
    /// Compact a container, dropping removed and overwritten payloads
    Rebuild {
        container: PathBuf,
    },
    /// Print the embedded-resource name for a module file
    ResourceName {
        file: PathBuf,
        #[arg(long)]
        native: bool,
        #[arg(long)]
        portable: bool,
        #[arg(long)]
        compress: bool,
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Serialize)]
struct EntryView<'a> {
    #[serde(flatten)]
    entry: &'a Entry,
    codec: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();

    match cli.command {

        // ── Add ──────────────────────────────────────────────────────────────
        Commands::Add { container, files, codec, native, portable, overwrite, name, arch } => {
            if name.is_some() && files.len() != 1 {
                return Err("--name requires exactly one input file".into());
            }
            let mut flags = EntryFlags::NONE;
            if native   { flags |= EntryFlags::NATIVE; }
            if portable { flags |= EntryFlags::PORTABLE; }
            let opts = AppendOptions {
                codec: (codec != "none").then_some(codec),
                flags,
                architecture: arch.as_deref().map(parse_arch).transpose()?,
                overwrite,
            };

            let mut c = Container::open_or_create_file(&container)?;
            for path in &files {
                let data = std::fs::read(path)?;
                let module = match &name {
                    Some(n) => n.clone(),
                    None    => file_name(path)?,
                };
                let e = c.append(&module, &data, &opts)?;
                println!("  added  {:<32} {:>10} → {:>10}", module, e.original_length, e.storage_length);
            }
            c.close()?;
            println!("Updated: {}", container.display());
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { container, json } => {
            let c = Container::open_file(&container)?;
            let registry = c.registry();
            let views: Vec<EntryView> = c
                .entries()
                .into_iter()
                .map(|entry| EntryView { entry, codec: codec_label(registry, entry.codec_id) })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                println!("Container: {} ({})", container.display(), c.instance_id());
                println!("{:<32} {:<5} {:>12} {:>12}  Codec", "Hash", "Flags", "Size", "Stored");
                for v in &views {
                    println!("{:<32} {:<5} {:>12} {:>12}  {}",
                        hex::encode(v.entry.hash.as_bytes()), flag_letters(v.entry.flags),
                        v.entry.original_length, v.entry.storage_length, v.codec);
                }
                println!("{} entries, {} dead bytes", c.len(), c.dead_bytes());
            }
        }

        // ── Remove ───────────────────────────────────────────────────────────
        Commands::Remove { container, names } => {
            let mut c = Container::open_file_rw(&container)?;
            for name in &names {
                if c.remove(&hash::hash(name)) {
                    println!("  removed  {name}");
                } else {
                    eprintln!("  missing  {name}");
                }
            }
            c.close()?;
        }

        // ── Rebuild ──────────────────────────────────────────────────────────
        Commands::Rebuild { container } => {
            let reclaimed = Container::rebuild_file(&container)?;
            println!("Rebuilt {} (reclaimed {} B)", container.display(), reclaimed);
        }

        // ── Resource name ────────────────────────────────────────────────────
        Commands::ResourceName { file, native, portable, compress, name } => {
            let data = std::fs::read(&file)?;
            let module = match name {
                Some(n) => n,
                None    => file_name(&file)?,
            };
            let mut flags = EntryFlags::NONE;
            if native   { flags |= EntryFlags::NATIVE; }
            if portable { flags |= EntryFlags::PORTABLE; }
            let (resource, _) = resource::embed(&hash::hash(&module), &data, flags, compress);
            println!("{resource}");
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn file_name(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("'{}' has no file name", path.display()).into())
}

fn parse_arch(s: &str) -> Result<Architecture, Box<dyn std::error::Error>> {
    match s.to_ascii_lowercase().as_str() {
        "x86" => Ok(Architecture::X86),
        "x64" => Ok(Architecture::X64),
        other => Err(format!("unknown architecture '{other}' (expected x86 or x64)").into()),
    }
}

fn codec_label(registry: &CodecRegistry, id: u32) -> String {
    registry.name_of(id).unwrap_or_else(|| format!("{id:#010x}?"))
}

fn flag_letters(flags: EntryFlags) -> String {
    let mut s = String::new();
    if flags.is_native()   { s.push('u'); }
    if flags.is_portable() { s.push('p'); }
    if s.is_empty() { s.push('-'); }
    s
}
