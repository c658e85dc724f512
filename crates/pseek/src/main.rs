//! pseek - PhotoSeek CLI
//!
//! Semantic photo search over local directories.
//!
//! Usage:
//!   pseek index [path]             Build or refresh the index
//!   pseek search "query" [path]    Search indexed photos
//!   pseek like photo.jpg           Find similar photos
//!   pseek ann build graph          Build an ANN backend
//!   pseek status                   Show index status
//!
//! Exit codes: 0 success, 2 invalid argument, 3 store not found,
//! 4 embedder unavailable, 5 cancelled, 130 SIGINT.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use pseek_core::{
    ann_status, build_ann, build_exif, build_hashes, drop_ann, exit_code, find_lookalikes,
    read_status, request_pause, resolve_group, scan, search, search_like, store_stats, AnnKind,
    AnnParams, CancelFlag, CoreError, Embedder, FilterOptions, Fusion, FusionKind, IndexStore,
    Photo, ScanOptions, SearchOptions, SearchResult, UpsertOptions, UpsertProgress,
};
use std::path::PathBuf;

/// Index key used when no embedder is loaded (metadata-only commands).
const DEFAULT_INDEX_KEY: &str = "openai/clip-vit-base-patch32";

#[derive(Parser)]
#[command(name = "pseek", version, about = "Semantic photo search for local photo libraries")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh the index for a directory
    Index {
        /// Directory to index (defaults to current directory)
        path: Option<PathBuf>,
        /// Embedding batch size (default: device-appropriate)
        #[arg(long, default_value_t = 0)]
        batch_size: usize,
        /// Also index video files
        #[arg(long)]
        videos: bool,
    },
    /// Search indexed photos with a natural-language query
    Search {
        /// Search query
        query: String,
        /// Directory to search (defaults to current directory)
        path: Option<PathBuf>,
        /// Maximum results
        #[arg(long, default_value_t = 12)]
        top_k: usize,
        /// ANN backend to use as candidate generator (flat|graph|tree)
        #[arg(long, value_parser = parse_ann_kind)]
        ann: Option<AnnKind>,
        /// Fuse OCR text similarity into the score
        #[arg(long)]
        with_ocr: bool,
        /// Fuse caption similarity into the score
        #[arg(long)]
        with_captions: bool,
        /// Keep only favorites
        #[arg(long)]
        favorites: bool,
        /// Require these tags (repeatable)
        #[arg(long)]
        tag: Vec<String>,
        /// Require this person
        #[arg(long)]
        person: Option<String>,
        /// Camera model substring
        #[arg(long)]
        camera: Option<String>,
        /// Keep only photos with OCR text
        #[arg(long)]
        has_text: bool,
        /// Structured filter expression (AND/OR/NOT, field:value)
        #[arg(long)]
        expr: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Find photos similar to a given photo
    Like {
        /// Photo path (must already be indexed)
        photo: PathBuf,
        /// Directory of the index (defaults to the photo's parent)
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, default_value_t = 12)]
        top_k: usize,
        #[arg(long)]
        json: bool,
    },
    /// Manage ANN backends
    Ann {
        #[command(subcommand)]
        action: AnnAction,
    },
    /// Build the EXIF metadata table
    Exif {
        path: Option<PathBuf>,
    },
    /// Compute perceptual hashes
    Hashes {
        path: Option<PathBuf>,
    },
    /// Group near-duplicate photos
    Lookalikes {
        path: Option<PathBuf>,
        /// Maximum Hamming distance within a group
        #[arg(long, default_value_t = 5)]
        max_distance: u32,
        /// Mark the group containing these paths as resolved
        #[arg(long)]
        resolve: Vec<String>,
    },
    /// Show index status
    Status {
        path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Pause the running index job for a directory
    Pause {
        path: Option<PathBuf>,
    },
    /// Resume a paused index job
    Resume {
        path: Option<PathBuf>,
    },
    /// Delete the index directory for a root
    Nuke {
        path: Option<PathBuf>,
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum AnnAction {
    /// Build (or rebuild) a backend
    Build {
        #[arg(value_parser = parse_ann_kind)]
        kind: AnnKind,
        path: Option<PathBuf>,
        /// Graph: max neighbors per node
        #[arg(long, default_value_t = 16)]
        m: usize,
        /// Graph: construction candidate list size
        #[arg(long, default_value_t = 200)]
        ef_construction: usize,
        /// Tree: number of trees
        #[arg(long, default_value_t = 50)]
        trees: usize,
    },
    /// Show backend status
    Status {
        #[arg(value_parser = parse_ann_kind)]
        kind: AnnKind,
        path: Option<PathBuf>,
    },
    /// Remove a backend snapshot
    Drop {
        #[arg(value_parser = parse_ann_kind)]
        kind: AnnKind,
        path: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{} {e:#}", "error:".red().bold());
        std::process::exit(exit_code(&e));
    }
}

fn resolve_root(path: Option<PathBuf>) -> Result<PathBuf> {
    let path = match path {
        Some(path) => path,
        None => std::env::current_dir().context("failed to determine current directory")?,
    };
    path.canonicalize()
        .map_err(|_| CoreError::StoreNotFound(path.clone()).into())
}

#[cfg(feature = "clip")]
fn load_embedder() -> Result<Box<dyn Embedder>> {
    let device = pseek_core::make_device();
    Ok(Box::new(pseek_core::ClipEmbedder::new(&device)?))
}

#[cfg(not(feature = "clip"))]
fn load_embedder() -> Result<Box<dyn Embedder>> {
    Err(CoreError::EmbedderUnavailable(
        "this build has no embedding backend; rebuild with --features clip".into(),
    )
    .into())
}

/// Open the store for metadata-only commands, without loading a model.
fn open_store(root: &std::path::Path) -> Result<IndexStore> {
    IndexStore::open(root, DEFAULT_INDEX_KEY)
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Index {
            path,
            batch_size,
            videos,
        } => cmd_index(path, batch_size, videos),
        Commands::Search {
            query,
            path,
            top_k,
            ann,
            with_ocr,
            with_captions,
            favorites,
            tag,
            person,
            camera,
            has_text,
            expr,
            json,
        } => {
            let root = resolve_root(path)?;
            let mut embedder = load_embedder()?;
            let store = IndexStore::open(&root, &embedder.index_id())?;

            let fusion = if with_ocr {
                Some(Fusion::new(FusionKind::Ocr))
            } else if with_captions {
                Some(Fusion::new(FusionKind::Captions))
            } else {
                None
            };
            let options = SearchOptions {
                top_k,
                ann,
                fusion,
                filters: FilterOptions {
                    favorites_only: favorites,
                    tags: tag,
                    person,
                    camera,
                    has_text,
                    expression: expr,
                    ..Default::default()
                },
                ..Default::default()
            };
            let results = search(&store, embedder.as_mut(), &query, &options)?;
            print_results(&results, json)
        }
        Commands::Like {
            photo,
            dir,
            top_k,
            json,
        } => {
            let photo = photo
                .canonicalize()
                .with_context(|| format!("no such photo: {}", photo.display()))?;
            let root = match dir {
                Some(dir) => resolve_root(Some(dir))?,
                None => photo
                    .parent()
                    .map(|p| p.to_path_buf())
                    .ok_or_else(|| CoreError::InvalidArgument("photo has no parent".into()))?,
            };
            let store = open_store(&root)?;
            let options = SearchOptions {
                top_k,
                ..Default::default()
            };
            let results = search_like(&store, &photo.to_string_lossy(), &options)?;
            print_results(&results, json)
        }
        Commands::Ann { action } => cmd_ann(action),
        Commands::Exif { path } => {
            let root = resolve_root(path)?;
            let store = open_store(&root)?;
            let table = build_exif(&store, CancelFlag::new())?;
            println!("extracted metadata for {} photos", table.len());
            Ok(())
        }
        Commands::Hashes { path } => {
            let root = resolve_root(path)?;
            let store = open_store(&root)?;
            let updated = build_hashes(&store, CancelFlag::new())?;
            println!("hashed {updated} new photos");
            Ok(())
        }
        Commands::Lookalikes {
            path,
            max_distance,
            resolve,
        } => {
            let root = resolve_root(path)?;
            let store = open_store(&root)?;
            if !resolve.is_empty() {
                let id = resolve_group(store.index_dir(), &resolve)?;
                println!("resolved group {id}");
                return Ok(());
            }
            let groups = find_lookalikes(store.index_dir(), max_distance)?;
            if groups.is_empty() {
                println!("no look-alike groups");
            }
            for group in groups {
                let marker = if group.resolved { "resolved" } else { "open" };
                println!("{} [{}]", group.id.bold(), marker);
                for path in &group.paths {
                    println!("  {path}");
                }
            }
            Ok(())
        }
        Commands::Status { path, json } => {
            let root = resolve_root(path)?;
            let store = open_store(&root)?;
            let stats = store_stats(&store);
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("photos:        {}", stats.photos);
                println!(
                    "dim:           {}",
                    stats.dim.map(|d| d.to_string()).unwrap_or_else(|| "-".into())
                );
                println!("snapshot:      {}", stats.snapshot);
                println!("ocr:           {}", yes_no(stats.has_ocr));
                println!("captions:      {}", yes_no(stats.has_captions));
                println!("exif:          {}", yes_no(stats.has_exif));
                println!("hashed:        {}", stats.hashed);
                println!("face clusters: {}", stats.face_clusters);
                println!(
                    "ann:           flat={} graph={} tree={}",
                    yes_no(stats.ann_flat),
                    yes_no(stats.ann_graph),
                    yes_no(stats.ann_tree)
                );
                if let Some(job) = read_status(store.index_dir())? {
                    println!("last job:      {:?} ({:?})", job.job, job.state);
                }
            }
            Ok(())
        }
        Commands::Pause { path } => {
            let root = resolve_root(path)?;
            let store = open_store(&root)?;
            request_pause(store.index_dir(), true)?;
            println!("pause requested");
            Ok(())
        }
        Commands::Resume { path } => {
            let root = resolve_root(path)?;
            let store = open_store(&root)?;
            request_pause(store.index_dir(), false)?;
            println!("resume requested");
            Ok(())
        }
        Commands::Nuke { path, yes } => {
            let root = resolve_root(path)?;
            if !yes {
                return Err(CoreError::InvalidArgument(
                    "refusing to delete the index without --yes".into(),
                )
                .into());
            }
            let store = open_store(&root)?;
            store.nuke()?;
            println!("index removed for {}", root.display());
            Ok(())
        }
    }
}

fn cmd_index(path: Option<PathBuf>, batch_size: usize, videos: bool) -> Result<()> {
    let root = resolve_root(path)?;
    let mut embedder = load_embedder()?;
    let mut store = IndexStore::open(&root, &embedder.index_id())?;

    let files = scan(
        &root,
        &ScanOptions {
            include_videos: videos,
        },
    )?;
    let photos: Vec<Photo> = files
        .into_iter()
        .map(|f| Photo {
            path: f.path,
            mtime: f.mtime,
        })
        .collect();
    println!("found {} photos under {}", photos.len(), root.display());

    let bar = ProgressBar::new(photos.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .expect("static template"),
    );
    let bar_ref = &bar;
    let progress = move |p: &UpsertProgress| {
        bar_ref.set_position(p.done as u64);
        bar_ref.set_length(p.total as u64);
    };

    let options = UpsertOptions {
        batch_size,
        progress: Some(&progress),
        cancel: CancelFlag::new(),
    };
    let (new, updated) = store.upsert(embedder.as_mut(), &photos, &options)?;
    bar.finish_and_clear();
    println!(
        "{} {new} new, {updated} updated, {} total",
        "indexed:".green().bold(),
        store.state().len()
    );
    Ok(())
}

fn cmd_ann(action: AnnAction) -> Result<()> {
    match action {
        AnnAction::Build {
            kind,
            path,
            m,
            ef_construction,
            trees,
        } => {
            let root = resolve_root(path)?;
            let store = open_store(&root)?;
            let params = AnnParams {
                m,
                ef_construction,
                trees,
                ..AnnParams::default()
            };
            if build_ann(&store, kind, &params)? {
                println!("built {} index over {} rows", kind.as_str(), store.state().len());
            } else {
                println!("store is empty; nothing to build");
            }
            Ok(())
        }
        AnnAction::Status { kind, path } => {
            let root = resolve_root(path)?;
            let store = open_store(&root)?;
            let status = ann_status(&store, kind);
            match status.meta {
                Some(meta) if status.exists => {
                    println!(
                        "{}: ready (dim {}, size {}, snapshot {})",
                        kind.as_str(),
                        meta.dim,
                        meta.size,
                        meta.snapshot
                    );
                }
                Some(_) => println!("{}: stale (rebuild needed)", kind.as_str()),
                None => println!("{}: not built", kind.as_str()),
            }
            Ok(())
        }
        AnnAction::Drop { kind, path } => {
            let root = resolve_root(path)?;
            let store = open_store(&root)?;
            drop_ann(&store, kind)?;
            println!("dropped {} index", kind.as_str());
            Ok(())
        }
    }
}

fn print_results(results: &[SearchResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("no results");
        return Ok(());
    }
    for result in results {
        println!("{:>7.4}  {}", result.score, result.path);
    }
    Ok(())
}

fn parse_ann_kind(s: &str) -> Result<AnnKind, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}
