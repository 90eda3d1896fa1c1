use clap::{Args, Parser, Subcommand};
use osmix::changeset::{apply_changeset, generate_changeset, ChangesetOptions};
use osmix::extract::{create_extract, ExtractPolicy};
use osmix::model::bbox_rect;
use osmix::progress::Progress;
use osmix::reader::{read_pbf, ReaderOptions};
use osmix::writer::{write_pbf, WriterOptions};
use osmix::Osm;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(about = "OSM index toolkit: inspect, extract and merge .osm.pbf files")]
struct OsmixCommand {
    #[command(subcommand)]
    subcommand: OsmixSubcommand,
}

#[derive(Args)]
struct InfoArgs {
    /// Path to the .osm.pbf input
    input: PathBuf,
    /// Decode blobs on this many threads
    #[arg(long, default_value_t = 1)]
    threads: usize,
}

#[derive(Args)]
struct ExtractArgs {
    input: PathBuf,
    output: PathBuf,
    /// Bbox as min_lon,min_lat,max_lon,max_lat
    #[arg(long)]
    bbox: String,
    /// simple, complete_ways or smart
    #[arg(long, default_value = "complete_ways")]
    policy: String,
    /// Filter while decoding instead of extracting from the full index
    #[arg(long)]
    streaming: bool,
}

#[derive(Args)]
struct MergeArgs {
    base: PathBuf,
    patch: PathBuf,
    output: PathBuf,
    /// Collapse patch nodes onto base nodes at the same location
    #[arg(long)]
    dedupe: bool,
    /// Create junction nodes where compatible highways cross
    #[arg(long)]
    intersections: bool,
}

#[derive(Subcommand)]
enum OsmixSubcommand {
    #[command(about = "Print index statistics as JSON")]
    Info(InfoArgs),
    #[command(about = "Extract a bbox into a new PBF")]
    Extract(ExtractArgs),
    #[command(about = "Merge a patch PBF into a base PBF")]
    Merge(MergeArgs),
}

fn load(path: &PathBuf, options: &ReaderOptions) -> Result<Osm, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    read_pbf(BufReader::new(file), options, &Progress::new())
        .map_err(|report| format!("failed to read {}: {report:?}", path.display()))
}

fn save(osm: &Osm, path: &PathBuf) -> Result<(), String> {
    let file = File::create(path).map_err(|e| format!("cannot create {}: {e}", path.display()))?;
    write_pbf(
        osm,
        BufWriter::new(file),
        &WriterOptions::default(),
        &Progress::new(),
    )
    .map_err(|report| format!("failed to write {}: {report:?}", path.display()))
}

fn parse_bbox(spec: &str) -> Result<geo::Rect, String> {
    let parts: Vec<f64> = spec
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("bad bbox {spec:?}: {e}"))?;
    if parts.len() != 4 {
        return Err(format!("bbox needs 4 numbers, got {}", parts.len()));
    }
    Ok(bbox_rect(parts[0], parts[1], parts[2], parts[3]))
}

fn run() -> Result<(), String> {
    let cmd = OsmixCommand::parse();
    match cmd.subcommand {
        OsmixSubcommand::Info(args) => {
            let options = ReaderOptions {
                parse_concurrency: args.threads,
                ..Default::default()
            };
            let osm = load(&args.input, &options)?;
            let json = serde_json::to_string_pretty(&osm.info())
                .map_err(|e| format!("cannot serialize info: {e}"))?;
            println!("{json}");
        }
        OsmixSubcommand::Extract(args) => {
            let bbox = parse_bbox(&args.bbox)?;
            let policy: ExtractPolicy = args.policy.parse()?;
            let extract = if args.streaming {
                let options = ReaderOptions {
                    extract_bbox: Some(bbox),
                    ..Default::default()
                };
                load(&args.input, &options)?
            } else {
                let mut src = load(&args.input, &ReaderOptions::default())?;
                src.build_spatial_indexes()
                    .map_err(|report| format!("indexing failed: {report:?}"))?;
                create_extract(&src, &bbox, policy)
                    .map_err(|report| format!("extract failed: {report:?}"))?
            };
            save(&extract, &args.output)?;
            log::info!("extract written to {}", args.output.display());
        }
        OsmixSubcommand::Merge(args) => {
            let mut base = load(&args.base, &ReaderOptions::default())?;
            base.build_spatial_indexes()
                .map_err(|report| format!("indexing failed: {report:?}"))?;
            let patch = load(&args.patch, &ReaderOptions::default())?;

            let options = ChangesetOptions {
                deduplicate_nodes: args.dedupe,
                create_intersections: args.intersections,
                ..Default::default()
            };
            let changeset = generate_changeset(&base, &patch, &options)
                .map_err(|report| format!("changeset failed: {report:?}"))?;
            let stats_json = serde_json::to_string_pretty(&changeset.stats)
                .map_err(|e| format!("cannot serialize stats: {e}"))?;
            println!("{stats_json}");

            let merged = apply_changeset(&base, &changeset)
                .map_err(|report| format!("apply failed: {report:?}"))?;
            save(&merged, &args.output)?;
            log::info!("merge written to {}", args.output.display());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}
