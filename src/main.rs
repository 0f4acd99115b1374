use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::{NaiveDateTime, TimeDelta};
use clap::{ArgAction, Args, Parser, Subcommand};
use glob::glob;
use handover::airspace::{AirspaceIndex, AirspaceRef, DatasetError};
use handover::confidence::{ConfidenceError, ConfidenceUpdate};
use handover::config::{
    ConfigError, DataLayout, EffectiveConfig, default_repo_config_yaml, expand_tilde,
    load_effective_config,
};
use handover::graph::{self, Average, GraphError};
use handover::logging::init_logging;
use handover::matrix::codec::{decode_source, is_matrix_file};
use handover::matrix::{MatrixError, TimeWindow, sum_matrices};
use handover::query::{HandoverAnalyzer, QueryError};
use handover::store::GraphStore;
use handover::store::atomic::atomic_write;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use walkdir::WalkDir;

const TIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y%m%d%H%M",
];

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<rusqlite::Error> for CliError {
    fn from(value: rusqlite::Error) -> Self {
        Self::new("sqlite_error", value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        let code = match value {
            ConfigError::UnknownDataset(_) => "unknown_dataset",
            ConfigError::Confidence(_) => "invalid_confidence",
            ConfigError::Io(_) | ConfigError::Yaml(_) => "config_error",
        };
        Self::new(code, value.to_string())
    }
}

impl From<ConfidenceError> for CliError {
    fn from(value: ConfidenceError) -> Self {
        Self::new("invalid_confidence", value.to_string())
    }
}

impl From<DatasetError> for CliError {
    fn from(value: DatasetError) -> Self {
        Self::new("dataset_error", value.to_string())
    }
}

impl From<MatrixError> for CliError {
    fn from(value: MatrixError) -> Self {
        let code = match value {
            MatrixError::MissingSource { .. } => "missing_source",
            MatrixError::Corrupt { .. } => "corrupt_source",
            _ => "matrix_error",
        };
        Self::new(code, value.to_string())
    }
}

impl From<GraphError> for CliError {
    fn from(value: GraphError) -> Self {
        Self::new("graph_error", value.to_string())
    }
}

impl From<QueryError> for CliError {
    fn from(value: QueryError) -> Self {
        Self::new("query_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "handover")]
#[command(about = "Aggregates airspace handover counts into a graph and scores candidate handovers")]
struct Cli {
    #[arg(long, global = true)]
    global: bool,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init(InitArgs),
    Ingest(IngestArgs),
    Stats(StatsArgs),
    Airspace(AirspaceArgs),
    Edge(EdgeArgs),
    Handover(HandoverArgs),
    Config,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Airspace dataset file; defaults to the configured dataset's location.
    #[arg(long)]
    airspaces: Option<PathBuf>,
    #[arg(long)]
    dataset: Option<String>,
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Matrix files, directories or glob patterns.
    sources: Vec<String>,
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long, requires = "end")]
    start: Option<String>,
    #[arg(long, requires = "start")]
    end: Option<String>,
    #[arg(long, default_value_t = 60)]
    step_minutes: i64,
    /// Re-ingest sources already recorded in the ledger.
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct StatsArgs {
    #[arg(long)]
    median: bool,
}

#[derive(Args, Debug)]
struct AirspaceArgs {
    airspace: String,
}

#[derive(Args, Debug)]
struct EdgeArgs {
    from: String,
    to: String,
}

#[derive(Args, Debug)]
struct HandoverArgs {
    from: String,
    to: String,
    #[arg(long, requires = "distance2", allow_negative_numbers = true)]
    distance1: Option<f64>,
    #[arg(long, requires = "distance1", allow_negative_numbers = true)]
    distance2: Option<f64>,
    #[arg(long)]
    distance_zero: Option<f64>,
    #[arg(long)]
    distance_one: Option<f64>,
    #[arg(long)]
    minimum_weight: Option<f64>,
    #[arg(long)]
    minimum_weight_adjusted: Option<f64>,
    #[arg(long)]
    confidence_distance: Option<f64>,
    #[arg(long)]
    confidence_distance_modifier: Option<f64>,
    #[arg(long)]
    confidence_weight: Option<f64>,
    #[arg(long)]
    confidence_weight_adjusted: Option<f64>,
}

impl HandoverArgs {
    fn confidence_update(&self) -> ConfidenceUpdate {
        ConfidenceUpdate {
            distance_zero: self.distance_zero,
            distance_one: self.distance_one,
            minimum_weight: self.minimum_weight,
            minimum_weight_adjusted: self.minimum_weight_adjusted,
            confidence_distance: self.confidence_distance,
            confidence_distance_modifier: self.confidence_distance_modifier,
            confidence_weight: self.confidence_weight,
            confidence_weight_adjusted: self.confidence_weight_adjusted,
        }
    }
}

#[derive(Debug, Clone)]
struct RepoPaths {
    root: PathBuf,
    database: PathBuf,
    repo_config: PathBuf,
    user_config: PathBuf,
    mode: StorageMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageMode {
    RepoLocal,
    Global,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
    let paths = repo_paths(&cwd, cli.global)?;
    match cli.command {
        Command::Init(args) => cmd_init(&cwd, &paths, args),
        Command::Ingest(args) => cmd_ingest(&cwd, &paths, args),
        Command::Stats(args) => cmd_stats(&paths, args),
        Command::Airspace(args) => cmd_airspace(&paths, args),
        Command::Edge(args) => cmd_edge(&cwd, &paths, args),
        Command::Handover(args) => cmd_handover(&cwd, &paths, args),
        Command::Config => cmd_config(&cwd, &paths),
    }
}

fn cmd_init(cwd: &Path, paths: &RepoPaths, args: InitArgs) -> Result<(), CliError> {
    fs::create_dir_all(&paths.root).map_err(|err| CliError::io("mkdir_error", err))?;
    let config = load_config(cwd, paths)?;
    let dataset = args.dataset.or_else(|| config.dataset.clone());
    if let Some(name) = &dataset {
        config.dataset_bounds(name)?;
    }

    let source = match args.airspaces {
        Some(path) => path,
        None => {
            let name = dataset.as_deref().ok_or_else(|| {
                CliError::new(
                    "missing_airspaces",
                    "pass --airspaces <file> or configure a dataset and data_location",
                )
            })?;
            data_layout(&config)?.dataset_location(name)
        }
    };
    let index = AirspaceIndex::load_dataset(&source)?;

    let store = GraphStore::open(&paths.database)?;
    store.save_airspaces(&index).map_err(|err| match err {
        rusqlite::Error::InvalidQuery => CliError::new(
            "airspaces_locked",
            "stored graph was built against a different airspace list; remove .handover/graph.sqlite to rebuild",
        ),
        other => other.into(),
    })?;
    write_default_config(paths, dataset.as_deref())?;

    print_json(&json!({
        "status": "ok",
        "handover_dir": paths.root,
        "database": paths.database,
        "airspaces": index.len(),
        "source": source,
        "dataset": dataset,
        "mode": match paths.mode {
            StorageMode::RepoLocal => "repo",
            StorageMode::Global => "global",
        },
    }))
}

fn cmd_ingest(cwd: &Path, paths: &RepoPaths, args: IngestArgs) -> Result<(), CliError> {
    require_initialized_paths(paths)?;
    let home = home_dir()?;
    let mut candidates = resolve_source_files(cwd, &home, &args.sources)?;

    if let (Some(start), Some(end)) = (&args.start, &args.end) {
        let config = load_config(cwd, paths)?;
        let dataset = args
            .dataset
            .clone()
            .or_else(|| config.dataset.clone())
            .ok_or_else(|| {
                CliError::new(
                    "missing_dataset",
                    "time windows need --dataset or a configured dataset",
                )
            })?;
        config.dataset_bounds(&dataset)?;
        let window = TimeWindow {
            start: parse_time(start)?,
            end: parse_time(end)?,
            step: TimeDelta::try_minutes(args.step_minutes).ok_or_else(|| {
                CliError::new(
                    "invalid_step",
                    format!("--step-minutes {} is out of range", args.step_minutes),
                )
            })?,
        };
        let layout = data_layout(&config)?;
        candidates.extend(handover::matrix::aggregate::window_paths(
            &layout, &dataset, &window,
        )?);
    }

    candidates.sort();
    candidates.dedup();
    if candidates.is_empty() {
        return Err(CliError::new(
            "missing_sources",
            "no matrix sources given; pass files, directories, globs or --start/--end",
        ));
    }

    let store = GraphStore::open(&paths.database)?;
    let mut selected = Vec::new();
    let mut matrices = Vec::new();
    let mut skipped_unchanged = 0usize;
    for path in &candidates {
        let bytes = fs::read(path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                CliError::from(MatrixError::MissingSource {
                    path: path.display().to_string(),
                })
            } else {
                CliError::new("read_source_error", format!("{}: {err}", path.display()))
            }
        })?;
        let key = source_key(path);
        let digest = sha256_hex(&bytes);
        if !args.force && store.has_ingested(&key, &digest)? {
            skipped_unchanged += 1;
            continue;
        }
        // The digest recorded is the one of the bytes merged.
        matrices.push(decode_source(path, &bytes));
        selected.push((key, digest));
    }

    let merged = match sum_matrices(matrices)? {
        Some(delta) => {
            let index = store.load_airspaces()?;
            let mut current = store.load_graph()?;
            graph::merge(&mut current, &delta, &index)?;
            store.save_ingest(&current, &selected)?;
            info!(
                sources = selected.len(),
                handovers = delta.total(),
                "ingested matrices"
            );
            delta.total()
        }
        None => 0,
    };

    print_json(&json!({
        "status": "ok",
        "scanned_sources": candidates.len(),
        "ingested_sources": selected.len(),
        "skipped_unchanged": skipped_unchanged,
        "handovers_added": merged,
    }))
}

fn cmd_stats(paths: &RepoPaths, args: StatsArgs) -> Result<(), CliError> {
    require_initialized_paths(paths)?;
    let store = GraphStore::open(&paths.database)?;
    let graph = store.load_graph()?;
    let average = if args.median {
        Average::Median
    } else {
        Average::Mean
    };

    print_json(&json!({
        "airspaces": store.airspace_count()?,
        "nodes": graph.node_count(),
        "edges": graph.edge_count(),
        "average": if args.median { "median" } else { "mean" },
        "average_edge_weight": graph.average_edge_weight(average),
        "ingested_sources": store.ingested_sources()?.len(),
    }))
}

fn cmd_airspace(paths: &RepoPaths, args: AirspaceArgs) -> Result<(), CliError> {
    require_initialized_paths(paths)?;
    let store = GraphStore::open(&paths.database)?;
    let index = store.load_airspaces()?;
    let value = match index.resolve_str(&args.airspace) {
        Some(airspace) => json!({
            "found": true,
            "airspace": airspace,
        }),
        None => json!({
            "found": false,
            "query": args.airspace,
        }),
    };
    print_json(&value)
}

fn cmd_edge(cwd: &Path, paths: &RepoPaths, args: EdgeArgs) -> Result<(), CliError> {
    require_initialized_paths(paths)?;
    let config = load_config(cwd, paths)?;
    let store = GraphStore::open(&paths.database)?;
    let index = store.load_airspaces()?;
    let graph = store.load_graph()?;
    let analyzer = HandoverAnalyzer::new(&index, &graph, config.confidence)?;

    let from = resolve_ref(&index, &args.from);
    let to = resolve_ref(&index, &args.to);
    let value = match analyzer.edge_weight(&from, &to) {
        Some(weight) => {
            let (name1, name2) = names_of(&index, &from, &to);
            let weight_adjusted = graph
                .edge(&name1, &name2)
                .map(|edge| edge.weight_adjusted)
                .unwrap_or(0.0);
            json!({
                "found": true,
                "from": name1,
                "to": name2,
                "weight": weight,
                "weight_adjusted": weight_adjusted,
            })
        }
        None => json!({
            "found": false,
            "from": args.from,
            "to": args.to,
            "weight": 0,
            "weight_adjusted": 0.0,
        }),
    };
    print_json(&value)
}

fn cmd_handover(cwd: &Path, paths: &RepoPaths, args: HandoverArgs) -> Result<(), CliError> {
    require_initialized_paths(paths)?;
    let config = load_config(cwd, paths)?;
    let confidence = config.confidence.with_updates(args.confidence_update())?;
    let store = GraphStore::open(&paths.database)?;
    let index = store.load_airspaces()?;
    let graph = store.load_graph()?;
    let analyzer = HandoverAnalyzer::new(&index, &graph, confidence)?;

    let from = resolve_ref(&index, &args.from);
    let to = resolve_ref(&index, &args.to);
    let value = match analyzer.handover_confidence(&from, &to, args.distance1, args.distance2) {
        Some(report) => {
            let mut value = serde_json::to_value(&report)?;
            if let Value::Object(map) = &mut value {
                map.insert("found".to_string(), Value::Bool(true));
            }
            value
        }
        None => {
            warn!(from = %args.from, to = %args.to, "handover between unknown airspaces");
            json!({
                "found": false,
                "from": args.from,
                "to": args.to,
            })
        }
    };
    print_json(&value)
}

fn cmd_config(cwd: &Path, paths: &RepoPaths) -> Result<(), CliError> {
    let config = load_config(cwd, paths)?;
    let layout = config
        .data_location
        .as_ref()
        .map(|_| data_layout(&config))
        .transpose()?;
    let bounds = config
        .dataset
        .as_deref()
        .map(|name| config.dataset_bounds(name))
        .transpose()?;
    let dataset_location = match (&layout, config.dataset.as_deref()) {
        (Some(layout), Some(name)) => Some(layout.dataset_location(name)),
        _ => None,
    };

    print_json(&json!({
        "data_location": layout.as_ref().map(|layout| layout.prefix().to_path_buf()),
        "dataset": config.dataset,
        "dataset_bounds": bounds,
        "dataset_location": dataset_location,
        "confidence": config.confidence,
        "database": paths.database,
    }))
}

fn resolve_source_files(
    cwd: &Path,
    home: &Path,
    sources: &[String],
) -> Result<Vec<PathBuf>, CliError> {
    let mut out = Vec::new();
    for source in sources {
        let raw_path = source.trim();
        if raw_path.is_empty() {
            continue;
        }
        let mut expanded = expand_tilde(raw_path, home);
        if expanded.is_relative() {
            expanded = cwd.join(expanded);
        }
        if looks_like_glob(raw_path) {
            out.extend(glob_paths(&expanded)?);
        } else if expanded.is_dir() {
            out.extend(
                WalkDir::new(&expanded)
                    .into_iter()
                    .filter_map(Result::ok)
                    .map(|entry| entry.path().to_path_buf())
                    .filter(|path| path.is_file() && is_matrix_file(path)),
            );
        } else {
            // Missing files surface as missing sources during ingest.
            out.push(expanded);
        }
    }
    Ok(out)
}

fn looks_like_glob(path: &str) -> bool {
    ['*', '?', '[', ']', '{', '}']
        .iter()
        .any(|ch| path.contains(*ch))
}

fn glob_paths(pattern: &Path) -> Result<Vec<PathBuf>, CliError> {
    let pattern_str = pattern.to_string_lossy();
    let mut out = Vec::new();
    let entries = glob(&pattern_str)
        .map_err(|err| CliError::new("glob_error", format!("{} ({pattern_str})", err.msg)))?;
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => out.push(path),
            Ok(_) => {}
            Err(err) => {
                return Err(CliError::new("glob_error", err.to_string()));
            }
        }
    }
    Ok(out)
}

fn parse_time(raw: &str) -> Result<NaiveDateTime, CliError> {
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw.trim(), format).ok())
        .ok_or_else(|| {
            CliError::new(
                "invalid_time",
                format!("cannot parse `{raw}`; expected e.g. 2024-03-01T06:00"),
            )
        })
}

fn resolve_ref(index: &AirspaceIndex, raw: &str) -> AirspaceRef {
    match index.resolve_str(raw) {
        Some(airspace) => AirspaceRef::ById(airspace.id),
        None => AirspaceRef::parse(raw),
    }
}

fn names_of(index: &AirspaceIndex, from: &AirspaceRef, to: &AirspaceRef) -> (String, String) {
    let name = |airspace: &AirspaceRef| {
        index
            .get(airspace)
            .map(|airspace| airspace.name.clone())
            .unwrap_or_default()
    };
    (name(from), name(to))
}

fn load_config(cwd: &Path, paths: &RepoPaths) -> Result<EffectiveConfig, CliError> {
    Ok(load_effective_config(
        cwd,
        Some(&paths.repo_config),
        Some(&paths.user_config),
    )?)
}

fn data_layout(config: &EffectiveConfig) -> Result<DataLayout, CliError> {
    let raw = config.data_location.as_deref().ok_or_else(|| {
        CliError::new(
            "missing_data_location",
            "set data_location in .handover/config.yml or ~/.handover/config.yml",
        )
    })?;
    Ok(DataLayout::new(expand_tilde(raw, &home_dir()?)))
}

fn repo_paths(cwd: &Path, global: bool) -> Result<RepoPaths, CliError> {
    let home = home_dir()?;
    let (root, mode) = if global {
        (home.join(".handover"), StorageMode::Global)
    } else {
        (cwd.join(".handover"), StorageMode::RepoLocal)
    };

    Ok(RepoPaths {
        database: root.join("graph.sqlite"),
        repo_config: cwd.join(".handover").join("config.yml"),
        user_config: home.join(".handover").join("config.yml"),
        root,
        mode,
    })
}

fn require_initialized_paths(paths: &RepoPaths) -> Result<(), CliError> {
    if !paths.root.exists() || !paths.database.exists() {
        return Err(CliError::new(
            "not_initialized",
            "handover graph is not initialized; run `handover init`",
        ));
    }
    Ok(())
}

fn write_default_config(paths: &RepoPaths, dataset: Option<&str>) -> Result<(), CliError> {
    let config_path = match paths.mode {
        StorageMode::RepoLocal => &paths.repo_config,
        StorageMode::Global => &paths.user_config,
    };
    if config_path.exists() {
        return Ok(());
    }
    atomic_write(config_path, default_repo_config_yaml(dataset).as_bytes())
        .map_err(|err| CliError::io("write_error", err))
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new("home_error", "HOME environment variable is not set"))
}

fn source_key(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}

fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
