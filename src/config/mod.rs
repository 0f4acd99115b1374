use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::confidence::{ConfidenceConfig, ConfidenceError, ConfidenceUpdate};
use crate::matrix::codec::MATRIX_SUFFIX;

pub const PROJECT_CONFIG_FILE: &str = ".handover.project.yml";
const DATE_FORMAT: &str = "%Y%m%d";
const TIME_FORMAT: &str = "%H%M";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("dataset `{0}` not recognised; define its bounds under `datasets:`")]
    UnknownDataset(String),
    #[error("invalid confidence settings: {0}")]
    Confidence(#[from] ConfidenceError),
}

/// Geographic bounds and map detail of a dataset region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatasetBounds {
    pub minlon: f64,
    pub maxlon: f64,
    pub minlat: f64,
    pub maxlat: f64,
    #[serde(default = "default_detail")]
    pub detail: u32,
}

fn default_detail() -> u32 {
    4
}

pub fn known_dataset(name: &str) -> Option<DatasetBounds> {
    let bounds = match name {
        "uk" => DatasetBounds {
            minlon: -11.0,
            maxlon: 6.0,
            minlat: 48.0,
            maxlat: 61.5,
            detail: 7,
        },
        "usa" => DatasetBounds {
            minlon: -130.0,
            maxlon: -58.0,
            minlat: 23.0,
            maxlat: 46.0,
            detail: 4,
        },
        "switzerland" => DatasetBounds {
            minlon: 5.3,
            maxlon: 10.7,
            minlat: 45.5,
            maxlat: 48.0,
            detail: 8,
        },
        _ => return None,
    };
    Some(bounds)
}

/// On-disk locations of airspace datasets, flight dumps and matrices,
/// all addressed by `(dataset, date, time-bucket)` under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    prefix: PathBuf,
}

impl DataLayout {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn dataset_location(&self, dataset: &str) -> PathBuf {
        self.prefix.join(format!("regions_{dataset}_wkt.json"))
    }

    pub fn flights_path(&self, dataset: &str, at: NaiveDateTime) -> PathBuf {
        self.bucket_dir("flights", dataset, at)
            .join(format!("{}.json", at.format(TIME_FORMAT)))
    }

    pub fn matrix_path(&self, dataset: &str, at: NaiveDateTime) -> PathBuf {
        self.bucket_dir("graphs", dataset, at)
            .join(format!("{}{MATRIX_SUFFIX}", at.format(TIME_FORMAT)))
    }

    fn bucket_dir(&self, kind: &str, dataset: &str, at: NaiveDateTime) -> PathBuf {
        self.prefix
            .join(kind)
            .join(dataset)
            .join(at.format(DATE_FORMAT).to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub data_location: Option<String>,
    pub dataset: Option<String>,
    pub datasets: BTreeMap<String, DatasetBounds>,
    pub confidence: ConfidenceConfig,
}

impl EffectiveConfig {
    pub fn dataset_bounds(&self, name: &str) -> Result<DatasetBounds, ConfigError> {
        self.datasets
            .get(name)
            .copied()
            .or_else(|| known_dataset(name))
            .ok_or_else(|| ConfigError::UnknownDataset(name.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    data_location: Option<String>,
    #[serde(default)]
    dataset: Option<String>,
    #[serde(default)]
    datasets: Option<BTreeMap<String, DatasetBounds>>,
    #[serde(default)]
    confidence: Option<ConfidenceUpdate>,
}

#[derive(Debug, Default)]
struct MergedLayers {
    data_location: Option<String>,
    dataset: Option<String>,
    datasets: BTreeMap<String, DatasetBounds>,
    confidence: ConfidenceUpdate,
}

pub fn load_effective_config(
    cwd: &Path,
    repo_config: Option<&Path>,
    user_config: Option<&Path>,
) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = MergedLayers::default();

    if let Some(path) = user_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_layer(path)?);
    }

    if let Some(path) = find_nearest_project_config(cwd) {
        merge_layer(&mut merged, load_config_layer(&path)?);
    }

    if let Some(path) = repo_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_layer(path)?);
    }

    finish(merged)
}

pub fn load_config_file(path: &Path) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = MergedLayers::default();
    merge_layer(&mut merged, load_config_layer(path)?);
    finish(merged)
}

pub fn find_nearest_project_config(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let candidate = dir.join(PROJECT_CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn finish(merged: MergedLayers) -> Result<EffectiveConfig, ConfigError> {
    if let Some(name) = &merged.dataset
        && !merged.datasets.contains_key(name)
        && known_dataset(name).is_none()
    {
        return Err(ConfigError::UnknownDataset(name.clone()));
    }
    let confidence = ConfidenceConfig::default().with_updates(merged.confidence)?;
    Ok(EffectiveConfig {
        data_location: merged.data_location,
        dataset: merged.dataset,
        datasets: merged.datasets,
        confidence,
    })
}

fn merge_layer(merged: &mut MergedLayers, layer: RawConfig) {
    if layer.data_location.is_some() {
        merged.data_location = layer.data_location;
    }
    if layer.dataset.is_some() {
        merged.dataset = layer.dataset;
    }
    if let Some(datasets) = layer.datasets {
        merged.datasets.extend(datasets);
    }
    if let Some(confidence) = layer.confidence {
        merged.confidence = merged.confidence.overlay(confidence);
    }
}

fn load_config_layer(path: &Path) -> Result<RawConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_layer(&content)
}

fn parse_config_layer(content: &str) -> Result<RawConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(RawConfig::default());
    }
    Ok(serde_yaml::from_str(content)?)
}

pub fn default_repo_config_yaml(dataset: Option<&str>) -> String {
    let dataset_line = match dataset {
        Some(name) => format!("dataset: {name}\n"),
        None => "# dataset: uk\n".to_string(),
    };
    format!(
        r#"# data_location: ~/handover-data
{dataset_line}confidence:
  distance_zero: 5000
  distance_one: 3000
  minimum_weight: 50
  minimum_weight_adjusted: 0.05
"#
    )
}

pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn parses_dataset_and_confidence_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            r#"data_location: ~/data
dataset: alps
datasets:
  alps:
    minlon: 5.0
    maxlon: 16.0
    minlat: 43.0
    maxlat: 48.5
confidence:
  minimum_weight: 20
  distance_one: 2500
"#,
        )
        .expect("write config");

        let parsed = load_config_file(&path).expect("parse config");
        assert_eq!(parsed.dataset.as_deref(), Some("alps"));
        assert_eq!(parsed.data_location.as_deref(), Some("~/data"));
        assert_eq!(parsed.confidence.minimum_weight, 20.0);
        assert_eq!(parsed.confidence.distance_one, 2500.0);
        assert_eq!(parsed.confidence.distance_zero, 5000.0);
        let alps = parsed.dataset_bounds("alps").expect("custom dataset");
        assert_eq!(alps.detail, 4);
    }

    #[test]
    fn unknown_dataset_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        fs::write(&path, "dataset: atlantis\n").expect("write config");
        assert!(matches!(
            load_config_file(&path),
            Err(ConfigError::UnknownDataset(name)) if name == "atlantis"
        ));
    }

    #[test]
    fn inverted_distance_thresholds_fail_at_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        fs::write(&path, "confidence:\n  distance_zero: 2000\n").expect("write config");
        assert!(matches!(
            load_config_file(&path),
            Err(ConfigError::Confidence(_))
        ));
    }

    #[test]
    fn expands_tilde_paths() {
        let expanded = expand_tilde("~/data", Path::new("/home/tester"));
        assert_eq!(expanded, Path::new("/home/tester/data"));
    }

    #[test]
    fn layout_formats_bucketed_paths() {
        let layout = DataLayout::new("/srv/data");
        let at = NaiveDate::from_ymd_opt(2024, 1, 9)
            .and_then(|date| date.and_hms_opt(13, 0, 0))
            .expect("time");
        assert_eq!(
            layout.dataset_location("uk"),
            Path::new("/srv/data/regions_uk_wkt.json")
        );
        assert_eq!(
            layout.flights_path("uk", at),
            Path::new("/srv/data/flights/uk/20240109/1300.json")
        );
        assert_eq!(
            layout.matrix_path("uk", at),
            Path::new("/srv/data/graphs/uk/20240109/1300.matrix.zst")
        );
    }

    #[test]
    fn merges_user_project_and_repo_layers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let repo = root.join("workspace/repo");
        fs::create_dir_all(repo.join(".handover")).expect("repo config dir");
        fs::create_dir_all(root.join("home/.handover")).expect("home config dir");

        let user_cfg = root.join("home/.handover/config.yml");
        fs::write(
            &user_cfg,
            "data_location: /user/data\ndataset: usa\nconfidence:\n  minimum_weight: 10\n",
        )
        .expect("write user config");

        fs::write(
            root.join("workspace").join(PROJECT_CONFIG_FILE),
            "dataset: switzerland\nconfidence:\n  confidence_weight: 0.5\n",
        )
        .expect("write project config");

        let repo_cfg = repo.join(".handover/config.yml");
        fs::write(&repo_cfg, "confidence:\n  minimum_weight: 75\n").expect("write repo config");

        let merged =
            load_effective_config(&repo, Some(&repo_cfg), Some(&user_cfg)).expect("merge config");
        assert_eq!(merged.data_location.as_deref(), Some("/user/data"));
        assert_eq!(merged.dataset.as_deref(), Some("switzerland"));
        assert_eq!(merged.confidence.minimum_weight, 75.0);
        assert_eq!(merged.confidence.confidence_weight, 0.5);
        assert_eq!(
            merged.dataset_bounds("switzerland").expect("known").detail,
            8
        );
    }

    #[test]
    fn default_config_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        fs::write(&path, default_repo_config_yaml(Some("uk"))).expect("write");
        let parsed = load_config_file(&path).expect("parse default");
        assert_eq!(parsed.dataset.as_deref(), Some("uk"));
        assert_eq!(parsed.confidence, ConfidenceConfig::default());
    }
}
