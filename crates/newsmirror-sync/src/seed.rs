use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use newsmirror_core::{validate_reference, OrganizationalUnit, Topic};
use newsmirror_storage::RecordStore;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default, alias = "sources")]
    units: BTreeMap<String, UnitSeed>,
    #[serde(default, alias = "themes")]
    topics: Vec<TopicSeed>,
}

#[derive(Debug, Deserialize)]
struct UnitSeed {
    name: String,
    #[serde(default, rename = "type")]
    unit_type: Option<String>,
    #[serde(default)]
    parent: Option<String>,
}

/// Topics either list `level`/`parent` explicitly or nest through `children`,
/// where depth gives the level and the enclosing topic the parent.
#[derive(Debug, Deserialize)]
struct TopicSeed {
    code: String,
    #[serde(alias = "name")]
    label: String,
    #[serde(default)]
    level: Option<i16>,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    children: Vec<TopicSeed>,
}

/// Reference rows parsed from one or more seed files. Ids are assigned by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedData {
    pub units: Vec<OrganizationalUnit>,
    pub topics: Vec<Topic>,
}

impl SeedData {
    pub fn merge(&mut self, other: SeedData) {
        self.units.extend(other.units);
        self.topics.extend(other.topics);
    }

    pub fn validate(&self) -> Result<()> {
        validate_reference(&self.units, &self.topics).context("validating seed data")
    }
}

fn flatten_topics(seeds: Vec<TopicSeed>, depth: i16, enclosing: Option<&str>, out: &mut Vec<Topic>) {
    for seed in seeds {
        let level = seed.level.unwrap_or(depth);
        out.push(Topic {
            id: 0,
            code: seed.code.clone(),
            label: seed.label,
            level,
            parent_code: seed
                .parent
                .filter(|p| !p.trim().is_empty())
                .or_else(|| enclosing.map(str::to_string)),
        });
        flatten_topics(seed.children, level + 1, Some(&seed.code), out);
    }
}

pub fn parse_seed(text: &str) -> Result<SeedData> {
    let file: SeedFile = serde_yaml::from_str(text).context("parsing seed yaml")?;
    let units = file
        .units
        .into_iter()
        .map(|(key, unit)| OrganizationalUnit {
            id: 0,
            key,
            name: unit.name,
            unit_type: unit.unit_type,
            parent_key: unit.parent.filter(|p| !p.trim().is_empty()),
        })
        .collect();
    let mut topics = Vec::new();
    flatten_topics(file.topics, 1, None, &mut topics);
    // Parents before children.
    topics.sort_by_key(|t| t.level);
    Ok(SeedData { units, topics })
}

pub fn load_seed_file(path: &Path) -> Result<SeedData> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_seed(&text).with_context(|| format!("loading seed {}", path.display()))
}

/// Merge every file, validate the whole set, then upsert it. Returns `(units, topics)` written.
pub async fn seed_from_file(store: &dyn RecordStore, paths: &[impl AsRef<Path>]) -> Result<(u64, u64)> {
    let mut data = SeedData::default();
    for path in paths {
        data.merge(load_seed_file(path.as_ref())?);
    }
    data.validate()?;
    let (units, topics) = store
        .seed_reference(&data.units, &data.topics)
        .await
        .context("writing reference data")?;
    info!(units, topics, "reference data seeded");
    Ok((units, topics))
}
