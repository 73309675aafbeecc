use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gridfeed_core::{DataSource, DATE_PLACEHOLDER, MONTH_PLACEHOLDER};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

const BUILTIN_CATALOG: &str = include_str!("../../../sources.yaml");

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading source catalog {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing source catalog: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("source {0} is declared more than once")]
    DuplicateSource(String),
    #[error("source {source_id}: url_template must contain {{YYYYMMDD}}")]
    MissingDatePlaceholder { source_id: String },
    #[error("source {source_id}: archive_template must contain {{YYYYMM01}}")]
    MissingMonthPlaceholder { source_id: String },
    #[error("unknown source {0}")]
    UnknownSource(String),
}

#[derive(Debug, Deserialize)]
struct Catalog {
    sources: Vec<DataSource>,
}

/// Immutable catalog of report sources, loaded once at startup.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<Arc<DataSource>>,
}

impl SourceRegistry {
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_yaml_str(BUILTIN_CATALOG)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RegistryError> {
        let catalog: Catalog = serde_yaml::from_str(text)?;
        Self::new(catalog.sources)
    }

    pub async fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| RegistryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml_str(&text)
    }

    /// Catalog from `path` when given, the compiled-in one otherwise.
    pub async fn load_or_builtin(path: Option<&Path>) -> Result<Self, RegistryError> {
        match path {
            Some(path) => Self::load(path).await,
            None => Self::builtin(),
        }
    }

    pub fn new(sources: Vec<DataSource>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for source in &sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(RegistryError::DuplicateSource(source.source_id.clone()));
            }
            if !source.url_template.contains(DATE_PLACEHOLDER) {
                return Err(RegistryError::MissingDatePlaceholder {
                    source_id: source.source_id.clone(),
                });
            }
            if let Some(archive) = &source.archive_template {
                if !archive.contains(MONTH_PLACEHOLDER) {
                    return Err(RegistryError::MissingMonthPlaceholder {
                        source_id: source.source_id.clone(),
                    });
                }
            }
        }

        Ok(Self {
            sources: sources.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn all(&self) -> &[Arc<DataSource>] {
        &self.sources
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Arc<DataSource>> {
        self.sources.iter().filter(|source| source.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&Arc<DataSource>> {
        self.sources
            .iter()
            .find(|source| source.source_id == source_id)
    }

    /// Enabled sources, narrowed to `ids` when non-empty. Unknown ids are an
    /// error; explicitly named disabled sources are included.
    pub fn select(&self, ids: &[String]) -> Result<Vec<Arc<DataSource>>, RegistryError> {
        if ids.is_empty() {
            return Ok(self.enabled().cloned().collect());
        }
        ids.iter()
            .map(|id| {
                self.get(id)
                    .cloned()
                    .ok_or_else(|| RegistryError::UnknownSource(id.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridfeed_core::{FrequencyClass, ParserKind};
    use tempfile::tempdir;

    const CATALOG: &str = r#"
sources:
  - source_id: rt-lbmp
    report_code: P-24A
    display_name: Real-time zonal LBMP
    url_template: "http://mis.test/realtime/{YYYYMMDD}realtime_zone.csv"
    archive_template: "http://mis.test/realtime/{YYYYMM01}realtime_zone_csv.zip"
    frequency: five-minute
    parser: zonal_price
  - source_id: isolf
    report_code: P-7
    display_name: Load forecast
    url_template: "http://mis.test/isolf/{YYYYMMDD}isolf.csv"
    frequency: six-hourly
    parser: load_forecast
    enabled: false
"#;

    #[test]
    fn builtin_catalog_is_valid() {
        let registry = SourceRegistry::builtin().expect("builtin catalog");
        assert!(registry.all().len() >= 10);
        let rt = registry.get("rt-lbmp").expect("rt-lbmp");
        assert_eq!(rt.report_code, "P-24A");
        assert_eq!(rt.frequency, FrequencyClass::FiveMinute);
        assert_eq!(rt.parser, ParserKind::ZonalPrice);
    }

    #[test]
    fn enabled_defaults_to_true_and_select_filters() {
        let registry = SourceRegistry::from_yaml_str(CATALOG).expect("catalog");
        let enabled: Vec<_> = registry.enabled().map(|s| s.source_id.as_str()).collect();
        assert_eq!(enabled, vec!["rt-lbmp"]);

        let named = registry.select(&["isolf".to_string()]).expect("select");
        assert_eq!(named[0].source_id, "isolf");
        assert!(matches!(
            registry.select(&["nope".to_string()]),
            Err(RegistryError::UnknownSource(_))
        ));
    }

    #[test]
    fn validation_rejects_duplicates_and_missing_placeholders() {
        let registry = SourceRegistry::from_yaml_str(CATALOG).expect("catalog");
        let rt = registry.get("rt-lbmp").expect("rt-lbmp").as_ref().clone();
        assert!(matches!(
            SourceRegistry::new(vec![rt.clone(), rt]),
            Err(RegistryError::DuplicateSource(id)) if id == "rt-lbmp"
        ));

        let undated = CATALOG.replace("isolf/{YYYYMMDD}", "isolf/latest");
        assert!(matches!(
            SourceRegistry::from_yaml_str(&undated),
            Err(RegistryError::MissingDatePlaceholder { .. })
        ));

        let bad_archive = CATALOG.replace("{YYYYMM01}realtime", "realtime");
        assert!(matches!(
            SourceRegistry::from_yaml_str(&bad_archive),
            Err(RegistryError::MissingMonthPlaceholder { .. })
        ));
    }

    #[tokio::test]
    async fn loads_catalog_from_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sources.yaml");
        std::fs::write(&path, CATALOG).expect("write catalog");

        let registry = SourceRegistry::load_or_builtin(Some(path.as_path()))
            .await
            .expect("load");
        assert_eq!(registry.all().len(), 2);

        let missing = SourceRegistry::load(&dir.path().join("absent.yaml")).await;
        assert!(matches!(missing, Err(RegistryError::Io { .. })));
    }
}
