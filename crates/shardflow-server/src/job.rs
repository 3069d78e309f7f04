//! Job file loading.
//!
//! A job file is TOML:
//!
//! ```toml
//! name = "orders-migration"
//! replay = "orders.json"
//!
//! [importer]
//! "batch.size" = 500
//! "needs.ordering" = true
//! ```
//!
//! Values under `[importer]` are flattened into the string properties of a
//! [`JobConfig`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use shardflow_cdc::JobConfig;

#[derive(Debug, Deserialize)]
struct JobFile {
    name: String,
    replay: Option<PathBuf>,
    #[serde(default)]
    importer: toml::Table,
}

/// A loaded job.
#[derive(Debug)]
pub struct Job {
    /// Importer properties.
    pub config: JobConfig,
    /// Replay file, resolved against the job file's directory.
    pub replay: Option<PathBuf>,
}

/// Loads a job file.
pub fn load(path: &Path) -> Result<Job> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading job file {}", path.display()))?;
    let file: JobFile = toml::from_str(&content)
        .with_context(|| format!("parsing job file {}", path.display()))?;

    let mut properties = HashMap::with_capacity(file.importer.len());
    for (key, value) in file.importer {
        properties.insert(key.clone(), property_value(&key, value)?);
    }
    let replay = file.replay.map(|replay| match path.parent() {
        Some(dir) if replay.is_relative() => dir.join(replay),
        _ => replay,
    });

    Ok(Job {
        config: JobConfig::with_properties(file.name, properties),
        replay,
    })
}

fn property_value(key: &str, value: toml::Value) -> Result<String> {
    Ok(match value {
        toml::Value::String(s) => s,
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(dt) => dt.to_string(),
        toml::Value::Array(_) | toml::Value::Table(_) => {
            bail!("importer property '{key}' must be a scalar")
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use shardflow_cdc::ImporterConfig;

    use super::*;

    fn write_job(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("job.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_job(
            dir.path(),
            r#"
name = "orders"
replay = "orders.json"

[importer]
"batch.size" = 500
"needs.ordering" = false
"poll.timeout.ms" = "20"
"#,
        );

        let job = load(&path).unwrap();
        assert_eq!(job.config.job_name(), "orders");
        assert_eq!(job.replay.unwrap(), dir.path().join("orders.json"));

        let cfg = ImporterConfig::from_config(&job.config).unwrap();
        assert_eq!(cfg.batch_size, 500);
        assert!(!cfg.needs_ordering);
        assert_eq!(cfg.poll_timeout.as_millis(), 20);
    }

    #[test]
    fn test_importer_section_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_job(dir.path(), "name = \"bare\"\n");
        let job = load(&path).unwrap();
        assert!(job.config.properties().is_empty());
        assert!(job.replay.is_none());
    }

    #[test]
    fn test_nested_property_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_job(
            dir.path(),
            "name = \"bad\"\n[importer]\n\"batch.size\" = [1, 2]\n",
        );
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent.toml")).is_err());
    }
}
