//! Parameter expansion.
//!
//! Each entry of a job's `param_files` is one of three source shapes:
//!
//! - a **record list** (JSON/YAML sequence of mappings), emitted in file
//!   order;
//! - a **generator** (JSON/YAML mapping whose values are lists), emitting
//!   the full Cartesian product in lexicographic order over the sorted
//!   keys, with the last key as the innermost loop;
//! - a **table** (CSV), one record per row with the header as parameter
//!   names and empty cells as nulls.
//!
//! Expansion is deterministic: repeated expansions of the same inputs yield
//! identical sequences. Records are opaque [`serde_json::Value`] objects
//! that are carried unchanged into the bucket work files.

use std::path::Path;
use std::path::PathBuf;

use itertools::Itertools as _;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::config::JobConfig;

/// Errors produced while expanding a job's parameter sources.
///
/// Expansion errors are fatal for the affected job only; the remaining jobs
/// in the pipeline still run.
#[derive(Debug, Error)]
pub enum ExpandError {
    /// A parameter file could not be read.
    #[error("failed to read param file `{path}`")]
    Read {
        /// The path to the parameter file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A parameter file could not be parsed.
    #[error("failed to parse param file `{path}`: {message}")]
    Parse {
        /// The path to the parameter file.
        path: PathBuf,
        /// A description of the parse failure.
        message: String,
    },

    /// A parameter file has an extension the expander does not recognize.
    #[error("unsupported param file `{0}`: expected YAML, JSON, or CSV")]
    UnsupportedFormat(PathBuf),

    /// A record list contains something other than a mapping.
    #[error("param file `{path}` entry {index} is not a mapping")]
    NotARecord {
        /// The path to the parameter file.
        path: PathBuf,
        /// The position of the offending entry.
        index: usize,
    },

    /// A generator value is not a list.
    #[error("generator `{path}` key `{key}` must map to a list")]
    NotAList {
        /// The path to the parameter file.
        path: PathBuf,
        /// The offending generator key.
        key: String,
    },

    /// A generator value is an empty list, which zeroes the product.
    #[error("generator `{path}` key `{key}` is an empty list")]
    EmptyGenerator {
        /// The path to the parameter file.
        path: PathBuf,
        /// The offending generator key.
        key: String,
    },
}

/// A parameter record along with the source file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedRecord {
    /// The opaque parameter record.
    pub params: Value,
    /// The parameter file that produced the record.
    pub origin: PathBuf,
}

/// Expands a job's parameter sources into an ordered record sequence.
///
/// Sources are concatenated in the order they are declared.
pub fn expand(job: &JobConfig) -> Result<Vec<ExpandedRecord>, ExpandError> {
    let mut records = Vec::new();
    for path in &job.param_files {
        for params in expand_file(path)? {
            records.push(ExpandedRecord {
                params,
                origin: path.clone(),
            });
        }
    }

    Ok(records)
}

/// Expands a single parameter source.
fn expand_file(path: &Path) -> Result<Vec<Value>, ExpandError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yml" | "yaml" | "json") => expand_structured(path),
        Some("csv") => expand_csv(path),
        _ => Err(ExpandError::UnsupportedFormat(path.to_path_buf())),
    }
}

/// Expands a JSON or YAML source: a record list or a Cartesian generator.
fn expand_structured(path: &Path) -> Result<Vec<Value>, ExpandError> {
    let text = std::fs::read_to_string(path).map_err(|source| ExpandError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let value: Value = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&text).map_err(|source| ExpandError::Parse {
            path: path.to_path_buf(),
            message: source.to_string(),
        })?
    } else {
        serde_yaml_ng::from_str(&text).map_err(|source| ExpandError::Parse {
            path: path.to_path_buf(),
            message: source.to_string(),
        })?
    };

    match value {
        Value::Array(entries) => {
            for (index, entry) in entries.iter().enumerate() {
                if !entry.is_object() {
                    return Err(ExpandError::NotARecord {
                        path: path.to_path_buf(),
                        index,
                    });
                }
            }

            Ok(entries)
        }
        Value::Object(generator) => expand_generator(path, generator),
        _ => Err(ExpandError::Parse {
            path: path.to_path_buf(),
            message: "expected a list of records or a generator mapping".to_string(),
        }),
    }
}

/// Expands a generator mapping into the Cartesian product of its values.
///
/// Keys are iterated in sorted order with the last key as the innermost
/// loop, so the product is emitted in lexicographic order. A value that is
/// a single-element list of a list (`[[a, b]]`) contributes the literal
/// list `[a, b]` and is not expanded further; that falls out of treating
/// every outer list element as one candidate value.
fn expand_generator(path: &Path, generator: Map<String, Value>) -> Result<Vec<Value>, ExpandError> {
    let keys: Vec<&String> = generator.keys().sorted().collect();

    let mut axes: Vec<&Vec<Value>> = Vec::with_capacity(keys.len());
    for key in &keys {
        match &generator[key.as_str()] {
            Value::Array(values) if values.is_empty() => {
                return Err(ExpandError::EmptyGenerator {
                    path: path.to_path_buf(),
                    key: (*key).clone(),
                });
            }
            Value::Array(values) => axes.push(values),
            _ => {
                return Err(ExpandError::NotAList {
                    path: path.to_path_buf(),
                    key: (*key).clone(),
                });
            }
        }
    }

    let records = axes
        .into_iter()
        .map(|values| values.iter())
        .multi_cartesian_product()
        .map(|combination| {
            let mut record = Map::new();
            for (key, value) in keys.iter().zip(combination) {
                record.insert((*key).clone(), value.clone());
            }
            Value::Object(record)
        })
        .collect();

    Ok(records)
}

/// Expands a CSV source: one record per row, empty cells become null.
fn expand_csv(path: &Path) -> Result<Vec<Value>, ExpandError> {
    let mut reader = csv::Reader::from_path(path).map_err(|source| ExpandError::Parse {
        path: path.to_path_buf(),
        message: source.to_string(),
    })?;

    let headers = reader
        .headers()
        .map_err(|source| ExpandError::Parse {
            path: path.to_path_buf(),
            message: source.to_string(),
        })?
        .clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|source| ExpandError::Parse {
            path: path.to_path_buf(),
            message: source.to_string(),
        })?;

        let mut record = Map::new();
        for (header, cell) in headers.iter().zip(row.iter()) {
            let value = if cell.is_empty() {
                Value::Null
            } else {
                Value::String(cell.to_string())
            };
            record.insert(header.to_string(), value);
        }

        records.push(Value::Object(record));
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::config::JobConfig;
    use crate::config::Resources;
    use crate::config::TimeLimit;

    /// Builds a job over the given parameter files.
    fn job(param_files: Vec<PathBuf>) -> JobConfig {
        JobConfig {
            name: "expansion".to_string(),
            script: PathBuf::from("script.py"),
            param_files,
            log_dir: PathBuf::from("/tmp/logs"),
            resources: Resources {
                cpus: 1,
                time: TimeLimit::try_from("00:10:00".to_string()).unwrap(),
                memory: None,
            },
            special_cases: vec![],
            path_param: "path".to_string(),
        }
    }

    /// Writes `content` to a file named `name` under `dir`.
    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn record_list_preserves_file_order() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "records.json", r#"[{"x": 1}, {"x": 2}, {"x": 3}]"#);

        let records = expand(&job(vec![path.clone()])).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].params, json!({"x": 1}));
        assert_eq!(records[2].params, json!({"x": 3}));
        assert_eq!(records[0].origin, path);
    }

    #[test]
    fn cartesian_product_is_lexicographic() {
        let dir = TempDir::new().unwrap();
        // Keys are declared out of order; expansion sorts them.
        let path = write(&dir, "grid.yml", "param_2: [c, d]\nparam_1: [a, b]\n");

        let records = expand(&job(vec![path])).unwrap();
        let expected = vec![
            json!({"param_1": "a", "param_2": "c"}),
            json!({"param_1": "a", "param_2": "d"}),
            json!({"param_1": "b", "param_2": "c"}),
            json!({"param_1": "b", "param_2": "d"}),
        ];
        assert_eq!(
            records.iter().map(|r| r.params.clone()).collect::<Vec<_>>(),
            expected
        );
    }

    #[test]
    fn cartesian_product_count() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "grid.yml",
            "a: [1, 2, 3]\nb: [x, y]\nc: [true, false]\n",
        );

        let records = expand(&job(vec![path])).unwrap();
        assert_eq!(records.len(), 3 * 2 * 2);
    }

    #[test]
    fn wrapped_list_is_a_literal_value() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "grid.yml", "bounds: [[1, 2]]\nname: [alpha]\n");

        let records = expand(&job(vec![path])).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].params, json!({"bounds": [1, 2], "name": "alpha"}));
    }

    #[test]
    fn empty_generator_value_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "grid.yml", "a: [1]\nb: []\n");

        let err = expand(&job(vec![path])).unwrap_err();
        assert!(matches!(err, ExpandError::EmptyGenerator { key, .. } if key == "b"));
    }

    #[test]
    fn csv_rows_become_records_with_null_empty_cells() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "cities.csv", "city,population\nberlin,3600000\nlummerland,\n");

        let records = expand(&job(vec![path])).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].params,
            json!({"city": "berlin", "population": "3600000"})
        );
        assert_eq!(
            records[1].params,
            json!({"city": "lummerland", "population": null})
        );
    }

    #[test]
    fn sources_concatenate_in_declared_order() {
        let dir = TempDir::new().unwrap();
        let first = write(&dir, "first.json", r#"[{"x": 1}]"#);
        let second = write(&dir, "second.json", r#"[{"x": 2}]"#);

        let records = expand(&job(vec![second.clone(), first.clone()])).unwrap();
        assert_eq!(records[0].params, json!({"x": 2}));
        assert_eq!(records[0].origin, second);
        assert_eq!(records[1].params, json!({"x": 1}));
        assert_eq!(records[1].origin, first);
    }

    #[test]
    fn expansion_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "grid.yml", "a: [3, 1, 2]\nb: [z, y]\n");
        let job = job(vec![path]);

        let first = expand(&job).unwrap();
        let second = expand(&job).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unsupported_extension_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "params.toml", "x = 1");

        let err = expand(&job(vec![path])).unwrap_err();
        assert!(matches!(err, ExpandError::UnsupportedFormat(_)));
    }

    #[test]
    fn non_record_list_entry_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "records.json", r#"[{"x": 1}, 7]"#);

        let err = expand(&job(vec![path])).unwrap_err();
        assert!(matches!(err, ExpandError::NotARecord { index: 1, .. }));
    }
}
