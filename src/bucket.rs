//! Resource-bucket partitioning.
//!
//! A job's expanded work packages are split into buckets, each submitted as
//! an independent array job with its own resource request: one bucket per
//! special case whose predicate claims at least one package, plus the
//! default bucket for everything else. Special cases are evaluated in
//! config order and the first match claims the package.

use std::fmt;

use serde_json::Value;
use tracing::warn;

use crate::config::JobConfig;
use crate::config::Resources;
use crate::config::SpecialCase;
use crate::params::ExpandedRecord;

/// A group of work packages sharing a resource request, submitted together
/// as one array job.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// The bucket name: `<job>` or `<job>.<special_case>`.
    pub name: String,
    /// The resource request applied to every task in the bucket.
    pub resources: Resources,
    /// The member records, in expanded-sequence order; the position within
    /// this list is the package's array index.
    pub records: Vec<Value>,
}

/// A non-fatal irregularity observed while evaluating a predicate.
///
/// Predicates evaluate conservatively: anything that prevents a constraint
/// from being checked leaves the package in the default bucket.
#[derive(Debug, Clone)]
pub struct PartitionWarning {
    /// The position of the record in the expanded sequence.
    pub record: usize,
    /// The special case whose predicate could not be evaluated.
    pub case: String,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for PartitionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record {} not considered for `{}`: {}",
            self.record, self.case, self.message
        )
    }
}

/// Partitions expanded records into resource buckets.
///
/// Returns the non-empty buckets (special cases in config order, then the
/// default bucket) along with any predicate-evaluation warnings.
pub fn partition(
    job: &JobConfig,
    records: &[ExpandedRecord],
) -> (Vec<Bucket>, Vec<PartitionWarning>) {
    let mut warnings = Vec::new();

    let mut special: Vec<Bucket> = job
        .special_cases
        .iter()
        .map(|case| Bucket {
            name: format!("{}.{}", job.name, case.name),
            resources: case.resources.clone(),
            records: Vec::new(),
        })
        .collect();

    let mut default = Bucket {
        name: job.name.clone(),
        resources: job.resources.clone(),
        records: Vec::new(),
    };

    for (position, record) in records.iter().enumerate() {
        let claimed = job.special_cases.iter().enumerate().find(|(_, case)| {
            matches(job, case, position, &record.params, &mut warnings)
        });

        match claimed {
            Some((i, _)) => special[i].records.push(record.params.clone()),
            None => default.records.push(record.params.clone()),
        }
    }

    for warning in &warnings {
        warn!("job `{job}`: {warning}", job = job.name);
    }

    let mut buckets: Vec<Bucket> = special
        .into_iter()
        .filter(|bucket| !bucket.records.is_empty())
        .collect();
    if !default.records.is_empty() {
        buckets.push(default);
    }

    (buckets, warnings)
}

/// Evaluates a special-case predicate against one record.
///
/// The predicate is satisfied when every listed file exists relative to the
/// record's data directory and every size constraint holds. A missing data
/// directory parameter or unreadable file metadata is conservatively false.
fn matches(
    job: &JobConfig,
    case: &SpecialCase,
    position: usize,
    params: &Value,
    warnings: &mut Vec<PartitionWarning>,
) -> bool {
    let Some(data_dir) = params.get(&job.path_param).and_then(Value::as_str) else {
        warnings.push(PartitionWarning {
            record: position,
            case: case.name.clone(),
            message: format!("record has no `{}` parameter", job.path_param),
        });
        return false;
    };

    for constraint in &case.files {
        let path = std::path::Path::new(data_dir).join(&constraint.path);
        let size = match std::fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                warnings.push(PartitionWarning {
                    record: position,
                    case: case.name.clone(),
                    message: format!("cannot stat `{}`: {e}", path.display()),
                });
                return false;
            }
        };

        if let Some(min) = constraint.size_min
            && size < min
        {
            return false;
        }

        if let Some(max) = constraint.size_max
            && size > max
        {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::config::FileConstraint;
    use crate::config::TimeLimit;

    /// Builds a resource request with the given CPU count.
    fn resources(cpus: u32) -> Resources {
        Resources {
            cpus,
            time: TimeLimit::try_from("01:00:00".to_string()).unwrap(),
            memory: None,
        }
    }

    /// Builds a job with one size-window special case on `geom.csv`.
    fn job_with_case(size_min: Option<u64>, size_max: Option<u64>) -> JobConfig {
        JobConfig {
            name: "feature-engineering".to_string(),
            script: PathBuf::from("script.py"),
            param_files: vec![],
            log_dir: PathBuf::from("/tmp/logs"),
            resources: resources(8),
            special_cases: vec![SpecialCase {
                name: "small-cities".to_string(),
                files: vec![FileConstraint {
                    path: PathBuf::from("geom.csv"),
                    size_min,
                    size_max,
                }],
                resources: resources(1),
            }],
            path_param: "path".to_string(),
        }
    }

    /// Creates a data directory containing a `geom.csv` of `size` bytes and
    /// returns a record pointing at it.
    fn record_with_geom(dir: &TempDir, name: &str, size: usize) -> ExpandedRecord {
        let data_dir = dir.path().join(name);
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("geom.csv"), vec![b'x'; size]).unwrap();

        ExpandedRecord {
            params: json!({"name": name, "path": data_dir.to_str().unwrap()}),
            origin: PathBuf::from("params.json"),
        }
    }

    #[test]
    fn size_window_claims_matching_subset() {
        let dir = TempDir::new().unwrap();
        let records = vec![
            record_with_geom(&dir, "aachen", 10_000),
            record_with_geom(&dir, "berlin", 50_000),
            record_with_geom(&dir, "celle", 10_000),
        ];

        let (buckets, warnings) = partition(&job_with_case(None, Some(20_000)), &records);
        assert!(warnings.is_empty());
        assert_eq!(buckets.len(), 2);

        assert_eq!(buckets[0].name, "feature-engineering.small-cities");
        assert_eq!(buckets[0].resources.cpus, 1);
        assert_eq!(buckets[0].records.len(), 2);
        assert_eq!(buckets[0].records[0]["name"], "aachen");
        assert_eq!(buckets[0].records[1]["name"], "celle");

        assert_eq!(buckets[1].name, "feature-engineering");
        assert_eq!(buckets[1].resources.cpus, 8);
        assert_eq!(buckets[1].records.len(), 1);
        assert_eq!(buckets[1].records[0]["name"], "berlin");
    }

    #[test]
    fn unmatched_predicate_produces_no_bucket() {
        let dir = TempDir::new().unwrap();
        let records = vec![record_with_geom(&dir, "aachen", 50_000)];

        let (buckets, _) = partition(&job_with_case(None, Some(20_000)), &records);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "feature-engineering");
    }

    #[test]
    fn missing_file_falls_to_default_with_warning() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("dresden");
        std::fs::create_dir_all(&data_dir).unwrap();

        let records = vec![ExpandedRecord {
            params: json!({"name": "dresden", "path": data_dir.to_str().unwrap()}),
            origin: PathBuf::from("params.json"),
        }];

        let (buckets, warnings) = partition(&job_with_case(None, Some(20_000)), &records);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "feature-engineering");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].case, "small-cities");
    }

    #[test]
    fn missing_path_param_falls_to_default_with_warning() {
        let records = vec![ExpandedRecord {
            params: json!({"name": "no-path"}),
            origin: PathBuf::from("params.json"),
        }];

        let (buckets, warnings) = partition(&job_with_case(None, Some(20_000)), &records);
        assert_eq!(buckets.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("`path`"));
    }

    #[test]
    fn first_matching_case_claims_the_record() {
        let dir = TempDir::new().unwrap();
        let mut job = job_with_case(None, Some(20_000));
        job.special_cases.push(SpecialCase {
            name: "also-small".to_string(),
            files: vec![FileConstraint {
                path: PathBuf::from("geom.csv"),
                size_min: None,
                size_max: Some(30_000),
            }],
            resources: resources(2),
        });

        let records = vec![record_with_geom(&dir, "aachen", 10_000)];
        let (buckets, _) = partition(&job, &records);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "feature-engineering.small-cities");
    }

    #[test]
    fn size_min_bound_is_honored() {
        let dir = TempDir::new().unwrap();
        let records = vec![
            record_with_geom(&dir, "tiny", 50),
            record_with_geom(&dir, "sized", 5_000),
        ];

        let (buckets, _) = partition(&job_with_case(Some(1_000), Some(20_000)), &records);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].records[0]["name"], "sized");
        assert_eq!(buckets[1].records[0]["name"], "tiny");
    }
}
