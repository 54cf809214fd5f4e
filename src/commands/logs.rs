//! Implementation of the `stdout` and `stderr` commands.

use std::path::Path;

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use regex::Regex;

use crate::commands::CliState;
use crate::commands::EXIT_COMPLETED;
use crate::config::PipelineConfig;
use crate::store::FileStore;
use crate::store::RunLayout;
use crate::store::Store as _;
use crate::store::WorkPackage;
use crate::store::WorkState;

/// Which worker log stream to print.
#[derive(Debug, Clone, Copy)]
pub enum Stream {
    /// The task's standard output.
    Stdout,
    /// The task's standard error.
    Stderr,
}

/// Arguments for the `stdout` and `stderr` commands.
#[derive(Parser, Debug)]
pub struct Args {
    /// Job name, optionally with a package index (`name.INDEX`).
    #[arg(short, long)]
    pub job: Option<String>,

    /// External id (`ARRAY` or `ARRAY_TASK`).
    #[arg(short = 'i', long)]
    pub job_id: Option<String>,

    /// Regex matched against package parameter values; the first matching
    /// package is shown.
    #[arg(short = 'p', long)]
    pub params: Option<String>,
}

/// Prints one work package's log file.
pub async fn logs(args: Args, stream: Stream) -> Result<i32> {
    let state = CliState::load()?;
    let config = PipelineConfig::load(&state.config)?;
    let layout = RunLayout::open_latest(&config)?;
    let store = FileStore::open(&layout)?;
    let packages = store.snapshot().await?;

    let Some(wp) = select_package(&packages, &args)? else {
        bail!("could not find a work package for the given options");
    };

    let path = match stream {
        Stream::Stdout => wp.stdout_log.as_deref(),
        Stream::Stderr => wp.stderr_log.as_deref(),
    };

    match path {
        Some(path) => print_log(path, wp),
        None => println!(
            "work package `{}[{}]` has not been submitted yet",
            wp.job_name, wp.index
        ),
    }

    Ok(EXIT_COMPLETED)
}

/// Prints a log file, or a notice when it is empty or absent.
fn print_log(path: &Path, wp: &WorkPackage) {
    match std::fs::read_to_string(path) {
        Ok(log) if !log.is_empty() => print!("{log}"),
        _ => println!(
            "log file for `{}[{}]` is empty or does not yet exist",
            wp.job_name, wp.index
        ),
    }
}

/// Resolves a work package from the command-line selectors.
fn select_package<'a>(
    packages: &'a [WorkPackage],
    args: &Args,
) -> Result<Option<&'a WorkPackage>> {
    if let Some(selector) = &args.job {
        // `name.3` addresses the fourth package of the job's listing; a
        // bare name falls through to a sensible default below.
        let (job, index) = match selector.rsplit_once('.') {
            Some((job, index)) if index.chars().all(|c| c.is_ascii_digit()) => {
                (job, Some(index.parse::<usize>()?))
            }
            _ => (selector.as_str(), None),
        };

        let of_job: Vec<_> = packages.iter().filter(|wp| wp.base_job() == job).collect();
        return Ok(match index {
            Some(index) => of_job.get(index).copied(),
            // Prefer the first failed package, then the first of the job.
            None => of_job
                .iter()
                .find(|wp| wp.state == WorkState::Failed)
                .copied()
                .or(of_job.first().copied()),
        });
    }

    if let Some(job_id) = &args.job_id {
        if let Ok(external) = job_id.parse::<crate::store::ExternalId>() {
            return Ok(packages.iter().find(|wp| wp.external == Some(external)));
        }

        let array: u64 = job_id.parse()?;
        return Ok(packages
            .iter()
            .find(|wp| wp.external.is_some_and(|e| e.array_job_id == array)));
    }

    if let Some(pattern) = &args.params {
        let regex = Regex::new(pattern)?;
        return Ok(packages.iter().find(|wp| {
            wp.params.as_object().is_some_and(|params| {
                params
                    .values()
                    .any(|value| regex.is_match(&value.to_string()))
            })
        }));
    }

    bail!("please provide one of -j/--job, -i/--job-id, or -p/--params");
}
