//! Submit command implementation.

use anyhow::{Context, Result, bail};
use clap::Args;
use colored::Colorize;
use futures::StreamExt;
use meshforge_abstraction::ParamMap;
use meshforge_orchestrator::{BatchItem, BatchOrchestrator, BatchStatus, ProgressEvent, TaskStatus};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Arguments of `mforge submit`.
#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Model type (e.g. trellis, hunyuan3d)
    #[arg(short, long)]
    pub model: String,

    /// Generation parameter as key=value; the value is read as JSON when it parses
    #[arg(short, long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// JSON file with an object of generation parameters
    #[arg(long)]
    pub params_file: Option<PathBuf>,

    /// Worker pool size for this run (overrides max_concurrency)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Source images: local paths or http(s) URLs
    #[arg(required = true)]
    pub sources: Vec<String>,
}

/// Run a batch to completion, printing progress to stderr and the report to stdout.
pub async fn execute(orchestrator: &BatchOrchestrator, args: SubmitArgs) -> Result<()> {
    let params = collect_params(args.params_file.as_deref(), &args.params)?;
    let items = build_items(&args.sources);

    let mut events = orchestrator.publisher().subscribe_all_stream();
    let ticket = orchestrator
        .submit_batch(&args.model, items.clone(), params)
        .await
        .context("Batch rejected")?;

    eprintln!(
        "{} {} ({} files, ~{}s)",
        "Submitted".bold().cyan(),
        ticket.job_id,
        ticket.task_ids.len(),
        ticket.estimated_seconds
    );

    let labels: HashMap<String, String> = ticket
        .task_ids
        .iter()
        .cloned()
        .zip(items.into_iter().map(|item| item.item_id))
        .collect();
    let wanted: HashSet<&String> = labels.keys().collect();

    let wait = orchestrator.wait(&ticket.job_id);
    tokio::pin!(wait);
    let mut interrupted = false;

    let report = loop {
        tokio::select! {
            report = &mut wait => break report?,
            Some(event) = events.next() => {
                if wanted.contains(&event.task_id) {
                    print_event(&labels, &event);
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!(job_id = %ticket.job_id, "Interrupted, cancelling batch");
                orchestrator.cancel(&ticket.job_id).await?;
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.status != BatchStatus::Completed {
        bail!("batch {} finished {}", report.job_id, report.status);
    }
    Ok(())
}

fn print_event(labels: &HashMap<String, String>, event: &ProgressEvent) {
    let label = labels.get(&event.task_id).map_or(event.task_id.as_str(), String::as_str);
    let status = match event.status {
        TaskStatus::Completed => event.status.as_str().green(),
        TaskStatus::Failed | TaskStatus::TimedOut => event.status.as_str().red(),
        _ => event.status.as_str().yellow(),
    };
    eprintln!("  [{}] {:>3}% {} {}", label, event.percent, status, event.message.dimmed());
}

/// Merges the params file (if any) with `key=value` overrides.
fn collect_params(file: Option<&Path>, pairs: &[String]) -> Result<ParamMap> {
    let mut params = match file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str::<Value>(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
            {
                Value::Object(map) => map,
                _ => bail!("{} must contain a JSON object", path.display()),
            }
        }
        None => ParamMap::new(),
    };

    for pair in pairs {
        let (key, value) = parse_param(pair)?;
        params.insert(key, value);
    }
    Ok(params)
}

fn parse_param(pair: &str) -> Result<(String, Value)> {
    let Some((key, raw)) = pair.split_once('=') else {
        bail!("invalid parameter '{}', expected KEY=VALUE", pair);
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("invalid parameter '{}', key is empty", pair);
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Item ids come from file stems; a repeated stem gets its position appended,
/// counting up past any id already taken.
fn build_items(sources: &[String]) -> Vec<BatchItem> {
    let mut seen = HashSet::new();
    sources
        .iter()
        .enumerate()
        .map(|(index, source)| {
            let stem = Path::new(source.trim_end_matches('/'))
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty())
                .map_or_else(|| format!("item-{}", index + 1), str::to_string);
            let mut item_id = stem.clone();
            let mut suffix = index + 1;
            while !seen.insert(item_id.clone()) {
                item_id = format!("{}-{}", stem, suffix);
                suffix += 1;
            }
            BatchItem::new(item_id, source.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_param_values() {
        assert_eq!(parse_param("faceLimit=40000").unwrap(), ("faceLimit".to_string(), json!(40000)));
        assert_eq!(parse_param("texture=true").unwrap().1, json!(true));
        assert_eq!(parse_param("mode=fast").unwrap().1, json!("fast"));
        assert_eq!(parse_param("faceLimit=\"40000\"").unwrap().1, json!("40000"));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=3").is_err());
    }

    #[test]
    fn test_pairs_override_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"faceLimit": 1000, "texture": false}}"#).unwrap();

        let params = collect_params(Some(file.path()), &["faceLimit=2000".to_string()]).unwrap();
        assert_eq!(params["faceLimit"], json!(2000));
        assert_eq!(params["texture"], json!(false));
    }

    #[test]
    fn test_params_file_must_be_object() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[1, 2]").unwrap();
        assert!(collect_params(Some(file.path()), &[]).is_err());
    }

    #[test]
    fn test_item_ids_from_stems() {
        let sources = vec![
            "/imgs/chair.png".to_string(),
            "https://cdn.example/table.jpg".to_string(),
            "/other/chair.png".to_string(),
        ];
        let ids: Vec<_> = build_items(&sources).into_iter().map(|i| i.item_id).collect();
        assert_eq!(ids, vec!["chair", "table", "chair-3"]);
    }

    #[test]
    fn test_item_ids_skip_taken_suffixes() {
        let sources = vec!["a/chair.png".to_string(), "b/chair-3.png".to_string(), "c/chair.png".to_string()];
        let ids: Vec<_> = build_items(&sources).into_iter().map(|i| i.item_id).collect();
        assert_eq!(ids, vec!["chair", "chair-3", "chair-4"]);
    }
}
