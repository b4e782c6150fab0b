//! Dispatch stress run with latency budgets.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::task::JoinSet;

use rc_core::{ContentType, FilterMatchResult, FrameId, Url};
use rc_dispatch::{ClassificationDispatcher, DispatcherConfig, DispatcherService};

use crate::error::CliError;
use crate::scenario::{Scenario, ScenarioError};

pub struct StressOptions {
    pub requests: usize,
    pub frames: usize,
    pub config: Option<PathBuf>,
}

const BUDGET_DISPATCH_P50_MS: f64 = 5.0;
const BUDGET_DISPATCH_P99_MS: f64 = 50.0;
const BUDGET_DISPATCH_MAX_MS: f64 = 250.0;

#[derive(Debug)]
pub struct StressSummary {
    pub requests: usize,
    pub blocked: usize,
    pub elapsed: Duration,
    /// Per-request latency in milliseconds, sorted
    pub latencies_ms: Vec<f64>,
}

impl StressSummary {
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.requests as f64 / secs
    }
}

pub async fn run_stress(opts: StressOptions) -> Result<(), CliError> {
    let config = match &opts.config {
        Some(path) => DispatcherConfig::load(path)?,
        None => DispatcherConfig::default(),
    };

    println!("Dispatch Stress Check");
    println!("==================================================");
    println!(
        "{} requests across {} frames, {} concurrent evaluations",
        opts.requests, opts.frames, config.max_concurrent_evaluations
    );

    let summary = measure(opts.requests, opts.frames, &config).await?;
    let p50 = percentile(&summary.latencies_ms, 0.50);
    let p99 = percentile(&summary.latencies_ms, 0.99);
    let max = summary.latencies_ms.last().copied().unwrap_or(0.0);

    let mut passed = true;
    println!();
    println!("Results");
    println!("--------------------------------------------------");
    println!("  Blocked:     {} / {}", summary.blocked, summary.requests);
    println!("  Throughput:  {:.0} req/s", summary.throughput());

    passed &= report_budget("Dispatch P50 Latency", p50, BUDGET_DISPATCH_P50_MS, "ms");
    passed &= report_budget("Dispatch P99 Latency", p99, BUDGET_DISPATCH_P99_MS, "ms");
    passed &= report_budget("Dispatch Max Latency", max, BUDGET_DISPATCH_MAX_MS, "ms");

    println!();
    println!("==================================================");

    if passed {
        println!("✓ All dispatch budgets passed");
        Ok(())
    } else {
        Err(CliError::BudgetExceeded)
    }
}

/// Fire `requests` requests at once, spread over `frames` frames, and time
/// each one from dispatch to callback.
pub async fn measure(
    requests: usize,
    frames: usize,
    config: &DispatcherConfig,
) -> Result<StressSummary, CliError> {
    if requests == 0 || frames == 0 {
        return Err(CliError::Usage("--requests and --frames must be at least 1".to_string()));
    }
    config.validate()?;

    let scenario = synthetic_scenario(frames)?;
    let dispatcher = ClassificationDispatcher::new(
        Arc::new(scenario.classifier()),
        Box::new(scenario.frames()),
        Arc::new(scenario.site_keys()),
        config,
    );
    let (handle, task) = DispatcherService::spawn(dispatcher, config.command_buffer);
    let snapshot = scenario.snapshot();

    let started = Instant::now();
    let mut pending = JoinSet::new();
    for n in 0..requests {
        let handle = handle.clone();
        let snapshot = snapshot.clone();
        let frame = FrameId::new(1, (n % frames) as i32);
        let url = synthetic_url(n)?;
        pending.spawn(async move {
            let sent = Instant::now();
            let result = handle
                .evaluate_request(snapshot, url, ContentType::Image, frame)
                .await?;
            Ok::<_, CliError>((result, sent.elapsed().as_secs_f64() * 1000.0))
        });
    }

    let mut latencies_ms = Vec::with_capacity(requests);
    let mut blocked = 0;
    while let Some(joined) = pending.join_next().await {
        let (result, latency) = joined??;
        if result == FilterMatchResult::BlockRule {
            blocked += 1;
        }
        latencies_ms.push(latency);
    }
    let elapsed = started.elapsed();

    handle.shutdown().await?;
    task.await?;

    latencies_ms.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Ok(StressSummary {
        requests,
        blocked,
        elapsed,
        latencies_ms,
    })
}

fn synthetic_scenario(frames: usize) -> Result<Scenario, ScenarioError> {
    let frames: Vec<_> = (0..frames)
        .map(|r| {
            json!({
                "id": format!("1:{}", r),
                "url": format!("https://site{}.example/frame.html", r),
                "ancestors": [format!("https://site{}.example/", r)],
            })
        })
        .collect();
    let scenario = json!({
        "frames": frames,
        "collections": [{
            "subscription": "https://easylist.com/list.txt",
            "block": ["/ads/"],
            "allow": ["/ads/acceptable/"],
        }],
    });
    Scenario::from_json_str(&scenario.to_string())
}

/// Every fourth request hits an ad path.
fn synthetic_url(n: usize) -> Result<Url, CliError> {
    let path = if n % 4 == 0 { "ads/banner" } else { "static/img" };
    Url::parse(&format!("https://cdn{}.example/{}/{}.png", n % 16, path, n))
        .map_err(|e| CliError::Usage(format!("Bad synthetic URL: {}", e)))
}

fn report_budget(name: &str, actual: f64, limit: f64, unit: &str) -> bool {
    let passed = actual <= limit;
    let status = if passed { "✓" } else { "✗" };
    println!(
        "{} {}: {:.2} {} (limit: {:.2} {})",
        status, name, actual, unit, limit, unit
    );
    passed
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * p).ceil() as usize;
    let idx = idx.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx]
}
