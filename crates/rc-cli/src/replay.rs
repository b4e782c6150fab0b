//! Scenario replay through the dispatcher service.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::info;
use serde_json::{json, Value};

use rc_core::{SubscriptionSnapshot, Url};
use rc_dispatch::{
    AdMatched, ClassificationDispatcher, ClassificationObserver, DispatcherConfig, DispatcherHandle,
    DispatcherService, PageAllowed, PopupMatched, SessionStats,
};

use crate::error::CliError;
use crate::scenario::{Event, Scenario};

pub struct ReplayOptions {
    pub scenario: PathBuf,
    pub config: Option<PathBuf>,
}

/// Outcome of one replayed event and the notifications it caused.
#[derive(Debug, Clone)]
pub struct ReplayRecord {
    pub outcome: Value,
    pub notifications: Vec<Value>,
}

#[derive(Debug)]
pub struct ReplayReport {
    pub records: Vec<ReplayRecord>,
    pub stats: Value,
}

pub async fn run_replay(opts: ReplayOptions) -> Result<(), CliError> {
    let scenario = Scenario::load(&opts.scenario)?;
    let config = match &opts.config {
        Some(path) => DispatcherConfig::load(path)?,
        None => DispatcherConfig::default(),
    };

    let report = replay(&scenario, &config).await?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for record in &report.records {
        writeln!(out, "{}", serde_json::to_string(&record.outcome)?)?;
        for notification in &record.notifications {
            writeln!(out, "{}", serde_json::to_string(notification)?)?;
        }
    }
    writeln!(out, "{}", serde_json::to_string(&report.stats)?)?;
    Ok(())
}

/// Dispatch every event of `scenario` in order. Each event is fully settled
/// (including fire-and-forget checks) before the next one is sent.
pub async fn replay(
    scenario: &Scenario,
    config: &DispatcherConfig,
) -> Result<ReplayReport, CliError> {
    config.validate()?;
    let dispatcher = ClassificationDispatcher::new(
        Arc::new(scenario.classifier()),
        Box::new(scenario.frames()),
        Arc::new(scenario.site_keys()),
        config,
    );
    let (handle, task) = DispatcherService::spawn(dispatcher, config.command_buffer);

    let notifications = Arc::new(JsonObserver::default());
    let stats = Arc::new(SessionStats::new());
    stats.start_collecting();
    handle.add_observer(notifications.clone()).await?;
    handle.add_observer(stats.clone()).await?;

    let snapshot = scenario.snapshot();
    let mut records = Vec::with_capacity(scenario.events().len());
    for (index, event) in scenario.events().iter().enumerate() {
        let mut outcome = dispatch(&handle, &snapshot, event).await?;
        handle.flush().await?;
        outcome["event"] = json!(index);
        outcome["kind"] = json!(event.kind());
        outcome["url"] = json!(event.url().as_str());
        records.push(ReplayRecord {
            outcome,
            notifications: notifications.take(),
        });
    }

    handle.shutdown().await?;
    task.await?;
    info!("replayed {} events", records.len());

    let stats = json!({
        "stats": {
            "allowed": counts_json(&stats.allowed_counts()),
            "blocked": counts_json(&stats.blocked_counts()),
        }
    });
    Ok(ReplayReport { records, stats })
}

async fn dispatch(
    handle: &DispatcherHandle,
    snapshot: &SubscriptionSnapshot,
    event: &Event,
) -> Result<Value, CliError> {
    let snapshot = snapshot.clone();
    Ok(match event {
        Event::Request {
            url,
            content_type,
            frame,
        } => {
            let result = handle
                .evaluate_request(snapshot, url.clone(), *content_type, *frame)
                .await?;
            json!({
                "content_type": content_type.as_str(),
                "frame": frame.to_string(),
                "result": result.as_str(),
            })
        }
        Event::Socket { url, frame } => {
            let result = handle
                .evaluate_request_for_socket_upgrade(snapshot, url.clone(), *frame)
                .await?;
            json!({ "frame": frame.to_string(), "result": result.as_str() })
        }
        Event::Response {
            url,
            content_type,
            frame,
            headers,
        } => {
            let result = handle
                .evaluate_response(
                    snapshot,
                    url.clone(),
                    *content_type,
                    *frame,
                    headers.clone(),
                )
                .await?;
            json!({
                "content_type": content_type.as_str(),
                "frame": frame.to_string(),
                "result": result.as_str(),
            })
        }
        Event::Popup { url, frame } => {
            let result = handle.evaluate_popup(snapshot, url.clone(), *frame).await?;
            json!({ "frame": frame.to_string(), "result": result.as_str() })
        }
        Event::Document { url, frame } => {
            handle
                .check_main_document_allowed(snapshot, url.clone(), *frame)
                .await?;
            json!({ "frame": frame.to_string(), "result": "passed_through" })
        }
        Event::Rewrite { url, frame } => {
            let target = handle.evaluate_rewrite(snapshot, url.clone(), *frame).await?;
            json!({
                "frame": frame.to_string(),
                "rewrite": target.as_ref().map(|t| t.as_str()),
            })
        }
    })
}

fn counts_json(counts: &BTreeMap<Url, u64>) -> Value {
    counts
        .iter()
        .map(|(subscription, count)| (subscription.to_string(), json!(count)))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

/// Buffers observer notifications as JSON values.
#[derive(Default)]
struct JsonObserver {
    lines: Mutex<Vec<Value>>,
}

impl JsonObserver {
    fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Value>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClassificationObserver for JsonObserver {
    fn on_ad_matched(&self, event: &AdMatched<'_>) {
        self.lock().push(json!({
            "notification": "ad_matched",
            "url": event.url.as_str(),
            "result": event.result.as_str(),
            "content_type": event.content_type.as_str(),
            "ancestors": event.ancestors.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
            "frame": event.frame.id.to_string(),
            "subscription": event.subscription.as_str(),
        }));
    }

    fn on_page_allowed(&self, event: &PageAllowed<'_>) {
        self.lock().push(json!({
            "notification": "page_allowed",
            "url": event.url.as_str(),
            "frame": event.frame.id.to_string(),
            "subscription": event.subscription.as_str(),
        }));
    }

    fn on_popup_matched(&self, event: &PopupMatched<'_>) {
        self.lock().push(json!({
            "notification": "popup_matched",
            "url": event.url.as_str(),
            "result": event.result.as_str(),
            "opener": event.opener.map(|o| o.as_str()),
            "frame": event.frame.id.to_string(),
            "subscription": event.subscription.as_str(),
        }));
    }
}
