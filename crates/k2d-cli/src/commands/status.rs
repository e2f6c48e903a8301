//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    query_running: bool,
    #[serde(default)]
    uptime_seconds: u64,
    last_batch_id: Option<i64>,
    last_batch_at: Option<String>,
    components: BTreeMap<String, ComponentStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    message: Option<String>,
}

/// Show status and health.
pub async fn run(url: &str, metrics_url: Option<&str>) -> Result<()> {
    println!("Checking health at {}...\n", url);

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the k2d ingestion service running?");
            println!("Start it with: k2d ingest --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = match metrics_url {
        Some(url) => url.to_string(),
        None => default_metrics_url(url),
    };

    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

/// The health URL moved to the default metrics port.
fn default_metrics_url(health_url: &str) -> String {
    health_url
        .trim_end_matches('/')
        .trim_end_matches("/health")
        .replace(":8080", ":9090")
        + "/metrics"
}

fn status_tag(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        status_tag(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    println!(
        "Query: {} (up {}s)",
        if health.query_running { "running" } else { "not running" },
        health.uptime_seconds
    );
    if let Some(batch_id) = health.last_batch_id {
        println!(
            "Last batch: {} at {}",
            batch_id,
            health.last_batch_at.as_deref().unwrap_or("?")
        );
    }
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            let tag = status_tag(&status.status);
            if let Some(msg) = &status.message {
                println!("  {} {}: {} ({})", tag, name, status.status, msg);
            } else {
                println!("  {} {}: {}", tag, name, status.status);
            }
        }
    }
}

/// Sum samples per metric name; labelled series are added together.
fn parse_metrics(metrics_text: &str) -> HashMap<&str, f64> {
    let mut values: HashMap<&str, f64> = HashMap::new();

    for line in metrics_text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(series), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let name = series.split('{').next().unwrap_or(series);
        if let Ok(value) = value.parse::<f64>() {
            *values.entry(name).or_default() += value;
        }
    }
    values
}

fn print_metrics(metrics_text: &str) {
    let values = parse_metrics(metrics_text);
    if values.is_empty() {
        println!("No metrics available yet.");
        return;
    }

    let rows = [
        ("Records Consumed:  ", "k2d_records_consumed_total"),
        ("Rows Written:      ", "k2d_rows_written_total"),
        ("Batches Committed: ", "k2d_batches_committed_total"),
        ("Batches Skipped:   ", "k2d_batches_skipped_total"),
        ("Data Loss Events:  ", "k2d_data_loss_events_total"),
        ("Errors:            ", "k2d_errors_total"),
        ("Buffered Rows:     ", "k2d_buffered_rows"),
        ("Consumer Lag:      ", "k2d_consumer_lag"),
        ("Table Version:     ", "k2d_table_version"),
    ];
    for (label, name) in rows {
        if let Some(v) = values.get(name) {
            println!("{}{}", label, format_number(*v as u64));
        }
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_metrics_url() {
        assert_eq!(
            default_metrics_url("http://localhost:8080"),
            "http://localhost:9090/metrics"
        );
        assert_eq!(
            default_metrics_url("http://k2d:8080/health/"),
            "http://k2d:9090/metrics"
        );
    }

    #[test]
    fn test_parse_metrics_sums_labelled_series() {
        let text = "\
# HELP k2d_errors_total Errors by type
# TYPE k2d_errors_total counter
k2d_errors_total{type=\"kafka\"} 2
k2d_errors_total{type=\"delta\"} 1
k2d_rows_written_total 1500
";
        let values = parse_metrics(text);
        assert_eq!(values["k2d_errors_total"], 3.0);
        assert_eq!(values["k2d_rows_written_total"], 1500.0);
    }

    #[test]
    fn test_parse_health_response() {
        let body = r#"{"status":"degraded","query_running":true,"uptime_seconds":12,
            "last_batch_id":4,"last_batch_at":"2026-01-01T00:00:00Z",
            "components":{"kafka":{"status":"degraded","message":"data loss on 1 partition(s)"}}}"#;
        let health: HealthResponse = serde_json::from_str(body).unwrap();
        assert_eq!(health.last_batch_id, Some(4));
        assert_eq!(
            health.components["kafka"].message.as_deref(),
            Some("data loss on 1 partition(s)")
        );
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_500), "1.50K");
        assert_eq!(format_number(2_000_000), "2.00M");
    }
}
