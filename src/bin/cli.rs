//! indexd CLI
//!
//! Command-line client for a running indexd server:
//! - Push index items
//! - Query metrics, tag catalogs and counters
//! - Trigger and download snapshots
//! - Delete endpoints

use clap::{Parser, Subcommand};
use indexd::{IndexItem, TagPair};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "indexd-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Client for the indexd metric index")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// API server URL
    #[arg(long, default_value = "http://localhost:8030", global = true)]
    pub api_url: String,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Index one series
    Push {
        endpoint: String,
        metric: String,
        /// Tags in key=value format
        #[arg(short = 'T', long)]
        tags: Vec<String>,
        #[arg(long, default_value = "0")]
        step: i64,
        #[arg(long, default_value = "")]
        dstype: String,
    },

    /// List metrics of endpoints
    Metrics {
        endpoints: Vec<String>,
    },

    /// Show tag keys and values of metrics
    Tagkv {
        #[arg(short, long, required = true)]
        endpoints: Vec<String>,
        #[arg(short, long, required = true)]
        metrics: Vec<String>,
    },

    /// List counters matching include/exclude filters
    Clude {
        #[arg(short, long, required = true)]
        endpoints: Vec<String>,
        #[arg(short, long)]
        metric: String,
        /// Filter in key=v1,v2 format
        #[arg(long)]
        include: Vec<String>,
        /// Filter in key=v1,v2 format
        #[arg(long)]
        exclude: Vec<String>,
    },

    /// Write a snapshot on the server
    Dump,

    /// Download the server's snapshot bundle
    Download {
        #[arg(short, long, default_value = "db.tar.gz")]
        output: PathBuf,
    },

    /// Remove endpoints from the index
    DelEndpoint {
        #[arg(required = true)]
        endpoints: Vec<String>,
    },

    /// Show server status
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.api_url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Push {
            endpoint,
            metric,
            tags,
            step,
            dstype,
        } => {
            let mut item = IndexItem::new(endpoint, metric).step(step).ds_type(dstype);
            for tag in &tags {
                match tag.split_once('=') {
                    Some((k, v)) => item = item.tag(k, v),
                    None => {
                        eprintln!("Invalid tag (expected key=value): {}", tag);
                        std::process::exit(1);
                    }
                }
            }

            let response = client
                .post(format!("{}/api/index/push", base))
                .json(&[&item])
                .send()
                .await?;
            let body = expect_success(response).await?;

            if body["invalid"].as_u64().unwrap_or(0) > 0 {
                eprintln!("Item rejected: endpoint and metric are required");
                std::process::exit(1);
            }
            println!("Indexed {} {} [{}]", item.endpoint, item.metric, item.counter());
        }

        Commands::Metrics { endpoints } => {
            let response = client
                .post(format!("{}/api/index/metrics", base))
                .json(&serde_json::json!({ "endpoints": endpoints }))
                .send()
                .await?;
            let body = expect_success(response).await?;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                print_list(&body["metrics"], "No metrics");
            }
        }

        Commands::Tagkv { endpoints, metrics } => {
            let response = client
                .post(format!("{}/api/index/tagkv", base))
                .json(&serde_json::json!({ "endpoints": endpoints, "metrics": metrics }))
                .send()
                .await?;
            let body = expect_success(response).await?;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                for entry in body.as_array().into_iter().flatten() {
                    println!("{}", entry["metric"].as_str().unwrap_or("-"));
                    for pair in entry["tagkv"].as_array().into_iter().flatten() {
                        let values: Vec<&str> = pair["tagv"]
                            .as_array()
                            .into_iter()
                            .flatten()
                            .filter_map(|v| v.as_str())
                            .collect();
                        println!(
                            "  {:<20} {}",
                            pair["tagk"].as_str().unwrap_or("-"),
                            values.join(", ")
                        );
                    }
                }
            }
        }

        Commands::Clude {
            endpoints,
            metric,
            include,
            exclude,
        } => {
            let body = serde_json::json!([{
                "endpoints": endpoints,
                "metric": metric,
                "include": parse_filters(&include)?,
                "exclude": parse_filters(&exclude)?,
            }]);

            let response = client
                .post(format!("{}/api/index/counter/clude", base))
                .json(&body)
                .send()
                .await?;
            let body = expect_success(response).await?;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!("{:<24} {:<8} {:<10} {}", "Endpoint", "Step", "DsType", "Counter");
                println!("{}", "-".repeat(72));
                for item in body.as_array().into_iter().flatten() {
                    for tag in item["tags"].as_array().into_iter().flatten() {
                        println!(
                            "{:<24} {:<8} {:<10} {}",
                            item["endpoint"].as_str().unwrap_or("-"),
                            item["step"].as_i64().unwrap_or(0),
                            item["dstype"].as_str().unwrap_or("-"),
                            tag.as_str().unwrap_or("")
                        );
                    }
                }
            }
        }

        Commands::Dump => {
            let response = client
                .get(format!("{}/api/index/dumpfile", base))
                .send()
                .await?;
            let body = expect_success(response).await?;
            println!(
                "Snapshot written: {} endpoints ({} failed)",
                body["written"].as_u64().unwrap_or(0),
                body["failed"].as_u64().unwrap_or(0)
            );
        }

        Commands::Download { output } => {
            let response = client
                .get(format!("{}/api/index/idxfile", base))
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                eprintln!("Download failed ({}): {}", status, text);
                std::process::exit(1);
            }

            let bytes = response.bytes().await?;
            if let Some(parent) = output.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&output, &bytes)?;
            println!("Saved {} bytes to {:?}", bytes.len(), output);
        }

        Commands::DelEndpoint { endpoints } => {
            let response = client
                .delete(format!("{}/api/index/endpoints", base))
                .json(&serde_json::json!({ "endpoints": endpoints }))
                .send()
                .await?;
            let body = expect_success(response).await?;
            println!("Removed {} endpoints", body["removed"].as_u64().unwrap_or(0));
        }

        Commands::Status => {
            let response = client.get(format!("{}/health", base)).send().await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let health: serde_json::Value = resp.json().await?;

                    println!("indexd v{}", health["version"].as_str().unwrap_or("?"));
                    println!();
                    println!("Status: {}", health["status"].as_str().unwrap_or("unknown"));

                    let index = &health["index"];
                    println!();
                    println!("Index:");
                    for key in ["endpoints", "metrics", "counters", "tag_values", "pending_reports"] {
                        println!("  {:<16} {}", key, index[key].as_u64().unwrap_or(0));
                    }

                    if let Some(uptime) = health["uptime_seconds"].as_u64() {
                        println!();
                        println!("Uptime: {}", format_duration(uptime));
                    }
                }
                Ok(resp) => {
                    eprintln!("API returned error: {}", resp.status());
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Cannot connect to indexd at {}", cli.api_url);
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Exit with the server's message on a non-2xx reply
async fn expect_success(
    response: reqwest::Response,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        eprintln!("Request failed ({}): {}", status, text);
        std::process::exit(1);
    }
    Ok(response.json().await?)
}

/// Parse `key=v1,v2` filters
fn parse_filters(filters: &[String]) -> Result<Vec<TagPair>, Box<dyn std::error::Error>> {
    filters
        .iter()
        .map(|filter| {
            let (key, values) = filter
                .split_once('=')
                .ok_or_else(|| format!("Invalid filter (expected key=v1,v2): {}", filter))?;
            Ok(TagPair::new(
                key,
                values.split(',').map(str::trim).filter(|v| !v.is_empty()),
            ))
        })
        .collect()
}

fn print_list(values: &serde_json::Value, empty: &str) {
    let items: Vec<&str> = values
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .collect();

    if items.is_empty() {
        println!("{}", empty);
    }
    for item in items {
        println!("{}", item);
    }
}

fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filters() {
        let filters = parse_filters(&["core=0, 1".to_string(), "mode=user".to_string()]).unwrap();
        assert_eq!(filters[0], TagPair::new("core", ["0", "1"]));
        assert_eq!(filters[1], TagPair::new("mode", ["user"]));

        assert!(parse_filters(&["core".to_string()]).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(3700), "1h 1m");
    }
}
