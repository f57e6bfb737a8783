use anyhow::{Context, Result};
use clap::Parser;
use failscout::client::{GitHubClient, RateLimiter, MAX_CONCURRENT_CALLS};
use failscout::config::Config;
use failscout::discover::{discover_sources, CacheLocation, DiscoverOptions};
use failscout::events::{DiscoveryEvent, EventSender};
use failscout::models::{ProjectSource, SourceStatus};
use failscout::util::{format_stars, truncate};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

#[derive(Parser, Debug)]
#[command(
    name = "failscout",
    about = "Finds repositories whose failed CI runs publish Playwright test reports",
    version
)]
struct Args {
    /// Maximum repositories to analyze (default from config: 30)
    #[arg(short, long)]
    limit: Option<usize>,

    /// Minimum star count, 0 to disable the filter (default from config: 100)
    #[arg(short = 's', long)]
    min_stars: Option<u32>,

    /// Classify only; never download report artifacts
    #[arg(long)]
    no_verify: bool,

    /// Ignore and do not write the run and quarantine caches
    #[arg(long)]
    no_cache: bool,

    /// Re-analyze repos even if they are quarantined
    #[arg(short, long)]
    fresh: bool,

    /// Write results as JSON to this path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Show every analyzed repo and stage transitions
    #[arg(short, long)]
    verbose: bool,

    /// Suppress progress output (results only)
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load();

    let token = match std::env::var("GITHUB_TOKEN") {
        Ok(token) if !token.trim().is_empty() => token.trim().to_string(),
        _ => {
            eprintln!("  GITHUB_TOKEN is not set.");
            eprintln!("  Create a token at https://github.com/settings/tokens (public repo read access is enough)");
            eprintln!("  and export it before running failscout.");
            std::process::exit(2);
        }
    };

    let cache_location = if args.no_cache {
        CacheLocation::Disabled
    } else {
        CacheLocation::Default
    };
    let options = DiscoverOptions {
        queries: config.effective_queries(),
        limit: args.limit.unwrap_or(config.limit),
        min_stars: args.min_stars.unwrap_or(config.min_stars),
        verify_failures: !args.no_verify && config.verify_failures,
        bypass_quarantine: args.fresh,
        run_cache: cache_location.clone(),
        quarantine_cache: cache_location,
    };

    let limiter = RateLimiter::new(MAX_CONCURRENT_CALLS);
    let client = GitHubClient::new(token, limiter)?;

    let (sender, renderer) = if args.quiet {
        (EventSender::disabled(), None)
    } else {
        let (tx, rx) = mpsc::channel();
        let verbose = args.verbose;
        (
            EventSender::new(tx),
            Some(thread::spawn(move || render_events(rx, verbose))),
        )
    };

    let outcome = discover_sources(&client, &options, &sender).await;
    drop(sender);
    if let Some(handle) = renderer {
        let _ = handle.join();
    }
    let sources = outcome?;

    print_results(&sources);

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&sources)
            .context("Failed to serialize results")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        eprintln!("  💾 Results written to {}", path.display());
    }

    Ok(())
}

// ============================================================================
// Rendering
// ============================================================================

fn render_events(rx: mpsc::Receiver<DiscoveryEvent>, verbose: bool) {
    while let Ok(event) = rx.recv() {
        match event {
            DiscoveryEvent::Started { query_count, limit } => {
                eprintln!(
                    "🔭 Scouting for Playwright repos ({} queries, limit {})...",
                    query_count, limit
                );
            }
            DiscoveryEvent::QueryCompleted { query, found } => {
                if verbose {
                    eprintln!("  🔎 {} → {} new", truncate(&query, 40), found);
                }
            }
            DiscoveryEvent::SearchCompleted {
                candidates,
                skipped_quarantined,
                skipped_low_stars,
            } => {
                eprintln!(
                    "  📋 {} candidates ({} quarantined, {} below star threshold)",
                    candidates, skipped_quarantined, skipped_low_stars
                );
            }
            DiscoveryEvent::AnalysisStarted { repo } => {
                if verbose {
                    eprintln!("  ⏳ {}", repo);
                }
            }
            DiscoveryEvent::AnalysisProgress { repo, stage } => {
                if verbose {
                    eprintln!("     {}: {}", repo, stage);
                }
            }
            DiscoveryEvent::AnalysisCompleted {
                repo,
                status,
                artifact,
                failure_count,
                cache_hit,
                elapsed_ms,
                completed,
                total,
            } => {
                if !verbose && status != SourceStatus::Compatible {
                    continue;
                }
                let mut details: Vec<String> = Vec::new();
                if let Some(count) = failure_count {
                    details.push(format!("{} failures", count));
                }
                if let Some(name) = &artifact {
                    details.push(truncate(name, 30));
                }
                if cache_hit {
                    details.push("cached".to_string());
                }
                details.push(format!("{:.1}s", elapsed_ms as f64 / 1000.0));
                eprintln!(
                    "  [{}/{}] {} {} ({})",
                    completed,
                    total,
                    status_glyph(status),
                    repo,
                    details.join(", ")
                );
            }
            DiscoveryEvent::Completed { total, .. } => {
                eprintln!("  ✨ Done, {} repos analyzed.", total);
            }
        }
    }
}

fn status_glyph(status: SourceStatus) -> &'static str {
    match status {
        SourceStatus::Compatible => "✅",
        SourceStatus::NoFailures => "🟢",
        SourceStatus::HasArtifacts => "📦",
        SourceStatus::NoArtifacts => "📭",
        SourceStatus::NoFailedRuns => "⚪",
        SourceStatus::UnsupportedFormat => "🧩",
        SourceStatus::RateLimited => "🚫",
    }
}

const BREAKDOWN_ORDER: [SourceStatus; 6] = [
    SourceStatus::NoFailures,
    SourceStatus::HasArtifacts,
    SourceStatus::UnsupportedFormat,
    SourceStatus::NoArtifacts,
    SourceStatus::NoFailedRuns,
    SourceStatus::RateLimited,
];

fn print_results(sources: &[ProjectSource]) {
    let compatible: Vec<&ProjectSource> = sources
        .iter()
        .filter(|s| s.status == SourceStatus::Compatible)
        .collect();

    let rule = "═".repeat(60);
    println!();
    println!("{}", rule);
    println!(
        "  {} COMPATIBLE {}",
        compatible.len(),
        if compatible.len() == 1 {
            "REPOSITORY"
        } else {
            "REPOSITORIES"
        }
    );
    println!("{}", rule);

    for source in &compatible {
        println!("  ✅ {} ({} ★)", source.repo, format_stars(source.stars));
        if !source.report_artifacts.is_empty() {
            println!("     reports: {}", source.report_artifacts.join(", "));
        }
        if let Some(url) = &source.run_url {
            println!("     {}", url);
        }
    }

    let mut counts: HashMap<SourceStatus, usize> = HashMap::new();
    for source in sources {
        if source.status != SourceStatus::Compatible {
            *counts.entry(source.status).or_insert(0) += 1;
        }
    }
    let breakdown: Vec<String> = BREAKDOWN_ORDER
        .iter()
        .filter_map(|status| {
            counts
                .get(status)
                .map(|count| format!("{} {}", status.as_str(), count))
        })
        .collect();
    if !breakdown.is_empty() {
        println!();
        println!("  Filtered: {}", breakdown.join(" · "));
    }
    println!();
}
