use std::error::Error;
use std::io::{self, Write};

use tokio::runtime::Runtime;
use trends_scraper::{QueryOptions, TrendsEnv, TrendsRequest, TrendsScraper, VERSION};

fn prompt(label: &str) -> io::Result<String> {
    print!("{} ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn parse_bool(input: &str, default: bool) -> bool {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" => true,
        "n" | "no" | "false" => false,
        _ => default,
    }
}

fn or_default(input: String, default: &str) -> String {
    if input.is_empty() {
        default.to_string()
    } else {
        input
    }
}

#[test]
#[ignore = "Requires network access and manual input"]
fn interactive_live_fetch() -> Result<(), Box<dyn Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("trends-scraper {} interactive smoke test", VERSION);
    println!("Provide inputs when prompted. Press Enter to accept defaults.\n");

    let keywords = or_default(prompt("Keywords (comma separated) [bitcoin]:")?, "bitcoin");
    let timeframe = or_default(prompt("Timeframe [today 3-m]:")?, "today 3-m");
    let geo = or_default(prompt("Geo [IN]:")?, "IN");
    let proxies_answer = prompt("Proxy list (comma separated, blank for env/none):")?;
    let region_answer = prompt("Include region breakdown? (y/N):")?;
    let related_answer = prompt("Include related queries? (y/N):")?;
    let warmup_answer = prompt("Disable warmup browsing? (y/N):")?;

    let keywords: Vec<String> = keywords
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    let mut options = QueryOptions::time_only();
    if parse_bool(&region_answer, false) {
        options = options.with_region();
    }
    if parse_bool(&related_answer, false) {
        options = options.with_related();
    }

    let mut builder = TrendsScraper::builder().with_env(TrendsEnv::from_env()?);
    if !proxies_answer.is_empty() {
        builder = builder.with_proxies(trends_scraper::config::parse_proxy_list(&proxies_answer));
    }
    if parse_bool(&warmup_answer, false) {
        builder = builder.disable_warmup();
    }

    let scraper = builder.build()?;
    let runtime = Runtime::new()?;

    let request = TrendsRequest::new(keywords)
        .with_timeframe(timeframe)
        .with_geo(geo)
        .with_options(options);
    println!("\nFetching {:?}...", request.keywords);
    let result = runtime.block_on(scraper.get_trends(request));

    println!("Status: {:?}", result.status);
    println!(
        "Source: {:?} via {:?}",
        result.metadata.source, result.metadata.connection
    );
    if let Some(warning) = &result.metadata.warning {
        println!("Warning: {}", warning);
    }
    println!("Time points: {}", result.data.time_trends.len());
    println!("Regions: {}", result.data.region_data.len());
    println!("Related keywords: {}", result.data.related_queries.len());
    for error in result.errors.iter().take(10) {
        println!("  error: {}", error);
    }

    let health = scraper.proxy_health();
    println!(
        "\nProxy pool -> total: {}, available: {}, failed: {}",
        health.total_proxies, health.available_proxies, health.failed_proxies
    );
    if let Some(metrics) = scraper.metrics() {
        println!(
            "Metrics -> requests: {}, retries: {}, synthetic: {}",
            metrics.total_requests, metrics.retries, metrics.synthetic_fallbacks
        );
    }

    println!("Interactive test complete. Re-run with different inputs as needed.");
    Ok(())
}
