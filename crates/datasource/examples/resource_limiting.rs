//! Resource-limiting data source example.
//!
//! This example configures a data source over the in-memory mock driver,
//! saturates it with more workers than connections, and shows blocking
//! checkout, timeouts, a dead connection being replaced, and disposal.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=excalibur_datasource=debug cargo run --example resource_limiting
//! ```

use std::time::Duration;

use excalibur_datasource::{DataSource, DataSourceSettings, PoolError, ResourceLimitingDataSource};
use excalibur_datasource_testing::MockDriver;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), PoolError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings: DataSourceSettings = serde_json::from_str(
        r#"{
            "url": "mock://inventory",
            "user": "app",
            "max-size": 2,
            "blocking": true,
            "block-timeout-ms": 200,
            "trim-interval-ms": 500,
            "keep-alive-age-ms": 50
        }"#,
    )
    .map_err(|e| PoolError::Configuration(e.to_string()))?;

    let driver = MockDriver::new();
    let data_source = std::sync::Arc::new(ResourceLimitingDataSource::new("inventory"));
    data_source.configure(driver.clone(), settings).await?;

    println!("=== Saturating the pool ===\n");
    let mut workers = Vec::new();
    for worker in 0..5 {
        let data_source = std::sync::Arc::clone(&data_source);
        workers.push(tokio::spawn(async move {
            match data_source.get_connection().await {
                Ok(mut conn) => {
                    conn.execute(&format!("UPDATE stock SET reserved = {worker}")).await.ok();
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    println!("  worker {worker}: done on connection {}", conn.id());
                }
                Err(e) => println!("  worker {worker}: {e}"),
            }
        }));
    }
    for worker in workers {
        worker.await.ok();
    }
    if let Some(status) = data_source.status() {
        println!("\n  idle={} active={} size={}", status.idle, status.active, status.size);
    }

    println!("\n=== Replacing a dead connection ===\n");
    let conn = data_source.get_connection().await?;
    let dead = conn.raw().id();
    drop(conn);
    driver.kill(dead);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let conn = data_source.get_connection().await?;
    println!("  killed mock connection {dead}, got mock connection {}", conn.raw().id());
    println!("  keep-alive probes run: {}", driver.probes());
    drop(conn);

    println!("\n=== Disposing ===\n");
    data_source.dispose().await;
    match data_source.get_connection().await {
        Ok(_) => println!("  unexpected connection after dispose"),
        Err(e) => println!("  after dispose: {e}"),
    }
    println!(
        "  driver opened {} connections and closed {}",
        driver.connects(),
        driver.closes()
    );

    Ok(())
}
