//! Firehose: publish synthetic boat data and log a throttled subset of it.
//!
//! Subscribes to `navigation.*` at one value per 500ms and logs the battery
//! voltage unthrottled. Rotates every two seconds, so a few compressed files
//! pile up in the log directory before the run ends.

use serde_json::json;
use sk_delta_log::{Compression, Delta, DeltaBus, DeltaLogger, LifecycleState, LoggerConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let bus = DeltaBus::new();
    let mut logger = DeltaLogger::new(Arc::new(bus.clone()));

    let config = LoggerConfig::builder(dir.path())
        .interval(Duration::from_secs(2))
        .subscribe("navigation.*", 500)
        .subscribe("electrical.batteries.house.voltage", 0)
        .compression(Compression::Zstd { level: 3 })
        .build();

    if let LifecycleState::Disabled(reason) = logger.start(config).await {
        return Err(reason.clone().into());
    }
    println!("[logger] writing to {}", dir.path().display());

    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    for i in 0..120u32 {
        ticker.tick().await;
        let t = f64::from(i) / 20.0;
        bus.publish(
            Delta::new("vessels.self")
                .with_value("navigation.speedOverGround", json!(4.0 + t.sin()))
                .with_value("navigation.courseOverGroundTrue", json!(1.2 + t / 100.0)),
        );
        bus.publish(
            Delta::new("vessels.self")
                .with_value("electrical.batteries.house.voltage", json!(12.6 - t / 50.0)),
        );
        // Not subscribed, never logged.
        bus.publish(
            Delta::new("vessels.self").with_value("environment.wind.speedApparent", json!(t)),
        );
    }

    logger.stop().await;
    // Give the last compression a moment to land.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut names: Vec<String> = std::fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    for name in &names {
        println!("[logger] {name}");
    }
    println!("\nDone: {} entries in the log directory.", names.len());

    Ok(())
}
