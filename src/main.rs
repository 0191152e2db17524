use std::env;
use std::time::Duration;

use anyhow::Context;
use mmtimer::logger::init_logging;
use mmtimer::{system_service, AppConfig, Timer, WaitGate};
use tracing::{info, trace};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match env::args().nth(1) {
        Some(path) => AppConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => AppConfig::default(),
    }
    .with_env_overrides()?;

    init_logging(&config.log);

    let service = system_service();
    let caps = service.capabilities()?;
    info!(
        "{} timer source supports {}..={} ms",
        service.name(),
        caps.period_min,
        caps.period_max
    );

    let timer = Timer::builder(config.timer.clone())
        .service(service.clone())
        .subscriber(|event| {
            trace!(
                "tick {} of timer {} ({} missed)",
                event.tick_number,
                event.timer_id,
                event.missed_ticks
            );
            Ok(())
        })
        .build()
        .context("creating timer")?;
    if !config.timer.auto_start && !timer.start() {
        anyhow::bail!("timer start failed: {}", timer.last_error());
    }

    tokio::time::sleep(Duration::from_millis(config.run_ms)).await;
    let stopped = timer.stop();

    let waited = WaitGate::new(service)
        .wait_async(config.wait_ms)
        .await
        .context("waiting on one-shot timer")?;

    let report = serde_json::json!({
        "config": config.timer,
        "stats": timer.stats(),
        "elapsed_ms": timer.elapsed().map(|d| d.as_millis() as u64),
        "stopped": stopped,
        "wait_fired": waited,
        "last_error": timer.last_error(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
