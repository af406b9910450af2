//! Live controller monitor
//!
//! Connects to the first controller that matches the default filter and
//! prints each telemetry frame with the fuel estimate.
//!
//! Run with: cargo run --example monitor [pit-target-F]

use pitlink_ble::{
    ConnectionEvent, ConnectionSession, ProbeTemperature, Result, SessionConfig, Setting,
    TelemetryUpdate, Verification,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let pit_target: Option<u16> = std::env::args().nth(1).and_then(|arg| arg.parse().ok());

    println!("Controller Monitor");
    println!("==================\n");
    println!("Looking for a controller...\n");

    let session = ConnectionSession::bluetooth(SessionConfig::default()).await?;

    let _events = session.on_connection_event(|event| match event {
        ConnectionEvent::StateChanged { to, .. } => println!("[state] {}", to),
        ConnectionEvent::ConnectAttempt {
            attempt,
            max_attempts,
        } => println!("[connect] attempt {}/{}", attempt, max_attempts),
        ConnectionEvent::AuthorizationPending { reason } => {
            println!("[pairing] not yet authorized: {}", reason)
        }
        ConnectionEvent::ReconnectFailed {
            reason,
            remediation,
        } => println!("[connect] reconnect failed ({:?}): {}", remediation, reason),
        other => println!("[event] {:?}", other),
    });

    let report = session.connect().await?;
    println!(
        "Connected to {} after {} attempt(s), authorized: {}\n",
        report.device, report.attempts, report.authorized
    );

    if let Some(target) = pit_target {
        match session.apply(Setting::PitTarget(target)).await {
            Ok(applied) => println!("Sent pit target, bytes {:02X?}", applied.request.to_bytes()),
            Err(e) => println!("Could not set pit target: {} ({:?})", e, e.remediation()),
        }
    }

    println!("Press Ctrl+C to exit.\n");

    let mut telemetry = session.subscribe_telemetry();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nExiting...");
                break;
            }
            update = telemetry.recv() => match update {
                Ok(update) => display(&update, session.is_stale()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    println!("(skipped {} frames)", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    session.disconnect().await
}

fn temperature(probe: ProbeTemperature) -> String {
    match probe.fahrenheit() {
        Some(f) => format!("{:>3}°F", f),
        None => "  --".to_string(),
    }
}

fn display(update: &TelemetryUpdate, stale: bool) {
    let reading = &update.reading;
    let fan = if reading.is_fan_auto() {
        "auto".to_string()
    } else {
        reading.fan_speed.to_string()
    };

    println!(
        "{} pit {} (set {}°F) food1 {} food2 {} fan {} duty {:>3}% fuel {} ({} %){}",
        update.timestamp.format("%H:%M:%S"),
        temperature(reading.pit_temperature),
        reading.pit_set,
        temperature(reading.food1_temperature),
        temperature(reading.food2_temperature),
        fan,
        reading.fan_duty_percent,
        update.fuel.level,
        update.fuel.level.percent(),
        if stale { " [stale]" } else { "" },
    );

    for transition in &update.alarms {
        println!("  alarm: {:?}", transition);
    }
    for check in &update.checks {
        match check.outcome {
            Verification::Confirmed => println!("  {:?} confirmed", check.setting),
            Verification::Mismatch { expected, observed } => println!(
                "  {:?} not applied: sent {}, controller shows {}",
                check.setting, expected, observed
            ),
            Verification::NotVerifiable => {}
        }
    }
    if update.fuel.low_fuel_alert {
        println!("  LOW FUEL: add charcoal, then restart the estimate");
    }
}
