use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use chai_relay::connection::{serve, RelayState};
use chai_relay::{db, messages, Clock, ConnectionRegistry, SystemClock};

/// Cadence of the retention sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Command-line arguments for the relay daemon.
struct Args {
    db_path: String,
    listen_addr: String,
    retention_days: i64,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut db_path = String::from("chai-relay.db");
    let mut listen_addr = String::from("127.0.0.1:7700");
    let mut retention_days: i64 = 30;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--db" => db_path = args.next().unwrap_or_default(),
            "--listen" => listen_addr = args.next().unwrap_or_default(),
            "--retention-days" => {
                retention_days = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(retention_days);
            }
            _ => {}
        }
    }

    Args {
        db_path,
        listen_addr,
        retention_days,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    tracing::info!("chai-relay starting");

    let args = parse_args();

    let db = match db::open(&args.db_path) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, path = %args.db_path, "failed to open relay database");
            std::process::exit(1);
        }
    };

    let state = Arc::new(RelayState {
        db: db.clone(),
        registry: ConnectionRegistry::new(),
        clock: Arc::new(SystemClock),
    });

    // Retention sweep: delivered or not, envelopes age out.
    let retention_millis = args.retention_days * 24 * 3600 * 1000;
    let sweep_db = db.clone();
    tokio::spawn(async move {
        let clock = SystemClock;
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let cutoff = clock.now_millis() - retention_millis;
            match messages::sweep_expired(&sweep_db, cutoff) {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "retention sweep"),
                Err(e) => tracing::error!(error = %e, "retention sweep failed"),
            }
        }
    });

    let listener = match TcpListener::bind(&args.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %args.listen_addr, "failed to bind listener");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %args.listen_addr, "chai-relay listening");

    serve(listener, state).await;
}
