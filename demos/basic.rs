// demos/basic.rs
//
// PGSLOT=my_slot START_LSN="0/16B6C50" cargo run --example basic --features demos

use pglogstream::{Control, Replicator, StreamEvent};

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pglogstream=debug".into()),
        )
        .init();

    let conninfo = format!(
        "host={} port={} user={} password={} dbname={} slot={} startpos={}",
        env("PGHOST", "127.0.0.1"),
        env("PGPORT", "5432"),
        env("PGUSER", "postgres"),
        env("PGPASSWORD", "postgres"),
        env("PGDATABASE", "postgres"),
        env("PGSLOT", "my_slot"),
        env("START_LSN", "0/0"),
    );

    let mut replicator = Replicator::from_conninfo(&conninfo)?;

    replicator
        .replicate(|event| {
            match event {
                StreamEvent::WalData { wal_start, payload } => {
                    println!("{wal_start}  {}", String::from_utf8_lossy(payload));
                }
                StreamEvent::StatusUpdate { acked } => {
                    println!("-- acknowledged {acked}");
                }
            }
            Ok(Control::Continue)
        })
        .await?;

    println!("stream ended cleanly");
    Ok(())
}
