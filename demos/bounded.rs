// demos/bounded.rs
//
// Replay a slot up to a fixed end position, then exit.
//
// PGSLOT=my_slot END_LSN="0/16B6C50" cargo run --example bounded --features demos

use pglogstream::{Control, Replicator, StreamEvent};

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let end_lsn = std::env::var("END_LSN")
        .map_err(|_| anyhow::anyhow!("set END_LSN, e.g. END_LSN=0/16B6C50"))?;

    let conninfo = format!(
        "host={} port={} user={} password={} dbname={} slot={} endpos={}",
        env("PGHOST", "127.0.0.1"),
        env("PGPORT", "5432"),
        env("PGUSER", "postgres"),
        env("PGPASSWORD", "postgres"),
        env("PGDATABASE", "postgres"),
        env("PGSLOT", "my_slot"),
        end_lsn,
    );

    let mut replicator = Replicator::from_conninfo(&conninfo)?;
    let mut count = 0usize;

    replicator
        .replicate(|event| {
            if let StreamEvent::WalData { payload, .. } = event {
                count += 1;
                println!("{}", String::from_utf8_lossy(payload));
            }
            Ok(Control::Continue)
        })
        .await?;

    println!(
        "replayed {count} messages up to {}, acknowledged {}",
        replicator.end_position(),
        replicator.last_processed_lsn(),
    );
    Ok(())
}
