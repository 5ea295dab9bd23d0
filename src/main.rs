use idempotency_engine::config::Settings;
use idempotency_engine::error::AppError;
use idempotency_engine::idempotency::{IdempotencyHandlerConfig, RecordStore, RedisRecordStore, RequestReply};
use idempotency_engine::observability::{init_logging, init_metrics, LogConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PayoutRequest {
    id: String,
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PayoutReply {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let settings = Settings::new()?;
    init_logging(&LogConfig::from(&settings.application))?;
    init_metrics()?;
    info!("Configuration loaded");

    // Connect to Redis
    info!("Connecting to Redis at {}...", settings.redis.url);
    let client = redis::Client::open(settings.redis.url.as_str())?;
    let mut con = client.get_multiplexed_async_connection().await?;
    let _: () = redis::cmd("PING").query_async(&mut con).await?;
    info!("Redis connection established");

    let store = RedisRecordStore::new(client, settings.idempotency.key_prefix.clone());
    let config = IdempotencyHandlerConfig::from(&settings.idempotency);
    let payout = RequestReply::new(store, config, |req: PayoutRequest| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<_, AppError>(PayoutReply {
            name: format!("replied:{}", req.name),
        })
    });

    let key = format!("demo-{}", std::process::id());
    let request = PayoutRequest {
        id: "payout-123".to_string(),
        name: "foo".to_string(),
    };

    let (first, second) = tokio::join!(
        payout.exec::<_, PayoutReply, _>(&key, request.clone()),
        payout.exec::<_, PayoutReply, _>(&key, request.clone()),
    );

    for (caller, outcome) in [("first", first), ("second", second)] {
        match outcome {
            Ok(reply) => info!(caller, reply = %reply.name, "payout executed"),
            Err(e) if e.is_retryable() => warn!(caller, error = %e, "payout still in flight"),
            Err(e) => return Err(e.into()),
        }
    }

    let replay: PayoutReply = payout.exec(&key, request).await?;
    info!(reply = %replay.name, "replayed cached payout");

    payout.handler().store().release_lock(&key).await?;
    info!(metrics = ?payout.handler().metrics().snapshot(), "Demo complete");

    Ok(())
}
