#![allow(dead_code)]

use idempotency_engine::idempotency::RedisRecordStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub id: String,
    pub name: String,
}

impl PayoutRequest {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutReply {
    pub name: String,
}

pub fn unique_key(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4())
}

/// Connects to the Redis at `REDIS_URL`, or returns `None` when it is unreachable.
pub async fn setup_test_redis() -> Option<RedisRecordStore> {
    dotenvy::dotenv().ok();

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    let client = redis::Client::open(redis_url.as_str()).ok()?;
    let connect = client.get_multiplexed_async_connection();
    let mut conn = match tokio::time::timeout(std::time::Duration::from_secs(2), connect).await {
        Ok(Ok(conn)) => conn,
        _ => {
            eprintln!("skipping: Redis not reachable at {}", redis_url);
            return None;
        }
    };
    let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
    if pong.is_err() {
        eprintln!("skipping: Redis at {} did not answer PING", redis_url);
        return None;
    }

    Some(RedisRecordStore::new(client, unique_key("idem_test")))
}
