use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ConnectionInfo, IntoConnectionInfo};
use tracing::{debug, info};

use crate::{Bus, BusError, BusMessage, Subscription};
use futures::StreamExt;

/// Redis pub/sub transport. Publishing goes through a reconnecting connection
/// manager; every subscription gets its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(info: ConnectionInfo) -> Result<Self, BusError> {
        let addr = info.addr.to_string();
        let client = Client::open(info)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!(addr = %addr, "connected to redis");
        Ok(Self { client, conn })
    }
}

/// Connection info for `host:port` (or a full `redis://` URL) with optional ACL
/// credentials. Credentials are set verbatim, never URL-encoded.
pub fn connection_info(addr: &str, username: Option<String>, password: Option<String>) -> Result<ConnectionInfo, BusError> {
    let url = if addr.contains("://") { addr.to_string() } else { format!("redis://{}", addr) };
    let mut info = url.as_str().into_connection_info()?;
    if username.is_some() {
        info.redis.username = username;
    }
    if password.is_some() {
        info.redis.password = password;
    }
    Ok(info)
}

#[async_trait::async_trait]
impl Bus for RedisBus {
    async fn publish(&self, partition: &str, payload: &[u8]) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(partition, payload).await?;
        debug!(partition = %partition, receivers, bytes = payload.len(), "redis publish");
        Ok(())
    }

    async fn subscribe(&self, partition: &str) -> Result<Subscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(partition).await?;
        info!(partition = %partition, "redis subscription established");
        let stream = pubsub.into_on_message().map(|msg| BusMessage {
            partition: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(Subscription::new(partition, stream.boxed()))
    }
}
