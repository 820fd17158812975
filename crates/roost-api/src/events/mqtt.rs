// Publish/subscribe transport.
//
// MQTT over websocket against the service's broker. Each login gets a
// fresh client identity (the broker rejects reused ids from concurrent
// sessions). Subscriptions are renewed inside the ConnAck handler so a
// broker-side reconnect re-establishes them: the fixed account-level
// topics plus whatever per-device topics the sink reports.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter, Transport};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventConfig, EventSink, RunContext};

const BROKER_CHANNEL_CAPACITY: usize = 64;
const BROKER_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// The account-level topics every session listens on.
pub(crate) fn account_topics(user_id: &str) -> Vec<String> {
    vec![
        format!("u/{user_id}/in/userSession/connect"),
        format!("u/{user_id}/in/userSession/disconnect"),
        format!("u/{user_id}/in/library/add"),
        format!("u/{user_id}/in/library/update"),
        format!("u/{user_id}/in/library/remove"),
    ]
}

/// Fresh per-login client identity. The trailing digits have to differ
/// between logins or the broker drops the older session.
fn client_id(user_id: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..10).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect();
    format!("user_{user_id}_{suffix}")
}

/// Build the broker client for one run.
pub(crate) fn build(config: &EventConfig, ctx: &RunContext) -> (AsyncClient, EventLoop) {
    let id = client_id(&ctx.user_id);
    let url = format!(
        "wss://{}:{}{}",
        config.broker_host, config.broker_port, config.broker_path
    );
    debug!(client_id = %id, %url, "broker client");

    let mut options = MqttOptions::new(id, url, config.broker_port);
    options.set_transport(Transport::wss_with_default_config());
    options.set_credentials(ctx.user_id.clone(), ctx.token.clone());
    options.set_keep_alive(BROKER_KEEP_ALIVE);

    AsyncClient::new(options, BROKER_CHANNEL_CAPACITY)
}

/// Subscribe to a topic batch at QoS 0.
pub(crate) async fn subscribe_topics(client: &AsyncClient, topics: Vec<String>) {
    if topics.is_empty() {
        return;
    }
    debug!(count = topics.len(), "subscribing topics");
    let filters: Vec<SubscribeFilter> = topics
        .into_iter()
        .map(|t| SubscribeFilter::new(t, QoS::AtMostOnce))
        .collect();
    if let Err(e) = client.subscribe_many(filters).await {
        warn!(error = %e, "subscribe failed");
    }
}

/// Poll the broker until the connection drops or we are cancelled.
pub(crate) async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    ctx: &RunContext,
    sink: Arc<dyn EventSink>,
    cancel: &CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("broker stopped");
                let _ = client.try_disconnect();
                return;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                debug!("broker connected");
                // Subscribing here means a reconnect renews everything.
                let device_topics = sink.on_connect().await;
                let mut topics = account_topics(&ctx.user_id);
                topics.extend(device_topics);
                subscribe_topics(&client, topics).await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(topic = %publish.topic, "broker message");
                match serde_json::from_slice::<Value>(&publish.payload) {
                    Ok(packet) => {
                        if packet.get("action").and_then(Value::as_str) == Some("logout") {
                            // The broker keeps the connection alive even
                            // when the REST session died elsewhere.
                            warn!("logged out -- concurrent session elsewhere?");
                            continue;
                        }
                        sink.on_packet(packet).await;
                    }
                    Err(e) => debug!(error = %e, "undecodable broker payload"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "broker connection lost");
                return;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_topics_cover_session_and_library() {
        let topics = account_topics("U1");
        assert_eq!(topics.len(), 5);
        assert!(topics.contains(&"u/U1/in/userSession/connect".to_owned()));
        assert!(topics.contains(&"u/U1/in/library/remove".to_owned()));
        assert!(topics.iter().all(|t| t.starts_with("u/U1/in/")));
    }

    #[test]
    fn client_ids_are_fresh_per_login() {
        let a = client_id("U1");
        let b = client_id("U1");
        assert!(a.starts_with("user_U1_"));
        assert_eq!(a.len(), "user_U1_".len() + 10);
        // Ten random digits make a collision vanishingly unlikely.
        assert_ne!(a, b);
    }
}
