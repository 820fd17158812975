// ── Packet dispatcher ──
//
// Pure classification plus fan-out; nothing here blocks. Each inbound
// packet is classified into `(device id, resource, payload)` tuples by
// a fixed, ordered rule list -- the wire format does not guarantee the
// shapes are mutually exclusive, only this ordering does. Tuples go to
// the listener callbacks (via the scheduler, never inline) and the
// packet is then offered to the transaction registry for correlation.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, trace};

use crate::registry::EventRegistry;
use crate::scheduler::{JobFn, Priority, Scheduler};

/// Resource types the service scopes per-device packets under.
pub const DEFAULT_RESOURCE_TYPES: &[&str] =
    &["cameras", "doorbells", "lights", "sensors", "basestations", "modes"];

/// One routed slice of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub device_id: Option<String>,
    pub resource: String,
    pub payload: Value,
}

impl Delivery {
    fn new(device_id: Option<&str>, resource: &str, payload: Value) -> Self {
        Self { device_id: device_id.map(str::to_owned), resource: resource.to_owned(), payload }
    }
}

/// Classify a packet into deliveries. First matching rule wins; the
/// result is deterministic for a given packet.
pub fn classify(packet: &Value, resource_types: &[String]) -> Vec<Delivery> {
    let resource = packet.get("resource").and_then(Value::as_str).unwrap_or("");

    // Answer to an async ping. Note and swallow.
    if resource.starts_with("subscriptions/") {
        trace!(resource, "ping response");
        return Vec::new();
    }

    // Automation/mode broadcast: one entry per station keyed by id.
    if resource == "activeAutomations" {
        debug!("packet: automation broadcast");
        let Some(map) = packet.as_object() else { return Vec::new() };
        return map
            .iter()
            .filter(|(key, _)| *key != "resource")
            .map(|(device_id, value)| Delivery::new(Some(device_id), resource, value.clone()))
            .collect();
    }

    // Individual device update: `{type}/{deviceId}`. Signals things
    // like motion detection or battery changes.
    if resource_types.iter().any(|t| resource.starts_with(&format!("{t}/"))) {
        debug!(resource, "packet: device update");
        let device_id = resource.split('/').nth(1);
        return vec![Delivery::new(device_id, resource, packet.clone())];
    }

    // Base station reporting itself and its children in one packet;
    // split apart here and deliver per device.
    if resource == "devices" {
        debug!("packet: station and child statuses");
        let Some(devices) = packet.get("devices").and_then(Value::as_object) else {
            return Vec::new();
        };
        return devices
            .iter()
            .map(|(device_id, props)| Delivery::new(Some(device_id), resource, props.clone()))
            .collect();
    }

    // Bare resource-type packet: a station answering for itself or a
    // property list covering several children.
    if resource_types.iter().any(|t| t == resource) {
        let from = packet.get("from").and_then(Value::as_str);
        match packet.get("properties").and_then(Value::as_array) {
            Some(props) => {
                debug!(resource, "packet: station property list");
                return props
                    .iter()
                    .map(|prop| {
                        let device_id =
                            prop.get("serialNumber").and_then(Value::as_str).or(from);
                        Delivery::new(device_id, resource, prop.clone())
                    })
                    .collect();
            }
            None => {
                debug!(resource, "packet: station update");
                return vec![Delivery::new(from, resource, packet.clone())];
            }
        }
    }

    // Audio-capable device updates; the bare status event is wrapped to
    // look like the full playback shape.
    if resource.starts_with("audioPlayback") {
        info!(resource, "packet: audio playback");
        let device_id = packet.get("from").and_then(Value::as_str);
        let properties = packet.get("properties").cloned();
        let payload = if resource == "audioPlayback/status" {
            properties.map(|p| serde_json::json!({ "status": p }))
        } else {
            properties
        };
        return match (device_id, payload) {
            (Some(device_id), Some(payload)) => {
                vec![Delivery::new(Some(device_id), resource, payload)]
            }
            _ => Vec::new(),
        };
    }

    // Last-ditch effort to funnel the packet somewhere useful.
    let device_id = packet
        .get("deviceId")
        .or_else(|| packet.get("uniqueId"))
        .or_else(|| packet.get("locationId"))
        .and_then(Value::as_str);
    match device_id {
        Some(device_id) => vec![Delivery::new(Some(device_id), resource, packet.clone())],
        None => {
            debug!(resource, "unhandled packet");
            Vec::new()
        }
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

/// Routes inbound packets to listeners and pending transactions.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<EventRegistry>,
    scheduler: Scheduler,
    resource_types: Vec<String>,
}

impl Dispatcher {
    pub fn new(registry: Arc<EventRegistry>, scheduler: Scheduler, resource_types: Vec<String>) -> Self {
        Self { registry, scheduler, resource_types }
    }

    /// Classify and fan out one packet. Callbacks are queued on the
    /// scheduler -- never invoked here -- so the event-channel task that
    /// calls this can immediately go back to reading the transport.
    pub fn dispatch(&self, packet: &Value) {
        if let Some(err) = packet.get("error") {
            info!(
                code = %err.get("code").cloned().unwrap_or_default(),
                message = %err.get("message").and_then(|v| v.as_str()).unwrap_or("unknown"),
                "packet carried an error"
            );
        }

        for delivery in classify(packet, &self.resource_types) {
            let callbacks = self.registry.listeners_for(delivery.device_id.as_deref());
            trace!(
                resource = %delivery.resource,
                device = delivery.device_id.as_deref().unwrap_or("-"),
                listeners = callbacks.len(),
                "delivering"
            );
            for callback in callbacks {
                let resource = delivery.resource.clone();
                let payload = delivery.payload.clone();
                let job: JobFn = Arc::new(move || {
                    let callback = Arc::clone(&callback);
                    let resource = resource.clone();
                    let payload = payload.clone();
                    Box::pin(async move {
                        callback(&resource, &payload);
                        Ok(())
                    })
                });
                self.scheduler.submit(Priority::Normal, job);
            }
        }

        // Is a notify/post waiting on this packet?
        self.registry.settle(
            packet.get("transId").and_then(Value::as_str),
            packet.get("resource").and_then(Value::as_str),
            packet.get("from").and_then(Value::as_str),
            packet,
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn types() -> Vec<String> {
        DEFAULT_RESOURCE_TYPES.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn ping_responses_are_swallowed() {
        let packet = json!({"resource": "subscriptions/U1_web"});
        assert!(classify(&packet, &types()).is_empty());
    }

    #[test]
    fn automation_broadcast_fans_out_per_station() {
        let packet = json!({
            "resource": "activeAutomations",
            "BASE1": {"activeModes": ["armed"]},
            "BASE2": {"activeModes": ["standby"]},
        });
        let deliveries = classify(&packet, &types());
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries.iter().all(|d| d.resource == "activeAutomations"));
        assert!(deliveries.iter().any(|d| d.device_id.as_deref() == Some("BASE1")));
        assert!(deliveries.iter().any(|d| d.device_id.as_deref() == Some("BASE2")));
    }

    #[test]
    fn device_update_extracts_the_id_from_the_resource() {
        let packet = json!({
            "resource": "cameras/ABC",
            "properties": {"batteryLevel": 80},
        });
        let deliveries = classify(&packet, &types());
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].device_id.as_deref(), Some("ABC"));
        assert_eq!(deliveries[0].resource, "cameras/ABC");
        assert_eq!(deliveries[0].payload["properties"]["batteryLevel"], 80);
    }

    #[test]
    fn aggregated_station_packet_splits_children() {
        let packet = json!({
            "resource": "devices",
            "devices": {
                "BASE1": {"state": "idle"},
                "CAM1": {"batteryLevel": 55},
            }
        });
        let deliveries = classify(&packet, &types());
        assert_eq!(deliveries.len(), 2);
        let cam = deliveries.iter().find(|d| d.device_id.as_deref() == Some("CAM1")).expect("cam");
        assert_eq!(cam.payload["batteryLevel"], 55);
    }

    #[test]
    fn property_list_resolves_serials_with_station_fallback() {
        let packet = json!({
            "resource": "cameras",
            "from": "BASE1",
            "properties": [
                {"serialNumber": "CAM1", "signal": 4},
                {"signal": 2},
            ]
        });
        let deliveries = classify(&packet, &types());
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].device_id.as_deref(), Some("CAM1"));
        assert_eq!(deliveries[1].device_id.as_deref(), Some("BASE1"));
    }

    #[test]
    fn audio_status_is_wrapped_to_match_playback_shape() {
        let packet = json!({
            "resource": "audioPlayback/status",
            "from": "CAM1",
            "properties": {"state": "playing"},
        });
        let deliveries = classify(&packet, &types());
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].payload, json!({"status": {"state": "playing"}}));
    }

    #[test]
    fn catch_all_tries_device_unique_then_location() {
        let by_unique = json!({"resource": "odd", "uniqueId": "U-1"});
        let deliveries = classify(&by_unique, &types());
        assert_eq!(deliveries[0].device_id.as_deref(), Some("U-1"));

        let by_location = json!({"resource": "odd", "locationId": "L-1"});
        let deliveries = classify(&by_location, &types());
        assert_eq!(deliveries[0].device_id.as_deref(), Some("L-1"));

        let nothing = json!({"resource": "odd"});
        assert!(classify(&nothing, &types()).is_empty());
    }

    #[test]
    fn classification_is_deterministic() {
        // A packet that could plausibly match both the device-update
        // rule and the catch-all; the earlier rule must win every time.
        let packet = json!({
            "resource": "cameras/ABC",
            "deviceId": "OTHER",
            "properties": {},
        });
        let first = classify(&packet, &types());
        for _ in 0..5 {
            assert_eq!(classify(&packet, &types()), first);
        }
        assert_eq!(first[0].device_id.as_deref(), Some("ABC"), "rule order decides");
    }
}
