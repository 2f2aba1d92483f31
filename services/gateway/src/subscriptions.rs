//! The tiered status poller: six periodic tasks, one per tier, each
//! coalescing its objects' interested subscribers into a single
//! `get_status` round-trip per tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use gateway_protocol::JsonRpcNotification;

use crate::config::GatewayConfig;
use crate::multiplexer::RequestMultiplexer;
use crate::temperature::TemperatureStore;

pub const TIER_COUNT: usize = 6;
const DEFAULT_TIER: usize = 3;

/// `None` means "all attributes" (an empty requested-attribute set).
type AttrFilter = Option<Vec<String>>;

#[derive(Clone)]
struct Subscriber {
    conn_id: u64,
    attrs: AttrFilter,
    outbound: mpsc::UnboundedSender<Value>,
}

pub struct SubscriptionEngine {
    config: Arc<RwLock<GatewayConfig>>,
    multiplexer: Arc<RequestMultiplexer>,
    temperature: Arc<TemperatureStore>,
    // object name -> subscribers interested in it
    interests: RwLock<HashMap<String, Vec<Subscriber>>>,
    // conn_id -> objects it subscribed to, for unsubscribe_all
    conn_objects: RwLock<HashMap<u64, Vec<String>>>,
    in_flight: [AtomicBool; TIER_COUNT],
}

impl SubscriptionEngine {
    pub fn new(
        config: Arc<RwLock<GatewayConfig>>,
        multiplexer: Arc<RequestMultiplexer>,
        temperature: Arc<TemperatureStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            multiplexer,
            temperature,
            interests: RwLock::new(HashMap::new()),
            conn_objects: RwLock::new(HashMap::new()),
            in_flight: Default::default(),
        })
    }

    /// Merge `requests` (object -> requested attrs, empty means "all") into
    /// the global interest set for `conn_id`.
    pub async fn subscribe(
        &self,
        conn_id: u64,
        outbound: mpsc::UnboundedSender<Value>,
        requests: HashMap<String, Vec<String>>,
    ) {
        let mut interests = self.interests.write().await;
        let mut conn_objects = self.conn_objects.write().await;
        let objects = conn_objects.entry(conn_id).or_default();
        for (object, attrs) in requests {
            let filter: AttrFilter = if attrs.is_empty() { None } else { Some(attrs) };
            let subs = interests.entry(object.clone()).or_default();
            subs.retain(|s| s.conn_id != conn_id);
            subs.push(Subscriber {
                conn_id,
                attrs: filter,
                outbound: outbound.clone(),
            });
            if !objects.contains(&object) {
                objects.push(object);
            }
        }
    }

    /// Drop every subscription belonging to `conn_id` (WS close).
    pub async fn unsubscribe_all(&self, conn_id: u64) {
        let objects = self.conn_objects.write().await.remove(&conn_id).unwrap_or_default();
        let mut interests = self.interests.write().await;
        for object in objects {
            if let Some(subs) = interests.get_mut(&object) {
                subs.retain(|s| s.conn_id != conn_id);
                if subs.is_empty() {
                    interests.remove(&object);
                }
            }
        }
    }

    /// The effective `{objects, poll_times}` report for `/printer/subscriptions`.
    pub async fn current(&self, conn_id: u64) -> (Vec<String>, HashMap<String, f64>) {
        let config = self.config.read().await;
        let objects = self
            .conn_objects
            .read()
            .await
            .get(&conn_id)
            .cloned()
            .unwrap_or_default();
        let mut poll_times = HashMap::new();
        for object in &objects {
            let tier = effective_tier(&config, object);
            poll_times.insert(object.clone(), tier_period(&config, tier));
        }
        (objects, poll_times)
    }

    /// Spawn the six tier poller tasks. Returns immediately; the tasks run
    /// for the lifetime of the returned `Arc<Self>`.
    pub fn spawn_tiers(self: &Arc<Self>) {
        for tier in 0..TIER_COUNT {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_tier(tier).await;
            });
        }
    }

    async fn run_tier(self: Arc<Self>, tier: usize) {
        loop {
            let period = {
                let config = self.config.read().await;
                tier_period(&config, tier)
            };
            tokio::time::sleep(Duration::from_secs_f64(period)).await;

            if self.in_flight[tier].swap(true, Ordering::AcqRel) {
                // Previous poll for this tier hasn't completed; drop this tick.
                continue;
            }
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.poll_tier(tier).await;
                this.in_flight[tier].store(false, Ordering::Release);
            });
        }
    }

    async fn poll_tier(&self, tier: usize) {
        let objects = {
            let config = self.config.read().await;
            let interests = self.interests.read().await;
            interests
                .keys()
                .filter(|o| effective_tier(&config, o) == tier)
                .cloned()
                .collect::<Vec<_>>()
        };
        if objects.is_empty() {
            return;
        }

        let params = serde_json::json!({ "objects": objects });
        let rx = self.multiplexer.submit_internal("get_status", params).await;
        let Ok(outcome) = rx.await else {
            return;
        };
        let result = match outcome {
            Ok(value) => value,
            Err(message) => {
                warn!(tier, %message, "status poll failed");
                return;
            }
        };
        let Some(payload) = result.as_object() else {
            return;
        };

        for (object, attrs) in payload {
            if let Some(temp) = attrs.get("temperature").and_then(Value::as_f64) {
                self.temperature.record(object, temp).await;
            }
        }

        let interests = self.interests.read().await;
        let mut per_conn: HashMap<u64, (serde_json::Map<String, Value>, mpsc::UnboundedSender<Value>)> =
            HashMap::new();
        for (object, attrs) in payload {
            let Some(subs) = interests.get(object) else {
                continue;
            };
            for sub in subs {
                let filtered = filter_attrs(attrs, &sub.attrs);
                let entry = per_conn
                    .entry(sub.conn_id)
                    .or_insert_with(|| (serde_json::Map::new(), sub.outbound.clone()));
                entry.0.insert(object.clone(), filtered);
            }
        }
        drop(interests);

        for (conn_id, (objects, outbound)) in per_conn {
            let notification =
                JsonRpcNotification::new("notify_status_update", Value::Object(objects));
            let value = serde_json::to_value(&notification).unwrap();
            if outbound.send(value).is_err() {
                debug!(conn_id, "status update dropped, connection gone");
            }
        }
    }
}

fn effective_tier(config: &GatewayConfig, object: &str) -> usize {
    for (i, tier) in config.status_tiers.iter().enumerate() {
        if tier.iter().any(|o| o == object) {
            return i;
        }
    }
    DEFAULT_TIER
}

fn tier_period(config: &GatewayConfig, tier: usize) -> f64 {
    config.tick_time * 2f64.powi(tier as i32)
}

fn filter_attrs(attrs: &Value, filter: &AttrFilter) -> Value {
    match filter {
        None => attrs.clone(),
        Some(names) => {
            let Some(map) = attrs.as_object() else {
                return attrs.clone();
            };
            let mut out = serde_json::Map::new();
            for name in names {
                if let Some(v) = map.get(name) {
                    out.insert(name.clone(), v.clone());
                }
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_tier_uses_configured_tier() {
        let mut config = GatewayConfig::default();
        config.status_tiers[0] = vec!["toolhead".to_owned()];
        assert_eq!(effective_tier(&config, "toolhead"), 0);
    }

    #[test]
    fn effective_tier_defaults_to_tier_four() {
        let config = GatewayConfig::default();
        assert_eq!(effective_tier(&config, "unlisted_object"), DEFAULT_TIER);
    }

    #[test]
    fn effective_tier_picks_fastest_when_listed_twice() {
        let mut config = GatewayConfig::default();
        config.status_tiers[0] = vec!["toolhead".to_owned()];
        config.status_tiers[4] = vec!["toolhead".to_owned()];
        assert_eq!(effective_tier(&config, "toolhead"), 0);
    }

    #[test]
    fn tier_period_doubles_per_tier() {
        let mut config = GatewayConfig::default();
        config.tick_time = 0.25;
        assert_eq!(tier_period(&config, 0), 0.25);
        assert_eq!(tier_period(&config, 1), 0.5);
        assert_eq!(tier_period(&config, 5), 8.0);
    }

    #[test]
    fn filter_attrs_none_means_everything() {
        let attrs = serde_json::json!({"temperature": 200.0, "target": 210.0});
        assert_eq!(filter_attrs(&attrs, &None), attrs);
    }

    #[test]
    fn filter_attrs_some_restricts_to_named_fields() {
        let attrs = serde_json::json!({"temperature": 200.0, "target": 210.0});
        let filtered = filter_attrs(&attrs, &Some(vec!["temperature".to_owned()]));
        assert_eq!(filtered, serde_json::json!({"temperature": 200.0}));
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_clears_interest() {
        let config = Arc::new(RwLock::new(GatewayConfig::default()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (htx, _hrx) = mpsc::unbounded_channel();
        let registry = Arc::new(RwLock::new(crate::registry::EndpointRegistry::default()));
        let server_state = Arc::new(RwLock::new(gateway_protocol::ServerState::Ready));
        let mux = RequestMultiplexer::new(htx, registry, server_state, config.clone());
        let temp = Arc::new(TemperatureStore::new());
        let engine = SubscriptionEngine::new(config, mux, temp);

        let mut req = HashMap::new();
        req.insert("toolhead".to_owned(), vec![]);
        engine.subscribe(1, tx, req).await;
        assert!(engine.interests.read().await.contains_key("toolhead"));

        engine.unsubscribe_all(1).await;
        assert!(!engine.interests.read().await.contains_key("toolhead"));
    }
}
