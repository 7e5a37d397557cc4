//! Packet receive balancer.
//!
//! Downstream consumers process records asynchronously; the balancer
//! throttles per device so at most one record per uid is in flight toward
//! `mon.device.packet.receive` at any time. Three cooperating consumers
//! feed one dispatcher task that owns the state tables:
//!
//! - signal-request, on `{env}.mon.device.packet.create.#`, discovers new
//!   devices and subscribes their queues;
//! - signal-response, on `{env}.mon.device.packet.signal.response`, marks
//!   the in-flight record as processed and releases the next one;
//! - per-uid record consumers pipe deliveries into the dispatcher.
//!
//! A lock older than five minutes is evidence the downstream hung: the
//! next attempt re-dispatches the head of that device's queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{
    Broker, EXCHANGE_DEVICE, KEY_PACKET_CREATE, KEY_PACKET_RECEIVE, KEY_SIGNAL_REQUEST,
    KEY_SIGNAL_RESPONSE,
};
use crate::config::PipeConfig;
use crate::error::Result;

/// After this long an unanswered dispatch no longer blocks the queue
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Backoff after a broker connection exception
const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Single-flight state tables. Generic over the delivery token so the
/// logic is testable without a broker.
#[derive(Debug, Default)]
pub struct BalancerCore<T> {
    messages: HashMap<String, VecDeque<(Vec<u8>, T)>>,
    locks: HashMap<String, Instant>,
}

impl<T> BalancerCore<T> {
    pub fn new() -> Self {
        Self {
            messages: HashMap::new(),
            locks: HashMap::new(),
        }
    }

    /// Number of queued records for a device.
    pub fn queued(&self, uid: &str) -> usize {
        self.messages.get(uid).map_or(0, VecDeque::len)
    }

    /// A record arrived for `uid`; returns a payload to dispatch now, if
    /// the device is not locked (or its lock went stale).
    pub fn record_arrived(&mut self, uid: &str, payload: Vec<u8>, token: T, now: Instant) -> Option<Vec<u8>> {
        self.messages
            .entry(uid.to_string())
            .or_default()
            .push_back((payload, token));
        self.try_dispatch(uid, now)
    }

    fn try_dispatch(&mut self, uid: &str, now: Instant) -> Option<Vec<u8>> {
        let unlocked = match self.locks.get(uid) {
            None => true,
            Some(at) => now.duration_since(*at) >= LOCK_TIMEOUT,
        };
        if !unlocked {
            return None;
        }
        let head = self.messages.get(uid).and_then(VecDeque::front)?;
        let payload = head.0.clone();
        self.locks.insert(uid.to_string(), now);
        Some(payload)
    }

    /// The downstream confirmed the in-flight record for `uid`. Returns
    /// the confirmed record's token (to ack on the broker) and the next
    /// payload to dispatch, if any.
    pub fn response_received(&mut self, uid: &str, now: Instant) -> (Option<T>, Option<Vec<u8>>) {
        let queue = self.messages.entry(uid.to_string()).or_default();
        let confirmed = queue.pop_front();
        let next = queue.front().map(|(payload, _)| payload.clone());
        if next.is_some() {
            self.locks.insert(uid.to_string(), now);
        } else {
            self.locks.remove(uid);
        }
        (confirmed.map(|(_, token)| token), next)
    }
}

enum Event {
    /// A packet appeared somewhere under `packet.create.#`
    Signal { uid: String },
    /// The downstream confirmed a record
    Response { uid: String },
    /// A record delivery from a per-uid queue
    Record {
        uid: String,
        payload: Vec<u8>,
        delivery: lapin::message::Delivery,
    },
}

fn uid_from_body(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value.get("uid")?.as_str().map(str::to_string)
}

/// Run the balancer until cancelled.
pub async fn run(config: &PipeConfig, shutdown: CancellationToken) -> Result<()> {
    let (events_tx, events_rx) = mpsc::channel::<Event>(1024);

    let request_task = tokio::spawn(signal_consumer(
        config.clone(),
        events_tx.clone(),
        SignalKind::Request,
        shutdown.clone(),
    ));
    let response_task = tokio::spawn(signal_consumer(
        config.clone(),
        events_tx.clone(),
        SignalKind::Response,
        shutdown.clone(),
    ));
    drop(events_tx);

    dispatcher(config, events_rx, shutdown).await?;
    request_task.abort();
    response_task.abort();
    Ok(())
}

#[derive(Clone, Copy)]
enum SignalKind {
    Request,
    Response,
}

/// Long-lived consumer for one of the two signal queues, with reconnect
/// backoff.
async fn signal_consumer(
    config: PipeConfig,
    events: mpsc::Sender<Event>,
    kind: SignalKind,
    shutdown: CancellationToken,
) {
    let (queue_suffix, binding_suffix) = match kind {
        SignalKind::Request => (KEY_SIGNAL_REQUEST, format!("{KEY_PACKET_CREATE}.#")),
        SignalKind::Response => (KEY_SIGNAL_RESPONSE, KEY_SIGNAL_RESPONSE.to_string()),
    };
    while !shutdown.is_cancelled() {
        let attempt = async {
            let broker = Broker::connect(&config.amqp_connection, &config.environment).await?;
            let queue = broker.routing_key(queue_suffix);
            let binding = broker.routing_key(&binding_suffix);
            broker.declare_queue(&queue, &binding, EXCHANGE_DEVICE).await?;
            let mut consumer = broker.consume(&queue, "balancer-signal").await?;
            info!("signal consumer attached to {queue}");
            while let Some(delivery) = consumer.next().await {
                let delivery = delivery?;
                if let Some(uid) = uid_from_body(&delivery.data) {
                    let event = match kind {
                        SignalKind::Request => Event::Signal { uid },
                        SignalKind::Response => Event::Response { uid },
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                } else {
                    warn!("signal without uid ignored");
                }
                broker.ack(&delivery).await?;
            }
            Ok::<(), crate::error::PipeError>(())
        };
        tokio::select! {
            result = attempt => {
                if let Err(e) = result {
                    error!("signal consumer error: {e}");
                }
            }
            () = shutdown.cancelled() => return,
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Owns the state tables; the only task that talks to the downstream.
async fn dispatcher(
    config: &PipeConfig,
    mut events: mpsc::Receiver<Event>,
    shutdown: CancellationToken,
) -> Result<()> {
    let broker = Broker::connect(&config.amqp_connection, &config.environment).await?;
    let mut core: BalancerCore<lapin::message::Delivery> = BalancerCore::new();
    let mut subscribed: HashSet<String> = HashSet::new();
    // record consumers feed back into the same event stream
    let (records_tx, mut records_rx) = mpsc::channel::<Event>(1024);

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            event = records_rx.recv() => event,
            () = shutdown.cancelled() => return Ok(()),
        };
        let Some(event) = event else { return Ok(()) };

        match event {
            Event::Signal { uid } => {
                if subscribed.insert(uid.clone()) {
                    debug!("subscribing record queue for {uid}");
                    if let Err(e) =
                        spawn_record_consumer(&broker, &uid, records_tx.clone()).await
                    {
                        error!("cannot subscribe {uid}: {e}");
                        subscribed.remove(&uid);
                    }
                }
            }
            Event::Record { uid, payload, delivery } => {
                if let Some(body) = core.record_arrived(&uid, payload, delivery, Instant::now()) {
                    dispatch(&broker, &uid, &body).await;
                }
            }
            Event::Response { uid } => {
                let (confirmed, next) = core.response_received(&uid, Instant::now());
                if let Some(delivery) = confirmed {
                    if let Err(e) = broker.ack(&delivery).await {
                        error!("ack failed for {uid}: {e}");
                    }
                }
                if let Some(body) = next {
                    dispatch(&broker, &uid, &body).await;
                }
            }
        }
    }
}

async fn spawn_record_consumer(
    broker: &Broker,
    uid: &str,
    events: mpsc::Sender<Event>,
) -> Result<()> {
    let queue = broker.routing_key(&format!("{KEY_PACKET_CREATE}.{uid}"));
    broker.declare_queue(&queue, &queue, EXCHANGE_DEVICE).await?;
    let mut consumer = broker.consume(&queue, &format!("balancer-{uid}")).await?;
    let uid = uid.to_string();
    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    let payload = delivery.data.clone();
                    let event = Event::Record {
                        uid: uid.clone(),
                        payload,
                        delivery,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!("record consumer for {uid} failed: {e}");
                    return;
                }
            }
        }
    });
    Ok(())
}

async fn dispatch(broker: &Broker, uid: &str, body: &[u8]) {
    match broker.publish_to(EXCHANGE_DEVICE, KEY_PACKET_RECEIVE, body).await {
        Ok(()) => debug!("record for {uid} dispatched downstream"),
        Err(e) => error!("dispatch for {uid} failed: {e}"),
    }
}
