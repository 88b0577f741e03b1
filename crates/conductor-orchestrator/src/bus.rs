use crate::registry::AgentRegistry;
use chrono::{DateTime, Utc};
use conductor_core::{
    AgentStatus, ConductorError, ConductorResult, Message, MessageStatus, MessageType, Priority,
};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Sender name used for notifications generated by the bus itself.
pub const SYSTEM_SENDER: &str = "conductor";

/// Subject of the notification sent back when a message cannot be delivered.
pub const DELIVERY_FAILED_SUBJECT: &str = "delivery_failed";

/// Why a message was reported back to its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Expired,
    RecipientUnavailable,
    ResponseTimeout,
    RecipientDeregistered,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Expired => write!(f, "expired"),
            FailureReason::RecipientUnavailable => write!(f, "recipient_unavailable"),
            FailureReason::ResponseTimeout => write!(f, "response_timeout"),
            FailureReason::RecipientDeregistered => write!(f, "recipient_deregistered"),
        }
    }
}

/// Queue slot: higher priority first, then lower sequence number (FIFO).
#[derive(Debug)]
struct Queued {
    seq: u64,
    message: Message,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

#[derive(Debug)]
struct PendingResponse {
    sender: String,
    recipient: String,
    subject: String,
    deadline: DateTime<Utc>,
}

/// Counters exposed for dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Messages waiting in recipient queues.
    pub queued: usize,
    /// Delivered but not yet marked processed.
    pub in_flight: usize,
    /// Requests still waiting for their response.
    pub awaiting_response: usize,
}

/// Routes messages between registered agents.
///
/// Each recipient has its own priority queue. Polling hands a message out at
/// most once; expiry and response timeouts are reported back to the sender as
/// `delivery_failed` notifications.
pub struct MessageBus {
    registry: Arc<AgentRegistry>,
    queues: DashMap<String, BinaryHeap<Queued>>,
    in_flight: DashMap<Uuid, Message>,
    awaiting_response: DashMap<Uuid, PendingResponse>,
    /// Still-queued requests already reported as `response_timeout`.
    timed_out: DashSet<Uuid>,
    seq: AtomicU64,
    default_response_timeout: Duration,
}

impl MessageBus {
    pub fn new(registry: Arc<AgentRegistry>, default_response_timeout: Duration) -> Self {
        Self {
            registry,
            queues: DashMap::new(),
            in_flight: DashMap::new(),
            awaiting_response: DashMap::new(),
            timed_out: DashSet::new(),
            seq: AtomicU64::new(0),
            default_response_timeout,
        }
    }

    /// Whether `recipient` is registered and not stopped.
    pub fn can_deliver(&self, recipient: &str) -> bool {
        self.registry
            .get(recipient)
            .is_some_and(|entry| entry.status() != AgentStatus::Stopped)
    }

    /// Queue `message` for its recipient and return its id.
    ///
    /// A message that is already expired, or whose recipient cannot accept
    /// delivery, is marked failed and reported to the sender instead.
    pub fn send(&self, mut message: Message) -> ConductorResult<Uuid> {
        if message.recipient.trim().is_empty() {
            return Err(ConductorError::Bus("message recipient must not be empty".into()));
        }
        let now = Utc::now();
        let id = message.id;
        message.status = MessageStatus::Sent;
        message.sent_at = now;
        message.delivered_at = None;
        message.processed_at = None;

        if message.message_type == MessageType::Response {
            if let Some(request_id) = message.correlation_id {
                if self.awaiting_response.remove(&request_id).is_some() {
                    debug!(request = %request_id, response = %id, "Bus: response correlated");
                }
            }
        }

        if message.is_expired_at(now) {
            self.fail(message, FailureReason::Expired);
            return Ok(id);
        }
        if !self.can_deliver(&message.recipient) {
            self.fail(message, FailureReason::RecipientUnavailable);
            return Ok(id);
        }

        if message.response_required {
            let timeout = *message
                .response_timeout
                .get_or_insert(self.default_response_timeout);
            let deadline = chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|t| now.checked_add_signed(t))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.awaiting_response.insert(
                id,
                PendingResponse {
                    sender: message.sender.clone(),
                    recipient: message.recipient.clone(),
                    subject: message.subject.clone(),
                    deadline,
                },
            );
        }

        debug!(
            id = %id,
            sender = %message.sender,
            recipient = %message.recipient,
            subject = %message.subject,
            priority = %message.priority,
            "Bus: message queued"
        );
        self.enqueue(message);
        Ok(id)
    }

    /// Lazily hand out `recipient`'s pending messages, highest priority first.
    ///
    /// The returned iterator yields at most as many messages as were live when
    /// the poll started. Every yielded message is marked delivered and will not
    /// be returned by a later poll; messages not pulled stay queued.
    pub fn poll(&self, recipient: &str) -> Delivery<'_> {
        self.sweep_response_timeouts();
        let remaining = self.purge_expired(recipient);
        Delivery {
            bus: self,
            recipient: recipient.to_string(),
            remaining,
        }
    }

    /// Collect up to `max` messages from [`poll`](Self::poll).
    pub fn poll_batch(&self, recipient: &str, max: usize) -> Vec<Message> {
        self.poll(recipient).take(max).collect()
    }

    /// Acknowledge a delivered message and drop it from the bus.
    pub fn mark_processed(&self, id: Uuid) -> ConductorResult<Message> {
        let (_, mut message) = self.in_flight.remove(&id).ok_or_else(|| {
            ConductorError::Bus(format!("message {id} is not awaiting processing"))
        })?;
        message.status = MessageStatus::Processed;
        message.processed_at = Some(Utc::now());
        Ok(message)
    }

    /// Number of live (unexpired) messages waiting for `recipient`.
    pub fn queue_len(&self, recipient: &str) -> usize {
        self.purge_expired(recipient)
    }

    /// Report every request whose response deadline has passed and drop
    /// delivered messages that expired before being processed.
    ///
    /// Each message produces at most one failure notice: a request reported
    /// here is not reported again if it later expires in its queue.
    pub fn sweep_response_timeouts(&self) -> usize {
        let now = Utc::now();
        let due: Vec<Uuid> = self
            .awaiting_response
            .iter()
            .filter(|pending| pending.deadline <= now)
            .map(|pending| *pending.key())
            .collect();

        let mut reported = 0;
        for id in due {
            if let Some((_, pending)) = self.awaiting_response.remove(&id) {
                self.mark_if_queued(&pending.recipient, id);
                warn!(
                    id = %id,
                    sender = %pending.sender,
                    recipient = %pending.recipient,
                    "Bus: response timed out"
                );
                self.report_failure(
                    id,
                    &pending.sender,
                    &pending.recipient,
                    &pending.subject,
                    FailureReason::ResponseTimeout,
                );
                reported += 1;
            }
        }
        self.evict_expired_in_flight(now);
        reported
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            queued: self.queues.iter().map(|q| q.len()).sum(),
            in_flight: self.in_flight.len(),
            awaiting_response: self.awaiting_response.len(),
        }
    }

    /// Periodically sweep response timeouts until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_response_timeouts();
                    }
                }
            }
            debug!("Bus: sweeper stopped");
        })
    }

    /// Drop `recipient`'s queue, reporting every queued message to its sender.
    pub(crate) fn drop_queue(&self, recipient: &str) {
        self.in_flight.retain(|_, m| m.recipient != recipient);
        if let Some((_, queue)) = self.queues.remove(recipient) {
            for queued in queue.into_vec() {
                self.fail(queued.message, FailureReason::RecipientDeregistered);
            }
        }
    }

    /// Remember `id` as already reported while it is still waiting in
    /// `recipient`'s queue.
    fn mark_if_queued(&self, recipient: &str, id: Uuid) {
        if let Some(queue) = self.queues.get(recipient) {
            if queue.iter().any(|q| q.message.id == id) {
                self.timed_out.insert(id);
            }
        }
    }

    fn evict_expired_in_flight(&self, now: DateTime<Utc>) {
        let before = self.in_flight.len();
        self.in_flight.retain(|_, m| !m.is_expired_at(now));
        let evicted = before.saturating_sub(self.in_flight.len());
        if evicted > 0 {
            debug!(evicted, "Bus: expired unprocessed messages dropped");
        }
    }

    fn enqueue(&self, message: Message) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.queues
            .entry(message.recipient.clone())
            .or_default()
            .push(Queued { seq, message });
    }

    /// Remove expired messages from `recipient`'s queue and return the live count.
    fn purge_expired(&self, recipient: &str) -> usize {
        let now = Utc::now();
        let (live, expired) = {
            let Some(mut queue) = self.queues.get_mut(recipient) else {
                return 0;
            };
            if !queue.iter().any(|q| q.message.is_expired_at(now)) {
                return queue.len();
            }
            let (expired, keep): (Vec<Queued>, Vec<Queued>) = std::mem::take(&mut *queue)
                .into_vec()
                .into_iter()
                .partition(|q| q.message.is_expired_at(now));
            *queue = BinaryHeap::from(keep);
            (queue.len(), expired)
        };
        for queued in expired {
            self.fail(queued.message, FailureReason::Expired);
        }
        live
    }

    fn fail(&self, mut message: Message, reason: FailureReason) {
        message.status = MessageStatus::Failed;
        self.awaiting_response.remove(&message.id);
        warn!(
            id = %message.id,
            sender = %message.sender,
            recipient = %message.recipient,
            reason = %reason,
            "Bus: message delivery failed"
        );
        if self.timed_out.remove(&message.id).is_some() {
            debug!(id = %message.id, "Bus: sender already notified of response timeout");
            return;
        }
        self.report_failure(
            message.id,
            &message.sender,
            &message.recipient,
            &message.subject,
            reason,
        );
    }

    fn report_failure(
        &self,
        message_id: Uuid,
        sender: &str,
        recipient: &str,
        subject: &str,
        reason: FailureReason,
    ) {
        if sender == SYSTEM_SENDER {
            return;
        }
        if !self.registry.contains(sender) {
            warn!(
                id = %message_id,
                sender = %sender,
                reason = %reason,
                "Bus: failure report dropped, sender is not registered"
            );
            return;
        }
        let mut notice = Message::notification(
            SYSTEM_SENDER,
            sender,
            DELIVERY_FAILED_SUBJECT,
            serde_json::json!({
                "message_id": message_id,
                "recipient": recipient,
                "subject": subject,
                "reason": reason,
            }),
        )
        .with_priority(Priority::High);
        notice.correlation_id = Some(message_id);
        self.enqueue(notice);
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Lazy, finite view over one recipient's queue. Created by [`MessageBus::poll`].
pub struct Delivery<'a> {
    bus: &'a MessageBus,
    recipient: String,
    remaining: usize,
}

impl Iterator for Delivery<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        while self.remaining > 0 {
            let popped = {
                let mut queue = self.bus.queues.get_mut(&self.recipient)?;
                queue.pop()?
            };
            let now = Utc::now();
            if popped.message.is_expired_at(now) {
                self.bus.fail(popped.message, FailureReason::Expired);
                continue;
            }
            self.remaining -= 1;
            self.bus.timed_out.remove(&popped.message.id);
            let mut message = popped.message;
            message.status = MessageStatus::Delivered;
            message.delivered_at = Some(now);
            self.bus.in_flight.insert(message.id, message.clone());
            return Some(message);
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::AgentConfig;
    use crate::work::work_fn;
    use conductor_core::ResultSummary;

    fn bus_with(agents: &[&str]) -> MessageBus {
        let registry = Arc::new(AgentRegistry::new());
        for name in agents {
            registry
                .register(
                    AgentConfig::new(*name),
                    work_fn(|_ctx| async { Ok(ResultSummary::text("ok")) }),
                )
                .unwrap();
        }
        MessageBus::new(registry, Duration::from_secs(300))
    }

    fn data(from: &str, to: &str, subject: &str) -> Message {
        Message::data(from, to, subject, serde_json::Value::Null)
    }

    fn failure_reasons(bus: &MessageBus, agent: &str) -> Vec<String> {
        bus.poll(agent)
            .filter(|m| m.subject == DELIVERY_FAILED_SUBJECT)
            .map(|m| m.content["reason"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_priority_then_fifo() {
        let bus = bus_with(&["a", "b"]);
        bus.send(data("a", "b", "low").with_priority(Priority::Low)).unwrap();
        bus.send(data("a", "b", "normal-1")).unwrap();
        bus.send(data("a", "b", "critical").with_priority(Priority::Critical))
            .unwrap();
        bus.send(data("a", "b", "normal-2")).unwrap();

        let subjects: Vec<String> = bus.poll("b").map(|m| m.subject).collect();
        assert_eq!(subjects, vec!["critical", "normal-1", "normal-2", "low"]);
    }

    #[test]
    fn test_delivered_at_most_once() {
        let bus = bus_with(&["a", "b"]);
        bus.send(data("a", "b", "once")).unwrap();

        let first = bus.poll_batch("b", 10);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, MessageStatus::Delivered);
        assert!(first[0].delivered_at.is_some());
        assert!(bus.poll_batch("b", 10).is_empty());
        assert_eq!(bus.stats().in_flight, 1);
    }

    #[test]
    fn test_poll_is_lazy() {
        let bus = bus_with(&["a", "b"]);
        for i in 0..3 {
            bus.send(data("a", "b", &format!("m{i}"))).unwrap();
        }
        {
            let mut delivery = bus.poll("b");
            assert_eq!(delivery.next().unwrap().subject, "m0");
        }
        assert_eq!(bus.queue_len("b"), 2);
        let rest: Vec<String> = bus.poll("b").map(|m| m.subject).collect();
        assert_eq!(rest, vec!["m1", "m2"]);
    }

    #[test]
    fn test_poll_is_finite_per_call() {
        let bus = bus_with(&["a", "b"]);
        bus.send(data("a", "b", "first")).unwrap();
        let mut delivery = bus.poll("b");
        bus.send(data("a", "b", "late")).unwrap();
        assert_eq!(delivery.next().unwrap().subject, "first");
        assert!(delivery.next().is_none());
        assert_eq!(bus.poll_batch("b", 10)[0].subject, "late");
    }

    #[test]
    fn test_expired_at_send_is_never_delivered() {
        let bus = bus_with(&["a", "b"]);
        let msg = data("a", "b", "stale").expires_at(Utc::now() - chrono::Duration::seconds(5));
        bus.send(msg).unwrap();

        assert!(bus.poll_batch("b", 10).is_empty());
        assert_eq!(failure_reasons(&bus, "a"), vec!["expired"]);
    }

    #[test]
    fn test_expired_while_queued_is_purged() {
        let bus = bus_with(&["a", "b"]);
        bus.send(data("a", "b", "short").expires_in(Duration::from_millis(10)))
            .unwrap();
        bus.send(data("a", "b", "keeps")).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(bus.queue_len("b"), 1);
        let subjects: Vec<String> = bus.poll("b").map(|m| m.subject).collect();
        assert_eq!(subjects, vec!["keeps"]);
        assert_eq!(failure_reasons(&bus, "a"), vec!["expired"]);
    }

    #[test]
    fn test_stopped_recipient_fails_back_to_sender() {
        let bus = bus_with(&["a", "b"]);
        bus.registry
            .update_state("b", |s| s.status = AgentStatus::Stopped)
            .unwrap();
        assert!(!bus.can_deliver("b"));
        assert!(!bus.can_deliver("nobody"));

        let id = bus.send(data("a", "b", "hello")).unwrap();
        let notices = bus.poll_batch("a", 10);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].sender, SYSTEM_SENDER);
        assert_eq!(notices[0].correlation_id, Some(id));
        assert_eq!(notices[0].content["reason"], "recipient_unavailable");
        assert_eq!(notices[0].priority, Priority::High);
    }

    #[test]
    fn test_response_timeout_reported_exactly_once() {
        let bus = bus_with(&["a", "b"]);
        let id = bus
            .send(data("a", "b", "quote").require_response(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(bus.stats().awaiting_response, 1);
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(bus.sweep_response_timeouts(), 1);
        assert_eq!(bus.sweep_response_timeouts(), 0);

        let notices = bus.poll_batch("a", 10);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].correlation_id, Some(id));
        assert_eq!(notices[0].content["reason"], "response_timeout");
        assert!(bus.poll_batch("a", 10).is_empty());
    }

    #[test]
    fn test_response_in_time_clears_watch() {
        let bus = bus_with(&["a", "b"]);
        bus.send(data("a", "b", "quote").require_response(Duration::from_millis(30)))
            .unwrap();
        let request = bus.poll_batch("b", 1).remove(0);
        bus.send(request.reply(serde_json::json!({"price": 10}))).unwrap();
        assert_eq!(bus.stats().awaiting_response, 0);

        std::thread::sleep(Duration::from_millis(50));
        let inbox = bus.poll_batch("a", 10);
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message_type, MessageType::Response);
        assert_eq!(inbox[0].correlation_id, Some(request.id));
    }

    #[test]
    fn test_timed_out_request_not_reported_again_on_expiry() {
        let bus = bus_with(&["a", "b"]);
        let id = bus
            .send(
                data("a", "b", "quote")
                    .require_response(Duration::from_millis(20))
                    .expires_in(Duration::from_millis(60)),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(bus.sweep_response_timeouts(), 1);

        std::thread::sleep(Duration::from_millis(50));
        assert!(bus.poll_batch("b", 10).is_empty());

        let notices = bus.poll_batch("a", 10);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].correlation_id, Some(id));
        assert_eq!(notices[0].content["reason"], "response_timeout");
        assert!(bus.timed_out.is_empty());
        assert_eq!(bus.stats().queued, 0);
    }

    #[test]
    fn test_timed_out_request_still_delivered_before_expiry() {
        let bus = bus_with(&["a", "b"]);
        bus.send(data("a", "b", "quote").require_response(Duration::from_millis(10)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(bus.sweep_response_timeouts(), 1);

        assert_eq!(bus.poll_batch("b", 10).len(), 1);
        assert_eq!(failure_reasons(&bus, "a"), vec!["response_timeout"]);
        assert!(bus.timed_out.is_empty());
    }

    #[test]
    fn test_expired_unprocessed_delivery_is_evicted() {
        let bus = bus_with(&["a", "b"]);
        bus.send(data("a", "b", "short").expires_in(Duration::from_millis(20)))
            .unwrap();
        bus.send(data("a", "b", "durable")).unwrap();
        assert_eq!(bus.poll_batch("b", 10).len(), 2);
        assert_eq!(bus.stats().in_flight, 2);

        std::thread::sleep(Duration::from_millis(40));
        bus.sweep_response_timeouts();
        assert_eq!(bus.stats().in_flight, 1);
        assert!(bus.poll_batch("a", 10).is_empty());
    }

    #[test]
    fn test_default_response_timeout_applied() {
        let bus = bus_with(&["a", "b"]);
        let mut msg = data("a", "b", "q");
        msg.response_required = true;
        bus.send(msg).unwrap();
        let delivered = bus.poll_batch("b", 1);
        assert_eq!(delivered[0].response_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_mark_processed() {
        let bus = bus_with(&["a", "b"]);
        let id = bus.send(data("a", "b", "work")).unwrap();
        assert!(bus.mark_processed(id).is_err());

        bus.poll_batch("b", 1);
        let processed = bus.mark_processed(id).unwrap();
        assert_eq!(processed.status, MessageStatus::Processed);
        assert!(processed.processed_at.is_some());
        assert!(bus.mark_processed(id).is_err());
        assert_eq!(bus.stats(), BusStats::default());
    }

    #[test]
    fn test_drop_queue_reports_senders() {
        let bus = bus_with(&["a", "b"]);
        bus.send(data("a", "b", "one")).unwrap();
        bus.send(data("a", "b", "two")).unwrap();
        bus.drop_queue("b");

        assert_eq!(bus.queue_len("b"), 0);
        assert_eq!(
            failure_reasons(&bus, "a"),
            vec!["recipient_deregistered", "recipient_deregistered"]
        );
    }

    #[test]
    fn test_empty_recipient_rejected() {
        let bus = bus_with(&["a"]);
        let err = bus.send(data("a", "", "x")).unwrap_err();
        assert!(matches!(err, ConductorError::Bus(_)));
    }
}
