//! Pure routing of `rumqttc` events and SubAck correlation

use crate::transport::SUBACK_FAILURE;
use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// Routing decision for one event loop event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived { topic: String, payload: Bytes },
    /// A Subscribe packet left the client with this packet id
    SubscribeSent { packet_id: u16 },
    SubscriptionAcknowledged { packet_id: u16, granted: Vec<u8> },
    Disconnected,
    Other,
}

/// Route an MQTT event (pure function)
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => EventRoute::ConnectionAcknowledged,
        Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
        },
        Event::Incoming(Packet::SubAck(suback)) => EventRoute::SubscriptionAcknowledged {
            packet_id: suback.pkid,
            granted: suback.return_codes.iter().map(granted_qos).collect(),
        },
        Event::Incoming(Packet::Disconnect) => EventRoute::Disconnected,
        Event::Outgoing(Outgoing::Subscribe(packet_id)) => EventRoute::SubscribeSent {
            packet_id: *packet_id,
        },
        _ => EventRoute::Other,
    }
}

/// Numeric SubAck return code, 0x80 for a rejection
pub fn granted_qos(code: &SubscribeReasonCode) -> u8 {
    match code {
        SubscribeReasonCode::Success(qos) => *qos as u8,
        SubscribeReasonCode::Failure => SUBACK_FAILURE,
    }
}

/// Matches SubAcks to the `subscribe` calls that caused them.
///
/// `rumqttc` assigns packet ids inside the event loop, so waiters are queued in
/// request order and bound to a packet id when the outgoing Subscribe is seen.
#[derive(Debug, Default)]
pub struct SubAckTracker {
    queued: VecDeque<oneshot::Sender<u8>>,
    in_flight: HashMap<u16, oneshot::Sender<u8>>,
}

impl SubAckTracker {
    pub fn enqueue(&mut self, waiter: oneshot::Sender<u8>) {
        self.queued.push_back(waiter);
    }

    /// Drop the most recently queued waiter after its request failed to send
    pub fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    pub fn on_subscribe_sent(&mut self, packet_id: u16) {
        if let Some(waiter) = self.queued.pop_front() {
            self.in_flight.insert(packet_id, waiter);
        }
    }

    pub fn on_suback(&mut self, packet_id: u16, granted: &[u8]) {
        if let Some(waiter) = self.in_flight.remove(&packet_id) {
            let code = granted.first().copied().unwrap_or(SUBACK_FAILURE);
            let _ = waiter.send(code);
        }
    }

    /// Fail every outstanding waiter; their receivers observe a closed channel
    pub fn fail_all(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }

    pub fn pending(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish, QoS, SubAck};

    #[test]
    fn test_route_connack_and_publish() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(route_mqtt_event(&connack), EventRoute::ConnectionAcknowledged);

        let publish = Event::Incoming(Packet::Publish(Publish::new(
            "thing-1/temp",
            QoS::AtLeastOnce,
            "21.5",
        )));
        assert_eq!(
            route_mqtt_event(&publish),
            EventRoute::MessageReceived {
                topic: "thing-1/temp".to_string(),
                payload: Bytes::from_static(b"21.5"),
            }
        );
    }

    #[test]
    fn test_route_suback_codes() {
        let suback = Event::Incoming(Packet::SubAck(SubAck::new(
            7,
            vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        )));
        assert_eq!(
            route_mqtt_event(&suback),
            EventRoute::SubscriptionAcknowledged {
                packet_id: 7,
                granted: vec![1, 0x80],
            }
        );
    }

    #[test]
    fn test_route_outgoing_subscribe() {
        let event = Event::Outgoing(Outgoing::Subscribe(3));
        assert_eq!(
            route_mqtt_event(&event),
            EventRoute::SubscribeSent { packet_id: 3 }
        );
        assert_eq!(
            route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::Other
        );
    }

    #[tokio::test]
    async fn test_tracker_resolves_in_request_order() {
        let mut tracker = SubAckTracker::default();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        tracker.enqueue(first_tx);
        tracker.enqueue(second_tx);

        tracker.on_subscribe_sent(10);
        tracker.on_subscribe_sent(11);
        tracker.on_suback(11, &[0x80]);
        tracker.on_suback(10, &[1]);

        assert_eq!(first_rx.await.unwrap(), 1);
        assert_eq!(second_rx.await.unwrap(), 0x80);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_tracker_fail_all_closes_waiters() {
        let mut tracker = SubAckTracker::default();
        let (tx, rx) = oneshot::channel();
        tracker.enqueue(tx);
        tracker.fail_all();
        assert!(rx.await.is_err());
    }
}
