//! The outbound queue feeding a transmit task.

use crate::{message::ActionMessage, route::RouteId};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};
use tokio::sync::Notify;

/// A message waiting to be sent and the route it should take.
pub type Outgoing = (RouteId, ActionMessage);

/// A two-level FIFO: priority messages always leave before normal ones.
///
/// Any number of producers may push; a single transmit task pops. Data
/// messages beyond the capacity are refused. Protocol and priority messages
/// always get in. A capacity of zero means unbounded.
#[derive(Debug, Default)]
pub struct TxQueue {
    queues: Mutex<Queues>,
    ready: Notify,
    capacity: AtomicUsize,
}

#[derive(Debug, Default)]
struct Queues {
    priority: VecDeque<Outgoing>,
    normal: VecDeque<Outgoing>,
}

impl TxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let queue = Self::default();
        queue.set_capacity(capacity);
        queue
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Enqueues a message, ahead of normal traffic if its action is a
    /// priority command. A data message that does not fit is handed back.
    pub fn push(&self, route: RouteId, message: ActionMessage) -> Result<(), ActionMessage> {
        {
            let mut queues = self.lock();
            if message.is_priority() {
                queues.priority.push_back((route, message));
            } else {
                let capacity = self.capacity();
                if capacity > 0 && !message.is_protocol() && queues.normal.len() >= capacity {
                    return Err(message);
                }
                queues.normal.push_back((route, message));
            }
        }
        self.ready.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<Outgoing> {
        let mut queues = self.lock();
        queues
            .priority
            .pop_front()
            .or_else(|| queues.normal.pop_front())
    }

    /// Waits for the next message.
    pub async fn pop(&self) -> Outgoing {
        loop {
            let ready = self.ready.notified();
            if let Some(next) = self.try_pop() {
                return next;
            }
            ready.await;
        }
    }

    pub fn len(&self) -> usize {
        let queues = self.lock();
        queues.priority.len() + queues.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Action, ProtocolCommand};

    fn tagged(action: Action, tag: i32) -> ActionMessage {
        let mut message = ActionMessage::new(action);
        message.source_id = tag;
        message
    }

    #[tokio::test]
    async fn priority_jumps_ahead() {
        let queue = TxQueue::new();
        queue.push(RouteId(1), tagged(Action::TICK, 1)).unwrap();
        queue.push(RouteId(1), tagged(Action::TICK, 2)).unwrap();
        queue.push(RouteId(2), tagged(Action::PRIORITY_ACK, 3)).unwrap();
        queue
            .push(RouteId::CONTROL, ActionMessage::priority_protocol(ProtocolCommand::Disconnect))
            .unwrap();
        queue.push(RouteId(2), tagged(Action::PRIORITY_ACK, 4)).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.try_pop())
            .map(|(_, message)| (message.action(), message.source_id))
            .collect();
        assert_eq!(
            order,
            vec![
                (Action::PRIORITY_ACK, 3),
                (Action::PROTOCOL_PRIORITY, 0),
                (Action::PRIORITY_ACK, 4),
                (Action::TICK, 1),
                (Action::TICK, 2),
            ]
        );
    }

    #[tokio::test]
    async fn pop_waits_for_producer() {
        let queue = std::sync::Arc::new(TxQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(RouteId(7), tagged(Action::TICK, 9)).unwrap();
        let (route, message) = consumer.await.unwrap();
        assert_eq!(route, RouteId(7));
        assert_eq!(message.source_id, 9);
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_refuses_data_only() {
        let queue = TxQueue::with_capacity(2);
        queue.push(RouteId(1), tagged(Action::TICK, 1)).unwrap();
        queue.push(RouteId(1), tagged(Action::TICK, 2)).unwrap();
        let refused = queue.push(RouteId(1), tagged(Action::TICK, 3)).unwrap_err();
        assert_eq!(refused.source_id, 3);

        // Control traffic still gets through
        queue
            .push(RouteId::CONTROL, ActionMessage::protocol(ProtocolCommand::Disconnect))
            .unwrap();
        queue.push(RouteId(2), tagged(Action::PRIORITY_ACK, 4)).unwrap();
        assert_eq!(queue.len(), 4);

        for _ in 0..3 {
            queue.try_pop();
        }
        queue.push(RouteId(1), tagged(Action::TICK, 5)).unwrap();
    }
}
