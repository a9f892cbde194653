use cosim_comms_core::{Action, ActionMessage, MessageCallback};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// A callback that forwards every delivered message into a channel.
pub fn collector() -> (MessageCallback, mpsc::UnboundedReceiver<ActionMessage>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let callback: MessageCallback = Arc::new(move |message| {
        let _ = sender.send(message);
    });
    (callback, receiver)
}

pub async fn recv_within(
    receiver: &mut mpsc::UnboundedReceiver<ActionMessage>,
    wait: Duration,
) -> Option<ActionMessage> {
    tokio::time::timeout(wait, receiver.recv()).await.ok().flatten()
}

pub fn text(payload: &'static str) -> ActionMessage {
    let mut message = ActionMessage::new(Action::SEND_MESSAGE);
    message.payload = payload.into();
    message
}
