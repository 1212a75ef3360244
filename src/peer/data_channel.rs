use crate::peer::engine::{EngineEvent, EngineEventSender};
use std::sync::Arc;
use tracing::debug;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// общий обработчик data-channel: open и входящие сообщения уходят в `events`
pub fn attach_dc(dc: &Arc<RTCDataChannel>, events: EngineEventSender) {
    let label = dc.label().to_string();
    debug!(label = %label, "attach_dc called");

    dc.on_open(Box::new({
        let events = events.clone();
        let label = label.clone();
        move || {
            debug!(label = %label, "Data channel opened");
            let _ = events.send(EngineEvent::DataChannelArrived { label });
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let label = label.clone();
        move |msg: DataChannelMessage| {
            debug!(label = %label, len = msg.data.len(), "Received message");
            let _ = events.send(EngineEvent::DataMessage {
                label: label.clone(),
                data: msg.data,
            });
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new(move || {
        debug!(label = %label, "Data channel closed");
        Box::pin(async {})
    }));
}
