//! Slicing and reassembly across two real handlers.

use serde_json::{json, Value};
use std::sync::Arc;

use trellis_chain::{ChainMessageHandler, Listener, P2pChatAction, TransportSet};
use trellis_core::envelope;
use trellis_core::{ChainMessage, MemoryKeyDirectory, MsgDirect, MsgType};

use crate::{node, tiny_frame_config, CannedDirect, LoopbackDirect};

const MIB: usize = 1024 * 1024;

#[test]
fn ten_mib_payload_with_four_mib_frames_makes_three_slices() {
    let directory = Arc::new(MemoryKeyDirectory::new());
    let handler = node(
        "peer-a",
        &directory,
        TransportSet::default(),
        trellis_core::ChainConfig::default(),
    );

    let mut msg = ChainMessage::new(MsgType::Chat.as_str(), MsgDirect::Request);
    msg.need_slice = true;
    msg.target_peer_id = Some("peer-b".into());
    msg.payload = Some(Value::String("x".repeat(10 * MIB)));

    let slices = handler.slice(msg);
    assert_eq!(slices.len(), 3);
    let lens: Vec<usize> = slices
        .iter()
        .map(|s| match &s.payload {
            Some(Value::String(p)) => p.len(),
            _ => 0,
        })
        .collect();
    assert_eq!(lens, vec![4 * MIB, 4 * MIB, 2 * MIB]);
    for (i, slice) in slices.iter().enumerate() {
        assert_eq!(slice.slice_number as usize, i);
        assert_eq!(slice.slice_size, Some(3));
        assert_eq!(slice.uuid, slices[0].uuid);
    }
}

#[tokio::test]
async fn sliced_chat_reassembles_at_the_recipient() {
    let directory = Arc::new(MemoryKeyDirectory::new());

    // Recipient node with a direct-link chat action and a listener.
    let node_b = node(
        "peer-b",
        &directory,
        TransportSet::default(),
        tiny_frame_config(4),
    );
    let chat_b = P2pChatAction::register(&node_b);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let listener: Listener = Arc::new(move |ctx| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ctx);
        })
    });
    assert!(chat_b.endpoint().register_listener("test", listener));

    // Sender node wired to B over an in-memory link.
    let mut transports = TransportSet::default();
    transports.direct = Some(Arc::new(LoopbackDirect::new(
        "peer-a",
        "peer-b",
        node_b.inbound(),
    )));
    let node_a = node("peer-a", &directory, transports, tiny_frame_config(4));
    let chat_a = P2pChatAction::register(&node_a);

    // 12 bytes over 4-byte frames: three encrypted slices on the wire.
    let reply = chat_a
        .chat(None, json!("hello world!"), Some("peer-b"))
        .await
        .unwrap();
    assert!(reply.is_none(), "chat delivery sends no protocol reply");

    let delivered = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
        .await
        .expect("listener should fire")
        .unwrap();
    assert_eq!(delivered.payload, json!("hello world!"));
    assert_eq!(delivered.src_peer_id.as_deref(), Some("peer-a"));

    // Exactly one completion: nothing else arrives.
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn per_slice_replies_merge_into_one_response() {
    let directory = Arc::new(MemoryKeyDirectory::new());

    // Every slice send comes back with the same canned OK reply.
    let canned_bytes = envelope::marshal(&ChainMessageHandler::ok(MsgType::P2pChat.as_str())).unwrap();
    let canned = Arc::new(CannedDirect::new(canned_bytes));
    let mut transports = TransportSet::default();
    transports.direct = Some(canned.clone());

    let node_a = node("peer-a", &directory, transports, tiny_frame_config(4));
    let action = P2pChatAction::register(&node_a);

    let mut msg = action
        .endpoint()
        .prepare_send(Some("peer-b"), json!("hello world!"), Some("peer-b"));
    msg.need_slice = true;

    let merged = action.endpoint().send(msg).await.unwrap().unwrap();
    assert_eq!(*canned.sends.lock().unwrap(), 3);
    assert_eq!(merged.message_type, MsgType::P2pChat.as_str());
    assert_eq!(merged.message_direct, MsgDirect::Response);
    // Ordered collection of the three per-slice reply payloads.
    assert_eq!(merged.payload, Some(json!(["OK", "OK", "OK"])));
}
