use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use alicia_hub::graph::{MessageDraft, MessageGraph, RocksStore, StoreConfig};
use alicia_hub::hub::{Hub, Peer};
use alicia_hub::protocol::{AssistantMessage, Envelope, MessageType};
use criterion::{criterion_group, criterion_main, Criterion};

fn sample_answer() -> AssistantMessage {
    AssistantMessage {
        id: "msg_V1StGXR8_Z5jdHi6B-myT".into(),
        conversation_id: "conv_2fE7Rx9aUq3LmN0pWv8Ks".into(),
        content: "The kitchen lights are now off.".repeat(4),
        previous_id: Some("msg_4Jp0cQeYt6Hn2ZbLx1RgU".into()),
        reasoning: None,
        timestamp: Some(1_700_000_000_000),
    }
}

fn bench_envelope_encode(c: &mut Criterion) {
    let answer = sample_answer();

    c.bench_function("envelope_encode_assistant_message", |b| {
        b.iter(|| {
            let envelope = Envelope::new(
                black_box(answer.conversation_id.as_str()),
                MessageType::AssistantMessage,
                black_box(&answer),
            )
            .unwrap();
            black_box(envelope.encode().unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let answer = sample_answer();
    let encoded = Envelope::new(&answer.conversation_id, MessageType::AssistantMessage, &answer)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("envelope_decode_assistant_message", |b| {
        b.iter(|| {
            let envelope = Envelope::decode(black_box(&encoded)).unwrap();
            black_box(envelope.body::<AssistantMessage>().unwrap());
        })
    });
}

fn bench_broadcast_100_subscribers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_100_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let hub = Hub::new(Duration::from_millis(100));
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    let (peer, rx) = Peer::channel(16);
                    hub.subscribe("conv_bench", peer).await;
                    receivers.push(rx);
                }

                let frame = Arc::new(vec![0u8; 256]);
                black_box(hub.broadcast_to_conversation("conv_bench", frame).await);
            });
        })
    });
}

fn bench_memory_append_1000(c: &mut Criterion) {
    c.bench_function("memory_append_1000_messages", |b| {
        b.iter(|| {
            let graph = MessageGraph::in_memory();
            let conv = graph.create_conversation("bench").unwrap().id;
            for i in 0..1000 {
                graph
                    .create_message(&conv, MessageDraft::user(format!("message {i}")))
                    .unwrap();
            }
            black_box(conv);
        })
    });
}

fn bench_active_chain_1000(c: &mut Criterion) {
    let graph = MessageGraph::in_memory();
    let conv = graph.create_conversation("bench").unwrap().id;
    for i in 0..1000 {
        graph
            .create_message(&conv, MessageDraft::user(format!("message {i}")))
            .unwrap();
    }

    c.bench_function("active_chain_1000_messages", |b| {
        b.iter(|| {
            black_box(graph.active_chain(black_box(&conv)).unwrap());
        })
    });
}

fn bench_rocks_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let graph = MessageGraph::new(Arc::new(store));
    let conv = graph.create_conversation("bench").unwrap().id;

    c.bench_function("rocks_append_message", |b| {
        b.iter(|| {
            black_box(
                graph
                    .create_message(&conv, MessageDraft::assistant("It is 12:00."))
                    .unwrap(),
            );
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_broadcast_100_subscribers,
    bench_memory_append_1000,
    bench_active_chain_1000,
    bench_rocks_append,
);
criterion_main!(benches);
