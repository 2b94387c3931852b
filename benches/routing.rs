//! Performance benchmarks for the delivery state machine
//!
//! Run with: cargo bench

use courier::effects::send;
use courier::outputs::{NullOutput, OutputRegistry, RetryOutput};
use courier::{Message, Router};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn bench_effect_machine(c: &mut Criterion) {
    let effect = send(vec![
        Arc::new(NullOutput::tagged(1)) as _,
        Arc::new(NullOutput::tagged(2)) as _,
        Arc::new(RetryOutput::new(2)) as _,
    ]);

    c.bench_function("SendEffect next_action", |b| {
        b.iter(|| effect.next_action(None));
    });

    c.bench_function("SendEffect apply", |b| {
        b.iter(|| {
            let mut message = Message::new("bench", "example_event");
            effect.apply(&mut message).unwrap()
        });
    });
}

fn bench_router(c: &mut Criterion) {
    let router = Router::from_outputs(vec![
        Arc::new(NullOutput::tagged(1)) as _,
        Arc::new(NullOutput::tagged(2)) as _,
    ]);

    c.bench_function("Router full pipeline", |b| {
        b.iter(|| {
            let mut message = Message::new("bench", "example_event");
            while router.next_effect(&message).is_some() {
                router.apply_next_effect(&mut message).unwrap();
            }
            message
        });
    });
}

fn bench_message_codec(c: &mut Criterion) {
    let registry = OutputRegistry::with_builtins();
    let router = Router::from_outputs(vec![
        Arc::new(NullOutput::new()) as _,
        Arc::new(RetryOutput::new(2)) as _,
    ]);
    let mut message = Message::new("bench", "example_event")
        .with_content(serde_json::json!({"a": 1, "recipient": "user-42"}));
    router.apply_next_effect(&mut message).unwrap();

    c.bench_function("Message serialize", |b| {
        b.iter(|| message.to_bytes());
    });

    let bytes = message.to_bytes();
    c.bench_function("Message deserialize", |b| {
        b.iter(|| Message::from_bytes(&bytes, &registry).unwrap());
    });
}

criterion_group!(benches, bench_effect_machine, bench_router, bench_message_codec);
criterion_main!(benches);
