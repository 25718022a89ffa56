use criterion::{criterion_group, criterion_main, Criterion};
use rowcast_sync::{
    translate, AllowAll, BroadcastDispatcher, ChangeEvent, ClientMessage, FilterNode, FilterOp,
    LoadOptions, OfflineQueue, Principal, ServerMessage, SortKey, Topic, TopicMirror,
    TopicRegistry,
};
use std::hint::black_box;
use std::sync::Arc;

#[path = "../tests/common/mod.rs"]
mod common;

use common::{Article, ArticlePatch};

fn sample_options() -> LoadOptions {
    LoadOptions::new()
        .skip(20)
        .take(50)
        .sort_by(SortKey::desc("price"))
        .sort_by(SortKey::asc("name"))
        .filter(FilterNode::Or(vec![
            FilterNode::condition("name", FilterOp::StartsWith, "Ring"),
            FilterNode::And(vec![
                FilterNode::condition("price", FilterOp::Gt, 10.0),
                FilterNode::condition("category", FilterOp::Eq, "jewelry").negate(),
            ]),
        ]))
        .with_total_count()
}

fn bench_event_encode(c: &mut Criterion) {
    let msg: ServerMessage<Article> = ServerMessage::Event {
        topic: Topic::from("articles"),
        version: 42,
        event: ChangeEvent::Added(Article::new("Ring A").with_id(7).priced(19.5)),
    };

    c.bench_function("event_encode_added", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let msg: ServerMessage<Article> = ServerMessage::Event {
        topic: Topic::from("articles"),
        version: 42,
        event: ChangeEvent::Updated {
            key: 7,
            patch: ArticlePatch::name("Ring A2"),
        },
    };
    let encoded = msg.encode().unwrap();

    c.bench_function("event_decode_updated", |b| {
        b.iter(|| black_box(ServerMessage::<Article>::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_load_request_decode(c: &mut Criterion) {
    let msg: ClientMessage<Article> = ClientMessage::Load {
        request_id: 1,
        topic: Topic::from("articles"),
        options: sample_options(),
    };
    let encoded = msg.encode().unwrap();

    c.bench_function("load_request_decode", |b| {
        b.iter(|| black_box(ClientMessage::<Article>::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_translate(c: &mut Criterion) {
    let options = sample_options();

    c.bench_function("translate_nested_filter", |b| {
        b.iter(|| black_box(translate::<Article>(black_box(&options)).unwrap()))
    });
}

fn bench_publish_100_subscribers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let topic = Topic::from("articles");

    c.bench_function("publish_100_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = Arc::new(TopicRegistry::new(Arc::new(AllowAll), 16));
                let dispatcher = BroadcastDispatcher::new(registry.clone());

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let (conn, rx) = registry
                        .connect(Principal::new(format!("peer-{i}")))
                        .await
                        .unwrap();
                    registry.subscribe(&topic, &conn).await.unwrap();
                    receivers.push(rx);
                }

                let report = dispatcher
                    .publish(&topic, 1, ChangeEvent::Added(Article::new("Ring A").with_id(1)))
                    .await
                    .unwrap();
                black_box(report);
            });
        })
    });
}

fn bench_mirror_apply_1000(c: &mut Criterion) {
    let events: Vec<ChangeEvent<Article>> = (1..=1000u64)
        .map(|i| ChangeEvent::Added(Article::new("item").with_id(i)))
        .collect();

    c.bench_function("mirror_apply_1000_added", |b| {
        b.iter(|| {
            let mut mirror = TopicMirror::new();
            mirror
                .apply(
                    0,
                    &ChangeEvent::Loaded {
                        items: vec![],
                        total_count: None,
                    },
                )
                .unwrap();
            for (i, event) in events.iter().enumerate() {
                mirror.apply(i as u64 + 1, black_box(event)).unwrap();
            }
            black_box(mirror.items().len());
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_enqueue_drain", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1000u64 {
                queue.enqueue(i, vec![0u8; 64]);
            }
            black_box(queue.drain());
        })
    });
}

criterion_group!(
    benches,
    bench_event_encode,
    bench_event_decode,
    bench_load_request_decode,
    bench_translate,
    bench_publish_100_subscribers,
    bench_mirror_apply_1000,
    bench_offline_queue,
);
criterion_main!(benches);
