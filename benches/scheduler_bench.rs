use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::join_all;
use serde_json::{json, Value};
use swarm_kb::cluster::InMemoryProvider;
use swarm_kb::transport::LocalNetwork;
use swarm_kb::{handler, LocalIdentity, Node, Swarm, SwarmConfig, SingleTrigger, TaskOptions};
use tokio::runtime::Runtime;

fn cluster(rt: &Runtime, ids: &[&str]) -> Vec<Swarm> {
    rt.block_on(async {
        let network = LocalNetwork::new();
        let provider = Arc::new(InMemoryProvider::new(ids.iter().map(|id| Node::new(*id))));
        let mut swarms = Vec::new();
        for id in ids {
            let swarm = Swarm::builder(SwarmConfig::default())
                .identity(LocalIdentity::new(*id))
                .provider(provider.clone())
                .transport(Arc::new(network.transport(*id, Duration::from_secs(30))))
                .build()
                .unwrap();
            let tasks = swarm.tasks();
            tasks
                .register(
                    "add",
                    handler(|args: Vec<Value>| async move {
                        let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                        Ok::<_, anyhow::Error>(json!(sum))
                    }),
                    TaskOptions::new().serialized(false),
                )
                .unwrap();
            tasks
                .register(
                    "batched",
                    handler(|_args: Vec<Value>| async { Ok::<_, anyhow::Error>(Value::Null) }),
                    TaskOptions::new()
                        .single_trigger(SingleTrigger::NextBatch)
                        .max_queue_length(1000),
                )
                .unwrap();
            swarm.start().await.unwrap();
            swarm.wait_ready().await;
            swarms.push(swarm);
        }
        swarms
    })
}

fn scheduler_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("scheduler");

    let single = cluster(&rt, &["solo"]);
    group.bench_function("exec_local", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(single[0].exec("add", vec![json!(1), json!(2)]).await.unwrap());
            })
        })
    });

    group.bench_function("exec_serialized_burst", |b| {
        b.iter(|| {
            rt.block_on(async {
                let calls = (0..64).map(|_| single[0].exec("batched", vec![]));
                black_box(join_all(calls).await);
            })
        })
    });

    let three = cluster(&rt, &["a", "b", "c"]);
    group.bench_function("exec_routed", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            rt.block_on(async {
                black_box(three[0].exec("add", vec![json!(i), json!(1)]).await.unwrap());
            })
        })
    });

    group.finish();
}

criterion_group!(benches, scheduler_benchmark);
criterion_main!(benches);
