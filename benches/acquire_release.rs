use criterion::{Criterion, criterion_group, criterion_main};
use reservoir::{Factory, Pool, PoolConfig, async_trait};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

struct Buffers;

#[async_trait]
impl Factory for Buffers {
    type Resource = Vec<u8>;
    type Error = std::io::Error;

    async fn create(&self) -> Result<Vec<u8>, Self::Error> {
        Ok(vec![0u8; 4096])
    }
}

fn bench_acquire_release(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let pool = rt.block_on(async {
        let config =
            PoolConfig::new("bench", 16, 16).with_acquire_timeout(Duration::from_secs(5));
        Arc::new(Pool::new(Buffers, config).unwrap())
    });

    c.bench_function("acquire_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let buf = pool.acquire().await.unwrap();
                black_box(buf.len());
            })
        })
    });

    c.bench_function("acquire_release_concurrent_8", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut tasks = Vec::with_capacity(8);
                for _ in 0..8 {
                    let pool = Arc::clone(&pool);
                    tasks.push(tokio::spawn(async move {
                        let buf = pool.acquire().await.unwrap();
                        black_box(buf.len());
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }
            })
        })
    });

    rt.block_on(pool.close()).unwrap();
}

criterion_group!(benches, bench_acquire_release);
criterion_main!(benches);
