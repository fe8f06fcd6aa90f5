//! Criterion benchmarks for the replication hot paths
//!
//! The exporter recomputes each consumer's view on every catalog or
//! configuration change and diffs it against the last one it sent; every
//! delta is then encoded once, decoded on the importing side and applied
//! to the peer-scoped store.

use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::prelude::*;

use peerlink::peering::export::{diff_views, exported_view, SniContext};
use peerlink::peering::stream::Applier;
use peerlink::peering::{
    CatalogService, ExportedServicesConfig, MemoryStore, PeeringRecord, PeeringStore,
    PeeringToken, TrustBundleReconciler,
};
use peerlink::pki::CertificateAuthority;
use peerlink::proto::{EntryKey, ReplicationMessage, ServiceEndpoint, ServiceEntry, Snapshot};

// =============================================================================
// Fixtures
// =============================================================================

const SIZES: [usize; 3] = [10, 100, 1000];

fn sni() -> SniContext {
    SniContext {
        datacenter: "dc1".to_string(),
        trust_domain: "east.peerlink.local".to_string(),
    }
}

fn catalog(size: usize) -> Vec<CatalogService> {
    (0..size)
        .map(|i| CatalogService {
            key: EntryKey::new(format!("svc-{i}")),
            endpoints: (0..3)
                .map(|n| {
                    ServiceEndpoint::new(format!("node-{n}"), format!("10.0.{n}.{}", i % 250), 8080)
                })
                .collect(),
            modify_index: i as u64 + 1,
        })
        .collect()
}

/// Export roughly half the catalog to `west`, the rest to other peers
fn exports(size: usize, rng: &mut StdRng) -> ExportedServicesConfig {
    (0..size).fold(ExportedServicesConfig::new(), |config, i| {
        let consumer = if rng.gen_bool(0.5) { "west" } else { "north" };
        config.export(&format!("svc-{i}"), consumer)
    })
}

fn entry(i: usize) -> ServiceEntry {
    ServiceEntry {
        key: EntryKey::new(format!("svc-{i}")),
        peer_name: String::new(),
        endpoints: vec![ServiceEndpoint::new("node-1", "10.0.0.5", 8080)],
        sni: format!("svc-{i}.default.dc1.internal.east.peerlink.local"),
        version: i as u64,
    }
}

/// An applier that has already taken its first snapshot
async fn snapshotted_applier() -> Applier {
    let root = CertificateAuthority::new("east", "east.peerlink.local")
        .expect("create CA")
        .cert_pem()
        .to_string();
    let token = PeeringToken::issue(
        "acceptor-id",
        "server.east",
        &[root.clone()],
        &["east-1".to_string()],
        "secret",
    );
    let record = PeeringRecord::new_dialing("east", &token);
    let id = record.id.clone();
    let store = Arc::new(MemoryStore::new());
    store.put(record).await.expect("store record");

    let mut applier = Applier::load(store, Arc::new(TrustBundleReconciler::new()), &id)
        .await
        .expect("load applier");
    let snapshot = Snapshot {
        epoch: 1,
        seq: 0,
        entries: vec![],
        roots: vec![root],
        addresses: vec!["east-1".to_string()],
    };
    applier
        .apply(ReplicationMessage::Snapshot(snapshot))
        .await
        .expect("apply snapshot");
    applier
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_exported_view(c: &mut Criterion) {
    let mut group = c.benchmark_group("exported_view");
    let mut rng = StdRng::seed_from_u64(7);

    for size in SIZES {
        let services = catalog(size);
        let config = exports(size, &mut rng);
        let wildcard = ExportedServicesConfig::new().export("*", "west");
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("per_service", size), &size, |b, _| {
            b.iter(|| exported_view(black_box(&services), &config, "west", &sni()))
        });
        group.bench_with_input(BenchmarkId::new("wildcard", size), &size, |b, _| {
            b.iter(|| exported_view(black_box(&services), &wildcard, "west", &sni()))
        });
    }
    group.finish();
}

fn bench_diff_views(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_views");
    let mut rng = StdRng::seed_from_u64(11);

    for size in SIZES {
        let old: BTreeMap<EntryKey, ServiceEntry> =
            (0..size).map(|i| (entry(i).key.clone(), entry(i))).collect();
        // touch a tenth of the entries and drop a tenth
        let mut new = old.clone();
        for _ in 0..size / 10 {
            let i = rng.gen_range(0..size);
            if let Some(e) = new.get_mut(&EntryKey::new(format!("svc-{i}"))) {
                e.version += 1;
            }
            new.remove(&EntryKey::new(format!("svc-{}", rng.gen_range(0..size))));
        }

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("unchanged", size), &size, |b, _| {
            b.iter(|| diff_views(black_box(&old), black_box(&old)))
        });
        group.bench_with_input(BenchmarkId::new("churn", size), &size, |b, _| {
            b.iter(|| diff_views(black_box(&old), black_box(&new)))
        });
    }
    group.finish();
}

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime");
    let mut applier = runtime.block_on(snapshotted_applier());
    let mut seq = 0u64;

    group.throughput(Throughput::Elements(1));
    group.bench_function("upsert", |b| {
        b.iter(|| {
            seq += 1;
            let message = ReplicationMessage::Upsert {
                seq,
                entry: entry((seq % 100) as usize),
            };
            runtime.block_on(applier.apply(black_box(message)))
        })
    });
    group.finish();
}

fn bench_message_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_codec");
    let upsert = ReplicationMessage::Upsert {
        seq: 42,
        entry: entry(42),
    };
    let bytes = upsert.encode().expect("encode upsert");

    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode_upsert", |b| b.iter(|| black_box(&upsert).encode()));
    group.bench_function("decode_upsert", |b| {
        b.iter(|| ReplicationMessage::decode(black_box(&bytes)))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_exported_view,
    bench_diff_views,
    bench_apply,
    bench_message_codec
);
criterion_main!(benches);
