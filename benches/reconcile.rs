use chrono::Utc;
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use microrun::reconciler::plan;
use microrun::runtime::RuntimeProcess;
use microrun::service::{Ownership, ServiceRecord, ServiceSpec, ServiceStatus};
use microrun::source::SourceDescriptor;
use std::hint::black_box;

const SOURCES: &[&str] = &[
    "github.com/micro/services",
    "github.com/micro/services/helloworld@v3.1.0",
    "gitlab.com/acme/platform/api/gateway",
    "source://greeter:latest",
];

fn bench_parse(c: &mut Criterion) {
    c.bench_function("source_parse", |b| {
        b.iter(|| {
            for source in SOURCES {
                let _ = black_box(SourceDescriptor::parse(black_box(source)).unwrap());
            }
        })
    });
}

/// `n` records, every third missing from the backend and every seventh
/// process orphaned.
fn fleet(n: usize) -> (Vec<ServiceRecord>, Vec<RuntimeProcess>) {
    let mut records = Vec::with_capacity(n);
    let mut processes = Vec::with_capacity(n);
    for i in 0..n {
        let name = format!("svc{}", i);
        let spec = ServiceSpec::new(&name, "github.com/micro/services")
            .normalize()
            .unwrap();
        let mut record = ServiceRecord::new(spec, Ownership::default());
        record.metadata.status = ServiceStatus::Running;
        if i % 7 != 0 {
            records.push(record);
        }
        if i % 3 != 0 {
            processes.push(RuntimeProcess {
                id: i.to_string(),
                name,
                version: "latest".to_string(),
                namespace: "default".to_string(),
                reference: "/srv/bin".to_string(),
                started_at: Utc::now(),
                status: ServiceStatus::Running,
            });
        }
    }
    (records, processes)
}

fn bench_plan(c: &mut Criterion) {
    for n in [10usize, 1_000] {
        c.bench_function(&format!("tick_plan_{}", n), |b| {
            b.iter_batched(
                || fleet(n),
                |(records, processes)| black_box(plan(&records, &processes)),
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, bench_parse, bench_plan);
criterion_main!(benches);
