use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use foreground_policy::adapters::{ManualClock, MemoryStore};
use foreground_policy::config::RateConfig;
use foreground_policy::dispatch::shell::join;
use foreground_policy::eligibility::parse_listing;
use foreground_policy::environment::build_mediated_env;
use foreground_policy::layout::{Abi, BinaryLayout};
use foreground_policy::rate::RateLimiter;

fn bench_quote_command(c: &mut Criterion) {
    let words: Vec<String> = [
        "/data/local/tmp/fgpolicy/bin/policy_cli",
        "boost",
        "com.example.it's-an-app",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    c.bench_function("quote_command", |b| {
        b.iter(|| black_box(join(black_box(&words))));
    });
}

fn bench_mediated_env(c: &mut Criterion) {
    let layout = BinaryLayout::new("/data/local/tmp/fgpolicy", Abi::Arm64V8a);
    let parent: Vec<(String, String)> = (0..40)
        .map(|i| (format!("VAR_{i}"), format!("value-{i}")))
        .chain([
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("CLASSPATH".to_string(), "/system/framework/x.jar".to_string()),
        ])
        .collect();

    c.bench_function("build_mediated_env", |b| {
        b.iter(|| black_box(build_mediated_env(&layout, parent.iter().cloned())));
    });
}

fn bench_parse_listing(c: &mut Criterion) {
    let listing: String = (0..300)
        .map(|i| format!("package:com.example.app{i}\n"))
        .collect();

    c.bench_function("parse_listing_300", |b| {
        b.iter(|| black_box(parse_listing(black_box(&listing), "package:")));
    });
}

fn bench_record_execution(c: &mut Criterion) {
    let limiter = RateLimiter::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::new(1_700_000_000_000)),
        RateConfig::default(),
    );

    c.bench_function("record_execution", |b| {
        b.iter(|| black_box(limiter.record_execution()));
    });
}

criterion_group!(
    benches,
    bench_quote_command,
    bench_mediated_env,
    bench_parse_listing,
    bench_record_execution
);
criterion_main!(benches);
