//! Benchmarks for job script rendering.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stagegate::context::TemplateVars;
use stagegate::core::JobId;
use stagegate::scheduler::{Dependency, JobDescriptor, Resources};

fn descriptor_benchmark(c: &mut Criterion) {
    let ids: Vec<JobId> = (0..500).map(|i| JobId::from(format!("{}", 90_000 + i))).collect();

    c.bench_function("dependency_clause_500", |b| {
        b.iter(|| Dependency::after_ok(black_box(ids.clone())).map(|d| d.clause()));
    });

    let vars = TemplateVars::new()
        .with("pool", "pool_1")
        .with("output_dir", "/scratch/pool_1/bcftools")
        .with("artifacts", "a.vcf.gz b.vcf.gz c.vcf.gz");
    c.bench_function("render_combine_script", |b| {
        b.iter(|| {
            JobDescriptor::new("pool_1-combine-bcftools", "/scratch/pool_1/shfiles/bcftools")
                .with_resources(Resources::new("12:00:00", "20000M").with_cpus_per_task(48))
                .with_dependency(Dependency::after_ok(ids.iter().take(50).cloned()))
                .with_command(vars.render(black_box(
                    "bcftools concat {artifacts} -O z -o {output_dir}/{pool}-bcftools_all_bedfiles.vcf.gz",
                )))
                .render()
        });
    });
}

criterion_group!(benches, descriptor_benchmark);
criterion_main!(benches);
