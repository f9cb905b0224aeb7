// Benchmark schema DDL generation and expected index computation.

use std::fmt::Write;
use std::path::Path;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use cubicweb_core::schema::bootstrap::bootstrap_schema;
use cubicweb_core::schema::loader::load_schema_str;
use cubicweb_core::schema::{SQL_PREFIX, Schema};
use cubicweb_core::sql::{Dialect, expected_indexes, schema_to_sql};

fn generate_schema(types: usize) -> Schema {
    let mut text = String::new();
    for i in 0..types {
        let _ = write!(
            text,
            "[entity.Type{i}]\n\n\
             [[entity.Type{i}.attribute]]\nname = \"name\"\ntype = \"String\"\nrequired = true\nmaxsize = 64\nindexed = true\n\n\
             [[entity.Type{i}.attribute]]\nname = \"score\"\ntype = \"Int\"\nvocabulary = [1, 2, 3]\n\n\
             [relation.link_{i}]\nsubject = \"Type{i}\"\nobject = \"Type{}\"\ncardinality = \"?*\"\ninlined = {}\n\n",
            (i + 1) % types,
            i % 2 == 0,
        );
    }
    let mut schema = bootstrap_schema().unwrap();
    load_schema_str(&mut schema, &text, Path::new("bench.toml")).unwrap();
    schema
}

fn bench_schema_to_sql(c: &mut Criterion) {
    let mut group = c.benchmark_group("schema_to_sql");
    for types in [10, 100, 500] {
        let schema = generate_schema(types);
        for dialect in [Dialect::Sqlite, Dialect::Postgres] {
            group.bench_with_input(
                BenchmarkId::new(dialect.name(), types),
                &schema,
                |b, schema| {
                    b.iter(|| schema_to_sql(dialect, schema, &[], &[], SQL_PREFIX));
                },
            );
        }
    }
    group.finish();
}

fn bench_expected_indexes(c: &mut Criterion) {
    let mut group = c.benchmark_group("expected_indexes");
    for types in [10, 100, 500] {
        let schema = generate_schema(types);
        group.bench_with_input(BenchmarkId::new("types", types), &schema, |b, schema| {
            b.iter(|| expected_indexes(Dialect::Postgres, schema, SQL_PREFIX));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_schema_to_sql, bench_expected_indexes);
criterion_main!(benches);
