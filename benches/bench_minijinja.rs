#![allow(
    clippy::tests_outside_test_module,
    clippy::unwrap_used,
    reason = "benchmark"
)]

use criterion::{Criterion, criterion_group, criterion_main};
use minijinja::Environment;

mod utils;

fn minijinja_benchmark(c: &mut Criterion) {
    let mut env = Environment::new();
    env.add_template("profile", include_str!("template_minijinja.jinja"))
        .unwrap();
    let template = env.get_template("profile").unwrap();

    let contexts = utils::generate_random_contexts(100);
    utils::print_binary_size();

    utils::bench_render(c, "minijinja_render", &contexts, |context| {
        template.render(context).unwrap()
    });
}

criterion_group!(benches, minijinja_benchmark);
criterion_main!(benches);
