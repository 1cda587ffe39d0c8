#![allow(
    clippy::tests_outside_test_module,
    clippy::unwrap_used,
    reason = "benchmark"
)]

use criterion::{Criterion, criterion_group, criterion_main};
use handlebars::Handlebars;

mod utils;

fn handlebars_benchmark(c: &mut Criterion) {
    let mut handlebars = Handlebars::new();
    handlebars
        .register_template_string("profile", include_str!("template_handlebars.hbs"))
        .unwrap();

    let contexts = utils::generate_random_contexts(100);
    utils::print_binary_size();

    utils::bench_render(c, "handlebars_render", &contexts, |context| {
        handlebars.render("profile", context).unwrap()
    });
}

criterion_group!(benches, handlebars_benchmark);
criterion_main!(benches);
