#![allow(
    clippy::tests_outside_test_module,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    reason = "benchmark"
)]

use criterion::{Criterion, criterion_group, criterion_main};
use orblate::{CompileMode, TemplateEngine, EngineConfig, Value};

mod utils;

const TEMPLATE: &str = include_str!("template_orblate.tmpl");

fn orblate_benchmark(c: &mut Criterion) {
    // Convert JSON contexts to orblate values once, outside the timed loop
    let contexts: Vec<Value> = utils::generate_random_contexts(100)
        .iter()
        .map(to_value)
        .collect();

    utils::print_binary_size();

    for (mode, name) in [
        (CompileMode::Compiled, "orblate_render_compiled"),
        (CompileMode::Interpreted, "orblate_render_interpreted"),
    ] {
        let mut engine = TemplateEngine::with_config(EngineConfig {
            mode,
            ..EngineConfig::default()
        });
        engine.add_template("profile", TEMPLATE).unwrap();

        utils::bench_render(c, name, &contexts, |context| {
            engine.render("profile", Some(context)).unwrap()
        });
    }
}

fn to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map_or_else(|| Value::Float(n.as_f64().unwrap_or_default()), Value::Int),
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(items) => Value::List(items.iter().map(to_value).collect()),
        serde_json::Value::Object(fields) => {
            Value::map(fields.iter().map(|(k, v)| (k.as_str(), to_value(v))))
        }
    }
}

criterion_group!(benches, orblate_benchmark);
criterion_main!(benches);
