//! Benchmarks for the hot paths: ready-variant resolution and result metrics.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use quant_variant_server::cache::{SharedModel, VariantCache, VariantId};
use quant_variant_server::config::Config;
use quant_variant_server::inference::coordinator::GenerationStats;
use quant_variant_server::inference::llama_ffi::{
    ChatCompletion, ChatMessage, ChatModel, ExecutionProfile, LlamaError, ModelLoader,
    SamplingParams,
};
use quant_variant_server::inference::prompt::AnalysisPayload;

struct NoopModel(PathBuf);

impl ChatModel for NoopModel {
    fn path(&self) -> &Path {
        &self.0
    }

    fn n_threads(&self) -> u32 {
        1
    }

    fn create_chat_completion(
        &self,
        _messages: &[ChatMessage],
        _params: &SamplingParams,
    ) -> Result<ChatCompletion, LlamaError> {
        Ok(ChatCompletion {
            content: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
        })
    }
}

struct NoopLoader;

impl ModelLoader for NoopLoader {
    fn load(&self, path: &Path, _profile: &ExecutionProfile) -> Result<SharedModel, LlamaError> {
        Ok(Arc::new(NoopModel(path.to_path_buf())))
    }
}

fn bench_ready_resolve(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.model.model_dir = dir.path().to_path_buf();
    let path = config.variant_path(VariantId::FourBit);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"x").unwrap();

    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = VariantCache::new(&config, Arc::new(NoopLoader));
    rt.block_on(cache.resolve("4bit")).unwrap();

    c.bench_function("resolve_ready_variant", |b| {
        b.iter(|| {
            let model = rt.block_on(cache.resolve(black_box("4bit"))).unwrap();
            black_box(model);
        })
    });
}

fn bench_generation_stats(c: &mut Criterion) {
    let text = "word ".repeat(500);

    c.bench_function("generation_stats_500_words", |b| {
        b.iter(|| {
            let stats = GenerationStats::measure(black_box(&text), Duration::from_millis(12_345));
            black_box(stats);
        })
    });
}

fn bench_prompt_render(c: &mut Criterion) {
    let payload = json!({
        "name": "ABC",
        "revenue": 1_000_000_000_000u64,
        "industry_sector": "Sản xuất",
    });

    c.bench_function("validate_and_render_prompt", |b| {
        b.iter(|| {
            let payload = AnalysisPayload::from_value(black_box(payload.clone())).unwrap();
            black_box(payload.render_prompt());
        })
    });
}

criterion_group!(
    benches,
    bench_ready_resolve,
    bench_generation_stats,
    bench_prompt_render
);
criterion_main!(benches);
