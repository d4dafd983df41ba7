//! End-to-end pipeline tests: build a tiny base checkpoint and a PEFT
//! adapter on disk, run the merge, and inspect the output directory.

use approx::assert_relative_eq;
use candle_core::{DType, Device, Tensor};
use lora_merge::{run, MergeConfig};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const MINIMAL_TOKENIZER: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": null,
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {"[UNK]": 0, "hello": 1, "world": 2},
        "unk_token": "[UNK]"
    }
}"#;

fn tensor2(rows: &[&[f32]]) -> Tensor {
    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Tensor::from_slice(&flat, (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
}

/// Write a minimal base checkpoint: config.json, model.safetensors,
/// tokenizer.json, and one auxiliary tokenizer file.
fn write_base_model(dir: &Path) {
    fs::create_dir_all(dir).unwrap();

    fs::write(
        dir.join("config.json"),
        serde_json::json!({
            "model_type": "llama",
            "hidden_size": 2,
            "vocab_size": 4
        })
        .to_string(),
    )
    .unwrap();

    let mut tensors = HashMap::new();
    tensors.insert(
        "model.layers.0.self_attn.q_proj.weight".to_string(),
        tensor2(&[&[1.0, 2.0], &[3.0, 4.0]]),
    );
    tensors.insert(
        "model.embed_tokens.weight".to_string(),
        tensor2(&[&[0.1, 0.2], &[0.3, 0.4], &[0.5, 0.6], &[0.7, 0.8]]),
    );
    candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();

    fs::write(dir.join("tokenizer.json"), MINIMAL_TOKENIZER).unwrap();
    fs::write(
        dir.join("tokenizer_config.json"),
        r#"{"model_max_length": 2048}"#,
    )
    .unwrap();
}

/// Write a PEFT adapter targeting `model.layers.0.self_attn.q_proj`.
fn write_adapter(dir: &Path, b_rows: &[&[f32]]) {
    fs::create_dir_all(dir).unwrap();

    fs::write(
        dir.join("adapter_config.json"),
        serde_json::json!({
            "peft_type": "LORA",
            "r": 1,
            "lora_alpha": 2,
            "lora_dropout": 0.0,
            "target_modules": ["q_proj"],
            "task_type": "CAUSAL_LM"
        })
        .to_string(),
    )
    .unwrap();

    let mut tensors = HashMap::new();
    tensors.insert(
        "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight".to_string(),
        tensor2(&[&[1.0, 1.0]]),
    );
    tensors.insert(
        "base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight".to_string(),
        Tensor::from_slice(
            &b_rows.iter().flat_map(|r| r.iter().copied()).collect::<Vec<f32>>(),
            (b_rows.len(), b_rows[0].len()),
            &Device::Cpu,
        )
        .unwrap(),
    );
    candle_core::safetensors::save(&tensors, dir.join("adapter_model.safetensors")).unwrap();
}

fn config(base: &Path, adapter: &Path, out: &Path, dtype: DType) -> MergeConfig {
    MergeConfig {
        base: base.to_string_lossy().into_owned(),
        adapter: adapter.to_path_buf(),
        out: out.to_path_buf(),
        dtype,
        device: Device::Cpu,
    }
}

#[test]
fn merges_adapter_and_writes_standalone_model() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let out = tmp.path().join("merged");
    write_base_model(&base);
    write_adapter(&adapter, &[&[1.0], &[2.0]]);

    run(&config(&base, &adapter, &out, DType::F32)).unwrap();

    assert!(out.join("model.safetensors").is_file());
    assert!(out.join("config.json").is_file());
    assert!(out.join("tokenizer.json").is_file());
    assert!(out.join("tokenizer_config.json").is_file());

    let merged = candle_core::safetensors::load(out.join("model.safetensors"), &Device::Cpu)
        .unwrap();

    // No adapter structure survives into the output.
    assert!(merged.keys().all(|k| !k.contains("lora_")));

    // delta = (alpha/r) * B.A = 2 * [[1,1],[2,2]] => W' = [[3,4],[7,8]]
    let q = merged["model.layers.0.self_attn.q_proj.weight"]
        .to_vec2::<f32>()
        .unwrap();
    let expected = [[3.0f32, 4.0], [7.0, 8.0]];
    for (row, exp_row) in q.iter().zip(expected.iter()) {
        for (v, e) in row.iter().zip(exp_row.iter()) {
            assert_relative_eq!(*v, *e, epsilon = 1e-5);
        }
    }

    // Tensors the adapter does not touch pass through unchanged.
    let embed = merged["model.embed_tokens.weight"].to_vec2::<f32>().unwrap();
    assert_relative_eq!(embed[0][0], 0.1, epsilon = 1e-6);

    // The config is carried through.
    let out_config: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("config.json")).unwrap()).unwrap();
    assert_eq!(out_config["model_type"], "llama");
}

#[test]
fn honors_requested_dtype() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let out = tmp.path().join("merged-bf16");
    write_base_model(&base);
    write_adapter(&adapter, &[&[1.0], &[2.0]]);

    run(&config(&base, &adapter, &out, DType::BF16)).unwrap();

    let merged = candle_core::safetensors::load(out.join("model.safetensors"), &Device::Cpu)
        .unwrap();
    let q = &merged["model.layers.0.self_attn.q_proj.weight"];
    assert_eq!(q.dtype(), DType::BF16);

    // Small integers are exact in bf16.
    let values = q.to_dtype(DType::F32).unwrap().to_vec2::<f32>().unwrap();
    assert_relative_eq!(values[1][1], 8.0, epsilon = 1e-6);
}

#[test]
fn existing_output_files_are_preserved() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let out = tmp.path().join("merged");
    write_base_model(&base);
    write_adapter(&adapter, &[&[1.0], &[2.0]]);

    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("eval_results.json"), "{}").unwrap();

    run(&config(&base, &adapter, &out, DType::F32)).unwrap();

    assert!(out.join("eval_results.json").is_file());
    assert!(out.join("model.safetensors").is_file());
}

#[test]
fn shape_mismatch_aborts_before_writing() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let out = tmp.path().join("merged");
    write_base_model(&base);
    // lora_B has 3 output rows against the 2x2 base weight.
    write_adapter(&adapter, &[&[1.0], &[1.0], &[1.0]]);

    let err = run(&config(&base, &adapter, &out, DType::F32)).unwrap_err();
    assert!(matches!(err, lora_merge::Error::ShapeMismatch { .. }));
    assert!(!out.exists());
}

#[test]
fn missing_base_model_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = tmp.path().join("adapter");
    let out = tmp.path().join("merged");
    write_adapter(&adapter, &[&[1.0], &[2.0]]);

    let missing: PathBuf = tmp.path().join("no-such-model");
    let err = run(&config(&missing, &adapter, &out, DType::F32)).unwrap_err();
    assert!(matches!(err, lora_merge::Error::ModelLoad(_)));
    assert!(!out.exists());
}

#[test]
fn missing_adapter_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let out = tmp.path().join("merged");
    write_base_model(&base);

    let missing = tmp.path().join("no-such-adapter");
    let err = run(&config(&base, &missing, &out, DType::F32)).unwrap_err();
    assert!(matches!(err, lora_merge::Error::AdapterLoad(_)));
    assert!(!out.exists());
}
