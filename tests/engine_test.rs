//! End-to-end engine tests over mock collaborators.

mod common;

use common::{engine, ByteTokenizer};
use vellum::{
    EngineConfig, Error, FinishReason, GenerationRequest, LoraRequest, SamplingParams, Tokenizer,
};

const SQL_ADAPTER: &str = "/adapters/sql-lora";
const CHAT_ADAPTER: &str = "/adapters/chat-lora";

fn lora_config() -> EngineConfig {
    EngineConfig {
        max_num_seqs: 16,
        enable_lora: true,
        max_loras: 4,
        gpu_memory_utilization: 1.0,
        ..Default::default()
    }
}

fn sql_prompt(schema: &str, question: &str) -> String {
    format!(
        "[user] Write a SQL query to answer the question based on the table schema.\n\n \
         context: {schema}\n\n question: {question} [/user] [assistant]"
    )
}

fn sql_sampling() -> SamplingParams {
    SamplingParams {
        temperature: 0.0,
        max_tokens: 256,
        stop: vec!["[/assistant]".to_string()],
        ..Default::default()
    }
}

fn sql_requests(lora: &LoraRequest) -> Vec<GenerationRequest> {
    let prompts = [
        sql_prompt(
            "CREATE TABLE table_name_74 (icao VARCHAR, airport VARCHAR)",
            "Name the ICAO for lilongwe international airport",
        ),
        sql_prompt(
            "CREATE TABLE table_name_11 (nationality VARCHAR, elector VARCHAR)",
            "When Anchero Pantaleone was the elector what is under nationality?",
        ),
        sql_prompt(
            "CREATE TABLE table_name_95 (one_mora VARCHAR, gloss VARCHAR)",
            "What is the one mora for a low tone mora with a gloss of /˩okiru/?",
        ),
        sql_prompt(
            "CREATE TABLE candidate (people_id VARCHAR, unsure_rate INTEGER)",
            "which people are most likely to be unsure?",
        ),
        sql_prompt(
            "CREATE TABLE table_name_60 (pick INTEGER, former_college VARCHAR)",
            "What is the pick for arizona state?",
        ),
        sql_prompt(
            "CREATE TABLE table_28138035_4 (womens_doubles VARCHAR, mens_singles VARCHAR)",
            "Name the women's doubles for werner schlager",
        ),
    ];
    prompts
        .iter()
        .map(|p| GenerationRequest::new(p.clone(), sql_sampling()).with_lora(lora.clone()))
        .collect()
}

#[test]
fn test_adapter_generates_sql_and_stops() {
    let mut engine = engine(lora_config(), 512, &[SQL_ADAPTER]);
    let lora = LoraRequest::new("sql", 1, SQL_ADAPTER);

    let outputs = engine
        .generate(sql_requests(&lora))
        .expect("batch completes");
    assert_eq!(outputs.len(), 6);

    // The mock adapter projects a handle-keyed column from the table
    // parsed out of each schema.
    assert_eq!(outputs[0].completions[0].text, " SELECT col_1 FROM table_name_74 ");
    assert_eq!(outputs[1].completions[0].text, " SELECT col_1 FROM table_name_11 ");
    assert_eq!(outputs[3].completions[0].text, " SELECT col_1 FROM candidate ");
    for output in &outputs {
        assert_eq!(output.completions.len(), 1);
        assert_eq!(
            output.completions[0].finish_reason,
            FinishReason::StopSequence
        );
        assert!(!output.completions[0].text.contains("[/assistant]"));
    }
}

#[test]
fn test_adapter_ids_alias_the_same_path() {
    let mut engine = engine(lora_config(), 512, &[SQL_ADAPTER]);
    let prompt = sql_prompt(
        "CREATE TABLE table_name_11 (nationality VARCHAR, elector VARCHAR)",
        "When Anchero Pantaleone was the elector what is under nationality?",
    );

    // Two distinct integer IDs, one path: identical outputs, one slot.
    let first = GenerationRequest::new(prompt.clone(), sql_sampling())
        .with_lora(LoraRequest::new("sql-1", 1, SQL_ADAPTER));
    let second = GenerationRequest::new(prompt, sql_sampling())
        .with_lora(LoraRequest::new("sql-2", 2, SQL_ADAPTER));

    let outputs = engine.generate(vec![first, second]).unwrap();
    assert_eq!(
        outputs[0].completions[0].text,
        outputs[1].completions[0].text
    );
}

#[test]
fn test_distinct_adapters_give_distinct_outputs() {
    let mut engine = engine(lora_config(), 512, &[SQL_ADAPTER, CHAT_ADAPTER]);
    let prompt = sql_prompt(
        "CREATE TABLE candidate (people_id VARCHAR, unsure_rate INTEGER)",
        "which people are most likely to be unsure?",
    );

    let sql = GenerationRequest::new(prompt.clone(), sql_sampling())
        .with_lora(LoraRequest::new("sql", 1, SQL_ADAPTER));
    let chat = GenerationRequest::new(prompt.clone(), sql_sampling())
        .with_lora(LoraRequest::new("chat", 2, CHAT_ADAPTER));
    let base = GenerationRequest::new(prompt, sql_sampling());

    let outputs = engine.generate(vec![sql, chat, base]).unwrap();
    let sql_text = &outputs[0].completions[0].text;
    let chat_text = &outputs[1].completions[0].text;
    let base_text = &outputs[2].completions[0].text;

    assert_ne!(sql_text, chat_text);
    assert_ne!(sql_text, base_text);
    // The base model never produces the stop string, so it runs to the
    // token limit.
    assert_eq!(
        outputs[2].completions[0].finish_reason,
        FinishReason::MaxTokens
    );
}

#[test]
fn test_adapter_use_does_not_leak_into_base_model() {
    let mut engine = engine(lora_config(), 512, &[SQL_ADAPTER]);
    let prompt = sql_prompt(
        "CREATE TABLE table_name_60 (pick INTEGER, former_college VARCHAR)",
        "What is the pick for arizona state?",
    );

    let base_request = || GenerationRequest::new(prompt.clone(), sql_sampling());
    let before = engine.generate(vec![base_request()]).unwrap();

    let lora = GenerationRequest::new(prompt.clone(), sql_sampling())
        .with_lora(LoraRequest::new("sql", 1, SQL_ADAPTER));
    engine.generate(vec![lora]).unwrap();

    // The resident adapter must not contaminate adapter-less requests.
    let after = engine.generate(vec![base_request()]).unwrap();
    assert_eq!(
        before[0].completions[0].text,
        after[0].completions[0].text
    );
}

#[test]
fn test_unknown_adapter_rejected_at_submission() {
    let mut engine = engine(lora_config(), 512, &[SQL_ADAPTER]);

    let err = engine
        .add_request(
            "hello",
            sql_sampling(),
            Some(LoraRequest::new("ghost", 9, "/adapters/missing")),
        )
        .unwrap_err();
    assert!(matches!(err, Error::AdapterNotFound(_)));

    // The rejection leaves the engine fully serviceable.
    let outputs = engine
        .generate(vec![GenerationRequest::new(
            sql_prompt("CREATE TABLE t (a VARCHAR)", "anything"),
            sql_sampling(),
        )
        .with_lora(LoraRequest::new("sql", 1, SQL_ADAPTER))])
        .unwrap();
    assert_eq!(outputs.len(), 1);
}

#[test]
fn test_lora_rejected_when_disabled() {
    let config = EngineConfig {
        enable_lora: false,
        gpu_memory_utilization: 1.0,
        ..Default::default()
    };
    let mut engine = engine(config, 64, &[SQL_ADAPTER]);

    let err = engine
        .add_request(
            "hello",
            SamplingParams::greedy(),
            Some(LoraRequest::new("sql", 1, SQL_ADAPTER)),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_tensor_parallel_sizes_agree() {
    let mut texts_by_world_size = Vec::new();
    for world_size in [1, 2, 4] {
        let config = EngineConfig {
            tensor_parallel_size: world_size,
            ..lora_config()
        };
        let mut engine = engine(config, 512, &[SQL_ADAPTER]);
        let lora = LoraRequest::new("sql", 1, SQL_ADAPTER);

        let outputs = engine.generate(sql_requests(&lora)).unwrap();
        let texts: Vec<String> = outputs
            .into_iter()
            .map(|o| o.completions[0].text.clone())
            .collect();
        texts_by_world_size.push(texts);
    }

    assert_eq!(texts_by_world_size[0], texts_by_world_size[1]);
    assert_eq!(texts_by_world_size[0], texts_by_world_size[2]);
}

#[test]
fn test_lora_reservation_shrinks_block_pool() {
    let without = engine(
        EngineConfig {
            enable_lora: false,
            gpu_memory_utilization: 1.0,
            ..Default::default()
        },
        64,
        &[],
    );
    let with = engine(lora_config(), 64, &[SQL_ADAPTER]);

    assert!(
        with.cache_config().num_gpu_blocks() < without.cache_config().num_gpu_blocks(),
        "enabling LoRA must reserve adapter memory out of the pool"
    );
}

#[test]
fn test_preemption_preserves_outputs() {
    let babble = |num_blocks: u64| {
        let config = EngineConfig {
            max_num_seqs: 16,
            gpu_memory_utilization: 1.0,
            ..Default::default()
        };
        let mut engine = engine(config, num_blocks, &[]);
        let sampling = SamplingParams {
            temperature: 0.0,
            max_tokens: 40,
            ..Default::default()
        };
        let requests = (0..3)
            .map(|i| {
                GenerationRequest::new(
                    format!("tell me something interesting about the number {i} please"),
                    sampling.clone(),
                )
            })
            .collect();
        engine.generate(requests).expect("batch completes")
    };

    let constrained = babble(10);
    let roomy = babble(256);
    assert_eq!(constrained.len(), 3);

    let mut preemptions = 0;
    for (tight, wide) in constrained.iter().zip(&roomy) {
        assert_eq!(tight.completions[0].finish_reason, FinishReason::MaxTokens);
        // Recomputation after preemption reproduces the exact output.
        assert_eq!(tight.completions[0].text, wide.completions[0].text);
        preemptions += tight.completions[0].preemptions;
    }
    assert!(
        preemptions > 0,
        "a 10-block pool must preempt at least once"
    );
}

#[test]
fn test_oversized_request_fails_without_blocking_others() {
    let config = EngineConfig {
        max_num_seqs: 16,
        gpu_memory_utilization: 1.0,
        ..Default::default()
    };
    let mut engine = engine(config, 8, &[]);

    let sampling = SamplingParams {
        temperature: 0.0,
        max_tokens: 8,
        ..Default::default()
    };
    let huge = GenerationRequest::new("x".repeat(8 * 16 + 1), sampling.clone());
    let small = GenerationRequest::new("a short prompt", sampling);

    let outputs = engine.generate(vec![huge, small]).unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(
        outputs[0].completions[0].finish_reason,
        FinishReason::OutOfCapacity
    );
    assert!(outputs[0].completions[0].text.is_empty());
    assert_eq!(
        outputs[1].completions[0].finish_reason,
        FinishReason::MaxTokens
    );
    assert!(!engine.is_poisoned());
}

#[test]
fn test_parallel_sampling_returns_n_completions() {
    let config = EngineConfig {
        max_num_seqs: 16,
        gpu_memory_utilization: 1.0,
        ..Default::default()
    };
    let mut engine = engine(config, 256, &[]);

    let sampling = SamplingParams {
        temperature: 0.0,
        max_tokens: 24,
        n: 2,
        ..Default::default()
    };
    let outputs = engine
        .generate(vec![GenerationRequest::new(
            "a prompt long enough to span more than one cache block here",
            sampling,
        )])
        .unwrap();

    assert_eq!(outputs[0].completions.len(), 2);
    // Greedy samples are identical; the point is that both ran over
    // shared prefix blocks without corrupting each other.
    assert_eq!(
        outputs[0].completions[0].text,
        outputs[0].completions[1].text
    );
    assert_eq!(outputs[0].completions[0].text.len(), 24);
}

#[test]
fn test_abort_surfaces_as_output() {
    let config = EngineConfig {
        max_num_seqs: 16,
        gpu_memory_utilization: 1.0,
        ..Default::default()
    };
    let mut engine = engine(config, 64, &[]);

    let request_id = engine
        .add_request("a prompt", SamplingParams::greedy(), None)
        .unwrap();
    engine.step().unwrap();
    engine.abort_request(request_id);

    let outputs = engine.step().unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].request_id, request_id);
    assert_eq!(
        outputs[0].completions[0].finish_reason,
        FinishReason::Aborted
    );
    assert!(!engine.has_unfinished_requests());
}

#[test]
fn test_byte_tokenizer_round_trip() {
    let tokenizer = ByteTokenizer;
    let text = "SELECT * FROM t";
    let ids = tokenizer.encode(text).unwrap();
    assert_eq!(tokenizer.decode(&ids).unwrap(), text);
    assert_eq!(tokenizer.eos_token_id(), 256);
}
