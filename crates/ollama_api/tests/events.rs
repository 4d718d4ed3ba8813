use ollama_api::{ChatChunk, NdjsonStreamParser, ShowResponse, TagsResponse};
use serde_json::json;

#[test]
fn chunk_exposes_content_thinking_and_tool_calls() {
    let chunk: ChatChunk = serde_json::from_value(json!({
        "model": "qwen3",
        "created_at": "2026-02-14T00:00:00Z",
        "message": {
            "role": "assistant",
            "content": "",
            "thinking": "need the clock",
            "tool_calls": [
                {"function": {"name": "current_datetime", "arguments": {}}},
                {"function": {"name": "read_file", "arguments": "{\"path\":\"a.txt\"}"}}
            ]
        },
        "done": false
    }))
    .expect("chunk should parse");

    assert_eq!(chunk.thinking(), "need the clock");
    assert_eq!(chunk.tool_calls().len(), 2);
    assert!(chunk.tool_calls()[0].function.arguments_map().is_empty());
    assert_eq!(
        chunk.tool_calls()[1].function.arguments_map()["path"],
        json!("a.txt")
    );
}

#[test]
fn final_chunk_carries_accounting() {
    let chunks = NdjsonStreamParser::parse_all(concat!(
        "{\"model\":\"m\",\"message\":{\"role\":\"assistant\",\"content\":\"hi\"},\"done\":false}\n",
        "{\"model\":\"m\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,",
        "\"done_reason\":\"stop\",\"eval_count\":150,\"prompt_eval_count\":50}"
    ));

    assert_eq!(chunks.len(), 2);
    let last = chunks[1].as_ref().expect("final chunk should parse");
    assert!(last.done);
    assert_eq!(last.done_reason.as_deref(), Some("stop"));
    assert_eq!(last.eval_count, Some(150));
    assert_eq!(last.prompt_eval_count, Some(50));
}

#[test]
fn tags_response_lists_model_names() {
    let tags: TagsResponse = serde_json::from_value(json!({
        "models": [
            {"name": "llama3.1:8b", "model": "llama3.1:8b", "size": 4920753328_u64, "details": {"family": "llama"}},
            {"name": "qwen3:4b"}
        ]
    }))
    .expect("tags should parse");

    let names: Vec<&str> = tags.models.iter().map(|tag| tag.name.as_str()).collect();
    assert_eq!(names, vec!["llama3.1:8b", "qwen3:4b"]);
}

#[test]
fn show_response_reads_architecture_context_length() {
    let show: ShowResponse = serde_json::from_value(json!({
        "model_info": {
            "general.architecture": "llama",
            "general.parameter_count": 8030261248_u64,
            "llama.context_length": 131072,
            "llama.embedding_length": 4096
        }
    }))
    .expect("show should parse");
    assert_eq!(show.context_length(), Some(131072));

    let missing: ShowResponse =
        serde_json::from_value(json!({"model_info": {"general.architecture": "bert"}}))
            .expect("show should parse");
    assert_eq!(missing.context_length(), None);
}
