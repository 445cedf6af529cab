use askforge_common::config::McpToolConfig;
use askforge_search::{HttpMcpTool, McpRequest, McpService, McpToolExecutor, McpToolRegistry};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn tool_config(endpoint: String) -> McpToolConfig {
    McpToolConfig {
        id: "orders".to_string(),
        name: "lookup_order".to_string(),
        description: "Order status lookup".to_string(),
        endpoint,
        input_schema: json!({"type": "object"}),
    }
}

#[tokio::test]
async fn http_tool_joins_text_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"name": "lookup_order", "arguments": {"order_id": "A-1"}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "content": [
                    {"type": "text", "text": "Order A-1"},
                    {"type": "image", "data": "..."},
                    {"type": "text", "text": "Status: shipped"}
                ]
            }
        })))
        .mount(&server)
        .await;

    let tool = HttpMcpTool::new(&tool_config(server.uri())).unwrap();
    let mut args = Map::new();
    args.insert("order_id".to_string(), json!("A-1"));

    let text = tool.execute(&args).await.unwrap();
    assert_eq!(text, "Order A-1\nStatus: shipped");
}

#[tokio::test]
async fn rpc_errors_and_tool_errors_fail_the_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"content": [{"type": "text", "text": "no such order"}], "isError": true}
        })))
        .mount(&server)
        .await;

    let mut registry = McpToolRegistry::new();
    registry.register(Arc::new(HttpMcpTool::new(&tool_config(server.uri())).unwrap()));
    let service = McpService::new(Arc::new(registry), Duration::from_secs(2));

    let responses = service
        .execute_batch(vec![McpRequest {
            tool_id: "orders".to_string(),
            arguments: Map::new(),
        }])
        .await;

    assert_eq!(responses.len(), 1);
    assert!(!responses[0].success);
    assert!(responses[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("no such order"));
}
